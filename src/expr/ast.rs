//! The closed expression grammar.
//!
//! [`Expr`] is the only tree the evaluator accepts. [`lower`] converts a
//! generic [`Syntax`] tree into it, matching every syntax kind explicitly so
//! that a construct without a lowering rule can never reach evaluation.
//! Names and functions are resolved here, so unknown identifiers and wrong
//! arities fail before any array is touched.

use std::collections::BTreeSet;
use std::f64::consts::{E, PI};

use crate::error::ExpressionError;

use super::parser::{CollectionKind, Syntax};
use super::Budget;

// =============================================================================
// Grammar
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    BitAnd,
    BitOr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

/// Whitelisted elementwise functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Function {
    Abs,
    Sqrt,
    Exp,
    Log,
    Log10,
    Sin,
    Cos,
    Tan,
    Arcsin,
    Arccos,
    Arctan,
    Arctan2,
    Minimum,
    Maximum,
    Where,
    Mod,
    IsNan,
    IsFinite,
}

impl Function {
    const ALL: [Function; 18] = [
        Function::Abs,
        Function::Sqrt,
        Function::Exp,
        Function::Log,
        Function::Log10,
        Function::Sin,
        Function::Cos,
        Function::Tan,
        Function::Arcsin,
        Function::Arccos,
        Function::Arctan,
        Function::Arctan2,
        Function::Minimum,
        Function::Maximum,
        Function::Where,
        Function::Mod,
        Function::IsNan,
        Function::IsFinite,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Function::Abs => "abs",
            Function::Sqrt => "sqrt",
            Function::Exp => "exp",
            Function::Log => "log",
            Function::Log10 => "log10",
            Function::Sin => "sin",
            Function::Cos => "cos",
            Function::Tan => "tan",
            Function::Arcsin => "arcsin",
            Function::Arccos => "arccos",
            Function::Arctan => "arctan",
            Function::Arctan2 => "arctan2",
            Function::Minimum => "minimum",
            Function::Maximum => "maximum",
            Function::Where => "where",
            Function::Mod => "mod",
            Function::IsNan => "isnan",
            Function::IsFinite => "isfinite",
        }
    }

    pub fn arity(self) -> usize {
        match self {
            Function::Arctan2 | Function::Minimum | Function::Maximum | Function::Mod => 2,
            Function::Where => 3,
            _ => 1,
        }
    }

    pub fn from_name(name: &str) -> Option<Function> {
        Self::ALL.into_iter().find(|f| f.name() == name)
    }
}

/// Named constants available to every expression.
pub const CONSTANTS: &[(&str, f64)] = &[("pi", PI), ("e", E), ("nan", f64::NAN), ("inf", f64::INFINITY)];

/// A validated band-math expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(f64),
    Operand(String),
    /// Bitwise or logical not (`~`)
    Invert(Box<Expr>),
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Compare {
        op: CompareOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Call {
        function: Function,
        args: Vec<Expr>,
    },
}

impl Expr {
    /// Names of the operands the expression reads.
    pub fn operands(&self) -> BTreeSet<&str> {
        let mut names = BTreeSet::new();
        self.collect_operands(&mut names);
        names
    }

    fn collect_operands<'a>(&'a self, names: &mut BTreeSet<&'a str>) {
        match self {
            Expr::Literal(_) => {}
            Expr::Operand(name) => {
                names.insert(name.as_str());
            }
            Expr::Invert(operand) => operand.collect_operands(names),
            Expr::Binary { lhs, rhs, .. } | Expr::Compare { lhs, rhs, .. } => {
                lhs.collect_operands(names);
                rhs.collect_operands(names);
            }
            Expr::Call { args, .. } => args.iter().for_each(|a| a.collect_operands(names)),
        }
    }
}

// =============================================================================
// Lowering
// =============================================================================

fn disallowed(what: &str) -> ExpressionError {
    ExpressionError::Disallowed(what.to_string())
}

fn collection_name(kind: CollectionKind) -> &'static str {
    match kind {
        CollectionKind::Tuple => "tuple literal",
        CollectionKind::List => "list literal",
        CollectionKind::Set => "set literal",
        CollectionKind::Dict => "dict literal",
    }
}

/// Convert a syntax tree into an [`Expr`], resolving identifiers against
/// `is_operand` and the constant table.
pub fn lower(
    syntax: &Syntax,
    is_operand: &dyn Fn(&str) -> bool,
    budget: &Budget,
) -> Result<Expr, ExpressionError> {
    budget.check()?;

    match syntax {
        Syntax::Number(value) => Ok(Expr::Literal(*value)),

        Syntax::Name(name) => {
            if is_operand(name) {
                return Ok(Expr::Operand(name.clone()));
            }
            CONSTANTS
                .iter()
                .find(|(constant, _)| *constant == name.as_str())
                .map(|(_, value)| Expr::Literal(*value))
                .ok_or_else(|| ExpressionError::UnknownName(name.clone()))
        }

        Syntax::Unary { op: "~", operand } => {
            Ok(Expr::Invert(Box::new(lower(operand, is_operand, budget)?)))
        }
        // Negative literals are the only other unary form
        Syntax::Unary { op: "-", operand } => match operand.as_ref() {
            Syntax::Number(value) => Ok(Expr::Literal(-value)),
            _ => Err(disallowed("unary operator '-' on a non-literal")),
        },
        Syntax::Unary { op, .. } => Err(ExpressionError::Disallowed(format!(
            "unary operator '{}'",
            op
        ))),

        Syntax::Binary { op, lhs, rhs } => {
            let op = match *op {
                "+" => BinaryOp::Add,
                "-" => BinaryOp::Sub,
                "*" => BinaryOp::Mul,
                "/" => BinaryOp::Div,
                "%" => BinaryOp::Mod,
                "**" => BinaryOp::Pow,
                "&" => BinaryOp::BitAnd,
                "|" => BinaryOp::BitOr,
                other => {
                    return Err(ExpressionError::Disallowed(format!(
                        "binary operator '{}'",
                        other
                    )))
                }
            };
            Ok(Expr::Binary {
                op,
                lhs: Box::new(lower(lhs, is_operand, budget)?),
                rhs: Box::new(lower(rhs, is_operand, budget)?),
            })
        }

        Syntax::Compare { first, rest } => {
            let [(op, rhs)] = rest.as_slice() else {
                return Err(disallowed("chained comparison"));
            };
            let op = match *op {
                "<" => CompareOp::Lt,
                "<=" => CompareOp::Le,
                ">" => CompareOp::Gt,
                ">=" => CompareOp::Ge,
                "==" => CompareOp::Eq,
                "!=" => CompareOp::Ne,
                other => {
                    return Err(ExpressionError::Disallowed(format!(
                        "comparison operator '{}'",
                        other
                    )))
                }
            };
            Ok(Expr::Compare {
                op,
                lhs: Box::new(lower(first, is_operand, budget)?),
                rhs: Box::new(lower(rhs, is_operand, budget)?),
            })
        }

        Syntax::Call {
            func,
            args,
            keywords,
        } => {
            let Syntax::Name(name) = func.as_ref() else {
                return Err(disallowed("call of a non-name expression"));
            };
            let function = Function::from_name(name)
                .ok_or_else(|| ExpressionError::UnknownFunction(name.clone()))?;
            if !keywords.is_empty() {
                return Err(disallowed("keyword arguments"));
            }
            if args.len() != function.arity() {
                return Err(ExpressionError::Arity {
                    function: function.name().to_string(),
                    expected: function.arity(),
                    actual: args.len(),
                });
            }
            let args = args
                .iter()
                .map(|a| lower(a, is_operand, budget))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Expr::Call { function, args })
        }

        Syntax::Str(_) => Err(disallowed("string literal")),
        Syntax::Constant(name) => Err(ExpressionError::Disallowed(format!(
            "constant '{}'",
            name
        ))),
        Syntax::BoolOp { op, .. } => Err(ExpressionError::Disallowed(format!(
            "boolean operator '{}'",
            op
        ))),
        Syntax::Attribute { attr, .. } => Err(ExpressionError::Disallowed(format!(
            "attribute access '.{}'",
            attr
        ))),
        Syntax::Subscript { .. } => Err(disallowed("subscript")),
        Syntax::Collection { kind, .. } => Err(disallowed(collection_name(*kind))),
        Syntax::Comprehension { .. } => Err(disallowed("comprehension")),
        Syntax::Conditional { .. } => Err(disallowed("conditional expression")),
        Syntax::Lambda { .. } => Err(disallowed("lambda")),
        Syntax::Assign { .. } => Err(disallowed("assignment")),
        Syntax::Module(_) => Err(disallowed("multiple statements")),
    }
}
