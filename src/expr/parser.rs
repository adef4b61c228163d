//! Recursive-descent parser producing a generic syntax tree.
//!
//! The parser understands a Python-like expression language, including
//! constructs the evaluator never runs (attribute access, subscripts,
//! collections, lambdas, conditionals, assignment, several statements).
//! Recognising them here lets [`super::ast`] reject each one by name.
//!
//! Operator precedence, lowest first:
//!
//! ```text
//! lambda        lambda a, b: expr
//! conditional   a if c else b
//! or / and / not
//! comparison    < <= > >= == != in is (chainable)
//! |  ^  &  << >>
//! + -
//! * / // % @
//! unary         - + ~
//! power         **   (right associative, binds tighter than a left unary)
//! postfix       call(...), subscript[...], attribute.name
//! ```

use crate::error::ExpressionError;

use super::lexer::{tokenize, Spanned, Token};

/// Default limit on parser recursion.
pub const DEFAULT_MAX_DEPTH: usize = 64;

/// Default limit on syntax tree nodes.
pub const DEFAULT_MAX_NODES: usize = 512;

const STATEMENT_KEYWORDS: &[&str] = &[
    "def", "class", "import", "from", "return", "while", "for", "with", "try", "except",
    "finally", "raise", "del", "global", "nonlocal", "yield", "assert", "pass", "break",
    "continue", "async", "await", "elif",
];

fn is_statement_keyword(name: &str) -> bool {
    STATEMENT_KEYWORDS.iter().any(|k| *k == name)
}

static END: Token = Token::End;

const CONSTANT_KEYWORDS: &[&str] = &["True", "False", "None"];

/// Collection literal kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionKind {
    Tuple,
    List,
    Set,
    Dict,
}

/// Generic syntax tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Syntax {
    Number(f64),
    Name(String),
    Str(String),
    /// `True`, `False` or `None`
    Constant(&'static str),
    Unary {
        op: &'static str,
        operand: Box<Syntax>,
    },
    Binary {
        op: &'static str,
        lhs: Box<Syntax>,
        rhs: Box<Syntax>,
    },
    BoolOp {
        op: &'static str,
        values: Vec<Syntax>,
    },
    Compare {
        first: Box<Syntax>,
        rest: Vec<(&'static str, Syntax)>,
    },
    Call {
        func: Box<Syntax>,
        args: Vec<Syntax>,
        keywords: Vec<(String, Syntax)>,
    },
    Attribute {
        value: Box<Syntax>,
        attr: String,
    },
    Subscript {
        value: Box<Syntax>,
        index: Box<Syntax>,
    },
    Collection {
        kind: CollectionKind,
        items: Vec<Syntax>,
    },
    Comprehension {
        kind: CollectionKind,
        element: Box<Syntax>,
    },
    Conditional {
        body: Box<Syntax>,
        test: Box<Syntax>,
        orelse: Box<Syntax>,
    },
    Lambda {
        params: Vec<String>,
        body: Box<Syntax>,
    },
    Assign {
        target: Box<Syntax>,
        value: Box<Syntax>,
    },
    /// Several statements
    Module(Vec<Syntax>),
}

/// Parse `source` into a syntax tree.
pub fn parse(source: &str, max_depth: usize, max_nodes: usize) -> Result<Syntax, ExpressionError> {
    let tokens = tokenize(source)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        depth: 0,
        nodes: 0,
        max_depth,
        max_nodes,
    };
    parser.parse_module()
}

/// Positional and keyword arguments of a call.
type CallArgs = (Vec<Syntax>, Vec<(String, Syntax)>);

struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
    depth: usize,
    nodes: usize,
    max_depth: usize,
    max_nodes: usize,
}

impl Parser {
    // -------------------------------------------------------------------------
    // Token helpers
    // -------------------------------------------------------------------------

    fn peek(&self) -> &Token {
        self.tokens
            .get(self.pos)
            .map(|s| &s.token)
            .unwrap_or(&END)
    }

    fn position(&self) -> usize {
        self.tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map(|s| s.position)
            .unwrap_or(0)
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        token
    }

    fn at_punct(&self, punct: &str) -> bool {
        matches!(self.peek(), Token::Punct(p) if *p == punct)
    }

    fn at_keyword(&self, keyword: &str) -> bool {
        matches!(self.peek(), Token::Ident(name) if name == keyword)
    }

    fn eat_punct(&mut self, punct: &str) -> bool {
        if self.at_punct(punct) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        if self.at_keyword(keyword) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_punct(&mut self, punct: &str) -> Result<(), ExpressionError> {
        if self.eat_punct(punct) {
            Ok(())
        } else {
            Err(self.error(format!("expected '{}'", punct)))
        }
    }

    fn error(&self, message: impl Into<String>) -> ExpressionError {
        ExpressionError::Parse {
            position: self.position(),
            message: message.into(),
        }
    }

    /// Count a new node against the size limit.
    fn node(&mut self, syntax: Syntax) -> Result<Syntax, ExpressionError> {
        self.nodes += 1;
        if self.nodes > self.max_nodes {
            return Err(ExpressionError::TooComplex(format!(
                "more than {} syntax nodes",
                self.max_nodes
            )));
        }
        Ok(syntax)
    }

    fn enter(&mut self) -> Result<(), ExpressionError> {
        self.depth += 1;
        if self.depth > self.max_depth {
            return Err(ExpressionError::TooComplex(format!(
                "nesting deeper than {}",
                self.max_depth
            )));
        }
        Ok(())
    }

    fn leave(&mut self) {
        self.depth = self.depth.saturating_sub(1);
    }

    // -------------------------------------------------------------------------
    // Statements
    // -------------------------------------------------------------------------

    fn parse_module(&mut self) -> Result<Syntax, ExpressionError> {
        let mut statements = Vec::new();
        loop {
            while matches!(self.peek(), Token::Separator) {
                self.advance();
            }
            if matches!(self.peek(), Token::End) {
                break;
            }
            statements.push(self.parse_statement()?);
            match self.peek() {
                Token::Separator | Token::End => {}
                _ => return Err(self.error("unexpected token after expression")),
            }
        }

        match statements.len() {
            0 => Err(self.error("empty expression")),
            1 => Ok(statements.remove(0)),
            _ => self.node(Syntax::Module(statements)),
        }
    }

    fn parse_statement(&mut self) -> Result<Syntax, ExpressionError> {
        if let Token::Ident(name) = self.peek() {
            if is_statement_keyword(name) {
                return Err(ExpressionError::Disallowed(format!("'{}' statement", name)));
            }
        }
        let target = self.parse_expr()?;
        if self.eat_punct("=") {
            let value = self.parse_expr()?;
            return self.node(Syntax::Assign {
                target: Box::new(target),
                value: Box::new(value),
            });
        }
        Ok(target)
    }

    // -------------------------------------------------------------------------
    // Expressions
    // -------------------------------------------------------------------------

    fn parse_expr(&mut self) -> Result<Syntax, ExpressionError> {
        self.enter()?;
        let result = if self.eat_keyword("lambda") {
            self.parse_lambda()
        } else {
            self.parse_conditional()
        };
        self.leave();
        result
    }

    fn parse_lambda(&mut self) -> Result<Syntax, ExpressionError> {
        let mut params = Vec::new();
        while let Token::Ident(name) = self.peek().clone() {
            self.advance();
            params.push(name);
            if !self.eat_punct(",") {
                break;
            }
        }
        self.expect_punct(":")?;
        let body = self.parse_expr()?;
        self.node(Syntax::Lambda {
            params,
            body: Box::new(body),
        })
    }

    fn parse_conditional(&mut self) -> Result<Syntax, ExpressionError> {
        let body = self.parse_or()?;
        if !self.eat_keyword("if") {
            return Ok(body);
        }
        let test = self.parse_or()?;
        if !self.eat_keyword("else") {
            return Err(self.error("expected 'else'"));
        }
        let orelse = self.parse_expr()?;
        self.node(Syntax::Conditional {
            body: Box::new(body),
            test: Box::new(test),
            orelse: Box::new(orelse),
        })
    }

    fn parse_or(&mut self) -> Result<Syntax, ExpressionError> {
        let first = self.parse_and()?;
        if !self.at_keyword("or") {
            return Ok(first);
        }
        let mut values = vec![first];
        while self.eat_keyword("or") {
            values.push(self.parse_and()?);
        }
        self.node(Syntax::BoolOp { op: "or", values })
    }

    fn parse_and(&mut self) -> Result<Syntax, ExpressionError> {
        let first = self.parse_not()?;
        if !self.at_keyword("and") {
            return Ok(first);
        }
        let mut values = vec![first];
        while self.eat_keyword("and") {
            values.push(self.parse_not()?);
        }
        self.node(Syntax::BoolOp { op: "and", values })
    }

    fn parse_not(&mut self) -> Result<Syntax, ExpressionError> {
        if self.eat_keyword("not") {
            self.enter()?;
            let operand = self.parse_not();
            self.leave();
            return self.node(Syntax::Unary {
                op: "not",
                operand: Box::new(operand?),
            });
        }
        self.parse_comparison()
    }

    fn comparison_op(&mut self) -> Option<&'static str> {
        let op = match self.peek().clone() {
            Token::Punct(p @ ("<" | "<=" | ">" | ">=" | "==" | "!=")) => p,
            Token::Ident(name) if name == "in" => "in",
            Token::Ident(name) if name == "is" => {
                self.advance();
                return Some(if self.eat_keyword("not") { "is not" } else { "is" });
            }
            Token::Ident(name) if name == "not" => {
                let next = self.tokens.get(self.pos + 1).map(|s| &s.token);
                if !matches!(next, Some(Token::Ident(n)) if n == "in") {
                    return None;
                }
                self.pos += 2;
                return Some("not in");
            }
            _ => return None,
        };
        self.advance();
        Some(op)
    }

    fn parse_comparison(&mut self) -> Result<Syntax, ExpressionError> {
        let first = self.parse_binary(0)?;
        let mut rest = Vec::new();
        while let Some(op) = self.comparison_op() {
            rest.push((op, self.parse_binary(0)?));
        }
        if rest.is_empty() {
            return Ok(first);
        }
        self.node(Syntax::Compare {
            first: Box::new(first),
            rest,
        })
    }

    /// Left-associative binary levels, loosest first.
    const BINARY_LEVELS: &'static [&'static [&'static str]] = &[
        &["|"],
        &["^"],
        &["&"],
        &["<<", ">>"],
        &["+", "-"],
        &["*", "/", "//", "%", "@"],
    ];

    fn parse_binary(&mut self, level: usize) -> Result<Syntax, ExpressionError> {
        let Some(ops) = Self::BINARY_LEVELS.get(level) else {
            return self.parse_unary();
        };
        let mut lhs = self.parse_binary(level + 1)?;
        loop {
            let op = match self.peek() {
                Token::Punct(p) if ops.contains(p) => *p,
                _ => break,
            };
            self.advance();
            let rhs = self.parse_binary(level + 1)?;
            lhs = self.node(Syntax::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            })?;
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Syntax, ExpressionError> {
        let op = match self.peek() {
            Token::Punct(p @ ("-" | "+" | "~")) => *p,
            _ => return self.parse_power(),
        };
        self.advance();
        self.enter()?;
        let operand = self.parse_unary();
        self.leave();
        self.node(Syntax::Unary {
            op,
            operand: Box::new(operand?),
        })
    }

    fn parse_power(&mut self) -> Result<Syntax, ExpressionError> {
        let base = self.parse_postfix()?;
        if !self.eat_punct("**") {
            return Ok(base);
        }
        self.enter()?;
        let exponent = self.parse_unary();
        self.leave();
        self.node(Syntax::Binary {
            op: "**",
            lhs: Box::new(base),
            rhs: Box::new(exponent?),
        })
    }

    fn parse_postfix(&mut self) -> Result<Syntax, ExpressionError> {
        let mut value = self.parse_atom()?;
        loop {
            if self.eat_punct("(") {
                let (args, keywords) = self.parse_call_args()?;
                value = self.node(Syntax::Call {
                    func: Box::new(value),
                    args,
                    keywords,
                })?;
            } else if self.eat_punct("[") {
                let index = self.parse_expr()?;
                self.expect_punct("]")?;
                value = self.node(Syntax::Subscript {
                    value: Box::new(value),
                    index: Box::new(index),
                })?;
            } else if self.eat_punct(".") {
                let Token::Ident(attr) = self.advance() else {
                    return Err(self.error("expected attribute name"));
                };
                value = self.node(Syntax::Attribute {
                    value: Box::new(value),
                    attr,
                })?;
            } else {
                return Ok(value);
            }
        }
    }

    fn parse_call_args(&mut self) -> Result<CallArgs, ExpressionError> {
        let mut args = Vec::new();
        let mut keywords = Vec::new();
        while !self.eat_punct(")") {
            let keyword = match (self.peek().clone(), self.tokens.get(self.pos + 1)) {
                (Token::Ident(name), Some(next)) if next.token == Token::Punct("=") => Some(name),
                _ => None,
            };
            match keyword {
                Some(name) => {
                    self.pos += 2;
                    keywords.push((name, self.parse_expr()?));
                }
                None => args.push(self.parse_expr()?),
            }
            if !self.eat_punct(",") {
                self.expect_punct(")")?;
                break;
            }
        }
        Ok((args, keywords))
    }

    fn parse_atom(&mut self) -> Result<Syntax, ExpressionError> {
        let position = self.position();
        match self.advance() {
            Token::Number(value) => self.node(Syntax::Number(value)),
            Token::Str(text) => self.node(Syntax::Str(text)),
            Token::Ident(name) => {
                if let Some(constant) = CONSTANT_KEYWORDS.iter().find(|k| **k == name) {
                    return self.node(Syntax::Constant(*constant));
                }
                if is_statement_keyword(&name) {
                    return Err(ExpressionError::Disallowed(format!("'{}' keyword", name)));
                }
                self.node(Syntax::Name(name))
            }
            Token::Punct("(") => self.parse_enclosed(CollectionKind::Tuple, ")"),
            Token::Punct("[") => self.parse_enclosed(CollectionKind::List, "]"),
            Token::Punct("{") => self.parse_enclosed(CollectionKind::Set, "}"),
            Token::End => Err(ExpressionError::Parse {
                position,
                message: "unexpected end of expression".to_string(),
            }),
            other => Err(ExpressionError::Parse {
                position,
                message: format!("unexpected token {:?}", other),
            }),
        }
    }

    /// Parenthesised expression, tuple, list, set, dict or comprehension.
    fn parse_enclosed(
        &mut self,
        kind: CollectionKind,
        close: &str,
    ) -> Result<Syntax, ExpressionError> {
        self.enter()?;
        let result = self.parse_enclosed_inner(kind, close);
        self.leave();
        result
    }

    fn parse_enclosed_inner(
        &mut self,
        mut kind: CollectionKind,
        close: &str,
    ) -> Result<Syntax, ExpressionError> {
        if self.eat_punct(close) {
            let kind = if kind == CollectionKind::Set {
                CollectionKind::Dict
            } else {
                kind
            };
            return self.node(Syntax::Collection {
                kind,
                items: Vec::new(),
            });
        }

        let first = self.parse_expr()?;

        if self.at_keyword("for") {
            // Skip the comprehension clauses; the element is enough to reject it
            let mut nesting = 0usize;
            loop {
                match self.advance() {
                    Token::End => return Err(self.error(format!("expected '{}'", close))),
                    Token::Punct(p) if nesting == 0 && p == close => break,
                    Token::Punct("(" | "[" | "{") => nesting += 1,
                    Token::Punct(")" | "]" | "}") => nesting = nesting.saturating_sub(1),
                    _ => {}
                }
            }
            return self.node(Syntax::Comprehension {
                kind,
                element: Box::new(first),
            });
        }

        let mut items = vec![first];
        let mut trailing_comma = false;
        loop {
            if self.eat_punct(":") {
                kind = CollectionKind::Dict;
                items.push(self.parse_expr()?);
            }
            if self.eat_punct(",") {
                trailing_comma = true;
                if self.at_punct(close) {
                    break;
                }
                items.push(self.parse_expr()?);
                continue;
            }
            break;
        }
        self.expect_punct(close)?;

        if kind == CollectionKind::Tuple && items.len() == 1 && !trailing_comma {
            return Ok(items.remove(0));
        }
        self.node(Syntax::Collection { kind, items })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_default(source: &str) -> Result<Syntax, ExpressionError> {
        parse(source, DEFAULT_MAX_DEPTH, DEFAULT_MAX_NODES)
    }

    fn name(n: &str) -> Box<Syntax> {
        Box::new(Syntax::Name(n.to_string()))
    }

    #[test]
    fn test_precedence() {
        let tree = parse_default("a + b * c").unwrap();
        assert_eq!(
            tree,
            Syntax::Binary {
                op: "+",
                lhs: name("a"),
                rhs: Box::new(Syntax::Binary {
                    op: "*",
                    lhs: name("b"),
                    rhs: name("c"),
                }),
            }
        );
    }

    #[test]
    fn test_power_binds_tighter_than_unary() {
        let tree = parse_default("-a ** 2").unwrap();
        assert!(matches!(tree, Syntax::Unary { op: "-", .. }));
    }

    #[test]
    fn test_parentheses_and_tuples() {
        assert_eq!(parse_default("(a)").unwrap(), Syntax::Name("a".into()));
        assert!(matches!(
            parse_default("(a,)").unwrap(),
            Syntax::Collection {
                kind: CollectionKind::Tuple,
                ..
            }
        ));
        assert!(matches!(
            parse_default("{1: 2}").unwrap(),
            Syntax::Collection {
                kind: CollectionKind::Dict,
                ..
            }
        ));
    }

    #[test]
    fn test_chained_comparison() {
        let tree = parse_default("a < b < c").unwrap();
        match tree {
            Syntax::Compare { rest, .. } => assert_eq!(rest.len(), 2),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_postfix_forms() {
        assert!(matches!(
            parse_default("v1.mean").unwrap(),
            Syntax::Attribute { .. }
        ));
        assert!(matches!(
            parse_default("v1[0]").unwrap(),
            Syntax::Subscript { .. }
        ));
        assert!(matches!(
            parse_default("f(a, k=2)").unwrap(),
            Syntax::Call { ref keywords, .. } if keywords.len() == 1
        ));
    }

    #[test]
    fn test_statements() {
        assert!(matches!(
            parse_default("a; b").unwrap(),
            Syntax::Module(ref s) if s.len() == 2
        ));
        assert!(matches!(
            parse_default("x = 1").unwrap(),
            Syntax::Assign { .. }
        ));
        assert!(matches!(
            parse_default("import os"),
            Err(ExpressionError::Disallowed(_))
        ));
    }

    #[test]
    fn test_comprehension_and_lambda() {
        assert!(matches!(
            parse_default("[x for x in v1]").unwrap(),
            Syntax::Comprehension { .. }
        ));
        assert!(matches!(
            parse_default("lambda x: x").unwrap(),
            Syntax::Lambda { .. }
        ));
        assert!(matches!(
            parse_default("a if b else c").unwrap(),
            Syntax::Conditional { .. }
        ));
    }

    #[test]
    fn test_limits() {
        let deep = format!("{}a{}", "(".repeat(100), ")".repeat(100));
        assert!(matches!(
            parse_default(&deep),
            Err(ExpressionError::TooComplex(_))
        ));

        let long = vec!["a"; 1000].join(" + ");
        assert!(matches!(
            parse_default(&long),
            Err(ExpressionError::TooComplex(_))
        ));
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(parse_default(""), Err(ExpressionError::Parse { .. })));
        assert!(matches!(parse_default("a +"), Err(ExpressionError::Parse { .. })));
        assert!(matches!(parse_default("(a"), Err(ExpressionError::Parse { .. })));
        assert!(matches!(parse_default("a b"), Err(ExpressionError::Parse { .. })));
    }
}
