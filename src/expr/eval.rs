//! Elementwise evaluation of [`Expr`] trees over 2-D bands.
//!
//! Scalars broadcast against arrays; two arrays must have the same shape.
//! Arithmetic follows IEEE semantics (division by zero yields infinities or
//! NaN, not errors). Booleans take part in arithmetic as 0 and 1, and the
//! bitwise operators act logically on booleans and bitwise on integers.

use std::collections::HashMap;

use ndarray::{Array2, Zip};

use crate::error::ExpressionError;

use super::ast::{BinaryOp, CompareOp, Expr, Function};
use super::Budget;

/// Intermediate evaluation result.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Number(f64),
    Boolean(bool),
    Array(Array2<f64>),
    BoolArray(Array2<bool>),
}

impl Value {
    fn is_boolean(&self) -> bool {
        matches!(self, Value::Boolean(_) | Value::BoolArray(_))
    }

    fn shape(&self) -> Option<(usize, usize)> {
        match self {
            Value::Array(a) => Some(a.dim()),
            Value::BoolArray(a) => Some(a.dim()),
            _ => None,
        }
    }

    fn into_numeric(self) -> Numeric {
        match self {
            Value::Number(v) => Numeric::Scalar(v),
            Value::Boolean(b) => Numeric::Scalar(f64::from(u8::from(b))),
            Value::Array(a) => Numeric::Array(a),
            Value::BoolArray(a) => Numeric::Array(a.mapv(|b| f64::from(u8::from(b)))),
        }
    }

    fn into_logical(self) -> Logical {
        match self {
            Value::Number(v) => Logical::Scalar(v != 0.0),
            Value::Boolean(b) => Logical::Scalar(b),
            Value::Array(a) => Logical::Array(a.mapv(|v| v != 0.0)),
            Value::BoolArray(a) => Logical::Array(a),
        }
    }
}

enum Numeric {
    Scalar(f64),
    Array(Array2<f64>),
}

impl Numeric {
    fn at(&self, index: (usize, usize)) -> f64 {
        match self {
            Numeric::Scalar(v) => *v,
            Numeric::Array(a) => a[index],
        }
    }

    fn is_integral(&self) -> bool {
        let integral = |v: f64| v.is_finite() && v.fract() == 0.0;
        match self {
            Numeric::Scalar(v) => integral(*v),
            Numeric::Array(a) => a.iter().all(|v| integral(*v)),
        }
    }
}

enum Logical {
    Scalar(bool),
    Array(Array2<bool>),
}

impl Logical {
    fn at(&self, index: (usize, usize)) -> bool {
        match self {
            Logical::Scalar(b) => *b,
            Logical::Array(a) => a[index],
        }
    }
}

fn check_shapes(a: (usize, usize), b: (usize, usize)) -> Result<(), ExpressionError> {
    if a != b {
        return Err(ExpressionError::ShapeMismatch(a, b));
    }
    Ok(())
}

/// Apply `f` elementwise with scalar broadcasting.
fn zip_map<T: Copy>(
    lhs: Numeric,
    rhs: Numeric,
    scalar: impl Fn(T) -> Value,
    array: impl Fn(Array2<T>) -> Value,
    f: impl Fn(f64, f64) -> T,
) -> Result<Value, ExpressionError> {
    Ok(match (lhs, rhs) {
        (Numeric::Scalar(x), Numeric::Scalar(y)) => scalar(f(x, y)),
        (Numeric::Array(x), Numeric::Scalar(y)) => array(x.mapv(|v| f(v, y))),
        (Numeric::Scalar(x), Numeric::Array(y)) => array(y.mapv(|v| f(x, v))),
        (Numeric::Array(x), Numeric::Array(y)) => {
            check_shapes(x.dim(), y.dim())?;
            array(Zip::from(&x).and(&y).map_collect(|a, b| f(*a, *b)))
        }
    })
}

fn arithmetic(
    lhs: Value,
    rhs: Value,
    f: impl Fn(f64, f64) -> f64,
) -> Result<Value, ExpressionError> {
    zip_map(
        lhs.into_numeric(),
        rhs.into_numeric(),
        Value::Number,
        Value::Array,
        f,
    )
}

fn comparison(
    lhs: Value,
    rhs: Value,
    f: impl Fn(f64, f64) -> bool,
) -> Result<Value, ExpressionError> {
    zip_map(
        lhs.into_numeric(),
        rhs.into_numeric(),
        Value::Boolean,
        Value::BoolArray,
        f,
    )
}

fn logical(lhs: Logical, rhs: Logical, f: impl Fn(bool, bool) -> bool) -> Result<Value, ExpressionError> {
    Ok(match (lhs, rhs) {
        (Logical::Scalar(x), Logical::Scalar(y)) => Value::Boolean(f(x, y)),
        (Logical::Array(x), Logical::Scalar(y)) => Value::BoolArray(x.mapv(|v| f(v, y))),
        (Logical::Scalar(x), Logical::Array(y)) => Value::BoolArray(y.mapv(|v| f(x, v))),
        (Logical::Array(x), Logical::Array(y)) => {
            check_shapes(x.dim(), y.dim())?;
            Value::BoolArray(Zip::from(&x).and(&y).map_collect(|a, b| f(*a, *b)))
        }
    })
}

fn bitwise(op: BinaryOp, lhs: Value, rhs: Value) -> Result<Value, ExpressionError> {
    let and = op == BinaryOp::BitAnd;
    if lhs.is_boolean() && rhs.is_boolean() {
        return logical(lhs.into_logical(), rhs.into_logical(), |a, b| {
            if and {
                a && b
            } else {
                a || b
            }
        });
    }

    let (lhs, rhs) = (lhs.into_numeric(), rhs.into_numeric());
    if !lhs.is_integral() || !rhs.is_integral() {
        return Err(ExpressionError::Math(
            "bitwise operators require integer or boolean operands".to_string(),
        ));
    }
    zip_map(lhs, rhs, Value::Number, Value::Array, |a, b| {
        let (a, b) = (a as i64, b as i64);
        (if and { a & b } else { a | b }) as f64
    })
}

fn invert(value: Value) -> Result<Value, ExpressionError> {
    match value {
        Value::Boolean(b) => Ok(Value::Boolean(!b)),
        Value::BoolArray(a) => Ok(Value::BoolArray(a.mapv(|b| !b))),
        other => {
            let numeric = other.into_numeric();
            if !numeric.is_integral() {
                return Err(ExpressionError::Math(
                    "'~' requires integer or boolean operands".to_string(),
                ));
            }
            Ok(match numeric {
                Numeric::Scalar(v) => Value::Number(!(v as i64) as f64),
                Numeric::Array(a) => Value::Array(a.mapv(|v| !(v as i64) as f64)),
            })
        }
    }
}

/// Modulo with the sign of the divisor.
fn floor_mod(a: f64, b: f64) -> f64 {
    let r = a % b;
    if r != 0.0 && (r < 0.0) != (b < 0.0) {
        r + b
    } else {
        r
    }
}

/// Minimum or maximum, propagating NaN.
fn nan_min(a: f64, b: f64) -> f64 {
    if a.is_nan() || b.is_nan() {
        f64::NAN
    } else {
        a.min(b)
    }
}

fn nan_max(a: f64, b: f64) -> f64 {
    if a.is_nan() || b.is_nan() {
        f64::NAN
    } else {
        a.max(b)
    }
}

fn unary_math(value: Value, f: fn(f64) -> f64) -> Value {
    match value.into_numeric() {
        Numeric::Scalar(v) => Value::Number(f(v)),
        Numeric::Array(a) => Value::Array(a.mapv(f)),
    }
}

fn predicate(value: Value, f: fn(f64) -> bool) -> Value {
    match value.into_numeric() {
        Numeric::Scalar(v) => Value::Boolean(f(v)),
        Numeric::Array(a) => Value::BoolArray(a.mapv(f)),
    }
}

/// `where(cond, a, b)` with broadcasting over all three arguments.
fn select(cond: Value, a: Value, b: Value) -> Result<Value, ExpressionError> {
    let mut shape: Option<(usize, usize)> = None;
    for s in [cond.shape(), a.shape(), b.shape()].into_iter().flatten() {
        match shape {
            None => shape = Some(s),
            Some(first) => check_shapes(first, s)?,
        }
    }

    let (cond, a, b) = (cond.into_logical(), a.into_numeric(), b.into_numeric());
    Ok(match shape {
        None => Value::Number(if cond.at((0, 0)) { a.at((0, 0)) } else { b.at((0, 0)) }),
        Some(shape) => Value::Array(Array2::from_shape_fn(shape, |index| {
            if cond.at(index) {
                a.at(index)
            } else {
                b.at(index)
            }
        })),
    })
}

fn call(function: Function, mut args: Vec<Value>) -> Result<Value, ExpressionError> {
    if args.len() != function.arity() {
        return Err(ExpressionError::Arity {
            function: function.name().to_string(),
            expected: function.arity(),
            actual: args.len(),
        });
    }
    let mut next = || args.remove(0);

    Ok(match function {
        Function::Abs => unary_math(next(), f64::abs),
        Function::Sqrt => unary_math(next(), f64::sqrt),
        Function::Exp => unary_math(next(), f64::exp),
        Function::Log => unary_math(next(), f64::ln),
        Function::Log10 => unary_math(next(), f64::log10),
        Function::Sin => unary_math(next(), f64::sin),
        Function::Cos => unary_math(next(), f64::cos),
        Function::Tan => unary_math(next(), f64::tan),
        Function::Arcsin => unary_math(next(), f64::asin),
        Function::Arccos => unary_math(next(), f64::acos),
        Function::Arctan => unary_math(next(), f64::atan),
        Function::IsNan => predicate(next(), f64::is_nan),
        Function::IsFinite => predicate(next(), f64::is_finite),
        Function::Arctan2 => {
            let (y, x) = (next(), next());
            arithmetic(y, x, f64::atan2)?
        }
        Function::Minimum => {
            let (a, b) = (next(), next());
            arithmetic(a, b, nan_min)?
        }
        Function::Maximum => {
            let (a, b) = (next(), next());
            arithmetic(a, b, nan_max)?
        }
        Function::Mod => {
            let (a, b) = (next(), next());
            arithmetic(a, b, floor_mod)?
        }
        Function::Where => {
            let (cond, a, b) = (next(), next(), next());
            select(cond, a, b)?
        }
    })
}

/// Evaluate `expr` against named operand bands.
pub fn evaluate(
    expr: &Expr,
    operands: &HashMap<String, Array2<f64>>,
    budget: &Budget,
) -> Result<Value, ExpressionError> {
    budget.check()?;

    match expr {
        Expr::Literal(v) => Ok(Value::Number(*v)),
        Expr::Operand(name) => operands
            .get(name)
            .map(|a| Value::Array(a.clone()))
            .ok_or_else(|| ExpressionError::UnknownName(name.clone())),
        Expr::Invert(operand) => invert(evaluate(operand, operands, budget)?),
        Expr::Binary { op, lhs, rhs } => {
            let lhs = evaluate(lhs, operands, budget)?;
            let rhs = evaluate(rhs, operands, budget)?;
            match op {
                BinaryOp::Add => arithmetic(lhs, rhs, |a, b| a + b),
                BinaryOp::Sub => arithmetic(lhs, rhs, |a, b| a - b),
                BinaryOp::Mul => arithmetic(lhs, rhs, |a, b| a * b),
                BinaryOp::Div => arithmetic(lhs, rhs, |a, b| a / b),
                BinaryOp::Mod => arithmetic(lhs, rhs, floor_mod),
                BinaryOp::Pow => arithmetic(lhs, rhs, f64::powf),
                BinaryOp::BitAnd | BinaryOp::BitOr => bitwise(*op, lhs, rhs),
            }
        }
        Expr::Compare { op, lhs, rhs } => {
            let lhs = evaluate(lhs, operands, budget)?;
            let rhs = evaluate(rhs, operands, budget)?;
            match op {
                CompareOp::Lt => comparison(lhs, rhs, |a, b| a < b),
                CompareOp::Le => comparison(lhs, rhs, |a, b| a <= b),
                CompareOp::Gt => comparison(lhs, rhs, |a, b| a > b),
                CompareOp::Ge => comparison(lhs, rhs, |a, b| a >= b),
                CompareOp::Eq => comparison(lhs, rhs, |a, b| a == b),
                CompareOp::Ne => comparison(lhs, rhs, |a, b| a != b),
            }
        }
        Expr::Call { function, args } => {
            let args = args
                .iter()
                .map(|a| evaluate(a, operands, budget))
                .collect::<Result<Vec<_>, _>>()?;
            call(*function, args)
        }
    }
}
