//! Interpreter of the simple expression language over debugee values.
use crate::debugger::backend::{Backend, FrameId};
use crate::debugger::expression::parser::{BinaryOp, Expr, UnaryOp};
use crate::debugger::variable::{Formatter, Primitive, TypedValue};
use crate::debugger::Error;
use std::cmp::Ordering;

/// Result of a simple expression.
#[derive(Clone, Debug)]
pub enum SimpleValue {
    Native(TypedValue),
    Int(i128),
    Float(f64),
    Bool(bool),
    Str(String),
}

/// Value reduced to something operators can work with.
#[derive(Clone, Debug, PartialEq)]
enum Scalar {
    Int(i128),
    Float(f64),
    Bool(bool),
    Str(String),
}

pub struct SimpleEvaluator<'a> {
    backend: &'a dyn Backend,
    formatter: &'a Formatter<'a>,
    frame: Option<FrameId>,
}

impl<'a> SimpleEvaluator<'a> {
    pub fn new(backend: &'a dyn Backend, formatter: &'a Formatter<'a>, frame: Option<FrameId>) -> Self {
        Self {
            backend,
            formatter,
            frame,
        }
    }

    pub fn evaluate(&self, expr: &Expr) -> Result<SimpleValue, Error> {
        Ok(match expr {
            Expr::Ident(name) => SimpleValue::Native(self.variable(name)?),
            Expr::Int(i) => SimpleValue::Int(*i),
            Expr::Float(f) => SimpleValue::Float(*f),
            Expr::Str(s) => SimpleValue::Str(s.clone()),
            Expr::Bool(b) => SimpleValue::Bool(*b),
            Expr::Field(lhs, field) => {
                let value = self.native(lhs)?;
                SimpleValue::Native(self.formatter.member(&value, field)?)
            }
            Expr::Index(lhs, index) => {
                let value = self.native(lhs)?;
                let index = match self.scalar(&self.evaluate(index)?)? {
                    Scalar::Int(i) if (0..=u64::MAX as i128).contains(&i) => i as u64,
                    other => {
                        return Err(Error::UnsupportedOperation(format!(
                            "index must be a non-negative integer, got {other:?}"
                        )))
                    }
                };
                SimpleValue::Native(self.formatter.index(&value, index)?)
            }
            Expr::Unary(UnaryOp::Deref, operand) => {
                let value = self.native(operand)?;
                SimpleValue::Native(self.formatter.deref(&value)?)
            }
            Expr::Unary(UnaryOp::Neg, operand) => match self.scalar(&self.evaluate(operand)?)? {
                Scalar::Int(i) => SimpleValue::Int(
                    i.checked_neg()
                        .ok_or_else(|| Error::UnsupportedOperation("integer overflow".to_string()))?,
                ),
                Scalar::Float(f) => SimpleValue::Float(-f),
                other => {
                    return Err(Error::UnsupportedOperation(format!("can't negate {other:?}")))
                }
            },
            Expr::Unary(UnaryOp::Not, operand) => {
                SimpleValue::Bool(!self.truthy(&self.evaluate(operand)?)?)
            }
            Expr::Binary(BinaryOp::And, lhs, rhs) => SimpleValue::Bool(
                self.truthy(&self.evaluate(lhs)?)? && self.truthy(&self.evaluate(rhs)?)?,
            ),
            Expr::Binary(BinaryOp::Or, lhs, rhs) => SimpleValue::Bool(
                self.truthy(&self.evaluate(lhs)?)? || self.truthy(&self.evaluate(rhs)?)?,
            ),
            Expr::Binary(op, lhs, rhs) => {
                let lhs = self.scalar(&self.evaluate(lhs)?)?;
                let rhs = self.scalar(&self.evaluate(rhs)?)?;
                binary(*op, lhs, rhs)?
            }
        })
    }

    /// Truthiness of a value: zero, empty string and null pointer are false.
    pub fn truthy(&self, value: &SimpleValue) -> Result<bool, Error> {
        Ok(match self.scalar(value)? {
            Scalar::Int(i) => i != 0,
            Scalar::Float(f) => f != 0.0,
            Scalar::Bool(b) => b,
            Scalar::Str(s) => !s.is_empty(),
        })
    }

    fn variable(&self, name: &str) -> Result<TypedValue, Error> {
        let frame = self
            .frame
            .ok_or_else(|| Error::VariableNotFound(name.to_string()))?;
        self.backend
            .find_variable(frame, name)?
            .map(TypedValue::from)
            .ok_or_else(|| Error::VariableNotFound(name.to_string()))
    }

    fn native(&self, expr: &Expr) -> Result<TypedValue, Error> {
        match self.evaluate(expr)? {
            SimpleValue::Native(value) => Ok(value),
            other => Err(Error::UnsupportedOperation(format!(
                "{other:?} is not a debugee value"
            ))),
        }
    }

    fn scalar(&self, value: &SimpleValue) -> Result<Scalar, Error> {
        Ok(match value {
            SimpleValue::Int(i) => Scalar::Int(*i),
            SimpleValue::Float(f) => Scalar::Float(*f),
            SimpleValue::Bool(b) => Scalar::Bool(*b),
            SimpleValue::Str(s) => Scalar::Str(s.clone()),
            SimpleValue::Native(value) => {
                if let Some(string) = self.formatter.string(value)? {
                    return Ok(Scalar::Str(string));
                }
                match self.formatter.primitive(value)? {
                    Some(Primitive::Bool(b)) => Scalar::Bool(b),
                    Some(Primitive::Int(i)) => Scalar::Int(i),
                    Some(Primitive::Float(f)) => Scalar::Float(f),
                    Some(Primitive::Char(c)) => Scalar::Int(c as u32 as i128),
                    Some(Primitive::Pointer(p)) => Scalar::Int(p as i128),
                    None => {
                        let type_name = self
                            .formatter
                            .type_of(value.type_id)
                            .map(|t| t.name.clone())
                            .unwrap_or_default();
                        return Err(Error::UnsupportedOperation(format!(
                            "a value of type `{type_name}` is not a scalar"
                        )));
                    }
                }
            }
        })
    }
}

fn binary(op: BinaryOp, lhs: Scalar, rhs: Scalar) -> Result<SimpleValue, Error> {
    let unsupported = |lhs: &Scalar, rhs: &Scalar| {
        Error::UnsupportedOperation(format!("{op:?} on {lhs:?} and {rhs:?}"))
    };

    let ordering = match (&lhs, &rhs) {
        (Scalar::Int(a), Scalar::Int(b)) => Some(a.cmp(b)),
        (Scalar::Str(a), Scalar::Str(b)) => Some(a.cmp(b)),
        (Scalar::Bool(a), Scalar::Bool(b)) => Some(a.cmp(b)),
        _ => as_float(&lhs)
            .zip(as_float(&rhs))
            .and_then(|(a, b)| a.partial_cmp(&b)),
    };

    let compare = |expected: fn(Ordering) -> bool| -> Result<SimpleValue, Error> {
        ordering
            .map(|o| SimpleValue::Bool(expected(o)))
            .ok_or_else(|| unsupported(&lhs, &rhs))
    };

    match op {
        BinaryOp::Eq => compare(|o| o == Ordering::Equal),
        BinaryOp::Ne => compare(|o| o != Ordering::Equal),
        BinaryOp::Lt => compare(|o| o == Ordering::Less),
        BinaryOp::Le => compare(|o| o != Ordering::Greater),
        BinaryOp::Gt => compare(|o| o == Ordering::Greater),
        BinaryOp::Ge => compare(|o| o != Ordering::Less),
        BinaryOp::Mul | BinaryOp::Div | BinaryOp::Rem | BinaryOp::Add | BinaryOp::Sub => {
            arithmetic(op, &lhs, &rhs).ok_or_else(|| unsupported(&lhs, &rhs))?
        }
        BinaryOp::And | BinaryOp::Or => Err(unsupported(&lhs, &rhs)),
    }
}

fn as_float(scalar: &Scalar) -> Option<f64> {
    match scalar {
        Scalar::Int(i) => Some(*i as f64),
        Scalar::Float(f) => Some(*f),
        _ => None,
    }
}

fn arithmetic(op: BinaryOp, lhs: &Scalar, rhs: &Scalar) -> Option<Result<SimpleValue, Error>> {
    if let (Scalar::Int(a), Scalar::Int(b)) = (lhs, rhs) {
        let (a, b) = (*a, *b);
        if matches!(op, BinaryOp::Div | BinaryOp::Rem) && b == 0 {
            return Some(Err(Error::UnsupportedOperation("division by zero".to_string())));
        }
        let result = match op {
            BinaryOp::Mul => a.checked_mul(b),
            BinaryOp::Div => a.checked_div(b),
            BinaryOp::Rem => a.checked_rem(b),
            BinaryOp::Add => a.checked_add(b),
            BinaryOp::Sub => a.checked_sub(b),
            _ => None,
        };
        return Some(
            result
                .map(SimpleValue::Int)
                .ok_or_else(|| Error::UnsupportedOperation("integer overflow".to_string())),
        );
    }

    if let (Scalar::Str(a), Scalar::Str(b), BinaryOp::Add) = (lhs, rhs, op) {
        return Some(Ok(SimpleValue::Str(format!("{a}{b}"))));
    }

    let (a, b) = (as_float(lhs)?, as_float(rhs)?);
    let result = match op {
        BinaryOp::Mul => a * b,
        BinaryOp::Div => a / b,
        BinaryOp::Rem => a % b,
        BinaryOp::Add => a + b,
        BinaryOp::Sub => a - b,
        _ => return None,
    };
    Some(Ok(SimpleValue::Float(result)))
}
