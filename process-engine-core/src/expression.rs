use crate::error::{EngineError, Result};
use crate::types::DataMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;

/// Data expression used by transition conditions, operations, correlation
/// keys, cardinalities and loop conditions.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Expression {
    Constant {
        value: Value,
    },
    /// Reads a variable of the data context. Missing variables are an error.
    Data {
        name: String,
    },
    Compare {
        left: Box<Expression>,
        op: CompareOp,
        right: Box<Expression>,
    },
    Arithmetic {
        left: Box<Expression>,
        op: ArithmeticOp,
        right: Box<Expression>,
    },
    And {
        all: Vec<Expression>,
    },
    Or {
        any: Vec<Expression>,
    },
    Not {
        expr: Box<Expression>,
    },
    /// Length of an array, string or object.
    Length {
        expr: Box<Expression>,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Neq,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Lte,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Gte,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArithmeticOp {
    #[serde(rename = "+")]
    Add,
    #[serde(rename = "-")]
    Sub,
    #[serde(rename = "*")]
    Mul,
}

impl Expression {
    pub fn constant(value: impl Into<Value>) -> Self {
        Expression::Constant {
            value: value.into(),
        }
    }

    pub fn data(name: impl Into<String>) -> Self {
        Expression::Data { name: name.into() }
    }

    pub fn compare(left: Expression, op: CompareOp, right: Expression) -> Self {
        Expression::Compare {
            left: Box::new(left),
            op,
            right: Box::new(right),
        }
    }

    pub fn arithmetic(left: Expression, op: ArithmeticOp, right: Expression) -> Self {
        Expression::Arithmetic {
            left: Box::new(left),
            op,
            right: Box::new(right),
        }
    }

    /// `data(name) == value`
    pub fn data_equals(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Expression::compare(Expression::data(name), CompareOp::Eq, Expression::constant(value))
    }

    pub fn length(expr: Expression) -> Self {
        Expression::Length {
            expr: Box::new(expr),
        }
    }
}

/// Evaluates expressions against a data context.
pub trait ExpressionResolver: Send + Sync {
    fn evaluate(&self, expression: &Expression, data: &DataMap) -> Result<Value>;

    fn evaluate_bool(&self, expression: &Expression, data: &DataMap) -> Result<bool> {
        match self.evaluate(expression, data)? {
            Value::Bool(b) => Ok(b),
            other => Err(EngineError::Expression(format!(
                "expected a boolean, got {other}"
            ))),
        }
    }

    /// Non-negative integer result (cardinalities, loop bounds).
    fn evaluate_count(&self, expression: &Expression, data: &DataMap) -> Result<u32> {
        let value = self.evaluate(expression, data)?;
        value
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .ok_or_else(|| {
                EngineError::Expression(format!("expected a non-negative integer, got {value}"))
            })
    }
}

/// Built-in interpreter for [`Expression`].
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultExpressionResolver;

impl ExpressionResolver for DefaultExpressionResolver {
    fn evaluate(&self, expression: &Expression, data: &DataMap) -> Result<Value> {
        match expression {
            Expression::Constant { value } => Ok(value.clone()),
            Expression::Data { name } => data
                .get(name)
                .cloned()
                .ok_or_else(|| EngineError::Expression(format!("unknown data '{name}'"))),
            Expression::Compare { left, op, right } => {
                let l = self.evaluate(left, data)?;
                let r = self.evaluate(right, data)?;
                compare(&l, *op, &r).map(Value::Bool)
            }
            Expression::Arithmetic { left, op, right } => {
                let l = self.evaluate(left, data)?;
                let r = self.evaluate(right, data)?;
                arithmetic(&l, *op, &r)
            }
            Expression::And { all } => {
                for expr in all {
                    if !self.evaluate_bool(expr, data)? {
                        return Ok(Value::Bool(false));
                    }
                }
                Ok(Value::Bool(true))
            }
            Expression::Or { any } => {
                for expr in any {
                    if self.evaluate_bool(expr, data)? {
                        return Ok(Value::Bool(true));
                    }
                }
                Ok(Value::Bool(false))
            }
            Expression::Not { expr } => Ok(Value::Bool(!self.evaluate_bool(expr, data)?)),
            Expression::Length { expr } => match self.evaluate(expr, data)? {
                Value::Array(items) => Ok(Value::from(items.len())),
                Value::String(s) => Ok(Value::from(s.chars().count())),
                Value::Object(map) => Ok(Value::from(map.len())),
                other => Err(EngineError::Expression(format!(
                    "length of non-collection {other}"
                ))),
            },
        }
    }
}

fn compare(left: &Value, op: CompareOp, right: &Value) -> Result<bool> {
    let ordering = match (left, right) {
        (Value::Number(a), Value::Number(b)) => match (a.as_f64(), b.as_f64()) {
            (Some(a), Some(b)) => a.partial_cmp(&b),
            _ => None,
        },
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    };

    match (op, ordering) {
        (CompareOp::Eq, Some(o)) => Ok(o == Ordering::Equal),
        (CompareOp::Neq, Some(o)) => Ok(o != Ordering::Equal),
        (CompareOp::Eq, None) => Ok(left == right),
        (CompareOp::Neq, None) => Ok(left != right),
        (CompareOp::Lt, Some(o)) => Ok(o == Ordering::Less),
        (CompareOp::Lte, Some(o)) => Ok(o != Ordering::Greater),
        (CompareOp::Gt, Some(o)) => Ok(o == Ordering::Greater),
        (CompareOp::Gte, Some(o)) => Ok(o != Ordering::Less),
        (_, None) => Err(EngineError::Expression(format!(
            "cannot order {left} and {right}"
        ))),
    }
}

fn arithmetic(left: &Value, op: ArithmeticOp, right: &Value) -> Result<Value> {
    let (Value::Number(a), Value::Number(b)) = (left, right) else {
        return Err(EngineError::Expression(format!(
            "arithmetic on non-numbers {left} and {right}"
        )));
    };

    if let (Some(a), Some(b)) = (a.as_i64(), b.as_i64()) {
        let result = match op {
            ArithmeticOp::Add => a.checked_add(b),
            ArithmeticOp::Sub => a.checked_sub(b),
            ArithmeticOp::Mul => a.checked_mul(b),
        };
        return result
            .map(Value::from)
            .ok_or_else(|| EngineError::Expression(format!("integer overflow on {a} and {b}")));
    }

    let (a, b) = (a.as_f64().unwrap_or_default(), b.as_f64().unwrap_or_default());
    let result = match op {
        ArithmeticOp::Add => a + b,
        ArithmeticOp::Sub => a - b,
        ArithmeticOp::Mul => a * b,
    };
    serde_json::Number::from_f64(result)
        .map(Value::Number)
        .ok_or_else(|| EngineError::Expression(format!("non-finite result {result}")))
}
