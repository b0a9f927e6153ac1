use std::cmp::Ordering;

use serde_json::Value;

use flowmind_core::error::{FlowError, Result};

use super::{CmpOp, Expr, Segment};
use crate::state::{type_name, VarLookup};

pub(crate) struct Evaluator<'a> {
    source: &'a str,
    vars: &'a dyn VarLookup,
}

impl<'a> Evaluator<'a> {
    pub(crate) fn new(source: &'a str, vars: &'a dyn VarLookup) -> Self {
        Self { source, vars }
    }

    fn error(&self, message: impl Into<String>) -> FlowError {
        FlowError::Expression {
            expr: self.source.to_string(),
            message: message.into(),
        }
    }

    pub(crate) fn eval(&self, expr: &Expr) -> Result<Value> {
        match expr {
            Expr::Literal(value) => Ok(value.clone()),
            Expr::Path { root, segments } => self.resolve_path(root, segments),
            Expr::List(items) => items
                .iter()
                .map(|item| self.eval(item))
                .collect::<Result<Vec<_>>>()
                .map(Value::Array),
            Expr::Len(inner) => {
                let value = self.eval(inner)?;
                let len = match &value {
                    Value::String(s) => s.chars().count(),
                    Value::Array(items) => items.len(),
                    Value::Object(map) => map.len(),
                    other => {
                        return Err(self.error(format!("len() is not defined for {}", type_name(other))))
                    }
                };
                Ok(Value::from(len as u64))
            }
            Expr::Not(inner) => Ok(Value::Bool(!truthy(&self.eval(inner)?))),
            Expr::And(left, right) => {
                if !truthy(&self.eval(left)?) {
                    return Ok(Value::Bool(false));
                }
                Ok(Value::Bool(truthy(&self.eval(right)?)))
            }
            Expr::Or(left, right) => {
                if truthy(&self.eval(left)?) {
                    return Ok(Value::Bool(true));
                }
                Ok(Value::Bool(truthy(&self.eval(right)?)))
            }
            Expr::Compare(op, left, right) => {
                let left = self.eval(left)?;
                let right = self.eval(right)?;
                self.compare(*op, &left, &right).map(Value::Bool)
            }
        }
    }

    fn resolve_path(&self, root: &str, segments: &[Segment]) -> Result<Value> {
        let mut current = self
            .vars
            .lookup(root)
            .ok_or_else(|| FlowError::UnknownVariable(root.to_string()))?;
        let mut display = root.to_string();

        for segment in segments {
            current = match segment {
                Segment::Field(field) => {
                    display.push('.');
                    display.push_str(field);
                    match current {
                        Value::Object(map) => map
                            .get(field)
                            .ok_or_else(|| FlowError::UnknownVariable(display.clone()))?,
                        other => {
                            return Err(FlowError::TypeMismatch {
                                key: display,
                                expected: "map".into(),
                                found: type_name(other).into(),
                            })
                        }
                    }
                }
                Segment::Index(index) => {
                    display.push_str(&format!("[{index}]"));
                    match current {
                        Value::Array(items) => {
                            let len = items.len() as i64;
                            let position = if *index < 0 { len + index } else { *index };
                            if position < 0 || position >= len {
                                return Err(FlowError::UnknownVariable(display));
                            }
                            &items[position as usize]
                        }
                        other => {
                            return Err(FlowError::TypeMismatch {
                                key: display,
                                expected: "list".into(),
                                found: type_name(other).into(),
                            })
                        }
                    }
                }
            };
        }
        Ok(current.clone())
    }

    fn compare(&self, op: CmpOp, left: &Value, right: &Value) -> Result<bool> {
        match op {
            CmpOp::Eq => Ok(values_equal(left, right)),
            CmpOp::Ne => Ok(!values_equal(left, right)),
            CmpOp::In => self.contains(right, left),
            CmpOp::NotIn => self.contains(right, left).map(|found| !found),
            CmpOp::Lt | CmpOp::Le | CmpOp::Gt | CmpOp::Ge => {
                let ordering = self.order(left, right)?;
                Ok(match op {
                    CmpOp::Lt => ordering == Ordering::Less,
                    CmpOp::Le => ordering != Ordering::Greater,
                    CmpOp::Gt => ordering == Ordering::Greater,
                    _ => ordering != Ordering::Less,
                })
            }
        }
    }

    fn order(&self, left: &Value, right: &Value) -> Result<Ordering> {
        match (left, right) {
            (Value::Number(a), Value::Number(b)) => {
                let (a, b) = (a.as_f64().unwrap_or(f64::NAN), b.as_f64().unwrap_or(f64::NAN));
                a.partial_cmp(&b)
                    .ok_or_else(|| self.error("cannot compare non-finite numbers"))
            }
            (Value::String(a), Value::String(b)) => Ok(a.cmp(b)),
            (a, b) => Err(self.error(format!(
                "cannot compare {} with {}",
                type_name(a),
                type_name(b)
            ))),
        }
    }

    fn contains(&self, haystack: &Value, needle: &Value) -> Result<bool> {
        match (haystack, needle) {
            (Value::Array(items), needle) => Ok(items.iter().any(|item| values_equal(item, needle))),
            (Value::String(text), Value::String(sub)) => Ok(text.contains(sub.as_str())),
            (Value::Object(map), Value::String(key)) => Ok(map.contains_key(key)),
            (haystack, needle) => Err(self.error(format!(
                "`in` is not defined for {} in {}",
                type_name(needle),
                type_name(haystack)
            ))),
        }
    }
}

/// null, false, 0, "", [] and {} are false; everything else is true.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

/// JSON equality where numbers compare by value (`1 == 1.0`).
pub fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => match (a.as_i64(), b.as_i64()) {
            (Some(a), Some(b)) => a == b,
            _ => a.as_f64() == b.as_f64(),
        },
        (Value::Array(a), Value::Array(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(x, y)| values_equal(x, y))
        }
        (Value::Object(a), Value::Object(b)) => {
            a.len() == b.len()
                && a.iter()
                    .all(|(k, v)| b.get(k).is_some_and(|other| values_equal(v, other)))
        }
        (a, b) => a == b,
    }
}
