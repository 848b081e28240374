// Guard Expression Evaluator
// Evaluates parsed guard expressions against named variables

use crate::expression::functions::BuiltinFunctions;
use crate::expression::parser::{BinaryOp, Expr, UnaryOp};
use crate::expression::value::Value;

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;

/// Top-level names visible to an expression
pub type Variables = HashMap<String, Value>;

/// Evaluation error
#[derive(Debug, Clone, PartialEq)]
pub struct EvalError {
    pub message: String,
}

impl fmt::Display for EvalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "evaluation error: {}", self.message)
    }
}

impl std::error::Error for EvalError {}

impl EvalError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

pub struct Evaluator<'a> {
    variables: &'a Variables,
    functions: BuiltinFunctions,
}

impl<'a> Evaluator<'a> {
    pub fn new(variables: &'a Variables) -> Self {
        Self {
            variables,
            functions: BuiltinFunctions::new(),
        }
    }

    pub fn eval(&self, expr: &Expr) -> Result<Value, EvalError> {
        match expr {
            Expr::Null => Ok(Value::Null),
            Expr::Bool(b) => Ok(Value::Bool(*b)),
            Expr::Number(n) => Ok(Value::Number(*n)),
            Expr::String(s) => Ok(Value::String(s.clone())),

            Expr::Ident(name) => self
                .variables
                .get(name)
                .cloned()
                .ok_or_else(|| EvalError::new(format!("undeclared reference to '{}'", name))),

            Expr::Call { name, args } => {
                let values = args
                    .iter()
                    .map(|a| self.eval(a))
                    .collect::<Result<Vec<_>, _>>()?;
                self.functions.call(name, values)
            }

            Expr::Index { object, index } => {
                let object = self.eval(object)?;
                let index = self.eval(index)?;
                eval_index(&object, &index)
            }

            Expr::Member { object, property } => {
                let object = self.eval(object)?;
                eval_member(&object, property)
            }

            Expr::Unary { op, expr } => {
                let value = self.eval(expr)?;
                match op {
                    UnaryOp::Not => Ok(Value::Bool(!value.is_truthy())),
                    UnaryOp::Neg => value
                        .as_number()
                        .map(|n| Value::Number(-n))
                        .ok_or_else(|| EvalError::new("cannot negate a non-number")),
                }
            }

            // && and || short-circuit
            Expr::Binary {
                op: BinaryOp::And,
                left,
                right,
            } => {
                if !self.eval(left)?.is_truthy() {
                    return Ok(Value::Bool(false));
                }
                Ok(Value::Bool(self.eval(right)?.is_truthy()))
            }
            Expr::Binary {
                op: BinaryOp::Or,
                left,
                right,
            } => {
                if self.eval(left)?.is_truthy() {
                    return Ok(Value::Bool(true));
                }
                Ok(Value::Bool(self.eval(right)?.is_truthy()))
            }
            Expr::Binary { op, left, right } => {
                let left = self.eval(left)?;
                let right = self.eval(right)?;
                eval_binary(*op, &left, &right)
            }

            Expr::Ternary {
                condition,
                then_expr,
                else_expr,
            } => {
                if self.eval(condition)?.is_truthy() {
                    self.eval(then_expr)
                } else {
                    self.eval(else_expr)
                }
            }

            Expr::List(items) => items
                .iter()
                .map(|e| self.eval(e))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::List),
        }
    }
}

fn eval_index(object: &Value, index: &Value) -> Result<Value, EvalError> {
    match (object, index) {
        (Value::List(items), Value::Number(n)) => {
            if *n < 0.0 || n.fract() != 0.0 {
                return Err(EvalError::new(format!("invalid list index {}", n)));
            }
            items
                .get(*n as usize)
                .cloned()
                .ok_or_else(|| EvalError::new(format!("list index {} out of range", n)))
        }
        (Value::Map(map), Value::String(key)) => map
            .get(key)
            .cloned()
            .ok_or_else(|| EvalError::new(format!("no such key: '{}'", key))),
        _ => Err(EvalError::new(format!(
            "cannot index {} with {}",
            object.type_name(),
            index.type_name()
        ))),
    }
}

fn eval_member(object: &Value, property: &str) -> Result<Value, EvalError> {
    match object {
        Value::Map(map) => map
            .get(property)
            .cloned()
            .ok_or_else(|| EvalError::new(format!("no such key: '{}'", property))),
        _ => Err(EvalError::new(format!(
            "cannot access '{}' on {}",
            property,
            object.type_name()
        ))),
    }
}

fn eval_binary(op: BinaryOp, left: &Value, right: &Value) -> Result<Value, EvalError> {
    match op {
        BinaryOp::Add => match (left, right) {
            (Value::Number(a), Value::Number(b)) => Ok(Value::Number(a + b)),
            (Value::String(a), Value::String(b)) => Ok(Value::String(format!("{}{}", a, b))),
            (Value::List(a), Value::List(b)) => {
                Ok(Value::List(a.iter().chain(b.iter()).cloned().collect()))
            }
            _ => Err(EvalError::new(format!(
                "cannot add {} and {}",
                left.type_name(),
                right.type_name()
            ))),
        },
        BinaryOp::Sub => numeric(left, right, |a, b| a - b),
        BinaryOp::Mul => numeric(left, right, |a, b| a * b),
        BinaryOp::Div | BinaryOp::Mod if right.as_number() == Some(0.0) => {
            Err(EvalError::new("division by zero"))
        }
        BinaryOp::Div => numeric(left, right, |a, b| a / b),
        BinaryOp::Mod => numeric(left, right, |a, b| a % b),

        BinaryOp::Eq => Ok(Value::Bool(values_equal(left, right))),
        BinaryOp::Ne => Ok(Value::Bool(!values_equal(left, right))),
        BinaryOp::Lt => compare(left, right).map(|o| Value::Bool(o == Ordering::Less)),
        BinaryOp::Le => compare(left, right).map(|o| Value::Bool(o != Ordering::Greater)),
        BinaryOp::Gt => compare(left, right).map(|o| Value::Bool(o == Ordering::Greater)),
        BinaryOp::Ge => compare(left, right).map(|o| Value::Bool(o != Ordering::Less)),

        BinaryOp::In => match right {
            Value::List(items) => Ok(Value::Bool(items.iter().any(|i| values_equal(i, left)))),
            Value::Map(map) => match left {
                Value::String(key) => Ok(Value::Bool(map.contains_key(key))),
                _ => Err(EvalError::new("map membership requires a string key")),
            },
            _ => Err(EvalError::new(format!(
                "'in' requires a list or map, got {}",
                right.type_name()
            ))),
        },

        BinaryOp::And => Ok(Value::Bool(left.is_truthy() && right.is_truthy())),
        BinaryOp::Or => Ok(Value::Bool(left.is_truthy() || right.is_truthy())),
    }
}

fn numeric(left: &Value, right: &Value, op: fn(f64, f64) -> f64) -> Result<Value, EvalError> {
    match (left.as_number(), right.as_number()) {
        (Some(a), Some(b)) => Ok(Value::Number(op(a, b))),
        _ => Err(EvalError::new(format!(
            "arithmetic requires numbers, got {} and {}",
            left.type_name(),
            right.type_name()
        ))),
    }
}

fn compare(left: &Value, right: &Value) -> Result<Ordering, EvalError> {
    let ordering = match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.partial_cmp(b),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    };
    ordering.ok_or_else(|| {
        EvalError::new(format!(
            "cannot compare {} with {}",
            left.type_name(),
            right.type_name()
        ))
    })
}

/// Strict equality; numbers compare by value, other kinds must match exactly
pub(crate) fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => (a - b).abs() < f64::EPSILON,
        _ => left == right,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::parser::ExprParser;

    fn variables() -> Variables {
        let mut params = std::collections::BTreeMap::new();
        params.insert("env".to_string(), Value::from("prod"));
        params.insert("replicas".to_string(), Value::from("3"));
        params.insert("targets".to_string(), Value::from(vec!["linux", "mac"]));

        let mut vars = Variables::new();
        vars.insert("params".to_string(), Value::Map(params));
        vars
    }

    fn eval(input: &str) -> Result<Value, EvalError> {
        let vars = variables();
        let expr = ExprParser::parse_str(input).map_err(|e| EvalError::new(e.to_string()))?;
        Evaluator::new(&vars).eval(&expr)
    }

    #[test]
    fn test_eval_literals_and_arithmetic() {
        assert_eq!(eval("1 + 2 * 3").unwrap(), Value::Number(7.0));
        assert_eq!(eval("'a' + 'b'").unwrap(), Value::String("ab".to_string()));
        assert!(eval("1 / 0").is_err());
    }

    #[test]
    fn test_eval_member_reference() {
        assert_eq!(eval("params.env").unwrap(), Value::from("prod"));
        assert!(eval("params.missing").is_err());
        assert!(eval("undeclared").is_err());
    }

    #[test]
    fn test_eval_comparison() {
        assert_eq!(eval("params.env == 'prod'").unwrap(), Value::Bool(true));
        assert_eq!(eval("params.env == 'PROD'").unwrap(), Value::Bool(false));
        assert_eq!(eval("int(params.replicas) >= 2").unwrap(), Value::Bool(true));
        assert_eq!(eval("'abc' < 'abd'").unwrap(), Value::Bool(true));
        assert!(eval("1 < 'a'").is_err());
    }

    #[test]
    fn test_eval_in() {
        assert_eq!(eval("'mac' in params.targets").unwrap(), Value::Bool(true));
        assert_eq!(eval("'env' in params").unwrap(), Value::Bool(true));
        assert_eq!(eval("'win' in ['linux']").unwrap(), Value::Bool(false));
        assert!(eval("'a' in 'abc'").is_err());
    }

    #[test]
    fn test_eval_short_circuit() {
        // right side would fail if evaluated
        assert_eq!(eval("false && undeclared").unwrap(), Value::Bool(false));
        assert_eq!(eval("true || undeclared").unwrap(), Value::Bool(true));
    }

    #[test]
    fn test_eval_ternary_and_functions() {
        assert_eq!(
            eval("size(params.targets) > 1 ? 'many' : 'one'").unwrap(),
            Value::String("many".to_string())
        );
        assert_eq!(
            eval("params.env.matches('^pr')").unwrap(),
            Value::Bool(true)
        );
    }
}
