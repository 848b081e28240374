// Built-in Functions for Guard Expressions
// String, list and conversion helpers callable from guard expressions

use crate::expression::evaluator::{values_equal, EvalError};
use crate::expression::value::Value;

use regex::Regex;

/// Registry of built-in functions
#[derive(Debug, Default)]
pub struct BuiltinFunctions;

impl BuiltinFunctions {
    pub fn new() -> Self {
        Self
    }

    /// Call a built-in function by name
    pub fn call(&self, name: &str, args: Vec<Value>) -> Result<Value, EvalError> {
        match name.to_lowercase().as_str() {
            "size" => self.fn_size(args),
            "contains" => self.fn_contains(args),
            "startswith" => self.fn_affix(args, "startsWith", |s, p| s.starts_with(p)),
            "endswith" => self.fn_affix(args, "endsWith", |s, p| s.ends_with(p)),
            "matches" => self.fn_matches(args),
            "lower" => self.fn_map_string(args, "lower", |s| s.to_lowercase()),
            "upper" => self.fn_map_string(args, "upper", |s| s.to_uppercase()),
            "trim" => self.fn_map_string(args, "trim", |s| s.trim().to_string()),
            "split" => self.fn_split(args),
            "join" => self.fn_join(args),
            "int" => self.fn_int(args),
            "string" => {
                require_args(&args, 1, "string")?;
                Ok(Value::String(args[0].as_string()))
            }
            _ => Err(EvalError::new(format!("unknown function: {}", name))),
        }
    }

    fn fn_size(&self, args: Vec<Value>) -> Result<Value, EvalError> {
        require_args(&args, 1, "size")?;
        let len = match &args[0] {
            Value::String(s) => s.chars().count(),
            Value::List(items) => items.len(),
            Value::Map(map) => map.len(),
            other => {
                return Err(EvalError::new(format!(
                    "size() is not defined for {}",
                    other.type_name()
                )))
            }
        };
        Ok(Value::Number(len as f64))
    }

    fn fn_contains(&self, args: Vec<Value>) -> Result<Value, EvalError> {
        require_args(&args, 2, "contains")?;
        match (&args[0], &args[1]) {
            (Value::String(haystack), Value::String(needle)) => {
                Ok(Value::Bool(haystack.contains(needle.as_str())))
            }
            (Value::List(items), needle) => {
                Ok(Value::Bool(items.iter().any(|item| values_equal(item, needle))))
            }
            (Value::Map(map), Value::String(key)) => Ok(Value::Bool(map.contains_key(key))),
            _ => Err(EvalError::new("contains() requires a string, list or map")),
        }
    }

    fn fn_affix(
        &self,
        args: Vec<Value>,
        name: &str,
        test: fn(&str, &str) -> bool,
    ) -> Result<Value, EvalError> {
        require_args(&args, 2, name)?;
        let (s, p) = two_strings(&args, name)?;
        Ok(Value::Bool(test(s, p)))
    }

    fn fn_matches(&self, args: Vec<Value>) -> Result<Value, EvalError> {
        require_args(&args, 2, "matches")?;
        let (s, pattern) = two_strings(&args, "matches")?;
        let re = Regex::new(pattern)
            .map_err(|e| EvalError::new(format!("invalid regex '{}': {}", pattern, e)))?;
        Ok(Value::Bool(re.is_match(s)))
    }

    fn fn_map_string(
        &self,
        args: Vec<Value>,
        name: &str,
        f: fn(&str) -> String,
    ) -> Result<Value, EvalError> {
        require_args(&args, 1, name)?;
        match &args[0] {
            Value::String(s) => Ok(Value::String(f(s))),
            other => Err(EvalError::new(format!(
                "{}() requires a string, got {}",
                name,
                other.type_name()
            ))),
        }
    }

    fn fn_split(&self, args: Vec<Value>) -> Result<Value, EvalError> {
        require_args(&args, 2, "split")?;
        let (s, sep) = two_strings(&args, "split")?;
        Ok(Value::List(
            s.split(sep).map(|part| Value::String(part.to_string())).collect(),
        ))
    }

    fn fn_join(&self, args: Vec<Value>) -> Result<Value, EvalError> {
        if args.is_empty() || args.len() > 2 {
            return Err(EvalError::new(format!(
                "join() requires 1 or 2 argument(s), got {}",
                args.len()
            )));
        }
        let Value::List(items) = &args[0] else {
            return Err(EvalError::new("join() requires a list"));
        };
        let sep = match args.get(1) {
            Some(Value::String(sep)) => sep.as_str(),
            Some(_) => return Err(EvalError::new("join() separator must be a string")),
            None => "",
        };
        let parts: Vec<String> = items.iter().map(Value::as_string).collect();
        Ok(Value::String(parts.join(sep)))
    }

    fn fn_int(&self, args: Vec<Value>) -> Result<Value, EvalError> {
        require_args(&args, 1, "int")?;
        match &args[0] {
            Value::Number(n) => Ok(Value::Number(n.trunc())),
            Value::String(s) => s
                .trim()
                .parse::<i64>()
                .map(|n| Value::Number(n as f64))
                .map_err(|_| EvalError::new(format!("int(): cannot convert '{}'", s))),
            Value::Bool(b) => Ok(Value::Number(if *b { 1.0 } else { 0.0 })),
            other => Err(EvalError::new(format!(
                "int() is not defined for {}",
                other.type_name()
            ))),
        }
    }
}

fn require_args(args: &[Value], count: usize, name: &str) -> Result<(), EvalError> {
    if args.len() != count {
        return Err(EvalError::new(format!(
            "{}() requires {} argument(s), got {}",
            name,
            count,
            args.len()
        )));
    }
    Ok(())
}

fn two_strings<'a>(args: &'a [Value], name: &str) -> Result<(&'a str, &'a str), EvalError> {
    match (&args[0], &args[1]) {
        (Value::String(a), Value::String(b)) => Ok((a, b)),
        (a, b) => Err(EvalError::new(format!(
            "{}() requires string arguments, got {} and {}",
            name,
            a.type_name(),
            b.type_name()
        ))),
    }
}
