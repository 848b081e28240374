// Guard Expression Module
// CEL-style boolean expressions behind a pluggable evaluator trait

pub mod evaluator;
pub mod functions;
pub mod lexer;
pub mod parser;
pub mod value;

pub use evaluator::{EvalError, Evaluator, Variables};
pub use functions::BuiltinFunctions;
pub use lexer::{LexError, Lexer, Token};
pub use parser::{BinaryOp, Expr, ExprParser, ParseExprError, UnaryOp};
pub use value::Value;

/// Evaluates boolean guard expressions.
///
/// Expressions arrive with every `$(...)` reference already substituted.
pub trait ExpressionEvaluator: Send + Sync {
    fn evaluate(&self, expr: &str, variables: &Variables) -> Result<bool, EvalError>;
}

/// The built-in lexer/parser/evaluator
#[derive(Debug, Default, Clone, Copy)]
pub struct BuiltinEvaluator;

impl ExpressionEvaluator for BuiltinEvaluator {
    fn evaluate(&self, expr: &str, variables: &Variables) -> Result<bool, EvalError> {
        let ast = ExprParser::parse_str(expr).map_err(|e| EvalError::new(e.to_string()))?;
        match Evaluator::new(variables).eval(&ast)? {
            Value::Bool(b) => Ok(b),
            other => Err(EvalError::new(format!(
                "expression '{}' produced {}, expected bool",
                expr,
                other.type_name()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_requires_bool() {
        let vars = Variables::new();
        assert_eq!(BuiltinEvaluator.evaluate("1 < 2", &vars), Ok(true));
        assert!(BuiltinEvaluator.evaluate("'x'", &vars).is_err());
    }

    #[test]
    fn test_builtin_reports_parse_errors() {
        let err = BuiltinEvaluator
            .evaluate("'a' ==", &Variables::new())
            .unwrap_err();
        assert!(err.message.contains("parse error"));
    }
}
