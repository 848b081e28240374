// Guard Evaluator
// Decides whether a task runs from its when-expressions

use crate::expression::ExpressionEvaluator;
use crate::model::{ParamValue, SkipReason, WhenExpression, WhenOperator};
use crate::substitution::{SubstitutionError, Substitutor};

use tracing::debug;

/// Result of evaluating a task's guards
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardOutcome {
    Run,
    Skip(SkipReason),
}

/// A guard after substitution
enum Resolved {
    Membership {
        input: String,
        operator: WhenOperator,
        values: Vec<String>,
    },
    Cel(String),
}

pub struct GuardEvaluator<'a> {
    evaluator: &'a dyn ExpressionEvaluator,
}

impl<'a> GuardEvaluator<'a> {
    pub fn new(evaluator: &'a dyn ExpressionEvaluator) -> Self {
        Self { evaluator }
    }

    /// Evaluate all guards; every one must hold.
    ///
    /// A reference to a missing task result is returned as an error so the
    /// caller can apply the missing-result policy. Any other substitution
    /// or evaluation failure skips the task.
    pub fn evaluate(
        &self,
        task: &str,
        guards: &[WhenExpression],
        substitutor: &Substitutor<'_>,
    ) -> Result<GuardOutcome, SubstitutionError> {
        let mut resolved = Vec::with_capacity(guards.len());
        let mut unresolved = false;

        for guard in guards {
            match resolve(guard, substitutor) {
                Ok(r) => resolved.push(r),
                Err(e) if e.is_missing_result() => return Err(e),
                Err(e) => {
                    debug!(task, error = %e, "guard could not be resolved");
                    unresolved = true;
                }
            }
        }
        if unresolved {
            return Ok(GuardOutcome::Skip(SkipReason::GuardUnresolved));
        }

        for guard in resolved {
            let holds = match guard {
                Resolved::Membership {
                    input,
                    operator,
                    values,
                } => {
                    let found = values.iter().any(|v| v == &input);
                    match operator {
                        WhenOperator::In => found,
                        WhenOperator::NotIn => !found,
                    }
                }
                Resolved::Cel(expr) => {
                    match self.evaluator.evaluate(&expr, &substitutor.variables()) {
                        Ok(b) => b,
                        Err(e) => {
                            debug!(task, expr = %expr, error = %e, "guard expression failed");
                            return Ok(GuardOutcome::Skip(SkipReason::GuardUnresolved));
                        }
                    }
                }
            };
            if !holds {
                debug!(task, "guard evaluated to false");
                return Ok(GuardOutcome::Skip(SkipReason::WhenExpressionsFalse));
            }
        }

        Ok(GuardOutcome::Run)
    }
}

fn resolve(guard: &WhenExpression, substitutor: &Substitutor<'_>) -> Result<Resolved, SubstitutionError> {
    match guard {
        WhenExpression::Membership {
            input,
            operator,
            values,
        } => {
            let input = substitutor.substitute_str(input)?;
            let values = match substitutor.substitute_value(&ParamValue::Array(values.clone()))? {
                ParamValue::Array(values) => values,
                other => vec![other.render()],
            };
            Ok(Resolved::Membership {
                input,
                operator: *operator,
                values,
            })
        }
        WhenExpression::Cel { cel } => substitutor.substitute_str(cel).map(Resolved::Cel),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::BuiltinEvaluator;
    use crate::substitution::{ResultLookup, RunContext, RunState};
    use std::collections::HashMap;

    struct NoResults {
        skipped: bool,
    }

    impl RunState for NoResults {
        fn result(&self, _task: &str, _name: &str) -> ResultLookup<'_> {
            if self.skipped {
                ResultLookup::ProducerSkipped
            } else {
                ResultLookup::Missing
            }
        }
        fn task_state(&self, _task: &str) -> Option<&'static str> {
            None
        }
        fn task_reason(&self, _task: &str) -> Option<String> {
            None
        }
        fn aggregate_state(&self) -> &'static str {
            "None"
        }
        fn visible_results(&self) -> Vec<(String, String, ParamValue)> {
            Vec::new()
        }
        fn task_states(&self) -> Vec<(String, &'static str)> {
            Vec::new()
        }
    }

    fn check(guards: &[WhenExpression]) -> Result<GuardOutcome, SubstitutionError> {
        let mut params = HashMap::new();
        params.insert("env".to_string(), ParamValue::from("staging"));
        params.insert("regions".to_string(), ParamValue::from(vec!["eu", "us"]));
        let context = RunContext::default();
        let workspaces = HashMap::new();
        let state = NoResults { skipped: true };
        let substitutor = Substitutor::new(&params, &context, &workspaces, &state);
        GuardEvaluator::new(&BuiltinEvaluator).evaluate("t", guards, &substitutor)
    }

    #[test]
    fn test_membership() {
        let runs = WhenExpression::membership("$(params.env)", WhenOperator::In, &["staging", "dev"]);
        assert_eq!(check(&[runs]).unwrap(), GuardOutcome::Run);

        let skips = WhenExpression::membership("$(params.env)", WhenOperator::In, &["prod"]);
        assert_eq!(
            check(&[skips]).unwrap(),
            GuardOutcome::Skip(SkipReason::WhenExpressionsFalse)
        );

        let notin = WhenExpression::membership("$(params.env)", WhenOperator::NotIn, &["prod"]);
        assert_eq!(check(&[notin]).unwrap(), GuardOutcome::Run);
    }

    #[test]
    fn test_membership_with_spliced_values() {
        let guard = WhenExpression::membership("us", WhenOperator::In, &["$(params.regions[*])"]);
        assert_eq!(check(&[guard]).unwrap(), GuardOutcome::Run);
    }

    #[test]
    fn test_all_guards_must_hold() {
        let guards = [
            WhenExpression::membership("a", WhenOperator::In, &["a"]),
            WhenExpression::cel("'$(params.env)' == 'prod'"),
        ];
        assert_eq!(
            check(&guards).unwrap(),
            GuardOutcome::Skip(SkipReason::WhenExpressionsFalse)
        );
    }

    #[test]
    fn test_cel_uses_bindings() {
        let guard = WhenExpression::cel("'eu' in params.regions && params.env.startsWith('stag')");
        assert_eq!(check(&[guard]).unwrap(), GuardOutcome::Run);
    }

    #[test]
    fn test_unresolved_guard_skips() {
        let bad_index = WhenExpression::membership("$(params.regions[9])", WhenOperator::In, &["x"]);
        assert_eq!(
            check(&[bad_index]).unwrap(),
            GuardOutcome::Skip(SkipReason::GuardUnresolved)
        );

        let bad_expr = WhenExpression::cel("params.env >");
        assert_eq!(
            check(&[bad_expr]).unwrap(),
            GuardOutcome::Skip(SkipReason::GuardUnresolved)
        );
    }

    #[test]
    fn test_missing_result_is_returned() {
        let guard = WhenExpression::membership(
            "$(tasks.scan.results.ok)",
            WhenOperator::In,
            &["true"],
        );
        let err = check(&[guard]).unwrap_err();
        assert!(matches!(
            err,
            SubstitutionError::MissingResult {
                producer_skipped: true,
                ..
            }
        ));
    }
}
