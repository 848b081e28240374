// Substitution Resolver
// Looks up references and rewrites strings, arrays and objects

use crate::expression::{Value, Variables};
use crate::model::{Param, ParamValue};
use crate::substitution::reference::{scan, ContextVar, Segment, Selector, VarRef, WorkspaceField};
use crate::substitution::{RunContext, SubstitutionError};

use std::collections::{BTreeMap, HashMap};

/// Outcome of looking up a task result
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ResultLookup<'a> {
    Available(&'a ParamValue),
    /// The producer was skipped
    ProducerSkipped,
    /// The producer is not terminal, or terminated without writing the result
    Missing,
}

/// Read-only view of run state consulted during substitution
pub trait RunState {
    fn result(&self, task: &str, name: &str) -> ResultLookup<'_>;

    /// `Succeeded`, `Failed` or `None` for a terminal task
    fn task_state(&self, task: &str) -> Option<&'static str>;

    fn task_reason(&self, task: &str) -> Option<String>;

    /// `Succeeded`, `Failed`, `Completed` or `None` for the main wave
    fn aggregate_state(&self) -> &'static str;

    /// Every `(task, result, value)` currently visible to consumers
    fn visible_results(&self) -> Vec<(String, String, ParamValue)>;

    /// Every terminal task with its state string
    fn task_states(&self) -> Vec<(String, &'static str)>;
}

/// Resolves references for one consumer
pub struct Substitutor<'a> {
    params: &'a HashMap<String, ParamValue>,
    context: &'a RunContext,
    /// Bound workspaces by name, with an optional mount path
    workspaces: &'a HashMap<String, Option<String>>,
    state: &'a dyn RunState,
    retries: Option<u32>,
    allow_status: bool,
}

impl<'a> Substitutor<'a> {
    pub fn new(
        params: &'a HashMap<String, ParamValue>,
        context: &'a RunContext,
        workspaces: &'a HashMap<String, Option<String>>,
        state: &'a dyn RunState,
    ) -> Self {
        Self {
            params,
            context,
            workspaces,
            state,
            retries: None,
            allow_status: false,
        }
    }

    /// Expose `$(context.pipelineTask.retries)`
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    /// Allow `$(tasks.<name>.status)` and friends, for finally nodes
    pub fn with_status_access(mut self) -> Self {
        self.allow_status = true;
        self
    }

    /// Substitute every reference in a string; each must resolve to a string
    pub fn substitute_str(&self, template: &str) -> Result<String, SubstitutionError> {
        let mut out = String::with_capacity(template.len());
        for segment in scan(template)? {
            match segment {
                Segment::Text(text) => out.push_str(&text),
                Segment::Reference { raw, var } => match self.resolve(&var, &raw)? {
                    ParamValue::String(s) => out.push_str(&s),
                    other => {
                        return Err(SubstitutionError::TypeMismatch {
                            reference: raw,
                            message: format!(
                                "{} value cannot be embedded in a string",
                                other.kind()
                            ),
                        })
                    }
                },
            }
        }
        Ok(out)
    }

    /// Substitute a value, keeping whole-value references intact.
    ///
    /// A string consisting of exactly one reference takes that reference's
    /// value and kind. Inside an array, such an element holding an array is
    /// spliced in place.
    pub fn substitute_value(&self, value: &ParamValue) -> Result<ParamValue, SubstitutionError> {
        match value {
            ParamValue::String(s) => match self.sole_reference(s)? {
                Some(resolved) => Ok(resolved),
                None => self.substitute_str(s).map(ParamValue::String),
            },
            ParamValue::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    match self.sole_reference(item)? {
                        Some(ParamValue::Array(spliced)) => out.extend(spliced),
                        Some(ParamValue::String(s)) => out.push(s),
                        Some(ParamValue::Object(_)) => {
                            return Err(SubstitutionError::TypeMismatch {
                                reference: item.clone(),
                                message: "object value cannot be an array element".to_string(),
                            })
                        }
                        None => out.push(self.substitute_str(item)?),
                    }
                }
                Ok(ParamValue::Array(out))
            }
            ParamValue::Object(map) => {
                let mut out = BTreeMap::new();
                for (key, v) in map {
                    out.insert(key.clone(), self.substitute_str(v)?);
                }
                Ok(ParamValue::Object(out))
            }
        }
    }

    pub fn substitute_params(&self, params: &[Param]) -> Result<Vec<Param>, SubstitutionError> {
        params
            .iter()
            .map(|p| {
                Ok(Param {
                    name: p.name.clone(),
                    value: self.substitute_value(&p.value)?,
                })
            })
            .collect()
    }

    /// Resolved value when `template` is exactly one reference
    fn sole_reference(&self, template: &str) -> Result<Option<ParamValue>, SubstitutionError> {
        let segments = scan(template.trim())?;
        match segments.as_slice() {
            [Segment::Reference { raw, var }] => self.resolve(var, raw).map(Some),
            _ => Ok(None),
        }
    }

    /// Look up one reference and apply its selector
    pub fn resolve(&self, var: &VarRef, raw: &str) -> Result<ParamValue, SubstitutionError> {
        match var {
            VarRef::Param { name, selector } => {
                let value = self
                    .params
                    .get(name)
                    .ok_or_else(|| SubstitutionError::UnknownParam(name.clone()))?;
                select(value, selector, raw)
            }
            VarRef::Result {
                task,
                result,
                selector,
            } => match self.state.result(task, result) {
                ResultLookup::Available(value) => select(value, selector, raw),
                ResultLookup::ProducerSkipped => Err(SubstitutionError::MissingResult {
                    task: task.clone(),
                    result: result.clone(),
                    producer_skipped: true,
                }),
                ResultLookup::Missing => Err(SubstitutionError::MissingResult {
                    task: task.clone(),
                    result: result.clone(),
                    producer_skipped: false,
                }),
            },
            VarRef::TaskStatus { task } if self.allow_status => Ok(ParamValue::from(
                self.state.task_state(task).unwrap_or("None"),
            )),
            VarRef::TaskReason { task } if self.allow_status => Ok(ParamValue::from(
                self.state.task_reason(task).unwrap_or_default(),
            )),
            VarRef::AggregateStatus if self.allow_status => {
                Ok(ParamValue::from(self.state.aggregate_state()))
            }
            VarRef::TaskStatus { .. } | VarRef::TaskReason { .. } | VarRef::AggregateStatus => {
                Err(unavailable(raw))
            }
            VarRef::Context(var) => {
                let value = match var {
                    ContextVar::RunName => self.context.run_name.clone(),
                    ContextVar::RunNamespace => self.context.namespace.clone(),
                    ContextVar::RunUid => self.context.run_uid.clone(),
                    ContextVar::PipelineName => self.context.pipeline_name.clone(),
                    ContextVar::TaskRetries => {
                        self.retries.ok_or_else(|| unavailable(raw))?.to_string()
                    }
                };
                Ok(ParamValue::String(value))
            }
            VarRef::Workspace { name, field } => match field {
                WorkspaceField::Bound => Ok(ParamValue::from(
                    self.workspaces.contains_key(name).to_string(),
                )),
                WorkspaceField::Path => self
                    .workspaces
                    .get(name)
                    .cloned()
                    .flatten()
                    .map(ParamValue::String)
                    .ok_or_else(|| unavailable(raw)),
            },
        }
    }

    /// Top-level variables for boolean guard expressions
    pub fn variables(&self) -> Variables {
        let params = self
            .params
            .iter()
            .map(|(k, v)| (k.clone(), Value::from(v)))
            .collect();

        let mut run = BTreeMap::new();
        run.insert("name".to_string(), Value::from(self.context.run_name.as_str()));
        run.insert(
            "namespace".to_string(),
            Value::from(self.context.namespace.as_str()),
        );
        run.insert("uid".to_string(), Value::from(self.context.run_uid.as_str()));
        let mut pipeline = BTreeMap::new();
        pipeline.insert(
            "name".to_string(),
            Value::from(self.context.pipeline_name.as_str()),
        );
        let mut context = BTreeMap::new();
        context.insert("pipelineRun".to_string(), Value::Map(run));
        context.insert("pipeline".to_string(), Value::Map(pipeline));

        let mut tasks: BTreeMap<String, BTreeMap<String, Value>> = BTreeMap::new();
        for (task, name, value) in self.state.visible_results() {
            let entry = tasks.entry(task).or_default();
            let results = entry
                .entry("results".to_string())
                .or_insert_with(|| Value::Map(BTreeMap::new()));
            if let Value::Map(results) = results {
                results.insert(name, Value::from(&value));
            }
        }
        if self.allow_status {
            for (task, state) in self.state.task_states() {
                tasks
                    .entry(task)
                    .or_default()
                    .insert("status".to_string(), Value::from(state));
            }
        }
        let mut tasks: BTreeMap<String, Value> = tasks
            .into_iter()
            .map(|(k, v)| (k, Value::Map(v)))
            .collect();
        if self.allow_status {
            tasks.insert(
                "status".to_string(),
                Value::from(self.state.aggregate_state()),
            );
        }

        let mut variables = Variables::new();
        variables.insert("params".to_string(), Value::Map(params));
        variables.insert("context".to_string(), Value::Map(context));
        variables.insert("tasks".to_string(), Value::Map(tasks));
        variables
    }
}

fn unavailable(raw: &str) -> SubstitutionError {
    SubstitutionError::Unavailable {
        reference: raw.to_string(),
    }
}

fn select(value: &ParamValue, selector: &Selector, raw: &str) -> Result<ParamValue, SubstitutionError> {
    let mismatch = |message: &str| SubstitutionError::TypeMismatch {
        reference: raw.to_string(),
        message: message.to_string(),
    };

    match (selector, value) {
        (Selector::Whole, v) => Ok(v.clone()),
        (Selector::Star, ParamValue::String(_)) => {
            Err(mismatch("[*] requires an array or object value"))
        }
        (Selector::Star, v) => Ok(v.clone()),
        (Selector::Index(i), ParamValue::Array(items)) => items
            .get(*i)
            .map(|s| ParamValue::String(s.clone()))
            .ok_or_else(|| SubstitutionError::IndexOutOfRange {
                reference: raw.to_string(),
                index: *i,
                len: items.len(),
            }),
        (Selector::Index(_), _) => Err(mismatch("indexing requires an array value")),
        (Selector::Key(key), ParamValue::Object(map)) => map
            .get(key)
            .map(|s| ParamValue::String(s.clone()))
            .ok_or_else(|| SubstitutionError::MissingKey {
                reference: raw.to_string(),
                key: key.clone(),
            }),
        (Selector::Key(_), _) => Err(mismatch("key access requires an object value")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct FakeState {
        results: HashMap<(String, String), ParamValue>,
        skipped: Vec<String>,
        states: HashMap<String, &'static str>,
    }

    impl RunState for FakeState {
        fn result(&self, task: &str, name: &str) -> ResultLookup<'_> {
            if self.skipped.iter().any(|t| t == task) {
                return ResultLookup::ProducerSkipped;
            }
            match self.results.get(&(task.to_string(), name.to_string())) {
                Some(v) => ResultLookup::Available(v),
                None => ResultLookup::Missing,
            }
        }

        fn task_state(&self, task: &str) -> Option<&'static str> {
            self.states.get(task).copied()
        }

        fn task_reason(&self, _task: &str) -> Option<String> {
            Some("Succeeded".to_string())
        }

        fn aggregate_state(&self) -> &'static str {
            "Completed"
        }

        fn visible_results(&self) -> Vec<(String, String, ParamValue)> {
            self.results
                .iter()
                .map(|((t, r), v)| (t.clone(), r.clone(), v.clone()))
                .collect()
        }

        fn task_states(&self) -> Vec<(String, &'static str)> {
            self.states.iter().map(|(k, v)| (k.clone(), *v)).collect()
        }
    }

    struct Fixture {
        params: HashMap<String, ParamValue>,
        context: RunContext,
        workspaces: HashMap<String, Option<String>>,
        state: FakeState,
    }

    impl Fixture {
        fn new() -> Self {
            let mut params = HashMap::new();
            params.insert("env".to_string(), ParamValue::from("prod"));
            params.insert("targets".to_string(), ParamValue::from(vec!["linux", "mac"]));
            let mut repo = BTreeMap::new();
            repo.insert("url".to_string(), "https://git.example".to_string());
            params.insert("repo".to_string(), ParamValue::Object(repo));

            let mut state = FakeState::default();
            state.results.insert(
                ("build".to_string(), "digest".to_string()),
                ParamValue::from("sha256:abc"),
            );
            state.results.insert(
                ("build".to_string(), "tags".to_string()),
                ParamValue::from(vec!["v1", "latest"]),
            );
            state.skipped.push("scan".to_string());
            state.states.insert("build".to_string(), "Succeeded");

            let mut workspaces = HashMap::new();
            workspaces.insert("source".to_string(), Some("/workspace/source".to_string()));

            Self {
                params,
                context: RunContext {
                    run_name: "run-1".to_string(),
                    namespace: "ci".to_string(),
                    run_uid: "uid-1".to_string(),
                    pipeline_name: "release".to_string(),
                },
                workspaces,
                state,
            }
        }

        fn substitutor(&self) -> Substitutor<'_> {
            Substitutor::new(&self.params, &self.context, &self.workspaces, &self.state)
        }
    }

    #[test]
    fn test_substitute_str() {
        let f = Fixture::new();
        let s = f.substitutor();
        assert_eq!(
            s.substitute_str("$(context.pipelineRun.name) deploys to $(params.env)")
                .unwrap(),
            "run-1 deploys to prod"
        );
        assert_eq!(s.substitute_str("$(params.targets[1])").unwrap(), "mac");
        assert_eq!(
            s.substitute_str("$(params.repo.url)").unwrap(),
            "https://git.example"
        );
        assert_eq!(s.substitute_str("$(workspaces.source.bound)").unwrap(), "true");
        assert_eq!(s.substitute_str("$(workspaces.cache.bound)").unwrap(), "false");
    }

    #[test]
    fn test_array_cannot_embed_in_string() {
        let f = Fixture::new();
        let err = f
            .substitutor()
            .substitute_str("targets: $(params.targets[*])")
            .unwrap_err();
        assert!(matches!(err, SubstitutionError::TypeMismatch { .. }));
    }

    #[test]
    fn test_whole_value_substitution() {
        let f = Fixture::new();
        let s = f.substitutor();
        assert_eq!(
            s.substitute_value(&ParamValue::from("$(params.targets[*])"))
                .unwrap(),
            ParamValue::from(vec!["linux", "mac"])
        );
        assert_eq!(
            s.substitute_value(&ParamValue::from(vec![
                "first",
                "$(tasks.build.results.tags[*])",
                "$(params.env)",
            ]))
            .unwrap(),
            ParamValue::from(vec!["first", "v1", "latest", "prod"])
        );
    }

    #[test]
    fn test_index_and_key_errors() {
        let f = Fixture::new();
        let s = f.substitutor();
        assert!(matches!(
            s.substitute_str("$(params.targets[5])").unwrap_err(),
            SubstitutionError::IndexOutOfRange { index: 5, len: 2, .. }
        ));
        assert!(matches!(
            s.substitute_str("$(params.repo.branch)").unwrap_err(),
            SubstitutionError::MissingKey { .. }
        ));
        assert!(matches!(
            s.substitute_str("$(params.nope)").unwrap_err(),
            SubstitutionError::UnknownParam(_)
        ));
    }

    #[test]
    fn test_missing_results() {
        let f = Fixture::new();
        let s = f.substitutor();
        assert_eq!(
            s.substitute_str("$(tasks.build.results.digest)").unwrap(),
            "sha256:abc"
        );
        assert_eq!(
            s.substitute_str("$(tasks.scan.results.report)").unwrap_err(),
            SubstitutionError::MissingResult {
                task: "scan".to_string(),
                result: "report".to_string(),
                producer_skipped: true,
            }
        );
        assert_eq!(
            s.substitute_str("$(tasks.build.results.sbom)").unwrap_err(),
            SubstitutionError::MissingResult {
                task: "build".to_string(),
                result: "sbom".to_string(),
                producer_skipped: false,
            }
        );
    }

    #[test]
    fn test_status_only_with_access() {
        let f = Fixture::new();
        assert!(matches!(
            f.substitutor().substitute_str("$(tasks.status)").unwrap_err(),
            SubstitutionError::Unavailable { .. }
        ));

        let s = f.substitutor().with_status_access();
        assert_eq!(s.substitute_str("$(tasks.status)").unwrap(), "Completed");
        assert_eq!(s.substitute_str("$(tasks.build.status)").unwrap(), "Succeeded");
        assert_eq!(s.substitute_str("$(tasks.other.status)").unwrap(), "None");
    }

    #[test]
    fn test_retries_context() {
        let f = Fixture::new();
        assert!(f
            .substitutor()
            .substitute_str("$(context.pipelineTask.retries)")
            .is_err());
        assert_eq!(
            f.substitutor()
                .with_retries(3)
                .substitute_str("$(context.pipelineTask.retries)")
                .unwrap(),
            "3"
        );
    }

    #[test]
    fn test_variables_for_guards() {
        let f = Fixture::new();
        let vars = f.substitutor().with_status_access().variables();
        let Some(Value::Map(tasks)) = vars.get("tasks") else {
            panic!("tasks binding missing");
        };
        assert_eq!(tasks.get("status"), Some(&Value::from("Completed")));
        let Some(Value::Map(build)) = tasks.get("build") else {
            panic!("build binding missing");
        };
        assert_eq!(build.get("status"), Some(&Value::from("Succeeded")));
        assert!(matches!(build.get("results"), Some(Value::Map(_))));
    }
}
