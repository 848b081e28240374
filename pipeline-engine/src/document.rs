// Graph Document
// Versioned envelope around a graph spec, and the structural validator

use crate::config::{EngineConfig, RunOptions, Timeouts, WorkspaceInput};
use crate::model::{GraphSpec, Param, ParamSpec, TaskNode};
use crate::resolver::ExecutionGraph;

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use thiserror::Error;

/// API versions the engine understands
pub const API_VERSIONS: &[&str] = &["tekton.dev/v1", "tekton.dev/v1beta1"];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Metadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generate_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

/// Spec of a `PipelineRun` document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RunSpec {
    pub pipeline_spec: GraphSpec,
    #[serde(default)]
    pub params: Vec<Param>,
    #[serde(default)]
    pub workspaces: Vec<WorkspaceInput>,
    #[serde(default)]
    pub timeouts: Timeouts,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum DocumentSpec {
    Run(RunSpec),
    Graph(GraphSpec),
}

/// A graph definition as it arrives from outside.
///
/// Decoding is strict: an unknown key anywhere in the document is an error.
/// `kind` picks the spec shape; without one, a `pipelineSpec` key marks a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", try_from = "RawDocument")]
pub struct GraphDocument {
    #[serde(default)]
    pub api_version: Option<String>,
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
    pub spec: DocumentSpec,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RawDocument {
    #[serde(default)]
    api_version: Option<String>,
    #[serde(default)]
    kind: Option<String>,
    #[serde(default)]
    metadata: Metadata,
    spec: serde_yaml::Value,
}

impl TryFrom<RawDocument> for GraphDocument {
    type Error = String;

    fn try_from(raw: RawDocument) -> Result<Self, Self::Error> {
        let is_run = match raw.kind.as_deref() {
            Some(kind) => kind == "PipelineRun",
            None => raw.spec.get("pipelineSpec").is_some(),
        };
        let spec = if is_run {
            serde_yaml::from_value(raw.spec)
                .map(DocumentSpec::Run)
                .map_err(|e| format!("spec: {}", e))?
        } else {
            serde_yaml::from_value(raw.spec)
                .map(DocumentSpec::Graph)
                .map_err(|e| format!("spec: {}", e))?
        };
        Ok(Self {
            api_version: raw.api_version,
            kind: raw.kind,
            metadata: raw.metadata,
            spec,
        })
    }
}

#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl GraphDocument {
    pub fn from_yaml(content: &str) -> Result<Self, DocumentError> {
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn from_json(content: &str) -> Result<Self, DocumentError> {
        Ok(serde_json::from_str(content)?)
    }

    /// A `Pipeline` document wrapping the given graph
    pub fn pipeline(name: impl Into<String>, spec: GraphSpec) -> Self {
        Self {
            api_version: Some(API_VERSIONS[0].to_string()),
            kind: Some("Pipeline".to_string()),
            metadata: Metadata {
                name: Some(name.into()),
                ..Metadata::default()
            },
            spec: DocumentSpec::Graph(spec),
        }
    }

    pub fn graph(&self) -> &GraphSpec {
        match &self.spec {
            DocumentSpec::Run(run) => &run.pipeline_spec,
            DocumentSpec::Graph(graph) => graph,
        }
    }

    /// Fill a missing name from `generateName` plus a random suffix
    pub fn ensure_name(&mut self) -> Option<&str> {
        if self.metadata.name.is_none() {
            if let Some(prefix) = &self.metadata.generate_name {
                let suffix = uuid::Uuid::new_v4().simple().to_string();
                self.metadata.name = Some(format!("{}{}", prefix, &suffix[..5]));
            }
        }
        self.metadata.name.as_deref()
    }

    /// Run inputs carried by the document
    pub fn run_options(&self) -> RunOptions {
        let mut options = RunOptions::new();
        if let Some(namespace) = &self.metadata.namespace {
            options = options.with_namespace(namespace);
        }
        match &self.spec {
            DocumentSpec::Graph(_) => {
                if let Some(name) = &self.metadata.name {
                    options = options.with_pipeline_name(name);
                }
            }
            DocumentSpec::Run(run) => {
                if let Some(name) = &self.metadata.name {
                    options = options.with_name(name).with_pipeline_name(name);
                }
                for param in &run.params {
                    options = options.with_param(&param.name, param.value.clone());
                }
                options.workspaces = run.workspaces.clone();
                options.timeouts = run.timeouts;
            }
        }
        options
    }
}

/// A single problem found in a document
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{path}: {message}")]
pub struct ValidationError {
    pub path: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationOutcome {
    pub errors: Vec<ValidationError>,
}

impl ValidationOutcome {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Exit code for command-line callers
    pub fn exit_code(&self) -> i32 {
        if self.is_valid() {
            0
        } else {
            1
        }
    }

    pub fn message(&self) -> String {
        if self.is_valid() {
            return "document is valid".to_string();
        }
        self.errors
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Decides whether a document may be run
pub trait DocumentValidator {
    fn validate(&self, document: &GraphDocument) -> ValidationOutcome;
}

/// Checks the envelope, names and references, then resolves the graph
#[derive(Debug, Clone, Default)]
pub struct StructuralValidator {
    config: EngineConfig,
}

impl StructuralValidator {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    fn check_envelope(&self, document: &GraphDocument, errors: &mut Vec<ValidationError>) {
        match document.api_version.as_deref() {
            Some(version) if API_VERSIONS.contains(&version) => {}
            Some(version) => errors.push(ValidationError::new(
                "apiVersion",
                format!("unsupported apiVersion '{}'", version),
            )),
            None => errors.push(ValidationError::new("apiVersion", "apiVersion is required")),
        }

        match (document.kind.as_deref(), &document.spec) {
            (Some("Pipeline"), DocumentSpec::Graph(_)) => {}
            (Some("PipelineRun"), DocumentSpec::Run(_)) => {}
            (Some("Pipeline"), DocumentSpec::Run(_)) => errors.push(ValidationError::new(
                "spec",
                "a Pipeline spec cannot carry pipelineSpec",
            )),
            (Some("PipelineRun"), DocumentSpec::Graph(_)) => errors.push(ValidationError::new(
                "spec.pipelineSpec",
                "a PipelineRun needs an embedded pipelineSpec",
            )),
            (Some(kind), _) => errors.push(ValidationError::new(
                "kind",
                format!("unsupported kind '{}'", kind),
            )),
            (None, _) => errors.push(ValidationError::new("kind", "kind is required")),
        }

        match (&document.metadata.name, &document.metadata.generate_name) {
            (Some(name), _) => check_name(name, "metadata.name", errors),
            (None, Some(prefix)) => check_name(prefix, "metadata.generateName", errors),
            (None, None) => errors.push(ValidationError::new(
                "metadata",
                "either name or generateName is required",
            )),
        }
    }

    fn check_graph(&self, graph: &GraphSpec, path: &str, errors: &mut Vec<ValidationError>) {
        let mut params = HashSet::new();
        for (i, param) in graph.params.iter().enumerate() {
            let at = format!("{}.params[{}]", path, i);
            check_name(&param.name, &at, errors);
            if !params.insert(param.name.as_str()) {
                errors.push(ValidationError::new(
                    &at,
                    format!("duplicate parameter '{}'", param.name),
                ));
            }
            check_default(param, &at, errors);
        }

        let mut names = HashSet::new();
        let tasks = graph
            .tasks
            .iter()
            .enumerate()
            .map(|(i, t)| (format!("{}.tasks[{}]", path, i), t))
            .chain(
                graph
                    .finally
                    .iter()
                    .enumerate()
                    .map(|(i, t)| (format!("{}.finally[{}]", path, i), t)),
            );
        for (at, task) in tasks {
            check_name(&task.name, &at, errors);
            if !names.insert(task.name.as_str()) {
                errors.push(ValidationError::new(
                    &at,
                    format!("duplicate task name '{}'", task.name),
                ));
            }
            self.check_task(task, &at, errors);
        }
    }

    fn check_task(&self, task: &TaskNode, path: &str, errors: &mut Vec<ValidationError>) {
        let sources = [
            task.task_ref.as_ref().map(|r| !r.name.is_empty()).unwrap_or(false),
            task.task_spec.is_some(),
            task.pipeline_spec.is_some(),
        ];
        match sources.iter().filter(|s| **s).count() {
            0 => errors.push(ValidationError::new(
                path,
                format!("task '{}' needs a taskRef, taskSpec or pipelineSpec", task.name),
            )),
            1 => {}
            _ => errors.push(ValidationError::new(
                path,
                format!(
                    "task '{}' must set only one of taskRef, taskSpec and pipelineSpec",
                    task.name
                ),
            )),
        }

        if let Some(child) = &task.pipeline_spec {
            self.check_graph(child, &format!("{}.pipelineSpec", path), errors);
        }
    }
}

impl DocumentValidator for StructuralValidator {
    fn validate(&self, document: &GraphDocument) -> ValidationOutcome {
        let mut errors = Vec::new();
        self.check_envelope(document, &mut errors);
        self.check_graph(document.graph(), "spec", &mut errors);

        if let DocumentSpec::Run(run) = &document.spec {
            for (i, param) in run.params.iter().enumerate() {
                let at = format!("spec.params[{}]", i);
                match run.pipeline_spec.params.iter().find(|p| p.name == param.name) {
                    Some(decl) => {
                        if let Err(message) = decl.check(&param.value) {
                            errors.push(ValidationError::new(at, message));
                        }
                    }
                    None => errors.push(ValidationError::new(
                        at,
                        format!("parameter '{}' is not declared", param.name),
                    )),
                }
            }
        }

        // Graph errors are only meaningful once the structure is sound
        if errors.is_empty() {
            if let Err(e) = ExecutionGraph::resolve(document.graph(), &self.config) {
                errors.push(ValidationError::new("spec", e.to_string()));
            }
        }

        ValidationOutcome { errors }
    }
}

/// Lowercase alphanumerics and '-', starting with a letter
pub fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_lowercase() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

fn check_name(name: &str, path: &str, errors: &mut Vec<ValidationError>) {
    if !is_valid_name(name) {
        errors.push(ValidationError::new(
            path,
            format!(
                "invalid name '{}': use lowercase letters, digits and '-', starting with a letter",
                name
            ),
        ));
    }
}

fn check_default(param: &ParamSpec, path: &str, errors: &mut Vec<ValidationError>) {
    if let Some(default) = &param.default {
        if let Err(message) = param.check(default) {
            errors.push(ValidationError::new(
                format!("{}.default", path),
                message,
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ParamKind, ParamValue};

    const PIPELINE: &str = r#"
apiVersion: tekton.dev/v1
kind: Pipeline
metadata:
  name: build-and-test
spec:
  params:
    - name: revision
      type: string
      default: main
  tasks:
    - name: fetch
      taskRef:
        name: git-clone
      params:
        - name: revision
          value: $(params.revision)
    - name: build
      runAfter: [fetch]
      taskRef:
        name: compile
  finally:
    - name: notify
      taskRef:
        name: slack
"#;

    #[test]
    fn test_parse_pipeline_document() {
        let doc = GraphDocument::from_yaml(PIPELINE).unwrap();
        assert_eq!(doc.kind.as_deref(), Some("Pipeline"));
        assert_eq!(doc.graph().tasks.len(), 2);
        assert_eq!(doc.graph().finally.len(), 1);

        let outcome = StructuralValidator::default().validate(&doc);
        assert!(outcome.is_valid(), "{}", outcome.message());
        assert_eq!(outcome.exit_code(), 0);

        let options = doc.run_options();
        assert_eq!(options.pipeline_name.as_deref(), Some("build-and-test"));
    }

    #[test]
    fn test_parse_run_document() {
        let yaml = r#"
apiVersion: tekton.dev/v1
kind: PipelineRun
metadata:
  generateName: nightly-
  namespace: ci
spec:
  params:
    - name: env
      value: staging
  timeouts:
    pipeline: 1h
    finally: 10m
  pipelineSpec:
    params:
      - name: env
    tasks:
      - name: deploy
        taskRef:
          name: kubectl-apply
"#;
        let mut doc = GraphDocument::from_yaml(yaml).unwrap();
        assert!(matches!(doc.spec, DocumentSpec::Run(_)));

        let name = doc.ensure_name().unwrap().to_string();
        assert!(name.starts_with("nightly-"));
        assert_eq!(name.len(), "nightly-".len() + 5);

        let options = doc.run_options();
        assert_eq!(options.name.as_deref(), Some(name.as_str()));
        assert_eq!(options.namespace.as_deref(), Some("ci"));
        assert_eq!(options.params.get("env"), Some(&ParamValue::from("staging")));
        assert_eq!(
            options.timeouts.finally,
            Some(std::time::Duration::from_secs(600))
        );

        assert!(StructuralValidator::default().validate(&doc).is_valid());
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let misspelled = PIPELINE.replace("runAfter: [fetch]", "runAftr: [fetch]");
        let err = GraphDocument::from_yaml(&misspelled).unwrap_err();
        assert!(err.to_string().contains("runAftr"), "{}", err);

        let extra = format!("{}status: {{}}\n", PIPELINE);
        assert!(GraphDocument::from_yaml(&extra).is_err());

        let labelled = PIPELINE.replace(
            "  name: build-and-test",
            "  name: build-and-test\n  labels:\n    team: ci",
        );
        let doc = GraphDocument::from_yaml(&labelled).unwrap();
        assert_eq!(doc.metadata.labels.get("team").map(String::as_str), Some("ci"));
    }

    #[test]
    fn test_kind_picks_spec_shape() {
        let json = r#"{"apiVersion":"tekton.dev/v1","metadata":{"name":"adhoc"},
            "spec":{"pipelineSpec":{"tasks":[{"name":"a","taskRef":{"name":"noop"}}]}}}"#;
        let doc = GraphDocument::from_json(json).unwrap();
        assert!(matches!(doc.spec, DocumentSpec::Run(_)));

        let wrong_kind = PIPELINE.replace("kind: Pipeline", "kind: PipelineRun");
        assert!(GraphDocument::from_yaml(&wrong_kind).is_err());
    }

    #[test]
    fn test_envelope_errors() {
        let mut doc = GraphDocument::pipeline("ok", GraphSpec::new());
        doc.api_version = Some("v2".to_string());
        doc.kind = None;
        doc.metadata.name = None;

        let outcome = StructuralValidator::default().validate(&doc);
        let paths: Vec<&str> = outcome.errors.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["apiVersion", "kind", "metadata"]);
        assert_eq!(outcome.exit_code(), 1);
    }

    #[test]
    fn test_names_and_references() {
        let mut missing_ref = TaskNode::new("deploy", "");
        missing_ref.task_ref = None;
        let spec = GraphSpec::new()
            .with_param(ParamSpec::new("Bad_Name", ParamKind::String))
            .with_task(TaskNode::new("build", "compile"))
            .with_task(TaskNode::new("build", "compile"))
            .with_task(TaskNode::new("9lives", "cat"))
            .with_task(missing_ref);
        let doc = GraphDocument::pipeline("demo", spec);

        let outcome = StructuralValidator::default().validate(&doc);
        let message = outcome.message();
        assert!(message.contains("invalid name 'Bad_Name'"));
        assert!(message.contains("duplicate task name 'build'"));
        assert!(message.contains("invalid name '9lives'"));
        assert!(message.contains("needs a taskRef"));
    }

    #[test]
    fn test_param_kinds_checked() {
        let spec = GraphSpec::new()
            .with_param(ParamSpec::new("targets", ParamKind::Array).with_default("not-an-array"));
        let doc = GraphDocument::pipeline("demo", spec);
        let outcome = StructuralValidator::default().validate(&doc);
        assert_eq!(outcome.errors.len(), 1);
        assert_eq!(outcome.errors[0].path, "spec.params[0].default");
    }

    #[test]
    fn test_graph_errors_reported() {
        let spec = GraphSpec::new()
            .with_task(TaskNode::new("a", "x").run_after(&["b"]))
            .with_task(TaskNode::new("b", "x").run_after(&["a"]));
        let doc = GraphDocument::pipeline("demo", spec);
        let outcome = StructuralValidator::default().validate(&doc);
        assert_eq!(outcome.errors.len(), 1);
        assert!(outcome.errors[0].message.contains("circular dependency"));
    }

    #[test]
    fn test_name_rules() {
        assert!(is_valid_name("build-2"));
        assert!(!is_valid_name("Build"));
        assert!(!is_valid_name("-x"));
        assert!(!is_valid_name(""));
        assert!(!is_valid_name("a_b"));
    }
}
