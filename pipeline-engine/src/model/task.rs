// Task Model
// Task nodes, guards, matrix specs and the graph that holds them

use crate::model::duration;
use crate::model::params::{Param, ParamKind, ParamSpec, ParamValue};

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A declarative graph of task nodes
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct GraphSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Pipeline parameter declarations
    #[serde(default)]
    pub params: Vec<ParamSpec>,

    /// Workspace declarations
    #[serde(default)]
    pub workspaces: Vec<WorkspaceDecl>,

    /// Main wave
    #[serde(default)]
    pub tasks: Vec<TaskNode>,

    /// Cleanup wave, run after the main wave settles
    #[serde(default)]
    pub finally: Vec<TaskNode>,

    /// Run-level results computed from task results
    #[serde(default)]
    pub results: Vec<PipelineResult>,
}

impl GraphSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_param(mut self, param: ParamSpec) -> Self {
        self.params.push(param);
        self
    }

    pub fn with_task(mut self, task: TaskNode) -> Self {
        self.tasks.push(task);
        self
    }

    pub fn with_finally(mut self, task: TaskNode) -> Self {
        self.finally.push(task);
        self
    }

    pub fn with_result(mut self, name: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.results.push(PipelineResult {
            name: name.into(),
            kind: None,
            value: value.into(),
            description: None,
        });
        self
    }

    pub fn with_workspace(mut self, name: impl Into<String>, optional: bool) -> Self {
        self.workspaces.push(WorkspaceDecl {
            name: name.into(),
            description: None,
            optional,
        });
        self
    }

    /// Look up a task in either wave
    pub fn task(&self, name: &str) -> Option<&TaskNode> {
        self.tasks
            .iter()
            .chain(self.finally.iter())
            .find(|t| t.name == name)
    }
}

/// Workspace declared by a graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct WorkspaceDecl {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// An optional workspace may be left unbound by the run
    #[serde(default)]
    pub optional: bool,
}

/// Run-level result expression
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineResult {
    pub name: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<ParamKind>,
    pub value: ParamValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Reference to an externally resolved executable unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskRef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

/// What a task node executes
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Executable<'a> {
    /// Opaque reference handed to the executor
    Ref(&'a TaskRef),
    /// Inline task body handed to the executor
    Inline(&'a serde_json::Value),
    /// Embedded graph run by a child engine
    Graph(&'a GraphSpec),
}

/// Failure policy of a task node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OnError {
    #[default]
    StopAndFail,
    Continue,
}

/// Membership operator of a guard
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WhenOperator {
    In,
    NotIn,
}

/// A guard gating a task node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged, deny_unknown_fields)]
pub enum WhenExpression {
    Membership {
        input: String,
        operator: WhenOperator,
        values: Vec<String>,
    },
    Cel {
        cel: String,
    },
}

impl WhenExpression {
    pub fn membership(input: impl Into<String>, operator: WhenOperator, values: &[&str]) -> Self {
        WhenExpression::Membership {
            input: input.into(),
            operator,
            values: values.iter().map(|v| v.to_string()).collect(),
        }
    }

    pub fn cel(expr: impl Into<String>) -> Self {
        WhenExpression::Cel { cel: expr.into() }
    }

    /// Every template string this guard carries
    pub fn templates(&self) -> Vec<&str> {
        match self {
            WhenExpression::Membership { input, values, .. } => std::iter::once(input.as_str())
                .chain(values.iter().map(String::as_str))
                .collect(),
            WhenExpression::Cel { cel } => vec![cel.as_str()],
        }
    }
}

/// Workspace binding on a task node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct WorkspaceBinding {
    /// Name the task knows the workspace by
    pub name: String,

    /// Pipeline workspace it maps to (defaults to `name`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_path: Option<String>,
}

impl WorkspaceBinding {
    pub fn target(&self) -> &str {
        self.workspace.as_deref().unwrap_or(&self.name)
    }
}

/// Fan-out specification
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MatrixSpec {
    /// Parameters whose array values are combined
    #[serde(default)]
    pub params: Vec<Param>,

    /// Explicit combinations merged into or appended to the product
    #[serde(default)]
    pub include: Vec<MatrixInclude>,
}

/// One explicit matrix combination
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MatrixInclude {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub params: Vec<Param>,
}

/// Result declared by a task node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskResultSpec {
    pub name: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<ParamKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Used in place of a missing value when result defaults are enabled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<ParamValue>,
}

/// A named unit of work in either wave
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TaskNode {
    /// Unique across both waves
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_ref: Option<TaskRef>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_spec: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline_spec: Option<Box<GraphSpec>>,

    #[serde(default)]
    pub params: Vec<Param>,

    /// Ordering dependencies
    #[serde(default)]
    pub run_after: Vec<String>,

    /// Guards; all must hold
    #[serde(default)]
    pub when: Vec<WhenExpression>,

    #[serde(default)]
    pub retries: u32,

    #[serde(
        default,
        with = "duration::optional",
        skip_serializing_if = "Option::is_none"
    )]
    pub timeout: Option<Duration>,

    #[serde(default)]
    pub on_error: OnError,

    #[serde(default)]
    pub workspaces: Vec<WorkspaceBinding>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matrix: Option<MatrixSpec>,

    #[serde(default)]
    pub results: Vec<TaskResultSpec>,
}

impl TaskNode {
    /// A node referencing an external executable unit by name
    pub fn new(name: impl Into<String>, task_ref: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            task_ref: Some(TaskRef {
                name: task_ref.into(),
                kind: None,
            }),
            task_spec: None,
            pipeline_spec: None,
            params: Vec::new(),
            run_after: Vec::new(),
            when: Vec::new(),
            retries: 0,
            timeout: None,
            on_error: OnError::StopAndFail,
            workspaces: Vec::new(),
            matrix: None,
            results: Vec::new(),
        }
    }

    /// A node running an embedded graph
    pub fn embedded(name: impl Into<String>, graph: GraphSpec) -> Self {
        let mut node = Self::new(name, "");
        node.task_ref = None;
        node.pipeline_spec = Some(Box::new(graph));
        node
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.params.push(Param::new(name, value));
        self
    }

    pub fn run_after(mut self, names: &[&str]) -> Self {
        self.run_after.extend(names.iter().map(|n| n.to_string()));
        self
    }

    pub fn with_when(mut self, guard: WhenExpression) -> Self {
        self.when.push(guard);
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_on_error(mut self, on_error: OnError) -> Self {
        self.on_error = on_error;
        self
    }

    pub fn with_workspace(mut self, name: impl Into<String>, workspace: impl Into<String>) -> Self {
        self.workspaces.push(WorkspaceBinding {
            name: name.into(),
            workspace: Some(workspace.into()),
            sub_path: None,
        });
        self
    }

    pub fn with_matrix(mut self, matrix: MatrixSpec) -> Self {
        self.matrix = Some(matrix);
        self
    }

    pub fn with_result(mut self, name: impl Into<String>) -> Self {
        self.results.push(TaskResultSpec {
            name: name.into(),
            kind: None,
            description: None,
            default: None,
        });
        self
    }

    pub fn with_result_default(
        mut self,
        name: impl Into<String>,
        default: impl Into<ParamValue>,
    ) -> Self {
        self.results.push(TaskResultSpec {
            name: name.into(),
            kind: None,
            description: None,
            default: Some(default.into()),
        });
        self
    }

    /// The executable this node points at, if exactly one is set
    pub fn executable(&self) -> Option<Executable<'_>> {
        match (&self.task_ref, &self.task_spec, &self.pipeline_spec) {
            (Some(r), None, None) if !r.name.is_empty() => Some(Executable::Ref(r)),
            (None, Some(spec), None) => Some(Executable::Inline(spec)),
            (None, None, Some(graph)) => Some(Executable::Graph(graph)),
            _ => None,
        }
    }

    pub fn result_default(&self, result: &str) -> Option<&ParamValue> {
        self.results
            .iter()
            .find(|r| r.name == result)
            .and_then(|r| r.default.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_task_node() {
        let yaml = r#"
name: build
taskRef:
  name: golang-build
params:
  - name: package
    value: ./cmd/...
  - name: flags
    value: ["-v", "-race"]
runAfter: [fetch]
when:
  - input: $(params.env)
    operator: in
    values: [prod]
  - cel: "'$(params.branch)' == 'main'"
retries: 2
timeout: 1m30s
onError: continue
"#;
        let node: TaskNode = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(node.name, "build");
        assert_eq!(node.params.len(), 2);
        assert_eq!(node.params[1].value, ParamValue::from(vec!["-v", "-race"]));
        assert_eq!(node.run_after, vec!["fetch"]);
        assert!(matches!(
            node.when[0],
            WhenExpression::Membership {
                operator: WhenOperator::In,
                ..
            }
        ));
        assert!(matches!(node.when[1], WhenExpression::Cel { .. }));
        assert_eq!(node.timeout, Some(Duration::from_secs(90)));
        assert_eq!(node.on_error, OnError::Continue);
        assert!(matches!(node.executable(), Some(Executable::Ref(_))));
    }

    #[test]
    fn test_executable_requires_exactly_one() {
        let mut node = TaskNode::new("a", "echo");
        node.task_spec = Some(serde_json::json!({"steps": []}));
        assert!(node.executable().is_none());

        node.task_ref = None;
        assert!(matches!(node.executable(), Some(Executable::Inline(_))));

        let embedded = TaskNode::embedded("sub", GraphSpec::new());
        assert!(matches!(embedded.executable(), Some(Executable::Graph(_))));
    }

    #[test]
    fn test_guard_templates() {
        let guard = WhenExpression::membership("$(params.env)", WhenOperator::NotIn, &["a", "b"]);
        assert_eq!(guard.templates(), vec!["$(params.env)", "a", "b"]);
    }

    #[test]
    fn test_graph_lookup_spans_waves() {
        let graph = GraphSpec::new()
            .with_task(TaskNode::new("a", "echo"))
            .with_finally(TaskNode::new("cleanup", "echo"));
        assert!(graph.task("a").is_some());
        assert!(graph.task("cleanup").is_some());
        assert!(graph.task("missing").is_none());
    }
}
