// Task Executor
// Boundary between the scheduler and whatever actually runs a task

use crate::model::{Param, ParamValue, TaskRef};
use crate::substitution::RunContext;

use serde::Serialize;
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;

/// What an instance should run
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum TaskTarget {
    Ref(TaskRef),
    Inline(serde_json::Value),
}

impl TaskTarget {
    /// Short label for logs
    pub fn label(&self) -> &str {
        match self {
            TaskTarget::Ref(r) => &r.name,
            TaskTarget::Inline(_) => "<inline>",
        }
    }
}

/// A workspace binding after substitution
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedWorkspace {
    /// Name the task knows the workspace by
    pub name: String,
    /// Run-level workspace it is bound to
    pub workspace: String,
    pub path: Option<String>,
    pub sub_path: Option<String>,
}

/// One attempt of one task instance
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRequest {
    pub run_id: String,
    /// Graph node name
    pub task: String,
    /// Instance name; equals `task` unless the node fans out
    pub instance: String,
    pub matrix_index: Option<usize>,
    pub target: TaskTarget,
    pub params: Vec<Param>,
    pub workspaces: Vec<ResolvedWorkspace>,
    /// 1-based attempt number
    pub attempt: u32,
    pub context: RunContext,
}

impl TaskRequest {
    pub fn param(&self, name: &str) -> Option<&ParamValue> {
        self.params.iter().find(|p| p.name == name).map(|p| &p.value)
    }
}

/// Terminal state an executor reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OutcomeStatus {
    Succeeded,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskOutcome {
    pub status: OutcomeStatus,
    /// Results written by the attempt, even when it failed
    pub results: HashMap<String, ParamValue>,
    pub message: Option<String>,
}

impl TaskOutcome {
    pub fn succeeded() -> Self {
        Self {
            status: OutcomeStatus::Succeeded,
            results: HashMap::new(),
            message: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: OutcomeStatus::Failed,
            results: HashMap::new(),
            message: Some(message.into()),
        }
    }

    pub fn cancelled() -> Self {
        Self {
            status: OutcomeStatus::Cancelled,
            results: HashMap::new(),
            message: None,
        }
    }

    pub fn with_result(mut self, name: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.results.insert(name.into(), value.into());
        self
    }
}

/// Runs one attempt of a task instance.
///
/// The engine owns timeouts and retries. Implementations should watch
/// `cancel` and return promptly once it fires; the engine stops waiting
/// either way.
#[async_trait::async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, request: TaskRequest, cancel: CancellationToken) -> TaskOutcome;
}

/// Succeeds every task without doing any work
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopExecutor;

#[async_trait::async_trait]
impl TaskExecutor for NoopExecutor {
    async fn execute(&self, _request: TaskRequest, _cancel: CancellationToken) -> TaskOutcome {
        TaskOutcome::succeeded()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_builders() {
        let outcome = TaskOutcome::succeeded().with_result("digest", "sha256:abc");
        assert_eq!(outcome.status, OutcomeStatus::Succeeded);
        assert_eq!(
            outcome.results.get("digest"),
            Some(&ParamValue::from("sha256:abc"))
        );

        let failed = TaskOutcome::failed("exit 1");
        assert_eq!(failed.status, OutcomeStatus::Failed);
        assert_eq!(failed.message.as_deref(), Some("exit 1"));
    }

    #[tokio::test]
    async fn test_noop_executor() {
        let request = TaskRequest {
            run_id: "r".to_string(),
            task: "build".to_string(),
            instance: "build".to_string(),
            matrix_index: None,
            target: TaskTarget::Ref(TaskRef {
                name: "compile".to_string(),
                kind: None,
            }),
            params: vec![Param::new("mode", "release")],
            workspaces: Vec::new(),
            attempt: 1,
            context: RunContext::default(),
        };
        assert_eq!(request.param("mode"), Some(&ParamValue::from("release")));
        assert_eq!(request.target.label(), "compile");

        let outcome = NoopExecutor.execute(request, CancellationToken::new()).await;
        assert_eq!(outcome.status, OutcomeStatus::Succeeded);
    }
}
