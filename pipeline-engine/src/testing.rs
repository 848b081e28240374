// Scripted Executor
// Deterministic task executor for tests and dry-run simulation

use crate::executor::{OutcomeStatus, TaskExecutor, TaskOutcome, TaskRequest};
use crate::model::{duration, Param, ParamValue};

use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// How a scripted attempt ends
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScriptedStatus {
    #[default]
    Succeeded,
    Failed,
    Cancelled,
    /// Never finishes on its own; only cancellation or a timeout ends it
    Hang,
}

/// Behaviour of one attempt
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptStep {
    #[serde(default)]
    pub status: ScriptedStatus,
    #[serde(default, with = "duration::optional")]
    pub delay: Option<Duration>,
    #[serde(default)]
    pub results: HashMap<String, ParamValue>,
    #[serde(default)]
    pub message: Option<String>,
}

impl ScriptStep {
    pub fn succeed() -> Self {
        Self::default()
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            status: ScriptedStatus::Failed,
            message: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn hang() -> Self {
        Self {
            status: ScriptedStatus::Hang,
            ..Self::default()
        }
    }

    pub fn after(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_result(mut self, name: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.results.insert(name.into(), value.into());
        self
    }

    fn outcome(&self) -> TaskOutcome {
        let status = match self.status {
            ScriptedStatus::Succeeded | ScriptedStatus::Hang => OutcomeStatus::Succeeded,
            ScriptedStatus::Failed => OutcomeStatus::Failed,
            ScriptedStatus::Cancelled => OutcomeStatus::Cancelled,
        };
        TaskOutcome {
            status,
            results: self.results.clone(),
            message: self.message.clone(),
        }
    }
}

/// One recorded attempt
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub task: String,
    pub instance: String,
    pub attempt: u32,
    pub params: Vec<Param>,
    /// Offset from executor creation
    pub started: Duration,
    pub finished: Option<Duration>,
    pub status: Option<OutcomeStatus>,
}

impl Invocation {
    pub fn param(&self, name: &str) -> Option<&ParamValue> {
        self.params.iter().find(|p| p.name == name).map(|p| &p.value)
    }
}

#[derive(Debug, Default)]
struct Journal {
    invocations: Vec<Invocation>,
    active: usize,
    peak: usize,
}

/// Plays back per-task scripts and records every attempt.
///
/// Scripts are looked up by instance name first, then by node name;
/// attempt `n` uses step `n`, repeating the last step. Unscripted tasks
/// succeed immediately.
#[derive(Debug, Clone)]
pub struct ScriptedExecutor {
    scripts: Arc<HashMap<String, Vec<ScriptStep>>>,
    journal: Arc<Mutex<Journal>>,
    origin: Instant,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::from_scripts(HashMap::new())
    }

    pub fn from_scripts(scripts: HashMap<String, Vec<ScriptStep>>) -> Self {
        Self {
            scripts: Arc::new(scripts),
            journal: Arc::new(Mutex::new(Journal::default())),
            origin: Instant::now(),
        }
    }

    /// Append a step to a task's script
    pub fn step(mut self, task: impl Into<String>, step: ScriptStep) -> Self {
        Arc::make_mut(&mut self.scripts)
            .entry(task.into())
            .or_default()
            .push(step);
        self
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.journal().invocations.clone()
    }

    /// Instance names in the order their first attempt started
    pub fn started_order(&self) -> Vec<String> {
        let mut order: Vec<String> = Vec::new();
        for invocation in &self.journal().invocations {
            if !order.contains(&invocation.instance) {
                order.push(invocation.instance.clone());
            }
        }
        order
    }

    pub fn attempts(&self, task: &str) -> usize {
        self.journal()
            .invocations
            .iter()
            .filter(|i| i.task == task)
            .count()
    }

    pub fn was_started(&self, task: &str) -> bool {
        self.attempts(task) > 0
    }

    /// Most attempts that were in flight at once
    pub fn peak_concurrency(&self) -> usize {
        self.journal().peak
    }

    fn journal(&self) -> MutexGuard<'_, Journal> {
        // A poisoned journal only means a test already panicked
        self.journal.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn script_for(&self, request: &TaskRequest) -> ScriptStep {
        let steps = self
            .scripts
            .get(&request.instance)
            .or_else(|| self.scripts.get(&request.task));
        match steps {
            Some(steps) if !steps.is_empty() => {
                let idx = (request.attempt.max(1) as usize - 1).min(steps.len() - 1);
                steps[idx].clone()
            }
            _ => ScriptStep::succeed(),
        }
    }

    fn begin(&self, request: &TaskRequest) -> usize {
        let mut journal = self.journal();
        journal.invocations.push(Invocation {
            task: request.task.clone(),
            instance: request.instance.clone(),
            attempt: request.attempt,
            params: request.params.clone(),
            started: self.origin.elapsed(),
            finished: None,
            status: None,
        });
        journal.active += 1;
        journal.peak = journal.peak.max(journal.active);
        journal.invocations.len() - 1
    }

    fn end(&self, slot: usize, status: OutcomeStatus) {
        let mut journal = self.journal();
        journal.active = journal.active.saturating_sub(1);
        let finished = self.origin.elapsed();
        if let Some(invocation) = journal.invocations.get_mut(slot) {
            invocation.finished = Some(finished);
            invocation.status = Some(status);
        }
    }
}

impl Default for ScriptedExecutor {
    fn default() -> Self {
        Self::new()
    }
}

/// Records the end of an attempt even when the engine drops it mid-flight
struct EndGuard<'a> {
    executor: &'a ScriptedExecutor,
    slot: usize,
    status: OutcomeStatus,
}

impl Drop for EndGuard<'_> {
    fn drop(&mut self) {
        self.executor.end(self.slot, self.status);
    }
}

#[async_trait::async_trait]
impl TaskExecutor for ScriptedExecutor {
    async fn execute(&self, request: TaskRequest, cancel: CancellationToken) -> TaskOutcome {
        let step = self.script_for(&request);
        let slot = self.begin(&request);
        let mut guard = EndGuard {
            executor: self,
            slot,
            status: OutcomeStatus::Cancelled,
        };

        let wait = async {
            match (step.status, step.delay) {
                (ScriptedStatus::Hang, _) => std::future::pending::<()>().await,
                (_, Some(delay)) => tokio::time::sleep(delay).await,
                (_, None) => {}
            }
        };
        let outcome = tokio::select! {
            _ = cancel.cancelled() => TaskOutcome::cancelled(),
            _ = wait => step.outcome(),
        };
        guard.status = outcome.status;
        outcome
    }
}
