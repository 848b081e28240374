// Result Collector
// Per-node records for one run; the single source substitution reads from

use crate::model::{ExecutionStatus, ParamValue, SkipReason, Wave};
use crate::resolver::ExecutionGraph;
use crate::substitution::{ResultLookup, RunState};

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

/// One fanned-out instance of a matrix node
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceRecord {
    pub name: String,
    pub index: usize,
    pub params: BTreeMap<String, String>,
    pub status: ExecutionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub attempts: u32,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub results: BTreeMap<String, ParamValue>,
}

/// Everything known about one node
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    pub name: String,
    pub wave: Wave,
    pub status: ExecutionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub attempts: u32,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub results: BTreeMap<String, ParamValue>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub instances: Vec<InstanceRecord>,
    #[serde(
        with = "crate::model::duration::optional",
        skip_serializing_if = "Option::is_none"
    )]
    pub duration: Option<Duration>,
}

impl TaskRecord {
    fn new(name: &str, wave: Wave) -> Self {
        Self {
            name: name.to_string(),
            wave,
            status: ExecutionStatus::Pending,
            reason: None,
            message: None,
            attempts: 0,
            results: BTreeMap::new(),
            instances: Vec::new(),
            duration: None,
        }
    }

    /// Terminal without ever handing an attempt to the executor
    pub fn never_ran(&self) -> bool {
        self.status.is_terminal() && self.attempts == 0
    }
}

/// How a node finished
#[derive(Debug, Clone, Default)]
pub struct Completion {
    pub reason: Option<String>,
    pub message: Option<String>,
    pub attempts: u32,
    pub results: HashMap<String, ParamValue>,
    pub instances: Vec<InstanceRecord>,
    pub duration: Option<Duration>,
}

/// Owns every node record of a run.
///
/// Records are written by the coordinator only, and each node becomes
/// terminal exactly once.
#[derive(Debug, Clone)]
pub struct ResultCollector {
    order: Vec<String>,
    records: HashMap<String, TaskRecord>,
    /// Declared result defaults, when the feature is on
    defaults: HashMap<(String, String), ParamValue>,
}

impl ResultCollector {
    pub fn new(graph: &ExecutionGraph, use_defaults: bool) -> Self {
        let mut order = Vec::new();
        let mut records = HashMap::new();
        let mut defaults = HashMap::new();

        for vertex in graph.vertices() {
            order.push(vertex.name().to_string());
            records.insert(
                vertex.name().to_string(),
                TaskRecord::new(vertex.name(), vertex.wave),
            );
            if use_defaults {
                for result in &vertex.task.results {
                    if let Some(default) = &result.default {
                        defaults.insert(
                            (vertex.name().to_string(), result.name.clone()),
                            default.clone(),
                        );
                    }
                }
            }
        }

        Self {
            order,
            records,
            defaults,
        }
    }

    pub fn record(&self, name: &str) -> Option<&TaskRecord> {
        self.records.get(name)
    }

    /// Records in declaration order
    pub fn records(&self) -> impl Iterator<Item = &TaskRecord> {
        self.order.iter().filter_map(|n| self.records.get(n))
    }

    pub fn is_terminal(&self, name: &str) -> bool {
        self.records
            .get(name)
            .map(|r| r.status.is_terminal())
            .unwrap_or(true)
    }

    pub fn mark_running(&mut self, name: &str) {
        if let Some(record) = self.records.get_mut(name) {
            if record.status == ExecutionStatus::Pending {
                record.status = ExecutionStatus::Running;
            }
        }
    }

    /// Write a terminal status. Returns false if the node was already terminal.
    pub fn complete(&mut self, name: &str, status: ExecutionStatus, completion: Completion) -> bool {
        let Some(record) = self.records.get_mut(name) else {
            return false;
        };
        if record.status.is_terminal() || !status.is_terminal() {
            return false;
        }
        record.status = status;
        record.reason = completion.reason;
        record.message = completion.message;
        record.attempts = completion.attempts;
        record.results = completion.results.into_iter().collect();
        record.instances = completion.instances;
        record.duration = completion.duration;
        true
    }

    /// Mark a node terminal without running it
    pub fn skip(&mut self, name: &str, status: ExecutionStatus, reason: SkipReason) -> bool {
        self.complete(
            name,
            status,
            Completion {
                reason: Some(reason.to_string()),
                ..Completion::default()
            },
        )
    }

    /// Nodes of `wave` that never reached a terminal status
    pub fn unfinished(&self, wave: Wave) -> Vec<String> {
        self.records()
            .filter(|r| r.wave == wave && !r.status.is_terminal())
            .map(|r| r.name.clone())
            .collect()
    }

    fn main_wave(&self) -> impl Iterator<Item = &TaskRecord> {
        self.records().filter(|r| r.wave == Wave::Main)
    }
}

impl RunState for ResultCollector {
    fn result(&self, task: &str, name: &str) -> ResultLookup<'_> {
        let Some(record) = self.records.get(task) else {
            return ResultLookup::Missing;
        };
        match record.status {
            ExecutionStatus::Skipped => return ResultLookup::ProducerSkipped,
            // Cancelled before it ever ran
            ExecutionStatus::Cancelled if record.attempts == 0 => {
                return ResultLookup::ProducerSkipped
            }
            status if !status.is_terminal() => return ResultLookup::Missing,
            _ => {}
        }
        if let Some(value) = record.results.get(name) {
            return ResultLookup::Available(value);
        }
        match self.defaults.get(&(task.to_string(), name.to_string())) {
            Some(default) => ResultLookup::Available(default),
            None => ResultLookup::Missing,
        }
    }

    fn task_state(&self, task: &str) -> Option<&'static str> {
        self.records
            .get(task)
            .filter(|r| r.status.is_terminal())
            .map(|r| r.status.task_state())
    }

    fn task_reason(&self, task: &str) -> Option<String> {
        self.records.get(task).and_then(|r| r.reason.clone())
    }

    fn aggregate_state(&self) -> &'static str {
        let mut cancelled = false;
        let mut all_succeeded = true;
        for record in self.main_wave() {
            if matches!(
                record.status,
                ExecutionStatus::Failed { ignored: false } | ExecutionStatus::TimedOut
            ) {
                return "Failed";
            }
            cancelled |= record.status == ExecutionStatus::Cancelled;
            all_succeeded &= record.status == ExecutionStatus::Succeeded;
        }
        if cancelled {
            "None"
        } else if all_succeeded {
            "Succeeded"
        } else {
            "Completed"
        }
    }

    fn visible_results(&self) -> Vec<(String, String, ParamValue)> {
        let mut visible = Vec::new();
        for record in self.records().filter(|r| r.status.is_terminal()) {
            for (name, value) in &record.results {
                visible.push((record.name.clone(), name.clone(), value.clone()));
            }
        }
        visible
    }

    fn task_states(&self) -> Vec<(String, &'static str)> {
        self.main_wave()
            .filter(|r| r.status.is_terminal())
            .map(|r| (r.name.clone(), r.status.task_state()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::model::{GraphSpec, TaskNode};

    fn collector(use_defaults: bool) -> ResultCollector {
        let spec = GraphSpec::new()
            .with_task(TaskNode::new("build", "compile").with_result_default("digest", "none"))
            .with_task(TaskNode::new("test", "unit"))
            .with_finally(TaskNode::new("notify", "slack"));
        let graph = ExecutionGraph::resolve(&spec, &EngineConfig::default()).unwrap();
        ResultCollector::new(&graph, use_defaults)
    }

    fn with_result(name: &str, value: &str) -> Completion {
        let mut results = HashMap::new();
        results.insert(name.to_string(), ParamValue::from(value));
        Completion {
            attempts: 1,
            results,
            ..Completion::default()
        }
    }

    #[test]
    fn test_results_visible_once_terminal() {
        let mut c = collector(false);
        assert_eq!(c.result("build", "digest"), ResultLookup::Missing);

        c.mark_running("build");
        assert_eq!(c.result("build", "digest"), ResultLookup::Missing);

        assert!(c.complete("build", ExecutionStatus::Succeeded, with_result("digest", "abc")));
        assert_eq!(
            c.result("build", "digest"),
            ResultLookup::Available(&ParamValue::from("abc"))
        );
        assert_eq!(c.result("build", "other"), ResultLookup::Missing);
    }

    #[test]
    fn test_terminal_written_once() {
        let mut c = collector(false);
        assert!(c.complete("build", ExecutionStatus::Succeeded, with_result("digest", "abc")));
        assert!(!c.skip("build", ExecutionStatus::Skipped, SkipReason::WhenExpressionsFalse));
        assert_eq!(c.record("build").unwrap().status, ExecutionStatus::Succeeded);
    }

    #[test]
    fn test_skipped_producer() {
        let mut c = collector(false);
        c.skip("build", ExecutionStatus::Skipped, SkipReason::WhenExpressionsFalse);
        assert_eq!(c.result("build", "digest"), ResultLookup::ProducerSkipped);
        assert!(c.record("build").unwrap().never_ran());
        assert_eq!(
            c.task_reason("build").as_deref(),
            Some("WhenExpressionsFalse")
        );
    }

    #[test]
    fn test_result_defaults() {
        let mut c = collector(true);
        c.complete("build", ExecutionStatus::Succeeded, Completion::default());
        assert_eq!(
            c.result("build", "digest"),
            ResultLookup::Available(&ParamValue::from("none"))
        );

        let mut c = collector(false);
        c.complete("build", ExecutionStatus::Succeeded, Completion::default());
        assert_eq!(c.result("build", "digest"), ResultLookup::Missing);
    }

    #[test]
    fn test_aggregate_state() {
        let mut c = collector(false);
        c.complete("build", ExecutionStatus::Succeeded, Completion::default());
        c.complete("test", ExecutionStatus::Succeeded, Completion::default());
        assert_eq!(c.aggregate_state(), "Succeeded");

        let mut c = collector(false);
        c.complete("build", ExecutionStatus::Succeeded, Completion::default());
        c.skip("test", ExecutionStatus::Skipped, SkipReason::WhenExpressionsFalse);
        assert_eq!(c.aggregate_state(), "Completed");

        let mut c = collector(false);
        c.complete("build", ExecutionStatus::Failed { ignored: true }, Completion::default());
        c.complete("test", ExecutionStatus::Succeeded, Completion::default());
        assert_eq!(c.aggregate_state(), "Completed");

        let mut c = collector(false);
        c.complete("build", ExecutionStatus::Failed { ignored: false }, Completion::default());
        c.skip("test", ExecutionStatus::Cancelled, SkipReason::ParentTasksFailed);
        assert_eq!(c.aggregate_state(), "Failed");
        assert_eq!(
            c.task_states(),
            vec![
                ("build".to_string(), "Failed"),
                ("test".to_string(), "None")
            ]
        );
    }

    #[test]
    fn test_unfinished() {
        let mut c = collector(false);
        c.complete("build", ExecutionStatus::Succeeded, Completion::default());
        assert_eq!(c.unfinished(Wave::Main), vec!["test".to_string()]);
        assert_eq!(c.unfinished(Wave::Finally), vec!["notify".to_string()]);
    }
}
