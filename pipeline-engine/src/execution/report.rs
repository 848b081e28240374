// Run Report
// Status aggregation, skip and result manifests, run-level results

use crate::execution::results::{ResultCollector, TaskRecord};
use crate::model::{format_duration, ExecutionStatus, ParamValue, RunStatus};
use crate::resolver::ExecutionGraph;
use crate::substitution::{ResultLookup, RunContext, RunState, Substitutor};

use serde::{Serialize, Serializer};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::Duration;
use tracing::debug;

/// Why a run stopped early
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StopCause {
    /// A stop-and-fail consumer referenced a result that was never written
    InvalidResultReference,
    Cancelled,
    TimedOut,
}

impl StopCause {
    pub fn reason(&self) -> &'static str {
        match self {
            StopCause::InvalidResultReference => "InvalidTaskResultReference",
            StopCause::Cancelled => "Cancelled",
            StopCause::TimedOut => "PipelineRunTimeout",
        }
    }
}

impl fmt::Display for StopCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.reason())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedTask {
    pub name: String,
    pub reason: String,
}

/// Final state of a run
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub run_id: String,
    pub run_name: String,
    pub status: RunStatus,
    pub reason: String,
    /// Every node in declaration order
    pub tasks: Vec<TaskRecord>,
    /// Nodes that became terminal without running
    pub skipped: Vec<SkippedTask>,
    /// Results of nodes that succeeded with all declared results
    pub task_results: BTreeMap<String, BTreeMap<String, ParamValue>>,
    /// Run-level results that could be computed
    pub results: BTreeMap<String, ParamValue>,
    #[serde(serialize_with = "serialize_duration")]
    pub duration: Duration,
}

impl RunReport {
    pub fn task(&self, name: &str) -> Option<&TaskRecord> {
        self.tasks.iter().find(|t| t.name == name)
    }

    pub fn status_of(&self, name: &str) -> Option<ExecutionStatus> {
        self.task(name).map(|t| t.status)
    }

    pub fn reason_of(&self, name: &str) -> Option<&str> {
        self.task(name).and_then(|t| t.reason.as_deref())
    }

    pub fn is_success(&self) -> bool {
        matches!(self.status, RunStatus::Succeeded | RunStatus::Completed)
    }
}

fn serialize_duration<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&format_duration(*duration))
}

/// Final status and reason from the node records and the stop cause
pub fn aggregate_status(
    collector: &ResultCollector,
    stop: Option<StopCause>,
) -> (RunStatus, String) {
    let failed = collector.records().any(|r| r.status.is_failure());
    if let Some(cause) = stop {
        return (RunStatus::Failed, cause.reason().to_string());
    }
    if failed {
        return (RunStatus::Failed, "Failed".to_string());
    }
    if collector
        .records()
        .all(|r| r.status == ExecutionStatus::Succeeded)
    {
        (RunStatus::Succeeded, "Succeeded".to_string())
    } else {
        (RunStatus::Completed, "Completed".to_string())
    }
}

/// Results of every node that succeeded and produced all of its declared results
pub fn results_manifest(
    graph: &ExecutionGraph,
    collector: &ResultCollector,
) -> BTreeMap<String, BTreeMap<String, ParamValue>> {
    let mut manifest = BTreeMap::new();
    for record in collector.records() {
        if record.status != ExecutionStatus::Succeeded {
            continue;
        }
        let Some(vertex) = graph.vertex(&record.name) else {
            continue;
        };

        let mut results = record.results.clone();
        let mut complete = true;
        for declared in &vertex.task.results {
            match collector.result(&record.name, &declared.name) {
                ResultLookup::Available(value) => {
                    results
                        .entry(declared.name.clone())
                        .or_insert_with(|| value.clone());
                }
                _ => complete = false,
            }
        }
        if complete && !results.is_empty() {
            manifest.insert(record.name.clone(), results);
        }
    }
    manifest
}

/// Run-state view over the results manifest only
struct ManifestState<'a> {
    manifest: &'a BTreeMap<String, BTreeMap<String, ParamValue>>,
}

impl RunState for ManifestState<'_> {
    fn result(&self, task: &str, name: &str) -> ResultLookup<'_> {
        match self.manifest.get(task).and_then(|r| r.get(name)) {
            Some(value) => ResultLookup::Available(value),
            None => ResultLookup::Missing,
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
        self.manifest
            .iter()
            .flat_map(|(task, results)| {
                results
                    .iter()
                    .map(move |(name, value)| (task.clone(), name.clone(), value.clone()))
            })
            .collect()
    }

    fn task_states(&self) -> Vec<(String, &'static str)> {
        Vec::new()
    }
}

/// Evaluate run-level results against the manifest.
///
/// A result is omitted entirely when anything it references is missing.
pub fn run_results(
    graph: &ExecutionGraph,
    manifest: &BTreeMap<String, BTreeMap<String, ParamValue>>,
    params: &HashMap<String, ParamValue>,
    context: &RunContext,
    workspaces: &HashMap<String, Option<String>>,
) -> BTreeMap<String, ParamValue> {
    let state = ManifestState { manifest };
    let substitutor = Substitutor::new(params, context, workspaces, &state);

    let mut results = BTreeMap::new();
    for result in &graph.spec.results {
        match substitutor.substitute_value(&result.value) {
            Ok(value) => {
                results.insert(result.name.clone(), value);
            }
            Err(e) => debug!(result = %result.name, error = %e, "omitting run result"),
        }
    }
    results
}

/// Assemble the report once both waves are done
#[allow(clippy::too_many_arguments)]
pub fn build_report(
    run_id: &str,
    graph: &ExecutionGraph,
    collector: &ResultCollector,
    stop: Option<StopCause>,
    params: &HashMap<String, ParamValue>,
    context: &RunContext,
    workspaces: &HashMap<String, Option<String>>,
    duration: Duration,
) -> RunReport {
    let (status, reason) = aggregate_status(collector, stop);
    let task_results = results_manifest(graph, collector);
    let results = run_results(graph, &task_results, params, context, workspaces);

    let skipped = collector
        .records()
        .filter(|r| {
            r.never_ran()
                && matches!(r.status, ExecutionStatus::Skipped | ExecutionStatus::Cancelled)
        })
        .map(|r| SkippedTask {
            name: r.name.clone(),
            reason: r.reason.clone().unwrap_or_else(|| r.status.to_string()),
        })
        .collect();

    RunReport {
        run_id: run_id.to_string(),
        run_name: context.run_name.clone(),
        status,
        reason,
        tasks: collector.records().cloned().collect(),
        skipped,
        task_results,
        results,
        duration,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::execution::results::Completion;
    use crate::model::{GraphSpec, SkipReason, TaskNode};

    fn setup() -> (ExecutionGraph, ResultCollector) {
        let spec = GraphSpec::new()
            .with_task(TaskNode::new("build", "compile").with_result("digest"))
            .with_task(TaskNode::new("scan", "trivy").with_result("report"))
            .with_result("image", "$(tasks.build.results.digest)")
            .with_result("scan", "$(tasks.scan.results.report)")
            .with_result("combined", "$(tasks.build.results.digest)/$(tasks.scan.results.report)");
        let graph = ExecutionGraph::resolve(&spec, &EngineConfig::default()).unwrap();
        let collector = ResultCollector::new(&graph, false);
        (graph, collector)
    }

    fn completion(results: &[(&str, &str)]) -> Completion {
        Completion {
            attempts: 1,
            results: results
                .iter()
                .map(|(k, v)| (k.to_string(), ParamValue::from(*v)))
                .collect(),
            ..Completion::default()
        }
    }

    fn report(graph: &ExecutionGraph, collector: &ResultCollector, stop: Option<StopCause>) -> RunReport {
        build_report(
            "run-1",
            graph,
            collector,
            stop,
            &HashMap::new(),
            &RunContext::default(),
            &HashMap::new(),
            Duration::from_secs(1),
        )
    }

    #[test]
    fn test_succeeded_run() {
        let (graph, mut collector) = setup();
        collector.complete("build", ExecutionStatus::Succeeded, completion(&[("digest", "sha")]));
        collector.complete("scan", ExecutionStatus::Succeeded, completion(&[("report", "ok")]));

        let report = report(&graph, &collector, None);
        assert_eq!(report.status, RunStatus::Succeeded);
        assert_eq!(report.results.get("combined"), Some(&ParamValue::from("sha/ok")));
        assert!(report.skipped.is_empty());
    }

    #[test]
    fn test_missing_inputs_omit_run_results() {
        let (graph, mut collector) = setup();
        collector.complete("build", ExecutionStatus::Succeeded, completion(&[("digest", "sha")]));
        // Succeeded without its declared result
        collector.complete("scan", ExecutionStatus::Succeeded, completion(&[]));

        let report = report(&graph, &collector, None);
        assert_eq!(report.results.get("image"), Some(&ParamValue::from("sha")));
        assert!(!report.results.contains_key("scan"));
        assert!(!report.results.contains_key("combined"));
        assert!(!report.task_results.contains_key("scan"));
    }

    #[test]
    fn test_failed_producer_not_in_manifest() {
        let (graph, mut collector) = setup();
        collector.complete(
            "build",
            ExecutionStatus::Failed { ignored: true },
            completion(&[("digest", "sha")]),
        );
        collector.skip("scan", ExecutionStatus::Skipped, SkipReason::WhenExpressionsFalse);

        let report = report(&graph, &collector, None);
        assert_eq!(report.status, RunStatus::Completed);
        assert!(report.task_results.is_empty());
        assert!(report.results.is_empty());
        assert_eq!(
            report.skipped,
            vec![SkippedTask {
                name: "scan".to_string(),
                reason: "WhenExpressionsFalse".to_string()
            }]
        );
    }

    #[test]
    fn test_stop_cause_sets_reason() {
        let (graph, mut collector) = setup();
        collector.complete("build", ExecutionStatus::Succeeded, completion(&[("digest", "sha")]));
        collector.skip("scan", ExecutionStatus::Cancelled, SkipReason::RunCancelled);

        let report = report(&graph, &collector, Some(StopCause::Cancelled));
        assert_eq!(report.status, RunStatus::Failed);
        assert_eq!(report.reason, "Cancelled");
        assert!(!report.is_success());
        assert_eq!(report.reason_of("scan"), Some("RunCancelled"));
    }

    #[test]
    fn test_failure_without_stop_cause() {
        let (graph, mut collector) = setup();
        collector.complete("build", ExecutionStatus::TimedOut, completion(&[]));
        collector.skip("scan", ExecutionStatus::Cancelled, SkipReason::ParentTasksFailed);

        let (status, reason) = aggregate_status(&collector, None);
        assert_eq!(status, RunStatus::Failed);
        assert_eq!(reason, "Failed");
    }
}
