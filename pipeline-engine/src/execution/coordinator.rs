// Graph Coordinator
// Single-writer scheduler that drives both waves of a run to a final status

use crate::config::{EngineConfig, RunOptions, Timeouts, WorkspaceInput};
use crate::error::{EngineError, EngineResult};
use crate::execution::events::{EventSender, ExecutionEvent, ProgressSender};
use crate::execution::matrix::MatrixExpander;
use crate::execution::report::{build_report, RunReport, StopCause};
use crate::execution::results::{Completion, InstanceRecord, ResultCollector};
use crate::executor::{
    NoopExecutor, OutcomeStatus, ResolvedWorkspace, TaskExecutor, TaskOutcome, TaskRequest,
    TaskTarget,
};
use crate::expression::{BuiltinEvaluator, ExpressionEvaluator};
use crate::guard::{GuardEvaluator, GuardOutcome};
use crate::model::{
    Executable, ExecutionStatus, GraphSpec, MatrixInclude, OnError, Param, ParamValue,
    SkipReason, TaskNode, Wave,
};
use crate::resolver::{ExecutionGraph, TaskVertex};
use crate::substitution::{RunContext, SubstitutionError, Substitutor};

use futures::future::BoxFuture;
use futures::FutureExt;
use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Cancels a run from outside.
///
/// A graceful cancel stops the main wave and still runs finally nodes.
/// A hard cancel stops both waves.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    hard: CancellationToken,
    graceful: CancellationToken,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::from_token(CancellationToken::new())
    }

    fn from_token(hard: CancellationToken) -> Self {
        let graceful = hard.child_token();
        Self { hard, graceful }
    }

    pub fn cancel(&self) {
        self.graceful.cancel();
    }

    pub fn cancel_hard(&self) {
        self.hard.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.graceful.is_cancelled()
    }

    pub fn is_hard_cancelled(&self) -> bool {
        self.hard.is_cancelled()
    }

    /// Token an instance of the given wave watches
    fn token(&self, wave: Wave) -> &CancellationToken {
        match wave {
            Wave::Main => &self.graceful,
            Wave::Finally => &self.hard,
        }
    }
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Executes graph runs against a task executor
#[derive(Clone)]
pub struct PipelineEngine {
    graph: Arc<ExecutionGraph>,
    config: EngineConfig,
    executor: Arc<dyn TaskExecutor>,
    evaluator: Arc<dyn ExpressionEvaluator>,
    events: Option<ProgressSender>,
}

impl PipelineEngine {
    /// Resolve and validate a graph; nothing runs until [`PipelineEngine::run`]
    pub fn new(spec: &GraphSpec, config: EngineConfig) -> EngineResult<Self> {
        let graph = ExecutionGraph::resolve(spec, &config)?;
        Ok(Self::from_graph(Arc::new(graph), config))
    }

    fn from_graph(graph: Arc<ExecutionGraph>, config: EngineConfig) -> Self {
        Self {
            graph,
            config,
            executor: Arc::new(NoopExecutor),
            evaluator: Arc::new(BuiltinEvaluator),
            events: None,
        }
    }

    pub fn with_executor(mut self, executor: Arc<dyn TaskExecutor>) -> Self {
        self.executor = executor;
        self
    }

    pub fn with_evaluator(mut self, evaluator: Arc<dyn ExpressionEvaluator>) -> Self {
        self.evaluator = evaluator;
        self
    }

    pub fn with_progress(mut self, sender: ProgressSender) -> Self {
        self.events = Some(sender);
        self
    }

    pub fn graph(&self) -> &ExecutionGraph {
        &self.graph
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub async fn run(&self, options: RunOptions) -> EngineResult<RunReport> {
        self.run_with_cancel(options, CancelHandle::new()).await
    }

    /// Run the graph to completion.
    ///
    /// Errors are admission failures only; once the run starts every
    /// outcome is reported through the returned [`RunReport`].
    #[instrument(name = "run", skip_all)]
    pub async fn run_with_cancel(
        &self,
        options: RunOptions,
        cancel: CancelHandle,
    ) -> EngineResult<RunReport> {
        let admission = self.admit(&options)?;
        info!(
            run = %admission.context.run_name,
            run_id = %admission.run_id,
            tasks = self.graph.vertices().len(),
            "run admitted"
        );
        let coordinator = Coordinator::new(self, admission, options.timeouts, cancel);
        Ok(coordinator.drive().await)
    }

    /// Bind parameters and workspaces, and build the run context
    fn admit(&self, options: &RunOptions) -> EngineResult<Admission> {
        let spec = &self.graph.spec;

        for name in options.params.keys() {
            if !spec.params.iter().any(|p| &p.name == name) {
                warn!(param = %name, "ignoring undeclared parameter");
            }
        }

        let mut params = HashMap::new();
        for decl in &spec.params {
            let value = options
                .params
                .get(&decl.name)
                .or(decl.default.as_ref())
                .cloned()
                .ok_or_else(|| {
                    EngineError::invalid_param(&decl.name, "no value supplied and no default")
                })?;
            decl.check(&value)
                .map_err(|message| EngineError::invalid_param(&decl.name, message))?;
            params.insert(decl.name.clone(), value);
        }

        let mut workspaces = HashMap::new();
        for input in &options.workspaces {
            if spec.workspaces.iter().any(|w| w.name == input.name) {
                workspaces.insert(input.name.clone(), input.path.clone());
            } else {
                warn!(workspace = %input.name, "ignoring undeclared workspace");
            }
        }
        if let Some(missing) = spec
            .workspaces
            .iter()
            .find(|w| !w.optional && !workspaces.contains_key(&w.name))
        {
            return Err(EngineError::UnboundWorkspace(missing.name.clone()));
        }

        let run_id = uuid::Uuid::new_v4().to_string();
        let pipeline_name = options
            .pipeline_name
            .clone()
            .unwrap_or_else(|| "pipeline".to_string());
        let run_name = options
            .name
            .clone()
            .unwrap_or_else(|| format!("{}-run-{}", pipeline_name, &run_id[..8]));
        let context = RunContext {
            run_name,
            namespace: options
                .namespace
                .clone()
                .unwrap_or_else(|| "default".to_string()),
            run_uid: run_id.clone(),
            pipeline_name,
        };

        Ok(Admission {
            run_id,
            context,
            params,
            workspaces,
        })
    }

    /// Run an embedded graph as a child of this run
    fn run_embedded(
        &self,
        graph: Arc<ExecutionGraph>,
        options: RunOptions,
        cancel: CancelHandle,
    ) -> BoxFuture<'static, EngineResult<RunReport>> {
        let child = PipelineEngine {
            graph,
            config: self.config.clone(),
            executor: Arc::clone(&self.executor),
            evaluator: Arc::clone(&self.evaluator),
            events: None,
        };
        async move { child.run_with_cancel(options, cancel).await }.boxed()
    }
}

struct Admission {
    run_id: String,
    context: RunContext,
    params: HashMap<String, ParamValue>,
    workspaces: HashMap<String, Option<String>>,
}

/// How one attempt ended
enum Attempt {
    Finished(TaskOutcome),
    TimedOut,
    Cancelled,
    Panicked(String),
}

struct AttemptDone {
    task: String,
    instance: usize,
    attempt: Attempt,
    /// The limit came from the remaining wave budget, not the task's own timeout
    budget_limited: bool,
}

struct Instance {
    name: String,
    index: Option<usize>,
    params: Vec<Param>,
    workspaces: Vec<ResolvedWorkspace>,
    attempts: u32,
    status: ExecutionStatus,
    reason: Option<String>,
    message: Option<String>,
    results: HashMap<String, ParamValue>,
}

impl Instance {
    fn new(
        name: String,
        index: Option<usize>,
        params: Vec<Param>,
        workspaces: Vec<ResolvedWorkspace>,
    ) -> Self {
        Self {
            name,
            index,
            params,
            workspaces,
            attempts: 0,
            status: ExecutionStatus::Pending,
            reason: None,
            message: None,
            results: HashMap::new(),
        }
    }
}

#[derive(Default)]
struct NodeState {
    /// Predecessors not yet terminal
    waiting_on: usize,
    released: bool,
    instances: Vec<Instance>,
    remaining: usize,
    started: Option<Instant>,
}

/// What release decided for a node
enum Prepared {
    Run(Vec<Instance>),
    Skip(SkipReason),
    MissingResult(SubstitutionError),
    Invalid(String),
}

/// Run-scoped scheduler state. Only this struct writes node status.
struct Coordinator<'e> {
    engine: &'e PipelineEngine,
    graph: &'e ExecutionGraph,
    run_id: String,
    context: RunContext,
    params: HashMap<String, ParamValue>,
    workspaces: HashMap<String, Option<String>>,
    collector: ResultCollector,
    nodes: HashMap<String, NodeState>,
    attempts: JoinSet<AttemptDone>,
    queue: VecDeque<(String, usize)>,
    running: usize,
    stop: Option<StopCause>,
    cancel: CancelHandle,
    timeouts: Timeouts,
    started: Instant,
    pipeline_deadline: Option<Instant>,
    wave_deadline: Option<Instant>,
}

impl<'e> Coordinator<'e> {
    fn new(
        engine: &'e PipelineEngine,
        admission: Admission,
        timeouts: Timeouts,
        cancel: CancelHandle,
    ) -> Self {
        let graph = engine.graph.as_ref();
        let mut nodes = HashMap::new();
        for vertex in graph.vertices() {
            nodes.insert(
                vertex.name().to_string(),
                NodeState {
                    waiting_on: vertex.predecessors().count(),
                    ..NodeState::default()
                },
            );
        }

        let timeouts = Timeouts {
            pipeline: timeouts.pipeline.filter(|d| !d.is_zero()),
            tasks: timeouts.tasks.filter(|d| !d.is_zero()),
            finally: timeouts.finally.filter(|d| !d.is_zero()),
        };
        let started = Instant::now();
        let pipeline_deadline = timeouts.pipeline.map(|d| started + d);

        Self {
            engine,
            graph,
            run_id: admission.run_id,
            context: admission.context,
            params: admission.params,
            workspaces: admission.workspaces,
            collector: ResultCollector::new(graph, engine.config.use_result_defaults),
            nodes,
            attempts: JoinSet::new(),
            queue: VecDeque::new(),
            running: 0,
            stop: None,
            cancel,
            timeouts,
            started,
            pipeline_deadline,
            wave_deadline: None,
        }
    }

    async fn drive(mut self) -> RunReport {
        self.engine.events.send_event(ExecutionEvent::run_started(
            &self.run_id,
            &self.context.run_name,
            self.graph.vertices().len(),
        ));

        self.wave_deadline = earliest(
            self.timeouts.tasks.map(|d| self.started + d),
            self.pipeline_deadline,
        );
        let roots: Vec<String> = self
            .graph
            .wave(Wave::Main)
            .filter(|v| v.predecessors().next().is_none())
            .map(|v| v.name().to_string())
            .collect();
        for root in roots {
            self.release(&root);
        }
        self.wait_for_quiescence().await;
        self.sweep(Wave::Main);

        self.start_finally();
        self.wait_for_quiescence().await;
        self.sweep(Wave::Finally);

        let duration = self.started.elapsed();
        let report = build_report(
            &self.run_id,
            self.graph,
            &self.collector,
            self.stop,
            &self.params,
            &self.context,
            &self.workspaces,
            duration,
        );
        info!(
            run = %report.run_name,
            status = %report.status,
            reason = %report.reason,
            "run finished"
        );
        self.engine.events.send_event(ExecutionEvent::run_completed(
            &self.run_id,
            report.status,
            &report.reason,
            duration,
        ));
        report
    }

    async fn wait_for_quiescence(&mut self) {
        while let Some(joined) = self.attempts.join_next().await {
            self.running = self.running.saturating_sub(1);
            match joined {
                Ok(done) => self.on_attempt(done),
                Err(e) => error!(error = %e, "task attempt could not be joined"),
            }
            self.drain_queue();
        }
    }

    /// Anything still open once a wave is quiescent can no longer run
    fn sweep(&mut self, wave: Wave) {
        for name in self.collector.unfinished(wave) {
            warn!(task = %name, "task left unfinished at end of wave");
            let reason = self
                .stop
                .map(stop_skip_reason)
                .unwrap_or(SkipReason::RunStopping);
            self.collector
                .skip(&name, ExecutionStatus::Cancelled, reason);
        }
    }

    fn start_finally(&mut self) {
        self.note_cancellation();
        let names: Vec<String> = self
            .graph
            .wave(Wave::Finally)
            .map(|v| v.name().to_string())
            .collect();
        if names.is_empty() {
            return;
        }

        let now = Instant::now();
        self.wave_deadline = match self.timeouts.finally {
            Some(budget) => earliest(Some(now + budget), self.pipeline_deadline),
            None => self.pipeline_deadline,
        };
        info!(tasks = names.len(), "starting finally wave");
        self.engine
            .events
            .send_event(ExecutionEvent::FinallyStarted {
                total_tasks: names.len(),
            });
        for name in names {
            self.release(&name);
        }
    }

    fn note_cancellation(&mut self) {
        if self.cancel.is_cancelled() && self.stop.is_none() {
            info!("run cancelled");
            self.stop = Some(StopCause::Cancelled);
        }
    }

    fn deadline_passed(&self) -> bool {
        self.wave_deadline
            .map(|d| Instant::now() >= d)
            .unwrap_or(false)
    }

    /// Why a node of this wave can no longer start, if it cannot
    fn blocked(&mut self, wave: Wave) -> Option<(ExecutionStatus, SkipReason)> {
        self.note_cancellation();
        match wave {
            Wave::Main => {
                if self.stop.is_none() && self.deadline_passed() {
                    warn!("main wave budget exhausted");
                    self.stop = Some(StopCause::TimedOut);
                }
                self.stop
                    .map(|cause| (ExecutionStatus::Cancelled, stop_skip_reason(cause)))
            }
            Wave::Finally => {
                if self.cancel.is_hard_cancelled() {
                    return Some((ExecutionStatus::Skipped, SkipReason::RunCancelled));
                }
                if !self.deadline_passed() {
                    return None;
                }
                self.stop.get_or_insert(StopCause::TimedOut);
                let pipeline_expired = self
                    .pipeline_deadline
                    .map(|d| Instant::now() >= d)
                    .unwrap_or(false);
                let reason = if pipeline_expired {
                    SkipReason::RunTimedOut
                } else {
                    SkipReason::FinallyTimedOut
                };
                Some((ExecutionStatus::Skipped, reason))
            }
        }
    }

    /// All predecessors are terminal: decide whether the node runs
    fn release(&mut self, name: &str) {
        let graph = self.graph;
        let Some(vertex) = graph.vertex(name) else {
            return;
        };
        if self.collector.is_terminal(name) {
            return;
        }
        match self.nodes.get_mut(name) {
            Some(node) if !node.released => node.released = true,
            _ => return,
        }

        if let Some((status, reason)) = self.blocked(vertex.wave) {
            self.finish_without_running(name, status, reason);
            return;
        }

        let prepared = {
            let mut substitutor = Substitutor::new(
                &self.params,
                &self.context,
                &self.workspaces,
                &self.collector,
            )
            .with_retries(vertex.task.retries);
            if vertex.wave == Wave::Finally {
                substitutor = substitutor.with_status_access();
            }
            let guards = GuardEvaluator::new(self.engine.evaluator.as_ref());
            match guards.evaluate(name, &vertex.task.when, &substitutor) {
                Ok(GuardOutcome::Run) => self.prepare(vertex, &substitutor),
                Ok(GuardOutcome::Skip(reason)) => Prepared::Skip(reason),
                Err(e) => Prepared::MissingResult(e),
            }
        };

        match prepared {
            Prepared::Skip(reason) => {
                self.finish_without_running(name, ExecutionStatus::Skipped, reason)
            }
            Prepared::MissingResult(e) => self.on_missing_result(vertex, e),
            Prepared::Invalid(message) => {
                warn!(task = %name, error = %message, "task inputs could not be resolved");
                let status = ExecutionStatus::Failed {
                    ignored: vertex.task.on_error == OnError::Continue,
                };
                self.finish_unstarted(name, status, "InvalidParamValue", message);
            }
            Prepared::Run(instances) => {
                let count = instances.len();
                if let Some(node) = self.nodes.get_mut(name) {
                    node.remaining = count;
                    node.instances = instances;
                    node.started = Some(Instant::now());
                }
                self.collector.mark_running(name);
                debug!(task = %name, instances = count, "task released");
                for idx in 0..count {
                    self.launch(name, idx);
                }
            }
        }
    }

    /// Substitute inputs and fan out into instances
    fn prepare(&self, vertex: &TaskVertex, substitutor: &Substitutor<'_>) -> Prepared {
        let task = &vertex.task;
        let params = match substitutor.substitute_params(&task.params) {
            Ok(params) => params,
            Err(e) => return substitution_failure(e),
        };

        let mut workspaces = Vec::new();
        for binding in &task.workspaces {
            let Some(path) = self.workspaces.get(binding.target()) else {
                // Optional workspace the run left unbound
                continue;
            };
            let sub_path = match &binding.sub_path {
                Some(sub_path) => match substitutor.substitute_str(sub_path) {
                    Ok(s) => Some(s),
                    Err(e) => return substitution_failure(e),
                },
                None => None,
            };
            workspaces.push(ResolvedWorkspace {
                name: binding.name.clone(),
                workspace: binding.target().to_string(),
                path: path.clone(),
                sub_path,
            });
        }

        let Some(matrix) = &task.matrix else {
            return Prepared::Run(vec![Instance::new(
                task.name.clone(),
                None,
                params,
                workspaces,
            )]);
        };

        let axes = match substitutor.substitute_params(&matrix.params) {
            Ok(axes) => axes,
            Err(e) => return substitution_failure(e),
        };
        let mut include = Vec::with_capacity(matrix.include.len());
        for entry in &matrix.include {
            match substitutor.substitute_params(&entry.params) {
                Ok(params) => include.push(MatrixInclude {
                    name: entry.name.clone(),
                    params,
                }),
                Err(e) => return substitution_failure(e),
            }
        }

        let combos = match MatrixExpander::expand(
            &axes,
            &include,
            self.engine.config.max_matrix_combinations,
        ) {
            Ok(combos) => combos,
            Err(e) => return Prepared::Invalid(e.to_string()),
        };
        if combos.is_empty() {
            return Prepared::Skip(SkipReason::MatrixEmpty);
        }

        Prepared::Run(
            combos
                .into_iter()
                .map(|combo| {
                    let mut merged = params.clone();
                    for param in &combo.params {
                        match merged.iter_mut().find(|p| p.name == param.name) {
                            Some(existing) => existing.value = param.value.clone(),
                            None => merged.push(param.clone()),
                        }
                    }
                    Instance::new(
                        combo.instance_name(&task.name),
                        Some(combo.index),
                        merged,
                        workspaces.clone(),
                    )
                })
                .collect(),
        )
    }

    fn on_missing_result(&mut self, vertex: &TaskVertex, err: SubstitutionError) {
        let name = vertex.name();
        let producer_skipped = matches!(
            err,
            SubstitutionError::MissingResult {
                producer_skipped: true,
                ..
            }
        );
        if producer_skipped || vertex.task.on_error == OnError::Continue {
            debug!(task = %name, error = %err, "skipping task with missing results");
            self.finish_without_running(name, ExecutionStatus::Skipped, SkipReason::MissingResults);
            return;
        }

        warn!(task = %name, error = %err, "result reference cannot be satisfied, stopping run");
        self.stop.get_or_insert(StopCause::InvalidResultReference);
        self.finish_unstarted(
            name,
            ExecutionStatus::Failed { ignored: false },
            "InvalidTaskResultReference",
            err.to_string(),
        );
    }

    fn launch(&mut self, name: &str, idx: usize) {
        let max = self.engine.config.max_parallel;
        if max > 0 && self.running >= max {
            self.queue.push_back((name.to_string(), idx));
            return;
        }
        self.spawn_attempt(name, idx);
    }

    fn drain_queue(&mut self) {
        let max = self.engine.config.max_parallel;
        while max == 0 || self.running < max {
            let Some((name, idx)) = self.queue.pop_front() else {
                break;
            };
            self.spawn_attempt(&name, idx);
        }
    }

    fn spawn_attempt(&mut self, name: &str, idx: usize) {
        let graph = self.graph;
        let Some(vertex) = graph.vertex(name) else {
            return;
        };
        let (limit, budget_limited) = self.attempt_limit(&vertex.task);
        let watch = self.cancel.token(vertex.wave).clone();
        let token = watch.child_token();

        let Some(instance) = self
            .nodes
            .get_mut(name)
            .and_then(|n| n.instances.get_mut(idx))
        else {
            return;
        };
        instance.attempts += 1;
        instance.status = ExecutionStatus::Running;
        let attempt = instance.attempts;

        let work: BoxFuture<'static, TaskOutcome> = match &vertex.child {
            Some(child) => {
                let options = RunOptions {
                    name: Some(format!("{}-{}", self.context.run_name, instance.name)),
                    namespace: Some(self.context.namespace.clone()),
                    pipeline_name: Some(name.to_string()),
                    params: instance
                        .params
                        .iter()
                        .map(|p| (p.name.clone(), p.value.clone()))
                        .collect(),
                    workspaces: instance
                        .workspaces
                        .iter()
                        .map(|w| WorkspaceInput {
                            name: w.name.clone(),
                            path: w.path.clone(),
                        })
                        .collect(),
                    timeouts: Timeouts::default(),
                };
                let handle = CancelHandle::from_token(token.clone());
                self.engine
                    .run_embedded(Arc::clone(child), options, handle)
                    .map(embedded_outcome)
                    .boxed()
            }
            None => {
                let target = match vertex.task.executable() {
                    Some(Executable::Ref(r)) => TaskTarget::Ref(r.clone()),
                    Some(Executable::Inline(spec)) => TaskTarget::Inline(spec.clone()),
                    // Rejected at construction
                    Some(Executable::Graph(_)) | None => return,
                };
                let request = TaskRequest {
                    run_id: self.run_id.clone(),
                    task: name.to_string(),
                    instance: instance.name.clone(),
                    matrix_index: instance.index,
                    target,
                    params: instance.params.clone(),
                    workspaces: instance.workspaces.clone(),
                    attempt,
                    context: self.context.clone(),
                };
                let executor = Arc::clone(&self.engine.executor);
                let token = token.clone();
                async move { executor.execute(request, token).await }.boxed()
            }
        };

        debug!(task = %name, instance = %instance.name, attempt, "starting attempt");
        self.engine.events.send_event(ExecutionEvent::task_started(
            name,
            &instance.name,
            attempt,
        ));

        let task = name.to_string();
        self.attempts.spawn(async move {
            let attempt = run_attempt(work, token, watch, limit).await;
            AttemptDone {
                task,
                instance: idx,
                attempt,
                budget_limited,
            }
        });
        self.running += 1;
    }

    /// Task timeout capped by what is left of the wave budget
    fn attempt_limit(&self, task: &TaskNode) -> (Option<Duration>, bool) {
        let own = task
            .timeout
            .or(self.engine.config.default_task_timeout)
            .filter(|d| !d.is_zero());
        let remaining = self
            .wave_deadline
            .map(|d| d.saturating_duration_since(Instant::now()));
        match (own, remaining) {
            (Some(own), Some(left)) if left < own => (Some(left), true),
            (Some(own), _) => (Some(own), false),
            (None, Some(left)) => (Some(left), true),
            (None, None) => (None, false),
        }
    }

    fn may_retry(&mut self, wave: Wave) -> bool {
        match wave {
            Wave::Main => self.blocked(Wave::Main).is_none(),
            Wave::Finally => !self.cancel.is_hard_cancelled() && !self.deadline_passed(),
        }
    }

    fn on_attempt(&mut self, done: AttemptDone) {
        let graph = self.graph;
        let Some(vertex) = graph.vertex(&done.task) else {
            return;
        };
        let name = vertex.name();

        let (status, message, results) = match done.attempt {
            Attempt::Finished(outcome) => {
                let status = match outcome.status {
                    OutcomeStatus::Succeeded => ExecutionStatus::Succeeded,
                    OutcomeStatus::Failed => ExecutionStatus::Failed { ignored: false },
                    OutcomeStatus::Cancelled => ExecutionStatus::Cancelled,
                };
                (status, outcome.message, outcome.results)
            }
            Attempt::TimedOut => (
                ExecutionStatus::TimedOut,
                Some("attempt timed out".to_string()),
                HashMap::new(),
            ),
            Attempt::Cancelled => (
                ExecutionStatus::Cancelled,
                Some("attempt cancelled".to_string()),
                HashMap::new(),
            ),
            Attempt::Panicked(message) => (
                ExecutionStatus::Failed { ignored: false },
                Some(message),
                HashMap::new(),
            ),
        };

        if status == ExecutionStatus::TimedOut && done.budget_limited {
            warn!(task = %name, wave = %vertex.wave, "wave budget exhausted");
            self.stop.get_or_insert(StopCause::TimedOut);
        }

        let attempts = match self
            .nodes
            .get(name)
            .and_then(|n| n.instances.get(done.instance))
        {
            Some(instance) => instance.attempts,
            None => return,
        };
        if status.is_retryable() && attempts <= vertex.task.retries && self.may_retry(vertex.wave) {
            let instance_name = self.nodes[name].instances[done.instance].name.clone();
            info!(
                task = %name,
                instance = %instance_name,
                attempt = attempts + 1,
                "retrying failed attempt"
            );
            self.engine.events.send_event(ExecutionEvent::task_retrying(
                name,
                &instance_name,
                attempts + 1,
                message,
            ));
            self.launch(name, done.instance);
            return;
        }

        let continue_on_error = vertex.task.on_error == OnError::Continue;
        let (status, reason) = match status {
            ExecutionStatus::Succeeded => (status, None),
            ExecutionStatus::TimedOut if continue_on_error => {
                (ExecutionStatus::Failed { ignored: true }, Some("TimedOut"))
            }
            ExecutionStatus::Failed { .. } if continue_on_error => {
                (ExecutionStatus::Failed { ignored: true }, Some("Failed"))
            }
            ExecutionStatus::TimedOut => (status, Some("TimedOut")),
            ExecutionStatus::Cancelled => (status, Some("Cancelled")),
            _ => (ExecutionStatus::Failed { ignored: false }, Some("Failed")),
        };

        let finished = match self.nodes.get_mut(name) {
            Some(node) => {
                if let Some(instance) = node.instances.get_mut(done.instance) {
                    instance.status = status;
                    instance.reason = reason.map(str::to_string);
                    instance.message = message;
                    instance.results = results;
                }
                node.remaining = node.remaining.saturating_sub(1);
                node.remaining == 0
            }
            None => false,
        };
        if finished {
            self.finish_node(vertex);
        }
    }

    /// Every instance is terminal: fold them into the node record
    fn finish_node(&mut self, vertex: &TaskVertex) {
        let name = vertex.name();
        let Some(node) = self.nodes.get_mut(name) else {
            return;
        };
        let instances = std::mem::take(&mut node.instances);
        let duration = node.started.map(|s| s.elapsed());

        let failing = instances.iter().find(|i| {
            matches!(
                i.status,
                ExecutionStatus::Failed { ignored: false } | ExecutionStatus::TimedOut
            )
        });
        let cancelled = instances
            .iter()
            .find(|i| i.status == ExecutionStatus::Cancelled);
        let ignored = instances
            .iter()
            .find(|i| i.status == ExecutionStatus::Failed { ignored: true });
        let decisive = failing.or(cancelled).or(ignored);
        let status = decisive
            .map(|i| i.status)
            .unwrap_or(ExecutionStatus::Succeeded);
        let reason = decisive.and_then(|i| i.reason.clone());
        let message = decisive.and_then(|i| i.message.clone());
        let attempts = instances.iter().map(|i| i.attempts).max().unwrap_or(0);

        let fanned_out = instances.iter().any(|i| i.index.is_some());
        let (results, records) = if fanned_out {
            let per_instance: Vec<_> = instances.iter().map(|i| i.results.clone()).collect();
            let records = instances
                .into_iter()
                .map(|i| InstanceRecord {
                    name: i.name,
                    index: i.index.unwrap_or_default(),
                    params: i
                        .params
                        .iter()
                        .map(|p| (p.name.clone(), p.value.render()))
                        .collect(),
                    status: i.status,
                    reason: i.reason,
                    attempts: i.attempts,
                    results: i.results.into_iter().collect(),
                })
                .collect();
            (MatrixExpander::aggregate_results(&per_instance), records)
        } else {
            let results = instances
                .into_iter()
                .next()
                .map(|i| i.results)
                .unwrap_or_default();
            (results, Vec::new())
        };

        self.collector.complete(
            name,
            status,
            Completion {
                reason: reason.clone(),
                message,
                attempts,
                results,
                instances: records,
                duration,
            },
        );
        if status.is_failure() {
            warn!(task = %name, status = %status, "task finished");
        } else {
            info!(task = %name, status = %status, "task finished");
        }
        self.engine.events.send_event(ExecutionEvent::task_completed(
            name,
            vertex.wave,
            status,
            reason,
            duration.unwrap_or_default(),
        ));
        self.settle(name);
    }

    fn finish_without_running(&mut self, name: &str, status: ExecutionStatus, reason: SkipReason) {
        if !self.collector.skip(name, status, reason) {
            return;
        }
        debug!(task = %name, status = %status, reason = %reason, "task did not run");
        self.engine
            .events
            .send_event(ExecutionEvent::task_skipped(name, status, reason));
        self.settle(name);
    }

    /// Fail a node before any attempt started
    fn finish_unstarted(&mut self, name: &str, status: ExecutionStatus, reason: &str, message: String) {
        let recorded = self.collector.complete(
            name,
            status,
            Completion {
                reason: Some(reason.to_string()),
                message: Some(message),
                ..Completion::default()
            },
        );
        if !recorded {
            return;
        }
        let wave = self
            .graph
            .vertex(name)
            .map(|v| v.wave)
            .unwrap_or(Wave::Main);
        self.engine.events.send_event(ExecutionEvent::task_completed(
            name,
            wave,
            status,
            Some(reason.to_string()),
            Duration::ZERO,
        ));
        self.settle(name);
    }

    /// A node just became terminal: propagate failure and release dependents
    fn settle(&mut self, name: &str) {
        let graph = self.graph;
        let Some(record) = self.collector.record(name) else {
            return;
        };
        let status = record.status;
        let blocked_cancel = status == ExecutionStatus::Cancelled && record.never_ran();
        let wave = graph.vertex(name).map(|v| v.wave).unwrap_or(Wave::Main);

        if wave == Wave::Main && status.is_failure() && !blocked_cancel {
            self.note_cancellation();
            let reason = match self.stop {
                Some(StopCause::Cancelled) => SkipReason::RunCancelled,
                Some(StopCause::TimedOut) => SkipReason::RunTimedOut,
                _ => SkipReason::ParentTasksFailed,
            };
            for dependent in graph.transitive_dependents(name) {
                let released = self
                    .nodes
                    .get(dependent)
                    .map(|n| n.released)
                    .unwrap_or(true);
                if !released && self.collector.skip(dependent, ExecutionStatus::Cancelled, reason) {
                    if let Some(node) = self.nodes.get_mut(dependent) {
                        node.released = true;
                    }
                    debug!(task = %dependent, upstream = %name, "cancelled by failed upstream");
                    self.engine.events.send_event(ExecutionEvent::task_skipped(
                        dependent,
                        ExecutionStatus::Cancelled,
                        reason,
                    ));
                }
            }
        }

        for dependent in graph.dependents(name) {
            let ready = match self.nodes.get_mut(dependent.as_str()) {
                Some(node) => {
                    node.waiting_on = node.waiting_on.saturating_sub(1);
                    node.waiting_on == 0 && !node.released
                }
                None => false,
            };
            if ready {
                self.release(dependent);
            }
        }
    }
}

/// Drive one attempt under the cancellation token and time limit
async fn run_attempt(
    work: BoxFuture<'static, TaskOutcome>,
    token: CancellationToken,
    watch: CancellationToken,
    limit: Option<Duration>,
) -> Attempt {
    if limit == Some(Duration::ZERO) {
        return Attempt::TimedOut;
    }
    let guarded = AssertUnwindSafe(work).catch_unwind();
    let bounded = async move {
        match limit {
            Some(limit) => tokio::time::timeout(limit, guarded).await.ok(),
            None => Some(guarded.await),
        }
    };

    tokio::select! {
        biased;
        _ = watch.cancelled() => Attempt::Cancelled,
        result = bounded => match result {
            Some(Ok(outcome)) => Attempt::Finished(outcome),
            Some(Err(panic)) => Attempt::Panicked(panic_message(panic)),
            None => {
                token.cancel();
                Attempt::TimedOut
            }
        },
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("executor panicked: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("executor panicked: {}", s)
    } else {
        "executor panicked".to_string()
    }
}

fn embedded_outcome(report: EngineResult<RunReport>) -> TaskOutcome {
    match report {
        Ok(report) => {
            let mut outcome = if report.is_success() {
                TaskOutcome::succeeded()
            } else {
                TaskOutcome::failed(format!(
                    "embedded run {} finished {}",
                    report.run_name, report.reason
                ))
            };
            outcome.results = report.results.into_iter().collect();
            outcome
        }
        Err(e) => TaskOutcome::failed(e.to_string()),
    }
}

fn substitution_failure(err: SubstitutionError) -> Prepared {
    if err.is_missing_result() {
        Prepared::MissingResult(err)
    } else {
        Prepared::Invalid(err.to_string())
    }
}

fn stop_skip_reason(cause: StopCause) -> SkipReason {
    match cause {
        StopCause::InvalidResultReference => SkipReason::RunStopping,
        StopCause::Cancelled => SkipReason::RunCancelled,
        StopCause::TimedOut => SkipReason::RunTimedOut,
    }
}

fn earliest(a: Option<Instant>, b: Option<Instant>) -> Option<Instant> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}
