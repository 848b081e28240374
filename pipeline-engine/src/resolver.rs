// Dependency Resolver
// Builds the validated task DAG from a graph spec: explicit and implicit edges, cycle checks

use crate::config::EngineConfig;
use crate::error::GraphError;
use crate::expression::{Expr, ExprParser};
use crate::model::{Executable, GraphSpec, OnError, ParamValue, TaskNode, Wave, WhenExpression};
use crate::substitution::{references, Selector, VarRef};

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

/// A task node with its resolved edges
#[derive(Debug, Clone)]
pub struct TaskVertex {
    pub task: TaskNode,
    pub wave: Wave,
    /// Explicit `runAfter` edges
    pub run_after: Vec<String>,
    /// Edges discovered from result references
    pub implicit: Vec<String>,
    /// Resolved embedded graph, for nodes that run one
    pub child: Option<Arc<ExecutionGraph>>,
}

impl TaskVertex {
    pub fn name(&self) -> &str {
        &self.task.name
    }

    /// Union of explicit and implicit predecessors
    pub fn predecessors(&self) -> impl Iterator<Item = &String> {
        let explicit: HashSet<&String> = self.run_after.iter().collect();
        self.run_after
            .iter()
            .chain(self.implicit.iter().filter(move |d| !explicit.contains(d)))
    }
}

/// Validated DAG of one graph spec
#[derive(Debug, Clone)]
pub struct ExecutionGraph {
    pub spec: GraphSpec,
    vertices: Vec<TaskVertex>,
    indices: HashMap<String, usize>,
    dependents: HashMap<String, Vec<String>>,
}

impl ExecutionGraph {
    /// Resolve and validate a graph spec
    pub fn resolve(spec: &GraphSpec, config: &EngineConfig) -> Result<Self, GraphError> {
        let mut indices = HashMap::new();
        let mut vertices = Vec::new();

        let waves = spec
            .tasks
            .iter()
            .map(|t| (t, Wave::Main))
            .chain(spec.finally.iter().map(|t| (t, Wave::Finally)));

        for (task, wave) in waves {
            if indices.insert(task.name.clone(), vertices.len()).is_some() {
                return Err(GraphError::invalid_graph(format!(
                    "duplicate task name '{}'",
                    task.name
                )));
            }
            vertices.push(TaskVertex {
                task: task.clone(),
                wave,
                run_after: task.run_after.clone(),
                implicit: Vec::new(),
                child: None,
            });
        }

        let mut graph = Self {
            spec: spec.clone(),
            vertices,
            indices,
            dependents: HashMap::new(),
        };

        for idx in 0..graph.vertices.len() {
            graph.check_task(idx, config)?;
            graph.vertices[idx].implicit = graph.discover_edges(idx)?;
            graph.resolve_child(idx, config)?;
        }
        graph.check_results()?;
        graph.detect_cycles()?;
        graph.build_dependents();

        Ok(graph)
    }

    /// Settings that are invalid regardless of the rest of the graph
    fn check_task(&self, idx: usize, config: &EngineConfig) -> Result<(), GraphError> {
        let vertex = &self.vertices[idx];
        let task = &vertex.task;

        if task.executable().is_none() {
            return Err(GraphError::invalid_graph(format!(
                "task '{}' must set exactly one of taskRef, taskSpec or pipelineSpec",
                task.name
            )));
        }

        if task.retries > 0 && task.on_error == OnError::Continue {
            return Err(GraphError::invalid_configuration(format!(
                "task '{}' sets retries with onError: continue",
                task.name
            )));
        }

        if task.matrix.is_some() && !config.enable_matrix {
            return Err(GraphError::feature_disabled(format!(
                "task '{}' uses a matrix but matrix support is disabled",
                task.name
            )));
        }

        if !config.enable_cel_guards
            && task.when.iter().any(|w| matches!(w, WhenExpression::Cel { .. }))
        {
            return Err(GraphError::feature_disabled(format!(
                "task '{}' uses a cel guard but cel guards are disabled",
                task.name
            )));
        }

        if vertex.wave == Wave::Finally && !task.run_after.is_empty() {
            return Err(GraphError::invalid_graph(format!(
                "finally task '{}' cannot declare runAfter",
                task.name
            )));
        }

        for dep in &task.run_after {
            match self.vertex(dep) {
                None => {
                    return Err(GraphError::unknown_reference(format!(
                        "task '{}' runs after unknown task '{}'",
                        task.name, dep
                    )))
                }
                Some(v) if v.wave == Wave::Finally => {
                    return Err(GraphError::invalid_graph(format!(
                        "task '{}' cannot run after finally task '{}'",
                        task.name, dep
                    )))
                }
                Some(_) => {}
            }
        }

        let declared: HashSet<&str> = self
            .spec
            .workspaces
            .iter()
            .map(|w| w.name.as_str())
            .collect();
        for binding in &task.workspaces {
            if !declared.contains(binding.target()) {
                return Err(GraphError::unknown_reference(format!(
                    "task '{}' binds undeclared workspace '{}'",
                    task.name,
                    binding.target()
                )));
            }
        }

        Ok(())
    }

    /// Validate every reference a task makes and return its implicit edges
    fn discover_edges(&self, idx: usize) -> Result<Vec<String>, GraphError> {
        let vertex = &self.vertices[idx];
        let task = &vertex.task;
        let mut edges: Vec<String> = Vec::new();

        let mut refs = Vec::new();
        for template in task_templates(task) {
            refs.extend(references(template).map_err(|e| {
                GraphError::invalid_graph(format!("task '{}': {}", task.name, e))
            })?);
        }
        for guard in &task.when {
            if let WhenExpression::Cel { cel } = guard {
                refs.extend(binding_references(cel));
            }
        }

        for var in refs {
            self.check_common_reference(&var, &task.name)?;

            if var.reads_status() && vertex.wave == Wave::Main {
                return Err(GraphError::invalid_graph(format!(
                    "task '{}' reads execution status; only finally tasks may",
                    task.name
                )));
            }

            let Some(producer) = var.task() else { continue };
            let producer_vertex = self.vertex(producer).ok_or_else(|| {
                GraphError::unknown_reference(format!(
                    "task '{}' references unknown task '{}'",
                    task.name, producer
                ))
            })?;

            match (vertex.wave, producer_vertex.wave) {
                (_, Wave::Finally) => {
                    return Err(GraphError::invalid_graph(format!(
                        "task '{}' cannot reference finally task '{}'",
                        task.name, producer
                    )))
                }
                (Wave::Main, Wave::Main) => {
                    if matches!(var, VarRef::Result { .. }) && !edges.iter().any(|e| e == producer)
                    {
                        edges.push(producer.to_string());
                    }
                }
                // The whole main wave precedes finally
                (Wave::Finally, Wave::Main) => {}
            }
        }

        Ok(edges)
    }

    /// Checks shared by task and run-result references
    fn check_common_reference(&self, var: &VarRef, owner: &str) -> Result<(), GraphError> {
        match var {
            VarRef::Param { name, .. } if !self.spec.params.iter().any(|p| &p.name == name) => {
                Err(GraphError::unknown_reference(format!(
                    "'{}' references undeclared parameter '{}'",
                    owner, name
                )))
            }
            VarRef::Workspace { name, .. }
                if !self.spec.workspaces.iter().any(|w| &w.name == name) =>
            {
                Err(GraphError::unknown_reference(format!(
                    "'{}' references undeclared workspace '{}'",
                    owner, name
                )))
            }
            _ => Ok(()),
        }
    }

    fn resolve_child(&mut self, idx: usize, config: &EngineConfig) -> Result<(), GraphError> {
        let task = &self.vertices[idx].task;
        if let Some(Executable::Graph(child)) = task.executable() {
            let resolved =
                ExecutionGraph::resolve(child, config).map_err(|e| e.within(&task.name))?;
            self.vertices[idx].child = Some(Arc::new(resolved));
        }
        Ok(())
    }

    /// Run-level results may only read task results and parameters
    fn check_results(&self) -> Result<(), GraphError> {
        for result in &self.spec.results {
            let owner = format!("result {}", result.name);
            for template in value_templates(&result.value) {
                let refs = references(template)
                    .map_err(|e| GraphError::invalid_graph(format!("{}: {}", owner, e)))?;
                for var in refs {
                    self.check_common_reference(&var, &owner)?;
                    if var.reads_status() {
                        return Err(GraphError::invalid_graph(format!(
                            "{} cannot read execution status",
                            owner
                        )));
                    }
                    if let Some(task) = var.task() {
                        if self.vertex(task).is_none() {
                            return Err(GraphError::unknown_reference(format!(
                                "{} references unknown task '{}'",
                                owner, task
                            )));
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Detect cycles using DFS with a recursion stack
    fn detect_cycles(&self) -> Result<(), GraphError> {
        let mut visited = HashSet::new();
        let mut rec_stack = HashSet::new();

        for vertex in &self.vertices {
            if !visited.contains(vertex.name()) {
                if let Some(cycle) = self.dfs_cycle(vertex, &mut visited, &mut rec_stack) {
                    return Err(GraphError::cyclic(format!(
                        "circular dependency detected: {}",
                        cycle.join(" -> ")
                    )));
                }
            }
        }

        Ok(())
    }

    fn dfs_cycle<'a>(
        &'a self,
        vertex: &'a TaskVertex,
        visited: &mut HashSet<&'a str>,
        rec_stack: &mut HashSet<&'a str>,
    ) -> Option<Vec<String>> {
        let name = vertex.name();
        visited.insert(name);
        rec_stack.insert(name);

        for dep in vertex.predecessors() {
            if rec_stack.contains(dep.as_str()) {
                return Some(vec![dep.clone(), name.to_string()]);
            }
            if visited.contains(dep.as_str()) {
                continue;
            }
            if let Some(next) = self.vertex(dep) {
                if let Some(mut cycle) = self.dfs_cycle(next, visited, rec_stack) {
                    cycle.push(name.to_string());
                    return Some(cycle);
                }
            }
        }

        rec_stack.remove(name);
        None
    }

    fn build_dependents(&mut self) {
        let mut dependents: HashMap<String, Vec<String>> = HashMap::new();
        for vertex in &self.vertices {
            dependents.entry(vertex.name().to_string()).or_default();
            for dep in vertex.predecessors() {
                dependents
                    .entry(dep.clone())
                    .or_default()
                    .push(vertex.name().to_string());
            }
        }
        self.dependents = dependents;
    }

    pub fn vertex(&self, name: &str) -> Option<&TaskVertex> {
        self.indices.get(name).map(|&i| &self.vertices[i])
    }

    pub fn vertices(&self) -> &[TaskVertex] {
        &self.vertices
    }

    pub fn wave(&self, wave: Wave) -> impl Iterator<Item = &TaskVertex> {
        self.vertices.iter().filter(move |v| v.wave == wave)
    }

    /// Direct dependents of a task
    pub fn dependents(&self, name: &str) -> &[String] {
        self.dependents.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Every task reachable through dependent edges, in breadth-first order
    pub fn transitive_dependents(&self, name: &str) -> Vec<&str> {
        let mut seen: HashSet<&str> = HashSet::new();
        let mut order = Vec::new();
        let mut queue: VecDeque<&str> = self.dependents(name).iter().map(String::as_str).collect();

        while let Some(next) = queue.pop_front() {
            if seen.insert(next) {
                order.push(next);
                queue.extend(self.dependents(next).iter().map(String::as_str));
            }
        }
        order
    }

    /// Main-wave tasks in topological order (Kahn's algorithm)
    pub fn topological_order(&self) -> Vec<&TaskVertex> {
        let mut in_degree: HashMap<&str, usize> = HashMap::new();
        for vertex in self.wave(Wave::Main) {
            in_degree.insert(vertex.name(), vertex.predecessors().count());
        }

        // Seed in declaration order for a stable result
        let mut queue: VecDeque<&str> = self
            .wave(Wave::Main)
            .filter(|v| in_degree.get(v.name()) == Some(&0))
            .map(TaskVertex::name)
            .collect();

        let mut result = Vec::new();
        while let Some(name) = queue.pop_front() {
            if let Some(vertex) = self.vertex(name) {
                result.push(vertex);
            }
            for dependent in self.dependents(name) {
                if let Some(deg) = in_degree.get_mut(dependent.as_str()) {
                    *deg -= 1;
                    if *deg == 0 {
                        queue.push_back(dependent.as_str());
                    }
                }
            }
        }

        result
    }

    /// Main-wave tasks grouped by depth; tasks in one level may run together
    pub fn parallel_levels(&self) -> Vec<Vec<&TaskVertex>> {
        let mut depth: HashMap<&str, usize> = HashMap::new();
        let mut levels: Vec<Vec<&TaskVertex>> = Vec::new();

        for vertex in self.topological_order() {
            let level = vertex
                .predecessors()
                .filter_map(|p| depth.get(p.as_str()))
                .map(|d| d + 1)
                .max()
                .unwrap_or(0);
            depth.insert(vertex.name(), level);
            if levels.len() <= level {
                levels.resize_with(level + 1, Vec::new);
            }
            levels[level].push(vertex);
        }

        levels
    }
}

/// Every template string a task carries
fn task_templates(task: &TaskNode) -> Vec<&str> {
    let mut templates = Vec::new();
    for param in &task.params {
        templates.extend(value_templates(&param.value));
    }
    if let Some(matrix) = &task.matrix {
        for param in matrix
            .params
            .iter()
            .chain(matrix.include.iter().flat_map(|i| i.params.iter()))
        {
            templates.extend(value_templates(&param.value));
        }
    }
    for guard in &task.when {
        templates.extend(guard.templates());
    }
    for binding in &task.workspaces {
        if let Some(sub_path) = &binding.sub_path {
            templates.push(sub_path.as_str());
        }
    }
    templates
}

fn value_templates(value: &ParamValue) -> Vec<&str> {
    match value {
        ParamValue::String(s) => vec![s.as_str()],
        ParamValue::Array(items) => items.iter().map(String::as_str).collect(),
        ParamValue::Object(map) => map.values().map(String::as_str).collect(),
    }
}

/// References a CEL guard makes through its variable bindings rather than
/// `$(...)` text, e.g. `tasks.build.results.digest` or `params.env`.
///
/// Unparseable guards yield nothing; evaluation reports them at run time.
fn binding_references(source: &str) -> Vec<VarRef> {
    let masked = mask_templates(source);
    let Ok(ast) = ExprParser::parse_str(&masked) else {
        return Vec::new();
    };
    let mut refs = Vec::new();
    collect_bindings(&ast, &mut refs);
    refs
}

/// Replace every `$(...)` with `null` so the text parses before substitution
fn mask_templates(source: &str) -> String {
    let mut masked = String::with_capacity(source.len());
    let mut rest = source;
    while let Some(start) = rest.find("$(") {
        let Some(len) = rest[start..].find(')') else { break };
        masked.push_str(&rest[..start]);
        masked.push_str("null");
        rest = &rest[start + len + 1..];
    }
    masked.push_str(rest);
    masked
}

fn collect_bindings(expr: &Expr, refs: &mut Vec<VarRef>) {
    if let Some(path) = binding_path(expr) {
        refs.extend(binding_reference(&path));
        return;
    }
    match expr {
        Expr::Call { args: items, .. } | Expr::List(items) => {
            for item in items {
                collect_bindings(item, refs);
            }
        }
        Expr::Index { object, index } => {
            collect_bindings(object, refs);
            collect_bindings(index, refs);
        }
        Expr::Member { object, .. } => collect_bindings(object, refs),
        Expr::Unary { expr, .. } => collect_bindings(expr, refs),
        Expr::Binary { left, right, .. } => {
            collect_bindings(left, refs);
            collect_bindings(right, refs);
        }
        Expr::Ternary {
            condition,
            then_expr,
            else_expr,
        } => {
            collect_bindings(condition, refs);
            collect_bindings(then_expr, refs);
            collect_bindings(else_expr, refs);
        }
        Expr::Null | Expr::Bool(_) | Expr::Number(_) | Expr::String(_) | Expr::Ident(_) => {}
    }
}

/// Dotted path of a member chain; string-literal indexes count as segments
fn binding_path(expr: &Expr) -> Option<Vec<&str>> {
    match expr {
        Expr::Ident(name) => Some(vec![name.as_str()]),
        Expr::Member { object, property } => {
            let mut path = binding_path(object)?;
            path.push(property.as_str());
            Some(path)
        }
        Expr::Index { object, index } => match index.as_ref() {
            Expr::String(key) => {
                let mut path = binding_path(object)?;
                path.push(key.as_str());
                Some(path)
            }
            _ => None,
        },
        _ => None,
    }
}

fn binding_reference(path: &[&str]) -> Option<VarRef> {
    let result = |task: &str, name: &str| VarRef::Result {
        task: task.to_string(),
        result: name.to_string(),
        selector: Selector::Whole,
    };
    match path {
        ["params", name, ..] => Some(VarRef::Param {
            name: name.to_string(),
            selector: Selector::Whole,
        }),
        ["tasks", "status"] => Some(VarRef::AggregateStatus),
        ["tasks", task, "status"] => Some(VarRef::TaskStatus {
            task: task.to_string(),
        }),
        ["tasks", task, "reason"] => Some(VarRef::TaskReason {
            task: task.to_string(),
        }),
        ["tasks", task, "results", name, ..] => Some(result(*task, *name)),
        // The whole results map
        ["tasks", task] | ["tasks", task, "results"] => Some(result(*task, "")),
        _ => None,
    }
}
