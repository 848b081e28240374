// Engine Configuration
// Feature gates, limits and per-run inputs

use crate::model::duration;
use crate::model::ParamValue;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Engine-wide configuration, fixed at construction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    /// Allow matrix fan-out
    pub enable_matrix: bool,

    /// Allow `cel` guards
    pub enable_cel_guards: bool,

    /// Upper bound on matrix combinations per node
    pub max_matrix_combinations: usize,

    /// Substitute declared result defaults for missing results
    pub use_result_defaults: bool,

    /// Maximum concurrently running instances (0 = unlimited)
    pub max_parallel: usize,

    /// Timeout applied to tasks that declare none
    #[serde(with = "duration::optional", skip_serializing_if = "Option::is_none")]
    pub default_task_timeout: Option<Duration>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            enable_matrix: true,
            enable_cel_guards: true,
            max_matrix_combinations: 256,
            use_result_defaults: false,
            max_parallel: 0,
            default_task_timeout: None,
        }
    }
}

impl EngineConfig {
    pub fn with_matrix(mut self, enabled: bool) -> Self {
        self.enable_matrix = enabled;
        self
    }

    pub fn with_cel_guards(mut self, enabled: bool) -> Self {
        self.enable_cel_guards = enabled;
        self
    }

    pub fn with_max_matrix_combinations(mut self, max: usize) -> Self {
        self.max_matrix_combinations = max;
        self
    }

    pub fn with_result_defaults(mut self, enabled: bool) -> Self {
        self.use_result_defaults = enabled;
        self
    }

    pub fn with_max_parallel(mut self, max: usize) -> Self {
        self.max_parallel = max;
        self
    }

    pub fn with_default_task_timeout(mut self, timeout: Duration) -> Self {
        self.default_task_timeout = Some(timeout);
        self
    }
}

/// Run-level timeout budgets
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Timeouts {
    /// Whole run, both waves
    #[serde(default, with = "duration::optional", skip_serializing_if = "Option::is_none")]
    pub pipeline: Option<Duration>,

    /// Main wave
    #[serde(default, with = "duration::optional", skip_serializing_if = "Option::is_none")]
    pub tasks: Option<Duration>,

    /// Finally wave
    #[serde(default, with = "duration::optional", skip_serializing_if = "Option::is_none")]
    pub finally: Option<Duration>,
}

/// Workspace bound by a run
///
/// Volume sources (`emptyDir`, `secret`, ...) are left to the executor and ignored here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceInput {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// Inputs for one run
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Run name; generated when empty
    pub name: Option<String>,
    pub namespace: Option<String>,
    /// Exposed as `$(context.pipeline.name)`
    pub pipeline_name: Option<String>,
    pub params: HashMap<String, ParamValue>,
    pub workspaces: Vec<WorkspaceInput>,
    pub timeouts: Timeouts,
}

impl RunOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn with_pipeline_name(mut self, name: impl Into<String>) -> Self {
        self.pipeline_name = Some(name.into());
        self
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    pub fn with_workspace(mut self, name: impl Into<String>, path: Option<&str>) -> Self {
        self.workspaces.push(WorkspaceInput {
            name: name.into(),
            path: path.map(String::from),
        });
        self
    }

    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert!(config.enable_matrix);
        assert!(config.enable_cel_guards);
        assert_eq!(config.max_matrix_combinations, 256);
        assert!(!config.use_result_defaults);
        assert_eq!(config.max_parallel, 0);
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let yaml = r#"
enableCelGuards: false
maxParallel: 4
defaultTaskTimeout: 10m
"#;
        let config: EngineConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(!config.enable_cel_guards);
        assert!(config.enable_matrix);
        assert_eq!(config.max_parallel, 4);
        assert_eq!(config.default_task_timeout, Some(Duration::from_secs(600)));
    }

    #[test]
    fn test_timeouts_yaml() {
        let timeouts: Timeouts = serde_yaml::from_str("pipeline: 1h\nfinally: 5m").unwrap();
        assert_eq!(timeouts.pipeline, Some(Duration::from_secs(3600)));
        assert_eq!(timeouts.tasks, None);
        assert_eq!(timeouts.finally, Some(Duration::from_secs(300)));
    }
}
