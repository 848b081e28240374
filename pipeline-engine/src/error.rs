// Engine Errors
// Construction-time graph errors and run admission errors

use std::fmt;
use thiserror::Error;

pub type EngineResult<T> = Result<T, EngineError>;

/// Error raised while resolving a graph
#[derive(Debug, Clone)]
pub struct GraphError {
    pub message: String,
    pub kind: GraphErrorKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphErrorKind {
    /// Circular dependency detected
    CyclicDependency,
    /// Reference to an unknown task, parameter or workspace
    UnknownReference,
    /// Structurally invalid graph (duplicates, misplaced edges)
    InvalidGraph,
    /// Contradictory task settings
    InvalidConfiguration,
    /// Use of a feature switched off in the engine config
    FeatureDisabled,
}

impl fmt::Display for GraphErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GraphErrorKind::CyclicDependency => "CyclicDependency",
            GraphErrorKind::UnknownReference => "UnknownReference",
            GraphErrorKind::InvalidGraph => "InvalidGraph",
            GraphErrorKind::InvalidConfiguration => "InvalidConfiguration",
            GraphErrorKind::FeatureDisabled => "FeatureDisabled",
        };
        write!(f, "{}", name)
    }
}

impl fmt::Display for GraphError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "graph error ({}): {}", self.kind, self.message)
    }
}

impl std::error::Error for GraphError {}

impl GraphError {
    pub fn cyclic(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: GraphErrorKind::CyclicDependency,
        }
    }

    pub fn unknown_reference(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: GraphErrorKind::UnknownReference,
        }
    }

    pub fn invalid_graph(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: GraphErrorKind::InvalidGraph,
        }
    }

    pub fn invalid_configuration(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: GraphErrorKind::InvalidConfiguration,
        }
    }

    pub fn feature_disabled(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: GraphErrorKind::FeatureDisabled,
        }
    }

    /// Prefix the message with the enclosing task, for errors raised in embedded graphs
    pub fn within(mut self, task: &str) -> Self {
        self.message = format!("in embedded graph of '{}': {}", task, self.message);
        self
    }
}

/// Errors that abort a run before any task starts
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error("invalid value for parameter '{name}': {message}")]
    InvalidParamValue { name: String, message: String },

    #[error("workspace '{0}' is required but was not bound")]
    UnboundWorkspace(String),
}

impl EngineError {
    pub fn invalid_param(name: impl Into<String>, message: impl Into<String>) -> Self {
        EngineError::InvalidParamValue {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Graph error kind, if this is a construction-time error
    pub fn graph_kind(&self) -> Option<&GraphErrorKind> {
        match self {
            EngineError::Graph(err) => Some(&err.kind),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_graph_error_display() {
        let err = GraphError::cyclic("a -> b -> a");
        assert_eq!(err.to_string(), "graph error (CyclicDependency): a -> b -> a");
    }

    #[test]
    fn test_within_prefixes_message() {
        let err = GraphError::unknown_reference("task 'x' not found").within("sub");
        assert!(err.message.starts_with("in embedded graph of 'sub'"));
        assert_eq!(err.kind, GraphErrorKind::UnknownReference);
    }

    #[test]
    fn test_engine_error_from_graph_error() {
        let err: EngineError = GraphError::invalid_graph("duplicate").into();
        assert_eq!(err.graph_kind(), Some(&GraphErrorKind::InvalidGraph));

        let err = EngineError::invalid_param("env", "expected string");
        assert_eq!(
            err.to_string(),
            "invalid value for parameter 'env': expected string"
        );
    }
}
