// Variable Substitution Engine
// Resolves $(...) templates against params, results, workspaces and run context

pub mod reference;
pub mod resolve;

pub use reference::{references, scan, ContextVar, Segment, Selector, VarRef, WorkspaceField};
pub use resolve::{ResultLookup, RunState, Substitutor};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubstitutionError {
    #[error("malformed reference '{reference}': {message}")]
    Malformed { reference: String, message: String },

    #[error("unknown parameter '{0}'")]
    UnknownParam(String),

    #[error("result '{result}' of task '{task}' is not available")]
    MissingResult {
        task: String,
        result: String,
        /// The producer was skipped rather than terminating without the result
        producer_skipped: bool,
    },

    #[error("index {index} out of range for '{reference}' ({len} elements)")]
    IndexOutOfRange {
        reference: String,
        index: usize,
        len: usize,
    },

    #[error("key '{key}' not found in '{reference}'")]
    MissingKey { reference: String, key: String },

    #[error("type mismatch in '{reference}': {message}")]
    TypeMismatch { reference: String, message: String },

    #[error("'{reference}' is not available here")]
    Unavailable { reference: String },
}

impl SubstitutionError {
    pub fn is_missing_result(&self) -> bool {
        matches!(self, SubstitutionError::MissingResult { .. })
    }
}

/// Metadata about the current run, exposed as `$(context.*)`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunContext {
    pub run_name: String,
    pub namespace: String,
    pub run_uid: String,
    pub pipeline_name: String,
}
