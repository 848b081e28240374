// Execution Status
// Per-instance state machine values, run status and skip reasons

use serde::{Deserialize, Serialize};
use std::fmt;

/// Which wave a node belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Wave {
    Main,
    Finally,
}

impl fmt::Display for Wave {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Wave::Main => write!(f, "main"),
            Wave::Finally => write!(f, "finally"),
        }
    }
}

/// Status of a single task instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ExecutionStatus {
    Pending,
    Skipped,
    Running,
    Succeeded,
    Failed { ignored: bool },
    Cancelled,
    TimedOut,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionStatus::Pending | ExecutionStatus::Running)
    }

    /// A failure that counts against the run
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Failed { ignored: false }
                | ExecutionStatus::TimedOut
                | ExecutionStatus::Cancelled
        )
    }

    /// Terminal outcomes a retry may follow
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Failed { .. } | ExecutionStatus::TimedOut
        )
    }

    /// Value exposed to finally nodes as `$(tasks.<name>.status)`
    pub fn task_state(&self) -> &'static str {
        match self {
            ExecutionStatus::Succeeded => "Succeeded",
            ExecutionStatus::Failed { .. } | ExecutionStatus::TimedOut => "Failed",
            _ => "None",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionStatus::Pending => write!(f, "Pending"),
            ExecutionStatus::Skipped => write!(f, "Skipped"),
            ExecutionStatus::Running => write!(f, "Running"),
            ExecutionStatus::Succeeded => write!(f, "Succeeded"),
            ExecutionStatus::Failed { ignored: false } => write!(f, "Failed"),
            ExecutionStatus::Failed { ignored: true } => write!(f, "Failed (ignored)"),
            ExecutionStatus::Cancelled => write!(f, "Cancelled"),
            ExecutionStatus::TimedOut => write!(f, "TimedOut"),
        }
    }
}

/// Aggregate run status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RunStatus {
    Started,
    Running,
    Succeeded,
    Completed,
    Failed,
}

impl RunStatus {
    /// Value exposed to finally nodes as `$(tasks.status)`
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Succeeded => "Succeeded",
            RunStatus::Completed => "Completed",
            RunStatus::Failed => "Failed",
            RunStatus::Started | RunStatus::Running => "None",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Started => write!(f, "Started"),
            RunStatus::Running => write!(f, "Running"),
            other => write!(f, "{}", other.as_str()),
        }
    }
}

/// Why a node was skipped or cancelled without running
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SkipReason {
    WhenExpressionsFalse,
    GuardUnresolved,
    MissingResults,
    MatrixEmpty,
    ParentTasksFailed,
    RunStopping,
    RunCancelled,
    RunTimedOut,
    FinallyTimedOut,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::WhenExpressionsFalse => "WhenExpressionsFalse",
            SkipReason::GuardUnresolved => "GuardUnresolved",
            SkipReason::MissingResults => "MissingResults",
            SkipReason::MatrixEmpty => "MatrixEmpty",
            SkipReason::ParentTasksFailed => "ParentTasksFailed",
            SkipReason::RunStopping => "RunStopping",
            SkipReason::RunCancelled => "RunCancelled",
            SkipReason::RunTimedOut => "RunTimedOut",
            SkipReason::FinallyTimedOut => "FinallyTimedOut",
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(!ExecutionStatus::Pending.is_terminal());
        assert!(!ExecutionStatus::Running.is_terminal());
        assert!(ExecutionStatus::Skipped.is_terminal());
        assert!(ExecutionStatus::Failed { ignored: true }.is_terminal());
        assert!(ExecutionStatus::TimedOut.is_terminal());
    }

    #[test]
    fn test_ignored_failure_is_not_a_failure() {
        assert!(ExecutionStatus::Failed { ignored: false }.is_failure());
        assert!(!ExecutionStatus::Failed { ignored: true }.is_failure());
        assert!(!ExecutionStatus::Skipped.is_failure());
    }

    #[test]
    fn test_task_state_strings() {
        assert_eq!(ExecutionStatus::Succeeded.task_state(), "Succeeded");
        assert_eq!(ExecutionStatus::TimedOut.task_state(), "Failed");
        assert_eq!(ExecutionStatus::Skipped.task_state(), "None");
        assert_eq!(ExecutionStatus::Cancelled.task_state(), "None");
    }
}
