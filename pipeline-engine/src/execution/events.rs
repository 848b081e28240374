// Execution Events
// Progress reporting and event types for graph runs

use crate::model::{ExecutionStatus, RunStatus, SkipReason, Wave};

use std::time::Duration;
use tokio::sync::mpsc;

/// Sender for execution progress events
pub type ProgressSender = mpsc::UnboundedSender<ExecutionEvent>;

/// Receiver for execution progress events
pub type ProgressReceiver = mpsc::UnboundedReceiver<ExecutionEvent>;

/// Create a new progress channel
pub fn progress_channel() -> (ProgressSender, ProgressReceiver) {
    mpsc::unbounded_channel()
}

/// Events emitted during a run
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionEvent {
    /// Run admitted and main wave starting
    RunStarted {
        run_id: String,
        run_name: String,
        total_tasks: usize,
    },

    /// Both waves finished and the run status is final
    RunCompleted {
        run_id: String,
        status: RunStatus,
        reason: String,
        duration: Duration,
    },

    /// Main wave quiescent, finally nodes being released
    FinallyStarted { total_tasks: usize },

    /// An instance attempt was handed to the executor
    TaskStarted {
        task: String,
        instance: String,
        attempt: u32,
    },

    /// An attempt failed and another one is about to start
    TaskRetrying {
        task: String,
        instance: String,
        attempt: u32,
        message: Option<String>,
    },

    /// A node reached a terminal status after running
    TaskCompleted {
        task: String,
        wave: Wave,
        status: ExecutionStatus,
        reason: Option<String>,
        duration: Duration,
    },

    /// A node became terminal without running
    TaskSkipped {
        task: String,
        status: ExecutionStatus,
        reason: SkipReason,
    },
}

impl ExecutionEvent {
    pub fn run_started(run_id: impl Into<String>, run_name: impl Into<String>, total_tasks: usize) -> Self {
        Self::RunStarted {
            run_id: run_id.into(),
            run_name: run_name.into(),
            total_tasks,
        }
    }

    pub fn run_completed(
        run_id: impl Into<String>,
        status: RunStatus,
        reason: impl Into<String>,
        duration: Duration,
    ) -> Self {
        Self::RunCompleted {
            run_id: run_id.into(),
            status,
            reason: reason.into(),
            duration,
        }
    }

    pub fn task_started(task: impl Into<String>, instance: impl Into<String>, attempt: u32) -> Self {
        Self::TaskStarted {
            task: task.into(),
            instance: instance.into(),
            attempt,
        }
    }

    pub fn task_retrying(
        task: impl Into<String>,
        instance: impl Into<String>,
        attempt: u32,
        message: Option<String>,
    ) -> Self {
        Self::TaskRetrying {
            task: task.into(),
            instance: instance.into(),
            attempt,
            message,
        }
    }

    pub fn task_completed(
        task: impl Into<String>,
        wave: Wave,
        status: ExecutionStatus,
        reason: Option<String>,
        duration: Duration,
    ) -> Self {
        Self::TaskCompleted {
            task: task.into(),
            wave,
            status,
            reason,
            duration,
        }
    }

    pub fn task_skipped(task: impl Into<String>, status: ExecutionStatus, reason: SkipReason) -> Self {
        Self::TaskSkipped {
            task: task.into(),
            status,
            reason,
        }
    }

    /// Node name the event concerns, if any
    pub fn task(&self) -> Option<&str> {
        match self {
            Self::TaskStarted { task, .. }
            | Self::TaskRetrying { task, .. }
            | Self::TaskCompleted { task, .. }
            | Self::TaskSkipped { task, .. } => Some(task),
            _ => None,
        }
    }
}

/// Helper trait for sending events, ignoring errors (fire-and-forget)
pub trait EventSender {
    fn send_event(&self, event: ExecutionEvent);
}

impl EventSender for ProgressSender {
    fn send_event(&self, event: ExecutionEvent) {
        let _ = self.send(event);
    }
}

impl EventSender for Option<ProgressSender> {
    fn send_event(&self, event: ExecutionEvent) {
        if let Some(sender) = self {
            let _ = sender.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_progress_channel() {
        let (tx, mut rx) = progress_channel();

        tx.send_event(ExecutionEvent::run_started("r-1", "nightly", 3));
        tx.send_event(ExecutionEvent::task_started("build", "build", 1));

        let first = rx.recv().await.unwrap();
        assert!(matches!(first, ExecutionEvent::RunStarted { total_tasks: 3, .. }));

        let second = rx.recv().await.unwrap();
        assert_eq!(second.task(), Some("build"));
    }

    #[test]
    fn test_event_construction() {
        let event = ExecutionEvent::task_completed(
            "deploy",
            Wave::Main,
            ExecutionStatus::TimedOut,
            Some("TimedOut".to_string()),
            Duration::from_secs(30),
        );

        if let ExecutionEvent::TaskCompleted {
            task,
            wave,
            status,
            reason,
            duration,
        } = event
        {
            assert_eq!(task, "deploy");
            assert_eq!(wave, Wave::Main);
            assert_eq!(status, ExecutionStatus::TimedOut);
            assert_eq!(reason.as_deref(), Some("TimedOut"));
            assert_eq!(duration, Duration::from_secs(30));
        } else {
            panic!("Expected TaskCompleted event");
        }
    }

    #[test]
    fn test_optional_sender() {
        let sender: Option<ProgressSender> = None;
        // Should not panic
        sender.send_event(ExecutionEvent::task_skipped(
            "lint",
            ExecutionStatus::Skipped,
            SkipReason::WhenExpressionsFalse,
        ));
    }

    #[test]
    fn test_closed_receiver_is_ignored() {
        let (tx, rx) = progress_channel();
        drop(rx);
        tx.send_event(ExecutionEvent::FinallyStarted { total_tasks: 1 });
    }
}
