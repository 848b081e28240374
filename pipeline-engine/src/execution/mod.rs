// Execution Engine Module
// Run coordination, matrix fan-out, result collection and reporting

pub mod coordinator;
pub mod events;
pub mod matrix;
pub mod report;
pub mod results;

// Re-export key types
pub use coordinator::{CancelHandle, PipelineEngine};
pub use events::{progress_channel, EventSender, ExecutionEvent, ProgressReceiver, ProgressSender};
pub use matrix::{Combination, MatrixError, MatrixExpander};
pub use report::{RunReport, SkippedTask, StopCause};
pub use results::{InstanceRecord, ResultCollector, TaskRecord};
