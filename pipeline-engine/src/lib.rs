// Pipeline Engine Library
// Resolves, schedules and runs Tekton-style task graphs

pub mod config;
pub mod document;
pub mod error;
pub mod execution;
pub mod executor;
pub mod expression;
pub mod guard;
pub mod model;
pub mod resolver;
pub mod substitution;
pub mod testing;

// Re-export commonly used types
pub use config::{EngineConfig, RunOptions, Timeouts, WorkspaceInput};
pub use error::{EngineError, EngineResult, GraphError, GraphErrorKind};

// Re-export document types
pub use document::{
    DocumentError, DocumentValidator, GraphDocument, StructuralValidator, ValidationError,
    ValidationOutcome,
};

// Re-export execution types
pub use execution::{
    progress_channel, CancelHandle, ExecutionEvent, PipelineEngine, ProgressReceiver,
    ProgressSender, RunReport, TaskRecord,
};
pub use executor::{NoopExecutor, OutcomeStatus, TaskExecutor, TaskOutcome, TaskRequest};
pub use expression::{BuiltinEvaluator, ExpressionEvaluator};
pub use model::{
    ExecutionStatus, GraphSpec, OnError, Param, ParamKind, ParamSpec, ParamValue, RunStatus,
    SkipReason, TaskNode, Wave, WhenExpression, WhenOperator,
};
pub use resolver::ExecutionGraph;
