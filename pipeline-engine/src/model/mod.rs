// Graph Model
// Typed representation of tasks, parameters, guards, matrix and statuses

pub mod duration;
pub mod params;
pub mod status;
pub mod task;

pub use duration::{format_duration, parse_duration};
pub use params::{Param, ParamKind, ParamSpec, ParamValue};
pub use status::{ExecutionStatus, RunStatus, SkipReason, Wave};
pub use task::{
    Executable, GraphSpec, MatrixInclude, MatrixSpec, OnError, PipelineResult, TaskNode, TaskRef,
    TaskResultSpec, WhenExpression, WhenOperator, WorkspaceBinding, WorkspaceDecl,
};
