// Core types and functionality for the jobgraph workflow engine

pub mod config;
pub mod error;
pub mod jobs;
pub mod substrate;
pub mod types;
pub mod workflow;

pub use config::SchedulerConfig;
pub use error::{BuildError, DefinitionError, MaterializeError, SchedulerError};
pub use substrate::{
    AttemptEvent, AttemptRecord, AttemptStatus, ExecutionSubstrate, Job, JobContext,
    LocalSubstrate, ResultContext, SubmitRequest,
};
pub use types::*;
pub use workflow::{
    CompletionListener, ExecutionSnapshot, InputSpec, NodeEventListener, NodeSpec,
    WorkflowBuilder, WorkflowDefinition, WorkflowScheduler, WorkflowStatus,
};
