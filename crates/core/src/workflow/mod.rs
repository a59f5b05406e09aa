// DAG-based workflow definition and event-driven execution

pub mod builder;
pub mod definition;
pub mod listener;
pub mod materialize;
pub mod scheduler;
pub mod state;

pub use builder::{InputSpec, NodeSpec, WorkflowBuilder};
pub use definition::{FinalOutput, JobNode, NodeInput, WorkflowDefinition, OUTPUT_DIR_NAME};
pub use listener::{CompletionListener, NodeEventListener};
pub use materialize::OutputMaterializer;
pub use scheduler::{WorkflowScheduler, WorkflowStatus};
pub use state::{ExecutionSnapshot, NodeState, WorkflowExecutionState};
