//! Error types for building, querying and scheduling workflows.

use crate::types::WorkflowPhase;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while building a workflow definition. None of them leave a
/// partially built workflow behind.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("invalid node name '{0}'")]
    InvalidName(String),

    #[error("duplicate node name '{0}'")]
    DuplicateNode(String),

    #[error("node '{node}' references unknown producer '{producer}'")]
    UnknownProducer { node: String, producer: String },

    #[error("node '{node}' references '{pattern}' but '{producer}' declares no matching output")]
    IncompatiblePattern {
        node: String,
        producer: String,
        pattern: String,
    },

    #[error("invalid pattern '{pattern}' in node '{node}': {reason}")]
    InvalidPattern {
        node: String,
        pattern: String,
        reason: String,
    },

    #[error("node '{node}' declares output '{output}' that is not a relative path")]
    InvalidOutputPath { node: String, output: String },

    #[error("cycle detected involving node '{0}'")]
    CycleDetected(String),

    #[error("duplicate final output '{0}'")]
    DuplicateFinalOutput(String),

    #[error("final output '{name}' refers to '{file}' which node '{node}' does not declare")]
    UnknownFinalOutput {
        name: String,
        node: String,
        file: String,
    },
}

/// Errors raised by definition lookups
#[derive(Debug, Error)]
pub enum DefinitionError {
    #[error("unknown node '{0}'")]
    UnknownNode(String),

    #[error("unknown final output '{0}'")]
    UnknownFinalOutput(String),
}

/// Protocol errors returned synchronously from `start`, `stop` and `poll`.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("workflow is already running")]
    AlreadyRunning,

    #[error("workflow is already complete")]
    AlreadyComplete,

    #[error("workflow is stuck on abandoned nodes: {}", nodes.join(", "))]
    Stuck { nodes: Vec<String> },

    #[error("workflow was never started")]
    NotStarted,

    #[error("workflow is not running (phase: {phase})")]
    NotRunning { phase: WorkflowPhase },

    #[error("workflow is already stopping")]
    AlreadyStopping,

    #[error("execution substrate error: {0}")]
    Substrate(#[from] anyhow::Error),
}

/// Errors raised while placing a node's outputs into its staging directory
#[derive(Debug, Error)]
pub enum MaterializeError {
    #[error("result context has no output location")]
    MissingResultLocation,

    #[error("declared output '{0}' was not produced")]
    MissingOutput(String),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("archive error: {0}")]
    Archive(String),
}

impl MaterializeError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
