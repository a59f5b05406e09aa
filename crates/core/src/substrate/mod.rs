//! Boundary to the single-job execution substrate.
//!
//! The scheduler only ever talks to a substrate through [`ExecutionSubstrate`]:
//! submit an attempt, query the attempts recorded for a job identity, stop an
//! attempt, and subscribe to completion notifications.

pub mod local;

pub use local::{Job, JobContext, LocalSubstrate};

use crate::types::{AttemptId, JobIdentity, NodeStatus, ParamValue};
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::broadcast;

/// Result-context key naming a directory holding the produced files
pub const OUTPUT_DIR_KEY: &str = "output.dir";
/// Result-context key naming a gzip-compressed tar archive of produced files
pub const OUTPUT_ARCHIVE_KEY: &str = "output.archive";
/// Result-context key naming a zip archive of produced files
pub const OUTPUT_ZIP_KEY: &str = "output.zip";

/// Native status vocabulary of the substrate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Starting,
    Started,
    Stopping,
    Stopped,
    Failed,
    Completed,
    Abandoned,
    Unknown,
}

impl AttemptStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AttemptStatus::Stopped
                | AttemptStatus::Failed
                | AttemptStatus::Completed
                | AttemptStatus::Abandoned
                | AttemptStatus::Unknown
        )
    }
}

impl From<AttemptStatus> for NodeStatus {
    fn from(status: AttemptStatus) -> Self {
        match status {
            AttemptStatus::Starting | AttemptStatus::Started | AttemptStatus::Stopping => {
                NodeStatus::Running
            }
            AttemptStatus::Completed => NodeStatus::Completed,
            AttemptStatus::Failed => NodeStatus::Failed,
            AttemptStatus::Stopped => NodeStatus::Stopped,
            AttemptStatus::Abandoned | AttemptStatus::Unknown => NodeStatus::Abandoned,
        }
    }
}

/// Key/value mapping populated by a node's own logic, pointing at its outputs
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultContext(pub BTreeMap<String, String>);

impl ResultContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn output_dir(dir: impl AsRef<Path>) -> Self {
        let mut ctx = Self::new();
        ctx.insert(OUTPUT_DIR_KEY, dir.as_ref().to_string_lossy());
        ctx
    }

    pub fn output_archive(archive: impl AsRef<Path>) -> Self {
        let mut ctx = Self::new();
        ctx.insert(OUTPUT_ARCHIVE_KEY, archive.as_ref().to_string_lossy());
        ctx
    }

    pub fn output_zip(archive: impl AsRef<Path>) -> Self {
        let mut ctx = Self::new();
        ctx.insert(OUTPUT_ZIP_KEY, archive.as_ref().to_string_lossy());
        ctx
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }
}

/// One execution attempt as persisted by the substrate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempt_id: AttemptId,
    pub status: AttemptStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub result_context: ResultContext,
    pub error: Option<String>,
}

impl AttemptRecord {
    pub fn new(status: AttemptStatus) -> Self {
        Self {
            attempt_id: AttemptId::new(),
            status,
            start_time: Utc::now(),
            end_time: None,
            result_context: ResultContext::new(),
            error: None,
        }
    }
}

/// Pick the attempt that determines a node's status: latest start time wins,
/// later list position breaks ties.
pub fn latest_attempt(records: &[AttemptRecord]) -> Option<&AttemptRecord> {
    records
        .iter()
        .enumerate()
        .max_by_key(|(idx, r)| (r.start_time, *idx))
        .map(|(_, r)| r)
}

/// What gets handed to the substrate for one node attempt
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub identity: JobIdentity,
    pub job_kind: String,
    pub parameters: BTreeMap<String, ParamValue>,
    pub inputs: Vec<PathBuf>,
}

/// Push notification that an attempt reached a terminal state
#[derive(Debug, Clone)]
pub struct AttemptEvent {
    pub identity: JobIdentity,
    pub attempt_id: AttemptId,
    pub status: AttemptStatus,
}

/// Minimal execution substrate interface
#[async_trait::async_trait]
pub trait ExecutionSubstrate: Send + Sync {
    /// Start a new attempt; returns once the attempt is recorded, not when it finishes
    async fn submit(&self, request: SubmitRequest) -> Result<AttemptId>;

    /// All attempts recorded for a job identity
    async fn query_attempts(&self, identity: &JobIdentity) -> Result<Vec<AttemptRecord>>;

    /// Request an attempt to stop. Completion is still reported through `subscribe`.
    async fn stop(&self, attempt_id: AttemptId) -> Result<()>;

    /// Subscribe to attempt completion notifications
    fn subscribe(&self) -> broadcast::Receiver<AttemptEvent>;
}
