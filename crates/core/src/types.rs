use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a workflow instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkflowId(pub Uuid);

impl WorkflowId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for WorkflowId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of one execution attempt recorded by the substrate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AttemptId(pub Uuid);

impl AttemptId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for AttemptId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for AttemptId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Globally-qualified job identity: the same node of the same workflow
/// instance always maps to the same identity, distinct instances never collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobIdentity {
    pub workflow_id: WorkflowId,
    pub node: String,
}

impl JobIdentity {
    pub fn new(workflow_id: WorkflowId, node: impl Into<String>) -> Self {
        Self {
            workflow_id,
            node: node.into(),
        }
    }
}

impl std::fmt::Display for JobIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.workflow_id, self.node)
    }
}

/// Typed job parameter value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ParamValue {
    String(String),
    Integer(i64),
    Float(f64),
    Timestamp(DateTime<Utc>),
}

impl ParamValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            Self::Integer(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Timestamp(t) => Some(*t),
            _ => None,
        }
    }
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<i64> for ParamValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<f64> for ParamValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<DateTime<Utc>> for ParamValue {
    fn from(value: DateTime<Utc>) -> Self {
        Self::Timestamp(value)
    }
}

/// Status of a single node, derived from its latest attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    NotStarted,
    Running,
    Completed,
    Failed,
    Stopped,
    Abandoned,
}

impl NodeStatus {
    /// Whether the underlying attempt can no longer change on its own
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NodeStatus::Completed | NodeStatus::Failed | NodeStatus::Stopped | NodeStatus::Abandoned
        )
    }
}

/// Scheduler phase of a workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowPhase {
    Running,
    Stopping,
    Completed,
    Failed,
    Stopped,
}

impl WorkflowPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowPhase::Completed | WorkflowPhase::Failed | WorkflowPhase::Stopped
        )
    }
}

impl std::fmt::Display for WorkflowPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorkflowPhase::Running => "running",
            WorkflowPhase::Stopping => "stopping",
            WorkflowPhase::Completed => "completed",
            WorkflowPhase::Failed => "failed",
            WorkflowPhase::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_param_value_wire_format() {
        let json = serde_json::to_value(ParamValue::from(3i64)).unwrap();
        assert_eq!(json, serde_json::json!({"type": "integer", "value": 3}));

        let parsed: ParamValue =
            serde_json::from_str(r#"{"type": "string", "value": "a.txt"}"#).unwrap();
        assert_eq!(parsed.as_str(), Some("a.txt"));
        assert_eq!(parsed.as_i64(), None);
    }

    #[test]
    fn test_terminal_states() {
        assert!(!NodeStatus::Running.is_terminal());
        assert!(NodeStatus::Abandoned.is_terminal());
        assert!(!WorkflowPhase::Stopping.is_terminal());
        assert_eq!(WorkflowPhase::Stopped.to_string(), "stopped");
    }

    #[test]
    fn test_identity_display() {
        let id = WorkflowId::new();
        assert_eq!(JobIdentity::new(id, "sort-0001").to_string(), format!("{}/sort-0001", id));
    }
}
