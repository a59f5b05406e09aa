use super::definition::WorkflowDefinition;
use crate::error::DefinitionError;
use crate::substrate::{latest_attempt, AttemptRecord, ExecutionSubstrate};
use crate::types::{AttemptId, NodeStatus, WorkflowId};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Runtime view of one node, reflecting its latest attempt only
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeState {
    pub status: NodeStatus,
    pub attempt_id: Option<AttemptId>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl NodeState {
    fn not_started() -> Self {
        Self {
            status: NodeStatus::NotStarted,
            attempt_id: None,
            started_at: None,
            ended_at: None,
            error: None,
        }
    }

    fn from_record(record: &AttemptRecord) -> Self {
        Self {
            status: record.status.into(),
            attempt_id: Some(record.attempt_id),
            started_at: Some(record.start_time),
            ended_at: record.end_time,
            error: record.error.clone(),
        }
    }
}

/// Per-node status of a workflow, reconciled against the substrate's attempt history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecutionState {
    workflow_id: WorkflowId,
    nodes: BTreeMap<String, NodeState>,
}

impl WorkflowExecutionState {
    /// Every node NOT_STARTED
    pub fn new(definition: &WorkflowDefinition) -> Self {
        Self {
            workflow_id: definition.id(),
            nodes: definition
                .nodes()
                .map(|n| (n.name.clone(), NodeState::not_started()))
                .collect(),
        }
    }

    /// Build a fresh state straight from the substrate
    pub async fn load(
        definition: &WorkflowDefinition,
        substrate: &dyn ExecutionSubstrate,
    ) -> Result<Self> {
        let mut state = Self::new(definition);
        state.reload(definition, substrate).await?;
        Ok(state)
    }

    /// Re-query every node's attempts and keep the latest one per node
    pub async fn reload(
        &mut self,
        definition: &WorkflowDefinition,
        substrate: &dyn ExecutionSubstrate,
    ) -> Result<()> {
        for node in definition.nodes() {
            self.reload_node(definition, substrate, &node.name).await?;
        }
        Ok(())
    }

    /// Re-query a single node; returns the attempt now reflected in the state
    pub async fn reload_node(
        &mut self,
        definition: &WorkflowDefinition,
        substrate: &dyn ExecutionSubstrate,
        name: &str,
    ) -> Result<Option<AttemptRecord>> {
        let node = definition.node(name)?;
        let records = substrate
            .query_attempts(&node.identity)
            .await
            .with_context(|| format!("Failed to query attempts for {}", node.identity))?;

        let latest = latest_attempt(&records).cloned();
        let state = match &latest {
            Some(record) => NodeState::from_record(record),
            None => NodeState::not_started(),
        };
        self.nodes.insert(name.to_string(), state);
        Ok(latest)
    }

    pub fn workflow_id(&self) -> WorkflowId {
        self.workflow_id
    }

    /// True iff every node is COMPLETED
    pub fn is_complete(&self) -> bool {
        self.nodes
            .values()
            .all(|n| n.status == NodeStatus::Completed)
    }

    pub fn status_of(&self, name: &str) -> Result<NodeStatus, DefinitionError> {
        self.node(name).map(|n| n.status)
    }

    pub fn node(&self, name: &str) -> Result<&NodeState, DefinitionError> {
        self.nodes
            .get(name)
            .ok_or_else(|| DefinitionError::UnknownNode(name.to_string()))
    }

    pub fn nodes(&self) -> impl Iterator<Item = (&str, &NodeState)> {
        self.nodes.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Names of nodes currently in `status`, sorted
    pub fn nodes_with_status(&self, status: NodeStatus) -> Vec<String> {
        self.nodes
            .iter()
            .filter(|(_, n)| n.status == status)
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Record an attempt observed outside of a reload
    pub(crate) fn record_attempt(&mut self, name: &str, record: &AttemptRecord) {
        self.nodes
            .insert(name.to_string(), NodeState::from_record(record));
    }

    /// A fresh attempt was handed to the substrate
    pub(crate) fn mark_submitted(&mut self, name: &str, attempt_id: AttemptId) {
        self.nodes.insert(
            name.to_string(),
            NodeState {
                status: NodeStatus::Running,
                attempt_id: Some(attempt_id),
                started_at: Some(Utc::now()),
                ended_at: None,
                error: None,
            },
        );
    }

    pub(crate) fn set_status(&mut self, name: &str, status: NodeStatus, error: Option<String>) {
        if let Some(node) = self.nodes.get_mut(name) {
            node.status = status;
            if error.is_some() {
                node.error = error;
            }
            if status.is_terminal() && node.ended_at.is_none() {
                node.ended_at = Some(Utc::now());
            }
        }
    }
}

/// Immutable point-in-time copy handed to listeners and pollers
#[derive(Debug, Clone)]
pub struct ExecutionSnapshot {
    definition: Arc<WorkflowDefinition>,
    state: WorkflowExecutionState,
    taken_at: DateTime<Utc>,
}

impl ExecutionSnapshot {
    pub fn new(definition: Arc<WorkflowDefinition>, state: WorkflowExecutionState) -> Self {
        Self {
            definition,
            state,
            taken_at: Utc::now(),
        }
    }

    pub fn definition(&self) -> &WorkflowDefinition {
        &self.definition
    }

    pub fn state(&self) -> &WorkflowExecutionState {
        &self.state
    }

    pub fn workflow_id(&self) -> WorkflowId {
        self.definition.id()
    }

    pub fn status_of(&self, name: &str) -> Result<NodeStatus, DefinitionError> {
        self.state.status_of(name)
    }

    pub fn is_complete(&self) -> bool {
        self.state.is_complete()
    }

    pub fn taken_at(&self) -> DateTime<Utc> {
        self.taken_at
    }
}
