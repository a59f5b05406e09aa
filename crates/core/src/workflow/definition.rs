use crate::error::{BuildError, DefinitionError};
use crate::types::{JobIdentity, ParamValue, WorkflowId};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap};
use std::path::{Path, PathBuf};

/// Name of the directory under the workflow directory where final outputs are published
pub const OUTPUT_DIR_NAME: &str = "_outputs";

/// A resolved node input
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeInput {
    /// Plain filesystem path, no dependency
    Literal { path: PathBuf },
    /// Files matching `pattern` in the producer's staging directory
    Staged {
        producer: String,
        pattern: String,
        path: PathBuf,
    },
}

impl NodeInput {
    pub fn path(&self) -> &Path {
        match self {
            NodeInput::Literal { path } | NodeInput::Staged { path, .. } => path,
        }
    }

    pub fn producer(&self) -> Option<&str> {
        match self {
            NodeInput::Literal { .. } => None,
            NodeInput::Staged { producer, .. } => Some(producer),
        }
    }
}

/// One schedulable node of a workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobNode {
    pub name: String,
    pub job_kind: String,
    pub parameters: BTreeMap<String, ParamValue>,
    pub inputs: Vec<NodeInput>,
    pub declared_outputs: Vec<String>,
    pub identity: JobIdentity,
    pub staging_dir: PathBuf,
}

/// A staged file exposed under a caller-chosen name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalOutput {
    pub node: String,
    pub file: String,
}

/// Immutable DAG of job nodes plus its staging layout.
///
/// Nodes live in a petgraph arena; edges point from producer to consumer.
#[derive(Debug)]
pub struct WorkflowDefinition {
    id: WorkflowId,
    graph: DiGraph<JobNode, ()>,
    indices: HashMap<String, NodeIndex>,
    topo_order: Vec<NodeIndex>,
    data_dir: PathBuf,
    final_outputs: BTreeMap<String, FinalOutput>,
}

impl WorkflowDefinition {
    /// Assemble a definition from an already-validated graph. Fails if the graph has a cycle.
    pub(crate) fn from_graph(
        id: WorkflowId,
        graph: DiGraph<JobNode, ()>,
        data_dir: PathBuf,
        final_outputs: BTreeMap<String, FinalOutput>,
    ) -> Result<Self, BuildError> {
        if let Err(cycle) = petgraph::algo::toposort(&graph, None) {
            return Err(BuildError::CycleDetected(graph[cycle.node_id()].name.clone()));
        }

        let indices = graph
            .node_indices()
            .map(|idx| (graph[idx].name.clone(), idx))
            .collect();
        let topo_order = stable_topological_order(&graph);

        Ok(Self {
            id,
            graph,
            indices,
            topo_order,
            data_dir,
            final_outputs,
        })
    }

    pub fn id(&self) -> WorkflowId {
        self.id
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Node names in insertion order
    pub fn node_names(&self) -> Vec<&str> {
        self.nodes().map(|n| n.name.as_str()).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.indices.contains_key(name)
    }

    pub fn node(&self, name: &str) -> Result<&JobNode, DefinitionError> {
        self.index(name).map(|idx| &self.graph[idx])
    }

    /// Nodes in insertion order
    pub fn nodes(&self) -> impl Iterator<Item = &JobNode> {
        self.graph.node_indices().map(move |idx| &self.graph[idx])
    }

    /// Dependencies first; ties broken by insertion order
    pub fn nodes_in_topological_order(&self) -> Vec<&JobNode> {
        self.topo_order.iter().map(|&idx| &self.graph[idx]).collect()
    }

    /// Producers this node reads from, in insertion order
    pub fn dependencies(&self, name: &str) -> Result<Vec<&str>, DefinitionError> {
        self.neighbors(name, Direction::Incoming)
    }

    /// Consumers of this node's outputs, in insertion order
    pub fn dependents(&self, name: &str) -> Result<Vec<&str>, DefinitionError> {
        self.neighbors(name, Direction::Outgoing)
    }

    /// Nodes without dependencies
    pub fn roots(&self) -> Vec<&str> {
        self.graph
            .node_indices()
            .filter(|&idx| {
                self.graph
                    .neighbors_directed(idx, Direction::Incoming)
                    .next()
                    .is_none()
            })
            .map(|idx| self.graph[idx].name.as_str())
            .collect()
    }

    pub fn staging_directory(&self, name: &str) -> Result<&Path, DefinitionError> {
        Ok(&self.node(name)?.staging_dir)
    }

    pub fn data_directory(&self) -> &Path {
        &self.data_dir
    }

    /// `dataDirectory/<workflow id>`: parent of every staging directory
    pub fn workflow_directory(&self) -> PathBuf {
        self.data_dir.join(self.id.to_string())
    }

    /// Where final outputs are published once the workflow completes
    pub fn output_directory(&self) -> PathBuf {
        self.workflow_directory().join(OUTPUT_DIR_NAME)
    }

    pub fn final_outputs(&self) -> &BTreeMap<String, FinalOutput> {
        &self.final_outputs
    }

    /// Published location of a final output
    pub fn final_output_path(&self, name: &str) -> Result<PathBuf, DefinitionError> {
        if !self.final_outputs.contains_key(name) {
            return Err(DefinitionError::UnknownFinalOutput(name.to_string()));
        }
        Ok(self.output_directory().join(name))
    }

    /// Staged location of a final output inside its producer's staging directory
    pub fn final_output_source(&self, name: &str) -> Result<PathBuf, DefinitionError> {
        let output = self
            .final_outputs
            .get(name)
            .ok_or_else(|| DefinitionError::UnknownFinalOutput(name.to_string()))?;
        Ok(self.staging_directory(&output.node)?.join(&output.file))
    }

    fn index(&self, name: &str) -> Result<NodeIndex, DefinitionError> {
        self.indices
            .get(name)
            .copied()
            .ok_or_else(|| DefinitionError::UnknownNode(name.to_string()))
    }

    fn neighbors(&self, name: &str, direction: Direction) -> Result<Vec<&str>, DefinitionError> {
        let idx = self.index(name)?;
        let mut neighbors: Vec<NodeIndex> =
            self.graph.neighbors_directed(idx, direction).collect();
        neighbors.sort();
        neighbors.dedup();
        Ok(neighbors
            .into_iter()
            .map(|n| self.graph[n].name.as_str())
            .collect())
    }
}

/// Kahn's algorithm, always releasing the earliest-inserted ready node first
fn stable_topological_order(graph: &DiGraph<JobNode, ()>) -> Vec<NodeIndex> {
    let mut in_degree: Vec<usize> = graph
        .node_indices()
        .map(|idx| graph.neighbors_directed(idx, Direction::Incoming).count())
        .collect();

    let mut ready: BinaryHeap<Reverse<NodeIndex>> = graph
        .node_indices()
        .filter(|idx| in_degree[idx.index()] == 0)
        .map(Reverse)
        .collect();

    let mut order = Vec::with_capacity(graph.node_count());
    while let Some(Reverse(idx)) = ready.pop() {
        order.push(idx);
        for next in graph.neighbors_directed(idx, Direction::Outgoing) {
            in_degree[next.index()] -= 1;
            if in_degree[next.index()] == 0 {
                ready.push(Reverse(next));
            }
        }
    }
    order
}
