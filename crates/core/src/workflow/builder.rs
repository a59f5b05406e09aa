use super::definition::{FinalOutput, JobNode, NodeInput, WorkflowDefinition};
use crate::error::BuildError;
use crate::types::{JobIdentity, ParamValue, WorkflowId};
use glob::{MatchOptions, Pattern};
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{BTreeMap, HashMap};
use std::path::{Component, Path, PathBuf};

/// Matching rules shared by build-time validation and run-time input expansion
pub(crate) const PATTERN_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// A node input as written by the caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputSpec {
    /// Literal filesystem path
    Path(PathBuf),
    /// Files of another node's outputs matching a glob pattern
    Output { node: String, pattern: String },
}

impl InputSpec {
    pub fn path(path: impl Into<PathBuf>) -> Self {
        Self::Path(path.into())
    }

    pub fn output(node: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self::Output {
            node: node.into(),
            pattern: pattern.into(),
        }
    }
}

/// Specification of a single node
#[derive(Debug, Clone)]
pub struct NodeSpec {
    name: String,
    job_kind: String,
    parameters: BTreeMap<String, ParamValue>,
    inputs: Vec<InputSpec>,
    outputs: Vec<String>,
}

impl NodeSpec {
    pub fn new(name: impl Into<String>, job_kind: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            job_kind: job_kind.into(),
            parameters: BTreeMap::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn input(mut self, input: InputSpec) -> Self {
        self.inputs.push(input);
        self
    }

    pub fn inputs(mut self, inputs: impl IntoIterator<Item = InputSpec>) -> Self {
        self.inputs.extend(inputs);
        self
    }

    /// Declare produced files. A comma-separated list declares several at once.
    pub fn output(mut self, output: &str) -> Self {
        self.outputs.extend(
            output
                .split(',')
                .map(str::trim)
                .filter(|o| !o.is_empty())
                .map(str::to_string),
        );
        self
    }

    pub fn outputs<S: Into<String>>(mut self, outputs: impl IntoIterator<Item = S>) -> Self {
        self.outputs.extend(outputs.into_iter().map(Into::into));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Builds an immutable [`WorkflowDefinition`], deriving dependency edges from
/// input references.
#[derive(Debug, Clone)]
pub struct WorkflowBuilder {
    id: WorkflowId,
    data_dir: PathBuf,
    nodes: Vec<NodeSpec>,
    final_outputs: Vec<(String, FinalOutput)>,
}

impl WorkflowBuilder {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            id: WorkflowId::new(),
            data_dir: data_dir.into(),
            nodes: Vec::new(),
            final_outputs: Vec::new(),
        }
    }

    /// Use a caller-chosen workflow id, e.g. when restarting a known instance
    pub fn with_id(mut self, id: WorkflowId) -> Self {
        self.id = id;
        self
    }

    pub fn id(&self) -> WorkflowId {
        self.id
    }

    pub fn node(mut self, spec: NodeSpec) -> Self {
        self.nodes.push(spec);
        self
    }

    pub fn add_node(&mut self, spec: NodeSpec) -> &mut Self {
        self.nodes.push(spec);
        self
    }

    pub fn final_output(
        mut self,
        name: impl Into<String>,
        node: impl Into<String>,
        file: impl Into<String>,
    ) -> Self {
        self.add_final_output(name, node, file);
        self
    }

    pub fn add_final_output(
        &mut self,
        name: impl Into<String>,
        node: impl Into<String>,
        file: impl Into<String>,
    ) -> &mut Self {
        self.final_outputs.push((
            name.into(),
            FinalOutput {
                node: node.into(),
                file: file.into(),
            },
        ));
        self
    }

    pub fn build(self) -> Result<WorkflowDefinition, BuildError> {
        let workflow_dir = self.data_dir.join(self.id.to_string());
        let mut graph: DiGraph<JobNode, ()> = DiGraph::with_capacity(self.nodes.len(), 0);
        let mut indices: HashMap<String, NodeIndex> = HashMap::new();

        for spec in &self.nodes {
            validate_name(&spec.name)?;
            if indices.contains_key(&spec.name) {
                return Err(BuildError::DuplicateNode(spec.name.clone()));
            }
            for output in &spec.outputs {
                if !is_relative_file(output) {
                    return Err(BuildError::InvalidOutputPath {
                        node: spec.name.clone(),
                        output: output.clone(),
                    });
                }
            }

            let idx = graph.add_node(JobNode {
                name: spec.name.clone(),
                job_kind: spec.job_kind.clone(),
                parameters: spec.parameters.clone(),
                inputs: Vec::new(),
                declared_outputs: spec.outputs.clone(),
                identity: JobIdentity::new(self.id, spec.name.clone()),
                staging_dir: workflow_dir.join(&spec.name),
            });
            indices.insert(spec.name.clone(), idx);
        }

        for spec in &self.nodes {
            let consumer = indices[&spec.name];
            let mut resolved = Vec::with_capacity(spec.inputs.len());

            for input in &spec.inputs {
                match input {
                    InputSpec::Path(path) => resolved.push(NodeInput::Literal { path: path.clone() }),
                    InputSpec::Output { node, pattern } => {
                        let producer = *indices.get(node).ok_or_else(|| {
                            BuildError::UnknownProducer {
                                node: spec.name.clone(),
                                producer: node.clone(),
                            }
                        })?;

                        let compiled = Pattern::new(pattern).map_err(|e| BuildError::InvalidPattern {
                            node: spec.name.clone(),
                            pattern: pattern.clone(),
                            reason: e.msg.to_string(),
                        })?;
                        if !is_relative_file(pattern) {
                            return Err(BuildError::InvalidPattern {
                                node: spec.name.clone(),
                                pattern: pattern.clone(),
                                reason: "pattern must be relative to the producer's staging directory"
                                    .to_string(),
                            });
                        }

                        let matches_declared = graph[producer]
                            .declared_outputs
                            .iter()
                            .any(|o| compiled.matches_with(o, PATTERN_OPTIONS));
                        if !matches_declared {
                            return Err(BuildError::IncompatiblePattern {
                                node: spec.name.clone(),
                                producer: node.clone(),
                                pattern: pattern.clone(),
                            });
                        }

                        graph.update_edge(producer, consumer, ());
                        resolved.push(NodeInput::Staged {
                            producer: node.clone(),
                            pattern: pattern.clone(),
                            path: graph[producer].staging_dir.join(pattern),
                        });
                    }
                }
            }

            graph[consumer].inputs = resolved;
        }

        let mut final_outputs = BTreeMap::new();
        for (name, output) in self.final_outputs {
            if final_outputs.contains_key(&name) {
                return Err(BuildError::DuplicateFinalOutput(name));
            }
            let declared = indices
                .get(&output.node)
                .map(|&idx| graph[idx].declared_outputs.contains(&output.file))
                .unwrap_or(false);
            if !declared {
                return Err(BuildError::UnknownFinalOutput {
                    name,
                    node: output.node,
                    file: output.file,
                });
            }
            final_outputs.insert(name, output);
        }

        let definition =
            WorkflowDefinition::from_graph(self.id, graph, self.data_dir, final_outputs)?;

        tracing::debug!(
            "Workflow definition built: workflow_id={}, nodes={}",
            definition.id(),
            definition.len()
        );

        Ok(definition)
    }
}

fn validate_name(name: &str) -> Result<(), BuildError> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) => {
            first.is_ascii_alphanumeric()
                && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        }
        None => false,
    };

    if valid {
        Ok(())
    } else {
        Err(BuildError::InvalidName(name.to_string()))
    }
}

/// Relative, non-empty, and never escaping its base directory
fn is_relative_file(path: &str) -> bool {
    !path.is_empty()
        && Path::new(path)
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
}
