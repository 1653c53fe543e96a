//! Dependency graph of calculation nodes for one calculation configuration.
//!
//! Nodes are added bottom-up: a node can only be added once every value it consumes is
//! produced by a node already in the graph. Node ids are handed out in insertion order, so
//! every input of a node has a smaller id than the node itself. Ascending id order is
//! therefore a topological order, and the input relation can never form a cycle.
//!
//! # Example
//!
//! ```ignore
//! use view_flow::{DependencyGraph, DependencyNode, FunctionId, TargetSpecification};
//!
//! let mut graph = DependencyGraph::new("Default");
//! let spot = graph.add_node(
//!     DependencyNode::builder(FunctionId::market_data(), target.clone())
//!         .output(spot_spec.clone())
//!         .build(),
//! )?;
//! let pv = graph.add_node(
//!     DependencyNode::builder("Black".into(), target)
//!         .input(spot_spec)
//!         .output(pv_spec.clone())
//!         .build(),
//! )?;
//! graph.add_terminal_output(pv_spec.to_requirement(), pv_spec)?;
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use crate::error::GraphError;
use crate::value::{FunctionId, TargetSpecification, ValueRequirement, ValueSpecification};

/// Identifier of a node, stable for the lifetime of the graph and its projections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct NodeId(pub usize);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node-{}", self.0)
    }
}

/// One unit of computation: a function applied to a target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyNode {
    function: FunctionId,
    target: TargetSpecification,
    input_values: BTreeSet<ValueSpecification>,
    outputs: BTreeSet<ValueSpecification>,
}

impl DependencyNode {
    /// Start building a node.
    pub fn builder(function: FunctionId, target: TargetSpecification) -> DependencyNodeBuilder {
        DependencyNodeBuilder {
            node: DependencyNode {
                function,
                target,
                input_values: BTreeSet::new(),
                outputs: BTreeSet::new(),
            },
        }
    }

    /// The function this node executes.
    pub fn function(&self) -> &FunctionId {
        &self.function
    }

    /// The target this node computes for.
    pub fn target(&self) -> &TargetSpecification {
        &self.target
    }

    /// The values this node consumes.
    pub fn input_values(&self) -> &BTreeSet<ValueSpecification> {
        &self.input_values
    }

    /// The values this node produces.
    pub fn outputs(&self) -> &BTreeSet<ValueSpecification> {
        &self.outputs
    }

    /// Returns true if this node is populated from market data instead of executed.
    pub fn is_market_data(&self) -> bool {
        self.function.is_market_data()
    }

    fn structural_key(&self) -> StructuralKey {
        (
            self.function.clone(),
            self.target.clone(),
            self.input_values.clone(),
        )
    }
}

/// Builder for [`DependencyNode`].
#[derive(Debug, Clone)]
pub struct DependencyNodeBuilder {
    node: DependencyNode,
}

impl DependencyNodeBuilder {
    /// Add a consumed value.
    pub fn input(mut self, value: ValueSpecification) -> Self {
        self.node.input_values.insert(value);
        self
    }

    /// Add consumed values.
    pub fn inputs(mut self, values: impl IntoIterator<Item = ValueSpecification>) -> Self {
        self.node.input_values.extend(values);
        self
    }

    /// Add a produced value.
    pub fn output(mut self, value: ValueSpecification) -> Self {
        self.node.outputs.insert(value);
        self
    }

    /// Add produced values.
    pub fn outputs(mut self, values: impl IntoIterator<Item = ValueSpecification>) -> Self {
        self.node.outputs.extend(values);
        self
    }

    /// Finish the node.
    pub fn build(self) -> DependencyNode {
        self.node
    }
}

type StructuralKey = (FunctionId, TargetSpecification, BTreeSet<ValueSpecification>);

#[derive(Debug, Clone)]
struct NodeEntry {
    node: DependencyNode,
    inputs: BTreeSet<NodeId>,
    dependents: BTreeSet<NodeId>,
}

/// Directed acyclic graph of [`DependencyNode`]s for one calculation configuration.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    calculation_configuration: Arc<str>,
    nodes: BTreeMap<NodeId, NodeEntry>,
    producers: ahash::HashMap<ValueSpecification, NodeId>,
    structural: ahash::HashMap<StructuralKey, NodeId>,
    terminal_outputs: BTreeMap<ValueSpecification, BTreeSet<ValueRequirement>>,
    next_id: usize,
}

#[test]
fn test_send_sync() {
    fn assert_send<T: Send>() {}
    fn assert_sync<T: Sync>() {}
    assert_send::<DependencyGraph>();
    assert_sync::<DependencyGraph>();
}

impl DependencyGraph {
    /// Create an empty graph for a calculation configuration.
    pub fn new(calculation_configuration: impl Into<Arc<str>>) -> Self {
        Self {
            calculation_configuration: calculation_configuration.into(),
            nodes: BTreeMap::new(),
            producers: Default::default(),
            structural: Default::default(),
            terminal_outputs: BTreeMap::new(),
            next_id: 0,
        }
    }

    /// Name of the calculation configuration this graph belongs to.
    pub fn calculation_configuration(&self) -> &Arc<str> {
        &self.calculation_configuration
    }

    /// Add a node whose inputs are all produced by nodes already in the graph.
    ///
    /// Adding a node structurally identical to an existing one (same function, target and
    /// inputs) returns the existing id and merges any new outputs into it.
    pub fn add_node(&mut self, node: DependencyNode) -> Result<NodeId, GraphError> {
        let mut inputs = BTreeSet::new();
        for input in &node.input_values {
            let producer = self
                .producers
                .get(input)
                .ok_or_else(|| GraphError::MissingInput {
                    input: input.clone(),
                })?;
            inputs.insert(*producer);
        }

        let key = node.structural_key();
        let existing = self.structural.get(&key).copied();
        for output in &node.outputs {
            match self.producers.get(output) {
                Some(&producer) if Some(producer) != existing => {
                    return Err(GraphError::DuplicateOutput {
                        output: output.clone(),
                        existing: producer,
                    });
                }
                _ => {}
            }
        }

        if let Some(id) = existing {
            let entry = self.nodes.get_mut(&id).ok_or(GraphError::UnknownNode(id))?;
            for output in node.outputs {
                self.producers.insert(output.clone(), id);
                entry.node.outputs.insert(output);
            }
            return Ok(id);
        }

        let id = NodeId(self.next_id);
        self.next_id += 1;
        for input in &inputs {
            if let Some(producer) = self.nodes.get_mut(input) {
                producer.dependents.insert(id);
            }
        }
        for output in &node.outputs {
            self.producers.insert(output.clone(), id);
        }
        self.structural.insert(key, id);
        self.nodes.insert(
            id,
            NodeEntry {
                node,
                inputs,
                dependents: BTreeSet::new(),
            },
        );
        Ok(id)
    }

    /// Declare a terminal output: a value delivered to clients for `requirement`.
    pub fn add_terminal_output(
        &mut self,
        requirement: ValueRequirement,
        specification: ValueSpecification,
    ) -> Result<(), GraphError> {
        if !self.producers.contains_key(&specification) {
            return Err(GraphError::UnknownTerminalOutput(specification));
        }
        self.terminal_outputs
            .entry(specification)
            .or_default()
            .insert(requirement);
        Ok(())
    }

    /// Get a node.
    pub fn node(&self, id: NodeId) -> Option<&DependencyNode> {
        self.nodes.get(&id).map(|entry| &entry.node)
    }

    /// Iterate over all nodes in topological order.
    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &DependencyNode)> {
        self.nodes.iter().map(|(id, entry)| (*id, &entry.node))
    }

    /// All node ids in topological order.
    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes.keys().copied()
    }

    /// Returns true if the node belongs to this graph.
    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if the graph has no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Nodes producing the inputs of `id`.
    pub fn inputs(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes
            .get(&id)
            .into_iter()
            .flat_map(|entry| entry.inputs.iter().copied())
    }

    /// Nodes consuming outputs of `id`.
    pub fn dependents(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes
            .get(&id)
            .into_iter()
            .flat_map(|entry| entry.dependents.iter().copied())
    }

    /// Returns true if the node has no input edges in this graph.
    pub fn is_source(&self, id: NodeId) -> bool {
        self.nodes
            .get(&id)
            .is_some_and(|entry| entry.inputs.is_empty())
    }

    /// Nodes with no input edges.
    pub fn source_nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes
            .iter()
            .filter(|(_, entry)| entry.inputs.is_empty())
            .map(|(id, _)| *id)
    }

    /// The node producing a value.
    pub fn producer_of(&self, specification: &ValueSpecification) -> Option<NodeId> {
        self.producers.get(specification).copied()
    }

    /// Terminal outputs and the requirements each satisfies.
    pub fn terminal_outputs(&self) -> &BTreeMap<ValueSpecification, BTreeSet<ValueRequirement>> {
        &self.terminal_outputs
    }

    /// Specifications of all terminal outputs.
    pub fn terminal_output_specifications(&self) -> impl Iterator<Item = &ValueSpecification> {
        self.terminal_outputs.keys()
    }

    /// Returns true if the value is a terminal output.
    pub fn is_terminal_output(&self, specification: &ValueSpecification) -> bool {
        self.terminal_outputs.contains_key(specification)
    }

    /// Outputs of market-data sourcing nodes; populated from market data every cycle.
    pub fn market_data_specifications(&self) -> impl Iterator<Item = &ValueSpecification> {
        self.nodes
            .values()
            .filter(|entry| entry.node.is_market_data())
            .flat_map(|entry| entry.node.outputs.iter())
    }

    /// Remove nodes and outputs with no path to a terminal output.
    ///
    /// Returns the ids of removed nodes. Surviving nodes keep their ids.
    pub fn remove_unnecessary_values(&mut self) -> BTreeSet<NodeId> {
        let mut needed: BTreeSet<ValueSpecification> =
            self.terminal_outputs.keys().cloned().collect();
        let mut pruned = BTreeSet::new();

        // Consumers always have larger ids than producers, so walking backwards sees every
        // consumer of a value before its producer.
        for (id, entry) in self.nodes.iter_mut().rev() {
            entry.node.outputs.retain(|output| needed.contains(output));
            if entry.node.outputs.is_empty() {
                pruned.insert(*id);
            } else {
                needed.extend(entry.node.input_values.iter().cloned());
            }
        }

        for id in &pruned {
            if let Some(entry) = self.nodes.remove(id) {
                self.structural.remove(&entry.node.structural_key());
            }
        }
        self.producers.retain(|spec, _| needed.contains(spec));
        for entry in self.nodes.values_mut() {
            entry.dependents.retain(|dependent| !pruned.contains(dependent));
        }
        pruned
    }

    /// Project the graph onto a subset of its nodes.
    ///
    /// Edges are kept only when both ends survive; a node whose producer was left out keeps
    /// its input value but loses the edge. Terminal outputs are kept when their producer
    /// survives.
    pub fn subgraph(
        &self,
        ids: impl IntoIterator<Item = NodeId>,
    ) -> Result<DependencyGraph, GraphError> {
        let keep: BTreeSet<NodeId> = ids.into_iter().collect();
        if let Some(unknown) = keep.iter().find(|id| !self.nodes.contains_key(id)) {
            return Err(GraphError::UnknownNode(*unknown));
        }

        let mut graph = DependencyGraph::new(self.calculation_configuration.clone());
        graph.next_id = self.next_id;
        for id in &keep {
            let Some(entry) = self.nodes.get(id) else {
                continue;
            };
            let entry = NodeEntry {
                node: entry.node.clone(),
                inputs: entry.inputs.intersection(&keep).copied().collect(),
                dependents: entry.dependents.intersection(&keep).copied().collect(),
            };
            for output in &entry.node.outputs {
                graph.producers.insert(output.clone(), *id);
            }
            graph.structural.insert(entry.node.structural_key(), *id);
            graph.nodes.insert(*id, entry);
        }
        graph.terminal_outputs = self
            .terminal_outputs
            .iter()
            .filter(|(spec, _)| graph.producers.contains_key(*spec))
            .map(|(spec, requirements)| (spec.clone(), requirements.clone()))
            .collect();
        Ok(graph)
    }
}
