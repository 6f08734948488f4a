//! Flat dataflow graph produced by the builders.
//!
//! Nodes live in an arena addressed by [`NodeId`] (their position in traversal order). Edges
//! are [`TensorRef`]s into that arena, never owning pointers, so a node can refer to a
//! producer that assembly later excluded from the indexed node list (a weight producer, for
//! instance) and still resolve it.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use smallvec::SmallVec;

use crate::error::{BuildError, Result};
use crate::ir::types::{DType, Shape};

/// Named value flowing between nodes, or a constant parameter attached to one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Tensor {
    pub name: String,
    pub dtype: DType,
    pub layout: String,
    pub shape: Shape,
    /// Human-facing name, only assigned to graph inputs and outputs.
    pub alias: Option<String>,
}

impl Tensor {
    pub fn new(
        name: impl Into<String>,
        dtype: DType,
        layout: impl Into<String>,
        shape: Shape,
    ) -> Self {
        Self {
            name: name.into(),
            dtype,
            layout: layout.into(),
            shape,
            alias: None,
        }
    }

    pub fn alias(&self) -> &str {
        self.alias.as_deref().unwrap_or("")
    }

    pub fn rank(&self) -> usize {
        self.shape.rank()
    }

    pub fn element_count(&self) -> Option<usize> {
        self.shape.element_count()
    }
}

impl fmt::Display for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}<{}|{}", self.name, self.dtype, self.shape)?;
        if !self.layout.is_empty() {
            write!(f, "|{}", self.layout)?;
        }
        f.write_str(">")
    }
}

/// Position of a node in the build arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u32);

/// Output slot `slot` of node `node`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TensorRef {
    pub node: NodeId,
    pub slot: usize,
}

/// One operator invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub id: NodeId,
    /// Dense position in the graph's node list; `None` for excluded nodes.
    pub index: Option<usize>,
    pub name: String,
    pub shared_ref: Option<String>,
    pub op_type: String,
    pub attrs: BTreeMap<String, String>,
    pub scope: Vec<String>,
    pub inputs: SmallVec<[TensorRef; 4]>,
    pub outputs: Vec<Tensor>,
    /// Constant parameters keyed by role (`weight`, `bias`, `gamma`, ...).
    pub weights: BTreeMap<String, Arc<Tensor>>,
}

impl Node {
    pub fn output_at(&self, slot: usize) -> Option<&Tensor> {
        self.outputs.get(slot)
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs.get(key).map(String::as_str)
    }

    pub fn weight(&self, role: &str) -> Option<&Arc<Tensor>> {
        self.weights.get(role)
    }
}

/// Immutable result of lowering one host function.
#[derive(Debug, Clone)]
pub struct Graph {
    name: String,
    arena: Vec<Node>,
    order: Vec<NodeId>,
    inputs: Vec<String>,
    outputs: Vec<String>,
    producers: HashMap<String, TensorRef>,
    weights: BTreeMap<String, Arc<Tensor>>,
}

impl Graph {
    /// `order` lists the kept nodes; their `index` fields must already match their position.
    pub(crate) fn new(
        name: impl Into<String>,
        arena: Vec<Node>,
        order: Vec<NodeId>,
        inputs: Vec<String>,
        outputs: Vec<String>,
        weights: BTreeMap<String, Arc<Tensor>>,
    ) -> Self {
        let mut producers = HashMap::new();
        for node in &arena {
            for (slot, output) in node.outputs.iter().enumerate() {
                producers.insert(
                    output.name.clone(),
                    TensorRef {
                        node: node.id,
                        slot,
                    },
                );
            }
        }
        Self {
            name: name.into(),
            arena,
            order,
            inputs,
            outputs,
            producers,
            weights,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Kept nodes in index order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> + '_ {
        self.order
            .iter()
            .filter_map(|id| self.arena.get(id.0 as usize))
    }

    pub fn node_count(&self) -> usize {
        self.order.len()
    }

    /// Any node built for this graph, including excluded weight producers.
    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.arena.get(id.0 as usize)
    }

    /// Looks up a kept node by name.
    pub fn find_node(&self, name: &str) -> Result<&Node> {
        self.nodes()
            .find(|node| node.name == name)
            .ok_or_else(|| BuildError::UnknownNode {
                name: name.to_string(),
            })
    }

    pub fn input_names(&self) -> &[String] {
        &self.inputs
    }

    pub fn output_names(&self) -> &[String] {
        &self.outputs
    }

    pub fn input_tensors(&self) -> Result<Vec<&Tensor>> {
        self.inputs.iter().map(|name| self.find_tensor(name)).collect()
    }

    pub fn output_tensors(&self) -> Result<Vec<&Tensor>> {
        self.outputs
            .iter()
            .map(|name| self.find_tensor(name))
            .collect()
    }

    /// Resolves a node output by name, falling back to the weight table.
    pub fn find_tensor(&self, name: &str) -> Result<&Tensor> {
        if let Some(tensor) = self.producers.get(name).and_then(|r| self.resolve(*r)) {
            return Ok(tensor);
        }
        self.weights
            .get(name)
            .map(|weight| weight.as_ref())
            .ok_or_else(|| BuildError::UnknownTensor {
                name: name.to_string(),
            })
    }

    pub fn find_producer(&self, name: &str) -> Result<&Node> {
        self.producers
            .get(name)
            .and_then(|r| self.node(r.node))
            .ok_or_else(|| BuildError::UnknownTensor {
                name: name.to_string(),
            })
    }

    /// Tensor referenced by an input edge.
    pub fn resolve(&self, tensor: TensorRef) -> Option<&Tensor> {
        self.node(tensor.node)?.output_at(tensor.slot)
    }

    /// Kept nodes consuming `name` as a dataflow input.
    pub fn consumers(&self, name: &str) -> Vec<&Node> {
        let Some(target) = self.producers.get(name).copied() else {
            return Vec::new();
        };
        self.nodes()
            .filter(|node| node.inputs.contains(&target))
            .collect()
    }

    pub fn weights(&self) -> &BTreeMap<String, Arc<Tensor>> {
        &self.weights
    }

    pub fn find_weight(&self, name: &str) -> Option<&Arc<Tensor>> {
        self.weights.get(name)
    }

    pub(crate) fn set_alias(&mut self, name: &str, alias: impl Into<String>) -> Result<()> {
        let target = self
            .producers
            .get(name)
            .copied()
            .ok_or_else(|| BuildError::UnknownTensor {
                name: name.to_string(),
            })?;
        let tensor = self
            .arena
            .get_mut(target.node.0 as usize)
            .and_then(|node| node.outputs.get_mut(target.slot))
            .ok_or_else(|| BuildError::UnknownTensor {
                name: name.to_string(),
            })?;
        tensor.alias = Some(alias.into());
        Ok(())
    }
}
