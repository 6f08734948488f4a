//! Working state of one graph build, shared by both dialect drivers.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use smallvec::SmallVec;

use crate::attrs::AttrMap;
use crate::error::{BuildError, Result};
use crate::graph::{Node, NodeId, Tensor, TensorRef};
use crate::ir::arena::ExprId;
use crate::ir::types::{DType, Dimension, Shape, StructInfo};
use crate::roles::{BIAS, WEIGHT};

/// Output tensor names produced for one expression.
pub(crate) type TensorNames = SmallVec<[String; 2]>;

pub(crate) const SCALAR_ATTR: &str = "scalar";
pub(crate) const CONST_ROLE: &str = "const";

/// Everything needed to register a node except its outputs' names.
#[derive(Debug)]
pub(crate) struct NodeSpec<'a> {
    pub name: String,
    pub shared_ref: Option<String>,
    pub op_type: String,
    pub attrs: AttrMap,
    pub scope: Vec<String>,
    pub input_names: Vec<String>,
    pub weights: BTreeMap<String, Arc<Tensor>>,
    /// Raw `span.layout`; split on `,` for tuple-typed results.
    pub layout: &'a str,
    /// `None` when the expression carries no type; the node then has no outputs.
    pub sinfo: Option<&'a StructInfo>,
}

/// Pending weights discovered while lowering the body of a composite function.
#[derive(Debug, Default)]
pub(crate) struct FuncScope {
    pub name: String,
    weights: Vec<String>,
}

impl FuncScope {
    pub fn add_weight(&mut self, tensor: String) {
        self.weights.push(tensor);
    }

    pub fn weights(&self) -> &[String] {
        &self.weights
    }
}

/// Tables accumulated while walking one function.
#[derive(Debug, Default)]
pub(crate) struct BuildContext {
    memo: HashMap<ExprId, TensorNames>,
    producers: HashMap<String, TensorRef>,
    nodes: Vec<Node>,
    weights: BTreeMap<String, Arc<Tensor>>,
    ignored: HashSet<String>,
    scopes: Vec<FuncScope>,
}

/// Raw tables handed to the graph assembler.
#[derive(Debug)]
pub(crate) struct BuildParts {
    pub nodes: Vec<Node>,
    pub weights: BTreeMap<String, Arc<Tensor>>,
    pub ignored: HashSet<String>,
}

impl BuildContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_lowered(&self, expr: ExprId) -> bool {
        self.memo.contains_key(&expr)
    }

    pub fn tensors_of(&self, expr: ExprId) -> Option<&TensorNames> {
        self.memo.get(&expr)
    }

    /// Tensor names of an expression that must already be lowered.
    pub fn require(&self, expr: ExprId, what: &'static str) -> Result<&TensorNames> {
        self.memo
            .get(&expr)
            .ok_or(BuildError::NotLowered { what, expr })
    }

    pub fn set_tensors(&mut self, expr: ExprId, names: TensorNames) {
        self.memo.insert(expr, names);
    }

    /// Makes `alias` resolve to the same tensors as `source`.
    pub fn alias_expr(&mut self, alias: ExprId, source: ExprId, what: &'static str) -> Result<()> {
        let names = self.require(source, what)?.clone();
        self.memo.insert(alias, names);
        Ok(())
    }

    pub fn producer_ref(&self, tensor: &str) -> Result<TensorRef> {
        self.producers
            .get(tensor)
            .copied()
            .ok_or_else(|| BuildError::UnknownTensor {
                name: tensor.to_string(),
            })
    }

    /// Producing node and output of a tensor registered earlier in this build.
    pub fn producer(&self, tensor: &str) -> Result<(&Node, &Tensor)> {
        let target = self.producer_ref(tensor)?;
        let unknown = || BuildError::UnknownTensor {
            name: tensor.to_string(),
        };
        let node = self.nodes.get(target.node.0 as usize).ok_or_else(unknown)?;
        let output = node.output_at(target.slot).ok_or_else(unknown)?;
        Ok((node, output))
    }

    pub fn mark_ignored(&mut self, name: impl Into<String>) {
        self.ignored.insert(name.into());
    }

    pub fn push_scope(&mut self, name: impl Into<String>) {
        self.scopes.push(FuncScope {
            name: name.into(),
            weights: Vec::new(),
        });
    }

    pub fn pop_scope(&mut self) -> Option<FuncScope> {
        self.scopes.pop()
    }

    pub fn has_scope(&self) -> bool {
        !self.scopes.is_empty()
    }

    pub fn current_scope(&self) -> Option<&FuncScope> {
        self.scopes.last()
    }

    pub fn current_scope_mut(&mut self) -> Option<&mut FuncScope> {
        self.scopes.last_mut()
    }

    /// Shared weight named `name`, created from `make` on first use.
    fn intern_weight(
        &mut self,
        name: &str,
        make: impl FnOnce() -> Result<Tensor>,
    ) -> Result<Arc<Tensor>> {
        if let Some(weight) = self.weights.get(name) {
            return Ok(Arc::clone(weight));
        }
        let weight = Arc::new(make()?);
        self.weights.insert(name.to_string(), Arc::clone(&weight));
        Ok(weight)
    }

    /// Weight drawn from `tensor` for an argument playing `role` in `op_type`.
    ///
    /// Biases are flattened to a rank-1 `O` tensor, and the weight of a linear op stored in
    /// `IO` layout is recorded transposed to `OI`.
    pub fn role_weight(
        &mut self,
        name: &str,
        tensor: &str,
        role: &str,
        op_type: &str,
    ) -> Result<Arc<Tensor>> {
        let (_, source) = self.producer(tensor)?;
        let source = source.clone();
        self.intern_weight(name, || {
            if role == BIAS {
                let size = source
                    .element_count()
                    .ok_or_else(|| BuildError::DynamicBias {
                        weight: name.to_string(),
                    })?;
                return Ok(Tensor::new(
                    name,
                    source.dtype,
                    "O",
                    Shape::from_static(&[size]),
                ));
            }
            let linear = op_type == "msc.linear" || op_type == "msc.linear_bias";
            if role == WEIGHT && linear && source.layout == "IO" && source.rank() == 2 {
                let dims = source.shape.dims();
                let shape = Shape::new(vec![dims[1].clone(), dims[0].clone()]);
                return Ok(Tensor::new(name, source.dtype, "OI", shape));
            }
            Ok(Tensor::new(
                name,
                source.dtype,
                source.layout.clone(),
                source.shape.clone(),
            ))
        })
    }

    /// Weight copied verbatim from `tensor`.
    pub fn plain_weight(&mut self, name: &str, tensor: &str) -> Result<Arc<Tensor>> {
        let (_, source) = self.producer(tensor)?;
        let source = source.clone();
        self.intern_weight(name, || {
            Ok(Tensor::new(
                name,
                source.dtype,
                source.layout.clone(),
                source.shape.clone(),
            ))
        })
    }

    /// Input of a projection: the selected tensor, looking through a tuple node to the
    /// field it packed. Falls back to every tuple tensor when `index` is out of range.
    pub fn project(&self, tuple: ExprId, index: usize) -> Result<Vec<String>> {
        let names = self.require(tuple, "projected tuple")?;
        let Some(selected) = names.get(index) else {
            return Ok(names.to_vec());
        };
        let (producer, _) = self.producer(selected)?;
        if producer.op_type == "tuple" && producer.inputs.len() == producer.outputs.len() {
            let slot = self.producer_ref(selected)?.slot;
            if let Some(tensor) = producer
                .inputs
                .get(slot)
                .and_then(|field| self.node(field.node)?.output_at(field.slot))
            {
                return Ok(vec![tensor.name.clone()]);
            }
        }
        Ok(vec![selected.clone()])
    }

    /// Builds and records a node, memoizing its outputs under `key`.
    pub fn register(&mut self, spec: NodeSpec<'_>, key: ExprId) -> Result<NodeId> {
        let id = NodeId(self.nodes.len() as u32);
        let outputs = build_outputs(&spec.name, &spec.op_type, spec.layout, spec.sinfo, key)?;
        let inputs = spec
            .input_names
            .iter()
            .map(|name| self.producer_ref(name))
            .collect::<Result<SmallVec<[TensorRef; 4]>>>()?;

        let mut names = TensorNames::new();
        for (slot, output) in outputs.iter().enumerate() {
            names.push(output.name.clone());
            self.producers
                .insert(output.name.clone(), TensorRef { node: id, slot });
        }
        self.nodes.push(Node {
            id,
            index: None,
            name: spec.name,
            shared_ref: spec.shared_ref,
            op_type: spec.op_type,
            attrs: spec.attrs,
            scope: spec.scope,
            inputs,
            outputs,
            weights: spec.weights,
        });
        self.memo.insert(key, names);
        Ok(id)
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.0 as usize)
    }

    pub fn into_parts(self) -> BuildParts {
        BuildParts {
            nodes: self.nodes,
            weights: self.weights,
            ignored: self.ignored,
        }
    }
}

/// The `const` weight describing a constant node's own payload.
pub(crate) fn const_weight(
    name: &str,
    layout: &str,
    sinfo: &StructInfo,
    expr: ExprId,
) -> Result<Tensor> {
    match sinfo {
        StructInfo::Tensor {
            dtype,
            shape: Some(shape),
        } => Ok(Tensor::new(name, *dtype, layout, shape.clone())),
        other => Err(BuildError::UnexpectedStructInfo {
            expr,
            found: other.kind_name(),
            context: "constant",
        }),
    }
}

/// Output tensors `<name>:<i>` derived from a structural type.
fn build_outputs(
    name: &str,
    op_type: &str,
    layout: &str,
    sinfo: Option<&StructInfo>,
    expr: ExprId,
) -> Result<Vec<Tensor>> {
    let Some(mut sinfo) = sinfo else {
        return Ok(Vec::new());
    };
    if let StructInfo::Func { ret } = sinfo {
        sinfo = ret.as_ref();
    }
    match sinfo {
        StructInfo::Tensor { dtype, shape } => Ok(vec![Tensor::new(
            format!("{name}:0"),
            *dtype,
            layout,
            shape.clone().unwrap_or_default(),
        )]),
        StructInfo::Shape { ndim } => Ok(vec![Tensor::new(
            format!("{name}:0"),
            DType::Si32,
            layout,
            Shape::new(vec![Dimension::Static(*ndim)]),
        )]),
        StructInfo::Tuple(fields) => {
            let layouts: Vec<&str> = if layout.is_empty() {
                vec![""; fields.len()]
            } else {
                layout.split(',').collect()
            };
            if layouts.len() != fields.len() {
                return Err(BuildError::LayoutMismatch {
                    layout: layout.to_string(),
                    fields: fields.len(),
                });
            }
            let count = if op_type == "nn.batch_norm" {
                fields.len().min(1)
            } else {
                fields.len()
            };
            fields
                .iter()
                .zip(layouts)
                .take(count)
                .enumerate()
                .map(|(slot, (field, layout))| match field {
                    StructInfo::Tensor { dtype, shape } => Ok(Tensor::new(
                        format!("{name}:{slot}"),
                        *dtype,
                        layout,
                        shape.clone().unwrap_or_default(),
                    )),
                    other => Err(BuildError::UnexpectedStructInfo {
                        expr,
                        found: other.kind_name(),
                        context: "tuple output",
                    }),
                })
                .collect()
        }
        other => Err(BuildError::UnexpectedStructInfo {
            expr,
            found: other.kind_name(),
            context: "node outputs",
        }),
    }
}
