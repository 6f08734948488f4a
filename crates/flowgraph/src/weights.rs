//! Constant payload extraction, independent of graph construction.

use std::collections::{HashMap, HashSet};

use crate::error::{BuildError, Result};
use crate::graph::Tensor;
use crate::ir::arena::ExprId;
use crate::ir::types::{StructInfo, TensorData};
use crate::ir::visit::{walk_nested_children, walk_scoped_expr, NestedVisitor, ScopedVisitor};
use crate::ir::{nested, scoped};

/// Raw payload of every literal constant, keyed by the tensor describing it.
pub type WeightMap = HashMap<Tensor, TensorData>;

struct ScopedWeightCollector<'m> {
    module: &'m scoped::Module,
    weights: WeightMap,
}

impl<'m> ScopedVisitor<'m> for ScopedWeightCollector<'m> {
    fn module(&self) -> &'m scoped::Module {
        self.module
    }

    fn visit_expr(&mut self, id: ExprId) -> Result<()> {
        let node = self.module.node(id)?;
        if let scoped::Expr::Constant(data) = &node.kind {
            let (dtype, shape) = match node.sinfo.as_ref() {
                Some(StructInfo::Tensor { dtype, shape }) => {
                    (*dtype, shape.clone().unwrap_or_default())
                }
                Some(other) => {
                    return Err(BuildError::UnexpectedStructInfo {
                        expr: id,
                        found: other.kind_name(),
                        context: "weight",
                    })
                }
                None => return Err(BuildError::MissingStructInfo { expr: id }),
            };
            let tensor = Tensor::new(node.span.name(), dtype, node.span.layout(), shape);
            self.weights.insert(tensor, data.clone());
        }
        walk_scoped_expr(self, id)
    }
}

/// Collects the constants of a binding-dialect function.
pub fn scoped_weights(module: &scoped::Module, entry: &str) -> Result<WeightMap> {
    let mut collector = ScopedWeightCollector {
        module,
        weights: WeightMap::new(),
    };
    collector.visit_expr(module.lookup(entry)?)?;
    Ok(collector.weights)
}

struct NestedWeightCollector<'m> {
    module: &'m nested::Module,
    visited: HashSet<ExprId>,
    weights: WeightMap,
}

impl<'m> NestedVisitor<'m> for NestedWeightCollector<'m> {
    fn module(&self) -> &'m nested::Module {
        self.module
    }

    fn mark_visited(&mut self, id: ExprId) -> bool {
        self.visited.insert(id)
    }

    fn visit_expr(&mut self, id: ExprId) -> Result<()> {
        if !self.mark_visited(id) {
            return Ok(());
        }
        let node = self.module.node(id)?;
        if let nested::Expr::Constant(data) = &node.kind {
            // The payload carries its own type, checked or not.
            let tensor = Tensor::new(
                node.span.name(),
                data.dtype,
                node.span.layout(),
                data.shape.clone(),
            );
            self.weights.insert(tensor, data.clone());
        }
        walk_nested_children(self, id)
    }
}

/// Collects the constants of an expression-dialect function.
pub fn nested_weights(module: &nested::Module, entry: &str) -> Result<WeightMap> {
    let mut collector = NestedWeightCollector {
        module,
        visited: HashSet::new(),
        weights: WeightMap::new(),
    };
    collector.visit_expr(module.lookup(entry)?)?;
    Ok(collector.weights)
}
