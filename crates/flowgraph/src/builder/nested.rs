//! Lowering of expression-dialect functions.
//!
//! Composite function literals lower to one node each. Constants met while a composite
//! body is being walked become pending weights of that composite rather than graph
//! nodes in their own right.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::attrs::{flatten, format_scalar, merge, AttrMap};
use crate::config::BuildConfig;
use crate::error::{BuildError, Result};
use crate::graph::{Graph, NodeId, Tensor};
use crate::ir::arena::ExprId;
use crate::ir::nested::{Call, Callee, Expr, Function, Module};
use crate::ir::visit::{walk_nested_children, NestedVisitor};
use crate::roles::{input_roles, Dialect, INPUT};

use super::assemble::assemble;
use super::context::{const_weight, BuildContext, NodeSpec, CONST_ROLE, SCALAR_ATTR};

const BLOCK_SCOPE: &str = "block";

/// Attributes of the calls inside a composite function, children first.
struct FuncAttrCollector<'m> {
    module: &'m Module,
    visited: HashSet<ExprId>,
    attrs: AttrMap,
}

impl<'m> NestedVisitor<'m> for FuncAttrCollector<'m> {
    fn module(&self) -> &'m Module {
        self.module
    }

    fn mark_visited(&mut self, id: ExprId) -> bool {
        self.visited.insert(id)
    }

    fn visit_expr(&mut self, id: ExprId) -> Result<()> {
        if !self.mark_visited(id) {
            return Ok(());
        }
        walk_nested_children(self, id)?;
        if let Expr::Call(Call {
            attrs: Some(record),
            ..
        }) = self.module.expr(id)?
        {
            merge(&mut self.attrs, flatten(record));
        }
        Ok(())
    }
}

fn collect_func_attrs(module: &Module, function: ExprId) -> Result<AttrMap> {
    let mut collector = FuncAttrCollector {
        module,
        visited: HashSet::new(),
        attrs: AttrMap::new(),
    };
    collector.visit_expr(function)?;
    Ok(collector.attrs)
}

/// Expression-dialect translator and driver.
pub(crate) struct NestedGraphBuilder<'m> {
    module: &'m Module,
    config: &'m BuildConfig,
    ctx: BuildContext,
    visited: HashSet<ExprId>,
}

impl<'m> NestedGraphBuilder<'m> {
    pub fn new(module: &'m Module, config: &'m BuildConfig) -> Self {
        Self {
            module,
            config,
            ctx: BuildContext::new(),
            visited: HashSet::new(),
        }
    }

    pub fn build(mut self, name: &str, function_id: ExprId) -> Result<Graph> {
        let module = self.module;
        let function = module.function(function_id)?;

        let mut input_names = Vec::new();
        for &param in &function.params {
            self.lower(param, module.var_name(param))?;
            if let Some(first) = self.ctx.require(param, "function parameter")?.first() {
                input_names.push(first.clone());
            }
        }

        self.visit_expr(function_id)?;
        let output_names = self.ctx.require(function.body, "function body")?.to_vec();
        assemble(
            name,
            self.ctx.into_parts(),
            input_names,
            output_names,
            self.config,
        )
    }

    /// [`Self::add_node`], logging the failing expression before handing the error back.
    fn lower(&mut self, expr: ExprId, forced_name: Option<&str>) -> Result<NodeId> {
        self.add_node(expr, forced_name).map_err(|err| {
            let kind = self
                .module
                .expr(expr)
                .map(expr_kind)
                .unwrap_or("missing expression");
            warn!(expr = %expr, kind, error = %err, "failed to add node");
            err
        })
    }

    fn add_node(&mut self, expr: ExprId, forced_name: Option<&str>) -> Result<NodeId> {
        let module = self.module;
        let entry = module.node(expr)?;
        let span = &entry.span;
        let mut name = forced_name
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| span.name())
            .to_string();
        let shared_ref = Some(span.shared_ref())
            .filter(|shared| !shared.is_empty())
            .map(str::to_string);

        let op_type = match &entry.kind {
            Expr::Var(_) => "input".to_string(),
            Expr::Constant(_) => "constant".to_string(),
            Expr::TupleGetItem { .. } => "get_item".to_string(),
            Expr::Tuple(_) => "tuple".to_string(),
            Expr::Call(call) => match &call.callee {
                Callee::Op(op) => op.replace("relay.", ""),
                Callee::Expr(_) => "unknown_op".to_string(),
            },
            Expr::Function(function) => {
                function
                    .composite
                    .clone()
                    .ok_or_else(|| BuildError::MissingComposite {
                        function: if name.is_empty() {
                            expr.to_string()
                        } else {
                            name.clone()
                        },
                    })?
            }
        };

        if name.is_empty() {
            name = module
                .var_name(expr)
                .filter(|var_name| !var_name.is_empty())
                .map(str::to_string)
                .unwrap_or_else(|| format!("{op_type}_{}", self.ctx.node_count()));
        }

        let mut attrs = AttrMap::new();
        match &entry.kind {
            Expr::Call(call) => {
                if let Some(record) = &call.attrs {
                    attrs = flatten(record);
                }
            }
            Expr::Function(_) => attrs = collect_func_attrs(module, expr)?,
            Expr::Constant(data) => {
                if let Some(scalar) = format_scalar(data, self.config.float_precision) {
                    attrs.insert(SCALAR_ATTR.to_string(), scalar);
                }
            }
            Expr::TupleGetItem { index, .. } => {
                attrs.insert("index".to_string(), index.to_string());
            }
            Expr::Var(_) | Expr::Tuple(_) => {}
        }

        let scope = if op_type == "input" || op_type == "constant" {
            Vec::new()
        } else {
            vec![BLOCK_SCOPE.to_string()]
        };

        let sinfo = module.checked_type(expr)?;
        let mut input_names = Vec::new();
        let mut weights = BTreeMap::new();
        match &entry.kind {
            Expr::Call(call) => {
                self.lower_call_args(call, &op_type, &mut attrs, &mut input_names, &mut weights)?
            }
            Expr::Function(function) => self.claim_scope_weights(
                expr,
                function,
                &op_type,
                &mut attrs,
                &mut input_names,
                &mut weights,
            )?,
            Expr::Tuple(fields) => {
                for field in fields {
                    input_names.extend(self.ctx.require(*field, "tuple field")?.iter().cloned());
                }
            }
            Expr::TupleGetItem { tuple, index } => {
                input_names = self.ctx.project(*tuple, *index)?;
            }
            Expr::Constant(_) => {
                let sinfo = sinfo.ok_or(BuildError::MissingStructInfo { expr })?;
                let weight = const_weight(&name, span.layout(), sinfo, expr)?;
                weights.insert(CONST_ROLE.to_string(), Arc::new(weight));
            }
            Expr::Var(_) => {}
        }

        let spec = NodeSpec {
            name,
            shared_ref,
            op_type,
            attrs,
            scope,
            input_names,
            weights,
            layout: span.layout(),
            sinfo,
        };
        self.ctx.register(spec, expr)
    }

    fn lower_call_args(
        &mut self,
        call: &Call,
        op_type: &str,
        attrs: &mut AttrMap,
        input_names: &mut Vec<String>,
        weights: &mut BTreeMap<String, Arc<Tensor>>,
    ) -> Result<()> {
        let module = self.module;
        let roles = input_roles(op_type, call.args.len(), Dialect::Nested)?;
        for (&arg, &role) in call.args.iter().zip(&roles) {
            let names = self.ctx.require(arg, "call argument")?.clone();
            let constant = matches!(module.expr(arg)?, Expr::Constant(_));
            match names.first() {
                Some(first) if role != INPUT && constant => {
                    let (producer, _) = self.ctx.producer(first)?;
                    let weight_name = producer.name.clone();
                    let scalar = producer.attr(SCALAR_ATTR).map(str::to_string);
                    let weight = self.ctx.role_weight(&weight_name, first, role, op_type)?;
                    if let Some(scalar) = scalar {
                        attrs.insert(role.to_string(), scalar);
                    }
                    weights.insert(role.to_string(), weight);
                }
                _ => input_names.extend(names.iter().cloned()),
            }
        }
        Ok(())
    }

    /// Attaches the weights gathered inside a composite body to the composite's node.
    ///
    /// Parameters fill the leading roles; pending weights take the remaining ones in the
    /// order they were met.
    fn claim_scope_weights(
        &mut self,
        expr: ExprId,
        function: &Function,
        op_type: &str,
        attrs: &mut AttrMap,
        input_names: &mut Vec<String>,
        weights: &mut BTreeMap<String, Arc<Tensor>>,
    ) -> Result<()> {
        for param in &function.params {
            input_names.extend(
                self.ctx
                    .require(*param, "composite parameter")?
                    .iter()
                    .cloned(),
            );
        }
        let pending = self
            .ctx
            .current_scope()
            .ok_or(BuildError::MissingFuncScope { expr })?
            .weights()
            .to_vec();
        let roles = input_roles(
            op_type,
            function.params.len() + pending.len(),
            Dialect::Nested,
        )?;
        for (tensor, &role) in pending.iter().zip(roles.iter().skip(function.params.len())) {
            let (producer, _) = self.ctx.producer(tensor)?;
            let weight_name = producer.name.clone();
            let scalar = producer.attr(SCALAR_ATTR).map(str::to_string);
            let weight = self.ctx.plain_weight(&weight_name, tensor)?;
            if let Some(scalar) = scalar {
                attrs.insert(role.to_string(), scalar);
            }
            weights.insert(role.to_string(), weight);
        }
        Ok(())
    }

    fn visit_call(&mut self, id: ExprId, call: &'m Call) -> Result<()> {
        let module = self.module;
        let composite = match &call.callee {
            Callee::Expr(callee) => match module.expr(*callee)? {
                Expr::Function(function) if function.composite.is_some() => {
                    Some((*callee, function))
                }
                _ => None,
            },
            Callee::Op(_) => None,
        };

        if let Some((_, function)) = composite {
            for (param, arg) in function.params.iter().zip(&call.args) {
                self.visit_expr(*arg)?;
                self.ctx.alias_expr(*param, *arg, "composite argument")?;
            }
        }
        walk_nested_children(self, id)?;

        match composite {
            Some((callee, _)) => {
                if self.ctx.is_lowered(callee) {
                    self.ctx.alias_expr(id, callee, "composite function")?;
                }
            }
            None if !self.ctx.has_scope() => {
                self.lower(id, None)?;
            }
            None => {}
        }
        Ok(())
    }
}

impl<'m> NestedVisitor<'m> for NestedGraphBuilder<'m> {
    fn module(&self) -> &'m Module {
        self.module
    }

    fn mark_visited(&mut self, id: ExprId) -> bool {
        self.visited.insert(id)
    }

    fn visit_expr(&mut self, id: ExprId) -> Result<()> {
        if !self.mark_visited(id) {
            return Ok(());
        }
        let module = self.module;
        match module.expr(id)? {
            Expr::Var(_) => Ok(()),
            Expr::Constant(_) => {
                let node = self.lower(id, None)?;
                let output = self
                    .ctx
                    .node(node)
                    .and_then(|node| node.output_at(0))
                    .map(|output| output.name.clone());
                if let (Some(output), Some(scope)) = (output, self.ctx.current_scope_mut()) {
                    scope.add_weight(output);
                }
                Ok(())
            }
            Expr::Function(function) => {
                if function.composite.is_none() {
                    return walk_nested_children(self, id);
                }
                self.ctx.push_scope(module.span(id)?.name());
                walk_nested_children(self, id)?;
                self.lower(id, None)?;
                if let Some(scope) = self.ctx.pop_scope() {
                    debug!(scope = %scope.name, weights = scope.weights().len(), "closed scope");
                }
                Ok(())
            }
            Expr::Call(call) => self.visit_call(id, call),
            Expr::Tuple(_) | Expr::TupleGetItem { .. } => {
                walk_nested_children(self, id)?;
                if !self.ctx.has_scope() {
                    self.lower(id, None)?;
                }
                Ok(())
            }
        }
    }
}

fn expr_kind(expr: &Expr) -> &'static str {
    match expr {
        Expr::Var(_) => "Var",
        Expr::Constant(_) => "Constant",
        Expr::Tuple(_) => "Tuple",
        Expr::TupleGetItem { .. } => "TupleGetItem",
        Expr::Call(_) => "Call",
        Expr::Function(_) => "Function",
    }
}
