//! Lowering of binding-dialect functions.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use tracing::{info, warn};

use crate::attrs::{flatten, format_prim, format_scalar, merge, AttrMap};
use crate::config::BuildConfig;
use crate::error::{BuildError, Result};
use crate::graph::{Graph, NodeId, Tensor};
use crate::ir::arena::ExprId;
use crate::ir::scoped::{Binding, BindingBlock, Call, Callee, Expr, Function, Module};
use crate::ir::types::join_list;
use crate::ir::visit::{walk_binding_block, walk_scoped_expr, walk_scoped_function, ScopedVisitor};
use crate::roles::{input_roles, Dialect, INPUT};

use super::assemble::assemble;
use super::context::{
    const_weight, BuildContext, NodeSpec, TensorNames, CONST_ROLE, SCALAR_ATTR,
};

/// Attributes of every call inside a composite function, merged without overwriting.
struct FuncAttrCollector<'m> {
    module: &'m Module,
    attrs: AttrMap,
}

impl<'m> ScopedVisitor<'m> for FuncAttrCollector<'m> {
    fn module(&self) -> &'m Module {
        self.module
    }

    fn visit_expr(&mut self, id: ExprId) -> Result<()> {
        match self.module.expr(id)? {
            Expr::Call(call) => {
                if let Some(record) = &call.attrs {
                    merge(&mut self.attrs, flatten(record));
                }
            }
            Expr::TupleGetItem { index, .. } => {
                self.attrs.insert("index".to_string(), index.to_string());
            }
            _ => {}
        }
        walk_scoped_expr(self, id)
    }
}

fn collect_func_attrs(module: &Module, function: &Function) -> Result<AttrMap> {
    let mut collector = FuncAttrCollector {
        module,
        attrs: AttrMap::new(),
    };
    walk_scoped_function(&mut collector, function)?;
    Ok(collector.attrs)
}

/// Primitive scalar arguments of the calls inside a function, in encounter order.
struct PrimValueCollector<'m> {
    module: &'m Module,
    values: Vec<String>,
}

impl<'m> ScopedVisitor<'m> for PrimValueCollector<'m> {
    fn module(&self) -> &'m Module {
        self.module
    }

    fn visit_expr(&mut self, id: ExprId) -> Result<()> {
        if let Expr::Call(call) = self.module.expr(id)? {
            for arg in &call.args {
                if let Expr::PrimValue(value) = self.module.expr(*arg)? {
                    self.values.push(format_prim(value));
                }
            }
        }
        walk_scoped_expr(self, id)
    }
}

pub(crate) fn collect_prim_values(module: &Module, function: &Function) -> Result<Vec<String>> {
    let mut collector = PrimValueCollector {
        module,
        values: Vec::new(),
    };
    walk_scoped_function(&mut collector, function)?;
    Ok(collector.values)
}

/// Maps the parameters of every called function to the expression supplied for them.
///
/// Chains through calls that forward a parameter, so a partition parameter fed by a
/// constant in the caller resolves to that constant.
pub(crate) struct ParamFinder<'m> {
    module: &'m Module,
    local_funcs: HashMap<ExprId, &'m Function>,
    params: HashMap<ExprId, ExprId>,
}

impl<'m> ParamFinder<'m> {
    pub fn new(module: &'m Module) -> Self {
        Self {
            module,
            local_funcs: HashMap::new(),
            params: HashMap::new(),
        }
    }

    pub fn find(mut self, function: ExprId) -> Result<HashMap<ExprId, ExprId>> {
        self.visit_expr(function)?;
        Ok(self.params)
    }
}

impl<'m> ScopedVisitor<'m> for ParamFinder<'m> {
    fn module(&self) -> &'m Module {
        self.module
    }

    fn visit_binding(&mut self, binding: Binding) -> Result<()> {
        if let Expr::Function(function) = self.module.expr(binding.value)? {
            self.local_funcs.insert(binding.var, function);
            return Ok(());
        }
        self.visit_expr(binding.value)
    }

    fn visit_expr(&mut self, id: ExprId) -> Result<()> {
        walk_scoped_expr(self, id)?;
        let module = self.module;
        let Expr::Call(call) = module.expr(id)? else {
            return Ok(());
        };
        let callee = match &call.callee {
            Callee::Global(name) => module.lookup_function(name)?,
            Callee::Local(var) => *self
                .local_funcs
                .get(var)
                .ok_or(BuildError::UnresolvedCallee { callee: *var })?,
            Callee::Op(_) | Callee::Function(_) => return Ok(()),
        };
        for (param, arg) in callee.params.iter().zip(&call.args) {
            let actual = self.params.get(arg).copied().unwrap_or(*arg);
            self.params.insert(*param, actual);
        }
        Ok(())
    }
}

/// Inputs, weights and folded attributes recovered from a call's arguments.
#[derive(Default)]
struct LoweredArgs {
    input_names: Vec<String>,
    weights: BTreeMap<String, Arc<Tensor>>,
}

/// Binding-dialect translator and driver.
pub(crate) struct ScopedGraphBuilder<'m> {
    module: &'m Module,
    config: &'m BuildConfig,
    ctx: BuildContext,
    func_params: HashMap<ExprId, ExprId>,
    target_funcs: HashMap<ExprId, &'m Function>,
    scope_name: String,
}

impl<'m> ScopedGraphBuilder<'m> {
    pub fn new(
        module: &'m Module,
        config: &'m BuildConfig,
        func_params: HashMap<ExprId, ExprId>,
    ) -> Self {
        Self {
            module,
            config,
            ctx: BuildContext::new(),
            func_params,
            target_funcs: HashMap::new(),
            scope_name: String::new(),
        }
    }

    pub fn build(mut self, name: &str, function_id: ExprId) -> Result<Graph> {
        let module = self.module;
        let function = module.function(function_id)?;

        let mut input_names = Vec::new();
        let mut added = HashSet::new();
        for &param in &function.params {
            if self.ctx.is_lowered(param) {
                continue;
            }
            self.lower_param(param)?;
            for tensor in self.ctx.require(param, "function parameter")? {
                if added.insert(tensor.clone()) {
                    input_names.push(tensor.clone());
                }
            }
        }

        walk_scoped_function(&mut self, function)?;
        let output_names = self.body_tensors(function.body)?;
        assemble(
            name,
            self.ctx.into_parts(),
            input_names,
            output_names,
            self.config,
        )
    }

    fn lower_param(&mut self, param: ExprId) -> Result<()> {
        let module = self.module;
        match self.param_source(param)? {
            Some(Expr::Tuple(fields)) => {
                let mut names = TensorNames::new();
                for &field in fields {
                    if self.ctx.is_lowered(field) {
                        info!(param = %param, field = %field, "replica tuple input");
                    } else if let Some(var_name) = module.var_name(field) {
                        self.add_node(field, None, Some(var_name))?;
                    } else {
                        return Err(BuildError::UnexpectedTupleField { expr: field });
                    }
                    names.extend(
                        self.ctx
                            .require(field, "tuple input field")?
                            .iter()
                            .cloned(),
                    );
                }
                self.ctx.set_tensors(param, names);
            }
            _ => {
                self.add_node(param, None, module.var_name(param))?;
            }
        }
        Ok(())
    }

    fn body_tensors(&self, body: ExprId) -> Result<Vec<String>> {
        if let Some(names) = self.ctx.tensors_of(body) {
            return Ok(names.to_vec());
        }
        match self.module.expr(body)? {
            Expr::Tuple(fields) => self.concat_tensors(fields, "function body field"),
            _ => Err(BuildError::NotLowered {
                what: "function body",
                expr: body,
            }),
        }
    }

    fn concat_tensors(&self, fields: &[ExprId], what: &'static str) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for field in fields {
            names.extend(self.ctx.require(*field, what)?.iter().cloned());
        }
        Ok(names)
    }

    /// Expression propagated into `expr` from a caller, when `expr` is a parameter.
    fn param_source(&self, expr: ExprId) -> Result<Option<&'m Expr>> {
        self.func_params
            .get(&expr)
            .map(|actual| self.module.expr(*actual))
            .transpose()
    }

    fn target_func(&self, var: ExprId) -> Result<&'m Function> {
        self.target_funcs
            .get(&var)
            .copied()
            .ok_or(BuildError::UnresolvedCallee { callee: var })
    }

    fn register_target_func(&mut self, var: ExprId, function: &'m Function) -> Result<()> {
        let Some(composite) = function.attrs.composite.as_deref() else {
            return Err(BuildError::MissingComposite {
                function: self.module.var_name(var).unwrap_or_default().to_string(),
            });
        };
        let target = self.config.target.as_str();
        if target.is_empty() || !composite.starts_with(target) {
            return Err(BuildError::TargetMismatch {
                composite: composite.to_string(),
                target: target.to_string(),
            });
        }
        self.target_funcs.insert(var, function);
        Ok(())
    }

    /// Function a call dispatches to, or `None` for primitive operators.
    fn callee_function(&self, call: &Call) -> Result<Option<&'m Function>> {
        let module = self.module;
        match &call.callee {
            Callee::Op(_) => Ok(None),
            Callee::Global(name) => module.lookup_function(name).map(Some),
            Callee::Local(var) => self.target_func(*var).map(Some),
            Callee::Function(id) => module.function(*id).map(Some),
        }
    }

    fn call_op_type(&self, call: &Call) -> Result<String> {
        let composite_of = |function: &Function, label: String| {
            function
                .attrs
                .composite
                .clone()
                .ok_or(BuildError::MissingComposite { function: label })
        };
        match &call.callee {
            Callee::Op(op) => Ok(op.replace("relax.", "")),
            Callee::Global(name) => {
                composite_of(self.module.lookup_function(name)?, name.clone())
            }
            Callee::Local(var) => {
                let label = self.module.var_name(*var).unwrap_or_default().to_string();
                let composite = composite_of(self.target_func(*var)?, label)?;
                Ok(composite.replace(&format!("{}.", self.config.target), ""))
            }
            Callee::Function(id) => composite_of(self.module.function(*id)?, id.to_string()),
        }
    }

    /// Lowers one expression to a node; `binding_var`, when given, is memoized instead of
    /// `expr`.
    fn add_node(
        &mut self,
        expr: ExprId,
        binding_var: Option<ExprId>,
        forced_name: Option<&str>,
    ) -> Result<NodeId> {
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
            Expr::Var(_) => match self.param_source(expr)? {
                Some(Expr::Constant(_)) => {
                    if let Some(actual) = self.func_params.get(&expr) {
                        name = module.span(*actual)?.name().to_string();
                    }
                    "constant".to_string()
                }
                _ => "input".to_string(),
            },
            Expr::Constant(_) => "constant".to_string(),
            Expr::ShapeExpr(_) => "shape".to_string(),
            Expr::TupleGetItem { .. } => "get_item".to_string(),
            Expr::Tuple(_) => "tuple".to_string(),
            Expr::Call(call) => self.call_op_type(call)?,
            Expr::PrimValue(_) | Expr::Function(_) => "unknown_expr".to_string(),
        };

        if name.is_empty() {
            name = binding_var
                .or(Some(expr))
                .and_then(|var| module.var_name(var))
                .filter(|var_name| !var_name.is_empty())
                .map(str::to_string)
                .unwrap_or_else(|| format!("{op_type}_{}", self.ctx.node_count()));
        }

        let mut attrs = AttrMap::new();
        match &entry.kind {
            Expr::Call(call) => match self.callee_function(call)? {
                Some(function) => attrs = collect_func_attrs(module, function)?,
                None => {
                    if let Some(record) = &call.attrs {
                        attrs = flatten(record);
                    }
                }
            },
            Expr::Constant(data) => {
                if let Some(scalar) = format_scalar(data, self.config.float_precision) {
                    attrs.insert(SCALAR_ATTR.to_string(), scalar);
                }
            }
            Expr::ShapeExpr(dims) => {
                attrs.insert("shape".to_string(), join_list(dims));
            }
            Expr::TupleGetItem { index, .. } => {
                attrs.insert("index".to_string(), index.to_string());
            }
            _ => {}
        }

        let scope = if op_type == "input" || op_type == "constant" {
            Vec::new()
        } else {
            self.scope_name
                .split('.')
                .filter(|part| !part.is_empty())
                .map(str::to_string)
                .collect()
        };

        let mut lowered = LoweredArgs::default();
        let sinfo = module.sinfo(expr)?;
        match &entry.kind {
            Expr::Call(call) => self.lower_call_args(call, &op_type, &mut attrs, &mut lowered)?,
            Expr::Tuple(fields) => {
                lowered.input_names = self.concat_tensors(fields, "tuple field")?;
            }
            Expr::TupleGetItem { tuple, index } => {
                lowered.input_names = self.ctx.project(*tuple, *index)?;
            }
            _ if op_type == "constant" => {
                let weight = const_weight(&name, span.layout(), sinfo, expr)?;
                lowered
                    .weights
                    .insert(CONST_ROLE.to_string(), Arc::new(weight));
            }
            _ => {}
        }

        let spec = NodeSpec {
            name,
            shared_ref,
            op_type,
            attrs,
            scope,
            input_names: lowered.input_names,
            weights: lowered.weights,
            layout: span.layout(),
            sinfo: Some(sinfo),
        };
        self.ctx.register(spec, binding_var.unwrap_or(expr))
    }

    fn lower_call_args(
        &mut self,
        call: &'m Call,
        op_type: &str,
        attrs: &mut AttrMap,
        lowered: &mut LoweredArgs,
    ) -> Result<()> {
        let module = self.module;
        let prim_values = match &call.callee {
            Callee::Local(var) => collect_prim_values(module, self.target_func(*var)?)?,
            _ => Vec::new(),
        };
        let roles = input_roles(
            op_type,
            call.args.len() + prim_values.len(),
            Dialect::Scoped,
        )?;

        for (index, (&arg, &role)) in call.args.iter().zip(&roles).enumerate() {
            match module.expr(arg)? {
                Expr::ShapeExpr(dims) => {
                    attrs.insert(role.to_string(), join_list(dims));
                    continue;
                }
                Expr::PrimValue(value) => {
                    if role == INPUT {
                        return Err(BuildError::PrimValueAsInput {
                            op_type: op_type.to_string(),
                            index,
                        });
                    }
                    attrs.insert(role.to_string(), format_prim(value));
                    continue;
                }
                _ => {}
            }
            if let Some(Expr::ShapeExpr(dims)) = self.param_source(arg)? {
                attrs.insert(role.to_string(), join_list(dims));
                if let Some(var_name) = module.var_name(arg) {
                    self.ctx.mark_ignored(var_name);
                }
                continue;
            }

            let arg_names = self.arg_tensors(arg)?;
            if role != INPUT {
                if let Some(source) = self.constant_source(&arg_names)? {
                    if self.func_params.contains_key(&arg) {
                        if let Some(var_name) = module.var_name(arg) {
                            self.ctx.mark_ignored(var_name);
                        }
                    }
                    let weight =
                        self.ctx
                            .role_weight(&source.weight_name, &source.tensor, role, op_type)?;
                    if let Some(scalar) = source.scalar {
                        attrs.insert(role.to_string(), scalar);
                    }
                    lowered.weights.insert(role.to_string(), weight);
                    continue;
                }
            }
            lowered.input_names.extend(arg_names);
        }

        for (role, value) in roles.iter().skip(call.args.len()).zip(prim_values) {
            attrs.insert(role.to_string(), value);
        }
        Ok(())
    }

    /// Tensors of a call argument; inline tuples expand to their fields' tensors.
    fn arg_tensors(&self, arg: ExprId) -> Result<TensorNames> {
        if let Some(names) = self.ctx.tensors_of(arg) {
            return Ok(names.clone());
        }
        match self.module.expr(arg)? {
            Expr::Tuple(fields) => Ok(self
                .concat_tensors(fields, "tuple field")?
                .into_iter()
                .collect()),
            _ => Err(BuildError::NotLowered {
                what: "call argument",
                expr: arg,
            }),
        }
    }

    /// Describes the constant producing the first of `names`, if a constant produced it.
    fn constant_source(&self, names: &TensorNames) -> Result<Option<ConstantSource>> {
        let Some(first) = names.first() else {
            return Ok(None);
        };
        let (producer, _) = self.ctx.producer(first)?;
        if producer.op_type != "constant" {
            return Ok(None);
        }
        Ok(Some(ConstantSource {
            weight_name: producer.name.clone(),
            tensor: first.clone(),
            scalar: producer.attr(SCALAR_ATTR).map(str::to_string),
        }))
    }

    fn lower_binding(
        &mut self,
        binding: Binding,
        forced_name: Option<&str>,
    ) -> Result<NodeId> {
        self.add_node(binding.value, Some(binding.var), forced_name)
            .map_err(|err| {
                let kind = self
                    .module
                    .expr(binding.value)
                    .map(Expr::kind_name)
                    .unwrap_or("missing expression");
                warn!(
                    binding = self.module.var_name(binding.var).unwrap_or_default(),
                    var = %binding.var,
                    value = %binding.value,
                    kind,
                    error = %err,
                    "failed to add node"
                );
                err
            })
    }
}

struct ConstantSource {
    weight_name: String,
    tensor: String,
    scalar: Option<String>,
}

impl<'m> ScopedVisitor<'m> for ScopedGraphBuilder<'m> {
    fn module(&self) -> &'m Module {
        self.module
    }

    fn visit_expr(&mut self, id: ExprId) -> Result<()> {
        if let Expr::Constant(_) = self.module.expr(id)? {
            if !self.ctx.is_lowered(id) {
                self.add_node(id, None, None)?;
            }
            return Ok(());
        }
        walk_scoped_expr(self, id)
    }

    // Function literals in callee position lower to one composite node.
    fn visit_function(&mut self, _id: ExprId, _function: &'m Function) -> Result<()> {
        Ok(())
    }

    fn visit_binding_block(&mut self, block: &'m BindingBlock) -> Result<()> {
        self.scope_name = block.span.name().to_string();
        walk_binding_block(self, block)
    }

    fn visit_binding(&mut self, binding: Binding) -> Result<()> {
        let module = self.module;
        let forced_name = if self.config.use_var_name {
            module.var_name(binding.var)
        } else {
            None
        };
        match module.expr(binding.value)? {
            Expr::Constant(_) | Expr::ShapeExpr(_) => {
                self.lower_binding(binding, forced_name)?;
            }
            Expr::Call(_) | Expr::Tuple(_) | Expr::TupleGetItem { .. } => {
                self.visit_expr(binding.value)?;
                self.lower_binding(binding, forced_name)?;
            }
            Expr::Var(_) => self
                .ctx
                .alias_expr(binding.var, binding.value, "bound variable")?,
            Expr::Function(function) => self.register_target_func(binding.var, function)?,
            Expr::PrimValue(_) => {}
        }
        Ok(())
    }
}
