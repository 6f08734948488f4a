//! Binding dialect: functions made of named variable bindings grouped into blocks.

use std::collections::BTreeMap;

use crate::error::{BuildError, Result};

use super::arena::{ExprArena, ExprId, ExprNode};
use super::types::{AttrRecord, Dimension, PrimValue, Span, StructInfo, TensorData};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Var {
    pub name_hint: String,
}

/// What a call invokes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Callee {
    /// Primitive operator, e.g. `relax.nn.conv2d`.
    Op(String),
    /// Whole-module function looked up by name.
    Global(String),
    /// Variable bound to a function literal earlier in the body.
    Local(ExprId),
    /// Inline function literal.
    Function(ExprId),
}

#[derive(Debug, Clone)]
pub struct Call {
    pub callee: Callee,
    pub args: Vec<ExprId>,
    pub attrs: Option<AttrRecord>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FuncAttrs {
    /// Logical operator name when the function stands for a single fused op.
    pub composite: Option<String>,
    /// Backend this function was partitioned for.
    pub codegen: Option<String>,
}

impl FuncAttrs {
    pub fn composite(name: impl Into<String>) -> Self {
        Self {
            composite: Some(name.into()),
            codegen: None,
        }
    }

    pub fn codegen(name: impl Into<String>) -> Self {
        Self {
            composite: None,
            codegen: Some(name.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Binding {
    pub var: ExprId,
    pub value: ExprId,
}

/// Ordered bindings sharing one scope name (taken from `span.name`).
#[derive(Debug, Clone)]
pub struct BindingBlock {
    pub span: Span,
    pub bindings: Vec<Binding>,
}

impl BindingBlock {
    pub fn new(name: impl Into<String>, bindings: Vec<Binding>) -> Self {
        Self {
            span: Span::named(name),
            bindings,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Function {
    pub params: Vec<ExprId>,
    pub blocks: Vec<BindingBlock>,
    pub body: ExprId,
    pub attrs: FuncAttrs,
}

#[derive(Debug, Clone)]
pub enum Expr {
    Var(Var),
    Constant(TensorData),
    ShapeExpr(Vec<Dimension>),
    PrimValue(PrimValue),
    Tuple(Vec<ExprId>),
    TupleGetItem { tuple: ExprId, index: usize },
    Call(Call),
    Function(Function),
}

impl Expr {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Expr::Var(_) => "Var",
            Expr::Constant(_) => "Constant",
            Expr::ShapeExpr(_) => "ShapeExpr",
            Expr::PrimValue(_) => "PrimValue",
            Expr::Tuple(_) => "Tuple",
            Expr::TupleGetItem { .. } => "TupleGetItem",
            Expr::Call(_) => "Call",
            Expr::Function(_) => "Function",
        }
    }
}

/// Collection of named functions sharing one expression arena.
#[derive(Debug, Clone, Default)]
pub struct Module {
    arena: ExprArena<Expr>,
    functions: BTreeMap<String, ExprId>,
}

impl Module {
    pub fn node(&self, id: ExprId) -> Result<&ExprNode<Expr>> {
        self.arena.get(id).ok_or(BuildError::DanglingExpr { expr: id })
    }

    pub fn expr(&self, id: ExprId) -> Result<&Expr> {
        Ok(&self.node(id)?.kind)
    }

    pub fn span(&self, id: ExprId) -> Result<&Span> {
        Ok(&self.node(id)?.span)
    }

    pub fn sinfo(&self, id: ExprId) -> Result<&StructInfo> {
        self.node(id)?
            .sinfo
            .as_ref()
            .ok_or(BuildError::MissingStructInfo { expr: id })
    }

    pub fn function(&self, id: ExprId) -> Result<&Function> {
        match self.expr(id)? {
            Expr::Function(function) => Ok(function),
            _ => Err(BuildError::NotAFunction { expr: id }),
        }
    }

    /// Resolves a module-level function by name.
    pub fn lookup(&self, name: &str) -> Result<ExprId> {
        self.functions
            .get(name)
            .copied()
            .ok_or_else(|| BuildError::MissingFunction {
                name: name.to_string(),
            })
    }

    pub fn lookup_function(&self, name: &str) -> Result<&Function> {
        self.function(self.lookup(name)?)
    }

    pub fn functions(&self) -> impl Iterator<Item = (&str, ExprId)> {
        self.functions.iter().map(|(name, id)| (name.as_str(), *id))
    }

    /// Name hint of a variable, or `None` for any other expression.
    pub fn var_name(&self, id: ExprId) -> Option<&str> {
        match self.arena.get(id).map(|node| &node.kind) {
            Some(Expr::Var(var)) => Some(var.name_hint.as_str()),
            _ => None,
        }
    }
}

/// Programmatic constructor for binding-dialect modules.
#[derive(Debug, Default)]
pub struct ScopedBuilder {
    module: Module,
}

impl ScopedBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn alloc(&mut self, kind: Expr, span: Span, sinfo: Option<StructInfo>) -> ExprId {
        self.module.arena.alloc(kind, span, sinfo)
    }

    fn sinfo_of(&self, id: ExprId) -> Option<StructInfo> {
        self.module.arena.get(id).and_then(|node| node.sinfo.clone())
    }

    pub fn var(&mut self, name: impl Into<String>, sinfo: StructInfo) -> ExprId {
        let name_hint = name.into();
        self.alloc(Expr::Var(Var { name_hint }), Span::new(), Some(sinfo))
    }

    /// Adds a literal constant whose `span.name` is `name`.
    pub fn constant(&mut self, name: impl Into<String>, data: TensorData) -> ExprId {
        self.constant_with_span(Span::named(name), data)
    }

    pub fn constant_with_span(&mut self, span: Span, data: TensorData) -> ExprId {
        let sinfo = StructInfo::Tensor {
            dtype: data.dtype,
            shape: Some(data.shape.clone()),
        };
        self.alloc(Expr::Constant(data), span, Some(sinfo))
    }

    pub fn shape_expr(&mut self, dims: Vec<Dimension>) -> ExprId {
        let sinfo = StructInfo::Shape { ndim: dims.len() };
        self.alloc(Expr::ShapeExpr(dims), Span::new(), Some(sinfo))
    }

    pub fn prim(&mut self, value: PrimValue) -> ExprId {
        self.alloc(Expr::PrimValue(value), Span::new(), Some(StructInfo::Object))
    }

    pub fn tuple(&mut self, fields: Vec<ExprId>) -> ExprId {
        let sinfo = fields
            .iter()
            .map(|field| self.sinfo_of(*field))
            .collect::<Option<Vec<_>>>()
            .map(StructInfo::Tuple);
        self.alloc(Expr::Tuple(fields), Span::new(), sinfo)
    }

    pub fn get_item(&mut self, tuple: ExprId, index: usize) -> ExprId {
        let sinfo = match self.sinfo_of(tuple) {
            Some(StructInfo::Tuple(fields)) => fields.get(index).cloned(),
            _ => None,
        };
        self.alloc(Expr::TupleGetItem { tuple, index }, Span::new(), sinfo)
    }

    pub fn call(
        &mut self,
        callee: Callee,
        args: Vec<ExprId>,
        attrs: Option<AttrRecord>,
        sinfo: StructInfo,
    ) -> ExprId {
        let call = Call {
            callee,
            args,
            attrs,
        };
        self.alloc(Expr::Call(call), Span::new(), Some(sinfo))
    }

    pub fn call_op(
        &mut self,
        op: impl Into<String>,
        args: Vec<ExprId>,
        attrs: Option<AttrRecord>,
        sinfo: StructInfo,
    ) -> ExprId {
        self.call(Callee::Op(op.into()), args, attrs, sinfo)
    }

    /// Binds `value` to a fresh variable carrying the value's structural type.
    pub fn bind(&mut self, name: impl Into<String>, value: ExprId) -> Binding {
        let sinfo = self.sinfo_of(value).unwrap_or(StructInfo::Object);
        let var = self.var(name, sinfo);
        Binding { var, value }
    }

    pub fn function(
        &mut self,
        params: Vec<ExprId>,
        blocks: Vec<BindingBlock>,
        body: ExprId,
        attrs: FuncAttrs,
    ) -> ExprId {
        let sinfo = self.sinfo_of(body).map(|ret| StructInfo::Func { ret: Box::new(ret) });
        let function = Function {
            params,
            blocks,
            body,
            attrs,
        };
        self.alloc(Expr::Function(function), Span::new(), sinfo)
    }

    /// Replaces the side-channel metadata of `id`.
    pub fn set_span(&mut self, id: ExprId, span: Span) {
        if let Some(node) = self.module.arena.get_mut(id) {
            node.span = span;
        }
    }

    pub fn set_name(&mut self, id: ExprId, name: impl Into<String>) {
        self.set_attr(id, Span::NAME, name);
    }

    pub fn set_attr(&mut self, id: ExprId, key: &str, value: impl Into<String>) {
        if let Some(node) = self.module.arena.get_mut(id) {
            node.span.set(key, value);
        }
    }

    /// Overrides the structural type annotated on `id`.
    pub fn set_struct_info(&mut self, id: ExprId, sinfo: Option<StructInfo>) {
        if let Some(node) = self.module.arena.get_mut(id) {
            node.sinfo = sinfo;
        }
    }

    pub fn add_function(&mut self, name: impl Into<String>, function: ExprId) {
        self.module.functions.insert(name.into(), function);
    }

    pub fn finish(self) -> Module {
        self.module
    }
}
