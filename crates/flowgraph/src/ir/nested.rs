//! Expression dialect: plain nested calls, with composite function literals marking fused ops.

use std::collections::BTreeMap;

use crate::error::{BuildError, Result};

use super::arena::{ExprArena, ExprId, ExprNode};
use super::types::{AttrRecord, Span, StructInfo, TensorData};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Var {
    pub name_hint: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Callee {
    Op(String),
    /// Any callable expression, typically a function literal.
    Expr(ExprId),
}

#[derive(Debug, Clone)]
pub struct Call {
    pub callee: Callee,
    pub args: Vec<ExprId>,
    pub attrs: Option<AttrRecord>,
}

#[derive(Debug, Clone)]
pub struct Function {
    pub params: Vec<ExprId>,
    pub body: ExprId,
    pub composite: Option<String>,
}

#[derive(Debug, Clone)]
pub enum Expr {
    Var(Var),
    Constant(TensorData),
    Tuple(Vec<ExprId>),
    TupleGetItem { tuple: ExprId, index: usize },
    Call(Call),
    Function(Function),
}

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

    /// Checked type of `id`; `None` when type inference never ran on it.
    pub fn checked_type(&self, id: ExprId) -> Result<Option<&StructInfo>> {
        Ok(self.node(id)?.sinfo.as_ref())
    }

    pub fn function(&self, id: ExprId) -> Result<&Function> {
        match self.expr(id)? {
            Expr::Function(function) => Ok(function),
            _ => Err(BuildError::NotAFunction { expr: id }),
        }
    }

    pub fn lookup(&self, name: &str) -> Result<ExprId> {
        self.functions
            .get(name)
            .copied()
            .ok_or_else(|| BuildError::MissingFunction {
                name: name.to_string(),
            })
    }

    pub fn var_name(&self, id: ExprId) -> Option<&str> {
        match self.arena.get(id).map(|node| &node.kind) {
            Some(Expr::Var(var)) => Some(var.name_hint.as_str()),
            _ => None,
        }
    }
}

/// Programmatic constructor for expression-dialect modules.
#[derive(Debug, Default)]
pub struct NestedBuilder {
    module: Module,
}

impl NestedBuilder {
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

    pub fn function(
        &mut self,
        params: Vec<ExprId>,
        body: ExprId,
        composite: Option<String>,
    ) -> ExprId {
        let sinfo = self.sinfo_of(body).map(|ret| StructInfo::Func { ret: Box::new(ret) });
        let function = Function {
            params,
            body,
            composite,
        };
        self.alloc(Expr::Function(function), Span::new(), sinfo)
    }

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

    /// Drops the checked type of `id`, as for expressions type inference never reached.
    pub fn clear_type(&mut self, id: ExprId) {
        if let Some(node) = self.module.arena.get_mut(id) {
            node.sinfo = None;
        }
    }

    pub fn add_function(&mut self, name: impl Into<String>, function: ExprId) {
        self.module.functions.insert(name.into(), function);
    }

    pub fn finish(self) -> Module {
        self.module
    }
}
