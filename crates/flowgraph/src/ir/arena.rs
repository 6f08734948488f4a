//! Arena storage shared by both host dialects.
//!
//! Expressions are addressed by [`ExprId`]; two consumers of the same sub-expression hold
//! the same id, which is what the lowering memo tables key on.

use std::fmt;

use super::types::{Span, StructInfo};

/// Stable handle to an expression inside an [`ExprArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExprId(pub u32);

impl fmt::Display for ExprId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

/// Arena entry: the dialect-specific expression plus its side-channel metadata.
#[derive(Debug, Clone)]
pub struct ExprNode<K> {
    pub kind: K,
    pub span: Span,
    pub sinfo: Option<StructInfo>,
}

#[derive(Debug, Clone)]
pub struct ExprArena<K> {
    nodes: Vec<ExprNode<K>>,
}

impl<K> Default for ExprArena<K> {
    fn default() -> Self {
        Self { nodes: Vec::new() }
    }
}

impl<K> ExprArena<K> {
    pub fn alloc(&mut self, kind: K, span: Span, sinfo: Option<StructInfo>) -> ExprId {
        let id = ExprId(self.nodes.len() as u32);
        self.nodes.push(ExprNode { kind, span, sinfo });
        id
    }

    /// `None` for ids minted by another arena.
    pub fn get(&self, id: ExprId) -> Option<&ExprNode<K>> {
        self.nodes.get(id.0 as usize)
    }

    pub fn get_mut(&mut self, id: ExprId) -> Option<&mut ExprNode<K>> {
        self.nodes.get_mut(id.0 as usize)
    }
}
