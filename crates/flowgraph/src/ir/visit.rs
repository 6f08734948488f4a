use crate::error::Result;

use super::arena::ExprId;
use super::{nested, scoped};

/// Pre-order traversal over a binding-dialect function.
///
/// Default methods descend into every child; implementors override the hooks they care
/// about and call the matching `walk_*` function to keep descending.
pub trait ScopedVisitor<'m> {
    fn module(&self) -> &'m scoped::Module;

    fn visit_expr(&mut self, id: ExprId) -> Result<()> {
        walk_scoped_expr(self, id)
    }

    fn visit_function(&mut self, _id: ExprId, function: &'m scoped::Function) -> Result<()> {
        walk_scoped_function(self, function)
    }

    fn visit_binding_block(&mut self, block: &'m scoped::BindingBlock) -> Result<()> {
        walk_binding_block(self, block)
    }

    fn visit_binding(&mut self, binding: scoped::Binding) -> Result<()> {
        self.visit_expr(binding.value)
    }
}

pub fn walk_scoped_expr<'m, V: ScopedVisitor<'m> + ?Sized>(
    visitor: &mut V,
    id: ExprId,
) -> Result<()> {
    let module = visitor.module();
    match module.expr(id)? {
        scoped::Expr::Var(_)
        | scoped::Expr::Constant(_)
        | scoped::Expr::ShapeExpr(_)
        | scoped::Expr::PrimValue(_) => Ok(()),
        scoped::Expr::Tuple(fields) => {
            for field in fields {
                visitor.visit_expr(*field)?;
            }
            Ok(())
        }
        scoped::Expr::TupleGetItem { tuple, .. } => visitor.visit_expr(*tuple),
        scoped::Expr::Call(call) => {
            match &call.callee {
                scoped::Callee::Local(target) | scoped::Callee::Function(target) => {
                    visitor.visit_expr(*target)?
                }
                scoped::Callee::Op(_) | scoped::Callee::Global(_) => {}
            }
            for arg in &call.args {
                visitor.visit_expr(*arg)?;
            }
            Ok(())
        }
        scoped::Expr::Function(function) => visitor.visit_function(id, function),
    }
}

pub fn walk_scoped_function<'m, V: ScopedVisitor<'m> + ?Sized>(
    visitor: &mut V,
    function: &'m scoped::Function,
) -> Result<()> {
    for param in &function.params {
        visitor.visit_expr(*param)?;
    }
    for block in &function.blocks {
        visitor.visit_binding_block(block)?;
    }
    visitor.visit_expr(function.body)
}

pub fn walk_binding_block<'m, V: ScopedVisitor<'m> + ?Sized>(
    visitor: &mut V,
    block: &'m scoped::BindingBlock,
) -> Result<()> {
    for binding in &block.bindings {
        visitor.visit_binding(*binding)?;
    }
    Ok(())
}

/// Traversal over an expression-dialect function that reaches each expression once.
pub trait NestedVisitor<'m> {
    fn module(&self) -> &'m nested::Module;

    /// Records `id` as visited; returns `false` when it already was.
    fn mark_visited(&mut self, id: ExprId) -> bool;

    fn visit_expr(&mut self, id: ExprId) -> Result<()> {
        if !self.mark_visited(id) {
            return Ok(());
        }
        walk_nested_children(self, id)
    }
}

/// Visits the direct children of `id`: callee before arguments, params before body.
pub fn walk_nested_children<'m, V: NestedVisitor<'m> + ?Sized>(
    visitor: &mut V,
    id: ExprId,
) -> Result<()> {
    let module = visitor.module();
    match module.expr(id)? {
        nested::Expr::Var(_) | nested::Expr::Constant(_) => Ok(()),
        nested::Expr::Tuple(fields) => {
            for field in fields {
                visitor.visit_expr(*field)?;
            }
            Ok(())
        }
        nested::Expr::TupleGetItem { tuple, .. } => visitor.visit_expr(*tuple),
        nested::Expr::Call(call) => {
            if let nested::Callee::Expr(callee) = &call.callee {
                visitor.visit_expr(*callee)?;
            }
            for arg in &call.args {
                visitor.visit_expr(*arg)?;
            }
            Ok(())
        }
        nested::Expr::Function(function) => {
            for param in &function.params {
                visitor.visit_expr(*param)?;
            }
            visitor.visit_expr(function.body)
        }
    }
}
