use thiserror::Error;

use crate::ir::arena::ExprId;

/// Internal-consistency failures raised while lowering a host function.
///
/// Every variant aborts the whole build; no partial graph is produced.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("function '{name}' not found in module")]
    MissingFunction { name: String },
    #[error("expression {expr} does not exist in the module arena")]
    DanglingExpr { expr: ExprId },
    #[error("expression {expr} is not a function")]
    NotAFunction { expr: ExprId },
    #[error("{what} {expr} has not been lowered yet")]
    NotLowered { what: &'static str, expr: ExprId },
    #[error("tensor '{name}' is not produced by any node")]
    UnknownTensor { name: String },
    #[error("node '{name}' not found in graph")]
    UnknownNode { name: String },
    #[error("cannot resolve callee {callee}")]
    UnresolvedCallee { callee: ExprId },
    #[error("function '{function}' has no composite annotation")]
    MissingComposite { function: String },
    #[error("composite '{composite}' does not belong to target '{target}'")]
    TargetMismatch { composite: String, target: String },
    #[error("expression {expr} has no structural type")]
    MissingStructInfo { expr: ExprId },
    #[error("unexpected {found} on {expr} while lowering {context}")]
    UnexpectedStructInfo {
        expr: ExprId,
        found: &'static str,
        context: &'static str,
    },
    #[error("layout '{layout}' does not match {fields} tuple fields")]
    LayoutMismatch { layout: String, fields: usize },
    #[error("op '{op_type}' declares {declared} input roles but {requested} were requested")]
    RoleArityMismatch {
        op_type: String,
        declared: usize,
        requested: usize,
    },
    #[error("primitive value at position {index} of '{op_type}' is routed to an input role")]
    PrimValueAsInput { op_type: String, index: usize },
    #[error("bias weight '{weight}' has a non-static shape")]
    DynamicBias { weight: String },
    #[error("unexpected tuple input field {expr}")]
    UnexpectedTupleField { expr: ExprId },
    #[error("composite function {expr} lowered outside of a function scope")]
    MissingFuncScope { expr: ExprId },
    #[error("invalid build options: {0}")]
    InvalidOptions(#[from] serde_json::Error),
}

/// Convenience alias for results returned by graph construction.
pub type Result<T> = std::result::Result<T, BuildError>;
