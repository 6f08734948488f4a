//! Host program representation consumed by the graph builders.

pub mod arena;
pub mod nested;
pub mod scoped;
pub mod types;
pub mod visit;

pub use arena::{ExprArena, ExprId, ExprNode};
pub use types::{
    AttrRecord, AttrValue, DType, DimSymbol, Dimension, PrimValue, Shape, Span, StructInfo,
    TensorData,
};
