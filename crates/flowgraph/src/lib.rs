//! Lowers functional tensor programs into flat dataflow graphs.
//!
//! A host function, written either in the binding dialect ([`ir::scoped`]) or the
//! expression dialect ([`ir::nested`]), is walked once. Every meaningful sub-expression
//! becomes a [`Node`] with named output [`Tensor`]s; constants consumed in weight roles are
//! split off into a shared weight table, and the declared parameters that survive become
//! the graph inputs.

pub mod attrs;
pub mod builder;
pub mod config;
pub mod error;
pub mod graph;
pub mod ir;
pub mod partition;
pub mod roles;
pub mod weights;

pub use builder::{build_nested, build_scoped};
pub use config::BuildConfig;
pub use error::{BuildError, Result};
pub use graph::{Graph, Node, NodeId, Tensor, TensorRef};
pub use partition::{build_partitions, Partition};
pub use weights::{nested_weights, scoped_weights, WeightMap};
