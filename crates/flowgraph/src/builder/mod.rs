//! Graph construction for both host dialects.

mod assemble;
mod context;
mod nested;
mod scoped;

use std::collections::HashMap;

use crate::config::BuildConfig;
use crate::error::Result;
use crate::graph::Graph;
use crate::ir::{nested as nested_ir, scoped as scoped_ir};

use self::nested::NestedGraphBuilder;
use self::scoped::{ParamFinder, ScopedGraphBuilder};

/// Lowers a binding-dialect function into a [`Graph`].
///
/// When `config.byoc_entry` names a partition function, that function is lowered instead
/// and the parameters `entry` feeds it are propagated first, so constants passed in from
/// the entry become weights of the partition graph.
pub fn build_scoped(
    module: &scoped_ir::Module,
    entry: &str,
    config: &BuildConfig,
) -> Result<Graph> {
    let lowered = config.lowered_entry(entry);
    let function = module.lookup(lowered)?;
    let func_params = if lowered != entry {
        ParamFinder::new(module).find(module.lookup(entry)?)?
    } else {
        HashMap::new()
    };
    ScopedGraphBuilder::new(module, config, func_params).build(lowered, function)
}

/// Lowers an expression-dialect function into a [`Graph`].
pub fn build_nested(
    module: &nested_ir::Module,
    entry: &str,
    config: &BuildConfig,
) -> Result<Graph> {
    let function = module.lookup(entry)?;
    NestedGraphBuilder::new(module, config).build(entry, function)
}
