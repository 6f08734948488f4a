//! One graph per backend partition of a binding-dialect module.

use anyhow::{Context, Result};
use tracing::info;

use crate::builder::build_scoped;
use crate::config::BuildConfig;
use crate::graph::Graph;
use crate::ir::scoped::Module;
use crate::weights::{scoped_weights, WeightMap};

/// A lowered partition function with the constants its graph needs.
#[derive(Debug)]
pub struct Partition {
    pub name: String,
    pub graph: Graph,
    pub weights: WeightMap,
}

/// Builds every function whose `codegen` attribute equals `target`, in name order.
///
/// Each partition is lowered with `byoc_entry` pointing at it so that constants `entry`
/// passes in become weights. Its weight map holds the partition's own constants plus the
/// entry constants its graph refers to as weights.
pub fn build_partitions(
    module: &Module,
    entry: &str,
    target: &str,
    config: &BuildConfig,
) -> Result<Vec<Partition>> {
    let entry_weights = scoped_weights(module, entry)
        .with_context(|| format!("failed to collect weights of entry '{entry}'"))?;

    let mut partitions = Vec::new();
    for (name, id) in module.functions() {
        let function = module
            .function(id)
            .with_context(|| format!("module entry '{name}' is not a function"))?;
        if function.attrs.codegen.as_deref() != Some(target) {
            continue;
        }
        let partition_config = config.clone().with_byoc_entry(name);
        let graph = build_scoped(module, entry, &partition_config)
            .with_context(|| format!("failed to build partition '{name}' for '{target}'"))?;
        let mut weights = scoped_weights(module, name)
            .with_context(|| format!("failed to collect weights of partition '{name}'"))?;
        for (tensor, data) in &entry_weights {
            if graph.find_weight(&tensor.name).is_some() {
                weights.insert(tensor.clone(), data.clone());
            }
        }
        info!(
            partition = name,
            backend = target,
            nodes = graph.node_count(),
            weights = weights.len(),
            "built partition graph"
        );
        partitions.push(Partition {
            name: name.to_string(),
            graph,
            weights,
        });
    }
    Ok(partitions)
}
