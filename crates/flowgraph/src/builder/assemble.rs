use std::collections::HashSet;

use tracing::debug;

use crate::config::BuildConfig;
use crate::error::Result;
use crate::graph::Graph;

use super::context::BuildParts;

/// Turns the raw node list of a build into an indexed [`Graph`].
///
/// Nodes named in the weight table or the ignore set are excluded. Their outputs, and the
/// outputs of every kept non-`input` node, can no longer be graph inputs.
pub(crate) fn assemble(
    name: &str,
    parts: BuildParts,
    input_names: Vec<String>,
    output_names: Vec<String>,
    config: &BuildConfig,
) -> Result<Graph> {
    let BuildParts {
        mut nodes,
        weights,
        ignored,
    } = parts;

    let excluded: Vec<bool> = nodes
        .iter()
        .map(|node| weights.contains_key(&node.name) || ignored.contains(&node.name))
        .collect();

    let mut shadowed = HashSet::new();
    for (node, excluded) in nodes.iter().zip(&excluded) {
        if *excluded || node.op_type != "input" {
            shadowed.extend(node.outputs.iter().map(|output| output.name.clone()));
        }
    }
    let mut inputs: Vec<String> = input_names
        .into_iter()
        .filter(|name| !shadowed.contains(name))
        .collect();

    let mut pruned = HashSet::new();
    if config.prune_unused_inputs {
        let mut consumed = HashSet::new();
        for (node, excluded) in nodes.iter().zip(&excluded) {
            if *excluded {
                continue;
            }
            for input in &node.inputs {
                if let Some(tensor) = nodes
                    .get(input.node.0 as usize)
                    .and_then(|producer| producer.output_at(input.slot))
                {
                    consumed.insert(tensor.name.clone());
                }
            }
        }
        inputs.retain(|name| {
            let keep = consumed.contains(name) || output_names.contains(name);
            if !keep {
                pruned.insert(name.clone());
            }
            keep
        });
    }

    let mut order = Vec::new();
    for (node, excluded) in nodes.iter_mut().zip(&excluded) {
        let unused_input = node.op_type == "input"
            && !node.outputs.is_empty()
            && node.outputs.iter().all(|output| pruned.contains(&output.name));
        if *excluded || unused_input {
            node.index = None;
            continue;
        }
        node.index = Some(order.len());
        order.push(node.id);
    }

    debug!(
        graph = name,
        built = nodes.len(),
        kept = order.len(),
        weights = weights.len(),
        inputs = inputs.len(),
        outputs = output_names.len(),
        "assembled graph"
    );

    let mut graph = Graph::new(name, nodes, order, inputs, output_names, weights);
    assign_aliases(&mut graph, config)?;
    Ok(graph)
}

fn assign_aliases(graph: &mut Graph, config: &BuildConfig) -> Result<()> {
    let inputs = graph.input_names().to_vec();
    if config.input_aliases.len() == inputs.len() {
        for (name, alias) in inputs.iter().zip(&config.input_aliases) {
            graph.set_alias(name, alias.clone())?;
        }
    } else {
        for name in &inputs {
            let producer = graph.find_producer(name)?.name.clone();
            graph.set_alias(name, producer)?;
        }
    }

    let outputs = graph.output_names().to_vec();
    if config.output_aliases.len() == outputs.len() {
        for (name, alias) in outputs.iter().zip(&config.output_aliases) {
            graph.set_alias(name, alias.clone())?;
        }
    } else {
        for name in &outputs {
            if !graph.find_tensor(name)?.alias().is_empty() {
                continue;
            }
            let producer = graph.find_producer(name)?;
            let alias = if producer.outputs.len() == 1 {
                producer.name.clone()
            } else {
                name.replace(':', "_")
            };
            graph.set_alias(name, alias)?;
        }
    }
    Ok(())
}
