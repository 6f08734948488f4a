//! Per-operator roles of positional call arguments.
//!
//! Arguments whose role is anything but [`INPUT`] may be lowered as weights when they are
//! constant, or folded into attributes when they are shapes or scalars.

use crate::error::{BuildError, Result};

pub const INPUT: &str = "input";
pub const WEIGHT: &str = "weight";
pub const BIAS: &str = "bias";

/// Which host dialect asks for roles; a few conventions only exist in one of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dialect {
    Scoped,
    Nested,
}

/// Returns one role per argument of `op_type`.
///
/// Ops without a named convention take `input` everywhere. Ops with one must be called with
/// exactly as many arguments as the convention declares.
pub fn input_roles(op_type: &str, count: usize, dialect: Dialect) -> Result<Vec<&'static str>> {
    let scoped = dialect == Dialect::Scoped;
    let roles: Vec<&'static str> = match op_type {
        "reshape" | "broadcast_to" if scoped => vec![INPUT, "shape"],
        "clip" if scoped => vec![INPUT, "min", "max"],
        "full" if scoped => vec!["shape", INPUT],
        "trilu" => vec![INPUT, "k"],
        "image.resize2d" if scoped => {
            let mut roles = vec![INPUT];
            roles.extend(std::iter::repeat("size").take(count.saturating_sub(1)));
            roles
        }
        "nn.conv1d" | "nn.conv2d" | "nn.conv3d" | "nn.dense" => vec![INPUT, WEIGHT],
        "nn.batch_norm" => vec![INPUT, "gamma", "beta", "mean", "var"],
        "nn.layer_norm" | "nn.group_norm" => vec![INPUT, "gamma", "beta"],
        "nn.bias_add" => vec![INPUT, BIAS],
        "nn.prelu" => vec![INPUT, "alpha"],
        "msc.linear" => vec![INPUT, WEIGHT],
        "msc.linear_bias" => vec![INPUT, WEIGHT, BIAS],
        "msc.conv1d_bias" | "msc.conv2d_bias" => {
            if scoped && count == 4 {
                vec![INPUT, WEIGHT, BIAS, "expand_bias"]
            } else {
                vec![INPUT, WEIGHT, BIAS]
            }
        }
        "msc.embedding" if count == 4 => vec![INPUT, "reshape_in", WEIGHT, "reshape_out"],
        "msc.embedding" => vec![INPUT, WEIGHT],
        _ => vec![INPUT; count],
    };
    if roles.len() != count {
        return Err(BuildError::RoleArityMismatch {
            op_type: op_type.to_string(),
            declared: roles.len(),
            requested: count,
        });
    }
    Ok(roles)
}
