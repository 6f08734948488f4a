//! String forms of operator attributes.
//!
//! Every attribute that reaches a [`Node`](crate::graph::Node) is a plain string. Lists are
//! joined with `,` (no brackets), floats inside attribute records use six fixed decimals,
//! and scalar constants use the configured precision.

use std::collections::BTreeMap;

use crate::ir::types::{join_list, AttrRecord, AttrValue, PrimValue, TensorData};

pub type AttrMap = BTreeMap<String, String>;

const RECORD_FLOAT_PRECISION: usize = 6;

/// Canonical string of a single attribute field.
pub fn format_value(value: &AttrValue) -> String {
    match value {
        AttrValue::None => String::new(),
        AttrValue::Bool(value) => value.to_string(),
        AttrValue::Int(value) => value.to_string(),
        AttrValue::Float(value) => format_float(*value, RECORD_FLOAT_PRECISION),
        AttrValue::Str(value) => value.clone(),
        AttrValue::DType(dtype) => dtype.to_string(),
        AttrValue::IntList(values) => join_list(values),
        AttrValue::FloatList(values) => values
            .iter()
            .map(|value| format_float(*value, RECORD_FLOAT_PRECISION))
            .collect::<Vec<_>>()
            .join(","),
        AttrValue::StrList(values) => values.join(","),
        AttrValue::Dims(dims) => join_list(dims),
    }
}

fn format_float(value: f64, precision: usize) -> String {
    format!("{value:.precision$}")
}

/// Flattens one attribute record; fields keep their own names.
pub fn flatten(record: &AttrRecord) -> AttrMap {
    record
        .fields()
        .map(|(key, value)| (key.to_string(), format_value(value)))
        .collect()
}

/// Inserts `key` into `attrs`, renaming it to `key_<n>` with the smallest free `n >= 1`
/// when it is already taken.
pub fn insert_unique(attrs: &mut AttrMap, key: &str, value: String) {
    if !attrs.contains_key(key) {
        attrs.insert(key.to_string(), value);
        return;
    }
    let mut count = 1usize;
    while attrs.contains_key(&format!("{key}_{count}")) {
        count += 1;
    }
    attrs.insert(format!("{key}_{count}"), value);
}

/// Merges `source` into `target` without overwriting any existing key.
pub fn merge(target: &mut AttrMap, source: AttrMap) {
    for (key, value) in source {
        insert_unique(target, &key, value);
    }
}

/// Text of a rank-0 constant: fixed `precision` decimals for floats, plain integer otherwise
/// (booleans included).
///
/// Returns `None` for non-scalar payloads or payloads too short to hold one element.
pub fn format_scalar(data: &TensorData, precision: usize) -> Option<String> {
    if !data.is_scalar() {
        return None;
    }
    if data.dtype.is_float() {
        let value = data.first_as_f64()? as f32;
        Some(format!("{value:.precision$}"))
    } else {
        Some((data.first_as_i64()? as i32).to_string())
    }
}

pub fn format_prim(value: &PrimValue) -> String {
    match value {
        PrimValue::Float(value) => format_float(*value, RECORD_FLOAT_PRECISION),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::ir::types::{DType, Dimension, Shape};

    #[test]
    fn colliding_keys_get_numbered_suffixes() {
        let mut attrs = AttrMap::new();
        merge(
            &mut attrs,
            flatten(&AttrRecord::new().with("axis", AttrValue::Int(1))),
        );
        merge(
            &mut attrs,
            flatten(&AttrRecord::new().with("axis", AttrValue::Int(-1))),
        );
        merge(
            &mut attrs,
            flatten(&AttrRecord::new().with("axis", AttrValue::Int(2))),
        );
        assert_eq!(attrs.get("axis").map(String::as_str), Some("1"));
        assert_eq!(attrs.get("axis_1").map(String::as_str), Some("-1"));
        assert_eq!(attrs.get("axis_2").map(String::as_str), Some("2"));
    }

    #[test]
    fn suffix_skips_taken_slots() {
        let mut attrs = AttrMap::new();
        attrs.insert("axis".into(), "0".into());
        attrs.insert("axis_1".into(), "1".into());
        insert_unique(&mut attrs, "axis", "2".into());
        assert_eq!(attrs.get("axis_2").map(String::as_str), Some("2"));
        assert_eq!(attrs.len(), 3);
    }

    #[test]
    fn record_values_use_canonical_text() {
        let record = AttrRecord::new()
            .with("strides", AttrValue::IntList(vec![1, 2]))
            .with("scale", AttrValue::Float(0.5))
            .with("layout", AttrValue::Str("NCHW".into()))
            .with("out_dtype", AttrValue::DType(DType::F16))
            .with("keepdims", AttrValue::Bool(false))
            .with("axes", AttrValue::None)
            .with(
                "shape",
                AttrValue::Dims(vec![Dimension::symbol("n"), Dimension::Static(4)]),
            );
        let attrs = flatten(&record);
        assert_eq!(attrs["strides"], "1,2");
        assert_eq!(attrs["scale"], "0.500000");
        assert_eq!(attrs["layout"], "NCHW");
        assert_eq!(attrs["out_dtype"], "float16");
        assert_eq!(attrs["keepdims"], "false");
        assert_eq!(attrs["axes"], "");
        assert_eq!(attrs["shape"], "n,4");
    }

    #[test]
    fn scalars_follow_precision() {
        let float = TensorData::scalar_f32(1.5);
        assert_eq!(format_scalar(&float, 3).as_deref(), Some("1.500"));
        assert_eq!(format_scalar(&float, 6).as_deref(), Some("1.500000"));
        let int = TensorData::scalar_i32(-7);
        assert_eq!(format_scalar(&int, 3).as_deref(), Some("-7"));
        let vector = TensorData::from_f32(&[2], &[1.0, 2.0]);
        assert_eq!(format_scalar(&vector, 3), None);
    }

    #[test]
    fn bool_scalars_print_as_integers() {
        let flag = |byte: u8| TensorData::new(DType::I1, Shape::default(), Arc::from(vec![byte]));
        assert_eq!(format_scalar(&flag(1), 6).as_deref(), Some("1"));
        assert_eq!(format_scalar(&flag(0), 6).as_deref(), Some("0"));
    }

    #[test]
    fn half_precision_scalars_are_decoded() {
        let half = |dtype: DType, bits: u16| {
            TensorData::new(dtype, Shape::default(), Arc::from(bits.to_le_bytes().to_vec()))
        };
        // 1.5 in IEEE half and in bfloat16.
        assert_eq!(format_scalar(&half(DType::F16, 0x3e00), 2).as_deref(), Some("1.50"));
        assert_eq!(format_scalar(&half(DType::Bf16, 0x3fc0), 2).as_deref(), Some("1.50"));
        // Smallest positive f16 subnormal, 2^-24.
        let tiny = half(DType::F16, 0x0001).first_as_f64().expect("subnormal");
        assert_eq!(tiny, 2f64.powi(-24));
    }
}
