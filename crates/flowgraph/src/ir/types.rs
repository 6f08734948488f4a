use std::{collections::BTreeMap, fmt, sync::Arc};

use half::{bf16, f16};

/// Enumerates scalar element types carried by host tensors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(clippy::upper_case_acronyms)]
pub enum DType {
    I1,
    Si8,
    Ui8,
    Si16,
    Ui16,
    Si32,
    Ui32,
    Si64,
    Ui64,
    Bf16,
    F16,
    F32,
    F64,
}

impl DType {
    /// Returns `true` when the dtype is a floating-point representation.
    pub fn is_float(self) -> bool {
        matches!(self, DType::Bf16 | DType::F16 | DType::F32 | DType::F64)
    }

    /// Returns the size in bytes of a single element.
    pub fn size_in_bytes(self) -> usize {
        match self {
            DType::I1 | DType::Si8 | DType::Ui8 => 1,
            DType::Si16 | DType::Ui16 | DType::Bf16 | DType::F16 => 2,
            DType::Si32 | DType::Ui32 | DType::F32 => 4,
            DType::Si64 | DType::Ui64 | DType::F64 => 8,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DType::I1 => "bool",
            DType::Si8 => "int8",
            DType::Ui8 => "uint8",
            DType::Si16 => "int16",
            DType::Ui16 => "uint16",
            DType::Si32 => "int32",
            DType::Ui32 => "uint32",
            DType::Si64 => "int64",
            DType::Ui64 => "uint64",
            DType::Bf16 => "bfloat16",
            DType::F16 => "float16",
            DType::F32 => "float32",
            DType::F64 => "float64",
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Names a symbolic dynamic dimension (e.g. `n`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DimSymbol(Arc<str>);

impl DimSymbol {
    pub fn new(name: impl Into<String>) -> Self {
        Self(Arc::<str>::from(name.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Represents a single axis extent in a tensor shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Dimension {
    Static(usize),
    Dynamic(DimSymbol),
}

impl Dimension {
    pub fn symbol(name: impl Into<String>) -> Self {
        Self::Dynamic(DimSymbol::new(name))
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dimension::Static(value) => write!(f, "{value}"),
            Dimension::Dynamic(sym) => f.write_str(sym.as_str()),
        }
    }
}

/// Logical tensor shape as an ordered list of dimensions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Shape {
    dims: Vec<Dimension>,
}

impl Shape {
    pub fn new(dims: impl Into<Vec<Dimension>>) -> Self {
        Self { dims: dims.into() }
    }

    /// Builds a fully static shape.
    pub fn from_static(dims: &[usize]) -> Self {
        Self::new(dims.iter().copied().map(Dimension::Static).collect::<Vec<_>>())
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn dims(&self) -> &[Dimension] {
        &self.dims
    }

    /// Returns static dimensions when all dims are static.
    pub fn static_dims(&self) -> Option<Vec<usize>> {
        let mut dims = Vec::with_capacity(self.dims.len());
        for dim in &self.dims {
            match dim {
                Dimension::Static(value) => dims.push(*value),
                Dimension::Dynamic(_) => return None,
            }
        }
        Some(dims)
    }

    /// Returns element count when all dims are static.
    pub fn element_count(&self) -> Option<usize> {
        let dims = self.static_dims()?;
        let mut count = 1usize;
        for dim in dims {
            count = count.checked_mul(dim)?;
        }
        Some(count)
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&join_list(&self.dims))
    }
}

/// Joins list items with `,` and no brackets; the canonical list form used for attributes.
pub fn join_list<T: fmt::Display>(items: &[T]) -> String {
    items
        .iter()
        .map(|item| item.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

/// Structural type recorded on a host expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StructInfo {
    /// Tensor whose shape may be unknown altogether.
    Tensor { dtype: DType, shape: Option<Shape> },
    /// First-class shape value of the given rank.
    Shape { ndim: usize },
    Tuple(Vec<StructInfo>),
    /// Function value; lowering looks through to the return type.
    Func { ret: Box<StructInfo> },
    Object,
}

impl StructInfo {
    pub fn tensor(dtype: DType, dims: &[usize]) -> Self {
        StructInfo::Tensor {
            dtype,
            shape: Some(Shape::from_static(dims)),
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            StructInfo::Tensor { .. } => "TensorStructInfo",
            StructInfo::Shape { .. } => "ShapeStructInfo",
            StructInfo::Tuple(_) => "TupleStructInfo",
            StructInfo::Func { .. } => "FuncStructInfo",
            StructInfo::Object => "ObjectStructInfo",
        }
    }
}

/// Side-channel metadata stamped on expressions before lowering.
///
/// Keys that were never set read back as the empty string.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Span {
    attrs: BTreeMap<String, String>,
}

impl Span {
    pub const NAME: &'static str = "name";
    pub const LAYOUT: &'static str = "layout";
    pub const SHARED_REF: &'static str = "shared_ref";

    pub fn new() -> Self {
        Self::default()
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self::new().with(Self::NAME, name)
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attrs.insert(key.into(), value.into());
        self
    }

    pub fn with_layout(self, layout: impl Into<String>) -> Self {
        self.with(Self::LAYOUT, layout)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.attrs.insert(key.into(), value.into());
    }

    pub fn attr(&self, key: &str) -> &str {
        self.attrs.get(key).map(String::as_str).unwrap_or("")
    }

    pub fn name(&self) -> &str {
        self.attr(Self::NAME)
    }

    pub fn layout(&self) -> &str {
        self.attr(Self::LAYOUT)
    }

    pub fn shared_ref(&self) -> &str {
        self.attr(Self::SHARED_REF)
    }
}

/// Dense constant payload attached to literal expressions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorData {
    pub dtype: DType,
    pub shape: Shape,
    pub bytes: Arc<[u8]>,
}

impl TensorData {
    pub fn new(dtype: DType, shape: Shape, bytes: Arc<[u8]>) -> Self {
        Self {
            dtype,
            shape,
            bytes,
        }
    }

    pub fn from_f32(dims: &[usize], values: &[f32]) -> Self {
        let bytes = values
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect::<Vec<_>>();
        Self::new(DType::F32, Shape::from_static(dims), Arc::from(bytes))
    }

    pub fn from_i32(dims: &[usize], values: &[i32]) -> Self {
        let bytes = values
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect::<Vec<_>>();
        Self::new(DType::Si32, Shape::from_static(dims), Arc::from(bytes))
    }

    pub fn scalar_f32(value: f32) -> Self {
        Self::from_f32(&[], &[value])
    }

    pub fn scalar_i32(value: i32) -> Self {
        Self::from_i32(&[], &[value])
    }

    pub fn byte_len(&self) -> usize {
        self.bytes.len()
    }

    /// Rank-0 tensors are scalars.
    pub fn is_scalar(&self) -> bool {
        self.shape.rank() == 0
    }

    /// Reads the first element widened to `f64`, if the payload holds one.
    pub fn first_as_f64(&self) -> Option<f64> {
        let width = self.dtype.size_in_bytes();
        let raw = self.bytes.get(..width)?;
        let value = match self.dtype {
            DType::F32 => f32::from_le_bytes(raw.try_into().ok()?) as f64,
            DType::F64 => f64::from_le_bytes(raw.try_into().ok()?),
            DType::F16 => f16::from_bits(u16::from_le_bytes(raw.try_into().ok()?)).to_f64(),
            DType::Bf16 => bf16::from_bits(u16::from_le_bytes(raw.try_into().ok()?)).to_f64(),
            _ => self.first_as_i64()? as f64,
        };
        Some(value)
    }

    /// Reads the first element as an integer, truncating floating payloads.
    pub fn first_as_i64(&self) -> Option<i64> {
        let width = self.dtype.size_in_bytes();
        let raw = self.bytes.get(..width)?;
        let value = match self.dtype {
            DType::I1 | DType::Ui8 => raw[0] as i64,
            DType::Si8 => raw[0] as i8 as i64,
            DType::Si16 => i16::from_le_bytes(raw.try_into().ok()?) as i64,
            DType::Ui16 => u16::from_le_bytes(raw.try_into().ok()?) as i64,
            DType::Si32 => i32::from_le_bytes(raw.try_into().ok()?) as i64,
            DType::Ui32 => u32::from_le_bytes(raw.try_into().ok()?) as i64,
            DType::Si64 => i64::from_le_bytes(raw.try_into().ok()?),
            DType::Ui64 => u64::from_le_bytes(raw.try_into().ok()?) as i64,
            DType::Bf16 | DType::F16 | DType::F32 | DType::F64 => self.first_as_f64()? as i64,
        };
        Some(value)
    }
}

/// Scalar argument passed by value rather than as a tensor.
#[derive(Debug, Clone, PartialEq)]
pub enum PrimValue {
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl fmt::Display for PrimValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrimValue::Int(value) => write!(f, "{value}"),
            PrimValue::Float(value) => write!(f, "{value}"),
            PrimValue::Bool(value) => write!(f, "{value}"),
        }
    }
}

/// Single field value inside an operator attribute record.
#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    DType(DType),
    IntList(Vec<i64>),
    FloatList(Vec<f64>),
    StrList(Vec<String>),
    Dims(Vec<Dimension>),
}

/// Operator attribute record: named fields in declaration order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttrRecord {
    fields: Vec<(String, AttrValue)>,
}

impl AttrRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: AttrValue) -> Self {
        self.fields.push((key.into(), value));
        self
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &AttrValue)> {
        self.fields.iter().map(|(key, value)| (key.as_str(), value))
    }
}
