//! Runtime values exchanged with the database and the blob format.
//!
//! [`Value`] is the single currency between application code, codec
//! pipelines, drivers, and the blob serializer. A [`Row`] is an ordered map
//! of attribute name to value; insert and fetch both work in rows.

use std::fmt;

use bigdecimal::BigDecimal;
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use indexmap::IndexMap;
use uuid::Uuid;

use crate::error::{Error, Result};

/// A single row keyed by attribute name, in heading order.
pub type Row = IndexMap<String, Value>;

/// Any value the framework can store, fetch, or serialize.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    /// 128-bit complex scalar (blob format only).
    Complex(f64, f64),
    String(String),
    Bytes(Vec<u8>),
    Uuid(Uuid),
    Decimal(BigDecimal),
    Date(NaiveDate),
    Time(NaiveTime),
    DateTime(NaiveDateTime),
    Json(serde_json::Value),
    /// A dense n-dimensional numeric array (column-major element bytes).
    Array(NdArray),
    /// An ordered sequence (blob format: list or tuple).
    List(Vec<Value>),
    /// A set of values; order is not significant.
    Set(Vec<Value>),
    /// A mapping with arbitrary (hashable-in-origin) keys, in insertion order.
    Map(Vec<(Value, Value)>),
}

impl Value {
    /// Returns `true` for [`Value::Null`].
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// A short name for error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Complex(..) => "complex",
            Value::String(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::Uuid(_) => "uuid",
            Value::Decimal(_) => "decimal",
            Value::Date(_) => "date",
            Value::Time(_) => "time",
            Value::DateTime(_) => "datetime",
            Value::Json(_) => "json",
            Value::Array(_) => "array",
            Value::List(_) => "list",
            Value::Set(_) => "set",
            Value::Map(_) => "map",
        }
    }

    /// Extracts bytes, or errors with the expected/actual types.
    pub fn into_bytes(self) -> Result<Vec<u8>> {
        match self {
            Value::Bytes(b) => Ok(b),
            other => Err(Error::validation(format!(
                "expected bytes, got {}",
                other.type_name()
            ))),
        }
    }

    /// Extracts a string, or errors with the expected/actual types.
    pub fn into_string(self) -> Result<String> {
        match self {
            Value::String(s) => Ok(s),
            other => Err(Error::validation(format!(
                "expected string, got {}",
                other.type_name()
            ))),
        }
    }

    /// Views this value as an integer if it is one.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            Value::Bool(b) => Some(*b as i64),
            _ => None,
        }
    }

    /// Views this value as a string slice if it is one.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    /// Compact single-line rendering used by previews and error messages.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("NULL"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Complex(re, im) => write!(f, "{re}+{im}i"),
            Value::String(s) => f.write_str(s),
            Value::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            Value::Uuid(u) => write!(f, "{u}"),
            Value::Decimal(d) => write!(f, "{d}"),
            Value::Date(d) => write!(f, "{d}"),
            Value::Time(t) => write!(f, "{t}"),
            Value::DateTime(dt) => write!(f, "{}", dt.format("%Y-%m-%d %H:%M:%S%.f")),
            Value::Json(j) => write!(f, "{j}"),
            Value::Array(a) => write!(f, "<array {:?} {}>", a.shape, a.dtype),
            Value::List(v) => write!(f, "<list of {}>", v.len()),
            Value::Set(v) => write!(f, "<set of {}>", v.len()),
            Value::Map(v) => write!(f, "<map of {}>", v.len()),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}
impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}
impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}
impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}
impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}
impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}
impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}
impl From<Uuid> for Value {
    fn from(v: Uuid) -> Self {
        Value::Uuid(v)
    }
}
impl From<NaiveDateTime> for Value {
    fn from(v: NaiveDateTime) -> Self {
        Value::DateTime(v)
    }
}

/// Builds a [`Row`] from `(name, value)` pairs.
///
/// ```
/// use quarry_core::value::{row, Value};
/// let r = row([("subject_id", Value::Int(1)), ("weight", Value::Float(21.5))]);
/// assert_eq!(r["subject_id"], Value::Int(1));
/// ```
pub fn row<N: Into<String>, const L: usize>(pairs: [(N, Value); L]) -> Row {
    pairs.into_iter().map(|(n, v)| (n.into(), v)).collect()
}

// ---------------------------------------------------------------------------
// Dense arrays
// ---------------------------------------------------------------------------

/// Element type of an [`NdArray`], matching the blob format's numeric set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArrayDtype {
    Bool,
    F64,
    F32,
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
}

impl ArrayDtype {
    /// Element width in bytes.
    pub fn item_size(self) -> usize {
        match self {
            ArrayDtype::Bool | ArrayDtype::I8 | ArrayDtype::U8 => 1,
            ArrayDtype::I16 | ArrayDtype::U16 => 2,
            ArrayDtype::F32 | ArrayDtype::I32 | ArrayDtype::U32 => 4,
            ArrayDtype::F64 | ArrayDtype::I64 | ArrayDtype::U64 => 8,
        }
    }
}

impl fmt::Display for ArrayDtype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ArrayDtype::Bool => "bool",
            ArrayDtype::F64 => "float64",
            ArrayDtype::F32 => "float32",
            ArrayDtype::I8 => "int8",
            ArrayDtype::U8 => "uint8",
            ArrayDtype::I16 => "int16",
            ArrayDtype::U16 => "uint16",
            ArrayDtype::I32 => "int32",
            ArrayDtype::U32 => "uint32",
            ArrayDtype::I64 => "int64",
            ArrayDtype::U64 => "uint64",
        };
        f.write_str(name)
    }
}

/// A dense n-dimensional array with little-endian element bytes stored in
/// column-major order, mirroring the blob wire layout.
#[derive(Debug, Clone, PartialEq)]
pub struct NdArray {
    pub dtype: ArrayDtype,
    pub shape: Vec<usize>,
    /// Element bytes, column-major, little-endian.
    pub data: Vec<u8>,
    /// Imaginary element bytes for complex arrays, same layout as `data`.
    pub imag: Option<Vec<u8>>,
}

impl NdArray {
    /// Creates an array after checking that the byte length matches the
    /// shape and dtype.
    pub fn new(dtype: ArrayDtype, shape: Vec<usize>, data: Vec<u8>) -> Result<Self> {
        let expected = shape.iter().product::<usize>() * dtype.item_size();
        if data.len() != expected {
            return Err(Error::validation(format!(
                "array data is {} bytes but shape {:?} of {} requires {}",
                data.len(),
                shape,
                dtype,
                expected
            )));
        }
        Ok(NdArray {
            dtype,
            shape,
            data,
            imag: None,
        })
    }

    /// Builds a column-major f64 array from row-major values.
    pub fn from_f64(shape: &[usize], values: &[f64]) -> Result<Self> {
        let n: usize = shape.iter().product();
        if values.len() != n {
            return Err(Error::validation(format!(
                "expected {n} elements for shape {shape:?}, got {}",
                values.len()
            )));
        }
        let mut data = vec![0u8; n * 8];
        for (row_major_idx, v) in values.iter().enumerate() {
            let col_major_idx = transpose_index(row_major_idx, shape);
            data[col_major_idx * 8..col_major_idx * 8 + 8].copy_from_slice(&v.to_le_bytes());
        }
        NdArray::new(ArrayDtype::F64, shape.to_vec(), data)
    }

    /// Reads the array back out as row-major f64 values.
    pub fn to_f64(&self) -> Result<Vec<f64>> {
        if self.dtype != ArrayDtype::F64 {
            return Err(Error::validation(format!(
                "array dtype is {}, not float64",
                self.dtype
            )));
        }
        let n: usize = self.shape.iter().product();
        let mut out = vec![0.0; n];
        for row_major_idx in 0..n {
            let col_major_idx = transpose_index(row_major_idx, &self.shape);
            let bytes: [u8; 8] = self.data[col_major_idx * 8..col_major_idx * 8 + 8]
                .try_into()
                .expect("slice of 8");
            out[row_major_idx] = f64::from_le_bytes(bytes);
        }
        Ok(out)
    }

    /// Total number of elements.
    pub fn len(&self) -> usize {
        self.shape.iter().product()
    }

    /// Returns `true` when the array has no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total payload size in bytes, both parts for complex arrays.
    pub fn nbytes(&self) -> usize {
        self.data.len() + self.imag.as_ref().map_or(0, Vec::len)
    }
}

/// Maps a row-major flat index to the column-major flat index for `shape`.
fn transpose_index(row_major: usize, shape: &[usize]) -> usize {
    let mut rem = row_major;
    let mut coords = vec![0usize; shape.len()];
    for (axis, &dim) in shape.iter().enumerate().rev() {
        coords[axis] = rem % dim;
        rem /= dim;
    }
    let mut idx = 0;
    let mut stride = 1;
    for (axis, &dim) in shape.iter().enumerate() {
        idx += coords[axis] * stride;
        stride *= dim;
    }
    idx
}
