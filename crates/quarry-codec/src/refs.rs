//! Lazy handles for schema-addressed objects and the `.npy` wire format.

use quarry_core::error::{Error, Result};
use quarry_core::value::{ArrayDtype, NdArray, Value};
use quarry_store::path::ObjectMetadata;
use quarry_store::{StoreHandle, StoreRegistry};

/// A handle to a schema-addressed object, opened from the metadata a fetch
/// returns. No I/O happens until a read method is called.
pub struct ObjectRef {
    pub metadata: ObjectMetadata,
    store: StoreHandle,
}

impl ObjectRef {
    /// Opens a handle from a fetched metadata value.
    pub fn from_value(value: &Value, stores: &StoreRegistry) -> Result<Self> {
        let json = match value {
            Value::Json(json) => json.clone(),
            Value::String(text) => serde_json::from_str(text)?,
            other => {
                return Err(Error::Serialization(format!(
                    "expected object metadata, got {}",
                    other.type_name()
                )));
            }
        };
        let metadata: ObjectMetadata = serde_json::from_value(json)?;
        let store = stores.open(metadata.store.as_deref())?;
        Ok(ObjectRef { metadata, store })
    }

    /// Total size in bytes (sum of the manifest for directories).
    pub fn size(&self) -> u64 {
        self.metadata.size
    }

    /// Reads a single-file object fully.
    pub fn read(&self) -> Result<Vec<u8>> {
        if self.metadata.is_dir {
            return Err(Error::invalid(
                "object is a directory; read its items individually",
            ));
        }
        self.store.get_buffer(&self.metadata.path)
    }

    /// Reads one file of a directory object by its manifest path.
    pub fn read_item(&self, item: &str) -> Result<Vec<u8>> {
        self.store
            .get_buffer(&format!("{}/{item}", self.metadata.path))
    }

    /// Downloads the object (or directory) under a local directory,
    /// returning the local root path.
    pub fn download(&self, dir: &std::path::Path) -> Result<std::path::PathBuf> {
        let name = self
            .metadata
            .path
            .rsplit('/')
            .next()
            .unwrap_or("object")
            .to_string();
        let target = dir.join(name);
        if self.metadata.is_dir {
            for (item, _size) in &self.metadata.items {
                let data = self.read_item(item)?;
                let local = target.join(item);
                if let Some(parent) = local.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(local, data)?;
            }
        } else {
            self.store.get_file(&self.metadata.path, &target)?;
        }
        Ok(target)
    }
}

/// A lazy reference to a stored `.npy` array: shape, dtype, and byte count
/// come from metadata; the element data loads on demand.
pub struct NpyRef {
    object: ObjectRef,
}

impl NpyRef {
    pub fn from_value(value: &Value, stores: &StoreRegistry) -> Result<Self> {
        Ok(NpyRef {
            object: ObjectRef::from_value(value, stores)?,
        })
    }

    /// Array shape without touching storage.
    pub fn shape(&self) -> Vec<usize> {
        self.object
            .metadata
            .extra
            .get("shape")
            .and_then(|s| s.as_array())
            .map(|dims| {
                dims.iter()
                    .filter_map(|d| d.as_u64())
                    .map(|d| d as usize)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// NumPy descr string (`"<f8"` and friends) without touching storage.
    pub fn dtype(&self) -> Option<String> {
        self.object
            .metadata
            .extra
            .get("dtype")
            .and_then(|d| d.as_str())
            .map(str::to_string)
    }

    /// Payload size in bytes without touching storage.
    pub fn nbytes(&self) -> u64 {
        self.object
            .metadata
            .extra
            .get("nbytes")
            .and_then(|n| n.as_u64())
            .unwrap_or(self.object.metadata.size)
    }

    /// Loads the full array.
    pub fn load(&self) -> Result<NdArray> {
        parse_npy(&self.object.read()?)
    }
}

// ---------------------------------------------------------------------------
// npy format
// ---------------------------------------------------------------------------

const NPY_MAGIC: &[u8] = b"\x93NUMPY\x01\x00";

/// NumPy descr string for an element type.
pub fn npy_descr(dtype: ArrayDtype) -> &'static str {
    match dtype {
        ArrayDtype::Bool => "|b1",
        ArrayDtype::I8 => "|i1",
        ArrayDtype::U8 => "|u1",
        ArrayDtype::I16 => "<i2",
        ArrayDtype::U16 => "<u2",
        ArrayDtype::I32 => "<i4",
        ArrayDtype::U32 => "<u4",
        ArrayDtype::I64 => "<i8",
        ArrayDtype::U64 => "<u8",
        ArrayDtype::F32 => "<f4",
        ArrayDtype::F64 => "<f8",
    }
}

fn descr_to_dtype(descr: &str) -> Option<ArrayDtype> {
    Some(match descr {
        "|b1" => ArrayDtype::Bool,
        "|i1" => ArrayDtype::I8,
        "|u1" => ArrayDtype::U8,
        "<i2" => ArrayDtype::I16,
        "<u2" => ArrayDtype::U16,
        "<i4" => ArrayDtype::I32,
        "<u4" => ArrayDtype::U32,
        "<i8" => ArrayDtype::I64,
        "<u8" => ArrayDtype::U64,
        "<f4" => ArrayDtype::F32,
        "<f8" => ArrayDtype::F64,
        _ => return None,
    })
}

/// Serializes an array in NumPy `.npy` v1.0 format. Element data is written
/// as-is with `fortran_order: True`, matching the array's column-major
/// layout.
pub fn npy_bytes(array: &NdArray) -> Result<Vec<u8>> {
    if array.imag.is_some() {
        return Err(Error::validation(
            "complex arrays are not supported by the npy codec".to_string(),
        ));
    }
    let shape = match array.shape.len() {
        0 => "()".to_string(),
        1 => format!("({},)", array.shape[0]),
        _ => format!(
            "({})",
            array
                .shape
                .iter()
                .map(usize::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        ),
    };
    let mut header = format!(
        "{{'descr': '{}', 'fortran_order': True, 'shape': {shape}, }}",
        npy_descr(array.dtype)
    );
    // pad with spaces so that magic + length + header is 64-aligned
    let unpadded = NPY_MAGIC.len() + 2 + header.len() + 1;
    header.push_str(&" ".repeat(unpadded.div_ceil(64) * 64 - unpadded));
    header.push('\n');

    let mut out = Vec::with_capacity(NPY_MAGIC.len() + 2 + header.len() + array.data.len());
    out.extend_from_slice(NPY_MAGIC);
    out.extend_from_slice(&(header.len() as u16).to_le_bytes());
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(&array.data);
    Ok(out)
}

/// Parses a `.npy` v1.x payload back into an array.
pub fn parse_npy(data: &[u8]) -> Result<NdArray> {
    let corrupt = |d: &str| Error::Serialization(format!("invalid npy payload: {d}"));
    if data.len() < 10 || &data[..6] != &NPY_MAGIC[..6] {
        return Err(corrupt("bad magic"));
    }
    let header_len = u16::from_le_bytes([data[8], data[9]]) as usize;
    let header_end = 10 + header_len;
    if data.len() < header_end {
        return Err(corrupt("truncated header"));
    }
    let header =
        std::str::from_utf8(&data[10..header_end]).map_err(|_| corrupt("non-UTF-8 header"))?;

    let descr = extract_field(header, "'descr':")
        .ok_or_else(|| corrupt("missing descr"))?
        .trim_matches(['\'', ' '])
        .to_string();
    let dtype = descr_to_dtype(&descr)
        .ok_or_else(|| Error::Serialization(format!("unsupported npy dtype {descr}")))?;
    let fortran = extract_field(header, "'fortran_order':")
        .ok_or_else(|| corrupt("missing fortran_order"))?
        .trim()
        .starts_with("True");
    let shape_text = header
        .split("'shape':")
        .nth(1)
        .and_then(|rest| rest.split('(').nth(1))
        .and_then(|rest| rest.split(')').next())
        .ok_or_else(|| corrupt("missing shape"))?;
    let shape: Vec<usize> = shape_text
        .split(',')
        .filter_map(|d| d.trim().parse().ok())
        .collect();

    let n: usize = shape.iter().product();
    let payload = &data[header_end..];
    if payload.len() != n * dtype.item_size() {
        return Err(corrupt("payload size does not match shape"));
    }
    if fortran {
        NdArray::new(dtype, shape, payload.to_vec())
    } else {
        // transpose row-major payloads into the column-major layout
        let item = dtype.item_size();
        let mut column_major = vec![0u8; payload.len()];
        for row_idx in 0..n {
            let col_idx = transpose_index(row_idx, &shape);
            column_major[col_idx * item..(col_idx + 1) * item]
                .copy_from_slice(&payload[row_idx * item..(row_idx + 1) * item]);
        }
        NdArray::new(dtype, shape, column_major)
    }
}

fn extract_field<'a>(header: &'a str, key: &str) -> Option<&'a str> {
    header
        .split(key)
        .nth(1)
        .and_then(|rest| rest.split(',').next())
}

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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn npy_roundtrip() {
        let array = NdArray::from_f64(&[2, 3], &[0., 1., 2., 3., 4., 5.]).unwrap();
        let bytes = npy_bytes(&array).unwrap();
        assert_eq!(&bytes[..6], &NPY_MAGIC[..6]);
        // total header block is 64-aligned
        let header_len = u16::from_le_bytes([bytes[8], bytes[9]]) as usize;
        assert_eq!((10 + header_len) % 64, 0);
        let parsed = parse_npy(&bytes).unwrap();
        assert_eq!(parsed, array);
    }

    #[test]
    fn npy_one_dimensional_shape_syntax() {
        let array = NdArray::from_f64(&[4], &[9., 8., 7., 6.]).unwrap();
        let bytes = npy_bytes(&array).unwrap();
        let header_len = u16::from_le_bytes([bytes[8], bytes[9]]) as usize;
        let header = std::str::from_utf8(&bytes[10..10 + header_len]).unwrap();
        assert!(header.contains("(4,)"));
        assert_eq!(parse_npy(&bytes).unwrap(), array);
    }

    #[test]
    fn npy_rejects_corrupt_payloads() {
        assert!(parse_npy(b"not npy").is_err());
        let array = NdArray::from_f64(&[2], &[1., 2.]).unwrap();
        let mut bytes = npy_bytes(&array).unwrap();
        bytes.truncate(bytes.len() - 4);
        assert!(parse_npy(&bytes).is_err());
    }
}
