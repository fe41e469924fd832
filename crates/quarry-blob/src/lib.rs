//! Self-describing binary serialization for blob columns.
//!
//! The wire format carries two protocol headers: `mYm\0` for payloads that
//! stay within the MATLAB-compatible subset (dense numeric arrays, struct
//! and cell arrays) and `dj0\0` when extended kinds appear (native scalars,
//! strings, bytes, sequences, mappings, sets, datetimes, UUIDs, decimals,
//! None). A payload larger than 1000 bytes is wrapped in a
//! `ZL123\0<u64 original_len>` zlib envelope when compression wins.
//!
//! All integers are little-endian. Array element data is column-major.
//! Nested values are length-prefixed and decoding is strictly length-checked:
//! a composite whose nested bytes do not consume exactly the advertised
//! count is rejected as corrupt.

use std::io::{Read, Write};

use byteorder::{ByteOrder, LittleEndian};
use chrono::{NaiveDate, NaiveTime};
use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use uuid::Uuid;

use quarry_core::error::{Error, Result};
use quarry_core::value::{ArrayDtype, NdArray, Value};

const COMPRESS_PREFIX: &[u8] = b"ZL123\0";
const PROTOCOL_MYM: &[u8] = b"mYm\0";
const PROTOCOL_DJ0: &[u8] = b"dj0\0";
const COMPRESS_THRESHOLD: usize = 1000;

// Array element type ids shared with the MATLAB-era format.
const TYPE_LOGICAL: u32 = 3;
const TYPE_CHAR: u32 = 4;
const TYPE_VOID: u32 = 5;
const TYPE_DOUBLE: u32 = 6;
const TYPE_SINGLE: u32 = 7;
const TYPE_INT8: u32 = 8;
const TYPE_UINT8: u32 = 9;
const TYPE_INT16: u32 = 10;
const TYPE_UINT16: u32 = 11;
const TYPE_INT32: u32 = 12;
const TYPE_UINT32: u32 = 13;
const TYPE_INT64: u32 = 14;
const TYPE_UINT64: u32 = 15;

fn dtype_id(dtype: ArrayDtype) -> u32 {
    match dtype {
        ArrayDtype::Bool => TYPE_LOGICAL,
        ArrayDtype::F64 => TYPE_DOUBLE,
        ArrayDtype::F32 => TYPE_SINGLE,
        ArrayDtype::I8 => TYPE_INT8,
        ArrayDtype::U8 => TYPE_UINT8,
        ArrayDtype::I16 => TYPE_INT16,
        ArrayDtype::U16 => TYPE_UINT16,
        ArrayDtype::I32 => TYPE_INT32,
        ArrayDtype::U32 => TYPE_UINT32,
        ArrayDtype::I64 => TYPE_INT64,
        ArrayDtype::U64 => TYPE_UINT64,
    }
}

fn dtype_from_id(id: u32) -> Option<ArrayDtype> {
    Some(match id {
        TYPE_LOGICAL => ArrayDtype::Bool,
        TYPE_DOUBLE => ArrayDtype::F64,
        TYPE_SINGLE => ArrayDtype::F32,
        TYPE_INT8 => ArrayDtype::I8,
        TYPE_UINT8 => ArrayDtype::U8,
        TYPE_INT16 => ArrayDtype::I16,
        TYPE_UINT16 => ArrayDtype::U16,
        TYPE_INT32 => ArrayDtype::I32,
        TYPE_UINT32 => ArrayDtype::U32,
        TYPE_INT64 => ArrayDtype::I64,
        TYPE_UINT64 => ArrayDtype::U64,
        _ => return None,
    })
}

/// Serializes a value into the blob wire format.
pub fn pack(value: &Value) -> Result<Vec<u8>> {
    pack_with_options(value, true)
}

/// Serializes a value, optionally skipping the compression envelope.
pub fn pack_with_options(value: &Value, compress: bool) -> Result<Vec<u8>> {
    let mut packer = Packer { extended: false };
    let payload = packer.pack_value(value)?;
    let protocol: &[u8] = if packer.extended { PROTOCOL_DJ0 } else { PROTOCOL_MYM };
    let mut blob = Vec::with_capacity(protocol.len() + payload.len());
    blob.extend_from_slice(protocol);
    blob.extend_from_slice(&payload);

    if compress && blob.len() > COMPRESS_THRESHOLD {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(&blob)
            .map_err(|e| Error::Serialization(format!("zlib compression failed: {e}")))?;
        let compressed = encoder
            .finish()
            .map_err(|e| Error::Serialization(format!("zlib compression failed: {e}")))?;
        let mut wrapped = Vec::with_capacity(COMPRESS_PREFIX.len() + 8 + compressed.len());
        wrapped.extend_from_slice(COMPRESS_PREFIX);
        wrapped.extend_from_slice(&(blob.len() as u64).to_le_bytes());
        wrapped.extend_from_slice(&compressed);
        if wrapped.len() < blob.len() {
            blob = wrapped;
        }
    }
    Ok(blob)
}

/// Deserializes a blob produced by [`pack`] (or a compatible writer).
pub fn unpack(blob: &[u8]) -> Result<Value> {
    let mut owned;
    let mut data = blob;
    if data.starts_with(COMPRESS_PREFIX) {
        let rest = &data[COMPRESS_PREFIX.len()..];
        if rest.len() < 8 {
            return Err(corrupt("truncated compression header"));
        }
        let original_len = LittleEndian::read_u64(&rest[..8]) as usize;
        let mut decoder = ZlibDecoder::new(&rest[8..]);
        owned = Vec::with_capacity(original_len);
        decoder
            .read_to_end(&mut owned)
            .map_err(|e| Error::Serialization(format!("zlib decompression failed: {e}")))?;
        if owned.len() != original_len {
            return Err(corrupt("decompressed size does not match header"));
        }
        data = &owned;
    }

    let mut reader = Reader { data, pos: 0 };
    let protocol = reader.read_zero_terminated()?;
    if protocol != "mYm" && protocol != "dj0" {
        return Err(Error::Serialization(format!(
            "unrecognized blob protocol \"{protocol}\""
        )));
    }
    let remaining = reader.data.len() - reader.pos;
    reader.read_value_checked(Some(remaining))
}

fn corrupt(detail: &str) -> Error {
    Error::Serialization(format!("invalid blob: {detail}"))
}

// ---------------------------------------------------------------------------
// Packing
// ---------------------------------------------------------------------------

struct Packer {
    /// Set when a non-MATLAB kind forces the dj0 protocol.
    extended: bool,
}

impl Packer {
    fn pack_value(&mut self, value: &Value) -> Result<Vec<u8>> {
        match value {
            // MATLAB-compatible dense arrays keep the compatibility protocol.
            Value::Array(array) => self.pack_array(array),

            Value::Null => {
                self.extended = true;
                Ok(vec![0xff])
            }
            Value::Bool(v) => {
                self.extended = true;
                Ok(vec![0x0b, *v as u8])
            }
            Value::Int(v) => {
                self.extended = true;
                Ok(pack_int(*v))
            }
            Value::Float(v) => {
                self.extended = true;
                let mut out = vec![0x0d];
                out.extend_from_slice(&v.to_le_bytes());
                Ok(out)
            }
            Value::Complex(re, im) => {
                self.extended = true;
                let mut out = vec![0x0c];
                out.extend_from_slice(&re.to_le_bytes());
                out.extend_from_slice(&im.to_le_bytes());
                Ok(out)
            }
            Value::String(s) => {
                self.extended = true;
                let bytes = s.as_bytes();
                let mut out = vec![0x05];
                out.extend_from_slice(&(bytes.len() as u64).to_le_bytes());
                out.extend_from_slice(bytes);
                Ok(out)
            }
            Value::Bytes(b) => {
                self.extended = true;
                let mut out = vec![0x06];
                out.extend_from_slice(&(b.len() as u64).to_le_bytes());
                out.extend_from_slice(b);
                Ok(out)
            }
            Value::Uuid(u) => {
                self.extended = true;
                let mut out = vec![b'u'];
                out.extend_from_slice(u.as_bytes());
                Ok(out)
            }
            Value::Decimal(d) => {
                self.extended = true;
                let s = d.to_string();
                let mut out = vec![b'd'];
                out.extend_from_slice(&(s.len() as u64).to_le_bytes());
                out.extend_from_slice(s.as_bytes());
                Ok(out)
            }
            Value::Date(d) => {
                self.extended = true;
                Ok(pack_datetime(Some(*d), None))
            }
            Value::Time(t) => {
                self.extended = true;
                Ok(pack_datetime(None, Some(*t)))
            }
            Value::DateTime(dt) => {
                self.extended = true;
                Ok(pack_datetime(Some(dt.date()), Some(dt.time())))
            }
            Value::Json(json) => self.pack_value(&json_to_value(json)),
            Value::List(items) => {
                self.extended = true;
                self.pack_sequence(0x02, items)
            }
            Value::Set(items) => {
                self.extended = true;
                self.pack_sequence(0x03, items)
            }
            Value::Map(pairs) => {
                self.extended = true;
                let mut out = vec![0x04];
                out.extend_from_slice(&(pairs.len() as u64).to_le_bytes());
                for (key, val) in pairs {
                    for part in [key, val] {
                        let nested = self.pack_value(part)?;
                        out.extend_from_slice(&(nested.len() as u64).to_le_bytes());
                        out.extend_from_slice(&nested);
                    }
                }
                Ok(out)
            }
        }
    }

    fn pack_sequence(&mut self, tag: u8, items: &[Value]) -> Result<Vec<u8>> {
        let mut out = vec![tag];
        out.extend_from_slice(&(items.len() as u64).to_le_bytes());
        for item in items {
            let nested = self.pack_value(item)?;
            out.extend_from_slice(&(nested.len() as u64).to_le_bytes());
            out.extend_from_slice(&nested);
        }
        Ok(out)
    }

    fn pack_array(&mut self, array: &NdArray) -> Result<Vec<u8>> {
        // 0-dimensional arrays are a dj0 extension.
        if array.shape.is_empty() {
            self.extended = true;
        }
        let mut out = vec![b'A'];
        out.extend_from_slice(&(array.shape.len() as u64).to_le_bytes());
        for dim in &array.shape {
            out.extend_from_slice(&(*dim as u64).to_le_bytes());
        }
        let is_complex = array.imag.is_some();
        out.extend_from_slice(&dtype_id(array.dtype).to_le_bytes());
        out.extend_from_slice(&(is_complex as u32).to_le_bytes());
        out.extend_from_slice(&array.data);
        if let Some(imag) = &array.imag {
            if imag.len() != array.data.len() {
                return Err(Error::Serialization(
                    "complex array real and imaginary parts differ in size".to_string(),
                ));
            }
            out.extend_from_slice(imag);
        }
        Ok(out)
    }
}

fn pack_int(v: i64) -> Vec<u8> {
    // minimal signed little-endian width, one spare bit for the sign
    let magnitude_bits = if v >= 0 {
        64 - v.leading_zeros()
    } else {
        64 - v.unsigned_abs().leading_zeros()
    };
    let n_bytes = (magnitude_bits / 8 + 1) as usize;
    let wide = (v as i128).to_le_bytes();
    let mut out = vec![0x0a];
    out.extend_from_slice(&(n_bytes as u16).to_le_bytes());
    out.extend_from_slice(&wide[..n_bytes]);
    out
}

fn pack_datetime(date: Option<NaiveDate>, time: Option<NaiveTime>) -> Vec<u8> {
    use chrono::{Datelike, Timelike};
    let packed_date: i32 = match date {
        Some(d) => (d.year() * 100 + d.month() as i32) * 100 + d.day() as i32,
        None => -1,
    };
    let packed_time: i64 = match time {
        Some(t) => {
            ((t.hour() as i64 * 100 + t.minute() as i64) * 100 + t.second() as i64) * 1_000_000
                + (t.nanosecond() / 1000) as i64
        }
        None => -1,
    };
    let mut out = vec![b't'];
    out.extend_from_slice(&packed_date.to_le_bytes());
    out.extend_from_slice(&packed_time.to_le_bytes());
    out
}

/// Lowers a JSON document into the blob value model.
fn json_to_value(json: &serde_json::Value) -> Value {
    match json {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::Int(i)
            } else {
                Value::Float(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        serde_json::Value::String(s) => Value::String(s.clone()),
        serde_json::Value::Array(items) => Value::List(items.iter().map(json_to_value).collect()),
        serde_json::Value::Object(map) => Value::Map(
            map.iter()
                .map(|(k, v)| (Value::String(k.clone()), json_to_value(v)))
                .collect(),
        ),
    }
}

// ---------------------------------------------------------------------------
// Unpacking
// ---------------------------------------------------------------------------

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.data.len() {
            return Err(corrupt("unexpected end of data"));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn read_u16(&mut self) -> Result<u16> {
        Ok(LittleEndian::read_u16(self.take(2)?))
    }

    fn read_u32(&mut self) -> Result<u32> {
        Ok(LittleEndian::read_u32(self.take(4)?))
    }

    fn read_u64(&mut self) -> Result<u64> {
        Ok(LittleEndian::read_u64(self.take(8)?))
    }

    fn read_i32(&mut self) -> Result<i32> {
        Ok(LittleEndian::read_i32(self.take(4)?))
    }

    fn read_i64(&mut self) -> Result<i64> {
        Ok(LittleEndian::read_i64(self.take(8)?))
    }

    fn read_f64(&mut self) -> Result<f64> {
        Ok(LittleEndian::read_f64(self.take(8)?))
    }

    fn read_len(&mut self) -> Result<usize> {
        let len = self.read_u64()?;
        usize::try_from(len).map_err(|_| corrupt("length overflows the platform"))
    }

    fn read_zero_terminated(&mut self) -> Result<String> {
        let start = self.pos;
        let end = self.data[start..]
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| corrupt("missing string terminator"))?;
        let s = std::str::from_utf8(&self.data[start..start + end])
            .map_err(|_| corrupt("non-UTF-8 field name"))?
            .to_string();
        self.pos = start + end + 1;
        Ok(s)
    }

    /// Reads one value; with `n_bytes` the consumed size is verified against
    /// the advertised nested length.
    fn read_value_checked(&mut self, n_bytes: Option<usize>) -> Result<Value> {
        let start = self.pos;
        let value = self.read_value()?;
        if let Some(expected) = n_bytes {
            if self.pos - start != expected {
                return Err(corrupt("blob length check failed"));
            }
        }
        Ok(value)
    }

    fn read_value(&mut self) -> Result<Value> {
        let tag = self.read_u8()?;
        match tag {
            b'A' => self.read_array(),
            b'P' => Err(Error::Serialization(
                "sparse arrays are not supported".to_string(),
            )),
            b'S' => self.read_struct(),
            b'C' => self.read_cell(),
            b'F' => self.read_recarray(),
            0xff => Ok(Value::Null),
            0x01 | 0x02 => self.read_sequence().map(Value::List),
            0x03 => self.read_sequence().map(Value::Set),
            0x04 => self.read_map(),
            0x05 => {
                let len = self.read_len()?;
                let bytes = self.take(len)?;
                String::from_utf8(bytes.to_vec())
                    .map(Value::String)
                    .map_err(|_| corrupt("non-UTF-8 string"))
            }
            0x06 => {
                let len = self.read_len()?;
                Ok(Value::Bytes(self.take(len)?.to_vec()))
            }
            0x0a => self.read_int(),
            0x0b => Ok(Value::Bool(self.read_u8()? != 0)),
            0x0c => {
                let re = self.read_f64()?;
                let im = self.read_f64()?;
                Ok(Value::Complex(re, im))
            }
            0x0d => Ok(Value::Float(self.read_f64()?)),
            b'd' => {
                let len = self.read_len()?;
                let s = std::str::from_utf8(self.take(len)?)
                    .map_err(|_| corrupt("non-UTF-8 decimal"))?;
                s.parse()
                    .map(Value::Decimal)
                    .map_err(|_| corrupt("malformed decimal"))
            }
            b't' => self.read_datetime(),
            b'u' => {
                let bytes: [u8; 16] = self.take(16)?.try_into().expect("16 bytes");
                Ok(Value::Uuid(Uuid::from_bytes(bytes)))
            }
            other => Err(Error::Serialization(format!(
                "unknown data structure code 0x{other:02x}; upgrade quarry to read this blob"
            ))),
        }
    }

    fn read_shape(&mut self) -> Result<Vec<usize>> {
        let ndim = self.read_len()?;
        if ndim > 32 {
            return Err(corrupt("implausible array dimensionality"));
        }
        (0..ndim).map(|_| self.read_len()).collect()
    }

    fn read_array(&mut self) -> Result<Value> {
        let shape = self.read_shape()?;
        let n_elem: usize = shape.iter().product();
        let type_id = self.read_u32()?;
        let is_complex = self.read_u32()? != 0;

        if type_id == TYPE_VOID {
            // object array: elements are nested length-prefixed blobs
            let mut items = Vec::with_capacity(n_elem);
            for _ in 0..n_elem {
                let len = self.read_len()?;
                items.push(self.read_value_checked(Some(len))?);
            }
            return Ok(Value::List(items));
        }
        if type_id == TYPE_CHAR {
            // 16-bit codepoints for MATLAB compatibility
            let bytes = self.take(2 * n_elem)?;
            let text: String = bytes
                .chunks_exact(2)
                .map(LittleEndian::read_u16)
                .map(|c| char::from_u32(c as u32).unwrap_or('\u{fffd}'))
                .collect();
            return Ok(Value::String(text));
        }

        let dtype = dtype_from_id(type_id)
            .ok_or_else(|| Error::Serialization(format!("unknown array dtype id {type_id}")))?;
        let data = self.take(n_elem * dtype.item_size())?.to_vec();
        let mut array = NdArray::new(dtype, shape, data)?;
        if is_complex {
            array.imag = Some(self.take(n_elem * dtype.item_size())?.to_vec());
        }
        Ok(Value::Array(array))
    }

    fn read_struct(&mut self) -> Result<Value> {
        let shape = self.read_shape()?;
        let n_elem: usize = shape.iter().product();
        let n_fields = self.read_u32()? as usize;
        if n_fields == 0 {
            return Ok(Value::Null);
        }
        let names: Vec<String> = (0..n_fields)
            .map(|_| self.read_zero_terminated())
            .collect::<Result<_>>()?;
        let mut records = Vec::with_capacity(n_elem);
        for _ in 0..n_elem {
            let mut fields = Vec::with_capacity(n_fields);
            for name in &names {
                let len = self.read_len()?;
                let value = self.read_value_checked(Some(len))?;
                fields.push((Value::String(name.clone()), value));
            }
            records.push(Value::Map(fields));
        }
        if records.len() == 1 {
            return Ok(records.pop().expect("one record"));
        }
        Ok(Value::List(records))
    }

    fn read_recarray(&mut self) -> Result<Value> {
        let n_fields = self.read_u32()? as usize;
        if n_fields == 0 {
            return Ok(Value::Null);
        }
        let names: Vec<String> = (0..n_fields)
            .map(|_| self.read_zero_terminated())
            .collect::<Result<_>>()?;
        let mut fields = Vec::with_capacity(n_fields);
        for name in names {
            let value = self.read_value()?;
            fields.push((Value::String(name), value));
        }
        Ok(Value::Map(fields))
    }

    fn read_cell(&mut self) -> Result<Value> {
        let shape = self.read_shape()?;
        let n_elem: usize = shape.iter().product();
        let mut items = Vec::with_capacity(n_elem);
        for _ in 0..n_elem {
            let len = self.read_len()?;
            items.push(self.read_value_checked(Some(len))?);
        }
        Ok(Value::List(items))
    }

    fn read_sequence(&mut self) -> Result<Vec<Value>> {
        let count = self.read_len()?;
        let mut items = Vec::with_capacity(count.min(1 << 20));
        for _ in 0..count {
            let len = self.read_len()?;
            items.push(self.read_value_checked(Some(len))?);
        }
        Ok(items)
    }

    fn read_map(&mut self) -> Result<Value> {
        let count = self.read_len()?;
        let mut pairs = Vec::with_capacity(count.min(1 << 20));
        for _ in 0..count {
            let key_len = self.read_len()?;
            let key = self.read_value_checked(Some(key_len))?;
            let val_len = self.read_len()?;
            let val = self.read_value_checked(Some(val_len))?;
            pairs.push((key, val));
        }
        Ok(Value::Map(pairs))
    }

    fn read_int(&mut self) -> Result<Value> {
        let n_bytes = self.read_u16()? as usize;
        let bytes = self.take(n_bytes)?;
        if n_bytes == 0 {
            return Ok(Value::Int(0));
        }
        let negative = bytes[n_bytes - 1] & 0x80 != 0;
        let mut wide = if negative { [0xffu8; 16] } else { [0u8; 16] };
        if n_bytes > 16 {
            return Err(Error::Serialization(
                "integer too large for this implementation".to_string(),
            ));
        }
        wide[..n_bytes].copy_from_slice(bytes);
        let value = i128::from_le_bytes(wide);
        i64::try_from(value)
            .map(Value::Int)
            .map_err(|_| Error::Serialization("integer does not fit in 64 bits".to_string()))
    }

    fn read_datetime(&mut self) -> Result<Value> {
        let packed_date = self.read_i32()?;
        let packed_time = self.read_i64()?;
        let date = if packed_date >= 0 {
            Some(
                NaiveDate::from_ymd_opt(
                    packed_date / 10000,
                    ((packed_date / 100) % 100) as u32,
                    (packed_date % 100) as u32,
                )
                .ok_or_else(|| corrupt("invalid packed date"))?,
            )
        } else {
            None
        };
        let time = if packed_time >= 0 {
            Some(
                NaiveTime::from_hms_micro_opt(
                    ((packed_time / 10_000_000_000) % 100) as u32,
                    ((packed_time / 100_000_000) % 100) as u32,
                    ((packed_time / 1_000_000) % 100) as u32,
                    (packed_time % 1_000_000) as u32,
                )
                .ok_or_else(|| corrupt("invalid packed time"))?,
            )
        } else {
            None
        };
        Ok(match (date, time) {
            (Some(d), Some(t)) => Value::DateTime(d.and_time(t)),
            (Some(d), None) => Value::Date(d),
            (None, Some(t)) => Value::Time(t),
            (None, None) => Value::Null,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bigdecimal::BigDecimal;
    use std::str::FromStr;

    fn roundtrip(value: Value) -> Value {
        let packed = pack(&value).expect("pack");
        unpack(&packed).expect("unpack")
    }

    #[test]
    fn scalars_roundtrip() {
        for value in [
            Value::Null,
            Value::Bool(true),
            Value::Bool(false),
            Value::Int(0),
            Value::Int(-1),
            Value::Int(i64::MAX),
            Value::Int(i64::MIN),
            Value::Float(3.25),
            Value::Complex(1.5, -2.5),
            Value::String("naïve μstring".to_string()),
            Value::Bytes(vec![0, 1, 2, 255]),
            Value::Uuid(Uuid::from_u128(0x0123_4567_89ab_cdef_0123_4567_89ab_cdef)),
            Value::Decimal(BigDecimal::from_str("0.1").unwrap()),
        ] {
            assert_eq!(roundtrip(value.clone()), value);
        }
    }

    #[test]
    fn datetimes_roundtrip() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 15).unwrap();
        let time = NaiveTime::from_hms_micro_opt(12, 34, 56, 789_012).unwrap();
        assert_eq!(roundtrip(Value::Date(date)), Value::Date(date));
        assert_eq!(roundtrip(Value::Time(time)), Value::Time(time));
        assert_eq!(
            roundtrip(Value::DateTime(date.and_time(time))),
            Value::DateTime(date.and_time(time))
        );
    }

    #[test]
    fn collections_roundtrip() {
        let value = Value::Map(vec![
            (
                Value::String("a".into()),
                Value::List(vec![Value::Int(1), Value::Int(2), Value::Int(3)]),
            ),
            (Value::String("b".into()), Value::Uuid(Uuid::from_u128(42))),
            (
                Value::String("c".into()),
                Value::Decimal(BigDecimal::from_str("0.1").unwrap()),
            ),
        ]);
        assert_eq!(roundtrip(value.clone()), value);

        let set = Value::Set(vec![Value::Int(1), Value::Int(2), Value::Int(3)]);
        assert_eq!(roundtrip(set.clone()), set);
    }

    #[test]
    fn arrays_roundtrip() {
        let values: Vec<f64> = (0..12).map(|i| i as f64).collect();
        let array = NdArray::from_f64(&[3, 4], &values).unwrap();
        assert_eq!(roundtrip(Value::Array(array.clone())), Value::Array(array));
    }

    #[test]
    fn plain_array_uses_compat_protocol() {
        let array = NdArray::from_f64(&[2, 2], &[1.0, 2.0, 3.0, 4.0]).unwrap();
        let packed = pack(&Value::Array(array)).unwrap();
        assert!(packed.starts_with(b"mYm\0"));

        let packed = pack(&Value::Int(5)).unwrap();
        assert!(packed.starts_with(b"dj0\0"));
    }

    #[test]
    fn large_blobs_compress() {
        let value = Value::Bytes(vec![7u8; 100_000]);
        let packed = pack(&value).unwrap();
        assert!(packed.starts_with(b"ZL123\0"));
        assert!(packed.len() < 10_000);
        assert_eq!(unpack(&packed).unwrap(), value);
    }

    #[test]
    fn incompressible_blobs_stay_raw() {
        // pseudo-random bytes gain nothing from zlib
        let mut state = 0x2545f491_4f6cdd1du64;
        let noise: Vec<u8> = (0..5000)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                (state & 0xff) as u8
            })
            .collect();
        let packed = pack(&Value::Bytes(noise)).unwrap();
        assert!(packed.starts_with(b"dj0\0"));
    }

    #[test]
    fn unknown_tag_is_fatal() {
        let mut blob = b"dj0\0".to_vec();
        blob.push(b'Z');
        let err = unpack(&blob).unwrap_err();
        assert!(err.to_string().contains("unknown data structure code"));
    }

    #[test]
    fn truncated_nested_length_is_fatal() {
        // a list advertising a wrong nested length must be rejected
        let mut blob = b"dj0\0".to_vec();
        blob.push(0x02);
        blob.extend_from_slice(&1u64.to_le_bytes()); // one element
        blob.extend_from_slice(&5u64.to_le_bytes()); // claims 5 bytes
        blob.push(0x0b); // bool is 2 bytes total
        blob.push(1);
        assert!(unpack(&blob).is_err());
    }

    #[test]
    fn json_documents_pack_as_structures() {
        let json: serde_json::Value =
            serde_json::from_str(r#"{"x": 1, "y": [true, null], "z": "s"}"#).unwrap();
        let unpacked = roundtrip(Value::Json(json));
        match unpacked {
            Value::Map(pairs) => {
                assert_eq!(pairs.len(), 3);
                assert_eq!(pairs[0].0, Value::String("x".into()));
                assert_eq!(pairs[0].1, Value::Int(1));
            }
            other => panic!("expected map, got {other:?}"),
        }
    }

    // -- wire compatibility with payloads written by other implementations --

    fn push_u64(out: &mut Vec<u8>, v: u64) {
        out.extend_from_slice(&v.to_le_bytes());
    }

    fn nested(out: &mut Vec<u8>, payload: &[u8]) {
        push_u64(out, payload.len() as u64);
        out.extend_from_slice(payload);
    }

    #[test]
    fn decodes_foreign_char_arrays_as_strings() {
        // 'A' array with the 16-bit CHAR element type
        let mut blob = b"mYm\0A".to_vec();
        push_u64(&mut blob, 2); // ndim
        push_u64(&mut blob, 1);
        push_u64(&mut blob, 3); // shape 1x3
        blob.extend_from_slice(&TYPE_CHAR.to_le_bytes());
        blob.extend_from_slice(&0u32.to_le_bytes()); // not complex
        for c in [b'a', b'b', b'c'] {
            blob.extend_from_slice(&(c as u16).to_le_bytes());
        }
        assert_eq!(unpack(&blob).unwrap(), Value::String("abc".into()));
    }

    #[test]
    fn decodes_foreign_struct_arrays_as_maps() {
        // 'S' struct with one element and two fields
        let mut blob = b"mYm\0S".to_vec();
        push_u64(&mut blob, 2); // ndim
        push_u64(&mut blob, 1);
        push_u64(&mut blob, 1); // shape 1x1
        blob.extend_from_slice(&2u32.to_le_bytes()); // two fields
        blob.extend_from_slice(b"alpha\0beta\0");
        let mut alpha = vec![0x0a];
        alpha.extend_from_slice(&1u16.to_le_bytes());
        alpha.push(7);
        nested(&mut blob, &alpha);
        nested(&mut blob, &[0x0b, 1]);

        let value = unpack(&blob).unwrap();
        assert_eq!(
            value,
            Value::Map(vec![
                (Value::String("alpha".into()), Value::Int(7)),
                (Value::String("beta".into()), Value::Bool(true)),
            ])
        );
    }

    #[test]
    fn decodes_foreign_cell_arrays_as_lists() {
        // 'C' cell with two ragged elements
        let mut blob = b"mYm\0C".to_vec();
        push_u64(&mut blob, 2); // ndim
        push_u64(&mut blob, 1);
        push_u64(&mut blob, 2); // shape 1x2
        let mut first = vec![0x0d];
        first.extend_from_slice(&1.5f64.to_le_bytes());
        nested(&mut blob, &first);
        let second = vec![0xff];
        nested(&mut blob, &second);

        assert_eq!(
            unpack(&blob).unwrap(),
            Value::List(vec![Value::Float(1.5), Value::Null])
        );
    }

    #[test]
    fn decodes_foreign_recarrays_as_field_maps() {
        // 'F' recarray: field names then unprefixed nested blobs
        let mut blob = b"mYm\0F".to_vec();
        blob.extend_from_slice(&1u32.to_le_bytes());
        blob.extend_from_slice(b"trace\0");
        let array = NdArray::from_f64(&[2], &[1.0, 2.0]).unwrap();
        blob.extend_from_slice(&pack_with_options(&Value::Array(array.clone()), false).unwrap()[4..]);

        let value = unpack(&blob).unwrap();
        assert_eq!(
            value,
            Value::Map(vec![(Value::String("trace".into()), Value::Array(array))])
        );
    }

    #[test]
    fn empty_struct_and_recarray_decode_to_null() {
        let mut blob = b"mYm\0F".to_vec();
        blob.extend_from_slice(&0u32.to_le_bytes());
        assert_eq!(unpack(&blob).unwrap(), Value::Null);
    }

    #[test]
    fn minimal_int_widths() {
        assert_eq!(pack_int(0).len(), 1 + 2 + 1);
        assert_eq!(pack_int(127).len(), 1 + 2 + 1);
        assert_eq!(pack_int(128).len(), 1 + 2 + 2);
        assert_eq!(pack_int(-128).len(), 1 + 2 + 2);
        assert_eq!(pack_int(i64::MIN).len(), 1 + 2 + 9);
    }
}
