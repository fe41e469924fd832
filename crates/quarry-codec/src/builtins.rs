//! The built-in codecs: `blob`, `hash`, `attach`, `filepath`, `object`,
//! and `npy`.

use std::path::Path;
use std::sync::Arc;

use quarry_core::error::{Error, Result};
use quarry_core::value::Value;
use quarry_store::hash::{HashMetadata, HashRegistry};
use quarry_store::path::{build_object_path, ObjectMetadata};
use quarry_store::{check_reserved_prefix, StoreHandle};

use crate::refs::{npy_bytes, npy_descr};
use crate::{Codec, CodecContext};

/// All built-in codecs, for registry seeding.
pub fn all() -> Vec<Arc<dyn Codec>> {
    vec![
        Arc::new(BlobCodec),
        Arc::new(HashCodec),
        Arc::new(AttachCodec),
        Arc::new(FilepathCodec),
        Arc::new(ObjectCodec),
        Arc::new(NpyCodec),
    ]
}

fn open_store(ctx: &CodecContext<'_>) -> Result<(StoreHandle, Option<String>)> {
    let resolved = ctx.stores.resolve_name(ctx.store_name)?;
    let handle = ctx.stores.open(Some(&resolved))?;
    Ok((handle, Some(resolved)))
}

fn hash_registry<'a>(
    ctx: &CodecContext<'_>,
    store: &'a dyn quarry_store::ObjectStore,
    store_name: Option<String>,
) -> Result<HashRegistry<'a>> {
    let spec = ctx.stores.spec(ctx.store_name)?;
    Ok(HashRegistry {
        store,
        store_name,
        subfolding: spec.subfolding,
    })
}

fn metadata_from_value<T: serde::de::DeserializeOwned>(stored: Value) -> Result<T> {
    let json = match stored {
        Value::Json(json) => json,
        Value::String(text) => serde_json::from_str(&text)?,
        other => {
            return Err(Error::Serialization(format!(
                "expected stored metadata, got {}",
                other.type_name()
            )));
        }
    };
    Ok(serde_json::from_value(json)?)
}

fn metadata_to_value<T: serde::Serialize>(metadata: &T) -> Result<Value> {
    Ok(Value::Json(serde_json::to_value(metadata)?))
}

// ---------------------------------------------------------------------------
// blob
// ---------------------------------------------------------------------------

/// Serializes any supported value through the binary blob format. In-table
/// it lands in a `bytes` column; with a store it chains through `<hash>`.
pub struct BlobCodec;

impl Codec for BlobCodec {
    fn name(&self) -> &str {
        "blob"
    }

    fn dtype(&self, is_external: bool) -> Result<String> {
        Ok(if is_external { "<hash>" } else { "bytes" }.to_string())
    }

    fn encode(&self, value: Value, _ctx: &CodecContext<'_>) -> Result<Value> {
        Ok(Value::Bytes(quarry_blob::pack(&value)?))
    }

    fn decode(&self, stored: Value, _ctx: &CodecContext<'_>) -> Result<Value> {
        quarry_blob::unpack(&stored.into_bytes()?)
    }
}

// ---------------------------------------------------------------------------
// hash
// ---------------------------------------------------------------------------

/// Hash-addressed external storage of raw bytes; the column stores the
/// metadata JSON.
pub struct HashCodec;

impl Codec for HashCodec {
    fn name(&self) -> &str {
        "hash"
    }

    fn dtype(&self, is_external: bool) -> Result<String> {
        if !is_external {
            return Err(Error::declaration(
                "<hash> is store-only; declare it as <hash@store>".to_string(),
            ));
        }
        Ok("json".to_string())
    }

    fn validate(&self, value: &Value) -> Result<()> {
        match value {
            Value::Bytes(_) => Ok(()),
            other => Err(Error::validation(format!(
                "<hash> stores bytes, got {}",
                other.type_name()
            ))),
        }
    }

    fn encode(&self, value: Value, ctx: &CodecContext<'_>) -> Result<Value> {
        let data = value.into_bytes()?;
        let (store, store_name) = open_store(ctx)?;
        let registry = hash_registry(ctx, store.as_ref(), store_name)?;
        let metadata = registry.put(&data, ctx.schema)?;
        metadata_to_value(&metadata)
    }

    fn decode(&self, stored: Value, ctx: &CodecContext<'_>) -> Result<Value> {
        let metadata: HashMetadata = metadata_from_value(stored)?;
        let store = ctx.stores.open(metadata.store.as_deref())?;
        let registry = HashRegistry {
            store: store.as_ref(),
            store_name: metadata.store.clone(),
            subfolding: None, // reads use the pinned path
        };
        Ok(Value::Bytes(registry.get(&metadata)?))
    }
}

// ---------------------------------------------------------------------------
// attach
// ---------------------------------------------------------------------------

/// File attachments: the value is a local file path; the stored form is
/// `filename NUL contents`, in-table or through `<hash>`.
pub struct AttachCodec;

impl Codec for AttachCodec {
    fn name(&self) -> &str {
        "attach"
    }

    fn dtype(&self, is_external: bool) -> Result<String> {
        Ok(if is_external { "<hash>" } else { "bytes" }.to_string())
    }

    fn validate(&self, value: &Value) -> Result<()> {
        match value {
            Value::String(path) if Path::new(path).is_file() => Ok(()),
            Value::String(path) => Err(Error::validation(format!(
                "attachment source {path} is not a readable file"
            ))),
            other => Err(Error::validation(format!(
                "<attach> takes a file path, got {}",
                other.type_name()
            ))),
        }
    }

    fn encode(&self, value: Value, _ctx: &CodecContext<'_>) -> Result<Value> {
        let path = value.into_string()?;
        let path = Path::new(&path);
        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::validation(format!("bad attachment name: {}", path.display())))?;
        let contents = std::fs::read(path)?;
        let mut payload = filename.as_bytes().to_vec();
        payload.push(0);
        payload.extend_from_slice(&contents);
        Ok(Value::Bytes(payload))
    }

    fn decode(&self, stored: Value, ctx: &CodecContext<'_>) -> Result<Value> {
        let payload = stored.into_bytes()?;
        let nul = payload
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| Error::Serialization("malformed attachment payload".to_string()))?;
        let filename = std::str::from_utf8(&payload[..nul])
            .map_err(|_| Error::Serialization("non-UTF-8 attachment name".to_string()))?;
        let contents = &payload[nul + 1..];

        std::fs::create_dir_all(ctx.download_path)?;
        let target = unique_download_path(ctx.download_path, filename, contents)?;
        if !target.exists() {
            std::fs::write(&target, contents)?;
        }
        Ok(Value::String(target.display().to_string()))
    }
}

/// Picks the download target for an attachment: reuse a same-named file
/// with identical contents, otherwise suffix the stem until free.
fn unique_download_path(
    dir: &Path,
    filename: &str,
    contents: &[u8],
) -> Result<std::path::PathBuf> {
    let candidate = dir.join(filename);
    if !candidate.exists() || std::fs::read(&candidate)? == contents {
        return Ok(candidate);
    }
    let (stem, ext) = match filename.rsplit_once('.') {
        Some((stem, ext)) => (stem.to_string(), format!(".{ext}")),
        None => (filename.to_string(), String::new()),
    };
    for i in 1.. {
        let candidate = dir.join(format!("{stem}_{i:04}{ext}"));
        if !candidate.exists() || std::fs::read(&candidate)? == contents {
            return Ok(candidate);
        }
    }
    unreachable!("suffix search is unbounded")
}

// ---------------------------------------------------------------------------
// filepath
// ---------------------------------------------------------------------------

/// A reference to a file the user already placed in the store; nothing is
/// copied. Reserved prefixes are rejected and existence is verified on
/// insert.
pub struct FilepathCodec;

impl Codec for FilepathCodec {
    fn name(&self) -> &str {
        "filepath"
    }

    fn dtype(&self, is_external: bool) -> Result<String> {
        if !is_external {
            return Err(Error::declaration(
                "<filepath> is store-only; declare it as <filepath@store>".to_string(),
            ));
        }
        Ok("json".to_string())
    }

    fn validate(&self, value: &Value) -> Result<()> {
        match value {
            Value::String(path) => check_reserved_prefix(path),
            other => Err(Error::validation(format!(
                "<filepath> takes a store path, got {}",
                other.type_name()
            ))),
        }
    }

    fn encode(&self, value: Value, ctx: &CodecContext<'_>) -> Result<Value> {
        let path = value.into_string()?;
        check_reserved_prefix(&path)?;
        let (store, store_name) = open_store(ctx)?;
        if !store.exists(&path)? {
            return Err(Error::MissingExternalFile(path));
        }
        let metadata = quarry_store::StoredReference {
            size: store.size(&path)?,
            path,
            store: store_name,
        };
        metadata_to_value(&metadata)
    }

    fn decode(&self, stored: Value, _ctx: &CodecContext<'_>) -> Result<Value> {
        let metadata: quarry_store::StoredReference = metadata_from_value(stored)?;
        Ok(Value::String(metadata.path))
    }
}

// ---------------------------------------------------------------------------
// object
// ---------------------------------------------------------------------------

/// Schema-addressed storage of bytes, a file, or a whole directory. The
/// value is raw bytes or a local path; decode yields the stored metadata,
/// which [`crate::ObjectRef`] turns into a usable handle.
pub struct ObjectCodec;

/// Builds this row's schema-addressed path.
fn object_path(ctx: &CodecContext<'_>, ext: Option<&str>) -> Result<String> {
    let spec = ctx.stores.spec(ctx.store_name)?;
    let (path, _token) = build_object_path(
        ctx.schema,
        ctx.table,
        ctx.field,
        ctx.key,
        ext,
        spec.partition_pattern.as_deref(),
        spec.token_length,
    )?;
    Ok(path)
}

impl Codec for ObjectCodec {
    fn name(&self) -> &str {
        "object"
    }

    fn dtype(&self, is_external: bool) -> Result<String> {
        if !is_external {
            return Err(Error::declaration(
                "<object> is store-only; declare it as <object@store>".to_string(),
            ));
        }
        Ok("json".to_string())
    }

    fn validate(&self, value: &Value) -> Result<()> {
        match value {
            Value::Bytes(_) => Ok(()),
            Value::String(path) if Path::new(path).exists() => Ok(()),
            Value::String(path) => Err(Error::validation(format!(
                "object source {path} does not exist"
            ))),
            other => Err(Error::validation(format!(
                "<object> takes bytes or a local path, got {}",
                other.type_name()
            ))),
        }
    }

    fn encode(&self, value: Value, ctx: &CodecContext<'_>) -> Result<Value> {
        let (store, store_name) = open_store(ctx)?;
        let metadata = match value {
            Value::Bytes(data) => {
                let path = object_path(ctx, None)?;
                store.put_buffer(&path, &data)?;
                ObjectMetadata::new(path, store_name, data.len() as u64)
            }
            Value::String(source) => {
                let source = Path::new(&source);
                if source.is_dir() {
                    let path = object_path(ctx, None)?;
                    let manifest = store.put_folder(source, &path)?;
                    ObjectMetadata::new(path, store_name, 0).with_manifest(manifest)
                } else {
                    let ext = source.extension().and_then(|e| e.to_str());
                    let path = object_path(ctx, ext)?;
                    store.put_file(source, &path)?;
                    let mut metadata =
                        ObjectMetadata::new(path.clone(), store_name, store.size(&path)?);
                    metadata.ext = ext.map(str::to_string);
                    metadata
                }
            }
            other => {
                return Err(Error::validation(format!(
                    "<object> takes bytes or a local path, got {}",
                    other.type_name()
                )));
            }
        };
        metadata_to_value(&metadata)
    }

    fn decode(&self, stored: Value, _ctx: &CodecContext<'_>) -> Result<Value> {
        // returned as metadata; ObjectRef::from_value opens it lazily
        let metadata: ObjectMetadata = metadata_from_value(stored)?;
        metadata_to_value(&metadata)
    }
}

// ---------------------------------------------------------------------------
// npy
// ---------------------------------------------------------------------------

/// Schema-addressed `.npy` storage for dense arrays. Decode yields the
/// stored metadata (shape, dtype, nbytes available without I/O);
/// [`crate::NpyRef`] loads the array on demand.
pub struct NpyCodec;

impl Codec for NpyCodec {
    fn name(&self) -> &str {
        "npy"
    }

    fn dtype(&self, is_external: bool) -> Result<String> {
        if !is_external {
            return Err(Error::declaration(
                "<npy> is store-only; declare it as <npy@store>".to_string(),
            ));
        }
        Ok("json".to_string())
    }

    fn validate(&self, value: &Value) -> Result<()> {
        match value {
            Value::Array(_) => Ok(()),
            other => Err(Error::validation(format!(
                "<npy> stores arrays, got {}",
                other.type_name()
            ))),
        }
    }

    fn encode(&self, value: Value, ctx: &CodecContext<'_>) -> Result<Value> {
        let array = match value {
            Value::Array(array) => array,
            other => {
                return Err(Error::validation(format!(
                    "<npy> stores arrays, got {}",
                    other.type_name()
                )));
            }
        };
        let (store, store_name) = open_store(ctx)?;
        let path = object_path(ctx, Some("npy"))?;
        let payload = npy_bytes(&array)?;
        store.put_buffer(&path, &payload)?;

        let mut metadata = ObjectMetadata::new(path, store_name, payload.len() as u64);
        metadata.ext = Some("npy".to_string());
        metadata.extra.insert(
            "shape".to_string(),
            serde_json::Value::from(array.shape.clone()),
        );
        metadata
            .extra
            .insert("dtype".to_string(), serde_json::Value::from(npy_descr(array.dtype)));
        metadata
            .extra
            .insert("nbytes".to_string(), serde_json::Value::from(array.nbytes()));
        metadata_to_value(&metadata)
    }

    fn decode(&self, stored: Value, _ctx: &CodecContext<'_>) -> Result<Value> {
        let metadata: ObjectMetadata = metadata_from_value(stored)?;
        metadata_to_value(&metadata)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_core::config::{StoreSpec, StoresConfig};
    use quarry_core::value::row;
    use quarry_store::StoreRegistry;

    struct Fixture {
        _store_dir: tempfile::TempDir,
        download_dir: tempfile::TempDir,
        stores: StoreRegistry,
        key: quarry_core::value::Row,
    }

    fn fixture() -> Fixture {
        let store_dir = tempfile::tempdir().unwrap();
        let mut config = StoresConfig::default();
        config.default = Some("main".to_string());
        config.specs.insert(
            "main".to_string(),
            StoreSpec {
                location: store_dir.path().to_path_buf(),
                subfolding: Some(vec![2, 2]),
                ..StoreSpec::default()
            },
        );
        Fixture {
            _store_dir: store_dir,
            download_dir: tempfile::tempdir().unwrap(),
            stores: StoreRegistry::new(config),
            key: row([("id", Value::Int(1))]),
        }
    }

    impl Fixture {
        fn ctx(&self) -> CodecContext<'_> {
            CodecContext {
                schema: "lab",
                table: "scan",
                field: "payload",
                key: &self.key,
                store_name: Some(""),
                stores: &self.stores,
                download_path: self.download_dir.path(),
            }
        }
    }

    #[test]
    fn blob_roundtrip_in_table() {
        let f = fixture();
        let value = Value::List(vec![Value::Int(1), Value::String("x".into())]);
        let encoded = BlobCodec.encode(value.clone(), &f.ctx()).unwrap();
        assert!(matches!(encoded, Value::Bytes(_)));
        assert_eq!(BlobCodec.decode(encoded, &f.ctx()).unwrap(), value);
    }

    #[test]
    fn hash_roundtrip_through_store() {
        let f = fixture();
        let ctx = f.ctx();
        let encoded = HashCodec.encode(Value::Bytes(vec![9u8; 4096]), &ctx).unwrap();
        let metadata: HashMetadata = metadata_from_value(encoded.clone()).unwrap();
        assert!(metadata.path.starts_with("_hash/lab/"));
        assert_eq!(metadata.store.as_deref(), Some("main"));
        assert_eq!(
            HashCodec.decode(encoded, &ctx).unwrap(),
            Value::Bytes(vec![9u8; 4096])
        );
    }

    #[test]
    fn attach_roundtrip_and_dedup() {
        let f = fixture();
        let ctx = f.ctx();
        let src = f.download_dir.path().join("notes.txt");
        std::fs::write(&src, b"hello").unwrap();

        let encoded = AttachCodec
            .encode(Value::String(src.display().to_string()), &ctx)
            .unwrap();
        let decoded = AttachCodec.decode(encoded.clone(), &ctx).unwrap();
        let path = decoded.into_string().unwrap();
        assert!(path.ends_with("notes.txt"));
        assert_eq!(std::fs::read(&path).unwrap(), b"hello");

        // decoding again reuses the identical file
        let again = AttachCodec.decode(encoded, &ctx).unwrap().into_string().unwrap();
        assert_eq!(path, again);
    }

    #[test]
    fn filepath_requires_existing_object() {
        let f = fixture();
        let ctx = f.ctx();
        assert!(
            FilepathCodec
                .encode(Value::String("raw/missing.dat".into()), &ctx)
                .is_err()
        );
        f.stores
            .open(None)
            .unwrap()
            .put_buffer("raw/present.dat", b"x")
            .unwrap();
        let encoded = FilepathCodec
            .encode(Value::String("raw/present.dat".into()), &ctx)
            .unwrap();
        assert_eq!(
            FilepathCodec.decode(encoded, &ctx).unwrap(),
            Value::String("raw/present.dat".into())
        );
        // reserved prefix is rejected outright
        assert!(
            FilepathCodec
                .validate(&Value::String("_hash/lab/x".into()))
                .is_err()
        );
    }

    #[test]
    fn object_stores_bytes_at_schema_addressed_path() {
        let f = fixture();
        let ctx = f.ctx();
        let encoded = ObjectCodec.encode(Value::Bytes(b"payload".to_vec()), &ctx).unwrap();
        let metadata: ObjectMetadata = metadata_from_value(encoded).unwrap();
        assert!(metadata.path.starts_with("lab/scan/"));
        assert!(metadata.path.ends_with("/payload"));
        assert_eq!(metadata.size, 7);
        assert_eq!(
            f.stores.open(None).unwrap().get_buffer(&metadata.path).unwrap(),
            b"payload"
        );
    }

    #[test]
    fn npy_metadata_exposes_shape_without_io() {
        let f = fixture();
        let ctx = f.ctx();
        let array = quarry_core::value::NdArray::from_f64(&[2, 3], &[0., 1., 2., 3., 4., 5.]).unwrap();
        let encoded = NpyCodec.encode(Value::Array(array), &ctx).unwrap();
        let metadata: ObjectMetadata = metadata_from_value(encoded).unwrap();
        assert_eq!(metadata.ext.as_deref(), Some("npy"));
        assert_eq!(metadata.extra["shape"], serde_json::json!([2, 3]));
        assert_eq!(metadata.extra["dtype"], serde_json::json!("<f8"));
        assert_eq!(metadata.extra["nbytes"], serde_json::json!(48));
    }
}
