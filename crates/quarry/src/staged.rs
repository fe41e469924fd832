//! Staged inserts for very large objects.
//!
//! A staged insert writes object data directly to schema-addressed
//! storage before the row exists, so multi-gigabyte uploads never sit
//! inside a transaction. On commit the collected metadata is inserted as
//! the row; if the guard drops without committing, every staged object is
//! removed.

use tracing::{debug, warn};

use quarry_core::error::{Error, Result};
use quarry_core::value::{NdArray, Row, Value};
use quarry_dialect::DuplicateHandling;
use quarry_store::path::{build_object_path, ObjectMetadata};
use quarry_store::StoreHandle;

use crate::table::{primary_key_of, Table};

/// An in-progress staged insert. Obtain with [`Table::staged_insert`].
pub struct StagedInsert<'a> {
    table: &'a Table,
    row: Row,
    key: Row,
    /// `(store handle, path)` of uploads to undo on abandonment.
    uploaded: Vec<(StoreHandle, String)>,
    committed: bool,
}

impl Table {
    /// Begins a staged insert for one row. `row` holds the complete
    /// primary key and any in-table attributes; externally stored fields
    /// are filled through the stage handle.
    pub fn staged_insert(&self, row: Row) -> Result<StagedInsert<'_>> {
        let key = primary_key_of(self.heading(), &row);
        for pk in self.heading().primary_key() {
            if !key.contains_key(&pk) {
                return Err(Error::MissingAttribute(format!(
                    "staged insert requires primary key attribute `{pk}`"
                )));
            }
        }
        if self.query().contains(&key)? {
            return Err(Error::Duplicate(format!(
                "a row with this key already exists in `{}`",
                self.qualified_name()
            )));
        }
        Ok(StagedInsert {
            table: self,
            row,
            key,
            uploaded: Vec::new(),
            committed: false,
        })
    }
}

impl StagedInsert<'_> {
    fn stage_target(&self, field: &str, ext: Option<&str>) -> Result<(StoreHandle, Option<String>, String)> {
        let attr = self.table.heading().attribute(field)?;
        let store_spec = attr.store.as_deref().ok_or_else(|| {
            Error::validation(format!(
                "attribute `{field}` is not externally stored; set it in the row instead"
            ))
        })?;
        let conn = self.table.connection();
        let resolved = conn.stores().resolve_name(Some(store_spec))?;
        let handle = conn.stores().open(Some(&resolved))?;
        let spec = conn.stores().spec(Some(&resolved))?;
        let (path, _token) = build_object_path(
            self.table.schema_name(),
            self.table.table_name(),
            field,
            &self.key,
            ext,
            spec.partition_pattern.as_deref(),
            spec.token_length,
        )?;
        Ok((handle, Some(resolved), path))
    }

    fn record(&mut self, field: &str, metadata: ObjectMetadata) -> Result<()> {
        self.row
            .insert(field.to_string(), Value::Json(serde_json::to_value(&metadata)?));
        Ok(())
    }

    /// Uploads raw bytes for an external field.
    pub fn store_bytes(&mut self, field: &str, ext: Option<&str>, data: &[u8]) -> Result<()> {
        let (handle, store, path) = self.stage_target(field, ext)?;
        handle.put_buffer(&path, data)?;
        self.uploaded.push((handle, path.clone()));
        let mut metadata = ObjectMetadata::new(path, store, data.len() as u64);
        metadata.ext = ext.map(str::to_string);
        self.record(field, metadata)
    }

    /// Uploads an array as `.npy` for an external field.
    pub fn store_array(&mut self, field: &str, array: &NdArray) -> Result<()> {
        let payload = quarry_codec::refs::npy_bytes(array)?;
        let (handle, store, path) = self.stage_target(field, Some("npy"))?;
        handle.put_buffer(&path, &payload)?;
        self.uploaded.push((handle, path.clone()));
        let mut metadata = ObjectMetadata::new(path, store, payload.len() as u64);
        metadata.ext = Some("npy".to_string());
        metadata.extra.insert(
            "shape".to_string(),
            serde_json::Value::from(array.shape.clone()),
        );
        metadata.extra.insert(
            "dtype".to_string(),
            serde_json::Value::from(quarry_codec::refs::npy_descr(array.dtype)),
        );
        metadata
            .extra
            .insert("nbytes".to_string(), serde_json::Value::from(array.nbytes()));
        self.record(field, metadata)
    }

    /// Uploads a local file for an external field.
    pub fn store_file(&mut self, field: &str, local: &std::path::Path) -> Result<()> {
        let ext = local.extension().and_then(|e| e.to_str()).map(str::to_string);
        let (handle, store, path) = self.stage_target(field, ext.as_deref())?;
        handle.put_file(local, &path)?;
        self.uploaded.push((handle.clone(), path.clone()));
        let size = handle.size(&path)?;
        let mut metadata = ObjectMetadata::new(path, store, size);
        metadata.ext = ext;
        self.record(field, metadata)
    }

    /// Recursively uploads a local directory for an external field; the
    /// manifest lands in the metadata.
    pub fn store_folder(&mut self, field: &str, local: &std::path::Path) -> Result<()> {
        let (handle, store, path) = self.stage_target(field, None)?;
        let manifest = handle.put_folder(local, &path)?;
        for item in &manifest {
            self.uploaded.push((handle.clone(), format!("{path}/{}", item.path)));
        }
        let metadata = ObjectMetadata::new(path, store, 0).with_manifest(manifest);
        self.record(field, metadata)
    }

    /// Inserts the row. Staged metadata values go in verbatim; remaining
    /// fields run through the normal insert pipeline.
    pub fn commit(mut self) -> Result<()> {
        let table = self.table;
        let mut fields: Vec<String> = Vec::with_capacity(self.row.len());
        let mut params: Vec<Value> = Vec::with_capacity(self.row.len());
        for (name, value) in &self.row {
            let attr = table.heading().attribute(name)?;
            fields.push(name.clone());
            params.push(match value {
                // staged metadata is already in stored form
                Value::Json(_) if attr.store.is_some() => value.clone(),
                other => table.prepare_value(name, other.clone(), &self.row)?,
            });
        }
        let sql = table.connection().dialect().insert_sql(
            table.qualified_name(),
            &fields,
            1,
            DuplicateHandling::Error,
            &table.heading().primary_key(),
        );
        table.connection().execute(&sql, &params)?;
        self.committed = true;
        debug!(table = %table.qualified_name(), "staged insert committed");
        Ok(())
    }
}

impl Drop for StagedInsert<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        for (handle, path) in &self.uploaded {
            if let Err(e) = handle.remove(path) {
                warn!(path, "failed to remove abandoned staged object: {e}");
            }
        }
    }
}
