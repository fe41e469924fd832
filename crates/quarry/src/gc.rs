//! Garbage collection for external storage.
//!
//! Stored objects are never deleted by row deletion; they linger until a
//! scan proves no database row references them. The scan covers both
//! addressing schemes — hash paths under `_hash/<schema>/` and
//! schema-addressed paths under `<schema>/` — and never touches prefixes
//! outside those two.

use std::collections::HashSet;

use tracing::info;

use quarry_core::error::Result;
use quarry_core::identifier::QualifiedName;
use quarry_core::value::Value;
use quarry_store::{ObjectInfo, StoredReference};

use crate::connection::Connection;
use crate::introspect::load_heading;

/// Scan results for one addressing scheme.
#[derive(Debug, Default)]
pub struct SchemeReport {
    /// Paths referenced by database rows.
    pub referenced: usize,
    /// Objects present in the store.
    pub stored: usize,
    pub stored_bytes: u64,
    /// Stored objects with no referencing row.
    pub orphaned: Vec<ObjectInfo>,
}

impl SchemeReport {
    pub fn orphaned_bytes(&self) -> u64 {
        self.orphaned.iter().map(|o| o.size).sum()
    }
}

/// Combined scan/collect report.
#[derive(Debug, Default)]
pub struct GcReport {
    pub hash: SchemeReport,
    pub schema_addressed: SchemeReport,
    /// Objects deleted by [`collect`]; empty after a scan or dry run.
    pub deleted: usize,
    pub deleted_bytes: u64,
}

/// Scans schemas against one store, reporting referenced, stored, and
/// orphaned objects per addressing scheme. Read-only.
pub fn scan(conn: &Connection, schemas: &[&str], store: Option<&str>) -> Result<GcReport> {
    let store_name = conn.stores().resolve_name(store)?;
    let handle = conn.stores().open(Some(&store_name))?;

    // every path referenced from database rows of these schemas
    let mut referenced: HashSet<String> = HashSet::new();
    for schema in schemas {
        let tables = {
            let dialect = conn.dialect().clone();
            let mut driver = conn.driver();
            dialect.list_tables(driver.as_mut(), schema)?
        };
        for table in tables {
            if table.starts_with('~') {
                continue;
            }
            let name = QualifiedName::new(*schema, table);
            let heading = load_heading(conn, &name)?;
            let external: Vec<String> = heading
                .all_attributes()
                .filter(|a| a.store.is_some())
                .map(|a| a.name.clone())
                .collect();
            for column in external {
                let sql = format!(
                    "SELECT {col} AS v FROM {} WHERE {col} IS NOT NULL",
                    conn.dialect().quote_qualified(&name),
                    col = conn.quote(&column),
                );
                for row in conn.query(&sql, &[])? {
                    let text = match row.get("v") {
                        Some(Value::String(s)) => s.clone(),
                        Some(Value::Json(j)) => j.to_string(),
                        _ => continue,
                    };
                    if let Ok(reference) = serde_json::from_str::<StoredReference>(&text) {
                        let matches_store = match &reference.store {
                            Some(s) => *s == store_name,
                            None => true, // pinned to the default store
                        };
                        if matches_store {
                            referenced.insert(reference.path);
                        }
                    }
                }
            }
        }
    }

    let mut report = GcReport::default();
    for schema in schemas {
        for object in handle.list(&format!("_hash/{schema}"))? {
            report.hash.stored += 1;
            report.hash.stored_bytes += object.size;
            if !referenced.contains(&object.path) {
                report.hash.orphaned.push(object);
            }
        }
        for object in handle.list(schema)? {
            report.schema_addressed.stored += 1;
            report.schema_addressed.stored_bytes += object.size;
            let is_referenced = referenced.contains(&object.path)
                || referenced
                    .iter()
                    .any(|path| object.path.starts_with(&format!("{path}/")));
            if !is_referenced {
                report.schema_addressed.orphaned.push(object);
            }
        }
    }
    report.hash.referenced = referenced
        .iter()
        .filter(|p| p.starts_with("_hash/"))
        .count();
    report.schema_addressed.referenced = referenced.len() - report.hash.referenced;
    Ok(report)
}

/// Scans and deletes orphaned objects. With `dry_run` the report shows
/// what would go, and nothing is removed.
pub fn collect(
    conn: &Connection,
    schemas: &[&str],
    store: Option<&str>,
    dry_run: bool,
) -> Result<GcReport> {
    let mut report = scan(conn, schemas, store)?;
    if dry_run {
        return Ok(report);
    }
    let handle = conn.stores().open(store)?;
    for object in report
        .hash
        .orphaned
        .iter()
        .chain(report.schema_addressed.orphaned.iter())
    {
        handle.remove(&object.path)?;
        report.deleted += 1;
        report.deleted_bytes += object.size;
    }
    info!(
        deleted = report.deleted,
        bytes = report.deleted_bytes,
        "garbage collection complete"
    );
    Ok(report)
}
