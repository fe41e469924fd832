//! Lineage tracking: every attribute's origin, recorded per schema in a
//! hidden `~lineage` table.
//!
//! An attribute's lineage is the `schema.table.attribute` where it was
//! first defined: FK-inherited attributes trace to their origin, native
//! primary key attributes originate here, and native secondary attributes
//! carry no lineage (and never match semantically in joins).

use std::collections::HashMap;

use tracing::warn;

use quarry_core::error::Result;
use quarry_core::identifier::QualifiedName;
use quarry_core::types::CoreType;
use quarry_core::value::Value;
use quarry_dialect::{ColumnDdl, DuplicateHandling, TableDdl};

use crate::connection::Connection;

pub(crate) const LINEAGE_TABLE: &str = "~lineage";

fn lineage_name(schema: &str) -> QualifiedName {
    QualifiedName::new(schema, LINEAGE_TABLE)
}

fn varchar_column(name: &str, width: u32) -> ColumnDdl {
    ColumnDdl {
        name: name.to_string(),
        core_type: Some(CoreType::Varchar(width)),
        native_type: None,
        nullable: false,
        default: None,
        comment: String::new(),
    }
}

/// Creates the `~lineage` table if absent.
pub(crate) fn ensure_table(conn: &Connection, schema: &str) -> Result<()> {
    if table_exists(conn, schema)? {
        return Ok(());
    }
    let ddl = TableDdl {
        name: lineage_name(schema),
        columns: vec![
            varchar_column("table_name", 64),
            varchar_column("attribute_name", 64),
            varchar_column("lineage", 255),
        ],
        primary_key: vec!["table_name".to_string(), "attribute_name".to_string()],
        foreign_keys: vec![],
        indexes: vec![],
        comment: String::new(),
    };
    conn.execute_script(&conn.dialect().create_table(&ddl))
}

/// Whether the schema carries a `~lineage` table.
pub(crate) fn table_exists(conn: &Connection, schema: &str) -> Result<bool> {
    let dialect = conn.dialect().clone();
    let mut driver = conn.driver();
    Ok(dialect.table_info(driver.as_mut(), &lineage_name(schema))?.is_some())
}

/// All lineage entries for a table, keyed by attribute name. Empty when
/// lineage is not tracked.
pub(crate) fn load(conn: &Connection, schema: &str, table: &str) -> Result<HashMap<String, String>> {
    if !table_exists(conn, schema)? {
        return Ok(HashMap::new());
    }
    let dialect = conn.dialect();
    let sql = format!(
        "SELECT attribute_name AS a, lineage AS l FROM {} WHERE table_name={}",
        dialect.quote_qualified(&lineage_name(schema)),
        dialect.placeholder(0)
    );
    let rows = conn.query(&sql, &[Value::String(table.to_string())])?;
    Ok(rows
        .into_iter()
        .filter_map(|row| {
            let a = row.get("a")?.as_str()?.to_string();
            let l = row.get("l")?.as_str()?.to_string();
            Some((a, l))
        })
        .collect())
}

/// Removes all entries for a table (idempotent re-declaration, drop).
pub(crate) fn delete_for(conn: &Connection, schema: &str, table: &str) -> Result<()> {
    if !table_exists(conn, schema)? {
        return Ok(());
    }
    let dialect = conn.dialect();
    let sql = format!(
        "DELETE FROM {} WHERE table_name={}",
        dialect.quote_qualified(&lineage_name(schema)),
        dialect.placeholder(0)
    );
    conn.execute(&sql, &[Value::String(table.to_string())])?;
    Ok(())
}

/// Replaces a table's lineage entries.
pub(crate) fn replace_entries(
    conn: &Connection,
    schema: &str,
    table: &str,
    entries: &[(String, String)],
) -> Result<()> {
    ensure_table(conn, schema)?;
    delete_for(conn, schema, table)?;
    if entries.is_empty() {
        return Ok(());
    }
    let dialect = conn.dialect();
    let columns = vec![
        "table_name".to_string(),
        "attribute_name".to_string(),
        "lineage".to_string(),
    ];
    let pk = vec!["table_name".to_string(), "attribute_name".to_string()];
    let sql = dialect.insert_sql(
        &lineage_name(schema),
        &columns,
        entries.len(),
        DuplicateHandling::Update,
        &pk,
    );
    let mut params = Vec::with_capacity(entries.len() * 3);
    for (attribute, lineage) in entries {
        params.push(Value::String(table.to_string()));
        params.push(Value::String(attribute.clone()));
        params.push(Value::String(lineage.clone()));
    }
    conn.execute(&sql, &params)?;
    Ok(())
}

/// Computes the lineage entries for a freshly declared table: inherited
/// attributes copy the parent's lineage (falling back to the parent's own
/// identity with a warning), native primary key attributes originate here.
pub(crate) fn entries_for_declaration(
    conn: &Connection,
    name: &QualifiedName,
    primary_key: &[String],
    fk_attribute_map: &HashMap<String, (QualifiedName, String)>,
) -> Result<Vec<(String, String)>> {
    let mut entries = Vec::new();
    for (attribute, (parent, parent_attr)) in fk_attribute_map {
        let parent_lineage = load(conn, &parent.schema, &parent.table)?;
        let lineage = match parent_lineage.get(parent_attr) {
            Some(lineage) => lineage.clone(),
            None => {
                warn!(
                    "no lineage recorded for {parent}.{parent_attr}; \
                     using the parent itself as origin"
                );
                format!("{}.{}.{parent_attr}", parent.schema, parent.table)
            }
        };
        entries.push((attribute.clone(), lineage));
    }
    for attribute in primary_key {
        if !fk_attribute_map.contains_key(attribute) {
            entries.push((
                attribute.clone(),
                format!("{}.{}.{attribute}", name.schema, name.table),
            ));
        }
    }
    entries.sort();
    Ok(entries)
}
