//! Heading reconstruction from backend introspection.
//!
//! The backend erases core-type aliases (`uuid` becomes `binary(16)`), so
//! declaration stores the portable type in the column comment as
//! `:type:comment`. Loading a heading reverses that: read columns, peel
//! the annotation, resolve codec bindings, and attach lineage.

use std::sync::LazyLock;

use regex::Regex;

use quarry_core::error::{Error, Result};
use quarry_core::heading::{Attribute, Heading, IndexSpec, TableStatus};
use quarry_core::identifier::QualifiedName;
use quarry_core::types::{parse_codec_spec, CoreType};

use crate::connection::Connection;
use crate::lineage;

static SPECIAL_COMMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^:(?P<type>[^:]+):(?P<comment>.*)$").expect("special comment"));

/// Loads a table's heading, or errors with [`Error::MissingTable`].
pub(crate) fn load_heading(conn: &Connection, name: &QualifiedName) -> Result<Heading> {
    let dialect = conn.dialect().clone();
    let (info, columns, indexes) = {
        let mut driver = conn.driver();
        let info = dialect
            .table_info(driver.as_mut(), name)?
            .ok_or_else(|| Error::MissingTable(name.to_string()))?;
        let columns = dialect.columns(driver.as_mut(), name)?;
        let indexes = dialect.indexes(driver.as_mut(), name)?;
        (info, columns, indexes)
    };

    let lineage_map = lineage::load(conn, &name.schema, &name.table)?;
    let lineage_available = lineage::table_exists(conn, &name.schema)?;

    let mut attributes = Vec::with_capacity(columns.len());
    for column in columns {
        let mut attr = Attribute::named(column.name.clone());
        attr.sql_type = column.sql_type.clone();
        attr.in_key = column.in_key;
        attr.nullable = column.nullable;
        attr.default = column.default.clone();
        attr.autoincrement = column.autoincrement;
        attr.hidden = column.name.starts_with('_');
        attr.comment = column.comment.clone();

        if let Some(caps) = SPECIAL_COMMENT.captures(&column.comment) {
            let declared = caps["type"].trim().to_string();
            attr.comment = caps["comment"].to_string();
            if declared.starts_with('<') {
                let (codec_name, store) = parse_codec_spec(&declared);
                attr.codec = Some(codec_name);
                attr.store = store;
            } else if let Some(core) = CoreType::parse(&declared) {
                attr.core_type = Some(core);
            }
        } else if let Some(core) = dialect.sql_type_to_core(&column.sql_type) {
            // tables declared outside quarry still get best-effort typing
            attr.core_type = Some(core);
        }

        let lower = column.sql_type.to_ascii_lowercase();
        attr.uuid = attr.core_type == Some(CoreType::Uuid);
        attr.json = matches!(attr.core_type, Some(CoreType::Json))
            || lower == "json"
            || lower == "jsonb"
            || lower == "json_text";
        attr.is_blob = lower.contains("blob") || lower == "bytea";
        attr.numeric = ["int", "float", "double", "real", "decimal", "numeric"]
            .iter()
            .any(|t| lower.starts_with(t) || lower.starts_with(&format!("tiny{t}")))
            || lower.starts_with("tinyint")
            || lower.starts_with("smallint")
            || lower.starts_with("mediumint")
            || lower.starts_with("bigint");

        if attr.in_key && (attr.is_blob || attr.json) {
            return Err(Error::declaration(
                "blob or JSON attributes are not allowed in the primary key",
            ));
        }
        if attr.in_key && attr.nullable {
            return Err(Error::declaration(
                "primary key attributes cannot be nullable",
            ));
        }

        attr.lineage = lineage_map.get(&column.name).cloned();
        attributes.push(attr);
    }

    let mut heading = Heading::new(attributes);
    heading.indexes = indexes
        .into_iter()
        .map(|ix| IndexSpec {
            unique: ix.unique,
            attributes: ix.columns,
        })
        .collect();
    heading.table_status = Some(TableStatus { comment: info.comment });
    heading.lineage_available = lineage_available;
    Ok(heading)
}
