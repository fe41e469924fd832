//! Schemas and table declaration.
//!
//! A [`Schema`] binds a database (schema) name to a connection. Declaring
//! a table parses its definition, resolves foreign key references against
//! an explicit [`DeclarationContext`], compiles dialect DDL, records
//! lineage, and returns a [`Table`] handle.

use std::collections::HashMap;

use tracing::{info, warn};

use quarry_core::declare::{
    diff_columns, DefinitionItem, ForeignKeyOption, ParsedDefinition,
    RenderedColumn,
};
use quarry_core::error::{Error, Result};
use quarry_core::identifier::{
    self, part_table_name, validate_table_name, QualifiedName, Tier,
};
use quarry_core::types::{CoreType, DeclaredType};
use quarry_dialect::{ColumnDdl, ForeignKeyDdl, TableDdl};

use crate::connection::Connection;
use crate::expression::QueryExpression;
use crate::lineage;
use crate::table::Table;

/// Maps the names used in `->` lines to the tables (or their projections)
/// they refer to.
#[derive(Default)]
pub struct DeclarationContext {
    entries: HashMap<String, QueryExpression>,
}

impl DeclarationContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a table under its reference name.
    pub fn add(&mut self, name: impl Into<String>, table: &Table) {
        self.entries.insert(name.into(), table.query());
    }

    /// Registers a query expression (e.g. a projected parent) under a
    /// reference name.
    pub fn add_expression(&mut self, name: impl Into<String>, expression: QueryExpression) {
        self.entries.insert(name.into(), expression);
    }

    fn resolve(&self, reference: &str) -> Result<&QueryExpression> {
        self.entries.get(reference).ok_or_else(|| {
            Error::declaration(format!(
                "foreign key reference {reference} could not be resolved"
            ))
        })
    }
}

/// A database schema bound to a connection.
#[derive(Clone)]
pub struct Schema {
    conn: Connection,
    name: String,
}

impl Schema {
    /// Opens (creating if needed) a schema and registers it with the
    /// connection.
    pub fn new(conn: &Connection, name: impl Into<String>) -> Result<Schema> {
        let name = name.into();
        let dialect = conn.dialect().clone();
        let existing = {
            let mut driver = conn.driver();
            dialect.list_schemas(driver.as_mut())?
        };
        if !existing.contains(&name) {
            info!(schema = %name, "creating schema");
            conn.execute_script(&dialect.create_schema(&name))?;
        }
        conn.register_schema(&name);
        Ok(Schema {
            conn: conn.clone(),
            name,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Declares (or opens, if already declared) a table of the given tier.
    pub fn table(
        &self,
        tier: Tier,
        name: &str,
        definition: &str,
        context: &DeclarationContext,
    ) -> Result<Table> {
        if tier == Tier::Part {
            return Err(Error::declaration(
                "declare part tables through Schema::part with their master",
            ));
        }
        validate_table_name(name)?;
        let physical = identifier::table_name(tier, name);
        self.declare(tier, &physical, definition, context)
    }

    /// Declares a part table under its master.
    pub fn part(
        &self,
        master: &Table,
        name: &str,
        definition: &str,
        context: &DeclarationContext,
    ) -> Result<Table> {
        validate_table_name(name)?;
        let physical = part_table_name(master.table_name(), name);
        self.declare(Tier::Part, &physical, definition, context)
    }

    fn declare(
        &self,
        tier: Tier,
        physical: &str,
        definition: &str,
        context: &DeclarationContext,
    ) -> Result<Table> {
        if physical.len() > identifier::MAX_TABLE_NAME_LENGTH {
            return Err(Error::declaration(format!(
                "table name `{physical}` exceeds the max length of {}",
                identifier::MAX_TABLE_NAME_LENGTH
            )));
        }
        let qualified = QualifiedName::new(self.name.clone(), physical);
        let parsed = quarry_core::declare::parse_definition(definition)?;
        let compiled = compile_definition(&self.conn, &qualified, tier, &parsed, context)?;

        let already_declared = {
            let dialect = self.conn.dialect().clone();
            let mut driver = self.conn.driver();
            dialect.table_info(driver.as_mut(), &qualified)?.is_some()
        };
        if !already_declared {
            info!(table = %qualified, "declaring table");
            self.conn
                .execute_script(&self.conn.dialect().create_table(&compiled.ddl))?;
            let entries = lineage::entries_for_declaration(
                &self.conn,
                &qualified,
                &compiled.ddl.primary_key,
                &compiled.fk_map,
            )?;
            lineage::replace_entries(&self.conn, &self.name, physical, &entries)?;
            self.conn.invalidate_graph();
        }
        Table::open(&self.conn, qualified, tier)
    }

    /// Alters a declared table in place. Only column additions, drops, and
    /// modifications are supported; primary key, foreign keys, and indexes
    /// cannot change.
    pub fn alter(
        &self,
        table: &Table,
        new_definition: &str,
        context: &DeclarationContext,
    ) -> Result<Table> {
        let qualified = table.qualified_name().clone();
        let new_parsed = quarry_core::declare::parse_definition(new_definition)?;
        let old_parsed = quarry_core::declare::parse_definition(&table.describe()?)?;

        let new_compiled =
            compile_definition(&self.conn, &qualified, table.tier(), &new_parsed, context)?;
        let old_compiled =
            compile_definition(&self.conn, &qualified, table.tier(), &old_parsed, context)?;

        if new_compiled.ddl.primary_key != old_compiled.ddl.primary_key {
            return Err(Error::declaration("alter cannot change the primary key"));
        }
        if new_compiled.ddl.foreign_keys != old_compiled.ddl.foreign_keys {
            return Err(Error::declaration("alter cannot change foreign keys"));
        }
        if new_compiled.ddl.indexes != old_compiled.ddl.indexes {
            return Err(Error::declaration("alter cannot change indexes"));
        }

        let render = |compiled: &CompiledDefinition| -> Vec<RenderedColumn> {
            compiled
                .ddl
                .columns
                .iter()
                .map(|column| RenderedColumn {
                    name: column.name.clone(),
                    definition: self.conn.dialect().format_column(&qualified, column),
                    renamed_from: compiled.renames.get(&column.name).cloned(),
                })
                .collect()
        };
        let ops = diff_columns(
            &render(&new_compiled),
            &render(&old_compiled),
            &new_compiled.ddl.primary_key,
        )?;
        let comment_change = (new_compiled.ddl.comment != old_compiled.ddl.comment)
            .then_some(new_compiled.ddl.comment.as_str());
        let script = self
            .conn
            .dialect()
            .alter_table(&qualified, &ops, comment_change)?;
        self.conn.execute_script(&script)?;
        self.conn.invalidate_graph();
        Table::open(&self.conn, qualified, table.tier())
    }

    /// User tables of this schema (hidden framework tables excluded).
    pub fn list_tables(&self) -> Result<Vec<String>> {
        let dialect = self.conn.dialect().clone();
        let mut driver = self.conn.driver();
        Ok(dialect
            .list_tables(driver.as_mut(), &self.name)?
            .into_iter()
            .filter(|t| !t.starts_with('~'))
            .collect())
    }

    /// Drops every table of this schema (children first) and then the
    /// schema itself. Requires safemode to be off or an explicit
    /// confirmation.
    pub fn drop(&self, confirmed: bool) -> Result<()> {
        if self.conn.config().safemode && !confirmed {
            return Err(Error::invalid(
                "safemode is on: pass confirmed=true to drop the schema",
            ));
        }
        let order = self.conn.with_graph(true, |graph| graph.topo_sort())?;
        for node in order.into_iter().rev() {
            let qualified = QualifiedName::parse(&node)?;
            if qualified.schema == self.name {
                self.conn
                    .execute_script(&self.conn.dialect().drop_table(&qualified))?;
            }
        }
        self.conn
            .execute_script(&self.conn.dialect().drop_schema(&self.name))?;
        self.conn.invalidate_graph();
        Ok(())
    }

    /// Rebuilds the `~lineage` table for every table of the schema, in
    /// dependency order.
    pub fn rebuild_lineage(&self) -> Result<()> {
        let order = self.conn.with_graph(true, |graph| graph.topo_sort())?;
        for node in order {
            let qualified = QualifiedName::parse(&node)?;
            if qualified.schema != self.name {
                continue;
            }
            let parents = self
                .conn
                .with_graph(false, |graph| graph.parents(&node, None))?;
            let mut fk_map = HashMap::new();
            for (parent, props) in parents {
                let parent_name = QualifiedName::parse(&parent)?;
                for (child_attr, parent_attr) in props.attr_map {
                    fk_map.insert(child_attr, (parent_name.clone(), parent_attr));
                }
            }
            let heading = crate::introspect::load_heading(&self.conn, &qualified)?;
            let entries = lineage::entries_for_declaration(
                &self.conn,
                &qualified,
                &heading.primary_key(),
                &fk_map,
            )?;
            lineage::replace_entries(&self.conn, &self.name, &qualified.table, &entries)?;
        }
        Ok(())
    }
}

pub(crate) struct CompiledDefinition {
    pub ddl: TableDdl,
    /// `child attribute -> (parent table, parent attribute)` for lineage.
    pub fk_map: HashMap<String, (QualifiedName, String)>,
    /// `new name -> old name` rename sentinels, for ALTER.
    pub renames: HashMap<String, String>,
    /// Store names referenced by codec columns.
    pub external_stores: Vec<String>,
}

/// Compiles a parsed definition into backend DDL inputs, resolving foreign
/// keys and codec chains.
pub(crate) fn compile_definition(
    conn: &Connection,
    name: &QualifiedName,
    tier: Tier,
    parsed: &ParsedDefinition,
    context: &DeclarationContext,
) -> Result<CompiledDefinition> {
    let mut columns: Vec<ColumnDdl> = Vec::new();
    let mut primary_key: Vec<String> = Vec::new();
    let mut foreign_keys: Vec<ForeignKeyDdl> = Vec::new();
    let mut indexes: Vec<quarry_core::heading::IndexSpec> = Vec::new();
    let mut fk_map = HashMap::new();
    let mut renames = HashMap::new();
    let mut external_stores = Vec::new();

    let declared = |columns: &[ColumnDdl], name: &str| columns.iter().any(|c| c.name == name);

    for item in &parsed.items {
        match item {
            DefinitionItem::ForeignKey(fk) => {
                let parent_expr = context.resolve(&fk.reference)?;
                let parent_name = parent_expr.base_table().cloned().ok_or_else(|| {
                    Error::declaration(format!(
                        "dependency \"{}\" is not supported; use a base table or its projection",
                        fk.reference
                    ))
                })?;
                if parent_expr.is_restricted() {
                    return Err(Error::declaration(format!(
                        "dependency \"{}\" is not supported; use a base table or its projection",
                        fk.reference
                    )));
                }
                let nullable = fk.options.contains(&ForeignKeyOption::Nullable);
                let unique = fk.options.contains(&ForeignKeyOption::Unique);
                let parent_pk = parent_expr.heading().primary_key();
                let mut original_names = Vec::with_capacity(parent_pk.len());
                for attr_name in &parent_pk {
                    let parent_attr = parent_expr.heading().attribute(attr_name)?;
                    original_names.push(parent_attr.original_name().to_string());
                    if !declared(&columns, attr_name) {
                        let comment = match &parent_attr.core_type {
                            Some(core) => format!(":{}:{}", core.canonical(), parent_attr.comment),
                            None => parent_attr.comment.clone(),
                        };
                        columns.push(ColumnDdl {
                            name: attr_name.clone(),
                            core_type: parent_attr.core_type.clone(),
                            native_type: parent_attr
                                .core_type
                                .is_none()
                                .then(|| parent_attr.sql_type.clone()),
                            nullable,
                            default: None,
                            comment,
                        });
                        if fk.in_key {
                            primary_key.push(attr_name.clone());
                        }
                    }
                    fk_map.insert(
                        attr_name.clone(),
                        (
                            parent_name.clone(),
                            parent_attr.original_name().to_string(),
                        ),
                    );
                }
                foreign_keys.push(ForeignKeyDdl {
                    fk_attrs: parent_pk.clone(),
                    parent: parent_name,
                    pk_attrs: original_names,
                });
                if unique {
                    indexes.push(quarry_core::heading::IndexSpec {
                        unique: true,
                        attributes: parent_pk,
                    });
                }
            }
            DefinitionItem::Attribute(attr) => {
                if declared(&columns, &attr.name) {
                    continue;
                }
                let (core_type, native_type, comment) = match &attr.declared_type {
                    DeclaredType::Core(core) => {
                        if attr.in_key && core.is_blob_like() {
                            return Err(Error::declaration(
                                "blob or JSON attributes are not allowed in the primary key",
                            ));
                        }
                        (
                            Some(core.clone()),
                            None,
                            format!(":{}:{}", core.canonical(), attr.comment),
                        )
                    }
                    DeclaredType::Codec { .. } => {
                        let resolved = conn.codecs().resolve_dtype(&attr.type_spec, None)?;
                        if attr.in_key {
                            return Err(Error::declaration(
                                "blob or JSON attributes are not allowed in the primary key",
                            ));
                        }
                        if let Some(store) = &resolved.store {
                            external_stores.push(store.clone());
                        }
                        let core = CoreType::parse(&resolved.final_dtype);
                        let native = core
                            .is_none()
                            .then(|| resolved.final_dtype.clone());
                        (core, native, format!(":{}:{}", attr.type_spec, attr.comment))
                    }
                    DeclaredType::Native(native) => {
                        if !conn.dialect().validate_native_type(native) {
                            return Err(Error::declaration(format!(
                                "native type '{native}' is not supported on {}",
                                conn.dialect().backend_name()
                            )));
                        }
                        warn!(
                            "native type '{native}' used in attribute '{}'; \
                             consider a core type for portability",
                            attr.name
                        );
                        (None, Some(native.clone()), attr.comment.clone())
                    }
                };
                // blob-typed columns admit only NULL defaults
                let blobby = matches!(core_type, Some(ref c) if c.is_blob_like())
                    || native_type
                        .as_deref()
                        .is_some_and(|t| t.to_ascii_lowercase().contains("blob"));
                if blobby && attr.default.as_deref().is_some_and(|d| !d.eq_ignore_ascii_case("null")) {
                    return Err(Error::declaration(format!(
                        "the default value for blob attribute `{}` can only be NULL",
                        attr.name
                    )));
                }
                if let Some(old) = attr.renamed_from() {
                    renames.insert(attr.name.clone(), old.to_string());
                }
                columns.push(ColumnDdl {
                    name: attr.name.clone(),
                    core_type,
                    native_type,
                    nullable: attr.nullable,
                    default: attr
                        .default
                        .as_deref()
                        .filter(|d| !d.eq_ignore_ascii_case("null"))
                        .map(str::to_string),
                    comment,
                });
                if attr.in_key {
                    primary_key.push(attr.name.clone());
                }
            }
            DefinitionItem::Index(index) => {
                indexes.push(quarry_core::heading::IndexSpec {
                    unique: index.unique,
                    attributes: index.attributes.clone(),
                });
            }
        }
    }

    if primary_key.is_empty() {
        return Err(Error::declaration("table must have a primary key"));
    }

    // auto-populated tables derive their whole primary key from foreign keys
    if tier.is_auto_populated() && !conn.config().jobs.allow_native_pk_in_computed {
        let native: Vec<&String> = primary_key
            .iter()
            .filter(|a| !fk_map.contains_key(*a))
            .collect();
        if !native.is_empty() {
            return Err(Error::declaration(format!(
                "auto-populated table `{name}` has non-FK primary key attribute(s): {}; \
                 make() runs once per entity, so the key must come from foreign keys \
                 (set jobs.allow_native_pk_in_computed to bypass)",
                native.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(", ")
            )));
        }
    }

    if tier.is_auto_populated() && conn.config().jobs.add_job_metadata {
        columns.extend(conn.dialect().job_metadata_columns());
    }

    Ok(CompiledDefinition {
        ddl: TableDdl {
            name: name.clone(),
            columns,
            primary_key,
            foreign_keys,
            indexes,
            comment: parsed.comment.clone(),
        },
        fk_map,
        renames,
        external_stores,
    })
}
