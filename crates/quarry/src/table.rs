//! Tables: declared relations with mutation capabilities on top of the
//! query algebra — insert, update-one, validate, cascading delete, drop,
//! and describe.

use std::collections::{HashMap, HashSet};

use tracing::{debug, info};

use quarry_codec::{encode_chain, CodecContext};
use quarry_core::error::{Error, Result};
use quarry_core::heading::Heading;
use quarry_core::identifier::{master_of, QualifiedName, Tier};
use quarry_core::value::{Row, Value};
use quarry_dialect::DuplicateHandling;
use uuid::Uuid;

use crate::condition::{make_condition, Compiled, Restriction};
use crate::connection::Connection;
use crate::expression::{Proj, QueryExpression};
use crate::introspect::load_heading;
use crate::lineage;

/// How many cascade retries one table gets before the delete aborts.
const MAX_CASCADE_ATTEMPTS: usize = 50;

/// A declared table bound to a connection.
#[derive(Clone)]
pub struct Table {
    conn: Connection,
    name: QualifiedName,
    tier: Tier,
    heading: Heading,
    /// Set on the handle passed into `make` so populate can insert into
    /// auto-populated tables.
    pub(crate) inserts_allowed: bool,
}

/// Options for [`Table::insert_with`].
#[derive(Debug, Clone, Default)]
pub struct InsertOptions {
    /// Replace existing rows instead of erroring on duplicates.
    pub replace: bool,
    /// Silently skip rows whose primary key already exists.
    pub skip_duplicates: bool,
    /// Ignore row fields that are not table attributes.
    pub ignore_extra_fields: bool,
    /// Permit direct inserts into auto-populated tables.
    pub allow_direct_insert: bool,
}

/// Master/part policy during cascading delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PartIntegrity {
    /// Refuse to delete part rows while their master rows remain.
    #[default]
    Enforce,
    /// Allow deleting parts without their masters.
    Ignore,
    /// Extend the cascade upward to the master.
    Cascade,
}

/// Options for [`Table::delete`].
#[derive(Clone, Default)]
pub struct DeleteOptions {
    /// Restrict the delete to matching rows; `None` deletes everything.
    pub restriction: Option<Restriction>,
    /// Wrap the cascade in a transaction (on by default; disable when
    /// nesting inside an outer transaction).
    pub no_transaction: bool,
    /// Confirms the destructive operation when safemode is on.
    pub confirmed: bool,
    pub part_integrity: PartIntegrity,
}

/// Structured outcome of [`Table::validate`].
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub errors: Vec<ValidationIssue>,
    pub rows_checked: usize,
}

#[derive(Debug, Clone)]
pub struct ValidationIssue {
    pub row_index: usize,
    pub field: Option<String>,
    pub message: String,
}

impl ValidationResult {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

impl Table {
    /// Opens a handle on a declared table, loading its heading.
    pub(crate) fn open(conn: &Connection, name: QualifiedName, tier: Tier) -> Result<Table> {
        let heading = load_heading(conn, &name)?;
        Ok(Table {
            conn: conn.clone(),
            name,
            tier,
            heading,
            inserts_allowed: false,
        })
    }

    pub fn qualified_name(&self) -> &QualifiedName {
        &self.name
    }

    pub fn table_name(&self) -> &str {
        &self.name.table
    }

    pub fn schema_name(&self) -> &str {
        &self.name.schema
    }

    pub fn tier(&self) -> Tier {
        self.tier
    }

    pub fn heading(&self) -> &Heading {
        &self.heading
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// A fresh query expression over this table.
    pub fn query(&self) -> QueryExpression {
        QueryExpression::base(self.conn.clone(), self.name.clone(), self.heading.clone())
    }

    /// Shorthand for `query().restrict(...)`.
    pub fn restrict(&self, condition: impl Into<Restriction>) -> Result<QueryExpression> {
        self.query().restrict(condition)
    }

    /// Row count of the whole table.
    pub fn count(&self) -> Result<u64> {
        self.query().count()
    }

    /// Fetches the whole table.
    pub fn fetch(&self) -> Result<Vec<Row>> {
        self.query().fetch()
    }

    /// Re-reads the heading after an alter.
    pub fn refresh(&mut self) -> Result<()> {
        self.heading = load_heading(&self.conn, &self.name)?;
        Ok(())
    }

    // -- Insert --------------------------------------------------------------

    /// Inserts one row.
    pub fn insert1(&self, row: &Row) -> Result<()> {
        self.insert_with(std::slice::from_ref(row), &InsertOptions::default())
    }

    /// Inserts rows with default options.
    pub fn insert(&self, rows: &[Row]) -> Result<()> {
        self.insert_with(rows, &InsertOptions::default())
    }

    /// Inserts rows; all rows of one call go into one statement.
    pub fn insert_with(&self, rows: &[Row], options: &InsertOptions) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        self.check_insert_allowed(options)?;
        let (fields, row_params) = self.prepare_rows(rows, options)?;
        if fields.is_empty() {
            // every attribute takes its default
            let sql = self.conn.dialect().insert_default_row_sql(&self.name);
            for _ in rows {
                self.conn
                    .execute(&sql, &[])
                    .map_err(|e| self.wrap_insert_error(e, options))?;
            }
            return Ok(());
        }
        let duplicate = if options.replace {
            DuplicateHandling::Replace
        } else if options.skip_duplicates {
            DuplicateHandling::Skip
        } else {
            DuplicateHandling::Error
        };
        let sql = self.conn.dialect().insert_sql(
            &self.name,
            &fields,
            rows.len(),
            duplicate,
            &self.heading.primary_key(),
        );
        let params: Vec<Value> = row_params.into_iter().flatten().collect();
        debug!(table = %self.name, rows = rows.len(), "insert");
        self.conn
            .execute(&sql, &params)
            .map(|_| ())
            .map_err(|e| self.wrap_insert_error(e, options))
    }

    /// Inserts rows in chunks of `chunk_size`, each its own statement.
    pub fn insert_chunked(
        &self,
        rows: &[Row],
        chunk_size: usize,
        options: &InsertOptions,
    ) -> Result<()> {
        for chunk in rows.chunks(chunk_size.max(1)) {
            self.insert_with(chunk, options)?;
        }
        Ok(())
    }

    /// Inserts the result of a query (`INSERT ... SELECT`). The query's
    /// attributes must all exist in this table.
    pub fn insert_from(&self, query: &QueryExpression, options: &InsertOptions) -> Result<()> {
        self.check_insert_allowed(options)?;
        let fields = query.heading().names();
        for field in &fields {
            if !self.heading.contains(field) && !options.ignore_extra_fields {
                return Err(self.wrap_insert_error(Error::UnknownAttribute(field.clone()), options));
            }
        }
        let fields: Vec<String> = fields
            .into_iter()
            .filter(|f| self.heading.contains(f))
            .collect();
        let duplicate = if options.replace {
            DuplicateHandling::Replace
        } else if options.skip_duplicates {
            DuplicateHandling::Skip
        } else {
            DuplicateHandling::Error
        };
        let sql = self.conn.dialect().insert_from_select(
            &self.name,
            &fields,
            &query.make_sql(Some(&fields))?,
            duplicate,
            &self.heading.primary_key(),
        );
        self.conn
            .execute(&sql, &[])
            .map(|_| ())
            .map_err(|e| self.wrap_insert_error(e, options))
    }

    fn check_insert_allowed(&self, options: &InsertOptions) -> Result<()> {
        if self.tier.is_auto_populated() && !options.allow_direct_insert && !self.inserts_allowed {
            return Err(Error::invalid(format!(
                "inserts into the auto-populated table `{}` happen inside make(); \
                 pass allow_direct_insert=true to override",
                self.name
            )));
        }
        Ok(())
    }

    fn wrap_insert_error(&self, error: Error, options: &InsertOptions) -> Error {
        match error {
            Error::Duplicate(message) if !options.skip_duplicates => Error::Duplicate(format!(
                "{message}; pass skip_duplicates=true to skip existing entries"
            )),
            Error::UnknownAttribute(message) if !options.ignore_extra_fields => {
                Error::UnknownAttribute(format!(
                    "{message}; pass ignore_extra_fields=true to ignore unknown fields"
                ))
            }
            other => other,
        }
    }

    /// Determines the field list and per-row encoded parameters.
    fn prepare_rows(
        &self,
        rows: &[Row],
        options: &InsertOptions,
    ) -> Result<(Vec<String>, Vec<Vec<Value>>)> {
        let mut fields: Vec<String> = Vec::new();
        for name in rows[0].keys() {
            if self.heading.get(name).is_some() {
                fields.push(name.clone());
            } else if !options.ignore_extra_fields {
                return Err(self.wrap_insert_error(Error::UnknownAttribute(name.clone()), options));
            }
        }
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            for name in row.keys() {
                if self.heading.get(name).is_none() && !options.ignore_extra_fields {
                    return Err(
                        self.wrap_insert_error(Error::UnknownAttribute(name.clone()), options)
                    );
                }
            }
            let mut params = Vec::with_capacity(fields.len());
            for field in &fields {
                let value = row.get(field).cloned().ok_or_else(|| {
                    Error::MissingAttribute(format!(
                        "field `{field}` is missing from one of the inserted rows"
                    ))
                })?;
                params.push(self.prepare_value(field, value, row)?);
            }
            out.push(params);
        }
        Ok((fields, out))
    }

    /// Runs one field through validation, native lowering, and its codec
    /// chain.
    pub(crate) fn prepare_value(&self, field: &str, value: Value, row: &Row) -> Result<Value> {
        let attr = self.heading.attribute(field)?;

        // NaN on a nullable float means NULL
        let value = match value {
            Value::Float(f) if f.is_nan() && attr.nullable => Value::Null,
            other => other,
        };
        if value.is_null() {
            if attr.nullable {
                return Ok(Value::Null);
            }
            return Err(Error::MissingAttribute(format!(
                "attribute `{field}` is not nullable"
            )));
        }

        if let Some(codec_name) = &attr.codec {
            let spec = format!(
                "<{codec_name}{}>",
                match &attr.store {
                    Some(store) if store.is_empty() => "@".to_string(),
                    Some(store) => format!("@{store}"),
                    None => String::new(),
                }
            );
            let resolved = self.conn.codecs().resolve_dtype(&spec, None)?;
            let mut key = Row::new();
            for pk in self.heading.primary_key() {
                if let Some(v) = row.get(&pk) {
                    key.insert(pk, v.clone());
                }
            }
            let ctx = CodecContext {
                schema: &self.name.schema,
                table: &self.name.table,
                field,
                key: &key,
                store_name: resolved.store.as_deref(),
                stores: self.conn.stores(),
                download_path: &self.conn.config().download_path,
            };
            return encode_chain(&resolved.chain, value, &ctx);
        }

        if attr.uuid {
            return match value {
                Value::Uuid(_) => Ok(value),
                Value::String(s) => Uuid::parse_str(&s)
                    .map(Value::Uuid)
                    .map_err(|_| Error::validation(format!("badly formed UUID for `{field}`: {s}"))),
                other => Err(Error::validation(format!(
                    "attribute `{field}` takes a UUID, got {}",
                    other.type_name()
                ))),
            };
        }
        if attr.json {
            return match value {
                Value::Json(_) => Ok(value),
                Value::String(s) => serde_json::from_str(&s)
                    .map(Value::Json)
                    .map_err(|e| Error::validation(format!("bad JSON for `{field}`: {e}"))),
                other => Err(Error::validation(format!(
                    "attribute `{field}` takes JSON, got {}",
                    other.type_name()
                ))),
            };
        }
        if attr.is_blob {
            return match value {
                Value::Bytes(_) => Ok(value),
                other => Err(Error::validation(format!(
                    "attribute `{field}` takes bytes, got {}; declare <blob> for arbitrary values",
                    other.type_name()
                ))),
            };
        }
        Ok(value)
    }

    // -- Validate ------------------------------------------------------------

    /// Runs the insert pipeline without executing SQL, collecting issues
    /// per row.
    pub fn validate(&self, rows: &[Row], options: &InsertOptions) -> ValidationResult {
        let mut result = ValidationResult {
            rows_checked: rows.len(),
            ..ValidationResult::default()
        };
        let primary_key = self.heading.primary_key();
        for (index, row) in rows.iter().enumerate() {
            for name in row.keys() {
                if self.heading.get(name).is_none() && !options.ignore_extra_fields {
                    result.errors.push(ValidationIssue {
                        row_index: index,
                        field: Some(name.clone()),
                        message: format!("unknown attribute `{name}`"),
                    });
                }
            }
            for pk in &primary_key {
                let missing = match row.get(pk) {
                    None => self.heading.get(pk).is_some_and(|a| a.default.is_none()),
                    Some(Value::Null) => true,
                    Some(_) => false,
                };
                if missing {
                    result.errors.push(ValidationIssue {
                        row_index: index,
                        field: Some(pk.clone()),
                        message: format!("primary key attribute `{pk}` is missing"),
                    });
                }
            }
            for (name, value) in row {
                if self.heading.get(name).is_none() {
                    continue;
                }
                if let Err(e) = self.prepare_value_dry(name, value, row) {
                    result.errors.push(ValidationIssue {
                        row_index: index,
                        field: Some(name.clone()),
                        message: e.to_string(),
                    });
                }
            }
        }
        result
    }

    /// Validation-only variant of [`Table::prepare_value`]: codec
    /// validation runs but nothing is uploaded.
    fn prepare_value_dry(&self, field: &str, value: &Value, _row: &Row) -> Result<()> {
        let attr = self.heading.attribute(field)?;
        if value.is_null() {
            if attr.nullable {
                return Ok(());
            }
            return Err(Error::validation(format!("attribute `{field}` is not nullable")));
        }
        if let Some(codec_name) = &attr.codec {
            let codec = self.conn.codecs().get(codec_name)?;
            return codec.validate(value);
        }
        if attr.uuid {
            return match value {
                Value::Uuid(_) => Ok(()),
                Value::String(s) => Uuid::parse_str(s)
                    .map(|_| ())
                    .map_err(|_| Error::validation(format!("badly formed UUID: {s}"))),
                other => Err(Error::validation(format!(
                    "expected a UUID, got {}",
                    other.type_name()
                ))),
            };
        }
        if attr.json {
            return match value {
                Value::Json(_) => Ok(()),
                Value::String(s) => serde_json::from_str::<serde_json::Value>(s)
                    .map(|_| ())
                    .map_err(|e| Error::validation(format!("bad JSON: {e}"))),
                other => Err(Error::validation(format!(
                    "expected JSON, got {}",
                    other.type_name()
                ))),
            };
        }
        Ok(())
    }

    // -- Update --------------------------------------------------------------

    /// Updates exactly one existing row identified by its primary key.
    /// `Null` values reset nullable attributes to NULL; on non-nullable
    /// attributes with a default, the engine re-evaluates the declared
    /// default.
    pub fn update1(&self, row: &Row) -> Result<()> {
        let primary_key = self.heading.primary_key();
        let mut key = Row::new();
        for pk in &primary_key {
            let value = row.get(pk).ok_or_else(|| {
                Error::MissingAttribute(format!("update1 requires primary key attribute `{pk}`"))
            })?;
            key.insert(pk.clone(), value.clone());
        }

        let dialect = self.conn.dialect().clone();
        let mut set_exprs: Vec<String> = Vec::new();
        let mut params: Vec<Value> = Vec::new();
        let mut index = 0;
        for (name, value) in row {
            if primary_key.contains(name) {
                continue;
            }
            let attr = self.heading.attribute(name)?;
            if value.is_null() && !attr.nullable {
                // the engine evaluates the declared default, not its text
                let default = attr.default.as_deref().ok_or_else(|| {
                    Error::validation(format!(
                        "attribute `{name}` has no default and is not nullable"
                    ))
                })?;
                set_exprs.push(format!(
                    "{}={}",
                    dialect.quote_ident(name),
                    dialect.update_default_expr(default)
                ));
                continue;
            }
            let prepared = if value.is_null() {
                Value::Null
            } else {
                self.prepare_value(name, value.clone(), row)?
            };
            set_exprs.push(format!(
                "{}={}",
                dialect.quote_ident(name),
                dialect.placeholder(index)
            ));
            index += 1;
            params.push(prepared);
        }
        if set_exprs.is_empty() {
            return Err(Error::validation("update1 requires at least one non-key attribute"));
        }

        match self.query().restrict(key.clone())?.count()? {
            1 => {}
            0 => {
                return Err(Error::MissingAttribute(format!(
                    "update1 found no row for key in `{}`",
                    self.name
                )));
            }
            n => {
                return Err(Error::invalid(format!(
                    "update1 matched {n} rows; the key must identify exactly one"
                )));
            }
        }

        let where_sql = primary_key
            .iter()
            .map(|pk| {
                let clause = format!("{}={}", dialect.quote_ident(pk), dialect.placeholder(index));
                index += 1;
                clause
            })
            .collect::<Vec<_>>()
            .join(" AND ");
        let sql = format!(
            "UPDATE {} SET {} WHERE {where_sql}",
            dialect.quote_qualified(&self.name),
            set_exprs.join(",")
        );
        for pk in &primary_key {
            params.push(self.prepare_value(pk, key[pk.as_str()].clone(), row)?);
        }
        self.conn.execute(&sql, &params)?;
        Ok(())
    }

    // -- Delete --------------------------------------------------------------

    /// Deletes matching rows without cascading; fails on referencing
    /// children.
    pub fn delete_quick(&self, restriction: Option<Restriction>) -> Result<u64> {
        let target = self.delete_target(restriction)?;
        delete_target(&self.conn, &target)
    }

    /// Cascading delete: deletes matching rows and, transitively, all rows
    /// referencing them. Returns the number of rows deleted from this
    /// table.
    pub fn delete(&self, options: DeleteOptions) -> Result<u64> {
        if self.conn.config().safemode && !options.confirmed {
            return Err(Error::invalid(
                "safemode is on: pass confirmed=true to delete",
            ));
        }
        let use_transaction = !options.no_transaction;
        if use_transaction {
            if self.conn.in_transaction() {
                return Err(Error::invalid(
                    "delete cannot open a transaction inside another; set no_transaction",
                ));
            }
            self.conn.start_transaction()?;
        }

        let target = match self.delete_target(options.restriction.clone()) {
            Ok(target) => target,
            Err(e) => {
                if use_transaction {
                    self.conn.cancel_transaction()?;
                }
                return Err(e);
            }
        };
        let mut deleted: HashSet<String> = HashSet::new();
        let mut visited_masters: HashSet<String> = HashSet::new();
        let outcome = cascade(
            &self.conn,
            &target,
            options.part_integrity,
            &mut deleted,
            &mut visited_masters,
        );
        let count = match outcome {
            Ok(count) => count,
            Err(e) => {
                if use_transaction {
                    self.conn.cancel_transaction()?;
                }
                return Err(e);
            }
        };

        if options.part_integrity == PartIntegrity::Enforce {
            for table in &deleted {
                if let Ok(name) = QualifiedName::parse(table) {
                    if let Some(master) = name.master() {
                        if !deleted.contains(&master.to_string()) {
                            if use_transaction {
                                self.conn.cancel_transaction()?;
                            }
                            return Err(Error::invalid(format!(
                                "attempt to delete part table {table} before its master {master}; \
                                 use PartIntegrity::Ignore to allow or PartIntegrity::Cascade \
                                 to include the master"
                            )));
                        }
                    }
                }
            }
        }

        if use_transaction {
            self.conn.commit_transaction()?;
        }
        info!(table = %self.name, rows = count, "delete committed");
        Ok(count)
    }

    fn delete_target(&self, restriction: Option<Restriction>) -> Result<DeleteTarget> {
        let mut where_fragments = Vec::new();
        if let Some(restriction) = restriction {
            let mut columns = HashSet::new();
            match make_condition(
                &self.heading,
                self.conn.dialect().as_ref(),
                &restriction,
                &mut columns,
            )? {
                Compiled::True => {}
                Compiled::False => where_fragments.push("FALSE".to_string()),
                Compiled::Sql(sql) => where_fragments.push(sql),
            }
        }
        Ok(DeleteTarget {
            name: self.name.clone(),
            where_fragments,
        })
    }

    // -- Drop ----------------------------------------------------------------

    /// Drops this table without cascading (fails if referenced) and cleans
    /// its lineage entries.
    pub fn drop_quick(&self) -> Result<()> {
        lineage::delete_for(&self.conn, &self.name.schema, &self.name.table)?;
        self.conn
            .execute_script(&self.conn.dialect().drop_table(&self.name))?;
        self.conn.invalidate_graph();
        info!(table = %self.name, "dropped table");
        Ok(())
    }

    /// Drops this table and every table that references it, children
    /// first. Part tables cannot be dropped ahead of their masters.
    pub fn drop(&self, confirmed: bool) -> Result<()> {
        if self.conn.config().safemode && !confirmed {
            return Err(Error::invalid("safemode is on: pass confirmed=true to drop"));
        }
        let node = self.name.to_string();
        let tables = self.conn.with_graph(true, |graph| graph.descendants(&node))?;

        // a part cannot be dropped without its master
        for table in &tables {
            if let Ok(name) = QualifiedName::parse(table) {
                if let Some(master) = name.master() {
                    if !tables.contains(&master.to_string()) {
                        return Err(Error::invalid(format!(
                            "cannot drop part table {table} before its master; drop {master} first"
                        )));
                    }
                }
            }
        }

        for table in tables.iter().rev() {
            let qualified = QualifiedName::parse(table)?;
            // the job table, if any, goes with its target
            let jobs = QualifiedName::new(
                qualified.schema.clone(),
                format!("~~{}", qualified.table),
            );
            let has_jobs = {
                let dialect = self.conn.dialect().clone();
                let mut driver = self.conn.driver();
                dialect.table_info(driver.as_mut(), &jobs)?.is_some()
            };
            if has_jobs {
                self.conn.execute_script(&self.conn.dialect().drop_table(&jobs))?;
            }
            lineage::delete_for(&self.conn, &qualified.schema, &qualified.table)?;
            self.conn
                .execute_script(&self.conn.dialect().drop_table(&qualified))?;
            info!(table = %qualified, "dropped table");
        }
        self.conn.invalidate_graph();
        Ok(())
    }

    // -- Describe ------------------------------------------------------------

    /// Reconstructs a canonical definition string from the live table.
    /// Foreign keys are rendered against their parents' qualified names.
    pub fn describe(&self) -> Result<String> {
        let node = self.name.to_string();
        let parents = self.conn.with_graph(false, |graph| graph.parents(&node, None))?;

        // map each FK's child attributes to its parent line
        struct FkLine {
            attrs: Vec<String>,
            reference: String,
            in_key: bool,
        }
        let primary_key = self.heading.primary_key();
        let mut fk_lines: Vec<FkLine> = Vec::new();
        let mut covered: HashSet<String> = HashSet::new();
        for (parent, props) in parents {
            let attrs: Vec<String> = props.attr_map.iter().map(|(c, _)| c.clone()).collect();
            let in_key = attrs.iter().all(|a| primary_key.contains(a));
            let reference = if props.aliased {
                let renames: Vec<String> = props
                    .attr_map
                    .iter()
                    .filter(|(c, p)| c != p)
                    .map(|(c, p)| format!("{c}={p}"))
                    .collect();
                format!("{parent}  # renamed: {}", renames.join(", "))
            } else {
                parent.clone()
            };
            covered.extend(attrs.iter().cloned());
            fk_lines.push(FkLine {
                attrs,
                reference,
                in_key,
            });
        }

        let mut lines: Vec<String> = Vec::new();
        if let Some(status) = &self.heading.table_status {
            if !status.comment.is_empty() {
                lines.push(format!("# {}", status.comment));
            }
        }
        let mut emitted_fk: HashSet<usize> = HashSet::new();
        let mut emit_attr_or_fk = |attr_name: &str, lines: &mut Vec<String>| {
            if covered.contains(attr_name) {
                for (i, fk) in fk_lines.iter().enumerate() {
                    if fk.attrs.contains(&attr_name.to_string()) && !emitted_fk.contains(&i) {
                        emitted_fk.insert(i);
                        lines.push(format!("-> {}", fk.reference));
                    }
                }
            } else if let Some(attr) = self.heading.get(attr_name) {
                let name_part = match (&attr.default, attr.nullable) {
                    (_, true) => format!("{}=null", attr.name),
                    (Some(default), false) if !default.is_empty() => {
                        format!("{}={}", attr.name, default)
                    }
                    (Some(_), false) => format!("{}=\"\"", attr.name),
                    (None, false) => attr.name.clone(),
                };
                let mut line = format!("{name_part} : {}", attr.display_type());
                if !attr.comment.is_empty() {
                    line.push_str(&format!("  # {}", attr.comment));
                }
                lines.push(line);
            }
        };

        for name in &primary_key {
            emit_attr_or_fk(name, &mut lines);
        }
        lines.push("---".to_string());
        for name in self.heading.secondary_attributes() {
            emit_attr_or_fk(&name, &mut lines);
        }
        for index in &self.heading.indexes {
            lines.push(format!(
                "{}index ({})",
                if index.unique { "unique " } else { "" },
                index.attributes.join(", ")
            ));
        }
        Ok(lines.join("\n"))
    }
}

// ---------------------------------------------------------------------------
// Cascading delete
// ---------------------------------------------------------------------------

/// A table plus compiled WHERE fragments, the unit of cascade recursion.
#[derive(Clone)]
struct DeleteTarget {
    name: QualifiedName,
    where_fragments: Vec<String>,
}

impl DeleteTarget {
    fn where_clause(&self) -> String {
        if self.where_fragments.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", self.where_fragments.join(" AND "))
        }
    }

    /// A `SELECT <attrs> FROM <self>` fragment restricting a child, with
    /// parent attributes renamed to the child's FK attribute names.
    fn semijoin_fragment(
        &self,
        conn: &Connection,
        child_attrs: &[String],
        parent_attrs: &[String],
    ) -> String {
        let dialect = conn.dialect();
        let select: Vec<String> = child_attrs
            .iter()
            .zip(parent_attrs)
            .map(|(child, parent)| {
                if child == parent {
                    dialect.quote_ident(parent)
                } else {
                    format!(
                        "{} AS {}",
                        dialect.quote_ident(parent),
                        dialect.quote_ident(child)
                    )
                }
            })
            .collect();
        let fields: Vec<String> = child_attrs.iter().map(|a| dialect.quote_ident(a)).collect();
        format!(
            "({}) IN (SELECT {} FROM {}{})",
            fields.join(","),
            select.join(","),
            dialect.quote_qualified(&self.name),
            self.where_clause()
        )
    }
}

fn delete_target(conn: &Connection, target: &DeleteTarget) -> Result<u64> {
    let sql = format!(
        "{}{}",
        conn.dialect().delete_sql(&target.name),
        target.where_clause()
    );
    conn.execute(&sql, &[])
}

fn cascade(
    conn: &Connection,
    target: &DeleteTarget,
    part_integrity: PartIntegrity,
    deleted: &mut HashSet<String>,
    visited_masters: &mut HashSet<String>,
) -> Result<u64> {
    for _ in 0..MAX_CASCADE_ATTEMPTS {
        match delete_target(conn, target) {
            Ok(count) => {
                deleted.insert(target.name.to_string());
                debug!(table = %target.name, rows = count, "deleted");
                return Ok(count);
            }
            Err(Error::Integrity(message)) => {
                let children = blocking_children(conn, target, &message)?;
                if children.is_empty() {
                    return Err(Error::invalid(
                        "cascading delete failed: the foreign key violation names no child \
                         and the dependency graph has no children for this table",
                    ));
                }
                for (child, child_attrs, parent_attrs) in children {
                    let child_target = DeleteTarget {
                        where_fragments: vec![target.semijoin_fragment(
                            conn,
                            &child_attrs,
                            &parent_attrs,
                        )],
                        name: child.clone(),
                    };
                    let master = master_of(&child.table)
                        .map(|m| QualifiedName::new(child.schema.clone(), m));
                    match master {
                        Some(master)
                            if part_integrity == PartIntegrity::Cascade
                                && master != target.name
                                && !visited_masters.contains(&master.to_string()) =>
                        {
                            visited_masters.insert(master.to_string());
                            // restrict the master by the implicated part rows
                            let master_pk: Vec<String> = {
                                let dialect = conn.dialect().clone();
                                let mut driver = conn.driver();
                                dialect.primary_key(driver.as_mut(), &master)?
                            };
                            let fragment = child_target.semijoin_fragment(
                                conn,
                                &master_pk,
                                &master_pk,
                            );
                            let master_target = DeleteTarget {
                                name: master,
                                where_fragments: vec![fragment],
                            };
                            cascade(conn, &master_target, part_integrity, deleted, visited_masters)?;
                        }
                        _ => {
                            cascade(conn, &child_target, part_integrity, deleted, visited_masters)?;
                        }
                    }
                }
            }
            Err(other) => return Err(other),
        }
    }
    Err(Error::invalid(
        "exceeded the maximum number of cascading delete attempts",
    ))
}

/// Determines which child tables block a delete: from the parsed FK error
/// when the engine names the constraint. On engines whose FK violations
/// carry no constraint detail (SQLite), the dependency graph stands in;
/// everywhere else a parse failure is fatal.
#[allow(clippy::type_complexity)]
fn blocking_children(
    conn: &Connection,
    target: &DeleteTarget,
    message: &str,
) -> Result<Vec<(QualifiedName, Vec<String>, Vec<String>)>> {
    let dialect = conn.dialect().clone();
    match dialect.parse_foreign_key_error(message) {
        Some(info) => {
            let child = if info.child.contains('.') {
                QualifiedName::parse(&info.child)?
            } else {
                QualifiedName::new(target.name.schema.clone(), info.child.clone())
            };
            if let (Some(fk_attrs), Some(pk_attrs)) = (&info.fk_attrs, &info.pk_attrs) {
                return Ok(vec![(child, fk_attrs.clone(), pk_attrs.clone())]);
            }
            // the message names the constraint but not its columns
            let rows = {
                let mut driver = conn.driver();
                dialect.constraint_info(driver.as_mut(), &info.constraint, &child)?
            };
            if rows.is_empty() {
                return Err(Error::invalid(format!(
                    "cascading delete failed: constraint `{}` on {child} reports no \
                     attribute mapping; make sure you have REFERENCES privilege on all \
                     dependent tables",
                    info.constraint
                )));
            }
            let fk_attrs: Vec<String> = rows.iter().map(|(fk, _, _)| fk.clone()).collect();
            let pk_attrs: Vec<String> = rows.iter().map(|(_, _, pk)| pk.clone()).collect();
            Ok(vec![(child, fk_attrs, pk_attrs)])
        }
        None if dialect.fk_errors_carry_detail() => {
            // the engine names constraints in its messages, so an
            // unparseable violation is not safe to cascade
            Err(Error::invalid(
                "cascading delete failed: the foreign key violation message is missing \
                 constraint information; make sure you have REFERENCES privilege on all \
                 dependent tables",
            ))
        }
        None => {
            // the engine reports no constraint detail: every child from
            // the dependency graph is a candidate
            let node = target.name.to_string();
            let children = conn.with_graph(false, |graph| graph.children(&node, None))?;
            let mut out = Vec::with_capacity(children.len());
            for (child, props) in children {
                let child_attrs: Vec<String> =
                    props.attr_map.iter().map(|(c, _)| c.clone()).collect();
                let parent_attrs: Vec<String> =
                    props.attr_map.iter().map(|(_, p)| p.clone()).collect();
                out.push((QualifiedName::parse(&child)?, child_attrs, parent_attrs));
            }
            Ok(out)
        }
    }
}

// ---------------------------------------------------------------------------

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Table")
            .field("name", &self.name.to_string())
            .field("tier", &self.tier)
            .field("attributes", &self.heading.names())
            .finish()
    }
}

/// Keeps only the primary-key fields of a row.
pub(crate) fn primary_key_of(heading: &Heading, row: &Row) -> Row {
    let mut key = Row::new();
    for name in heading.primary_key() {
        if let Some(value) = row.get(&name) {
            key.insert(name, value.clone());
        }
    }
    key
}

/// Restricts a query by another without the semantic lineage check; used
/// internally where FK structure already guarantees compatibility.
pub(crate) fn restrict_permissive(
    expr: &QueryExpression,
    condition: Restriction,
) -> Result<QueryExpression> {
    expr.restrict_with(condition, false)
}

/// Projects a query expression to the given attributes renamed from parent
/// names, for cascade and key-source plumbing.
pub(crate) fn proj_renamed(
    expr: &QueryExpression,
    attr_map: &[(String, String)],
) -> Result<QueryExpression> {
    let mut proj = Proj::none();
    for (child, parent) in attr_map {
        if child != parent {
            proj = proj.rename(child.clone(), parent.clone());
        }
    }
    expr.proj(proj)
}
