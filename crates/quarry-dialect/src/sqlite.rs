//! SQLite dialect and embedded driver.
//!
//! SQLite backs tests and single-machine pipelines. Schemas map onto
//! ATTACHed databases (in-memory or one file per schema under a base
//! directory). Two engine gaps are bridged dialect-side:
//!
//! - SQLite has no column comments, so the `:type:comment` annotations that
//!   heading reconstruction depends on are persisted in a hidden per-schema
//!   `~columns` table maintained by this dialect's DDL scripts.
//! - Foreign keys cannot reference tables in other attached databases, so
//!   cross-schema references are rendered against the bare parent table
//!   name and only hold within one schema.
//!
//! Its FK violation message ("FOREIGN KEY constraint failed") names no
//! constraint, so [`Dialect::parse_foreign_key_error`] returns `None` and
//! cascading delete falls back to the dependency graph.

use std::path::PathBuf;
use std::sync::Mutex;

use rusqlite::types::ValueRef;
use tracing::debug;

use quarry_core::declare::{is_constant_literal, AlterOp};
use quarry_core::error::{Error, Result};
use quarry_core::identifier::QualifiedName;
use quarry_core::types::CoreType;
use quarry_core::value::{Row, Value};

use crate::{
    int_field, job_metadata_columns, run, string_field, values_clause, ColumnDdl, ColumnInfo, Dialect, Driver, DriverError, DuplicateHandling,
    FkErrorInfo, ForeignKeyInfo, IndexInfo, TableDdl, TableInfo,
};

/// Hidden per-schema table carrying table and column comments.
const COLUMNS_TABLE: &str = "~columns";

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

/// Embedded driver over a rusqlite connection.
pub struct SqliteDriver {
    conn: Mutex<rusqlite::Connection>,
    connection_id: u64,
}

impl SqliteDriver {
    /// Opens an in-memory primary database; schemas attach as in-memory
    /// databases of their own.
    pub fn open_in_memory() -> Result<Self> {
        let conn = rusqlite::Connection::open_in_memory()
            .map_err(|e| Error::LostConnection(format!("failed to open in-memory db: {e}")))?;
        Self::from_connection(conn)
    }

    /// Opens a file-backed primary database.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let conn = rusqlite::Connection::open(&path).map_err(|e| {
            Error::LostConnection(format!("failed to open {}: {e}", path.display()))
        })?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: rusqlite::Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON; PRAGMA busy_timeout = 5000;")
            .map_err(|e| Error::LostConnection(format!("failed to set pragmas: {e}")))?;
        Ok(SqliteDriver {
            conn: Mutex::new(conn),
            connection_id: std::process::id() as u64,
        })
    }

    fn bind_params(params: &[Value]) -> std::result::Result<Vec<rusqlite::types::Value>, DriverError> {
        params.iter().map(lower_value).collect()
    }
}

fn lower_value(value: &Value) -> std::result::Result<rusqlite::types::Value, DriverError> {
    use rusqlite::types::Value as Sql;
    Ok(match value {
        Value::Null => Sql::Null,
        Value::Bool(b) => Sql::Integer(*b as i64),
        Value::Int(v) => Sql::Integer(*v),
        Value::Float(v) => Sql::Real(*v),
        Value::String(s) => Sql::Text(s.clone()),
        Value::Bytes(b) => Sql::Blob(b.clone()),
        Value::Uuid(u) => Sql::Blob(u.as_bytes().to_vec()),
        Value::Decimal(d) => Sql::Text(d.to_string()),
        Value::Date(d) => Sql::Text(d.format("%Y-%m-%d").to_string()),
        Value::Time(t) => Sql::Text(t.format("%H:%M:%S%.3f").to_string()),
        Value::DateTime(dt) => Sql::Text(dt.format("%Y-%m-%d %H:%M:%S%.3f").to_string()),
        Value::Json(j) => Sql::Text(j.to_string()),
        other => {
            return Err(DriverError::message(format!(
                "cannot bind {} value; encode it first",
                other.type_name()
            )));
        }
    })
}

fn lift_value(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(v) => Value::Int(v),
        ValueRef::Real(v) => Value::Float(v),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).to_string()),
        ValueRef::Blob(b) => Value::Bytes(b.to_vec()),
    }
}

fn driver_error(err: rusqlite::Error) -> DriverError {
    match &err {
        rusqlite::Error::SqliteFailure(code, message) => DriverError {
            code: Some(code.extended_code),
            sqlstate: None,
            message: message.clone().unwrap_or_else(|| code.to_string()),
        },
        other => DriverError::message(other.to_string()),
    }
}

impl Driver for SqliteDriver {
    fn execute(&mut self, sql: &str, params: &[Value]) -> std::result::Result<u64, DriverError> {
        debug!(sql, "execute");
        let lowered = Self::bind_params(params)?;
        let conn = self.conn.lock().expect("sqlite driver poisoned");
        let mut stmt = conn.prepare(sql).map_err(driver_error)?;
        stmt.execute(rusqlite::params_from_iter(lowered))
            .map(|n| n as u64)
            .map_err(driver_error)
    }

    fn query(&mut self, sql: &str, params: &[Value]) -> std::result::Result<Vec<Row>, DriverError> {
        debug!(sql, "query");
        let lowered = Self::bind_params(params)?;
        let conn = self.conn.lock().expect("sqlite driver poisoned");
        let mut stmt = conn.prepare(sql).map_err(driver_error)?;
        let names: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();
        let mut rows = stmt
            .query(rusqlite::params_from_iter(lowered))
            .map_err(driver_error)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().map_err(driver_error)? {
            let mut record = Row::new();
            for (i, name) in names.iter().enumerate() {
                let value = row.get_ref(i).map_err(driver_error)?;
                record.insert(name.clone(), lift_value(value));
            }
            out.push(record);
        }
        Ok(out)
    }

    fn ping(&mut self) -> std::result::Result<(), DriverError> {
        let conn = self.conn.lock().expect("sqlite driver poisoned");
        conn.query_row("SELECT 1", [], |_| Ok(()))
            .map_err(driver_error)
    }

    fn connection_id(&self) -> u64 {
        self.connection_id
    }
}

// ---------------------------------------------------------------------------
// Dialect
// ---------------------------------------------------------------------------

/// The SQLite dialect.
#[derive(Debug, Default, Clone)]
pub struct SqliteDialect {
    /// Base directory for one database file per schema; `None` attaches
    /// in-memory databases (test mode).
    pub base_dir: Option<PathBuf>,
}

impl SqliteDialect {
    /// In-memory schemas; everything vanishes with the connection.
    pub fn in_memory() -> Self {
        SqliteDialect { base_dir: None }
    }

    /// One `<schema>.db` file per schema under `base_dir`.
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        SqliteDialect {
            base_dir: Some(base_dir.into()),
        }
    }

    fn columns_table_ddl(&self, schema: &str) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {}.{} (\
             table_name TEXT NOT NULL, \
             column_name TEXT NOT NULL DEFAULT '', \
             comment TEXT NOT NULL, \
             PRIMARY KEY (table_name, column_name))",
            self.quote_ident(schema),
            self.quote_ident(COLUMNS_TABLE)
        )
    }

    fn comment_row(&self, schema: &str, table: &str, column: &str, comment: &str) -> String {
        format!(
            "INSERT OR REPLACE INTO {}.{} (table_name, column_name, comment) VALUES ({}, {}, {})",
            self.quote_ident(schema),
            self.quote_ident(COLUMNS_TABLE),
            self.string_literal(table),
            self.string_literal(column),
            self.string_literal(comment)
        )
    }

    fn render_default(&self, column: &ColumnDdl) -> String {
        match (&column.default, column.nullable) {
            (None, true) => " DEFAULT NULL".to_string(),
            (None, false) => " NOT NULL".to_string(),
            (Some(d), nullable) => {
                let rendered = if is_constant_literal(d) {
                    d.clone()
                } else {
                    self.string_literal(d)
                };
                if nullable {
                    format!(" DEFAULT {rendered}")
                } else {
                    format!(" NOT NULL DEFAULT {rendered}")
                }
            }
        }
    }

    fn column_type(&self, column: &ColumnDdl) -> String {
        match (&column.core_type, &column.native_type) {
            (Some(core), _) => self.core_type_to_sql(core),
            (None, Some(native)) => native.clone(),
            (None, None) => "longblob".to_string(),
        }
    }

    fn comments_for(&self, driver: &mut dyn Driver, name: &QualifiedName) -> Vec<(String, String)> {
        let sql = format!(
            "SELECT column_name AS col, comment AS c FROM {}.{} WHERE table_name=?",
            self.quote_ident(&name.schema),
            self.quote_ident(COLUMNS_TABLE)
        );
        match driver.query(&sql, &[Value::String(name.table.clone())]) {
            Ok(rows) => rows
                .iter()
                .filter_map(|r| {
                    Some((string_field(r, "col")?, string_field(r, "c").unwrap_or_default()))
                })
                .collect(),
            // schema predates any quarry table; no comments recorded
            Err(_) => Vec::new(),
        }
    }
}

impl Dialect for SqliteDialect {
    fn backend_name(&self) -> &'static str {
        "sqlite"
    }

    fn default_port(&self) -> u16 {
        0
    }

    fn quote_ident(&self, name: &str) -> String {
        format!("\"{}\"", name.replace('"', "\"\""))
    }

    fn string_literal(&self, value: &str) -> String {
        format!("'{}'", value.replace('\'', "''"))
    }

    fn bytes_literal(&self, value: &[u8]) -> String {
        let hex: String = value.iter().map(|b| format!("{b:02x}")).collect();
        format!("X'{hex}'")
    }

    fn placeholder(&self, _index: usize) -> String {
        "?".to_string()
    }

    fn core_type_to_sql(&self, core: &CoreType) -> String {
        match core {
            CoreType::Int8 => "tinyint".to_string(),
            CoreType::Int16 => "smallint".to_string(),
            CoreType::Int32 => "int".to_string(),
            CoreType::Int64 => "bigint".to_string(),
            CoreType::Float32 => "float".to_string(),
            CoreType::Float64 => "double".to_string(),
            CoreType::Bool => "tinyint".to_string(),
            CoreType::Uuid => "binary(16)".to_string(),
            CoreType::Bytes => "longblob".to_string(),
            // TEXT affinity keeps JSON documents and decimals exact
            CoreType::Json => "json_text".to_string(),
            CoreType::Date => "date".to_string(),
            CoreType::DateTime(None) => "datetime".to_string(),
            CoreType::DateTime(Some(p)) => format!("datetime({p})"),
            CoreType::Char(n) => format!("char({n})"),
            CoreType::Varchar(n) => format!("varchar({n})"),
            CoreType::Decimal(p, s) => format!("decimal_text({p},{s})"),
            // the CHECK constraint is appended by format_column
            CoreType::Enum(_) => "text".to_string(),
        }
    }

    fn sql_type_to_core(&self, sql_type: &str) -> Option<CoreType> {
        let lower = sql_type.trim().to_ascii_lowercase();
        Some(match lower.as_str() {
            "tinyint" => CoreType::Int8,
            "smallint" => CoreType::Int16,
            "int" | "integer" => CoreType::Int32,
            "bigint" => CoreType::Int64,
            "float" => CoreType::Float32,
            "double" => CoreType::Float64,
            "binary(16)" => CoreType::Uuid,
            "longblob" => CoreType::Bytes,
            "json_text" => CoreType::Json,
            "date" => CoreType::Date,
            "datetime" => CoreType::DateTime(None),
            _ => {
                if let Some(rest) = lower.strip_prefix("decimal_text(") {
                    let mut parts = rest.trim_end_matches(')').splitn(2, ',');
                    let p = parts.next()?.trim().parse().ok()?;
                    let s = parts.next()?.trim().parse().ok()?;
                    return Some(CoreType::Decimal(p, s));
                }
                return CoreType::parse(&lower);
            }
        })
    }

    fn validate_native_type(&self, type_str: &str) -> bool {
        !type_str.to_ascii_lowercase().contains("auto_increment")
    }

    fn create_schema(&self, schema: &str) -> Vec<String> {
        let location = match &self.base_dir {
            Some(dir) => dir.join(format!("{schema}.db")).display().to_string(),
            None => ":memory:".to_string(),
        };
        vec![format!(
            "ATTACH DATABASE {} AS {}",
            self.string_literal(&location),
            self.quote_ident(schema)
        )]
    }

    fn drop_schema(&self, schema: &str) -> Vec<String> {
        // detaching discards in-memory schemas; file-backed schemas keep
        // their file, which the operator removes
        vec![format!("DETACH DATABASE {}", self.quote_ident(schema))]
    }

    fn create_table(&self, ddl: &TableDdl) -> Vec<String> {
        let mut lines: Vec<String> = ddl
            .columns
            .iter()
            .map(|c| self.format_column(&ddl.name, c))
            .collect();
        lines.push(format!(
            "PRIMARY KEY ({})",
            ddl.primary_key
                .iter()
                .map(|k| self.quote_ident(k))
                .collect::<Vec<_>>()
                .join(",")
        ));
        for fk in &ddl.foreign_keys {
            // parent is unqualified: SQLite FKs hold within one database
            lines.push(format!(
                "FOREIGN KEY ({}) REFERENCES {} ({}) ON UPDATE CASCADE ON DELETE RESTRICT",
                fk.fk_attrs
                    .iter()
                    .map(|a| self.quote_ident(a))
                    .collect::<Vec<_>>()
                    .join(","),
                self.quote_ident(&fk.parent.table),
                fk.pk_attrs
                    .iter()
                    .map(|a| self.quote_ident(a))
                    .collect::<Vec<_>>()
                    .join(",")
            ));
        }
        let mut script = vec![
            format!(
                "CREATE TABLE IF NOT EXISTS {} (\n{}\n)",
                self.quote_qualified(&ddl.name),
                lines.join(",\n")
            ),
            self.columns_table_ddl(&ddl.name.schema),
            self.comment_row(&ddl.name.schema, &ddl.name.table, "", &ddl.comment),
        ];
        for column in &ddl.columns {
            if !column.comment.is_empty() {
                script.push(self.comment_row(
                    &ddl.name.schema,
                    &ddl.name.table,
                    &column.name,
                    &column.comment,
                ));
            }
        }
        for index in &ddl.indexes {
            let index_name = format!("idx_{}_{}", ddl.name.table, index.attributes.join("_"));
            script.push(format!(
                "CREATE {}INDEX IF NOT EXISTS {}.{} ON {} ({})",
                if index.unique { "UNIQUE " } else { "" },
                self.quote_ident(&ddl.name.schema),
                self.quote_ident(&index_name),
                self.quote_ident(&ddl.name.table),
                index
                    .attributes
                    .iter()
                    .map(|a| self.quote_ident(a))
                    .collect::<Vec<_>>()
                    .join(",")
            ));
        }
        script
    }

    fn drop_table(&self, name: &QualifiedName) -> Vec<String> {
        vec![
            format!("DROP TABLE {}", self.quote_qualified(name)),
            self.columns_table_ddl(&name.schema),
            format!(
                "DELETE FROM {}.{} WHERE table_name={}",
                self.quote_ident(&name.schema),
                self.quote_ident(COLUMNS_TABLE),
                self.string_literal(&name.table)
            ),
        ]
    }

    fn alter_table(
        &self,
        name: &QualifiedName,
        ops: &[AlterOp],
        new_comment: Option<&str>,
    ) -> Result<Vec<String>> {
        let mut script = Vec::new();
        for op in ops {
            match op {
                AlterOp::Add { definition, .. } => script.push(format!(
                    "ALTER TABLE {} ADD COLUMN {definition}",
                    self.quote_qualified(name)
                )),
                AlterOp::Drop { name: column } => script.push(format!(
                    "ALTER TABLE {} DROP COLUMN {}",
                    self.quote_qualified(name),
                    self.quote_ident(column)
                )),
                AlterOp::Modify { .. } | AlterOp::Change { .. } => {
                    return Err(Error::declaration(
                        "altering column definitions is not supported on SQLite; \
                         drop and re-add the column"
                            .to_string(),
                    ));
                }
            }
        }
        if let Some(comment) = new_comment {
            script.push(self.comment_row(&name.schema, &name.table, "", comment));
        }
        Ok(script)
    }

    fn format_column(&self, _table: &QualifiedName, column: &ColumnDdl) -> String {
        let mut out = format!(
            "{} {}{}",
            self.quote_ident(&column.name),
            self.column_type(column),
            self.render_default(column)
        );
        if let Some(CoreType::Enum(values)) = &column.core_type {
            out.push_str(&format!(
                " CHECK ({} IN ({}))",
                self.quote_ident(&column.name),
                values
                    .iter()
                    .map(|v| self.string_literal(v))
                    .collect::<Vec<_>>()
                    .join(",")
            ));
        }
        out
    }

    fn job_metadata_columns(&self) -> Vec<ColumnDdl> {
        job_metadata_columns()
    }

    fn insert_sql(
        &self,
        table: &QualifiedName,
        columns: &[String],
        n_rows: usize,
        duplicate: DuplicateHandling,
        primary_key: &[String],
    ) -> String {
        let quoted_cols = columns
            .iter()
            .map(|c| self.quote_ident(c))
            .collect::<Vec<_>>()
            .join(",");
        let values = values_clause(self, columns.len(), n_rows);
        let verb = match duplicate {
            DuplicateHandling::Skip => "INSERT OR IGNORE",
            DuplicateHandling::Replace => "INSERT OR REPLACE",
            _ => "INSERT",
        };
        let mut sql = format!(
            "{verb} INTO {} ({quoted_cols}) VALUES {values}",
            self.quote_qualified(table)
        );
        if duplicate == DuplicateHandling::Update {
            let conflict_target = primary_key
                .iter()
                .map(|k| self.quote_ident(k))
                .collect::<Vec<_>>()
                .join(",");
            let updates = columns
                .iter()
                .filter(|c| !primary_key.contains(c))
                .map(|c| {
                    let c = self.quote_ident(c);
                    format!("{c}=excluded.{c}")
                })
                .collect::<Vec<_>>()
                .join(",");
            if updates.is_empty() {
                sql.push_str(&format!(" ON CONFLICT ({conflict_target}) DO NOTHING"));
            } else {
                sql.push_str(&format!(
                    " ON CONFLICT ({conflict_target}) DO UPDATE SET {updates}"
                ));
            }
        }
        sql
    }

    fn insert_from_select(
        &self,
        table: &QualifiedName,
        columns: &[String],
        select_sql: &str,
        duplicate: DuplicateHandling,
        _primary_key: &[String],
    ) -> String {
        let quoted_cols = columns
            .iter()
            .map(|c| self.quote_ident(c))
            .collect::<Vec<_>>()
            .join(",");
        let verb = match duplicate {
            DuplicateHandling::Skip => "INSERT OR IGNORE",
            DuplicateHandling::Replace => "INSERT OR REPLACE",
            _ => "INSERT",
        };
        format!(
            "{verb} INTO {} ({quoted_cols}) {select_sql}",
            self.quote_qualified(table)
        )
    }

    fn update_sql(&self, table: &QualifiedName, set: &[String], wher: &[String]) -> String {
        format!(
            "UPDATE {} SET {} WHERE {}",
            self.quote_qualified(table),
            set.iter()
                .map(|c| format!("{}=?", self.quote_ident(c)))
                .collect::<Vec<_>>()
                .join(","),
            wher.iter()
                .map(|c| format!("{}=?", self.quote_ident(c)))
                .collect::<Vec<_>>()
                .join(" AND ")
        )
    }

    /// SQLite has no `DEFAULT` token in UPDATE; the stored default text is
    /// inlined instead (bare for SQL constants, quoted otherwise).
    fn update_default_expr(&self, default: &str) -> String {
        if is_constant_literal(default) {
            default.to_string()
        } else {
            self.string_literal(default)
        }
    }

    fn start_transaction_sql(&self) -> &'static str {
        "BEGIN"
    }

    fn current_timestamp(&self, _precision: Option<u8>) -> String {
        "strftime('%Y-%m-%d %H:%M:%f','now')".to_string()
    }

    fn interval(&self, value: i64, unit: &str) -> String {
        format!("'{value} {}s'", unit.to_ascii_lowercase())
    }

    fn now_plus_seconds(&self, seconds: f64) -> String {
        if seconds == 0.0 {
            self.current_timestamp(None)
        } else {
            format!("strftime('%Y-%m-%d %H:%M:%f','now','{seconds:+} seconds')")
        }
    }

    fn json_path(&self, column_sql: &str, path: &str, _return_type: Option<&str>) -> String {
        format!("json_extract({column_sql}, '$.{path}')")
    }

    fn list_schemas(&self, driver: &mut dyn Driver) -> Result<Vec<String>> {
        let rows = run(self, driver, "PRAGMA database_list", &[])?;
        Ok(rows
            .into_iter()
            .filter_map(|r| string_field(&r, "name"))
            .filter(|n| n != "main" && n != "temp")
            .collect())
    }

    fn list_tables(&self, driver: &mut dyn Driver, schema: &str) -> Result<Vec<String>> {
        let sql = format!(
            "SELECT name AS n FROM {}.sqlite_master \
             WHERE type='table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
            self.quote_ident(schema)
        );
        let rows = run(self, driver, &sql, &[])?;
        Ok(rows.into_iter().filter_map(|r| string_field(&r, "n")).collect())
    }

    fn table_info(
        &self,
        driver: &mut dyn Driver,
        name: &QualifiedName,
    ) -> Result<Option<TableInfo>> {
        let sql = format!(
            "SELECT name AS n FROM {}.sqlite_master WHERE type='table' AND name=?",
            self.quote_ident(&name.schema)
        );
        let rows = run(self, driver, &sql, &[Value::String(name.table.clone())])?;
        if rows.is_empty() {
            return Ok(None);
        }
        let comment = self
            .comments_for(driver, name)
            .into_iter()
            .find(|(col, _)| col.is_empty())
            .map(|(_, c)| c)
            .unwrap_or_default();
        Ok(Some(TableInfo { comment }))
    }

    fn columns(&self, driver: &mut dyn Driver, name: &QualifiedName) -> Result<Vec<ColumnInfo>> {
        let comments = self.comments_for(driver, name);
        let rows = run(
            self,
            driver,
            "SELECT name, type AS ctype, \"notnull\" AS nn, dflt_value AS dflt, pk \
             FROM pragma_table_info(?, ?) ORDER BY cid",
            &[
                Value::String(name.table.clone()),
                Value::String(name.schema.clone()),
            ],
        )?;
        Ok(rows
            .iter()
            .map(|r| {
                let column = string_field(r, "name").unwrap_or_default();
                let comment = comments
                    .iter()
                    .find(|(col, _)| *col == column)
                    .map(|(_, c)| c.clone())
                    .unwrap_or_default();
                ColumnInfo {
                    sql_type: string_field(r, "ctype").unwrap_or_default(),
                    nullable: int_field(r, "nn") == Some(0),
                    default: string_field(r, "dflt")
                        .map(|d| d.trim_matches('\'').to_string()),
                    comment,
                    in_key: int_field(r, "pk").unwrap_or(0) > 0,
                    autoincrement: false,
                    name: column,
                }
            })
            .collect())
    }

    fn primary_key(&self, driver: &mut dyn Driver, name: &QualifiedName) -> Result<Vec<String>> {
        let rows = run(
            self,
            driver,
            "SELECT name, pk FROM pragma_table_info(?, ?) WHERE pk > 0 ORDER BY pk",
            &[
                Value::String(name.table.clone()),
                Value::String(name.schema.clone()),
            ],
        )?;
        Ok(rows.into_iter().filter_map(|r| string_field(&r, "name")).collect())
    }

    fn foreign_keys(&self, driver: &mut dyn Driver, schema: &str) -> Result<Vec<ForeignKeyInfo>> {
        let mut out: Vec<ForeignKeyInfo> = Vec::new();
        for table in self.list_tables(driver, schema)? {
            let rows = run(
                self,
                driver,
                "SELECT id, \"table\" AS parent, \"from\" AS child_attr, \"to\" AS parent_attr \
                 FROM pragma_foreign_key_list(?, ?) ORDER BY id, seq",
                &[
                    Value::String(table.clone()),
                    Value::String(schema.to_string()),
                ],
            )?;
            for r in &rows {
                let id = int_field(r, "id").unwrap_or(0);
                let constraint = format!("fk_{table}_{id}");
                let parent = QualifiedName::new(
                    schema,
                    string_field(r, "parent").unwrap_or_default(),
                );
                let pair = (
                    string_field(r, "child_attr").unwrap_or_default(),
                    string_field(r, "parent_attr").unwrap_or_default(),
                );
                match out.last_mut() {
                    Some(fk) if fk.constraint == constraint => fk.attr_map.push(pair),
                    _ => out.push(ForeignKeyInfo {
                        constraint,
                        child: QualifiedName::new(schema, table.clone()),
                        parent,
                        attr_map: vec![pair],
                    }),
                }
            }
        }
        Ok(out)
    }

    fn indexes(&self, driver: &mut dyn Driver, name: &QualifiedName) -> Result<Vec<IndexInfo>> {
        let index_rows = run(
            self,
            driver,
            "SELECT name AS iname, \"unique\" AS uniq, origin \
             FROM pragma_index_list(?, ?) ORDER BY seq",
            &[
                Value::String(name.table.clone()),
                Value::String(name.schema.clone()),
            ],
        )?;
        let mut out = Vec::new();
        for r in &index_rows {
            if string_field(r, "origin").as_deref() == Some("pk") {
                continue;
            }
            let iname = string_field(r, "iname").unwrap_or_default();
            let column_rows = run(
                self,
                driver,
                "SELECT name AS col FROM pragma_index_info(?, ?) ORDER BY seqno",
                &[
                    Value::String(iname.clone()),
                    Value::String(name.schema.clone()),
                ],
            )?;
            out.push(IndexInfo {
                name: iname,
                unique: int_field(r, "uniq") == Some(1),
                columns: column_rows
                    .into_iter()
                    .filter_map(|r| string_field(&r, "col"))
                    .collect(),
            });
        }
        Ok(out)
    }

    fn constraint_info(
        &self,
        driver: &mut dyn Driver,
        constraint: &str,
        child: &QualifiedName,
    ) -> Result<Vec<(String, String, String)>> {
        // synthesized constraint names are fk_<table>_<id>
        let id: i64 = constraint
            .rsplit('_')
            .next()
            .and_then(|s| s.parse().ok())
            .unwrap_or(-1);
        let rows = run(
            self,
            driver,
            "SELECT \"table\" AS parent, \"from\" AS child_attr, \"to\" AS parent_attr \
             FROM pragma_foreign_key_list(?, ?) WHERE id=? ORDER BY seq",
            &[
                Value::String(child.table.clone()),
                Value::String(child.schema.clone()),
                Value::Int(id),
            ],
        )?;
        Ok(rows
            .iter()
            .map(|r| {
                (
                    string_field(r, "child_attr").unwrap_or_default(),
                    format!(
                        "{}.{}",
                        child.schema,
                        string_field(r, "parent").unwrap_or_default()
                    ),
                    string_field(r, "parent_attr").unwrap_or_default(),
                )
            })
            .collect())
    }

    fn fk_errors_carry_detail(&self) -> bool {
        false
    }

    fn parse_foreign_key_error(&self, _message: &str) -> Option<FkErrorInfo> {
        // "FOREIGN KEY constraint failed" carries no constraint detail
        None
    }

    fn translate_error(&self, error: DriverError, query: &str) -> Error {
        match error.code {
            Some(787 | 1811) => Error::Integrity(error.message),
            Some(1555 | 2067) => Error::Duplicate(error.message),
            Some(1299) => Error::MissingAttribute(error.message),
            Some(19) => {
                if error.message.to_ascii_uppercase().contains("FOREIGN KEY") {
                    Error::Integrity(error.message)
                } else {
                    Error::Duplicate(error.message)
                }
            }
            _ => {
                let lower = error.message.to_ascii_lowercase();
                if lower.contains("no such table") {
                    Error::MissingTable(error.message)
                } else if lower.contains("no such column") || lower.contains("has no column named")
                {
                    Error::UnknownAttribute(error.message)
                } else if lower.contains("syntax error") {
                    Error::QuerySyntax {
                        message: error.message,
                        query: query.to_string(),
                    }
                } else {
                    Error::Invalid(error.message)
                }
            }
        }
    }
}
