//! Backend adapters: the [`Driver`] and [`Dialect`] traits and their
//! implementations.
//!
//! A `Driver` executes SQL over one live connection; a `Dialect` knows how
//! to spell SQL for a particular engine and how to translate its errors
//! into the uniform taxonomy. Every other crate in the workspace emits
//! generic constructs (core types, qualified names, parameter values) and
//! lets the dialect render them.
//!
//! In-tree dialects: MySQL and PostgreSQL (pure SQL generators whose
//! drivers are supplied by the embedding application) and SQLite (with an
//! embedded [`SqliteDriver`] over rusqlite, used by tests and local
//! pipelines).

pub mod mysql;
pub mod postgres;
pub mod sqlite;

use quarry_core::declare::AlterOp;
use quarry_core::error::Result;
use quarry_core::heading::IndexSpec;
use quarry_core::identifier::QualifiedName;
use quarry_core::types::CoreType;
use quarry_core::value::{Row, Value};

pub use mysql::MySqlDialect;
pub use postgres::PostgresDialect;
pub use sqlite::{SqliteDialect, SqliteDriver};

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

/// A raw error from a database driver, before dialect translation.
#[derive(Debug, Clone)]
pub struct DriverError {
    /// Numeric error code (MySQL errno, SQLite extended code).
    pub code: Option<i32>,
    /// Five-character SQLSTATE where the driver reports one (PostgreSQL).
    pub sqlstate: Option<String>,
    pub message: String,
}

impl DriverError {
    pub fn message(message: impl Into<String>) -> Self {
        DriverError {
            code: None,
            sqlstate: None,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for DriverError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

/// One live database connection.
///
/// Implemented in-tree for SQLite; MySQL and PostgreSQL applications
/// implement this over their preferred client crate and pair it with the
/// matching dialect.
pub trait Driver: Send {
    /// Executes a statement, returning the number of affected rows.
    fn execute(&mut self, sql: &str, params: &[Value]) -> std::result::Result<u64, DriverError>;

    /// Runs a query, returning rows keyed by column name.
    fn query(&mut self, sql: &str, params: &[Value]) -> std::result::Result<Vec<Row>, DriverError>;

    /// Checks that the connection is alive.
    fn ping(&mut self) -> std::result::Result<(), DriverError>;

    /// The backend's identifier for this connection (process id).
    fn connection_id(&self) -> u64;
}

// ---------------------------------------------------------------------------
// Introspection records
// ---------------------------------------------------------------------------

/// One column as reported by introspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    pub name: String,
    pub sql_type: String,
    pub nullable: bool,
    pub default: Option<String>,
    pub comment: String,
    pub in_key: bool,
    pub autoincrement: bool,
}

/// One foreign key constraint as reported by introspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKeyInfo {
    pub constraint: String,
    pub child: QualifiedName,
    pub parent: QualifiedName,
    /// `child attribute -> parent attribute`, in constraint order.
    pub attr_map: Vec<(String, String)>,
}

/// One secondary index as reported by introspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexInfo {
    pub name: String,
    pub unique: bool,
    pub columns: Vec<String>,
}

/// Table-level status from introspection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableInfo {
    pub comment: String,
}

/// Parsed detail from a foreign-key violation message, used by cascading
/// delete to learn which child blocks a parent deletion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FkErrorInfo {
    /// Child table, `schema.table` or bare `table` when the message omits
    /// the schema.
    pub child: String,
    pub constraint: String,
    pub fk_attrs: Option<Vec<String>>,
    pub parent: Option<String>,
    pub pk_attrs: Option<Vec<String>>,
}

// ---------------------------------------------------------------------------
// DDL inputs
// ---------------------------------------------------------------------------

/// One column definition handed to the dialect for rendering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDdl {
    pub name: String,
    /// Core type when portable; dialects map it to their spelling.
    pub core_type: Option<CoreType>,
    /// Native SQL type used verbatim when `core_type` is `None`.
    pub native_type: Option<String>,
    pub nullable: bool,
    /// Default literal: already-quoted strings or bare SQL constants.
    pub default: Option<String>,
    pub comment: String,
}

/// One foreign key clause handed to the dialect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKeyDdl {
    pub fk_attrs: Vec<String>,
    pub parent: QualifiedName,
    pub pk_attrs: Vec<String>,
}

/// A complete CREATE TABLE request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDdl {
    pub name: QualifiedName,
    pub columns: Vec<ColumnDdl>,
    pub primary_key: Vec<String>,
    pub foreign_keys: Vec<ForeignKeyDdl>,
    pub indexes: Vec<IndexSpec>,
    pub comment: String,
}

/// Duplicate-row handling for INSERT statements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicateHandling {
    /// Surface the duplicate as an error.
    Error,
    /// Skip rows whose primary key already exists.
    Skip,
    /// Replace existing rows.
    Replace,
    /// Update non-key columns of existing rows (upsert).
    Update,
}

// ---------------------------------------------------------------------------
// Dialect
// ---------------------------------------------------------------------------

/// SQL generation, type mapping, introspection, and error translation for
/// one database engine.
pub trait Dialect: Send + Sync {
    fn backend_name(&self) -> &'static str;

    fn default_port(&self) -> u16;

    // -- Quoting and literals -----------------------------------------------

    /// Quotes an identifier (backticks for MySQL, double quotes elsewhere).
    fn quote_ident(&self, name: &str) -> String;

    /// Quotes a `schema.table` pair.
    fn quote_qualified(&self, name: &QualifiedName) -> String {
        format!(
            "{}.{}",
            self.quote_ident(&name.schema),
            self.quote_ident(&name.table)
        )
    }

    /// Renders a string literal with dialect-appropriate escaping.
    fn string_literal(&self, value: &str) -> String;

    /// Renders a binary literal (`X'..'` or `'\x..'::bytea`).
    fn bytes_literal(&self, value: &[u8]) -> String;

    /// Parameter placeholder for the n-th (0-based) bound value.
    fn placeholder(&self, index: usize) -> String;

    // -- Type mapping --------------------------------------------------------

    /// Maps a core type to this engine's SQL spelling.
    fn core_type_to_sql(&self, core: &CoreType) -> String;

    /// Maps an SQL type back to a core type where a clean inverse exists.
    fn sql_type_to_core(&self, sql_type: &str) -> Option<CoreType>;

    /// Whether a native type string is acceptable on this engine.
    fn validate_native_type(&self, type_str: &str) -> bool;

    // -- DDL -----------------------------------------------------------------

    /// Statements creating a schema (database).
    fn create_schema(&self, schema: &str) -> Vec<String>;

    /// Statements dropping a schema and everything in it.
    fn drop_schema(&self, schema: &str) -> Vec<String>;

    /// The full script creating a table: enum types, the CREATE TABLE, any
    /// out-of-line comments and indexes, in execution order.
    fn create_table(&self, ddl: &TableDdl) -> Vec<String>;

    /// Statements dropping a table (and its dialect-side metadata).
    fn drop_table(&self, name: &QualifiedName) -> Vec<String>;

    /// Statements applying ALTER operations produced by the declaration
    /// differ, plus an optional table comment change. Errors when the
    /// engine cannot express an operation (e.g. MODIFY on SQLite).
    fn alter_table(
        &self,
        name: &QualifiedName,
        ops: &[AlterOp],
        new_comment: Option<&str>,
    ) -> Result<Vec<String>>;

    /// Renders one column definition (without trailing comma).
    fn format_column(&self, table: &QualifiedName, column: &ColumnDdl) -> String;

    /// Hidden job-metadata columns appended to auto-populated tables.
    fn job_metadata_columns(&self) -> Vec<ColumnDdl>;

    // -- DML -----------------------------------------------------------------

    /// A multi-row INSERT with placeholders and duplicate handling.
    fn insert_sql(
        &self,
        table: &QualifiedName,
        columns: &[String],
        n_rows: usize,
        duplicate: DuplicateHandling,
        primary_key: &[String],
    ) -> String;

    /// Inserts one all-defaults row (every column takes its default).
    fn insert_default_row_sql(&self, table: &QualifiedName) -> String {
        format!("INSERT INTO {} DEFAULT VALUES", self.quote_qualified(table))
    }

    /// An `INSERT ... SELECT` from a compiled subquery, with the same
    /// duplicate handling as [`Dialect::insert_sql`].
    fn insert_from_select(
        &self,
        table: &QualifiedName,
        columns: &[String],
        select_sql: &str,
        duplicate: DuplicateHandling,
        primary_key: &[String],
    ) -> String;

    /// A single-row UPDATE with placeholders for SET and WHERE columns.
    fn update_sql(&self, table: &QualifiedName, set: &[String], wher: &[String]) -> String;

    /// SET-clause expression resetting a column to its declared default.
    /// Engines with a `DEFAULT` token in UPDATE ignore the stored default
    /// text and let the database evaluate the real default.
    fn update_default_expr(&self, default: &str) -> String {
        let _ = default;
        "DEFAULT".to_string()
    }

    /// A DELETE without a WHERE clause (the caller appends one).
    fn delete_sql(&self, table: &QualifiedName) -> String {
        format!("DELETE FROM {}", self.quote_qualified(table))
    }

    // -- Transactions --------------------------------------------------------

    fn start_transaction_sql(&self) -> &'static str;

    fn commit_sql(&self) -> &'static str {
        "COMMIT"
    }

    fn rollback_sql(&self) -> &'static str {
        "ROLLBACK"
    }

    // -- Expressions ---------------------------------------------------------

    /// Current timestamp with optional fractional precision.
    fn current_timestamp(&self, precision: Option<u8>) -> String;

    /// An interval expression, e.g. `INTERVAL 5 SECOND`.
    fn interval(&self, value: i64, unit: &str) -> String;

    /// Current time plus a number of seconds, for job scheduling.
    fn now_plus_seconds(&self, seconds: f64) -> String;

    /// JSON-path extraction over a quoted column expression.
    fn json_path(&self, column_sql: &str, path: &str, return_type: Option<&str>) -> String;

    // -- Introspection -------------------------------------------------------

    fn list_schemas(&self, driver: &mut dyn Driver) -> Result<Vec<String>>;

    fn list_tables(&self, driver: &mut dyn Driver, schema: &str) -> Result<Vec<String>>;

    /// Table-level info, `None` when the table does not exist.
    fn table_info(
        &self,
        driver: &mut dyn Driver,
        name: &QualifiedName,
    ) -> Result<Option<TableInfo>>;

    fn columns(&self, driver: &mut dyn Driver, name: &QualifiedName) -> Result<Vec<ColumnInfo>>;

    fn primary_key(&self, driver: &mut dyn Driver, name: &QualifiedName) -> Result<Vec<String>>;

    /// All foreign keys declared by tables of a schema (including those
    /// referencing other schemas).
    fn foreign_keys(&self, driver: &mut dyn Driver, schema: &str) -> Result<Vec<ForeignKeyInfo>>;

    fn indexes(&self, driver: &mut dyn Driver, name: &QualifiedName) -> Result<Vec<IndexInfo>>;

    /// Constraint lookup used during cascade delete when the FK error
    /// message lacks attribute detail: returns
    /// `(fk_attr, parent schema.table, pk_attr)` rows.
    fn constraint_info(
        &self,
        driver: &mut dyn Driver,
        constraint: &str,
        child: &QualifiedName,
    ) -> Result<Vec<(String, String, String)>>;

    // -- Errors --------------------------------------------------------------

    /// Whether this engine's FK violation messages identify the blocking
    /// constraint. When false (SQLite), cascading delete falls back to the
    /// dependency graph; when true, a message that fails to parse is a
    /// fatal error.
    fn fk_errors_carry_detail(&self) -> bool {
        true
    }

    /// Parses a foreign-key violation message into its parts, `None` when
    /// the message does not match this engine's FK error shape.
    fn parse_foreign_key_error(&self, message: &str) -> Option<FkErrorInfo>;

    /// Translates a raw driver error into the uniform taxonomy.
    fn translate_error(&self, error: DriverError, query: &str) -> quarry_core::Error;
}

/// The hidden columns recording per-row job execution metadata; shared by
/// the dialects modulo type spelling.
pub(crate) fn job_metadata_columns() -> Vec<ColumnDdl> {
    vec![
        ColumnDdl {
            name: "_job_start_time".to_string(),
            core_type: Some(CoreType::DateTime(Some(3))),
            native_type: None,
            nullable: true,
            default: None,
            comment: String::new(),
        },
        ColumnDdl {
            name: "_job_duration".to_string(),
            core_type: Some(CoreType::Float32),
            native_type: None,
            nullable: true,
            default: None,
            comment: String::new(),
        },
        ColumnDdl {
            name: "_job_version".to_string(),
            core_type: Some(CoreType::Varchar(64)),
            native_type: None,
            nullable: true,
            default: Some(String::new()),
            comment: String::new(),
        },
    ]
}

/// Runs an introspection query, translating driver errors.
pub(crate) fn run(
    dialect: &dyn Dialect,
    driver: &mut dyn Driver,
    sql: &str,
    params: &[Value],
) -> Result<Vec<quarry_core::value::Row>> {
    driver
        .query(sql, params)
        .map_err(|e| dialect.translate_error(e, sql))
}

/// Extracts a string field from an introspection row.
pub(crate) fn string_field(row: &quarry_core::value::Row, name: &str) -> Option<String> {
    match row.get(name) {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Bytes(b)) => Some(String::from_utf8_lossy(b).to_string()),
        Some(Value::Int(v)) => Some(v.to_string()),
        _ => None,
    }
}

/// Extracts an integer field from an introspection row.
pub(crate) fn int_field(row: &quarry_core::value::Row, name: &str) -> Option<i64> {
    match row.get(name) {
        Some(Value::Int(v)) => Some(*v),
        Some(Value::String(s)) => s.parse().ok(),
        _ => None,
    }
}

/// Renders `(?,?,...),(?,?,...)` placeholder tuples shared by the dialects.
pub(crate) fn values_clause(dialect: &dyn Dialect, n_columns: usize, n_rows: usize) -> String {
    let mut out = String::new();
    let mut index = 0;
    for r in 0..n_rows {
        if r > 0 {
            out.push(',');
        }
        out.push('(');
        for c in 0..n_columns {
            if c > 0 {
                out.push(',');
            }
            out.push_str(&dialect.placeholder(index));
            index += 1;
        }
        out.push(')');
    }
    out
}
