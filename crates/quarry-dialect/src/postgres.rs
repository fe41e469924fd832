//! PostgreSQL dialect. Schemas map to PostgreSQL schemas within one
//! database; enums become named types; comments use `COMMENT ON`. The
//! driver is supplied by the embedding application.

use std::sync::LazyLock;

use regex::Regex;

use quarry_core::declare::{is_constant_literal, AlterOp};
use quarry_core::error::{Error, Result};
use quarry_core::identifier::QualifiedName;
use quarry_core::types::CoreType;
use quarry_core::value::Value;

use crate::{
    int_field, job_metadata_columns, run, string_field, values_clause, ColumnDdl, ColumnInfo, Dialect, Driver, DriverError, DuplicateHandling,
    FkErrorInfo, ForeignKeyInfo, IndexInfo, TableDdl, TableInfo,
};

/// The PostgreSQL dialect.
#[derive(Debug, Default, Clone, Copy)]
pub struct PostgresDialect;

static FK_ERROR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"update or delete on table "(?P<parent>[^"]+)" violates foreign key constraint "(?P<name>[^"]+)" on table "(?P<child>[^"]+)""#,
    )
    .expect("postgres fk regex")
});

static FK_DETAIL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Key \((?P<cols>[^)]+)\)=").expect("postgres fk detail regex")
});

impl PostgresDialect {
    /// Name of the enum type generated for a column.
    fn enum_type_name(&self, table: &QualifiedName, column: &str) -> String {
        format!("{}_{column}_t", table.table.trim_start_matches(['#', '_']))
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

    fn column_type(&self, table: &QualifiedName, column: &ColumnDdl) -> String {
        match (&column.core_type, &column.native_type) {
            (Some(CoreType::Enum(_)), _) => format!(
                "{}.{}",
                self.quote_ident(&table.schema),
                self.quote_ident(&self.enum_type_name(table, &column.name))
            ),
            (Some(core), _) => self.core_type_to_sql(core),
            (None, Some(native)) => native.clone(),
            (None, None) => "bytea".to_string(),
        }
    }
}

impl Dialect for PostgresDialect {
    fn backend_name(&self) -> &'static str {
        "postgresql"
    }

    fn default_port(&self) -> u16 {
        5432
    }

    fn quote_ident(&self, name: &str) -> String {
        format!("\"{}\"", name.replace('"', "\"\""))
    }

    fn string_literal(&self, value: &str) -> String {
        format!("'{}'", value.replace('\'', "''"))
    }

    fn bytes_literal(&self, value: &[u8]) -> String {
        let hex: String = value.iter().map(|b| format!("{b:02x}")).collect();
        format!("'\\x{hex}'::bytea")
    }

    fn placeholder(&self, index: usize) -> String {
        format!("${}", index + 1)
    }

    fn core_type_to_sql(&self, core: &CoreType) -> String {
        match core {
            CoreType::Int8 => "smallint".to_string(),
            CoreType::Int16 => "smallint".to_string(),
            CoreType::Int32 => "integer".to_string(),
            CoreType::Int64 => "bigint".to_string(),
            CoreType::Float32 => "real".to_string(),
            CoreType::Float64 => "double precision".to_string(),
            CoreType::Bool => "boolean".to_string(),
            CoreType::Uuid => "uuid".to_string(),
            CoreType::Bytes => "bytea".to_string(),
            CoreType::Json => "jsonb".to_string(),
            CoreType::Date => "date".to_string(),
            CoreType::DateTime(None) => "timestamp".to_string(),
            CoreType::DateTime(Some(p)) => format!("timestamp({p})"),
            CoreType::Char(n) => format!("char({n})"),
            CoreType::Varchar(n) => format!("varchar({n})"),
            CoreType::Decimal(p, s) => format!("numeric({p},{s})"),
            // named type; rendering happens in column_type with the table
            CoreType::Enum(_) => "text".to_string(),
        }
    }

    fn sql_type_to_core(&self, sql_type: &str) -> Option<CoreType> {
        let lower = sql_type.trim().to_ascii_lowercase();
        Some(match lower.as_str() {
            "smallint" | "int2" => CoreType::Int16,
            "integer" | "int4" => CoreType::Int32,
            "bigint" | "int8" => CoreType::Int64,
            "real" | "float4" => CoreType::Float32,
            "double precision" | "float8" => CoreType::Float64,
            "boolean" | "bool" => CoreType::Bool,
            "uuid" => CoreType::Uuid,
            "bytea" => CoreType::Bytes,
            "json" | "jsonb" => CoreType::Json,
            "date" => CoreType::Date,
            "timestamp" => CoreType::DateTime(None),
            _ => {
                if let Some(rest) = lower.strip_prefix("timestamp(") {
                    let p = rest.trim_end_matches(')').trim().parse().ok()?;
                    return Some(CoreType::DateTime(Some(p)));
                }
                if let Some(rest) = lower.strip_prefix("numeric(") {
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
        // MySQL-only spellings are rejected for portability
        let lower = type_str.to_ascii_lowercase();
        !["blob", "tinyint", "mediumint", "enum(", "auto_increment"]
            .iter()
            .any(|fragment| lower.contains(fragment))
    }

    fn create_schema(&self, schema: &str) -> Vec<String> {
        vec![format!(
            "CREATE SCHEMA IF NOT EXISTS {}",
            self.quote_ident(schema)
        )]
    }

    fn drop_schema(&self, schema: &str) -> Vec<String> {
        vec![format!(
            "DROP SCHEMA IF EXISTS {} CASCADE",
            self.quote_ident(schema)
        )]
    }

    fn create_table(&self, ddl: &TableDdl) -> Vec<String> {
        let mut script = Vec::new();

        // enum types are declared out of line, idempotently
        for column in &ddl.columns {
            if let Some(CoreType::Enum(values)) = &column.core_type {
                let type_name = format!(
                    "{}.{}",
                    self.quote_ident(&ddl.name.schema),
                    self.quote_ident(&self.enum_type_name(&ddl.name, &column.name))
                );
                let values_sql = values
                    .iter()
                    .map(|v| self.string_literal(v))
                    .collect::<Vec<_>>()
                    .join(", ");
                script.push(format!(
                    "DO $$ BEGIN CREATE TYPE {type_name} AS ENUM ({values_sql}); \
                     EXCEPTION WHEN duplicate_object THEN NULL; END $$"
                ));
            }
        }

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
            lines.push(format!(
                "FOREIGN KEY ({}) REFERENCES {} ({}) ON UPDATE CASCADE ON DELETE RESTRICT",
                fk.fk_attrs
                    .iter()
                    .map(|a| self.quote_ident(a))
                    .collect::<Vec<_>>()
                    .join(","),
                self.quote_qualified(&fk.parent),
                fk.pk_attrs
                    .iter()
                    .map(|a| self.quote_ident(a))
                    .collect::<Vec<_>>()
                    .join(",")
            ));
        }
        script.push(format!(
            "CREATE TABLE IF NOT EXISTS {} (\n{}\n)",
            self.quote_qualified(&ddl.name),
            lines.join(",\n")
        ));

        // comments are out of line
        if !ddl.comment.is_empty() {
            script.push(format!(
                "COMMENT ON TABLE {} IS {}",
                self.quote_qualified(&ddl.name),
                self.string_literal(&ddl.comment)
            ));
        }
        for column in &ddl.columns {
            if !column.comment.is_empty() {
                script.push(format!(
                    "COMMENT ON COLUMN {}.{} IS {}",
                    self.quote_qualified(&ddl.name),
                    self.quote_ident(&column.name),
                    self.string_literal(&column.comment)
                ));
            }
        }

        // indexes are separate statements
        for index in &ddl.indexes {
            let index_name = format!(
                "idx_{}_{}",
                ddl.name.table,
                index.attributes.join("_")
            );
            script.push(format!(
                "CREATE {}INDEX IF NOT EXISTS {} ON {} ({})",
                if index.unique { "UNIQUE " } else { "" },
                self.quote_ident(&index_name[..index_name.len().min(63)]),
                self.quote_qualified(&ddl.name),
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
        vec![format!("DROP TABLE {}", self.quote_qualified(name))]
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
                        "altering column definitions is not supported on PostgreSQL; \
                         drop and re-add the column"
                            .to_string(),
                    ));
                }
            }
        }
        if let Some(comment) = new_comment {
            script.push(format!(
                "COMMENT ON TABLE {} IS {}",
                self.quote_qualified(name),
                self.string_literal(comment)
            ));
        }
        Ok(script)
    }

    fn format_column(&self, table: &QualifiedName, column: &ColumnDdl) -> String {
        format!(
            "{} {}{}",
            self.quote_ident(&column.name),
            self.column_type(table, column),
            self.render_default(column)
        )
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
        let mut sql = format!(
            "INSERT INTO {} ({quoted_cols}) VALUES {values}",
            self.quote_qualified(table)
        );
        let conflict_target = primary_key
            .iter()
            .map(|k| self.quote_ident(k))
            .collect::<Vec<_>>()
            .join(",");
        match duplicate {
            DuplicateHandling::Skip => {
                sql.push_str(&format!(" ON CONFLICT ({conflict_target}) DO NOTHING"));
            }
            DuplicateHandling::Replace | DuplicateHandling::Update => {
                let updates = columns
                    .iter()
                    .filter(|c| !primary_key.contains(c))
                    .map(|c| {
                        let c = self.quote_ident(c);
                        format!("{c}=EXCLUDED.{c}")
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
            DuplicateHandling::Error => {}
        }
        sql
    }

    fn insert_from_select(
        &self,
        table: &QualifiedName,
        columns: &[String],
        select_sql: &str,
        duplicate: DuplicateHandling,
        primary_key: &[String],
    ) -> String {
        let quoted_cols = columns
            .iter()
            .map(|c| self.quote_ident(c))
            .collect::<Vec<_>>()
            .join(",");
        let mut sql = format!(
            "INSERT INTO {} ({quoted_cols}) {select_sql}",
            self.quote_qualified(table)
        );
        if duplicate == DuplicateHandling::Skip {
            let conflict_target = primary_key
                .iter()
                .map(|k| self.quote_ident(k))
                .collect::<Vec<_>>()
                .join(",");
            sql.push_str(&format!(" ON CONFLICT ({conflict_target}) DO NOTHING"));
        }
        sql
    }

    fn update_sql(&self, table: &QualifiedName, set: &[String], wher: &[String]) -> String {
        let mut index = 0;
        let set_sql = set
            .iter()
            .map(|c| {
                let s = format!("{}={}", self.quote_ident(c), self.placeholder(index));
                index += 1;
                s
            })
            .collect::<Vec<_>>()
            .join(",");
        let where_sql = wher
            .iter()
            .map(|c| {
                let s = format!("{}={}", self.quote_ident(c), self.placeholder(index));
                index += 1;
                s
            })
            .collect::<Vec<_>>()
            .join(" AND ");
        format!(
            "UPDATE {} SET {set_sql} WHERE {where_sql}",
            self.quote_qualified(table)
        )
    }

    fn start_transaction_sql(&self) -> &'static str {
        "BEGIN"
    }

    fn current_timestamp(&self, precision: Option<u8>) -> String {
        match precision {
            Some(p) => format!("CURRENT_TIMESTAMP({p})"),
            None => "CURRENT_TIMESTAMP".to_string(),
        }
    }

    fn interval(&self, value: i64, unit: &str) -> String {
        format!("INTERVAL '{value} {}'", unit.to_ascii_lowercase())
    }

    fn now_plus_seconds(&self, seconds: f64) -> String {
        if seconds == 0.0 {
            "CURRENT_TIMESTAMP(3)".to_string()
        } else {
            format!("CURRENT_TIMESTAMP(3) + INTERVAL '{seconds} seconds'")
        }
    }

    fn json_path(&self, column_sql: &str, path: &str, _return_type: Option<&str>) -> String {
        let parts = path
            .split('.')
            .map(|p| self.string_literal(p))
            .collect::<Vec<_>>()
            .join(", ");
        format!("jsonb_extract_path_text({column_sql}, {parts})")
    }

    fn list_schemas(&self, driver: &mut dyn Driver) -> Result<Vec<String>> {
        let rows = run(
            self,
            driver,
            "SELECT schema_name AS n FROM information_schema.schemata \
             WHERE schema_name NOT IN ('pg_catalog', 'information_schema')",
            &[],
        )?;
        Ok(rows.into_iter().filter_map(|r| string_field(&r, "n")).collect())
    }

    fn list_tables(&self, driver: &mut dyn Driver, schema: &str) -> Result<Vec<String>> {
        let rows = run(
            self,
            driver,
            "SELECT table_name AS n FROM information_schema.tables \
             WHERE table_schema=$1 ORDER BY table_name",
            &[Value::String(schema.to_string())],
        )?;
        Ok(rows.into_iter().filter_map(|r| string_field(&r, "n")).collect())
    }

    fn table_info(
        &self,
        driver: &mut dyn Driver,
        name: &QualifiedName,
    ) -> Result<Option<TableInfo>> {
        let rows = run(
            self,
            driver,
            "SELECT obj_description(format('%I.%I', table_schema, table_name)::regclass::oid) AS c \
             FROM information_schema.tables WHERE table_schema=$1 AND table_name=$2",
            &[
                Value::String(name.schema.clone()),
                Value::String(name.table.clone()),
            ],
        )?;
        Ok(rows.first().map(|r| TableInfo {
            comment: string_field(r, "c").unwrap_or_default(),
        }))
    }

    fn columns(&self, driver: &mut dyn Driver, name: &QualifiedName) -> Result<Vec<ColumnInfo>> {
        let primary_key = self.primary_key(driver, name)?;
        let rows = run(
            self,
            driver,
            "SELECT c.column_name AS name, c.udt_name AS udt, c.data_type AS dtype, \
                    c.character_maximum_length AS charlen, c.numeric_precision AS nprec, \
                    c.numeric_scale AS nscale, c.datetime_precision AS dtprec, \
                    c.is_nullable AS nullable, c.column_default AS cdefault, \
                    col_description(format('%I.%I', c.table_schema, c.table_name)::regclass::oid, \
                                    c.ordinal_position) AS comment \
             FROM information_schema.columns c \
             WHERE c.table_schema=$1 AND c.table_name=$2 ORDER BY c.ordinal_position",
            &[
                Value::String(name.schema.clone()),
                Value::String(name.table.clone()),
            ],
        )?;
        Ok(rows
            .iter()
            .map(|r| {
                let column = string_field(r, "name").unwrap_or_default();
                ColumnInfo {
                    sql_type: compose_pg_type(r),
                    nullable: string_field(r, "nullable").as_deref() == Some("YES"),
                    default: string_field(r, "cdefault"),
                    comment: string_field(r, "comment").unwrap_or_default(),
                    in_key: primary_key.contains(&column),
                    autoincrement: string_field(r, "cdefault")
                        .is_some_and(|d| d.starts_with("nextval(")),
                    name: column,
                }
            })
            .collect())
    }

    fn primary_key(&self, driver: &mut dyn Driver, name: &QualifiedName) -> Result<Vec<String>> {
        let rows = run(
            self,
            driver,
            "SELECT kcu.column_name AS n \
             FROM information_schema.table_constraints tc \
             JOIN information_schema.key_column_usage kcu \
               ON tc.constraint_name=kcu.constraint_name AND tc.table_schema=kcu.table_schema \
             WHERE tc.constraint_type='PRIMARY KEY' AND tc.table_schema=$1 AND tc.table_name=$2 \
             ORDER BY kcu.ordinal_position",
            &[
                Value::String(name.schema.clone()),
                Value::String(name.table.clone()),
            ],
        )?;
        Ok(rows.into_iter().filter_map(|r| string_field(&r, "n")).collect())
    }

    fn foreign_keys(&self, driver: &mut dyn Driver, schema: &str) -> Result<Vec<ForeignKeyInfo>> {
        let rows = run(
            self,
            driver,
            "SELECT tc.constraint_name AS cname, tc.table_schema AS cs, tc.table_name AS ct, \
                    kcu.column_name AS ca, ccu.table_schema AS ps, ccu.table_name AS pt, \
                    ccu.column_name AS pa \
             FROM information_schema.table_constraints tc \
             JOIN information_schema.key_column_usage kcu \
               ON tc.constraint_name=kcu.constraint_name AND tc.table_schema=kcu.table_schema \
             JOIN information_schema.constraint_column_usage ccu \
               ON ccu.constraint_name=tc.constraint_name AND ccu.table_schema=tc.table_schema \
             WHERE tc.constraint_type='FOREIGN KEY' AND (tc.table_schema=$1 OR ccu.table_schema=$2) \
             ORDER BY tc.constraint_name, kcu.ordinal_position",
            &[
                Value::String(schema.to_string()),
                Value::String(schema.to_string()),
            ],
        )?;
        let mut out: Vec<ForeignKeyInfo> = Vec::new();
        for r in &rows {
            let constraint = string_field(r, "cname").unwrap_or_default();
            let child = QualifiedName::new(
                string_field(r, "cs").unwrap_or_default(),
                string_field(r, "ct").unwrap_or_default(),
            );
            let parent = QualifiedName::new(
                string_field(r, "ps").unwrap_or_default(),
                string_field(r, "pt").unwrap_or_default(),
            );
            let pair = (
                string_field(r, "ca").unwrap_or_default(),
                string_field(r, "pa").unwrap_or_default(),
            );
            match out.last_mut() {
                Some(fk) if fk.constraint == constraint && fk.child == child => {
                    fk.attr_map.push(pair);
                }
                _ => out.push(ForeignKeyInfo {
                    constraint,
                    child,
                    parent,
                    attr_map: vec![pair],
                }),
            }
        }
        Ok(out)
    }

    fn indexes(&self, driver: &mut dyn Driver, name: &QualifiedName) -> Result<Vec<IndexInfo>> {
        let rows = run(
            self,
            driver,
            "SELECT i.relname AS iname, ix.indisunique AS uniq, a.attname AS col \
             FROM pg_class t \
             JOIN pg_namespace n ON n.oid = t.relnamespace \
             JOIN pg_index ix ON ix.indrelid = t.oid \
             JOIN pg_class i ON i.oid = ix.indexrelid \
             JOIN pg_attribute a ON a.attrelid = t.oid AND a.attnum = ANY(ix.indkey) \
             WHERE n.nspname=$1 AND t.relname=$2 AND NOT ix.indisprimary \
             ORDER BY i.relname",
            &[
                Value::String(name.schema.clone()),
                Value::String(name.table.clone()),
            ],
        )?;
        let mut out: Vec<IndexInfo> = Vec::new();
        for r in &rows {
            let iname = string_field(r, "iname").unwrap_or_default();
            let unique = int_field(r, "uniq") == Some(1)
                || string_field(r, "uniq").is_some_and(|s| s == "t" || s == "true");
            let col = string_field(r, "col").unwrap_or_default();
            match out.last_mut() {
                Some(ix) if ix.name == iname => ix.columns.push(col),
                _ => out.push(IndexInfo {
                    name: iname,
                    unique,
                    columns: vec![col],
                }),
            }
        }
        Ok(out)
    }

    fn constraint_info(
        &self,
        driver: &mut dyn Driver,
        constraint: &str,
        child: &QualifiedName,
    ) -> Result<Vec<(String, String, String)>> {
        let rows = run(
            self,
            driver,
            "SELECT kcu.column_name AS fk_attr, \
                    ccu.table_schema || '.' || ccu.table_name AS parent, \
                    ccu.column_name AS pk_attr \
             FROM information_schema.key_column_usage kcu \
             JOIN information_schema.constraint_column_usage ccu \
               ON ccu.constraint_name=kcu.constraint_name \
             WHERE kcu.constraint_name=$1 AND kcu.table_schema=$2 AND kcu.table_name=$3 \
             ORDER BY kcu.ordinal_position",
            &[
                Value::String(constraint.to_string()),
                Value::String(child.schema.clone()),
                Value::String(child.table.clone()),
            ],
        )?;
        Ok(rows
            .iter()
            .map(|r| {
                (
                    string_field(r, "fk_attr").unwrap_or_default(),
                    string_field(r, "parent").unwrap_or_default(),
                    string_field(r, "pk_attr").unwrap_or_default(),
                )
            })
            .collect())
    }

    fn parse_foreign_key_error(&self, message: &str) -> Option<FkErrorInfo> {
        let caps = FK_ERROR.captures(message)?;
        Some(FkErrorInfo {
            child: caps["child"].to_string(),
            constraint: caps["name"].to_string(),
            fk_attrs: None,
            parent: Some(caps["parent"].to_string()),
            pk_attrs: FK_DETAIL
                .captures(message)
                .map(|d| d["cols"].split(',').map(|c| c.trim().to_string()).collect()),
        })
    }

    fn translate_error(&self, error: DriverError, query: &str) -> Error {
        let state = error.sqlstate.as_deref().unwrap_or("");
        match state {
            "23505" => Error::Duplicate(error.message),
            "23503" => Error::Integrity(error.message),
            "23502" => Error::MissingAttribute(error.message),
            "42601" => Error::QuerySyntax {
                message: error.message,
                query: query.to_string(),
            },
            "42P01" => Error::MissingTable(error.message),
            "42703" => Error::UnknownAttribute(error.message),
            "42501" | "28000" | "28P01" => Error::Access(error.message),
            s if s.starts_with("08") || s == "57P01" || s == "57P02" => {
                Error::LostConnection(error.message)
            }
            _ => Error::Invalid(error.message),
        }
    }
}

/// Reassembles a parametrized SQL type from information_schema columns.
fn compose_pg_type(row: &quarry_core::value::Row) -> String {
    let udt = string_field(row, "udt").unwrap_or_default();
    match udt.as_str() {
        "varchar" | "bpchar" => {
            let kind = if udt == "varchar" { "varchar" } else { "char" };
            match int_field(row, "charlen") {
                Some(n) => format!("{kind}({n})"),
                None => kind.to_string(),
            }
        }
        "numeric" => match (int_field(row, "nprec"), int_field(row, "nscale")) {
            (Some(p), Some(s)) => format!("numeric({p},{s})"),
            _ => "numeric".to_string(),
        },
        "timestamp" => match int_field(row, "dtprec") {
            Some(p) if p != 6 => format!("timestamp({p})"),
            _ => "timestamp".to_string(),
        },
        "int2" => "smallint".to_string(),
        "int4" => "integer".to_string(),
        "int8" => "bigint".to_string(),
        "float4" => "real".to_string(),
        "float8" => "double precision".to_string(),
        "bool" => "boolean".to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name() -> QualifiedName {
        QualifiedName::new("lab", "session")
    }

    #[test]
    fn identifier_and_literals() {
        let d = PostgresDialect;
        assert_eq!(d.quote_ident("weight"), "\"weight\"");
        assert_eq!(d.string_literal("it's"), "'it''s'");
        assert_eq!(d.bytes_literal(&[0xde, 0xad]), "'\\xdead'::bytea");
        assert_eq!(d.placeholder(0), "$1");
        assert_eq!(d.placeholder(3), "$4");
    }

    #[test]
    fn core_type_mapping() {
        let d = PostgresDialect;
        assert_eq!(d.core_type_to_sql(&CoreType::Float32), "real");
        assert_eq!(d.core_type_to_sql(&CoreType::Bytes), "bytea");
        assert_eq!(d.core_type_to_sql(&CoreType::Json), "jsonb");
        assert_eq!(d.core_type_to_sql(&CoreType::Uuid), "uuid");
        assert_eq!(d.sql_type_to_core("double precision"), Some(CoreType::Float64));
        assert_eq!(d.sql_type_to_core("numeric(9,4)"), Some(CoreType::Decimal(9, 4)));
        assert_eq!(d.sql_type_to_core("timestamp(3)"), Some(CoreType::DateTime(Some(3))));
    }

    #[test]
    fn insert_variants() {
        let d = PostgresDialect;
        let cols = vec!["a".to_string(), "b".to_string()];
        let pk = vec!["a".to_string()];
        assert_eq!(
            d.insert_sql(&name(), &cols, 2, DuplicateHandling::Error, &pk),
            "INSERT INTO \"lab\".\"session\" (\"a\",\"b\") VALUES ($1,$2),($3,$4)"
        );
        assert_eq!(
            d.insert_sql(&name(), &cols, 1, DuplicateHandling::Skip, &pk),
            "INSERT INTO \"lab\".\"session\" (\"a\",\"b\") VALUES ($1,$2) \
             ON CONFLICT (\"a\") DO NOTHING"
        );
        assert_eq!(
            d.insert_sql(&name(), &cols, 1, DuplicateHandling::Update, &pk),
            "INSERT INTO \"lab\".\"session\" (\"a\",\"b\") VALUES ($1,$2) \
             ON CONFLICT (\"a\") DO UPDATE SET \"b\"=EXCLUDED.\"b\""
        );
    }

    #[test]
    fn create_table_emits_enum_types_and_comments() {
        let d = PostgresDialect;
        let ddl = TableDdl {
            name: QualifiedName::new("lab", "~~job"),
            columns: vec![ColumnDdl {
                name: "status".into(),
                core_type: Some(CoreType::Enum(vec!["pending".into(), "error".into()])),
                native_type: None,
                nullable: false,
                default: None,
                comment: "job status".into(),
            }],
            primary_key: vec!["status".into()],
            foreign_keys: vec![],
            indexes: vec![],
            comment: "queue".into(),
        };
        let script = d.create_table(&ddl);
        assert!(script[0].contains("CREATE TYPE"));
        assert!(script[0].contains("AS ENUM ('pending', 'error')"));
        assert!(script[1].starts_with("CREATE TABLE IF NOT EXISTS \"lab\".\"~~job\""));
        assert!(script.iter().any(|s| s.starts_with("COMMENT ON TABLE")));
        assert!(script.iter().any(|s| s.starts_with("COMMENT ON COLUMN")));
    }

    #[test]
    fn fk_error_parse() {
        let d = PostgresDialect;
        let message = "update or delete on table \"subject\" violates foreign key constraint \
                       \"session_subject_id_fkey\" on table \"session\"\n\
                       DETAIL:  Key (subject_id)=(1) is still referenced from table \"session\".";
        let info = d.parse_foreign_key_error(message).unwrap();
        assert_eq!(info.child, "session");
        assert_eq!(info.parent.as_deref(), Some("subject"));
        assert_eq!(info.constraint, "session_subject_id_fkey");
        assert_eq!(info.pk_attrs.as_deref(), Some(&["subject_id".to_string()][..]));
    }

    #[test]
    fn fk_messages_carry_detail_and_updates_use_the_default_token() {
        let d = PostgresDialect;
        assert!(d.fk_errors_carry_detail());
        assert_eq!(d.update_default_expr("0"), "DEFAULT");
    }

    #[test]
    fn error_translation_by_sqlstate() {
        let d = PostgresDialect;
        let err = |state: &str| DriverError {
            code: None,
            sqlstate: Some(state.to_string()),
            message: "m".into(),
        };
        assert!(matches!(d.translate_error(err("23505"), ""), Error::Duplicate(_)));
        assert!(matches!(d.translate_error(err("23503"), ""), Error::Integrity(_)));
        assert!(matches!(d.translate_error(err("42P01"), ""), Error::MissingTable(_)));
        assert!(matches!(
            d.translate_error(err("08006"), ""),
            Error::LostConnection(_)
        ));
    }
}
