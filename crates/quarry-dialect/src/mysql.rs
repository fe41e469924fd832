//! MySQL dialect: SQL generation, information_schema introspection, and
//! error translation. The driver is supplied by the embedding application.

use std::sync::LazyLock;

use regex::Regex;

use quarry_core::declare::{is_constant_literal, AlterOp};
use quarry_core::error::{Error, Result};
use quarry_core::identifier::QualifiedName;
use quarry_core::types::CoreType;
use quarry_core::value::Value;

use crate::{
    int_field, job_metadata_columns, run, string_field, values_clause, ColumnDdl, ColumnInfo,
    Dialect, Driver, DriverError, DuplicateHandling, FkErrorInfo, ForeignKeyInfo, IndexInfo,
    TableDdl, TableInfo,
};

/// The MySQL / MariaDB dialect.
#[derive(Debug, Default, Clone, Copy)]
pub struct MySqlDialect;

static FK_ERROR_FULL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"a foreign key constraint fails\s*\((?P<child>`[^`]+`(?:\.`[^`]+`)?),\s*CONSTRAINT\s+`(?P<name>[^`]+)`\s+FOREIGN KEY\s+\((?P<fk>[^)]+)\)\s+REFERENCES\s+(?P<parent>`[^`]+`(?:\.`[^`]+`)?)\s+\((?P<pk>[^)]+)\)",
    )
    .expect("mysql fk regex")
});

static FK_ERROR_PARTIAL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"a foreign key constraint fails\s*\((?P<child>`[^`]+`(?:\.`[^`]+`)?),\s*CONSTRAINT\s+`(?P<name>[^`]+)`",
    )
    .expect("mysql fk partial regex")
});

fn unquote(ident: &str) -> String {
    ident
        .split('.')
        .map(|part| part.trim().trim_matches('`'))
        .collect::<Vec<_>>()
        .join(".")
}

fn split_ident_list(list: &str) -> Vec<String> {
    list.split(',').map(|s| unquote(s.trim())).collect()
}

impl MySqlDialect {
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
}

impl Dialect for MySqlDialect {
    fn backend_name(&self) -> &'static str {
        "mysql"
    }

    fn default_port(&self) -> u16 {
        3306
    }

    fn quote_ident(&self, name: &str) -> String {
        format!("`{}`", name.replace('`', "``"))
    }

    fn string_literal(&self, value: &str) -> String {
        format!("'{}'", value.replace('\\', "\\\\").replace('\'', "''"))
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
            CoreType::Json => "json".to_string(),
            CoreType::Date => "date".to_string(),
            CoreType::DateTime(None) => "datetime".to_string(),
            CoreType::DateTime(Some(p)) => format!("datetime({p})"),
            CoreType::Char(n) => format!("char({n})"),
            CoreType::Varchar(n) => format!("varchar({n})"),
            CoreType::Decimal(p, s) => format!("decimal({p},{s})"),
            CoreType::Enum(values) => format!(
                "enum({})",
                values
                    .iter()
                    .map(|v| self.string_literal(v))
                    .collect::<Vec<_>>()
                    .join(",")
            ),
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
            "json" => CoreType::Json,
            "date" => CoreType::Date,
            "datetime" => CoreType::DateTime(None),
            _ => return CoreType::parse(&lower),
        })
    }

    fn validate_native_type(&self, _type_str: &str) -> bool {
        true
    }

    fn create_schema(&self, schema: &str) -> Vec<String> {
        vec![format!(
            "CREATE DATABASE IF NOT EXISTS {}",
            self.quote_ident(schema)
        )]
    }

    fn drop_schema(&self, schema: &str) -> Vec<String> {
        vec![format!(
            "DROP DATABASE IF EXISTS {}",
            self.quote_ident(schema)
        )]
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
        for index in &ddl.indexes {
            lines.push(format!(
                "{}INDEX ({})",
                if index.unique { "UNIQUE " } else { "" },
                index
                    .attributes
                    .iter()
                    .map(|a| self.quote_ident(a))
                    .collect::<Vec<_>>()
                    .join(",")
            ));
        }
        vec![format!(
            "CREATE TABLE IF NOT EXISTS {} (\n{}\n) ENGINE=InnoDB, COMMENT \"{}\"",
            self.quote_qualified(&ddl.name),
            lines.join(",\n"),
            ddl.comment.replace('"', "\\\"")
        )]
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
        let mut clauses: Vec<String> = ops
            .iter()
            .map(|op| match op {
                AlterOp::Add { definition, after } => format!(
                    "ADD {definition}{}",
                    after
                        .as_ref()
                        .map(|a| format!(" AFTER {}", self.quote_ident(a)))
                        .unwrap_or_default()
                ),
                AlterOp::Modify { definition, after } => format!(
                    "MODIFY {definition}{}",
                    after
                        .as_ref()
                        .map(|a| format!(" AFTER {}", self.quote_ident(a)))
                        .unwrap_or_default()
                ),
                AlterOp::Change {
                    old_name,
                    definition,
                    after,
                } => format!(
                    "CHANGE {} {definition}{}",
                    self.quote_ident(old_name),
                    after
                        .as_ref()
                        .map(|a| format!(" AFTER {}", self.quote_ident(a)))
                        .unwrap_or_default()
                ),
                AlterOp::Drop { name } => format!("DROP {}", self.quote_ident(name)),
            })
            .collect();
        if let Some(comment) = new_comment {
            clauses.push(format!("COMMENT=\"{}\"", comment.replace('"', "\\\"")));
        }
        if clauses.is_empty() {
            return Ok(Vec::new());
        }
        Ok(vec![format!(
            "ALTER TABLE {} {}",
            self.quote_qualified(name),
            clauses.join(", ")
        )])
    }

    fn format_column(&self, _table: &QualifiedName, column: &ColumnDdl) -> String {
        let mut out = format!(
            "{} {}{}",
            self.quote_ident(&column.name),
            self.column_type(column),
            self.render_default(column)
        );
        if !column.comment.is_empty() {
            out.push_str(&format!(" COMMENT \"{}\"", column.comment.replace('"', "\\\"")));
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
            DuplicateHandling::Replace => "REPLACE",
            _ => "INSERT",
        };
        let mut sql = format!(
            "{verb} INTO {} ({quoted_cols}) VALUES {values}",
            self.quote_qualified(table)
        );
        match duplicate {
            DuplicateHandling::Skip => {
                // no-op update on the first primary key column
                if let Some(pk) = primary_key.first() {
                    let pk = self.quote_ident(pk);
                    sql.push_str(&format!(" ON DUPLICATE KEY UPDATE {pk}={pk}"));
                }
            }
            DuplicateHandling::Update => {
                let updates = columns
                    .iter()
                    .filter(|c| !primary_key.contains(c))
                    .map(|c| {
                        let c = self.quote_ident(c);
                        format!("{c}=VALUES({c})")
                    })
                    .collect::<Vec<_>>()
                    .join(",");
                if !updates.is_empty() {
                    sql.push_str(&format!(" ON DUPLICATE KEY UPDATE {updates}"));
                }
            }
            DuplicateHandling::Error | DuplicateHandling::Replace => {}
        }
        sql
    }

    fn insert_default_row_sql(&self, table: &QualifiedName) -> String {
        format!("INSERT INTO {} () VALUES ()", self.quote_qualified(table))
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
        let verb = match duplicate {
            DuplicateHandling::Replace => "REPLACE",
            _ => "INSERT",
        };
        let mut sql = format!(
            "{verb} INTO {} ({quoted_cols}) {select_sql}",
            self.quote_qualified(table)
        );
        if duplicate == DuplicateHandling::Skip {
            if let Some(pk) = primary_key.first() {
                let pk = self.quote_ident(pk);
                sql.push_str(&format!(" ON DUPLICATE KEY UPDATE {pk}={pk}"));
            }
        }
        sql
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

    fn start_transaction_sql(&self) -> &'static str {
        "START TRANSACTION WITH CONSISTENT SNAPSHOT"
    }

    fn current_timestamp(&self, precision: Option<u8>) -> String {
        match precision {
            Some(p) => format!("NOW({p})"),
            None => "NOW()".to_string(),
        }
    }

    fn interval(&self, value: i64, unit: &str) -> String {
        format!("INTERVAL {value} {}", unit.to_ascii_uppercase())
    }

    fn now_plus_seconds(&self, seconds: f64) -> String {
        if seconds == 0.0 {
            "NOW(3)".to_string()
        } else {
            format!("NOW(3) + INTERVAL {seconds} SECOND")
        }
    }

    fn json_path(&self, column_sql: &str, path: &str, return_type: Option<&str>) -> String {
        match return_type {
            Some(t) => format!("json_value({column_sql}, _utf8mb4'$.{path}' returning {t})"),
            None => format!("json_value({column_sql}, _utf8mb4'$.{path}')"),
        }
    }

    fn list_schemas(&self, driver: &mut dyn Driver) -> Result<Vec<String>> {
        let rows = run(self, driver, "SELECT schema_name AS n FROM information_schema.schemata", &[])?;
        Ok(rows.into_iter().filter_map(|r| string_field(&r, "n")).collect())
    }

    fn list_tables(&self, driver: &mut dyn Driver, schema: &str) -> Result<Vec<String>> {
        let rows = run(
            self,
            driver,
            "SELECT table_name AS n FROM information_schema.tables WHERE table_schema=? ORDER BY table_name",
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
            "SELECT table_comment AS c FROM information_schema.tables \
             WHERE table_schema=? AND table_name=?",
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
        let rows = run(
            self,
            driver,
            "SELECT column_name AS name, column_type AS ctype, is_nullable AS nullable, \
                    column_default AS cdefault, column_comment AS comment, column_key AS ckey, \
                    extra AS extra \
             FROM information_schema.columns WHERE table_schema=? AND table_name=? \
             ORDER BY ordinal_position",
            &[
                Value::String(name.schema.clone()),
                Value::String(name.table.clone()),
            ],
        )?;
        Ok(rows
            .iter()
            .map(|r| ColumnInfo {
                name: string_field(r, "name").unwrap_or_default(),
                sql_type: string_field(r, "ctype").unwrap_or_default(),
                nullable: string_field(r, "nullable").as_deref() == Some("YES"),
                default: string_field(r, "cdefault"),
                comment: string_field(r, "comment").unwrap_or_default(),
                in_key: string_field(r, "ckey").as_deref() == Some("PRI"),
                autoincrement: string_field(r, "extra")
                    .is_some_and(|e| e.to_ascii_lowercase().contains("auto_increment")),
            })
            .collect())
    }

    fn primary_key(&self, driver: &mut dyn Driver, name: &QualifiedName) -> Result<Vec<String>> {
        let rows = run(
            self,
            driver,
            "SELECT column_name AS n FROM information_schema.key_column_usage \
             WHERE constraint_name='PRIMARY' AND table_schema=? AND table_name=? \
             ORDER BY ordinal_position",
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
            "SELECT constraint_name AS cname, table_schema AS cs, table_name AS ct, \
                    column_name AS ca, referenced_table_schema AS ps, \
                    referenced_table_name AS pt, referenced_column_name AS pa \
             FROM information_schema.key_column_usage \
             WHERE referenced_table_name IS NOT NULL \
               AND (table_schema=? OR referenced_table_schema=?) \
             ORDER BY constraint_name, ordinal_position",
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
            "SELECT index_name AS iname, non_unique AS nonu, column_name AS col \
             FROM information_schema.statistics \
             WHERE table_schema=? AND table_name=? AND index_name<>'PRIMARY' \
             ORDER BY index_name, seq_in_index",
            &[
                Value::String(name.schema.clone()),
                Value::String(name.table.clone()),
            ],
        )?;
        let mut out: Vec<IndexInfo> = Vec::new();
        for r in &rows {
            let iname = string_field(r, "iname").unwrap_or_default();
            let unique = int_field(r, "nonu") == Some(0);
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
            "SELECT column_name AS fk_attr, \
                    concat(referenced_table_schema, '.', referenced_table_name) AS parent, \
                    referenced_column_name AS pk_attr \
             FROM information_schema.key_column_usage \
             WHERE constraint_name=? AND table_schema=? AND table_name=? \
             ORDER BY ordinal_position",
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
        if let Some(caps) = FK_ERROR_FULL.captures(message) {
            return Some(FkErrorInfo {
                child: unquote(&caps["child"]),
                constraint: caps["name"].to_string(),
                fk_attrs: Some(split_ident_list(&caps["fk"])),
                parent: Some(unquote(&caps["parent"])),
                pk_attrs: Some(split_ident_list(&caps["pk"])),
            });
        }
        FK_ERROR_PARTIAL.captures(message).map(|caps| FkErrorInfo {
            child: unquote(&caps["child"]),
            constraint: caps["name"].to_string(),
            fk_attrs: None,
            parent: None,
            pk_attrs: None,
        })
    }

    fn translate_error(&self, error: DriverError, query: &str) -> Error {
        match error.code {
            Some(2002 | 2006 | 2013 | 4031) => Error::LostConnection(error.message),
            Some(1044 | 1045 | 1142 | 1143 | 1227) => Error::Access(error.message),
            Some(1062) => Error::Duplicate(error.message),
            Some(1451 | 1452 | 1217 | 1216) => Error::Integrity(error.message),
            Some(1064) => Error::QuerySyntax {
                message: error.message,
                query: query.to_string(),
            },
            Some(1146) => Error::MissingTable(error.message),
            Some(1364) => Error::MissingAttribute(error.message),
            Some(1054) => Error::UnknownAttribute(error.message),
            _ => Error::Invalid(error.message),
        }
    }
}
