//! The per-table job queue backing distributed populate.
//!
//! Every auto-populated table `t` gets a hidden `~~t` table whose primary
//! key is the FK-derived part of `t`'s primary key. Rows move through
//! `pending -> reserved -> success | error`, with `ignore` set by
//! operators. Reservation is a single atomic UPDATE, the only
//! cross-process coordination primitive in the framework.

use std::collections::HashMap;

use chrono::NaiveDateTime;
use tracing::{debug, warn};

use quarry_core::error::{Error, Result};
use quarry_core::heading::Heading;
use quarry_core::identifier::QualifiedName;
use quarry_core::types::CoreType;
use quarry_core::value::{Row, Value};
use quarry_dialect::{ColumnDdl, DuplicateHandling, TableDdl};

use crate::condition::Restriction;
use crate::connection::Connection;
use crate::expression::Proj;
use crate::introspect::load_heading;
use crate::populate::key_source;
use crate::table::{restrict_permissive, Table};

/// Longest stored error message; longer messages truncate with a marker.
pub const ERROR_MESSAGE_LENGTH: usize = 2047;
const TRUNCATION_APPENDIX: &str = "...truncated";

/// Job states.
pub const STATUSES: [&str; 5] = ["pending", "reserved", "success", "error", "ignore"];

/// Options for [`JobTable::refresh`].
#[derive(Debug, Clone, Default)]
pub struct RefreshOptions {
    /// Seconds until new jobs become available.
    pub delay: f64,
    /// Priority for new jobs; default from configuration.
    pub priority: Option<i64>,
    /// Override of `jobs.stale_timeout` seconds.
    pub stale_timeout: Option<u64>,
    /// Override of `jobs.orphan_timeout` seconds.
    pub orphan_timeout: Option<u64>,
}

/// Counts reported by [`JobTable::refresh`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshCounts {
    pub added: u64,
    /// Success rows re-pended because their keys left the target.
    pub repended: u64,
    /// Stale pending rows removed.
    pub removed: u64,
    /// Orphaned reserved rows reset to pending.
    pub reset: u64,
}

/// The `~~<table>` job queue of one auto-populated table.
pub struct JobTable {
    conn: Connection,
    name: QualifiedName,
    target: Table,
    key_attrs: Vec<String>,
}

impl JobTable {
    /// Opens (declaring on first use) the job table for a target.
    pub fn for_table(target: &Table) -> Result<JobTable> {
        if !target.tier().is_auto_populated() {
            return Err(Error::invalid(format!(
                "`{}` is not auto-populated and has no job table",
                target.qualified_name()
            )));
        }
        let conn = target.connection().clone();
        let node = target.qualified_name().to_string();
        let parents = conn.with_graph(false, |graph| graph.parents(&node, Some(true)))?;
        let fk_derived: Vec<String> = parents
            .iter()
            .flat_map(|(_, props)| props.attr_map.iter().map(|(c, _)| c.clone()))
            .collect();
        let mut key_attrs: Vec<String> = target
            .heading()
            .primary_key()
            .into_iter()
            .filter(|a| fk_derived.contains(a))
            .collect();
        if key_attrs.is_empty() {
            if !conn.config().jobs.allow_native_pk_in_computed {
                return Err(Error::invalid(format!(
                    "cannot create a job table for `{}`: no foreign-key-derived \
                     primary key attributes",
                    target.qualified_name()
                )));
            }
            warn!(
                table = %target.qualified_name(),
                "job granularity falls back to the full primary key (native attributes)"
            );
            key_attrs = target.heading().primary_key();
        }
        let jobs = JobTable {
            name: QualifiedName::new(
                target.schema_name(),
                format!("~~{}", target.table_name()),
            ),
            conn,
            target: target.clone(),
            key_attrs,
        };
        jobs.ensure_declared()?;
        Ok(jobs)
    }

    pub fn qualified_name(&self) -> &QualifiedName {
        &self.name
    }

    pub fn key_attributes(&self) -> &[String] {
        &self.key_attrs
    }

    fn ensure_declared(&self) -> Result<()> {
        let exists = {
            let dialect = self.conn.dialect().clone();
            let mut driver = self.conn.driver();
            dialect.table_info(driver.as_mut(), &self.name)?.is_some()
        };
        if exists {
            return Ok(());
        }
        let mut columns: Vec<ColumnDdl> = Vec::new();
        for attr_name in &self.key_attrs {
            let attr = self.target.heading().attribute(attr_name)?;
            let comment = match &attr.core_type {
                Some(core) => format!(":{}:", core.canonical()),
                None => String::new(),
            };
            columns.push(ColumnDdl {
                name: attr_name.clone(),
                core_type: attr.core_type.clone(),
                native_type: attr.core_type.is_none().then(|| attr.sql_type.clone()),
                nullable: false,
                default: None,
                comment,
            });
        }
        let status_type = CoreType::Enum(STATUSES.iter().map(|s| s.to_string()).collect());
        columns.push(column("status", status_type.clone(), false, Some("pending")));
        columns.push(column("priority", CoreType::Int16, false, None));
        columns.push(column("created_time", CoreType::DateTime(Some(6)), false, None));
        columns.push(column("scheduled_time", CoreType::DateTime(Some(6)), false, None));
        columns.push(column("reserved_time", CoreType::DateTime(Some(6)), true, None));
        columns.push(column("completed_time", CoreType::DateTime(Some(6)), true, None));
        columns.push(column("duration", CoreType::Float64, true, None));
        columns.push(column(
            "error_message",
            CoreType::Varchar(ERROR_MESSAGE_LENGTH as u32),
            false,
            Some(""),
        ));
        columns.push(column("error_stack", CoreType::Bytes, true, None));
        columns.push(column("user", CoreType::Varchar(255), false, Some("")));
        columns.push(column("host", CoreType::Varchar(255), false, Some("")));
        columns.push(column("pid", CoreType::Int64, false, Some("0")));
        columns.push(column("connection_id", CoreType::Int64, false, Some("0")));
        columns.push(column("version", CoreType::Varchar(255), false, Some("")));

        let ddl = TableDdl {
            name: self.name.clone(),
            columns,
            primary_key: self.key_attrs.clone(),
            foreign_keys: vec![],
            indexes: vec![],
            comment: format!("job queue for {}", self.target.table_name()),
        };
        debug!(table = %self.name, "declaring job table");
        self.conn.execute_script(&self.conn.dialect().create_table(&ddl))
    }

    fn heading(&self) -> Result<Heading> {
        load_heading(&self.conn, &self.name)
    }

    /// A query expression over the job rows.
    pub fn query(&self) -> Result<crate::expression::QueryExpression> {
        Ok(crate::expression::QueryExpression::base(
            self.conn.clone(),
            self.name.clone(),
            self.heading()?,
        ))
    }

    /// Reads the backend's current time, so scheduling never depends on
    /// worker clocks.
    fn server_now(&self) -> Result<NaiveDateTime> {
        let expr = self.conn.dialect().now_plus_seconds(0.0);
        let rows = self
            .conn
            .query(&format!("SELECT {expr} AS now"), &[])?;
        let text = rows
            .first()
            .and_then(|r| r.get("now"))
            .and_then(|v| v.as_str().map(str::to_string))
            .ok_or_else(|| Error::invalid("backend returned no timestamp"))?;
        NaiveDateTime::parse_from_str(&text, "%Y-%m-%d %H:%M:%S%.f")
            .map_err(|_| Error::invalid(format!("unparseable backend timestamp: {text}")))
    }

    /// `k1=<ph> AND k2=<ph> ...` with placeholders numbered from `start`,
    /// matching their position in the parameter list.
    fn key_where(&self, start: usize) -> String {
        let dialect = self.conn.dialect();
        self.key_attrs
            .iter()
            .enumerate()
            .map(|(i, a)| format!("{}={}", dialect.quote_ident(a), dialect.placeholder(start + i)))
            .collect::<Vec<_>>()
            .join(" AND ")
    }

    fn key_params(&self, key: &Row) -> Result<Vec<Value>> {
        self.key_attrs
            .iter()
            .map(|a| {
                key.get(a).cloned().ok_or_else(|| {
                    Error::MissingAttribute(format!("job key is missing attribute `{a}`"))
                })
            })
            .collect()
    }

    fn quoted_key_tuple(&self) -> String {
        let dialect = self.conn.dialect();
        self.key_attrs
            .iter()
            .map(|a| dialect.quote_ident(a))
            .collect::<Vec<_>>()
            .join(",")
    }

    // -- Queue maintenance ---------------------------------------------------

    /// Refreshes the queue: add pending jobs for new keys, re-pend
    /// completed keys that left the target, delete stale pending jobs
    /// whose keys left the key source, and reset orphaned reservations.
    /// Idempotent over a static key source.
    pub fn refresh(
        &self,
        restrictions: &[Restriction],
        options: &RefreshOptions,
    ) -> Result<RefreshCounts> {
        let config = &self.conn.config().jobs;
        let priority = options.priority.unwrap_or(config.default_priority as i64);
        let stale_timeout = options.stale_timeout.unwrap_or(config.stale_timeout);
        let orphan_timeout = options.orphan_timeout.unwrap_or(config.orphan_timeout);
        let dialect = self.conn.dialect().clone();
        let mut counts = RefreshCounts::default();

        let mut source = key_source(&self.target)?;
        for restriction in restrictions {
            source = restrict_permissive(&source, restriction.clone())?;
        }
        let source_keys = source.proj(Proj::none())?;

        // 1. insert pending jobs for keys not yet in the target nor queued
        let target_keys = self.target.query().proj(Proj::none())?;
        let mut new_keys = restrict_permissive(
            &source_keys,
            Restriction::In(target_keys.clone()).negate(),
        )?;
        new_keys = restrict_permissive(
            &new_keys,
            Restriction::In(self.query()?.proj(Proj::none())?).negate(),
        )?;

        let now = self.server_now()?;
        let scheduled = now
            + chrono::Duration::microseconds((options.delay * 1_000_000.0).round() as i64);
        let identity = worker_identity();
        let mut insert_columns: Vec<String> = self.key_attrs.clone();
        insert_columns.extend(
            [
                "status",
                "priority",
                "created_time",
                "scheduled_time",
                "user",
                "host",
                "pid",
                "connection_id",
                "version",
            ]
            .map(str::to_string),
        );
        let insert_sql = dialect.insert_sql(
            &self.name,
            &insert_columns,
            1,
            DuplicateHandling::Skip,
            &self.key_attrs,
        );
        for key in new_keys.fetch_keys()? {
            let mut params = self.key_params(&key)?;
            params.push(Value::String("pending".to_string()));
            params.push(Value::Int(priority));
            params.push(Value::DateTime(now));
            params.push(Value::DateTime(scheduled));
            params.push(Value::String(identity.user.clone()));
            params.push(Value::String(identity.host.clone()));
            params.push(Value::Int(identity.pid));
            params.push(Value::Int(self.conn.connection_id() as i64));
            params.push(Value::String(self.conn.config().jobs.version.clone()));
            counts.added += self.conn.execute(&insert_sql, &params)?;
        }

        // 1b. an explicit priority also re-prioritizes matching pending jobs
        if options.priority.is_some() {
            let sql = format!(
                "UPDATE {} SET priority={priority} WHERE status='pending' AND ({}) IN ({})",
                dialect.quote_qualified(&self.name),
                self.quoted_key_tuple(),
                source_keys.make_sql(Some(&self.key_attrs))?
            );
            self.conn.execute(&sql, &[])?;
        }

        // 2. re-pend completed jobs whose keys left the target
        if config.keep_completed {
            let sql = format!(
                "UPDATE {} SET status='pending' WHERE status='success' AND ({}) NOT IN ({})",
                dialect.quote_qualified(&self.name),
                self.quoted_key_tuple(),
                target_keys.make_sql(Some(&self.key_attrs))?
            );
            counts.repended = self.conn.execute(&sql, &[])?;
        }

        // 3. delete stale pending jobs no longer in the key source
        if stale_timeout > 0 {
            let cutoff = dialect.now_plus_seconds(-(stale_timeout as f64));
            let sql = format!(
                "DELETE FROM {} WHERE status='pending' AND created_time < {cutoff} \
                 AND ({}) NOT IN ({})",
                dialect.quote_qualified(&self.name),
                self.quoted_key_tuple(),
                source_keys.make_sql(Some(&self.key_attrs))?
            );
            counts.removed = self.conn.execute(&sql, &[])?;
        }

        // 4. reset orphaned reservations
        if orphan_timeout > 0 {
            let cutoff = dialect.now_plus_seconds(-(orphan_timeout as f64));
            let sql = format!(
                "UPDATE {} SET status='pending', reserved_time=NULL \
                 WHERE status='reserved' AND reserved_time < {cutoff}",
                dialect.quote_qualified(&self.name)
            );
            counts.reset = self.conn.execute(&sql, &[])?;
        }

        debug!(table = %self.name, ?counts, "job queue refreshed");
        Ok(counts)
    }

    // -- State transitions ---------------------------------------------------

    /// Atomically reserves one pending, due job. At most one concurrent
    /// caller wins.
    pub fn reserve(&self, key: &Row) -> Result<bool> {
        let dialect = self.conn.dialect();
        let now = dialect.now_plus_seconds(0.0);
        let identity = worker_identity();
        let sql = format!(
            "UPDATE {} SET status='reserved', reserved_time={now}, user={}, host={}, pid={}, \
             connection_id={} WHERE {} AND status='pending' AND scheduled_time <= {now}",
            dialect.quote_qualified(&self.name),
            dialect.placeholder(0),
            dialect.placeholder(1),
            dialect.placeholder(2),
            dialect.placeholder(3),
            self.key_where(4),
        );
        let mut params = vec![
            Value::String(identity.user),
            Value::String(identity.host),
            Value::Int(identity.pid),
            Value::Int(self.conn.connection_id() as i64),
        ];
        params.extend(self.key_params(key)?);
        Ok(self.conn.execute(&sql, &params)? > 0)
    }

    /// Marks a job successful, or deletes its row when completed jobs are
    /// not kept.
    pub fn complete(&self, key: &Row, duration: Option<f64>) -> Result<()> {
        if self.conn.config().jobs.keep_completed {
            let dialect = self.conn.dialect();
            let now = dialect.now_plus_seconds(0.0);
            let sql = format!(
                "UPDATE {} SET status='success', completed_time={now}, duration={} WHERE {}",
                dialect.quote_qualified(&self.name),
                dialect.placeholder(0),
                self.key_where(1),
            );
            let mut params = vec![duration.map(Value::Float).unwrap_or(Value::Null)];
            params.extend(self.key_params(key)?);
            self.conn.execute(&sql, &params)?;
        } else {
            let dialect = self.conn.dialect();
            let sql = format!(
                "DELETE FROM {} WHERE {}",
                dialect.quote_qualified(&self.name),
                self.key_where(0)
            );
            self.conn.execute(&sql, &self.key_params(key)?)?;
        }
        Ok(())
    }

    /// Records a failure with a truncated message and the full stack as a
    /// blob.
    pub fn error(&self, key: &Row, message: &str, stack: Option<&[u8]>) -> Result<()> {
        let message = truncate_error(message);
        let dialect = self.conn.dialect();
        let now = dialect.now_plus_seconds(0.0);
        let sql = format!(
            "UPDATE {} SET status='error', completed_time={now}, error_message={}, \
             error_stack={} WHERE {}",
            dialect.quote_qualified(&self.name),
            dialect.placeholder(0),
            dialect.placeholder(1),
            self.key_where(2),
        );
        let mut params = vec![
            Value::String(message),
            stack.map(|s| Value::Bytes(s.to_vec())).unwrap_or(Value::Null),
        ];
        params.extend(self.key_params(key)?);
        self.conn.execute(&sql, &params)?;
        Ok(())
    }

    /// Marks a key ignored, inserting the row if it is not queued yet.
    pub fn ignore(&self, key: &Row) -> Result<()> {
        let dialect = self.conn.dialect().clone();
        let exists_sql = format!(
            "SELECT count(*) AS n FROM {} WHERE {}",
            dialect.quote_qualified(&self.name),
            self.key_where(0)
        );
        let rows = self.conn.query(&exists_sql, &self.key_params(key)?)?;
        let exists = rows
            .first()
            .and_then(|r| r.get("n"))
            .and_then(|v| v.as_int())
            .unwrap_or(0)
            > 0;
        if exists {
            let sql = format!(
                "UPDATE {} SET status='ignore' WHERE {}",
                dialect.quote_qualified(&self.name),
                self.key_where(0)
            );
            self.conn.execute(&sql, &self.key_params(key)?)?;
            return Ok(());
        }
        let now = self.server_now()?;
        let identity = worker_identity();
        let mut columns: Vec<String> = self.key_attrs.clone();
        columns.extend(
            ["status", "priority", "created_time", "scheduled_time", "user", "host", "pid",
             "connection_id", "version"]
            .map(str::to_string),
        );
        let sql = dialect.insert_sql(
            &self.name,
            &columns,
            1,
            DuplicateHandling::Skip,
            &self.key_attrs,
        );
        let mut params = self.key_params(key)?;
        params.push(Value::String("ignore".to_string()));
        params.push(Value::Int(self.conn.config().jobs.default_priority as i64));
        params.push(Value::DateTime(now));
        params.push(Value::DateTime(now));
        params.push(Value::String(identity.user));
        params.push(Value::String(identity.host));
        params.push(Value::Int(identity.pid));
        params.push(Value::Int(self.conn.connection_id() as i64));
        params.push(Value::String(self.conn.config().jobs.version.clone()));
        self.conn.execute(&sql, &params)?;
        Ok(())
    }

    // -- Inspection ----------------------------------------------------------

    /// Job counts per status, plus `"total"`.
    pub fn progress(&self) -> Result<HashMap<String, u64>> {
        let dialect = self.conn.dialect();
        let sql = format!(
            "SELECT status, count(*) AS n FROM {} GROUP BY status",
            dialect.quote_qualified(&self.name)
        );
        let rows = self.conn.query(&sql, &[])?;
        let mut out: HashMap<String, u64> =
            STATUSES.iter().map(|s| (s.to_string(), 0)).collect();
        let mut total = 0;
        for row in rows {
            let status = row
                .get("status")
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_default();
            let n = row.get("n").and_then(|v| v.as_int()).unwrap_or(0) as u64;
            total += n;
            out.insert(status, n);
        }
        out.insert("total".to_string(), total);
        Ok(out)
    }

    /// Pending, due job keys ordered by priority (most urgent first), then
    /// schedule time. `priority` filters to jobs at least that urgent.
    pub fn fetch_pending(
        &self,
        limit: Option<usize>,
        priority: Option<i64>,
    ) -> Result<Vec<Row>> {
        let dialect = self.conn.dialect();
        let now = dialect.now_plus_seconds(0.0);
        let mut sql = format!(
            "SELECT {} FROM {} WHERE status='pending' AND scheduled_time <= {now}",
            self.quoted_key_tuple(),
            dialect.quote_qualified(&self.name),
        );
        if let Some(priority) = priority {
            sql.push_str(&format!(" AND priority <= {priority}"));
        }
        sql.push_str(" ORDER BY priority ASC, scheduled_time ASC");
        if let Some(limit) = limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }
        let heading = self.heading()?;
        let rows = self.conn.query(&sql, &[])?;
        rows.into_iter()
            .map(|row| crate::fetch::decode_row(&self.conn, &heading, row))
            .collect()
    }

    /// Count of jobs in one status.
    pub fn status_count(&self, status: &str) -> Result<u64> {
        let dialect = self.conn.dialect();
        let sql = format!(
            "SELECT count(*) AS n FROM {} WHERE status={}",
            dialect.quote_qualified(&self.name),
            dialect.string_literal(status)
        );
        let rows = self.conn.query(&sql, &[])?;
        Ok(rows
            .first()
            .and_then(|r| r.get("n"))
            .and_then(|v| v.as_int())
            .unwrap_or(0) as u64)
    }

    /// Deletes all job rows (the queue definition stays).
    pub fn clear(&self) -> Result<u64> {
        let sql = format!(
            "DELETE FROM {}",
            self.conn.dialect().quote_qualified(&self.name)
        );
        self.conn.execute(&sql, &[])
    }

    /// Drops the job table.
    pub fn drop(&self) -> Result<()> {
        self.conn
            .execute_script(&self.conn.dialect().drop_table(&self.name))
    }
}

fn column(name: &str, core: CoreType, nullable: bool, default: Option<&str>) -> ColumnDdl {
    let comment = format!(":{}:", core.canonical());
    ColumnDdl {
        name: name.to_string(),
        core_type: Some(core),
        native_type: None,
        nullable,
        default: default.map(str::to_string),
        comment,
    }
}

fn truncate_error(message: &str) -> String {
    if message.len() <= ERROR_MESSAGE_LENGTH {
        return message.to_string();
    }
    let cut = ERROR_MESSAGE_LENGTH - TRUNCATION_APPENDIX.len();
    let mut cut_at = cut;
    while cut_at > 0 && !message.is_char_boundary(cut_at) {
        cut_at -= 1;
    }
    format!("{}{TRUNCATION_APPENDIX}", &message[..cut_at])
}

struct WorkerIdentity {
    user: String,
    host: String,
    pid: i64,
}

fn worker_identity() -> WorkerIdentity {
    let user = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string());
    let host = std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "localhost".to_string());
    WorkerIdentity {
        user,
        host,
        pid: std::process::id() as i64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_messages_truncate_cleanly() {
        let short = truncate_error("boom");
        assert_eq!(short, "boom");
        let long = truncate_error(&"x".repeat(5000));
        assert_eq!(long.len(), ERROR_MESSAGE_LENGTH);
        assert!(long.ends_with(TRUNCATION_APPENDIX));
    }

}
