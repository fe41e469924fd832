//! Auto-populate: walking the key source and running `make` per key.
//!
//! The key source defaults to the join of the tables referenced by the
//! target's primary foreign keys; every key it yields that is absent from
//! the target becomes one `make` call inside one transaction. Distributed
//! runs coordinate through the per-table job queue instead.

use std::collections::HashSet;
use std::time::Instant;

use tracing::{debug, info};

use quarry_core::error::{Error, Result};
use quarry_core::value::{Row, Value};

use crate::condition::Restriction;
use crate::expression::{Proj, QueryExpression};
use crate::jobs::{JobTable, RefreshOptions};
use crate::table::{proj_renamed, restrict_permissive, Table};

/// The classic single-shot make callback: fetch, compute, and insert in
/// one transaction. Implemented by closures `FnMut(&Table, &Row) ->
/// Result<()>`.
pub trait Make {
    fn make(&mut self, table: &Table, key: &Row) -> Result<()>;
}

impl<F> Make for F
where
    F: FnMut(&Table, &Row) -> Result<()>,
{
    fn make(&mut self, table: &Table, key: &Row) -> Result<()> {
        self(table, key)
    }
}

/// The tripartite make protocol: fetch and compute run outside the
/// transaction; inside it the fetch repeats and must match before the
/// insert proceeds. Keeps transactions short for long computations.
pub trait TripartiteMake {
    /// What `fetch` returns; compared for drift between the two fetches.
    type Fetched: PartialEq;
    type Computed;

    fn fetch(&mut self, table: &Table, key: &Row) -> Result<Self::Fetched>;

    fn compute(
        &mut self,
        table: &Table,
        key: &Row,
        fetched: &Self::Fetched,
    ) -> Result<Self::Computed>;

    fn insert(
        &mut self,
        table: &Table,
        key: &Row,
        fetched: &Self::Fetched,
        computed: Self::Computed,
    ) -> Result<()>;
}

/// Options for [`populate`] and [`populate_tripartite`].
#[derive(Clone, Default)]
pub struct PopulateOptions {
    /// Conditions applied to the key source.
    pub restrictions: Vec<Restriction>,
    /// Collect per-key errors instead of stopping at the first.
    pub suppress_errors: bool,
    /// Coordinate through the job table (distributed mode).
    pub reserve_jobs: bool,
    /// Upper bound on make calls this invocation.
    pub max_calls: Option<usize>,
    /// Only process jobs at least this urgent (smaller is more urgent).
    pub priority: Option<i64>,
    /// Refresh the job queue first; default from configuration.
    pub refresh: Option<bool>,
}

/// Outcome of a populate run.
#[derive(Debug, Default)]
pub struct PopulateResult {
    pub success_count: usize,
    /// `(key, error message)` for failed keys when errors are suppressed.
    pub error_list: Vec<(Row, String)>,
}

/// The default key source: the join of the primary-FK parents, renamed
/// through aliased edges, projected to primary keys.
pub fn key_source(table: &Table) -> Result<QueryExpression> {
    let conn = table.connection().clone();
    let node = table.qualified_name().to_string();
    let parents = conn.with_graph(false, |graph| graph.parents(&node, Some(true)))?;
    if parents.is_empty() {
        return Err(Error::invalid(format!(
            "`{}` must have dependencies from its primary key for auto-populate to work",
            table.qualified_name()
        )));
    }
    let mut source: Option<QueryExpression> = None;
    for (parent, props) in parents {
        let name = quarry_core::QualifiedName::parse(&parent)?;
        let heading = crate::introspect::load_heading(&conn, &name)?;
        let base = QueryExpression::base(conn.clone(), name, heading);
        let renamed = proj_renamed(&base, &props.attr_map)?;
        source = Some(match source {
            None => renamed,
            Some(acc) => acc.join(&renamed)?,
        });
    }
    source.expect("at least one parent").proj(Proj::none())
}

/// The keys still to be computed: `(key_source & restrictions) - target`.
pub fn remaining_keys(table: &Table, restrictions: &[Restriction]) -> Result<QueryExpression> {
    let mut source = key_source(table)?;
    for restriction in restrictions {
        source = restrict_permissive(&source, restriction.clone())?;
    }
    for name in source.heading().primary_key() {
        if table.heading().get(&name).is_none() {
            return Err(Error::invalid(format!(
                "the populate target lacks attribute `{name}` from the primary key of its \
                 key source"
            )));
        }
    }
    restrict_permissive(
        &source,
        Restriction::In(table.query().proj(Proj::none())?).negate(),
    )
}

/// Progress of population: `(remaining, total)` keys.
pub fn progress(table: &Table, restrictions: &[Restriction]) -> Result<(u64, u64)> {
    let mut source = key_source(table)?;
    for restriction in restrictions {
        source = restrict_permissive(&source, restriction.clone())?;
    }
    let total = source.count()?;
    let remaining = remaining_keys(table, restrictions)?.count()?;
    Ok((remaining, total))
}

/// Populates a table with a single-shot [`Make`] callback.
pub fn populate(
    table: &Table,
    make: &mut dyn Make,
    options: &PopulateOptions,
) -> Result<PopulateResult> {
    run_populate(table, options, &mut |table, key| make.make(table, key), &|_| false)
}

/// Populates a table with the tripartite protocol.
pub fn populate_tripartite<M: TripartiteMake>(
    table: &Table,
    make: &mut M,
    options: &PopulateOptions,
) -> Result<PopulateResult> {
    // fetch + compute happen before the transaction opens; the in-transaction
    // fetch must agree or the key is aborted with an integrity error
    let conn = table.connection().clone();
    let mut step = |worktable: &Table, key: &Row| -> Result<()> {
        let fetched = make.fetch(worktable, key)?;
        let computed = make.compute(worktable, key, &fetched)?;
        conn.start_transaction()?;
        let outcome = (|| {
            if worktable.query().contains(key)? {
                return Ok(false);
            }
            let refetched = make.fetch(worktable, key)?;
            if refetched != fetched {
                return Err(Error::invalid(
                    "referential integrity failed: the fetched data changed before insert",
                ));
            }
            make.insert(worktable, key, &refetched, computed)?;
            Ok(true)
        })();
        match outcome {
            Ok(_) => conn.commit_transaction(),
            Err(e) => {
                let _ = conn.cancel_transaction();
                Err(e)
            }
        }
    };
    run_populate(table, options, &mut step, &|_| true)
}

/// The shared populate loop. `owns_transaction(key)` tells whether the
/// step manages its own transaction (tripartite) or the loop wraps it.
fn run_populate(
    table: &Table,
    options: &PopulateOptions,
    step: &mut dyn FnMut(&Table, &Row) -> Result<()>,
    step_owns_transaction: &dyn Fn(&Row) -> bool,
) -> Result<PopulateResult> {
    let conn = table.connection().clone();
    if conn.in_transaction() {
        return Err(Error::invalid("populate cannot run inside a transaction"));
    }

    let jobs = if options.reserve_jobs {
        Some(JobTable::for_table(table)?)
    } else {
        None
    };

    let keys: Vec<Row> = match &jobs {
        Some(jobs) => {
            let refresh = options
                .refresh
                .unwrap_or(conn.config().jobs.auto_refresh);
            if refresh {
                jobs.refresh(
                    &options.restrictions,
                    &RefreshOptions {
                        priority: options.priority,
                        ..RefreshOptions::default()
                    },
                )?;
            }
            jobs.fetch_pending(options.max_calls, options.priority)?
        }
        None => {
            let mut keys = remaining_keys(table, &options.restrictions)?.fetch_keys()?;
            if let Some(max) = options.max_calls {
                keys.truncate(max);
            }
            keys
        }
    };
    debug!(table = %table.qualified_name(), keys = keys.len(), "keys to populate");

    // the handle handed to make() may insert into the auto-populated target
    let mut worktable = table.clone();
    worktable.inserts_allowed = true;
    let has_job_metadata = table
        .heading()
        .all_attributes()
        .any(|a| a.name == "_job_start_time");

    let mut result = PopulateResult::default();
    for key in keys {
        if let Some(jobs) = &jobs {
            if !jobs.reserve(&key)? {
                continue;
            }
        }
        let started = Instant::now();
        let start_stamp = chrono::Utc::now().naive_utc();
        let owns_transaction = step_owns_transaction(&key);

        if !owns_transaction {
            conn.start_transaction()?;
            if table.query().contains(&key)? {
                conn.cancel_transaction()?;
                if let Some(jobs) = &jobs {
                    jobs.complete(&key, None)?;
                }
                continue;
            }
        }

        match step(&worktable, &key) {
            Ok(()) => {
                if !owns_transaction {
                    conn.commit_transaction()?;
                }
                let duration = started.elapsed().as_secs_f64();
                if has_job_metadata {
                    update_job_metadata(table, &key, start_stamp, duration)?;
                }
                if let Some(jobs) = &jobs {
                    jobs.complete(&key, Some(duration))?;
                }
                result.success_count += 1;
                debug!(table = %table.qualified_name(), ?key, "populated");
            }
            Err(error) => {
                if !owns_transaction {
                    let _ = conn.cancel_transaction();
                }
                let message = error.to_string();
                if let Some(jobs) = &jobs {
                    jobs.error(&key, &message, Some(message.as_bytes()))?;
                }
                if !options.suppress_errors {
                    return Err(error);
                }
                result.error_list.push((key, message));
            }
        }
    }

    info!(
        table = %table.qualified_name(),
        success = result.success_count,
        errors = result.error_list.len(),
        "populate finished"
    );
    Ok(result)
}

/// Fills the hidden `_job_*` columns after a successful make.
fn update_job_metadata(
    table: &Table,
    key: &Row,
    start_time: chrono::NaiveDateTime,
    duration: f64,
) -> Result<()> {
    let conn = table.connection();
    let primary_key: Vec<String> = table
        .heading()
        .primary_key()
        .into_iter()
        .filter(|name| key.contains_key(name))
        .collect();
    if primary_key.is_empty() {
        return Ok(());
    }
    let set = vec![
        "_job_start_time".to_string(),
        "_job_duration".to_string(),
        "_job_version".to_string(),
    ];
    let sql = conn
        .dialect()
        .update_sql(table.qualified_name(), &set, &primary_key);
    let mut version = conn.config().jobs.version.clone();
    version.truncate(64);
    let mut params = vec![
        Value::DateTime(start_time),
        Value::Float(duration),
        Value::String(version),
    ];
    for name in &primary_key {
        params.push(key[name.as_str()].clone());
    }
    conn.execute(&sql, &params)?;
    Ok(())
}

/// Keys whose population previously failed, for re-runs after fixes.
pub fn failed_keys(jobs: &JobTable) -> Result<Vec<Row>> {
    let query = jobs.query()?.restrict("status='error'")?;
    let keys: Vec<Row> = query
        .fetch()?
        .into_iter()
        .map(|row| {
            let mut key = Row::new();
            for attr in jobs.key_attributes() {
                if let Some(value) = row.get(attr) {
                    key.insert(attr.clone(), value.clone());
                }
            }
            key
        })
        .collect();
    // preserve first-failed order without duplicates
    let mut seen = HashSet::new();
    Ok(keys
        .into_iter()
        .filter(|k| seen.insert(format!("{k:?}")))
        .collect())
}
