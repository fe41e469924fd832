//! Auto-populate and the distributed job queue.

mod common;

use common::{fixture, fixture_with, int_column};
use quarry::populate::{
    populate, populate_tripartite, progress, PopulateOptions, TripartiteMake,
};
use quarry::{
    row, DeclarationContext, JobTable, RefreshOptions, Restriction, Schema, Table, Tier, Value,
};

fn declare_src_dst(schema: &Schema) -> (Table, Table) {
    let mut ctx = DeclarationContext::new();
    let src = schema
        .table(Tier::Manual, "src", "key : int32  # source key", &ctx)
        .unwrap();
    ctx.add("Src", &src);
    let dst = schema
        .table(
            Tier::Computed,
            "dst",
            "-> Src\n---\nvalue : float64  # computed",
            &ctx,
        )
        .unwrap();
    let rows: Vec<_> = (0..10).map(|k| row([("key", Value::Int(k))])).collect();
    src.insert(&rows).unwrap();
    (src, dst)
}

fn doubling_make(table: &Table, key: &quarry::Row) -> quarry::Result<()> {
    let k = key["key"].as_int().expect("int key");
    let mut out = key.clone();
    out.insert("value".to_string(), Value::Float(k as f64 * 2.0));
    table.insert1(&out)
}

#[test]
fn direct_populate_fills_missing_keys() {
    let f = fixture();
    let schema = Schema::new(&f.conn, "lab").unwrap();
    let (_src, dst) = declare_src_dst(&schema);

    assert_eq!(progress(&dst, &[]).unwrap(), (10, 10));

    let result = populate(&dst, &mut doubling_make, &PopulateOptions::default()).unwrap();
    assert_eq!(result.success_count, 10);
    assert_eq!(dst.count().unwrap(), 10);
    assert_eq!(progress(&dst, &[]).unwrap(), (0, 10));

    // populating twice adds nothing
    let again = populate(&dst, &mut doubling_make, &PopulateOptions::default()).unwrap();
    assert_eq!(again.success_count, 0);
    assert_eq!(dst.count().unwrap(), 10);

    let fetched = dst.restrict(row([("key", Value::Int(4))])).unwrap().fetch1().unwrap();
    assert_eq!(fetched["value"], Value::Float(8.0));

    // hidden job metadata columns were filled
    let stamped = f
        .conn
        .query(
            "SELECT count(*) AS n FROM \"lab\".\"__dst\" WHERE \"_job_start_time\" IS NOT NULL",
            &[],
        )
        .unwrap();
    assert_eq!(stamped[0]["n"], Value::Int(10));
}

#[test]
fn direct_inserts_into_computed_tables_are_gated() {
    let f = fixture();
    let schema = Schema::new(&f.conn, "lab").unwrap();
    let (_src, dst) = declare_src_dst(&schema);
    let err = dst
        .insert1(&row([("key", Value::Int(0)), ("value", Value::Float(0.0))]))
        .unwrap_err();
    assert!(err.to_string().contains("make()"));
}

#[test]
fn computed_tables_require_fk_derived_keys() {
    let f = fixture();
    let schema = Schema::new(&f.conn, "lab").unwrap();
    let ctx = DeclarationContext::new();
    let err = schema
        .table(
            Tier::Computed,
            "standalone",
            "run_id : int32\n---\nvalue : float64",
            &ctx,
        )
        .unwrap_err();
    assert!(err.to_string().contains("non-FK"), "{err}");
}

#[test]
fn distributed_populate_with_priorities_and_delay() {
    let f = fixture();
    let schema = Schema::new(&f.conn, "lab").unwrap();
    let (_src, dst) = declare_src_dst(&schema);
    let jobs = JobTable::for_table(&dst).unwrap();

    // queue everything at priority 3
    let counts = jobs
        .refresh(
            &[],
            &RefreshOptions {
                priority: Some(3),
                ..RefreshOptions::default()
            },
        )
        .unwrap();
    assert_eq!(counts.added, 10);

    // refresh is idempotent over a static key source
    let counts = jobs.refresh(&[], &RefreshOptions::default()).unwrap();
    assert_eq!(counts.added, 0);
    assert_eq!(counts.removed, 0);

    // urgent keys move to priority 1
    jobs.refresh(
        &[Restriction::from("key in (8, 9)")],
        &RefreshOptions {
            priority: Some(1),
            ..RefreshOptions::default()
        },
    )
    .unwrap();
    let urgent = jobs.query().unwrap().restrict("priority = 1").unwrap();
    assert_eq!(int_column(&urgent.fetch().unwrap(), "key"), [8, 9]);
    assert_eq!(jobs.status_count("pending").unwrap(), 10);

    // the two most urgent jobs run first
    let result = populate(
        &dst,
        &mut doubling_make,
        &PopulateOptions {
            reserve_jobs: true,
            max_calls: Some(2),
            ..PopulateOptions::default()
        },
    )
    .unwrap();
    assert_eq!(result.success_count, 2);
    assert_eq!(int_column(&dst.query().fetch_keys().unwrap(), "key"), [8, 9]);
    assert_eq!(jobs.status_count("pending").unwrap(), 8);

    // the rest drain on the next pass
    populate(
        &dst,
        &mut doubling_make,
        &PopulateOptions {
            reserve_jobs: true,
            ..PopulateOptions::default()
        },
    )
    .unwrap();
    assert_eq!(dst.count().unwrap(), 10);
    assert_eq!(jobs.status_count("pending").unwrap(), 0);
}

#[test]
fn delayed_jobs_are_not_due() {
    let f = fixture();
    let schema = Schema::new(&f.conn, "lab").unwrap();
    let (_src, dst) = declare_src_dst(&schema);
    let jobs = JobTable::for_table(&dst).unwrap();

    jobs.refresh(
        &[],
        &RefreshOptions {
            delay: 3600.0,
            ..RefreshOptions::default()
        },
    )
    .unwrap();
    assert_eq!(jobs.status_count("pending").unwrap(), 10);
    // nothing is due yet
    assert!(jobs.fetch_pending(None, None).unwrap().is_empty());
}

#[test]
fn reservation_is_at_most_once() {
    let f = fixture();
    let schema = Schema::new(&f.conn, "lab").unwrap();
    let (_src, dst) = declare_src_dst(&schema);
    let jobs = JobTable::for_table(&dst).unwrap();
    jobs.refresh(&[], &RefreshOptions::default()).unwrap();

    let key = row([("key", Value::Int(3))]);
    assert!(jobs.reserve(&key).unwrap());
    // a second reservation of the same key must lose
    assert!(!jobs.reserve(&key).unwrap());

    jobs.complete(&key, Some(0.25)).unwrap();
    // completed jobs are deleted by default (keep_completed = false)
    assert_eq!(jobs.status_count("success").unwrap(), 0);
    let progress = jobs.progress().unwrap();
    assert_eq!(progress["pending"], 9);
    assert_eq!(progress["total"], 9);
}

#[test]
fn failed_jobs_record_truncated_errors() {
    let f = fixture();
    let schema = Schema::new(&f.conn, "lab").unwrap();
    let (_src, dst) = declare_src_dst(&schema);

    let mut failing = |table: &Table, key: &quarry::Row| -> quarry::Result<()> {
        let k = key["key"].as_int().unwrap();
        if k == 5 {
            return Err(quarry::Error::invalid("synthetic failure on key 5"));
        }
        doubling_make(table, key)
    };
    let result = populate(
        &dst,
        &mut failing,
        &PopulateOptions {
            reserve_jobs: true,
            suppress_errors: true,
            ..PopulateOptions::default()
        },
    )
    .unwrap();
    assert_eq!(result.success_count, 9);
    assert_eq!(result.error_list.len(), 1);
    assert!(result.error_list[0].1.contains("synthetic failure"));

    let jobs = JobTable::for_table(&dst).unwrap();
    assert_eq!(jobs.status_count("error").unwrap(), 1);
    let errored = jobs.query().unwrap().restrict("status = 'error'").unwrap().fetch1().unwrap();
    assert_eq!(errored["key"], Value::Int(5));
    assert!(
        errored["error_message"]
            .as_str()
            .unwrap()
            .contains("synthetic failure")
    );

    // the failed row was rolled back
    assert_eq!(dst.count().unwrap(), 9);

    // ignoring the key hides it from future passes
    jobs.ignore(&row([("key", Value::Int(5))])).unwrap();
    assert_eq!(jobs.status_count("ignore").unwrap(), 1);
    assert!(jobs.fetch_pending(None, None).unwrap().is_empty());
}

#[test]
fn keep_completed_retains_and_repends() {
    let f = fixture_with(|config| config.jobs.keep_completed = true);
    let schema = Schema::new(&f.conn, "lab").unwrap();
    let (_src, dst) = declare_src_dst(&schema);
    let jobs = JobTable::for_table(&dst).unwrap();

    populate(
        &dst,
        &mut doubling_make,
        &PopulateOptions {
            reserve_jobs: true,
            ..PopulateOptions::default()
        },
    )
    .unwrap();
    assert_eq!(jobs.status_count("success").unwrap(), 10);

    // keys that leave the target re-pend on refresh
    dst.delete_quick(Some(Restriction::Key(row([("key", Value::Int(2))]))))
        .unwrap();
    let counts = jobs.refresh(&[], &RefreshOptions::default()).unwrap();
    assert_eq!(counts.repended, 1);
    assert_eq!(jobs.status_count("pending").unwrap(), 1);
}

struct Windowed {
    drift: bool,
    fetches: i64,
}

impl TripartiteMake for Windowed {
    type Fetched = i64;
    type Computed = f64;

    fn fetch(&mut self, _table: &Table, key: &quarry::Row) -> quarry::Result<i64> {
        self.fetches += 1;
        let base = key["key"].as_int().unwrap();
        // a drifting fetch returns a different snapshot every call
        Ok(if self.drift { base + self.fetches } else { base })
    }

    fn compute(&mut self, _table: &Table, _key: &quarry::Row, fetched: &i64) -> quarry::Result<f64> {
        Ok(*fetched as f64 * 10.0)
    }

    fn insert(
        &mut self,
        table: &Table,
        key: &quarry::Row,
        _fetched: &i64,
        computed: f64,
    ) -> quarry::Result<()> {
        let mut out = key.clone();
        out.insert("value".to_string(), Value::Float(computed));
        table.insert1(&out)
    }
}

#[test]
fn tripartite_make_inserts_and_detects_drift() {
    let f = fixture();
    let schema = Schema::new(&f.conn, "lab").unwrap();
    let (_src, dst) = declare_src_dst(&schema);

    let mut make = Windowed {
        drift: false,
        fetches: 0,
    };
    let result = populate_tripartite(&dst, &mut make, &PopulateOptions::default()).unwrap();
    assert_eq!(result.success_count, 10);
    let fetched = dst.restrict(row([("key", Value::Int(3))])).unwrap().fetch1().unwrap();
    assert_eq!(fetched["value"], Value::Float(30.0));
    // two fetches per key: one outside, one inside the transaction
    assert_eq!(make.fetches, 20);

    // drift between the fetches aborts the key with an integrity error
    let schema2 = Schema::new(&f.conn, "lab2").unwrap();
    let (_src2, dst2) = {
        let mut ctx = DeclarationContext::new();
        let src = schema2
            .table(Tier::Manual, "src", "key : int32", &ctx)
            .unwrap();
        ctx.add("Src", &src);
        let dst = schema2
            .table(Tier::Computed, "dst", "-> Src\n---\nvalue : float64", &ctx)
            .unwrap();
        src.insert1(&row([("key", Value::Int(1))])).unwrap();
        (src, dst)
    };
    let mut drifting = Windowed {
        drift: true,
        fetches: 0,
    };
    let err = populate_tripartite(&dst2, &mut drifting, &PopulateOptions::default()).unwrap_err();
    assert!(err.to_string().contains("referential integrity"), "{err}");
    assert_eq!(dst2.count().unwrap(), 0);
}

#[test]
fn renamed_foreign_keys_drive_the_key_source() {
    let f = fixture();
    let schema = Schema::new(&f.conn, "lab").unwrap();
    let mut ctx = DeclarationContext::new();
    let src = schema
        .table(Tier::Manual, "src", "key : int32  # source key", &ctx)
        .unwrap();
    // the mirror inherits the key under a new name through a projected
    // reference
    ctx.add_expression(
        "SrcRenamed",
        src.query()
            .proj(quarry::Proj::none().rename("src_key", "key"))
            .unwrap(),
    );
    let mirror = schema
        .table(
            Tier::Computed,
            "mirror",
            "-> SrcRenamed\n---\nvalue : float64",
            &ctx,
        )
        .unwrap();
    assert_eq!(mirror.heading().primary_key(), ["src_key"]);

    src.insert(&[
        row([("key", Value::Int(1))]),
        row([("key", Value::Int(2))]),
        row([("key", Value::Int(3))]),
    ])
    .unwrap();

    let mut make = |table: &Table, key: &quarry::Row| -> quarry::Result<()> {
        let mut out = key.clone();
        out.insert(
            "value".to_string(),
            Value::Float(key["src_key"].as_int().unwrap() as f64),
        );
        table.insert1(&out)
    };
    let result = populate(&mirror, &mut make, &PopulateOptions::default()).unwrap();
    assert_eq!(result.success_count, 3);
    assert_eq!(int_column(&mirror.query().fetch_keys().unwrap(), "src_key"), [1, 2, 3]);

    // the renamed attribute keeps its origin, so the join back is legal
    let joined = mirror.query().join(&src.query()).unwrap();
    assert_eq!(joined.count().unwrap(), 9);
}
