//! Cascading delete, master/part integrity, and drop ordering.

mod common;

use common::{fixture, fixture_with};
use quarry::{
    row, DeclarationContext, DeleteOptions, PartIntegrity, Restriction, Schema, Table, Tier, Value,
};

struct Pipeline {
    exp: Table,
    trial: Table,
    result: Table,
}

fn declare_pipeline(schema: &Schema) -> Pipeline {
    let mut ctx = DeclarationContext::new();
    let exp = schema
        .table(Tier::Manual, "exp", "exp_id : int32  # experiment", &ctx)
        .unwrap();
    ctx.add("Exp", &exp);
    let trial = schema
        .part(&exp, "trial", "-> Exp\ntrial : int32", &ctx)
        .unwrap();
    ctx.add("ExpTrial", &trial);
    let result = schema
        .table(
            Tier::Manual,
            "result",
            "-> ExpTrial\n---\nscore=null : float64",
            &ctx,
        )
        .unwrap();
    Pipeline { exp, trial, result }
}

fn seed(p: &Pipeline) {
    p.exp.insert1(&row([("exp_id", Value::Int(1))])).unwrap();
    p.trial
        .insert(&[
            row([("exp_id", Value::Int(1)), ("trial", Value::Int(1))]),
            row([("exp_id", Value::Int(1)), ("trial", Value::Int(2))]),
        ])
        .unwrap();
    p.result
        .insert(&[
            row([("exp_id", Value::Int(1)), ("trial", Value::Int(1))]),
            row([("exp_id", Value::Int(1)), ("trial", Value::Int(2))]),
        ])
        .unwrap();
}

#[test]
fn cascading_delete_through_parts() {
    let f = fixture();
    let schema = Schema::new(&f.conn, "lab").unwrap();
    let p = declare_pipeline(&schema);
    seed(&p);

    // a quick delete is blocked by referencing children
    let err = p.exp.delete_quick(None).unwrap_err();
    assert!(err.is_integrity(), "{err}");

    // the cascade clears the experiment, its trials, and their results
    let deleted = p.exp.delete(DeleteOptions::default()).unwrap();
    assert_eq!(deleted, 1);
    assert_eq!(p.exp.count().unwrap(), 0);
    assert_eq!(p.trial.count().unwrap(), 0);
    assert_eq!(p.result.count().unwrap(), 0);
}

#[test]
fn restricted_delete_only_cascades_matching_rows() {
    let f = fixture();
    let schema = Schema::new(&f.conn, "lab").unwrap();
    let p = declare_pipeline(&schema);
    seed(&p);
    p.exp.insert1(&row([("exp_id", Value::Int(2))])).unwrap();
    p.trial
        .insert1(&row([("exp_id", Value::Int(2)), ("trial", Value::Int(1))]))
        .unwrap();

    let deleted = p
        .exp
        .delete(DeleteOptions {
            restriction: Some(Restriction::Key(row([("exp_id", Value::Int(1))]))),
            ..DeleteOptions::default()
        })
        .unwrap();
    assert_eq!(deleted, 1);
    assert_eq!(p.exp.count().unwrap(), 1);
    assert_eq!(p.trial.count().unwrap(), 1);
    assert_eq!(p.result.count().unwrap(), 0);
}

#[test]
fn part_integrity_enforce_rolls_back() {
    let f = fixture();
    let schema = Schema::new(&f.conn, "lab").unwrap();
    let p = declare_pipeline(&schema);
    seed(&p);

    // deleting the part while its master rows remain violates integrity
    // and the whole transaction rolls back
    let err = p.trial.delete(DeleteOptions::default()).unwrap_err();
    assert!(err.to_string().contains("master"), "{err}");
    assert_eq!(p.exp.count().unwrap(), 1);
    assert_eq!(p.trial.count().unwrap(), 2);
    assert_eq!(p.result.count().unwrap(), 2);

    // with the policy relaxed the part goes and the master stays
    p.trial
        .delete(DeleteOptions {
            part_integrity: PartIntegrity::Ignore,
            ..DeleteOptions::default()
        })
        .unwrap();
    assert_eq!(p.exp.count().unwrap(), 1);
    assert_eq!(p.trial.count().unwrap(), 0);
    assert_eq!(p.result.count().unwrap(), 0);
}

#[test]
fn safemode_gates_destructive_operations() {
    let f = fixture_with(|config| config.safemode = true);
    let schema = Schema::new(&f.conn, "lab").unwrap();
    let p = declare_pipeline(&schema);
    seed(&p);

    let err = p.exp.delete(DeleteOptions::default()).unwrap_err();
    assert!(err.to_string().contains("safemode"));
    assert_eq!(p.result.count().unwrap(), 2);

    let err = p.exp.drop(false).unwrap_err();
    assert!(err.to_string().contains("safemode"));

    // explicit confirmation overrides the gate
    p.exp
        .delete(DeleteOptions {
            confirmed: true,
            ..DeleteOptions::default()
        })
        .unwrap();
    assert_eq!(p.result.count().unwrap(), 0);
}

#[test]
fn drop_cascades_children_first() {
    let f = fixture();
    let schema = Schema::new(&f.conn, "lab").unwrap();
    let p = declare_pipeline(&schema);
    seed(&p);

    // a part cannot be dropped ahead of its master
    let err = p.trial.drop(true).unwrap_err();
    assert!(err.to_string().contains("master"), "{err}");

    p.exp.drop(true).unwrap();
    assert!(schema.list_tables().unwrap().is_empty());
}

#[test]
fn delete_returns_zero_on_empty_restriction() {
    let f = fixture();
    let schema = Schema::new(&f.conn, "lab").unwrap();
    let p = declare_pipeline(&schema);
    seed(&p);

    let deleted = p
        .exp
        .delete(DeleteOptions {
            restriction: Some(Restriction::Key(row([("exp_id", Value::Int(99))]))),
            ..DeleteOptions::default()
        })
        .unwrap();
    assert_eq!(deleted, 0);
    assert_eq!(p.result.count().unwrap(), 2);
}
