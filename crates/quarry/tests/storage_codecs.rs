//! External storage end to end: hash-addressed dedup, garbage
//! collection, attachments, file references, schema-addressed objects,
//! arrays, and staged inserts.

mod common;

use common::fixture;
use quarry::{row, DeclarationContext, NdArray, Schema, Table, Tier, Value};
use quarry_codec::{NpyRef, ObjectRef};
use quarry_store::{LocalStore, ObjectStore};

fn blob_table(schema: &Schema, name: &str) -> Table {
    let ctx = DeclarationContext::new();
    schema
        .table(
            Tier::Manual,
            name,
            "id : int32\n---\ndata : <blob@>  # payload",
            &ctx,
        )
        .unwrap()
}

#[test]
fn hash_storage_deduplicates_within_schema() {
    let f = fixture();
    let schema = Schema::new(&f.conn, "lab").unwrap();
    let t1 = blob_table(&schema, "t_one");
    let t2 = blob_table(&schema, "t_two");
    let store = LocalStore::new(f.store_dir.path()).unwrap();

    let payload = Value::Bytes(vec![42u8; 10 * 1024]);
    t1.insert1(&row([("id", Value::Int(1)), ("data", payload.clone())]))
        .unwrap();
    t2.insert1(&row([("id", Value::Int(1)), ("data", payload.clone())]))
        .unwrap();

    // same bytes in the same schema: exactly one stored object
    assert_eq!(store.list("_hash/lab").unwrap().len(), 1);

    // the fetch pipeline restores the original value
    let fetched = t2.query().fetch1().unwrap();
    assert_eq!(fetched["data"], payload);

    // no orphans while either row lives
    let report = quarry::gc::scan(&f.conn, &["lab"], None).unwrap();
    assert_eq!(report.hash.stored, 1);
    assert!(report.hash.orphaned.is_empty());

    t1.delete_quick(None).unwrap();
    let report = quarry::gc::scan(&f.conn, &["lab"], None).unwrap();
    assert!(report.hash.orphaned.is_empty());

    t2.delete_quick(None).unwrap();
    let report = quarry::gc::scan(&f.conn, &["lab"], None).unwrap();
    assert_eq!(report.hash.orphaned.len(), 1);

    // dry run reports without removing
    quarry::gc::collect(&f.conn, &["lab"], None, true).unwrap();
    assert_eq!(store.list("_hash/lab").unwrap().len(), 1);

    let report = quarry::gc::collect(&f.conn, &["lab"], None, false).unwrap();
    assert_eq!(report.deleted, 1);
    assert!(store.list("_hash/lab").unwrap().is_empty());
}

#[test]
fn in_table_blob_stores_structured_values() {
    let f = fixture();
    let schema = Schema::new(&f.conn, "lab").unwrap();
    let ctx = DeclarationContext::new();
    let table = schema
        .table(
            Tier::Manual,
            "analysis",
            "id : int32\n---\nresult : <blob>",
            &ctx,
        )
        .unwrap();

    let value = Value::Map(vec![
        (
            Value::String("trace".into()),
            Value::Array(NdArray::from_f64(&[3, 4], &(0..12).map(f64::from).collect::<Vec<_>>()).unwrap()),
        ),
        (Value::String("label".into()), Value::String("run-1".into())),
        (
            Value::String("tags".into()),
            Value::Set(vec![Value::Int(1), Value::Int(2), Value::Int(3)]),
        ),
    ]);
    table
        .insert1(&row([("id", Value::Int(1)), ("result", value.clone())]))
        .unwrap();
    assert_eq!(table.query().fetch1().unwrap()["result"], value);
}

#[test]
fn attachments_download_and_deduplicate() {
    let f = fixture();
    let schema = Schema::new(&f.conn, "lab").unwrap();
    let ctx = DeclarationContext::new();
    let table = schema
        .table(
            Tier::Manual,
            "protocol",
            "id : int32\n---\ndoc : <attach>",
            &ctx,
        )
        .unwrap();

    let source = f.store_dir.path().join("notes.txt");
    std::fs::write(&source, b"protocol text").unwrap();
    table
        .insert1(&row([
            ("id", Value::Int(1)),
            ("doc", Value::String(source.display().to_string())),
        ]))
        .unwrap();

    let fetched = table.query().fetch1().unwrap();
    let local = match &fetched["doc"] {
        Value::String(path) => path.clone(),
        other => panic!("expected a path, got {other:?}"),
    };
    assert!(local.ends_with("notes.txt"));
    assert_eq!(std::fs::read(&local).unwrap(), b"protocol text");

    // fetching again reuses the identical download
    let again = table.query().fetch1().unwrap();
    assert_eq!(again["doc"], Value::String(local));
}

#[test]
fn filepath_references_without_copying() {
    let f = fixture();
    let schema = Schema::new(&f.conn, "lab").unwrap();
    let ctx = DeclarationContext::new();
    let table = schema
        .table(
            Tier::Manual,
            "raw_file",
            "id : int32\n---\npath : <filepath@>",
            &ctx,
        )
        .unwrap();
    let store = LocalStore::new(f.store_dir.path()).unwrap();
    store.put_buffer("acquired/run1.dat", b"raw").unwrap();

    // a missing file fails at insert
    assert!(
        table
            .insert1(&row([
                ("id", Value::Int(1)),
                ("path", Value::String("acquired/missing.dat".into())),
            ]))
            .is_err()
    );
    // reserved prefixes are rejected
    assert!(
        table
            .insert1(&row([
                ("id", Value::Int(1)),
                ("path", Value::String("_hash/lab/x".into())),
            ]))
            .is_err()
    );

    table
        .insert1(&row([
            ("id", Value::Int(1)),
            ("path", Value::String("acquired/run1.dat".into())),
        ]))
        .unwrap();
    assert_eq!(
        table.query().fetch1().unwrap()["path"],
        Value::String("acquired/run1.dat".into())
    );
}

#[test]
fn object_codec_stores_at_schema_addressed_paths() {
    let f = fixture();
    let schema = Schema::new(&f.conn, "lab").unwrap();
    let ctx = DeclarationContext::new();
    let table = schema
        .table(
            Tier::Manual,
            "recording",
            "id : int32\n---\nsignal : <object@>",
            &ctx,
        )
        .unwrap();

    table
        .insert1(&row([
            ("id", Value::Int(7)),
            ("signal", Value::Bytes(b"signal payload".to_vec())),
        ]))
        .unwrap();

    let fetched = table.query().fetch1().unwrap();
    let object = ObjectRef::from_value(&fetched["signal"], f.conn.stores()).unwrap();
    assert!(object.metadata.path.starts_with("lab/recording/"));
    assert_eq!(object.read().unwrap(), b"signal payload");

    // the same entity maps to the same path on re-insert
    table.delete_quick(None).unwrap();
    table
        .insert1(&row([
            ("id", Value::Int(7)),
            ("signal", Value::Bytes(b"signal payload".to_vec())),
        ]))
        .unwrap();
    let fetched_again = table.query().fetch1().unwrap();
    let object_again = ObjectRef::from_value(&fetched_again["signal"], f.conn.stores()).unwrap();
    assert_eq!(object.metadata.path, object_again.metadata.path);
}

#[test]
fn npy_codec_returns_lazy_references() {
    let f = fixture();
    let schema = Schema::new(&f.conn, "lab").unwrap();
    let ctx = DeclarationContext::new();
    let table = schema
        .table(
            Tier::Manual,
            "trace",
            "id : int32\n---\nsamples : <npy@>",
            &ctx,
        )
        .unwrap();

    let array = NdArray::from_f64(&[2, 3], &[0.5, 1.5, 2.5, 3.5, 4.5, 5.5]).unwrap();
    table
        .insert1(&row([
            ("id", Value::Int(1)),
            ("samples", Value::Array(array.clone())),
        ]))
        .unwrap();

    let fetched = table.query().fetch1().unwrap();
    let lazy = NpyRef::from_value(&fetched["samples"], f.conn.stores()).unwrap();
    // shape, dtype, and size come from metadata without touching storage
    assert_eq!(lazy.shape(), [2, 3]);
    assert_eq!(lazy.dtype().as_deref(), Some("<f8"));
    assert_eq!(lazy.nbytes(), 48);
    assert_eq!(lazy.load().unwrap(), array);
}

#[test]
fn staged_insert_uploads_then_inserts() {
    let f = fixture();
    let schema = Schema::new(&f.conn, "lab").unwrap();
    let ctx = DeclarationContext::new();
    let table = schema
        .table(
            Tier::Manual,
            "bundle",
            "id : int32\n---\npayload : <object@>\nnote=\"\" : varchar(64)",
            &ctx,
        )
        .unwrap();
    let store = LocalStore::new(f.store_dir.path()).unwrap();

    // abandoned stages clean up their uploads
    {
        let mut stage = table
            .staged_insert(row([("id", Value::Int(1))]))
            .unwrap();
        stage.store_bytes("payload", Some("bin"), b"giant").unwrap();
        assert_eq!(store.list("lab/bundle").unwrap().len(), 1);
    }
    assert!(store.list("lab/bundle").unwrap().is_empty());
    assert_eq!(table.count().unwrap(), 0);

    // committed stages insert the row with the staged metadata
    let mut stage = table
        .staged_insert(row([
            ("id", Value::Int(1)),
            ("note", Value::String("staged".into())),
        ]))
        .unwrap();
    stage.store_bytes("payload", Some("bin"), b"giant").unwrap();
    stage.commit().unwrap();

    assert_eq!(table.count().unwrap(), 1);
    let fetched = table.query().fetch1().unwrap();
    let object = ObjectRef::from_value(&fetched["payload"], f.conn.stores()).unwrap();
    assert_eq!(object.read().unwrap(), b"giant");
    assert_eq!(fetched["note"], Value::String("staged".into()));

    // a second stage for the same key is refused
    assert!(table.staged_insert(row([("id", Value::Int(1))])).is_err());
}
