//! Declaration, insert, fetch, and the query algebra, end to end on the
//! embedded SQLite backend.

mod common;

use common::{fixture, int_column};
use quarry::{
    row, DeclarationContext, Error, InsertOptions, Proj, Restriction, Schema, Table, Tier, Top,
    Universal, Value,
};

fn declare_subject_session(schema: &Schema, ctx: &mut DeclarationContext) -> (Table, Table) {
    let subject = schema
        .table(
            Tier::Manual,
            "subject",
            "subject_id : int32  # subject identifier",
            ctx,
        )
        .expect("declare subject");
    ctx.add("Subject", &subject);
    let session = schema
        .table(
            Tier::Manual,
            "session",
            "# experimental sessions\n\
             -> Subject\n\
             session_id : int32\n\
             ---\n\
             weight=null : float64  # grams",
            ctx,
        )
        .expect("declare session");
    ctx.add("Session", &session);
    (subject, session)
}

fn seed(subject: &Table, session: &Table) {
    subject
        .insert(&[
            row([("subject_id", Value::Int(1))]),
            row([("subject_id", Value::Int(2))]),
        ])
        .unwrap();
    session
        .insert(&[
            row([("subject_id", Value::Int(1)), ("session_id", Value::Int(10))]),
            row([("subject_id", Value::Int(1)), ("session_id", Value::Int(11))]),
            row([("subject_id", Value::Int(2)), ("session_id", Value::Int(10))]),
        ])
        .unwrap();
}

#[test]
fn declare_insert_fetch_join() {
    let f = fixture();
    let schema = Schema::new(&f.conn, "lab").unwrap();
    let mut ctx = DeclarationContext::new();
    let (subject, session) = declare_subject_session(&schema, &mut ctx);
    seed(&subject, &session);

    // join yields exactly the three matching rows
    let joined = subject.query().join(&session.query()).unwrap();
    assert_eq!(joined.count().unwrap(), 3);
    let rows = joined.fetch().unwrap();
    assert!(rows.iter().all(|r| r.contains_key("weight")));

    // restriction by key
    let ones = session.restrict(row([("subject_id", Value::Int(1))])).unwrap();
    assert_eq!(ones.count().unwrap(), 2);
    assert_eq!(int_column(&ones.fetch().unwrap(), "session_id"), [10, 11]);

    // antijoin: every subject has sessions
    let lonely = subject.query().exclude(session.query()).unwrap();
    assert_eq!(lonely.count().unwrap(), 0);

    // join is commutative in the result set
    let flipped = session.query().join(&subject.query()).unwrap();
    assert_eq!(flipped.count().unwrap(), 3);
}

#[test]
fn restriction_laws() {
    let f = fixture();
    let schema = Schema::new(&f.conn, "lab").unwrap();
    let mut ctx = DeclarationContext::new();
    let (subject, session) = declare_subject_session(&schema, &mut ctx);
    seed(&subject, &session);

    let q = session.query();
    let c = Restriction::from("subject_id = 1");
    let d = Restriction::from("session_id = 10");

    // Q & C & D == Q & AndList([C, D])
    let chained = q.restrict(c.clone()).unwrap().restrict(d.clone()).unwrap();
    let anded = q
        .restrict(Restriction::And(vec![c.clone(), d.clone()]))
        .unwrap();
    assert_eq!(chained.fetch().unwrap(), anded.fetch().unwrap());
    assert_eq!(chained.count().unwrap(), 1);

    // Q - C == Q & Not(C)
    let minus = q.exclude(c.clone()).unwrap();
    let negated = q.restrict(c.negate()).unwrap();
    assert_eq!(minus.count().unwrap(), negated.count().unwrap());
    assert_eq!(minus.count().unwrap(), 1);

    // empty OR list admits nothing through restrict, everything through
    // exclude
    assert_eq!(q.restrict(Restriction::Or(vec![])).unwrap().count().unwrap(), 0);
    assert_eq!(q.exclude(Restriction::Or(vec![])).unwrap().count().unwrap(), 3);

    // restriction by a list of keys ORs them
    let keys = vec![
        row([("session_id", Value::Int(10))]),
        row([("session_id", Value::Int(11))]),
    ];
    assert_eq!(q.restrict(keys).unwrap().count().unwrap(), 3);
}

#[test]
fn projection_rename_and_compute() {
    let f = fixture();
    let schema = Schema::new(&f.conn, "lab").unwrap();
    let mut ctx = DeclarationContext::new();
    let (subject, session) = declare_subject_session(&schema, &mut ctx);
    seed(&subject, &session);

    let renamed = session
        .query()
        .proj(Proj::none().rename("sid", "session_id"))
        .unwrap();
    assert_eq!(renamed.heading().primary_key(), ["subject_id", "sid"]);
    assert_eq!(int_column(&renamed.fetch().unwrap(), "sid"), [10, 10, 11]);

    let computed = session
        .query()
        .proj(Proj::none().compute("double_id", "session_id * 2"))
        .unwrap();
    assert_eq!(int_column(&computed.fetch().unwrap(), "double_id"), [20, 20, 22]);

    // restricting on a dropped attribute still works through a subquery
    let restricted = session.restrict("session_id = 11").unwrap();
    let projected = restricted.proj(Proj::none().rename("sid", "session_id")).unwrap();
    assert_eq!(projected.count().unwrap(), 1);
}

#[test]
fn top_ordering_and_merge() {
    let f = fixture();
    let schema = Schema::new(&f.conn, "lab").unwrap();
    let mut ctx = DeclarationContext::new();
    let (subject, session) = declare_subject_session(&schema, &mut ctx);
    seed(&subject, &session);

    let top = session
        .query()
        .restrict(Top::with_order(2, &["session_id DESC", "subject_id"]))
        .unwrap();
    let rows = top.fetch().unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["session_id"], Value::Int(11));

    // merging: limits take the minimum, offsets add
    let merged = session
        .query()
        .restrict(Top::with_order(3, &["session_id"]))
        .unwrap()
        .restrict(Top {
            limit: Some(2),
            order_by: None,
            offset: 1,
        })
        .unwrap();
    assert_eq!(merged.fetch().unwrap().len(), 2);
}

#[test]
fn aggregation_counts_children() {
    let f = fixture();
    let schema = Schema::new(&f.conn, "lab").unwrap();
    let mut ctx = DeclarationContext::new();
    let (subject, session) = declare_subject_session(&schema, &mut ctx);
    seed(&subject, &session);

    let counts = subject
        .query()
        .aggr(&session.query(), &[("n", "count(session_id)")], false)
        .unwrap();
    let rows = counts.fetch().unwrap();
    assert_eq!(rows.len(), 2);
    let n_for = |id: i64| {
        rows.iter()
            .find(|r| r["subject_id"] == Value::Int(id))
            .and_then(|r| r["n"].as_int())
            .unwrap()
    };
    assert_eq!(n_for(1), 2);
    assert_eq!(n_for(2), 1);

    // aggregate without grouping through the universal set
    let total = Universal::new()
        .aggr(&session.query(), &[("n", "count(*)")])
        .unwrap();
    assert_eq!(total.fetch1().unwrap()["n"], Value::Int(3));

    // distinct values through the universal set
    let distinct = Universal::over(["subject_id"])
        .restrict(&session.query())
        .unwrap();
    assert_eq!(distinct.count().unwrap(), 2);
}

#[test]
fn union_of_restrictions() {
    let f = fixture();
    let schema = Schema::new(&f.conn, "lab").unwrap();
    let mut ctx = DeclarationContext::new();
    let (subject, session) = declare_subject_session(&schema, &mut ctx);
    seed(&subject, &session);

    let ones = session.restrict("subject_id = 1").unwrap();
    let twos = session.restrict("subject_id = 2").unwrap();
    let all = ones.union(&twos).unwrap();
    assert_eq!(all.count().unwrap(), 3);
    assert_eq!(all.heading().primary_key(), ["subject_id", "session_id"]);

    // union demands identical primary keys
    assert!(subject.query().union(&session.query()).is_err());
}

#[test]
fn semantic_join_rejects_different_lineages() {
    let f = fixture();
    let schema = Schema::new(&f.conn, "lab").unwrap();
    let ctx = DeclarationContext::new();
    let a = schema
        .table(Tier::Manual, "subject_a", "id : int32  # a's id", &ctx)
        .unwrap();
    let b = schema
        .table(Tier::Manual, "subject_b", "id : int32  # b's id", &ctx)
        .unwrap();
    a.insert(&[row([("id", Value::Int(1))]), row([("id", Value::Int(2))])])
        .unwrap();
    b.insert(&[
        row([("id", Value::Int(1))]),
        row([("id", Value::Int(2))]),
        row([("id", Value::Int(3))]),
    ])
    .unwrap();

    let err = a.query().join(&b.query()).unwrap_err();
    assert!(err.to_string().contains("different lineages"), "{err}");

    // renaming resolves the collision and yields the cartesian product
    let renamed = b.query().proj(Proj::none().rename("b_id", "id")).unwrap();
    let product = a.query().join(&renamed).unwrap();
    assert_eq!(product.count().unwrap(), 6);

    // the permissive join matches namesakes without the check
    let permissive = a.query().join_permissive(&b.query()).unwrap();
    assert_eq!(permissive.count().unwrap(), 2);
}

#[test]
fn insert_error_suggestions_and_options() {
    let f = fixture();
    let schema = Schema::new(&f.conn, "lab").unwrap();
    let mut ctx = DeclarationContext::new();
    let (subject, _session) = declare_subject_session(&schema, &mut ctx);
    subject.insert1(&row([("subject_id", Value::Int(1))])).unwrap();

    // duplicate comes back with the actionable suggestion
    let err = subject.insert1(&row([("subject_id", Value::Int(1))])).unwrap_err();
    assert!(matches!(err, Error::Duplicate(_)));
    assert!(err.to_string().contains("skip_duplicates"));
    subject
        .insert_with(
            &[row([("subject_id", Value::Int(1))])],
            &InsertOptions {
                skip_duplicates: true,
                ..InsertOptions::default()
            },
        )
        .unwrap();

    // unknown field suggests ignore_extra_fields
    let bad = row([("subject_id", Value::Int(3)), ("ghost", Value::Int(0))]);
    let err = subject.insert1(&bad).unwrap_err();
    assert!(matches!(err, Error::UnknownAttribute(_)));
    assert!(err.to_string().contains("ignore_extra_fields"));
    subject
        .insert_with(
            &[bad],
            &InsertOptions {
                ignore_extra_fields: true,
                ..InsertOptions::default()
            },
        )
        .unwrap();
    assert_eq!(subject.count().unwrap(), 2);
}

#[test]
fn all_defaults_insert() {
    let f = fixture();
    let schema = Schema::new(&f.conn, "lab").unwrap();
    let ctx = DeclarationContext::new();
    let table = schema
        .table(
            Tier::Lookup,
            "setting",
            "setting_id=1 : int32\n---\nlabel=\"default\" : varchar(32)",
            &ctx,
        )
        .unwrap();
    table.insert1(&quarry::Row::new()).unwrap();
    let fetched = table.query().fetch1().unwrap();
    assert_eq!(fetched["setting_id"], Value::Int(1));
    assert_eq!(fetched["label"], Value::String("default".into()));
}

#[test]
fn declaration_boundaries() {
    let f = fixture();
    let schema = Schema::new(&f.conn, "lab").unwrap();
    let ctx = DeclarationContext::new();

    // table names beyond 64 characters are rejected
    let long = "x".repeat(65);
    assert!(schema.table(Tier::Manual, &long, "id : int32", &ctx).is_err());

    // a nullable primary foreign key is rejected
    let err = schema
        .table(Tier::Manual, "bad_fk", "-> [nullable] Subject\nx : int32", &ctx)
        .unwrap_err();
    assert!(err.to_string().contains("nullable"));

    // blobs cannot join the primary key
    assert!(
        schema
            .table(Tier::Manual, "bad_pk", "payload : bytes", &ctx)
            .is_err()
    );

    // a primary key is mandatory
    assert!(
        schema
            .table(Tier::Manual, "no_pk", "---\nvalue : int32", &ctx)
            .is_err()
    );
}

#[test]
fn update_one_row() {
    let f = fixture();
    let schema = Schema::new(&f.conn, "lab").unwrap();
    let mut ctx = DeclarationContext::new();
    let (subject, session) = declare_subject_session(&schema, &mut ctx);
    seed(&subject, &session);

    session
        .update1(&row([
            ("subject_id", Value::Int(1)),
            ("session_id", Value::Int(10)),
            ("weight", Value::Float(21.5)),
        ]))
        .unwrap();
    let updated = session
        .restrict(row([
            ("subject_id", Value::Int(1)),
            ("session_id", Value::Int(10)),
        ]))
        .unwrap()
        .fetch1()
        .unwrap();
    assert_eq!(updated["weight"], Value::Float(21.5));

    // resetting to null
    session
        .update1(&row([
            ("subject_id", Value::Int(1)),
            ("session_id", Value::Int(10)),
            ("weight", Value::Null),
        ]))
        .unwrap();
    let reset = session
        .restrict(row([
            ("subject_id", Value::Int(1)),
            ("session_id", Value::Int(10)),
        ]))
        .unwrap()
        .fetch1()
        .unwrap();
    assert_eq!(reset["weight"], Value::Null);

    // a missing row is an error, as is a key-only update
    assert!(
        session
            .update1(&row([
                ("subject_id", Value::Int(9)),
                ("session_id", Value::Int(9)),
                ("weight", Value::Float(1.0)),
            ]))
            .is_err()
    );
    assert!(
        session
            .update1(&row([
                ("subject_id", Value::Int(1)),
                ("session_id", Value::Int(10)),
            ]))
            .is_err()
    );
}

#[test]
fn describe_reflects_the_declaration() {
    let f = fixture();
    let schema = Schema::new(&f.conn, "lab").unwrap();
    let mut ctx = DeclarationContext::new();
    let (_subject, session) = declare_subject_session(&schema, &mut ctx);

    let description = session.describe().unwrap();
    assert!(description.contains("# experimental sessions"));
    assert!(description.contains("-> lab.subject"));
    assert!(description.contains("session_id : int32"));
    assert!(description.contains("weight=null : float64"));

    // the description parses back with the same primary key and comment
    let reparsed = quarry_core::declare::parse_definition(&description).unwrap();
    assert_eq!(reparsed.comment, "experimental sessions");
    let attrs: Vec<_> = reparsed.attributes().collect();
    assert!(attrs.iter().any(|a| a.name == "session_id" && a.in_key));
    assert!(attrs.iter().any(|a| a.name == "weight" && a.nullable));
}

#[test]
fn insert_from_select_copies_rows() {
    let f = fixture();
    let schema = Schema::new(&f.conn, "lab").unwrap();
    let mut ctx = DeclarationContext::new();
    let (subject, session) = declare_subject_session(&schema, &mut ctx);
    seed(&subject, &session);

    let archive = schema
        .table(
            Tier::Manual,
            "session_archive",
            "subject_id : int32\nsession_id : int32\n---\nweight=null : float64",
            &ctx,
        )
        .unwrap();
    archive
        .insert_from(&session.query(), &InsertOptions::default())
        .unwrap();
    assert_eq!(archive.count().unwrap(), 3);
}

#[test]
fn core_value_types_roundtrip() {
    let f = fixture();
    let schema = Schema::new(&f.conn, "lab").unwrap();
    let ctx = DeclarationContext::new();
    let table = schema
        .table(
            Tier::Manual,
            "measurement",
            "measurement_id : int32\n\
             ---\n\
             token : uuid\n\
             taken_at : datetime(3)\n\
             amount : decimal(9,4)\n\
             meta : json\n\
             flag : bool\n\
             note=\"\" : varchar(64)",
            &ctx,
        )
        .unwrap();

    let token = uuid::Uuid::new_v4();
    let taken = chrono::NaiveDate::from_ymd_opt(2024, 3, 15)
        .unwrap()
        .and_hms_milli_opt(12, 34, 56, 789)
        .unwrap();
    let amount: bigdecimal::BigDecimal = "12.5000".parse().unwrap();
    let meta: serde_json::Value = serde_json::json!({"probe": {"depth": 150}});
    table
        .insert1(&row([
            ("measurement_id", Value::Int(1)),
            ("token", Value::Uuid(token)),
            ("taken_at", Value::DateTime(taken)),
            ("amount", Value::Decimal(amount.clone())),
            ("meta", Value::Json(meta.clone())),
            ("flag", Value::Bool(true)),
        ]))
        .unwrap();

    let fetched = table.query().fetch1().unwrap();
    assert_eq!(fetched["token"], Value::Uuid(token));
    assert_eq!(fetched["taken_at"], Value::DateTime(taken));
    assert_eq!(fetched["amount"], Value::Decimal(amount));
    assert_eq!(fetched["meta"], Value::Json(meta));
    assert_eq!(fetched["flag"], Value::Bool(true));
    assert_eq!(fetched["note"], Value::String("".into()));

    // restriction through a JSON path
    let deep = table
        .restrict(row([("meta.probe.depth", Value::Int(150))]))
        .unwrap();
    assert_eq!(deep.count().unwrap(), 1);
}

#[test]
fn alter_adds_and_drops_columns() {
    let f = fixture();
    let schema = Schema::new(&f.conn, "lab").unwrap();
    let ctx = DeclarationContext::new();
    let table = schema
        .table(
            Tier::Lookup,
            "rig",
            "rig_id=1 : int32\n---\nroom=\"b10\" : varchar(16)",
            &ctx,
        )
        .unwrap();
    table.insert1(&quarry::Row::new()).unwrap();

    // adding a nullable column keeps existing rows intact
    let table = schema
        .alter(
            &table,
            "rig_id=1 : int32\n---\nroom=\"b10\" : varchar(16)\nnotes=null : varchar(64)",
            &ctx,
        )
        .unwrap();
    assert!(table.heading().contains("notes"));
    let fetched = table.query().fetch1().unwrap();
    assert_eq!(fetched["room"], Value::String("b10".into()));
    assert_eq!(fetched["notes"], Value::Null);

    // dropping it again
    let table = schema
        .alter(&table, "rig_id=1 : int32\n---\nroom=\"b10\" : varchar(16)", &ctx)
        .unwrap();
    assert!(!table.heading().contains("notes"));

    // the primary key cannot change
    let err = schema
        .alter(&table, "rig_id=1 : int32\nextra : int32\n---\nroom=\"b10\" : varchar(16)", &ctx)
        .unwrap_err();
    assert!(err.to_string().contains("primary key"));
}

#[test]
fn preview_renders_a_table() {
    let f = fixture();
    let schema = Schema::new(&f.conn, "lab").unwrap();
    let mut ctx = DeclarationContext::new();
    let (subject, session) = declare_subject_session(&schema, &mut ctx);
    seed(&subject, &session);

    let text = format!("{}", session.restrict("subject_id = 1").unwrap());
    assert!(text.contains("*subject_id"));
    assert!(text.contains("*session_id"));
    assert!(text.contains("(2 of 2 shown)"));
}

#[test]
fn validate_reports_row_issues_without_sql() {
    let f = fixture();
    let schema = Schema::new(&f.conn, "lab").unwrap();
    let mut ctx = DeclarationContext::new();
    let (_subject, session) = declare_subject_session(&schema, &mut ctx);

    let rows = vec![
        // fine
        row([("subject_id", Value::Int(1)), ("session_id", Value::Int(1))]),
        // missing a primary key attribute
        row([("subject_id", Value::Int(1))]),
        // unknown field and a null in the key
        row([
            ("subject_id", Value::Null),
            ("session_id", Value::Int(2)),
            ("ghost", Value::Int(0)),
        ]),
    ];
    let report = session.validate(&rows, &InsertOptions::default());
    assert_eq!(report.rows_checked, 3);
    assert!(!report.is_valid());
    assert!(report.errors.iter().all(|e| e.row_index != 0));
    assert!(report
        .errors
        .iter()
        .any(|e| e.row_index == 1 && e.field.as_deref() == Some("session_id")));
    assert!(report
        .errors
        .iter()
        .any(|e| e.row_index == 2 && e.field.as_deref() == Some("ghost")));
    // nothing was inserted
    assert_eq!(session.count().unwrap(), 0);
}

#[test]
fn headings_survive_reconnection() {
    // file-backed schemas keep the portable type annotations across
    // connections
    let dir = tempfile::tempdir().unwrap();
    let config = quarry::Config {
        safemode: false,
        ..quarry::Config::default()
    };
    let definition = "measurement_id : int32\n---\ntoken : uuid\namount : decimal(9,4)";
    let token = uuid::Uuid::new_v4();

    {
        let conn = quarry::Connection::open_sqlite(dir.path(), config.clone()).unwrap();
        let schema = Schema::new(&conn, "lab").unwrap();
        let table = schema
            .table(Tier::Manual, "measurement", definition, &DeclarationContext::new())
            .unwrap();
        table
            .insert1(&row([
                ("measurement_id", Value::Int(1)),
                ("token", Value::Uuid(token)),
                ("amount", Value::Decimal("7.2500".parse().unwrap())),
            ]))
            .unwrap();
    }

    let conn = quarry::Connection::open_sqlite(dir.path(), config).unwrap();
    let schema = Schema::new(&conn, "lab").unwrap();
    let table = schema
        .table(Tier::Manual, "measurement", definition, &DeclarationContext::new())
        .unwrap();
    let attr = table.heading().get("token").unwrap();
    assert!(attr.uuid);
    let fetched = table.query().fetch1().unwrap();
    assert_eq!(fetched["token"], Value::Uuid(token));
    assert_eq!(fetched["amount"], Value::Decimal("7.2500".parse().unwrap()));
}

#[test]
fn update_one_resets_defaulted_attributes() {
    let f = fixture();
    let schema = Schema::new(&f.conn, "lab").unwrap();
    let ctx = DeclarationContext::new();
    let table = schema
        .table(
            Tier::Manual,
            "ticket",
            "ticket_id : int32\n\
             ---\n\
             status=\"new\" : varchar(16)\n\
             opened_at=CURRENT_TIMESTAMP : datetime",
            &ctx,
        )
        .unwrap();
    table
        .insert1(&row([
            ("ticket_id", Value::Int(1)),
            ("status", Value::String("working".into())),
        ]))
        .unwrap();

    // a null on a non-nullable, defaulted attribute re-evaluates the
    // declared default in the engine
    table
        .update1(&row([
            ("ticket_id", Value::Int(1)),
            ("status", Value::Null),
            ("opened_at", Value::Null),
        ]))
        .unwrap();
    let fetched = table.query().fetch1().unwrap();
    assert_eq!(fetched["status"], Value::String("new".into()));
    // CURRENT_TIMESTAMP evaluated to a real datetime, not its own name
    assert!(
        matches!(fetched["opened_at"], Value::DateTime(_)),
        "{:?}",
        fetched["opened_at"]
    );
}
