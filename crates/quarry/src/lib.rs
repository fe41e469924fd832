//! Quarry turns a relational database into an executable scientific
//! workflow: tables are pipeline steps, foreign keys encode dependencies,
//! and computed tables fill themselves by running a `make` callback for
//! every key their upstream tables produce.
//!
//! ```no_run
//! use quarry::{Connection, DeclarationContext, Schema, Tier};
//! use quarry_core::config::Config;
//! use quarry_core::value::{row, Value};
//!
//! # fn main() -> quarry_core::error::Result<()> {
//! let conn = Connection::open_sqlite_in_memory(Config::default())?;
//! let schema = Schema::new(&conn, "lab")?;
//! let mut ctx = DeclarationContext::new();
//!
//! let subject = schema.table(
//!     Tier::Manual,
//!     "subject",
//!     "subject_id : int32  # subject identifier",
//!     &ctx,
//! )?;
//! ctx.add("Subject", &subject);
//! let session = schema.table(
//!     Tier::Manual,
//!     "session",
//!     "-> Subject\nsession_id : int32\n---\nweight=null : float64",
//!     &ctx,
//! )?;
//!
//! subject.insert1(&row([("subject_id", Value::Int(1))]))?;
//! session.insert1(&row([
//!     ("subject_id", Value::Int(1)),
//!     ("session_id", Value::Int(10)),
//! ]))?;
//! let rows = subject.query().join(&session.query())?.fetch()?;
//! assert_eq!(rows.len(), 1);
//! # Ok(())
//! # }
//! ```

pub mod condition;
pub mod connection;
pub mod expression;
pub mod fetch;
pub mod gc;
pub mod graph;
pub mod introspect;
pub mod jobs;
pub mod lineage;
pub mod populate;
pub mod preview;
pub mod schema;
pub mod staged;
pub mod table;

// Re-exports for convenience.
pub use condition::{Restriction, Top};
pub use connection::Connection;
pub use expression::{Proj, QueryExpression, Universal};
pub use jobs::{JobTable, RefreshOptions};
pub use populate::{
    key_source, populate, populate_tripartite, Make, PopulateOptions, PopulateResult,
    TripartiteMake,
};
pub use schema::{DeclarationContext, Schema};
pub use staged::StagedInsert;
pub use table::{DeleteOptions, InsertOptions, PartIntegrity, Table, ValidationResult};

// The shared vocabulary crates, re-exported for one-import use.
pub use quarry_core::config::Config;
pub use quarry_core::error::{Error, Result};
pub use quarry_core::identifier::Tier;
pub use quarry_core::value::{row, NdArray, Row, Value};
