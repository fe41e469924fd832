//! Core types and shared vocabulary for the quarry data-pipeline framework.
//!
//! This crate holds everything the other workspace crates agree on: the
//! error taxonomy, the closed core-type set, runtime values, table identity
//! and tiers, headings, the table-definition language, and configuration.

pub mod config;
pub mod declare;
pub mod error;
pub mod heading;
pub mod identifier;
pub mod types;
pub mod value;

// Re-exports for convenience.
pub use config::{Config, JobsConfig, StoreSpec, StoresConfig};
pub use error::{Error, Result};
pub use heading::{Attribute, AttributeExpression, Heading, IndexSpec, TableStatus};
pub use identifier::{QualifiedName, Tier};
pub use types::{CoreType, DeclaredType};
pub use value::{NdArray, Row, Value};
