//! Table identity: qualified names, tiers, and master/part relationships.
//!
//! Physical table names encode the tier as a prefix: Manual tables are bare,
//! Lookup tables start with `#`, Imported with `_`, Computed with `__`, and a
//! part table is `<master>__<part>`. Framework-owned tables start with `~`.

use std::fmt;

use crate::error::{Error, Result};

/// Longest physical table name the backends accept.
pub const MAX_TABLE_NAME_LENGTH: usize = 64;

/// A fully qualified `schema.table` name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QualifiedName {
    pub schema: String,
    pub table: String,
}

impl QualifiedName {
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Self {
        QualifiedName {
            schema: schema.into(),
            table: table.into(),
        }
    }

    /// Parses the canonical `schema.table` form.
    pub fn parse(full: &str) -> Result<Self> {
        match full.split_once('.') {
            Some((schema, table)) if !schema.is_empty() && !table.is_empty() => {
                Ok(QualifiedName::new(schema, table))
            }
            _ => Err(Error::invalid(format!("malformed table name: {full}"))),
        }
    }

    /// The master's qualified name if this is a part table.
    pub fn master(&self) -> Option<QualifiedName> {
        master_of(&self.table).map(|m| QualifiedName::new(self.schema.clone(), m))
    }

    /// Returns `true` for framework-owned tables (`~lineage`, `~~jobs`, ...).
    pub fn is_hidden(&self) -> bool {
        self.table.starts_with('~')
    }
}

impl fmt::Display for QualifiedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.table)
    }
}

/// The five user-visible table tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tier {
    Manual,
    Lookup,
    Imported,
    Computed,
    Part,
}

impl Tier {
    /// The physical-name prefix for this tier.
    pub fn prefix(self) -> &'static str {
        match self {
            Tier::Manual => "",
            Tier::Lookup => "#",
            Tier::Imported => "_",
            Tier::Computed => "__",
            Tier::Part => "",
        }
    }

    /// Whether tables of this tier are filled by `populate`.
    pub fn is_auto_populated(self) -> bool {
        matches!(self, Tier::Imported | Tier::Computed)
    }

    /// Infers the tier from a physical table name.
    pub fn from_table_name(name: &str) -> Tier {
        if master_of(name).is_some() {
            Tier::Part
        } else if name.starts_with("__") {
            Tier::Computed
        } else if name.starts_with('_') {
            Tier::Imported
        } else if name.starts_with('#') {
            Tier::Lookup
        } else {
            Tier::Manual
        }
    }
}

/// Builds the physical table name for a tier from the bare snake-case name.
pub fn table_name(tier: Tier, name: &str) -> String {
    format!("{}{}", tier.prefix(), name)
}

/// Builds the physical name of a part table under its master.
pub fn part_table_name(master: &str, part: &str) -> String {
    format!("{master}__{part}")
}

/// Extracts the master's physical name from a part table name, or `None`
/// when the name is not a part. The master is everything before the last
/// `__`, which must leave a non-empty master (so the Computed prefix `__`
/// alone does not make a part).
pub fn master_of(table: &str) -> Option<String> {
    let idx = table.rfind("__")?;
    if idx == 0 || table[..idx].is_empty() || table[idx + 2..].is_empty() {
        return None;
    }
    // Computed tables `__foo` are not parts of `` .
    let master = &table[..idx];
    if master == "_" || master.chars().all(|c| c == '_') {
        return None;
    }
    Some(master.to_string())
}

/// Validates a user-supplied bare table name: snake case, within length.
pub fn validate_table_name(name: &str) -> Result<()> {
    if name.len() > MAX_TABLE_NAME_LENGTH {
        return Err(Error::declaration(format!(
            "table name `{name}` exceeds the max length of {MAX_TABLE_NAME_LENGTH}"
        )));
    }
    let mut chars = name.chars();
    let valid_start = chars.next().is_some_and(|c| c.is_ascii_lowercase());
    if !valid_start || !name.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_') {
        return Err(Error::declaration(format!(
            "table name `{name}` must be snake_case starting with a letter"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_prefixes_roundtrip() {
        assert_eq!(table_name(Tier::Lookup, "species"), "#species");
        assert_eq!(table_name(Tier::Imported, "scan"), "_scan");
        assert_eq!(table_name(Tier::Computed, "activity"), "__activity");
        assert_eq!(Tier::from_table_name("#species"), Tier::Lookup);
        assert_eq!(Tier::from_table_name("_scan"), Tier::Imported);
        assert_eq!(Tier::from_table_name("__activity"), Tier::Computed);
        assert_eq!(Tier::from_table_name("session"), Tier::Manual);
    }

    #[test]
    fn part_names() {
        assert_eq!(part_table_name("__exp", "trial"), "__exp__trial");
        assert_eq!(master_of("__exp__trial").as_deref(), Some("__exp"));
        assert_eq!(master_of("exp__trial").as_deref(), Some("exp"));
        // a computed table is not a part
        assert_eq!(master_of("__activity"), None);
        assert_eq!(master_of("session"), None);
        assert_eq!(Tier::from_table_name("exp__trial"), Tier::Part);
    }

    #[test]
    fn qualified_name_parse_and_master() {
        let q = QualifiedName::parse("lab.exp__trial").unwrap();
        assert_eq!(q.schema, "lab");
        assert_eq!(q.master().unwrap().table, "exp");
        assert!(QualifiedName::parse("nodot").is_err());
        assert!(QualifiedName::new("lab", "~lineage").is_hidden());
    }

    #[test]
    fn name_validation() {
        assert!(validate_table_name("session_scan").is_ok());
        assert!(validate_table_name("Session").is_err());
        assert!(validate_table_name(&"x".repeat(65)).is_err());
    }
}
