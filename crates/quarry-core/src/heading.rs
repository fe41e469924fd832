//! Table and query headings: ordered, typed attribute metadata.
//!
//! A heading is built either from a parsed definition (declaration time) or
//! from backend introspection (first access), and derived headings are
//! produced by the query algebra through [`Heading::select`],
//! [`Heading::join`], and friends.

use indexmap::IndexMap;

use crate::error::{Error, Result};
use crate::types::CoreType;

/// How a projected or computed attribute derives its value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributeExpression {
    /// A rename of an existing attribute (`new <- old`).
    Rename(String),
    /// An arbitrary SQL expression (computed attribute).
    Sql(String),
}

/// Properties of one table or query column.
#[derive(Debug, Clone, PartialEq)]
pub struct Attribute {
    pub name: String,
    /// The resolved storage type as the backend reports it (`"int"`,
    /// `"varchar(64)"`, ...). Empty for purely computed attributes.
    pub sql_type: String,
    /// The portable core type recorded in the column comment, if any.
    pub core_type: Option<CoreType>,
    pub in_key: bool,
    pub nullable: bool,
    /// Default value expression as stored by the backend.
    pub default: Option<String>,
    pub comment: String,
    pub autoincrement: bool,
    /// Hidden attributes (names starting `_`) are excluded from headings.
    pub hidden: bool,
    pub numeric: bool,
    pub is_blob: bool,
    pub json: bool,
    pub uuid: bool,
    /// Codec bound to this column, e.g. `"blob"` for `<blob>`.
    pub codec: Option<String>,
    /// Store name for external codecs; `Some("")` means the default store.
    pub store: Option<String>,
    /// Set only on projected/computed attributes of a query.
    pub expression: Option<AttributeExpression>,
    /// Semantic origin `schema.table.attribute`, when lineage is tracked.
    pub lineage: Option<String>,
}

impl Attribute {
    /// A plain attribute with everything defaulted; used by builders.
    pub fn named(name: impl Into<String>) -> Self {
        Attribute {
            name: name.into(),
            sql_type: String::new(),
            core_type: None,
            in_key: false,
            nullable: false,
            default: None,
            comment: String::new(),
            autoincrement: false,
            hidden: false,
            numeric: false,
            is_blob: false,
            json: false,
            uuid: false,
            codec: None,
            store: None,
            expression: None,
            lineage: None,
        }
    }

    /// The attribute's name in the underlying relation: the rename source
    /// for renamed attributes, otherwise its own name.
    pub fn original_name(&self) -> &str {
        match &self.expression {
            Some(AttributeExpression::Rename(old)) => old,
            _ => &self.name,
        }
    }

    /// Whether this column's values live in an external store.
    pub fn is_external(&self) -> bool {
        self.store.is_some()
    }

    /// The declared type for display: the core alias when known, otherwise
    /// the storage type, with codecs shown in angle brackets.
    pub fn display_type(&self) -> String {
        if let Some(codec) = &self.codec {
            return match &self.store {
                Some(store) if store.is_empty() => format!("<{codec}@>"),
                Some(store) => format!("<{codec}@{store}>"),
                None => format!("<{codec}>"),
            };
        }
        match &self.core_type {
            Some(core) => core.canonical(),
            None => self.sql_type.clone(),
        }
    }
}

/// A secondary index over a table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSpec {
    pub unique: bool,
    pub attributes: Vec<String>,
}

/// Table status from introspection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableStatus {
    pub comment: String,
}

/// Ordered collection of attributes plus indexes and table status.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Heading {
    attributes: IndexMap<String, Attribute>,
    pub indexes: Vec<IndexSpec>,
    pub table_status: Option<TableStatus>,
    /// Whether lineage entries were loaded for this heading's attributes.
    /// Without them the semantic join check degrades to a permissive
    /// natural join.
    pub lineage_available: bool,
}

impl Heading {
    /// Builds a heading from attributes in order. Hidden attributes are kept
    /// internally but excluded from the public views.
    pub fn new(attributes: impl IntoIterator<Item = Attribute>) -> Self {
        Heading {
            attributes: attributes.into_iter().map(|a| (a.name.clone(), a)).collect(),
            indexes: Vec::new(),
            table_status: None,
            lineage_available: false,
        }
    }

    /// All non-hidden attributes in declaration order.
    pub fn attributes(&self) -> impl Iterator<Item = &Attribute> {
        self.attributes.values().filter(|a| !a.hidden)
    }

    /// Every attribute, including hidden job-metadata columns.
    pub fn all_attributes(&self) -> impl Iterator<Item = &Attribute> {
        self.attributes.values()
    }

    /// Non-hidden attribute names in order.
    pub fn names(&self) -> Vec<String> {
        self.attributes().map(|a| a.name.clone()).collect()
    }

    /// Primary key attribute names in order.
    pub fn primary_key(&self) -> Vec<String> {
        self.attributes()
            .filter(|a| a.in_key)
            .map(|a| a.name.clone())
            .collect()
    }

    /// Non-key attribute names in order.
    pub fn secondary_attributes(&self) -> Vec<String> {
        self.attributes()
            .filter(|a| !a.in_key)
            .map(|a| a.name.clone())
            .collect()
    }

    /// Names of blob-typed attributes.
    pub fn blobs(&self) -> Vec<String> {
        self.attributes()
            .filter(|a| a.is_blob)
            .map(|a| a.name.clone())
            .collect()
    }

    /// Names of attributes that are neither blob nor JSON.
    pub fn non_blobs(&self) -> Vec<String> {
        self.attributes()
            .filter(|a| !a.is_blob && !a.json)
            .map(|a| a.name.clone())
            .collect()
    }

    /// Looks up an attribute by name (hidden included).
    pub fn get(&self, name: &str) -> Option<&Attribute> {
        self.attributes.get(name)
    }

    /// Looks up an attribute, erroring with [`Error::UnknownAttribute`].
    pub fn attribute(&self, name: &str) -> Result<&Attribute> {
        self.attributes
            .get(name)
            .ok_or_else(|| Error::UnknownAttribute(name.to_string()))
    }

    /// Whether a non-hidden attribute with this name exists.
    pub fn contains(&self, name: &str) -> bool {
        self.attributes.get(name).is_some_and(|a| !a.hidden)
    }

    /// Number of non-hidden attributes.
    pub fn len(&self) -> usize {
        self.attributes().count()
    }

    /// Returns `true` when the heading has no visible attributes.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether any attribute autoincrements.
    pub fn has_autoincrement(&self) -> bool {
        self.attributes().any(|a| a.autoincrement)
    }

    /// Renders the SELECT clause for `fields`, quoting identifiers with
    /// `quote` and attaching `AS` aliases for projected attributes.
    pub fn as_sql(&self, fields: &[String], quote: &dyn Fn(&str) -> String) -> String {
        fields
            .iter()
            .map(|name| {
                let attr = self.attributes.get(name);
                match attr.and_then(|a| a.expression.as_ref()) {
                    None => quote(name),
                    Some(AttributeExpression::Rename(old)) => {
                        format!("{} AS {}", quote(old), quote(name))
                    }
                    Some(AttributeExpression::Sql(expr)) => {
                        format!("({}) AS {}", expr, quote(name))
                    }
                }
            })
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Derives a new heading by selecting, renaming, and computing
    /// attributes (project / rename / extend). Performs no error checking;
    /// the query layer validates names first.
    pub fn select(
        &self,
        keep: &[String],
        rename: &[(String, String)],
        compute: &[(String, String)],
    ) -> Heading {
        let mut out: Vec<Attribute> = Vec::new();
        for attr in self.attributes() {
            if keep.contains(&attr.name) {
                out.push(attr.clone());
            }
            for (new_name, old_name) in rename {
                if old_name == &attr.name {
                    let mut renamed = attr.clone();
                    renamed.name = new_name.clone();
                    renamed.expression = Some(AttributeExpression::Rename(old_name.clone()));
                    out.push(renamed);
                }
            }
        }
        for (new_name, expr) in compute {
            let mut attr = Attribute::named(new_name.clone());
            attr.comment = "calculated attribute".to_string();
            attr.expression = Some(AttributeExpression::Sql(expr.clone()));
            out.push(attr);
        }
        let mut heading = Heading::new(out);
        heading.lineage_available = self.lineage_available;
        heading
    }

    /// Merges two headings for a join. Primary key attributes come first
    /// (self's, then other's new ones), then secondary attributes.
    pub fn join(&self, other: &Heading) -> Heading {
        let lineage_available = self.lineage_available && other.lineage_available;
        let mut out: Vec<Attribute> = Vec::new();
        let self_pk = self.primary_key();
        for name in &self_pk {
            out.push(self.attributes[name].clone());
        }
        for name in other.primary_key() {
            if !self_pk.contains(&name) {
                out.push(other.attributes[&name].clone());
            }
        }
        for name in self.secondary_attributes() {
            if other.get(&name).is_none_or(|a| !a.in_key) {
                out.push(self.attributes[&name].clone());
            }
        }
        for name in other.secondary_attributes() {
            if self.get(&name).is_none() {
                out.push(other.attributes[&name].clone());
            }
        }
        let mut heading = Heading::new(out);
        heading.lineage_available = lineage_available;
        heading
    }

    /// Produces a heading with the given primary key, preserving order.
    pub fn set_primary_key(&self, primary_key: &[String]) -> Heading {
        let mut out: Vec<Attribute> = Vec::new();
        for name in primary_key {
            if let Some(attr) = self.attributes.get(name) {
                let mut attr = attr.clone();
                attr.in_key = true;
                out.push(attr);
            }
        }
        for attr in self.attributes() {
            if !primary_key.contains(&attr.name) {
                let mut attr = attr.clone();
                attr.in_key = false;
                out.push(attr);
            }
        }
        let mut heading = Heading::new(out);
        heading.lineage_available = self.lineage_available;
        heading
    }

    /// Strips attribute expressions for use above a subquery boundary,
    /// where the subquery has already resolved them.
    pub fn make_subquery_heading(&self) -> Heading {
        let mut heading = Heading::new(self.attributes.values().map(|a| {
            let mut a = a.clone();
            a.expression = None;
            a
        }));
        heading.indexes = self.indexes.clone();
        heading.lineage_available = self.lineage_available;
        heading
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attr(name: &str, in_key: bool) -> Attribute {
        let mut a = Attribute::named(name);
        a.in_key = in_key;
        a.sql_type = "int".into();
        a
    }

    fn sample() -> Heading {
        Heading::new([attr("subject_id", true), attr("session_id", true), attr("rating", false)])
    }

    #[test]
    fn primary_and_secondary_split() {
        let h = sample();
        assert_eq!(h.primary_key(), ["subject_id", "session_id"]);
        assert_eq!(h.secondary_attributes(), ["rating"]);
    }

    #[test]
    fn select_renames_and_computes() {
        let h = sample().select(
            &["subject_id".into()],
            &[("sid".into(), "session_id".into())],
            &[("n".into(), "count(*)".into())],
        );
        assert_eq!(h.names(), ["subject_id", "sid", "n"]);
        assert_eq!(h.get("sid").unwrap().original_name(), "session_id");
        let quote = |s: &str| format!("`{s}`");
        assert_eq!(
            h.as_sql(&h.names(), &quote),
            "`subject_id`,`session_id` AS `sid`,(count(*)) AS `n`"
        );
    }

    #[test]
    fn join_merges_primary_keys_first() {
        let left = sample();
        let right = Heading::new([attr("subject_id", true), attr("group_id", true), attr("score", false)]);
        let joined = left.join(&right);
        assert_eq!(
            joined.names(),
            ["subject_id", "session_id", "group_id", "rating", "score"]
        );
        assert_eq!(joined.primary_key(), ["subject_id", "session_id", "group_id"]);
    }

    #[test]
    fn subquery_heading_drops_expressions() {
        let h = sample().select(&[], &[("sid".into(), "session_id".into())], &[]);
        let sub = h.make_subquery_heading();
        assert_eq!(sub.get("sid").unwrap().expression, None);
    }

    #[test]
    fn hidden_attributes_are_invisible() {
        let mut hidden = attr("_job_duration", false);
        hidden.hidden = true;
        let h = Heading::new([attr("id", true), hidden]);
        assert_eq!(h.names(), ["id"]);
        assert!(h.get("_job_duration").is_some());
        assert!(!h.contains("_job_duration"));
    }
}
