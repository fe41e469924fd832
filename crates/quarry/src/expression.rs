//! The lazy relational algebra: restrict, project, join, aggregate, union.
//!
//! A [`QueryExpression`] is an immutable value carrying a heading, a list
//! of supports (base tables or subqueries), compiled restriction fragments,
//! the set of attributes those restrictions reference (for projection
//! safety), and an optional Top clause. Operators derive new expressions;
//! nothing touches the database until fetch or count.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::warn;

use quarry_core::error::{Error, Result};
use quarry_core::heading::Heading;
use quarry_core::identifier::QualifiedName;
use quarry_core::value::Row;

use crate::condition::{make_condition, Compiled, Restriction, Top};
use crate::connection::Connection;

/// One entry in a query's FROM list.
#[derive(Clone)]
pub(crate) enum Support {
    Table(QualifiedName),
    Subquery(Arc<QueryExpression>),
    Union(Vec<Arc<QueryExpression>>),
}

/// Aggregation state: grouping attributes and join flavor.
#[derive(Clone)]
pub(crate) struct Aggregation {
    pub group_by: Vec<String>,
    /// LEFT JOIN keeps unmatched grouping rows (`keep_all_rows`).
    pub left: bool,
}

/// A composable, lazy query.
#[derive(Clone)]
pub struct QueryExpression {
    pub(crate) conn: Connection,
    pub(crate) heading: Heading,
    pub(crate) support: Vec<Support>,
    pub(crate) restrictions: Vec<String>,
    pub(crate) restriction_attrs: HashSet<String>,
    pub(crate) top: Option<Top>,
    pub(crate) aggregation: Option<Aggregation>,
    pub(crate) distinct: bool,
}

impl std::fmt::Debug for QueryExpression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryExpression")
            .field("restrictions", &self.restrictions)
            .field("distinct", &self.distinct)
            .finish()
    }
}

/// Projection specification: which attributes to keep, rename, or compute.
/// The primary key is always retained.
#[derive(Debug, Clone, Default)]
pub struct Proj {
    keep_all: bool,
    keep: Vec<String>,
    rename: Vec<(String, String)>,
    compute: Vec<(String, String)>,
}

impl Proj {
    /// Keep only the primary key.
    pub fn none() -> Proj {
        Proj::default()
    }

    /// Keep every attribute.
    pub fn all() -> Proj {
        Proj {
            keep_all: true,
            ..Proj::default()
        }
    }

    /// Keep the named secondary attributes (and the primary key).
    pub fn keep<S: Into<String>>(attrs: impl IntoIterator<Item = S>) -> Proj {
        Proj {
            keep: attrs.into_iter().map(Into::into).collect(),
            ..Proj::default()
        }
    }

    /// Adds a rename: `new_name` takes the value of `old_name`.
    pub fn rename(mut self, new_name: impl Into<String>, old_name: impl Into<String>) -> Proj {
        self.rename.push((new_name.into(), old_name.into()));
        self
    }

    /// Adds a computed attribute from an SQL expression.
    pub fn compute(mut self, name: impl Into<String>, expression: impl Into<String>) -> Proj {
        self.compute.push((name.into(), expression.into()));
        self
    }
}

impl QueryExpression {
    /// A base-table expression.
    pub(crate) fn base(conn: Connection, name: QualifiedName, heading: Heading) -> QueryExpression {
        QueryExpression {
            conn,
            heading,
            support: vec![Support::Table(name)],
            restrictions: Vec::new(),
            restriction_attrs: HashSet::new(),
            top: None,
            aggregation: None,
            distinct: false,
        }
    }

    pub fn heading(&self) -> &Heading {
        &self.heading
    }

    pub fn primary_key(&self) -> Vec<String> {
        self.heading.primary_key()
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// The base table's qualified name, when this is an unwrapped table.
    pub fn base_table(&self) -> Option<&QualifiedName> {
        match self.support.as_slice() {
            [Support::Table(name)] => Some(name),
            _ => None,
        }
    }

    pub(crate) fn is_restricted(&self) -> bool {
        !self.restrictions.is_empty() || self.top.is_some()
    }

    // -- Restrict ------------------------------------------------------------

    /// Applies a restriction (`&` in relational notation). Restrictions
    /// accumulate under AND.
    pub fn restrict(&self, condition: impl Into<Restriction>) -> Result<QueryExpression> {
        self.restrict_with(condition.into(), true)
    }

    /// Applies the negation of a condition (`-`, the antijoin).
    pub fn exclude(&self, condition: impl Into<Restriction>) -> Result<QueryExpression> {
        self.restrict_with(condition.into().negate(), true)
    }

    pub(crate) fn restrict_with(
        &self,
        condition: Restriction,
        semantic_check: bool,
    ) -> Result<QueryExpression> {
        if let Restriction::Top(top) = condition {
            return self.apply_top(top);
        }
        if let Restriction::In(other) = &condition {
            assert_join_compatible(self, other, semantic_check)?;
        }
        // a restriction after Top applies to the limited set
        let mut result = if self.top.is_some() {
            self.make_subquery()
        } else {
            self.clone()
        };
        let mut columns = HashSet::new();
        match make_condition(
            &result.heading,
            self.conn.dialect().as_ref(),
            &condition,
            &mut columns,
        )? {
            Compiled::True => {}
            Compiled::False => result.restrictions.push("FALSE".to_string()),
            Compiled::Sql(sql) => result.restrictions.push(sql),
        }
        result.restriction_attrs.extend(columns);
        Ok(result)
    }

    fn apply_top(&self, top: Top) -> Result<QueryExpression> {
        let mut result = match &self.top {
            Some(existing) if existing.compatible(&top) => {
                let merged = existing.merge(&top);
                let mut r = self.clone();
                r.top = Some(merged);
                return Ok(r);
            }
            Some(_) => self.make_subquery(),
            None => self.clone(),
        };
        result.top = Some(top);
        Ok(result)
    }

    // -- Project -------------------------------------------------------------

    /// Projects, renames, and computes attributes. The primary key is
    /// always kept.
    pub fn proj(&self, spec: Proj) -> Result<QueryExpression> {
        let primary_key = self.heading.primary_key();
        // a renamed attribute replaces its source; renamed key attributes
        // stay in the key under their new name
        let rename_sources: Vec<&String> = spec.rename.iter().map(|(_, old)| old).collect();
        let mut keep: Vec<String> = primary_key
            .iter()
            .filter(|name| !rename_sources.contains(name))
            .cloned()
            .collect();
        if spec.keep_all {
            for name in self.heading.names() {
                if !keep.contains(&name) && !rename_sources.contains(&&name) {
                    keep.push(name);
                }
            }
        }
        for name in &spec.keep {
            if !self.heading.contains(name) {
                return Err(Error::UnknownAttribute(name.clone()));
            }
            if !keep.contains(name) {
                keep.push(name.clone());
            }
        }
        for (new_name, old_name) in &spec.rename {
            if !self.heading.contains(old_name) {
                return Err(Error::UnknownAttribute(old_name.clone()));
            }
            if keep.contains(new_name) {
                return Err(Error::invalid(format!(
                    "projection name collision on `{new_name}`"
                )));
            }
        }
        for (name, _) in &spec.compute {
            if keep.contains(name) {
                return Err(Error::invalid(format!(
                    "projection name collision on `{name}`"
                )));
            }
        }

        // restrictions referencing dropped or renamed attributes must be
        // resolved inside a subquery
        let safe = self
            .restriction_attrs
            .iter()
            .all(|attr| keep.contains(attr) && !rename_sources.contains(&attr));
        let source = if !safe || self.top.is_some() || self.aggregation.is_some() {
            self.make_subquery()
        } else {
            self.clone()
        };

        let mut result = source.clone();
        result.heading = source.heading.select(&keep, &spec.rename, &spec.compute);
        Ok(result)
    }

    // -- Join ----------------------------------------------------------------

    /// Natural join (`*`) with the semantic lineage check.
    pub fn join(&self, other: &QueryExpression) -> Result<QueryExpression> {
        self.join_inner(other, true)
    }

    /// Natural join matching all namesakes without the semantic check.
    pub fn join_permissive(&self, other: &QueryExpression) -> Result<QueryExpression> {
        self.join_inner(other, false)
    }

    fn join_inner(&self, other: &QueryExpression, semantic_check: bool) -> Result<QueryExpression> {
        assert_join_compatible(self, other, semantic_check)?;
        let left = self.joinable_form();
        let right = other.joinable_form();
        let mut support = left.support.clone();
        support.extend(right.support.iter().cloned());
        let mut restrictions = left.restrictions.clone();
        restrictions.extend(right.restrictions.iter().cloned());
        let mut restriction_attrs = left.restriction_attrs.clone();
        restriction_attrs.extend(right.restriction_attrs.iter().cloned());
        Ok(QueryExpression {
            conn: self.conn.clone(),
            heading: left.heading.join(&right.heading),
            support,
            restrictions,
            restriction_attrs,
            top: None,
            aggregation: None,
            distinct: false,
        })
    }

    /// Wraps in a subquery when this expression cannot be composed in
    /// place (Top, aggregation, projected attributes, distinct).
    fn joinable_form(&self) -> QueryExpression {
        let has_expressions = self
            .heading
            .attributes()
            .any(|a| a.expression.is_some());
        if self.top.is_some() || self.aggregation.is_some() || self.distinct || has_expressions {
            self.make_subquery()
        } else {
            self.clone()
        }
    }

    // -- Aggregate -----------------------------------------------------------

    /// Aggregates `other` per row of `self`: one output row per row of
    /// `self`, with `computes` evaluated over the matching rows of
    /// `other`. With `keep_all_rows`, rows of `self` without matches
    /// survive (LEFT JOIN).
    pub fn aggr(
        &self,
        other: &QueryExpression,
        computes: &[(&str, &str)],
        keep_all_rows: bool,
    ) -> Result<QueryExpression> {
        assert_join_compatible(self, other, true)?;
        let left = self.joinable_form();
        let right = other.joinable_form();
        let computes: Vec<(String, String)> = computes
            .iter()
            .map(|(n, e)| (n.to_string(), e.to_string()))
            .collect();
        let keep = self.heading.names();
        let heading = left.heading.select(&keep, &[], &computes);
        let mut support = left.support.clone();
        support.extend(right.support.iter().cloned());
        let mut restrictions = left.restrictions.clone();
        restrictions.extend(right.restrictions.iter().cloned());
        let aggregated = QueryExpression {
            conn: self.conn.clone(),
            heading: heading.set_primary_key(&self.heading.primary_key()),
            support,
            restrictions,
            restriction_attrs: HashSet::new(),
            top: None,
            aggregation: Some(Aggregation {
                group_by: self.heading.primary_key(),
                left: keep_all_rows,
            }),
            distinct: false,
        };
        // an aggregation always composes through a subquery
        Ok(aggregated.make_subquery())
    }

    // -- Union ---------------------------------------------------------------

    /// Union (`+`): both sides must share the primary key; non-key
    /// columns reduce to the common set.
    pub fn union(&self, other: &QueryExpression) -> Result<QueryExpression> {
        let pk: Vec<String> = self.heading.primary_key();
        if pk.is_empty() || pk != other.heading.primary_key() {
            return Err(Error::invalid(
                "union requires identical primary keys on both operands",
            ));
        }
        assert_join_compatible(self, other, true)?;
        let other_names = other.heading.names();
        let common: Vec<String> = self
            .heading
            .names()
            .into_iter()
            .filter(|n| other_names.contains(n))
            .collect();
        let secondary: Vec<String> = common.iter().filter(|n| !pk.contains(n)).cloned().collect();
        let left = self.proj(Proj::keep(secondary.clone()))?;
        let right = other.proj(Proj::keep(secondary))?;
        let heading = left.heading.make_subquery_heading();
        Ok(QueryExpression {
            conn: self.conn.clone(),
            heading,
            support: vec![Support::Union(vec![Arc::new(left), Arc::new(right)])],
            restrictions: Vec::new(),
            restriction_attrs: HashSet::new(),
            top: None,
            aggregation: None,
            distinct: false,
        })
    }

    // -- Subqueries and SQL --------------------------------------------------

    /// Wraps this expression as the sole support of a fresh expression.
    pub fn make_subquery(&self) -> QueryExpression {
        QueryExpression {
            conn: self.conn.clone(),
            heading: self.heading.make_subquery_heading(),
            support: vec![Support::Subquery(Arc::new(self.clone()))],
            restrictions: Vec::new(),
            restriction_attrs: HashSet::new(),
            top: None,
            aggregation: None,
            distinct: false,
        }
    }

    /// Compiles to SQL, selecting `fields` (default: every visible
    /// attribute).
    pub fn make_sql(&self, fields: Option<&[String]>) -> Result<String> {
        let dialect = self.conn.dialect().clone();
        let quote = |s: &str| dialect.quote_ident(s);
        let all_names = self.heading.names();
        let fields = fields.unwrap_or(&all_names);
        for field in fields {
            if self.heading.get(field).is_none() {
                return Err(Error::UnknownAttribute(field.clone()));
            }
        }

        let mut sql = format!(
            "SELECT {}{} FROM {}",
            if self.distinct { "DISTINCT " } else { "" },
            self.heading.as_sql(fields, &quote),
            self.from_clause()?
        );

        match &self.aggregation {
            None => {
                if !self.restrictions.is_empty() {
                    sql.push_str(&format!(" WHERE {}", self.restrictions.join(" AND ")));
                }
            }
            Some(agg) => {
                if !agg.group_by.is_empty() {
                    sql.push_str(&format!(
                        " GROUP BY {}",
                        agg.group_by
                            .iter()
                            .map(|a| quote(a))
                            .collect::<Vec<_>>()
                            .join(",")
                    ));
                }
                if !self.restrictions.is_empty() {
                    sql.push_str(&format!(" HAVING {}", self.restrictions.join(" AND ")));
                }
            }
        }

        if let Some(top) = &self.top {
            let order = match &top.order_by {
                None => self.heading.primary_key(),
                Some(order) => order.clone(),
            };
            let order: Vec<String> = order
                .iter()
                .flat_map(|entry| {
                    if entry == "KEY" {
                        self.heading.primary_key()
                    } else {
                        vec![entry.clone()]
                    }
                })
                .map(|entry| {
                    let (attr, direction) = match entry.rsplit_once(' ') {
                        Some((attr, dir))
                            if dir.eq_ignore_ascii_case("desc")
                                || dir.eq_ignore_ascii_case("asc") =>
                        {
                            (attr.trim().to_string(), format!(" {}", dir.to_uppercase()))
                        }
                        _ => (entry.clone(), String::new()),
                    };
                    if self.heading.contains(&attr) {
                        format!("{}{}", quote(&attr), direction)
                    } else {
                        format!("{attr}{direction}")
                    }
                })
                .collect();
            if !order.is_empty() {
                sql.push_str(&format!(" ORDER BY {}", order.join(",")));
            }
            let limit = top.limit.unwrap_or(999_999_999_999);
            sql.push_str(&format!(" LIMIT {limit}"));
            if top.offset > 0 {
                sql.push_str(&format!(" OFFSET {}", top.offset));
            }
        }
        Ok(sql)
    }

    fn from_clause(&self) -> Result<String> {
        let dialect = self.conn.dialect();
        let mut parts = Vec::with_capacity(self.support.len());
        for (i, support) in self.support.iter().enumerate() {
            parts.push(match support {
                Support::Table(name) => dialect.quote_qualified(name),
                Support::Subquery(sub) => format!(
                    "({}) AS {}",
                    sub.make_sql(None)?,
                    dialect.quote_ident(&format!("_q{i}"))
                ),
                Support::Union(sides) => {
                    // compound operands stay unparenthesized (SQLite
                    // rejects parenthesized SELECTs in compounds)
                    let mut rendered = Vec::with_capacity(sides.len());
                    for side in sides {
                        rendered.push(side.make_sql(None)?);
                    }
                    format!(
                        "({}) AS {}",
                        rendered.join(" UNION "),
                        dialect.quote_ident(&format!("_q{i}"))
                    )
                }
            });
        }
        let joiner = match &self.aggregation {
            Some(agg) if agg.left => " NATURAL LEFT JOIN ",
            _ => " NATURAL JOIN ",
        };
        Ok(parts.join(joiner))
    }

    // -- Execution -----------------------------------------------------------

    /// Number of rows this expression yields.
    pub fn count(&self) -> Result<u64> {
        let sql = format!(
            "SELECT count(*) AS n FROM ({}) AS {}",
            self.make_sql(None)?,
            self.conn.quote("_count")
        );
        let rows = self.conn.query(&sql, &[])?;
        Ok(rows
            .first()
            .and_then(|r| r.get("n"))
            .and_then(|v| v.as_int())
            .unwrap_or(0) as u64)
    }

    /// Whether any row matches.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.count()? == 0)
    }

    /// Whether a specific key (or any restriction) matches at least one
    /// row.
    pub fn contains(&self, key: &Row) -> Result<bool> {
        Ok(self.restrict(key.clone())?.count()? > 0)
    }
}

/// The universal set `U`: a virtual expression compatible with everything,
/// used to drop duplicates and to aggregate without grouping.
#[derive(Debug, Clone, Default)]
pub struct Universal {
    attrs: Vec<String>,
}

impl Universal {
    /// `U()`: the singular universal set.
    pub fn new() -> Universal {
        Universal::default()
    }

    /// `U(attrs...)`: the universal set over named attributes.
    pub fn over<S: Into<String>>(attrs: impl IntoIterator<Item = S>) -> Universal {
        Universal {
            attrs: attrs.into_iter().map(Into::into).collect(),
        }
    }

    pub fn attributes(&self) -> &[String] {
        &self.attrs
    }

    /// `U * expr`: the universal set is the identity of the join.
    pub fn join(&self, expr: &QueryExpression) -> QueryExpression {
        expr.clone()
    }

    /// `U(attrs) & expr`: the distinct values of the named attributes.
    pub fn restrict(&self, expr: &QueryExpression) -> Result<QueryExpression> {
        for attr in &self.attrs {
            if !expr.heading.contains(attr) {
                return Err(Error::UnknownAttribute(attr.clone()));
            }
        }
        let source = expr.joinable_form();
        let heading = source.heading.select(&self.attrs, &[], &[]);
        let mut result = source.clone();
        result.heading = heading.set_primary_key(&self.attrs);
        result.distinct = true;
        Ok(result)
    }

    /// `U(attrs).aggr(expr, ...)`: aggregate over groups of the named
    /// attributes; with no attributes, aggregate the whole expression into
    /// one row.
    pub fn aggr(
        &self,
        expr: &QueryExpression,
        computes: &[(&str, &str)],
    ) -> Result<QueryExpression> {
        let source = expr.joinable_form();
        let computes: Vec<(String, String)> = computes
            .iter()
            .map(|(n, e)| (n.to_string(), e.to_string()))
            .collect();
        let heading = source.heading.select(&self.attrs, &[], &computes);
        let aggregated = QueryExpression {
            conn: source.conn.clone(),
            heading: heading.set_primary_key(&self.attrs),
            support: source.support.clone(),
            restrictions: source.restrictions.clone(),
            restriction_attrs: HashSet::new(),
            top: None,
            aggregation: Some(Aggregation {
                group_by: self.attrs.clone(),
                left: false,
            }),
            distinct: false,
        };
        Ok(aggregated.make_subquery())
    }
}

/// Verifies that two expressions may join. With the semantic check on,
/// every namesake attribute must carry the same lineage; without lineage
/// tracking the check degrades to a permissive natural join with a
/// warning.
pub(crate) fn assert_join_compatible(
    left: &QueryExpression,
    right: &QueryExpression,
    semantic_check: bool,
) -> Result<()> {
    if !semantic_check {
        return Ok(());
    }
    if !left.heading.lineage_available || !right.heading.lineage_available {
        warn!(
            "semantic join check disabled: lineage is not tracked for one of the operands; \
             rebuild lineage to enable semantic matching"
        );
        return Ok(());
    }
    let right_names = right.heading.names();
    for name in left.heading.names() {
        if !right_names.contains(&name) {
            continue;
        }
        let lineage1 = left.heading.get(&name).and_then(|a| a.lineage.clone());
        let lineage2 = right.heading.get(&name).and_then(|a| a.lineage.clone());
        if lineage1.is_none() || lineage1 != lineage2 {
            return Err(Error::invalid(format!(
                "cannot join on attribute `{name}`: different lineages ({} vs {}); \
                 use proj to rename one of the attributes",
                lineage1.as_deref().unwrap_or("none"),
                lineage2.as_deref().unwrap_or("none"),
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_core::config::Config;
    use quarry_core::heading::Attribute;

    fn heading(primary: &[&str], secondary: &[&str]) -> Heading {
        let mut attrs = Vec::new();
        for name in primary {
            let mut attr = Attribute::named(*name);
            attr.in_key = true;
            attr.sql_type = "int".into();
            attrs.push(attr);
        }
        for name in secondary {
            let mut attr = Attribute::named(*name);
            attr.sql_type = "int".into();
            attrs.push(attr);
        }
        Heading::new(attrs)
    }

    fn table(name: &str, primary: &[&str], secondary: &[&str]) -> QueryExpression {
        let conn = Connection::open_sqlite_in_memory(Config::default()).unwrap();
        QueryExpression::base(
            conn,
            QualifiedName::new("s", name),
            heading(primary, secondary),
        )
    }

    #[test]
    fn base_table_sql() {
        let q = table("t", &["a"], &["b"]);
        assert_eq!(q.make_sql(None).unwrap(), "SELECT \"a\",\"b\" FROM \"s\".\"t\"");
    }

    #[test]
    fn restrictions_land_in_where() {
        let q = table("t", &["a"], &["b"])
            .restrict("b > 3")
            .unwrap()
            .restrict("a < 9")
            .unwrap();
        assert_eq!(
            q.make_sql(None).unwrap(),
            "SELECT \"a\",\"b\" FROM \"s\".\"t\" WHERE (b > 3) AND (a < 9)"
        );
    }

    #[test]
    fn join_concatenates_supports_and_restrictions() {
        let left = table("t", &["a"], &["b"]).restrict("b = 1").unwrap();
        let right = table("u", &["a"], &["c"]);
        let joined = left.join(&right).unwrap();
        assert_eq!(
            joined.make_sql(None).unwrap(),
            "SELECT \"a\",\"b\",\"c\" FROM \"s\".\"t\" NATURAL JOIN \"s\".\"u\" WHERE (b = 1)"
        );
    }

    #[test]
    fn projection_renames_in_select() {
        let q = table("t", &["a"], &["b"])
            .proj(Proj::none().rename("bb", "b"))
            .unwrap();
        assert_eq!(
            q.make_sql(None).unwrap(),
            "SELECT \"a\",\"b\" AS \"bb\" FROM \"s\".\"t\""
        );
    }

    #[test]
    fn projecting_a_restricted_attribute_wraps_a_subquery() {
        let q = table("t", &["a"], &["b"])
            .restrict("b = 1")
            .unwrap()
            .proj(Proj::none().rename("bb", "b"))
            .unwrap();
        assert_eq!(
            q.make_sql(None).unwrap(),
            "SELECT \"a\",\"b\" AS \"bb\" FROM \
             (SELECT \"a\",\"b\" FROM \"s\".\"t\" WHERE (b = 1)) AS \"_q0\""
        );
    }

    #[test]
    fn aggregation_groups_inside_a_subquery() {
        let group = table("t", &["a"], &[]);
        let other = table("u", &["a"], &["c"]);
        let q = group.aggr(&other, &[("n", "count(c)")], true).unwrap();
        assert_eq!(
            q.make_sql(None).unwrap(),
            "SELECT \"a\",\"n\" FROM (SELECT \"a\",(count(c)) AS \"n\" FROM \"s\".\"t\" \
             NATURAL LEFT JOIN \"s\".\"u\" GROUP BY \"a\") AS \"_q0\""
        );
    }

    #[test]
    fn top_orders_and_limits() {
        let q = table("t", &["a"], &["b"])
            .restrict(Top::with_order(5, &["b DESC", "KEY"]))
            .unwrap();
        assert_eq!(
            q.make_sql(None).unwrap(),
            "SELECT \"a\",\"b\" FROM \"s\".\"t\" ORDER BY \"b\" DESC,\"a\" LIMIT 5"
        );
        let offset = q
            .restrict(Top {
                limit: None,
                order_by: None,
                offset: 2,
            })
            .unwrap();
        assert!(offset.make_sql(None).unwrap().ends_with("LIMIT 5 OFFSET 2"));
    }

    #[test]
    fn restriction_after_top_wraps_the_limited_set() {
        let q = table("t", &["a"], &["b"])
            .restrict(Top::with_order(5, &["b"]))
            .unwrap()
            .restrict("a = 1")
            .unwrap();
        let sql = q.make_sql(None).unwrap();
        assert!(sql.starts_with("SELECT \"a\",\"b\" FROM (SELECT"));
        assert!(sql.contains("LIMIT 5) AS \"_q0\" WHERE (a = 1)"));
    }

    #[test]
    fn universal_join_is_identity() {
        let q = table("t", &["a"], &["b"]);
        let sql = q.make_sql(None).unwrap();
        assert_eq!(Universal::new().join(&q).make_sql(None).unwrap(), sql);
    }
}
