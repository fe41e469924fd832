//! Restrictions and their translation into SQL WHERE fragments.
//!
//! A restriction is one predicate in a query's AND-ed restriction list:
//! a raw SQL fragment, an attribute/value mapping, a boolean constant,
//! another query (semijoin), a collection (OR), a negation, or a Top
//! (order/limit/offset) clause.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use uuid::Uuid;

use quarry_core::error::{Error, Result};
use quarry_core::heading::Heading;
use quarry_core::value::{Row, Value};
use quarry_dialect::Dialect;

use crate::expression::QueryExpression;

/// One restriction predicate.
#[derive(Clone)]
pub enum Restriction {
    /// The trivially true condition.
    True,
    /// The trivially false condition.
    False,
    /// A raw SQL WHERE fragment.
    Sql(String),
    /// Equality on every listed attribute (AND).
    Key(Row),
    /// All conditions must hold.
    And(Vec<Restriction>),
    /// Any condition must hold; an empty list is false.
    Or(Vec<Restriction>),
    /// Negation of the inner condition.
    Not(Box<Restriction>),
    /// Rows whose matching attributes appear in the query (semijoin).
    In(QueryExpression),
    /// Order, limit, and offset.
    Top(Top),
}

impl From<&str> for Restriction {
    fn from(sql: &str) -> Self {
        Restriction::Sql(sql.to_string())
    }
}
impl From<String> for Restriction {
    fn from(sql: String) -> Self {
        Restriction::Sql(sql)
    }
}
impl From<Row> for Restriction {
    fn from(key: Row) -> Self {
        Restriction::Key(key)
    }
}
impl From<bool> for Restriction {
    fn from(value: bool) -> Self {
        if value { Restriction::True } else { Restriction::False }
    }
}
impl From<QueryExpression> for Restriction {
    fn from(query: QueryExpression) -> Self {
        Restriction::In(query)
    }
}
impl From<Top> for Restriction {
    fn from(top: Top) -> Self {
        Restriction::Top(top)
    }
}
impl From<Vec<Row>> for Restriction {
    fn from(keys: Vec<Row>) -> Self {
        Restriction::Or(keys.into_iter().map(Restriction::Key).collect())
    }
}

impl Restriction {
    /// Negates this restriction.
    pub fn negate(self) -> Restriction {
        Restriction::Not(Box::new(self))
    }
}

/// ORDER BY / LIMIT / OFFSET applied as a restriction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Top {
    pub limit: Option<u64>,
    /// Attributes (with optional ` DESC`); `None` inherits an existing
    /// ordering, `["KEY"]` means primary key order.
    pub order_by: Option<Vec<String>>,
    pub offset: u64,
}

impl Top {
    /// The `Top(limit)` shorthand: primary-key order, no offset.
    pub fn new(limit: u64) -> Top {
        Top {
            limit: Some(limit),
            order_by: Some(vec!["KEY".to_string()]),
            offset: 0,
        }
    }

    pub fn with_order(limit: u64, order_by: &[&str]) -> Top {
        Top {
            limit: Some(limit),
            order_by: Some(order_by.iter().map(|s| s.to_string()).collect()),
            offset: 0,
        }
    }

    /// Whether `other` can merge into this Top: it inherits ordering or
    /// orders identically.
    pub fn compatible(&self, other: &Top) -> bool {
        other.order_by.is_none() || other.order_by == self.order_by
    }

    /// Merges a compatible Top: limits take the minimum, offsets add, the
    /// existing ordering is preserved.
    pub fn merge(&self, other: &Top) -> Top {
        let limit = match (self.limit, other.limit) {
            (None, None) => None,
            (Some(l), None) | (None, Some(l)) => Some(l),
            (Some(a), Some(b)) => Some(a.min(b)),
        };
        Top {
            limit,
            order_by: self.order_by.clone(),
            offset: self.offset + other.offset,
        }
    }
}

/// The result of compiling one restriction against a heading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Compiled {
    True,
    False,
    Sql(String),
}

/// Compiles a restriction into a WHERE fragment against `heading`,
/// recording every attribute the condition references into `columns`.
pub fn make_condition(
    heading: &Heading,
    dialect: &dyn Dialect,
    condition: &Restriction,
    columns: &mut HashSet<String>,
) -> Result<Compiled> {
    match condition {
        Restriction::True => Ok(Compiled::True),
        Restriction::False => Ok(Compiled::False),
        Restriction::Top(_) => Ok(Compiled::True),
        Restriction::Sql(sql) => {
            columns.extend(extract_column_names(sql));
            Ok(Compiled::Sql(format!("({})", sql.trim())))
        }
        Restriction::Key(key) => compile_key(heading, dialect, key, columns),
        Restriction::And(items) => {
            let mut parts = Vec::new();
            for item in items {
                match make_condition(heading, dialect, item, columns)? {
                    Compiled::True => {}
                    Compiled::False => return Ok(Compiled::False),
                    Compiled::Sql(sql) => parts.push(sql),
                }
            }
            if parts.is_empty() {
                return Ok(Compiled::True);
            }
            Ok(Compiled::Sql(format!("({})", parts.join(" AND "))))
        }
        Restriction::Or(items) => {
            let mut parts = Vec::new();
            for item in items {
                match make_condition(heading, dialect, item, columns)? {
                    Compiled::True => return Ok(Compiled::True),
                    Compiled::False => {}
                    Compiled::Sql(sql) => parts.push(sql),
                }
            }
            if parts.is_empty() {
                // an empty OR list admits nothing
                return Ok(Compiled::False);
            }
            Ok(Compiled::Sql(format!("({})", parts.join(" OR "))))
        }
        // double negations fold away
        Restriction::Not(inner) => match inner.as_ref() {
            Restriction::Not(unwrapped) => make_condition(heading, dialect, unwrapped, columns),
            inner => match make_condition(heading, dialect, inner, columns)? {
                Compiled::True => Ok(Compiled::False),
                Compiled::False => Ok(Compiled::True),
                Compiled::Sql(sql) => Ok(Compiled::Sql(format!("NOT {sql}"))),
            },
        },
        Restriction::In(query) => compile_semijoin(heading, dialect, query, columns),
    }
}

fn compile_key(
    heading: &Heading,
    dialect: &dyn Dialect,
    key: &Row,
    columns: &mut HashSet<String>,
) -> Result<Compiled> {
    let mut parts = Vec::new();
    for (name, value) in key {
        let (attr_name, json_path) = translate_attribute(name);
        if !heading.contains(&attr_name) {
            // attributes absent from the heading do not restrict
            continue;
        }
        columns.insert(attr_name.clone());
        let attr = heading.attribute(&attr_name)?;
        let column_sql = match &json_path {
            Some((path, return_type)) => dialect.json_path(
                &dialect.quote_ident(&attr_name),
                path,
                return_type.as_deref(),
            ),
            None => dialect.quote_ident(&attr_name),
        };
        parts.push(match value {
            Value::Null => format!("{column_sql} IS NULL"),
            value if attr.uuid => {
                let uuid = match value {
                    Value::Uuid(u) => *u,
                    Value::String(s) => Uuid::parse_str(s).map_err(|_| {
                        Error::validation(format!("badly formed UUID {s} in restriction by {attr_name}"))
                    })?,
                    other => {
                        return Err(Error::validation(format!(
                            "badly formed UUID {other} in restriction by {attr_name}"
                        )));
                    }
                };
                format!("{column_sql}={}", dialect.bytes_literal(uuid.as_bytes()))
            }
            other => format!("{column_sql}={}", value_literal(dialect, other)?),
        });
    }
    if parts.is_empty() {
        // no matching attributes: everything matches
        return Ok(Compiled::True);
    }
    Ok(Compiled::Sql(format!("({})", parts.join(" AND "))))
}

fn compile_semijoin(
    heading: &Heading,
    dialect: &dyn Dialect,
    query: &QueryExpression,
    columns: &mut HashSet<String>,
) -> Result<Compiled> {
    let common: Vec<String> = query
        .heading()
        .names()
        .into_iter()
        .filter(|name| heading.contains(name))
        .collect();
    if common.is_empty() {
        // with no common attributes, a non-empty operand matches everything
        return Ok(if query.count()? > 0 { Compiled::True } else { Compiled::False });
    }
    columns.extend(common.iter().cloned());
    let fields = common
        .iter()
        .map(|c| dialect.quote_ident(c))
        .collect::<Vec<_>>()
        .join(",");
    let subquery = query.make_sql(Some(&common))?;
    Ok(Compiled::Sql(format!("(({fields}) IN ({subquery}))")))
}

/// Renders a value as an inline SQL literal.
pub fn value_literal(dialect: &dyn Dialect, value: &Value) -> Result<String> {
    Ok(match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(b) => if *b { "1" } else { "0" }.to_string(),
        Value::Int(v) => v.to_string(),
        Value::Float(v) => v.to_string(),
        Value::String(s) => dialect.string_literal(s),
        Value::Bytes(b) => dialect.bytes_literal(b),
        Value::Uuid(u) => dialect.bytes_literal(u.as_bytes()),
        Value::Decimal(d) => dialect.string_literal(&d.to_string()),
        Value::Date(d) => dialect.string_literal(&d.format("%Y-%m-%d").to_string()),
        Value::Time(t) => dialect.string_literal(&t.format("%H:%M:%S%.3f").to_string()),
        Value::DateTime(dt) => {
            dialect.string_literal(&dt.format("%Y-%m-%d %H:%M:%S%.3f").to_string())
        }
        Value::Json(j) => dialect.string_literal(&j.to_string()),
        other => {
            return Err(Error::validation(format!(
                "{} values cannot appear in a restriction",
                other.type_name()
            )));
        }
    })
}

static JSON_KEY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<attr>\w+)(\.(?P<path>[\w.*\[\]]+))?(:(?P<type>[\w(,\s)]+))?$")
        .expect("json key pattern")
});

/// Splits a restriction key into the attribute name and an optional JSON
/// path with return type: `"meta.probe.depth:float"` gives
/// `("meta", Some(("probe.depth", Some("float"))))`.
pub fn translate_attribute(key: &str) -> (String, Option<(String, Option<String>)>) {
    match JSON_KEY.captures(key) {
        Some(caps) => {
            let attr = caps["attr"].to_string();
            match caps.name("path") {
                Some(path) => (
                    attr,
                    Some((
                        path.as_str().to_string(),
                        caps.name("type").map(|t| t.as_str().to_string()),
                    )),
                ),
                None => (attr, None),
            }
        }
        None => (key.to_string(), None),
    }
}

static QUOTED_IDENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"[`"]([a-z][a-z_0-9]*)[`"]"#).expect("quoted ident pattern"));
static BARE_WORD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b[a-z][a-z_0-9]*\b").expect("bare word pattern"));

const SQL_RESERVED: [&str; 16] = [
    "is", "in", "between", "like", "and", "or", "null", "not", "interval", "second", "minute",
    "hour", "day", "month", "week", "year",
];

/// Extracts the column names an SQL fragment references, for
/// projection-safety checks. Quoted identifiers are taken verbatim; bare
/// words survive unless they look like functions or reserved words.
pub fn extract_column_names(sql: &str) -> HashSet<String> {
    let mut result = HashSet::new();
    // drop string literals
    let mut s = sql.replace("\\\"", "").replace("\\'", "");
    s = Regex::new(r"'[^']*'").expect("sq pattern").replace_all(&s, "").to_string();

    for caps in QUOTED_IDENT.captures_iter(&s) {
        result.insert(caps[1].to_string());
    }
    s = QUOTED_IDENT.replace_all(&s, "").to_string();

    // words directly followed by ( are function calls
    s = Regex::new(r"\s*\(").expect("paren pattern").replace_all(&s, "(").to_string();
    s = Regex::new(r"\b[a-z][a-z_0-9]*\(")
        .expect("func pattern")
        .replace_all(&s, "(")
        .to_string();

    for m in BARE_WORD.find_iter(&s) {
        let word = m.as_str();
        if !SQL_RESERVED.contains(&word) {
            result.insert(word.to_string());
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_core::heading::Attribute;
    use quarry_core::types::CoreType;
    use quarry_core::value::row;
    use quarry_dialect::MySqlDialect;

    fn sample_heading() -> Heading {
        let mut id = Attribute::named("id");
        id.in_key = true;
        id.sql_type = "int".into();
        let mut token = Attribute::named("token");
        token.sql_type = "binary(16)".into();
        token.uuid = true;
        token.core_type = Some(CoreType::Uuid);
        let mut taken = Attribute::named("taken_at");
        taken.sql_type = "datetime".into();
        taken.core_type = Some(CoreType::DateTime(None));
        let mut note = Attribute::named("note");
        note.sql_type = "varchar(64)".into();
        Heading::new([id, token, taken, note])
    }

    fn compile(condition: &Restriction) -> Compiled {
        let mut columns = std::collections::HashSet::new();
        make_condition(&sample_heading(), &MySqlDialect, condition, &mut columns).unwrap()
    }

    #[test]
    fn key_restrictions_render_typed_literals() {
        let uuid = uuid::Uuid::from_u128(1);
        let condition = Restriction::Key(row([
            ("id", Value::Int(5)),
            ("token", Value::Uuid(uuid)),
            ("note", Value::String("it's".into())),
        ]));
        let Compiled::Sql(sql) = compile(&condition) else {
            panic!("expected sql")
        };
        assert!(sql.contains("`id`=5"));
        assert!(sql.contains("`token`=X'00000000000000000000000000000001'"));
        assert!(sql.contains("`note`='it''s'"));
    }

    #[test]
    fn null_values_become_is_null() {
        let condition = Restriction::Key(row([("note", Value::Null)]));
        assert_eq!(compile(&condition), Compiled::Sql("(`note` IS NULL)".into()));
    }

    #[test]
    fn keys_without_matching_attributes_are_trivially_true() {
        let condition = Restriction::Key(row([("elsewhere", Value::Int(1))]));
        assert_eq!(compile(&condition), Compiled::True);
        // and through Not, trivially false
        assert_eq!(compile(&condition.clone().negate()), Compiled::False);
    }

    #[test]
    fn uuid_strings_parse_or_reject() {
        let ok = Restriction::Key(row([(
            "token",
            Value::String("00000000-0000-0000-0000-000000000001".into()),
        )]));
        assert!(matches!(compile(&ok), Compiled::Sql(_)));

        let mut columns = std::collections::HashSet::new();
        let bad = Restriction::Key(row([("token", Value::String("not-a-uuid".into()))]));
        assert!(make_condition(&sample_heading(), &MySqlDialect, &bad, &mut columns).is_err());
    }

    #[test]
    fn boolean_algebra_folds_constants() {
        assert_eq!(compile(&Restriction::True), Compiled::True);
        assert_eq!(compile(&Restriction::False), Compiled::False);
        assert_eq!(
            compile(&Restriction::And(vec![Restriction::True, Restriction::False])),
            Compiled::False
        );
        assert_eq!(
            compile(&Restriction::Or(vec![Restriction::False, Restriction::True])),
            Compiled::True
        );
        assert_eq!(compile(&Restriction::Or(vec![])), Compiled::False);
        assert_eq!(compile(&Restriction::And(vec![])), Compiled::True);
    }

    #[test]
    fn nested_not_inverts() {
        let condition = Restriction::Sql("id > 3".into()).negate().negate();
        assert_eq!(compile(&condition), Compiled::Sql("(id > 3)".into()));
        let single = Restriction::Sql("id > 3".into()).negate();
        assert_eq!(compile(&single), Compiled::Sql("NOT (id > 3)".into()));
    }

    #[test]
    fn extracts_columns_from_sql_fragments() {
        let cols = extract_column_names("weight > 20 AND `session_id` IN (1,2) OR count(trial) > 0");
        assert!(cols.contains("weight"));
        assert!(cols.contains("session_id"));
        // `count` is a function, `trial` its argument
        assert!(!cols.contains("count"));
        assert!(cols.contains("trial"));
        // reserved words and literals are excluded
        assert!(!cols.contains("and"));
        let cols = extract_column_names("note = 'weight is high'");
        assert!(cols.contains("note"));
        assert!(!cols.contains("high"));
    }

    #[test]
    fn json_key_translation() {
        assert_eq!(translate_attribute("weight"), ("weight".to_string(), None));
        let (attr, path) = translate_attribute("meta.probe.depth:float");
        assert_eq!(attr, "meta");
        assert_eq!(path, Some(("probe.depth".to_string(), Some("float".to_string()))));
    }

    #[test]
    fn top_merging() {
        let a = Top::with_order(10, &["score DESC"]);
        let inherits = Top {
            limit: Some(4),
            order_by: None,
            offset: 3,
        };
        assert!(a.compatible(&inherits));
        let merged = a.merge(&inherits);
        assert_eq!(merged.limit, Some(4));
        assert_eq!(merged.offset, 3);
        assert_eq!(merged.order_by, Some(vec!["score DESC".to_string()]));

        let conflicting = Top::with_order(5, &["weight"]);
        assert!(!a.compatible(&conflicting));
    }
}
