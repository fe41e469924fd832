//! Fetching: executing a query and decoding rows back to application
//! values. Native types decode first (UUID bytes, JSON text, datetimes),
//! then codec chains run inner to outer.

use bigdecimal::BigDecimal;
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use uuid::Uuid;

use quarry_codec::{decode_chain, CodecContext};
use quarry_core::error::{Error, Result};
use quarry_core::heading::{Attribute, Heading};
use quarry_core::types::CoreType;
use quarry_core::value::{Row, Value};

use crate::connection::Connection;
use crate::expression::QueryExpression;

impl QueryExpression {
    /// Fetches all rows, decoded through native types and codec chains.
    pub fn fetch(&self) -> Result<Vec<Row>> {
        let sql = self.make_sql(None)?;
        let raw = self.conn.query(&sql, &[])?;
        raw.into_iter()
            .map(|row| decode_row(&self.conn, &self.heading, row))
            .collect()
    }

    /// Fetches exactly one row; zero or several rows is an error.
    pub fn fetch1(&self) -> Result<Row> {
        let mut rows = self.fetch()?;
        match rows.len() {
            1 => Ok(rows.remove(0)),
            0 => Err(Error::invalid("fetch1 found no rows")),
            n => Err(Error::invalid(format!("fetch1 found {n} rows, expected one"))),
        }
    }

    /// Fetches primary-key rows only.
    pub fn fetch_keys(&self) -> Result<Vec<Row>> {
        let pk = self.heading.primary_key();
        let sql = self.make_sql(Some(&pk))?;
        let raw = self.conn.query(&sql, &[])?;
        raw.into_iter()
            .map(|row| decode_row(&self.conn, &self.heading, row))
            .collect()
    }

    /// Fetches the values of a single attribute.
    pub fn fetch_attribute(&self, name: &str) -> Result<Vec<Value>> {
        self.heading.attribute(name)?;
        let fields = vec![name.to_string()];
        let sql = self.make_sql(Some(&fields))?;
        let raw = self.conn.query(&sql, &[])?;
        raw.into_iter()
            .map(|mut row| {
                let value = row
                    .swap_remove(name)
                    .ok_or_else(|| Error::UnknownAttribute(name.to_string()))?;
                let attr = self.heading.attribute(name)?;
                decode_value(&self.conn, &self.heading, attr, value, &Row::new())
            })
            .collect()
    }
}

/// Decodes one fetched row against a heading.
pub(crate) fn decode_row(conn: &Connection, heading: &Heading, raw: Row) -> Result<Row> {
    // primary key first, for codec path context
    let mut key = Row::new();
    for name in heading.primary_key() {
        if let Some(value) = raw.get(&name) {
            key.insert(name, value.clone());
        }
    }
    let mut out = Row::with_capacity(raw.len());
    for (name, value) in raw {
        let decoded = match heading.get(&name) {
            Some(attr) => decode_value(conn, heading, attr, value, &key)?,
            None => value,
        };
        out.insert(name, decoded);
    }
    Ok(out)
}

fn decode_value(
    conn: &Connection,
    _heading: &Heading,
    attr: &Attribute,
    value: Value,
    key: &Row,
) -> Result<Value> {
    if value.is_null() {
        return Ok(value);
    }
    // native decode first
    let value = decode_native(attr, value)?;
    // then codec chains, inner to outer
    if let Some(codec_name) = &attr.codec {
        let spec = format!(
            "<{codec_name}{}>",
            match &attr.store {
                Some(store) if store.is_empty() => "@".to_string(),
                Some(store) => format!("@{store}"),
                None => String::new(),
            }
        );
        let resolved = conn.codecs().resolve_dtype(&spec, None)?;
        let ctx = CodecContext {
            schema: "",
            table: "",
            field: &attr.name,
            key,
            store_name: resolved.store.as_deref(),
            stores: conn.stores(),
            download_path: &conn.config().download_path,
        };
        return decode_chain(&resolved.chain, value, &ctx);
    }
    Ok(value)
}

/// Decodes backend-native representations into typed values, driven by the
/// attribute's recovered core type.
fn decode_native(attr: &Attribute, value: Value) -> Result<Value> {
    let bad = |what: &str, value: &Value| {
        Error::Serialization(format!(
            "cannot decode {} as {what} for attribute `{}`",
            value.type_name(),
            attr.name
        ))
    };
    if attr.uuid {
        return match value {
            Value::Bytes(b) if b.len() == 16 => {
                let bytes: [u8; 16] = b.as_slice().try_into().expect("16 bytes");
                Ok(Value::Uuid(Uuid::from_bytes(bytes)))
            }
            Value::String(s) => Uuid::parse_str(&s)
                .map(Value::Uuid)
                .map_err(|_| bad("uuid", &Value::String(s.clone()))),
            Value::Uuid(_) => Ok(value),
            other => Err(bad("uuid", &other)),
        };
    }
    if attr.json {
        return match value {
            Value::String(text) => Ok(Value::Json(serde_json::from_str(&text)?)),
            Value::Json(_) => Ok(value),
            other => Err(bad("json", &other)),
        };
    }
    match &attr.core_type {
        Some(CoreType::Bool) => Ok(match value {
            Value::Int(v) => Value::Bool(v != 0),
            other => other,
        }),
        Some(CoreType::Date) => match value {
            Value::String(s) => NaiveDate::parse_from_str(&s, "%Y-%m-%d")
                .map(Value::Date)
                .map_err(|_| bad("date", &Value::String(s.clone()))),
            other => Ok(other),
        },
        Some(CoreType::DateTime(_)) => match value {
            Value::String(s) => NaiveDateTime::parse_from_str(&s, "%Y-%m-%d %H:%M:%S%.f")
                .map(Value::DateTime)
                .map_err(|_| bad("datetime", &Value::String(s.clone()))),
            other => Ok(other),
        },
        Some(CoreType::Decimal(..)) => match value {
            Value::String(s) => s
                .parse::<BigDecimal>()
                .map(Value::Decimal)
                .map_err(|_| bad("decimal", &Value::String(s.clone()))),
            Value::Float(f) => BigDecimal::try_from(f)
                .map(Value::Decimal)
                .map_err(|_| bad("decimal", &Value::Float(f))),
            Value::Int(i) => Ok(Value::Decimal(BigDecimal::from(i))),
            other => Ok(other),
        },
        Some(CoreType::Float32 | CoreType::Float64) => Ok(match value {
            Value::Int(v) => Value::Float(v as f64),
            other => other,
        }),
        _ => {
            // native time columns may come back as text
            if attr.sql_type.eq_ignore_ascii_case("time") {
                if let Value::String(s) = &value {
                    if let Ok(t) = NaiveTime::parse_from_str(s, "%H:%M:%S%.f") {
                        return Ok(Value::Time(t));
                    }
                }
            }
            Ok(value)
        }
    }
}
