//! The closed set of core column types and type-string classification.
//!
//! Core types are the portable, scientist-facing names (`int32`, `float64`,
//! `uuid`, ...). Each dialect maps them onto its native SQL spellings; the
//! core name is recorded in the column comment as `:type:` so the heading can
//! be reconstructed after the backend erases the alias.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;

use crate::error::{Error, Result};

/// A portable column type from the closed core set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoreType {
    Int8,
    Int16,
    Int32,
    Int64,
    Float32,
    Float64,
    Bool,
    Uuid,
    Bytes,
    Json,
    Date,
    /// Datetime with optional fractional-seconds precision (0-6).
    DateTime(Option<u8>),
    Char(u32),
    Varchar(u32),
    /// Fixed-point decimal with (precision, scale).
    Decimal(u8, u8),
    /// Enumeration over a fixed list of string values.
    Enum(Vec<String>),
}

impl CoreType {
    /// Parses a core type from its declaration spelling, e.g. `"int32"`,
    /// `"datetime(3)"`, `"enum('a','b')"`. Returns `None` if the string is
    /// not a core type (it may still be a valid native type or codec).
    pub fn parse(spec: &str) -> Option<CoreType> {
        let spec = spec.trim();
        let lower = spec.to_ascii_lowercase();
        match lower.as_str() {
            "int8" => return Some(CoreType::Int8),
            "int16" => return Some(CoreType::Int16),
            "int32" => return Some(CoreType::Int32),
            "int64" => return Some(CoreType::Int64),
            "float32" => return Some(CoreType::Float32),
            "float64" => return Some(CoreType::Float64),
            "bool" => return Some(CoreType::Bool),
            "uuid" => return Some(CoreType::Uuid),
            "bytes" => return Some(CoreType::Bytes),
            "json" => return Some(CoreType::Json),
            "date" => return Some(CoreType::Date),
            "datetime" => return Some(CoreType::DateTime(None)),
            _ => {}
        }
        if let Some(arg) = parametrized(&lower, "datetime") {
            return arg.trim().parse::<u8>().ok().map(|p| CoreType::DateTime(Some(p)));
        }
        if let Some(arg) = parametrized(&lower, "char") {
            return arg.trim().parse::<u32>().ok().map(CoreType::Char);
        }
        if let Some(arg) = parametrized(&lower, "varchar") {
            return arg.trim().parse::<u32>().ok().map(CoreType::Varchar);
        }
        if let Some(arg) = parametrized(&lower, "decimal") {
            let mut parts = arg.splitn(2, ',');
            let p = parts.next()?.trim().parse::<u8>().ok()?;
            let s = parts.next()?.trim().parse::<u8>().ok()?;
            return Some(CoreType::Decimal(p, s));
        }
        // Enum values preserve their original case, so parse from `spec`.
        if let Some(arg) = parametrized(spec, "enum") {
            let values = split_enum_values(arg);
            if values.is_empty() {
                return None;
            }
            return Some(CoreType::Enum(values));
        }
        None
    }

    /// Canonical declaration spelling, e.g. `"datetime(3)"`, `"enum(a,b)"`.
    pub fn canonical(&self) -> String {
        self.to_string()
    }

    /// Returns `true` for types stored as binary or JSON payloads, which are
    /// excluded from primary keys.
    pub fn is_blob_like(&self) -> bool {
        matches!(self, CoreType::Bytes | CoreType::Json)
    }
}

impl fmt::Display for CoreType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoreType::Int8 => f.write_str("int8"),
            CoreType::Int16 => f.write_str("int16"),
            CoreType::Int32 => f.write_str("int32"),
            CoreType::Int64 => f.write_str("int64"),
            CoreType::Float32 => f.write_str("float32"),
            CoreType::Float64 => f.write_str("float64"),
            CoreType::Bool => f.write_str("bool"),
            CoreType::Uuid => f.write_str("uuid"),
            CoreType::Bytes => f.write_str("bytes"),
            CoreType::Json => f.write_str("json"),
            CoreType::Date => f.write_str("date"),
            CoreType::DateTime(None) => f.write_str("datetime"),
            CoreType::DateTime(Some(p)) => write!(f, "datetime({p})"),
            CoreType::Char(n) => write!(f, "char({n})"),
            CoreType::Varchar(n) => write!(f, "varchar({n})"),
            CoreType::Decimal(p, s) => write!(f, "decimal({p},{s})"),
            CoreType::Enum(values) => write!(f, "enum({})", values.join(",")),
        }
    }
}

/// Extracts `args` from `name(args)`, case-insensitively on the name.
fn parametrized<'a>(spec: &'a str, name: &str) -> Option<&'a str> {
    let rest = spec
        .strip_prefix(name)
        .or_else(|| spec.to_ascii_lowercase().starts_with(name).then(|| &spec[name.len()..]))?;
    let rest = rest.trim_start();
    let inner = rest.strip_prefix('(')?.strip_suffix(')')?;
    Some(inner)
}

/// Splits enum value lists, accepting bare, single-, or double-quoted items.
fn split_enum_values(args: &str) -> Vec<String> {
    args.split(',')
        .map(|v| {
            let v = v.trim();
            v.strip_prefix('\'')
                .and_then(|v| v.strip_suffix('\''))
                .or_else(|| v.strip_prefix('"').and_then(|v| v.strip_suffix('"')))
                .unwrap_or(v)
                .to_string()
        })
        .filter(|v| !v.is_empty())
        .collect()
}

// ---------------------------------------------------------------------------
// Type classification for declaration parsing
// ---------------------------------------------------------------------------

/// The category of a declared attribute type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeclaredType {
    /// A portable core type.
    Core(CoreType),
    /// A codec reference `<name>` or `<name@store>`; the store is `Some("")`
    /// for `<name@>` (the configured default store).
    Codec {
        name: String,
        store: Option<String>,
    },
    /// A native SQL type passed through verbatim (reduced portability).
    Native(String),
}

static NATIVE_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        // integers, including unsigned and auto_increment decorations
        r"(?i)^((tiny|small|medium|big)?int|integer)(\s*\(.+\))?(\s+unsigned)?(\s+auto_increment)?$",
        r"(?i)^serial$",
        r"(?i)^numeric(\s*\(.+\))?(\s+unsigned)?$",
        r"(?i)^(double|float|real)(\s*\(.+\))?(\s+unsigned)?$",
        r"(?i)^(var)?char\s*\(.+\)$",
        r"(?i)^(time|timestamp|year)(\s*\(.+\))?$",
        r"(?i)^(tiny|small|medium|long)blob$",
        r"(?i)^(tiny|small|medium|long)?text$",
        r"(?i)^(tiny|small|medium|big)?serial$",
        r"(?i)^bytea$",
        r"(?i)^jsonb$",
        r"(?i)^boolean$",
        r"(?i)^binary\s*\(\d+\)$",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("native type pattern"))
    .collect()
});

static CODEC_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^<\s*(?P<name>[a-zA-Z_][\w]*)\s*(@\s*(?P<store>[\w]*))?\s*>$").expect("codec pattern"));

/// Classifies a declared type string into core, codec, or native.
pub fn classify_type(spec: &str) -> Result<DeclaredType> {
    let spec = spec.trim();
    if let Some(caps) = CODEC_PATTERN.captures(spec) {
        return Ok(DeclaredType::Codec {
            name: caps["name"].to_string(),
            store: caps.name("store").map(|m| m.as_str().to_string()),
        });
    }
    if let Some(core) = CoreType::parse(spec) {
        return Ok(DeclaredType::Core(core));
    }
    if NATIVE_PATTERNS.iter().any(|p| p.is_match(spec)) {
        return Ok(DeclaredType::Native(spec.to_string()));
    }
    Err(Error::declaration(format!("unsupported attribute type {spec}")))
}

/// Parses a codec specification like `"blob"`, `"<blob>"`, or `"<blob@cold>"`
/// into `(name, store)`. The store is `Some("")` when `@` is present with no
/// name (the default store) and `None` when `@` is absent.
pub fn parse_codec_spec(spec: &str) -> (String, Option<String>) {
    let spec = spec.trim().trim_start_matches('<').trim_end_matches('>').trim();
    match spec.split_once('@') {
        Some((name, store)) => (name.trim().to_string(), Some(store.trim().to_string())),
        None => (spec.to_string(), None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_type_parse_roundtrip() {
        for spec in [
            "int8", "int16", "int32", "int64", "float32", "float64", "bool", "uuid", "bytes",
            "json", "date", "datetime", "datetime(3)", "char(8)", "varchar(255)", "decimal(9,4)",
        ] {
            let t = CoreType::parse(spec).unwrap_or_else(|| panic!("{spec} should parse"));
            assert_eq!(t.canonical(), spec);
        }
    }

    #[test]
    fn enum_parse_accepts_quotes() {
        let t = CoreType::parse("enum('pending', 'reserved', 'error')").unwrap();
        assert_eq!(
            t,
            CoreType::Enum(vec!["pending".into(), "reserved".into(), "error".into()])
        );
    }

    #[test]
    fn classify_codec_with_store() {
        assert_eq!(
            classify_type("<blob@cold>").unwrap(),
            DeclaredType::Codec {
                name: "blob".into(),
                store: Some("cold".into())
            }
        );
        assert_eq!(
            classify_type("<npy@>").unwrap(),
            DeclaredType::Codec {
                name: "npy".into(),
                store: Some("".into())
            }
        );
        assert_eq!(
            classify_type("<graph>").unwrap(),
            DeclaredType::Codec {
                name: "graph".into(),
                store: None
            }
        );
    }

    #[test]
    fn classify_native_warns_not_errors() {
        assert!(matches!(classify_type("mediumblob").unwrap(), DeclaredType::Native(_)));
        assert!(matches!(classify_type("int unsigned").unwrap(), DeclaredType::Native(_)));
        assert!(matches!(classify_type("text").unwrap(), DeclaredType::Native(_)));
    }

    #[test]
    fn classify_rejects_unknown() {
        assert!(classify_type("widget").is_err());
    }

    #[test]
    fn blob_like_types() {
        assert!(CoreType::Bytes.is_blob_like());
        assert!(CoreType::Json.is_blob_like());
        assert!(!CoreType::Int32.is_blob_like());
    }
}
