//! Schema-addressed storage paths.
//!
//! Every row's external object lives at a path mirroring the schema
//! structure: `<schema>/<table>/<pk-token>/<field>[.ext]`, optionally with a
//! partition prefix derived from the token. The token is a stable hash of
//! the primary key, so the same entity always maps to the same path.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use quarry_core::error::Result;
use quarry_core::value::Row;

use crate::ObjectInfo;

/// Metadata persisted in the database column for schema-addressed content.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ObjectMetadata {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store: Option<String>,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ext: Option<String>,
    #[serde(default)]
    pub is_dir: bool,
    /// Upload time, RFC 3339.
    pub timestamp: String,
    /// File manifest for directory objects: relative path and size.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub items: Vec<(String, u64)>,
    /// Format-specific extras (e.g. array shape and dtype for `<npy>`).
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ObjectMetadata {
    pub fn new(path: String, store: Option<String>, size: u64) -> Self {
        ObjectMetadata {
            path,
            store,
            size,
            ext: None,
            is_dir: false,
            timestamp: Utc::now().to_rfc3339(),
            items: Vec::new(),
            extra: serde_json::Map::new(),
        }
    }

    /// Fills the manifest from an upload listing.
    pub fn with_manifest(mut self, manifest: Vec<ObjectInfo>) -> Self {
        self.is_dir = true;
        self.size = manifest.iter().map(|o| o.size).sum();
        self.items = manifest.into_iter().map(|o| (o.path, o.size)).collect();
        self
    }
}

/// A deterministic token for a primary key: SHA-256 over the sorted
/// `name=value` pairs, hex-encoded and truncated.
pub fn primary_key_token(key: &Row, token_length: usize) -> String {
    let mut pairs: Vec<String> = key.iter().map(|(k, v)| format!("{k}={v}")).collect();
    pairs.sort();
    let mut hasher = Sha256::new();
    for pair in &pairs {
        hasher.update(pair.as_bytes());
        hasher.update([0u8]);
    }
    let digest = hasher.finalize();
    let mut token = hex::encode(digest);
    token.truncate(token_length.max(4).min(token.len()));
    token
}

/// Builds the storage path for one field of one entity.
///
/// Returns `(path, token)`. With a `partition_pattern` of the form `"%2"`
/// (or a bare integer), the first characters of the token are inserted as a
/// partition directory ahead of the table directory; any other pattern is
/// used as a literal path segment.
pub fn build_object_path(
    schema: &str,
    table: &str,
    field: &str,
    key: &Row,
    ext: Option<&str>,
    partition_pattern: Option<&str>,
    token_length: usize,
) -> Result<(String, String)> {
    let token = primary_key_token(key, token_length);
    let suffix = match ext {
        Some(ext) if !ext.is_empty() => format!(".{}", ext.trim_start_matches('.')),
        _ => String::new(),
    };
    let partition = partition_pattern.map(|pattern| {
        let digits = pattern.trim_start_matches('%');
        match digits.parse::<usize>() {
            Ok(n) if n > 0 => token[..n.min(token.len())].to_string(),
            _ => pattern.to_string(),
        }
    });
    let path = match partition {
        Some(part) => format!("{schema}/{part}/{table}/{token}/{field}{suffix}"),
        None => format!("{schema}/{table}/{token}/{field}{suffix}"),
    };
    Ok((path, token))
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_core::value::{row, Value};

    #[test]
    fn token_is_stable_and_order_insensitive() {
        let a = row([("x", Value::Int(1)), ("y", Value::Int(2))]);
        let b = row([("y", Value::Int(2)), ("x", Value::Int(1))]);
        assert_eq!(primary_key_token(&a, 8), primary_key_token(&b, 8));
        assert_eq!(primary_key_token(&a, 8).len(), 8);
        let c = row([("x", Value::Int(1)), ("y", Value::Int(3))]);
        assert_ne!(primary_key_token(&a, 8), primary_key_token(&c, 8));
    }

    #[test]
    fn paths_mirror_schema_structure() {
        let key = row([("scan_id", Value::Int(7))]);
        let (path, token) =
            build_object_path("lab", "_scan", "raw", &key, Some("npy"), None, 8).unwrap();
        assert_eq!(path, format!("lab/_scan/{token}/raw.npy"));

        let (partitioned, token2) =
            build_object_path("lab", "_scan", "raw", &key, None, Some("%2"), 8).unwrap();
        assert_eq!(token, token2);
        assert_eq!(partitioned, format!("lab/{}/_scan/{token}/raw", &token[..2]));
    }

    #[test]
    fn same_entity_same_path() {
        let key = row([("subject_id", Value::Int(1)), ("session_id", Value::Int(2))]);
        let (p1, _) = build_object_path("s", "t", "f", &key, None, None, 8).unwrap();
        let (p2, _) = build_object_path("s", "t", "f", &key, None, None, 8).unwrap();
        assert_eq!(p1, p2);
    }
}
