//! Hash-addressed storage with per-schema deduplication.
//!
//! Content is identified by a Base32-encoded MD5 digest (26 lowercase
//! characters, no padding) and stored at `_hash/<schema>/<hash>`, with
//! optional subfolding (`(2,2)` gives `_hash/<schema>/ab/cd/<hash>`).
//!
//! The hash identifies content; the path stored in metadata is what all
//! reads use. Paths are pinned at insert time so later subfolding changes
//! cannot break existing rows. Reads verify the hash; a mismatch is data
//! corruption and fatal.

use serde::{Deserialize, Serialize};
use tracing::debug;

use quarry_core::error::{Error, Result};

use crate::ObjectStore;

const BASE32_ALPHABET: &[u8; 32] = b"abcdefghijklmnopqrstuvwxyz234567";

/// Computes the Base32-encoded MD5 hash of content: 26 lowercase
/// characters, unpadded.
pub fn compute_hash(data: &[u8]) -> String {
    let digest = md5::compute(data);
    base32_encode(&digest.0)
}

/// RFC 4648 base32 without padding, lowercase.
fn base32_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len().div_ceil(5) * 8);
    for chunk in bytes.chunks(5) {
        let mut buf = [0u8; 5];
        buf[..chunk.len()].copy_from_slice(chunk);
        let v = u64::from(buf[0]) << 32
            | u64::from(buf[1]) << 24
            | u64::from(buf[2]) << 16
            | u64::from(buf[3]) << 8
            | u64::from(buf[4]);
        let n_chars = (chunk.len() * 8).div_ceil(5);
        for i in 0..n_chars {
            let shift = 35 - 5 * i;
            out.push(BASE32_ALPHABET[((v >> shift) & 0x1f) as usize] as char);
        }
    }
    out
}

/// Splits a hash into subfolder segments, e.g. `("abcdefgh", [2,3])` gives
/// `["ab", "cde"]`.
fn subfold<'a>(name: &'a str, folds: &[usize]) -> Vec<&'a str> {
    let mut out = Vec::with_capacity(folds.len());
    let mut rest = name;
    for &n in folds {
        let n = n.min(rest.len());
        out.push(&rest[..n]);
        rest = &rest[n..];
    }
    out
}

/// Builds the storage path for a content hash within a schema.
pub fn build_hash_path(
    content_hash: &str,
    schema: &str,
    subfolding: Option<&[usize]>,
) -> Result<String> {
    let valid = content_hash.len() == 26
        && content_hash
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit());
    if !valid {
        return Err(Error::validation(format!(
            "invalid content hash (expected 26-char lowercase base32): {content_hash}"
        )));
    }
    Ok(match subfolding {
        Some(folds) if !folds.is_empty() => format!(
            "_hash/{schema}/{}/{content_hash}",
            subfold(content_hash, folds).join("/")
        ),
        _ => format!("_hash/{schema}/{content_hash}"),
    })
}

/// Metadata persisted in the database column for hash-addressed content.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HashMetadata {
    pub hash: String,
    /// The path used for all reads, pinned at insert time.
    pub path: String,
    pub schema: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store: Option<String>,
    pub size: u64,
}

/// Put/get operations for hash-addressed content on one store.
pub struct HashRegistry<'a> {
    pub store: &'a dyn ObjectStore,
    /// The store name to record in metadata, `None` for the default store.
    pub store_name: Option<String>,
    /// Subfolding pattern from the store spec.
    pub subfolding: Option<Vec<usize>>,
}

impl HashRegistry<'_> {
    /// Stores content, deduplicating within the schema: bytes already
    /// present under their hash path are not re-uploaded.
    pub fn put(&self, data: &[u8], schema: &str) -> Result<HashMetadata> {
        let content_hash = compute_hash(data);
        let path = build_hash_path(&content_hash, schema, self.subfolding.as_deref())?;
        if !self.store.exists(&path)? {
            self.store.put_buffer(&path, data)?;
            debug!(hash = %content_hash, bytes = data.len(), "stored new hash object");
        } else {
            debug!(hash = %content_hash, "hash object already present");
        }
        Ok(HashMetadata {
            hash: content_hash,
            path,
            schema: schema.to_string(),
            store: self.store_name.clone(),
            size: data.len() as u64,
        })
    }

    /// Retrieves content by its stored metadata, reading the pinned path and
    /// verifying the hash.
    pub fn get(&self, metadata: &HashMetadata) -> Result<Vec<u8>> {
        let data = self.store.get_buffer(&metadata.path)?;
        let actual = compute_hash(&data);
        if actual != metadata.hash {
            return Err(Error::invalid(format!(
                "data corruption: hash mismatch at {} (expected {}, got {actual})",
                metadata.path, metadata.hash
            )));
        }
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::LocalStore;

    #[test]
    fn hash_is_26_lowercase_base32() {
        let h = compute_hash(b"quarry");
        assert_eq!(h.len(), 26);
        assert!(h.bytes().all(|b| BASE32_ALPHABET.contains(&b)));
        // stable across calls
        assert_eq!(h, compute_hash(b"quarry"));
        assert_ne!(h, compute_hash(b"quarrz"));
    }

    #[test]
    fn known_digest() {
        // md5("") = d41d8cd98f00b204e9800998ecf8427e
        let h = compute_hash(b"");
        assert_eq!(h, base32_encode(&md5::compute(b"").0));
        assert_eq!(h.len(), 26);
    }

    #[test]
    fn subfolded_paths() {
        let h = "abcdefghijklmnopqrstuvwxyz";
        assert_eq!(
            build_hash_path(h, "lab", None).unwrap(),
            format!("_hash/lab/{h}")
        );
        assert_eq!(
            build_hash_path(h, "lab", Some(&[2, 2])).unwrap(),
            format!("_hash/lab/ab/cd/{h}")
        );
        assert!(build_hash_path("short", "lab", None).is_err());
    }

    #[test]
    fn put_get_roundtrip_with_dedup() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path()).unwrap();
        let registry = HashRegistry {
            store: &store,
            store_name: None,
            subfolding: Some(vec![2, 2]),
        };
        let meta1 = registry.put(b"same bytes", "lab").unwrap();
        let meta2 = registry.put(b"same bytes", "lab").unwrap();
        assert_eq!(meta1, meta2);
        assert_eq!(store.list("_hash/lab").unwrap().len(), 1);
        assert_eq!(registry.get(&meta1).unwrap(), b"same bytes");

        // different schema, same bytes: separate object
        registry.put(b"same bytes", "other").unwrap();
        assert_eq!(store.list("_hash").unwrap().len(), 2);
    }

    #[test]
    fn corruption_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path()).unwrap();
        let registry = HashRegistry {
            store: &store,
            store_name: None,
            subfolding: None,
        };
        let meta = registry.put(b"original", "lab").unwrap();
        store.put_buffer(&meta.path, b"tampered").unwrap();
        let err = registry.get(&meta).unwrap_err();
        assert!(err.to_string().contains("corruption"));
    }
}
