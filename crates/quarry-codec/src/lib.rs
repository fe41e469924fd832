//! Column codecs: named, composable encoder/decoder pairs.
//!
//! A codec declares its storage dtype, which may itself reference another
//! codec (`<blob@cold>` resolves through `<hash>` down to `json`). Chains
//! are resolved at declaration time; inserts run encoders outer to inner
//! and fetches run decoders inner to outer.
//!
//! The registry is per-connection and explicit: built-ins register on
//! construction and applications add their own with
//! [`CodecRegistry::register`].

pub mod builtins;
pub mod refs;

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, RwLock};

use quarry_core::error::{Error, Result};
use quarry_core::types::parse_codec_spec;
use quarry_core::value::{Row, Value};
use quarry_store::StoreRegistry;

pub use refs::{NpyRef, ObjectRef};

/// Everything a codec may need while encoding or decoding one field of one
/// row.
pub struct CodecContext<'a> {
    pub schema: &'a str,
    pub table: &'a str,
    pub field: &'a str,
    /// The row's primary key (used for schema-addressed paths).
    pub key: &'a Row,
    /// Resolved store for this column; `Some("")` means the default store.
    pub store_name: Option<&'a str>,
    pub stores: &'a StoreRegistry,
    /// Local directory where attachments are materialized on fetch.
    pub download_path: &'a Path,
}

/// A named encoder/decoder attached to a column via `<name>` syntax.
pub trait Codec: Send + Sync {
    /// The registry name, used as `<name>` in definitions.
    fn name(&self) -> &str;

    /// The storage dtype: a core type (`"bytes"`, `"json"`, ...) or another
    /// codec reference (`"<hash>"`). `is_external` reports whether an
    /// `@store` modifier is present.
    fn dtype(&self, is_external: bool) -> Result<String>;

    /// Validates a value before encoding. The default accepts anything.
    fn validate(&self, _value: &Value) -> Result<()> {
        Ok(())
    }

    /// Encodes an application value into its stored form.
    fn encode(&self, value: Value, ctx: &CodecContext<'_>) -> Result<Value>;

    /// Decodes a stored value back to the application form.
    fn decode(&self, stored: Value, ctx: &CodecContext<'_>) -> Result<Value>;
}

/// A resolved codec column: the chain outermost-first, the final storage
/// type, and the store the chain settled on.
#[derive(Clone)]
pub struct ResolvedCodec {
    pub chain: Vec<Arc<dyn Codec>>,
    pub final_dtype: String,
    pub store: Option<String>,
}

impl std::fmt::Debug for ResolvedCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedCodec")
            .field("chain_len", &self.chain.len())
            .field("final_dtype", &self.final_dtype)
            .field("store", &self.store)
            .finish()
    }
}

/// Registry of codecs by name.
pub struct CodecRegistry {
    codecs: RwLock<HashMap<String, Arc<dyn Codec>>>,
}

impl CodecRegistry {
    /// An empty registry (rarely what you want; see [`with_builtins`]).
    ///
    /// [`with_builtins`]: CodecRegistry::with_builtins
    pub fn new() -> Self {
        CodecRegistry {
            codecs: RwLock::new(HashMap::new()),
        }
    }

    /// A registry pre-populated with the built-in codecs.
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        for codec in builtins::all() {
            registry.register(codec).expect("built-in codec names are unique");
        }
        registry
    }

    /// Registers a codec. Re-registering the same instance is idempotent;
    /// a different codec under an existing name is an error.
    pub fn register(&self, codec: Arc<dyn Codec>) -> Result<()> {
        let name = codec.name().to_string();
        if name.is_empty() {
            return Err(Error::invalid("codec name must be a non-empty string"));
        }
        let mut codecs = self.codecs.write().expect("codec registry poisoned");
        if let Some(existing) = codecs.get(&name) {
            if Arc::ptr_eq(existing, &codec) {
                return Ok(());
            }
            return Err(Error::invalid(format!("codec <{name}> already registered")));
        }
        tracing::debug!(name, "registered codec");
        codecs.insert(name, codec);
        Ok(())
    }

    /// Looks up a codec by name (angle brackets and store suffix accepted).
    pub fn get(&self, name: &str) -> Result<Arc<dyn Codec>> {
        let (name, _) = parse_codec_spec(name);
        self.codecs
            .read()
            .expect("codec registry poisoned")
            .get(&name)
            .cloned()
            .ok_or_else(|| {
                Error::declaration(format!(
                    "unknown codec <{name}>; register it with CodecRegistry::register"
                ))
            })
    }

    /// Whether a codec name is registered.
    pub fn contains(&self, name: &str) -> bool {
        let (name, _) = parse_codec_spec(name);
        self.codecs
            .read()
            .expect("codec registry poisoned")
            .contains_key(&name)
    }

    /// Registered codec names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .codecs
            .read()
            .expect("codec registry poisoned")
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Resolves a declared dtype, following codec chains to a concrete
    /// storage type. An inner explicit `@store` overrides an outer one;
    /// otherwise the outer store propagates inward.
    pub fn resolve_dtype(&self, dtype: &str, store: Option<&str>) -> Result<ResolvedCodec> {
        let mut seen = HashSet::new();
        self.resolve_inner(dtype, store, &mut seen)
    }

    fn resolve_inner(
        &self,
        dtype: &str,
        store: Option<&str>,
        seen: &mut HashSet<String>,
    ) -> Result<ResolvedCodec> {
        let dtype = dtype.trim();
        if dtype.starts_with('<') && dtype.ends_with('>') {
            let (name, own_store) = parse_codec_spec(dtype);
            let effective_store = match own_store {
                Some(s) => Some(s),
                None => store.map(str::to_string),
            };
            if !seen.insert(name.clone()) {
                return Err(Error::declaration(format!(
                    "circular codec reference detected: <{name}>"
                )));
            }
            let codec = self.get(&name)?;
            let inner = codec.dtype(effective_store.is_some())?;
            let mut resolved = self.resolve_inner(&inner, effective_store.as_deref(), seen)?;
            resolved.chain.insert(0, codec);
            return Ok(resolved);
        }
        // a bare "type@store" suffix attaches a store at the leaf
        if let Some((base, leaf_store)) = dtype.split_once('@') {
            let effective = if leaf_store.is_empty() {
                store.map(str::to_string).or(Some(String::new()))
            } else {
                Some(leaf_store.to_string())
            };
            return Ok(ResolvedCodec {
                chain: Vec::new(),
                final_dtype: base.to_string(),
                store: effective,
            });
        }
        Ok(ResolvedCodec {
            chain: Vec::new(),
            final_dtype: dtype.to_string(),
            store: store.map(str::to_string),
        })
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

/// Runs the insert pipeline: validate on the outermost codec, then encode
/// outer to inner.
pub fn encode_chain(
    chain: &[Arc<dyn Codec>],
    value: Value,
    ctx: &CodecContext<'_>,
) -> Result<Value> {
    if let Some(outer) = chain.first() {
        outer.validate(&value)?;
    }
    chain.iter().try_fold(value, |v, codec| codec.encode(v, ctx))
}

/// Runs the fetch pipeline: decode inner to outer.
pub fn decode_chain(
    chain: &[Arc<dyn Codec>],
    stored: Value,
    ctx: &CodecContext<'_>,
) -> Result<Value> {
    chain
        .iter()
        .rev()
        .try_fold(stored, |v, codec| codec.decode(v, ctx))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Upper;
    impl Codec for Upper {
        fn name(&self) -> &str {
            "upper"
        }
        fn dtype(&self, _is_external: bool) -> Result<String> {
            Ok("varchar(64)".to_string())
        }
        fn encode(&self, value: Value, _ctx: &CodecContext<'_>) -> Result<Value> {
            Ok(Value::String(value.into_string()?.to_uppercase()))
        }
        fn decode(&self, stored: Value, _ctx: &CodecContext<'_>) -> Result<Value> {
            Ok(Value::String(stored.into_string()?.to_lowercase()))
        }
    }

    struct Cyclic;
    impl Codec for Cyclic {
        fn name(&self) -> &str {
            "cyclic"
        }
        fn dtype(&self, _is_external: bool) -> Result<String> {
            Ok("<cyclic>".to_string())
        }
        fn encode(&self, value: Value, _ctx: &CodecContext<'_>) -> Result<Value> {
            Ok(value)
        }
        fn decode(&self, stored: Value, _ctx: &CodecContext<'_>) -> Result<Value> {
            Ok(stored)
        }
    }

    #[test]
    fn registration_rules() {
        let registry = CodecRegistry::new();
        let upper: Arc<dyn Codec> = Arc::new(Upper);
        registry.register(upper.clone()).unwrap();
        // same instance is idempotent
        registry.register(upper).unwrap();
        // a different codec under the same name is rejected
        assert!(registry.register(Arc::new(Upper)).is_err());
        assert!(registry.contains("<upper>"));
        assert!(registry.get("<missing>").is_err());
    }

    #[test]
    fn builtin_chains_resolve() {
        let registry = CodecRegistry::with_builtins();

        let plain = registry.resolve_dtype("<blob>", None).unwrap();
        assert_eq!(plain.final_dtype, "bytes");
        assert_eq!(plain.chain.len(), 1);
        assert_eq!(plain.store, None);

        let external = registry.resolve_dtype("<blob>", Some("cold")).unwrap();
        assert_eq!(external.final_dtype, "json");
        assert_eq!(external.chain.len(), 2);
        assert_eq!(external.chain[0].name(), "blob");
        assert_eq!(external.chain[1].name(), "hash");
        assert_eq!(external.store.as_deref(), Some("cold"));

        // default store via bare @
        let default_store = registry.resolve_dtype("<attach>", Some("")).unwrap();
        assert_eq!(default_store.final_dtype, "json");
        assert_eq!(default_store.store.as_deref(), Some(""));
    }

    #[test]
    fn cycle_detection() {
        let registry = CodecRegistry::new();
        registry.register(Arc::new(Cyclic)).unwrap();
        let err = registry.resolve_dtype("<cyclic>", None).unwrap_err();
        assert!(err.to_string().contains("circular"));
    }

    #[test]
    fn store_only_codecs_require_a_store() {
        let registry = CodecRegistry::with_builtins();
        assert!(registry.resolve_dtype("<hash>", None).is_err());
        assert!(registry.resolve_dtype("<object>", None).is_err());
        assert!(registry.resolve_dtype("<npy>", None).is_err());
    }
}
