//! Object storage for quarry.
//!
//! Provides the [`ObjectStore`] trait, a local-filesystem implementation,
//! the hash-addressed registry used by `<hash>`/`<blob@>`/`<attach@>`, and
//! the schema-addressed path builder used by `<object>`/`<npy>`.

pub mod hash;
pub mod local;
pub mod path;

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use quarry_core::config::{StoreSpec, StoresConfig};
use quarry_core::error::{Error, Result};

pub use hash::{compute_hash, HashMetadata, HashRegistry};
pub use local::LocalStore;
pub use path::{build_object_path, ObjectMetadata};

/// Path prefix reserved for hash-addressed content; user `filepath` values
/// must not collide with it.
pub const HASH_PREFIX: &str = "_hash/";

/// One stored object returned by [`ObjectStore::list`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub path: String,
    pub size: u64,
}

/// A POSIX-path object store.
///
/// Implementations exist in-tree for the local filesystem; S3-compatible,
/// GCS, and Azure backends plug in through [`StoreRegistry::register`].
pub trait ObjectStore: Send + Sync {
    /// Writes a buffer, creating parent directories as needed. Local
    /// implementations must be atomic (temp file + rename).
    fn put_buffer(&self, path: &str, data: &[u8]) -> Result<()>;

    /// Reads an object fully into memory.
    fn get_buffer(&self, path: &str) -> Result<Vec<u8>>;

    /// Uploads a local file.
    fn put_file(&self, local: &Path, path: &str) -> Result<()>;

    /// Downloads to a local file, creating parent directories.
    fn get_file(&self, path: &str, local: &Path) -> Result<()>;

    /// Recursively uploads a directory; returns the relative paths and sizes
    /// of the files written, for manifests.
    fn put_folder(&self, local: &Path, path: &str) -> Result<Vec<ObjectInfo>>;

    fn exists(&self, path: &str) -> Result<bool>;

    /// Removes an object; removing a missing object is not an error.
    fn remove(&self, path: &str) -> Result<()>;

    fn size(&self, path: &str) -> Result<u64>;

    /// Lists all objects under a prefix.
    fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>>;
}

/// A shared handle to an object store.
pub type StoreHandle = Arc<dyn ObjectStore>;

/// Resolves store names to open [`ObjectStore`] handles.
///
/// Stores declared with the `file` protocol open lazily from their spec;
/// other protocols must be registered explicitly by the embedding
/// application.
pub struct StoreRegistry {
    config: StoresConfig,
    open: Mutex<HashMap<String, StoreHandle>>,
}

impl StoreRegistry {
    pub fn new(config: StoresConfig) -> Self {
        StoreRegistry {
            config,
            open: Mutex::new(HashMap::new()),
        }
    }

    /// Registers an externally constructed store (S3, GCS, Azure, mocks)
    /// under a name, overriding any spec with that name.
    pub fn register(&self, name: impl Into<String>, store: StoreHandle) {
        self.open.lock().expect("store registry poisoned").insert(name.into(), store);
    }

    /// The configured spec for a store name (`None`/empty selects the
    /// default store).
    pub fn spec(&self, name: Option<&str>) -> Result<StoreSpec> {
        let resolved = self.resolve_name(name)?;
        self.config
            .specs
            .get(&resolved)
            .cloned()
            .ok_or_else(|| Error::Config(format!("store '{resolved}' is not configured")))
    }

    /// Resolves `None`/`Some("")` to the configured default store name.
    pub fn resolve_name(&self, name: Option<&str>) -> Result<String> {
        match name {
            None | Some("") => self.config.default.clone().ok_or_else(|| {
                Error::Config("no default store configured (set stores.default)".to_string())
            }),
            Some(name) => Ok(name.to_string()),
        }
    }

    /// Opens (or returns the cached) store for a name.
    pub fn open(&self, name: Option<&str>) -> Result<StoreHandle> {
        let resolved = self.resolve_name(name)?;
        if let Some(handle) = self.open.lock().expect("store registry poisoned").get(&resolved) {
            return Ok(handle.clone());
        }
        let spec = self.spec(Some(&resolved))?;
        let handle: StoreHandle = match spec.protocol.as_str() {
            "file" => Arc::new(LocalStore::new(&spec.location)?),
            other => {
                return Err(Error::BucketInaccessible(format!(
                    "store '{resolved}' uses protocol '{other}' with no registered backend"
                )));
            }
        };
        self.open
            .lock()
            .expect("store registry poisoned")
            .insert(resolved, handle.clone());
        Ok(handle)
    }
}

/// Validates a user-supplied `filepath` value against reserved prefixes.
pub fn check_reserved_prefix(path: &str) -> Result<()> {
    if path.starts_with(HASH_PREFIX) {
        return Err(Error::validation(format!(
            "path '{path}' collides with the reserved '{HASH_PREFIX}' prefix"
        )));
    }
    Ok(())
}

/// Metadata persisted in the database for every externally stored value.
/// The concrete codecs extend it; the common part is what garbage
/// collection needs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoredReference {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store: Option<String>,
    pub size: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_opens_file_stores_lazily() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = StoresConfig::default();
        config.default = Some("main".to_string());
        config.specs.insert(
            "main".to_string(),
            StoreSpec {
                location: dir.path().to_path_buf(),
                ..StoreSpec::default()
            },
        );
        let registry = StoreRegistry::new(config);
        let store = registry.open(None).unwrap();
        store.put_buffer("a/b.bin", b"hello").unwrap();
        assert!(registry.open(Some("main")).unwrap().exists("a/b.bin").unwrap());
    }

    #[test]
    fn unknown_protocol_is_inaccessible() {
        let mut config = StoresConfig::default();
        config.specs.insert(
            "cloud".to_string(),
            StoreSpec {
                protocol: "s3".to_string(),
                ..StoreSpec::default()
            },
        );
        let registry = StoreRegistry::new(config);
        assert!(matches!(
            registry.open(Some("cloud")),
            Err(Error::BucketInaccessible(_))
        ));
    }

    #[test]
    fn reserved_prefix_rejected() {
        assert!(check_reserved_prefix("_hash/x").is_err());
        assert!(check_reserved_prefix("data/x").is_ok());
    }
}
