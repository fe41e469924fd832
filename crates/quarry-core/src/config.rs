//! Typed configuration for connections, stores, display, and the job system.
//!
//! Configuration is owned by each connection instance rather than a process
//! global. It can be built in code, loaded from a JSON file, or both (file
//! values override defaults field by field via serde defaults).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Top-level configuration tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Require confirmation gates for destructive operations.
    pub safemode: bool,
    pub display: DisplayConfig,
    pub stores: StoresConfig,
    /// Local directory where `attach` decodes write their files.
    pub download_path: PathBuf,
    pub jobs: JobsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            safemode: true,
            display: DisplayConfig::default(),
            stores: StoresConfig::default(),
            download_path: PathBuf::from("."),
            jobs: JobsConfig::default(),
        }
    }
}

impl Config {
    /// Loads configuration from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Config> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {e}", path.display())))?;
        serde_json::from_str(&text)
            .map_err(|e| Error::Config(format!("failed to parse {}: {e}", path.display())))
    }

    /// Resolves a store spec by name; `None` selects the configured default
    /// store, and `Some("")` (from `<codec@>`) does the same.
    pub fn store_spec(&self, name: Option<&str>) -> Result<&StoreSpec> {
        let name = match name {
            None | Some("") => self.stores.default.as_deref().ok_or_else(|| {
                Error::Config("no default store configured (set stores.default)".to_string())
            })?,
            Some(name) => name,
        };
        self.stores
            .specs
            .get(name)
            .ok_or_else(|| Error::Config(format!("store '{name}' is not configured")))
    }
}

/// Preview rendering limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    /// Maximum rows shown by previews.
    pub limit: usize,
    /// Maximum characters per cell before truncation.
    pub width: usize,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        DisplayConfig { limit: 12, width: 30 }
    }
}

/// The set of configured object stores.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoresConfig {
    /// Name of the store used by `<codec@>` without an explicit name.
    pub default: Option<String>,
    pub specs: HashMap<String, StoreSpec>,
}

/// One object store definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSpec {
    /// Storage protocol: `"file"` in-tree; `"s3"`, `"gcs"`, `"azure"` via
    /// external object-store implementations.
    pub protocol: String,
    /// Base directory (file protocol) or bucket prefix.
    pub location: PathBuf,
    /// Hash subfolding pattern, e.g. `[2, 2]`; `None` keeps paths flat.
    pub subfolding: Option<Vec<usize>>,
    /// Partition prefix pattern for schema-addressed paths.
    pub partition_pattern: Option<String>,
    /// Length of the primary-key token in schema-addressed paths.
    pub token_length: usize,
}

impl Default for StoreSpec {
    fn default() -> Self {
        StoreSpec {
            protocol: "file".to_string(),
            location: PathBuf::new(),
            subfolding: None,
            partition_pattern: None,
            token_length: 8,
        }
    }
}

/// Job-system defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobsConfig {
    /// Priority assigned to new jobs; smaller is more urgent.
    pub default_priority: u8,
    /// Seconds after which pending jobs are checked against the key source.
    pub stale_timeout: u64,
    /// Seconds after which reserved jobs are considered orphaned.
    pub orphan_timeout: u64,
    /// Keep success rows instead of deleting completed jobs.
    pub keep_completed: bool,
    /// Add hidden `_job_*` columns to auto-populated tables.
    pub add_job_metadata: bool,
    /// Refresh the job queue at the start of a distributed populate.
    pub auto_refresh: bool,
    /// Permit native (non-FK) primary key attributes in auto-populated
    /// tables, at the cost of coarser job granularity.
    pub allow_native_pk_in_computed: bool,
    /// Version string recorded on job rows and job metadata columns.
    pub version: String,
}

impl Default for JobsConfig {
    fn default() -> Self {
        JobsConfig {
            default_priority: 5,
            stale_timeout: 3600,
            orphan_timeout: 3600,
            keep_completed: false,
            add_job_metadata: true,
            auto_refresh: true,
            allow_native_pk_in_computed: false,
            version: String::new(),
        }
    }
}
