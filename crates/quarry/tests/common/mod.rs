//! Shared fixtures for the integration suite: an in-memory SQLite
//! connection with a local object store and safemode off.

use quarry::{Connection, Config};
use quarry_core::config::StoreSpec;

// not every suite touches the store or download directories
#[allow(dead_code)]
pub struct Fixture {
    pub conn: Connection,
    pub store_dir: tempfile::TempDir,
    pub download_dir: tempfile::TempDir,
}

pub fn fixture() -> Fixture {
    fixture_with(|_| {})
}

pub fn fixture_with(adjust: impl FnOnce(&mut Config)) -> Fixture {
    let store_dir = tempfile::tempdir().expect("store dir");
    let download_dir = tempfile::tempdir().expect("download dir");
    let mut config = Config {
        safemode: false,
        download_path: download_dir.path().to_path_buf(),
        ..Config::default()
    };
    config.stores.default = Some("main".to_string());
    config.stores.specs.insert(
        "main".to_string(),
        StoreSpec {
            location: store_dir.path().to_path_buf(),
            subfolding: Some(vec![2, 2]),
            ..StoreSpec::default()
        },
    );
    adjust(&mut config);
    let conn = Connection::open_sqlite_in_memory(config).expect("connection");
    Fixture {
        conn,
        store_dir,
        download_dir,
    }
}

/// Collects one integer attribute from fetched rows, sorted.
pub fn int_column(rows: &[quarry::Row], name: &str) -> Vec<i64> {
    let mut out: Vec<i64> = rows
        .iter()
        .filter_map(|r| r.get(name).and_then(|v| v.as_int()))
        .collect();
    out.sort();
    out
}
