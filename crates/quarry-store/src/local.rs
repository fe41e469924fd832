//! Local-filesystem object store.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::debug;

use quarry_core::error::{Error, Result};

use crate::{ObjectInfo, ObjectStore};

/// Object store over a local directory. Writes are atomic: data goes to a
/// temporary file in the destination directory and is renamed into place.
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    /// Opens a store rooted at an existing directory.
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        if !root.is_dir() {
            return Err(Error::BucketInaccessible(format!(
                "inaccessible local store directory {}",
                root.display()
            )));
        }
        Ok(LocalStore { root })
    }

    fn full(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }

    fn atomic_write(&self, target: &Path, data: &[u8]) -> Result<()> {
        let dir = target.parent().ok_or_else(|| Error::invalid("path has no parent"))?;
        fs::create_dir_all(dir)?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(data)?;
        tmp.persist(target)
            .map_err(|e| Error::Io(e.error))?;
        Ok(())
    }
}

impl ObjectStore for LocalStore {
    fn put_buffer(&self, path: &str, data: &[u8]) -> Result<()> {
        debug!(path, bytes = data.len(), "local put_buffer");
        self.atomic_write(&self.full(path), data)
    }

    fn get_buffer(&self, path: &str) -> Result<Vec<u8>> {
        let full = self.full(path);
        fs::read(&full).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::MissingExternalFile(full.display().to_string())
            } else {
                Error::Io(e)
            }
        })
    }

    fn put_file(&self, local: &Path, path: &str) -> Result<()> {
        let data = fs::read(local)?;
        self.atomic_write(&self.full(path), &data)
    }

    fn get_file(&self, path: &str, local: &Path) -> Result<()> {
        let data = self.get_buffer(path)?;
        if let Some(dir) = local.parent() {
            fs::create_dir_all(dir)?;
        }
        fs::write(local, data)?;
        Ok(())
    }

    fn put_folder(&self, local: &Path, path: &str) -> Result<Vec<ObjectInfo>> {
        let mut manifest = Vec::new();
        let mut stack = vec![local.to_path_buf()];
        while let Some(dir) = stack.pop() {
            for entry in fs::read_dir(&dir)? {
                let entry = entry?;
                let entry_path = entry.path();
                if entry_path.is_dir() {
                    stack.push(entry_path);
                } else {
                    let rel = entry_path
                        .strip_prefix(local)
                        .map_err(|_| Error::invalid("folder entry escapes the source root"))?
                        .to_string_lossy()
                        .replace('\\', "/");
                    let data = fs::read(&entry_path)?;
                    self.atomic_write(&self.full(&format!("{path}/{rel}")), &data)?;
                    manifest.push(ObjectInfo {
                        path: rel,
                        size: data.len() as u64,
                    });
                }
            }
        }
        manifest.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(manifest)
    }

    fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.full(path).is_file())
    }

    fn remove(&self, path: &str) -> Result<()> {
        let full = self.full(path);
        match fs::remove_file(&full) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io(e)),
        }
    }

    fn size(&self, path: &str) -> Result<u64> {
        let full = self.full(path);
        let meta = fs::metadata(&full).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::MissingExternalFile(full.display().to_string())
            } else {
                Error::Io(e)
            }
        })?;
        Ok(meta.len())
    }

    fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>> {
        let base = self.full(prefix);
        let mut out = Vec::new();
        if !base.exists() {
            return Ok(out);
        }
        let mut stack = vec![base];
        while let Some(dir) = stack.pop() {
            for entry in fs::read_dir(&dir)? {
                let entry = entry?;
                let entry_path = entry.path();
                if entry_path.is_dir() {
                    stack.push(entry_path);
                } else {
                    let rel = entry_path
                        .strip_prefix(&self.root)
                        .map_err(|_| Error::invalid("listing escaped the store root"))?
                        .to_string_lossy()
                        .replace('\\', "/");
                    out.push(ObjectInfo {
                        path: rel,
                        size: entry.metadata()?.len(),
                    });
                }
            }
        }
        out.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, LocalStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn buffer_roundtrip() {
        let (_dir, store) = store();
        store.put_buffer("a/b/c.bin", b"payload").unwrap();
        assert!(store.exists("a/b/c.bin").unwrap());
        assert_eq!(store.get_buffer("a/b/c.bin").unwrap(), b"payload");
        assert_eq!(store.size("a/b/c.bin").unwrap(), 7);
    }

    #[test]
    fn missing_object_is_typed() {
        let (_dir, store) = store();
        assert!(matches!(
            store.get_buffer("nope.bin"),
            Err(Error::MissingExternalFile(_))
        ));
        // removing a missing object is fine
        store.remove("nope.bin").unwrap();
    }

    #[test]
    fn list_is_recursive_and_sorted() {
        let (_dir, store) = store();
        store.put_buffer("p/z.bin", b"z").unwrap();
        store.put_buffer("p/sub/a.bin", b"a").unwrap();
        store.put_buffer("q/other.bin", b"o").unwrap();
        let listed = store.list("p").unwrap();
        let paths: Vec<&str> = listed.iter().map(|o| o.path.as_str()).collect();
        assert_eq!(paths, ["p/sub/a.bin", "p/z.bin"]);
    }

    #[test]
    fn folder_upload_builds_manifest() {
        let (_dir, store) = store();
        let src = tempfile::tempdir().unwrap();
        fs::create_dir_all(src.path().join("inner")).unwrap();
        fs::write(src.path().join("top.txt"), b"1").unwrap();
        fs::write(src.path().join("inner/deep.txt"), b"22").unwrap();
        let manifest = store.put_folder(src.path(), "obj/run1").unwrap();
        assert_eq!(manifest.len(), 2);
        assert_eq!(manifest[0].path, "inner/deep.txt");
        assert_eq!(manifest[0].size, 2);
        assert!(store.exists("obj/run1/top.txt").unwrap());
    }
}
