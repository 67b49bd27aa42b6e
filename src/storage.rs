//! Segment storage
//!
//! The segmenter and the HTTP edge talk to storage through a narrow
//! put/get/delete/list interface so the backend can be swapped out. The
//! default backend is the local filesystem; calls are blocking and are
//! dispatched via `tokio::task::spawn_blocking` by async callers.

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use bytes::Bytes;
use tracing::debug;

/// Object storage boundary. Paths are forward-slash relative keys such as
/// `{stream_key}/segment_3.m4s`.
pub trait Storage: Send + Sync + 'static {
    fn put(&self, path: &str, data: &[u8]) -> io::Result<()>;
    fn get(&self, path: &str) -> io::Result<Bytes>;
    fn delete(&self, path: &str) -> io::Result<()>;
    fn list(&self, prefix: &str) -> io::Result<Vec<String>>;

    /// Remove every object under `prefix`. Missing prefixes are fine.
    fn delete_prefix(&self, prefix: &str) -> io::Result<()> {
        for name in self.list(prefix)? {
            self.delete(&format!("{prefix}/{name}"))?;
        }
        Ok(())
    }
}

/// Local-filesystem backend rooted at a directory
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Resolve a relative key under the root, rejecting traversal.
    fn resolve(&self, path: &str) -> io::Result<PathBuf> {
        let rel = Path::new(path);
        let clean = rel
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        if !clean || rel.is_absolute() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid storage path {path:?}"),
            ));
        }
        Ok(self.root.join(rel))
    }
}

impl Storage for LocalStorage {
    fn put(&self, path: &str, data: &[u8]) -> io::Result<()> {
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        // write-then-rename so concurrent readers never see a torn object
        let tmp = target.with_extension("tmp");
        fs::write(&tmp, data)?;
        fs::rename(&tmp, &target)?;
        debug!(path, bytes = data.len(), "stored object");
        Ok(())
    }

    fn get(&self, path: &str) -> io::Result<Bytes> {
        let target = self.resolve(path)?;
        Ok(Bytes::from(fs::read(target)?))
    }

    fn delete(&self, path: &str) -> io::Result<()> {
        let target = self.resolve(path)?;
        match fs::remove_file(target) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn list(&self, prefix: &str) -> io::Result<Vec<String>> {
        let dir = self.resolve(prefix)?;
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }

    fn delete_prefix(&self, prefix: &str) -> io::Result<()> {
        let dir = self.resolve(prefix)?;
        match fs::remove_dir_all(dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// In-memory backend for tests: deterministic and free of blocking I/O
#[cfg(test)]
#[derive(Default)]
pub struct MemoryStorage {
    objects: parking_lot::Mutex<std::collections::HashMap<String, Bytes>>,
}

#[cfg(test)]
impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
impl Storage for MemoryStorage {
    fn put(&self, path: &str, data: &[u8]) -> io::Result<()> {
        self.objects
            .lock()
            .insert(path.to_string(), Bytes::copy_from_slice(data));
        Ok(())
    }

    fn get(&self, path: &str) -> io::Result<Bytes> {
        self.objects
            .lock()
            .get(path)
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, path.to_string()))
    }

    fn delete(&self, path: &str) -> io::Result<()> {
        self.objects.lock().remove(path);
        Ok(())
    }

    fn list(&self, prefix: &str) -> io::Result<Vec<String>> {
        let dir = format!("{prefix}/");
        let mut names: Vec<String> = self
            .objects
            .lock()
            .keys()
            .filter_map(|k| k.strip_prefix(&dir).map(str::to_string))
            .collect();
        names.sort();
        Ok(names)
    }
}
