//! Durable object/key-value store used for the chunk cache, the manifest,
//! final documents, and diagnostics.
//!
//! The pipeline only needs `get` and `put`. Entries are always replaced
//! wholesale, never patched, so concurrent readers see either the old or the
//! new value. [`FsObjectStore`] keeps that property on disk by writing to a
//! temp file in the target directory and renaming it into place.

use crate::error::StoreError;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use tokio::sync::RwLock;
use tracing::debug;

/// Minimal durable store interface.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch the bytes stored under `key`, or `None` if absent.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Store `bytes` under `key`, replacing any previous value.
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), StoreError>;
}

// ── In-memory ────────────────────────────────────────────────────────────

/// Process-local store, handy for tests and one-shot runs.
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    entries: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All keys currently stored, sorted.
    pub async fn keys(&self) -> Vec<String> {
        self.entries.read().await.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), StoreError> {
        self.entries.write().await.insert(key.to_string(), bytes);
        Ok(())
    }
}

// ── Filesystem ───────────────────────────────────────────────────────────

/// Directory-backed store: key `a/b/c.json` maps to `<root>/a/b/c.json`.
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a key to a path under the root, rejecting absolute keys and `..`.
    fn path_for(&self, key: &str) -> Result<PathBuf, StoreError> {
        let rel = Path::new(key);
        if key.is_empty()
            || rel
                .components()
                .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(rel))
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::Io {
                key: key.to_string(),
                source: e,
            }),
        }
    }

    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), StoreError> {
        let path = self.path_for(key)?;
        let parent = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        let owned_key = key.to_string();

        tokio::fs::create_dir_all(&parent)
            .await
            .map_err(|e| StoreError::Io {
                key: owned_key.clone(),
                source: e,
            })?;

        // tempfile's persist() is blocking; keep it off the async workers.
        let written = tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
            let io_err = |e: std::io::Error| StoreError::Io {
                key: owned_key.clone(),
                source: e,
            };
            let mut tmp = tempfile::Builder::new()
                .prefix(".put-")
                .tempfile_in(&parent)
                .map_err(io_err)?;
            tmp.write_all(&bytes).map_err(io_err)?;
            tmp.as_file().sync_all().map_err(io_err)?;
            tmp.persist(&path).map_err(|e| io_err(e.error))?;
            Ok(())
        })
        .await
        .map_err(|e| StoreError::Backend(format!("store write task panicked: {e}")))?;

        if written.is_ok() {
            debug!("Stored {}", key);
        }
        written
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_store_roundtrip_and_replace() {
        let store = MemoryObjectStore::new();
        assert!(store.get("a/b.json").await.unwrap().is_none());
        store.put("a/b.json", b"one".to_vec()).await.unwrap();
        store.put("a/b.json", b"two".to_vec()).await.unwrap();
        assert_eq!(store.get("a/b.json").await.unwrap().unwrap(), b"two");
        assert_eq!(store.keys().await, vec!["a/b.json".to_string()]);
    }

    #[tokio::test]
    async fn fs_store_creates_nested_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path());
        store
            .put("cache/doc-1/study_guide/stepA/abc/manifest.json", b"{}".to_vec())
            .await
            .unwrap();
        let got = store
            .get("cache/doc-1/study_guide/stepA/abc/manifest.json")
            .await
            .unwrap();
        assert_eq!(got.as_deref(), Some(&b"{}"[..]));
        assert!(store.get("cache/missing.json").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn fs_store_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path());
        store.put("k/v.json", b"1".to_vec()).await.unwrap();
        let names: Vec<String> = std::fs::read_dir(dir.path().join("k"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["v.json".to_string()]);
    }

    #[test]
    fn fs_store_rejects_escaping_keys() {
        let store = FsObjectStore::new("/tmp/studygen-test");
        assert!(matches!(store.path_for("../etc/passwd"), Err(StoreError::InvalidKey(_))));
        assert!(matches!(store.path_for("/abs"), Err(StoreError::InvalidKey(_))));
        assert!(matches!(store.path_for(""), Err(StoreError::InvalidKey(_))));
        assert!(store.path_for("diagnostics/abc.json").is_ok());
    }

    #[test]
    fn memory_store_works_with_block_on() {
        let store = MemoryObjectStore::new();
        tokio_test::block_on(async {
            store.put("x", vec![1, 2, 3]).await.unwrap();
            assert_eq!(store.len().await, 1);
        });
    }
}
