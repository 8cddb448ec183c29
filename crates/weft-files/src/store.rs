//! Content storage collaborator.
//!
//! Nodes hand verified content to a [`ContentStore`] keyed by its root and
//! ask it for content when a peer requests a download. Two implementations
//! ship here: an in-memory map for clients and tests, and a flat directory
//! store for workers.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::RwLock;
use tracing::debug;
use weft_core::RootHash;

use crate::error::{FilesError, Result};
use crate::root_key;

/// Where assembled content lives
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Store `data` under `root`, replacing any previous value.
    ///
    /// # Errors
    ///
    /// Returns [`FilesError::Storage`] if the write fails.
    async fn put(&self, root: RootHash, name: &str, data: Bytes) -> Result<()>;

    /// Fetch content by root, `None` if absent.
    ///
    /// # Errors
    ///
    /// Returns [`FilesError::Storage`] if the read fails.
    async fn get(&self, root: &RootHash) -> Result<Option<Bytes>>;

    /// Whether content for `root` is present.
    ///
    /// # Errors
    ///
    /// Returns [`FilesError::Storage`] if the lookup fails.
    async fn contains(&self, root: &RootHash) -> Result<bool> {
        Ok(self.get(root).await?.is_some())
    }

    /// Name recorded by [`put`](Self::put), `None` if absent or not kept.
    ///
    /// # Errors
    ///
    /// Returns [`FilesError::Storage`] if the lookup fails.
    async fn name(&self, _root: &RootHash) -> Result<Option<String>> {
        Ok(None)
    }
}

/// Volatile store backed by a map
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<RootHash, (String, Bytes)>>,
}

impl MemoryStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored items
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

#[async_trait]
impl ContentStore for MemoryStore {
    async fn put(&self, root: RootHash, name: &str, data: Bytes) -> Result<()> {
        self.entries
            .write()
            .await
            .insert(root, (name.to_string(), data));
        Ok(())
    }

    async fn get(&self, root: &RootHash) -> Result<Option<Bytes>> {
        Ok(self.entries.read().await.get(root).map(|(_, d)| d.clone()))
    }

    async fn contains(&self, root: &RootHash) -> Result<bool> {
        Ok(self.entries.read().await.contains_key(root))
    }

    async fn name(&self, root: &RootHash) -> Result<Option<String>> {
        Ok(self.entries.read().await.get(root).map(|(n, _)| n.clone()))
    }
}

/// Directory of files named by hex root, each with a `.name` sidecar
#[derive(Debug, Clone)]
pub struct FsStore {
    dir: PathBuf,
}

impl FsStore {
    /// Open a store rooted at `dir`, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns [`FilesError::Storage`] if the directory cannot be created.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(FilesError::Storage)?;
        Ok(Self { dir })
    }

    /// Store directory
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, root: &RootHash) -> PathBuf {
        self.dir.join(root_key(root))
    }

    fn name_path(&self, root: &RootHash) -> PathBuf {
        self.path_for(root).with_extension("name")
    }
}

#[async_trait]
impl ContentStore for FsStore {
    async fn put(&self, root: RootHash, name: &str, data: Bytes) -> Result<()> {
        let path = self.path_for(&root);
        let part = path.with_extension("part");
        tokio::fs::write(self.name_path(&root), name)
            .await
            .map_err(FilesError::Storage)?;
        tokio::fs::write(&part, &data)
            .await
            .map_err(FilesError::Storage)?;
        tokio::fs::rename(&part, &path)
            .await
            .map_err(FilesError::Storage)?;
        debug!(root = %root_key(&root), name, bytes = data.len(), "stored content");
        Ok(())
    }

    async fn get(&self, root: &RootHash) -> Result<Option<Bytes>> {
        match tokio::fs::read(self.path_for(root)).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(FilesError::Storage(e)),
        }
    }

    async fn contains(&self, root: &RootHash) -> Result<bool> {
        match tokio::fs::metadata(self.path_for(root)).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(FilesError::Storage(e)),
        }
    }

    async fn name(&self, root: &RootHash) -> Result<Option<String>> {
        match tokio::fs::read_to_string(self.name_path(root)).await {
            Ok(name) => Ok(Some(name)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(FilesError::Storage(e)),
        }
    }
}
