// File Storage Layer
// Uniform filesystem abstraction over the local filesystem and, through
// the provider registry, over object stores. The graph adapter and the
// cloud sync layer consume this instead of touching paths directly.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::cloud_storage::StorageProviderRegistry;

/// Data accepted by `store`. Streaming payloads larger than memory are
/// out of scope; callers hand over the whole value.
#[derive(Debug, Clone)]
pub enum StorageData {
    Text(String),
    Binary(Vec<u8>),
}

impl StorageData {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            StorageData::Text(s) => s.as_bytes(),
            StorageData::Binary(b) => b,
        }
    }
}

impl From<String> for StorageData {
    fn from(value: String) -> Self {
        StorageData::Text(value)
    }
}

impl From<Vec<u8>> for StorageData {
    fn from(value: Vec<u8>) -> Self {
        StorageData::Binary(value)
    }
}

/// Mode for scoped file acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    Write,
}

/// Capability set every storage backend provides.
///
/// Paths are relative to the backend's root. Implementations adapt any
/// internally blocking work onto a worker so callers can await freely.
#[async_trait]
pub trait FileStorage: Send + Sync {
    async fn file_exists(&self, path: &str) -> Result<bool>;

    async fn is_dir(&self, path: &str) -> Result<bool>;

    async fn is_file(&self, path: &str) -> Result<bool>;

    async fn get_size(&self, path: &str) -> Result<u64>;

    /// Store data, creating intermediate directories. Returns the
    /// canonical URI of the stored file. Without `overwrite`, an
    /// existing file is left untouched.
    async fn store(&self, path: &str, data: StorageData, overwrite: bool) -> Result<String>;

    /// Scoped open: the returned handle releases the file when dropped.
    async fn open(&self, path: &str, mode: OpenMode) -> Result<fs::File>;

    async fn ensure_directory_exists(&self, path: &str) -> Result<()>;

    async fn copy_file(&self, source: &str, destination: &str) -> Result<()>;

    /// Remove a file; missing files are ignored.
    async fn remove(&self, path: &str) -> Result<()>;

    /// Remove a whole directory tree; missing trees are ignored.
    async fn remove_all(&self, path: &str) -> Result<()>;
}

/// Storage rooted at a local directory.
pub struct LocalFileStorage {
    root: PathBuf,
}

impl LocalFileStorage {
    pub fn new(root: impl Into<String>) -> Self {
        let root: String = root.into();
        let root = root.strip_prefix("file://").unwrap_or(&root).to_string();
        Self {
            root: PathBuf::from(root),
        }
    }

    fn full_path(&self, path: &str) -> PathBuf {
        if path.is_empty() {
            self.root.clone()
        } else {
            self.root.join(path)
        }
    }
}

#[async_trait]
impl FileStorage for LocalFileStorage {
    async fn file_exists(&self, path: &str) -> Result<bool> {
        Ok(fs::try_exists(self.full_path(path)).await?)
    }

    async fn is_dir(&self, path: &str) -> Result<bool> {
        match fs::metadata(self.full_path(path)).await {
            Ok(metadata) => Ok(metadata.is_dir()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn is_file(&self, path: &str) -> Result<bool> {
        match fs::metadata(self.full_path(path)).await {
            Ok(metadata) => Ok(metadata.is_file()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_size(&self, path: &str) -> Result<u64> {
        let full = self.full_path(path);
        let metadata = fs::metadata(&full)
            .await
            .with_context(|| format!("failed to stat: {}", full.display()))?;
        Ok(metadata.len())
    }

    async fn store(&self, path: &str, data: StorageData, overwrite: bool) -> Result<String> {
        let full = self.full_path(path);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create directory: {}", parent.display()))?;
        }

        if overwrite || !fs::try_exists(&full).await? {
            let mut file = fs::File::create(&full)
                .await
                .with_context(|| format!("failed to create file: {}", full.display()))?;
            file.write_all(data.as_bytes()).await?;
            file.flush().await?;
        }

        Ok(format!("file://{}", full.display()))
    }

    async fn open(&self, path: &str, mode: OpenMode) -> Result<fs::File> {
        let full = self.full_path(path);
        let file = match mode {
            OpenMode::Read => fs::File::open(&full)
                .await
                .with_context(|| format!("failed to open for read: {}", full.display()))?,
            OpenMode::Write => {
                if let Some(parent) = full.parent() {
                    fs::create_dir_all(parent).await?;
                }
                fs::File::create(&full)
                    .await
                    .with_context(|| format!("failed to open for write: {}", full.display()))?
            }
        };
        Ok(file)
    }

    async fn ensure_directory_exists(&self, path: &str) -> Result<()> {
        let full = self.full_path(path);
        fs::create_dir_all(&full)
            .await
            .with_context(|| format!("failed to create directory: {}", full.display()))?;
        Ok(())
    }

    async fn copy_file(&self, source: &str, destination: &str) -> Result<()> {
        let from = self.full_path(source);
        let to = self.full_path(destination);
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::copy(&from, &to).await.with_context(|| {
            format!("failed to copy {} to {}", from.display(), to.display())
        })?;
        Ok(())
    }

    async fn remove(&self, path: &str) -> Result<()> {
        let full = self.full_path(path);
        match fs::remove_file(&full).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                Err(e).with_context(|| format!("failed to remove file: {}", full.display()))
            }
        }
    }

    async fn remove_all(&self, path: &str) -> Result<()> {
        let full = self.full_path(path);
        match fs::remove_dir_all(&full).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                Err(e).with_context(|| format!("failed to remove tree: {}", full.display()))
            }
        }
    }
}

/// Manages storage operations by delegating to a backend.
pub struct StorageManager {
    storage: Box<dyn FileStorage>,
}

impl std::fmt::Debug for StorageManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageManager").finish_non_exhaustive()
    }
}

impl StorageManager {
    pub fn new(storage: Box<dyn FileStorage>) -> Self {
        Self { storage }
    }

    pub async fn file_exists(&self, path: &str) -> Result<bool> {
        self.storage.file_exists(path).await
    }

    pub async fn is_dir(&self, path: &str) -> Result<bool> {
        self.storage.is_dir(path).await
    }

    pub async fn is_file(&self, path: &str) -> Result<bool> {
        self.storage.is_file(path).await
    }

    pub async fn get_size(&self, path: &str) -> Result<u64> {
        self.storage.get_size(path).await
    }

    pub async fn store(
        &self,
        path: &str,
        data: impl Into<StorageData> + Send,
        overwrite: bool,
    ) -> Result<String> {
        self.storage.store(path, data.into(), overwrite).await
    }

    pub async fn open(&self, path: &str, mode: OpenMode) -> Result<fs::File> {
        self.storage.open(path, mode).await
    }

    pub async fn ensure_directory_exists(&self, path: &str) -> Result<()> {
        self.storage.ensure_directory_exists(path).await
    }

    pub async fn copy_file(&self, source: &str, destination: &str) -> Result<()> {
        self.storage.copy_file(source, destination).await
    }

    pub async fn remove(&self, path: &str) -> Result<()> {
        self.storage.remove(path).await
    }

    pub async fn remove_all(&self, path: &str) -> Result<()> {
        self.storage.remove_all(path).await
    }
}

/// Build a storage manager for a root path or URI.
///
/// Cloud schemes resolve through the provider registry; everything else
/// is treated as a local directory.
pub fn get_file_storage(root: &str) -> Result<StorageManager> {
    if let Some(scheme) = StorageProviderRegistry::cloud_scheme_of(root) {
        let provider = StorageProviderRegistry::get(&scheme)?;
        Ok(StorageManager::new(provider.file_storage(root)?))
    } else {
        Ok(StorageManager::new(Box::new(LocalFileStorage::new(root))))
    }
}

/// Local directory of a path, for rooting a storage manager next to a
/// database file.
pub fn parent_dir_of(path: &str) -> String {
    let parent = Path::new(path)
        .parent()
        .map(|p| p.to_path_buf())
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| PathBuf::from("."));
    parent.display().to_string()
}
