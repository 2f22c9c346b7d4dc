use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tracing::debug;

use super::{ObjectStorage, StorageError, StorageResult};
use crate::config::normalize_base_url;

/// Object storage on the local disk, served over HTTP under `base_url`.
#[derive(Clone, Debug)]
pub struct LocalFileStorage {
    base_dir: PathBuf,
    base_url: String,
}

impl LocalFileStorage {
    pub fn new(base_dir: PathBuf, base_url: String) -> Self {
        Self { base_dir, base_url }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub async fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        let path = self.resolve_path(key)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn put(&self, key: &str, data: &[u8]) -> StorageResult<()> {
        let path = self.resolve_path(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(path, data).await?;
        Ok(())
    }

    pub async fn remove(&self, key: &str) -> StorageResult<()> {
        let path = self.resolve_path(key)?;
        match fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn exists(&self, key: &str) -> StorageResult<bool> {
        let path = self.resolve_path(key)?;
        match fs::metadata(path).await {
            Ok(_) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    pub fn get_public_url(&self, key: &str) -> String {
        let base = normalize_base_url(&self.base_url);
        let key = key.trim_start_matches('/');
        format!("{base}/{key}")
    }

    /// Maps a key to a path under the base directory. Keys may not climb out
    /// of it.
    pub fn resolve_path(&self, key: &str) -> StorageResult<PathBuf> {
        let normalized = Path::new(key.trim_start_matches('/'));
        if normalized.as_os_str().is_empty()
            || normalized
                .components()
                .any(|component| !matches!(component, Component::Normal(_)))
        {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        Ok(self.base_dir.join(normalized))
    }

    pub fn object_key(bucket: &str, key: &str) -> String {
        format!(
            "{}/{}",
            bucket.trim_matches('/'),
            key.trim_start_matches('/')
        )
    }
}

#[async_trait]
impl ObjectStorage for LocalFileStorage {
    async fn upload(
        &self,
        bucket: &str,
        key: &str,
        data: Vec<u8>,
        content_type: &str,
    ) -> StorageResult<String> {
        let object_key = Self::object_key(bucket, key);
        self.put(&object_key, &data).await?;
        debug!(key = %object_key, content_type, bytes = data.len(), "stored object");
        Ok(self.get_public_url(&object_key))
    }

    async fn delete(&self, bucket: &str, key: &str) -> StorageResult<()> {
        self.remove(&Self::object_key(bucket, key)).await
    }
}
