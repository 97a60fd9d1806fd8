//! Object storage port and the filesystem-backed implementation.
//!
//! Keys are `/`-separated relative paths inside a bucket. The first path
//! segment of a key is its top-level "folder" (a username, or a poll id).

use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::durable::ActivityError;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("invalid storage key: {0}")]
    InvalidKey(String),

    #[error("object not found: {0}")]
    NotFound(String),

    #[error("storage io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<StorageError> for ActivityError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Io(_) => ActivityError::retryable(err.to_string()),
            StorageError::InvalidKey(_) => ActivityError::non_retryable("InvalidKey", err.to_string()),
            StorageError::NotFound(_) => ActivityError::non_retryable("NotFound", err.to_string()),
        }
    }
}

#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Write an object and return its public URL.
    async fn store(&self, key: &str, data: &[u8], content_type: &str) -> Result<String, StorageError>;

    async fn copy(&self, source_key: &str, destination_key: &str) -> Result<(), StorageError>;

    /// Distinct first path segments of every stored key.
    async fn list_top_level_folders(&self) -> Result<Vec<String>, StorageError>;

    /// Newest key under `prefix/`, going by the timestamp segment of generated keys.
    async fn latest_key_with_prefix(&self, prefix: &str) -> Result<Option<String>, StorageError>;

    /// Public URL of `key` if it exists.
    async fn stat(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// Delete every object whose key starts with `prefix`; returns how many were removed.
    async fn delete_prefix(&self, prefix: &str) -> Result<usize, StorageError>;

    fn url(&self, key: &str) -> String;
}

/// `{prefix}/{unix_ts}/content.{ext}`, where `ext` is the MIME subtype or `jpg`.
pub fn generate_storage_key(prefix: &str, content_type: &str, now: DateTime<Utc>) -> String {
    let parts: Vec<&str> = content_type.split('/').collect();
    let extension = match parts.as_slice() {
        [_, subtype] if !subtype.is_empty() => *subtype,
        _ => "jpg",
    };
    format!("{prefix}/{}/content.{extension}", now.timestamp())
}

/// Extension for an object derived from its MIME type, if it has a subtype.
pub fn extension_for_content_type(content_type: &str) -> Option<&str> {
    content_type
        .split_once('/')
        .map(|(_, subtype)| subtype)
        .filter(|subtype| !subtype.is_empty())
}

// ============================================================================
// LocalObjectStorage
// ============================================================================

/// Stores objects as files under `{root}/{bucket}/`.
#[derive(Debug, Clone)]
pub struct LocalObjectStorage {
    root: PathBuf,
    bucket: String,
    public_base_url: String,
}

impl LocalObjectStorage {
    pub fn new(
        root: impl Into<PathBuf>,
        bucket: impl Into<String>,
        public_base_url: impl Into<String>,
    ) -> Self {
        Self {
            root: root.into(),
            bucket: bucket.into(),
            public_base_url: public_base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn bucket_dir(&self) -> PathBuf {
        self.root.join(&self.bucket)
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StorageError> {
        let relative = Path::new(key);
        let valid = !key.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !valid {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        Ok(self.bucket_dir().join(relative))
    }

    /// Every key in the bucket, sorted.
    async fn all_keys(&self) -> Result<Vec<String>, StorageError> {
        let base = self.bucket_dir();
        if !tokio::fs::try_exists(&base).await? {
            return Ok(Vec::new());
        }

        let mut keys = Vec::new();
        let mut pending = vec![base.clone()];
        while let Some(dir) = pending.pop() {
            let mut entries = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    pending.push(path);
                } else if let Ok(relative) = path.strip_prefix(&base) {
                    let key: Vec<String> = relative
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy().to_string())
                        .collect();
                    keys.push(key.join("/"));
                }
            }
        }
        keys.sort();
        Ok(keys)
    }
}

fn timestamp_segment(key: &str) -> u64 {
    key.split('/')
        .nth(1)
        .and_then(|segment| segment.parse().ok())
        .unwrap_or(0)
}

#[async_trait]
impl ObjectStorage for LocalObjectStorage {
    async fn store(&self, key: &str, data: &[u8], content_type: &str) -> Result<String, StorageError> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, data).await?;
        tracing::info!(key = %key, bytes = data.len(), content_type = %content_type, "Object stored");
        Ok(self.url(key))
    }

    async fn copy(&self, source_key: &str, destination_key: &str) -> Result<(), StorageError> {
        let source = self.path_for(source_key)?;
        let destination = self.path_for(destination_key)?;
        if !tokio::fs::try_exists(&source).await? {
            return Err(StorageError::NotFound(source_key.to_string()));
        }
        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(&source, &destination).await?;
        tracing::debug!(source = %source_key, destination = %destination_key, "Object copied");
        Ok(())
    }

    async fn list_top_level_folders(&self) -> Result<Vec<String>, StorageError> {
        let folders: BTreeSet<String> = self
            .all_keys()
            .await?
            .into_iter()
            .filter_map(|key| key.split('/').next().map(str::to_string))
            .collect();
        Ok(folders.into_iter().collect())
    }

    async fn latest_key_with_prefix(&self, prefix: &str) -> Result<Option<String>, StorageError> {
        let folder = format!("{}/", prefix.trim_end_matches('/'));
        Ok(self
            .all_keys()
            .await?
            .into_iter()
            .filter(|key| key.starts_with(&folder))
            .max_by(|a, b| {
                timestamp_segment(a)
                    .cmp(&timestamp_segment(b))
                    .then_with(|| a.cmp(b))
            }))
    }

    async fn stat(&self, key: &str) -> Result<Option<String>, StorageError> {
        let path = self.path_for(key)?;
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Ok(Some(self.url(key))),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize, StorageError> {
        let mut removed = 0;
        for key in self.all_keys().await? {
            if key.starts_with(prefix) {
                tokio::fs::remove_file(self.path_for(&key)?).await?;
                removed += 1;
            }
        }

        // Drop the now-empty folder if the prefix named one.
        if let Some(folder) = prefix.strip_suffix('/') {
            if let Ok(dir) = self.path_for(folder) {
                if tokio::fs::remove_dir_all(&dir).await.is_ok() {
                    tracing::debug!(prefix = %prefix, "Removed storage folder");
                }
            }
        }
        tracing::info!(prefix = %prefix, removed, "Objects deleted");
        Ok(removed)
    }

    fn url(&self, key: &str) -> String {
        format!("{}/{}/{}", self.public_base_url, self.bucket, key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storage(dir: &tempfile::TempDir) -> LocalObjectStorage {
        LocalObjectStorage::new(dir.path(), "bucket", "http://localhost:8080/storage/")
    }

    #[test]
    fn test_generate_storage_key() {
        let now = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        assert_eq!(
            generate_storage_key("octocat", "image/png", now),
            "octocat/1700000000/content.png"
        );
        assert_eq!(
            generate_storage_key("octocat", "weird", now),
            "octocat/1700000000/content.jpg"
        );
        assert_eq!(extension_for_content_type("image/webp"), Some("webp"));
        assert_eq!(extension_for_content_type("png"), None);
    }

    #[tokio::test]
    async fn test_store_copy_stat() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(&dir);

        let url = storage
            .store("octocat/1/content.png", b"img", "image/png")
            .await
            .unwrap();
        assert_eq!(url, "http://localhost:8080/storage/bucket/octocat/1/content.png");

        storage
            .copy("octocat/1/content.png", "poll-1/octocat.png")
            .await
            .unwrap();
        assert!(storage.stat("poll-1/octocat.png").await.unwrap().is_some());
        assert!(storage.stat("poll-1/missing.png").await.unwrap().is_none());

        let err = storage.copy("nobody/1/content.png", "poll-1/x.png").await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_rejects_escaping_keys() {
        let dir = tempfile::tempdir().unwrap();
        let err = storage(&dir).store("../evil", b"x", "text/plain").await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidKey(_)));
    }

    #[tokio::test]
    async fn test_folders_latest_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(&dir);
        storage.store("alice/900/content.png", b"a", "image/png").await.unwrap();
        storage.store("alice/1000/content.jpeg", b"b", "image/jpeg").await.unwrap();
        storage.store("poll-x/alice.png", b"c", "image/png").await.unwrap();

        assert_eq!(
            storage.list_top_level_folders().await.unwrap(),
            vec!["alice".to_string(), "poll-x".to_string()]
        );
        // numeric, not lexicographic: 1000 > 900
        assert_eq!(
            storage.latest_key_with_prefix("alice").await.unwrap().as_deref(),
            Some("alice/1000/content.jpeg")
        );
        assert_eq!(storage.latest_key_with_prefix("bob").await.unwrap(), None);

        assert_eq!(storage.delete_prefix("poll-x/").await.unwrap(), 1);
        assert_eq!(
            storage.list_top_level_folders().await.unwrap(),
            vec!["alice".to_string()]
        );
    }
}
