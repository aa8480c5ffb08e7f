//! Object store trait definitions.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::StorageResult;

/// Default page size for [`ObjectStore::list`].
pub const DEFAULT_MAX_KEYS: usize = 1000;

/// A listed object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectInfo {
    /// Full key. Directory markers and common prefixes end with `/`.
    pub key: String,
    pub size: u64,
    pub last_modified: Option<DateTime<Utc>>,
    pub is_directory: bool,
}

impl ObjectInfo {
    pub fn file(key: impl Into<String>, size: u64) -> Self {
        Self {
            key: key.into(),
            size,
            last_modified: None,
            is_directory: false,
        }
    }

    pub fn directory(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            size: 0,
            last_modified: None,
            is_directory: true,
        }
    }

    pub fn with_modified(mut self, time: DateTime<Utc>) -> Self {
        self.last_modified = Some(time);
        self
    }
}

/// Key/value object store with S3-style prefix semantics.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store an object, replacing any existing one.
    async fn upload(&self, key: &str, data: &[u8], content_type: &str) -> StorageResult<()>;

    async fn download(&self, key: &str) -> StorageResult<Vec<u8>>;

    /// Remove one object. A missing object is not an error.
    async fn delete(&self, key: &str) -> StorageResult<()>;

    /// Remove every object whose key starts with `prefix`.
    async fn delete_prefix(&self, prefix: &str) -> StorageResult<()>;

    /// One page of objects under `prefix`.
    ///
    /// With a delimiter, keys containing it after the prefix collapse into a single
    /// directory entry. `max_keys == 0` means [`DEFAULT_MAX_KEYS`].
    async fn list(
        &self,
        prefix: &str,
        delimiter: Option<&str>,
        max_keys: usize,
    ) -> StorageResult<Vec<ObjectInfo>>;

    /// Every object under `prefix`, recursively.
    async fn list_all(&self, prefix: &str) -> StorageResult<Vec<ObjectInfo>>;

    /// Time-limited download URL.
    async fn presigned_url(&self, key: &str, expiry: Duration) -> StorageResult<String>;

    async fn copy(&self, src_key: &str, dst_key: &str) -> StorageResult<()>;

    async fn object_size(&self, key: &str) -> StorageResult<u64>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_info_constructors() {
        let file = ObjectInfo::file("public/readme.md", 12);
        assert!(!file.is_directory);
        assert_eq!(file.size, 12);

        let dir = ObjectInfo::directory("public/docs/");
        assert!(dir.is_directory);
        assert!(dir.key.ends_with('/'));
    }
}
