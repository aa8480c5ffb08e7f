//! Local filesystem object store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::debug;
use sha2::{Digest, Sha256};
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use walkdir::WalkDir;

use super::traits::DEFAULT_MAX_KEYS;
use super::{ObjectInfo, ObjectStore, StorageError, StorageResult};

/// Object store rooted at a local directory. Keys map to relative paths.
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
    signing_key: String,
    base_url: String,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            signing_key: String::new(),
            base_url: "file://".to_string(),
        }
    }

    /// Secret and URL prefix used for presigned download URLs.
    pub fn with_signing(mut self, signing_key: impl Into<String>, base_url: impl Into<String>) -> Self {
        self.signing_key = signing_key.into();
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> StorageResult<PathBuf> {
        let relative = key.trim_start_matches('/');
        if relative.is_empty() {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        let rel_path = Path::new(relative);
        if rel_path
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(rel_path))
    }

    fn signature(&self, key: &str, expires: i64) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.signing_key.as_bytes());
        hasher.update(b"\n");
        hasher.update(key.as_bytes());
        hasher.update(b"\n");
        hasher.update(expires.to_string().as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Check a presigned URL's signature and expiry.
    pub fn verify_presigned(&self, key: &str, expires: i64, signature: &str) -> bool {
        expires >= Utc::now().timestamp() && self.signature(key, expires) == signature
    }
}

fn not_found(key: &str) -> impl FnOnce(std::io::Error) -> StorageError + '_ {
    move |e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            StorageError::NotFound(key.to_string())
        } else {
            StorageError::Io(e)
        }
    }
}

fn system_time_to_chrono(time: std::time::SystemTime) -> Option<DateTime<Utc>> {
    time.duration_since(std::time::UNIX_EPOCH)
        .ok()
        .and_then(|d| DateTime::from_timestamp(d.as_secs() as i64, d.subsec_nanos()))
}

/// Walk the store and return every file plus a marker for each empty directory.
fn walk(root: &Path, prefix: &str) -> StorageResult<Vec<ObjectInfo>> {
    if !root.exists() {
        return Ok(Vec::new());
    }

    let mut objects = Vec::new();
    for entry in WalkDir::new(root).min_depth(1) {
        let entry = entry.map_err(|e| StorageError::Backend(e.to_string()))?;
        let Ok(relative) = entry.path().strip_prefix(root) else {
            continue;
        };
        let key = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        let meta = entry
            .metadata()
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        let info = if meta.is_dir() {
            let empty = std::fs::read_dir(entry.path())?.next().is_none();
            if !empty {
                continue;
            }
            ObjectInfo::directory(format!("{key}/"))
        } else {
            ObjectInfo::file(key, meta.len())
        };
        if !info.key.starts_with(prefix) {
            continue;
        }
        let info = match meta.modified().ok().and_then(system_time_to_chrono) {
            Some(dt) => info.with_modified(dt),
            None => info,
        };
        objects.push(info);
    }

    objects.sort_by(|a, b| a.key.cmp(&b.key));
    Ok(objects)
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn upload(&self, key: &str, data: &[u8], _content_type: &str) -> StorageResult<()> {
        let path = self.path_for(key)?;
        if key.ends_with('/') {
            fs::create_dir_all(&path).await?;
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&path, data).await?;
        debug!("Stored {} bytes at {}", data.len(), key);
        Ok(())
    }

    async fn download(&self, key: &str) -> StorageResult<Vec<u8>> {
        let path = self.path_for(key)?;
        fs::read(&path).await.map_err(not_found(key))
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        let path = self.path_for(key)?;
        let result = if key.ends_with('/') {
            fs::remove_dir(&path).await
        } else {
            fs::remove_file(&path).await
        };
        match result {
            Ok(()) => {
                debug!("Deleted {}", key);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            // A directory marker whose directory still holds objects.
            Err(_) if key.ends_with('/') => Ok(()),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    async fn delete_prefix(&self, prefix: &str) -> StorageResult<()> {
        if prefix.ends_with('/') {
            let path = self.path_for(prefix)?;
            return match fs::remove_dir_all(&path).await {
                Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(StorageError::Io(e)),
                _ => {
                    debug!("Deleted prefix {}", prefix);
                    Ok(())
                }
            };
        }
        for object in self.list_all(prefix).await? {
            self.delete(&object.key).await?;
        }
        Ok(())
    }

    async fn list(
        &self,
        prefix: &str,
        delimiter: Option<&str>,
        max_keys: usize,
    ) -> StorageResult<Vec<ObjectInfo>> {
        let prefix = prefix.trim_start_matches('/');
        let limit = if max_keys == 0 {
            DEFAULT_MAX_KEYS
        } else {
            max_keys
        };
        let all = self.list_all(prefix).await?;

        let Some(delim) = delimiter.filter(|d| !d.is_empty()) else {
            return Ok(all.into_iter().take(limit).collect());
        };

        let mut out: Vec<ObjectInfo> = Vec::new();
        for object in all {
            let rest = &object.key[prefix.len()..];
            match rest.find(delim) {
                Some(idx) => {
                    let common = format!("{}{}", prefix, &rest[..idx + delim.len()]);
                    if out.last().map(|o| o.key.as_str()) != Some(common.as_str()) {
                        out.push(ObjectInfo::directory(common));
                    }
                }
                None => out.push(object),
            }
            if out.len() >= limit {
                break;
            }
        }
        Ok(out)
    }

    async fn list_all(&self, prefix: &str) -> StorageResult<Vec<ObjectInfo>> {
        let root = self.root.clone();
        let prefix = prefix.trim_start_matches('/').to_string();
        tokio::task::spawn_blocking(move || walk(&root, &prefix))
            .await
            .map_err(|e| StorageError::Backend(format!("listing task failed: {e}")))?
    }

    async fn presigned_url(&self, key: &str, expiry: Duration) -> StorageResult<String> {
        self.path_for(key)?;
        let expires = Utc::now().timestamp() + expiry.as_secs() as i64;
        Ok(format!(
            "{}/{}?expires={}&signature={}",
            self.base_url,
            key.trim_start_matches('/'),
            expires,
            self.signature(key, expires)
        ))
    }

    async fn copy(&self, src_key: &str, dst_key: &str) -> StorageResult<()> {
        let src = self.path_for(src_key)?;
        let dst = self.path_for(dst_key)?;
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::copy(&src, &dst).await.map_err(not_found(src_key))?;
        debug!("Copied {} to {}", src_key, dst_key);
        Ok(())
    }

    async fn object_size(&self, key: &str) -> StorageResult<u64> {
        let path = self.path_for(key)?;
        let meta = fs::metadata(&path).await.map_err(not_found(key))?;
        Ok(meta.len())
    }
}
