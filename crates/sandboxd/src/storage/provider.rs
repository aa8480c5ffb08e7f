//! Settings-driven object store construction with client caching.

use log::{info, warn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tokio::sync::Mutex;

use super::{LocalObjectStore, ObjectStore, StorageError, StorageResult};
use crate::settings::{KEY_STORAGE, SettingsRepository};

/// Backend selection, stored as JSON in the `storage` system setting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageBackendConfig {
    Local {
        root: String,
        #[serde(default)]
        signing_key: String,
        #[serde(default)]
        base_url: String,
    },
}

impl StorageBackendConfig {
    /// SHA-256 of the serialized config.
    pub fn fingerprint(&self) -> StorageResult<String> {
        let encoded =
            serde_json::to_vec(self).map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(hex::encode(Sha256::digest(&encoded)))
    }

    pub fn build(&self) -> StorageResult<Arc<dyn ObjectStore>> {
        match self {
            Self::Local {
                root,
                signing_key,
                base_url,
            } => {
                if root.trim().is_empty() {
                    return Err(StorageError::NotConfigured("local root is empty".into()));
                }
                let mut store = LocalObjectStore::new(root);
                if !base_url.is_empty() {
                    store = store.with_signing(signing_key.clone(), base_url.clone());
                }
                Ok(Arc::new(store))
            }
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Local { .. } => "local",
        }
    }
}

struct CachedBackend {
    fingerprint: String,
    store: Arc<dyn ObjectStore>,
}

/// Hands out the current object store, rebuilding it only when its config changes.
pub struct StorageProvider {
    settings: SettingsRepository,
    fallback: StorageBackendConfig,
    cache: Mutex<Option<CachedBackend>>,
}

impl StorageProvider {
    pub fn new(settings: SettingsRepository, fallback: StorageBackendConfig) -> Self {
        Self {
            settings,
            fallback,
            cache: Mutex::new(None),
        }
    }

    async fn current_config(&self) -> Option<StorageBackendConfig> {
        match self.settings.get_system::<StorageBackendConfig>(KEY_STORAGE).await {
            Ok(Some(config)) => Some(config),
            Ok(None) => Some(self.fallback.clone()),
            Err(e) => {
                warn!("Failed to read storage config from settings: {:#}", e);
                None
            }
        }
    }

    /// The object store for the current configuration.
    ///
    /// If the settings cannot be read, the cached client is reused when there is one.
    pub async fn client(&self) -> StorageResult<Arc<dyn ObjectStore>> {
        let mut cache = self.cache.lock().await;

        let config = match self.current_config().await {
            Some(config) => config,
            None => match cache.as_ref() {
                Some(cached) => return Ok(cached.store.clone()),
                None => self.fallback.clone(),
            },
        };

        let fingerprint = config.fingerprint()?;
        if let Some(cached) = cache.as_ref()
            && cached.fingerprint == fingerprint
        {
            return Ok(cached.store.clone());
        }

        let store = config.build()?;
        info!("Storage backend ({}) created from configuration", config.kind());
        *cache = Some(CachedBackend {
            fingerprint,
            store: store.clone(),
        });
        Ok(store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use tempfile::TempDir;

    fn local(root: &std::path::Path) -> StorageBackendConfig {
        StorageBackendConfig::Local {
            root: root.display().to_string(),
            signing_key: String::new(),
            base_url: String::new(),
        }
    }

    #[tokio::test]
    async fn rebuilds_only_on_fingerprint_change() {
        let db = Database::in_memory().await.unwrap();
        let settings = SettingsRepository::new(db.pool().clone());
        let first = TempDir::new().unwrap();
        let second = TempDir::new().unwrap();
        let provider = StorageProvider::new(settings.clone(), local(first.path()));

        let a = provider.client().await.unwrap();
        let b = provider.client().await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        settings.set_system(KEY_STORAGE, &local(second.path())).await.unwrap();
        let c = provider.client().await.unwrap();
        assert!(!Arc::ptr_eq(&b, &c));

        c.upload("x.txt", b"x", "text/plain").await.unwrap();
        assert!(second.path().join("x.txt").exists());

        let d = provider.client().await.unwrap();
        assert!(Arc::ptr_eq(&c, &d));
    }

    #[test]
    fn config_deserializes_from_tagged_json() {
        let config: StorageBackendConfig =
            serde_json::from_str(r#"{"type":"local","root":"/var/lib/sandboxd/objects"}"#).unwrap();
        assert_eq!(config.kind(), "local");
        assert_eq!(config.fingerprint().unwrap().len(), 64);
    }
}
