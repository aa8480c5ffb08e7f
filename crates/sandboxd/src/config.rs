//! Application configuration, layered from defaults, a TOML file and
//! `SANDBOXD__SECTION__KEY` environment variables.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::maintenance::MaintenanceConfig;
use crate::pool::PoolConfig;
use crate::provisioner::ProvisionerConfig;
use crate::session::SessionServiceConfig;
use crate::settings::SettingsDefaults;
use crate::storage::StorageBackendConfig;
use crate::workspace::{DEFAULT_MAX_BYTES, DEFAULT_MAX_FILE_COUNT, QuotaDefaults};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub logging: LoggingConfig,
    pub database: DatabaseConfig,
    pub cluster: ClusterConfig,
    pub sandbox: SandboxConfig,
    pub storage: StorageConfig,
    pub workspace: WorkspaceConfig,
    pub pool: PoolSettings,
    pub maintenance: MaintenanceSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite file. Defaults to `sandboxd.db` in the data directory.
    pub path: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterBackend {
    #[default]
    Kubectl,
    /// In-process cluster for local development.
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub backend: ClusterBackend,
    pub namespace: String,
    pub kubectl: String,
    pub kubeconfig: Option<String>,
    pub context: Option<String>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            backend: ClusterBackend::Kubectl,
            namespace: "sandboxes".to_string(),
            kubectl: "kubectl".to_string(),
            kubeconfig: None,
            context: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub name_prefix: String,
    pub image: String,
    pub sidecar_image: Option<String>,
    pub api_url: Option<String>,
    pub workspace_storage: String,
    pub storage_class: Option<String>,
    pub agent_process_pattern: String,
    pub ready_attempts: u32,
    pub ready_interval_secs: u64,
    pub session_stale_hours: i64,
    /// Probe the terminal port over HTTP before reusing a sandbox.
    pub http_probe: bool,
    pub probe_timeout_secs: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        let provisioner = ProvisionerConfig::default();
        let session = SessionServiceConfig::default();
        Self {
            name_prefix: provisioner.name_prefix,
            image: provisioner.image,
            sidecar_image: provisioner.sidecar_image,
            api_url: provisioner.api_url,
            workspace_storage: provisioner.workspace_storage,
            storage_class: provisioner.storage_class,
            agent_process_pattern: provisioner.agent_process_pattern,
            ready_attempts: session.ready_attempts,
            ready_interval_secs: session.ready_interval.as_secs(),
            session_stale_hours: SettingsDefaults::default().session_stale_hours,
            http_probe: false,
            probe_timeout_secs: 3,
        }
    }
}

impl SandboxConfig {
    pub fn provisioner(&self) -> ProvisionerConfig {
        ProvisionerConfig {
            name_prefix: self.name_prefix.clone(),
            image: self.image.clone(),
            sidecar_image: self.sidecar_image.clone(),
            api_url: self.api_url.clone(),
            workspace_storage: self.workspace_storage.clone(),
            storage_class: self.storage_class.clone(),
            agent_process_pattern: self.agent_process_pattern.clone(),
        }
    }

    pub fn session(&self) -> SessionServiceConfig {
        SessionServiceConfig {
            ready_attempts: self.ready_attempts,
            ready_interval: Duration::from_secs(self.ready_interval_secs),
            creating_timeout: Duration::from_secs(
                u64::from(self.ready_attempts) * self.ready_interval_secs + 60,
            ),
        }
    }
}

/// Fallback storage backend when the `storage` system setting is absent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory for the local backend. Defaults to `objects` in the data directory.
    pub root: Option<String>,
    pub signing_key: String,
    pub base_url: String,
}

impl StorageConfig {
    pub fn backend(&self, default_root: &str) -> StorageBackendConfig {
        StorageBackendConfig::Local {
            root: self.root.clone().unwrap_or_else(|| default_root.to_string()),
            signing_key: self.signing_key.clone(),
            base_url: self.base_url.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    pub max_bytes: i64,
    pub max_file_count: i64,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            max_bytes: DEFAULT_MAX_BYTES,
            max_file_count: DEFAULT_MAX_FILE_COUNT,
        }
    }
}

impl WorkspaceConfig {
    pub fn quota_defaults(&self) -> QuotaDefaults {
        QuotaDefaults {
            max_bytes: self.max_bytes,
            max_file_count: self.max_file_count,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    pub max_concurrency: usize,
    pub max_pending: usize,
    /// Seconds to wait for queued work on shutdown.
    pub drain_timeout_secs: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        let pool = PoolConfig::default();
        Self {
            max_concurrency: pool.max_concurrency,
            max_pending: pool.max_pending,
            drain_timeout_secs: 30,
        }
    }
}

impl PoolSettings {
    pub fn pool(&self) -> PoolConfig {
        PoolConfig {
            max_concurrency: self.max_concurrency.max(1),
            max_pending: self.max_pending.max(1),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceSettings {
    /// Go-style duration between scheduled runs, unless the setting overrides it.
    pub interval: String,
    /// Image containing the `sandboxd` binary, used for maintenance jobs.
    pub image: String,
    pub env: BTreeMap<String, String>,
}

impl Default for MaintenanceSettings {
    fn default() -> Self {
        let job = MaintenanceConfig::default();
        Self {
            interval: SettingsDefaults::default().skill_sync_interval,
            image: job.image,
            env: job.env,
        }
    }
}

impl MaintenanceSettings {
    pub fn job(&self) -> MaintenanceConfig {
        MaintenanceConfig {
            image: self.image.clone(),
            env: self.env.clone(),
        }
    }
}

impl AppConfig {
    pub fn settings_defaults(&self) -> SettingsDefaults {
        SettingsDefaults {
            sandbox_image: self.sandbox.image.clone(),
            skill_sync_interval: self.maintenance.interval.clone(),
            session_stale_hours: self.sandbox.session_stale_hours,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_round_trip_through_toml() {
        let config = AppConfig::default();
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: AppConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.sandbox.name_prefix, "sandbox");
        assert_eq!(parsed.sandbox.ready_attempts, 60);
        assert_eq!(parsed.maintenance.interval, "10m");
        assert_eq!(parsed.cluster.backend, ClusterBackend::Kubectl);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let parsed: AppConfig = toml::from_str(
            r#"
            [cluster]
            backend = "memory"

            [pool]
            max_concurrency = 0
            "#,
        )
        .unwrap();
        assert_eq!(parsed.cluster.backend, ClusterBackend::Memory);
        assert_eq!(parsed.cluster.namespace, "sandboxes");
        assert_eq!(parsed.pool.pool().max_concurrency, 1);
        assert_eq!(parsed.workspace.max_file_count, DEFAULT_MAX_FILE_COUNT);
    }
}
