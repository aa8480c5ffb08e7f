//! Typed accessors over the settings tables.

use anyhow::{Context, Result};
use log::warn;

use super::repository::SettingsRepository;
use crate::cluster::ResourceRequirements;
use crate::error::{CoreError, CoreResult};
use crate::provisioner::{ResourceOverrides, effective_resources};

pub const KEY_SANDBOX_IMAGE: &str = "sandbox_image";
pub const KEY_AGENT_SYSTEM_INSTRUCTIONS: &str = "agent_system_instructions";
pub const KEY_SKILL_SYNC_INTERVAL: &str = "skill_sync_interval";
pub const KEY_SESSION_STALE_HOURS: &str = "session_stale_hours";
pub const KEY_STORAGE: &str = "storage";
pub const KEY_USER_RESOURCE_LIMITS: &str = "resource_limits";
pub const KEY_DEFAULT_CPU_REQUEST: &str = "default_cpu_request";
pub const KEY_DEFAULT_CPU_LIMIT: &str = "default_cpu_limit";
pub const KEY_DEFAULT_MEMORY_REQUEST: &str = "default_memory_request";
pub const KEY_DEFAULT_MEMORY_LIMIT: &str = "default_memory_limit";

/// Fallbacks used when a system setting is absent.
#[derive(Debug, Clone)]
pub struct SettingsDefaults {
    pub sandbox_image: String,
    pub skill_sync_interval: String,
    pub session_stale_hours: i64,
}

impl Default for SettingsDefaults {
    fn default() -> Self {
        Self {
            sandbox_image: "sandbox-agent:latest".to_string(),
            skill_sync_interval: "10m".to_string(),
            session_stale_hours: 24,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SettingsService {
    repo: SettingsRepository,
    defaults: SettingsDefaults,
}

impl SettingsService {
    pub fn new(repo: SettingsRepository, defaults: SettingsDefaults) -> Self {
        Self { repo, defaults }
    }

    pub fn repository(&self) -> &SettingsRepository {
        &self.repo
    }

    async fn string_or(&self, key: &str, fallback: &str) -> String {
        match self.repo.get_system_string(key).await {
            Ok(Some(v)) if !v.trim().is_empty() => v.trim().to_string(),
            Ok(_) => fallback.to_string(),
            Err(e) => {
                warn!("Failed to read setting {}: {:#}", key, e);
                fallback.to_string()
            }
        }
    }

    /// Image for new sandboxes.
    pub async fn sandbox_image(&self) -> String {
        self.string_or(KEY_SANDBOX_IMAGE, &self.defaults.sandbox_image)
            .await
    }

    /// Platform-wide preamble for the instructions file.
    pub async fn agent_system_instructions(&self) -> String {
        self.string_or(KEY_AGENT_SYSTEM_INSTRUCTIONS, "").await
    }

    pub async fn skill_sync_interval(&self) -> String {
        self.string_or(KEY_SKILL_SYNC_INTERVAL, &self.defaults.skill_sync_interval)
            .await
    }

    pub async fn session_stale_hours(&self) -> i64 {
        match self.repo.get_system::<serde_json::Value>(KEY_SESSION_STALE_HOURS).await {
            Ok(Some(v)) => v
                .as_i64()
                .or_else(|| v.as_str().and_then(|s| s.trim().parse().ok()))
                .filter(|h| *h > 0)
                .unwrap_or(self.defaults.session_stale_hours),
            Ok(None) => self.defaults.session_stale_hours,
            Err(e) => {
                warn!("Failed to read setting {}: {:#}", KEY_SESSION_STALE_HOURS, e);
                self.defaults.session_stale_hours
            }
        }
    }

    /// System-level resource defaults from the `default_*` keys.
    pub async fn system_resource_defaults(&self) -> Result<ResourceOverrides> {
        Ok(ResourceOverrides {
            cpu_request: self.repo.get_system_string(KEY_DEFAULT_CPU_REQUEST).await?,
            cpu_limit: self.repo.get_system_string(KEY_DEFAULT_CPU_LIMIT).await?,
            memory_request: self
                .repo
                .get_system_string(KEY_DEFAULT_MEMORY_REQUEST)
                .await?,
            memory_limit: self.repo.get_system_string(KEY_DEFAULT_MEMORY_LIMIT).await?,
        }
        .normalized())
    }

    pub async fn user_resource_limits(&self, user_id: i64) -> Result<ResourceOverrides> {
        Ok(self
            .repo
            .get_user::<ResourceOverrides>(user_id, KEY_USER_RESOURCE_LIMITS)
            .await?
            .unwrap_or_default()
            .normalized())
    }

    /// Resolve agent > user > system > built-in default.
    pub async fn effective_resources(
        &self,
        user_id: i64,
        agent: &ResourceOverrides,
    ) -> Result<ResourceRequirements> {
        let user = self
            .user_resource_limits(user_id)
            .await
            .context("Failed to load user resource limits")?;
        let system = self
            .system_resource_defaults()
            .await
            .context("Failed to load system resource defaults")?;
        Ok(effective_resources(agent, &user, &system))
    }

    /// Validate and store a user's resource limits.
    pub async fn set_user_resource_limits(
        &self,
        user_id: i64,
        limits: ResourceOverrides,
    ) -> CoreResult<()> {
        let limits = limits.normalized();
        limits
            .validate()
            .map_err(|e| CoreError::validation(e.to_string()))?;
        self.repo
            .set_user(user_id, KEY_USER_RESOURCE_LIMITS, &limits)
            .await?;
        Ok(())
    }

    /// Validate and store the system resource defaults. Unset fields are cleared.
    pub async fn set_system_resource_defaults(&self, defaults: ResourceOverrides) -> CoreResult<()> {
        let defaults = defaults.normalized();
        defaults
            .validate()
            .map_err(|e| CoreError::validation(e.to_string()))?;
        let fields = [
            (KEY_DEFAULT_CPU_REQUEST, &defaults.cpu_request),
            (KEY_DEFAULT_CPU_LIMIT, &defaults.cpu_limit),
            (KEY_DEFAULT_MEMORY_REQUEST, &defaults.memory_request),
            (KEY_DEFAULT_MEMORY_LIMIT, &defaults.memory_limit),
        ];
        for (key, value) in fields {
            match value {
                Some(v) => self.repo.set_system(key, v.as_str()).await?,
                None => self.repo.delete_system(key).await?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::provisioner::DEFAULT_MEMORY_REQUEST;

    async fn service() -> (SettingsService, Database) {
        let db = Database::in_memory().await.unwrap();
        let svc = SettingsService::new(
            SettingsRepository::new(db.pool().clone()),
            SettingsDefaults::default(),
        );
        (svc, db)
    }

    #[tokio::test]
    async fn defaults_apply_when_unset() {
        let (svc, _db) = service().await;
        assert_eq!(svc.sandbox_image().await, "sandbox-agent:latest");
        assert_eq!(svc.skill_sync_interval().await, "10m");
        assert_eq!(svc.session_stale_hours().await, 24);
        assert_eq!(svc.agent_system_instructions().await, "");
    }

    #[tokio::test]
    async fn stored_values_override_defaults() {
        let (svc, _db) = service().await;
        svc.repository()
            .set_system(KEY_SANDBOX_IMAGE, "registry/agent:9")
            .await
            .unwrap();
        svc.repository()
            .set_system(KEY_SESSION_STALE_HOURS, &6)
            .await
            .unwrap();
        assert_eq!(svc.sandbox_image().await, "registry/agent:9");
        assert_eq!(svc.session_stale_hours().await, 6);
    }

    #[tokio::test]
    async fn resource_chain_uses_user_and_system_levels() {
        let (svc, _db) = service().await;
        svc.set_system_resource_defaults(ResourceOverrides {
            cpu_limit: Some("8".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
        svc.set_user_resource_limits(
            5,
            ResourceOverrides {
                cpu_request: Some("3".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let agent = ResourceOverrides {
            memory_limit: Some("6Gi".to_string()),
            ..Default::default()
        };
        let res = svc.effective_resources(5, &agent).await.unwrap();
        assert_eq!(res.cpu_request, "3");
        assert_eq!(res.cpu_limit, "8");
        assert_eq!(res.memory_request, DEFAULT_MEMORY_REQUEST);
        assert_eq!(res.memory_limit, "6Gi");
    }

    #[tokio::test]
    async fn invalid_limits_are_rejected() {
        let (svc, _db) = service().await;
        let err = svc
            .set_user_resource_limits(
                5,
                ResourceOverrides {
                    cpu_request: Some("4".to_string()),
                    cpu_limit: Some("2".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
    }
}
