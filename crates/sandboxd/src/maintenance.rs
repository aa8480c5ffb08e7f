//! Periodic maintenance: skill resync, stale-session cleanup and orphaned
//! workspace-file cleanup. Runs in-process or as a scheduled cluster job.

use chrono::{Duration as ChronoDuration, SecondsFormat, Utc};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::error::{CoreError, CoreResult};
use crate::provisioner::{Provisioner, interval_to_cron};
use crate::session::{SessionEvent, SessionRepository};
use crate::settings::SettingsService;
use crate::skill::SkillSync;
use crate::storage::StorageProvider;
use crate::workspace::WorkspaceRepository;

/// Name of the maintenance cron job and prefix of one-off runs.
pub const MAINTENANCE_JOB: &str = "maintenance";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaintenanceConfig {
    /// Image containing the `sandboxd` binary.
    pub image: String,
    /// Environment passed to maintenance jobs.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            image: "sandboxd:latest".to_string(),
            env: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MaintenanceReport {
    pub skill_syncs: usize,
    pub skill_sync_failures: usize,
    pub stale_sessions: usize,
    pub orphaned_files: u64,
}

pub struct MaintenanceService {
    sessions: SessionRepository,
    skills: Arc<SkillSync>,
    files: WorkspaceRepository,
    storage: Arc<StorageProvider>,
    settings: SettingsService,
    provisioner: Arc<Provisioner>,
    config: MaintenanceConfig,
}

impl MaintenanceService {
    pub fn new(
        sessions: SessionRepository,
        skills: Arc<SkillSync>,
        files: WorkspaceRepository,
        storage: Arc<StorageProvider>,
        settings: SettingsService,
        provisioner: Arc<Provisioner>,
        config: MaintenanceConfig,
    ) -> Self {
        Self {
            sessions,
            skills,
            files,
            storage,
            settings,
            provisioner,
            config,
        }
    }

    /// Run every maintenance task. Each task is independent; failures are logged.
    pub async fn run_all(&self) -> MaintenanceReport {
        let mut report = MaintenanceReport::default();
        self.resync_skills(&mut report).await;
        report.stale_sessions = self.cleanup_stale_sessions().await;
        report.orphaned_files = self.cleanup_orphaned_files().await;
        info!(
            "Maintenance done: {} skill syncs ({} failed), {} stale sessions, {} orphaned files",
            report.skill_syncs,
            report.skill_sync_failures,
            report.stale_sessions,
            report.orphaned_files
        );
        report
    }

    async fn resync_skills(&self, report: &mut MaintenanceReport) {
        let sessions = match self.sessions.list_active().await {
            Ok(sessions) => sessions,
            Err(e) => {
                warn!("Failed to list active sessions: {:#}", e);
                return;
            }
        };
        let sandboxes: BTreeSet<(i64, i64)> =
            sessions.iter().map(|s| (s.user_id, s.agent_id)).collect();
        for (user_id, agent_id) in sandboxes {
            match self.skills.sync_all(user_id, agent_id).await {
                Ok(_) => report.skill_syncs += 1,
                Err(e) => {
                    warn!("Skill sync for user {} agent {} failed: {}", user_id, agent_id, e);
                    report.skill_sync_failures += 1;
                }
            }
        }
    }

    /// Soft-delete current sessions not updated within the stale window.
    pub async fn cleanup_stale_sessions(&self) -> usize {
        let hours = self.settings.session_stale_hours().await;
        let cutoff = (Utc::now() - ChronoDuration::hours(hours))
            .to_rfc3339_opts(SecondsFormat::Micros, true);
        let stale = match self.sessions.list_current_updated_before(&cutoff).await {
            Ok(stale) => stale,
            Err(e) => {
                warn!("Failed to list stale sessions: {:#}", e);
                return 0;
            }
        };

        let mut cleaned = 0;
        for session in stale {
            match self
                .sessions
                .apply(&session.id, session.status, SessionEvent::Delete, None)
                .await
            {
                Ok(Some(_)) => cleaned += 1,
                Ok(None) => {}
                Err(e) => warn!("Failed to clean up session {}: {:#}", session.id, e),
            }
        }
        if cleaned > 0 {
            info!("Cleaned up {} stale sessions older than {}h", cleaned, hours);
        }
        cleaned
    }

    /// Remove catalogued files of deleted agents from the store, then the catalog.
    pub async fn cleanup_orphaned_files(&self) -> u64 {
        let orphans = match self.files.orphaned_files().await {
            Ok(orphans) => orphans,
            Err(e) => {
                warn!("Failed to list orphaned files: {:#}", e);
                return 0;
            }
        };
        if orphans.is_empty() {
            return 0;
        }
        let store = match self.storage.client().await {
            Ok(store) => store,
            Err(e) => {
                warn!("Orphan cleanup skipped, object store unavailable: {}", e);
                return 0;
            }
        };

        let mut ids = Vec::with_capacity(orphans.len());
        for file in orphans {
            match store.delete(&file.object_key).await {
                Ok(()) => ids.push(file.id),
                Err(e) if e.is_not_found() => ids.push(file.id),
                Err(e) => warn!("Failed to delete orphaned object {}: {}", file.object_key, e),
            }
        }
        match self.files.purge_orphans(&ids).await {
            Ok(removed) => {
                info!("Removed {} orphaned workspace files", removed);
                removed
            }
            Err(e) => {
                warn!("Failed to purge orphaned catalog rows: {:#}", e);
                0
            }
        }
    }

    /// Upsert the maintenance cron job from the configured interval. Returns the schedule.
    pub async fn ensure_maintenance_schedule(&self) -> CoreResult<String> {
        let interval = self.settings.skill_sync_interval().await;
        let schedule = interval_to_cron(&interval);
        self.provisioner
            .ensure_cron_job(MAINTENANCE_JOB, &schedule, &self.config.image, &self.config.env)
            .await
            .map_err(|e| CoreError::internal_from("failed to schedule maintenance", e))?;
        info!("Maintenance scheduled every {} ({})", interval, schedule);
        Ok(schedule)
    }

    /// Start a maintenance run now. Returns the job name.
    pub async fn trigger_maintenance(&self) -> CoreResult<String> {
        self.provisioner
            .create_one_off_job(MAINTENANCE_JOB, &self.config.image, &self.config.env)
            .await
            .map_err(|e| CoreError::internal_from("failed to trigger maintenance", e))
    }
}
