//! Mirrors workspace namespaces between the object store and sandboxes.
//!
//! Everything here is best-effort: per-file failures are logged and counted,
//! never propagated.

use log::{debug, info, warn};
use std::collections::BTreeSet;
use std::sync::Arc;

use super::models::{
    COMMANDS_DIR, INSTRUCTIONS_PATH, MAX_SYNC_FILE_SIZE, OUTPUT_DIR, OUTPUT_SUBDIR, PRIVATE_DIR,
    PUBLIC_DIR, SHARED_DIR, SyncProgress, SyncReport, WorkspaceTarget,
};
use super::repository::WorkspaceRepository;
use crate::agent::AgentRepository;
use crate::provisioner::{Naming, SandboxKey};
use crate::sandbox_fs::{SandboxFs, parent_dir};
use crate::session::SessionRepository;
use crate::settings::SettingsService;
use crate::storage::{ObjectStore, StorageError, StorageProvider};

/// Separator between the sections of the instructions file.
pub const INSTRUCTIONS_SEPARATOR: &str = "\n\n---\n\n";

/// Join the non-empty instruction sections: system, then groups, then agent.
pub fn compose_instructions(system: &str, groups: &[String], agent: &str) -> Option<String> {
    let parts: Vec<&str> = std::iter::once(system)
        .chain(groups.iter().map(String::as_str))
        .chain(std::iter::once(agent))
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect();
    (!parts.is_empty()).then(|| parts.join(INSTRUCTIONS_SEPARATOR))
}

struct PlannedFile {
    key: String,
    rel_path: String,
    dest: String,
}

pub struct WorkspaceSync {
    storage: Arc<StorageProvider>,
    fs: Arc<dyn SandboxFs>,
    naming: Naming,
    sessions: SessionRepository,
    agents: AgentRepository,
    files: WorkspaceRepository,
    settings: SettingsService,
}

impl WorkspaceSync {
    pub fn new(
        storage: Arc<StorageProvider>,
        fs: Arc<dyn SandboxFs>,
        naming: Naming,
        sessions: SessionRepository,
        agents: AgentRepository,
        files: WorkspaceRepository,
        settings: SettingsService,
    ) -> Self {
        Self {
            storage,
            fs,
            naming,
            sessions,
            agents,
            files,
            settings,
        }
    }

    async fn store(&self) -> Option<Arc<dyn ObjectStore>> {
        match self.storage.client().await {
            Ok(store) => Some(store),
            Err(e) => {
                warn!("Workspace sync skipped, object store unavailable: {}", e);
                None
            }
        }
    }

    async fn user_groups(&self, user_id: i64) -> Vec<i64> {
        self.agents
            .user_group_ids(user_id)
            .await
            .unwrap_or_else(|e| {
                warn!("Failed to load groups of user {}: {:#}", user_id, e);
                Vec::new()
            })
    }

    /// Mirror every inbound namespace into the sandbox.
    pub async fn full_sync(&self, user_id: i64, agent_id: i64) -> SyncReport {
        self.full_sync_with_progress(user_id, agent_id, |_| {}).await
    }

    /// Like [`WorkspaceSync::full_sync`], calling `on_progress` after each file.
    pub async fn full_sync_with_progress(
        &self,
        user_id: i64,
        agent_id: i64,
        mut on_progress: impl FnMut(SyncProgress) + Send,
    ) -> SyncReport {
        let mut report = SyncReport::default();
        let Some(store) = self.store().await else {
            return report;
        };
        let pod = self.naming.pod(SandboxKey::new(user_id, agent_id));
        let groups = self.user_groups(user_id).await;

        let mut targets = vec![
            WorkspaceTarget::Private { user_id, agent_id },
            WorkspaceTarget::Public,
            WorkspaceTarget::Shared,
        ];
        targets.extend(groups.iter().map(|&group_id| WorkspaceTarget::Group { group_id }));

        let mut dirs: Vec<String> = [PRIVATE_DIR, COMMANDS_DIR, PUBLIC_DIR, SHARED_DIR, OUTPUT_DIR]
            .iter()
            .map(|d| d.to_string())
            .collect();
        dirs.extend(
            groups
                .iter()
                .map(|&group_id| WorkspaceTarget::Group { group_id }.sandbox_dir()),
        );
        if let Err(e) = self.fs.mkdir_all(&pod, &dirs).await {
            warn!("Failed to create workspace directories in {}: {}", pod, e);
        }

        let mut plan = Vec::new();
        for target in &targets {
            let prefix = target.object_prefix();
            let objects = match store.list_all(&prefix).await {
                Ok(objects) => objects,
                Err(e) => {
                    warn!("Failed to list {}: {}", prefix, e);
                    continue;
                }
            };
            for obj in objects {
                if obj.is_directory || obj.key.ends_with('/') {
                    continue;
                }
                let Some(rel_path) = obj.key.strip_prefix(&prefix).filter(|r| !r.is_empty())
                else {
                    continue;
                };
                // Output files flow the other way
                if matches!(target, WorkspaceTarget::Private { .. })
                    && rel_path.starts_with(OUTPUT_SUBDIR)
                {
                    continue;
                }
                if obj.size > MAX_SYNC_FILE_SIZE {
                    debug!("Skipping large file {} ({} bytes)", obj.key, obj.size);
                    report.skipped += 1;
                    continue;
                }
                plan.push(PlannedFile {
                    dest: target.sandbox_path(rel_path),
                    rel_path: rel_path.to_string(),
                    key: obj.key,
                });
            }
        }

        report.total = plan.len() + report.skipped;
        for file in plan {
            let written = match store.download(&file.key).await {
                Ok(data) => self.fs.write(&pod, &file.dest, &data).await.map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            };
            match written {
                Ok(()) => report.synced += 1,
                Err(e) => {
                    warn!("Failed to sync {} to {}: {}", file.key, pod, e);
                    report.failed += 1;
                }
            }
            on_progress(SyncProgress {
                synced: report.synced,
                total: report.total,
                current_file: file.rel_path,
            });
        }

        for dir in [PUBLIC_DIR, SHARED_DIR] {
            if let Err(e) = self.fs.make_read_only(&pod, dir).await {
                warn!("Failed to make {} read-only in {}: {}", dir, pod, e);
            }
        }

        info!(
            "Workspace sync for user {} agent {}: {} synced, {} skipped, {} failed",
            user_id, agent_id, report.synced, report.skipped, report.failed
        );
        report
    }

    /// Pods of active sessions that mount `target`.
    pub async fn active_pods(&self, target: &WorkspaceTarget) -> Vec<String> {
        let sessions = match self.sessions.list_active().await {
            Ok(sessions) => sessions,
            Err(e) => {
                warn!("Failed to list active sessions: {:#}", e);
                return Vec::new();
            }
        };

        let members: Option<Vec<i64>> = match *target {
            WorkspaceTarget::Group { group_id } => {
                Some(self.agents.group_member_ids(group_id).await.unwrap_or_else(|e| {
                    warn!("Failed to list members of group {}: {:#}", group_id, e);
                    Vec::new()
                }))
            }
            _ => None,
        };

        let pods: BTreeSet<String> = sessions
            .into_iter()
            .filter(|s| match *target {
                WorkspaceTarget::Private { user_id, agent_id }
                | WorkspaceTarget::Output { user_id, agent_id } => {
                    s.user_id == user_id && s.agent_id == agent_id
                }
                WorkspaceTarget::Group { .. } => members
                    .as_ref()
                    .is_some_and(|m| m.contains(&s.user_id)),
                WorkspaceTarget::Public | WorkspaceTarget::Shared => true,
            })
            .map(|s| s.pod_name)
            .filter(|p| !p.is_empty())
            .collect();
        pods.into_iter().collect()
    }

    /// Copy one stored file into every active sandbox that mounts its workspace.
    /// Returns the number of sandboxes written.
    pub async fn push_file(&self, target: &WorkspaceTarget, rel_path: &str) -> usize {
        let pods = self.active_pods(target).await;
        if pods.is_empty() {
            return 0;
        }
        let Some(store) = self.store().await else {
            return 0;
        };
        let key = target.object_key(rel_path);
        let data = match store.download(&key).await {
            Ok(data) => data,
            Err(e) => {
                warn!("Failed to download {} for push: {}", key, e);
                return 0;
            }
        };

        let dest = target.sandbox_path(rel_path);
        let mut written = 0;
        for pod in &pods {
            if let Err(e) = self.fs.write(pod, &dest, &data).await {
                warn!("Failed to push {} to {}: {}", dest, pod, e);
                continue;
            }
            if target.read_only()
                && let Err(e) = self.fs.publish_read_only(pod, parent_dir(&dest), &dest).await
            {
                warn!("Failed to make {} read-only in {}: {}", dest, pod, e);
            }
            debug!("Pushed {} to {}", dest, pod);
            written += 1;
        }
        written
    }

    /// Remove a file or directory from every active sandbox that mounts its workspace.
    pub async fn delete_file(&self, target: &WorkspaceTarget, rel_path: &str) -> usize {
        let dest = target.sandbox_path(rel_path.trim_end_matches('/'));
        let mut removed = 0;
        for pod in self.active_pods(target).await {
            match self.fs.delete(&pod, &dest).await {
                Ok(()) => removed += 1,
                Err(e) => warn!("Failed to delete {} from {}: {}", dest, pod, e),
            }
        }
        removed
    }

    /// Bring the active sandboxes in line with the store for one path: push it
    /// when the object exists, remove it otherwise. A directory path (trailing
    /// `/`) is removed and whatever the store still holds under it is pushed again.
    pub async fn mirror_path(&self, target: &WorkspaceTarget, rel_path: &str) {
        let Some(store) = self.store().await else {
            return;
        };
        if !rel_path.ends_with('/') {
            let key = target.object_key(rel_path);
            match store.object_size(&key).await {
                Ok(_) => {
                    self.push_file(target, rel_path).await;
                }
                Err(StorageError::NotFound(_)) => {
                    self.delete_file(target, rel_path).await;
                }
                Err(e) => warn!("Failed to check {} before mirroring: {}", key, e),
            }
            return;
        }

        self.delete_file(target, rel_path).await;
        let prefix = target.object_key(rel_path);
        let base = target.object_prefix();
        let objects = match store.list_all(&prefix).await {
            Ok(objects) => objects,
            Err(e) => {
                warn!("Failed to list {}: {}", prefix, e);
                return;
            }
        };
        for obj in objects {
            if obj.is_directory || obj.key.ends_with('/') {
                continue;
            }
            let Some(rel) = obj.key.strip_prefix(&base) else {
                continue;
            };
            if matches!(target, WorkspaceTarget::Private { .. }) && rel.starts_with(OUTPUT_SUBDIR) {
                continue;
            }
            self.push_file(target, rel).await;
        }
    }

    /// Rewrite every catalogued output file into the sandbox.
    pub async fn restore_output_files(&self, user_id: i64, agent_id: i64) -> SyncReport {
        let mut report = SyncReport::default();
        let files = match self.files.output_files(user_id, agent_id).await {
            Ok(files) => files,
            Err(e) => {
                warn!("Failed to load output catalog: {:#}", e);
                return report;
            }
        };
        if files.is_empty() {
            return report;
        }
        let Some(store) = self.store().await else {
            return report;
        };

        let pod = self.naming.pod(SandboxKey::new(user_id, agent_id));
        report.total = files.len();
        for file in files {
            let dest = format!("{}/{}", OUTPUT_DIR, file.file_path);
            let restored = match store.download(&file.object_key).await {
                Ok(data) => self.fs.write(&pod, &dest, &data).await.map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            };
            match restored {
                Ok(()) => report.synced += 1,
                Err(e) => {
                    warn!("Skipping output file {}: {}", file.object_key, e);
                    report.failed += 1;
                }
            }
        }
        info!(
            "Restored {}/{} output files for user {} agent {}",
            report.synced, report.total, user_id, agent_id
        );
        report
    }

    /// Write the instructions file. Returns false when there was nothing to write
    /// or the write failed.
    pub async fn write_instructions(
        &self,
        user_id: i64,
        agent_id: i64,
        agent_instructions: &str,
    ) -> bool {
        let system = self.settings.agent_system_instructions().await;
        let groups = self
            .agents
            .user_group_templates(user_id)
            .await
            .unwrap_or_else(|e| {
                warn!("Failed to load group templates of user {}: {:#}", user_id, e);
                Vec::new()
            });
        let Some(content) = compose_instructions(&system, &groups, agent_instructions) else {
            return false;
        };

        let pod = self.naming.pod(SandboxKey::new(user_id, agent_id));
        match self.fs.write(&pod, INSTRUCTIONS_PATH, content.as_bytes()).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to write instructions file to {}: {}", pod, e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instructions_join_non_empty_parts_in_order() {
        let groups = vec!["Alpha".to_string(), " ".to_string()];
        assert_eq!(
            compose_instructions("System", &groups, "Agent").as_deref(),
            Some("System\n\n---\n\nAlpha\n\n---\n\nAgent")
        );
        assert_eq!(
            compose_instructions("", &[], "Agent only").as_deref(),
            Some("Agent only")
        );
        assert_eq!(compose_instructions(" ", &[], ""), None);
    }
}
