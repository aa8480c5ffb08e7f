//! Projects installed skills into a sandbox's command directory.

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;

use super::naming::command_file;
use crate::agent::{AgentRepository, Skill};
use crate::error::{CoreError, CoreResult};
use crate::provisioner::{Naming, SandboxKey};
use crate::pubsub::{Hub, sandbox_topic};
use crate::sandbox_fs::SandboxFs;
use crate::workspace::{COMMANDS_DIR, COMMANDS_SUBDIR, WorkspaceRepository, WorkspaceTarget};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncAction {
    Progress,
    Complete,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStep {
    SyncingSkill,
    UpToDate,
    CleaningStale,
    /// Agent process killed so it reloads its commands.
    RestartingProcess,
    Done,
}

fn is_zero(n: &usize) -> bool {
    *n == 0
}

/// Progress update published while a sandbox's skills are reconciled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkillSyncEvent {
    /// Always "skill_sync".
    #[serde(rename = "type")]
    pub event_type: String,
    pub action: SyncAction,
    #[serde(default)]
    pub skill_id: i64,
    #[serde(default)]
    pub skill_name: String,
    #[serde(default)]
    pub command_name: String,
    pub agent_id: i64,
    pub step: SyncStep,
    pub message: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub current: usize,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub total: usize,
}

impl SkillSyncEvent {
    pub(super) fn new(
        action: SyncAction,
        agent_id: i64,
        step: SyncStep,
        message: impl Into<String>,
    ) -> Self {
        Self {
            event_type: "skill_sync".to_string(),
            action,
            skill_id: 0,
            skill_name: String::new(),
            command_name: String::new(),
            agent_id,
            step,
            message: message.into(),
            current: 0,
            total: 0,
        }
    }

    pub(super) fn for_skill(mut self, skill: &Skill, current: usize, total: usize) -> Self {
        self.skill_id = skill.id;
        self.skill_name = skill.name.clone();
        self.command_name = skill.command_name.clone();
        self.current = current;
        self.total = total;
        self
    }
}

/// Outcome of a full reconciliation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SkillSyncReport {
    pub synced: usize,
    pub up_to_date: usize,
    pub revoked: usize,
    pub removed: usize,
    pub failed: usize,
}

pub struct SkillSync {
    fs: Arc<dyn SandboxFs>,
    naming: Naming,
    agents: AgentRepository,
    files: WorkspaceRepository,
    hub: Arc<Hub<SkillSyncEvent>>,
}

impl SkillSync {
    pub fn new(
        fs: Arc<dyn SandboxFs>,
        naming: Naming,
        agents: AgentRepository,
        files: WorkspaceRepository,
        hub: Arc<Hub<SkillSyncEvent>>,
    ) -> Self {
        Self {
            fs,
            naming,
            agents,
            files,
            hub,
        }
    }

    /// Command files the user uploaded to their private workspace. `None` when
    /// the catalog cannot be read.
    async fn uploaded_commands(&self, user_id: i64, agent_id: i64) -> Option<BTreeSet<String>> {
        let prefix = format!(
            "{}{}",
            WorkspaceTarget::Private { user_id, agent_id }.object_prefix(),
            COMMANDS_SUBDIR
        );
        match self.files.file_keys_under(&prefix).await {
            Ok(keys) => Some(
                keys.iter()
                    .filter_map(|k| k.strip_prefix(&prefix))
                    .filter(|name| !name.contains('/'))
                    .map(str::to_string)
                    .collect(),
            ),
            Err(e) => {
                warn!("Failed to read uploaded commands of agent {}: {:#}", agent_id, e);
                None
            }
        }
    }

    pub fn hub(&self) -> &Arc<Hub<SkillSyncEvent>> {
        &self.hub
    }

    pub(super) fn publish(&self, user_id: i64, agent_id: i64, event: SkillSyncEvent) {
        self.hub
            .publish(&sandbox_topic("skills", user_id, agent_id), event);
    }

    fn pod(&self, user_id: i64, agent_id: i64) -> String {
        self.naming.pod(SandboxKey::new(user_id, agent_id))
    }

    /// Write one skill's command file and record the synced version.
    pub async fn sync_one(&self, user_id: i64, agent_id: i64, skill: &Skill) -> CoreResult<()> {
        if skill.command_name.trim().is_empty() {
            return Err(CoreError::validation(format!(
                "skill {} has no command name",
                skill.id
            )));
        }
        let pod = self.pod(user_id, agent_id);
        let path = format!("{}/{}", COMMANDS_DIR, command_file(&skill.command_name));
        self.fs
            .write(&pod, &path, skill.prompt.as_bytes())
            .await
            .map_err(|e| CoreError::internal_from("failed to write command file", e))?;
        self.agents
            .set_synced_version(agent_id, skill.id, skill.version)
            .await?;
        debug!("Synced skill {} to {}", skill.command_name, pod);
        Ok(())
    }

    /// Delete a command file. A missing file is not an error.
    pub async fn remove_one(&self, user_id: i64, agent_id: i64, command_name: &str) -> CoreResult<()> {
        if command_name.trim().is_empty() {
            return Ok(());
        }
        let pod = self.pod(user_id, agent_id);
        let path = format!("{}/{}", COMMANDS_DIR, command_file(command_name));
        self.fs
            .delete(&pod, &path)
            .await
            .map_err(|e| CoreError::internal_from("failed to remove command file", e))?;
        info!("Removed skill {} from {}", command_name, pod);
        Ok(())
    }

    /// Reconcile the command directory with the agent's installed skills.
    ///
    /// Skills the user can no longer see are uninstalled, outdated or missing
    /// files are rewritten, and command files with no installed skill are deleted.
    pub async fn sync_all(&self, user_id: i64, agent_id: i64) -> CoreResult<SkillSyncReport> {
        let installed = match self.agents.installed_skills(agent_id).await {
            Ok(installed) => installed,
            Err(e) => {
                self.publish(
                    user_id,
                    agent_id,
                    SkillSyncEvent::new(
                        SyncAction::Error,
                        agent_id,
                        SyncStep::Done,
                        "Failed to load installed skills",
                    ),
                );
                return Err(CoreError::internal_from("failed to load installed skills", format!("{e:#}")));
            }
        };
        let pod = self.pod(user_id, agent_id);
        let mut report = SkillSyncReport::default();

        let groups = self.agents.user_group_ids(user_id).await.unwrap_or_else(|e| {
            warn!("Failed to load groups of user {}: {:#}", user_id, e);
            Vec::new()
        });
        let mut visible = Vec::with_capacity(installed.len());
        for entry in installed {
            if entry.skill.visible_to(user_id, &groups) {
                visible.push(entry);
                continue;
            }
            match self.agents.uninstall_skill(agent_id, entry.skill.id).await {
                Ok(_) => {
                    report.revoked += 1;
                    info!(
                        "Revoked inaccessible skill {} ({}) from {}",
                        entry.skill.id, entry.skill.command_name, pod
                    );
                }
                Err(e) => warn!("Failed to revoke skill {}: {:#}", entry.skill.id, e),
            }
        }

        // A missing or unreadable directory forces every file to be rewritten
        let present: BTreeSet<String> = match self.fs.list(&pod, COMMANDS_DIR).await {
            Ok(names) => names.into_iter().collect(),
            Err(e) => {
                warn!("Failed to list {} in {}: {}", COMMANDS_DIR, pod, e);
                BTreeSet::new()
            }
        };

        let expected: BTreeSet<String> = visible
            .iter()
            .filter(|s| !s.skill.command_name.trim().is_empty())
            .map(|s| command_file(&s.skill.command_name))
            .collect();

        let total = visible.len();
        for (index, entry) in visible.iter().enumerate() {
            let skill = &entry.skill;
            if skill.command_name.trim().is_empty() {
                continue;
            }
            if entry.is_current() && present.contains(&command_file(&skill.command_name)) {
                report.up_to_date += 1;
                continue;
            }
            self.publish(
                user_id,
                agent_id,
                SkillSyncEvent::new(
                    SyncAction::Progress,
                    agent_id,
                    SyncStep::SyncingSkill,
                    format!("Syncing {}", skill.name),
                )
                .for_skill(skill, index + 1, total),
            );
            match self.sync_one(user_id, agent_id, skill).await {
                Ok(()) => report.synced += 1,
                Err(e) => {
                    warn!("Failed to sync skill {} to {}: {}", skill.command_name, pod, e);
                    report.failed += 1;
                    self.publish(
                        user_id,
                        agent_id,
                        SkillSyncEvent::new(
                            SyncAction::Error,
                            agent_id,
                            SyncStep::SyncingSkill,
                            e.to_string(),
                        )
                        .for_skill(skill, index + 1, total),
                    );
                }
            }
        }

        if report.up_to_date > 0 {
            self.publish(
                user_id,
                agent_id,
                SkillSyncEvent::new(
                    SyncAction::Progress,
                    agent_id,
                    SyncStep::UpToDate,
                    format!("{} skills up to date, skipping", report.up_to_date),
                ),
            );
        }

        self.publish(
            user_id,
            agent_id,
            SkillSyncEvent::new(
                SyncAction::Progress,
                agent_id,
                SyncStep::CleaningStale,
                "Cleaning up stale skills...",
            ),
        );
        // Uploaded command files are left alone; an unreadable catalog skips cleanup
        let uploaded = self.uploaded_commands(user_id, agent_id).await;
        let stale: Vec<&String> = match &uploaded {
            Some(uploaded) => present
                .iter()
                .filter(|n| n.ends_with(".md") && !expected.contains(*n) && !uploaded.contains(*n))
                .collect(),
            None => Vec::new(),
        };
        for name in stale {
            let path = format!("{COMMANDS_DIR}/{name}");
            match self.fs.delete(&pod, &path).await {
                Ok(()) => {
                    report.removed += 1;
                    debug!("Removed stale command file {} from {}", name, pod);
                }
                Err(e) => warn!("Failed to remove stale command file {} from {}: {}", name, pod, e),
            }
        }

        self.publish(
            user_id,
            agent_id,
            SkillSyncEvent::new(
                SyncAction::Complete,
                agent_id,
                SyncStep::Done,
                format!(
                    "Sync complete: {} synced, {} up to date",
                    report.synced, report.up_to_date
                ),
            ),
        );
        info!(
            "Skill sync for {}: {} synced, {} up to date, {} revoked, {} removed, {} failed",
            pod, report.synced, report.up_to_date, report.revoked, report.removed, report.failed
        );
        Ok(report)
    }
}
