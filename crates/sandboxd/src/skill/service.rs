use log::{info, warn};
use std::sync::Arc;

use super::naming::{fork_command_candidates, fork_name, sanitize_command_name};
use super::sync::{SkillSync, SkillSyncEvent, SyncAction, SyncStep};
use crate::agent::{Agent, AgentRepository, NewSkill, Skill};
use crate::error::{CoreError, CoreResult};
use crate::provisioner::{Provisioner, SandboxKey};

/// Skill installation and forking.
///
/// Installing or uninstalling touches the sandbox right away and restarts the
/// agent process so it picks up the command change. Progress goes out on the
/// same channel as full reconciliations.
pub struct SkillService {
    agents: AgentRepository,
    sync: Arc<SkillSync>,
    provisioner: Arc<Provisioner>,
}

impl SkillService {
    pub fn new(agents: AgentRepository, sync: Arc<SkillSync>, provisioner: Arc<Provisioner>) -> Self {
        Self {
            agents,
            sync,
            provisioner,
        }
    }

    pub fn sync(&self) -> &Arc<SkillSync> {
        &self.sync
    }

    async fn owned_agent(&self, user_id: i64, agent_id: i64) -> CoreResult<Agent> {
        if agent_id <= 0 {
            return Err(CoreError::validation("agent_id is required"));
        }
        match self.agents.get_agent(agent_id).await? {
            Some(agent) if agent.created_by == user_id => Ok(agent),
            _ => Err(CoreError::not_found(format!("agent {agent_id}"))),
        }
    }

    async fn visible_skill(&self, user_id: i64, skill_id: i64) -> CoreResult<Skill> {
        let groups = self.agents.user_group_ids(user_id).await?;
        match self.agents.get_skill(skill_id).await? {
            Some(skill) if skill.visible_to(user_id, &groups) => Ok(skill),
            _ => Err(CoreError::not_found(format!("skill {skill_id}"))),
        }
    }

    /// Install a skill and write its command file. Returns false if it was already installed.
    pub async fn install(&self, user_id: i64, agent_id: i64, skill_id: i64) -> CoreResult<bool> {
        self.owned_agent(user_id, agent_id).await?;
        let skill = self.visible_skill(user_id, skill_id).await?;
        if skill.command_name.trim().is_empty() {
            return Err(CoreError::validation(format!(
                "skill {skill_id} has no command name"
            )));
        }

        let installed = self.agents.install_skill(agent_id, skill_id).await?;
        if installed {
            info!("Installed skill {} on agent {}", skill.command_name, agent_id);
        }

        self.sync.publish(
            user_id,
            agent_id,
            SkillSyncEvent::new(
                SyncAction::Progress,
                agent_id,
                SyncStep::SyncingSkill,
                format!("Syncing {}", skill.name),
            )
            .for_skill(&skill, 1, 1),
        );
        if let Err(e) = self.sync.sync_one(user_id, agent_id, &skill).await {
            warn!("Failed to sync skill {} after install: {}", skill.command_name, e);
            self.sync.publish(
                user_id,
                agent_id,
                SkillSyncEvent::new(
                    SyncAction::Error,
                    agent_id,
                    SyncStep::Done,
                    "Failed to sync skill",
                )
                .for_skill(&skill, 1, 1),
            );
            return Ok(installed);
        }
        self.reload_agent(user_id, agent_id, &skill).await;
        self.sync.publish(
            user_id,
            agent_id,
            SkillSyncEvent::new(
                SyncAction::Complete,
                agent_id,
                SyncStep::Done,
                format!("Skill {} installed", skill.name),
            )
            .for_skill(&skill, 1, 1),
        );
        Ok(installed)
    }

    /// Uninstall a skill and delete its command file. Returns false if it was not installed.
    pub async fn uninstall(&self, user_id: i64, agent_id: i64, skill_id: i64) -> CoreResult<bool> {
        self.owned_agent(user_id, agent_id).await?;
        let skill = self
            .agents
            .get_skill(skill_id)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("skill {skill_id}")))?;

        let removed = self.agents.uninstall_skill(agent_id, skill_id).await?;
        if removed {
            info!("Uninstalled skill {} from agent {}", skill.command_name, agent_id);
        }
        if skill.command_name.trim().is_empty() {
            return Ok(removed);
        }

        if let Err(e) = self
            .sync
            .remove_one(user_id, agent_id, &skill.command_name)
            .await
        {
            warn!("Failed to remove skill {} after uninstall: {}", skill.command_name, e);
            self.sync.publish(
                user_id,
                agent_id,
                SkillSyncEvent::new(
                    SyncAction::Error,
                    agent_id,
                    SyncStep::Done,
                    "Failed to remove skill",
                )
                .for_skill(&skill, 1, 1),
            );
            return Ok(removed);
        }
        self.reload_agent(user_id, agent_id, &skill).await;
        self.sync.publish(
            user_id,
            agent_id,
            SkillSyncEvent::new(
                SyncAction::Complete,
                agent_id,
                SyncStep::Done,
                format!("Skill {} uninstalled", skill.name),
            )
            .for_skill(&skill, 1, 1),
        );
        Ok(removed)
    }

    /// Restart the agent process. Failures are logged only.
    async fn reload_agent(&self, user_id: i64, agent_id: i64, skill: &Skill) {
        self.sync.publish(
            user_id,
            agent_id,
            SkillSyncEvent::new(
                SyncAction::Progress,
                agent_id,
                SyncStep::RestartingProcess,
                "Restarting agent process",
            )
            .for_skill(skill, 1, 1),
        );
        let key = SandboxKey::new(user_id, agent_id);
        if let Err(e) = self.provisioner.restart_agent_process(key).await {
            warn!("Failed to restart agent process in {}: {}", key, e);
        }
    }

    /// Copy a public or official skill into the user's own skills.
    pub async fn fork_skill(&self, user_id: i64, skill_id: i64) -> CoreResult<Skill> {
        let original = self
            .agents
            .get_skill(skill_id)
            .await?
            .filter(|s| s.is_public || s.is_official)
            .ok_or_else(|| CoreError::not_found(format!("public skill {skill_id}")))?;

        let name = fork_name(&original.name);
        let base = sanitize_command_name(&name);
        if base.is_empty() {
            return Err(CoreError::validation("skill name yields an empty command name"));
        }

        let mut command_name = None;
        for candidate in fork_command_candidates(&base) {
            if !self.agents.command_name_taken(user_id, &candidate).await? {
                command_name = Some(candidate);
                break;
            }
        }
        let Some(command_name) = command_name else {
            return Err(CoreError::conflict(format!(
                "no free command name for '{base}'"
            )));
        };

        let fork = self
            .agents
            .create_skill(NewSkill {
                name,
                prompt: original.prompt.clone(),
                command_name,
                created_by: user_id,
                ..Default::default()
            })
            .await?;
        info!("Forked skill {} as {} for user {}", original.id, fork.id, user_id);
        Ok(fork)
    }
}
