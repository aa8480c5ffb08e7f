//! Operator actions on individual sandboxes and on the whole fleet.

use log::{info, warn};
use std::sync::Arc;

use crate::agent::AgentRepository;
use crate::error::{CoreError, CoreResult};
use crate::provisioner::{BatchImageReport, PodInfo, Provisioner, SandboxKey};
use crate::session::SessionRepository;

pub struct AdminService {
    provisioner: Arc<Provisioner>,
    sessions: SessionRepository,
    agents: AgentRepository,
}

impl AdminService {
    pub fn new(
        provisioner: Arc<Provisioner>,
        sessions: SessionRepository,
        agents: AgentRepository,
    ) -> Self {
        Self {
            provisioner,
            sessions,
            agents,
        }
    }

    async fn require_agent(&self, key: SandboxKey) -> CoreResult<()> {
        match self.agents.get_agent(key.agent_id).await? {
            Some(agent) if agent.created_by == key.user_id => Ok(()),
            _ => Err(CoreError::not_found(format!("agent {}", key.agent_id))),
        }
    }

    async fn close_sessions(&self, key: SandboxKey) {
        match self
            .sessions
            .soft_delete_for_sandbox(key.user_id, key.agent_id)
            .await
        {
            Ok(0) => {}
            Ok(n) => info!("Closed {} sessions of sandbox {}", n, key),
            Err(e) => warn!("Failed to close sessions of sandbox {}: {:#}", key, e),
        }
    }

    /// Tear the sandbox down; the next session recreates it on the same workspace claim.
    pub async fn restart_user_agent(&self, user_id: i64, agent_id: i64) -> CoreResult<()> {
        let key = SandboxKey::new(user_id, agent_id);
        self.require_agent(key).await?;
        self.close_sessions(key).await;
        self.provisioner
            .delete(key)
            .await
            .map_err(|e| CoreError::internal_from("failed to restart agent", e))?;
        info!("Admin restarted sandbox {}", key);
        Ok(())
    }

    pub async fn update_agent_image(
        &self,
        user_id: i64,
        agent_id: i64,
        image: &str,
    ) -> CoreResult<()> {
        let image = image.trim();
        if image.is_empty() {
            return Err(CoreError::validation("image is required"));
        }
        let key = SandboxKey::new(user_id, agent_id);
        self.require_agent(key).await?;
        self.provisioner
            .update_image(key, image)
            .await
            .map_err(|e| {
                if e.is_not_found() {
                    CoreError::not_found(format!("sandbox {key}"))
                } else {
                    CoreError::internal_from("failed to update agent image", e)
                }
            })?;
        self.close_sessions(key).await;
        Ok(())
    }

    /// Patch every sandbox's image and close the sessions of those that changed.
    pub async fn batch_update_image(&self, image: &str) -> CoreResult<BatchImageReport> {
        let image = image.trim();
        if image.is_empty() {
            return Err(CoreError::validation("image is required"));
        }
        let report = self
            .provisioner
            .batch_update_image(image)
            .await
            .map_err(|e| CoreError::internal_from("failed to list sandboxes", e))?;
        for key in &report.updated_sandboxes {
            self.close_sessions(*key).await;
        }
        Ok(report)
    }

    /// Delete the agent record, close its sessions and remove the sandbox.
    ///
    /// Sandbox removal is best-effort once the record is gone.
    pub async fn delete_user_agent(&self, user_id: i64, agent_id: i64) -> CoreResult<()> {
        let key = SandboxKey::new(user_id, agent_id);
        self.require_agent(key).await?;
        if !self.agents.delete_agent(agent_id).await? {
            return Err(CoreError::not_found(format!("agent {agent_id}")));
        }
        self.close_sessions(key).await;
        if let Err(e) = self.provisioner.delete(key).await {
            warn!("Failed to delete sandbox {}: {}", key, e);
        }
        info!("Admin deleted agent {} of user {}", agent_id, user_id);
        Ok(())
    }

    pub async fn pod_info(&self, user_id: i64, agent_id: i64) -> PodInfo {
        self.provisioner
            .pod_info(SandboxKey::new(user_id, agent_id))
            .await
    }
}
