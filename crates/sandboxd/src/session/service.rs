//! Session orchestration: reuse or provision a sandbox, bring it up to date,
//! and record the session.

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use super::models::{CreateSessionResponse, Session, SessionEvent, SessionStatus};
use super::probe::{PodIpProbe, ReachabilityProbe};
use super::repository::SessionRepository;
use crate::agent::{Agent, AgentRepository};
use crate::db::now_timestamp;
use crate::error::{CoreError, CoreResult};
use crate::pool::{BackgroundPool, Submission};
use crate::provisioner::{Provisioner, SandboxKey};
use crate::settings::SettingsService;
use crate::skill::SkillSync;
use crate::workspace::WorkspaceSync;

/// Session service configuration.
#[derive(Debug, Clone)]
pub struct SessionServiceConfig {
    /// Readiness polls after creating a sandbox.
    pub ready_attempts: u32,
    /// Pause between readiness polls.
    pub ready_interval: Duration,
    /// Age after which a session still `creating` is considered abandoned.
    pub creating_timeout: Duration,
}

impl Default for SessionServiceConfig {
    fn default() -> Self {
        Self {
            ready_attempts: 60,
            ready_interval: Duration::from_secs(5),
            creating_timeout: Duration::from_secs(6 * 60),
        }
    }
}

/// Skills, instructions, output files and workspace, in that order.
async fn prepare_sandbox(
    skills: &SkillSync,
    workspace: &WorkspaceSync,
    user_id: i64,
    agent_id: i64,
    agent_instructions: &str,
) {
    if let Err(e) = skills.sync_all(user_id, agent_id).await {
        warn!("Skill sync for user {} agent {} failed: {}", user_id, agent_id, e);
    }
    workspace
        .write_instructions(user_id, agent_id, agent_instructions)
        .await;
    workspace.restore_output_files(user_id, agent_id).await;
    workspace.full_sync(user_id, agent_id).await;
}

/// Service managing sandbox-backed sessions.
#[derive(Clone)]
pub struct SessionService {
    repo: SessionRepository,
    agents: AgentRepository,
    provisioner: Arc<Provisioner>,
    probe: Arc<dyn ReachabilityProbe>,
    settings: SettingsService,
    skills: Arc<SkillSync>,
    workspace: Arc<WorkspaceSync>,
    pool: BackgroundPool,
    config: SessionServiceConfig,
}

impl SessionService {
    pub fn new(
        repo: SessionRepository,
        agents: AgentRepository,
        provisioner: Arc<Provisioner>,
        settings: SettingsService,
        skills: Arc<SkillSync>,
        workspace: Arc<WorkspaceSync>,
        pool: BackgroundPool,
        config: SessionServiceConfig,
    ) -> Self {
        Self {
            repo,
            agents,
            probe: Arc::new(PodIpProbe::new(provisioner.clone())),
            provisioner,
            settings,
            skills,
            workspace,
            pool,
            config,
        }
    }

    /// Replace the reachability probe used to decide on reuse.
    pub fn set_probe(&mut self, probe: Arc<dyn ReachabilityProbe>) {
        self.probe = probe;
    }

    pub fn repository(&self) -> &SessionRepository {
        &self.repo
    }

    /// Return the user's running session on this agent, or provision one.
    ///
    /// Switching agents soft-deletes the user's sessions on other agents; their
    /// sandboxes keep running.
    pub async fn create_or_reuse_session(
        &self,
        user_id: i64,
        agent_id: i64,
    ) -> CoreResult<CreateSessionResponse> {
        if agent_id <= 0 {
            return Err(CoreError::validation("agent_id is required"));
        }
        let key = SandboxKey::new(user_id, agent_id);

        if let Some(reused) = self.try_reuse(key).await? {
            return Ok(reused);
        }

        if let Err(e) = self.repo.soft_delete_other_agents(user_id, agent_id).await {
            warn!("Failed to close other sessions of user {}: {:#}", user_id, e);
        }

        let agent = self.owned_agent(user_id, agent_id).await?;

        let exists = self
            .provisioner
            .exists(key)
            .await
            .map_err(|e| CoreError::internal_from("failed to check sandbox", e))?;
        if !exists {
            self.provision(key, &agent).await?;
        }

        let pod_ip = self
            .provisioner
            .pod_ip(key)
            .await
            .map_err(|e| CoreError::internal_from("failed to resolve sandbox pod", e))?;

        if exists {
            let skills = self.skills.clone();
            let workspace = self.workspace.clone();
            let instructions = agent.instructions.clone();
            let submitted = self.pool.submit(format!("post-create:{user_id}:{agent_id}"), async move {
                prepare_sandbox(&skills, &workspace, user_id, agent_id, &instructions).await;
            });
            if submitted == Submission::Rejected {
                warn!("Background pool full, skipping resync of {}", key);
            }
        } else {
            prepare_sandbox(
                &self.skills,
                &self.workspace,
                user_id,
                agent_id,
                &agent.instructions,
            )
            .await;
        }

        self.record_session(key, &pod_ip, !exists).await
    }

    /// Reuse the latest active session if its sandbox still answers.
    async fn try_reuse(&self, key: SandboxKey) -> CoreResult<Option<CreateSessionResponse>> {
        let Some(mut session) = self
            .repo
            .find_latest(key.user_id, key.agent_id, SessionStatus::ACTIVE)
            .await?
        else {
            return Ok(None);
        };

        match self.probe.probe(key).await {
            Some(ip) => {
                match self
                    .repo
                    .apply(&session.id, session.status, SessionEvent::Activity, Some(&ip))
                    .await?
                {
                    Some(status) => {
                        debug!("Reusing session {} on {}", session.id, session.pod_name);
                        session.status = status;
                        Ok(Some(CreateSessionResponse::from_session(&session, false)))
                    }
                    None => {
                        debug!("Session {} changed while reusing", session.id);
                        Ok(None)
                    }
                }
            }
            None => {
                info!(
                    "Sandbox of session {} unreachable, recreating",
                    session.id
                );
                if let Err(e) = self
                    .repo
                    .apply(&session.id, session.status, SessionEvent::Delete, None)
                    .await
                {
                    warn!("Failed to retire session {}: {:#}", session.id, e);
                }
                Ok(None)
            }
        }
    }

    async fn owned_agent(&self, user_id: i64, agent_id: i64) -> CoreResult<Agent> {
        match self.agents.get_agent(agent_id).await? {
            Some(agent) if agent.created_by == user_id => Ok(agent),
            _ => Err(CoreError::not_found(format!("agent {agent_id}"))),
        }
    }

    async fn provision(&self, key: SandboxKey, agent: &Agent) -> CoreResult<()> {
        let resources = self
            .settings
            .effective_resources(key.user_id, &agent.resource_overrides())
            .await?;
        let image = self.settings.sandbox_image().await;

        self.provisioner
            .create(key, &agent.config_map(), &resources, Some(&image))
            .await
            .map_err(|e| CoreError::internal_from("failed to create sandbox", e))?;

        if let Err(e) = self
            .provisioner
            .wait_for_ready(key, self.config.ready_attempts, self.config.ready_interval)
            .await
        {
            warn!("Sandbox {} not ready yet: {}", key, e);
        }
        Ok(())
    }

    /// Insert the session and mark it running. A concurrent creator that got
    /// there first wins and its session is returned instead, unless it has been
    /// stuck in `creating` past the timeout, in which case it is retired.
    ///
    /// `is_new` reports whether the sandbox itself was just created.
    async fn record_session(
        &self,
        key: SandboxKey,
        pod_ip: &str,
        is_new: bool,
    ) -> CoreResult<CreateSessionResponse> {
        let now = now_timestamp();
        let mut session = Session {
            id: Uuid::new_v4().to_string(),
            user_id: key.user_id,
            agent_id: key.agent_id,
            pod_name: self.provisioner.pod_name(key),
            pod_ip: String::new(),
            status: SessionStatus::Creating,
            last_active: now.clone(),
            created_at: now.clone(),
            updated_at: now,
        };

        let mut retired_stuck = false;
        loop {
            let inserted = self
                .repo
                .insert(&session)
                .await
                .map_err(|e| CoreError::internal_from("failed to create session", format!("{e:#}")))?;
            if inserted {
                break;
            }
            let winner = self
                .repo
                .find_latest(key.user_id, key.agent_id, SessionStatus::CURRENT)
                .await?
                .ok_or_else(|| CoreError::internal("session slot taken but no session found"))?;
            if !retired_stuck && self.is_stuck_creating(&winner) {
                info!("Retiring session {} stuck in creating", winner.id);
                self.repo
                    .apply(&winner.id, SessionStatus::Creating, SessionEvent::Delete, None)
                    .await?;
                retired_stuck = true;
                continue;
            }
            info!("Adopting concurrently created session {}", winner.id);
            return Ok(CreateSessionResponse::from_session(&winner, false));
        }

        match self
            .repo
            .apply(&session.id, SessionStatus::Creating, SessionEvent::Ready, Some(pod_ip))
            .await?
        {
            Some(status) => session.status = status,
            None => warn!("Session {} changed before it became ready", session.id),
        }
        session.pod_ip = pod_ip.to_string();
        info!("Created session {} on {}", session.id, session.pod_name);
        Ok(CreateSessionResponse::from_session(&session, is_new))
    }

    fn is_stuck_creating(&self, session: &Session) -> bool {
        if session.status != SessionStatus::Creating {
            return false;
        }
        match DateTime::parse_from_rfc3339(&session.updated_at) {
            Ok(updated) => Utc::now()
                .signed_duration_since(updated.with_timezone(&Utc))
                .to_std()
                .is_ok_and(|age| age > self.config.creating_timeout),
            Err(_) => true,
        }
    }

    async fn owned_session(&self, user_id: i64, session_id: &str) -> CoreResult<Session> {
        match self.repo.get(session_id).await? {
            Some(session) if session.user_id == user_id => Ok(session),
            _ => Err(CoreError::not_found(format!("session {session_id}"))),
        }
    }

    pub async fn get_session(&self, user_id: i64, session_id: &str) -> CoreResult<Session> {
        self.owned_session(user_id, session_id).await
    }

    /// Non-deleted sessions of the user, newest first.
    pub async fn list_sessions(&self, user_id: i64) -> CoreResult<Vec<Session>> {
        Ok(self.repo.list_for_user(user_id).await?)
    }

    /// Soft-delete a session. The sandbox keeps running.
    pub async fn delete_session(&self, user_id: i64, session_id: &str) -> CoreResult<()> {
        let session = self.owned_session(user_id, session_id).await?;
        if session.status == SessionStatus::Deleted {
            return Err(CoreError::not_found(format!("session {session_id}")));
        }
        match self
            .repo
            .apply(&session.id, session.status, SessionEvent::Delete, None)
            .await?
        {
            Some(_) => {
                info!("Deleted session {}", session.id);
                Ok(())
            }
            None => Err(CoreError::conflict(format!(
                "session {session_id} changed concurrently"
            ))),
        }
    }
}
