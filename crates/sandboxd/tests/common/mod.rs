//! Test utilities and common setup.
#![allow(dead_code)]

use sandboxd::agent::{Agent, NewAgent, NewSkill, Skill};
use sandboxd::cluster::MemoryCluster;
use sandboxd::db::Database;
use sandboxd::maintenance::MaintenanceConfig;
use sandboxd::pool::PoolConfig;
use sandboxd::provisioner::{ProvisionerConfig, SandboxKey};
use sandboxd::session::{Session, SessionServiceConfig, SessionStatus};
use sandboxd::settings::SettingsDefaults;
use sandboxd::storage::StorageBackendConfig;
use sandboxd::workspace::QuotaDefaults;
use sandboxd::{Engine, EngineConfig};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// An engine over an in-memory database and cluster.
pub struct TestEngine {
    pub engine: Engine,
    pub cluster: Arc<MemoryCluster>,
    /// Object store root; dropped with the harness.
    pub objects: TempDir,
}

impl TestEngine {
    pub fn pod(&self, user_id: i64, agent_id: i64) -> String {
        self.engine
            .provisioner
            .pod_name(SandboxKey::new(user_id, agent_id))
    }

    pub async fn agent(&self, owner: i64, instructions: &str) -> Agent {
        self.engine
            .agents
            .create_agent(NewAgent {
                name: format!("agent of {owner}"),
                created_by: owner,
                instructions: instructions.to_string(),
                ..Default::default()
            })
            .await
            .expect("create agent")
    }

    pub async fn skill(&self, owner: i64, command_name: &str, public: bool) -> Skill {
        self.engine
            .agents
            .create_skill(NewSkill {
                name: command_name.to_string(),
                prompt: format!("Prompt for {command_name}"),
                command_name: command_name.to_string(),
                created_by: owner,
                is_public: public,
                ..Default::default()
            })
            .await
            .expect("create skill")
    }

    /// Wait for every queued background task.
    pub async fn settle(&self) {
        self.engine.pool.wait_idle().await;
    }
}

pub fn test_config(objects: &TempDir, quotas: QuotaDefaults) -> EngineConfig {
    EngineConfig {
        provisioner: ProvisionerConfig::default(),
        session: SessionServiceConfig {
            ready_attempts: 3,
            ready_interval: Duration::from_millis(1),
            creating_timeout: Duration::from_secs(60),
        },
        settings: SettingsDefaults::default(),
        storage: StorageBackendConfig::Local {
            root: objects.path().display().to_string(),
            signing_key: String::new(),
            base_url: String::new(),
        },
        quotas,
        pool: PoolConfig::default(),
        maintenance: MaintenanceConfig::default(),
    }
}

pub async fn engine() -> TestEngine {
    engine_with_quotas(QuotaDefaults::default()).await
}

pub async fn engine_with_quotas(quotas: QuotaDefaults) -> TestEngine {
    build(MemoryCluster::new(), quotas).await
}

/// An engine over a cluster prepared by the caller.
pub async fn engine_with_cluster(cluster: MemoryCluster) -> TestEngine {
    build(cluster, QuotaDefaults::default()).await
}

async fn build(cluster: MemoryCluster, quotas: QuotaDefaults) -> TestEngine {
    let db = Database::in_memory().await.expect("in-memory database");
    let objects = tempfile::tempdir().expect("tempdir");
    let cluster = Arc::new(cluster);
    let engine = Engine::new(
        db,
        cluster.clone(),
        cluster.clone(),
        test_config(&objects, quotas),
    );
    TestEngine {
        engine,
        cluster,
        objects,
    }
}

/// A session row for (user, agent) in `status`, last touched at `at`.
pub fn session_row(
    t: &TestEngine,
    id: &str,
    user_id: i64,
    agent_id: i64,
    status: SessionStatus,
    at: &str,
) -> Session {
    Session {
        id: id.to_string(),
        user_id,
        agent_id,
        pod_name: t.pod(user_id, agent_id),
        pod_ip: String::new(),
        status,
        last_active: at.to_string(),
        created_at: at.to_string(),
        updated_at: at.to_string(),
    }
}
