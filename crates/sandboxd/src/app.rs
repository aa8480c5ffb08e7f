//! Wiring of the engine's services. Everything shared is constructed once here
//! and handed to the services that need it.

use std::sync::Arc;

use crate::admin::AdminService;
use crate::agent::AgentRepository;
use crate::cluster::ClusterApi;
use crate::db::Database;
use crate::maintenance::{MaintenanceConfig, MaintenanceService};
use crate::pool::{BackgroundPool, PoolConfig};
use crate::provisioner::{Provisioner, ProvisionerConfig};
use crate::pubsub::Hub;
use crate::sandbox_fs::SandboxFs;
use crate::session::{SessionRepository, SessionService, SessionServiceConfig};
use crate::settings::{SettingsDefaults, SettingsRepository, SettingsService};
use crate::skill::{SkillService, SkillSync, SkillSyncEvent};
use crate::storage::{StorageBackendConfig, StorageProvider};
use crate::workspace::{
    OutputEvent, QuotaDefaults, WorkspaceRepository, WorkspaceService, WorkspaceSync,
};

/// Inputs for [`Engine::new`] that are not runtime handles.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub provisioner: ProvisionerConfig,
    pub session: SessionServiceConfig,
    pub settings: SettingsDefaults,
    pub storage: StorageBackendConfig,
    pub quotas: QuotaDefaults,
    pub pool: PoolConfig,
    pub maintenance: MaintenanceConfig,
}

pub struct Engine {
    pub db: Database,
    pub provisioner: Arc<Provisioner>,
    pub settings: SettingsService,
    pub storage: Arc<StorageProvider>,
    pub pool: BackgroundPool,
    pub agents: AgentRepository,
    pub sessions: SessionService,
    pub workspace_sync: Arc<WorkspaceSync>,
    pub workspace: WorkspaceService,
    pub skill_sync: Arc<SkillSync>,
    pub skills: SkillService,
    pub admin: AdminService,
    pub maintenance: MaintenanceService,
    pub skill_events: Arc<Hub<SkillSyncEvent>>,
    pub output_events: Arc<Hub<OutputEvent>>,
}

impl Engine {
    pub fn new(
        db: Database,
        cluster: Arc<dyn ClusterApi>,
        fs: Arc<dyn SandboxFs>,
        config: EngineConfig,
    ) -> Self {
        let pool_handle = db.pool().clone();
        let settings_repo = SettingsRepository::new(pool_handle.clone());
        let settings = SettingsService::new(settings_repo.clone(), config.settings);
        let storage = Arc::new(StorageProvider::new(settings_repo, config.storage));
        let provisioner = Arc::new(Provisioner::new(cluster, config.provisioner));
        let naming = provisioner.naming().clone();

        let agents = AgentRepository::new(pool_handle.clone());
        let session_repo = SessionRepository::new(pool_handle.clone());
        let files = WorkspaceRepository::new(pool_handle, config.quotas);
        let pool = BackgroundPool::new(config.pool);
        let skill_events = Arc::new(Hub::new());
        let output_events = Arc::new(Hub::new());

        let workspace_sync = Arc::new(WorkspaceSync::new(
            storage.clone(),
            fs.clone(),
            naming.clone(),
            session_repo.clone(),
            agents.clone(),
            files.clone(),
            settings.clone(),
        ));
        let workspace = WorkspaceService::new(
            files.clone(),
            storage.clone(),
            workspace_sync.clone(),
            pool.clone(),
            output_events.clone(),
        );
        let skill_sync = Arc::new(SkillSync::new(
            fs,
            naming,
            agents.clone(),
            files.clone(),
            skill_events.clone(),
        ));
        let skills = SkillService::new(agents.clone(), skill_sync.clone(), provisioner.clone());
        let sessions = SessionService::new(
            session_repo.clone(),
            agents.clone(),
            provisioner.clone(),
            settings.clone(),
            skill_sync.clone(),
            workspace_sync.clone(),
            pool.clone(),
            config.session,
        );
        let admin = AdminService::new(provisioner.clone(), session_repo.clone(), agents.clone());
        let maintenance = MaintenanceService::new(
            session_repo,
            skill_sync.clone(),
            files,
            storage.clone(),
            settings.clone(),
            provisioner.clone(),
            config.maintenance,
        );

        Self {
            db,
            provisioner,
            settings,
            storage,
            pool,
            agents,
            sessions,
            workspace_sync,
            workspace,
            skill_sync,
            skills,
            admin,
            maintenance,
            skill_events,
            output_events,
        }
    }
}
