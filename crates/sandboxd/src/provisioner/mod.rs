//! Sandbox provisioner.
//!
//! Translates a (user, agent) pair into a single-replica stateful set with a
//! headless service and a persistent workspace claim, and exposes the lifecycle
//! primitives the engine needs on top of [`ClusterApi`]: readiness polling, pod
//! inspection, image patching, process restart and maintenance job scheduling.

mod naming;
mod resources;
mod schedule;

pub use naming::{LABEL_AGENT_ID, LABEL_APP, LABEL_USER_ID, Naming, SandboxKey};
pub use resources::{
    DEFAULT_CPU_LIMIT, DEFAULT_CPU_REQUEST, DEFAULT_MEMORY_LIMIT, DEFAULT_MEMORY_REQUEST,
    ResourceOverrides, effective_resources, parse_quantity, validate_requirements,
};
pub use schedule::{DEFAULT_SCHEDULE, interval_to_cron, parse_duration};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::cluster::{
    ClusterApi, ClusterError, ClusterResult, ContainerSpec, CronJobSpec, JobSpec, NamedPort,
    PodStatus, ResourceRequirements, ServiceSpec, StatefulSetSpec, VolumeClaim, VolumeMount,
};
use crate::sandbox_fs::SANDBOX_CONTAINER;

pub const TERMINAL_PORT: u16 = 7681;
pub const WORKSPACE_VOLUME: &str = "workspace";
pub const WORKSPACE_MOUNT: &str = "/workspace";
pub const SIDECAR_CONTAINER: &str = "output-watcher";
pub const MAINTENANCE_CONTAINER: &str = "maintenance";

/// Agent config keys exported to the sandbox under well-known env names.
const CONFIG_ENV_KEYS: &[(&str, &str)] = &[
    ("anthropic_auth_token", "ANTHROPIC_AUTH_TOKEN"),
    ("anthropic_base_url", "ANTHROPIC_BASE_URL"),
    ("anthropic_haiku_model", "ANTHROPIC_DEFAULT_HAIKU_MODEL"),
    ("anthropic_opus_model", "ANTHROPIC_DEFAULT_OPUS_MODEL"),
    ("anthropic_sonnet_model", "ANTHROPIC_DEFAULT_SONNET_MODEL"),
    ("http_proxy", "HTTP_PROXY"),
    ("https_proxy", "HTTPS_PROXY"),
];

/// Provisioner configuration.
#[derive(Debug, Clone)]
pub struct ProvisionerConfig {
    /// Workload name prefix and `app` label value.
    pub name_prefix: String,
    /// Default sandbox image when no override is supplied.
    pub image: String,
    /// Output-watcher sidecar image; no sidecar when unset.
    pub sidecar_image: Option<String>,
    /// Exported to the sandbox as `SANDBOXD_API_URL`.
    pub api_url: Option<String>,
    pub workspace_storage: String,
    pub storage_class: Option<String>,
    /// `pkill -f` pattern matching the agent process.
    pub agent_process_pattern: String,
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self {
            name_prefix: "sandbox".to_string(),
            image: "sandbox-agent:latest".to_string(),
            sidecar_image: None,
            api_url: None,
            workspace_storage: "10Gi".to_string(),
            storage_class: None,
            agent_process_pattern: "^claude$".to_string(),
        }
    }
}

/// Live status of a sandbox pod, for admin views.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodInfo {
    pub pod_name: String,
    /// NotDeployed, Unknown, Terminating, Error, or the pod phase.
    pub status: String,
    pub restart_count: i32,
    pub image: String,
    pub cpu_request: String,
    pub cpu_limit: String,
    pub memory_request: String,
    pub memory_limit: String,
}

impl PodInfo {
    fn from_pod(pod: &PodStatus) -> Self {
        let mut info = PodInfo {
            pod_name: pod.name.clone(),
            status: pod.phase.clone(),
            ..Default::default()
        };
        if pod.terminating {
            info.status = "Terminating".to_string();
        }
        if let Some(main) = pod.containers.first() {
            info.image = main.image.clone();
            info.cpu_request = main.resources.cpu_request.clone();
            info.cpu_limit = main.resources.cpu_limit.clone();
            info.memory_request = main.resources.memory_request.clone();
            info.memory_limit = main.resources.memory_limit.clone();
        }
        for c in &pod.containers {
            info.restart_count = c.restart_count;
            if matches!(
                c.waiting_reason.as_deref(),
                Some("CrashLoopBackOff" | "ImagePullBackOff" | "ErrImagePull")
            ) {
                info.status = "Error".to_string();
            }
        }
        info
    }
}

/// Per-workload failure in a fleet operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchItemError {
    pub name: String,
    pub error: String,
}

/// Outcome of [`Provisioner::batch_update_image`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchImageReport {
    pub total: usize,
    pub updated: usize,
    pub failed: usize,
    pub errors: Vec<BatchItemError>,
    /// Sandboxes whose image was patched.
    #[serde(skip)]
    pub updated_sandboxes: Vec<SandboxKey>,
}

pub struct Provisioner {
    cluster: Arc<dyn ClusterApi>,
    naming: Naming,
    config: ProvisionerConfig,
}

impl Provisioner {
    pub fn new(cluster: Arc<dyn ClusterApi>, config: ProvisionerConfig) -> Self {
        Self {
            cluster,
            naming: Naming::new(config.name_prefix.clone()),
            config,
        }
    }

    pub fn cluster(&self) -> &Arc<dyn ClusterApi> {
        &self.cluster
    }

    pub fn naming(&self) -> &Naming {
        &self.naming
    }

    pub fn config(&self) -> &ProvisionerConfig {
        &self.config
    }

    pub fn workload_name(&self, key: SandboxKey) -> String {
        self.naming.workload(key)
    }

    pub fn pod_name(&self, key: SandboxKey) -> String {
        self.naming.pod(key)
    }

    /// Whether the sandbox's stateful set exists.
    pub async fn exists(&self, key: SandboxKey) -> ClusterResult<bool> {
        Ok(self
            .cluster
            .get_stateful_set(&self.workload_name(key))
            .await?
            .is_some())
    }

    fn sandbox_env(
        &self,
        key: SandboxKey,
        agent_config: &BTreeMap<String, Value>,
    ) -> ClusterResult<BTreeMap<String, String>> {
        let mut env = BTreeMap::from([
            ("USER_ID".to_string(), key.user_id.to_string()),
            ("AGENT_ID".to_string(), key.agent_id.to_string()),
            (
                "AGENT_CONFIG".to_string(),
                serde_json::to_string(agent_config)
                    .map_err(|e| ClusterError::InvalidInput(e.to_string()))?,
            ),
        ]);
        if let Some(url) = &self.config.api_url {
            env.insert("SANDBOXD_API_URL".to_string(), url.clone());
        }
        for (config_key, env_key) in CONFIG_ENV_KEYS {
            if let Some(Value::String(val)) = agent_config.get(*config_key)
                && !val.is_empty()
            {
                env.insert((*env_key).to_string(), val.clone());
            }
        }
        Ok(env)
    }

    fn sidecar(&self, key: SandboxKey) -> Option<ContainerSpec> {
        let image = self.config.sidecar_image.as_ref()?;
        let mut env = BTreeMap::from([
            ("USER_ID".to_string(), key.user_id.to_string()),
            ("AGENT_ID".to_string(), key.agent_id.to_string()),
        ]);
        if let Some(url) = &self.config.api_url {
            env.insert("SANDBOXD_API_URL".to_string(), url.clone());
        }
        Some(ContainerSpec {
            name: SIDECAR_CONTAINER.to_string(),
            image: image.clone(),
            env,
            resources: ResourceRequirements::new("50m", "100m", "32Mi", "64Mi"),
            volume_mounts: vec![VolumeMount {
                name: WORKSPACE_VOLUME.to_string(),
                mount_path: WORKSPACE_MOUNT.to_string(),
            }],
            ..Default::default()
        })
    }

    /// Create the sandbox workload. Idempotent: existing objects count as success.
    ///
    /// The headless service is created first; if the stateful set then fails for any
    /// reason other than already existing, the service is removed again.
    pub async fn create(
        &self,
        key: SandboxKey,
        agent_config: &BTreeMap<String, Value>,
        resources: &ResourceRequirements,
        image: Option<&str>,
    ) -> ClusterResult<()> {
        validate_requirements(resources).map_err(|e| ClusterError::InvalidInput(e.to_string()))?;

        let name = self.workload_name(key);
        let labels = self.naming.labels(key);
        let image = image
            .map(str::trim)
            .filter(|i| !i.is_empty())
            .unwrap_or(&self.config.image)
            .to_string();

        let service = ServiceSpec {
            name: name.clone(),
            labels: labels.clone(),
            selector: labels.clone(),
            ports: vec![NamedPort::new("ttyd", TERMINAL_PORT)],
        };
        match self.cluster.create_service(&service).await {
            Ok(()) => debug!("Headless service {} created", name),
            Err(e) if e.is_already_exists() => {
                debug!("Headless service {} already exists, reusing", name)
            }
            Err(e) => return Err(e),
        }

        let mut containers = vec![ContainerSpec {
            name: SANDBOX_CONTAINER.to_string(),
            image,
            env: self.sandbox_env(key, agent_config)?,
            ports: vec![NamedPort::new("ttyd", TERMINAL_PORT)],
            resources: resources.clone(),
            volume_mounts: vec![VolumeMount {
                name: WORKSPACE_VOLUME.to_string(),
                mount_path: WORKSPACE_MOUNT.to_string(),
            }],
            ..Default::default()
        }];
        containers.extend(self.sidecar(key));

        let stateful_set = StatefulSetSpec {
            name: name.clone(),
            labels,
            service_name: name.clone(),
            containers,
            volume_claim: Some(VolumeClaim {
                name: WORKSPACE_VOLUME.to_string(),
                storage: self.config.workspace_storage.clone(),
                storage_class: self.config.storage_class.clone(),
            }),
        };

        match self.cluster.create_stateful_set(&stateful_set).await {
            Ok(()) => {
                info!("StatefulSet {} created", name);
                Ok(())
            }
            Err(e) if e.is_already_exists() => {
                debug!("StatefulSet {} already exists", name);
                Ok(())
            }
            Err(e) => {
                if let Err(cleanup) = self.cluster.delete_service(&name).await {
                    warn!("Failed to clean up service {}: {}", name, cleanup);
                }
                Err(e)
            }
        }
    }

    /// Poll until the pod is Running, sleeping `interval` between attempts.
    pub async fn wait_for_ready(
        &self,
        key: SandboxKey,
        max_attempts: u32,
        interval: Duration,
    ) -> ClusterResult<()> {
        let pod = self.pod_name(key);
        for attempt in 0..max_attempts {
            match self.cluster.get_pod(&pod).await {
                Ok(Some(status)) if status.is_running() => {
                    info!("Sandbox pod {} is ready", pod);
                    return Ok(());
                }
                Ok(_) => {}
                Err(e) => debug!("Readiness probe for {} failed: {}", pod, e),
            }
            if attempt + 1 < max_attempts {
                tokio::time::sleep(interval).await;
            }
        }
        Err(ClusterError::ReadyTimeout {
            pod,
            attempts: max_attempts,
        })
    }

    /// IP of the sandbox pod. Errors when the pod is absent or has no IP.
    pub async fn pod_ip(&self, key: SandboxKey) -> ClusterResult<String> {
        let pod = self.pod_name(key);
        let status = self
            .cluster
            .get_pod(&pod)
            .await?
            .ok_or_else(|| ClusterError::not_found("pod", &pod))?;
        status
            .pod_ip
            .filter(|ip| !ip.is_empty())
            .ok_or(ClusterError::PodIpUnavailable(pod))
    }

    pub async fn pod_status(&self, key: SandboxKey) -> ClusterResult<Option<PodStatus>> {
        self.cluster.get_pod(&self.pod_name(key)).await
    }

    pub async fn pod_info(&self, key: SandboxKey) -> PodInfo {
        match self.pod_status(key).await {
            Ok(Some(pod)) => PodInfo::from_pod(&pod),
            Ok(None) => PodInfo {
                status: "NotDeployed".to_string(),
                ..Default::default()
            },
            Err(e) => {
                warn!("Failed to inspect pod for sandbox {}: {}", key, e);
                PodInfo {
                    status: "Unknown".to_string(),
                    ..Default::default()
                }
            }
        }
    }

    /// Remove the stateful set, the service, then the pod. The workspace claim is kept.
    pub async fn delete(&self, key: SandboxKey) -> ClusterResult<()> {
        let name = self.workload_name(key);
        let tolerate = |result: ClusterResult<()>| match result {
            Err(e) if !e.is_not_found() => Err(e),
            _ => Ok(()),
        };
        tolerate(self.cluster.delete_stateful_set(&name).await)?;
        tolerate(self.cluster.delete_service(&name).await)?;
        tolerate(self.cluster.delete_pod(&self.pod_name(key)).await)?;
        info!("Sandbox {} deleted", name);
        Ok(())
    }

    pub async fn update_image(&self, key: SandboxKey, image: &str) -> ClusterResult<()> {
        let name = self.workload_name(key);
        self.cluster
            .set_container_image(&name, SANDBOX_CONTAINER, image)
            .await?;
        info!("Sandbox {} image set to {}", name, image);
        Ok(())
    }

    /// Patch every sandbox workload, each independently.
    pub async fn batch_update_image(&self, image: &str) -> ClusterResult<BatchImageReport> {
        let workloads = self
            .cluster
            .list_stateful_sets(&self.naming.fleet_selector())
            .await?;

        let mut report = BatchImageReport {
            total: workloads.len(),
            ..Default::default()
        };
        for workload in workloads {
            match self
                .cluster
                .set_container_image(&workload.name, SANDBOX_CONTAINER, image)
                .await
            {
                Ok(()) => {
                    report.updated += 1;
                    if let Some(key) = SandboxKey::from_labels(&workload.labels) {
                        report.updated_sandboxes.push(key);
                    }
                }
                Err(e) => {
                    warn!("Failed to update image of {}: {}", workload.name, e);
                    report.failed += 1;
                    report.errors.push(BatchItemError {
                        name: workload.name,
                        error: e.to_string(),
                    });
                }
            }
        }
        info!(
            "Batch image update to {}: {} updated, {} failed of {}",
            image, report.updated, report.failed, report.total
        );
        Ok(report)
    }

    /// Kill the agent process; the sandbox entrypoint restarts it.
    pub async fn restart_agent_process(&self, key: SandboxKey) -> ClusterResult<()> {
        let pod = self.pod_name(key);
        let command = vec![
            "pkill".to_string(),
            "-9".to_string(),
            "-f".to_string(),
            self.config.agent_process_pattern.clone(),
        ];
        let output = self
            .cluster
            .exec(&pod, SANDBOX_CONTAINER, &command, None)
            .await?;
        // pkill exits 1 when nothing matched
        let nothing_matched = output.exit_code == 1
            && (output.stderr.is_empty() || output.stderr.contains("no process found"));
        if output.success() || nothing_matched {
            debug!("Restarted agent process in {}", pod);
            return Ok(());
        }
        output.into_result(&pod).map(|_| ())
    }

    fn maintenance_job(name: &str, image: &str, env: &BTreeMap<String, String>) -> JobSpec {
        JobSpec {
            name: name.to_string(),
            labels: BTreeMap::from([(LABEL_APP.to_string(), MAINTENANCE_CONTAINER.to_string())]),
            containers: vec![ContainerSpec {
                name: MAINTENANCE_CONTAINER.to_string(),
                image: image.to_string(),
                command: vec![
                    "/app/sandboxd".to_string(),
                    "maintenance".to_string(),
                    "run".to_string(),
                ],
                env: env.clone(),
                resources: ResourceRequirements::new("100m", "500m", "128Mi", "256Mi"),
                ..Default::default()
            }],
            backoff_limit: 3,
            ttl_seconds_after_finished: 300,
        }
    }

    /// Create a one-off maintenance job named `{name}-{unix_ts}`.
    pub async fn create_one_off_job(
        &self,
        name: &str,
        image: &str,
        env: &BTreeMap<String, String>,
    ) -> ClusterResult<String> {
        let job_name = format!("{}-{}", name, chrono::Utc::now().timestamp());
        self.cluster
            .create_job(&Self::maintenance_job(&job_name, image, env))
            .await?;
        info!("One-off job {} created", job_name);
        Ok(job_name)
    }

    /// Create the cron job, or replace its spec if it already exists.
    pub async fn ensure_cron_job(
        &self,
        name: &str,
        schedule: &str,
        image: &str,
        env: &BTreeMap<String, String>,
    ) -> ClusterResult<()> {
        let spec = CronJobSpec {
            name: name.to_string(),
            labels: BTreeMap::from([(LABEL_APP.to_string(), MAINTENANCE_CONTAINER.to_string())]),
            schedule: schedule.to_string(),
            concurrency_policy: "Forbid".to_string(),
            job: Self::maintenance_job(name, image, env),
        };

        if self.cluster.get_cron_job(name).await?.is_some() {
            self.cluster.replace_cron_job(&spec).await?;
            info!("CronJob {} updated with schedule {}", name, schedule);
        } else {
            self.cluster.create_cron_job(&spec).await?;
            info!("CronJob {} created with schedule {}", name, schedule);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{FailOp, MemoryCluster};
    use serde_json::json;

    fn provisioner(cluster: Arc<MemoryCluster>) -> Provisioner {
        Provisioner::new(
            cluster,
            ProvisionerConfig {
                sidecar_image: Some("registry/output-watcher:1".to_string()),
                api_url: Some("http://sandboxd:8080".to_string()),
                ..Default::default()
            },
        )
    }

    fn default_resources() -> ResourceRequirements {
        ResourceOverrides::default().resolve()
    }

    #[tokio::test]
    async fn create_is_idempotent() {
        let cluster = Arc::new(MemoryCluster::new());
        let p = provisioner(cluster.clone());
        let key = SandboxKey::new(1, 2);

        p.create(key, &BTreeMap::new(), &default_resources(), None)
            .await
            .unwrap();
        p.create(key, &BTreeMap::new(), &default_resources(), None)
            .await
            .unwrap();

        assert_eq!(cluster.stateful_set_count(), 1);
        assert_eq!(cluster.service_count(), 1);
        assert!(p.exists(key).await.unwrap());
    }

    #[tokio::test]
    async fn create_maps_config_to_env_and_adds_sidecar() {
        let cluster = Arc::new(MemoryCluster::new());
        let p = provisioner(cluster.clone());
        let key = SandboxKey::new(1, 2);
        let config = BTreeMap::from([
            ("anthropic_base_url".to_string(), json!("https://llm.internal")),
            ("anthropic_opus_model".to_string(), json!("")),
            ("temperature".to_string(), json!(0.2)),
        ]);

        p.create(key, &config, &default_resources(), Some("registry/agent:2"))
            .await
            .unwrap();

        let sts = cluster.stateful_set("sandbox-1-2").unwrap();
        let main = &sts.containers[0];
        assert_eq!(main.image, "registry/agent:2");
        assert_eq!(main.env["ANTHROPIC_BASE_URL"], "https://llm.internal");
        assert!(!main.env.contains_key("ANTHROPIC_DEFAULT_OPUS_MODEL"));
        assert_eq!(main.env["SANDBOXD_API_URL"], "http://sandboxd:8080");
        assert!(main.env["AGENT_CONFIG"].contains("temperature"));
        assert_eq!(sts.containers[1].name, SIDECAR_CONTAINER);
        assert_eq!(sts.containers[1].resources.memory_limit, "64Mi");
        assert_eq!(sts.volume_claim.as_ref().unwrap().name, WORKSPACE_VOLUME);
    }

    #[tokio::test]
    async fn failed_stateful_set_cleans_up_service() {
        let cluster = Arc::new(MemoryCluster::new());
        cluster.fail(FailOp::CreateStatefulSet);
        let p = provisioner(cluster.clone());

        let err = p
            .create(SandboxKey::new(1, 2), &BTreeMap::new(), &default_resources(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::CommandFailed { .. }));
        assert_eq!(cluster.service_count(), 0);
    }

    #[tokio::test]
    async fn invalid_resources_are_rejected() {
        let cluster = Arc::new(MemoryCluster::new());
        let p = provisioner(cluster.clone());
        let res = ResourceRequirements::new("4", "2", "1Gi", "1Gi");
        let err = p
            .create(SandboxKey::new(1, 2), &BTreeMap::new(), &res, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::InvalidInput(_)));
        assert_eq!(cluster.service_count(), 0);
    }

    #[tokio::test]
    async fn wait_for_ready_times_out_on_pending_pod() {
        let cluster = Arc::new(MemoryCluster::new().with_pending_pods());
        let p = provisioner(cluster.clone());
        let key = SandboxKey::new(1, 2);
        p.create(key, &BTreeMap::new(), &default_resources(), None)
            .await
            .unwrap();

        let err = p
            .wait_for_ready(key, 3, Duration::from_millis(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::ReadyTimeout { attempts: 3, .. }));
        assert!(matches!(
            p.pod_ip(key).await.unwrap_err(),
            ClusterError::PodIpUnavailable(_)
        ));

        cluster.set_pod_phase("sandbox-1-2-0", "Running");
        p.wait_for_ready(key, 3, Duration::from_millis(1))
            .await
            .unwrap();
        assert!(p.pod_ip(key).await.is_ok());
    }

    #[tokio::test]
    async fn pod_info_reports_error_states() {
        let cluster = Arc::new(MemoryCluster::new());
        let p = provisioner(cluster.clone());
        let key = SandboxKey::new(1, 2);

        assert_eq!(p.pod_info(key).await.status, "NotDeployed");

        p.create(key, &BTreeMap::new(), &default_resources(), None)
            .await
            .unwrap();
        let info = p.pod_info(key).await;
        assert_eq!(info.status, "Running");
        assert_eq!(info.cpu_limit, DEFAULT_CPU_LIMIT);

        cluster.set_waiting_reason("sandbox-1-2-0", "ImagePullBackOff");
        assert_eq!(p.pod_info(key).await.status, "Error");
    }

    #[tokio::test]
    async fn delete_tolerates_missing_objects() {
        let cluster = Arc::new(MemoryCluster::new());
        let p = provisioner(cluster.clone());
        let key = SandboxKey::new(1, 2);

        p.delete(key).await.unwrap();
        p.create(key, &BTreeMap::new(), &default_resources(), None)
            .await
            .unwrap();
        p.delete(key).await.unwrap();

        assert_eq!(cluster.stateful_set_count(), 0);
        assert_eq!(cluster.service_count(), 0);
        assert!(!cluster.has_pod("sandbox-1-2-0"));
    }

    #[tokio::test]
    async fn batch_update_reports_partial_failure() {
        let cluster = Arc::new(MemoryCluster::new());
        let p = provisioner(cluster.clone());
        for agent in 1..=3 {
            p.create(
                SandboxKey::new(9, agent),
                &BTreeMap::new(),
                &default_resources(),
                None,
            )
            .await
            .unwrap();
        }
        cluster.fail(FailOp::SetImage {
            stateful_set: "sandbox-9-2".to_string(),
        });

        let report = p.batch_update_image("registry/agent:3").await.unwrap();
        assert_eq!((report.total, report.updated, report.failed), (3, 2, 1));
        assert_eq!(report.errors[0].name, "sandbox-9-2");
        assert_eq!(
            report.updated_sandboxes,
            vec![SandboxKey::new(9, 1), SandboxKey::new(9, 3)]
        );
        assert_eq!(
            cluster.stateful_set("sandbox-9-3").unwrap().containers[0].image,
            "registry/agent:3"
        );
    }

    #[tokio::test]
    async fn ensure_cron_job_upserts() {
        let cluster = Arc::new(MemoryCluster::new());
        let p = provisioner(cluster.clone());
        let env = BTreeMap::new();

        p.ensure_cron_job("maintenance", "*/10 * * * *", "registry/sandboxd:1", &env)
            .await
            .unwrap();
        p.ensure_cron_job("maintenance", "0 */2 * * *", "registry/sandboxd:1", &env)
            .await
            .unwrap();

        let cron = cluster.cron_job("maintenance").unwrap();
        assert_eq!(cron.schedule, "0 */2 * * *");
        assert_eq!(cron.concurrency_policy, "Forbid");
        assert_eq!(
            cron.job.containers[0].command,
            vec!["/app/sandboxd", "maintenance", "run"]
        );
        assert_eq!(cron.job.backoff_limit, 3);
        assert_eq!(cron.job.ttl_seconds_after_finished, 300);
    }

    #[tokio::test]
    async fn one_off_job_is_timestamped() {
        let cluster = Arc::new(MemoryCluster::new());
        let p = provisioner(cluster.clone());
        let name = p
            .create_one_off_job("maintenance", "registry/sandboxd:1", &BTreeMap::new())
            .await
            .unwrap();
        assert!(name.starts_with("maintenance-"));
        assert_eq!(cluster.jobs().len(), 1);
    }

    #[tokio::test]
    async fn restart_runs_pkill() {
        let cluster = Arc::new(MemoryCluster::new());
        let p = provisioner(cluster.clone());
        let key = SandboxKey::new(1, 2);
        p.create(key, &BTreeMap::new(), &default_resources(), None)
            .await
            .unwrap();
        p.restart_agent_process(key).await.unwrap();
        let log = cluster.exec_log();
        assert_eq!(log[0].command, vec!["pkill", "-9", "-f", "^claude$"]);
    }
}
