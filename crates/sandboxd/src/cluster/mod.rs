//! Cluster orchestration client.
//!
//! Provides an async interface over the handful of workload primitives the
//! provisioner needs: stateful sets, headless services, pods, jobs and cron jobs,
//! plus exec-in-pod. Two backends are available:
//! - [`KubectlCluster`] drives a real cluster through the `kubectl` CLI
//! - [`MemoryCluster`] keeps everything in-process for local development and tests

mod error;
mod kubectl;
mod manifest;
mod memory;

pub use error::{ClusterError, ClusterResult};
pub use kubectl::KubectlCluster;
pub use memory::{FailOp, MemoryCluster};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// CPU and memory requests/limits, as cluster quantity strings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequirements {
    pub cpu_request: String,
    pub cpu_limit: String,
    pub memory_request: String,
    pub memory_limit: String,
}

impl ResourceRequirements {
    pub fn new(
        cpu_request: impl Into<String>,
        cpu_limit: impl Into<String>,
        memory_request: impl Into<String>,
        memory_limit: impl Into<String>,
    ) -> Self {
        Self {
            cpu_request: cpu_request.into(),
            cpu_limit: cpu_limit.into(),
            memory_request: memory_request.into(),
            memory_limit: memory_limit.into(),
        }
    }
}

/// A named container port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedPort {
    pub name: String,
    pub port: u16,
}

impl NamedPort {
    pub fn new(name: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            port,
        }
    }
}

/// A volume mounted into a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMount {
    pub name: String,
    pub mount_path: String,
}

/// Container definition shared by stateful sets and jobs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub ports: Vec<NamedPort>,
    pub resources: ResourceRequirements,
    pub volume_mounts: Vec<VolumeMount>,
}

/// Persistent volume claim template attached to a stateful set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeClaim {
    pub name: String,
    pub storage: String,
    pub storage_class: Option<String>,
}

/// Single-replica stateful workload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatefulSetSpec {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    /// Headless service providing stable pod DNS.
    pub service_name: String,
    pub containers: Vec<ContainerSpec>,
    pub volume_claim: Option<VolumeClaim>,
}

impl StatefulSetSpec {
    /// Image of the named container, if present.
    pub fn container_image(&self, container: &str) -> Option<&str> {
        self.containers
            .iter()
            .find(|c| c.name == container)
            .map(|c| c.image.as_str())
    }
}

/// Headless network endpoint for a stateful set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub selector: BTreeMap<String, String>,
    pub ports: Vec<NamedPort>,
}

/// Observed state of a stateful set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatefulSetInfo {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub replicas: i32,
    pub ready_replicas: i32,
    /// Container name -> image.
    pub images: BTreeMap<String, String>,
}

/// Observed state of one container in a pod.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerStatus {
    pub name: String,
    pub image: String,
    pub restart_count: i32,
    pub waiting_reason: Option<String>,
    pub resources: ResourceRequirements,
}

/// Observed state of a pod.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodStatus {
    pub name: String,
    /// Pod phase as reported by the cluster (Pending, Running, Succeeded, Failed, Unknown).
    pub phase: String,
    pub pod_ip: Option<String>,
    /// The pod carries a deletion timestamp.
    pub terminating: bool,
    pub containers: Vec<ContainerStatus>,
}

impl PodStatus {
    pub fn is_running(&self) -> bool {
        self.phase == "Running"
    }
}

/// One-off batch job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub containers: Vec<ContainerSpec>,
    pub backoff_limit: i32,
    pub ttl_seconds_after_finished: i32,
}

/// Scheduled job. The job template's `name` is ignored by the cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CronJobSpec {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub schedule: String,
    /// Allow, Forbid or Replace.
    pub concurrency_policy: String,
    pub job: JobSpec,
}

/// Captured output of a command executed inside a pod.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Convert a non-zero exit into [`ClusterError::ExecFailed`].
    pub fn into_result(self, pod: &str) -> ClusterResult<ExecOutput> {
        if self.success() {
            Ok(self)
        } else {
            Err(ClusterError::ExecFailed {
                pod: pod.to_string(),
                exit_code: self.exit_code,
                stderr: self.stderr,
            })
        }
    }
}

/// Cluster abstraction for testability.
///
/// Create operations return [`ClusterError::AlreadyExists`] when the object exists;
/// delete operations return [`ClusterError::NotFound`] when it does not. Callers decide
/// which of those they tolerate.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn create_service(&self, spec: &ServiceSpec) -> ClusterResult<()>;
    async fn delete_service(&self, name: &str) -> ClusterResult<()>;

    async fn create_stateful_set(&self, spec: &StatefulSetSpec) -> ClusterResult<()>;
    async fn get_stateful_set(&self, name: &str) -> ClusterResult<Option<StatefulSetInfo>>;
    async fn list_stateful_sets(&self, label_selector: &str)
    -> ClusterResult<Vec<StatefulSetInfo>>;
    /// Patch the image of one container in a stateful set's pod template.
    async fn set_container_image(
        &self,
        stateful_set: &str,
        container: &str,
        image: &str,
    ) -> ClusterResult<()>;
    async fn delete_stateful_set(&self, name: &str) -> ClusterResult<()>;

    async fn get_pod(&self, name: &str) -> ClusterResult<Option<PodStatus>>;
    async fn delete_pod(&self, name: &str) -> ClusterResult<()>;

    /// Execute a command in a pod container, optionally feeding stdin.
    ///
    /// A non-zero exit is reported through [`ExecOutput::exit_code`], not as an error.
    async fn exec(
        &self,
        pod: &str,
        container: &str,
        command: &[String],
        stdin: Option<&[u8]>,
    ) -> ClusterResult<ExecOutput>;

    async fn create_job(&self, spec: &JobSpec) -> ClusterResult<()>;
    async fn get_cron_job(&self, name: &str) -> ClusterResult<Option<CronJobSpec>>;
    async fn create_cron_job(&self, spec: &CronJobSpec) -> ClusterResult<()>;
    async fn replace_cron_job(&self, spec: &CronJobSpec) -> ClusterResult<()>;
}

/// Validate a cluster object name (RFC 1123 label, at most 63 chars).
pub fn validate_resource_name(name: &str) -> ClusterResult<()> {
    if name.is_empty() {
        return Err(ClusterError::InvalidInput(
            "resource name cannot be empty".to_string(),
        ));
    }

    if name.len() > 63 {
        return Err(ClusterError::InvalidInput(format!(
            "resource name '{}' exceeds 63 characters",
            name
        )));
    }

    let valid_chars = |c: char| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-';
    if !name.chars().all(valid_chars) || name.starts_with('-') || name.ends_with('-') {
        return Err(ClusterError::InvalidInput(format!(
            "resource name '{}' must be lowercase alphanumeric or '-'",
            name
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_names_follow_dns_label_rules() {
        assert!(validate_resource_name("sandbox-7-42").is_ok());
        assert!(validate_resource_name("sandbox-7-42-0").is_ok());
        assert!(validate_resource_name("").is_err());
        assert!(validate_resource_name("Sandbox").is_err());
        assert!(validate_resource_name("-sandbox").is_err());
        assert!(validate_resource_name("sandbox_1").is_err());
        assert!(validate_resource_name(&"a".repeat(64)).is_err());
    }

    #[test]
    fn exec_output_into_result() {
        let ok = ExecOutput::default().into_result("p-0");
        assert!(ok.is_ok());

        let failed = ExecOutput {
            stdout: String::new(),
            stderr: "boom".to_string(),
            exit_code: 2,
        }
        .into_result("p-0");
        match failed {
            Err(ClusterError::ExecFailed { exit_code, .. }) => assert_eq!(exit_code, 2),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
