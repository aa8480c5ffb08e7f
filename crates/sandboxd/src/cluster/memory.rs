//! In-process cluster for local development and tests.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};

use super::error::{ClusterError, ClusterResult};
use super::{
    ClusterApi, ContainerStatus, CronJobSpec, ExecOutput, JobSpec, PodStatus, ServiceSpec,
    StatefulSetInfo, StatefulSetSpec,
};
use crate::sandbox_fs::{SANDBOX_CONTAINER, SandboxFs, parent_dir};

/// Operation the in-memory cluster can be told to fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailOp {
    CreateService,
    CreateStatefulSet,
    SetImage { stateful_set: String },
    Exec,
    /// File writes whose path starts with the prefix.
    Write { path_prefix: String },
    CreateJob,
    CreateCronJob,
}

/// One recorded exec call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecRecord {
    pub pod: String,
    pub container: String,
    pub command: Vec<String>,
    pub stdin: Option<Vec<u8>>,
}

#[derive(Default)]
struct State {
    services: BTreeMap<String, ServiceSpec>,
    stateful_sets: BTreeMap<String, StatefulSetSpec>,
    pods: BTreeMap<String, PodStatus>,
    /// pod -> path -> contents
    files: BTreeMap<String, BTreeMap<String, Vec<u8>>>,
    dirs: BTreeMap<String, BTreeSet<String>>,
    exec_log: Vec<ExecRecord>,
    exec_stdout: String,
    jobs: Vec<JobSpec>,
    cron_jobs: BTreeMap<String, CronJobSpec>,
    failures: Vec<FailOp>,
    next_ip: u32,
    pods_start_pending: bool,
}

impl State {
    fn failing(&self, op: &FailOp) -> bool {
        self.failures.iter().any(|f| f == op)
    }

    fn spawn_pod(&mut self, spec: &StatefulSetSpec) {
        self.next_ip += 1;
        let (phase, pod_ip) = if self.pods_start_pending {
            ("Pending".to_string(), None)
        } else {
            ("Running".to_string(), Some(format!("10.244.0.{}", self.next_ip)))
        };
        let pod = PodStatus {
            name: format!("{}-0", spec.name),
            phase,
            pod_ip,
            terminating: false,
            containers: spec
                .containers
                .iter()
                .map(|c| ContainerStatus {
                    name: c.name.clone(),
                    image: c.image.clone(),
                    restart_count: 0,
                    waiting_reason: None,
                    resources: c.resources.clone(),
                })
                .collect(),
        };
        self.pods.insert(pod.name.clone(), pod);
    }

    fn require_pod(&self, pod: &str) -> ClusterResult<()> {
        if self.pods.contains_key(pod) {
            Ok(())
        } else {
            Err(ClusterError::not_found("pod", pod))
        }
    }

    fn remove_tree(&mut self, pod: &str, path: &str) {
        let prefix = format!("{}/", path.trim_end_matches('/'));
        if let Some(files) = self.files.get_mut(pod) {
            files.retain(|k, _| k != path && !k.starts_with(&prefix));
        }
        if let Some(dirs) = self.dirs.get_mut(pod) {
            dirs.retain(|k| k != path && !k.starts_with(&prefix));
        }
    }

    fn add_dir(&mut self, pod: &str, dir: &str) {
        let dirs = self.dirs.entry(pod.to_string()).or_default();
        let mut current = String::new();
        for segment in dir.split('/').filter(|s| !s.is_empty()) {
            current.push('/');
            current.push_str(segment);
            dirs.insert(current.clone());
        }
    }
}

fn matches_selector(labels: &BTreeMap<String, String>, selector: &str) -> bool {
    selector
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .all(|pair| match pair.split_once('=') {
            Some((k, v)) => labels.get(k).map(String::as_str) == Some(v),
            None => labels.contains_key(pair),
        })
}

fn info_of(spec: &StatefulSetSpec, pod: Option<&PodStatus>) -> StatefulSetInfo {
    StatefulSetInfo {
        name: spec.name.clone(),
        labels: spec.labels.clone(),
        replicas: 1,
        ready_replicas: i32::from(pod.is_some_and(PodStatus::is_running)),
        images: spec
            .containers
            .iter()
            .map(|c| (c.name.clone(), c.image.clone()))
            .collect(),
    }
}

/// Cluster kept entirely in memory.
///
/// Creating a stateful set immediately schedules its `-0` pod as Running with a fresh IP
/// (or Pending without one, see [`MemoryCluster::with_pending_pods`]). Deleting a pod whose
/// stateful set still exists reschedules it, like the real controller does.
#[derive(Default)]
pub struct MemoryCluster {
    state: Mutex<State>,
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// New pods start Pending without an IP until [`MemoryCluster::set_pod_phase`].
    pub fn with_pending_pods(self) -> Self {
        self.lock().pods_start_pending = true;
        self
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn fail(&self, op: FailOp) {
        self.lock().failures.push(op);
    }

    pub fn clear_failures(&self) {
        self.lock().failures.clear();
    }

    /// Set a pod's phase. Running pods get an IP if they have none.
    pub fn set_pod_phase(&self, pod: &str, phase: &str) {
        let mut state = self.lock();
        state.next_ip += 1;
        let ip = format!("10.244.0.{}", state.next_ip);
        if let Some(p) = state.pods.get_mut(pod) {
            p.phase = phase.to_string();
            if phase == "Running" && p.pod_ip.is_none() {
                p.pod_ip = Some(ip);
            }
        }
    }

    pub fn set_waiting_reason(&self, pod: &str, reason: &str) {
        if let Some(p) = self.lock().pods.get_mut(pod) {
            for c in &mut p.containers {
                c.waiting_reason = Some(reason.to_string());
            }
        }
    }

    pub fn clear_pod_ip(&self, pod: &str) {
        if let Some(p) = self.lock().pods.get_mut(pod) {
            p.pod_ip = None;
        }
    }

    /// Drop a pod without rescheduling it.
    pub fn remove_pod(&self, pod: &str) {
        self.lock().pods.remove(pod);
    }

    pub fn has_pod(&self, pod: &str) -> bool {
        self.lock().pods.contains_key(pod)
    }

    pub fn pod_ip(&self, pod: &str) -> Option<String> {
        self.lock().pods.get(pod).and_then(|p| p.pod_ip.clone())
    }

    pub fn stateful_set_count(&self) -> usize {
        self.lock().stateful_sets.len()
    }

    pub fn service_count(&self) -> usize {
        self.lock().services.len()
    }

    pub fn stateful_set(&self, name: &str) -> Option<StatefulSetSpec> {
        self.lock().stateful_sets.get(name).cloned()
    }

    /// Paths of all files in a pod.
    pub fn files(&self, pod: &str) -> Vec<String> {
        self.lock()
            .files
            .get(pod)
            .map(|f| f.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn read_file(&self, pod: &str, path: &str) -> Option<Vec<u8>> {
        self.lock().files.get(pod).and_then(|f| f.get(path).cloned())
    }

    /// Place a file in a pod as if something inside the sandbox wrote it.
    pub fn put_file(&self, pod: &str, path: &str, data: &[u8]) {
        let mut state = self.lock();
        state.add_dir(pod, parent_dir(path));
        state
            .files
            .entry(pod.to_string())
            .or_default()
            .insert(path.to_string(), data.to_vec());
    }

    pub fn has_dir(&self, pod: &str, dir: &str) -> bool {
        self.lock().dirs.get(pod).is_some_and(|d| d.contains(dir))
    }

    pub fn exec_log(&self) -> Vec<ExecRecord> {
        self.lock().exec_log.clone()
    }

    /// Canned stdout returned by every subsequent exec.
    pub fn set_exec_stdout(&self, stdout: &str) {
        self.lock().exec_stdout = stdout.to_string();
    }

    pub fn jobs(&self) -> Vec<JobSpec> {
        self.lock().jobs.clone()
    }

    pub fn cron_job(&self, name: &str) -> Option<CronJobSpec> {
        self.lock().cron_jobs.get(name).cloned()
    }
}

#[async_trait]
impl ClusterApi for MemoryCluster {
    async fn create_service(&self, spec: &ServiceSpec) -> ClusterResult<()> {
        let mut state = self.lock();
        if state.failing(&FailOp::CreateService) {
            return Err(ClusterError::CommandFailed {
                command: "create".into(),
                message: "injected service failure".into(),
            });
        }
        if state.services.contains_key(&spec.name) {
            return Err(ClusterError::already_exists("service", &spec.name));
        }
        state.services.insert(spec.name.clone(), spec.clone());
        Ok(())
    }

    async fn delete_service(&self, name: &str) -> ClusterResult<()> {
        self.lock()
            .services
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| ClusterError::not_found("service", name))
    }

    async fn create_stateful_set(&self, spec: &StatefulSetSpec) -> ClusterResult<()> {
        let mut state = self.lock();
        if state.failing(&FailOp::CreateStatefulSet) {
            return Err(ClusterError::CommandFailed {
                command: "create".into(),
                message: "injected stateful set failure".into(),
            });
        }
        if state.stateful_sets.contains_key(&spec.name) {
            return Err(ClusterError::already_exists("statefulset", &spec.name));
        }
        state.stateful_sets.insert(spec.name.clone(), spec.clone());
        state.spawn_pod(spec);
        Ok(())
    }

    async fn get_stateful_set(&self, name: &str) -> ClusterResult<Option<StatefulSetInfo>> {
        let state = self.lock();
        Ok(state
            .stateful_sets
            .get(name)
            .map(|spec| info_of(spec, state.pods.get(&format!("{name}-0")))))
    }

    async fn list_stateful_sets(
        &self,
        label_selector: &str,
    ) -> ClusterResult<Vec<StatefulSetInfo>> {
        let state = self.lock();
        Ok(state
            .stateful_sets
            .values()
            .filter(|spec| matches_selector(&spec.labels, label_selector))
            .map(|spec| info_of(spec, state.pods.get(&format!("{}-0", spec.name))))
            .collect())
    }

    async fn set_container_image(
        &self,
        stateful_set: &str,
        container: &str,
        image: &str,
    ) -> ClusterResult<()> {
        let mut state = self.lock();
        if state.failing(&FailOp::SetImage {
            stateful_set: stateful_set.to_string(),
        }) {
            return Err(ClusterError::CommandFailed {
                command: "set".into(),
                message: format!("injected image failure for {stateful_set}"),
            });
        }
        let spec = state
            .stateful_sets
            .get_mut(stateful_set)
            .ok_or_else(|| ClusterError::not_found("statefulset", stateful_set))?;
        let target = spec
            .containers
            .iter_mut()
            .find(|c| c.name == container)
            .ok_or_else(|| {
                ClusterError::InvalidInput(format!(
                    "container {container} not found in {stateful_set}"
                ))
            })?;
        target.image = image.to_string();

        // Rolling update replaces the pod with the new template.
        let spec = spec.clone();
        state.spawn_pod(&spec);
        Ok(())
    }

    async fn delete_stateful_set(&self, name: &str) -> ClusterResult<()> {
        self.lock()
            .stateful_sets
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| ClusterError::not_found("statefulset", name))
    }

    async fn get_pod(&self, name: &str) -> ClusterResult<Option<PodStatus>> {
        Ok(self.lock().pods.get(name).cloned())
    }

    async fn delete_pod(&self, name: &str) -> ClusterResult<()> {
        let mut state = self.lock();
        if state.pods.remove(name).is_none() {
            return Err(ClusterError::not_found("pod", name));
        }
        let owner = name.strip_suffix("-0").unwrap_or(name).to_string();
        if let Some(spec) = state.stateful_sets.get(&owner).cloned() {
            state.spawn_pod(&spec);
        }
        Ok(())
    }

    async fn exec(
        &self,
        pod: &str,
        container: &str,
        command: &[String],
        stdin: Option<&[u8]>,
    ) -> ClusterResult<ExecOutput> {
        let mut state = self.lock();
        state.require_pod(pod)?;
        state.exec_log.push(ExecRecord {
            pod: pod.to_string(),
            container: container.to_string(),
            command: command.to_vec(),
            stdin: stdin.map(<[u8]>::to_vec),
        });
        if state.failing(&FailOp::Exec) {
            return Ok(ExecOutput {
                stdout: String::new(),
                stderr: "injected exec failure".to_string(),
                exit_code: 1,
            });
        }

        match command.first().map(String::as_str) {
            Some("mkdir") => {
                for dir in command.iter().skip(1).filter(|a| !a.starts_with('-')) {
                    state.add_dir(pod, dir);
                }
            }
            Some("rm") => {
                for path in command.iter().skip(1).filter(|a| !a.starts_with('-')) {
                    state.remove_tree(pod, path);
                }
            }
            _ => {}
        }

        Ok(ExecOutput {
            stdout: state.exec_stdout.clone(),
            stderr: String::new(),
            exit_code: 0,
        })
    }

    async fn create_job(&self, spec: &JobSpec) -> ClusterResult<()> {
        let mut state = self.lock();
        if state.failing(&FailOp::CreateJob) {
            return Err(ClusterError::CommandFailed {
                command: "create".into(),
                message: "injected job failure".into(),
            });
        }
        if state.jobs.iter().any(|j| j.name == spec.name) {
            return Err(ClusterError::already_exists("job", &spec.name));
        }
        state.jobs.push(spec.clone());
        Ok(())
    }

    async fn get_cron_job(&self, name: &str) -> ClusterResult<Option<CronJobSpec>> {
        Ok(self.lock().cron_jobs.get(name).cloned())
    }

    async fn create_cron_job(&self, spec: &CronJobSpec) -> ClusterResult<()> {
        let mut state = self.lock();
        if state.failing(&FailOp::CreateCronJob) {
            return Err(ClusterError::CommandFailed {
                command: "create".into(),
                message: "injected cron job failure".into(),
            });
        }
        if state.cron_jobs.contains_key(&spec.name) {
            return Err(ClusterError::already_exists("cronjob", &spec.name));
        }
        state.cron_jobs.insert(spec.name.clone(), spec.clone());
        Ok(())
    }

    async fn replace_cron_job(&self, spec: &CronJobSpec) -> ClusterResult<()> {
        let mut state = self.lock();
        if !state.cron_jobs.contains_key(&spec.name) {
            return Err(ClusterError::not_found("cronjob", &spec.name));
        }
        state.cron_jobs.insert(spec.name.clone(), spec.clone());
        Ok(())
    }
}

#[async_trait]
impl SandboxFs for MemoryCluster {
    async fn write(&self, pod: &str, path: &str, data: &[u8]) -> ClusterResult<()> {
        let mut state = self.lock();
        state.require_pod(pod)?;
        let injected = state.failures.iter().any(|f| match f {
            FailOp::Write { path_prefix } => path.starts_with(path_prefix.as_str()),
            _ => false,
        });
        if injected {
            return Err(ClusterError::ExecFailed {
                pod: pod.to_string(),
                exit_code: 1,
                stderr: format!("injected write failure for {path}"),
            });
        }
        state.add_dir(pod, parent_dir(path));
        state
            .files
            .entry(pod.to_string())
            .or_default()
            .insert(path.to_string(), data.to_vec());
        Ok(())
    }

    async fn delete(&self, pod: &str, path: &str) -> ClusterResult<()> {
        let mut state = self.lock();
        state.require_pod(pod)?;
        state.remove_tree(pod, path);
        Ok(())
    }

    async fn list(&self, pod: &str, dir: &str) -> ClusterResult<Vec<String>> {
        let state = self.lock();
        state.require_pod(pod)?;
        let prefix = format!("{}/", dir.trim_end_matches('/'));
        let child = |path: &String| {
            path.strip_prefix(&prefix)
                .and_then(|rest| rest.split('/').next())
                .filter(|name| !name.is_empty())
                .map(str::to_string)
        };

        let mut names: BTreeSet<String> = BTreeSet::new();
        if let Some(files) = state.files.get(pod) {
            names.extend(files.keys().filter_map(child));
        }
        if let Some(dirs) = state.dirs.get(pod) {
            names.extend(dirs.iter().filter_map(child));
        }
        Ok(names.into_iter().collect())
    }

    async fn exec(&self, pod: &str, command: &[String]) -> ClusterResult<ExecOutput> {
        ClusterApi::exec(self, pod, SANDBOX_CONTAINER, command, None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str) -> StatefulSetSpec {
        StatefulSetSpec {
            name: name.to_string(),
            labels: BTreeMap::from([
                ("app".to_string(), "sandbox".to_string()),
                ("user-id".to_string(), "1".to_string()),
            ]),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn create_is_rejected_when_present() {
        let cluster = MemoryCluster::new();
        cluster.create_stateful_set(&spec("sandbox-1-2")).await.unwrap();
        let err = cluster
            .create_stateful_set(&spec("sandbox-1-2"))
            .await
            .unwrap_err();
        assert!(err.is_already_exists());
        assert_eq!(cluster.stateful_set_count(), 1);
        assert!(cluster.pod_ip("sandbox-1-2-0").is_some());
    }

    #[tokio::test]
    async fn deleted_pod_is_rescheduled_with_new_ip() {
        let cluster = MemoryCluster::new();
        cluster.create_stateful_set(&spec("sandbox-1-2")).await.unwrap();
        let before = cluster.pod_ip("sandbox-1-2-0");
        cluster.delete_pod("sandbox-1-2-0").await.unwrap();
        let after = cluster.pod_ip("sandbox-1-2-0");
        assert!(after.is_some());
        assert_ne!(before, after);
    }

    #[tokio::test]
    async fn selector_filters_by_labels() {
        let cluster = MemoryCluster::new();
        cluster.create_stateful_set(&spec("sandbox-1-2")).await.unwrap();
        let mut other = spec("other-1");
        other.labels.insert("app".to_string(), "other".to_string());
        cluster.create_stateful_set(&other).await.unwrap();

        let found = cluster.list_stateful_sets("app=sandbox").await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "sandbox-1-2");
    }

    #[tokio::test]
    async fn filesystem_lists_direct_children() {
        let cluster = MemoryCluster::new();
        cluster.create_stateful_set(&spec("sandbox-1-2")).await.unwrap();
        let pod = "sandbox-1-2-0";
        SandboxFs::write(&cluster, pod, "/w/a.md", b"a").await.unwrap();
        SandboxFs::write(&cluster, pod, "/w/sub/b.md", b"b").await.unwrap();
        SandboxFs::mkdir_all(&cluster, pod, &["/w/empty".to_string()])
            .await
            .unwrap();

        let names = SandboxFs::list(&cluster, pod, "/w").await.unwrap();
        assert_eq!(names, vec!["a.md", "empty", "sub"]);
        assert!(SandboxFs::list(&cluster, pod, "/missing").await.unwrap().is_empty());

        SandboxFs::delete(&cluster, pod, "/w/sub").await.unwrap();
        assert_eq!(cluster.files(pod), vec!["/w/a.md"]);
    }

    #[tokio::test]
    async fn missing_pod_is_not_found() {
        let cluster = MemoryCluster::new();
        let err = SandboxFs::write(&cluster, "nope-0", "/a", b"").await.unwrap_err();
        assert!(err.is_not_found());
    }
}
