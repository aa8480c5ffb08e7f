//! `kubectl`-backed cluster client.

use async_trait::async_trait;
use serde_json::Value;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::error::{ClusterError, ClusterResult};
use super::manifest;
use super::{
    ClusterApi, CronJobSpec, ExecOutput, JobSpec, PodStatus, ServiceSpec, StatefulSetInfo,
    StatefulSetSpec, validate_resource_name,
};

/// Drives a cluster through the `kubectl` binary, one namespace per client.
#[derive(Debug, Clone)]
pub struct KubectlCluster {
    binary: String,
    namespace: String,
    kubeconfig: Option<PathBuf>,
    context: Option<String>,
}

/// Raw process result before error mapping.
struct RawOutput {
    stdout: Vec<u8>,
    stderr: String,
    exit_code: i32,
}

impl KubectlCluster {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            binary: "kubectl".to_string(),
            namespace: namespace.into(),
            kubeconfig: None,
            context: None,
        }
    }

    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    pub fn with_kubeconfig(mut self, path: Option<PathBuf>) -> Self {
        self.kubeconfig = path;
        self
    }

    pub fn with_context(mut self, context: Option<String>) -> Self {
        self.context = context.filter(|c| !c.is_empty());
        self
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn base_args(&self) -> Vec<String> {
        let mut args = vec!["--namespace".to_string(), self.namespace.clone()];
        if let Some(path) = &self.kubeconfig {
            args.push("--kubeconfig".to_string());
            args.push(path.display().to_string());
        }
        if let Some(context) = &self.context {
            args.push("--context".to_string());
            args.push(context.clone());
        }
        args
    }

    async fn spawn(&self, args: &[String], stdin: Option<&[u8]>) -> ClusterResult<RawOutput> {
        let command_name = args.first().cloned().unwrap_or_default();
        let mut cmd = Command::new(&self.binary);
        cmd.args(self.base_args())
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            });

        let mut child = cmd.spawn().map_err(|e| ClusterError::CommandFailed {
            command: command_name.clone(),
            message: e.to_string(),
        })?;

        if let Some(data) = stdin
            && let Some(mut pipe) = child.stdin.take()
        {
            pipe.write_all(data).await?;
            pipe.shutdown().await?;
            drop(pipe);
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| ClusterError::CommandFailed {
                command: command_name,
                message: e.to_string(),
            })?;

        Ok(RawOutput {
            stdout: output.stdout,
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }

    /// Run a kubectl command and map well-known failures.
    async fn run(
        &self,
        kind: &str,
        name: &str,
        args: &[String],
        stdin: Option<&[u8]>,
    ) -> ClusterResult<Vec<u8>> {
        let output = self.spawn(args, stdin).await?;
        if output.exit_code == 0 {
            return Ok(output.stdout);
        }

        let stderr = output.stderr;
        if stderr.contains("AlreadyExists") || stderr.contains("already exists") {
            return Err(ClusterError::already_exists(kind, name));
        }
        if stderr.contains("NotFound") || stderr.contains("not found") {
            return Err(ClusterError::not_found(kind, name));
        }
        Err(ClusterError::CommandFailed {
            command: args.first().cloned().unwrap_or_default(),
            message: stderr.trim().to_string(),
        })
    }

    async fn apply_create(&self, kind: &str, name: &str, manifest: &Value) -> ClusterResult<()> {
        validate_resource_name(name)?;
        let body =
            serde_json::to_vec(manifest).map_err(|e| ClusterError::ParseError(e.to_string()))?;
        self.run(kind, name, &args(["create", "-f", "-"]), Some(&body))
            .await
            .map(|_| ())
    }

    async fn get_json(&self, kind: &str, name: &str) -> ClusterResult<Option<Value>> {
        validate_resource_name(name)?;
        match self
            .run(kind, name, &args(["get", kind, name, "-o", "json"]), None)
            .await
        {
            Ok(stdout) => serde_json::from_slice(&stdout)
                .map(Some)
                .map_err(|e| ClusterError::ParseError(e.to_string())),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn delete(&self, kind: &str, name: &str) -> ClusterResult<()> {
        validate_resource_name(name)?;
        self.run(kind, name, &args(["delete", kind, name, "--wait=false"]), None)
            .await
            .map(|_| ())
    }
}

fn args<const N: usize>(items: [&str; N]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

#[async_trait]
impl ClusterApi for KubectlCluster {
    async fn create_service(&self, spec: &ServiceSpec) -> ClusterResult<()> {
        let manifest = manifest::service(spec, &self.namespace);
        self.apply_create("service", &spec.name, &manifest).await
    }

    async fn delete_service(&self, name: &str) -> ClusterResult<()> {
        self.delete("service", name).await
    }

    async fn create_stateful_set(&self, spec: &StatefulSetSpec) -> ClusterResult<()> {
        let manifest = manifest::stateful_set(spec, &self.namespace);
        self.apply_create("statefulset", &spec.name, &manifest).await
    }

    async fn get_stateful_set(&self, name: &str) -> ClusterResult<Option<StatefulSetInfo>> {
        self.get_json("statefulset", name)
            .await?
            .map(|v| manifest::parse_stateful_set(&v))
            .transpose()
    }

    async fn list_stateful_sets(
        &self,
        label_selector: &str,
    ) -> ClusterResult<Vec<StatefulSetInfo>> {
        let stdout = self
            .run(
                "statefulset",
                label_selector,
                &args(["get", "statefulset", "-l", label_selector, "-o", "json"]),
                None,
            )
            .await?;
        let value: Value =
            serde_json::from_slice(&stdout).map_err(|e| ClusterError::ParseError(e.to_string()))?;
        manifest::parse_stateful_set_list(&value)
    }

    async fn set_container_image(
        &self,
        stateful_set: &str,
        container: &str,
        image: &str,
    ) -> ClusterResult<()> {
        validate_resource_name(stateful_set)?;
        if image.trim().is_empty() {
            return Err(ClusterError::InvalidInput("image cannot be empty".into()));
        }
        let target = format!("statefulset/{stateful_set}");
        let assignment = format!("{container}={image}");
        self.run(
            "statefulset",
            stateful_set,
            &args(["set", "image", &target, &assignment]),
            None,
        )
        .await
        .map(|_| ())
    }

    async fn delete_stateful_set(&self, name: &str) -> ClusterResult<()> {
        self.delete("statefulset", name).await
    }

    async fn get_pod(&self, name: &str) -> ClusterResult<Option<PodStatus>> {
        self.get_json("pod", name)
            .await?
            .map(|v| manifest::parse_pod(&v))
            .transpose()
    }

    async fn delete_pod(&self, name: &str) -> ClusterResult<()> {
        self.delete("pod", name).await
    }

    async fn exec(
        &self,
        pod: &str,
        container: &str,
        command: &[String],
        stdin: Option<&[u8]>,
    ) -> ClusterResult<ExecOutput> {
        validate_resource_name(pod)?;
        if command.is_empty() {
            return Err(ClusterError::InvalidInput("exec command is empty".into()));
        }

        let mut exec_args = vec!["exec".to_string()];
        if stdin.is_some() {
            exec_args.push("-i".to_string());
        }
        exec_args.extend(args([pod, "-c", container, "--"]));
        exec_args.extend(command.iter().cloned());

        let output = self.spawn(&exec_args, stdin).await?;
        // kubectl reports a missing pod before the remote command runs.
        if output.exit_code != 0 && output.stderr.contains("NotFound") {
            return Err(ClusterError::not_found("pod", pod));
        }

        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: output.stderr,
            exit_code: output.exit_code,
        })
    }

    async fn create_job(&self, spec: &JobSpec) -> ClusterResult<()> {
        let manifest = manifest::job(spec, &self.namespace);
        self.apply_create("job", &spec.name, &manifest).await
    }

    async fn get_cron_job(&self, name: &str) -> ClusterResult<Option<CronJobSpec>> {
        self.get_json("cronjob", name)
            .await?
            .map(|v| manifest::parse_cron_job(&v))
            .transpose()
    }

    async fn create_cron_job(&self, spec: &CronJobSpec) -> ClusterResult<()> {
        let manifest = manifest::cron_job(spec, &self.namespace);
        self.apply_create("cronjob", &spec.name, &manifest).await
    }

    async fn replace_cron_job(&self, spec: &CronJobSpec) -> ClusterResult<()> {
        validate_resource_name(&spec.name)?;
        let manifest = manifest::cron_job(spec, &self.namespace);
        let body =
            serde_json::to_vec(&manifest).map_err(|e| ClusterError::ParseError(e.to_string()))?;
        self.run("cronjob", &spec.name, &args(["replace", "-f", "-"]), Some(&body))
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_args_include_optional_flags() {
        let client = KubectlCluster::new("agents")
            .with_kubeconfig(Some(PathBuf::from("/etc/kube/config")))
            .with_context(Some(String::new()));
        let base = client.base_args();
        assert_eq!(
            base,
            vec!["--namespace", "agents", "--kubeconfig", "/etc/kube/config"]
        );
    }

    #[tokio::test]
    async fn rejects_invalid_names_before_spawning() {
        let client = KubectlCluster::new("agents").with_binary("/nonexistent/kubectl");
        let err = client.get_pod("Bad_Name").await.unwrap_err();
        assert!(matches!(err, ClusterError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn missing_binary_is_command_failure() {
        let client = KubectlCluster::new("agents").with_binary("/nonexistent/kubectl");
        let err = client.get_pod("sandbox-1-2-0").await.unwrap_err();
        assert!(matches!(err, ClusterError::CommandFailed { .. }));
    }
}
