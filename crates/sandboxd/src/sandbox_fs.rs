//! Filesystem access inside a running sandbox.
//!
//! Everything the synchronizers need from a sandbox's filesystem goes through
//! [`SandboxFs`]. [`ExecFs`] implements it with shell commands executed over
//! [`ClusterApi::exec`]; the in-memory cluster implements it directly.

use async_trait::async_trait;
use std::sync::Arc;

use crate::cluster::{ClusterApi, ClusterResult, ExecOutput};

/// Name of the main sandbox container.
pub const SANDBOX_CONTAINER: &str = "sandbox";

#[async_trait]
pub trait SandboxFs: Send + Sync {
    /// Write a file, creating parent directories as needed.
    async fn write(&self, pod: &str, path: &str, data: &[u8]) -> ClusterResult<()>;

    /// Recursively delete a file or directory. A missing path is not an error.
    async fn delete(&self, pod: &str, path: &str) -> ClusterResult<()>;

    /// Names of the direct children of `dir`. A missing directory lists as empty.
    async fn list(&self, pod: &str, dir: &str) -> ClusterResult<Vec<String>>;

    /// Run a command in the sandbox container.
    async fn exec(&self, pod: &str, command: &[String]) -> ClusterResult<ExecOutput>;

    async fn mkdir_all(&self, pod: &str, dirs: &[String]) -> ClusterResult<()> {
        if dirs.is_empty() {
            return Ok(());
        }
        let mut command = vec!["mkdir".to_string(), "-p".to_string()];
        command.extend(dirs.iter().cloned());
        self.exec(pod, &command).await?.into_result(pod).map(|_| ())
    }

    /// Recursively strip write permission from `dir`.
    async fn make_read_only(&self, pod: &str, dir: &str) -> ClusterResult<()> {
        let command = vec![
            "chmod".to_string(),
            "-R".to_string(),
            "a-w".to_string(),
            dir.to_string(),
        ];
        self.exec(pod, &command).await?.into_result(pod).map(|_| ())
    }

    /// Open `dir` for traversal and make `file` read-only.
    async fn publish_read_only(&self, pod: &str, dir: &str, file: &str) -> ClusterResult<()> {
        let script = format!(
            "chmod a+rx {} && chmod a-w {}",
            shell_quote(dir),
            shell_quote(file)
        );
        let command = vec!["sh".to_string(), "-c".to_string(), script];
        self.exec(pod, &command).await?.into_result(pod).map(|_| ())
    }
}

/// Quote a string for a POSIX shell.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Parent directory of an absolute sandbox path.
pub fn parent_dir(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) => "/",
        Some(idx) => &path[..idx],
        None => ".",
    }
}

/// [`SandboxFs`] over exec in the sandbox container.
#[derive(Clone)]
pub struct ExecFs {
    cluster: Arc<dyn ClusterApi>,
    container: String,
}

impl ExecFs {
    pub fn new(cluster: Arc<dyn ClusterApi>) -> Self {
        Self {
            cluster,
            container: SANDBOX_CONTAINER.to_string(),
        }
    }

    pub fn with_container(mut self, container: impl Into<String>) -> Self {
        self.container = container.into();
        self
    }

    fn sh(script: String) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), script]
    }
}

#[async_trait]
impl SandboxFs for ExecFs {
    async fn write(&self, pod: &str, path: &str, data: &[u8]) -> ClusterResult<()> {
        let script = format!(
            "mkdir -p {} && cat > {}",
            shell_quote(parent_dir(path)),
            shell_quote(path)
        );
        self.cluster
            .exec(pod, &self.container, &Self::sh(script), Some(data))
            .await?
            .into_result(pod)
            .map(|_| ())
    }

    async fn delete(&self, pod: &str, path: &str) -> ClusterResult<()> {
        let command = vec!["rm".to_string(), "-rf".to_string(), path.to_string()];
        self.cluster
            .exec(pod, &self.container, &command, None)
            .await?
            .into_result(pod)
            .map(|_| ())
    }

    async fn list(&self, pod: &str, dir: &str) -> ClusterResult<Vec<String>> {
        let script = format!("ls -1 {} 2>/dev/null || true", shell_quote(dir));
        let output = self
            .cluster
            .exec(pod, &self.container, &Self::sh(script), None)
            .await?
            .into_result(pod)?;
        Ok(output
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    async fn exec(&self, pod: &str, command: &[String]) -> ClusterResult<ExecOutput> {
        self.cluster.exec(pod, &self.container, command, None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{MemoryCluster, StatefulSetSpec};

    #[test]
    fn quotes_single_quotes() {
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn parent_of_paths() {
        assert_eq!(parent_dir("/workspace/private/a.txt"), "/workspace/private");
        assert_eq!(parent_dir("/a"), "/");
        assert_eq!(parent_dir("a"), ".");
    }

    #[tokio::test]
    async fn exec_fs_issues_shell_commands() {
        let cluster = Arc::new(MemoryCluster::new());
        cluster
            .create_stateful_set(&StatefulSetSpec {
                name: "sandbox-1-2".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        let fs = ExecFs::new(cluster.clone());

        fs.write("sandbox-1-2-0", "/workspace/private/it's.md", b"hello")
            .await
            .unwrap();
        fs.delete("sandbox-1-2-0", "/workspace/private/old")
            .await
            .unwrap();

        let log = cluster.exec_log();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].container, SANDBOX_CONTAINER);
        assert_eq!(
            log[0].command[2],
            r"mkdir -p '/workspace/private' && cat > '/workspace/private/it'\''s.md'"
        );
        assert_eq!(log[0].stdin.as_deref(), Some(&b"hello"[..]));
        assert_eq!(log[1].command, vec!["rm", "-rf", "/workspace/private/old"]);
    }

    #[tokio::test]
    async fn exec_fs_list_parses_lines() {
        let cluster = Arc::new(MemoryCluster::new());
        cluster
            .create_stateful_set(&StatefulSetSpec {
                name: "sandbox-1-2".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        cluster.set_exec_stdout("a.md\n\nb.md\n");
        let fs = ExecFs::new(cluster.clone());

        let names = fs.list("sandbox-1-2-0", "/root/.claude/commands").await.unwrap();
        assert_eq!(names, vec!["a.md", "b.md"]);
    }
}
