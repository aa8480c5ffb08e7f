//! Workspace namespaces, catalog rows and sync reports.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

pub const PRIVATE_DIR: &str = "/workspace/private";
pub const COMMANDS_DIR: &str = "/root/.claude/commands";
pub const PUBLIC_DIR: &str = "/workspace/public";
pub const GROUP_ROOT_DIR: &str = "/workspace/group";
pub const SHARED_DIR: &str = "/workspace/shared";
pub const OUTPUT_DIR: &str = "/workspace/output";
pub const INSTRUCTIONS_PATH: &str = "/workspace/CLAUDE.md";

/// Sub-prefix of the private namespace holding command files.
pub const COMMANDS_SUBDIR: &str = "claude-commands/";
/// Sub-prefix of the private namespace holding output files.
pub const OUTPUT_SUBDIR: &str = "output/";

/// Objects above this size are not copied into sandboxes.
pub const MAX_SYNC_FILE_SIZE: u64 = 50 << 20;

pub const DEFAULT_MAX_BYTES: i64 = 1 << 30;
pub const DEFAULT_MAX_FILE_COUNT: i64 = 1000;

/// Workspace namespace tag stored on catalog rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkspaceType {
    Private,
    Public,
    Group,
    Shared,
    Output,
}

impl WorkspaceType {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkspaceType::Private => "private",
            WorkspaceType::Public => "public",
            WorkspaceType::Group => "group",
            WorkspaceType::Shared => "shared",
            WorkspaceType::Output => "output",
        }
    }
}

impl std::fmt::Display for WorkspaceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for WorkspaceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "private" => Ok(WorkspaceType::Private),
            "public" => Ok(WorkspaceType::Public),
            "group" => Ok(WorkspaceType::Group),
            "shared" => Ok(WorkspaceType::Shared),
            "output" => Ok(WorkspaceType::Output),
            _ => Err(format!("unknown workspace type: {}", s)),
        }
    }
}

impl TryFrom<String> for WorkspaceType {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// A concrete workspace: namespace plus owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WorkspaceTarget {
    Private { user_id: i64, agent_id: i64 },
    Public,
    Group { group_id: i64 },
    Shared,
    Output { user_id: i64, agent_id: i64 },
}

impl WorkspaceTarget {
    pub fn workspace_type(&self) -> WorkspaceType {
        match self {
            WorkspaceTarget::Private { .. } => WorkspaceType::Private,
            WorkspaceTarget::Public => WorkspaceType::Public,
            WorkspaceTarget::Group { .. } => WorkspaceType::Group,
            WorkspaceTarget::Shared => WorkspaceType::Shared,
            WorkspaceTarget::Output { .. } => WorkspaceType::Output,
        }
    }

    /// Object store prefix, always ending in `/`.
    pub fn object_prefix(&self) -> String {
        match self {
            WorkspaceTarget::Private { user_id, agent_id } => {
                format!("users/{user_id}/agents/{agent_id}/")
            }
            WorkspaceTarget::Public => "public/".to_string(),
            WorkspaceTarget::Group { group_id } => format!("groups/{group_id}/"),
            WorkspaceTarget::Shared => "shared/".to_string(),
            WorkspaceTarget::Output { user_id, agent_id } => {
                format!("users/{user_id}/agents/{agent_id}/{OUTPUT_SUBDIR}")
            }
        }
    }

    /// Directory the namespace is mirrored to inside a sandbox.
    pub fn sandbox_dir(&self) -> String {
        match self {
            WorkspaceTarget::Private { .. } => PRIVATE_DIR.to_string(),
            WorkspaceTarget::Public => PUBLIC_DIR.to_string(),
            WorkspaceTarget::Group { group_id } => format!("{GROUP_ROOT_DIR}/{group_id}"),
            WorkspaceTarget::Shared => SHARED_DIR.to_string(),
            WorkspaceTarget::Output { .. } => OUTPUT_DIR.to_string(),
        }
    }

    /// Sandbox path of a file in this workspace. Private command files map to the
    /// command directory.
    pub fn sandbox_path(&self, rel_path: &str) -> String {
        if let WorkspaceTarget::Private { .. } = self
            && let Some(command) = rel_path.strip_prefix(COMMANDS_SUBDIR)
        {
            return format!("{COMMANDS_DIR}/{command}");
        }
        format!("{}/{}", self.sandbox_dir(), rel_path)
    }

    /// Public and shared workspaces are read-only inside sandboxes.
    pub fn read_only(&self) -> bool {
        matches!(self, WorkspaceTarget::Public | WorkspaceTarget::Shared)
    }

    pub fn object_key(&self, rel_path: &str) -> String {
        format!("{}{}", self.object_prefix(), rel_path)
    }

    /// Owner columns of catalog rows in this workspace.
    pub(crate) fn owner(&self, uploader: i64) -> (i64, i64, Option<i64>) {
        match *self {
            WorkspaceTarget::Private { user_id, agent_id }
            | WorkspaceTarget::Output { user_id, agent_id } => (user_id, agent_id, None),
            WorkspaceTarget::Group { group_id } => (uploader, 0, Some(group_id)),
            WorkspaceTarget::Public | WorkspaceTarget::Shared => (uploader, 0, None),
        }
    }
}

/// Clean a client-supplied relative path.
///
/// Trims whitespace, strips leading slashes, drops `.` and `..` segments and
/// collapses repeated slashes. A trailing slash (directory) is kept.
pub fn sanitize_path(path: &str) -> String {
    let trimmed = path.trim();
    let is_dir = trimmed.ends_with('/');
    let cleaned = trimmed
        .split('/')
        .filter(|seg| !seg.is_empty() && *seg != "." && *seg != "..")
        .collect::<Vec<_>>()
        .join("/");
    if is_dir && !cleaned.is_empty() {
        format!("{cleaned}/")
    } else {
        cleaned
    }
}

/// Final path component.
pub fn file_name(path: &str) -> &str {
    path.trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(path)
}

/// Catalog entry for a stored object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct WorkspaceFile {
    pub id: i64,
    pub user_id: i64,
    pub agent_id: i64,
    pub group_id: Option<i64>,
    #[sqlx(try_from = "String")]
    pub workspace_type: WorkspaceType,
    pub object_key: String,
    pub file_name: String,
    /// Path relative to the namespace root.
    pub file_path: String,
    pub content_type: String,
    pub size_bytes: i64,
    /// SHA-256 hex.
    pub checksum: String,
    pub is_directory: bool,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone)]
pub struct NewWorkspaceFile {
    pub user_id: i64,
    pub agent_id: i64,
    pub group_id: Option<i64>,
    pub workspace_type: WorkspaceType,
    pub object_key: String,
    pub file_path: String,
    pub content_type: String,
    pub size_bytes: i64,
    pub checksum: String,
    pub is_directory: bool,
}

/// Usage against a byte and file-count ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Quota {
    pub used_bytes: i64,
    pub max_bytes: i64,
    pub file_count: i64,
    pub max_file_count: i64,
}

impl Quota {
    /// Describe why adding a file of `size` bytes would exceed the quota.
    pub fn check(&self, size: i64) -> Option<String> {
        if self.used_bytes + size > self.max_bytes {
            Some(format!(
                "quota exceeded: used {} + file {} > max {}",
                self.used_bytes, size, self.max_bytes
            ))
        } else if self.file_count >= self.max_file_count {
            Some(format!(
                "file count limit exceeded: {}/{}",
                self.file_count, self.max_file_count
            ))
        } else {
            None
        }
    }
}

/// Ceilings for newly created quota rows.
#[derive(Debug, Clone, Copy)]
pub struct QuotaDefaults {
    pub max_bytes: i64,
    pub max_file_count: i64,
}

impl Default for QuotaDefaults {
    fn default() -> Self {
        Self {
            max_bytes: DEFAULT_MAX_BYTES,
            max_file_count: DEFAULT_MAX_FILE_COUNT,
        }
    }
}

/// Which quota row a workspace mutation is accounted against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaScope {
    Agent { user_id: i64, agent_id: i64 },
    Group { group_id: i64 },
}

impl QuotaScope {
    pub fn for_target(target: &WorkspaceTarget) -> Option<Self> {
        match *target {
            WorkspaceTarget::Private { user_id, agent_id } => {
                Some(QuotaScope::Agent { user_id, agent_id })
            }
            WorkspaceTarget::Group { group_id } => Some(QuotaScope::Group { group_id }),
            _ => None,
        }
    }
}

/// Outcome of a full sync or restore.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    pub synced: usize,
    pub skipped: usize,
    pub failed: usize,
    pub total: usize,
}

impl SyncReport {
    pub fn merge(&mut self, other: SyncReport) {
        self.synced += other.synced;
        self.skipped += other.skipped;
        self.failed += other.failed;
        self.total += other.total;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncProgress {
    pub synced: usize,
    pub total: usize,
    pub current_file: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputAction {
    Upload,
    Delete,
}

/// A change in a sandbox's output workspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputEvent {
    pub action: OutputAction,
    pub path: String,
    pub name: String,
    pub size: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_examples() {
        assert_eq!(sanitize_path("  /docs/a.txt "), "docs/a.txt");
        assert_eq!(sanitize_path("../../etc/passwd"), "etc/passwd");
        assert_eq!(sanitize_path("a//b/../c"), "a/b/c");
        assert_eq!(sanitize_path("reports/"), "reports/");
        assert_eq!(sanitize_path("/"), "");
        assert_eq!(sanitize_path(".."), "");
    }

    #[test]
    fn namespace_table() {
        let private = WorkspaceTarget::Private {
            user_id: 1,
            agent_id: 2,
        };
        assert_eq!(private.object_prefix(), "users/1/agents/2/");
        assert_eq!(private.sandbox_path("notes/a.md"), "/workspace/private/notes/a.md");
        assert_eq!(
            private.sandbox_path("claude-commands/review.md"),
            "/root/.claude/commands/review.md"
        );

        let group = WorkspaceTarget::Group { group_id: 7 };
        assert_eq!(group.object_key("x.csv"), "groups/7/x.csv");
        assert_eq!(group.sandbox_path("x.csv"), "/workspace/group/7/x.csv");

        let output = WorkspaceTarget::Output {
            user_id: 1,
            agent_id: 2,
        };
        assert_eq!(output.object_prefix(), "users/1/agents/2/output/");
        assert_eq!(output.sandbox_path("chart.png"), "/workspace/output/chart.png");

        assert!(WorkspaceTarget::Shared.read_only());
        assert!(!group.read_only());
    }

    #[test]
    fn quota_checks_bytes_before_count() {
        let quota = Quota {
            used_bytes: 10,
            max_bytes: 12,
            file_count: 5,
            max_file_count: 5,
        };
        assert!(quota.check(5).unwrap().starts_with("quota exceeded"));
        assert!(quota.check(1).unwrap().starts_with("file count limit exceeded"));
        let roomy = Quota {
            file_count: 0,
            ..quota
        };
        assert_eq!(roomy.check(2), None);
    }

    #[test]
    fn file_names() {
        assert_eq!(file_name("a/b/c.txt"), "c.txt");
        assert_eq!(file_name("dir/sub/"), "sub");
        assert_eq!(file_name("top"), "top");
    }
}
