//! Deterministic names and labels for sandbox workloads.

use std::collections::BTreeMap;

pub const LABEL_APP: &str = "app";
pub const LABEL_USER_ID: &str = "user-id";
pub const LABEL_AGENT_ID: &str = "agent-id";

/// Identifies one sandbox: the (user, agent) pair it belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SandboxKey {
    pub user_id: i64,
    pub agent_id: i64,
}

impl SandboxKey {
    pub fn new(user_id: i64, agent_id: i64) -> Self {
        Self { user_id, agent_id }
    }

    /// Recover the key from workload labels.
    pub fn from_labels(labels: &BTreeMap<String, String>) -> Option<Self> {
        let user_id = labels.get(LABEL_USER_ID)?.parse().ok()?;
        let agent_id = labels.get(LABEL_AGENT_ID)?.parse().ok()?;
        Some(Self { user_id, agent_id })
    }
}

impl std::fmt::Display for SandboxKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.user_id, self.agent_id)
    }
}

/// Naming scheme for one deployment, parameterized by the workload prefix.
#[derive(Debug, Clone)]
pub struct Naming {
    prefix: String,
}

impl Naming {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// `{prefix}-{user}-{agent}`, shared by the stateful set and its headless service.
    pub fn workload(&self, key: SandboxKey) -> String {
        format!("{}-{}-{}", self.prefix, key.user_id, key.agent_id)
    }

    /// The single pod of the workload.
    pub fn pod(&self, key: SandboxKey) -> String {
        format!("{}-0", self.workload(key))
    }

    pub fn labels(&self, key: SandboxKey) -> BTreeMap<String, String> {
        BTreeMap::from([
            (LABEL_APP.to_string(), self.prefix.clone()),
            (LABEL_USER_ID.to_string(), key.user_id.to_string()),
            (LABEL_AGENT_ID.to_string(), key.agent_id.to_string()),
        ])
    }

    /// Selector matching every sandbox workload of this deployment.
    pub fn fleet_selector(&self) -> String {
        format!("{}={}", LABEL_APP, self.prefix)
    }
}

impl Default for Naming {
    fn default() -> Self {
        Self::new("sandbox")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_deterministic() {
        let naming = Naming::default();
        let key = SandboxKey::new(7, 42);
        assert_eq!(naming.workload(key), "sandbox-7-42");
        assert_eq!(naming.pod(key), "sandbox-7-42-0");
        assert_eq!(naming.fleet_selector(), "app=sandbox");
    }

    #[test]
    fn key_round_trips_through_labels() {
        let naming = Naming::new("agents");
        let key = SandboxKey::new(3, 9);
        let labels = naming.labels(key);
        assert_eq!(labels["app"], "agents");
        assert_eq!(SandboxKey::from_labels(&labels), Some(key));
        assert_eq!(SandboxKey::from_labels(&BTreeMap::new()), None);
    }
}
