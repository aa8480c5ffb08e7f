//! Agent, skill and group data models.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use std::collections::BTreeMap;

use crate::provisioner::ResourceOverrides;

/// A user-owned agent definition.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Agent {
    pub id: i64,
    pub name: String,
    /// Owning user.
    pub created_by: i64,
    /// Agent-specific section of the instructions file.
    pub instructions: String,
    /// JSON object of free-form settings.
    pub config: String,
    pub cpu_request: Option<String>,
    pub cpu_limit: Option<String>,
    pub memory_request: Option<String>,
    pub memory_limit: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl Agent {
    /// Parsed config; malformed or non-object JSON yields an empty map.
    pub fn config_map(&self) -> BTreeMap<String, Value> {
        serde_json::from_str(&self.config).unwrap_or_default()
    }

    pub fn resource_overrides(&self) -> ResourceOverrides {
        ResourceOverrides {
            cpu_request: self.cpu_request.clone(),
            cpu_limit: self.cpu_limit.clone(),
            memory_request: self.memory_request.clone(),
            memory_limit: self.memory_limit.clone(),
        }
        .normalized()
    }
}

/// Request to create an agent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewAgent {
    pub name: String,
    pub created_by: i64,
    #[serde(default)]
    pub instructions: String,
    #[serde(default)]
    pub config: BTreeMap<String, Value>,
    #[serde(default)]
    pub resources: ResourceOverrides,
}

/// A prompt-defined command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Skill {
    pub id: i64,
    pub name: String,
    pub prompt: String,
    /// File stem of the command file.
    pub command_name: String,
    pub is_official: bool,
    pub is_public: bool,
    pub created_by: i64,
    pub group_id: Option<i64>,
    /// Bumped on every content change.
    pub version: i64,
    pub created_at: String,
    pub updated_at: String,
}

impl Skill {
    /// Official, public, owned, or shared with one of the user's groups.
    pub fn visible_to(&self, user_id: i64, user_groups: &[i64]) -> bool {
        self.is_official
            || self.is_public
            || self.created_by == user_id
            || self.group_id.is_some_and(|g| user_groups.contains(&g))
    }
}

/// Request to create a skill.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewSkill {
    pub name: String,
    pub prompt: String,
    pub command_name: String,
    pub created_by: i64,
    #[serde(default)]
    pub is_official: bool,
    #[serde(default)]
    pub is_public: bool,
    #[serde(default)]
    pub group_id: Option<i64>,
}

/// A skill installed on an agent, with its sync marker.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct InstalledSkill {
    pub agent_id: i64,
    pub sort_order: i64,
    /// Version last confirmed written into the sandbox; 0 when never synced.
    pub synced_version: i64,
    #[sqlx(flatten)]
    #[serde(flatten)]
    pub skill: Skill,
}

impl InstalledSkill {
    pub fn is_current(&self) -> bool {
        self.synced_version == self.skill.version
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Group {
    pub id: i64,
    pub name: String,
    /// Group section of the instructions file.
    pub instructions_template: String,
    pub created_at: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn skill() -> Skill {
        Skill {
            id: 1,
            name: "Review".to_string(),
            prompt: "Review the diff".to_string(),
            command_name: "review".to_string(),
            is_official: false,
            is_public: false,
            created_by: 10,
            group_id: Some(3),
            version: 2,
            created_at: String::new(),
            updated_at: String::new(),
        }
    }

    #[test]
    fn visibility_rules() {
        let s = skill();
        assert!(s.visible_to(10, &[]));
        assert!(s.visible_to(11, &[3]));
        assert!(!s.visible_to(11, &[4]));

        let public = Skill {
            is_public: true,
            ..skill()
        };
        assert!(public.visible_to(99, &[]));
    }

    #[test]
    fn config_map_tolerates_garbage() {
        let agent = Agent {
            id: 1,
            name: "a".to_string(),
            created_by: 1,
            instructions: String::new(),
            config: "not json".to_string(),
            cpu_request: Some(" ".to_string()),
            cpu_limit: None,
            memory_request: None,
            memory_limit: Some("8Gi".to_string()),
            created_at: String::new(),
            updated_at: String::new(),
        };
        assert!(agent.config_map().is_empty());
        let overrides = agent.resource_overrides();
        assert!(overrides.cpu_request.is_none());
        assert_eq!(overrides.memory_limit.as_deref(), Some("8Gi"));
    }
}
