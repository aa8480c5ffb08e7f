//! Agent, skill and group repository.

use anyhow::{Context, Result, anyhow};
use sqlx::SqlitePool;
use tracing::{debug, instrument};

use super::models::{Agent, Group, InstalledSkill, NewAgent, NewSkill, Skill};
use crate::db::now_timestamp;

const AGENT_COLUMNS: &str = "id, name, created_by, instructions, config, cpu_request, cpu_limit, \
                             memory_request, memory_limit, created_at, updated_at";

const SKILL_COLUMNS: &str = "id, name, prompt, command_name, is_official, is_public, created_by, \
                             group_id, version, created_at, updated_at";

#[derive(Debug, Clone)]
pub struct AgentRepository {
    pool: SqlitePool,
}

impl AgentRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    #[instrument(skip(self, request), fields(name = %request.name))]
    pub async fn create_agent(&self, request: NewAgent) -> Result<Agent> {
        let now = now_timestamp();
        let config = serde_json::to_string(&request.config).context("Failed to encode config")?;
        let res = request.resources.normalized();
        let id = sqlx::query(
            r#"
            INSERT INTO agents (name, created_by, instructions, config, cpu_request, cpu_limit,
                                memory_request, memory_limit, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&request.name)
        .bind(request.created_by)
        .bind(&request.instructions)
        .bind(&config)
        .bind(&res.cpu_request)
        .bind(&res.cpu_limit)
        .bind(&res.memory_request)
        .bind(&res.memory_limit)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await
        .context("Failed to insert agent")?
        .last_insert_rowid();

        debug!("Created agent {}", id);
        self.get_agent(id)
            .await?
            .ok_or_else(|| anyhow!("Agent not found after creation"))
    }

    #[instrument(skip(self))]
    pub async fn get_agent(&self, id: i64) -> Result<Option<Agent>> {
        let agent = sqlx::query_as::<_, Agent>(&format!(
            "SELECT {AGENT_COLUMNS} FROM agents WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch agent")?;
        Ok(agent)
    }

    pub async fn delete_agent(&self, id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM agents WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to delete agent")?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self, request), fields(command = %request.command_name))]
    pub async fn create_skill(&self, request: NewSkill) -> Result<Skill> {
        let now = now_timestamp();
        let id = sqlx::query(
            r#"
            INSERT INTO skills (name, prompt, command_name, is_official, is_public, created_by,
                                group_id, version, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, 1, ?, ?)
            "#,
        )
        .bind(&request.name)
        .bind(&request.prompt)
        .bind(&request.command_name)
        .bind(request.is_official)
        .bind(request.is_public)
        .bind(request.created_by)
        .bind(request.group_id)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await
        .context("Failed to insert skill")?
        .last_insert_rowid();

        self.get_skill(id)
            .await?
            .ok_or_else(|| anyhow!("Skill not found after creation"))
    }

    #[instrument(skip(self))]
    pub async fn get_skill(&self, id: i64) -> Result<Option<Skill>> {
        let skill = sqlx::query_as::<_, Skill>(&format!(
            "SELECT {SKILL_COLUMNS} FROM skills WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch skill")?;
        Ok(skill)
    }

    /// Replace a skill's prompt and bump its version.
    pub async fn update_skill_prompt(&self, id: i64, prompt: &str) -> Result<Skill> {
        sqlx::query(
            "UPDATE skills SET prompt = ?, version = version + 1, updated_at = ? WHERE id = ?",
        )
        .bind(prompt)
        .bind(now_timestamp())
        .bind(id)
        .execute(&self.pool)
        .await
        .context("Failed to update skill")?;
        self.get_skill(id)
            .await?
            .ok_or_else(|| anyhow!("Skill {} not found", id))
    }

    /// Change visibility flags, e.g. when an author unpublishes a skill.
    pub async fn set_skill_visibility(
        &self,
        id: i64,
        is_public: bool,
        group_id: Option<i64>,
    ) -> Result<()> {
        sqlx::query("UPDATE skills SET is_public = ?, group_id = ?, updated_at = ? WHERE id = ?")
            .bind(is_public)
            .bind(group_id)
            .bind(now_timestamp())
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to update skill visibility")?;
        Ok(())
    }

    pub async fn command_name_taken(&self, owner: i64, command_name: &str) -> Result<bool> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM skills WHERE created_by = ? AND command_name = ?",
        )
        .bind(owner)
        .bind(command_name)
        .fetch_one(&self.pool)
        .await
        .context("Failed to check command name")?;
        Ok(count > 0)
    }

    /// Install a skill on an agent at the end of its list. Returns false if already installed.
    #[instrument(skip(self))]
    pub async fn install_skill(&self, agent_id: i64, skill_id: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO agent_skills (agent_id, skill_id, sort_order, synced_version, created_at)
            SELECT ?, ?, COALESCE(MAX(sort_order), -1) + 1, 0, ?
            FROM agent_skills WHERE agent_id = ?
            ON CONFLICT(agent_id, skill_id) DO NOTHING
            "#,
        )
        .bind(agent_id)
        .bind(skill_id)
        .bind(now_timestamp())
        .bind(agent_id)
        .execute(&self.pool)
        .await
        .context("Failed to install skill")?;
        Ok(result.rows_affected() > 0)
    }

    /// Returns false if the skill was not installed.
    pub async fn uninstall_skill(&self, agent_id: i64, skill_id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM agent_skills WHERE agent_id = ? AND skill_id = ?")
            .bind(agent_id)
            .bind(skill_id)
            .execute(&self.pool)
            .await
            .context("Failed to uninstall skill")?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn installed_skills(&self, agent_id: i64) -> Result<Vec<InstalledSkill>> {
        let skills = sqlx::query_as::<_, InstalledSkill>(
            r#"
            SELECT a.agent_id, a.sort_order, a.synced_version,
                   s.id, s.name, s.prompt, s.command_name, s.is_official, s.is_public,
                   s.created_by, s.group_id, s.version, s.created_at, s.updated_at
            FROM agent_skills a
            JOIN skills s ON s.id = a.skill_id
            WHERE a.agent_id = ?
            ORDER BY a.sort_order, s.id
            "#,
        )
        .bind(agent_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list installed skills")?;
        Ok(skills)
    }

    pub async fn set_synced_version(&self, agent_id: i64, skill_id: i64, version: i64) -> Result<()> {
        sqlx::query(
            "UPDATE agent_skills SET synced_version = ? WHERE agent_id = ? AND skill_id = ?",
        )
        .bind(version)
        .bind(agent_id)
        .bind(skill_id)
        .execute(&self.pool)
        .await
        .context("Failed to update synced version")?;
        Ok(())
    }

    pub async fn create_group(&self, name: &str, instructions_template: &str) -> Result<Group> {
        let now = now_timestamp();
        let id = sqlx::query(
            "INSERT INTO user_groups (name, instructions_template, created_at) VALUES (?, ?, ?)",
        )
        .bind(name)
        .bind(instructions_template)
        .bind(&now)
        .execute(&self.pool)
        .await
        .context("Failed to insert group")?
        .last_insert_rowid();
        Ok(Group {
            id,
            name: name.to_string(),
            instructions_template: instructions_template.to_string(),
            created_at: now,
        })
    }

    pub async fn add_group_member(&self, group_id: i64, user_id: i64, role: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO group_members (group_id, user_id, role) VALUES (?, ?, ?)
            ON CONFLICT(group_id, user_id) DO UPDATE SET role = excluded.role
            "#,
        )
        .bind(group_id)
        .bind(user_id)
        .bind(role)
        .execute(&self.pool)
        .await
        .context("Failed to add group member")?;
        Ok(())
    }

    pub async fn remove_group_member(&self, group_id: i64, user_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM group_members WHERE group_id = ? AND user_id = ?")
            .bind(group_id)
            .bind(user_id)
            .execute(&self.pool)
            .await
            .context("Failed to remove group member")?;
        Ok(())
    }

    pub async fn user_group_ids(&self, user_id: i64) -> Result<Vec<i64>> {
        let ids = sqlx::query_scalar(
            "SELECT group_id FROM group_members WHERE user_id = ? ORDER BY group_id",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list user groups")?;
        Ok(ids)
    }

    pub async fn group_member_ids(&self, group_id: i64) -> Result<Vec<i64>> {
        let ids = sqlx::query_scalar(
            "SELECT user_id FROM group_members WHERE group_id = ? ORDER BY user_id",
        )
        .bind(group_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list group members")?;
        Ok(ids)
    }

    /// Non-empty instruction templates of the user's groups, ordered by group name.
    pub async fn user_group_templates(&self, user_id: i64) -> Result<Vec<String>> {
        let templates = sqlx::query_scalar(
            r#"
            SELECT g.instructions_template
            FROM user_groups g
            JOIN group_members m ON m.group_id = g.id
            WHERE m.user_id = ? AND TRIM(g.instructions_template) != ''
            ORDER BY g.name
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list group templates")?;
        Ok(templates)
    }
}
