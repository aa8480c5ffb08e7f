//! Agents, skills and groups.
//!
//! These records are owned by the surrounding platform; the engine reads them to
//! configure sandboxes and keeps the install table's sync markers current.

mod models;
mod repository;

pub use models::{Agent, Group, InstalledSkill, NewAgent, NewSkill, Skill};
pub use repository::AgentRepository;
