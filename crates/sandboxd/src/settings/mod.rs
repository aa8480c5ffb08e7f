//! Settings module - system and per-user settings backed by the database.
//!
//! Values are JSON-encoded. The service layer resolves typed values with
//! configured fallbacks and validates resource limits on write.

mod repository;
mod service;

pub use repository::SettingsRepository;
pub use service::{
    KEY_AGENT_SYSTEM_INSTRUCTIONS, KEY_DEFAULT_CPU_LIMIT, KEY_DEFAULT_CPU_REQUEST,
    KEY_DEFAULT_MEMORY_LIMIT, KEY_DEFAULT_MEMORY_REQUEST, KEY_SANDBOX_IMAGE,
    KEY_SESSION_STALE_HOURS, KEY_SKILL_SYNC_INTERVAL, KEY_STORAGE, KEY_USER_RESOURCE_LIMITS,
    SettingsDefaults, SettingsService,
};
