//! sandboxd library
//!
//! Sandbox lifecycle and workspace/skill reconciliation engine: one persistent
//! sandbox per (user, agent), sessions bound to it, and the files and skills
//! mirrored into it from the object store and the database.

pub mod admin;
pub mod agent;
pub mod app;
pub mod cluster;
pub mod config;
pub mod db;
pub mod error;
pub mod maintenance;
pub mod pool;
pub mod provisioner;
pub mod pubsub;
pub mod sandbox_fs;
pub mod session;
pub mod settings;
pub mod skill;
pub mod storage;
pub mod workspace;

pub use app::{Engine, EngineConfig};
pub use config::AppConfig;
pub use error::{CoreError, CoreResult};
