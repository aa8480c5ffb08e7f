//! Skill synchronizer.
//!
//! Installed skills become `{command_name}.md` files under the sandbox's
//! command directory. Progress is published on topic `skills:{u}:{a}`.

mod naming;
mod service;
mod sync;

pub use naming::{
    MAX_FORK_SUFFIX, command_file, fork_command_candidates, fork_name, sanitize_command_name,
};
pub use service::SkillService;
pub use sync::{SkillSync, SkillSyncEvent, SkillSyncReport, SyncAction, SyncStep};
