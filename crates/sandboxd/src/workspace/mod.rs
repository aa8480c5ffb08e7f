//! Workspace synchronizer.
//!
//! | namespace | object prefix                          | sandbox path             |
//! |-----------|----------------------------------------|--------------------------|
//! | private   | `users/{u}/agents/{a}/`                | `/workspace/private`     |
//! | commands  | `users/{u}/agents/{a}/claude-commands/`| `/root/.claude/commands` |
//! | public    | `public/`                              | `/workspace/public`      |
//! | group     | `groups/{g}/`                          | `/workspace/group/{g}`   |
//! | shared    | `shared/`                              | `/workspace/shared`      |
//! | output    | `users/{u}/agents/{a}/output/`         | `/workspace/output`      |
//!
//! Output is the only namespace that flows sandbox to store.

mod models;
mod repository;
mod service;
mod sync;

pub use models::{
    COMMANDS_DIR, COMMANDS_SUBDIR, DEFAULT_MAX_BYTES, DEFAULT_MAX_FILE_COUNT, GROUP_ROOT_DIR,
    INSTRUCTIONS_PATH, MAX_SYNC_FILE_SIZE, NewWorkspaceFile, OUTPUT_DIR, OUTPUT_SUBDIR,
    OutputAction, OutputEvent, PRIVATE_DIR, PUBLIC_DIR, Quota, QuotaDefaults, QuotaScope,
    SHARED_DIR, SyncProgress, SyncReport, WorkspaceFile, WorkspaceTarget, WorkspaceType,
    file_name, sanitize_path,
};
pub use repository::WorkspaceRepository;
pub use service::WorkspaceService;
pub use sync::{INSTRUCTIONS_SEPARATOR, WorkspaceSync, compose_instructions};
