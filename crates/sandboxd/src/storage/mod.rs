//! Object storage abstraction layer.
//!
//! Workspace files live in an [`ObjectStore`] keyed by namespace prefixes.
//! [`LocalObjectStore`] keeps objects on the local filesystem; the
//! [`StorageProvider`] picks the backend from settings and caches the client.

mod error;
mod local;
mod provider;
mod traits;

pub use error::{StorageError, StorageResult};
pub use local::LocalObjectStore;
pub use provider::{StorageBackendConfig, StorageProvider};
pub use traits::{DEFAULT_MAX_KEYS, ObjectInfo, ObjectStore};
