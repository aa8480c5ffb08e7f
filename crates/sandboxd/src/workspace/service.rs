//! Workspace uploads and deletes with quota enforcement and sandbox fan-out.

use futures::Stream;
use log::{info, warn};
use sha2::{Digest, Sha256};
use std::sync::Arc;

use super::models::{
    NewWorkspaceFile, OutputAction, OutputEvent, Quota, QuotaScope, WorkspaceFile,
    WorkspaceTarget, file_name, sanitize_path,
};
use super::repository::WorkspaceRepository;
use super::sync::WorkspaceSync;
use crate::error::{CoreError, CoreResult};
use crate::pool::{BackgroundPool, Submission};
use crate::pubsub::{Hub, sandbox_topic};
use crate::storage::{ObjectStore, StorageProvider};

fn content_type_for(path: &str, given: &str) -> String {
    if given.trim().is_empty() {
        mime_guess::from_path(path)
            .first_or_octet_stream()
            .essence_str()
            .to_string()
    } else {
        given.to_string()
    }
}

pub struct WorkspaceService {
    files: WorkspaceRepository,
    storage: Arc<StorageProvider>,
    sync: Arc<WorkspaceSync>,
    pool: BackgroundPool,
    output_hub: Arc<Hub<OutputEvent>>,
}

impl WorkspaceService {
    pub fn new(
        files: WorkspaceRepository,
        storage: Arc<StorageProvider>,
        sync: Arc<WorkspaceSync>,
        pool: BackgroundPool,
        output_hub: Arc<Hub<OutputEvent>>,
    ) -> Self {
        Self {
            files,
            storage,
            sync,
            pool,
            output_hub,
        }
    }

    async fn store(&self) -> CoreResult<Arc<dyn ObjectStore>> {
        self.storage
            .client()
            .await
            .map_err(|e| CoreError::internal_from("object store unavailable", e))
    }

    fn rel_file_path(path: &str) -> CoreResult<String> {
        let rel = sanitize_path(path);
        if rel.is_empty() || rel.ends_with('/') {
            return Err(CoreError::validation("file path is required"));
        }
        Ok(rel)
    }

    pub async fn quota(&self, scope: QuotaScope) -> CoreResult<Quota> {
        Ok(self.files.quota(scope).await?)
    }

    /// Store a file, catalogue it, and queue the push into active sandboxes.
    ///
    /// Private and group uploads are checked against their quota before anything
    /// is written; a rejected upload leaves the store and catalog untouched.
    pub async fn upload(
        &self,
        uploader: i64,
        target: WorkspaceTarget,
        path: &str,
        data: &[u8],
        content_type: &str,
    ) -> CoreResult<WorkspaceFile> {
        let rel = Self::rel_file_path(path)?;
        let size = data.len() as i64;
        let scope = QuotaScope::for_target(&target);

        if let Some(scope) = scope {
            let quota = self.files.quota(scope).await?;
            if let Some(reason) = quota.check(size) {
                return Err(CoreError::quota_exceeded(reason));
            }
        }

        let key = target.object_key(&rel);
        let content_type = content_type_for(&rel, content_type);
        self.store()
            .await?
            .upload(&key, data, &content_type)
            .await
            .map_err(|e| CoreError::internal_from("failed to upload file", e))?;

        let (user_id, agent_id, group_id) = target.owner(uploader);
        let file = self
            .files
            .upsert_file(
                NewWorkspaceFile {
                    user_id,
                    agent_id,
                    group_id,
                    workspace_type: target.workspace_type(),
                    object_key: key,
                    file_path: rel.clone(),
                    content_type,
                    size_bytes: size,
                    checksum: hex::encode(Sha256::digest(data)),
                    is_directory: false,
                },
                scope,
            )
            .await?;

        info!("Uploaded {} ({} bytes)", file.object_key, size);
        self.queue_mirror(target, rel);
        Ok(file)
    }

    /// Delete a file, or a whole directory when `path` ends in `/`.
    pub async fn delete(&self, target: WorkspaceTarget, path: &str) -> CoreResult<u64> {
        let rel = sanitize_path(path);
        if rel.is_empty() {
            return Err(CoreError::validation("path is required"));
        }
        let key = target.object_key(&rel);
        let store = self.store().await?;
        let deleted = if rel.ends_with('/') {
            store.delete_prefix(&key).await
        } else {
            store.delete(&key).await
        };
        deleted.map_err(|e| CoreError::internal_from("failed to delete file", e))?;

        let removed = self
            .files
            .delete_files(&key, QuotaScope::for_target(&target))
            .await?;
        info!("Deleted {} ({} catalog rows)", key, removed);
        self.queue_mirror(target, rel);
        Ok(removed)
    }

    /// Queue the sandbox fan-out of one path. Uploads and deletes of the same
    /// path share a key, so they run in order and only the latest state is mirrored.
    fn queue_mirror(&self, target: WorkspaceTarget, rel: String) {
        let sync = self.sync.clone();
        let key = format!("workspace:{}", target.object_key(&rel));
        let submitted = self.pool.submit(key.clone(), async move {
            sync.mirror_path(&target, &rel).await;
        });
        if submitted == Submission::Rejected {
            warn!("Background pool full, sandboxes miss the change to {}", key);
        }
    }

    /// Record a file the sandbox wrote under its output directory.
    pub async fn ingest_output(
        &self,
        user_id: i64,
        agent_id: i64,
        path: &str,
        data: &[u8],
        content_type: &str,
    ) -> CoreResult<WorkspaceFile> {
        if user_id <= 0 || agent_id <= 0 {
            return Err(CoreError::validation("user_id and agent_id are required"));
        }
        let rel = Self::rel_file_path(path)?;
        let target = WorkspaceTarget::Output { user_id, agent_id };
        let key = target.object_key(&rel);
        let content_type = content_type_for(&rel, content_type);

        self.store()
            .await?
            .upload(&key, data, &content_type)
            .await
            .map_err(|e| CoreError::internal_from("failed to upload output file", e))?;
        let file = self
            .files
            .upsert_file(
                NewWorkspaceFile {
                    user_id,
                    agent_id,
                    group_id: None,
                    workspace_type: target.workspace_type(),
                    object_key: key,
                    file_path: rel.clone(),
                    content_type,
                    size_bytes: data.len() as i64,
                    checksum: hex::encode(Sha256::digest(data)),
                    is_directory: false,
                },
                None,
            )
            .await?;

        self.output_hub.publish(
            &sandbox_topic("output", user_id, agent_id),
            OutputEvent {
                action: OutputAction::Upload,
                name: file_name(&rel).to_string(),
                path: rel,
                size: file.size_bytes,
            },
        );
        Ok(file)
    }

    /// Forget an output file the sandbox deleted.
    pub async fn remove_output(&self, user_id: i64, agent_id: i64, path: &str) -> CoreResult<u64> {
        if user_id <= 0 || agent_id <= 0 {
            return Err(CoreError::validation("user_id and agent_id are required"));
        }
        let rel = sanitize_path(path);
        if rel.is_empty() {
            return Err(CoreError::validation("path is required"));
        }
        let target = WorkspaceTarget::Output { user_id, agent_id };
        let key = target.object_key(&rel);
        let store = self.store().await?;
        let deleted = if rel.ends_with('/') {
            store.delete_prefix(&key).await
        } else {
            store.delete(&key).await
        };
        if let Err(e) = deleted {
            warn!("Failed to delete output object {}: {}", key, e);
            return Err(CoreError::internal_from("failed to delete output file", e));
        }
        let removed = self.files.delete_files(&key, None).await?;

        self.output_hub.publish(
            &sandbox_topic("output", user_id, agent_id),
            OutputEvent {
                action: OutputAction::Delete,
                name: file_name(&rel).to_string(),
                path: rel,
                size: 0,
            },
        );
        Ok(removed)
    }

    /// Stream of output changes for one sandbox.
    pub fn subscribe_output(
        &self,
        user_id: i64,
        agent_id: i64,
    ) -> impl Stream<Item = OutputEvent> + Send + 'static + use<> {
        self.output_hub
            .subscribe(&sandbox_topic("output", user_id, agent_id))
    }
}
