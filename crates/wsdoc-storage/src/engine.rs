//! Document storage engine - lazy compaction, squash and rollback
//!
//! Writers only append update fragments to a document's pending log. The
//! first reader after a write pays for the merge: [`DocEngine::get_doc`]
//! folds the pending log into the stored snapshot under a per-document
//! lock, persists the result and clears the folded updates.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info, warn};
use wsdoc_core::{
    squash, DocLock, DocRecord, DocUpdate, HistoryQuery, KeyedLocker, MergeUpdates, YrsMerge,
};

use crate::{DocStorage, StorageError};

/// Engine error types
#[derive(Debug, thiserror::Error)]
pub enum DocError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Failed to merge updates: {0}")]
    Merge(String),

    #[error(transparent)]
    Backend(#[from] StorageError),
}

impl From<wsdoc_core::Error> for DocError {
    fn from(err: wsdoc_core::Error) -> Self {
        match err {
            wsdoc_core::Error::InvalidArgument(msg) => DocError::InvalidArgument(msg),
            wsdoc_core::Error::NotFound(msg) => DocError::NotFound(msg),
            wsdoc_core::Error::Merge(msg) => DocError::Merge(msg),
        }
    }
}

/// Result type alias for engine operations
pub type DocResult<T> = std::result::Result<T, DocError>;

/// Engine configuration
#[derive(Clone)]
pub struct DocStorageOptions {
    /// Merge function used when squashing a snapshot with its updates
    pub merge_updates: Arc<dyn MergeUpdates>,
}

impl DocStorageOptions {
    pub fn with_merge_updates(merge_updates: impl MergeUpdates + 'static) -> Self {
        Self {
            merge_updates: Arc::new(merge_updates),
        }
    }
}

impl Default for DocStorageOptions {
    fn default() -> Self {
        Self::with_merge_updates(YrsMerge)
    }
}

impl std::fmt::Debug for DocStorageOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocStorageOptions").finish_non_exhaustive()
    }
}

/// Lock namespace guarding compaction of a workspace's documents
pub fn update_lock_namespace(workspace_id: &str) -> String {
    format!("workspace:{}:update", workspace_id)
}

/// Storage engine over a [`DocStorage`] backend
pub struct DocEngine<S: ?Sized> {
    storage: Arc<S>,
    options: DocStorageOptions,
    locker: Arc<KeyedLocker>,
}

impl<S: DocStorage + ?Sized> DocEngine<S> {
    /// Create an engine with its own lock manager
    pub fn new(storage: Arc<S>, options: DocStorageOptions) -> Self {
        Self::with_locker(storage, options, Arc::new(KeyedLocker::new()))
    }

    /// Create an engine sharing a lock manager with other engines over the
    /// same backend
    pub fn with_locker(storage: Arc<S>, options: DocStorageOptions, locker: Arc<KeyedLocker>) -> Self {
        Self {
            storage,
            options,
            locker,
        }
    }

    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    pub fn locker(&self) -> &Arc<KeyedLocker> {
        &self.locker
    }

    /// Get the fully merged document, compacting pending updates first.
    ///
    /// Returns `None` when the document has neither a snapshot nor updates.
    pub async fn get_doc(&self, workspace_id: &str, doc_id: &str) -> DocResult<Option<DocRecord>> {
        let _lock = self.lock_doc_for_update(workspace_id, doc_id).await;
        self.compact(workspace_id, doc_id).await
    }

    /// Append updates to the document's pending log.
    ///
    /// Not locked: the backend makes appends atomic, and the next
    /// [`get_doc`](Self::get_doc) folds them in.
    pub async fn push_doc_updates(
        &self,
        workspace_id: &str,
        doc_id: &str,
        updates: Vec<DocUpdate>,
    ) -> DocResult<u64> {
        let count = updates.len();
        let version = self
            .storage
            .push_doc_updates(workspace_id, doc_id, updates)
            .await?;
        debug!(workspace_id, doc_id, count, version, "Pushed updates");
        Ok(version)
    }

    /// Restore the document to the history snapshot at `version`.
    ///
    /// Pending updates are folded first so the current head lands in history;
    /// the restored content is then written as a new snapshot one version
    /// past that head. Pushes are not locked, so the write only goes through
    /// if no update arrived since the fold; otherwise the new updates are
    /// folded as well and the restore is retried. Returns the new snapshot
    /// version.
    pub async fn rollback_doc(&self, workspace_id: &str, doc_id: &str, version: u64) -> DocResult<u64> {
        let _lock = self.lock_doc_for_update(workspace_id, doc_id).await;

        let target = self
            .storage
            .get_history_doc_snapshot(workspace_id, doc_id, version)
            .await?
            .ok_or_else(|| {
                DocError::NotFound(format!(
                    "Can not find version {} of {}/{} to roll back to",
                    version, workspace_id, doc_id
                ))
            })?;

        loop {
            let current = self.compact(workspace_id, doc_id).await?.ok_or_else(|| {
                DocError::NotFound(format!(
                    "Can not find the current version of {}/{}",
                    workspace_id, doc_id
                ))
            })?;

            let restored = self
                .storage
                .restore_doc_snapshot(workspace_id, doc_id, target.bin.clone(), current.version)
                .await?;

            match restored {
                Some(new_version) => {
                    info!(
                        workspace_id,
                        doc_id,
                        from = current.version,
                        to = version,
                        new_version,
                        "Rolled back document"
                    );
                    return Ok(new_version);
                }
                None => {
                    debug!(workspace_id, doc_id, head = current.version, "Head moved during rollback, folding again");
                }
            }
        }
    }

    /// Squash records in ascending version order with the configured merge
    /// function
    pub fn squash(&self, records: Vec<DocRecord>) -> DocResult<DocRecord> {
        Ok(squash(records, self.options.merge_updates.as_ref())?)
    }

    /// Delete a document. Waits for an in-flight compaction so it cannot
    /// write the snapshot back afterwards.
    pub async fn delete_doc(&self, workspace_id: &str, doc_id: &str) -> DocResult<bool> {
        let _lock = self.lock_doc_for_update(workspace_id, doc_id).await;
        let deleted = self.storage.delete_doc(workspace_id, doc_id).await?;
        if deleted {
            info!(workspace_id, doc_id, "Deleted document");
        }
        Ok(deleted)
    }

    /// Delete every document of a workspace.
    ///
    /// Takes no document locks: the backend does not enumerate a workspace's
    /// documents up front. A compaction running concurrently on one of them
    /// can still write its snapshot after the delete and revive that
    /// document; use [`delete_doc`](Self::delete_doc) where that matters.
    pub async fn delete_workspace(&self, workspace_id: &str) -> DocResult<()> {
        self.storage.delete_workspace(workspace_id).await?;
        info!(workspace_id, "Deleted workspace");
        Ok(())
    }

    pub async fn get_doc_versions(&self, workspace_id: &str) -> DocResult<Option<HashMap<String, u64>>> {
        Ok(self.storage.get_doc_versions(workspace_id).await?)
    }

    pub async fn list_doc_histories(
        &self,
        workspace_id: &str,
        doc_id: &str,
        query: HistoryQuery,
    ) -> DocResult<Vec<DocRecord>> {
        Ok(self
            .storage
            .list_doc_histories(workspace_id, doc_id, query)
            .await?)
    }

    pub async fn get_history_doc_snapshot(
        &self,
        workspace_id: &str,
        doc_id: &str,
        version: u64,
    ) -> DocResult<Option<DocRecord>> {
        Ok(self
            .storage
            .get_history_doc_snapshot(workspace_id, doc_id, version)
            .await?)
    }

    async fn lock_doc_for_update(&self, workspace_id: &str, doc_id: &str) -> DocLock {
        self.locker
            .lock(update_lock_namespace(workspace_id), doc_id)
            .await
    }

    /// Fold pending updates into the snapshot. Caller holds the doc lock.
    ///
    /// Another engine over the same backend without a shared locker may
    /// store a newer snapshot first; the fold is then redone on top of it.
    async fn compact(&self, workspace_id: &str, doc_id: &str) -> DocResult<Option<DocRecord>> {
        loop {
            let snapshot = self.storage.get_doc_snapshot(workspace_id, doc_id).await?;
            let mut updates = self
                .storage
                .get_doc_pending_updates(workspace_id, doc_id)
                .await?;

            let Some(tail) = updates.iter().map(|u| u.version).max() else {
                return Ok(snapshot);
            };
            updates.sort_by_key(|u| u.version);

            // Updates at or below the snapshot version are already folded into it.
            if let Some(base) = snapshot.as_ref().map(|s| s.version) {
                let stale = updates.iter().take_while(|u| u.version <= base).count();
                if stale > 0 {
                    warn!(workspace_id, doc_id, stale, base, "Skipping updates already in snapshot");
                    updates.drain(..stale);
                }
                if updates.is_empty() {
                    self.storage
                        .mark_updates_merged(workspace_id, doc_id, tail)
                        .await?;
                    return Ok(snapshot);
                }
            }

            let folded = updates.len();
            let records: Vec<DocRecord> = snapshot.into_iter().chain(updates).collect();
            let squashed = self.squash(records)?;

            if self.storage.set_doc_snapshot(&squashed).await? {
                self.storage
                    .mark_updates_merged(workspace_id, doc_id, squashed.version)
                    .await?;
                debug!(workspace_id, doc_id, folded, version = squashed.version, "Compacted document");
                return Ok(Some(squashed));
            }

            debug!(workspace_id, doc_id, version = squashed.version, "Newer snapshot stored concurrently, folding again");
        }
    }
}

impl<S: ?Sized> std::fmt::Debug for DocEngine<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocEngine")
            .field("options", &self.options)
            .field("locks", &self.locker.len())
            .finish()
    }
}
