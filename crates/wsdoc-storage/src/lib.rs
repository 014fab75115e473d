//! wsdoc Storage - the document storage engine and its backends
//!
//! [`DocEngine`] keeps every document readable as one merged snapshot while
//! writers only append update fragments. Persistence is delegated to a
//! [`DocStorage`] backend:
//! - Memory (default): Fast, volatile storage
//! - SQLite: Embedded persistence

pub mod engine;
#[cfg(feature = "memory")]
pub mod memory;
#[cfg(feature = "sqlite")]
pub mod sqlite;

use std::collections::HashMap;

use async_trait::async_trait;
use wsdoc_core::{DocRecord, DocUpdate, HistoryQuery};

/// Persistence primitives a document storage backend provides.
///
/// Per document a backend keeps the current snapshot, an ordered log of
/// pending updates not yet folded into it, and an append-only history of
/// replaced snapshots addressed by version.
#[async_trait]
pub trait DocStorage: Send + Sync {
    /// Append updates to the pending log, returning the new latest version.
    ///
    /// Versions are allocated atomically per document and are strictly
    /// greater than both the snapshot version and the pending log tail.
    async fn push_doc_updates(
        &self,
        workspace_id: &str,
        doc_id: &str,
        updates: Vec<DocUpdate>,
    ) -> Result<u64, StorageError>;

    /// Delete a document's snapshot, pending log and history
    async fn delete_doc(&self, workspace_id: &str, doc_id: &str) -> Result<bool, StorageError>;

    /// Delete every document of a workspace
    async fn delete_workspace(&self, workspace_id: &str) -> Result<(), StorageError>;

    /// Head version (the highest of snapshot and pending log) of every
    /// document in a workspace, `None` if the workspace is unknown
    async fn get_doc_versions(
        &self,
        workspace_id: &str,
    ) -> Result<Option<HashMap<String, u64>>, StorageError>;

    /// Historical snapshots, newest first
    async fn list_doc_histories(
        &self,
        workspace_id: &str,
        doc_id: &str,
        query: HistoryQuery,
    ) -> Result<Vec<DocRecord>, StorageError>;

    async fn get_history_doc_snapshot(
        &self,
        workspace_id: &str,
        doc_id: &str,
        version: u64,
    ) -> Result<Option<DocRecord>, StorageError>;

    async fn get_doc_snapshot(
        &self,
        workspace_id: &str,
        doc_id: &str,
    ) -> Result<Option<DocRecord>, StorageError>;

    /// Replace the current snapshot.
    ///
    /// Only writes when `snapshot.version` is newer than the stored one and
    /// returns whether it did. The replaced snapshot is appended to history.
    async fn set_doc_snapshot(&self, snapshot: &DocRecord) -> Result<bool, StorageError>;

    /// Replace the current snapshot's payload with `bin` at one version past
    /// the document's head, moving the replaced snapshot to history.
    ///
    /// The head check and the write share the atomicity of
    /// [`push_doc_updates`](Self::push_doc_updates): nothing is written and
    /// `None` is returned unless the snapshot is at `expected_head` and no
    /// update has been pushed past it. Returns the new snapshot version
    /// otherwise.
    async fn restore_doc_snapshot(
        &self,
        workspace_id: &str,
        doc_id: &str,
        bin: Vec<u8>,
        expected_head: u64,
    ) -> Result<Option<u64>, StorageError>;

    /// Pending updates in ascending version order
    async fn get_doc_pending_updates(
        &self,
        workspace_id: &str,
        doc_id: &str,
    ) -> Result<Vec<DocRecord>, StorageError>;

    /// Drop pending updates with a version up to and including `version`,
    /// returning how many were removed
    async fn mark_updates_merged(
        &self,
        workspace_id: &str,
        doc_id: &str,
        version: u64,
    ) -> Result<usize, StorageError>;
}

/// Storage error types
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Connection error: {0}")]
    Connection(String),
}

pub use engine::{update_lock_namespace, DocEngine, DocError, DocResult, DocStorageOptions};
#[cfg(feature = "memory")]
pub use memory::MemoryStorage;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStorage;
