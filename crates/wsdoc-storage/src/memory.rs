//! In-memory storage backend

use std::collections::{BTreeMap, HashMap};

use crate::{DocStorage, StorageError};
use async_trait::async_trait;
use dashmap::DashMap;
use wsdoc_core::{DocRecord, DocUpdate, HistoryQuery};

/// Everything stored for one document
#[derive(Debug, Default)]
struct DocEntry {
    snapshot: Option<DocRecord>,
    /// Ascending by version
    pending: Vec<DocRecord>,
    history: BTreeMap<u64, DocRecord>,
}

impl DocEntry {
    fn head(&self) -> u64 {
        let snapshot = self.snapshot.as_ref().map_or(0, |s| s.version);
        let pending = self.pending.last().map_or(0, |u| u.version);
        snapshot.max(pending)
    }

    /// Whether the document has a current state to report a head for
    fn is_live(&self) -> bool {
        self.snapshot.is_some() || !self.pending.is_empty()
    }
}

/// In-memory storage backend
///
/// Fast, volatile storage suitable for development and tests.
/// Data is lost when the process exits.
pub struct MemoryStorage {
    /// (workspace_id, doc_id) -> document state
    docs: DashMap<(String, String), DocEntry>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self {
            docs: DashMap::new(),
        }
    }

    fn key(workspace_id: &str, doc_id: &str) -> (String, String) {
        (workspace_id.to_string(), doc_id.to_string())
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DocStorage for MemoryStorage {
    async fn push_doc_updates(
        &self,
        workspace_id: &str,
        doc_id: &str,
        updates: Vec<DocUpdate>,
    ) -> Result<u64, StorageError> {
        let key = Self::key(workspace_id, doc_id);

        if updates.is_empty() {
            return Ok(self.docs.get(&key).map_or(0, |entry| entry.head()));
        }

        // The entry guard holds the shard lock, so allocation and append are atomic.
        let mut entry = self.docs.entry(key).or_default();
        let mut version = entry.head();
        for update in updates {
            version += 1;
            entry.pending.push(DocRecord {
                workspace_id: workspace_id.to_string(),
                doc_id: doc_id.to_string(),
                bin: update.bin,
                version,
            });
        }

        Ok(version)
    }

    async fn delete_doc(&self, workspace_id: &str, doc_id: &str) -> Result<bool, StorageError> {
        Ok(self.docs.remove(&Self::key(workspace_id, doc_id)).is_some())
    }

    async fn delete_workspace(&self, workspace_id: &str) -> Result<(), StorageError> {
        self.docs.retain(|(ws, _), _| ws != workspace_id);
        Ok(())
    }

    async fn get_doc_versions(
        &self,
        workspace_id: &str,
    ) -> Result<Option<HashMap<String, u64>>, StorageError> {
        let versions: HashMap<String, u64> = self
            .docs
            .iter()
            .filter(|entry| entry.key().0 == workspace_id && entry.value().is_live())
            .map(|entry| (entry.key().1.clone(), entry.value().head()))
            .collect();

        if versions.is_empty() {
            Ok(None)
        } else {
            Ok(Some(versions))
        }
    }

    async fn list_doc_histories(
        &self,
        workspace_id: &str,
        doc_id: &str,
        query: HistoryQuery,
    ) -> Result<Vec<DocRecord>, StorageError> {
        let histories = match self.docs.get(&Self::key(workspace_id, doc_id)) {
            Some(entry) => entry
                .history
                .values()
                .rev()
                .skip(query.skip())
                .take(query.limit())
                .cloned()
                .collect(),
            None => Vec::new(),
        };
        Ok(histories)
    }

    async fn get_history_doc_snapshot(
        &self,
        workspace_id: &str,
        doc_id: &str,
        version: u64,
    ) -> Result<Option<DocRecord>, StorageError> {
        Ok(self
            .docs
            .get(&Self::key(workspace_id, doc_id))
            .and_then(|entry| entry.history.get(&version).cloned()))
    }

    async fn get_doc_snapshot(
        &self,
        workspace_id: &str,
        doc_id: &str,
    ) -> Result<Option<DocRecord>, StorageError> {
        Ok(self
            .docs
            .get(&Self::key(workspace_id, doc_id))
            .and_then(|entry| entry.snapshot.clone()))
    }

    async fn set_doc_snapshot(&self, snapshot: &DocRecord) -> Result<bool, StorageError> {
        let key = Self::key(&snapshot.workspace_id, &snapshot.doc_id);
        let mut entry = self.docs.entry(key).or_default();

        if let Some(current) = &entry.snapshot {
            if current.version >= snapshot.version {
                return Ok(false);
            }
        }

        if let Some(replaced) = entry.snapshot.replace(snapshot.clone()) {
            entry.history.entry(replaced.version).or_insert(replaced);
        }

        Ok(true)
    }

    async fn restore_doc_snapshot(
        &self,
        workspace_id: &str,
        doc_id: &str,
        bin: Vec<u8>,
        expected_head: u64,
    ) -> Result<Option<u64>, StorageError> {
        // Same shard lock as push_doc_updates, so no push can claim this version.
        let Some(mut entry) = self.docs.get_mut(&Self::key(workspace_id, doc_id)) else {
            return Ok(None);
        };
        let at_head = entry.snapshot.as_ref().map(|s| s.version) == Some(expected_head);
        if !at_head || entry.head() != expected_head {
            return Ok(None);
        }

        let version = expected_head + 1;
        let restored = DocRecord::new(workspace_id, doc_id, bin, version);
        if let Some(replaced) = entry.snapshot.replace(restored) {
            entry.history.entry(replaced.version).or_insert(replaced);
        }

        Ok(Some(version))
    }

    async fn get_doc_pending_updates(
        &self,
        workspace_id: &str,
        doc_id: &str,
    ) -> Result<Vec<DocRecord>, StorageError> {
        Ok(self
            .docs
            .get(&Self::key(workspace_id, doc_id))
            .map(|entry| entry.pending.clone())
            .unwrap_or_default())
    }

    async fn mark_updates_merged(
        &self,
        workspace_id: &str,
        doc_id: &str,
        version: u64,
    ) -> Result<usize, StorageError> {
        match self.docs.get_mut(&Self::key(workspace_id, doc_id)) {
            Some(mut entry) => {
                let before = entry.pending.len();
                entry.pending.retain(|u| u.version > version);
                Ok(before - entry.pending.len())
            }
            None => Ok(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn updates(bins: &[&[u8]]) -> Vec<DocUpdate> {
        bins.iter().map(|b| DocUpdate::from(*b)).collect()
    }

    #[tokio::test]
    async fn test_push_allocates_increasing_versions() {
        let storage = MemoryStorage::new();

        assert_eq!(storage.push_doc_updates("ws", "doc", updates(&[b"a", b"b"])).await.unwrap(), 2);
        assert_eq!(storage.push_doc_updates("ws", "doc", updates(&[b"c"])).await.unwrap(), 3);
        assert_eq!(storage.push_doc_updates("ws", "other", updates(&[b"x"])).await.unwrap(), 1);

        let pending = storage.get_doc_pending_updates("ws", "doc").await.unwrap();
        let versions: Vec<u64> = pending.iter().map(|u| u.version).collect();
        assert_eq!(versions, vec![1, 2, 3]);
        assert_eq!(pending[2].bin, b"c");
    }

    #[tokio::test]
    async fn test_push_empty_returns_head() {
        let storage = MemoryStorage::new();
        assert_eq!(storage.push_doc_updates("ws", "doc", Vec::new()).await.unwrap(), 0);
        assert!(storage.get_doc_versions("ws").await.unwrap().is_none());

        storage.push_doc_updates("ws", "doc", updates(&[b"a"])).await.unwrap();
        assert_eq!(storage.push_doc_updates("ws", "doc", Vec::new()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_push_continues_after_snapshot_version() {
        let storage = MemoryStorage::new();
        storage
            .set_doc_snapshot(&DocRecord::new("ws", "doc", b"s".to_vec(), 3))
            .await
            .unwrap();

        assert_eq!(storage.push_doc_updates("ws", "doc", updates(&[b"u"])).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_set_snapshot_moves_previous_to_history() {
        let storage = MemoryStorage::new();

        assert!(storage.set_doc_snapshot(&DocRecord::new("ws", "doc", b"v1".to_vec(), 1)).await.unwrap());
        assert!(storage.set_doc_snapshot(&DocRecord::new("ws", "doc", b"v2".to_vec(), 2)).await.unwrap());
        // Older or equal versions are ignored
        assert!(!storage.set_doc_snapshot(&DocRecord::new("ws", "doc", b"old".to_vec(), 2)).await.unwrap());

        let snapshot = storage.get_doc_snapshot("ws", "doc").await.unwrap().unwrap();
        assert_eq!(snapshot.bin, b"v2");

        let history = storage.get_history_doc_snapshot("ws", "doc", 1).await.unwrap().unwrap();
        assert_eq!(history.bin, b"v1");
        assert!(storage.get_history_doc_snapshot("ws", "doc", 2).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_restore_snapshot_requires_expected_head() {
        let storage = MemoryStorage::new();
        assert_eq!(storage.restore_doc_snapshot("ws", "doc", b"x".to_vec(), 0).await.unwrap(), None);

        storage.set_doc_snapshot(&DocRecord::new("ws", "doc", b"v2".to_vec(), 2)).await.unwrap();
        storage.push_doc_updates("ws", "doc", updates(&[b"u"])).await.unwrap();

        // A push moved the head to 3, past the snapshot
        assert_eq!(storage.restore_doc_snapshot("ws", "doc", b"old".to_vec(), 2).await.unwrap(), None);
        assert_eq!(storage.restore_doc_snapshot("ws", "doc", b"old".to_vec(), 3).await.unwrap(), None);
        assert_eq!(storage.get_doc_snapshot("ws", "doc").await.unwrap().unwrap().bin, b"v2");

        storage.set_doc_snapshot(&DocRecord::new("ws", "doc", b"v2u".to_vec(), 3)).await.unwrap();
        storage.mark_updates_merged("ws", "doc", 3).await.unwrap();

        assert_eq!(storage.restore_doc_snapshot("ws", "doc", b"old".to_vec(), 3).await.unwrap(), Some(4));
        let snapshot = storage.get_doc_snapshot("ws", "doc").await.unwrap().unwrap();
        assert_eq!(snapshot, DocRecord::new("ws", "doc", b"old".to_vec(), 4));
        assert_eq!(storage.get_history_doc_snapshot("ws", "doc", 3).await.unwrap().unwrap().bin, b"v2u");

        assert_eq!(storage.push_doc_updates("ws", "doc", updates(&[b"n"])).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_list_histories_newest_first() {
        let storage = MemoryStorage::new();
        for v in 1..=5u64 {
            let bin = format!("v{}", v).into_bytes();
            storage.set_doc_snapshot(&DocRecord::new("ws", "doc", bin, v)).await.unwrap();
        }

        let all = storage.list_doc_histories("ws", "doc", HistoryQuery::new()).await.unwrap();
        let versions: Vec<u64> = all.iter().map(|h| h.version).collect();
        assert_eq!(versions, vec![4, 3, 2, 1]);

        let page = storage
            .list_doc_histories("ws", "doc", HistoryQuery::new().with_skip(1).with_limit(2))
            .await
            .unwrap();
        let versions: Vec<u64> = page.iter().map(|h| h.version).collect();
        assert_eq!(versions, vec![3, 2]);
    }

    #[tokio::test]
    async fn test_mark_updates_merged() {
        let storage = MemoryStorage::new();
        storage.push_doc_updates("ws", "doc", updates(&[b"a", b"b", b"c"])).await.unwrap();

        assert_eq!(storage.mark_updates_merged("ws", "doc", 2).await.unwrap(), 2);
        let pending = storage.get_doc_pending_updates("ws", "doc").await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].version, 3);

        assert_eq!(storage.mark_updates_merged("ws", "missing", 10).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_doc_versions_and_deletes() {
        let storage = MemoryStorage::new();
        storage.push_doc_updates("ws", "a", updates(&[b"1", b"2"])).await.unwrap();
        storage.push_doc_updates("ws", "b", updates(&[b"1"])).await.unwrap();
        storage.push_doc_updates("other", "c", updates(&[b"1"])).await.unwrap();

        let versions = storage.get_doc_versions("ws").await.unwrap().unwrap();
        assert_eq!(versions.len(), 2);
        assert_eq!(versions["a"], 2);
        assert_eq!(versions["b"], 1);
        assert!(storage.get_doc_versions("unknown").await.unwrap().is_none());

        assert!(storage.delete_doc("ws", "a").await.unwrap());
        assert!(!storage.delete_doc("ws", "a").await.unwrap());
        assert!(storage.get_doc_pending_updates("ws", "a").await.unwrap().is_empty());

        storage.delete_workspace("ws").await.unwrap();
        assert!(storage.get_doc_versions("ws").await.unwrap().is_none());
        assert!(storage.get_doc_versions("other").await.unwrap().is_some());
    }
}
