//! Snapshot and update records

use serde::{Deserialize, Serialize};

/// Page size used by history listings when the caller sets no limit
pub const DEFAULT_HISTORY_LIMIT: usize = 100;

/// A document snapshot or a single pending update.
///
/// The same shape serves both roles: as a snapshot, `bin` is the fully merged
/// document state and `version` is the newest update folded into it; as a
/// pending update, `bin` is one incremental fragment and `version` is the
/// position the backend assigned to it. `bin` is opaque to everything except
/// the merge function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocRecord {
    pub workspace_id: String,
    pub doc_id: String,
    pub bin: Vec<u8>,
    pub version: u64,
}

impl DocRecord {
    pub fn new(
        workspace_id: impl Into<String>,
        doc_id: impl Into<String>,
        bin: impl Into<Vec<u8>>,
        version: u64,
    ) -> Self {
        Self {
            workspace_id: workspace_id.into(),
            doc_id: doc_id.into(),
            bin: bin.into(),
            version,
        }
    }
}

/// An update fragment on its way into the pending log.
///
/// Versions are assigned by the backend when the update is appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocUpdate {
    pub bin: Vec<u8>,
}

impl DocUpdate {
    pub fn new(bin: impl Into<Vec<u8>>) -> Self {
        Self { bin: bin.into() }
    }
}

impl From<Vec<u8>> for DocUpdate {
    fn from(bin: Vec<u8>) -> Self {
        Self { bin }
    }
}

impl From<&[u8]> for DocUpdate {
    fn from(bin: &[u8]) -> Self {
        Self { bin: bin.to_vec() }
    }
}

/// Pagination bounds for history listings
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryQuery {
    pub skip: Option<usize>,
    pub limit: Option<usize>,
}

impl HistoryQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_skip(mut self, skip: usize) -> Self {
        self.skip = Some(skip);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Number of entries to skip, 0 when unset
    pub fn skip(&self) -> usize {
        self.skip.unwrap_or(0)
    }

    /// Maximum number of entries to return
    pub fn limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_HISTORY_LIMIT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_history_query_defaults() {
        let query = HistoryQuery::new();
        assert_eq!(query.skip(), 0);
        assert_eq!(query.limit(), DEFAULT_HISTORY_LIMIT);

        let query = HistoryQuery::new().with_skip(5).with_limit(10);
        assert_eq!(query.skip(), 5);
        assert_eq!(query.limit(), 10);
    }

    #[test]
    fn test_doc_update_from_bytes() {
        let update: DocUpdate = b"abc".as_slice().into();
        assert_eq!(update.bin, b"abc");

        let update = DocUpdate::from(vec![1, 2]);
        assert_eq!(update, DocUpdate::new([1u8, 2]));
    }
}
