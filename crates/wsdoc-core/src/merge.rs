//! Update merging - the pluggable merge function and squash

use crate::error::{Error, Result};
use crate::record::DocRecord;
use tracing::trace;

/// Combines an ordered sequence of CRDT fragments into one fragment.
///
/// The first fragment is the base state and every following one is applied
/// on top of it, in order. Implementations must be deterministic for a fixed
/// input sequence. Any `Fn(&[&[u8]]) -> Result<Vec<u8>>` closure qualifies.
pub trait MergeUpdates: Send + Sync {
    fn merge_updates(&self, updates: &[&[u8]]) -> Result<Vec<u8>>;
}

impl<F> MergeUpdates for F
where
    F: Fn(&[&[u8]]) -> Result<Vec<u8>> + Send + Sync,
{
    fn merge_updates(&self, updates: &[&[u8]]) -> Result<Vec<u8>> {
        self(updates)
    }
}

/// Default merge: Y.js v1 update merging via `yrs`
#[derive(Debug, Clone, Copy, Default)]
pub struct YrsMerge;

impl MergeUpdates for YrsMerge {
    fn merge_updates(&self, updates: &[&[u8]]) -> Result<Vec<u8>> {
        yrs::merge_updates_v1(updates).map_err(|e| Error::Merge(e.to_string()))
    }
}

/// Squash records, in ascending version order, into a single record.
///
/// A single record is returned as-is without calling the merge function.
/// Otherwise the result carries the ids and version of the last record and
/// the merged payload of all of them.
pub fn squash(mut records: Vec<DocRecord>, merge: &dyn MergeUpdates) -> Result<DocRecord> {
    let last = records
        .pop()
        .ok_or_else(|| Error::InvalidArgument("No updates to be squashed".into()))?;

    if records.is_empty() {
        return Ok(last);
    }

    let bins: Vec<&[u8]> = records
        .iter()
        .map(|r| r.bin.as_slice())
        .chain(std::iter::once(last.bin.as_slice()))
        .collect();

    trace!(
        workspace_id = %last.workspace_id,
        doc_id = %last.doc_id,
        count = bins.len(),
        "Merging updates"
    );
    let bin = merge.merge_updates(&bins)?;

    Ok(DocRecord {
        workspace_id: last.workspace_id,
        doc_id: last.doc_id,
        bin,
        version: last.version,
    })
}
