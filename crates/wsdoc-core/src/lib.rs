//! wsdoc Core - document records, keyed locking and update merging
//!
//! This crate provides the building blocks the storage engine is made of:
//! - Snapshot and update records shared by every storage backend
//! - A keyed async lock manager that serializes work per document
//! - The pluggable merge function used to squash CRDT updates

pub mod error;
pub mod lock;
pub mod merge;
pub mod record;

pub use error::{Error, Result};
pub use lock::{DocLock, KeyedLocker};
pub use merge::{squash, MergeUpdates, YrsMerge};
pub use record::{DocRecord, DocUpdate, HistoryQuery, DEFAULT_HISTORY_LIMIT};
