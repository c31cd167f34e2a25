//! Versioned resource storage for the Basalt server.
//!
//! This crate owns the only mutation transactions in the system: every
//! create/update/patch/delete appends an immutable version row and
//! regenerates the searchable metadata index inside one critical section.

pub mod error;
pub mod indexer;
pub mod page_cache;
pub mod store;
pub mod types;

pub use error::{StorageError, StorageResult};
pub use indexer::{MetadataIndexer, NullIndexer};
pub use page_cache::{CachedPage, PageCache};
pub use store::{ResourceStore, apply_summary};
pub use types::{
    DeleteOutcome, HistoryEntry, HistoryMethod, HistoryPage, HistoryParams, MetadataEntry,
    ParamKind, RowStatus, SummaryMode, VersionedResource,
};
