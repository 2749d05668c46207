//! The disk-engine capability set consumed by warmup and persistence.
//!
//! The engine core does not implement a disk format; it drives whatever
//! backend is plugged in through the [`KVStore`] trait. Scans deliver
//! items through a pair of injected callbacks: a cache lookup deciding
//! whether a key needs materialising at all, and a value applier that
//! receives the loaded item. Both may yield, turning a long scan into a
//! resumable sequence of slices.

pub mod memory;

use std::collections::HashMap;

use crate::item::QueuedItem;
use crate::key::{CollectionId, DocKey};
use crate::status::{ScanOutcome, Status};
use crate::vbucket::Vbid;
use crate::vbucket_state::PersistedVBucketState;

/// Per-collection statistics stored by the backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CollectionStats {
    /// Number of items in the collection
    pub item_count: u64,
    /// Highest persisted seqno in the collection
    pub high_seqno: u64,
    /// Bytes the collection occupies on disk
    pub disk_size: u64,
}

/// Result status of a collection-stats read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GetCollectionStatsStatus {
    /// Stats were found
    Ok,
    /// No stats recorded; defaults apply
    NotFound,
    /// The read failed; the caller must treat the file as unusable
    Failed,
}

/// Which documents a scan visits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DocumentFilter {
    /// Every document, including deletions
    #[default]
    AllItems,
    /// Skip deletions
    NoDeletes,
}

/// How much of each document a scan loads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ValueFilter {
    /// Keys and metadata only
    KeysOnly,
    /// Keys, metadata and values
    #[default]
    Values,
}

/// Decision of the cache-lookup callback for one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheLookupStatus {
    /// Materialise the document and hand it to the applier
    Proceed,
    /// The document is already resident; skip the load
    Skip,
    /// Out of time; preserve the scan position and resume later
    Yield,
}

/// Decision of the value applier for one loaded item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyStatus {
    /// Keep scanning
    Continue,
    /// Out of time; preserve the scan position and resume later
    Yield,
    /// Terminate the scan; the consumer has everything it needs
    Stop,
}

/// Cache-side filter consulted before a document is materialised.
pub trait CacheLookup: Send {
    /// Decide whether `key` at `seqno` needs loading.
    fn lookup(&mut self, vbid: Vbid, key: &DocKey, seqno: i64) -> CacheLookupStatus;
}

/// Consumer of materialised documents.
pub trait ValueApplier: Send {
    /// Apply one loaded item. `is_partial` marks key-only loads.
    fn apply(&mut self, vbid: Vbid, item: &QueuedItem, is_partial: bool) -> ApplyStatus;
}

/// Resumable by-seqno scan over one vBucket's persisted items.
///
/// Holds the callbacks plus the resume position; after a
/// [`ScanOutcome::Yield`] the same context is handed back to
/// [`KVStore::scan`] to continue where it left off.
pub struct ScanContext {
    /// vBucket being scanned
    pub vbid: Vbid,
    /// Next seqno the scan will visit
    pub next_seqno: i64,
    /// Document filter
    pub doc_filter: DocumentFilter,
    /// Value filter
    pub value_filter: ValueFilter,
    /// Cache-side filter
    pub cache_lookup: Box<dyn CacheLookup>,
    /// Item consumer
    pub applier: Box<dyn ValueApplier>,
    /// Items visited so far, across yields
    pub items_visited: u64,
}

/// Result of a rollback request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RollbackResult {
    /// Whether the rollback succeeded
    pub success: bool,
    /// High seqno after the rollback
    pub high_seqno: u64,
}

/// The capability set a disk backend provides.
pub trait KVStore: Send + Sync {
    /// Enumerate the vBuckets persisted in this store with their state
    /// records.
    fn list_persisted_vbuckets(&self) -> Vec<(Vbid, PersistedVBucketState)>;

    /// Write back a vBucket state record.
    fn set_persisted_vbucket_state(
        &self,
        vbid: Vbid,
        state: &PersistedVBucketState,
    ) -> Result<(), Status>;

    /// Read the serialized collections manifest for a vBucket.
    fn get_collections_manifest(&self, vbid: Vbid) -> Result<Vec<u8>, Status>;

    /// Read per-collection statistics.
    fn get_collection_stats(
        &self,
        vbid: Vbid,
        cid: CollectionId,
    ) -> (GetCollectionStatsStatus, CollectionStats);

    /// Collection ids present for a vBucket.
    fn collection_ids(&self, vbid: Vbid) -> Vec<CollectionId>;

    /// Estimated number of items persisted for a vBucket.
    fn get_item_count(&self, vbid: Vbid) -> u64;

    /// Begin a by-seqno scan from `start_seqno` (inclusive).
    fn init_by_seqno_scan(
        &self,
        vbid: Vbid,
        start_seqno: i64,
        doc_filter: DocumentFilter,
        value_filter: ValueFilter,
        cache_lookup: Box<dyn CacheLookup>,
        applier: Box<dyn ValueApplier>,
    ) -> Result<ScanContext, Status>;

    /// Drive a scan until it completes, yields or fails.
    fn scan(&self, context: &mut ScanContext) -> ScanOutcome;

    /// Fetch several documents at once.
    fn get_multi(
        &self,
        vbid: Vbid,
        keys: &[DocKey],
    ) -> HashMap<DocKey, Result<QueuedItem, Status>>;

    /// Discard persisted items above `target_seqno`.
    fn rollback(&self, vbid: Vbid, target_seqno: u64) -> RollbackResult;

    /// Atomically replace the persisted stats snapshot. Returns false on
    /// failure (the caller retries).
    fn snapshot_stats(&self, stats: &HashMap<String, String>) -> bool;

    /// Read the persisted stats snapshot.
    fn get_persisted_stats(&self) -> HashMap<String, String>;

    /// Compact a vBucket file. Returns false on failure.
    fn compact(&self, vbid: Vbid) -> bool;
}
