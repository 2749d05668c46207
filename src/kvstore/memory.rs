//! In-memory [`KVStore`] backend.
//!
//! Deterministic stand-in for a disk engine, used by the warmup and
//! flush tests and by embedders that want an ephemeral bucket. Items are
//! held per vBucket in seqno order; scans honour the same yield protocol
//! as a real backend, and failure injection hooks let tests exercise the
//! corruption and flush-failure paths.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use super::{
    ApplyStatus, CacheLookup, CacheLookupStatus, CollectionStats, DocumentFilter,
    GetCollectionStatsStatus, KVStore, RollbackResult, ScanContext, ValueApplier, ValueFilter,
};
use crate::item::QueuedItem;
use crate::key::{CollectionId, DocKey};
use crate::status::{ScanOutcome, Status};
use crate::vbucket::Vbid;
use crate::vbucket_state::PersistedVBucketState;

#[derive(Default)]
struct VbData {
    state: PersistedVBucketState,
    /// Items in ascending seqno order.
    items: Vec<QueuedItem>,
    manifest: Vec<u8>,
    collection_stats: HashMap<CollectionId, CollectionStats>,
}

/// An ephemeral, deterministic KVStore.
#[derive(Default)]
pub struct MemoryKVStore {
    vbuckets: Mutex<HashMap<u16, VbData>>,
    persisted_stats: Mutex<HashMap<String, String>>,
    fail_snapshot_stats: AtomicBool,
    fail_set_vbucket_state: AtomicBool,
    fail_manifest_reads: AtomicBool,
    fail_scans: AtomicBool,
}

impl MemoryKVStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Install (or replace) a vBucket's persisted state record.
    pub fn put_vbucket_state(&self, vbid: Vbid, state: PersistedVBucketState) {
        let mut vbuckets = self.vbuckets.lock();
        vbuckets.entry(vbid.0).or_default().state = state;
    }

    /// Append an item to a vBucket. Items must be inserted in ascending
    /// seqno order.
    pub fn put_item(&self, vbid: Vbid, item: QueuedItem) {
        let mut vbuckets = self.vbuckets.lock();
        let data = vbuckets.entry(vbid.0).or_default();
        debug_assert!(
            data.items.last().map_or(true, |last| last.by_seqno < item.by_seqno),
            "items must arrive in seqno order"
        );
        data.items.push(item);
    }

    /// Install a serialized collections manifest.
    pub fn put_manifest(&self, vbid: Vbid, manifest: Vec<u8>) {
        let mut vbuckets = self.vbuckets.lock();
        vbuckets.entry(vbid.0).or_default().manifest = manifest;
    }

    /// Install collection statistics.
    pub fn put_collection_stats(&self, vbid: Vbid, cid: CollectionId, stats: CollectionStats) {
        let mut vbuckets = self.vbuckets.lock();
        vbuckets
            .entry(vbid.0)
            .or_default()
            .collection_stats
            .insert(cid, stats);
    }

    /// Seed the persisted stats snapshot.
    pub fn put_persisted_stat(&self, key: &str, value: &str) {
        self.persisted_stats
            .lock()
            .insert(key.to_string(), value.to_string());
    }

    /// Make `snapshot_stats` fail until cleared.
    pub fn set_fail_snapshot_stats(&self, fail: bool) {
        self.fail_snapshot_stats.store(fail, Ordering::Release);
    }

    /// Make `set_persisted_vbucket_state` fail until cleared.
    pub fn set_fail_set_vbucket_state(&self, fail: bool) {
        self.fail_set_vbucket_state.store(fail, Ordering::Release);
    }

    /// Make manifest reads fail until cleared.
    pub fn set_fail_manifest_reads(&self, fail: bool) {
        self.fail_manifest_reads.store(fail, Ordering::Release);
    }

    /// Make scans fail until cleared.
    pub fn set_fail_scans(&self, fail: bool) {
        self.fail_scans.store(fail, Ordering::Release);
    }

    /// Number of items held for a vBucket (test helper).
    pub fn num_items(&self, vbid: Vbid) -> usize {
        self.vbuckets
            .lock()
            .get(&vbid.0)
            .map_or(0, |data| data.items.len())
    }
}

impl KVStore for MemoryKVStore {
    fn list_persisted_vbuckets(&self) -> Vec<(Vbid, PersistedVBucketState)> {
        let vbuckets = self.vbuckets.lock();
        let mut out: Vec<(Vbid, PersistedVBucketState)> = vbuckets
            .iter()
            .map(|(id, data)| (Vbid(*id), data.state.clone()))
            .collect();
        out.sort_by_key(|(vbid, _)| vbid.0);
        out
    }

    fn set_persisted_vbucket_state(
        &self,
        vbid: Vbid,
        state: &PersistedVBucketState,
    ) -> Result<(), Status> {
        if self.fail_set_vbucket_state.load(Ordering::Acquire) {
            return Err(Status::IoError);
        }
        self.put_vbucket_state(vbid, state.clone());
        Ok(())
    }

    fn get_collections_manifest(&self, vbid: Vbid) -> Result<Vec<u8>, Status> {
        if self.fail_manifest_reads.load(Ordering::Acquire) {
            return Err(Status::IoError);
        }
        let vbuckets = self.vbuckets.lock();
        match vbuckets.get(&vbid.0) {
            Some(data) => Ok(data.manifest.clone()),
            None => Err(Status::NotMyVBucket),
        }
    }

    fn get_collection_stats(
        &self,
        vbid: Vbid,
        cid: CollectionId,
    ) -> (GetCollectionStatsStatus, CollectionStats) {
        let vbuckets = self.vbuckets.lock();
        match vbuckets.get(&vbid.0) {
            Some(data) => match data.collection_stats.get(&cid) {
                Some(stats) => (GetCollectionStatsStatus::Ok, *stats),
                None => (GetCollectionStatsStatus::NotFound, CollectionStats::default()),
            },
            None => (GetCollectionStatsStatus::Failed, CollectionStats::default()),
        }
    }

    fn collection_ids(&self, vbid: Vbid) -> Vec<CollectionId> {
        let vbuckets = self.vbuckets.lock();
        let mut ids: Vec<CollectionId> = vbuckets
            .get(&vbid.0)
            .map(|data| data.collection_stats.keys().copied().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    fn get_item_count(&self, vbid: Vbid) -> u64 {
        self.vbuckets
            .lock()
            .get(&vbid.0)
            .map_or(0, |data| data.items.len() as u64)
    }

    fn init_by_seqno_scan(
        &self,
        vbid: Vbid,
        start_seqno: i64,
        doc_filter: DocumentFilter,
        value_filter: ValueFilter,
        cache_lookup: Box<dyn CacheLookup>,
        applier: Box<dyn ValueApplier>,
    ) -> Result<ScanContext, Status> {
        if !self.vbuckets.lock().contains_key(&vbid.0) {
            return Err(Status::NotMyVBucket);
        }
        Ok(ScanContext {
            vbid,
            next_seqno: start_seqno,
            doc_filter,
            value_filter,
            cache_lookup,
            applier,
            items_visited: 0,
        })
    }

    fn scan(&self, context: &mut ScanContext) -> ScanOutcome {
        if self.fail_scans.load(Ordering::Acquire) {
            return ScanOutcome::Failed(Status::IoError);
        }
        loop {
            // Clone out the next candidate so the applier runs without
            // the store lock held.
            let next = {
                let vbuckets = self.vbuckets.lock();
                let data = match vbuckets.get(&context.vbid.0) {
                    Some(data) => data,
                    None => return ScanOutcome::Failed(Status::NotMyVBucket),
                };
                data.items
                    .iter()
                    .find(|item| item.by_seqno >= context.next_seqno)
                    .cloned()
            };
            let item = match next {
                Some(item) => item,
                None => return ScanOutcome::Complete,
            };

            if context.doc_filter == DocumentFilter::NoDeletes && item.deleted {
                context.next_seqno = item.by_seqno + 1;
                continue;
            }

            match context
                .cache_lookup
                .lookup(context.vbid, &item.key, item.by_seqno)
            {
                CacheLookupStatus::Yield => return ScanOutcome::Yield,
                CacheLookupStatus::Skip => {
                    context.next_seqno = item.by_seqno + 1;
                    context.items_visited += 1;
                    continue;
                }
                CacheLookupStatus::Proceed => {}
            }

            let (loaded, is_partial) = match context.value_filter {
                ValueFilter::KeysOnly => {
                    let mut stripped = item.clone();
                    stripped.value = None;
                    (stripped, true)
                }
                ValueFilter::Values => (item.clone(), false),
            };

            match context.applier.apply(context.vbid, &loaded, is_partial) {
                ApplyStatus::Continue => {
                    context.next_seqno = item.by_seqno + 1;
                    context.items_visited += 1;
                }
                ApplyStatus::Yield => return ScanOutcome::Yield,
                ApplyStatus::Stop => return ScanOutcome::Complete,
            }
        }
    }

    fn get_multi(
        &self,
        vbid: Vbid,
        keys: &[DocKey],
    ) -> HashMap<DocKey, Result<QueuedItem, Status>> {
        let vbuckets = self.vbuckets.lock();
        let data = vbuckets.get(&vbid.0);
        keys.iter()
            .map(|key| {
                let result = match data {
                    Some(data) => data
                        .items
                        .iter()
                        .rev()
                        .find(|item| &item.key == key)
                        .cloned()
                        .ok_or(Status::Failed),
                    None => Err(Status::NotMyVBucket),
                };
                (key.clone(), result)
            })
            .collect()
    }

    fn rollback(&self, vbid: Vbid, target_seqno: u64) -> RollbackResult {
        let mut vbuckets = self.vbuckets.lock();
        match vbuckets.get_mut(&vbid.0) {
            Some(data) => {
                data.items.retain(|item| item.by_seqno as u64 <= target_seqno);
                let high = data.items.last().map_or(0, |item| item.by_seqno as u64);
                data.state.high_seqno = high as i64;
                RollbackResult {
                    success: true,
                    high_seqno: high,
                }
            }
            None => RollbackResult {
                success: false,
                high_seqno: 0,
            },
        }
    }

    fn snapshot_stats(&self, stats: &HashMap<String, String>) -> bool {
        if self.fail_snapshot_stats.load(Ordering::Acquire) {
            return false;
        }
        *self.persisted_stats.lock() = stats.clone();
        true
    }

    fn get_persisted_stats(&self) -> HashMap<String, String> {
        self.persisted_stats.lock().clone()
    }

    fn compact(&self, vbid: Vbid) -> bool {
        self.vbuckets.lock().contains_key(&vbid.0)
    }
}
