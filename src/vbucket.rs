//! vBuckets: the unit of partitioning, replication and recovery.
//!
//! A vBucket couples the in-memory hash table with its checkpoint
//! manager, failover table and hybrid-logical-clock state. The
//! [`VBucketMap`] is the shard-partitioned registry the front end
//! consults; during warmup it stays empty until the recovered vBuckets
//! are published in the `PopulateVBucketMap` phase.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, RwLock};

use crate::checkpoint::manager::{CheckpointDisposer, CheckpointManager};
use crate::config::CheckpointConfig;
use crate::failover::FailoverTable;
use crate::hash_table::HashTable;
use crate::stats::EngineStats;
use crate::vbucket_state::{PersistedVBucketState, VBucketState, HLC_EPOCH_UNINITIALISED};

/// vBucket identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Vbid(pub u16);

impl fmt::Display for Vbid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "vb:{}", self.0)
    }
}

/// One hash partition of the key space.
pub struct VBucket {
    id: Vbid,
    state: RwLock<VBucketState>,
    hash_table: Mutex<HashTable>,
    failovers: Mutex<FailoverTable>,
    checkpoint_manager: CheckpointManager,

    max_cas: AtomicU64,
    hlc_epoch_seqno: AtomicI64,
    purge_seqno: AtomicU64,
    persistence_seqno: AtomicU64,
    num_total_items: AtomicU64,
    might_contain_xattrs: AtomicBool,
}

impl VBucket {
    /// Build a vBucket from its persisted state during warmup.
    #[allow(clippy::too_many_arguments)]
    pub fn from_persisted(
        id: Vbid,
        persisted: &PersistedVBucketState,
        failovers: FailoverTable,
        checkpoint_config: CheckpointConfig,
        stats: Arc<EngineStats>,
        disposer: Arc<dyn CheckpointDisposer>,
    ) -> Self {
        let checkpoint_manager = CheckpointManager::new(
            id,
            checkpoint_config,
            persisted.high_seqno.max(0) as u64,
            disposer,
        );
        Self {
            id,
            state: RwLock::new(persisted.state()),
            hash_table: Mutex::new(HashTable::new(stats)),
            failovers: Mutex::new(failovers),
            checkpoint_manager,
            max_cas: AtomicU64::new(persisted.max_cas),
            hlc_epoch_seqno: AtomicI64::new(persisted.hlc_cas_epoch_seqno),
            purge_seqno: AtomicU64::new(persisted.purge_seqno),
            persistence_seqno: AtomicU64::new(persisted.high_seqno.max(0) as u64),
            num_total_items: AtomicU64::new(0),
            might_contain_xattrs: AtomicBool::new(persisted.might_contain_xattrs),
        }
    }

    /// Build a brand-new, empty vBucket.
    pub fn new(
        id: Vbid,
        state: VBucketState,
        max_failover_entries: usize,
        checkpoint_config: CheckpointConfig,
        stats: Arc<EngineStats>,
        disposer: Arc<dyn CheckpointDisposer>,
    ) -> Self {
        let mut persisted = PersistedVBucketState::default();
        persisted.transition.state = state;
        persisted.hlc_cas_epoch_seqno = 0;
        Self::from_persisted(
            id,
            &persisted,
            FailoverTable::new(max_failover_entries),
            checkpoint_config,
            stats,
            disposer,
        )
    }

    /// The vBucket id.
    pub fn id(&self) -> Vbid {
        self.id
    }

    /// Current state.
    pub fn state(&self) -> VBucketState {
        *self.state.read()
    }

    /// Change state, queueing the state marker into the checkpoint log.
    pub fn set_state(&self, state: VBucketState) {
        *self.state.write() = state;
        self.checkpoint_manager.queue_set_vbucket_state();
    }

    /// The hash table.
    pub fn hash_table(&self) -> &Mutex<HashTable> {
        &self.hash_table
    }

    /// The failover table.
    pub fn failovers(&self) -> &Mutex<FailoverTable> {
        &self.failovers
    }

    /// The checkpoint manager.
    pub fn checkpoint_manager(&self) -> &CheckpointManager {
        &self.checkpoint_manager
    }

    /// Highest assigned seqno.
    pub fn high_seqno(&self) -> u64 {
        self.checkpoint_manager.high_seqno()
    }

    /// Allocate the next HLC CAS: one past the physical clock or the
    /// previous CAS, whichever is ahead.
    pub fn next_hlc_cas(&self) -> u64 {
        let physical = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| (d.as_micros() as u64) << 16)
            .unwrap_or(0);
        let mut current = self.max_cas.load(Ordering::Acquire);
        loop {
            let next = physical.max(current + 1);
            match self.max_cas.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return next,
                Err(actual) => current = actual,
            }
        }
    }

    /// Maximum CAS observed.
    pub fn max_cas(&self) -> u64 {
        self.max_cas.load(Ordering::Acquire)
    }

    /// Seqno from which CAS values are HLC-encoded.
    pub fn hlc_epoch_seqno(&self) -> i64 {
        self.hlc_epoch_seqno.load(Ordering::Acquire)
    }

    /// Whether the HLC epoch has been initialised.
    pub fn hlc_epoch_initialised(&self) -> bool {
        self.hlc_epoch_seqno() != HLC_EPOCH_UNINITIALISED
    }

    /// Tombstone purge horizon.
    pub fn purge_seqno(&self) -> u64 {
        self.purge_seqno.load(Ordering::Acquire)
    }

    /// Highest seqno known persisted.
    pub fn persistence_seqno(&self) -> u64 {
        self.persistence_seqno.load(Ordering::Acquire)
    }

    /// Record a newly persisted seqno.
    pub fn set_persistence_seqno(&self, seqno: u64) {
        self.persistence_seqno.fetch_max(seqno, Ordering::AcqRel);
    }

    /// Estimated total item count on disk (set during warmup).
    pub fn num_total_items(&self) -> u64 {
        self.num_total_items.load(Ordering::Acquire)
    }

    /// Record the disk item-count estimate.
    pub fn set_num_total_items(&self, count: u64) {
        self.num_total_items.store(count, Ordering::Release);
    }

    /// Whether the vBucket might contain xattr-carrying documents.
    pub fn might_contain_xattrs(&self) -> bool {
        self.might_contain_xattrs.load(Ordering::Acquire)
    }
}

impl fmt::Debug for VBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VBucket")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("high_seqno", &self.high_seqno())
            .finish()
    }
}

/// Shard-partitioned registry of live vBuckets.
pub struct VBucketMap {
    buckets: Vec<RwLock<Option<Arc<VBucket>>>>,
    num_shards: usize,
}

impl VBucketMap {
    /// Create a map for `max_vbuckets` vBuckets spread over
    /// `num_shards` shards.
    pub fn new(max_vbuckets: u16, num_shards: usize) -> Self {
        let mut buckets = Vec::with_capacity(usize::from(max_vbuckets));
        for _ in 0..max_vbuckets {
            buckets.push(RwLock::new(None));
        }
        Self {
            buckets,
            num_shards: num_shards.max(1),
        }
    }

    /// Number of shards.
    pub fn num_shards(&self) -> usize {
        self.num_shards
    }

    /// Capacity in vBuckets.
    pub fn capacity(&self) -> usize {
        self.buckets.len()
    }

    /// The shard owning `vbid`.
    pub fn shard_of(&self, vbid: Vbid) -> usize {
        usize::from(vbid.0) % self.num_shards
    }

    /// All possible vBucket ids belonging to `shard`.
    pub fn vbids_in_shard(&self, shard: usize) -> Vec<Vbid> {
        (0..self.buckets.len() as u16)
            .map(Vbid)
            .filter(|vbid| self.shard_of(*vbid) == shard)
            .collect()
    }

    /// Fetch a live vBucket.
    pub fn get(&self, vbid: Vbid) -> Option<Arc<VBucket>> {
        self.buckets
            .get(usize::from(vbid.0))
            .and_then(|slot| slot.read().clone())
    }

    /// Publish a vBucket, replacing any previous occupant.
    pub fn add(&self, vb: Arc<VBucket>) {
        if let Some(slot) = self.buckets.get(usize::from(vb.id().0)) {
            *slot.write() = Some(vb);
        }
    }

    /// Remove a vBucket, returning it if present.
    pub fn remove(&self, vbid: Vbid) -> Option<Arc<VBucket>> {
        self.buckets
            .get(usize::from(vbid.0))
            .and_then(|slot| slot.write().take())
    }

    /// Ids of all live vBuckets.
    pub fn live_vbids(&self) -> Vec<Vbid> {
        (0..self.buckets.len() as u16)
            .map(Vbid)
            .filter(|vbid| self.get(*vbid).is_some())
            .collect()
    }

    /// Number of live vBuckets.
    pub fn num_live(&self) -> usize {
        self.buckets
            .iter()
            .filter(|slot| slot.read().is_some())
            .count()
    }
}
