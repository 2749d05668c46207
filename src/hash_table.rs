//! Per-vBucket in-memory hash table.
//!
//! Holds the resident working set of a vBucket: committed values plus
//! outstanding prepares, each as a [`StoredValue`]. Values may be
//! resident (body in memory) or ejected (metadata only); warmup decides
//! per insert based on memory pressure, and the emergency purge walks
//! the table ejecting bodies when the data load outruns the quota.
//!
//! Memory consumption is accounted against the engine-wide gauge so the
//! warmup watermark checks observe the load as it happens.

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::EvictionPolicy;
use crate::item::QueuedItem;
use crate::key::DocKey;
use crate::stats::EngineStats;
use crate::status::MutationResult;

/// A document held by the hash table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredValue {
    /// Document key
    pub key: DocKey,
    /// Body; `None` when ejected
    pub value: Option<Vec<u8>>,
    /// Version
    pub cas: u64,
    /// Revision seqno
    pub rev_seqno: u64,
    /// Sequence number of the mutation that produced this value
    pub by_seqno: i64,
    /// Client-visible flags
    pub flags: u32,
    /// Datatype bits
    pub datatype: u8,
    /// Deletion marker
    pub deleted: bool,
}

impl StoredValue {
    fn from_item(item: &QueuedItem, resident: bool) -> Self {
        Self {
            key: item.key.clone(),
            value: if resident { item.value.clone() } else { None },
            cas: item.cas,
            rev_seqno: item.rev_seqno,
            by_seqno: item.by_seqno,
            flags: item.flags,
            datatype: item.datatype,
            deleted: item.deleted,
        }
    }

    /// Whether the body is in memory.
    pub fn is_resident(&self) -> bool {
        self.value.is_some()
    }

    fn mem_size(&self) -> usize {
        self.key.size()
            + std::mem::size_of::<Self>()
            + self.value.as_ref().map_or(0, Vec::len)
    }
}

/// The per-vBucket table of committed values and outstanding prepares.
pub struct HashTable {
    values: HashMap<DocKey, StoredValue>,
    prepares: HashMap<DocKey, StoredValue>,
    stats: Arc<EngineStats>,
    max_deleted_rev_seqno: u64,
}

impl HashTable {
    /// Create an empty table accounting against `stats`.
    pub fn new(stats: Arc<EngineStats>) -> Self {
        Self {
            values: HashMap::new(),
            prepares: HashMap::new(),
            stats,
            max_deleted_rev_seqno: 0,
        }
    }

    /// Number of committed entries.
    pub fn num_items(&self) -> usize {
        self.values.len()
    }

    /// Number of outstanding prepares.
    pub fn num_prepares(&self) -> usize {
        self.prepares.len()
    }

    /// Number of committed entries without a resident body.
    pub fn num_non_resident(&self) -> usize {
        self.values.values().filter(|v| !v.is_resident()).count()
    }

    /// Largest rev-seqno seen on a deleted item.
    pub fn max_deleted_rev_seqno(&self) -> u64 {
        self.max_deleted_rev_seqno
    }

    /// Record the max deleted rev-seqno restored from the persisted
    /// vBucket state.
    pub fn set_max_deleted_rev_seqno(&mut self, seqno: u64) {
        self.max_deleted_rev_seqno = self.max_deleted_rev_seqno.max(seqno);
    }

    /// Look up the committed value for `key`.
    pub fn find_committed(&self, key: &DocKey) -> Option<&StoredValue> {
        self.values.get(key)
    }

    /// Look up the outstanding prepare for `key`.
    pub fn find_prepare(&self, key: &DocKey) -> Option<&StoredValue> {
        self.prepares.get(key)
    }

    /// Insert a value loaded by warmup.
    ///
    /// * `should_eject` stores metadata only (the body stays on disk).
    /// * `is_partial` marks a key-only load (no body was fetched).
    /// * `check_mem` enforces the quota, returning `NoMem` on breach.
    ///
    /// An existing entry whose CAS differs means the in-memory value has
    /// moved past the disk copy; the disk value is ignored.
    pub fn insert_from_warmup(
        &mut self,
        item: &QueuedItem,
        should_eject: bool,
        is_partial: bool,
        check_mem: bool,
    ) -> MutationResult {
        if let Some(existing) = self.values.get(&item.key) {
            if existing.cas != item.cas {
                return MutationResult::InvalidCas;
            }
            // Same CAS: a repeated load (e.g. access log after key dump)
            // may now bring the body in.
            if existing.is_resident() || is_partial || should_eject {
                return MutationResult::Stored;
            }
        }

        let resident = !is_partial && !should_eject;
        let value = StoredValue::from_item(item, resident);
        let size = value.mem_size();

        if check_mem && !self.has_memory_for(size) {
            return MutationResult::NoMem;
        }

        if item.deleted {
            self.max_deleted_rev_seqno = self.max_deleted_rev_seqno.max(item.rev_seqno);
        }

        match self.values.insert(item.key.clone(), value) {
            Some(old) => {
                self.stats.mem_used.sub(old.mem_size());
                self.stats.mem_used.add(size);
                MutationResult::Stored
            }
            None => {
                self.stats.mem_used.add(size);
                MutationResult::NotFound
            }
        }
    }

    /// Insert a prepared SyncWrite loaded by warmup.
    pub fn insert_prepare_from_warmup(&mut self, item: &QueuedItem) -> MutationResult {
        if self.prepares.contains_key(&item.key) {
            return MutationResult::InvalidCas;
        }
        let value = StoredValue::from_item(item, true);
        let size = value.mem_size();
        if !self.has_memory_for(size) {
            return MutationResult::NoMem;
        }
        self.prepares.insert(item.key.clone(), value);
        self.stats.mem_used.add(size);
        MutationResult::NotFound
    }

    fn has_memory_for(&self, size: usize) -> bool {
        let quota = self.stats.max_size.load(std::sync::atomic::Ordering::Acquire);
        if quota == 0 {
            return true;
        }
        self.stats.mem_used.get() + size <= quota
    }

    /// Eject the body of `key`'s committed value. Under full eviction
    /// the whole entry is removed. Returns the bytes released.
    pub fn eject(&mut self, key: &DocKey, policy: EvictionPolicy) -> usize {
        match policy {
            EvictionPolicy::Value => {
                if let Some(value) = self.values.get_mut(key) {
                    if let Some(body) = value.value.take() {
                        self.stats.mem_used.sub(body.len());
                        return body.len();
                    }
                }
                0
            }
            EvictionPolicy::Full => match self.values.remove(key) {
                Some(value) => {
                    let size = value.mem_size();
                    self.stats.mem_used.sub(size);
                    size
                }
                None => 0,
            },
        }
    }

    /// Eject every eligible (resident, non-deleted) value. Used by the
    /// warmup emergency purge. Returns the bytes released.
    pub fn eject_all_eligible(&mut self, policy: EvictionPolicy) -> usize {
        let keys: Vec<DocKey> = self
            .values
            .iter()
            .filter(|(_, value)| value.is_resident() && !value.deleted)
            .map(|(key, _)| key.clone())
            .collect();
        let mut freed = 0;
        for key in keys {
            freed += self.eject(&key, policy);
        }
        freed
    }
}

impl Drop for HashTable {
    fn drop(&mut self) {
        let held: usize = self
            .values
            .values()
            .chain(self.prepares.values())
            .map(StoredValue::mem_size)
            .sum();
        self.stats.mem_used.sub(held);
    }
}
