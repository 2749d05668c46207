//! Checkpoints: bounded, append-only segments of the per-vBucket write log.
//!
//! Each `Checkpoint` is an ordered series of queued items, each of which
//! either represents a real user operation (mutation, deletion, SyncWrite
//! prepare/commit/abort, system event) or one of a range of meta items
//! (`checkpoint_start`, `checkpoint_end`, ...).
//!
//! A checkpoint is either Open or Closed. Open checkpoints accept new
//! items (including per-key de-duplication); Closed checkpoints are
//! logically immutable apart from expel. A checkpoint whose snapshot was
//! received from a replica's disk stream has type `Disk` and performs no
//! de-duplication; everything else has type `Memory`.
//!
//! Consumers read items through cursors which are advanced *before* being
//! dereferenced, so every checkpoint begins with an `Empty` sentinel:
//! after the first advance a cursor dereferences to `checkpoint_start`.
//!
//! # Slots
//!
//! Items occupy stable, strictly increasing *slots*. Slot 0 is the
//! sentinel and slot 1 the `checkpoint_start`; user items start at slot 2.
//! Expelling removes the contiguous slot range immediately after
//! `checkpoint_start`, so a slot, once handed out, never renumbers; this
//! is what cursors and the dedup indexes hold instead of raw iterators.
//!
//! # Expelling
//!
//! Items can be expelled (released from memory) from the oldest checkpoint
//! that still has cursors in it, up to the position of the slowest cursor
//! therein. The expelled range is returned to the caller so the actual
//! deallocation can happen off the hot path. The checkpoint keeps its
//! identity, its item count and its tail; only memory is given back.

pub mod cursor;
pub mod destroyer;
pub mod manager;
pub mod mem_recovery;

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::constants::PER_ITEM_QUEUE_OVERHEAD;
use crate::item::{QueueOp, QueuedItem, QueuedItemPtr};
use crate::key::DocKey;
use crate::seqno::Monotonic;
use crate::stats::NonNegativeGauge;
use crate::status::{QueueResult, QueueStatus};
use crate::vbucket::Vbid;

/// Position of an item within a checkpoint. Stable for the lifetime of
/// the checkpoint; never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Slot(pub u64);

impl Slot {
    /// The `Empty` sentinel every checkpoint begins with.
    pub const SENTINEL: Slot = Slot(0);

    /// The `checkpoint_start` marker.
    pub const START: Slot = Slot(1);
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot:{}", self.0)
    }
}

/// The origin of a checkpoint's snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum CheckpointType {
    /// Built from in-memory mutations on this node
    #[default]
    Memory = 0,
    /// Received as a disk snapshot from a producer; may carry duplicate
    /// key/prepare pairs and performs no dedup
    Disk = 1,
}

impl CheckpointType {
    /// Get the type as a string
    pub const fn as_str(&self) -> &'static str {
        match self {
            CheckpointType::Memory => "Memory",
            CheckpointType::Disk => "Disk",
        }
    }
}

impl fmt::Display for CheckpointType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lifecycle state of a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CheckpointState {
    /// Accepting appends; always the last checkpoint in a manager's list
    Open = 0,
    /// No further appends; cursors may still traverse, items may still be
    /// expelled
    Closed = 1,
    /// Removed from the manager's list and owned by the destroyer; no
    /// further mutations of any kind
    Detached = 2,
}

impl CheckpointState {
    /// Get the state as a string
    pub const fn as_str(&self) -> &'static str {
        match self {
            CheckpointState::Open => "Open",
            CheckpointState::Closed => "Closed",
            CheckpointState::Detached => "Detached",
        }
    }
}

impl fmt::Display for CheckpointState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Byte counter owned by a checkpoint whose updates are mirrored into an
/// optional parent gauge (the manager's usage, or the destroyer's pending
/// usage once the checkpoint is detached).
///
/// Changing the parent moves the locally accounted bytes from the old
/// owner to the new one in O(1); the local value is unchanged.
#[derive(Debug, Default)]
pub struct MemoryCounter {
    local: usize,
    parent: Option<Arc<NonNegativeGauge>>,
}

impl MemoryCounter {
    /// Create a counter reporting into `parent`.
    pub fn new(parent: Option<Arc<NonNegativeGauge>>) -> Self {
        Self { local: 0, parent }
    }

    /// Add bytes.
    pub fn add(&mut self, bytes: usize) {
        self.local += bytes;
        if let Some(parent) = &self.parent {
            parent.add(bytes);
        }
    }

    /// Subtract bytes, clamping at zero.
    pub fn sub(&mut self, bytes: usize) {
        let applied = bytes.min(self.local);
        self.local -= applied;
        if let Some(parent) = &self.parent {
            parent.sub(applied);
        }
    }

    /// Locally accounted bytes.
    pub fn get(&self) -> usize {
        self.local
    }

    /// Move the accounted bytes from the current parent to `new_parent`.
    pub fn set_parent(&mut self, new_parent: Option<Arc<NonNegativeGauge>>) {
        if let Some(old) = &self.parent {
            old.sub(self.local);
        }
        if let Some(new) = &new_parent {
            new.add(self.local);
        }
        self.parent = new_parent;
    }
}

impl Drop for MemoryCounter {
    fn drop(&mut self) {
        if let Some(parent) = &self.parent {
            parent.sub(self.local);
        }
    }
}

/// Result of expelling the consumed prefix of a checkpoint.
#[derive(Debug, Default)]
pub struct ExpelResult {
    /// The expelled items; the caller drops them outside the manager lock
    pub items: Vec<QueuedItemPtr>,
    /// Bytes of queued-item memory released
    pub bytes: usize,
}

/// A bounded segment of the per-vBucket write log.
pub struct Checkpoint {
    id: u64,
    vbid: Vbid,
    ckpt_type: CheckpointType,
    // Read by tasks holding only a manager-level snapshot, hence
    // independently synchronised from the queue itself.
    state: RwLock<CheckpointState>,

    snap_start: u64,
    snap_end: u64,
    visible_snap_end: u64,
    high_completed_seqno: Option<u64>,
    high_prepared_seqno: Monotonic,
    max_deleted_rev_seqno: Option<u64>,
    highest_expelled_seqno: Monotonic,

    num_cursors: AtomicUsize,

    queue: VecDeque<QueuedItemPtr>,
    next_slot: u64,
    num_expelled: u64,

    committed_index: HashMap<DocKey, Slot>,
    prepared_index: HashMap<DocKey, Slot>,

    /// Non-meta items queued (unchanged by expel).
    num_items: usize,
    /// Meta items queued (start/end/set_vbucket_state; not the sentinel).
    num_meta_items: usize,

    queued_items_mem: MemoryCounter,
    key_index_mem: MemoryCounter,
    queue_overhead: MemoryCounter,
}

/// Estimated bytes a key index entry costs beyond the key itself.
const KEY_INDEX_ENTRY_OVERHEAD: usize = std::mem::size_of::<Slot>() + std::mem::size_of::<usize>();

impl Checkpoint {
    /// Create a new Open checkpoint.
    pub fn new(
        id: u64,
        vbid: Vbid,
        ckpt_type: CheckpointType,
        snap_start: u64,
        snap_end: u64,
        visible_snap_end: u64,
        high_completed_seqno: Option<u64>,
        parent: Option<Arc<NonNegativeGauge>>,
    ) -> Self {
        let mut ckpt = Self {
            id,
            vbid,
            ckpt_type,
            state: RwLock::new(CheckpointState::Open),
            snap_start,
            snap_end,
            visible_snap_end,
            high_completed_seqno,
            high_prepared_seqno: Monotonic::new(0),
            max_deleted_rev_seqno: None,
            highest_expelled_seqno: Monotonic::new(0),
            num_cursors: AtomicUsize::new(0),
            queue: VecDeque::new(),
            next_slot: 0,
            num_expelled: 0,
            committed_index: HashMap::new(),
            prepared_index: HashMap::new(),
            num_items: 0,
            num_meta_items: 0,
            queued_items_mem: MemoryCounter::new(parent.clone()),
            key_index_mem: MemoryCounter::new(parent.clone()),
            queue_overhead: MemoryCounter::new(parent),
        };
        let sentinel_seqno = snap_start.saturating_sub(1) as i64;
        ckpt.push_raw(Arc::new(QueuedItem::empty(sentinel_seqno)));
        ckpt.push_raw(Arc::new(QueuedItem::checkpoint_start(snap_start as i64)));
        ckpt.num_meta_items = 1;
        ckpt
    }

    fn push_raw(&mut self, item: QueuedItemPtr) -> Slot {
        let slot = Slot(self.next_slot);
        self.next_slot += 1;
        self.queued_items_mem.add(item.size_in_memory());
        self.queue_overhead.add(PER_ITEM_QUEUE_OVERHEAD);
        self.queue.push_back(item);
        slot
    }

    /// The checkpoint id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The vBucket this checkpoint belongs to.
    pub fn vbid(&self) -> Vbid {
        self.vbid
    }

    /// The checkpoint type.
    pub fn checkpoint_type(&self) -> CheckpointType {
        self.ckpt_type
    }

    /// Check whether this is a disk checkpoint.
    pub fn is_disk(&self) -> bool {
        self.ckpt_type == CheckpointType::Disk
    }

    /// Current lifecycle state.
    pub fn state(&self) -> CheckpointState {
        *self.state.read()
    }

    /// Check whether the checkpoint is open.
    pub fn is_open(&self) -> bool {
        self.state() == CheckpointState::Open
    }

    /// Number of non-meta items queued. Unchanged by expel.
    pub fn num_items(&self) -> usize {
        self.num_items
    }

    /// Number of meta items queued (excluding the sentinel).
    pub fn num_meta_items(&self) -> usize {
        self.num_meta_items
    }

    /// Number of cursors currently residing in this checkpoint.
    pub fn num_cursors(&self) -> usize {
        self.num_cursors.load(Ordering::Acquire)
    }

    /// Register a cursor's residence.
    pub fn inc_num_cursors(&self) {
        self.num_cursors.fetch_add(1, Ordering::AcqRel);
    }

    /// Remove a cursor's residence.
    pub fn dec_num_cursors(&self) {
        let mut current = self.num_cursors.load(Ordering::Acquire);
        loop {
            let next = current.saturating_sub(1);
            match self.num_cursors.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    /// Snapshot start seqno.
    pub fn snapshot_start(&self) -> u64 {
        self.snap_start
    }

    /// Snapshot end seqno.
    pub fn snapshot_end(&self) -> u64 {
        self.snap_end
    }

    /// Snapshot end hiding prepares and aborts.
    pub fn visible_snapshot_end(&self) -> u64 {
        self.visible_snap_end
    }

    /// Extend the snapshot to cover a newly queued seqno.
    fn extend_snapshot(&mut self, seqno: u64, visible: bool) {
        if seqno > self.snap_end {
            self.snap_end = seqno;
        }
        if visible && seqno > self.visible_snap_end {
            self.visible_snap_end = seqno;
        }
    }

    /// The high completed seqno carried by a disk snapshot.
    pub fn high_completed_seqno(&self) -> Option<u64> {
        self.high_completed_seqno
    }

    /// Seqno of the most recently queued prepare, if any.
    pub fn high_prepared_seqno(&self) -> Option<u64> {
        match self.high_prepared_seqno.get() {
            0 => None,
            seqno => Some(seqno),
        }
    }

    /// The largest rev-seqno seen on a deleted item, across dedup.
    pub fn max_deleted_rev_seqno(&self) -> Option<u64> {
        self.max_deleted_rev_seqno
    }

    /// Seqno of the highest expelled item.
    pub fn highest_expelled_seqno(&self) -> u64 {
        self.highest_expelled_seqno.get()
    }

    /// Bytes of queued items held.
    pub fn queued_items_mem(&self) -> usize {
        self.queued_items_mem.get()
    }

    /// Bytes of key-index overhead held.
    pub fn key_index_mem(&self) -> usize {
        self.key_index_mem.get()
    }

    /// Bytes of queue bookkeeping overhead held.
    pub fn queue_overhead(&self) -> usize {
        self.queue_overhead.get()
    }

    /// Total memory attributed to this checkpoint.
    pub fn mem_usage(&self) -> usize {
        self.queued_items_mem.get() + self.key_index_mem.get() + self.queue_overhead.get()
    }

    /// Re-home the memory accounted by this checkpoint under a different
    /// owner (or no owner when `None`).
    pub fn set_memory_tracker(&mut self, parent: Option<Arc<NonNegativeGauge>>) {
        self.queued_items_mem.set_parent(parent.clone());
        self.key_index_mem.set_parent(parent.clone());
        self.queue_overhead.set_parent(parent);
    }

    /// Detach from a manager: no further appends, expels or state flips.
    pub fn detach(&mut self) {
        *self.state.write() = CheckpointState::Detached;
    }

    // --- slot arithmetic -------------------------------------------------

    /// First surviving user-item slot (past any expelled range).
    fn first_user_slot(&self) -> Slot {
        Slot(2 + self.num_expelled)
    }

    /// The highest slot handed out so far.
    pub fn tail_slot(&self) -> Slot {
        Slot(self.next_slot - 1)
    }

    fn physical(&self, slot: Slot) -> Option<usize> {
        let s = slot.0;
        if s <= 1 {
            return Some(s as usize);
        }
        if s < 2 + self.num_expelled {
            return None;
        }
        let idx = (s - self.num_expelled) as usize;
        if idx < self.queue.len() {
            Some(idx)
        } else {
            None
        }
    }

    /// The item at `slot`, unless the slot was expelled or never existed.
    pub fn item_at(&self, slot: Slot) -> Option<&QueuedItemPtr> {
        self.physical(slot).map(|idx| &self.queue[idx])
    }

    /// The next occupied slot after `slot`, if any.
    pub fn next_occupied_slot(&self, slot: Slot) -> Option<Slot> {
        let candidate = if slot.0 < 1 {
            Slot(1)
        } else if slot.0 == 1 {
            self.first_user_slot()
        } else {
            Slot(slot.0 + 1)
        };
        if candidate.0 < self.next_slot && self.physical(candidate).is_some() {
            Some(candidate)
        } else {
            None
        }
    }

    /// The first seqno available in this checkpoint for a cursor to pick
    /// up: the `checkpoint_start` seqno, or, once expel has run, the seqno
    /// of the first surviving item after it.
    pub fn minimum_cursor_seqno(&self) -> u64 {
        if self.num_expelled == 0 {
            return self.queue[1].by_seqno as u64;
        }
        match self.item_at(self.first_user_slot()) {
            Some(item) => item.by_seqno as u64,
            None => self.highest_expelled_seqno.get() + 1,
        }
    }

    /// The seqno of the last real entry. A trailing `checkpoint_end` is
    /// reported as one less, matching its bumped marker seqno.
    pub fn high_seqno(&self) -> u64 {
        for item in self.queue.iter().rev() {
            match item.op {
                QueueOp::Empty => continue,
                QueueOp::CheckpointEnd => return (item.by_seqno - 1).max(0) as u64,
                _ => return item.by_seqno.max(0) as u64,
            }
        }
        self.snap_start
    }

    // --- queueing --------------------------------------------------------

    /// Check whether `existing` may be replaced by `incoming` within this
    /// checkpoint.
    pub fn can_dedup(&self, existing: &QueuedItem, incoming: &QueuedItem) -> bool {
        if self.is_disk() {
            return false;
        }
        !(existing.op.is_prepared_namespace() || incoming.op.is_prepared_namespace())
    }

    /// Queue a user item.
    ///
    /// `persistence_slot` is the position of the persistence cursor if it
    /// currently resides in this checkpoint; it decides whether a dedup
    /// hit re-persists. The caller (the manager) must only invoke this on
    /// the open checkpoint.
    pub fn queue(
        &mut self,
        item: QueuedItemPtr,
        persistence_slot: Option<Slot>,
    ) -> QueueResult {
        debug_assert!(self.is_open());
        debug_assert!(!item.is_meta());

        // Disk snapshots are replayed verbatim; no dedup indexes.
        if self.is_disk() {
            self.append_user_item(item);
            return QueueResult::of(QueueStatus::SuccessNewItem);
        }

        let prepared = item.op.is_prepared_namespace();
        if prepared {
            if self.prepared_index.contains_key(&item.key) {
                // A prepare (or abort) is already outstanding for this
                // key; SyncWrites never dedup.
                return QueueResult::of(QueueStatus::FailureDuplicateItem);
            }
            let key = item.key.clone();
            let slot = self.append_user_item(item);
            self.index_insert(key, slot, true);
            return QueueResult::of(QueueStatus::SuccessNewItem);
        }

        // A plain mutation cannot land on a key with an outstanding
        // prepare; only the matching commit/abort may. Commits pair with
        // their prepare legitimately.
        if item.op != QueueOp::Commit && self.prepared_index.contains_key(&item.key) {
            return QueueResult::of(QueueStatus::FailureDuplicateItem);
        }

        match self.committed_index.get(&item.key).copied() {
            None => {
                let key = item.key.clone();
                let slot = self.append_user_item(item);
                self.index_insert(key, slot, false);
                QueueResult::of(QueueStatus::SuccessNewItem)
            }
            Some(existing_slot) => {
                let (status, byte_diff) = match self.item_at(existing_slot) {
                    None => {
                        // The previous entry was expelled, which implies
                        // every cursor (persistence included) passed it.
                        (QueueStatus::SuccessPersistAgain, 0)
                    }
                    Some(existing) => {
                        if !self.can_dedup(existing, &item) {
                            return QueueResult::of(QueueStatus::FailureDuplicateItem);
                        }
                        let old_size = existing.size_in_memory() as isize;
                        let flushed = persistence_slot
                            .map_or(false, |cursor| existing_slot <= cursor);
                        if flushed {
                            (QueueStatus::SuccessPersistAgain, 0)
                        } else {
                            (
                                QueueStatus::SuccessExistingItem,
                                item.size_in_memory() as isize - old_size,
                            )
                        }
                    }
                };
                let key = item.key.clone();
                self.tombstone_slot(existing_slot);
                let slot = self.append_user_item(item);
                self.committed_index.insert(key, slot);
                QueueResult {
                    status,
                    existing_byte_diff: byte_diff,
                }
            }
        }
    }

    fn index_insert(&mut self, key: DocKey, slot: Slot, prepared: bool) {
        self.key_index_mem
            .add(key.size() + KEY_INDEX_ENTRY_OVERHEAD);
        if prepared {
            self.prepared_index.insert(key, slot);
        } else {
            self.committed_index.insert(key, slot);
        }
    }

    fn append_user_item(&mut self, item: QueuedItemPtr) -> Slot {
        if item.deleted {
            let rev = item.rev_seqno;
            self.max_deleted_rev_seqno = Some(self.max_deleted_rev_seqno.map_or(rev, |m| m.max(rev)));
        }
        if item.op == QueueOp::Prepare {
            self.high_prepared_seqno.set(item.by_seqno as u64);
        }
        let visible = item.is_committed_namespace();
        let seqno = item.by_seqno as u64;
        let slot = self.push_raw(item);
        self.num_items += 1;
        self.extend_snapshot(seqno, visible);
        slot
    }

    /// Replace the entry at `slot` with an `Empty` tombstone carrying the
    /// superseded seqno. Cursors skip tombstones on advance.
    fn tombstone_slot(&mut self, slot: Slot) {
        if let Some(idx) = self.physical(slot) {
            let old = &self.queue[idx];
            let tombstone = Arc::new(QueuedItem::empty(old.by_seqno));
            self.queued_items_mem.sub(old.size_in_memory());
            self.queued_items_mem.add(tombstone.size_in_memory());
            self.queue[idx] = tombstone;
        }
    }

    /// Append a deliverable meta item (`set_vbucket_state` or similar).
    pub fn add_meta_item(&mut self, item: QueuedItemPtr) -> Slot {
        debug_assert!(item.op.is_deliverable_meta());
        let slot = self.push_raw(item);
        self.num_meta_items += 1;
        slot
    }

    /// Close the checkpoint: append `checkpoint_end` with a seqno one past
    /// the high seqno and flip the state.
    pub fn close(&mut self) {
        debug_assert!(self.is_open());
        let end_seqno = self.high_seqno() as i64 + 1;
        let end = Arc::new(QueuedItem::checkpoint_end(end_seqno));
        self.push_raw(end);
        self.num_meta_items += 1;
        *self.state.write() = CheckpointState::Closed;
    }

    // --- expelling -------------------------------------------------------

    /// Expel items in `[checkpoint_start + 1, up_to]`.
    ///
    /// The boundary walks backwards off meta items, and the checkpoint's
    /// final mutation is never expelled (a checkpoint holding a single
    /// mutation is therefore left alone). Returns the expelled items so
    /// the caller can free them outside its critical section.
    pub fn expel(&mut self, up_to: Slot) -> ExpelResult {
        let first = self.first_user_slot();
        let mut target = Slot(up_to.0.min(self.tail_slot().0));

        // Find the slot of the last surviving non-meta item; the item at
        // that slot stays.
        let last_mutation = self.last_mutation_slot();
        let last_mutation = match last_mutation {
            Some(slot) => slot,
            None => return ExpelResult::default(),
        };
        if target >= last_mutation {
            target = Slot(last_mutation.0.saturating_sub(1));
        }
        // Never expel from a position inside a meta item; back off to the
        // preceding mutation.
        while target >= first {
            match self.item_at(target) {
                Some(item) if item.is_meta() => target = Slot(target.0 - 1),
                _ => break,
            }
        }
        if target < first {
            return ExpelResult::default();
        }

        let expelled_seqno = self
            .item_at(target)
            .map(|item| item.by_seqno as u64)
            .unwrap_or(0);

        let first_phys = 2;
        let last_phys = match self.physical(target) {
            Some(idx) => idx,
            None => return ExpelResult::default(),
        };
        let items: Vec<QueuedItemPtr> = self.queue.drain(first_phys..=last_phys).collect();
        let count = items.len() as u64;
        self.num_expelled += count;

        let mut bytes = 0;
        for item in &items {
            bytes += item.size_in_memory();
        }
        self.queued_items_mem.sub(bytes);
        self.queue_overhead.sub(items.len() * PER_ITEM_QUEUE_OVERHEAD);
        self.highest_expelled_seqno.set(expelled_seqno);

        ExpelResult { items, bytes }
    }

    fn last_mutation_slot(&self) -> Option<Slot> {
        let mut slot = self.tail_slot();
        let first = self.first_user_slot();
        while slot >= first {
            if let Some(item) = self.item_at(slot) {
                if !item.is_meta() {
                    return Some(slot);
                }
            }
            slot = Slot(slot.0 - 1);
        }
        None
    }

    /// Iterate over live entries (test and introspection helper).
    pub fn iter(&self) -> impl Iterator<Item = &QueuedItemPtr> {
        self.queue.iter()
    }
}

impl fmt::Debug for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Checkpoint")
            .field("id", &self.id)
            .field("vbid", &self.vbid)
            .field("type", &self.ckpt_type)
            .field("state", &self.state())
            .field("snap", &(self.snap_start, self.snap_end))
            .field("num_items", &self.num_items)
            .field("num_expelled", &self.num_expelled)
            .finish()
    }
}
