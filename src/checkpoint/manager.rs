//! The per-vBucket checkpoint manager.
//!
//! Owns the ordered list of checkpoints for one vBucket and mediates
//! every mutation of it: enqueueing items (with seqno assignment and
//! dedup), cursor registration and traversal, expel, checkpoint rolling
//! and the removal of closed, unreferenced checkpoints.
//!
//! A single mutex serialises all state mutation; consumers receive shared
//! item handles so no user data is copied under the lock. Checkpoint
//! destruction is handed to a [`CheckpointDisposer`] so the freeing of a
//! large queue never happens in the writer's critical path.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::cursor::{
    CheckpointCursor, CursorHandle, SendCheckpointEnd, PERSISTENCE_CURSOR_NAME,
};
use super::{Checkpoint, CheckpointState, CheckpointType, Slot};
use crate::config::CheckpointConfig;
use crate::item::{QueueOp, QueuedItem, QueuedItemPtr};
use crate::seqno::SeqnoAllocator;
use crate::stats::NonNegativeGauge;
use crate::status::{QueueResult, Status};
use crate::vbucket::Vbid;

/// Seqno range of one snapshot, forwarded to replicas so they can admit
/// or reject a batch atomically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotRange {
    /// First seqno of the snapshot
    pub start: u64,
    /// Last seqno of the snapshot
    pub end: u64,
}

/// Snapshot bounds of the open checkpoint plus the current high seqno.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotInfo {
    /// Range of the open checkpoint
    pub range: SnapshotRange,
    /// Highest seqno assigned so far
    pub high_seqno: u64,
}

/// A batch of items pulled for one cursor. Never crosses a checkpoint
/// (and therefore snapshot) boundary.
#[derive(Debug)]
pub struct ItemsForCursor {
    /// The items, in slot (and therefore seqno) order
    pub items: Vec<QueuedItemPtr>,
    /// Snapshot range of the checkpoint the items came from
    pub range: SnapshotRange,
    /// Visible (prepare/abort-hiding) snapshot end
    pub visible_end: u64,
    /// Type of the source checkpoint
    pub checkpoint_type: CheckpointType,
    /// High completed seqno carried by a disk snapshot
    pub high_completed_seqno: Option<u64>,
    /// Whether further items remain beyond this batch
    pub more_available: bool,
}

/// Successful cursor registration.
#[derive(Debug)]
pub struct CursorRegistration {
    /// Shared token for the consumer
    pub handle: Arc<CursorHandle>,
    /// The first seqno the cursor can deliver
    pub next_seqno: u64,
}

/// Receiver of detached checkpoints for background destruction.
pub trait CheckpointDisposer: Send + Sync {
    /// Take ownership of detached checkpoints and free them later.
    fn queue_for_destruction(&self, checkpoints: Vec<Checkpoint>);
}

/// Disposer that frees checkpoints inline; used where no background
/// destroyer is wired up.
#[derive(Debug, Default)]
pub struct InlineDisposer;

impl CheckpointDisposer for InlineDisposer {
    fn queue_for_destruction(&self, checkpoints: Vec<Checkpoint>) {
        drop(checkpoints);
    }
}

/// Observer woken when new items become available for an idle cursor.
pub trait CursorNotifier: Send + Sync {
    /// `cursor` was parked at the tail and a new item arrived behind it.
    fn notify_cursor(&self, vbid: Vbid, cursor: &str);
}

/// Result of a closed-checkpoint removal pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemovalResult {
    /// Checkpoints spliced out
    pub removed: usize,
    /// Bytes those checkpoints accounted for
    pub bytes: usize,
}

struct ManagerInner {
    list: VecDeque<Checkpoint>,
    cursors: HashMap<String, CheckpointCursor>,
    next_checkpoint_id: u64,
    seqno: SeqnoAllocator,
    max_visible_seqno: u64,
}

/// Owner of the ordered checkpoint list for one vBucket.
pub struct CheckpointManager {
    vbid: Vbid,
    config: CheckpointConfig,
    inner: Mutex<ManagerInner>,
    mem_usage: Arc<NonNegativeGauge>,
    disposer: Arc<dyn CheckpointDisposer>,
    notifier: Mutex<Option<Arc<dyn CursorNotifier>>>,
}

impl CheckpointManager {
    /// Create a manager whose open checkpoint continues from
    /// `last_seqno`. The persistence cursor is registered immediately.
    pub fn new(
        vbid: Vbid,
        config: CheckpointConfig,
        last_seqno: u64,
        disposer: Arc<dyn CheckpointDisposer>,
    ) -> Self {
        let mem_usage = Arc::new(NonNegativeGauge::new());
        let open = Checkpoint::new(
            1,
            vbid,
            CheckpointType::Memory,
            last_seqno,
            last_seqno,
            last_seqno,
            None,
            Some(Arc::clone(&mem_usage)),
        );
        open.inc_num_cursors();

        let mut cursors = HashMap::new();
        cursors.insert(
            PERSISTENCE_CURSOR_NAME.to_string(),
            CheckpointCursor::new(
                PERSISTENCE_CURSOR_NAME.to_string(),
                1,
                Slot::SENTINEL,
                SendCheckpointEnd::No,
            ),
        );

        let mut list = VecDeque::new();
        list.push_back(open);

        Self {
            vbid,
            config,
            inner: Mutex::new(ManagerInner {
                list,
                cursors,
                next_checkpoint_id: 2,
                seqno: SeqnoAllocator::new(last_seqno as i64),
                max_visible_seqno: last_seqno,
            }),
            mem_usage,
            disposer,
            notifier: Mutex::new(None),
        }
    }

    /// The vBucket this manager serves.
    pub fn vbid(&self) -> Vbid {
        self.vbid
    }

    /// Install a cursor-wakeup observer.
    pub fn set_notifier(&self, notifier: Arc<dyn CursorNotifier>) {
        *self.notifier.lock() = Some(notifier);
    }

    /// Highest seqno assigned so far.
    pub fn high_seqno(&self) -> u64 {
        self.inner.lock().seqno.current().max(0) as u64
    }

    /// Highest seqno of a client-visible item.
    pub fn max_visible_seqno(&self) -> u64 {
        self.inner.lock().max_visible_seqno
    }

    /// Id of the open checkpoint.
    pub fn open_checkpoint_id(&self) -> u64 {
        let inner = self.inner.lock();
        open_checkpoint(&inner).id()
    }

    /// Number of checkpoints in the list.
    pub fn num_checkpoints(&self) -> usize {
        self.inner.lock().list.len()
    }

    /// Number of registered cursors.
    pub fn num_cursors(&self) -> usize {
        self.inner.lock().cursors.len()
    }

    /// Total bytes accounted to this manager's checkpoints.
    pub fn mem_usage(&self) -> usize {
        self.mem_usage.get()
    }

    /// Snapshot bounds of the open checkpoint and the current high seqno.
    pub fn snapshot_info(&self) -> SnapshotInfo {
        let inner = self.inner.lock();
        let open = open_checkpoint(&inner);
        SnapshotInfo {
            range: SnapshotRange {
                start: open.snapshot_start(),
                end: open.snapshot_end(),
            },
            high_seqno: inner.seqno.current().max(0) as u64,
        }
    }

    // --- enqueue ---------------------------------------------------------

    /// Queue a user item, assigning its seqno unless the item already
    /// carries one (replica replay). Returns the assigned seqno alongside
    /// the queueing status.
    pub fn queue(&self, mut item: QueuedItem) -> Result<(i64, QueueResult), Status> {
        let mut notify: Vec<String> = Vec::new();
        let result = {
            let mut inner = self.inner.lock();

            if item.by_seqno <= 0 {
                item.by_seqno = inner.seqno.next();
            } else if item.by_seqno <= inner.seqno.current() {
                warn!(
                    vbid = self.vbid.0,
                    seqno = item.by_seqno,
                    last = inner.seqno.current(),
                    "seqno regression on queue"
                );
                return Err(Status::SeqnoRegression);
            } else {
                inner.seqno.advance_to(item.by_seqno);
            }
            let seqno = item.by_seqno;
            let visible = item.is_committed_namespace();

            // Roll on size before appending.
            if open_checkpoint(&inner).num_items() >= self.config.max_items_per_checkpoint {
                self.roll_open_checkpoint(&mut inner, CheckpointType::Memory, None);
            }

            let item = Arc::new(item);
            let previous_tail = open_checkpoint(&inner).tail_slot();
            let open_was_empty = open_checkpoint(&inner).num_items() == 0;
            let open_id = open_checkpoint(&inner).id();
            let persistence_slot = persistence_slot_in(&inner, open_id);

            let mut result = open_checkpoint_mut(&mut inner)
                .queue(Arc::clone(&item), persistence_slot);
            if result.status == crate::status::QueueStatus::FailureDuplicateItem {
                // The open checkpoint cannot take this item (SyncWrite
                // duplicate); roll and retry in the fresh checkpoint.
                self.roll_open_checkpoint(&mut inner, CheckpointType::Memory, None);
                let open_id = open_checkpoint(&inner).id();
                let persistence_slot = persistence_slot_in(&inner, open_id);
                result = open_checkpoint_mut(&mut inner).queue(item, persistence_slot);
            }

            if visible {
                inner.max_visible_seqno = seqno as u64;
            }

            // Wake any cursor that had consumed everything up to the
            // previous tail of the open checkpoint.
            let open_id = open_checkpoint(&inner).id();
            for cursor in inner.cursors.values() {
                if cursor.checkpoint_id == open_id
                    && (open_was_empty || cursor.slot >= previous_tail)
                {
                    notify.push(cursor.name.clone());
                }
            }

            Ok((seqno, result))
        };

        if !notify.is_empty() {
            let notifier = self.notifier.lock().clone();
            if let Some(notifier) = notifier {
                for name in &notify {
                    notifier.notify_cursor(self.vbid, name);
                }
            }
        }

        result
    }

    /// Append a `set_vbucket_state` meta marker to the open checkpoint.
    /// It shares the seqno of the next mutation.
    pub fn queue_set_vbucket_state(&self) {
        let mut inner = self.inner.lock();
        let seqno = inner.seqno.current() + 1;
        open_checkpoint_mut(&mut inner)
            .add_meta_item(Arc::new(QueuedItem::set_vbucket_state(seqno)));
    }

    /// Close the open checkpoint and begin a new one.
    pub fn force_new_checkpoint(&self) {
        let mut inner = self.inner.lock();
        self.roll_open_checkpoint(&mut inner, CheckpointType::Memory, None);
    }

    /// Begin a new checkpoint for a received snapshot. Items of the
    /// snapshot are then fed through [`queue`](Self::queue) with their
    /// producer-assigned seqnos.
    pub fn create_snapshot(
        &self,
        ckpt_type: CheckpointType,
        start: u64,
        end: u64,
        visible_end: u64,
        high_completed_seqno: Option<u64>,
    ) {
        let mut inner = self.inner.lock();
        self.roll_open_checkpoint(
            &mut inner,
            ckpt_type,
            Some((start, end, visible_end, high_completed_seqno)),
        );
    }

    fn roll_open_checkpoint(
        &self,
        inner: &mut ManagerInner,
        ckpt_type: CheckpointType,
        snapshot: Option<(u64, u64, u64, Option<u64>)>,
    ) {
        open_checkpoint_mut(inner).close();
        let id = inner.next_checkpoint_id;
        inner.next_checkpoint_id += 1;

        let next_seqno = (inner.seqno.current() + 1) as u64;
        let (start, end, visible_end, hcs) =
            snapshot.unwrap_or((next_seqno, next_seqno, next_seqno, None));
        let ckpt = Checkpoint::new(
            id,
            self.vbid,
            ckpt_type,
            start,
            end,
            visible_end,
            hcs,
            Some(Arc::clone(&self.mem_usage)),
        );
        debug!(vbid = self.vbid.0, id, ?ckpt_type, "new open checkpoint");
        inner.list.push_back(ckpt);

        // Enforce the soft cap on held checkpoints by reclaiming any
        // closed, unreferenced prefix right away.
        if inner.list.len() > self.config.max_checkpoints {
            let detached = detach_closed_unreferenced(inner);
            if !detached.is_empty() {
                self.dispose(detached);
            }
        }
    }

    // --- cursors ---------------------------------------------------------

    /// Register (or re-register) a cursor that wants to receive items
    /// with seqno >= `start_seqno`.
    ///
    /// Fails with `OutOfRange` when items below `start_seqno` have
    /// already been released from memory, in which case the stream must
    /// backfill from disk instead.
    pub fn register_cursor(
        &self,
        name: &str,
        start_seqno: u64,
        send_checkpoint_end: SendCheckpointEnd,
    ) -> Result<CursorRegistration, Status> {
        let mut inner = self.inner.lock();

        let minimum = inner
            .list
            .iter()
            .map(Checkpoint::minimum_cursor_seqno)
            .min()
            .unwrap_or(0);
        if start_seqno < minimum {
            return Err(Status::OutOfRange);
        }

        if let Some(old) = inner.cursors.remove(name) {
            old.handle.mark_dropped();
            if let Some(ckpt) = checkpoint_by_id(&inner, old.checkpoint_id) {
                ckpt.dec_num_cursors();
            }
        }

        // Pick the first checkpoint able to serve `start_seqno`.
        let target_idx = inner
            .list
            .iter()
            .position(|ckpt| ckpt.high_seqno() >= start_seqno)
            .unwrap_or(inner.list.len() - 1);
        let ckpt = &inner.list[target_idx];

        // Position just before the first item with seqno >= start_seqno.
        let mut slot = Slot::SENTINEL;
        let mut next_seqno = ckpt.high_seqno() + 1;
        let mut probe = slot;
        while let Some(candidate) = ckpt.next_occupied_slot(probe) {
            let item = match ckpt.item_at(candidate) {
                Some(item) => item,
                None => break,
            };
            if item.op != QueueOp::Empty && item.by_seqno as u64 >= start_seqno {
                next_seqno = item.by_seqno as u64;
                break;
            }
            probe = candidate;
            slot = candidate;
        }

        ckpt.inc_num_cursors();
        let checkpoint_id = ckpt.id();
        let cursor = CheckpointCursor::new(
            name.to_string(),
            checkpoint_id,
            slot,
            send_checkpoint_end,
        );
        let handle = cursor.handle();
        inner.cursors.insert(name.to_string(), cursor);

        debug!(
            vbid = self.vbid.0,
            cursor = name,
            start_seqno,
            checkpoint_id,
            "cursor registered"
        );
        Ok(CursorRegistration { handle, next_seqno })
    }

    /// Remove a cursor on stream teardown. The persistence cursor cannot
    /// be removed.
    pub fn remove_cursor(&self, name: &str) -> bool {
        if name == PERSISTENCE_CURSOR_NAME {
            return false;
        }
        let detached = {
            let mut inner = self.inner.lock();
            let cursor = match inner.cursors.remove(name) {
                Some(cursor) => cursor,
                None => return false,
            };
            cursor.handle.mark_dropped();
            if let Some(ckpt) = checkpoint_by_id(&inner, cursor.checkpoint_id) {
                ckpt.dec_num_cursors();
            }
            self.maybe_eager_detach(&mut inner)
        };
        if !detached.is_empty() {
            self.dispose(detached);
        }
        true
    }

    /// Drop a cursor under memory pressure. Identical to removal except
    /// in intent: the owning stream observes the drop via its handle and
    /// falls back to backfill.
    pub fn drop_cursor(&self, name: &str) -> bool {
        self.remove_cursor(name)
    }

    /// Name and seqno-position of the slowest cursor that is not the
    /// persistence cursor, if any.
    pub fn slowest_droppable_cursor(&self) -> Option<(String, u64)> {
        let inner = self.inner.lock();
        let mut slowest: Option<(String, u64)> = None;
        for cursor in inner.cursors.values() {
            if cursor.is_persistence() {
                continue;
            }
            let seqno = cursor_seqno(&inner, cursor);
            let replace = slowest.as_ref().map_or(true, |(_, s)| seqno < *s);
            if replace {
                slowest = Some((cursor.name.clone(), seqno));
            }
        }
        slowest
    }

    /// Pull the next batch of items for `cursor`.
    ///
    /// The batch never crosses a checkpoint boundary; a disk checkpoint
    /// is always delivered as a single snapshot regardless of the limits.
    pub fn get_items_for_cursor(
        &self,
        name: &str,
        max_items: usize,
        max_bytes: usize,
    ) -> Result<ItemsForCursor, Status> {
        let (result, detached) = {
            let mut inner = self.inner.lock();
            if !inner.cursors.contains_key(name) {
                return Err(Status::Failed);
            }

            // Hop the cursor over fully-drained closed checkpoints first.
            let mut moved = advance_cursor_checkpoint(&mut inner, name);

            let cursor = &inner.cursors[name];
            let ckpt_idx = match checkpoint_index(&inner, cursor.checkpoint_id) {
                Some(idx) => idx,
                None => return Err(Status::Failed),
            };

            let is_disk = inner.list[ckpt_idx].is_disk();
            let send_end = cursor.send_checkpoint_end;
            let mut items = Vec::new();
            let mut bytes = 0usize;
            let mut slot = cursor.slot;
            let mut truncated = false;

            while let Some(next) = inner.list[ckpt_idx].next_occupied_slot(slot) {
                let item = match inner.list[ckpt_idx].item_at(next) {
                    Some(item) => Arc::clone(item),
                    None => break,
                };
                if item.op == QueueOp::Empty {
                    slot = next;
                    continue;
                }
                if !is_disk
                    && !items.is_empty()
                    && (items.len() >= max_items || bytes >= max_bytes)
                {
                    truncated = true;
                    break;
                }
                if item.op == QueueOp::CheckpointEnd && send_end == SendCheckpointEnd::No {
                    slot = next;
                    continue;
                }
                bytes += item.size_in_memory();
                items.push(item);
                slot = next;
            }

            let ckpt = &inner.list[ckpt_idx];
            let range = SnapshotRange {
                start: ckpt.snapshot_start(),
                end: ckpt.snapshot_end(),
            };
            let visible_end = ckpt.visible_snapshot_end();
            let checkpoint_type = ckpt.checkpoint_type();
            let high_completed_seqno = ckpt.high_completed_seqno();
            let more_available = truncated || ckpt_idx + 1 < inner.list.len();

            let num_delivered = items.len() as u64;
            let cursor = inner
                .cursors
                .get_mut(name)
                .expect("cursor checked above");
            cursor.slot = slot;
            cursor.num_visits += num_delivered;

            // If the batch drained a closed checkpoint, move the cursor
            // into the next one so the drained checkpoint can be removed.
            moved |= advance_cursor_checkpoint(&mut inner, name);

            let detached = if moved {
                self.maybe_eager_detach(&mut inner)
            } else {
                Vec::new()
            };

            (
                ItemsForCursor {
                    items,
                    range,
                    visible_end,
                    checkpoint_type,
                    high_completed_seqno,
                    more_available,
                },
                detached,
            )
        };
        if !detached.is_empty() {
            self.dispose(detached);
        }
        Ok(result)
    }

    // --- memory recovery -------------------------------------------------

    /// Splice every closed checkpoint with no resident cursors out of the
    /// list and hand it to the disposer. Cursors parked at the very end
    /// of a drained closed checkpoint are moved forward first.
    pub fn remove_closed_unreferenced(&self) -> RemovalResult {
        let detached = {
            let mut inner = self.inner.lock();
            let names: Vec<String> = inner.cursors.keys().cloned().collect();
            for name in names {
                advance_cursor_checkpoint(&mut inner, &name);
            }
            detach_closed_unreferenced(&mut inner)
        };
        if detached.is_empty() {
            return RemovalResult::default();
        }
        let bytes = detached.iter().map(Checkpoint::mem_usage).sum();
        let removed = detached.len();
        self.dispose(detached);
        RemovalResult { removed, bytes }
    }

    /// Expel the already-consumed prefix of the oldest checkpoint still
    /// holding a cursor. Returns the bytes released; the expelled items
    /// are dropped outside the manager lock.
    pub fn expel_items(&self) -> usize {
        let expelled = {
            let mut inner = self.inner.lock();

            let target_idx = match inner
                .list
                .iter()
                .position(|ckpt| ckpt.num_cursors() > 0)
            {
                Some(idx) => idx,
                None => return 0,
            };
            let ckpt_id = inner.list[target_idx].id();

            // The slowest cursor bounds the expellable prefix.
            let slowest = inner
                .cursors
                .values()
                .filter(|cursor| cursor.checkpoint_id == ckpt_id)
                .map(|cursor| cursor.slot)
                .min();
            let slowest = match slowest {
                Some(slot) => slot,
                None => return 0,
            };

            let result = inner.list[target_idx].expel(slowest);
            if result.items.is_empty() {
                return 0;
            }

            // Reposition cursors whose slot fell inside the expelled
            // range; their next advance resumes at the first survivor.
            let boundary = inner.list[target_idx]
                .next_occupied_slot(Slot::START)
                .unwrap_or(Slot::START);
            for cursor in inner.cursors.values_mut() {
                if cursor.checkpoint_id == ckpt_id
                    && cursor.slot > Slot::START
                    && cursor.slot < boundary
                {
                    cursor.slot = Slot::START;
                }
            }
            result
        };
        let bytes = expelled.bytes;
        drop(expelled);
        bytes
    }

    fn maybe_eager_detach(&self, inner: &mut ManagerInner) -> Vec<Checkpoint> {
        if !self.config.eager_disposal {
            return Vec::new();
        }
        detach_closed_unreferenced(inner)
    }

    fn dispose(&self, detached: Vec<Checkpoint>) {
        debug!(
            vbid = self.vbid.0,
            count = detached.len(),
            "checkpoints queued for destruction"
        );
        self.disposer.queue_for_destruction(detached);
    }
}

// --- lock-held helpers ---------------------------------------------------

fn open_checkpoint(inner: &ManagerInner) -> &Checkpoint {
    inner.list.back().expect("manager always has an open checkpoint")
}

fn open_checkpoint_mut(inner: &mut ManagerInner) -> &mut Checkpoint {
    inner
        .list
        .back_mut()
        .expect("manager always has an open checkpoint")
}

fn checkpoint_index(inner: &ManagerInner, id: u64) -> Option<usize> {
    inner.list.iter().position(|ckpt| ckpt.id() == id)
}

fn checkpoint_by_id(inner: &ManagerInner, id: u64) -> Option<&Checkpoint> {
    inner.list.iter().find(|ckpt| ckpt.id() == id)
}

fn persistence_slot_in(inner: &ManagerInner, checkpoint_id: u64) -> Option<Slot> {
    inner
        .cursors
        .get(PERSISTENCE_CURSOR_NAME)
        .filter(|cursor| cursor.checkpoint_id == checkpoint_id)
        .map(|cursor| cursor.slot)
}

fn cursor_seqno(inner: &ManagerInner, cursor: &CheckpointCursor) -> u64 {
    match checkpoint_by_id(inner, cursor.checkpoint_id) {
        Some(ckpt) => ckpt
            .item_at(cursor.slot)
            .map(|item| item.by_seqno.max(0) as u64)
            .unwrap_or_else(|| ckpt.minimum_cursor_seqno()),
        None => 0,
    }
}

/// Move `name`'s cursor out of a fully-drained closed checkpoint into the
/// following one. Returns true if the cursor moved.
fn advance_cursor_checkpoint(inner: &mut ManagerInner, name: &str) -> bool {
    let mut moved = false;
    loop {
        let cursor = match inner.cursors.get(name) {
            Some(cursor) => cursor,
            None => return moved,
        };
        let idx = match checkpoint_index(inner, cursor.checkpoint_id) {
            Some(idx) => idx,
            None => return moved,
        };
        let ckpt = &inner.list[idx];
        if ckpt.is_open() || ckpt.next_occupied_slot(cursor.slot).is_some() {
            return moved;
        }
        if idx + 1 >= inner.list.len() {
            return moved;
        }
        let next_id = inner.list[idx + 1].id();
        inner.list[idx].dec_num_cursors();
        inner.list[idx + 1].inc_num_cursors();
        let cursor = inner.cursors.get_mut(name).expect("checked above");
        cursor.checkpoint_id = next_id;
        cursor.slot = Slot::SENTINEL;
        moved = true;
    }
}

/// Detach every closed, cursor-free checkpoint from the front of the
/// list. The open checkpoint is never detached.
fn detach_closed_unreferenced(inner: &mut ManagerInner) -> Vec<Checkpoint> {
    let mut detached = Vec::new();
    while inner.list.len() > 1 {
        let front = inner.list.front().expect("len checked");
        if front.state() != CheckpointState::Closed || front.num_cursors() != 0 {
            break;
        }
        let mut ckpt = inner.list.pop_front().expect("len checked");
        ckpt.detach();
        detached.push(ckpt);
    }
    detached
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::DocKey;
    use crate::status::QueueStatus;

    fn key(s: &[u8]) -> DocKey {
        DocKey::from_logical(s)
    }

    fn mutation(k: &[u8]) -> QueuedItem {
        QueuedItem::mutation(key(k), vec![0; 16], 0, 0)
    }

    fn manager() -> CheckpointManager {
        CheckpointManager::new(
            Vbid(0),
            CheckpointConfig::default(),
            0,
            Arc::new(InlineDisposer),
        )
    }

    fn manager_with(config: CheckpointConfig) -> CheckpointManager {
        CheckpointManager::new(Vbid(0), config, 0, Arc::new(InlineDisposer))
    }

    fn drain(mgr: &CheckpointManager, cursor: &str) -> Vec<QueuedItemPtr> {
        let mut all = Vec::new();
        loop {
            let batch = mgr.get_items_for_cursor(cursor, 1000, usize::MAX).unwrap();
            let empty = batch.items.is_empty();
            all.extend(batch.items);
            if empty && !batch.more_available {
                return all;
            }
            if empty {
                // Crossed into the next checkpoint; keep pulling.
                continue;
            }
        }
    }

    #[test]
    fn test_new_manager_shape() {
        let mgr = manager();
        assert_eq!(mgr.num_checkpoints(), 1);
        assert_eq!(mgr.num_cursors(), 1);
        assert_eq!(mgr.open_checkpoint_id(), 1);
        assert_eq!(mgr.high_seqno(), 0);
    }

    #[test]
    fn test_queue_assigns_seqnos() {
        let mgr = manager();
        let (s1, r1) = mgr.queue(mutation(b"a")).unwrap();
        let (s2, r2) = mgr.queue(mutation(b"b")).unwrap();
        assert_eq!((s1, s2), (1, 2));
        assert_eq!(r1.status, QueueStatus::SuccessNewItem);
        assert_eq!(r2.status, QueueStatus::SuccessNewItem);
        assert_eq!(mgr.high_seqno(), 2);
    }

    #[test]
    fn test_queue_preassigned_regression() {
        let mgr = manager();
        let mut item = mutation(b"a");
        item.by_seqno = 5;
        mgr.queue(item).unwrap();

        let mut stale = mutation(b"b");
        stale.by_seqno = 3;
        assert_eq!(mgr.queue(stale), Err(Status::SeqnoRegression));
    }

    #[test]
    fn test_dedup_in_open_checkpoint() {
        let mgr = manager();
        mgr.queue(QueuedItem::mutation(key(b"a"), b"v1".to_vec(), 0, 0))
            .unwrap();
        let (seqno, result) = mgr
            .queue(QueuedItem::mutation(key(b"a"), b"v2".to_vec(), 0, 0))
            .unwrap();
        // Persistence cursor has not consumed the first entry yet.
        assert_eq!(result.status, QueueStatus::SuccessExistingItem);
        assert_eq!(seqno, 2);

        let items = drain(&mgr, PERSISTENCE_CURSOR_NAME);
        let user: Vec<_> = items.iter().filter(|item| !item.is_meta()).collect();
        assert_eq!(user.len(), 1);
        assert_eq!(user[0].by_seqno, 2);
        assert_eq!(user[0].value.as_deref(), Some(b"v2".as_ref()));
    }

    #[test]
    fn test_dedup_after_flush_is_persist_again() {
        let mgr = manager();
        mgr.queue(mutation(b"a")).unwrap();
        drain(&mgr, PERSISTENCE_CURSOR_NAME);

        let (_, result) = mgr.queue(mutation(b"a")).unwrap();
        assert_eq!(result.status, QueueStatus::SuccessPersistAgain);
    }

    #[test]
    fn test_roll_on_max_items() {
        let mgr = manager_with(CheckpointConfig {
            max_items_per_checkpoint: 2,
            ..CheckpointConfig::default()
        });
        mgr.queue(mutation(b"a")).unwrap();
        mgr.queue(mutation(b"b")).unwrap();
        assert_eq!(mgr.num_checkpoints(), 1);
        mgr.queue(mutation(b"c")).unwrap();
        assert_eq!(mgr.num_checkpoints(), 2);
        assert_eq!(mgr.open_checkpoint_id(), 2);
    }

    #[test]
    fn test_duplicate_prepare_rolls_checkpoint() {
        use crate::item::{DurabilityLevel, DurabilityReq};
        let durability = DurabilityReq {
            level: DurabilityLevel::Majority,
            timeout_ms: None,
        };
        let mgr = manager();
        mgr.queue(QueuedItem::prepare(key(b"a"), vec![1], 0, 0, durability))
            .unwrap();
        let (seqno, result) = mgr
            .queue(QueuedItem::prepare(key(b"a"), vec![2], 0, 0, durability))
            .unwrap();
        assert_eq!(result.status, QueueStatus::SuccessNewItem);
        assert_eq!(seqno, 2);
        // The duplicate forced a new checkpoint.
        assert_eq!(mgr.num_checkpoints(), 2);
    }

    #[test]
    fn test_register_cursor_out_of_range() {
        let config = CheckpointConfig {
            max_items_per_checkpoint: 1,
            eager_disposal: true,
            ..CheckpointConfig::default()
        };
        let mgr = manager_with(config);
        for i in 0..5u8 {
            mgr.queue(mutation(&[b'k', i])).unwrap();
        }
        // Persistence drains everything; closed checkpoints get disposed
        // eagerly as the cursor hops forward.
        drain(&mgr, PERSISTENCE_CURSOR_NAME);
        assert_eq!(mgr.num_checkpoints(), 1);

        assert!(matches!(
            mgr.register_cursor("dcp", 1, SendCheckpointEnd::No),
            Err(Status::OutOfRange)
        ));
        let registration = mgr
            .register_cursor("dcp", 5, SendCheckpointEnd::No)
            .unwrap();
        assert_eq!(registration.next_seqno, 5);
    }

    #[test]
    fn test_cursor_batches_do_not_cross_checkpoints() {
        let mgr = manager();
        mgr.queue(mutation(b"a")).unwrap();
        mgr.queue(mutation(b"b")).unwrap();
        mgr.force_new_checkpoint();
        mgr.queue(mutation(b"c")).unwrap();

        let batch = mgr
            .get_items_for_cursor(PERSISTENCE_CURSOR_NAME, 1000, usize::MAX)
            .unwrap();
        // checkpoint_start + a + b (checkpoint_end suppressed for the
        // persistence cursor); "c" lives in the next snapshot.
        let seqnos: Vec<i64> = batch.items.iter().map(|item| item.by_seqno).collect();
        assert_eq!(seqnos, vec![0, 1, 2]);
        assert!(batch.more_available);
        assert_eq!(batch.range.start, 0);
        assert_eq!(batch.range.end, 2);

        let batch = mgr
            .get_items_for_cursor(PERSISTENCE_CURSOR_NAME, 1000, usize::MAX)
            .unwrap();
        let user: Vec<i64> = batch
            .items
            .iter()
            .filter(|item| !item.is_meta())
            .map(|item| item.by_seqno)
            .collect();
        assert_eq!(user, vec![3]);
        assert!(!batch.more_available);
    }

    #[test]
    fn test_items_in_seqno_order_per_cursor() {
        let mgr = manager();
        for i in 0..20u8 {
            mgr.queue(mutation(&[b'k', i % 7])).unwrap();
        }
        let items = drain(&mgr, PERSISTENCE_CURSOR_NAME);
        let mut last = 0;
        for item in items.iter().filter(|item| !item.is_meta()) {
            assert!(item.by_seqno > last);
            last = item.by_seqno;
        }
    }

    #[test]
    fn test_remove_closed_unreferenced_moves_drained_cursors() {
        let mgr = manager();
        mgr.queue(mutation(b"a")).unwrap();
        mgr.queue(mutation(b"b")).unwrap();
        mgr.force_new_checkpoint();
        mgr.queue(mutation(b"c")).unwrap();

        // Both cursors drain everything.
        mgr.register_cursor("dcp", 0, SendCheckpointEnd::No).unwrap();
        drain(&mgr, PERSISTENCE_CURSOR_NAME);
        drain(&mgr, "dcp");

        let result = mgr.remove_closed_unreferenced();
        assert_eq!(result.removed, 1);
        assert!(result.bytes > 0);
        assert_eq!(mgr.num_checkpoints(), 1);
        // Both cursors now live in the open checkpoint.
        assert_eq!(mgr.num_cursors(), 2);
    }

    #[test]
    fn test_remove_blocked_by_resident_cursor() {
        let mgr = manager();
        mgr.queue(mutation(b"a")).unwrap();
        mgr.force_new_checkpoint();
        mgr.queue(mutation(b"b")).unwrap();

        // dcp cursor never reads, so it pins the closed checkpoint.
        mgr.register_cursor("dcp", 0, SendCheckpointEnd::No).unwrap();
        drain(&mgr, PERSISTENCE_CURSOR_NAME);

        let result = mgr.remove_closed_unreferenced();
        assert_eq!(result.removed, 0);
        assert_eq!(mgr.num_checkpoints(), 2);
    }

    #[test]
    fn test_expel_items_frees_consumed_prefix() {
        let mgr = manager();
        mgr.queue(mutation(b"k1")).unwrap();
        mgr.queue(mutation(b"k2")).unwrap();
        mgr.queue(mutation(b"k3")).unwrap();
        drain(&mgr, PERSISTENCE_CURSOR_NAME);

        let before = mgr.mem_usage();
        let freed = mgr.expel_items();
        assert!(freed > 0);
        assert!(mgr.mem_usage() < before);

        // A new cursor can only pick up from the surviving tail.
        assert!(matches!(
            mgr.register_cursor("dcp", 1, SendCheckpointEnd::No),
            Err(Status::OutOfRange)
        ));
        mgr.register_cursor("dcp", 3, SendCheckpointEnd::No).unwrap();
    }

    #[test]
    fn test_expel_bounded_by_slowest_cursor() {
        let mgr = manager();
        mgr.queue(mutation(b"k1")).unwrap();
        mgr.queue(mutation(b"k2")).unwrap();
        mgr.queue(mutation(b"k3")).unwrap();
        // dcp cursor stays at the start; nothing may be expelled.
        mgr.register_cursor("dcp", 0, SendCheckpointEnd::No).unwrap();
        drain(&mgr, PERSISTENCE_CURSOR_NAME);

        assert_eq!(mgr.expel_items(), 0);

        // Once the slow cursor reads one item, its prefix can go.
        let batch = mgr.get_items_for_cursor("dcp", 2, 1).unwrap();
        assert!(!batch.items.is_empty());
        let _ = mgr.expel_items();
    }

    #[test]
    fn test_drop_cursor_never_persistence() {
        let mgr = manager();
        assert!(!mgr.drop_cursor(PERSISTENCE_CURSOR_NAME));
        mgr.register_cursor("dcp", 0, SendCheckpointEnd::No).unwrap();
        let handle = {
            // Keep the handle to observe the drop.
            mgr.register_cursor("dcp2", 0, SendCheckpointEnd::No)
                .unwrap()
                .handle
        };
        assert!(mgr.drop_cursor("dcp2"));
        assert!(handle.is_dropped());
        assert_eq!(mgr.num_cursors(), 2);
    }

    #[test]
    fn test_slowest_droppable_cursor() {
        let mgr = manager();
        mgr.queue(mutation(b"a")).unwrap();
        mgr.queue(mutation(b"b")).unwrap();
        mgr.register_cursor("fast", 0, SendCheckpointEnd::No).unwrap();
        mgr.register_cursor("slow", 0, SendCheckpointEnd::No).unwrap();
        drain(&mgr, "fast");

        let (name, _) = mgr.slowest_droppable_cursor().unwrap();
        assert_eq!(name, "slow");
    }

    #[test]
    fn test_queue_set_vbucket_state_shares_next_seqno() {
        let mgr = manager();
        mgr.queue(mutation(b"a")).unwrap();
        mgr.queue_set_vbucket_state();
        let (seqno, _) = mgr.queue(mutation(b"b")).unwrap();
        assert_eq!(seqno, 2);

        let items = drain(&mgr, PERSISTENCE_CURSOR_NAME);
        let marker = items
            .iter()
            .find(|item| item.op == QueueOp::SetVBucketState)
            .unwrap();
        assert_eq!(marker.by_seqno, 2);
    }

    #[test]
    fn test_disk_snapshot_single_batch() {
        let mgr = manager();
        mgr.create_snapshot(CheckpointType::Disk, 1, 3, 3, Some(2));
        for (k, seqno) in [(b"a", 1i64), (b"b", 2), (b"c", 3)] {
            let mut item = QueuedItem::mutation(key(k), vec![0; 8], 0, 0);
            item.by_seqno = seqno;
            mgr.queue(item).unwrap();
        }

        // Hop the persistence cursor out of the drained first checkpoint.
        let batch = mgr
            .get_items_for_cursor(PERSISTENCE_CURSOR_NAME, 1000, usize::MAX)
            .unwrap();
        assert!(batch.items.iter().all(|item| item.is_meta()));

        // Tiny limits must not split a disk snapshot.
        let batch = mgr
            .get_items_for_cursor(PERSISTENCE_CURSOR_NAME, 1, 1)
            .unwrap();
        assert_eq!(batch.checkpoint_type, CheckpointType::Disk);
        let user: Vec<i64> = batch
            .items
            .iter()
            .filter(|item| !item.is_meta())
            .map(|item| item.by_seqno)
            .collect();
        assert_eq!(user, vec![1, 2, 3]);
        assert_eq!(batch.high_completed_seqno, Some(2));
        assert_eq!((batch.range.start, batch.range.end), (1, 3));
    }

    #[test]
    fn test_memory_accounting_matches_checkpoints() {
        let mgr = manager();
        for i in 0..10u8 {
            mgr.queue(mutation(&[b'k', i])).unwrap();
        }
        mgr.force_new_checkpoint();
        mgr.queue(mutation(b"tail")).unwrap();

        let inner = mgr.inner.lock();
        let sum: usize = inner.list.iter().map(Checkpoint::mem_usage).sum();
        assert_eq!(sum, mgr.mem_usage.get());
    }

    #[test]
    fn test_snapshot_info_tracks_open_checkpoint() {
        let mgr = manager();
        mgr.queue(mutation(b"a")).unwrap();
        mgr.queue(mutation(b"b")).unwrap();
        let info = mgr.snapshot_info();
        assert_eq!(info.high_seqno, 2);
        assert_eq!(info.range.end, 2);
    }
}
