//! Checkpoint cursors: positioned readers over a checkpoint list.
//!
//! A cursor marks how far one consumer (the persistence path, or a
//! replication stream) has read. Cursors are positioned *before* the next
//! item to return and advanced before being dereferenced.
//!
//! The manager owns each cursor's position; consumers hold a shared
//! [`CursorHandle`] through which they observe being dropped by the
//! memory-recovery path. A dropped stream falls back to a disk backfill
//! and re-registers.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::Slot;

/// Name of the distinguished persistence cursor. Always registered,
/// never dropped.
pub const PERSISTENCE_CURSOR_NAME: &str = "persistence";

/// Whether the consumer wants `checkpoint_end` meta items delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendCheckpointEnd {
    /// Deliver `checkpoint_end` markers
    Yes,
    /// Suppress `checkpoint_end` markers
    No,
}

/// Shared token returned from cursor registration.
#[derive(Debug)]
pub struct CursorHandle {
    name: String,
    dropped: AtomicBool,
}

impl CursorHandle {
    pub(crate) fn new(name: String) -> Arc<Self> {
        Arc::new(Self {
            name,
            dropped: AtomicBool::new(false),
        })
    }

    /// The cursor's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// True once the memory-recovery path has dropped this cursor. The
    /// owning stream must stop using it and backfill from disk.
    pub fn is_dropped(&self) -> bool {
        self.dropped.load(Ordering::Acquire)
    }

    pub(crate) fn mark_dropped(&self) {
        self.dropped.store(true, Ordering::Release);
    }
}

/// A cursor's position within the checkpoint list. Owned by the manager
/// and mutated only under the manager lock.
pub struct CheckpointCursor {
    /// Unique name within the manager.
    pub(crate) name: String,
    /// Id of the checkpoint the cursor currently resides in.
    pub(crate) checkpoint_id: u64,
    /// Position within that checkpoint; the item at this slot has already
    /// been consumed.
    pub(crate) slot: Slot,
    /// Whether `checkpoint_end` markers are delivered to this consumer.
    pub(crate) send_checkpoint_end: SendCheckpointEnd,
    /// Shared token observed by the consumer.
    pub(crate) handle: Arc<CursorHandle>,
    /// Items handed out since registration, for introspection.
    pub(crate) num_visits: u64,
}

impl CheckpointCursor {
    pub(crate) fn new(
        name: String,
        checkpoint_id: u64,
        slot: Slot,
        send_checkpoint_end: SendCheckpointEnd,
    ) -> Self {
        let handle = CursorHandle::new(name.clone());
        Self {
            name,
            checkpoint_id,
            slot,
            send_checkpoint_end,
            handle,
            num_visits: 0,
        }
    }

    /// The cursor's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether this is the persistence cursor.
    pub fn is_persistence(&self) -> bool {
        self.name == PERSISTENCE_CURSOR_NAME
    }

    /// Id of the checkpoint the cursor resides in.
    pub fn checkpoint_id(&self) -> u64 {
        self.checkpoint_id
    }

    /// Position within the resident checkpoint.
    pub fn slot(&self) -> Slot {
        self.slot
    }

    /// Shared token for the consumer.
    pub fn handle(&self) -> Arc<CursorHandle> {
        Arc::clone(&self.handle)
    }
}

impl fmt::Debug for CheckpointCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CheckpointCursor")
            .field("name", &self.name)
            .field("checkpoint_id", &self.checkpoint_id)
            .field("slot", &self.slot)
            .field("dropped", &self.handle.is_dropped())
            .finish()
    }
}
