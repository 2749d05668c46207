//! Background destruction of detached checkpoints.
//!
//! The destroyer is not responsible for identifying checkpoints to
//! remove; the manager (directly, or driven by the memory-recovery task)
//! splices them out and hands them over. Freeing a checkpoint means
//! dropping a potentially large queue and two key indexes, which is why
//! it happens here rather than in the writer's critical path.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

use super::manager::CheckpointDisposer;
use super::Checkpoint;
use crate::executor::{Scheduler, Task, TaskOutcome};
use crate::stats::NonNegativeGauge;

/// Owner of a queue of detached checkpoints awaiting destruction.
///
/// `pending_memory` tracks the bytes held by queued but undestroyed
/// checkpoints: enqueueing re-homes each checkpoint's memory counters
/// under this gauge, and dropping them pays the gauge back down.
pub struct CheckpointDestroyer {
    to_destroy: Mutex<Vec<Checkpoint>>,
    pending_mem: Arc<NonNegativeGauge>,
    // Avoids a scheduler wake per enqueue while a run is already queued.
    notified: AtomicBool,
    scheduler: Mutex<Option<Arc<dyn Scheduler>>>,
    self_ref: Weak<CheckpointDestroyer>,
}

impl CheckpointDestroyer {
    /// Create a destroyer with no scheduler; work is drained by
    /// explicitly running [`CheckpointDestroyerTask`].
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            to_destroy: Mutex::new(Vec::new()),
            pending_mem: Arc::new(NonNegativeGauge::new()),
            notified: AtomicBool::new(false),
            scheduler: Mutex::new(None),
            self_ref: weak.clone(),
        })
    }

    /// Wire up a scheduler; enqueues then wake a drain task on demand.
    pub fn set_scheduler(&self, scheduler: Arc<dyn Scheduler>) {
        *self.scheduler.lock() = Some(scheduler);
    }

    /// Bytes held by checkpoints queued but not yet destroyed.
    pub fn pending_memory(&self) -> usize {
        self.pending_mem.get()
    }

    /// Number of checkpoints waiting for destruction.
    pub fn pending_count(&self) -> usize {
        self.to_destroy.lock().len()
    }

    /// Destroy everything currently queued. Returns the number of
    /// checkpoints freed.
    pub fn drain(&self) -> usize {
        let taken: Vec<Checkpoint> = {
            let mut queue = self.to_destroy.lock();
            std::mem::take(&mut *queue)
        };
        self.notified.store(false, Ordering::Release);
        let count = taken.len();
        if count > 0 {
            debug!(count, "destroying detached checkpoints");
        }
        // Dropping the checkpoints decrements pending_mem through their
        // memory counters.
        drop(taken);
        count
    }
}

impl CheckpointDisposer for CheckpointDestroyer {
    fn queue_for_destruction(&self, mut checkpoints: Vec<Checkpoint>) {
        if checkpoints.is_empty() {
            return;
        }
        for ckpt in &mut checkpoints {
            ckpt.set_memory_tracker(Some(Arc::clone(&self.pending_mem)));
        }
        self.to_destroy.lock().append(&mut checkpoints);

        if !self.notified.swap(true, Ordering::AcqRel) {
            let scheduler = self.scheduler.lock().clone();
            if let (Some(scheduler), Some(destroyer)) = (scheduler, self.self_ref.upgrade()) {
                scheduler.schedule(Box::new(CheckpointDestroyerTask::new(destroyer)));
            }
        }
    }
}

/// Task draining a [`CheckpointDestroyer`]'s queue.
pub struct CheckpointDestroyerTask {
    destroyer: Arc<CheckpointDestroyer>,
}

impl CheckpointDestroyerTask {
    /// Create a drain task for `destroyer`.
    pub fn new(destroyer: Arc<CheckpointDestroyer>) -> Self {
        Self { destroyer }
    }
}

impl Task for CheckpointDestroyerTask {
    fn run(&mut self) -> TaskOutcome {
        self.destroyer.drain();
        TaskOutcome::Done
    }

    fn description(&self) -> String {
        "Destroying closed unreferenced checkpoints".to_string()
    }

    fn max_expected_duration(&self) -> Duration {
        Duration::from_millis(50)
    }
}
