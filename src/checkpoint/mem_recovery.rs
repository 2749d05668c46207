//! Checkpoint memory recovery.
//!
//! Watches the total memory held in checkpoints across all vBuckets and,
//! once it climbs past the upper mark of the checkpoint quota, releases
//! memory down to the lower mark in three escalating phases:
//!
//! 1. remove closed, unreferenced checkpoints;
//! 2. expel the already-consumed prefix of referenced checkpoints;
//! 3. drop the slowest replication cursors (never the persistence
//!    cursor), then retry removal.
//!
//! vBuckets are processed in decreasing checkpoint-memory order; ties go
//! to the lower vBucket id.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::executor::{Task, TaskOutcome};
use crate::stats::EngineStats;
use crate::vbucket::{VBucketMap, Vbid};

/// What one recovery pass achieved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryOutcome {
    /// Bytes released across all phases
    pub bytes_released: usize,
    /// Checkpoints spliced to the destroyer
    pub checkpoints_removed: usize,
    /// Cursors dropped
    pub cursors_dropped: usize,
}

/// Periodic task reducing checkpoint memory usage.
pub struct CheckpointMemRecoveryTask {
    vbmap: Arc<VBucketMap>,
    stats: Arc<EngineStats>,
    checkpoint_quota: usize,
    lower_mark: f64,
    upper_mark: f64,
    interval: Duration,
}

impl CheckpointMemRecoveryTask {
    /// Create a recovery task over `vbmap`.
    pub fn new(
        vbmap: Arc<VBucketMap>,
        stats: Arc<EngineStats>,
        checkpoint_quota: usize,
        lower_mark: f64,
        upper_mark: f64,
        interval: Duration,
    ) -> Self {
        Self {
            vbmap,
            stats,
            checkpoint_quota,
            lower_mark,
            upper_mark,
            interval,
        }
    }

    /// Total checkpoint memory across live vBuckets.
    pub fn total_checkpoint_mem(&self) -> usize {
        self.vbmap
            .live_vbids()
            .into_iter()
            .filter_map(|vbid| self.vbmap.get(vbid))
            .map(|vb| vb.checkpoint_manager().mem_usage())
            .sum()
    }

    /// vBuckets in decreasing checkpoint-memory order; equal usage is
    /// ordered by ascending vBucket id.
    pub fn vbuckets_sorted_by_checkpoint_mem(&self) -> Vec<(Vbid, usize)> {
        let mut usage: Vec<(Vbid, usize)> = self
            .vbmap
            .live_vbids()
            .into_iter()
            .filter_map(|vbid| {
                self.vbmap
                    .get(vbid)
                    .map(|vb| (vbid, vb.checkpoint_manager().mem_usage()))
            })
            .collect();
        usage.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        usage
    }

    fn bytes_to_free(&self) -> usize {
        let usage = self.total_checkpoint_mem();
        let upper = (self.checkpoint_quota as f64 * self.upper_mark) as usize;
        if usage <= upper {
            return 0;
        }
        let lower = (self.checkpoint_quota as f64 * self.lower_mark) as usize;
        usage.saturating_sub(lower)
    }

    /// Run one full recovery pass. Does nothing while usage sits below
    /// the upper mark.
    pub fn run_once(&self) -> RecoveryOutcome {
        let mut target = self.bytes_to_free();
        if target == 0 {
            return RecoveryOutcome::default();
        }
        info!(
            target,
            quota = self.checkpoint_quota,
            "checkpoint memory recovery triggered"
        );

        let mut outcome = RecoveryOutcome::default();
        self.attempt_checkpoint_removal(&mut outcome, &mut target);
        if target > 0 {
            self.attempt_item_expelling(&mut outcome, &mut target);
        }
        if target > 0 {
            self.attempt_cursor_dropping(&mut outcome);
            // Dropped cursors unpin their checkpoints; sweep again.
            self.attempt_checkpoint_removal(&mut outcome, &mut target);
        }
        debug!(?outcome, "checkpoint memory recovery pass complete");
        outcome
    }

    fn attempt_checkpoint_removal(&self, outcome: &mut RecoveryOutcome, target: &mut usize) {
        for (vbid, _) in self.vbuckets_sorted_by_checkpoint_mem() {
            if *target == 0 {
                return;
            }
            let vb = match self.vbmap.get(vbid) {
                Some(vb) => vb,
                None => continue,
            };
            let result = vb.checkpoint_manager().remove_closed_unreferenced();
            if result.removed > 0 {
                outcome.checkpoints_removed += result.removed;
                outcome.bytes_released += result.bytes;
                self.stats
                    .checkpoints_removed
                    .fetch_add(result.removed as u64, Ordering::Relaxed);
                *target = target.saturating_sub(result.bytes);
            }
        }
    }

    fn attempt_item_expelling(&self, outcome: &mut RecoveryOutcome, target: &mut usize) {
        for (vbid, _) in self.vbuckets_sorted_by_checkpoint_mem() {
            if *target == 0 {
                return;
            }
            let vb = match self.vbmap.get(vbid) {
                Some(vb) => vb,
                None => continue,
            };
            let bytes = vb.checkpoint_manager().expel_items();
            if bytes > 0 {
                outcome.bytes_released += bytes;
                self.stats
                    .items_expelled_from_checkpoints
                    .fetch_add(1, Ordering::Relaxed);
                *target = target.saturating_sub(bytes);
            }
        }
    }

    fn attempt_cursor_dropping(&self, outcome: &mut RecoveryOutcome) {
        for (vbid, _) in self.vbuckets_sorted_by_checkpoint_mem() {
            let vb = match self.vbmap.get(vbid) {
                Some(vb) => vb,
                None => continue,
            };
            let manager = vb.checkpoint_manager();
            if let Some((name, seqno)) = manager.slowest_droppable_cursor() {
                info!(vbid = vbid.0, cursor = %name, seqno, "dropping cursor");
                if manager.drop_cursor(&name) {
                    outcome.cursors_dropped += 1;
                    self.stats.cursors_dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }
}

impl Task for CheckpointMemRecoveryTask {
    fn run(&mut self) -> TaskOutcome {
        if self.stats.is_shutdown() {
            return TaskOutcome::Done;
        }
        self.run_once();
        TaskOutcome::Reschedule(self.interval)
    }

    fn description(&self) -> String {
        "CheckpointMemRecoveryTask".to_string()
    }

    fn max_expected_duration(&self) -> Duration {
        Duration::from_millis(250)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::cursor::SendCheckpointEnd;
    use crate::config::CheckpointConfig;
    use crate::item::QueuedItem;
    use crate::key::DocKey;
    use crate::vbucket::VBucket;
    use crate::vbucket_state::VBucketState;

    fn setup(
        num_vbuckets: u16,
        disposer: Arc<dyn crate::checkpoint::manager::CheckpointDisposer>,
    ) -> (Arc<VBucketMap>, Arc<EngineStats>) {
        let stats = Arc::new(EngineStats::default());
        let vbmap = Arc::new(VBucketMap::new(num_vbuckets, 1));
        for id in 0..num_vbuckets {
            let vb = VBucket::new(
                Vbid(id),
                VBucketState::Active,
                5,
                CheckpointConfig::default(),
                Arc::clone(&stats),
                Arc::clone(&disposer),
            );
            vbmap.add(Arc::new(vb));
        }
        (vbmap, stats)
    }

    fn fill(vbmap: &VBucketMap, vbid: Vbid, items: usize) {
        let vb = vbmap.get(vbid).unwrap();
        for i in 0..items {
            let item = QueuedItem::mutation(
                DocKey::from_logical(format!("vb{}-k{}", vbid.0, i).as_bytes()),
                vec![0; 64],
                0,
                0,
            );
            vb.checkpoint_manager().queue(item).unwrap();
        }
    }

    fn task(
        vbmap: &Arc<VBucketMap>,
        stats: &Arc<EngineStats>,
        quota: usize,
        lower: f64,
        upper: f64,
    ) -> CheckpointMemRecoveryTask {
        CheckpointMemRecoveryTask::new(
            Arc::clone(vbmap),
            Arc::clone(stats),
            quota,
            lower,
            upper,
            Duration::from_millis(100),
        )
    }

    #[test]
    fn test_noop_below_upper_mark() {
        let (vbmap, stats) = setup(1, Arc::new(crate::checkpoint::manager::InlineDisposer));
        fill(&vbmap, Vbid(0), 4);
        // Generous quota: nothing to do.
        let recovery = CheckpointMemRecoveryTask::new(
            Arc::clone(&vbmap),
            Arc::clone(&stats),
            usize::MAX,
            0.6,
            0.9,
            Duration::from_millis(100),
        );
        assert_eq!(recovery.run_once(), RecoveryOutcome::default());
    }

    #[test]
    fn test_sort_order_descending_with_vbid_tiebreak() {
        let (vbmap, stats) = setup(3, Arc::new(crate::checkpoint::manager::InlineDisposer));
        fill(&vbmap, Vbid(1), 10);
        fill(&vbmap, Vbid(2), 2);
        let recovery = task(&vbmap, &stats, 1, 0.0, 0.0);

        let order: Vec<Vbid> = recovery
            .vbuckets_sorted_by_checkpoint_mem()
            .into_iter()
            .map(|(vbid, _)| vbid)
            .collect();
        assert_eq!(order[0], Vbid(1));
        assert_eq!(order[1], Vbid(2));
        // vb0 holds only an empty open checkpoint.
        assert_eq!(order[2], Vbid(0));
    }

    #[test]
    fn test_phase_a_frees_closed_checkpoints_without_dropping_cursors() {
        use crate::checkpoint::destroyer::CheckpointDestroyer;
        let destroyer = CheckpointDestroyer::new();
        let (vbmap, stats) = setup(2, destroyer.clone());

        // Each vBucket: one closed checkpoint (fully read by a DCP
        // cursor) plus the open checkpoint.
        for id in 0..2 {
            let vbid = Vbid(id);
            fill(&vbmap, vbid, 3);
            let vb = vbmap.get(vbid).unwrap();
            let manager = vb.checkpoint_manager();
            manager
                .register_cursor("dcp", 0, SendCheckpointEnd::No)
                .unwrap();
            manager.force_new_checkpoint();
            // Read everything, both cursors.
            for cursor in ["persistence", "dcp"] {
                loop {
                    let batch = manager
                        .get_items_for_cursor(cursor, 1000, usize::MAX)
                        .unwrap();
                    if batch.items.is_empty() && !batch.more_available {
                        break;
                    }
                }
            }
            assert_eq!(manager.num_checkpoints(), 2);
        }

        // Size the quota so that removing the closed checkpoints alone
        // brings usage under the lower mark: no escalation to phase C.
        let total: usize = (0..2)
            .map(|id| {
                vbmap
                    .get(Vbid(id))
                    .unwrap()
                    .checkpoint_manager()
                    .mem_usage()
            })
            .sum();
        let recovery = task(&vbmap, &stats, total, 0.5, 0.5);
        let outcome = recovery.run_once();

        assert_eq!(outcome.checkpoints_removed, 2);
        assert_eq!(outcome.cursors_dropped, 0);
        assert!(outcome.bytes_released > 0);
        // The destroyer owns exactly the bytes spliced out.
        assert_eq!(destroyer.pending_memory(), outcome.bytes_released);
        for id in 0..2 {
            let vb = vbmap.get(Vbid(id)).unwrap();
            assert_eq!(vb.checkpoint_manager().num_checkpoints(), 1);
            assert_eq!(vb.checkpoint_manager().num_cursors(), 2);
        }
    }

    #[test]
    fn test_escalates_to_cursor_dropping() {
        let (vbmap, stats) = setup(1, Arc::new(crate::checkpoint::manager::InlineDisposer));
        let vb = vbmap.get(Vbid(0)).unwrap();
        let manager = vb.checkpoint_manager();

        // A stuck DCP cursor pins the closed checkpoint; the persistence
        // cursor drains everything.
        let handle = manager
            .register_cursor("dcp:stuck", 0, SendCheckpointEnd::No)
            .unwrap()
            .handle;
        fill(&vbmap, Vbid(0), 5);
        manager.force_new_checkpoint();
        loop {
            let batch = manager
                .get_items_for_cursor("persistence", 1000, usize::MAX)
                .unwrap();
            if batch.items.is_empty() && !batch.more_available {
                break;
            }
        }

        let recovery = task(&vbmap, &stats, 1, 0.0, 0.0);
        let outcome = recovery.run_once();

        assert_eq!(outcome.cursors_dropped, 1);
        assert!(handle.is_dropped());
        assert!(outcome.checkpoints_removed >= 1);
        assert_eq!(manager.num_checkpoints(), 1);
        assert_eq!(stats.cursors_dropped.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_task_contract() {
        let (vbmap, stats) = setup(1, Arc::new(crate::checkpoint::manager::InlineDisposer));
        let mut recovery = task(&vbmap, &stats, usize::MAX, 0.6, 0.9);
        assert!(matches!(recovery.run(), TaskOutcome::Reschedule(_)));
        stats
            .is_shutdown
            .store(true, std::sync::atomic::Ordering::Release);
        assert_eq!(recovery.run(), TaskOutcome::Done);
    }
}
