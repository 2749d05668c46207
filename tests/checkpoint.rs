//! Integration tests for the checkpoint pipeline: enqueue, dedup,
//! cursors, expel and background destruction.

use std::sync::Arc;

use oxibucket::checkpoint::cursor::{SendCheckpointEnd, PERSISTENCE_CURSOR_NAME};
use oxibucket::checkpoint::destroyer::CheckpointDestroyer;
use oxibucket::checkpoint::manager::{CheckpointManager, InlineDisposer};
use oxibucket::config::CheckpointConfig;
use oxibucket::item::{QueueOp, QueuedItem, QueuedItemPtr};
use oxibucket::key::DocKey;
use oxibucket::status::{QueueStatus, Status};
use oxibucket::vbucket::Vbid;

fn key(s: &str) -> DocKey {
    DocKey::from_logical(s.as_bytes())
}

fn manager() -> CheckpointManager {
    CheckpointManager::new(
        Vbid(0),
        CheckpointConfig::default(),
        0,
        Arc::new(InlineDisposer),
    )
}

fn drain(manager: &CheckpointManager, cursor: &str) -> Vec<QueuedItemPtr> {
    let mut all = Vec::new();
    loop {
        let batch = manager
            .get_items_for_cursor(cursor, 1000, usize::MAX)
            .unwrap();
        let was_empty = batch.items.is_empty();
        all.extend(batch.items);
        if was_empty && !batch.more_available {
            return all;
        }
    }
}

#[test]
fn test_enqueue_then_expel() {
    let manager = manager();

    let (s1, _) = manager
        .queue(QueuedItem::mutation(key("k1"), b"v1".to_vec(), 0, 0))
        .unwrap();
    let (s2, _) = manager
        .queue(QueuedItem::mutation(key("k2"), b"v2".to_vec(), 0, 0))
        .unwrap();
    let (s3, _) = manager
        .queue(QueuedItem::deletion(key("k1"), 0, 0, 2))
        .unwrap();
    assert_eq!((s1, s2, s3), (1, 2, 3));

    // The deletion deduplicated the first mutation of k1, so the drain
    // sees k2 then the deletion only.
    let items = drain(&manager, PERSISTENCE_CURSOR_NAME);
    let user: Vec<(i64, QueueOp)> = items
        .iter()
        .filter(|item| !item.is_meta())
        .map(|item| (item.by_seqno, item.op))
        .collect();
    assert_eq!(user, vec![(2, QueueOp::Mutation), (3, QueueOp::Deletion)]);

    let freed = manager.expel_items();
    assert!(freed > 0);

    // Only the item at seqno 3 survives behind the checkpoint markers;
    // a new cursor can pick up from seqno 3 but nothing earlier.
    assert!(matches!(
        manager.register_cursor("dcp", 2, SendCheckpointEnd::No),
        Err(Status::OutOfRange)
    ));
    let registration = manager
        .register_cursor("dcp", 3, SendCheckpointEnd::No)
        .unwrap();
    assert_eq!(registration.next_seqno, 3);

    let items = drain(&manager, "dcp");
    let user: Vec<i64> = items
        .iter()
        .filter(|item| !item.is_meta())
        .map(|item| item.by_seqno)
        .collect();
    assert_eq!(user, vec![3]);
}

#[test]
fn test_dedup_in_open_checkpoint_keeps_latest_value() {
    let manager = manager();
    manager
        .queue(QueuedItem::mutation(key("a"), b"v1".to_vec(), 0, 0))
        .unwrap();
    let (seqno, result) = manager
        .queue(QueuedItem::mutation(key("a"), b"v2".to_vec(), 0, 0))
        .unwrap();

    // The persistence cursor has not passed the first entry, so this is
    // a plain in-place dedup, not a re-persist.
    assert_eq!(result.status, QueueStatus::SuccessExistingItem);
    assert_eq!(seqno, 2);

    let items = drain(&manager, PERSISTENCE_CURSOR_NAME);
    let user: Vec<&QueuedItemPtr> = items.iter().filter(|item| !item.is_meta()).collect();
    assert_eq!(user.len(), 1);
    assert_eq!(user[0].by_seqno, 2);
    assert_eq!(user[0].value.as_deref(), Some(b"v2".as_ref()));
}

#[test]
fn test_cursor_registration_below_minimum() {
    let config = CheckpointConfig {
        max_items_per_checkpoint: 50,
        eager_disposal: true,
        ..CheckpointConfig::default()
    };
    let manager = CheckpointManager::new(Vbid(0), config, 0, Arc::new(InlineDisposer));

    // Fill past seqno 100, roll, fill to 150, and let persistence
    // consume everything so old checkpoints get disposed.
    for i in 0..150u32 {
        manager
            .queue(QueuedItem::mutation(
                key(&format!("k{i}")),
                vec![0; 8],
                0,
                0,
            ))
            .unwrap();
    }
    drain(&manager, PERSISTENCE_CURSOR_NAME);
    manager.remove_closed_unreferenced();
    let freed = manager.expel_items();
    assert!(freed > 0);

    assert!(matches!(
        manager.register_cursor("dcp", 50, SendCheckpointEnd::No),
        Err(Status::OutOfRange)
    ));
}

#[test]
fn test_memory_recovery_splices_to_destroyer() {
    let destroyer = CheckpointDestroyer::new();
    let manager = CheckpointManager::new(
        Vbid(0),
        CheckpointConfig::default(),
        0,
        Arc::clone(&destroyer) as Arc<dyn oxibucket::checkpoint::manager::CheckpointDisposer>,
    );
    manager
        .register_cursor("dcp", 0, SendCheckpointEnd::No)
        .unwrap();

    for i in 0..8u32 {
        manager
            .queue(QueuedItem::mutation(
                key(&format!("k{i}")),
                vec![0; 32],
                0,
                0,
            ))
            .unwrap();
    }
    manager.force_new_checkpoint();

    // Both cursors read to the end, leaving the closed checkpoint
    // unpinned once they hop forward.
    drain(&manager, PERSISTENCE_CURSOR_NAME);
    drain(&manager, "dcp");

    let result = manager.remove_closed_unreferenced();
    assert_eq!(result.removed, 1);
    assert_eq!(destroyer.pending_memory(), result.bytes);
    assert_eq!(destroyer.pending_count(), 1);

    // Draining the destroyer returns the memory.
    assert_eq!(destroyer.drain(), 1);
    assert_eq!(destroyer.pending_memory(), 0);
}

#[test]
fn test_multiple_cursors_progress_independently() {
    let manager = manager();
    manager
        .register_cursor("dcp:a", 0, SendCheckpointEnd::No)
        .unwrap();
    manager
        .register_cursor("dcp:b", 0, SendCheckpointEnd::No)
        .unwrap();

    for i in 0..10u32 {
        manager
            .queue(QueuedItem::mutation(
                key(&format!("k{i}")),
                vec![0; 8],
                0,
                0,
            ))
            .unwrap();
    }

    let a1 = manager.get_items_for_cursor("dcp:a", 3, usize::MAX).unwrap();
    let b_all = drain(&manager, "dcp:b");
    let a_rest = drain(&manager, "dcp:a");

    let count_user = |items: &[QueuedItemPtr]| items.iter().filter(|i| !i.is_meta()).count();
    assert!(count_user(&a1.items) <= 3);
    assert_eq!(count_user(&b_all), 10);
    assert_eq!(count_user(&a1.items) + count_user(&a_rest), 10);
}

#[test]
fn test_snapshot_ranges_cover_batches() {
    let manager = manager();
    for i in 0..5u32 {
        manager
            .queue(QueuedItem::mutation(
                key(&format!("k{i}")),
                vec![0; 8],
                0,
                0,
            ))
            .unwrap();
    }
    manager.force_new_checkpoint();
    manager
        .queue(QueuedItem::mutation(key("tail"), vec![0; 8], 0, 0))
        .unwrap();

    let first = manager
        .get_items_for_cursor(PERSISTENCE_CURSOR_NAME, 1000, usize::MAX)
        .unwrap();
    // The initial checkpoint's snapshot begins at the pre-existing high
    // seqno (0 for a fresh vBucket) and grew with each mutation.
    assert_eq!((first.range.start, first.range.end), (0, 5));
    for item in first.items.iter().filter(|item| !item.is_meta()) {
        let seqno = item.by_seqno as u64;
        assert!(seqno >= first.range.start && seqno <= first.range.end);
    }
    assert!(first.more_available);

    let second = manager
        .get_items_for_cursor(PERSISTENCE_CURSOR_NAME, 1000, usize::MAX)
        .unwrap();
    assert_eq!((second.range.start, second.range.end), (6, 6));
}
