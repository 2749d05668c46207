//! Randomized checkpoint-manager drive: queue/dedup/expel/remove under a
//! seeded operation stream, checking ordering, registration and
//! accounting invariants against a model.

mod fuzz_util;

use std::collections::HashMap;
use std::sync::Arc;

use oxibucket::checkpoint::cursor::{SendCheckpointEnd, PERSISTENCE_CURSOR_NAME};
use oxibucket::checkpoint::manager::{CheckpointManager, InlineDisposer};
use oxibucket::config::CheckpointConfig;
use oxibucket::item::{DurabilityLevel, DurabilityReq, QueuedItem};
use oxibucket::key::DocKey;
use oxibucket::status::Status;
use oxibucket::vbucket::Vbid;
use rand::Rng;

fn key_for(id: u64) -> DocKey {
    DocKey::from_logical(format!("key-{id}").as_bytes())
}

struct CursorModel {
    name: String,
    last_seqno: i64,
}

#[test]
fn fuzz_manager_invariants() {
    let params = fuzz_util::params("manager_invariants", 4000, 64);
    let mut rng = fuzz_util::rng(params.seed);

    let config = CheckpointConfig {
        max_items_per_checkpoint: 32,
        max_checkpoints: 6,
        ..CheckpointConfig::default()
    };
    let manager = CheckpointManager::new(Vbid(0), config, 0, Arc::new(InlineDisposer));

    // Model: latest seqno per key, plus per-cursor read positions.
    let mut latest: HashMap<u64, i64> = HashMap::new();
    let mut cursors: Vec<CursorModel> = vec![CursorModel {
        name: PERSISTENCE_CURSOR_NAME.to_string(),
        last_seqno: 0,
    }];
    let mut next_cursor_id = 0u32;
    let mut highest_queued: i64 = 0;

    for step in 0..params.steps {
        match rng.gen_range(0u8..100) {
            // Mutation / deletion / prepare.
            0..=54 => {
                let key_id = rng.gen_range(0..params.key_space);
                let item = match rng.gen_range(0u8..10) {
                    0..=6 => QueuedItem::mutation(
                        key_for(key_id),
                        vec![0; rng.gen_range(0..64)],
                        0,
                        0,
                    ),
                    7..=8 => QueuedItem::deletion(key_for(key_id), 0, 0, 2),
                    _ => QueuedItem::prepare(
                        key_for(key_id),
                        vec![1],
                        0,
                        0,
                        DurabilityReq {
                            level: DurabilityLevel::Majority,
                            timeout_ms: None,
                        },
                    ),
                };
                let is_prepare = item.op == oxibucket::item::QueueOp::Prepare;
                let (seqno, result) = manager.queue(item).unwrap();
                assert!(result.status.is_success(), "step {step}");
                assert!(seqno > highest_queued, "seqnos must increase");
                highest_queued = seqno;
                if !is_prepare {
                    latest.insert(key_id, seqno);
                }
            }
            // Roll the open checkpoint.
            55..=59 => manager.force_new_checkpoint(),
            // Register a new cursor at a random historical seqno.
            60..=64 => {
                let start = rng.gen_range(0..=(highest_queued.max(0) as u64 + 1));
                let name = format!("dcp:{next_cursor_id}");
                match manager.register_cursor(&name, start, SendCheckpointEnd::No) {
                    Ok(registration) => {
                        assert!(
                            registration.next_seqno >= start,
                            "cursor positioned before its request"
                        );
                        next_cursor_id += 1;
                        cursors.push(CursorModel {
                            name,
                            last_seqno: start.saturating_sub(1) as i64,
                        });
                    }
                    Err(Status::OutOfRange) => {
                        // Items below `start` were released; acceptable.
                    }
                    Err(other) => panic!("unexpected registration error: {other}"),
                }
            }
            // Advance a random cursor by a bounded batch.
            65..=84 => {
                if cursors.is_empty() {
                    continue;
                }
                let idx = rng.gen_range(0..cursors.len());
                let cursor = &mut cursors[idx];
                let batch = match manager.get_items_for_cursor(
                    &cursor.name,
                    rng.gen_range(1..16),
                    usize::MAX,
                ) {
                    Ok(batch) => batch,
                    Err(_) => continue,
                };
                for item in batch.items.iter().filter(|item| !item.is_meta()) {
                    // P2: strictly increasing non-meta seqnos per cursor.
                    assert!(
                        item.by_seqno > cursor.last_seqno,
                        "cursor {} regressed: {} -> {}",
                        cursor.name,
                        cursor.last_seqno,
                        item.by_seqno
                    );
                    cursor.last_seqno = item.by_seqno;
                    // Snapshot boundaries contain their items.
                    let seqno = item.by_seqno as u64;
                    assert!(seqno >= batch.range.start && seqno <= batch.range.end);
                }
            }
            // Drop a random replication cursor.
            85..=89 => {
                if cursors.len() <= 1 {
                    continue;
                }
                let idx = rng.gen_range(1..cursors.len());
                let name = cursors[idx].name.clone();
                if manager.drop_cursor(&name) {
                    cursors.remove(idx);
                }
            }
            // Reclaim memory.
            90..=94 => {
                manager.remove_closed_unreferenced();
            }
            _ => {
                manager.expel_items();
            }
        }
    }

    // A fresh cursor from seqno 0 (when still registerable) must deliver
    // the latest surviving version of every key exactly once per
    // checkpoint, in seqno order.
    if let Ok(_) = manager.register_cursor("verify", 0, SendCheckpointEnd::No) {
        let mut seen_final: HashMap<Vec<u8>, i64> = HashMap::new();
        let mut last = 0i64;
        loop {
            let batch = manager
                .get_items_for_cursor("verify", 1000, usize::MAX)
                .unwrap();
            let empty = batch.items.is_empty();
            for item in batch.items.iter().filter(|item| !item.is_meta()) {
                assert!(item.by_seqno > last);
                last = item.by_seqno;
                // Prepares live in their own namespace; only committed
                // versions participate in the latest-version check.
                if item.is_committed_namespace() {
                    seen_final.insert(item.key.encoded().to_vec(), item.by_seqno);
                }
            }
            if empty && !batch.more_available {
                break;
            }
        }
        // Every committed key's final delivered seqno matches the model.
        for (key_id, seqno) in &latest {
            let encoded = key_for(*key_id).encoded().to_vec();
            if let Some(delivered) = seen_final.get(&encoded) {
                assert_eq!(
                    delivered, seqno,
                    "stale version delivered for key {key_id}"
                );
            }
        }
    }

    assert_eq!(manager.high_seqno(), highest_queued.max(0) as u64);
}

#[test]
fn fuzz_expel_and_registration_agree() {
    // Registration succeeds exactly when the requested seqno is at or
    // past the oldest retained position (P4).
    let params = fuzz_util::params("expel_registration", 500, 16);
    let mut rng = fuzz_util::rng(params.seed);

    let manager = CheckpointManager::new(
        Vbid(1),
        CheckpointConfig::default(),
        0,
        Arc::new(InlineDisposer),
    );

    for i in 0..params.steps {
        manager
            .queue(QueuedItem::mutation(
                key_for(rng.gen_range(0..params.key_space)),
                vec![0; 16],
                0,
                0,
            ))
            .unwrap();
        if i % 50 == 49 {
            // Drain and expel periodically.
            loop {
                let batch = manager
                    .get_items_for_cursor(PERSISTENCE_CURSOR_NAME, 1000, usize::MAX)
                    .unwrap();
                if batch.items.is_empty() && !batch.more_available {
                    break;
                }
            }
            manager.expel_items();
        }
    }

    // Find the boundary: the smallest registerable seqno.
    let high = manager.high_seqno();
    let mut boundary = None;
    for seqno in 0..=high {
        match manager.register_cursor("probe", seqno, SendCheckpointEnd::No) {
            Ok(_) => {
                boundary = Some(seqno);
                manager.remove_cursor("probe");
                break;
            }
            Err(Status::OutOfRange) => continue,
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    let boundary = boundary.expect("the high seqno itself must be registerable");

    // Everything below the boundary is rejected, everything at or above
    // succeeds.
    if boundary > 0 {
        assert!(matches!(
            manager.register_cursor("below", boundary - 1, SendCheckpointEnd::No),
            Err(Status::OutOfRange)
        ));
    }
    for seqno in [boundary, high] {
        manager
            .register_cursor("at-or-above", seqno, SendCheckpointEnd::No)
            .unwrap();
        manager.remove_cursor("at-or-above");
    }
}
