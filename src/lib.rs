//! oxibucket - a vBucket-partitioned, eventually-persistent key-value engine core
//!
//! This crate implements the memory pipeline of a bucket engine:
//! - **Checkpoints**: a per-vBucket, seqno-ordered, deduplicated in-memory
//!   write log consumed concurrently by the persistence path and by
//!   replication cursors.
//! - **Warmup**: the phased recovery state machine that rebuilds vBuckets
//!   and the checkpoint pipeline from persisted state at startup.
//!
//! # Features
//!
//! - Append/dedup/expel checkpoint queue with allocator-style memory
//!   accounting and constant-time ownership transfer to a background
//!   destroyer
//! - Cursor registration by sequence number, with disk-backfill fallback
//!   signalled via `Status::OutOfRange`
//! - Shard-parallel warmup with OOM-aware data load, pause/resume scans
//!   and deterministic vBucket ordering
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use oxibucket::prelude::*;
//!
//! let config = EngineConfig::default();
//! let bucket = Bucket::new(config, stores, scheduler);
//!
//! // Recover from disk, then serve traffic.
//! let warmup = Warmup::new(bucket.clone());
//! warmup.start();
//! ```

#![warn(missing_docs)]

pub mod access_log;
pub mod bucket;
pub mod checkpoint;
pub mod config;
pub mod executor;
pub mod failover;
pub mod hash_table;
pub mod item;
pub mod key;
pub mod kvstore;
pub mod leb128;
pub mod seqno;
pub mod stats;
pub mod status;
pub mod vbucket;
pub mod vbucket_state;
pub mod warmup;

// Re-exports for convenience
pub use item::{QueueOp, QueuedItem};
pub use key::{CollectionId, DocKey};
pub use status::{QueueStatus, ScanOutcome, Status};
pub use vbucket::Vbid;

/// Constants used throughout the library
pub mod constants {
    /// Number of bytes of bookkeeping (prev/next/element pointers) charged
    /// per queued item for queue overhead accounting.
    pub const PER_ITEM_QUEUE_OVERHEAD: usize = 3 * std::mem::size_of::<usize>();

    /// The collection id reserved for system events.
    pub const SYSTEM_COLLECTION: u32 = 1;

    /// The default collection id.
    pub const DEFAULT_COLLECTION: u32 = 0;

    /// Key under which the unclean-shutdown marker is stored in the
    /// persisted stats snapshot.
    pub const FORCE_SHUTDOWN_STAT: &str = "ep_force_shutdown";
}

/// Prelude module for common imports
pub mod prelude {
    pub use crate::bucket::Bucket;
    pub use crate::checkpoint::manager::CheckpointManager;
    pub use crate::config::EngineConfig;
    pub use crate::item::{QueueOp, QueuedItem};
    pub use crate::key::DocKey;
    pub use crate::status::{QueueStatus, Status};
    pub use crate::vbucket::{VBucket, Vbid};
    pub use crate::warmup::Warmup;
}
