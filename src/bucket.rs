//! The bucket engine container.
//!
//! Wires configuration, statistics, the vBucket map, the per-shard disk
//! stores and the background machinery together. The scheduler and the
//! stores are injected; the bucket never reaches for globals.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::info;

use crate::checkpoint::destroyer::CheckpointDestroyer;
use crate::config::EngineConfig;
use crate::executor::Scheduler;
use crate::kvstore::KVStore;
use crate::stats::EngineStats;
use crate::status::Status;
use crate::vbucket::{VBucket, VBucketMap, Vbid};
use crate::vbucket_state::PersistedVBucketState;

/// One bucket engine instance.
pub struct Bucket {
    config: EngineConfig,
    stats: Arc<EngineStats>,
    vbmap: Arc<VBucketMap>,
    shards: Vec<Arc<dyn KVStore>>,
    scheduler: Arc<dyn Scheduler>,
    destroyer: Arc<CheckpointDestroyer>,

    traffic_enabled: AtomicBool,
    write_traffic_disabled: AtomicBool,
    flusher_started: AtomicBool,
}

impl Bucket {
    /// Create a bucket over one KVStore per shard. The shard count is
    /// taken from the store list, overriding the configured value.
    pub fn new(
        mut config: EngineConfig,
        shards: Vec<Arc<dyn KVStore>>,
        scheduler: Arc<dyn Scheduler>,
    ) -> Arc<Self> {
        assert!(!shards.is_empty(), "a bucket needs at least one shard");
        config.bucket.num_shards = shards.len();

        let stats = Arc::new(EngineStats::with_quota(
            config.bucket.max_size,
            config.bucket.mem_low_wat(),
            config.bucket.mem_high_wat(),
        ));
        let vbmap = Arc::new(VBucketMap::new(
            config.bucket.max_vbuckets,
            config.bucket.num_shards,
        ));
        let destroyer = CheckpointDestroyer::new();
        destroyer.set_scheduler(Arc::clone(&scheduler));

        Arc::new(Self {
            config,
            stats,
            vbmap,
            shards,
            scheduler,
            destroyer,
            traffic_enabled: AtomicBool::new(false),
            write_traffic_disabled: AtomicBool::new(false),
            flusher_started: AtomicBool::new(false),
        })
    }

    /// Engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Engine statistics.
    pub fn stats(&self) -> &Arc<EngineStats> {
        &self.stats
    }

    /// The vBucket map.
    pub fn vbmap(&self) -> &Arc<VBucketMap> {
        &self.vbmap
    }

    /// The injected scheduler.
    pub fn scheduler(&self) -> &Arc<dyn Scheduler> {
        &self.scheduler
    }

    /// The checkpoint destroyer.
    pub fn destroyer(&self) -> &Arc<CheckpointDestroyer> {
        &self.destroyer
    }

    /// Number of shards.
    pub fn num_shards(&self) -> usize {
        self.shards.len()
    }

    /// The store backing `shard`.
    pub fn store_for_shard(&self, shard: usize) -> &Arc<dyn KVStore> {
        &self.shards[shard % self.shards.len()]
    }

    /// The store backing `vbid`.
    pub fn store_for_vbid(&self, vbid: Vbid) -> &Arc<dyn KVStore> {
        self.store_for_shard(self.vbmap.shard_of(vbid))
    }

    /// Whether client traffic is admitted.
    pub fn is_traffic_enabled(&self) -> bool {
        self.traffic_enabled.load(Ordering::Acquire)
    }

    /// Admit client traffic. Returns true on the first call.
    pub fn enable_traffic(&self) -> bool {
        let first = !self.traffic_enabled.swap(true, Ordering::AcqRel);
        if first {
            info!("traffic enabled");
        }
        first
    }

    /// Whether write admission has been disabled (vBucket state could
    /// not be persisted during warmup).
    pub fn is_write_traffic_disabled(&self) -> bool {
        self.write_traffic_disabled.load(Ordering::Acquire)
    }

    /// Disable write admission.
    pub fn disable_write_traffic(&self) {
        self.write_traffic_disabled.store(true, Ordering::Release);
    }

    /// Whether the flushers have been started.
    pub fn is_flusher_started(&self) -> bool {
        self.flusher_started.load(Ordering::Acquire)
    }

    /// Start the flushers (idempotent).
    pub fn start_flusher(&self) {
        if !self.flusher_started.swap(true, Ordering::AcqRel) {
            info!("flusher started");
        }
    }

    /// Persist `vb`'s current state record to its shard's store.
    pub fn persist_vbucket_state(&self, vb: &VBucket) -> Result<(), Status> {
        let manager = vb.checkpoint_manager();
        let info = manager.snapshot_info();
        let mut record = PersistedVBucketState {
            high_seqno: manager.high_seqno() as i64,
            last_snap_start: info.range.start,
            last_snap_end: info.range.end,
            max_visible_seqno: manager.max_visible_seqno(),
            max_cas: vb.max_cas(),
            hlc_cas_epoch_seqno: vb.hlc_epoch_seqno(),
            purge_seqno: vb.purge_seqno(),
            might_contain_xattrs: vb.might_contain_xattrs(),
            ..PersistedVBucketState::default()
        };
        record.transition.state = vb.state();
        record.transition.failovers = vb.failovers().lock().to_json();
        self.store_for_vbid(vb.id())
            .set_persisted_vbucket_state(vb.id(), &record)
    }

    /// Flag the engine as shutting down.
    pub fn shutdown(&self) {
        self.stats.is_shutdown.store(true, Ordering::Release);
    }
}
