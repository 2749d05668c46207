//! Warmup: the phased recovery of a bucket from its disk stores.
//!
//! Warmup rebuilds every persisted vBucket, loads outstanding prepares,
//! publishes the vBucket map and then streams the data set back into
//! memory, all while the front end queues client cookies that arrived
//! too early. Each phase fans out one task per shard; a shared counter
//! advances the phase once every shard has reported in.
//!
//! The data-load phases run against a deadline and yield cooperatively,
//! preserving their scan context across slices; they also watch memory:
//! past the low watermark newly loaded values are ejected immediately,
//! an allocation failure triggers one emergency purge, and a second
//! failure ends the load early.

pub mod state;

pub use state::{WarmupPhase, WarmupState};

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{error, info, warn};

use crate::access_log::{self, old_log_path, shard_log_path};
use crate::bucket::Bucket;
use crate::config::EvictionPolicy;
use crate::constants::FORCE_SHUTDOWN_STAT;
use crate::executor::{Task, TaskId, TaskOutcome};
use crate::failover::FailoverTable;
use crate::item::{QueueOp, QueuedItem};
use crate::key::DocKey;
use crate::kvstore::{
    ApplyStatus, CacheLookup, CacheLookupStatus, DocumentFilter, GetCollectionStatsStatus,
    ScanContext, ValueApplier, ValueFilter,
};
use crate::status::{MutationResult, ScanOutcome, Status};
use crate::vbucket::{VBucket, Vbid};
use crate::vbucket_state::{PersistedVBucketState, VBucketState};

/// A suspended client connection waiting for vBuckets to exist.
pub trait Cookie: Send + Sync {
    /// Deliver the outcome of the wait: `Ok` once the vBucket map is
    /// populated, `Shutdown` if warmup was stopped first.
    fn notify_io_complete(&self, status: Status);
}

struct PendingCookies {
    complete: bool,
    queue: Vec<Arc<dyn Cookie>>,
}

/// The warmup orchestrator for one bucket.
pub struct Warmup {
    bucket: Arc<Bucket>,
    state: WarmupState,
    phase_trace: Mutex<Vec<WarmupPhase>>,

    shard_vb_states: RwLock<Vec<BTreeMap<u16, PersistedVBucketState>>>,
    shard_vb_ids: RwLock<Vec<Vec<Vbid>>>,
    warmed_vbuckets: Mutex<HashMap<u16, Arc<VBucket>>>,

    barrier: AtomicUsize,
    task_set: Mutex<HashSet<TaskId>>,
    pending_cookies: Mutex<PendingCookies>,

    clean_shutdown: AtomicBool,
    corrupt_access_log: AtomicBool,
    oom_failure: AtomicBool,
    has_purged: AtomicBool,
    aborted: AtomicBool,
    stopped: AtomicBool,
    finished_loading: AtomicBool,
    done_once: AtomicBool,
    failed_to_set_vbucket_state: AtomicBool,

    estimated_item_count: AtomicU64,
    started: Mutex<Option<Instant>>,

    self_ref: Weak<Warmup>,
}

impl Warmup {
    /// Create a warmup instance for `bucket`.
    pub fn new(bucket: Arc<Bucket>) -> Arc<Self> {
        let num_shards = bucket.num_shards();
        Arc::new_cyclic(|weak| Self {
            bucket,
            state: WarmupState::new(),
            phase_trace: Mutex::new(vec![WarmupPhase::Initialize]),
            shard_vb_states: RwLock::new(vec![BTreeMap::new(); num_shards]),
            shard_vb_ids: RwLock::new(vec![Vec::new(); num_shards]),
            warmed_vbuckets: Mutex::new(HashMap::new()),
            barrier: AtomicUsize::new(0),
            task_set: Mutex::new(HashSet::new()),
            pending_cookies: Mutex::new(PendingCookies {
                complete: false,
                queue: Vec::new(),
            }),
            clean_shutdown: AtomicBool::new(false),
            corrupt_access_log: AtomicBool::new(false),
            oom_failure: AtomicBool::new(false),
            has_purged: AtomicBool::new(false),
            aborted: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            finished_loading: AtomicBool::new(false),
            done_once: AtomicBool::new(false),
            failed_to_set_vbucket_state: AtomicBool::new(false),
            estimated_item_count: AtomicU64::new(0),
            started: Mutex::new(None),
            self_ref: weak.clone(),
        })
    }

    /// Begin warmup by scheduling the Initialize phase.
    pub fn start(&self) {
        self.schedule(StepKind::Initialize);
    }

    /// Stop warmup: cancel outstanding tasks, force the terminal phase
    /// and disconnect any suspended cookies.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        {
            let mut tasks = self.task_set.lock();
            for id in tasks.drain() {
                self.bucket.scheduler().cancel(id);
            }
        }
        let _ = self.state.transition(WarmupPhase::Done, true);
        self.record_phase(WarmupPhase::Done);
        self.done();
        self.process_pending_cookies(Status::Shutdown);
    }

    /// Current phase.
    pub fn phase(&self) -> WarmupPhase {
        self.state.phase()
    }

    /// Whether warmup has reached its terminal phase.
    pub fn is_done(&self) -> bool {
        self.state.is_done()
    }

    /// Every phase entered so far, in order.
    pub fn phase_trace(&self) -> Vec<WarmupPhase> {
        self.phase_trace.lock().clone()
    }

    /// Whether the previous shutdown was clean.
    pub fn was_clean_shutdown(&self) -> bool {
        self.clean_shutdown.load(Ordering::Acquire)
    }

    /// Whether an access log failed to parse.
    pub fn has_corrupt_access_log(&self) -> bool {
        self.corrupt_access_log.load(Ordering::Acquire)
    }

    /// Whether the data load failed with out-of-memory.
    pub fn has_oom_failure(&self) -> bool {
        self.oom_failure.load(Ordering::Acquire)
    }

    /// Whether warmup aborted on unusable files.
    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    /// Whether a vBucket state failed to persist during publication.
    pub fn failed_to_set_vbucket_state(&self) -> bool {
        self.failed_to_set_vbucket_state.load(Ordering::Acquire)
    }

    /// Estimated number of items on disk, summed over shards.
    pub fn estimated_item_count(&self) -> u64 {
        self.estimated_item_count.load(Ordering::Acquire)
    }

    /// Whether the load phases have finished (or been cut short).
    pub fn is_finished_loading(&self) -> bool {
        self.finished_loading.load(Ordering::Acquire)
    }

    /// Suspend `cookie` until the vBucket map is populated. Returns
    /// false (without queueing) once vBuckets are visible.
    pub fn maybe_wait_for_vbucket_warmup(&self, cookie: Arc<dyn Cookie>) -> bool {
        let mut pending = self.pending_cookies.lock();
        if pending.complete {
            return false;
        }
        pending.queue.push(cookie);
        true
    }

    /// Check the traffic-admission predicate, enabling traffic when it
    /// holds.
    pub fn maybe_enable_traffic(&self) -> bool {
        if self.bucket.is_traffic_enabled() {
            return true;
        }
        let stats = self.bucket.stats();
        let config = &self.bucket.config().warmup;

        let estimated = self.estimated_item_count.load(Ordering::Acquire);
        let warmed_values = stats.warmed_up_values.load(Ordering::Relaxed);
        let value_target = (estimated as f64 * config.num_read_cap) as u64;
        let mem_target =
            (self.bucket.config().bucket.max_size as f64 * config.mem_used_cap) as usize;

        if warmed_values >= value_target {
            info!(
                warmed_values,
                value_target, "warmed value count reached read cap, enabling traffic"
            );
            self.bucket.enable_traffic();
            return true;
        }
        if mem_target > 0 && stats.estimated_total_memory_used() >= mem_target {
            info!(
                mem_used = stats.estimated_total_memory_used(),
                mem_target, "memory use reached warmup cap, enabling traffic"
            );
            self.bucket.enable_traffic();
            return true;
        }
        false
    }

    // --- scheduling ------------------------------------------------------

    fn schedule(&self, kind: StepKind) {
        let warmup = match self.self_ref.upgrade() {
            Some(warmup) => warmup,
            None => return,
        };
        let id = self
            .bucket
            .scheduler()
            .schedule(Box::new(WarmupStep { warmup, kind }));
        self.task_set.lock().insert(id);
    }

    fn fan_out(&self, make: impl Fn(usize) -> StepKind) {
        self.barrier.store(0, Ordering::Release);
        for shard in 0..self.bucket.num_shards() {
            self.schedule(make(shard));
        }
    }

    fn shard_barrier(&self) -> bool {
        self.barrier.fetch_add(1, Ordering::AcqRel) + 1 == self.bucket.num_shards()
    }

    fn record_phase(&self, phase: WarmupPhase) {
        let mut trace = self.phase_trace.lock();
        if trace.last() != Some(&phase) {
            trace.push(phase);
        }
    }

    fn transition(&self, to: WarmupPhase) {
        if self.state.transition(to, false).is_err() {
            return;
        }
        // A concurrent forced shutdown may have won the CAS; in that
        // case there is nothing to step.
        if self.state.phase() != to {
            return;
        }
        self.record_phase(to);
        if to == WarmupPhase::Done {
            self.done();
            return;
        }
        self.step(to);
    }

    fn step(&self, phase: WarmupPhase) {
        match phase {
            WarmupPhase::CreateVBuckets => {
                self.fan_out(|shard| StepKind::CreateVBuckets { shard });
            }
            WarmupPhase::LoadingCollectionCounts => {
                self.fan_out(|shard| StepKind::LoadingCollectionCounts { shard });
            }
            WarmupPhase::EstimateDatabaseItemCount => {
                self.estimated_item_count.store(0, Ordering::Release);
                self.fan_out(|shard| StepKind::EstimateItemCount { shard });
            }
            WarmupPhase::LoadPreparedSyncWrites => {
                self.fan_out(|shard| StepKind::LoadPreparedSyncWrites { shard });
            }
            WarmupPhase::PopulateVBucketMap => {
                self.fan_out(|shard| StepKind::PopulateVBucketMap { shard });
            }
            WarmupPhase::KeyDump => self.fan_out(|shard| StepKind::backfill(shard, phase)),
            WarmupPhase::CheckForAccessLog => self.schedule(StepKind::CheckForAccessLog),
            WarmupPhase::LoadingAccessLog => {
                self.fan_out(|shard| StepKind::AccessLogLoad { shard });
            }
            WarmupPhase::LoadingKVPairs | WarmupPhase::LoadingData => {
                self.fan_out(|shard| StepKind::backfill(shard, phase));
            }
            WarmupPhase::Initialize | WarmupPhase::Done => {}
        }
    }

    fn abort(&self, reason: &str) {
        error!(reason, "aborting warmup");
        self.aborted.store(true, Ordering::Release);
        let _ = self.state.transition(WarmupPhase::Done, true);
        self.record_phase(WarmupPhase::Done);
        self.done();
        self.process_pending_cookies(Status::Shutdown);
    }

    fn done(&self) {
        if self.done_once.swap(true, Ordering::AcqRel) {
            return;
        }
        self.finished_loading.store(true, Ordering::Release);
        let elapsed = self
            .started
            .lock()
            .map(|start| start.elapsed())
            .unwrap_or_default();
        let snapshot = self.bucket.stats().warmup_snapshot();
        info!(
            ?elapsed,
            keys = snapshot.warmed_up_keys,
            values = snapshot.warmed_up_values,
            oom = snapshot.warm_oom,
            "warmup complete"
        );
        if !self.aborted.load(Ordering::Acquire) && !self.stopped.load(Ordering::Acquire) {
            self.bucket.enable_traffic();
        }
    }

    fn process_pending_cookies(&self, status: Status) {
        let to_notify: Vec<Arc<dyn Cookie>> = {
            let mut pending = self.pending_cookies.lock();
            pending.complete = true;
            std::mem::take(&mut pending.queue)
        };
        if to_notify.is_empty() {
            return;
        }
        info!(count = to_notify.len(), %status, "unblocking pending cookies");
        for cookie in to_notify {
            cookie.notify_io_complete(status);
        }
    }

    // --- phase bodies ----------------------------------------------------

    fn do_initialize(&self) {
        *self.started.lock() = Some(Instant::now());

        let store = self.bucket.store_for_shard(0);
        let mut persisted = store.get_persisted_stats();
        if persisted.get(FORCE_SHUTDOWN_STAT).map(String::as_str) == Some("false") {
            self.clean_shutdown.store(true, Ordering::Release);
            // Should we crash before the next stats snapshot runs, the
            // following warmup must treat the shutdown as unclean.
            persisted.insert(FORCE_SHUTDOWN_STAT.to_string(), "true".to_string());
            while !store.snapshot_stats(&persisted) {
                error!("failed to persist the forced-shutdown marker, retrying");
                if self.stopped.load(Ordering::Acquire) || self.bucket.stats().is_shutdown() {
                    return;
                }
                std::thread::sleep(Duration::from_millis(100));
            }
        }

        self.populate_shard_vb_states();
        self.transition(WarmupPhase::CreateVBuckets);
    }

    fn populate_shard_vb_states(&self) {
        let num_shards = self.bucket.num_shards();
        let mut states: Vec<BTreeMap<u16, PersistedVBucketState>> =
            vec![BTreeMap::new(); num_shards];
        for shard in 0..num_shards {
            for (vbid, state) in self.bucket.store_for_shard(shard).list_persisted_vbuckets() {
                let owner = self.bucket.vbmap().shard_of(vbid);
                states[owner].insert(vbid.0, state);
            }
        }

        let mut ids: Vec<Vec<Vbid>> = vec![Vec::new(); num_shards];
        for (shard, shard_states) in states.iter().enumerate() {
            let mut actives: Vec<Vbid> = Vec::new();
            let mut others: Vec<Vbid> = Vec::new();
            for (vbid, vbs) in shard_states {
                if vbs.state() == VBucketState::Active {
                    actives.push(Vbid(*vbid));
                } else {
                    others.push(Vbid(*vbid));
                }
            }

            // One active vBucket loads first: when RAM per vBucket is
            // tight this brings active data in before replicas eat it.
            if let Some(vbid) = actives.pop() {
                ids[shard].push(vbid);
            }

            // The remainder is a weighted lottery, seeded by the shard
            // id so that re-running warmup on the same vBucket set gives
            // the same order on every node.
            let mut rng = StdRng::seed_from_u64(shard as u64);
            while !actives.is_empty() || !others.is_empty() {
                let pick_active = rng.gen_bool(0.6);
                let (source, fallback) = if pick_active {
                    (&mut actives, &mut others)
                } else {
                    (&mut others, &mut actives)
                };
                match source.pop() {
                    Some(vbid) => ids[shard].push(vbid),
                    None => {
                        while let Some(vbid) = fallback.pop() {
                            ids[shard].push(vbid);
                        }
                    }
                }
            }
        }

        *self.shard_vb_states.write() = states;
        *self.shard_vb_ids.write() = ids;
    }

    fn do_create_vbuckets(&self, shard: usize) {
        let max_entries = self.bucket.config().bucket.max_failover_entries;
        let states = self.shard_vb_states.read();
        let store = self.bucket.store_for_shard(shard);

        for (vbid, vbs) in &states[shard] {
            let vbid = Vbid(*vbid);

            // Collections and sync-replication require namespaced keys;
            // a datafile without them is unusable.
            if !vbs.supports_namespaces {
                self.abort("datafile without key namespacing");
                return;
            }

            if self.warmed_vbuckets.lock().contains_key(&vbid.0) {
                continue;
            }

            let failovers = match FailoverTable::from_json(&vbs.transition.failovers, max_entries)
            {
                Ok(failovers) => failovers,
                Err(_) => {
                    self.abort("unreadable failover table");
                    return;
                }
            };

            if store.get_collections_manifest(vbid).is_err() {
                self.abort("unreadable collections manifest");
                return;
            }

            let vb = VBucket::from_persisted(
                vbid,
                vbs,
                failovers,
                self.bucket.config().checkpoint.clone(),
                Arc::clone(self.bucket.stats()),
                Arc::clone(self.bucket.destroyer()) as Arc<dyn crate::checkpoint::manager::CheckpointDisposer>,
            );

            if vbs.state() == VBucketState::Active && !self.was_clean_shutdown() {
                let seqno = if vbs.high_seqno.max(0) as u64 == vbs.last_snap_end {
                    vbs.last_snap_end
                } else {
                    vbs.last_snap_start
                };
                let mut failovers = vb.failovers().lock();
                failovers.create_entry(seqno);
                let entry = failovers.latest_entry();
                info!(
                    vbid = vbid.0,
                    uuid = entry.vb_uuid,
                    seqno = entry.by_seqno,
                    "new failover entry after unclean shutdown"
                );
            }

            vb.hash_table()
                .lock()
                .set_max_deleted_rev_seqno(vbs.max_deleted_seqno);
            vb.set_persistence_seqno(vbs.high_seqno.max(0) as u64);
            self.warmed_vbuckets.lock().insert(vbid.0, Arc::new(vb));
        }

        if self.shard_barrier() {
            self.transition(WarmupPhase::LoadingCollectionCounts);
        }
    }

    fn do_loading_collection_counts(&self, shard: usize) {
        let store = self.bucket.store_for_shard(shard);
        for vbid in &self.shard_vb_ids.read()[shard] {
            if !self.warmed_vbuckets.lock().contains_key(&vbid.0) {
                continue;
            }
            for cid in store.collection_ids(*vbid) {
                let (status, _stats) = store.get_collection_stats(*vbid, cid);
                if status == GetCollectionStatsStatus::Failed {
                    self.abort("unreadable collection stats");
                    return;
                }
            }
        }
        if self.shard_barrier() {
            self.transition(WarmupPhase::EstimateDatabaseItemCount);
        }
    }

    fn do_estimate_item_count(&self, shard: usize) {
        let store = self.bucket.store_for_shard(shard);
        let mut count = 0u64;
        for vbid in &self.shard_vb_ids.read()[shard] {
            let vb = self.warmed_vbuckets.lock().get(&vbid.0).cloned();
            if let Some(vb) = vb {
                let items = store.get_item_count(*vbid);
                vb.set_num_total_items(items);
                count += items;
            }
        }
        self.estimated_item_count.fetch_add(count, Ordering::AcqRel);

        if self.shard_barrier() {
            self.transition(WarmupPhase::LoadPreparedSyncWrites);
        }
    }

    fn do_load_prepared_sync_writes(&self, shard: usize) {
        let store = self.bucket.store_for_shard(shard);
        let states = self.shard_vb_states.read();
        for vbid in &self.shard_vb_ids.read()[shard] {
            let vb = match self.warmed_vbuckets.lock().get(&vbid.0).cloned() {
                Some(vb) => vb,
                None => continue,
            };
            let start = states[shard]
                .get(&vbid.0)
                .map_or(0, |vbs| vbs.persisted_completed_seqno as i64 + 1);

            let loader = PrepareLoader {
                vb: Arc::clone(&vb),
                stats: Arc::clone(self.bucket.stats()),
            };
            let mut context = match store.init_by_seqno_scan(
                *vbid,
                start,
                DocumentFilter::AllItems,
                ValueFilter::Values,
                Box::new(NoCacheLookup),
                Box::new(loader),
            ) {
                Ok(context) => context,
                Err(_) => {
                    self.abort("failed to open prepare scan");
                    return;
                }
            };
            loop {
                match store.scan(&mut context) {
                    ScanOutcome::Complete => break,
                    ScanOutcome::Yield => continue,
                    ScanOutcome::Failed(_) => {
                        self.abort("prepare scan failed");
                        return;
                    }
                }
            }
            self.bucket
                .stats()
                .warmup_items_visited_loading_prepares
                .fetch_add(context.items_visited, Ordering::Relaxed);
        }

        if self.shard_barrier() {
            self.transition(WarmupPhase::PopulateVBucketMap);
        }
    }

    fn do_populate_vbucket_map(&self, shard: usize) {
        for vbid in &self.shard_vb_ids.read()[shard] {
            let vb = match self.warmed_vbuckets.lock().get(&vbid.0).cloned() {
                Some(vb) => vb,
                None => continue,
            };
            // The state marker must land in the first flush batch, or a
            // replica that should roll back might not.
            vb.checkpoint_manager().queue_set_vbucket_state();
            if self.bucket.persist_vbucket_state(&vb).is_err() {
                error!(
                    vbid = vbid.0,
                    high_seqno = vb.high_seqno(),
                    "flushing vbucket state failed, disabling write traffic"
                );
                self.failed_to_set_vbucket_state
                    .store(true, Ordering::Release);
                self.bucket.disable_write_traffic();
            }
            self.bucket.vbmap().add(vb);
        }

        if self.shard_barrier() {
            // Every shard has published its vBuckets; the flushers can
            // run and blocked connections can proceed.
            self.bucket.start_flusher();
            self.warmed_vbuckets.lock().clear();
            self.process_pending_cookies(Status::Ok);
            if self.bucket.config().bucket.eviction_policy == EvictionPolicy::Value {
                self.transition(WarmupPhase::KeyDump);
            } else {
                self.transition(WarmupPhase::CheckForAccessLog);
            }
        }
    }

    fn do_check_for_access_log(&self) {
        if let Some(start) = *self.started.lock() {
            info!(elapsed = ?start.elapsed(), "metadata loaded");
        }

        if self.maybe_enable_traffic() || self.has_oom_failure() {
            self.transition(WarmupPhase::Done);
            return;
        }

        let base = &self.bucket.config().warmup.access_log_path;
        let available = (0..self.bucket.num_shards())
            .filter(|shard| {
                let current = shard_log_path(base, *shard);
                current.exists() || old_log_path(&current).exists()
            })
            .count();

        if available == self.bucket.num_shards() {
            self.transition(WarmupPhase::LoadingAccessLog);
        } else if self.bucket.config().bucket.eviction_policy == EvictionPolicy::Value {
            self.transition(WarmupPhase::LoadingData);
        } else {
            self.transition(WarmupPhase::LoadingKVPairs);
        }
    }

    fn do_access_log_load(&self, shard: usize) {
        let base = &self.bucket.config().warmup.access_log_path;
        let current = shard_log_path(base, shard);

        let mut success = false;
        for candidate in [current.clone(), old_log_path(&current)] {
            if !candidate.exists() {
                continue;
            }
            match access_log::read_all(&candidate) {
                Ok(batches) => {
                    self.replay_access_log(shard, batches);
                    success = true;
                    break;
                }
                Err(e) => {
                    self.corrupt_access_log.store(true, Ordering::Release);
                    warn!(path = %candidate.display(), error = %e, "error reading access log");
                }
            }
        }
        if !success {
            warn!(shard, "no usable access log for shard");
        }

        if self.shard_barrier() {
            if self.maybe_enable_traffic() {
                self.transition(WarmupPhase::Done);
            } else {
                self.transition(WarmupPhase::LoadingData);
            }
        }
    }

    fn replay_access_log(&self, shard: usize, batches: Vec<crate::access_log::AccessLogBatch>) {
        let store = self.bucket.store_for_shard(shard);
        for batch in batches {
            if self.is_finished_loading() {
                return;
            }
            let vb = match self.bucket.vbmap().get(batch.vbid) {
                Some(vb) => vb,
                None => continue,
            };
            let fetched = store.get_multi(batch.vbid, &batch.keys);
            for key in &batch.keys {
                match fetched.get(key) {
                    Some(Ok(item)) => {
                        let outcome =
                            self.apply_loaded_item(&vb, item, false, WarmupPhase::LoadingAccessLog);
                        if outcome == LoadOutcome::Stop {
                            return;
                        }
                    }
                    _ => {
                        warn!(vbid = batch.vbid.0, key = %key, "access log key failed to load");
                    }
                }
            }
        }
    }

    // --- data load -------------------------------------------------------

    /// Apply one item loaded from disk into its vBucket's hash table,
    /// honouring ejection, emergency purge and the OOM limit.
    fn apply_loaded_item(
        &self,
        vb: &Arc<VBucket>,
        item: &QueuedItem,
        is_partial: bool,
        phase: WarmupPhase,
    ) -> LoadOutcome {
        if item.key.is_in_system_collection() || item.op == QueueOp::Prepare {
            return LoadOutcome::Continue;
        }

        let stats = self.bucket.stats();
        let policy = self.bucket.config().bucket.eviction_policy;
        let should_eject = stats.estimated_total_memory_used()
            >= stats.mem_low_wat.load(Ordering::Acquire);

        let mut retry = true;
        loop {
            let result = vb
                .hash_table()
                .lock()
                .insert_from_warmup(item, should_eject, is_partial, true);
            match result {
                MutationResult::NoMem => {
                    if retry && !self.has_purged.swap(true, Ordering::AcqRel) {
                        warn!(vbid = vb.id().0, "emergency startup purge to free space for load");
                        self.emergency_purge();
                        retry = false;
                        continue;
                    }
                    let oom_count = stats.record_warmup_oom();
                    if oom_count == 1 {
                        warn!(vbid = vb.id().0, "warmup dataload failure: bucket quota too low");
                    }
                    self.oom_failure.store(true, Ordering::Release);
                    return LoadOutcome::Stop;
                }
                MutationResult::InvalidCas => {
                    stats.warm_dups.fetch_add(1, Ordering::Relaxed);
                    break;
                }
                MutationResult::Stored | MutationResult::NotFound => break,
            }
        }

        match phase {
            WarmupPhase::KeyDump => {
                stats.warmed_up_keys.fetch_add(1, Ordering::Relaxed);
            }
            WarmupPhase::LoadingData | WarmupPhase::LoadingAccessLog => {
                if policy == EvictionPolicy::Full {
                    stats.warmed_up_keys.fetch_add(1, Ordering::Relaxed);
                }
                stats.warmed_up_values.fetch_add(1, Ordering::Relaxed);
            }
            _ => {
                stats.warmed_up_keys.fetch_add(1, Ordering::Relaxed);
                stats.warmed_up_values.fetch_add(1, Ordering::Relaxed);
            }
        }

        let admit = matches!(
            phase,
            WarmupPhase::LoadingData | WarmupPhase::LoadingAccessLog
        );
        if admit && self.maybe_enable_traffic() {
            // Enough is loaded; every shard's load short-circuits.
            self.finished_loading.store(true, Ordering::Release);
            return LoadOutcome::Stop;
        }
        LoadOutcome::Continue
    }

    fn emergency_purge(&self) {
        let policy = self.bucket.config().bucket.eviction_policy;
        let mut freed = 0;
        for vbid in self.bucket.vbmap().live_vbids() {
            if let Some(vb) = self.bucket.vbmap().get(vbid) {
                freed += vb.hash_table().lock().eject_all_eligible(policy);
            }
        }
        info!(freed, "emergency purge complete");
    }

    fn complete_backfill_shard(&self, phase: WarmupPhase) {
        if !self.shard_barrier() {
            return;
        }
        match phase {
            WarmupPhase::KeyDump => self.transition(WarmupPhase::CheckForAccessLog),
            WarmupPhase::LoadingKVPairs | WarmupPhase::LoadingData => {
                self.transition(WarmupPhase::Done);
            }
            _ => {}
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoadOutcome {
    Continue,
    Stop,
}

// --- scan callbacks ------------------------------------------------------

struct NoCacheLookup;

impl CacheLookup for NoCacheLookup {
    fn lookup(&mut self, _vbid: Vbid, _key: &DocKey, _seqno: i64) -> CacheLookupStatus {
        CacheLookupStatus::Proceed
    }
}

/// Loads outstanding prepares during `LoadPreparedSyncWrites`.
struct PrepareLoader {
    vb: Arc<VBucket>,
    stats: Arc<crate::stats::EngineStats>,
}

impl ValueApplier for PrepareLoader {
    fn apply(&mut self, _vbid: Vbid, item: &QueuedItem, _is_partial: bool) -> ApplyStatus {
        if item.op != QueueOp::Prepare {
            return ApplyStatus::Continue;
        }
        if self
            .vb
            .hash_table()
            .lock()
            .insert_prepare_from_warmup(item)
            .is_success()
        {
            self.stats.warmed_up_prepares.fetch_add(1, Ordering::Relaxed);
        }
        ApplyStatus::Continue
    }
}

/// Deadline-aware cache filter for the data-load scans. In the
/// value-eviction data phase it also skips keys whose value is already
/// resident.
struct BackfillCacheLookup {
    warmup: Arc<Warmup>,
    phase: WarmupPhase,
    deadline: Arc<Mutex<Instant>>,
}

impl CacheLookup for BackfillCacheLookup {
    fn lookup(&mut self, vbid: Vbid, key: &DocKey, _seqno: i64) -> CacheLookupStatus {
        if Instant::now() >= *self.deadline.lock() {
            return CacheLookupStatus::Yield;
        }
        if self.phase != WarmupPhase::LoadingData {
            return CacheLookupStatus::Proceed;
        }
        if key.is_in_system_collection() {
            return CacheLookupStatus::Skip;
        }
        match self.warmup.bucket.vbmap().get(vbid) {
            Some(vb) => {
                let resident = vb
                    .hash_table()
                    .lock()
                    .find_committed(key)
                    .map_or(false, |value| value.is_resident());
                if resident {
                    CacheLookupStatus::Skip
                } else {
                    CacheLookupStatus::Proceed
                }
            }
            None => CacheLookupStatus::Skip,
        }
    }
}

/// Applies loaded items during the backfill phases.
struct BackfillApplier {
    warmup: Arc<Warmup>,
    phase: WarmupPhase,
    deadline: Arc<Mutex<Instant>>,
}

impl ValueApplier for BackfillApplier {
    fn apply(&mut self, vbid: Vbid, item: &QueuedItem, is_partial: bool) -> ApplyStatus {
        if Instant::now() >= *self.deadline.lock() {
            return ApplyStatus::Yield;
        }
        if self.warmup.is_finished_loading() {
            return ApplyStatus::Stop;
        }
        let vb = match self.warmup.bucket.vbmap().get(vbid) {
            Some(vb) => vb,
            None => return ApplyStatus::Continue,
        };
        match self.warmup.apply_loaded_item(&vb, item, is_partial, self.phase) {
            LoadOutcome::Continue => ApplyStatus::Continue,
            LoadOutcome::Stop => ApplyStatus::Stop,
        }
    }
}

// --- the task ------------------------------------------------------------

enum StepKind {
    Initialize,
    CreateVBuckets {
        shard: usize,
    },
    LoadingCollectionCounts {
        shard: usize,
    },
    EstimateItemCount {
        shard: usize,
    },
    LoadPreparedSyncWrites {
        shard: usize,
    },
    PopulateVBucketMap {
        shard: usize,
    },
    CheckForAccessLog,
    AccessLogLoad {
        shard: usize,
    },
    Backfill {
        shard: usize,
        phase: WarmupPhase,
        vb_index: usize,
        scan: Option<ScanContext>,
        deadline: Arc<Mutex<Instant>>,
    },
}

impl StepKind {
    fn backfill(shard: usize, phase: WarmupPhase) -> StepKind {
        StepKind::Backfill {
            shard,
            phase,
            vb_index: 0,
            scan: None,
            deadline: Arc::new(Mutex::new(Instant::now())),
        }
    }
}

struct WarmupStep {
    warmup: Arc<Warmup>,
    kind: StepKind,
}

impl Task for WarmupStep {
    fn run(&mut self) -> TaskOutcome {
        let warmup = Arc::clone(&self.warmup);
        if warmup.stopped.load(Ordering::Acquire) || warmup.state.is_done() {
            return TaskOutcome::Done;
        }
        match &mut self.kind {
            StepKind::Initialize => warmup.do_initialize(),
            StepKind::CreateVBuckets { shard } => warmup.do_create_vbuckets(*shard),
            StepKind::LoadingCollectionCounts { shard } => {
                warmup.do_loading_collection_counts(*shard)
            }
            StepKind::EstimateItemCount { shard } => warmup.do_estimate_item_count(*shard),
            StepKind::LoadPreparedSyncWrites { shard } => {
                warmup.do_load_prepared_sync_writes(*shard)
            }
            StepKind::PopulateVBucketMap { shard } => warmup.do_populate_vbucket_map(*shard),
            StepKind::CheckForAccessLog => warmup.do_check_for_access_log(),
            StepKind::AccessLogLoad { shard } => warmup.do_access_log_load(*shard),
            StepKind::Backfill {
                shard,
                phase,
                vb_index,
                scan,
                deadline,
            } => {
                return run_backfill_slice(&warmup, *shard, *phase, vb_index, scan, deadline);
            }
        }
        TaskOutcome::Done
    }

    fn description(&self) -> String {
        match &self.kind {
            StepKind::Initialize => "Warmup - initialize".to_string(),
            StepKind::CreateVBuckets { shard } => {
                format!("Warmup - creating vbuckets: shard {shard}")
            }
            StepKind::LoadingCollectionCounts { shard } => {
                format!("Warmup - loading collection counts: shard {shard}")
            }
            StepKind::EstimateItemCount { shard } => {
                format!("Warmup - estimate item count: shard {shard}")
            }
            StepKind::LoadPreparedSyncWrites { shard } => {
                format!("Warmup - loading prepared SyncWrites: shard {shard}")
            }
            StepKind::PopulateVBucketMap { shard } => {
                format!("Warmup - populate VB Map: shard {shard}")
            }
            StepKind::CheckForAccessLog => "Warmup - check for access log".to_string(),
            StepKind::AccessLogLoad { shard } => {
                format!("Warmup - loading access log: shard {shard}")
            }
            StepKind::Backfill { shard, phase, .. } => {
                format!("Warmup - {}: shard {shard}", phase.as_str())
            }
        }
    }

    fn max_expected_duration(&self) -> Duration {
        match &self.kind {
            StepKind::Backfill { .. } => Duration::from_millis(10),
            StepKind::LoadPreparedSyncWrites { .. } => Duration::from_secs(600),
            _ => Duration::from_millis(100),
        }
    }
}

fn run_backfill_slice(
    warmup: &Arc<Warmup>,
    shard: usize,
    phase: WarmupPhase,
    vb_index: &mut usize,
    scan: &mut Option<ScanContext>,
    deadline: &Arc<Mutex<Instant>>,
) -> TaskOutcome {
    let store = Arc::clone(warmup.bucket.store_for_shard(shard));
    let vbids = warmup.shard_vb_ids.read()[shard].clone();
    let slice = Duration::from_millis(warmup.bucket.config().warmup.backfill_deadline_ms);
    *deadline.lock() = Instant::now() + slice;

    loop {
        if warmup.is_finished_loading() || warmup.has_oom_failure() || warmup.state.is_done() {
            warmup.complete_backfill_shard(phase);
            return TaskOutcome::Done;
        }
        if *vb_index >= vbids.len() {
            warmup.complete_backfill_shard(phase);
            return TaskOutcome::Done;
        }

        if scan.is_none() {
            let vbid = vbids[*vb_index];
            if warmup.bucket.vbmap().get(vbid).is_none() {
                *vb_index += 1;
                continue;
            }
            let value_filter = match phase {
                WarmupPhase::KeyDump => ValueFilter::KeysOnly,
                _ => ValueFilter::Values,
            };
            let context = store.init_by_seqno_scan(
                vbid,
                1,
                DocumentFilter::NoDeletes,
                value_filter,
                Box::new(BackfillCacheLookup {
                    warmup: Arc::clone(warmup),
                    phase,
                    deadline: Arc::clone(deadline),
                }),
                Box::new(BackfillApplier {
                    warmup: Arc::clone(warmup),
                    phase,
                    deadline: Arc::clone(deadline),
                }),
            );
            match context {
                Ok(context) => *scan = Some(context),
                Err(_) => {
                    *vb_index += 1;
                    continue;
                }
            }
        }

        let context = scan.as_mut().expect("scan context initialised above");
        match store.scan(context) {
            ScanOutcome::Complete => {
                *scan = None;
                *vb_index += 1;
            }
            ScanOutcome::Yield => {
                return TaskOutcome::Reschedule(Duration::from_millis(1));
            }
            ScanOutcome::Failed(status) => {
                error!(shard, %status, "warmup backfill scan failed, aborting shard");
                warmup.complete_backfill_shard(phase);
                return TaskOutcome::Done;
            }
        }
    }
}
