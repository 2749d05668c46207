//! The warmup phase variable.
//!
//! Warmup progresses through a fixed set of phases; every transition is
//! validated against the legal-transition table and applied with a
//! compare-and-swap loop so that a concurrent forced shutdown (which
//! jumps straight to `Done`) always wins.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use tracing::{debug, error};

use crate::status::Status;

/// One phase of warmup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WarmupPhase {
    /// Read persisted stats, detect unclean shutdown, plan shards
    Initialize = 0,
    /// Instantiate vBuckets from their persisted state records
    CreateVBuckets = 1,
    /// Validate and load per-collection counts
    LoadingCollectionCounts = 2,
    /// Estimate the total item count on disk
    EstimateDatabaseItemCount = 3,
    /// Load outstanding prepared SyncWrites
    LoadPreparedSyncWrites = 4,
    /// Publish vBuckets to the map and persist their initial state
    PopulateVBucketMap = 5,
    /// Load every key (value eviction only)
    KeyDump = 6,
    /// Decide whether the access log can prime the working set
    CheckForAccessLog = 7,
    /// Replay the access log
    LoadingAccessLog = 8,
    /// Load keys and values (full eviction)
    LoadingKVPairs = 9,
    /// Load values for already-loaded keys (value eviction)
    LoadingData = 10,
    /// Terminal
    Done = 11,
}

impl WarmupPhase {
    /// Human-readable phase description.
    pub const fn as_str(&self) -> &'static str {
        match self {
            WarmupPhase::Initialize => "initialize",
            WarmupPhase::CreateVBuckets => "creating vbuckets",
            WarmupPhase::LoadingCollectionCounts => "loading collection counts",
            WarmupPhase::EstimateDatabaseItemCount => "estimating database item count",
            WarmupPhase::LoadPreparedSyncWrites => "loading prepared SyncWrites",
            WarmupPhase::PopulateVBucketMap => "populating vbucket map",
            WarmupPhase::KeyDump => "loading keys",
            WarmupPhase::CheckForAccessLog => "determine access log availability",
            WarmupPhase::LoadingAccessLog => "loading access log",
            WarmupPhase::LoadingKVPairs => "loading k/v pairs",
            WarmupPhase::LoadingData => "loading data",
            WarmupPhase::Done => "done",
        }
    }

    fn from_u8(value: u8) -> WarmupPhase {
        match value {
            0 => WarmupPhase::Initialize,
            1 => WarmupPhase::CreateVBuckets,
            2 => WarmupPhase::LoadingCollectionCounts,
            3 => WarmupPhase::EstimateDatabaseItemCount,
            4 => WarmupPhase::LoadPreparedSyncWrites,
            5 => WarmupPhase::PopulateVBucketMap,
            6 => WarmupPhase::KeyDump,
            7 => WarmupPhase::CheckForAccessLog,
            8 => WarmupPhase::LoadingAccessLog,
            9 => WarmupPhase::LoadingKVPairs,
            10 => WarmupPhase::LoadingData,
            _ => WarmupPhase::Done,
        }
    }

    /// Whether moving from `self` to `to` is allowed.
    pub fn legal_transition(&self, to: WarmupPhase) -> bool {
        use WarmupPhase::*;
        match self {
            Initialize => matches!(to, CreateVBuckets),
            CreateVBuckets => matches!(to, LoadingCollectionCounts),
            LoadingCollectionCounts => matches!(to, EstimateDatabaseItemCount),
            EstimateDatabaseItemCount => matches!(to, LoadPreparedSyncWrites),
            LoadPreparedSyncWrites => matches!(to, PopulateVBucketMap),
            PopulateVBucketMap => matches!(to, KeyDump | CheckForAccessLog),
            KeyDump => matches!(to, LoadingKVPairs | CheckForAccessLog),
            CheckForAccessLog => {
                matches!(to, LoadingAccessLog | LoadingData | LoadingKVPairs | Done)
            }
            LoadingAccessLog => matches!(to, Done | LoadingData),
            LoadingKVPairs => matches!(to, Done),
            LoadingData => matches!(to, Done),
            Done => false,
        }
    }
}

impl fmt::Display for WarmupPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Atomic warmup phase with CAS transitions.
#[derive(Debug)]
pub struct WarmupState {
    state: AtomicU8,
}

impl WarmupState {
    /// Create a state in `Initialize`.
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(WarmupPhase::Initialize as u8),
        }
    }

    /// Current phase.
    pub fn phase(&self) -> WarmupPhase {
        WarmupPhase::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Transition to `to`.
    ///
    /// `Done` is final: once reached, every further transition is a
    /// silent no-op (a concurrent shutdown may force it at any point).
    /// An illegal transition without `force` is reported as `Failed`.
    pub fn transition(&self, to: WarmupPhase, force: bool) -> Result<(), Status> {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            let phase = WarmupPhase::from_u8(current);
            if phase == WarmupPhase::Done {
                return Ok(());
            }
            if !force && !phase.legal_transition(to) {
                error!(from = %phase, to = %to, "illegal warmup transition");
                return Err(Status::Failed);
            }
            match self.state.compare_exchange_weak(
                current,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    debug!(from = %phase, to = %to, "warmup transition");
                    return Ok(());
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Whether warmup has reached `Done`.
    pub fn is_done(&self) -> bool {
        self.phase() == WarmupPhase::Done
    }
}

impl Default for WarmupState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_value_eviction() {
        let state = WarmupState::new();
        let phases = [
            WarmupPhase::CreateVBuckets,
            WarmupPhase::LoadingCollectionCounts,
            WarmupPhase::EstimateDatabaseItemCount,
            WarmupPhase::LoadPreparedSyncWrites,
            WarmupPhase::PopulateVBucketMap,
            WarmupPhase::KeyDump,
            WarmupPhase::CheckForAccessLog,
            WarmupPhase::LoadingData,
            WarmupPhase::Done,
        ];
        for phase in phases {
            state.transition(phase, false).unwrap();
            assert_eq!(state.phase(), phase);
        }
        assert!(state.is_done());
    }

    #[test]
    fn test_full_eviction_path() {
        let state = WarmupState::new();
        for phase in [
            WarmupPhase::CreateVBuckets,
            WarmupPhase::LoadingCollectionCounts,
            WarmupPhase::EstimateDatabaseItemCount,
            WarmupPhase::LoadPreparedSyncWrites,
            WarmupPhase::PopulateVBucketMap,
            WarmupPhase::CheckForAccessLog,
            WarmupPhase::LoadingKVPairs,
            WarmupPhase::Done,
        ] {
            state.transition(phase, false).unwrap();
        }
        assert!(state.is_done());
    }

    #[test]
    fn test_access_log_path() {
        let state = WarmupState::new();
        for phase in [
            WarmupPhase::CreateVBuckets,
            WarmupPhase::LoadingCollectionCounts,
            WarmupPhase::EstimateDatabaseItemCount,
            WarmupPhase::LoadPreparedSyncWrites,
            WarmupPhase::PopulateVBucketMap,
            WarmupPhase::CheckForAccessLog,
            WarmupPhase::LoadingAccessLog,
            WarmupPhase::LoadingData,
            WarmupPhase::Done,
        ] {
            state.transition(phase, false).unwrap();
        }
        assert!(state.is_done());
    }

    #[test]
    fn test_illegal_transition_rejected() {
        let state = WarmupState::new();
        assert_eq!(
            state.transition(WarmupPhase::LoadingData, false),
            Err(Status::Failed)
        );
        assert_eq!(state.phase(), WarmupPhase::Initialize);
    }

    #[test]
    fn test_forced_done_from_anywhere() {
        let state = WarmupState::new();
        state.transition(WarmupPhase::CreateVBuckets, false).unwrap();
        state.transition(WarmupPhase::Done, true).unwrap();
        assert!(state.is_done());
    }

    #[test]
    fn test_done_is_terminal() {
        let state = WarmupState::new();
        state.transition(WarmupPhase::Done, true).unwrap();
        // Even a forced transition cannot leave Done.
        state.transition(WarmupPhase::Initialize, true).unwrap();
        assert!(state.is_done());
    }

    #[test]
    fn test_descriptions() {
        assert_eq!(WarmupPhase::Initialize.as_str(), "initialize");
        assert_eq!(WarmupPhase::KeyDump.as_str(), "loading keys");
        assert_eq!(
            WarmupPhase::CheckForAccessLog.as_str(),
            "determine access log availability"
        );
        assert_eq!(WarmupPhase::Done.as_str(), "done");
    }
}
