//! The persisted vBucket state record.
//!
//! Describes the detailed on-disk state of a vBucket: its high-level
//! state (active, replica, ...) plus the seqnos and properties needed to
//! rebuild the in-memory pipeline at warmup. One record is stored per
//! vBucket file and rewritten during flush.
//!
//! Fields have accreted over time and the record is read back across
//! upgrades, so deserialization accepts older versions by defaulting any
//! missing field; `version` records the layout that wrote the record.

use serde::{Deserialize, Serialize};

use crate::status::Status;

/// Current version of the persisted record layout.
///
/// v1: implicit original layout.
/// v2: snapshot start/end sanitized against the high seqno.
/// v3: completed/prepared seqnos and the on-disk prepare counter added.
pub const CURRENT_VERSION: u32 = 3;

/// Seqno marking "HLC epoch not yet initialised".
pub const HLC_EPOCH_UNINITIALISED: i64 = -1;

/// High-level state of a vBucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VBucketState {
    /// Serving reads and writes
    Active,
    /// Receiving replicated data
    Replica,
    /// Waiting to become active
    Pending,
    /// Not in use
    #[default]
    Dead,
}

impl VBucketState {
    /// Get the state as a string
    pub const fn as_str(&self) -> &'static str {
        match self {
            VBucketState::Active => "active",
            VBucketState::Replica => "replica",
            VBucketState::Pending => "pending",
            VBucketState::Dead => "dead",
        }
    }
}

impl std::fmt::Display for VBucketState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Sub-record storing the data which only changes as part of a state
/// transition.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct VBucketTransitionState {
    /// vBucket state at the transition
    #[serde(default)]
    pub state: VBucketState,
    /// JSON-encoded failover table (empty string when never set)
    #[serde(default)]
    pub failovers: String,
    /// Replication topology: a JSON array of chains, each chain an array
    /// of node names. Empty when not yet set.
    #[serde(default)]
    pub replication_topology: serde_json::Value,
}

impl VBucketTransitionState {
    /// Check whether a replication topology has been set.
    pub fn has_topology(&self) -> bool {
        match &self.replication_topology {
            serde_json::Value::Array(chains) => !chains.is_empty(),
            _ => false,
        }
    }
}

/// The versioned record stored per vBucket file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedVBucketState {
    /// Record layout version; see [`CURRENT_VERSION`].
    #[serde(default = "default_version")]
    pub version: u32,
    /// Highest seqno persisted
    #[serde(default)]
    pub high_seqno: i64,
    /// Seqno below which tombstones have been purged
    #[serde(default)]
    pub purge_seqno: u64,
    /// Maximum CAS value in the vBucket
    #[serde(default)]
    pub max_cas: u64,
    /// Seqno at which CAS became HLC-encoded; -1 when uninitialised
    #[serde(default = "default_hlc_epoch")]
    pub hlc_cas_epoch_seqno: i64,
    /// Start seqno of the last persisted snapshot
    #[serde(default)]
    pub last_snap_start: u64,
    /// End seqno of the last persisted snapshot
    #[serde(default)]
    pub last_snap_end: u64,
    /// Highest client-visible seqno
    #[serde(default)]
    pub max_visible_seqno: u64,
    /// Highest rev-seqno among deleted items
    #[serde(default)]
    pub max_deleted_seqno: u64,
    /// Seqno of the last completed (committed or aborted) prepare
    #[serde(default)]
    pub persisted_completed_seqno: u64,
    /// Seqno of the last prepare
    #[serde(default)]
    pub persisted_prepared_seqno: u64,
    /// Number of prepares on disk
    #[serde(default)]
    pub on_disk_prepares: u64,
    /// Whether the vBucket might contain xattr-carrying documents
    #[serde(default)]
    pub might_contain_xattrs: bool,
    /// Whether keys in the file carry a collection prefix. Files without
    /// namespacing are unusable and abort warmup.
    #[serde(default = "default_true")]
    pub supports_namespaces: bool,
    /// State-transition sub-record
    #[serde(default)]
    pub transition: VBucketTransitionState,
}

fn default_version() -> u32 {
    1
}

fn default_hlc_epoch() -> i64 {
    HLC_EPOCH_UNINITIALISED
}

fn default_true() -> bool {
    true
}

impl Default for PersistedVBucketState {
    fn default() -> Self {
        Self {
            version: CURRENT_VERSION,
            high_seqno: 0,
            purge_seqno: 0,
            max_cas: 0,
            hlc_cas_epoch_seqno: HLC_EPOCH_UNINITIALISED,
            last_snap_start: 0,
            last_snap_end: 0,
            max_visible_seqno: 0,
            max_deleted_seqno: 0,
            persisted_completed_seqno: 0,
            persisted_prepared_seqno: 0,
            on_disk_prepares: 0,
            might_contain_xattrs: false,
            supports_namespaces: true,
            transition: VBucketTransitionState::default(),
        }
    }
}

impl PersistedVBucketState {
    /// Serialize to the on-disk JSON form.
    pub fn to_json_bytes(&self) -> Result<Vec<u8>, Status> {
        serde_json::to_vec(self).map_err(|_| Status::Failed)
    }

    /// Deserialize from the on-disk JSON form, defaulting fields absent
    /// in records written by older versions.
    pub fn from_json_bytes(bytes: &[u8]) -> Result<Self, Status> {
        serde_json::from_slice(bytes).map_err(|_| Status::Corruption)
    }

    /// The state recorded at the last transition.
    pub fn state(&self) -> VBucketState {
        self.transition.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_record() {
        let state = PersistedVBucketState::default();
        assert_eq!(state.version, CURRENT_VERSION);
        assert!(state.supports_namespaces);
        assert_eq!(state.hlc_cas_epoch_seqno, HLC_EPOCH_UNINITIALISED);
        assert_eq!(state.state(), VBucketState::Dead);
        assert!(!state.transition.has_topology());
    }

    #[test]
    fn test_round_trip() {
        let mut state = PersistedVBucketState {
            high_seqno: 42,
            last_snap_start: 40,
            last_snap_end: 42,
            max_cas: 0xDEAD_BEEF,
            on_disk_prepares: 3,
            ..PersistedVBucketState::default()
        };
        state.transition.state = VBucketState::Active;
        state.transition.replication_topology =
            serde_json::json!([["active", "replica_1"]]);

        let bytes = state.to_json_bytes().unwrap();
        let decoded = PersistedVBucketState::from_json_bytes(&bytes).unwrap();
        assert_eq!(decoded, state);
        assert!(decoded.transition.has_topology());
    }

    #[test]
    fn test_old_version_defaults_missing_fields() {
        // A v1-era record: no sync-replication fields, no namespace flag.
        let old = br#"{
            "version": 1,
            "high_seqno": 7,
            "last_snap_start": 7,
            "last_snap_end": 7,
            "transition": {"state": "active"}
        }"#;
        let decoded = PersistedVBucketState::from_json_bytes(old).unwrap();
        assert_eq!(decoded.version, 1);
        assert_eq!(decoded.high_seqno, 7);
        assert_eq!(decoded.persisted_completed_seqno, 0);
        assert_eq!(decoded.persisted_prepared_seqno, 0);
        assert_eq!(decoded.on_disk_prepares, 0);
        assert!(decoded.supports_namespaces);
        assert_eq!(decoded.state(), VBucketState::Active);
        assert_eq!(decoded.transition.failovers, "");
    }

    #[test]
    fn test_missing_version_defaults_to_v1() {
        let decoded = PersistedVBucketState::from_json_bytes(b"{}").unwrap();
        assert_eq!(decoded.version, 1);
    }

    #[test]
    fn test_no_namespace_support_is_representable() {
        let raw = br#"{"version": 2, "supports_namespaces": false}"#;
        let decoded = PersistedVBucketState::from_json_bytes(raw).unwrap();
        assert!(!decoded.supports_namespaces);
    }

    #[test]
    fn test_corrupt_record() {
        assert_eq!(
            PersistedVBucketState::from_json_bytes(b"{not json"),
            Err(Status::Corruption)
        );
    }

    #[test]
    fn test_state_strings() {
        assert_eq!(VBucketState::Active.as_str(), "active");
        assert_eq!(VBucketState::Replica.as_str(), "replica");
        assert_eq!(VBucketState::Pending.as_str(), "pending");
        assert_eq!(VBucketState::Dead.as_str(), "dead");
        assert_eq!(format!("{}", VBucketState::Active), "active");
    }
}
