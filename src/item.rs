//! Queued items: the unit of the checkpoint write log.
//!
//! A `QueuedItem` is either a user operation (mutation, deletion, SyncWrite
//! prepare/commit/abort), a system event, or one of the meta markers that
//! structure a checkpoint (`Empty`, `CheckpointStart`, `CheckpointEnd`,
//! `SetVBucketState`).
//!
//! Sequence numbers are only unique for user operations and system events;
//! meta items share the seqno of the operation they annotate
//! (`CheckpointEnd` uses the last mutation seqno plus one).

use std::fmt;
use std::sync::Arc;

use crate::key::DocKey;

/// Shared handle to a queued item. Items are referenced from the checkpoint
/// queue, the dedup indexes and in-flight cursor batches simultaneously.
pub type QueuedItemPtr = Arc<QueuedItem>;

/// The operation a queued item represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum QueueOp {
    /// Set/add/replace of a document
    Mutation = 0,
    /// Deletion of a document
    Deletion = 1,
    /// Pending SyncWrite
    Prepare = 2,
    /// Abort of a pending SyncWrite
    Abort = 3,
    /// Commit of a pending SyncWrite
    Commit = 4,
    /// Collection/scope system event
    SystemEvent = 5,
    /// Meta: first real entry of every checkpoint
    CheckpointStart = 6,
    /// Meta: final entry of a closed checkpoint
    CheckpointEnd = 7,
    /// Meta: vBucket state change marker
    SetVBucketState = 8,
    /// Meta: placeholder sentinel; cursors are advanced before
    /// dereference, so every checkpoint begins with one. Also used to
    /// invalidate superseded queue slots.
    Empty = 9,
}

impl QueueOp {
    /// Check whether this is a meta operation (not a user-visible item).
    #[inline]
    pub const fn is_meta(&self) -> bool {
        matches!(
            self,
            QueueOp::CheckpointStart
                | QueueOp::CheckpointEnd
                | QueueOp::SetVBucketState
                | QueueOp::Empty
        )
    }

    /// Check whether this meta operation occupies a queue entry that
    /// cursors should deliver (the `Empty` sentinel is never delivered).
    #[inline]
    pub const fn is_deliverable_meta(&self) -> bool {
        matches!(
            self,
            QueueOp::CheckpointStart | QueueOp::CheckpointEnd | QueueOp::SetVBucketState
        )
    }

    /// Check whether the operation belongs to the prepared dedup
    /// namespace. Aborts share the namespace with prepares.
    #[inline]
    pub const fn is_prepared_namespace(&self) -> bool {
        matches!(self, QueueOp::Prepare | QueueOp::Abort)
    }

    /// Get the operation as a string
    pub const fn as_str(&self) -> &'static str {
        match self {
            QueueOp::Mutation => "mutation",
            QueueOp::Deletion => "deletion",
            QueueOp::Prepare => "prepare",
            QueueOp::Abort => "abort",
            QueueOp::Commit => "commit",
            QueueOp::SystemEvent => "system_event",
            QueueOp::CheckpointStart => "checkpoint_start",
            QueueOp::CheckpointEnd => "checkpoint_end",
            QueueOp::SetVBucketState => "set_vbucket_state",
            QueueOp::Empty => "empty",
        }
    }
}

impl fmt::Display for QueueOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Durability level of a SyncWrite.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DurabilityLevel {
    /// Replicated to a majority of nodes
    Majority = 1,
    /// Majority, and persisted on the active node
    MajorityAndPersistOnMaster = 2,
    /// Persisted on a majority of nodes
    PersistToMajority = 3,
}

/// Durability requirements attached to a prepare.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DurabilityReq {
    /// Required durability level
    pub level: DurabilityLevel,
    /// Timeout in milliseconds; `None` means infinite
    pub timeout_ms: Option<u32>,
}

/// One event in the per-vBucket write log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedItem {
    /// Collection-prefixed document key. Meta items use a fixed internal
    /// key naming the marker.
    pub key: DocKey,
    /// Operation represented by this entry
    pub op: QueueOp,
    /// Sequence number; strictly increasing for non-meta operations
    pub by_seqno: i64,
    /// HLC-derived version
    pub cas: u64,
    /// Revision seqno, incremented on every update of the document
    pub rev_seqno: u64,
    /// Expiry time (seconds since epoch; 0 = never)
    pub expiry: u32,
    /// Client-visible flags
    pub flags: u32,
    /// Datatype bits (json/snappy/xattr)
    pub datatype: u8,
    /// Document body; absent for meta items, deletions without a body and
    /// values released by expel
    pub value: Option<Vec<u8>>,
    /// Durability requirements; present only on prepares
    pub durability: Option<DurabilityReq>,
    /// Deletion marker (set for deletions and deleted prepares)
    pub deleted: bool,
}

impl QueuedItem {
    fn meta(op: QueueOp, seqno: i64) -> Self {
        let name: &[u8] = match op {
            QueueOp::CheckpointStart => b"checkpoint_start",
            QueueOp::CheckpointEnd => b"checkpoint_end",
            QueueOp::SetVBucketState => b"set_vbucket_state",
            _ => b"dummy_key",
        };
        Self {
            key: DocKey::from_logical(name),
            op,
            by_seqno: seqno,
            cas: 0,
            rev_seqno: 0,
            expiry: 0,
            flags: 0,
            datatype: 0,
            value: None,
            durability: None,
            deleted: false,
        }
    }

    /// Create a mutation.
    pub fn mutation(key: DocKey, value: Vec<u8>, by_seqno: i64, cas: u64) -> Self {
        Self {
            key,
            op: QueueOp::Mutation,
            by_seqno,
            cas,
            rev_seqno: 1,
            expiry: 0,
            flags: 0,
            datatype: 0,
            value: Some(value),
            durability: None,
            deleted: false,
        }
    }

    /// Create a deletion.
    pub fn deletion(key: DocKey, by_seqno: i64, cas: u64, rev_seqno: u64) -> Self {
        Self {
            key,
            op: QueueOp::Deletion,
            by_seqno,
            cas,
            rev_seqno,
            expiry: 0,
            flags: 0,
            datatype: 0,
            value: None,
            durability: None,
            deleted: true,
        }
    }

    /// Create a SyncWrite prepare.
    pub fn prepare(
        key: DocKey,
        value: Vec<u8>,
        by_seqno: i64,
        cas: u64,
        durability: DurabilityReq,
    ) -> Self {
        Self {
            key,
            op: QueueOp::Prepare,
            by_seqno,
            cas,
            rev_seqno: 1,
            expiry: 0,
            flags: 0,
            datatype: 0,
            value: Some(value),
            durability: Some(durability),
            deleted: false,
        }
    }

    /// Create a commit of a previously prepared SyncWrite.
    pub fn commit(key: DocKey, value: Vec<u8>, by_seqno: i64, cas: u64) -> Self {
        Self {
            key,
            op: QueueOp::Commit,
            by_seqno,
            cas,
            rev_seqno: 1,
            expiry: 0,
            flags: 0,
            datatype: 0,
            value: Some(value),
            durability: None,
            deleted: false,
        }
    }

    /// Create an abort of a previously prepared SyncWrite.
    pub fn abort(key: DocKey, by_seqno: i64) -> Self {
        Self {
            key,
            op: QueueOp::Abort,
            by_seqno,
            cas: 0,
            rev_seqno: 1,
            expiry: 0,
            flags: 0,
            datatype: 0,
            value: None,
            durability: None,
            deleted: true,
        }
    }

    /// Create a system event (collection create/drop and similar).
    pub fn system_event(key: DocKey, value: Vec<u8>, by_seqno: i64) -> Self {
        Self {
            key,
            op: QueueOp::SystemEvent,
            by_seqno,
            cas: 0,
            rev_seqno: 1,
            expiry: 0,
            flags: 0,
            datatype: 0,
            value: Some(value),
            durability: None,
            deleted: false,
        }
    }

    /// Create a `checkpoint_start` marker sharing the seqno of the first
    /// following mutation.
    pub fn checkpoint_start(seqno: i64) -> Self {
        Self::meta(QueueOp::CheckpointStart, seqno)
    }

    /// Create a `checkpoint_end` marker; by convention its seqno is the
    /// checkpoint's high seqno plus one.
    pub fn checkpoint_end(seqno: i64) -> Self {
        Self::meta(QueueOp::CheckpointEnd, seqno)
    }

    /// Create a vBucket state-change marker.
    pub fn set_vbucket_state(seqno: i64) -> Self {
        Self::meta(QueueOp::SetVBucketState, seqno)
    }

    /// Create the sentinel placed at the front of every checkpoint.
    pub fn empty(seqno: i64) -> Self {
        Self::meta(QueueOp::Empty, seqno)
    }

    /// Check whether this is a meta item.
    #[inline]
    pub fn is_meta(&self) -> bool {
        self.op.is_meta()
    }

    /// Check whether this entry belongs to the committed dedup namespace.
    #[inline]
    pub fn is_committed_namespace(&self) -> bool {
        !self.op.is_meta() && !self.op.is_prepared_namespace()
    }

    /// Size of the value payload in bytes.
    #[inline]
    pub fn value_size(&self) -> usize {
        self.value.as_ref().map_or(0, Vec::len)
    }

    /// Bytes this item accounts for in checkpoint memory: key, fixed
    /// metadata and value.
    pub fn size_in_memory(&self) -> usize {
        self.key.size() + std::mem::size_of::<Self>() + self.value_size()
    }

    /// Check whether this prepare/mutation can be merged with `other`
    /// purely at the item level (same key, same dedup namespace).
    pub fn same_dedup_slot(&self, other: &QueuedItem) -> bool {
        self.key == other.key
            && self.op.is_prepared_namespace() == other.op.is_prepared_namespace()
    }
}

impl fmt::Display for QueuedItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{} {}", self.op, self.by_seqno, self.key)
    }
}
