//! Status codes and operation results.
//!
//! This module defines the status codes surfaced by the checkpoint and
//! warmup subsystems, the result of queueing an item into a checkpoint, and
//! the tagged outcome of a pause/resume disk scan.

use std::fmt;

/// Status code returned by engine operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Status {
    /// Operation completed successfully
    #[default]
    Ok = 0,
    /// A cursor cannot be registered at the requested seqno; the caller
    /// must fall back to a disk backfill
    OutOfRange = 1,
    /// A seqno went backwards; invariant violation, fatal
    SeqnoRegression = 2,
    /// An item exists with the same key which cannot be de-duplicated;
    /// the writer must roll the checkpoint
    DuplicateItem = 3,
    /// Transient allocation failure; the writer retries later
    OutOfMemory = 4,
    /// The vBucket is not (or no longer) owned by this node
    NotMyVBucket = 5,
    /// A disk read invariant was broken; warmup aborts
    Corruption = 6,
    /// Issued to pending operations on forced termination
    Shutdown = 7,
    /// I/O error
    IoError = 8,
    /// Generic failure
    Failed = 9,
}

impl Status {
    /// Check if the status indicates success
    #[inline]
    pub const fn is_ok(&self) -> bool {
        matches!(self, Status::Ok)
    }

    /// Check if the status is fatal for the bucket (not recoverable by the
    /// caller retrying)
    #[inline]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Status::SeqnoRegression | Status::Corruption)
    }

    /// Check if the caller may retry the operation later
    #[inline]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Status::OutOfMemory)
    }

    /// Get the status as a string
    pub const fn as_str(&self) -> &'static str {
        match self {
            Status::Ok => "Ok",
            Status::OutOfRange => "OutOfRange",
            Status::SeqnoRegression => "SeqnoRegression",
            Status::DuplicateItem => "DuplicateItem",
            Status::OutOfMemory => "OutOfMemory",
            Status::NotMyVBucket => "NotMyVBucket",
            Status::Corruption => "Corruption",
            Status::Shutdown => "Shutdown",
            Status::IoError => "IoError",
            Status::Failed => "Failed",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Status of queueing an item into the open checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum QueueStatus {
    /// The key was not present in its dedup namespace; the item was
    /// appended and the checkpoint grew by one entry
    SuccessNewItem,
    /// The key was present and the existing entry sits after the
    /// persistence cursor (not yet flushed); it was replaced in place
    SuccessExistingItem,
    /// The key was present but the existing entry sits before the
    /// persistence cursor (already flushed); the entry was moved to the
    /// tail and must be persisted again
    SuccessPersistAgain,
    /// The existing entry cannot be de-duplicated (e.g. a pending
    /// SyncWrite); the caller must roll to a new checkpoint and retry
    FailureDuplicateItem,
}

impl QueueStatus {
    /// Check whether the item was accepted.
    #[inline]
    pub const fn is_success(&self) -> bool {
        !matches!(self, QueueStatus::FailureDuplicateItem)
    }

    /// Get the status as a string
    pub const fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::SuccessNewItem => "SuccessNewItem",
            QueueStatus::SuccessExistingItem => "SuccessExistingItem",
            QueueStatus::SuccessPersistAgain => "SuccessPersistAgain",
            QueueStatus::FailureDuplicateItem => "FailureDuplicateItem",
        }
    }
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Result of queueing an item into a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueResult {
    /// Status of the operation
    pub status: QueueStatus,
    /// Difference in bytes between the replaced entry and its replacement
    /// when `status` is `SuccessExistingItem`; zero otherwise
    pub existing_byte_diff: isize,
}

impl QueueResult {
    /// A result carrying the given status and no byte delta.
    pub const fn of(status: QueueStatus) -> Self {
        Self {
            status,
            existing_byte_diff: 0,
        }
    }
}

/// Outcome of driving a disk scan one step.
///
/// Pause/resume backfills surface their yield point as a first-class
/// variant rather than overloading an error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanOutcome {
    /// The scan visited every remaining item
    Complete,
    /// The scan hit its deadline (or a benign backpressure signal) and
    /// should be re-driven later with the same context
    Yield,
    /// The scan failed and must not be resumed
    Failed(Status),
}

impl ScanOutcome {
    /// Check whether the scan finished.
    #[inline]
    pub const fn is_complete(&self) -> bool {
        matches!(self, ScanOutcome::Complete)
    }

    /// Check whether the scan should be resumed later.
    #[inline]
    pub const fn is_yield(&self) -> bool {
        matches!(self, ScanOutcome::Yield)
    }
}

/// Result of inserting a value into a vBucket hash table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MutationResult {
    /// The value was stored
    Stored,
    /// Allocation failed; the caller may purge and retry
    NoMem,
    /// The in-memory value changed before the disk value arrived; the
    /// disk value was ignored
    InvalidCas,
    /// No previous value existed; the value was stored
    NotFound,
}

impl MutationResult {
    /// Check whether the insert left a value in the table.
    #[inline]
    pub const fn is_success(&self) -> bool {
        matches!(
            self,
            MutationResult::Stored | MutationResult::InvalidCas | MutationResult::NotFound
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_predicates() {
        assert!(Status::Ok.is_ok());
        assert!(!Status::Ok.is_fatal());
        assert!(Status::SeqnoRegression.is_fatal());
        assert!(Status::Corruption.is_fatal());
        assert!(Status::OutOfMemory.is_transient());
        assert!(!Status::OutOfRange.is_fatal());
    }

    #[test]
    fn test_status_display() {
        assert_eq!(format!("{}", Status::Ok), "Ok");
        assert_eq!(format!("{}", Status::OutOfRange), "OutOfRange");
        assert_eq!(format!("{}", Status::SeqnoRegression), "SeqnoRegression");
        assert_eq!(format!("{}", Status::DuplicateItem), "DuplicateItem");
        assert_eq!(format!("{}", Status::OutOfMemory), "OutOfMemory");
        assert_eq!(format!("{}", Status::NotMyVBucket), "NotMyVBucket");
        assert_eq!(format!("{}", Status::Corruption), "Corruption");
        assert_eq!(format!("{}", Status::Shutdown), "Shutdown");
    }

    #[test]
    fn test_queue_status() {
        assert!(QueueStatus::SuccessNewItem.is_success());
        assert!(QueueStatus::SuccessExistingItem.is_success());
        assert!(QueueStatus::SuccessPersistAgain.is_success());
        assert!(!QueueStatus::FailureDuplicateItem.is_success());
        assert_eq!(QueueStatus::SuccessPersistAgain.as_str(), "SuccessPersistAgain");
    }

    #[test]
    fn test_queue_result_of() {
        let result = QueueResult::of(QueueStatus::SuccessNewItem);
        assert_eq!(result.status, QueueStatus::SuccessNewItem);
        assert_eq!(result.existing_byte_diff, 0);
    }

    #[test]
    fn test_scan_outcome() {
        assert!(ScanOutcome::Complete.is_complete());
        assert!(ScanOutcome::Yield.is_yield());
        assert!(!ScanOutcome::Failed(Status::IoError).is_complete());
        assert!(!ScanOutcome::Failed(Status::IoError).is_yield());
    }

    #[test]
    fn test_mutation_result() {
        assert!(MutationResult::Stored.is_success());
        assert!(MutationResult::InvalidCas.is_success());
        assert!(MutationResult::NotFound.is_success());
        assert!(!MutationResult::NoMem.is_success());
    }
}
