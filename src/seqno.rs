//! Sequence-number allocation and monotonic guards.
//!
//! Each vBucket owns a `SeqnoAllocator` handing out strictly increasing
//! `bySeqno` values. `Monotonic` and `AtomicMonotonic` wrap values that are
//! only ever allowed to grow; a rejected update is reported to the caller
//! rather than silently applied.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Monotonic allocator of per-vBucket sequence numbers.
#[derive(Debug)]
pub struct SeqnoAllocator {
    last: AtomicI64,
}

impl SeqnoAllocator {
    /// Create an allocator whose next seqno will be `start + 1`.
    pub fn new(start: i64) -> Self {
        Self {
            last: AtomicI64::new(start),
        }
    }

    /// Allocate the next seqno.
    pub fn next(&self) -> i64 {
        self.last.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// The most recently allocated seqno.
    pub fn current(&self) -> i64 {
        self.last.load(Ordering::Acquire)
    }

    /// Reset the allocator; used when rebuilding a vBucket during warmup
    /// or rollback.
    pub fn reset_to(&self, seqno: i64) {
        self.last.store(seqno, Ordering::Release);
    }

    /// Advance to `seqno` if it is ahead of the current value; returns
    /// false on a regression attempt.
    pub fn advance_to(&self, seqno: i64) -> bool {
        let mut current = self.last.load(Ordering::Acquire);
        loop {
            if seqno <= current {
                return seqno == current;
            }
            match self
                .last
                .compare_exchange_weak(current, seqno, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }
}

impl Default for SeqnoAllocator {
    fn default() -> Self {
        Self::new(0)
    }
}

/// A `u64` that only moves forward. Updates that would go backwards are
/// rejected and reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Monotonic(u64);

impl Monotonic {
    /// Create a new monotonic value.
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Current value.
    pub const fn get(&self) -> u64 {
        self.0
    }

    /// Set the value; returns false (leaving the value unchanged) if the
    /// update would move backwards.
    pub fn set(&mut self, value: u64) -> bool {
        if value < self.0 {
            return false;
        }
        self.0 = value;
        true
    }
}

/// Atomic variant of [`Monotonic`] for values read without a lock.
#[derive(Debug, Default)]
pub struct AtomicMonotonic(AtomicU64);

impl AtomicMonotonic {
    /// Create a new atomic monotonic value.
    pub fn new(value: u64) -> Self {
        Self(AtomicU64::new(value))
    }

    /// Current value.
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    /// Advance to `value`; returns false if the value is already ahead.
    pub fn advance_to(&self, value: u64) -> bool {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            if value < current {
                return false;
            }
            match self
                .0
                .compare_exchange_weak(current, value, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocator_sequence() {
        let alloc = SeqnoAllocator::new(0);
        assert_eq!(alloc.current(), 0);
        assert_eq!(alloc.next(), 1);
        assert_eq!(alloc.next(), 2);
        assert_eq!(alloc.current(), 2);
    }

    #[test]
    fn test_allocator_reset() {
        let alloc = SeqnoAllocator::new(0);
        alloc.reset_to(100);
        assert_eq!(alloc.next(), 101);
    }

    #[test]
    fn test_allocator_advance() {
        let alloc = SeqnoAllocator::new(5);
        assert!(alloc.advance_to(10));
        assert_eq!(alloc.current(), 10);
        // Equal is a no-op success; behind is a regression.
        assert!(alloc.advance_to(10));
        assert!(!alloc.advance_to(9));
        assert_eq!(alloc.current(), 10);
    }

    #[test]
    fn test_monotonic() {
        let mut m = Monotonic::new(3);
        assert!(m.set(3));
        assert!(m.set(7));
        assert!(!m.set(6));
        assert_eq!(m.get(), 7);
    }

    #[test]
    fn test_atomic_monotonic() {
        let m = AtomicMonotonic::new(0);
        assert!(m.advance_to(4));
        assert!(m.advance_to(4));
        assert!(!m.advance_to(2));
        assert_eq!(m.get(), 4);
    }
}
