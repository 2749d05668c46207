//! Per-vBucket failover tables.
//!
//! A failover table records the points at which a vBucket's history may
//! have diverged: each entry pairs a random non-zero UUID with the seqno
//! at which that history began. Replication streams present the newest
//! entry to decide whether they may resume or must roll back.
//!
//! Warmup appends a fresh entry after an unclean shutdown so that peers
//! which streamed un-persisted mutations from the previous incarnation
//! are forced to reconcile.

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::status::Status;

/// One failover history entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailoverEntry {
    /// Random non-zero identifier of this history branch
    pub vb_uuid: u64,
    /// Seqno at which the branch began
    pub by_seqno: u64,
}

/// A bounded, newest-first list of failover entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailoverTable {
    entries: Vec<FailoverEntry>,
    max_entries: usize,
}

impl FailoverTable {
    /// Create a table with a single fresh entry at seqno 0.
    pub fn new(max_entries: usize) -> Self {
        let mut table = Self {
            entries: Vec::new(),
            max_entries: max_entries.max(1),
        };
        table.create_entry(0);
        table
    }

    /// Rebuild a table from persisted entries (newest first). An empty
    /// list yields a fresh table.
    pub fn from_entries(entries: Vec<FailoverEntry>, max_entries: usize) -> Self {
        if entries.is_empty() {
            return Self::new(max_entries);
        }
        let mut table = Self {
            entries,
            max_entries: max_entries.max(1),
        };
        table.trim();
        table
    }

    /// Parse the JSON form stored in the persisted vBucket state.
    pub fn from_json(raw: &str, max_entries: usize) -> Result<Self, Status> {
        if raw.is_empty() {
            return Ok(Self::new(max_entries));
        }
        let entries: Vec<FailoverEntry> =
            serde_json::from_str(raw).map_err(|_| Status::Corruption)?;
        Ok(Self::from_entries(entries, max_entries))
    }

    /// Serialize to the JSON form stored in the persisted vBucket state.
    pub fn to_json(&self) -> String {
        serde_json::to_string(&self.entries).unwrap_or_else(|_| "[]".to_string())
    }

    /// Append a new history branch starting at `seqno`. Entries claiming
    /// a start beyond `seqno` are erased first; they described history
    /// that no longer exists.
    pub fn create_entry(&mut self, seqno: u64) {
        self.entries.retain(|entry| entry.by_seqno <= seqno);
        self.entries.insert(
            0,
            FailoverEntry {
                vb_uuid: random_uuid(),
                by_seqno: seqno,
            },
        );
        self.trim();
    }

    fn trim(&mut self) {
        self.entries.truncate(self.max_entries);
    }

    /// The newest entry.
    pub fn latest_entry(&self) -> FailoverEntry {
        self.entries[0]
    }

    /// All entries, newest first.
    pub fn entries(&self) -> &[FailoverEntry] {
        &self.entries
    }

    /// Number of entries held.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table is empty. Never true in practice; tables are
    /// created with an initial entry.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn random_uuid() -> u64 {
    let mut rng = rand::thread_rng();
    loop {
        let uuid: u64 = rng.gen();
        if uuid != 0 {
            return uuid;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_table_has_initial_entry() {
        let table = FailoverTable::new(5);
        assert_eq!(table.len(), 1);
        let entry = table.latest_entry();
        assert_ne!(entry.vb_uuid, 0);
        assert_eq!(entry.by_seqno, 0);
    }

    #[test]
    fn test_create_entry_prepends() {
        let mut table = FailoverTable::new(5);
        table.create_entry(10);
        table.create_entry(20);
        assert_eq!(table.len(), 3);
        assert_eq!(table.latest_entry().by_seqno, 20);
        assert_eq!(table.entries()[1].by_seqno, 10);
    }

    #[test]
    fn test_create_entry_erases_future_history() {
        let mut table = FailoverTable::new(5);
        table.create_entry(10);
        table.create_entry(20);
        // A new branch at 15 invalidates the entry claiming 20.
        table.create_entry(15);
        let seqnos: Vec<u64> = table.entries().iter().map(|e| e.by_seqno).collect();
        assert_eq!(seqnos, vec![15, 10, 0]);
    }

    #[test]
    fn test_bounded() {
        let mut table = FailoverTable::new(3);
        for seqno in 1..10 {
            table.create_entry(seqno);
        }
        assert_eq!(table.len(), 3);
        assert_eq!(table.latest_entry().by_seqno, 9);
    }

    #[test]
    fn test_json_round_trip() {
        let mut table = FailoverTable::new(4);
        table.create_entry(100);
        let json = table.to_json();
        let rebuilt = FailoverTable::from_json(&json, 4).unwrap();
        assert_eq!(rebuilt.entries(), table.entries());
    }

    #[test]
    fn test_from_json_empty_string() {
        let table = FailoverTable::from_json("", 4).unwrap();
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_from_json_corrupt() {
        assert_eq!(
            FailoverTable::from_json("{oops", 4).map(|_| ()),
            Err(Status::Corruption)
        );
    }

    #[test]
    fn test_from_entries_empty_gets_fresh() {
        let table = FailoverTable::from_entries(Vec::new(), 4);
        assert_eq!(table.len(), 1);
        assert!(!table.is_empty());
    }
}
