//! # log
//!
//! why: manage the append-only operation log every node owns
//! relations: written by replica.rs, read by commit.rs and link.rs, persisted via repl-storage
//! what: LogEntry struct, LogStore contract, MemoryLog implementation

use serde::{Deserialize, Serialize};

use crate::error::ReplError;

/// A single entry in the replicated log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// The term of the primary that appended this entry
    pub term: u64,
    /// The index of this entry in the log (1-indexed)
    pub index: u64,
    /// Opaque client operation
    pub payload: Vec<u8>,
}

impl LogEntry {
    /// Create a new log entry
    pub fn new(term: u64, index: u64, payload: Vec<u8>) -> Self {
        Self { term, index, payload }
    }

    /// `(term, index)` uniquely identifies an entry
    pub fn id(&self) -> (u64, u64) {
        (self.term, self.index)
    }
}

/// The contract between the replication core and a node's log storage.
///
/// Entries are contiguous from index 1 and their terms never decrease.
/// `durable_position() <= last_index()` always holds.
pub trait LogStore {
    /// Append `entry`, which must sit at `last_index() + 1`.
    /// The new entry is not durable until [`LogStore::mark_durable`] covers it.
    fn append(&mut self, entry: LogEntry) -> Result<u64, ReplError>;

    /// Record that storage has flushed through `index`.
    ///
    /// Marks below the current durable position are a no-op returning
    /// `Ok(false)`; marks past the end of the log fail with `OutOfRange`.
    fn mark_durable(&mut self, index: u64) -> Result<bool, ReplError>;

    /// Discard every entry after `index` and return them.
    ///
    /// Fails with `OutOfRange` if that would discard durable entries.
    fn truncate_after(&mut self, index: u64) -> Result<Vec<LogEntry>, ReplError>;

    fn entry(&self, index: u64) -> Option<&LogEntry>;

    /// Entries from `index` (inclusive) to the end; empty past the end.
    fn entries_from(&self, index: u64) -> &[LogEntry];

    fn last_index(&self) -> u64;

    fn durable_position(&self) -> u64;

    /// Term of the entry at `index`; index 0 is the empty prefix with term 0.
    fn term_at(&self, index: u64) -> Option<u64> {
        if index == 0 {
            return Some(0);
        }
        self.entry(index).map(|e| e.term)
    }

    fn last_term(&self) -> u64 {
        self.term_at(self.last_index()).unwrap_or(0)
    }
}

impl<T: LogStore + ?Sized> LogStore for Box<T> {
    fn append(&mut self, entry: LogEntry) -> Result<u64, ReplError> {
        (**self).append(entry)
    }

    fn mark_durable(&mut self, index: u64) -> Result<bool, ReplError> {
        (**self).mark_durable(index)
    }

    fn truncate_after(&mut self, index: u64) -> Result<Vec<LogEntry>, ReplError> {
        (**self).truncate_after(index)
    }

    fn entry(&self, index: u64) -> Option<&LogEntry> {
        (**self).entry(index)
    }

    fn entries_from(&self, index: u64) -> &[LogEntry] {
        (**self).entries_from(index)
    }

    fn last_index(&self) -> u64 {
        (**self).last_index()
    }

    fn durable_position(&self) -> u64 {
        (**self).durable_position()
    }
}

// -- in-memory log --

/// Volatile log: durability is whatever the caller says it is.
#[derive(Debug, Clone, Default)]
pub struct MemoryLog {
    entries: Vec<LogEntry>,
    durable_position: u64,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a log from entries already on stable storage.
    /// Every recovered entry is durable.
    pub fn recover(entries: Vec<LogEntry>) -> Result<Self, ReplError> {
        let mut log = Self::new();
        for entry in entries {
            log.append(entry)?;
        }
        log.durable_position = log.last_index();
        Ok(log)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }
}

impl LogStore for MemoryLog {
    fn append(&mut self, entry: LogEntry) -> Result<u64, ReplError> {
        let expected = self.last_index() + 1;
        if entry.index != expected {
            return Err(ReplError::SequenceViolation { expected, got: entry.index });
        }
        let last_term = self.last_term();
        if entry.term < last_term {
            return Err(ReplError::TermRegression {
                index: entry.index,
                term: entry.term,
                last_term,
            });
        }
        self.entries.push(entry);
        Ok(expected)
    }

    fn mark_durable(&mut self, index: u64) -> Result<bool, ReplError> {
        let last = self.last_index();
        if index > last {
            return Err(ReplError::OutOfRange { index, low: self.durable_position, high: last });
        }
        if index <= self.durable_position {
            return Ok(false);
        }
        self.durable_position = index;
        Ok(true)
    }

    fn truncate_after(&mut self, index: u64) -> Result<Vec<LogEntry>, ReplError> {
        if index < self.durable_position {
            return Err(ReplError::OutOfRange {
                index,
                low: self.durable_position,
                high: self.last_index(),
            });
        }
        if index >= self.last_index() {
            return Ok(Vec::new());
        }
        Ok(self.entries.split_off(index as usize))
    }

    fn entry(&self, index: u64) -> Option<&LogEntry> {
        if index == 0 {
            return None;
        }
        self.entries.get(index as usize - 1)
    }

    fn entries_from(&self, index: u64) -> &[LogEntry] {
        let start = index.max(1) as usize - 1;
        self.entries.get(start..).unwrap_or(&[])
    }

    fn last_index(&self) -> u64 {
        self.entries.len() as u64
    }

    fn durable_position(&self) -> u64 {
        self.durable_position
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log_with_terms(terms: &[u64]) -> MemoryLog {
        let mut log = MemoryLog::new();
        for (i, term) in terms.iter().enumerate() {
            log.append(LogEntry::new(*term, i as u64 + 1, vec![i as u8])).unwrap();
        }
        log
    }

    #[test]
    fn append_assigns_contiguous_indexes() {
        let log = log_with_terms(&[1, 1, 2]);
        assert_eq!(log.last_index(), 3);
        assert_eq!(log.last_term(), 2);
        assert_eq!(log.durable_position(), 0);
    }

    #[test]
    fn append_rejects_gap() {
        let mut log = log_with_terms(&[1]);
        let err = log.append(LogEntry::new(1, 3, vec![])).unwrap_err();
        assert_eq!(err, ReplError::SequenceViolation { expected: 2, got: 3 });
        assert_eq!(log.last_index(), 1);
    }

    #[test]
    fn append_rejects_lower_term() {
        let mut log = log_with_terms(&[2]);
        let err = log.append(LogEntry::new(1, 2, vec![])).unwrap_err();
        assert!(matches!(err, ReplError::TermRegression { index: 2, .. }));
    }

    #[test]
    fn mark_durable_below_position_is_noop() {
        let mut log = log_with_terms(&[1, 1, 1]);
        assert!(log.mark_durable(2).unwrap());
        assert!(!log.mark_durable(1).unwrap());
        assert_eq!(log.durable_position(), 2);
    }

    #[test]
    fn mark_durable_past_end_fails() {
        let mut log = log_with_terms(&[1]);
        assert!(matches!(log.mark_durable(2), Err(ReplError::OutOfRange { index: 2, .. })));
    }

    #[test]
    fn truncate_keeps_durable_prefix() {
        let mut log = log_with_terms(&[1, 1, 2, 2]);
        log.mark_durable(2).unwrap();
        let removed = log.truncate_after(2).unwrap();
        assert_eq!(removed.len(), 2);
        assert_eq!(log.last_index(), 2);
        assert!(log.truncate_after(1).is_err());
    }

    #[test]
    fn entries_from_past_end_is_empty() {
        let log = log_with_terms(&[1, 1]);
        assert_eq!(log.entries_from(1).len(), 2);
        assert!(log.entries_from(3).is_empty());
    }

    #[test]
    fn recover_marks_everything_durable() {
        let entries = vec![LogEntry::new(1, 1, vec![]), LogEntry::new(1, 2, vec![])];
        let log = MemoryLog::recover(entries).unwrap();
        assert_eq!(log.durable_position(), 2);
    }
}
