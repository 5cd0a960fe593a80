//! In-memory Raft log.

use crate::error::{PinhiveError, Result};
use crate::types::{LogIndex, Term};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;

/// A single entry in the Raft log.
///
/// The command bytes are Arc-wrapped so cloning entries during replication
/// fan-out does not copy payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    /// Term in which the entry was created.
    pub term: Term,
    /// Position of this entry in the log.
    pub index: LogIndex,
    /// Serialised command for the state machine.
    #[serde(with = "arc_bytes")]
    pub command: Arc<Vec<u8>>,
}

impl LogEntry {
    pub fn new(term: Term, index: LogIndex, command: Vec<u8>) -> Self {
        Self {
            term,
            index,
            command: Arc::new(command),
        }
    }

    #[inline]
    pub fn command_bytes(&self) -> &[u8] {
        &self.command
    }
}

/// Serde helper for `Arc<Vec<u8>>`: raw bytes on the wire, Arc-wrapped in
/// memory.
mod arc_bytes {
    use serde::{Deserializer, Serializer};
    use std::sync::Arc;

    pub fn serialize<S>(data: &Arc<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serde_bytes::serialize(data.as_slice(), serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Arc<Vec<u8>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let bytes: Vec<u8> = serde_bytes::deserialize(deserializer)?;
        Ok(Arc::new(bytes))
    }
}

/// The in-memory log. Persistence lives in [`super::RaftStorage`]; the
/// prefix before `first_index` has been folded into a snapshot.
#[derive(Debug, Default)]
pub struct RaftLog {
    entries: VecDeque<LogEntry>,
    /// Index of the first retained entry.
    first_index: LogIndex,
    /// Term of the entry at `first_index - 1`, needed for the AppendEntries
    /// consistency check right after compaction.
    snapshot_term: Term,
}

impl RaftLog {
    pub fn new() -> Self {
        Self {
            entries: VecDeque::new(),
            first_index: 1,
            snapshot_term: 0,
        }
    }

    pub fn first_index(&self) -> LogIndex {
        self.first_index
    }

    pub fn last_index(&self) -> LogIndex {
        if self.entries.is_empty() {
            self.first_index.saturating_sub(1)
        } else {
            self.first_index + self.entries.len() as u64 - 1
        }
    }

    pub fn last_term(&self) -> Term {
        self.entries
            .back()
            .map(|e| e.term)
            .unwrap_or(self.snapshot_term)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append an entry. The index must continue the log.
    pub fn append(&mut self, entry: LogEntry) -> Result<()> {
        let expected = self.last_index() + 1;
        if entry.index != expected {
            return Err(PinhiveError::RaftLog(format!(
                "expected index {expected}, got {}",
                entry.index
            )));
        }
        self.entries.push_back(entry);
        Ok(())
    }

    pub fn get(&self, index: LogIndex) -> Option<&LogEntry> {
        if index < self.first_index || index > self.last_index() {
            return None;
        }
        self.entries.get((index - self.first_index) as usize)
    }

    /// Term at an index, covering the snapshot boundary.
    pub fn term_at(&self, index: LogIndex) -> Option<Term> {
        if index == 0 {
            return Some(0);
        }
        if index == self.first_index - 1 {
            return Some(self.snapshot_term);
        }
        self.get(index).map(|e| e.term)
    }

    /// Entries from `start_index` to the end.
    pub fn entries_from(&self, start_index: LogIndex) -> Vec<LogEntry> {
        if start_index > self.last_index() {
            return Vec::new();
        }
        let start = start_index.max(self.first_index);
        let offset = (start - self.first_index) as usize;
        self.entries.iter().skip(offset).cloned().collect()
    }

    /// At most `limit` entries from `start_index`.
    pub fn entries_from_limit(&self, start_index: LogIndex, limit: usize) -> Vec<LogEntry> {
        let mut entries = self.entries_from(start_index);
        entries.truncate(limit);
        entries
    }

    /// Entries in the inclusive range `[start, end]`.
    pub fn entries_range(&self, start: LogIndex, end: LogIndex) -> Vec<LogEntry> {
        self.entries_from(start)
            .into_iter()
            .take_while(|e| e.index <= end)
            .collect()
    }

    /// Drop entries from `index` (inclusive) onward. Used when the leader
    /// sends conflicting entries.
    pub fn truncate_from(&mut self, index: LogIndex) {
        if index < self.first_index {
            self.entries.clear();
            return;
        }
        self.entries.truncate((index - self.first_index) as usize);
    }

    /// Consistency check against the leader's view.
    pub fn matches(&self, prev_log_index: LogIndex, prev_log_term: Term) -> bool {
        if prev_log_index == 0 {
            return true;
        }
        self.term_at(prev_log_index) == Some(prev_log_term)
    }

    /// Fold entries up to `up_to_index` into a snapshot boundary.
    pub fn compact(&mut self, up_to_index: LogIndex, snapshot_term: Term) {
        if up_to_index < self.first_index {
            return;
        }
        let drop = ((up_to_index - self.first_index + 1) as usize).min(self.entries.len());
        for _ in 0..drop {
            self.entries.pop_front();
        }
        self.first_index = up_to_index + 1;
        self.snapshot_term = snapshot_term;
    }

    /// Election rule: is a candidate with this last entry at least as
    /// up-to-date as we are?
    pub fn is_up_to_date(&self, last_log_index: LogIndex, last_log_term: Term) -> bool {
        if last_log_term != self.last_term() {
            last_log_term > self.last_term()
        } else {
            last_log_index >= self.last_index()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_log() {
        let log = RaftLog::new();
        assert!(log.is_empty());
        assert_eq!(log.first_index(), 1);
        assert_eq!(log.last_index(), 0);
        assert_eq!(log.last_term(), 0);
    }

    #[test]
    fn test_append_and_get() {
        let mut log = RaftLog::new();
        log.append(LogEntry::new(1, 1, vec![1])).unwrap();
        log.append(LogEntry::new(1, 2, vec![2])).unwrap();
        log.append(LogEntry::new(2, 3, vec![3])).unwrap();

        assert_eq!(log.len(), 3);
        assert_eq!(log.last_index(), 3);
        assert_eq!(log.last_term(), 2);
        assert_eq!(log.get(2).unwrap().command_bytes(), &[2]);
        assert!(log.get(0).is_none());
        assert!(log.get(4).is_none());
    }

    #[test]
    fn test_append_rejects_gaps() {
        let mut log = RaftLog::new();
        log.append(LogEntry::new(1, 1, vec![])).unwrap();
        assert!(log.append(LogEntry::new(1, 3, vec![])).is_err());
    }

    #[test]
    fn test_truncate_from() {
        let mut log = RaftLog::new();
        for i in 1..=4 {
            log.append(LogEntry::new(1, i, vec![i as u8])).unwrap();
        }
        log.truncate_from(3);
        assert_eq!(log.last_index(), 2);
        assert!(log.get(3).is_none());
    }

    #[test]
    fn test_matches() {
        let mut log = RaftLog::new();
        log.append(LogEntry::new(1, 1, vec![])).unwrap();
        log.append(LogEntry::new(2, 2, vec![])).unwrap();

        assert!(log.matches(0, 0));
        assert!(log.matches(2, 2));
        assert!(!log.matches(2, 1));
        assert!(!log.matches(3, 2));
    }

    #[test]
    fn test_compact_keeps_boundary_term() {
        let mut log = RaftLog::new();
        for i in 1..=4 {
            log.append(LogEntry::new(if i < 3 { 1 } else { 2 }, i, vec![]))
                .unwrap();
        }
        log.compact(2, 1);

        assert_eq!(log.first_index(), 3);
        assert_eq!(log.len(), 2);
        assert_eq!(log.term_at(2), Some(1));
        assert!(log.matches(2, 1));
        assert!(log.get(2).is_none());
    }

    #[test]
    fn test_is_up_to_date() {
        let mut log = RaftLog::new();
        log.append(LogEntry::new(1, 1, vec![])).unwrap();
        log.append(LogEntry::new(2, 2, vec![])).unwrap();

        assert!(log.is_up_to_date(1, 3)); // higher term wins
        assert!(log.is_up_to_date(3, 2)); // same term, longer log
        assert!(log.is_up_to_date(2, 2)); // identical
        assert!(!log.is_up_to_date(5, 1)); // lower term loses
    }

    #[test]
    fn test_entries_from_limit() {
        let mut log = RaftLog::new();
        for i in 1..=5 {
            log.append(LogEntry::new(1, i, vec![i as u8])).unwrap();
        }
        let entries = log.entries_from_limit(2, 2);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].index, 2);
        assert_eq!(entries[1].index, 3);
    }
}
