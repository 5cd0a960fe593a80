//! Raft log, storage and persistence behaviour through the public API.

#[allow(dead_code)]
mod common;

use pinhive::raft::{LogEntry, PersistentState, RaftLog, RaftStorage};
use tempfile::tempdir;

// =============================================================================
// Log behaviour
// =============================================================================

#[test]
fn test_log_append_and_bounds() {
    let mut log = RaftLog::new();
    assert!(log.is_empty());
    assert_eq!(log.first_index(), 1);

    for i in 1..=5 {
        log.append(LogEntry::new(1, i, vec![i as u8])).unwrap();
    }
    assert_eq!(log.last_index(), 5);
    assert_eq!(log.len(), 5);
    assert_eq!(log.get(3).unwrap().command_bytes(), &[3]);
}

#[test]
fn test_log_conflict_truncation() {
    let mut log = RaftLog::new();
    for i in 1..=4 {
        log.append(LogEntry::new(1, i, vec![])).unwrap();
    }

    // A leader overwrites a divergent suffix.
    log.truncate_from(3);
    assert_eq!(log.last_index(), 2);
    log.append(LogEntry::new(2, 3, vec![9])).unwrap();
    assert_eq!(log.term_at(3), Some(2));
}

#[test]
fn test_log_compaction_preserves_consistency_checks() {
    let mut log = RaftLog::new();
    for i in 1..=6 {
        log.append(LogEntry::new(2, i, vec![])).unwrap();
    }
    log.compact(4, 2);

    assert_eq!(log.first_index(), 5);
    // The boundary entry's term survives for AppendEntries checks.
    assert!(log.matches(4, 2));
    assert!(!log.matches(4, 1));
    assert_eq!(log.entries_from(1).len(), 2);
}

// =============================================================================
// Persistent storage
// =============================================================================

#[test]
fn test_storage_survives_reopen() {
    let dir = tempdir().unwrap();

    {
        let storage = RaftStorage::open(dir.path()).unwrap();
        storage
            .save_persistent_state(&PersistentState {
                current_term: 4,
                voted_for: Some(2),
            })
            .unwrap();
        storage
            .append_log_entries(&[
                LogEntry::new(3, 1, vec![1]),
                LogEntry::new(4, 2, vec![2]),
            ])
            .unwrap();
        storage.save_snapshot(b"snapshot-bytes", 1, 3).unwrap();
    }

    let storage = RaftStorage::open(dir.path()).unwrap();
    let persistent = storage.load_persistent_state().unwrap().unwrap();
    assert_eq!(persistent.current_term, 4);
    assert_eq!(persistent.voted_for, Some(2));

    let entries = storage.load_log_entries_from(1).unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[1].command_bytes(), &[2]);

    let (snapshot, meta) = storage.load_snapshot().unwrap().unwrap();
    assert_eq!(snapshot, b"snapshot-bytes");
    assert_eq!(meta.last_index, 1);
}

#[test]
fn test_storage_compaction_drops_prefix_only() {
    let dir = tempdir().unwrap();
    let storage = RaftStorage::open(dir.path()).unwrap();

    let entries: Vec<_> = (1..=6).map(|i| LogEntry::new(1, i, vec![i as u8])).collect();
    storage.append_log_entries(&entries).unwrap();

    storage.compact_log(4).unwrap();
    assert_eq!(storage.log_bounds().unwrap(), Some((5, 6)));
    assert!(storage.load_log_entry(4).unwrap().is_none());
    assert!(storage.load_log_entry(5).unwrap().is_some());
}

#[test]
fn test_storage_destroy_log_for_eviction() {
    let dir = tempdir().unwrap();
    let storage = RaftStorage::open(dir.path()).unwrap();

    storage
        .append_log_entries(&[LogEntry::new(1, 1, vec![])])
        .unwrap();
    storage
        .save_persistent_state(&PersistentState {
            current_term: 2,
            voted_for: Some(1),
        })
        .unwrap();
    storage.save_snapshot(b"final", 1, 1).unwrap();

    storage.destroy_log().unwrap();

    // Membership history is gone, the pin-set snapshot is not.
    assert!(storage.log_bounds().unwrap().is_none());
    assert!(storage.load_persistent_state().unwrap().is_none());
    assert_eq!(storage.load_snapshot().unwrap().unwrap().0, b"final");
}
