//! Persistent Raft storage on rocksdb.
//!
//! The consensus data folder holds the durable log, the term/vote record
//! and the latest state snapshot. One process owns the folder at a time.

use super::{LogEntry, PersistentState};
use crate::error::{PinhiveError, Result};
use crate::types::{LogIndex, Term};
use rocksdb::{Options, DB};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const PERSISTENT_STATE_KEY: &[u8] = b"raft_persistent_state";
const LOG_PREFIX: &[u8] = b"raft_log_";
const SNAPSHOT_KEY: &[u8] = b"raft_snapshot";
const SNAPSHOT_META_KEY: &[u8] = b"raft_snapshot_meta";

/// Metadata describing the log position a snapshot covers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub last_index: LogIndex,
    pub last_term: Term,
}

/// Durable storage for Raft state under the consensus data folder.
pub struct RaftStorage {
    db: DB,
    path: PathBuf,
}

impl RaftStorage {
    /// Open or create storage at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);

        let db = DB::open(&opts, path.as_ref())?;
        Ok(Self {
            db,
            path: path.as_ref().to_path_buf(),
        })
    }

    pub fn load_persistent_state(&self) -> Result<Option<PersistentState>> {
        match self.db.get(PERSISTENT_STATE_KEY)? {
            Some(data) => Ok(Some(bincode::deserialize(&data)?)),
            None => Ok(None),
        }
    }

    pub fn save_persistent_state(&self, state: &PersistentState) -> Result<()> {
        let data = bincode::serialize(state)?;
        self.db.put(PERSISTENT_STATE_KEY, data)?;
        self.db.flush()?;
        Ok(())
    }

    pub fn append_log_entries(&self, entries: &[LogEntry]) -> Result<()> {
        let mut batch = rocksdb::WriteBatch::default();
        for entry in entries {
            batch.put(log_key(entry.index), bincode::serialize(entry)?);
        }
        self.db.write(batch)?;
        Ok(())
    }

    pub fn load_log_entry(&self, index: LogIndex) -> Result<Option<LogEntry>> {
        match self.db.get(log_key(index))? {
            Some(data) => Ok(Some(bincode::deserialize(&data)?)),
            None => Ok(None),
        }
    }

    /// All stored entries from `start_index` onward, in order.
    pub fn load_log_entries_from(&self, start_index: LogIndex) -> Result<Vec<LogEntry>> {
        let mut entries = Vec::new();
        let start_key = log_key(start_index);
        let iter = self.db.iterator(rocksdb::IteratorMode::From(
            &start_key,
            rocksdb::Direction::Forward,
        ));

        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(LOG_PREFIX) {
                break;
            }
            entries.push(bincode::deserialize(&value)?);
        }
        Ok(entries)
    }

    /// Delete entries from `from_index` (inclusive) onward.
    pub fn truncate_log_from(&self, from_index: LogIndex) -> Result<()> {
        let mut batch = rocksdb::WriteBatch::default();
        let start_key = log_key(from_index);
        let iter = self.db.iterator(rocksdb::IteratorMode::From(
            &start_key,
            rocksdb::Direction::Forward,
        ));

        for item in iter {
            let (key, _) = item?;
            if !key.starts_with(LOG_PREFIX) {
                break;
            }
            batch.delete(&key);
        }
        self.db.write(batch)?;
        Ok(())
    }

    pub fn save_snapshot(&self, data: &[u8], last_index: LogIndex, last_term: Term) -> Result<()> {
        let meta = SnapshotMeta {
            last_index,
            last_term,
        };
        let mut batch = rocksdb::WriteBatch::default();
        batch.put(SNAPSHOT_KEY, data);
        batch.put(SNAPSHOT_META_KEY, bincode::serialize(&meta)?);
        self.db.write(batch)?;
        self.db.flush()?;
        Ok(())
    }

    pub fn load_snapshot(&self) -> Result<Option<(Vec<u8>, SnapshotMeta)>> {
        let meta_data = match self.db.get(SNAPSHOT_META_KEY)? {
            Some(d) => d,
            None => return Ok(None),
        };
        let snapshot_data = match self.db.get(SNAPSHOT_KEY)? {
            Some(d) => d,
            None => return Ok(None),
        };
        let meta: SnapshotMeta = bincode::deserialize(&meta_data)?;
        Ok(Some((snapshot_data.to_vec(), meta)))
    }

    /// Delete entries up to `up_to_index` (inclusive) after a snapshot.
    pub fn compact_log(&self, up_to_index: LogIndex) -> Result<()> {
        let mut batch = rocksdb::WriteBatch::default();
        let start_key = log_key(1);
        let end_key = log_key(up_to_index + 1);
        let iter = self.db.iterator(rocksdb::IteratorMode::From(
            &start_key,
            rocksdb::Direction::Forward,
        ));

        for item in iter {
            let (key, _) = item?;
            if key.as_ref() >= end_key.as_slice() || !key.starts_with(LOG_PREFIX) {
                break;
            }
            batch.delete(&key);
        }
        self.db.write(batch)?;
        Ok(())
    }

    /// Wipe the log and the term/vote record, keeping any snapshot.
    ///
    /// Used when the local peer is evicted from the cluster: the membership
    /// history in the log would confuse a later restart, while the snapshot
    /// still describes the pin set.
    pub fn destroy_log(&self) -> Result<()> {
        self.truncate_log_from(1)?;
        self.db.delete(PERSISTENT_STATE_KEY)?;
        self.db.flush()?;
        Ok(())
    }

    /// First and last stored log indices, when any.
    pub fn log_bounds(&self) -> Result<Option<(LogIndex, LogIndex)>> {
        let mut first = None;
        let mut last = None;
        let iter = self.db.iterator(rocksdb::IteratorMode::From(
            LOG_PREFIX,
            rocksdb::Direction::Forward,
        ));

        for item in iter {
            let (key, _) = item?;
            if !key.starts_with(LOG_PREFIX) {
                break;
            }
            let index = parse_log_key(&key)?;
            first.get_or_insert(index);
            last = Some(index);
        }
        Ok(first.zip(last))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn log_key(index: LogIndex) -> Vec<u8> {
    let mut key = LOG_PREFIX.to_vec();
    key.extend_from_slice(&index.to_be_bytes());
    key
}

fn parse_log_key(key: &[u8]) -> Result<LogIndex> {
    let bytes: [u8; 8] = key
        .get(LOG_PREFIX.len()..)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| PinhiveError::Storage("invalid log key".into()))?;
    Ok(LogIndex::from_be_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_persistent_state_roundtrip() {
        let dir = tempdir().unwrap();
        let storage = RaftStorage::open(dir.path()).unwrap();

        assert!(storage.load_persistent_state().unwrap().is_none());

        storage
            .save_persistent_state(&PersistentState {
                current_term: 7,
                voted_for: Some(2),
            })
            .unwrap();

        let loaded = storage.load_persistent_state().unwrap().unwrap();
        assert_eq!(loaded.current_term, 7);
        assert_eq!(loaded.voted_for, Some(2));
    }

    #[test]
    fn test_log_entries() {
        let dir = tempdir().unwrap();
        let storage = RaftStorage::open(dir.path()).unwrap();

        let entries = vec![
            LogEntry::new(1, 1, vec![1]),
            LogEntry::new(1, 2, vec![2]),
            LogEntry::new(2, 3, vec![3]),
        ];
        storage.append_log_entries(&entries).unwrap();

        let entry = storage.load_log_entry(2).unwrap().unwrap();
        assert_eq!(entry.command_bytes(), &[2]);

        assert_eq!(storage.load_log_entries_from(1).unwrap().len(), 3);
        assert_eq!(storage.load_log_entries_from(3).unwrap().len(), 1);
        assert_eq!(storage.log_bounds().unwrap(), Some((1, 3)));
    }

    #[test]
    fn test_truncate_and_compact() {
        let dir = tempdir().unwrap();
        let storage = RaftStorage::open(dir.path()).unwrap();

        let entries: Vec<_> = (1..=5).map(|i| LogEntry::new(1, i, vec![i as u8])).collect();
        storage.append_log_entries(&entries).unwrap();

        storage.truncate_log_from(4).unwrap();
        assert_eq!(storage.log_bounds().unwrap(), Some((1, 3)));

        storage.compact_log(2).unwrap();
        assert_eq!(storage.log_bounds().unwrap(), Some((3, 3)));
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let dir = tempdir().unwrap();
        let storage = RaftStorage::open(dir.path()).unwrap();

        storage.save_snapshot(b"pin set", 10, 3).unwrap();
        let (data, meta) = storage.load_snapshot().unwrap().unwrap();
        assert_eq!(data, b"pin set");
        assert_eq!(meta.last_index, 10);
        assert_eq!(meta.last_term, 3);
    }

    #[test]
    fn test_destroy_log_keeps_snapshot() {
        let dir = tempdir().unwrap();
        let storage = RaftStorage::open(dir.path()).unwrap();

        storage
            .append_log_entries(&[LogEntry::new(1, 1, vec![1])])
            .unwrap();
        storage
            .save_persistent_state(&PersistentState {
                current_term: 3,
                voted_for: Some(1),
            })
            .unwrap();
        storage.save_snapshot(b"snap", 1, 1).unwrap();

        storage.destroy_log().unwrap();

        assert!(storage.log_bounds().unwrap().is_none());
        assert!(storage.load_persistent_state().unwrap().is_none());
        assert!(storage.load_snapshot().unwrap().is_some());
    }
}
