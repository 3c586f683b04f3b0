//! Raft log storage
//!
//! Stores:
//! - Log entries keyed by index (big-endian, so iteration is in log order)
//! - Hard state: current term, vote, commit index
//!
//! Every write is synced before returning; callers reply to peers only
//! after the write succeeded.

use crate::common::{Error, Result};
use parking_lot::Mutex;
use rocksdb::{ColumnFamily, IteratorMode, Options, WriteBatch, WriteOptions, DB};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

const CF_LOG: &str = "log";
const CF_META: &str = "meta";
const HARD_STATE_KEY: &[u8] = b"hard_state";

/// A replicated log entry. Empty `data` marks a leader no-op.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: u64,
    pub index: u64,
    pub data: Vec<u8>,
}

/// State that must survive restarts
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardState {
    pub term: u64,
    pub voted_for: Option<String>,
    pub commit_index: u64,
}

pub trait LogStore: Send + Sync {
    fn hard_state(&self) -> Result<HardState>;
    fn save_hard_state(&self, state: &HardState) -> Result<()>;
    /// All entries, in index order
    fn entries(&self) -> Result<Vec<LogEntry>>;
    fn append(&self, entries: &[LogEntry]) -> Result<()>;
    /// Drop every entry with index >= `index`
    fn truncate_from(&self, index: u64) -> Result<()>;
}

/// In-memory log; clones share storage, so a "restarted" node in tests can
/// pick up where the old one stopped.
#[derive(Debug, Clone, Default)]
pub struct MemoryLogStore {
    inner: Arc<Mutex<MemoryLog>>,
}

#[derive(Debug, Default)]
struct MemoryLog {
    hard_state: HardState,
    entries: Vec<LogEntry>,
}

impl MemoryLogStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LogStore for MemoryLogStore {
    fn hard_state(&self) -> Result<HardState> {
        Ok(self.inner.lock().hard_state.clone())
    }

    fn save_hard_state(&self, state: &HardState) -> Result<()> {
        self.inner.lock().hard_state = state.clone();
        Ok(())
    }

    fn entries(&self) -> Result<Vec<LogEntry>> {
        Ok(self.inner.lock().entries.clone())
    }

    fn append(&self, entries: &[LogEntry]) -> Result<()> {
        let mut log = self.inner.lock();
        for entry in entries {
            let expected = log.entries.len() as u64 + 1;
            if entry.index != expected {
                return Err(Error::Raft(format!(
                    "log gap: appending index {} after {}",
                    entry.index,
                    expected - 1
                )));
            }
            log.entries.push(entry.clone());
        }
        Ok(())
    }

    fn truncate_from(&self, index: u64) -> Result<()> {
        let keep = index.saturating_sub(1) as usize;
        self.inner.lock().entries.truncate(keep);
        Ok(())
    }
}

/// RocksDB-backed log in the master's meta folder
pub struct RocksLogStore {
    db: DB,
}

impl RocksLogStore {
    /// Open or create the log store
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let db = DB::open_cf(&opts, path, vec![CF_LOG, CF_META])?;

        Ok(Self { db })
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| Error::MetadataCorrupted(format!("missing column family {}", name)))
    }

    fn synced() -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(true);
        opts
    }
}

impl LogStore for RocksLogStore {
    fn hard_state(&self) -> Result<HardState> {
        match self.db.get_cf(self.cf(CF_META)?, HARD_STATE_KEY)? {
            Some(bytes) => bincode::deserialize(&bytes)
                .map_err(|e| Error::MetadataCorrupted(e.to_string())),
            None => Ok(HardState::default()),
        }
    }

    fn save_hard_state(&self, state: &HardState) -> Result<()> {
        let value = bincode::serialize(state)
            .map_err(|e| Error::Internal(format!("Serialize error: {}", e)))?;
        self.db
            .put_cf_opt(self.cf(CF_META)?, HARD_STATE_KEY, value, &Self::synced())?;
        Ok(())
    }

    fn entries(&self) -> Result<Vec<LogEntry>> {
        let mut entries = Vec::new();
        for item in self.db.iterator_cf(self.cf(CF_LOG)?, IteratorMode::Start) {
            let (_, value) = item?;
            let entry: LogEntry = bincode::deserialize(&value)
                .map_err(|e| Error::MetadataCorrupted(e.to_string()))?;
            if entry.index != entries.len() as u64 + 1 {
                return Err(Error::MetadataCorrupted(format!(
                    "log gap at index {}",
                    entries.len() + 1
                )));
            }
            entries.push(entry);
        }
        Ok(entries)
    }

    fn append(&self, entries: &[LogEntry]) -> Result<()> {
        let cf = self.cf(CF_LOG)?;
        let mut batch = WriteBatch::default();
        for entry in entries {
            let value = bincode::serialize(entry)
                .map_err(|e| Error::Internal(format!("Serialize error: {}", e)))?;
            batch.put_cf(cf, entry.index.to_be_bytes(), value);
        }
        self.db.write_opt(batch, &Self::synced())?;
        Ok(())
    }

    fn truncate_from(&self, index: u64) -> Result<()> {
        let cf = self.cf(CF_LOG)?;
        let mut batch = WriteBatch::default();
        batch.delete_range_cf(cf, index.to_be_bytes(), u64::MAX.to_be_bytes());
        batch.delete_cf(cf, u64::MAX.to_be_bytes());
        self.db.write_opt(batch, &Self::synced())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn entry(index: u64, term: u64) -> LogEntry {
        LogEntry {
            term,
            index,
            data: vec![index as u8],
        }
    }

    fn exercise(store: &dyn LogStore) {
        assert_eq!(store.hard_state().unwrap(), HardState::default());

        store
            .append(&[entry(1, 1), entry(2, 1), entry(3, 2)])
            .unwrap();
        assert_eq!(store.entries().unwrap().len(), 3);

        store.truncate_from(2).unwrap();
        assert_eq!(store.entries().unwrap(), vec![entry(1, 1)]);

        store.append(&[entry(2, 3)]).unwrap();
        assert_eq!(store.entries().unwrap()[1].term, 3);

        let hs = HardState {
            term: 3,
            voted_for: Some("m1:9333".into()),
            commit_index: 2,
        };
        store.save_hard_state(&hs).unwrap();
        assert_eq!(store.hard_state().unwrap(), hs);
    }

    #[test]
    fn test_memory_store() {
        exercise(&MemoryLogStore::new());
    }

    #[test]
    fn test_memory_store_rejects_gap() {
        let store = MemoryLogStore::new();
        assert!(store.append(&[entry(2, 1)]).is_err());
    }

    #[test]
    fn test_rocks_store() {
        let dir = tempdir().unwrap();
        let store = RocksLogStore::open(dir.path().join("raft")).unwrap();
        exercise(&store);
    }

    #[test]
    fn test_rocks_store_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("raft");
        {
            let store = RocksLogStore::open(&path).unwrap();
            store.append(&[entry(1, 1), entry(2, 1)]).unwrap();
            store
                .save_hard_state(&HardState {
                    term: 1,
                    voted_for: None,
                    commit_index: 2,
                })
                .unwrap();
        }
        let store = RocksLogStore::open(&path).unwrap();
        assert_eq!(store.entries().unwrap().len(), 2);
        assert_eq!(store.hard_state().unwrap().commit_index, 2);
    }
}
