//! Durable storage contracts consumed by the Raft core, plus in-memory
//! implementations used by tests and embedders.
//!
//! The core serializes writes by contract: log appends flow through the
//! role loop, term/vote writes through the stable-store facade. Reads may
//! happen concurrently from replicators and RPC handlers, so
//! implementations must tolerate concurrent readers.

use crate::error::{RaftError, Result};
use crate::types::{LogEntry, LogIndex};
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};

/// Durable, monotonically indexed log storage.
pub trait LogStore: Send + Sync + 'static {
    /// Index of the oldest entry present, `0` when empty.
    fn first_index(&self) -> Result<LogIndex>;

    /// Index of the newest entry present, `0` when empty.
    fn last_index(&self) -> Result<LogIndex>;

    /// Fetch a single entry; `NotFound` if absent.
    fn get_log(&self, index: LogIndex) -> Result<LogEntry>;

    /// Durably store a single entry.
    fn store_log(&self, entry: &LogEntry) -> Result<()>;

    /// Durably store a batch of entries.
    fn store_logs(&self, entries: &[LogEntry]) -> Result<()>;

    /// Delete all entries in `[min, max]` (inclusive). Used both for
    /// conflict truncation and snapshot compaction.
    fn delete_range(&self, min: LogIndex, max: LogIndex) -> Result<()>;
}

/// Durable key/value storage for term and vote metadata.
///
/// Absence is reported as [`RaftError::NotFound`]; callers tolerate it as
/// a default.
pub trait StableStore: Send + Sync + 'static {
    fn set(&self, key: &[u8], val: &[u8]) -> Result<()>;

    fn get(&self, key: &[u8]) -> Result<Bytes>;

    fn set_u64(&self, key: &[u8], val: u64) -> Result<()>;

    fn get_u64(&self, key: &[u8]) -> Result<u64>;
}

/// In-memory [`LogStore`] backed by a `BTreeMap`.
#[derive(Default)]
pub struct MemLogStore {
    entries: RwLock<BTreeMap<u64, LogEntry>>,
}

impl MemLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries currently held (test helper).
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl LogStore for MemLogStore {
    fn first_index(&self) -> Result<LogIndex> {
        let entries = self.entries.read();
        Ok(entries
            .keys()
            .next()
            .copied()
            .map(LogIndex)
            .unwrap_or(LogIndex::ZERO))
    }

    fn last_index(&self) -> Result<LogIndex> {
        let entries = self.entries.read();
        Ok(entries
            .keys()
            .next_back()
            .copied()
            .map(LogIndex)
            .unwrap_or(LogIndex::ZERO))
    }

    fn get_log(&self, index: LogIndex) -> Result<LogEntry> {
        let entries = self.entries.read();
        entries.get(&index.0).cloned().ok_or(RaftError::NotFound)
    }

    fn store_log(&self, entry: &LogEntry) -> Result<()> {
        self.entries.write().insert(entry.index.0, entry.clone());
        Ok(())
    }

    fn store_logs(&self, entries: &[LogEntry]) -> Result<()> {
        let mut map = self.entries.write();
        for entry in entries {
            map.insert(entry.index.0, entry.clone());
        }
        Ok(())
    }

    fn delete_range(&self, min: LogIndex, max: LogIndex) -> Result<()> {
        let mut map = self.entries.write();
        let keys: Vec<u64> = map.range(min.0..=max.0).map(|(k, _)| *k).collect();
        for key in keys {
            map.remove(&key);
        }
        Ok(())
    }
}

/// In-memory [`StableStore`].
#[derive(Default)]
pub struct MemStableStore {
    kv: RwLock<HashMap<Vec<u8>, Bytes>>,
}

impl MemStableStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StableStore for MemStableStore {
    fn set(&self, key: &[u8], val: &[u8]) -> Result<()> {
        self.kv
            .write()
            .insert(key.to_vec(), Bytes::copy_from_slice(val));
        Ok(())
    }

    fn get(&self, key: &[u8]) -> Result<Bytes> {
        self.kv.read().get(key).cloned().ok_or(RaftError::NotFound)
    }

    fn set_u64(&self, key: &[u8], val: u64) -> Result<()> {
        self.set(key, &val.to_be_bytes())
    }

    fn get_u64(&self, key: &[u8]) -> Result<u64> {
        let raw = self.get(key)?;
        let arr: [u8; 8] = raw
            .as_ref()
            .try_into()
            .map_err(|_| RaftError::storage("stored value is not a u64"))?;
        Ok(u64::from_be_bytes(arr))
    }
}
