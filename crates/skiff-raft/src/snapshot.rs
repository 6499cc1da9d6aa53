//! Snapshot storage contracts, the in-memory snapshot store, and the
//! snapshot manager task.
//!
//! Snapshots capture the FSM's state at a point in the log so entries at
//! or below that point can be compacted away. The manager runs alongside
//! the role loop and the FSM runner so snapshotting does not block normal
//! operation.

use crate::config::{random_timeout, Config};
use crate::error::{RaftError, Result};
use crate::fsm::FsmSnapshotRequest;
use crate::future::Responder;
use crate::peers::encode_peers;
use crate::raft::Shutdown;
use crate::state::RaftState;
use crate::storage::LogStore;
use crate::transport::Transport;
use crate::types::{LogIndex, Term};
use bytes::Bytes;
use parking_lot::Mutex;
use std::io::{Cursor, Read, Write};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info};

/// Snapshot metadata. Snapshots are immutable once their sink is closed.
#[derive(Debug, Clone)]
pub struct SnapshotMeta {
    /// Store-assigned identifier, used to reopen the snapshot.
    pub id: String,

    /// Last log index covered by the snapshot.
    pub index: LogIndex,

    /// Term of `index`.
    pub term: Term,

    /// Encoded peer set at snapshot time.
    pub peers: Bytes,

    /// Payload size in bytes.
    pub size: u64,
}

/// Write half of a snapshot being captured or installed.
///
/// A sink is scoped to one capture: it is finalized with `close` or
/// discarded with `cancel`.
pub trait SnapshotSink: Write + Send {
    fn id(&self) -> &str;

    fn close(self: Box<Self>) -> Result<()>;

    fn cancel(self: Box<Self>) -> Result<()>;
}

/// Creates, lists, and opens immutable snapshots.
pub trait SnapshotStore: Send + Sync + 'static {
    /// Begin a new snapshot at `(index, term)` with the given encoded
    /// peer set.
    fn create(&self, index: LogIndex, term: Term, peers: Bytes) -> Result<Box<dyn SnapshotSink>>;

    /// All known snapshots, newest first.
    fn list(&self) -> Result<Vec<SnapshotMeta>>;

    /// Open a snapshot for reading.
    fn open(&self, id: &str) -> Result<(SnapshotMeta, Box<dyn Read + Send>)>;
}

struct StoredSnapshot {
    meta: SnapshotMeta,
    data: Bytes,
}

#[derive(Default)]
struct MemSnapshotInner {
    seq: u64,
    snapshots: Vec<StoredSnapshot>,
}

/// In-memory [`SnapshotStore`].
#[derive(Clone, Default)]
pub struct MemSnapshotStore {
    inner: Arc<Mutex<MemSnapshotInner>>,
}

impl MemSnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SnapshotStore for MemSnapshotStore {
    fn create(&self, index: LogIndex, term: Term, peers: Bytes) -> Result<Box<dyn SnapshotSink>> {
        let mut inner = self.inner.lock();
        inner.seq += 1;
        let id = format!("snap-{}", inner.seq);
        Ok(Box::new(MemSnapshotSink {
            meta: SnapshotMeta {
                id,
                index,
                term,
                peers,
                size: 0,
            },
            buf: Vec::new(),
            store: self.inner.clone(),
        }))
    }

    fn list(&self) -> Result<Vec<SnapshotMeta>> {
        let inner = self.inner.lock();
        Ok(inner.snapshots.iter().map(|s| s.meta.clone()).collect())
    }

    fn open(&self, id: &str) -> Result<(SnapshotMeta, Box<dyn Read + Send>)> {
        let inner = self.inner.lock();
        let stored = inner
            .snapshots
            .iter()
            .find(|s| s.meta.id == id)
            .ok_or(RaftError::NotFound)?;
        let reader: Box<dyn Read + Send> = Box::new(Cursor::new(stored.data.to_vec()));
        Ok((stored.meta.clone(), reader))
    }
}

struct MemSnapshotSink {
    meta: SnapshotMeta,
    buf: Vec<u8>,
    store: Arc<Mutex<MemSnapshotInner>>,
}

impl Write for MemSnapshotSink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl SnapshotSink for MemSnapshotSink {
    fn id(&self) -> &str {
        &self.meta.id
    }

    fn close(mut self: Box<Self>) -> Result<()> {
        self.meta.size = self.buf.len() as u64;
        let mut inner = self.store.lock();
        // Newest first, matching the list() contract.
        inner.snapshots.insert(
            0,
            StoredSnapshot {
                meta: self.meta,
                data: Bytes::from(self.buf),
            },
        );
        Ok(())
    }

    fn cancel(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

/// Long-running snapshot manager.
///
/// Wakes on a randomized interval to check the log delta against the
/// snapshot threshold, and services user-triggered snapshot requests
/// synchronously.
pub(crate) struct SnapshotRunner {
    pub conf: Arc<Config>,
    pub state: Arc<RaftState>,
    pub logs: Arc<dyn LogStore>,
    pub snapshots: Arc<dyn SnapshotStore>,
    pub trans: Arc<dyn Transport>,
    pub fsm_snapshot_tx: mpsc::Sender<FsmSnapshotRequest>,
    pub user_rx: mpsc::Receiver<Responder<()>>,
    pub shutdown: Arc<Shutdown>,
}

impl SnapshotRunner {
    pub(crate) async fn run(mut self) {
        let mut shutdown_rx = self.shutdown.subscribe();
        loop {
            if self.shutdown.is_shutdown() {
                return;
            }
            tokio::select! {
                _ = tokio::time::sleep(random_timeout(self.conf.snapshot_interval)) => {
                    if !self.should_snapshot() {
                        continue;
                    }
                    if let Err(e) = self.take_snapshot().await {
                        error!(error = %e, "failed to take snapshot");
                    }
                }
                req = self.user_rx.recv() => {
                    let Some(mut responder) = req else { return };
                    let res = self.take_snapshot().await;
                    if let Err(ref e) = res {
                        error!(error = %e, "failed to take snapshot");
                    }
                    responder.respond(res);
                }
                _ = shutdown_rx.recv() => {
                    return;
                }
            }
        }
    }

    /// True when the spread between the oldest and newest log entries
    /// exceeds the configured threshold.
    fn should_snapshot(&self) -> bool {
        let first = match self.logs.first_index() {
            Ok(idx) => idx,
            Err(e) => {
                error!(error = %e, "failed to get first log index");
                return false;
            }
        };
        let last = match self.logs.last_index() {
            Ok(idx) => idx,
            Err(e) => {
                error!(error = %e, "failed to get last log index");
                return false;
            }
        };
        last.0.saturating_sub(first.0) >= self.conf.snapshot_threshold
    }

    async fn take_snapshot(&mut self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        let req = FsmSnapshotRequest { reply: tx };

        let mut shutdown_rx = self.shutdown.subscribe();
        tokio::select! {
            res = self.fsm_snapshot_tx.send(req) => {
                if res.is_err() {
                    return Err(RaftError::RaftShutdown);
                }
            }
            _ = shutdown_rx.recv() => {
                return Err(RaftError::RaftShutdown);
            }
        }

        let reply = rx.await.map_err(|_| RaftError::RaftShutdown)??;
        if reply.index == LogIndex::ZERO {
            debug!("nothing applied yet, skipping snapshot");
            return Ok(());
        }

        info!(index = %reply.index, "starting snapshot");

        let mut fsm_snapshot = reply.snapshot;
        let peers = encode_peers(&reply.peers, self.trans.as_ref())?;
        let mut sink = self.snapshots.create(reply.index, reply.term, peers)?;

        if let Err(e) = fsm_snapshot.persist(sink.as_mut()) {
            fsm_snapshot.release();
            let _ = sink.cancel();
            return Err(e);
        }
        fsm_snapshot.release();
        sink.close()?;

        compact_logs(
            self.logs.as_ref(),
            &self.state,
            self.conf.trailing_logs,
            reply.index,
        )?;

        info!(index = %reply.index, "snapshot complete");
        Ok(())
    }
}

/// Delete log entries made redundant by a snapshot at `snap_idx`.
///
/// Retains at least `trailing` entries behind the log head so slow
/// followers can catch up via appends, and never deletes `snap_idx` itself
/// so replicators can verify the previous-log term right after the
/// snapshot point.
pub(crate) fn compact_logs(
    logs: &dyn LogStore,
    state: &RaftState,
    trailing: u64,
    snap_idx: LogIndex,
) -> Result<()> {
    let min_log = logs.first_index()?;
    if min_log == LogIndex::ZERO {
        return Ok(());
    }

    let (last_log_idx, _) = state.last_log();
    let max_log = LogIndex(
        snap_idx
            .0
            .saturating_sub(1)
            .min(last_log_idx.0.saturating_sub(trailing)),
    );

    if max_log < min_log {
        debug!("no logs to compact");
        return Ok(());
    }

    info!(from = %min_log, to = %max_log, "compacting logs");
    logs.delete_range(min_log, max_log)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{LogStore, MemLogStore};
    use crate::types::{LogEntry, LogKind};

    fn store_with_range(min: u64, max: u64) -> MemLogStore {
        let store = MemLogStore::new();
        for i in min..=max {
            store
                .store_log(&LogEntry::new(
                    LogIndex(i),
                    Term(1),
                    LogKind::Command,
                    Bytes::new(),
                ))
                .unwrap();
        }
        store
    }

    #[test]
    fn test_mem_snapshot_store_round_trip() {
        let store = MemSnapshotStore::new();
        assert!(store.list().unwrap().is_empty());

        let mut sink = store
            .create(LogIndex(10), Term(2), Bytes::from_static(b"peers"))
            .unwrap();
        sink.write_all(b"state-bytes").unwrap();
        sink.close().unwrap();

        let metas = store.list().unwrap();
        assert_eq!(metas.len(), 1);
        assert_eq!(metas[0].index, LogIndex(10));
        assert_eq!(metas[0].size, 11);

        let (meta, mut reader) = store.open(&metas[0].id).unwrap();
        assert_eq!(meta.term, Term(2));
        let mut data = Vec::new();
        reader.read_to_end(&mut data).unwrap();
        assert_eq!(data, b"state-bytes");
    }

    #[test]
    fn test_mem_snapshot_store_cancel_discards() {
        let store = MemSnapshotStore::new();
        let mut sink = store.create(LogIndex(3), Term(1), Bytes::new()).unwrap();
        sink.write_all(b"junk").unwrap();
        sink.cancel().unwrap();
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn test_mem_snapshot_store_lists_newest_first() {
        let store = MemSnapshotStore::new();
        for i in 1..=3u64 {
            let sink = store.create(LogIndex(i), Term(1), Bytes::new()).unwrap();
            sink.close().unwrap();
        }
        let metas = store.list().unwrap();
        assert_eq!(metas[0].index, LogIndex(3));
        assert_eq!(metas[2].index, LogIndex(1));
    }

    #[test]
    fn test_compact_logs_retains_trailing() {
        let logs = store_with_range(1, 100);
        let state = RaftState::new();
        state.set_last_log(LogIndex(100), Term(1));

        // Snapshot at 90 with 20 trailing: delete up to min(89, 80) = 80.
        compact_logs(&logs, &state, 20, LogIndex(90)).unwrap();
        assert_eq!(logs.first_index().unwrap(), LogIndex(81));
        assert_eq!(logs.last_index().unwrap(), LogIndex(100));
    }

    #[test]
    fn test_compact_logs_never_deletes_snapshot_boundary() {
        let logs = store_with_range(1, 50);
        let state = RaftState::new();
        state.set_last_log(LogIndex(50), Term(1));

        // Zero trailing: everything before the snapshot may go, but index
        // 50 (the snapshot point) must survive.
        compact_logs(&logs, &state, 0, LogIndex(50)).unwrap();
        assert_eq!(logs.first_index().unwrap(), LogIndex(50));
    }

    #[test]
    fn test_compact_logs_noop_when_delta_small() {
        let logs = store_with_range(1, 10);
        let state = RaftState::new();
        state.set_last_log(LogIndex(10), Term(1));

        compact_logs(&logs, &state, 100, LogIndex(10)).unwrap();
        assert_eq!(logs.first_index().unwrap(), LogIndex(1));
    }
}
