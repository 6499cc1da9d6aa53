//! Finite state machine contract and the FSM runner task.
//!
//! The runner is the only task that ever touches the caller's FSM: command
//! application, snapshot capture, and snapshot restore all flow through
//! its channels, so the FSM is never invoked concurrently and sees
//! committed commands in strict index order.

use crate::error::Result;
use crate::future::Responder;
use crate::peers::PeerStore;
use crate::raft::Shutdown;
use crate::snapshot::{SnapshotSink, SnapshotStore};
use crate::types::{LogEntry, LogIndex, NodeId, Term};
use bytes::Bytes;
use std::io::Read;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info};

/// Caller-supplied finite state machine.
///
/// `apply` must be deterministic: every node applies the same committed
/// commands in the same order and must arrive at the same state.
pub trait Fsm: Send + 'static {
    /// Apply a committed command, returning an opaque response for the
    /// client that submitted it.
    fn apply(&mut self, data: &[u8]) -> Bytes;

    /// Capture a point-in-time snapshot object. The returned handle is
    /// persisted by the snapshot manager on its own task; implementations
    /// typically clone or freeze their state here.
    fn snapshot(&mut self) -> Result<Box<dyn FsmSnapshot>>;

    /// Replace all state with the contents of a snapshot.
    fn restore(&mut self, source: Box<dyn Read + Send>) -> Result<()>;
}

/// A captured FSM snapshot awaiting persistence.
pub trait FsmSnapshot: Send + 'static {
    /// Write the snapshot payload into the sink. The caller finalizes the
    /// sink on success and cancels it on failure.
    fn persist(&self, sink: &mut dyn SnapshotSink) -> Result<()>;

    /// Called once persistence finishes (successfully or not).
    fn release(&mut self) {}
}

/// A committed entry headed for `Fsm::apply`, with the future answered
/// once application completes.
pub(crate) struct CommitTuple {
    pub entry: LogEntry,
    pub responder: Option<Responder<Bytes>>,
}

/// Restore request dispatched by the InstallSnapshot handler.
pub(crate) struct RestoreRequest {
    pub id: String,
    pub responder: Responder<()>,
}

/// Snapshot-capture request from the snapshot manager.
pub(crate) struct FsmSnapshotRequest {
    pub reply: oneshot::Sender<Result<FsmSnapshotReply>>,
}

/// What the FSM runner hands back for a capture: the log position the
/// snapshot covers, the peer set to record, and the snapshot object.
pub(crate) struct FsmSnapshotReply {
    pub index: LogIndex,
    pub term: Term,
    pub peers: Vec<NodeId>,
    pub snapshot: Box<dyn FsmSnapshot>,
}

/// Long-running task owning the caller's FSM.
pub(crate) struct FsmRunner {
    pub fsm: Box<dyn Fsm>,
    pub commit_rx: mpsc::Receiver<CommitTuple>,
    pub restore_rx: mpsc::Receiver<RestoreRequest>,
    pub snapshot_rx: mpsc::Receiver<FsmSnapshotRequest>,
    pub snapshots: Arc<dyn SnapshotStore>,
    pub peer_store: Arc<dyn PeerStore>,
    pub shutdown: Arc<Shutdown>,

    /// Position of the last command applied or snapshot restored, reported
    /// back on snapshot captures.
    pub last_index: LogIndex,
    pub last_term: Term,
}

impl FsmRunner {
    pub(crate) async fn run(mut self) {
        let mut shutdown_rx = self.shutdown.subscribe();
        loop {
            tokio::select! {
                Some(req) = self.restore_rx.recv() => self.handle_restore(req),
                Some(req) = self.snapshot_rx.recv() => self.handle_snapshot(req),
                Some(tuple) = self.commit_rx.recv() => self.handle_commit(tuple),
                _ = shutdown_rx.recv() => return,
                else => return,
            }
        }
    }

    fn handle_restore(&mut self, mut req: RestoreRequest) {
        let (meta, source) = match self.snapshots.open(&req.id) {
            Ok(opened) => opened,
            Err(e) => {
                error!(id = %req.id, error = %e, "failed to open snapshot");
                req.responder.respond(Err(e));
                return;
            }
        };

        if let Err(e) = self.fsm.restore(source) {
            error!(id = %req.id, error = %e, "failed to restore snapshot");
            req.responder.respond(Err(e));
            return;
        }

        self.last_index = meta.index;
        self.last_term = meta.term;
        info!(id = %req.id, index = %meta.index, "restored snapshot into FSM");
        req.responder.respond(Ok(()));
    }

    fn handle_snapshot(&mut self, req: FsmSnapshotRequest) {
        let peers = match self.peer_store.peers() {
            Ok(peers) => peers,
            Err(e) => {
                let _ = req.reply.send(Err(e));
                return;
            }
        };

        match self.fsm.snapshot() {
            Ok(snapshot) => {
                let _ = req.reply.send(Ok(FsmSnapshotReply {
                    index: self.last_index,
                    term: self.last_term,
                    peers,
                    snapshot,
                }));
            }
            Err(e) => {
                let _ = req.reply.send(Err(e));
            }
        }
    }

    fn handle_commit(&mut self, mut tuple: CommitTuple) {
        let resp = self.fsm.apply(&tuple.entry.data);
        self.last_index = tuple.entry.index;
        self.last_term = tuple.entry.term;

        if let Some(responder) = tuple.responder.as_mut() {
            responder.respond(Ok(resp));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::future::op_future;
    use crate::peers::MemPeerStore;
    use crate::snapshot::MemSnapshotStore;
    use crate::types::LogKind;

    /// Appends every applied command to a list.
    struct ListFsm {
        applied: Vec<Bytes>,
    }

    impl Fsm for ListFsm {
        fn apply(&mut self, data: &[u8]) -> Bytes {
            self.applied.push(Bytes::copy_from_slice(data));
            Bytes::from(format!("ok-{}", self.applied.len()))
        }

        fn snapshot(&mut self) -> Result<Box<dyn FsmSnapshot>> {
            Ok(Box::new(NoopSnapshot))
        }

        fn restore(&mut self, _source: Box<dyn Read + Send>) -> Result<()> {
            self.applied.clear();
            Ok(())
        }
    }

    struct NoopSnapshot;

    impl FsmSnapshot for NoopSnapshot {
        fn persist(&self, _sink: &mut dyn SnapshotSink) -> Result<()> {
            Ok(())
        }
    }

    fn runner() -> (
        FsmRunner,
        mpsc::Sender<CommitTuple>,
        mpsc::Sender<FsmSnapshotRequest>,
    ) {
        let (commit_tx, commit_rx) = mpsc::channel(8);
        let (_restore_tx, restore_rx) = mpsc::channel(1);
        let (snapshot_tx, snapshot_rx) = mpsc::channel(1);
        let runner = FsmRunner {
            fsm: Box::new(ListFsm {
                applied: Vec::new(),
            }),
            commit_rx,
            restore_rx,
            snapshot_rx,
            snapshots: Arc::new(MemSnapshotStore::new()),
            peer_store: Arc::new(MemPeerStore::new(vec![NodeId::from("n1")])),
            shutdown: Shutdown::new(),
            last_index: LogIndex::ZERO,
            last_term: Term::ZERO,
        };
        (runner, commit_tx, snapshot_tx)
    }

    #[tokio::test]
    async fn test_commit_answers_after_application() {
        let (runner, commit_tx, _snap_tx) = runner();
        let shutdown = runner.shutdown.clone();
        let task = tokio::spawn(runner.run());

        let (responder, future) = op_future();
        commit_tx
            .send(CommitTuple {
                entry: LogEntry::new(LogIndex(1), Term(1), LogKind::Command, Bytes::from("a")),
                responder: Some(responder),
            })
            .await
            .unwrap();

        assert_eq!(future.wait().await.unwrap(), Bytes::from("ok-1"));

        shutdown.initiate();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_snapshot_reports_last_applied_position() {
        let (runner, commit_tx, snap_tx) = runner();
        let shutdown = runner.shutdown.clone();
        let task = tokio::spawn(runner.run());

        let (responder, future) = op_future();
        commit_tx
            .send(CommitTuple {
                entry: LogEntry::new(LogIndex(5), Term(3), LogKind::Command, Bytes::from("x")),
                responder: Some(responder),
            })
            .await
            .unwrap();
        future.wait().await.unwrap();

        let (reply_tx, reply_rx) = oneshot::channel();
        snap_tx
            .send(FsmSnapshotRequest { reply: reply_tx })
            .await
            .unwrap();
        let reply = reply_rx.await.unwrap().unwrap();
        assert_eq!(reply.index, LogIndex(5));
        assert_eq!(reply.term, Term(3));
        assert_eq!(reply.peers, vec![NodeId::from("n1")]);

        shutdown.initiate();
        task.await.unwrap();
    }
}
