//! One-shot completion futures for client-facing operations.
//!
//! Every operation handed to the role loop resolves exactly once: the apply
//! pipeline answers Command futures after FSM application, the role loop
//! answers membership precondition rejections, and inflight cancellation
//! answers with `LeadershipLost` on step-down.

use crate::error::{RaftError, Result};
use crate::inflight::QuorumPolicy;
use crate::types::{LogEntry, LogIndex, LogKind, NodeId, Term};
use bytes::Bytes;
use tokio::sync::oneshot;

/// Client-side handle for an asynchronous Raft operation.
///
/// Resolves once with the operation outcome. Dropping the handle does not
/// cancel the operation.
pub struct OpFuture<T> {
    rx: oneshot::Receiver<Result<T>>,
}

/// Future returned by [`crate::Raft::apply`]; resolves with the FSM's
/// response to the command. Membership changes resolve with an empty
/// payload.
pub type ApplyFuture = OpFuture<Bytes>;

impl<T> OpFuture<T> {
    /// Wait for the operation to complete.
    pub async fn wait(self) -> Result<T> {
        match self.rx.await {
            Ok(res) => res,
            // Responder dropped without answering: only happens when the
            // node is torn down before the operation is consumed.
            Err(_) => Err(RaftError::RaftShutdown),
        }
    }

    /// A future that is already resolved, used to surface precondition
    /// errors without touching the role loop.
    pub(crate) fn ready(res: Result<T>) -> OpFuture<T> {
        let (mut responder, future) = op_future();
        responder.respond(res);
        future
    }
}

/// Producer half of an [`OpFuture`]. Responds at most once; later calls
/// are ignored.
pub(crate) struct Responder<T> {
    tx: Option<oneshot::Sender<Result<T>>>,
}

impl<T> Responder<T> {
    pub(crate) fn respond(&mut self, res: Result<T>) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(res);
        }
    }
}

pub(crate) fn op_future<T>() -> (Responder<T>, OpFuture<T>) {
    let (tx, rx) = oneshot::channel();
    (Responder { tx: Some(tx) }, OpFuture { rx })
}

/// A log entry travelling through the leader pipeline together with the
/// handle that answers its submitter.
///
/// Index and term are assigned by `dispatch_log`; membership entries carry
/// the change target until the leader encodes the post-change peer set.
pub(crate) struct LogFuture {
    pub entry: LogEntry,
    pub peer: Option<NodeId>,
    pub policy: Option<QuorumPolicy>,
    pub responder: Option<Responder<Bytes>>,
}

impl LogFuture {
    pub(crate) fn new(kind: LogKind, data: Bytes, peer: Option<NodeId>) -> (LogFuture, ApplyFuture) {
        let (responder, future) = op_future();
        let log_future = LogFuture {
            entry: LogEntry::new(LogIndex::ZERO, Term::ZERO, kind, data),
            peer,
            policy: None,
            responder: Some(responder),
        };
        (log_future, future)
    }

    pub(crate) fn respond(&mut self, res: Result<Bytes>) {
        if let Some(responder) = self.responder.as_mut() {
            responder.respond(res);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_op_future_resolves_once() {
        let (mut responder, future) = op_future::<u64>();
        responder.respond(Ok(7));
        responder.respond(Ok(9)); // ignored
        assert_eq!(future.wait().await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_ready_future() {
        let future = OpFuture::<()>::ready(Err(RaftError::NotLeader));
        assert!(matches!(future.wait().await, Err(RaftError::NotLeader)));
    }

    #[tokio::test]
    async fn test_dropped_responder_reports_shutdown() {
        let (responder, future) = op_future::<()>();
        drop(responder);
        assert!(matches!(future.wait().await, Err(RaftError::RaftShutdown)));
    }

    #[tokio::test]
    async fn test_log_future_responds_through_entry() {
        let (mut log_future, handle) = LogFuture::new(LogKind::Command, Bytes::from("x"), None);
        assert_eq!(log_future.entry.kind, LogKind::Command);
        log_future.respond(Ok(Bytes::from("done")));
        assert_eq!(handle.wait().await.unwrap(), Bytes::from("done"));
    }
}
