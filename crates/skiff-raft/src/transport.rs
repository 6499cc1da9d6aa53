//! Transport abstraction for Raft RPC communication.
//!
//! Defines the [`Transport`] trait that allows pluggable transports:
//! network implementations for production, in-memory channels for unit and
//! cluster tests. Outbound RPCs are async methods; inbound RPCs arrive as
//! [`Rpc`] envelopes on the receiver handed to `Raft::new`, each carrying a
//! one-shot channel the handler answers on.

use crate::error::{RaftError, Result};
use crate::types::*;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::io::Read;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// Inbound RPC envelope (tagged union of all RPC types).
pub enum Rpc {
    AppendEntries {
        req: AppendEntriesRequest,
        tx: oneshot::Sender<AppendEntriesResponse>,
    },
    RequestVote {
        req: RequestVoteRequest,
        tx: oneshot::Sender<RequestVoteResponse>,
    },
    InstallSnapshot {
        req: InstallSnapshotRequest,
        /// Snapshot payload; exactly `req.size` bytes are expected.
        source: Box<dyn Read + Send>,
        tx: oneshot::Sender<InstallSnapshotResponse>,
    },
}

pub type RpcSender = mpsc::Sender<Rpc>;
pub type RpcReceiver = mpsc::Receiver<Rpc>;

/// Transport abstraction for Raft RPC communication.
///
/// Implementations handle connection management, serialization, and
/// network failures. All outbound methods are async and may take
/// significant time; transient errors are surfaced as [`RaftError::Io`]
/// and retried by the caller on its next cycle.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// This node's address as peers reach it.
    fn local_addr(&self) -> NodeId;

    /// Encode a peer address for the wire (log payloads, vote requests,
    /// snapshot metadata).
    fn encode_peer(&self, peer: &NodeId) -> Bytes;

    /// Decode an address previously produced by `encode_peer`.
    fn decode_peer(&self, data: &[u8]) -> NodeId;

    /// Send RequestVote to a peer and wait for its response.
    async fn request_vote(
        &self,
        target: &NodeId,
        req: RequestVoteRequest,
    ) -> Result<RequestVoteResponse>;

    /// Send AppendEntries (heartbeat or replication batch) to a peer.
    async fn append_entries(
        &self,
        target: &NodeId,
        req: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse>;

    /// Stream a snapshot to a peer that is too far behind to catch up
    /// via appends.
    async fn install_snapshot(
        &self,
        target: &NodeId,
        req: InstallSnapshotRequest,
        source: Box<dyn Read + Send>,
    ) -> Result<InstallSnapshotResponse>;
}

/// Shared registry wiring a set of [`InMemoryTransport`]s together.
///
/// Each node registers once and receives its inbound RPC stream.
/// Partitioning a node blocks traffic to and from it (reversibly), which
/// is enough to simulate leader isolation in tests.
#[derive(Clone, Default)]
pub struct InMemoryRouter {
    nodes: Arc<RwLock<HashMap<NodeId, RpcSender>>>,
    partitioned: Arc<RwLock<HashSet<NodeId>>>,
}

impl InMemoryRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `local` and build its transport. The returned receiver is
    /// the node's inbound RPC stream, passed to `Raft::new`.
    pub fn transport(&self, local: NodeId) -> (InMemoryTransport, RpcReceiver) {
        let (tx, rx) = mpsc::channel(128);
        self.nodes.write().insert(local.clone(), tx);
        (
            InMemoryTransport {
                local,
                router: self.clone(),
            },
            rx,
        )
    }

    /// Cut the node off from the rest of the cluster in both directions.
    pub fn partition(&self, node: &NodeId) {
        self.partitioned.write().insert(node.clone());
    }

    /// Undo a [`partition`](Self::partition).
    pub fn heal(&self, node: &NodeId) {
        self.partitioned.write().remove(node);
    }

    fn sender(&self, from: &NodeId, to: &NodeId) -> Result<RpcSender> {
        let partitioned = self.partitioned.read();
        if partitioned.contains(from) || partitioned.contains(to) {
            return Err(RaftError::Io {
                source: std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    format!("partitioned: {} -> {}", from, to),
                ),
            });
        }
        drop(partitioned);

        self.nodes.read().get(to).cloned().ok_or_else(|| {
            RaftError::Io {
                source: std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("peer not found: {}", to),
                ),
            }
        })
    }
}

/// In-memory transport for testing (local channels, no network).
pub struct InMemoryTransport {
    local: NodeId,
    router: InMemoryRouter,
}

impl InMemoryTransport {
    /// Standalone transport with no reachable peers; outbound RPCs fail.
    pub fn new(local: NodeId) -> Self {
        Self {
            local,
            router: InMemoryRouter::new(),
        }
    }
}

fn broken_pipe(context: &str) -> RaftError {
    RaftError::Io {
        source: std::io::Error::new(std::io::ErrorKind::BrokenPipe, context.to_string()),
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    fn local_addr(&self) -> NodeId {
        self.local.clone()
    }

    fn encode_peer(&self, peer: &NodeId) -> Bytes {
        Bytes::copy_from_slice(peer.as_str().as_bytes())
    }

    fn decode_peer(&self, data: &[u8]) -> NodeId {
        NodeId::from(String::from_utf8_lossy(data).into_owned())
    }

    async fn request_vote(
        &self,
        target: &NodeId,
        req: RequestVoteRequest,
    ) -> Result<RequestVoteResponse> {
        let sender = self.router.sender(&self.local, target)?;
        let (tx, rx) = oneshot::channel();
        sender
            .send(Rpc::RequestVote { req, tx })
            .await
            .map_err(|_| broken_pipe("request vote send"))?;
        rx.await.map_err(|_| broken_pipe("request vote response"))
    }

    async fn append_entries(
        &self,
        target: &NodeId,
        req: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        let sender = self.router.sender(&self.local, target)?;
        let (tx, rx) = oneshot::channel();
        sender
            .send(Rpc::AppendEntries { req, tx })
            .await
            .map_err(|_| broken_pipe("append entries send"))?;
        rx.await.map_err(|_| broken_pipe("append entries response"))
    }

    async fn install_snapshot(
        &self,
        target: &NodeId,
        req: InstallSnapshotRequest,
        source: Box<dyn Read + Send>,
    ) -> Result<InstallSnapshotResponse> {
        let sender = self.router.sender(&self.local, target)?;
        let (tx, rx) = oneshot::channel();
        sender
            .send(Rpc::InstallSnapshot { req, source, tx })
            .await
            .map_err(|_| broken_pipe("install snapshot send"))?;
        rx.await
            .map_err(|_| broken_pipe("install snapshot response"))
    }
}
