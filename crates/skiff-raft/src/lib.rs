//! skiff-raft: Raft consensus core.
//!
//! A durable replicated-log state machine that, in cooperation with peers
//! over an RPC transport, maintains a linearizable sequence of commands
//! applied to a caller-supplied finite state machine:
//! - Leader election with randomized timeouts
//! - Log replication with quorum commitment and per-entry quorum policies
//! - Durable term/vote persistence
//! - Snapshotting with log compaction and InstallSnapshot catch-up
//! - Single-peer-at-a-time cluster membership changes
//!
//! Based on the Raft paper (Ongaro & Ousterhout, 2014).
//!
//! Storage, snapshots, peers, transport, and the state machine are all
//! pluggable through traits; in-memory implementations of each ship with
//! the crate for testing and embedding.

pub mod config;
pub mod error;
pub mod fsm;
pub mod future;
pub mod peers;
pub mod snapshot;
pub mod state;
pub mod storage;
pub mod transport;
pub mod types;

mod inflight;
mod raft;
mod replication;
mod rpc;

pub use config::Config;
pub use error::{RaftError, Result};
pub use fsm::{Fsm, FsmSnapshot};
pub use future::{ApplyFuture, OpFuture};
pub use peers::{MemPeerStore, PeerStore};
pub use raft::Raft;
pub use snapshot::{MemSnapshotStore, SnapshotMeta, SnapshotSink, SnapshotStore};
pub use storage::{LogStore, MemLogStore, MemStableStore, StableStore};
pub use transport::{InMemoryRouter, InMemoryTransport, Rpc, RpcReceiver, RpcSender, Transport};
pub use types::*;
