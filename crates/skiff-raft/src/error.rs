//! Raft error types.

use thiserror::Error;

/// Raft errors.
#[derive(Error, Debug)]
pub enum RaftError {
    /// Not the leader (cannot handle writes or membership changes).
    #[error("node is not the leader")]
    NotLeader,

    /// Leadership was lost while an entry was in flight; the entry may or
    /// may not commit under the next leader.
    #[error("leadership lost while committing log")]
    LeadershipLost,

    /// The node has already shut down.
    #[error("raft is already shutdown")]
    RaftShutdown,

    /// The role-loop intake was still full when the enqueue timeout elapsed.
    #[error("timed out enqueuing operation")]
    EnqueueTimeout,

    /// AddPeer target is already a cluster member (or is this node).
    #[error("peer already known")]
    KnownPeer,

    /// RemovePeer target is not a cluster member.
    #[error("peer is unknown")]
    UnknownPeer,

    /// Key absent from a stable or log store. Callers that can treat
    /// absence as a default value match on this variant.
    #[error("not found")]
    NotFound,

    /// Configuration error (invalid Raft config).
    #[error("configuration error: {reason}")]
    InvalidConfig { reason: String },

    /// Storage failure (log, stable, or snapshot store).
    #[error("storage error: {reason}")]
    Storage { reason: String },

    /// Snapshot capture, persist, or install failed.
    #[error("snapshot failed: {reason}")]
    SnapshotFailed { reason: String },

    /// I/O error (network, snapshot streams).
    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// Serialization error.
    #[error("serialization error: {source}")]
    Serialization {
        #[from]
        source: bincode::Error,
    },
}

impl RaftError {
    /// True for the "key absent" error that startup and vote lookups
    /// tolerate as a default.
    pub fn is_not_found(&self) -> bool {
        matches!(self, RaftError::NotFound)
    }

    pub(crate) fn storage(reason: impl Into<String>) -> RaftError {
        RaftError::Storage {
            reason: reason.into(),
        }
    }
}

/// Raft result type.
pub type Result<T> = std::result::Result<T, RaftError>;
