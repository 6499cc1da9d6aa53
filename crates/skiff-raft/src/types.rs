//! Core Raft types: terms, log indexes, node identity, log entries, RPC messages.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Election epoch. At most one leader ever exists per term, and a node
/// adopts any newer term it observes; `bump` starts a fresh candidacy.
///
/// Wrapped so a term can never be confused with a log position in a
/// signature, even though both travel the wire as plain `u64`s.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Term(pub u64);

impl Term {
    pub const ZERO: Term = Term(0);

    /// The epoch a new candidacy runs in.
    pub fn bump(self) -> Term {
        Term(self.0 + 1)
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Position in the replicated log. Entry numbering starts at 1; zero
/// stands for "before any entry" and shows up as the initial value of
/// every progress register.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LogIndex(pub u64);

impl LogIndex {
    pub const ZERO: LogIndex = LogIndex(0);

    /// The slot right after this one.
    pub fn succ(self) -> LogIndex {
        LogIndex(self.0 + 1)
    }

    /// The slot right before this one; the predecessor of slot 1 (and of
    /// zero itself) is zero, which consistency checks treat as "nothing
    /// precedes the log".
    pub fn pred(self) -> LogIndex {
        LogIndex(self.0.saturating_sub(1))
    }
}

impl fmt::Display for LogIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Cluster-unique node address, in whatever form the transport dials
/// (host:port, DNS name, test label).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for NodeId {
    fn from(addr: &str) -> NodeId {
        NodeId(addr.to_string())
    }
}

impl From<String> for NodeId {
    fn from(addr: String) -> NodeId {
        NodeId(addr)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What a log entry carries.
///
/// Command entries hold opaque payloads for the state machine. Peer-set
/// changes are replicated through the log like any other entry so that the
/// whole cluster agrees on membership transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogKind {
    /// Opaque command applied to the FSM.
    Command,

    /// Entry dispatched by a fresh leader to flush the log through its term.
    Noop,

    /// Membership change: payload is the encoded post-change peer set.
    AddPeer,

    /// Membership change: payload is the encoded post-change peer set.
    RemovePeer,
}

/// Log entry (command + metadata).
///
/// `(index, term)` uniquely identifies an entry; two logs that agree at
/// `(index, term)` agree on all preceding entries (Log Matching).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub index: LogIndex,
    pub term: Term,
    pub kind: LogKind,
    pub data: Bytes,
}

impl LogEntry {
    pub fn new(index: LogIndex, term: Term, kind: LogKind, data: Bytes) -> Self {
        Self {
            index,
            term,
            kind,
            data,
        }
    }
}

/// AppendEntries RPC request.
///
/// Sent by the leader to replicate log entries and/or send heartbeats.
/// Empty entries list = heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    /// Leader's term
    pub term: Term,

    /// Leader's encoded address (so the follower can redirect clients)
    pub leader: Bytes,

    /// Index of log entry immediately preceding new ones
    pub prev_log_index: LogIndex,

    /// Term of prev_log_index entry
    pub prev_log_term: Term,

    /// Log entries to store (empty for heartbeat)
    pub entries: Vec<LogEntry>,

    /// Leader's commit index
    pub leader_commit: LogIndex,
}

/// AppendEntries RPC response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    /// Current term, for the leader to update itself
    pub term: Term,

    /// Responder's last log index (hint for match_index tracking)
    pub last_log: LogIndex,

    /// True if the consistency check passed and entries were stored
    pub success: bool,
}

/// RequestVote RPC request.
///
/// Sent by a candidate to all peers during election.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteRequest {
    /// Candidate's term
    pub term: Term,

    /// Candidate's encoded address
    pub candidate: Bytes,

    /// Index of candidate's last log entry
    pub last_log_index: LogIndex,

    /// Term of candidate's last log entry
    pub last_log_term: Term,
}

/// RequestVote RPC response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    /// Current term, for the candidate to update itself
    pub term: Term,

    /// Voter's encoded peer set (informational; lets a candidate detect
    /// that it has been removed from the cluster)
    pub peers: Bytes,

    /// True if the candidate received the vote
    pub granted: bool,
}

/// InstallSnapshot RPC request.
///
/// Sent by the leader when a follower is too far behind (log compacted).
/// A `size`-byte snapshot payload follows on a separate reader.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotRequest {
    /// Leader's term
    pub term: Term,

    /// Leader's encoded address
    pub leader: Bytes,

    /// Index of last entry covered by the snapshot
    pub last_log_index: LogIndex,

    /// Term of last_log_index
    pub last_log_term: Term,

    /// Encoded peer set at snapshot time
    pub peers: Bytes,

    /// Snapshot payload size in bytes
    pub size: u64,
}

/// InstallSnapshot RPC response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotResponse {
    pub term: Term,
    pub success: bool,
}

/// Raft role.
///
/// `Shutdown` is terminal; every loop observes it and exits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum Role {
    Follower = 0,
    Candidate = 1,
    Leader = 2,
    Shutdown = 3,
}

impl Role {
    pub(crate) fn from_u8(v: u8) -> Role {
        match v {
            0 => Role::Follower,
            1 => Role::Candidate,
            2 => Role::Leader,
            _ => Role::Shutdown,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Follower => write!(f, "Follower"),
            Role::Candidate => write!(f, "Candidate"),
            Role::Leader => write!(f, "Leader"),
            Role::Shutdown => write!(f, "Shutdown"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_term_bump_and_ordering() {
        assert!(Term(2) > Term(1));
        assert_eq!(Term(5).bump(), Term(6));
        assert_eq!(Term::ZERO.bump(), Term(1));
    }

    #[test]
    fn test_log_index_neighbors() {
        assert!(LogIndex(10) > LogIndex(5));
        assert_eq!(LogIndex(5).succ(), LogIndex(6));
        assert_eq!(LogIndex(5).pred(), LogIndex(4));
        // The start of the log has no real predecessor; pred saturates.
        assert_eq!(LogIndex(1).pred(), LogIndex::ZERO);
        assert_eq!(LogIndex::ZERO.pred(), LogIndex::ZERO);
    }

    #[test]
    fn test_role_round_trip() {
        for role in [Role::Follower, Role::Candidate, Role::Leader, Role::Shutdown] {
            assert_eq!(Role::from_u8(role as u8), role);
        }
    }

    #[test]
    fn test_log_entry_identity() {
        let a = LogEntry::new(LogIndex(3), Term(2), LogKind::Command, Bytes::from("x"));
        let b = a.clone();
        assert_eq!(a, b);
    }
}
