//! Volatile Raft state registers.
//!
//! Every register is an atomic so any task may read them without locking;
//! each field is written from at most one task (role transitions and log
//! registers from the role loop, `last_applied` from the apply pipeline,
//! snapshot registers from the role loop and bootstrap).

use crate::types::{LogIndex, Role, Term};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

/// Shared volatile state registers.
///
/// Invariant: `commit_index >= last_applied >= last_snapshot_index` and all
/// three only move forward.
pub struct RaftState {
    role: AtomicU8,
    current_term: AtomicU64,
    commit_index: AtomicU64,
    last_applied: AtomicU64,
    last_log_index: AtomicU64,
    last_log_term: AtomicU64,
    last_snapshot_index: AtomicU64,
    last_snapshot_term: AtomicU64,
}

impl RaftState {
    pub fn new() -> Self {
        Self {
            role: AtomicU8::new(Role::Follower as u8),
            current_term: AtomicU64::new(0),
            commit_index: AtomicU64::new(0),
            last_applied: AtomicU64::new(0),
            last_log_index: AtomicU64::new(0),
            last_log_term: AtomicU64::new(0),
            last_snapshot_index: AtomicU64::new(0),
            last_snapshot_term: AtomicU64::new(0),
        }
    }

    pub fn role(&self) -> Role {
        Role::from_u8(self.role.load(Ordering::SeqCst))
    }

    pub(crate) fn set_role(&self, role: Role) {
        self.role.store(role as u8, Ordering::SeqCst);
    }

    pub fn current_term(&self) -> Term {
        Term(self.current_term.load(Ordering::SeqCst))
    }

    /// Updates only the cached register. Durable persistence happens first
    /// through the stable-store facade on the role loop.
    pub(crate) fn set_current_term_register(&self, term: Term) {
        self.current_term.store(term.0, Ordering::SeqCst);
    }

    pub fn commit_index(&self) -> LogIndex {
        LogIndex(self.commit_index.load(Ordering::SeqCst))
    }

    pub(crate) fn set_commit_index(&self, index: LogIndex) {
        self.commit_index.store(index.0, Ordering::SeqCst);
    }

    pub fn last_applied(&self) -> LogIndex {
        LogIndex(self.last_applied.load(Ordering::SeqCst))
    }

    pub(crate) fn set_last_applied(&self, index: LogIndex) {
        self.last_applied.store(index.0, Ordering::SeqCst);
    }

    /// Most recent entry durably in the log store.
    pub fn last_log(&self) -> (LogIndex, Term) {
        (
            LogIndex(self.last_log_index.load(Ordering::SeqCst)),
            Term(self.last_log_term.load(Ordering::SeqCst)),
        )
    }

    pub(crate) fn set_last_log(&self, index: LogIndex, term: Term) {
        self.last_log_index.store(index.0, Ordering::SeqCst);
        self.last_log_term.store(term.0, Ordering::SeqCst);
    }

    pub fn last_snapshot(&self) -> (LogIndex, Term) {
        (
            LogIndex(self.last_snapshot_index.load(Ordering::SeqCst)),
            Term(self.last_snapshot_term.load(Ordering::SeqCst)),
        )
    }

    pub(crate) fn set_last_snapshot(&self, index: LogIndex, term: Term) {
        self.last_snapshot_index.store(index.0, Ordering::SeqCst);
        self.last_snapshot_term.store(term.0, Ordering::SeqCst);
    }

    /// Highest index present either in the log store or in the restored
    /// snapshot. After a snapshot install with a fully compacted log this
    /// is the snapshot index, so a newly elected leader keeps assigning
    /// monotonic indexes.
    pub fn last_index(&self) -> LogIndex {
        let (log_idx, _) = self.last_log();
        let (snap_idx, _) = self.last_snapshot();
        log_idx.max(snap_idx)
    }

    /// Most recent entry known, preferring the log over the snapshot.
    ///
    /// The two loads are not a single atomic snapshot; callers needing a
    /// consistent pair must not interleave writes on the same routine.
    pub fn last_entry(&self) -> (LogIndex, Term) {
        let (log_idx, log_term) = self.last_log();
        let (snap_idx, snap_term) = self.last_snapshot();
        if log_idx >= snap_idx {
            (log_idx, log_term)
        } else {
            (snap_idx, snap_term)
        }
    }
}

impl Default for RaftState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state() {
        let state = RaftState::new();
        assert_eq!(state.role(), Role::Follower);
        assert_eq!(state.current_term(), Term::ZERO);
        assert_eq!(state.commit_index(), LogIndex::ZERO);
        assert_eq!(state.last_applied(), LogIndex::ZERO);
        assert_eq!(state.last_entry(), (LogIndex::ZERO, Term::ZERO));
    }

    #[test]
    fn test_last_entry_prefers_newer_snapshot() {
        let state = RaftState::new();
        state.set_last_log(LogIndex(5), Term(2));
        assert_eq!(state.last_entry(), (LogIndex(5), Term(2)));

        state.set_last_snapshot(LogIndex(9), Term(3));
        assert_eq!(state.last_entry(), (LogIndex(9), Term(3)));
        assert_eq!(state.last_index(), LogIndex(9));

        state.set_last_log(LogIndex(12), Term(3));
        assert_eq!(state.last_entry(), (LogIndex(12), Term(3)));
    }

    #[test]
    fn test_role_transitions() {
        let state = RaftState::new();
        state.set_role(Role::Candidate);
        assert_eq!(state.role(), Role::Candidate);
        state.set_role(Role::Leader);
        assert_eq!(state.role(), Role::Leader);
        state.set_role(Role::Shutdown);
        assert_eq!(state.role(), Role::Shutdown);
    }
}
