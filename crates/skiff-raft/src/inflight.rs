//! In-flight commit tracking for the leader.
//!
//! The tracker owns every leader-proposed entry between local append and
//! quorum commitment. Replicators report durable-append progress through
//! [`Inflight::commit`]; once an entry's quorum policy is satisfied it is
//! emitted on the commit channel in ascending index order.

use crate::error::RaftError;
use crate::future::LogFuture;
use crate::types::{LogIndex, NodeId};
use std::collections::{BTreeMap, HashSet};
use tokio::sync::{mpsc, Mutex};

/// Per-entry commitment rule.
///
/// The cluster size is fixed at proposal time, so a membership change in
/// flight does not retroactively change what older entries need.
pub(crate) enum QuorumPolicy {
    /// Committed once a strict majority of the cluster has durably
    /// appended the entry.
    Majority {
        votes: HashSet<NodeId>,
        required: usize,
    },

    /// Majority quorum where one node's vote never counts. Used for
    /// RemovePeer so the leader does not depend on the departing node.
    ExcludeNode {
        votes: HashSet<NodeId>,
        required: usize,
        excluded: NodeId,
    },
}

impl QuorumPolicy {
    pub(crate) fn majority(cluster_size: usize) -> QuorumPolicy {
        QuorumPolicy::Majority {
            votes: HashSet::new(),
            required: cluster_size / 2 + 1,
        }
    }

    /// Quorum is a majority of the cluster without the excluded node, so
    /// a departing peer (including the leader itself) is never needed for
    /// its own removal to commit.
    pub(crate) fn exclude_node(cluster_size: usize, excluded: NodeId) -> QuorumPolicy {
        QuorumPolicy::ExcludeNode {
            votes: HashSet::new(),
            required: (cluster_size - 1) / 2 + 1,
            excluded,
        }
    }

    /// Record a durable-append vote. Returns true once the entry has
    /// reached quorum.
    pub(crate) fn record_vote(&mut self, voter: &NodeId) -> bool {
        match self {
            QuorumPolicy::Majority { votes, required } => {
                votes.insert(voter.clone());
                votes.len() >= *required
            }
            QuorumPolicy::ExcludeNode {
                votes,
                required,
                excluded,
            } => {
                if voter != excluded {
                    votes.insert(voter.clone());
                }
                votes.len() >= *required
            }
        }
    }
}

struct InflightLog {
    future: LogFuture,
    committed: bool,
}

/// Tracks outstanding leader logs and emits them on the commit channel
/// once their quorum policy is satisfied.
pub(crate) struct Inflight {
    logs: Mutex<BTreeMap<u64, InflightLog>>,
    commit_tx: mpsc::Sender<LogFuture>,
}

impl Inflight {
    pub(crate) fn new(commit_tx: mpsc::Sender<LogFuture>) -> Inflight {
        Inflight {
            logs: Mutex::new(BTreeMap::new()),
            commit_tx,
        }
    }

    /// Register a dispatched entry. Its policy starts with an empty vote
    /// set; the leader votes for itself right after the local append.
    pub(crate) async fn start(&self, future: LogFuture) {
        let mut logs = self.logs.lock().await;
        logs.insert(
            future.entry.index.0,
            InflightLog {
                future,
                committed: false,
            },
        );
    }

    /// Record that `voter` has durably appended everything up to and
    /// including `index`, and emit newly committed entries in order.
    ///
    /// The lock is held across the channel sends so concurrent replicator
    /// callbacks cannot interleave out-of-order emissions.
    pub(crate) async fn commit(&self, index: LogIndex, voter: &NodeId) {
        let mut logs = self.logs.lock().await;

        for (_, inflight) in logs.range_mut(..=index.0) {
            if inflight.committed {
                continue;
            }
            if let Some(policy) = inflight.future.policy.as_mut() {
                if policy.record_vote(voter) {
                    inflight.committed = true;
                }
            }
        }

        // Emit from the front only: an entry committed out of order waits
        // for its predecessors.
        loop {
            let front = match logs.iter().next() {
                Some((&idx, inflight)) if inflight.committed => idx,
                _ => break,
            };
            if let Some(inflight) = logs.remove(&front) {
                if let Err(send_err) = self.commit_tx.send(inflight.future).await {
                    let mut future = send_err.0;
                    future.respond(Err(RaftError::LeadershipLost));
                    return;
                }
            }
        }
    }

    /// Fail every outstanding future. Called on leader step-down.
    pub(crate) async fn cancel(&self, err: fn() -> RaftError) {
        let mut logs = self.logs.lock().await;
        for (_, mut inflight) in std::mem::take(&mut *logs) {
            inflight.future.respond(Err(err()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{LogEntry, LogKind, Term};
    use bytes::Bytes;

    fn log_future(index: u64, policy: QuorumPolicy) -> (LogFuture, crate::future::ApplyFuture) {
        let (mut future, handle) = LogFuture::new(LogKind::Command, Bytes::from("cmd"), None);
        future.entry = LogEntry::new(LogIndex(index), Term(1), LogKind::Command, Bytes::new());
        future.policy = Some(policy);
        (future, handle)
    }

    #[test]
    fn test_majority_policy_thresholds() {
        let mut policy = QuorumPolicy::majority(3);
        assert!(!policy.record_vote(&NodeId::from("n1")));
        assert!(policy.record_vote(&NodeId::from("n2")));

        // Duplicate votes do not double-count.
        let mut policy = QuorumPolicy::majority(3);
        assert!(!policy.record_vote(&NodeId::from("n1")));
        assert!(!policy.record_vote(&NodeId::from("n1")));
    }

    #[test]
    fn test_exclude_node_policy_ignores_excluded() {
        let mut policy = QuorumPolicy::exclude_node(3, NodeId::from("n3"));
        assert!(!policy.record_vote(&NodeId::from("n3")));
        assert!(!policy.record_vote(&NodeId::from("n3")));
        assert!(!policy.record_vote(&NodeId::from("n1")));
        assert!(policy.record_vote(&NodeId::from("n2")));
    }

    #[test]
    fn test_exclude_node_policy_self_removal_from_pair() {
        // Removing the leader from a two-node cluster must commit on the
        // surviving node's vote alone.
        let mut policy = QuorumPolicy::exclude_node(2, NodeId::from("n1"));
        assert!(!policy.record_vote(&NodeId::from("n1")));
        assert!(policy.record_vote(&NodeId::from("n2")));
    }

    #[tokio::test]
    async fn test_commit_emits_after_quorum() {
        let (tx, mut rx) = mpsc::channel(8);
        let inflight = Inflight::new(tx);

        let (future, _handle) = log_future(1, QuorumPolicy::majority(3));
        inflight.start(future).await;

        inflight.commit(LogIndex(1), &NodeId::from("n1")).await;
        assert!(rx.try_recv().is_err());

        inflight.commit(LogIndex(1), &NodeId::from("n2")).await;
        let committed = rx.try_recv().unwrap();
        assert_eq!(committed.entry.index, LogIndex(1));
    }

    #[tokio::test]
    async fn test_commit_emits_in_ascending_order() {
        let (tx, mut rx) = mpsc::channel(8);
        let inflight = Inflight::new(tx);

        // Entry 2 needs one vote, entry 1 needs two: entry 2 reaches
        // quorum first but must wait for entry 1.
        let (f1, _h1) = log_future(1, QuorumPolicy::majority(3));
        let (f2, _h2) = log_future(2, QuorumPolicy::majority(1));
        inflight.start(f1).await;
        inflight.start(f2).await;

        inflight.commit(LogIndex(2), &NodeId::from("n1")).await;
        assert!(rx.try_recv().is_err());

        inflight.commit(LogIndex(2), &NodeId::from("n2")).await;
        assert_eq!(rx.try_recv().unwrap().entry.index, LogIndex(1));
        assert_eq!(rx.try_recv().unwrap().entry.index, LogIndex(2));
    }

    #[tokio::test]
    async fn test_cancel_fails_outstanding_futures() {
        let (tx, _rx) = mpsc::channel(8);
        let inflight = Inflight::new(tx);

        let (future, handle) = log_future(1, QuorumPolicy::majority(3));
        inflight.start(future).await;
        inflight.cancel(|| RaftError::LeadershipLost).await;

        assert!(matches!(
            handle.wait().await,
            Err(RaftError::LeadershipLost)
        ));
    }
}
