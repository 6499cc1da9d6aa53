//! Per-peer log replication.
//!
//! While leading, one replication task runs per follower. Each task owns
//! its own `next_index`/`match_index` and drives AppendEntries toward its
//! peer, falling back to a full snapshot install when the entries it needs
//! have been compacted away. Commit progress flows back through the shared
//! inflight tracker; a newer term observed in a response is signalled to
//! the leader loop, which steps down.

use crate::config::Config;
use crate::error::{RaftError, Result};
use crate::inflight::Inflight;
use crate::snapshot::SnapshotStore;
use crate::state::RaftState;
use crate::storage::LogStore;
use crate::transport::Transport;
use crate::types::*;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Leader-side handle for one replication task.
///
/// Dropping the handle closes both channels, which stops the task
/// immediately. Sending an index on `stop_tx` instead asks the task to
/// replicate through that index before exiting, so a removed peer still
/// learns of its own removal.
pub(crate) struct ReplicationHandle {
    pub peer: NodeId,
    pub stop_tx: mpsc::Sender<LogIndex>,
    pub trigger_tx: mpsc::Sender<()>,
}

impl ReplicationHandle {
    /// Coalescing wake-up: many dispatches collapse into at most one
    /// pending notification.
    pub(crate) fn notify(&self) {
        let _ = self.trigger_tx.try_send(());
    }

    /// Ask the task to replicate through `last` and then exit.
    pub(crate) fn stop_at(&self, last: LogIndex) {
        let _ = self.stop_tx.try_send(last);
    }
}

enum RoundOutcome {
    /// Batch accepted; true when more entries remain below the target.
    Sent { more: bool },

    /// Retry on the next wake-up (transport error, consistency reject,
    /// or term signal).
    Backoff,

    /// The entries needed are gone from the log store; install a
    /// snapshot instead.
    NeedsSnapshot,
}

/// Replication task state for a single follower.
pub(crate) struct FollowerReplication {
    pub peer: NodeId,
    pub conf: Arc<Config>,
    pub state: Arc<RaftState>,
    pub logs: Arc<dyn LogStore>,
    pub snapshots: Arc<dyn SnapshotStore>,
    pub trans: Arc<dyn Transport>,
    pub inflight: Arc<Inflight>,

    /// Leader term captured when replication started; a response carrying
    /// a newer term ends this leadership.
    pub current_term: Term,

    pub next_index: LogIndex,
    pub match_index: LogIndex,

    pub stop_rx: mpsc::Receiver<LogIndex>,
    pub trigger_rx: mpsc::Receiver<()>,
    pub stepdown_tx: mpsc::Sender<Term>,
}

impl FollowerReplication {
    pub(crate) async fn run(mut self) {
        debug!(peer = %self.peer, "starting replication");
        loop {
            tokio::select! {
                stop = self.stop_rx.recv() => {
                    match stop {
                        Some(last) if last > LogIndex::ZERO => {
                            self.replicate(last).await;
                            debug!(peer = %self.peer, upto = %last, "replication stopped at index");
                            return;
                        }
                        _ => {
                            debug!(peer = %self.peer, "replication stopped");
                            return;
                        }
                    }
                }
                Some(()) = self.trigger_rx.recv() => {
                    let target = self.state.last_index();
                    self.replicate(target).await;
                }
                _ = tokio::time::sleep(self.conf.commit_timeout) => {
                    // Heartbeat pacing: even with nothing new to send, an
                    // empty AppendEntries keeps the follower from electing.
                    let target = self.state.last_index();
                    self.replicate(target).await;
                }
            }
        }
    }

    /// Push entries toward `target`, batching up to `max_append_entries`
    /// per RPC. An empty batch is the heartbeat.
    async fn replicate(&mut self, target: LogIndex) {
        loop {
            match self.append_round(target).await {
                RoundOutcome::Sent { more: true } => continue,
                RoundOutcome::Sent { more: false } | RoundOutcome::Backoff => return,
                RoundOutcome::NeedsSnapshot => {
                    if let Err(e) = self.send_snapshot().await {
                        warn!(peer = %self.peer, error = %e, "failed to install snapshot");
                    }
                    return;
                }
            }
        }
    }

    async fn append_round(&mut self, target: LogIndex) -> RoundOutcome {
        let req = match self.build_append_request(target) {
            Ok(req) => req,
            Err(e) if e.is_not_found() => return RoundOutcome::NeedsSnapshot,
            Err(e) => {
                warn!(peer = %self.peer, error = %e, "failed to build append entries");
                return RoundOutcome::Backoff;
            }
        };
        let sent = req.entries.len();
        let last_sent = req.entries.last().map(|e| e.index);

        let resp = match self.trans.append_entries(&self.peer, req).await {
            Ok(resp) => resp,
            Err(e) => {
                warn!(peer = %self.peer, error = %e, "append entries RPC failed");
                return RoundOutcome::Backoff;
            }
        };

        if resp.term > self.current_term {
            let _ = self.stepdown_tx.send(resp.term).await;
            return RoundOutcome::Backoff;
        }

        if !resp.success {
            // Consistency check failed: walk back one entry and retry on
            // the next cycle.
            self.next_index = LogIndex(self.next_index.0.saturating_sub(1).max(1));
            debug!(peer = %self.peer, next = %self.next_index, "append rejected, backing off");
            return RoundOutcome::Backoff;
        }

        if let Some(last_sent) = last_sent {
            self.next_index = last_sent.succ();
            if last_sent > self.match_index {
                self.match_index = last_sent;
                self.inflight.commit(self.match_index, &self.peer).await;
            }
        }

        RoundOutcome::Sent {
            more: sent > 0 && self.next_index <= target,
        }
    }

    fn build_append_request(&self, target: LogIndex) -> Result<AppendEntriesRequest> {
        let prev_log_index = self.next_index.pred();
        let prev_log_term = self.previous_term(prev_log_index)?;

        let mut entries = Vec::new();
        if self.next_index <= target {
            let batch_end = target
                .0
                .min(self.next_index.0 + self.conf.max_append_entries as u64 - 1);
            for idx in self.next_index.0..=batch_end {
                entries.push(self.logs.get_log(LogIndex(idx))?);
            }
        }

        Ok(AppendEntriesRequest {
            term: self.current_term,
            leader: self.trans.encode_peer(&self.trans.local_addr()),
            prev_log_index,
            prev_log_term,
            entries,
            leader_commit: self.state.commit_index(),
        })
    }

    fn previous_term(&self, prev: LogIndex) -> Result<Term> {
        if prev == LogIndex::ZERO {
            return Ok(Term::ZERO);
        }
        let (snap_idx, snap_term) = self.state.last_snapshot();
        if prev == snap_idx {
            return Ok(snap_term);
        }
        Ok(self.logs.get_log(prev)?.term)
    }

    /// The follower is behind the compaction horizon: stream it the
    /// latest snapshot, then resume appends right after the snapshot
    /// point.
    async fn send_snapshot(&mut self) -> Result<()> {
        let metas = self.snapshots.list()?;
        let Some(latest) = metas.into_iter().next() else {
            return Err(RaftError::SnapshotFailed {
                reason: "log truncated but no snapshot available".to_string(),
            });
        };
        let (meta, source) = self.snapshots.open(&latest.id)?;

        let req = InstallSnapshotRequest {
            term: self.current_term,
            leader: self.trans.encode_peer(&self.trans.local_addr()),
            last_log_index: meta.index,
            last_log_term: meta.term,
            peers: meta.peers.clone(),
            size: meta.size,
        };

        let resp = self.trans.install_snapshot(&self.peer, req, source).await?;

        if resp.term > self.current_term {
            let _ = self.stepdown_tx.send(resp.term).await;
            return Ok(());
        }

        if !resp.success {
            warn!(peer = %self.peer, "peer rejected snapshot install");
            return Ok(());
        }

        self.next_index = meta.index.succ();
        if meta.index > self.match_index {
            self.match_index = meta.index;
            self.inflight.commit(self.match_index, &self.peer).await;
        }
        info!(peer = %self.peer, index = %meta.index, "installed snapshot on follower");
        Ok(())
    }
}
