//! Inbound RPC processing.
//!
//! The role loop dispatches every inbound [`Rpc`] envelope here, whatever
//! role it is in. Handling any RPC whose term is newer than ours adopts
//! the term and drops to follower before the response is produced.

use crate::future::op_future;
use crate::fsm::RestoreRequest;
use crate::peers::{decode_peers, encode_peers, exclude_peer};
use crate::raft::RaftCore;
use crate::snapshot::compact_logs;
use crate::transport::Rpc;
use crate::types::*;
use bytes::Bytes;
use tracing::{error, info, warn};

impl RaftCore {
    /// Dispatch one inbound RPC to its handler and answer it.
    pub(crate) async fn process_rpc(&mut self, rpc: Rpc) {
        match rpc {
            Rpc::AppendEntries { req, tx } => {
                let resp = self.append_entries(req).await;
                let _ = tx.send(resp);
            }
            Rpc::RequestVote { req, tx } => {
                let resp = self.request_vote(req);
                let _ = tx.send(resp);
            }
            Rpc::InstallSnapshot { req, source, tx } => {
                let resp = self.install_snapshot(req, source).await;
                let _ = tx.send(resp);
            }
        }
    }

    /// AppendEntries: heartbeat and log replication from the leader.
    async fn append_entries(&mut self, req: AppendEntriesRequest) -> AppendEntriesResponse {
        let mut resp = AppendEntriesResponse {
            term: self.state.current_term(),
            last_log: self.state.last_index(),
            success: false,
        };

        // Ignore an older term.
        if req.term < self.state.current_term() {
            return resp;
        }

        // A newer term, or any AppendEntries while not a follower, drops
        // us back to follower.
        if req.term > self.state.current_term() || self.state.role() != Role::Follower {
            self.state.set_role(Role::Follower);
            if self.set_current_term(req.term).is_err() {
                return resp;
            }
            resp.term = req.term;
        }

        *self.leader.write() = Some(self.trans.decode_peer(&req.leader));

        // Verify the entry preceding the new batch.
        if req.prev_log_index > LogIndex::ZERO {
            let (last_idx, last_term) = self.state.last_entry();
            let prev_term = if req.prev_log_index == last_idx {
                last_term
            } else {
                match self.logs.get_log(req.prev_log_index) {
                    Ok(entry) => entry.term,
                    Err(e) => {
                        warn!(index = %req.prev_log_index, error = %e, "failed to get previous log");
                        return resp;
                    }
                }
            };
            if prev_term != req.prev_log_term {
                warn!(ours = %prev_term, remote = %req.prev_log_term, "previous log term mismatch");
                return resp;
            }
        }

        // Append, discarding any conflicting suffix first.
        for entry in &req.entries {
            let (last_log_idx, _) = self.state.last_log();
            if entry.index <= last_log_idx {
                warn!(from = %entry.index, to = %last_log_idx, "clearing log suffix");
                if let Err(e) = self.logs.delete_range(entry.index, last_log_idx) {
                    error!(error = %e, "failed to clear log suffix");
                    return resp;
                }
            }

            if let Err(e) = self.logs.store_log(entry) {
                error!(error = %e, "failed to append to log");
                return resp;
            }
            self.state.set_last_log(entry.index, entry.term);
        }

        // Advance our commit index to the leader's, bounded by what we
        // actually hold, and run the apply pipeline up to it.
        if req.leader_commit > LogIndex::ZERO && req.leader_commit > self.state.commit_index() {
            let idx = req.leader_commit.min(self.state.last_index());
            self.state.set_commit_index(idx);
            self.process_logs(idx, None).await;
        }

        resp.success = true;
        resp
    }

    /// RequestVote: grant at most one vote per term, persisted before the
    /// response leaves. A duplicate request from the candidate we already
    /// voted for is granted again without touching persisted state.
    fn request_vote(&mut self, req: RequestVoteRequest) -> RequestVoteResponse {
        let peers = encode_peers(&self.peers, self.trans.as_ref()).unwrap_or_else(|_| Bytes::new());
        let mut resp = RequestVoteResponse {
            term: self.state.current_term(),
            peers,
            granted: false,
        };

        if req.term < self.state.current_term() {
            return resp;
        }

        if req.term > self.state.current_term() {
            self.state.set_role(Role::Follower);
            if self.set_current_term(req.term).is_err() {
                return resp;
            }
            resp.term = req.term;
        }

        let last_vote_term = match self.stable.get_u64(crate::raft::KEY_LAST_VOTE_TERM) {
            Ok(t) => Some(Term(t)),
            Err(e) if e.is_not_found() => None,
            Err(e) => {
                error!(error = %e, "failed to get last vote term");
                return resp;
            }
        };
        let last_vote_cand = match self.stable.get(crate::raft::KEY_LAST_VOTE_CAND) {
            Ok(c) => Some(c),
            Err(e) if e.is_not_found() => None,
            Err(e) => {
                error!(error = %e, "failed to get last vote candidate");
                return resp;
            }
        };

        // Already voted in this term: idempotent for the same candidate,
        // rejection for anyone else.
        if last_vote_term == Some(req.term) {
            if let Some(cand) = last_vote_cand {
                info!(term = %req.term, "duplicate request vote for same term");
                if cand == req.candidate {
                    warn!("duplicate request vote from same candidate, granting again");
                    resp.granted = true;
                }
                return resp;
            }
        }

        // Up-to-date check: the candidate's log must be at least as
        // current as ours.
        let (last_idx, last_term) = self.state.last_entry();
        if last_term > req.last_log_term {
            warn!("rejecting vote since our last term is greater");
            return resp;
        }
        if last_term == req.last_log_term && last_idx > req.last_log_index {
            warn!("rejecting vote since our last index is greater");
            return resp;
        }

        if self.persist_vote(req.term, &req.candidate).is_err() {
            return resp;
        }

        resp.granted = true;
        resp
    }

    /// InstallSnapshot: spill the streamed snapshot into the local store,
    /// restore it into the FSM, adopt its peer set, and compact the log.
    async fn install_snapshot(
        &mut self,
        req: InstallSnapshotRequest,
        mut source: Box<dyn std::io::Read + Send>,
    ) -> InstallSnapshotResponse {
        let mut resp = InstallSnapshotResponse {
            term: self.state.current_term(),
            success: false,
        };

        if req.term < self.state.current_term() {
            return resp;
        }

        if req.term > self.state.current_term() {
            self.state.set_role(Role::Follower);
            if self.set_current_term(req.term).is_err() {
                return resp;
            }
            resp.term = req.term;
        }

        *self.leader.write() = Some(self.trans.decode_peer(&req.leader));

        let mut sink =
            match self
                .snapshots
                .create(req.last_log_index, req.last_log_term, req.peers.clone())
            {
                Ok(sink) => sink,
                Err(e) => {
                    error!(error = %e, "failed to create snapshot to install");
                    return resp;
                }
            };

        let copied = match std::io::copy(&mut source, &mut sink) {
            Ok(n) => n,
            Err(e) => {
                let _ = sink.cancel();
                error!(error = %e, "failed to copy snapshot");
                return resp;
            }
        };

        // A short (or long) stream aborts the attempt; no state advances
        // and the leader retries on a later cycle.
        if copied != req.size {
            let _ = sink.cancel();
            error!(received = copied, expected = req.size, "failed to receive whole snapshot");
            return resp;
        }

        let id = sink.id().to_string();
        if let Err(e) = sink.close() {
            error!(error = %e, "failed to finalize snapshot");
            return resp;
        }
        info!(bytes = copied, "copied snapshot to local store");

        // Hand the snapshot to the FSM runner and wait for the restore.
        let (responder, restore_done) = op_future();
        let restore = RestoreRequest { id, responder };
        let mut shutdown_rx = self.shutdown.subscribe();
        tokio::select! {
            res = self.fsm_restore_tx.send(restore) => {
                if res.is_err() {
                    return resp;
                }
            }
            _ = shutdown_rx.recv() => {
                return resp;
            }
        }
        if let Err(e) = restore_done.wait().await {
            error!(error = %e, "failed to restore snapshot");
            return resp;
        }

        self.state.set_last_applied(req.last_log_index);
        self.state.set_last_snapshot(req.last_log_index, req.last_log_term);

        match decode_peers(&req.peers, self.trans.as_ref()) {
            Ok(peer_set) => self.peers = exclude_peer(&peer_set, &self.local_addr),
            Err(e) => error!(error = %e, "failed to decode snapshot peer set"),
        }

        if let Err(e) = compact_logs(
            self.logs.as_ref(),
            &self.state,
            self.conf.trailing_logs,
            req.last_log_index,
        ) {
            error!(error = %e, "failed to compact logs");
        }

        info!("installed remote snapshot");
        resp.success = true;
        resp
    }
}
