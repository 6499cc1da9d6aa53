//! The Raft node: public API, role loops, log dispatch, and the apply
//! pipeline.
//!
//! Three long-running tasks cooperate: the role loop (sole owner of role
//! transitions and the peer set), the FSM runner (sole invoker of the
//! caller's FSM), and the snapshot manager. While leading, one replication
//! task runs per peer; commit progress flows back through the inflight
//! tracker onto the leader's commit channel.

use crate::config::{random_timeout, Config};
use crate::error::{RaftError, Result};
use crate::fsm::{CommitTuple, Fsm, FsmRunner, RestoreRequest};
use crate::future::{op_future, ApplyFuture, LogFuture, OpFuture, Responder};
use crate::inflight::{Inflight, QuorumPolicy};
use crate::peers::{decode_peers, encode_peers, exclude_peer, peer_contained, PeerStore};
use crate::replication::{FollowerReplication, ReplicationHandle};
use crate::snapshot::{SnapshotRunner, SnapshotStore};
use crate::state::RaftState;
use crate::storage::{LogStore, StableStore};
use crate::transport::{RpcReceiver, Transport};
use crate::types::*;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub(crate) const KEY_CURRENT_TERM: &[u8] = b"CurrentTerm";
pub(crate) const KEY_LAST_VOTE_TERM: &[u8] = b"LastVoteTerm";
pub(crate) const KEY_LAST_VOTE_CAND: &[u8] = b"LastVoteCand";

/// Broadcast-backed shutdown signal shared by every task.
///
/// `initiate` is idempotent; loops either receive the broadcast or observe
/// the flag on their next iteration.
pub(crate) struct Shutdown {
    flag: AtomicBool,
    notify: broadcast::Sender<()>,
}

impl Shutdown {
    pub(crate) fn new() -> Arc<Shutdown> {
        let (notify, _) = broadcast::channel(4);
        Arc::new(Shutdown {
            flag: AtomicBool::new(false),
            notify,
        })
    }

    /// Returns true on the first call only.
    pub(crate) fn initiate(&self) -> bool {
        if self.flag.swap(true, Ordering::SeqCst) {
            return false;
        }
        let _ = self.notify.send(());
        true
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<()> {
        self.notify.subscribe()
    }
}

/// Leader-only state, created on election and torn down on step-down.
pub(crate) struct LeaderState {
    pub(crate) inflight: Arc<Inflight>,
    pub(crate) repl_state: HashMap<String, ReplicationHandle>,
    pub(crate) stepdown_tx: mpsc::Sender<Term>,
}

/// A Raft consensus node.
///
/// Construction restores durable state, replays the newest usable
/// snapshot into the FSM, and spawns the background tasks. All client
/// operations return one-shot futures; only the leader accepts writes.
pub struct Raft {
    local_addr: NodeId,
    state: Arc<RaftState>,
    leader: Arc<RwLock<Option<NodeId>>>,
    apply_tx: mpsc::Sender<LogFuture>,
    snapshot_tx: mpsc::Sender<Responder<()>>,
    shutdown: Arc<Shutdown>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Raft {
    /// Construct and start a Raft node.
    ///
    /// Must be called from within a Tokio runtime: the role loop, FSM
    /// runner, and snapshot manager are spawned here. `rpc_rx` is the
    /// transport's inbound RPC stream.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        conf: Config,
        mut fsm: Box<dyn Fsm>,
        logs: Arc<dyn LogStore>,
        stable: Arc<dyn StableStore>,
        snapshots: Arc<dyn SnapshotStore>,
        peer_store: Arc<dyn PeerStore>,
        trans: Arc<dyn Transport>,
        rpc_rx: RpcReceiver,
    ) -> Result<Raft> {
        conf.validate()
            .map_err(|reason| RaftError::InvalidConfig { reason })?;

        // Restore the current term; absence means a fresh node.
        let current_term = match stable.get_u64(KEY_CURRENT_TERM) {
            Ok(t) => Term(t),
            Err(e) if e.is_not_found() => Term::ZERO,
            Err(e) => return Err(e),
        };

        // Recover the tail of the log.
        let last_idx = logs.last_index()?;
        let mut last_log = (LogIndex::ZERO, Term::ZERO);
        if last_idx > LogIndex::ZERO {
            let entry = logs.get_log(last_idx)?;
            last_log = (entry.index, entry.term);
        }

        let local_addr = trans.local_addr();
        let mut peers = exclude_peer(&peer_store.peers()?, &local_addr);

        let state = Arc::new(RaftState::new());
        state.set_current_term_register(current_term);
        state.set_last_log(last_log.0, last_log.1);

        // Replay the newest usable snapshot into the FSM before any task
        // starts; its peer set wins over the peer store.
        if let Some(snapshot_peers) =
            restore_snapshot(fsm.as_mut(), snapshots.as_ref(), trans.as_ref(), &state)?
        {
            peers = exclude_peer(&snapshot_peers, &local_addr);
        }

        let (apply_tx, apply_rx) = mpsc::channel(64);
        let (fsm_commit_tx, fsm_commit_rx) = mpsc::channel(128);
        let (fsm_restore_tx, fsm_restore_rx) = mpsc::channel(1);
        let (fsm_snapshot_tx, fsm_snapshot_rx) = mpsc::channel(1);
        let (snapshot_tx, snapshot_user_rx) = mpsc::channel(1);

        let shutdown = Shutdown::new();
        let leader = Arc::new(RwLock::new(None));
        let conf = Arc::new(conf);

        let (snap_idx, snap_term) = state.last_snapshot();
        let fsm_runner = FsmRunner {
            fsm,
            commit_rx: fsm_commit_rx,
            restore_rx: fsm_restore_rx,
            snapshot_rx: fsm_snapshot_rx,
            snapshots: snapshots.clone(),
            peer_store: peer_store.clone(),
            shutdown: shutdown.clone(),
            last_index: snap_idx,
            last_term: snap_term,
        };

        let snapshot_runner = SnapshotRunner {
            conf: conf.clone(),
            state: state.clone(),
            logs: logs.clone(),
            snapshots: snapshots.clone(),
            trans: trans.clone(),
            fsm_snapshot_tx,
            user_rx: snapshot_user_rx,
            shutdown: shutdown.clone(),
        };

        let core = RaftCore {
            conf,
            state: state.clone(),
            logs,
            stable,
            snapshots,
            peer_store,
            trans,
            local_addr: local_addr.clone(),
            peers,
            leader: leader.clone(),
            rpc_rx,
            apply_rx,
            fsm_commit_tx,
            fsm_restore_tx,
            shutdown: shutdown.clone(),
            leader_state: None,
        };

        let handles = vec![
            tokio::spawn(core.run()),
            tokio::spawn(fsm_runner.run()),
            tokio::spawn(snapshot_runner.run()),
        ];

        Ok(Raft {
            local_addr,
            state,
            leader,
            apply_tx,
            snapshot_tx,
            shutdown,
            handles: Mutex::new(handles),
        })
    }

    /// Apply a command to the FSM through the replicated log.
    ///
    /// Fails with `NotLeader` on a non-leader, `EnqueueTimeout` if the
    /// role-loop intake is still full when `timeout` elapses, and
    /// `LeadershipLost` if leadership changes before commitment. The
    /// future resolves with the FSM's response only after application.
    pub async fn apply(&self, cmd: Bytes, timeout: Option<Duration>) -> ApplyFuture {
        if self.shutdown.is_shutdown() {
            return OpFuture::ready(Err(RaftError::RaftShutdown));
        }
        let (future, handle) = LogFuture::new(LogKind::Command, cmd, None);
        self.enqueue(future, handle, timeout).await
    }

    /// Add a peer to the cluster. Leader only; fails with `KnownPeer` if
    /// the target is already a member.
    pub async fn add_peer(&self, peer: NodeId) -> ApplyFuture {
        if self.shutdown.is_shutdown() {
            return OpFuture::ready(Err(RaftError::RaftShutdown));
        }
        let (future, handle) = LogFuture::new(LogKind::AddPeer, Bytes::new(), Some(peer));
        self.enqueue(future, handle, None).await
    }

    /// Remove a peer from the cluster. Leader only; fails with
    /// `UnknownPeer` if the target is not a member. Removing the leader
    /// itself commits without counting the leader's vote requirement on
    /// the departing node.
    pub async fn remove_peer(&self, peer: NodeId) -> ApplyFuture {
        if self.shutdown.is_shutdown() {
            return OpFuture::ready(Err(RaftError::RaftShutdown));
        }
        let (future, handle) = LogFuture::new(LogKind::RemovePeer, Bytes::new(), Some(peer));
        self.enqueue(future, handle, None).await
    }

    async fn enqueue(
        &self,
        future: LogFuture,
        handle: ApplyFuture,
        timeout: Option<Duration>,
    ) -> ApplyFuture {
        match timeout {
            Some(d) => match tokio::time::timeout(d, self.apply_tx.send(future)).await {
                Ok(Ok(())) => handle,
                Ok(Err(_)) => OpFuture::ready(Err(RaftError::RaftShutdown)),
                Err(_) => OpFuture::ready(Err(RaftError::EnqueueTimeout)),
            },
            None => match self.apply_tx.send(future).await {
                Ok(()) => handle,
                Err(_) => OpFuture::ready(Err(RaftError::RaftShutdown)),
            },
        }
    }

    /// Force a snapshot now, regardless of the threshold.
    pub async fn snapshot(&self) -> OpFuture<()> {
        if self.shutdown.is_shutdown() {
            return OpFuture::ready(Err(RaftError::RaftShutdown));
        }
        let (responder, handle) = op_future();
        match self.snapshot_tx.send(responder).await {
            Ok(()) => handle,
            Err(_) => OpFuture::ready(Err(RaftError::RaftShutdown)),
        }
    }

    /// Stop all background tasks. Idempotent; returns once every task has
    /// exited.
    pub async fn shutdown(&self) {
        if self.shutdown.initiate() {
            self.state.set_role(Role::Shutdown);
        }
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// Current cluster leader, if known.
    pub fn leader(&self) -> Option<NodeId> {
        self.leader.read().clone()
    }

    /// Current role of this node.
    pub fn state(&self) -> Role {
        self.state.role()
    }

    pub fn local_addr(&self) -> &NodeId {
        &self.local_addr
    }

    /// Highest log index known committed.
    pub fn commit_index(&self) -> LogIndex {
        self.state.commit_index()
    }

    /// Highest log index handed to the apply pipeline.
    pub fn last_applied(&self) -> LogIndex {
        self.state.last_applied()
    }
}

impl fmt::Display for Raft {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Node at {} [{}]", self.local_addr, self.state.role())
    }
}

/// Try snapshots newest-first; the first that restores wins. Startup
/// fails if snapshots existed but none restored.
fn restore_snapshot(
    fsm: &mut dyn Fsm,
    snapshots: &dyn SnapshotStore,
    trans: &dyn Transport,
    state: &RaftState,
) -> Result<Option<Vec<NodeId>>> {
    let metas = snapshots.list()?;
    let had_snapshots = !metas.is_empty();

    for meta in metas {
        let (meta, source) = match snapshots.open(&meta.id) {
            Ok(opened) => opened,
            Err(e) => {
                error!(id = %meta.id, error = %e, "failed to open snapshot");
                continue;
            }
        };

        if let Err(e) = fsm.restore(source) {
            error!(id = %meta.id, error = %e, "failed to restore snapshot");
            continue;
        }

        info!(id = %meta.id, index = %meta.index, "restored from snapshot");
        state.set_last_applied(meta.index);
        state.set_last_snapshot(meta.index, meta.term);
        let peer_set = decode_peers(&meta.peers, trans)?;
        return Ok(Some(peer_set));
    }

    if had_snapshots {
        return Err(RaftError::SnapshotFailed {
            reason: "failed to load any existing snapshot".to_string(),
        });
    }
    Ok(None)
}

/// Role-loop state: everything the main task owns.
pub(crate) struct RaftCore {
    pub(crate) conf: Arc<Config>,
    pub(crate) state: Arc<RaftState>,
    pub(crate) logs: Arc<dyn LogStore>,
    pub(crate) stable: Arc<dyn StableStore>,
    pub(crate) snapshots: Arc<dyn SnapshotStore>,
    pub(crate) peer_store: Arc<dyn PeerStore>,
    pub(crate) trans: Arc<dyn Transport>,
    pub(crate) local_addr: NodeId,
    pub(crate) peers: Vec<NodeId>,
    pub(crate) leader: Arc<RwLock<Option<NodeId>>>,
    pub(crate) rpc_rx: RpcReceiver,
    pub(crate) apply_rx: mpsc::Receiver<LogFuture>,
    pub(crate) fsm_commit_tx: mpsc::Sender<CommitTuple>,
    pub(crate) fsm_restore_tx: mpsc::Sender<RestoreRequest>,
    pub(crate) shutdown: Arc<Shutdown>,
    pub(crate) leader_state: Option<LeaderState>,
}

impl RaftCore {
    pub(crate) async fn run(mut self) {
        loop {
            if self.shutdown.is_shutdown() {
                self.state.set_role(Role::Shutdown);
            }
            match self.state.role() {
                Role::Follower => self.run_follower().await,
                Role::Candidate => self.run_candidate().await,
                Role::Leader => self.run_leader().await,
                Role::Shutdown => return,
            }
        }
    }

    async fn run_follower(&mut self) {
        info!(node = %self.local_addr, "entering follower state");
        let mut shutdown_rx = self.shutdown.subscribe();

        while self.state.role() == Role::Follower {
            tokio::select! {
                rpc = self.rpc_rx.recv() => {
                    match rpc {
                        Some(rpc) => self.process_rpc(rpc).await,
                        None => {
                            // Transport gone; nothing left to drive us.
                            self.state.set_role(Role::Shutdown);
                            return;
                        }
                    }
                }
                Some(mut future) = self.apply_rx.recv() => {
                    future.respond(Err(RaftError::NotLeader));
                }
                _ = tokio::time::sleep(random_timeout(self.conf.heartbeat_timeout)) => {
                    warn!(node = %self.local_addr, "heartbeat timeout reached, starting election");
                    *self.leader.write() = None;
                    self.state.set_role(Role::Candidate);
                    return;
                }
                _ = shutdown_rx.recv() => {
                    self.state.set_role(Role::Shutdown);
                    return;
                }
            }
        }
    }

    async fn run_candidate(&mut self) {
        info!(node = %self.local_addr, "entering candidate state");

        let Some(mut vote_rx) = self.elect_self() else {
            // Durable-write failure during election start; fatal path
            // already initiated shutdown.
            return;
        };

        let votes_needed = (self.peers.len() + 1) / 2 + 1;
        let mut granted_votes = 0usize;
        debug!(needed = votes_needed, "votes needed");

        let election_timer = tokio::time::sleep(random_timeout(self.conf.election_timeout));
        tokio::pin!(election_timer);
        let mut shutdown_rx = self.shutdown.subscribe();

        while self.state.role() == Role::Candidate {
            tokio::select! {
                rpc = self.rpc_rx.recv() => {
                    match rpc {
                        Some(rpc) => self.process_rpc(rpc).await,
                        None => {
                            self.state.set_role(Role::Shutdown);
                            return;
                        }
                    }
                }
                Some(vote) = vote_rx.recv() => {
                    if vote.term > self.state.current_term() {
                        debug!("newer term discovered, falling back to follower");
                        self.state.set_role(Role::Follower);
                        let _ = self.set_current_term(vote.term);
                        return;
                    }

                    if vote.granted {
                        granted_votes += 1;
                        debug!(tally = granted_votes, "vote granted");
                    }

                    if granted_votes >= votes_needed {
                        info!(tally = granted_votes, "election won");
                        *self.leader.write() = Some(self.local_addr.clone());
                        self.state.set_role(Role::Leader);
                        return;
                    }
                }
                Some(mut future) = self.apply_rx.recv() => {
                    future.respond(Err(RaftError::NotLeader));
                }
                _ = &mut election_timer => {
                    // Returning re-enters the candidate state in a new term.
                    warn!("election timeout reached, restarting election");
                    return;
                }
                _ = shutdown_rx.recv() => {
                    self.state.set_role(Role::Shutdown);
                    return;
                }
            }
        }
    }

    /// Increment the term, vote for ourselves, and fan RequestVote out to
    /// every peer. The returned channel is seeded with our own granted
    /// vote; `None` means a fatal durable-write failure.
    fn elect_self(&mut self) -> Option<mpsc::Receiver<RequestVoteResponse>> {
        let (tx, rx) = mpsc::channel(self.peers.len() + 1);

        let term = self.state.current_term().bump();
        if self.set_current_term(term).is_err() {
            return None;
        }

        let (last_log_index, last_log_term) = self.state.last_entry();
        let req = RequestVoteRequest {
            term,
            candidate: self.trans.encode_peer(&self.local_addr),
            last_log_index,
            last_log_term,
        };

        for peer in self.peers.clone() {
            let trans = self.trans.clone();
            let req = req.clone();
            let tx = tx.clone();
            let local_addr = self.local_addr.clone();
            tokio::spawn(async move {
                let resp = match trans.request_vote(&peer, req.clone()).await {
                    Ok(resp) => {
                        // A healthy peer should list us; if not, we may have
                        // been removed while partitioned.
                        if let Ok(peer_set) = decode_peers(&resp.peers, trans.as_ref()) {
                            if !peer_contained(&peer_set, &local_addr) {
                                warn!(peer = %peer, "remote peer does not have local node as a peer");
                            }
                        }
                        resp
                    }
                    Err(e) => {
                        warn!(peer = %peer, error = %e, "failed to make request vote RPC");
                        RequestVoteResponse {
                            term: req.term,
                            peers: Bytes::new(),
                            granted: false,
                        }
                    }
                };
                let _ = tx.send(resp).await;
            });
        }

        if self.persist_vote(term, &req.candidate).is_err() {
            return None;
        }

        // Our own vote.
        let _ = tx.try_send(RequestVoteResponse {
            term,
            peers: Bytes::new(),
            granted: true,
        });
        Some(rx)
    }

    async fn run_leader(&mut self) {
        info!(node = %self.local_addr, term = %self.state.current_term(), "entering leader state");

        let (commit_tx, mut commit_rx) = mpsc::channel(128);
        let (stepdown_tx, mut stepdown_rx) = mpsc::channel(8);
        self.leader_state = Some(LeaderState {
            inflight: Arc::new(Inflight::new(commit_tx)),
            repl_state: HashMap::new(),
            stepdown_tx,
        });

        for peer in self.peers.clone() {
            self.start_replication(peer);
        }

        // A no-op flushes the log through the new term, committing any
        // entries left over from previous leaders.
        let (noop, _noop_handle) = LogFuture::new(LogKind::Noop, Bytes::new(), None);
        self.dispatch_log(noop).await;

        self.leader_loop(&mut commit_rx, &mut stepdown_rx).await;

        // Step-down teardown: stop replicators, fail what's in flight.
        if let Some(leader_state) = self.leader_state.take() {
            drop(leader_state.repl_state);
            leader_state
                .inflight
                .cancel(|| RaftError::LeadershipLost)
                .await;
        }
    }

    async fn leader_loop(
        &mut self,
        commit_rx: &mut mpsc::Receiver<LogFuture>,
        stepdown_rx: &mut mpsc::Receiver<Term>,
    ) {
        let mut shutdown_rx = self.shutdown.subscribe();

        while self.state.role() == Role::Leader {
            tokio::select! {
                rpc = self.rpc_rx.recv() => {
                    match rpc {
                        Some(rpc) => self.process_rpc(rpc).await,
                        None => {
                            self.state.set_role(Role::Shutdown);
                            return;
                        }
                    }
                }
                Some(committed) = commit_rx.recv() => {
                    let index = committed.entry.index;
                    self.state.set_commit_index(index);
                    self.process_logs(index, Some(committed)).await;
                }
                Some(term) = stepdown_rx.recv() => {
                    if term > self.state.current_term() {
                        debug!(term = %term, "newer term discovered via replication, stepping down");
                        self.state.set_role(Role::Follower);
                        let _ = self.set_current_term(term);
                        return;
                    }
                }
                Some(mut future) = self.apply_rx.recv() => {
                    if matches!(future.entry.kind, LogKind::AddPeer | LogKind::RemovePeer)
                        && !self.prepare_peer_change(&mut future)
                    {
                        continue;
                    }
                    self.dispatch_log(future).await;
                }
                _ = shutdown_rx.recv() => {
                    self.state.set_role(Role::Shutdown);
                    return;
                }
            }
        }
    }

    fn start_replication(&mut self, peer: NodeId) {
        let Some(leader_state) = self.leader_state.as_mut() else {
            return;
        };

        let (stop_tx, stop_rx) = mpsc::channel(1);
        let (trigger_tx, trigger_rx) = mpsc::channel(1);

        let replication = FollowerReplication {
            peer: peer.clone(),
            conf: self.conf.clone(),
            state: self.state.clone(),
            logs: self.logs.clone(),
            snapshots: self.snapshots.clone(),
            trans: self.trans.clone(),
            inflight: leader_state.inflight.clone(),
            current_term: self.state.current_term(),
            next_index: self.state.last_index().succ(),
            match_index: LogIndex::ZERO,
            stop_rx,
            trigger_rx,
            stepdown_tx: leader_state.stepdown_tx.clone(),
        };

        leader_state.repl_state.insert(
            peer.as_str().to_string(),
            ReplicationHandle {
                peer,
                stop_tx,
                trigger_tx,
            },
        );
        tokio::spawn(replication.run());
    }

    /// Validate a membership change and encode the post-change peer set
    /// into the entry. Returns false (after answering the future) when the
    /// change is rejected.
    fn prepare_peer_change(&mut self, future: &mut LogFuture) -> bool {
        let Some(target) = future.peer.clone() else {
            future.respond(Err(RaftError::UnknownPeer));
            return false;
        };

        let known = peer_contained(&self.peers, &target) || target == self.local_addr;

        if future.entry.kind == LogKind::AddPeer && known {
            future.respond(Err(RaftError::KnownPeer));
            return false;
        }
        if future.entry.kind == LogKind::RemovePeer && !known {
            future.respond(Err(RaftError::UnknownPeer));
            return false;
        }

        let peer_set: Vec<NodeId> = if future.entry.kind == LogKind::AddPeer {
            let mut set = vec![target.clone(), self.local_addr.clone()];
            set.extend(self.peers.iter().cloned());
            set
        } else {
            let mut set = vec![self.local_addr.clone()];
            set.extend(self.peers.iter().cloned());
            exclude_peer(&set, &target)
        };

        match encode_peers(&peer_set, self.trans.as_ref()) {
            Ok(data) => future.entry.data = data,
            Err(e) => {
                future.respond(Err(e));
                return false;
            }
        }

        // The departing node's acknowledgement must not be required for
        // its own removal to commit.
        if future.entry.kind == LogKind::RemovePeer {
            future.policy = Some(QuorumPolicy::exclude_node(self.peers.len() + 1, target));
        }
        true
    }

    /// Assign an index and term, persist locally, register with the
    /// inflight tracker, and wake the replicators.
    async fn dispatch_log(&mut self, mut future: LogFuture) {
        let index = self.state.last_index().succ();
        let term = self.state.current_term();
        future.entry.index = index;
        future.entry.term = term;

        if let Err(e) = self.logs.store_log(&future.entry) {
            // A leader that cannot persist its own log cannot safely lead.
            error!(error = %e, "failed to commit log locally");
            future.respond(Err(e));
            self.state.set_role(Role::Follower);
            return;
        }

        if future.policy.is_none() {
            future.policy = Some(QuorumPolicy::majority(self.peers.len() + 1));
        }

        let Some(leader_state) = self.leader_state.as_ref() else {
            return;
        };
        leader_state.inflight.start(future).await;
        leader_state.inflight.commit(index, &self.local_addr).await;

        self.state.set_last_log(index, term);

        for handle in leader_state.repl_state.values() {
            handle.notify();
        }
    }

    /// Apply pipeline: run every committed-but-unapplied entry through
    /// `process_log`, in index order with no gaps.
    pub(crate) async fn process_logs(&mut self, index: LogIndex, future: Option<LogFuture>) {
        let last_applied = self.state.last_applied();
        if index <= last_applied {
            warn!(index = %index, "skipping application of old log");
            return;
        }

        let mut future = future;
        for idx in (last_applied.0 + 1)..=index.0 {
            let idx = LogIndex(idx);

            let from_future = future
                .as_ref()
                .map(|f| f.entry.index == idx)
                .unwrap_or(false);
            if from_future {
                if let Some(f) = future.take() {
                    let entry = f.entry.clone();
                    self.process_log(entry, Some(f)).await;
                }
            } else {
                match self.logs.get_log(idx) {
                    Ok(entry) => self.process_log(entry, None).await,
                    Err(e) => {
                        // Committed but unreadable: the log is corrupt.
                        self.fatal("failed to get log during apply", &e);
                        return;
                    }
                }
            }

            self.state.set_last_applied(idx);
        }
    }

    /// Apply one committed entry by kind. Command futures are answered by
    /// the FSM runner after application; everything else is answered here.
    async fn process_log(&mut self, entry: LogEntry, mut future: Option<LogFuture>) {
        match entry.kind {
            LogKind::Command => {
                let responder = future.as_mut().and_then(|f| f.responder.take());
                let tuple = CommitTuple { entry, responder };
                if let Err(send_err) = self.fsm_commit_tx.send(tuple).await {
                    let mut tuple = send_err.0;
                    if let Some(responder) = tuple.responder.as_mut() {
                        responder.respond(Err(RaftError::RaftShutdown));
                    }
                }
                // The future is answered only once the FSM has applied
                // the command.
                return;
            }

            LogKind::AddPeer => match decode_peers(&entry.data, self.trans.as_ref()) {
                Ok(peer_set) => {
                    debug!(node = %self.local_addr, peers = ?peer_set, "updated peer set (add)");
                    self.peers = exclude_peer(&peer_set, &self.local_addr);
                    if let Err(e) = self.peer_store.set_peers(&peer_set) {
                        error!(error = %e, "failed to persist peer set");
                    }

                    if self.state.role() == Role::Leader {
                        let missing: Vec<NodeId> = self
                            .peers
                            .iter()
                            .filter(|p| {
                                self.leader_state
                                    .as_ref()
                                    .map(|ls| !ls.repl_state.contains_key(p.as_str()))
                                    .unwrap_or(false)
                            })
                            .cloned()
                            .collect();
                        for peer in missing {
                            info!(peer = %peer, "added peer, starting replication");
                            self.start_replication(peer);
                        }
                    }
                }
                Err(e) => error!(error = %e, "failed to decode peer set"),
            },

            LogKind::RemovePeer => match decode_peers(&entry.data, self.trans.as_ref()) {
                Ok(peer_set) => {
                    debug!(node = %self.local_addr, peers = ?peer_set, "updated peer set (remove)");
                    let remove_self = !peer_contained(&peer_set, &self.local_addr);

                    if remove_self {
                        self.peers.clear();
                        if let Err(e) = self.peer_store.set_peers(&[self.local_addr.clone()]) {
                            error!(error = %e, "failed to persist peer set");
                        }
                    } else {
                        self.peers = exclude_peer(&peer_set, &self.local_addr);
                        if let Err(e) = self.peer_store.set_peers(&peer_set) {
                            error!(error = %e, "failed to persist peer set");
                        }
                    }

                    if self.state.role() == Role::Leader {
                        if let Some(leader_state) = self.leader_state.as_mut() {
                            let stale: Vec<String> = leader_state
                                .repl_state
                                .values()
                                .filter(|h| !peer_contained(&self.peers, &h.peer))
                                .map(|h| h.peer.as_str().to_string())
                                .collect();
                            for key in stale {
                                if let Some(handle) = leader_state.repl_state.remove(&key) {
                                    info!(peer = %handle.peer, "removed peer, stopping replication");
                                    // Let the departing peer learn of its
                                    // own removal before we cut it off.
                                    handle.stop_at(entry.index);
                                }
                            }
                        }
                    }

                    if remove_self {
                        if self.conf.shutdown_on_remove {
                            info!("removed ourself, shutting down");
                            self.state.set_role(Role::Shutdown);
                            self.shutdown.initiate();
                        } else {
                            info!("removed ourself, transitioning to follower");
                            self.state.set_role(Role::Follower);
                        }
                    }
                }
                Err(e) => error!(error = %e, "failed to decode peer set"),
            },

            LogKind::Noop => {}
        }

        if let Some(f) = future.as_mut() {
            f.respond(Ok(Bytes::new()));
        }
    }

    /// Durably persist the term, then update the cached register. A
    /// persistence failure is fatal: a stale in-memory term after a
    /// failed persist violates safety.
    pub(crate) fn set_current_term(&mut self, term: Term) -> Result<()> {
        if let Err(e) = self.stable.set_u64(KEY_CURRENT_TERM, term.0) {
            self.fatal("failed to save current term", &e);
            return Err(e);
        }
        self.state.set_current_term_register(term);
        Ok(())
    }

    /// Persist the vote before any response can leave the node.
    pub(crate) fn persist_vote(&mut self, term: Term, candidate: &[u8]) -> Result<()> {
        if let Err(e) = self.stable.set_u64(KEY_LAST_VOTE_TERM, term.0) {
            self.fatal("failed to persist vote term", &e);
            return Err(e);
        }
        if let Err(e) = self.stable.set(KEY_LAST_VOTE_CAND, candidate) {
            self.fatal("failed to persist vote candidate", &e);
            return Err(e);
        }
        Ok(())
    }

    /// Halt the node: continuing after a durable-write failure could
    /// elect two leaders in one term.
    pub(crate) fn fatal(&self, context: &str, err: &RaftError) {
        error!(error = %err, "{context}; halting node");
        self.state.set_role(Role::Shutdown);
        self.shutdown.initiate();
    }
}
