//! Shared harness for integration tests: an observable list FSM and
//! helpers to spin up in-memory nodes and clusters.
#![allow(dead_code)]

use bytes::Bytes;
use parking_lot::Mutex;
use skiff_raft::{
    Config, Fsm, FsmSnapshot, InMemoryRouter, MemLogStore, MemPeerStore, MemSnapshotStore,
    MemStableStore, NodeId, Raft, Result, Role, SnapshotSink,
};
use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Duration;

/// FSM that records every applied command, observable from the test.
/// Snapshots serialize the full list.
pub struct TestFsm {
    pub applied: Arc<Mutex<Vec<Bytes>>>,
}

impl Fsm for TestFsm {
    fn apply(&mut self, data: &[u8]) -> Bytes {
        let mut applied = self.applied.lock();
        applied.push(Bytes::copy_from_slice(data));
        Bytes::from(format!("applied-{}", applied.len()))
    }

    fn snapshot(&mut self) -> Result<Box<dyn FsmSnapshot>> {
        let applied = self.applied.lock();
        let frozen: Vec<Vec<u8>> = applied.iter().map(|b| b.to_vec()).collect();
        Ok(Box::new(TestSnapshot { frozen }))
    }

    fn restore(&mut self, mut source: Box<dyn Read + Send>) -> Result<()> {
        let mut raw = Vec::new();
        source.read_to_end(&mut raw)?;
        let frozen: Vec<Vec<u8>> =
            bincode::deserialize(&raw).map_err(skiff_raft::RaftError::from)?;
        *self.applied.lock() = frozen.into_iter().map(Bytes::from).collect();
        Ok(())
    }
}

pub struct TestSnapshot {
    frozen: Vec<Vec<u8>>,
}

impl FsmSnapshot for TestSnapshot {
    fn persist(&self, sink: &mut dyn SnapshotSink) -> Result<()> {
        let raw = bincode::serialize(&self.frozen).map_err(skiff_raft::RaftError::from)?;
        sink.write_all(&raw)?;
        Ok(())
    }
}

/// One node plus handles to everything the tests observe.
pub struct ClusterNode {
    pub id: NodeId,
    pub raft: Arc<Raft>,
    pub applied: Arc<Mutex<Vec<Bytes>>>,
    pub logs: Arc<MemLogStore>,
    pub stable: Arc<MemStableStore>,
    pub snapshots: Arc<MemSnapshotStore>,
    pub peer_store: Arc<MemPeerStore>,
}

/// Timings tightened for tests; snapshots only when explicitly requested.
pub fn test_config() -> Config {
    Config {
        heartbeat_timeout: Duration::from_millis(150),
        election_timeout: Duration::from_millis(150),
        commit_timeout: Duration::from_millis(50),
        snapshot_interval: Duration::from_secs(3600),
        ..Config::default()
    }
}

pub fn spawn_node(router: &InMemoryRouter, id: &str, peers: &[&str], conf: Config) -> ClusterNode {
    let logs = Arc::new(MemLogStore::new());
    let stable = Arc::new(MemStableStore::new());
    let snapshots = Arc::new(MemSnapshotStore::new());
    let peer_store = Arc::new(MemPeerStore::new(
        peers.iter().map(|p| NodeId::from(*p)).collect(),
    ));
    spawn_node_with_stores(router, id, logs, stable, snapshots, peer_store, conf)
}

/// Restart-style spawn: reuse existing stores.
pub fn spawn_node_with_stores(
    router: &InMemoryRouter,
    id: &str,
    logs: Arc<MemLogStore>,
    stable: Arc<MemStableStore>,
    snapshots: Arc<MemSnapshotStore>,
    peer_store: Arc<MemPeerStore>,
    conf: Config,
) -> ClusterNode {
    let id = NodeId::from(id);
    let (trans, rpc_rx) = router.transport(id.clone());
    let applied = Arc::new(Mutex::new(Vec::new()));
    let fsm = Box::new(TestFsm {
        applied: applied.clone(),
    });

    let raft = Raft::new(
        conf,
        fsm,
        logs.clone(),
        stable.clone(),
        snapshots.clone(),
        peer_store.clone(),
        Arc::new(trans),
        rpc_rx,
    )
    .expect("raft construction");

    ClusterNode {
        id,
        raft: Arc::new(raft),
        applied,
        logs,
        stable,
        snapshots,
        peer_store,
    }
}

pub fn spawn_cluster(router: &InMemoryRouter, ids: &[&str], conf: Config) -> Vec<ClusterNode> {
    ids.iter()
        .map(|id| spawn_node(router, id, ids, conf.clone()))
        .collect()
}

/// Poll until some node reports itself leader; returns its position.
pub async fn wait_for_leader(nodes: &[ClusterNode], timeout: Duration) -> usize {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        for (i, node) in nodes.iter().enumerate() {
            if node.raft.state() == Role::Leader {
                return i;
            }
        }
        if tokio::time::Instant::now() > deadline {
            panic!("no leader elected within {:?}", timeout);
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

/// Poll a condition until it holds or the timeout expires.
pub async fn wait_until<F: Fn() -> bool>(cond: F, timeout: Duration, what: &str) {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if cond() {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("condition not reached within {:?}: {}", timeout, what);
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

pub fn applied_commands(node: &ClusterNode) -> Vec<Bytes> {
    node.applied.lock().clone()
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_test_writer()
        .try_init();
}
