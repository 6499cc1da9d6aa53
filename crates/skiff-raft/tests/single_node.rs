//! Single-node integration tests: autocommit, snapshotting, and
//! restart-style recovery against the in-memory collaborators.

mod common;

use bytes::Bytes;
use common::*;
use skiff_raft::{Config, InMemoryRouter, LogIndex, LogStore, RaftError, Role, SnapshotStore};
use std::time::Duration;

#[tokio::test(flavor = "multi_thread")]
async fn test_single_node_autocommit() {
    init_tracing();
    let router = InMemoryRouter::new();
    let node = spawn_node(&router, "n1", &["n1"], test_config());

    // A one-node cluster elects itself.
    wait_until(
        || node.raft.state() == Role::Leader,
        Duration::from_secs(5),
        "self-election",
    )
    .await;

    let future = node
        .raft
        .apply(Bytes::from("x"), Some(Duration::from_secs(1)))
        .await;
    let resp = future.wait().await.expect("apply commits");
    assert_eq!(resp, Bytes::from("applied-1"));

    assert_eq!(applied_commands(&node), vec![Bytes::from("x")]);
    // Noop at index 1, the command at index 2.
    assert_eq!(node.raft.commit_index(), LogIndex(2));
    assert_eq!(node.raft.last_applied(), LogIndex(2));

    node.raft.shutdown().await;
    assert_eq!(node.raft.state(), Role::Shutdown);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_apply_rejected_without_leadership() {
    init_tracing();
    let router = InMemoryRouter::new();
    // Two-node configuration with the second node never started: this
    // node can never assemble a majority.
    let node = spawn_node(&router, "n1", &["n1", "n2"], test_config());

    let future = node
        .raft
        .apply(Bytes::from("x"), Some(Duration::from_secs(1)))
        .await;
    assert!(matches!(future.wait().await, Err(RaftError::NotLeader)));
    assert!(applied_commands(&node).is_empty());

    node.raft.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_user_snapshot_compacts_logs() {
    init_tracing();
    let router = InMemoryRouter::new();
    let conf = Config {
        trailing_logs: 0,
        ..test_config()
    };
    let node = spawn_node(&router, "n1", &["n1"], conf);

    wait_until(
        || node.raft.state() == Role::Leader,
        Duration::from_secs(5),
        "self-election",
    )
    .await;

    for i in 0..5 {
        let future = node
            .raft
            .apply(Bytes::from(format!("cmd-{}", i)), Some(Duration::from_secs(1)))
            .await;
        future.wait().await.expect("apply commits");
    }

    node.raft.snapshot().await.wait().await.expect("snapshot");

    let metas = node.snapshots.list().expect("list snapshots");
    assert_eq!(metas.len(), 1);
    // Noop at 1, commands at 2..=6; the snapshot covers the last command.
    assert_eq!(metas[0].index, LogIndex(6));

    // With no trailing logs everything before the snapshot point is gone.
    assert_eq!(node.logs.first_index().unwrap(), LogIndex(6));
    assert_eq!(node.logs.last_index().unwrap(), LogIndex(6));

    node.raft.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_restart_replays_committed_log() {
    init_tracing();
    let router = InMemoryRouter::new();
    let node = spawn_node(&router, "n1", &["n1"], test_config());

    wait_until(
        || node.raft.state() == Role::Leader,
        Duration::from_secs(5),
        "self-election",
    )
    .await;

    for cmd in ["a", "b"] {
        node.raft
            .apply(Bytes::from(cmd), Some(Duration::from_secs(1)))
            .await
            .wait()
            .await
            .expect("apply commits");
    }
    node.raft.shutdown().await;

    // Restart with the same durable stores but a fresh FSM: the new
    // leader's noop flushes the log and the old commands replay.
    let restarted = spawn_node_with_stores(
        &router,
        "n1",
        node.logs.clone(),
        node.stable.clone(),
        node.snapshots.clone(),
        node.peer_store.clone(),
        test_config(),
    );

    wait_until(
        || applied_commands(&restarted) == vec![Bytes::from("a"), Bytes::from("b")],
        Duration::from_secs(5),
        "log replay after restart",
    )
    .await;

    restarted.raft.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_bootstrap_restores_latest_snapshot() {
    init_tracing();
    let router = InMemoryRouter::new();
    let conf = Config {
        trailing_logs: 0,
        ..test_config()
    };
    let node = spawn_node(&router, "n1", &["n1"], conf.clone());

    wait_until(
        || node.raft.state() == Role::Leader,
        Duration::from_secs(5),
        "self-election",
    )
    .await;

    for cmd in ["a", "b", "c"] {
        node.raft
            .apply(Bytes::from(cmd), Some(Duration::from_secs(1)))
            .await
            .wait()
            .await
            .expect("apply commits");
    }
    node.raft.snapshot().await.wait().await.expect("snapshot");
    node.raft.shutdown().await;

    // Fresh log and stable stores: all state must come from the snapshot.
    let restored = spawn_node_with_stores(
        &router,
        "n1",
        std::sync::Arc::new(skiff_raft::MemLogStore::new()),
        std::sync::Arc::new(skiff_raft::MemStableStore::new()),
        node.snapshots.clone(),
        node.peer_store.clone(),
        conf,
    );

    // Restore happens during construction, before any election.
    assert_eq!(
        applied_commands(&restored),
        vec![Bytes::from("a"), Bytes::from("b"), Bytes::from("c")]
    );
    // Noop at 1, commands at 2..=4.
    assert_eq!(restored.raft.last_applied(), LogIndex(4));

    restored.raft.shutdown().await;
}
