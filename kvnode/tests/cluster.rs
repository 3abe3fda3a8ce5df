//! Multi-node integration tests: join through the management endpoint,
//! replication to followers, follower rejection, and leader failover.
//! Real nodes, real gRPC transport, all on loopback ports.

use std::time::{Duration, Instant};

use kvnode::command::Command;
use kvnode::config::RuntimeConfig;
use kvnode::server::{NodeHandle, Server};

/// One node's config inside a test cluster. Node `i` (1-based) gets
/// ports `base + i*10 + {0,1,2}` for raft, ingress, and management.
fn node_config(
    dir: &tempfile::TempDir,
    base_port: u16,
    node_id: u64,
    bootstrap: bool,
    join_port: Option<u16>,
) -> RuntimeConfig {
    let port = base_port + (node_id as u16) * 10;
    RuntimeConfig {
        node_id,
        bind_addr: "127.0.0.1".to_string(),
        raft_port: port,
        advertise_host: "127.0.0.1".to_string(),
        ingress_port: port + 1,
        mgmt_port: port + 2,
        data_dir: dir
            .path()
            .join(format!("node{}/raft", node_id))
            .to_string_lossy()
            .to_string(),
        kv_path: dir
            .path()
            .join(format!("node{}/kv.db", node_id))
            .to_string_lossy()
            .to_string(),
        bootstrap,
        join_addr: join_port.map(|p| format!("127.0.0.1:{}", p)),
    }
}

async fn wait_for<F: Fn() -> bool>(what: &str, timeout: Duration, check: F) {
    let start = Instant::now();
    while !check() {
        assert!(start.elapsed() < timeout, "timeout waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

async fn wait_for_value(handle: &NodeHandle, key: &str, expected: &str, timeout: Duration) {
    let key = key.to_string();
    let expected = expected.to_string();
    let start = Instant::now();
    while handle.get(&key).as_deref() != Some(expected.as_str()) {
        assert!(
            start.elapsed() < timeout,
            "timeout waiting for {}={}",
            key,
            expected
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// Spawns a bootstrap node plus two joiners and waits until everyone
/// agrees on the leader.
async fn spawn_cluster(
    dir: &tempfile::TempDir,
    base_port: u16,
) -> (Vec<Server>, Vec<NodeHandle>) {
    let leader_mgmt = base_port + 12;

    let mut servers = Vec::new();
    for id in 1..=3u64 {
        let config = node_config(
            dir,
            base_port,
            id,
            id == 1,
            (id != 1).then_some(leader_mgmt),
        );
        servers.push(Server::start(config).await.unwrap());
    }
    let handles: Vec<NodeHandle> = servers.iter().map(|s| s.handle()).collect();

    wait_for("node 1 to lead", Duration::from_secs(15), || {
        handles[0].is_leader()
    })
    .await;

    // The join routines retry every 2 s; once a follower knows the
    // leader's address it has joined and caught up on membership.
    let leader_addr = format!("127.0.0.1:{}", base_port + 10);
    for handle in &handles[1..] {
        let handle = handle.clone();
        let leader_addr = leader_addr.clone();
        wait_for("follower to join", Duration::from_secs(60), move || {
            handle.leader_addr() == leader_addr
        })
        .await;
    }

    (servers, handles)
}

#[tokio::test(flavor = "multi_thread")]
async fn test_three_node_replication() {
    let dir = tempfile::tempdir().unwrap();
    let (mut servers, handles) = spawn_cluster(&dir, 19100).await;

    assert!(handles[0].is_leader());
    assert!(!handles[1].is_leader());

    // A write through the leader shows up on every follower.
    handles[0]
        .propose(Command::set("k1", "v1").encode().unwrap())
        .await
        .unwrap();
    wait_for_value(&handles[1], "k1", "v1", Duration::from_secs(10)).await;
    wait_for_value(&handles[2], "k1", "v1", Duration::from_secs(10)).await;

    // Followers refuse proposals instead of forwarding them.
    assert!(handles[2]
        .propose(Command::set("k9", "v9").encode().unwrap())
        .await
        .is_err());

    for server in &mut servers {
        server.stop();
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_leader_failover() {
    let dir = tempfile::tempdir().unwrap();
    let (mut servers, handles) = spawn_cluster(&dir, 19200).await;

    handles[0]
        .propose(Command::set("k1", "v1").encode().unwrap())
        .await
        .unwrap();
    wait_for_value(&handles[1], "k1", "v1", Duration::from_secs(10)).await;
    wait_for_value(&handles[2], "k1", "v1", Duration::from_secs(10)).await;

    // Kill the leader; the survivors elect a new one.
    servers[0].stop();

    let survivors = [&handles[1], &handles[2]];
    wait_for("a new leader", Duration::from_secs(30), || {
        survivors.iter().any(|h| h.is_leader())
    })
    .await;

    let leader = *survivors.iter().find(|h| h.is_leader()).unwrap();
    let follower = *survivors.iter().find(|h| !h.is_leader()).unwrap();

    leader
        .propose(Command::set("k2", "v2").encode().unwrap())
        .await
        .unwrap();
    wait_for_value(follower, "k2", "v2", Duration::from_secs(10)).await;

    // The old data survived the failover too.
    assert_eq!(leader.get("k1").as_deref(), Some("v1"));

    for server in &mut servers {
        server.stop();
    }
}
