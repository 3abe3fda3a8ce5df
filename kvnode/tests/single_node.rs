//! Single-node integration tests: bootstrap, propose, apply, read,
//! restart, and the HTTP adapters, all against a real node on loopback.

use std::time::{Duration, Instant};

use kvnode::command::Command;
use kvnode::config::RuntimeConfig;
use kvnode::error::ProposeError;
use kvnode::server::{NodeHandle, Server};

/// Builds a bootstrap config on its own ports and temp paths. Each test
/// uses a distinct `base_port` so they can run in parallel.
fn test_config(dir: &tempfile::TempDir, base_port: u16, bootstrap: bool) -> RuntimeConfig {
    RuntimeConfig {
        node_id: 1,
        bind_addr: "127.0.0.1".to_string(),
        raft_port: base_port,
        advertise_host: "127.0.0.1".to_string(),
        ingress_port: base_port + 1,
        mgmt_port: base_port + 2,
        data_dir: dir.path().join("raft").to_string_lossy().to_string(),
        kv_path: dir.path().join("kv.db").to_string_lossy().to_string(),
        bootstrap,
        join_addr: None,
    }
}

async fn wait_for_leader(handle: &NodeHandle, timeout: Duration) {
    let start = Instant::now();
    while !handle.is_leader() {
        assert!(
            start.elapsed() < timeout,
            "timeout waiting for node to become leader"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

async fn wait_for_value(handle: &NodeHandle, key: &str, expected: &str, timeout: Duration) {
    let start = Instant::now();
    loop {
        if handle.get(key).as_deref() == Some(expected) {
            return;
        }
        assert!(
            start.elapsed() < timeout,
            "timeout waiting for {}={}",
            key,
            expected
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_bootstrap_write_read_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir, 19000, true);

    let mut server = Server::start(config.clone()).await.unwrap();
    let handle = server.handle();
    wait_for_leader(&handle, Duration::from_secs(10)).await;

    let payload = Command::set("hello", "world").encode().unwrap();
    handle.propose(payload).await.unwrap();
    wait_for_value(&handle, "hello", "world", Duration::from_secs(5)).await;

    assert!(handle.is_leader());
    assert_eq!(handle.leader_addr(), format!("127.0.0.1:{}", 19000));

    server.stop();
    tokio::time::sleep(Duration::from_millis(200)).await;

    // Restart on the same data directory: the log replays and the map
    // comes back.
    let mut server = Server::start(config).await.unwrap();
    let handle = server.handle();
    wait_for_leader(&handle, Duration::from_secs(10)).await;
    wait_for_value(&handle, "hello", "world", Duration::from_secs(5)).await;

    server.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_delete_semantics() {
    let dir = tempfile::tempdir().unwrap();
    let mut server = Server::start(test_config(&dir, 19010, true)).await.unwrap();
    let handle = server.handle();
    wait_for_leader(&handle, Duration::from_secs(10)).await;

    handle
        .propose(Command::set("x", "1").encode().unwrap())
        .await
        .unwrap();
    wait_for_value(&handle, "x", "1", Duration::from_secs(5)).await;

    handle
        .propose(Command::delete("x").encode().unwrap())
        .await
        .unwrap();
    let start = Instant::now();
    while handle.get("x").is_some() {
        assert!(start.elapsed() < Duration::from_secs(5));
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    // Deleting an absent key commits fine and stays absent.
    handle
        .propose(Command::delete("x").encode().unwrap())
        .await
        .unwrap();
    assert_eq!(handle.get("x"), None);

    server.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_malformed_command_commits_as_noop() {
    let dir = tempfile::tempdir().unwrap();
    let mut server = Server::start(test_config(&dir, 19020, true)).await.unwrap();
    let handle = server.handle();
    wait_for_leader(&handle, Duration::from_secs(10)).await;

    // An unknown op commits (the engine does not inspect payloads) but
    // applies as a no-op on every node.
    let upsert = Command {
        op: "UPSERT".to_string(),
        key: "k".to_string(),
        value: "v".to_string(),
    };
    handle.propose(upsert.encode().unwrap()).await.unwrap();
    assert_eq!(handle.get("k"), None);

    // Subsequent valid commands still apply.
    handle
        .propose(Command::set("k", "v2").encode().unwrap())
        .await
        .unwrap();
    wait_for_value(&handle, "k", "v2", Duration::from_secs(5)).await;

    server.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_non_member_rejects_proposals() {
    let dir = tempfile::tempdir().unwrap();
    // No bootstrap, no join: this node can never win an election.
    let mut server = Server::start(test_config(&dir, 19030, false)).await.unwrap();
    let handle = server.handle();

    let err = handle
        .propose(Command::set("k", "v").encode().unwrap())
        .await
        .unwrap_err();
    assert!(matches!(err, ProposeError::Rejected));
    assert!(!handle.is_leader());

    server.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_http_endpoints() {
    let dir = tempfile::tempdir().unwrap();
    let mut server = Server::start(test_config(&dir, 19040, true)).await.unwrap();
    let handle = server.handle();
    wait_for_leader(&handle, Duration::from_secs(10)).await;

    let client = hyper::Client::new();

    // Propose through the ingress adapter.
    let payload = Command::set("user_123", "msgpack_optimization_active")
        .encode()
        .unwrap();
    let req = hyper::Request::builder()
        .method(hyper::Method::POST)
        .uri("http://127.0.0.1:19041/insert-val")
        .header("content-type", "application/msgpack")
        .body(hyper::Body::from(payload))
        .unwrap();
    let resp = client.request(req).await.unwrap();
    assert_eq!(resp.status(), hyper::StatusCode::OK);
    let body = hyper::body::to_bytes(resp.into_body()).await.unwrap();
    assert_eq!(&body[..], b"ok");

    wait_for_value(&handle, "user_123", "msgpack_optimization_active", Duration::from_secs(5))
        .await;

    // Read it back through the ingress adapter.
    let resp = client
        .get("http://127.0.0.1:19041/get-val?key=user_123".parse().unwrap())
        .await
        .unwrap();
    let body = hyper::body::to_bytes(resp.into_body()).await.unwrap();
    assert_eq!(&body[..], b"msgpack_optimization_active");

    // Missing keys answer with the sentinel body.
    let resp = client
        .get("http://127.0.0.1:19041/get-val?key=nope".parse().unwrap())
        .await
        .unwrap();
    let body = hyper::body::to_bytes(resp.into_body()).await.unwrap();
    assert_eq!(&body[..], b"Key Not Found");

    // Management endpoint.
    let resp = client
        .get("http://127.0.0.1:19042/health".parse().unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), hyper::StatusCode::OK);

    let resp = client
        .get("http://127.0.0.1:19042/status".parse().unwrap())
        .await
        .unwrap();
    let body = hyper::body::to_bytes(resp.into_body()).await.unwrap();
    let status: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(status["is_leader"], true);
    assert_eq!(status["leader_addr"], "127.0.0.1:19040");

    // A join request without params is a 400.
    let resp = client
        .get("http://127.0.0.1:19042/join".parse().unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), hyper::StatusCode::BAD_REQUEST);

    server.stop();
}
