//! Cluster join routine
//!
//! A fresh non-bootstrap node announces itself to an existing member's
//! management endpoint, which proposes the membership change on the
//! leader. Joining always advertises the peer-routable address, never
//! the bind address.

use hyper::{Client, StatusCode, Uri};
use tokio::time::Duration;

const JOIN_ATTEMPTS: u32 = 20;
const RETRY_INTERVAL: Duration = Duration::from_secs(2);
const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(10);

/// Tries to join the cluster through `leader_mgmt_addr`, retrying up to
/// 20 times, 2 seconds apart. Exhausting the attempts logs a CRITICAL
/// error but does not kill the process; an operator can retry the join
/// by hand while the node keeps serving whatever state it has.
pub async fn join_cluster(leader_mgmt_addr: String, node_id: u64, advertise_addr: String) {
    let url = format!(
        "http://{}/join?peerID={}&peerAddress={}",
        leader_mgmt_addr, node_id, advertise_addr
    );
    let uri: Uri = match url.parse() {
        Ok(uri) => uri,
        Err(e) => {
            log::error!("CRITICAL: invalid join URL {}: {}", url, e);
            return;
        }
    };

    let client = Client::new();
    for attempt in 1..=JOIN_ATTEMPTS {
        // Give the target's management endpoint time to come up, and
        // space out the retries.
        tokio::time::sleep(RETRY_INTERVAL).await;
        log::info!(
            "attempting to join cluster via {} (attempt {}/{})",
            url,
            attempt,
            JOIN_ATTEMPTS
        );

        match tokio::time::timeout(ATTEMPT_TIMEOUT, client.get(uri.clone())).await {
            Ok(Ok(resp)) if resp.status() == StatusCode::OK => {
                log::info!("successfully joined the cluster");
                return;
            }
            Ok(Ok(resp)) => {
                let status = resp.status();
                let body = hyper::body::to_bytes(resp.into_body())
                    .await
                    .unwrap_or_default();
                log::warn!(
                    "join attempt {} failed (status {}): {}",
                    attempt,
                    status,
                    String::from_utf8_lossy(&body)
                );
            }
            Ok(Err(e)) => {
                log::warn!("join attempt {} failed (conn): {}", attempt, e);
            }
            Err(_) => {
                log::warn!("join attempt {} timed out", attempt);
            }
        }
    }

    log::error!(
        "CRITICAL: failed to join cluster after {} attempts",
        JOIN_ATTEMPTS
    );
}
