//! Cluster management HTTP endpoint
//!
//! Hosts `/join` (leader-side membership handler), `/status`, `/health`,
//! and the Prometheus `/metrics` exposition.

use std::convert::Infallible;
use std::net::SocketAddr;

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, StatusCode};
use prometheus::{Encoder, TextEncoder};

use crate::metrics;
use crate::server::NodeHandle;

/// Minimal query-string lookup; values are taken raw, the way the
/// original clients send them.
pub(crate) fn query_param(query: &str, name: &str) -> Option<String> {
    query.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        (key == name).then(|| value.to_string())
    })
}

pub fn spawn(addr: SocketAddr, handle: NodeHandle) -> hyper::Result<tokio::task::JoinHandle<()>> {
    let make_svc = make_service_fn(move |_| {
        let handle = handle.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                handle_request(req, handle.clone())
            }))
        }
    });
    let server = hyper::Server::try_bind(&addr)?.serve(make_svc);
    log::info!("management server started on {}", addr);
    Ok(tokio::spawn(async move {
        if let Err(e) = server.await {
            log::error!("management server error: {}", e);
        }
    }))
}

async fn handle_request(
    req: Request<Body>,
    handle: NodeHandle,
) -> Result<Response<Body>, Infallible> {
    let response = match (req.method(), req.uri().path()) {
        (&Method::GET, "/join") => handle_join(&req, &handle).await,
        (&Method::GET, "/status") => handle_status(&handle),
        (&Method::GET, "/health") => plain(StatusCode::OK, "OK"),
        (&Method::GET, "/metrics") => handle_metrics(),
        _ => plain(StatusCode::NOT_FOUND, "Not Found"),
    };
    Ok(response)
}

/// Adds the requesting peer as a voter.
///
/// Leadership is not checked here: a non-leader's engine rejects the
/// membership proposal and the caller sees a 500, which makes its join
/// routine retry (by then usually against the right node).
async fn handle_join(req: &Request<Body>, handle: &NodeHandle) -> Response<Body> {
    let query = req.uri().query().unwrap_or("");
    let peer_id = query_param(query, "peerID").unwrap_or_default();
    let peer_address = query_param(query, "peerAddress").unwrap_or_default();

    if peer_id.is_empty() || peer_address.is_empty() {
        return plain(StatusCode::BAD_REQUEST, "Missing peerAddress or peerID");
    }
    let peer_id: u64 = match peer_id.parse() {
        Ok(id) if id != 0 => id,
        _ => return plain(StatusCode::BAD_REQUEST, "peerID must be a non-zero integer"),
    };

    log::info!("received join request for {} at {}", peer_id, peer_address);
    match handle.add_voter(peer_id, peer_address).await {
        Ok(()) => plain(StatusCode::OK, "Joined successfully"),
        Err(e) => {
            log::error!("failed to add voter {}: {}", peer_id, e);
            Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .body(Body::from(e.to_string()))
                .unwrap()
        }
    }
}

fn handle_status(handle: &NodeHandle) -> Response<Body> {
    let status = serde_json::json!({
        "is_leader": handle.is_leader(),
        "leader_addr": handle.leader_addr(),
    });
    Response::builder()
        .status(StatusCode::OK)
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .body(Body::from(status.to_string()))
        .unwrap()
}

fn handle_metrics() -> Response<Body> {
    let encoder = TextEncoder::new();
    let metric_families = metrics::REGISTRY_INSTANCE.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        log::error!("failed to encode metrics: {}", e);
        return plain(StatusCode::INTERNAL_SERVER_ERROR, "encode error");
    }
    Response::new(Body::from(buffer))
}

fn plain(status: StatusCode, body: &'static str) -> Response<Body> {
    Response::builder()
        .status(status)
        .body(Body::from(body))
        .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_param() {
        let query = "peerID=2&peerAddress=node2:4000";
        assert_eq!(query_param(query, "peerID"), Some("2".to_string()));
        assert_eq!(
            query_param(query, "peerAddress"),
            Some("node2:4000".to_string())
        );
        assert_eq!(query_param(query, "missing"), None);
        assert_eq!(query_param("", "peerID"), None);
        assert_eq!(query_param("flag", "flag"), None);
    }
}
