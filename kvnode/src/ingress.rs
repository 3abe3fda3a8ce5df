//! Client ingress HTTP endpoint
//!
//! The front door clients talk to: `POST /insert-val` forwards an
//! already-encoded MessagePack command to the consensus engine,
//! `GET /get-val` reads the local store. Response shapes mirror the
//! original service byte for byte, including the HTTP 200 `"error"`
//! body on a failed proposal — existing clients parse exactly that.

use std::convert::Infallible;
use std::net::SocketAddr;

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, StatusCode};

use crate::management::query_param;
use crate::metrics;
use crate::server::NodeHandle;

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
    log::info!("ingress server started on {}", addr);
    Ok(tokio::spawn(async move {
        if let Err(e) = server.await {
            log::error!("ingress server error: {}", e);
        }
    }))
}

async fn handle_request(
    req: Request<Body>,
    handle: NodeHandle,
) -> Result<Response<Body>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let response = match (method, path.as_str()) {
        (Method::POST, "/insert-val") if is_msgpack(&req) => {
            metrics::record_metrics("insert_val", || handle_insert(req, &handle)).await
        }
        (Method::GET, "/get-val") => {
            let query = req.uri().query().unwrap_or("").to_string();
            metrics::record_metrics("get_val", || async { handle_get(&query, &handle) }).await
        }
        _ => plain("404 Not Found"),
    };
    Ok(response)
}

fn is_msgpack(req: &Request<Body>) -> bool {
    req.headers()
        .get(hyper::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains("application/msgpack"))
        .unwrap_or(false)
}

/// Proposes the raw body through Raft. The payload is opaque here; a
/// malformed command still commits and every replica skips it on apply.
async fn handle_insert(req: Request<Body>, handle: &NodeHandle) -> Response<Body> {
    let body = match hyper::body::to_bytes(req.into_body()).await {
        Ok(bytes) => bytes,
        Err(e) => {
            log::warn!("failed to read insert-val body: {}", e);
            return plain("error");
        }
    };

    match handle.propose(body.to_vec()).await {
        Ok(()) => plain("ok"),
        Err(e) => {
            log::warn!("proposal failed: {}", e);
            plain("error")
        }
    }
}

fn handle_get(query: &str, handle: &NodeHandle) -> Response<Body> {
    let key = query_param(query, "key").unwrap_or_default();
    match handle.get(&key) {
        Some(value) => plain_owned(value),
        None => plain("Key Not Found"),
    }
}

fn plain(body: &'static str) -> Response<Body> {
    Response::builder()
        .status(StatusCode::OK)
        .body(Body::from(body))
        .unwrap()
}

fn plain_owned(body: String) -> Response<Body> {
    Response::builder()
        .status(StatusCode::OK)
        .body(Body::from(body))
        .unwrap()
}
