//! Service-level error types
//!
//! Startup configuration problems are fatal; per-request consensus
//! problems are surfaced to the caller and the node keeps running.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("node_id must be non-zero")]
    InvalidNodeId,
    #[error("advertise address {0} is a wildcard; peers cannot dial it")]
    WildcardAdvertise(String),
    #[error("advertise address {0} does not resolve: {1}")]
    UnresolvableAdvertise(String, std::io::Error),
}

#[derive(Debug, Error)]
pub enum ProposeError {
    #[error("proposal rejected: not the leader, or the entry was dropped")]
    Rejected,
    #[error("proposal timed out before commit")]
    Timeout,
    #[error("consensus task is shut down")]
    Closed,
}
