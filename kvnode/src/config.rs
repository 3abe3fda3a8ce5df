//! Configuration module for the key-value service
//!
//! This module handles runtime configuration: node identity, addresses,
//! ports, and paths. Values come from a TOML file; every field has a
//! default so a missing file yields a runnable single-node dev config.

use log::warn;
use serde_derive::Deserialize;
use std::net::ToSocketAddrs;

use crate::error::ConfigError;

/// Runtime configuration for one node.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Stable cluster identity; must be unique and non-zero.
    pub node_id: u64,
    /// Interface the Raft transport listens on (wildcard is fine here).
    pub bind_addr: String,
    /// TCP port for Raft peer traffic.
    pub raft_port: u16,
    /// Hostname peers dial; composed with `raft_port` into the advertise
    /// address. Empty falls back to `bind_addr`, which startup validation
    /// rejects when it is a wildcard.
    pub advertise_host: String,
    /// Port for the client ingress HTTP endpoint.
    pub ingress_port: u16,
    /// Port for the cluster-management HTTP endpoint.
    pub mgmt_port: u16,
    /// Directory for the Raft log and stable state.
    pub data_dir: String,
    /// Path of the KV persistence file.
    pub kv_path: String,
    /// Declare this node the sole voter of a fresh cluster. Exactly one
    /// node of a new cluster sets this.
    pub bootstrap: bool,
    /// `host:mgmt_port` of an existing cluster member to join through.
    pub join_addr: Option<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            node_id: 1,
            bind_addr: "0.0.0.0".to_string(),
            raft_port: 4000,
            advertise_host: "127.0.0.1".to_string(),
            ingress_port: 8080,
            mgmt_port: 6000,
            data_dir: "./data".to_string(),
            kv_path: "kv.db".to_string(),
            bootstrap: false,
            join_addr: None,
        }
    }
}

impl RuntimeConfig {
    /// Loads configuration from a TOML file. A missing or malformed file
    /// logs a warning and falls back to defaults.
    pub fn from_toml(path: &str) -> RuntimeConfig {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) => {
                warn!(
                    "Something went wrong reading the runtime config file, {:?}",
                    e
                );
                return RuntimeConfig::default();
            }
        };
        match toml::from_str(&contents) {
            Ok(c) => c,
            Err(e) => {
                warn!(
                    "Something went wrong reading the runtime config file, {:?}",
                    e
                );
                RuntimeConfig::default()
            }
        }
    }

    /// Where the Raft transport listens.
    pub fn raft_bind_addr(&self) -> String {
        format!("{}:{}", self.bind_addr, self.raft_port)
    }

    /// What peers are told to dial. Never a wildcard in a valid config.
    pub fn advertise_addr(&self) -> String {
        if self.advertise_host.is_empty() {
            self.raft_bind_addr()
        } else {
            format!("{}:{}", self.advertise_host, self.raft_port)
        }
    }

    pub fn ingress_bind_addr(&self) -> String {
        format!("{}:{}", self.bind_addr, self.ingress_port)
    }

    pub fn mgmt_bind_addr(&self) -> String {
        format!("{}:{}", self.bind_addr, self.mgmt_port)
    }

    /// Fails fast on configurations peers cannot work with: a zero node
    /// id, or an advertise address that is unresolvable or a wildcard.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node_id == 0 {
            return Err(ConfigError::InvalidNodeId);
        }

        let advertise = self.advertise_addr();
        let mut resolved = advertise
            .to_socket_addrs()
            .map_err(|e| ConfigError::UnresolvableAdvertise(advertise.clone(), e))?;
        if resolved.any(|a| a.ip().is_unspecified()) {
            return Err(ConfigError::WildcardAdvertise(advertise));
        }
        Ok(())
    }
}
