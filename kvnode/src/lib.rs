//! Raft-replicated key-value store.
//!
//! A cluster of these nodes keeps an in-memory, disk-backed map
//! consistent: `SET`/`DELETE` mutations are serialized into a Raft log,
//! replicated to a quorum, and applied on every node in the same order.
//! Reads are served locally without consensus.
//!
//! # Modules
//!
//! - [`raft`]: consensus layer wrapping the tikv `raft` library
//! - [`state_kv`]: deterministic bridge from committed entries to the store
//! - [`store`]: the persistent key-value map
//! - [`command`]: MessagePack command codec
//! - [`server`]: coordinator wiring everything into one node
//! - [`ingress`] / [`management`]: HTTP adapters over the core

pub mod command;
pub mod config;
pub mod error;
pub mod ingress;
pub mod join;
pub mod management;
pub mod metrics;
pub mod raft;
pub mod raft_client;
pub mod raft_service;
pub mod server;
pub mod state_kv;
pub mod store;
