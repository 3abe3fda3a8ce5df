//! Raft consensus layer
//! Wraps the tikv `raft` library with file-backed storage, a proposal
//! queue, and a dynamic peer registry fed by membership changes.

pub mod log_file; // durable entry log
pub mod node; // Raft node task
pub mod proposal; // proposal handling
pub mod storage; // storage implementation

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Trait for the deterministic consumer of committed entries.
///
/// The consensus task calls `apply` exactly once per committed entry, in
/// strictly ascending index order. `apply` must be deterministic: equal
/// payloads against equal prior state produce equal posterior state on
/// every node.
pub trait StateMachine {
    /// Apply a committed entry. Returns whether the payload was a valid
    /// command that mutated state; the engine logs failures but never
    /// halts on them.
    fn apply(&mut self, index: u64, data: &[u8]) -> bool;

    /// Serialize the current state for a snapshot. Stubbed to an empty
    /// payload while the log is never compacted.
    fn snapshot(&self) -> Vec<u8>;

    /// Restore from a snapshot received from the leader.
    fn on_snapshot(&mut self, last_index: u64, last_term: u64, data: &[u8]);
}

/// Cluster view the consensus task refreshes after every ready cycle.
#[derive(Debug, Default, Clone)]
pub struct ClusterStatus {
    pub is_leader: bool,
    pub leader_id: u64,
    pub term: u64,
    pub applied: u64,
}

/// Advertise addresses of known peers, keyed by node id.
///
/// Fed from three directions: this node registers itself at startup,
/// applied membership changes carry the joiner's address in their
/// context, and every transport frame names its sender. Replaying the
/// log on restart rebuilds the registry.
#[derive(Clone, Default)]
pub struct PeerRegistry {
    peers: Arc<Mutex<HashMap<u64, String>>>,
}

impl PeerRegistry {
    pub fn new() -> PeerRegistry {
        PeerRegistry::default()
    }

    pub fn register(&self, id: u64, addr: &str) {
        if addr.is_empty() {
            return;
        }
        let mut peers = self.peers.lock().unwrap();
        let known = peers.insert(id, addr.to_string());
        if known.as_deref() != Some(addr) {
            log::info!("peer {} is at {}", id, addr);
        }
    }

    pub fn deregister(&self, id: u64) {
        self.peers.lock().unwrap().remove(&id);
    }

    pub fn resolve(&self, id: u64) -> Option<String> {
        self.peers.lock().unwrap().get(&id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_registry() {
        let registry = PeerRegistry::new();
        assert_eq!(registry.resolve(1), None);

        registry.register(1, "node1:4000");
        registry.register(2, "node2:4000");
        assert_eq!(registry.resolve(1), Some("node1:4000".to_string()));

        registry.register(1, "node1:5000");
        assert_eq!(registry.resolve(1), Some("node1:5000".to_string()));

        registry.deregister(2);
        assert_eq!(registry.resolve(2), None);

        // Empty addresses never clobber a known peer.
        registry.register(1, "");
        assert_eq!(registry.resolve(1), Some("node1:5000".to_string()));
    }
}
