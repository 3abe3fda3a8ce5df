//! State machine implementation for the key-value store
//!
//! Bridges committed log entries into KV store mutations. This is the
//! only code path that writes to the store, which is what keeps every
//! replica's map identical.

use std::sync::Arc;

use crate::command::{Command, Op};
use crate::metrics;
use crate::raft::StateMachine;
use crate::store::KvStore;

/// State machine that applies decoded commands to the KV store.
#[derive(Clone)]
pub struct StateKv {
    store: Arc<KvStore>,
}

impl StateKv {
    pub fn new(store: Arc<KvStore>) -> StateKv {
        StateKv { store }
    }
}

impl StateMachine for StateKv {
    /// Decode and apply one committed entry.
    ///
    /// Malformed or invalid payloads are no-ops: they are equally
    /// malformed on every replica, so skipping them keeps the cluster
    /// consistent, while halting would wedge it.
    fn apply(&mut self, index: u64, data: &[u8]) -> bool {
        let cmd = match Command::decode(data) {
            Ok(cmd) => cmd,
            Err(e) => {
                log::warn!("entry {}: undecodable command payload: {}", index, e);
                metrics::APPLY_COUNTER_VEC
                    .with_label_values(&["malformed"])
                    .inc();
                return false;
            }
        };

        match cmd.op() {
            Op::Set if !cmd.key.is_empty() => {
                log::debug!("entry {}: SET {}", index, cmd.key);
                self.store.set(&cmd.key, &cmd.value);
                metrics::APPLY_COUNTER_VEC.with_label_values(&["set"]).inc();
                true
            }
            Op::Delete if !cmd.key.is_empty() => {
                log::debug!("entry {}: DELETE {}", index, cmd.key);
                self.store.delete(&cmd.key);
                metrics::APPLY_COUNTER_VEC
                    .with_label_values(&["delete"])
                    .inc();
                true
            }
            _ => {
                log::warn!("entry {}: ignoring invalid command op={:?}", index, cmd.op);
                metrics::APPLY_COUNTER_VEC
                    .with_label_values(&["invalid"])
                    .inc();
                false
            }
        }
    }

    /// Stub: an empty snapshot payload. Correct only while the log is
    /// never compacted.
    fn snapshot(&self) -> Vec<u8> {
        Vec::new()
    }

    /// Stub: restore keeps whatever state the node already has.
    fn on_snapshot(&mut self, last_index: u64, _last_term: u64, data: &[u8]) {
        if !data.is_empty() {
            log::warn!(
                "ignoring non-empty snapshot payload at index {}",
                last_index
            );
        }
    }
}
