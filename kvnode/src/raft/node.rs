#![allow(clippy::field_reassign_with_default)]

use std::collections::VecDeque;
use std::str;
use std::sync::{Arc, Mutex};

use slog::o;
use slog::Drain;
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::time::Duration;

use protobuf::Message as PbMessage;
use raft::{prelude::*, StateRole};

use crate::raft::proposal::Proposal;
use crate::raft::storage::FileStorage;
use crate::raft::{ClusterStatus, PeerRegistry, StateMachine};

const TICK_INTERVAL: Duration = Duration::from_millis(100);
const LOGGER_CHANNEL_SIZE: usize = 4096;
const OUT_MAILBOX_SIZE: usize = 1000;

/// Default Raft configuration: 100 ms ticks, ~1 s randomized election
/// timeout, 300 ms heartbeats.
fn default_config(id: u64) -> Config {
    Config {
        id,
        election_tick: 10,
        heartbeat_tick: 3,
        ..Default::default()
    }
}

/// The consensus task. Owns the `RawNode`, the durable storage, and the
/// state machine; everything else talks to it through channels.
pub struct RaftNode<S: StateMachine> {
    raft_group: RawNode<FileStorage>,
    out_mailbox: Sender<Message>,
    my_mailbox: Receiver<Message>,
    state_machine: S,
    proposals: Receiver<Proposal>,
    proposed: VecDeque<Proposal>,
    registry: PeerRegistry,
    status: Arc<Mutex<ClusterStatus>>,
}

impl<S: StateMachine + Send + 'static> RaftNode<S> {
    /// Opens storage (seeding a single-voter cluster when `bootstrap` is
    /// set and the data directory is virgin), starts the consensus task,
    /// and returns the outbound message mailbox plus the task handle.
    #[allow(clippy::too_many_arguments)]
    pub fn start(
        id: u64,
        bootstrap: bool,
        data_dir: &str,
        state_machine: S,
        my_mailbox: Receiver<Message>,
        proposals: Receiver<Proposal>,
        registry: PeerRegistry,
        status: Arc<Mutex<ClusterStatus>>,
    ) -> raft::Result<(Receiver<Message>, tokio::task::JoinHandle<()>)> {
        let decorator = slog_term::TermDecorator::new().build();
        let drain = slog_term::FullFormat::new(decorator).build().fuse();
        let drain = slog_async::Async::new(drain)
            .chan_size(LOGGER_CHANNEL_SIZE)
            .overflow_strategy(slog_async::OverflowStrategy::Block)
            .build()
            .fuse();
        let logger = slog::Logger::root(drain, o!("tag" => format!("peer_{}", id)));

        let storage = FileStorage::open(data_dir, bootstrap.then_some(id))?;
        let cfg = default_config(id);
        let raft_group = RawNode::new(&cfg, storage, &logger)?;

        let (sx, out_mailbox) = mpsc::channel(OUT_MAILBOX_SIZE);
        let mut node = RaftNode {
            raft_group,
            out_mailbox: sx,
            my_mailbox,
            state_machine,
            proposals,
            proposed: VecDeque::new(),
            registry,
            status,
        };

        let handle = tokio::spawn(async move {
            node.run().await;
        });

        Ok((out_mailbox, handle))
    }

    async fn run(&mut self) {
        let mut tick = tokio::time::interval(TICK_INTERVAL);
        loop {
            tokio::select! {
                Some(msg) = self.my_mailbox.recv() => {
                    let _ = self.raft_group.step(msg);
                    while let Ok(msg) = self.my_mailbox.try_recv() {
                        let _ = self.raft_group.step(msg);
                    }
                }
                Some(proposal) = self.proposals.recv() => {
                    Self::propose(&mut self.raft_group, proposal, &mut self.proposed);
                    while let Ok(proposal) = self.proposals.try_recv() {
                        Self::propose(&mut self.raft_group, proposal, &mut self.proposed);
                    }
                }
                _ = tick.tick() => {
                    self.raft_group.tick();
                }
            }

            self.on_ready();
            self.publish_status();
        }
    }

    /// Process raft ready state
    fn on_ready(&mut self) {
        if !self.raft_group.has_ready() {
            return;
        }

        let mut ready = self.raft_group.ready();

        // Step 1: Send messages that may go out before persistence
        if !ready.messages().is_empty() {
            Self::handle_out_messages(&self.out_mailbox, &ready.take_messages());
        }

        // Step 2: Handle snapshot if any (stubbed; see handle_snapshot)
        if *ready.snapshot() != Snapshot::default() {
            Self::handle_snapshot(&mut self.raft_group, &ready, &mut self.state_machine);
        }

        // Step 3: Apply committed entries
        let index1 = Self::handle_committed_entries(
            &mut self.raft_group,
            ready.take_committed_entries(),
            &mut self.state_machine,
            &self.registry,
        );

        // Step 4: Persist entries and hard state
        Self::persist_raft_state(&mut self.raft_group, &ready);
        if !ready.persisted_messages().is_empty() {
            Self::handle_out_messages(&self.out_mailbox, &ready.take_persisted_messages());
        }

        // Step 5: Advance raft state
        let mut light_rd = self.raft_group.advance(ready);
        if let Some(commit) = light_rd.commit_index() {
            Self::update_commit(&mut self.raft_group, commit);
        }
        Self::handle_out_messages(&self.out_mailbox, light_rd.messages());
        let index2 = Self::handle_committed_entries(
            &mut self.raft_group,
            light_rd.take_committed_entries(),
            &mut self.state_machine,
            &self.registry,
        );

        Self::notice_proposed(&self.raft_group, index1.max(index2), &mut self.proposed);
        self.raft_group.advance_apply();
    }

    /// Apply committed entries to the state machine, in index order.
    fn handle_committed_entries(
        raft_group: &mut RawNode<FileStorage>,
        entries: Vec<Entry>,
        state_machine: &mut S,
        registry: &PeerRegistry,
    ) -> u64 {
        let mut last_index = 0u64;
        for entry in entries {
            if entry.data.is_empty() {
                // Leader no-op entries carry nothing to apply.
                continue;
            }

            match entry.get_entry_type() {
                EntryType::EntryConfChange => {
                    let mut cc = ConfChange::default();
                    if let Err(e) = cc.merge_from_bytes(&entry.data) {
                        log::error!("undecodable membership entry {}: {}", entry.index, e);
                        continue;
                    }
                    Self::apply_membership_change(raft_group, &cc, registry);
                }
                _ => {
                    if !state_machine.apply(entry.index, entry.data.as_ref()) {
                        log::warn!("entry {} applied as a no-op", entry.index);
                    }
                }
            }

            last_index = entry.index;
        }
        last_index
    }

    fn apply_membership_change(
        raft_group: &mut RawNode<FileStorage>,
        cc: &ConfChange,
        registry: &PeerRegistry,
    ) {
        // Update the registry unconditionally: replaying the log after a
        // restart must rebuild it even when raft treats the change itself
        // as redundant. The joiner's advertise address rides in the
        // change context.
        match cc.get_change_type() {
            ConfChangeType::RemoveNode => registry.deregister(cc.node_id),
            _ => {
                if let Ok(addr) = str::from_utf8(cc.get_context()) {
                    registry.register(cc.node_id, addr);
                }
            }
        }

        match raft_group.apply_conf_change(cc) {
            Ok(cs) => {
                let store = &mut raft_group.raft.raft_log.store;
                if let Err(e) = store.set_conf_state(cs) {
                    log::error!("failed to persist membership state: {:?}", e);
                }
            }
            Err(e) => {
                log::error!("failed to apply membership change: {}", e);
            }
        }
    }

    /// Acknowledge proposals whose entries have been applied. An entry
    /// that no longer carries the proposing term was overwritten by a
    /// newer leader and is reported as failed.
    fn notice_proposed(
        raft_group: &RawNode<FileStorage>,
        last_index: u64,
        proposed: &mut VecDeque<Proposal>,
    ) {
        let mut i = 0;
        while i < proposed.len() {
            if proposed[i].proposed <= last_index {
                let mut proposal = proposed.remove(i).unwrap();
                let entry_term = raft_group
                    .raft
                    .raft_log
                    .term(proposal.proposed)
                    .unwrap_or(0);
                let committed = entry_term == proposal.proposed_term;
                if let Some(sender) = proposal.propose_success.take() {
                    let _ = sender.send(committed);
                }
            } else {
                i += 1;
            }
        }
    }

    /// Hand outbound messages to the transport pump.
    fn handle_out_messages(sender: &Sender<Message>, messages: &[Message]) {
        for msg in messages {
            if let Err(e) = sender.try_send(msg.clone()) {
                log::error!("failed to queue raft message {:?}, raft will retry", e);
            }
        }
    }

    /// Snapshots are stubbed: the log is never compacted, so no leader
    /// ever has to send one. If one arrives anyway it carries an empty
    /// payload; restore leaves the existing state untouched.
    fn handle_snapshot(
        raft_group: &mut RawNode<FileStorage>,
        ready: &Ready,
        state_machine: &mut S,
    ) {
        let snapshot = ready.snapshot().clone();
        let metadata = snapshot.get_metadata().clone();
        log::warn!(
            "installing snapshot at index {} term {} (stub restore, state unchanged)",
            metadata.index,
            metadata.term
        );

        {
            let store = &mut raft_group.raft.raft_log.store;
            if let Err(e) = store.apply_snapshot(&snapshot) {
                log::error!("failed to apply snapshot: {:?}", e);
                return;
            }
        }

        state_machine.on_snapshot(metadata.index, metadata.term, snapshot.get_data());
    }

    /// Persist raft log entries and hard state to storage.
    fn persist_raft_state(raft_group: &mut RawNode<FileStorage>, ready: &Ready) {
        let store = &mut raft_group.raft.raft_log.store;

        if let Err(e) = store.append_entries(ready.entries()) {
            log::error!("failed to persist raft log: {:?}", e);
            return;
        }

        if let Some(hs) = ready.hs() {
            if let Err(e) = store.set_hardstate(hs.clone()) {
                log::error!("failed to persist hard state: {:?}", e);
            }
        }
    }

    fn update_commit(raft_group: &mut RawNode<FileStorage>, commit: u64) {
        let store = &mut raft_group.raft.raft_log.store;
        if let Err(e) = store.set_commit(commit) {
            log::error!("failed to persist commit index: {:?}", e);
        }
    }

    fn publish_status(&self) {
        let raft = &self.raft_group.raft;
        let mut status = self.status.lock().unwrap();
        status.is_leader = raft.state == StateRole::Leader;
        status.leader_id = raft.leader_id;
        status.term = raft.term;
        status.applied = raft.raft_log.applied();
    }

    /// Feed a proposal into the raft group. Only the leader accepts;
    /// everyone else answers `false` immediately so the caller can
    /// surface a not-leader error instead of waiting out the deadline.
    fn propose(
        raft_group: &mut RawNode<FileStorage>,
        mut proposal: Proposal,
        proposed: &mut VecDeque<Proposal>,
    ) {
        if raft_group.raft.state != StateRole::Leader {
            if let Some(sender) = proposal.propose_success.take() {
                let _ = sender.send(false);
            }
            return;
        }

        let last_index = raft_group.raft.raft_log.last_index() + 1;
        let term = raft_group.raft.term;

        if let Some(ref data) = proposal.normal {
            let _ = raft_group.propose(vec![], data.clone());
        } else if let Some(ref cc) = proposal.conf_change {
            let _ = raft_group.propose_conf_change(vec![], cc.clone());
        }

        let new_last_index = raft_group.raft.raft_log.last_index() + 1;
        if new_last_index == last_index {
            // The proposal was dropped (e.g. a membership change is
            // already in flight).
            if let Some(sender) = proposal.propose_success.take() {
                let _ = sender.send(false);
            }
        } else {
            proposal.proposed = last_index;
            proposal.proposed_term = term;
            proposed.push_back(proposal);
        }
    }
}
