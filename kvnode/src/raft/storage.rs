//! Raft storage implementation
//!
//! Persistent storage for the consensus log and stable state. Entries live
//! in an append-only `logs.dat`; term, vote, commit index and membership
//! live in `state.dat`, rewritten atomically on change. Both are loaded
//! into a `MemStorage` at startup, which serves all reads.

use crate::raft::log_file::LogFile;
use protobuf::Message;
use raft::eraftpb::{ConfState, Entry, HardState, Snapshot};
use raft::{storage::MemStorage, GetEntriesContext, RaftState, Result, Storage};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

const LOG_FILE: &str = "logs.dat";
const STATE_FILE: &str = "state.dat";

/// Durable Raft state beyond the entry log.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct StableState {
    term: u64,
    vote: u64,
    commit: u64,
    voters: Vec<u64>,
    learners: Vec<u64>,
}

/// File-backed storage for a Raft node.
///
/// The log is never compacted in this version (snapshots are stubbed), so
/// `logs.dat` always holds every entry from index 1 and a restart can
/// rebuild the state machine by replaying it in full.
pub struct FileStorage {
    mem_storage: MemStorage, // in-memory mirror serving the Storage trait
    log: LogFile,
    stable: StableState,
    state_path: PathBuf,
}

impl FileStorage {
    /// Opens storage under `base_path`, rehydrating any persisted state.
    ///
    /// `bootstrap_as` seeds this node as the sole voter of a fresh
    /// cluster. It only takes effect on a virgin data directory; a
    /// directory that already holds state keeps it.
    pub fn open<P: AsRef<Path>>(base_path: P, bootstrap_as: Option<u64>) -> Result<Self> {
        let base_path = base_path.as_ref().to_path_buf();
        fs::create_dir_all(&base_path)?;

        let mem_storage = MemStorage::new();
        let state_path = base_path.join(STATE_FILE);

        let mut stable = if state_path.exists() {
            let state_bytes = fs::read(&state_path).map_err(store_err)?;
            let stable: StableState = bincode::deserialize(&state_bytes).map_err(store_err)?;

            if !stable.voters.is_empty() || !stable.learners.is_empty() {
                let mut cs = ConfState::default();
                cs.set_voters(stable.voters.clone());
                cs.set_learners(stable.learners.clone());
                mem_storage.wl().set_conf_state(cs);
            }
            stable
        } else {
            let mut stable = StableState::default();
            if let Some(id) = bootstrap_as {
                stable.voters = vec![id];
                let mut cs = ConfState::default();
                cs.set_voters(stable.voters.clone());
                mem_storage.wl().set_conf_state(cs);
                persist_stable(&state_path, &stable)?;
            }
            stable
        };

        let mut log = LogFile::open(base_path.join(LOG_FILE), 1).map_err(store_err)?;

        // Replay the durable log into the in-memory mirror.
        let mut entries = Vec::new();
        for index in log.first_index()..=log.last_index() {
            let frame = log.read(index).map_err(store_err)?;
            let mut entry = Entry::default();
            entry.merge_from_bytes(&frame).map_err(store_err)?;
            entries.push(entry);
        }
        let last_replayed = entries.last().map(|e| e.index).unwrap_or(0);
        if !entries.is_empty() {
            mem_storage.wl().append(&entries)?;
        }

        // A torn tail dropped by the log file can leave the persisted
        // commit index past the surviving entries. Commit regression is
        // safe; the leader will re-advance it.
        if stable.commit > last_replayed {
            log::warn!(
                "commit index {} exceeds replayed log end {}, regressing",
                stable.commit,
                last_replayed
            );
            stable.commit = last_replayed;
        }
        let mut hs = HardState::default();
        hs.set_term(stable.term);
        hs.set_vote(stable.vote);
        hs.set_commit(stable.commit);
        mem_storage.wl().set_hardstate(hs);

        Ok(FileStorage {
            mem_storage,
            log,
            stable,
            state_path,
        })
    }

    /// Whether `base_path` already holds a bootstrapped or joined node.
    pub fn is_initialized<P: AsRef<Path>>(base_path: P) -> bool {
        base_path.as_ref().join(STATE_FILE).exists()
    }

    /// Appends entries to memory and the durable log. A conflicting
    /// suffix (leader overwrite) is truncated by the log file.
    pub fn append_entries(&mut self, entries: &[Entry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        self.mem_storage.wl().append(entries)?;

        let mut frames = Vec::with_capacity(entries.len());
        for entry in entries {
            frames.push(entry.write_to_bytes().map_err(store_err)?);
        }
        self.log
            .append(entries[0].index, &frames)
            .map_err(store_err)?;
        Ok(())
    }

    pub fn set_hardstate(&mut self, hs: HardState) -> Result<()> {
        self.stable.term = hs.term;
        self.stable.vote = hs.vote;
        self.stable.commit = hs.commit;
        self.mem_storage.wl().set_hardstate(hs);
        persist_stable(&self.state_path, &self.stable)
    }

    pub fn set_commit(&mut self, commit: u64) -> Result<()> {
        if self.stable.commit == commit {
            return Ok(());
        }
        self.stable.commit = commit;
        self.mem_storage.wl().mut_hard_state().set_commit(commit);
        persist_stable(&self.state_path, &self.stable)
    }

    pub fn set_conf_state(&mut self, conf_state: ConfState) -> Result<()> {
        self.stable.voters = conf_state.voters.clone();
        self.stable.learners = conf_state.learners.clone();
        self.mem_storage.wl().set_conf_state(conf_state);
        persist_stable(&self.state_path, &self.stable)
    }

    /// Installs a snapshot into the in-memory mirror and stable state.
    ///
    /// Only reachable when a leader has compacted its log past a
    /// follower's match index, which this version never does (snapshots
    /// are stubbed and the log is never truncated). The durable entry
    /// log is left untouched.
    pub fn apply_snapshot(&mut self, snapshot: &Snapshot) -> Result<()> {
        let meta = snapshot.get_metadata();
        self.stable.term = self.stable.term.max(meta.term);
        self.stable.commit = meta.index;
        self.stable.voters = meta.get_conf_state().voters.clone();
        self.stable.learners = meta.get_conf_state().learners.clone();
        self.mem_storage.wl().apply_snapshot(snapshot.clone())?;
        persist_stable(&self.state_path, &self.stable)
    }

    pub fn commit(&self) -> u64 {
        self.stable.commit
    }

    pub fn voters(&self) -> Vec<u64> {
        self.stable.voters.clone()
    }
}

fn store_err<E: std::error::Error + Send + Sync + 'static>(e: E) -> raft::Error {
    raft::Error::Store(raft::StorageError::Other(Box::new(e)))
}

/// Writes the stable state via tmp + rename so a crash never leaves a
/// half-written file.
fn persist_stable(path: &Path, stable: &StableState) -> Result<()> {
    let bytes = bincode::serialize(stable).map_err(store_err)?;
    let tmp_path = path.with_extension("tmp");
    {
        let mut tmp = fs::File::create(&tmp_path).map_err(store_err)?;
        tmp.write_all(&bytes).map_err(store_err)?;
        tmp.sync_all().map_err(store_err)?;
    }
    fs::rename(&tmp_path, path).map_err(store_err)?;
    Ok(())
}

impl Storage for FileStorage {
    fn initial_state(&self) -> Result<RaftState> {
        self.mem_storage.initial_state()
    }

    fn entries(
        &self,
        low: u64,
        high: u64,
        max_size: impl Into<Option<u64>>,
        context: GetEntriesContext,
    ) -> Result<Vec<Entry>> {
        self.mem_storage.entries(low, high, max_size, context)
    }

    fn term(&self, idx: u64) -> Result<u64> {
        self.mem_storage.term(idx)
    }

    fn first_index(&self) -> Result<u64> {
        self.mem_storage.first_index()
    }

    fn last_index(&self) -> Result<u64> {
        self.mem_storage.last_index()
    }

    fn snapshot(&self, request_index: u64, to: u64) -> Result<Snapshot> {
        self.mem_storage.snapshot(request_index, to)
    }
}
