#![allow(clippy::field_reassign_with_default)]

use tokio::sync::oneshot;
use tokio::sync::oneshot::Receiver;
use tokio::sync::oneshot::Sender;

use raft::prelude::*;

/// A pending client proposal handed to the consensus task.
///
/// The oneshot fires `true` only once the proposed entry has been
/// committed and applied under the term it was proposed in. A non-leader
/// node, a dropped proposal, or an entry overwritten by a newer leader
/// all fire `false`.
pub struct Proposal {
    pub normal: Option<Vec<u8>>, // opaque command payload
    pub conf_change: Option<ConfChange>, // membership change
    // Set when accepted into the log: the entry's index and the term it
    // was proposed under.
    pub proposed: u64,
    pub proposed_term: u64,
    pub propose_success: Option<Sender<bool>>,
}

impl Proposal {
    pub fn conf_change(cc: &ConfChange) -> (Self, Receiver<bool>) {
        let (tx, rx) = oneshot::channel();
        let proposal = Proposal {
            normal: None,
            conf_change: Some(cc.clone()),
            proposed: 0,
            proposed_term: 0,
            propose_success: Some(tx),
        };
        (proposal, rx)
    }

    pub fn normal(data: Vec<u8>) -> (Self, Receiver<bool>) {
        let (tx, rx) = oneshot::channel();
        let proposal = Proposal {
            normal: Some(data),
            conf_change: None,
            proposed: 0,
            proposed_term: 0,
            propose_success: Some(tx),
        };
        (proposal, rx)
    }
}
