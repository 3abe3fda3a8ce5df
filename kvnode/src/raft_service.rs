//! Raft transport service
//!
//! This module implements the gRPC service for Raft communication between
//! nodes. Peers stream serialized raft messages; each frame also names
//! its sender so the receiver learns peer addresses before membership
//! entries reach it.

use crate::raft::PeerRegistry;
use pb::raft_transport_server::RaftTransport;
use pb::{DeliverAck, DeliverRequest};
use protobuf::Message;
use raft::prelude::Message as RaftMessage;
use tokio::sync::mpsc::Sender;
use tonic::Streaming;

/// Protocol buffer definitions for the transport service
#[allow(clippy::module_inception)]
pub mod pb {
    tonic::include_proto!("transport");
}

/// Raft transport service implementation
pub struct RaftTransportSVC {
    in_mailbox: Sender<RaftMessage>,
    registry: PeerRegistry,
}

impl RaftTransportSVC {
    pub fn new(in_mailbox: Sender<RaftMessage>, registry: PeerRegistry) -> RaftTransportSVC {
        RaftTransportSVC {
            in_mailbox,
            registry,
        }
    }
}

#[tonic::async_trait]
impl RaftTransport for RaftTransportSVC {
    /// Handles a stream of raft messages from one peer.
    ///
    /// Each frame registers the sender's advertise address, is parsed,
    /// and forwarded to the consensus task's mailbox. Invalid frames are
    /// logged and skipped; Raft retries on its own.
    async fn deliver(
        &self,
        request: tonic::Request<Streaming<DeliverRequest>>,
    ) -> Result<tonic::Response<DeliverAck>, tonic::Status> {
        let mut stream = request.into_inner();
        while let Some(req) = stream.message().await? {
            self.registry.register(req.from_id, &req.from_addr);
            match RaftMessage::parse_from_bytes(req.data.as_slice()) {
                Ok(message) => {
                    if let Err(e) = self.in_mailbox.send(message).await {
                        log::warn!("raft mailbox send error: {}", e);
                        continue;
                    }
                }
                Err(e) => {
                    log::warn!("raft message parse error: {}", e);
                    continue;
                }
            }
        }
        Ok(tonic::Response::new(DeliverAck::default()))
    }
}
