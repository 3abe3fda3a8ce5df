//! Outbound Raft transport clients
//!
//! One lazily-dialed streaming client per peer. Addresses come from the
//! peer registry, which membership changes and incoming frames keep
//! current. A broken stream marks its client invalid; the next message
//! to that peer re-dials.

use crate::raft::PeerRegistry;
use pb::raft_transport_client::RaftTransportClient;
use pb::DeliverRequest;
use protobuf::Message;
use raft::prelude::Message as RaftMessage;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::sync::Mutex;

#[allow(clippy::module_inception)]
pub mod pb {
    tonic::include_proto!("transport");
}

struct PeerClient {
    sender: Sender<DeliverRequest>,
    invalid: Arc<AtomicBool>,
}

impl PeerClient {
    async fn new(addr: String) -> Result<Self, tonic::transport::Error> {
        let client = RaftTransportClient::connect(addr).await?;
        let (sender, receiver) = mpsc::channel(1000);

        // Drive the request stream from a background task; a stream
        // error invalidates this client so the next send re-dials.
        let mut client_clone = client.clone();
        let invalid = Arc::new(AtomicBool::new(false));
        let invalid_clone = invalid.clone();
        tokio::spawn(async move {
            if let Err(e) = Self::stream_messages(&mut client_clone, receiver).await {
                log::error!("streaming messages failed: {}", e);
                invalid_clone.store(true, Ordering::SeqCst);
            }
        });

        Ok(Self { sender, invalid })
    }

    async fn stream_messages(
        client: &mut RaftTransportClient<tonic::transport::Channel>,
        receiver: Receiver<DeliverRequest>,
    ) -> Result<(), tonic::Status> {
        let stream = tokio_stream::wrappers::ReceiverStream::new(receiver);
        let _ = client.deliver(stream).await?;
        Ok(())
    }
}

pub struct RaftClient {
    self_id: u64,
    self_addr: String,
    registry: PeerRegistry,
    peers: Arc<Mutex<HashMap<u64, PeerClient>>>,
}

impl RaftClient {
    pub fn new(self_id: u64, self_addr: String, registry: PeerRegistry) -> RaftClient {
        RaftClient {
            self_id,
            self_addr,
            registry,
            peers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Sends one raft message to the peer it names. Messages to unknown
    /// or unreachable peers are dropped; Raft's own retries handle the
    /// gap once the peer becomes known.
    pub async fn post_data(&self, data: RaftMessage) {
        let mut peers = self.peers.lock().await;
        let to = data.to;

        let peer_client = if let Some(client) = peers.get_mut(&to) {
            client
        } else {
            let addr = match self.registry.resolve(to) {
                Some(addr) => format!("http://{}", addr),
                None => {
                    log::warn!("no known address for peer {}, dropping message", to);
                    return;
                }
            };
            match PeerClient::new(addr).await {
                Ok(client) => {
                    peers.insert(to, client);
                    peers.get_mut(&to).unwrap()
                }
                Err(e) => {
                    log::error!("failed to create peer client: {}", e);
                    return;
                }
            }
        };

        if peer_client.invalid.load(Ordering::SeqCst) {
            peers.remove(&to);
            return;
        }

        let request = DeliverRequest {
            data: data.write_to_bytes().unwrap(),
            from_id: self.self_id,
            from_addr: self.self_addr.clone(),
        };
        if let Err(_e) = peer_client.sender.try_send(request) {
            // Raft will retry; a full queue here just means the peer is slow.
        }
    }
}
