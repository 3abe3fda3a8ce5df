//! Server coordinator
//!
//! Wires the components into one node: KV store, state machine,
//! consensus task, outbound transport pump, Raft gRPC transport,
//! management endpoint, join routine, and client ingress. Owns no
//! durable state itself.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use raft::eraftpb::{ConfChange, ConfChangeType};
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::task::JoinHandle;

use crate::config::RuntimeConfig;
use crate::error::ProposeError;
use crate::ingress;
use crate::join;
use crate::management;
use crate::metrics;
use crate::raft::node::RaftNode;
use crate::raft::proposal::Proposal;
use crate::raft::storage::FileStorage;
use crate::raft::{ClusterStatus, PeerRegistry};
use crate::raft_client::RaftClient;
use crate::raft_service::pb::raft_transport_server::RaftTransportServer;
use crate::raft_service::RaftTransportSVC;
use crate::state_kv::StateKv;
use crate::store::KvStore;

const PROPOSE_TIMEOUT: Duration = Duration::from_secs(5);
const IN_MAILBOX_SIZE: usize = 1000;
const PROPOSAL_QUEUE_SIZE: usize = 64;

type StartResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// Cheap, cloneable view of the node that the HTTP adapters consume:
/// the proposal path, local reads, membership changes, and status.
#[derive(Clone)]
pub struct NodeHandle {
    node_id: u64,
    advertise_addr: String,
    store: Arc<KvStore>,
    proposals: Sender<Proposal>,
    status: Arc<StdMutex<ClusterStatus>>,
    registry: PeerRegistry,
}

impl NodeHandle {
    /// Forwards an opaque, already-encoded command payload to the
    /// consensus engine. Resolves once the entry is committed (and
    /// applied locally), or fails within the 5 s deadline.
    pub async fn propose(&self, payload: Vec<u8>) -> Result<(), ProposeError> {
        let (proposal, rx) = Proposal::normal(payload);
        self.proposals
            .send(proposal)
            .await
            .map_err(|_| ProposeError::Closed)?;

        match tokio::time::timeout(PROPOSE_TIMEOUT, rx).await {
            Err(_) => {
                metrics::PROPOSAL_COUNTER_VEC
                    .with_label_values(&["timeout"])
                    .inc();
                Err(ProposeError::Timeout)
            }
            Ok(Err(_)) => Err(ProposeError::Closed),
            Ok(Ok(true)) => {
                metrics::PROPOSAL_COUNTER_VEC
                    .with_label_values(&["committed"])
                    .inc();
                Ok(())
            }
            Ok(Ok(false)) => {
                metrics::PROPOSAL_COUNTER_VEC
                    .with_label_values(&["rejected"])
                    .inc();
                Err(ProposeError::Rejected)
            }
        }
    }

    /// Proposes a membership change adding `id` as a voter, reachable at
    /// `addr`. Leader-only, like any proposal.
    pub async fn add_voter(&self, id: u64, addr: String) -> Result<(), ProposeError> {
        let mut cc = ConfChange::default();
        cc.node_id = id;
        cc.set_change_type(ConfChangeType::AddNode);
        cc.set_context(addr.into_bytes().into());

        let (proposal, rx) = Proposal::conf_change(&cc);
        self.proposals
            .send(proposal)
            .await
            .map_err(|_| ProposeError::Closed)?;

        match tokio::time::timeout(PROPOSE_TIMEOUT, rx).await {
            Err(_) => Err(ProposeError::Timeout),
            Ok(Err(_)) => Err(ProposeError::Closed),
            Ok(Ok(true)) => Ok(()),
            Ok(Ok(false)) => Err(ProposeError::Rejected),
        }
    }

    /// Local read; never goes through Raft (stale-tolerant by design).
    pub fn get(&self, key: &str) -> Option<String> {
        self.store.get(key)
    }

    pub fn is_leader(&self) -> bool {
        self.status.lock().unwrap().is_leader
    }

    /// Advertise address of the current leader, or empty when unknown.
    pub fn leader_addr(&self) -> String {
        let leader_id = self.status.lock().unwrap().leader_id;
        if leader_id == 0 {
            return String::new();
        }
        if leader_id == self.node_id {
            return self.advertise_addr.clone();
        }
        self.registry.resolve(leader_id).unwrap_or_default()
    }
}

pub struct Server {
    handle: NodeHandle,
    tasks: Vec<JoinHandle<()>>,
}

impl Server {
    /// Boots a node from its configuration and starts serving.
    pub async fn start(config: RuntimeConfig) -> StartResult<Server> {
        config.validate()?;

        let advertise_addr = config.advertise_addr();
        log::info!(
            "node {} starting (bind: {}, advertise: {}, mgmt: {}, ingress: {})",
            config.node_id,
            config.raft_bind_addr(),
            advertise_addr,
            config.mgmt_bind_addr(),
            config.ingress_bind_addr()
        );

        let store = Arc::new(KvStore::open(&config.kv_path));
        let state_machine = StateKv::new(store.clone());

        let registry = PeerRegistry::new();
        registry.register(config.node_id, &advertise_addr);
        let status = Arc::new(StdMutex::new(ClusterStatus::default()));

        if config.bootstrap && FileStorage::is_initialized(&config.data_dir) {
            log::info!("cluster already bootstrapped, keeping existing state");
        }

        let (in_mailbox, in_rx) = mpsc::channel(IN_MAILBOX_SIZE);
        let (proposals, proposal_rx) = mpsc::channel(PROPOSAL_QUEUE_SIZE);

        let (out_mailbox, raft_task) = RaftNode::start(
            config.node_id,
            config.bootstrap,
            &config.data_dir,
            state_machine,
            in_rx,
            proposal_rx,
            registry.clone(),
            status.clone(),
        )?;

        metrics::init_registry();

        let handle = NodeHandle {
            node_id: config.node_id,
            advertise_addr: advertise_addr.clone(),
            store,
            proposals,
            status,
            registry: registry.clone(),
        };

        let mut tasks = vec![raft_task];

        let client = RaftClient::new(config.node_id, advertise_addr.clone(), registry.clone());
        tasks.push(Self::start_out_message_pump(out_mailbox, client));
        tasks.push(Self::start_transport_server(
            config.raft_bind_addr().parse()?,
            in_mailbox,
            registry,
        ));
        tasks.push(management::spawn(
            config.mgmt_bind_addr().parse()?,
            handle.clone(),
        )?);

        if let Some(ref join_addr) = config.join_addr {
            tasks.push(tokio::spawn(join::join_cluster(
                join_addr.clone(),
                config.node_id,
                advertise_addr,
            )));
        }

        tasks.push(ingress::spawn(
            config.ingress_bind_addr().parse()?,
            handle.clone(),
        )?);

        Ok(Server { handle, tasks })
    }

    /// The view the HTTP adapters (and tests) use.
    pub fn handle(&self) -> NodeHandle {
        self.handle.clone()
    }

    /// Stops serving. Ingress and management go down with the task
    /// aborts; in-flight proposals resolve as cancelled when the
    /// consensus task drops their oneshot senders.
    pub fn stop(&mut self) {
        if self.tasks.is_empty() {
            return;
        }
        log::info!("server stop");
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }

    fn start_transport_server(
        addr: SocketAddr,
        in_mailbox: Sender<raft::prelude::Message>,
        registry: PeerRegistry,
    ) -> JoinHandle<()> {
        let service = RaftTransportSVC::new(in_mailbox, registry);
        let server = tonic::transport::Server::builder()
            .add_service(RaftTransportServer::new(service))
            .serve(addr);
        log::info!("raft transport listening on {}", addr);
        tokio::spawn(async move {
            if let Err(e) = server.await {
                log::error!("raft transport server error: {}", e);
            }
        })
    }

    /// Drains the consensus task's outbound mailbox into per-peer
    /// streaming clients.
    fn start_out_message_pump(
        mut out_mailbox: Receiver<raft::prelude::Message>,
        client: RaftClient,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let client = Arc::new(client);
            while let Some(msg) = out_mailbox.recv().await {
                let client = client.clone();
                tokio::spawn(async move {
                    client.post_data(msg).await;
                });
            }
        })
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}
