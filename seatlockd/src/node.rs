mod peer_handler;

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use convi::ExpectFrom;
use seatlock_api::{NodeId, PeerStatus};
use signal_hook::consts::TERM_SIGNALS;
use signal_hook::flag;
use thiserror::Error;
use tracing::{debug, info, trace};
use typed_builder::TypedBuilder;

use crate::node::peer_handler::{ChannelTransport, PeerHandler};
use crate::store::BookKeeper;
use crate::sync::{SyncParams, Synchronizer};
use crate::task::PanicGuard;

/// Some parameters of runtime operation
#[derive(TypedBuilder, Debug, Clone)]
pub struct Parameters {
    /// Our own position in `peers`, counted from 1
    pub id: NodeId,

    /// Cluster membership in id order; our own entry is the listen address
    pub peers: Vec<SocketAddr>,

    /// Size of the seat pool
    #[builder(default = Parameters::DEFAULT_SEATS)]
    pub seats: u32,

    /// How long a critical section request waits for acks before
    /// silent peers are demoted to offline
    #[builder(default = Parameters::DEFAULT_ACK_TIMEOUT)]
    pub ack_timeout: Duration,

    /// How long joining waits for peers to answer
    #[builder(default = Parameters::DEFAULT_JOIN_TIMEOUT)]
    pub join_timeout: Duration,
}

impl Parameters {
    pub const DEFAULT_SEATS: u32 = 10;
    pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(5);
    pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

    pub fn listen_addr(&self) -> NodeResult<SocketAddr> {
        self.id
            .0
            .checked_sub(1)
            .and_then(|i| self.peers.get(usize::expect_from(i)))
            .copied()
            .ok_or(NodeError::InvalidId {
                id: self.id,
                members: self.peers.len(),
            })
    }

    fn sync_params(&self) -> SyncParams {
        SyncParams {
            ack_timeout: self.ack_timeout,
            join_timeout: self.join_timeout,
        }
    }
}

#[derive(Error, Debug)]
pub enum NodeError {
    #[error("node id {id} is not in a membership of {members}")]
    InvalidId { id: NodeId, members: usize },
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("node thread exited during startup")]
    Startup,
}

pub type NodeResult<T> = std::result::Result<T, NodeError>;

/// State shared by all the node's tasks
pub struct NodeShared {
    is_node_shutting_down: Arc<AtomicBool>,
    sync: Arc<Synchronizer>,
}

impl NodeShared {
    pub fn panic_guard(&self, name: &'static str) -> PanicGuard {
        PanicGuard::new(name, self.is_node_shutting_down.clone())
    }

    pub fn is_node_shutting_down(&self) -> bool {
        self.is_node_shutting_down.load(Ordering::SeqCst)
    }

    pub fn sync(&self) -> &Arc<Synchronizer> {
        &self.sync
    }
}

pub struct NodeCtrl {
    is_node_shutting_down: Arc<AtomicBool>,
    local_addr: SocketAddr,
    sync: Arc<Synchronizer>,
}

impl NodeCtrl {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn id(&self) -> NodeId {
        self.sync.id()
    }

    pub fn status(&self) -> PeerStatus {
        self.sync.status()
    }

    pub fn peer_status(&self, peer: NodeId) -> Option<PeerStatus> {
        self.sync.peer_status(peer)
    }

    pub fn ready_peer_count(&self) -> usize {
        self.sync.ready_peer_count()
    }

    pub fn stop(&self) {
        self.is_node_shutting_down.store(true, Ordering::SeqCst);
    }

    pub fn install_signal_handler(&self) -> anyhow::Result<()> {
        debug!("Installing signal handler");
        for sig in TERM_SIGNALS {
            trace!(sig, "Installing signal handler");
            flag::register(*sig, Arc::clone(&self.is_node_shutting_down))?;
        }
        Ok(())
    }
}

pub struct Node {
    is_node_shutting_down: Arc<AtomicBool>,
    stop_on_drop: bool,
    sync: Arc<Synchronizer>,
    /// Thread running the tokio runtime with all connection handling
    peer_handler: PeerHandler,
}

impl Drop for Node {
    fn drop(&mut self) {
        if self.stop_on_drop {
            self.is_node_shutting_down.store(true, Ordering::SeqCst);
        }
    }
}

impl Node {
    pub fn new(params: Parameters) -> NodeResult<Self> {
        let listen = params.listen_addr()?;
        info!(
            id = %params.id,
            %listen,
            members = params.peers.len(),
            seats = params.seats,
            "Starting seatlockd"
        );

        let is_node_shutting_down = Arc::new(AtomicBool::new(false));
        let store = Arc::new(BookKeeper::new(params.seats));
        let (transport, egress_queues) = ChannelTransport::new(params.id, &params.peers);

        let sync = Arc::new(Synchronizer::new(
            params.id,
            &params.peers,
            store,
            Arc::new(transport),
            params.sync_params(),
        ));

        let shared = Arc::new(NodeShared {
            is_node_shutting_down: is_node_shutting_down.clone(),
            sync: sync.clone(),
        });

        let peer_handler = PeerHandler::new(shared, listen, egress_queues)?;

        Ok(Node {
            is_node_shutting_down,
            stop_on_drop: true,
            sync,
            peer_handler,
        })
    }

    pub fn get_ctrl(&self) -> NodeCtrl {
        NodeCtrl {
            is_node_shutting_down: Arc::clone(&self.is_node_shutting_down),
            local_addr: self.peer_handler.local_addr(),
            sync: self.sync.clone(),
        }
    }

    /// Block until the node is stopped
    pub fn wait(mut self) {
        self.stop_on_drop = false;
        drop(self);
        info!("Node finished");
    }
}

#[test]
fn listen_addr_is_own_membership_entry() {
    let peers: Vec<SocketAddr> = vec![
        "127.0.0.1:7001".parse().unwrap(),
        "127.0.0.1:7002".parse().unwrap(),
    ];
    let params = |id| Parameters::builder().id(NodeId(id)).peers(peers.clone()).build();

    assert_eq!(params(2).listen_addr().unwrap(), peers[1]);
    assert!(matches!(
        params(0).listen_addr(),
        Err(NodeError::InvalidId { members: 2, .. })
    ));
    assert!(params(3).listen_addr().is_err());
    assert_eq!(params(1).seats, Parameters::DEFAULT_SEATS);
}
