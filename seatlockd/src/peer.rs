use std::collections::BTreeMap;
use std::net::SocketAddr;

use seatlock_api::{NodeId, PeerStatus};
use tracing::debug;

/// What a node knows about one member of the cluster
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub id: NodeId,
    pub addr: SocketAddr,
    pub status: PeerStatus,
}

/// Static membership with dynamic lifecycle state
///
/// Includes the local node itself, so its own status lives here too.
#[derive(Debug)]
pub struct PeerTable {
    me: NodeId,
    peers: BTreeMap<NodeId, PeerInfo>,
}

impl PeerTable {
    /// Build from membership addresses, indexed from 1
    pub fn new(me: NodeId, addrs: &[SocketAddr]) -> Self {
        let peers = (1u32..)
            .zip(addrs)
            .map(|(i, addr)| {
                let id = NodeId(i);
                let status = if id == me {
                    PeerStatus::Join
                } else {
                    PeerStatus::Unknown
                };
                (
                    id,
                    PeerInfo {
                        id,
                        addr: *addr,
                        status,
                    },
                )
            })
            .collect();
        Self { me, peers }
    }

    pub fn my_status(&self) -> PeerStatus {
        self.status(self.me).unwrap_or_default()
    }

    pub fn status(&self, id: NodeId) -> Option<PeerStatus> {
        self.peers.get(&id).map(|p| p.status)
    }

    /// Update the status of `id`, returning the previous one
    ///
    /// Unknown ids are ignored.
    pub fn set_status(&mut self, id: NodeId, status: PeerStatus) -> Option<PeerStatus> {
        let peer = self.peers.get_mut(&id)?;
        let prev = std::mem::replace(&mut peer.status, status);
        if prev != status {
            debug!(peer = %id, addr = %peer.addr, from = %prev, to = %status, "Peer status change");
        }
        Some(prev)
    }

    /// Every other member
    pub fn others(&self) -> impl Iterator<Item = &PeerInfo> + '_ {
        self.peers.values().filter(move |p| p.id != self.me)
    }

    /// Other members counted for quorum
    pub fn ready(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.others()
            .filter(|p| p.status == PeerStatus::Ready)
            .map(|p| p.id)
    }

    pub fn ready_count(&self) -> usize {
        self.ready().count()
    }

    /// Other members broadcasts are sent to
    pub fn reachable(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.others()
            .filter(|p| p.status.is_reachable())
            .map(|p| p.id)
    }

    pub fn first_ready(&self) -> Option<NodeId> {
        self.ready().next()
    }
}
