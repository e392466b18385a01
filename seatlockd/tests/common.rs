#![allow(unused)]

use anyhow::{bail, Result};
use seatlock_api::{NodeId, PeerStatus};
use seatlockd::{Node, NodeCtrl, Parameters};
use std::collections::BTreeMap;
use std::net::{SocketAddr, TcpListener};
use std::time::{Duration, Instant};

/// Cluster of in-process `seatlockd` nodes on localhost
///
/// Addresses for all members are picked upfront; nodes are started on
/// demand, so a member can join late.
pub struct TestCluster {
    addrs: Vec<SocketAddr>,
    seats: u32,
    nodes: BTreeMap<NodeId, Node>,
}

impl TestCluster {
    pub fn new(size: usize, seats: u32) -> Result<Self> {
        // Bind all at once so the OS hands out distinct ports
        let listeners = (0..size)
            .map(|_| TcpListener::bind("127.0.0.1:0"))
            .collect::<std::io::Result<Vec<_>>>()?;
        let addrs = listeners
            .iter()
            .map(TcpListener::local_addr)
            .collect::<std::io::Result<Vec<_>>>()?;
        drop(listeners);

        Ok(Self {
            addrs,
            seats,
            nodes: BTreeMap::new(),
        })
    }

    /// Start every member one by one
    pub async fn start_all(size: usize, seats: u32) -> Result<Self> {
        let mut cluster = Self::new(size, seats)?;
        for id in cluster.ids() {
            cluster.start(id).await?;
        }
        Ok(cluster)
    }

    pub fn ids(&self) -> Vec<NodeId> {
        (1..=self.addrs.len())
            .map(|i| NodeId(u32::try_from(i).expect("small cluster")))
            .collect()
    }

    /// Start member `id` and wait until it is ready
    pub async fn start(&mut self, id: NodeId) -> Result<()> {
        let params = Parameters::builder()
            .id(id)
            .peers(self.addrs.clone())
            .seats(self.seats)
            .ack_timeout(Duration::from_secs(2))
            .join_timeout(Duration::from_secs(1))
            .build();
        let node = Node::new(params)?;
        self.nodes.insert(id, node);
        self.wait_ready(id).await
    }

    pub async fn wait_ready(&self, id: NodeId) -> Result<()> {
        let ctrl = self.ctrl(id);
        self.wait_until(|| ctrl.status() == PeerStatus::Ready)
            .await
            .map_err(|_| anyhow::format_err!("node {id} did not become ready: {}", ctrl.status()))
    }

    /// Poll `cond` until it holds, for up to 10 seconds
    pub async fn wait_until(&self, mut cond: impl FnMut() -> bool) -> Result<()> {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !cond() {
            if deadline < Instant::now() {
                bail!("condition not reached in time");
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        Ok(())
    }

    pub fn ctrl(&self, id: NodeId) -> NodeCtrl {
        self.nodes
            .get(&id)
            .expect("Node was not started")
            .get_ctrl()
    }

    pub fn addr(&self, id: NodeId) -> SocketAddr {
        self.ctrl(id).local_addr()
    }

    pub async fn client(&self, id: NodeId) -> Result<seatlock::tokio::Client> {
        Ok(seatlock::tokio::Client::connect(self.addr(id)).await?)
    }
}

impl Drop for TestCluster {
    fn drop(&mut self) {
        for node in self.nodes.values() {
            node.get_ctrl().stop();
        }
        self.nodes.clear();
    }
}

impl TestCluster {
    /// Stop member `id` and wait for its thread to finish
    pub fn stop(&mut self, id: NodeId) {
        if let Some(node) = self.nodes.remove(&id) {
            node.get_ctrl().stop();
        }
    }
}
