use std::{
    collections::BTreeMap,
    io,
    net::SocketAddr,
    sync::Arc,
    time::Duration,
};

use seatlock_api::{Booking, Command, NodeId, Reply};
use thiserror::Error;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    time::timeout,
};
use tracing::{debug, info, trace, warn};

use crate::{sync::Transport, task::AutoJoinHandle, NodeError, NodeResult, NodeShared};

const SHUTDOWN_POLL: Duration = Duration::from_millis(500);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);
const WRITE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("timeout")]
    Timeout,
}

pub type ConnectionResult<T> = std::result::Result<T, ConnectionError>;

/// Outgoing queue of commands for one peer
pub struct EgressQueue {
    peer: NodeId,
    addr: SocketAddr,
    rx: flume::Receiver<Command>,
}

/// [`Transport`] handing commands to per-peer egress tasks
pub struct ChannelTransport {
    queues: BTreeMap<NodeId, flume::Sender<Command>>,
}

impl ChannelTransport {
    pub fn new(me: NodeId, members: &[SocketAddr]) -> (Self, Vec<EgressQueue>) {
        let mut queues = BTreeMap::new();
        let mut egress = vec![];

        for (peer, addr) in (1..).map(NodeId).zip(members.iter().copied()) {
            if peer == me {
                continue;
            }
            let (tx, rx) = flume::unbounded();
            queues.insert(peer, tx);
            egress.push(EgressQueue { peer, addr, rx });
        }

        (Self { queues }, egress)
    }
}

impl Transport for ChannelTransport {
    fn send(&self, peer: NodeId, command: Command) {
        match self.queues.get(&peer) {
            Some(tx) => {
                if tx.send(command).is_err() {
                    trace!(%peer, "Egress gone, dropping command");
                }
            }
            None => warn!(%peer, "No egress for peer"),
        }
    }
}

pub struct PeerHandler {
    local_addr: SocketAddr,
    #[allow(unused)]
    join_handle: AutoJoinHandle,
}

impl PeerHandler {
    pub fn new(
        shared: Arc<NodeShared>,
        listen_addr: SocketAddr,
        egress_queues: Vec<EgressQueue>,
    ) -> NodeResult<Self> {
        let rt = tokio::runtime::Runtime::new()?;

        let (tx, rx) = flume::bounded(1);

        let join_handle = AutoJoinHandle::spawn("peer-handler", move || {
            let _guard = scopeguard::guard((), |_| {
                info!("PeerHandler is done");
            });

            rt.block_on(async {
                let listener = match TcpListener::bind(listen_addr).await {
                    Ok(listener) => listener,
                    Err(e) => {
                        let _ = tx.send(Err(e));
                        return;
                    }
                };
                let _ = tx.send(listener.local_addr());

                let egress_handles: Vec<_> = egress_queues
                    .into_iter()
                    .map(|queue| {
                        let egress = PeerHandlerEgress {
                            shared: shared.clone(),
                            queue,
                        };
                        tokio::spawn(async move {
                            let guard = egress.shared.panic_guard("peer-egress");
                            egress.run().await;
                            guard.done();
                        })
                    })
                    .collect();

                tokio::spawn({
                    let shared = shared.clone();
                    async move {
                        let guard = shared.panic_guard("join-cluster");
                        match shared.sync().join_cluster().await {
                            Ok(()) => info!(status = %shared.sync().status(), "Joined cluster"),
                            Err(e) => warn!("Joining cluster failed: {e}"),
                        }
                        guard.done();
                    }
                });

                (PeerHandlerIngress { shared }).run(listener).await;

                for handle in egress_handles {
                    if let Err(e) = handle.await {
                        warn!("Egress task failed: {e}");
                    }
                }
            });

            info!("Waiting for PeerHandler to complete all connections...");
            rt.shutdown_timeout(Duration::from_secs(1));
        })?;

        let local_addr = rx.recv().map_err(|_| NodeError::Startup)??;

        Ok(Self {
            local_addr,
            join_handle,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

pub struct PeerHandlerIngress {
    shared: Arc<NodeShared>,
}

impl PeerHandlerIngress {
    async fn run(self, listener: TcpListener) {
        while !self.shared.is_node_shutting_down() {
            let (stream, addr) = match timeout(SHUTDOWN_POLL, listener.accept()).await {
                Ok(Ok(accepted)) => accepted,
                Ok(Err(e)) => {
                    warn!("Failed to accept connection: {e}");
                    continue;
                }
                Err(_) => continue,
            };
            debug!(%addr, "Accepted connection");

            let shared = self.shared.clone();
            tokio::spawn(async move {
                let guard = shared.panic_guard("connection");
                if let Err(e) = Self::handle_connection(&shared, stream).await {
                    debug!(%addr, "Connection error: {e}");
                }
                debug!(%addr, "Connection closed");
                guard.done();
            });
        }
    }

    /// Serve one connection, peer commands and client bookings alike
    async fn handle_connection(shared: &NodeShared, stream: TcpStream) -> ConnectionResult<()> {
        let (read, mut write) = stream.into_split();
        let mut lines = BufReader::new(read).lines();

        while !shared.is_node_shutting_down() {
            let line = match timeout(SHUTDOWN_POLL, lines.next_line()).await {
                Ok(Ok(Some(line))) => line,
                Ok(Ok(None)) => return Ok(()),
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => continue,
            };

            if line.trim().is_empty() {
                continue;
            }

            if Command::is_peer_line(&line) {
                match Command::decode(&line) {
                    Ok(command) => shared.sync().on_command(command),
                    Err(e) => warn!(%line, "Malformed peer command: {e}"),
                }
                continue;
            }

            let reply = match Booking::decode(&line) {
                Ok(booking) => match shared.sync().execute(booking).await {
                    Ok(reply) => reply,
                    Err(e) => Reply::Error(e.to_string()),
                },
                Err(e) => Reply::Error(e.to_string()),
            };

            let mut out = reply.encode();
            out.push('\n');
            timeout(WRITE_TIMEOUT, write.write_all(out.as_bytes()))
                .await
                .map_err(|_| ConnectionError::Timeout)??;
        }
        Ok(())
    }
}

pub struct PeerHandlerEgress {
    shared: Arc<NodeShared>,
    queue: EgressQueue,
}

impl PeerHandlerEgress {
    /// Deliver queued commands to the peer
    ///
    /// Connects lazily and reconnects after the peer went away. A command
    /// that can't be delivered marks the peer offline and is dropped.
    async fn run(&self) {
        let peer = self.queue.peer;
        let mut conn: Option<TcpStream> = None;

        while !self.shared.is_node_shutting_down() {
            let command = match timeout(SHUTDOWN_POLL, self.queue.rx.recv_async()).await {
                Ok(Ok(command)) => command,
                Ok(Err(_)) => {
                    debug!(%peer, "Egress queue closed");
                    return;
                }
                Err(_) => continue,
            };

            if conn.as_ref().map_or(false, Self::is_closed) {
                debug!(%peer, "Peer closed connection, reconnecting");
                conn = None;
            }

            let mut line = command.encode();
            line.push('\n');

            match self.send_line(&mut conn, &line).await {
                Ok(()) => trace!(%peer, command = command.kind.name(), "Sent"),
                Err(e) => {
                    debug!(%peer, addr = %self.queue.addr, command = command.kind.name(), "Failed to send: {e}");
                    conn = None;
                    self.shared.sync().report_unreachable(peer);
                }
            }
        }
    }

    async fn send_line(&self, conn: &mut Option<TcpStream>, line: &str) -> ConnectionResult<()> {
        let stream = match conn.take() {
            Some(stream) => stream,
            None => self.connect().await?,
        };
        let stream = conn.insert(stream);

        timeout(WRITE_TIMEOUT, stream.write_all(line.as_bytes()))
            .await
            .map_err(|_| ConnectionError::Timeout)??;
        Ok(())
    }

    async fn connect(&self) -> ConnectionResult<TcpStream> {
        let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(self.queue.addr))
            .await
            .map_err(|_| ConnectionError::Timeout)??;
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    /// Peers never write on our outgoing connection, so readable means EOF
    fn is_closed(stream: &TcpStream) -> bool {
        let mut buf = [0u8; 1];
        match stream.try_read(&mut buf) {
            Ok(_) => true,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => false,
            Err(_) => true,
        }
    }
}
