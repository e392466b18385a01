//! Cluster-wide mutual exclusion
//!
//! Lamport clock + request/ack/release broadcast. Every node keeps a ledger
//! of all outstanding requests; a node runs its own request once every
//! ready peer acknowledged it and it is the ledger minimum.
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use seatlock_api::{
    Booking, Command, CommandKind, NodeId, PeerStatus, Reply, RequestKey, Timestamp,
};
use thiserror::Error;
use tokio::sync::{watch, Notify};
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, info, trace, warn};

use crate::admission::{AdmissionController, CsMode};
use crate::clock::LogicalClock;
use crate::ledger::{Operation, PendingRequest, ReleaseQueue, RequestLedger};
use crate::peer::PeerTable;
use crate::store::Resource;

#[cfg(test)]
mod tests;

/// Outbound side of the peer protocol
pub trait Transport: Send + Sync {
    /// Queue `command` for delivery to `peer`
    ///
    /// Must not block. Delivery is best effort; commands to the same peer
    /// arrive in the order they were queued.
    fn send(&self, peer: NodeId, command: Command);
}

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("synchronizer closed")]
    Closed,
}

pub type SyncResult<T> = std::result::Result<T, SyncError>;

/// Ack timeouts a fully acked local request may stay blocked by the same
/// remote request before its owner is demoted
const STALL_ROUNDS: u32 = 3;

#[derive(Debug, Clone, Copy)]
pub struct SyncParams {
    /// How long a request cycle waits for acks before demoting silent peers
    pub ack_timeout: Duration,
    /// How long joining waits for peers to answer `JOIN`
    pub join_timeout: Duration,
}

/// Everything admission decisions read, guarded together
#[derive(Debug)]
struct SyncState {
    peers: PeerTable,
    ledger: RequestLedger,
    admission: AdmissionController,
    /// Joining peers waiting for a copy of the store
    snapshot_waiters: Vec<SnapshotWaiter>,
    /// Replicated bookings on their way into the store
    released: ReleaseQueue,
    /// Highest clock received from each peer
    last_heard: BTreeMap<NodeId, Timestamp>,
    /// Remote request blocking a fully acked local one, and for how many timeouts
    stalled: Option<(RequestKey, u32)>,
}

/// A joining peer that asked for a copy of the store
#[derive(Debug)]
struct SnapshotWaiter {
    peer: NodeId,
    /// Clock of the ack each ready peer sent for the waiter's sync request
    acks: BTreeMap<NodeId, Timestamp>,
}

pub struct Synchronizer {
    id: NodeId,
    clock: LogicalClock,
    /// Clock ticks and sends happen with this held, so the per-peer send
    /// order always matches clock order.
    state: Mutex<SyncState>,
    transport: Arc<dyn Transport>,
    store: Arc<dyn Resource>,
    params: SyncParams,
    mode_tx: watch::Sender<CsMode>,
    status_tx: watch::Sender<PeerStatus>,
    peers_changed: Notify,
    snapshot_installed: Notify,
    /// At most one local request in flight
    local_turn: tokio::sync::Mutex<()>,
}

impl Synchronizer {
    pub fn new(
        id: NodeId,
        members: &[SocketAddr],
        store: Arc<dyn Resource>,
        transport: Arc<dyn Transport>,
        params: SyncParams,
    ) -> Self {
        let peers = PeerTable::new(id, members);
        let (mode_tx, _) = watch::channel(CsMode::NoNeed);
        let (status_tx, _) = watch::channel(peers.my_status());

        Self {
            id,
            clock: LogicalClock::new(),
            state: Mutex::new(SyncState {
                peers,
                ledger: RequestLedger::new(),
                admission: AdmissionController::new(),
                snapshot_waiters: vec![],
                released: ReleaseQueue::new(),
                last_heard: BTreeMap::new(),
                stalled: None,
            }),
            transport,
            store,
            params,
            mode_tx,
            status_tx,
            peers_changed: Notify::new(),
            snapshot_installed: Notify::new(),
            local_turn: tokio::sync::Mutex::new(()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SyncState> {
        self.state.lock().expect("Locking failed")
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn clock(&self) -> Timestamp {
        self.clock.current()
    }

    pub fn status(&self) -> PeerStatus {
        self.lock().peers.my_status()
    }

    pub fn peer_status(&self, peer: NodeId) -> Option<PeerStatus> {
        self.lock().peers.status(peer)
    }

    pub fn ready_peer_count(&self) -> usize {
        self.lock().peers.ready_count()
    }

    pub fn mode(&self) -> CsMode {
        self.lock().admission.mode()
    }

    /// The local request currently waiting for (or holding) the critical section
    pub fn my_request(&self) -> Option<PendingRequest> {
        self.lock().ledger.minimum_from(self.id).cloned()
    }

    pub fn pending_requests(&self) -> usize {
        self.lock().ledger.len()
    }

    /// Send to one peer. Callers hold the state lock.
    fn send(&self, peer: NodeId, kind: CommandKind) {
        let clock = self.clock.tick();
        trace!(peer = %peer, %clock, cmd = kind.name(), "Sending");
        self.transport.send(peer, Command::new(self.id, clock, kind));
    }

    /// Send to every reachable peer as one clock event. Callers hold the state lock.
    fn broadcast(&self, st: &SyncState, kind: CommandKind) {
        let clock = self.clock.tick();
        for peer in st.peers.reachable() {
            trace!(peer = %peer, %clock, cmd = kind.name(), "Broadcasting");
            self.transport
                .send(peer, Command::new(self.id, clock, kind.clone()));
        }
    }

    /// Apply released bookings whose turn has come
    ///
    /// Held back until this node is ready: a joiner's store is replaced by
    /// the snapshot first.
    fn drain_released(&self, st: &mut SyncState) {
        if st.peers.my_status() != PeerStatus::Ready {
            return;
        }
        while let Some((key, booking)) = st.released.pop_ready(&st.ledger) {
            let reply = self.store.execute(&booking);
            trace!(request = %key, %booking, %reply, "Replicated booking");
        }
    }

    fn evaluate(&self, st: &mut SyncState) {
        self.drain_released(st);
        let SyncState {
            peers,
            ledger,
            admission,
            ..
        } = st;
        if admission.evaluate(self.id, ledger, peers.ready()) {
            debug!(clock = %self.clock.current(), acks = admission.ack_count(), "Entering critical section");
            self.mode_tx.send_replace(CsMode::Ok);
        }
    }

    /// Ask for the critical section to run `operation`
    ///
    /// Returns the request timestamp. Without ready peers the request is
    /// admitted right away (as long as nothing older is queued).
    pub fn request_cs(&self, operation: Operation) -> Timestamp {
        let mut st = self.lock();
        let st = &mut *st;

        let timestamp = self.clock.tick();
        debug!(clock = %timestamp, %operation, ready = st.peers.ready_count(), "Requesting critical section");

        let kind = operation.to_request();
        st.ledger
            .insert(PendingRequest::new(self.id, timestamp, operation));
        st.admission.begin_cycle();

        // the request is stamped with its own timestamp, not a fresh tick
        for peer in st.peers.reachable() {
            self.transport
                .send(peer, Command::new(self.id, timestamp, kind.clone()));
        }

        self.evaluate(st);
        timestamp
    }

    /// The only gate the caller has to check before running its operation
    pub fn can_enter_cs(&self) -> bool {
        self.lock().admission.can_enter()
    }

    /// Leave the critical section, returning the request that was run
    pub fn exit_cs(&self) -> Option<PendingRequest> {
        let mut st = self.lock();
        self.exit_cs_locked(&mut st)
    }

    fn exit_cs_locked(&self, st: &mut SyncState) -> Option<PendingRequest> {
        st.admission.exit();
        self.mode_tx.send_replace(CsMode::NoNeed);

        let Some(done) = st.ledger.remove_minimum_from(self.id) else {
            warn!("Leaving critical section without a local request");
            return None;
        };
        debug!(clock = %self.clock.current(), request = %done.key(), "Leaving critical section");
        if done.operation.booking().is_some() {
            st.released.mark_applied(done.key());
        }

        if st.peers.reachable().next().is_some() {
            self.broadcast(st, done.operation.to_release());
        } else if st.ledger.minimum_from(self.id).is_some() {
            // alone: re-arm for the next local request right away
            st.admission.begin_cycle();
            self.evaluate(st);
        }
        self.drain_released(st);
        self.answer_snapshots(st);

        Some(done)
    }

    /// Request the critical section for this node's join synchronization
    pub fn start_sync_store(&self) -> Timestamp {
        self.request_cs(Operation::Sync)
    }

    /// Finish join synchronization: leave the critical section and become ready
    pub fn end_sync_store(&self) {
        let mut st = self.lock();
        self.exit_cs_locked(&mut st);
        self.become_ready_locked(&mut st);
    }

    /// Mark this node ready and tell everyone reachable
    pub fn become_ready(&self) {
        let mut st = self.lock();
        self.become_ready_locked(&mut st);
    }

    fn become_ready_locked(&self, st: &mut SyncState) {
        st.peers.set_status(self.id, PeerStatus::Ready);
        self.status_tx.send_replace(PeerStatus::Ready);
        self.broadcast(st, CommandKind::SyncState(PeerStatus::Ready));
        info!(node = %self.id, clock = %self.clock.current(), "Node is ready");
        self.evaluate(st);
    }

    /// Announce this node to every peer not known to be offline
    pub fn announce(&self) {
        let st = self.lock();
        let targets: Vec<_> = st
            .peers
            .others()
            .filter(|p| p.status != PeerStatus::Offline)
            .map(|p| p.id)
            .collect();
        for peer in targets {
            self.send(peer, CommandKind::Join);
        }
    }

    /// Ask the first ready peer for a copy of its store
    ///
    /// Called while holding the critical section for join synchronization,
    /// so the acks of that request go along.
    pub fn request_snapshot(&self) -> Option<NodeId> {
        let st = self.lock();
        let source = st.peers.first_ready()?;
        let acks = st.admission.acks().clone();
        debug!(peer = %source, acks = acks.len(), "Requesting store snapshot");
        self.send(source, CommandKind::SnapshotRequest { acks });
        Some(source)
    }

    /// Transport could not reach `peer`
    pub fn report_unreachable(&self, peer: NodeId) {
        let mut st = self.lock();
        if st.peers.status(peer) != Some(PeerStatus::Offline) {
            warn!(peer = %peer, "Peer unreachable");
        }
        self.set_peer_status_locked(&mut st, peer, PeerStatus::Offline);
    }

    /// Demote peers keeping the current local request from being admitted
    ///
    /// Ready peers that did not ack it go first. Once every ack is in, the
    /// owner of the request ahead of it is demoted after blocking it for
    /// [`STALL_ROUNDS`] consecutive calls.
    pub fn demote_unresponsive(&self) -> Vec<NodeId> {
        let mut st = self.lock();
        let st = &mut *st;
        if st.ledger.minimum_from(self.id).is_none() || st.admission.can_enter() {
            st.stalled = None;
            return vec![];
        }
        let missing = st.admission.missing_acks(st.peers.ready());
        if !missing.is_empty() {
            st.stalled = None;
            for peer in &missing {
                self.set_peer_status_locked(st, *peer, PeerStatus::Offline);
            }
            return missing;
        }

        let Some(blocker) = st.ledger.minimum().map(PendingRequest::key) else {
            return vec![];
        };
        if blocker.requester == self.id {
            return vec![];
        }
        let rounds = match st.stalled {
            Some((key, rounds)) if key == blocker => rounds + 1,
            _ => 1,
        };
        if rounds < STALL_ROUNDS {
            trace!(request = %blocker, rounds, "Waiting on remote request");
            st.stalled = Some((blocker, rounds));
            return vec![];
        }

        st.stalled = None;
        warn!(peer = %blocker.requester, request = %blocker, "Peer never released its request, demoting");
        self.set_peer_status_locked(st, blocker.requester, PeerStatus::Offline);
        vec![blocker.requester]
    }

    fn set_peer_status_locked(&self, st: &mut SyncState, peer: NodeId, status: PeerStatus) {
        let Some(prev) = st.peers.set_status(peer, status) else {
            return;
        };
        if status == PeerStatus::Offline && prev != PeerStatus::Offline {
            // its requests will never be released
            let purged = st.ledger.purge(peer);
            st.snapshot_waiters.retain(|waiter| waiter.peer != peer);
            if 0 < purged {
                debug!(peer = %peer, purged, "Dropped requests of offline peer");
            }
        }
        self.peers_changed.notify_waiters();
        self.evaluate(st);
        self.answer_snapshots(st);
    }

    /// Send snapshots to joiners whose sync request is next in line
    ///
    /// A joiner is answered once nothing is queued ahead of its sync
    /// request, every ready peer that acked it was heard from past its
    /// ack, and every booking released here is in the store. Peers send
    /// releases to a joiner only after seeing its `JOIN`; anything they
    /// released before that has reached this node by then.
    fn answer_snapshots(&self, st: &mut SyncState) {
        if st.snapshot_waiters.is_empty() {
            return;
        }
        self.drain_released(st);
        if 0 < st.released.len() {
            trace!(queued = st.released.len(), "Snapshot waits for queued bookings");
            return;
        }
        let SyncState {
            peers,
            ledger,
            snapshot_waiters,
            last_heard,
            ..
        } = st;

        let mut due = vec![];
        snapshot_waiters.retain(|waiter| {
            let blocked = ledger
                .minimum_from(waiter.peer)
                .map_or(false, |request| ledger.has_before(request.key()));
            let flushed = waiter
                .acks
                .iter()
                .filter(|(peer, _)| **peer != self.id)
                .filter(|(peer, _)| peers.status(**peer) == Some(PeerStatus::Ready))
                .all(|(peer, ack)| last_heard.get(peer).map_or(false, |heard| ack < heard));
            if blocked || !flushed {
                return true;
            }
            due.push(waiter.peer);
            false
        });

        for peer in due {
            let seats = self.store.snapshot();
            let upto = st.released.applied();
            debug!(peer = %peer, taken = seats.taken.len(), upto = ?upto, "Sending store snapshot");
            self.send(peer, CommandKind::Snapshot { upto, seats });
        }
    }

    /// Handle a command received from a peer
    pub fn on_command(&self, command: Command) {
        let Command {
            sender,
            clock,
            kind,
        } = command;

        let mut st = self.lock();
        let st = &mut *st;

        if sender == self.id || st.peers.status(sender).is_none() {
            warn!(peer = %sender, cmd = kind.name(), "Command from unknown sender dropped");
            return;
        }
        let now = self.clock.observe(clock);
        trace!(peer = %sender, %clock, %now, cmd = kind.name(), "Received");
        let heard = st.last_heard.entry(sender).or_insert(clock);
        *heard = (*heard).max(clock);

        match kind {
            CommandKind::Join => {
                // a restarted peer can't release what it requested before
                st.ledger.purge(sender);
                st.last_heard.insert(sender, clock);
                self.set_peer_status_locked(st, sender, PeerStatus::Join);
                self.send(sender, CommandKind::SyncState(st.peers.my_status()));

                // it will see their releases, so it needs the requests too
                let mine: Vec<_> = st.ledger.requests_of(self.id).cloned().collect();
                for request in mine {
                    self.transport.send(
                        sender,
                        Command::new(self.id, request.timestamp, request.operation.to_request()),
                    );
                }
            }
            CommandKind::Request(booking) => {
                let operation = Operation::from_wire(booking);
                let joining = operation == Operation::Sync;
                st.ledger
                    .insert(PendingRequest::new(sender, clock, operation));
                self.send(sender, CommandKind::Ack);

                // lets a snapshot source hear from us past the ack
                if joining && st.peers.my_status() == PeerStatus::Ready {
                    self.broadcast(st, CommandKind::SyncState(PeerStatus::Ready));
                }
            }
            CommandKind::Ack => match st.ledger.minimum_from(self.id).map(PendingRequest::key) {
                None => debug!(peer = %sender, "Ack without a local request ignored"),
                // an ack always carries a clock past the request it answers
                Some(mine) if clock <= mine.timestamp => {
                    debug!(peer = %sender, %clock, request = %mine, "Stale ack ignored");
                }
                Some(_) => {
                    st.admission.record_ack(sender, clock);
                    self.evaluate(st);
                }
            },
            CommandKind::Release(booking) => {
                let request = st.ledger.remove_minimum_from(sender);
                match (request, booking) {
                    (Some(request), Some(booking)) => {
                        if !st.released.push(request.key(), booking) {
                            debug!(peer = %sender, request = %request.key(), "Booking already in store");
                        }
                    }
                    (None, Some(booking)) if st.peers.my_status() == PeerStatus::Ready => {
                        warn!(peer = %sender, %booking, "Release without a known request, applying");
                        let reply = self.store.execute(&booking);
                        trace!(peer = %sender, %booking, %reply, "Replicated booking");
                    }
                    (None, _) => debug!(peer = %sender, "Release without a known request"),
                    (Some(_), None) => {}
                }
                self.evaluate(st);
            }
            CommandKind::SyncState(status) => {
                self.set_peer_status_locked(st, sender, status);
            }
            CommandKind::InternalRequestSync => {
                warn!(peer = %sender, "Internal command received from a peer, dropped");
            }
            CommandKind::SnapshotRequest { acks } => {
                st.snapshot_waiters.retain(|waiter| waiter.peer != sender);
                st.snapshot_waiters.push(SnapshotWaiter {
                    peer: sender,
                    acks,
                });
            }
            CommandKind::Snapshot { upto, seats } => {
                if st.peers.my_status() == PeerStatus::Ready {
                    warn!(peer = %sender, "Store snapshot arrived after joining, ignored");
                } else {
                    info!(peer = %sender, taken = seats.taken.len(), upto = ?upto, "Installing store snapshot");
                    self.store.restore(seats);
                    st.released.rebase(upto);
                    self.snapshot_installed.notify_one();
                }
            }
        }
        self.answer_snapshots(st);
    }

    /// Wait until the local request is admitted
    ///
    /// Every `ack_timeout` without admission, ready peers that still did
    /// not ack are demoted to offline, shrinking the quorum.
    pub async fn wait_for_admission(&self) -> SyncResult<()> {
        let mut mode_rx = self.mode_tx.subscribe();
        loop {
            match timeout(
                self.params.ack_timeout,
                mode_rx.wait_for(|mode| *mode == CsMode::Ok),
            )
            .await
            {
                Ok(res) => return res.map(|_| ()).map_err(|_| SyncError::Closed),
                Err(_) => {
                    let demoted = self.demote_unresponsive();
                    if !demoted.is_empty() {
                        warn!(?demoted, "Peers did not acknowledge in time, demoted");
                    }
                }
            }
        }
    }

    pub async fn wait_ready(&self) -> SyncResult<()> {
        self.status_tx
            .subscribe()
            .wait_for(|status| *status == PeerStatus::Ready)
            .await
            .map(|_| ())
            .map_err(|_| SyncError::Closed)
    }

    /// Run a client booking in the critical section and return its reply
    pub async fn execute(&self, booking: Booking) -> SyncResult<Reply> {
        self.wait_ready().await?;
        let _turn = self.local_turn.lock().await;

        self.request_cs(Operation::Client(booking.clone()));
        self.wait_for_admission().await?;

        let reply = self.store.execute(&booking);
        debug!(%booking, %reply, "Executed booking");
        self.exit_cs();

        Ok(reply)
    }

    /// Join the cluster: announce, learn peer states, then synchronize
    pub async fn join_cluster(&self) -> SyncResult<()> {
        self.announce();

        let deadline = Instant::now() + self.params.join_timeout;
        loop {
            let changed = self.peers_changed.notified();
            let unknown = self
                .lock()
                .peers
                .others()
                .filter(|p| p.status == PeerStatus::Unknown)
                .count();
            if unknown == 0 {
                break;
            }
            if timeout_at(deadline, changed).await.is_err() {
                warn!(unknown, "Peers did not answer JOIN in time");
                break;
            }
        }

        let _turn = self.local_turn.lock().await;

        if self.ready_peer_count() == 0 {
            info!("No ready peers, starting a new cluster");
            self.become_ready();
            return Ok(());
        }

        let timestamp = self.start_sync_store();
        debug!(clock = %timestamp, "Waiting to synchronize store");
        self.wait_for_admission().await?;

        let installed = self.snapshot_installed.notified();
        if let Some(source) = self.request_snapshot() {
            if timeout(self.params.ack_timeout, installed).await.is_err() {
                warn!(peer = %source, "No store snapshot received, keeping local store");
            }
        }

        self.end_sync_store();
        Ok(())
    }
}
