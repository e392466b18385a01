use std::cell::Cell;
use std::collections::{BTreeMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::prelude::*;
use seatlock_api::{Booking, Command, CommandKind, NodeId, PeerStatus, Reply, Timestamp};

use super::{SyncParams, Synchronizer, Transport};
use crate::admission::CsMode;
use crate::ledger::Operation;
use crate::store::{BookKeeper, Resource};

const PARAMS: SyncParams = SyncParams {
    ack_timeout: Duration::from_millis(50),
    join_timeout: Duration::from_millis(50),
};

/// In-memory network with one FIFO channel per (from, to) pair
#[derive(Default)]
struct SimNet {
    channels: Mutex<BTreeMap<(NodeId, NodeId), VecDeque<Command>>>,
}

impl SimNet {
    fn push(&self, to: NodeId, command: Command) {
        self.channels
            .lock()
            .expect("Locking failed")
            .entry((command.sender, to))
            .or_default()
            .push_back(command);
    }

    fn in_flight(&self) -> usize {
        self.channels
            .lock()
            .expect("Locking failed")
            .values()
            .map(VecDeque::len)
            .sum()
    }

    fn busy_channels(&self) -> Vec<(NodeId, NodeId)> {
        self.channels
            .lock()
            .expect("Locking failed")
            .iter()
            .filter(|(_, queue)| !queue.is_empty())
            .map(|(key, _)| *key)
            .collect()
    }

    fn pop(&self, channel: (NodeId, NodeId)) -> Option<Command> {
        self.channels
            .lock()
            .expect("Locking failed")
            .get_mut(&channel)?
            .pop_front()
    }

    /// Lose everything queued towards `to`
    fn drop_towards(&self, to: NodeId) {
        for (key, queue) in self.channels.lock().expect("Locking failed").iter_mut() {
            if key.1 == to {
                queue.clear();
            }
        }
    }
}

struct SimTransport {
    net: Arc<SimNet>,
}

impl Transport for SimTransport {
    fn send(&self, peer: NodeId, command: Command) {
        self.net.push(peer, command);
    }
}

struct SimCluster {
    net: Arc<SimNet>,
    nodes: BTreeMap<NodeId, Arc<Synchronizer>>,
    stores: BTreeMap<NodeId, Arc<BookKeeper>>,
    /// Order in which nodes were admitted
    admitted: Vec<(NodeId, Timestamp)>,
    /// Nodes taken down: nothing is delivered to them
    down: Vec<NodeId>,
    /// Store snapshots delivered so far
    snapshots: Cell<usize>,
}

impl SimCluster {
    fn new(n: u32, seats: u32) -> Self {
        let members: Vec<SocketAddr> = (0..n)
            .map(|i| SocketAddr::from(([127, 0, 0, 1], 7000 + u16::try_from(i).unwrap())))
            .collect();
        let net = Arc::new(SimNet::default());
        let mut nodes = BTreeMap::new();
        let mut stores = BTreeMap::new();
        for id in (1..=n).map(NodeId) {
            let store = Arc::new(BookKeeper::new(seats));
            let sync = Synchronizer::new(
                id,
                &members,
                store.clone(),
                Arc::new(SimTransport { net: net.clone() }),
                PARAMS,
            );
            nodes.insert(id, Arc::new(sync));
            stores.insert(id, store);
        }
        Self {
            net,
            nodes,
            stores,
            admitted: vec![],
            down: vec![],
            snapshots: Cell::new(0),
        }
    }

    /// Every node considers every other one ready, all clocks at `n - 1`
    fn ready(n: u32, seats: u32) -> Self {
        let cluster = Self::new(n, seats);
        for (id, node) in &cluster.nodes {
            node.become_ready_quietly();
            for other in cluster.nodes.keys().filter(|other| *other != id) {
                node.on_command(Command::new(
                    *other,
                    Timestamp::zero(),
                    CommandKind::SyncState(PeerStatus::Ready),
                ));
            }
        }
        cluster
    }

    fn node(&self, id: u32) -> &Synchronizer {
        &self.nodes[&NodeId(id)]
    }

    fn store(&self, id: u32) -> &BookKeeper {
        &self.stores[&NodeId(id)]
    }

    fn in_cs(&self) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|(_, node)| node.can_enter_cs())
            .map(|(id, _)| *id)
            .collect()
    }

    /// Run the admitted node's operation and leave; checks exclusion
    fn run_admitted(&mut self) -> bool {
        let in_cs = self.in_cs();
        assert!(in_cs.len() <= 1, "nodes {in_cs:?} in the critical section together");
        let Some(id) = in_cs.first().copied() else {
            return false;
        };
        let node = &self.nodes[&id];
        let request = node.my_request().expect("admitted without a request");
        // join synchronization is driven by the test itself
        let Operation::Client(booking) = &request.operation else {
            return false;
        };
        self.stores[&id].execute(booking);
        self.admitted.push((id, request.timestamp));
        node.exit_cs();
        true
    }

    fn deliver(&self, channel: (NodeId, NodeId)) -> bool {
        let Some(command) = self.net.pop(channel) else {
            return false;
        };
        if !self.down.contains(&channel.1) {
            if matches!(command.kind, CommandKind::Snapshot { .. }) {
                self.snapshots.set(self.snapshots.get() + 1);
            }
            self.nodes[&channel.1].on_command(command);
        }
        true
    }

    /// Deliver everything not travelling on a `held` channel
    fn flush_except(&self, held: &[(NodeId, NodeId)]) {
        while let Some(channel) = self
            .net
            .busy_channels()
            .into_iter()
            .find(|channel| !held.contains(channel))
        {
            self.deliver(channel);
        }
    }

    /// Deliver one message, preferring channels sent by `prefer`
    fn step(&self, prefer: Option<NodeId>) -> bool {
        let busy = self.net.busy_channels();
        let channel = busy
            .iter()
            .find(|(from, _)| Some(*from) == prefer)
            .or_else(|| busy.first())
            .copied();
        channel.map_or(false, |channel| self.deliver(channel))
    }

    fn step_random(&self, rng: &mut StdRng) -> bool {
        let busy = self.net.busy_channels();
        if busy.is_empty() {
            return false;
        }
        let channel = busy[rng.gen_range(0..busy.len())];
        self.deliver(channel)
    }

    /// Nodes 1 and 2 form a cluster and book `names`, then node 3 announces itself
    fn with_joiner(seats: u32, names: &[&str]) -> Self {
        let mut cluster = Self::new(3, seats);
        for id in [1, 2] {
            cluster.node(id).announce();
        }
        cluster.down.push(NodeId(3));
        cluster.settle(None);
        for id in [1, 2] {
            cluster.node(id).report_unreachable(NodeId(3));
        }
        cluster.node(1).become_ready();
        cluster.node(2).become_ready();
        cluster.settle(None);
        assert_eq!(cluster.node(1).ready_peer_count(), 1);

        for name in names {
            cluster.node(1).request_cs(reserve(name));
            cluster.settle(None);
        }

        cluster.down.clear();
        cluster.node(3).announce();
        cluster.settle(None);
        cluster
    }

    fn settle(&mut self, prefer: Option<NodeId>) {
        loop {
            if self.run_admitted() {
                continue;
            }
            if !self.step(prefer) {
                break;
            }
        }
    }
}

impl Synchronizer {
    /// Mark self ready without telling anyone
    fn become_ready_quietly(&self) {
        self.lock().peers.set_status(self.id, PeerStatus::Ready);
        self.status_tx.send_replace(PeerStatus::Ready);
    }
}

fn reserve(name: &str) -> Operation {
    Operation::Client(Booking::Reserve { name: name.into() })
}

#[test]
fn alone_self_grants_without_broadcast() {
    let cluster = SimCluster::new(1, 5);
    let node = cluster.node(1);
    node.become_ready();
    assert_eq!(cluster.net.in_flight(), 0);
    assert_eq!(node.mode(), CsMode::NoNeed);

    node.request_cs(reserve("alice"));
    assert!(node.can_enter_cs());
    assert_eq!(cluster.net.in_flight(), 0);

    node.exit_cs();
    assert_eq!(node.mode(), CsMode::NoNeed);
    assert_eq!(node.pending_requests(), 0);

    // re-armed: the next request is granted right away too
    node.request_cs(reserve("bob"));
    assert!(node.can_enter_cs());
    assert_eq!(cluster.net.in_flight(), 0);
}

#[test]
fn earlier_timestamp_wins_even_if_sent_later() {
    let mut cluster = SimCluster::ready(3, 5);

    // push node 1's clock ahead, so its request is stamped later
    cluster.node(1).on_command(Command::new(
        NodeId(3),
        Timestamp(3),
        CommandKind::SyncState(PeerStatus::Ready),
    ));

    let t1 = cluster.node(1).request_cs(reserve("alice"));
    let t2 = cluster.node(2).request_cs(reserve("bob"));
    assert_eq!((t1, t2), (Timestamp(5), Timestamp(3)));

    // node 1's messages are always delivered first
    cluster.settle(Some(NodeId(1)));

    assert_eq!(
        cluster.admitted,
        vec![(NodeId(2), Timestamp(3)), (NodeId(1), Timestamp(5))]
    );
    assert_eq!(
        cluster.store(3).execute(&Booking::Search { name: "bob".into() }),
        Reply::Found(1)
    );
}

#[test]
fn concurrent_requests_follow_total_order() {
    let mut cluster = SimCluster::ready(2, 5);
    let t1 = cluster.node(1).request_cs(reserve("alice"));
    let t2 = cluster.node(2).request_cs(reserve("bob"));
    // same clock on both nodes: tie broken by node id
    assert_eq!(t1, t2);

    cluster.settle(Some(NodeId(2)));

    let order: Vec<_> = cluster.admitted.iter().map(|(id, _)| *id).collect();
    assert_eq!(order, vec![NodeId(1), NodeId(2)]);
    for id in [1, 2] {
        assert_eq!(cluster.store(id).snapshot(), cluster.store(1).snapshot());
    }
}

#[test]
fn random_interleavings_stay_exclusive_and_consistent() {
    for seed in 0..50 {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut cluster = SimCluster::ready(4, 6);
        let mut queues: BTreeMap<NodeId, VecDeque<Operation>> = cluster
            .nodes
            .keys()
            .map(|id| {
                let ops = (0..3)
                    .map(|i| reserve(&format!("n{id}-{i}")))
                    .collect::<VecDeque<_>>();
                (*id, ops)
            })
            .collect();

        for round in 0.. {
            assert!(round < 100_000, "seed {seed}: no progress");
            for (id, node) in &cluster.nodes {
                if node.my_request().is_none() && rng.gen_bool(0.5) {
                    if let Some(op) = queues.get_mut(id).and_then(VecDeque::pop_front) {
                        node.request_cs(op);
                    }
                }
            }
            if cluster.run_admitted() {
                continue;
            }
            let delivered = cluster.step_random(&mut rng);
            let idle = cluster.nodes.values().all(|n| n.my_request().is_none());
            if !delivered && idle && queues.values().all(VecDeque::is_empty) {
                break;
            }
        }

        assert_eq!(cluster.admitted.len(), 12, "seed {seed}");
        let reference = cluster.store(1).snapshot();
        assert_eq!(reference.taken.len(), 6, "seed {seed}");
        for id in 2..=4 {
            assert_eq!(cluster.store(id).snapshot(), reference, "seed {seed}");
        }
    }
}

#[test]
fn joining_node_syncs_before_later_bookings() {
    let mut cluster = SimCluster::with_joiner(4, &["alice"]);
    assert_eq!(cluster.store(2).available(), 3);
    let joiner = cluster.nodes[&NodeId(3)].clone();
    assert_eq!(joiner.ready_peer_count(), 2);
    assert_eq!(cluster.node(1).peer_status(NodeId(3)), Some(PeerStatus::Join));

    let join_ts = joiner.start_sync_store();
    // deliver node 3's request first, then book causally after it
    while cluster.step(Some(NodeId(3))) {
        if cluster.node(1).clock() > join_ts {
            break;
        }
    }
    let booking_ts = cluster.node(1).request_cs(reserve("bob"));
    assert!(join_ts < booking_ts);

    while !joiner.can_enter_cs() {
        assert!(cluster.step(None), "joiner never admitted");
    }
    assert!(!cluster.node(1).can_enter_cs());
    assert_eq!(joiner.status(), PeerStatus::Join);

    joiner.request_snapshot();
    while cluster.snapshots.get() == 0 {
        assert!(cluster.step(None), "snapshot never arrived");
    }
    assert_eq!(cluster.store(3).available(), 3);
    joiner.end_sync_store();
    assert_eq!(joiner.status(), PeerStatus::Ready);

    cluster.settle(None);
    assert_eq!(cluster.node(2).peer_status(NodeId(3)), Some(PeerStatus::Ready));
    assert_eq!(cluster.admitted.last().map(|(id, _)| *id), Some(NodeId(1)));
    let reference = cluster.store(1).snapshot();
    assert_eq!(reference.taken.len(), 2);
    assert_eq!(cluster.store(3).snapshot(), reference);
}

#[test]
fn booking_released_around_a_join_reaches_the_joiner() {
    let mut cluster = SimCluster::with_joiner(4, &["alice"]);
    let joiner = cluster.nodes[&NodeId(3)].clone();
    let joiner_to_2 = (NodeId(3), NodeId(2));
    let node2_to_1 = (NodeId(2), NodeId(1));

    let join_ts = joiner.start_sync_store();
    cluster.flush_except(&[joiner_to_2]);

    // node 2 has not seen the sync request and books with a later stamp
    let booking_ts = cluster.node(2).request_cs(reserve("bob"));
    assert!(join_ts < booking_ts);
    cluster.flush_except(&[joiner_to_2]);
    assert_eq!(cluster.in_cs(), vec![NodeId(2)]);
    assert!(cluster.run_admitted());

    // the joiner hears about bob, node 1 does not yet
    cluster.flush_except(&[joiner_to_2, node2_to_1]);
    assert_eq!(cluster.store(3).available(), 4);
    cluster.flush_except(&[node2_to_1]);
    assert!(joiner.can_enter_cs());

    joiner.request_snapshot();
    cluster.flush_except(&[node2_to_1]);
    assert_eq!(cluster.snapshots.get(), 0, "snapshot sent without node 2's bookings");

    while cluster.snapshots.get() == 0 {
        assert!(cluster.step(None), "snapshot never arrived");
    }
    joiner.end_sync_store();
    cluster.settle(None);

    let reference = cluster.store(1).snapshot();
    assert_eq!(reference.taken.len(), 2);
    for id in [2, 3] {
        assert_eq!(cluster.store(id).snapshot(), reference);
    }
    assert_eq!(
        cluster.store(3).execute(&Booking::Search { name: "bob".into() }),
        Reply::Found(2)
    );
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JoinPhase {
    Idle,
    Syncing,
    Fetching,
    Done,
}

#[test]
fn random_join_interleavings_converge() {
    for seed in 0..40 {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut cluster = SimCluster::with_joiner(8, &["alice"]);
        let joiner = cluster.nodes[&NodeId(3)].clone();
        let mut queues: BTreeMap<NodeId, VecDeque<Operation>> = [1, 2, 3]
            .into_iter()
            .map(|id| {
                let ops = (0..2)
                    .map(|i| reserve(&format!("n{id}-{i}")))
                    .collect::<VecDeque<_>>();
                (NodeId(id), ops)
            })
            .collect();
        let mut phase = JoinPhase::Idle;

        for round in 0.. {
            assert!(round < 100_000, "seed {seed}: no progress in {phase:?}");
            for (id, node) in &cluster.nodes {
                let may_book = *id != NodeId(3) || phase == JoinPhase::Done;
                if may_book && node.my_request().is_none() && rng.gen_bool(0.3) {
                    if let Some(op) = queues.get_mut(id).and_then(VecDeque::pop_front) {
                        node.request_cs(op);
                    }
                }
            }
            match phase {
                JoinPhase::Idle if rng.gen_bool(0.2) => {
                    joiner.start_sync_store();
                    phase = JoinPhase::Syncing;
                }
                JoinPhase::Syncing if joiner.can_enter_cs() => {
                    joiner.request_snapshot();
                    phase = JoinPhase::Fetching;
                }
                JoinPhase::Fetching if 0 < cluster.snapshots.get() => {
                    joiner.end_sync_store();
                    phase = JoinPhase::Done;
                }
                _ => {}
            }

            if cluster.run_admitted() {
                continue;
            }
            let delivered = cluster.step_random(&mut rng);
            let idle = cluster.nodes.values().all(|n| n.my_request().is_none());
            if !delivered
                && idle
                && phase == JoinPhase::Done
                && queues.values().all(VecDeque::is_empty)
            {
                break;
            }
        }

        assert_eq!(cluster.snapshots.get(), 1, "seed {seed}");
        let reference = cluster.store(1).snapshot();
        assert_eq!(reference.taken.len(), 7, "seed {seed}");
        for id in [2, 3] {
            assert_eq!(cluster.store(id).snapshot(), reference, "seed {seed}");
        }
    }
}

#[test]
fn silent_peer_is_demoted() {
    let mut cluster = SimCluster::ready(3, 5);
    cluster.down.push(NodeId(3));

    cluster.node(1).request_cs(reserve("alice"));
    cluster.settle(None);
    assert!(cluster.admitted.is_empty());
    assert_eq!(cluster.node(1).demote_unresponsive(), vec![NodeId(3)]);
    assert_eq!(cluster.node(1).peer_status(NodeId(3)), Some(PeerStatus::Offline));

    cluster.settle(None);
    assert_eq!(cluster.admitted.len(), 1);
    assert_eq!(cluster.node(1).demote_unresponsive(), vec![]);
}

#[test]
fn crashed_holder_of_minimum_is_demoted() {
    let mut cluster = SimCluster::ready(3, 5);
    cluster.node(3).request_cs(reserve("carol"));
    cluster.flush_except(&[]);
    assert_eq!(cluster.in_cs(), vec![NodeId(3)]);

    // node 3 acks node 1 and then dies inside the critical section
    cluster.node(1).request_cs(reserve("alice"));
    cluster.flush_except(&[]);
    cluster.down.push(NodeId(3));
    assert!(!cluster.node(1).can_enter_cs());

    let node = cluster.node(1);
    assert_eq!(node.demote_unresponsive(), vec![]);
    assert_eq!(node.demote_unresponsive(), vec![]);
    assert_eq!(node.peer_status(NodeId(3)), Some(PeerStatus::Ready));
    assert_eq!(node.demote_unresponsive(), vec![NodeId(3)]);
    assert_eq!(node.peer_status(NodeId(3)), Some(PeerStatus::Offline));
    assert!(node.can_enter_cs());
}

#[tokio::test]
async fn admission_wait_gets_past_a_crashed_holder() {
    let cluster = SimCluster::ready(2, 5);
    cluster.node(2).request_cs(reserve("bob"));
    cluster.flush_except(&[]);
    cluster.node(1).request_cs(reserve("alice"));
    cluster.flush_except(&[]);
    assert_eq!(cluster.in_cs(), vec![NodeId(2)]);

    let node = cluster.nodes[&NodeId(1)].clone();
    tokio::time::timeout(Duration::from_secs(2), node.wait_for_admission())
        .await
        .expect("admission never granted")
        .unwrap();
    assert_eq!(node.peer_status(NodeId(2)), Some(PeerStatus::Offline));
}

#[test]
fn unreachable_peer_leaves_quorum_and_ledger() {
    let mut cluster = SimCluster::ready(3, 5);
    cluster.node(3).request_cs(reserve("carol"));
    cluster.net.drop_towards(NodeId(1));
    cluster.down.push(NodeId(3));
    cluster.node(1).on_command(Command::new(
        NodeId(3),
        Timestamp(1),
        CommandKind::Request(Some(Booking::Reserve {
            name: "carol".into(),
        })),
    ));
    cluster.node(1).request_cs(reserve("alice"));
    cluster.settle(None);
    assert!(cluster.admitted.is_empty());

    cluster.node(1).report_unreachable(NodeId(3));
    assert_eq!(cluster.node(1).ready_peer_count(), 1);
    cluster.settle(None);
    assert_eq!(cluster.admitted.first().map(|(id, _)| *id), Some(NodeId(1)));
}

#[test]
fn duplicate_ack_does_not_stand_in_for_missing_one() {
    let cluster = SimCluster::ready(3, 5);
    let node = cluster.node(1);
    node.request_cs(reserve("alice"));
    let ack = Command::new(NodeId(2), Timestamp(10), CommandKind::Ack);
    node.on_command(ack.clone());
    node.on_command(ack);
    assert!(!node.can_enter_cs());

    node.on_command(Command::new(NodeId(3), Timestamp(11), CommandKind::Ack));
    assert!(node.can_enter_cs());
}

#[test]
fn ack_older_than_request_is_stale() {
    let cluster = SimCluster::ready(2, 5);
    let node = cluster.node(1);
    node.on_command(Command::new(
        NodeId(2),
        Timestamp(20),
        CommandKind::SyncState(PeerStatus::Ready),
    ));
    let requested = node.request_cs(reserve("alice"));
    assert!(Timestamp(20) < requested);

    node.on_command(Command::new(NodeId(2), Timestamp(19), CommandKind::Ack));
    assert!(!node.can_enter_cs());

    let fresh = Timestamp(requested.as_u64() + 1);
    node.on_command(Command::new(NodeId(2), fresh, CommandKind::Ack));
    assert!(node.can_enter_cs());
}

#[test]
fn clock_at_maximum_does_not_wedge_the_node() {
    let cluster = SimCluster::ready(2, 5);
    let node = cluster.node(1);
    let requested = node.request_cs(reserve("alice"));
    node.on_command(Command::new(NodeId(2), Timestamp(u64::MAX), CommandKind::Ack));
    assert_eq!(node.clock(), Timestamp(u64::MAX));
    assert!(requested < node.clock());
    assert!(node.can_enter_cs());
    node.exit_cs();

    node.on_command(Command::new(
        NodeId(2),
        Timestamp(u64::MAX),
        CommandKind::SyncState(PeerStatus::Ready),
    ));
    assert_eq!(node.status(), PeerStatus::Ready);
    assert_eq!(node.request_cs(reserve("bob")), Timestamp(u64::MAX));
}

#[test]
fn ignores_internal_and_foreign_commands() {
    let cluster = SimCluster::ready(2, 5);
    let node = cluster.node(1);
    let clock = node.clock();
    node.on_command(Command::new(
        NodeId(2),
        Timestamp(40),
        CommandKind::InternalRequestSync,
    ));
    assert_eq!(node.pending_requests(), 0);
    assert!(clock < node.clock());

    node.on_command(Command::new(NodeId(9), Timestamp(90), CommandKind::Join));
    assert!(node.clock() < Timestamp(90));
    assert_eq!(cluster.net.in_flight(), 0);
}

#[tokio::test]
async fn lone_node_starts_cluster_and_executes() {
    let cluster = SimCluster::new(1, 2);
    let node = cluster.nodes[&NodeId(1)].clone();
    node.join_cluster().await.unwrap();
    assert_eq!(node.status(), PeerStatus::Ready);

    let reply = node
        .execute(Booking::Reserve {
            name: "alice".into(),
        })
        .await
        .unwrap();
    assert_eq!(reply, Reply::Assigned(1));
    assert_eq!(node.mode(), CsMode::NoNeed);
    assert_eq!(node.pending_requests(), 0);
}
