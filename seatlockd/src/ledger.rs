use std::collections::BTreeMap;

use derive_more::Display;
use seatlock_api::{Booking, CommandKind, NodeId, RequestKey, Timestamp};

/// Operation to run once a request is admitted to the critical section
#[derive(Debug, Clone, PartialEq, Eq, Display)]
pub enum Operation {
    /// Booking issued by a client
    #[display(fmt = "{}", _0)]
    Client(Booking),
    /// Join-time synchronization of the requester itself
    #[display(fmt = "sync")]
    Sync,
}

impl Operation {
    pub fn booking(&self) -> Option<&Booking> {
        match self {
            Operation::Client(booking) => Some(booking),
            Operation::Sync => None,
        }
    }

    pub fn from_wire(booking: Option<Booking>) -> Self {
        booking.map_or(Operation::Sync, Operation::Client)
    }

    pub fn to_request(&self) -> CommandKind {
        CommandKind::Request(self.booking().cloned())
    }

    pub fn to_release(&self) -> CommandKind {
        CommandKind::Release(self.booking().cloned())
    }
}

/// A timestamped request to enter the critical section
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRequest {
    pub requester: NodeId,
    pub timestamp: Timestamp,
    pub operation: Operation,
}

impl PendingRequest {
    pub fn new(requester: NodeId, timestamp: Timestamp, operation: Operation) -> Self {
        Self {
            requester,
            timestamp,
            operation,
        }
    }

    pub fn key(&self) -> RequestKey {
        RequestKey {
            timestamp: self.timestamp,
            requester: self.requester,
        }
    }
}

/// All outstanding requests this node knows of, local and remote
///
/// Not synchronized on its own: it lives behind the coordinator's lock
/// together with the rest of the admission state.
#[derive(Debug, Default)]
pub struct RequestLedger {
    requests: BTreeMap<RequestKey, PendingRequest>,
}

impl RequestLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert, overwriting a request with the same key
    pub fn insert(&mut self, request: PendingRequest) {
        self.requests.insert(request.key(), request);
    }

    /// Request that goes next, across all requesters
    pub fn minimum(&self) -> Option<&PendingRequest> {
        self.requests.values().next()
    }

    /// Oldest request of `requester`
    pub fn minimum_from(&self, requester: NodeId) -> Option<&PendingRequest> {
        self.requests.values().find(|r| r.requester == requester)
    }

    /// Every request of `requester`, oldest first
    pub fn requests_of(&self, requester: NodeId) -> impl Iterator<Item = &PendingRequest> + '_ {
        self.requests.values().filter(move |r| r.requester == requester)
    }

    pub fn remove_minimum_from(&mut self, requester: NodeId) -> Option<PendingRequest> {
        let key = self.minimum_from(requester)?.key();
        self.requests.remove(&key)
    }

    /// Drop every request of `requester`, returning how many were removed
    pub fn purge(&mut self, requester: NodeId) -> usize {
        let before = self.requests.len();
        self.requests.retain(|key, _| key.requester != requester);
        before - self.requests.len()
    }

    /// Is any request ordered before `key` still outstanding
    pub fn has_before(&self, key: RequestKey) -> bool {
        self.requests.range(..key).next().is_some()
    }

    /// Is a request carrying a booking ordered before `key` still outstanding
    pub fn has_booking_before(&self, key: RequestKey) -> bool {
        self.requests
            .range(..key)
            .any(|(_, r)| r.operation.booking().is_some())
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }
}

/// Released bookings waiting to reach the store in request order
///
/// A RELEASE can arrive while an older request is still outstanding; its
/// booking is held until nothing ordered before it remains in the ledger.
#[derive(Debug, Default)]
pub struct ReleaseQueue {
    pending: BTreeMap<RequestKey, Booking>,
    /// Newest request whose booking is already in the store
    applied: Option<RequestKey>,
}

impl ReleaseQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a released booking; `false` if the store already covers `key`
    pub fn push(&mut self, key: RequestKey, booking: Booking) -> bool {
        if Some(key) <= self.applied {
            return false;
        }
        self.pending.insert(key, booking);
        true
    }

    /// Take the oldest queued booking once no booking before it is outstanding
    pub fn pop_ready(&mut self, ledger: &RequestLedger) -> Option<(RequestKey, Booking)> {
        let (&key, _) = self.pending.first_key_value()?;
        if ledger.has_booking_before(key) {
            return None;
        }
        let entry = self.pending.pop_first()?;
        self.mark_applied(key);
        Some(entry)
    }

    /// Record a booking that reached the store outside the queue
    pub fn mark_applied(&mut self, key: RequestKey) {
        self.applied = self.applied.max(Some(key));
    }

    pub fn applied(&self) -> Option<RequestKey> {
        self.applied
    }

    /// Rebase onto a store snapshot that covers everything up to `upto`
    pub fn rebase(&mut self, upto: Option<RequestKey>) {
        self.pending.retain(|key, _| Some(*key) > upto);
        self.applied = upto;
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }
}
