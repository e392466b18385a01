use std::collections::BTreeMap;

use seatlock_api::{NodeId, Timestamp};

use crate::ledger::RequestLedger;

/// Critical section state of the local node
///
/// Only `NoNeed` and `Ok` are ever entered. The other states are reserved
/// names for a richer protocol (deferred acks, hand-off) and carry no
/// behavior.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum CsMode {
    /// No admitted request; a local request may be waiting for acks
    #[default]
    NoNeed,
    #[allow(unused)]
    OtherInCs,
    #[allow(unused)]
    Init,
    #[allow(unused)]
    ReceivingAck,
    /// Cleared to run the local operation
    Ok,
}

/// Ack counter and admission decision for the local request
#[derive(Debug, Default)]
pub struct AdmissionController {
    mode: CsMode,
    /// Peers that acknowledged the current request cycle, with the ack's clock
    acked: BTreeMap<NodeId, Timestamp>,
}

impl AdmissionController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mode(&self) -> CsMode {
        self.mode
    }

    pub fn can_enter(&self) -> bool {
        self.mode == CsMode::Ok
    }

    /// Start counting acks for a new local request
    pub fn begin_cycle(&mut self) {
        self.acked.clear();
    }

    /// Record an ack from `peer`; repeated acks within a cycle count once
    pub fn record_ack(&mut self, peer: NodeId, clock: Timestamp) -> bool {
        if self.acked.contains_key(&peer) {
            return false;
        }
        self.acked.insert(peer, clock);
        true
    }

    /// First ack clock of every peer that acked the current cycle
    pub fn acks(&self) -> &BTreeMap<NodeId, Timestamp> {
        &self.acked
    }

    pub fn ack_count(&self) -> usize {
        self.acked.len()
    }

    /// Peers among `ready` that did not ack the current cycle yet
    pub fn missing_acks(&self, ready: impl IntoIterator<Item = NodeId>) -> Vec<NodeId> {
        ready
            .into_iter()
            .filter(|peer| !self.acked.contains_key(peer))
            .collect()
    }

    /// Move to `Ok` if the local request may run now
    ///
    /// That is the case when every ready peer acked the current cycle and
    /// the local request is the ledger minimum. Returns `true` only on the
    /// transition.
    pub fn evaluate(
        &mut self,
        me: NodeId,
        ledger: &RequestLedger,
        ready: impl IntoIterator<Item = NodeId>,
    ) -> bool {
        if self.mode == CsMode::Ok {
            return false;
        }
        let (Some(mine), Some(first)) = (ledger.minimum_from(me), ledger.minimum()) else {
            return false;
        };
        if mine.key() != first.key() {
            return false;
        }
        if !self.missing_acks(ready).is_empty() {
            return false;
        }
        self.mode = CsMode::Ok;
        true
    }

    pub fn exit(&mut self) {
        self.mode = CsMode::NoNeed;
    }
}
