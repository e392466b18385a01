#![deny(clippy::as_conversions)]

use derive_more::{Display, From};
use std::fmt;
use std::str::FromStr;

mod booking;
pub use self::booking::*;

mod wire;
pub use self::wire::*;

/// Identity of a node in the cluster
///
/// Ids are 1-based positions in the membership list every node is
/// started with, so they are globally agreed without any exchange.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Display, From)]
pub struct NodeId(pub u32);

impl FromStr for NodeId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(u32::from_str(s)?))
    }
}

/// Lamport clock value stamped on every peer command
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Display, From,
)]
pub struct Timestamp(pub u64);

impl Timestamp {
    pub fn zero() -> Self {
        Self(0)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl FromStr for Timestamp {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(u64::from_str(s)?))
    }
}

/// Position of a request in the cluster-wide critical section order
///
/// Lamport timestamps of independent nodes can tie, so the requester id
/// breaks ties.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Display)]
#[display(fmt = "{}@{}", timestamp, requester)]
pub struct RequestKey {
    pub timestamp: Timestamp,
    pub requester: NodeId,
}

impl FromStr for RequestKey {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |_| WireError::InvalidRequestKey(s.to_owned());
        let (timestamp, requester) = s
            .split_once('@')
            .ok_or_else(|| WireError::InvalidRequestKey(s.to_owned()))?;
        Ok(Self {
            timestamp: timestamp.parse().map_err(invalid)?,
            requester: requester.parse().map_err(invalid)?,
        })
    }
}

/// Lifecycle state of a peer, as seen by some node
///
/// Only `Ready` peers are counted for admission decisions. `Join` peers
/// still receive broadcasts, so they learn about work in flight while
/// they synchronize.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum PeerStatus {
    /// Known to be unreachable
    Offline,
    /// Nothing heard yet
    #[default]
    Unknown,
    /// Announced itself, synchronizing
    Join,
    /// Participating in the protocol
    Ready,
}

impl PeerStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PeerStatus::Offline => "OFFLINE",
            PeerStatus::Unknown => "UNKNOWN",
            PeerStatus::Join => "JOIN",
            PeerStatus::Ready => "READY",
        }
    }

    /// Peers we keep sending broadcasts to
    pub fn is_reachable(self) -> bool {
        matches!(self, PeerStatus::Join | PeerStatus::Ready)
    }
}

impl fmt::Display for PeerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PeerStatus {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "OFFLINE" => PeerStatus::Offline,
            "UNKNOWN" => PeerStatus::Unknown,
            "JOIN" => PeerStatus::Join,
            "READY" => PeerStatus::Ready,
            other => return Err(WireError::UnknownStatus(other.to_owned())),
        })
    }
}

#[test]
fn request_key_orders_by_timestamp_then_requester() {
    let key = |timestamp, requester| RequestKey {
        timestamp: Timestamp(timestamp),
        requester: NodeId(requester),
    };
    assert!(key(3, 2) < key(4, 1));
    assert!(key(4, 1) < key(4, 2));
    assert_eq!(key(4, 1).to_string(), "4@1");
    assert_eq!("4@1".parse(), Ok(key(4, 1)));
    assert!("4".parse::<RequestKey>().is_err());
    assert!("4@x".parse::<RequestKey>().is_err());
}
