//! Peer command line codec
//!
//! Every command is a single line of whitespace delimited tokens:
//!
//! ```text
//! NAME sender clock [payload...]
//! ```
//!
//! where the payload depends on the command kind, e.g. a client booking
//! riding inside `REQUEST`/`RELEASE`.
use std::collections::BTreeMap;
use std::num::ParseIntError;
use std::str::{FromStr, SplitWhitespace};

use thiserror::Error;

use crate::{Booking, NodeId, PeerStatus, RequestKey, SeatSnapshot, Timestamp};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("empty line")]
    Empty,
    #[error("unknown command: {0}")]
    UnknownCommand(String),
    #[error("unknown booking operation: {0}")]
    UnknownBooking(String),
    #[error("unknown reply: {0}")]
    UnknownReply(String),
    #[error("unknown peer status: {0}")]
    UnknownStatus(String),
    #[error("missing {0}")]
    Missing(&'static str),
    #[error("invalid {what}: {source}")]
    InvalidNumber {
        what: &'static str,
        source: ParseIntError,
    },
    #[error("invalid request key: {0}")]
    InvalidRequestKey(String),
    #[error("invalid ack entry: {0}")]
    InvalidAckEntry(String),
    #[error("invalid snapshot entry: {0}")]
    InvalidSnapshotEntry(String),
    #[error("unexpected trailing token: {0}")]
    Trailing(String),
}

/// Cursor over the tokens of one line
pub(crate) struct Tokens<'a> {
    inner: SplitWhitespace<'a>,
}

impl<'a> Tokens<'a> {
    pub(crate) fn new(line: &'a str) -> Self {
        Self {
            inner: line.split_whitespace(),
        }
    }

    pub(crate) fn next_required(&mut self, what: &'static str) -> Result<&'a str, WireError> {
        self.inner.next().ok_or(WireError::Missing(what))
    }

    pub(crate) fn next_parsed<T>(&mut self, what: &'static str) -> Result<T, WireError>
    where
        T: FromStr<Err = ParseIntError>,
    {
        self.next_required(what)?
            .parse()
            .map_err(|source| WireError::InvalidNumber { what, source })
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.inner.clone().next().is_none()
    }

    pub(crate) fn rest(&mut self) -> Vec<&'a str> {
        self.inner.by_ref().collect()
    }

    pub(crate) fn finish(mut self) -> Result<(), WireError> {
        match self.inner.next() {
            Some(token) => Err(WireError::Trailing(token.to_owned())),
            None => Ok(()),
        }
    }
}

/// Kind of a peer command, together with its payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandKind {
    /// Sender announces it is alive and joining
    Join,
    /// Sender asks for the critical section, stamped with `Command::clock`
    ///
    /// `None` means the request is the sender's own join synchronization.
    Request(Option<Booking>),
    /// Acknowledges a `Request`
    Ack,
    /// Sender left the critical section; carries the booking it ran, if any
    Release(Option<Booking>),
    /// Sender changed its own lifecycle state
    SyncState(PeerStatus),
    /// Local-only marker for the join synchronization operation; never sent
    InternalRequestSync,
    /// Joining sender asks for a copy of the seat inventory
    ///
    /// `acks` holds the clock of the ack each ready peer sent for the
    /// sender's sync request.
    SnapshotRequest { acks: BTreeMap<NodeId, Timestamp> },
    /// Answer to `SnapshotRequest`
    ///
    /// `upto` is the last request whose booking the inventory includes.
    Snapshot {
        upto: Option<RequestKey>,
        seats: SeatSnapshot,
    },
}

impl CommandKind {
    pub const NAMES: [&'static str; 8] = [
        "JOIN",
        "REQUEST",
        "ACK",
        "RELEASE",
        "SYNC_STATE",
        "INTERNAL_REQUEST_SYNC",
        "SNAPSHOT_REQUEST",
        "SNAPSHOT",
    ];

    pub fn name(&self) -> &'static str {
        match self {
            CommandKind::Join => "JOIN",
            CommandKind::Request(_) => "REQUEST",
            CommandKind::Ack => "ACK",
            CommandKind::Release(_) => "RELEASE",
            CommandKind::SyncState(_) => "SYNC_STATE",
            CommandKind::InternalRequestSync => "INTERNAL_REQUEST_SYNC",
            CommandKind::SnapshotRequest { .. } => "SNAPSHOT_REQUEST",
            CommandKind::Snapshot { .. } => "SNAPSHOT",
        }
    }
}

/// A peer protocol command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub sender: NodeId,
    /// Sender's logical clock when sending
    pub clock: Timestamp,
    pub kind: CommandKind,
}

impl Command {
    pub fn new(sender: NodeId, clock: Timestamp, kind: CommandKind) -> Self {
        Self {
            sender,
            clock,
            kind,
        }
    }

    /// Is `line` a peer command (as opposed to a client booking)
    pub fn is_peer_line(line: &str) -> bool {
        line.split_whitespace()
            .next()
            .map_or(false, |first| CommandKind::NAMES.contains(&first))
    }

    /// Encode as a single line, without the line terminator
    pub fn encode(&self) -> String {
        use std::fmt::Write;

        let mut out = format!("{} {} {}", self.kind.name(), self.sender, self.clock);
        match &self.kind {
            CommandKind::Request(Some(booking)) | CommandKind::Release(Some(booking)) => {
                out.push(' ');
                booking.write_tokens(&mut out);
            }
            CommandKind::SyncState(status) => {
                let _ = write!(out, " {status}");
            }
            CommandKind::SnapshotRequest { acks } => {
                for (peer, clock) in acks {
                    let _ = write!(out, " {peer}={clock}");
                }
            }
            CommandKind::Snapshot { upto, seats } => {
                match upto {
                    Some(key) => {
                        let _ = write!(out, " {key} ");
                    }
                    None => out.push_str(" - "),
                }
                seats.write_tokens(&mut out);
            }
            CommandKind::Join
            | CommandKind::Request(None)
            | CommandKind::Ack
            | CommandKind::Release(None)
            | CommandKind::InternalRequestSync => {}
        }
        out
    }

    pub fn decode(line: &str) -> Result<Self, WireError> {
        let mut tokens = Tokens::new(line);
        let name = tokens.inner.next().ok_or(WireError::Empty)?;
        if !CommandKind::NAMES.contains(&name) {
            return Err(WireError::UnknownCommand(name.to_owned()));
        }
        let sender = NodeId(tokens.next_parsed("sender")?);
        let clock = Timestamp(tokens.next_parsed("clock")?);

        let kind = match name {
            "JOIN" => CommandKind::Join,
            "REQUEST" => CommandKind::Request(Self::read_optional_booking(&mut tokens)?),
            "ACK" => CommandKind::Ack,
            "RELEASE" => CommandKind::Release(Self::read_optional_booking(&mut tokens)?),
            "SYNC_STATE" => CommandKind::SyncState(tokens.next_required("status")?.parse()?),
            "INTERNAL_REQUEST_SYNC" => CommandKind::InternalRequestSync,
            "SNAPSHOT_REQUEST" => CommandKind::SnapshotRequest {
                acks: Self::read_acks(&mut tokens)?,
            },
            "SNAPSHOT" => CommandKind::Snapshot {
                upto: match tokens.next_required("upto")? {
                    "-" => None,
                    key => Some(key.parse()?),
                },
                seats: SeatSnapshot::read_tokens(&mut tokens)?,
            },
            other => return Err(WireError::UnknownCommand(other.to_owned())),
        };
        tokens.finish()?;

        Ok(Self {
            sender,
            clock,
            kind,
        })
    }

    fn read_acks(tokens: &mut Tokens<'_>) -> Result<BTreeMap<NodeId, Timestamp>, WireError> {
        tokens
            .rest()
            .into_iter()
            .map(|entry| -> Result<_, WireError> {
                let invalid = || WireError::InvalidAckEntry(entry.to_owned());
                let (peer, clock) = entry.split_once('=').ok_or_else(invalid)?;
                Ok((
                    NodeId(peer.parse().map_err(|_| invalid())?),
                    Timestamp(clock.parse().map_err(|_| invalid())?),
                ))
            })
            .collect()
    }

    fn read_optional_booking(tokens: &mut Tokens<'_>) -> Result<Option<Booking>, WireError> {
        if tokens.is_empty() {
            Ok(None)
        } else {
            Booking::read_tokens(tokens).map(Some)
        }
    }
}
