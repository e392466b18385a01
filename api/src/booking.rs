use std::collections::BTreeMap;
use std::fmt;

use crate::wire::Tokens;
use crate::WireError;

/// Client operation against the seat inventory
///
/// Names are single tokens: the line protocol is whitespace delimited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Booking {
    /// Take the first free seat
    Reserve { name: String },
    /// Take a specific seat
    BookSeat { name: String, seat: u32 },
    /// Look up the seat held by `name`
    Search { name: String },
    /// Give back the seat held by `name`
    Delete { name: String },
}

impl Booking {
    pub fn name(&self) -> &str {
        match self {
            Booking::Reserve { name }
            | Booking::BookSeat { name, .. }
            | Booking::Search { name }
            | Booking::Delete { name } => name,
        }
    }

    /// Does this booking modify the inventory
    pub fn is_write(&self) -> bool {
        !matches!(self, Booking::Search { .. })
    }

    pub fn encode(&self) -> String {
        let mut out = String::new();
        self.write_tokens(&mut out);
        out
    }

    pub fn decode(line: &str) -> Result<Self, WireError> {
        let mut tokens = Tokens::new(line);
        let booking = Self::read_tokens(&mut tokens)?;
        tokens.finish()?;
        Ok(booking)
    }

    pub(crate) fn write_tokens(&self, out: &mut String) {
        use std::fmt::Write;
        // writing to a `String` can't fail
        let _ = match self {
            Booking::Reserve { name } => write!(out, "reserve {name}"),
            Booking::BookSeat { name, seat } => write!(out, "bookSeat {name} {seat}"),
            Booking::Search { name } => write!(out, "search {name}"),
            Booking::Delete { name } => write!(out, "delete {name}"),
        };
    }

    pub(crate) fn read_tokens(tokens: &mut Tokens<'_>) -> Result<Self, WireError> {
        let op = tokens.next_required("booking")?;
        let name = tokens.next_required("name")?.to_owned();
        Ok(match op {
            "reserve" => Booking::Reserve { name },
            "bookSeat" => Booking::BookSeat {
                name,
                seat: tokens.next_parsed("seat")?,
            },
            "search" => Booking::Search { name },
            "delete" => Booking::Delete { name },
            other => return Err(WireError::UnknownBooking(other.to_owned())),
        })
    }
}

impl fmt::Display for Booking {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

/// Outcome of a [`Booking`], sent back to the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Assigned(u32),
    AlreadyBooked,
    SoldOut,
    NotAvailable(u32),
    Found(u32),
    NotFound(String),
    Released(u32),
    /// Request could not be handled at all
    Error(String),
}

impl Reply {
    pub fn encode(&self) -> String {
        match self {
            Reply::Assigned(seat) => format!("ASSIGNED {seat}"),
            Reply::AlreadyBooked => "ALREADY_BOOKED".into(),
            Reply::SoldOut => "SOLD_OUT".into(),
            Reply::NotAvailable(seat) => format!("NOT_AVAILABLE {seat}"),
            Reply::Found(seat) => format!("FOUND {seat}"),
            Reply::NotFound(name) => format!("NOT_FOUND {name}"),
            Reply::Released(seat) => format!("RELEASED {seat}"),
            Reply::Error(msg) => format!("ERROR {msg}"),
        }
    }

    pub fn decode(line: &str) -> Result<Self, WireError> {
        let mut tokens = Tokens::new(line);
        let reply = match tokens.next_required("reply")? {
            "ASSIGNED" => Reply::Assigned(tokens.next_parsed("seat")?),
            "ALREADY_BOOKED" => Reply::AlreadyBooked,
            "SOLD_OUT" => Reply::SoldOut,
            "NOT_AVAILABLE" => Reply::NotAvailable(tokens.next_parsed("seat")?),
            "FOUND" => Reply::Found(tokens.next_parsed("seat")?),
            "NOT_FOUND" => Reply::NotFound(tokens.next_required("name")?.to_owned()),
            "RELEASED" => Reply::Released(tokens.next_parsed("seat")?),
            "ERROR" => return Ok(Reply::Error(tokens.rest().join(" "))),
            other => return Err(WireError::UnknownReply(other.to_owned())),
        };
        tokens.finish()?;
        Ok(reply)
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Assigned(seat) => write!(f, "Seat assigned to you is {seat}"),
            Reply::AlreadyBooked => f.write_str("Seat already booked against the name provided"),
            Reply::SoldOut => f.write_str("Sold out - No seat available"),
            Reply::NotAvailable(seat) => write!(f, "{seat} is not available"),
            Reply::Found(seat) | Reply::Released(seat) => write!(f, "{seat}"),
            Reply::NotFound(name) => write!(f, "No reservation found for {name}"),
            Reply::Error(msg) => write!(f, "Error: {msg}"),
        }
    }
}

/// Full copy of a seat inventory, handed to a joining node
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SeatSnapshot {
    /// Size of the seat pool
    pub seats: u32,
    /// Seat number to holder
    pub taken: BTreeMap<u32, String>,
}

impl SeatSnapshot {
    pub(crate) fn write_tokens(&self, out: &mut String) {
        use std::fmt::Write;
        let _ = write!(out, "{}", self.seats);
        for (seat, name) in &self.taken {
            let _ = write!(out, " {seat}:{name}");
        }
    }

    pub(crate) fn read_tokens(tokens: &mut Tokens<'_>) -> Result<Self, WireError> {
        let seats = tokens.next_parsed("seats")?;
        let mut taken = BTreeMap::new();
        for entry in tokens.rest() {
            let Some((seat, name)) = entry.split_once(':') else {
                return Err(WireError::InvalidSnapshotEntry(entry.to_owned()));
            };
            let seat = seat
                .parse()
                .map_err(|_| WireError::InvalidSnapshotEntry(entry.to_owned()))?;
            if name.is_empty() || seat == 0 || seats < seat {
                return Err(WireError::InvalidSnapshotEntry(entry.to_owned()));
            }
            taken.insert(seat, name.to_owned());
        }
        Ok(Self { seats, taken })
    }
}

#[test]
fn booking_line_format() {
    let booking = Booking::BookSeat {
        name: "alice".into(),
        seat: 3,
    };
    assert_eq!(booking.encode(), "bookSeat alice 3");
    assert_eq!(Booking::decode("  bookSeat alice 3 "), Ok(booking));
    assert_eq!(
        Booking::decode("reserve bob"),
        Ok(Booking::Reserve { name: "bob".into() })
    );
    assert!(Booking::decode("reserve").is_err());
    assert!(Booking::decode("reserve bob extra").is_err());
    assert!(Booking::decode("bookSeat bob x").is_err());
    assert!(Booking::decode("cancel bob").is_err());
}

#[test]
fn reply_line_format() {
    assert_eq!(Reply::decode("ASSIGNED 4"), Ok(Reply::Assigned(4)));
    assert_eq!(
        Reply::decode("NOT_FOUND carol"),
        Ok(Reply::NotFound("carol".into()))
    );
    assert_eq!(
        Reply::decode("ERROR node is shutting down"),
        Ok(Reply::Error("node is shutting down".into()))
    );
    assert_eq!(Reply::SoldOut.to_string(), "Sold out - No seat available");
    assert!(Reply::decode("ASSIGNED").is_err());
}
