use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use convi::ExpectFrom;
use seatlock_api::{Booking, Reply, SeatSnapshot};
use tracing::trace;

/// The state protected by the cluster-wide critical section
///
/// `execute` is only called while the node holds the critical section (or
/// while replaying a booking another node already ran in it), so
/// implementations must never try to acquire it themselves.
pub trait Resource: Send + Sync {
    /// Run a booking. Must be deterministic: every replica replays the
    /// same bookings in the same order.
    fn execute(&self, booking: &Booking) -> Reply;

    fn snapshot(&self) -> SeatSnapshot;

    /// Replace the whole state
    fn restore(&self, snapshot: SeatSnapshot);
}

#[derive(Debug, Default)]
struct Seats {
    total: u32,
    by_seat: BTreeMap<u32, String>,
    by_name: HashMap<String, u32>,
}

impl Seats {
    fn take(&mut self, seat: u32, name: &str) {
        self.by_seat.insert(seat, name.to_owned());
        self.by_name.insert(name.to_owned(), seat);
    }

    fn first_free(&self) -> Option<u32> {
        (1..=self.total).find(|seat| !self.by_seat.contains_key(seat))
    }
}

/// Fixed pool of seats, numbered from 1
#[derive(Debug)]
pub struct BookKeeper {
    inner: Mutex<Seats>,
}

impl BookKeeper {
    pub fn new(seats: u32) -> Self {
        Self {
            inner: Mutex::new(Seats {
                total: seats,
                ..Seats::default()
            }),
        }
    }

    pub fn available(&self) -> u32 {
        let seats = self.inner.lock().expect("Locking failed");
        seats.total - u32::expect_from(seats.by_seat.len())
    }
}

impl Resource for BookKeeper {
    fn execute(&self, booking: &Booking) -> Reply {
        let mut seats = self.inner.lock().expect("Locking failed");
        trace!(%booking, "Executing booking");

        match booking {
            Booking::Reserve { name } => {
                if seats.by_name.contains_key(name) {
                    return Reply::AlreadyBooked;
                }
                let Some(seat) = seats.first_free() else {
                    return Reply::SoldOut;
                };
                seats.take(seat, name);
                Reply::Assigned(seat)
            }
            Booking::BookSeat { name, seat } => {
                if seats.by_name.contains_key(name) {
                    return Reply::AlreadyBooked;
                }
                if *seat == 0 || seats.total < *seat || seats.by_seat.contains_key(seat) {
                    return Reply::NotAvailable(*seat);
                }
                seats.take(*seat, name);
                Reply::Assigned(*seat)
            }
            Booking::Search { name } => match seats.by_name.get(name) {
                Some(seat) => Reply::Found(*seat),
                None => Reply::NotFound(name.clone()),
            },
            Booking::Delete { name } => match seats.by_name.remove(name) {
                Some(seat) => {
                    seats.by_seat.remove(&seat);
                    Reply::Released(seat)
                }
                None => Reply::NotFound(name.clone()),
            },
        }
    }

    fn snapshot(&self) -> SeatSnapshot {
        let seats = self.inner.lock().expect("Locking failed");
        SeatSnapshot {
            seats: seats.total,
            taken: seats.by_seat.clone(),
        }
    }

    fn restore(&self, snapshot: SeatSnapshot) {
        let mut seats = self.inner.lock().expect("Locking failed");
        *seats = Seats {
            total: snapshot.seats,
            ..Seats::default()
        };
        for (seat, name) in snapshot.taken {
            seats.take(seat, &name);
        }
    }
}
