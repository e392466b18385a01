use std::sync::atomic::{AtomicU64, Ordering};

use seatlock_api::Timestamp;

/// Scalar Lamport clock
///
/// Every send calls [`Self::tick`], every receive calls [`Self::observe`].
/// Safe to tick concurrently from multiple tasks.
#[derive(Debug, Default)]
pub struct LogicalClock {
    current: AtomicU64,
}

impl LogicalClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Timestamp {
        Timestamp(self.current.load(Ordering::SeqCst))
    }

    /// Advance for a local (sending) event and return the new value
    ///
    /// Saturates at `u64::MAX`; a peer can push the clock there with a
    /// single crafted message.
    pub fn tick(&self) -> Timestamp {
        self.advance(|current| current.saturating_add(1))
    }

    /// Advance past a `received` value: `max(current, received) + 1`
    pub fn observe(&self, received: Timestamp) -> Timestamp {
        self.advance(|current| current.max(received.as_u64()).saturating_add(1))
    }

    fn advance(&self, f: impl Fn(u64) -> u64) -> Timestamp {
        let prev = self
            .current
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                Some(f(current))
            })
            .unwrap_or_else(|current| current);
        Timestamp(f(prev))
    }
}
