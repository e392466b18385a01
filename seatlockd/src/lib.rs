#![deny(clippy::as_conversions)]

mod admission;
mod clock;
mod ledger;
mod node;
mod peer;
mod store;
mod sync;
mod task;

pub use self::admission::CsMode;
pub use self::ledger::{Operation, PendingRequest};
pub use self::node::*;
pub use self::store::{BookKeeper, Resource};
pub use self::sync::{SyncError, SyncParams, SyncResult, Synchronizer, Transport};
