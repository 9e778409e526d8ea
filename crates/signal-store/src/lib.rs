//! LMDB-backed mailbox for short-lived signaling messages.
//!
//! Signals are addressed to a room and claimed by any poller in that room
//! other than the sender. Each signal is delivered at most once, oldest
//! first, and expires after a fixed TTL whether or not anyone claimed it.

mod error;
mod store;

pub use error::{Result, StoreError};
pub use store::{NewSignal, Signal, SignalStore, StoreOptions, StoreStats, DEFAULT_TTL};
