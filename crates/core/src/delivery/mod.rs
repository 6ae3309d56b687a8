//! Packet delivery: the actor that drains consumers onto the wire.
//!
//! The connection scheduler never talks to [`RtpScheduler`] directly during
//! teardown; it goes through [`PacketScheduler`], which is all it needs to
//! know about the actor that may be touching a session concurrently.

mod worker;

use std::time::Duration;

pub use worker::RtpScheduler;

/// Key of a session registered with a packet scheduler.
pub type EntryId = u64;

/// What teardown needs from whoever delivers packets.
pub trait PacketScheduler: Send + Sync {
    /// Stop servicing `id`. Returns `false` if it was not registered.
    ///
    /// A pass already in progress on the entry may still be running when
    /// this returns; see [`wait_idle`](Self::wait_idle).
    fn remove(&self, id: EntryId) -> bool;

    /// Whether the entry is being serviced right now.
    fn is_busy(&self, id: EntryId) -> bool;

    /// Block until `id` is not being serviced, waiting at most `retries`
    /// slices. Returns `false` on timeout.
    fn wait_idle(&self, id: EntryId, slice: Duration, retries: u32) -> bool;
}
