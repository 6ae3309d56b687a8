//! Single-producer / multi-consumer media buffer queue.
//!
//! A [`Track`] is the producer side: a source (file reader, live feed)
//! appends [`BufferUnit`]s to it. Every RTP session that plays the track
//! holds a [`Consumer`], an independent cursor over the same queue. Units
//! are shared, never copied: the payload is a reference-counted
//! [`bytes::Bytes`].
//!
//! ## Seen counts
//!
//! Each queued unit carries a *seen count*: how many of the currently
//! attached consumers have moved past it. When the count reaches the number
//! of consumers, the consumer that cast the last vote evicts the unit. Since
//! every consumer walks the queue in order, the unit reaching that threshold
//! is always the queue head.
//!
//! ```text
//!   head                                   tail
//!   ┌──────┐  ┌──────┐  ┌──────┐  ┌──────┐
//!   │ #7 2 │─►│ #8 1 │─►│ #9 1 │─►│ #10 0│      consumers = 3
//!   └──────┘  └──────┘  └──────┘  └──────┘
//!      ▲                    ▲          ▲
//!   cursor C             cursor A   cursor B
//! ```
//!
//! ## Generations
//!
//! The queue carries a generation counter, bumped whenever the queue is
//! reset (a discontinuity such as a seek) or drained to empty. A consumer
//! whose observed generation differs from the track's drops its cursor and
//! resynchronizes from the head, skipping anything at or below the last
//! sequence number it delivered.
//!
//! ## Locking
//!
//! One `parking_lot::Mutex` per track guards the queue, the sequence
//! counter, the generation and the consumer count. The `stopped` flag is
//! an atomic so consumers can tell "empty for now" from "producer done"
//! without taking the lock.

mod consumer;
mod track;
mod unit;

pub use consumer::Consumer;
pub use track::{QueueSnapshot, Track};
pub use unit::{BufferUnit, Packet};
