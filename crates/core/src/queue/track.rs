use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, MutexGuard};

use super::unit::{BufferUnit, Packet};
use crate::error::{InvariantKind, RelayError, Result};
use crate::media::TrackInfo;

/// A queued unit plus the number of consumers that have moved past it.
#[derive(Debug)]
pub(crate) struct Slot {
    pub(crate) unit: BufferUnit,
    pub(crate) seen: u32,
}

/// Lock-protected queue state.
///
/// Positions handed out to consumers are absolute: `head_index` is the
/// position of `slots[0]` and only ever grows, so a cursor stays valid
/// while units ahead of it are evicted.
#[derive(Debug)]
pub(crate) struct Queue {
    pub(crate) slots: VecDeque<Slot>,
    pub(crate) head_index: u64,
    pub(crate) next_sequence: u64,
    pub(crate) generation: u64,
    pub(crate) consumers: u32,
}

impl Queue {
    fn new() -> Self {
        Self {
            slots: VecDeque::new(),
            head_index: 0,
            next_sequence: 1,
            generation: 0,
            consumers: 0,
        }
    }

    pub(crate) fn get(&self, pos: u64) -> Option<&Slot> {
        let offset = pos.checked_sub(self.head_index)?;
        self.slots.get(usize::try_from(offset).ok()?)
    }

    pub(crate) fn get_mut(&mut self, pos: u64) -> Option<&mut Slot> {
        let offset = pos.checked_sub(self.head_index)?;
        self.slots.get_mut(usize::try_from(offset).ok()?)
    }

    pub(crate) fn head_pos(&self) -> Option<u64> {
        (!self.slots.is_empty()).then_some(self.head_index)
    }

    pub(crate) fn next_pos(&self, pos: u64) -> Option<u64> {
        let next = pos + 1;
        self.get(next).map(|_| next)
    }

    pub(crate) fn head_sequence(&self) -> Option<u64> {
        self.slots.front().map(|slot| slot.unit.sequence)
    }

    /// Pop the head once every consumer has seen it.
    ///
    /// `pos` is the unit whose vote completed; anything but the head is a
    /// bookkeeping defect.
    pub(crate) fn evict_head(&mut self, pos: u64) -> Result<()> {
        if pos != self.head_index {
            return Err(RelayError::invariant(InvariantKind::EvictNonHead));
        }
        let Some(slot) = self.slots.pop_front() else {
            return Err(RelayError::invariant(InvariantKind::EvictNonHead));
        };
        if slot.seen != self.consumers {
            return Err(RelayError::invariant(InvariantKind::SeenOverflow));
        }
        self.head_index += 1;

        tracing::trace!(
            seq = slot.unit.sequence,
            generation = self.generation,
            "unit evicted"
        );

        // Draining to empty starts a fresh generation.
        if self.slots.is_empty() {
            self.generation += 1;
        }
        Ok(())
    }

    fn discard_all(&mut self) -> usize {
        let discarded = self.slots.len();
        self.head_index += discarded as u64;
        self.slots.clear();
        self.generation += 1;
        discarded
    }
}

/// Point-in-time view of a track's queue, for diagnostics and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSnapshot {
    pub generation: u64,
    pub consumers: u32,
    pub next_sequence: u64,
    /// `(sequence, seen_count)` for every queued unit, head first.
    pub units: Vec<(u64, u32)>,
}

/// Producer side of a media stream's buffer queue.
///
/// Exactly one writer (the media source pump) calls [`enqueue`](Self::enqueue);
/// any number of [`Consumer`](super::Consumer)s read concurrently.
pub struct Track {
    info: TrackInfo,
    queue: Mutex<Queue>,
    stopped: AtomicBool,
}

impl Track {
    /// Create an empty, generation-0 track with no consumers.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_info(TrackInfo::new(name))
    }

    pub fn with_info(info: TrackInfo) -> Self {
        tracing::debug!(track = %info.name, "track created");
        Self {
            info,
            queue: Mutex::new(Queue::new()),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn info(&self) -> &TrackInfo {
        &self.info
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Queue> {
        self.queue.lock()
    }

    /// Append a unit at the tail. Returns the sequence number it got.
    ///
    /// Explicit sequence numbers must exceed the current tail's.
    pub fn enqueue(&self, packet: Packet) -> Result<u64> {
        if self.is_stopped() {
            return Err(RelayError::invariant(InvariantKind::EnqueueAfterStop));
        }

        let mut queue = self.queue.lock();

        let sequence = packet.sequence.unwrap_or(queue.next_sequence);
        if let Some(tail) = queue.slots.back()
            && sequence <= tail.unit.sequence
        {
            return Err(RelayError::invariant(InvariantKind::NonMonotonicSequence));
        }
        // Nothing could follow u64::MAX.
        queue.next_sequence = sequence
            .checked_add(1)
            .ok_or_else(|| RelayError::invariant(InvariantKind::NonMonotonicSequence))?;

        queue.slots.push_back(Slot {
            unit: BufferUnit {
                sequence,
                timestamp: packet.timestamp,
                marker: packet.marker,
                payload: packet.payload,
            },
            seen: 0,
        });

        tracing::trace!(
            track = %self.info.name,
            seq = sequence,
            queued = queue.slots.len(),
            "unit enqueued"
        );

        Ok(sequence)
    }

    /// Discard every queued unit and start a new generation.
    ///
    /// Consumers notice the generation change on their next call and
    /// resynchronize from the new head instead of resuming on stale data.
    pub fn reset(&self) -> Result<()> {
        if self.is_stopped() {
            return Err(RelayError::invariant(InvariantKind::ResetAfterStop));
        }

        let mut queue = self.queue.lock();
        let discarded = queue.discard_all();

        tracing::debug!(
            track = %self.info.name,
            discarded,
            generation = queue.generation,
            "queue reset"
        );
        Ok(())
    }

    /// Mark the producer as finished. Terminal and idempotent.
    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::AcqRel) {
            tracing::info!(track = %self.info.name, "track stopped");
        }
    }

    /// Lock-free check of the stop flag.
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub fn generation(&self) -> u64 {
        self.queue.lock().generation
    }

    pub fn consumers(&self) -> u32 {
        self.queue.lock().consumers
    }

    pub fn len(&self) -> usize {
        self.queue.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().slots.is_empty()
    }

    pub fn next_sequence(&self) -> u64 {
        self.queue.lock().next_sequence
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        let queue = self.queue.lock();
        QueueSnapshot {
            generation: queue.generation,
            consumers: queue.consumers,
            next_sequence: queue.next_sequence,
            units: queue
                .slots
                .iter()
                .map(|slot| (slot.unit.sequence, slot.seen))
                .collect(),
        }
    }
}

impl Drop for Track {
    fn drop(&mut self) {
        let consumers = self.queue.get_mut().consumers;
        if consumers > 0 {
            tracing::warn!(
                track = %self.info.name,
                consumers,
                "track dropped with consumers still attached"
            );
        }
    }
}

impl std::fmt::Debug for Track {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Track")
            .field("name", &self.info.name)
            .field("stopped", &self.is_stopped())
            .finish_non_exhaustive()
    }
}
