use std::sync::{Arc, Weak};

use super::track::{Queue, Track};
use super::unit::BufferUnit;
use crate::error::{InvariantKind, RelayError, Result};

/// Per-client read cursor over a [`Track`]'s queue.
///
/// A consumer advances independently of every other consumer on the same
/// track. Moving past a unit casts this consumer's vote on it; the vote that
/// completes the seen count evicts the unit.
///
/// The cursor fields are owned by whoever holds the consumer (normally one
/// RTP session's delivery path); only the shared counters live behind the
/// track lock.
///
/// Dropping an attached consumer runs the same departure protocol as
/// [`detach`](Self::detach), logging any error instead of returning it.
pub struct Consumer {
    track: Weak<Track>,
    /// Absolute queue position of the current unit.
    cursor: Option<u64>,
    last_seen: u64,
    observed_generation: Option<u64>,
    /// `(generation, sequence)` of the last unit this consumer voted on.
    /// Votes are cast in queue order, so everything at or below it in the
    /// same generation has already been counted.
    voted: Option<(u64, u64)>,
    attached: bool,
}

impl Consumer {
    /// Register a new consumer on `track`.
    ///
    /// The consumer starts with no cursor and no observed generation, so
    /// everything currently queued is unseen to it.
    pub fn attach(track: &Arc<Track>) -> Self {
        let consumers = {
            let mut queue = track.lock();
            queue.consumers += 1;
            queue.consumers
        };

        tracing::debug!(track = %track.name(), consumers, "consumer attached");

        Self {
            track: Arc::downgrade(track),
            cursor: None,
            last_seen: 0,
            observed_generation: None,
            voted: None,
            attached: true,
        }
    }

    /// The track this consumer reads, if its producer still holds it.
    pub fn track(&self) -> Option<Arc<Track>> {
        self.track.upgrade()
    }

    pub fn last_seen_sequence(&self) -> u64 {
        self.last_seen
    }

    pub fn observed_generation(&self) -> Option<u64> {
        self.observed_generation
    }

    /// Whether the producer is done. A dropped track counts as stopped.
    pub fn is_stopped(&self) -> bool {
        self.track.upgrade().is_none_or(|track| track.is_stopped())
    }

    /// Current unit, without moving past it.
    ///
    /// Positions the cursor on the first unseen unit if it has none yet.
    /// Returns `None` when nothing is queued or the track is stopped.
    pub fn get(&mut self) -> Result<Option<BufferUnit>> {
        let Some(track) = self.track.upgrade() else {
            return Ok(None);
        };
        if track.is_stopped() {
            return Ok(None);
        }

        let mut queue = track.lock();
        if self.confirm_cursor(&queue).is_none() {
            self.move_next(&mut queue)?;
        }

        Ok(self
            .confirm_cursor(&queue)
            .and_then(|pos| queue.get(pos))
            .map(|slot| slot.unit.clone()))
    }

    /// Mark the current unit seen and move to the next one.
    ///
    /// With no current unit, positions on the first unseen unit. Returns
    /// `false` when there is nothing further to read (the cursor is then
    /// unset) or the track is stopped. Never blocks beyond the track lock.
    pub fn advance(&mut self) -> Result<bool> {
        let Some(track) = self.track.upgrade() else {
            return Ok(false);
        };
        if track.is_stopped() {
            return Ok(false);
        }

        let mut queue = track.lock();
        self.move_next(&mut queue)
    }

    /// Number of queued units this consumer has not delivered yet.
    pub fn unseen_count(&self) -> u64 {
        let Some(track) = self.track.upgrade() else {
            return 0;
        };
        if track.is_stopped() {
            return 0;
        }

        let queue = track.lock();
        if self.observed_generation != Some(queue.generation) {
            queue.slots.len() as u64
        } else if queue.slots.is_empty() {
            0
        } else {
            queue.next_sequence.saturating_sub(self.last_seen)
        }
    }

    /// Leave the track without disturbing the other consumers' accounting.
    ///
    /// Under the track lock:
    /// 1. fast-forward through everything queued, voting on each unit (which
    ///    may evict units this consumer was the last to see);
    /// 2. withdraw this consumer's vote from every unit still queued;
    /// 3. drop the consumer count by one.
    pub fn detach(mut self) -> Result<()> {
        self.depart()
    }

    fn depart(&mut self) -> Result<()> {
        if !self.attached {
            return Ok(());
        }
        self.attached = false;
        self.cursor = None;

        let Some(track) = self.track.upgrade() else {
            return Ok(());
        };
        let mut queue = track.lock();

        if queue.consumers == 0 {
            return Err(RelayError::invariant(InvariantKind::NoConsumers));
        }

        let mut result = Ok(());
        loop {
            match self.move_next(&mut queue) {
                Ok(true) => continue,
                Ok(false) => break,
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
        }
        self.cursor = None;

        let mut underflow = false;
        for slot in queue.slots.iter_mut() {
            match slot.seen.checked_sub(1) {
                Some(seen) => slot.seen = seen,
                None => underflow = true,
            }
        }
        queue.consumers -= 1;

        tracing::debug!(
            track = %track.name(),
            consumers = queue.consumers,
            remaining = queue.slots.len(),
            "consumer detached"
        );

        if underflow && result.is_ok() {
            result = Err(RelayError::invariant(InvariantKind::SeenUnderflow));
        }
        result
    }

    /// Drop the cursor if it no longer points into the current queue.
    fn confirm_cursor(&mut self, queue: &Queue) -> Option<u64> {
        let pos = self.cursor?;

        if self.observed_generation != Some(queue.generation) {
            tracing::debug!(
                observed = ?self.observed_generation,
                generation = queue.generation,
                "cursor dropped: generation changed"
            );
            self.cursor = None;
            return None;
        }

        if let Some(head_seq) = queue.head_sequence()
            && self.last_seen < head_seq
        {
            tracing::debug!(
                last_seen = self.last_seen,
                head_seq,
                "cursor dropped: head moved past it"
            );
            self.cursor = None;
            return None;
        }

        if queue.get(pos).is_none() {
            self.cursor = None;
            return None;
        }

        Some(pos)
    }

    fn has_voted(&self, generation: u64, sequence: u64) -> bool {
        matches!(self.voted, Some((g, s)) if g == generation && sequence <= s)
    }

    /// Count this consumer as having seen the unit at `pos`, evicting it if
    /// that was the last outstanding vote. Returns the following position.
    fn vote(&mut self, queue: &mut Queue, pos: u64) -> Result<Option<u64>> {
        let next = queue.next_pos(pos);
        let generation = queue.generation;
        let consumers = queue.consumers;

        let Some(slot) = queue.get_mut(pos) else {
            return Ok(next);
        };
        if slot.seen >= consumers {
            return Err(RelayError::invariant(InvariantKind::SeenOverflow));
        }
        slot.seen += 1;
        let seen = slot.seen;
        let sequence = slot.unit.sequence;
        self.voted = Some((generation, sequence));

        tracing::trace!(seq = sequence, seen, consumers, "unit seen");

        if seen >= consumers {
            queue.evict_head(pos)?;
        }
        Ok(next)
    }

    /// The traversal step shared by `get`, `advance` and `detach`.
    fn move_next(&mut self, queue: &mut Queue) -> Result<bool> {
        let mut next = match self.confirm_cursor(queue) {
            Some(pos) => self.vote(queue, pos)?,
            None => queue.head_pos(),
        };

        // Skip anything already delivered; after a generation change the
        // new queue may restart below our last sequence number.
        let mut sequence = 0;
        while let Some(pos) = next {
            let Some(slot) = queue.get(pos) else {
                next = None;
                break;
            };
            sequence = slot.unit.sequence;
            if sequence > self.last_seen {
                break;
            }
            next = if self.has_voted(queue.generation, sequence) {
                queue.next_pos(pos)
            } else {
                self.vote(queue, pos)?
            };
        }

        self.cursor = next;
        if next.is_none() {
            return Ok(false);
        }

        self.last_seen = sequence;
        self.observed_generation = Some(queue.generation);
        Ok(true)
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        if let Err(e) = self.depart() {
            tracing::warn!(error = %e, "consumer departure failed on drop");
        }
    }
}

impl std::fmt::Debug for Consumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer")
            .field("cursor", &self.cursor)
            .field("last_seen", &self.last_seen)
            .field("observed_generation", &self.observed_generation)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::Packet;

    fn track_with(units: u64) -> Arc<Track> {
        let track = Arc::new(Track::new("t"));
        for i in 0..units {
            track.enqueue(Packet::new(vec![i as u8])).unwrap();
        }
        track
    }

    #[test]
    fn attach_counts_consumer() {
        let track = track_with(0);
        let a = Consumer::attach(&track);
        let _b = Consumer::attach(&track);
        assert_eq!(track.consumers(), 2);
        a.detach().unwrap();
        assert_eq!(track.consumers(), 1);
    }

    #[test]
    fn get_does_not_move() {
        let track = track_with(2);
        let mut c = Consumer::attach(&track);
        let first = c.get().unwrap().unwrap();
        let again = c.get().unwrap().unwrap();
        assert_eq!(first.sequence, 1);
        assert_eq!(again.sequence, 1);
        assert_eq!(track.snapshot().units, vec![(1, 0), (2, 0)]);
    }

    #[test]
    fn advance_past_end_votes_on_last_unit() {
        let track = track_with(1);
        let other = Consumer::attach(&track);
        let mut c = Consumer::attach(&track);
        assert!(c.advance().unwrap());
        assert!(!c.advance().unwrap());
        assert_eq!(track.snapshot().units, vec![(1, 1)]);

        // Coming back later must not count unit 1 twice.
        assert!(!c.advance().unwrap());
        assert_eq!(track.snapshot().units, vec![(1, 1)]);
        drop(other);
    }

    #[test]
    fn resumes_after_new_units_arrive() {
        let track = track_with(1);
        let _other = Consumer::attach(&track);
        let mut c = Consumer::attach(&track);
        c.advance().unwrap();
        assert!(!c.advance().unwrap());

        track.enqueue(Packet::new(vec![9u8])).unwrap();
        assert!(c.advance().unwrap());
        assert_eq!(c.get().unwrap().unwrap().sequence, 2);
        assert_eq!(track.snapshot().units, vec![(1, 1), (2, 0)]);
    }

    #[test]
    fn unseen_count_tracks_progress() {
        let track = track_with(3);
        let mut c = Consumer::attach(&track);
        assert_eq!(c.unseen_count(), 3);
        c.advance().unwrap();
        // Positioned on unit 1: units 1..=3 still to deliver.
        assert_eq!(c.unseen_count(), 3);
        c.advance().unwrap();
        assert_eq!(c.unseen_count(), 2);
    }

    #[test]
    fn dropped_track_reads_as_stopped() {
        let track = track_with(1);
        let mut c = Consumer::attach(&track);
        drop(track);
        assert!(c.is_stopped());
        assert!(c.get().unwrap().is_none());
        assert!(!c.advance().unwrap());
        assert_eq!(c.unseen_count(), 0);
        c.detach().unwrap();
    }

    #[test]
    fn drop_runs_departure() {
        let track = track_with(1);
        let mut keep = Consumer::attach(&track);
        {
            let mut gone = Consumer::attach(&track);
            gone.advance().unwrap();
        }
        assert_eq!(track.consumers(), 1);
        assert_eq!(track.snapshot().units, vec![(1, 0)]);
        assert_eq!(keep.get().unwrap().unwrap().sequence, 1);
    }
}
