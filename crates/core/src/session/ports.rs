use std::collections::HashSet;

use parking_lot::Mutex;

use crate::error::{RelayError, Result};

/// Server-side RTP/RTCP port pair. RTP is even, RTCP is RTP + 1
/// (RFC 3550 §11).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortPair {
    pub rtp: u16,
    pub rtcp: u16,
}

struct PoolState {
    next: u16,
    in_use: HashSet<u16>,
}

/// Allocator for server port pairs within a configured range.
///
/// Allocation walks forward from where the last one ended, wraps at the top
/// of the range and skips pairs that are still reserved.
pub struct PortPool {
    min: u16,
    max: u16,
    state: Mutex<PoolState>,
}

impl PortPool {
    /// `min` is rounded up to even; the last usable pair must fit below or
    /// at `max`.
    pub fn new(min: u16, max: u16) -> Self {
        let min = min.saturating_add(min % 2);
        Self {
            min,
            max,
            state: Mutex::new(PoolState {
                next: min,
                in_use: HashSet::new(),
            }),
        }
    }

    fn capacity(&self) -> usize {
        self.max.saturating_sub(self.min).div_ceil(2) as usize
    }

    /// Reserve the next free pair.
    pub fn allocate(&self) -> Result<PortPair> {
        let capacity = self.capacity();
        let mut state = self.state.lock();

        for _ in 0..capacity {
            let rtp = state.next;
            state.next = match rtp.checked_add(2) {
                Some(next) if next < self.max => next,
                _ => self.min,
            };

            if state.in_use.insert(rtp) {
                tracing::trace!(rtp_port = rtp, rtcp_port = rtp + 1, "allocated server ports");
                return Ok(PortPair { rtp, rtcp: rtp + 1 });
            }
        }

        tracing::warn!(min = self.min, max = self.max, "RTP port range exhausted");
        Err(RelayError::Allocation("RTP port pair"))
    }

    /// Return a pair to the pool. `false` if it was not reserved.
    pub fn release(&self, pair: PortPair) -> bool {
        let released = self.state.lock().in_use.remove(&pair.rtp);
        if released {
            tracing::trace!(rtp_port = pair.rtp, "released server ports");
        } else {
            tracing::warn!(rtp_port = pair.rtp, "released a port pair that was not reserved");
        }
        released
    }

    pub fn in_use(&self) -> usize {
        self.state.lock().in_use.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pairs_are_even_odd() {
        let pool = PortPool::new(5001, 5010);
        let pair = pool.allocate().unwrap();
        assert_eq!(pair, PortPair { rtp: 5002, rtcp: 5003 });
    }

    #[test]
    fn exhaustion_and_reuse() {
        let pool = PortPool::new(6000, 6005);
        let a = pool.allocate().unwrap();
        let b = pool.allocate().unwrap();
        let c = pool.allocate().unwrap();
        assert_eq!((a.rtp, b.rtp, c.rtp), (6000, 6002, 6004));
        assert!(matches!(pool.allocate(), Err(RelayError::Allocation(_))));

        assert!(pool.release(b));
        assert_eq!(pool.allocate().unwrap(), b);
    }

    #[test]
    fn wraps_and_skips_reserved() {
        let pool = PortPool::new(7000, 7004);
        let a = pool.allocate().unwrap();
        let b = pool.allocate().unwrap();
        pool.release(a);
        // Next candidate wraps to 7000, which is free again.
        assert_eq!(pool.allocate().unwrap(), a);
        assert_eq!(pool.in_use(), 2);
        pool.release(b);
    }

    #[test]
    fn unknown_release_reports_false() {
        let pool = PortPool::new(8000, 8010);
        assert!(!pool.release(PortPair { rtp: 8000, rtcp: 8001 }));
    }
}
