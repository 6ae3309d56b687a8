use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use super::{EntryId, PacketScheduler};
use crate::error::{RelayError, Result};
use crate::session::RtpSession;

/// Upper bound on units one entry may send per pass, so one backlogged
/// session can't hold the worker.
const MAX_UNITS_PER_PASS: usize = 32;

struct SchedState {
    entries: BTreeMap<EntryId, Arc<RtpSession>>,
    /// Entry being serviced outside the lock, if any.
    busy: Option<EntryId>,
}

/// Packet scheduler backed by one worker thread.
///
/// Every tick the worker walks the registered sessions in id order. For
/// each it marks the entry busy under the state lock, delivers outside the
/// lock, then clears busy and wakes anyone blocked in
/// [`wait_idle`](PacketScheduler::wait_idle).
pub struct RtpScheduler {
    state: Mutex<SchedState>,
    idle: Condvar,
    next_id: AtomicU64,
    running: AtomicBool,
    tick: Duration,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl RtpScheduler {
    pub fn new(tick: Duration) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SchedState {
                entries: BTreeMap::new(),
                busy: None,
            }),
            idle: Condvar::new(),
            next_id: AtomicU64::new(1),
            running: AtomicBool::new(false),
            tick,
            worker: Mutex::new(None),
        })
    }

    /// Reserve an id for a session about to be created.
    pub fn next_id(&self) -> EntryId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Start servicing `session` under its own id.
    pub fn add(&self, session: Arc<RtpSession>) {
        let id = session.id();
        let total = {
            let mut state = self.state.lock();
            state.entries.insert(id, session);
            state.entries.len()
        };
        tracing::debug!(entry = id, total, "scheduler entry added");
    }

    pub fn contains(&self, id: EntryId) -> bool {
        self.state.lock().entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().entries.is_empty()
    }

    /// Spawn the worker thread.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(RelayError::AlreadyRunning);
        }

        let weak: Weak<Self> = Arc::downgrade(self);
        let tick = self.tick;
        let handle = thread::Builder::new()
            .name("rtp-scheduler".into())
            .spawn(move || {
                tracing::debug!("packet scheduler started");
                while let Some(scheduler) = weak.upgrade() {
                    if !scheduler.running.load(Ordering::Acquire) {
                        break;
                    }
                    scheduler.run_once(Instant::now());
                    drop(scheduler);
                    thread::sleep(tick);
                }
                tracing::debug!("packet scheduler exited");
            })
            .inspect_err(|_| self.running.store(false, Ordering::Release))?;

        *self.worker.lock() = Some(handle);
        Ok(())
    }

    /// Stop the worker, wait for it, and forget any remaining entries.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.worker.lock().take()
            && handle.join().is_err()
        {
            tracing::warn!("packet scheduler thread panicked");
        }

        let leftover = {
            let mut state = self.state.lock();
            let n = state.entries.len();
            state.entries.clear();
            n
        };
        if leftover > 0 {
            tracing::debug!(leftover, "scheduler entries dropped at shutdown");
        }
    }

    /// Service every entry once. Returns the number of units sent.
    pub fn run_once(&self, now: Instant) -> usize {
        let ids: Vec<EntryId> = self.state.lock().entries.keys().copied().collect();
        let mut total = 0;

        for id in ids {
            let session = {
                let mut state = self.state.lock();
                let Some(session) = state.entries.get(&id).cloned() else {
                    continue;
                };
                state.busy = Some(id);
                session
            };

            let result = session.deliver(now, MAX_UNITS_PER_PASS);

            {
                let mut state = self.state.lock();
                state.busy = None;
                match result {
                    Ok(sent) => total += sent,
                    Err(e) if e.is_invariant_violation() => {
                        state.entries.remove(&id);
                        tracing::error!(entry = id, error = %e, "entry removed after queue failure");
                    }
                    Err(e) => {
                        tracing::debug!(entry = id, error = %e, "delivery failed");
                    }
                }
            }
            self.idle.notify_all();
        }

        total
    }
}

impl PacketScheduler for RtpScheduler {
    fn remove(&self, id: EntryId) -> bool {
        let (removed, remaining) = {
            let mut state = self.state.lock();
            let removed = state.entries.remove(&id).is_some();
            (removed, state.entries.len())
        };
        if removed {
            tracing::debug!(entry = id, remaining, "scheduler entry removed");
        }
        removed
    }

    fn is_busy(&self, id: EntryId) -> bool {
        self.state.lock().busy == Some(id)
    }

    fn wait_idle(&self, id: EntryId, slice: Duration, retries: u32) -> bool {
        let mut state = self.state.lock();
        for _ in 0..retries {
            if state.busy != Some(id) {
                return true;
            }
            self.idle.wait_for(&mut state, slice);
        }

        let idle = state.busy != Some(id);
        if !idle {
            tracing::warn!(entry = id, retries, ?slice, "entry still busy after idle wait");
        }
        idle
    }
}

impl Drop for RtpScheduler {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{Packet, Track};
    use crate::session::{PortPool, RtpSockets, SessionState};
    use std::net::UdpSocket;

    fn session(id: EntryId, track: &Arc<Track>, pool: &PortPool) -> (Arc<RtpSession>, UdpSocket) {
        let client = UdpSocket::bind("127.0.0.1:0").unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let peer = client.local_addr().unwrap();
        let ports = pool.allocate().unwrap();
        let sockets = RtpSockets::bind("127.0.0.1:0".parse().unwrap(), ports, peer, peer).unwrap();
        let session = Arc::new(RtpSession::new(id, "rtsp://h/s", track, sockets, ports));
        (session, client)
    }

    #[test]
    fn add_and_remove() {
        let pool = PortPool::new(43000, 43100);
        let track = Arc::new(Track::new("t"));
        let scheduler = RtpScheduler::new(Duration::from_millis(5));
        let id = scheduler.next_id();
        let (s, _client) = session(id, &track, &pool);

        scheduler.add(s);
        assert!(scheduler.contains(id));
        assert!(scheduler.remove(id));
        assert!(!scheduler.remove(id));
        assert!(scheduler.is_empty());
    }

    #[test]
    fn run_once_serves_playing_entries() {
        let pool = PortPool::new(43100, 43200);
        let track = Arc::new(Track::new("t"));
        let scheduler = RtpScheduler::new(Duration::from_millis(5));
        let (playing, client) = session(scheduler.next_id(), &track, &pool);
        let (ready, _other) = session(scheduler.next_id(), &track, &pool);
        playing.set_state(SessionState::Playing);
        scheduler.add(playing.clone());
        scheduler.add(ready);

        track.enqueue(Packet::new(vec![1u8, 2, 3])).unwrap();
        assert_eq!(scheduler.run_once(Instant::now()), 1);

        let mut buf = [0u8; 32];
        let (n, _) = client.recv_from(&mut buf).unwrap();
        assert_eq!(n, 15);
        assert!(!scheduler.is_busy(playing.id()));
    }

    #[test]
    fn wait_idle_returns_once_busy_clears() {
        let scheduler = RtpScheduler::new(Duration::from_millis(5));
        scheduler.state.lock().busy = Some(7);
        assert!(scheduler.is_busy(7));

        let s = scheduler.clone();
        let releaser = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            s.state.lock().busy = None;
            s.idle.notify_all();
        });

        assert!(scheduler.wait_idle(7, Duration::from_millis(10), 100));
        releaser.join().unwrap();
    }

    #[test]
    fn wait_idle_times_out() {
        let scheduler = RtpScheduler::new(Duration::from_millis(5));
        scheduler.state.lock().busy = Some(3);
        assert!(!scheduler.wait_idle(3, Duration::from_millis(1), 3));
        // Other entries are unaffected.
        assert!(scheduler.wait_idle(4, Duration::from_millis(1), 3));
    }

    #[test]
    fn worker_delivers_until_shutdown() {
        let pool = PortPool::new(43200, 43300);
        let track = Arc::new(Track::new("t"));
        let scheduler = RtpScheduler::new(Duration::from_millis(2));
        let (s, client) = session(scheduler.next_id(), &track, &pool);
        s.set_state(SessionState::Playing);
        scheduler.add(s);
        scheduler.start().unwrap();
        assert!(matches!(scheduler.start(), Err(RelayError::AlreadyRunning)));

        track.enqueue(Packet::new(vec![9u8])).unwrap();
        let mut buf = [0u8; 32];
        let (n, _) = client.recv_from(&mut buf).unwrap();
        assert_eq!(n, 13);

        scheduler.shutdown();
        assert!(scheduler.is_empty());
    }
}
