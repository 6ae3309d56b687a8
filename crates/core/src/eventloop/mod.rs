//! Connection scheduler: one loop servicing every control connection.
//!
//! Each pass walks the connection list once and lets each connection's
//! [`ProtocolHandler`] do its non-blocking work. A connection whose handler
//! reports the peer gone or a server-side failure is unlinked and drained:
//!
//! ```text
//! Active -> {Error, PeerClosed} -> Draining -> Freed
//! ```
//!
//! Draining releases every RTP session hanging off the connection with
//! [`release_rtp_session`], which coordinates with the packet scheduler so
//! a session is only dropped once delivery has let go of it.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::context::ServerContext;
use crate::delivery::PacketScheduler;
use crate::protocol::{HandlerStatus, ProtocolHandler};
use crate::session::{PortPool, RtpSession, RtspSession};

/// Lifecycle of a control connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Active,
    /// Closed from our side: server error or shutdown.
    Error,
    PeerClosed,
    Draining,
    Freed,
}

pub struct Connection {
    id: u64,
    peer: SocketAddr,
    state: ConnectionState,
    handler: Box<dyn ProtocolHandler>,
    sessions: Vec<RtspSession>,
}

impl Connection {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn sessions(&self) -> &[RtspSession] {
        &self.sessions
    }

    fn transition(&mut self, state: ConnectionState) {
        tracing::trace!(conn = self.id, from = ?self.state, to = ?state, "connection state");
        self.state = state;
    }
}

/// Owns every live connection. Driven from a single thread.
#[derive(Default)]
pub struct ConnectionScheduler {
    connections: Vec<Connection>,
    next_id: u64,
}

impl ConnectionScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start servicing a new connection.
    pub fn add(&mut self, peer: SocketAddr, handler: Box<dyn ProtocolHandler>, ctx: &ServerContext) -> u64 {
        self.next_id += 1;
        let id = self.next_id;
        let active = ctx.connection_opened();
        self.connections.push(Connection {
            id,
            peer,
            state: ConnectionState::Active,
            handler,
            sessions: Vec::new(),
        });
        tracing::info!(conn = id, %peer, active, "client connected");
        id
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn connections(&self) -> &[Connection] {
        &self.connections
    }

    /// Service every connection once. Returns how many were closed.
    ///
    /// After a shutdown request every connection is closed instead of
    /// serviced. Once the list is empty and the active count has gone
    /// negative, the context's stop flag is raised.
    pub fn run_pass(&mut self, ctx: &ServerContext) -> usize {
        let shutting_down = ctx.shutdown_requested();
        let mut closed = 0;
        let mut i = 0;

        while i < self.connections.len() {
            let state = if shutting_down {
                ConnectionState::Error
            } else {
                let conn = &mut self.connections[i];
                match conn.handler.service(&mut conn.sessions, ctx) {
                    HandlerStatus::Continue => {
                        i += 1;
                        continue;
                    }
                    HandlerStatus::PeerClosed => ConnectionState::PeerClosed,
                    HandlerStatus::ServerError => ConnectionState::Error,
                }
            };

            // The successor slides into slot `i`.
            let mut conn = self.connections.remove(i);
            conn.transition(state);
            close_connection(conn, ctx, shutting_down);
            closed += 1;
        }

        if self.connections.is_empty() && ctx.active_connections() < 0 {
            ctx.raise_stop();
        }
        closed
    }
}

/// Drain and free one unlinked connection.
fn close_connection(mut conn: Connection, ctx: &ServerContext, shutting_down: bool) {
    let reason = match conn.state {
        ConnectionState::PeerClosed => "connection closed by client",
        _ if shutting_down => "server shutdown",
        _ => "server error",
    };

    conn.transition(ConnectionState::Draining);
    let released = drain_sessions(&mut conn.sessions, ctx);
    conn.transition(ConnectionState::Freed);

    let active = ctx.connection_closed();
    tracing::info!(conn = conn.id, peer = %conn.peer, reason, released, active, "client disconnected");
}

/// Release every RTP session of every RTSP session, emptying the list.
/// Returns the number of RTP sessions released.
pub fn drain_sessions(sessions: &mut Vec<RtspSession>, ctx: &ServerContext) -> usize {
    let mut released = 0;
    for session in sessions.drain(..) {
        tracing::debug!(session_id = %session.id, "draining session");
        for rtp in session.rtp_sessions {
            ctx.release_rtp_session(rtp);
            released += 1;
        }
    }
    released
}

/// Tear down one RTP session.
///
/// 1. detach from the track,
/// 2. remove the packet scheduler entry,
/// 3. close the sockets and return the port pair,
/// 4. wait until the scheduler is no longer servicing the entry,
/// 5. drop our reference.
///
/// Every step runs even if an earlier one failed; failures are logged.
pub fn release_rtp_session(
    rtp: Arc<RtpSession>,
    scheduler: &dyn PacketScheduler,
    ports: &PortPool,
    slice: Duration,
    retries: u32,
) {
    let id = rtp.id();

    match rtp.release_media() {
        Ok(true) => {}
        Ok(false) => tracing::debug!(entry = id, "media already released"),
        Err(e) => tracing::warn!(entry = id, error = %e, "media release failed"),
    }

    if !scheduler.remove(id) {
        tracing::debug!(entry = id, "entry was not scheduled");
    }

    if let Err(e) = rtp.close_sockets() {
        tracing::warn!(entry = id, error = %e, "RTCP BYE failed; sockets closed anyway");
    }
    if let Some(pair) = rtp.take_ports() {
        ports.release(pair);
    }

    if !scheduler.wait_idle(id, slice, retries) {
        tracing::warn!(entry = id, "releasing session still in use by the packet scheduler");
    }

    tracing::debug!(
        entry = id,
        track = rtp.track_name(),
        sent = rtp.packets_sent(),
        refs = Arc::strong_count(&rtp),
        "RTP session released"
    );
    drop(rtp);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{Packet, Track};
    use crate::server::ServerConfig;
    use crate::session::RtpSockets;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::net::UdpSocket;

    /// Replays a fixed list of statuses, then keeps the connection.
    struct Scripted {
        statuses: VecDeque<HandlerStatus>,
        serviced: Arc<Mutex<u32>>,
    }

    impl ProtocolHandler for Scripted {
        fn service(&mut self, _sessions: &mut Vec<RtspSession>, _ctx: &ServerContext) -> HandlerStatus {
            *self.serviced.lock() += 1;
            self.statuses.pop_front().unwrap_or(HandlerStatus::Continue)
        }
    }

    fn scripted(statuses: &[HandlerStatus]) -> (Box<dyn ProtocolHandler>, Arc<Mutex<u32>>) {
        let serviced = Arc::new(Mutex::new(0));
        let handler = Scripted {
            statuses: statuses.iter().copied().collect(),
            serviced: serviced.clone(),
        };
        (Box::new(handler), serviced)
    }

    /// Records the teardown calls and reports busy for a few polls.
    struct RecordingScheduler {
        calls: Mutex<Vec<&'static str>>,
        busy_polls: Mutex<u32>,
    }

    impl PacketScheduler for RecordingScheduler {
        fn remove(&self, _id: u64) -> bool {
            self.calls.lock().push("remove");
            true
        }

        fn is_busy(&self, _id: u64) -> bool {
            let mut polls = self.busy_polls.lock();
            if *polls == 0 {
                return false;
            }
            *polls -= 1;
            true
        }

        fn wait_idle(&self, id: u64, slice: Duration, retries: u32) -> bool {
            self.calls.lock().push("wait_idle");
            for _ in 0..retries {
                if !self.is_busy(id) {
                    return true;
                }
                std::thread::sleep(slice);
            }
            !self.is_busy(id)
        }
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:9".parse().unwrap()
    }

    fn ctx() -> ServerContext {
        ServerContext::new(ServerConfig::default().with_port_range(45000, 45100))
    }

    #[test]
    fn pass_keeps_active_and_unlinks_closed() {
        let ctx = ctx();
        let mut scheduler = ConnectionScheduler::new();
        let (a, a_count) = scripted(&[HandlerStatus::Continue]);
        let (b, b_count) = scripted(&[HandlerStatus::PeerClosed]);
        let (c, c_count) = scripted(&[HandlerStatus::ServerError]);
        let (d, d_count) = scripted(&[]);
        scheduler.add(peer(), a, &ctx);
        scheduler.add(peer(), b, &ctx);
        scheduler.add(peer(), c, &ctx);
        scheduler.add(peer(), d, &ctx);
        assert_eq!(ctx.active_connections(), 4);

        assert_eq!(scheduler.run_pass(&ctx), 2);
        // Removal in the middle must not skip the successor.
        assert_eq!(*a_count.lock(), 1);
        assert_eq!(*b_count.lock(), 1);
        assert_eq!(*c_count.lock(), 1);
        assert_eq!(*d_count.lock(), 1);

        let ids: Vec<u64> = scheduler.connections().iter().map(|c| c.id()).collect();
        assert_eq!(ids, vec![1, 4]);
        assert_eq!(ctx.active_connections(), 2);
        assert!(!ctx.should_stop());
    }

    #[test]
    fn shutdown_closes_everything_and_raises_stop() {
        let ctx = ctx();
        let mut scheduler = ConnectionScheduler::new();
        let (a, a_count) = scripted(&[]);
        scheduler.add(peer(), a, &ctx);
        scheduler.run_pass(&ctx);

        ctx.request_shutdown();
        assert_eq!(scheduler.run_pass(&ctx), 1);
        assert!(scheduler.is_empty());
        assert_eq!(*a_count.lock(), 1);
        assert_eq!(ctx.active_connections(), -1);
        assert!(ctx.should_stop());
    }

    #[test]
    fn idle_server_stops_on_request() {
        let ctx = ctx();
        let mut scheduler = ConnectionScheduler::new();
        scheduler.run_pass(&ctx);
        assert!(!ctx.should_stop());
        ctx.request_shutdown();
        scheduler.run_pass(&ctx);
        assert!(ctx.should_stop());
    }

    #[test]
    fn release_runs_every_step_in_order() {
        let pool = PortPool::new(45200, 45300);
        let track = Arc::new(Track::new("t"));
        let other = crate::queue::Consumer::attach(&track);
        let client = UdpSocket::bind("127.0.0.1:0").unwrap();
        let addr = client.local_addr().unwrap();
        let ports = pool.allocate().unwrap();
        let sockets = RtpSockets::bind("127.0.0.1:0".parse().unwrap(), ports, addr, addr).unwrap();
        let rtp = Arc::new(RtpSession::new(1, "rtsp://h/s", &track, sockets, ports));

        track.enqueue(Packet::new(vec![1u8])).unwrap();
        let scheduler = RecordingScheduler {
            calls: Mutex::new(Vec::new()),
            busy_polls: Mutex::new(3),
        };

        let weak = Arc::downgrade(&rtp);
        release_rtp_session(rtp, &scheduler, &pool, Duration::from_millis(1), 10);

        assert_eq!(*scheduler.calls.lock(), vec!["remove", "wait_idle"]);
        assert_eq!(*scheduler.busy_polls.lock(), 0);
        assert!(weak.upgrade().is_none());
        assert_eq!(pool.in_use(), 0);
        assert_eq!(track.consumers(), 1);
        // The remaining consumer still owes its vote on unit 1.
        assert_eq!(track.snapshot().units, vec![(1, 0)]);
        drop(other);
    }

    #[test]
    fn release_while_worker_delivers() {
        use crate::delivery::RtpScheduler;
        use crate::session::SessionState;
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::time::Instant;

        let pool = PortPool::new(45500, 45600);
        let track = Arc::new(Track::new("t"));
        let scheduler = RtpScheduler::new(Duration::from_millis(1));
        scheduler.start().unwrap();

        let producing = Arc::new(AtomicBool::new(true));
        let producer = {
            let track = track.clone();
            let producing = producing.clone();
            std::thread::spawn(move || {
                while producing.load(Ordering::Acquire) {
                    track.enqueue(Packet::new(vec![7u8; 64])).unwrap();
                    std::thread::sleep(Duration::from_micros(200));
                }
            })
        };

        for round in 0..10u64 {
            let client = UdpSocket::bind("127.0.0.1:0").unwrap();
            client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
            let addr = client.local_addr().unwrap();
            let ports = pool.allocate().unwrap();
            let sockets = RtpSockets::bind("127.0.0.1:0".parse().unwrap(), ports, addr, addr).unwrap();
            let id = scheduler.next_id();
            let rtp = Arc::new(RtpSession::new(id, "rtsp://h/s", &track, sockets, ports));
            rtp.set_state(SessionState::Playing);
            scheduler.add(rtp.clone());

            // Delivery is under way before teardown starts.
            let mut buf = [0u8; 128];
            client.recv_from(&mut buf).unwrap();
            std::thread::sleep(Duration::from_micros(300 * round));

            let weak = Arc::downgrade(&rtp);
            release_rtp_session(rtp, scheduler.as_ref(), &pool, Duration::from_millis(10), 100);

            assert!(!scheduler.contains(id));
            assert!(!scheduler.is_busy(id));
            assert_eq!(track.consumers(), 0);
            assert_eq!(pool.in_use(), 0);

            // The worker's own handle goes away once its pass ends.
            let deadline = Instant::now() + Duration::from_secs(2);
            while weak.upgrade().is_some() && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(1));
            }
            assert!(weak.upgrade().is_none());
        }

        producing.store(false, Ordering::Release);
        producer.join().unwrap();
        scheduler.shutdown();
    }

    #[test]
    fn release_continues_past_timeout() {
        let pool = PortPool::new(45300, 45400);
        let track = Arc::new(Track::new("t"));
        let client = UdpSocket::bind("127.0.0.1:0").unwrap();
        let addr = client.local_addr().unwrap();
        let ports = pool.allocate().unwrap();
        let sockets = RtpSockets::bind("127.0.0.1:0".parse().unwrap(), ports, addr, addr).unwrap();
        let rtp = Arc::new(RtpSession::new(2, "rtsp://h/s", &track, sockets, ports));

        let scheduler = RecordingScheduler {
            calls: Mutex::new(Vec::new()),
            busy_polls: Mutex::new(u32::MAX),
        };
        release_rtp_session(rtp, &scheduler, &pool, Duration::from_millis(1), 2);

        assert_eq!(pool.in_use(), 0);
        assert_eq!(track.consumers(), 0);
    }
}
