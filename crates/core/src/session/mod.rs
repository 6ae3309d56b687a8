//! RTSP and RTP session state (RFC 2326 §3, §12.37).
//!
//! An [`RtspSession`] is created by the first SETUP on a connection and
//! groups one [`RtpSession`] per set-up track. Each RTP session owns:
//!
//! - a [`Consumer`] cursor on its track's buffer queue,
//! - the UDP sockets bound to its server port pair,
//! - the RTP header state (SSRC, sequence) for its outgoing stream,
//! - an entry in the packet scheduler, keyed by [`RtpSession::id`].
//!
//! ## Session lifecycle (RFC 2326 §A.1)
//!
//! ```text
//! SETUP          -> Ready
//! PLAY           -> Playing
//! PAUSE          -> Paused   (from Playing)
//! PLAY           -> Playing  (from Paused)
//! TEARDOWN       -> (released)
//! TCP disconnect -> (released, via connection draining)
//! ```
//!
//! Release is split into independent steps ([`release_media`],
//! [`close_sockets`], [`take_ports`]) so the teardown path can run each one
//! best-effort.
//!
//! [`release_media`]: RtpSession::release_media
//! [`close_sockets`]: RtpSession::close_sockets
//! [`take_ports`]: RtpSession::take_ports

pub mod ports;
pub mod transport;

use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use bytes::{BufMut, BytesMut};
use parking_lot::{Mutex, RwLock};
use rand::RngExt;

use crate::delivery::EntryId;
use crate::error::Result;
use crate::media::rtp::{self, RtpHeader};
use crate::queue::{BufferUnit, Consumer, Track};

pub use ports::{PortPair, PortPool};
pub use transport::TransportHeader;

/// Default session timeout in seconds (RFC 2326 §12.37).
pub const DEFAULT_SESSION_TIMEOUT_SECS: u64 = 60;

/// Units further ahead of the pacing clock than this are treated as a
/// timestamp jump and sent immediately.
const MAX_PACING_LEAD: Duration = Duration::from_secs(5);

/// RTSP session state machine (RFC 2326 §A.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Session created via SETUP, not yet playing.
    Ready,
    /// Media is being delivered (RTP packets sent to client).
    Playing,
    /// Delivery suspended; can resume via PLAY.
    Paused,
}

/// Sockets bound to the server port pair, plus where to send.
#[derive(Debug)]
pub struct RtpSockets {
    pub rtp: UdpSocket,
    pub rtcp: UdpSocket,
    pub peer_rtp: SocketAddr,
    pub peer_rtcp: SocketAddr,
}

impl RtpSockets {
    /// Bind both server ports on `local` and target the client's pair.
    pub fn bind(local: SocketAddr, ports: PortPair, peer_rtp: SocketAddr, peer_rtcp: SocketAddr) -> io::Result<Self> {
        let rtp = UdpSocket::bind(SocketAddr::new(local.ip(), ports.rtp))?;
        let rtcp = UdpSocket::bind(SocketAddr::new(local.ip(), ports.rtcp))?;
        rtp.set_nonblocking(true)?;
        rtcp.set_nonblocking(true)?;
        Ok(Self {
            rtp,
            rtcp,
            peer_rtp,
            peer_rtcp,
        })
    }
}

/// Maps unit timestamps onto wall-clock send times.
#[derive(Debug)]
struct Pacing {
    clock_rate: u32,
    base: Option<(Instant, u32)>,
    generation: Option<u64>,
}

impl Pacing {
    fn reset(&mut self) {
        self.base = None;
    }

    fn is_due(&mut self, unit: &BufferUnit, generation: Option<u64>, now: Instant) -> bool {
        // A new generation restarts the media clock.
        if generation != self.generation {
            self.generation = generation;
            self.base = None;
        }

        let Some((started, base_ts)) = self.base else {
            self.base = Some((now, unit.timestamp));
            return true;
        };

        let offset = unit.timestamp.wrapping_sub(base_ts) as i32;
        if offset < 0 {
            self.base = Some((now, unit.timestamp));
            return true;
        }

        let due_in = Duration::from_secs_f64(offset as f64 / self.clock_rate as f64);
        let elapsed = now.saturating_duration_since(started);
        if due_in > elapsed + MAX_PACING_LEAD {
            tracing::debug!(offset, "timestamp jump, rebasing pacing clock");
            self.base = Some((now, unit.timestamp));
            return true;
        }
        due_in <= elapsed
    }
}

#[derive(Debug)]
struct RtpOutput {
    header: RtpHeader,
    pacing: Pacing,
    last_timestamp: u32,
}

/// One RTP stream to one client, bound to one track.
///
/// Shared between the connection thread (control requests, teardown) and
/// the packet scheduler's worker (delivery). Lock order when more than one
/// is held: consumer, output, sockets.
pub struct RtpSession {
    id: EntryId,
    uri: String,
    track_name: String,
    consumer: Mutex<Option<Consumer>>,
    sockets: Mutex<Option<RtpSockets>>,
    ports: Mutex<Option<PortPair>>,
    state: RwLock<SessionState>,
    output: Mutex<RtpOutput>,
    packets_sent: AtomicU64,
}

impl RtpSession {
    /// Attach a consumer to `track` and take ownership of the bound sockets
    /// and the port pair they use.
    pub fn new(id: EntryId, uri: &str, track: &Arc<Track>, sockets: RtpSockets, ports: PortPair) -> Self {
        let info = track.info();
        let header = RtpHeader::with_random_ssrc(info.rtp_payload_type());

        tracing::debug!(
            entry = id,
            uri,
            track = %track.name(),
            server_rtp_port = ports.rtp,
            client = %sockets.peer_rtp,
            "RTP session created"
        );

        Self {
            id,
            uri: uri.to_string(),
            track_name: track.name().to_string(),
            consumer: Mutex::new(Some(Consumer::attach(track))),
            sockets: Mutex::new(Some(sockets)),
            ports: Mutex::new(Some(ports)),
            state: RwLock::new(SessionState::Ready),
            output: Mutex::new(RtpOutput {
                header,
                pacing: Pacing {
                    clock_rate: info.clock_rate.unwrap_or(90_000).max(1),
                    base: None,
                    generation: None,
                },
                last_timestamp: 0,
            }),
            packets_sent: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> EntryId {
        self.id
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn track_name(&self) -> &str {
        &self.track_name
    }

    pub fn ssrc(&self) -> u32 {
        self.output.lock().header.ssrc
    }

    pub fn packets_sent(&self) -> u64 {
        self.packets_sent.load(Ordering::Relaxed)
    }

    /// Server port pair, while still reserved.
    pub fn ports(&self) -> Option<PortPair> {
        *self.ports.lock()
    }

    /// Transition to a new playback state. Entering `Playing` restarts the
    /// pacing clock so a resumed stream doesn't burst.
    pub fn set_state(&self, state: SessionState) {
        let old = std::mem::replace(&mut *self.state.write(), state);
        if state == SessionState::Playing {
            self.output.lock().pacing.reset();
        }
        tracing::debug!(entry = self.id, ?old, new = ?state, "state transition");
    }

    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    pub fn is_playing(&self) -> bool {
        *self.state.read() == SessionState::Playing
    }

    /// `RTP-Info` entry for a PLAY response (RFC 2326 §12.33).
    pub fn rtp_info(&self) -> String {
        let output = self.output.lock();
        format!(
            "url={};seq={};rtptime={}",
            self.uri,
            output.header.sequence(),
            output.header.rtp_timestamp(output.last_timestamp)
        )
    }

    /// Send every unit that is due at `now`, up to `max_units`.
    ///
    /// Returns how many were sent. Queue errors propagate; a full socket
    /// buffer drops the datagram.
    pub fn deliver(&self, now: Instant, max_units: usize) -> Result<usize> {
        if !self.is_playing() {
            return Ok(0);
        }

        let mut consumer = self.consumer.lock();
        let Some(consumer) = consumer.as_mut() else {
            return Ok(0);
        };
        let mut output = self.output.lock();
        let sockets = self.sockets.lock();
        let Some(sockets) = sockets.as_ref() else {
            return Ok(0);
        };

        let mut sent = 0;
        while sent < max_units {
            let Some(unit) = consumer.get()? else {
                break;
            };
            if !output.pacing.is_due(&unit, consumer.observed_generation(), now) {
                break;
            }

            let header = output.header.write(unit.marker, unit.timestamp);
            output.last_timestamp = unit.timestamp;

            let mut datagram = BytesMut::with_capacity(header.len() + unit.payload.len());
            datagram.put_slice(&header);
            datagram.put_slice(&unit.payload);

            match sockets.rtp.send_to(&datagram, sockets.peer_rtp) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    tracing::trace!(entry = self.id, seq = unit.sequence, "socket full, unit dropped");
                }
                Err(e) => return Err(e.into()),
            }

            consumer.advance()?;
            sent += 1;
        }

        if sent > 0 {
            self.packets_sent.fetch_add(sent as u64, Ordering::Relaxed);
            tracing::trace!(entry = self.id, sent, "units delivered");
        }
        Ok(sent)
    }

    /// Detach from the track. `false` if already released.
    pub fn release_media(&self) -> Result<bool> {
        let Some(consumer) = self.consumer.lock().take() else {
            return Ok(false);
        };
        consumer.detach()?;
        Ok(true)
    }

    /// Say goodbye over RTCP, then close both sockets.
    ///
    /// The sockets are closed even if the BYE fails. `Ok(false)` if they
    /// were already closed.
    pub fn close_sockets(&self) -> Result<bool> {
        let Some(sockets) = self.sockets.lock().take() else {
            return Ok(false);
        };
        let bye = rtp::rtcp_bye(self.ssrc());
        let result = sockets.rtcp.send_to(&bye, sockets.peer_rtcp);
        drop(sockets);
        result?;
        Ok(true)
    }

    /// Hand back the reserved port pair, once.
    pub fn take_ports(&self) -> Option<PortPair> {
        self.ports.lock().take()
    }
}

impl std::fmt::Debug for RtpSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RtpSession")
            .field("id", &self.id)
            .field("uri", &self.uri)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// A single RTSP session (RFC 2326 §3), owned by its control connection.
#[derive(Debug)]
pub struct RtspSession {
    /// Unique session identifier (16-char hex string).
    pub id: String,
    /// Session timeout in seconds (included in the `Session` response header).
    pub timeout_secs: u64,
    pub rtp_sessions: Vec<Arc<RtpSession>>,
}

impl RtspSession {
    pub fn new(timeout_secs: u64) -> Self {
        let id = format!("{:016X}", rand::rng().random::<u64>());
        tracing::debug!(session_id = %id, "RTSP session created");
        Self {
            id,
            timeout_secs,
            rtp_sessions: Vec::new(),
        }
    }

    pub fn set_state(&self, state: SessionState) {
        self.rtp_sessions.iter().for_each(|s| s.set_state(state));
    }

    pub fn state(&self) -> SessionState {
        self.rtp_sessions
            .first()
            .map(|s| s.state())
            .unwrap_or(SessionState::Ready)
    }

    /// Format the `Session` response header value per RFC 2326 §12.37.
    ///
    /// Example: `"0000000000000001;timeout=60"`
    pub fn session_header_value(&self) -> String {
        format!("{};timeout={}", self.id, self.timeout_secs)
    }
}
