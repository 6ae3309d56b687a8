//! RTSP control protocol (RFC 2326).
//!
//! The connection scheduler drives every connection through the
//! [`ProtocolHandler`] trait; [`RtspHandler`] is the RTSP/1.0 implementation.
//! It parses requests, builds responses, and turns SETUP/PLAY/PAUSE/TEARDOWN
//! into session and consumer operations.
//!
//! ## RTSP message format (RFC 2326 §4)
//!
//! ```text
//! SETUP rtsp://server/stream/track1 RTSP/1.0\r\n
//! CSeq: 3\r\n
//! Transport: RTP/AVP;unicast;client_port=8000-8001\r\n
//! \r\n
//! ```
//!
//! ## Supported methods
//!
//! | Method | RFC section | Purpose |
//! |--------|-------------|---------|
//! | OPTIONS | §10.1 | Capability discovery |
//! | SETUP | §10.4 | Negotiate transport, attach to a track |
//! | PLAY | §10.5 | Start media delivery, optional seek |
//! | PAUSE | §10.6 | Suspend media delivery |
//! | TEARDOWN | §10.7 | Release the session |
//! | GET_PARAMETER | §10.8 | Keepalive |
//!
//! Everything else, DESCRIBE included, is answered with 501.

pub mod request;
pub mod response;
pub mod rtsp;

pub use request::RtspRequest;
pub use response::RtspResponse;
pub use rtsp::RtspHandler;

use crate::context::ServerContext;
use crate::session::RtspSession;

/// Outcome of servicing one connection for one scheduler pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerStatus {
    /// Keep the connection.
    Continue,
    /// The client went away.
    PeerClosed,
    /// The connection can't continue (I/O failure, oversized request).
    ServerError,
}

/// Per-connection protocol processing.
///
/// `service` is called once per scheduler pass and must not block: read
/// what is available, answer complete requests, return. Sessions created
/// on the connection live in `sessions`, which the scheduler owns and
/// drains when the connection ends.
pub trait ProtocolHandler: Send {
    fn service(&mut self, sessions: &mut Vec<RtspSession>, ctx: &ServerContext) -> HandlerStatus;
}
