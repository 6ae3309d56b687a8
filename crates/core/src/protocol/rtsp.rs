use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BytesMut};

use super::request::{MAX_MESSAGE_SIZE, RtspRequest};
use super::response::RtspResponse;
use super::{HandlerStatus, ProtocolHandler};
use crate::context::ServerContext;
use crate::session::{RtpSession, RtpSockets, RtspSession, SessionState, TransportHeader};

const PUBLIC_METHODS: &str = "OPTIONS, SETUP, PLAY, PAUSE, TEARDOWN, GET_PARAMETER";

/// RTSP/1.0 over one non-blocking TCP connection.
pub struct RtspHandler {
    stream: TcpStream,
    peer: SocketAddr,
    local: SocketAddr,
    inbox: BytesMut,
    outbox: BytesMut,
}

impl RtspHandler {
    pub fn new(stream: TcpStream) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        let peer = stream.peer_addr()?;
        let local = stream.local_addr()?;
        Ok(Self {
            stream,
            peer,
            local,
            inbox: BytesMut::with_capacity(4096),
            outbox: BytesMut::new(),
        })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Read whatever is available. `Ok(true)` once the peer has closed.
    fn fill(&mut self) -> io::Result<bool> {
        let mut chunk = [0u8; 4096];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => return Ok(true),
                Ok(n) => self.inbox.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Write as much pending output as the socket takes.
    fn flush(&mut self) -> io::Result<()> {
        while !self.outbox.is_empty() {
            match self.stream.write(&self.outbox) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => self.outbox.advance(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Pop the next complete request off the inbox.
    fn next_request(&mut self) -> crate::error::Result<Option<RtspRequest>> {
        let blank = self
            .inbox
            .iter()
            .take_while(|b| **b == b'\r' || **b == b'\n')
            .count();
        self.inbox.advance(blank);

        let Some(len) = RtspRequest::frame(&self.inbox)? else {
            return Ok(None);
        };
        let message = self.inbox.split_to(len);
        let text = String::from_utf8_lossy(&message);
        RtspRequest::parse(&text).map(Some)
    }

    pub fn handle(
        &mut self,
        request: &RtspRequest,
        sessions: &mut Vec<RtspSession>,
        ctx: &ServerContext,
    ) -> RtspResponse {
        let cseq = request.cseq().unwrap_or("0");

        let response = match request.method.as_str() {
            "OPTIONS" => RtspResponse::ok().add_header("Public", PUBLIC_METHODS),
            "SETUP" => self.handle_setup(request, sessions, ctx),
            "PLAY" => self.handle_play(request, sessions, ctx),
            "PAUSE" => self.handle_pause(request, sessions),
            "TEARDOWN" => self.handle_teardown(request, sessions, ctx),
            "GET_PARAMETER" => self.handle_get_parameter(request, sessions),
            _ => {
                tracing::warn!(method = %request.method, %cseq, "unsupported RTSP method");
                RtspResponse::not_implemented()
            }
        };

        response.add_header("CSeq", cseq)
    }

    fn handle_setup(
        &mut self,
        request: &RtspRequest,
        sessions: &mut Vec<RtspSession>,
        ctx: &ServerContext,
    ) -> RtspResponse {
        let Some(mount) = ctx.media.resolve_from_uri(&request.uri) else {
            tracing::warn!(uri = %request.uri, "SETUP for unknown mount");
            return RtspResponse::not_found();
        };
        let Some(track) = mount.track_for_uri(&request.uri).cloned() else {
            tracing::warn!(uri = %request.uri, "SETUP on a mount without tracks");
            return RtspResponse::not_found();
        };

        let Some(transport_header) = request.get_header("Transport") else {
            tracing::warn!("SETUP missing Transport header");
            return RtspResponse::bad_request();
        };
        let (client_rtp_port, client_rtcp_port) = match TransportHeader::parse(transport_header) {
            Some(TransportHeader::Udp {
                client_rtp_port,
                client_rtcp_port,
            }) => (client_rtp_port, client_rtcp_port),
            Some(other) => {
                tracing::warn!(transport = transport_header, ?other, "unsupported transport requested");
                return RtspResponse::unsupported_transport()
                    .add_header("Unsupported", "RTP/AVP/TCP, multicast; use RTP/AVP (UDP)");
            }
            None => {
                tracing::warn!(transport = transport_header, "SETUP invalid Transport header");
                return RtspResponse::bad_request();
            }
        };

        // Aggregate SETUP: join the session the client names, if any.
        let index = match request.session_id() {
            Some(id) => match sessions.iter().position(|s| s.id == id) {
                Some(index) => Some(index),
                None => {
                    tracing::warn!(session_id = id, "SETUP for unknown session");
                    return RtspResponse::session_not_found();
                }
            },
            None => None,
        };

        let ports = match ctx.ports.allocate() {
            Ok(ports) => ports,
            Err(e) => {
                tracing::error!(error = %e, "failed to allocate server ports");
                return RtspResponse::unavailable();
            }
        };

        let peer_rtp = SocketAddr::new(self.peer.ip(), client_rtp_port);
        let peer_rtcp = SocketAddr::new(self.peer.ip(), client_rtcp_port);
        let sockets = match RtpSockets::bind(self.local, ports, peer_rtp, peer_rtcp) {
            Ok(sockets) => sockets,
            Err(e) => {
                tracing::error!(error = %e, rtp_port = ports.rtp, "failed to bind RTP sockets");
                ctx.ports.release(ports);
                return RtspResponse::internal_error();
            }
        };

        let rtp = Arc::new(RtpSession::new(
            ctx.scheduler.next_id(),
            &request.uri,
            &track,
            sockets,
            ports,
        ));
        ctx.scheduler.add(rtp.clone());

        let session = match index {
            Some(index) => &mut sessions[index],
            None => {
                sessions.push(RtspSession::new(ctx.config.session_timeout_secs));
                let last = sessions.len() - 1;
                &mut sessions[last]
            }
        };
        session.rtp_sessions.push(rtp.clone());

        tracing::info!(
            session_id = %session.id,
            mount = %mount.path(),
            track = %track.name(),
            client_rtp = %peer_rtp,
            server_rtp_port = ports.rtp,
            "session set up"
        );

        let transport = format!(
            "RTP/AVP;unicast;client_port={}-{};server_port={}-{};ssrc={:08X}",
            client_rtp_port,
            client_rtcp_port,
            ports.rtp,
            ports.rtcp,
            rtp.ssrc()
        );

        RtspResponse::ok()
            .add_header("Transport", &transport)
            .add_header("Session", &session.session_header_value())
    }

    fn handle_play(
        &mut self,
        request: &RtspRequest,
        sessions: &mut [RtspSession],
        ctx: &ServerContext,
    ) -> RtspResponse {
        let Some(session) = find_session(request, sessions) else {
            return RtspResponse::session_not_found();
        };

        let start = request.get_header("Range").and_then(parse_npt_start);
        if let Some(position) = start.filter(|p| !p.is_zero())
            && let Some(mount) = session
                .rtp_sessions
                .first()
                .and_then(|rtp| ctx.media.resolve_from_uri(rtp.uri()))
            && !mount.is_live()
        {
            match mount.seek(position) {
                Ok(()) => tracing::info!(mount = %mount.path(), ?position, "seek"),
                Err(e) => tracing::warn!(mount = %mount.path(), error = %e, "seek failed"),
            }
        }

        session.set_state(SessionState::Playing);
        tracing::info!(session_id = %session.id, "session started playing");

        let rtp_info = session
            .rtp_sessions
            .iter()
            .map(|rtp| rtp.rtp_info())
            .collect::<Vec<_>>()
            .join(",");
        let range = format!("npt={:.3}-", start.unwrap_or_default().as_secs_f64());

        let mut response = RtspResponse::ok()
            .add_header("Session", &session.session_header_value())
            .add_header("Range", &range);
        if !rtp_info.is_empty() {
            response = response.add_header("RTP-Info", &rtp_info);
        }
        response
    }

    fn handle_pause(&mut self, request: &RtspRequest, sessions: &mut [RtspSession]) -> RtspResponse {
        let Some(session) = find_session(request, sessions) else {
            return RtspResponse::session_not_found();
        };

        session.set_state(SessionState::Paused);
        tracing::info!(session_id = %session.id, "session paused");
        RtspResponse::ok().add_header("Session", &session.session_header_value())
    }

    fn handle_teardown(
        &mut self,
        request: &RtspRequest,
        sessions: &mut Vec<RtspSession>,
        ctx: &ServerContext,
    ) -> RtspResponse {
        let Some(id) = request.session_id() else {
            tracing::warn!("TEARDOWN missing Session header");
            return RtspResponse::session_not_found();
        };
        let Some(index) = sessions.iter().position(|s| s.id == id) else {
            tracing::warn!(session_id = id, "TEARDOWN for unknown session");
            return RtspResponse::session_not_found();
        };

        let session = sessions.remove(index);
        for rtp in session.rtp_sessions {
            ctx.release_rtp_session(rtp);
        }
        tracing::info!(session_id = id, "session terminated via TEARDOWN");
        RtspResponse::ok()
    }

    /// GET_PARAMETER is used by clients (e.g. VLC) as a keepalive (RFC 2326 §10.8).
    fn handle_get_parameter(&self, request: &RtspRequest, sessions: &[RtspSession]) -> RtspResponse {
        tracing::trace!("GET_PARAMETER keepalive");

        match request.session_id() {
            Some(id) if sessions.iter().any(|s| s.id == id) => {
                RtspResponse::ok().add_header("Session", id)
            }
            Some(id) => {
                tracing::warn!(session_id = id, "GET_PARAMETER for unknown session");
                RtspResponse::session_not_found()
            }
            None => RtspResponse::ok(),
        }
    }
}

impl ProtocolHandler for RtspHandler {
    fn service(&mut self, sessions: &mut Vec<RtspSession>, ctx: &ServerContext) -> HandlerStatus {
        let eof = match self.fill() {
            Ok(eof) => eof,
            Err(e) => {
                tracing::warn!(peer = %self.peer, error = %e, "read error");
                return HandlerStatus::ServerError;
            }
        };

        loop {
            match self.next_request() {
                Ok(Some(request)) => {
                    tracing::debug!(
                        peer = %self.peer,
                        method = %request.method,
                        uri = %request.uri,
                        "request"
                    );
                    let response = self.handle(&request, sessions, ctx);
                    tracing::debug!(peer = %self.peer, status = response.status_code, "response");
                    self.outbox.extend_from_slice(response.serialize().as_bytes());
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(peer = %self.peer, error = %e, "parse error");
                    self.inbox.clear();
                    let response = RtspResponse::bad_request();
                    self.outbox.extend_from_slice(response.serialize().as_bytes());
                    break;
                }
            }
        }

        if self.inbox.len() > MAX_MESSAGE_SIZE {
            tracing::warn!(peer = %self.peer, buffered = self.inbox.len(), "request too large");
            return HandlerStatus::ServerError;
        }

        if let Err(e) = self.flush() {
            return match e.kind() {
                io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset => HandlerStatus::PeerClosed,
                _ => {
                    tracing::warn!(peer = %self.peer, error = %e, "write error");
                    HandlerStatus::ServerError
                }
            };
        }

        if eof {
            HandlerStatus::PeerClosed
        } else {
            HandlerStatus::Continue
        }
    }
}

fn find_session<'a>(request: &RtspRequest, sessions: &'a mut [RtspSession]) -> Option<&'a mut RtspSession> {
    let Some(id) = request.session_id() else {
        tracing::warn!(method = %request.method, "missing Session header");
        return None;
    };
    let found = sessions.iter_mut().find(|s| s.id == id);
    if found.is_none() {
        tracing::warn!(method = %request.method, session_id = id, "unknown session");
    }
    found
}

/// Start of an RTSP `Range: npt=` value (RFC 2326 §3.6).
///
/// `npt=now-` and non-npt ranges have no defined start.
fn parse_npt_start(range: &str) -> Option<Duration> {
    let spec = range.trim().strip_prefix("npt=")?;
    let start = spec.split('-').next()?.trim();
    if start.is_empty() || start == "now" {
        return None;
    }

    let secs = if start.contains(':') {
        let mut total = 0.0;
        for part in start.split(':') {
            total = total * 60.0 + part.parse::<f64>().ok()?;
        }
        total
    } else {
        start.parse::<f64>().ok()?
    };

    Duration::try_from_secs_f64(secs).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::TrackInfo;
    use crate::server::ServerConfig;
    use std::net::{TcpListener, UdpSocket};

    struct Harness {
        ctx: ServerContext,
        handler: RtspHandler,
        sessions: Vec<RtspSession>,
        _client: TcpStream,
    }

    fn harness(port_min: u16) -> Harness {
        let ctx = ServerContext::new(
            ServerConfig::default().with_port_range(port_min, port_min + 20),
        );
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (stream, _) = listener.accept().unwrap();
        Harness {
            ctx,
            handler: RtspHandler::new(stream).unwrap(),
            sessions: Vec::new(),
            _client: client,
        }
    }

    fn request(raw: &str) -> RtspRequest {
        RtspRequest::parse(raw).unwrap()
    }

    impl Harness {
        fn send(&mut self, raw: &str) -> RtspResponse {
            let req = request(raw);
            self.handler.handle(&req, &mut self.sessions, &self.ctx)
        }

        fn header<'a>(resp: &'a RtspResponse, name: &str) -> Option<&'a str> {
            resp.headers
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.as_str())
        }
    }

    #[test]
    fn npt_start_forms() {
        assert_eq!(parse_npt_start("npt=0.000-"), Some(Duration::ZERO));
        assert_eq!(parse_npt_start("npt=12.5-20"), Some(Duration::from_millis(12_500)));
        assert_eq!(parse_npt_start("npt=0:01:30-"), Some(Duration::from_secs(90)));
        assert_eq!(parse_npt_start("npt=now-"), None);
        assert_eq!(parse_npt_start("clock=19961108T142300Z-"), None);
        assert_eq!(parse_npt_start("npt=1e30-"), None);
        assert_eq!(parse_npt_start("npt=-5-"), None);
        assert_eq!(parse_npt_start("npt=inf-"), None);
    }

    #[test]
    fn options_lists_methods() {
        let mut h = harness(44000);
        let resp = h.send("OPTIONS * RTSP/1.0\r\nCSeq: 1\r\n\r\n");
        assert_eq!(resp.status_code, 200);
        assert_eq!(Harness::header(&resp, "Public"), Some(PUBLIC_METHODS));
        assert_eq!(Harness::header(&resp, "CSeq"), Some("1"));
    }

    #[test]
    fn describe_not_implemented() {
        let mut h = harness(44030);
        let resp = h.send("DESCRIBE rtsp://h/stream RTSP/1.0\r\nCSeq: 2\r\n\r\n");
        assert_eq!(resp.status_code, 501);
    }

    #[test]
    fn setup_rejects_interleaved() {
        let mut h = harness(44060);
        let (_mount, _feed) = h.ctx.media.add_live("/stream", TrackInfo::new("track1")).unwrap();
        let resp = h.send(
            "SETUP rtsp://h/stream/track1 RTSP/1.0\r\nCSeq: 3\r\n\
             Transport: RTP/AVP/TCP;unicast;interleaved=0-1\r\n\r\n",
        );
        assert_eq!(resp.status_code, 461);
        assert!(h.sessions.is_empty());
        assert_eq!(h.ctx.ports.in_use(), 0);
        h.ctx.media.shutdown();
    }

    #[test]
    fn setup_play_teardown_lifecycle() {
        let mut h = harness(44090);
        let (mount, _feed) = h.ctx.media.add_live("/stream", TrackInfo::new("track1")).unwrap();
        let track = mount.track(0).unwrap().clone();
        let client = UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = client.local_addr().unwrap().port();

        let resp = h.send(&format!(
            "SETUP rtsp://h/stream/track1 RTSP/1.0\r\nCSeq: 3\r\n\
             Transport: RTP/AVP;unicast;client_port={}-{}\r\n\r\n",
            port,
            port + 1
        ));
        assert_eq!(resp.status_code, 200);
        assert_eq!(h.sessions.len(), 1);
        assert_eq!(track.consumers(), 1);
        assert_eq!(h.ctx.scheduler.len(), 1);
        let session_id = h.sessions[0].id.clone();
        assert!(Harness::header(&resp, "Transport").unwrap().contains("server_port=44090-44091"));

        let resp = h.send(&format!(
            "PLAY rtsp://h/stream RTSP/1.0\r\nCSeq: 4\r\nSession: {session_id}\r\n\r\n"
        ));
        assert_eq!(resp.status_code, 200);
        assert!(Harness::header(&resp, "RTP-Info").unwrap().starts_with("url=rtsp://h/stream/track1;seq="));
        assert_eq!(h.sessions[0].state(), SessionState::Playing);

        let resp = h.send("PAUSE rtsp://h/stream RTSP/1.0\r\nCSeq: 5\r\nSession: nope\r\n\r\n");
        assert_eq!(resp.status_code, 454);

        let resp = h.send(&format!(
            "TEARDOWN rtsp://h/stream RTSP/1.0\r\nCSeq: 6\r\nSession: {session_id}\r\n\r\n"
        ));
        assert_eq!(resp.status_code, 200);
        assert!(h.sessions.is_empty());
        assert_eq!(track.consumers(), 0);
        assert!(h.ctx.scheduler.is_empty());
        assert_eq!(h.ctx.ports.in_use(), 0);
        h.ctx.media.shutdown();
    }

    #[test]
    fn service_answers_and_detects_close() {
        let Harness {
            ctx,
            mut handler,
            mut sessions,
            _client: mut client,
        } = harness(44120);

        client
            .write_all(b"OPTIONS * RTSP/1.0\r\nCSeq: 7\r\n\r\n")
            .unwrap();
        client.set_nonblocking(true).unwrap();

        let mut status = HandlerStatus::Continue;
        let mut reply = Vec::new();
        let mut buf = [0u8; 512];
        for _ in 0..200 {
            status = handler.service(&mut sessions, &ctx);
            if let Ok(n) = client.read(&mut buf) {
                reply.extend_from_slice(&buf[..n]);
            }
            if reply.ends_with(b"\r\n\r\n") {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(status, HandlerStatus::Continue);
        let text = String::from_utf8(reply).unwrap();
        assert!(text.starts_with("RTSP/1.0 200 OK\r\n"));
        assert!(text.contains("CSeq: 7\r\n"));

        drop(client);
        let mut closed = false;
        for _ in 0..200 {
            if handler.service(&mut sessions, &ctx) == HandlerStatus::PeerClosed {
                closed = true;
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(closed);
    }
}
