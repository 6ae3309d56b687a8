use std::io;
use std::net::{SocketAddr, TcpListener};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::context::ServerContext;
use crate::error::{RelayError, Result};
use crate::eventloop::ConnectionScheduler;
use crate::media::{LiveFeed, MediaSource, Mount, TrackInfo};
use crate::protocol::RtspHandler;
use crate::session::DEFAULT_SESSION_TIMEOUT_SECS;

/// Server-level configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// RTSP listen address, e.g. `0.0.0.0:8554`.
    pub bind: String,
    /// First server RTP port; rounded up to even.
    pub port_min: u16,
    /// Last port an RTCP port may use.
    pub port_max: u16,
    /// Sleep between connection scheduler passes.
    pub connection_tick: Duration,
    /// Sleep between packet scheduler passes, also the media pump poll.
    pub scheduler_tick: Duration,
    /// How long teardown waits on the packet scheduler per retry.
    pub idle_wait_slice: Duration,
    pub idle_wait_retries: u32,
    /// Advertised in the `Session` header (RFC 2326 §12.37).
    pub session_timeout_secs: u64,
    /// Directory file mounts are opened from. `None` disables file mounts.
    pub media_root: Option<PathBuf>,
    /// Backlog at which pumps throttle file sources and live sources
    /// discard unread units.
    pub max_queued_units: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8554".to_string(),
            port_min: 5000,
            port_max: 65534,
            connection_tick: Duration::from_millis(10),
            scheduler_tick: Duration::from_millis(5),
            idle_wait_slice: Duration::from_millis(10),
            idle_wait_retries: 100,
            session_timeout_secs: DEFAULT_SESSION_TIMEOUT_SECS,
            media_root: None,
            max_queued_units: 512,
        }
    }
}

impl ServerConfig {
    pub fn with_bind(mut self, bind: impl Into<String>) -> Self {
        self.bind = bind.into();
        self
    }

    pub fn with_port_range(mut self, min: u16, max: u16) -> Self {
        self.port_min = min;
        self.port_max = max;
        self
    }

    pub fn with_media_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.media_root = Some(root.into());
        self
    }

    pub fn with_connection_tick(mut self, tick: Duration) -> Self {
        self.connection_tick = tick;
        self
    }

    pub fn with_scheduler_tick(mut self, tick: Duration) -> Self {
        self.scheduler_tick = tick;
        self
    }

    pub fn with_idle_wait(mut self, slice: Duration, retries: u32) -> Self {
        self.idle_wait_slice = slice;
        self.idle_wait_retries = retries;
        self
    }

    pub fn with_session_timeout(mut self, secs: u64) -> Self {
        self.session_timeout_secs = secs;
        self
    }

    pub fn with_max_queued_units(mut self, units: usize) -> Self {
        self.max_queued_units = units;
        self
    }
}

/// RTSP server orchestrator.
///
/// Owns the [`ServerContext`] and the event loop thread that accepts
/// connections and runs the [`ConnectionScheduler`]. RTP delivery runs on
/// the packet scheduler's own thread.
pub struct Server {
    ctx: Arc<ServerContext>,
    local_addr: Option<SocketAddr>,
    event_loop: Option<JoinHandle<()>>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            ctx: Arc::new(ServerContext::new(config)),
            local_addr: None,
            event_loop: None,
        }
    }

    /// Serve `source` at `path`.
    pub fn add_mount(&self, path: &str, source: Box<dyn MediaSource>) -> Result<Arc<Mount>> {
        self.ctx.media.add(path, source)
    }

    /// Create a live mount at `path` and return the handle that feeds it.
    pub fn add_live_mount(&self, path: &str, info: TrackInfo) -> Result<LiveFeed> {
        let (_mount, feed) = self.ctx.media.add_live(path, info)?;
        Ok(feed)
    }

    /// Serve `path` for requests that match no other mount.
    pub fn set_default_mount(&self, path: &str) {
        self.ctx.media.set_default(path);
    }

    pub fn start(&mut self) -> Result<()> {
        if self.event_loop.is_some() {
            return Err(RelayError::AlreadyRunning);
        }

        let listener = TcpListener::bind(&self.ctx.config.bind)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        self.ctx.scheduler.start()?;

        let ctx = self.ctx.clone();
        let handle = thread::Builder::new()
            .name("rtsp-event-loop".into())
            .spawn(move || event_loop(listener, ctx))?;

        self.local_addr = Some(local_addr);
        self.event_loop = Some(handle);

        tracing::info!(addr = %local_addr, "RTSP server listening");
        Ok(())
    }

    /// Close every connection, wait for the event loop to finish, then stop
    /// delivery and the media pumps.
    pub fn stop(&mut self) -> Result<()> {
        let handle = self.event_loop.take().ok_or(RelayError::NotStarted)?;
        tracing::info!("server stopping");

        self.ctx.request_shutdown();
        if handle.join().is_err() {
            tracing::error!("event loop thread panicked");
        }
        self.ctx.scheduler.shutdown();
        self.ctx.media.shutdown();

        tracing::info!("server stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.event_loop.is_some() && !self.ctx.should_stop()
    }

    /// Address the listener is bound to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn context(&self) -> &Arc<ServerContext> {
        &self.ctx
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if self.event_loop.is_some() {
            let _ = self.stop();
        }
    }
}

fn event_loop(listener: TcpListener, ctx: Arc<ServerContext>) {
    let mut connections = ConnectionScheduler::new();
    tracing::debug!("event loop started");

    while !ctx.should_stop() {
        accept_pending(&listener, &mut connections, &ctx);
        connections.run_pass(&ctx);
        thread::sleep(ctx.config.connection_tick);
    }

    tracing::debug!("event loop exited");
}

fn accept_pending(listener: &TcpListener, connections: &mut ConnectionScheduler, ctx: &ServerContext) {
    loop {
        match listener.accept() {
            Ok((stream, peer)) => {
                if ctx.shutdown_requested() {
                    tracing::debug!(%peer, "connection refused during shutdown");
                    continue;
                }
                match RtspHandler::new(stream) {
                    Ok(handler) => {
                        connections.add(peer, Box::new(handler), ctx);
                    }
                    Err(e) => tracing::warn!(%peer, error = %e, "failed to set up connection"),
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
            Err(e) => {
                tracing::warn!(error = %e, "TCP accept error");
                return;
            }
        }
    }
}
