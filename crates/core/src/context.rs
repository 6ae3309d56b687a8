use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use crate::delivery::{PacketScheduler, RtpScheduler};
use crate::eventloop;
use crate::media::MediaRegistry;
use crate::media::pump::PumpOptions;
use crate::server::ServerConfig;
use crate::session::{PortPool, RtpSession};

/// Everything the connection scheduler, protocol handlers and outer run
/// loop share. One per server, passed by reference to every entry point.
pub struct ServerContext {
    pub config: ServerConfig,
    pub media: MediaRegistry,
    pub ports: PortPool,
    pub scheduler: Arc<RtpScheduler>,
    stop: AtomicBool,
    shutdown_requested: AtomicBool,
    /// Open connections, minus one once shutdown has been requested. Goes
    /// negative when the last connection is gone after a shutdown request.
    active_connections: AtomicI64,
}

impl ServerContext {
    pub fn new(config: ServerConfig) -> Self {
        let media = MediaRegistry::new(
            config.media_root.clone(),
            PumpOptions {
                tick: config.scheduler_tick,
                max_queued_units: config.max_queued_units,
            },
        );
        let ports = PortPool::new(config.port_min, config.port_max);
        let scheduler = RtpScheduler::new(config.scheduler_tick);

        Self {
            config,
            media,
            ports,
            scheduler,
            stop: AtomicBool::new(false),
            shutdown_requested: AtomicBool::new(false),
            active_connections: AtomicI64::new(0),
        }
    }

    pub(crate) fn connection_opened(&self) -> i64 {
        self.active_connections.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn connection_closed(&self) -> i64 {
        self.active_connections.fetch_sub(1, Ordering::AcqRel) - 1
    }

    pub fn active_connections(&self) -> i64 {
        self.active_connections.load(Ordering::Acquire)
    }

    /// Ask the connection scheduler to close everything and stop.
    ///
    /// Takes one extra count off the active connections; only the first
    /// call does.
    pub fn request_shutdown(&self) {
        if !self.shutdown_requested.swap(true, Ordering::AcqRel) {
            let active = self.active_connections.fetch_sub(1, Ordering::AcqRel) - 1;
            tracing::info!(active, "shutdown requested");
        }
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::Acquire)
    }

    pub(crate) fn raise_stop(&self) {
        if !self.stop.swap(true, Ordering::AcqRel) {
            tracing::info!("stop flag raised");
        }
    }

    /// Lock-free check for the outer run loop.
    pub fn should_stop(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Tear down one RTP session against this server's scheduler and
    /// port pool.
    pub fn release_rtp_session(&self, rtp: Arc<RtpSession>) {
        eventloop::release_rtp_session(
            rtp,
            self.scheduler.as_ref() as &dyn PacketScheduler,
            &self.ports,
            self.config.idle_wait_slice,
            self.config.idle_wait_retries,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shutdown_request_counts_once() {
        let ctx = ServerContext::new(ServerConfig::default());
        assert_eq!(ctx.connection_opened(), 1);
        ctx.request_shutdown();
        ctx.request_shutdown();
        assert_eq!(ctx.active_connections(), 0);
        assert_eq!(ctx.connection_closed(), -1);
        assert!(ctx.shutdown_requested());
        assert!(!ctx.should_stop());
        ctx.raise_stop();
        assert!(ctx.should_stop());
    }
}
