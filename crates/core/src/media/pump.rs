//! Per-mount thread that drives a [`MediaSource`].

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;

use super::{MediaSource, ReadStatus};
use crate::queue::Track;

/// Pacing knobs shared by every pump.
#[derive(Debug, Clone, Copy)]
pub struct PumpOptions {
    /// Sleep between polls when the source is idle or throttled.
    pub tick: Duration,
    /// Non-live sources pause while any track holds this many units.
    pub max_queued_units: usize,
}

impl Default for PumpOptions {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(5),
            max_queued_units: 512,
        }
    }
}

/// Spawn the pump for `source`.
///
/// The thread exits when the source fails or `shutdown` is raised, or once
/// the source reports end-of-stream and every queued unit has been
/// delivered. In every case the tracks are stopped on the way out so
/// consumers see the producer finish.
pub fn spawn(
    path: &str,
    source: Arc<Mutex<Box<dyn MediaSource>>>,
    options: PumpOptions,
    shutdown: Arc<AtomicBool>,
) -> io::Result<JoinHandle<()>> {
    let path = path.to_string();
    let (tracks, live) = {
        let source = source.lock();
        (source.tracks().to_vec(), source.is_live())
    };

    thread::Builder::new()
        .name(format!("pump{}", path))
        .spawn(move || {
            if run(&path, &source, &tracks, live, options, &shutdown) {
                drain(&tracks, options, &shutdown);
            }
            for track in &tracks {
                track.stop();
            }
        })
}

fn run(
    path: &str,
    source: &Mutex<Box<dyn MediaSource>>,
    tracks: &[Arc<Track>],
    live: bool,
    options: PumpOptions,
    shutdown: &AtomicBool,
) -> bool {
    tracing::debug!(mount = path, live, "media pump started");

    while !shutdown.load(Ordering::Acquire) {
        if !live && tracks.iter().any(|t| t.len() >= options.max_queued_units) {
            thread::sleep(options.tick);
            continue;
        }

        let status = source.lock().read_packet();
        match status {
            Ok(ReadStatus::Packet) => {}
            Ok(ReadStatus::Idle) => thread::sleep(options.tick),
            Ok(ReadStatus::Eof) => {
                tracing::info!(mount = path, "media source exhausted");
                return true;
            }
            Err(e) => {
                tracing::error!(mount = path, error = %e, "media source failed");
                return false;
            }
        }
    }

    tracing::debug!(mount = path, "media pump shut down");
    false
}

/// Stopping a track hides whatever is still queued, so hold off until the
/// consumers have taken it all.
fn drain(tracks: &[Arc<Track>], options: PumpOptions, shutdown: &AtomicBool) {
    while !shutdown.load(Ordering::Acquire) && tracks.iter().any(|t| !t.is_empty()) {
        thread::sleep(options.tick);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{LiveSource, TrackInfo};
    use crate::queue::Consumer;
    use std::time::Instant;

    #[test]
    fn track_stops_after_queue_drains() {
        let (source, feed) = LiveSource::new(TrackInfo::new("v"), 64);
        let track = source.tracks()[0].clone();
        let mut consumer = Consumer::attach(&track);
        let source: Arc<Mutex<Box<dyn MediaSource>>> = Arc::new(Mutex::new(Box::new(source)));
        let shutdown = Arc::new(AtomicBool::new(false));

        let handle = spawn("/live", source, PumpOptions::default(), shutdown).unwrap();
        feed.push(vec![1u8, 2, 3], 0, true);
        feed.finish();

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut delivered = Vec::new();
        while !consumer.is_stopped() && Instant::now() < deadline {
            if let Some(unit) = consumer.get().unwrap() {
                delivered.push(unit.sequence);
                consumer.advance().unwrap();
            }
            thread::sleep(Duration::from_millis(1));
        }
        handle.join().unwrap();

        assert!(track.is_stopped());
        assert!(track.is_empty());
        assert_eq!(delivered, vec![1]);
    }

    #[test]
    fn shutdown_flag_ends_idle_pump() {
        let (source, _feed) = LiveSource::new(TrackInfo::new("v"), 64);
        let track = source.tracks()[0].clone();
        let source: Arc<Mutex<Box<dyn MediaSource>>> = Arc::new(Mutex::new(Box::new(source)));
        let shutdown = Arc::new(AtomicBool::new(false));

        let handle = spawn("/live", source, PumpOptions::default(), shutdown.clone()).unwrap();
        shutdown.store(true, Ordering::Release);
        handle.join().unwrap();
        assert!(track.is_stopped());
    }
}
