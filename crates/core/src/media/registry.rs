use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use super::pump::{self, PumpOptions};
use super::{LiveFeed, LiveSource, MediaSource, TrackInfo};
use crate::error::{RelayError, Result};
use crate::queue::Track;

pub const DEFAULT_MOUNT_PATH: &str = "/stream";

/// A named stream endpoint (e.g. `/stream`, `/clip.ulaw`).
///
/// Owns the media source behind it and the pump thread feeding its tracks.
pub struct Mount {
    path: String,
    source: Arc<Mutex<Box<dyn MediaSource>>>,
    tracks: Vec<Arc<Track>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl Mount {
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn tracks(&self) -> &[Arc<Track>] {
        &self.tracks
    }

    pub fn track(&self, index: usize) -> Option<&Arc<Track>> {
        self.tracks.get(index)
    }

    /// Select the track a SETUP URI addresses.
    ///
    /// `rtsp://host/stream/track1` picks the track named `track1`; a URI
    /// without a track suffix picks the first track.
    pub fn track_for_uri(&self, uri: &str) -> Option<&Arc<Track>> {
        let last = uri.rsplit('/').next().unwrap_or("");
        self.tracks
            .iter()
            .find(|t| t.name() == last)
            .or_else(|| self.tracks.first())
    }

    /// Reposition the mount's source; every track gets a new generation.
    pub fn seek(&self, position: Duration) -> Result<()> {
        self.source.lock().seek(position)
    }

    pub fn is_live(&self) -> bool {
        self.source.lock().is_live()
    }

    fn join_pump(&self) {
        if let Some(handle) = self.pump.lock().take()
            && handle.join().is_err()
        {
            tracing::warn!(mount = %self.path, "media pump panicked");
        }
    }
}

/// Registry of mount points, keyed by path.
///
/// Mounts are either registered up front ([`add`](Self::add),
/// [`add_live`](Self::add_live)) or opened on first request from files under
/// the media root ([`open`](Self::open)). Opened mounts are cached; failed
/// opens are not.
///
/// A "default" mount acts as a fallback when the requested URI path doesn't
/// match anything, so clients requesting any path are served when only one
/// stream is configured.
pub struct MediaRegistry {
    mounts: RwLock<HashMap<String, Arc<Mount>>>,
    default_path: RwLock<Option<String>>,
    media_root: Option<PathBuf>,
    options: PumpOptions,
    shutdown: Arc<AtomicBool>,
}

impl MediaRegistry {
    pub fn new(media_root: Option<PathBuf>, options: PumpOptions) -> Self {
        Self {
            mounts: RwLock::new(HashMap::new()),
            default_path: RwLock::new(None),
            media_root,
            options,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Register `source` at `path` and start pumping it.
    ///
    /// Replaces any existing mount at the same path; the old mount's tracks
    /// are stopped.
    pub fn add(&self, path: &str, source: Box<dyn MediaSource>) -> Result<Arc<Mount>> {
        let mount = self.start_mount(path, source)?;
        let previous = self.mounts.write().insert(path.to_string(), mount.clone());
        if let Some(previous) = previous {
            tracing::info!(path, "mount replaced");
            previous.tracks.iter().for_each(|t| t.stop());
        }
        tracing::info!(path, tracks = mount.tracks.len(), "mount registered");
        Ok(mount)
    }

    /// Register a live mount and return the handle that feeds it.
    pub fn add_live(&self, path: &str, info: TrackInfo) -> Result<(Arc<Mount>, LiveFeed)> {
        let (source, feed) = LiveSource::new(info, self.options.max_queued_units);
        let mount = self.add(path, Box::new(source))?;
        Ok((mount, feed))
    }

    /// Cached mount for `path`, or open it from the media root.
    pub fn open(&self, path: &str) -> Result<Arc<Mount>> {
        if let Some(mount) = self.get(path) {
            return Ok(mount);
        }

        let root = self
            .media_root
            .as_ref()
            .ok_or_else(|| RelayError::MountNotFound(path.to_string()))?;

        let mut mounts = self.mounts.write();
        // Another caller may have opened it while we waited for the lock.
        if let Some(mount) = mounts.get(path) {
            return Ok(mount.clone());
        }

        let source = super::open_source(root, path)?;
        let mount = self.start_mount(path, source)?;
        mounts.insert(path.to_string(), mount.clone());

        tracing::info!(path, "mount opened from media root");
        Ok(mount)
    }

    /// Designate a mount path as the default fallback.
    pub fn set_default(&self, path: &str) {
        *self.default_path.write() = Some(path.to_string());
    }

    /// Look up a mount by exact path.
    pub fn get(&self, path: &str) -> Option<Arc<Mount>> {
        self.mounts.read().get(path).cloned()
    }

    /// Resolve a mount from an RTSP URI.
    ///
    /// Tries an exact path match, then opening the path from the media root,
    /// then the default mount.
    pub fn resolve_from_uri(&self, uri: &str) -> Option<Arc<Mount>> {
        let path = extract_mount_path(uri);
        self.get(path)
            .or_else(|| match self.open(path) {
                Ok(mount) => Some(mount),
                Err(e) => {
                    tracing::debug!(path, error = %e, "mount not openable");
                    None
                }
            })
            .or_else(|| {
                let default = self.default_path.read();
                default.as_ref().and_then(|p| self.get(p))
            })
    }

    pub fn len(&self) -> usize {
        self.mounts.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.mounts.read().is_empty()
    }

    /// Stop every pump and wait for them to exit.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        let mounts: Vec<Arc<Mount>> = self.mounts.read().values().cloned().collect();
        for mount in mounts {
            mount.join_pump();
        }
    }

    fn start_mount(&self, path: &str, source: Box<dyn MediaSource>) -> Result<Arc<Mount>> {
        let tracks = source.tracks().to_vec();
        let source = Arc::new(Mutex::new(source));
        let handle = pump::spawn(path, source.clone(), self.options, self.shutdown.clone())?;

        Ok(Arc::new(Mount {
            path: path.to_string(),
            source,
            tracks,
            pump: Mutex::new(Some(handle)),
        }))
    }
}

impl Drop for MediaRegistry {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
    }
}

/// Extract the mount path from an RTSP URI.
///
/// `rtsp://host:8554/stream/track1` → `/stream`
/// `rtsp://host:8554/stream`        → `/stream`
/// `rtsp://host:8554/`              → `/`
/// `rtsp://host:8554`               → `/stream` (default)
/// `*`                               → `/stream` (default)
pub fn extract_mount_path(uri: &str) -> &str {
    let path = if let Some(after) = uri
        .strip_prefix("rtsp://")
        .or_else(|| uri.strip_prefix("rtsps://"))
    {
        match after.find('/') {
            Some(slash) => &after[slash..],
            None => DEFAULT_MOUNT_PATH,
        }
    } else if uri.starts_with('/') {
        uri
    } else {
        DEFAULT_MOUNT_PATH
    };

    // Strip track suffix: /stream/track1 → /stream
    if let Some(pos) = path.rfind("/track") {
        &path[..pos]
    } else {
        path
    }
}
