//! Media sources and the tracks they feed.
//!
//! A [`MediaSource`] owns one or more [`Track`]s and fills their queues.
//! Each source type implements the trait; which one serves a given name is
//! decided by [`sniff`] when a mount is opened:
//!
//! | Source | Selected by | Payload |
//! |--------|-------------|---------|
//! | [`FileSource`] | `.ulaw`/`.pcmu`, `.alaw`/`.pcma`, `.l16` | RFC 3551 static audio, fixed-size chunks |
//! | [`LiveSource`] | built in code via [`LiveSource::new`] | whatever the feeding thread pushes |
//!
//! A [`pump`] thread per mount drives `read_packet` until the source is
//! exhausted, then stops the tracks.

pub mod file;
pub mod info;
pub mod live;
pub mod payload;
pub mod pump;
pub mod registry;
pub mod rtp;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{RelayError, Result};
use crate::queue::Track;

pub use file::FileSource;
pub use info::{MediaType, TrackInfo};
pub use live::{LiveFeed, LiveSource};
pub use registry::{MediaRegistry, Mount};

/// Outcome of one [`MediaSource::read_packet`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    /// A unit was enqueued on one of the tracks.
    Packet,
    /// Nothing available right now; try again later.
    Idle,
    /// The source is exhausted. The pump stops every track.
    Eof,
}

/// A producer of media units.
///
/// Implementations are the single writer of their tracks' queues. They are
/// driven from one pump thread, while control requests such as
/// [`seek`](Self::seek) arrive from the connection thread through the
/// mount's lock.
pub trait MediaSource: Send {
    /// Tracks this source writes to, in control order.
    fn tracks(&self) -> &[Arc<Track>];

    /// Read the next unit from the underlying media and enqueue it.
    fn read_packet(&mut self) -> Result<ReadStatus>;

    /// Reposition the source. Always signals a discontinuity on the tracks.
    fn seek(&mut self, position: Duration) -> Result<()>;

    /// Live sources produce at their own pace and are never throttled by
    /// the pump.
    fn is_live(&self) -> bool {
        false
    }
}

/// Source types that can be opened by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    /// G.711 µ-law, 8 kHz mono.
    Pcmu,
    /// G.711 A-law, 8 kHz mono.
    Pcma,
    /// 16-bit big-endian linear PCM, 44.1 kHz mono.
    L16Mono,
}

impl SourceKind {
    /// Match a file name by extension (case-insensitive).
    pub fn probe(name: &str) -> Option<Self> {
        let ext = Path::new(name).extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "ulaw" | "pcmu" => Some(Self::Pcmu),
            "alaw" | "pcma" => Some(Self::Pcma),
            "l16" => Some(Self::L16Mono),
            _ => None,
        }
    }

    /// Encoding name as listed in the static payload table.
    pub fn encoding_name(self) -> &'static str {
        match self {
            Self::Pcmu => "PCMU",
            Self::Pcma => "PCMA",
            Self::L16Mono => "L16",
        }
    }

    /// Forced payload type, where the encoding name alone is ambiguous.
    fn payload_type(self) -> Option<u8> {
        match self {
            Self::L16Mono => Some(11),
            _ => None,
        }
    }

    pub fn bytes_per_sample(self) -> usize {
        match self {
            Self::Pcmu | Self::Pcma => 1,
            Self::L16Mono => 2,
        }
    }

    /// Samples carried per unit: 20 ms for G.711, 10 ms for L16 so a
    /// unit fits a single UDP datagram.
    pub fn samples_per_unit(self) -> usize {
        match self {
            Self::Pcmu | Self::Pcma => 160,
            Self::L16Mono => 441,
        }
    }

    pub fn track_info(self) -> TrackInfo {
        let info = TrackInfo::new("track1");
        let info = match self.payload_type() {
            Some(pt) => info.with_payload_type(pt),
            None => info,
        };
        info.with_encoding(self.encoding_name())
    }
}

/// Pick the source implementation able to serve `name`.
pub fn sniff(name: &str) -> Option<SourceKind> {
    let kind = SourceKind::probe(name);
    tracing::debug!(name, ?kind, "media source probed");
    kind
}

/// Open `name` (relative to `root`) with the implementation [`sniff`] picks.
pub fn open_source(root: &Path, name: &str) -> Result<Box<dyn MediaSource>> {
    let relative = name.trim_start_matches('/');
    let kind = sniff(relative).ok_or_else(|| RelayError::UnsupportedSource(name.to_string()))?;

    // Keep lookups inside the media root.
    if Path::new(relative)
        .components()
        .any(|c| !matches!(c, std::path::Component::Normal(_)))
    {
        return Err(RelayError::UnsupportedSource(name.to_string()));
    }

    let source = FileSource::open(&root.join(relative), kind)?;
    Ok(Box::new(source))
}
