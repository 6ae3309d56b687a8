use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::time::Duration;

use bytes::Bytes;

use super::{MediaSource, ReadStatus, TrackInfo};
use crate::error::Result;
use crate::queue::{Packet, Track};

/// Handle used by another thread to feed a [`LiveSource`].
///
/// Dropping every clone of the feed (or calling [`finish`](Self::finish))
/// ends the stream: the pump sees end-of-stream and stops the track.
#[derive(Clone)]
pub struct LiveFeed {
    tx: Sender<Packet>,
}

impl LiveFeed {
    /// Queue one unit. Returns `false` once the source is gone.
    pub fn push(&self, payload: impl Into<Bytes>, timestamp: u32, marker: bool) -> bool {
        let packet = Packet::new(payload)
            .with_timestamp(timestamp)
            .with_marker(marker);
        self.tx.send(packet).is_ok()
    }

    pub fn finish(self) {
        drop(self);
    }
}

/// A single-track source whose units are pushed in from outside.
///
/// The source only moves units from its channel into the track, so the
/// track keeps a single writer. When nobody is draining the track and it
/// grows past `max_backlog`, the backlog is discarded with a reset.
pub struct LiveSource {
    rx: Receiver<Packet>,
    tracks: Vec<Arc<Track>>,
    max_backlog: usize,
}

impl LiveSource {
    pub fn new(info: TrackInfo, max_backlog: usize) -> (Self, LiveFeed) {
        let (tx, rx) = mpsc::channel();
        let source = Self {
            rx,
            tracks: vec![Arc::new(Track::with_info(info))],
            max_backlog,
        };
        (source, LiveFeed { tx })
    }
}

impl MediaSource for LiveSource {
    fn tracks(&self) -> &[Arc<Track>] {
        &self.tracks
    }

    fn read_packet(&mut self) -> Result<ReadStatus> {
        match self.rx.try_recv() {
            Ok(packet) => {
                let track = &self.tracks[0];
                if track.len() >= self.max_backlog {
                    tracing::debug!(
                        track = %track.name(),
                        backlog = self.max_backlog,
                        "live backlog discarded"
                    );
                    track.reset()?;
                }
                track.enqueue(packet)?;
                Ok(ReadStatus::Packet)
            }
            Err(TryRecvError::Empty) => Ok(ReadStatus::Idle),
            Err(TryRecvError::Disconnected) => Ok(ReadStatus::Eof),
        }
    }

    /// Live media cannot be repositioned; a seek only marks a discontinuity.
    fn seek(&mut self, _position: Duration) -> Result<()> {
        self.tracks[0].reset()
    }

    fn is_live(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pushes_arrive_in_order() {
        let (mut source, feed) = LiveSource::new(TrackInfo::new("v"), 16);
        assert!(feed.push(vec![1u8], 0, false));
        assert!(feed.push(vec![2u8], 0, true));

        assert_eq!(source.read_packet().unwrap(), ReadStatus::Packet);
        assert_eq!(source.read_packet().unwrap(), ReadStatus::Packet);
        assert_eq!(source.read_packet().unwrap(), ReadStatus::Idle);

        let snap = source.tracks()[0].snapshot();
        assert_eq!(snap.units, vec![(1, 0), (2, 0)]);
    }

    #[test]
    fn finished_feed_reads_eof() {
        let (mut source, feed) = LiveSource::new(TrackInfo::new("v"), 16);
        feed.push(vec![1u8], 0, true);
        feed.finish();
        assert_eq!(source.read_packet().unwrap(), ReadStatus::Packet);
        assert_eq!(source.read_packet().unwrap(), ReadStatus::Eof);
    }

    #[test]
    fn backlog_is_discarded() {
        let (mut source, feed) = LiveSource::new(TrackInfo::new("v"), 2);
        for i in 0..3u8 {
            feed.push(vec![i], 0, true);
            source.read_packet().unwrap();
        }
        let track = &source.tracks()[0];
        assert_eq!(track.generation(), 1);
        assert_eq!(track.snapshot().units, vec![(3, 0)]);
    }
}
