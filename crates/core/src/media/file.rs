use std::fs::File;
use std::io::{self, BufReader, ErrorKind, Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use super::{MediaSource, ReadStatus, SourceKind};
use crate::error::Result;
use crate::queue::{Packet, Track};

/// Pre-recorded raw audio read in fixed-size chunks.
///
/// Every unit carries [`SourceKind::samples_per_unit`] samples and a
/// timestamp equal to its sample offset from the start of the file.
pub struct FileSource {
    kind: SourceKind,
    reader: BufReader<File>,
    tracks: Vec<Arc<Track>>,
    timestamp: u32,
}

impl FileSource {
    pub fn open(path: &Path, kind: SourceKind) -> Result<Self> {
        let file = File::open(path)?;
        let track = Arc::new(Track::with_info(kind.track_info()));

        tracing::info!(path = %path.display(), ?kind, "file source opened");

        Ok(Self {
            kind,
            reader: BufReader::new(file),
            tracks: vec![track],
            timestamp: 0,
        })
    }

    fn chunk_len(&self) -> usize {
        self.kind.samples_per_unit() * self.kind.bytes_per_sample()
    }

    fn clock_rate(&self) -> u32 {
        self.tracks[0].info().clock_rate.unwrap_or(8000)
    }
}

impl MediaSource for FileSource {
    fn tracks(&self) -> &[Arc<Track>] {
        &self.tracks
    }

    fn read_packet(&mut self) -> Result<ReadStatus> {
        let mut buf = vec![0u8; self.chunk_len()];
        let mut filled = 0;
        while filled < buf.len() {
            match self.reader.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }

        let bytes_per_sample = self.kind.bytes_per_sample();
        filled -= filled % bytes_per_sample;
        if filled == 0 {
            return Ok(ReadStatus::Eof);
        }
        buf.truncate(filled);

        self.tracks[0].enqueue(Packet::new(buf).with_timestamp(self.timestamp))?;
        self.timestamp = self
            .timestamp
            .wrapping_add((filled / bytes_per_sample) as u32);

        Ok(ReadStatus::Packet)
    }

    fn seek(&mut self, position: Duration) -> Result<()> {
        let per_unit = self.kind.samples_per_unit() as u64;
        let samples = (position.as_secs_f64() * f64::from(self.clock_rate())) as u64;
        let samples = samples - samples % per_unit;

        let offset = samples
            .checked_mul(self.kind.bytes_per_sample() as u64)
            .ok_or_else(|| io::Error::new(ErrorKind::InvalidInput, "seek position out of range"))?;

        self.reader.seek(SeekFrom::Start(offset))?;
        self.timestamp = samples as u32;
        self.tracks[0].reset()?;

        tracing::debug!(?position, samples, "file source repositioned");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::Consumer;

    fn temp_file(name: &str, len: usize) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!("relay-{}-{}", std::process::id(), name));
        let data: Vec<u8> = (0..len).map(|i| i as u8).collect();
        std::fs::write(&path, data).unwrap();
        path
    }

    #[test]
    fn reads_fixed_chunks_until_eof() {
        let path = temp_file("chunks.ulaw", 400);
        let mut source = FileSource::open(&path, SourceKind::Pcmu).unwrap();

        assert_eq!(source.read_packet().unwrap(), ReadStatus::Packet);
        assert_eq!(source.read_packet().unwrap(), ReadStatus::Packet);
        assert_eq!(source.read_packet().unwrap(), ReadStatus::Packet);
        assert_eq!(source.read_packet().unwrap(), ReadStatus::Eof);

        let track = source.tracks()[0].clone();
        let mut consumer = Consumer::attach(&track);
        let sizes_and_ts: Vec<(usize, u32)> = std::iter::from_fn(|| {
            let unit = consumer.get().unwrap()?;
            consumer.advance().unwrap();
            Some((unit.payload.len(), unit.timestamp))
        })
        .collect();
        assert_eq!(sizes_and_ts, vec![(160, 0), (160, 160), (80, 320)]);

        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn l16_drops_trailing_half_sample() {
        let path = temp_file("odd.l16", 5);
        let mut source = FileSource::open(&path, SourceKind::L16Mono).unwrap();
        assert_eq!(source.read_packet().unwrap(), ReadStatus::Packet);
        let snap = source.tracks()[0].snapshot();
        assert_eq!(snap.units.len(), 1);
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn seek_resets_track_and_timestamp() {
        let path = temp_file("seek.alaw", 8000);
        let mut source = FileSource::open(&path, SourceKind::Pcma).unwrap();
        source.read_packet().unwrap();
        source.read_packet().unwrap();
        let track = source.tracks()[0].clone();
        assert_eq!(track.generation(), 0);

        // 0.5 s at 8 kHz = 4000 samples, already unit aligned.
        source.seek(Duration::from_millis(500)).unwrap();
        assert!(track.is_empty());
        assert_eq!(track.generation(), 1);

        source.read_packet().unwrap();
        let mut consumer = Consumer::attach(&track);
        let unit = consumer.get().unwrap().unwrap();
        assert_eq!(unit.timestamp, 4000);
        assert_eq!(unit.payload[0], (4000 % 256) as u8);

        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn seek_out_of_range_leaves_source_intact() {
        let path = temp_file("far.l16", 2000);
        let mut source = FileSource::open(&path, SourceKind::L16Mono).unwrap();
        let track = source.tracks()[0].clone();

        assert!(source.seek(Duration::MAX).is_err());
        assert_eq!(track.generation(), 0);
        assert_eq!(source.read_packet().unwrap(), ReadStatus::Packet);
        assert_eq!(track.snapshot().units, vec![(1, 0)]);

        std::fs::remove_file(path).unwrap();
    }
}
