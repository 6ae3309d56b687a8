use bytes::Bytes;

/// One immutable chunk of media sitting in a [`Track`](super::Track) queue.
///
/// Cloning is cheap: the payload is reference counted and shared by every
/// consumer that reads the unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferUnit {
    /// Queue sequence number, strictly increasing within one generation.
    pub sequence: u64,
    /// Media timestamp in the track's clock rate.
    pub timestamp: u32,
    /// Last unit of an access unit / frame (RTP marker bit).
    pub marker: bool,
    /// Payload bytes, sent verbatim after the RTP header.
    pub payload: Bytes,
}

/// What a producer hands to [`Track::enqueue`](super::Track::enqueue).
///
/// The sequence number is optional; when absent the track assigns the
/// next one.
#[derive(Debug, Clone)]
pub struct Packet {
    pub payload: Bytes,
    pub timestamp: u32,
    pub marker: bool,
    pub sequence: Option<u64>,
}

impl Packet {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            timestamp: 0,
            marker: true,
            sequence: None,
        }
    }

    pub fn with_timestamp(mut self, timestamp: u32) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_marker(mut self, marker: bool) -> Self {
        self.marker = marker;
        self
    }

    /// Use an explicit sequence number instead of the track's counter.
    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = Some(sequence);
        self
    }
}
