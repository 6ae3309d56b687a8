use rand::RngExt;

/// RTP fixed header state for one outgoing stream (RFC 3550 §5.1).
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |V=2|P|X|  CC   |M|     PT      |       Sequence Number         |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                           Timestamp                           |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                             SSRC                              |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
///
/// Each RTP session owns one. Buffer units carry media timestamps starting
/// near zero; the header offsets them by a per-stream base so the wire
/// timestamp starts at a random value (RFC 3550 §5.1).
///
/// Version is always 2. Padding, extension, and CSRC count are always 0.
#[derive(Debug)]
pub struct RtpHeader {
    /// RTP payload type (7-bit, RFC 3551).
    pub pt: u8,
    /// Synchronization source identifier (RFC 3550 §8.1).
    pub ssrc: u32,
    sequence: u16,
    timestamp_base: u32,
}

impl RtpHeader {
    pub fn new(pt: u8, ssrc: u32, timestamp_base: u32) -> Self {
        tracing::debug!(
            pt,
            ssrc = format_args!("{:#010X}", ssrc),
            "RTP header state created"
        );
        Self {
            pt,
            ssrc,
            sequence: 0,
            timestamp_base,
        }
    }

    /// Create with a random SSRC, starting sequence and timestamp base.
    pub fn with_random_ssrc(pt: u8) -> Self {
        let mut rng = rand::rng();
        let mut header = Self::new(pt, rng.random::<u32>(), rng.random::<u32>());
        header.sequence = rng.random::<u16>();
        header
    }

    /// Sequence number the next [`write`](Self::write) call will use.
    pub fn sequence(&self) -> u16 {
        self.sequence
    }

    /// Wire timestamp for a unit timestamp.
    pub fn rtp_timestamp(&self, unit_timestamp: u32) -> u32 {
        self.timestamp_base.wrapping_add(unit_timestamp)
    }

    /// Serialize a 12-byte RTP fixed header and advance the sequence number.
    pub fn write(&mut self, marker: bool, unit_timestamp: u32) -> [u8; 12] {
        let first_byte: u8 = 2 << 6;
        let second_byte: u8 = ((marker as u8) << 7) | (self.pt & 0x7f);

        let mut header = [0u8; 12];
        header[0] = first_byte;
        header[1] = second_byte;
        header[2..4].copy_from_slice(&self.sequence.to_be_bytes());
        header[4..8].copy_from_slice(&self.rtp_timestamp(unit_timestamp).to_be_bytes());
        header[8..12].copy_from_slice(&self.ssrc.to_be_bytes());

        self.sequence = self.sequence.wrapping_add(1);
        header
    }
}

/// RTCP BYE for a single source (RFC 3550 §6.6), sent when a session is
/// torn down.
pub fn rtcp_bye(ssrc: u32) -> [u8; 8] {
    let mut packet = [0u8; 8];
    // V=2, P=0, SC=1
    packet[0] = (2 << 6) | 1;
    packet[1] = 203;
    // Length in 32-bit words minus one.
    packet[2..4].copy_from_slice(&1u16.to_be_bytes());
    packet[4..8].copy_from_slice(&ssrc.to_be_bytes());
    packet
}
