//! Static RTP payload types (RFC 3551 §6).
//!
//! Used to fill in payload type and clock rate when a track only names its
//! encoding, and to infer the media type from a payload type number.

use super::info::MediaType;

/// One row of the RFC 3551 static payload table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaticPayload {
    pub payload_type: u8,
    pub encoding_name: &'static str,
    pub clock_rate: u32,
    /// Audio channels; 0 for video.
    pub channels: u8,
}

const fn entry(
    payload_type: u8,
    encoding_name: &'static str,
    clock_rate: u32,
    channels: u8,
) -> StaticPayload {
    StaticPayload {
        payload_type,
        encoding_name,
        clock_rate,
        channels,
    }
}

pub const STATIC_PAYLOADS: &[StaticPayload] = &[
    entry(0, "PCMU", 8000, 1),
    entry(2, "G726_32", 8000, 1),
    entry(3, "GSM", 8000, 1),
    entry(4, "G723", 8000, 1),
    entry(5, "DVI4", 8000, 1),
    entry(6, "DVI4", 16000, 1),
    entry(7, "LPC", 8000, 1),
    entry(8, "PCMA", 8000, 1),
    entry(9, "G722", 8000, 1),
    entry(10, "L16", 44100, 2),
    entry(11, "L16", 44100, 1),
    entry(12, "QCELP", 8000, 1),
    entry(14, "MPA", 90000, 1),
    entry(15, "G728", 8000, 1),
    entry(16, "DVI4", 11025, 1),
    entry(17, "DVI4", 22050, 1),
    entry(18, "G729", 8000, 1),
    entry(25, "CelB", 90000, 0),
    entry(26, "JPEG", 90000, 0),
    entry(28, "nv", 90000, 0),
    entry(31, "H261", 90000, 0),
    entry(32, "MPV", 90000, 0),
    entry(33, "MP2T", 90000, 0),
    entry(34, "H263", 90000, 0),
];

/// First static entry for an encoding name (case-insensitive).
///
/// Encodings listed more than once (DVI4, L16) resolve to the lowest
/// payload type.
pub fn lookup(encoding_name: &str) -> Option<&'static StaticPayload> {
    STATIC_PAYLOADS
        .iter()
        .find(|p| p.encoding_name.eq_ignore_ascii_case(encoding_name))
}

/// Static entry for a payload type number.
pub fn by_payload_type(payload_type: u8) -> Option<&'static StaticPayload> {
    STATIC_PAYLOADS
        .iter()
        .find(|p| p.payload_type == payload_type)
}

/// 0–23 are audio, 24–95 video, 96–127 dynamic (unknown).
pub fn media_type_for(payload_type: u8) -> MediaType {
    match payload_type {
        0..=23 => MediaType::Audio,
        24..=95 => MediaType::Video,
        _ => MediaType::Undefined,
    }
}
