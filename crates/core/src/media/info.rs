use super::payload;

/// Broad media kind of a track.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaType {
    Audio,
    Video,
    Undefined,
}

/// Descriptive properties of a track.
///
/// Payload type and clock rate can be given explicitly or derived from the
/// encoding name through the static payload table. Explicit values always
/// win, regardless of the order the builder methods are called in.
#[derive(Debug, Clone)]
pub struct TrackInfo {
    /// Track name, also used as its RTSP control path (`<mount>/<name>`).
    pub name: String,
    pub encoding_name: Option<String>,
    pub payload_type: Option<u8>,
    pub clock_rate: Option<u32>,
    pub channels: Option<u8>,
    pub media_type: MediaType,
    payload_type_forced: bool,
    clock_rate_forced: bool,
}

impl TrackInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            encoding_name: None,
            payload_type: None,
            clock_rate: None,
            channels: None,
            media_type: MediaType::Undefined,
            payload_type_forced: false,
            clock_rate_forced: false,
        }
    }

    /// Set the encoding name, probing the static payload table.
    pub fn with_encoding(mut self, encoding_name: &str) -> Self {
        self.encoding_name = Some(encoding_name.to_string());

        if let Some(info) = payload::lookup(encoding_name) {
            tracing::debug!(
                encoding = encoding_name,
                payload_type = info.payload_type,
                "static payload detected"
            );
            if !self.payload_type_forced {
                self.set_payload_type(info.payload_type);
            }
            if !self.clock_rate_forced {
                self.clock_rate = Some(info.clock_rate);
            }
            if self.channels.is_none() && info.channels > 0 {
                self.channels = Some(info.channels);
            }
        }
        self
    }

    pub fn with_payload_type(mut self, payload_type: u8) -> Self {
        self.set_payload_type(payload_type);
        self.payload_type_forced = true;
        self
    }

    pub fn with_clock_rate(mut self, clock_rate: u32) -> Self {
        self.clock_rate = Some(clock_rate);
        self.clock_rate_forced = true;
        self
    }

    pub fn with_channels(mut self, channels: u8) -> Self {
        self.channels = Some(channels);
        self
    }

    /// Payload type used on the wire; dynamic 96 when nothing was set.
    pub fn rtp_payload_type(&self) -> u8 {
        self.payload_type.unwrap_or(96)
    }

    fn set_payload_type(&mut self, payload_type: u8) {
        self.payload_type = Some(payload_type);
        let media_type = payload::media_type_for(payload_type);
        if media_type != MediaType::Undefined {
            self.media_type = media_type;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoding_fills_static_fields() {
        let info = TrackInfo::new("audio").with_encoding("PCMA");
        assert_eq!(info.payload_type, Some(8));
        assert_eq!(info.clock_rate, Some(8000));
        assert_eq!(info.media_type, MediaType::Audio);
    }

    #[test]
    fn forced_values_survive_encoding_probe() {
        let info = TrackInfo::new("audio")
            .with_payload_type(97)
            .with_clock_rate(16000)
            .with_encoding("PCMU");
        assert_eq!(info.payload_type, Some(97));
        assert_eq!(info.clock_rate, Some(16000));
    }

    #[test]
    fn dynamic_encoding_leaves_defaults() {
        let info = TrackInfo::new("video").with_encoding("H264");
        assert_eq!(info.payload_type, None);
        assert_eq!(info.rtp_payload_type(), 96);
        assert_eq!(info.media_type, MediaType::Undefined);
    }

    #[test]
    fn payload_type_infers_video() {
        let info = TrackInfo::new("video").with_payload_type(26);
        assert_eq!(info.media_type, MediaType::Video);
    }
}
