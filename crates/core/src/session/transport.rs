/// Client-side transport request from the RTSP `Transport` header
/// (RFC 2326 §12.39).
///
/// Only unicast UDP (`RTP/AVP;unicast;client_port=RTP-RTCP`) can be served.
/// Interleaved and multicast requests are recognised so SETUP can refuse
/// them with `461 Unsupported Transport`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportHeader {
    Udp {
        client_rtp_port: u16,
        client_rtcp_port: u16,
    },
    Interleaved,
    Multicast,
}

impl TransportHeader {
    /// Parse the `Transport` header value.
    ///
    /// ```
    /// use relay::session::transport::TransportHeader;
    ///
    /// let th = TransportHeader::parse("RTP/AVP;unicast;client_port=8000-8001").unwrap();
    /// assert_eq!(
    ///     th,
    ///     TransportHeader::Udp { client_rtp_port: 8000, client_rtcp_port: 8001 }
    /// );
    ///
    /// assert!(TransportHeader::parse("RTP/AVP;unicast").is_none());
    /// ```
    pub fn parse(header: &str) -> Option<Self> {
        // Clients may offer several transports separated by commas; take the
        // first one we understand.
        header.split(',').find_map(Self::parse_one)
    }

    fn parse_one(spec: &str) -> Option<Self> {
        let mut parts = spec.split(';').map(str::trim);
        let profile = parts.next()?;
        if profile.eq_ignore_ascii_case("RTP/AVP/TCP") {
            return Some(Self::Interleaved);
        }

        for part in parts {
            if part.eq_ignore_ascii_case("multicast") {
                return Some(Self::Multicast);
            }
            if part.starts_with("interleaved=") {
                return Some(Self::Interleaved);
            }
            if let Some(ports) = part.strip_prefix("client_port=") {
                let (rtp, rtcp) = match ports.split_once('-') {
                    Some((rtp, rtcp)) => (rtp.parse().ok()?, rtcp.parse().ok()?),
                    None => {
                        let rtp: u16 = ports.parse().ok()?;
                        (rtp, rtp.checked_add(1)?)
                    }
                };
                return Some(Self::Udp {
                    client_rtp_port: rtp,
                    client_rtcp_port: rtcp,
                });
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_valid_transport() {
        let th = TransportHeader::parse("RTP/AVP;unicast;client_port=5000-5001").unwrap();
        assert_eq!(
            th,
            TransportHeader::Udp {
                client_rtp_port: 5000,
                client_rtcp_port: 5001
            }
        );
    }

    #[test]
    fn parse_single_port() {
        let th = TransportHeader::parse("RTP/AVP;unicast;client_port=6970").unwrap();
        assert_eq!(
            th,
            TransportHeader::Udp {
                client_rtp_port: 6970,
                client_rtcp_port: 6971
            }
        );
    }

    #[test]
    fn parse_no_client_port() {
        assert!(TransportHeader::parse("RTP/AVP;unicast").is_none());
    }

    #[test]
    fn parse_interleaved_and_multicast() {
        assert_eq!(
            TransportHeader::parse("RTP/AVP/TCP;unicast;interleaved=0-1"),
            Some(TransportHeader::Interleaved)
        );
        assert_eq!(
            TransportHeader::parse("RTP/AVP;multicast;port=9000-9001"),
            Some(TransportHeader::Multicast)
        );
    }

    #[test]
    fn first_understood_offer_wins() {
        let th = TransportHeader::parse(
            "RTP/AVP/TCP;interleaved=0-1,RTP/AVP;unicast;client_port=4000-4001",
        )
        .unwrap();
        assert_eq!(th, TransportHeader::Interleaved);
    }
}
