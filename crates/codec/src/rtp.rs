//! Fixed-offset reads into RTP and RTCP packets.
//!
//! [RFC 3550]: https://tools.ietf.org/html/rfc3550
//! [RFC 5761]: https://tools.ietf.org/html/rfc5761
//!
//! Routing RoQ payloads only needs the synchronization source and the
//! payload type; everything else in the packet is opaque here. The RTP
//! fixed header places the payload type in the low seven bits of the
//! second byte and the SSRC at offset 8; RTCP places its packet type in
//! the full second byte and the sender SSRC at offset 4.

use crate::Error;

/// Smallest byte count a well-formed RTP fixed header can have.
pub const RTP_HEADER_LEN: usize = 12;

/// Smallest byte count a well-formed RTCP packet can have.
pub const RTCP_HEADER_LEN: usize = 8;

/// The synchronization source of an RTP packet.
///
/// # Test
///
/// ```
/// use roq_codec::rtp;
///
/// let packet = [
///     0x80, 0x60, 0x12, 0x34, 0x00, 0x00, 0x00, 0x01, 0xde, 0xad, 0xbe, 0xef,
/// ];
///
/// assert_eq!(rtp::rtp_ssrc(&packet).unwrap(), 0xdeadbeef);
/// assert_eq!(rtp::rtp_payload_type(&packet).unwrap(), 96);
/// ```
pub fn rtp_ssrc(packet: &[u8]) -> Result<u32, Error> {
    if packet.len() < RTP_HEADER_LEN {
        return Err(Error::ShortInput);
    }

    Ok(u32::from_be_bytes([
        packet[8], packet[9], packet[10], packet[11],
    ]))
}

/// The payload type of an RTP packet, with the marker bit cleared.
pub fn rtp_payload_type(packet: &[u8]) -> Result<u8, Error> {
    if packet.len() < 2 {
        return Err(Error::ShortInput);
    }

    Ok(packet[1] & 0x7f)
}

/// The sender synchronization source of an RTCP packet.
pub fn rtcp_ssrc(packet: &[u8]) -> Result<u32, Error> {
    if packet.len() < RTCP_HEADER_LEN {
        return Err(Error::ShortInput);
    }

    Ok(u32::from_be_bytes([
        packet[4], packet[5], packet[6], packet[7],
    ]))
}

/// The raw second byte of a packet.
///
/// For RTP this is the marker bit plus payload type; for RTCP it is the
/// packet type, which always has the high bit set (values 200 and up),
/// so a value of 128 or more marks the packet as RTCP.
pub fn packet_type(packet: &[u8]) -> Result<u8, Error> {
    if packet.len() < 2 {
        return Err(Error::ShortInput);
    }

    Ok(packet[1])
}

/// Whether a masked payload type falls in the range RTCP packet types
/// occupy when RTP and RTCP share one flow ([RFC 5761], Section 4).
///
/// # Test
///
/// ```
/// use roq_codec::rtp;
///
/// assert!(!rtp::is_rtcp_payload_type(63));
/// assert!(rtp::is_rtcp_payload_type(64));
/// assert!(rtp::is_rtcp_payload_type(95));
/// assert!(!rtp::is_rtcp_payload_type(96));
/// ```
pub fn is_rtcp_payload_type(payload_type: u8) -> bool {
    let masked = payload_type & 0x7f;
    (64..=95).contains(&masked)
}
