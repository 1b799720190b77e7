//! ## RTP over QUIC (RoQ) wire format
//!
//! [RFC 9762]: https://tools.ietf.org/html/rfc9762
//! [RFC 9000]: https://tools.ietf.org/html/rfc9000
//! [RFC 3550]: https://tools.ietf.org/html/rfc3550
//!
//! RoQ [RFC 9762] maps RTP and RTCP packets [RFC 3550] onto a QUIC
//! connection. Packets belonging to one flow are associated with a flow
//! identifier, a QUIC variable-length integer ([RFC 9000], Section 16).
//! When QUIC streams carry the flow, the flow identifier is sent once at
//! the start of each stream and every packet on the stream is prefixed
//! with its length; when QUIC datagrams carry the flow, each datagram
//! holds the flow identifier followed by exactly one packet and no
//! length prefix, as the datagram boundary already delimits the packet.
//!
//! This crate contains the pure wire-format pieces of that mapping: the
//! variable-length integer codec, the stream and datagram frame headers,
//! and the few fixed-offset reads into RTP/RTCP packets that routing
//! requires. It holds no connection state.

pub mod frame;
pub mod rtp;
pub mod varint;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The value does not fit in a variable-length integer.
    ValueTooLarge,
    /// The buffer ends before the encoded item does.
    ShortInput,
    /// The bytes decode, but not to anything the wire format allows.
    MalformedFrame,
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}
