//! ## RTP over QUIC multiplexing engines
//!
//! [RFC 9762]: https://tools.ietf.org/html/rfc9762
//!
//! A pair of protocol engines implementing the RoQ mapping [RFC 9762]:
//! the [`mux::Muxer`] takes RTP and RTCP packets and writes framed byte
//! sequences onto QUIC unidirectional streams or QUIC datagrams, and the
//! [`demux::Demuxer`] takes inbound stream chunks and datagrams,
//! reassembles the length-prefixed packets and routes each one to the
//! output sink registered for its synchronization source and payload
//! type.
//!
//! Neither engine owns a QUIC connection or a media pipeline. The
//! transport is reached through the [`QuicTransport`] trait and the
//! downstream consumers through [`DemuxHandler`] and [`PacketSink`];
//! hosts implement these around whatever stack they run on. All engine
//! operations are synchronous and may be driven from independent
//! transport threads.

pub mod demux;
pub mod flow;
pub mod mux;
pub mod routing;

use std::sync::Arc;

use bytes::Bytes;

pub use crate::routing::SinkCaps;

/// Identifies one RTP source within an engine.
///
/// RoQ sends each distinct payload type and synchronization source on
/// its own set of streams, so all per-stream sender state and all
/// receiver routing state is keyed by this pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceKey {
    pub ssrc: u32,
    pub payload_type: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketKind {
    Rtp,
    Rtcp,
}

#[cfg(feature = "serde")]
impl serde::Serialize for PacketKind {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(match self {
            PacketKind::Rtp => "rtp",
            PacketKind::Rtcp => "rtcp",
        })
    }
}

#[cfg(feature = "serde")]
impl<'de> serde::Deserialize<'de> for PacketKind {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = <String as serde::Deserialize>::deserialize(deserializer)?;
        match s.as_str() {
            "rtp" => Ok(PacketKind::Rtp),
            "rtcp" => Ok(PacketKind::Rtcp),
            _ => Err(serde::de::Error::custom(s)),
        }
    }
}

/// A packet delivered to a downstream output sink.
#[derive(Debug, Clone)]
pub struct Packet {
    pub kind: PacketKind,
    pub bytes: Bytes,
    /// Presentation timestamp in nanoseconds, already adjusted by the
    /// accumulated clock offset of the route it was delivered on.
    pub pts: Option<i64>,
}

/// Out-of-band notifications delivered to a downstream output sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkEvent {
    /// A new logical stream has been bound to this sink.
    StreamStart { name: String },
    /// No more packets will follow.
    Eos,
}

#[derive(Debug)]
pub enum TransportError {
    /// The transport cannot accept more data right now; try again once
    /// flow control credit returns.
    Blocked,
    /// The peer asked the sender to stop (STOP_SENDING) or the stream is
    /// otherwise gone.
    StreamClosed,
    Fatal(String),
}

impl std::error::Error for TransportError {}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// The QUIC transport a [`mux::Muxer`] writes into.
///
/// Stream handles are cheap clonable references (an id, an `Arc`); the
/// engine clones them under its per-stream lock and performs the actual
/// write after the lock is released, so an implementation must tolerate
/// writes racing with `close_stream` on a handle it already gave out.
pub trait QuicTransport: Send + Sync {
    type Stream: Clone + Send;

    /// Open a new unidirectional stream towards the peer.
    fn open_stream(&self) -> Result<Self::Stream, TransportError>;

    /// Append bytes to a stream, preserving call order per stream.
    fn write(&self, stream: &Self::Stream, bytes: Bytes) -> Result<(), TransportError>;

    /// Finish a stream (FIN). Called once per handle.
    fn close_stream(&self, stream: Self::Stream);

    /// Send one datagram.
    fn send_datagram(&self, bytes: Bytes) -> Result<(), TransportError>;

    /// The upstream media session ended; all streams were closed first.
    fn on_eos(&self) {}
}

#[derive(Debug)]
pub enum SinkError {
    /// The sink cannot accept more data right now. The engine drops
    /// nothing silently; the error travels back to the transport caller.
    Blocked,
    Fatal(String),
}

impl std::error::Error for SinkError {}

impl std::fmt::Display for SinkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// A downstream consumer of demultiplexed packets.
pub trait PacketSink: Send + Sync {
    fn push(&self, packet: Packet) -> Result<(), SinkError>;

    /// Deliver an out-of-band event. Returns whether it was handled.
    #[allow(unused_variables)]
    fn event(&self, event: SinkEvent) -> bool {
        true
    }
}

/// The surrounding framework a [`demux::Demuxer`] requests outputs from.
///
/// The demuxer cannot know its downstream consumers until a packet has
/// been inspected, so outputs are created lazily: when a packet arrives
/// for a source no sink is bound to, pre-registered pending sinks are
/// consulted first and this handler is asked only if none match.
pub trait DemuxHandler: Send + Sync {
    type Sink: PacketSink;

    /// Create a new output sink accepting `caps`, or `None` when the
    /// framework cannot host one, in which case the packet is dropped.
    fn request_sink(&self, caps: &SinkCaps) -> Option<Arc<Self::Sink>>;
}

#[derive(Debug)]
pub enum MuxError {
    /// Rejected at setup time; nothing was changed.
    InvalidConfig(&'static str),
    /// The requested flow identifier is claimed by another sender.
    FlowIdInUse(u64),
    /// Backpressure from the transport, forwarded as-is.
    Blocked,
    Fatal(String),
    Codec(codec::Error),
}

impl std::error::Error for MuxError {}

impl std::fmt::Display for MuxError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<codec::Error> for MuxError {
    fn from(value: codec::Error) -> Self {
        Self::Codec(value)
    }
}

impl From<TransportError> for MuxError {
    fn from(value: TransportError) -> Self {
        match value {
            TransportError::Blocked => Self::Blocked,
            TransportError::StreamClosed => Self::Fatal("stream closed by peer".to_string()),
            TransportError::Fatal(reason) => Self::Fatal(reason),
        }
    }
}

#[derive(Debug)]
pub enum DemuxError {
    /// Rejected at setup time; nothing was changed.
    InvalidConfig(&'static str),
    /// The flow identifier matches neither the RTP nor the RTCP flow.
    UnknownFlow(u64),
    /// The unidirectional stream type prefix is not the expected one.
    WrongStreamType { expected: u64, found: u64 },
    /// A chunk arrived for a stream id that was never announced.
    UnknownStream(u64),
    /// Backpressure from a downstream sink, forwarded as-is.
    Blocked,
    Fatal(String),
    Codec(codec::Error),
}

impl std::error::Error for DemuxError {}

impl std::fmt::Display for DemuxError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<codec::Error> for DemuxError {
    fn from(value: codec::Error) -> Self {
        Self::Codec(value)
    }
}

impl From<SinkError> for DemuxError {
    fn from(value: SinkError) -> Self {
        match value {
            SinkError::Blocked => Self::Blocked,
            SinkError::Fatal(reason) => Self::Fatal(reason),
        }
    }
}
