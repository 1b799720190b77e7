//! The sender engine.
//!
//! The muxer consumes RTP and RTCP packets and maps them onto QUIC
//! unidirectional streams or QUIC datagrams. In stream mode every
//! distinct payload type and synchronization source gets its own
//! streams; when a stream is opened its first bytes carry the optional
//! unidirectional stream type and the flow identifier, and every packet
//! on it is length prefixed. The stream boundary policy decides when a
//! stream is finished and a fresh one opened: at frame boundaries
//! (marker flag), at group-of-pictures boundaries (first packet without
//! the delta unit flag) or never, with the packing ratio acting as a
//! multiplier on the first two.
//!
//! A receiver can refuse a stream mid-frame (STOP_SENDING). The muxer
//! then cancels the frame: remaining packets of it are discarded and
//! sending resumes on a new stream at the next frame boundary.

use crate::{MuxError, QuicTransport, SourceKey, TransportError, flow};

use std::sync::Arc;

use ahash::{HashMap, HashMapExt};
use bytes::{Bytes, BytesMut};
use codec::{
    frame::{self, StreamPrefix},
    rtp, varint,
};
use log::{debug, trace, warn};
use parking_lot::Mutex;

/// When the muxer closes one QUIC stream and continues on a new one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum StreamBoundary {
    /// All packets of one frame on a stream, delimited by the marker
    /// flag.
    Frame,
    /// All packets of one group of pictures on a stream, delimited by
    /// packets that decode on their own (no delta unit flag).
    Gop,
    /// Everything on a single stream.
    #[default]
    Single,
}

impl std::fmt::Display for StreamBoundary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Frame => "frame",
            Self::Gop => "gop",
            Self::Single => "single",
        })
    }
}

impl std::str::FromStr for StreamBoundary {
    type Err = MuxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "frame" => Ok(Self::Frame),
            "gop" => Ok(Self::Gop),
            "single" => Ok(Self::Single),
            _ => Err(MuxError::InvalidConfig("unknown stream boundary")),
        }
    }
}

#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MuxOptions {
    /// Flow identifier for RTP; a random unclaimed one when `None`.
    pub rtp_flow_id: Option<u64>,
    /// Flow identifier for RTCP; the RTP identifier plus one when
    /// `None`.
    pub rtcp_flow_id: Option<u64>,
    pub stream_boundary: StreamBoundary,
    /// Frames (or groups of pictures) per stream; at least 1.
    pub stream_packing_ratio: u32,
    /// Value prepended as the first varint of every new stream when
    /// `use_uni_stream_hdr` is set.
    pub uni_stream_type: u64,
    /// Send over QUIC datagrams instead of streams.
    pub use_datagrams: bool,
    pub use_uni_stream_hdr: bool,
}

impl Default for MuxOptions {
    fn default() -> Self {
        Self {
            rtp_flow_id: None,
            rtcp_flow_id: None,
            stream_boundary: StreamBoundary::default(),
            stream_packing_ratio: 1,
            uni_stream_type: 0,
            use_datagrams: false,
            use_uni_stream_hdr: false,
        }
    }
}

/// One RTP packet handed to the muxer by an upstream sink pad.
#[derive(Debug, Clone)]
pub struct RtpPacket {
    pub bytes: Bytes,
    /// Last packet of a frame.
    pub marker: bool,
    /// Needs other frames to decode; absent on IDR packets.
    pub delta_unit: bool,
    /// Synchronization source and payload type as negotiated upstream;
    /// parsed out of `bytes` when absent.
    pub key: Option<SourceKey>,
}

#[derive(Clone)]
struct Settings {
    rtp_flow_id: u64,
    rtcp_flow_id: u64,
    stream_boundary: StreamBoundary,
    stream_packing_ratio: u32,
    uni_stream_type: u64,
    use_datagrams: bool,
    use_uni_stream_hdr: bool,
}

/// Sender state for one (SSRC, payload type) pair.
struct MuxStream<S> {
    output: Option<S>,
    /// Bytes emitted on the current stream, headers included.
    offset: u64,
    /// Frames (or groups of pictures) begun on the current stream.
    counter: u32,
    /// STOP_SENDING was observed; packets are discarded until the next
    /// frame boundary.
    frame_cancelled: bool,
}

impl<S> Default for MuxStream<S> {
    fn default() -> Self {
        Self {
            output: None,
            offset: 0,
            counter: 0,
            frame_cancelled: false,
        }
    }
}

/// Sender state for the RTCP of one synchronization source. RTCP keeps
/// a single dedicated stream regardless of the boundary policy,
/// reopened on demand once the transport closes it.
struct RtcpLane<S> {
    output: Option<S>,
    offset: u64,
}

impl<S> Default for RtcpLane<S> {
    fn default() -> Self {
        Self {
            output: None,
            offset: 0,
        }
    }
}

pub struct Muxer<T>
where
    T: QuicTransport,
{
    transport: T,
    settings: Mutex<Settings>,
    streams: Mutex<HashMap<SourceKey, Arc<Mutex<MuxStream<T::Stream>>>>>,
    rtcp_lanes: Mutex<HashMap<u32, Arc<Mutex<RtcpLane<T::Stream>>>>>,
}

impl<T> Muxer<T>
where
    T: QuicTransport,
{
    /// Create a muxer, claiming its flow identifiers.
    ///
    /// Fails with `InvalidConfig` when datagrams and the unidirectional
    /// stream header are both requested, and with `FlowIdInUse` when a
    /// requested identifier is already claimed by another sender in the
    /// process.
    pub fn new(options: MuxOptions, transport: T) -> Result<Self, MuxError> {
        if options.use_datagrams && options.use_uni_stream_hdr {
            return Err(MuxError::InvalidConfig(
                "use_datagrams and use_uni_stream_hdr are mutually exclusive",
            ));
        }

        if options.stream_packing_ratio < 1 {
            return Err(MuxError::InvalidConfig("stream_packing_ratio must be >= 1"));
        }

        if options.uni_stream_type > varint::MAX {
            return Err(MuxError::InvalidConfig("uni_stream_type exceeds varint range"));
        }

        let (rtp_flow_id, rtcp_flow_id) = claim_flow_ids(&options)?;

        debug!(
            "muxer claimed RTP flow {} and RTCP flow {}",
            rtp_flow_id, rtcp_flow_id
        );

        Ok(Self {
            transport,
            settings: Mutex::new(Settings {
                rtp_flow_id,
                rtcp_flow_id,
                stream_boundary: options.stream_boundary,
                stream_packing_ratio: options.stream_packing_ratio,
                uni_stream_type: options.uni_stream_type,
                use_datagrams: options.use_datagrams,
                use_uni_stream_hdr: options.use_uni_stream_hdr,
            }),
            streams: Mutex::new(HashMap::new()),
            rtcp_lanes: Mutex::new(HashMap::new()),
        })
    }

    pub fn rtp_flow_id(&self) -> u64 {
        self.settings.lock().rtp_flow_id
    }

    pub fn rtcp_flow_id(&self) -> u64 {
        self.settings.lock().rtcp_flow_id
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Replace the RTP flow identifier. Streams already open keep their
    /// identifier; the new one appears on streams opened afterwards.
    pub fn set_rtp_flow_id(&self, flow_id: u64) -> Result<(), MuxError> {
        self.replace_flow_id(flow_id, false)
    }

    /// Replace the RTCP flow identifier, with the same semantics as
    /// `set_rtp_flow_id`.
    pub fn set_rtcp_flow_id(&self, flow_id: u64) -> Result<(), MuxError> {
        self.replace_flow_id(flow_id, true)
    }

    fn replace_flow_id(&self, flow_id: u64, rtcp: bool) -> Result<(), MuxError> {
        if flow_id > varint::MAX {
            return Err(MuxError::InvalidConfig("flow id exceeds varint range"));
        }

        let mut settings = self.settings.lock();
        let (current, other) = if rtcp {
            (settings.rtcp_flow_id, settings.rtp_flow_id)
        } else {
            (settings.rtp_flow_id, settings.rtcp_flow_id)
        };

        if current == flow_id {
            return Ok(());
        }

        // Sharing one identifier between RTP and RTCP (RFC 5761 style)
        // needs no new claim; anything else does.
        if flow_id != other && !flow::claim(flow_id) {
            return Err(MuxError::FlowIdInUse(flow_id));
        }

        if rtcp {
            settings.rtcp_flow_id = flow_id;
        } else {
            settings.rtp_flow_id = flow_id;
        }

        if current != other {
            flow::release(current);
        }

        Ok(())
    }

    pub fn set_stream_boundary(&self, stream_boundary: StreamBoundary) {
        self.settings.lock().stream_boundary = stream_boundary;
    }

    pub fn set_stream_packing_ratio(&self, ratio: u32) -> Result<(), MuxError> {
        if ratio < 1 {
            return Err(MuxError::InvalidConfig("stream_packing_ratio must be >= 1"));
        }

        self.settings.lock().stream_packing_ratio = ratio;
        Ok(())
    }

    pub fn set_uni_stream_type(&self, uni_stream_type: u64) -> Result<(), MuxError> {
        if uni_stream_type > varint::MAX {
            return Err(MuxError::InvalidConfig("uni_stream_type exceeds varint range"));
        }

        self.settings.lock().uni_stream_type = uni_stream_type;
        Ok(())
    }

    /// Send one RTP packet.
    ///
    /// In datagram mode the packet maps to exactly one datagram. In
    /// stream mode it is framed onto the stream of its source, opening
    /// and closing streams as the boundary policy dictates.
    pub fn push_rtp(&self, packet: RtpPacket) -> Result<(), MuxError> {
        let settings = self.settings.lock().clone();

        if settings.use_datagrams {
            return self.emit_datagram(settings.rtp_flow_id, &packet.bytes);
        }

        let key = match packet.key {
            Some(key) => key,
            None => SourceKey {
                ssrc: rtp::rtp_ssrc(&packet.bytes)?,
                payload_type: rtp::rtp_payload_type(&packet.bytes)?,
            },
        };

        let stream = {
            let mut streams = self.streams.lock();
            streams
                .entry(key)
                .or_insert_with(|| {
                    trace!(
                        "new sender state for SSRC {} payload type {}",
                        key.ssrc, key.payload_type
                    );
                    Arc::new(Mutex::new(MuxStream::default()))
                })
                .clone()
        };

        let (output, frame, emitted) = {
            let mut state = stream.lock();

            if state.frame_cancelled {
                if packet.marker {
                    state.frame_cancelled = false;
                } else {
                    debug!(
                        "frame cancelled, dropping packet for SSRC {} payload type {}",
                        key.ssrc, key.payload_type
                    );
                    return Ok(());
                }
            }

            // Group-of-pictures boundary, evaluated before the packet
            // is framed so that it lands on the fresh stream.
            if settings.stream_boundary == StreamBoundary::Gop && !packet.delta_unit {
                state.counter += 1;
                if state.counter > settings.stream_packing_ratio {
                    debug!(
                        "start of GOP beyond packing ratio {}, closing stream",
                        settings.stream_packing_ratio
                    );
                    if let Some(output) = state.output.take() {
                        self.transport.close_stream(output);
                    }
                    state.counter = 0;
                    state.offset = 0;
                }
            }

            if settings.stream_boundary == StreamBoundary::Frame && packet.marker {
                state.counter += 1;
            }

            let output = match state.output.clone() {
                Some(output) => output,
                None => {
                    let output = self.transport.open_stream()?;
                    state.output = Some(output.clone());
                    state.offset = 0;
                    output
                }
            };

            let prefix = (state.offset == 0).then_some(StreamPrefix {
                uni_stream_type: settings
                    .use_uni_stream_hdr
                    .then_some(settings.uni_stream_type),
                flow_id: settings.rtp_flow_id,
            });

            let mut frame = BytesMut::with_capacity(packet.bytes.len() + 16);
            let emitted = frame::encode_stream_frame(prefix.as_ref(), &packet.bytes, &mut frame)?;

            (output, frame.freeze(), emitted as u64)
        };

        // Written with no per-stream lock held; a slow transport must
        // not stall unrelated sources.
        match self.transport.write(&output, frame) {
            Ok(()) => {
                let mut state = stream.lock();
                state.offset += emitted;

                // Frame boundary, evaluated after the packet went out:
                // the marker packet still belongs to the closing stream.
                if settings.stream_boundary == StreamBoundary::Frame
                    && state.counter >= settings.stream_packing_ratio
                {
                    debug!(
                        "end of frame at packing ratio {}, closing stream",
                        settings.stream_packing_ratio
                    );
                    if let Some(output) = state.output.take() {
                        self.transport.close_stream(output);
                    }
                    state.counter = 0;
                    state.offset = 0;
                }

                Ok(())
            }
            Err(TransportError::StreamClosed) => {
                warn!(
                    "stream for SSRC {} payload type {} closed by peer, cancelling frame",
                    key.ssrc, key.payload_type
                );

                let mut state = stream.lock();
                state.frame_cancelled = true;
                state.counter = 0;
                state.offset = 0;
                if let Some(output) = state.output.take() {
                    self.transport.close_stream(output);
                }

                Ok(())
            }
            Err(error) => Err(error.into()),
        }
    }

    /// Send one RTCP packet.
    ///
    /// In stream mode all RTCP of a synchronization source shares one
    /// dedicated stream until the transport closes it, regardless of the
    /// stream boundary policy.
    pub fn push_rtcp(&self, bytes: Bytes) -> Result<(), MuxError> {
        let settings = self.settings.lock().clone();

        if settings.use_datagrams {
            return self.emit_datagram(settings.rtcp_flow_id, &bytes);
        }

        let ssrc = rtp::rtcp_ssrc(&bytes)?;

        let lane = {
            let mut lanes = self.rtcp_lanes.lock();
            lanes
                .entry(ssrc)
                .or_insert_with(|| Arc::new(Mutex::new(RtcpLane::default())))
                .clone()
        };

        let (output, frame, emitted) = {
            let mut state = lane.lock();

            let output = match state.output.clone() {
                Some(output) => output,
                None => {
                    let output = self.transport.open_stream()?;
                    state.output = Some(output.clone());
                    state.offset = 0;
                    output
                }
            };

            let prefix = (state.offset == 0).then_some(StreamPrefix {
                uni_stream_type: settings
                    .use_uni_stream_hdr
                    .then_some(settings.uni_stream_type),
                flow_id: settings.rtcp_flow_id,
            });

            let mut frame = BytesMut::with_capacity(bytes.len() + 16);
            let emitted = frame::encode_stream_frame(prefix.as_ref(), &bytes, &mut frame)?;

            (output, frame.freeze(), emitted as u64)
        };

        match self.transport.write(&output, frame) {
            Ok(()) => {
                lane.lock().offset += emitted;
                Ok(())
            }
            Err(TransportError::StreamClosed) => {
                warn!("RTCP stream for SSRC {} closed by peer", ssrc);

                let mut state = lane.lock();
                state.offset = 0;
                if let Some(output) = state.output.take() {
                    self.transport.close_stream(output);
                }

                Ok(())
            }
            Err(error) => Err(error.into()),
        }
    }

    /// Drop the sender state of one source, closing its open stream.
    pub fn release_source(&self, key: &SourceKey) {
        if let Some(stream) = self.streams.lock().remove(key) {
            if let Some(output) = stream.lock().output.take() {
                self.transport.close_stream(output);
            }
        }
    }

    /// End of stream: finish every open stream, then tell the
    /// transport.
    pub fn eos(&self) {
        let streams: Vec<_> = self.streams.lock().values().cloned().collect();
        for stream in streams {
            if let Some(output) = stream.lock().output.take() {
                self.transport.close_stream(output);
            }
        }

        let lanes: Vec<_> = self.rtcp_lanes.lock().values().cloned().collect();
        for lane in lanes {
            if let Some(output) = lane.lock().output.take() {
                self.transport.close_stream(output);
            }
        }

        self.transport.on_eos();
    }

    fn emit_datagram(&self, flow_id: u64, payload: &[u8]) -> Result<(), MuxError> {
        let mut frame = BytesMut::with_capacity(payload.len() + 8);
        frame::encode_datagram(flow_id, payload, &mut frame)?;

        self.transport
            .send_datagram(frame.freeze())
            .map_err(MuxError::from)
    }
}

impl<T> Drop for Muxer<T>
where
    T: QuicTransport,
{
    fn drop(&mut self) {
        let settings = self.settings.lock();

        flow::release(settings.rtp_flow_id);
        if settings.rtcp_flow_id != settings.rtp_flow_id {
            flow::release(settings.rtcp_flow_id);
        }
    }
}

fn claim_flow_ids(options: &MuxOptions) -> Result<(u64, u64), MuxError> {
    match (options.rtp_flow_id, options.rtcp_flow_id) {
        (None, None) => Ok(flow::allocate_random_pair()),
        (Some(rtp), None) => {
            // The implied RTCP identifier must fit a varint too.
            if rtp >= varint::MAX {
                return Err(MuxError::InvalidConfig("rtp_flow_id exceeds varint range"));
            }

            if !flow::claim(rtp) {
                return Err(MuxError::FlowIdInUse(rtp));
            }

            if !flow::claim(rtp + 1) {
                flow::release(rtp);
                return Err(MuxError::FlowIdInUse(rtp + 1));
            }

            Ok((rtp, rtp + 1))
        }
        (None, Some(rtcp)) => {
            if rtcp > varint::MAX {
                return Err(MuxError::InvalidConfig("rtcp_flow_id exceeds varint range"));
            }

            if !flow::claim(rtcp) {
                return Err(MuxError::FlowIdInUse(rtcp));
            }

            Ok((flow::allocate_random(), rtcp))
        }
        (Some(rtp), Some(rtcp)) => {
            if rtp > varint::MAX || rtcp > varint::MAX {
                return Err(MuxError::InvalidConfig("flow id exceeds varint range"));
            }

            if !flow::claim(rtp) {
                return Err(MuxError::FlowIdInUse(rtp));
            }

            // RTP and RTCP may share one identifier (RFC 5761 style
            // multiplexing); it is claimed once.
            if rtcp != rtp && !flow::claim(rtcp) {
                flow::release(rtp);
                return Err(MuxError::FlowIdInUse(rtcp));
            }

            Ok((rtp, rtcp))
        }
    }
}
