//! The receiver engine.
//!
//! The demuxer consumes inbound QUIC stream chunks and datagrams. For
//! streams it parses the RoQ header off the first bytes, reassembles
//! the length-prefixed packets from arbitrarily chunked stream data and
//! routes each completed packet to the output sink registered for its
//! synchronization source and payload type; datagrams carry one packet
//! each and are routed directly.
//!
//! Nothing about the transport chunking is assumed: a header varint may
//! arrive split across two chunks, one chunk may complete several small
//! packets, and a stream may end early, in which case whatever payload
//! arrived is handed downstream rather than discarded. Outputs are
//! created lazily the first time a source is seen, consulting the
//! pending-sink list before asking the surrounding framework.

use crate::{
    DemuxError, DemuxHandler, Packet, PacketKind, PacketSink, SinkEvent,
    routing::{RoutingTable, SinkCaps},
};

use std::{collections::hash_map::Entry, sync::Arc};

use ahash::{HashMap, HashMapExt};
use bytes::{Bytes, BytesMut};
use codec::{Error as CodecError, frame::Datagram, rtp, varint};
use log::{debug, trace, warn};
use parking_lot::Mutex;

#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DemuxOptions {
    /// Accepted RTP flow; learned from the first observed frame when
    /// `None`.
    pub rtp_flow_id: Option<u64>,
    /// Accepted RTCP flow; the RTP flow plus one when `None`.
    pub rtcp_flow_id: Option<u64>,
    /// Expected unidirectional stream type value.
    pub uni_stream_type: u64,
    /// Require every new stream to start with `uni_stream_type`.
    pub match_uni_stream_type: bool,
}

impl Default for DemuxOptions {
    fn default() -> Self {
        Self {
            rtp_flow_id: None,
            rtcp_flow_id: None,
            uni_stream_type: 0,
            match_uni_stream_type: false,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Flows {
    rtp: Option<u64>,
    rtcp: Option<u64>,
}

/// The output a stream's packets go to, resolved on the first completed
/// packet (or already at stream admission when the peek allowed it).
struct Bound<S> {
    sink: Arc<S>,
    kind: PacketKind,
    clock_offset: i64,
}

/// Reassembly state of one inbound QUIC stream.
struct StreamState<S> {
    bound: Option<Bound<S>>,
    /// Flow identifier from the stream header.
    flow_id: Option<u64>,
    /// Length of the packet being assembled; `None` while a header or
    /// length varint is still incomplete.
    expected_len: Option<u64>,
    /// Raw bytes not consumed yet: split varints, packet boundaries.
    pending: BytesMut,
    /// Payload accumulated toward `expected_len`. Never grows past it.
    assembly: BytesMut,
    /// The uni stream type and flow id varints are still to be read.
    at_stream_start: bool,
}

impl<S> StreamState<S> {
    fn new() -> Self {
        Self {
            bound: None,
            flow_id: None,
            expected_len: None,
            pending: BytesMut::new(),
            assembly: BytesMut::new(),
            at_stream_start: true,
        }
    }
}

struct DemuxState<S> {
    flows: Flows,
    streams: HashMap<u64, StreamState<S>>,
    routes: RoutingTable<S>,
}

pub struct Demuxer<H>
where
    H: DemuxHandler,
{
    handler: H,
    uni_stream_type: u64,
    match_uni_stream_type: bool,
    state: Mutex<DemuxState<H::Sink>>,
}

impl<H> Demuxer<H>
where
    H: DemuxHandler,
{
    pub fn new(options: DemuxOptions, handler: H) -> Result<Self, DemuxError> {
        if let Some(flow_id) = options.rtp_flow_id {
            if flow_id > varint::MAX
                // The implied RTCP identifier must fit a varint too.
                || (flow_id == varint::MAX && options.rtcp_flow_id.is_none())
            {
                return Err(DemuxError::InvalidConfig("rtp_flow_id exceeds varint range"));
            }
        }

        if let Some(flow_id) = options.rtcp_flow_id {
            if flow_id > varint::MAX {
                return Err(DemuxError::InvalidConfig(
                    "rtcp_flow_id exceeds varint range",
                ));
            }
        }

        if options.uni_stream_type > varint::MAX {
            return Err(DemuxError::InvalidConfig("uni_stream_type exceeds varint range"));
        }

        let rtcp = match (options.rtp_flow_id, options.rtcp_flow_id) {
            (Some(rtp), None) => Some(rtp + 1),
            _ => options.rtcp_flow_id,
        };

        Ok(Self {
            handler,
            uni_stream_type: options.uni_stream_type,
            match_uni_stream_type: options.match_uni_stream_type,
            state: Mutex::new(DemuxState {
                flows: Flows {
                    rtp: options.rtp_flow_id,
                    rtcp,
                },
                streams: HashMap::new(),
                routes: RoutingTable::new(),
            }),
        })
    }

    pub fn rtp_flow_id(&self) -> Option<u64> {
        self.state.lock().flows.rtp
    }

    pub fn rtcp_flow_id(&self) -> Option<u64> {
        self.state.lock().flows.rtcp
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// Queue a pre-allocated downstream sink. It will be bound to the
    /// first newly observed source whose caps intersect `caps`, ahead
    /// of asking the handler for a fresh output.
    pub fn register_pending_sink(&self, caps: SinkCaps, sink: Arc<H::Sink>) {
        self.state.lock().routes.register_pending(caps, sink);
    }

    /// Admit a newly announced unidirectional stream.
    ///
    /// `peek` previews the bytes that will also arrive as chunk data.
    /// The header is validated as far as the peek reaches, and the
    /// output routed already when it contains enough of the first
    /// packet; a short peek just defers all of that to the chunks.
    pub fn on_stream_open(&self, stream_id: u64, peek: &[u8]) -> Result<(), DemuxError> {
        let mut state = self.state.lock();
        let DemuxState {
            flows,
            streams,
            routes,
        } = &mut *state;

        if streams.contains_key(&stream_id) {
            warn!("stream {} announced twice", stream_id);
            return Ok(());
        }

        let mut stream = StreamState::new();
        let mut consumed = 0;

        'peek: {
            if self.match_uni_stream_type {
                let (found, len) = match varint::decode(peek) {
                    Ok(decoded) => decoded,
                    Err(CodecError::ShortInput) => break 'peek,
                    Err(error) => return Err(error.into()),
                };

                if found != self.uni_stream_type {
                    warn!(
                        "stream {}: uni stream type {} does not match expected {}, refusing",
                        stream_id, found, self.uni_stream_type
                    );
                    return Err(DemuxError::WrongStreamType {
                        expected: self.uni_stream_type,
                        found,
                    });
                }

                consumed += len;
            }

            let (flow_id, len) = match varint::decode(&peek[consumed..]) {
                Ok(decoded) => decoded,
                Err(CodecError::ShortInput) => break 'peek,
                Err(error) => return Err(error.into()),
            };
            consumed += len;

            if let Err(error) = verify_flow(flows, flow_id) {
                warn!(
                    "stream {}: flow {} matches neither the RTP nor the RTCP flow, refusing",
                    stream_id, flow_id
                );
                return Err(error);
            }

            // Bind the output right away when the peek reaches into the
            // first packet far enough to tell SSRC and payload type.
            let (_, len) = match varint::decode(&peek[consumed..]) {
                Ok(decoded) => decoded,
                Err(CodecError::ShortInput) => break 'peek,
                Err(error) => return Err(error.into()),
            };
            consumed += len;

            let payload = &peek[consumed..];
            if let Ok(packet_type) = rtp::packet_type(payload) {
                learn(flows, flow_id, packet_type);
                let kind = classify(flows, flow_id, packet_type)?;
                stream.bound = bind(routes, &self.handler, kind, flow_id, payload);
            }
        }

        trace!("new reassembly state for stream {}", stream_id);
        streams.insert(stream_id, stream);

        Ok(())
    }

    /// Feed one chunk of ordered stream data.
    ///
    /// `offset` is the chunk's byte offset within the stream and
    /// `final_bit` marks the last chunk. Completed packets are pushed
    /// downstream before this returns; `pts` (nanoseconds) is applied
    /// to each of them, adjusted by the route's clock offset.
    pub fn on_stream_chunk(
        &self,
        stream_id: u64,
        chunk: &[u8],
        final_bit: bool,
        offset: u64,
        pts: Option<i64>,
    ) -> Result<(), DemuxError> {
        let mut deliveries = Vec::new();

        let result = {
            let mut state = self.state.lock();
            let DemuxState {
                flows,
                streams,
                routes,
            } = &mut *state;

            let stream = match streams.entry(stream_id) {
                Entry::Occupied(entry) => entry.into_mut(),
                Entry::Vacant(entry) if offset == 0 => {
                    trace!("new reassembly state for stream {}", stream_id);
                    entry.insert(StreamState::new())
                }
                Entry::Vacant(_) => return Err(DemuxError::UnknownStream(stream_id)),
            };

            // Zero-length chunks with the final bit are common when the
            // remote end could not set the bit on its last data block.
            let result = if chunk.is_empty() && final_bit && stream.assembly.is_empty() {
                Ok(())
            } else {
                self.process_stream_data(stream_id, stream, flows, routes, chunk, final_bit, pts, &mut deliveries)
            };

            if final_bit || result.is_err() {
                streams.remove(&stream_id);
            }

            result
        };

        for (sink, packet) in deliveries {
            sink.push(packet)?;
        }

        result
    }

    /// Feed one received datagram: a flow identifier varint followed by
    /// exactly one packet.
    pub fn on_datagram(&self, bytes: &[u8], pts: Option<i64>) -> Result<(), DemuxError> {
        let datagram = Datagram::decode(bytes)?;

        let packet_type = match rtp::packet_type(datagram.payload) {
            Ok(packet_type) => packet_type,
            Err(_) => {
                warn!(
                    "datagram on flow {} too short to route, dropping",
                    datagram.flow_id
                );
                return Err(CodecError::MalformedFrame.into());
            }
        };

        let delivery = {
            let mut state = self.state.lock();
            let DemuxState { flows, routes, .. } = &mut *state;

            learn(flows, datagram.flow_id, packet_type);

            let kind = match classify(flows, datagram.flow_id, packet_type) {
                Ok(kind) => kind,
                Err(error) => {
                    warn!("datagram on unknown flow {}, dropping", datagram.flow_id);
                    return Err(error);
                }
            };

            bind(routes, &self.handler, kind, datagram.flow_id, datagram.payload)
        };

        let Some(bound) = delivery else {
            return Ok(());
        };

        bound
            .sink
            .push(Packet {
                kind: bound.kind,
                bytes: Bytes::copy_from_slice(datagram.payload),
                pts: pts.map(|pts| pts + bound.clock_offset),
            })
            .map_err(DemuxError::from)
    }

    /// The stream is gone (reset or torn down); drop its reassembly
    /// state. Already done implicitly when the final bit was seen.
    pub fn on_stream_closed(&self, stream_id: u64) {
        self.state.lock().streams.remove(&stream_id);
    }

    /// Fold a QoS jitter diff into the clock offset of one RTP route,
    /// returning the new accumulated offset. Streams already bound keep
    /// the offset they were routed with.
    pub fn adjust_clock_offset(&self, ssrc: u32, payload_type: u8, diff: i64) -> Option<i64> {
        self.state
            .lock()
            .routes
            .adjust_clock_offset(ssrc, payload_type, diff)
    }

    /// Release the RTP output of one source, dropping its table entry.
    pub fn release_rtp_output(&self, ssrc: u32, payload_type: u8) -> bool {
        self.state
            .lock()
            .routes
            .release_rtp(ssrc, payload_type)
            .is_some()
    }

    /// Release the RTCP output of one source.
    pub fn release_rtcp_output(&self, ssrc: u32) -> bool {
        self.state.lock().routes.release_rtcp(ssrc).is_some()
    }

    /// End of stream: notify every bound output sink.
    pub fn eos(&self) {
        let sinks = self.state.lock().routes.sinks();

        for sink in sinks {
            sink.event(SinkEvent::Eos);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn process_stream_data(
        &self,
        stream_id: u64,
        stream: &mut StreamState<H::Sink>,
        flows: &mut Flows,
        routes: &mut RoutingTable<H::Sink>,
        chunk: &[u8],
        final_bit: bool,
        pts: Option<i64>,
        deliveries: &mut Vec<(Arc<H::Sink>, Packet)>,
    ) -> Result<(), DemuxError> {
        stream.pending.extend_from_slice(chunk);

        loop {
            if stream.at_stream_start {
                let mut consumed = 0;

                if self.match_uni_stream_type {
                    let (found, len) = match varint::decode(&stream.pending[consumed..]) {
                        Ok(decoded) => decoded,
                        Err(CodecError::ShortInput) => break,
                        Err(error) => return Err(error.into()),
                    };

                    if found != self.uni_stream_type {
                        warn!(
                            "stream {}: uni stream type {} does not match expected {}",
                            stream_id, found, self.uni_stream_type
                        );
                        return Err(DemuxError::WrongStreamType {
                            expected: self.uni_stream_type,
                            found,
                        });
                    }

                    consumed += len;
                }

                let (flow_id, len) = match varint::decode(&stream.pending[consumed..]) {
                    Ok(decoded) => decoded,
                    Err(CodecError::ShortInput) => break,
                    Err(error) => return Err(error.into()),
                };
                consumed += len;

                if let Err(error) = verify_flow(flows, flow_id) {
                    warn!(
                        "stream {}: flow {} matches neither the RTP nor the RTCP flow",
                        stream_id, flow_id
                    );
                    return Err(error);
                }

                trace!("stream {} carries flow {}", stream_id, flow_id);

                stream.flow_id = Some(flow_id);
                stream.at_stream_start = false;
                let _ = stream.pending.split_to(consumed);
            }

            let expected = match stream.expected_len {
                Some(expected) => expected,
                None => match varint::decode(&stream.pending[..]) {
                    Ok((expected, consumed)) => {
                        trace!(
                            "stream {}: next packet announces {} bytes",
                            stream_id, expected
                        );
                        stream.expected_len = Some(expected);
                        let _ = stream.pending.split_to(consumed);
                        expected
                    }
                    Err(CodecError::ShortInput) => break,
                    Err(error) => return Err(error.into()),
                },
            };

            // Move payload over, never growing the assembly buffer past
            // the announced length: trailing bytes belong to the next
            // length-prefixed packet.
            let missing = expected.saturating_sub(stream.assembly.len() as u64);
            let take = missing.min(stream.pending.len() as u64) as usize;
            let taken = stream.pending.split_to(take);
            stream.assembly.unsplit(taken);

            if (stream.assembly.len() as u64) < expected {
                break;
            }

            let bytes = stream.assembly.split().freeze();
            stream.expected_len = None;

            self.queue_packet(stream_id, stream, flows, routes, bytes, pts, deliveries)?;

            if stream.pending.is_empty() {
                break;
            }
        }

        if final_bit {
            // The remote end may finish a stream before the announced
            // payload length is reached, e.g. to meet a delivery
            // deadline. Hand downstream what actually arrived.
            if stream.expected_len.take().is_some() && !stream.assembly.is_empty() {
                debug!(
                    "stream {} ended early, emitting {} received bytes",
                    stream_id,
                    stream.assembly.len()
                );

                let bytes = stream.assembly.split().freeze();
                self.queue_packet(stream_id, stream, flows, routes, bytes, pts, deliveries)?;
            }

            if !stream.pending.is_empty() {
                warn!(
                    "stream {}: discarding {} trailing bytes at end of stream",
                    stream_id,
                    stream.pending.len()
                );
            }
        }

        Ok(())
    }

    /// Resolve the output of a completed packet and queue it for
    /// delivery. Unroutable packets are dropped here; only an unknown
    /// flow rejects the stream.
    #[allow(clippy::too_many_arguments)]
    fn queue_packet(
        &self,
        stream_id: u64,
        stream: &mut StreamState<H::Sink>,
        flows: &mut Flows,
        routes: &mut RoutingTable<H::Sink>,
        bytes: Bytes,
        pts: Option<i64>,
        deliveries: &mut Vec<(Arc<H::Sink>, Packet)>,
    ) -> Result<(), DemuxError> {
        if stream.bound.is_none() {
            let Some(flow_id) = stream.flow_id else {
                return Ok(());
            };

            let packet_type = match rtp::packet_type(&bytes) {
                Ok(packet_type) => packet_type,
                Err(_) => {
                    warn!(
                        "stream {}: {} byte packet too short to route, dropping",
                        stream_id,
                        bytes.len()
                    );
                    return Ok(());
                }
            };

            learn(flows, flow_id, packet_type);
            let kind = classify(flows, flow_id, packet_type)?;

            stream.bound = bind(routes, &self.handler, kind, flow_id, &bytes);
        }

        let Some(bound) = &stream.bound else {
            return Ok(());
        };

        deliveries.push((
            bound.sink.clone(),
            Packet {
                kind: bound.kind,
                pts: pts.map(|pts| pts + bound.clock_offset),
                bytes,
            },
        ));

        Ok(())
    }
}

/// Route one packet, returning the binding or `None` when the packet
/// cannot be routed (malformed or refused downstream).
fn bind<H>(
    routes: &mut RoutingTable<H::Sink>,
    handler: &H,
    kind: PacketKind,
    flow_id: u64,
    payload: &[u8],
) -> Option<Bound<H::Sink>>
where
    H: DemuxHandler,
{
    match kind {
        PacketKind::Rtp => {
            let ssrc = match rtp::rtp_ssrc(payload) {
                Ok(ssrc) => ssrc,
                Err(_) => {
                    warn!("RTP packet on flow {} too short for an SSRC", flow_id);
                    return None;
                }
            };

            let payload_type = rtp::rtp_payload_type(payload).ok()?;
            let (sink, clock_offset) = routes.rtp_route(handler, flow_id, ssrc, payload_type)?;

            Some(Bound {
                sink,
                kind,
                clock_offset,
            })
        }
        PacketKind::Rtcp => {
            let ssrc = match rtp::rtcp_ssrc(payload) {
                Ok(ssrc) => ssrc,
                Err(_) => {
                    warn!("RTCP packet on flow {} too short for an SSRC", flow_id);
                    return None;
                }
            };

            let sink = routes.rtcp_route(handler, flow_id, ssrc)?;

            Some(Bound {
                sink,
                kind,
                // RTCP routes carry no QoS clock offsets.
                clock_offset: 0,
            })
        }
    }
}

/// Accept or reject a flow identifier as far as the current
/// configuration can tell. With no RTP flow configured yet everything
/// is accepted and `learn` decides later.
fn verify_flow(flows: &Flows, flow_id: u64) -> Result<(), DemuxError> {
    let Some(rtp_flow) = flows.rtp else {
        return Ok(());
    };

    if flow_id == rtp_flow
        || flows.rtcp == Some(flow_id)
        || (flows.rtcp.is_none() && flow_id == rtp_flow + 1)
    {
        return Ok(());
    }

    Err(DemuxError::UnknownFlow(flow_id))
}

/// Auto-learn the flow pair from the first observed frame. A packet
/// type of 128 or above marks the frame as RTCP, so the RTP flow is one
/// below the observed one.
fn learn(flows: &mut Flows, flow_id: u64, packet_type: u8) {
    if flows.rtp.is_some() {
        return;
    }

    let rtp_flow = if packet_type >= 128 {
        flow_id.saturating_sub(1)
    } else {
        flow_id
    };

    flows.rtp = Some(rtp_flow);
    if flows.rtcp.is_none() {
        flows.rtcp = Some(rtp_flow + 1);
    }

    debug!(
        "learned RTP flow {} and RTCP flow {} from first frame",
        rtp_flow,
        flows.rtcp.unwrap_or(rtp_flow + 1)
    );
}

/// Tell RTP from RTCP for a verified flow identifier.
fn classify(flows: &Flows, flow_id: u64, packet_type: u8) -> Result<PacketKind, DemuxError> {
    let Flows {
        rtp: rtp_flow,
        rtcp: rtcp_flow,
    } = *flows;

    // One shared identifier for both directions: discriminate by the
    // payload type range RTCP occupies under RFC 5761.
    if rtp_flow.is_some() && rtp_flow == rtcp_flow {
        if rtp_flow == Some(flow_id) {
            return Ok(if rtp::is_rtcp_payload_type(packet_type) {
                PacketKind::Rtcp
            } else {
                PacketKind::Rtp
            });
        }

        return Err(DemuxError::UnknownFlow(flow_id));
    }

    if rtp_flow == Some(flow_id) {
        return Ok(PacketKind::Rtp);
    }

    if rtcp_flow == Some(flow_id)
        || (rtcp_flow.is_none() && rtp_flow.map(|flow| flow + 1) == Some(flow_id))
    {
        return Ok(PacketKind::Rtcp);
    }

    Err(DemuxError::UnknownFlow(flow_id))
}
