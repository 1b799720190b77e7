//! Output routing for the receiver.
//!
//! Two associative tables map demultiplexed packets to their downstream
//! sinks: RTP outputs are keyed by synchronization source and payload
//! type, RTCP outputs by synchronization source alone (one RTCP sink
//! receives every RTCP packet type for its source). Outputs are created
//! lazily when the first packet for a source arrives; a FIFO list of
//! pre-registered pending sinks is consulted before the surrounding
//! framework is asked for a fresh one.

use crate::{DemuxHandler, PacketKind, PacketSink, SinkEvent};

use std::sync::Arc;

use ahash::{HashMap, HashMapExt};
use log::{debug, error};

/// Constraints a downstream sink places on the packets it accepts.
///
/// `None` fields are wildcards, so two descriptors intersect when every
/// field both sides constrain agrees.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SinkCaps {
    pub kind: PacketKind,
    pub ssrc: Option<u32>,
    pub payload_type: Option<u8>,
}

impl SinkCaps {
    pub fn rtp(ssrc: Option<u32>, payload_type: Option<u8>) -> Self {
        Self {
            kind: PacketKind::Rtp,
            ssrc,
            payload_type,
        }
    }

    pub fn rtcp(ssrc: Option<u32>) -> Self {
        Self {
            kind: PacketKind::Rtcp,
            ssrc,
            payload_type: None,
        }
    }

    /// Whether the two descriptors accept a common packet.
    ///
    /// # Test
    ///
    /// ```
    /// use roq::SinkCaps;
    ///
    /// let any_rtp = SinkCaps::rtp(None, None);
    /// let vp8 = SinkCaps::rtp(Some(0xdeadbeef), Some(96));
    ///
    /// assert!(any_rtp.intersects(&vp8));
    /// assert!(!SinkCaps::rtp(None, Some(97)).intersects(&vp8));
    /// assert!(!SinkCaps::rtcp(None).intersects(&vp8));
    /// ```
    pub fn intersects(&self, other: &SinkCaps) -> bool {
        fn compatible<T: Eq>(a: Option<T>, b: Option<T>) -> bool {
            match (a, b) {
                (Some(a), Some(b)) => a == b,
                _ => true,
            }
        }

        self.kind == other.kind
            && compatible(self.ssrc, other.ssrc)
            && compatible(self.payload_type, other.payload_type)
    }
}

pub(crate) struct RouteEntry<S> {
    pub sink: Arc<S>,
    /// Accumulated QoS-derived timestamp adjustment, nanoseconds.
    pub clock_offset: i64,
}

struct PendingSink<S> {
    caps: SinkCaps,
    sink: Arc<S>,
}

pub(crate) struct RoutingTable<S> {
    rtp: HashMap<u32, HashMap<u8, RouteEntry<S>>>,
    rtcp: HashMap<u32, RouteEntry<S>>,
    pending: Vec<PendingSink<S>>,
}

impl<S> RoutingTable<S>
where
    S: PacketSink,
{
    pub fn new() -> Self {
        Self {
            rtp: HashMap::new(),
            rtcp: HashMap::new(),
            pending: Vec::new(),
        }
    }

    /// Queue a pre-allocated sink for assignment to a future source.
    pub fn register_pending(&mut self, caps: SinkCaps, sink: Arc<S>) {
        self.pending.push(PendingSink { caps, sink });
    }

    /// First pending sink whose accepted caps intersect, removed on
    /// success.
    fn match_pending(&mut self, caps: &SinkCaps) -> Option<Arc<S>> {
        let index = self
            .pending
            .iter()
            .position(|pending| pending.caps.intersects(caps))?;

        Some(self.pending.remove(index).sink)
    }

    /// The RTP output for a source, created on first use.
    ///
    /// Returns the sink together with the accumulated clock offset of
    /// its route, or `None` when no pending sink matches and the
    /// framework refuses to create one.
    pub fn rtp_route<H>(
        &mut self,
        handler: &H,
        flow_id: u64,
        ssrc: u32,
        payload_type: u8,
    ) -> Option<(Arc<S>, i64)>
    where
        H: DemuxHandler<Sink = S>,
    {
        let payload_type = payload_type & 0x7f;

        if let Some(entry) = self
            .rtp
            .get(&ssrc)
            .and_then(|sources| sources.get(&payload_type))
        {
            return Some((entry.sink.clone(), entry.clock_offset));
        }

        let caps = SinkCaps::rtp(Some(ssrc), Some(payload_type));
        let sink = match self.match_pending(&caps) {
            Some(sink) => sink,
            None => match handler.request_sink(&caps) {
                Some(sink) => sink,
                None => {
                    error!(
                        "no output for RTP flow {} SSRC {} payload type {}",
                        flow_id, ssrc, payload_type
                    );
                    return None;
                }
            },
        };

        debug!(
            "new RTP output for flow {}, SSRC {}, payload type {}",
            flow_id, ssrc, payload_type
        );

        sink.event(SinkEvent::StreamStart {
            name: format!("rtp_src_{}_{}_{}", flow_id, ssrc, payload_type),
        });

        self.rtp.entry(ssrc).or_insert_with(HashMap::new).insert(
            payload_type,
            RouteEntry {
                sink: sink.clone(),
                clock_offset: 0,
            },
        );

        Some((sink, 0))
    }

    /// The RTCP output for a source, created on first use.
    pub fn rtcp_route<H>(&mut self, handler: &H, flow_id: u64, ssrc: u32) -> Option<Arc<S>>
    where
        H: DemuxHandler<Sink = S>,
    {
        if let Some(entry) = self.rtcp.get(&ssrc) {
            return Some(entry.sink.clone());
        }

        let caps = SinkCaps::rtcp(Some(ssrc));
        let sink = match self.match_pending(&caps) {
            Some(sink) => sink,
            None => match handler.request_sink(&caps) {
                Some(sink) => sink,
                None => {
                    error!("no output for RTCP flow {} SSRC {}", flow_id, ssrc);
                    return None;
                }
            },
        };

        debug!("new RTCP output for flow {}, SSRC {}", flow_id, ssrc);

        sink.event(SinkEvent::StreamStart {
            name: format!("rtcp_src_{}_{}", flow_id, ssrc),
        });

        self.rtcp.insert(
            ssrc,
            RouteEntry {
                sink: sink.clone(),
                clock_offset: 0,
            },
        );

        Some(sink)
    }

    /// Fold a QoS jitter diff into a route's clock offset, returning
    /// the new accumulated offset.
    pub fn adjust_clock_offset(&mut self, ssrc: u32, payload_type: u8, diff: i64) -> Option<i64> {
        let entry = self.rtp.get_mut(&ssrc)?.get_mut(&(payload_type & 0x7f))?;
        entry.clock_offset += diff;

        Some(entry.clock_offset)
    }

    pub fn release_rtp(&mut self, ssrc: u32, payload_type: u8) -> Option<Arc<S>> {
        let sources = self.rtp.get_mut(&ssrc)?;
        let entry = sources.remove(&(payload_type & 0x7f))?;

        if sources.is_empty() {
            self.rtp.remove(&ssrc);
        }

        Some(entry.sink)
    }

    pub fn release_rtcp(&mut self, ssrc: u32) -> Option<Arc<S>> {
        self.rtcp.remove(&ssrc).map(|entry| entry.sink)
    }

    /// Every bound sink, for event propagation.
    pub fn sinks(&self) -> Vec<Arc<S>> {
        self.rtp
            .values()
            .flat_map(|sources| sources.values())
            .chain(self.rtcp.values())
            .map(|entry| entry.sink.clone())
            .collect()
    }
}
