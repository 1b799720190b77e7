use crate::{Error, varint};

use bytes::{BufMut, BytesMut};

/// Header written once at the start of every RoQ unidirectional stream.
///
/// A deployment may reserve a unidirectional stream type value so that a
/// receiver can tell RoQ streams apart from other protocols multiplexed
/// on the same connection; when present it precedes the flow identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamPrefix {
    pub uni_stream_type: Option<u64>,
    pub flow_id: u64,
}

impl StreamPrefix {
    /// Append the encoded prefix, returning its length.
    pub fn encode(&self, out: &mut BytesMut) -> Result<usize, Error> {
        let mut len = 0;

        if let Some(uni_stream_type) = self.uni_stream_type {
            len += varint::encode(uni_stream_type, out)?;
        }

        len += varint::encode(self.flow_id, out)?;
        Ok(len)
    }
}

/// Append one length-prefixed packet, preceded by the stream prefix when
/// this is the first frame of the stream. Returns the number of bytes
/// appended.
///
/// # Test
///
/// ```
/// use bytes::BytesMut;
/// use roq_codec::frame::{self, StreamPrefix};
///
/// let prefix = StreamPrefix {
///     uni_stream_type: Some(0x40),
///     flow_id: 5,
/// };
///
/// let mut buf = BytesMut::new();
/// frame::encode_stream_frame(Some(&prefix), b"rtp", &mut buf).unwrap();
/// frame::encode_stream_frame(None, b"rtp", &mut buf).unwrap();
///
/// // [uni type][flow id][len]rtp[len]rtp
/// assert_eq!(
///     buf.as_ref(),
///     &[0x40, 0x40, 0x05, 0x03, b'r', b't', b'p', 0x03, b'r', b't', b'p']
/// );
/// ```
pub fn encode_stream_frame(
    prefix: Option<&StreamPrefix>,
    payload: &[u8],
    out: &mut BytesMut,
) -> Result<usize, Error> {
    let mut len = 0;

    if let Some(prefix) = prefix {
        len += prefix.encode(out)?;
    }

    len += varint::encode(payload.len() as u64, out)?;
    out.put_slice(payload);

    Ok(len + payload.len())
}

/// Append one datagram frame: the flow identifier followed by exactly
/// one packet, no length prefix. Returns the number of bytes appended.
pub fn encode_datagram(flow_id: u64, payload: &[u8], out: &mut BytesMut) -> Result<usize, Error> {
    let len = varint::encode(flow_id, out)?;
    out.put_slice(payload);

    Ok(len + payload.len())
}

/// A decoded datagram frame, borrowing the packet bytes.
///
/// # Test
///
/// ```
/// use roq_codec::frame::Datagram;
///
/// let datagram = Datagram::decode(&[0x2a, 0x80, 0x60, 0x00, 0x01]).unwrap();
///
/// assert_eq!(datagram.flow_id, 42);
/// assert_eq!(datagram.payload, &[0x80, 0x60, 0x00, 0x01]);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Datagram<'a> {
    pub flow_id: u64,
    pub payload: &'a [u8],
}

impl<'a> Datagram<'a> {
    pub fn decode(bytes: &'a [u8]) -> Result<Self, Error> {
        let (flow_id, len) = varint::decode(bytes)?;

        Ok(Self {
            flow_id,
            payload: &bytes[len..],
        })
    }
}
