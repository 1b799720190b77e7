use crate::Error;

use bytes::{BufMut, BytesMut};

/// The largest value representable as a variable-length integer.
///
/// The encoding reserves the two most significant bits of the first byte
/// for the length tag, leaving 62 bits of usable value space.
pub const MAX: u64 = (1 << 62) - 1;

const MAX_1: u64 = 1 << 6;
const MAX_2: u64 = 1 << 14;
const MAX_4: u64 = 1 << 30;

/// Number of bytes `encode` will use for a value, without encoding it.
///
/// # Test
///
/// ```
/// use roq_codec::varint;
///
/// assert_eq!(varint::size(0).unwrap(), 1);
/// assert_eq!(varint::size(63).unwrap(), 1);
/// assert_eq!(varint::size(64).unwrap(), 2);
/// assert_eq!(varint::size(16383).unwrap(), 2);
/// assert_eq!(varint::size(16384).unwrap(), 4);
/// assert_eq!(varint::size((1 << 30) - 1).unwrap(), 4);
/// assert_eq!(varint::size(1 << 30).unwrap(), 8);
/// assert_eq!(varint::size(varint::MAX).unwrap(), 8);
/// assert!(varint::size(varint::MAX + 1).is_err());
/// ```
pub fn size(value: u64) -> Result<usize, Error> {
    if value < MAX_1 {
        Ok(1)
    } else if value < MAX_2 {
        Ok(2)
    } else if value < MAX_4 {
        Ok(4)
    } else if value <= MAX {
        Ok(8)
    } else {
        Err(Error::ValueTooLarge)
    }
}

/// Append the minimal encoding of a value, returning the encoded length.
///
/// The length tag occupies the two most significant bits of the first
/// byte (`0b00`/`0b01`/`0b10`/`0b11` for 1/2/4/8 bytes); the remaining
/// bits hold the value big-endian.
///
/// # Test
///
/// ```
/// use bytes::BytesMut;
/// use roq_codec::varint;
///
/// let mut buf = BytesMut::new();
///
/// assert_eq!(varint::encode(42, &mut buf).unwrap(), 1);
/// assert_eq!(varint::encode(1200, &mut buf).unwrap(), 2);
/// assert_eq!(buf.as_ref(), &[0x2a, 0x44, 0xb0]);
/// ```
pub fn encode(value: u64, out: &mut BytesMut) -> Result<usize, Error> {
    let len = size(value)?;

    match len {
        1 => out.put_u8(value as u8),
        2 => out.put_u16(value as u16 | 0x4000),
        4 => out.put_u32(value as u32 | 0x8000_0000),
        _ => out.put_u64(value | 0xc000_0000_0000_0000),
    }

    Ok(len)
}

/// Decode a variable-length integer from the front of a buffer.
///
/// Returns the value and the number of bytes it occupied. Any of the
/// four forms is accepted, including non-minimal ones.
///
/// # Test
///
/// ```
/// use roq_codec::{Error, varint};
///
/// assert_eq!(varint::decode(&[0x2a]).unwrap(), (42, 1));
/// assert_eq!(varint::decode(&[0x44, 0xb0]).unwrap(), (1200, 2));
///
/// // Non-minimal two-byte rendering of 42.
/// assert_eq!(varint::decode(&[0x40, 0x2a]).unwrap(), (42, 2));
///
/// assert_eq!(varint::decode(&[0x44]), Err(Error::ShortInput));
/// assert_eq!(varint::decode(&[]), Err(Error::ShortInput));
/// ```
pub fn decode(bytes: &[u8]) -> Result<(u64, usize), Error> {
    let first = *bytes.first().ok_or(Error::ShortInput)?;
    let len = 1 << (first >> 6);

    if bytes.len() < len {
        return Err(Error::ShortInput);
    }

    let mut value = (first & 0x3f) as u64;
    for byte in &bytes[1..len] {
        value = value << 8 | *byte as u64;
    }

    Ok((value, len))
}
