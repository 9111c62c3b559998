use std::fmt;

use bytes::{Buf, BufMut};
use thiserror::Error;

use crate::coding::{self, Codec, UnexpectedEnd};

/// An integer less than 2^62
///
/// Values of this type are suitable for encoding as QUIC variable-length integers: the
/// two most significant bits of the first byte select a 1, 2, 4, or 8 byte encoding, and
/// the remaining bits carry the value in network byte order.
///
// +------+--------+-------------+-----------------------+
// | 2Bit | Length | Usable Bits | Range                 |
// +------+--------+-------------+-----------------------+
// | 00   | 1      | 6           | 0-63                  |
// | 01   | 2      | 14          | 0-16383               |
// | 10   | 4      | 30          | 0-1073741823          |
// | 11   | 8      | 62          | 0-4611686018427387903 |
// +------+--------+-------------+-----------------------+
#[derive(Default, Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VarInt(pub(crate) u64);

impl VarInt {
    /// The largest representable value
    pub const MAX: Self = Self((1 << 62) - 1);
    /// The largest encoded value length
    pub const MAX_SIZE: usize = 8;

    /// Construct a `VarInt` infallibly
    pub const fn from_u32(x: u32) -> Self {
        Self(x as u64)
    }

    /// Succeeds iff `x` < 2^62
    pub fn from_u64(x: u64) -> Result<Self, VarIntBoundsExceeded> {
        if x < 2u64.pow(62) {
            Ok(Self(x))
        } else {
            Err(VarIntBoundsExceeded)
        }
    }

    /// Create a VarInt without ensuring it's in range
    ///
    /// # Safety
    ///
    /// `x` must be less than 2^62.
    pub const unsafe fn from_u64_unchecked(x: u64) -> Self {
        Self(x)
    }

    /// Extract the integer value
    pub const fn into_inner(self) -> u64 {
        self.0
    }

    /// Compute the number of bytes needed to encode this value
    pub const fn size(self) -> usize {
        let x = self.0;
        if x < 2u64.pow(6) {
            1
        } else if x < 2u64.pow(14) {
            2
        } else if x < 2u64.pow(30) {
            4
        } else if x < 2u64.pow(62) {
            8
        } else {
            panic!("malformed VarInt");
        }
    }

    /// Read a varint from the start of `r`, if one is completely present
    pub fn read<B: Buf>(r: &mut B) -> Option<Self> {
        Self::decode(r).ok()
    }

    /// Append the minimal encoding of this value to `w`
    pub fn write<B: BufMut>(self, w: &mut B) {
        self.encode(w)
    }

    /// Encode into exactly `len` bytes, padding the value with leading zeroes as needed
    ///
    /// `len` must be a legal varint encoding length (1, 2, 4, or 8; anything else is a
    /// programmer error). Fails iff the value needs more than `len` bytes.
    pub fn encode_sized<B: BufMut>(
        self,
        len: usize,
        buf: &mut B,
    ) -> Result<(), VarIntBoundsExceeded> {
        let x = self.0;
        match len {
            1 if x < 2u64.pow(6) => buf.put_u8(x as u8),
            2 if x < 2u64.pow(14) => buf.put_u16(0b01 << 14 | x as u16),
            4 if x < 2u64.pow(30) => buf.put_u32(0b10 << 30 | x as u32),
            8 => buf.put_u64(0b11 << 62 | x),
            1 | 2 | 4 => return Err(VarIntBoundsExceeded),
            _ => panic!("invalid varint encoding length"),
        }
        Ok(())
    }
}

impl From<VarInt> for u64 {
    fn from(x: VarInt) -> Self {
        x.0
    }
}

impl From<u8> for VarInt {
    fn from(x: u8) -> Self {
        Self(x.into())
    }
}

impl From<u16> for VarInt {
    fn from(x: u16) -> Self {
        Self(x.into())
    }
}

impl From<u32> for VarInt {
    fn from(x: u32) -> Self {
        Self(x.into())
    }
}

impl TryFrom<u64> for VarInt {
    type Error = VarIntBoundsExceeded;
    /// Succeeds iff `x` < 2^62
    fn try_from(x: u64) -> Result<Self, Self::Error> {
        Self::from_u64(x)
    }
}

impl TryFrom<usize> for VarInt {
    type Error = VarIntBoundsExceeded;
    /// Succeeds iff `x` < 2^62
    fn try_from(x: usize) -> Result<Self, Self::Error> {
        Self::try_from(x as u64)
    }
}

impl fmt::Display for VarInt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Error returned when constructing a `VarInt` from a value >= 2^62
#[derive(Debug, Copy, Clone, Eq, PartialEq, Error)]
#[error("value too large for varint encoding")]
pub struct VarIntBoundsExceeded;

impl Codec for VarInt {
    fn decode<B: Buf>(r: &mut B) -> coding::Result<Self> {
        if !r.has_remaining() {
            return Err(UnexpectedEnd);
        }
        let mut buf = [0; 8];
        let tag = r.chunk()[0] >> 6;
        let x = match tag {
            0b00 => {
                buf[0] = r.get_u8();
                u64::from(buf[0] & 0b0011_1111)
            }
            0b01 => {
                if r.remaining() < 2 {
                    return Err(UnexpectedEnd);
                }
                r.copy_to_slice(&mut buf[..2]);
                buf[0] &= 0b0011_1111;
                u64::from(u16::from_be_bytes(buf[..2].try_into().unwrap()))
            }
            0b10 => {
                if r.remaining() < 4 {
                    return Err(UnexpectedEnd);
                }
                r.copy_to_slice(&mut buf[..4]);
                buf[0] &= 0b0011_1111;
                u64::from(u32::from_be_bytes(buf[..4].try_into().unwrap()))
            }
            0b11 => {
                if r.remaining() < 8 {
                    return Err(UnexpectedEnd);
                }
                r.copy_to_slice(&mut buf);
                buf[0] &= 0b0011_1111;
                u64::from_be_bytes(buf)
            }
            _ => unreachable!(),
        };
        Ok(Self(x))
    }

    fn encode<B: BufMut>(&self, w: &mut B) {
        let x = self.0;
        if x < 2u64.pow(6) {
            w.put_u8(x as u8);
        } else if x < 2u64.pow(14) {
            w.put_u16(0b01 << 14 | x as u16);
        } else if x < 2u64.pow(30) {
            w.put_u32(0b10 << 30 | x as u32);
        } else if x < 2u64.pow(62) {
            w.put_u64(0b11 << 62 | x);
        } else {
            unreachable!("malformed VarInt");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    fn roundtrip(x: u64) -> usize {
        let v = VarInt::from_u64(x).unwrap();
        let mut buf = Vec::new();
        v.encode(&mut buf);
        assert_eq!(buf.len(), v.size());
        let mut r = io::Cursor::new(&buf);
        assert_eq!(VarInt::decode(&mut r).unwrap(), v);
        buf.len()
    }

    #[test]
    fn sizes() {
        assert_eq!(roundtrip(0), 1);
        assert_eq!(roundtrip(63), 1);
        assert_eq!(roundtrip(64), 2);
        assert_eq!(roundtrip(16383), 2);
        assert_eq!(roundtrip(16384), 4);
        assert_eq!(roundtrip(1_073_741_823), 4);
        assert_eq!(roundtrip(1_073_741_824), 8);
        assert_eq!(roundtrip(2u64.pow(62) - 1), 8);
        assert_eq!(VarInt::from_u64(2u64.pow(62)), Err(VarIntBoundsExceeded));
        assert_eq!(VarInt::from_u64(u64::MAX), Err(VarIntBoundsExceeded));
    }

    #[test]
    fn decode_matches_wire_examples() {
        // Examples from RFC 9000 appendix A.1
        let mut buf = io::Cursor::new(&[0xc2, 0x19, 0x7c, 0x5e, 0xff, 0x14, 0xe8, 0x8c][..]);
        assert_eq!(
            VarInt::decode(&mut buf).unwrap().into_inner(),
            151_288_809_941_952_652
        );
        let mut buf = io::Cursor::new(&[0x9d, 0x7f, 0x3e, 0x7d][..]);
        assert_eq!(VarInt::decode(&mut buf).unwrap().into_inner(), 494_878_333);
        let mut buf = io::Cursor::new(&[0x7b, 0xbd][..]);
        assert_eq!(VarInt::decode(&mut buf).unwrap().into_inner(), 15_293);
        let mut buf = io::Cursor::new(&[0x25][..]);
        assert_eq!(VarInt::decode(&mut buf).unwrap().into_inner(), 37);
    }

    #[test]
    fn truncated_input() {
        for x in [64u64, 16384, 1_073_741_824] {
            let mut buf = Vec::new();
            VarInt(x).encode(&mut buf);
            for len in 0..buf.len() {
                let mut r = io::Cursor::new(&buf[..len]);
                assert_eq!(VarInt::decode(&mut r), Err(UnexpectedEnd));
            }
        }
    }

    #[test]
    fn sized_encoding_pads() {
        for (x, len, expected) in [
            (37u64, 1usize, &[0x25][..]),
            (37, 2, &[0x40, 0x25][..]),
            (37, 4, &[0x80, 0, 0, 0x25][..]),
            (37, 8, &[0xc0, 0, 0, 0, 0, 0, 0, 0x25][..]),
            (15_293, 2, &[0x7b, 0xbd][..]),
            (15_293, 4, &[0x80, 0, 0x3b, 0xbd][..]),
        ] {
            let mut buf = Vec::new();
            VarInt(x).encode_sized(len, &mut buf).unwrap();
            assert_eq!(buf, expected);
            let mut r = io::Cursor::new(&buf);
            assert_eq!(VarInt::decode(&mut r).unwrap().into_inner(), x);
        }
    }

    #[test]
    fn sized_encoding_rejects_narrow_lengths() {
        let mut buf = Vec::new();
        assert_eq!(
            VarInt(16384).encode_sized(2, &mut buf),
            Err(VarIntBoundsExceeded)
        );
        assert_eq!(
            VarInt(64).encode_sized(1, &mut buf),
            Err(VarIntBoundsExceeded)
        );
        assert!(buf.is_empty());
    }

    #[test]
    #[should_panic]
    fn sized_encoding_rejects_illegal_length() {
        let mut buf = Vec::new();
        let _ = VarInt(1).encode_sized(3, &mut buf);
    }
}
