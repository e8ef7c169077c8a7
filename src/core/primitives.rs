//! Variable-width payload primitives.
//!
//! ```text
//! VarInt:    value < 0xfd        -> [value]
//!            value <= 0xffff     -> [0xfd] [u16 LE]
//!            value <= 0xffffffff -> [0xfe] [u32 LE]
//!            otherwise           -> [0xff] [u64 LE]
//! VarString: [VarInt length] [length single-byte characters]
//! ```
//!
//! VarString characters are single bytes (Latin-1); code points above
//! U+00FF are written as `?`.

use crate::error::{constants, ProtocolError, Result};
use bytes::{Buf, BufMut};

/// Fail with [`ProtocolError::Truncated`] unless `n` bytes remain
#[inline]
pub fn ensure_remaining<B: Buf>(src: &B, n: usize) -> Result<()> {
    if src.remaining() < n {
        Err(ProtocolError::Truncated(constants::ERR_TRUNCATED))
    } else {
        Ok(())
    }
}

/// Self-describing variable-width unsigned integer
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VarInt(pub u64);

impl VarInt {
    pub fn encoded_len(&self) -> usize {
        match self.0 {
            0..=0xfc => 1,
            0xfd..=0xffff => 3,
            0x1_0000..=0xffff_ffff => 5,
            _ => 9,
        }
    }

    pub fn encode<B: BufMut>(&self, dst: &mut B) {
        match self.0 {
            v @ 0..=0xfc => dst.put_u8(v as u8),
            v @ 0xfd..=0xffff => {
                dst.put_u8(0xfd);
                dst.put_u16_le(v as u16);
            }
            v @ 0x1_0000..=0xffff_ffff => {
                dst.put_u8(0xfe);
                dst.put_u32_le(v as u32);
            }
            v => {
                dst.put_u8(0xff);
                dst.put_u64_le(v);
            }
        }
    }

    pub fn decode<B: Buf>(src: &mut B) -> Result<Self> {
        ensure_remaining(src, 1)?;
        let value = match src.get_u8() {
            0xfd => {
                ensure_remaining(src, 2)?;
                u64::from(src.get_u16_le())
            }
            0xfe => {
                ensure_remaining(src, 4)?;
                u64::from(src.get_u32_le())
            }
            0xff => {
                ensure_remaining(src, 8)?;
                src.get_u64_le()
            }
            b => u64::from(b),
        };
        Ok(VarInt(value))
    }
}

impl From<usize> for VarInt {
    fn from(v: usize) -> Self {
        VarInt(v as u64)
    }
}

/// Length-prefixed single-byte string
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct VarString(pub String);

impl VarString {
    pub fn new(s: impl Into<String>) -> Self {
        VarString(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn char_count(&self) -> usize {
        self.0.chars().count()
    }

    pub fn encoded_len(&self) -> usize {
        let n = self.char_count();
        VarInt::from(n).encoded_len() + n
    }

    pub fn encode<B: BufMut>(&self, dst: &mut B) {
        VarInt::from(self.char_count()).encode(dst);
        for c in self.0.chars() {
            let code = u32::from(c);
            dst.put_u8(if code <= 0xff { code as u8 } else { b'?' });
        }
    }

    pub fn decode<B: Buf>(src: &mut B) -> Result<Self> {
        let len = VarInt::decode(src)?.0;
        let len = usize::try_from(len)
            .map_err(|_| ProtocolError::Truncated(constants::ERR_TRUNCATED))?;
        ensure_remaining(src, len)?;
        let mut s = String::with_capacity(len);
        for _ in 0..len {
            s.push(char::from(src.get_u8()));
        }
        Ok(VarString(s))
    }
}

impl From<&str> for VarString {
    fn from(s: &str) -> Self {
        VarString(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    fn encode(v: u64) -> BytesMut {
        let mut buf = BytesMut::new();
        VarInt(v).encode(&mut buf);
        buf
    }

    #[test]
    fn test_varint_boundaries() {
        let cases: [(u64, usize, u8); 7] = [
            (0, 1, 0x00),
            (0xfc, 1, 0xfc),
            (0xfd, 3, 0xfd),
            (0xffff, 3, 0xfd),
            (0x1_0000, 5, 0xfe),
            (0xffff_ffff, 5, 0xfe),
            (0x1_0000_0000, 9, 0xff),
        ];
        for (value, len, prefix) in cases {
            let buf = encode(value);
            assert_eq!(buf.len(), len, "width for {value:#x}");
            assert_eq!(buf[0], prefix, "prefix for {value:#x}");
            assert_eq!(VarInt(value).encoded_len(), len);
            let decoded = VarInt::decode(&mut &buf[..]).unwrap();
            assert_eq!(decoded.0, value);
        }
    }

    #[test]
    fn test_varint_little_endian_body() {
        assert_eq!(&encode(0x1234)[..], &[0xfd, 0x34, 0x12]);
    }

    #[test]
    fn test_varint_truncated() {
        assert!(VarInt::decode(&mut &[0xfeu8, 0x01, 0x02][..]).is_err());
        assert!(VarInt::decode(&mut &[0u8; 0][..]).is_err());
    }

    #[test]
    fn test_varstring_round_trip() {
        let s = VarString::new("/Satoshi:0.7.2/");
        let mut buf = BytesMut::new();
        s.encode(&mut buf);
        assert_eq!(buf.len(), s.encoded_len());
        assert_eq!(buf[0], 15);
        assert_eq!(VarString::decode(&mut &buf[..]).unwrap(), s);
    }

    #[test]
    fn test_varstring_latin1() {
        let mut buf = BytesMut::new();
        VarString::new("é€").encode(&mut buf);
        assert_eq!(&buf[..], &[2, 0xe9, b'?']);
        let decoded = VarString::decode(&mut &[1u8, 0xe9][..]).unwrap();
        assert_eq!(decoded.as_str(), "é");
    }

    #[test]
    fn test_varstring_length_exceeds_payload() {
        assert!(VarString::decode(&mut &[5u8, b'a', b'b'][..]).is_err());
    }
}
