//! Bounds-checked binary reading over an in-memory byte buffer.
//!
//! Everything in the DEX and class-file parsers goes through [`Buffer`]:
//! little-endian primitives, ULEB128/SLEB128 variable-length integers and
//! MUTF-8 strings. Reads past the end fail with [`FormatError::Truncated`]
//! instead of panicking.

use byteorder::{BigEndian, ByteOrder, LittleEndian};

use crate::error::FormatError;

/// An immutable byte range with a cursor.
#[derive(Clone)]
pub struct Buffer<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Buffer<'a> {
    pub fn new(bytes: &'a [u8]) -> Buffer<'a> {
        Buffer { bytes, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.bytes.len().saturating_sub(self.pos)
    }

    pub fn seek(&mut self, offset: usize) -> Result<(), FormatError> {
        if offset > self.bytes.len() {
            return Err(FormatError::Truncated {
                offset,
                needed: offset - self.bytes.len(),
            });
        }
        self.pos = offset;
        Ok(())
    }

    /// A new cursor over `[offset, offset + len)` of the same backing bytes.
    pub fn sub_buffer(&self, offset: usize, len: usize) -> Result<Buffer<'a>, FormatError> {
        let end = offset.checked_add(len).ok_or(FormatError::Truncated {
            offset,
            needed: len,
        })?;
        if end > self.bytes.len() {
            return Err(FormatError::Truncated {
                offset,
                needed: end - self.bytes.len(),
            });
        }
        Ok(Buffer {
            bytes: &self.bytes[offset..end],
            pos: 0,
        })
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], FormatError> {
        if self.remaining() < n {
            return Err(FormatError::Truncated {
                offset: self.pos,
                needed: n - self.remaining(),
            });
        }
        let s = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    pub fn read_u8(&mut self) -> Result<u8, FormatError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, FormatError> {
        Ok(LittleEndian::read_u16(self.take(2)?))
    }

    pub fn read_u32(&mut self) -> Result<u32, FormatError> {
        Ok(LittleEndian::read_u32(self.take(4)?))
    }

    pub fn read_u64(&mut self) -> Result<u64, FormatError> {
        Ok(LittleEndian::read_u64(self.take(8)?))
    }

    /// Big-endian variants, for the JVM class-file format.
    pub fn read_u16_be(&mut self) -> Result<u16, FormatError> {
        Ok(BigEndian::read_u16(self.take(2)?))
    }

    pub fn read_u32_be(&mut self) -> Result<u32, FormatError> {
        Ok(BigEndian::read_u32(self.take(4)?))
    }

    pub fn read_u64_be(&mut self) -> Result<u64, FormatError> {
        Ok(BigEndian::read_u64(self.take(8)?))
    }

    pub fn peek_u16(&self) -> Result<u16, FormatError> {
        if self.remaining() < 2 {
            return Err(FormatError::Truncated {
                offset: self.pos,
                needed: 2 - self.remaining(),
            });
        }
        Ok(LittleEndian::read_u16(&self.bytes[self.pos..self.pos + 2]))
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8], FormatError> {
        self.take(n)
    }

    /// Unsigned LEB128 as used throughout DEX: at most 5 bytes for a u32.
    pub fn read_uleb128(&mut self) -> Result<u32, FormatError> {
        let start = self.pos;
        let mut value: u32 = 0;
        for shift in 0..5 {
            let byte = self.read_u8()?;
            value |= u32::from(byte & 0x7f) << (shift * 7);
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(FormatError::BadEncoding {
            offset: start,
            reason: "ULEB128 runs past 5 bytes".to_string(),
        })
    }

    /// Signed LEB128, at most 5 bytes for an i32.
    pub fn read_sleb128(&mut self) -> Result<i32, FormatError> {
        let start = self.pos;
        let mut value: i32 = 0;
        let mut shift = 0;
        loop {
            let byte = self.read_u8()?;
            value |= i32::from(byte & 0x7f) << shift;
            shift += 7;
            if byte & 0x80 == 0 {
                if shift < 32 && byte & 0x40 != 0 {
                    value |= -1 << shift;
                }
                return Ok(value);
            }
            if shift >= 35 {
                return Err(FormatError::BadEncoding {
                    offset: start,
                    reason: "SLEB128 runs past 5 bytes".to_string(),
                });
            }
        }
    }

    /// ULEB128 minus one, used by debug-info parameter name indices.
    pub fn read_uleb128p1(&mut self) -> Result<i32, FormatError> {
        Ok(self.read_uleb128()? as i32 - 1)
    }

    /// A DEX string_data_item: ULEB128 UTF-16 length, MUTF-8 bytes, NUL.
    ///
    /// MUTF-8 is UTF-8 except that U+0000 is the two-byte sequence C0 80 and
    /// supplementary code points are surrogate pairs of three-byte sequences;
    /// `cesu8`'s Java dialect decodes both.
    pub fn read_mutf8(&mut self) -> Result<String, FormatError> {
        let start = self.pos;
        let _utf16_len = self.read_uleb128()?;
        let data_start = self.pos;
        let mut end = self.pos;
        loop {
            if end >= self.bytes.len() {
                return Err(FormatError::Truncated {
                    offset: end,
                    needed: 1,
                });
            }
            if self.bytes[end] == 0 {
                break;
            }
            end += 1;
        }
        let raw = &self.bytes[data_start..end];
        self.pos = end + 1;
        match cesu8::from_java_cesu8(raw) {
            Ok(s) => Ok(s.into_owned()),
            Err(_) => Err(FormatError::BadEncoding {
                offset: start,
                reason: "invalid MUTF-8 sequence".to_string(),
            }),
        }
    }
}

/// Encode a string in MUTF-8 (no length prefix, no terminator).
pub fn encode_mutf8(s: &str) -> Vec<u8> {
    cesu8::to_java_cesu8(s).into_owned()
}

/// Decode an unprefixed MUTF-8 byte run.
pub fn decode_mutf8(bytes: &[u8]) -> Result<String, FormatError> {
    cesu8::from_java_cesu8(bytes)
        .map(|s| s.into_owned())
        .map_err(|_| FormatError::BadEncoding {
            offset: 0,
            reason: "invalid MUTF-8 sequence".to_string(),
        })
}

/// General-width unsigned LEB128 encoder, used by tests and by the
/// synthetic image builders.
pub fn encode_uleb128(mut value: u64) -> Vec<u8> {
    let mut out = Vec::new();
    loop {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if value == 0 {
            return out;
        }
    }
}

/// General-width unsigned LEB128 decoder. Rejects sequences that run past
/// 10 bytes without terminating (the u64 limit).
pub fn decode_uleb128(bytes: &[u8]) -> Result<(u64, usize), FormatError> {
    let mut value: u64 = 0;
    for (i, &byte) in bytes.iter().enumerate() {
        if i == 10 {
            break;
        }
        value |= u64::from(byte & 0x7f) << (i * 7);
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
    }
    Err(FormatError::BadEncoding {
        offset: 0,
        reason: "ULEB128 runs past 10 bytes".to_string(),
    })
}

/// General-width signed LEB128 encoder.
pub fn encode_sleb128(mut value: i64) -> Vec<u8> {
    let mut out = Vec::new();
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        let done = (value == 0 && byte & 0x40 == 0) || (value == -1 && byte & 0x40 != 0);
        out.push(if done { byte } else { byte | 0x80 });
        if done {
            return out;
        }
    }
}

/// General-width signed LEB128 decoder.
pub fn decode_sleb128(bytes: &[u8]) -> Result<(i64, usize), FormatError> {
    let mut value: i64 = 0;
    let mut shift = 0;
    for (i, &byte) in bytes.iter().enumerate() {
        if i == 10 {
            break;
        }
        value |= i64::from(byte & 0x7f) << shift;
        shift += 7;
        if byte & 0x80 == 0 {
            if shift < 64 && byte & 0x40 != 0 {
                value |= -1_i64 << shift;
            }
            return Ok((value, i + 1));
        }
    }
    Err(FormatError::BadEncoding {
        offset: 0,
        reason: "SLEB128 runs past 10 bytes".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primitive_reads() {
        let data = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08];
        let mut b = Buffer::new(&data);
        assert_eq!(b.read_u8().unwrap(), 0x01);
        assert_eq!(b.read_u16().unwrap(), 0x0302);
        assert_eq!(b.read_u32().unwrap(), 0x08070605);
        assert!(matches!(
            b.read_u8(),
            Err(FormatError::Truncated { offset: 7, .. })
        ));
    }

    #[test]
    fn test_read_u64_le() {
        let data = [0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11];
        let mut b = Buffer::new(&data);
        assert_eq!(b.read_u64().unwrap(), 0x1122334455667788);
    }

    #[test]
    fn test_encode_uleb128() {
        let cases = vec![
            (0, vec![0x00]),
            (1, vec![0x01]),
            (127, vec![0x7f]),
            (128, vec![0x80, 0x01]),
            (16256, vec![0x80, 0x7f]),
            (624485, vec![0xe5, 0x8e, 0x26]),
            (u64::MAX, vec![0xff; 9].into_iter().chain([0x01]).collect()),
        ];
        for (value, expected) in cases {
            assert_eq!(encode_uleb128(value), expected);
        }
    }

    #[test]
    fn test_leb128_round_trip() {
        let cases: Vec<i64> = vec![
            0,
            1,
            -1,
            63,
            64,
            -64,
            -65,
            127,
            128,
            -128,
            -123456,
            i64::MAX,
            i64::MIN,
        ];
        for value in cases {
            let enc = encode_sleb128(value);
            let (dec, len) = decode_sleb128(&enc).unwrap();
            assert_eq!(dec, value);
            assert_eq!(len, enc.len());
        }
        for value in [0u64, 1, 127, 128, 624485, u64::MAX] {
            let enc = encode_uleb128(value);
            let (dec, len) = decode_uleb128(&enc).unwrap();
            assert_eq!(dec, value);
            assert_eq!(len, enc.len());
        }
    }

    #[test]
    fn test_uleb128_rejects_unterminated() {
        let bytes = [0x80u8; 11];
        assert!(decode_uleb128(&bytes).is_err());

        let mut b = Buffer::new(&[0x80, 0x80, 0x80, 0x80, 0x80, 0x01]);
        assert!(b.read_uleb128().is_err());
    }

    #[test]
    fn test_mutf8_round_trip() {
        let cases = vec![
            "",
            "hello",
            "caf\u{e9}",
            "nul\u{0}inside",
            "astral \u{1f600} plane",
            "\u{10000}",
        ];
        for s in cases {
            let enc = encode_mutf8(s);
            assert_eq!(decode_mutf8(&enc).unwrap(), s);
        }
    }

    #[test]
    fn test_mutf8_null_is_two_bytes() {
        let enc = encode_mutf8("\u{0}");
        assert_eq!(enc, vec![0xc0, 0x80]);
    }

    #[test]
    fn test_read_mutf8_string_item() {
        // "ab" as a string_data_item: len 2, bytes, NUL
        let data = [0x02, b'a', b'b', 0x00, 0xff];
        let mut b = Buffer::new(&data);
        assert_eq!(b.read_mutf8().unwrap(), "ab");
        assert_eq!(b.position(), 4);
    }

    #[test]
    fn test_sub_buffer_bounds() {
        let data = [1u8, 2, 3, 4];
        let b = Buffer::new(&data);
        assert!(b.sub_buffer(2, 2).is_ok());
        assert!(b.sub_buffer(2, 3).is_err());
        assert!(b.sub_buffer(usize::MAX, 2).is_err());
    }
}
