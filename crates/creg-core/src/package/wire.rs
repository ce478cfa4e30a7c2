//! Little-endian byte codec
//!
//! All multi-byte values go through `to_le_bytes`/`from_le_bytes`, so the
//! on-disk order is little-endian whatever the host byte order.

use crate::error::{CregError, CregResult};

/// Largest value a varint can carry (30 bits)
pub const VARINT_MAX: u32 = 0x3FFF_FFFF;

/// Append a 1, 2 or 4 byte unsigned integer
///
/// Values below 0x80 take one byte; below 0x4000 two bytes, the first with
/// its high bit set; anything else takes four bytes, the first two with
/// their high bits set and the upper 16 bits stored little-endian.
pub fn write_varint(out: &mut Vec<u8>, value: u32) -> CregResult<()> {
    if value < 0x80 {
        out.push(value as u8);
    } else if value < 0x4000 {
        out.push((value & 0x7F) as u8 | 0x80);
        out.push((value >> 7) as u8);
    } else if value <= VARINT_MAX {
        out.push((value & 0x7F) as u8 | 0x80);
        out.push(((value >> 7) & 0x7F) as u8 | 0x80);
        out.extend_from_slice(&((value >> 14) as u16).to_le_bytes());
    } else {
        return Err(CregError::CapacityExceeded {
            what: "varint value",
            limit: VARINT_MAX as usize,
        });
    }
    Ok(())
}

/// Append a zero-terminated string
pub fn write_cstr(out: &mut Vec<u8>, value: &str) {
    out.extend_from_slice(value.as_bytes());
    out.push(0);
}

/// Bounded cursor over one package section
pub struct ByteReader<'a> {
    bytes: &'a [u8],
    pos: usize,
    /// Absolute offset of `bytes[0]` in the package, for diagnostics
    base: usize,
    section: &'static str,
}

impl<'a> ByteReader<'a> {
    pub fn new(bytes: &'a [u8], base: usize, section: &'static str) -> Self {
        Self {
            bytes,
            pos: 0,
            base,
            section,
        }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn take(&mut self, len: usize) -> CregResult<&'a [u8]> {
        if len > self.remaining() {
            return Err(CregError::Truncated {
                section: self.section,
                offset: self.base + self.pos,
                needed: len,
            });
        }
        let slice = &self.bytes[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    pub fn read_into(&mut self, out: &mut [u8]) -> CregResult<()> {
        out.copy_from_slice(self.take(out.len())?);
        Ok(())
    }

    pub fn read_u8(&mut self) -> CregResult<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u32(&mut self) -> CregResult<u32> {
        let mut buf = [0u8; 4];
        self.read_into(&mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    pub fn read_i32(&mut self) -> CregResult<i32> {
        let mut buf = [0u8; 4];
        self.read_into(&mut buf)?;
        Ok(i32::from_le_bytes(buf))
    }

    pub fn read_i64(&mut self) -> CregResult<i64> {
        let mut buf = [0u8; 8];
        self.read_into(&mut buf)?;
        Ok(i64::from_le_bytes(buf))
    }

    pub fn read_varint(&mut self) -> CregResult<u32> {
        let a = self.read_u8()? as u32;
        if a & 0x80 == 0 {
            return Ok(a);
        }
        let b = self.read_u8()? as u32;
        if b & 0x80 == 0 {
            return Ok((a & 0x7F) | (b << 7));
        }
        let mut high = [0u8; 2];
        self.read_into(&mut high)?;
        Ok((a & 0x7F) | ((b & 0x7F) << 7) | ((u16::from_le_bytes(high) as u32) << 14))
    }

    pub fn read_cstr(&mut self) -> CregResult<&'a str> {
        let rest = &self.bytes[self.pos..];
        let len = rest.iter().position(|&b| b == 0).ok_or(CregError::Truncated {
            section: self.section,
            offset: self.base + self.bytes.len(),
            needed: 1,
        })?;
        let name = std::str::from_utf8(&rest[..len])
            .map_err(|e| CregError::Corrupt(format!("class name is not utf-8: {e}")))?;
        self.pos += len + 1;
        Ok(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded(value: u32) -> Vec<u8> {
        let mut out = Vec::new();
        write_varint(&mut out, value).unwrap();
        out
    }

    #[test]
    fn test_varint_widths() {
        assert_eq!(encoded(0), vec![0x00]);
        assert_eq!(encoded(0x7F), vec![0x7F]);
        assert_eq!(encoded(0x80), vec![0x80, 0x01]);
        assert_eq!(encoded(0x3FFF).len(), 2);
        assert_eq!(encoded(0x4000), vec![0x80, 0x80, 0x01, 0x00]);
        assert_eq!(encoded(VARINT_MAX).len(), 4);
        assert!(write_varint(&mut Vec::new(), VARINT_MAX + 1).is_err());
    }

    #[test]
    fn test_varint_boundaries_decode() {
        for value in [0, 1, 0x7F, 0x80, 0x1234, 0x3FFF, 0x4000, 0x12_3456, VARINT_MAX] {
            let bytes = encoded(value);
            let mut reader = ByteReader::new(&bytes, 0, "test");
            assert_eq!(reader.read_varint().unwrap(), value);
            assert!(reader.is_empty());
        }
    }

    #[test]
    fn test_reader_bounds() {
        let bytes = [1u8, 2, 3];
        let mut reader = ByteReader::new(&bytes, 100, "data");
        assert_eq!(reader.read_u8().unwrap(), 1);
        match reader.read_u32() {
            Err(CregError::Truncated {
                section,
                offset,
                needed,
            }) => {
                assert_eq!(section, "data");
                assert_eq!(offset, 101);
                assert_eq!(needed, 4);
            }
            other => panic!("expected truncation, got {other:?}"),
        }
    }

    #[test]
    fn test_cstr() {
        let mut out = Vec::new();
        write_cstr(&mut out, "Unit");
        write_cstr(&mut out, "Team");
        let mut reader = ByteReader::new(&out, 0, "classes");
        assert_eq!(reader.read_cstr().unwrap(), "Unit");
        assert_eq!(reader.read_cstr().unwrap(), "Team");
        assert!(reader.read_cstr().is_err());
    }
}
