//! Transport header codec.
//!
//! Every buffer handed across a link starts with a fixed 16-byte header,
//! little-endian, in this order:
//!
//! ```text
//! offset  size  field
//!      0     4  src            sender endpoint address
//!      4     4  dst            destination endpoint address
//!      8     2  reserved.rfu   reserved for future use, zero on send
//!     10     2  reserved.idx   descriptor index of a held rx buffer
//!     12     2  len            payload length in bytes
//!     14     2  flags          message flags, zero on send
//! ```
//!
//! The payload follows immediately. Both sides must agree on this layout byte
//! for byte, so it is encoded field by field instead of being cast from a
//! `repr(C)` struct.

/// Size of the encoded header in bytes.
pub const HEADER_SIZE: usize = 16;

/// Layout version of the header above. Bumped if a field ever moves.
pub const HEADER_FORMAT_VERSION: u32 = 1;

/// The reserved word of the header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Reserved {
    pub rfu: u16,
    pub idx: u16,
}

/// A decoded message header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct MsgHeader {
    pub src: u32,
    pub dst: u32,
    pub reserved: Reserved,
    pub len: u16,
    pub flags: u16,
}

impl MsgHeader {
    /// A header for a fresh outgoing message.
    pub const fn new(src: u32, dst: u32, len: u16, flags: u16) -> Self {
        Self {
            src,
            dst,
            reserved: Reserved { rfu: 0, idx: 0 },
            len,
            flags,
        }
    }

    /// Encode into the wire representation.
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0..4].copy_from_slice(&self.src.to_le_bytes());
        out[4..8].copy_from_slice(&self.dst.to_le_bytes());
        out[8..10].copy_from_slice(&self.reserved.rfu.to_le_bytes());
        out[10..12].copy_from_slice(&self.reserved.idx.to_le_bytes());
        out[12..14].copy_from_slice(&self.len.to_le_bytes());
        out[14..16].copy_from_slice(&self.flags.to_le_bytes());
        out
    }

    /// Write the header into the front of `buf`.
    pub fn write_to(&self, buf: &mut [u8]) -> Result<(), HeaderError> {
        if buf.len() < HEADER_SIZE {
            return Err(HeaderError::Truncated { len: buf.len() });
        }
        buf[..HEADER_SIZE].copy_from_slice(&self.encode());
        Ok(())
    }

    /// Decode a header from the front of `buf`.
    ///
    /// `buf` is everything the sender may have written: header plus payload
    /// area. A declared length that runs past the end of `buf` is rejected.
    pub fn decode(buf: &[u8]) -> Result<Self, HeaderError> {
        if buf.len() < HEADER_SIZE {
            return Err(HeaderError::Truncated { len: buf.len() });
        }

        let u32_at = |at: usize| u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]);
        let u16_at = |at: usize| u16::from_le_bytes([buf[at], buf[at + 1]]);

        let header = Self {
            src: u32_at(0),
            dst: u32_at(4),
            reserved: Reserved {
                rfu: u16_at(8),
                idx: u16_at(10),
            },
            len: u16_at(12),
            flags: u16_at(14),
        };

        let available = buf.len() - HEADER_SIZE;
        if header.len as usize > available {
            return Err(HeaderError::LengthOverflow {
                declared: header.len as usize,
                available,
            });
        }

        Ok(header)
    }

    /// Total bytes occupied by header plus payload.
    #[inline]
    pub fn frame_len(&self) -> usize {
        HEADER_SIZE + self.len as usize
    }
}

/// Encode a header for `(src, dst, len, flags)`.
pub fn encode_header(src: u32, dst: u32, len: u16, flags: u16) -> [u8; HEADER_SIZE] {
    MsgHeader::new(src, dst, len, flags).encode()
}

/// Decode the header at the front of `bytes`.
pub fn decode_header(bytes: &[u8]) -> Result<MsgHeader, HeaderError> {
    MsgHeader::decode(bytes)
}

/// Why a header could not be decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum HeaderError {
    #[error("{len} bytes is too short for a 16-byte header")]
    Truncated { len: usize },
    #[error("header declares {declared} payload bytes but only {available} follow")]
    LengthOverflow { declared: usize, available: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_layout() {
        let bytes = encode_header(0x0102_0304, 0x0A0B_0C0D, 0x0506, 0x0708);
        assert_eq!(
            bytes,
            [
                0x04, 0x03, 0x02, 0x01, // src
                0x0D, 0x0C, 0x0B, 0x0A, // dst
                0x00, 0x00, 0x00, 0x00, // reserved
                0x06, 0x05, // len
                0x08, 0x07, // flags
            ]
        );
    }

    #[test]
    fn test_roundtrip_with_payload_room() {
        let mut buf = vec![0u8; HEADER_SIZE + 5];
        MsgHeader::new(20, 10, 5, 0).write_to(&mut buf).unwrap();
        buf[HEADER_SIZE..].copy_from_slice(b"hello");

        let header = decode_header(&buf).unwrap();
        assert_eq!(header.src, 20);
        assert_eq!(header.dst, 10);
        assert_eq!(header.len, 5);
        assert_eq!(header.flags, 0);
        assert_eq!(header.frame_len(), HEADER_SIZE + 5);
    }

    #[test]
    fn test_reserved_idx_survives() {
        let mut header = MsgHeader::new(1, 2, 0, 0);
        header.reserved.idx = 3;
        let decoded = MsgHeader::decode(&header.encode()).unwrap();
        assert_eq!(decoded.reserved, Reserved { rfu: 0, idx: 3 });
    }

    #[test]
    fn test_truncated() {
        assert_eq!(
            decode_header(&[0u8; 15]),
            Err(HeaderError::Truncated { len: 15 })
        );
        assert!(MsgHeader::new(1, 2, 0, 0).write_to(&mut [0u8; 8]).is_err());
    }

    #[test]
    fn test_length_past_end_is_corrupt() {
        let mut buf = vec![0u8; HEADER_SIZE + 4];
        MsgHeader::new(1, 2, 5, 0).write_to(&mut buf).unwrap();
        assert_eq!(
            decode_header(&buf),
            Err(HeaderError::LengthOverflow {
                declared: 5,
                available: 4
            })
        );
    }

    #[test]
    fn test_zero_length_payload() {
        let header = decode_header(&encode_header(7, 8, 0, 0)).unwrap();
        assert_eq!(header.len, 0);
    }
}
