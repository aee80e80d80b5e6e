//! Payload framing shared by producers and consumers.
//!
//! ```text
//! offset  size  field
//! 0       1     sampled flag (1 = timestamp is meaningful, 0 = not)
//! 1       8     timestamp, nanoseconds since the Unix epoch
//! 9       8     application sequence number
//! 17      4     total frame length in bytes
//! 21      ..    filler bytes ('X')
//! ```
//!
//! All integers are big-endian.

use crate::error::FrameError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

pub const HEADER_LEN: usize = 21;
pub const FILLER: u8 = b'X';

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub sampled: bool,
    pub timestamp: u64,
    pub sequence: u64,
    pub length: u32,
}

impl FrameHeader {
    /// Header for a frame of `size` bytes, padded up to the header length.
    pub fn new(sampled: bool, timestamp: u64, sequence: u64, size: usize) -> Self {
        Self {
            sampled,
            timestamp,
            sequence,
            length: size.max(HEADER_LEN) as u32,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.length as usize);
        self.encode_into(&mut buf);
        buf.freeze()
    }

    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u8(u8::from(self.sampled));
        buf.put_u64(self.timestamp);
        buf.put_u64(self.sequence);
        buf.put_u32(self.length);
        buf.put_bytes(FILLER, self.length as usize - HEADER_LEN);
    }

    pub fn decode(frame: &[u8]) -> Result<Self, FrameError> {
        if frame.len() < HEADER_LEN {
            return Err(FrameError::TooShort {
                len: frame.len(),
                min: HEADER_LEN,
            });
        }
        let mut buf = frame;
        let sampled = match buf.get_u8() {
            0 => false,
            1 => true,
            other => return Err(FrameError::InvalidFlag(other)),
        };
        let timestamp = buf.get_u64();
        let sequence = buf.get_u64();
        let length = buf.get_u32();
        if length as usize != frame.len() {
            return Err(FrameError::LengthMismatch {
                declared: length,
                actual: frame.len(),
            });
        }
        Ok(Self {
            sampled,
            timestamp,
            sequence,
            length,
        })
    }
}

/// Message sizes used in turn for each destination: `min, 2*min, 4*min, ...`
/// while not above `max`. `min` is raised to the header length first.
pub fn size_progression(min: usize, max: usize) -> Vec<usize> {
    let min = min.max(HEADER_LEN);
    let max = max.max(min);
    let mut sizes = vec![min];
    let mut next = min.saturating_mul(2);
    while next <= max {
        sizes.push(next);
        next = next.saturating_mul(2);
    }
    sizes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_is_big_endian() {
        let frame = FrameHeader::new(true, 0x0102030405060708, 9, 25).encode();
        assert_eq!(frame.len(), 25);
        assert_eq!(frame[0], 1);
        assert_eq!(&frame[1..9], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(&frame[9..17], &[0, 0, 0, 0, 0, 0, 0, 9]);
        assert_eq!(&frame[17..21], &[0, 0, 0, 25]);
        assert_eq!(&frame[21..], b"XXXX");
    }

    #[test]
    fn test_header_survives_encoding() {
        let timestamps = [0, 1, u64::MAX / 3, u64::MAX - 1, u64::MAX];
        let lengths = [21usize, 22, 128, 4096, 65535, 65536];
        for (i, &ts) in timestamps.iter().enumerate() {
            for &len in &lengths {
                let header = FrameHeader::new(i % 2 == 0, ts, u64::MAX - ts, len);
                let decoded = FrameHeader::decode(&header.encode()).unwrap();
                assert_eq!(decoded, header, "ts={} len={}", ts, len);
            }
        }
    }

    #[test]
    fn test_small_sizes_are_padded() {
        let header = FrameHeader::new(false, 0, 1, 4);
        assert_eq!(header.length, 21);
        assert_eq!(header.encode().len(), 21);
    }

    #[test]
    fn test_decode_rejects_bad_frames() {
        assert_eq!(
            FrameHeader::decode(&[0u8; 20]),
            Err(FrameError::TooShort { len: 20, min: 21 })
        );

        let mut frame = FrameHeader::new(true, 5, 6, 40).encode().to_vec();
        frame.truncate(39);
        assert_eq!(
            FrameHeader::decode(&frame),
            Err(FrameError::LengthMismatch {
                declared: 40,
                actual: 39
            })
        );

        let mut frame = FrameHeader::new(true, 5, 6, 40).encode().to_vec();
        frame[0] = 7;
        assert_eq!(FrameHeader::decode(&frame), Err(FrameError::InvalidFlag(7)));
    }

    #[test]
    fn test_size_progression() {
        assert_eq!(size_progression(128, 128), vec![128]);
        assert_eq!(size_progression(100, 1000), vec![100, 200, 400, 800]);
        assert_eq!(size_progression(64, 512), vec![64, 128, 256, 512]);
        assert_eq!(size_progression(8, 50), vec![21, 42]);
        assert_eq!(size_progression(300, 10), vec![300]);
    }
}
