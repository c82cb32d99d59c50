//! Typed, length-prefixed wire frames.
//!
//! The frame is the smallest unit on the wire:
//!
//! ```text
//! ┌───────┬─────────────────┬───────────────────┐
//! │ type  │ data_length     │ payload           │
//! │ 1 byte│ u16 LE, only for│ data_length bytes │
//! │       │ data frames     │                   │
//! └───────┴─────────────────┴───────────────────┘
//! ```
//!
//! Zero-payload types (`Ping`, `Empty`, `EmptyLast`) are a single type
//! byte. Data-bearing types (`More`, `Last`, `Command`) carry the 2-byte
//! little-endian length and the payload. `Batch` is the gather marker
//! written in front of each batched flush; its length describes the frame
//! bytes that follow and is consumed by the parser without surfacing.
//!
//! Uses `bytes::Bytes` for zero-copy payload sharing.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Result, WireError};

/// Header length for data-bearing frames (type + u16 length).
pub const FRAME_HEADER_LEN: usize = 3;

/// Header length for zero-payload frames.
pub const SHORT_HEADER_LEN: usize = 1;

/// Length of the gather marker written before each batched flush.
pub const GATHER_HEADER_LEN: usize = 3;

/// Frame type discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// Gather marker in front of a batched flush; never surfaced.
    Batch = 0,
    /// Keep-alive; consumed before message assembly.
    Ping = 1,
    /// Zero-payload interior frame.
    Empty = 2,
    /// Zero-payload terminal frame.
    EmptyLast = 3,
    /// Data-bearing interior frame.
    More = 4,
    /// Data-bearing terminal frame of a data message.
    Last = 5,
    /// Data-bearing terminal frame of a control message; control messages
    /// carry transport-internal traffic, routed by handler id.
    Command = 6,
}

impl FrameType {
    /// Decode a type byte.
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(FrameType::Batch),
            1 => Some(FrameType::Ping),
            2 => Some(FrameType::Empty),
            3 => Some(FrameType::EmptyLast),
            4 => Some(FrameType::More),
            5 => Some(FrameType::Last),
            6 => Some(FrameType::Command),
            _ => None,
        }
    }

    /// Whether this type carries a length field and payload.
    #[inline]
    pub fn has_payload(self) -> bool {
        matches!(self, FrameType::More | FrameType::Last | FrameType::Command)
    }

    /// Whether this type terminates a message.
    #[inline]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            FrameType::Last | FrameType::EmptyLast | FrameType::Command
        )
    }
}

/// A complete wire frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame type.
    pub frame_type: FrameType,
    /// Payload bytes; empty for zero-payload types.
    pub data: Bytes,
}

impl Frame {
    /// Keep-alive frame.
    #[inline]
    pub fn ping() -> Self {
        Self {
            frame_type: FrameType::Ping,
            data: Bytes::new(),
        }
    }

    /// Zero-payload interior frame.
    #[inline]
    pub fn empty() -> Self {
        Self {
            frame_type: FrameType::Empty,
            data: Bytes::new(),
        }
    }

    /// Zero-payload terminal frame.
    #[inline]
    pub fn empty_last() -> Self {
        Self {
            frame_type: FrameType::EmptyLast,
            data: Bytes::new(),
        }
    }

    /// Data-bearing interior frame. `data` must not be empty.
    #[inline]
    pub fn more(data: Bytes) -> Self {
        debug_assert!(!data.is_empty(), "zero-length More; use Empty");
        Self {
            frame_type: FrameType::More,
            data,
        }
    }

    /// Data-bearing terminal frame. `data` must not be empty.
    #[inline]
    pub fn last(data: Bytes) -> Self {
        debug_assert!(!data.is_empty(), "zero-length Last; use EmptyLast");
        Self {
            frame_type: FrameType::Last,
            data,
        }
    }

    /// Terminal frame of a control message.
    #[inline]
    pub fn command(data: Bytes) -> Self {
        debug_assert!(!data.is_empty(), "zero-length Command");
        Self {
            frame_type: FrameType::Command,
            data,
        }
    }

    /// Header length on the wire for this frame.
    #[inline]
    pub fn header_len(&self) -> usize {
        if self.frame_type.has_payload() {
            FRAME_HEADER_LEN
        } else {
            SHORT_HEADER_LEN
        }
    }

    /// Total bytes this frame occupies on the wire.
    #[inline]
    pub fn wire_len(&self) -> usize {
        self.header_len() + self.data.len()
    }

    /// Validate payload constraints against the configured limit.
    pub fn validate(&self, max_frame_data: usize) -> Result<()> {
        if self.frame_type.has_payload() {
            if self.data.is_empty() {
                return Err(WireError::InvalidFrame(format!(
                    "zero-length {:?} frame",
                    self.frame_type
                )));
            }
            if self.data.len() > max_frame_data {
                return Err(WireError::InvalidFrame(format!(
                    "payload {} exceeds maximum {}",
                    self.data.len(),
                    max_frame_data
                )));
            }
        } else if !self.data.is_empty() {
            return Err(WireError::InvalidFrame(format!(
                "{:?} frame must not carry data",
                self.frame_type
            )));
        }
        Ok(())
    }

    /// Append this frame's wire bytes to `buf`.
    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u8(self.frame_type as u8);
        if self.frame_type.has_payload() {
            buf.put_u16_le(self.data.len() as u16);
            buf.extend_from_slice(&self.data);
        }
    }

    /// Encode to a standalone byte vector.
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(self.wire_len());
        self.encode_into(&mut buf);
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::FrameBuilder;

    const MAX: usize = 16 * 1024 - 3;

    fn roundtrip(frame: &Frame) -> Frame {
        let mut builder = FrameBuilder::new(MAX);
        builder.write(&frame.encode()).unwrap();
        let mut frames = builder.frames();
        assert_eq!(frames.len(), 1);
        frames.remove(0)
    }

    #[test]
    fn test_type_from_u8() {
        for (byte, ty) in [
            (0u8, FrameType::Batch),
            (1, FrameType::Ping),
            (2, FrameType::Empty),
            (3, FrameType::EmptyLast),
            (4, FrameType::More),
            (5, FrameType::Last),
            (6, FrameType::Command),
        ] {
            assert_eq!(FrameType::from_u8(byte), Some(ty));
        }
        assert_eq!(FrameType::from_u8(7), None);
        assert_eq!(FrameType::from_u8(0xFF), None);
    }

    #[test]
    fn test_wire_layout_data_frame() {
        let frame = Frame::last(Bytes::from_static(&[0xAA, 0xBB, 0xCC]));
        let bytes = frame.encode();

        assert_eq!(bytes[0], FrameType::Last as u8);
        // Little-endian length.
        assert_eq!(bytes[1], 3);
        assert_eq!(bytes[2], 0);
        assert_eq!(&bytes[3..], &[0xAA, 0xBB, 0xCC]);
        assert_eq!(frame.wire_len(), 6);
    }

    #[test]
    fn test_wire_layout_short_frame() {
        for frame in [Frame::ping(), Frame::empty(), Frame::empty_last()] {
            let bytes = frame.encode();
            assert_eq!(bytes.len(), 1);
            assert_eq!(bytes[0], frame.frame_type as u8);
            assert_eq!(frame.wire_len(), 1);
        }
    }

    #[test]
    fn test_roundtrip_all_surfaced_types() {
        let frames = [
            Frame::ping(),
            Frame::empty(),
            Frame::empty_last(),
            Frame::more(Bytes::from_static(b"abc")),
            Frame::last(Bytes::from_static(b"defg")),
            Frame::command(Bytes::from_static(b"ctl")),
        ];
        for frame in &frames {
            assert_eq!(&roundtrip(frame), frame);
        }
    }

    #[test]
    fn test_validate_rejects_zero_length_data_frame() {
        let frame = Frame {
            frame_type: FrameType::More,
            data: Bytes::new(),
        };
        assert!(matches!(
            frame.validate(MAX),
            Err(WireError::InvalidFrame(_))
        ));
    }

    #[test]
    fn test_validate_rejects_oversized_payload() {
        let frame = Frame::last(Bytes::from(vec![0u8; MAX + 1]));
        assert!(matches!(
            frame.validate(MAX),
            Err(WireError::InvalidFrame(_))
        ));
    }

    #[test]
    fn test_validate_accepts_max_payload() {
        let frame = Frame::last(Bytes::from(vec![0u8; MAX]));
        assert!(frame.validate(MAX).is_ok());
    }

    #[test]
    fn test_terminal_classification() {
        assert!(FrameType::Last.is_terminal());
        assert!(FrameType::EmptyLast.is_terminal());
        assert!(FrameType::Command.is_terminal());
        assert!(!FrameType::More.is_terminal());
        assert!(!FrameType::Empty.is_terminal());
        assert!(!FrameType::Ping.is_terminal());
    }
}
