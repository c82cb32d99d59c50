//! Resumable stream parser: bytes in, frames out.
//!
//! Uses `bytes::BytesMut` for zero-copy buffer management and a two-state
//! machine for fragmented input:
//! - `WaitingForHeader`: need the type byte (plus the length field for
//!   data frames)
//! - `WaitingForPayload`: header parsed, need N more payload bytes
//!
//! Gather markers ([`FrameType::Batch`]) are validated and swallowed, so
//! the frame sequence a receiver observes is independent of how the sender
//! grouped its flushes.
//!
//! # Example
//!
//! ```
//! use postwire::protocol::{Frame, FrameBuilder};
//! use bytes::Bytes;
//!
//! let mut builder = FrameBuilder::new(1024);
//! builder.write(&Frame::last(Bytes::from_static(b"hi")).encode()).unwrap();
//! let frames = builder.frames();
//! assert_eq!(frames.len(), 1);
//! assert_eq!(&frames[0].data[..], b"hi");
//! ```

use bytes::{Buf, BytesMut};

use super::frame::{Frame, FrameType, FRAME_HEADER_LEN, GATHER_HEADER_LEN};
use crate::error::{Result, WireError};

/// Parsing state.
#[derive(Debug, Clone, Copy)]
enum State {
    /// Waiting for a complete header.
    WaitingForHeader,
    /// Header parsed, waiting for payload bytes.
    WaitingForPayload {
        frame_type: FrameType,
        remaining: usize,
    },
}

/// Accumulates incoming byte chunks and extracts complete frames.
///
/// Partial frames stay buffered between [`write`](Self::write) calls.
/// Any codec violation surfaces as `InvalidFrame`; the owning session must
/// close with a protocol-error reason.
pub struct FrameBuilder {
    /// Accumulated bytes awaiting parsing.
    buffer: BytesMut,
    /// Current parsing state.
    state: State,
    /// Maximum allowed frame payload.
    max_frame_data: usize,
    /// Parsed frames awaiting [`frames`](Self::frames).
    parsed: Vec<Frame>,
}

impl FrameBuilder {
    /// Create a builder for the given payload limit.
    ///
    /// The scratch buffer reserves room for one maximal frame.
    pub fn new(max_frame_data: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(max_frame_data + FRAME_HEADER_LEN),
            state: State::WaitingForHeader,
            max_frame_data,
            parsed: Vec::new(),
        }
    }

    /// Append a chunk and drain as many complete frames as possible into
    /// the output queue.
    pub fn write(&mut self, chunk: &[u8]) -> Result<()> {
        self.buffer.extend_from_slice(chunk);

        while let Some(frame) = self.try_extract_one()? {
            self.parsed.push(frame);
        }
        Ok(())
    }

    /// Drain the parsed-frame queue.
    pub fn frames(&mut self) -> Vec<Frame> {
        std::mem::take(&mut self.parsed)
    }

    /// Number of parsed frames not yet drained.
    #[inline]
    pub fn parsed_len(&self) -> usize {
        self.parsed.len()
    }

    /// Number of buffered bytes not yet parsed into a frame.
    #[inline]
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Try to extract a single frame.
    ///
    /// `Ok(None)` means more bytes are needed; partial input is never an
    /// error.
    fn try_extract_one(&mut self) -> Result<Option<Frame>> {
        match self.state {
            State::WaitingForHeader => {
                let Some(&type_byte) = self.buffer.first() else {
                    return Ok(None);
                };
                let frame_type = FrameType::from_u8(type_byte).ok_or_else(|| {
                    WireError::InvalidFrame(format!("unknown frame type {type_byte:#04x}"))
                })?;

                if frame_type == FrameType::Batch {
                    // Gather marker: 2-byte length describing the frames
                    // that follow. Validated, then swallowed.
                    if self.buffer.len() < GATHER_HEADER_LEN {
                        return Ok(None);
                    }
                    let declared =
                        u16::from_le_bytes([self.buffer[1], self.buffer[2]]) as usize;
                    if declared > self.max_frame_data + FRAME_HEADER_LEN {
                        return Err(WireError::InvalidFrame(format!(
                            "gather length {declared} exceeds maximum"
                        )));
                    }
                    self.buffer.advance(GATHER_HEADER_LEN);
                    return self.try_extract_one();
                }

                if !frame_type.has_payload() {
                    self.buffer.advance(1);
                    return Ok(Some(Frame {
                        frame_type,
                        data: bytes::Bytes::new(),
                    }));
                }

                if self.buffer.len() < FRAME_HEADER_LEN {
                    return Ok(None);
                }
                let data_len = u16::from_le_bytes([self.buffer[1], self.buffer[2]]) as usize;
                if data_len == 0 {
                    return Err(WireError::InvalidFrame(format!(
                        "zero-length {frame_type:?} frame"
                    )));
                }
                if data_len > self.max_frame_data {
                    return Err(WireError::InvalidFrame(format!(
                        "payload {data_len} exceeds maximum {}",
                        self.max_frame_data
                    )));
                }

                self.buffer.advance(FRAME_HEADER_LEN);
                self.state = State::WaitingForPayload {
                    frame_type,
                    remaining: data_len,
                };
                self.try_extract_one()
            }

            State::WaitingForPayload {
                frame_type,
                remaining,
            } => {
                if self.buffer.len() < remaining {
                    return Ok(None);
                }

                let data = self.buffer.split_to(remaining).freeze();
                self.state = State::WaitingForHeader;
                Ok(Some(Frame { frame_type, data }))
            }
        }
    }

    /// Discard buffered bytes and reset state.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.parsed.clear();
        self.state = State::WaitingForHeader;
    }
}
