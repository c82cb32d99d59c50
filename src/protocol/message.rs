//! Messages: ordered frame sequences with an explicit terminator.
//!
//! Every interior frame of a message is `More` (or `Empty`). The terminal
//! frame decides the channel: `Last`/`EmptyLast` end an application data
//! message, `Command` ends a transport control message (handshake or RPC
//! traffic, routed by handler id). A data message with an empty payload is
//! a single `EmptyLast` frame. Messages are immutable once enqueued on a
//! mailbox.

use bytes::{Bytes, BytesMut};

use super::frame::{Frame, FrameType};

/// An ordered sequence of frames terminated by `Last` or `EmptyLast`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    frames: Vec<Frame>,
}

impl Message {
    /// Empty, in-progress message awaiting frames.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a data message from a payload, chunked to the frame limit.
    ///
    /// An empty payload becomes a lone `EmptyLast`; otherwise the payload
    /// is split into `More` frames with a final `Last`.
    pub fn from_payload(mut payload: Bytes, max_frame_data: usize) -> Self {
        if payload.is_empty() {
            return Self {
                frames: vec![Frame::empty_last()],
            };
        }

        let mut frames = Vec::with_capacity(payload.len().div_ceil(max_frame_data));
        while payload.len() > max_frame_data {
            frames.push(Frame::more(payload.split_to(max_frame_data)));
        }
        frames.push(Frame::last(payload));
        Self { frames }
    }

    /// Build a control message from a payload, chunked to the frame limit
    /// and terminated by a `Command` frame. `payload` must not be empty;
    /// its first byte is the handler id.
    pub fn control(mut payload: Bytes, max_frame_data: usize) -> Self {
        debug_assert!(!payload.is_empty(), "control payload carries a handler id");

        let mut frames = Vec::with_capacity(payload.len().div_ceil(max_frame_data));
        while payload.len() > max_frame_data {
            frames.push(Frame::more(payload.split_to(max_frame_data)));
        }
        frames.push(Frame::command(payload));
        Self { frames }
    }

    /// Single-frame message; the frame must be terminal.
    pub fn single(frame: Frame) -> Self {
        debug_assert!(frame.frame_type.is_terminal());
        Self {
            frames: vec![frame],
        }
    }

    /// Append a frame during assembly.
    pub fn push(&mut self, frame: Frame) {
        debug_assert!(!self.is_complete(), "message already terminated");
        self.frames.push(frame);
    }

    /// Whether the terminal frame has arrived.
    #[inline]
    pub fn is_complete(&self) -> bool {
        self.frames
            .last()
            .is_some_and(|f| f.frame_type.is_terminal())
    }

    /// Whether this is a control message (`Command`-terminated).
    #[inline]
    pub fn is_control(&self) -> bool {
        self.frames
            .last()
            .is_some_and(|f| f.frame_type == FrameType::Command)
    }

    /// Number of frames.
    #[inline]
    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    /// Whether no frames have been appended yet.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Total wire bytes across all frames.
    #[inline]
    pub fn size(&self) -> usize {
        self.frames.iter().map(Frame::wire_len).sum()
    }

    /// The frames in wire order.
    #[inline]
    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    /// Concatenated payload across all frames.
    ///
    /// Zero-copy for the common single-frame case.
    pub fn payload(&self) -> Bytes {
        match self.frames.as_slice() {
            [one] => one.data.clone(),
            many => {
                let total = many.iter().map(|f| f.data.len()).sum();
                let mut buf = BytesMut::with_capacity(total);
                for frame in many {
                    buf.extend_from_slice(&frame.data);
                }
                buf.freeze()
            }
        }
    }

    /// Encode every frame into `buf` in wire order.
    pub fn encode_into(&self, buf: &mut BytesMut) {
        for frame in &self.frames {
            frame.encode_into(buf);
        }
    }

    /// Check the interior/terminal frame-type invariant.
    pub fn is_well_formed(&self) -> bool {
        let Some((terminal, interior)) = self.frames.split_last() else {
            return false;
        };
        terminal.frame_type.is_terminal()
            && interior
                .iter()
                .all(|f| matches!(f.frame_type, FrameType::More | FrameType::Empty))
    }
}

impl From<Bytes> for Message {
    /// Chunk with the default 16 KiB frame buffer.
    fn from(payload: Bytes) -> Self {
        Message::from_payload(payload, crate::config::DEFAULT_BUFFER_SIZE - 3)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_payload_is_lone_empty_last() {
        let msg = Message::from_payload(Bytes::new(), 100);
        assert_eq!(msg.frame_count(), 1);
        assert_eq!(msg.frames()[0].frame_type, FrameType::EmptyLast);
        assert!(msg.is_complete());
        assert!(msg.is_well_formed());
        assert_eq!(msg.payload().len(), 0);
    }

    #[test]
    fn test_small_payload_is_single_last() {
        let msg = Message::from_payload(Bytes::from_static(b"hello"), 100);
        assert_eq!(msg.frame_count(), 1);
        assert_eq!(msg.frames()[0].frame_type, FrameType::Last);
        assert_eq!(&msg.payload()[..], b"hello");
    }

    #[test]
    fn test_large_payload_chunked() {
        let payload: Vec<u8> = (0..250u8).collect();
        let msg = Message::from_payload(Bytes::from(payload.clone()), 100);

        assert_eq!(msg.frame_count(), 3);
        assert_eq!(msg.frames()[0].frame_type, FrameType::More);
        assert_eq!(msg.frames()[0].data.len(), 100);
        assert_eq!(msg.frames()[1].frame_type, FrameType::More);
        assert_eq!(msg.frames()[2].frame_type, FrameType::Last);
        assert_eq!(msg.frames()[2].data.len(), 50);
        assert_eq!(&msg.payload()[..], &payload[..]);
        assert!(msg.is_well_formed());
    }

    #[test]
    fn test_exact_multiple_chunking() {
        let msg = Message::from_payload(Bytes::from(vec![7u8; 200]), 100);
        // The final chunk is always the Last frame, never an extra empty.
        assert_eq!(msg.frame_count(), 2);
        assert_eq!(msg.frames()[1].frame_type, FrameType::Last);
        assert_eq!(msg.frames()[1].data.len(), 100);
    }

    #[test]
    fn test_incremental_assembly() {
        let mut msg = Message::new();
        assert!(!msg.is_complete());

        msg.push(Frame::more(Bytes::from_static(b"ab")));
        assert!(!msg.is_complete());

        msg.push(Frame::last(Bytes::from_static(b"cd")));
        assert!(msg.is_complete());
        assert_eq!(&msg.payload()[..], b"abcd");
    }

    #[test]
    fn test_size_counts_wire_bytes() {
        let mut msg = Message::new();
        msg.push(Frame::more(Bytes::from_static(b"abc"))); // 3 + 3
        msg.push(Frame::empty_last()); // 1
        assert_eq!(msg.size(), 7);
    }

    #[test]
    fn test_control_message_single_frame() {
        let msg = Message::control(Bytes::from_static(&[2, b'{', b'}']), 100);
        assert_eq!(msg.frame_count(), 1);
        assert_eq!(msg.frames()[0].frame_type, FrameType::Command);
        assert!(msg.is_control());
        assert!(msg.is_complete());
        assert!(msg.is_well_formed());
    }

    #[test]
    fn test_control_message_chunked() {
        let payload: Vec<u8> = (0..250u8).collect();
        let msg = Message::control(Bytes::from(payload.clone()), 100);

        assert_eq!(msg.frame_count(), 3);
        assert_eq!(msg.frames()[0].frame_type, FrameType::More);
        assert_eq!(msg.frames()[1].frame_type, FrameType::More);
        assert_eq!(msg.frames()[2].frame_type, FrameType::Command);
        assert!(msg.is_control());
        assert_eq!(&msg.payload()[..], &payload[..]);
    }

    #[test]
    fn test_data_message_is_not_control() {
        assert!(!Message::from_payload(Bytes::from_static(b"data"), 100).is_control());
        assert!(!Message::from_payload(Bytes::new(), 100).is_control());
    }

    #[test]
    fn test_well_formed_rejects_interior_terminal() {
        let msg = Message {
            frames: vec![
                Frame::last(Bytes::from_static(b"x")),
                Frame::last(Bytes::from_static(b"y")),
            ],
        };
        assert!(!msg.is_well_formed());
    }

    #[test]
    fn test_well_formed_allows_empty_interior() {
        let mut msg = Message::new();
        msg.push(Frame::empty());
        msg.push(Frame::empty_last());
        assert!(msg.is_well_formed());
    }

    #[test]
    fn test_encode_into_concatenates_frames() {
        let msg = Message::from_payload(Bytes::from(vec![1u8; 150]), 100);
        let mut buf = BytesMut::new();
        msg.encode_into(&mut buf);
        // More(100): 3 + 100, Last(50): 3 + 50.
        assert_eq!(buf.len(), 156);
        assert_eq!(buf[0], FrameType::More as u8);
        assert_eq!(buf[103], FrameType::Last as u8);
    }
}
