//! Per-session mailbox: inbound parsing, outbound batching, back-pressure.
//!
//! A mailbox owns both directions of one session's queues and all the
//! parser/assembly state between raw socket bytes and whole messages. It
//! performs no I/O itself: the read task feeds it chunks with
//! [`enqueue_incoming`](Mailbox::enqueue_incoming), and the postmaster's
//! workers call the pure drain passes, sending whatever
//! [`drain_outbox`](Mailbox::drain_outbox) produces and delivering whatever
//! [`drain_incoming`](Mailbox::drain_incoming) completes.
//!
//! # Single-flight
//!
//! At most one reader worker and one writer worker may run a pass on a
//! mailbox at any instant. Membership is a pair of atomic flags claimed
//! with [`try_begin_read`](Mailbox::try_begin_read) /
//! [`try_begin_write`](Mailbox::try_begin_write); the postmaster releases
//! them after the pass and re-signals if work arrived meanwhile.
//!
//! # Write gathering
//!
//! A writer pass drains the outbox greedily into gather buffers. Each
//! buffer opens with the 3-byte marker `[0x00, len_lo, len_hi]` and holds
//! whole frames only; a new buffer starts when adding the next frame would
//! push the buffered frame bytes past `max_frame_data`. A single frame
//! larger than that threshold ships alone in its own buffer; frames are
//! never split.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use bytes::{Bytes, BytesMut};

use crate::error::Result;
use crate::protocol::{Frame, FrameBuilder, FrameType, Message, GATHER_HEADER_LEN};

/// Reader-side state touched only under read single-flight.
struct ParseState {
    builder: FrameBuilder,
    in_progress: Message,
}

/// Per-session inbound/outbound queues and parser state.
pub struct Mailbox {
    max_frame_data: usize,
    /// Raw inbound chunks awaiting parsing.
    inbox_bytes: Mutex<VecDeque<Bytes>>,
    /// Sum of chunk lengths in `inbox_bytes` plus the chunk being parsed.
    inbox_byte_count: AtomicUsize,
    /// Parser + assembly state.
    parse: Mutex<ParseState>,
    /// Completed inbound messages.
    inbox: Mutex<VecDeque<Message>>,
    /// Outbound messages awaiting a writer pass.
    outbox: Mutex<VecDeque<Message>>,
    /// Read single-flight flag.
    reading: AtomicBool,
    /// Write single-flight flag.
    writing: AtomicBool,
}

impl Mailbox {
    /// Create a mailbox for the given frame payload limit.
    pub fn new(max_frame_data: usize) -> Self {
        Self {
            max_frame_data,
            inbox_bytes: Mutex::new(VecDeque::new()),
            inbox_byte_count: AtomicUsize::new(0),
            parse: Mutex::new(ParseState {
                builder: FrameBuilder::new(max_frame_data),
                in_progress: Message::new(),
            }),
            inbox: Mutex::new(VecDeque::new()),
            outbox: Mutex::new(VecDeque::new()),
            reading: AtomicBool::new(false),
            writing: AtomicBool::new(false),
        }
    }

    /// Frame payload limit this mailbox batches against.
    #[inline]
    pub fn max_frame_data(&self) -> usize {
        self.max_frame_data
    }

    // ---- outbound ----------------------------------------------------

    /// Enqueue a message for transmission. FIFO across messages.
    pub fn enqueue_outgoing(&self, message: Message) {
        debug_assert!(message.is_well_formed());
        self.outbox.lock().unwrap().push_back(message);
    }

    /// Number of messages awaiting a writer pass.
    pub fn outbox_len(&self) -> usize {
        self.outbox.lock().unwrap().len()
    }

    /// Drain the outbox into gather buffers, whole frames only.
    ///
    /// Runs under write single-flight. Each returned buffer is one socket
    /// flush, marker included.
    pub fn drain_outbox(&self) -> Vec<BytesMut> {
        let drained: Vec<Message> = {
            let mut outbox = self.outbox.lock().unwrap();
            outbox.drain(..).collect()
        };
        if drained.is_empty() {
            return Vec::new();
        }

        let mut flushes = Vec::new();
        let mut gather = GatherBuffer::new(self.max_frame_data);

        for message in &drained {
            for frame in message.frames() {
                if let Some(full) = gather.push(frame) {
                    flushes.push(full);
                }
            }
        }
        if let Some(rest) = gather.finish() {
            flushes.push(rest);
        }
        flushes
    }

    // ---- inbound -----------------------------------------------------

    /// Enqueue a raw chunk from the socket.
    pub fn enqueue_incoming(&self, chunk: Bytes) {
        if chunk.is_empty() {
            return;
        }
        self.inbox_byte_count
            .fetch_add(chunk.len(), Ordering::AcqRel);
        self.inbox_bytes.lock().unwrap().push_back(chunk);
    }

    /// Unparsed inbound bytes currently held; the back-pressure input.
    #[inline]
    pub fn inbox_byte_count(&self) -> usize {
        self.inbox_byte_count.load(Ordering::Acquire)
    }

    /// Whether raw chunks await a reader pass.
    pub fn has_pending_incoming(&self) -> bool {
        !self.inbox_bytes.lock().unwrap().is_empty()
    }

    /// Parse queued chunks into frames and assemble messages.
    ///
    /// Runs under read single-flight. Returns how many messages completed
    /// in this pass; the caller raises its incoming-message event once if
    /// the count is nonzero. `Ping` frames are consumed here and never
    /// join a message; `Last`/`EmptyLast` complete a data message and
    /// `Command` completes a control message. On an `InvalidFrame` the
    /// caller must close the session.
    pub fn drain_incoming(&self) -> Result<usize> {
        let mut parse = self.parse.lock().unwrap();
        let mut completed = 0;

        loop {
            let chunk = {
                let mut chunks = self.inbox_bytes.lock().unwrap();
                match chunks.pop_front() {
                    Some(c) => c,
                    None => break,
                }
            };

            let outcome = parse.builder.write(&chunk);
            // Counted until fully parsed, not just until dequeued.
            self.inbox_byte_count
                .fetch_sub(chunk.len(), Ordering::AcqRel);
            outcome?;

            for frame in parse.builder.frames() {
                if frame.frame_type == FrameType::Ping {
                    continue;
                }
                let terminal = frame.frame_type.is_terminal();
                parse.in_progress.push(frame);
                if terminal {
                    let message = std::mem::take(&mut parse.in_progress);
                    self.inbox.lock().unwrap().push_back(message);
                    completed += 1;
                }
            }
        }

        Ok(completed)
    }

    /// Drain completed inbound messages for delivery, in wire order.
    pub fn take_inbox(&self) -> Vec<Message> {
        self.inbox.lock().unwrap().drain(..).collect()
    }

    /// Number of completed messages awaiting delivery.
    pub fn inbox_len(&self) -> usize {
        self.inbox.lock().unwrap().len()
    }

    // ---- single-flight -----------------------------------------------

    /// Whether a reader pass is scheduled or running.
    #[inline]
    pub fn read_in_flight(&self) -> bool {
        self.reading.load(Ordering::Acquire)
    }

    /// Claim the read slot. `false` means a reader pass is already
    /// scheduled or running (coalesced signal).
    #[inline]
    pub fn try_begin_read(&self) -> bool {
        self.reading
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Release the read slot after a pass.
    #[inline]
    pub fn end_read(&self) {
        self.reading.store(false, Ordering::Release);
    }

    /// Whether a writer pass is scheduled or running.
    #[inline]
    pub fn write_in_flight(&self) -> bool {
        self.writing.load(Ordering::Acquire)
    }

    /// Claim the write slot.
    #[inline]
    pub fn try_begin_write(&self) -> bool {
        self.writing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Release the write slot after a pass.
    #[inline]
    pub fn end_write(&self) {
        self.writing.store(false, Ordering::Release);
    }
}

/// Accumulates whole frames behind a gather marker.
struct GatherBuffer {
    buf: BytesMut,
    max_frame_data: usize,
}

impl GatherBuffer {
    fn new(max_frame_data: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            max_frame_data,
        }
    }

    fn open(&mut self, capacity: usize) {
        self.buf = BytesMut::with_capacity(GATHER_HEADER_LEN + capacity);
        self.buf.extend_from_slice(&[FrameType::Batch as u8, 0, 0]);
    }

    fn frame_bytes(&self) -> usize {
        self.buf.len().saturating_sub(GATHER_HEADER_LEN)
    }

    /// Add a frame; returns a sealed buffer when a flush boundary was hit
    /// before this frame.
    fn push(&mut self, frame: &Frame) -> Option<BytesMut> {
        let wire = frame.wire_len();
        let mut sealed = None;

        if self.buf.is_empty() {
            self.open(self.max_frame_data.max(wire));
        } else if self.frame_bytes() + wire > self.max_frame_data {
            sealed = self.finish();
            self.open(self.max_frame_data);
        }
        frame.encode_into(&mut self.buf);
        sealed
    }

    /// Seal the current buffer, patching the marker's length field.
    fn finish(&mut self) -> Option<BytesMut> {
        let payload = self.frame_bytes();
        if payload == 0 {
            return None;
        }
        let len = (payload as u16).to_le_bytes();
        self.buf[1] = len[0];
        self.buf[2] = len[1];
        Some(std::mem::take(&mut self.buf))
    }
}
