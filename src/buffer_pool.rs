//! Shared pool of socket read buffers.
//!
//! Sized for two buffers per allowed connection. Leases fall back to a
//! fresh allocation when the pool runs dry, so exhaustion degrades to an
//! allocation instead of an error. Buffers come back cleared on release.

use std::sync::{Arc, Mutex};

use bytes::BytesMut;

/// Fixed-capacity pool of equally sized `BytesMut` buffers.
pub struct BufferPool {
    free: Mutex<Vec<BytesMut>>,
    buffer_size: usize,
    capacity: usize,
}

impl BufferPool {
    /// Pool for `max_connections` sessions, two buffers each.
    pub fn new(max_connections: usize, buffer_size: usize) -> Arc<Self> {
        let capacity = 2 * max_connections;
        Arc::new(Self {
            free: Mutex::new(Vec::with_capacity(capacity)),
            buffer_size,
            capacity,
        })
    }

    /// Size of each pooled buffer.
    #[inline]
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Take a cleared buffer of `buffer_size` capacity.
    pub fn acquire(&self) -> BytesMut {
        if let Some(buf) = self.free.lock().unwrap().pop() {
            return buf;
        }
        tracing::debug!(size = self.buffer_size, "buffer pool dry, allocating");
        BytesMut::with_capacity(self.buffer_size)
    }

    /// Return a buffer to the pool. Dropped if the pool is full.
    pub fn release(&self, mut buf: BytesMut) {
        buf.clear();
        let mut free = self.free.lock().unwrap();
        if free.len() < self.capacity {
            free.push(buf);
        }
    }

    /// Buffers currently sitting in the pool.
    pub fn available(&self) -> usize {
        self.free.lock().unwrap().len()
    }
}
