//! Connection and scheduler configuration.
//!
//! A single [`Config`] is shared by server and client. The frame payload
//! limit is derived from the socket buffer size: `max_frame_data` is
//! `frame_buffer_size - 3`, leaving room for a data frame's 3-byte header
//! inside one socket buffer.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use crate::error::{Result, WireError};
use crate::protocol::FRAME_HEADER_LEN;

/// Default per-socket send/receive buffer size (16 KiB).
pub const DEFAULT_BUFFER_SIZE: usize = 16 * 1024;

/// Default server-side session cap.
pub const DEFAULT_MAX_CONNECTIONS: usize = 1000;

/// Default accept backlog.
pub const DEFAULT_LISTENER_BACKLOG: u32 = 100;

/// Default send deadline.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_millis(5000);

/// Default handshake deadline.
pub const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_millis(60_000);

/// Default cap on reader workers (writers have the same cap).
pub const DEFAULT_MAX_READ_WRITE_WORKERS: usize = 20;

/// Number of reader (and writer) workers started before the supervisor
/// grows the pool.
pub const DEFAULT_INITIAL_WORKERS: usize = 2;

/// Configuration for a postwire endpoint.
#[derive(Debug, Clone)]
pub struct Config {
    /// Bind/connect address.
    pub ip: IpAddr,
    /// Bind/connect port.
    pub port: u16,
    /// Server-side session cap.
    pub max_connections: usize,
    /// Accept backlog.
    pub listener_backlog: u32,
    /// Per-socket send/receive buffer size.
    pub send_and_receive_buffer_size: usize,
    /// Frame buffer size; `max_frame_data` is this minus the frame header.
    pub frame_buffer_size: usize,
    /// Send deadline for a single socket write.
    pub send_timeout: Duration,
    /// Handshake deadline.
    pub connection_timeout: Duration,
    /// Client ping interval; `Duration::ZERO` disables.
    pub ping_frequency: Duration,
    /// Server idle disconnect threshold; `Duration::ZERO` disables.
    pub ping_timeout: Duration,
    /// Cap on reader workers and on writer workers.
    pub max_read_write_workers: usize,
    /// Workers started per direction before the supervisor grows the pool.
    pub initial_read_write_workers: usize,
    /// Whether the postmaster supervisor may grow the worker pools.
    pub adaptive_workers: bool,
    /// Enforce authentication on the server.
    pub require_authentication: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 0,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            listener_backlog: DEFAULT_LISTENER_BACKLOG,
            send_and_receive_buffer_size: DEFAULT_BUFFER_SIZE,
            frame_buffer_size: DEFAULT_BUFFER_SIZE,
            send_timeout: DEFAULT_SEND_TIMEOUT,
            connection_timeout: DEFAULT_CONNECTION_TIMEOUT,
            ping_frequency: Duration::ZERO,
            ping_timeout: Duration::ZERO,
            max_read_write_workers: DEFAULT_MAX_READ_WRITE_WORKERS,
            initial_read_write_workers: DEFAULT_INITIAL_WORKERS,
            adaptive_workers: true,
            require_authentication: false,
        }
    }
}

impl Config {
    /// Create a configuration for the given address with defaults.
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self {
            ip,
            port,
            ..Self::default()
        }
    }

    /// Socket address this endpoint binds or connects to.
    #[inline]
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    /// Maximum payload bytes a single data frame may carry.
    #[inline]
    pub fn max_frame_data(&self) -> usize {
        self.frame_buffer_size - FRAME_HEADER_LEN
    }

    /// High-water mark for unparsed inbound bytes; the read task pauses
    /// above this.
    #[inline]
    pub fn inbound_high_water(&self) -> usize {
        2 * self.send_and_receive_buffer_size
    }

    /// Validate internal invariants.
    pub fn validate(&self) -> Result<()> {
        if self.frame_buffer_size <= FRAME_HEADER_LEN
            || self.send_and_receive_buffer_size <= FRAME_HEADER_LEN
        {
            return Err(WireError::Protocol(format!(
                "buffer sizes must exceed the {FRAME_HEADER_LEN}-byte frame header"
            )));
        }
        if self.max_frame_data() > self.send_and_receive_buffer_size - FRAME_HEADER_LEN {
            return Err(WireError::Protocol(format!(
                "max_frame_data {} exceeds buffer size {} minus header",
                self.max_frame_data(),
                self.send_and_receive_buffer_size
            )));
        }
        if self.max_frame_data() > u16::MAX as usize - FRAME_HEADER_LEN {
            return Err(WireError::Protocol(
                "max_frame_data exceeds the u16 length field".to_string(),
            ));
        }
        if self.max_read_write_workers == 0 || self.initial_read_write_workers == 0 {
            return Err(WireError::Protocol(
                "worker counts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Builder-style setter for the port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Builder-style setter for both buffer sizes.
    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.send_and_receive_buffer_size = size;
        self.frame_buffer_size = size;
        self
    }

    /// Builder-style setter for the ping interval.
    pub fn with_ping_frequency(mut self, interval: Duration) -> Self {
        self.ping_frequency = interval;
        self
    }

    /// Builder-style setter for the idle disconnect threshold.
    pub fn with_ping_timeout(mut self, threshold: Duration) -> Self {
        self.ping_timeout = threshold;
        self
    }

    /// Builder-style setter for authentication enforcement.
    pub fn with_authentication(mut self, required: bool) -> Self {
        self.require_authentication = required;
        self
    }
}
