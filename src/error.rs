//! Error types for postwire.

use thiserror::Error;

/// Main error type for all postwire operations.
#[derive(Debug, Error)]
pub enum WireError {
    /// I/O error during socket operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A frame on the wire violated the protocol (unknown type, oversized
    /// payload, zero-length data frame).
    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    /// Protocol violation above the frame layer (unknown handler id,
    /// unknown RPC action, malformed message body).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// An RPC wait was cancelled by the caller's token.
    #[error("call cancelled")]
    Cancelled,

    /// An RPC wait completed without a payload, or a handshake deadline
    /// expired.
    #[error("timed out")]
    Timeout,

    /// No service registered under the requested name.
    #[error("unknown service: {0}")]
    UnknownService(String),

    /// The service exists but has no method with the requested name.
    #[error("unknown method: {service}.{method}")]
    UnknownMethod { service: String, method: String },

    /// A remote method threw; the contract travelled back over the wire.
    #[error(transparent)]
    Remote(#[from] RemoteException),

    /// An RPC call was attempted before the handshake completed.
    #[error("session is not authenticated")]
    NotAuthenticated,

    /// The server rejected the client's credentials.
    #[error("authentication failed")]
    AuthenticationFailure,

    /// The connection closed while an operation was in flight.
    #[error("connection closed")]
    ConnectionClosed,

    /// The 16-bit correlation id space is exhausted.
    #[error("too many calls in flight")]
    WaitTableFull,

    /// MessagePack serialization error (argument codec).
    #[error("encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// MessagePack deserialization error (argument codec).
    #[error("decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// JSON serialization error (handshake envelopes only).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Exception contract carried back to the caller when a remote method
/// fails. `type_name` names the remote error type, `stack` is whatever
/// diagnostic trail the remote side attached (may be empty).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{type_name}: {message}")]
pub struct RemoteException {
    pub type_name: String,
    pub message: String,
    pub stack: String,
}

impl RemoteException {
    pub fn new(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            message: message.into(),
            stack: String::new(),
        }
    }
}

/// Reason reported when a session disconnects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The client initiated an orderly shutdown.
    ClientClosing,
    /// The server initiated an orderly shutdown.
    ServerClosing,
    /// An OS-level send/recv failure.
    SocketError,
    /// A wire violation (invalid frame, unknown handler id).
    ProtocolError,
    /// An application-level failure.
    ApplicationError,
    /// Handshake verification failed or timed out.
    AuthenticationFailure,
    /// The peer went silent past the ping timeout.
    TimeOut,
}

/// Result type alias using WireError.
pub type Result<T> = std::result::Result<T, WireError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_exception_display() {
        let ex = RemoteException::new("DivideByZero", "denominator was zero");
        assert_eq!(ex.to_string(), "DivideByZero: denominator was zero");
    }

    #[test]
    fn test_remote_exception_into_wire_error() {
        let ex = RemoteException::new("Boom", "it broke");
        let err: WireError = ex.clone().into();
        assert!(matches!(err, WireError::Remote(e) if e == ex));
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe");
        let err: WireError = io.into();
        assert!(matches!(err, WireError::Io(_)));
    }
}
