//! Caller-side service stub.
//!
//! A [`Proxy`] is bound to one session and one remote service name. Each
//! call packages `(service, method, args)` into a call message, blocks on
//! the wait handle allocated for its `return_id`, and decodes whatever
//! comes back. Cancellation is cooperative: tripping the caller's token
//! puts a cancel message on the wire and fails the call locally.
//!
//! # Example
//!
//! ```ignore
//! let calculator = client.proxy("Calculator");
//! let sum: i64 = calculator
//!     .call("Add", Args::new().arg(&100)?.arg(&200)?, None)
//!     .await?;
//! ```

use std::sync::Arc;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::codec::FieldCodec;
use super::wait::RpcOutcome;
use super::wire::RpcMessage;
use crate::cancel::CancelToken;
use crate::error::{Result, WireError};
use crate::session::Session;

/// Positional argument pack for one call.
#[derive(Debug, Clone, Default)]
pub struct Args {
    fields: Vec<Bytes>,
}

impl Args {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append the next positional argument; the field index is the
    /// argument's position.
    pub fn arg<T: Serialize>(mut self, value: &T) -> Result<Self> {
        let index = self.fields.len();
        if index > u8::MAX as usize {
            return Err(WireError::Protocol("more than 255 arguments".to_string()));
        }
        self.fields.push(FieldCodec::encode(value, index as u8)?);
        Ok(self)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    fn into_fields(self) -> Vec<Bytes> {
        self.fields
    }
}

/// Client-side stub for one remote service.
pub struct Proxy {
    session: Arc<Session>,
    service: String,
}

impl Proxy {
    pub fn new(session: Arc<Session>, service: String) -> Self {
        Self { session, service }
    }

    /// The remote service name this proxy targets.
    #[inline]
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Call a remote method and wait for its return value.
    ///
    /// Fails with `NotAuthenticated` before the handshake completes, with
    /// `Cancelled` when `token` trips first (a cancel message is sent),
    /// with `Timeout` when the wait resolves without a payload, and
    /// re-raises a `RemoteException` when the method threw.
    pub async fn call<R: DeserializeOwned>(
        &self,
        method: &str,
        args: Args,
        token: Option<&CancelToken>,
    ) -> Result<R> {
        let endpoint = self.endpoint()?;
        let (return_id, receiver) = endpoint.waits().allocate()?;

        let call = RpcMessage::Call {
            return_id,
            service: self.service.clone(),
            method: method.to_string(),
            args: args.into_fields(),
        };
        if let Err(err) = self.session.post_control(call.encode()) {
            endpoint.waits().remove(return_id);
            return Err(err);
        }

        let outcome = match token {
            Some(token) => {
                tokio::select! {
                    outcome = receiver => outcome,
                    _ = token.cancelled() => {
                        endpoint.waits().remove(return_id);
                        let cancel = RpcMessage::Cancel { return_id };
                        if let Err(err) = self.session.post_control(cancel.encode()) {
                            tracing::debug!(%err, "could not post cancel");
                        }
                        return Err(WireError::Cancelled);
                    }
                }
            }
            None => receiver.await,
        };

        match outcome {
            Ok(RpcOutcome::Return(value)) => FieldCodec::decode(&value, 0),
            Ok(RpcOutcome::Exception(exception)) => Err(WireError::Remote(exception)),
            // Slot dropped without a payload: session closed or the wait
            // was torn down under us.
            Err(_) => Err(WireError::Timeout),
        }
    }

    /// Fire-and-forget call; no wait handle is allocated.
    pub async fn notify(&self, method: &str, args: Args) -> Result<()> {
        self.endpoint()?;
        let call = RpcMessage::CallNoReturn {
            service: self.service.clone(),
            method: method.to_string(),
            args: args.into_fields(),
        };
        self.session.post_control(call.encode())
    }

    fn endpoint(&self) -> Result<Arc<super::RpcEndpoint>> {
        if !self.session.is_ready() {
            return Err(WireError::NotAuthenticated);
        }
        self.session
            .rpc()
            .cloned()
            .ok_or(WireError::NotAuthenticated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_assign_positional_indices() {
        let args = Args::new()
            .arg(&1i32)
            .unwrap()
            .arg(&"two")
            .unwrap()
            .arg(&3.0f64)
            .unwrap();

        assert_eq!(args.len(), 3);
        for (index, field) in args.fields.iter().enumerate() {
            assert_eq!(field[0], index as u8);
        }
    }

    #[test]
    fn test_args_empty() {
        let args = Args::new();
        assert!(args.is_empty());
        assert!(args.into_fields().is_empty());
    }

    #[test]
    fn test_args_decode_back() {
        let args = Args::new().arg(&42i64).unwrap();
        let fields = args.into_fields();
        let value: i64 = FieldCodec::decode(&fields[0], 0).unwrap();
        assert_eq!(value, 42);
    }
}
