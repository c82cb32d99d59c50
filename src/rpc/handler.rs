//! Per-session RPC endpoint: call dispatch and return correlation.
//!
//! One endpoint is installed per session and receives every control
//! message carrying the RPC handler id. Three routes:
//!
//! - **Calls** resolve against the frozen service tables and run on a
//!   spawned task, so a slow method never blocks mailbox I/O. Failures
//!   (unknown service/method, argument mismatch, the method erroring) go
//!   back as a `MethodException` when the caller expects a return, and are
//!   logged otherwise.
//! - **Returns and exceptions** resolve the local wait table; ids with no
//!   waiter (cancelled or timed out calls) are dropped silently.
//! - **Cancels** trip the token of the still-running method they name.

use std::sync::Arc;

use bytes::Bytes;

use super::service::{CallArgs, ServiceRegistry};
use super::wait::{CancelTable, RpcOutcome, WaitTable};
use super::wire::RpcMessage;
use crate::cancel::CancelToken;
use crate::error::{CloseReason, RemoteException, WireError};
use crate::protocol::Message;
use crate::session::{MessageSink, Session};

/// Per-session RPC state: services to dispatch against, the
/// local-originated wait table and the remote-originated cancel table.
pub struct RpcEndpoint {
    services: Arc<ServiceRegistry>,
    waits: WaitTable,
    remote_cancels: CancelTable,
}

impl RpcEndpoint {
    pub fn new(services: Arc<ServiceRegistry>) -> Arc<Self> {
        Arc::new(Self {
            services,
            waits: WaitTable::new(),
            remote_cancels: CancelTable::new(),
        })
    }

    /// The local-originated wait table (proxies allocate from it).
    #[inline]
    pub fn waits(&self) -> &WaitTable {
        &self.waits
    }

    /// Tokens of methods currently executing for the peer.
    #[inline]
    pub fn remote_cancels(&self) -> &CancelTable {
        &self.remote_cancels
    }

    fn route(self: &Arc<Self>, session: &Arc<Session>, message: RpcMessage) {
        match message {
            RpcMessage::Call {
                return_id,
                service,
                method,
                args,
            } => self.invoke(session, Some(return_id), service, method, args),
            RpcMessage::CallNoReturn {
                service,
                method,
                args,
            } => self.invoke(session, None, service, method, args),
            RpcMessage::Return { return_id, value } => {
                if !self.waits.complete(return_id, RpcOutcome::Return(value)) {
                    tracing::trace!(return_id, "return for unknown id dropped");
                }
            }
            RpcMessage::Exception {
                return_id,
                exception,
            } => {
                if !self
                    .waits
                    .complete(return_id, RpcOutcome::Exception(exception))
                {
                    tracing::trace!(return_id, "exception for unknown id dropped");
                }
            }
            RpcMessage::Cancel { return_id } => {
                if !self.remote_cancels.cancel(return_id) {
                    tracing::trace!(return_id, "cancel for unknown id dropped");
                }
            }
        }
    }

    fn invoke(
        self: &Arc<Self>,
        session: &Arc<Session>,
        return_id: Option<u16>,
        service: String,
        method: String,
        args: Vec<Bytes>,
    ) {
        if !session.is_ready() {
            self.reject(
                session,
                return_id,
                RemoteException::new("NotAuthenticated", "session is not authenticated"),
            );
            return;
        }

        let Some(svc) = self.services.get(&service) else {
            self.reject(
                session,
                return_id,
                RemoteException::new(
                    "UnknownService",
                    WireError::UnknownService(service).to_string(),
                ),
            );
            return;
        };
        let Some(entry) = svc.entry(&method) else {
            self.reject(
                session,
                return_id,
                RemoteException::new(
                    "UnknownMethod",
                    WireError::UnknownMethod { service, method }.to_string(),
                ),
            );
            return;
        };
        if args.len() != entry.arity() as usize {
            self.reject(
                session,
                return_id,
                RemoteException::new(
                    "ArgumentError",
                    format!(
                        "{service}.{method} takes {} arguments, got {}",
                        entry.arity(),
                        args.len()
                    ),
                ),
            );
            return;
        }

        let token = entry.wants_cancel().then(CancelToken::new);
        if let (Some(id), Some(token)) = (return_id, token.as_ref()) {
            self.remote_cancels.insert(id, token.clone());
        }

        let invocation = entry.invoke(CallArgs::new(args), token);
        let endpoint = Arc::clone(self);
        let session = Arc::clone(session);
        tokio::spawn(async move {
            let outcome = invocation.await;

            let Some(id) = return_id else {
                if let Err(err) = outcome {
                    tracing::debug!(
                        error = %err.message,
                        "fire-and-forget method failed"
                    );
                }
                return;
            };
            endpoint.remote_cancels.remove(id);

            let response = match outcome {
                Ok(value) => RpcMessage::Return {
                    return_id: id,
                    value,
                },
                Err(err) => RpcMessage::Exception {
                    return_id: id,
                    exception: err.into_exception(),
                },
            };
            if let Err(err) = session.post_control(response.encode()) {
                tracing::debug!(%err, "could not post RPC response");
            }
        });
    }

    /// Send a failure back to the caller, or just log it for
    /// fire-and-forget calls.
    fn reject(
        &self,
        session: &Arc<Session>,
        return_id: Option<u16>,
        exception: RemoteException,
    ) {
        match return_id {
            Some(id) => {
                let response = RpcMessage::Exception {
                    return_id: id,
                    exception,
                };
                if let Err(err) = session.post_control(response.encode()) {
                    tracing::debug!(%err, "could not post RPC exception");
                }
            }
            None => tracing::debug!(%exception, "fire-and-forget call rejected"),
        }
    }
}

impl MessageSink for RpcEndpoint {
    fn deliver(&self, session: &Arc<Session>, message: Message) {
        // Arc round-trip so spawned invocations can hold the endpoint.
        let Some(endpoint) = session.rpc().cloned() else {
            tracing::error!(session = %session.id(), "RPC message on a session without an endpoint");
            session.close(CloseReason::ProtocolError);
            return;
        };

        match RpcMessage::decode(&message.payload()) {
            Ok(decoded) => endpoint.route(session, decoded),
            Err(err) => {
                tracing::warn!(session = %session.id(), %err, "malformed RPC message");
                session.close(CloseReason::ProtocolError);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::codec::FieldCodec;
    use crate::rpc::service::{reply, Service};

    #[test]
    fn test_endpoint_tables_start_empty() {
        let endpoint = RpcEndpoint::new(ServiceRegistry::new().freeze());
        assert!(endpoint.waits().is_empty());
        assert_eq!(endpoint.remote_cancels().len(), 0);
    }

    #[test]
    fn test_return_resolves_wait() {
        let endpoint = RpcEndpoint::new(ServiceRegistry::new().freeze());
        let (id, mut rx) = endpoint.waits().allocate().unwrap();

        let value = FieldCodec::encode(&5i32, 0).unwrap();
        assert!(endpoint
            .waits()
            .complete(id, RpcOutcome::Return(value)));
        assert!(matches!(rx.try_recv().unwrap(), RpcOutcome::Return(_)));
        assert!(endpoint.waits().is_empty());
    }

    #[tokio::test]
    async fn test_route_return_unknown_id_is_silent() {
        let endpoint = RpcEndpoint::new(ServiceRegistry::new().freeze());
        // No waiter allocated; nothing must panic or linger.
        let value = FieldCodec::encode(&1i32, 0).unwrap();
        assert!(!endpoint.waits().complete(4242, RpcOutcome::Return(value)));
    }

    #[test]
    fn test_registry_shared_across_endpoints() {
        let mut registry = ServiceRegistry::new();
        registry.register(Service::new("Echo").method("Ping", 0, |_args| async move {
            reply(&"pong")
        }));
        let registry = registry.freeze();

        let a = RpcEndpoint::new(Arc::clone(&registry));
        let b = RpcEndpoint::new(registry);
        assert!(a.services.get("Echo").is_some());
        assert!(b.services.get("Echo").is_some());
    }
}
