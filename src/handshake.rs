//! Handshake and authentication.
//!
//! Handshake envelopes ride the control channel (`Command`-terminated
//! messages) under their own handler id, with JSON bodies; the data plane
//! stays binary:
//!
//! 1. On connect the server posts [`ServerInfo`] as its first message.
//! 2. With authentication required, the client answers with
//!    [`Authenticate`] and both sides arm a `connection_timeout` deadline.
//! 3. The server's [`AuthVerifier`] decides; the client receives an
//!    [`AuthenticationResult`] either way, and a rejection closes both
//!    sides with an authentication-failure reason.
//!
//! Only after this exchange is a session ready and RPC traffic permitted.
//! With authentication disabled both sides are ready right after
//! `ServerInfo`.

use std::sync::{Arc, Mutex, OnceLock};

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::{CloseReason, Result, WireError};
use crate::postmaster::BoxFuture;
use crate::protocol::Message;
use crate::rpc::HANDLER_HANDSHAKE;
use crate::session::{MessageSink, Session};

/// Wire protocol version exchanged in [`ServerInfo`].
pub const PROTOCOL_VERSION: u16 = 1;

const KIND_SERVER_INFO: u8 = 1;
const KIND_AUTHENTICATE: u8 = 2;
const KIND_AUTH_RESULT: u8 = 3;

/// First message a server sends on every new session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub version: u16,
    pub message: String,
    pub require_authentication: bool,
}

/// Client credentials, opaque to the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Authenticate {
    pub auth_data: Vec<u8>,
}

/// Verifier verdict reported back to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthenticationResult {
    pub authenticated: bool,
}

/// A decoded handshake envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum HandshakeMessage {
    ServerInfo(ServerInfo),
    Authenticate(Authenticate),
    Result(AuthenticationResult),
}

impl HandshakeMessage {
    /// Encode to a message payload, handler and kind bytes included.
    pub fn encode(&self) -> Result<Bytes> {
        let (kind, body) = match self {
            HandshakeMessage::ServerInfo(info) => (KIND_SERVER_INFO, serde_json::to_vec(info)?),
            HandshakeMessage::Authenticate(auth) => {
                (KIND_AUTHENTICATE, serde_json::to_vec(auth)?)
            }
            HandshakeMessage::Result(result) => (KIND_AUTH_RESULT, serde_json::to_vec(result)?),
        };
        let mut buf = BytesMut::with_capacity(2 + body.len());
        buf.put_u8(HANDLER_HANDSHAKE);
        buf.put_u8(kind);
        buf.extend_from_slice(&body);
        Ok(buf.freeze())
    }

    /// Decode from a message payload.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        if payload.len() < 2 || payload[0] != HANDLER_HANDSHAKE {
            return Err(WireError::Protocol("malformed handshake envelope".to_string()));
        }
        let body = &payload[2..];
        match payload[1] {
            KIND_SERVER_INFO => Ok(HandshakeMessage::ServerInfo(serde_json::from_slice(body)?)),
            KIND_AUTHENTICATE => {
                Ok(HandshakeMessage::Authenticate(serde_json::from_slice(body)?))
            }
            KIND_AUTH_RESULT => Ok(HandshakeMessage::Result(serde_json::from_slice(body)?)),
            kind => Err(WireError::Protocol(format!(
                "unknown handshake kind {kind}"
            ))),
        }
    }
}

/// Decides whether a client's credentials are acceptable.
pub trait AuthVerifier: Send + Sync {
    fn verify(&self, auth_data: Vec<u8>) -> BoxFuture<'static, bool>;
}

struct FnVerifier<F>(F);

impl<F> AuthVerifier for FnVerifier<F>
where
    F: Fn(&[u8]) -> bool + Send + Sync,
{
    fn verify(&self, auth_data: Vec<u8>) -> BoxFuture<'static, bool> {
        let verdict = (self.0)(&auth_data);
        Box::pin(async move { verdict })
    }
}

/// Wrap a synchronous predicate as a verifier.
pub fn verifier_fn<F>(f: F) -> Arc<dyn AuthVerifier>
where
    F: Fn(&[u8]) -> bool + Send + Sync + 'static,
{
    Arc::new(FnVerifier(f))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServerPhase {
    AwaitingAuth,
    Done,
}

/// Server side of the handshake, installed per session.
pub struct ServerHandshake {
    verifier: Option<Arc<dyn AuthVerifier>>,
    phase: Mutex<ServerPhase>,
}

impl ServerHandshake {
    /// Install on a fresh server session: registers the sink, posts
    /// `ServerInfo`, and arms the authentication deadline when required.
    pub fn install(
        session: &Arc<Session>,
        greeting: String,
        verifier: Option<Arc<dyn AuthVerifier>>,
    ) -> Result<()> {
        let require_auth = session.config().require_authentication;
        let handshake = Arc::new(Self {
            verifier,
            phase: Mutex::new(if require_auth {
                ServerPhase::AwaitingAuth
            } else {
                ServerPhase::Done
            }),
        });
        session.set_handler(HANDLER_HANDSHAKE, handshake);

        let info = HandshakeMessage::ServerInfo(ServerInfo {
            version: PROTOCOL_VERSION,
            message: greeting,
            require_authentication: require_auth,
        });
        session.post_control(info.encode()?)?;

        if require_auth {
            let deadline = session.config().connection_timeout;
            let session = Arc::clone(session);
            tokio::spawn(async move {
                tokio::time::sleep(deadline).await;
                if !session.is_ready() && !session.is_closed() {
                    tracing::debug!(session = %session.id(), "authentication deadline expired");
                    session.close(CloseReason::AuthenticationFailure);
                }
            });
        } else {
            session.set_ready();
        }
        Ok(())
    }

    fn handle_authenticate(&self, session: &Arc<Session>, auth: Authenticate) {
        {
            let mut phase = self.phase.lock().unwrap();
            if *phase != ServerPhase::AwaitingAuth {
                tracing::warn!(session = %session.id(), "unexpected authenticate");
                session.close(CloseReason::ProtocolError);
                return;
            }
            *phase = ServerPhase::Done;
        }

        let verifier = self.verifier.clone();
        let session = Arc::clone(session);
        tokio::spawn(async move {
            let authenticated = match verifier {
                Some(verifier) => verifier.verify(auth.auth_data).await,
                // Authentication required but no verifier registered:
                // nobody gets in.
                None => false,
            };

            let result = HandshakeMessage::Result(AuthenticationResult { authenticated });
            match result.encode() {
                Ok(payload) if authenticated => {
                    if session.post_control(payload).is_ok() {
                        session.set_ready();
                    }
                }
                Ok(payload) => {
                    // Deliver the verdict before tearing the session down;
                    // a direct send completes only once written.
                    let message =
                        Message::control(payload, session.config().max_frame_data());
                    let mut buf = BytesMut::new();
                    message.encode_into(&mut buf);
                    let _ = session.send_bytes(buf.freeze()).await;
                    session.close(CloseReason::AuthenticationFailure);
                }
                Err(err) => {
                    tracing::error!(%err, "could not encode authentication result");
                    session.close(CloseReason::AuthenticationFailure);
                }
            }
        });
    }
}

impl MessageSink for ServerHandshake {
    fn deliver(&self, session: &Arc<Session>, message: Message) {
        match HandshakeMessage::decode(&message.payload()) {
            Ok(HandshakeMessage::Authenticate(auth)) => self.handle_authenticate(session, auth),
            Ok(_) => {
                tracing::warn!(session = %session.id(), "unexpected handshake message");
                session.close(CloseReason::ProtocolError);
            }
            Err(err) => {
                tracing::warn!(session = %session.id(), %err, "malformed handshake");
                session.close(CloseReason::ProtocolError);
            }
        }
    }
}

/// Client side of the handshake, installed per session.
pub struct ClientHandshake {
    auth_data: Option<Vec<u8>>,
    server_info: OnceLock<ServerInfo>,
    auth_result: OnceLock<bool>,
    on_auth_result: Mutex<Option<Box<dyn Fn(bool) + Send + Sync>>>,
}

impl ClientHandshake {
    /// Install on a fresh client session.
    pub fn install(
        session: &Arc<Session>,
        auth_data: Option<Vec<u8>>,
        on_auth_result: Option<Box<dyn Fn(bool) + Send + Sync>>,
    ) -> Arc<Self> {
        let handshake = Arc::new(Self {
            auth_data,
            server_info: OnceLock::new(),
            auth_result: OnceLock::new(),
            on_auth_result: Mutex::new(on_auth_result),
        });
        session.set_handler(HANDLER_HANDSHAKE, Arc::clone(&handshake) as _);
        handshake
    }

    /// The server's greeting, once received.
    pub fn server_info(&self) -> Option<&ServerInfo> {
        self.server_info.get()
    }

    /// The authentication verdict, once received.
    pub fn auth_result(&self) -> Option<bool> {
        self.auth_result.get().copied()
    }

    fn handle_server_info(&self, session: &Arc<Session>, info: ServerInfo) {
        if info.version != PROTOCOL_VERSION {
            tracing::warn!(
                session = %session.id(),
                theirs = info.version,
                ours = PROTOCOL_VERSION,
                "protocol version mismatch"
            );
            session.close(CloseReason::ProtocolError);
            return;
        }
        let require_auth = info.require_authentication;
        let _ = self.server_info.set(info);

        if !require_auth {
            session.set_ready();
            return;
        }

        let Some(auth_data) = self.auth_data.clone() else {
            tracing::warn!(session = %session.id(), "server requires authentication, none configured");
            session.close(CloseReason::AuthenticationFailure);
            return;
        };

        let authenticate = HandshakeMessage::Authenticate(Authenticate { auth_data });
        match authenticate.encode() {
            Ok(payload) => {
                if session.post_control(payload).is_err() {
                    return;
                }
                let deadline = session.config().connection_timeout;
                let session = Arc::clone(session);
                tokio::spawn(async move {
                    tokio::time::sleep(deadline).await;
                    if !session.is_ready() && !session.is_closed() {
                        session.close(CloseReason::TimeOut);
                    }
                });
            }
            Err(err) => {
                tracing::error!(%err, "could not encode credentials");
                session.close(CloseReason::ApplicationError);
            }
        }
    }

    fn handle_result(&self, session: &Arc<Session>, result: AuthenticationResult) {
        let _ = self.auth_result.set(result.authenticated);
        if let Some(listener) = self.on_auth_result.lock().unwrap().as_ref() {
            listener(result.authenticated);
        }

        if result.authenticated {
            session.set_ready();
        } else {
            session.close(CloseReason::AuthenticationFailure);
        }
    }
}

impl MessageSink for ClientHandshake {
    fn deliver(&self, session: &Arc<Session>, message: Message) {
        match HandshakeMessage::decode(&message.payload()) {
            Ok(HandshakeMessage::ServerInfo(info)) => self.handle_server_info(session, info),
            Ok(HandshakeMessage::Result(result)) => self.handle_result(session, result),
            Ok(HandshakeMessage::Authenticate(_)) => {
                tracing::warn!(session = %session.id(), "authenticate sent to client");
                session.close(CloseReason::ProtocolError);
            }
            Err(err) => {
                tracing::warn!(session = %session.id(), %err, "malformed handshake");
                session.close(CloseReason::ProtocolError);
            }
        }
    }
}
