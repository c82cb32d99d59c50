//! Client endpoint: connect, handshake, proxies.
//!
//! A client owns one session and its own postmaster. [`ClientBuilder::connect`]
//! resolves once the handshake completes (immediately after the server's
//! greeting when authentication is off, after the verifier's verdict when
//! it is on), so a connected client is always ready for calls.
//!
//! # Example
//!
//! ```ignore
//! use postwire::{Args, ClientBuilder, Config};
//!
//! let client = ClientBuilder::new(Config::new(ip, port)).connect().await?;
//! let sum: i64 = client
//!     .proxy("Calculator")
//!     .call("Add", Args::new().arg(&100)?.arg(&200)?, None)
//!     .await?;
//! ```

use std::sync::Arc;

use bytes::Bytes;
use tokio::net::TcpStream;

use crate::buffer_pool::BufferPool;
use crate::config::Config;
use crate::error::{CloseReason, Result, WireError};
use crate::handshake::{ClientHandshake, ServerInfo};
use crate::postmaster::Postmaster;
use crate::rpc::{Proxy, RpcEndpoint, Service, ServiceRegistry};
use crate::session::{MessageSink, Role, Session};

type AuthResultListener = Box<dyn Fn(bool) + Send + Sync>;

/// Builder for a [`Client`].
pub struct ClientBuilder {
    config: Config,
    auth_data: Option<Vec<u8>>,
    registry: ServiceRegistry,
    raw_sink: Option<Arc<dyn MessageSink>>,
    on_auth_result: Option<AuthResultListener>,
}

impl ClientBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            auth_data: None,
            registry: ServiceRegistry::new(),
            raw_sink: None,
            on_auth_result: None,
        }
    }

    /// Credentials presented when the server requires authentication.
    pub fn auth_data(mut self, data: Vec<u8>) -> Self {
        self.auth_data = Some(data);
        self
    }

    /// Expose a service for calls originated by the server.
    pub fn service(mut self, service: Service) -> Self {
        self.registry.register(service);
        self
    }

    /// Receive whole messages that match no registered handler id.
    pub fn on_message(mut self, sink: Arc<dyn MessageSink>) -> Self {
        self.raw_sink = Some(sink);
        self
    }

    /// Observe the authentication verdict as it arrives.
    pub fn on_auth_result(mut self, listener: impl Fn(bool) + Send + Sync + 'static) -> Self {
        self.on_auth_result = Some(Box::new(listener));
        self
    }

    /// Connect and complete the handshake.
    pub async fn connect(self) -> Result<Client> {
        self.config.validate()?;
        let config = Arc::new(self.config);

        let stream = tokio::time::timeout(
            config.connection_timeout,
            TcpStream::connect(config.addr()),
        )
        .await
        .map_err(|_| WireError::Timeout)??;

        let postmaster = Postmaster::start(&config);
        let pool = BufferPool::new(1, config.send_and_receive_buffer_size);
        let session = Session::spawn(
            stream,
            Role::Client,
            Arc::clone(&config),
            &postmaster,
            pool,
        )?;

        session.set_rpc(RpcEndpoint::new(self.registry.freeze()));
        if let Some(sink) = self.raw_sink {
            session.set_raw_sink(sink);
        }
        let handshake = ClientHandshake::install(&session, self.auth_data, self.on_auth_result);
        session.start_read();

        if !config.ping_frequency.is_zero() {
            tokio::spawn(Client::ping_loop(Arc::clone(&session)));
        }

        if let Err(err) = session.wait_ready(config.connection_timeout).await {
            if matches!(err, WireError::Timeout) {
                session.close(CloseReason::TimeOut);
            }
            postmaster.shutdown();
            return Err(err);
        }

        Ok(Client {
            config,
            postmaster,
            session,
            handshake,
        })
    }
}

/// A connected, ready client.
pub struct Client {
    config: Arc<Config>,
    postmaster: Arc<Postmaster>,
    session: Arc<Session>,
    handshake: Arc<ClientHandshake>,
}

impl Client {
    /// Start building a client for the given configuration.
    pub fn builder(config: Config) -> ClientBuilder {
        ClientBuilder::new(config)
    }

    /// The underlying session.
    #[inline]
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// The greeting received during the handshake.
    pub fn server_info(&self) -> Option<&ServerInfo> {
        self.handshake.server_info()
    }

    /// A stub for the named remote service.
    pub fn proxy(&self, service: impl Into<String>) -> Proxy {
        self.session.proxy(service)
    }

    /// Send a raw message-queue payload.
    pub fn post(&self, payload: Bytes) -> Result<()> {
        self.session.post_payload(payload)
    }

    /// Resolves when the session has started closing.
    pub async fn closed(&self) {
        self.session.closed().await
    }

    /// Reason the session closed, once it has.
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.session.close_reason()
    }

    /// Orderly shutdown: close the session and stop the workers.
    pub fn close(&self) {
        self.session.close(CloseReason::ClientClosing);
        self.postmaster.shutdown();
    }

    async fn ping_loop(session: Arc<Session>) {
        let mut tick = tokio::time::interval(session.config().ping_frequency);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it so pings start one
        // interval after connect.
        tick.tick().await;

        loop {
            tokio::select! {
                _ = session.closed() => break,
                _ = tick.tick() => {}
            }
            if let Err(err) = session.send_ping().await {
                tracing::debug!(%err, "ping failed");
                break;
            }
        }
    }

    /// The configuration this client connected with.
    #[inline]
    pub fn config(&self) -> &Config {
        &self.config
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("session", &self.session.id())
            .field("ready", &self.session.is_ready())
            .finish()
    }
}
