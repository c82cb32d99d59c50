//! Server endpoint: listener, session registry, idle sweeper.
//!
//! The server binds with the configured backlog, caps concurrent sessions
//! at `max_connections`, and gives every accepted connection the same
//! shared postmaster and buffer pool. Each new session gets the handshake
//! sink, the RPC endpoint (when services are registered), and the raw
//! message sink (when one is installed) before the first byte is parsed.
//!
//! When `ping_timeout` is nonzero a sweeper task closes sessions whose
//! last inbound byte is older than the threshold.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::net::{TcpListener, TcpSocket};
use uuid::Uuid;

use crate::buffer_pool::BufferPool;
use crate::cancel::CancelToken;
use crate::config::Config;
use crate::error::{CloseReason, Result};
use crate::handshake::{AuthVerifier, ServerHandshake};
use crate::postmaster::Postmaster;
use crate::rpc::{RpcEndpoint, Service, ServiceRegistry};
use crate::session::{MessageSink, Role, Session};

type ConnectedListener = Box<dyn Fn(Arc<Session>) + Send + Sync>;

/// Builder for a [`Server`].
pub struct ServerBuilder {
    config: Config,
    registry: ServiceRegistry,
    verifier: Option<Arc<dyn AuthVerifier>>,
    raw_sink: Option<Arc<dyn MessageSink>>,
    greeting: String,
    on_connected: Option<ConnectedListener>,
}

impl ServerBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            registry: ServiceRegistry::new(),
            verifier: None,
            raw_sink: None,
            greeting: String::new(),
            on_connected: None,
        }
    }

    /// Expose a service to remote callers.
    pub fn service(mut self, service: Service) -> Self {
        self.registry.register(service);
        self
    }

    /// Install the credential verifier used when authentication is
    /// required.
    pub fn verifier(mut self, verifier: Arc<dyn AuthVerifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    /// Receive whole messages that match no registered handler id.
    pub fn on_message(mut self, sink: Arc<dyn MessageSink>) -> Self {
        self.raw_sink = Some(sink);
        self
    }

    /// Observe every accepted session after its sinks are installed.
    pub fn on_connected(mut self, listener: impl Fn(Arc<Session>) + Send + Sync + 'static) -> Self {
        self.on_connected = Some(Box::new(listener));
        self
    }

    /// Free-text greeting carried in the server-info handshake.
    pub fn greeting(mut self, greeting: impl Into<String>) -> Self {
        self.greeting = greeting.into();
        self
    }

    /// Bind, start the postmaster, and begin accepting.
    pub async fn start(self) -> Result<Arc<Server>> {
        self.config.validate()?;
        let config = Arc::new(self.config);

        let socket = match config.addr() {
            std::net::SocketAddr::V4(_) => TcpSocket::new_v4()?,
            std::net::SocketAddr::V6(_) => TcpSocket::new_v6()?,
        };
        socket.set_reuseaddr(true)?;
        socket.bind(config.addr())?;
        let listener = socket.listen(config.listener_backlog)?;
        let local_addr = listener.local_addr()?;

        let postmaster = Postmaster::start(&config);
        let pool = BufferPool::new(
            config.max_connections,
            config.send_and_receive_buffer_size,
        );

        let server = Arc::new(Server {
            config: Arc::clone(&config),
            postmaster,
            pool,
            services: self.registry.freeze(),
            verifier: self.verifier,
            raw_sink: self.raw_sink,
            greeting: self.greeting,
            on_connected: self.on_connected,
            sessions: Mutex::new(HashMap::new()),
            shutdown: CancelToken::new(),
            local_addr,
        });

        tokio::spawn(Server::accept_loop(Arc::clone(&server), listener));
        if !config.ping_timeout.is_zero() {
            tokio::spawn(Server::sweep_loop(Arc::downgrade(&server)));
        }

        tracing::info!(addr = %local_addr, "server listening");
        Ok(server)
    }
}

/// A running server.
pub struct Server {
    config: Arc<Config>,
    postmaster: Arc<Postmaster>,
    pool: Arc<BufferPool>,
    services: Arc<ServiceRegistry>,
    verifier: Option<Arc<dyn AuthVerifier>>,
    raw_sink: Option<Arc<dyn MessageSink>>,
    greeting: String,
    on_connected: Option<ConnectedListener>,
    sessions: Mutex<HashMap<Uuid, Arc<Session>>>,
    shutdown: CancelToken,
    local_addr: std::net::SocketAddr,
}

impl Server {
    /// Start building a server for the given configuration.
    pub fn builder(config: Config) -> ServerBuilder {
        ServerBuilder::new(config)
    }

    /// The bound address (useful with port 0).
    #[inline]
    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.local_addr
    }

    /// Sessions currently registered.
    pub fn session_count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    /// Look up a live session.
    pub fn session(&self, id: Uuid) -> Option<Arc<Session>> {
        self.sessions.lock().unwrap().get(&id).cloned()
    }

    /// Stop accepting, close every session, stop the workers.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        let sessions: Vec<Arc<Session>> =
            self.sessions.lock().unwrap().values().cloned().collect();
        for session in sessions {
            session.close(CloseReason::ServerClosing);
        }
        self.postmaster.shutdown();
    }

    async fn accept_loop(server: Arc<Server>, listener: TcpListener) {
        loop {
            let accepted = tokio::select! {
                _ = server.shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    if server.session_count() >= server.config.max_connections {
                        tracing::warn!(%peer, "connection limit reached, refusing");
                        drop(stream);
                        continue;
                    }
                    if let Err(err) = server.setup_session(stream) {
                        tracing::warn!(%peer, %err, "session setup failed");
                    }
                }
                Err(err) => {
                    tracing::warn!(%err, "accept failed");
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }
        }
    }

    fn setup_session(self: &Arc<Self>, stream: tokio::net::TcpStream) -> Result<()> {
        let session = Session::spawn(
            stream,
            Role::Server,
            Arc::clone(&self.config),
            &self.postmaster,
            Arc::clone(&self.pool),
        )?;

        session.set_rpc(RpcEndpoint::new(Arc::clone(&self.services)));
        if let Some(sink) = &self.raw_sink {
            session.set_raw_sink(Arc::clone(sink));
        }
        ServerHandshake::install(&session, self.greeting.clone(), self.verifier.clone())?;

        let id = session.id();
        self.sessions
            .lock()
            .unwrap()
            .insert(id, Arc::clone(&session));

        let server = Arc::downgrade(self);
        session.on_closed(move |reason| {
            if let Some(server) = server.upgrade() {
                server.sessions.lock().unwrap().remove(&id);
                tracing::debug!(session = %id, ?reason, "session deregistered");
            }
        });

        if let Some(listener) = &self.on_connected {
            listener(Arc::clone(&session));
        }
        session.start_read();
        tracing::debug!(session = %id, peer = %session.peer_addr(), "session accepted");
        Ok(())
    }

    /// Close sessions whose peer has gone silent past `ping_timeout`.
    async fn sweep_loop(server: Weak<Server>) {
        let Some(period) = server.upgrade().map(|s| {
            s.config
                .ping_timeout
                .checked_div(4)
                .unwrap_or(Duration::from_secs(1))
                .max(Duration::from_millis(100))
        }) else {
            return;
        };
        let mut tick = tokio::time::interval(period);

        loop {
            tick.tick().await;
            let Some(server) = server.upgrade() else { break };
            if server.shutdown.is_cancelled() {
                break;
            }

            let timeout = server.config.ping_timeout;
            let stale: Vec<Arc<Session>> = server
                .sessions
                .lock()
                .unwrap()
                .values()
                .filter(|s| s.idle_for() > timeout)
                .cloned()
                .collect();
            for session in stale {
                tracing::debug!(session = %session.id(), "idle past ping timeout");
                session.close(CloseReason::TimeOut);
            }
        }
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("addr", &self.local_addr)
            .field("sessions", &self.session_count())
            .finish()
    }
}
