//! Session: one TCP connection's lifecycle, routing and timers.
//!
//! A session owns exactly one [`Mailbox`] and the two socket halves. The
//! read task copies socket bytes into the mailbox and signals the shared
//! [`Postmaster`]; all parsing, assembly and flushing happen on postmaster
//! workers via the session's [`Courier`] implementation. Outbound sends
//! serialize on the write-half mutex, so a flush is never interleaved with
//! a ping.
//!
//! Completed messages are routed by channel. Control messages
//! (`Command`-terminated: handshake and RPC traffic) are dispatched by
//! their first payload byte, the handler id, to registered
//! [`MessageSink`]s; a control message with no matching handler closes the
//! session with a protocol-error reason. Data messages
//! (`Last`/`EmptyLast`-terminated) go to the raw sink untouched, so an
//! application payload is never reinterpreted as a handler id.
//!
//! States run `Connecting -> Connected -> Closing -> Closed`; `Closed` is
//! terminal and the close reason reported to listeners is the first one
//! set.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use uuid::Uuid;

use crate::buffer_pool::BufferPool;
use crate::cancel::CancelToken;
use crate::config::Config;
use crate::error::{CloseReason, Result, WireError};
use crate::mailbox::Mailbox;
use crate::postmaster::{BoxFuture, Courier, Postmaster};
use crate::protocol::{FrameType, Message};
use crate::rpc::{Proxy, RpcEndpoint};

/// Back-pressure poll interval while the inbound queue is over the
/// high-water mark.
const BACKPRESSURE_CHECK_INTERVAL: Duration = Duration::from_micros(100);

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Connecting = 0,
    Connected = 1,
    Closing = 2,
    Closed = 3,
}

impl SessionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => SessionState::Connecting,
            1 => SessionState::Connected,
            2 => SessionState::Closing,
            _ => SessionState::Closed,
        }
    }
}

/// Which side of the connection this session is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Receives completed messages for one handler id (or everything, when
/// installed as the raw sink). Runs on a postmaster reader worker; spawn
/// anything slow.
pub trait MessageSink: Send + Sync {
    fn deliver(&self, session: &Arc<Session>, message: Message);
}

type ClosedListener = Box<dyn Fn(CloseReason) + Send + Sync>;

/// One TCP connection.
pub struct Session {
    id: Uuid,
    role: Role,
    peer: SocketAddr,
    config: Arc<Config>,
    mailbox: Mailbox,
    reader: Mutex<Option<OwnedReadHalf>>,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    postmaster: Weak<Postmaster>,
    pool: Arc<BufferPool>,
    state: AtomicU8,
    ready: AtomicBool,
    ready_notify: tokio::sync::Notify,
    epoch: Instant,
    last_received_ms: AtomicU64,
    handlers: Mutex<HashMap<u8, Arc<dyn MessageSink>>>,
    raw_sink: Mutex<Option<Arc<dyn MessageSink>>>,
    rpc: OnceLock<Arc<RpcEndpoint>>,
    close_reason: OnceLock<CloseReason>,
    close_token: CancelToken,
    on_closed: Mutex<Vec<ClosedListener>>,
}

impl Session {
    /// Wrap a connected stream.
    ///
    /// No inbound byte is processed until [`start_read`](Self::start_read)
    /// runs, so callers can install their message sinks race-free first.
    pub fn spawn(
        stream: TcpStream,
        role: Role,
        config: Arc<Config>,
        postmaster: &Arc<Postmaster>,
        pool: Arc<BufferPool>,
    ) -> Result<Arc<Self>> {
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;
        let (read_half, write_half) = stream.into_split();

        let session = Arc::new(Self {
            id: Uuid::new_v4(),
            role,
            peer,
            mailbox: Mailbox::new(config.max_frame_data()),
            config,
            reader: Mutex::new(Some(read_half)),
            writer: tokio::sync::Mutex::new(Some(write_half)),
            postmaster: Arc::downgrade(postmaster),
            pool,
            state: AtomicU8::new(SessionState::Connected as u8),
            ready: AtomicBool::new(false),
            ready_notify: tokio::sync::Notify::new(),
            epoch: Instant::now(),
            last_received_ms: AtomicU64::new(0),
            handlers: Mutex::new(HashMap::new()),
            raw_sink: Mutex::new(None),
            rpc: OnceLock::new(),
            close_reason: OnceLock::new(),
            close_token: CancelToken::new(),
            on_closed: Mutex::new(Vec::new()),
        });
        Ok(session)
    }

    /// Start the read task. Call once, after every sink is installed.
    pub fn start_read(self: &Arc<Self>) {
        if let Some(read_half) = self.reader.lock().unwrap().take() {
            tokio::spawn(Self::read_loop(Arc::clone(self), read_half));
        }
    }

    // ---- identity ----------------------------------------------------

    #[inline]
    pub fn id(&self) -> Uuid {
        self.id
    }

    #[inline]
    pub fn role(&self) -> Role {
        self.role
    }

    #[inline]
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    #[inline]
    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_closed(&self) -> bool {
        self.state.load(Ordering::Acquire) >= SessionState::Closing as u8
    }

    // ---- routing setup -----------------------------------------------

    /// Register the control-channel sink for one handler id.
    pub fn set_handler(&self, handler_id: u8, sink: Arc<dyn MessageSink>) {
        self.handlers.lock().unwrap().insert(handler_id, sink);
    }

    /// Register the sink receiving application data messages.
    pub fn set_raw_sink(&self, sink: Arc<dyn MessageSink>) {
        *self.raw_sink.lock().unwrap() = Some(sink);
    }

    /// Install the RPC endpoint and wire it to the RPC handler id.
    pub fn set_rpc(&self, endpoint: Arc<RpcEndpoint>) {
        self.set_handler(crate::rpc::HANDLER_RPC, Arc::clone(&endpoint) as _);
        let _ = self.rpc.set(endpoint);
    }

    /// The RPC endpoint, when one is installed.
    pub fn rpc(&self) -> Option<&Arc<RpcEndpoint>> {
        self.rpc.get()
    }

    /// A caller-side stub for the named remote service.
    pub fn proxy(self: &Arc<Self>, service: impl Into<String>) -> Proxy {
        Proxy::new(Arc::clone(self), service.into())
    }

    // ---- readiness ---------------------------------------------------

    /// Mark the handshake complete; RPC calls are permitted from here on.
    pub fn set_ready(&self) {
        self.ready.store(true, Ordering::Release);
        self.ready_notify.notify_waiters();
    }

    #[inline]
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Wait until the session is ready, the session closes, or the
    /// deadline expires.
    pub async fn wait_ready(&self, deadline: Duration) -> Result<()> {
        let wait = async {
            loop {
                let notified = self.ready_notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                if self.is_ready() {
                    return Ok(());
                }
                if self.is_closed() {
                    return Err(match self.close_reason() {
                        Some(CloseReason::AuthenticationFailure) => {
                            WireError::AuthenticationFailure
                        }
                        _ => WireError::ConnectionClosed,
                    });
                }
                notified.await;
            }
        };
        tokio::time::timeout(deadline, wait)
            .await
            .map_err(|_| WireError::Timeout)?
    }

    // ---- liveness ----------------------------------------------------

    /// Record inbound activity.
    fn touch(&self) {
        self.last_received_ms
            .store(self.epoch.elapsed().as_millis() as u64, Ordering::Release);
    }

    /// Time since the last inbound byte.
    pub fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_received_ms.load(Ordering::Acquire));
        self.epoch.elapsed().saturating_sub(last)
    }

    /// Write a keep-alive frame directly to the socket.
    pub async fn send_ping(&self) -> Result<()> {
        self.send_bytes(Bytes::from_static(&[FrameType::Ping as u8]))
            .await
    }

    // ---- sending -----------------------------------------------------

    /// Enqueue a message and schedule a writer pass.
    pub fn post(self: &Arc<Self>, message: Message) -> Result<()> {
        if self.is_closed() {
            return Err(WireError::ConnectionClosed);
        }
        self.mailbox.enqueue_outgoing(message);
        match self.postmaster.upgrade() {
            Some(postmaster) => {
                postmaster.signal_write(Arc::clone(self) as Arc<dyn Courier>);
                Ok(())
            }
            None => Err(WireError::ConnectionClosed),
        }
    }

    /// Chunk a payload into a data message and [`post`](Self::post) it.
    pub fn post_payload(self: &Arc<Self>, payload: Bytes) -> Result<()> {
        self.post(Message::from_payload(payload, self.config.max_frame_data()))
    }

    /// Chunk a payload into a control message and [`post`](Self::post) it.
    /// The payload's first byte is the handler id the peer routes on.
    pub fn post_control(self: &Arc<Self>, payload: Bytes) -> Result<()> {
        self.post(Message::control(payload, self.config.max_frame_data()))
    }

    /// Write raw bytes under the session's write lock and send deadline.
    pub async fn send_bytes(&self, buf: Bytes) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            return Err(WireError::ConnectionClosed);
        };
        match tokio::time::timeout(self.config.send_timeout, writer.write_all(&buf)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(WireError::Io(err)),
            Err(_) => Err(WireError::Timeout),
        }
    }

    // ---- closing -----------------------------------------------------

    /// Reason the session closed, once it has.
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason.get().copied()
    }

    /// Register a close listener; invoked at most once, immediately when
    /// the session is already closed.
    pub fn on_closed(&self, listener: impl Fn(CloseReason) + Send + Sync + 'static) {
        if self.is_closed() {
            if let Some(reason) = self.close_reason() {
                listener(reason);
            }
            return;
        }
        self.on_closed.lock().unwrap().push(Box::new(listener));
    }

    /// Close the session. The first reason wins; later calls are no-ops.
    pub fn close(self: &Arc<Self>, reason: CloseReason) {
        let _ = self.close_reason.set(reason);
        let transitioned = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |state| {
                (state < SessionState::Closing as u8).then_some(SessionState::Closing as u8)
            })
            .is_ok();
        if !transitioned {
            return;
        }

        let reason = self.close_reason().unwrap_or(reason);
        tracing::debug!(session = %self.id, ?reason, "closing session");

        self.close_token.cancel();
        self.ready_notify.notify_waiters();
        if let Some(endpoint) = self.rpc.get() {
            endpoint.waits().clear();
        }

        let listeners = std::mem::take(&mut *self.on_closed.lock().unwrap());
        let session = Arc::clone(self);
        tokio::spawn(async move {
            {
                let mut writer = session.writer.lock().await;
                if let Some(mut write_half) = writer.take() {
                    let _ = write_half.shutdown().await;
                }
            }
            session
                .state
                .store(SessionState::Closed as u8, Ordering::Release);
            for listener in listeners {
                listener(reason);
            }
        });
    }

    /// Resolves when the session has started closing.
    pub async fn closed(&self) {
        self.close_token.cancelled().await
    }

    // ---- read task ---------------------------------------------------

    async fn read_loop(session: Arc<Session>, mut reader: OwnedReadHalf) {
        let mut buf = session.pool.acquire();
        buf.resize(session.config.send_and_receive_buffer_size, 0);

        loop {
            if session.is_closed() {
                break;
            }

            // Stop reading while the parse queue is over the high-water
            // mark; the reader workers drain it.
            while session.mailbox.inbox_byte_count() > session.config.inbound_high_water() {
                if session.is_closed() {
                    break;
                }
                tokio::time::sleep(BACKPRESSURE_CHECK_INTERVAL).await;
            }

            let n = tokio::select! {
                _ = session.close_token.cancelled() => break,
                read = reader.read(&mut buf[..]) => match read {
                    Ok(0) => {
                        session
                            .drain_inbound_then_close(session.peer_close_reason())
                            .await;
                        break;
                    }
                    Ok(n) => n,
                    Err(err) => {
                        tracing::debug!(session = %session.id, %err, "socket read failed");
                        session.close(CloseReason::SocketError);
                        break;
                    }
                },
            };

            session.touch();
            session
                .mailbox
                .enqueue_incoming(Bytes::copy_from_slice(&buf[..n]));

            match session.postmaster.upgrade() {
                Some(postmaster) => {
                    postmaster.signal_read(Arc::clone(&session) as Arc<dyn Courier>)
                }
                None => {
                    session.close(CloseReason::ServerClosing);
                    break;
                }
            }
        }

        session.pool.release(buf);
    }

    /// Give the reader workers a moment to finish routing bytes that
    /// arrived ahead of a clean peer shutdown, so a final message (an
    /// authentication verdict, say) lands before the close is reported.
    async fn drain_inbound_then_close(self: &Arc<Self>, reason: CloseReason) {
        let deadline = tokio::time::Instant::now() + Duration::from_millis(250);
        while tokio::time::Instant::now() < deadline {
            if !self.mailbox.has_pending_incoming()
                && self.mailbox.inbox_len() == 0
                && !self.mailbox.read_in_flight()
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        self.close(reason);
    }

    /// Reason to report when the peer closed the socket first.
    fn peer_close_reason(&self) -> CloseReason {
        match self.role {
            Role::Server => CloseReason::ClientClosing,
            Role::Client => CloseReason::ServerClosing,
        }
    }

    // ---- inbound routing ---------------------------------------------

    fn route(self: &Arc<Self>, message: Message) {
        if message.is_control() {
            // Handler ids exist only on the control channel; the first
            // byte of the first frame is the id.
            let sink = {
                let handlers = self.handlers.lock().unwrap();
                message
                    .frames()
                    .first()
                    .and_then(|f| f.data.first())
                    .and_then(|id| handlers.get(id).cloned())
            };
            match sink {
                Some(sink) => sink.deliver(self, message),
                None => {
                    tracing::warn!(session = %self.id, "control message with unknown handler id");
                    self.close(CloseReason::ProtocolError);
                }
            }
            return;
        }

        let raw = self.raw_sink.lock().unwrap().clone();
        match raw {
            Some(sink) => sink.deliver(self, message),
            None => {
                tracing::debug!(session = %self.id, "data message with no sink registered");
            }
        }
    }
}

impl Courier for Session {
    fn mailbox(&self) -> &Mailbox {
        &self.mailbox
    }

    fn deliver_inbound(self: Arc<Self>) -> BoxFuture<'static, Result<()>> {
        Box::pin(async move {
            match self.mailbox.drain_incoming() {
                Ok(0) => Ok(()),
                Ok(_) => {
                    // One incoming-message event per pass; delivery stays
                    // on this worker so per-mailbox wire order holds.
                    for message in self.mailbox.take_inbox() {
                        self.route(message);
                    }
                    Ok(())
                }
                Err(err) => {
                    tracing::warn!(session = %self.id, %err, "inbound protocol violation");
                    self.close(CloseReason::ProtocolError);
                    Err(err)
                }
            }
        })
    }

    fn deliver_outbound(self: Arc<Self>) -> BoxFuture<'static, Result<()>> {
        Box::pin(async move {
            for flush in self.mailbox.drain_outbox() {
                if let Err(err) = self.send_bytes(flush.freeze()).await {
                    if !self.is_closed() {
                        tracing::debug!(session = %self.id, %err, "socket write failed");
                        self.close(CloseReason::SocketError);
                    }
                    return Err(err);
                }
            }
            Ok(())
        })
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("peer", &self.peer)
            .field("state", &self.state())
            .field("ready", &self.is_ready())
            .finish()
    }
}
