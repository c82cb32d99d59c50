//! Postmaster: shared scheduler multiplexing mailboxes onto worker pools.
//!
//! Many sessions share a bounded pool of reader workers and a bounded pool
//! of writer workers. Sessions never run their own passes; they signal the
//! postmaster, which guarantees:
//!
//! - **Coalescing**: signalling an already-scheduled mailbox is a no-op.
//! - **Single-flight**: at most one reader and one writer run on a
//!   mailbox at any instant (the mailbox's atomic flags are the membership
//!   test).
//! - **No lost wakeup**: after a pass the worker releases the flag and
//!   re-checks for work that arrived during the pass, re-signalling itself
//!   if any did. Every enqueue is therefore observed by exactly one
//!   subsequent pass.
//!
//! Workers block on a ready queue with a long timeout under a shutdown
//! token. A worker that hits an error logs it, releases single-flight and
//! continues; it never takes the pool down.
//!
//! An optional supervisor grows each pool (up to the configured cap) when
//! the ready queue backs up while every worker is busy. Correctness never
//! depends on it; a fixed-size pool is valid.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::cancel::CancelToken;
use crate::config::Config;
use crate::error::Result;
use crate::mailbox::Mailbox;

/// Boxed future returned by [`Courier`] delivery methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// How long a worker blocks on the ready queue before re-checking for
/// shutdown.
const WORKER_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Supervisor sampling interval.
const SUPERVISOR_INTERVAL: Duration = Duration::from_millis(100);

/// The seam between the scheduler and a session.
///
/// A courier wraps one mailbox and knows how to perform the two I/O-side
/// passes: flushing gathered outbound buffers to its socket, and
/// delivering assembled inbound messages.
pub trait Courier: Send + Sync + 'static {
    /// The mailbox this courier serves.
    fn mailbox(&self) -> &Mailbox;

    /// Reader pass: parse queued chunks, deliver completed messages.
    fn deliver_inbound(self: Arc<Self>) -> BoxFuture<'static, Result<()>>;

    /// Writer pass: drain the outbox and flush to the socket.
    fn deliver_outbound(self: Arc<Self>) -> BoxFuture<'static, Result<()>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Read,
    Write,
}

impl Direction {
    fn label(self) -> &'static str {
        match self {
            Direction::Read => "read",
            Direction::Write => "write",
        }
    }
}

/// One direction's ready queue plus pool accounting.
struct Lane {
    tx: mpsc::UnboundedSender<Arc<dyn Courier>>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Arc<dyn Courier>>>,
    /// Couriers enqueued and not yet picked up.
    queued: AtomicUsize,
    /// Workers currently running a pass.
    busy: AtomicUsize,
    /// Workers spawned in this lane.
    workers: AtomicUsize,
}

impl Lane {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: tokio::sync::Mutex::new(rx),
            queued: AtomicUsize::new(0),
            busy: AtomicUsize::new(0),
            workers: AtomicUsize::new(0),
        }
    }
}

struct Inner {
    read: Lane,
    write: Lane,
    shutdown: CancelToken,
    max_workers: usize,
}

impl Inner {
    fn lane(&self, dir: Direction) -> &Lane {
        match dir {
            Direction::Read => &self.read,
            Direction::Write => &self.write,
        }
    }
}

/// Shared scheduler owning the reader and writer worker pools.
pub struct Postmaster {
    inner: Arc<Inner>,
}

impl Postmaster {
    /// Start the postmaster with its initial worker pools.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(config: &Config) -> Arc<Self> {
        let inner = Arc::new(Inner {
            read: Lane::new(),
            write: Lane::new(),
            shutdown: CancelToken::new(),
            max_workers: config.max_read_write_workers,
        });

        let initial = config
            .initial_read_write_workers
            .min(config.max_read_write_workers);
        for dir in [Direction::Read, Direction::Write] {
            for _ in 0..initial {
                Self::spawn_worker(&inner, dir);
            }
        }

        if config.adaptive_workers {
            tokio::spawn(Self::supervisor_loop(Arc::clone(&inner)));
        }

        Arc::new(Self { inner })
    }

    /// Schedule a reader pass for this courier's mailbox.
    ///
    /// No-op if one is already scheduled or running.
    pub fn signal_read(&self, courier: Arc<dyn Courier>) {
        Self::signal(&self.inner, Direction::Read, courier);
    }

    /// Schedule a writer pass for this courier's mailbox.
    ///
    /// No-op if one is already scheduled or running.
    pub fn signal_write(&self, courier: Arc<dyn Courier>) {
        Self::signal(&self.inner, Direction::Write, courier);
    }

    fn signal(inner: &Inner, dir: Direction, courier: Arc<dyn Courier>) {
        let claimed = match dir {
            Direction::Read => courier.mailbox().try_begin_read(),
            Direction::Write => courier.mailbox().try_begin_write(),
        };
        if !claimed {
            return;
        }

        let lane = inner.lane(dir);
        lane.queued.fetch_add(1, Ordering::AcqRel);
        if lane.tx.send(courier).is_err() {
            lane.queued.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Stop all workers. Couriers still queued are dropped.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    /// Workers currently spawned for the read lane (the write lane is
    /// symmetric).
    pub fn read_worker_count(&self) -> usize {
        self.inner.read.workers.load(Ordering::Acquire)
    }

    pub fn write_worker_count(&self) -> usize {
        self.inner.write.workers.load(Ordering::Acquire)
    }

    fn spawn_worker(inner: &Arc<Inner>, dir: Direction) {
        inner.lane(dir).workers.fetch_add(1, Ordering::AcqRel);
        let inner = Arc::clone(inner);
        tokio::spawn(async move {
            Self::worker_loop(inner, dir).await;
        });
    }

    async fn worker_loop(inner: Arc<Inner>, dir: Direction) {
        loop {
            let courier = tokio::select! {
                _ = inner.shutdown.cancelled() => break,
                next = Self::next_ready(&inner, dir) => match next {
                    Some(c) => c,
                    None => continue,
                },
            };

            let lane = inner.lane(dir);
            lane.busy.fetch_add(1, Ordering::AcqRel);

            let result = match dir {
                Direction::Read => Arc::clone(&courier).deliver_inbound().await,
                Direction::Write => Arc::clone(&courier).deliver_outbound().await,
            };
            if let Err(error) = result {
                tracing::error!(direction = dir.label(), %error, "worker pass failed");
            }

            lane.busy.fetch_sub(1, Ordering::AcqRel);
            Self::release(&inner, dir, courier);
        }
        inner.lane(dir).workers.fetch_sub(1, Ordering::AcqRel);
    }

    async fn next_ready(inner: &Inner, dir: Direction) -> Option<Arc<dyn Courier>> {
        let lane = inner.lane(dir);
        let mut rx = lane.rx.lock().await;
        match tokio::time::timeout(WORKER_IDLE_TIMEOUT, rx.recv()).await {
            Ok(Some(courier)) => {
                lane.queued.fetch_sub(1, Ordering::AcqRel);
                Some(courier)
            }
            _ => None,
        }
    }

    /// Release single-flight, then re-signal if work arrived during the
    /// pass. The arrival either saw the flag set (and skipped signalling,
    /// which this re-check covers) or claimed the freshly released flag
    /// itself; there is no lost-wakeup window either way.
    fn release(inner: &Inner, dir: Direction, courier: Arc<dyn Courier>) {
        match dir {
            Direction::Read => {
                courier.mailbox().end_read();
                if courier.mailbox().has_pending_incoming() {
                    Self::signal(inner, dir, courier);
                }
            }
            Direction::Write => {
                courier.mailbox().end_write();
                if courier.mailbox().outbox_len() > 0 {
                    Self::signal(inner, dir, courier);
                }
            }
        }
    }

    async fn supervisor_loop(inner: Arc<Inner>) {
        let mut tick = tokio::time::interval(SUPERVISOR_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = inner.shutdown.cancelled() => break,
                _ = tick.tick() => {}
            }

            for dir in [Direction::Read, Direction::Write] {
                let lane = inner.lane(dir);
                let workers = lane.workers.load(Ordering::Acquire);
                let saturated = lane.busy.load(Ordering::Acquire) >= workers;
                let backlog = lane.queued.load(Ordering::Acquire) > 0;

                if backlog && saturated && workers < inner.max_workers {
                    tracing::debug!(
                        direction = dir.label(),
                        workers = workers + 1,
                        "growing worker pool"
                    );
                    Self::spawn_worker(&inner, dir);
                }
            }
        }
    }
}

impl Drop for Postmaster {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Message;
    use bytes::Bytes;
    use std::sync::atomic::AtomicBool;
    use std::sync::Mutex;
    use std::time::Instant;

    /// Courier that records delivered payloads and checks single-flight.
    struct Recorder {
        mailbox: Mailbox,
        sent: Mutex<Vec<Bytes>>,
        in_write_pass: AtomicBool,
        overlap_seen: AtomicBool,
        delay: Duration,
    }

    impl Recorder {
        fn new() -> Arc<Self> {
            Self::slow(Duration::ZERO)
        }

        fn slow(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                mailbox: Mailbox::new(1024),
                sent: Mutex::new(Vec::new()),
                in_write_pass: AtomicBool::new(false),
                overlap_seen: AtomicBool::new(false),
                delay,
            })
        }

        fn sent_count(&self) -> usize {
            self.sent.lock().unwrap().len()
        }
    }

    impl Courier for Recorder {
        fn mailbox(&self) -> &Mailbox {
            &self.mailbox
        }

        fn deliver_inbound(self: Arc<Self>) -> BoxFuture<'static, Result<()>> {
            Box::pin(async move {
                self.mailbox.drain_incoming()?;
                self.mailbox.take_inbox();
                Ok(())
            })
        }

        fn deliver_outbound(self: Arc<Self>) -> BoxFuture<'static, Result<()>> {
            Box::pin(async move {
                if self.in_write_pass.swap(true, Ordering::AcqRel) {
                    self.overlap_seen.store(true, Ordering::Release);
                }
                if !self.delay.is_zero() {
                    tokio::time::sleep(self.delay).await;
                }
                let flushes = self.mailbox.drain_outbox();
                let mut sent = self.sent.lock().unwrap();
                for flush in flushes {
                    sent.push(flush.freeze());
                }
                drop(sent);
                self.in_write_pass.store(false, Ordering::Release);
                Ok(())
            })
        }
    }

    fn test_config() -> Config {
        let mut config = Config::default();
        config.initial_read_write_workers = 4;
        config.adaptive_workers = false;
        config
    }

    async fn wait_until(deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if done() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        done()
    }

    #[tokio::test]
    async fn test_signalled_write_drains_outbox() {
        let postmaster = Postmaster::start(&test_config());
        let courier = Recorder::new();

        courier
            .mailbox
            .enqueue_outgoing(Message::from_payload(Bytes::from_static(b"hi"), 1024));
        postmaster.signal_write(courier.clone());

        assert!(wait_until(Duration::from_secs(2), || courier.sent_count() >= 1).await);
        assert_eq!(courier.mailbox.outbox_len(), 0);
        postmaster.shutdown();
    }

    #[tokio::test]
    async fn test_no_lost_signal_under_concurrent_enqueues() {
        let postmaster = Postmaster::start(&test_config());
        let courier = Recorder::new();

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let courier = courier.clone();
                let postmaster_ref = Arc::clone(&postmaster);
                tokio::spawn(async move {
                    for _ in 0..50 {
                        courier.mailbox.enqueue_outgoing(Message::from_payload(
                            Bytes::from_static(b"x"),
                            1024,
                        ));
                        postmaster_ref.signal_write(courier.clone());
                        tokio::task::yield_now().await;
                    }
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        assert!(
            wait_until(Duration::from_secs(5), || courier.mailbox.outbox_len() == 0
                && !courier.mailbox.write_in_flight())
            .await,
            "every enqueue must eventually be drained"
        );
        // Every enqueued frame made it out exactly once.
        let total: usize = {
            let sent = courier.sent.lock().unwrap();
            let mut builder = crate::protocol::FrameBuilder::new(1024);
            for flush in sent.iter() {
                builder.write(flush).unwrap();
            }
            builder.frames().len()
        };
        assert_eq!(total, 400);
        postmaster.shutdown();
    }

    #[tokio::test]
    async fn test_single_flight_never_overlaps() {
        let postmaster = Postmaster::start(&test_config());
        let courier = Recorder::slow(Duration::from_millis(5));

        for _ in 0..20 {
            courier
                .mailbox
                .enqueue_outgoing(Message::from_payload(Bytes::from_static(b"y"), 1024));
            postmaster.signal_write(courier.clone());
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        assert!(
            wait_until(Duration::from_secs(5), || courier.mailbox.outbox_len() == 0
                && !courier.mailbox.write_in_flight())
            .await
        );
        assert!(
            !courier.overlap_seen.load(Ordering::Acquire),
            "two writers ran on one mailbox"
        );
        postmaster.shutdown();
    }

    #[tokio::test]
    async fn test_coalesced_signal_is_noop() {
        let postmaster = Postmaster::start(&test_config());
        let courier = Recorder::new();

        // Claim the flag by hand; signals must not enqueue.
        assert!(courier.mailbox.try_begin_write());
        postmaster.signal_write(courier.clone());
        postmaster.signal_write(courier.clone());
        assert_eq!(postmaster.inner.write.queued.load(Ordering::Acquire), 0);

        courier.mailbox.end_write();
        postmaster.shutdown();
    }

    #[tokio::test]
    async fn test_reader_pass_assembles_messages() {
        let postmaster = Postmaster::start(&test_config());
        let courier = Recorder::new();

        let msg = Message::from_payload(Bytes::from_static(b"inbound"), 1024);
        let mut wire = bytes::BytesMut::new();
        msg.encode_into(&mut wire);
        courier.mailbox.enqueue_incoming(wire.freeze());
        postmaster.signal_read(courier.clone());

        assert!(
            wait_until(Duration::from_secs(2), || !courier
                .mailbox
                .has_pending_incoming()
                && courier.mailbox.inbox_byte_count() == 0)
            .await
        );
        postmaster.shutdown();
    }

    #[tokio::test]
    async fn test_shutdown_stops_workers() {
        let postmaster = Postmaster::start(&test_config());
        assert_eq!(postmaster.read_worker_count(), 4);
        postmaster.shutdown();

        assert!(
            wait_until(Duration::from_secs(2), || postmaster.read_worker_count() == 0
                && postmaster.write_worker_count() == 0)
            .await,
            "workers must exit promptly on shutdown"
        );
    }
}
