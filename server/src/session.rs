//! Live client sessions.
//!
//! A [`Session`] is one authenticated connection. It owns a bounded outbound
//! queue of pre-serialized frames and moves through
//! `Connecting → Registered → Draining → Closed`:
//!
//! - `Connecting`: created by the entry point, not yet known to the hub.
//! - `Registered`: added to the registry; the only state that accepts sends.
//! - `Draining`: the queue has been closed; the writer flushes what is left
//!   and sends a close frame.
//! - `Closed`: the writer has exited.
//!
//! [`run_session`] drives the connection with two supervised tasks, a reader
//! and a writer. Whichever ends first triggers the single cleanup path, which
//! is safe to reach more than once.
//!
//! Both loops have deadlines. Every write must finish within [`WRITE_WAIT`],
//! and the client must send something (any frame, pongs included) within the
//! pong wait, which is ten ninths of the ping interval. A peer that stops
//! reading or silently disappears is therefore cut off even after the hub
//! has already forgotten the session.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use axum::extract::ws::Utf8Bytes;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::hub::{DisconnectReason, HubHandle};
use crate::transport::{Inbound, MessageSink, MessageStream, TransportError};
use crate::types::{CollegeId, UserId};

/// A serialized wire message. Cloning shares the underlying buffer.
pub type Frame = Utf8Bytes;

/// Unique identifier of one connection.
pub type SessionId = Uuid;

/// Client text frames above this size are logged by length and dropped.
///
/// The transport still buffers such a frame in full; it refuses anything
/// above [`MAX_BUFFERED_MESSAGE_SIZE`] and the session then ends.
pub const MAX_INBOUND_MESSAGE_SIZE: usize = 512;

/// Largest client frame the WebSocket layer will buffer.
pub const MAX_BUFFERED_MESSAGE_SIZE: usize = 64 * 1024;

/// Deadline for a single frame write.
pub const WRITE_WAIT: Duration = Duration::from_secs(10);

/// How long the writer may keep flushing after the session is closed.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Silence from the client tolerated for a given ping interval.
pub fn pong_wait(ping_interval: Duration) -> Duration {
    ping_interval * 10 / 9
}

/// Targeting attributes captured when the session connects.
///
/// Never refreshed while connected; a user who changes department keeps
/// receiving announcements for the old one until they reconnect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub college_id: CollegeId,
    pub department: Option<String>,
    pub semester: Option<u32>,
}

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Connecting = 0,
    Registered = 1,
    Draining = 2,
    Closed = 3,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Connecting,
            1 => Self::Registered,
            2 => Self::Draining,
            _ => Self::Closed,
        }
    }
}

/// Result of a non-blocking [`Session::send`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// The frame was enqueued.
    Queued,
    /// The queue is at capacity; the consumer is too slow.
    Full,
    /// The queue has already been closed.
    Closed,
    /// The session is not in the `Registered` state.
    NotRegistered,
}

impl SendOutcome {
    /// Whether the session can keep receiving.
    pub fn is_healthy(self) -> bool {
        matches!(self, Self::Queued)
    }
}

/// One live connection of one user.
pub struct Session {
    id: SessionId,
    user_id: UserId,
    snapshot: Snapshot,
    state: AtomicU8,
    outbound: Mutex<Option<mpsc::Sender<Frame>>>,
}

impl Session {
    /// Creates a session in the `Connecting` state.
    ///
    /// Returns the session together with the receiving end of its outbound
    /// queue, which belongs to the writer loop.
    pub fn new(
        user_id: UserId,
        snapshot: Snapshot,
        queue_capacity: usize,
    ) -> (Arc<Self>, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        let session = Arc::new(Self {
            id: Uuid::new_v4(),
            user_id,
            snapshot,
            state: AtomicU8::new(SessionState::Connecting as u8),
            outbound: Mutex::new(Some(tx)),
        });
        (session, rx)
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Moves `Connecting → Registered`.
    ///
    /// Returns `false` if the session was already closed, in which case it
    /// must not be added to the registry.
    pub fn mark_registered(&self) -> bool {
        self.state
            .compare_exchange(
                SessionState::Connecting as u8,
                SessionState::Registered as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Attempts to enqueue a frame without waiting.
    pub fn send(&self, frame: Frame) -> SendOutcome {
        if self.state() != SessionState::Registered {
            return SendOutcome::NotRegistered;
        }

        let outbound = self.outbound.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(tx) = outbound.as_ref() else {
            return SendOutcome::Closed;
        };

        match tx.try_send(frame) {
            Ok(()) => SendOutcome::Queued,
            Err(TrySendError::Full(_)) => SendOutcome::Full,
            Err(TrySendError::Closed(_)) => SendOutcome::Closed,
        }
    }

    /// Closes the outbound queue and enters `Draining`.
    ///
    /// Returns `true` only for the call that actually closed the queue.
    pub fn close(&self) -> bool {
        let previous = self.state.fetch_max(SessionState::Draining as u8, Ordering::AcqRel);
        let sender = self
            .outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let closed_now = sender.is_some();
        if closed_now {
            trace!(
                session_id = %self.id,
                user_id = self.user_id,
                previous = ?SessionState::from_u8(previous),
                "Session outbound queue closed"
            );
        }
        closed_now
    }

    /// Marks the writer as finished.
    fn mark_closed(&self) {
        self.state
            .store(SessionState::Closed as u8, Ordering::Release);
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("snapshot", &self.snapshot)
            .field("state", &self.state())
            .finish()
    }
}

/// Why a session's loops stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
enum LoopExit {
    ClientClosed,
    QueueClosed,
    TransportError(String),
    TimedOut(&'static str),
}

/// Drives a registered session until its connection ends.
///
/// Spawns the reader and writer as separate tasks so a failure in either is
/// contained, then runs the cleanup path: the hub forgets the session, the
/// queue closes and the writer gets a bounded window to flush and send a
/// close frame.
pub async fn run_session<S, R>(
    session: Arc<Session>,
    sink: S,
    stream: R,
    outbound: mpsc::Receiver<Frame>,
    hub: HubHandle,
    ping_interval: Duration,
) where
    S: MessageSink,
    R: MessageStream,
{
    let mut reader = tokio::spawn(read_loop(
        Arc::clone(&session),
        stream,
        pong_wait(ping_interval),
    ));
    let mut writer = tokio::spawn(write_loop(
        Arc::clone(&session),
        sink,
        outbound,
        ping_interval,
    ));

    let (exit, writer_done) = tokio::select! {
        result = &mut reader => (join_exit(result), false),
        result = &mut writer => (join_exit(result), true),
    };

    let reason = match &exit {
        LoopExit::ClientClosed => DisconnectReason::ClientClosed,
        LoopExit::QueueClosed => DisconnectReason::QueueClosed,
        LoopExit::TransportError(_) | LoopExit::TimedOut(_) => DisconnectReason::TransportError,
    };

    match &exit {
        LoopExit::TransportError(err) => warn!(
            session_id = %session.id(),
            user_id = session.user_id(),
            error = %err,
            "Session transport failed"
        ),
        LoopExit::TimedOut(direction) => warn!(
            session_id = %session.id(),
            user_id = session.user_id(),
            direction,
            "Session deadline expired"
        ),
        _ => debug!(
            session_id = %session.id(),
            user_id = session.user_id(),
            exit = ?exit,
            "Session loop finished"
        ),
    }

    hub.disconnect(Arc::clone(&session), reason);
    session.close();
    reader.abort();

    if !writer_done && timeout(DRAIN_TIMEOUT, &mut writer).await.is_err() {
        warn!(session_id = %session.id(), "Session writer did not drain in time");
        writer.abort();
    }
    session.mark_closed();

    info!(
        session_id = %session.id(),
        user_id = session.user_id(),
        "Session closed"
    );
}

fn join_exit(result: Result<LoopExit, tokio::task::JoinError>) -> LoopExit {
    result.unwrap_or_else(|err| LoopExit::TransportError(format!("session task failed: {err}")))
}

/// Reads client frames. Clients have no command protocol, so frames are only
/// logged. Any frame restarts the `pong_wait` deadline.
async fn read_loop<R: MessageStream>(
    session: Arc<Session>,
    mut stream: R,
    pong_wait: Duration,
) -> LoopExit {
    loop {
        let message = match timeout(pong_wait, stream.next_message()).await {
            Ok(Some(message)) => message,
            Ok(None) => return LoopExit::ClientClosed,
            Err(_) => return LoopExit::TimedOut("read"),
        };

        match message {
            Ok(Inbound::Text(text)) if text.len() > MAX_INBOUND_MESSAGE_SIZE => {
                warn!(
                    session_id = %session.id(),
                    size = text.len(),
                    "Discarding oversized client message"
                );
            }
            Ok(Inbound::Text(text)) => {
                debug!(
                    session_id = %session.id(),
                    user_id = session.user_id(),
                    message = %text,
                    "Received client message"
                );
            }
            Ok(Inbound::Binary(len)) => {
                debug!(session_id = %session.id(), size = len, "Ignoring binary client message");
            }
            Ok(Inbound::Control) => {
                trace!(session_id = %session.id(), "Received control frame");
            }
            Ok(Inbound::Close) => return LoopExit::ClientClosed,
            Err(err) => return LoopExit::TransportError(err.to_string()),
        }
    }
}

/// Drains the outbound queue onto the transport and keeps the connection
/// alive with periodic pings.
async fn write_loop<S: MessageSink>(
    session: Arc<Session>,
    mut sink: S,
    mut outbound: mpsc::Receiver<Frame>,
    ping_interval: Duration,
) -> LoopExit {
    let mut ping = interval_at(Instant::now() + ping_interval, ping_interval);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            frame = outbound.recv() => {
                let Some(frame) = frame else {
                    if let Err(exit) = write_within_deadline(sink.close()).await {
                        trace!(session_id = %session.id(), exit = ?exit, "Close frame not delivered");
                    }
                    return LoopExit::QueueClosed;
                };

                if let Err(exit) = write_within_deadline(sink.send_text(frame)).await {
                    return exit;
                }
            }
            _ = ping.tick() => {
                if let Err(exit) = write_within_deadline(sink.send_ping()).await {
                    return exit;
                }
                trace!(session_id = %session.id(), "Sent keepalive ping");
            }
        }
    }
}

async fn write_within_deadline<F>(write: F) -> Result<(), LoopExit>
where
    F: Future<Output = Result<(), TransportError>>,
{
    match timeout(WRITE_WAIT, write).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(LoopExit::TransportError(err.to_string())),
        Err(_) => Err(LoopExit::TimedOut("write")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::InMemoryDirectory;
    use crate::hub::{Hub, HubConfig};
    use crate::transport::memory::{self, Outbound};

    fn snapshot() -> Snapshot {
        Snapshot {
            college_id: 7,
            department: Some("CS".to_string()),
            semester: Some(4),
        }
    }

    #[test]
    fn new_session_starts_connecting_and_rejects_sends() {
        let (session, _rx) = Session::new(1, snapshot(), 4);
        assert_eq!(session.state(), SessionState::Connecting);
        assert_eq!(session.send(Frame::from("x")), SendOutcome::NotRegistered);
    }

    #[test]
    fn registered_session_queues_until_full() {
        let (session, mut rx) = Session::new(1, snapshot(), 2);
        assert!(session.mark_registered());

        assert_eq!(session.send(Frame::from("a")), SendOutcome::Queued);
        assert_eq!(session.send(Frame::from("b")), SendOutcome::Queued);
        assert_eq!(session.send(Frame::from("c")), SendOutcome::Full);

        assert_eq!(rx.try_recv().unwrap().as_str(), "a");
        assert_eq!(rx.try_recv().unwrap().as_str(), "b");
    }

    #[test]
    fn close_is_idempotent_and_blocks_registration() {
        let (session, mut rx) = Session::new(1, snapshot(), 2);

        assert!(session.close());
        assert!(!session.close());
        assert_eq!(session.state(), SessionState::Draining);
        assert!(!session.mark_registered());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn send_after_close_is_rejected() {
        let (session, _rx) = Session::new(1, snapshot(), 2);
        assert!(session.mark_registered());
        session.close();
        assert!(!session.send(Frame::from("late")).is_healthy());
    }

    #[test]
    fn send_reports_closed_when_receiver_dropped() {
        let (session, rx) = Session::new(1, snapshot(), 2);
        assert!(session.mark_registered());
        drop(rx);
        assert_eq!(session.send(Frame::from("x")), SendOutcome::Closed);
    }

    #[tokio::test]
    async fn writer_flushes_queue_then_sends_close_frame() {
        let (hub, _task) = Hub::spawn(Arc::new(InMemoryDirectory::new()), HubConfig::default());
        let (session, rx) = Session::new(1, snapshot(), 8);
        let (sink, stream, mut client) = memory::pair();

        hub.connect(Arc::clone(&session));
        let runner = tokio::spawn(run_session(
            Arc::clone(&session),
            sink,
            stream,
            rx,
            hub.clone(),
            Duration::from_secs(60),
        ));

        // Wait for the hub to register the session.
        while session.state() != SessionState::Registered {
            tokio::task::yield_now().await;
        }
        assert!(session.send(Frame::from("one")).is_healthy());
        assert_eq!(client.next().await, Some(Outbound::Text("one".to_string())));

        client.close();
        runner.await.unwrap();

        assert_eq!(session.state(), SessionState::Closed);
        timeout(Duration::from_secs(1), async {
            while hub.stats().connections != 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("hub should forget the session");
    }

    #[tokio::test]
    async fn write_failure_ends_session() {
        let (hub, _task) = Hub::spawn(Arc::new(InMemoryDirectory::new()), HubConfig::default());
        let (session, rx) = Session::new(2, snapshot(), 8);
        let (sink, stream, mut client) = memory::pair();

        hub.connect(Arc::clone(&session));
        let runner = tokio::spawn(run_session(
            Arc::clone(&session),
            sink,
            stream,
            rx,
            hub.clone(),
            Duration::from_secs(60),
        ));

        while session.state() != SessionState::Registered {
            tokio::task::yield_now().await;
        }
        client.fail_writes();
        session.send(Frame::from("lost"));

        runner.await.unwrap();
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn writer_sends_keepalive_pings() {
        let (hub, _task) = Hub::spawn(Arc::new(InMemoryDirectory::new()), HubConfig::default());
        let (session, rx) = Session::new(3, snapshot(), 8);
        let (sink, stream, mut client) = memory::pair();

        hub.connect(Arc::clone(&session));
        let runner = tokio::spawn(run_session(
            Arc::clone(&session),
            sink,
            stream,
            rx,
            hub.clone(),
            Duration::from_secs(30),
        ));

        assert_eq!(client.next().await, Some(Outbound::Ping));

        client.close();
        runner.await.unwrap();
    }

    #[tokio::test]
    async fn oversized_client_messages_do_not_end_session() {
        let (hub, _task) = Hub::spawn(Arc::new(InMemoryDirectory::new()), HubConfig::default());
        let (session, rx) = Session::new(4, snapshot(), 8);
        let (sink, stream, mut client) = memory::pair();

        hub.connect(Arc::clone(&session));
        let runner = tokio::spawn(run_session(
            Arc::clone(&session),
            sink,
            stream,
            rx,
            hub.clone(),
            Duration::from_secs(60),
        ));

        while session.state() != SessionState::Registered {
            tokio::task::yield_now().await;
        }
        client.say("x".repeat(MAX_INBOUND_MESSAGE_SIZE + 1));
        client.say("hello");

        assert!(session.send(Frame::from("still here")).is_healthy());
        assert_eq!(
            client.next().await,
            Some(Outbound::Text("still here".to_string()))
        );

        client.close();
        runner.await.unwrap();
    }

    async fn start(
        hub: &HubHandle,
        user_id: UserId,
        ping_interval: Duration,
    ) -> (Arc<Session>, tokio::task::JoinHandle<()>, memory::MemoryClient) {
        let (session, rx) = Session::new(user_id, snapshot(), 8);
        let (sink, stream, client) = memory::pair();

        hub.connect(Arc::clone(&session));
        let runner = tokio::spawn(run_session(
            Arc::clone(&session),
            sink,
            stream,
            rx,
            hub.clone(),
            ping_interval,
        ));

        while session.state() != SessionState::Registered {
            tokio::task::yield_now().await;
        }
        (session, runner, client)
    }

    #[test]
    fn pong_wait_is_ten_ninths_of_ping_interval() {
        assert_eq!(pong_wait(Duration::from_secs(54)), Duration::from_secs(60));
        assert_eq!(pong_wait(Duration::from_secs(9)), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_write_ends_evicted_session() {
        let (hub, _task) = Hub::spawn(Arc::new(InMemoryDirectory::new()), HubConfig::default());
        let (session, runner, client) = start(&hub, 5, Duration::from_secs(600)).await;

        client.stall_writes();
        assert!(session.send(Frame::from("stuck")).is_healthy());
        tokio::task::yield_now().await;

        // Eviction closes the queue while the writer is blocked on the peer.
        let started = Instant::now();
        hub.disconnect(Arc::clone(&session), DisconnectReason::Backpressure);

        runner.await.unwrap();
        assert!(started.elapsed() >= WRITE_WAIT);
        assert!(started.elapsed() < WRITE_WAIT + DRAIN_TIMEOUT);
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_client_is_dropped_after_pong_wait() {
        let (hub, _task) = Hub::spawn(Arc::new(InMemoryDirectory::new()), HubConfig::default());
        let started = Instant::now();
        let (session, runner, mut client) = start(&hub, 6, Duration::from_secs(9)).await;

        assert_eq!(client.next().await, Some(Outbound::Ping));
        runner.await.unwrap();

        assert!(started.elapsed() >= Duration::from_secs(10));
        assert!(started.elapsed() < Duration::from_secs(20));
        assert_eq!(session.state(), SessionState::Closed);
        while hub.stats().connections != 0 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn client_frames_extend_read_deadline() {
        let (hub, _task) = Hub::spawn(Arc::new(InMemoryDirectory::new()), HubConfig::default());
        let (session, runner, mut client) = start(&hub, 7, Duration::from_secs(9)).await;

        for _ in 0..3 {
            tokio::time::sleep(Duration::from_secs(6)).await;
            client.pong();
        }
        tokio::task::yield_now().await;
        assert_eq!(session.state(), SessionState::Registered);

        client.close();
        runner.await.unwrap();
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn panicking_writer_is_contained() {
        let (hub, _task) = Hub::spawn(Arc::new(InMemoryDirectory::new()), HubConfig::default());
        let (session, runner, client) = start(&hub, 8, Duration::from_secs(60)).await;
        let (_other, _other_runner, _other_client) = start(&hub, 9, Duration::from_secs(60)).await;

        client.panic_on_write();
        session.send(Frame::from("boom"));

        runner.await.unwrap();
        assert_eq!(session.state(), SessionState::Closed);
        timeout(Duration::from_secs(1), async {
            while hub.stats().connections != 1 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("only the failed session should be forgotten");
    }
}
