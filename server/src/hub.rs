//! The notification hub.
//!
//! One task owns the [`Registry`] and serializes every registry change and
//! every targeting decision. Everything else talks to it through a cloneable
//! [`HubHandle`]:
//!
//! - `connect`, `disconnect` travel on an unbounded control channel, so
//!   session lifecycle changes are never lost.
//! - `publish` uses a bounded event channel and never waits; when the hub
//!   falls behind, new events are dropped with a warning.
//!
//! The loop drains control commands before events, so a session connected
//! before an event is published is always considered for it.
//!
//! For each event the hub resolves the audience, serializes the envelope
//! once and offers the shared frame to every matching session. A session
//! whose queue is full or closed is evicted after the batch; the rest of the
//! batch is unaffected.
//!
//! Group membership is fetched from the [`Directory`] on a separate task so
//! a slow lookup never stalls the loop. The resolved recipients come back as
//! a control command and are fanned out like any other event. At most
//! `group_lookups` lookups run at once; a group message arriving while all
//! of them are busy is dropped with a warning.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use unilink_hub::directory::InMemoryDirectory;
//! use unilink_hub::hub::{Hub, HubConfig};
//!
//! # async fn example() {
//! let (hub, _task) = Hub::spawn(Arc::new(InMemoryDirectory::new()), HubConfig::default());
//! assert_eq!(hub.stats().connections, 0);
//! # }
//! ```

use std::ops::ControlFlow;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::config::{Config, DEFAULT_HUB_QUEUE};
use crate::directory::Directory;
use crate::registry::Registry;
use crate::session::{Frame, SendOutcome, Session};
use crate::targeting::{self, Audience};
use crate::types::{Event, GroupId, UserId};

/// Default cap on concurrent group membership lookups.
pub const DEFAULT_GROUP_LOOKUPS: usize = 32;

/// Hub tuning.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Events buffered between publishers and the hub loop.
    pub event_capacity: usize,

    /// Group membership lookups allowed in flight.
    pub group_lookups: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            event_capacity: DEFAULT_HUB_QUEUE,
            group_lookups: DEFAULT_GROUP_LOOKUPS,
        }
    }
}

impl From<&Config> for HubConfig {
    fn from(config: &Config) -> Self {
        Self {
            event_capacity: config.hub_queue,
            ..Self::default()
        }
    }
}

/// Why a session left the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The client closed the connection.
    ClientClosed,
    /// Reading from or writing to the transport failed.
    TransportError,
    /// The outbound queue was closed from elsewhere.
    QueueClosed,
    /// The session could not keep up with its outbound queue.
    Backpressure,
    /// The hub is shutting down.
    Shutdown,
}

/// Errors returned by [`HubHandle::publish`]. The event is dropped in both
/// cases.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PublishError {
    #[error("hub event queue is full")]
    Full,

    #[error("hub is not running")]
    Closed,
}

/// Point-in-time hub counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HubStats {
    pub connections: usize,
    pub users: usize,
}

enum Command {
    Connect(Arc<Session>),
    Disconnect(Arc<Session>, DisconnectReason),
    Deliver {
        kind: &'static str,
        recipients: Vec<UserId>,
        frame: Frame,
    },
    Shutdown,
}

/// Cloneable entry point into a running hub.
#[derive(Clone)]
pub struct HubHandle {
    control: mpsc::UnboundedSender<Command>,
    events: mpsc::Sender<Event>,
    registry: Arc<Registry>,
}

impl HubHandle {
    /// Registers a session. The session becomes `Registered` when the hub
    /// processes the command, unless it was closed in the meantime.
    pub fn connect(&self, session: Arc<Session>) {
        if let Err(err) = self.control.send(Command::Connect(session)) {
            if let Command::Connect(session) = err.0 {
                warn!(session_id = %session.id(), "Hub stopped, closing new session");
                session.close();
            }
        }
    }

    /// Removes a session and closes its queue. Safe to call repeatedly.
    pub fn disconnect(&self, session: Arc<Session>, reason: DisconnectReason) {
        if let Err(err) = self.control.send(Command::Disconnect(session, reason)) {
            if let Command::Disconnect(session, _) = err.0 {
                session.close();
            }
        }
    }

    /// Hands an event to the hub without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`PublishError::Full`] when the event queue is at capacity
    /// and [`PublishError::Closed`] when the hub has stopped. The event is
    /// dropped and a warning logged; delivery is best effort and callers are
    /// not expected to retry.
    pub fn publish(&self, event: Event) -> Result<(), PublishError> {
        match self.events.try_send(event) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(event)) => {
                warn!(event_type = event.kind(), "Hub event queue full, dropping event");
                Err(PublishError::Full)
            }
            Err(TrySendError::Closed(event)) => {
                warn!(event_type = event.kind(), "Hub stopped, dropping event");
                Err(PublishError::Closed)
            }
        }
    }

    /// Current connection and user counts.
    pub fn stats(&self) -> HubStats {
        HubStats {
            connections: self.registry.connection_count(),
            users: self.registry.user_count(),
        }
    }

    /// Asks the hub to close every session and stop.
    pub fn shutdown(&self) {
        let _ = self.control.send(Command::Shutdown);
    }
}

impl std::fmt::Debug for HubHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubHandle")
            .field("registry", &self.registry)
            .field("event_capacity", &self.events.max_capacity())
            .finish()
    }
}

/// The hub loop and the state it owns.
pub struct Hub {
    registry: Arc<Registry>,
    directory: Arc<dyn Directory>,
    group_lookups: Arc<Semaphore>,
    control_tx: mpsc::UnboundedSender<Command>,
    control_rx: mpsc::UnboundedReceiver<Command>,
    events_rx: mpsc::Receiver<Event>,
}

impl Hub {
    /// Creates a hub and its handle without starting the loop.
    pub fn new(directory: Arc<dyn Directory>, config: HubConfig) -> (Self, HubHandle) {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::channel(config.event_capacity.max(1));
        let registry = Arc::new(Registry::new());

        debug!(
            event_capacity = config.event_capacity,
            group_lookups = config.group_lookups,
            "Created hub"
        );

        let handle = HubHandle {
            control: control_tx.clone(),
            events: events_tx,
            registry: Arc::clone(&registry),
        };

        let hub = Self {
            registry,
            directory,
            group_lookups: Arc::new(Semaphore::new(config.group_lookups.max(1))),
            control_tx,
            control_rx,
            events_rx,
        };

        (hub, handle)
    }

    /// Creates a hub and runs its loop on a new task.
    pub fn spawn(directory: Arc<dyn Directory>, config: HubConfig) -> (HubHandle, JoinHandle<()>) {
        let (hub, handle) = Self::new(directory, config);
        (handle, tokio::spawn(hub.run()))
    }

    /// Runs until [`HubHandle::shutdown`] is called or every handle is
    /// dropped, then closes all remaining sessions.
    pub async fn run(mut self) {
        info!("Hub started");

        loop {
            tokio::select! {
                biased;

                Some(command) = self.control_rx.recv() => {
                    if self.handle_command(command).is_break() {
                        break;
                    }
                }
                event = self.events_rx.recv() => match event {
                    Some(event) => self.route(event),
                    None => break,
                },
            }
        }

        let sessions = self.registry.drain();
        let count = sessions.len();
        for session in sessions {
            session.close();
        }
        info!(closed_sessions = count, "Hub stopped");
    }

    fn handle_command(&mut self, command: Command) -> ControlFlow<()> {
        match command {
            Command::Connect(session) => self.register(session),
            Command::Disconnect(session, reason) => self.forget(&session, reason),
            Command::Deliver {
                kind,
                recipients,
                frame,
            } => {
                let sessions = recipients
                    .iter()
                    .flat_map(|user_id| self.registry.sessions_for(*user_id))
                    .collect();
                self.deliver(kind, sessions, frame);
            }
            Command::Shutdown => {
                info!("Hub shutdown requested");
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    fn register(&self, session: Arc<Session>) {
        if !session.mark_registered() {
            debug!(
                session_id = %session.id(),
                user_id = session.user_id(),
                "Session closed before registration, skipping"
            );
            return;
        }

        self.registry.add(&session);
        info!(
            session_id = %session.id(),
            user_id = session.user_id(),
            college_id = session.snapshot().college_id,
            connections = self.registry.connection_count(),
            "Session registered"
        );
    }

    fn forget(&self, session: &Arc<Session>, reason: DisconnectReason) {
        let removed = self
            .registry
            .remove(session.user_id(), session.id())
            .is_some();
        session.close();

        if removed {
            info!(
                session_id = %session.id(),
                user_id = session.user_id(),
                reason = ?reason,
                connections = self.registry.connection_count(),
                "Session unregistered"
            );
        } else {
            trace!(session_id = %session.id(), reason = ?reason, "Session already unregistered");
        }
    }

    fn route(&self, event: Event) {
        let kind = event.kind();

        let audience = match targeting::resolve(&event) {
            Ok(audience) => audience,
            Err(err) => {
                warn!(event_type = kind, error = %err, "Dropping undeliverable event");
                return;
            }
        };

        let frame = match serde_json::to_string(&event) {
            Ok(json) => Frame::from(json),
            Err(err) => {
                error!(event_type = kind, error = %err, "Failed to serialize event");
                return;
            }
        };

        match audience {
            Audience::Users(users) => {
                let sessions = users
                    .iter()
                    .flat_map(|user_id| self.registry.sessions_for(*user_id))
                    .collect();
                self.deliver(kind, sessions, frame);
            }
            Audience::Announcement(filter) => {
                let sessions = self
                    .registry
                    .matching(|session| filter.matches(session.snapshot()));
                self.deliver(kind, sessions, frame);
            }
            Audience::GroupMembers { group_id, exclude } => {
                self.resolve_group(kind, group_id, exclude, frame);
            }
        }
    }

    fn resolve_group(&self, kind: &'static str, group_id: GroupId, exclude: UserId, frame: Frame) {
        let Ok(permit) = Arc::clone(&self.group_lookups).try_acquire_owned() else {
            warn!(
                event_type = kind,
                group_id,
                "Too many group lookups in flight, dropping event"
            );
            return;
        };
        let directory = Arc::clone(&self.directory);
        let control = self.control_tx.clone();

        tokio::spawn(async move {
            let lookup = directory.group_member_ids(group_id).await;
            drop(permit);
            match lookup {
                Ok(members) => {
                    let recipients = targeting::group_recipients(members, exclude);
                    trace!(group_id, recipients = recipients.len(), "Resolved group audience");
                    let _ = control.send(Command::Deliver {
                        kind,
                        recipients,
                        frame,
                    });
                }
                Err(err) => {
                    warn!(
                        event_type = kind,
                        group_id,
                        error = %err,
                        "Group lookup failed, dropping event"
                    );
                }
            }
        });
    }

    /// Offers `frame` to every session, then evicts the ones that refused.
    fn deliver(&self, kind: &'static str, sessions: Vec<Arc<Session>>, frame: Frame) {
        let targeted = sessions.len();
        let mut unhealthy = Vec::new();

        for session in sessions {
            let outcome = session.send(frame.clone());
            if !outcome.is_healthy() {
                unhealthy.push((session, outcome));
            }
        }

        let evicted = unhealthy.len();
        for (session, outcome) in unhealthy {
            let reason = match outcome {
                SendOutcome::Full => DisconnectReason::Backpressure,
                _ => DisconnectReason::QueueClosed,
            };
            warn!(
                session_id = %session.id(),
                user_id = session.user_id(),
                outcome = ?outcome,
                "Evicting session that cannot accept events"
            );
            self.forget(&session, reason);
        }

        debug!(
            event_type = kind,
            targeted,
            delivered = targeted - evicted,
            evicted,
            "Event fanned out"
        );
    }
}
