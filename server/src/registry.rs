//! Registry of live sessions, keyed by user.
//!
//! A user may hold several sessions at once (one per tab or device). The
//! registry maps each user ID to the set of that user's live sessions and
//! keeps two invariants:
//!
//! - a session appears under exactly one user, the one it authenticated as;
//! - a user key exists only while its set is non-empty.
//!
//! # Thread Safety
//!
//! The map sits behind a [`RwLock`]. Lookups during fan-out take the read
//! lock and return owned snapshots, so the lock is never held while a caller
//! awaits or sends. Only the hub mutates the registry.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use tracing::trace;

use crate::session::{Session, SessionId};
use crate::types::UserId;

/// Concurrency-safe multimap from user to live sessions.
#[derive(Default)]
pub struct Registry {
    sessions: RwLock<HashMap<UserId, HashMap<SessionId, Arc<Session>>>>,
}

impl Registry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a session under its user.
    ///
    /// Returns `false` if the same session was already present.
    pub fn add(&self, session: &Arc<Session>) -> bool {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        let inserted = sessions
            .entry(session.user_id())
            .or_default()
            .insert(session.id(), Arc::clone(session))
            .is_none();

        trace!(
            user_id = session.user_id(),
            session_id = %session.id(),
            inserted,
            "Registry add"
        );
        inserted
    }

    /// Removes a session, dropping the user entry once it is empty.
    ///
    /// Removing a session that is not present is a no-op.
    pub fn remove(&self, user_id: UserId, session_id: SessionId) -> Option<Arc<Session>> {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        let user_sessions = sessions.get_mut(&user_id)?;
        let removed = user_sessions.remove(&session_id);

        if user_sessions.is_empty() {
            sessions.remove(&user_id);
        }

        trace!(
            user_id,
            session_id = %session_id,
            removed = removed.is_some(),
            "Registry remove"
        );
        removed
    }

    /// Snapshot of a user's live sessions.
    pub fn sessions_for(&self, user_id: UserId) -> Vec<Arc<Session>> {
        let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
        sessions
            .get(&user_id)
            .map(|set| set.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Snapshot of every live session accepted by `predicate`.
    pub fn matching<F>(&self, predicate: F) -> Vec<Arc<Session>>
    where
        F: Fn(&Session) -> bool,
    {
        let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
        sessions
            .values()
            .flat_map(|set| set.values())
            .filter(|session| predicate(session))
            .cloned()
            .collect()
    }

    /// Total number of live sessions.
    pub fn connection_count(&self) -> usize {
        let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
        sessions.values().map(HashMap::len).sum()
    }

    /// Number of users with at least one live session.
    pub fn user_count(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Removes and returns every session.
    pub fn drain(&self) -> Vec<Arc<Session>> {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        sessions
            .drain()
            .flat_map(|(_, set)| set.into_values())
            .collect()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("users", &self.user_count())
            .field("connections", &self.connection_count())
            .finish()
    }
}
