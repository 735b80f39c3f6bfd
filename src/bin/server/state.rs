//! Session registry: the authoritative view of who is online.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::BytesMut;
use tokio::sync::{RwLock, mpsc};

/// A live session: the binding between an authenticated username and its
/// connection's outbound channel.
#[derive(Debug)]
pub struct UserSession {
    pub username: String,

    /// Channel to the connection's writer task
    pub tx: mpsc::UnboundedSender<BytesMut>,
}

impl UserSession {
    pub fn new(username: String, tx: mpsc::UnboundedSender<BytesMut>) -> Self {
        Self { username, tx }
    }
}

/// The registry of live sessions. All session add/remove flows through
/// here; nothing else mutates it.
#[derive(Debug, Default)]
pub struct ServerState {
    sessions: HashMap<String, UserSession>,
}

impl ServerState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session. Fails (returns false) if the username already
    /// has a live session; the caller rejects the new login rather than
    /// displacing the old connection.
    pub fn add_session(&mut self, session: UserSession) -> bool {
        if self.sessions.contains_key(&session.username) {
            return false;
        }
        self.sessions.insert(session.username.clone(), session);
        true
    }

    /// Remove a session. Idempotent: removing an absent username is a no-op.
    pub fn remove_session(&mut self, username: &str) -> Option<UserSession> {
        self.sessions.remove(username)
    }

    pub fn is_online(&self, username: &str) -> bool {
        self.sessions.contains_key(username)
    }

    pub fn online_count(&self) -> usize {
        self.sessions.len()
    }

    /// Clone one user's outbound channel, if online.
    pub fn sender(&self, username: &str) -> Option<mpsc::UnboundedSender<BytesMut>> {
        self.sessions.get(username).map(|s| s.tx.clone())
    }

    /// Point-in-time snapshot of every live session's outbound channel,
    /// for fan-out without holding the registry lock during delivery.
    pub fn snapshot(&self) -> Vec<(String, mpsc::UnboundedSender<BytesMut>)> {
        self.sessions
            .values()
            .map(|s| (s.username.clone(), s.tx.clone()))
            .collect()
    }
}

pub type SharedState = Arc<RwLock<ServerState>>;
