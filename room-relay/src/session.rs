//! Server-side state for live connections.
//!
//! A [`Session`] holds the only `Sender` for its connection's outbound queue.
//! Dropping the session therefore closes the queue, which in turn ends the
//! connection's write pump. Deliveries never block: a full queue marks the
//! session unresponsive and the hub disconnects it.

use std::{collections::HashMap, net::SocketAddr};

use tokio::sync::mpsc::{self, error::TrySendError};

use crate::message::Envelope;

pub type SessionId = u64;

/// Outcome of enqueueing one envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// The queue was full; the session must be disconnected.
    Saturated,
    /// The write pump is gone.
    Closed,
}

/// Receive-side accounting for the one file a session may be receiving.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingFile {
    pub file_name: String,
    pub expected: u64,
    pub received: u64,
}

impl IncomingFile {
    pub fn new(file_name: &str, expected: u64) -> Self {
        Self {
            file_name: file_name.to_string(),
            expected,
            received: 0,
        }
    }

    /// Counts `len` more bytes and returns the received share in percent.
    pub fn record(&mut self, len: u64) -> f64 {
        self.received += len;
        self.received as f64 / self.expected.max(1) as f64 * 100.0
    }
}

#[derive(Debug)]
pub struct Session {
    id: SessionId,
    peer: Option<SocketAddr>,
    outbound: mpsc::Sender<Envelope>,
    username: String,
    authenticated: bool,
    current_room: String,
    incoming: Option<IncomingFile>,
    unresponsive: bool,
}

impl Session {
    pub fn new(
        id: SessionId,
        peer: Option<SocketAddr>,
        outbound: mpsc::Sender<Envelope>,
        default_room: &str,
    ) -> Self {
        Self {
            id,
            peer,
            outbound,
            username: String::new(),
            authenticated: false,
            current_room: default_room.to_string(),
            incoming: None,
            unresponsive: false,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    /// One-way: there is no logout.
    pub fn authenticate(&mut self, username: &str) {
        self.username = username.to_string();
        self.authenticated = true;
    }

    pub fn current_room(&self) -> &str {
        &self.current_room
    }

    pub fn set_current_room(&mut self, room: &str) {
        self.current_room = room.to_string();
    }

    pub fn incoming(&self) -> Option<&IncomingFile> {
        self.incoming.as_ref()
    }

    pub fn incoming_mut(&mut self) -> Option<&mut IncomingFile> {
        self.incoming.as_mut()
    }

    pub fn set_incoming(&mut self, incoming: Option<IncomingFile>) {
        self.incoming = incoming;
    }

    pub fn is_unresponsive(&self) -> bool {
        self.unresponsive
    }

    /// Whether `slots` more envelopes fit in the outbound queue right now.
    pub fn has_room(&self, slots: usize) -> bool {
        self.outbound.capacity() >= slots
    }

    /// Enqueues without waiting.
    pub fn send(&self, envelope: Envelope) -> Delivery {
        match self.outbound.try_send(envelope) {
            Ok(()) => Delivery::Delivered,
            Err(TrySendError::Full(_)) => Delivery::Saturated,
            Err(TrySendError::Closed(_)) => Delivery::Closed,
        }
    }
}

/// Every live session, keyed by id.
#[derive(Debug, Default)]
pub struct SessionTable {
    sessions: HashMap<SessionId, Session>,
    unresponsive: Vec<SessionId>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, session: Session) {
        self.sessions.insert(session.id(), session);
    }

    /// Removes the session, dropping its queue sender. A second call is a no-op.
    pub fn remove(&mut self, id: SessionId) -> Option<Session> {
        self.sessions.remove(&id)
    }

    pub fn get(&self, id: SessionId) -> Option<&Session> {
        self.sessions.get(&id)
    }

    pub fn get_mut(&mut self, id: SessionId) -> Option<&mut Session> {
        self.sessions.get_mut(&id)
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.sessions.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn username(&self, id: SessionId) -> Option<&str> {
        self.sessions.get(&id).map(Session::username)
    }

    pub fn is_authenticated(&self, id: SessionId) -> bool {
        self.sessions
            .get(&id)
            .is_some_and(Session::is_authenticated)
    }

    /// Finds the live authenticated session for `username`.
    pub fn find_online(&self, username: &str) -> Option<SessionId> {
        self.sessions
            .values()
            .find(|session| session.is_authenticated() && session.username() == username)
            .map(Session::id)
    }

    pub fn ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self.sessions.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn authenticated_ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self
            .sessions
            .values()
            .filter(|session| session.is_authenticated())
            .map(Session::id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Enqueues onto a session's outbound queue.
    ///
    /// Returns `true` on success. On a full or closed queue the session is
    /// flagged, later deliveries to it are skipped, and its id is queued for
    /// [`SessionTable::take_unresponsive`].
    pub fn deliver(&mut self, id: SessionId, envelope: Envelope) -> bool {
        let Some(session) = self.sessions.get_mut(&id) else {
            return false;
        };
        if session.unresponsive {
            return false;
        }

        match session.send(envelope) {
            Delivery::Delivered => true,
            Delivery::Saturated | Delivery::Closed => {
                session.unresponsive = true;
                self.unresponsive.push(id);
                false
            }
        }
    }

    pub fn has_room(&self, id: SessionId, slots: usize) -> bool {
        self.sessions
            .get(&id)
            .is_some_and(|session| !session.unresponsive && session.has_room(slots))
    }

    pub fn notify(&mut self, id: SessionId, content: impl Into<String>) -> bool {
        self.deliver(id, Envelope::notice(content))
    }

    /// Drains the ids of sessions whose queues overflowed since the last call.
    pub fn take_unresponsive(&mut self) -> Vec<SessionId> {
        std::mem::take(&mut self.unresponsive)
    }

    pub fn drain(&mut self) -> Vec<Session> {
        self.unresponsive.clear();
        self.sessions.drain().map(|(_, session)| session).collect()
    }
}
