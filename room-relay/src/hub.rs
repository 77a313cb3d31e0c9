//! The dispatcher task.
//!
//! A single [`Hub`] owns the session table, the room registry, the transfer
//! registry and the credential store. Connection tasks reach it only through
//! a [`HubHandle`], which forwards events over a bounded channel. The hub
//! handles one event at a time and never awaits while doing so: every
//! delivery is a non-blocking enqueue onto a session's outbound queue.
//!
//! Events from one connection are handled in the order the connection sent
//! them. Sessions whose queues overflow while an event is being handled are
//! disconnected before the next event is taken.

use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use anyhow::{Result, anyhow};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::{
    command::{ChunkFrame, Command, CommandError, Inbound},
    credentials::CredentialStore,
    message::{Envelope, MessageType},
    room::RoomRegistry,
    session::{Session, SessionId, SessionTable},
    transfer::{TransferId, TransferRegistry},
};

const EVENT_QUEUE_CAPACITY: usize = 256;

pub const WELCOME: &str = "Welcome to the chat server! Please log in with /login username password";
const LOGIN_REQUIRED: &str = "You must log in first";
const LOGIN_REQUIRED_FOR_CHAT: &str = "You must log in first with /login username password";

#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Room every session joins on login. Created at startup.
    pub default_room: String,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            default_room: "general".to_string(),
        }
    }
}

#[derive(Debug)]
enum HubEvent {
    Register {
        id: SessionId,
        peer: Option<SocketAddr>,
        outbound: mpsc::Sender<Envelope>,
    },
    Inbound {
        id: SessionId,
        inbound: Inbound,
    },
    Unregister {
        id: SessionId,
    },
    ChunkDelivered {
        id: SessionId,
        transfer: TransferId,
    },
    Broadcast {
        envelope: Envelope,
    },
    Shutdown,
}

/// Cloneable entry point to a running hub.
#[derive(Debug, Clone)]
pub struct HubHandle {
    events: mpsc::Sender<HubEvent>,
    next_id: Arc<AtomicU64>,
}

impl HubHandle {
    /// Allocates a session id and hands the session's outbound queue to the hub.
    pub async fn register(
        &self,
        peer: Option<SocketAddr>,
        outbound: mpsc::Sender<Envelope>,
    ) -> Result<SessionId> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.send(HubEvent::Register { id, peer, outbound })
            .await?;
        Ok(id)
    }

    pub async fn submit(&self, id: SessionId, inbound: Inbound) -> Result<()> {
        self.send(HubEvent::Inbound { id, inbound }).await
    }

    /// Idempotent; also harmless once the hub has stopped.
    pub async fn unregister(&self, id: SessionId) {
        if self.send(HubEvent::Unregister { id }).await.is_err() {
            debug!(session = id, "hub already stopped during unregister");
        }
    }

    /// Reports that a relayed chunk was written to the receiving session's
    /// socket, which lets the sender send the next one.
    pub async fn chunk_delivered(&self, id: SessionId, transfer: TransferId) {
        if self.send(HubEvent::ChunkDelivered { id, transfer }).await.is_err() {
            debug!(session = id, %transfer, "hub already stopped during chunk acknowledgement");
        }
    }

    /// Room-scoped when the envelope names a room, otherwise sent to every
    /// authenticated session.
    pub async fn broadcast(&self, envelope: Envelope) -> Result<()> {
        self.send(HubEvent::Broadcast { envelope }).await
    }

    pub async fn shutdown(&self) {
        if self.send(HubEvent::Shutdown).await.is_err() {
            debug!("hub already stopped");
        }
    }

    async fn send(&self, event: HubEvent) -> Result<()> {
        self.events
            .send(event)
            .await
            .map_err(|_| anyhow!("hub has shut down"))
    }
}

/// Starts the hub task.
pub fn spawn(config: HubConfig) -> (HubHandle, JoinHandle<()>) {
    let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
    let hub = Hub::new(config);
    let task = tokio::spawn(hub.run(events_rx));
    let handle = HubHandle {
        events: events_tx,
        next_id: Arc::new(AtomicU64::new(1)),
    };
    (handle, task)
}

struct Hub {
    config: HubConfig,
    sessions: SessionTable,
    rooms: RoomRegistry,
    transfers: TransferRegistry,
    credentials: CredentialStore,
}

impl Hub {
    fn new(config: HubConfig) -> Self {
        let mut rooms = RoomRegistry::new();
        rooms.get_or_create(&config.default_room);
        Self {
            config,
            sessions: SessionTable::new(),
            rooms,
            transfers: TransferRegistry::new(),
            credentials: CredentialStore::new(),
        }
    }

    async fn run(mut self, mut events: mpsc::Receiver<HubEvent>) {
        while let Some(event) = events.recv().await {
            if !self.handle(event) {
                break;
            }
        }
        info!("hub stopped");
    }

    /// Returns `false` once the hub should stop.
    fn handle(&mut self, event: HubEvent) -> bool {
        match event {
            HubEvent::Register { id, peer, outbound } => self.register(id, peer, outbound),
            HubEvent::Inbound { id, inbound } => self.on_inbound(id, inbound),
            HubEvent::Unregister { id } => self.disconnect(id),
            HubEvent::ChunkDelivered { id, transfer } => {
                if !self.transfers.acknowledge(&mut self.sessions, id, transfer) {
                    debug!(session = id, %transfer, "acknowledgement for a finished transfer");
                }
            }
            HubEvent::Broadcast { envelope } => self.global_broadcast(envelope),
            HubEvent::Shutdown => {
                self.shutdown();
                return false;
            }
        }
        self.reap();
        true
    }

    fn register(&mut self, id: SessionId, peer: Option<SocketAddr>, outbound: mpsc::Sender<Envelope>) {
        self.sessions
            .insert(Session::new(id, peer, outbound, &self.config.default_room));
        info!(session = id, ?peer, sessions = self.sessions.len(), "session registered");
        self.sessions.notify(id, WELCOME);
    }

    /// Removes the session from its room, fails its transfers, and drops it,
    /// which closes its outbound queue. Unknown ids are ignored.
    fn disconnect(&mut self, id: SessionId) {
        let Some(session) = self.sessions.get(id) else {
            return;
        };
        let room = session.current_room().to_string();
        let username = session.username().to_string();
        let peer = session.peer();

        self.rooms.leave(&mut self.sessions, id, &room);
        let failed = self.transfers.fail_involving(&mut self.sessions, id);
        self.sessions.remove(id);
        info!(
            session = id,
            ?peer,
            user = %username,
            failed_transfers = failed.len(),
            sessions = self.sessions.len(),
            "session closed"
        );
    }

    fn reap(&mut self) {
        loop {
            let unresponsive = self.sessions.take_unresponsive();
            if unresponsive.is_empty() {
                break;
            }
            for id in unresponsive {
                warn!(session = id, "outbound queue unavailable; disconnecting session");
                self.disconnect(id);
            }
        }
    }

    fn global_broadcast(&mut self, envelope: Envelope) {
        if !envelope.room_name.is_empty() {
            let room = envelope.room_name.clone();
            let dropped = self.rooms.broadcast(&mut self.sessions, &room, &envelope);
            if !dropped.is_empty() {
                debug!(%room, ?dropped, "members dropped during broadcast");
            }
            return;
        }
        for id in self.sessions.authenticated_ids() {
            self.sessions.deliver(id, envelope.clone());
        }
    }

    fn shutdown(&mut self) {
        info!(sessions = self.sessions.len(), "hub shutting down");
        for id in self.sessions.ids() {
            self.sessions.notify(id, "Server shutting down");
        }
        // Dropping every session closes every outbound queue.
        drop(self.sessions.drain());
    }

    fn on_inbound(&mut self, id: SessionId, inbound: Inbound) {
        let Some(session) = self.sessions.get(id) else {
            debug!(session = id, "input from a closed session ignored");
            return;
        };
        let authenticated = session.is_authenticated();

        match inbound {
            Inbound::Command(command) => self.on_command(id, authenticated, command),
            Inbound::Chunk(frame) if authenticated => self.on_chunk(id, frame),
            Inbound::Chat(text) if authenticated => self.on_chat(id, text),
            Inbound::Chunk(_) | Inbound::Chat(_) => {
                self.sessions.notify(id, LOGIN_REQUIRED_FOR_CHAT);
            }
            Inbound::Invalid(CommandError::UnsupportedEnvelope(_)) if !authenticated => {
                self.sessions.notify(id, LOGIN_REQUIRED_FOR_CHAT);
            }
            Inbound::Invalid(err) if !authenticated && err.requires_login() => {
                self.sessions.notify(id, LOGIN_REQUIRED);
            }
            Inbound::Invalid(err) => {
                debug!(session = id, error = %err, "protocol error");
                self.sessions.notify(id, err.to_string());
            }
        }
    }

    fn on_chat(&mut self, id: SessionId, text: String) {
        let Some(session) = self.sessions.get(id) else {
            return;
        };
        let envelope = Envelope::chat(session.username(), session.current_room(), text);
        debug!(session = id, room = %envelope.room_name, "chat published");
        self.global_broadcast(envelope);
    }

    fn on_chunk(&mut self, id: SessionId, frame: ChunkFrame) {
        match self.transfers.relay_chunk(&mut self.sessions, id, frame) {
            Ok(report) => debug!(
                session = id,
                transfer = %report.id,
                relayed = report.relayed,
                complete = report.complete,
                "chunk relayed"
            ),
            Err(err) => {
                debug!(session = id, error = %err, "chunk dropped");
                self.sessions.notify(id, err.to_string());
            }
        }
    }

    fn on_command(&mut self, id: SessionId, authenticated: bool, command: Command) {
        debug!(session = id, ?command, "command received");
        if !authenticated && !matches!(command, Command::Login { .. }) {
            self.sessions.notify(id, LOGIN_REQUIRED);
            return;
        }

        match command {
            Command::Login { username, password } => self.login(id, &username, &password),
            Command::Join { room } => self.join(id, &room),
            Command::Rooms => self.list_rooms(id),
            Command::Users => self.list_users(id),
            Command::SendFile {
                recipient,
                file_name,
                size,
            } => self.offer_file(id, &recipient, &file_name, size),
            Command::Accept { sender } => {
                if let Err(err) = self.transfers.accept(&mut self.sessions, id, sender.as_deref()) {
                    self.sessions.notify(id, err.to_string());
                }
            }
            Command::Reject { sender } => {
                if let Err(err) = self.transfers.reject(&mut self.sessions, id, &sender) {
                    self.sessions.notify(id, err.to_string());
                }
            }
        }
    }

    fn login(&mut self, id: SessionId, username: &str, password: &str) {
        if let Some(current) = self.sessions.get(id).filter(|s| s.is_authenticated()) {
            let reply = format!("You are already logged in as {}", current.username());
            self.sessions.notify(id, reply);
            return;
        }
        if self.sessions.find_online(username).is_some() {
            self.sessions
                .notify(id, format!("User {username} is already logged in"));
            return;
        }

        let greeting = if self.credentials.contains(username) {
            if !self.credentials.authenticate(username, password) {
                warn!(session = id, user = username, "failed login attempt");
                self.sessions.notify(id, "Invalid credentials");
                return;
            }
            info!(session = id, user = username, "user logged in");
            "Login successful!"
        } else {
            if !self.credentials.register(username, password) {
                self.sessions.notify(id, "Invalid credentials");
                return;
            }
            info!(session = id, user = username, "user registered");
            "Registered and logged in!"
        };

        if let Some(session) = self.sessions.get_mut(id) {
            session.authenticate(username);
        }
        self.sessions.notify(id, greeting);
        let room = self.config.default_room.clone();
        self.rooms.join(&mut self.sessions, id, &room);
    }

    fn join(&mut self, id: SessionId, room: &str) {
        let Some(session) = self.sessions.get(id) else {
            return;
        };
        let current = session.current_room().to_string();
        let is_member = self.rooms.is_member(&current, id);

        if is_member && current == room {
            self.sessions
                .notify(id, format!("You are already in room {room}"));
            return;
        }
        // Leave then join: observable as two separate steps.
        if is_member {
            self.rooms.leave(&mut self.sessions, id, &current);
        }
        self.rooms.join(&mut self.sessions, id, room);
        self.sessions
            .notify(id, format!("You have joined room: {room}"));
    }

    fn list_rooms(&mut self, id: SessionId) {
        let mut listing = String::from("Available rooms:\n");
        for name in self.rooms.names() {
            listing.push_str(&format!("- {name}\n"));
        }
        self.sessions.notify(id, listing);
    }

    fn list_users(&mut self, id: SessionId) {
        let Some(session) = self.sessions.get(id) else {
            return;
        };
        let room = session.current_room().to_string();
        if !self.rooms.is_member(&room, id) {
            self.sessions.notify(id, "You are not in any room");
            return;
        }

        let mut listing = format!("Users in room {room}:\n");
        for name in self.rooms.member_names(&room, &self.sessions) {
            listing.push_str(&format!("- {name}\n"));
        }
        self.sessions.notify(id, listing);
    }

    fn offer_file(&mut self, id: SessionId, recipient_name: &str, file_name: &str, size: u64) {
        let Some(recipient) = self.sessions.find_online(recipient_name) else {
            self.sessions.notify(id, "User not found or not online");
            return;
        };
        if recipient == id {
            self.sessions
                .notify(id, "You cannot send a file to yourself");
            return;
        }
        let Some(transfer_id) = self
            .transfers
            .initiate(&self.sessions, id, recipient, file_name, size)
        else {
            self.sessions.notify(id, "Error creating file transfer");
            return;
        };

        let sender_name = self.sessions.username(id).unwrap_or_default().to_string();
        let offer = Envelope::transfer(
            MessageType::FileRequest,
            &sender_name,
            file_name,
            transfer_id,
            format!(
                "Incoming file: {file_name} ({:.2} KB). Type /accept {sender_name} or /reject {sender_name}",
                size as f64 / 1024.0
            ),
        );
        self.sessions.deliver(recipient, offer);
        self.sessions.notify(
            id,
            format!("File transfer request sent. Waiting for {recipient_name} to accept..."),
        );
    }
}
