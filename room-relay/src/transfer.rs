//! In-flight file transfers between two sessions.
//!
//! The registry keeps accounting metadata only. Chunk bytes are forwarded to
//! the receiver's queue as soon as they arrive and are never staged here.
//!
//! ```text
//! pending --accept--> accepted --chunk(s)--> complete
//! pending --reject--> rejected
//! pending | accepted --party disconnects--> failed
//! ```
//!
//! Entries are removed on reaching any terminal state.
//!
//! Senders are paced by `file-ack`: the receiver's write pump reports each
//! chunk it has written, and only then does the sender hear that it may send
//! the next one. A sender that runs ahead of the receiver's queue fails its
//! own transfer instead of getting the receiver disconnected.

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    time::Instant,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    command::ChunkFrame,
    message::{Envelope, MessageType},
    session::{IncomingFile, SessionId, SessionTable},
};

/// Generated at `initiate` time and carried on transfer envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransferId(pub u64);

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Pending,
    Accepted,
    Complete,
    Rejected,
    Failed,
}

impl TransferStatus {
    fn can_become(self, next: TransferStatus) -> bool {
        use TransferStatus::*;
        matches!(
            (self, next),
            (Pending, Accepted) | (Pending, Rejected) | (Pending, Failed) | (Accepted, Complete) | (Accepted, Failed)
        )
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransferError {
    #[error("No pending file transfers. Usage: /accept username")]
    NothingPending,
    #[error("No pending file transfer from {sender}")]
    NoPending { sender: String },
    #[error("No accepted transfer for {file_name}")]
    NoAccepted { file_name: String },
    #[error("You are already receiving {file_name}")]
    ReceiverBusy { file_name: String },
    #[error("Transfer of {file_name} failed: {receiver} is not keeping up")]
    ReceiverBehind { file_name: String, receiver: String },
    #[error("Unknown transfer {0}")]
    Unknown(TransferId),
    #[error("Transfer {id} cannot move from {from:?} to {to:?}")]
    IllegalTransition {
        id: TransferId,
        from: TransferStatus,
        to: TransferStatus,
    },
}

#[derive(Debug, Clone)]
pub struct Transfer {
    pub id: TransferId,
    pub sender: SessionId,
    pub sender_name: String,
    pub receiver: SessionId,
    pub receiver_name: String,
    pub file_name: String,
    pub size: u64,
    pub relayed: u64,
    pub status: TransferStatus,
    pub started_at: Instant,
}

impl Transfer {
    fn transition(&mut self, next: TransferStatus) -> Result<(), TransferError> {
        if !self.status.can_become(next) {
            return Err(TransferError::IllegalTransition {
                id: self.id,
                from: self.status,
                to: next,
            });
        }
        debug!(transfer = %self.id, from = ?self.status, to = ?next, "transfer status changed");
        self.status = next;
        Ok(())
    }

    fn percent(&self) -> f64 {
        self.relayed as f64 / self.size as f64 * 100.0
    }
}

type TransferKey = (SessionId, SessionId, String);

/// Queue slots one relay step may use on the receiver: the chunk, a progress
/// notice and the completion envelope.
const RELAY_SLOTS: usize = 3;

/// Result of relaying one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayReport {
    pub id: TransferId,
    pub relayed: u64,
    pub complete: bool,
}

#[derive(Debug, Default)]
pub struct TransferRegistry {
    transfers: BTreeMap<TransferId, Transfer>,
    by_key: HashMap<TransferKey, TransferId>,
    next_id: u64,
}

impl TransferRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: TransferId) -> Option<&Transfer> {
        self.transfers.get(&id)
    }

    pub fn len(&self) -> usize {
        self.transfers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transfers.is_empty()
    }

    /// Records an offer of `file_name` from `sender` to `receiver`.
    ///
    /// Returns `None` for an empty name, a zero size, or sessions that are
    /// not live and authenticated. Re-offering a still-pending file refreshes
    /// its size and start time and returns the existing id.
    pub fn initiate(
        &mut self,
        sessions: &SessionTable,
        sender: SessionId,
        receiver: SessionId,
        file_name: &str,
        size: u64,
    ) -> Option<TransferId> {
        if file_name.is_empty() || size == 0 || sender == receiver {
            return None;
        }
        if !sessions.is_authenticated(sender) || !sessions.is_authenticated(receiver) {
            return None;
        }

        let key = (sender, receiver, file_name.to_string());
        if let Some(id) = self.by_key.get(&key).copied() {
            if let Some(existing) = self.transfers.get_mut(&id) {
                if existing.status == TransferStatus::Pending {
                    existing.size = size;
                    existing.started_at = Instant::now();
                    info!(transfer = %id, file = file_name, size, "transfer re-requested");
                    return Some(id);
                }
            }
            // An accepted transfer for the same key is still in flight.
            return None;
        }

        self.next_id += 1;
        let id = TransferId(self.next_id);
        let transfer = Transfer {
            id,
            sender,
            sender_name: sessions.username(sender).unwrap_or_default().to_string(),
            receiver,
            receiver_name: sessions.username(receiver).unwrap_or_default().to_string(),
            file_name: file_name.to_string(),
            size,
            relayed: 0,
            status: TransferStatus::Pending,
            started_at: Instant::now(),
        };
        info!(
            transfer = %id,
            sender = %transfer.sender_name,
            receiver = %transfer.receiver_name,
            file = file_name,
            size,
            "transfer offered"
        );
        self.transfers.insert(id, transfer);
        self.by_key.insert(key, id);
        Some(id)
    }

    /// The oldest pending transfer addressed to `receiver`.
    pub fn oldest_pending_for(&self, receiver: SessionId) -> Option<TransferId> {
        self.transfers
            .values()
            .find(|t| t.receiver == receiver && t.status == TransferStatus::Pending)
            .map(|t| t.id)
    }

    /// The pending transfer addressed to `receiver` from `sender_name`.
    pub fn pending_from(&self, receiver: SessionId, sender_name: &str) -> Option<TransferId> {
        self.transfers
            .values()
            .find(|t| {
                t.receiver == receiver
                    && t.sender_name == sender_name
                    && t.status == TransferStatus::Pending
            })
            .map(|t| t.id)
    }

    /// The accepted transfer `sender` is streaming under `file_name`.
    pub fn accepted_from(&self, sender: SessionId, file_name: &str) -> Option<TransferId> {
        self.transfers
            .values()
            .find(|t| {
                t.sender == sender
                    && t.file_name == file_name
                    && t.status == TransferStatus::Accepted
            })
            .map(|t| t.id)
    }

    /// Accepts the pending transfer from `sender_name` (or the oldest pending
    /// one when `None`) and sends `file-accepted` to its sender.
    pub fn accept(
        &mut self,
        sessions: &mut SessionTable,
        receiver: SessionId,
        sender_name: Option<&str>,
    ) -> Result<TransferId, TransferError> {
        let id = match sender_name {
            Some(name) => self
                .pending_from(receiver, name)
                .ok_or_else(|| TransferError::NoPending {
                    sender: name.to_string(),
                })?,
            None => self
                .oldest_pending_for(receiver)
                .ok_or(TransferError::NothingPending)?,
        };

        if let Some(busy) = sessions.get(receiver).and_then(|s| s.incoming()) {
            return Err(TransferError::ReceiverBusy {
                file_name: busy.file_name.clone(),
            });
        }

        let transfer = self
            .transfers
            .get_mut(&id)
            .ok_or_else(|| TransferError::NoPending {
                sender: sender_name.unwrap_or_default().to_string(),
            })?;
        transfer.transition(TransferStatus::Accepted)?;
        transfer.started_at = Instant::now();
        let transfer = transfer.clone();

        if let Some(session) = sessions.get_mut(receiver) {
            session.set_incoming(Some(IncomingFile::new(&transfer.file_name, transfer.size)));
        }
        info!(transfer = %id, receiver = %transfer.receiver_name, "transfer accepted");

        sessions.deliver(
            transfer.sender,
            Envelope::transfer(
                MessageType::FileAccepted,
                &transfer.receiver_name,
                &transfer.file_name,
                id,
                format!(
                    "{} accepted {}. Sending...",
                    transfer.receiver_name, transfer.file_name
                ),
            ),
        );
        sessions.notify(
            receiver,
            format!(
                "Accepted {} from {}",
                transfer.file_name, transfer.sender_name
            ),
        );
        Ok(id)
    }

    /// Rejects the pending transfer from `sender_name`, tells its sender with
    /// `file-rejected`, and forgets it.
    pub fn reject(
        &mut self,
        sessions: &mut SessionTable,
        receiver: SessionId,
        sender_name: &str,
    ) -> Result<TransferId, TransferError> {
        let id = self
            .pending_from(receiver, sender_name)
            .ok_or_else(|| TransferError::NoPending {
                sender: sender_name.to_string(),
            })?;
        let transfer = self.finish(id, TransferStatus::Rejected)?;
        info!(transfer = %id, receiver = %transfer.receiver_name, "transfer rejected");

        sessions.deliver(
            transfer.sender,
            Envelope::transfer(
                MessageType::FileRejected,
                &transfer.receiver_name,
                &transfer.file_name,
                id,
                format!(
                    "{} rejected {}",
                    transfer.receiver_name, transfer.file_name
                ),
            ),
        );
        sessions.notify(
            receiver,
            format!(
                "Rejected {} from {}",
                transfer.file_name, transfer.sender_name
            ),
        );
        Ok(id)
    }

    /// Forwards one chunk from `sender` to the receiver of its accepted
    /// transfer, then updates progress and completion.
    pub fn relay_chunk(
        &mut self,
        sessions: &mut SessionTable,
        sender: SessionId,
        chunk: ChunkFrame,
    ) -> Result<RelayReport, TransferError> {
        let no_accepted = || TransferError::NoAccepted {
            file_name: chunk.file_name.clone(),
        };
        let id = match chunk.transfer_id {
            Some(id) => self
                .transfers
                .get(&id)
                .filter(|t| t.sender == sender && t.status == TransferStatus::Accepted)
                .map(|t| t.id),
            None => self.accepted_from(sender, &chunk.file_name),
        }
        .ok_or_else(no_accepted)?;

        let transfer = self.transfers.get_mut(&id).ok_or_else(no_accepted)?;
        if !sessions.has_room(transfer.receiver, RELAY_SLOTS) {
            let receiver = transfer.receiver;
            let err = TransferError::ReceiverBehind {
                file_name: transfer.file_name.clone(),
                receiver: transfer.receiver_name.clone(),
            };
            self.finish(id, TransferStatus::Failed)?;
            if let Some(session) = sessions.get_mut(receiver) {
                session.set_incoming(None);
            }
            warn!(transfer = %id, "sender outran the receiver's queue");
            sessions.notify(receiver, err.to_string());
            return Err(err);
        }

        let len = chunk.data.len() as u64;
        let before = decile(transfer.relayed, transfer.size);
        transfer.relayed += len;
        let complete = chunk.is_last || transfer.relayed >= transfer.size;
        let crossed = decile(transfer.relayed, transfer.size) > before;
        let snapshot = transfer.clone();

        sessions.deliver(
            snapshot.receiver,
            Envelope::chunk(
                &snapshot.sender_name,
                &snapshot.file_name,
                Some(id),
                chunk.data,
                complete,
            ),
        );
        let received = sessions
            .get_mut(snapshot.receiver)
            .and_then(|s| s.incoming_mut())
            .map(|incoming| incoming.record(len));

        if crossed || complete {
            let sent = snapshot.percent();
            let received = received.unwrap_or(sent);
            sessions.notify(
                snapshot.sender,
                format!("Sending {}: {sent:.1}% complete", snapshot.file_name),
            );
            sessions.notify(
                snapshot.receiver,
                format!("Receiving {}: {received:.1}% complete", snapshot.file_name),
            );
        }

        if complete {
            let done = self.finish(id, TransferStatus::Complete)?;
            if let Some(session) = sessions.get_mut(done.receiver) {
                session.set_incoming(None);
            }
            info!(
                transfer = %id,
                bytes = done.relayed,
                elapsed = ?done.started_at.elapsed(),
                "transfer complete"
            );
            let content = format!(
                "Transfer of {} complete ({} bytes)",
                done.file_name, done.relayed
            );
            for party in [done.sender, done.receiver] {
                sessions.deliver(
                    party,
                    Envelope::transfer(
                        MessageType::FileComplete,
                        &done.sender_name,
                        &done.file_name,
                        id,
                        content.clone(),
                    ),
                );
            }
        }

        Ok(RelayReport {
            id,
            relayed: snapshot.relayed,
            complete,
        })
    }

    /// Called once `receiver` has been handed a chunk of `id`. Sends the
    /// sender a `file-ack` so it may send the next chunk. Returns `false` if
    /// the transfer is no longer in flight, e.g. after its last chunk.
    pub fn acknowledge(&self, sessions: &mut SessionTable, receiver: SessionId, id: TransferId) -> bool {
        let Some(transfer) = self
            .transfers
            .get(&id)
            .filter(|t| t.receiver == receiver && t.status == TransferStatus::Accepted)
        else {
            return false;
        };
        sessions.deliver(
            transfer.sender,
            Envelope::transfer(
                MessageType::FileAck,
                &transfer.receiver_name,
                &transfer.file_name,
                id,
                format!("{} of {} bytes delivered", transfer.relayed, transfer.size),
            ),
        )
    }

    /// Fails every transfer involving `gone`, telling the surviving party.
    pub fn fail_involving(&mut self, sessions: &mut SessionTable, gone: SessionId) -> Vec<TransferId> {
        let ids: Vec<TransferId> = self
            .transfers
            .values()
            .filter(|t| t.sender == gone || t.receiver == gone)
            .map(|t| t.id)
            .collect();

        let mut failed = Vec::new();
        for id in ids {
            let transfer = match self.finish(id, TransferStatus::Failed) {
                Ok(transfer) => transfer,
                Err(err) => {
                    warn!(transfer = %id, error = %err, "could not fail transfer");
                    continue;
                }
            };
            let (survivor, departed) = if transfer.sender == gone {
                (transfer.receiver, &transfer.sender_name)
            } else {
                (transfer.sender, &transfer.receiver_name)
            };
            if transfer.receiver == survivor {
                if let Some(session) = sessions.get_mut(survivor) {
                    if session.incoming().is_some_and(|f| f.file_name == transfer.file_name) {
                        session.set_incoming(None);
                    }
                }
            }
            warn!(transfer = %id, departed = %departed, "transfer failed");
            sessions.notify(
                survivor,
                format!(
                    "Transfer of {} failed: {departed} disconnected",
                    transfer.file_name
                ),
            );
            failed.push(id);
        }
        failed
    }

    /// Applies a terminal transition and removes the entry.
    fn finish(&mut self, id: TransferId, status: TransferStatus) -> Result<Transfer, TransferError> {
        let transfer = self
            .transfers
            .get_mut(&id)
            .ok_or(TransferError::Unknown(id))?;
        transfer.transition(status)?;
        let transfer = self
            .transfers
            .remove(&id)
            .ok_or(TransferError::Unknown(id))?;
        self.by_key.remove(&(
            transfer.sender,
            transfer.receiver,
            transfer.file_name.clone(),
        ));
        Ok(transfer)
    }
}

fn decile(relayed: u64, size: u64) -> u64 {
    relayed.min(size) * 10 / size.max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::tests::attach;
    use tokio::sync::mpsc;

    fn chunk(file_name: &str, len: usize, is_last: bool) -> ChunkFrame {
        ChunkFrame {
            file_name: file_name.into(),
            transfer_id: None,
            data: vec![7; len],
            is_last,
        }
    }

    fn drain(rx: &mut mpsc::Receiver<Envelope>) -> Vec<Envelope> {
        let mut out = Vec::new();
        while let Ok(envelope) = rx.try_recv() {
            out.push(envelope);
        }
        out
    }

    fn kinds(envelopes: &[Envelope]) -> Vec<MessageType> {
        envelopes.iter().map(|e| e.kind).collect()
    }

    #[test]
    fn initiate_creates_pending_and_validates_input() {
        let mut sessions = SessionTable::new();
        let _a = attach(&mut sessions, 1, 16, Some("alice"));
        let _b = attach(&mut sessions, 2, 16, Some("bob"));
        let _anon = attach(&mut sessions, 3, 16, None);
        let mut registry = TransferRegistry::new();

        assert_eq!(registry.initiate(&sessions, 1, 2, "", 10), None);
        assert_eq!(registry.initiate(&sessions, 1, 2, "a.txt", 0), None);
        assert_eq!(registry.initiate(&sessions, 1, 3, "a.txt", 10), None);
        assert_eq!(registry.initiate(&sessions, 1, 9, "a.txt", 10), None);
        assert_eq!(registry.initiate(&sessions, 1, 1, "a.txt", 10), None);

        let id = registry.initiate(&sessions, 1, 2, "a.txt", 10).expect("created");
        let transfer = registry.get(id).expect("stored");
        assert_eq!(transfer.status, TransferStatus::Pending);
        assert_eq!(transfer.sender_name, "alice");
        assert_eq!(transfer.receiver_name, "bob");
    }

    #[test]
    fn re_request_refreshes_the_pending_entry() {
        let mut sessions = SessionTable::new();
        let _a = attach(&mut sessions, 1, 16, Some("alice"));
        let _b = attach(&mut sessions, 2, 16, Some("bob"));
        let mut registry = TransferRegistry::new();

        let first = registry.initiate(&sessions, 1, 2, "a.txt", 10).expect("created");
        let second = registry.initiate(&sessions, 1, 2, "a.txt", 99).expect("refreshed");

        assert_eq!(first, second);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get(first).map(|t| t.size), Some(99));
    }

    #[test]
    fn reject_removes_and_later_accept_reports_nothing_pending() {
        let mut sessions = SessionTable::new();
        let mut alice = attach(&mut sessions, 1, 16, Some("alice"));
        let _bob = attach(&mut sessions, 2, 16, Some("bob"));
        let mut registry = TransferRegistry::new();
        let id = registry.initiate(&sessions, 1, 2, "a.txt", 10).expect("created");

        assert_eq!(registry.reject(&mut sessions, 2, "alice"), Ok(id));
        assert!(registry.get(id).is_none());
        assert!(registry.is_empty());

        let received = drain(&mut alice);
        assert_eq!(kinds(&received), vec![MessageType::FileRejected]);
        assert_eq!(received[0].transfer_id, Some(id));

        assert_eq!(
            registry.accept(&mut sessions, 2, Some("alice")),
            Err(TransferError::NoPending {
                sender: "alice".into()
            })
        );
        assert_eq!(
            registry.accept(&mut sessions, 2, None),
            Err(TransferError::NothingPending)
        );
    }

    #[test]
    fn chunks_before_accept_are_dropped() {
        let mut sessions = SessionTable::new();
        let _a = attach(&mut sessions, 1, 16, Some("alice"));
        let mut bob = attach(&mut sessions, 2, 16, Some("bob"));
        let mut registry = TransferRegistry::new();
        registry.initiate(&sessions, 1, 2, "a.txt", 10).expect("created");

        let result = registry.relay_chunk(&mut sessions, 1, chunk("a.txt", 5, false));

        assert_eq!(
            result,
            Err(TransferError::NoAccepted {
                file_name: "a.txt".into()
            })
        );
        assert!(drain(&mut bob).is_empty());
    }

    #[test]
    fn exact_size_with_last_flag_completes_once() {
        let mut sessions = SessionTable::new();
        let mut alice = attach(&mut sessions, 1, 32, Some("alice"));
        let mut bob = attach(&mut sessions, 2, 32, Some("bob"));
        let mut registry = TransferRegistry::new();
        let id = registry
            .initiate(&sessions, 1, 2, "report.txt", 16384)
            .expect("created");
        registry.accept(&mut sessions, 2, Some("alice")).expect("accepted");
        assert_eq!(
            sessions.get(2).and_then(|s| s.incoming()).map(|f| f.expected),
            Some(16384)
        );
        drain(&mut alice);
        drain(&mut bob);

        let first = registry
            .relay_chunk(&mut sessions, 1, chunk("report.txt", 8192, false))
            .expect("first chunk");
        assert!(!first.complete);
        assert_eq!(registry.get(id).map(|t| t.relayed), Some(8192));

        let second = registry
            .relay_chunk(&mut sessions, 1, chunk("report.txt", 8192, true))
            .expect("second chunk");
        assert!(second.complete);
        assert!(registry.get(id).is_none());
        assert!(sessions.get(2).and_then(|s| s.incoming()).is_none());

        let to_bob = drain(&mut bob);
        let chunks = to_bob.iter().filter(|e| e.kind == MessageType::FileChunk).count();
        let bob_done = to_bob.iter().filter(|e| e.kind == MessageType::FileComplete).count();
        assert_eq!(chunks, 2);
        assert_eq!(bob_done, 1);
        assert!(to_bob.iter().filter(|e| e.kind == MessageType::FileChunk).all(|e| e.file_data.as_ref().map(Vec::len) == Some(8192)));

        let to_alice = drain(&mut alice);
        let alice_done = to_alice.iter().filter(|e| e.kind == MessageType::FileComplete).count();
        assert_eq!(alice_done, 1);
        assert_eq!(
            to_alice.last().map(|e| e.content.as_str()),
            Some("Transfer of report.txt complete (16384 bytes)")
        );

        assert!(registry.relay_chunk(&mut sessions, 1, chunk("report.txt", 1, true)).is_err());
    }

    #[test]
    fn progress_is_reported_per_decile() {
        let mut sessions = SessionTable::new();
        let mut alice = attach(&mut sessions, 1, 64, Some("alice"));
        let _bob = attach(&mut sessions, 2, 64, Some("bob"));
        let mut registry = TransferRegistry::new();
        registry.initiate(&sessions, 1, 2, "big.bin", 100).expect("created");
        registry.accept(&mut sessions, 2, None).expect("accepted");
        drain(&mut alice);

        for _ in 0..19 {
            registry
                .relay_chunk(&mut sessions, 1, chunk("big.bin", 5, false))
                .expect("chunk");
        }
        let progress: Vec<String> = drain(&mut alice)
            .into_iter()
            .filter(|e| e.content.starts_with("Sending"))
            .map(|e| e.content)
            .collect();
        assert_eq!(progress.len(), 9);
        assert_eq!(progress[0], "Sending big.bin: 10.0% complete");
    }

    #[test]
    fn second_accept_while_receiving_is_refused() {
        let mut sessions = SessionTable::new();
        let _a = attach(&mut sessions, 1, 16, Some("alice"));
        let _c = attach(&mut sessions, 3, 16, Some("carol"));
        let _b = attach(&mut sessions, 2, 16, Some("bob"));
        let mut registry = TransferRegistry::new();
        registry.initiate(&sessions, 1, 2, "a.txt", 10).expect("created");
        registry.initiate(&sessions, 3, 2, "c.txt", 10).expect("created");

        registry.accept(&mut sessions, 2, Some("alice")).expect("accepted");
        assert_eq!(
            registry.accept(&mut sessions, 2, Some("carol")),
            Err(TransferError::ReceiverBusy {
                file_name: "a.txt".into()
            })
        );
    }

    #[test]
    fn disconnect_fails_transfers_and_tells_the_survivor() {
        let mut sessions = SessionTable::new();
        let _a = attach(&mut sessions, 1, 16, Some("alice"));
        let mut bob = attach(&mut sessions, 2, 16, Some("bob"));
        let mut registry = TransferRegistry::new();
        let id = registry.initiate(&sessions, 1, 2, "a.txt", 10).expect("created");
        registry.accept(&mut sessions, 2, None).expect("accepted");
        drain(&mut bob);

        assert_eq!(registry.fail_involving(&mut sessions, 1), vec![id]);
        assert!(registry.is_empty());
        assert!(sessions.get(2).and_then(|s| s.incoming()).is_none());
        assert_eq!(
            drain(&mut bob).pop().map(|e| e.content),
            Some("Transfer of a.txt failed: alice disconnected".to_string())
        );
    }

    #[test]
    fn acknowledgement_paces_the_sender() {
        let mut sessions = SessionTable::new();
        let mut alice = attach(&mut sessions, 1, 16, Some("alice"));
        let mut bob = attach(&mut sessions, 2, 16, Some("bob"));
        let mut registry = TransferRegistry::new();
        let id = registry.initiate(&sessions, 1, 2, "a.bin", 30).expect("created");
        registry.accept(&mut sessions, 2, None).expect("accepted");
        drain(&mut alice);
        drain(&mut bob);

        registry
            .relay_chunk(&mut sessions, 1, chunk("a.bin", 10, false))
            .expect("relayed");
        assert!(registry.acknowledge(&mut sessions, 2, id));
        assert!(!registry.acknowledge(&mut sessions, 1, id));

        let acks: Vec<Envelope> = drain(&mut alice)
            .into_iter()
            .filter(|e| e.kind == MessageType::FileAck)
            .collect();
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0].transfer_id, Some(id));
        assert_eq!(acks[0].content, "10 of 30 bytes delivered");

        registry
            .relay_chunk(&mut sessions, 1, chunk("a.bin", 20, true))
            .expect("last chunk");
        assert!(!registry.acknowledge(&mut sessions, 2, id));
        let receiving: Vec<String> = drain(&mut bob)
            .into_iter()
            .filter(|e| e.content.starts_with("Receiving"))
            .map(|e| e.content)
            .collect();
        assert_eq!(
            receiving,
            vec!["Receiving a.bin: 33.3% complete", "Receiving a.bin: 100.0% complete"]
        );
    }

    #[test]
    fn sender_outrunning_the_receiver_fails_the_transfer() {
        let mut sessions = SessionTable::new();
        let _alice = attach(&mut sessions, 1, 64, Some("alice"));
        let mut bob = attach(&mut sessions, 2, 4, Some("bob"));
        let mut registry = TransferRegistry::new();
        let id = registry.initiate(&sessions, 1, 2, "a.bin", 1000).expect("created");
        registry.accept(&mut sessions, 2, None).expect("accepted");
        drain(&mut bob);

        // Chunk plus progress notice leave bob two free slots, below what a relay step needs.
        registry
            .relay_chunk(&mut sessions, 1, chunk("a.bin", 100, false))
            .expect("first chunk fits");
        let result = registry.relay_chunk(&mut sessions, 1, chunk("a.bin", 100, false));

        assert_eq!(
            result,
            Err(TransferError::ReceiverBehind {
                file_name: "a.bin".into(),
                receiver: "bob".into(),
            })
        );
        assert!(registry.get(id).is_none());
        assert!(sessions.get(2).and_then(|s| s.incoming()).is_none());
        assert!(sessions.take_unresponsive().is_empty());
        assert_eq!(
            drain(&mut bob).pop().map(|e| e.content),
            Some("Transfer of a.bin failed: bob is not keeping up".to_string())
        );
    }

    #[test]
    fn terminal_states_admit_no_transitions() {
        for terminal in [
            TransferStatus::Complete,
            TransferStatus::Rejected,
            TransferStatus::Failed,
        ] {
            for next in [
                TransferStatus::Pending,
                TransferStatus::Accepted,
                TransferStatus::Complete,
                TransferStatus::Rejected,
                TransferStatus::Failed,
            ] {
                assert!(!terminal.can_become(next));
            }
        }
        assert!(TransferStatus::Pending.can_become(TransferStatus::Accepted));
        assert!(!TransferStatus::Pending.can_become(TransferStatus::Complete));
    }
}
