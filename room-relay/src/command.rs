//! Inbound line classification and command parsing.
//!
//! Every line a client sends is one of three things: a JSON `file-chunk`
//! envelope, a `/command`, or plain chat text. The reader task classifies the
//! line here before handing it to the hub, so the hub only ever sees
//! structured input.

use thiserror::Error;

use crate::message::{Envelope, MessageType};
use crate::transfer::TransferId;

const COMMAND_PREFIX: char = '/';
const LOGIN_USAGE: &str = "/login username password";

/// Commands a client may issue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Login { username: String, password: String },
    Join { room: String },
    Rooms,
    Users,
    SendFile { recipient: String, file_name: String, size: u64 },
    Accept { sender: Option<String> },
    Reject { sender: String },
}

/// Protocol errors reported back to the client verbatim.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("Usage: {0}")]
    Usage(&'static str),
    #[error("Unknown command: {0}")]
    Unknown(String),
    #[error("Invalid file size: {0}")]
    InvalidSize(String),
    #[error("Unsupported message type: {0}")]
    UnsupportedEnvelope(MessageType),
}

impl CommandError {
    /// Whether an anonymous session should be told to log in instead of
    /// seeing this error. Only unknown commands and `/login` misuse are
    /// reported as-is before login.
    pub fn requires_login(&self) -> bool {
        match self {
            CommandError::Usage(usage) => *usage != LOGIN_USAGE,
            CommandError::InvalidSize(_) | CommandError::UnsupportedEnvelope(_) => true,
            CommandError::Unknown(_) => false,
        }
    }
}

/// A relayed file chunk as received from its sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkFrame {
    pub file_name: String,
    pub transfer_id: Option<TransferId>,
    pub data: Vec<u8>,
    pub is_last: bool,
}

/// One classified input line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Chunk(ChunkFrame),
    Command(Command),
    Chat(String),
    Invalid(CommandError),
}

impl Inbound {
    pub fn parse(line: &str) -> Self {
        let trimmed = line.trim();

        if trimmed.starts_with('{') && trimmed.ends_with('}') {
            // Lines that merely look like JSON fall through to chat.
            if let Ok(envelope) = serde_json::from_str::<Envelope>(trimmed) {
                return match envelope.kind {
                    MessageType::FileChunk => Inbound::Chunk(ChunkFrame {
                        file_name: envelope.file_name,
                        transfer_id: envelope.transfer_id,
                        data: envelope.file_data.unwrap_or_default(),
                        is_last: envelope.is_last,
                    }),
                    other => Inbound::Invalid(CommandError::UnsupportedEnvelope(other)),
                };
            }
        }

        if trimmed.starts_with(COMMAND_PREFIX) {
            return match Command::parse(trimmed) {
                Ok(command) => Inbound::Command(command),
                Err(err) => Inbound::Invalid(err),
            };
        }

        Inbound::Chat(trimmed.to_string())
    }
}

impl Command {
    /// Parses a `/`-prefixed line of space-separated tokens.
    pub fn parse(line: &str) -> Result<Self, CommandError> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        let Some((&name, args)) = parts.split_first() else {
            return Err(CommandError::Unknown(String::new()));
        };

        match name {
            "/login" => match args {
                [username, password] => Ok(Command::Login {
                    username: username.to_string(),
                    password: password.to_string(),
                }),
                _ => Err(CommandError::Usage(LOGIN_USAGE)),
            },
            "/join" => match args {
                [room] => Ok(Command::Join {
                    room: room.to_string(),
                }),
                _ => Err(CommandError::Usage("/join roomname")),
            },
            "/rooms" => match args {
                [] => Ok(Command::Rooms),
                _ => Err(CommandError::Usage("/rooms")),
            },
            "/users" => match args {
                [] => Ok(Command::Users),
                _ => Err(CommandError::Usage("/users")),
            },
            "/sendfile" => match args {
                [recipient, file_name, size] => {
                    let size = size
                        .parse::<u64>()
                        .map_err(|_| CommandError::InvalidSize(size.to_string()))?;
                    Ok(Command::SendFile {
                        recipient: recipient.to_string(),
                        file_name: file_name.to_string(),
                        size,
                    })
                }
                _ => Err(CommandError::Usage("/sendfile username filename filesize")),
            },
            "/accept" => match args {
                [] => Ok(Command::Accept { sender: None }),
                [sender] => Ok(Command::Accept {
                    sender: Some(sender.to_string()),
                }),
                _ => Err(CommandError::Usage("/accept [username]")),
            },
            "/reject" => match args {
                [sender] => Ok(Command::Reject {
                    sender: sender.to_string(),
                }),
                _ => Err(CommandError::Usage("/reject username")),
            },
            other => Err(CommandError::Unknown(other.to_string())),
        }
    }
}
