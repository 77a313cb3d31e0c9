use std::{fmt, io};

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::transfer::TransferId;

const LINE_ENDINGS: &[char] = &['\n', '\r'];

/// Sender name used for notices that originate from the server itself.
pub const SERVER_SENDER: &str = "Server";

/// Type tag carried by every envelope.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum MessageType {
    #[default]
    Text,
    FileRequest,
    FileChunk,
    FileAccepted,
    FileRejected,
    FileComplete,
    /// Sent to a transfer's sender once a relayed chunk reached the receiver.
    FileAck,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Text => "text",
            MessageType::FileRequest => "file-request",
            MessageType::FileChunk => "file-chunk",
            MessageType::FileAccepted => "file-accepted",
            MessageType::FileRejected => "file-rejected",
            MessageType::FileComplete => "file-complete",
            MessageType::FileAck => "file-ack",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The single unit of communication, both on the wire and between sessions.
///
/// Field names follow the PascalCase wire format. `FileData` travels as a
/// base64 string.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct Envelope {
    #[serde(default)]
    pub sender: String,
    #[serde(default)]
    pub room_name: String,
    #[serde(default)]
    pub content: String,
    #[serde(rename = "Type", default)]
    pub kind: MessageType,
    #[serde(default, with = "file_data")]
    pub file_data: Option<Vec<u8>>,
    #[serde(default)]
    pub file_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transfer_id: Option<TransferId>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_last: bool,
}

impl Envelope {
    /// A `text` envelope from the server, outside of any room.
    pub fn notice(content: impl Into<String>) -> Self {
        Self {
            sender: SERVER_SENDER.to_string(),
            content: content.into(),
            ..Self::default()
        }
    }

    /// A `text` envelope from the server, scoped to a room.
    pub fn room_notice(room: &str, content: impl Into<String>) -> Self {
        Self {
            room_name: room.to_string(),
            ..Self::notice(content)
        }
    }

    /// Chat text published by `sender` into `room`.
    pub fn chat(sender: &str, room: &str, content: impl Into<String>) -> Self {
        Self {
            sender: sender.to_string(),
            room_name: room.to_string(),
            content: content.into(),
            ..Self::default()
        }
    }

    /// A file-transfer control envelope (`file-request`, `file-accepted`, ...).
    pub fn transfer(
        kind: MessageType,
        sender: &str,
        file_name: &str,
        transfer_id: TransferId,
        content: impl Into<String>,
    ) -> Self {
        Self {
            sender: sender.to_string(),
            content: content.into(),
            kind,
            file_name: file_name.to_string(),
            transfer_id: Some(transfer_id),
            ..Self::default()
        }
    }

    /// One relayed piece of a file.
    pub fn chunk(
        sender: &str,
        file_name: &str,
        transfer_id: Option<TransferId>,
        data: Vec<u8>,
        is_last: bool,
    ) -> Self {
        Self {
            sender: sender.to_string(),
            kind: MessageType::FileChunk,
            file_data: Some(data),
            file_name: file_name.to_string(),
            transfer_id,
            is_last,
            ..Self::default()
        }
    }

    pub fn is_from_server(&self) -> bool {
        self.sender == SERVER_SENDER
    }
}

fn is_false(value: &bool) -> bool {
    !*value
}

mod file_data {
    use base64::{Engine, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(data: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match data {
            Some(bytes) => serializer.serialize_some(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<String>::deserialize(deserializer)?
            .map(|encoded| STANDARD.decode(encoded).map_err(serde::de::Error::custom))
            .transpose()
    }
}

/// Reads the next non-empty line, without its line ending.
///
/// Bytes that are not valid UTF-8 are replaced rather than treated as a read
/// error. Returns `Ok(None)` once the peer has closed the stream.
pub async fn read_line<R>(reader: &mut R) -> io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut raw = Vec::new();
    loop {
        raw.clear();
        let bytes = reader.read_until(b'\n', &mut raw).await?;
        if bytes == 0 {
            return Ok(None);
        }

        let line = String::from_utf8_lossy(&raw);
        let trimmed = line.trim_end_matches(LINE_ENDINGS);
        if trimmed.trim().is_empty() {
            continue;
        }

        return Ok(Some(trimmed.to_string()));
    }
}

pub async fn read_message<R, T>(reader: &mut R) -> io::Result<Option<T>>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    match read_line(reader).await? {
        Some(line) => serde_json::from_str(&line).map(Some).map_err(to_io_error),
        None => Ok(None),
    }
}

pub async fn write_message<W, T>(writer: &mut W, message: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    // Encode to JSON once, append a newline delimiter, and flush so peers get timely updates.
    let mut encoded = serde_json::to_vec(message).map_err(to_io_error)?;
    encoded.push(b'\n');
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

/// Writes a raw text line (commands and chat from the client side).
pub async fn write_line<W>(writer: &mut W, line: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}

fn to_io_error(err: serde_json::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}
