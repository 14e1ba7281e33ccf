use std::{fmt, io};

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ChatError;

/// Opaque capability handed out by the handshake. Possession of a token that is
/// listed in a room's member set is the only proof of membership the relay checks.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Token(String);

impl Token {
    /// Draws a fresh 21-character identifier from the thread-local CSPRNG.
    pub fn generate() -> Self {
        Self(nanoid::nanoid!())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Token {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HandshakeOperation {
    CreateRoom,
    JoinRoom,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HandshakeRequest {
    pub operation: HandshakeOperation,
    pub room_name: String,
    pub username: String,
}

impl HandshakeRequest {
    /// Rejects blank names; serde already rejects missing fields and unknown operations.
    pub fn validate(&self) -> Result<(), ChatError> {
        if self.room_name.trim().is_empty() {
            return Err(ChatError::MalformedRequest("room_name is empty".into()));
        }
        if self.username.trim().is_empty() {
            return Err(ChatError::MalformedRequest("username is empty".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum HandshakeResponse {
    Success { token: Token },
    Error { message: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum RelayRequest {
    Message {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<Token>,
        room_name: String,
        #[serde(default)]
        username: String,
        message: String,
    },
    Leave {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<Token>,
        room_name: String,
        #[serde(default)]
        username: String,
    },
    /// Keeps an otherwise silent member from being reaped. Never fanned out.
    Heartbeat {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<Token>,
        room_name: String,
        #[serde(default)]
        username: String,
    },
}

impl RelayRequest {
    pub fn token(&self) -> Option<&Token> {
        match self {
            RelayRequest::Message { token, .. }
            | RelayRequest::Leave { token, .. }
            | RelayRequest::Heartbeat { token, .. } => token.as_ref(),
        }
    }

    pub fn room_name(&self) -> &str {
        match self {
            RelayRequest::Message { room_name, .. }
            | RelayRequest::Leave { room_name, .. }
            | RelayRequest::Heartbeat { room_name, .. } => room_name,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Success,
    Error,
}

/// Payload fanned out to room members over UDP.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Broadcast {
    pub status: Status,
    #[serde(flatten)]
    pub body: BroadcastBody,
}

// Variant order matters for untagged decoding: `Chat` must be tried before
// `Error` since both carry a `message` field.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum BroadcastBody {
    Chat { sender: String, message: String },
    System { system_message: String },
    Error { message: String },
}

impl Broadcast {
    pub fn chat(sender: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status: Status::Success,
            body: BroadcastBody::Chat {
                sender: sender.into(),
                message: message.into(),
            },
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self {
            status: Status::Success,
            body: BroadcastBody::System {
                system_message: text.into(),
            },
        }
    }

    pub fn departure(username: &str) -> Self {
        Self::system(format!("{username} has left the room."))
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: Status::Error,
            body: BroadcastBody::Error {
                message: message.into(),
            },
        }
    }
}

pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>, ChatError> {
    serde_json::to_vec(message).map_err(|err| ChatError::Transport(to_io_error(err)))
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ChatError> {
    serde_json::from_slice(bytes).map_err(|err| ChatError::MalformedRequest(err.to_string()))
}

/// Reads a single JSON value of at most `max_size` bytes.
///
/// Peers are not required to frame the value: reading stops as soon as the
/// buffered bytes parse, when the peer closes its write half, or when the
/// limit is reached.
pub async fn read_message<R, T>(reader: &mut R, max_size: usize) -> Result<T, ChatError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut buffered = Vec::new();
    let mut chunk = vec![0u8; max_size];

    loop {
        let remaining = max_size - buffered.len();
        if remaining == 0 {
            return Err(ChatError::MalformedRequest(format!(
                "request exceeds {max_size} bytes"
            )));
        }

        let read = reader.read(&mut chunk[..remaining]).await?;
        if read == 0 {
            if buffered.is_empty() {
                return Err(ChatError::MalformedRequest(
                    "connection closed before a request was sent".into(),
                ));
            }
            return decode(&buffered);
        }
        buffered.extend_from_slice(&chunk[..read]);

        match serde_json::from_slice(&buffered) {
            Ok(message) => return Ok(message),
            Err(err) if err.is_eof() => continue,
            Err(err) => return Err(ChatError::MalformedRequest(err.to_string())),
        }
    }
}

pub async fn write_message<W, T>(writer: &mut W, message: &T) -> Result<(), ChatError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    // Trailing newline lets line-oriented tools (netcat) print responses cleanly.
    let mut encoded = encode(message)?;
    encoded.push(b'\n');
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

fn to_io_error(err: serde_json::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}
