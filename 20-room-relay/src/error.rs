use std::io;

use thiserror::Error;

/// Failure modes shared by the registry, the handshake handler, and the relay loop.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("room '{0}' already exists")]
    RoomExists(String),

    #[error("room '{0}' not found")]
    RoomNotFound(String),

    #[error("malformed request: {0}")]
    MalformedRequest(String),

    #[error("token is not a member of room '{room}'")]
    UnauthorizedRelay { room: String },

    #[error("transport failure: {0}")]
    Transport(#[from] io::Error),
}

impl ChatError {
    /// Text sent back to a handshake client. Anything that is not a registry
    /// outcome collapses into one generic message.
    pub fn client_message(&self) -> &'static str {
        match self {
            ChatError::RoomExists(_) => "Room already exists.",
            ChatError::RoomNotFound(_) => "Room not found.",
            _ => "Invalid request.",
        }
    }

    /// Relay-side errors that are expected traffic noise rather than faults.
    pub fn is_rejected_request(&self) -> bool {
        matches!(
            self,
            ChatError::MalformedRequest(_) | ChatError::UnauthorizedRelay { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_outcomes_keep_their_client_text() {
        assert_eq!(
            ChatError::RoomExists("r".into()).client_message(),
            "Room already exists."
        );
        assert_eq!(
            ChatError::RoomNotFound("r".into()).client_message(),
            "Room not found."
        );
        assert_eq!(
            ChatError::MalformedRequest("bad".into()).client_message(),
            "Invalid request."
        );
    }

    #[test]
    fn transport_errors_are_not_rejections() {
        let err = ChatError::from(io::Error::new(io::ErrorKind::BrokenPipe, "gone"));
        assert!(!err.is_rejected_request());
        assert!(ChatError::UnauthorizedRelay { room: "r".into() }.is_rejected_request());
    }
}
