#![forbid(unsafe_code)]

// Command error taxonomy. Every variant is terminal for the offending command only.

use crate::signaling::protocol::{ErrorPayload, ServerMessage};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("{0}")]
    Validation(String),

    #[error("Only the host can do that")]
    NotHost,

    #[error("Room not found")]
    RoomNotFound,

    #[error("Participant not found in this room")]
    ParticipantNotFound,

    #[error("Invalid password")]
    InvalidPassword,

    #[error("Room is full")]
    RoomFull,

    #[error("Rate limit exceeded: max {0} messages/second")]
    RateLimited(u32),

    #[error("Invalid message format: {0}")]
    InvalidMessage(String),
}

impl CommandError {
    pub fn validation(message: impl Into<String>) -> Self {
        CommandError::Validation(message.into())
    }

    /// Wire-level error code.
    pub fn code(&self) -> &'static str {
        match self {
            CommandError::Validation(_) => "VALIDATION_ERROR",
            CommandError::NotHost => "NOT_HOST",
            CommandError::RoomNotFound | CommandError::ParticipantNotFound => "ROOM_NOT_FOUND",
            CommandError::InvalidPassword => "INVALID_PASSWORD",
            CommandError::RoomFull => "ROOM_FULL",
            CommandError::RateLimited(_) => "RATE_LIMIT",
            CommandError::InvalidMessage(_) => "INVALID_MESSAGE",
        }
    }

    pub fn to_message(&self) -> ServerMessage {
        ServerMessage::Error(ErrorPayload {
            code: self.code().to_string(),
            message: self.to_string(),
        })
    }
}

pub type CommandResult<T> = Result<T, CommandError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes() {
        assert_eq!(CommandError::NotHost.code(), "NOT_HOST");
        assert_eq!(CommandError::RoomFull.code(), "ROOM_FULL");
        assert_eq!(CommandError::RateLimited(10).code(), "RATE_LIMIT");
        assert_eq!(CommandError::validation("bad").code(), "VALIDATION_ERROR");
    }

    #[test]
    fn test_error_message_payload() {
        let msg = CommandError::RoomNotFound.to_message();
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["payload"]["code"], "ROOM_NOT_FOUND");
        assert_eq!(json["payload"]["message"], "Room not found");
    }
}
