//! Error types for remote sessions.

use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SessionError {
    /// Connection refused or dropped abnormally.
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Malformed frame: {0}")]
    MalformedFrame(#[source] serde_json::Error),

    #[error("Invalid frame payload: {0}")]
    InvalidPayload(#[source] base64::DecodeError),

    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Raw mode requested without a real terminal attached.
    #[error("Terminal error: {0}")]
    Terminal(String),

    /// Resize notification unavailable or failed. Never fatal.
    #[error("Resize notification unavailable: {0}")]
    Capability(String),

    #[error("Session not found: {0}")]
    NotFound(String),

    #[error("Session already exists: {0}")]
    AlreadyExists(String),

    #[error("Session {id} is {state}")]
    InvalidState { id: String, state: &'static str },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Session task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl SessionError {
    /// Malformed frame or invalid payload encoding.
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            SessionError::MalformedFrame(_)
                | SessionError::InvalidPayload(_)
                | SessionError::Protocol(_)
        )
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, SessionError::Transport(_))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for SessionError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        SessionError::Transport(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;
