// Errors surfaced to callers, including exceptions raised by the server.

use portrpc_core::{ReconstructError, SerializationError, TraceFrame};
use portrpc_transport::TransportError;
use std::fmt;
use thiserror::Error;

pub const SESSION_EXPIRED_ERROR: &str = "anvil.server.SessionExpiredError";
pub const GENERIC_ERROR: &str = "anvil.server.InternalError";

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Serialization(#[from] SerializationError),

    #[error("Failed to reconstruct response: {0}")]
    Reconstruct(#[from] ReconstructError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("Invalid call arguments: {0}")]
    InvalidArguments(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Request abandoned before a response arrived")]
    Abandoned,
}

impl ClientError {
    pub fn remote(&self) -> Option<&RemoteError> {
        match self {
            ClientError::Remote(remote) => Some(remote),
            _ => None,
        }
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, ClientError::Transport(_))
    }
}

/// An exception raised by the server for one call.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteError {
    /// Exception type as named by the server, or the generic name.
    pub type_name: String,
    pub message: String,
    /// Whether `type_name` is registered with the session. Unregistered
    /// server exceptions surface under the generic name.
    pub registered: bool,
    /// The server's own type name when it was replaced by the generic one.
    pub original_type: Option<String>,
    /// Server-side frames, outermost first.
    pub trace: Vec<TraceFrame>,
}

impl RemoteError {
    pub fn is_session_expired(&self) -> bool {
        self.type_name == SESSION_EXPIRED_ERROR
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.type_name, self.message)?;
        if let Some(original) = &self.original_type {
            write!(f, " (raised as {})", original)?;
        }
        for frame in &self.trace {
            match frame.line {
                Some(line) => write!(f, "\n  at {}:{}", frame.file, line)?,
                None => write!(f, "\n  at {}", frame.file)?,
            }
        }
        Ok(())
    }
}

impl std::error::Error for RemoteError {}
