// Frames and the traits every transport implements.

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

/// One message on a transport: JSON text or an opaque binary chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
}

impl Frame {
    pub fn text(text: impl Into<String>) -> Self {
        Frame::Text(text.into())
    }

    pub fn binary(data: impl Into<Bytes>) -> Self {
        Frame::Binary(data.into())
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Frame::Text(text) => Some(text),
            Frame::Binary(_) => None,
        }
    }

    pub fn is_binary(&self) -> bool {
        matches!(self, Frame::Binary(_))
    }

    pub fn len(&self) -> usize {
        match self {
            Frame::Text(text) => text.len(),
            Frame::Binary(data) => data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Connect failed: {0}")]
    Connect(String),
    #[error("Send failed: {0}")]
    Send(String),
    #[error("IO error: {0}")]
    Io(String),
    #[error("HTTP error (status {status:?}): {message}")]
    Http { status: Option<u16>, message: String },
    #[error("Codec error: {0}")]
    Codec(String),
    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        TransportError::Io(err.to_string())
    }
}

/// Write half of a streaming connection.
#[async_trait]
pub trait FrameSink: Send {
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError>;
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Read half of a streaming connection. `None` means the peer closed.
#[async_trait]
pub trait FrameStream: Send {
    async fn next_frame(&mut self) -> Option<Result<Frame, TransportError>>;
}

/// An open streaming connection, split so reads and writes can proceed
/// independently.
pub struct Connection {
    pub sink: Box<dyn FrameSink>,
    pub stream: Box<dyn FrameStream>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").finish_non_exhaustive()
    }
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Connection, TransportError>;

    /// Endpoint description for logs.
    fn describe(&self) -> String {
        "connector".to_string()
    }
}

/// Request/response transport: all of a call's frames go out in one
/// exchange and every frame of the reply comes back.
#[async_trait]
pub trait RequestTransport: Send + Sync {
    async fn exchange(&self, frames: Vec<Frame>) -> Result<Vec<Frame>, TransportError>;
}
