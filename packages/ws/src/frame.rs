//! Transport boundary.
//!
//! A websocket implementation plugs into the connection loop by providing a
//! [`FrameReader`] and a [`FrameWriter`] for each upgraded connection.

use async_trait::async_trait;
use bytes::Bytes;
use strum_macros::AsRefStr;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, AsRefStr)]
pub enum FrameKind {
    Text,
    Binary,
    Ping,
    Pong,
    Close,
}

impl std::fmt::Display for FrameKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_ref())
    }
}

/// A single websocket frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub payload: Bytes,
}

impl Frame {
    #[must_use]
    pub fn new(kind: FrameKind, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            payload: payload.into(),
        }
    }

    #[must_use]
    pub fn text(payload: impl Into<Bytes>) -> Self {
        Self::new(FrameKind::Text, payload)
    }

    #[must_use]
    pub fn binary(payload: impl Into<Bytes>) -> Self {
        Self::new(FrameKind::Binary, payload)
    }

    #[must_use]
    pub fn ping(payload: impl Into<Bytes>) -> Self {
        Self::new(FrameKind::Ping, payload)
    }

    #[must_use]
    pub fn pong(payload: impl Into<Bytes>) -> Self {
        Self::new(FrameKind::Pong, payload)
    }

    #[must_use]
    pub const fn close() -> Self {
        Self {
            kind: FrameKind::Close,
            payload: Bytes::new(),
        }
    }

    /// Text or binary data frame, as opposed to a control frame.
    #[must_use]
    pub const fn is_data(&self) -> bool {
        matches!(self.kind, FrameKind::Text | FrameKind::Binary)
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection closed")]
    Closed,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("Protocol error: {0}")]
    Protocol(String),
}

/// Read half of an upgraded connection.
///
/// Reads are driven from the single task running the connection loop, so
/// implementations do not need to be `Send`.
#[async_trait(?Send)]
pub trait FrameReader {
    /// Waits for the next frame.
    ///
    /// # Errors
    ///
    /// * If the connection was closed or failed
    async fn read_frame(&mut self) -> Result<Frame, TransportError>;
}

/// Write half of an upgraded connection.
///
/// Callers serialize access; an implementation never sees two concurrent writes.
#[async_trait]
pub trait FrameWriter: Send + Sync {
    /// # Errors
    ///
    /// * If the frame could not be written
    async fn write_frame(&mut self, frame: Frame) -> Result<(), TransportError>;

    /// Closes the connection. Closing an already closed connection is not an error.
    ///
    /// # Errors
    ///
    /// * If the close handshake could not be sent
    async fn close(&mut self) -> Result<(), TransportError>;
}
