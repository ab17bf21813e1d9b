//! Error types for the HMUX engine.

use thiserror::Error;

/// Main error type for all HMUX operations.
#[derive(Debug, Error)]
pub enum HmuxError {
    /// I/O error during socket operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer disconnected mid-exchange.
    ///
    /// Distinguished from [`HmuxError::Io`] so callers can tell a vanished
    /// peer from a local failure. Always kills keepalive, never retried.
    #[error("peer disconnected")]
    Disconnect,

    /// A socket operation timed out. Treated like a disconnect.
    #[error("socket timeout")]
    Timeout,

    /// Malformed fixed-structure field (e.g. PROTOCOL length != 4,
    /// HEADER not followed by STRING). Fatal to the connection.
    #[error("framing error: {0}")]
    Framing(&'static str),

    /// A PROTOCOL hand-off named an id nobody has registered.
    #[error("unknown sub-protocol id: {0:#x}")]
    UnknownProtocol(u32),

    /// Messaging hand-off attempted after a request already began.
    #[error("connection hand-off rejected: request in progress")]
    HandoffRejected,

    /// Protocol misuse detected locally (response ordering, oversized field).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Engine invariant violation, e.g. an unsealed data reservation at
    /// flush time. Fatal to the connection, never surfaced to the peer.
    #[error("internal error: {0}")]
    Internal(&'static str),
}

impl HmuxError {
    /// True for conditions that must force the socket closed and disable
    /// keepalive: disconnects, timeouts, framing violations.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, HmuxError::Protocol(_))
    }

    /// Map an I/O error into the distinguished disconnect/timeout
    /// conditions where the kind makes the cause unambiguous.
    pub fn from_io(e: std::io::Error) -> Self {
        use std::io::ErrorKind;

        match e.kind() {
            ErrorKind::UnexpectedEof
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe => HmuxError::Disconnect,
            ErrorKind::TimedOut | ErrorKind::WouldBlock => HmuxError::Timeout,
            _ => HmuxError::Io(e),
        }
    }
}

/// Result type alias using HmuxError.
pub type Result<T> = std::result::Result<T, HmuxError>;
