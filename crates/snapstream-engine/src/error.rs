//! Error taxonomy for the engine.
//!
//! Internal failures are classified by [`ErrorKind`] so the session can
//! decide between local recovery and teardown. The public API surfaces only
//! [`ApiError`]; internal error types never cross the control boundary.

use thiserror::Error;

/// Severity classes for everything that can go wrong inside a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Single-chunk damage; drop it and continue.
    Transient,
    /// Malformed frame or wrong handshake order; tear down the session.
    Protocol,
    /// Socket-level failure; tear down, the supervisor may reconnect.
    Transport,
    /// Sustained underrun; tear down, the supervisor may reconnect.
    Stalled,
    /// Unrecoverable engine damage; no auto-retry.
    Fatal,
    /// Caller-initiated abort; swallowed.
    Cancelled,
}

/// A classified session error with a human-readable reason.
#[derive(Debug, Clone, Error)]
#[error("{kind:?}: {message}")]
pub struct SessionError {
    pub kind: ErrorKind,
    pub message: String,
}

impl SessionError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Protocol, message)
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transport, message)
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "cancelled")
    }
}

/// Errors surfaced by the public control API.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),
    #[error("engine is shutting down")]
    AlreadyShuttingDown,
    #[error("value out of range: {0}")]
    OutOfRange(i32),
}

/// Audio backend open/runtime failures.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("format unsupported: {0}")]
    FormatUnsupported(String),
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

/// Decoder failures, split by whether the stream can continue.
#[derive(Debug, Clone, Error)]
pub enum DecodeError {
    /// This chunk is unusable; skip it and keep decoding.
    #[error("recoverable decode error: {0}")]
    Recoverable(String),
    /// The decoder state is broken; the session must end.
    #[error("fatal decode error: {0}")]
    Fatal(String),
}
