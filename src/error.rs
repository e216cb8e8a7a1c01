//! Error types for the signaling core
//!
//! Every error that reaches the session coordinator is terminal for that
//! session. There is no local recovery and no retry.

use std::time::Duration;
use thiserror::Error;

use crate::media::MediaKind;

/// Failure of a correlated request/response call
#[derive(Debug, Error)]
pub enum CallError {
    #[error("call '{event}' timed out after {after:?}")]
    Timeout { event: String, after: Duration },

    #[error("server rejected '{event}': {message}")]
    Server { event: String, message: String },

    #[error("invalid response to '{event}': {reason}")]
    InvalidResponse { event: String, reason: String },

    #[error("'{event}' could not be delivered: {message}")]
    Unreachable { event: String, message: String },

    #[error("channel closed before '{event}' completed")]
    Disconnected { event: String },
}

impl CallError {
    pub fn invalid_response(event: &str, reason: impl Into<String>) -> Self {
        Self::InvalidResponse {
            event: event.to_string(),
            reason: reason.into(),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Main error type for a signaling session
#[derive(Debug, Error)]
pub enum SignalError {
    /// The signaling channel never established
    #[error("connect error: {0}")]
    Connect(String),

    /// A fire-and-forget emission could not be handed to the channel
    #[error("channel error: {0}")]
    Channel(String),

    #[error(transparent)]
    Call(#[from] CallError),

    /// No codec is shared by the router and the device for a required track
    #[error("no common codec for {kind} track")]
    UnsupportedMedia { kind: MediaKind },

    /// ICE/DTLS handshake failed or the transport closed underneath us
    #[error("transport {transport_id} failed: {reason}")]
    TransportFailed { transport_id: String, reason: String },

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("media error: {0}")]
    Media(String),

    #[error("session task failed: {0}")]
    Task(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SignalError {
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::ProtocolViolation(msg.into())
    }

    pub fn transport_failed(transport_id: &str, reason: impl Into<String>) -> Self {
        Self::TransportFailed {
            transport_id: transport_id.to_string(),
            reason: reason.into(),
        }
    }

    /// Returns the underlying call error, if this is one
    pub fn as_call(&self) -> Option<&CallError> {
        match self {
            Self::Call(e) => Some(e),
            _ => None,
        }
    }
}

pub type SignalResult<T> = std::result::Result<T, SignalError>;
