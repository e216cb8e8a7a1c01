use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::recording::PersistedArtifact;

/// Lifecycle of a client session. Variants are ordered; a session only moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Connecting,
    CapabilitiesExchanged,
    TransportCreated,
    TransportConnected,
    Producing,
    Recording,
    Stopped,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Stopped | SessionState::Failed)
    }
}

/// When a session entered a state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseTiming {
    pub state: SessionState,
    pub at: DateTime<Utc>,
}

/// Outcome of a completed session
#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    /// Server-assigned session id
    pub session_id: String,

    pub state: SessionState,

    pub transport_id: String,

    pub producer_ids: Vec<String>,

    /// Repeated engine connect events that were not re-emitted
    pub suppressed_dtls_connects: usize,

    pub first_image_bytes: usize,

    pub last_image_bytes: usize,

    pub first_captured_at: DateTime<Utc>,

    pub last_captured_at: DateTime<Utc>,

    pub artifact: PersistedArtifact,

    pub started_at: DateTime<Utc>,

    /// Total duration in seconds
    pub duration_secs: f64,

    pub phases: Vec<PhaseTiming>,
}
