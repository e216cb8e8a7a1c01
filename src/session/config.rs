use std::path::PathBuf;
use std::time::Duration;

use crate::config::SignalingConfig;

/// Configuration for one client session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Local label used in logs until the server assigns a session id
    pub label: String,

    /// How long to wait for the server's connection-success greeting
    pub greeting_timeout: Duration,

    /// How long the ICE/DTLS handshake may take
    pub connect_timeout: Duration,

    /// Artifacts are written to `<output_dir>/<session id>/`
    pub output_dir: PathBuf,
}

impl SessionConfig {
    /// Session settings taken from the signaling section of the config file
    pub fn from_signaling(label: impl Into<String>, signaling: &SignalingConfig, output_dir: PathBuf) -> Self {
        Self {
            label: label.into(),
            greeting_timeout: signaling.greeting_timeout(),
            connect_timeout: signaling.connect_timeout(),
            output_dir,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            label: format!("session-{}", uuid::Uuid::new_v4()),
            greeting_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
            output_dir: PathBuf::from("recordings"),
        }
    }
}
