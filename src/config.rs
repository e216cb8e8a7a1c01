use anyhow::Result;
use serde::Deserialize;
use std::time::Duration;

use crate::media::MediaSourceConfig;
use crate::negotiation::{default_router_codecs, RtpCodecCapability};
use crate::server::DEFAULT_CLOSED_HISTORY;

#[derive(Debug, Deserialize)]
pub struct Config {
    pub service: ServiceConfig,
    #[serde(default)]
    pub signaling: SignalingConfig,
    #[serde(default)]
    pub media: MediaSourceConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub router: RouterConfig,
}

#[derive(Debug, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    pub http: HttpConfig,
    /// Closed sessions kept for the HTTP API, oldest dropped first
    #[serde(default = "default_closed_history")]
    pub closed_history: usize,
}

fn default_closed_history() -> usize {
    DEFAULT_CLOSED_HISTORY
}

#[derive(Debug, Deserialize)]
pub struct HttpConfig {
    pub bind: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SignalingConfig {
    pub nats_url: String,
    /// Root of every signaling subject
    pub subject_prefix: String,
    pub call_timeout_ms: u64,
    pub greeting_timeout_ms: u64,
    pub connect_timeout_ms: u64,
}

impl SignalingConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn greeting_timeout(&self) -> Duration {
        Duration::from_millis(self.greeting_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            nats_url: "nats://localhost:4222".to_string(),
            subject_prefix: "sfu".to_string(),
            call_timeout_ms: 5_000,
            greeting_timeout_ms: 5_000,
            connect_timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Recording artifacts land in `<dir>/<session id>/`
    pub dir: String,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: "~/.sfu-recorder/recordings".to_string(),
        }
    }
}

/// Codecs the SFU router offers
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    pub codecs: Vec<RtpCodecCapability>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            codecs: default_router_codecs(),
        }
    }
}

impl Config {
    /// Load from `path` (extension optional), then apply `SFU_RECORDER__*` overrides
    pub fn load(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("SFU_RECORDER").separator("__"))
            .build()?;

        Ok(settings.try_deserialize()?)
    }
}
