use base64::Engine;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::{CallError, SignalError, SignalResult};
use crate::media::image_extension;
use crate::signaling::messages::{events, RecordRequest, StopRecordResponse};
use crate::signaling::{call_typed, emit_typed, SignalChannel};
use crate::transport::{ConnectionState, SendTransport};

/// First and last frame captured by a server-side recording
#[derive(Debug, Clone)]
pub struct RecordingArtifact {
    pub first_image: Vec<u8>,
    pub last_image: Vec<u8>,
    pub first_captured_at: DateTime<Utc>,
    pub last_captured_at: DateTime<Utc>,
}

/// Where an artifact was written
#[derive(Debug, Clone, Serialize)]
pub struct PersistedArtifact {
    pub first_image: PathBuf,
    pub last_image: PathBuf,
}

impl RecordingArtifact {
    /// Validate a `stop-record` reply. Both images must be present and non-empty.
    pub fn from_response(response: StopRecordResponse) -> Result<Self, CallError> {
        let first_image = decode_image(response.first_image.as_deref(), "firstImage")?;
        let last_image = decode_image(response.last_image.as_deref(), "lastImage")?;

        // A missing timestamp defaults without ever putting first after last
        let now = Utc::now();
        let (first_captured_at, last_captured_at) =
            match (response.first_captured_at, response.last_captured_at) {
                (Some(first), Some(last)) => (first, last),
                (Some(first), None) => (first, now.max(first)),
                (None, Some(last)) => (now.min(last), last),
                (None, None) => (now, now),
            };

        if first_captured_at > last_captured_at {
            return Err(CallError::invalid_response(
                events::STOP_RECORD,
                format!(
                    "first frame captured at {} after last frame at {}",
                    first_captured_at, last_captured_at
                ),
            ));
        }

        Ok(Self {
            first_image,
            last_image,
            first_captured_at,
            last_captured_at,
        })
    }

    /// Write both images into `dir`. Either both files end up on disk or neither does.
    pub async fn persist(&self, dir: &Path) -> SignalResult<PersistedArtifact> {
        tokio::fs::create_dir_all(dir).await?;

        let first_path = dir.join(format!("first_image.{}", image_extension(&self.first_image)));
        let last_path = dir.join(format!("last_image.{}", image_extension(&self.last_image)));

        tokio::fs::write(&first_path, &self.first_image).await?;
        if let Err(e) = tokio::fs::write(&last_path, &self.last_image).await {
            if let Err(cleanup) = tokio::fs::remove_file(&first_path).await {
                warn!("Failed to remove {}: {}", first_path.display(), cleanup);
            }
            return Err(e.into());
        }

        info!(
            "Saved recording artifact: {} ({} bytes), {} ({} bytes)",
            first_path.display(),
            self.first_image.len(),
            last_path.display(),
            self.last_image.len()
        );

        Ok(PersistedArtifact {
            first_image: first_path,
            last_image: last_path,
        })
    }
}

fn decode_image(encoded: Option<&str>, field: &str) -> Result<Vec<u8>, CallError> {
    let encoded = encoded
        .filter(|s| !s.is_empty())
        .ok_or_else(|| CallError::invalid_response(events::STOP_RECORD, format!("missing {}", field)))?;

    let bytes = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map_err(|e| CallError::invalid_response(events::STOP_RECORD, format!("{}: {}", field, e)))?;

    if bytes.is_empty() {
        return Err(CallError::invalid_response(
            events::STOP_RECORD,
            format!("empty {}", field),
        ));
    }
    Ok(bytes)
}

/// Starts and stops server-side recording for a session
pub struct RecordingController {
    channel: Arc<dyn SignalChannel>,
}

impl RecordingController {
    pub fn new(channel: Arc<dyn SignalChannel>) -> Self {
        Self { channel }
    }

    /// Start recording. The transport must be connected and producing.
    pub async fn start(&self, transport: &SendTransport) -> SignalResult<()> {
        if transport.state() != ConnectionState::Connected {
            return Err(SignalError::protocol(format!(
                "cannot start recording: transport {} is {:?}",
                transport.id(),
                transport.state()
            )));
        }
        if transport.producer_ids().is_empty() {
            return Err(SignalError::protocol(
                "cannot start recording: nothing is being produced",
            ));
        }

        let request = RecordRequest {
            session_id: transport.session_id().to_string(),
        };
        emit_typed(self.channel.as_ref(), events::START_RECORD, &request).await?;
        info!("Recording started for session {}", request.session_id);
        Ok(())
    }

    /// Stop recording and collect the first and last captured frames
    pub async fn stop(&self, session_id: &str) -> SignalResult<RecordingArtifact> {
        info!("Stop recording for session {}", session_id);
        let request = RecordRequest {
            session_id: session_id.to_string(),
        };

        let response: StopRecordResponse =
            call_typed(self.channel.as_ref(), events::STOP_RECORD, &request).await?;
        let artifact = RecordingArtifact::from_response(response)?;

        info!(
            "Recording stopped for session {}: first frame {} bytes, last frame {} bytes",
            session_id,
            artifact.first_image.len(),
            artifact.last_image.len()
        );
        Ok(artifact)
    }
}
