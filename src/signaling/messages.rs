use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::media::MediaKind;
use crate::negotiation::RtpCapabilities;
use crate::producer::RtpParameters;
use crate::transport::{DtlsParameters, TransportParams};

/// Signaling event names
pub mod events {
    pub const CONNECTION_SUCCESS: &str = "connection-success";
    pub const GET_ROUTER_RTP_CAPABILITIES: &str = "getRouterRtpCapabilities";
    pub const CREATE_TRANSPORT: &str = "createTransport";
    pub const CONNECT_PRODUCER_TRANSPORT: &str = "connectProducerTransport";
    pub const TRANSPORT_PRODUCE: &str = "transport-produce";
    pub const START_RECORD: &str = "start-record";
    pub const STOP_RECORD: &str = "stop-record";

    /// Connection lifecycle and media plane (not part of the session handshake)
    pub const HELLO: &str = "hello";
    pub const BYE: &str = "bye";
    pub const MEDIA: &str = "media";
}

/// Server reply to a call: `{"ok": ...}` or `{"error": "..."}`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Reply {
    Ok(Value),
    Error(String),
}

impl Reply {
    pub fn ok<T: Serialize>(payload: &T) -> Self {
        match serde_json::to_value(payload) {
            Ok(value) => Reply::Ok(value),
            Err(e) => Reply::Error(format!("failed to encode reply: {}", e)),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Reply::Error(message.into())
    }
}

/// A message pushed by the server without a request
#[derive(Debug, Clone)]
pub struct PushMessage {
    pub event: String,
    pub payload: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hello {
    pub client_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionSuccess {
    pub session_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouterCapabilitiesRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouterCapabilitiesResponse {
    pub session_id: String,
    pub router_rtp_capabilities: RtpCapabilities,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTransportRequest {
    pub sender: bool,
    pub session_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTransportResponse {
    pub params: TransportParams,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectTransportMessage {
    pub dtls_parameters: DtlsParameters,
    pub session_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportProduceRequest {
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
    pub session_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportProduceResponse {
    pub id: String,
}

/// Payload of `start-record` and `stop-record`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordRequest {
    pub session_id: String,
}

/// Reply to `stop-record`. Images are base64-encoded.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopRecordResponse {
    #[serde(default)]
    pub first_image: Option<String>,
    #[serde(default)]
    pub last_image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_captured_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_captured_at: Option<DateTime<Utc>>,
}

/// One media frame sent by a producer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaFrameMessage {
    pub producer_id: String,
    pub sequence: u64,
    pub timestamp_ms: u64,
    /// Base64-encoded frame bytes
    pub data: String,
}
