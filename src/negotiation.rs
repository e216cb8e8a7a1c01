//! RTP capability exchange
//!
//! The router's capabilities are fetched once per session, then intersected
//! with what the local engine supports to produce a [`Device`].

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

use crate::error::{SignalError, SignalResult};
use crate::media::MediaKind;
use crate::signaling::messages::{events, RouterCapabilitiesRequest, RouterCapabilitiesResponse};
use crate::signaling::{call_typed, SignalChannel};

/// RTCP feedback mechanism supported by a codec
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RtcpFeedback {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub parameter: String,
}

/// A codec as advertised in RTP capabilities
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecCapability {
    pub kind: MediaKind,
    pub mime_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_payload_type: Option<u8>,
    pub clock_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    #[serde(default)]
    pub parameters: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub rtcp_feedback: Vec<RtcpFeedback>,
}

impl RtpCodecCapability {
    /// Retransmission codecs only make sense paired with a media codec
    pub fn is_rtx(&self) -> bool {
        self.mime_type.to_ascii_lowercase().ends_with("/rtx")
    }

    fn matches(&self, other: &RtpCodecCapability) -> bool {
        if self.kind != other.kind
            || !self.mime_type.eq_ignore_ascii_case(&other.mime_type)
            || self.clock_rate != other.clock_rate
        {
            return false;
        }
        match self.kind {
            MediaKind::Audio => self.channels.unwrap_or(1) == other.channels.unwrap_or(1),
            MediaKind::Video => true,
        }
    }
}

/// An RTP header extension as advertised in RTP capabilities
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpHeaderExtension {
    pub kind: MediaKind,
    pub uri: String,
    pub preferred_id: u16,
    #[serde(default)]
    pub preferred_encrypt: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direction: Option<String>,
}

/// Codecs and header extensions supported by a router or a device
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCapabilities {
    #[serde(default)]
    pub codecs: Vec<RtpCodecCapability>,
    #[serde(default)]
    pub header_extensions: Vec<RtpHeaderExtension>,
}

impl RtpCapabilities {
    /// Media codecs (retransmission excluded) of the given kind
    pub fn media_codecs(&self, kind: MediaKind) -> impl Iterator<Item = &RtpCodecCapability> {
        self.codecs
            .iter()
            .filter(move |c| c.kind == kind && !c.is_rtx())
    }

    pub fn supports(&self, kind: MediaKind) -> bool {
        self.media_codecs(kind).next().is_some()
    }

    pub fn kinds(&self) -> BTreeSet<MediaKind> {
        self.codecs
            .iter()
            .filter(|c| !c.is_rtx())
            .map(|c| c.kind)
            .collect()
    }
}

/// Tracks which session identifier this client is bound to.
///
/// The first handshake step that reports an id binds it; any later step that
/// reports a different id is a protocol violation.
#[derive(Debug, Default, Clone)]
pub struct SessionBinding {
    session_id: Option<String>,
}

impl SessionBinding {
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn bind(&mut self, session_id: &str) -> SignalResult<&str> {
        if session_id.is_empty() {
            return Err(SignalError::protocol("server assigned an empty session id"));
        }
        if let Some(bound) = &self.session_id {
            if bound != session_id {
                return Err(SignalError::protocol(format!(
                    "session id changed from '{}' to '{}'",
                    bound, session_id
                )));
            }
        } else {
            debug!("Bound to session {}", session_id);
            self.session_id = Some(session_id.to_string());
        }
        Ok(self.session_id.as_deref().unwrap_or_default())
    }

    /// The bound id, or a protocol violation naming the step that needed it
    pub fn require(&self, step: &str) -> SignalResult<&str> {
        self.session_id()
            .ok_or_else(|| SignalError::protocol(format!("{} requires a bound session", step)))
    }
}

/// Fetch the router's RTP capabilities, binding the session id the server reports
pub async fn fetch_router_capabilities(
    channel: &dyn SignalChannel,
    binding: &mut SessionBinding,
) -> SignalResult<RtpCapabilities> {
    let request = RouterCapabilitiesRequest {
        session_id: binding.session_id().map(str::to_owned),
    };

    let response: RouterCapabilitiesResponse =
        call_typed(channel, events::GET_ROUTER_RTP_CAPABILITIES, &request).await?;

    let session_id = binding.bind(&response.session_id)?;
    info!(
        "Got router RTP capabilities for session {} ({} codecs, {} header extensions)",
        session_id,
        response.router_rtp_capabilities.codecs.len(),
        response.router_rtp_capabilities.header_extensions.len()
    );

    Ok(response.router_rtp_capabilities)
}

/// A loaded device: the capabilities both sides agreed on
#[derive(Debug, Clone)]
pub struct Device {
    capabilities: RtpCapabilities,
    kinds: BTreeSet<MediaKind>,
}

impl Device {
    pub fn rtp_capabilities(&self) -> &RtpCapabilities {
        &self.capabilities
    }

    pub fn can_produce(&self, kind: MediaKind) -> bool {
        self.kinds.contains(&kind)
    }
}

/// Intersect router and local capabilities.
///
/// Codecs match on kind, mime type (case-insensitive), clock rate and, for
/// audio, channel count; the router's payload type wins. Every kind in
/// `required` must keep at least one codec.
pub fn build_device(
    router: &RtpCapabilities,
    local: &RtpCapabilities,
    required: &[MediaKind],
) -> SignalResult<Device> {
    let mut codecs = Vec::new();

    for local_codec in local.codecs.iter().filter(|c| !c.is_rtx()) {
        let Some(router_codec) = router
            .codecs
            .iter()
            .filter(|c| !c.is_rtx())
            .find(|c| c.matches(local_codec))
        else {
            continue;
        };

        if codecs.iter().any(|c: &RtpCodecCapability| c.matches(router_codec)) {
            continue;
        }

        let mut codec = router_codec.clone();
        codec
            .rtcp_feedback
            .retain(|fb| local_codec.rtcp_feedback.contains(fb));
        codecs.push(codec);
    }

    let header_extensions = router
        .header_extensions
        .iter()
        .filter(|ext| {
            local
                .header_extensions
                .iter()
                .any(|l| l.kind == ext.kind && l.uri == ext.uri)
        })
        .cloned()
        .collect();

    let capabilities = RtpCapabilities {
        codecs,
        header_extensions,
    };
    let kinds = capabilities.kinds();

    for kind in required {
        if !kinds.contains(kind) {
            return Err(SignalError::UnsupportedMedia { kind: *kind });
        }
    }

    info!(
        "Device loaded: {} common codecs, kinds={:?}",
        capabilities.codecs.len(),
        kinds
    );

    Ok(Device {
        capabilities,
        kinds,
    })
}

/// Codecs offered by a default router: Opus, VP8 and H264
pub fn default_router_codecs() -> Vec<RtpCodecCapability> {
    vec![
        RtpCodecCapability {
            kind: MediaKind::Audio,
            mime_type: "audio/opus".to_string(),
            preferred_payload_type: Some(100),
            clock_rate: 48000,
            channels: Some(2),
            parameters: BTreeMap::new(),
            rtcp_feedback: vec![RtcpFeedback {
                kind: "transport-cc".to_string(),
                parameter: String::new(),
            }],
        },
        RtpCodecCapability {
            kind: MediaKind::Video,
            mime_type: "video/VP8".to_string(),
            preferred_payload_type: Some(101),
            clock_rate: 90000,
            channels: None,
            parameters: BTreeMap::new(),
            rtcp_feedback: video_feedback(),
        },
        RtpCodecCapability {
            kind: MediaKind::Video,
            mime_type: "video/H264".to_string(),
            preferred_payload_type: Some(103),
            clock_rate: 90000,
            channels: None,
            parameters: BTreeMap::from([
                ("packetization-mode".to_string(), serde_json::json!(1)),
                ("profile-level-id".to_string(), serde_json::json!("42e01f")),
            ]),
            rtcp_feedback: video_feedback(),
        },
    ]
}

fn video_feedback() -> Vec<RtcpFeedback> {
    ["nack", "goog-remb", "transport-cc"]
        .iter()
        .map(|kind| RtcpFeedback {
            kind: kind.to_string(),
            parameter: String::new(),
        })
        .chain(std::iter::once(RtcpFeedback {
            kind: "nack".to_string(),
            parameter: "pli".to_string(),
        }))
        .collect()
}
