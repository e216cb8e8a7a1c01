//! Producer registration against a connected send transport

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::engine::{LocalProducer, ProducerEvent};
use crate::error::{CallError, SignalError, SignalResult};
use crate::media::{MediaKind, MediaTrack};
use crate::negotiation::{Device, RtcpFeedback, RtpCapabilities};
use crate::signaling::messages::{events, TransportProduceRequest, TransportProduceResponse};
use crate::signaling::{call_typed, SignalChannel};
use crate::transport::{ConnectionState, SendTransport};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecParameters {
    pub mime_type: String,
    pub payload_type: u8,
    pub clock_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    #[serde(default)]
    pub parameters: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub rtcp_feedback: Vec<RtcpFeedback>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpEncodingParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssrc: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_bitrate: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtcpParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cname: Option<String>,
    #[serde(default = "default_reduced_size")]
    pub reduced_size: bool,
}

fn default_reduced_size() -> bool {
    true
}

/// How a producer's RTP stream is encoded
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mid: Option<String>,
    pub codecs: Vec<RtpCodecParameters>,
    #[serde(default)]
    pub encodings: Vec<RtpEncodingParameters>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rtcp: Option<RtcpParameters>,
}

impl RtpParameters {
    /// Send parameters for one stream of `kind`, using the first negotiated codec
    pub fn for_kind(capabilities: &RtpCapabilities, kind: MediaKind, mid: String) -> Option<Self> {
        let codec = capabilities.media_codecs(kind).next()?;
        let mut rng = rand::thread_rng();

        Some(Self {
            mid: Some(mid),
            codecs: vec![RtpCodecParameters {
                mime_type: codec.mime_type.clone(),
                payload_type: codec.preferred_payload_type.unwrap_or(96),
                clock_rate: codec.clock_rate,
                channels: codec.channels,
                parameters: codec.parameters.clone(),
                rtcp_feedback: codec.rtcp_feedback.clone(),
            }],
            encodings: vec![RtpEncodingParameters {
                ssrc: Some(rng.gen()),
                rid: None,
                max_bitrate: None,
            }],
            rtcp: Some(RtcpParameters {
                cname: Some(format!("{:08x}", rng.gen::<u32>())),
                reduced_size: true,
            }),
        })
    }

    pub fn primary_codec(&self) -> Option<&RtpCodecParameters> {
        self.codecs.first()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProducerState {
    Producing,
    Ended,
}

/// A producer the server has acknowledged
#[derive(Debug)]
pub struct ProducerHandle {
    id: String,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    state: ProducerState,
    events: mpsc::Receiver<ProducerEvent>,
}

impl ProducerHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn rtp_parameters(&self) -> &RtpParameters {
        &self.rtp_parameters
    }

    pub fn state(&self) -> ProducerState {
        self.state
    }

    /// Next lifecycle event; `None` once the engine has let go of the producer
    pub async fn next_event(&mut self) -> Option<ProducerEvent> {
        let event = self.events.recv().await;
        if matches!(event, Some(ProducerEvent::TrackEnded) | None) {
            self.state = ProducerState::Ended;
        }
        event
    }

    /// Wait until the track source is exhausted
    pub async fn wait_track_ended(&mut self) {
        while self.state == ProducerState::Producing {
            match self.next_event().await {
                Some(ProducerEvent::TrackEnded) => info!("Track ended for producer {}", self.id),
                Some(ProducerEvent::TransportClose) => {
                    info!("Transport closed under producer {}", self.id)
                }
                None => warn!("Producer {} dropped by engine without track end", self.id),
            }
        }
    }
}

impl From<LocalProducer> for ProducerHandle {
    fn from(local: LocalProducer) -> Self {
        Self {
            id: local.id,
            kind: local.kind,
            rtp_parameters: local.rtp_parameters,
            state: ProducerState::Producing,
            events: local.events,
        }
    }
}

/// Registers local producers with the server
pub struct ProducerRegistrar {
    channel: Arc<dyn SignalChannel>,
}

impl ProducerRegistrar {
    pub fn new(channel: Arc<dyn SignalChannel>) -> Self {
        Self { channel }
    }

    /// Produce `track` on `transport`.
    ///
    /// The handle is only returned once the server has assigned an id. If the
    /// `transport-produce` call fails the engine discards its local producer
    /// and no handle exists.
    pub async fn produce(
        &self,
        transport: &mut SendTransport,
        device: &Device,
        track: MediaTrack,
    ) -> SignalResult<ProducerHandle> {
        if transport.state() != ConnectionState::Connected {
            return Err(SignalError::protocol(format!(
                "cannot produce on transport {} in state {:?}",
                transport.id(),
                transport.state()
            )));
        }
        if !device.can_produce(track.kind()) {
            return Err(SignalError::UnsupportedMedia { kind: track.kind() });
        }

        info!("Start producing {} on transport {}", track.kind(), transport.id());
        let pending = transport.engine_mut().begin_produce(track).await?;
        let request = transport.next_produce_request(self.channel.as_ref()).await?;

        let message = TransportProduceRequest {
            kind: request.kind,
            rtp_parameters: request.rtp_parameters.clone(),
            session_id: transport.session_id().to_string(),
        };

        let response: Result<TransportProduceResponse, CallError> =
            call_typed(self.channel.as_ref(), events::TRANSPORT_PRODUCE, &message).await;

        match response {
            Ok(response) if !response.id.is_empty() => {
                info!("Got producer {} for {}", response.id, message.kind);
                request.accept(response.id);
            }
            Ok(_) => {
                request.reject("server returned an empty producer id".to_string());
                return Err(CallError::invalid_response(events::TRANSPORT_PRODUCE, "empty producer id").into());
            }
            Err(e) => {
                warn!("transport-produce failed, discarding local producer: {}", e);
                request.reject(e.to_string());
                return Err(e.into());
            }
        }

        let local = pending.finish().await?;
        transport.register_producer(local.id.clone());
        Ok(ProducerHandle::from(local))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::negotiation::default_router_codecs;

    #[test]
    fn test_parameters_use_first_codec_of_kind() {
        let caps = RtpCapabilities {
            codecs: default_router_codecs(),
            header_extensions: vec![],
        };

        let audio = RtpParameters::for_kind(&caps, MediaKind::Audio, "0".to_string()).unwrap();
        let codec = audio.primary_codec().unwrap();
        assert_eq!(codec.mime_type, "audio/opus");
        assert_eq!(codec.payload_type, 100);
        assert_eq!(codec.channels, Some(2));
        assert_eq!(audio.encodings.len(), 1);
        assert!(audio.encodings[0].ssrc.is_some());

        let video_only = RtpCapabilities {
            codecs: caps.codecs.into_iter().filter(|c| c.kind == MediaKind::Video).collect(),
            header_extensions: vec![],
        };
        assert!(RtpParameters::for_kind(&video_only, MediaKind::Audio, "1".to_string()).is_none());
    }

    #[tokio::test]
    async fn test_handle_ends_on_track_end() {
        let (tx, rx) = mpsc::channel(4);
        let caps = RtpCapabilities {
            codecs: default_router_codecs(),
            header_extensions: vec![],
        };
        let mut handle = ProducerHandle::from(LocalProducer {
            id: "p1".to_string(),
            kind: MediaKind::Video,
            rtp_parameters: RtpParameters::for_kind(&caps, MediaKind::Video, "0".to_string()).unwrap(),
            events: rx,
        });

        tx.send(ProducerEvent::TransportClose).await.unwrap();
        tx.send(ProducerEvent::TrackEnded).await.unwrap();
        handle.wait_track_ended().await;

        assert_eq!(handle.state(), ProducerState::Ended);
        assert_eq!(handle.id(), "p1");
    }
}
