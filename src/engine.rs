//! WebRTC engine seam
//!
//! The engine owns ICE/DTLS and RTP. The signaling core only sees the events
//! it raises, delivered on a stream the transport manager and the producer
//! registrar await one at a time:
//! - `Connect`: local DTLS parameters are ready and must reach the server
//! - `ConnectionState`: ICE/DTLS progress
//! - `Produce`: the engine needs a server producer id before a producer is valid
//!
//! [`SimulatedEngine`] stands in for a real stack: it completes the handshake
//! on its own and forwards track frames to a [`MediaSink`].

use async_trait::async_trait;
use base64::Engine as _;
use rand::Rng;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{SignalError, SignalResult};
use crate::media::{MediaKind, MediaTrack};
use crate::negotiation::{Device, RtcpFeedback, RtpCapabilities, RtpCodecCapability};
use crate::producer::RtpParameters;
use crate::signaling::messages::MediaFrameMessage;
use crate::transport::{ConnectionState, DtlsFingerprint, DtlsParameters, DtlsRole, TransportParams};

/// Event raised by an engine transport
#[derive(Debug)]
pub enum TransportEvent {
    Connect { dtls_parameters: DtlsParameters },
    ConnectionState(ConnectionState),
    Produce(ProduceRequest),
}

/// The engine asking for a server-side producer id
#[derive(Debug)]
pub struct ProduceRequest {
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
    reply: oneshot::Sender<Result<String, String>>,
}

impl ProduceRequest {
    pub fn new(
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        reply: oneshot::Sender<Result<String, String>>,
    ) -> Self {
        Self {
            kind,
            rtp_parameters,
            reply,
        }
    }

    pub fn accept(self, producer_id: String) {
        if self.reply.send(Ok(producer_id)).is_err() {
            warn!("Engine dropped produce request before it was accepted");
        }
    }

    pub fn reject(self, reason: String) {
        let _ = self.reply.send(Err(reason));
    }
}

/// Producer lifecycle events raised by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProducerEvent {
    /// Track source exhausted; the normal end of a recorded session
    TrackEnded,
    /// The owning transport closed. Informational.
    TransportClose,
}

/// A producer the engine created after the server assigned its id
#[derive(Debug)]
pub struct LocalProducer {
    pub id: String,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
    pub events: mpsc::Receiver<ProducerEvent>,
}

/// Resolves once the engine's produce request has been answered
pub struct PendingProduce {
    rx: oneshot::Receiver<Result<LocalProducer, String>>,
}

impl PendingProduce {
    pub fn new(rx: oneshot::Receiver<Result<LocalProducer, String>>) -> Self {
        Self { rx }
    }

    pub async fn finish(self) -> SignalResult<LocalProducer> {
        match self.rx.await {
            Ok(Ok(producer)) => Ok(producer),
            Ok(Err(reason)) => Err(SignalError::Media(format!("produce failed: {}", reason))),
            Err(_) => Err(SignalError::Media("engine dropped the producer".to_string())),
        }
    }
}

/// Receives media frames from local producers
#[async_trait]
pub trait MediaSink: Send + Sync {
    async fn send_frame(&self, frame: MediaFrameMessage) -> SignalResult<()>;
}

/// A WebRTC engine able to build send transports
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// What the local device can send
    fn rtp_capabilities(&self) -> RtpCapabilities;

    /// Build a local send transport bound to server-issued parameters
    async fn create_send_transport(
        &self,
        params: &TransportParams,
        device: &Device,
    ) -> SignalResult<Box<dyn EngineTransport>>;

    fn name(&self) -> &str;
}

/// Local half of a send transport
#[async_trait]
pub trait EngineTransport: Send + Sync {
    fn id(&self) -> &str;

    /// Begin the ICE/DTLS handshake; progress arrives through `next_event`
    async fn start_connect(&mut self) -> SignalResult<()>;

    async fn next_event(&mut self) -> Option<TransportEvent>;

    /// Start producing `track`. The engine raises `TransportEvent::Produce`;
    /// the returned handle resolves once that request is answered.
    async fn begin_produce(&mut self, track: MediaTrack) -> SignalResult<PendingProduce>;

    async fn close(&mut self);
}

/// Behaviour knobs for [`SimulatedEngine`]
#[derive(Debug, Clone)]
pub struct SimulatedEngineConfig {
    pub codecs: Vec<RtpCodecCapability>,
    /// How many times the connect event fires during one handshake
    pub connect_event_repeats: usize,
    /// Report `failed` instead of `connected`
    pub fail_handshake: bool,
}

impl Default for SimulatedEngineConfig {
    fn default() -> Self {
        Self {
            codecs: vec![
                RtpCodecCapability {
                    kind: MediaKind::Audio,
                    mime_type: "audio/opus".to_string(),
                    preferred_payload_type: Some(111),
                    clock_rate: 48000,
                    channels: Some(2),
                    parameters: Default::default(),
                    rtcp_feedback: vec![],
                },
                RtpCodecCapability {
                    kind: MediaKind::Video,
                    mime_type: "video/VP8".to_string(),
                    preferred_payload_type: Some(96),
                    clock_rate: 90000,
                    channels: None,
                    parameters: Default::default(),
                    rtcp_feedback: vec![
                        RtcpFeedback {
                            kind: "nack".to_string(),
                            parameter: String::new(),
                        },
                        RtcpFeedback {
                            kind: "nack".to_string(),
                            parameter: "pli".to_string(),
                        },
                    ],
                },
            ],
            connect_event_repeats: 1,
            fail_handshake: false,
        }
    }
}

/// File-driven engine with no real network stack
pub struct SimulatedEngine {
    config: SimulatedEngineConfig,
    sink: Arc<dyn MediaSink>,
}

impl SimulatedEngine {
    pub fn new(config: SimulatedEngineConfig, sink: Arc<dyn MediaSink>) -> Self {
        Self { config, sink }
    }
}

#[async_trait]
impl MediaEngine for SimulatedEngine {
    fn rtp_capabilities(&self) -> RtpCapabilities {
        RtpCapabilities {
            codecs: self.config.codecs.clone(),
            header_extensions: vec![],
        }
    }

    async fn create_send_transport(
        &self,
        params: &TransportParams,
        device: &Device,
    ) -> SignalResult<Box<dyn EngineTransport>> {
        debug!("Creating simulated send transport {}", params.id);
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        Ok(Box::new(SimulatedTransport {
            id: params.id.clone(),
            config: self.config.clone(),
            capabilities: device.rtp_capabilities().clone(),
            local_dtls: local_dtls_parameters(),
            state: ConnectionState::New,
            event_tx,
            event_rx,
            sink: Arc::clone(&self.sink),
            producers: Vec::new(),
            next_mid: 0,
        }))
    }

    fn name(&self) -> &str {
        "simulated"
    }
}

struct SimulatedTransport {
    id: String,
    config: SimulatedEngineConfig,
    capabilities: RtpCapabilities,
    local_dtls: DtlsParameters,
    state: ConnectionState,
    event_tx: mpsc::UnboundedSender<TransportEvent>,
    event_rx: mpsc::UnboundedReceiver<TransportEvent>,
    sink: Arc<dyn MediaSink>,
    producers: Vec<(JoinHandle<()>, mpsc::Sender<ProducerEvent>)>,
    next_mid: u32,
}

impl SimulatedTransport {
    fn raise(&self, event: TransportEvent) {
        // The receiver lives in `self`, so this only fails during drop
        let _ = self.event_tx.send(event);
    }
}

#[async_trait]
impl EngineTransport for SimulatedTransport {
    fn id(&self) -> &str {
        &self.id
    }

    async fn start_connect(&mut self) -> SignalResult<()> {
        if self.state != ConnectionState::New {
            return Err(SignalError::protocol(format!(
                "transport {} handshake already started ({:?})",
                self.id, self.state
            )));
        }

        self.state = ConnectionState::Connecting;
        self.raise(TransportEvent::ConnectionState(ConnectionState::Connecting));
        for _ in 0..self.config.connect_event_repeats.max(1) {
            self.raise(TransportEvent::Connect {
                dtls_parameters: self.local_dtls.clone(),
            });
        }

        let outcome = if self.config.fail_handshake {
            ConnectionState::Failed
        } else {
            ConnectionState::Connected
        };
        self.state = outcome;
        self.raise(TransportEvent::ConnectionState(outcome));
        Ok(())
    }

    async fn next_event(&mut self) -> Option<TransportEvent> {
        self.event_rx.recv().await
    }

    async fn begin_produce(&mut self, track: MediaTrack) -> SignalResult<PendingProduce> {
        if self.state != ConnectionState::Connected {
            return Err(SignalError::protocol(format!(
                "cannot produce on transport {} in state {:?}",
                self.id, self.state
            )));
        }

        let kind = track.kind();
        let mid = self.next_mid.to_string();
        self.next_mid += 1;
        let rtp_parameters = RtpParameters::for_kind(&self.capabilities, kind, mid)
            .ok_or(SignalError::UnsupportedMedia { kind })?;

        let (reply_tx, reply_rx) = oneshot::channel();
        self.raise(TransportEvent::Produce(ProduceRequest::new(
            kind,
            rtp_parameters.clone(),
            reply_tx,
        )));

        let (done_tx, done_rx) = oneshot::channel();
        let (producer_tx, producer_rx) = mpsc::channel(4);
        let ended_tx = producer_tx.clone();
        let sink = Arc::clone(&self.sink);
        let mut frames = track.into_frames();

        let task = tokio::spawn(async move {
            let producer_id = match reply_rx.await {
                Ok(Ok(id)) => id,
                Ok(Err(reason)) => {
                    let _ = done_tx.send(Err(reason));
                    return;
                }
                Err(_) => {
                    let _ = done_tx.send(Err("produce request dropped".to_string()));
                    return;
                }
            };

            let producer = LocalProducer {
                id: producer_id.clone(),
                kind,
                rtp_parameters,
                events: producer_rx,
            };
            if done_tx.send(Ok(producer)).is_err() {
                return;
            }

            info!("Producer {} streaming {} frames", producer_id, kind);
            let mut sent = 0u64;
            while let Some(frame) = frames.recv().await {
                let message = MediaFrameMessage {
                    producer_id: producer_id.clone(),
                    sequence: frame.sequence,
                    timestamp_ms: frame.timestamp_ms,
                    data: base64::engine::general_purpose::STANDARD.encode(&frame.data),
                };
                if let Err(e) = sink.send_frame(message).await {
                    warn!("Failed to send frame {} of producer {}: {}", frame.sequence, producer_id, e);
                    continue;
                }
                sent += 1;
            }

            info!("Track ended for producer {} after {} frames", producer_id, sent);
            let _ = ended_tx.send(ProducerEvent::TrackEnded).await;
        });

        self.producers.push((task, producer_tx));
        Ok(PendingProduce::new(done_rx))
    }

    async fn close(&mut self) {
        if self.state == ConnectionState::Closed {
            return;
        }
        self.state = ConnectionState::Closed;
        for (task, events) in self.producers.drain(..) {
            if !task.is_finished() {
                task.abort();
                let _ = events.try_send(ProducerEvent::TransportClose);
            }
        }
        debug!("Simulated transport {} closed", self.id);
    }
}

fn local_dtls_parameters() -> DtlsParameters {
    let bytes: [u8; 32] = rand::thread_rng().gen();
    let value = bytes
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(":");

    DtlsParameters {
        role: DtlsRole::Client,
        fingerprints: vec![DtlsFingerprint {
            algorithm: "sha-256".to_string(),
            value,
        }],
    }
}
