use super::config::SessionConfig;
use super::stats::{PhaseTiming, SessionReport, SessionState};
use crate::engine::MediaEngine;
use crate::error::{SignalError, SignalResult};
use crate::media::{MediaKind, MediaTrack};
use crate::negotiation::{build_device, fetch_router_capabilities, SessionBinding};
use crate::producer::ProducerRegistrar;
use crate::recording::RecordingController;
use crate::signaling::messages::{events, ConnectionSuccess};
use crate::signaling::SignalChannel;
use crate::transport::{SendTransport, TransportManager};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Drives one client session through the whole signaling handshake.
///
/// Phases run strictly in order and any failure ends the session; a failed
/// session cannot be resumed and must be restarted with a fresh channel.
pub struct SessionCoordinator {
    /// Session configuration
    config: SessionConfig,

    /// Signaling channel owned by this session
    channel: Arc<dyn SignalChannel>,

    /// Local WebRTC engine
    engine: Arc<dyn MediaEngine>,

    /// Tracks still waiting to be produced
    tracks: Vec<MediaTrack>,

    state: SessionState,

    binding: SessionBinding,

    /// When the coordinator was created
    started_at: DateTime<Utc>,

    phases: Vec<PhaseTiming>,
}

impl SessionCoordinator {
    /// Create a coordinator over an already connected channel
    pub fn new(
        config: SessionConfig,
        channel: Arc<dyn SignalChannel>,
        engine: Arc<dyn MediaEngine>,
        tracks: Vec<MediaTrack>,
    ) -> Self {
        let started_at = Utc::now();
        Self {
            config,
            channel,
            engine,
            tracks,
            state: SessionState::Connecting,
            binding: SessionBinding::default(),
            started_at,
            phases: vec![PhaseTiming {
                state: SessionState::Connecting,
                at: started_at,
            }],
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn session_id(&self) -> Option<&str> {
        self.binding.session_id()
    }

    /// Run the session to completion, then release the transport and channel
    pub async fn run(mut self) -> SignalResult<SessionReport> {
        info!(
            "Starting session {} ({} channel, {} engine, {} tracks)",
            self.config.label,
            self.channel.name(),
            self.engine.name(),
            self.tracks.len()
        );

        let mut transport = None;
        let outcome = self.drive(&mut transport).await;

        if let Some(transport) = transport.as_mut() {
            transport.close().await;
        }
        if let Err(e) = self.channel.close().await {
            warn!("Failed to close channel for session {}: {}", self.display_id(), e);
        }

        match outcome {
            Ok(report) => {
                info!(
                    "Session {} complete in {:.1}s",
                    report.session_id, report.duration_secs
                );
                Ok(report)
            }
            Err(e) => {
                error!(
                    "Session {} failed while {:?}: {}",
                    self.display_id(),
                    self.state,
                    e
                );
                self.state = SessionState::Failed;
                self.phases.push(PhaseTiming {
                    state: SessionState::Failed,
                    at: Utc::now(),
                });
                Err(e)
            }
        }
    }

    async fn drive(&mut self, transport_slot: &mut Option<SendTransport>) -> SignalResult<SessionReport> {
        self.await_greeting().await?;

        let router = fetch_router_capabilities(self.channel.as_ref(), &mut self.binding).await?;
        self.advance(SessionState::CapabilitiesExchanged)?;

        let required: Vec<MediaKind> = self.tracks.iter().map(MediaTrack::kind).collect();
        if required.is_empty() {
            return Err(SignalError::protocol("session has no tracks to produce"));
        }
        let device = build_device(&router, &self.engine.rtp_capabilities(), &required)?;

        let session_id = self.binding.require(events::CREATE_TRANSPORT)?.to_string();
        let manager = TransportManager::new(
            Arc::clone(&self.channel),
            Arc::clone(&self.engine),
            self.config.connect_timeout,
        );
        let transport = transport_slot.insert(manager.create_send_transport(&device, &session_id).await?);
        self.advance(SessionState::TransportCreated)?;

        manager.connect(transport).await?;
        self.advance(SessionState::TransportConnected)?;

        let registrar = ProducerRegistrar::new(Arc::clone(&self.channel));
        let mut producers = Vec::with_capacity(self.tracks.len());
        for track in std::mem::take(&mut self.tracks) {
            producers.push(registrar.produce(transport, &device, track).await?);
        }
        self.advance(SessionState::Producing)?;

        let recorder = RecordingController::new(Arc::clone(&self.channel));
        recorder.start(transport).await?;
        self.advance(SessionState::Recording)?;

        for producer in producers.iter_mut() {
            producer.wait_track_ended().await;
        }
        info!("All tracks ended for session {}", session_id);

        let artifact = recorder.stop(&session_id).await?;
        self.advance(SessionState::Stopped)?;

        let persisted = artifact
            .persist(&self.config.output_dir.join(&session_id))
            .await?;

        let duration = Utc::now().signed_duration_since(self.started_at);

        Ok(SessionReport {
            session_id,
            state: self.state,
            transport_id: transport.id().to_string(),
            producer_ids: transport.producer_ids().to_vec(),
            suppressed_dtls_connects: transport.suppressed_connects(),
            first_image_bytes: artifact.first_image.len(),
            last_image_bytes: artifact.last_image.len(),
            first_captured_at: artifact.first_captured_at,
            last_captured_at: artifact.last_captured_at,
            artifact: persisted,
            started_at: self.started_at,
            duration_secs: duration.num_milliseconds() as f64 / 1000.0,
            phases: self.phases.clone(),
        })
    }

    async fn await_greeting(&mut self) -> SignalResult<()> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.channel
            .on(
                events::CONNECTION_SUCCESS,
                Arc::new(move |payload: Value| {
                    let _ = tx.send(payload);
                }),
            )
            .await;

        let payload = tokio::time::timeout(self.config.greeting_timeout, rx.recv())
            .await
            .map_err(|_| {
                SignalError::Connect(format!(
                    "no {} within {:?}",
                    events::CONNECTION_SUCCESS,
                    self.config.greeting_timeout
                ))
            })?
            .ok_or_else(|| SignalError::Connect("channel closed before greeting".to_string()))?;

        let greeting: ConnectionSuccess = serde_json::from_value(payload)
            .map_err(|e| SignalError::protocol(format!("malformed greeting: {}", e)))?;

        let session_id = self.binding.bind(&greeting.session_id)?;
        info!("Connection success, session {}", session_id);
        Ok(())
    }

    fn advance(&mut self, next: SessionState) -> SignalResult<()> {
        if next <= self.state || self.state.is_terminal() {
            return Err(SignalError::protocol(format!(
                "illegal session transition {:?} -> {:?}",
                self.state, next
            )));
        }
        info!("Session {}: {:?} -> {:?}", self.display_id(), self.state, next);
        self.state = next;
        self.phases.push(PhaseTiming {
            state: next,
            at: Utc::now(),
        });
        Ok(())
    }

    fn display_id(&self) -> &str {
        self.binding.session_id().unwrap_or(&self.config.label)
    }
}

/// Run sessions concurrently. They share nothing; one failing does not affect the others.
pub async fn run_sessions(coordinators: Vec<SessionCoordinator>) -> Vec<SignalResult<SessionReport>> {
    let handles: Vec<_> = coordinators
        .into_iter()
        .map(|coordinator| tokio::spawn(coordinator.run()))
        .collect();

    futures::future::join_all(handles)
        .await
        .into_iter()
        .map(|joined| match joined {
            Ok(result) => result,
            Err(e) => Err(SignalError::Task(e.to_string())),
        })
        .collect()
}
