//! Send transport lifecycle: creation, DTLS parameter exchange, connection state

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::engine::{EngineTransport, MediaEngine, ProduceRequest, TransportEvent};
use crate::error::{CallError, SignalError, SignalResult};
use crate::negotiation::Device;
use crate::signaling::messages::{
    events, ConnectTransportMessage, CreateTransportRequest, CreateTransportResponse,
};
use crate::signaling::{call_typed, emit_typed, SignalChannel};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DtlsRole {
    #[default]
    Auto,
    Client,
    Server,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DtlsFingerprint {
    pub algorithm: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DtlsParameters {
    #[serde(default)]
    pub role: DtlsRole,
    pub fingerprints: Vec<DtlsFingerprint>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceParameters {
    pub username_fragment: String,
    pub password: String,
    #[serde(default)]
    pub ice_lite: bool,
}

/// Server-issued parameters for a WebRTC transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportParams {
    pub id: String,
    pub ice_parameters: IceParameters,
    /// Passed through to the engine untouched
    #[serde(default)]
    pub ice_candidates: Vec<Value>,
    pub dtls_parameters: DtlsParameters,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sctp_parameters: Option<Value>,
}

impl TransportParams {
    pub fn validate(&self) -> Result<(), String> {
        if self.id.is_empty() {
            return Err("transport id is empty".to_string());
        }
        if self.ice_parameters.username_fragment.is_empty() {
            return Err("ICE username fragment is empty".to_string());
        }
        if self.dtls_parameters.fingerprints.is_empty() {
            return Err("no DTLS fingerprints".to_string());
        }
        Ok(())
    }
}

/// Connection state of a transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Failed,
    Closed,
}

/// A send-only transport owned by exactly one session
pub struct SendTransport {
    session_id: String,
    params: TransportParams,
    state: ConnectionState,
    dtls_sent: bool,
    suppressed_connects: usize,
    producer_ids: Vec<String>,
    engine: Box<dyn EngineTransport>,
}

impl SendTransport {
    pub fn id(&self) -> &str {
        &self.params.id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn params(&self) -> &TransportParams {
        &self.params
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Whether the DTLS parameters have been forwarded to the server
    pub fn dtls_sent(&self) -> bool {
        self.dtls_sent
    }

    /// Engine connect events ignored because the parameters were already sent
    pub fn suppressed_connects(&self) -> usize {
        self.suppressed_connects
    }

    pub fn producer_ids(&self) -> &[String] {
        &self.producer_ids
    }

    pub(crate) fn engine_mut(&mut self) -> &mut dyn EngineTransport {
        self.engine.as_mut()
    }

    pub(crate) fn register_producer(&mut self, producer_id: String) {
        self.producer_ids.push(producer_id);
    }

    /// Apply one engine event. Produce requests are handed back to the caller.
    async fn apply_event(
        &mut self,
        channel: &dyn SignalChannel,
        event: TransportEvent,
    ) -> SignalResult<Option<ProduceRequest>> {
        match event {
            TransportEvent::Connect { dtls_parameters } => {
                if self.dtls_sent {
                    self.suppressed_connects += 1;
                    warn!(
                        "Ignoring repeated connect event on transport {} ({} so far)",
                        self.id(),
                        self.suppressed_connects
                    );
                    return Ok(None);
                }

                info!("Connecting producer transport {} with DTLS parameters", self.id());
                let message = ConnectTransportMessage {
                    dtls_parameters,
                    session_id: self.session_id.clone(),
                };
                emit_typed(channel, events::CONNECT_PRODUCER_TRANSPORT, &message).await?;
                self.dtls_sent = true;
                Ok(None)
            }
            TransportEvent::ConnectionState(state) => {
                debug!("Transport {} state {:?} -> {:?}", self.id(), self.state, state);
                self.state = state;
                match state {
                    ConnectionState::Connected if !self.dtls_sent => Err(SignalError::protocol(
                        format!("transport {} connected before DTLS parameters were sent", self.id()),
                    )),
                    ConnectionState::Failed => {
                        Err(SignalError::transport_failed(self.id(), "ICE/DTLS handshake failed"))
                    }
                    ConnectionState::Closed => {
                        Err(SignalError::transport_failed(self.id(), "transport closed"))
                    }
                    _ => Ok(None),
                }
            }
            TransportEvent::Produce(request) => Ok(Some(request)),
        }
    }

    /// Wait for the engine's next produce request, handling any connection
    /// events that arrive first
    pub(crate) async fn next_produce_request(
        &mut self,
        channel: &dyn SignalChannel,
    ) -> SignalResult<ProduceRequest> {
        loop {
            let Some(event) = self.engine.next_event().await else {
                self.state = ConnectionState::Closed;
                return Err(SignalError::transport_failed(self.id(), "engine event stream ended"));
            };
            if let Some(request) = self.apply_event(channel, event).await? {
                return Ok(request);
            }
        }
    }

    pub async fn close(&mut self) {
        if self.state != ConnectionState::Closed {
            info!("Closing send transport {}", self.id());
            self.engine.close().await;
            self.state = ConnectionState::Closed;
        }
    }
}

/// Creates send transports and drives their DTLS connection
pub struct TransportManager {
    channel: Arc<dyn SignalChannel>,
    engine: Arc<dyn MediaEngine>,
    connect_timeout: Duration,
}

impl TransportManager {
    pub fn new(
        channel: Arc<dyn SignalChannel>,
        engine: Arc<dyn MediaEngine>,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            channel,
            engine,
            connect_timeout,
        }
    }

    /// Ask the server for transport parameters and build the local transport
    pub async fn create_send_transport(
        &self,
        device: &Device,
        session_id: &str,
    ) -> SignalResult<SendTransport> {
        let request = CreateTransportRequest {
            sender: true,
            session_id: session_id.to_string(),
        };

        let response: CreateTransportResponse =
            call_typed(self.channel.as_ref(), events::CREATE_TRANSPORT, &request).await?;
        response
            .params
            .validate()
            .map_err(|reason| CallError::invalid_response(events::CREATE_TRANSPORT, reason))?;

        let engine = self
            .engine
            .create_send_transport(&response.params, device)
            .await?;

        info!(
            "Created send transport {} for session {} ({} ICE candidates)",
            response.params.id,
            session_id,
            response.params.ice_candidates.len()
        );

        Ok(SendTransport {
            session_id: session_id.to_string(),
            params: response.params,
            state: ConnectionState::New,
            dtls_sent: false,
            suppressed_connects: 0,
            producer_ids: Vec::new(),
            engine,
        })
    }

    /// Run the DTLS handshake until the transport is connected.
    ///
    /// The DTLS parameters are emitted exactly once, however many connect
    /// events the engine raises. Failure is terminal; there is no retry.
    pub async fn connect(&self, transport: &mut SendTransport) -> SignalResult<()> {
        match transport.state {
            ConnectionState::Connected => return Ok(()),
            ConnectionState::New => {}
            state => {
                return Err(SignalError::transport_failed(
                    transport.id(),
                    format!("cannot connect from state {:?}", state),
                ))
            }
        }

        transport.engine.start_connect().await?;
        transport.state = ConnectionState::Connecting;

        let channel = self.channel.as_ref();
        let handshake = async {
            loop {
                let Some(event) = transport.engine.next_event().await else {
                    return Err(SignalError::transport_failed(
                        transport.id(),
                        "engine event stream ended",
                    ));
                };
                if let Some(request) = transport.apply_event(channel, event).await? {
                    request.reject("transport not connected".to_string());
                    return Err(SignalError::protocol(
                        "engine requested a producer before the transport connected",
                    ));
                }
                if transport.state == ConnectionState::Connected {
                    return Ok(());
                }
            }
        };

        let outcome = tokio::time::timeout(self.connect_timeout, handshake).await;
        match outcome {
            Ok(result) => result?,
            Err(_) => {
                transport.state = ConnectionState::Failed;
                return Err(SignalError::transport_failed(
                    transport.id(),
                    format!("handshake timed out after {:?}", self.connect_timeout),
                ));
            }
        }

        info!("Send transport {} connected", transport.id());
        Ok(())
    }
}
