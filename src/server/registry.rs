use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::media::MediaKind;
use crate::negotiation::RtpCapabilities;
use crate::signaling::messages::{
    events, ConnectTransportMessage, ConnectionSuccess, CreateTransportRequest,
    CreateTransportResponse, MediaFrameMessage, PushMessage, RecordRequest, Reply,
    RouterCapabilitiesRequest, RouterCapabilitiesResponse, StopRecordResponse,
    TransportProduceRequest, TransportProduceResponse,
};
use crate::signaling::SignalService;
use crate::transport::{DtlsFingerprint, DtlsParameters, DtlsRole, IceParameters, TransportParams};

type IdGenerator = Box<dyn Fn() -> String + Send + Sync>;

/// Closed sessions kept when no limit is configured
pub const DEFAULT_CLOSED_HISTORY: usize = 256;

#[derive(Debug, Clone)]
struct CapturedFrame {
    data: Vec<u8>,
    captured_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
enum Recording {
    #[default]
    Idle,
    Active {
        first: Option<CapturedFrame>,
        last: Option<CapturedFrame>,
    },
    Stopped,
}

impl Recording {
    fn label(&self) -> &'static str {
        match self {
            Recording::Idle => "idle",
            Recording::Active { .. } => "recording",
            Recording::Stopped => "stopped",
        }
    }
}

#[derive(Debug, Clone)]
struct ServerTransport {
    id: String,
    client_dtls: Option<DtlsParameters>,
}

#[derive(Debug, Clone)]
struct ServerProducer {
    id: String,
    kind: MediaKind,
}

#[derive(Debug, Clone)]
struct ServerSession {
    id: String,
    client_id: String,
    created_at: DateTime<Utc>,
    transport: Option<ServerTransport>,
    producer: Option<ServerProducer>,
    recording: Recording,
    /// Most recent frame, kept so a recording started mid-stream has a first frame
    latest_frame: Option<CapturedFrame>,
    frames_received: u64,
    dtls_connects: usize,
    rejected_dtls_connects: usize,
}

impl ServerSession {
    fn snapshot(&self, closed_at: Option<DateTime<Utc>>) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.id.clone(),
            client_id: self.client_id.clone(),
            created_at: self.created_at,
            closed_at,
            transport_id: self.transport.as_ref().map(|t| t.id.clone()),
            transport_connected: self
                .transport
                .as_ref()
                .is_some_and(|t| t.client_dtls.is_some()),
            producer_id: self.producer.as_ref().map(|p| p.id.clone()),
            producer_kind: self.producer.as_ref().map(|p| p.kind),
            recording: self.recording.label().to_string(),
            frames_received: self.frames_received,
            dtls_connects: self.dtls_connects,
            rejected_dtls_connects: self.rejected_dtls_connects,
        }
    }
}

/// Point-in-time view of a server session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub client_id: String,
    pub created_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub transport_id: Option<String>,
    pub transport_connected: bool,
    pub producer_id: Option<String>,
    pub producer_kind: Option<MediaKind>,
    pub recording: String,
    pub frames_received: u64,
    /// Accepted `connectProducerTransport` emissions (at most one)
    pub dtls_connects: usize,
    /// Duplicate `connectProducerTransport` emissions that were refused
    pub rejected_dtls_connects: usize,
}

/// Minimal SFU session registry.
///
/// Accepts one send transport and one producer per session and records the
/// first and last frame that producer delivers while recording is active.
pub struct SfuServer {
    router_capabilities: RtpCapabilities,
    sessions: RwLock<HashMap<String, ServerSession>>,
    /// producer id → session id
    producers: RwLock<HashMap<String, String>>,
    closed: RwLock<VecDeque<SessionSnapshot>>,
    closed_limit: usize,
    next_session_id: IdGenerator,
}

impl SfuServer {
    pub fn new(router_capabilities: RtpCapabilities) -> Self {
        Self {
            router_capabilities,
            sessions: RwLock::new(HashMap::new()),
            producers: RwLock::new(HashMap::new()),
            closed: RwLock::new(VecDeque::new()),
            closed_limit: DEFAULT_CLOSED_HISTORY,
            next_session_id: Box::new(|| uuid::Uuid::new_v4().to_string()),
        }
    }

    /// Use a custom session id generator
    pub fn with_session_ids(mut self, generator: impl Fn() -> String + Send + Sync + 'static) -> Self {
        self.next_session_id = Box::new(generator);
        self
    }

    /// Keep at most `limit` closed sessions
    pub fn with_closed_history(mut self, limit: usize) -> Self {
        self.closed_limit = limit;
        self
    }

    pub fn router_capabilities(&self) -> &RtpCapabilities {
        &self.router_capabilities
    }

    pub async fn active_sessions(&self) -> Vec<SessionSnapshot> {
        let sessions = self.sessions.read().await;
        let mut snapshots: Vec<_> = sessions.values().map(|s| s.snapshot(None)).collect();
        snapshots.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        snapshots
    }

    pub async fn closed_sessions(&self) -> Vec<SessionSnapshot> {
        self.closed.read().await.iter().cloned().collect()
    }

    /// Look up a session, active or closed
    pub async fn session(&self, session_id: &str) -> Option<SessionSnapshot> {
        if let Some(session) = self.sessions.read().await.get(session_id) {
            return Some(session.snapshot(None));
        }
        self.closed
            .read()
            .await
            .iter()
            .rev()
            .find(|s| s.session_id == session_id)
            .cloned()
    }

    async fn create_session(&self, client_id: &str) -> String {
        let session_id = (self.next_session_id)();
        let session = ServerSession {
            id: session_id.clone(),
            client_id: client_id.to_string(),
            created_at: Utc::now(),
            transport: None,
            producer: None,
            recording: Recording::Idle,
            latest_frame: None,
            frames_received: 0,
            dtls_connects: 0,
            rejected_dtls_connects: 0,
        };
        self.sessions
            .write()
            .await
            .insert(session_id.clone(), session);
        info!("Created session {} for client {}", session_id, client_id);
        session_id
    }

    /// Run `f` on the session `session_id`, which must belong to `client_id`
    async fn with_session<T>(
        &self,
        client_id: &str,
        session_id: &str,
        f: impl FnOnce(&mut ServerSession) -> Result<T, String>,
    ) -> Result<T, String> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| format!("unknown session '{}'", session_id))?;
        if session.client_id != client_id {
            return Err(format!("session '{}' belongs to another client", session_id));
        }
        f(session)
    }

    async fn router_rtp_capabilities(&self, client_id: &str, payload: Value) -> Result<Value, String> {
        let request: RouterCapabilitiesRequest = parse(payload)?;

        let session_id = match request.session_id {
            Some(id) => self.with_session(client_id, &id, |s| Ok(s.id.clone())).await?,
            None => {
                let existing = self
                    .sessions
                    .read()
                    .await
                    .values()
                    .find(|s| s.client_id == client_id)
                    .map(|s| s.id.clone());
                match existing {
                    Some(id) => id,
                    None => self.create_session(client_id).await,
                }
            }
        };

        encode(&RouterCapabilitiesResponse {
            session_id,
            router_rtp_capabilities: self.router_capabilities.clone(),
        })
    }

    async fn create_transport(&self, client_id: &str, payload: Value) -> Result<Value, String> {
        let request: CreateTransportRequest = parse(payload)?;
        if !request.sender {
            return Err("only send transports are supported".to_string());
        }

        let params = self
            .with_session(client_id, &request.session_id, |session| {
                if session.transport.is_some() {
                    return Err("session already has a transport".to_string());
                }
                let params = new_transport_params();
                session.transport = Some(ServerTransport {
                    id: params.id.clone(),
                    client_dtls: None,
                });
                Ok(params)
            })
            .await?;

        info!("Created transport {} for session {}", params.id, request.session_id);
        encode(&CreateTransportResponse { params })
    }

    async fn transport_produce(&self, client_id: &str, payload: Value) -> Result<Value, String> {
        let request: TransportProduceRequest = parse(payload)?;

        if !self.router_capabilities.supports(request.kind) {
            return Err(format!("router does not support {}", request.kind));
        }
        let Some(codec) = request.rtp_parameters.primary_codec() else {
            return Err("rtpParameters has no codecs".to_string());
        };
        let codec_supported = self
            .router_capabilities
            .media_codecs(request.kind)
            .any(|c| c.mime_type.eq_ignore_ascii_case(&codec.mime_type));
        if !codec_supported {
            return Err(format!("codec {} is not offered by the router", codec.mime_type));
        }

        let producer_id = self
            .with_session(client_id, &request.session_id, |session| {
                let transport = session
                    .transport
                    .as_ref()
                    .ok_or_else(|| "no transport".to_string())?;
                if transport.client_dtls.is_none() {
                    return Err("transport is not connected".to_string());
                }
                if session.producer.is_some() {
                    return Err("session already has a producer".to_string());
                }
                let id = uuid::Uuid::new_v4().to_string();
                session.producer = Some(ServerProducer {
                    id: id.clone(),
                    kind: request.kind,
                });
                Ok(id)
            })
            .await?;

        self.producers
            .write()
            .await
            .insert(producer_id.clone(), request.session_id.clone());

        info!(
            "Session {} producing {} as {}",
            request.session_id, request.kind, producer_id
        );
        encode(&TransportProduceResponse { id: producer_id })
    }

    async fn stop_record(&self, client_id: &str, payload: Value) -> Result<Value, String> {
        let request: RecordRequest = parse(payload)?;

        let (first, last) = self
            .with_session(client_id, &request.session_id, |session| {
                let Recording::Active { first, last } = &session.recording else {
                    return Err(format!("session is {}, not recording", session.recording.label()));
                };
                match (first.clone(), last.clone()) {
                    (Some(first), Some(last)) => {
                        session.recording = Recording::Stopped;
                        Ok((first, last))
                    }
                    _ => Err("no frames captured".to_string()),
                }
            })
            .await?;

        info!(
            "Recording stopped for session {} ({} / {} bytes)",
            request.session_id,
            first.data.len(),
            last.data.len()
        );

        let b64 = base64::engine::general_purpose::STANDARD;
        encode(&StopRecordResponse {
            first_image: Some(b64.encode(&first.data)),
            last_image: Some(b64.encode(&last.data)),
            first_captured_at: Some(first.captured_at),
            last_captured_at: Some(last.captured_at),
        })
    }

    async fn connect_transport(&self, client_id: &str, payload: Value) -> Result<(), String> {
        let message: ConnectTransportMessage = parse(payload)?;
        if message.dtls_parameters.fingerprints.is_empty() {
            return Err("no DTLS fingerprints".to_string());
        }

        self.with_session(client_id, &message.session_id, |session| {
            let Some(transport) = session.transport.as_mut() else {
                return Err("no transport".to_string());
            };
            if transport.client_dtls.is_some() {
                session.rejected_dtls_connects += 1;
                return Err(format!("transport {} already connected", transport.id));
            }
            transport.client_dtls = Some(message.dtls_parameters);
            session.dtls_connects += 1;
            info!("Transport {} connected", transport.id);
            Ok(())
        })
        .await
    }

    async fn start_record(&self, client_id: &str, payload: Value) -> Result<(), String> {
        let request: RecordRequest = parse(payload)?;

        self.with_session(client_id, &request.session_id, |session| {
            if session.producer.is_none() {
                return Err("nothing to record".to_string());
            }
            if matches!(session.recording, Recording::Active { .. }) {
                return Err("already recording".to_string());
            }
            session.recording = Recording::Active {
                first: session.latest_frame.clone(),
                last: session.latest_frame.clone(),
            };
            info!("Recording started for session {}", session.id);
            Ok(())
        })
        .await
    }

    async fn ingest(&self, frame: MediaFrameMessage) -> Result<(), String> {
        let session_id = self
            .producers
            .read()
            .await
            .get(&frame.producer_id)
            .cloned()
            .ok_or_else(|| format!("unknown producer '{}'", frame.producer_id))?;

        let data = base64::engine::general_purpose::STANDARD
            .decode(&frame.data)
            .map_err(|e| format!("bad frame data: {}", e))?;
        if data.is_empty() {
            return Ok(());
        }

        let captured = CapturedFrame {
            data,
            captured_at: Utc::now(),
        };

        let mut sessions = self.sessions.write().await;
        let Some(session) = sessions.get_mut(&session_id) else {
            return Ok(());
        };
        session.frames_received += 1;
        if let Recording::Active { first, last } = &mut session.recording {
            if first.is_none() {
                *first = Some(captured.clone());
            }
            *last = Some(captured.clone());
        }
        session.latest_frame = Some(captured);
        Ok(())
    }

    async fn close_client(&self, client_id: &str) {
        let removed: Vec<ServerSession> = {
            let mut sessions = self.sessions.write().await;
            let ids: Vec<String> = sessions
                .values()
                .filter(|s| s.client_id == client_id)
                .map(|s| s.id.clone())
                .collect();
            ids.iter().filter_map(|id| sessions.remove(id)).collect()
        };

        if removed.is_empty() {
            return;
        }

        let now = Utc::now();
        {
            let mut producers = self.producers.write().await;
            for session in &removed {
                if let Some(producer) = &session.producer {
                    producers.remove(&producer.id);
                }
            }
        }

        let mut closed = self.closed.write().await;
        for session in removed {
            info!("Session {} closed", session.id);
            closed.push_back(session.snapshot(Some(now)));
        }
        while closed.len() > self.closed_limit {
            if let Some(dropped) = closed.pop_front() {
                debug!("Dropped closed session {} from history", dropped.session_id);
            }
        }
    }
}

#[async_trait]
impl SignalService for SfuServer {
    async fn connect(&self, client_id: &str) -> Result<Vec<PushMessage>, String> {
        let session_id = self.create_session(client_id).await;
        let greeting = ConnectionSuccess { session_id };
        Ok(vec![PushMessage {
            event: events::CONNECTION_SUCCESS.to_string(),
            payload: encode(&greeting)?,
        }])
    }

    async fn handle_emit(&self, client_id: &str, event: &str, payload: Value) {
        let result = match event {
            events::CONNECT_PRODUCER_TRANSPORT => self.connect_transport(client_id, payload).await,
            events::START_RECORD => self.start_record(client_id, payload).await,
            other => Err(format!("unknown event '{}'", other)),
        };
        if let Err(reason) = result {
            warn!("Rejected '{}' from client {}: {}", event, client_id, reason);
        }
    }

    async fn handle_call(&self, client_id: &str, event: &str, payload: Value) -> Reply {
        debug!("call {} from client {}", event, client_id);
        let result = match event {
            events::GET_ROUTER_RTP_CAPABILITIES => self.router_rtp_capabilities(client_id, payload).await,
            events::CREATE_TRANSPORT => self.create_transport(client_id, payload).await,
            events::TRANSPORT_PRODUCE => self.transport_produce(client_id, payload).await,
            events::STOP_RECORD => self.stop_record(client_id, payload).await,
            other => Err(format!("unknown event '{}'", other)),
        };
        match result {
            Ok(value) => Reply::Ok(value),
            Err(reason) => {
                warn!("Call '{}' from client {} failed: {}", event, client_id, reason);
                Reply::Error(reason)
            }
        }
    }

    async fn handle_media(&self, client_id: &str, frame: MediaFrameMessage) {
        if let Err(reason) = self.ingest(frame).await {
            debug!("Dropped frame from client {}: {}", client_id, reason);
        }
    }

    async fn disconnect(&self, client_id: &str) {
        self.close_client(client_id).await;
    }
}

fn parse<T: serde::de::DeserializeOwned>(payload: Value) -> Result<T, String> {
    // Socket-style clients may send no body at all
    let payload = if payload.is_null() { json!({}) } else { payload };
    serde_json::from_value(payload).map_err(|e| format!("malformed request: {}", e))
}

fn encode<T: Serialize>(value: &T) -> Result<Value, String> {
    serde_json::to_value(value).map_err(|e| format!("failed to encode response: {}", e))
}

fn random_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

fn new_transport_params() -> TransportParams {
    let fingerprint: [u8; 32] = rand::thread_rng().gen();
    TransportParams {
        id: uuid::Uuid::new_v4().to_string(),
        ice_parameters: IceParameters {
            username_fragment: random_token(16),
            password: random_token(32),
            ice_lite: true,
        },
        ice_candidates: vec![json!({
            "foundation": "udpcandidate",
            "ip": "127.0.0.1",
            "port": 40000,
            "priority": 1076302079u32,
            "protocol": "udp",
            "type": "host",
        })],
        dtls_parameters: DtlsParameters {
            role: DtlsRole::Auto,
            fingerprints: vec![DtlsFingerprint {
                algorithm: "sha-256".to_string(),
                value: fingerprint
                    .iter()
                    .map(|b| format!("{:02X}", b))
                    .collect::<Vec<_>>()
                    .join(":"),
            }],
        },
        sctp_parameters: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::negotiation::{default_router_codecs, RtpCapabilities};
    use crate::producer::RtpParameters;

    fn server() -> SfuServer {
        SfuServer::new(RtpCapabilities {
            codecs: default_router_codecs(),
            header_extensions: vec![],
        })
    }

    async fn call(server: &SfuServer, event: &str, payload: Value) -> Result<Value, String> {
        match server.handle_call("client-1", event, payload).await {
            Reply::Ok(v) => Ok(v),
            Reply::Error(e) => Err(e),
        }
    }

    async fn connected_session(server: &SfuServer) -> String {
        let pushes = server.connect("client-1").await.unwrap();
        let session_id = pushes[0].payload["sessionId"].as_str().unwrap().to_string();
        call(server, events::CREATE_TRANSPORT, json!({"sender": true, "sessionId": session_id}))
            .await
            .unwrap();
        server
            .handle_emit(
                "client-1",
                events::CONNECT_PRODUCER_TRANSPORT,
                json!({
                    "dtlsParameters": {"role": "client", "fingerprints": [{"algorithm": "sha-256", "value": "AA"}]},
                    "sessionId": session_id,
                }),
            )
            .await;
        session_id
    }

    fn vp8_parameters(caps: &RtpCapabilities) -> Value {
        serde_json::to_value(RtpParameters::for_kind(caps, MediaKind::Video, "0".to_string()).unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_duplicate_dtls_connect_is_rejected() {
        let server = server();
        let session_id = connected_session(&server).await;

        server
            .handle_emit(
                "client-1",
                events::CONNECT_PRODUCER_TRANSPORT,
                json!({
                    "dtlsParameters": {"fingerprints": [{"algorithm": "sha-256", "value": "BB"}]},
                    "sessionId": session_id,
                }),
            )
            .await;

        let snapshot = server.session(&session_id).await.unwrap();
        assert_eq!(snapshot.dtls_connects, 1);
        assert_eq!(snapshot.rejected_dtls_connects, 1);
        assert!(snapshot.transport_connected);
    }

    #[tokio::test]
    async fn test_second_transport_is_refused() {
        let server = server();
        let session_id = connected_session(&server).await;

        let err = call(&server, events::CREATE_TRANSPORT, json!({"sender": true, "sessionId": session_id}))
            .await
            .unwrap_err();
        assert!(err.contains("already has a transport"));
    }

    #[tokio::test]
    async fn test_one_producer_per_session() {
        let server = server();
        let session_id = connected_session(&server).await;
        let rtp = vp8_parameters(server.router_capabilities());
        let request = json!({"kind": "video", "rtpParameters": rtp, "sessionId": session_id});

        call(&server, events::TRANSPORT_PRODUCE, request.clone()).await.unwrap();
        let err = call(&server, events::TRANSPORT_PRODUCE, request).await.unwrap_err();
        assert!(err.contains("already has a producer"));
    }

    #[tokio::test]
    async fn test_stop_record_without_frames_fails() {
        let server = server();
        let session_id = connected_session(&server).await;
        let rtp = vp8_parameters(server.router_capabilities());
        call(
            &server,
            events::TRANSPORT_PRODUCE,
            json!({"kind": "video", "rtpParameters": rtp, "sessionId": session_id}),
        )
        .await
        .unwrap();

        server
            .handle_emit("client-1", events::START_RECORD, json!({"sessionId": session_id}))
            .await;
        let err = call(&server, events::STOP_RECORD, json!({"sessionId": session_id}))
            .await
            .unwrap_err();
        assert_eq!(err, "no frames captured");
    }

    #[tokio::test]
    async fn test_start_record_requires_producer() {
        let server = server();
        let session_id = connected_session(&server).await;

        server
            .handle_emit("client-1", events::START_RECORD, json!({"sessionId": session_id}))
            .await;

        assert_eq!(server.session(&session_id).await.unwrap().recording, "idle");
    }

    #[tokio::test]
    async fn test_sessions_are_bound_to_their_client() {
        let server = server();
        let session_id = connected_session(&server).await;

        let reply = server
            .handle_call(
                "client-2",
                events::CREATE_TRANSPORT,
                json!({"sender": true, "sessionId": session_id}),
            )
            .await;
        assert!(matches!(reply, Reply::Error(e) if e.contains("another client")));
    }

    #[tokio::test]
    async fn test_disconnect_moves_session_to_closed() {
        let server = server();
        let session_id = connected_session(&server).await;

        server.disconnect("client-1").await;

        assert!(server.active_sessions().await.is_empty());
        let closed = server.session(&session_id).await.unwrap();
        assert!(closed.closed_at.is_some());
    }

    #[tokio::test]
    async fn test_closed_history_drops_oldest() {
        let server = server().with_closed_history(2);

        let mut ids = Vec::new();
        for client in ["client-a", "client-b", "client-c"] {
            let pushes = server.connect(client).await.unwrap();
            ids.push(pushes[0].payload["sessionId"].as_str().unwrap().to_string());
            server.disconnect(client).await;
        }

        let closed: Vec<_> = server
            .closed_sessions()
            .await
            .into_iter()
            .map(|s| s.session_id)
            .collect();
        assert_eq!(closed, vec![ids[1].clone(), ids[2].clone()]);
        assert!(server.session(&ids[0]).await.is_none());
    }

    #[tokio::test]
    async fn test_produce_before_dtls_connect_is_refused() {
        let server = server();
        let pushes = server.connect("client-1").await.unwrap();
        let session_id = pushes[0].payload["sessionId"].as_str().unwrap().to_string();
        call(&server, events::CREATE_TRANSPORT, json!({"sender": true, "sessionId": session_id}))
            .await
            .unwrap();

        let rtp = vp8_parameters(server.router_capabilities());
        let err = call(
            &server,
            events::TRANSPORT_PRODUCE,
            json!({"kind": "video", "rtpParameters": rtp, "sessionId": session_id}),
        )
        .await
        .unwrap_err();

        assert_eq!(err, "transport is not connected");
        let snapshot = server.session(&session_id).await.unwrap();
        assert!(snapshot.producer_id.is_none());
    }
}
