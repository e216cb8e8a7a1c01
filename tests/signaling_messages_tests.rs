// Wire format tests for signaling messages
//
// Field names and shapes must match what socket-style SFU clients send.

use base64::Engine;
use serde_json::json;
use sfu_recorder::media::MediaKind;
use sfu_recorder::negotiation::{default_router_codecs, RtpCapabilities};
use sfu_recorder::producer::RtpParameters;
use sfu_recorder::recording::RecordingArtifact;
use sfu_recorder::signaling::messages::{
    ConnectTransportMessage, CreateTransportRequest, MediaFrameMessage, Reply,
    RouterCapabilitiesRequest, StopRecordResponse, TransportProduceRequest,
};
use sfu_recorder::signaling::nats::{client_subject, push_subject};
use sfu_recorder::transport::{DtlsRole, TransportParams};

#[test]
fn test_create_transport_request_serialization() {
    let msg = CreateTransportRequest {
        sender: true,
        session_id: "abc".to_string(),
    };

    let json = serde_json::to_value(&msg).unwrap();
    assert_eq!(json, json!({"sender": true, "sessionId": "abc"}));
}

#[test]
fn test_router_capabilities_request_without_session() {
    let json = serde_json::to_string(&RouterCapabilitiesRequest::default()).unwrap();
    assert_eq!(json, "{}");

    let msg: RouterCapabilitiesRequest = serde_json::from_str(r#"{"sessionId": "abc"}"#).unwrap();
    assert_eq!(msg.session_id.as_deref(), Some("abc"));
}

#[test]
fn test_connect_transport_deserialization() {
    let json = r#"{
        "dtlsParameters": {
            "role": "client",
            "fingerprints": [{"algorithm": "sha-256", "value": "AB:CD"}]
        },
        "sessionId": "abc"
    }"#;

    let msg: ConnectTransportMessage = serde_json::from_str(json).unwrap();
    assert_eq!(msg.session_id, "abc");
    assert_eq!(msg.dtls_parameters.role, DtlsRole::Client);
    assert_eq!(msg.dtls_parameters.fingerprints[0].algorithm, "sha-256");
}

#[test]
fn test_transport_params_deserialization() {
    let json = r#"{
        "id": "t1",
        "iceParameters": {"usernameFragment": "uf", "password": "pw", "iceLite": true},
        "iceCandidates": [{"ip": "127.0.0.1", "port": 40000, "protocol": "udp"}],
        "dtlsParameters": {"role": "auto", "fingerprints": [{"algorithm": "sha-256", "value": "00"}]}
    }"#;

    let params: TransportParams = serde_json::from_str(json).unwrap();
    assert_eq!(params.id, "t1");
    assert_eq!(params.ice_parameters.username_fragment, "uf");
    assert_eq!(params.ice_candidates.len(), 1);
    assert!(params.validate().is_ok());
}

#[test]
fn test_transport_params_without_fingerprints_are_invalid() {
    let json = r#"{
        "id": "t1",
        "iceParameters": {"usernameFragment": "uf", "password": "pw"},
        "iceCandidates": [],
        "dtlsParameters": {"fingerprints": []}
    }"#;

    let params: TransportParams = serde_json::from_str(json).unwrap();
    assert!(params.validate().is_err());
}

#[test]
fn test_transport_produce_request_shape() {
    let caps = RtpCapabilities {
        codecs: default_router_codecs(),
        header_extensions: vec![],
    };
    let rtp_parameters = RtpParameters::for_kind(&caps, MediaKind::Video, "0".to_string()).unwrap();
    let msg = TransportProduceRequest {
        kind: MediaKind::Video,
        rtp_parameters,
        session_id: "abc".to_string(),
    };

    let json = serde_json::to_value(&msg).unwrap();
    assert_eq!(json["kind"], "video");
    assert_eq!(json["sessionId"], "abc");
    assert_eq!(json["rtpParameters"]["codecs"][0]["mimeType"], "video/VP8");
    assert_eq!(json["rtpParameters"]["codecs"][0]["payloadType"], 101);
    assert!(json["rtpParameters"]["encodings"][0]["ssrc"].is_u64());
}

#[test]
fn test_reply_envelope() {
    let ok: Reply = serde_json::from_str(r#"{"ok": {"id": "p1"}}"#).unwrap();
    assert!(matches!(ok, Reply::Ok(v) if v["id"] == "p1"));

    let err: Reply = serde_json::from_str(r#"{"error": "no such session"}"#).unwrap();
    assert!(matches!(err, Reply::Error(m) if m == "no such session"));

    let json = serde_json::to_string(&Reply::error("boom")).unwrap();
    assert_eq!(json, r#"{"error":"boom"}"#);
}

#[test]
fn test_stop_record_response_decodes_images() {
    let b64 = base64::engine::general_purpose::STANDARD;
    let json = json!({
        "firstImage": b64.encode([0xFF, 0xD8, 0xFF, 1]),
        "lastImage": b64.encode([0xFF, 0xD8, 0xFF, 2]),
        "firstCapturedAt": "2025-10-27T14:30:00Z",
        "lastCapturedAt": "2025-10-27T14:30:05Z",
    });

    let response: StopRecordResponse = serde_json::from_value(json).unwrap();
    let artifact = RecordingArtifact::from_response(response).unwrap();
    assert_eq!(artifact.first_image, vec![0xFF, 0xD8, 0xFF, 1]);
    assert_eq!(artifact.last_image, vec![0xFF, 0xD8, 0xFF, 2]);
    assert!(artifact.first_captured_at < artifact.last_captured_at);
}

#[test]
fn test_stop_record_response_rejects_partial_or_reordered() {
    let b64 = base64::engine::general_purpose::STANDARD;

    let missing_last: StopRecordResponse =
        serde_json::from_value(json!({"firstImage": b64.encode([1u8])})).unwrap();
    assert!(RecordingArtifact::from_response(missing_last).is_err());

    let empty_first: StopRecordResponse =
        serde_json::from_value(json!({"firstImage": "", "lastImage": b64.encode([1u8])})).unwrap();
    assert!(RecordingArtifact::from_response(empty_first).is_err());

    let reordered: StopRecordResponse = serde_json::from_value(json!({
        "firstImage": b64.encode([1u8]),
        "lastImage": b64.encode([2u8]),
        "firstCapturedAt": "2025-10-27T14:30:05Z",
        "lastCapturedAt": "2025-10-27T14:30:00Z",
    }))
    .unwrap();
    assert!(RecordingArtifact::from_response(reordered).is_err());
}

#[test]
fn test_stop_record_response_with_one_timestamp() {
    let b64 = base64::engine::general_purpose::STANDARD;
    let last_at: chrono::DateTime<chrono::Utc> = "2025-10-27T14:30:00Z".parse().unwrap();
    let first_at: chrono::DateTime<chrono::Utc> = "2025-10-27T14:29:55Z".parse().unwrap();

    let only_last: StopRecordResponse = serde_json::from_value(json!({
        "firstImage": b64.encode([1u8]),
        "lastImage": b64.encode([2u8]),
        "lastCapturedAt": "2025-10-27T14:30:00Z",
    }))
    .unwrap();
    let artifact = RecordingArtifact::from_response(only_last).unwrap();
    assert_eq!(artifact.last_captured_at, last_at);
    assert!(artifact.first_captured_at <= artifact.last_captured_at);

    let only_first: StopRecordResponse = serde_json::from_value(json!({
        "firstImage": b64.encode([1u8]),
        "lastImage": b64.encode([2u8]),
        "firstCapturedAt": "2025-10-27T14:29:55Z",
    }))
    .unwrap();
    let artifact = RecordingArtifact::from_response(only_first).unwrap();
    assert_eq!(artifact.first_captured_at, first_at);
    assert!(artifact.first_captured_at <= artifact.last_captured_at);
}

#[test]
fn test_media_frame_encoding_roundtrip() {
    let original = vec![0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10];

    let msg = MediaFrameMessage {
        producer_id: "p1".to_string(),
        sequence: 3,
        timestamp_ms: 120,
        data: base64::engine::general_purpose::STANDARD.encode(&original),
    };

    let json = serde_json::to_string(&msg).unwrap();
    assert!(json.contains("\"producerId\":\"p1\""));
    assert!(json.contains("\"timestampMs\":120"));

    let deserialized: MediaFrameMessage = serde_json::from_str(&json).unwrap();
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(&deserialized.data)
        .unwrap();
    assert_eq!(decoded, original);
}

#[test]
fn test_nats_subjects() {
    assert_eq!(client_subject("sfu", "c1", "createTransport"), "sfu.c.c1.createTransport");
    assert_eq!(push_subject("sfu", "c1", "connection-success"), "sfu.s.c1.connection-success");
}
