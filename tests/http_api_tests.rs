// Integration tests for the session status HTTP API

use anyhow::Result;
use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use sfu_recorder::engine::{SimulatedEngine, SimulatedEngineConfig};
use sfu_recorder::http::{ErrorResponse, SessionListResponse};
use sfu_recorder::media::{MediaKind, MediaTrack};
use sfu_recorder::negotiation::{default_router_codecs, RtpCapabilities};
use sfu_recorder::server::{SessionSnapshot, SfuServer};
use sfu_recorder::session::{SessionConfig, SessionCoordinator};
use sfu_recorder::signaling::LoopbackChannel;
use sfu_recorder::{create_router, AppState};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tower::ServiceExt;

fn server() -> Arc<SfuServer> {
    Arc::new(SfuServer::new(RtpCapabilities {
        codecs: default_router_codecs(),
        header_extensions: vec![],
    }))
}

async fn get(server: Arc<SfuServer>, uri: &str) -> Result<(StatusCode, Vec<u8>)> {
    let app = create_router(AppState::new(server));
    let response = app
        .oneshot(Request::builder().uri(uri).body(Body::empty())?)
        .await?;
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX).await?;
    Ok((status, body.to_vec()))
}

#[tokio::test]
async fn test_health_check() -> Result<()> {
    let (status, body) = get(server(), "/health").await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"OK");
    Ok(())
}

#[tokio::test]
async fn test_unknown_session_is_not_found() -> Result<()> {
    let (status, body) = get(server(), "/sessions/missing").await?;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let error: ErrorResponse = serde_json::from_slice(&body)?;
    assert!(error.error.contains("missing"));
    Ok(())
}

#[tokio::test]
async fn test_connected_client_is_listed() -> Result<()> {
    let server = server();
    let _channel = LoopbackChannel::connect(server.clone(), Duration::from_secs(1)).await?;

    let (status, body) = get(server.clone(), "/sessions").await?;
    assert_eq!(status, StatusCode::OK);

    let list: SessionListResponse = serde_json::from_slice(&body)?;
    assert_eq!(list.active.len(), 1);
    assert!(list.closed.is_empty());
    assert_eq!(list.active[0].recording, "idle");
    assert!(list.active[0].transport_id.is_none());

    Ok(())
}

#[tokio::test]
async fn test_finished_session_reports_recording_stats() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let server = server();

    let channel = Arc::new(LoopbackChannel::connect(server.clone(), Duration::from_secs(1)).await?);
    let engine = Arc::new(SimulatedEngine::new(SimulatedEngineConfig::default(), channel.clone()));
    let track = MediaTrack::from_frames(MediaKind::Video, vec![vec![0xFF, 0xD8, 0xFF, 1], vec![0xFF, 0xD8, 0xFF, 2]]);
    let config = SessionConfig {
        output_dir: temp_dir.path().to_path_buf(),
        ..Default::default()
    };
    let report = SessionCoordinator::new(config, channel, engine, vec![track]).run().await?;

    let (status, body) = get(server, &format!("/sessions/{}", report.session_id)).await?;
    assert_eq!(status, StatusCode::OK);

    let snapshot: SessionSnapshot = serde_json::from_slice(&body)?;
    assert_eq!(snapshot.session_id, report.session_id);
    assert!(snapshot.closed_at.is_some());
    assert!(snapshot.transport_connected);
    assert_eq!(snapshot.producer_kind, Some(MediaKind::Video));
    assert_eq!(snapshot.producer_id.as_deref(), report.producer_ids.first().map(String::as_str));
    assert_eq!(snapshot.recording, "stopped");
    assert_eq!(snapshot.frames_received, 2);
    assert_eq!(snapshot.dtls_connects, 1);

    Ok(())
}
