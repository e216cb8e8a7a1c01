use anyhow::Result;
use sfu_recorder::media::MediaKind;
use sfu_recorder::server::DEFAULT_CLOSED_HISTORY;
use sfu_recorder::session::SessionConfig;
use sfu_recorder::Config;
use std::fs;
use std::time::Duration;
use tempfile::TempDir;

#[test]
fn test_load_full_config() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let path = temp_dir.path().join("sfu.toml");
    fs::write(
        &path,
        r#"
[service]
name = "sfu-recorder"
closed_history = 10

[service.http]
bind = "0.0.0.0"
port = 8080

[signaling]
nats_url = "nats://nats:4222"
subject_prefix = "media"
call_timeout_ms = 1500
greeting_timeout_ms = 2000
connect_timeout_ms = 3000

[media]
path = "clips/intro.webm"
kind = "audio"
frame_interval_ms = 20
chunk_size = 4096

[output]
dir = "/tmp/recordings"
"#,
    )?;

    let cfg = Config::load(path.to_str().unwrap())?;
    assert_eq!(cfg.service.http.port, 8080);
    assert_eq!(cfg.service.closed_history, 10);
    assert_eq!(cfg.signaling.subject_prefix, "media");
    assert_eq!(cfg.signaling.call_timeout(), Duration::from_millis(1500));
    assert_eq!(cfg.signaling.greeting_timeout(), Duration::from_secs(2));
    assert_eq!(cfg.signaling.connect_timeout(), Duration::from_secs(3));
    assert_eq!(cfg.media.kind, MediaKind::Audio);
    assert_eq!(cfg.media.chunk_size, 4096);
    assert_eq!(cfg.output.dir, "/tmp/recordings");

    let session = SessionConfig::from_signaling("session-1", &cfg.signaling, "/tmp/recordings".into());
    assert_eq!(session.label, "session-1");
    assert_eq!(session.greeting_timeout, Duration::from_secs(2));
    assert_eq!(session.connect_timeout, Duration::from_secs(3));

    // Router codecs fall back to the built-in set
    assert!(cfg.router.codecs.iter().any(|c| c.mime_type == "video/VP8"));

    Ok(())
}

#[test]
fn test_optional_sections_use_defaults() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let path = temp_dir.path().join("minimal.toml");
    fs::write(
        &path,
        r#"
[service]
name = "minimal"

[service.http]
bind = "127.0.0.1"
port = 3030

[signaling]
nats_url = "nats://example:4222"
"#,
    )?;

    let cfg = Config::load(path.to_str().unwrap())?;
    assert_eq!(cfg.signaling.nats_url, "nats://example:4222");
    assert_eq!(cfg.service.closed_history, DEFAULT_CLOSED_HISTORY);
    assert_eq!(cfg.signaling.subject_prefix, "sfu");
    assert_eq!(cfg.signaling.call_timeout(), Duration::from_secs(5));
    assert_eq!(cfg.media.kind, MediaKind::Video);

    Ok(())
}

#[test]
fn test_missing_config_file_fails() {
    assert!(Config::load("/nonexistent/sfu-recorder").is_err());
}
