use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use sfu_recorder::config::Config;
use sfu_recorder::engine::{MediaSink, SimulatedEngine, SimulatedEngineConfig};
use sfu_recorder::media::{MediaKind, MediaPlayer};
use sfu_recorder::negotiation::RtpCapabilities;
use sfu_recorder::server::{NatsSignalServer, SfuServer};
use sfu_recorder::session::{run_sessions, SessionConfig, SessionCoordinator};
use sfu_recorder::signaling::{LoopbackChannel, NatsChannel, SignalChannel};
use sfu_recorder::{create_router, AppState};
use std::future::IntoFuture;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "sfu-recorder")]
#[command(about = "Record first and last frames of media streamed to an SFU")]
struct Cli {
    /// Config file (extension optional)
    #[arg(short, long, default_value = "config/sfu-recorder")]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the SFU signaling server over NATS plus the HTTP API
    Serve,

    /// Stream a recorded source through one or more sessions
    Record {
        /// Number of concurrent sessions
        #[arg(short, long, default_value = "2")]
        sessions: usize,

        /// Run the SFU in this process instead of reaching it over NATS
        #[arg(long)]
        in_process: bool,

        /// Media source (file or directory of frames), overrides the config
        #[arg(long)]
        source: Option<PathBuf>,

        /// Media kind of the source, overrides the config
        #[arg(long)]
        kind: Option<MediaKind>,

        /// Output directory, overrides the config
        #[arg(short, long)]
        output_dir: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let cfg = Config::load(&cli.config).with_context(|| format!("Failed to load config {}", cli.config))?;

    info!("{} v{}", cfg.service.name, env!("CARGO_PKG_VERSION"));

    match cli.command {
        Command::Serve => serve(cfg).await,
        Command::Record {
            sessions,
            in_process,
            source,
            kind,
            output_dir,
        } => record(cfg, sessions, in_process, source, kind, output_dir).await,
    }
}

fn router_server(cfg: &Config) -> Arc<SfuServer> {
    Arc::new(
        SfuServer::new(RtpCapabilities {
            codecs: cfg.router.codecs.clone(),
            header_extensions: vec![],
        })
        .with_closed_history(cfg.service.closed_history),
    )
}

async fn serve(cfg: Config) -> Result<()> {
    let server = router_server(&cfg);

    let signaling = NatsSignalServer::connect(
        &cfg.signaling.nats_url,
        cfg.signaling.subject_prefix.clone(),
        Arc::clone(&server),
    )
    .await?;

    let addr = format!("{}:{}", cfg.service.http.bind, cfg.service.http.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("HTTP API listening on {}", addr);

    let app = create_router(AppState::new(server));

    tokio::select! {
        result = signaling.run() => result?,
        result = axum::serve(listener, app).into_future() => result.context("HTTP server failed")?,
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }

    Ok(())
}

async fn record(
    mut cfg: Config,
    sessions: usize,
    in_process: bool,
    source: Option<PathBuf>,
    kind: Option<MediaKind>,
    output_dir: Option<String>,
) -> Result<()> {
    if sessions == 0 {
        bail!("--sessions must be at least 1");
    }
    if let Some(source) = source {
        cfg.media.path = source;
    }
    if let Some(kind) = kind {
        cfg.media.kind = kind;
    }

    // Expand home directory
    let output_dir = output_dir.unwrap_or_else(|| cfg.output.dir.clone());
    let output_dir = PathBuf::from(shellexpand::tilde(&output_dir).as_ref());
    info!("Output directory: {}", output_dir.display());

    let player = MediaPlayer::open(cfg.media.clone())?;
    info!("Loaded {} {} frames", player.frame_count(), player.kind());

    let server = in_process.then(|| router_server(&cfg));

    let mut coordinators = Vec::with_capacity(sessions);
    for i in 0..sessions {
        // The channel doubles as the media sink for the session's producers
        let (channel, sink): (Arc<dyn SignalChannel>, Arc<dyn MediaSink>) = match &server {
            Some(server) => {
                let channel = Arc::new(
                    LoopbackChannel::connect(server.clone(), cfg.signaling.call_timeout()).await?,
                );
                (channel.clone() as Arc<dyn SignalChannel>, channel as Arc<dyn MediaSink>)
            }
            None => {
                let channel = Arc::new(NatsChannel::connect(&cfg.signaling).await?);
                (channel.clone() as Arc<dyn SignalChannel>, channel as Arc<dyn MediaSink>)
            }
        };

        let engine = Arc::new(SimulatedEngine::new(SimulatedEngineConfig::default(), sink));
        let config =
            SessionConfig::from_signaling(format!("session-{}", i + 1), &cfg.signaling, output_dir.clone());

        coordinators.push(SessionCoordinator::new(config, channel, engine, vec![player.track()]));
    }

    let results = run_sessions(coordinators).await;

    let mut failed = 0;
    for result in results {
        match result {
            Ok(report) => {
                info!(
                    "Session {} saved {} and {}",
                    report.session_id,
                    report.artifact.first_image.display(),
                    report.artifact.last_image.display()
                );
                println!("{}", serde_json::to_string_pretty(&report)?);
            }
            Err(e) => {
                error!("Session failed: {}", e);
                failed += 1;
            }
        }
    }

    if failed > 0 {
        bail!("{} of {} sessions failed", failed, sessions);
    }

    Ok(())
}
