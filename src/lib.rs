pub mod config;
pub mod engine;
pub mod error;
pub mod http;
pub mod media;
pub mod negotiation;
pub mod producer;
pub mod recording;
pub mod server;
pub mod session;
pub mod signaling;
pub mod transport;

pub use config::Config;
pub use engine::{MediaEngine, MediaSink, SimulatedEngine, SimulatedEngineConfig};
pub use error::{CallError, SignalError, SignalResult};
pub use http::{create_router, AppState};
pub use media::{MediaKind, MediaPlayer, MediaSourceConfig, MediaTrack};
pub use negotiation::{build_device, Device, RtpCapabilities};
pub use producer::{ProducerHandle, ProducerRegistrar};
pub use recording::{PersistedArtifact, RecordingArtifact, RecordingController};
pub use server::{NatsSignalServer, SessionSnapshot, SfuServer};
pub use session::{run_sessions, SessionConfig, SessionCoordinator, SessionReport, SessionState};
pub use signaling::{LoopbackChannel, NatsChannel, SignalChannel, SignalService};
pub use transport::{ConnectionState, SendTransport, TransportManager};
