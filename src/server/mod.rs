//! In-process SFU signaling server
//!
//! Tracks sessions, their send transport, producer and recording. Served
//! either directly through a loopback channel or over NATS.

mod nats;
mod registry;

pub use nats::{parse_subject, NatsSignalServer};
pub use registry::{SessionSnapshot, SfuServer, DEFAULT_CLOSED_HISTORY};
