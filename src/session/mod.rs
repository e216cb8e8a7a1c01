//! Session signaling coordinator
//!
//! This module provides the `SessionCoordinator` that drives one client
//! session against the SFU, strictly in order:
//! - greeting and capability exchange
//! - send transport creation and DTLS connection
//! - producer registration
//! - recording start, end-of-track wait, recording stop
//! - artifact persistence and channel shutdown

mod config;
mod session;
mod stats;

pub use config::SessionConfig;
pub use session::{run_sessions, SessionCoordinator};
pub use stats::{PhaseTiming, SessionReport, SessionState};
