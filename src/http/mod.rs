//! HTTP API for inspecting the SFU session registry
//!
//! - GET /health - Health check
//! - GET /sessions - Active and closed sessions
//! - GET /sessions/:id - One session

mod handlers;
mod routes;
mod state;

pub use handlers::{ErrorResponse, SessionListResponse};
pub use routes::create_router;
pub use state::AppState;
