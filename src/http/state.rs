use crate::server::SfuServer;
use std::sync::Arc;

/// Shared application state for HTTP handlers
#[derive(Clone)]
pub struct AppState {
    /// Session registry served over signaling
    pub server: Arc<SfuServer>,
}

impl AppState {
    pub fn new(server: Arc<SfuServer>) -> Self {
        Self { server }
    }
}
