use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::messages::{MediaFrameMessage, PushMessage, Reply};
use super::{EventHandler, HandlerRegistry, SignalChannel};
use crate::engine::MediaSink;
use crate::error::{CallError, SignalError, SignalResult};

/// The server side of a signaling connection
#[async_trait]
pub trait SignalService: Send + Sync {
    /// A client connected. Returns the messages to push to it.
    async fn connect(&self, client_id: &str) -> Result<Vec<PushMessage>, String>;

    async fn handle_emit(&self, client_id: &str, event: &str, payload: Value);

    async fn handle_call(&self, client_id: &str, event: &str, payload: Value) -> Reply;

    async fn handle_media(&self, _client_id: &str, _frame: MediaFrameMessage) {}

    async fn disconnect(&self, client_id: &str);
}

/// In-process channel bound directly to a [`SignalService`]
pub struct LoopbackChannel {
    service: Arc<dyn SignalService>,
    client_id: String,
    call_timeout: Duration,
    handlers: HandlerRegistry,
    closed: AtomicBool,
}

impl LoopbackChannel {
    pub async fn connect(service: Arc<dyn SignalService>, call_timeout: Duration) -> SignalResult<Self> {
        let client_id = uuid::Uuid::new_v4().to_string();
        debug!("Loopback client {} connecting", client_id);

        let pushes = service
            .connect(&client_id)
            .await
            .map_err(SignalError::Connect)?;

        let channel = Self {
            service,
            client_id,
            call_timeout,
            handlers: HandlerRegistry::default(),
            closed: AtomicBool::new(false),
        };

        for push in pushes {
            channel.handlers.dispatch(&push.event, push.payload);
        }

        info!("Loopback client {} connected", channel.client_id);
        Ok(channel)
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SignalChannel for LoopbackChannel {
    async fn emit(&self, event: &str, payload: Value) -> SignalResult<()> {
        if self.is_closed() {
            return Err(SignalError::Channel(format!("cannot emit '{}': channel closed", event)));
        }
        self.service.handle_emit(&self.client_id, event, payload).await;
        Ok(())
    }

    async fn call(&self, event: &str, payload: Value) -> Result<Value, CallError> {
        if self.is_closed() {
            return Err(CallError::Disconnected {
                event: event.to_string(),
            });
        }

        let reply = tokio::time::timeout(
            self.call_timeout,
            self.service.handle_call(&self.client_id, event, payload),
        )
        .await
        .map_err(|_| CallError::Timeout {
            event: event.to_string(),
            after: self.call_timeout,
        })?;

        match reply {
            Reply::Ok(value) => Ok(value),
            Reply::Error(message) => Err(CallError::Server {
                event: event.to_string(),
                message,
            }),
        }
    }

    async fn on(&self, event: &str, handler: EventHandler) {
        self.handlers.register(event, handler);
    }

    async fn close(&self) -> SignalResult<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            info!("Closing loopback client {}", self.client_id);
            self.service.disconnect(&self.client_id).await;
            self.handlers.clear();
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "loopback"
    }
}

#[async_trait]
impl MediaSink for LoopbackChannel {
    async fn send_frame(&self, frame: MediaFrameMessage) -> SignalResult<()> {
        if self.is_closed() {
            return Err(SignalError::Channel("cannot send media: channel closed".to_string()));
        }
        self.service.handle_media(&self.client_id, frame).await;
        Ok(())
    }
}
