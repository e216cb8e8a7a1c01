//! Signaling transport channel
//!
//! A bidirectional event channel between one client session and the SFU:
//! - `emit`: fire-and-forget, no delivery acknowledgment
//! - `call`: request/response, bounded by a timeout
//! - `on`: handlers for messages the server pushes unprompted

pub mod loopback;
pub mod messages;
pub mod nats;

pub use loopback::{LoopbackChannel, SignalService};
pub use nats::NatsChannel;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

use crate::error::{CallError, SignalError, SignalResult};

/// Handler for pushed messages of one event
pub type EventHandler = Arc<dyn Fn(Value) + Send + Sync>;

/// Bidirectional signaling channel, one per session
#[async_trait]
pub trait SignalChannel: Send + Sync {
    /// Send an event without waiting for any acknowledgment
    async fn emit(&self, event: &str, payload: Value) -> SignalResult<()>;

    /// Send a request and wait for its correlated response
    async fn call(&self, event: &str, payload: Value) -> Result<Value, CallError>;

    /// Register a handler for pushed messages of `event`.
    ///
    /// Messages that arrived before the first handler for their event was
    /// registered are replayed to it, in arrival order.
    async fn on(&self, event: &str, handler: EventHandler);

    /// Release the connection
    async fn close(&self) -> SignalResult<()>;

    /// Channel name for logging
    fn name(&self) -> &str;
}

/// `call` with typed request and response bodies
pub async fn call_typed<Req, Resp>(
    channel: &dyn SignalChannel,
    event: &str,
    request: &Req,
) -> Result<Resp, CallError>
where
    Req: Serialize + ?Sized,
    Resp: DeserializeOwned,
{
    let payload = serde_json::to_value(request).map_err(|e| CallError::Unreachable {
        event: event.to_string(),
        message: format!("failed to encode request: {}", e),
    })?;

    let response = channel.call(event, payload).await?;

    serde_json::from_value(response).map_err(|e| CallError::invalid_response(event, e.to_string()))
}

/// `emit` with a typed body
pub async fn emit_typed<Req>(channel: &dyn SignalChannel, event: &str, payload: &Req) -> SignalResult<()>
where
    Req: Serialize + ?Sized,
{
    let payload = serde_json::to_value(payload)
        .map_err(|e| SignalError::Channel(format!("failed to encode '{}': {}", event, e)))?;
    channel.emit(event, payload).await
}

/// Unhandled pushes kept per event; older ones are dropped first
pub(crate) const PENDING_PER_EVENT: usize = 32;

/// Pushed-message dispatch shared by the channel implementations.
///
/// Dispatch and registration hold the same lock, so a handler sees its
/// backlog before any newer message. Handlers must not register handlers.
#[derive(Default)]
pub(crate) struct HandlerRegistry {
    inner: Mutex<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
    handlers: HashMap<String, Vec<EventHandler>>,
    pending: HashMap<String, VecDeque<Value>>,
}

impl HandlerRegistry {
    pub(crate) fn register(&self, event: &str, handler: EventHandler) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(backlog) = inner.pending.remove(event) {
            for payload in backlog {
                handler(payload);
            }
        }
        inner
            .handlers
            .entry(event.to_string())
            .or_default()
            .push(handler);
    }

    pub(crate) fn dispatch(&self, event: &str, payload: Value) {
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let inner = &mut *guard;
        match inner.handlers.get(event) {
            Some(handlers) => {
                for handler in handlers {
                    handler(payload.clone());
                }
            }
            None => {
                let backlog = inner.pending.entry(event.to_string()).or_default();
                if backlog.len() >= PENDING_PER_EVENT {
                    backlog.pop_front();
                    debug!("No handler for '{}', dropping oldest buffered push", event);
                }
                backlog.push_back(payload);
            }
        }
    }

    /// Drop handlers and anything still buffered
    pub(crate) fn clear(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.handlers.clear();
        inner.pending.clear();
    }
}
