use async_nats::Client;
use async_trait::async_trait;
use futures::stream::StreamExt;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::messages::{events, Hello, MediaFrameMessage, Reply};
use super::{EventHandler, HandlerRegistry, SignalChannel};
use crate::config::SignalingConfig;
use crate::engine::MediaSink;
use crate::error::{CallError, SignalError, SignalResult};

/// Subject a client publishes `event` on
pub fn client_subject(prefix: &str, client_id: &str, event: &str) -> String {
    format!("{}.c.{}.{}", prefix, client_id, event)
}

/// Subject the server pushes `event` to a client on
pub fn push_subject(prefix: &str, client_id: &str, event: &str) -> String {
    format!("{}.s.{}.{}", prefix, client_id, event)
}

/// Signaling channel over NATS.
///
/// Calls use NATS request/reply, so the reply inbox is the correlation id.
pub struct NatsChannel {
    client: Client,
    prefix: String,
    client_id: String,
    call_timeout: Duration,
    handlers: Arc<HandlerRegistry>,
    push_task: JoinHandle<()>,
}

impl NatsChannel {
    /// Connect to NATS and announce this client to the SFU
    pub async fn connect(config: &SignalingConfig) -> SignalResult<Self> {
        info!("Connecting to NATS at {}", config.nats_url);

        let client = async_nats::connect(config.nats_url.as_str())
            .await
            .map_err(|e| SignalError::Connect(format!("{}: {}", config.nats_url, e)))?;

        let prefix = config.subject_prefix.clone();
        let client_id = uuid::Uuid::new_v4().to_string();

        // Subscribe before saying hello so the greeting cannot be missed
        let mut subscriber = client
            .subscribe(push_subject(&prefix, &client_id, ">"))
            .await
            .map_err(|e| SignalError::Connect(format!("failed to subscribe to pushes: {}", e)))?;

        let handlers = Arc::new(HandlerRegistry::default());
        let registry = Arc::clone(&handlers);
        let push_prefix = push_subject(&prefix, &client_id, "");

        let push_task = tokio::spawn(async move {
            while let Some(msg) = subscriber.next().await {
                let subject: &str = &msg.subject;
                let Some(event) = subject.strip_prefix(&push_prefix) else {
                    continue;
                };
                match serde_json::from_slice::<Value>(&msg.payload) {
                    Ok(payload) => registry.dispatch(event, payload),
                    Err(e) => warn!("Failed to parse pushed '{}' message: {}", event, e),
                }
            }
            debug!("Push subscription ended");
        });

        let channel = Self {
            client,
            prefix,
            client_id,
            call_timeout: config.call_timeout(),
            handlers,
            push_task,
        };

        let hello = Hello {
            client_id: channel.client_id.clone(),
        };
        channel.publish(events::HELLO, &hello).await.map_err(|e| match e {
            SignalError::Channel(msg) => SignalError::Connect(msg),
            other => other,
        })?;

        info!("Connected to NATS as client {}", channel.client_id);

        Ok(channel)
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    async fn publish<T: serde::Serialize + ?Sized>(&self, event: &str, payload: &T) -> SignalResult<()> {
        let body = serde_json::to_vec(payload)
            .map_err(|e| SignalError::Channel(format!("failed to encode '{}': {}", event, e)))?;
        let subject = client_subject(&self.prefix, &self.client_id, event);

        self.client
            .publish(subject, body.into())
            .await
            .map_err(|e| SignalError::Channel(format!("failed to publish '{}': {}", event, e)))
    }
}

#[async_trait]
impl SignalChannel for NatsChannel {
    async fn emit(&self, event: &str, payload: Value) -> SignalResult<()> {
        debug!("emit {} -> {}", event, self.client_id);
        self.publish(event, &payload).await
    }

    async fn call(&self, event: &str, payload: Value) -> Result<Value, CallError> {
        let body = serde_json::to_vec(&payload).map_err(|e| CallError::Unreachable {
            event: event.to_string(),
            message: format!("failed to encode request: {}", e),
        })?;
        let subject = client_subject(&self.prefix, &self.client_id, event);

        let response = tokio::time::timeout(self.call_timeout, self.client.request(subject, body.into()))
            .await
            .map_err(|_| CallError::Timeout {
                event: event.to_string(),
                after: self.call_timeout,
            })?
            .map_err(|e| CallError::Unreachable {
                event: event.to_string(),
                message: e.to_string(),
            })?;

        match serde_json::from_slice::<Reply>(&response.payload) {
            Ok(Reply::Ok(value)) => Ok(value),
            Ok(Reply::Error(message)) => Err(CallError::Server {
                event: event.to_string(),
                message,
            }),
            Err(e) => Err(CallError::invalid_response(event, e.to_string())),
        }
    }

    async fn on(&self, event: &str, handler: EventHandler) {
        self.handlers.register(event, handler);
    }

    async fn close(&self) -> SignalResult<()> {
        info!("Closing NATS connection for client {}", self.client_id);
        let bye = Hello {
            client_id: self.client_id.clone(),
        };
        self.publish(events::BYE, &bye).await?;
        self.client
            .flush()
            .await
            .map_err(|e| SignalError::Channel(format!("failed to flush: {}", e)))?;
        self.push_task.abort();
        self.handlers.clear();
        Ok(())
    }

    fn name(&self) -> &str {
        "nats"
    }
}

#[async_trait]
impl MediaSink for NatsChannel {
    async fn send_frame(&self, frame: MediaFrameMessage) -> SignalResult<()> {
        self.publish(events::MEDIA, &frame).await
    }
}

impl Drop for NatsChannel {
    fn drop(&mut self) {
        self.push_task.abort();
    }
}
