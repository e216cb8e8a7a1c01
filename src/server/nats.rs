use anyhow::{Context, Result};
use async_nats::{Client, Message};
use futures::stream::StreamExt;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::SfuServer;
use crate::signaling::messages::{events, MediaFrameMessage, Reply};
use crate::signaling::nats::push_subject;
use crate::signaling::SignalService;

/// Serves [`SfuServer`] over NATS.
///
/// Listens on `{prefix}.c.>`; the second-to-last token is the client id and the
/// last one is the event. Messages carrying a reply subject are calls.
pub struct NatsSignalServer {
    client: Client,
    prefix: String,
    server: Arc<SfuServer>,
}

impl NatsSignalServer {
    pub async fn connect(url: &str, prefix: impl Into<String>, server: Arc<SfuServer>) -> Result<Self> {
        info!("Connecting signaling server to NATS at {}", url);

        let client = async_nats::connect(url)
            .await
            .context("Failed to connect to NATS")?;

        info!("Connected to NATS successfully");

        Ok(Self {
            client,
            prefix: prefix.into(),
            server,
        })
    }

    /// Handle client messages until the subscription ends
    pub async fn run(self) -> Result<()> {
        let subject = format!("{}.c.>", self.prefix);
        let mut subscriber = self
            .client
            .subscribe(subject.clone())
            .await
            .context("Failed to subscribe to client messages")?;

        info!("Subscribed to {}", subject);

        // One message at a time, in arrival order
        while let Some(msg) = subscriber.next().await {
            if let Err(e) = self.handle(msg).await {
                warn!("Failed to handle signaling message: {:#}", e);
            }
        }

        info!("Signaling subscription ended");
        Ok(())
    }

    async fn handle(&self, msg: Message) -> Result<()> {
        let subject: &str = &msg.subject;
        let Some((client_id, event)) = parse_subject(&self.prefix, subject) else {
            debug!("Ignoring message on {}", subject);
            return Ok(());
        };

        match event {
            events::HELLO => {
                let pushes = self
                    .server
                    .connect(client_id)
                    .await
                    .map_err(anyhow::Error::msg)?;
                for push in pushes {
                    let body = serde_json::to_vec(&push.payload)?;
                    self.client
                        .publish(push_subject(&self.prefix, client_id, &push.event), body.into())
                        .await
                        .context("Failed to push greeting")?;
                }
            }
            events::BYE => self.server.disconnect(client_id).await,
            events::MEDIA => {
                let frame: MediaFrameMessage = serde_json::from_slice(&msg.payload)?;
                self.server.handle_media(client_id, frame).await;
            }
            _ => match msg.reply {
                Some(reply_to) => {
                    let reply = answer_call(self.server.as_ref(), client_id, event, &msg.payload).await;
                    let body = serde_json::to_vec(&reply).or_else(|e| {
                        serde_json::to_vec(&Reply::error(format!("failed to encode reply: {}", e)))
                    })?;
                    self.client
                        .publish(reply_to, body.into())
                        .await
                        .context("Failed to publish reply")?;
                }
                None => {
                    let payload = decode_payload(&msg.payload)?;
                    self.server.handle_emit(client_id, event, payload).await;
                }
            },
        }

        Ok(())
    }
}

/// Run a call against the server. A body that is not JSON is answered with an error.
async fn answer_call<S: SignalService + ?Sized>(
    server: &S,
    client_id: &str,
    event: &str,
    body: &[u8],
) -> Reply {
    match decode_payload(body) {
        Ok(payload) => server.handle_call(client_id, event, payload).await,
        Err(e) => {
            warn!("Malformed '{}' call from client {}: {}", event, client_id, e);
            Reply::error(format!("malformed request: {}", e))
        }
    }
}

fn decode_payload(body: &[u8]) -> serde_json::Result<Value> {
    if body.is_empty() {
        Ok(Value::Null)
    } else {
        serde_json::from_slice(body)
    }
}

/// Split `{prefix}.c.{client_id}.{event}` into client id and event
pub fn parse_subject<'a>(prefix: &str, subject: &'a str) -> Option<(&'a str, &'a str)> {
    let rest = subject.strip_prefix(prefix)?.strip_prefix(".c.")?;
    let (client_id, event) = rest.split_once('.')?;
    if client_id.is_empty() || event.is_empty() {
        return None;
    }
    Some((client_id, event))
}
