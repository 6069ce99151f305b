//! Redis pub/sub subscriber feeding the broadcast relay.
//!
//! The subscriber pattern-subscribes to the configured patterns and hands
//! every message to [`BroadcastRelay::dispatch`] in arrival order. When the
//! connection drops it waits and subscribes again; messages published in
//! the gap are lost.

use crate::config::RedisConfig;
use crate::metrics;
use anyhow::{Context, Result};
use futures_util::{Stream, StreamExt};
use herald_core::BroadcastRelay;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Relay every `(pub/sub channel, payload)` pair from `messages`.
///
/// Malformed payloads are logged and skipped. Returns once the stream ends,
/// with the number of messages that were delivered.
pub async fn pump<S>(relay: &BroadcastRelay, mut messages: S) -> usize
where
    S: Stream<Item = (String, String)> + Unpin,
{
    let mut delivered = 0;
    while let Some((origin, payload)) = messages.next().await {
        match relay.dispatch(&origin, &payload) {
            Ok(delivery) => {
                debug!(
                    channel = %delivery.channel,
                    event = %delivery.event,
                    recipients = delivery.recipients,
                    "Broadcast"
                );
                metrics::record_relay(&delivery);
                delivered += 1;
            }
            Err(e) => {
                warn!(error = %e, "Dropping relay message");
                metrics::record_relay_malformed();
            }
        }
    }
    delivered
}

/// Long-running Redis subscription.
pub struct RedisSubscriber {
    config: RedisConfig,
    relay: Arc<BroadcastRelay>,
}

impl RedisSubscriber {
    #[must_use]
    pub fn new(config: RedisConfig, relay: Arc<BroadcastRelay>) -> Self {
        Self { config, relay }
    }

    /// Subscribe and relay forever, resubscribing after failures.
    pub async fn run(self) {
        let delay = Duration::from_millis(self.config.reconnect_delay_ms);
        loop {
            match self.subscribe_once().await {
                Ok(delivered) => {
                    warn!(delivered, "Redis subscription ended");
                }
                Err(e) => {
                    error!(error = %e, "Redis subscription failed");
                    metrics::record_error("redis");
                }
            }
            tokio::time::sleep(delay).await;
            info!(url = %self.config.url, "Resubscribing to Redis");
        }
    }

    async fn subscribe_once(&self) -> Result<usize> {
        let client = redis::Client::open(self.config.url.as_str())
            .with_context(|| format!("Invalid Redis URL {}", self.config.url))?;
        let mut pubsub = client
            .get_async_pubsub()
            .await
            .with_context(|| format!("Failed to connect to Redis at {}", self.config.url))?;

        for pattern in &self.config.patterns {
            pubsub
                .psubscribe(pattern)
                .await
                .with_context(|| format!("Failed to subscribe to {pattern}"))?;
        }
        info!(url = %self.config.url, patterns = ?self.config.patterns, "Subscribed to Redis");

        let messages = pubsub.on_message().filter_map(|msg| async move {
            let origin = msg.get_channel_name().to_string();
            match msg.get_payload::<String>() {
                Ok(payload) => Some((origin, payload)),
                Err(e) => {
                    warn!(channel = %origin, error = %e, "Dropping non-text pub/sub payload");
                    metrics::record_relay_malformed();
                    None
                }
            }
        });

        Ok(pump(&self.relay, Box::pin(messages)).await)
    }
}
