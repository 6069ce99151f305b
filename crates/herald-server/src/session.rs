//! Per-connection handling of inbound frames.
//!
//! Membership changes for one channel are applied in arrival order, each in
//! a task chained after the previous change for that channel. The read loop
//! never waits on authorization, and channels never wait on each other.

use crate::handlers::AppState;
use crate::metrics;
use dashmap::DashMap;
use herald_core::{ChannelId, ConnectionInfo, Rooms};
use herald_protocol::{ClientFrame, ServerFrame, SubscribeRequest};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Inbound frame handling for one connection.
pub struct Session {
    connection: ConnectionInfo,
    state: Arc<AppState>,
    /// Last queued membership change per channel.
    queues: HashMap<ChannelId, JoinHandle<()>>,
    /// Subscribe requests accepted but not yet finished, per channel.
    pending: Arc<DashMap<ChannelId, usize>>,
}

impl Session {
    #[must_use]
    pub fn new(connection: ConnectionInfo, state: Arc<AppState>) -> Self {
        Self {
            connection,
            state,
            queues: HashMap::new(),
            pending: Arc::new(DashMap::new()),
        }
    }

    /// Handle a decoded frame. Never waits on the application server.
    pub fn handle_frame(&mut self, frame: ClientFrame) {
        let id = &self.connection.id;
        match frame {
            ClientFrame::Subscribe(request) => {
                debug!(connection = %id, channel = %request.channel, "Subscribe request");
                self.subscribe(request);
            }

            ClientFrame::Unsubscribe(request) => {
                debug!(connection = %id, channel = %request.channel, "Unsubscribe request");
                self.unsubscribe(request.channel);
            }

            ClientFrame::ClientEvent(event) => {
                let forwarded = self.state.engine.client_event(id, event);
                metrics::record_client_event(forwarded);
            }

            ClientFrame::Ping => {
                self.state.registry.emit_to(id, Arc::new(ServerFrame::pong()));
            }
        }
    }

    fn subscribe(&mut self, request: SubscribeRequest) {
        let limit = self.state.config.limits.max_subscriptions_per_connection;
        if !self.within_limit(&request.channel, limit) {
            let id = &self.connection.id;
            warn!(connection = %id, channel = %request.channel, limit, "Subscription limit reached");
            self.state.registry.emit_to(
                id,
                Arc::new(ServerFrame::subscription_error(
                    request.channel.as_str(),
                    "Subscription limit reached",
                )),
            );
            metrics::record_join_failure("limit");
            return;
        }

        let slot = PendingSlot::take(&self.pending, &request.channel);
        let engine = Arc::clone(&self.state.engine);
        let connection = self.connection.clone();
        let channel = request.channel.clone();
        let started = Instant::now();
        self.enqueue(&channel, async move {
            let result = engine.subscribe(&connection, request).await;
            metrics::record_join(&result, started.elapsed());
            drop(slot);
        });
    }

    fn unsubscribe(&mut self, channel: ChannelId) {
        let engine = Arc::clone(&self.state.engine);
        let id = self.connection.id.clone();
        let target = channel.clone();
        self.enqueue(&channel, async move {
            engine.leave(&id, &target, "unsubscribed").await;
        });
    }

    /// Whether subscribing to `channel` keeps the connection within `limit`.
    ///
    /// Joined channels and accepted-but-unfinished subscribes both count.
    /// A channel already in either set never counts twice.
    fn within_limit(&self, channel: &str, limit: usize) -> bool {
        let id = &self.connection.id;
        if self.pending.contains_key(channel) || self.state.registry.is_member(channel, id) {
            return true;
        }
        let mut channels: HashSet<ChannelId> = self
            .state
            .registry
            .connection_channels(id)
            .into_iter()
            .collect();
        channels.extend(self.pending.iter().map(|entry| entry.key().clone()));
        channels.len() < limit
    }

    /// Run `change` after every change queued earlier for `channel`.
    fn enqueue<F>(&mut self, channel: &str, change: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.queues.retain(|_, task| !task.is_finished());

        let previous = self.queues.remove(channel);
        let id = self.connection.id.clone();
        let task = tokio::spawn(async move {
            if let Some(previous) = previous {
                if let Err(e) = previous.await {
                    warn!(connection = %id, error = %e, "Previous membership change failed");
                }
            }
            change.await;
        });
        self.queues.insert(channel.to_string(), task);
    }
}

/// One accepted subscribe, released when its join finishes.
struct PendingSlot {
    pending: Arc<DashMap<ChannelId, usize>>,
    channel: ChannelId,
}

impl PendingSlot {
    fn take(pending: &Arc<DashMap<ChannelId, usize>>, channel: &str) -> Self {
        *pending.entry(channel.to_string()).or_insert(0) += 1;
        Self {
            pending: Arc::clone(pending),
            channel: channel.to_string(),
        }
    }
}

impl Drop for PendingSlot {
    fn drop(&mut self) {
        if let Some(mut count) = self.pending.get_mut(&self.channel) {
            *count = count.saturating_sub(1);
        }
        self.pending.remove_if(&self.channel, |_, count| *count == 0);
    }
}
