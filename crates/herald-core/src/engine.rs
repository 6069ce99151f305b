//! The channel protocol engine.
//!
//! Joins, leaves and client events for every connection pass through here.
//! The engine asks the application server before admitting a connection to
//! a private or presence channel, keeps presence bookkeeping, and announces
//! membership transitions to the rest of the room.
//!
//! ## Serialization
//!
//! - Mutations of one channel (room join/leave plus presence bookkeeping)
//!   run under that channel's lock, so the 0→1 and 1→0 transitions of a
//!   user are observed exactly once. Different channels never contend.
//! - Join and leave for one (connection, channel) pair run under a
//!   subscription lock, so a repeated subscribe waits for an in-flight
//!   authorization instead of racing it. Authorization itself happens
//!   outside the channel lock.

use dashmap::DashMap;
use herald_protocol::{ClientEvent, MemberInfo, ServerFrame, SubscribeRequest, UserId};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::auth::{AppServer, AuthError, LifecycleEvent};
use crate::channel::{validate_channel_name, ChannelId, ChannelKind};
use crate::connection::{ConnectionId, ConnectionInfo};
use crate::lock::{KeyedGuard, KeyedLock};
use crate::presence::{PresenceJoin, PresenceLeave, PresenceStore};
use crate::rooms::Rooms;

/// Why a join did not happen.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JoinError {
    /// The channel name is not acceptable.
    #[error("Invalid channel name: {0}")]
    InvalidChannel(&'static str),

    /// The application server refused, or could not be asked.
    #[error(transparent)]
    Unauthorized(#[from] AuthError),

    /// The connection went away while the join was in progress.
    #[error("Connection closed before the join completed")]
    Disconnected,
}

/// What a successful join did.
#[derive(Debug, Clone, PartialEq)]
pub enum JoinOutcome {
    /// The connection was added to the room.
    Joined {
        kind: ChannelKind,
        /// Presence transition, for presence channels.
        presence: Option<PresenceJoin>,
    },
    /// The connection was already in the room; it was acknowledged again.
    AlreadyJoined,
}

/// Engine settings.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Send connected/disconnected webhooks to the application server.
    pub lifecycle_webhooks: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lifecycle_webhooks: true,
        }
    }
}

/// Exclusive right to change one connection's membership of one channel.
///
/// Obtained with [`ChannelEngine::reserve`]; holding it while spawning the
/// join keeps later subscribe/unsubscribe requests for the same pair in
/// arrival order.
pub struct SubscriptionTicket {
    guard: KeyedGuard<(ConnectionId, ChannelId)>,
}

impl SubscriptionTicket {
    #[must_use]
    pub fn channel(&self) -> &str {
        &self.guard.key().1
    }
}

/// Orchestrates rooms, presence and the application server.
pub struct ChannelEngine {
    rooms: Arc<dyn Rooms>,
    app: Arc<dyn AppServer>,
    presence: PresenceStore,
    channel_locks: KeyedLock<ChannelId>,
    subscription_locks: KeyedLock<(ConnectionId, ChannelId)>,
    /// In-flight or finished `connected` webhooks, awaited before `disconnected`.
    connect_webhooks: DashMap<ConnectionId, JoinHandle<()>>,
    config: EngineConfig,
}

impl ChannelEngine {
    #[must_use]
    pub fn new(rooms: Arc<dyn Rooms>, app: Arc<dyn AppServer>, config: EngineConfig) -> Self {
        Self {
            rooms,
            app,
            presence: PresenceStore::new(),
            channel_locks: KeyedLock::new(),
            subscription_locks: KeyedLock::new(),
            connect_webhooks: DashMap::new(),
            config,
        }
    }

    /// The presence store.
    #[must_use]
    pub fn presence(&self) -> &PresenceStore {
        &self.presence
    }

    /// The rooms capability the engine delivers through.
    #[must_use]
    pub fn rooms(&self) -> &Arc<dyn Rooms> {
        &self.rooms
    }

    /// Handle a freshly registered connection.
    ///
    /// The `connected` webhook is sent in the background; its failure is
    /// only logged. The `disconnected` webhook for the same connection is
    /// not sent before it completes.
    pub fn connect(&self, connection: &ConnectionInfo) {
        debug!(connection = %connection.id, "Connected");
        self.rooms
            .emit_to(&connection.id, Arc::new(ServerFrame::connected(connection.id.as_str())));

        if !self.config.lifecycle_webhooks {
            return;
        }
        let app = Arc::clone(&self.app);
        let id = connection.id.clone();
        let connection = connection.clone();
        let webhook = tokio::spawn(async move {
            if let Err(e) = app.notify(&connection, LifecycleEvent::Connected).await {
                warn!(connection = %connection.id, error = %e, "Connect webhook failed");
            }
        });
        self.connect_webhooks.insert(id, webhook);
    }

    /// Wait for exclusive access to a connection's membership of `channel`.
    pub async fn reserve(&self, connection: &ConnectionId, channel: &str) -> SubscriptionTicket {
        let guard = self
            .subscription_locks
            .lock((connection.clone(), channel.to_string()))
            .await;
        SubscriptionTicket { guard }
    }

    /// Reserve and join in one step.
    ///
    /// # Errors
    ///
    /// See [`ChannelEngine::join`].
    pub async fn subscribe(
        &self,
        connection: &ConnectionInfo,
        request: SubscribeRequest,
    ) -> Result<JoinOutcome, JoinError> {
        let ticket = self.reserve(&connection.id, &request.channel).await;
        self.join(ticket, connection, request).await
    }

    /// Join `request.channel`.
    ///
    /// Public channels are joined immediately. Private and presence channels
    /// are joined only after the application server approves; a refusal is
    /// reported to the connection as `authorization_error` and never retried.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is invalid, authorization fails, or the
    /// connection closed meanwhile. The connection has already been told.
    pub async fn join(
        &self,
        ticket: SubscriptionTicket,
        connection: &ConnectionInfo,
        request: SubscribeRequest,
    ) -> Result<JoinOutcome, JoinError> {
        let channel = request.channel.as_str();
        debug_assert_eq!(ticket.channel(), channel);

        if let Err(reason) = validate_channel_name(channel) {
            self.rooms.emit_to(
                &connection.id,
                Arc::new(ServerFrame::subscription_error(channel, reason)),
            );
            return Err(JoinError::InvalidChannel(reason));
        }

        if self.rooms.is_member(channel, &connection.id) {
            debug!(connection = %connection.id, channel = %channel, "Already joined");
            self.acknowledge(connection, channel);
            return Ok(JoinOutcome::AlreadyJoined);
        }

        let kind = ChannelKind::of(channel);
        let auth = if kind.requires_auth() {
            self.authorize(connection, &request).await?
        } else {
            Value::Null
        };

        let presence = match kind {
            ChannelKind::Presence => {
                let member = match presence_member(&auth) {
                    Ok(member) => member,
                    Err(e) => {
                        self.reject(connection, channel, &e);
                        return Err(e.into());
                    }
                };
                Some(self.join_presence(connection, channel, member).await?)
            }
            ChannelKind::Public | ChannelKind::Private => {
                let _channel_guard = self.channel_locks.lock(channel.to_string()).await;
                self.admit(connection, channel)?;
                self.acknowledge(connection, channel);
                None
            }
        };

        debug!(connection = %connection.id, channel = %channel, kind = kind.as_str(), "Joined channel");
        Ok(JoinOutcome::Joined { kind, presence })
    }

    async fn join_presence(
        &self,
        connection: &ConnectionInfo,
        channel: &str,
        member: MemberInfo,
    ) -> Result<PresenceJoin, JoinError> {
        let _channel_guard = self.channel_locks.lock(channel.to_string()).await;

        // Taken before recording this connection: a newly present user must
        // not see themselves, an already present one already is listed.
        let snapshot = self.presence.members(channel);
        self.admit(connection, channel)?;

        let transition = self.presence.join(
            channel,
            member.user_id.clone(),
            member.channel_data.clone(),
            &connection.id,
        );

        self.rooms.emit_to(
            &connection.id,
            Arc::new(ServerFrame::presence_snapshot(channel, &snapshot)),
        );
        if transition == PresenceJoin::NewlyPresent {
            self.rooms.emit_except(
                channel,
                &connection.id,
                Arc::new(ServerFrame::member_added(channel, &member)),
            );
        }

        Ok(transition)
    }

    async fn authorize(
        &self,
        connection: &ConnectionInfo,
        request: &SubscribeRequest,
    ) -> Result<Value, JoinError> {
        self.app.authorize(connection, request).await.map_err(|e| {
            self.reject(connection, &request.channel, &e);
            JoinError::Unauthorized(e)
        })
    }

    fn reject(&self, connection: &ConnectionInfo, channel: &str, error: &AuthError) {
        warn!(
            connection = %connection.id,
            channel = %channel,
            status = error.status(),
            error = %error,
            "Join refused"
        );
        self.rooms.emit_to(
            &connection.id,
            Arc::new(ServerFrame::authorization_error(
                channel,
                &error.to_string(),
                error.status(),
            )),
        );
    }

    fn admit(&self, connection: &ConnectionInfo, channel: &str) -> Result<(), JoinError> {
        if self.rooms.join(channel, &connection.id) {
            Ok(())
        } else {
            debug!(connection = %connection.id, channel = %channel, "Connection gone before join");
            Err(JoinError::Disconnected)
        }
    }

    fn acknowledge(&self, connection: &ConnectionInfo, channel: &str) {
        let frame = if ChannelKind::of(channel) == ChannelKind::Presence {
            ServerFrame::presence_snapshot(channel, &self.presence.members(channel))
        } else {
            ServerFrame::subscription_succeeded(channel)
        };
        self.rooms.emit_to(&connection.id, Arc::new(frame));
    }

    /// Leave `channel`.
    ///
    /// Idempotent: leaving a channel the connection is not in changes
    /// nothing. `reason` is only logged. Returns whether the connection was
    /// a member.
    pub async fn leave(&self, connection: &ConnectionId, channel: &str, reason: &str) -> bool {
        let _ticket = self.reserve(connection, channel).await;
        let _channel_guard = self.channel_locks.lock(channel.to_string()).await;

        let was_member = self.rooms.leave(channel, connection);

        if ChannelKind::of(channel) == ChannelKind::Presence {
            match self.presence.leave(channel, connection) {
                PresenceLeave::FullyDeparted(member) => {
                    self.rooms.emit_all(
                        channel,
                        Arc::new(ServerFrame::member_removed(channel, &member)),
                    );
                }
                PresenceLeave::StillPresent | PresenceLeave::NotPresent => {}
            }
        }

        if was_member {
            debug!(connection = %connection, channel = %channel, reason = %reason, "Left channel");
        }
        was_member
    }

    /// Clean up after a connection closed.
    ///
    /// Every channel is left (and any resulting `member_removed` emitted)
    /// before the `disconnected` webhook is sent.
    pub async fn disconnect(&self, connection: &ConnectionInfo, reason: &str) {
        let channels = self.rooms.detach(&connection.id);
        for channel in &channels {
            self.leave(&connection.id, channel, reason).await;
        }
        debug!(connection = %connection.id, channels = channels.len(), reason = %reason, "Disconnected");

        if let Some((_, webhook)) = self.connect_webhooks.remove(&connection.id) {
            if let Err(e) = webhook.await {
                warn!(connection = %connection.id, error = %e, "Connect webhook task failed");
            }
        }

        if self.config.lifecycle_webhooks {
            if let Err(e) = self
                .app
                .notify(connection, LifecycleEvent::Disconnected)
                .await
            {
                warn!(connection = %connection.id, error = %e, "Disconnect webhook failed");
            }
        }
    }

    /// Relay a client event to the other members of its channel.
    ///
    /// Ignored unless the event name carries the client-event marker and
    /// the sender is a member of the channel. Returns whether it was relayed.
    pub fn client_event(&self, connection: &ConnectionId, event: ClientEvent) -> bool {
        if !event.has_client_prefix() {
            debug!(connection = %connection, event = %event.event, "Ignoring event without client prefix");
            return false;
        }
        if !self.rooms.is_member(&event.channel, connection) {
            debug!(connection = %connection, channel = %event.channel, "Ignoring client event from non-member");
            return false;
        }

        let ClientEvent {
            channel,
            event,
            data,
        } = event;
        let frame = Arc::new(ServerFrame::event(event, channel.as_str(), data));
        self.rooms.emit_except(&channel, connection, frame);
        true
    }
}

/// Extract the presence identity from an authorization response.
///
/// `channel_data` may be an object or a JSON-encoded string; it must carry
/// a string or integer `user_id`.
fn presence_member(auth: &Value) -> Result<MemberInfo, AuthError> {
    let raw = auth.get("channel_data").ok_or(AuthError::MissingMemberData)?;
    let channel_data = match raw {
        Value::String(encoded) => serde_json::from_str(encoded).map_err(|_| AuthError::MissingMemberData)?,
        other => other.clone(),
    };
    let user_id = channel_data
        .get("user_id")
        .and_then(UserId::from_value)
        .ok_or(AuthError::MissingMemberData)?;
    Ok(MemberInfo::new(user_id, channel_data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rooms::RoomRegistry;
    use async_trait::async_trait;
    use herald_protocol::events;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::mpsc;

    /// Scripted application server.
    #[derive(Default)]
    struct FakeApp {
        /// Keyed by "connection:channel", falling back to "channel".
        responses: Mutex<HashMap<String, Result<Value, AuthError>>>,
        delay: Option<Duration>,
        /// Delay before answering a `connected` webhook.
        connected_delay: Option<Duration>,
        fail_connected: bool,
        auth_calls: AtomicUsize,
        notifications: Mutex<Vec<(ConnectionId, LifecycleEvent)>>,
        /// Room to inspect when a disconnect webhook arrives.
        watch: Option<(Arc<RoomRegistry>, String)>,
        members_at_disconnect: Mutex<Option<usize>>,
    }

    impl FakeApp {
        fn respond(&self, key: &str, response: Result<Value, AuthError>) {
            self.responses
                .lock()
                .unwrap()
                .insert(key.to_string(), response);
        }
    }

    #[async_trait]
    impl AppServer for FakeApp {
        async fn authorize(
            &self,
            connection: &ConnectionInfo,
            request: &SubscribeRequest,
        ) -> Result<Value, AuthError> {
            self.auth_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let responses = self.responses.lock().unwrap();
            let specific = format!("{}:{}", connection.id, request.channel);
            responses
                .get(&specific)
                .or_else(|| responses.get(&request.channel))
                .cloned()
                .unwrap_or_else(|| Ok(json!({"auth": "ok"})))
        }

        async fn notify(
            &self,
            connection: &ConnectionInfo,
            event: LifecycleEvent,
        ) -> Result<(), AuthError> {
            if event == LifecycleEvent::Connected {
                if let Some(delay) = self.connected_delay {
                    tokio::time::sleep(delay).await;
                }
            }
            if event == LifecycleEvent::Disconnected {
                if let Some((registry, channel)) = &self.watch {
                    *self.members_at_disconnect.lock().unwrap() =
                        Some(registry.member_count(channel));
                }
            }
            self.notifications
                .lock()
                .unwrap()
                .push((connection.id.clone(), event));
            if event == LifecycleEvent::Connected && self.fail_connected {
                return Err(AuthError::Rejected {
                    status: 500,
                    body: "boom".into(),
                });
            }
            Ok(())
        }
    }

    type Inbox = mpsc::UnboundedReceiver<Arc<ServerFrame>>;

    fn setup(app: FakeApp) -> (Arc<ChannelEngine>, Arc<RoomRegistry>, Arc<FakeApp>) {
        setup_with(app, Arc::new(RoomRegistry::new()))
    }

    fn setup_with(
        app: FakeApp,
        registry: Arc<RoomRegistry>,
    ) -> (Arc<ChannelEngine>, Arc<RoomRegistry>, Arc<FakeApp>) {
        let app = Arc::new(app);
        let engine = Arc::new(ChannelEngine::new(
            registry.clone(),
            app.clone(),
            EngineConfig {
                lifecycle_webhooks: true,
            },
        ));
        (engine, registry, app)
    }

    fn connect(registry: &RoomRegistry, id: &str) -> (ConnectionInfo, Inbox) {
        let (tx, rx) = mpsc::unbounded_channel();
        let info = ConnectionInfo::new(id).with_host("app.test");
        registry.connect(info.id.clone(), tx);
        (info, rx)
    }

    fn drain(rx: &mut Inbox) -> Vec<Arc<ServerFrame>> {
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame);
        }
        frames
    }

    fn user(id: i64, name: &str) -> Result<Value, AuthError> {
        Ok(json!({"channel_data": {"user_id": id, "user_info": {"name": name}}}))
    }

    #[tokio::test]
    async fn test_public_join_needs_no_authorization() {
        let (engine, registry, app) = setup(FakeApp::default());
        let (c1, mut rx1) = connect(&registry, "c1");

        let outcome = engine
            .subscribe(&c1, SubscribeRequest::new("room1"))
            .await
            .unwrap();

        assert_eq!(
            outcome,
            JoinOutcome::Joined {
                kind: ChannelKind::Public,
                presence: None
            }
        );
        assert_eq!(app.auth_calls.load(Ordering::SeqCst), 0);
        assert!(registry.is_member("room1", &c1.id));
        let frames = drain(&mut rx1);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event, events::SUBSCRIPTION_SUCCEEDED);
    }

    #[tokio::test]
    async fn test_private_join_is_authorized_first() {
        let (engine, registry, app) = setup(FakeApp::default());
        let (c1, _rx1) = connect(&registry, "c1");

        engine
            .subscribe(&c1, SubscribeRequest::new("private-orders"))
            .await
            .unwrap();

        assert_eq!(app.auth_calls.load(Ordering::SeqCst), 1);
        assert!(registry.is_member("private-orders", &c1.id));
        assert_eq!(engine.presence().channel_count(), 0);
    }

    #[tokio::test]
    async fn test_rejected_join_reports_authorization_error() {
        let app = FakeApp::default();
        app.respond(
            "presence-room1",
            Err(AuthError::Rejected {
                status: 403,
                body: "Forbidden".into(),
            }),
        );
        let (engine, registry, _app) = setup(app);
        let (c1, mut rx1) = connect(&registry, "c1");

        let err = engine
            .subscribe(&c1, SubscribeRequest::new("presence-room1"))
            .await
            .unwrap_err();

        assert_eq!(err, JoinError::Unauthorized(AuthError::Rejected { status: 403, body: "Forbidden".into() }));
        assert!(!registry.is_member("presence-room1", &c1.id));
        assert_eq!(engine.presence().user_count("presence-room1"), 0);

        let frames = drain(&mut rx1);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event, events::AUTHORIZATION_ERROR);
        assert_eq!(frames[0].data["status"], json!(403));
    }

    #[tokio::test]
    async fn test_invalid_channel_name() {
        let (engine, registry, app) = setup(FakeApp::default());
        let (c1, mut rx1) = connect(&registry, "c1");

        let err = engine
            .subscribe(&c1, SubscribeRequest::new("$internal"))
            .await
            .unwrap_err();

        assert!(matches!(err, JoinError::InvalidChannel(_)));
        assert_eq!(app.auth_calls.load(Ordering::SeqCst), 0);
        assert_eq!(drain(&mut rx1)[0].event, events::SUBSCRIPTION_ERROR);
    }

    #[tokio::test]
    async fn test_presence_same_user_across_connections() {
        let app = FakeApp::default();
        app.respond("presence-room1", user(42, "Ada"));
        let (engine, registry, _app) = setup(app);
        let (c1, mut rx1) = connect(&registry, "c1");
        let (c2, mut rx2) = connect(&registry, "c2");

        // C1 arrives first: newly present, sees nobody.
        let outcome = engine
            .subscribe(&c1, SubscribeRequest::new("presence-room1"))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            JoinOutcome::Joined {
                kind: ChannelKind::Presence,
                presence: Some(PresenceJoin::NewlyPresent)
            }
        );
        let frames = drain(&mut rx1);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event, events::SUBSCRIPTION_SUCCEEDED);
        assert_eq!(frames[0].data, json!([]));

        // C2 is the same user: already present, no member_added.
        let outcome = engine
            .subscribe(&c2, SubscribeRequest::new("presence-room1"))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            JoinOutcome::Joined {
                kind: ChannelKind::Presence,
                presence: Some(PresenceJoin::AlreadyPresent)
            }
        );
        let frames = drain(&mut rx2);
        assert_eq!(frames.len(), 1);
        assert_eq!(
            frames[0].data,
            json!([{"user_id": 42, "channel_data": {"user_id": 42, "user_info": {"name": "Ada"}}}])
        );
        assert!(drain(&mut rx1).is_empty());

        // C1 disconnects while C2 remains: still present, no member_removed.
        engine.disconnect(&c1, "transport close").await;
        assert!(drain(&mut rx2).is_empty());
        assert!(engine.presence().is_present("presence-room1", &UserId::Int(42)));
        assert!(!registry.is_member("presence-room1", &c1.id));
    }

    #[tokio::test]
    async fn test_presence_transitions_broadcast_exactly_once() {
        let app = FakeApp::default();
        app.respond("observer:presence-room1", user(7, "Obs"));
        app.respond("presence-room1", user(42, "Ada"));
        let (engine, registry, _app) = setup(app);
        let (observer, mut obs_rx) = connect(&registry, "observer");
        let (c1, mut rx1) = connect(&registry, "c1");
        let (c2, _rx2) = connect(&registry, "c2");

        engine
            .subscribe(&observer, SubscribeRequest::new("presence-room1"))
            .await
            .unwrap();
        drain(&mut obs_rx);

        engine
            .subscribe(&c1, SubscribeRequest::new("presence-room1"))
            .await
            .unwrap();
        engine
            .subscribe(&c2, SubscribeRequest::new("presence-room1"))
            .await
            .unwrap();

        // Snapshot for C1 lists the observer only, never C1 itself.
        let c1_frames = drain(&mut rx1);
        assert_eq!(c1_frames[0].data, json!([{"user_id": 7, "channel_data": {"user_id": 7, "user_info": {"name": "Obs"}}}]));

        let added: Vec<_> = drain(&mut obs_rx)
            .into_iter()
            .filter(|f| f.event == events::MEMBER_ADDED)
            .collect();
        assert_eq!(added.len(), 1);
        assert_eq!(added[0].data["user_id"], json!(42));

        assert!(engine.leave(&c1.id, "presence-room1", "unsubscribed").await);
        assert!(drain(&mut obs_rx).is_empty());

        assert!(engine.leave(&c2.id, "presence-room1", "unsubscribed").await);
        let removed = drain(&mut obs_rx);
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].event, events::MEMBER_REMOVED);
        assert_eq!(removed[0].data["user_id"], json!(42));

        // Leaving again is a no-op.
        assert!(!engine.leave(&c2.id, "presence-room1", "unsubscribed").await);
        assert!(drain(&mut obs_rx).is_empty());
    }

    #[tokio::test]
    async fn test_presence_without_member_data_is_refused() {
        let app = FakeApp::default();
        app.respond("presence-room1", Ok(json!({"auth": "ok"})));
        let (engine, registry, _app) = setup(app);
        let (c1, mut rx1) = connect(&registry, "c1");

        let err = engine
            .subscribe(&c1, SubscribeRequest::new("presence-room1"))
            .await
            .unwrap_err();

        assert_eq!(err, JoinError::Unauthorized(AuthError::MissingMemberData));
        assert!(!registry.is_member("presence-room1", &c1.id));
        assert_eq!(drain(&mut rx1)[0].event, events::AUTHORIZATION_ERROR);
    }

    #[tokio::test]
    async fn test_presence_channel_data_as_encoded_string() {
        let app = FakeApp::default();
        app.respond(
            "presence-room1",
            Ok(json!({"channel_data": "{\"user_id\":\"u-9\",\"user_info\":null}"})),
        );
        let (engine, registry, _app) = setup(app);
        let (c1, _rx1) = connect(&registry, "c1");

        engine
            .subscribe(&c1, SubscribeRequest::new("presence-room1"))
            .await
            .unwrap();
        assert!(engine
            .presence()
            .is_present("presence-room1", &UserId::from("u-9")));
    }

    #[tokio::test]
    async fn test_client_events() {
        let (engine, registry, _app) = setup(FakeApp::default());
        let (c1, mut rx1) = connect(&registry, "c1");
        let (c2, mut rx2) = connect(&registry, "c2");
        let (outsider, _rx3) = connect(&registry, "outsider");
        engine.subscribe(&c1, SubscribeRequest::new("private-chat")).await.unwrap();
        engine.subscribe(&c2, SubscribeRequest::new("private-chat")).await.unwrap();
        drain(&mut rx1);
        drain(&mut rx2);

        let whisper = |event: &str| ClientEvent {
            channel: "private-chat".into(),
            event: event.into(),
            data: json!({"typing": true}),
        };

        assert!(!engine.client_event(&outsider.id, whisper("client-typing")));
        assert!(!engine.client_event(&c1.id, whisper("typing")));
        assert!(drain(&mut rx1).is_empty());
        assert!(drain(&mut rx2).is_empty());

        assert!(engine.client_event(&c1.id, whisper("client-typing")));
        assert!(drain(&mut rx1).is_empty());
        let frames = drain(&mut rx2);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event, "client-typing");
        assert_eq!(frames[0].channel.as_deref(), Some("private-chat"));
        assert_eq!(frames[0].data, json!({"typing": true}));
    }

    #[tokio::test]
    async fn test_disconnect_leaves_everything_before_webhook() {
        let registry = Arc::new(RoomRegistry::new());
        let app = FakeApp {
            watch: Some((registry.clone(), "presence-room1".into())),
            ..FakeApp::default()
        };
        app.respond("observer:presence-room1", user(7, "Obs"));
        app.respond("presence-room1", user(42, "Ada"));
        let (engine, registry, app) = setup_with(app, registry);
        let (observer, mut obs_rx) = connect(&registry, "observer");
        let (c1, _rx1) = connect(&registry, "c1");

        engine.subscribe(&observer, SubscribeRequest::new("presence-room1")).await.unwrap();
        engine.subscribe(&c1, SubscribeRequest::new("presence-room1")).await.unwrap();
        engine.subscribe(&c1, SubscribeRequest::new("room1")).await.unwrap();
        drain(&mut obs_rx);

        engine.disconnect(&c1, "transport close").await;

        assert!(!registry.is_member("room1", &c1.id));
        assert!(!registry.is_member("presence-room1", &c1.id));
        assert_eq!(*app.members_at_disconnect.lock().unwrap(), Some(1));
        let frames = drain(&mut obs_rx);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event, events::MEMBER_REMOVED);
        assert!(app
            .notifications
            .lock()
            .unwrap()
            .contains(&(c1.id.clone(), LifecycleEvent::Disconnected)));
    }

    #[tokio::test]
    async fn test_repeated_join_waits_for_inflight_authorization() {
        let app = FakeApp {
            delay: Some(Duration::from_millis(50)),
            ..FakeApp::default()
        };
        app.respond("presence-room1", user(42, "Ada"));
        let (engine, registry, app) = setup(app);
        let (c1, _rx1) = connect(&registry, "c1");

        let (first, second) = tokio::join!(
            engine.subscribe(&c1, SubscribeRequest::new("presence-room1")),
            engine.subscribe(&c1, SubscribeRequest::new("presence-room1")),
        );

        let mut outcomes = vec![first.unwrap(), second.unwrap()];
        outcomes.retain(|o| *o == JoinOutcome::AlreadyJoined);
        assert_eq!(outcomes.len(), 1);
        assert_eq!(app.auth_calls.load(Ordering::SeqCst), 1);
        assert_eq!(registry.member_count("presence-room1"), 1);
    }

    #[tokio::test]
    async fn test_joins_on_distinct_channels_run_concurrently() {
        let app = FakeApp {
            delay: Some(Duration::from_millis(200)),
            ..FakeApp::default()
        };
        let (engine, registry, _app) = setup(app);
        let (c1, _rx1) = connect(&registry, "c1");

        let started = tokio::time::Instant::now();
        let (a, b) = tokio::join!(
            engine.subscribe(&c1, SubscribeRequest::new("private-a")),
            engine.subscribe(&c1, SubscribeRequest::new("private-b")),
        );
        a.unwrap();
        b.unwrap();
        assert!(started.elapsed() < Duration::from_millis(390));
    }

    #[tokio::test]
    async fn test_disconnect_during_authorization_abandons_join() {
        let app = FakeApp {
            delay: Some(Duration::from_millis(50)),
            ..FakeApp::default()
        };
        let (engine, registry, _app) = setup(app);
        let (c1, _rx1) = connect(&registry, "c1");

        let (joined, ()) = tokio::join!(
            engine.subscribe(&c1, SubscribeRequest::new("private-a")),
            async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                engine.disconnect(&c1, "transport close").await;
            }
        );

        assert_eq!(joined.unwrap_err(), JoinError::Disconnected);
        assert_eq!(registry.member_count("private-a"), 0);
    }

    #[tokio::test]
    async fn test_duplicate_join_is_acknowledged_again() {
        let (engine, registry, app) = setup(FakeApp::default());
        let (c1, mut rx1) = connect(&registry, "c1");

        engine.subscribe(&c1, SubscribeRequest::new("private-a")).await.unwrap();
        let again = engine
            .subscribe(&c1, SubscribeRequest::new("private-a"))
            .await
            .unwrap();

        assert_eq!(again, JoinOutcome::AlreadyJoined);
        assert_eq!(app.auth_calls.load(Ordering::SeqCst), 1);
        assert_eq!(drain(&mut rx1).len(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_joins_of_one_user_announce_once() {
        let app = FakeApp {
            delay: Some(Duration::from_millis(30)),
            ..FakeApp::default()
        };
        app.respond("observer:presence-room1", user(7, "Obs"));
        app.respond("presence-room1", user(42, "Ada"));
        let (engine, registry, _app) = setup(app);
        let (observer, mut obs_rx) = connect(&registry, "observer");
        let (c1, mut rx1) = connect(&registry, "c1");
        let (c2, mut rx2) = connect(&registry, "c2");

        engine
            .subscribe(&observer, SubscribeRequest::new("presence-room1"))
            .await
            .unwrap();
        drain(&mut obs_rx);

        let (first, second) = tokio::join!(
            engine.subscribe(&c1, SubscribeRequest::new("presence-room1")),
            engine.subscribe(&c2, SubscribeRequest::new("presence-room1")),
        );
        let mut transitions = vec![first.unwrap(), second.unwrap()];
        transitions.sort_by_key(|o| format!("{o:?}"));
        assert_eq!(
            transitions,
            vec![
                JoinOutcome::Joined {
                    kind: ChannelKind::Presence,
                    presence: Some(PresenceJoin::AlreadyPresent)
                },
                JoinOutcome::Joined {
                    kind: ChannelKind::Presence,
                    presence: Some(PresenceJoin::NewlyPresent)
                },
            ]
        );

        let added: Vec<_> = drain(&mut obs_rx)
            .into_iter()
            .filter(|f| f.event == events::MEMBER_ADDED)
            .collect();
        assert_eq!(added.len(), 1);
        assert_eq!(added[0].data["user_id"], json!(42));
        assert_eq!(engine.presence().user_count("presence-room1"), 2);
        drain(&mut rx1);
        drain(&mut rx2);

        let (left1, left2) = tokio::join!(
            engine.leave(&c1.id, "presence-room1", "unsubscribed"),
            engine.leave(&c2.id, "presence-room1", "unsubscribed"),
        );
        assert!(left1 && left2);

        let removed: Vec<_> = drain(&mut obs_rx)
            .into_iter()
            .filter(|f| f.event == events::MEMBER_REMOVED)
            .collect();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].data["user_id"], json!(42));
        assert!(!engine
            .presence()
            .is_present("presence-room1", &UserId::Int(42)));
    }

    #[tokio::test]
    async fn test_failed_connect_webhook_keeps_connection() {
        let app = FakeApp {
            fail_connected: true,
            ..FakeApp::default()
        };
        let (engine, registry, app) = setup(app);
        let (c1, mut rx1) = connect(&registry, "c1");

        engine.connect(&c1);
        for _ in 0..50 {
            if !app.notifications.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        assert_eq!(
            *app.notifications.lock().unwrap(),
            vec![(c1.id.clone(), LifecycleEvent::Connected)]
        );
        assert!(registry.is_connected(&c1.id));
        assert_eq!(drain(&mut rx1)[0].event, events::CONNECTED);

        engine
            .subscribe(&c1, SubscribeRequest::new("room1"))
            .await
            .unwrap();
        assert!(registry.is_member("room1", &c1.id));
    }

    #[tokio::test]
    async fn test_disconnect_webhook_follows_connect_webhook() {
        let app = FakeApp {
            connected_delay: Some(Duration::from_millis(50)),
            ..FakeApp::default()
        };
        let (engine, registry, app) = setup(app);
        let (c1, _rx1) = connect(&registry, "c1");

        engine.connect(&c1);
        engine.disconnect(&c1, "transport close").await;

        assert_eq!(
            *app.notifications.lock().unwrap(),
            vec![
                (c1.id.clone(), LifecycleEvent::Connected),
                (c1.id.clone(), LifecycleEvent::Disconnected),
            ]
        );
    }

    #[test]
    fn test_presence_member_parsing() {
        let member = presence_member(&json!({"channel_data": {"user_id": 5}})).unwrap();
        assert_eq!(member.user_id, UserId::Int(5));

        assert_eq!(
            presence_member(&json!("plain text")),
            Err(AuthError::MissingMemberData)
        );
        assert_eq!(
            presence_member(&json!({"channel_data": "not json"})),
            Err(AuthError::MissingMemberData)
        );
        assert_eq!(
            presence_member(&json!({"channel_data": {"user_info": {}}})),
            Err(AuthError::MissingMemberData)
        );
    }
}
