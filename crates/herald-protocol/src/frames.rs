//! Frame types for the Herald protocol.
//!
//! Inbound frames are tagged by `event` with their payload under `data`.
//! Outbound frames always carry an event name, an optional channel and
//! arbitrary data, mirroring the `(event, channel, data)` triple clients
//! listen for.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;

/// Event names a client may whisper to other channel members must start with this.
pub const CLIENT_EVENT_PREFIX: &str = "client-";

/// Names of the events emitted by the server itself.
pub mod events {
    pub const CONNECTED: &str = "connected";
    pub const SUBSCRIPTION_SUCCEEDED: &str = "subscription_succeeded";
    pub const SUBSCRIPTION_ERROR: &str = "subscription_error";
    pub const AUTHORIZATION_ERROR: &str = "authorization_error";
    pub const MEMBER_ADDED: &str = "member_added";
    pub const MEMBER_REMOVED: &str = "member_removed";
    pub const PONG: &str = "pong";
}

/// Authorization material attached to a subscribe request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthPayload {
    /// Headers forwarded verbatim to the application's auth endpoint.
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

/// A request to join a channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscribeRequest {
    /// Channel to join.
    pub channel: String,
    /// Optional authorization payload for private and presence channels.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthPayload>,
    /// Optional client-supplied channel data, forwarded to the auth endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_data: Option<Value>,
}

impl SubscribeRequest {
    /// Create a subscribe request without authorization material.
    #[must_use]
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            auth: None,
            channel_data: None,
        }
    }

    /// Add a header to forward to the auth endpoint.
    #[must_use]
    pub fn with_auth_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.auth
            .get_or_insert_with(AuthPayload::default)
            .headers
            .insert(name.into(), value.into());
        self
    }

    /// Headers supplied by the client for the auth request.
    #[must_use]
    pub fn auth_headers(&self) -> HashMap<String, String> {
        self.auth
            .as_ref()
            .map(|a| a.headers.clone())
            .unwrap_or_default()
    }
}

/// A request to leave a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsubscribeRequest {
    pub channel: String,
}

/// An event a client wants delivered to the other members of a channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientEvent {
    pub channel: String,
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

impl ClientEvent {
    /// Whether the event name carries the client-event marker.
    #[must_use]
    pub fn has_client_prefix(&self) -> bool {
        self.event.starts_with(CLIENT_EVENT_PREFIX)
    }
}

/// A frame received from a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientFrame {
    #[serde(rename = "subscribe")]
    Subscribe(SubscribeRequest),

    #[serde(rename = "unsubscribe")]
    Unsubscribe(UnsubscribeRequest),

    #[serde(rename = "client event")]
    ClientEvent(ClientEvent),

    #[serde(rename = "ping")]
    Ping,
}

impl ClientFrame {
    /// Name of the frame as it appears on the wire.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            ClientFrame::Subscribe(_) => "subscribe",
            ClientFrame::Unsubscribe(_) => "unsubscribe",
            ClientFrame::ClientEvent(_) => "client event",
            ClientFrame::Ping => "ping",
        }
    }
}

/// Identity of a presence member.
///
/// Applications hand out either numeric or string ids; both are kept as-is
/// and compared by value. Integers above `i64::MAX` (snowflake-style ids)
/// keep their unsigned value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UserId {
    Int(i64),
    UInt(u64),
    Str(String),
}

impl UserId {
    /// Extract a user id from a JSON value, if it is a string or an integer.
    #[must_use]
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n
                .as_i64()
                .map(UserId::Int)
                .or_else(|| n.as_u64().map(UserId::UInt)),
            Value::String(s) => Some(UserId::Str(s.clone())),
            _ => None,
        }
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UserId::Int(id) => write!(f, "{id}"),
            UserId::UInt(id) => write!(f, "{id}"),
            UserId::Str(id) => f.write_str(id),
        }
    }
}

impl From<&UserId> for Value {
    fn from(id: &UserId) -> Self {
        match id {
            UserId::Int(i) => Value::from(*i),
            UserId::UInt(u) => Value::from(*u),
            UserId::Str(s) => Value::String(s.clone()),
        }
    }
}

impl From<i64> for UserId {
    fn from(id: i64) -> Self {
        UserId::Int(id)
    }
}

impl From<&str> for UserId {
    fn from(id: &str) -> Self {
        UserId::Str(id.to_string())
    }
}

/// A present user as seen by clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberInfo {
    pub user_id: UserId,
    #[serde(default)]
    pub channel_data: Value,
}

impl MemberInfo {
    #[must_use]
    pub fn new(user_id: UserId, channel_data: Value) -> Self {
        Self {
            user_id,
            channel_data,
        }
    }

    /// JSON representation used in outbound frames.
    #[must_use]
    pub fn to_value(&self) -> Value {
        let mut map = Map::with_capacity(2);
        map.insert("user_id".to_string(), Value::from(&self.user_id));
        map.insert("channel_data".to_string(), self.channel_data.clone());
        Value::Object(map)
    }
}

/// A frame sent to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerFrame {
    /// Event name.
    pub event: String,
    /// Channel the event belongs to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    /// Event payload.
    #[serde(default)]
    pub data: Value,
}

impl ServerFrame {
    /// Create a channel event frame (relayed or client-originated).
    #[must_use]
    pub fn event(event: impl Into<String>, channel: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            channel: Some(channel.into()),
            data,
        }
    }

    /// Greeting sent once the connection is registered.
    #[must_use]
    pub fn connected(socket_id: &str) -> Self {
        let mut data = Map::new();
        data.insert("socket_id".to_string(), Value::String(socket_id.to_string()));
        Self {
            event: events::CONNECTED.to_string(),
            channel: None,
            data: Value::Object(data),
        }
    }

    /// Join acknowledgment for public and private channels.
    #[must_use]
    pub fn subscription_succeeded(channel: impl Into<String>) -> Self {
        Self::event(events::SUBSCRIPTION_SUCCEEDED, channel, Value::Null)
    }

    /// Join acknowledgment for presence channels, carrying the member snapshot.
    #[must_use]
    pub fn presence_snapshot(channel: impl Into<String>, members: &[MemberInfo]) -> Self {
        let members = members.iter().map(MemberInfo::to_value).collect();
        Self::event(events::SUBSCRIPTION_SUCCEEDED, channel, Value::Array(members))
    }

    /// Rejection of a malformed subscribe request.
    #[must_use]
    pub fn subscription_error(channel: impl Into<String>, message: impl Into<String>) -> Self {
        Self::event(
            events::SUBSCRIPTION_ERROR,
            channel,
            Value::String(message.into()),
        )
    }

    /// Rejection of a join by the application server.
    #[must_use]
    pub fn authorization_error(channel: impl Into<String>, reason: &str, status: u16) -> Self {
        let mut data = Map::with_capacity(2);
        data.insert("reason".to_string(), Value::String(reason.to_string()));
        data.insert("status".to_string(), Value::from(status));
        Self::event(events::AUTHORIZATION_ERROR, channel, Value::Object(data))
    }

    #[must_use]
    pub fn member_added(channel: impl Into<String>, member: &MemberInfo) -> Self {
        Self::event(events::MEMBER_ADDED, channel, member.to_value())
    }

    #[must_use]
    pub fn member_removed(channel: impl Into<String>, member: &MemberInfo) -> Self {
        Self::event(events::MEMBER_REMOVED, channel, member.to_value())
    }

    #[must_use]
    pub fn pong() -> Self {
        Self {
            event: events::PONG.to_string(),
            channel: None,
            data: Value::Null,
        }
    }
}
