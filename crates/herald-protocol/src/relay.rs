//! Application events published on the pub/sub backend.
//!
//! The application publishes JSON objects of the form
//! `{"channel": "...", "event": "...", "data": ..., "socket": "..."}`.
//! `channel` may be omitted, in which case the pub/sub channel the message
//! arrived on names the target. `socket` names a connection to leave out of
//! the fan-out.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::codec::ProtocolError;

/// A message to fan out to a channel's members.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayMessage {
    /// Target channel; falls back to the pub/sub channel name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    /// Event name delivered to clients.
    pub event: String,
    /// Event payload.
    #[serde(default)]
    pub data: Value,
    /// Connection to exclude from delivery.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socket: Option<String>,
}

impl RelayMessage {
    /// Parse a raw pub/sub payload.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload is not a JSON object with a
    /// non-empty `event`.
    pub fn parse(raw: &str) -> Result<Self, ProtocolError> {
        let message: RelayMessage = serde_json::from_str(raw)?;
        if message.event.is_empty() {
            return Err(ProtocolError::Invalid("relay message has an empty event".into()));
        }
        Ok(message)
    }

    /// Resolve the channel this message targets.
    ///
    /// An explicit `channel` wins; otherwise the pub/sub channel name is used
    /// with `key_prefix` stripped.
    #[must_use]
    pub fn target_channel<'a>(&'a self, source: &'a str, key_prefix: &str) -> &'a str {
        match self.channel.as_deref() {
            Some(channel) if !channel.is_empty() => channel,
            _ => source.strip_prefix(key_prefix).unwrap_or(source),
        }
    }

    /// The connection to exclude, ignoring empty values.
    #[must_use]
    pub fn excluded_socket(&self) -> Option<&str> {
        self.socket.as_deref().filter(|s| !s.is_empty())
    }
}
