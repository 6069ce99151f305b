//! Fan-out of application events from the pub/sub backend.
//!
//! Each raw pub/sub payload becomes one frame delivered to every member of
//! the target channel, optionally minus the connection that triggered the
//! event on the application side.

use herald_protocol::{ProtocolError, RelayMessage, ServerFrame};
use std::sync::Arc;
use thiserror::Error;
use tracing::trace;

use crate::connection::ConnectionId;
use crate::rooms::Rooms;

/// Relay errors.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The payload is not a relay message.
    #[error("Malformed relay message on {origin}: {error}")]
    Malformed {
        /// Pub/sub channel the payload arrived on.
        origin: String,
        error: ProtocolError,
    },
}

/// What happened to one relayed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub channel: String,
    pub event: String,
    /// Number of connections the frame was queued for.
    pub recipients: usize,
    /// Connection left out of the fan-out, if any.
    pub excluded: Option<ConnectionId>,
}

/// Turns pub/sub payloads into room broadcasts.
pub struct BroadcastRelay {
    rooms: Arc<dyn Rooms>,
    key_prefix: String,
}

impl BroadcastRelay {
    /// Create a relay. `key_prefix` is stripped from pub/sub channel names
    /// used as targets.
    #[must_use]
    pub fn new(rooms: Arc<dyn Rooms>, key_prefix: impl Into<String>) -> Self {
        Self {
            rooms,
            key_prefix: key_prefix.into(),
        }
    }

    /// Relay one payload received on pub/sub channel `origin`.
    ///
    /// If the message names a connection that is currently connected, that
    /// connection is skipped; otherwise every member receives the event.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be parsed. Nothing is sent.
    pub fn dispatch(&self, origin: &str, raw: &str) -> Result<Delivery, RelayError> {
        let message = RelayMessage::parse(raw).map_err(|error| RelayError::Malformed {
            origin: origin.to_string(),
            error,
        })?;

        let channel = message.target_channel(origin, &self.key_prefix).to_string();
        let excluded = message
            .excluded_socket()
            .map(ConnectionId::from)
            .filter(|id| self.rooms.is_connected(id));

        let RelayMessage { event, data, .. } = message;
        let frame = Arc::new(ServerFrame::event(event.clone(), channel.as_str(), data));

        let recipients = match &excluded {
            Some(sender) => self.rooms.emit_except(&channel, sender, frame),
            None => self.rooms.emit_all(&channel, frame),
        };

        trace!(channel = %channel, event = %event, recipients, "Relayed");
        Ok(Delivery {
            channel,
            event,
            recipients,
            excluded,
        })
    }
}
