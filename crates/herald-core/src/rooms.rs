//! Room membership and fan-out.
//!
//! [`Rooms`] is the narrow capability the engine and relay need from the
//! connection layer: join, leave, and emit to a room with or without one
//! connection. [`RoomRegistry`] is the in-memory implementation used by the
//! server, delivering frames through one unbounded queue per connection.

use dashmap::DashMap;
use herald_protocol::ServerFrame;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::channel::ChannelId;
use crate::connection::ConnectionId;

/// Queue feeding frames to one connection's writer.
pub type Outbound = mpsc::UnboundedSender<Arc<ServerFrame>>;

/// Room membership and delivery, as provided by the connection layer.
pub trait Rooms: Send + Sync {
    /// Add a connection to a room.
    ///
    /// Returns `false` if the connection is no longer connected, in which
    /// case nothing changes.
    fn join(&self, channel: &str, connection: &ConnectionId) -> bool;

    /// Remove a connection from a room. Returns `true` if it was a member.
    fn leave(&self, channel: &str, connection: &ConnectionId) -> bool;

    fn is_member(&self, channel: &str, connection: &ConnectionId) -> bool;

    fn is_connected(&self, connection: &ConnectionId) -> bool;

    /// Stop delivering to a connection and return the rooms it is still in.
    ///
    /// The connection stays listed in those rooms until each is left.
    fn detach(&self, connection: &ConnectionId) -> Vec<ChannelId>;

    /// Deliver a frame to a single connection.
    fn emit_to(&self, connection: &ConnectionId, frame: Arc<ServerFrame>) -> bool;

    /// Deliver a frame to every member of a room. Returns the recipient count.
    fn emit_all(&self, channel: &str, frame: Arc<ServerFrame>) -> usize;

    /// Deliver a frame to every member of a room but one.
    fn emit_except(&self, channel: &str, except: &ConnectionId, frame: Arc<ServerFrame>) -> usize;
}

/// A registered connection.
struct Member {
    sender: Outbound,
    channels: HashSet<ChannelId>,
}

/// In-memory connection registry and room table.
///
/// Lock order is always `connections` before `rooms`; no method holds a
/// `rooms` guard while touching `connections`.
#[derive(Default)]
pub struct RoomRegistry {
    connections: DashMap<ConnectionId, Member>,
    rooms: DashMap<ChannelId, HashSet<ConnectionId>>,
}

impl RoomRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection and the queue its frames go to.
    ///
    /// Returns `false` if the id is already registered.
    pub fn connect(&self, connection: ConnectionId, sender: Outbound) -> bool {
        match self.connections.entry(connection) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                debug!(connection = %slot.key(), "Connection registered");
                slot.insert(Member {
                    sender,
                    channels: HashSet::new(),
                });
                true
            }
        }
    }

    /// Get registry statistics.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            connection_count: self.connections.len(),
            room_count: self.rooms.len(),
            total_memberships: self.rooms.iter().map(|r| r.len()).sum(),
        }
    }

    /// Number of connections in a room.
    #[must_use]
    pub fn member_count(&self, channel: &str) -> usize {
        self.rooms.get(channel).map(|r| r.len()).unwrap_or(0)
    }

    /// Rooms a registered connection has joined.
    #[must_use]
    pub fn connection_channels(&self, connection: &ConnectionId) -> Vec<ChannelId> {
        self.connections
            .get(connection)
            .map(|m| m.channels.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn room_members(&self, channel: &str) -> Vec<ConnectionId> {
        self.rooms
            .get(channel)
            .map(|r| r.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn send(&self, connection: &ConnectionId, frame: &Arc<ServerFrame>) -> bool {
        match self.connections.get(connection) {
            Some(member) => member.sender.send(Arc::clone(frame)).is_ok(),
            None => {
                trace!(connection = %connection, "Dropping frame for detached connection");
                false
            }
        }
    }
}

impl Rooms for RoomRegistry {
    fn join(&self, channel: &str, connection: &ConnectionId) -> bool {
        let Some(mut member) = self.connections.get_mut(connection) else {
            return false;
        };
        member.channels.insert(channel.to_string());
        self.rooms
            .entry(channel.to_string())
            .or_default()
            .insert(connection.clone());

        debug!(channel = %channel, connection = %connection, "Joined room");
        true
    }

    fn leave(&self, channel: &str, connection: &ConnectionId) -> bool {
        if let Some(mut member) = self.connections.get_mut(connection) {
            member.channels.remove(channel);
        }

        let removed = match self.rooms.get_mut(channel) {
            Some(mut room) => room.remove(connection),
            None => false,
        };

        // Rooms exist only while non-empty.
        self.rooms.remove_if(channel, |_, room| room.is_empty());

        if removed {
            debug!(channel = %channel, connection = %connection, "Left room");
        }
        removed
    }

    fn is_member(&self, channel: &str, connection: &ConnectionId) -> bool {
        self.rooms
            .get(channel)
            .is_some_and(|room| room.contains(connection))
    }

    fn is_connected(&self, connection: &ConnectionId) -> bool {
        self.connections.contains_key(connection)
    }

    fn detach(&self, connection: &ConnectionId) -> Vec<ChannelId> {
        match self.connections.remove(connection) {
            Some((_, member)) => {
                debug!(connection = %connection, rooms = member.channels.len(), "Connection detached");
                member.channels.into_iter().collect()
            }
            None => Vec::new(),
        }
    }

    fn emit_to(&self, connection: &ConnectionId, frame: Arc<ServerFrame>) -> bool {
        self.send(connection, &frame)
    }

    fn emit_all(&self, channel: &str, frame: Arc<ServerFrame>) -> usize {
        let delivered = self
            .room_members(channel)
            .iter()
            .filter(|member| self.send(member, &frame))
            .count();
        trace!(channel = %channel, event = %frame.event, recipients = delivered, "Emitted to room");
        delivered
    }

    fn emit_except(&self, channel: &str, except: &ConnectionId, frame: Arc<ServerFrame>) -> usize {
        let delivered = self
            .room_members(channel)
            .iter()
            .filter(|member| *member != except)
            .filter(|member| self.send(member, &frame))
            .count();
        trace!(
            channel = %channel,
            event = %frame.event,
            except = %except,
            recipients = delivered,
            "Emitted to room except one"
        );
        delivered
    }
}

/// Registry statistics.
#[derive(Debug, Clone)]
pub struct RegistryStats {
    /// Number of registered connections.
    pub connection_count: usize,
    /// Number of non-empty rooms.
    pub room_count: usize,
    /// Total room memberships.
    pub total_memberships: usize,
}
