//! Presence tracking for Herald.
//!
//! Presence records which users are present in a presence channel. A user
//! may be connected several times (tabs, devices); the store deduplicates
//! those connections so that clients only hear about a user arriving when
//! their first connection joins and leaving when their last one goes.

use dashmap::DashMap;
use herald_protocol::{MemberInfo, UserId};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use tracing::debug;

use crate::channel::ChannelId;
use crate::connection::ConnectionId;

/// Result of recording a connection in a presence channel.
#[derive(Debug, Clone, PartialEq)]
pub enum PresenceJoin {
    /// First connection of this user: announce the member to the channel.
    NewlyPresent,
    /// The user was already present through another connection.
    AlreadyPresent,
}

/// Result of removing a connection from a presence channel.
#[derive(Debug, Clone, PartialEq)]
pub enum PresenceLeave {
    /// That was the user's last connection; announce the departure.
    FullyDeparted(MemberInfo),
    /// The user still has other connections in the channel.
    StillPresent,
    /// The connection had no presence in the channel.
    NotPresent,
}

/// One present user.
#[derive(Debug)]
struct PresentUser {
    channel_data: Value,
    connections: HashSet<ConnectionId>,
    /// Join sequence within the channel, for stable snapshots.
    seq: u64,
}

/// Presence bookkeeping of one channel.
#[derive(Debug, Default)]
struct ChannelPresence {
    users: HashMap<UserId, PresentUser>,
    /// Reverse index so a leaving connection finds its user.
    connections: HashMap<ConnectionId, UserId>,
    next_seq: u64,
}

impl ChannelPresence {
    fn members(&self) -> Vec<MemberInfo> {
        let mut users: Vec<(&UserId, &PresentUser)> = self.users.iter().collect();
        users.sort_by_key(|(_, user)| user.seq);
        users
            .into_iter()
            .map(|(id, user)| MemberInfo::new(id.clone(), user.channel_data.clone()))
            .collect()
    }
}

/// In-memory presence store for all presence channels.
#[derive(Debug, Default)]
pub struct PresenceStore {
    channels: DashMap<ChannelId, ChannelPresence>,
}

impl PresenceStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `connection_id` as a connection of `user_id` in `channel`.
    pub fn join(
        &self,
        channel: &str,
        user_id: UserId,
        channel_data: Value,
        connection_id: &ConnectionId,
    ) -> PresenceJoin {
        let mut entry = self.channels.entry(channel.to_string()).or_default();
        let presence = entry.value_mut();

        if let Some(existing) = presence.connections.get(connection_id) {
            debug!(
                channel = %channel,
                connection = %connection_id,
                user = %existing,
                "Presence: connection already recorded"
            );
            return PresenceJoin::AlreadyPresent;
        }

        presence
            .connections
            .insert(connection_id.clone(), user_id.clone());

        if let Some(user) = presence.users.get_mut(&user_id) {
            user.connections.insert(connection_id.clone());
            debug!(
                channel = %channel,
                user = %user_id,
                connections = user.connections.len(),
                "Presence: additional connection"
            );
            return PresenceJoin::AlreadyPresent;
        }

        let seq = presence.next_seq;
        presence.next_seq += 1;
        presence.users.insert(
            user_id.clone(),
            PresentUser {
                channel_data,
                connections: HashSet::from([connection_id.clone()]),
                seq,
            },
        );
        debug!(channel = %channel, user = %user_id, "Presence: member joined");
        PresenceJoin::NewlyPresent
    }

    /// Remove `connection_id` from `channel`.
    pub fn leave(&self, channel: &str, connection_id: &ConnectionId) -> PresenceLeave {
        let Some(mut entry) = self.channels.get_mut(channel) else {
            return PresenceLeave::NotPresent;
        };
        let presence = entry.value_mut();

        let Some(user_id) = presence.connections.remove(connection_id) else {
            return PresenceLeave::NotPresent;
        };

        let outcome = match presence.users.get_mut(&user_id) {
            Some(user) => {
                user.connections.remove(connection_id);
                if user.connections.is_empty() {
                    let channel_data = presence
                        .users
                        .remove(&user_id)
                        .map(|u| u.channel_data)
                        .unwrap_or_default();
                    debug!(channel = %channel, user = %user_id, "Presence: member left");
                    PresenceLeave::FullyDeparted(MemberInfo::new(user_id, channel_data))
                } else {
                    PresenceLeave::StillPresent
                }
            }
            None => PresenceLeave::NotPresent,
        };

        let now_empty = presence.users.is_empty();
        drop(entry);
        if now_empty {
            self.channels
                .remove_if(channel, |_, presence| presence.users.is_empty());
        }

        outcome
    }

    /// Snapshot of the channel's members in join order.
    #[must_use]
    pub fn members(&self, channel: &str) -> Vec<MemberInfo> {
        self.channels
            .get(channel)
            .map(|p| p.members())
            .unwrap_or_default()
    }

    /// Number of distinct users present in a channel.
    #[must_use]
    pub fn user_count(&self, channel: &str) -> usize {
        self.channels.get(channel).map(|p| p.users.len()).unwrap_or(0)
    }

    /// Whether a user has at least one connection in a channel.
    #[must_use]
    pub fn is_present(&self, channel: &str, user_id: &UserId) -> bool {
        self.channels
            .get(channel)
            .is_some_and(|p| p.users.contains_key(user_id))
    }

    /// Number of channels with at least one present user.
    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}
