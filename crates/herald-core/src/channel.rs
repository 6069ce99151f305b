//! Channel naming rules.
//!
//! A channel's kind is derived purely from its name prefix.

/// Maximum channel name length.
pub const MAX_CHANNEL_NAME_LENGTH: usize = 256;

/// Prefix marking a private channel.
pub const PRIVATE_PREFIX: &str = "private-";

/// Prefix marking a presence channel.
pub const PRESENCE_PREFIX: &str = "presence-";

/// A channel identifier.
pub type ChannelId = String;

/// The three kinds of channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    /// Anyone may join.
    Public,
    /// Joining requires authorization by the application server.
    Private,
    /// Private, plus membership tracking by user.
    Presence,
}

impl ChannelKind {
    /// Classify a channel by its name.
    #[must_use]
    pub fn of(name: &str) -> Self {
        if name.starts_with(PRESENCE_PREFIX) {
            ChannelKind::Presence
        } else if name.starts_with(PRIVATE_PREFIX) {
            ChannelKind::Private
        } else {
            ChannelKind::Public
        }
    }

    /// Whether joining needs the application server's approval.
    #[must_use]
    pub fn requires_auth(self) -> bool {
        !matches!(self, ChannelKind::Public)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ChannelKind::Public => "public",
            ChannelKind::Private => "private",
            ChannelKind::Presence => "presence",
        }
    }
}

/// Validate a channel name.
///
/// # Errors
///
/// Returns an error message if the channel name is invalid.
pub fn validate_channel_name(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("Channel name cannot be empty");
    }
    if name.len() > MAX_CHANNEL_NAME_LENGTH {
        return Err("Channel name too long");
    }
    if name.starts_with('$') {
        return Err("Channel names starting with '$' are reserved");
    }
    if !name.chars().all(|c| c.is_ascii() && !c.is_ascii_control()) {
        return Err("Channel name contains invalid characters");
    }
    Ok(())
}
