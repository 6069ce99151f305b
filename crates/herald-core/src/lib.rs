//! # herald-core
//!
//! Channel protocol engine, presence tracking and broadcast relay for the
//! Herald realtime bridge.
//!
//! This crate provides the fundamental building blocks:
//!
//! - **Engine** - join/leave/client-event handling with authorization gating
//! - **Presence** - which users are present in presence channels
//! - **Auth** - the application server client (authorization and webhooks)
//! - **Relay** - pub/sub message fan-out to rooms
//! - **Rooms** - the membership/delivery capability everything above uses
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Connection │────▶│   Engine    │────▶│    Rooms    │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!                       │         │              ▲
//!                       ▼         ▼              │
//!               ┌──────────┐ ┌──────────┐ ┌─────────────┐
//!               │ Presence │ │ AppServer│ │    Relay    │◀── pub/sub
//!               └──────────┘ └──────────┘ └─────────────┘
//! ```

pub mod auth;
pub mod channel;
pub mod connection;
pub mod engine;
pub mod lock;
pub mod presence;
pub mod relay;
pub mod rooms;

pub use auth::{AppServer, AppServerConfig, AuthError, HttpAppServer, LifecycleEvent};
pub use channel::{ChannelId, ChannelKind};
pub use connection::{ConnectionId, ConnectionInfo};
pub use engine::{ChannelEngine, EngineConfig, JoinError, JoinOutcome, SubscriptionTicket};
pub use presence::{PresenceJoin, PresenceLeave, PresenceStore};
pub use relay::{BroadcastRelay, Delivery, RelayError};
pub use rooms::{Outbound, RoomRegistry, Rooms};
