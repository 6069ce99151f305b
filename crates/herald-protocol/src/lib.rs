//! # herald-protocol
//!
//! Wire protocol definitions for the Herald channel bridge.
//!
//! This crate defines what travels between Herald and its two outer
//! parties: WebSocket clients and the application's pub/sub backend.
//!
//! ## Frame Types
//!
//! - `ClientFrame` - `subscribe`, `unsubscribe`, `client event`, `ping`
//! - `ServerFrame` - membership notifications, errors and relayed events
//! - `RelayMessage` - an application event published on the pub/sub backend
//!
//! ## Example
//!
//! ```rust
//! use herald_protocol::{codec, ClientFrame, Encoding};
//!
//! let raw = br#"{"event":"subscribe","data":{"channel":"orders"}}"#;
//! let frame: ClientFrame = codec::decode(raw, Encoding::Json).unwrap();
//! assert!(matches!(frame, ClientFrame::Subscribe(_)));
//! ```

pub mod codec;
pub mod frames;
pub mod relay;

pub use codec::{decode, encode, Encoding, ProtocolError};
pub use frames::{
    events, AuthPayload, ClientEvent, ClientFrame, MemberInfo, ServerFrame, SubscribeRequest,
    UnsubscribeRequest, UserId, CLIENT_EVENT_PREFIX,
};
pub use relay::RelayMessage;
