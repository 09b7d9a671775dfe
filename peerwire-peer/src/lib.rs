//! # peerwire-peer
//!
//! Peer state machine for peerwire.
//!
//! This crate provides:
//! - Call and message descriptors with their compatibility hashes
//! - A registry shared by every peer of an application
//! - The frame channel boundary and an in-memory channel pair
//! - Handshake with optional credential checks
//! - Typed calls with timeouts, and one-way messages
//! - YAML/env configuration

pub mod auth;
pub mod channel;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod peer;
pub mod registry;

pub use auth::{AcceptAll, AuthFn, AuthFuture, AuthPolicy, CredentialValidator};
pub use channel::{ChannelEvent, FrameChannel, FrameSink, MemoryChannel, MemoryConnector};
pub use config::{AuthConfig, CallConfig, ConfigError, PeerConfig};
pub use descriptor::{
    call_handler, message_handler, Call, CallFuture, CallHandler, Message, MessageFuture,
    MessageHandler,
};
pub use error::{CallError, ChannelError, HandlerError, PeerError, RegistryError, SendError};
pub use peer::{Peer, PeerEvent, PeerEvents, PeerOptions, DEFAULT_CALL_TIMEOUT};
pub use registry::{Descriptor, Registry, Side, Table};
