//! # peerwire
//!
//! Peer-to-peer binary RPC with schema compatibility negotiation.
//!
//! Two peers exchange typed calls (request/response) and typed one-way
//! messages over an ordered, reliable frame channel. At connection time each
//! side advertises a structural hash of every call and message it accepts, so
//! peers running different versions find out which operations they agree on
//! before using them.
//!
//! This crate re-exports the two building blocks:
//! - [`protocol`]: varint codec, schema types, values, frames
//! - [`peer`]: registry, peer state machine, auth, configuration

pub use peerwire_peer as peer;
pub use peerwire_protocol as protocol;

pub use peerwire_peer::{
    AcceptAll, AuthPolicy, CallError, ChannelEvent, FrameChannel, HandlerError, MemoryChannel,
    Peer, PeerConfig, PeerError, PeerEvent, PeerEvents, PeerOptions, Registry, Side,
};
pub use peerwire_protocol::{ErrorCode, Field, Kind, Type, Value, PROTOCOL_VERSION};
