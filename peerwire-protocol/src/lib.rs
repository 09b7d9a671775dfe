//! # peerwire-protocol
//!
//! Wire protocol implementation for peerwire.
//!
//! This crate provides:
//! - Tagged big-endian varints for every length and identifier
//! - Schema types (basic kinds and ordered object fields) with a structural hash
//! - Dynamic values and their binary encoding against a schema type
//! - The handshake, call, message, success and error frame formats
//! - Error codes and protocol constants

pub mod buffer;
pub mod codec;
pub mod error;
pub mod frame;
pub mod schema;
pub mod value;
pub mod varint;

pub use buffer::{Reader, Writer};
pub use error::{CodecError, ErrorCode, ProtocolError, SchemaError};
pub use frame::{Advert, Credentials, Encoder, Frame, FrameKind, Handshake, HandshakeAnswer};
pub use schema::{Field, Kind, Type};
pub use value::{ObjectId, RegexValue, Value};

/// Protocol version carried in the handshake.
pub const PROTOCOL_VERSION: u64 = 1;

/// Largest integer magnitude the varint codec accepts (2^53 - 1).
pub const MAX_SAFE_INTEGER: u64 = (1 << 53) - 1;
