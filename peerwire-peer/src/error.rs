//! Peer error types.

use peerwire_protocol::{CodecError, ErrorCode, ProtocolError};
use thiserror::Error;

/// Errors raised while registering calls and messages.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("invalid id {id} for {name}: ids must be between 1 and 2^53 - 1")]
    InvalidId { id: u64, name: String },

    #[error("id {0} is already registered")]
    DuplicateId(u64),

    #[error("name {0} is already registered")]
    DuplicateName(String),
}

/// Errors reported by a frame channel.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error("channel closed")]
    Closed,

    #[error("transport error: {0}")]
    Transport(String),
}

/// Errors delivered to the caller of [`Peer::call`](crate::Peer::call).
#[derive(Debug, Error)]
pub enum CallError {
    #[error("Connection is closed")]
    Closed,

    #[error("Connection has closed")]
    ConnectionLost,

    #[error("Connection is not ready")]
    NotReady,

    #[error("Local call {0} not found")]
    UnknownCall(String),

    #[error("The remote does not give support for call {0}")]
    Unsupported(String),

    #[error("failed to encode call input: {0}")]
    Encode(#[source] CodecError),

    #[error("failed to decode call output: {0}")]
    Decode(#[source] CodecError),

    #[error("failed to send call: {0}")]
    Channel(#[from] ChannelError),

    #[error("Timed out")]
    Timeout,

    #[error("{reason}")]
    Remote { reason: String, code: u64 },
}

impl CallError {
    /// Returns whether the error was raised on this side of the connection.
    pub fn is_local(&self) -> bool {
        !matches!(self, CallError::Remote { .. })
    }

    /// Returns the error code, if any.
    ///
    /// Local codes are negative. Remote codes are whatever the remote sent;
    /// zero means the remote gave none.
    pub fn code(&self) -> Option<i64> {
        match self {
            CallError::Closed | CallError::ConnectionLost => Some(ErrorCode::Closed.code()),
            CallError::Timeout => Some(ErrorCode::Timeout.code()),
            CallError::Remote { code, .. } if *code > 0 => i64::try_from(*code).ok(),
            _ => None,
        }
    }

    /// Maps the code to a protocol-defined [`ErrorCode`] when it is one.
    pub fn error_code(&self) -> Option<ErrorCode> {
        match self {
            CallError::Closed | CallError::ConnectionLost => Some(ErrorCode::Closed),
            CallError::Timeout => Some(ErrorCode::Timeout),
            CallError::Remote { code, .. } => ErrorCode::from_wire(*code),
            _ => None,
        }
    }
}

/// Errors surfaced by [`Peer::send_strict`](crate::Peer::send_strict).
#[derive(Debug, Error)]
pub enum SendError {
    #[error("Connection is closed")]
    Closed,

    #[error("Connection is not ready")]
    NotReady,

    #[error("Local message {0} not found")]
    UnknownMessage(String),

    #[error("The remote does not give support for message {0}")]
    Unsupported(String),

    #[error("failed to encode message: {0}")]
    Encode(#[from] CodecError),

    #[error("failed to send message: {0}")]
    Channel(#[from] ChannelError),
}

/// Failure returned by a call handler. Sent to the caller as an error frame.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{reason}")]
pub struct HandlerError {
    pub reason: String,
    /// Application code; zero means none.
    pub code: u64,
}

impl HandlerError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            code: 0,
        }
    }

    pub fn with_code(mut self, code: u64) -> Self {
        self.code = code;
        self
    }
}

impl From<&str> for HandlerError {
    fn from(reason: &str) -> Self {
        Self::new(reason)
    }
}

impl From<String> for HandlerError {
    fn from(reason: String) -> Self {
        Self::new(reason)
    }
}

/// Connection-wide errors, reported through [`PeerEvent::Error`](crate::PeerEvent::Error).
#[derive(Debug, Error)]
pub enum PeerError {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Remote authentication was expected")]
    AuthRequired,

    #[error("authentication rejected: {0}")]
    AuthRejected(String),

    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("answer to call {call} does not match its output type: {source}")]
    InvalidAnswer {
        call: String,
        #[source]
        source: CodecError,
    },

    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("connection closed before the handshake completed")]
    ConnectionClosed,
}

impl From<CodecError> for PeerError {
    fn from(e: CodecError) -> Self {
        PeerError::Protocol(ProtocolError::Codec(e))
    }
}
