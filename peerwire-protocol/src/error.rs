//! Protocol error types and error codes.

use std::fmt;
use thiserror::Error;

/// Errors raised while encoding or decoding values against a schema type.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("expected {expected} at {path}")]
    TypeMismatch { expected: &'static str, path: String },

    #[error("malformed {expected} value at {path}")]
    MalformedValue { expected: &'static str, path: String },

    #[error("unexpected end of buffer: need {needed} bytes at offset {offset}")]
    UnexpectedEof { needed: usize, offset: usize },

    #[error("invalid UTF-8 in string at offset {offset}")]
    InvalidUtf8 { offset: usize },

    #[error("invalid boolean byte: {0:#x}")]
    InvalidBoolean(u8),

    #[error("{0} trailing bytes after payload")]
    TrailingBytes(usize),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CodecError {
    pub(crate) fn mismatch(expected: &'static str, path: &str) -> Self {
        CodecError::TypeMismatch {
            expected,
            path: display_path(path),
        }
    }

    pub(crate) fn malformed(expected: &'static str, path: &str) -> Self {
        CodecError::MalformedValue {
            expected,
            path: display_path(path),
        }
    }
}

fn display_path(path: &str) -> String {
    if path.is_empty() {
        "<root>".to_string()
    } else {
        path.to_string()
    }
}

/// Errors raised while building a schema type from a description.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchemaError {
    #[error("unknown basic type: {0}")]
    UnknownKind(String),

    #[error("invalid type description: {0}")]
    InvalidDescription(String),

    #[error("object type must declare at least one field")]
    EmptyObject,

    #[error("duplicate field name: {0}")]
    DuplicateField(String),

    #[error("invalid field name: {0:?}")]
    InvalidFieldName(String),
}

/// Frame-level errors. Every variant is fatal to the connection.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid frame kind: {0:#x}")]
    InvalidFrameKind(u8),

    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u64),

    #[error("empty frame")]
    EmptyFrame,

    #[error("unexpected frame: {0}")]
    UnexpectedFrame(&'static str),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
}

/// Stable error codes carried by error frames or attached to local errors.
///
/// Negative codes are only ever generated locally. Codes from 1000 up are
/// reserved for conditions defined by the protocol itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// The call timed out; a late answer is discarded.
    Timeout,
    /// The connection closed before the call was answered.
    Closed,
    /// The remote has no handler for this call.
    NotImplemented,
    /// The call input could not be decoded by the remote.
    InvalidData,
    /// The remote handler produced an answer that violates its output type.
    Internal,
}

impl ErrorCode {
    /// Returns the numeric value of this code.
    pub fn code(&self) -> i64 {
        match self {
            ErrorCode::Timeout => -1,
            ErrorCode::Closed => -2,
            ErrorCode::NotImplemented => 1000,
            ErrorCode::InvalidData => 1001,
            ErrorCode::Internal => 1002,
        }
    }

    /// Returns the value written in an error frame. Local-only codes have none.
    pub fn wire_code(&self) -> Option<u64> {
        u64::try_from(self.code()).ok()
    }

    /// Maps a code read from an error frame back to a protocol code.
    pub fn from_wire(code: u64) -> Option<Self> {
        match code {
            1000 => Some(ErrorCode::NotImplemented),
            1001 => Some(ErrorCode::InvalidData),
            1002 => Some(ErrorCode::Internal),
            _ => None,
        }
    }

    /// Returns whether this code can only be produced locally.
    pub fn is_local(&self) -> bool {
        self.code() < 0
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::Timeout => write!(f, "TIMEOUT"),
            ErrorCode::Closed => write!(f, "CLOSED"),
            ErrorCode::NotImplemented => write!(f, "NOT_IMPLEMENTED"),
            ErrorCode::InvalidData => write!(f, "INVALID_DATA"),
            ErrorCode::Internal => write!(f, "INTERNAL"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_values() {
        assert_eq!(ErrorCode::Timeout.code(), -1);
        assert_eq!(ErrorCode::Closed.code(), -2);
        assert_eq!(ErrorCode::NotImplemented.code(), 1000);
        assert_eq!(ErrorCode::InvalidData.code(), 1001);
        assert_eq!(ErrorCode::Internal.code(), 1002);
    }

    #[test]
    fn test_error_code_locality() {
        assert!(ErrorCode::Timeout.is_local());
        assert!(ErrorCode::Closed.is_local());
        assert!(!ErrorCode::NotImplemented.is_local());
        assert!(!ErrorCode::InvalidData.is_local());
        assert!(!ErrorCode::Internal.is_local());

        assert_eq!(ErrorCode::Timeout.wire_code(), None);
        assert_eq!(ErrorCode::Internal.wire_code(), Some(1002));
    }

    #[test]
    fn test_error_code_from_wire() {
        assert_eq!(ErrorCode::from_wire(1000), Some(ErrorCode::NotImplemented));
        assert_eq!(ErrorCode::from_wire(1001), Some(ErrorCode::InvalidData));
        assert_eq!(ErrorCode::from_wire(1002), Some(ErrorCode::Internal));
        assert_eq!(ErrorCode::from_wire(0), None);
        assert_eq!(ErrorCode::from_wire(42), None);
    }

    #[test]
    fn test_error_code_display() {
        assert_eq!(format!("{}", ErrorCode::Timeout), "TIMEOUT");
        assert_eq!(format!("{}", ErrorCode::Closed), "CLOSED");
        assert_eq!(format!("{}", ErrorCode::NotImplemented), "NOT_IMPLEMENTED");
        assert_eq!(format!("{}", ErrorCode::InvalidData), "INVALID_DATA");
        assert_eq!(format!("{}", ErrorCode::Internal), "INTERNAL");
    }

    #[test]
    fn test_codec_error_display() {
        let err = CodecError::mismatch("an object", "");
        assert_eq!(err.to_string(), "expected an object at <root>");

        let err = CodecError::mismatch("a string", "c.1.d");
        assert_eq!(err.to_string(), "expected a string at c.1.d");

        let err = CodecError::UnexpectedEof {
            needed: 4,
            offset: 10,
        };
        let msg = err.to_string();
        assert!(msg.contains('4'));
        assert!(msg.contains("10"));

        let err = CodecError::InvalidBoolean(0x07);
        assert!(err.to_string().contains("0x7"));
    }

    #[test]
    fn test_protocol_error_display() {
        let err = ProtocolError::InvalidFrameKind(0x09);
        assert!(err.to_string().contains("0x9"));

        let err = ProtocolError::UnsupportedVersion(99);
        assert!(err.to_string().contains("99"));

        let err = ProtocolError::from(CodecError::TrailingBytes(3));
        assert!(err.to_string().contains("3 trailing"));
    }
}
