//! Frame formats.
//!
//! The first two frames each side sends are the handshake and the handshake
//! answer. After both directions are done, every frame starts with a kind
//! byte:
//!
//! ```text
//! Call     0x00 <sid:uint> <id:uint> [input]
//! Message  0x01 <id:uint> [input]
//! Success  0x02 <sid:uint> [output]
//! Error    0x03 <sid:uint> <reason:string> <code:uint>
//! ```
//!
//! Payloads are kept as raw bytes here; the peer decodes them against the
//! descriptor's type once it knows which call or message they belong to.

use crate::buffer::{Reader, Writer};
use crate::error::{CodecError, ProtocolError};
use crate::schema::{Field, Type};
use crate::value::Value;
use crate::varint;
use crate::PROTOCOL_VERSION;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::OnceLock;

/// Kind byte of a post-handshake frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    Call = 0x00,
    Message = 0x01,
    Success = 0x02,
    Error = 0x03,
}

impl FrameKind {
    pub fn from_byte(b: u8) -> Result<Self, ProtocolError> {
        match b {
            0x00 => Ok(FrameKind::Call),
            0x01 => Ok(FrameKind::Message),
            0x02 => Ok(FrameKind::Success),
            0x03 => Ok(FrameKind::Error),
            _ => Err(ProtocolError::InvalidFrameKind(b)),
        }
    }
}

/// A decoded post-handshake frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Call { sid: u64, id: u64, payload: Bytes },
    Message { id: u64, payload: Bytes },
    Success { sid: u64, payload: Bytes },
    Error { sid: u64, reason: String, code: u64 },
}

impl Frame {
    pub fn kind(&self) -> FrameKind {
        match self {
            Frame::Call { .. } => FrameKind::Call,
            Frame::Message { .. } => FrameKind::Message,
            Frame::Success { .. } => FrameKind::Success,
            Frame::Error { .. } => FrameKind::Error,
        }
    }

    /// Encodes a frame whose payload is already encoded.
    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        let mut w = Writer::new();
        w.put_u8(self.kind() as u8);
        match self {
            Frame::Call { sid, id, payload } => {
                varint::write_uint(&mut w, *sid, "sid")?;
                varint::write_uint(&mut w, *id, "id")?;
                w.put_slice(payload);
            }
            Frame::Message { id, payload } => {
                varint::write_uint(&mut w, *id, "id")?;
                w.put_slice(payload);
            }
            Frame::Success { sid, payload } => {
                varint::write_uint(&mut w, *sid, "sid")?;
                w.put_slice(payload);
            }
            Frame::Error { sid, reason, code } => {
                varint::write_uint(&mut w, *sid, "sid")?;
                write_error_body(&mut w, reason, *code)?;
            }
        }
        Ok(w.into_bytes())
    }

    /// Decodes a post-handshake frame.
    ///
    /// Payload bytes are sliced out of `data` without copying.
    pub fn decode(data: Bytes) -> Result<Self, ProtocolError> {
        let mut r = Reader::new(&data);
        let kind = FrameKind::from_byte(r.read_u8().map_err(|_| ProtocolError::EmptyFrame)?)?;

        let frame = match kind {
            FrameKind::Call => {
                let sid = varint::read_uint(&mut r)?;
                let id = varint::read_uint(&mut r)?;
                Frame::Call {
                    sid,
                    id,
                    payload: data.slice(r.offset()..),
                }
            }
            FrameKind::Message => {
                let id = varint::read_uint(&mut r)?;
                Frame::Message {
                    id,
                    payload: data.slice(r.offset()..),
                }
            }
            FrameKind::Success => {
                let sid = varint::read_uint(&mut r)?;
                Frame::Success {
                    sid,
                    payload: data.slice(r.offset()..),
                }
            }
            FrameKind::Error => {
                let sid = varint::read_uint(&mut r)?;
                let body = error_type().decode(r.rest())?;
                let reason = body
                    .get("reason")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let code = body.get("code").and_then(Value::as_u64).unwrap_or(0);
                Frame::Error { sid, reason, code }
            }
        };

        Ok(frame)
    }
}

/// Builds frames straight from values, writing header and payload into one
/// buffer.
pub struct Encoder;

impl Encoder {
    /// `0x00 sid id [input]`
    pub fn call(
        sid: u64,
        id: u64,
        input: Option<&Type>,
        data: &Value,
    ) -> Result<Bytes, CodecError> {
        let mut w = Writer::new();
        w.put_u8(FrameKind::Call as u8);
        varint::write_uint(&mut w, sid, "sid")?;
        varint::write_uint(&mut w, id, "id")?;
        if let Some(ty) = input {
            ty.write(&mut w, data)?;
        }
        Ok(w.into_bytes())
    }

    /// `0x01 id [input]`
    pub fn message(id: u64, input: Option<&Type>, data: &Value) -> Result<Bytes, CodecError> {
        let mut w = Writer::new();
        w.put_u8(FrameKind::Message as u8);
        varint::write_uint(&mut w, id, "id")?;
        if let Some(ty) = input {
            ty.write(&mut w, data)?;
        }
        Ok(w.into_bytes())
    }

    /// `0x02 sid [output]`
    pub fn success(sid: u64, output: Option<&Type>, data: &Value) -> Result<Bytes, CodecError> {
        let mut w = Writer::new();
        w.put_u8(FrameKind::Success as u8);
        varint::write_uint(&mut w, sid, "sid")?;
        if let Some(ty) = output {
            ty.write(&mut w, data)?;
        }
        Ok(w.into_bytes())
    }

    /// `0x03 sid reason code`
    pub fn error(sid: u64, reason: &str, code: u64) -> Result<Bytes, CodecError> {
        let mut w = Writer::new();
        w.put_u8(FrameKind::Error as u8);
        varint::write_uint(&mut w, sid, "sid")?;
        write_error_body(&mut w, reason, code)?;
        Ok(w.into_bytes())
    }
}

fn write_error_body(w: &mut Writer, reason: &str, code: u64) -> Result<(), CodecError> {
    let body = Value::object()
        .field("reason", reason)
        .field("code", code)
        .build();
    error_type().write(w, &body)
}

fn error_type() -> &'static Type {
    static TYPE: OnceLock<Type> = OnceLock::new();
    TYPE.get_or_init(|| {
        Type::object_unchecked([
            Field::new("reason", Type::string()),
            Field::new("code", Type::uint()),
        ])
    })
}

fn advert_type() -> Type {
    Type::object_unchecked([
        Field::new("id", Type::uint()),
        Field::new("hash", Type::bytes()),
    ])
}

fn handshake_type() -> &'static Type {
    static TYPE: OnceLock<Type> = OnceLock::new();
    TYPE.get_or_init(|| {
        Type::object_unchecked([
            Field::new("version", Type::uint()),
            Field::new(
                "auth",
                Type::object_unchecked([
                    Field::new("user", Type::string()),
                    Field::new("password", Type::string()),
                ]),
            ),
            Field::new("calls", advert_type()).array(),
            Field::new("messages", advert_type()).array(),
        ])
    })
}

fn answer_type() -> &'static Type {
    static TYPE: OnceLock<Type> = OnceLock::new();
    TYPE.get_or_init(|| Type::object_unchecked([Field::new("error", Type::string()).optional()]))
}

/// Credentials presented in the handshake. Empty strings mean "none".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

impl Credentials {
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
        }
    }

    /// True when neither a user nor a password was supplied.
    pub fn is_empty(&self) -> bool {
        self.user.is_empty() && self.password.is_empty()
    }
}

/// One call or message the sender lets the other side invoke.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advert {
    pub id: u64,
    pub hash: Bytes,
}

impl Advert {
    fn to_value(&self) -> Value {
        Value::object()
            .field("id", self.id)
            .field("hash", self.hash.clone())
            .build()
    }

    fn from_value(value: &Value) -> Result<Self, CodecError> {
        let id = value
            .get("id")
            .and_then(Value::as_u64)
            .ok_or_else(|| CodecError::malformed("advert id", "id"))?;
        let hash = match value.get("hash") {
            Some(Value::Bytes(b)) => b.clone(),
            _ => return Err(CodecError::malformed("advert hash", "hash")),
        };
        Ok(Self { id, hash })
    }
}

/// First frame each side sends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub version: u64,
    pub auth: Credentials,
    pub calls: Vec<Advert>,
    pub messages: Vec<Advert>,
}

impl Handshake {
    pub fn new(auth: Credentials, calls: Vec<Advert>, messages: Vec<Advert>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            auth,
            calls,
            messages,
        }
    }

    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        let value = Value::object()
            .field("version", self.version)
            .field(
                "auth",
                Value::object()
                    .field("user", self.auth.user.as_str())
                    .field("password", self.auth.password.as_str()),
            )
            .field(
                "calls",
                Value::Array(self.calls.iter().map(Advert::to_value).collect()),
            )
            .field(
                "messages",
                Value::Array(self.messages.iter().map(Advert::to_value).collect()),
            )
            .build();
        Ok(handshake_type().encode(&value)?)
    }

    /// Decodes a handshake, rejecting any protocol version but ours.
    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        let value = handshake_type().decode(data)?;

        let version = value.get("version").and_then(Value::as_u64).unwrap_or(0);
        if version != PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedVersion(version));
        }

        let auth = value.get("auth");
        let text = |key: &str| {
            auth.and_then(|a| a.get(key))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        let auth = Credentials::new(text("user"), text("password"));

        let adverts = |key: &str| -> Result<Vec<Advert>, CodecError> {
            value
                .get(key)
                .and_then(Value::as_array)
                .unwrap_or_default()
                .iter()
                .map(Advert::from_value)
                .collect()
        };

        Ok(Self {
            version,
            auth,
            calls: adverts("calls")?,
            messages: adverts("messages")?,
        })
    }
}

/// Second frame each side sends, once its auth check has completed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandshakeAnswer {
    /// Rejection reason; `None` means accepted.
    pub error: Option<String>,
}

impl HandshakeAnswer {
    pub fn accepted() -> Self {
        Self { error: None }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            error: Some(reason.into()),
        }
    }

    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        let mut fields = BTreeMap::new();
        if let Some(error) = &self.error {
            fields.insert("error".to_string(), Value::from(error.as_str()));
        }
        Ok(answer_type().encode(&Value::Object(fields))?)
    }

    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        let value = answer_type().decode(data)?;
        Ok(Self {
            error: value.get("error").and_then(Value::as_str).map(str::to_string),
        })
    }
}
