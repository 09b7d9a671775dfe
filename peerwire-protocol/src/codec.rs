//! Binary encoding of [`Value`]s against a schema [`Type`].

use crate::buffer::{Reader, Writer};
use crate::error::CodecError;
use crate::schema::{Kind, NodeId, Slot, Type};
use crate::value::{ObjectId, RegexValue, Value};
use crate::varint;
use bytes::Bytes;
use chrono::{TimeZone, Utc};
use std::collections::BTreeMap;

impl Type {
    /// Encodes `value` into a standalone payload.
    pub fn encode(&self, value: &Value) -> Result<Bytes, CodecError> {
        let mut w = Writer::new();
        self.write(&mut w, value)?;
        Ok(w.into_bytes())
    }

    /// Appends the encoding of `value` to `w`.
    ///
    /// On error `w` may hold a partial encoding and should be discarded.
    pub fn write(&self, w: &mut Writer, value: &Value) -> Result<(), CodecError> {
        self.write_node(w, self.root, value, "")
    }

    /// Decodes a payload that must be consumed exactly.
    pub fn decode(&self, data: &[u8]) -> Result<Value, CodecError> {
        let mut r = Reader::new(data);
        let value = self.read(&mut r)?;
        r.finish()?;
        Ok(value)
    }

    /// Reads one value from the cursor.
    pub fn read(&self, r: &mut Reader<'_>) -> Result<Value, CodecError> {
        self.read_node(r, self.root)
    }

    fn write_node(
        &self,
        w: &mut Writer,
        id: NodeId,
        value: &Value,
        path: &str,
    ) -> Result<(), CodecError> {
        let node = self.node(id);
        if node.kind.is_basic() {
            return write_scalar(w, node.kind, value, path);
        }

        let map = match value {
            Value::Object(map) => map,
            _ => return Err(CodecError::mismatch(expected(Kind::Object), path)),
        };

        for slot in &node.fields {
            let field_path = join(path, &slot.name);
            let field = map.get(&slot.name).filter(|v| !v.is_null());

            let field = match (field, slot.optional) {
                (Some(v), true) => {
                    w.put_u8(1);
                    v
                }
                (None, true) => {
                    w.put_u8(0);
                    continue;
                }
                (Some(v), false) => v,
                (None, false) => {
                    return Err(CodecError::mismatch(
                        self.slot_expected(slot),
                        &field_path,
                    ))
                }
            };

            if slot.array {
                let items = match field {
                    Value::Array(items) => items,
                    _ => return Err(CodecError::mismatch("an array", &field_path)),
                };
                varint::write_len(w, items.len());
                for (i, item) in items.iter().enumerate() {
                    self.write_node(w, slot.node, item, &join(&field_path, &i.to_string()))?;
                }
            } else {
                self.write_node(w, slot.node, field, &field_path)?;
            }
        }

        Ok(())
    }

    fn slot_expected(&self, slot: &Slot) -> &'static str {
        if slot.array {
            "an array"
        } else {
            expected(self.node(slot.node).kind)
        }
    }

    fn read_node(&self, r: &mut Reader<'_>, id: NodeId) -> Result<Value, CodecError> {
        let node = self.node(id);
        if node.kind.is_basic() {
            return read_scalar(r, node.kind);
        }

        let mut map = BTreeMap::new();
        for slot in &node.fields {
            if slot.optional && !read_bool(r)? {
                continue;
            }

            let value = if slot.array {
                let len = read_len(r)?;
                // Every encoded element takes at least one byte.
                if len > r.remaining() {
                    return Err(CodecError::UnexpectedEof {
                        needed: len - r.remaining(),
                        offset: r.offset(),
                    });
                }
                let mut items = Vec::with_capacity(len);
                for _ in 0..len {
                    items.push(self.read_node(r, slot.node)?);
                }
                Value::Array(items)
            } else {
                self.read_node(r, slot.node)?
            };

            map.insert(slot.name.clone(), value);
        }

        Ok(Value::Object(map))
    }
}

fn join(path: &str, segment: &str) -> String {
    if path.is_empty() {
        segment.to_string()
    } else {
        format!("{}.{}", path, segment)
    }
}

fn expected(kind: Kind) -> &'static str {
    match kind {
        Kind::Uint => "an unsigned integer",
        Kind::Int => "a signed integer",
        Kind::Float => "a number",
        Kind::String => "a string",
        Kind::Bytes => "a byte buffer",
        Kind::Boolean => "a boolean",
        Kind::Json => "a JSON value",
        Kind::ObjectId => "an object id",
        Kind::Regex => "a regex",
        Kind::Date => "a date",
        Kind::Object => "an object",
    }
}

fn write_scalar(w: &mut Writer, kind: Kind, value: &Value, path: &str) -> Result<(), CodecError> {
    let mismatch = || CodecError::mismatch(expected(kind), path);

    match (kind, value) {
        (Kind::Uint, v) => {
            let u = v.as_u64().ok_or_else(mismatch)?;
            varint::write_uint(w, u, path)?;
        }
        (Kind::Int, v) => {
            let i = v.as_i64().ok_or_else(mismatch)?;
            varint::write_int(w, i, path)?;
        }
        (Kind::Float, v) => w.put_f64(v.as_f64().ok_or_else(mismatch)?),
        (Kind::String, Value::String(s)) => write_str(w, s),
        (Kind::Bytes, Value::Bytes(b)) => {
            varint::write_len(w, b.len());
            w.put_slice(b);
        }
        (Kind::Boolean, Value::Bool(b)) => w.put_u8(*b as u8),
        (Kind::Json, Value::Json(j)) => write_str(w, &serde_json::to_string(j)?),
        (Kind::ObjectId, Value::ObjectId(oid)) => w.put_slice(oid.as_bytes()),
        (Kind::Regex, Value::Regex(re)) => {
            write_str(w, &re.source);
            w.put_u8(re.flag_byte());
        }
        (Kind::Date, Value::Date(d)) => w.put_i64(d.timestamp_millis()),
        _ => return Err(mismatch()),
    }
    Ok(())
}

fn write_str(w: &mut Writer, s: &str) {
    varint::write_len(w, s.len());
    w.put_slice(s.as_bytes());
}

fn read_scalar(r: &mut Reader<'_>, kind: Kind) -> Result<Value, CodecError> {
    let value = match kind {
        Kind::Uint => Value::Uint(varint::read_uint(r)?),
        Kind::Int => Value::Int(varint::read_int(r)?),
        Kind::Float => Value::Float(r.read_f64()?),
        Kind::String => Value::String(read_string(r)?),
        Kind::Bytes => {
            let len = read_len(r)?;
            Value::Bytes(Bytes::copy_from_slice(r.read_bytes(len)?))
        }
        Kind::Boolean => Value::Bool(read_bool(r)?),
        Kind::Json => Value::Json(serde_json::from_str(&read_string(r)?)?),
        Kind::ObjectId => Value::ObjectId(ObjectId(r.read_array()?)),
        Kind::Regex => {
            let source = read_string(r)?;
            Value::Regex(RegexValue::with_flag_byte(source, r.read_u8()?))
        }
        Kind::Date => {
            let millis = r.read_i64()?;
            let date = Utc
                .timestamp_millis_opt(millis)
                .single()
                .ok_or_else(|| CodecError::malformed("date", ""))?;
            Value::Date(date)
        }
        Kind::Object => return Err(CodecError::malformed("basic kind", "")),
    };
    Ok(value)
}

fn read_len(r: &mut Reader<'_>) -> Result<usize, CodecError> {
    let len = varint::read_uint(r)?;
    usize::try_from(len).map_err(|_| CodecError::malformed("length", ""))
}

fn read_string(r: &mut Reader<'_>) -> Result<String, CodecError> {
    let len = read_len(r)?;
    let offset = r.offset();
    let raw = r.read_bytes(len)?;
    std::str::from_utf8(raw)
        .map(str::to_string)
        .map_err(|_| CodecError::InvalidUtf8 { offset })
}

fn read_bool(r: &mut Reader<'_>) -> Result<bool, CodecError> {
    match r.read_u8()? {
        0 => Ok(false),
        1 => Ok(true),
        b => Err(CodecError::InvalidBoolean(b)),
    }
}
