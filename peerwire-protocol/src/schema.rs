//! Schema types.
//!
//! A [`Type`] is either a basic kind or an object with an ordered list of
//! named fields. Field order fixes both the wire layout and the structural
//! hash. Nodes live in a flat arena; every object field owns its child node
//! by index.
//!
//! Types are built programmatically:
//!
//! ```
//! use peerwire_protocol::{Field, Type};
//!
//! let ty = Type::object([
//!     Field::new("a", Type::int()),
//!     Field::new("b", Type::int()).array(),
//!     Field::new("c", Type::object([Field::new("d", Type::string()).optional()]).unwrap()).array(),
//! ])
//! .unwrap();
//! assert_eq!(ty.len(), 3);
//! ```
//!
//! or parsed from a JSON description such as
//! `{"a": "int", "b": ["int"], "c": [{"d?": "string"}]}`.

use crate::buffer::Writer;
use crate::error::SchemaError;
use crate::varint;
use bytes::Bytes;
use serde_json::{Map, Value as Json};
use std::collections::HashSet;
use std::fmt;

/// Kind of a schema node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    Uint,
    Int,
    Float,
    String,
    Bytes,
    Boolean,
    Json,
    ObjectId,
    Regex,
    Date,
    Object,
}

impl Kind {
    /// All basic (non-object) kinds.
    pub const BASIC: [Kind; 10] = [
        Kind::Uint,
        Kind::Int,
        Kind::Float,
        Kind::String,
        Kind::Bytes,
        Kind::Boolean,
        Kind::Json,
        Kind::ObjectId,
        Kind::Regex,
        Kind::Date,
    ];

    /// Canonical description name.
    pub fn name(&self) -> &'static str {
        match self {
            Kind::Uint => "uint",
            Kind::Int => "int",
            Kind::Float => "float",
            Kind::String => "string",
            Kind::Bytes => "bytes",
            Kind::Boolean => "boolean",
            Kind::Json => "json",
            Kind::ObjectId => "object-id",
            Kind::Regex => "regex",
            Kind::Date => "date",
            Kind::Object => "object",
        }
    }

    /// Parses a basic kind name. Objects are described structurally, never by name.
    pub fn from_name(name: &str) -> Option<Kind> {
        match name {
            "uint" => Some(Kind::Uint),
            "int" => Some(Kind::Int),
            "float" => Some(Kind::Float),
            "string" => Some(Kind::String),
            "bytes" | "Buffer" => Some(Kind::Bytes),
            "boolean" => Some(Kind::Boolean),
            "json" => Some(Kind::Json),
            "object-id" | "oid" => Some(Kind::ObjectId),
            "regex" => Some(Kind::Regex),
            "date" => Some(Kind::Date),
            _ => None,
        }
    }

    pub fn is_basic(&self) -> bool {
        !matches!(self, Kind::Object)
    }

    /// Character whose low 6 bits identify the kind in the structural hash.
    ///
    /// These are the first characters of the kind names on the wire
    /// (`Buffer` for bytes, `{object}` for objects), which keeps `bytes`
    /// and `boolean` distinct.
    fn hash_char(&self) -> u8 {
        match self {
            Kind::Uint => b'u',
            Kind::Int => b'i',
            Kind::Float => b'f',
            Kind::String => b's',
            Kind::Bytes => b'B',
            Kind::Boolean => b'b',
            Kind::Json => b'j',
            Kind::ObjectId => b'o',
            Kind::Regex => b'r',
            Kind::Date => b'd',
            Kind::Object => b'{',
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

pub(crate) type NodeId = usize;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Node {
    pub(crate) kind: Kind,
    pub(crate) fields: Vec<Slot>,
}

/// A field as stored in the arena.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Slot {
    pub(crate) name: String,
    pub(crate) node: NodeId,
    pub(crate) array: bool,
    pub(crate) optional: bool,
}

/// Field definition used to build object types.
#[derive(Debug, Clone)]
pub struct Field {
    name: String,
    ty: Type,
    array: bool,
    optional: bool,
}

impl Field {
    pub fn new(name: impl Into<String>, ty: Type) -> Self {
        Self {
            name: name.into(),
            ty,
            array: false,
            optional: false,
        }
    }

    /// Marks the field as an array of `ty`.
    pub fn array(mut self) -> Self {
        self.array = true;
        self
    }

    /// Marks the field as optional.
    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }
}

/// An immutable schema type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Type {
    pub(crate) nodes: Vec<Node>,
    pub(crate) root: NodeId,
}

impl Type {
    /// Creates a basic type.
    pub fn basic(kind: Kind) -> Result<Self, SchemaError> {
        if !kind.is_basic() {
            return Err(SchemaError::EmptyObject);
        }
        Ok(Self::leaf(kind))
    }

    fn leaf(kind: Kind) -> Self {
        Self {
            nodes: vec![Node {
                kind,
                fields: Vec::new(),
            }],
            root: 0,
        }
    }

    pub fn uint() -> Self {
        Self::leaf(Kind::Uint)
    }

    pub fn int() -> Self {
        Self::leaf(Kind::Int)
    }

    pub fn float() -> Self {
        Self::leaf(Kind::Float)
    }

    pub fn string() -> Self {
        Self::leaf(Kind::String)
    }

    pub fn bytes() -> Self {
        Self::leaf(Kind::Bytes)
    }

    pub fn boolean() -> Self {
        Self::leaf(Kind::Boolean)
    }

    pub fn json() -> Self {
        Self::leaf(Kind::Json)
    }

    pub fn object_id() -> Self {
        Self::leaf(Kind::ObjectId)
    }

    pub fn regex() -> Self {
        Self::leaf(Kind::Regex)
    }

    pub fn date() -> Self {
        Self::leaf(Kind::Date)
    }

    /// Creates an object type from its fields, in order.
    pub fn object(fields: impl IntoIterator<Item = Field>) -> Result<Self, SchemaError> {
        let mut nodes = Vec::new();
        let mut slots = Vec::new();
        let mut seen = HashSet::new();

        for field in fields {
            check_field_name(&field.name, &mut seen)?;
            let node = graft(&mut nodes, field.ty);
            slots.push(Slot {
                name: field.name,
                node,
                array: field.array,
                optional: field.optional,
            });
        }

        Self::finish_object(nodes, slots)
    }

    /// Builds an object type from fields known to be valid.
    pub(crate) fn object_unchecked(fields: impl IntoIterator<Item = Field>) -> Self {
        let mut nodes = Vec::new();
        let mut slots = Vec::new();
        for field in fields {
            let node = graft(&mut nodes, field.ty);
            slots.push(Slot {
                name: field.name,
                node,
                array: field.array,
                optional: field.optional,
            });
        }
        nodes.push(Node {
            kind: Kind::Object,
            fields: slots,
        });
        let root = nodes.len() - 1;
        Self { nodes, root }
    }

    fn finish_object(mut nodes: Vec<Node>, slots: Vec<Slot>) -> Result<Self, SchemaError> {
        if slots.is_empty() {
            return Err(SchemaError::EmptyObject);
        }
        nodes.push(Node {
            kind: Kind::Object,
            fields: slots,
        });
        let root = nodes.len() - 1;
        Ok(Self { nodes, root })
    }

    /// Parses a JSON type description.
    ///
    /// A description is a basic kind name or an object mapping field names to
    /// descriptions. A trailing `?` on a name marks the field optional and a
    /// one-element array marks it as an array.
    pub fn parse(description: &Json) -> Result<Self, SchemaError> {
        match description {
            Json::Object(map) => {
                let mut nodes = Vec::new();
                let slots = parse_fields(&mut nodes, map)?;
                Self::finish_object(nodes, slots)
            }
            _ => {
                let mut nodes = Vec::new();
                let root = parse_node(&mut nodes, description)?;
                Ok(Self { nodes, root })
            }
        }
    }

    /// Parses a JSON type description from text.
    pub fn from_json_str(description: &str) -> Result<Self, SchemaError> {
        let json: Json = serde_json::from_str(description)
            .map_err(|e| SchemaError::InvalidDescription(e.to_string()))?;
        Self::parse(&json)
    }

    /// Kind of the root node.
    pub fn kind(&self) -> Kind {
        self.nodes[self.root].kind
    }

    /// Number of fields of the root node (zero for basic types).
    pub fn len(&self) -> usize {
        self.nodes[self.root].fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Names of the root node's fields, in declaration order.
    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.nodes[self.root].fields.iter().map(|s| s.name.as_str())
    }

    pub(crate) fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    /// Renders the type back into its JSON description.
    pub fn describe(&self) -> Json {
        self.describe_node(self.root)
    }

    fn describe_node(&self, id: NodeId) -> Json {
        let node = &self.nodes[id];
        if node.kind.is_basic() {
            return Json::String(node.kind.name().to_string());
        }

        let mut map = Map::new();
        for slot in &node.fields {
            let key = if slot.optional {
                format!("{}?", slot.name)
            } else {
                slot.name.clone()
            };
            let inner = self.describe_node(slot.node);
            let value = if slot.array {
                Json::Array(vec![inner])
            } else {
                inner
            };
            map.insert(key, value);
        }
        Json::Object(map)
    }

    /// Structural hash used to check peer compatibility.
    ///
    /// One byte per node: `AOxx xxxx` where `A` is the array flag, `O` the
    /// optional flag and `x` the low 6 bits of the kind character. Object
    /// nodes are followed by their field count and their fields' nodes.
    /// Field names are not hashed.
    pub fn hash(&self) -> Bytes {
        let mut w = Writer::new();
        self.hash_node(&mut w, self.root, false, false);
        w.into_bytes()
    }

    fn hash_node(&self, w: &mut Writer, id: NodeId, array: bool, optional: bool) {
        let node = &self.nodes[id];
        let mut tag = node.kind.hash_char() & 0x3f;
        if array {
            tag |= 0x80;
        }
        if optional {
            tag |= 0x40;
        }
        w.put_u8(tag);

        if node.kind.is_basic() {
            return;
        }

        varint::write_len(w, node.fields.len());
        for slot in &node.fields {
            self.hash_node(w, slot.node, slot.array, slot.optional);
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.describe())
    }
}

/// Moves `ty`'s nodes into `nodes`, returning the new index of its root.
fn graft(nodes: &mut Vec<Node>, ty: Type) -> NodeId {
    let offset = nodes.len();
    for mut node in ty.nodes {
        for slot in &mut node.fields {
            slot.node += offset;
        }
        nodes.push(node);
    }
    ty.root + offset
}

fn check_field_name(name: &str, seen: &mut HashSet<String>) -> Result<(), SchemaError> {
    if name.is_empty() {
        return Err(SchemaError::InvalidFieldName(name.to_string()));
    }
    if !seen.insert(name.to_string()) {
        return Err(SchemaError::DuplicateField(name.to_string()));
    }
    Ok(())
}

fn parse_node(nodes: &mut Vec<Node>, description: &Json) -> Result<NodeId, SchemaError> {
    match description {
        Json::String(name) => {
            let kind =
                Kind::from_name(name).ok_or_else(|| SchemaError::UnknownKind(name.clone()))?;
            nodes.push(Node {
                kind,
                fields: Vec::new(),
            });
        }
        Json::Object(map) => {
            let slots = parse_fields(nodes, map)?;
            if slots.is_empty() {
                return Err(SchemaError::EmptyObject);
            }
            nodes.push(Node {
                kind: Kind::Object,
                fields: slots,
            });
        }
        other => return Err(SchemaError::InvalidDescription(other.to_string())),
    }
    Ok(nodes.len() - 1)
}

fn parse_fields(nodes: &mut Vec<Node>, map: &Map<String, Json>) -> Result<Vec<Slot>, SchemaError> {
    let mut slots = Vec::with_capacity(map.len());
    let mut seen = HashSet::new();

    for (key, description) in map {
        let (name, optional) = match key.strip_suffix('?') {
            Some(name) => (name, true),
            None => (key.as_str(), false),
        };
        check_field_name(name, &mut seen)?;

        let (inner, array) = match description {
            Json::Array(items) if items.len() == 1 => (&items[0], true),
            Json::Array(_) => {
                return Err(SchemaError::InvalidDescription(format!(
                    "array field {} must hold exactly one type",
                    name
                )))
            }
            other => (other, false),
        };

        let node = parse_node(nodes, inner)?;
        slots.push(Slot {
            name: name.to_string(),
            node,
            array,
            optional,
        });
    }

    Ok(slots)
}
