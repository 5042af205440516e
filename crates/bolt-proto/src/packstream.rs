//! Binary value codec.
//!
//! Tag/length encoding with single-byte markers. Sizes are encoded by tag
//! class: "tiny" values pack the size into the marker's low nibble, larger
//! values use an explicit 8-, 16- or 32-bit big-endian size after the
//! marker. Integers in `[-16, 127]` collapse to a single byte.

use std::collections::HashMap;

use bytes::{Buf, BufMut, BytesMut};

use crate::ProtoError;
use crate::graph::{Node, Path, Relationship, UnboundRelationship, signature};
use crate::value::{Structure, Value};

pub mod marker {
    pub const TINY_STRING: u8 = 0x80;
    pub const TINY_LIST: u8 = 0x90;
    pub const TINY_MAP: u8 = 0xA0;
    pub const TINY_STRUCT: u8 = 0xB0;

    pub const NULL: u8 = 0xC0;
    pub const FLOAT_64: u8 = 0xC1;
    pub const FALSE: u8 = 0xC2;
    pub const TRUE: u8 = 0xC3;

    pub const INT_8: u8 = 0xC8;
    pub const INT_16: u8 = 0xC9;
    pub const INT_32: u8 = 0xCA;
    pub const INT_64: u8 = 0xCB;

    pub const BYTES_8: u8 = 0xCC;
    pub const BYTES_16: u8 = 0xCD;
    pub const BYTES_32: u8 = 0xCE;

    pub const STRING_8: u8 = 0xD0;
    pub const STRING_16: u8 = 0xD1;
    pub const STRING_32: u8 = 0xD2;

    pub const LIST_8: u8 = 0xD4;
    pub const LIST_16: u8 = 0xD5;
    pub const LIST_32: u8 = 0xD6;

    pub const MAP_8: u8 = 0xD8;
    pub const MAP_16: u8 = 0xD9;
    pub const MAP_32: u8 = 0xDA;

    pub const STRUCT_8: u8 = 0xDC;
    pub const STRUCT_16: u8 = 0xDD;
}

const TINY_SIZE_LIMIT: usize = 0x10;

/// Largest integer magnitude a 64-bit float can represent exactly.
const MAX_SAFE_INTEGER: u64 = 1 << 53;

// ---------------------------------------------------------------------------
// Packer
// ---------------------------------------------------------------------------

/// Serializes values into a caller-owned buffer.
///
/// Byte-array support is negotiated per connection: servers predating the
/// feature reject the markers, so the packer refuses to emit them when the
/// flag is off.
pub struct Packer<'a> {
    buf: &'a mut BytesMut,
    byte_arrays: bool,
}

impl<'a> Packer<'a> {
    pub fn new(buf: &'a mut BytesMut) -> Self {
        Packer {
            buf,
            byte_arrays: true,
        }
    }

    pub fn byte_array_support(mut self, enabled: bool) -> Self {
        self.byte_arrays = enabled;
        self
    }

    pub fn pack(&mut self, value: &Value) -> Result<(), ProtoError> {
        match value {
            Value::Null => {
                self.buf.put_u8(marker::NULL);
                Ok(())
            }
            Value::Bool(true) => {
                self.buf.put_u8(marker::TRUE);
                Ok(())
            }
            Value::Bool(false) => {
                self.buf.put_u8(marker::FALSE);
                Ok(())
            }
            Value::Int(i) => {
                self.pack_int(*i);
                Ok(())
            }
            Value::Float(f) => {
                self.buf.put_u8(marker::FLOAT_64);
                self.buf.put_u64(f.to_bits());
                Ok(())
            }
            Value::Bytes(b) => self.pack_bytes(b),
            Value::String(s) => self.pack_string(s),
            Value::List(items) => {
                self.pack_list_header(items.len())?;
                for item in items {
                    self.pack(item)?;
                }
                Ok(())
            }
            Value::Map(entries) => {
                self.pack_map_header(entries.len())?;
                for (key, item) in entries {
                    self.pack_string(key)?;
                    self.pack(item)?;
                }
                Ok(())
            }
            Value::Node(n) => self.pack_node(n),
            Value::Relationship(r) => self.pack_relationship(r),
            Value::UnboundRelationship(r) => self.pack_unbound(r),
            Value::Path(p) => self.pack_path(p),
            Value::Structure(s) => {
                self.pack_struct_header(s.tag, s.fields.len())?;
                for field in &s.fields {
                    self.pack(field)?;
                }
                Ok(())
            }
        }
    }

    pub fn pack_int(&mut self, value: i64) {
        if (-16..=127).contains(&value) {
            self.buf.put_i8(value as i8);
        } else if i64::from(value as i8) == value {
            self.buf.put_u8(marker::INT_8);
            self.buf.put_i8(value as i8);
        } else if i64::from(value as i16) == value {
            self.buf.put_u8(marker::INT_16);
            self.buf.put_i16(value as i16);
        } else if i64::from(value as i32) == value {
            self.buf.put_u8(marker::INT_32);
            self.buf.put_i32(value as i32);
        } else {
            self.buf.put_u8(marker::INT_64);
            self.buf.put_i64(value);
        }
    }

    pub fn pack_string(&mut self, value: &str) -> Result<(), ProtoError> {
        self.pack_header("string", marker::TINY_STRING, marker::STRING_8, value.len())?;
        self.buf.put_slice(value.as_bytes());
        Ok(())
    }

    pub fn pack_bytes(&mut self, value: &[u8]) -> Result<(), ProtoError> {
        if !self.byte_arrays {
            return Err(ProtoError::BytesUnsupported);
        }
        // No tiny class for byte arrays.
        if let Ok(len) = u8::try_from(value.len()) {
            self.buf.put_u8(marker::BYTES_8);
            self.buf.put_u8(len);
        } else if let Ok(len) = u16::try_from(value.len()) {
            self.buf.put_u8(marker::BYTES_16);
            self.buf.put_u16(len);
        } else if let Ok(len) = u32::try_from(value.len()) {
            self.buf.put_u8(marker::BYTES_32);
            self.buf.put_u32(len);
        } else {
            return Err(ProtoError::TooLarge {
                kind: "byte array",
                size: value.len(),
            });
        }
        self.buf.put_slice(value);
        Ok(())
    }

    pub fn pack_list_header(&mut self, size: usize) -> Result<(), ProtoError> {
        self.pack_header("list", marker::TINY_LIST, marker::LIST_8, size)
    }

    pub fn pack_map_header(&mut self, size: usize) -> Result<(), ProtoError> {
        self.pack_header("map", marker::TINY_MAP, marker::MAP_8, size)
    }

    pub fn pack_struct_header(&mut self, tag: u8, size: usize) -> Result<(), ProtoError> {
        if size < TINY_SIZE_LIMIT {
            self.buf.put_u8(marker::TINY_STRUCT | size as u8);
        } else if let Ok(len) = u8::try_from(size) {
            self.buf.put_u8(marker::STRUCT_8);
            self.buf.put_u8(len);
        } else if let Ok(len) = u16::try_from(size) {
            self.buf.put_u8(marker::STRUCT_16);
            self.buf.put_u16(len);
        } else {
            return Err(ProtoError::TooLarge {
                kind: "structure",
                size,
            });
        }
        self.buf.put_u8(tag);
        Ok(())
    }

    /// Shared header logic for the four-class composites. `base_8` is the
    /// 8-bit marker; the 16- and 32-bit markers follow it numerically.
    fn pack_header(
        &mut self,
        kind: &'static str,
        tiny: u8,
        base_8: u8,
        size: usize,
    ) -> Result<(), ProtoError> {
        if size < TINY_SIZE_LIMIT {
            self.buf.put_u8(tiny | size as u8);
        } else if let Ok(len) = u8::try_from(size) {
            self.buf.put_u8(base_8);
            self.buf.put_u8(len);
        } else if let Ok(len) = u16::try_from(size) {
            self.buf.put_u8(base_8 + 1);
            self.buf.put_u16(len);
        } else if let Ok(len) = u32::try_from(size) {
            self.buf.put_u8(base_8 + 2);
            self.buf.put_u32(len);
        } else {
            return Err(ProtoError::TooLarge { kind, size });
        }
        Ok(())
    }

    fn pack_node(&mut self, node: &Node) -> Result<(), ProtoError> {
        self.pack_struct_header(signature::NODE, 3)?;
        self.pack_int(node.id);
        self.pack_list_header(node.labels.len())?;
        for label in &node.labels {
            self.pack_string(label)?;
        }
        self.pack_property_map(&node.properties)
    }

    fn pack_relationship(&mut self, rel: &Relationship) -> Result<(), ProtoError> {
        self.pack_struct_header(signature::RELATIONSHIP, 5)?;
        self.pack_int(rel.id);
        self.pack_int(rel.start_node_id);
        self.pack_int(rel.end_node_id);
        self.pack_string(&rel.rel_type)?;
        self.pack_property_map(&rel.properties)
    }

    fn pack_unbound(&mut self, rel: &UnboundRelationship) -> Result<(), ProtoError> {
        self.pack_struct_header(signature::UNBOUND_RELATIONSHIP, 3)?;
        self.pack_int(rel.id);
        self.pack_string(&rel.rel_type)?;
        self.pack_property_map(&rel.properties)
    }

    fn pack_path(&mut self, path: &Path) -> Result<(), ProtoError> {
        self.pack_struct_header(signature::PATH, 3)?;
        self.pack_list_header(path.nodes.len())?;
        for node in &path.nodes {
            self.pack_node(node)?;
        }
        self.pack_list_header(path.relationships.len())?;
        for rel in &path.relationships {
            self.pack_unbound(rel)?;
        }
        self.pack_list_header(path.indices.len())?;
        for index in &path.indices {
            self.pack_int(*index);
        }
        Ok(())
    }

    fn pack_property_map(&mut self, map: &HashMap<String, Value>) -> Result<(), ProtoError> {
        self.pack_map_header(map.len())?;
        for (key, value) in map {
            self.pack_string(key)?;
            self.pack(value)?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Unpacker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default)]
pub struct UnpackOptions {
    /// Decode integers to `Value::Float`. Values whose magnitude exceeds
    /// 2^53 collapse to the matching infinity.
    pub lossy_integers: bool,
}

/// Deserializes one or more values from a byte slice.
pub struct Unpacker<'a> {
    buf: &'a [u8],
    options: UnpackOptions,
}

impl<'a> Unpacker<'a> {
    pub fn new(buf: &'a [u8], options: UnpackOptions) -> Self {
        Unpacker { buf, options }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    pub fn unpack(&mut self) -> Result<Value, ProtoError> {
        let m = self.take_u8("value marker")?;
        match m {
            0x00..=0x7F => Ok(self.int_value(i64::from(m))),
            0xF0..=0xFF => Ok(self.int_value(i64::from(m as i8))),
            marker::NULL => Ok(Value::Null),
            marker::TRUE => Ok(Value::Bool(true)),
            marker::FALSE => Ok(Value::Bool(false)),
            marker::FLOAT_64 => {
                self.need(8, "float")?;
                Ok(Value::Float(f64::from_bits(self.buf.get_u64())))
            }
            marker::INT_8 => {
                self.need(1, "int8")?;
                let v = i64::from(self.buf.get_i8());
                Ok(self.int_value(v))
            }
            marker::INT_16 => {
                self.need(2, "int16")?;
                let v = i64::from(self.buf.get_i16());
                Ok(self.int_value(v))
            }
            marker::INT_32 => {
                self.need(4, "int32")?;
                let v = i64::from(self.buf.get_i32());
                Ok(self.int_value(v))
            }
            marker::INT_64 => {
                self.need(8, "int64")?;
                let v = self.buf.get_i64();
                Ok(self.int_value(v))
            }
            marker::BYTES_8 | marker::BYTES_16 | marker::BYTES_32 => {
                let len = self.take_size(m - marker::BYTES_8, "byte array size")?;
                self.need(len, "byte array")?;
                Ok(Value::Bytes(self.take_vec(len)))
            }
            0x80..=0x8F => self.unpack_string((m & 0x0F) as usize).map(Value::String),
            marker::STRING_8 | marker::STRING_16 | marker::STRING_32 => {
                let len = self.take_size(m - marker::STRING_8, "string size")?;
                self.unpack_string(len).map(Value::String)
            }
            0x90..=0x9F => self.unpack_list((m & 0x0F) as usize),
            marker::LIST_8 | marker::LIST_16 | marker::LIST_32 => {
                let len = self.take_size(m - marker::LIST_8, "list size")?;
                self.unpack_list(len)
            }
            0xA0..=0xAF => self.unpack_map((m & 0x0F) as usize),
            marker::MAP_8 | marker::MAP_16 | marker::MAP_32 => {
                let len = self.take_size(m - marker::MAP_8, "map size")?;
                self.unpack_map(len)
            }
            0xB0..=0xBF => self.unpack_struct((m & 0x0F) as usize),
            marker::STRUCT_8 => {
                self.need(1, "struct size")?;
                let len = self.buf.get_u8() as usize;
                self.unpack_struct(len)
            }
            marker::STRUCT_16 => {
                self.need(2, "struct size")?;
                let len = self.buf.get_u16() as usize;
                self.unpack_struct(len)
            }
            _ => Err(ProtoError::UnknownMarker(m)),
        }
    }

    /// Read a structure header and return `(signature, field_count)`
    /// without consuming the fields.
    pub fn unpack_struct_header(&mut self) -> Result<(u8, usize), ProtoError> {
        let m = self.take_u8("struct marker")?;
        let size = match m {
            0xB0..=0xBF => (m & 0x0F) as usize,
            marker::STRUCT_8 => {
                self.need(1, "struct size")?;
                self.buf.get_u8() as usize
            }
            marker::STRUCT_16 => {
                self.need(2, "struct size")?;
                self.buf.get_u16() as usize
            }
            _ => return Err(ProtoError::UnknownMarker(m)),
        };
        let tag = self.take_u8("struct signature")?;
        Ok((tag, size))
    }

    // -- scalar helpers --

    fn int_value(&self, v: i64) -> Value {
        if self.options.lossy_integers {
            if v.unsigned_abs() > MAX_SAFE_INTEGER {
                Value::Float(if v < 0 {
                    f64::NEG_INFINITY
                } else {
                    f64::INFINITY
                })
            } else {
                Value::Float(v as f64)
            }
        } else {
            Value::Int(v)
        }
    }

    /// Explicit size field: `width_class` 0/1/2 selects 8/16/32-bit.
    fn take_size(&mut self, width_class: u8, what: &'static str) -> Result<usize, ProtoError> {
        match width_class {
            0 => {
                self.need(1, what)?;
                Ok(self.buf.get_u8() as usize)
            }
            1 => {
                self.need(2, what)?;
                Ok(self.buf.get_u16() as usize)
            }
            _ => {
                self.need(4, what)?;
                Ok(self.buf.get_u32() as usize)
            }
        }
    }

    fn unpack_string(&mut self, len: usize) -> Result<String, ProtoError> {
        self.need(len, "string")?;
        String::from_utf8(self.take_vec(len)).map_err(|_| ProtoError::InvalidUtf8)
    }

    fn unpack_list(&mut self, len: usize) -> Result<Value, ProtoError> {
        let mut items = Vec::with_capacity(len.min(1024));
        for _ in 0..len {
            items.push(self.unpack()?);
        }
        Ok(Value::List(items))
    }

    fn unpack_map(&mut self, len: usize) -> Result<Value, ProtoError> {
        let mut entries = HashMap::with_capacity(len.min(1024));
        for _ in 0..len {
            let key = self.unpack_map_key()?;
            let value = self.unpack()?;
            entries.insert(key, value);
        }
        Ok(Value::Map(entries))
    }

    fn unpack_map_key(&mut self) -> Result<String, ProtoError> {
        let m = self.take_u8("map key marker")?;
        let len = match m {
            0x80..=0x8F => (m & 0x0F) as usize,
            marker::STRING_8 | marker::STRING_16 | marker::STRING_32 => {
                self.take_size(m - marker::STRING_8, "map key size")?
            }
            _ => return Err(ProtoError::InvalidMapKey(m)),
        };
        self.unpack_string(len)
    }

    fn unpack_struct(&mut self, size: usize) -> Result<Value, ProtoError> {
        let tag = self.take_u8("struct signature")?;
        let mut fields = Vec::with_capacity(size.min(64));
        for _ in 0..size {
            fields.push(self.unpack()?);
        }
        self.hydrate_struct(tag, fields)
    }

    /// Dispatch a known signature to its entity deserializer; anything else
    /// stays opaque.
    fn hydrate_struct(&self, tag: u8, fields: Vec<Value>) -> Result<Value, ProtoError> {
        match tag {
            signature::NODE => node_from_fields(fields).map(Value::Node),
            signature::RELATIONSHIP => relationship_from_fields(fields).map(Value::Relationship),
            signature::UNBOUND_RELATIONSHIP => {
                unbound_from_fields(fields).map(Value::UnboundRelationship)
            }
            signature::PATH => path_from_fields(fields).map(Value::Path),
            _ => Ok(Value::Structure(Structure { tag, fields })),
        }
    }

    // -- buffer primitives --

    fn need(&self, n: usize, what: &'static str) -> Result<(), ProtoError> {
        if self.buf.remaining() < n {
            return Err(ProtoError::UnexpectedEof(what));
        }
        Ok(())
    }

    fn take_u8(&mut self, what: &'static str) -> Result<u8, ProtoError> {
        self.need(1, what)?;
        Ok(self.buf.get_u8())
    }

    fn take_vec(&mut self, len: usize) -> Vec<u8> {
        let mut out = vec![0u8; len];
        self.buf.copy_to_slice(&mut out);
        out
    }
}

// ---------------------------------------------------------------------------
// Entity deserializers
// ---------------------------------------------------------------------------

fn malformed(entity: &'static str, reason: impl Into<String>) -> ProtoError {
    ProtoError::MalformedStruct {
        entity,
        reason: reason.into(),
    }
}

fn node_from_fields(fields: Vec<Value>) -> Result<Node, ProtoError> {
    let mut fields = fields.into_iter();
    let (Some(id), Some(labels), Some(properties), None) =
        (fields.next(), fields.next(), fields.next(), fields.next())
    else {
        return Err(malformed("node", "expected 3 fields"));
    };
    Ok(Node {
        id: id.as_int().ok_or_else(|| malformed("node", "id"))?,
        labels: string_list(labels).ok_or_else(|| malformed("node", "labels"))?,
        properties: properties
            .into_map()
            .ok_or_else(|| malformed("node", "properties"))?,
    })
}

fn relationship_from_fields(fields: Vec<Value>) -> Result<Relationship, ProtoError> {
    let mut fields = fields.into_iter();
    let (Some(id), Some(start), Some(end), Some(rel_type), Some(properties), None) = (
        fields.next(),
        fields.next(),
        fields.next(),
        fields.next(),
        fields.next(),
        fields.next(),
    ) else {
        return Err(malformed("relationship", "expected 5 fields"));
    };
    Ok(Relationship {
        id: id.as_int().ok_or_else(|| malformed("relationship", "id"))?,
        start_node_id: start
            .as_int()
            .ok_or_else(|| malformed("relationship", "start node id"))?,
        end_node_id: end
            .as_int()
            .ok_or_else(|| malformed("relationship", "end node id"))?,
        rel_type: rel_type
            .into_string()
            .ok_or_else(|| malformed("relationship", "type"))?,
        properties: properties
            .into_map()
            .ok_or_else(|| malformed("relationship", "properties"))?,
    })
}

fn unbound_from_fields(fields: Vec<Value>) -> Result<UnboundRelationship, ProtoError> {
    let mut fields = fields.into_iter();
    let (Some(id), Some(rel_type), Some(properties), None) =
        (fields.next(), fields.next(), fields.next(), fields.next())
    else {
        return Err(malformed("unbound relationship", "expected 3 fields"));
    };
    Ok(UnboundRelationship {
        id: id
            .as_int()
            .ok_or_else(|| malformed("unbound relationship", "id"))?,
        rel_type: rel_type
            .into_string()
            .ok_or_else(|| malformed("unbound relationship", "type"))?,
        properties: properties
            .into_map()
            .ok_or_else(|| malformed("unbound relationship", "properties"))?,
    })
}

fn path_from_fields(fields: Vec<Value>) -> Result<Path, ProtoError> {
    let mut fields = fields.into_iter();
    let (Some(nodes), Some(relationships), Some(indices), None) =
        (fields.next(), fields.next(), fields.next(), fields.next())
    else {
        return Err(malformed("path", "expected 3 fields"));
    };

    let nodes = nodes
        .into_list()
        .ok_or_else(|| malformed("path", "node list"))?
        .into_iter()
        .map(|v| match v {
            Value::Node(n) => Ok(n),
            _ => Err(malformed("path", "node list holds a non-node")),
        })
        .collect::<Result<Vec<_>, _>>()?;

    let relationships = relationships
        .into_list()
        .ok_or_else(|| malformed("path", "relationship list"))?
        .into_iter()
        .map(|v| match v {
            Value::UnboundRelationship(r) => Ok(r),
            _ => Err(malformed("path", "relationship list holds a non-relationship")),
        })
        .collect::<Result<Vec<_>, _>>()?;

    let indices = indices
        .into_list()
        .ok_or_else(|| malformed("path", "index list"))?
        .into_iter()
        .map(|v| v.as_int().ok_or_else(|| malformed("path", "index list holds a non-integer")))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Path {
        nodes,
        relationships,
        indices,
    })
}

fn string_list(value: Value) -> Option<Vec<String>> {
    value
        .into_list()?
        .into_iter()
        .map(Value::into_string)
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
