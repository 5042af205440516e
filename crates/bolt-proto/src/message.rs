//! Message signatures plus message-level encode/decode.
//!
//! Requests are structures whose signature byte identifies the operation;
//! responses are structures carrying at most one field. Which signatures a
//! connection may send depends on the negotiated version; that policy
//! lives in the driver, not here.

use std::collections::HashMap;

use bytes::BytesMut;

use crate::ProtoError;
use crate::packstream::{Packer, UnpackOptions, Unpacker};
use crate::value::Value;

pub mod request {
    pub const INIT: u8 = 0x01; // HELLO from protocol v3 on
    pub const ACK_FAILURE: u8 = 0x0E;
    pub const RESET: u8 = 0x0F;
    pub const RUN: u8 = 0x10;
    pub const BEGIN: u8 = 0x11;
    pub const COMMIT: u8 = 0x12;
    pub const ROLLBACK: u8 = 0x13;
    pub const DISCARD_ALL: u8 = 0x2F;
    pub const PULL_ALL: u8 = 0x3F;
    pub const ROUTE: u8 = 0x66;
}

pub mod response {
    pub const SUCCESS: u8 = 0x70;
    pub const RECORD: u8 = 0x71;
    pub const IGNORED: u8 = 0x7E;
    pub const FAILURE: u8 = 0x7F;
}

/// Serialize one request message (signature + fields) into `out`.
pub fn encode_request(
    signature: u8,
    fields: &[Value],
    out: &mut BytesMut,
    byte_arrays: bool,
) -> Result<(), ProtoError> {
    let mut packer = Packer::new(out).byte_array_support(byte_arrays);
    packer.pack_struct_header(signature, fields.len())?;
    for field in fields {
        packer.pack(field)?;
    }
    Ok(())
}

/// A decoded server response message.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Success(HashMap<String, Value>),
    Record(Vec<Value>),
    Ignored,
    Failure(HashMap<String, Value>),
}

impl Response {
    /// Decode one dechunked message payload.
    ///
    /// Unknown signatures are an error: the engine treats them as fatal for
    /// the connection.
    pub fn decode(payload: &[u8], options: UnpackOptions) -> Result<Response, ProtoError> {
        let mut unpacker = Unpacker::new(payload, options);
        let (signature, field_count) = unpacker.unpack_struct_header()?;
        let mut fields = Vec::with_capacity(field_count.min(16));
        for _ in 0..field_count {
            fields.push(unpacker.unpack()?);
        }
        let mut fields = fields.into_iter();

        match signature {
            response::SUCCESS => Ok(Response::Success(
                fields.next().and_then(Value::into_map).unwrap_or_default(),
            )),
            response::RECORD => {
                let values = fields
                    .next()
                    .and_then(Value::into_list)
                    .ok_or(ProtoError::MalformedStruct {
                        entity: "record",
                        reason: "missing field list".to_owned(),
                    })?;
                Ok(Response::Record(values))
            }
            response::IGNORED => Ok(Response::Ignored),
            response::FAILURE => Ok(Response::Failure(
                fields.next().and_then(Value::into_map).unwrap_or_default(),
            )),
            other => Err(ProtoError::UnknownMessage(other)),
        }
    }
}
