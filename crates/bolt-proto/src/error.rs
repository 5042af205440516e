use thiserror::Error;

/// Errors produced while encoding or decoding wire data.
///
/// Every variant is a protocol violation from the driver's point of view;
/// none of them are retryable. The driver maps them onto its own error
/// taxonomy and marks the connection broken.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtoError {
    #[error("unexpected end of input while decoding {0}")]
    UnexpectedEof(&'static str),
    #[error("unknown value marker 0x{0:02X}")]
    UnknownMarker(u8),
    #[error("unknown message signature 0x{0:02X}")]
    UnknownMessage(u8),
    #[error("map keys must be strings, found marker 0x{0:02X}")]
    InvalidMapKey(u8),
    #[error("string bytes are not valid UTF-8")]
    InvalidUtf8,
    #[error("byte arrays are not supported by the negotiated protocol version")]
    BytesUnsupported,
    #[error("{kind} of {size} items exceeds the wire format maximum")]
    TooLarge { kind: &'static str, size: usize },
    #[error("malformed {entity} structure: {reason}")]
    MalformedStruct {
        entity: &'static str,
        reason: String,
    },
    #[error("path index {0} is out of range")]
    PathIndexOutOfRange(i64),
    #[error("chunk stream ended in the middle of a message")]
    TruncatedMessage,
}
