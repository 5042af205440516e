//! Byte-level message framing.
//!
//! A message travels as a sequence of chunks, each a 16-bit big-endian
//! length prefix followed by that many payload bytes. A zero-length chunk
//! terminates the message. Zero-length chunks between messages are no-ops
//! (keep-alives) and are skipped on receipt.

use std::collections::VecDeque;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::ProtoError;

/// Largest payload one chunk can carry.
pub const MAX_CHUNK_PAYLOAD: usize = 0xFFFF;

// ---------------------------------------------------------------------------
// Chunker
// ---------------------------------------------------------------------------

/// Splits outbound messages into chunks.
///
/// Payload accumulates via [`Chunker::write`] until [`Chunker::message_boundary`]
/// closes the message; the framed bytes are handed to the transport with
/// [`Chunker::take`].
#[derive(Debug, Default)]
pub struct Chunker {
    /// Framed chunks ready for the wire.
    framed: BytesMut,
    /// Payload of the message currently being written.
    message: BytesMut,
}

impl Chunker {
    pub fn new() -> Self {
        Chunker::default()
    }

    /// Append payload to the current message.
    pub fn write(&mut self, payload: &[u8]) {
        self.message.extend_from_slice(payload);
    }

    /// Close the current message: split its payload into chunks and append
    /// the terminator.
    pub fn message_boundary(&mut self) {
        for chunk in self.message.chunks(MAX_CHUNK_PAYLOAD) {
            self.framed.put_u16(chunk.len() as u16);
            self.framed.extend_from_slice(chunk);
        }
        self.message.clear();
        self.framed.put_u16(0);
    }

    /// Take everything framed so far.
    pub fn take(&mut self) -> Bytes {
        self.framed.split().freeze()
    }

    pub fn has_framed(&self) -> bool {
        !self.framed.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Dechunker
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum DechunkState {
    /// Waiting for a length prefix; the first header byte may have arrived
    /// in an earlier read.
    Header { first: Option<u8> },
    /// Inside a chunk body.
    Body { remaining: usize },
}

/// Reassembles inbound bytes into complete message payloads.
///
/// Sans-IO: the read loop feeds whatever the socket produced and drains
/// complete messages. Partial chunks and headers split across reads are
/// handled transparently.
#[derive(Debug)]
pub struct Dechunker {
    state: DechunkState,
    message: BytesMut,
    complete: VecDeque<Bytes>,
}

impl Default for Dechunker {
    fn default() -> Self {
        Dechunker {
            state: DechunkState::Header { first: None },
            message: BytesMut::new(),
            complete: VecDeque::new(),
        }
    }
}

impl Dechunker {
    pub fn new() -> Self {
        Dechunker::default()
    }

    /// Consume a read's worth of bytes.
    pub fn feed(&mut self, mut data: &[u8]) {
        while data.has_remaining() {
            match self.state {
                DechunkState::Header { first: None } => {
                    let hi = data.get_u8();
                    self.state = DechunkState::Header { first: Some(hi) };
                }
                DechunkState::Header { first: Some(hi) } => {
                    let lo = data.get_u8();
                    let len = usize::from(u16::from_be_bytes([hi, lo]));
                    if len == 0 {
                        if !self.message.is_empty() {
                            self.complete.push_back(self.message.split().freeze());
                        }
                        // Empty message: a no-op chunk, skip.
                        self.state = DechunkState::Header { first: None };
                    } else {
                        self.state = DechunkState::Body { remaining: len };
                    }
                }
                DechunkState::Body { remaining } => {
                    let take = remaining.min(data.remaining());
                    self.message.extend_from_slice(&data[..take]);
                    data.advance(take);
                    if take == remaining {
                        self.state = DechunkState::Header { first: None };
                    } else {
                        self.state = DechunkState::Body {
                            remaining: remaining - take,
                        };
                    }
                }
            }
        }
    }

    /// Pop the next fully reassembled message payload, if any.
    pub fn next_message(&mut self) -> Option<Bytes> {
        self.complete.pop_front()
    }

    /// True when the stream stopped mid-message; EOF here is a framing
    /// error, not a clean close.
    pub fn mid_message(&self) -> bool {
        !self.message.is_empty()
            || matches!(
                self.state,
                DechunkState::Body { .. } | DechunkState::Header { first: Some(_) }
            )
    }

    /// The error the engine reports when the peer closed mid-message.
    pub fn truncation_error() -> ProtoError {
        ProtoError::TruncatedMessage
    }
}
