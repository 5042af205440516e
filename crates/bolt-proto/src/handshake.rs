//! Version negotiation preamble.
//!
//! The client opens with a 4-byte magic followed by four 32-bit proposed
//! versions in preference order, zero-padded. The server answers with a
//! single 32-bit word: the chosen version, zero for "no overlap", or ASCII
//! `"HTTP"` when the socket actually reached an HTTP listener.

pub const MAGIC: [u8; 4] = [0x60, 0x60, 0xB0, 0x17];

/// The reply a web server's TLS/HTTP port produces: `"HTTP"`.
pub const HTTP_SIGNATURE: u32 = 0x4854_5450;

/// Number of proposal slots in the request; unused slots are zero.
pub const PROPOSAL_SLOTS: usize = 4;

/// Encode the client half of the handshake.
///
/// Proposals beyond the fourth are dropped; missing slots pad with zero.
pub fn request(proposals: &[u32]) -> [u8; 20] {
    let mut out = [0u8; 20];
    out[..4].copy_from_slice(&MAGIC);
    for (slot, version) in proposals.iter().take(PROPOSAL_SLOTS).enumerate() {
        let at = 4 + slot * 4;
        out[at..at + 4].copy_from_slice(&version.to_be_bytes());
    }
    out
}

/// The server's 4-byte reply, decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    /// The version word the server chose (zero means no overlap; whether a
    /// nonzero word is acceptable is the caller's policy).
    Version(u32),
    /// The peer spoke HTTP: the caller connected to the wrong port.
    HttpPort,
}

pub fn parse_reply(raw: [u8; 4]) -> Reply {
    let word = u32::from_be_bytes(raw);
    if word == HTTP_SIGNATURE {
        Reply::HttpPort
    } else {
        Reply::Version(word)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_is_magic_plus_four_version_words() {
        let bytes = request(&[4, 3]);
        assert_eq!(
            bytes,
            [
                0x60, 0x60, 0xB0, 0x17, //
                0x00, 0x00, 0x00, 0x04, //
                0x00, 0x00, 0x00, 0x03, //
                0x00, 0x00, 0x00, 0x00, //
                0x00, 0x00, 0x00, 0x00,
            ]
        );
    }

    #[test]
    fn extra_proposals_are_dropped() {
        let bytes = request(&[5, 4, 3, 2, 1]);
        assert_eq!(&bytes[16..], [0x00, 0x00, 0x00, 0x02]);
    }

    #[test]
    fn http_reply_is_recognized() {
        assert_eq!(parse_reply(*b"HTTP"), Reply::HttpPort);
        assert_eq!(parse_reply([0, 0, 0, 3]), Reply::Version(3));
        assert_eq!(parse_reply([0, 0, 0, 0]), Reply::Version(0));
    }
}
