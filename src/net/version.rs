//! Negotiated protocol versions and their capability differences.

use std::fmt;

/// A protocol version the driver can speak, from oldest to newest.
///
/// The variant decides message composition: v1/v2 initialize with `INIT`
/// and recover with `ACK_FAILURE`; v3 introduces `HELLO`, `RESET`-based
/// recovery and explicit transactions; v4 adds flow-controlled `PULL`,
/// multi-database metadata and the `ROUTE` message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BoltVersion {
    V1,
    V2,
    V3,
    V4,
}

impl BoltVersion {
    /// Handshake proposals, preference order.
    pub const PROPOSED: [u32; 4] = [4, 3, 2, 1];

    pub fn from_word(word: u32) -> Option<BoltVersion> {
        match word {
            1 => Some(BoltVersion::V1),
            2 => Some(BoltVersion::V2),
            3 => Some(BoltVersion::V3),
            4 => Some(BoltVersion::V4),
            _ => None,
        }
    }

    pub fn word(self) -> u32 {
        match self {
            BoltVersion::V1 => 1,
            BoltVersion::V2 => 2,
            BoltVersion::V3 => 3,
            BoltVersion::V4 => 4,
        }
    }

    /// Failure recovery message: `ACK_FAILURE` before v3, `RESET` after.
    pub(crate) fn uses_ack_failure(self) -> bool {
        self < BoltVersion::V3
    }

    pub(crate) fn supports_run_metadata(self) -> bool {
        self >= BoltVersion::V3
    }

    pub(crate) fn supports_explicit_transactions(self) -> bool {
        self >= BoltVersion::V3
    }

    /// `PULL`/`DISCARD` carry `{n, qid}` metadata from v4 on.
    pub(crate) fn supports_flow_control(self) -> bool {
        self >= BoltVersion::V4
    }

    pub(crate) fn supports_route_message(self) -> bool {
        self >= BoltVersion::V4
    }

    pub(crate) fn supports_multi_database(self) -> bool {
        self >= BoltVersion::V4
    }
}

impl fmt::Display for BoltVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.word())
    }
}
