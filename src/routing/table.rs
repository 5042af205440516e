//! Immutable routing table snapshots.
//!
//! A table is never mutated in place: the load balancer installs a fresh
//! snapshot by swapping an `Arc`, and the forget operations return new
//! logical views. `forget` keeps the router list intact so a degraded view
//! can still rediscover.

use std::collections::HashSet;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::AccessMode;
use crate::address::ServerAddress;

/// Milliseconds since the epoch; the routing clock.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RoutingTable {
    pub database: Option<String>,
    pub routers: Vec<ServerAddress>,
    pub readers: Vec<ServerAddress>,
    pub writers: Vec<ServerAddress>,
    /// Absolute epoch milliseconds; `u64::MAX` means "never expires"
    /// (negative or overflowing TTLs saturate there).
    pub expiration_time: u64,
}

impl RoutingTable {
    /// The pre-discovery table: empty and already expired, so the first
    /// acquisition refreshes immediately.
    pub(crate) fn empty(database: Option<String>) -> Self {
        RoutingTable {
            database,
            routers: Vec::new(),
            readers: Vec::new(),
            writers: Vec::new(),
            expiration_time: 0,
        }
    }

    /// A table is stale for a mode once it expired, lost every server of
    /// that role, or has no routers left to rediscover through.
    pub(crate) fn is_stale_for(&self, mode: AccessMode, now_ms: u64) -> bool {
        if now_ms >= self.expiration_time || self.routers.is_empty() {
            return true;
        }
        match mode {
            AccessMode::Read => self.readers.is_empty(),
            AccessMode::Write => self.writers.is_empty(),
        }
    }

    /// New view without `address` among readers or writers. Routers are
    /// preserved: a dead data server may still answer routing queries, and
    /// dropping routers would erode rediscovery.
    pub(crate) fn forget(&self, address: &ServerAddress) -> RoutingTable {
        RoutingTable {
            database: self.database.clone(),
            routers: self.routers.clone(),
            readers: without(&self.readers, address),
            writers: without(&self.writers, address),
            expiration_time: self.expiration_time,
        }
    }

    /// New view without `address` among writers only; used when a writer
    /// turns out not to lead anymore.
    pub(crate) fn forget_writer(&self, address: &ServerAddress) -> RoutingTable {
        RoutingTable {
            database: self.database.clone(),
            routers: self.routers.clone(),
            readers: self.readers.clone(),
            writers: without(&self.writers, address),
            expiration_time: self.expiration_time,
        }
    }

    /// New view without `address` among routers; applied to the working
    /// copy while a refresh walks the router list.
    pub(crate) fn forget_router(&self, address: &ServerAddress) -> RoutingTable {
        RoutingTable {
            database: self.database.clone(),
            routers: without(&self.routers, address),
            readers: self.readers.clone(),
            writers: self.writers.clone(),
            expiration_time: self.expiration_time,
        }
    }

    /// Every address the table references, for diffing old vs new on
    /// install.
    pub(crate) fn all_addresses(&self) -> HashSet<ServerAddress> {
        self.routers
            .iter()
            .chain(&self.readers)
            .chain(&self.writers)
            .cloned()
            .collect()
    }
}

fn without(addresses: &[ServerAddress], gone: &ServerAddress) -> Vec<ServerAddress> {
    addresses.iter().filter(|a| *a != gone).cloned().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(name: &str) -> ServerAddress {
        ServerAddress::new(name, 7687)
    }

    fn table() -> RoutingTable {
        RoutingTable {
            database: None,
            routers: vec![addr("r1"), addr("r2")],
            readers: vec![addr("a"), addr("b")],
            writers: vec![addr("c")],
            expiration_time: 10_000,
        }
    }

    #[test]
    fn staleness_tracks_expiration_roles_and_routers() {
        let t = table();
        assert!(!t.is_stale_for(AccessMode::Read, 9_999));
        assert!(t.is_stale_for(AccessMode::Read, 10_000));
        assert!(t.is_stale_for(AccessMode::Write, 10_001));

        let no_writers = RoutingTable {
            writers: Vec::new(),
            ..table()
        };
        assert!(!no_writers.is_stale_for(AccessMode::Read, 0));
        assert!(no_writers.is_stale_for(AccessMode::Write, 0));

        let no_routers = RoutingTable {
            routers: Vec::new(),
            ..table()
        };
        assert!(no_routers.is_stale_for(AccessMode::Read, 0));
    }

    #[test]
    fn forget_removes_data_roles_but_keeps_routers() {
        let t = table().forget(&addr("a"));
        assert_eq!(t.readers, vec![addr("b")]);
        assert_eq!(t.routers, table().routers);

        let t = table().forget(&addr("c"));
        assert!(t.writers.is_empty());
        assert_eq!(t.routers, table().routers);
    }

    #[test]
    fn forget_writer_leaves_readers_alone() {
        // An address can serve both roles; only the writer entry goes.
        let both = RoutingTable {
            readers: vec![addr("x")],
            writers: vec![addr("x")],
            ..table()
        };
        let t = both.forget_writer(&addr("x"));
        assert_eq!(t.readers, vec![addr("x")]);
        assert!(t.writers.is_empty());
    }

    #[test]
    fn the_empty_table_is_stale_for_everything() {
        let t = RoutingTable::empty(None);
        assert!(t.is_stale_for(AccessMode::Read, 0));
        assert!(t.is_stale_for(AccessMode::Write, 0));
    }

    #[test]
    fn all_addresses_unions_every_role() {
        let everything = table().all_addresses();
        assert_eq!(everything.len(), 5);
        assert!(everything.contains(&addr("r1")));
        assert!(everything.contains(&addr("c")));
    }
}
