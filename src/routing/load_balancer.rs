//! Routed connection acquisition.
//!
//! Owns the current routing table and refreshes it when a session's access
//! mode finds it stale. Refreshes walk routers in order (seed first or
//! last, depending on the partition heuristic) until one produces a table;
//! the winning table is installed by handle swap and the pools of vanished
//! addresses are purged.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bolt_proto::Value;
use tracing::{debug, info};

use crate::AccessMode;
use crate::address::ServerAddress;
use crate::error::Error;
use crate::pool::{ConnectionPool, PooledConnection};
use crate::resolver::{self, AddressResolver};
use crate::routing::rediscovery::Rediscovery;
use crate::routing::table::{RoutingTable, now_millis};
use crate::routing::LoadBalancingStrategy;

pub(crate) struct LoadBalancer {
    pool: ConnectionPool,
    seed: ServerAddress,
    database: Option<String>,
    table: Mutex<Arc<RoutingTable>>,
    /// Serializes refreshes; losers of the race reuse the winner's table.
    refresh_guard: tokio::sync::Mutex<()>,
    /// Partitioned-cluster heuristic: after a zero-writer table, the next
    /// refresh starts from the seed instead of the known routers, so the
    /// driver does not stay stuck on a read-only minority partition.
    prefer_seed_router: AtomicBool,
    strategy: Box<dyn LoadBalancingStrategy>,
    resolver: Option<Arc<dyn AddressResolver>>,
    rediscovery: Rediscovery,
}

impl LoadBalancer {
    pub(crate) fn new(
        pool: ConnectionPool,
        seed: ServerAddress,
        database: Option<String>,
        routing_context: HashMap<String, Value>,
        resolver: Option<Arc<dyn AddressResolver>>,
        strategy: Box<dyn LoadBalancingStrategy>,
    ) -> Self {
        LoadBalancer {
            pool,
            table: Mutex::new(Arc::new(RoutingTable::empty(database.clone()))),
            seed,
            database,
            refresh_guard: tokio::sync::Mutex::new(()),
            prefer_seed_router: AtomicBool::new(false),
            strategy,
            resolver,
            rediscovery: Rediscovery::new(routing_context),
        }
    }

    /// Pick a server for `mode` from a fresh table and acquire a pooled
    /// connection to it.
    pub(crate) async fn acquire(&self, mode: AccessMode) -> Result<PooledConnection, Error> {
        let table = self.fresh_table(mode).await?;
        let selected = match mode {
            AccessMode::Read => self.strategy.select_reader(&table.readers),
            AccessMode::Write => self.strategy.select_writer(&table.writers),
        };
        let address = selected.ok_or_else(|| {
            Error::SessionExpired(format!(
                "no server available for {mode:?} after refreshing the routing table"
            ))
        })?;
        debug!(address = %address, mode = ?mode, "acquiring routed connection");
        self.pool.acquire(&address).await
    }

    /// Remove `address` from the data roles and purge its pool entries.
    pub(crate) fn forget(&self, address: &ServerAddress) {
        {
            let mut table = self.table.lock().unwrap();
            *table = Arc::new(table.forget(address));
        }
        self.pool.purge(address);
    }

    pub(crate) fn forget_writer(&self, address: &ServerAddress) {
        let mut table = self.table.lock().unwrap();
        *table = Arc::new(table.forget_writer(address));
    }

    #[cfg(test)]
    pub(crate) fn prefers_seed_router(&self) -> bool {
        self.prefer_seed_router.load(Ordering::Acquire)
    }

    fn snapshot(&self) -> Arc<RoutingTable> {
        Arc::clone(&self.table.lock().unwrap())
    }

    async fn fresh_table(&self, mode: AccessMode) -> Result<Arc<RoutingTable>, Error> {
        let table = self.snapshot();
        if !table.is_stale_for(mode, now_millis()) {
            return Ok(table);
        }

        let _guard = self.refresh_guard.lock().await;
        // Someone else may have refreshed while we waited for the guard.
        let table = self.snapshot();
        if !table.is_stale_for(mode, now_millis()) {
            return Ok(table);
        }
        self.refresh().await
    }

    async fn refresh(&self) -> Result<Arc<RoutingTable>, Error> {
        let old = self.snapshot();
        let mut working = (*old).clone();
        let mut attempted = HashSet::new();

        let fresh = if self.prefer_seed_router.load(Ordering::Acquire) {
            match self.lookup_via_seed(&mut attempted).await? {
                Some(table) => Some(table),
                None => self.lookup_via_routers(&mut working, &mut attempted).await?,
            }
        } else {
            match self.lookup_via_routers(&mut working, &mut attempted).await? {
                Some(table) => Some(table),
                None => self.lookup_via_seed(&mut attempted).await?,
            }
        };

        let Some(table) = fresh else {
            return Err(Error::ServiceUnavailable(format!(
                "could not acquire a routing table from any router; tried {} address(es) \
                 including the seed {}",
                attempted.len(),
                self.seed
            )));
        };

        if table.writers.is_empty() {
            info!("routing table has no writers, next refresh will prefer the seed router");
            self.prefer_seed_router.store(true, Ordering::Release);
        }

        // Addresses the cluster stopped advertising lose their pools.
        let kept = table.all_addresses();
        for gone in old.all_addresses().difference(&kept) {
            self.pool.purge(gone);
        }

        let table = Arc::new(table);
        info!(
            routers = table.routers.len(),
            readers = table.readers.len(),
            writers = table.writers.len(),
            "installed new routing table"
        );
        *self.table.lock().unwrap() = Arc::clone(&table);
        Ok(table)
    }

    /// Walk the known routers in table order; a router that yields nothing
    /// is forgotten from the working copy.
    async fn lookup_via_routers(
        &self,
        working: &mut RoutingTable,
        attempted: &mut HashSet<ServerAddress>,
    ) -> Result<Option<RoutingTable>, Error> {
        for router in working.routers.clone() {
            if !attempted.insert(router.clone()) {
                continue;
            }
            if let Some(table) = self.lookup_router(&router).await? {
                return Ok(Some(table));
            }
            *working = working.forget_router(&router);
        }
        Ok(None)
    }

    /// Expand the seed through the user resolver and DNS, then try each
    /// resulting address not already attempted.
    async fn lookup_via_seed(
        &self,
        attempted: &mut HashSet<ServerAddress>,
    ) -> Result<Option<RoutingTable>, Error> {
        let logical = match &self.resolver {
            Some(custom) => custom.resolve(&self.seed),
            None => vec![self.seed.clone()],
        };
        let mut candidates = Vec::new();
        for address in logical {
            candidates.extend(resolver::dns_resolve(&address).await);
        }

        for address in candidates {
            if !attempted.insert(address.clone()) {
                continue;
            }
            if let Some(table) = self.lookup_router(&address).await? {
                return Ok(Some(table));
            }
        }
        Ok(None)
    }

    async fn lookup_router(
        &self,
        router: &ServerAddress,
    ) -> Result<Option<RoutingTable>, Error> {
        let connection = match self.pool.acquire(router).await {
            Ok(connection) => connection,
            Err(err) => {
                debug!(router = %router, error = %err, "could not reach router");
                return Ok(None);
            }
        };
        self.rediscovery
            .lookup(connection, self.database.as_deref(), now_millis())
            .await
    }
}
