//! Per-endpoint connection pools.
//!
//! One pool instance serves every endpoint, keyed by server address; each
//! key has an independent idle list, active counter and waiter queue. The
//! map lock is short-held and never spans I/O: connects run outside it, and
//! connections to destroy are collected under the lock and closed after it
//! is released.
//!
//! Handles: the pool hands out [`PooledConnection`]s carrying only the key
//! and a weak pool reference. Dropping a handle releases the connection;
//! once the pool itself is gone a handle degrades to destroy-on-release.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::oneshot;
use tracing::debug;

use crate::address::ServerAddress;
use crate::config::{AuthToken, ResolvedConfig};
use crate::error::Error;
use crate::net::connection::Connection;

// ---------------------------------------------------------------------------
// Connector
// ---------------------------------------------------------------------------

/// The create capability: opens, handshakes and initializes connections.
pub(crate) struct Connector {
    config: Arc<ResolvedConfig>,
    auth: AuthToken,
}

impl Connector {
    pub(crate) fn new(config: Arc<ResolvedConfig>, auth: AuthToken) -> Self {
        Connector { config, auth }
    }

    async fn establish(&self, address: &ServerAddress) -> Result<Connection, Error> {
        let connection = Connection::establish(address, &self.config, &self.auth).await?;
        if let Err(err) = connection.initialized().await {
            connection.close();
            return Err(err);
        }
        Ok(connection)
    }
}

// ---------------------------------------------------------------------------
// Pool
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub(crate) struct ConnectionPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    connector: Connector,
    config: Arc<ResolvedConfig>,
    state: Mutex<HashMap<ServerAddress, KeyState>>,
    waiter_ids: AtomicU64,
}

#[derive(Default)]
struct KeyState {
    idle: VecDeque<Connection>,
    active: usize,
    waiters: VecDeque<Waiter>,
}

/// A parked acquisition; resolved by a release, a freed capacity slot, or
/// its own deadline.
struct Waiter {
    id: u64,
    tx: oneshot::Sender<Result<Connection, Error>>,
}

enum Plan {
    Ready(Connection),
    Create,
    Wait(u64, oneshot::Receiver<Result<Connection, Error>>),
}

impl ConnectionPool {
    pub(crate) fn new(config: Arc<ResolvedConfig>, auth: AuthToken) -> Self {
        ConnectionPool {
            inner: Arc::new(PoolInner {
                connector: Connector::new(Arc::clone(&config), auth),
                config,
                state: Mutex::new(HashMap::new()),
                waiter_ids: AtomicU64::new(0),
            }),
        }
    }

    /// Acquire a connection for `address`: reuse a valid idle one, create
    /// when below capacity, otherwise park until a slot frees or the
    /// acquisition deadline fires.
    pub(crate) async fn acquire(&self, address: &ServerAddress) -> Result<PooledConnection, Error> {
        let mut dead = Vec::new();
        let plan = {
            let mut state = self.inner.state.lock().unwrap();
            let key = state.entry(address.clone()).or_default();

            let mut reusable = None;
            while let Some(conn) = key.idle.pop_front() {
                if conn.is_valid(self.inner.config.max_connection_lifetime) {
                    reusable = Some(conn);
                    break;
                }
                dead.push(conn);
            }

            match reusable {
                Some(conn) => {
                    key.active += 1;
                    Plan::Ready(conn)
                }
                None if key.active < self.inner.config.max_pool_size => {
                    key.active += 1;
                    Plan::Create
                }
                None => {
                    let id = self.inner.waiter_ids.fetch_add(1, Ordering::Relaxed);
                    let (tx, rx) = oneshot::channel();
                    key.waiters.push_back(Waiter { id, tx });
                    Plan::Wait(id, rx)
                }
            }
        };
        for conn in dead {
            conn.close();
        }

        match plan {
            Plan::Ready(conn) => Ok(self.wrap(conn, address)),
            Plan::Create => match self.inner.connector.establish(address).await {
                Ok(conn) => Ok(self.wrap(conn, address)),
                Err(err) => {
                    abandon_create(&self.inner, address);
                    Err(err)
                }
            },
            Plan::Wait(id, rx) => self.wait_for_slot(address, id, rx).await,
        }
    }

    async fn wait_for_slot(
        &self,
        address: &ServerAddress,
        id: u64,
        mut rx: oneshot::Receiver<Result<Connection, Error>>,
    ) -> Result<PooledConnection, Error> {
        let timeout_ms = self.inner.config.acquisition_timeout_ms;
        let deadline = tokio::time::sleep(self.inner.config.acquisition_timeout);
        tokio::pin!(deadline);

        tokio::select! {
            outcome = &mut rx => match outcome {
                Ok(Ok(conn)) => Ok(self.wrap(conn, address)),
                Ok(Err(err)) => Err(err),
                Err(_) => Err(Error::ServiceUnavailable(format!(
                    "connection pool for {address} was shut down"
                ))),
            },
            () = &mut deadline => {
                let removed = {
                    let mut state = self.inner.state.lock().unwrap();
                    match state.get_mut(address) {
                        Some(key) => {
                            let before = key.waiters.len();
                            key.waiters.retain(|w| w.id != id);
                            key.waiters.len() != before
                        }
                        None => false,
                    }
                };
                if removed {
                    return Err(Error::AcquisitionTimeout(timeout_ms));
                }
                // Someone popped this waiter already: either the result is
                // in flight on the channel, or a create task is still
                // working for it. Only the first case counts as success
                // within the deadline.
                match rx.try_recv() {
                    Ok(Ok(conn)) => Ok(self.wrap(conn, address)),
                    Ok(Err(err)) => Err(err),
                    Err(_) => Err(Error::AcquisitionTimeout(timeout_ms)),
                }
            }
        }
    }

    /// Destroy all idle connections for `address` and drop the key.
    /// In-flight connections are not touched; they are destroyed on their
    /// next release because the key is gone.
    pub(crate) fn purge(&self, address: &ServerAddress) {
        let removed = {
            let mut state = self.inner.state.lock().unwrap();
            state.remove(address)
        };
        let Some(key) = removed else { return };
        debug!(address = %address, idle = key.idle.len(), "purging pool entries");
        for conn in key.idle {
            conn.close();
        }
        for waiter in key.waiters {
            let _ = waiter.tx.send(Err(Error::ServiceUnavailable(format!(
                "connections to {address} were purged"
            ))));
        }
    }

    pub(crate) fn purge_all(&self) {
        let addresses: Vec<_> = {
            let state = self.inner.state.lock().unwrap();
            state.keys().cloned().collect()
        };
        for address in addresses {
            self.purge(&address);
        }
    }

    fn wrap(&self, connection: Connection, address: &ServerAddress) -> PooledConnection {
        PooledConnection {
            connection: Some(connection),
            address: address.clone(),
            pool: Arc::downgrade(&self.inner),
        }
    }

    #[cfg(test)]
    pub(crate) fn active_count(&self, address: &ServerAddress) -> usize {
        let state = self.inner.state.lock().unwrap();
        state.get(address).map(|k| k.active).unwrap_or(0)
    }

    #[cfg(test)]
    pub(crate) fn idle_count(&self, address: &ServerAddress) -> usize {
        let state = self.inner.state.lock().unwrap();
        state.get(address).map(|k| k.idle.len()).unwrap_or(0)
    }
}

// ---------------------------------------------------------------------------
// Release path
// ---------------------------------------------------------------------------

fn release(inner: &Arc<PoolInner>, address: &ServerAddress, connection: Connection) {
    let mut dead = Vec::new();
    {
        let mut state = inner.state.lock().unwrap();
        let Some(key) = state.get_mut(address) else {
            // Purged while the connection was out: never re-pool.
            drop(state);
            connection.close();
            return;
        };
        key.active = key.active.saturating_sub(1);
        if connection.is_valid(inner.config.max_connection_lifetime) {
            key.idle.push_back(connection);
        } else {
            dead.push(connection);
        }
        service_waiters(inner, address, key, &mut dead);
    }
    for conn in dead {
        conn.close();
    }
}

/// A create that failed gives its capacity slot back and lets the oldest
/// waiter try again.
fn abandon_create(inner: &Arc<PoolInner>, address: &ServerAddress) {
    let mut dead = Vec::new();
    {
        let mut state = inner.state.lock().unwrap();
        if let Some(key) = state.get_mut(address) {
            key.active = key.active.saturating_sub(1);
            service_waiters(inner, address, key, &mut dead);
        }
    }
    for conn in dead {
        conn.close();
    }
}

/// Hand idle connections (or freshly created ones, capacity permitting) to
/// parked waiters, oldest first. Runs under the state lock; connections to
/// destroy are collected into `dead` and closed by the caller afterwards.
fn service_waiters(
    inner: &Arc<PoolInner>,
    address: &ServerAddress,
    key: &mut KeyState,
    dead: &mut Vec<Connection>,
) {
    while let Some(waiter) = key.waiters.pop_front() {
        let mut handoff = None;
        while let Some(conn) = key.idle.pop_front() {
            if conn.is_valid(inner.config.max_connection_lifetime) {
                handoff = Some(conn);
                break;
            }
            dead.push(conn);
        }

        match handoff {
            Some(conn) => {
                key.active += 1;
                if let Err(returned) = waiter.tx.send(Ok(conn)) {
                    // The waiter gave up (deadline); keep the connection.
                    key.active -= 1;
                    if let Ok(conn) = returned {
                        key.idle.push_back(conn);
                    }
                }
            }
            None if key.active < inner.config.max_pool_size => {
                key.active += 1;
                spawn_create_for_waiter(Arc::clone(inner), address.clone(), waiter);
            }
            None => {
                key.waiters.push_front(waiter);
                return;
            }
        }
    }
}

fn spawn_create_for_waiter(inner: Arc<PoolInner>, address: ServerAddress, waiter: Waiter) {
    tokio::spawn(async move {
        match inner.connector.establish(&address).await {
            Ok(conn) => {
                if let Err(returned) = waiter.tx.send(Ok(conn)) {
                    // Waiter timed out while we were connecting; pool the
                    // connection instead of wasting it.
                    let mut dead = Vec::new();
                    {
                        let mut state = inner.state.lock().unwrap();
                        match state.get_mut(&address) {
                            Some(key) => {
                                key.active = key.active.saturating_sub(1);
                                if let Ok(conn) = returned {
                                    if conn.is_valid(inner.config.max_connection_lifetime) {
                                        key.idle.push_back(conn);
                                    } else {
                                        dead.push(conn);
                                    }
                                }
                                service_waiters(&inner, &address, key, &mut dead);
                            }
                            None => {
                                if let Ok(conn) = returned {
                                    dead.push(conn);
                                }
                            }
                        }
                    }
                    for conn in dead {
                        conn.close();
                    }
                }
            }
            Err(err) => {
                let _ = waiter.tx.send(Err(err));
                abandon_create(&inner, &address);
            }
        }
    });
}

// ---------------------------------------------------------------------------
// PooledConnection
// ---------------------------------------------------------------------------

/// A connection on loan from the pool. Dropping it releases the connection;
/// the release path re-validates and either re-pools or destroys it.
pub(crate) struct PooledConnection {
    connection: Option<Connection>,
    address: ServerAddress,
    pool: Weak<PoolInner>,
}

impl PooledConnection {
    pub(crate) fn address(&self) -> &ServerAddress {
        &self.address
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

impl std::ops::Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.connection
            .as_ref()
            .expect("connection present until drop")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.connection.take() {
            match self.pool.upgrade() {
                Some(inner) => release(&inner, &self.address, conn),
                None => conn.close(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use bolt_test_utils::MockBoltServer;

    use crate::config::Config;

    fn pool_for(server: &MockBoltServer, config: Config) -> (ConnectionPool, ServerAddress) {
        let resolved = Arc::new(config.resolve());
        let address = ServerAddress::new("127.0.0.1", server.local_addr().port());
        (ConnectionPool::new(resolved, AuthToken::none()), address)
    }

    #[tokio::test]
    async fn released_connections_are_reused() {
        let server = MockBoltServer::start().await.expect("mock server");
        let (pool, address) = pool_for(&server, Config::default());

        let first = pool.acquire(&address).await.expect("acquire");
        let first_id = first.id().to_owned();
        assert_eq!(pool.active_count(&address), 1);
        drop(first);
        assert_eq!(pool.active_count(&address), 0);
        assert_eq!(pool.idle_count(&address), 1);

        let second = pool.acquire(&address).await.expect("acquire");
        assert_eq!(second.id(), first_id);
    }

    #[tokio::test]
    async fn acquisition_times_out_at_capacity_and_recovers_after_release() {
        let server = MockBoltServer::start().await.expect("mock server");
        let (pool, address) = pool_for(
            &server,
            Config {
                max_connection_pool_size: 1,
                connection_acquisition_timeout_ms: 50,
                ..Config::default()
            },
        );

        let held = pool.acquire(&address).await.expect("acquire");
        let started = std::time::Instant::now();
        let err = pool.acquire(&address).await.expect_err("must time out");
        assert!(matches!(err, Error::AcquisitionTimeout(50)));
        assert!(started.elapsed() >= Duration::from_millis(40));
        assert_eq!(pool.active_count(&address), 1, "waiter must not leak");

        drop(held);
        let third = pool.acquire(&address).await.expect("acquire after release");
        drop(third);
    }

    #[tokio::test]
    async fn release_hands_the_connection_to_the_oldest_waiter() {
        let server = MockBoltServer::start().await.expect("mock server");
        let (pool, address) = pool_for(
            &server,
            Config {
                max_connection_pool_size: 1,
                connection_acquisition_timeout_ms: 2_000,
                ..Config::default()
            },
        );

        let held = pool.acquire(&address).await.expect("acquire");
        let held_id = held.id().to_owned();

        let pool2 = pool.clone();
        let address2 = address.clone();
        let waiter = tokio::spawn(async move { pool2.acquire(&address2).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(held);

        let handed = waiter.await.expect("join").expect("acquire");
        assert_eq!(handed.id(), held_id, "waiter should get the released connection");
    }

    #[tokio::test]
    async fn purged_addresses_never_return_previously_idle_connections() {
        let server = MockBoltServer::start().await.expect("mock server");
        let (pool, address) = pool_for(&server, Config::default());

        let first = pool.acquire(&address).await.expect("acquire");
        let first_id = first.id().to_owned();
        drop(first);
        assert_eq!(pool.idle_count(&address), 1);

        pool.purge(&address);
        assert_eq!(pool.idle_count(&address), 0);

        let second = pool.acquire(&address).await.expect("acquire");
        assert_ne!(second.id(), first_id);
    }

    #[tokio::test]
    async fn in_flight_connections_are_destroyed_on_release_after_purge() {
        let server = MockBoltServer::start().await.expect("mock server");
        let (pool, address) = pool_for(&server, Config::default());

        let held = pool.acquire(&address).await.expect("acquire");
        pool.purge(&address);
        drop(held); // key is gone: destroy instead of re-pooling
        assert_eq!(pool.idle_count(&address), 0);
        assert_eq!(pool.active_count(&address), 0);
    }

    #[tokio::test]
    async fn connections_past_their_lifetime_are_not_reused() {
        let server = MockBoltServer::start().await.expect("mock server");
        let (pool, address) = pool_for(
            &server,
            Config {
                max_connection_lifetime_ms: 50,
                ..Config::default()
            },
        );

        let first = pool.acquire(&address).await.expect("acquire");
        let first_id = first.id().to_owned();
        drop(first);
        tokio::time::sleep(Duration::from_millis(80)).await;

        let second = pool.acquire(&address).await.expect("acquire");
        assert_ne!(second.id(), first_id, "stale connection must be destroyed");
    }

    #[tokio::test]
    async fn active_count_never_exceeds_max_size_under_contention() {
        let server = MockBoltServer::start().await.expect("mock server");
        let (pool, address) = pool_for(
            &server,
            Config {
                max_connection_pool_size: 2,
                connection_acquisition_timeout_ms: 2_000,
                ..Config::default()
            },
        );

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let pool = pool.clone();
            let address = address.clone();
            tasks.push(tokio::spawn(async move {
                let conn = pool.acquire(&address).await.expect("acquire");
                tokio::time::sleep(Duration::from_millis(10)).await;
                drop(conn);
            }));
        }
        for task in tasks {
            task.await.expect("join");
        }
        assert!(pool.active_count(&address) <= 2);
        assert_eq!(pool.active_count(&address), 0);
    }
}
