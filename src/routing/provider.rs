//! Connection providers: the acquire capability sessions are built on.
//!
//! Three variants: *direct* always connects to the configured address,
//! *routing* goes through the load balancer, and *single* wraps one
//! already-acquired connection so the rediscovery query can reuse the
//! ordinary session machinery.

use tokio::sync::Mutex;

use crate::AccessMode;
use crate::address::ServerAddress;
use crate::error::Error;
use crate::pool::{ConnectionPool, PooledConnection};
use crate::routing::load_balancer::LoadBalancer;

pub(crate) enum ConnectionProvider {
    Direct(DirectProvider),
    Routing(LoadBalancer),
    Single(SingleConnection),
}

impl ConnectionProvider {
    pub(crate) async fn acquire(&self, mode: AccessMode) -> Result<PooledConnection, Error> {
        match self {
            ConnectionProvider::Direct(direct) => direct.pool.acquire(&direct.address).await,
            ConnectionProvider::Routing(balancer) => Box::pin(balancer.acquire(mode)).await,
            ConnectionProvider::Single(single) => single.take().await,
        }
    }

    /// Drop `address` from the routing view and purge its pooled
    /// connections. No-op for non-routing providers.
    pub(crate) fn forget(&self, address: &ServerAddress) {
        if let ConnectionProvider::Routing(balancer) = self {
            balancer.forget(address);
        }
    }

    /// Drop `address` from the writer role only.
    pub(crate) fn forget_writer(&self, address: &ServerAddress) {
        if let ConnectionProvider::Routing(balancer) = self {
            balancer.forget_writer(address);
        }
    }
}

pub(crate) struct DirectProvider {
    pub(crate) pool: ConnectionPool,
    pub(crate) address: ServerAddress,
}

/// Hands out exactly one pre-acquired connection, once.
pub(crate) struct SingleConnection {
    slot: Mutex<Option<PooledConnection>>,
}

impl SingleConnection {
    pub(crate) fn new(connection: PooledConnection) -> Self {
        SingleConnection {
            slot: Mutex::new(Some(connection)),
        }
    }

    async fn take(&self) -> Result<PooledConnection, Error> {
        self.slot.lock().await.take().ok_or_else(|| {
            Error::Protocol("single-connection provider already handed out its connection".to_owned())
        })
    }
}
