//! Fetching a routing table from one router.
//!
//! Newer servers answer a dedicated `ROUTE` message; older ones expose a
//! routing procedure that is called like any other query, through a
//! session over a single-connection provider, so the routing call exercises
//! the same machinery user queries do.

use std::collections::HashMap;
use std::sync::Arc;

use bolt_proto::Value;
use tracing::debug;

use crate::AccessMode;
use crate::address::ServerAddress;
use crate::bookmark::Bookmarks;
use crate::error::Error;
use crate::net::observer::CompletionObserver;
use crate::pool::PooledConnection;
use crate::routing::provider::{ConnectionProvider, SingleConnection};
use crate::routing::table::RoutingTable;
use crate::session::Session;

/// Routing procedure exposed by pre-`ROUTE` servers.
const ROUTING_PROCEDURE_QUERY: &str = "CALL dbms.cluster.routing.getRoutingTable($context)";

/// How to treat server roles this driver does not know.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UnknownRolePolicy {
    /// Old protocol: an unknown role is a hard error.
    Error,
    /// Newer variants: ignore and move on.
    Ignore,
}

pub(crate) struct Rediscovery {
    routing_context: HashMap<String, Value>,
}

impl Rediscovery {
    pub(crate) fn new(routing_context: HashMap<String, Value>) -> Self {
        Rediscovery { routing_context }
    }

    /// Ask one router for a table.
    ///
    /// `Ok(None)` is the "no table from this router" sentinel: the caller
    /// moves on to the next candidate. Errors abort the whole refresh:
    /// an unknown database is the user's mistake, a missing routing
    /// procedure means the address is not a cluster, and malformed tables
    /// are protocol violations.
    pub(crate) async fn lookup(
        &self,
        connection: PooledConnection,
        database: Option<&str>,
        now_ms: u64,
    ) -> Result<Option<RoutingTable>, Error> {
        let router = connection.address().clone();
        let result = if connection.version().supports_route_message() {
            self.via_route_message(connection, database, now_ms).await
        } else {
            self.via_procedure(connection, database, now_ms).await
        };

        match result {
            Ok(table) => Ok(Some(table)),
            Err(Error::Server(err)) if err.is_database_not_found() => Err(Error::Server(err)),
            Err(Error::Server(err)) if err.is_procedure_not_found() => {
                Err(Error::ServiceUnavailable(format!(
                    "server at {router} does not support routing ({err}); the address likely \
                     points at a standalone instance rather than a cluster member"
                )))
            }
            Err(Error::Protocol(message)) => Err(Error::Protocol(message)),
            Err(err) => {
                debug!(router = %router, error = %err, "router produced no routing table");
                Ok(None)
            }
        }
    }

    async fn via_route_message(
        &self,
        connection: PooledConnection,
        database: Option<&str>,
        now_ms: u64,
    ) -> Result<RoutingTable, Error> {
        let (observer, rx) = CompletionObserver::channel();
        connection.route(
            self.routing_context.clone(),
            &Bookmarks::none(),
            database,
            Box::new(observer),
        )?;
        let metadata = rx.await.map_err(|_| {
            Error::ServiceUnavailable("connection closed while awaiting the ROUTE response".to_owned())
        })??;

        let rt = metadata
            .get("rt")
            .and_then(Value::as_map)
            .ok_or_else(|| Error::Protocol("ROUTE response carries no 'rt' map".to_owned()))?;
        let ttl = rt.get("ttl").and_then(int_like);
        let servers = rt
            .get("servers")
            .and_then(Value::as_list)
            .ok_or_else(|| Error::Protocol("ROUTE response carries no server list".to_owned()))?;
        parse_routing_table(ttl, servers, database, now_ms, UnknownRolePolicy::Ignore)
    }

    /// Procedure path: run the routing query through a session whose
    /// provider holds exactly this connection.
    async fn via_procedure(
        &self,
        connection: PooledConnection,
        database: Option<&str>,
        now_ms: u64,
    ) -> Result<RoutingTable, Error> {
        let provider = Arc::new(ConnectionProvider::Single(SingleConnection::new(connection)));
        let session = Session::internal(provider, AccessMode::Write, Bookmarks::none(), None);

        let mut parameters = HashMap::new();
        parameters.insert("context".to_owned(), Value::Map(self.routing_context.clone()));

        let stream = session.run(ROUTING_PROCEDURE_QUERY, parameters).await?;
        let (mut records, _summary) = stream.collect().await?;
        if records.len() != 1 {
            return Err(Error::Protocol(format!(
                "expected exactly one record from the routing procedure, got {}",
                records.len()
            )));
        }
        let record = records.remove(0);

        let ttl = record.get("ttl").and_then(int_like);
        let servers = record
            .get("servers")
            .and_then(Value::as_list)
            .ok_or_else(|| {
                Error::Protocol("routing procedure record carries no server list".to_owned())
            })?;
        parse_routing_table(ttl, servers, database, now_ms, UnknownRolePolicy::Error)
    }
}

// ---------------------------------------------------------------------------
// Response parsing
// ---------------------------------------------------------------------------

fn parse_routing_table(
    ttl_seconds: Option<i64>,
    servers: &[Value],
    database: Option<&str>,
    now_ms: u64,
    unknown_roles: UnknownRolePolicy,
) -> Result<RoutingTable, Error> {
    let mut routers = Vec::new();
    let mut readers = Vec::new();
    let mut writers = Vec::new();

    for entry in servers {
        let map = entry
            .as_map()
            .ok_or_else(|| Error::Protocol("server list entry is not a map".to_owned()))?;
        let role = map
            .get("role")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Protocol("server list entry carries no role".to_owned()))?;
        let addresses = parse_addresses(map.get("addresses"))?;

        match role {
            "ROUTE" => routers.extend(addresses),
            "READ" => readers.extend(addresses),
            "WRITE" => writers.extend(addresses),
            other => match unknown_roles {
                UnknownRolePolicy::Error => {
                    return Err(Error::Protocol(format!(
                        "unknown server role '{other}' in routing response"
                    )));
                }
                UnknownRolePolicy::Ignore => {
                    debug!(role = %other, "ignoring unknown server role in routing response");
                }
            },
        }
    }

    if routers.is_empty() {
        return Err(Error::Protocol(
            "received a routing table with no routers".to_owned(),
        ));
    }
    if readers.is_empty() {
        return Err(Error::Protocol(
            "received a routing table with no readers".to_owned(),
        ));
    }

    Ok(RoutingTable {
        database: database.map(str::to_owned),
        routers,
        readers,
        writers,
        expiration_time: expiration(now_ms, ttl_seconds),
    })
}

fn parse_addresses(value: Option<&Value>) -> Result<Vec<ServerAddress>, Error> {
    let list = value
        .and_then(Value::as_list)
        .ok_or_else(|| Error::Protocol("server list entry carries no addresses".to_owned()))?;
    list.iter()
        .map(|item| {
            let raw = item
                .as_str()
                .ok_or_else(|| Error::Protocol("server address is not a string".to_owned()))?;
            ServerAddress::parse(raw)
                .map_err(|e| Error::Protocol(format!("malformed server address '{raw}': {e}")))
        })
        .collect()
}

/// `now + ttl` in milliseconds, saturating at the numeric maximum. A
/// negative, absent or overflowing TTL yields a table that never expires
/// naturally.
fn expiration(now_ms: u64, ttl_seconds: Option<i64>) -> u64 {
    match ttl_seconds {
        Some(ttl) if ttl >= 0 => (ttl as u64)
            .checked_mul(1000)
            .and_then(|ms| now_ms.checked_add(ms))
            .unwrap_or(u64::MAX),
        _ => u64::MAX,
    }
}

/// TTLs arrive as integers normally, but as floats when the caller opted
/// into lossy integer decoding.
fn int_like(value: &Value) -> Option<i64> {
    match value {
        Value::Int(i) => Some(*i),
        Value::Float(f) if f.is_finite() => Some(*f as i64),
        Value::Float(f) if *f == f64::INFINITY => Some(i64::MAX),
        Value::Float(f) if *f == f64::NEG_INFINITY => Some(i64::MIN),
        _ => None,
    }
}
