//! Asynchronous client for graph databases speaking the Bolt protocol.
//!
//! Three subsystems do the heavy lifting: the wire engine (framing,
//! handshake, per-connection request/response state machine; the codec
//! itself lives in the `bolt-proto` crate), per-endpoint connection pools,
//! and the cluster routing layer with its freshness-driven table. A
//! session/retry controller sits on top and threads bookmarks, access
//! modes and managed-transaction retries through them.
//!
//! ```no_run
//! use bolt_client::{AuthToken, Config, Driver, SessionConfig};
//! use std::collections::HashMap;
//!
//! # async fn example() -> Result<(), bolt_client::Error> {
//! let driver = Driver::new(
//!     "neo4j://cluster.example.com:7687",
//!     AuthToken::basic("neo4j", "secret"),
//!     Config::default(),
//! )?;
//! let session = driver.session(SessionConfig::default());
//! let mut stream = session.run("RETURN 1 AS n", HashMap::new()).await?;
//! while let Some(record) = stream.next().await? {
//!     println!("{:?}", record.get("n"));
//! }
//! session.close().await;
//! driver.close().await;
//! # Ok(())
//! # }
//! ```

mod address;
mod bookmark;
mod config;
mod driver;
mod error;
mod net;
mod pool;
mod resolver;
mod routing;
mod session;

pub use address::ServerAddress;
pub use bolt_proto::graph::{Node, Path, PathSegment, Relationship, UnboundRelationship};
pub use bolt_proto::{Structure, Value};
pub use bookmark::Bookmarks;
pub use config::{AuthToken, Config, Encryption, Trust};
pub use driver::Driver;
pub use error::{Error, ServerError};
pub use net::{BoltVersion, ServerInfo};
pub use resolver::AddressResolver;
pub use routing::{LoadBalancingStrategy, RoundRobinStrategy};
pub use session::{Record, RecordStream, Session, SessionConfig, Transaction};

/// Which server role a unit of work targets; selects the list the load
/// balancer picks from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccessMode {
    Read,
    #[default]
    Write,
}
