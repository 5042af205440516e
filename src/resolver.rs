//! Seed address resolution.
//!
//! Two stages: an optional user-provided resolver expands the configured
//! seed into logical addresses (e.g. one name per data center), then each
//! logical address goes through system DNS. Rediscovery consumes the
//! flattened result when every known router has failed.

use tracing::debug;

use crate::address::ServerAddress;

/// Capability interface for custom seed expansion.
///
/// Implemented for plain closures, so a config can carry
/// `Arc::new(|addr| vec![...])`.
pub trait AddressResolver: Send + Sync {
    fn resolve(&self, address: &ServerAddress) -> Vec<ServerAddress>;
}

impl<F> AddressResolver for F
where
    F: Fn(&ServerAddress) -> Vec<ServerAddress> + Send + Sync,
{
    fn resolve(&self, address: &ServerAddress) -> Vec<ServerAddress> {
        self(address)
    }
}

/// Resolve one logical address through system DNS, keeping the port.
///
/// Resolution failure falls back to the literal address so the subsequent
/// connect attempt reports the real reason.
pub(crate) async fn dns_resolve(address: &ServerAddress) -> Vec<ServerAddress> {
    match tokio::net::lookup_host((address.host(), address.port())).await {
        Ok(found) => {
            let resolved: Vec<_> = found
                .map(|sa| ServerAddress::new(&sa.ip().to_string(), sa.port()))
                .collect();
            if resolved.is_empty() {
                vec![address.clone()]
            } else {
                resolved
            }
        }
        Err(err) => {
            debug!(address = %address, error = %err, "DNS resolution failed, using literal address");
            vec![address.clone()]
        }
    }
}
