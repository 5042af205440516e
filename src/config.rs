//! Driver configuration and credential material.
//!
//! All knobs are optional. Numeric fields follow one sanitization rule:
//! zero means "use the default", negative means "effectively unbounded"
//! (mapped to the largest safe value). The raw `Config` is what users
//! build; the driver resolves it once into typed durations and sizes.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::resolver::AddressResolver;

pub const DEFAULT_MAX_CONNECTION_LIFETIME_MS: i64 = 3_600_000;
pub const DEFAULT_MAX_CONNECTION_POOL_SIZE: i64 = 100;
pub const DEFAULT_CONNECTION_ACQUISITION_TIMEOUT_MS: i64 = 60_000;
pub const DEFAULT_CONNECTION_TIMEOUT_MS: i64 = 5_000;
pub const DEFAULT_MAX_TRANSACTION_RETRY_TIME_MS: i64 = 30_000;

fn default_user_agent() -> String {
    format!("bolt-client/{}", env!("CARGO_PKG_VERSION"))
}

// ---------------------------------------------------------------------------
// Auth
// ---------------------------------------------------------------------------

/// Credentials sent in the connection initialization message.
#[derive(Clone)]
pub struct AuthToken {
    pub scheme: String,
    pub principal: String,
    pub credentials: String,
}

impl AuthToken {
    pub fn basic(principal: impl Into<String>, credentials: impl Into<String>) -> Self {
        AuthToken {
            scheme: "basic".to_owned(),
            principal: principal.into(),
            credentials: credentials.into(),
        }
    }

    pub fn none() -> Self {
        AuthToken {
            scheme: "none".to_owned(),
            principal: String::new(),
            credentials: String::new(),
        }
    }
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthToken")
            .field("scheme", &self.scheme)
            .field("principal", &self.principal)
            .field("credentials", &"<redacted>")
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Encryption
// ---------------------------------------------------------------------------

/// Transport security switch. `+s` URI schemes enable it with system trust;
/// the config can override the trust source.
#[derive(Debug, Clone, Default)]
pub enum Encryption {
    #[default]
    Disabled,
    Enabled(Trust),
}

#[derive(Debug, Clone)]
pub enum Trust {
    /// Certificates signed by the platform's well-known roots.
    SystemCertificates,
    /// A caller-supplied TLS client configuration.
    CustomCertificates(Arc<rustls::ClientConfig>),
    /// Legacy trust-on-first-use. Rejected for routing drivers at
    /// construction; the TLS channel itself does not implement it, since
    /// known-hosts verification belongs to the embedding application.
    TrustOnFirstUse,
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
pub struct Config {
    /// Connections older than this are not reused. 0 = default (1 h),
    /// negative = unbounded.
    pub max_connection_lifetime_ms: i64,
    /// Per-endpoint pool capacity. 0 = default (100), negative = unbounded.
    pub max_connection_pool_size: i64,
    /// How long an acquisition may wait for a pooled connection.
    /// 0 = default (60 s), negative = unbounded.
    pub connection_acquisition_timeout_ms: i64,
    /// TCP/TLS connect deadline. 0 = default (5 s), negative = disabled.
    pub connection_timeout_ms: i64,
    /// Budget for managed-transaction retries. 0 = default (30 s),
    /// negative = unbounded.
    pub max_transaction_retry_time_ms: i64,
    /// Client identifier announced during initialization. Empty = default.
    pub user_agent: String,
    /// Decode integers as native floats, collapsing magnitudes past 2^53
    /// to infinity.
    pub disable_lossless_integers: bool,
    pub encryption: Encryption,
    /// Custom seed resolution, consulted before DNS.
    pub resolver: Option<Arc<dyn AddressResolver>>,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("max_connection_lifetime_ms", &self.max_connection_lifetime_ms)
            .field("max_connection_pool_size", &self.max_connection_pool_size)
            .field(
                "connection_acquisition_timeout_ms",
                &self.connection_acquisition_timeout_ms,
            )
            .field("connection_timeout_ms", &self.connection_timeout_ms)
            .field(
                "max_transaction_retry_time_ms",
                &self.max_transaction_retry_time_ms,
            )
            .field("user_agent", &self.user_agent)
            .field("disable_lossless_integers", &self.disable_lossless_integers)
            .field("encryption", &self.encryption)
            .field("resolver", &self.resolver.as_ref().map(|_| "custom"))
            .finish()
    }
}

impl Config {
    pub(crate) fn resolve(&self) -> ResolvedConfig {
        let acquisition_timeout_ms =
            sanitize_ms(self.connection_acquisition_timeout_ms, DEFAULT_CONNECTION_ACQUISITION_TIMEOUT_MS);
        ResolvedConfig {
            max_connection_lifetime: sanitize_optional_ms(
                self.max_connection_lifetime_ms,
                DEFAULT_MAX_CONNECTION_LIFETIME_MS,
            ),
            max_pool_size: sanitize_size(
                self.max_connection_pool_size,
                DEFAULT_MAX_CONNECTION_POOL_SIZE,
            ),
            acquisition_timeout: Duration::from_millis(acquisition_timeout_ms),
            acquisition_timeout_ms,
            connect_timeout: connect_timeout(self.connection_timeout_ms),
            max_retry_time: Duration::from_millis(sanitize_ms(
                self.max_transaction_retry_time_ms,
                DEFAULT_MAX_TRANSACTION_RETRY_TIME_MS,
            )),
            user_agent: if self.user_agent.is_empty() {
                default_user_agent()
            } else {
                self.user_agent.clone()
            },
            lossy_integers: self.disable_lossless_integers,
            encryption: self.encryption.clone(),
            resolver: self.resolver.clone(),
        }
    }
}

/// Sanitized, typed view of the configuration, shared across the driver.
#[derive(Clone)]
pub(crate) struct ResolvedConfig {
    /// `None` = unbounded lifetime.
    pub max_connection_lifetime: Option<Duration>,
    pub max_pool_size: usize,
    pub acquisition_timeout: Duration,
    /// Kept alongside the duration for the timeout error message.
    pub acquisition_timeout_ms: u64,
    /// `None` = no connect deadline.
    pub connect_timeout: Option<Duration>,
    pub max_retry_time: Duration,
    pub user_agent: String,
    pub lossy_integers: bool,
    pub encryption: Encryption,
    pub resolver: Option<Arc<dyn AddressResolver>>,
}

fn sanitize_size(value: i64, default: i64) -> usize {
    if value < 0 {
        usize::MAX
    } else if value == 0 {
        default as usize
    } else {
        value as usize
    }
}

fn sanitize_ms(value: i64, default: i64) -> u64 {
    if value < 0 {
        u64::MAX
    } else if value == 0 {
        default as u64
    } else {
        value as u64
    }
}

fn sanitize_optional_ms(value: i64, default: i64) -> Option<Duration> {
    if value < 0 {
        None
    } else if value == 0 {
        Some(Duration::from_millis(default as u64))
    } else {
        Some(Duration::from_millis(value as u64))
    }
}

/// Connect timeout differs from the others: explicitly non-positive means
/// "disabled", not "unbounded vs default".
fn connect_timeout(value: i64) -> Option<Duration> {
    if value < 0 {
        None
    } else if value == 0 {
        Some(Duration::from_millis(DEFAULT_CONNECTION_TIMEOUT_MS as u64))
    } else {
        Some(Duration::from_millis(value as u64))
    }
}
