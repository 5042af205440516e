//! Sessions: bookmarks, access mode, and managed retries.
//!
//! A session lazily borrows one connection through its holder so every
//! cursor and transaction within it shares the same pipeline. Closing the
//! session resets that connection and hands it back to the pool.

mod retry;
mod stream;
mod transaction;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bolt_proto::Value;
use tracing::debug;

use crate::AccessMode;
use crate::bookmark::Bookmarks;
use crate::error::Error;
use crate::net::BoltVersion;
use crate::net::observer::{CompletionObserver, NoopObserver, StreamObserver};
use crate::pool::PooledConnection;
use crate::routing::provider::ConnectionProvider;

pub use stream::{Record, RecordStream};
pub use transaction::Transaction;

pub(crate) use retry::RetryPolicy;
pub(crate) use stream::RoutingFeedback;

// ---------------------------------------------------------------------------
// Connection holder
// ---------------------------------------------------------------------------

/// Lazily acquires and caches the session's single connection.
///
/// Cheap to clone: clones share the slot. A cached connection that went
/// broken is silently replaced on next use; `invalidate` drops it outright
/// (used by routing feedback when the server it points at was forgotten).
#[derive(Clone)]
pub(crate) struct ConnectionHolder {
    provider: Arc<ConnectionProvider>,
    slot: Arc<tokio::sync::Mutex<Option<PooledConnection>>>,
}

impl ConnectionHolder {
    pub(crate) fn new(provider: Arc<ConnectionProvider>) -> Self {
        ConnectionHolder {
            provider,
            slot: Arc::new(tokio::sync::Mutex::new(None)),
        }
    }

    /// Run `f` against the session connection, acquiring one for `mode` if
    /// the slot is empty or holds a dead connection. `f` must not block:
    /// request sends are synchronous enqueues.
    pub(crate) async fn with_connection<R>(
        &self,
        mode: AccessMode,
        f: impl FnOnce(&PooledConnection) -> Result<R, Error>,
    ) -> Result<R, Error> {
        let mut slot = self.slot.lock().await;
        if slot.as_ref().map(|conn| !conn.is_open()).unwrap_or(false) {
            debug!("replacing dead session connection");
            *slot = None;
        }
        if slot.is_none() {
            *slot = Some(self.provider.acquire(mode).await?);
        }
        let conn = slot
            .as_ref()
            .ok_or_else(|| Error::Protocol("connection holder is empty".to_owned()))?;
        f(conn)
    }

    /// Like [`ConnectionHolder::with_connection`] but never acquires: used
    /// inside transactions, which must stay on the connection they began
    /// on.
    pub(crate) async fn with_active<R>(
        &self,
        f: impl FnOnce(&PooledConnection) -> Result<R, Error>,
    ) -> Result<R, Error> {
        let slot = self.slot.lock().await;
        let conn = slot.as_ref().ok_or_else(|| {
            Error::Protocol("transaction used after its connection was released".to_owned())
        })?;
        f(conn)
    }

    /// Drop the cached connection (it flows back through the pool's
    /// release path, which validates or destroys it).
    pub(crate) async fn invalidate(&self) {
        let mut slot = self.slot.lock().await;
        *slot = None;
    }

    /// Reset-and-release: the spontaneous `RESET` clears any server-side
    /// state before the connection is re-pooled.
    pub(crate) async fn release(&self) {
        let mut slot = self.slot.lock().await;
        if let Some(conn) = slot.take() {
            if conn.is_open() {
                if let Err(err) = conn.reset(Box::new(NoopObserver)) {
                    debug!(error = %err, "reset on release failed");
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    pub mode: AccessMode,
    pub bookmarks: Bookmarks,
    pub database: Option<String>,
}

pub struct Session {
    provider: Arc<ConnectionProvider>,
    mode: AccessMode,
    database: Option<String>,
    bookmarks: Arc<Mutex<Bookmarks>>,
    holder: ConnectionHolder,
    retry: RetryPolicy,
}

impl Session {
    pub(crate) fn new(
        provider: Arc<ConnectionProvider>,
        config: SessionConfig,
        retry: RetryPolicy,
    ) -> Session {
        let holder = ConnectionHolder::new(Arc::clone(&provider));
        Session {
            provider,
            mode: config.mode,
            database: config.database,
            bookmarks: Arc::new(Mutex::new(config.bookmarks)),
            holder,
            retry,
        }
    }

    /// Internal constructor for machinery that needs a session over an
    /// existing provider (the rediscovery path).
    pub(crate) fn internal(
        provider: Arc<ConnectionProvider>,
        mode: AccessMode,
        bookmarks: Bookmarks,
        database: Option<String>,
    ) -> Session {
        Session::new(
            provider,
            SessionConfig {
                mode,
                bookmarks,
                database,
            },
            RetryPolicy::default(),
        )
    }

    /// Auto-commit query: pipelines `RUN` and `PULL` and returns the
    /// streaming cursor.
    pub async fn run(
        &self,
        query: &str,
        parameters: HashMap<String, Value>,
    ) -> Result<RecordStream, Error> {
        let (run_observer, run_rx) = CompletionObserver::channel();
        let (stream_observer, events) = StreamObserver::channel();
        let address = self
            .holder
            .with_connection(self.mode, |conn| {
                let extra = self.request_metadata(conn.version());
                conn.run(query, parameters, extra, Box::new(run_observer))?;
                conn.pull_all(Box::new(stream_observer))?;
                Ok(conn.address().clone())
            })
            .await?;

        let feedback = RoutingFeedback::new(
            Arc::clone(&self.provider),
            address,
            Some(self.holder.clone()),
        );
        Ok(RecordStream::new(
            run_rx,
            events,
            Some(feedback),
            Some(Arc::clone(&self.bookmarks)),
        ))
    }

    /// Begin an explicit transaction in the session's access mode.
    pub async fn begin_transaction(&self) -> Result<Transaction, Error> {
        self.begin_with_mode(self.mode).await
    }

    /// Managed read transaction with retries.
    pub async fn read_transaction<T, F, Fut>(&self, work: F) -> Result<T, Error>
    where
        F: FnMut(Transaction) -> Fut,
        Fut: Future<Output = Result<T, Error>>,
    {
        self.transaction_with_retry(AccessMode::Read, work).await
    }

    /// Managed write transaction with retries.
    pub async fn write_transaction<T, F, Fut>(&self, work: F) -> Result<T, Error>
    where
        F: FnMut(Transaction) -> Fut,
        Fut: Future<Output = Result<T, Error>>,
    {
        self.transaction_with_retry(AccessMode::Write, work).await
    }

    /// The newest causal token observed by this session.
    pub fn last_bookmarks(&self) -> Bookmarks {
        self.bookmarks.lock().unwrap().clone()
    }

    /// Reset and return the held connection. Dropping any in-flight retry
    /// future alongside cancels its pending delay.
    pub async fn close(&self) {
        self.holder.release().await;
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    async fn transaction_with_retry<T, F, Fut>(
        &self,
        mode: AccessMode,
        mut work: F,
    ) -> Result<T, Error>
    where
        F: FnMut(Transaction) -> Fut,
        Fut: Future<Output = Result<T, Error>>,
    {
        let started = tokio::time::Instant::now();
        let mut delay = self.retry.initial_delay;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let outcome = async {
                let tx = self.begin_with_mode(mode).await?;
                match work(tx.clone()).await {
                    Ok(value) => {
                        tx.commit().await?;
                        Ok(value)
                    }
                    Err(error) => {
                        let _ = tx.rollback().await;
                        Err(error)
                    }
                }
            }
            .await;

            match outcome {
                Ok(value) => return Ok(value),
                Err(error)
                    if error.is_retryable() && started.elapsed() <= self.retry.max_retry_time =>
                {
                    let pause = self.retry.jittered(delay);
                    debug!(
                        attempt,
                        error = %error,
                        delay_ms = pause.as_millis() as u64,
                        "transaction failed, retrying"
                    );
                    tokio::time::sleep(pause).await;
                    delay = delay.mul_f64(self.retry.multiplier);
                }
                Err(error) => return Err(error),
            }
        }
    }

    async fn begin_with_mode(&self, mode: AccessMode) -> Result<Transaction, Error> {
        let (observer, rx) = CompletionObserver::channel();
        let address = self
            .holder
            .with_connection(mode, |conn| {
                let extra = self.transaction_metadata(mode, conn.version());
                conn.begin(extra, Box::new(observer))?;
                Ok(conn.address().clone())
            })
            .await?;

        let feedback = RoutingFeedback::new(
            Arc::clone(&self.provider),
            address.clone(),
            Some(self.holder.clone()),
        );
        match rx.await {
            Ok(Ok(_)) => Ok(Transaction::new(
                self.holder.clone(),
                feedback,
                Arc::clone(&self.bookmarks),
            )),
            Ok(Err(error)) => Err(feedback.apply(error)),
            Err(_) => Err(Error::ServiceUnavailable(format!(
                "connection to {address} closed while beginning a transaction"
            ))),
        }
    }

    /// Metadata for auto-commit `RUN`: bookmarks, access mode, database.
    fn request_metadata(&self, version: BoltVersion) -> HashMap<String, Value> {
        self.metadata_for(self.mode, version)
    }

    fn transaction_metadata(&self, mode: AccessMode, version: BoltVersion) -> HashMap<String, Value> {
        self.metadata_for(mode, version)
    }

    fn metadata_for(&self, mode: AccessMode, version: BoltVersion) -> HashMap<String, Value> {
        let mut extra = HashMap::new();
        {
            let bookmarks = self.bookmarks.lock().unwrap();
            if !bookmarks.is_empty() {
                extra.insert("bookmarks".to_owned(), bookmarks.to_value());
            }
        }
        if mode == AccessMode::Read {
            extra.insert("mode".to_owned(), Value::from("r"));
        }
        if version.supports_multi_database() {
            if let Some(database) = &self.database {
                extra.insert("db".to_owned(), Value::from(database.as_str()));
            }
        }
        extra
    }
}
