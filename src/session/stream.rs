//! Record streams and the routing feedback applied to their errors.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bolt_proto::Value;
use tokio::sync::{mpsc, oneshot};

use crate::address::ServerAddress;
use crate::bookmark::Bookmarks;
use crate::error::Error;
use crate::net::observer::{ResponseMetadata, StreamEvent};
use crate::routing::provider::ConnectionProvider;
use crate::session::ConnectionHolder;

/// One row of a result, sharing its column names with every sibling.
#[derive(Debug, Clone)]
pub struct Record {
    keys: Arc<Vec<String>>,
    values: Vec<Value>,
}

impl Record {
    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        let index = self.keys.iter().position(|k| k == key)?;
        self.values.get(index)
    }

    pub fn into_values(self) -> Vec<Value> {
        self.values
    }
}

// ---------------------------------------------------------------------------
// Routing feedback
// ---------------------------------------------------------------------------

/// Translates a server's complaints into routing-table updates: dead
/// servers are forgotten entirely, deposed leaders lose their writer role
/// and the error becomes `SessionExpired` so the retry controller fetches a
/// fresh table. The session's cached connection is invalidated alongside,
/// otherwise later work would keep talking to the forgotten server.
pub(crate) struct RoutingFeedback {
    provider: Arc<ConnectionProvider>,
    address: ServerAddress,
    holder: Option<ConnectionHolder>,
}

impl RoutingFeedback {
    pub(crate) fn new(
        provider: Arc<ConnectionProvider>,
        address: ServerAddress,
        holder: Option<ConnectionHolder>,
    ) -> Self {
        RoutingFeedback {
            provider,
            address,
            holder,
        }
    }

    pub(crate) fn apply(&self, error: Error) -> Error {
        match &error {
            Error::ServiceUnavailable(_) | Error::SessionExpired(_) => {
                self.provider.forget(&self.address);
                self.drop_cached_connection();
                error
            }
            Error::Server(server_err) if server_err.is_not_leader() => {
                self.provider.forget_writer(&self.address);
                self.drop_cached_connection();
                Error::SessionExpired(format!(
                    "server at {} no longer accepts writes: {server_err}",
                    self.address
                ))
            }
            _ => error,
        }
    }

    fn drop_cached_connection(&self) {
        if let Some(holder) = &self.holder {
            let holder = holder.clone();
            tokio::spawn(async move {
                holder.invalidate().await;
            });
        }
    }
}

// ---------------------------------------------------------------------------
// RecordStream
// ---------------------------------------------------------------------------

/// Streaming cursor over one query's results.
///
/// Backed by the per-request observers: the `RUN` summary resolves the
/// column names, then `PULL` events arrive until the terminal summary or an
/// error. Exactly one terminal outcome is surfaced; iterating past it
/// yields `Ok(None)`.
pub struct RecordStream {
    run_rx: Option<oneshot::Receiver<Result<ResponseMetadata, Error>>>,
    events: mpsc::UnboundedReceiver<StreamEvent>,
    keys: Arc<Vec<String>>,
    summary: Option<HashMap<String, Value>>,
    finished: bool,
    feedback: Option<RoutingFeedback>,
    bookmarks: Option<Arc<Mutex<Bookmarks>>>,
}

impl std::fmt::Debug for RecordStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordStream")
            .field("keys", &self.keys)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl RecordStream {
    pub(crate) fn new(
        run_rx: oneshot::Receiver<Result<ResponseMetadata, Error>>,
        events: mpsc::UnboundedReceiver<StreamEvent>,
        feedback: Option<RoutingFeedback>,
        bookmarks: Option<Arc<Mutex<Bookmarks>>>,
    ) -> Self {
        RecordStream {
            run_rx: Some(run_rx),
            events,
            keys: Arc::new(Vec::new()),
            summary: None,
            finished: false,
            feedback,
            bookmarks,
        }
    }

    /// Column names, available once the server acknowledged the query.
    pub async fn keys(&mut self) -> Result<&[String], Error> {
        self.await_run_summary().await?;
        Ok(&self.keys)
    }

    /// Next record, `Ok(None)` once the stream completed.
    pub async fn next(&mut self) -> Result<Option<Record>, Error> {
        self.await_run_summary().await?;
        if self.finished {
            return Ok(None);
        }
        match self.events.recv().await {
            Some(StreamEvent::Record(values)) => Ok(Some(Record {
                keys: Arc::clone(&self.keys),
                values,
            })),
            Some(StreamEvent::Completed(metadata)) => {
                self.finished = true;
                self.absorb_summary(metadata);
                Ok(None)
            }
            Some(StreamEvent::Failed(error)) => {
                self.finished = true;
                Err(self.fail(error))
            }
            None => {
                self.finished = true;
                Err(Error::ServiceUnavailable(
                    "connection closed in the middle of a result stream".to_owned(),
                ))
            }
        }
    }

    /// Drain the remaining records and return the terminal summary.
    pub async fn consume(mut self) -> Result<HashMap<String, Value>, Error> {
        while self.next().await?.is_some() {}
        Ok(self.summary.take().unwrap_or_default())
    }

    /// Collect every record plus the terminal summary.
    pub async fn collect(mut self) -> Result<(Vec<Record>, HashMap<String, Value>), Error> {
        let mut records = Vec::new();
        while let Some(record) = self.next().await? {
            records.push(record);
        }
        Ok((records, self.summary.take().unwrap_or_default()))
    }

    async fn await_run_summary(&mut self) -> Result<(), Error> {
        let Some(rx) = self.run_rx.take() else {
            return Ok(());
        };
        match rx.await {
            Ok(Ok(metadata)) => {
                if let Some(fields) = metadata.get("fields").and_then(Value::as_list) {
                    let keys = fields
                        .iter()
                        .filter_map(|v| v.as_str().map(str::to_owned))
                        .collect();
                    self.keys = Arc::new(keys);
                }
                Ok(())
            }
            Ok(Err(error)) => {
                self.finished = true;
                Err(self.fail(error))
            }
            Err(_) => {
                self.finished = true;
                Err(Error::ServiceUnavailable(
                    "connection closed before the query was acknowledged".to_owned(),
                ))
            }
        }
    }

    fn fail(&self, error: Error) -> Error {
        match &self.feedback {
            Some(feedback) => feedback.apply(error),
            None => error,
        }
    }

    fn absorb_summary(&mut self, metadata: HashMap<String, Value>) {
        if let (Some(bookmarks), Some(token)) = (
            &self.bookmarks,
            metadata.get("bookmark").and_then(Value::as_str),
        ) {
            bookmarks.lock().unwrap().advance(Some(token.to_owned()));
        }
        self.summary = Some(metadata);
    }
}
