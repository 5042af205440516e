//! Explicit transactions.
//!
//! A `Transaction` is a cheap cloneable handle; the managed-retry loop
//! hands one clone to the user's work function and keeps another for the
//! commit. All clones share the session's connection holder, so every
//! statement of the transaction rides the same connection.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bolt_proto::Value;
use tracing::debug;

use crate::bookmark::Bookmarks;
use crate::error::Error;
use crate::net::observer::{CompletionObserver, StreamObserver};
use crate::session::stream::{RecordStream, RoutingFeedback};
use crate::session::ConnectionHolder;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxState {
    Active,
    Committed,
    RolledBack,
    Failed,
}

struct TxInner {
    holder: ConnectionHolder,
    feedback: RoutingFeedback,
    /// The session's bookmark chain; advanced when the commit succeeds.
    bookmarks: Arc<Mutex<Bookmarks>>,
    state: Mutex<TxState>,
}

#[derive(Clone)]
pub struct Transaction {
    inner: Arc<TxInner>,
}

impl Transaction {
    pub(crate) fn new(
        holder: ConnectionHolder,
        feedback: RoutingFeedback,
        bookmarks: Arc<Mutex<Bookmarks>>,
    ) -> Self {
        Transaction {
            inner: Arc::new(TxInner {
                holder,
                feedback,
                bookmarks,
                state: Mutex::new(TxState::Active),
            }),
        }
    }

    /// Run a statement inside the transaction.
    pub async fn run(
        &self,
        query: &str,
        parameters: HashMap<String, Value>,
    ) -> Result<RecordStream, Error> {
        self.ensure_active()?;
        let (run_observer, run_rx) = CompletionObserver::channel();
        let (stream_observer, events) = StreamObserver::channel();
        self.inner
            .holder
            .with_active(|conn| {
                conn.run(query, parameters, HashMap::new(), Box::new(run_observer))?;
                conn.pull_all(Box::new(stream_observer))
            })
            .await
            .map_err(|err| self.poison(err))?;
        // Bookmarks only move on commit, so the stream gets no sink.
        Ok(RecordStream::new(run_rx, events, None, None))
    }

    /// Commit and, on success, advance the session's bookmark chain.
    pub async fn commit(&self) -> Result<(), Error> {
        self.transition(TxState::Committed)?;
        let (observer, rx) = CompletionObserver::channel();
        self.inner
            .holder
            .with_active(|conn| conn.commit(Box::new(observer)))
            .await?;
        match rx.await {
            Ok(Ok(metadata)) => {
                let token = metadata
                    .get("bookmark")
                    .and_then(Value::as_str)
                    .map(str::to_owned);
                self.inner.bookmarks.lock().unwrap().advance(token);
                Ok(())
            }
            Ok(Err(error)) => {
                *self.inner.state.lock().unwrap() = TxState::Failed;
                Err(self.inner.feedback.apply(error))
            }
            Err(_) => {
                *self.inner.state.lock().unwrap() = TxState::Failed;
                Err(Error::ServiceUnavailable(
                    "connection closed while committing".to_owned(),
                ))
            }
        }
    }

    /// Roll back. A transaction that already reached a terminal state rolls
    /// back as a no-op, which keeps cleanup paths simple.
    pub async fn rollback(&self) -> Result<(), Error> {
        {
            let mut state = self.inner.state.lock().unwrap();
            match *state {
                TxState::Active => *state = TxState::RolledBack,
                _ => return Ok(()),
            }
        }
        let (observer, rx) = CompletionObserver::channel();
        let sent = self
            .inner
            .holder
            .with_active(|conn| conn.rollback(Box::new(observer)))
            .await;
        if let Err(err) = sent {
            debug!(error = %err, "rollback could not be sent");
            return Ok(());
        }
        match rx.await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(error)) => {
                debug!(error = %error, "rollback failed on the server");
                Ok(())
            }
            Err(_) => Ok(()),
        }
    }

    fn ensure_active(&self) -> Result<(), Error> {
        match *self.inner.state.lock().unwrap() {
            TxState::Active => Ok(()),
            state => Err(Error::Protocol(format!(
                "transaction is no longer usable (state {state:?})"
            ))),
        }
    }

    fn transition(&self, to: TxState) -> Result<(), Error> {
        let mut state = self.inner.state.lock().unwrap();
        match *state {
            TxState::Active => {
                *state = to;
                Ok(())
            }
            current => Err(Error::Protocol(format!(
                "transaction is no longer usable (state {current:?})"
            ))),
        }
    }

    fn poison(&self, error: Error) -> Error {
        *self.inner.state.lock().unwrap() = TxState::Failed;
        self.inner.feedback.apply(error)
    }
}
