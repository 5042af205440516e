//! Per-request continuations.
//!
//! Every request enqueues exactly one observer; the engine delivers zero or
//! more records to it and then exactly one terminal event. The callbacks
//! run on the connection's read loop and therefore must never block; the
//! concrete observers below only push into channels or flip atomics.

use std::collections::HashMap;

use bolt_proto::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::error::Error;

pub(crate) type ResponseMetadata = HashMap<String, Value>;

pub(crate) trait ResponseObserver: Send {
    fn on_next(&mut self, record: Vec<Value>);
    fn on_completed(&mut self, metadata: ResponseMetadata);
    fn on_error(&mut self, error: Error);
}

// ---------------------------------------------------------------------------
// CompletionObserver
// ---------------------------------------------------------------------------

/// Observer for requests that only produce a summary (HELLO, BEGIN, COMMIT,
/// ROUTE, ...). Records are not expected and are dropped with a debug note.
pub(crate) struct CompletionObserver {
    tx: Option<oneshot::Sender<Result<ResponseMetadata, Error>>>,
}

impl CompletionObserver {
    pub(crate) fn channel() -> (
        CompletionObserver,
        oneshot::Receiver<Result<ResponseMetadata, Error>>,
    ) {
        let (tx, rx) = oneshot::channel();
        (CompletionObserver { tx: Some(tx) }, rx)
    }
}

impl ResponseObserver for CompletionObserver {
    fn on_next(&mut self, _record: Vec<Value>) {
        debug!("discarding unexpected record on a summary-only request");
    }

    fn on_completed(&mut self, metadata: ResponseMetadata) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Ok(metadata));
        }
    }

    fn on_error(&mut self, error: Error) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Err(error));
        }
    }
}

// ---------------------------------------------------------------------------
// StreamObserver
// ---------------------------------------------------------------------------

/// One event of a streamed result.
#[derive(Debug)]
pub(crate) enum StreamEvent {
    Record(Vec<Value>),
    Completed(ResponseMetadata),
    Failed(Error),
}

/// Observer feeding a record stream; the consuming side lives in the
/// session layer.
pub(crate) struct StreamObserver {
    tx: mpsc::UnboundedSender<StreamEvent>,
}

impl StreamObserver {
    pub(crate) fn channel() -> (StreamObserver, mpsc::UnboundedReceiver<StreamEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (StreamObserver { tx }, rx)
    }
}

impl ResponseObserver for StreamObserver {
    fn on_next(&mut self, record: Vec<Value>) {
        let _ = self.tx.send(StreamEvent::Record(record));
    }

    fn on_completed(&mut self, metadata: ResponseMetadata) {
        let _ = self.tx.send(StreamEvent::Completed(metadata));
    }

    fn on_error(&mut self, error: Error) {
        let _ = self.tx.send(StreamEvent::Failed(error));
    }
}

// ---------------------------------------------------------------------------
// NoopObserver
// ---------------------------------------------------------------------------

/// Fire-and-forget: used for the RESET a holder sends while returning its
/// connection to the pool.
pub(crate) struct NoopObserver;

impl ResponseObserver for NoopObserver {
    fn on_next(&mut self, _record: Vec<Value>) {}
    fn on_completed(&mut self, _metadata: ResponseMetadata) {}
    fn on_error(&mut self, _error: Error) {}
}
