//! Per-connection request/response state machine.
//!
//! The engine is pure state: the read loop feeds it decoded responses, the
//! request path feeds it observers, and it tells the caller when a recovery
//! message must be written. Keeping I/O out makes the FIFO and
//! failure-recovery invariants testable without sockets.
//!
//! Dispatch rules:
//!
//! | response  | effect                                                       |
//! |-----------|--------------------------------------------------------------|
//! | `RECORD`  | `on_next` on the current (front) observer                    |
//! | `SUCCESS` | `on_completed` on the front observer, pop                    |
//! | `FAILURE` | `on_error` on the front observer, pop, start recovery        |
//! | `IGNORED` | cached failure (or a synthetic error) to `on_error`, pop     |
//!
//! After a `FAILURE` the engine asks the caller to send exactly one
//! recovery message (`RESET`, or `ACK_FAILURE` on old versions); its
//! completion clears the cached failure so later responses flow normally.

use std::collections::VecDeque;

use bolt_proto::message::Response;
use tracing::debug;

use crate::error::{Error, ServerError};
use crate::net::observer::ResponseObserver;

/// What the caller must do after a dispatch.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Dispatch {
    Continue,
    /// A failure was delivered: write the recovery message now, before any
    /// other request goes out.
    SendRecovery,
}

struct Pending {
    observer: Box<dyn ResponseObserver>,
    /// Marks the engine's own recovery request; its completion clears the
    /// cached failure.
    recovery: bool,
}

pub(crate) struct Engine {
    queue: VecDeque<Pending>,
    /// Failure delivered to pipelined requests that the server answers
    /// with `IGNORED`.
    cached_failure: Option<Error>,
    /// Set once a fatal error tore the connection down; every later
    /// enqueue is refused with it.
    fatal: Option<Error>,
}

impl Engine {
    pub(crate) fn new() -> Self {
        Engine {
            queue: VecDeque::new(),
            cached_failure: None,
            fatal: None,
        }
    }

    /// Register the observer for a request about to be written.
    pub(crate) fn enqueue(&mut self, observer: Box<dyn ResponseObserver>) -> Result<(), Error> {
        if let Some(err) = &self.fatal {
            let mut observer = observer;
            observer.on_error(err.clone());
            return Err(err.clone());
        }
        self.queue.push_back(Pending {
            observer,
            recovery: false,
        });
        Ok(())
    }

    /// Register the engine's own recovery observer.
    pub(crate) fn enqueue_recovery(&mut self, observer: Box<dyn ResponseObserver>) {
        if self.fatal.is_some() {
            return;
        }
        self.queue.push_back(Pending {
            observer,
            recovery: true,
        });
    }

    /// Number of requests still expecting a terminal response.
    pub(crate) fn pending_len(&self) -> usize {
        self.queue.len()
    }

    /// Route one decoded response to the current observer.
    ///
    /// `Err` means the response violated the state machine and the caller
    /// must treat the connection as broken.
    pub(crate) fn handle_response(&mut self, response: Response) -> Result<Dispatch, Error> {
        match response {
            Response::Record(values) => match self.queue.front_mut() {
                Some(pending) => {
                    pending.observer.on_next(values);
                    Ok(Dispatch::Continue)
                }
                None => Err(Error::Protocol(
                    "server sent RECORD with no outstanding request".to_owned(),
                )),
            },
            Response::Success(metadata) => {
                let mut pending = self.pop("SUCCESS")?;
                if pending.recovery {
                    self.cached_failure = None;
                }
                pending.observer.on_completed(metadata);
                Ok(Dispatch::Continue)
            }
            Response::Failure(metadata) => {
                let error = Error::Server(ServerError::from_failure_metadata(&metadata));
                let mut pending = self.pop("FAILURE")?;
                if pending.recovery {
                    // The recovery request itself failed: nothing sane can
                    // follow on this connection.
                    pending.observer.on_error(error.clone());
                    return Err(error);
                }
                debug!(error = %error, "request failed, scheduling recovery");
                self.cached_failure = Some(error.clone());
                pending.observer.on_error(error);
                Ok(Dispatch::SendRecovery)
            }
            Response::Ignored => {
                let mut pending = self.pop("IGNORED")?;
                let error = self.cached_failure.clone().unwrap_or_else(|| {
                    Error::Protocol("request was ignored by the server".to_owned())
                });
                pending.observer.on_error(error);
                Ok(Dispatch::Continue)
            }
        }
    }

    /// Tear down: deliver `error` to every pending observer and refuse all
    /// future requests with it.
    pub(crate) fn fail_all(&mut self, error: Error) {
        if self.fatal.is_none() {
            self.fatal = Some(error.clone());
        }
        self.cached_failure = None;
        for mut pending in self.queue.drain(..) {
            pending.observer.on_error(error.clone());
        }
    }

    pub(crate) fn is_broken(&self) -> bool {
        self.fatal.is_some()
    }

    fn pop(&mut self, what: &str) -> Result<Pending, Error> {
        self.queue.pop_front().ok_or_else(|| {
            Error::Protocol(format!("server sent {what} with no outstanding request"))
        })
    }
}
