//! Driver error taxonomy.
//!
//! Kinds, not causes: callers branch on what an error *means* for them
//! (retry, refresh the routing table, give up), so the variants mirror the
//! decisions the retry controller and the load balancer have to make.
//! Everything is `Clone` because one failure may be broadcast to several
//! pending request observers.

use std::collections::HashMap;

use bolt_proto::{ProtoError, Value};
use thiserror::Error;

/// Server error code indicating a user-initiated transaction termination.
const CODE_TERMINATED: &str = "Neo.TransientError.Transaction.Terminated";
/// Server error code indicating the lock client was stopped by the user.
const CODE_LOCK_CLIENT_STOPPED: &str = "Neo.TransientError.Transaction.LockClientStopped";

#[derive(Debug, Clone, Error)]
pub enum Error {
    /// The server, network or router cannot be reached. Retryable.
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),
    /// The routing view the session relied on is gone (a writer stopped
    /// leading, or a refresh produced no usable server). Retryable.
    #[error("session expired: {0}")]
    SessionExpired(String),
    /// Framing, value encoding, handshake or state machine violation.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// The pool could not produce a connection before the deadline.
    #[error("connection acquisition timed out after {0} ms")]
    AcquisitionTimeout(u64),
    /// A failure reported by the server, classified by its code family.
    #[error(transparent)]
    Server(ServerError),
    /// The driver was constructed or configured incorrectly.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    /// Whether the retry controller may run the work again.
    ///
    /// Transient server errors are retryable unless they signal a
    /// user-initiated termination.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::ServiceUnavailable(_) | Error::SessionExpired(_) => true,
            Error::Server(e) => e.is_retryable_transient(),
            _ => false,
        }
    }

    pub(crate) fn from_io(context: &str, err: &std::io::Error) -> Error {
        Error::ServiceUnavailable(format!("{context}: {err}"))
    }
}

impl From<ProtoError> for Error {
    fn from(err: ProtoError) -> Self {
        Error::Protocol(err.to_string())
    }
}

/// A `FAILURE` payload from the server: a status code plus a message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code}: {message}")]
pub struct ServerError {
    pub code: String,
    pub message: String,
}

impl ServerError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        ServerError {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Build from `FAILURE` metadata; missing keys degrade to an unknown
    /// database error so the caller always has something to show.
    pub(crate) fn from_failure_metadata(metadata: &HashMap<String, Value>) -> ServerError {
        let code = metadata
            .get("code")
            .and_then(Value::as_str)
            .unwrap_or("Neo.DatabaseError.General.UnknownError");
        let message = metadata
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("An unknown error occurred.");
        ServerError::new(code, message)
    }

    pub fn is_transient(&self) -> bool {
        self.code.starts_with("Neo.TransientError.")
    }

    /// Transient and not a user-initiated termination.
    pub fn is_retryable_transient(&self) -> bool {
        self.is_transient()
            && self.code != CODE_TERMINATED
            && self.code != CODE_LOCK_CLIENT_STOPPED
    }

    pub fn is_authentication_failure(&self) -> bool {
        self.code == "Neo.ClientError.Security.Unauthorized"
    }

    pub fn is_database_not_found(&self) -> bool {
        self.code == "Neo.ClientError.Database.DatabaseNotFound"
    }

    pub fn is_procedure_not_found(&self) -> bool {
        self.code == "Neo.ClientError.Procedure.ProcedureNotFound"
    }

    /// The chosen writer refuses writes: either it lost leadership or the
    /// whole database is read-only.
    pub fn is_not_leader(&self) -> bool {
        self.code == "Neo.ClientError.Cluster.NotALeader"
            || self.code == "Neo.ClientError.General.ForbiddenOnReadOnlyDatabase"
    }
}
