//! Error types for checkout-sync.

use thiserror::Error;

/// Failure of a single remote store call.
///
/// Cloneable so it can be carried inside per-field outcomes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    /// Connection, DNS, TLS or request-task failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// Non-2xx HTTP status from the store.
    #[error("store returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    /// The store answered but refused the operation.
    #[error("store rejected {operation}: {message}")]
    Rejected {
        operation: &'static str,
        message: String,
    },

    /// The response did not have the expected shape.
    #[error("malformed store response: {0}")]
    Malformed(String),
}

/// Errors that abort a whole reconciliation run (as opposed to failing
/// individual fields).
#[derive(Debug, Error)]
pub enum SyncError {
    /// Listing the current remote records failed.
    #[error("could not list remote records: {0}")]
    Snapshot(#[from] ClientError),

    /// The session's cancellation scope fired before the run started.
    #[error("reconciliation cancelled")]
    Cancelled,
}
