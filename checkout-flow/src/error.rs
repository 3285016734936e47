//! Error types for checkout-flow.

use std::collections::BTreeSet;
use std::path::PathBuf;

use thiserror::Error;

use checkout_core::{EditError, FieldKey};

/// Problems with the buyer's input. Reported back to the form, never
/// escalated to the step machine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("required fields missing: {}", key_list(keys))]
    MissingRequired { keys: BTreeSet<FieldKey> },

    #[error(transparent)]
    Edit(#[from] EditError),
}

/// Flow-level failures.
///
/// `ShippingOptionExpired` and `Unhandled` are blocking: while one is
/// pending the controller refuses to move forward on its own.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FlowError {
    #[error("invalid customer info: {0}")]
    Validation(#[from] ValidationError),

    /// One or more remote writes failed. The form keeps its values so the
    /// buyer can resubmit.
    #[error("could not save customer info for: {}", key_list(keys))]
    RemoteOperation { keys: BTreeSet<FieldKey> },

    #[error("the selected shipping option is no longer available")]
    ShippingOptionExpired,

    #[error("unexpected checkout error: {0}")]
    Unhandled(String),

    #[error("checkout session has been closed")]
    SessionClosed,
}

impl FlowError {
    /// Whether this error holds the step machine in place until
    /// acknowledged.
    pub fn is_blocking(&self) -> bool {
        matches!(self, FlowError::ShippingOptionExpired | FlowError::Unhandled(_))
    }
}

/// Session cache persistence failures.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("session cache JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.into(),
        source,
    }
}

fn key_list(keys: &BTreeSet<FieldKey>) -> String {
    keys.iter()
        .map(FieldKey::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_list_keys_in_canonical_order() {
        let err = FlowError::RemoteOperation {
            keys: BTreeSet::from([FieldKey::PoNumber, FieldKey::Budgeting]),
        };
        assert_eq!(
            err.to_string(),
            "could not save customer info for: budgeting, po_number"
        );
    }

    #[test]
    fn only_step_errors_block() {
        assert!(FlowError::ShippingOptionExpired.is_blocking());
        assert!(FlowError::Unhandled("boom".into()).is_blocking());
        assert!(!FlowError::SessionClosed.is_blocking());
        assert!(!FlowError::RemoteOperation {
            keys: BTreeSet::new()
        }
        .is_blocking());
    }
}
