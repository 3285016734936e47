//! Error types for checkout-core.

use std::path::PathBuf;

use thiserror::Error;

use crate::types::{FieldKey, Segment};

/// Errors raised while building or loading a field table.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Underlying I/O failure reading a table file.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// YAML parse error for an in-memory table.
    #[error("field table YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// YAML parse error on load, with the offending file.
    #[error("failed to parse field table at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// The table parsed but is internally inconsistent.
    #[error("invalid field table: {0}")]
    Invalid(String),
}

/// A user edit the registry refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EditError {
    #[error("field '{key}' is not collected for segment '{segment}'")]
    NotApplicable { key: FieldKey, segment: Segment },

    #[error("field '{key}' is fixed by the current value of '{by}'")]
    Locked { key: FieldKey, by: FieldKey },
}

/// Errors from loading [`crate::config::CheckoutConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse checkout config at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("checkout config is missing `{0}`")]
    Missing(&'static str),

    #[error("field table error: {0}")]
    Registry(#[from] RegistryError),
}
