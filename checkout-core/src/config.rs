//! Checkout configuration, loaded from YAML.
//!
//! ```yaml
//! graphql_endpoint: https://store.example.com/graphql
//! bearer_token: eyJ...        # storefront token from the embedding page
//! namespace: bc_storefront    # optional
//! fields_path: fields.yaml    # optional, relative to the config file
//! session_home: /var/lib/checkout   # optional
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::registry::FieldRegistry;

pub const DEFAULT_NAMESPACE: &str = "bc_storefront";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckoutConfig {
    pub graphql_endpoint: String,
    /// Bearer credential supplied by the embedding environment. Passed
    /// through to the remote client untouched.
    pub bearer_token: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fields_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_home: Option<PathBuf>,
}

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

impl CheckoutConfig {
    pub fn new(graphql_endpoint: impl Into<String>, bearer_token: impl Into<String>) -> Self {
        Self {
            graphql_endpoint: graphql_endpoint.into(),
            bearer_token: bearer_token.into(),
            namespace: default_namespace(),
            fields_path: None,
            session_home: None,
        }
    }

    /// Load a config file. A relative `fields_path` is resolved against the
    /// directory containing the config.
    pub fn load_at(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: CheckoutConfig =
            serde_yaml::from_str(&contents).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;

        if config.graphql_endpoint.trim().is_empty() {
            return Err(ConfigError::Missing("graphql_endpoint"));
        }
        if config.bearer_token.trim().is_empty() {
            return Err(ConfigError::Missing("bearer_token"));
        }

        if let (Some(fields), Some(dir)) = (config.fields_path.as_ref(), path.parent()) {
            if fields.is_relative() {
                config.fields_path = Some(dir.join(fields));
            }
        }
        Ok(config)
    }

    /// The configured field table, or [`FieldRegistry::builtin`].
    pub fn field_registry(&self) -> Result<FieldRegistry, ConfigError> {
        match &self.fields_path {
            Some(path) => Ok(FieldRegistry::load_at(path)?),
            None => Ok(FieldRegistry::builtin()),
        }
    }
}
