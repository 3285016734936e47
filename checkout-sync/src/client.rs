//! Remote metafield store contract.

use std::fmt;

use async_trait::async_trait;

use checkout_core::{CartId, EntityId, FieldKey, RemoteMetafield};

use crate::error::ClientError;

/// Cart-scoped key-value record store.
///
/// Implementations carry whatever credential the embedding environment
/// handed them; the engine never sees or refreshes it.
#[async_trait]
pub trait MetafieldClient: Send + Sync {
    async fn list(&self, cart: &CartId) -> Result<Vec<RemoteMetafield>, ClientError>;

    async fn create(
        &self,
        cart: &CartId,
        key: FieldKey,
        value: &str,
    ) -> Result<EntityId, ClientError>;

    async fn update(
        &self,
        cart: &CartId,
        entity: EntityId,
        key: FieldKey,
        value: &str,
    ) -> Result<EntityId, ClientError>;

    async fn delete(&self, cart: &CartId, entity: EntityId) -> Result<(), ClientError>;
}

/// Mutation kinds the engine issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    Create,
    Update,
    Delete,
}

impl OpKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpKind::Create => "create",
            OpKind::Update => "update",
            OpKind::Delete => "delete",
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
