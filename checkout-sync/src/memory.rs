//! In-process [`MetafieldClient`] used by embedders without a live store and
//! by the test suites. Records every mutation and can be told to fail
//! specific operations.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use checkout_core::{CartId, EntityId, FieldKey, RemoteMetafield};

use crate::client::{MetafieldClient, OpKind};
use crate::error::ClientError;

/// One mutation observed by the in-memory store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedOp {
    pub kind: OpKind,
    pub cart: CartId,
    pub key: Option<FieldKey>,
    pub entity: Option<EntityId>,
}

#[derive(Debug, Default)]
struct State {
    carts: HashMap<CartId, BTreeMap<EntityId, (String, String)>>,
    next_id: u64,
    log: Vec<RecordedOp>,
    failing: HashSet<(OpKind, FieldKey)>,
    fail_list: bool,
}

impl State {
    fn allocate(&mut self) -> EntityId {
        self.next_id += 1;
        EntityId(self.next_id)
    }

    fn key_of(&self, cart: &CartId, entity: EntityId) -> Option<FieldKey> {
        self.carts
            .get(cart)
            .and_then(|records| records.get(&entity))
            .and_then(|(key, _)| key.parse().ok())
    }
}

#[derive(Debug, Default)]
pub struct InMemoryMetafieldClient {
    state: Mutex<State>,
}

impl InMemoryMetafieldClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Insert a record directly, bypassing the mutation log.
    pub fn seed(&self, cart: &CartId, key: &str, value: &str) -> EntityId {
        let mut state = self.state();
        let id = state.allocate();
        state
            .carts
            .entry(cart.clone())
            .or_default()
            .insert(id, (key.to_string(), value.to_string()));
        id
    }

    /// Make every `kind` operation on `key` fail until cleared.
    pub fn fail_on(&self, kind: OpKind, key: FieldKey) {
        self.state().failing.insert((kind, key));
    }

    pub fn fail_list(&self, fail: bool) {
        self.state().fail_list = fail;
    }

    pub fn clear_failures(&self) {
        let mut state = self.state();
        state.failing.clear();
        state.fail_list = false;
    }

    /// Mutations performed so far, in completion order.
    pub fn operations(&self) -> Vec<RecordedOp> {
        self.state().log.clone()
    }

    /// Drain the mutation log.
    pub fn take_operations(&self) -> Vec<RecordedOp> {
        std::mem::take(&mut self.state().log)
    }

    pub fn records(&self, cart: &CartId) -> Vec<RemoteMetafield> {
        self.state()
            .carts
            .get(cart)
            .map(|records| {
                records
                    .iter()
                    .map(|(id, (key, value))| RemoteMetafield {
                        entity_id: *id,
                        key: key.clone(),
                        value: value.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Current value stored for `key`, if exactly one record holds it.
    pub fn value_of(&self, cart: &CartId, key: FieldKey) -> Option<String> {
        let matching: Vec<_> = self
            .records(cart)
            .into_iter()
            .filter(|r| r.key == key.as_str())
            .collect();
        match matching.as_slice() {
            [only] => Some(only.value.clone()),
            _ => None,
        }
    }
}

fn rejected(kind: OpKind, message: impl Into<String>) -> ClientError {
    ClientError::Rejected {
        operation: kind.as_str(),
        message: message.into(),
    }
}

#[async_trait]
impl MetafieldClient for InMemoryMetafieldClient {
    async fn list(&self, cart: &CartId) -> Result<Vec<RemoteMetafield>, ClientError> {
        if self.state().fail_list {
            return Err(ClientError::Transport("list unavailable".to_string()));
        }
        Ok(self.records(cart))
    }

    async fn create(
        &self,
        cart: &CartId,
        key: FieldKey,
        value: &str,
    ) -> Result<EntityId, ClientError> {
        let mut state = self.state();
        if state.failing.contains(&(OpKind::Create, key)) {
            return Err(rejected(OpKind::Create, format!("{key} refused")));
        }
        let id = state.allocate();
        state
            .carts
            .entry(cart.clone())
            .or_default()
            .insert(id, (key.as_str().to_string(), value.to_string()));
        state.log.push(RecordedOp {
            kind: OpKind::Create,
            cart: cart.clone(),
            key: Some(key),
            entity: Some(id),
        });
        Ok(id)
    }

    async fn update(
        &self,
        cart: &CartId,
        entity: EntityId,
        key: FieldKey,
        value: &str,
    ) -> Result<EntityId, ClientError> {
        let mut state = self.state();
        if state.failing.contains(&(OpKind::Update, key)) {
            return Err(rejected(OpKind::Update, format!("{key} refused")));
        }
        let record = state
            .carts
            .get_mut(cart)
            .and_then(|records| records.get_mut(&entity))
            .ok_or_else(|| rejected(OpKind::Update, format!("no metafield {entity}")))?;
        *record = (key.as_str().to_string(), value.to_string());
        state.log.push(RecordedOp {
            kind: OpKind::Update,
            cart: cart.clone(),
            key: Some(key),
            entity: Some(entity),
        });
        Ok(entity)
    }

    async fn delete(&self, cart: &CartId, entity: EntityId) -> Result<(), ClientError> {
        let mut state = self.state();
        let key = state.key_of(cart, entity);
        if let Some(key) = key {
            if state.failing.contains(&(OpKind::Delete, key)) {
                return Err(rejected(OpKind::Delete, format!("{key} refused")));
            }
        }
        let removed = state
            .carts
            .get_mut(cart)
            .and_then(|records| records.remove(&entity));
        if removed.is_none() {
            return Err(rejected(OpKind::Delete, format!("no metafield {entity}")));
        }
        state.log.push(RecordedOp {
            kind: OpKind::Delete,
            cart: cart.clone(),
            key,
            entity: Some(entity),
        });
        Ok(())
    }
}
