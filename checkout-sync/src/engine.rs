//! Reconciliation engine.
//!
//! Plans the create/update/delete operations that bring the cart's remote
//! records in line with a desired set of field values, runs them
//! concurrently, and joins them into one per-key outcome map.
//!
//! Planning is a pure function over the registry, the desired values and a
//! snapshot of the remote records. Execution never rolls back: a failed key
//! is reported and left for the next submission to retry.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use checkout_core::{
    CartId, EntityId, FieldKey, FieldRecord, FieldRegistry, FieldValues, RemoteMetafield, Segment,
};

use crate::cancel::CancelScope;
use crate::client::{MetafieldClient, OpKind};
use crate::error::{ClientError, SyncError};

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// Last known remote state, one record per field key.
///
/// Extra records listed for a key that already has one are kept aside in
/// `duplicates` so the planner can prune them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub records: BTreeMap<FieldKey, FieldRecord>,
    pub duplicates: Vec<(FieldKey, EntityId)>,
}

impl Snapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: FieldKey) -> Option<&FieldRecord> {
        self.records.get(&key)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl FromIterator<(FieldKey, FieldRecord)> for Snapshot {
    fn from_iter<I: IntoIterator<Item = (FieldKey, FieldRecord)>>(iter: I) -> Self {
        Self {
            records: iter.into_iter().collect(),
            duplicates: Vec::new(),
        }
    }
}

impl IntoIterator for Snapshot {
    type Item = (FieldKey, FieldRecord);
    type IntoIter = std::collections::btree_map::IntoIter<FieldKey, FieldRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.into_iter()
    }
}

/// Convert listed records into a [`Snapshot`].
///
/// Records whose key is not a known field are ignored. When the store holds
/// several records for one key the lowest entity id wins and the rest are
/// listed as duplicates.
pub fn snapshot_from(records: Vec<RemoteMetafield>) -> Snapshot {
    let mut snapshot = Snapshot::new();
    for record in records {
        let Ok(key) = record.key.parse::<FieldKey>() else {
            debug!(key = %record.key, "ignoring foreign metafield");
            continue;
        };
        let existing = snapshot.get(key).and_then(|r| r.remote_entity_id);
        match existing {
            Some(existing) if existing <= record.entity_id => {
                debug!(key = %key, entity = %record.entity_id, "duplicate metafield");
                snapshot.duplicates.push((key, record.entity_id));
            }
            _ => {
                if let Some(displaced) = existing {
                    debug!(key = %key, entity = %displaced, "duplicate metafield");
                    snapshot.duplicates.push((key, displaced));
                }
                snapshot
                    .records
                    .insert(key, FieldRecord::listed(key, record.value, record.entity_id));
            }
        }
    }
    snapshot.duplicates.sort();
    snapshot
}

// ---------------------------------------------------------------------------
// Planning
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteReason {
    /// The field is not collected for the buyer's segment.
    NotApplicable,
    /// The desired value is empty.
    Cleared,
    /// Another record for the same key is the one being kept.
    Duplicate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlannedOp {
    Create {
        key: FieldKey,
        value: String,
    },
    Update {
        key: FieldKey,
        entity: EntityId,
        value: String,
    },
    Delete {
        key: FieldKey,
        entity: EntityId,
        reason: DeleteReason,
    },
}

impl PlannedOp {
    pub fn key(&self) -> FieldKey {
        match self {
            PlannedOp::Create { key, .. }
            | PlannedOp::Update { key, .. }
            | PlannedOp::Delete { key, .. } => *key,
        }
    }

    pub fn kind(&self) -> OpKind {
        match self {
            PlannedOp::Create { .. } => OpKind::Create,
            PlannedOp::Update { .. } => OpKind::Update,
            PlannedOp::Delete { .. } => OpKind::Delete,
        }
    }

    fn prunes_duplicate(&self) -> bool {
        matches!(
            self,
            PlannedOp::Delete {
                reason: DeleteReason::Duplicate,
                ..
            }
        )
    }
}

/// The minimal operation set for `desired` against `snapshot`, at most one
/// operation per field key, in canonical key order. Deletes for duplicate
/// records follow, ordered by key and entity id.
pub fn plan(
    registry: &FieldRegistry,
    segment: &Segment,
    desired: &FieldValues,
    snapshot: &Snapshot,
) -> Vec<PlannedOp> {
    let effective = registry.effective_values(segment, desired);
    let mut ops = Vec::new();

    for definition in registry.definitions() {
        let key = definition.key;
        let record = snapshot.get(key);
        let remote_id = record.and_then(|r| r.remote_entity_id);

        if !definition.applies_to(segment) {
            if let Some(entity) = remote_id {
                ops.push(PlannedOp::Delete {
                    key,
                    entity,
                    reason: DeleteReason::NotApplicable,
                });
            }
            continue;
        }

        let value = match effective.get(key) {
            Some(value) if effective.is_filled(key) => value,
            _ => {
                if let Some(entity) = remote_id {
                    ops.push(PlannedOp::Delete {
                        key,
                        entity,
                        reason: DeleteReason::Cleared,
                    });
                }
                continue;
            }
        };

        match record {
            Some(FieldRecord {
                remote_entity_id: Some(entity),
                is_known_valid: true,
                value: remote,
                ..
            }) => {
                if remote != value {
                    ops.push(PlannedOp::Update {
                        key,
                        entity: *entity,
                        value: value.to_string(),
                    });
                }
            }
            _ => ops.push(PlannedOp::Create {
                key,
                value: value.to_string(),
            }),
        }
    }

    for &(key, entity) in &snapshot.duplicates {
        ops.push(PlannedOp::Delete {
            key,
            entity,
            reason: DeleteReason::Duplicate,
        });
    }
    ops
}

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldOutcome {
    /// No operation was needed.
    Unchanged,
    Created(EntityId),
    Updated(EntityId),
    Deleted,
    Failed { op: OpKind, error: ClientError },
    /// The cancellation scope fired before the operation finished.
    Cancelled { op: OpKind },
}

impl FieldOutcome {
    pub fn is_ok(&self) -> bool {
        !matches!(self, FieldOutcome::Failed { .. } | FieldOutcome::Cancelled { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconciliationResult {
    /// Every issued operation succeeded.
    pub success: bool,
    pub outcomes: BTreeMap<FieldKey, FieldOutcome>,
    /// Gate verdict from the desired values alone.
    pub is_complete: bool,
    pub missing_required: BTreeSet<FieldKey>,
}

impl ReconciliationResult {
    pub fn failed_keys(&self) -> BTreeSet<FieldKey> {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| matches!(outcome, FieldOutcome::Failed { .. }))
            .map(|(key, _)| *key)
            .collect()
    }

    pub fn was_cancelled(&self) -> bool {
        self.outcomes
            .values()
            .any(|outcome| matches!(outcome, FieldOutcome::Cancelled { .. }))
    }

    /// Number of operations that were issued (successful or not).
    pub fn issued(&self) -> usize {
        self.outcomes
            .values()
            .filter(|outcome| !matches!(outcome, FieldOutcome::Unchanged))
            .count()
    }
}

// ---------------------------------------------------------------------------
// Reconciler
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct Reconciler {
    client: Arc<dyn MetafieldClient>,
    registry: Arc<FieldRegistry>,
}

impl Reconciler {
    pub fn new(client: Arc<dyn MetafieldClient>, registry: Arc<FieldRegistry>) -> Self {
        Self { client, registry }
    }

    pub fn registry(&self) -> &FieldRegistry {
        &self.registry
    }

    /// List the cart's records and convert them into a [`Snapshot`].
    pub async fn snapshot(&self, cart: &CartId) -> Result<Snapshot, ClientError> {
        let records = self.client.list(cart).await?;
        Ok(snapshot_from(records))
    }

    /// Plan against `snapshot`, execute, and join every operation.
    pub async fn reconcile(
        &self,
        cart: &CartId,
        segment: &Segment,
        desired: &FieldValues,
        snapshot: &Snapshot,
        scope: &CancelScope,
    ) -> ReconciliationResult {
        let ops = plan(&self.registry, segment, desired, snapshot);
        let missing_required = self.registry.missing_required(segment, desired);

        let mut outcomes: BTreeMap<FieldKey, FieldOutcome> = self
            .registry
            .definitions()
            .iter()
            .map(|d| (d.key, FieldOutcome::Unchanged))
            .collect();

        debug!(cart = %cart, segment = %segment, ops = ops.len(), "reconciling metafields");

        let results: Vec<FieldOutcome> = if scope.is_cancelled() {
            ops.iter()
                .map(|op| FieldOutcome::Cancelled { op: op.kind() })
                .collect()
        } else {
            // A task that never reports back stays failed.
            let mut results: Vec<FieldOutcome> = ops
                .iter()
                .map(|op| FieldOutcome::Failed {
                    op: op.kind(),
                    error: ClientError::Transport("operation did not complete".to_string()),
                })
                .collect();
            let mut tasks = JoinSet::new();
            for (index, op) in ops.iter().cloned().enumerate() {
                let client = Arc::clone(&self.client);
                let cart = cart.clone();
                let scope = scope.clone();
                tasks.spawn(async move {
                    let kind = op.kind();
                    let outcome = scope
                        .guard(execute(client.as_ref(), &cart, op))
                        .await
                        .unwrap_or(FieldOutcome::Cancelled { op: kind });
                    (index, outcome)
                });
            }
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok((index, outcome)) => results[index] = outcome,
                    Err(e) => warn!(cart = %cart, error = %e, "metafield task did not complete"),
                }
            }
            results
        };

        let mut pruned = 0usize;
        for (op, outcome) in ops.iter().zip(results) {
            // A pruned duplicate only surfaces in the key's outcome when it failed.
            if op.prunes_duplicate() && outcome.is_ok() {
                pruned += 1;
                continue;
            }
            outcomes.insert(op.key(), outcome);
        }
        if pruned > 0 {
            debug!(cart = %cart, pruned, "pruned duplicate metafields");
        }

        let success = outcomes.values().all(FieldOutcome::is_ok);
        let result = ReconciliationResult {
            success,
            outcomes,
            is_complete: missing_required.is_empty(),
            missing_required,
        };

        for (key, outcome) in &result.outcomes {
            if let FieldOutcome::Failed { op, error } = outcome {
                warn!(cart = %cart, key = %key, op = %op, error = %error, "metafield operation failed");
            }
        }
        info!(
            cart = %cart,
            segment = %segment,
            issued = result.issued(),
            success = result.success,
            complete = result.is_complete,
            "reconciliation finished"
        );
        result
    }

    /// Fresh snapshot followed by [`Reconciler::reconcile`]. The listing is
    /// bound to `scope` as well; cancelling it returns [`SyncError::Cancelled`].
    pub async fn sync(
        &self,
        cart: &CartId,
        segment: &Segment,
        desired: &FieldValues,
        scope: &CancelScope,
    ) -> Result<ReconciliationResult, SyncError> {
        let Some(listed) = scope.guard(self.snapshot(cart)).await else {
            debug!(cart = %cart, "metafield listing cancelled");
            return Err(SyncError::Cancelled);
        };
        let snapshot = listed?;
        Ok(self
            .reconcile(cart, segment, desired, &snapshot, scope)
            .await)
    }
}

async fn execute(client: &dyn MetafieldClient, cart: &CartId, op: PlannedOp) -> FieldOutcome {
    let kind = op.kind();
    let result = match op {
        PlannedOp::Create { key, value } => client
            .create(cart, key, &value)
            .await
            .map(FieldOutcome::Created),
        PlannedOp::Update { key, entity, value } => client
            .update(cart, entity, key, &value)
            .await
            .map(FieldOutcome::Updated),
        PlannedOp::Delete { entity, .. } => client
            .delete(cart, entity)
            .await
            .map(|()| FieldOutcome::Deleted),
    };
    result.unwrap_or_else(|error| FieldOutcome::Failed { op: kind, error })
}

#[cfg(test)]
mod tests {
    use super::*;
    use checkout_core::registry::{DEALER_SEGMENT, STANDARD_SEGMENT};

    fn record(key: FieldKey, value: &str, id: u64) -> (FieldKey, FieldRecord) {
        (key, FieldRecord::listed(key, value, EntityId(id)))
    }

    #[test]
    fn snapshot_ignores_foreign_keys_and_keeps_lowest_duplicate() {
        let snapshot = snapshot_from(vec![
            RemoteMetafield {
                entity_id: EntityId(9),
                key: "bottler".into(),
                value: "late".into(),
            },
            RemoteMetafield {
                entity_id: EntityId(3),
                key: "bottler".into(),
                value: "early".into(),
            },
            RemoteMetafield {
                entity_id: EntityId(4),
                key: "gift_note".into(),
                value: "hi".into(),
            },
        ]);
        assert_eq!(snapshot.len(), 1);
        let bottler = snapshot.get(FieldKey::Bottler).unwrap();
        assert_eq!(bottler.value, "early");
        assert_eq!(bottler.remote_entity_id, Some(EntityId(3)));
        assert_eq!(snapshot.duplicates, vec![(FieldKey::Bottler, EntityId(9))]);
    }

    #[test]
    fn plan_prunes_duplicates_after_the_kept_record() {
        let registry = FieldRegistry::builtin();
        let segment = Segment::from(DEALER_SEGMENT);
        let snapshot = snapshot_from(vec![
            RemoteMetafield {
                entity_id: EntityId(5),
                key: "team_name".into(),
                value: "Reds".into(),
            },
            RemoteMetafield {
                entity_id: EntityId(2),
                key: "team_name".into(),
                value: "Reds".into(),
            },
            RemoteMetafield {
                entity_id: EntityId(7),
                key: "team_name".into(),
                value: "Blues".into(),
            },
        ]);
        let desired: FieldValues = [(FieldKey::TeamName, "Reds")].into_iter().collect();

        let ops = plan(&registry, &segment, &desired, &snapshot);
        assert_eq!(
            ops,
            vec![
                PlannedOp::Delete {
                    key: FieldKey::TeamName,
                    entity: EntityId(5),
                    reason: DeleteReason::Duplicate
                },
                PlannedOp::Delete {
                    key: FieldKey::TeamName,
                    entity: EntityId(7),
                    reason: DeleteReason::Duplicate
                },
            ]
        );
    }

    #[test]
    fn plan_updates_only_changed_values() {
        let registry = FieldRegistry::builtin();
        let segment = Segment::from(STANDARD_SEGMENT);
        let snapshot: Snapshot = [
            record(FieldKey::Budgeting, "Shared Budget", 1),
            record(FieldKey::Bottler, "Acme", 2),
        ]
        .into_iter()
        .collect();
        let desired: FieldValues = [
            (FieldKey::Budgeting, "Shared Budget"),
            (FieldKey::Bottler, "Beta"),
        ]
        .into_iter()
        .collect();

        let ops = plan(&registry, &segment, &desired, &snapshot);
        assert_eq!(
            ops,
            vec![PlannedOp::Update {
                key: FieldKey::Bottler,
                entity: EntityId(2),
                value: "Beta".into()
            }]
        );
    }

    #[test]
    fn plan_deletes_cleared_and_inapplicable_records() {
        let registry = FieldRegistry::builtin();
        let segment = Segment::from(DEALER_SEGMENT);
        let snapshot: Snapshot = [
            record(FieldKey::Bottler, "Acme", 2),
            record(FieldKey::TeamName, "Reds", 3),
        ]
        .into_iter()
        .collect();
        let desired: FieldValues = [(FieldKey::TeamName, "   ")].into_iter().collect();

        let ops = plan(&registry, &segment, &desired, &snapshot);
        assert_eq!(
            ops,
            vec![
                PlannedOp::Delete {
                    key: FieldKey::Bottler,
                    entity: EntityId(2),
                    reason: DeleteReason::NotApplicable
                },
                PlannedOp::Delete {
                    key: FieldKey::TeamName,
                    entity: EntityId(3),
                    reason: DeleteReason::Cleared
                },
            ]
        );
    }

    #[test]
    fn plan_recreates_records_not_known_valid() {
        let registry = FieldRegistry::builtin();
        let segment = Segment::from(DEALER_SEGMENT);
        let mut stale = FieldRecord::listed(FieldKey::TeamName, "Reds", EntityId(3));
        stale.is_known_valid = false;
        let snapshot: Snapshot = [(FieldKey::TeamName, stale)].into_iter().collect();
        let desired: FieldValues = [(FieldKey::TeamName, "Reds")].into_iter().collect();

        let ops = plan(&registry, &segment, &desired, &snapshot);
        assert_eq!(
            ops,
            vec![PlannedOp::Create {
                key: FieldKey::TeamName,
                value: "Reds".into()
            }]
        );
    }

    #[test]
    fn plan_applies_forced_values() {
        let registry = FieldRegistry::builtin();
        let segment = Segment::from(STANDARD_SEGMENT);
        let desired: FieldValues = [(FieldKey::Budgeting, "100% BODYARMOR")]
            .into_iter()
            .collect();
        let ops = plan(&registry, &segment, &desired, &Snapshot::new());
        assert!(ops.contains(&PlannedOp::Create {
            key: FieldKey::PoNumber,
            value: "NA".into()
        }));
    }
}
