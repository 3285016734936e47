//! Domain types shared by the step machine and the reconciliation engine.
//!
//! Field access goes through the closed [`FieldKey`] enumeration; there is no
//! string-keyed lookup of customer-info fields anywhere in the workspace.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// Identifier of the cart the remote records are scoped to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CartId(pub String);

impl fmt::Display for CartId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for CartId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for CartId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Buyer classification selecting which fields are collected.
///
/// Customer-group ids convert through `From<u64>`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Segment(pub String);

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for Segment {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for Segment {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl From<u64> for Segment {
    fn from(group_id: u64) -> Self {
        Self(group_id.to_string())
    }
}

/// Opaque per-record id assigned by the remote store. Always nonzero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub u64);

impl EntityId {
    /// Map the store's raw id onto an `EntityId`; `0` means "no record".
    pub fn from_raw(raw: u64) -> Option<Self> {
        (raw != 0).then_some(Self(raw))
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// ---------------------------------------------------------------------------
// Steps
// ---------------------------------------------------------------------------

/// Checkout step, in flow order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum StepType {
    Customer,
    CustomerInfo,
    Shipping,
    Billing,
    Payment,
}

impl StepType {
    pub fn all() -> &'static [StepType] {
        &[
            StepType::Customer,
            StepType::CustomerInfo,
            StepType::Shipping,
            StepType::Billing,
            StepType::Payment,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StepType::Customer => "customer",
            StepType::CustomerInfo => "customerinfo",
            StepType::Shipping => "shipping",
            StepType::Billing => "billing",
            StepType::Payment => "payment",
        }
    }
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-step status computed by the external step subsystems.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepStatus {
    #[serde(rename = "type")]
    pub step_type: StepType,
    pub is_required: bool,
    pub is_complete: bool,
    #[serde(default)]
    pub is_active: bool,
    #[serde(default = "default_true")]
    pub is_editable: bool,
}

fn default_true() -> bool {
    true
}

impl StepStatus {
    pub fn new(step_type: StepType, is_required: bool, is_complete: bool) -> Self {
        Self {
            step_type,
            is_required,
            is_complete,
            is_active: false,
            is_editable: true,
        }
    }

    pub fn active(mut self) -> Self {
        self.is_active = true;
        self
    }
}

// ---------------------------------------------------------------------------
// Fields
// ---------------------------------------------------------------------------

/// Every customer-info field the checkout knows how to collect.
///
/// Declaration order is the canonical display and reconciliation order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum FieldKey {
    Budgeting,
    ProgramId,
    Bottler,
    PoNumber,
    AssignedProgramId,
    TeamName,
}

impl FieldKey {
    pub fn all() -> &'static [FieldKey] {
        &[
            FieldKey::Budgeting,
            FieldKey::ProgramId,
            FieldKey::Bottler,
            FieldKey::PoNumber,
            FieldKey::AssignedProgramId,
            FieldKey::TeamName,
        ]
    }

    /// Metafield key used in the remote store.
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldKey::Budgeting => "budgeting",
            FieldKey::ProgramId => "program_id",
            FieldKey::Bottler => "bottler",
            FieldKey::PoNumber => "po_number",
            FieldKey::AssignedProgramId => "assigned_program_id",
            FieldKey::TeamName => "team_name",
        }
    }
}

impl fmt::Display for FieldKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FieldKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FieldKey::all()
            .iter()
            .copied()
            .find(|key| key.as_str() == s)
            .ok_or_else(|| format!("unknown field key '{s}'"))
    }
}

/// How a field is collected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    #[default]
    Text,
    #[serde(alias = "dropdown")]
    Choice,
}

/// One selectable option of a choice field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChoiceOption {
    pub label: String,
    pub value: String,
}

impl ChoiceOption {
    pub fn new(label: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            value: value.into(),
        }
    }
}

/// Static description of a collectible attribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDefinition {
    pub key: FieldKey,
    pub label: String,
    #[serde(default)]
    pub kind: FieldKind,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<ChoiceOption>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub placeholder: Option<String>,
    /// `false` for fields that only become required through a coupling rule.
    #[serde(default = "default_true")]
    pub required: bool,
    #[serde(rename = "segments")]
    pub applicable_segments: BTreeSet<Segment>,
}

impl FieldDefinition {
    pub fn applies_to(&self, segment: &Segment) -> bool {
        self.applicable_segments.contains(segment)
    }
}

/// Desired (user-entered) field values.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FieldValues(BTreeMap<FieldKey, String>);

impl FieldValues {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw value, including empty strings.
    pub fn get(&self, key: FieldKey) -> Option<&str> {
        self.0.get(&key).map(String::as_str)
    }

    /// Value if it is non-empty after trimming.
    pub fn filled(&self, key: FieldKey) -> Option<&str> {
        self.get(key).filter(|v| !v.trim().is_empty())
    }

    pub fn is_filled(&self, key: FieldKey) -> bool {
        self.filled(key).is_some()
    }

    pub fn set(&mut self, key: FieldKey, value: impl Into<String>) {
        self.0.insert(key, value.into());
    }

    pub fn clear(&mut self, key: FieldKey) {
        self.0.remove(&key);
    }

    pub fn retain(&mut self, mut keep: impl FnMut(FieldKey) -> bool) {
        self.0.retain(|key, _| keep(*key));
    }

    pub fn iter(&self) -> impl Iterator<Item = (FieldKey, &str)> {
        self.0.iter().map(|(k, v)| (*k, v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<V: Into<String>> FromIterator<(FieldKey, V)> for FieldValues {
    fn from_iter<I: IntoIterator<Item = (FieldKey, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k, v.into())).collect())
    }
}

/// Local belief about what exists remotely for one key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldRecord {
    pub key: FieldKey,
    pub value: String,
    /// `None` until the store has assigned an id.
    pub remote_entity_id: Option<EntityId>,
    pub is_known_valid: bool,
}

impl FieldRecord {
    /// A record freshly observed in a remote listing.
    pub fn listed(key: FieldKey, value: impl Into<String>, entity_id: EntityId) -> Self {
        Self {
            key,
            value: value.into(),
            remote_entity_id: Some(entity_id),
            is_known_valid: true,
        }
    }
}

/// Raw record as returned by the remote store; keys outside [`FieldKey`]
/// belong to other integrations and are left alone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteMetafield {
    pub entity_id: EntityId,
    pub key: String,
    pub value: String,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
