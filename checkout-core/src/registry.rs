//! Field Registry: which customer-info fields a segment collects, which of
//! them gate the flow, and how fields constrain each other.
//!
//! # Table layout
//!
//! ```yaml
//! fields:
//!   - key: budgeting
//!     label: Budgeting
//!     kind: choice
//!     options: [{ label: "100% BODYARMOR", value: "100% BODYARMOR" }]
//!     segments: [standard]
//! segments:
//!   standard:
//!     rules:
//!       - rule: force_value
//!         when: budgeting
//!         equals: "100% BODYARMOR"
//!         target: po_number
//!         value: "NA"
//!   dealer: {}
//! ```
//!
//! Every segment listed under `segments` is eligible for the customer-info
//! gate. Adding a segment means adding a table entry; nothing else branches on
//! segment identity.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{EditError, RegistryError};
use crate::types::{ChoiceOption, FieldDefinition, FieldKey, FieldKind, FieldValues, Segment};

// ---------------------------------------------------------------------------
// Table types
// ---------------------------------------------------------------------------

/// A cross-field constraint declared by a segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum CouplingRule {
    /// While `when == equals`, `target` holds `value` and is not user-editable.
    ForceValue {
        when: FieldKey,
        equals: String,
        target: FieldKey,
        value: String,
    },
    /// `target` is required only while `when == equals`.
    RequireWhen {
        when: FieldKey,
        equals: String,
        target: FieldKey,
    },
}

impl CouplingRule {
    pub fn trigger(&self) -> FieldKey {
        match self {
            CouplingRule::ForceValue { when, .. } | CouplingRule::RequireWhen { when, .. } => *when,
        }
    }

    pub fn target(&self) -> FieldKey {
        match self {
            CouplingRule::ForceValue { target, .. } | CouplingRule::RequireWhen { target, .. } => {
                *target
            }
        }
    }

    fn matches(&self, trigger_value: Option<&str>) -> bool {
        let equals = match self {
            CouplingRule::ForceValue { equals, .. } | CouplingRule::RequireWhen { equals, .. } => {
                equals
            }
        };
        trigger_value == Some(equals.as_str())
    }

    /// Whether the rule's condition holds for `values`.
    pub fn is_triggered(&self, values: &FieldValues) -> bool {
        self.matches(values.get(self.trigger()))
    }
}

/// Per-segment configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentTable {
    #[serde(default)]
    pub rules: Vec<CouplingRule>,
}

/// Serialized form of a registry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldTable {
    pub fields: Vec<FieldDefinition>,
    #[serde(default)]
    pub segments: BTreeMap<Segment, SegmentTable>,
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Validated, immutable field table. Pure lookups only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldRegistry {
    definitions: Vec<FieldDefinition>,
    segments: BTreeMap<Segment, SegmentTable>,
}

impl FieldRegistry {
    /// Validate `table` and build a registry from it.
    pub fn from_table(table: FieldTable) -> Result<Self, RegistryError> {
        let FieldTable {
            fields: mut definitions,
            segments,
        } = table;
        definitions.sort_by_key(|d| d.key);

        for pair in definitions.windows(2) {
            if pair[0].key == pair[1].key {
                return Err(RegistryError::Invalid(format!(
                    "field '{}' is defined more than once",
                    pair[0].key
                )));
            }
        }

        for def in &definitions {
            if let Some(unknown) = def
                .applicable_segments
                .iter()
                .find(|s| !segments.contains_key(*s))
            {
                return Err(RegistryError::Invalid(format!(
                    "field '{}' names undeclared segment '{unknown}'",
                    def.key
                )));
            }
            if def.kind == FieldKind::Choice && def.options.is_empty() {
                return Err(RegistryError::Invalid(format!(
                    "choice field '{}' has no options",
                    def.key
                )));
            }
        }

        for (segment, entry) in &segments {
            for rule in &entry.rules {
                for key in [rule.trigger(), rule.target()] {
                    let applicable = definitions
                        .iter()
                        .any(|d| d.key == key && d.applies_to(segment));
                    if !applicable {
                        return Err(RegistryError::Invalid(format!(
                            "rule in segment '{segment}' references '{key}', which that segment does not collect"
                        )));
                    }
                }
                if rule.trigger() == rule.target() {
                    return Err(RegistryError::Invalid(format!(
                        "rule in segment '{segment}' couples '{}' to itself",
                        rule.target()
                    )));
                }
            }
        }

        Ok(Self {
            definitions,
            segments,
        })
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self, RegistryError> {
        let table: FieldTable = serde_yaml::from_str(yaml)?;
        Self::from_table(table)
    }

    /// Load and validate a table file.
    pub fn load_at(path: &Path) -> Result<Self, RegistryError> {
        let contents = std::fs::read_to_string(path).map_err(|source| RegistryError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let table: FieldTable =
            serde_yaml::from_str(&contents).map_err(|source| RegistryError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        Self::from_table(table)
    }

    /// Serializable copy of the table.
    pub fn to_table(&self) -> FieldTable {
        FieldTable {
            fields: self.definitions.clone(),
            segments: self.segments.clone(),
        }
    }

    // -- lookups ------------------------------------------------------------

    /// All definitions in canonical order, applicable or not.
    pub fn definitions(&self) -> &[FieldDefinition] {
        &self.definitions
    }

    pub fn definition(&self, key: FieldKey) -> Option<&FieldDefinition> {
        self.definitions.iter().find(|d| d.key == key)
    }

    /// Definitions collected for `segment`, in canonical order.
    pub fn definitions_for(&self, segment: &Segment) -> Vec<&FieldDefinition> {
        self.definitions
            .iter()
            .filter(|d| d.applies_to(segment))
            .collect()
    }

    pub fn is_applicable(&self, segment: &Segment, key: FieldKey) -> bool {
        self.definition(key).is_some_and(|d| d.applies_to(segment))
    }

    pub fn rules_for(&self, segment: &Segment) -> &[CouplingRule] {
        self.segments
            .get(segment)
            .map(|s| s.rules.as_slice())
            .unwrap_or(&[])
    }

    pub fn eligible_segments(&self) -> BTreeSet<Segment> {
        self.segments.keys().cloned().collect()
    }

    /// Whether buyers in `segment` go through the customer-info step at all.
    pub fn is_eligible(&self, segment: &Segment) -> bool {
        self.segments.contains_key(segment)
    }

    // -- gate ---------------------------------------------------------------

    /// Keys that are required regardless of other fields' values.
    pub fn required_keys_for(&self, segment: &Segment) -> BTreeSet<FieldKey> {
        self.definitions_for(segment)
            .into_iter()
            .filter(|d| d.required)
            .map(|d| d.key)
            .collect()
    }

    /// Required keys after coupling rules are evaluated against `values`.
    pub fn required_keys_given(&self, segment: &Segment, values: &FieldValues) -> BTreeSet<FieldKey> {
        let mut required = self.required_keys_for(segment);
        for rule in self.rules_for(segment) {
            if let CouplingRule::RequireWhen { target, .. } = rule {
                if rule.is_triggered(values) {
                    required.insert(*target);
                } else {
                    required.remove(target);
                }
            }
        }
        required
    }

    /// Values as they should exist remotely: inapplicable keys dropped,
    /// forced values applied, and conditionally-required fields whose
    /// condition does not hold cleared.
    pub fn effective_values(&self, segment: &Segment, values: &FieldValues) -> FieldValues {
        let mut effective = values.clone();
        effective.retain(|key| self.is_applicable(segment, key));
        for rule in self.rules_for(segment) {
            match rule {
                CouplingRule::ForceValue { target, value, .. } if rule.is_triggered(values) => {
                    effective.set(*target, value.clone());
                }
                CouplingRule::RequireWhen { target, .. } if !rule.is_triggered(values) => {
                    effective.clear(*target);
                }
                _ => {}
            }
        }
        effective
    }

    /// Keys currently fixed by a [`CouplingRule::ForceValue`].
    pub fn locked_keys(&self, segment: &Segment, values: &FieldValues) -> BTreeSet<FieldKey> {
        self.rules_for(segment)
            .iter()
            .filter(|rule| matches!(rule, CouplingRule::ForceValue { .. }) && rule.is_triggered(values))
            .map(CouplingRule::target)
            .collect()
    }

    /// Required keys with no non-empty effective value.
    pub fn missing_required(&self, segment: &Segment, values: &FieldValues) -> BTreeSet<FieldKey> {
        let effective = self.effective_values(segment, values);
        self.required_keys_given(segment, values)
            .into_iter()
            .filter(|key| !effective.is_filled(*key))
            .collect()
    }

    pub fn is_complete(&self, segment: &Segment, values: &FieldValues) -> bool {
        self.missing_required(segment, values).is_empty()
    }

    // -- edits --------------------------------------------------------------

    /// Apply a user edit to `values` together with the reactions of every
    /// rule triggered by `key`.
    pub fn apply_edit(
        &self,
        segment: &Segment,
        values: &mut FieldValues,
        key: FieldKey,
        value: impl Into<String>,
    ) -> Result<(), EditError> {
        if !self.is_applicable(segment, key) {
            return Err(EditError::NotApplicable {
                key,
                segment: segment.clone(),
            });
        }
        if let Some(rule) = self.rules_for(segment).iter().find(|rule| {
            matches!(rule, CouplingRule::ForceValue { .. })
                && rule.target() == key
                && rule.is_triggered(values)
        }) {
            return Err(EditError::Locked {
                key,
                by: rule.trigger(),
            });
        }

        let was_triggered: Vec<bool> = self
            .rules_for(segment)
            .iter()
            .map(|rule| rule.is_triggered(values))
            .collect();
        values.set(key, value);

        for (rule, was) in self.rules_for(segment).iter().zip(was_triggered) {
            if rule.trigger() != key {
                continue;
            }
            let now = rule.is_triggered(values);
            match rule {
                CouplingRule::ForceValue { target, value, .. } => {
                    if now {
                        values.set(*target, value.clone());
                    } else if was {
                        values.clear(*target);
                    }
                }
                CouplingRule::RequireWhen { target, .. } => {
                    if !now {
                        values.clear(*target);
                    }
                }
            }
        }
        Ok(())
    }

    // -- builtin ------------------------------------------------------------

    /// The storefront's default table: a `standard` segment collecting
    /// budgeting details and a `dealer` segment collecting a team name.
    pub fn builtin() -> Self {
        let standard = Segment::from(STANDARD_SEGMENT);
        let dealer = Segment::from(DEALER_SEGMENT);
        let only = |segment: &Segment| BTreeSet::from([segment.clone()]);
        let choice = |key, label: &str, options: &[&str], segment: &Segment| FieldDefinition {
            key,
            label: label.to_string(),
            kind: FieldKind::Choice,
            options: options.iter().map(|o| ChoiceOption::new(*o, *o)).collect(),
            placeholder: None,
            required: true,
            applicable_segments: only(segment),
        };
        let text = |key, label: &str, required, segment: &Segment| FieldDefinition {
            key,
            label: label.to_string(),
            kind: FieldKind::Text,
            options: Vec::new(),
            placeholder: Some(label.to_string()),
            required,
            applicable_segments: only(segment),
        };

        let definitions = vec![
            choice(
                FieldKey::Budgeting,
                "Budgeting",
                &[FORCED_BUDGETING, "Shared Budget", "Bottler Budget"],
                &standard,
            ),
            choice(
                FieldKey::ProgramId,
                "Program ID",
                &[CUSTOMER_PROGRAM, "NATIONAL", "REGIONAL"],
                &standard,
            ),
            text(FieldKey::Bottler, "Bottler", true, &standard),
            text(FieldKey::PoNumber, "PO Number", true, &standard),
            text(
                FieldKey::AssignedProgramId,
                "Assigned Program ID",
                false,
                &standard,
            ),
            text(FieldKey::TeamName, "Team Name", true, &dealer),
        ];

        let segments = BTreeMap::from([
            (
                standard,
                SegmentTable {
                    rules: vec![
                        CouplingRule::ForceValue {
                            when: FieldKey::Budgeting,
                            equals: FORCED_BUDGETING.to_string(),
                            target: FieldKey::PoNumber,
                            value: "NA".to_string(),
                        },
                        CouplingRule::RequireWhen {
                            when: FieldKey::ProgramId,
                            equals: CUSTOMER_PROGRAM.to_string(),
                            target: FieldKey::AssignedProgramId,
                        },
                    ],
                },
            ),
            (dealer, SegmentTable::default()),
        ]);

        Self {
            definitions,
            segments,
        }
    }
}

pub const STANDARD_SEGMENT: &str = "standard";
pub const DEALER_SEGMENT: &str = "dealer";
const FORCED_BUDGETING: &str = "100% BODYARMOR";
const CUSTOMER_PROGRAM: &str = "CUSTOMER";

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
