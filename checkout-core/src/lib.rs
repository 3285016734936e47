//! Checkout core library: domain types, field registry, configuration.
//!
//! - [`types`]: step, segment, field and record types
//! - [`registry`]: [`FieldRegistry`] and per-segment coupling rules
//! - [`config`]: [`CheckoutConfig`]
//! - [`error`]: [`RegistryError`], [`EditError`], [`ConfigError`]

pub mod config;
pub mod error;
pub mod registry;
pub mod types;

pub use config::CheckoutConfig;
pub use error::{ConfigError, EditError, RegistryError};
pub use registry::{CouplingRule, FieldRegistry, FieldTable, SegmentTable};
pub use types::{
    CartId, ChoiceOption, EntityId, FieldDefinition, FieldKey, FieldKind, FieldRecord,
    FieldValues, RemoteMetafield, Segment, StepStatus, StepType,
};
