//! Checkout sync library: remote metafield clients and the reconciliation
//! engine.
//!
//! - [`client`]: [`MetafieldClient`] contract
//! - [`memory`]: [`InMemoryMetafieldClient`]
//! - [`graphql`]: [`GraphqlMetafieldClient`] for the storefront GraphQL API
//! - [`engine`]: planning, execution and [`ReconciliationResult`]
//! - [`cancel`]: [`CancelScope`] tying remote calls to a session

pub mod cancel;
pub mod client;
pub mod engine;
pub mod error;
pub mod graphql;
pub mod memory;

pub use cancel::{cancel_scope, CancelHandle, CancelScope};
pub use client::{MetafieldClient, OpKind};
pub use engine::{
    plan, snapshot_from, DeleteReason, FieldOutcome, PlannedOp, ReconciliationResult, Reconciler,
    Snapshot,
};
pub use error::{ClientError, SyncError};
pub use graphql::GraphqlMetafieldClient;
pub use memory::{InMemoryMetafieldClient, RecordedOp};
