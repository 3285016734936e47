//! Checkout flow library: step machine and session orchestration.
//!
//! - [`controller`]: [`StepController`] and [`CheckoutFlowState`]
//! - [`session`]: [`CheckoutSession`]: load, edit, submit, teardown
//! - [`session_store`]: [`SessionCache`] persistence
//! - [`telemetry`]: [`FlowTelemetry`] hook
//! - [`error`]: [`FlowError`], [`ValidationError`], [`StoreError`]

pub mod controller;
pub mod error;
pub mod session;
pub mod session_store;
pub mod telemetry;

pub use controller::{CheckoutFlowState, GateDecision, Invalidation, NavigateMode, StepController};
pub use error::{FlowError, StoreError, ValidationError};
pub use session::{CheckoutSession, SessionOptions, SubmitOutcome, TeardownHandle};
pub use session_store::SessionCache;
pub use telemetry::{FlowTelemetry, RecordingTelemetry, TelemetryEvent, TracingTelemetry};

/// Install a `tracing` subscriber honouring `RUST_LOG`, defaulting to
/// `info`. Safe to call more than once.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}
