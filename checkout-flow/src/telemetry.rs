//! Outbound telemetry hook for step transitions.

use std::sync::{Mutex, MutexGuard};

use tracing::info;

use checkout_core::StepType;

/// Receives step-level events. Implementations forward them to whatever
/// analytics pipeline the embedder runs.
pub trait FlowTelemetry: Send + Sync {
    fn step_viewed(&self, step: StepType);

    fn step_completed(&self, step: StepType);

    fn checkout_exited(&self) {}
}

/// Emits every event as a `tracing` record.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingTelemetry;

impl FlowTelemetry for TracingTelemetry {
    fn step_viewed(&self, step: StepType) {
        info!(step = %step, "checkout step viewed");
    }

    fn step_completed(&self, step: StepType) {
        info!(step = %step, "checkout step completed");
    }

    fn checkout_exited(&self) {
        info!("checkout exited");
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TelemetryEvent {
    StepViewed(StepType),
    StepCompleted(StepType),
    CheckoutExited,
}

/// Keeps events in memory, in emission order.
#[derive(Debug, Default)]
pub struct RecordingTelemetry {
    events: Mutex<Vec<TelemetryEvent>>,
}

impl RecordingTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    fn events_mut(&self) -> MutexGuard<'_, Vec<TelemetryEvent>> {
        self.events.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn events(&self) -> Vec<TelemetryEvent> {
        self.events_mut().clone()
    }

    pub fn take(&self) -> Vec<TelemetryEvent> {
        std::mem::take(&mut *self.events_mut())
    }
}

impl FlowTelemetry for RecordingTelemetry {
    fn step_viewed(&self, step: StepType) {
        self.events_mut().push(TelemetryEvent::StepViewed(step));
    }

    fn step_completed(&self, step: StepType) {
        self.events_mut().push(TelemetryEvent::StepCompleted(step));
    }

    fn checkout_exited(&self) {
        self.events_mut().push(TelemetryEvent::CheckoutExited);
    }
}
