//! Checkout step state machine.
//!
//! The controller owns which step is active. The step sequence and each
//! step's completion come from outside; the controller only decides where
//! the buyer is, reacts to invalidation signals, and consumes the
//! customer-info verdict once reconciliation has joined.
//!
//! States are `Uninitialized` plus one state per [`StepType`]. There is no
//! terminal state: the flow ends when the session is torn down.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use checkout_core::{StepStatus, StepType};
use checkout_sync::ReconciliationResult;

use crate::error::FlowError;
use crate::telemetry::{FlowTelemetry, TracingTelemetry};

/// Which slot [`StepController::navigate_to`] writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NavigateMode {
    /// The buyer is moved to the step.
    #[default]
    Active,
    /// The step becomes the fallback when no step is explicitly active.
    Default,
}

/// External events that can invalidate the buyer's position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Invalidation {
    /// A fresh observation of whether a shipping option is selected.
    ShippingOptions { has_selected: bool },
    /// Cart contents changed under the buyer.
    CartChanged,
    SignedOut,
}

/// What the controller did with a customer-info verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    /// Customer info is complete. `to` is the step that follows it, if the
    /// sequence has one.
    Advanced { to: Option<StepType> },
    /// Saved, but required fields are still missing.
    HeldIncomplete,
    /// One or more remote writes failed.
    HeldOnFailure,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutFlowState {
    pub active_step_type: Option<StepType>,
    pub default_step_type: Option<StepType>,
    #[serde(skip)]
    pub last_error: Option<FlowError>,
}

impl CheckoutFlowState {
    /// Active step, falling back to the default step.
    pub fn effective_step(&self) -> Option<StepType> {
        self.active_step_type.or(self.default_step_type)
    }
}

pub struct StepController {
    /// `None` until [`StepController::initialize`].
    steps: Option<Vec<StepStatus>>,
    state: CheckoutFlowState,
    /// Last shipping-option observation.
    shipping_selected: Option<bool>,
    telemetry: Arc<dyn FlowTelemetry>,
}

impl Default for StepController {
    fn default() -> Self {
        Self::new(Arc::new(TracingTelemetry))
    }
}

impl StepController {
    pub fn new(telemetry: Arc<dyn FlowTelemetry>) -> Self {
        Self {
            steps: None,
            state: CheckoutFlowState::default(),
            shipping_selected: None,
            telemetry,
        }
    }

    // -- lifecycle ----------------------------------------------------------

    /// Record the step sequence. Does not pick a step.
    pub fn initialize(&mut self, steps: Vec<StepStatus>) {
        debug!(steps = steps.len(), "step controller initialized");
        self.steps = Some(steps);
    }

    /// Replace the sequence after the external step computation re-ran.
    pub fn set_steps(&mut self, steps: Vec<StepStatus>) {
        self.steps = Some(steps);
    }

    pub fn is_initialized(&self) -> bool {
        self.steps.is_some()
    }

    pub fn steps(&self) -> &[StepStatus] {
        self.steps.as_deref().unwrap_or(&[])
    }

    // -- accessors ----------------------------------------------------------

    pub fn state(&self) -> &CheckoutFlowState {
        &self.state
    }

    pub fn active_step(&self) -> Option<StepType> {
        self.state.active_step_type
    }

    pub fn default_step(&self) -> Option<StepType> {
        self.state.default_step_type
    }

    pub fn effective_step(&self) -> Option<StepType> {
        self.state.effective_step()
    }

    pub fn last_error(&self) -> Option<&FlowError> {
        self.state.last_error.as_ref()
    }

    /// Required steps with the active flag set on the effective step only.
    pub fn rendered_steps(&self) -> Vec<StepStatus> {
        let current = self.effective_step();
        self.steps()
            .iter()
            .filter(|s| s.is_required)
            .map(|s| StepStatus {
                is_active: Some(s.step_type) == current,
                ..s.clone()
            })
            .collect()
    }

    fn position(&self, step: StepType) -> Option<usize> {
        self.steps().iter().position(|s| s.step_type == step)
    }

    // -- navigation ---------------------------------------------------------

    /// Move to `step`. Returns `false` and leaves the state untouched when
    /// `step` is not in the sequence or is already the active step.
    pub fn navigate_to(&mut self, step: StepType, mode: NavigateMode) -> bool {
        if self.position(step).is_none() {
            debug!(step = %step, "navigation to unknown step ignored");
            return false;
        }
        if self.state.active_step_type == Some(step) {
            return false;
        }
        match mode {
            NavigateMode::Active => self.state.active_step_type = Some(step),
            NavigateMode::Default => self.state.default_step_type = Some(step),
        }
        self.state.last_error = None;
        self.telemetry.step_viewed(step);
        debug!(step = %step, mode = ?mode, "navigated");
        true
    }

    /// Move to the step the external computation flagged active, marking
    /// the one before it completed. Refused while a blocking error is
    /// pending.
    pub fn navigate_to_next_incomplete(&mut self, mode: NavigateMode) -> bool {
        if self.state.last_error.as_ref().is_some_and(FlowError::is_blocking) {
            debug!("next-incomplete navigation blocked by pending error");
            return false;
        }
        let steps = self.steps();
        let Some(index) = steps.iter().position(|s| s.is_active) else {
            return false;
        };
        let next = steps[index].step_type;
        let previous = steps[index.saturating_sub(1)].step_type;
        self.telemetry.step_completed(previous);
        self.navigate_to(next, mode)
    }

    // -- external signals ---------------------------------------------------

    /// React to an invalidation signal. Returns whether the state changed.
    pub fn on_external_invalidation(&mut self, signal: Invalidation) -> bool {
        match signal {
            Invalidation::ShippingOptions { has_selected } => {
                let previously = self.shipping_selected.replace(has_selected);
                if previously != Some(true) || has_selected || !self.at_or_after(StepType::Shipping) {
                    return false;
                }
                warn!("selected shipping option expired; returning to shipping");
                self.navigate_to(StepType::Shipping, NavigateMode::Active);
                self.state.last_error = Some(FlowError::ShippingOptionExpired);
                true
            }
            Invalidation::CartChanged => self.navigate_to(StepType::Shipping, NavigateMode::Active),
            Invalidation::SignedOut => {
                self.shipping_selected = None;
                self.navigate_to(StepType::Customer, NavigateMode::Active)
            }
        }
    }

    fn at_or_after(&self, step: StepType) -> bool {
        match (self.effective_step().and_then(|s| self.position(s)), self.position(step)) {
            (Some(current), Some(target)) => current >= target,
            _ => false,
        }
    }

    /// Consume a joined reconciliation result for the customer-info step.
    pub fn on_customer_info_verdict(&mut self, result: &ReconciliationResult) -> GateDecision {
        if !result.success {
            return GateDecision::HeldOnFailure;
        }
        if !result.is_complete {
            self.navigate_to(StepType::CustomerInfo, NavigateMode::Active);
            return GateDecision::HeldIncomplete;
        }
        self.telemetry.step_completed(StepType::CustomerInfo);
        let to = self
            .position(StepType::CustomerInfo)
            .and_then(|i| self.steps().get(i + 1))
            .map(|s| s.step_type);
        if let Some(next) = to {
            self.navigate_to(next, NavigateMode::Active);
        }
        GateDecision::Advanced { to }
    }

    // -- errors -------------------------------------------------------------

    pub fn report_unhandled(&mut self, message: impl Into<String>) {
        let message = message.into();
        warn!(error = %message, "unhandled checkout error");
        self.state.last_error = Some(FlowError::Unhandled(message));
    }

    /// Clear the pending error, returning it.
    pub fn acknowledge_error(&mut self) -> Option<FlowError> {
        self.state.last_error.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::{RecordingTelemetry, TelemetryEvent};
    use checkout_sync::FieldOutcome;
    use rstest::rstest;
    use std::collections::{BTreeMap, BTreeSet};

    fn sequence() -> Vec<StepStatus> {
        vec![
            StepStatus::new(StepType::Customer, true, true),
            StepStatus::new(StepType::CustomerInfo, true, false),
            StepStatus::new(StepType::Shipping, true, false),
            StepStatus::new(StepType::Billing, true, false),
            StepStatus::new(StepType::Payment, true, false),
        ]
    }

    fn controller() -> (StepController, Arc<RecordingTelemetry>) {
        let telemetry = Arc::new(RecordingTelemetry::new());
        let mut controller = StepController::new(telemetry.clone());
        controller.initialize(sequence());
        (controller, telemetry)
    }

    fn verdict(success: bool, is_complete: bool) -> ReconciliationResult {
        ReconciliationResult {
            success,
            outcomes: BTreeMap::from([(
                checkout_core::FieldKey::TeamName,
                FieldOutcome::Unchanged,
            )]),
            is_complete,
            missing_required: BTreeSet::new(),
        }
    }

    // -----------------------------------------------------------------------
    // navigate_to
    // -----------------------------------------------------------------------

    #[test]
    fn initialize_does_not_pick_a_step() {
        let (controller, telemetry) = controller();
        assert!(controller.is_initialized());
        assert_eq!(controller.effective_step(), None);
        assert!(telemetry.events().is_empty());
    }

    #[rstest]
    #[case::already_active(StepType::Shipping, StepType::Shipping)]
    #[case::absent_step(StepType::Shipping, StepType::CustomerInfo)]
    fn navigation_no_op_leaves_state_untouched(#[case] start: StepType, #[case] target: StepType) {
        let telemetry = Arc::new(RecordingTelemetry::new());
        let mut controller = StepController::new(telemetry.clone());
        let steps: Vec<_> = sequence()
            .into_iter()
            .filter(|s| s.step_type != StepType::CustomerInfo)
            .collect();
        controller.initialize(steps);
        controller.navigate_to(start, NavigateMode::Active);
        controller.report_unhandled("pending");
        let before = controller.state().clone();
        telemetry.take();

        assert!(!controller.navigate_to(target, NavigateMode::Active));
        assert!(!controller.navigate_to(target, NavigateMode::Default));
        assert_eq!(controller.state(), &before);
        assert!(telemetry.events().is_empty());
    }

    #[test]
    fn navigate_sets_slot_clears_error_and_reports_view() {
        let (mut controller, telemetry) = controller();
        controller.report_unhandled("stale");

        assert!(controller.navigate_to(StepType::Billing, NavigateMode::Default));
        assert_eq!(controller.default_step(), Some(StepType::Billing));
        assert_eq!(controller.active_step(), None);
        assert_eq!(controller.last_error(), None);

        assert!(controller.navigate_to(StepType::Shipping, NavigateMode::Active));
        assert_eq!(controller.effective_step(), Some(StepType::Shipping));
        assert_eq!(
            telemetry.events(),
            vec![
                TelemetryEvent::StepViewed(StepType::Billing),
                TelemetryEvent::StepViewed(StepType::Shipping),
            ]
        );
    }

    #[test]
    fn navigate_before_initialize_is_ignored() {
        let mut controller = StepController::new(Arc::new(RecordingTelemetry::new()));
        assert!(!controller.navigate_to(StepType::Customer, NavigateMode::Active));
        assert_eq!(controller.state(), &CheckoutFlowState::default());
    }

    // -----------------------------------------------------------------------
    // navigate_to_next_incomplete
    // -----------------------------------------------------------------------

    #[test]
    fn next_incomplete_completes_previous_and_moves() {
        let (mut controller, telemetry) = controller();
        let mut steps = sequence();
        steps[2] = steps[2].clone().active();
        controller.set_steps(steps);

        assert!(controller.navigate_to_next_incomplete(NavigateMode::Active));
        assert_eq!(controller.active_step(), Some(StepType::Shipping));
        assert_eq!(
            telemetry.events(),
            vec![
                TelemetryEvent::StepCompleted(StepType::CustomerInfo),
                TelemetryEvent::StepViewed(StepType::Shipping),
            ]
        );
    }

    #[test]
    fn next_incomplete_at_first_step_clamps_previous() {
        let (mut controller, telemetry) = controller();
        let mut steps = sequence();
        steps[0] = steps[0].clone().active();
        controller.set_steps(steps);

        assert!(controller.navigate_to_next_incomplete(NavigateMode::Default));
        assert_eq!(controller.default_step(), Some(StepType::Customer));
        assert_eq!(
            telemetry.events()[0],
            TelemetryEvent::StepCompleted(StepType::Customer)
        );
    }

    #[test]
    fn next_incomplete_without_flagged_step_is_a_no_op() {
        let (mut controller, telemetry) = controller();
        assert!(!controller.navigate_to_next_incomplete(NavigateMode::Active));
        assert!(telemetry.events().is_empty());
    }

    #[test]
    fn blocking_error_holds_forward_navigation_until_acknowledged() {
        let (mut controller, _) = controller();
        let mut steps = sequence();
        steps[3] = steps[3].clone().active();
        controller.set_steps(steps);
        controller.report_unhandled("payment provider crashed");

        assert!(!controller.navigate_to_next_incomplete(NavigateMode::Active));
        assert_eq!(
            controller.acknowledge_error(),
            Some(FlowError::Unhandled("payment provider crashed".into()))
        );
        assert!(controller.navigate_to_next_incomplete(NavigateMode::Active));
        assert_eq!(controller.active_step(), Some(StepType::Billing));
    }

    // -----------------------------------------------------------------------
    // Invalidation
    // -----------------------------------------------------------------------

    #[rstest]
    #[case::at_payment(Some(StepType::Payment), None, true)]
    #[case::at_shipping(Some(StepType::Shipping), None, true)]
    #[case::default_billing(None, Some(StepType::Billing), true)]
    #[case::before_shipping(Some(StepType::CustomerInfo), None, false)]
    #[case::nowhere(None, None, false)]
    fn lost_shipping_selection_regresses_from_later_steps(
        #[case] active: Option<StepType>,
        #[case] default: Option<StepType>,
        #[case] regresses: bool,
    ) {
        let (mut controller, _) = controller();
        if let Some(step) = default {
            controller.navigate_to(step, NavigateMode::Default);
        }
        if let Some(step) = active {
            controller.navigate_to(step, NavigateMode::Active);
        }
        controller.on_external_invalidation(Invalidation::ShippingOptions { has_selected: true });

        let changed = controller
            .on_external_invalidation(Invalidation::ShippingOptions { has_selected: false });

        assert_eq!(changed, regresses);
        if regresses {
            assert_eq!(controller.active_step(), Some(StepType::Shipping));
            assert_eq!(controller.last_error(), Some(&FlowError::ShippingOptionExpired));
        } else {
            assert_eq!(controller.active_step(), active);
            assert_eq!(controller.last_error(), None);
        }
    }

    #[test]
    fn expiry_on_shipping_raises_error_without_moving() {
        let (mut controller, telemetry) = controller();
        controller.navigate_to(StepType::Shipping, NavigateMode::Active);
        controller.on_external_invalidation(Invalidation::ShippingOptions { has_selected: true });
        let before = telemetry.events();

        assert!(controller
            .on_external_invalidation(Invalidation::ShippingOptions { has_selected: false }));
        assert_eq!(controller.active_step(), Some(StepType::Shipping));
        assert_eq!(controller.last_error(), Some(&FlowError::ShippingOptionExpired));
        assert_eq!(telemetry.events(), before, "no step transition was emitted");
    }

    #[test]
    fn shipping_regression_needs_a_prior_selection() {
        let (mut controller, _) = controller();
        controller.navigate_to(StepType::Payment, NavigateMode::Active);
        assert!(!controller
            .on_external_invalidation(Invalidation::ShippingOptions { has_selected: false }));
        assert!(!controller
            .on_external_invalidation(Invalidation::ShippingOptions { has_selected: false }));
        assert_eq!(controller.active_step(), Some(StepType::Payment));
    }

    #[test]
    fn cart_change_and_sign_out_move_the_buyer() {
        let (mut controller, _) = controller();
        controller.navigate_to(StepType::Payment, NavigateMode::Active);

        assert!(controller.on_external_invalidation(Invalidation::CartChanged));
        assert_eq!(controller.active_step(), Some(StepType::Shipping));

        assert!(controller.on_external_invalidation(Invalidation::SignedOut));
        assert_eq!(controller.active_step(), Some(StepType::Customer));
    }

    // -----------------------------------------------------------------------
    // Customer-info verdict
    // -----------------------------------------------------------------------

    #[test]
    fn complete_verdict_advances_past_customer_info() {
        let (mut controller, telemetry) = controller();
        controller.navigate_to(StepType::CustomerInfo, NavigateMode::Active);
        telemetry.take();

        let decision = controller.on_customer_info_verdict(&verdict(true, true));
        assert_eq!(
            decision,
            GateDecision::Advanced {
                to: Some(StepType::Shipping)
            }
        );
        assert_eq!(controller.active_step(), Some(StepType::Shipping));
        assert_eq!(
            telemetry.events(),
            vec![
                TelemetryEvent::StepCompleted(StepType::CustomerInfo),
                TelemetryEvent::StepViewed(StepType::Shipping),
            ]
        );
    }

    #[test]
    fn incomplete_verdict_holds_on_customer_info() {
        let (mut controller, _) = controller();
        controller.navigate_to(StepType::Customer, NavigateMode::Active);
        let decision = controller.on_customer_info_verdict(&verdict(true, false));
        assert_eq!(decision, GateDecision::HeldIncomplete);
        assert_eq!(controller.active_step(), Some(StepType::CustomerInfo));
    }

    #[test]
    fn failed_verdict_leaves_flow_state_alone() {
        let (mut controller, telemetry) = controller();
        controller.navigate_to(StepType::CustomerInfo, NavigateMode::Active);
        let before = controller.state().clone();
        telemetry.take();

        let decision = controller.on_customer_info_verdict(&verdict(false, true));
        assert_eq!(decision, GateDecision::HeldOnFailure);
        assert_eq!(controller.state(), &before);
        assert!(telemetry.events().is_empty());
    }

    #[test]
    fn rendered_steps_keep_required_and_mark_current() {
        let (mut controller, _) = controller();
        let mut steps = sequence();
        steps[3].is_required = false;
        steps[4] = steps[4].clone().active();
        controller.set_steps(steps);
        controller.navigate_to(StepType::Shipping, NavigateMode::Active);

        let rendered = controller.rendered_steps();
        let types: Vec<_> = rendered.iter().map(|s| s.step_type).collect();
        assert_eq!(
            types,
            vec![
                StepType::Customer,
                StepType::CustomerInfo,
                StepType::Shipping,
                StepType::Payment
            ]
        );
        let active: Vec<_> = rendered
            .iter()
            .filter(|s| s.is_active)
            .map(|s| s.step_type)
            .collect();
        assert_eq!(active, vec![StepType::Shipping]);
    }
}
