//! Checkout session: ties the step controller, the field registry and the
//! reconciliation engine to one buyer's checkout.
//!
//! A session owns its [`SessionCache`] and a cancellation scope. Every
//! remote call it issues, the prefill listing in
//! [`CheckoutSession::load_with`] included, is bound to that scope;
//! [`CheckoutSession::teardown`] (or a detached [`TeardownHandle`]) fires
//! it, and a call that observes cancellation returns without touching
//! session state.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info, warn};

use checkout_core::{
    CartId, CheckoutConfig, FieldDefinition, FieldKey, FieldRegistry, FieldValues, Segment, StepStatus, StepType,
};
use checkout_sync::{cancel_scope, CancelHandle, ReconciliationResult, Reconciler, SyncError};

use crate::controller::{GateDecision, Invalidation, NavigateMode, StepController};
use crate::error::{FlowError, ValidationError};
use crate::session_store::{self, SessionCache};
use crate::telemetry::FlowTelemetry;

/// Identity of a checkout and where its cache lives.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub checkout_id: String,
    pub cart: CartId,
    pub segment: Segment,
    /// Root for the on-disk cache. `None` keeps the cache in memory only.
    pub home: Option<PathBuf>,
}

impl SessionOptions {
    /// Options for `checkout_id`, caching under the config's session home.
    pub fn from_config(
        config: &CheckoutConfig,
        checkout_id: impl Into<String>,
        cart: CartId,
        segment: Segment,
    ) -> Self {
        Self {
            checkout_id: checkout_id.into(),
            cart,
            segment,
            home: config.session_home.clone(),
        }
    }
}

/// Result of a successful submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitOutcome {
    pub result: ReconciliationResult,
    pub decision: GateDecision,
}

/// Cancels a session's in-flight remote calls from another task.
#[derive(Debug, Clone)]
pub struct TeardownHandle {
    cancel: CancelHandle,
}

impl TeardownHandle {
    /// A handle for a session that has not been loaded yet. See
    /// [`CheckoutSession::load_with`].
    pub fn new() -> Self {
        let (cancel, _) = cancel_scope();
        Self { cancel }
    }

    pub fn fire(&self) {
        self.cancel.cancel();
    }
}

impl Default for TeardownHandle {
    fn default() -> Self {
        Self::new()
    }
}

pub struct CheckoutSession {
    options: SessionOptions,
    reconciler: Reconciler,
    controller: StepController,
    telemetry: Arc<dyn FlowTelemetry>,
    desired: FieldValues,
    cache: SessionCache,
    form_error: Option<FlowError>,
    cancel: CancelHandle,
    closed: bool,
    /// The cart already held customer-info records at load.
    prefilled: bool,
}

impl CheckoutSession {
    /// Resolve the buyer's definitions, restore any saved cache and prefill
    /// the form from records already on the cart.
    ///
    /// Cache and listing failures are logged and the session starts empty.
    pub async fn load(
        options: SessionOptions,
        reconciler: Reconciler,
        telemetry: Arc<dyn FlowTelemetry>,
    ) -> Self {
        Self::load_with(options, reconciler, telemetry, TeardownHandle::new()).await
    }

    /// [`CheckoutSession::load`] bound to an existing `teardown` handle.
    ///
    /// Firing the handle while the prefill listing is outstanding releases
    /// it; the session comes back closed and nothing is persisted.
    ///
    /// When the cart already holds customer-info records, the completion
    /// flag is recomputed from them so a buyer with complete records is not
    /// asked again. See [`CheckoutSession::start`].
    pub async fn load_with(
        options: SessionOptions,
        reconciler: Reconciler,
        telemetry: Arc<dyn FlowTelemetry>,
        teardown: TeardownHandle,
    ) -> Self {
        let cancel = teardown.cancel;
        let registry = reconciler.registry();
        let segment = &options.segment;

        let restored = options.home.as_deref().and_then(|home| {
            session_store::load_at(home, &options.checkout_id)
                .map_err(|e| {
                    warn!(checkout = %options.checkout_id, error = %e, "ignoring unreadable session cache")
                })
                .ok()
                .flatten()
        });
        let mut cache = restored.unwrap_or_default();
        cache.definitions = registry
            .definitions_for(segment)
            .into_iter()
            .cloned()
            .collect();
        cache.eligible_segments = registry.eligible_segments();

        let mut desired = FieldValues::new();
        let mut prefilled = false;
        if registry.is_eligible(segment) {
            match cancel.scope().guard(reconciler.snapshot(&options.cart)).await {
                Some(Ok(snapshot)) => {
                    for (key, record) in snapshot {
                        if registry.is_applicable(segment, key) {
                            desired.set(key, record.value);
                            prefilled = true;
                        }
                    }
                    if prefilled {
                        cache.customer_info_complete = registry.is_complete(segment, &desired);
                    }
                }
                Some(Err(e)) => {
                    warn!(cart = %options.cart, error = %e, "could not prefill customer info")
                }
                None => {
                    debug!(checkout = %options.checkout_id, "session load cancelled during prefill")
                }
            }
        }

        let controller = StepController::new(Arc::clone(&telemetry));
        let mut session = Self {
            options,
            reconciler,
            controller,
            telemetry,
            desired,
            cache,
            form_error: None,
            cancel,
            closed: false,
            prefilled,
        };
        if session.is_closed() {
            return session;
        }
        session.persist();
        info!(
            checkout = %session.options.checkout_id,
            segment = %session.options.segment,
            fields = session.cache.definitions.len(),
            "checkout session loaded"
        );
        session
    }

    fn registry(&self) -> &FieldRegistry {
        self.reconciler.registry()
    }

    fn persist(&mut self) {
        let Some(home) = self.options.home.clone() else {
            return;
        };
        if let Err(e) = session_store::save_at(&home, &self.options.checkout_id, &mut self.cache) {
            warn!(checkout = %self.options.checkout_id, error = %e, "could not save session cache");
        }
    }

    fn clear_persisted(&self) {
        let Some(home) = self.options.home.as_deref() else {
            return;
        };
        if let Err(e) = session_store::clear_at(home, &self.options.checkout_id) {
            warn!(checkout = %self.options.checkout_id, error = %e, "could not clear session cache");
        }
    }

    fn ensure_open(&self) -> Result<(), FlowError> {
        if self.is_closed() {
            Err(FlowError::SessionClosed)
        } else {
            Ok(())
        }
    }

    // -- accessors ----------------------------------------------------------

    pub fn is_closed(&self) -> bool {
        self.closed || self.cancel.is_cancelled()
    }

    pub fn segment(&self) -> &Segment {
        &self.options.segment
    }

    pub fn cache(&self) -> &SessionCache {
        &self.cache
    }

    pub fn controller(&self) -> &StepController {
        &self.controller
    }

    pub fn controller_mut(&mut self) -> &mut StepController {
        &mut self.controller
    }

    pub fn definitions(&self) -> &[FieldDefinition] {
        &self.cache.definitions
    }

    pub fn values(&self) -> &FieldValues {
        &self.desired
    }

    /// Values the form should display, forced values included.
    pub fn effective_values(&self) -> FieldValues {
        self.registry()
            .effective_values(&self.options.segment, &self.desired)
    }

    pub fn required_keys(&self) -> BTreeSet<FieldKey> {
        self.registry()
            .required_keys_given(&self.options.segment, &self.desired)
    }

    pub fn locked_keys(&self) -> BTreeSet<FieldKey> {
        self.registry()
            .locked_keys(&self.options.segment, &self.desired)
    }

    /// Form-level banner left by the last failed submission.
    pub fn form_error(&self) -> Option<&FlowError> {
        self.form_error.as_ref()
    }

    /// The buyer's segment collects customer info and it has not been
    /// completed yet.
    pub fn needs_customer_info(&self) -> bool {
        self.registry().is_eligible(&self.options.segment) && !self.cache.customer_info_complete
    }

    pub fn teardown_handle(&self) -> TeardownHandle {
        TeardownHandle {
            cancel: self.cancel.clone(),
        }
    }

    // -- steps --------------------------------------------------------------

    /// Hand the step sequence to the controller and pick the first step.
    ///
    /// A cart that already held customer-info records lands on Shipping when
    /// those records pass the gate and on CustomerInfo when they do not.
    /// Otherwise the session lands on the first incomplete step.
    pub fn start(&mut self, steps: Vec<StepStatus>) {
        self.controller.initialize(steps);
        if self.prefilled {
            let target = if self.cache.customer_info_complete {
                StepType::Shipping
            } else {
                StepType::CustomerInfo
            };
            if self.controller.navigate_to(target, NavigateMode::Active) {
                return;
            }
        }
        self.controller
            .navigate_to_next_incomplete(NavigateMode::Default);
    }

    pub fn invalidate(&mut self, signal: Invalidation) -> bool {
        self.controller.on_external_invalidation(signal)
    }

    // -- form ---------------------------------------------------------------

    pub fn set_field(&mut self, key: FieldKey, value: impl Into<String>) -> Result<(), FlowError> {
        self.ensure_open()?;
        let segment = self.options.segment.clone();
        self.reconciler
            .registry()
            .apply_edit(&segment, &mut self.desired, key, value)
            .map_err(ValidationError::from)?;
        Ok(())
    }

    /// Validate, reconcile, and hand the verdict to the controller.
    ///
    /// Validation runs before any remote call. A remote failure sets the
    /// form-level error and holds the step.
    pub async fn submit(&mut self) -> Result<SubmitOutcome, FlowError> {
        self.ensure_open()?;
        let segment = self.options.segment.clone();

        let missing = self.registry().missing_required(&segment, &self.desired);
        if !missing.is_empty() {
            debug!(missing = missing.len(), "customer info submission rejected");
            return Err(ValidationError::MissingRequired { keys: missing }.into());
        }

        let scope = self.cancel.scope();
        let outcome = self
            .reconciler
            .sync(&self.options.cart, &segment, &self.desired, &scope)
            .await;

        if self.is_closed() {
            debug!(checkout = %self.options.checkout_id, "submission finished after teardown");
            return Err(FlowError::SessionClosed);
        }

        let result = match outcome {
            Ok(result) => result,
            Err(SyncError::Cancelled) => return Err(FlowError::SessionClosed),
            Err(SyncError::Snapshot(e)) => {
                warn!(cart = %self.options.cart, error = %e, "could not list cart metafields");
                let err = FlowError::RemoteOperation {
                    keys: self
                        .cache
                        .definitions
                        .iter()
                        .map(|d| d.key)
                        .collect(),
                };
                self.form_error = Some(err.clone());
                return Err(err);
            }
        };

        let decision = self.controller.on_customer_info_verdict(&result);
        if !result.success {
            let err = FlowError::RemoteOperation {
                keys: result.failed_keys(),
            };
            self.form_error = Some(err.clone());
            return Err(err);
        }

        self.form_error = None;
        if result.is_complete {
            self.cache.customer_info_complete = true;
            self.persist();
        }
        Ok(SubmitOutcome { result, decision })
    }

    // -- exit ---------------------------------------------------------------

    /// Sign the buyer out: forget cached customer info and return to the
    /// customer step.
    pub fn sign_out(&mut self) {
        self.desired = FieldValues::new();
        self.form_error = None;
        self.prefilled = false;
        self.cache.clear();
        self.clear_persisted();
        self.controller.on_external_invalidation(Invalidation::SignedOut);
    }

    /// Cancel outstanding remote calls and clear all session state.
    pub fn teardown(&mut self) {
        if self.closed {
            return;
        }
        self.cancel.cancel();
        self.closed = true;
        self.prefilled = false;
        self.desired = FieldValues::new();
        self.form_error = None;
        self.cache.clear();
        self.clear_persisted();
        self.telemetry.checkout_exited();
        info!(checkout = %self.options.checkout_id, "checkout session torn down");
    }

    /// Whether the buyer is currently on the customer-info step.
    pub fn on_customer_info(&self) -> bool {
        self.controller.effective_step() == Some(StepType::CustomerInfo)
    }
}

impl Drop for CheckoutSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
