//! The Guard: the single non-bypassable execution gateway.
//!
//! `execute` is the only path to any capability's private execution function.
//! Every invocation runs the same total order of hard gates; no step is
//! reorderable, every refusal is terminal, and there is no continue-on-error
//! anywhere:
//!
//! 1.  context validity
//! 2.  intent declaration (exact field match against the contract)
//! 3.  principal presence
//! 4.  grant existence
//! 5.  grant not expired
//! 6.  grant not revoked
//! 7.  atomic use reservation
//! 8.  confidence gate
//! 9.  snapshot capture
//! 10. friction wait
//! 11. snapshot re-validation
//! 12. execution
//!
//! The snapshot is captured before the friction sleep and re-validated after
//! it, so the sleep is the window the re-check closes: a revocation landing
//! mid-wait is observed, deterministically, at step 11. Reserved uses are
//! never refunded; the kernel does not reverse recorded mutations.
//!
//! Errors never cross this boundary. Whatever a capability throws becomes an
//! `EXECUTION_ERROR` failure event, and the caller receives either success
//! data or a failure result, each sealed into an evidence bundle.

use std::cell::RefCell;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use log::{debug, info, warn};
use parking_lot::RwLock;

use crate::authority::{AuthorityError, AuthorityStore, GrantStatus};
use crate::clock::MonotonicClock;
use crate::context::{Context, PrincipalRecord};
use crate::contract::{CapabilityContract, CapabilityOutput};
use crate::evidence::{BundleId, BundleOutcome, EvidenceVault, StepResultRecord};
use crate::failure::{
    invariants, FailureEvent, FailureResult, FailureType, Phase, TriggeringCondition,
};
use crate::friction::{friction_delay, FrictionEngine};
use crate::grant::Grant;
use crate::observer::{details, ObserverEventKind, ObserverHub};
use crate::snapshot::{Snapshot, SnapshotError, SnapshotId, SnapshotStore};

thread_local! {
    // Capability names currently executing on this thread; a capability
    // re-entering the Guard for itself is refused at the door.
    static IN_FLIGHT: RefCell<Vec<String>> = RefCell::new(Vec::new());
}

/// Terminal output of one admission. Success data and failure composition
/// are exclusive at the type level.
#[derive(Debug)]
pub enum AdmissionResult {
    Success {
        data: CapabilityOutput,
        bundle_id: BundleId,
    },
    Failure {
        result: FailureResult,
        bundle_id: Option<BundleId>,
    },
}

impl AdmissionResult {
    pub fn is_success(&self) -> bool {
        matches!(self, AdmissionResult::Success { .. })
    }

    pub fn bundle_id(&self) -> Option<BundleId> {
        match self {
            AdmissionResult::Success { bundle_id, .. } => Some(*bundle_id),
            AdmissionResult::Failure { bundle_id, .. } => *bundle_id,
        }
    }

    /// Failure type of the first-violated invariant, if this is a refusal.
    pub fn failure_type(&self) -> Option<FailureType> {
        match self {
            AdmissionResult::Success { .. } => None,
            AdmissionResult::Failure { result, .. } => result.first().map(|e| e.failure_type),
        }
    }
}

/// Authority state discovered while a single admission ran; everything the
/// bundle needs beyond the outcome itself.
#[derive(Default)]
struct AdmissionTrace {
    grant: Option<Arc<Grant>>,
    snapshot: Option<Snapshot>,
}

pub struct Guard {
    registry: RwLock<HashMap<String, Arc<CapabilityContract>>>,
    authority: Arc<AuthorityStore>,
    snapshots: Arc<SnapshotStore>,
    observers: Arc<ObserverHub>,
    evidence: Arc<EvidenceVault>,
    friction: FrictionEngine,
    clock: MonotonicClock,
}

impl Guard {
    pub fn new(
        clock: MonotonicClock,
        authority: Arc<AuthorityStore>,
        snapshots: Arc<SnapshotStore>,
        observers: Arc<ObserverHub>,
        evidence: Arc<EvidenceVault>,
    ) -> Self {
        Guard {
            registry: RwLock::new(HashMap::new()),
            authority,
            snapshots,
            observers,
            evidence,
            friction: FrictionEngine::new(),
            clock,
        }
    }

    pub fn authority(&self) -> &Arc<AuthorityStore> {
        &self.authority
    }

    pub fn snapshot_store(&self) -> &Arc<SnapshotStore> {
        &self.snapshots
    }

    pub fn observers(&self) -> &Arc<ObserverHub> {
        &self.observers
    }

    pub fn evidence(&self) -> &Arc<EvidenceVault> {
        &self.evidence
    }

    pub fn clock(&self) -> MonotonicClock {
        self.clock
    }

    /// Register a capability contract. Idempotent by name for an identical
    /// shape; any differing re-registration is a redefinition and refused.
    pub fn register(&self, contract: CapabilityContract) -> Result<(), FailureEvent> {
        let name = contract.name().to_string();
        let mut registry = self.registry.write();
        if let Some(existing) = registry.get(&name) {
            if existing.same_shape(&contract) {
                return Ok(());
            }
            warn!("capability redefinition refused: {name}");
            return Err(FailureEvent::new(
                Phase::Mek0,
                FailureType::CapabilityRedefinition,
                TriggeringCondition::CapabilityRedefined,
                self.clock.now_micros(),
            ));
        }
        info!(
            "capability registered: {} ({})",
            name,
            contract.consequence().as_str()
        );
        registry.insert(name.clone(), Arc::new(contract));
        drop(registry);
        self.observers.emit(
            ObserverEventKind::CapabilityRegistered,
            details([("capability", name)]),
        );
        Ok(())
    }

    pub fn is_registered(&self, capability_name: &str) -> bool {
        self.registry.read().contains_key(capability_name)
    }

    /// The admission call. One pass through the full pipeline for one
    /// (capability, context) pair; the bundle is sealed after the halt.
    pub fn execute(&self, capability_name: &str, ctx: Context) -> AdmissionResult {
        let contract = self.registry.read().get(capability_name).cloned();
        let mut trace = AdmissionTrace::default();

        let outcome = match contract {
            None => Err(FailureEvent::new(
                Phase::Mek0,
                FailureType::UnknownCapability,
                TriggeringCondition::IntentUnregistered,
                self.clock.now_micros(),
            )
            .with_invariant(invariants::INTENT_DECLARED)
            .with_principal(ctx.principal_id().clone())),
            Some(contract) => self.admit(&contract, &ctx, &mut trace),
        };

        self.conclude(&ctx, trace, outcome)
    }

    /// Steps 1 through 12. Returns the capability output or the single
    /// failure event of the first-violated invariant.
    fn admit(
        &self,
        contract: &CapabilityContract,
        ctx: &Context,
        trace: &mut AdmissionTrace,
    ) -> Result<CapabilityOutput, FailureEvent> {
        let principal = ctx.principal_id().clone();
        let refusal = |phase: Phase, ftype: FailureType, condition: TriggeringCondition| {
            FailureEvent::new(phase, ftype, condition, self.clock.now_micros())
                .with_principal(principal.clone())
        };

        // Step 1: context validity. Contexts are validated at construction;
        // the door re-checks what it relies on.
        if ctx.context_id().is_nil() {
            return Err(refusal(
                Phase::Mek0,
                FailureType::InvalidContext,
                TriggeringCondition::ContextIdMalformed,
            ));
        }
        let confidence = ctx.confidence();
        if !confidence.is_finite() || !(0.0..=1.0).contains(&confidence) {
            return Err(refusal(
                Phase::Mek0,
                FailureType::InvalidConfidence,
                TriggeringCondition::ConfidenceOutOfRange,
            )
            .with_invariant(invariants::CONFIDENCE_BOUNDED));
        }

        // Step 2: intent declaration. The declared name must be the admitted
        // capability and the field set must match the contract exactly.
        if ctx.intent_name() != contract.name() {
            return Err(refusal(
                Phase::Mek0,
                FailureType::InvalidIntent,
                TriggeringCondition::IntentNameMismatch,
            )
            .with_invariant(invariants::INTENT_DECLARED));
        }
        for required in contract.required_fields() {
            if !ctx.fields().contains_key(required) {
                return Err(refusal(
                    Phase::Mek0,
                    FailureType::MissingContext,
                    TriggeringCondition::ContextFieldMissing,
                )
                .with_invariant(invariants::FIELDS_EXACT));
            }
        }
        for present in ctx.fields().keys() {
            if !contract.required_fields().contains(present) {
                return Err(refusal(
                    Phase::Mek0,
                    FailureType::InvalidIntent,
                    TriggeringCondition::ContextFieldUndeclared,
                )
                .with_invariant(invariants::FIELDS_EXACT));
            }
        }

        // Re-entry check: a capability invoking itself through the Guard
        // while it executes is a closed bypass path.
        let re_entrant =
            IN_FLIGHT.with(|stack| stack.borrow().iter().any(|n| n == contract.name()));
        if re_entrant {
            return Err(refusal(
                Phase::Mek0,
                FailureType::CapabilitySelfInvocation,
                TriggeringCondition::CapabilitySelfInvoked,
            )
            .with_invariant(invariants::SINGLE_DOOR));
        }

        // Step 3: principal presence.
        if principal.is_empty() {
            return Err(refusal(
                Phase::Mek0,
                FailureType::MissingPrincipal,
                TriggeringCondition::PrincipalEmpty,
            )
            .with_invariant(invariants::PRINCIPAL_PRESENT));
        }

        // Step 4: grant existence.
        let grant = match self.authority.lookup(&principal, contract.name()) {
            Some(grant) => grant,
            None => {
                return Err(refusal(
                    Phase::Mek2,
                    FailureType::MissingGrant,
                    TriggeringCondition::GrantAbsent,
                )
                .with_invariant(invariants::GRANT_LIVE));
            }
        };
        trace.grant = Some(Arc::clone(&grant));

        // Step 5: not expired.
        if grant.is_expired(self.clock.now_micros()) {
            return Err(refusal(
                Phase::Mek2,
                FailureType::ExpiredGrant,
                TriggeringCondition::GrantExpired,
            )
            .with_invariant(invariants::GRANT_LIVE)
            .with_grant(grant.grant_id));
        }

        // Step 6: not revoked.
        if self.authority.is_revoked(grant.grant_id) {
            return Err(refusal(
                Phase::Mek2,
                FailureType::RevokedGrant,
                TriggeringCondition::GrantRevoked,
            )
            .with_invariant(invariants::GRANT_LIVE)
            .with_grant(grant.grant_id));
        }

        // Step 7: atomically reserve one use. The reservation stands even if
        // a later step refuses.
        if let Err(err) = self.authority.consume(grant.grant_id) {
            let (ftype, condition) = match err {
                AuthorityError::ExhaustedGrant => (
                    FailureType::ExhaustedGrant,
                    TriggeringCondition::GrantUsesExhausted,
                ),
                _ => (FailureType::MissingGrant, TriggeringCondition::GrantAbsent),
            };
            return Err(refusal(Phase::Mek2, ftype, condition)
                .with_invariant(invariants::GRANT_BOUNDED)
                .with_grant(grant.grant_id));
        }

        // Step 8: confidence gate.
        if let Some(floor) = contract.consequence().confidence_floor() {
            if confidence < floor {
                return Err(refusal(
                    Phase::Mek0,
                    FailureType::ConfidenceThresholdExceeded,
                    TriggeringCondition::ConfidenceBelowThreshold,
                )
                .with_grant(grant.grant_id));
            }
        }

        // Step 9: capture the snapshot the execution will be bound to.
        let snapshot = Snapshot {
            snapshot_id: SnapshotId::generate(),
            captured_at: self.clock.now_micros(),
            principal_id: principal.clone(),
            grant_id: grant.grant_id,
            capability_name: contract.name().to_string(),
            capability_scope_hash: grant.scope_digest(),
            context_hash: ctx.context_digest(),
            intent_hash: ctx.intent_digest(),
            confidence_value: confidence,
            authority_version: self.authority.version(),
            grant_expires_at: grant.expires_at,
            grant_remaining_uses_at_capture: grant.remaining_uses(),
        };
        if let Err(err) = self.snapshots.record(snapshot.clone()) {
            let condition = match err {
                SnapshotError::DuplicateId => TriggeringCondition::SnapshotIdDuplicate,
                _ => TriggeringCondition::SnapshotReused,
            };
            return Err(refusal(Phase::Mek3, FailureType::SnapshotReuseAttempt, condition)
                .with_grant(grant.grant_id));
        }
        trace.snapshot = Some(snapshot.clone());

        // Step 10: friction. A real blocking sleep; revocations landing here
        // are caught at step 11, not mid-wait.
        let served = self.friction.wait(contract.consequence(), confidence);
        if served < friction_delay(contract.consequence(), confidence) {
            return Err(refusal(
                Phase::Mek0,
                FailureType::FrictionViolation,
                TriggeringCondition::FrictionClockShort,
            )
            .with_invariant(invariants::FRICTION_SERVED)
            .with_snapshot(snapshot.snapshot_id));
        }

        // Step 11: re-validate the captured snapshot bit for bit.
        self.revalidate(ctx, &grant, &snapshot)?;

        // Step 12: the one call. Thrown errors and panics become failure
        // events; nothing propagates past the door.
        IN_FLIGHT.with(|stack| stack.borrow_mut().push(contract.name().to_string()));
        let executed = catch_unwind(AssertUnwindSafe(|| contract.invoke(ctx)));
        IN_FLIGHT.with(|stack| {
            stack.borrow_mut().pop();
        });

        match executed {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(failure)) => {
                debug!("capability {} failed: {}", contract.name(), failure);
                Err(refusal(
                    Phase::Mek0,
                    FailureType::ExecutionError,
                    TriggeringCondition::CapabilityError,
                )
                .with_grant(grant.grant_id)
                .with_snapshot(snapshot.snapshot_id))
            }
            Err(_) => {
                warn!("capability {} panicked; converted to refusal", contract.name());
                Err(refusal(
                    Phase::Mek0,
                    FailureType::ExecutionError,
                    TriggeringCondition::CapabilityPanicked,
                )
                .with_grant(grant.grant_id)
                .with_snapshot(snapshot.snapshot_id))
            }
        }
    }

    /// Step 11. Grant liveness is re-read first, so a revocation that landed
    /// during friction wins here; then every hashed input is recomputed and
    /// compared, then the authority version.
    fn revalidate(
        &self,
        ctx: &Context,
        grant: &Arc<Grant>,
        snapshot: &Snapshot,
    ) -> Result<(), FailureEvent> {
        let refusal = |ftype: FailureType, condition: TriggeringCondition| {
            FailureEvent::new(Phase::Mek3, ftype, condition, self.clock.now_micros())
                .with_principal(ctx.principal_id().clone())
                .with_grant(grant.grant_id)
                .with_snapshot(snapshot.snapshot_id)
        };

        match self.authority.status(grant) {
            GrantStatus::Revoked => {
                return Err(refusal(
                    FailureType::RevokedGrant,
                    TriggeringCondition::GrantRevoked,
                )
                .with_invariant(invariants::GRANT_LIVE));
            }
            GrantStatus::Expired => {
                return Err(refusal(
                    FailureType::ExpiredGrant,
                    TriggeringCondition::GrantExpired,
                )
                .with_invariant(invariants::GRANT_LIVE));
            }
            GrantStatus::Exhausted | GrantStatus::Live => {}
        }

        let hashes_stable = ctx.context_digest() == snapshot.context_hash
            && ctx.intent_digest() == snapshot.intent_hash
            && grant.scope_digest() == snapshot.capability_scope_hash;
        if !hashes_stable {
            return Err(refusal(
                FailureType::SnapshotHashMismatch,
                TriggeringCondition::SnapshotHashDrift,
            )
            .with_invariant(invariants::SNAPSHOT_STABLE));
        }

        if self.authority.version() != snapshot.authority_version {
            return Err(refusal(
                FailureType::ToctouViolation,
                TriggeringCondition::AuthorityVersionDrift,
            )
            .with_invariant(invariants::AUTHORITY_STABLE));
        }

        match self.snapshots.mark_validated(snapshot.snapshot_id) {
            Ok(()) => Ok(()),
            Err(_) => Err(refusal(
                FailureType::SnapshotReuseAttempt,
                TriggeringCondition::SnapshotReused,
            )),
        }
    }

    /// Seal the evidence bundle for a halted admission and emit observer
    /// events. Bundle construction failure is itself a terminal failure of
    /// the bundling phase.
    fn conclude(
        &self,
        ctx: &Context,
        trace: AdmissionTrace,
        outcome: Result<CapabilityOutput, FailureEvent>,
    ) -> AdmissionResult {
        let capability = ctx.intent_name().to_string();
        let principal = ctx.principal_id().clone();

        let bundle_outcome = match &outcome {
            Ok(data) => BundleOutcome::Results(vec![StepResultRecord {
                order: 0,
                data: data.clone(),
            }]),
            Err(event) => BundleOutcome::Failure(vec![event.clone()]),
        };

        let sealed = self.evidence.seal(
            ctx.record(),
            ctx.intent().record(),
            PrincipalRecord {
                principal_id: principal.clone(),
            },
            trace.grant.as_ref().map(|g| g.record()),
            trace.snapshot.into_iter().collect(),
            bundle_outcome,
            self.authority.version(),
        );

        let bundle_id = match sealed {
            Ok(bundle) => {
                self.observers.emit(
                    ObserverEventKind::BundleSealed,
                    details([
                        ("bundle_id", bundle.bundle_id.to_string()),
                        ("capability", capability.clone()),
                    ]),
                );
                Some(bundle.bundle_id)
            }
            Err(err) => {
                warn!("evidence sealing failed: {err}");
                let sealing_event = FailureEvent::new(
                    Phase::Mek6,
                    FailureType::ExecutionError,
                    TriggeringCondition::EvidenceSealingFailed,
                    self.clock.now_micros(),
                )
                .with_principal(principal.clone());

                let mut result = match outcome {
                    Ok(_) => FailureResult::from_event(sealing_event),
                    Err(event) => FailureResult::from_event(event),
                };
                if result.first().map(|e| e.triggering_condition)
                    != Some(TriggeringCondition::EvidenceSealingFailed)
                {
                    result.composition.record(
                        FailureEvent::new(
                            Phase::Mek6,
                            FailureType::ExecutionError,
                            TriggeringCondition::EvidenceSealingFailed,
                            self.clock.now_micros(),
                        )
                        .with_principal(principal.clone()),
                    );
                }
                self.observers.emit(
                    ObserverEventKind::AdmissionRefused,
                    details([("capability", capability)]),
                );
                return AdmissionResult::Failure {
                    result,
                    bundle_id: None,
                };
            }
        };

        match outcome {
            Ok(data) => {
                self.observers.emit(
                    ObserverEventKind::ExecutionCompleted,
                    details([
                        ("capability", capability),
                        ("principal", principal.to_string()),
                    ]),
                );
                AdmissionResult::Success {
                    data,
                    bundle_id: bundle_id.expect("sealed bundle exists on success"),
                }
            }
            Err(event) => {
                self.observers.emit(
                    ObserverEventKind::AdmissionRefused,
                    details([
                        ("capability", capability),
                        ("failure_type", event.failure_type.as_str().to_string()),
                        ("triggering_condition", event.triggering_condition.to_string()),
                    ]),
                );
                AdmissionResult::Failure {
                    result: FailureResult::from_event(event),
                    bundle_id,
                }
            }
        }
    }
}
