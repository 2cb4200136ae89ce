//! Mechanical step composition.
//!
//! A composition is an ordered list of independent admissions with a single
//! admissible failure policy: STRICT. Each step runs through the full Guard
//! pipeline with its own context, intent and snapshot; success of step N
//! confers zero authority on step N+1. The first refusal halts the run and
//! later steps are never attempted.
//!
//! There are no retries, no branching, no conditionals, no output
//! aggregation, and no partial-success surface.

use serde::{Deserialize, Serialize};

use crate::context::Context;
use crate::evidence::BundleId;
use crate::failure::{
    invariants, FailureEvent, FailureResult, FailureType, Phase, TriggeringCondition,
};
use crate::guard::{AdmissionResult, Guard};

/// The only admissible value. The field exists so the policy is explicit at
/// every call-site, not so it can vary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailurePolicy {
    Strict,
}

/// One (capability, context) pair with its explicit position.
#[derive(Debug)]
pub struct Step {
    pub order: u32,
    pub capability_name: String,
    pub context: Context,
}

/// Ordered list of steps. Construction validates the ordering field:
/// sequential from zero, no gaps, no branching.
#[derive(Debug)]
pub struct Composition {
    steps: Vec<Step>,
    policy: FailurePolicy,
}

impl Composition {
    pub fn strict(steps: Vec<Step>) -> Result<Self, FailureEvent> {
        for (expected, step) in steps.iter().enumerate() {
            if step.order != expected as u32 {
                return Err(FailureEvent::new(
                    Phase::Mek4,
                    FailureType::CompositionOrderViolation,
                    TriggeringCondition::CompositionOrderGap,
                    step.context.created_at(),
                )
                .with_invariant(invariants::ORDER_SEQUENTIAL)
                .with_principal(step.context.principal_id().clone()));
            }
        }
        Ok(Composition {
            steps,
            policy: FailurePolicy::Strict,
        })
    }

    pub fn policy(&self) -> FailurePolicy {
        self.policy
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Output of one successfully admitted step, in step order.
#[derive(Debug)]
pub struct StepSuccess {
    pub order: u32,
    pub data: serde_json::Value,
    pub bundle_id: BundleId,
}

/// Composite outcome: all steps succeeded, or the run halted at the first
/// refusal with only the events up to and including the halt.
#[derive(Debug)]
pub enum CompositionResult {
    Completed(Vec<StepSuccess>),
    Halted {
        failed_order: u32,
        result: FailureResult,
    },
}

impl CompositionResult {
    pub fn is_completed(&self) -> bool {
        matches!(self, CompositionResult::Completed(_))
    }
}

pub struct CompositionEngine;

impl CompositionEngine {
    /// Run the steps serially through the Guard, halting at the first
    /// refusal. Revocation between steps needs no special handling here: the
    /// next step simply loses inside its own admission.
    pub fn execute_composition(guard: &Guard, composition: Composition) -> CompositionResult {
        let mut successes = Vec::with_capacity(composition.steps.len());

        for step in composition.steps {
            match guard.execute(&step.capability_name, step.context) {
                AdmissionResult::Success { data, bundle_id } => {
                    successes.push(StepSuccess {
                        order: step.order,
                        data,
                        bundle_id,
                    });
                }
                AdmissionResult::Failure { result, .. } => {
                    // The composite composition is exactly the events up to
                    // and including the halt; earlier steps succeeded and
                    // contributed none.
                    return CompositionResult::Halted {
                        failed_order: step.order,
                        result,
                    };
                }
            }
        }
        CompositionResult::Completed(successes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authority::AuthorityStore;
    use crate::clock::MonotonicClock;
    use crate::context::{FieldValue, PrincipalId};
    use crate::contract::{CapabilityContract, Consequence};
    use crate::evidence::EvidenceVault;
    use crate::grant::GrantScope;
    use crate::observer::ObserverHub;
    use crate::snapshot::SnapshotStore;
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::time::Duration;

    fn guard() -> Guard {
        let clock = MonotonicClock::new();
        Guard::new(
            clock,
            Arc::new(AuthorityStore::new(clock)),
            Arc::new(SnapshotStore::new()),
            Arc::new(ObserverHub::new()),
            Arc::new(EvidenceVault::new(clock, None)),
        )
    }

    fn setup_read(guard: &Guard, max_uses: Option<u32>) {
        guard
            .register(CapabilityContract::new(
                "file.read",
                Consequence::Low,
                ["path".to_string()],
                |_| Ok(serde_json::json!({"ok": true})),
            ))
            .unwrap();
        guard
            .authority()
            .issue(
                PrincipalId::new("alice"),
                "file.read".to_string(),
                GrantScope::none(),
                Duration::from_secs(60),
                max_uses,
                true,
            )
            .unwrap();
    }

    fn read_step(guard: &Guard, order: u32) -> Step {
        let mut fields = BTreeMap::new();
        fields.insert("path".to_string(), FieldValue::str("/tmp/x"));
        Step {
            order,
            capability_name: "file.read".to_string(),
            context: Context::new(
                &guard.clock(),
                PrincipalId::new("alice"),
                "file.read",
                Some(0.9),
                fields,
            )
            .unwrap(),
        }
    }

    fn write_step(guard: &Guard, order: u32) -> Step {
        // fs.write is registered but alice holds no grant for it
        Step {
            order,
            capability_name: "fs.write".to_string(),
            context: Context::new(
                &guard.clock(),
                PrincipalId::new("alice"),
                "fs.write",
                Some(0.9),
                BTreeMap::new(),
            )
            .unwrap(),
        }
    }

    #[test]
    fn test_all_steps_succeed_in_order() {
        let guard = guard();
        setup_read(&guard, None);
        let composition =
            Composition::strict(vec![read_step(&guard, 0), read_step(&guard, 1)]).unwrap();
        match CompositionEngine::execute_composition(&guard, composition) {
            CompositionResult::Completed(results) => {
                assert_eq!(results.len(), 2);
                assert_eq!(results[0].order, 0);
                assert_eq!(results[1].order, 1);
            }
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[test]
    fn test_strict_halt_on_first_refusal() {
        let guard = guard();
        setup_read(&guard, None);
        guard
            .register(CapabilityContract::new(
                "fs.write",
                Consequence::Low,
                [],
                |_| Ok(serde_json::Value::Null),
            ))
            .unwrap();

        let composition = Composition::strict(vec![
            read_step(&guard, 0),
            write_step(&guard, 1),
            read_step(&guard, 2),
        ])
        .unwrap();

        match CompositionEngine::execute_composition(&guard, composition) {
            CompositionResult::Halted {
                failed_order,
                result,
            } => {
                assert_eq!(failed_order, 1);
                assert_eq!(result.composition.len(), 1);
                assert_eq!(
                    result.composition.events()[0].failure_type,
                    FailureType::MissingGrant
                );
            }
            other => panic!("expected halt, got {other:?}"),
        }
    }

    #[test]
    fn test_later_steps_not_attempted_after_halt() {
        let guard = guard();
        setup_read(&guard, Some(5));
        guard
            .register(CapabilityContract::new(
                "fs.write",
                Consequence::Low,
                [],
                |_| Ok(serde_json::Value::Null),
            ))
            .unwrap();

        let composition = Composition::strict(vec![
            read_step(&guard, 0),
            write_step(&guard, 1),
            read_step(&guard, 2),
            read_step(&guard, 3),
        ])
        .unwrap();
        let _ = CompositionEngine::execute_composition(&guard, composition);

        // Only step 0 consumed a use; 2 and 3 never ran
        let grant = guard
            .authority()
            .lookup(&PrincipalId::new("alice"), "file.read")
            .unwrap();
        assert_eq!(grant.remaining_uses(), Some(4));
    }

    #[test]
    fn test_order_gap_refused_at_construction() {
        let guard = guard();
        setup_read(&guard, None);
        let err =
            Composition::strict(vec![read_step(&guard, 0), read_step(&guard, 2)]).unwrap_err();
        assert_eq!(err.failure_type, FailureType::CompositionOrderViolation);
        assert_eq!(err.phase, Phase::Mek4);
    }

    #[test]
    fn test_order_must_start_at_zero() {
        let guard = guard();
        setup_read(&guard, None);
        let err = Composition::strict(vec![read_step(&guard, 1)]).unwrap_err();
        assert_eq!(
            err.triggering_condition,
            TriggeringCondition::CompositionOrderGap
        );
    }

    #[test]
    fn test_empty_composition_completes_empty() {
        let guard = guard();
        let composition = Composition::strict(Vec::new()).unwrap();
        match CompositionEngine::execute_composition(&guard, composition) {
            CompositionResult::Completed(results) => assert!(results.is_empty()),
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[test]
    fn test_steps_are_independent_admissions() {
        let guard = guard();
        setup_read(&guard, Some(2));
        let composition =
            Composition::strict(vec![read_step(&guard, 0), read_step(&guard, 1)]).unwrap();
        match CompositionEngine::execute_composition(&guard, composition) {
            CompositionResult::Completed(results) => {
                // Fresh snapshot and fresh bundle per step
                assert_ne!(results[0].bundle_id, results[1].bundle_id);
                let a = guard.evidence().get(results[0].bundle_id).unwrap();
                let b = guard.evidence().get(results[1].bundle_id).unwrap();
                assert_ne!(a.snapshots[0].snapshot_id, b.snapshots[0].snapshot_id);
            }
            other => panic!("expected completion, got {other:?}"),
        }
    }
}
