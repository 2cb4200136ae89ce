//! Failure as first-class structured data.
//!
//! Every refusal the kernel produces is a [`FailureEvent`]: a closed-enum
//! failure type, a fixed-vocabulary triggering condition, and the identifiers
//! of whatever authority state was in play. There is no free text anywhere in
//! an event, no severity ranking, no remediation hint. Compositions preserve
//! literal occurrence order and are never deduplicated or summarized.
//!
//! The enums here are closed on purpose: a new failure kind cannot exist
//! without editing this file.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::canonical::CanonicalEncode;
use crate::context::PrincipalId;
use crate::grant::GrantId;
use crate::snapshot::SnapshotId;

// ============================================================================
// PHASES
// ============================================================================

/// Kernel layer at which a failure was detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    #[serde(rename = "MEK_0")]
    Mek0,
    #[serde(rename = "MEK_2")]
    Mek2,
    #[serde(rename = "MEK_3")]
    Mek3,
    #[serde(rename = "MEK_4")]
    Mek4,
    #[serde(rename = "MEK_5")]
    Mek5,
    #[serde(rename = "MEK_6")]
    Mek6,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Mek0 => "MEK_0",
            Phase::Mek2 => "MEK_2",
            Phase::Mek3 => "MEK_3",
            Phase::Mek4 => "MEK_4",
            Phase::Mek5 => "MEK_5",
            Phase::Mek6 => "MEK_6",
        }
    }
}

// ============================================================================
// FAILURE TYPES (closed)
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureType {
    MissingContext,
    InvalidContext,
    MissingIntent,
    InvalidIntent,
    IntentInferenceAttempt,
    MissingConfidence,
    InvalidConfidence,
    ConfidenceThresholdExceeded,
    MissingPrincipal,
    MissingGrant,
    ExpiredGrant,
    RevokedGrant,
    ExhaustedGrant,
    InvalidGrantScope,
    UnknownCapability,
    CapabilityRedefinition,
    CapabilitySelfInvocation,
    UnifiedExecutionAuthorityViolation,
    DirectExecutionAttempt,
    FrictionViolation,
    ConsequenceLevelMismatch,
    SnapshotHashMismatch,
    SnapshotReuseAttempt,
    ToctouViolation,
    CompositionStepFailure,
    CompositionOrderViolation,
    ExecutionError,
    GuardRefusal,
}

impl FailureType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureType::MissingContext => "MISSING_CONTEXT",
            FailureType::InvalidContext => "INVALID_CONTEXT",
            FailureType::MissingIntent => "MISSING_INTENT",
            FailureType::InvalidIntent => "INVALID_INTENT",
            FailureType::IntentInferenceAttempt => "INTENT_INFERENCE_ATTEMPT",
            FailureType::MissingConfidence => "MISSING_CONFIDENCE",
            FailureType::InvalidConfidence => "INVALID_CONFIDENCE",
            FailureType::ConfidenceThresholdExceeded => "CONFIDENCE_THRESHOLD_EXCEEDED",
            FailureType::MissingPrincipal => "MISSING_PRINCIPAL",
            FailureType::MissingGrant => "MISSING_GRANT",
            FailureType::ExpiredGrant => "EXPIRED_GRANT",
            FailureType::RevokedGrant => "REVOKED_GRANT",
            FailureType::ExhaustedGrant => "EXHAUSTED_GRANT",
            FailureType::InvalidGrantScope => "INVALID_GRANT_SCOPE",
            FailureType::UnknownCapability => "UNKNOWN_CAPABILITY",
            FailureType::CapabilityRedefinition => "CAPABILITY_REDEFINITION",
            FailureType::CapabilitySelfInvocation => "CAPABILITY_SELF_INVOCATION",
            FailureType::UnifiedExecutionAuthorityViolation => {
                "UNIFIED_EXECUTION_AUTHORITY_VIOLATION"
            }
            FailureType::DirectExecutionAttempt => "DIRECT_EXECUTION_ATTEMPT",
            FailureType::FrictionViolation => "FRICTION_VIOLATION",
            FailureType::ConsequenceLevelMismatch => "CONSEQUENCE_LEVEL_MISMATCH",
            FailureType::SnapshotHashMismatch => "SNAPSHOT_HASH_MISMATCH",
            FailureType::SnapshotReuseAttempt => "SNAPSHOT_REUSE_ATTEMPT",
            FailureType::ToctouViolation => "TOCTOU_VIOLATION",
            FailureType::CompositionStepFailure => "COMPOSITION_STEP_FAILURE",
            FailureType::CompositionOrderViolation => "COMPOSITION_ORDER_VIOLATION",
            FailureType::ExecutionError => "EXECUTION_ERROR",
            FailureType::GuardRefusal => "GUARD_REFUSAL",
        }
    }
}

impl std::fmt::Display for FailureType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// TRIGGERING CONDITIONS (closed vocabulary)
// ============================================================================

/// The exact short token recorded in an event. Free text cannot appear here:
/// the vocabulary is the enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TriggeringCondition {
    ContextFieldMissing,
    ContextFieldUndeclared,
    ContextIdMalformed,
    ConfidenceMissing,
    ConfidenceOutOfRange,
    ConfidenceBelowThreshold,
    IntentNameEmpty,
    IntentUnregistered,
    IntentNameMismatch,
    PrincipalEmpty,
    GrantAbsent,
    GrantExpired,
    GrantRevoked,
    GrantUsesExhausted,
    GrantScopeInvalid,
    CapabilityRedefined,
    CapabilitySelfInvoked,
    FrictionClockShort,
    SnapshotIdDuplicate,
    SnapshotReused,
    SnapshotHashDrift,
    AuthorityVersionDrift,
    CompositionOrderGap,
    CompositionStepRefused,
    CapabilityError,
    CapabilityPanicked,
    EvidenceSealingFailed,
    DirectExecutionBlocked,
    ProhibitedOperationCalled,
}

impl TriggeringCondition {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggeringCondition::ContextFieldMissing => "context_field_missing",
            TriggeringCondition::ContextFieldUndeclared => "context_field_undeclared",
            TriggeringCondition::ContextIdMalformed => "context_id_malformed",
            TriggeringCondition::ConfidenceMissing => "confidence_missing",
            TriggeringCondition::ConfidenceOutOfRange => "confidence_out_of_range",
            TriggeringCondition::ConfidenceBelowThreshold => "confidence_below_threshold",
            TriggeringCondition::IntentNameEmpty => "intent_name_empty",
            TriggeringCondition::IntentUnregistered => "intent_unregistered",
            TriggeringCondition::IntentNameMismatch => "intent_name_mismatch",
            TriggeringCondition::PrincipalEmpty => "principal_empty",
            TriggeringCondition::GrantAbsent => "grant_absent",
            TriggeringCondition::GrantExpired => "grant_expired",
            TriggeringCondition::GrantRevoked => "grant_revoked",
            TriggeringCondition::GrantUsesExhausted => "grant_uses_exhausted",
            TriggeringCondition::GrantScopeInvalid => "grant_scope_invalid",
            TriggeringCondition::CapabilityRedefined => "capability_redefined",
            TriggeringCondition::CapabilitySelfInvoked => "capability_self_invoked",
            TriggeringCondition::FrictionClockShort => "friction_clock_short",
            TriggeringCondition::SnapshotIdDuplicate => "snapshot_id_duplicate",
            TriggeringCondition::SnapshotReused => "snapshot_reused",
            TriggeringCondition::SnapshotHashDrift => "snapshot_hash_drift",
            TriggeringCondition::AuthorityVersionDrift => "authority_version_drift",
            TriggeringCondition::CompositionOrderGap => "composition_order_gap",
            TriggeringCondition::CompositionStepRefused => "composition_step_refused",
            TriggeringCondition::CapabilityError => "capability_error",
            TriggeringCondition::CapabilityPanicked => "capability_panicked",
            TriggeringCondition::EvidenceSealingFailed => "evidence_sealing_failed",
            TriggeringCondition::DirectExecutionBlocked => "direct_execution_blocked",
            TriggeringCondition::ProhibitedOperationCalled => "prohibited_operation_called",
        }
    }
}

impl std::fmt::Display for TriggeringCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for TriggeringCondition {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for TriggeringCondition {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        ALL_CONDITIONS
            .iter()
            .find(|c| c.as_str() == s)
            .copied()
            .ok_or_else(|| serde::de::Error::custom("unknown triggering condition token"))
    }
}

const ALL_CONDITIONS: &[TriggeringCondition] = &[
    TriggeringCondition::ContextFieldMissing,
    TriggeringCondition::ContextFieldUndeclared,
    TriggeringCondition::ContextIdMalformed,
    TriggeringCondition::ConfidenceMissing,
    TriggeringCondition::ConfidenceOutOfRange,
    TriggeringCondition::ConfidenceBelowThreshold,
    TriggeringCondition::IntentNameEmpty,
    TriggeringCondition::IntentUnregistered,
    TriggeringCondition::IntentNameMismatch,
    TriggeringCondition::PrincipalEmpty,
    TriggeringCondition::GrantAbsent,
    TriggeringCondition::GrantExpired,
    TriggeringCondition::GrantRevoked,
    TriggeringCondition::GrantUsesExhausted,
    TriggeringCondition::GrantScopeInvalid,
    TriggeringCondition::CapabilityRedefined,
    TriggeringCondition::CapabilitySelfInvoked,
    TriggeringCondition::FrictionClockShort,
    TriggeringCondition::SnapshotIdDuplicate,
    TriggeringCondition::SnapshotReused,
    TriggeringCondition::SnapshotHashDrift,
    TriggeringCondition::AuthorityVersionDrift,
    TriggeringCondition::CompositionOrderGap,
    TriggeringCondition::CompositionStepRefused,
    TriggeringCondition::CapabilityError,
    TriggeringCondition::CapabilityPanicked,
    TriggeringCondition::EvidenceSealingFailed,
    TriggeringCondition::DirectExecutionBlocked,
    TriggeringCondition::ProhibitedOperationCalled,
];

// ============================================================================
// INVARIANT LABELS
// ============================================================================

/// Short fixed labels for `violated_invariant`. Events reference these, never
/// ad-hoc strings.
pub mod invariants {
    pub const CONFIDENCE_BOUNDED: &str = "confidence must be present and within [0,1]";
    pub const INTENT_DECLARED: &str = "intent must name a registered capability";
    pub const FIELDS_EXACT: &str = "context fields must match the contract exactly";
    pub const PRINCIPAL_PRESENT: &str = "principal must be non-empty";
    pub const GRANT_LIVE: &str = "grant must exist and be live at admission";
    pub const GRANT_BOUNDED: &str = "bounded grants admit at most max_uses executions";
    pub const SNAPSHOT_STABLE: &str = "admitted inputs must match the captured snapshot";
    pub const AUTHORITY_STABLE: &str = "authority version must not drift across admission";
    pub const FRICTION_SERVED: &str = "the full friction delay must elapse before execution";
    pub const SINGLE_DOOR: &str = "capability execution requires a guard admission";
    pub const ORDER_SEQUENTIAL: &str = "composition steps must be numbered 0..n without gaps";
}

// ============================================================================
// FAILURE EVENT
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FailureId(pub Uuid);

impl FailureId {
    pub fn generate() -> Self {
        FailureId(Uuid::new_v4())
    }
}

/// Authority identifiers known at the point of refusal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthorityContext {
    pub principal_id: Option<PrincipalId>,
    pub grant_id: Option<GrantId>,
}

/// A single refusal, frozen at construction.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("refused: {failure_type} ({triggering_condition})")]
#[serde(deny_unknown_fields)]
pub struct FailureEvent {
    pub failure_id: FailureId,
    pub phase: Phase,
    pub failure_type: FailureType,
    pub violated_invariant: Option<String>,
    pub triggering_condition: TriggeringCondition,
    pub authority_context: AuthorityContext,
    pub snapshot_id: Option<SnapshotId>,
    pub timestamp: u64,
}

impl FailureEvent {
    pub fn new(
        phase: Phase,
        failure_type: FailureType,
        triggering_condition: TriggeringCondition,
        timestamp: u64,
    ) -> Self {
        FailureEvent {
            failure_id: FailureId::generate(),
            phase,
            failure_type,
            violated_invariant: None,
            triggering_condition,
            authority_context: AuthorityContext::default(),
            snapshot_id: None,
            timestamp,
        }
    }

    pub fn with_invariant(mut self, invariant: &'static str) -> Self {
        self.violated_invariant = Some(invariant.to_string());
        self
    }

    pub fn with_principal(mut self, principal: PrincipalId) -> Self {
        self.authority_context.principal_id = Some(principal);
        self
    }

    pub fn with_grant(mut self, grant: GrantId) -> Self {
        self.authority_context.grant_id = Some(grant);
        self
    }

    pub fn with_snapshot(mut self, snapshot: SnapshotId) -> Self {
        self.snapshot_id = Some(snapshot);
        self
    }
}

impl CanonicalEncode for FailureEvent {
    fn canonical_value(&self) -> serde_json::Value {
        serde_json::json!({
            "authority_context": {
                "grant_id": self.authority_context.grant_id.map(|g| g.0.to_string()),
                "principal_id": self.authority_context.principal_id.as_ref().map(|p| p.as_str()),
            },
            "failure_id": self.failure_id.0.to_string(),
            "failure_type": self.failure_type.as_str(),
            "phase": self.phase.as_str(),
            "snapshot_id": self.snapshot_id.map(|s| s.0.to_string()),
            "timestamp": self.timestamp,
            "triggering_condition": self.triggering_condition.as_str(),
            "violated_invariant": self.violated_invariant.clone(),
        })
    }
}

// ============================================================================
// FAILURE COMPOSITION / RESULT
// ============================================================================

/// Ordered, append-only list of failure events. Occurrence order is the only
/// order; duplicates are preserved.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FailureComposition {
    events: Vec<FailureEvent>,
}

impl FailureComposition {
    pub fn new() -> Self {
        FailureComposition { events: Vec::new() }
    }

    pub fn record(&mut self, event: FailureEvent) {
        self.events.push(event);
    }

    pub fn events(&self) -> &[FailureEvent] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

impl FromIterator<FailureEvent> for FailureComposition {
    fn from_iter<T: IntoIterator<Item = FailureEvent>>(iter: T) -> Self {
        FailureComposition {
            events: iter.into_iter().collect(),
        }
    }
}

/// Terminal refusal output of an admission or composition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureResult {
    pub composition: FailureComposition,
}

impl FailureResult {
    pub fn from_event(event: FailureEvent) -> Self {
        let mut composition = FailureComposition::new();
        composition.record(event);
        FailureResult { composition }
    }

    /// Always true. Refusals do not continue.
    pub fn terminal(&self) -> bool {
        true
    }

    /// The first-violated invariant's event.
    pub fn first(&self) -> Option<&FailureEvent> {
        self.composition.events().first()
    }
}
