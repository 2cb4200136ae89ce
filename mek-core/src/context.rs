//! Per-invocation input primitives: principals, intents, contexts.
//!
//! A [`Context`] is constructed-only-if-valid: if it exists, its confidence
//! is a real number in `[0,1]` and its intent name is non-empty. Construction
//! failures are phase-0 [`FailureEvent`]s, not panics. Fields are private and
//! there are no mutators; a context lives for a single admission attempt.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::canonical::{canonical_string, CanonicalEncode, Digest32};
use crate::clock::MonotonicClock;
use crate::failure::{invariants, FailureEvent, FailureType, Phase, TriggeringCondition};

/// Opaque actor identifier. No hierarchy, no roles.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PrincipalId(String);

impl PrincipalId {
    pub fn new(raw: impl AsRef<str>) -> Self {
        PrincipalId(canonical_string(raw.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Display for PrincipalId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContextId(pub Uuid);

impl ContextId {
    pub fn generate() -> Self {
        ContextId(Uuid::new_v4())
    }

    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }
}

/// Closed value sum for explicit context fields, matching the canonical
/// serialization grammar exactly: strings, decimal integers, booleans, null.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Str(String),
    Int(i64),
    Bool(bool),
    Null,
}

impl FieldValue {
    pub fn str(raw: impl AsRef<str>) -> Self {
        FieldValue::Str(canonical_string(raw.as_ref()))
    }

    fn as_json(&self) -> serde_json::Value {
        match self {
            FieldValue::Str(s) => serde_json::Value::String(s.clone()),
            FieldValue::Int(i) => serde_json::Value::from(*i),
            FieldValue::Bool(b) => serde_json::Value::Bool(*b),
            FieldValue::Null => serde_json::Value::Null,
        }
    }
}

fn fields_json(fields: &BTreeMap<String, FieldValue>) -> serde_json::Value {
    let map: serde_json::Map<String, serde_json::Value> = fields
        .iter()
        .map(|(k, v)| (k.clone(), v.as_json()))
        .collect();
    serde_json::Value::Object(map)
}

/// Declared name plus the immutable parameters the capability will receive.
/// One intent per context; there is no inference and no ranking.
#[derive(Debug, Clone, PartialEq)]
pub struct Intent {
    name: String,
    params: BTreeMap<String, FieldValue>,
}

impl Intent {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn params(&self) -> &BTreeMap<String, FieldValue> {
        &self.params
    }

    pub fn record(&self) -> IntentRecord {
        IntentRecord {
            name: self.name.clone(),
            params: self.params.clone(),
        }
    }
}

/// Immutable per-invocation input. Owned by the call-site for the duration of
/// one admission attempt; its hashes outlive it inside snapshots and bundles.
#[derive(Debug, Clone)]
pub struct Context {
    context_id: ContextId,
    principal_id: PrincipalId,
    intent: Intent,
    confidence: f64,
    created_at: u64,
}

impl Context {
    /// Build a context, validating at the door. A missing or out-of-range
    /// confidence means the context never exists.
    pub fn new(
        clock: &MonotonicClock,
        principal_id: PrincipalId,
        intent_name: impl AsRef<str>,
        confidence: Option<f64>,
        fields: BTreeMap<String, FieldValue>,
    ) -> Result<Self, FailureEvent> {
        let now = clock.now_micros();

        let confidence = match confidence {
            None => {
                return Err(FailureEvent::new(
                    Phase::Mek0,
                    FailureType::MissingConfidence,
                    TriggeringCondition::ConfidenceMissing,
                    now,
                )
                .with_invariant(invariants::CONFIDENCE_BOUNDED)
                .with_principal(principal_id));
            }
            Some(c) if !c.is_finite() || !(0.0..=1.0).contains(&c) => {
                return Err(FailureEvent::new(
                    Phase::Mek0,
                    FailureType::InvalidConfidence,
                    TriggeringCondition::ConfidenceOutOfRange,
                    now,
                )
                .with_invariant(invariants::CONFIDENCE_BOUNDED)
                .with_principal(principal_id));
            }
            Some(c) => c,
        };

        let name = canonical_string(intent_name.as_ref());
        if name.is_empty() {
            return Err(FailureEvent::new(
                Phase::Mek0,
                FailureType::MissingIntent,
                TriggeringCondition::IntentNameEmpty,
                now,
            )
            .with_invariant(invariants::INTENT_DECLARED)
            .with_principal(principal_id));
        }

        let fields = fields
            .into_iter()
            .map(|(k, v)| (canonical_string(&k), v))
            .collect();

        Ok(Context {
            context_id: ContextId::generate(),
            principal_id,
            intent: Intent { name, params: fields },
            confidence,
            created_at: now,
        })
    }

    pub fn context_id(&self) -> ContextId {
        self.context_id
    }

    pub fn principal_id(&self) -> &PrincipalId {
        &self.principal_id
    }

    pub fn intent(&self) -> &Intent {
        &self.intent
    }

    pub fn intent_name(&self) -> &str {
        self.intent.name()
    }

    pub fn fields(&self) -> &BTreeMap<String, FieldValue> {
        self.intent.params()
    }

    pub fn confidence(&self) -> f64 {
        self.confidence
    }

    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    pub fn record(&self) -> ContextRecord {
        ContextRecord {
            context_id: self.context_id.0.to_string(),
            principal_id: self.principal_id.clone(),
            intent_name: self.intent.name.clone(),
            confidence: self.confidence,
            fields: self.intent.params.clone(),
            created_at: self.created_at,
        }
    }

    /// Digest of the full context record; captured into snapshots and
    /// recomputed bit-for-bit at re-validation.
    pub fn context_digest(&self) -> Digest32 {
        self.record().digest()
    }

    pub fn intent_digest(&self) -> Digest32 {
        self.intent.record().digest()
    }
}

// ============================================================================
// EVIDENCE RECORDS
// ============================================================================

/// Serializable snapshot of a context, as sealed into evidence bundles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ContextRecord {
    pub context_id: String,
    pub principal_id: PrincipalId,
    pub intent_name: String,
    pub confidence: f64,
    pub fields: BTreeMap<String, FieldValue>,
    pub created_at: u64,
}

impl CanonicalEncode for ContextRecord {
    fn canonical_value(&self) -> serde_json::Value {
        serde_json::json!({
            "confidence": self.confidence,
            "context_id": self.context_id.clone(),
            "created_at": self.created_at,
            "fields": fields_json(&self.fields),
            "intent_name": self.intent_name.clone(),
            "principal_id": self.principal_id.as_str(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IntentRecord {
    pub name: String,
    pub params: BTreeMap<String, FieldValue>,
}

impl CanonicalEncode for IntentRecord {
    fn canonical_value(&self) -> serde_json::Value {
        serde_json::json!({
            "name": self.name.clone(),
            "params": fields_json(&self.params),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PrincipalRecord {
    pub principal_id: PrincipalId,
}

impl CanonicalEncode for PrincipalRecord {
    fn canonical_value(&self) -> serde_json::Value {
        serde_json::json!({ "principal_id": self.principal_id.as_str() })
    }
}
