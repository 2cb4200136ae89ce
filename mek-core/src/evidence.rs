//! Hash-chained evidence bundles.
//!
//! After every terminal halt, success or refusal alike, the kernel seals an
//! immutable bundle: frozen records of the context, intent, principal and
//! grant, the execution snapshots, exactly one of failure composition or
//! results, and the authority version at halt. The bundle elements are folded
//! into a SHA-256 chain:
//!
//! ```text
//! H_0 = hash(bundle_id || created_at)
//! H_i = hash(H_{i-1} || canonical_serialization(element_i))
//! ```
//!
//! with elements in a fixed order: context, intent, principal, grant (or the
//! empty tag), snapshots in admission order, failure events or results in
//! order, authority version. Any altered byte after sealing invalidates
//! `hash_chain_root`.
//!
//! The sealed root is additionally signed by the kernel's attestation signer
//! so a bundle can be attributed to the instance that produced it.
//! Verification never needs the signing key: `verify` is a pure function over
//! exported bytes, checks integrity and completeness only, and touches no
//! state.

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, warn};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::canonical::{hash_bytes, hash_concat, CanonicalEncode, Digest32};
use crate::clock::MonotonicClock;
use crate::context::{ContextRecord, IntentRecord, PrincipalRecord};
use crate::failure::FailureEvent;
use crate::grant::GrantRecord;
use crate::keystore::{verify_detached, AttestationSigner};
use crate::snapshot::Snapshot;

#[derive(Debug, Error)]
pub enum EvidenceError {
    #[error("unknown bundle id")]
    UnknownBundle,

    #[error("bundle attestation failed: {0}")]
    AttestationFailed(String),
}

pub type Result<T> = std::result::Result<T, EvidenceError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BundleId(pub Uuid);

impl BundleId {
    pub fn generate() -> Self {
        BundleId(Uuid::new_v4())
    }
}

impl std::fmt::Display for BundleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// One successful step's output, in step order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StepResultRecord {
    pub order: u32,
    pub data: serde_json::Value,
}

impl CanonicalEncode for StepResultRecord {
    fn canonical_value(&self) -> serde_json::Value {
        serde_json::json!({
            "data": self.data.clone(),
            "order": self.order,
        })
    }
}

/// Exactly one of a failure composition or success results. Never both.
/// Externally tagged, so an unknown tag fails deserialization on its own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BundleOutcome {
    #[serde(rename = "failure_composition")]
    Failure(Vec<FailureEvent>),
    #[serde(rename = "results")]
    Results(Vec<StepResultRecord>),
}

/// Ed25519 attestation over the sealed chain root. Not itself chained; the
/// root covers the bundle, the signature covers the root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Attestation {
    pub public_key: String,
    pub signature: String,
}

/// Immutable post-halt container. Never re-enters execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EvidenceBundle {
    pub bundle_id: BundleId,
    pub created_at: u64,
    pub context: ContextRecord,
    pub intent: IntentRecord,
    pub principal: PrincipalRecord,
    pub grant: Option<GrantRecord>,
    pub snapshots: Vec<Snapshot>,
    pub outcome: BundleOutcome,
    pub authority_version: u64,
    pub hash_chain_root: Digest32,
    pub attestation: Option<Attestation>,
}

impl EvidenceBundle {
    /// Recompute the chain over this bundle's elements. Pure.
    pub fn recompute_root(&self) -> Digest32 {
        compute_chain_root(
            self.bundle_id,
            self.created_at,
            &self.context,
            &self.intent,
            &self.principal,
            self.grant.as_ref(),
            &self.snapshots,
            &self.outcome,
            self.authority_version,
        )
    }
}

impl CanonicalEncode for EvidenceBundle {
    fn canonical_value(&self) -> serde_json::Value {
        let outcome = match &self.outcome {
            BundleOutcome::Failure(events) => serde_json::json!({
                "failure_composition": events
                    .iter()
                    .map(|e| e.canonical_value())
                    .collect::<Vec<_>>(),
            }),
            BundleOutcome::Results(results) => serde_json::json!({
                "results": results
                    .iter()
                    .map(|r| r.canonical_value())
                    .collect::<Vec<_>>(),
            }),
        };
        serde_json::json!({
            "attestation": self.attestation.clone(),
            "authority_version": self.authority_version,
            "bundle_id": self.bundle_id.0.to_string(),
            "context": self.context.canonical_value(),
            "created_at": self.created_at,
            "grant": self.grant.as_ref().map(|g| g.canonical_value()),
            "hash_chain_root": self.hash_chain_root.to_hex(),
            "intent": self.intent.canonical_value(),
            "outcome": outcome,
            "principal": self.principal.canonical_value(),
            "snapshots": self.snapshots
                .iter()
                .map(|s| s.canonical_value())
                .collect::<Vec<_>>(),
        })
    }
}

/// Tag hashed in place of an absent grant record.
const EMPTY_GRANT_TAG: &[u8] = b"null";

#[allow(clippy::too_many_arguments)]
fn compute_chain_root(
    bundle_id: BundleId,
    created_at: u64,
    context: &ContextRecord,
    intent: &IntentRecord,
    principal: &PrincipalRecord,
    grant: Option<&GrantRecord>,
    snapshots: &[Snapshot],
    outcome: &BundleOutcome,
    authority_version: u64,
) -> Digest32 {
    let mut seed = bundle_id.0.to_string().into_bytes();
    seed.extend_from_slice(created_at.to_string().as_bytes());
    let mut h = hash_bytes(&seed);

    let mut fold = |element: &[u8]| {
        h = hash_concat(h.as_bytes(), element);
    };

    fold(&context.canonical_bytes());
    fold(&intent.canonical_bytes());
    fold(&principal.canonical_bytes());
    match grant {
        Some(g) => fold(&g.canonical_bytes()),
        None => fold(EMPTY_GRANT_TAG),
    }
    for snapshot in snapshots {
        fold(&snapshot.canonical_bytes());
    }
    match outcome {
        BundleOutcome::Failure(events) => {
            for event in events {
                fold(&event.canonical_bytes());
            }
        }
        BundleOutcome::Results(results) => {
            for result in results {
                fold(&result.canonical_bytes());
            }
        }
    }
    fold(authority_version.to_string().as_bytes());
    h
}

// ============================================================================
// VERIFICATION
// ============================================================================

/// Outcome of verifying exported bundle bytes. Verification confirms
/// integrity and completeness; it never evaluates correctness.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationResult {
    Ok,
    Mismatch { detail: String },
    Malformed { detail: String },
}

/// Pure integrity check over exported bytes: parse, recompute the chain,
/// compare against the sealed root in constant time. When an attestation is
/// present its signature is checked against the embedded public key, so a
/// flipped byte anywhere in the export (chained elements, root, or the
/// attestation itself) fails verification.
pub fn verify(bytes: &[u8]) -> VerificationResult {
    let bundle: EvidenceBundle = match serde_json::from_slice(bytes) {
        Ok(b) => b,
        Err(e) => {
            return VerificationResult::Malformed {
                detail: e.to_string(),
            }
        }
    };

    let recomputed = bundle.recompute_root();
    if recomputed != bundle.hash_chain_root {
        return VerificationResult::Mismatch {
            detail: "hash chain root does not match bundle contents".to_string(),
        };
    }

    if let Some(attestation) = &bundle.attestation {
        let public_key = match hex::decode(&attestation.public_key) {
            Ok(k) => k,
            Err(_) => {
                return VerificationResult::Malformed {
                    detail: "attestation public key is not hex".to_string(),
                }
            }
        };
        let signature = match hex::decode(&attestation.signature) {
            Ok(s) => s,
            Err(_) => {
                return VerificationResult::Malformed {
                    detail: "attestation signature is not hex".to_string(),
                }
            }
        };
        if verify_detached(&public_key, bundle.hash_chain_root.as_bytes(), &signature).is_err() {
            return VerificationResult::Mismatch {
                detail: "attestation signature does not verify".to_string(),
            };
        }
    }
    VerificationResult::Ok
}

/// Integrity check plus attribution: the bundle must be attested, and by the
/// supplied public key. An attacker re-signing a tampered bundle with their
/// own key passes `verify` but not this.
pub fn verify_attested(bytes: &[u8], public_key: &[u8]) -> VerificationResult {
    match verify(bytes) {
        VerificationResult::Ok => {}
        other => return other,
    }
    // Parse error is impossible here; verify() already parsed these bytes.
    let bundle: EvidenceBundle = match serde_json::from_slice(bytes) {
        Ok(b) => b,
        Err(e) => {
            return VerificationResult::Malformed {
                detail: e.to_string(),
            }
        }
    };

    match &bundle.attestation {
        Some(attestation) if attestation.public_key == hex::encode(public_key) => {
            VerificationResult::Ok
        }
        Some(_) => VerificationResult::Mismatch {
            detail: "bundle is attested by a different key".to_string(),
        },
        None => VerificationResult::Mismatch {
            detail: "bundle carries no attestation".to_string(),
        },
    }
}

// ============================================================================
// VAULT
// ============================================================================

/// Owner of sealed bundles. Sealing is the only write; export is read-only.
pub struct EvidenceVault {
    bundles: RwLock<HashMap<BundleId, Arc<EvidenceBundle>>>,
    attester: Option<Arc<dyn AttestationSigner>>,
    clock: MonotonicClock,
}

impl EvidenceVault {
    pub fn new(clock: MonotonicClock, attester: Option<Arc<dyn AttestationSigner>>) -> Self {
        EvidenceVault {
            bundles: RwLock::new(HashMap::new()),
            attester,
            clock,
        }
    }

    /// Build, chain, attest and retain a bundle.
    #[allow(clippy::too_many_arguments)]
    pub fn seal(
        &self,
        context: ContextRecord,
        intent: IntentRecord,
        principal: PrincipalRecord,
        grant: Option<GrantRecord>,
        snapshots: Vec<Snapshot>,
        outcome: BundleOutcome,
        authority_version: u64,
    ) -> Result<Arc<EvidenceBundle>> {
        let bundle_id = BundleId::generate();
        let created_at = self.clock.now_micros();
        let hash_chain_root = compute_chain_root(
            bundle_id,
            created_at,
            &context,
            &intent,
            &principal,
            grant.as_ref(),
            &snapshots,
            &outcome,
            authority_version,
        );

        let attestation = match &self.attester {
            Some(attester) => {
                let signature = attester.sign_root(hash_chain_root.as_bytes()).map_err(|e| {
                    warn!("bundle attestation failed: {e}");
                    EvidenceError::AttestationFailed(e.to_string())
                })?;
                Some(Attestation {
                    public_key: hex::encode(attester.public_key_bytes()),
                    signature: hex::encode(signature),
                })
            }
            None => None,
        };

        let bundle = Arc::new(EvidenceBundle {
            bundle_id,
            created_at,
            context,
            intent,
            principal,
            grant,
            snapshots,
            outcome,
            authority_version,
            hash_chain_root,
            attestation,
        });
        self.bundles.write().insert(bundle_id, Arc::clone(&bundle));
        debug!("bundle sealed: {} root={}", bundle_id, hash_chain_root);
        Ok(bundle)
    }

    pub fn get(&self, bundle_id: BundleId) -> Option<Arc<EvidenceBundle>> {
        self.bundles.read().get(&bundle_id).cloned()
    }

    /// Canonical bytes of a sealed bundle. Read-only, side-effect free.
    pub fn export(&self, bundle_id: BundleId) -> Result<Vec<u8>> {
        let bundle = self.get(bundle_id).ok_or(EvidenceError::UnknownBundle)?;
        Ok(bundle.canonical_bytes())
    }

    pub fn len(&self) -> usize {
        self.bundles.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.bundles.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::PrincipalId;
    use crate::failure::{FailureType, Phase, TriggeringCondition};
    use crate::keystore::Ed25519Attester;
    use std::collections::BTreeMap;

    fn vault(with_key: bool) -> EvidenceVault {
        let attester: Option<Arc<dyn AttestationSigner>> = if with_key {
            Some(Arc::new(Ed25519Attester::generate().unwrap()))
        } else {
            None
        };
        EvidenceVault::new(MonotonicClock::new(), attester)
    }

    fn parts() -> (ContextRecord, IntentRecord, PrincipalRecord) {
        let context = ContextRecord {
            context_id: Uuid::new_v4().to_string(),
            principal_id: PrincipalId::new("alice"),
            intent_name: "file.read".to_string(),
            confidence: 0.9,
            fields: BTreeMap::new(),
            created_at: 7,
        };
        let intent = IntentRecord {
            name: "file.read".to_string(),
            params: BTreeMap::new(),
        };
        let principal = PrincipalRecord {
            principal_id: PrincipalId::new("alice"),
        };
        (context, intent, principal)
    }

    fn seal_success(vault: &EvidenceVault) -> Arc<EvidenceBundle> {
        let (context, intent, principal) = parts();
        vault
            .seal(
                context,
                intent,
                principal,
                None,
                Vec::new(),
                BundleOutcome::Results(vec![StepResultRecord {
                    order: 0,
                    data: serde_json::json!({"bytes": 42}),
                }]),
                3,
            )
            .unwrap()
    }

    #[test]
    fn test_export_verifies_ok() {
        let vault = vault(true);
        let bundle = seal_success(&vault);
        let bytes = vault.export(bundle.bundle_id).unwrap();
        assert_eq!(verify(&bytes), VerificationResult::Ok);
    }

    #[test]
    fn test_root_matches_recompute() {
        let vault = vault(false);
        let bundle = seal_success(&vault);
        assert_eq!(bundle.recompute_root(), bundle.hash_chain_root);
    }

    #[test]
    fn test_single_byte_flip_is_a_mismatch() {
        let vault = vault(false);
        let bundle = seal_success(&vault);
        let bytes = vault.export(bundle.bundle_id).unwrap();

        // Flip one byte inside the results region
        let needle = b"\"bytes\":42";
        let pos = bytes
            .windows(needle.len())
            .position(|w| w == needle)
            .unwrap();
        let mut tampered = bytes.clone();
        tampered[pos + needle.len() - 1] = b'3';

        assert!(matches!(
            verify(&tampered),
            VerificationResult::Mismatch { .. }
        ));
    }

    #[test]
    fn test_garbage_is_malformed() {
        assert!(matches!(
            verify(b"not a bundle"),
            VerificationResult::Malformed { .. }
        ));
    }

    #[test]
    fn test_missing_field_is_malformed() {
        let vault = vault(false);
        let bundle = seal_success(&vault);
        let bytes = vault.export(bundle.bundle_id).unwrap();
        let mut value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        value.as_object_mut().unwrap().remove("authority_version");
        let stripped = serde_json::to_vec(&value).unwrap();
        assert!(matches!(
            verify(&stripped),
            VerificationResult::Malformed { .. }
        ));
    }

    #[test]
    fn test_attested_round_trip() {
        let attester = Ed25519Attester::generate().unwrap();
        let public_key = attester.public_key_bytes();
        let vault = EvidenceVault::new(MonotonicClock::new(), Some(Arc::new(attester)));
        let bundle = seal_success(&vault);
        let bytes = vault.export(bundle.bundle_id).unwrap();

        assert_eq!(verify_attested(&bytes, &public_key), VerificationResult::Ok);

        let other = Ed25519Attester::generate().unwrap();
        assert!(matches!(
            verify_attested(&bytes, &other.public_key_bytes()),
            VerificationResult::Mismatch { .. }
        ));
    }

    #[test]
    fn test_unattested_bundle_fails_attested_check() {
        let vault = vault(false);
        let bundle = seal_success(&vault);
        let bytes = vault.export(bundle.bundle_id).unwrap();
        let key = Ed25519Attester::generate().unwrap().public_key_bytes();
        assert!(matches!(
            verify_attested(&bytes, &key),
            VerificationResult::Mismatch { .. }
        ));
    }

    #[test]
    fn test_failure_bundle_chains_events() {
        let vault = vault(false);
        let (context, intent, principal) = parts();
        let event = FailureEvent::new(
            Phase::Mek2,
            FailureType::MissingGrant,
            TriggeringCondition::GrantAbsent,
            10,
        );
        let bundle = vault
            .seal(
                context,
                intent,
                principal,
                None,
                Vec::new(),
                BundleOutcome::Failure(vec![event]),
                1,
            )
            .unwrap();
        let bytes = vault.export(bundle.bundle_id).unwrap();
        assert_eq!(verify(&bytes), VerificationResult::Ok);
    }

    #[test]
    fn test_export_unknown_bundle() {
        let vault = vault(false);
        assert!(matches!(
            vault.export(BundleId::generate()),
            Err(EvidenceError::UnknownBundle)
        ));
    }

    #[test]
    fn test_verify_has_no_side_effects() {
        let vault = vault(false);
        let bundle = seal_success(&vault);
        let bytes = vault.export(bundle.bundle_id).unwrap();
        let before = vault.len();
        let _ = verify(&bytes);
        let _ = verify(&bytes);
        assert_eq!(vault.len(), before);
        assert_eq!(vault.export(bundle.bundle_id).unwrap(), bytes);
    }

    #[test]
    fn test_distinct_bundles_distinct_roots() {
        let vault = vault(false);
        let a = seal_success(&vault);
        let b = seal_success(&vault);
        assert_ne!(a.hash_chain_root, b.hash_chain_root);
    }
}
