//! The kernel handle.
//!
//! One [`Kernel`] instance owns one Guard, one authority store, one snapshot
//! store, one observer hub and one evidence vault. There are no module-level
//! singletons: construct a kernel at startup and pass it to clients, or
//! construct several isolated ones in a test process.
//!
//! Grant issuance and revocation live here, outside the admission path. The
//! expected issuer is a human-operated policy surface or build-time
//! configuration; the kernel never self-issues, and proposals from any
//! reasoning layer carry no authority whatsoever.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::authority::{AuthorityError, AuthorityStore};
use crate::clock::MonotonicClock;
use crate::composition::{Composition, CompositionEngine, CompositionResult};
use crate::context::{Context, FieldValue, PrincipalId};
use crate::contract::CapabilityContract;
use crate::evidence::{self, BundleId, EvidenceVault, VerificationResult};
use crate::failure::FailureEvent;
use crate::grant::{Grant, GrantId, GrantScope, RevocationEvent, RevocationReason};
use crate::guard::{AdmissionResult, Guard};
use crate::keystore::{AttestationSigner, Ed25519Attester};
use crate::observer::{details, Observer, ObserverEventKind, ObserverHub, ObserverId};
use crate::snapshot::SnapshotStore;

/// Construction-time options. Friction, confidence thresholds and the
/// admission order are fixed in code and deliberately absent here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelConfig {
    /// Sign sealed evidence bundles with a per-instance Ed25519 key.
    pub attestation: bool,
    /// Hard ceiling on grant TTLs accepted by `issue_grant`, in seconds.
    pub grant_ttl_ceiling_secs: Option<u64>,
}

impl Default for KernelConfig {
    fn default() -> Self {
        KernelConfig {
            attestation: true,
            grant_ttl_ceiling_secs: None,
        }
    }
}

pub struct Kernel {
    guard: Guard,
    config: KernelConfig,
    attestation_key: Option<Arc<dyn AttestationSigner>>,
}

impl Kernel {
    pub fn new(config: KernelConfig) -> Self {
        let clock = MonotonicClock::new();
        let attestation_key: Option<Arc<dyn AttestationSigner>> = if config.attestation {
            // Key generation from the OS RNG cannot fail in practice; a
            // kernel without its key simply seals unattested bundles.
            Ed25519Attester::generate()
                .ok()
                .map(|k| Arc::new(k) as Arc<dyn AttestationSigner>)
        } else {
            None
        };

        let guard = Guard::new(
            clock,
            Arc::new(AuthorityStore::new(clock)),
            Arc::new(SnapshotStore::new()),
            Arc::new(ObserverHub::new()),
            Arc::new(EvidenceVault::new(clock, attestation_key.clone())),
        );
        Kernel {
            guard,
            config,
            attestation_key,
        }
    }

    pub fn clock(&self) -> MonotonicClock {
        self.guard.clock()
    }

    pub fn guard(&self) -> &Guard {
        &self.guard
    }

    /// Public key verifying this instance's bundle attestations, when
    /// attestation is enabled.
    pub fn attestation_public_key(&self) -> Option<Vec<u8>> {
        self.attestation_key.as_ref().map(|k| k.public_key_bytes())
    }

    // ------------------------------------------------------------------
    // Capability registration
    // ------------------------------------------------------------------

    pub fn register(&self, contract: CapabilityContract) -> Result<(), FailureEvent> {
        self.guard.register(contract)
    }

    // ------------------------------------------------------------------
    // Admission
    // ------------------------------------------------------------------

    /// Convenience constructor binding a context to this kernel's clock.
    pub fn new_context(
        &self,
        principal_id: PrincipalId,
        intent_name: impl AsRef<str>,
        confidence: Option<f64>,
        fields: BTreeMap<String, FieldValue>,
    ) -> Result<Context, FailureEvent> {
        Context::new(
            &self.clock(),
            principal_id,
            intent_name,
            confidence,
            fields,
        )
    }

    pub fn execute(&self, capability_name: &str, ctx: Context) -> AdmissionResult {
        self.guard.execute(capability_name, ctx)
    }

    pub fn execute_composition(&self, composition: Composition) -> CompositionResult {
        CompositionEngine::execute_composition(&self.guard, composition)
    }

    // ------------------------------------------------------------------
    // Grant issuance surface (outside the Guard path)
    // ------------------------------------------------------------------

    pub fn issue_grant(
        &self,
        principal_id: PrincipalId,
        capability_name: impl Into<String>,
        scope: GrantScope,
        ttl: Duration,
        max_uses: Option<u32>,
        revocable: bool,
    ) -> Result<Arc<Grant>, AuthorityError> {
        if let Some(ceiling) = self.config.grant_ttl_ceiling_secs {
            if ttl > Duration::from_secs(ceiling) {
                return Err(AuthorityError::TtlAboveCeiling);
            }
        }
        let capability_name = capability_name.into();
        let grant = self.guard.authority().issue(
            principal_id,
            capability_name.clone(),
            scope,
            ttl,
            max_uses,
            revocable,
        )?;
        self.guard.observers().emit(
            ObserverEventKind::GrantIssued,
            details([
                ("grant_id", grant.grant_id.to_string()),
                ("capability", capability_name),
            ]),
        );
        Ok(grant)
    }

    pub fn revoke(
        &self,
        grant_id: GrantId,
        revoked_by: PrincipalId,
        reason: RevocationReason,
    ) -> Result<(), AuthorityError> {
        self.guard.authority().revoke(grant_id, revoked_by, reason)?;
        self.guard.observers().emit(
            ObserverEventKind::GrantRevoked,
            details([("grant_id", grant_id.to_string())]),
        );
        Ok(())
    }

    pub fn revocation_of(&self, grant_id: GrantId) -> Option<RevocationEvent> {
        self.guard.authority().revocation_of(grant_id)
    }

    pub fn authority_version(&self) -> u64 {
        self.guard.authority().version()
    }

    // ------------------------------------------------------------------
    // Observers
    // ------------------------------------------------------------------

    pub fn register_observer(&self, observer: Arc<dyn Observer>) -> ObserverId {
        self.guard.observers().register(observer)
    }

    pub fn unregister_observer(&self, id: ObserverId) {
        self.guard.observers().unregister(id)
    }

    // ------------------------------------------------------------------
    // Evidence
    // ------------------------------------------------------------------

    pub fn export(&self, bundle_id: BundleId) -> Result<Vec<u8>, evidence::EvidenceError> {
        self.guard.evidence().export(bundle_id)
    }

    /// Pure integrity check; see [`evidence::verify`].
    pub fn verify(bytes: &[u8]) -> VerificationResult {
        evidence::verify(bytes)
    }

    // ------------------------------------------------------------------
    // Proposal sink
    // ------------------------------------------------------------------

    /// Accept proposal bytes from a reasoning layer and ignore them. The
    /// bytes are opaque; no parsing, no admission credit, no state change.
    /// Only an observer event records that something was offered.
    pub fn offer_proposal(&self, raw: &[u8]) {
        debug!("proposal offered ({} bytes); ignored", raw.len());
        self.guard.observers().emit(
            ObserverEventKind::ProposalIgnored,
            details([("size_bytes", raw.len().to_string())]),
        );
    }
}
