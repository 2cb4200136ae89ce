//! # MEK: Minimal Execution Kernel
//!
//! An authority-enforcement substrate: a single, non-bypassable gateway
//! through which every sensitive action must flow. Each invocation answers
//! one question (*may this principal, with this grant, on this world-state,
//! execute this capability now?*) and produces either an attestable result
//! or a structured refusal.
//!
//! ## Core Philosophy
//!
//! **Misuse is made mechanically impossible, not policy-discouraged.**
//!
//! - One door: capability execution functions are reachable only through the
//!   Guard's fixed 12-step admission pipeline
//! - Authority is explicit: time- and use-bounded grants, issued externally,
//!   revocable forever
//! - Reality is bound: snapshots capture admitted inputs and are re-validated
//!   after the mandatory friction delay (TOCTOU immunity)
//! - Refusals are data: closed failure enums, fixed-vocabulary triggers, no
//!   free text, no softening
//! - Everything leaves evidence: every terminal halt seals a hash-chained,
//!   Ed25519-attested bundle
//!
//! ## What the kernel never does
//!
//! No learning, no retries, no refusal merging, no intent inference, no
//! transitive authority, no re-execution from evidence, no mutation of
//! recorded facts. These absences are structural; see [`forbidden`].
//!
//! ## Example
//!
//! ```rust
//! use std::collections::BTreeMap;
//! use std::time::Duration;
//! use mek_core::*;
//!
//! let kernel = Kernel::new(KernelConfig::default());
//!
//! // Register a capability once, at client initialization
//! kernel.register(CapabilityContract::new(
//!     "file.read",
//!     Consequence::Low,
//!     ["path".to_string()],
//!     |ctx| Ok(serde_json::json!({"path": ctx.fields().get("path")})),
//! )).unwrap();
//!
//! // Authority comes from outside the admission path
//! kernel.issue_grant(
//!     PrincipalId::new("alice"),
//!     "file.read",
//!     GrantScope::none(),
//!     Duration::from_secs(60),
//!     Some(1),
//!     true,
//! ).unwrap();
//!
//! // One admission: context in, result or refusal out
//! let mut fields = BTreeMap::new();
//! fields.insert("path".to_string(), FieldValue::str("/tmp/x"));
//! let ctx = kernel
//!     .new_context(PrincipalId::new("alice"), "file.read", Some(0.9), fields)
//!     .unwrap();
//! let result = kernel.execute("file.read", ctx);
//! assert!(result.is_success());
//!
//! // Every halt leaves a verifiable bundle
//! let bytes = kernel.export(result.bundle_id().unwrap()).unwrap();
//! assert_eq!(Kernel::verify(&bytes), VerificationResult::Ok);
//! ```

pub mod authority;
pub mod canonical;
pub mod clock;
pub mod composition;
pub mod context;
pub mod contract;
pub mod evidence;
pub mod failure;
pub mod forbidden;
pub mod friction;
pub mod grant;
pub mod guard;
pub mod kernel;
pub mod keystore;
pub mod observer;
pub mod snapshot;

pub use authority::{AuthorityError, AuthorityStore, GrantStatus};
pub use canonical::{hash_bytes, CanonicalEncode, Digest32};
pub use clock::MonotonicClock;
pub use composition::{
    Composition, CompositionEngine, CompositionResult, FailurePolicy, Step, StepSuccess,
};
pub use context::{Context, ContextId, FieldValue, Intent, PrincipalId};
pub use contract::{CapabilityContract, CapabilityFailure, CapabilityOutput, Consequence};
pub use evidence::{
    verify, verify_attested, BundleId, BundleOutcome, EvidenceBundle, EvidenceVault,
    VerificationResult,
};
pub use failure::{
    FailureComposition, FailureEvent, FailureId, FailureResult, FailureType, Phase,
    TriggeringCondition,
};
pub use forbidden::ProhibitedBehaviorError;
pub use friction::friction_delay;
pub use grant::{Grant, GrantId, GrantScope, RevocationEvent, RevocationReason, UseCounter};
pub use guard::{AdmissionResult, Guard};
pub use kernel::{Kernel, KernelConfig};
pub use keystore::{AttestationSigner, Ed25519Attester};
pub use observer::{ChannelObserver, Observer, ObserverEvent, ObserverEventKind, ObserverId};
pub use snapshot::{Snapshot, SnapshotId, SnapshotStore};

/// Version of the MEK kernel crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod integration_tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::time::Duration;

    #[test]
    fn test_full_workflow() {
        let kernel = Kernel::new(KernelConfig::default());

        kernel
            .register(CapabilityContract::new(
                "file.read",
                Consequence::Low,
                ["path".to_string()],
                |_| Ok(serde_json::json!({"bytes": 12})),
            ))
            .unwrap();

        let grant = kernel
            .issue_grant(
                PrincipalId::new("alice"),
                "file.read",
                GrantScope(serde_json::json!({"prefix": "/tmp/"})),
                Duration::from_secs(60),
                Some(2),
                true,
            )
            .unwrap();

        let mut fields = BTreeMap::new();
        fields.insert("path".to_string(), FieldValue::str("/tmp/x"));
        let ctx = kernel
            .new_context(PrincipalId::new("alice"), "file.read", Some(0.9), fields)
            .unwrap();

        let result = kernel.execute("file.read", ctx);
        assert!(result.is_success());
        assert_eq!(grant.remaining_uses(), Some(1));

        // Revoke, then the next admission refuses
        kernel
            .revoke(
                grant.grant_id,
                PrincipalId::new("root"),
                RevocationReason::ManualRevocation,
            )
            .unwrap();

        let mut fields = BTreeMap::new();
        fields.insert("path".to_string(), FieldValue::str("/tmp/x"));
        let ctx = kernel
            .new_context(PrincipalId::new("alice"), "file.read", Some(0.9), fields)
            .unwrap();
        let refused = kernel.execute("file.read", ctx);
        assert!(!refused.is_success());
        assert_eq!(refused.failure_type(), Some(FailureType::MissingGrant));
    }
}
