//! Grants: time- and use-bounded authority for a (principal, capability) pair.
//!
//! A grant is frozen at issuance except for `remaining_uses`, the single
//! mutable field in the whole kernel. It lives behind [`UseCounter`], a
//! compare-exchange loop over an atomic, so concurrent admissions can never
//! jointly consume past `max_uses`. Revocation is terminal: there is no
//! un-revoke anywhere in the API.

use std::sync::atomic::{AtomicI64, Ordering};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::canonical::{CanonicalEncode, Digest32};
use crate::context::PrincipalId;

const ATOMIC_ORDERING: Ordering = Ordering::SeqCst;

#[derive(Debug, Error)]
pub enum GrantError {
    #[error("grant uses exhausted")]
    Exhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GrantId(pub Uuid);

impl GrantId {
    pub fn generate() -> Self {
        GrantId(Uuid::new_v4())
    }
}

impl std::fmt::Display for GrantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Capability-defined scope. The kernel never interprets it; it is canonical
/// bytes to hash and carry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GrantScope(pub serde_json::Value);

impl GrantScope {
    pub fn none() -> Self {
        GrantScope(serde_json::Value::Null)
    }
}

impl CanonicalEncode for GrantScope {
    fn canonical_value(&self) -> serde_json::Value {
        self.0.clone()
    }
}

/// Atomic use budget. The compare-exchange loop is the only mutation path;
/// the zero transition is won by exactly one caller.
#[derive(Debug)]
pub struct UseCounter {
    remaining: AtomicI64,
    bounded: bool,
}

impl UseCounter {
    pub fn unbounded() -> Self {
        UseCounter {
            remaining: AtomicI64::new(i64::MAX),
            bounded: false,
        }
    }

    pub fn bounded(max_uses: u32) -> Self {
        UseCounter {
            remaining: AtomicI64::new(i64::from(max_uses)),
            bounded: true,
        }
    }

    /// Reserve one use. Returns the post-decrement value for bounded
    /// counters, `None` for unbounded ones.
    pub fn try_consume(&self) -> Result<Option<i64>, GrantError> {
        if !self.bounded {
            return Ok(None);
        }
        let mut current = self.remaining.load(ATOMIC_ORDERING);
        loop {
            if current <= 0 {
                return Err(GrantError::Exhausted);
            }
            match self.remaining.compare_exchange(
                current,
                current - 1,
                ATOMIC_ORDERING,
                ATOMIC_ORDERING,
            ) {
                Ok(_) => return Ok(Some(current - 1)),
                Err(observed) => current = observed,
            }
        }
    }

    pub fn remaining(&self) -> Option<i64> {
        if self.bounded {
            Some(self.remaining.load(ATOMIC_ORDERING))
        } else {
            None
        }
    }
}

/// Authorization for one (principal, capability) pair. Created only by the
/// external issuance surface; the Guard never synthesizes or extends one.
#[derive(Debug)]
pub struct Grant {
    pub grant_id: GrantId,
    pub principal_id: PrincipalId,
    pub capability_name: String,
    pub scope: GrantScope,
    pub issued_at: u64,
    pub expires_at: u64,
    pub max_uses: Option<u32>,
    pub revocable: bool,
    uses: UseCounter,
}

impl Grant {
    pub fn new(
        principal_id: PrincipalId,
        capability_name: String,
        scope: GrantScope,
        issued_at: u64,
        expires_at: u64,
        max_uses: Option<u32>,
        revocable: bool,
    ) -> Self {
        let uses = match max_uses {
            Some(n) => UseCounter::bounded(n),
            None => UseCounter::unbounded(),
        };
        Grant {
            grant_id: GrantId::generate(),
            principal_id,
            capability_name,
            scope,
            issued_at,
            expires_at,
            max_uses,
            revocable,
            uses,
        }
    }

    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.expires_at
    }

    pub fn try_consume(&self) -> Result<Option<i64>, GrantError> {
        self.uses.try_consume()
    }

    pub fn remaining_uses(&self) -> Option<i64> {
        self.uses.remaining()
    }

    pub fn scope_digest(&self) -> Digest32 {
        self.scope.digest()
    }

    /// Frozen view of the grant for snapshots and evidence.
    pub fn record(&self) -> GrantRecord {
        GrantRecord {
            grant_id: self.grant_id,
            principal_id: self.principal_id.clone(),
            capability_name: self.capability_name.clone(),
            scope_hash: self.scope_digest(),
            issued_at: self.issued_at,
            expires_at: self.expires_at,
            max_uses: self.max_uses,
            remaining_uses: self.remaining_uses(),
            revocable: self.revocable,
        }
    }
}

/// Serializable view of a grant at a point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GrantRecord {
    pub grant_id: GrantId,
    pub principal_id: PrincipalId,
    pub capability_name: String,
    pub scope_hash: Digest32,
    pub issued_at: u64,
    pub expires_at: u64,
    pub max_uses: Option<u32>,
    pub remaining_uses: Option<i64>,
    pub revocable: bool,
}

impl CanonicalEncode for GrantRecord {
    fn canonical_value(&self) -> serde_json::Value {
        serde_json::json!({
            "capability_name": self.capability_name.clone(),
            "expires_at": self.expires_at,
            "grant_id": self.grant_id.0.to_string(),
            "issued_at": self.issued_at,
            "max_uses": self.max_uses,
            "principal_id": self.principal_id.as_str(),
            "remaining_uses": self.remaining_uses,
            "revocable": self.revocable,
            "scope_hash": self.scope_hash.to_hex(),
        })
    }
}

// ============================================================================
// REVOCATION
// ============================================================================

/// Closed issuance-policy vocabulary for revocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RevocationReason {
    ManualRevocation,
    PolicyChange,
    SecurityIncident,
    PrincipalOffboarded,
    IssuedInError,
}

/// Terminal and irreversible. A revoked grant is dead forever.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevocationEvent {
    pub grant_id: GrantId,
    pub revoked_by: PrincipalId,
    pub reason: RevocationReason,
    pub revoked_at: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn grant(max_uses: Option<u32>) -> Grant {
        Grant::new(
            PrincipalId::new("alice"),
            "file.read".to_string(),
            GrantScope(serde_json::json!({"prefix": "/tmp/"})),
            0,
            60_000_000,
            max_uses,
            true,
        )
    }

    #[test]
    fn test_bounded_counter_counts_down() {
        let counter = UseCounter::bounded(2);
        assert_eq!(counter.try_consume().unwrap(), Some(1));
        assert_eq!(counter.try_consume().unwrap(), Some(0));
        assert!(matches!(counter.try_consume(), Err(GrantError::Exhausted)));
    }

    #[test]
    fn test_unbounded_counter_never_exhausts() {
        let counter = UseCounter::unbounded();
        for _ in 0..1000 {
            assert_eq!(counter.try_consume().unwrap(), None);
        }
        assert_eq!(counter.remaining(), None);
    }

    #[test]
    fn test_zero_use_grant_starts_exhausted() {
        let g = grant(Some(0));
        assert!(matches!(g.try_consume(), Err(GrantError::Exhausted)));
    }

    #[test]
    fn test_concurrent_consumption_never_oversells() {
        let g = Arc::new(grant(Some(5)));
        let mut handles = Vec::new();
        for _ in 0..20 {
            let g = Arc::clone(&g);
            handles.push(thread::spawn(move || g.try_consume().is_ok()));
        }
        let successes = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|consumed| *consumed)
            .count();
        assert_eq!(successes, 5);
        assert_eq!(g.remaining_uses(), Some(0));
    }

    #[test]
    fn test_exactly_one_caller_wins_the_zero_transition() {
        let g = Arc::new(grant(Some(1)));
        let mut handles = Vec::new();
        for _ in 0..10 {
            let g = Arc::clone(&g);
            handles.push(thread::spawn(move || g.try_consume()));
        }
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let zero_winners = results
            .iter()
            .filter(|r| matches!(r, Ok(Some(0))))
            .count();
        assert_eq!(zero_winners, 1);
    }

    #[test]
    fn test_expiry_boundary() {
        let g = grant(None);
        assert!(!g.is_expired(59_999_999));
        assert!(g.is_expired(60_000_000));
    }

    #[test]
    fn test_record_reflects_remaining() {
        let g = grant(Some(3));
        g.try_consume().unwrap();
        let record = g.record();
        assert_eq!(record.remaining_uses, Some(2));
        assert_eq!(record.max_uses, Some(3));
        assert_eq!(record.scope_hash, g.scope_digest());
    }

    #[test]
    fn test_scope_digest_distinguishes_scopes() {
        let a = GrantScope(serde_json::json!({"prefix": "/tmp/"}));
        let b = GrantScope(serde_json::json!({"prefix": "/var/"}));
        assert_ne!(a.digest(), b.digest());
    }

    #[test]
    fn test_revocation_reason_wire_names() {
        let json = serde_json::to_string(&RevocationReason::SecurityIncident).unwrap();
        assert_eq!(json, "\"SECURITY_INCIDENT\"");
    }
}
