//! The authority store: grants, revocations, and the authority version.
//!
//! Single in-memory table keyed by grant id, plus a `(principal, capability)`
//! index. All mutation goes through issue, consume, revoke, and the version
//! bump they share. `authority_version` is a monotonic
//! counter incremented on every issuance, revocation, and
//! consumption-to-zero; any snapshot holding an older version is stale.
//!
//! The store owns its grants. Nothing outside the kernel reaches in; the
//! issuance surface sits outside the Guard path and must verify its caller's
//! authority itself.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};
use parking_lot::RwLock;
use thiserror::Error;

use crate::clock::MonotonicClock;
use crate::context::PrincipalId;
use crate::grant::{
    Grant, GrantError, GrantId, GrantScope, RevocationEvent, RevocationReason,
};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthorityError {
    #[error("no grant for this principal and capability")]
    MissingGrant,

    #[error("grant expired")]
    ExpiredGrant,

    #[error("grant revoked")]
    RevokedGrant,

    #[error("grant uses exhausted")]
    ExhaustedGrant,

    #[error("grant scope is not canonical")]
    InvalidGrantScope,

    #[error("grant ttl exceeds the configured ceiling")]
    TtlAboveCeiling,

    #[error("grant is not revocable")]
    NotRevocable,
}

pub type Result<T> = std::result::Result<T, AuthorityError>;

/// Liveness of a grant at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrantStatus {
    Live,
    Expired,
    Revoked,
    Exhausted,
}

pub struct AuthorityStore {
    grants: RwLock<HashMap<GrantId, Arc<Grant>>>,
    index: RwLock<HashMap<(PrincipalId, String), Vec<GrantId>>>,
    revocations: RwLock<HashMap<GrantId, RevocationEvent>>,
    version: AtomicU64,
    clock: MonotonicClock,
}

impl AuthorityStore {
    pub fn new(clock: MonotonicClock) -> Self {
        AuthorityStore {
            grants: RwLock::new(HashMap::new()),
            index: RwLock::new(HashMap::new()),
            revocations: RwLock::new(HashMap::new()),
            version: AtomicU64::new(0),
            clock,
        }
    }

    /// Current authority version. Bumped on issuance, revocation, and
    /// consumption-to-zero; never decremented.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    fn bump_version(&self) -> u64 {
        self.version.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Issue a grant. Scope must already be canonical-grammar data (strings,
    /// integers, booleans, null, and containers of those).
    pub fn issue(
        &self,
        principal_id: PrincipalId,
        capability_name: String,
        scope: GrantScope,
        ttl: Duration,
        max_uses: Option<u32>,
        revocable: bool,
    ) -> Result<Arc<Grant>> {
        if !scope_is_canonical(&scope.0) {
            return Err(AuthorityError::InvalidGrantScope);
        }

        let issued_at = self.clock.now_micros();
        let expires_at = self.clock.deadline_micros(ttl);
        let grant = Arc::new(Grant::new(
            principal_id.clone(),
            capability_name.clone(),
            scope,
            issued_at,
            expires_at,
            max_uses,
            revocable,
        ));

        self.grants.write().insert(grant.grant_id, Arc::clone(&grant));
        self.index
            .write()
            .entry((principal_id, capability_name))
            .or_default()
            .push(grant.grant_id);
        let version = self.bump_version();

        info!(
            "grant issued: {} for ({}, {}), expires_at={}, max_uses={:?}, authority_version={}",
            grant.grant_id, grant.principal_id, grant.capability_name, expires_at, max_uses, version
        );
        Ok(grant)
    }

    pub fn get(&self, grant_id: GrantId) -> Option<Arc<Grant>> {
        self.grants.read().get(&grant_id).cloned()
    }

    /// The single strongest matching live grant. Tie-break is earliest
    /// `expires_at`: fail fast on the soonest-dying authority. Exhaustion is
    /// not filtered here; the use counter is judged at its own linearizable
    /// consume step.
    pub fn lookup(
        &self,
        principal_id: &PrincipalId,
        capability_name: &str,
    ) -> Option<Arc<Grant>> {
        let now = self.clock.now_micros();
        let key = (principal_id.clone(), capability_name.to_string());
        let ids = self.index.read().get(&key).cloned()?;
        let grants = self.grants.read();
        let revocations = self.revocations.read();

        ids.iter()
            .filter_map(|id| grants.get(id))
            .filter(|g| !revocations.contains_key(&g.grant_id))
            .filter(|g| !g.is_expired(now))
            .min_by_key(|g| g.expires_at)
            .cloned()
    }

    /// Liveness re-check, used by snapshot re-validation. Revocation takes
    /// precedence over expiry, expiry over exhaustion.
    pub fn status(&self, grant: &Grant) -> GrantStatus {
        if self.revocations.read().contains_key(&grant.grant_id) {
            return GrantStatus::Revoked;
        }
        if grant.is_expired(self.clock.now_micros()) {
            return GrantStatus::Expired;
        }
        if grant.remaining_uses() == Some(0) {
            return GrantStatus::Exhausted;
        }
        GrantStatus::Live
    }

    /// Atomically reserve one use. Couples the zero transition with the
    /// version bump: the compare-exchange winner of 1 to 0 is the one caller
    /// that bumps.
    pub fn consume(&self, grant_id: GrantId) -> Result<Option<i64>> {
        let grant = self.get(grant_id).ok_or(AuthorityError::MissingGrant)?;
        match grant.try_consume() {
            Ok(Some(0)) => {
                let version = self.bump_version();
                debug!(
                    "grant {} consumed to zero, authority_version={}",
                    grant_id, version
                );
                Ok(Some(0))
            }
            Ok(remaining) => Ok(remaining),
            Err(GrantError::Exhausted) => Err(AuthorityError::ExhaustedGrant),
        }
    }

    /// Append a revocation event. Idempotent: revoking a dead grant again is
    /// a no-op, not an error.
    pub fn revoke(
        &self,
        grant_id: GrantId,
        revoked_by: PrincipalId,
        reason: RevocationReason,
    ) -> Result<()> {
        let grant = self.get(grant_id).ok_or(AuthorityError::MissingGrant)?;
        if !grant.revocable {
            return Err(AuthorityError::NotRevocable);
        }

        let mut revocations = self.revocations.write();
        if revocations.contains_key(&grant_id) {
            return Ok(());
        }
        revocations.insert(
            grant_id,
            RevocationEvent {
                grant_id,
                revoked_by: revoked_by.clone(),
                reason,
                revoked_at: self.clock.now_micros(),
            },
        );
        // Bump inside the write lock so a concurrent reader never sees the
        // revocation without the version change.
        let version = self.bump_version();
        info!(
            "grant revoked: {} by {} ({:?}), authority_version={}",
            grant_id, revoked_by, reason, version
        );
        Ok(())
    }

    pub fn is_revoked(&self, grant_id: GrantId) -> bool {
        self.revocations.read().contains_key(&grant_id)
    }

    /// The terminal revocation record, if one exists.
    pub fn revocation_of(&self, grant_id: GrantId) -> Option<RevocationEvent> {
        self.revocations.read().get(&grant_id).cloned()
    }
}

/// Canonical-grammar check for scope data: strings, 64-bit integers,
/// booleans, null, and containers of those. Floats are not in the grammar.
fn scope_is_canonical(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Null | serde_json::Value::Bool(_) | serde_json::Value::String(_) => true,
        serde_json::Value::Number(n) => n.is_i64() || n.is_u64(),
        serde_json::Value::Array(items) => items.iter().all(scope_is_canonical),
        serde_json::Value::Object(map) => map.values().all(scope_is_canonical),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::thread;

    fn store() -> AuthorityStore {
        AuthorityStore::new(MonotonicClock::new())
    }

    fn issue(store: &AuthorityStore, ttl_secs: u64, max_uses: Option<u32>) -> Arc<Grant> {
        store
            .issue(
                PrincipalId::new("alice"),
                "file.read".to_string(),
                GrantScope(json!({"prefix": "/tmp/"})),
                Duration::from_secs(ttl_secs),
                max_uses,
                true,
            )
            .unwrap()
    }

    #[test]
    fn test_issue_bumps_version() {
        let store = store();
        assert_eq!(store.version(), 0);
        issue(&store, 60, None);
        assert_eq!(store.version(), 1);
    }

    #[test]
    fn test_lookup_finds_live_grant() {
        let store = store();
        let grant = issue(&store, 60, Some(1));
        let found = store.lookup(&PrincipalId::new("alice"), "file.read").unwrap();
        assert_eq!(found.grant_id, grant.grant_id);
    }

    #[test]
    fn test_lookup_misses_other_principal() {
        let store = store();
        issue(&store, 60, None);
        assert!(store.lookup(&PrincipalId::new("bob"), "file.read").is_none());
    }

    #[test]
    fn test_lookup_tie_breaks_on_earliest_expiry() {
        let store = store();
        let long = issue(&store, 3600, None);
        let short = issue(&store, 60, None);
        let found = store.lookup(&PrincipalId::new("alice"), "file.read").unwrap();
        assert_eq!(found.grant_id, short.grant_id);
        assert_ne!(found.grant_id, long.grant_id);
    }

    #[test]
    fn test_lookup_skips_revoked() {
        let store = store();
        let grant = issue(&store, 60, None);
        store
            .revoke(
                grant.grant_id,
                PrincipalId::new("root"),
                RevocationReason::SecurityIncident,
            )
            .unwrap();
        assert!(store.lookup(&PrincipalId::new("alice"), "file.read").is_none());
    }

    #[test]
    fn test_lookup_still_returns_exhausted_grant() {
        // Exhaustion is refused at consume, not hidden at lookup
        let store = store();
        let grant = issue(&store, 60, Some(1));
        store.consume(grant.grant_id).unwrap();
        let found = store.lookup(&PrincipalId::new("alice"), "file.read").unwrap();
        assert_eq!(found.grant_id, grant.grant_id);
        assert_eq!(
            store.consume(grant.grant_id),
            Err(AuthorityError::ExhaustedGrant)
        );
    }

    #[test]
    fn test_consume_to_zero_bumps_version_once() {
        let store = store();
        let grant = issue(&store, 60, Some(2));
        let after_issue = store.version();

        store.consume(grant.grant_id).unwrap();
        assert_eq!(store.version(), after_issue); // 2 -> 1: no bump

        store.consume(grant.grant_id).unwrap();
        assert_eq!(store.version(), after_issue + 1); // 1 -> 0: bump

        assert_eq!(
            store.consume(grant.grant_id),
            Err(AuthorityError::ExhaustedGrant)
        );
        assert_eq!(store.version(), after_issue + 1);
    }

    #[test]
    fn test_concurrent_consume_respects_max_uses() {
        let store = Arc::new(store());
        let grant = issue(&store, 60, Some(3));
        let mut handles = Vec::new();
        for _ in 0..12 {
            let store = Arc::clone(&store);
            let id = grant.grant_id;
            handles.push(thread::spawn(move || store.consume(id).is_ok()));
        }
        let successes = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|consumed| *consumed)
            .count();
        assert_eq!(successes, 3);
    }

    #[test]
    fn test_revoke_is_idempotent() {
        let store = store();
        let grant = issue(&store, 60, None);
        let by = PrincipalId::new("root");
        store
            .revoke(grant.grant_id, by.clone(), RevocationReason::PolicyChange)
            .unwrap();
        let version = store.version();
        store
            .revoke(grant.grant_id, by, RevocationReason::PolicyChange)
            .unwrap();
        // Second revoke: no-op, no version bump, original event preserved
        assert_eq!(store.version(), version);
        let event = store.revocation_of(grant.grant_id).unwrap();
        assert_eq!(event.reason, RevocationReason::PolicyChange);
    }

    #[test]
    fn test_revoke_unknown_grant_is_an_error() {
        let store = store();
        assert_eq!(
            store.revoke(
                GrantId::generate(),
                PrincipalId::new("root"),
                RevocationReason::ManualRevocation,
            ),
            Err(AuthorityError::MissingGrant)
        );
    }

    #[test]
    fn test_irrevocable_grant_stays_live() {
        let store = store();
        let grant = store
            .issue(
                PrincipalId::new("alice"),
                "file.read".to_string(),
                GrantScope::none(),
                Duration::from_secs(60),
                None,
                false,
            )
            .unwrap();
        assert_eq!(
            store.revoke(
                grant.grant_id,
                PrincipalId::new("root"),
                RevocationReason::ManualRevocation,
            ),
            Err(AuthorityError::NotRevocable)
        );
        assert_eq!(store.status(&grant), GrantStatus::Live);
    }

    #[test]
    fn test_status_precedence_revoked_over_exhausted() {
        let store = store();
        let grant = issue(&store, 60, Some(1));
        store.consume(grant.grant_id).unwrap();
        store
            .revoke(
                grant.grant_id,
                PrincipalId::new("root"),
                RevocationReason::SecurityIncident,
            )
            .unwrap();
        assert_eq!(store.status(&grant), GrantStatus::Revoked);
    }

    #[test]
    fn test_non_canonical_scope_refused() {
        let store = store();
        let result = store.issue(
            PrincipalId::new("alice"),
            "file.read".to_string(),
            GrantScope(json!({"ratio": 0.5})),
            Duration::from_secs(60),
            None,
            true,
        );
        assert_eq!(result.unwrap_err(), AuthorityError::InvalidGrantScope);
    }

    #[test]
    fn test_expired_grant_not_returned() {
        let store = store();
        issue(&store, 0, None);
        // TTL of zero expires immediately on the monotonic axis
        std::thread::sleep(Duration::from_millis(2));
        assert!(store.lookup(&PrincipalId::new("alice"), "file.read").is_none());
    }
}
