//! Reality-binding snapshots.
//!
//! A snapshot freezes the world-slice an admission was judged against:
//! content hashes of the context and intent, the grant's state, and the
//! authority version at capture. Re-validation recomputes every hashed input
//! and refuses on any drift. This is the TOCTOU gate.
//!
//! The store is append-only. Snapshots are never deleted or updated, and each
//! is validated at most once; a second validation of the same id is a reuse
//! attempt.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use parking_lot::RwLock;
use thiserror::Error;

use crate::canonical::{CanonicalEncode, Digest32};
use crate::context::PrincipalId;
use crate::grant::GrantId;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SnapshotError {
    #[error("snapshot id already present in store")]
    DuplicateId,

    #[error("snapshot already validated: reuse attempt")]
    ReuseAttempt,

    #[error("unknown snapshot id")]
    Unknown,
}

pub type Result<T> = std::result::Result<T, SnapshotError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SnapshotId(pub Uuid);

impl SnapshotId {
    pub fn generate() -> Self {
        SnapshotId(Uuid::new_v4())
    }
}

/// Immutable record of admitted inputs and authority state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Snapshot {
    pub snapshot_id: SnapshotId,
    pub captured_at: u64,
    pub principal_id: PrincipalId,
    pub grant_id: GrantId,
    pub capability_name: String,
    pub capability_scope_hash: Digest32,
    pub context_hash: Digest32,
    pub intent_hash: Digest32,
    pub confidence_value: f64,
    pub authority_version: u64,
    pub grant_expires_at: u64,
    pub grant_remaining_uses_at_capture: Option<i64>,
}

impl CanonicalEncode for Snapshot {
    fn canonical_value(&self) -> serde_json::Value {
        serde_json::json!({
            "authority_version": self.authority_version,
            "capability_name": self.capability_name.clone(),
            "capability_scope_hash": self.capability_scope_hash.to_hex(),
            "captured_at": self.captured_at,
            "confidence_value": self.confidence_value,
            "context_hash": self.context_hash.to_hex(),
            "grant_expires_at": self.grant_expires_at,
            "grant_id": self.grant_id.0.to_string(),
            "grant_remaining_uses_at_capture": self.grant_remaining_uses_at_capture,
            "intent_hash": self.intent_hash.to_hex(),
            "principal_id": self.principal_id.as_str(),
            "snapshot_id": self.snapshot_id.0.to_string(),
        })
    }
}

struct Stored {
    snapshot: Snapshot,
    validated: bool,
}

/// Append-only map of issued snapshots.
pub struct SnapshotStore {
    inner: RwLock<HashMap<SnapshotId, Stored>>,
}

impl SnapshotStore {
    pub fn new() -> Self {
        SnapshotStore {
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// Record a freshly captured snapshot. Ids are never reused.
    pub fn record(&self, snapshot: Snapshot) -> Result<()> {
        let mut inner = self.inner.write();
        if inner.contains_key(&snapshot.snapshot_id) {
            return Err(SnapshotError::DuplicateId);
        }
        inner.insert(
            snapshot.snapshot_id,
            Stored {
                snapshot,
                validated: false,
            },
        );
        Ok(())
    }

    /// Mark a snapshot as having passed re-validation. Exactly once per id;
    /// a second call is a reuse attempt.
    pub fn mark_validated(&self, id: SnapshotId) -> Result<()> {
        let mut inner = self.inner.write();
        let stored = inner.get_mut(&id).ok_or(SnapshotError::Unknown)?;
        if stored.validated {
            return Err(SnapshotError::ReuseAttempt);
        }
        stored.validated = true;
        Ok(())
    }

    pub fn get(&self, id: SnapshotId) -> Option<Snapshot> {
        self.inner.read().get(&id).map(|s| s.snapshot.clone())
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

impl Default for SnapshotStore {
    fn default() -> Self {
        Self::new()
    }
}
