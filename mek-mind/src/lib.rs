//! # MEK Mind: the sandboxed intelligence boundary
//!
//! Reasoning code lives on this side of a hard build-graph boundary: this
//! crate declares no dependency on the kernel and cannot name its types: no
//! guard, no grants, no snapshots, no contracts, no failure or evidence
//! types. The only thing that crosses the boundary is a [`Proposal`]: opaque
//! data the kernel may ignore entirely.
//!
//! A proposal carries no authority, no admission credit and no execution
//! privilege. It is a suggestion with its uncertainty stated up front:
//! assumptions, a confidence range, known unknowns, and purely symbolic
//! actions that name what the proposer would like to happen without any
//! ability to make it happen.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProposalError {
    #[error("proposal text must be non-empty")]
    EmptyText,

    #[error("confidence range must satisfy 0 <= low <= high <= 1")]
    InvalidConfidenceRange,
}

/// A symbolic action: a verb and an object, nothing executable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolicAction {
    pub verb: String,
    pub object: String,
    pub detail: Option<String>,
}

impl SymbolicAction {
    pub fn new(verb: impl Into<String>, object: impl Into<String>) -> Self {
        SymbolicAction {
            verb: verb.into(),
            object: object.into(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Inert output of a reasoning layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
    pub proposal_id: Uuid,
    pub text: String,
    pub assumptions: Vec<String>,
    pub confidence_range: (f64, f64),
    pub known_unknowns: Vec<String>,
    pub symbolic_actions: Vec<SymbolicAction>,
}

impl Proposal {
    pub fn new(
        text: impl Into<String>,
        confidence_range: (f64, f64),
    ) -> Result<Self, ProposalError> {
        let text = text.into();
        if text.trim().is_empty() {
            return Err(ProposalError::EmptyText);
        }
        let (low, high) = confidence_range;
        let bounded = (0.0..=1.0).contains(&low) && (0.0..=1.0).contains(&high);
        if !bounded || low > high || low.is_nan() || high.is_nan() {
            return Err(ProposalError::InvalidConfidenceRange);
        }
        Ok(Proposal {
            proposal_id: Uuid::new_v4(),
            text,
            assumptions: Vec::new(),
            confidence_range,
            known_unknowns: Vec::new(),
            symbolic_actions: Vec::new(),
        })
    }

    pub fn with_assumption(mut self, assumption: impl Into<String>) -> Self {
        self.assumptions.push(assumption.into());
        self
    }

    pub fn with_unknown(mut self, unknown: impl Into<String>) -> Self {
        self.known_unknowns.push(unknown.into());
        self
    }

    pub fn with_symbolic_action(mut self, action: SymbolicAction) -> Self {
        self.symbolic_actions.push(action);
        self
    }

    /// Serialize for hand-off. Whatever receives these bytes owes this crate
    /// nothing; dropping them unread is a valid response.
    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("proposal serializes")
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        serde_json::from_slice(bytes).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proposal_round_trip() {
        let proposal = Proposal::new("rotate the backup key", (0.4, 0.7))
            .unwrap()
            .with_assumption("the old key is still valid")
            .with_unknown("whether the HSM is reachable")
            .with_symbolic_action(SymbolicAction::new("rotate", "backup-key"));

        let bytes = proposal.to_bytes();
        let restored = Proposal::from_bytes(&bytes).unwrap();
        assert_eq!(proposal, restored);
    }

    #[test]
    fn test_empty_text_rejected() {
        assert_eq!(
            Proposal::new("   ", (0.0, 1.0)).unwrap_err(),
            ProposalError::EmptyText
        );
    }

    #[test]
    fn test_confidence_range_validated() {
        assert!(Proposal::new("x", (0.8, 0.2)).is_err());
        assert!(Proposal::new("x", (-0.1, 0.5)).is_err());
        assert!(Proposal::new("x", (0.5, 1.2)).is_err());
        assert!(Proposal::new("x", (0.2, 0.2)).is_ok());
    }

    #[test]
    fn test_ids_unique() {
        let a = Proposal::new("x", (0.0, 1.0)).unwrap();
        let b = Proposal::new("x", (0.0, 1.0)).unwrap();
        assert_ne!(a.proposal_id, b.proposal_id);
    }

    #[test]
    fn test_symbolic_actions_are_data_only() {
        let action = SymbolicAction::new("delete", "/tmp/x").with_detail("stale artifact");
        // Nothing here can run; the fields are plain strings
        assert_eq!(action.verb, "delete");
        assert_eq!(action.detail.as_deref(), Some("stale artifact"));
    }
}
