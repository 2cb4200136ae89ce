//! Negative-capability assertions.
//!
//! These operations exist so that reaching for them is a visible, immediate
//! dead end instead of a hidden temptation. Each call produces a
//! [`ProhibitedBehaviorError`] and nothing else: the kernel has no learning,
//! no adaptation, no retry, no escalation, no urgency bypass, no
//! optimization of its checks, and no intent inference.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("prohibited behavior: {operation} is structurally absent from this kernel")]
pub struct ProhibitedBehaviorError {
    pub operation: &'static str,
}

macro_rules! prohibited {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        pub fn $name() -> ProhibitedBehaviorError {
            ProhibitedBehaviorError {
                operation: stringify!($name),
            }
        }
    };
}

prohibited!(
    /// The kernel does not learn thresholds from history.
    learn
);
prohibited!(
    /// The kernel does not adapt its checks to outcomes.
    adapt
);
prohibited!(
    /// A refusal is terminal; there is no second attempt.
    retry
);
prohibited!(
    /// No authority is ever widened by the kernel itself.
    escalate
);
prohibited!(
    /// Urgency does not shorten friction or skip a gate.
    urgency_bypass
);
prohibited!(
    /// The admission sequence is not tunable for speed.
    optimize
);
prohibited!(
    /// Intent is declared by the caller or absent; it is never inferred.
    infer_intent
);
