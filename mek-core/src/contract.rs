//! Capability contracts.
//!
//! A contract binds a capability name to a static consequence level, the
//! exact set of context fields it requires, and a private execution function.
//! Contracts are registered once with the Guard; the execution function is
//! crate-private and cannot be reached by any caller outside the admission
//! pipeline.

use std::collections::BTreeSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::canonical::canonical_string;
use crate::context::Context;

/// Static risk class of a capability. Fixed thresholds, fixed friction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Consequence {
    Low,
    Medium,
    High,
}

impl Consequence {
    /// Minimum confidence demanded at the confidence gate. LOW has none.
    pub fn confidence_floor(&self) -> Option<f64> {
        match self {
            Consequence::Low => None,
            Consequence::Medium => Some(0.5),
            Consequence::High => Some(0.7),
        }
    }

    /// Base friction delay for this class.
    pub fn friction_base(&self) -> Duration {
        match self {
            Consequence::Low => Duration::ZERO,
            Consequence::Medium => Duration::from_secs(3),
            Consequence::High => Duration::from_secs(10),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Consequence::Low => "LOW",
            Consequence::Medium => "MEDIUM",
            Consequence::High => "HIGH",
        }
    }
}

/// Error raised by a capability's own execution. The Guard converts it into
/// an `EXECUTION_ERROR` failure event; it never crosses the kernel boundary.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("capability failed: {message}")]
pub struct CapabilityFailure {
    pub message: String,
}

impl CapabilityFailure {
    pub fn new(message: impl Into<String>) -> Self {
        CapabilityFailure {
            message: message.into(),
        }
    }
}

/// Output payload of a successful execution, canonical-JSON shaped.
pub type CapabilityOutput = serde_json::Value;

type CapabilityFn =
    Box<dyn Fn(&Context) -> Result<CapabilityOutput, CapabilityFailure> + Send + Sync>;

/// A registered capability. The `execute` member is deliberately unreachable
/// from outside this crate; the Guard is the single door.
pub struct CapabilityContract {
    name: String,
    consequence: Consequence,
    required_fields: BTreeSet<String>,
    execute: CapabilityFn,
}

impl CapabilityContract {
    pub fn new(
        name: impl AsRef<str>,
        consequence: Consequence,
        required_fields: impl IntoIterator<Item = String>,
        execute: impl Fn(&Context) -> Result<CapabilityOutput, CapabilityFailure>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        CapabilityContract {
            name: canonical_string(name.as_ref()),
            consequence,
            required_fields: required_fields
                .into_iter()
                .map(|f| canonical_string(&f))
                .collect(),
            execute: Box::new(execute),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn consequence(&self) -> Consequence {
        self.consequence
    }

    pub fn required_fields(&self) -> &BTreeSet<String> {
        &self.required_fields
    }

    /// True when a re-registration carries the same shape. Anything else is a
    /// capability redefinition and is refused.
    pub fn same_shape(&self, other: &CapabilityContract) -> bool {
        self.name == other.name
            && self.consequence == other.consequence
            && self.required_fields == other.required_fields
    }

    /// Admission step 12 only. Unreachable outside the crate.
    pub(crate) fn invoke(&self, ctx: &Context) -> Result<CapabilityOutput, CapabilityFailure> {
        (self.execute)(ctx)
    }
}

impl std::fmt::Debug for CapabilityContract {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityContract")
            .field("name", &self.name)
            .field("consequence", &self.consequence)
            .field("required_fields", &self.required_fields)
            .finish_non_exhaustive()
    }
}
