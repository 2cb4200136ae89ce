//! Mandatory friction.
//!
//! A deterministic, blocking delay computed from consequence and confidence.
//! The table is fixed in code: HIGH 10s, MEDIUM 3s, LOW 0s, plus 5s whenever
//! confidence is below 0.6. There is no configuration surface, no client
//! flag, and no cancellation; the sleep runs inside the admission pipeline.

use std::time::{Duration, Instant};

use crate::contract::Consequence;

/// Confidence below this adds the penalty.
pub const CONFIDENCE_PENALTY_FLOOR: f64 = 0.6;

/// Added when confidence is below the floor.
pub const CONFIDENCE_PENALTY: Duration = Duration::from_secs(5);

/// The delay that will be served for a given consequence and confidence.
pub fn friction_delay(consequence: Consequence, confidence: f64) -> Duration {
    let mut delay = consequence.friction_base();
    if confidence < CONFIDENCE_PENALTY_FLOOR {
        delay += CONFIDENCE_PENALTY;
    }
    delay
}

pub struct FrictionEngine;

impl FrictionEngine {
    pub fn new() -> Self {
        FrictionEngine
    }

    /// Block for the full friction delay and report the wall time actually
    /// served, so the Guard can assert the lower bound was met.
    pub fn wait(&self, consequence: Consequence, confidence: f64) -> Duration {
        let delay = friction_delay(consequence, confidence);
        let start = Instant::now();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        start.elapsed()
    }
}

impl Default for FrictionEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_table() {
        assert_eq!(
            friction_delay(Consequence::High, 0.9),
            Duration::from_secs(10)
        );
        assert_eq!(
            friction_delay(Consequence::Medium, 0.9),
            Duration::from_secs(3)
        );
        assert_eq!(friction_delay(Consequence::Low, 0.9), Duration::ZERO);
    }

    #[test]
    fn test_low_confidence_penalty() {
        assert_eq!(
            friction_delay(Consequence::High, 0.5),
            Duration::from_secs(15)
        );
        assert_eq!(
            friction_delay(Consequence::Low, 0.1),
            Duration::from_secs(5)
        );
    }

    #[test]
    fn test_penalty_boundary_is_exclusive() {
        // exactly 0.6 pays no penalty
        assert_eq!(friction_delay(Consequence::Low, 0.6), Duration::ZERO);
        assert_eq!(
            friction_delay(Consequence::Low, 0.5999),
            Duration::from_secs(5)
        );
    }

    #[test]
    fn test_zero_delay_does_not_sleep() {
        let engine = FrictionEngine::new();
        let served = engine.wait(Consequence::Low, 0.9);
        assert!(served < Duration::from_millis(100));
    }
}
