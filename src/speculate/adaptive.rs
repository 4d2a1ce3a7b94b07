//! Adaptive confidence threshold from the recent hit/miss window.
//!
//! A sliding window of outcomes drives a suggested threshold: low hit rates
//! push the gate up (speculate less, waste less), high hit rates pull it
//! down (speculate more, save more). The suggestion is always clamped to
//! the configured `[min, max]` band, itself inside `[0.40, 0.90]`.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

/// Outcomes remembered for the rate estimate.
const WINDOW: usize = 50;

/// Hit rate below this nudges the threshold up.
const LOW_HIT_RATE: f32 = 0.4;

/// Hit rate above this nudges the threshold down.
const HIGH_HIT_RATE: f32 = 0.7;

/// Per-observation adjustment step.
const STEP: f32 = 0.01;

/// Windowed hit-rate tracker producing a threshold suggestion.
pub struct AdaptiveThreshold {
    min: f32,
    max: f32,
    window: Mutex<VecDeque<bool>>,
    /// Current suggestion, stored as f32 bits for lock-free reads.
    suggestion: AtomicU32,
}

impl AdaptiveThreshold {
    /// Create a tracker starting at the given threshold, clamped to
    /// `[min, max]`.
    pub fn new(min: f32, max: f32, initial: f32) -> Self {
        let start = initial.clamp(min, max);
        Self {
            min,
            max,
            window: Mutex::new(VecDeque::with_capacity(WINDOW)),
            suggestion: AtomicU32::new(start.to_bits()),
        }
    }

    /// The current suggested threshold.
    pub fn suggestion(&self) -> f32 {
        f32::from_bits(self.suggestion.load(Ordering::Relaxed))
    }

    /// Feed one outcome and update the suggestion.
    pub fn record(&self, hit: bool) {
        let mut window = self.window.lock().expect("adaptive window poisoned");
        if window.len() == WINDOW {
            window.pop_front();
        }
        window.push_back(hit);
        // A handful of observations is noise, not signal.
        if window.len() < 10 {
            return;
        }
        let hits = window.iter().filter(|h| **h).count() as f32;
        let rate = hits / window.len() as f32;
        drop(window);

        let current = self.suggestion();
        let next = if rate < LOW_HIT_RATE {
            current + STEP
        } else if rate > HIGH_HIT_RATE {
            current - STEP
        } else {
            current
        };
        let next = next.clamp(self.min, self.max);
        self.suggestion.store(next.to_bits(), Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_clamped_to_band() {
        let t = AdaptiveThreshold::new(0.5, 0.8, 0.95);
        assert_eq!(t.suggestion(), 0.8);
    }

    #[test]
    fn misses_raise_the_threshold() {
        let t = AdaptiveThreshold::new(0.4, 0.9, 0.7);
        for _ in 0..30 {
            t.record(false);
        }
        assert!(t.suggestion() > 0.7);
        assert!(t.suggestion() <= 0.9);
    }

    #[test]
    fn hits_lower_the_threshold() {
        let t = AdaptiveThreshold::new(0.4, 0.9, 0.7);
        for _ in 0..30 {
            t.record(true);
        }
        assert!(t.suggestion() < 0.7);
        assert!(t.suggestion() >= 0.4);
    }

    #[test]
    fn suggestion_never_leaves_the_band() {
        let t = AdaptiveThreshold::new(0.6, 0.65, 0.62);
        for _ in 0..500 {
            t.record(false);
        }
        assert!(t.suggestion() <= 0.65);
        for _ in 0..500 {
            t.record(true);
        }
        assert!(t.suggestion() >= 0.6);
    }

    #[test]
    fn few_observations_do_not_move_the_gate() {
        let t = AdaptiveThreshold::new(0.4, 0.9, 0.7);
        for _ in 0..5 {
            t.record(false);
        }
        assert_eq!(t.suggestion(), 0.7);
    }
}
