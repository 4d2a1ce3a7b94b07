//! Speculative execution: run predicted next tools ahead of the workflow.
//!
//! The [`manager::SpeculationManager`] gates predictions (confidence
//! threshold, dangerous-operation blacklist, concurrency cap) and keeps the
//! hit/miss/net-benefit accounting; the [`executor::SpeculativeExecutor`]
//! actually runs gated predictions in sandboxes and caches their results
//! until the main path consumes or discards them.
//!
//! Errors inside speculation never reach the main workflow: they are
//! swallowed, logged, and show up only in metrics.

pub mod adaptive;
pub mod executor;
pub mod manager;

use serde::{Deserialize, Serialize};

/// A prediction considered for speculation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub tool_id: String,
    /// Confidence in `[0, 1]`.
    pub confidence: f32,
}

impl Prediction {
    pub fn new(tool_id: impl Into<String>, confidence: f32) -> Self {
        Self {
            tool_id: tool_id.into(),
            confidence,
        }
    }
}

/// Outcome of one speculation, reported by the consuming path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeculationOutcome {
    pub prediction_id: String,
    pub tool_id: String,
    pub was_correct: bool,
    pub execution_time_ms: u64,
    pub confidence: f32,
}

/// One cached speculative result, keyed by the target tool id.
///
/// Timestamps use `tokio::time::Instant` so TTL behavior follows the
/// runtime clock (which tests can pause and advance).
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub from_tool_id: Option<String>,
    pub to_tool_id: String,
    pub result: serde_json::Value,
    pub confidence: f32,
    pub created_at: tokio::time::Instant,
    pub ttl_ms: u64,
    /// How long the sandboxed execution took; credited as saved time on a
    /// hit.
    pub duration_ms: u64,
}

impl CacheEntry {
    /// Whether the entry's TTL has elapsed.
    pub fn is_expired(&self) -> bool {
        self.created_at.elapsed().as_millis() as u64 >= self.ttl_ms
    }
}
