//! Speculation manager: gating, accounting, and pattern reinforcement.
//!
//! `should_speculate` is the single gate every prediction passes before a
//! sandbox is spun up: the engine must be enabled, the confidence must
//! clear the active threshold, and the tool must not look like a dangerous
//! operation. Outcomes feed the monotone hit/miss counters and, on a hit,
//! reinforce the corresponding sequence edge in the graph.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::config::SpeculationConfig;
use crate::graph::store::GraphStore;

use super::adaptive::AdaptiveThreshold;
use super::{Prediction, SpeculationOutcome};

/// Build-time blacklist of operation substrings that must never run
/// speculatively. Matched case-insensitively against the tool id.
pub const DANGEROUS_OPERATIONS: [&str; 10] = [
    "delete",
    "remove",
    "deploy",
    "payment",
    "send_email",
    "execute_shell",
    "drop",
    "truncate",
    "transfer",
    "admin",
];

/// Monotone counters snapshot plus derived rates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeculationMetrics {
    pub total_speculations: u64,
    pub total_hits: u64,
    pub total_misses: u64,
    pub total_saved_ms: u64,
    pub total_wasted_ms: u64,
    /// `hits / speculations` (0 when nothing ran yet).
    pub hit_rate: f32,
    /// `saved − wasted`, may be negative.
    pub net_benefit_ms: i64,
    /// `misses / (hits + misses)`.
    pub false_positive_rate: f32,
}

/// Gate + accounting for the speculation engine.
pub struct SpeculationManager {
    config: SpeculationConfig,
    total_speculations: AtomicU64,
    total_hits: AtomicU64,
    total_misses: AtomicU64,
    total_saved_ms: AtomicU64,
    total_wasted_ms: AtomicU64,
    adaptive: Option<AdaptiveThreshold>,
    graph: Option<Arc<GraphStore>>,
}

impl SpeculationManager {
    /// Build from config; wires the adaptive tracker when enabled.
    pub fn new(config: SpeculationConfig) -> Self {
        let adaptive = config.adaptive.enabled.then(|| {
            AdaptiveThreshold::new(
                config.adaptive.min_threshold,
                config.adaptive.max_threshold,
                config.confidence_threshold,
            )
        });
        Self {
            config,
            total_speculations: AtomicU64::new(0),
            total_hits: AtomicU64::new(0),
            total_misses: AtomicU64::new(0),
            total_saved_ms: AtomicU64::new(0),
            total_wasted_ms: AtomicU64::new(0),
            adaptive,
            graph: None,
        }
    }

    /// Attach the graph store so hits can reinforce sequence edges.
    pub fn with_graph(mut self, graph: Arc<GraphStore>) -> Self {
        self.graph = Some(graph);
        self
    }

    /// The active threshold: the adaptive suggestion when attached, else
    /// the static config value.
    pub fn current_threshold(&self) -> f32 {
        self.adaptive
            .as_ref()
            .map(AdaptiveThreshold::suggestion)
            .unwrap_or(self.config.confidence_threshold)
    }

    /// Whether the tool id matches the dangerous-operation blacklist.
    pub fn is_dangerous(tool_id: &str) -> bool {
        let lower = tool_id.to_lowercase();
        DANGEROUS_OPERATIONS.iter().any(|op| lower.contains(op))
    }

    /// The gate: enabled ∧ confident enough ∧ not dangerous.
    pub fn should_speculate(&self, prediction: &Prediction) -> bool {
        self.config.enabled
            && prediction.confidence >= self.current_threshold()
            && !Self::is_dangerous(&prediction.tool_id)
    }

    /// Filter a prediction list for speculation, preserving order and
    /// capping at the configured concurrency.
    pub fn filter_for_speculation(&self, predictions: &[Prediction]) -> Vec<Prediction> {
        predictions
            .iter()
            .filter(|p| self.should_speculate(p))
            .take(self.config.max_concurrent_speculations)
            .cloned()
            .collect()
    }

    /// Count one speculation actually launched.
    pub fn record_started(&self) {
        self.total_speculations.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a consumption outcome.
    ///
    /// Hits add the sandboxed execution time to the saved column and
    /// reinforce `from_tool → tool` when the graph is attached; misses add
    /// it to the wasted column. Timeouts that were never consumed do not
    /// come through here at all.
    pub fn record_outcome(&self, outcome: &SpeculationOutcome, from_tool_id: Option<&str>) {
        if outcome.was_correct {
            self.total_hits.fetch_add(1, Ordering::Relaxed);
            self.total_saved_ms
                .fetch_add(outcome.execution_time_ms, Ordering::Relaxed);
            if let (Some(from), Some(graph)) = (from_tool_id, &self.graph) {
                match graph.reinforce(from, &outcome.tool_id) {
                    Ok(edge) => tracing::debug!(
                        from,
                        to = %outcome.tool_id,
                        weight = edge.weight,
                        "reinforced speculation pattern"
                    ),
                    Err(e) => tracing::debug!(
                        from,
                        to = %outcome.tool_id,
                        error = %e,
                        "could not reinforce pattern"
                    ),
                }
            }
        } else {
            self.total_misses.fetch_add(1, Ordering::Relaxed);
            self.total_wasted_ms
                .fetch_add(outcome.execution_time_ms, Ordering::Relaxed);
        }
        if let Some(adaptive) = &self.adaptive {
            adaptive.record(outcome.was_correct);
        }
    }

    /// Current metrics snapshot.
    pub fn metrics(&self) -> SpeculationMetrics {
        let speculations = self.total_speculations.load(Ordering::Relaxed);
        let hits = self.total_hits.load(Ordering::Relaxed);
        let misses = self.total_misses.load(Ordering::Relaxed);
        let saved = self.total_saved_ms.load(Ordering::Relaxed);
        let wasted = self.total_wasted_ms.load(Ordering::Relaxed);
        SpeculationMetrics {
            total_speculations: speculations,
            total_hits: hits,
            total_misses: misses,
            total_saved_ms: saved,
            total_wasted_ms: wasted,
            hit_rate: if speculations > 0 {
                hits as f32 / speculations as f32
            } else {
                0.0
            },
            net_benefit_ms: saved as i64 - wasted as i64,
            false_positive_rate: if hits + misses > 0 {
                misses as f32 / (hits + misses) as f32
            } else {
                0.0
            },
        }
    }

    /// The loaded config.
    pub fn config(&self) -> &SpeculationConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AdaptiveConfig;
    use crate::graph::{EdgeSource, EdgeType};

    fn manager() -> SpeculationManager {
        SpeculationManager::new(SpeculationConfig::default())
    }

    fn outcome(tool: &str, correct: bool, ms: u64) -> SpeculationOutcome {
        SpeculationOutcome {
            prediction_id: format!("p-{tool}"),
            tool_id: tool.into(),
            was_correct: correct,
            execution_time_ms: ms,
            confidence: 0.8,
        }
    }

    #[test]
    fn every_dangerous_operation_is_blocked_at_full_confidence() {
        let m = manager();
        for op in DANGEROUS_OPERATIONS {
            let p = Prediction::new(op, 1.0);
            assert!(!m.should_speculate(&p), "{op} must never speculate");
        }
        // Substring and case-insensitive matching.
        assert!(!m.should_speculate(&Prediction::new("delete_user", 1.0)));
        assert!(!m.should_speculate(&Prediction::new("DB_DROP_TABLE", 1.0)));
        assert!(m.should_speculate(&Prediction::new("fs_read", 1.0)));
    }

    #[test]
    fn filter_preserves_order_and_caps_concurrency() {
        let mut config = SpeculationConfig::default();
        config.confidence_threshold = 0.70;
        config.max_concurrent_speculations = 2;
        let m = SpeculationManager::new(config);

        let predictions = vec![
            Prediction::new("a", 0.8),
            Prediction::new("b", 0.6),
            Prediction::new("c", 0.75),
        ];
        let filtered = m.filter_for_speculation(&predictions);
        assert_eq!(
            filtered,
            vec![Prediction::new("a", 0.8), Prediction::new("c", 0.75)]
        );
    }

    #[test]
    fn dangerous_prediction_filters_to_empty() {
        let m = manager();
        let filtered = m.filter_for_speculation(&[Prediction::new("delete_user", 0.95)]);
        assert!(filtered.is_empty());
    }

    #[test]
    fn disabled_engine_never_speculates() {
        let m = SpeculationManager::new(SpeculationConfig {
            enabled: false,
            ..Default::default()
        });
        assert!(!m.should_speculate(&Prediction::new("fs_read", 0.99)));
    }

    #[test]
    fn metrics_follow_the_counters() {
        let m = manager();
        m.record_started();
        m.record_started();
        m.record_outcome(&outcome("a", true, 120), None);

        let metrics = m.metrics();
        assert_eq!(metrics.total_speculations, 2);
        assert_eq!(metrics.total_hits, 1);
        assert_eq!(metrics.total_misses, 0);
        assert_eq!(metrics.hit_rate, 0.5);
        assert_eq!(metrics.net_benefit_ms, 120);

        m.record_outcome(&outcome("b", false, 80), None);
        let metrics = m.metrics();
        assert_eq!(metrics.total_misses, 1);
        assert_eq!(metrics.net_benefit_ms, 40);
        assert_eq!(metrics.false_positive_rate, 0.5);
    }

    #[test]
    fn counters_are_monotone() {
        let m = manager();
        let mut last_hits = 0;
        let mut last_misses = 0;
        for i in 0..20 {
            m.record_started();
            m.record_outcome(&outcome("t", i % 3 == 0, 10), None);
            let metrics = m.metrics();
            assert!(metrics.total_hits >= last_hits);
            assert!(metrics.total_misses >= last_misses);
            last_hits = metrics.total_hits;
            last_misses = metrics.total_misses;
        }
    }

    #[test]
    fn hit_reinforces_graph_edge() {
        let graph = Arc::new(GraphStore::new());
        graph.register_tool("a", None).unwrap();
        graph.register_tool("b", None).unwrap();
        let m = manager().with_graph(Arc::clone(&graph));

        m.record_outcome(&outcome("b", true, 10), Some("a"));
        let edge = graph.get_edge_data("a", "b", EdgeType::Sequence).unwrap();
        assert_eq!(edge.source, EdgeSource::Learned);
        assert!((edge.weight - 0.5).abs() < 1e-6);
    }

    #[test]
    fn adaptive_threshold_is_used_when_attached() {
        let config = SpeculationConfig {
            confidence_threshold: 0.70,
            adaptive: AdaptiveConfig {
                enabled: true,
                min_threshold: 0.40,
                max_threshold: 0.90,
            },
            ..Default::default()
        };
        let m = SpeculationManager::new(config);
        assert_eq!(m.current_threshold(), 0.70);
        // A run of misses pushes the gate up.
        for _ in 0..30 {
            m.record_outcome(&outcome("t", false, 5), None);
        }
        assert!(m.current_threshold() > 0.70);
    }
}
