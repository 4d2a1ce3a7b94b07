//! Prediction facade: next-node suggestions from the live graph.
//!
//! Composes several signal sources over the shared graph — sequence edges
//! from the last completed tool, co-occurrence with the running context,
//! community affinity, capability context matches — then applies episodic
//! adjustments (boost success-heavy nodes, drop failure-heavy ones),
//! local-alpha trust modulation, and the configured confidence clamp.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::catalog::CapabilityStore;
use crate::graph::store::GraphStore;
use crate::graph::{EdgeSource, EdgeType};
use crate::speculate::Prediction;

/// Where a prediction came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PredictionSource {
    Cooccurrence,
    Community,
    Learned,
    Hint,
    Capability,
}

/// One predicted next node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictedNode {
    pub tool_id: String,
    pub confidence: f32,
    pub reasoning: String,
    pub source: PredictionSource,
}

impl PredictedNode {
    /// View for the speculation gate.
    pub fn to_prediction(&self) -> Prediction {
        Prediction::new(self.tool_id.clone(), self.confidence)
    }
}

/// Facade tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictorConfig {
    /// Lower clamp on emitted confidence.
    pub confidence_floor: f32,
    /// Upper clamp on emitted confidence.
    pub max_confidence: f32,
    /// Trust-in-graph factor: how much edge weight dominates the prior.
    pub local_alpha: f32,
    /// Maximum predictions returned.
    pub max_predictions: usize,
}

impl Default for PredictorConfig {
    fn default() -> Self {
        Self {
            confidence_floor: 0.10,
            max_confidence: 0.95,
            local_alpha: 0.7,
            max_predictions: 5,
        }
    }
}

/// Success-rate thresholds for the episodic adjustments.
const BOOST_SUCCESS_RATE: f32 = 0.7;
const EXCLUDE_FAILURE_RATE: f32 = 0.2;
const EXCLUDE_MIN_RUNS: u32 = 3;
const COMMUNITY_BOOST: f32 = 0.05;

/// Next-node predictor over the shared graph.
pub struct Predictor {
    graph: Arc<GraphStore>,
    catalog: Arc<CapabilityStore>,
    config: PredictorConfig,
}

impl Predictor {
    pub fn new(
        graph: Arc<GraphStore>,
        catalog: Arc<CapabilityStore>,
        config: PredictorConfig,
    ) -> Self {
        Self {
            graph,
            catalog,
            config,
        }
    }

    /// Predict likely next tools given the running context and the
    /// completed task ids, best first.
    pub fn predict_next_nodes(
        &self,
        context_tools: &[String],
        completed_tasks: &[String],
    ) -> Vec<PredictedNode> {
        let mut best: HashMap<String, PredictedNode> = HashMap::new();
        let done: Vec<&str> = context_tools
            .iter()
            .chain(completed_tasks)
            .map(String::as_str)
            .collect();

        // Sequence edges from the most recent tool are the strongest signal.
        if let Some(last) = context_tools.last() {
            let last_community = self.graph.community_of(last);
            for (target, edge) in self.graph.neighbors(last) {
                if edge.edge_type != EdgeType::Sequence && edge.edge_type != EdgeType::Provides {
                    continue;
                }
                let mut confidence = self.modulate(edge.weight);
                let mut reasoning = format!("follows {last} in observed sequences");
                if self.graph.community_of(&target) == last_community {
                    confidence += COMMUNITY_BOOST;
                    reasoning.push_str(" (same cluster)");
                }
                let source = if edge.source == EdgeSource::Learned {
                    PredictionSource::Learned
                } else {
                    PredictionSource::Cooccurrence
                };
                self.offer(&mut best, &done, target, confidence, reasoning, source);
            }
        }

        // Co-occurrence with any context tool.
        for context_tool in context_tools {
            for (target, edge) in self.graph.neighbors(context_tool) {
                if edge.edge_type != EdgeType::Cooccurrence {
                    continue;
                }
                let confidence = self.modulate(edge.weight * 0.8);
                self.offer(
                    &mut best,
                    &done,
                    target,
                    confidence,
                    format!("co-occurs with {context_tool}"),
                    PredictionSource::Cooccurrence,
                );
            }
        }

        // Capability context matches suggest their unexecuted members.
        for matched in self.catalog.search_by_context(context_tools) {
            for tool in &matched.tools {
                let confidence = self.modulate(matched.overlap * 0.9);
                self.offer(
                    &mut best,
                    &done,
                    tool.clone(),
                    confidence,
                    format!(
                        "member of {} ({}% context overlap)",
                        matched.capability_id,
                        (matched.overlap * 100.0) as u32
                    ),
                    PredictionSource::Capability,
                );
            }
        }

        let mut predictions: Vec<PredictedNode> = best
            .into_values()
            .filter_map(|mut p| self.episodic_adjust(&mut p).then_some(p))
            .collect();
        predictions.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.tool_id.cmp(&b.tool_id))
        });
        predictions.truncate(self.config.max_predictions);
        predictions
    }

    /// Local-alpha trust modulation: blend the graph-derived confidence
    /// with a neutral prior.
    fn modulate(&self, graph_confidence: f32) -> f32 {
        self.config.local_alpha * graph_confidence + (1.0 - self.config.local_alpha) * 0.5
    }

    fn offer(
        &self,
        best: &mut HashMap<String, PredictedNode>,
        done: &[&str],
        tool_id: String,
        confidence: f32,
        reasoning: String,
        source: PredictionSource,
    ) {
        if done.contains(&tool_id.as_str()) {
            return;
        }
        let confidence = confidence.clamp(
            self.config.confidence_floor,
            self.config.max_confidence,
        );
        let replace = match best.get(&tool_id) {
            Some(existing) => confidence > existing.confidence,
            None => true,
        };
        if replace {
            best.insert(
                tool_id.clone(),
                PredictedNode {
                    tool_id,
                    confidence,
                    reasoning,
                    source,
                },
            );
        }
    }

    /// Boost success-heavy capabilities' nodes and drop failure-heavy ones.
    /// Returns false when the node should be excluded entirely.
    fn episodic_adjust(&self, prediction: &mut PredictedNode) -> bool {
        if let Some(cap) = self.graph.capability(&prediction.tool_id) {
            if cap.execution_count >= EXCLUDE_MIN_RUNS && cap.success_rate < EXCLUDE_FAILURE_RATE {
                return false;
            }
            if cap.success_rate > BOOST_SUCCESS_RATE {
                prediction.confidence = (prediction.confidence * 1.1).min(self.config.max_confidence);
                prediction.reasoning.push_str(" [reliable]");
            }
        }
        prediction.confidence = prediction
            .confidence
            .clamp(self.config.confidence_floor, self.config.max_confidence);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{CapabilityOptions, EdgeUpsert};

    fn setup() -> (Arc<GraphStore>, Predictor) {
        let graph = Arc::new(GraphStore::new());
        for t in ["a", "b", "c", "d"] {
            graph.register_tool(t, None).unwrap();
        }
        graph
            .add_edge("a", "b", EdgeUpsert::observed(EdgeType::Sequence))
            .unwrap();
        graph
            .add_edge("a", "c", EdgeUpsert::inferred(EdgeType::Cooccurrence))
            .unwrap();
        let catalog = Arc::new(CapabilityStore::new(Arc::clone(&graph)));
        let predictor = Predictor::new(
            Arc::clone(&graph),
            catalog,
            PredictorConfig::default(),
        );
        (graph, predictor)
    }

    #[test]
    fn sequence_edges_drive_predictions() {
        let (_, predictor) = setup();
        let predictions = predictor.predict_next_nodes(&["a".into()], &[]);
        assert!(!predictions.is_empty());
        assert_eq!(predictions[0].tool_id, "b");
        assert!(predictions[0].confidence > 0.5);
    }

    #[test]
    fn executed_tools_are_not_predicted() {
        let (_, predictor) = setup();
        let predictions = predictor.predict_next_nodes(&["a".into()], &["b".into()]);
        assert!(predictions.iter().all(|p| p.tool_id != "b"));
        assert!(predictions.iter().all(|p| p.tool_id != "a"));
    }

    #[test]
    fn confidence_is_clamped_to_configured_band() {
        let (graph, _) = setup();
        let catalog = Arc::new(CapabilityStore::new(Arc::clone(&graph)));
        let predictor = Predictor::new(
            Arc::clone(&graph),
            catalog,
            PredictorConfig {
                confidence_floor: 0.3,
                max_confidence: 0.6,
                ..Default::default()
            },
        );
        for p in predictor.predict_next_nodes(&["a".into()], &[]) {
            assert!(p.confidence >= 0.3 && p.confidence <= 0.6);
        }
    }

    #[test]
    fn capability_members_are_suggested() {
        let (graph, predictor) = setup();
        graph
            .register_capability(
                "flow",
                CapabilityOptions {
                    members: vec!["a".into(), "d".into()],
                    ..Default::default()
                },
            )
            .unwrap();
        let predictions = predictor.predict_next_nodes(&["a".into()], &[]);
        let d = predictions.iter().find(|p| p.tool_id == "d");
        assert!(d.is_some(), "capability member d should be suggested");
        assert_eq!(d.unwrap().source, PredictionSource::Capability);
    }

    #[test]
    fn failure_heavy_capabilities_are_excluded() {
        let (graph, predictor) = setup();
        graph
            .register_capability(
                "flaky",
                CapabilityOptions {
                    members: vec!["a".into()],
                    ..Default::default()
                },
            )
            .unwrap();
        for _ in 0..4 {
            graph.record_capability_outcome("flaky", false).unwrap();
        }
        // Wire a sequence edge a → flaky so it would otherwise be offered.
        graph
            .add_edge("a", "flaky", EdgeUpsert::observed(EdgeType::Sequence))
            .unwrap();
        let predictions = predictor.predict_next_nodes(&["a".into()], &[]);
        assert!(predictions.iter().all(|p| p.tool_id != "flaky"));
    }

    #[test]
    fn predictions_are_ordered_and_capped() {
        let (graph, _) = setup();
        for t in ["e", "f", "g", "h", "i", "j"] {
            graph.register_tool(t, None).unwrap();
            graph
                .add_edge("a", t, EdgeUpsert::observed(EdgeType::Sequence))
                .unwrap();
        }
        let catalog = Arc::new(CapabilityStore::new(Arc::clone(&graph)));
        let predictor = Predictor::new(
            Arc::clone(&graph),
            catalog,
            PredictorConfig {
                max_predictions: 3,
                ..Default::default()
            },
        );
        let predictions = predictor.predict_next_nodes(&["a".into()], &[]);
        assert_eq!(predictions.len(), 3);
        for pair in predictions.windows(2) {
            assert!(pair[0].confidence >= pair[1].confidence);
        }
    }
}
