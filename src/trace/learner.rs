//! Execution-trace learner: graph edges from observed runs.
//!
//! Consumes batches of trace events sharing a root workflow and rewrites
//! the graph: `contains` edges for parent/child spans, `sequence` edges for
//! sibling ordering, `cooccurrence` edges for siblings completing under the
//! same parent, and `provides` edges when a span's output fed a sibling.
//!
//! Replaying the same batch is a no-op: batches are fingerprinted and
//! skipped on re-observation, so weights and counts are never applied twice.

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use dashmap::DashSet;

use crate::graph::store::GraphStore;
use crate::graph::{CapabilityOptions, EdgeType, EdgeUpsert, GraphResult, NodeKind};

use super::TraceEvent;

/// Counters returned from one batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LearnReport {
    /// Nodes registered because the trace mentioned them first.
    pub nodes_created: usize,
    /// Edges newly created.
    pub edges_created: usize,
    /// Existing edges whose counts/weights were updated.
    pub edges_updated: usize,
    /// Capability → capability containments worth persisting durably.
    pub capability_dependencies: Vec<(String, String)>,
    /// True when the batch was recognized as a replay and skipped.
    pub replayed: bool,
}

/// Rewrites graph edges from observed trace batches.
pub struct TraceLearner {
    seen_batches: DashSet<u64>,
}

impl TraceLearner {
    /// Create a learner with an empty replay guard.
    pub fn new() -> Self {
        Self {
            seen_batches: DashSet::new(),
        }
    }

    /// Process one batch of events sharing a root workflow.
    ///
    /// Events are consumed in the order received; the learner never
    /// reorders them.
    pub fn process_batch(
        &self,
        store: &GraphStore,
        events: &[TraceEvent],
    ) -> GraphResult<LearnReport> {
        let fingerprint = batch_fingerprint(events);
        if !self.seen_batches.insert(fingerprint) {
            return Ok(LearnReport {
                replayed: true,
                ..Default::default()
            });
        }

        let mut report = LearnReport::default();

        // Pass 1: trace_id → node id from every end event, registering
        // unseen nodes as we go.
        let mut span_nodes: HashMap<String, String> = HashMap::new();
        for event in events {
            match event {
                TraceEvent::ToolEnd { trace_id, tool_id, .. } => {
                    if !store.has_node(tool_id) {
                        store.register_tool(tool_id.clone(), None)?;
                        report.nodes_created += 1;
                    }
                    span_nodes.insert(trace_id.clone(), tool_id.clone());
                }
                TraceEvent::CapabilityEnd {
                    trace_id,
                    capability_id,
                    success,
                    ..
                } => {
                    if !store.has_node(capability_id) {
                        store.register_capability(
                            capability_id.clone(),
                            CapabilityOptions::default(),
                        )?;
                        report.nodes_created += 1;
                    }
                    store.record_capability_outcome(capability_id, *success)?;
                    span_nodes.insert(trace_id.clone(), capability_id.clone());
                }
                _ => {}
            }
        }

        // Pass 2: containment, sibling ordering, co-occurrence, provides.
        // Children are collected per parent in completion order.
        let mut children: HashMap<String, Vec<String>> = HashMap::new();
        for event in events {
            let Some(node_id) = event.node_id() else {
                continue;
            };
            let Some(parent_span) = event.parent_trace_id() else {
                continue;
            };
            let Some(parent_node) = span_nodes.get(parent_span) else {
                continue;
            };
            if parent_node != node_id {
                self.upsert(
                    store,
                    parent_node,
                    node_id,
                    EdgeUpsert::observed(EdgeType::Contains),
                    &mut report,
                )?;
                if store.node_kind(parent_node) == Some(NodeKind::Capability)
                    && store.node_kind(node_id) == Some(NodeKind::Capability)
                {
                    report
                        .capability_dependencies
                        .push((parent_node.clone(), node_id.to_string()));
                }
                children
                    .entry(parent_node.clone())
                    .or_default()
                    .push(node_id.to_string());
            }

            // provides_to names a sibling span whose input this span fed.
            let provides = match event {
                TraceEvent::ToolEnd { provides_to, .. }
                | TraceEvent::CapabilityEnd { provides_to, .. } => provides_to.as_deref(),
                _ => None,
            };
            if let Some(target_span) = provides {
                if let Some(target_node) = span_nodes.get(target_span) {
                    if target_node != node_id {
                        self.upsert(
                            store,
                            node_id,
                            target_node,
                            EdgeUpsert::observed(EdgeType::Provides),
                            &mut report,
                        )?;
                    }
                }
            }
        }

        let mut parent_ids: Vec<&String> = children.keys().collect();
        parent_ids.sort();
        for parent in parent_ids {
            let siblings = &children[parent];
            for pair in siblings.windows(2) {
                if pair[0] != pair[1] {
                    self.upsert(
                        store,
                        &pair[0],
                        &pair[1],
                        EdgeUpsert::observed(EdgeType::Sequence),
                        &mut report,
                    )?;
                }
            }
            for i in 0..siblings.len() {
                for j in i + 1..siblings.len() {
                    if siblings[i] != siblings[j] {
                        self.upsert(
                            store,
                            &siblings[i],
                            &siblings[j],
                            EdgeUpsert::inferred(EdgeType::Cooccurrence),
                            &mut report,
                        )?;
                    }
                }
            }
        }

        report.capability_dependencies.sort();
        report.capability_dependencies.dedup();
        Ok(report)
    }

    fn upsert(
        &self,
        store: &GraphStore,
        from: &str,
        to: &str,
        upsert: EdgeUpsert,
        report: &mut LearnReport,
    ) -> GraphResult<()> {
        let existed = store.get_edge_data(from, to, upsert.edge_type).is_some();
        store.add_edge(from, to, upsert)?;
        if existed {
            report.edges_updated += 1;
        } else {
            report.edges_created += 1;
        }
        Ok(())
    }
}

impl Default for TraceLearner {
    fn default() -> Self {
        Self::new()
    }
}

fn batch_fingerprint(events: &[TraceEvent]) -> u64 {
    let mut hasher = DefaultHasher::new();
    for event in events {
        // The serde rendering covers every field deterministically.
        serde_json::to_string(event)
            .unwrap_or_default()
            .hash(&mut hasher);
    }
    hasher.finish()
}
