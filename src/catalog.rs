//! Capability catalog: context search and sandbox bindings over the graph.
//!
//! A read-side companion to the graph store: it resolves capability
//! membership down to concrete tool sets (through nested capabilities),
//! ranks capabilities against a running tool context by set overlap, and
//! assembles the snippet map the sandbox binds as `capabilities.*`.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

use crate::graph::NodeKind;
use crate::graph::store::GraphStore;

/// Guard against pathological nesting when flattening membership.
const FLATTEN_DEPTH: usize = 16;

/// One capability matched against a tool context.
#[derive(Debug, Clone, PartialEq)]
pub struct ContextMatch {
    pub capability_id: String,
    /// Jaccard overlap between the capability's tool set and the context.
    pub overlap: f32,
    /// The capability's flattened tool set.
    pub tools: Vec<String>,
    /// Historical success rate carried from the graph.
    pub success_rate: f32,
}

/// Read-side view of the registered capabilities.
pub struct CapabilityStore {
    graph: Arc<GraphStore>,
}

impl CapabilityStore {
    pub fn new(graph: Arc<GraphStore>) -> Self {
        Self { graph }
    }

    /// The flattened tool membership of a capability: direct tool members
    /// plus the tools of nested capabilities.
    pub fn tool_members(&self, capability_id: &str) -> Vec<String> {
        let mut tools = BTreeSet::new();
        let mut queue = VecDeque::from([(capability_id.to_string(), 0usize)]);
        let mut seen = BTreeSet::new();
        while let Some((id, depth)) = queue.pop_front() {
            if depth > FLATTEN_DEPTH || !seen.insert(id.clone()) {
                continue;
            }
            let Some(cap) = self.graph.capability(&id) else {
                continue;
            };
            for member in cap.members {
                match self.graph.node_kind(&member) {
                    Some(NodeKind::Tool) => {
                        tools.insert(member);
                    }
                    Some(NodeKind::Capability) => queue.push_back((member, depth + 1)),
                    None => {}
                }
            }
        }
        tools.into_iter().collect()
    }

    /// Rank capabilities by Jaccard overlap with the running context.
    ///
    /// Only capabilities sharing at least one tool with the context are
    /// returned, best overlap first; ties break by id for determinism.
    pub fn search_by_context(&self, context_tools: &[String]) -> Vec<ContextMatch> {
        let context: BTreeSet<&str> = context_tools.iter().map(String::as_str).collect();
        if context.is_empty() {
            return Vec::new();
        }
        let mut matches = Vec::new();
        for id in self.graph.capability_ids() {
            let tools = self.tool_members(&id);
            if tools.is_empty() {
                continue;
            }
            let member_set: BTreeSet<&str> = tools.iter().map(String::as_str).collect();
            let intersection = member_set.intersection(&context).count();
            if intersection == 0 {
                continue;
            }
            let union = member_set.union(&context).count();
            let success_rate = self
                .graph
                .capability(&id)
                .map(|c| c.success_rate)
                .unwrap_or(0.0);
            matches.push(ContextMatch {
                capability_id: id,
                overlap: intersection as f32 / union as f32,
                tools,
                success_rate,
            });
        }
        matches.sort_by(|a, b| {
            b.overlap
                .partial_cmp(&a.overlap)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.capability_id.cmp(&b.capability_id))
        });
        matches
    }

    /// Snippet bindings for the sandbox: capability name → code.
    pub fn snippets(&self) -> HashMap<String, String> {
        self.graph
            .capability_ids()
            .into_iter()
            .filter_map(|id| {
                let cap = self.graph.capability(&id)?;
                Some((id, cap.snippet?))
            })
            .collect()
    }
}
