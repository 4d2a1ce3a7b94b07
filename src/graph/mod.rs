//! Tool/capability graph: the shared mutable store behind scoring,
//! prediction, and speculation.
//!
//! Tools are vertices; capabilities are hyperedges that contain tools and
//! possibly other capabilities, recursively (a superhypergraph). The flat
//! pairwise view adds typed edges (contains / sequence / provides /
//! cooccurrence) learned from observed traces.
//!
//! - **Store** ([`store::GraphStore`]): petgraph-backed, dual-indexed
//! - **Hierarchy** ([`hierarchy`]): level computation with cycle detection,
//!   multi-level incidence matrices for the attention forward pass

pub mod hierarchy;
pub mod store;

use serde::{Deserialize, Serialize};

use crate::error::GraphError;

/// Result type for graph operations.
pub type GraphResult<T> = std::result::Result<T, GraphError>;

/// An `inferred` edge promotes to `observed` once its count reaches this.
pub const OBSERVED_THRESHOLD: u32 = 3;

/// Multiplicative boost applied to a reinforced (speculation-hit) edge.
pub const REINFORCE_FACTOR: f32 = 1.05;

/// Reinforced edge weights never exceed this.
pub const REINFORCE_CAP: f32 = 0.95;

/// Fresh learned edges (first speculation hit on an unseen pair) start here.
pub const LEARNED_INITIAL_WEIGHT: f32 = 0.5;

// ---------------------------------------------------------------------------
// Edges
// ---------------------------------------------------------------------------

/// Relation type of a typed edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeType {
    /// Parent contains child (capability → member).
    Contains,
    /// Temporal ordering between siblings in a trace.
    Sequence,
    /// One node's output feeds another's input.
    Provides,
    /// Completed together under the same parent.
    Cooccurrence,
}

impl EdgeType {
    /// Base weight before the source modifier is applied.
    pub fn base_weight(self) -> f32 {
        match self {
            EdgeType::Contains => 0.9,
            EdgeType::Sequence => 0.7,
            EdgeType::Provides => 0.8,
            EdgeType::Cooccurrence => 0.6,
        }
    }
}

impl std::fmt::Display for EdgeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EdgeType::Contains => write!(f, "contains"),
            EdgeType::Sequence => write!(f, "sequence"),
            EdgeType::Provides => write!(f, "provides"),
            EdgeType::Cooccurrence => write!(f, "cooccurrence"),
        }
    }
}

/// How an edge came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeSource {
    /// Seen directly in execution traces.
    Observed,
    /// Derived structurally; promotes to observed with enough counts.
    Inferred,
    /// Written back by the speculation feedback loop.
    Learned,
}

impl EdgeSource {
    /// Weight modifier multiplied into the base weight.
    pub fn modifier(self) -> f32 {
        match self {
            EdgeSource::Observed => 1.0,
            EdgeSource::Inferred => 0.7,
            EdgeSource::Learned => 0.85,
        }
    }
}

impl std::fmt::Display for EdgeSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EdgeSource::Observed => write!(f, "observed"),
            EdgeSource::Inferred => write!(f, "inferred"),
            EdgeSource::Learned => write!(f, "learned"),
        }
    }
}

/// Payload stored on every graph edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeData {
    /// Relation type.
    pub edge_type: EdgeType,
    /// Current weight in `[0, 1]`.
    pub weight: f32,
    /// Observation count.
    pub count: u32,
    /// Provenance of the edge.
    pub source: EdgeSource,
    /// Seconds since UNIX epoch of the last update.
    pub last_updated: u64,
}

impl EdgeData {
    /// Fresh edge with the derived weight for its type and source.
    pub fn new(edge_type: EdgeType, source: EdgeSource) -> Self {
        Self {
            edge_type,
            weight: (edge_type.base_weight() * source.modifier()).clamp(0.0, 1.0),
            count: 1,
            source,
            last_updated: now_secs(),
        }
    }
}

/// Upsert parameters for [`store::GraphStore::add_edge`].
#[derive(Debug, Clone)]
pub struct EdgeUpsert {
    /// Relation type (part of the edge key).
    pub edge_type: EdgeType,
    /// Provenance; merged edges keep the stronger source.
    pub source: EdgeSource,
    /// Count contribution (default 1).
    pub count: u32,
    /// Explicit weight override; `None` derives from type and source.
    pub weight: Option<f32>,
}

impl EdgeUpsert {
    /// Observed edge of the given type, count 1, derived weight.
    pub fn observed(edge_type: EdgeType) -> Self {
        Self {
            edge_type,
            source: EdgeSource::Observed,
            count: 1,
            weight: None,
        }
    }

    /// Inferred edge of the given type, count 1, derived weight.
    pub fn inferred(edge_type: EdgeType) -> Self {
        Self {
            edge_type,
            source: EdgeSource::Inferred,
            count: 1,
            weight: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Nodes
// ---------------------------------------------------------------------------

/// Discriminates tool vertices from capability hyperedges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Tool,
    Capability,
}

/// Where a capability definition came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CapabilitySource {
    /// Authored by a person.
    #[default]
    Human,
    /// Surfaced by the emergence detector.
    Emergent,
    /// Synthesized by the learning loop.
    Learned,
}

/// A registered tool (level-0 vertex).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolMeta {
    /// Stable id.
    pub id: String,
    /// Optional embedding of the engine's dimension.
    pub embedding: Option<Vec<f32>>,
    /// MCP server this tool belongs to, if any.
    pub server: Option<String>,
}

/// A registered capability (hyperedge).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityMeta {
    /// Stable id.
    pub id: String,
    /// Display name.
    pub name: Option<String>,
    /// Embedding of the engine's dimension.
    pub embedding: Option<Vec<f32>>,
    /// Ordered member ids (tools and capabilities).
    pub members: Vec<String>,
    /// Hierarchy level; 0 when the capability contains only tools.
    pub level: usize,
    /// Success rate in `[0, 1]`, running average over observed outcomes.
    pub success_rate: f32,
    /// Number of observed executions backing the success rate.
    pub execution_count: u32,
    /// Code snippet consumed by the sandbox.
    pub snippet: Option<String>,
    /// Definition provenance.
    pub source: CapabilitySource,
    /// Parent capability ids (denormalized, rebuilt on hierarchy recompute).
    pub parents: Vec<String>,
    /// Seconds since UNIX epoch of the last observed execution.
    pub last_executed: Option<u64>,
}

/// Options for [`store::GraphStore::register_capability`].
#[derive(Debug, Clone, Default)]
pub struct CapabilityOptions {
    /// Display name.
    pub name: Option<String>,
    /// Embedding of the engine's dimension.
    pub embedding: Option<Vec<f32>>,
    /// Ordered member ids; every id must already be registered.
    pub members: Vec<String>,
    /// Code snippet consumed by the sandbox.
    pub snippet: Option<String>,
    /// Definition provenance.
    pub source: CapabilitySource,
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// One node in a graph snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotNode {
    pub id: String,
    pub label: String,
    pub kind: NodeKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
    pub pagerank: f64,
    pub degree: usize,
    pub community_id: usize,
}

/// One edge in a graph snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotEdge {
    pub source: String,
    pub target: String,
    pub confidence: f32,
    pub count: u32,
    pub edge_type: EdgeType,
    pub edge_source: EdgeSource,
}

/// Snapshot metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub node_count: usize,
    pub edge_count: usize,
    pub density: f64,
    pub max_level: usize,
}

/// Full exportable view of the graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphSnapshot {
    pub nodes: Vec<SnapshotNode>,
    pub edges: Vec<SnapshotEdge>,
    pub metadata: SnapshotMeta,
}

pub(crate) fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Deterministic community id for nodes without an assignment.
///
/// FNV-1a over the id, folded into a small bucket space so that snapshot
/// coloring and the Jaccard stability metric have something stable to chew on.
pub(crate) fn hash_community(id: &str, buckets: usize) -> usize {
    let mut h: u64 = 0xcbf2_9ce4_8422_2325;
    for b in id.as_bytes() {
        h ^= u64::from(*b);
        h = h.wrapping_mul(0x0000_0100_0000_01b3);
    }
    (h % buckets.max(1) as u64) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_weights_follow_table() {
        let e = EdgeData::new(EdgeType::Contains, EdgeSource::Observed);
        assert!((e.weight - 0.9).abs() < 1e-6);
        let e = EdgeData::new(EdgeType::Sequence, EdgeSource::Inferred);
        assert!((e.weight - 0.7 * 0.7).abs() < 1e-6);
        let e = EdgeData::new(EdgeType::Cooccurrence, EdgeSource::Learned);
        assert!((e.weight - 0.6 * 0.85).abs() < 1e-6);
    }

    #[test]
    fn hash_community_is_stable() {
        assert_eq!(hash_community("fs_read", 8), hash_community("fs_read", 8));
        assert!(hash_community("fs_read", 8) < 8);
    }

    #[test]
    fn edge_type_serializes_snake_case() {
        let s = serde_json::to_string(&EdgeType::Cooccurrence).unwrap();
        assert_eq!(s, "\"cooccurrence\"");
    }
}
