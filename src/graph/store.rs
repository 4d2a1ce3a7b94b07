//! In-memory tool/capability graph with dual-indexing.
//!
//! Uses `petgraph` for the edge structure and `DashMap` for fast lookups
//! by node id. All mutations go through `&self` methods; the petgraph is
//! guarded by an `RwLock` so readers never observe a partially applied
//! upsert.

use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;
use petgraph::Direction;
use petgraph::algo::page_rank;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;

use crate::error::GraphError;

use super::hierarchy::{self, HierarchyLevels};
use super::{
    CapabilityMeta, CapabilityOptions, EdgeData, EdgeSource, EdgeType, EdgeUpsert, GraphResult,
    GraphSnapshot, LEARNED_INITIAL_WEIGHT, NodeKind, OBSERVED_THRESHOLD, REINFORCE_CAP,
    REINFORCE_FACTOR, SnapshotEdge, SnapshotMeta, SnapshotNode, ToolMeta, hash_community,
    now_secs,
};

/// Capacity and validation limits for a [`GraphStore`].
#[derive(Debug, Clone)]
pub struct GraphLimits {
    /// Maximum number of nodes (tools + capabilities).
    pub max_nodes: usize,
    /// Maximum number of typed edges.
    pub max_edges: usize,
    /// Expected embedding dimension; `None` disables the check.
    pub embedding_dim: Option<usize>,
}

impl Default for GraphLimits {
    fn default() -> Self {
        Self {
            max_nodes: 100_000,
            max_edges: 1_000_000,
            embedding_dim: None,
        }
    }
}

/// The shared mutable graph store.
///
/// Owns tool and capability nodes and all typed edges. The SHGAT model and
/// the prediction facade hold non-owning views of the adjacency structure.
pub struct GraphStore {
    /// Directed multigraph: node weights are ids, edges carry [`EdgeData`].
    graph: RwLock<DiGraph<String, EdgeData>>,
    /// id → NodeIndex for O(1) lookups.
    node_index: DashMap<String, NodeIndex>,
    /// Tool metadata by id.
    tools: DashMap<String, ToolMeta>,
    /// Capability metadata by id.
    capabilities: DashMap<String, CapabilityMeta>,
    /// Optional community assignment (e.g. from an external Louvain pass).
    communities: DashMap<String, usize>,
    edge_count: AtomicUsize,
    limits: GraphLimits,
}

impl GraphStore {
    /// Create an empty store with default limits.
    pub fn new() -> Self {
        Self::with_limits(GraphLimits::default())
    }

    /// Create an empty store with explicit limits.
    pub fn with_limits(limits: GraphLimits) -> Self {
        Self {
            graph: RwLock::new(DiGraph::new()),
            node_index: DashMap::new(),
            tools: DashMap::new(),
            capabilities: DashMap::new(),
            communities: DashMap::new(),
            edge_count: AtomicUsize::new(0),
            limits,
        }
    }

    // -----------------------------------------------------------------------
    // Registration
    // -----------------------------------------------------------------------

    /// Register a tool. Idempotent: an existing tool keeps its data, but a
    /// provided embedding replaces the stored one (embedding-model upgrades).
    pub fn register_tool(
        &self,
        id: impl Into<String>,
        embedding: Option<Vec<f32>>,
    ) -> GraphResult<()> {
        let id = id.into();
        self.check_embedding(&id, embedding.as_deref())?;

        if let Some(mut existing) = self.tools.get_mut(&id) {
            if embedding.is_some() {
                existing.embedding = embedding;
            }
            return Ok(());
        }

        self.check_node_capacity()?;
        self.ensure_node(&id);
        self.tools.insert(
            id.clone(),
            ToolMeta {
                id,
                embedding,
                server: None,
            },
        );
        Ok(())
    }

    /// Register a tool together with its owning MCP server id.
    pub fn register_tool_with_server(
        &self,
        id: impl Into<String>,
        embedding: Option<Vec<f32>>,
        server: impl Into<String>,
    ) -> GraphResult<()> {
        let id = id.into();
        self.register_tool(id.clone(), embedding)?;
        if let Some(mut t) = self.tools.get_mut(&id) {
            t.server = Some(server.into());
        }
        Ok(())
    }

    /// Register a capability. Idempotent on id; re-registering replaces the
    /// declared members and re-runs the cycle check and level recompute.
    ///
    /// Every member id must already resolve to a tool or capability
    /// ([`GraphError::UnknownNode`]); a membership that would close a
    /// containment cycle fails with [`GraphError::HierarchyCycle`] and
    /// mutates nothing.
    pub fn register_capability(
        &self,
        id: impl Into<String>,
        options: CapabilityOptions,
    ) -> GraphResult<()> {
        let id = id.into();
        self.check_embedding(&id, options.embedding.as_deref())?;

        for member in &options.members {
            if member != &id && !self.has_node(member) {
                return Err(GraphError::UnknownNode { id: member.clone() });
            }
        }

        // Dry-run the cycle check against the would-be membership before
        // touching any state.
        hierarchy::check_acyclic_with(&self.membership_view(), &id, &options.members)?;

        if !self.capabilities.contains_key(&id) {
            self.check_node_capacity()?;
        }
        self.ensure_node(&id);

        let meta = CapabilityMeta {
            id: id.clone(),
            name: options.name,
            embedding: options.embedding,
            members: options.members.clone(),
            level: 0,
            success_rate: 0.0,
            execution_count: 0,
            snippet: options.snippet,
            source: options.source,
            parents: Vec::new(),
            last_executed: None,
        };
        let meta = match self.capabilities.get(&id) {
            Some(prev) => CapabilityMeta {
                success_rate: prev.success_rate,
                execution_count: prev.execution_count,
                last_executed: prev.last_executed,
                ..meta
            },
            None => meta,
        };
        self.capabilities.insert(id.clone(), meta);

        // Declared membership shows up as inferred contains edges; observed
        // traces later promote them.
        for member in &options.members {
            self.add_edge(&id, member, EdgeUpsert::inferred(EdgeType::Contains))?;
        }

        self.recompute_hierarchy()?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Edges
    // -----------------------------------------------------------------------

    /// Upsert a typed edge.
    ///
    /// Merge rules: counts add; an `observed` upsert upgrades the stored
    /// source; an `inferred` edge promotes to `observed` once its count
    /// reaches [`OBSERVED_THRESHOLD`]; the weight is re-derived from the
    /// (possibly promoted) source unless an explicit override is given.
    pub fn add_edge(
        &self,
        from: &str,
        to: &str,
        upsert: EdgeUpsert,
    ) -> GraphResult<EdgeData> {
        let from_idx = self
            .node_index
            .get(from)
            .map(|e| *e.value())
            .ok_or_else(|| GraphError::UnknownNode { id: from.into() })?;
        let to_idx = self
            .node_index
            .get(to)
            .map(|e| *e.value())
            .ok_or_else(|| GraphError::UnknownNode { id: to.into() })?;

        let mut graph = self.graph.write().expect("graph lock poisoned");

        let existing = graph
            .edges_connecting(from_idx, to_idx)
            .find(|e| e.weight().edge_type == upsert.edge_type)
            .map(|e| e.id());

        let data = match existing {
            Some(edge_id) => {
                let edge = graph.edge_weight_mut(edge_id).expect("edge just found");
                edge.count = edge.count.saturating_add(upsert.count.max(1));
                if upsert.source == EdgeSource::Observed {
                    edge.source = EdgeSource::Observed;
                }
                if edge.source == EdgeSource::Inferred && edge.count >= OBSERVED_THRESHOLD {
                    edge.source = EdgeSource::Observed;
                }
                edge.weight = match upsert.weight {
                    Some(w) => w.clamp(0.0, 1.0),
                    None => {
                        (edge.edge_type.base_weight() * edge.source.modifier()).clamp(0.0, 1.0)
                    }
                };
                edge.last_updated = now_secs();
                edge.clone()
            }
            None => {
                if self.edge_count.load(Ordering::Relaxed) >= self.limits.max_edges {
                    return Err(GraphError::GraphFull {
                        kind: "edges",
                        limit: self.limits.max_edges,
                    });
                }
                let mut data = EdgeData::new(upsert.edge_type, upsert.source);
                data.count = upsert.count.max(1);
                if data.source == EdgeSource::Inferred && data.count >= OBSERVED_THRESHOLD {
                    data.source = EdgeSource::Observed;
                    data.weight =
                        (data.edge_type.base_weight() * data.source.modifier()).clamp(0.0, 1.0);
                }
                if let Some(w) = upsert.weight {
                    data.weight = w.clamp(0.0, 1.0);
                }
                graph.add_edge(from_idx, to_idx, data.clone());
                self.edge_count.fetch_add(1, Ordering::Relaxed);
                data
            }
        };
        Ok(data)
    }

    /// Reinforce the sequence edge `from → to` after a speculation hit.
    ///
    /// An existing sequence edge gets `weight = min(0.95, weight · 1.05)`;
    /// a missing one is created as `learned` at weight 0.5.
    pub fn reinforce(&self, from: &str, to: &str) -> GraphResult<EdgeData> {
        let from_idx = self
            .node_index
            .get(from)
            .map(|e| *e.value())
            .ok_or_else(|| GraphError::UnknownNode { id: from.into() })?;
        let to_idx = self
            .node_index
            .get(to)
            .map(|e| *e.value())
            .ok_or_else(|| GraphError::UnknownNode { id: to.into() })?;

        let mut graph = self.graph.write().expect("graph lock poisoned");
        let existing = graph
            .edges_connecting(from_idx, to_idx)
            .find(|e| e.weight().edge_type == EdgeType::Sequence)
            .map(|e| e.id());

        match existing {
            Some(edge_id) => {
                let edge = graph.edge_weight_mut(edge_id).expect("edge just found");
                edge.weight = (edge.weight * REINFORCE_FACTOR).min(REINFORCE_CAP);
                edge.count = edge.count.saturating_add(1);
                edge.last_updated = now_secs();
                Ok(edge.clone())
            }
            None => {
                if self.edge_count.load(Ordering::Relaxed) >= self.limits.max_edges {
                    return Err(GraphError::GraphFull {
                        kind: "edges",
                        limit: self.limits.max_edges,
                    });
                }
                let data = EdgeData {
                    edge_type: EdgeType::Sequence,
                    weight: LEARNED_INITIAL_WEIGHT,
                    count: 1,
                    source: EdgeSource::Learned,
                    last_updated: now_secs(),
                };
                graph.add_edge(from_idx, to_idx, data.clone());
                self.edge_count.fetch_add(1, Ordering::Relaxed);
                Ok(data)
            }
        }
    }

    /// Edge data for a specific `(from, to, type)` key.
    pub fn get_edge_data(&self, from: &str, to: &str, edge_type: EdgeType) -> Option<EdgeData> {
        let from_idx = *self.node_index.get(from)?.value();
        let to_idx = *self.node_index.get(to)?.value();
        let graph = self.graph.read().expect("graph lock poisoned");
        graph
            .edges_connecting(from_idx, to_idx)
            .find(|e| e.weight().edge_type == edge_type)
            .map(|e| e.weight().clone())
    }

    /// All typed edges between a pair of nodes.
    pub fn edges_between(&self, from: &str, to: &str) -> Vec<EdgeData> {
        let (Some(from_idx), Some(to_idx)) = (
            self.node_index.get(from).map(|e| *e.value()),
            self.node_index.get(to).map(|e| *e.value()),
        ) else {
            return Vec::new();
        };
        let graph = self.graph.read().expect("graph lock poisoned");
        graph
            .edges_connecting(from_idx, to_idx)
            .map(|e| e.weight().clone())
            .collect()
    }

    /// Whether any typed edge connects `from → to`.
    pub fn has_edge(&self, from: &str, to: &str) -> bool {
        !self.edges_between(from, to).is_empty()
    }

    /// Outgoing neighbors with their edge payloads, weight-descending.
    pub fn neighbors(&self, id: &str) -> Vec<(String, EdgeData)> {
        let Some(idx) = self.node_index.get(id).map(|e| *e.value()) else {
            return Vec::new();
        };
        let graph = self.graph.read().expect("graph lock poisoned");
        let mut out: Vec<(String, EdgeData)> = graph
            .edges_directed(idx, Direction::Outgoing)
            .filter_map(|e| {
                let target = graph.node_weight(e.target())?.clone();
                Some((target, e.weight().clone()))
            })
            .collect();
        out.sort_by(|a, b| {
            b.1.weight
                .partial_cmp(&a.1.weight)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        out
    }

    // -----------------------------------------------------------------------
    // Node accessors
    // -----------------------------------------------------------------------

    /// Whether the id resolves to a registered node.
    pub fn has_node(&self, id: &str) -> bool {
        self.node_index.contains_key(id)
    }

    /// Kind of a registered node.
    pub fn node_kind(&self, id: &str) -> Option<NodeKind> {
        if self.tools.contains_key(id) {
            Some(NodeKind::Tool)
        } else if self.capabilities.contains_key(id) {
            Some(NodeKind::Capability)
        } else {
            None
        }
    }

    /// Tool metadata by id.
    pub fn tool(&self, id: &str) -> Option<ToolMeta> {
        self.tools.get(id).map(|t| t.value().clone())
    }

    /// Capability metadata by id.
    pub fn capability(&self, id: &str) -> Option<CapabilityMeta> {
        self.capabilities.get(id).map(|c| c.value().clone())
    }

    /// All tool ids, sorted.
    pub fn tool_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.tools.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// All capability ids, sorted.
    pub fn capability_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.capabilities.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Number of nodes.
    pub fn node_count(&self) -> usize {
        self.node_index.len()
    }

    /// Number of typed edges.
    pub fn edge_count(&self) -> usize {
        self.edge_count.load(Ordering::Relaxed)
    }

    /// Directed density: `|E| / (|V| · (|V|−1))`.
    pub fn get_graph_density(&self) -> f64 {
        let n = self.node_count();
        if n < 2 {
            return 0.0;
        }
        self.edge_count() as f64 / (n as f64 * (n as f64 - 1.0))
    }

    /// Replace a tool's embedding.
    pub fn set_tool_embedding(&self, id: &str, embedding: Vec<f32>) -> GraphResult<()> {
        self.check_embedding(id, Some(&embedding))?;
        let mut t = self
            .tools
            .get_mut(id)
            .ok_or_else(|| GraphError::UnknownNode { id: id.into() })?;
        t.embedding = Some(embedding);
        Ok(())
    }

    /// Update a capability's running success rate after an observed run.
    pub fn record_capability_outcome(&self, id: &str, success: bool) -> GraphResult<()> {
        let mut c = self
            .capabilities
            .get_mut(id)
            .ok_or_else(|| GraphError::UnknownNode { id: id.into() })?;
        let n = c.execution_count as f32;
        let outcome = if success { 1.0 } else { 0.0 };
        c.success_rate = (c.success_rate * n + outcome) / (n + 1.0);
        c.execution_count += 1;
        c.last_executed = Some(now_secs());
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Hierarchy
    // -----------------------------------------------------------------------

    /// Recompute hierarchy levels and parent pointers for all capabilities.
    ///
    /// Fails with [`GraphError::HierarchyCycle`] on a containment cycle and
    /// leaves stored levels untouched in that case.
    pub fn recompute_hierarchy(&self) -> GraphResult<HierarchyLevels> {
        let levels = hierarchy::compute_hierarchy_levels(&self.membership_view())?;

        let mut parents: HashMap<String, Vec<String>> = HashMap::new();
        for entry in self.capabilities.iter() {
            for member in &entry.value().members {
                if self.capabilities.contains_key(member) {
                    parents.entry(member.clone()).or_default().push(entry.key().clone());
                }
            }
        }
        for mut entry in self.capabilities.iter_mut() {
            let id = entry.key().clone();
            if let Some(level) = levels.levels.get(&id) {
                entry.value_mut().level = *level;
            }
            let mut ps = parents.remove(&id).unwrap_or_default();
            ps.sort();
            entry.value_mut().parents = ps;
        }
        Ok(levels)
    }

    /// Capability id → member ids, the view hierarchy computations run on.
    pub(crate) fn membership_view(&self) -> HashMap<String, Vec<String>> {
        self.capabilities
            .iter()
            .map(|e| (e.key().clone(), e.value().members.clone()))
            .collect()
    }

    /// Highest capability level currently assigned.
    pub fn max_level(&self) -> usize {
        self.capabilities
            .iter()
            .map(|e| e.value().level)
            .max()
            .unwrap_or(0)
    }

    // -----------------------------------------------------------------------
    // Communities & snapshot
    // -----------------------------------------------------------------------

    /// Attach an external community assignment (replaces the previous one).
    pub fn set_communities(&self, assignment: HashMap<String, usize>) {
        self.communities.clear();
        for (id, c) in assignment {
            self.communities.insert(id, c);
        }
    }

    /// Community id for a node: the attached assignment, or a deterministic
    /// hash bucket when none is attached.
    pub fn community_of(&self, id: &str) -> usize {
        self.communities
            .get(id)
            .map(|e| *e.value())
            .unwrap_or_else(|| hash_community(id, 16))
    }

    /// Export a full snapshot: nodes with pagerank/degree/community, typed
    /// edges, and metadata.
    pub fn snapshot(&self) -> GraphSnapshot {
        let graph = self.graph.read().expect("graph lock poisoned");

        let ranks = if graph.node_count() > 0 {
            page_rank(&*graph, 0.85_f64, 20)
        } else {
            Vec::new()
        };

        let mut nodes: Vec<SnapshotNode> = graph
            .node_indices()
            .map(|idx| {
                let id = graph[idx].clone();
                let degree = graph.edges_directed(idx, Direction::Outgoing).count()
                    + graph.edges_directed(idx, Direction::Incoming).count();
                let (kind, label, server) = match self.tools.get(&id) {
                    Some(t) => (NodeKind::Tool, id.clone(), t.server.clone()),
                    None => {
                        let label = self
                            .capabilities
                            .get(&id)
                            .and_then(|c| c.name.clone())
                            .unwrap_or_else(|| id.clone());
                        (NodeKind::Capability, label, None)
                    }
                };
                SnapshotNode {
                    community_id: self.community_of(&id),
                    pagerank: ranks.get(idx.index()).copied().unwrap_or(0.0),
                    degree,
                    id,
                    label,
                    kind,
                    server,
                }
            })
            .collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));

        let mut edges: Vec<SnapshotEdge> = graph
            .edge_references()
            .filter_map(|e| {
                let source = graph.node_weight(e.source())?.clone();
                let target = graph.node_weight(e.target())?.clone();
                let w = e.weight();
                Some(SnapshotEdge {
                    source,
                    target,
                    confidence: w.weight,
                    count: w.count,
                    edge_type: w.edge_type,
                    edge_source: w.source,
                })
            })
            .collect();
        edges.sort_by(|a, b| (&a.source, &a.target).cmp(&(&b.source, &b.target)));

        let metadata = SnapshotMeta {
            node_count: graph.node_count(),
            edge_count: graph.edge_count(),
            density: self.get_graph_density(),
            max_level: self.max_level(),
        };
        drop(graph);

        GraphSnapshot {
            nodes,
            edges,
            metadata,
        }
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn ensure_node(&self, id: &str) -> NodeIndex {
        if let Some(idx) = self.node_index.get(id) {
            return *idx.value();
        }
        let mut graph = self.graph.write().expect("graph lock poisoned");
        // Double-check after acquiring write lock
        if let Some(idx) = self.node_index.get(id) {
            return *idx.value();
        }
        let idx = graph.add_node(id.to_string());
        self.node_index.insert(id.to_string(), idx);
        idx
    }

    fn check_node_capacity(&self) -> GraphResult<()> {
        if self.node_index.len() >= self.limits.max_nodes {
            return Err(GraphError::GraphFull {
                kind: "nodes",
                limit: self.limits.max_nodes,
            });
        }
        Ok(())
    }

    fn check_embedding(&self, id: &str, embedding: Option<&[f32]>) -> GraphResult<()> {
        if let (Some(expected), Some(emb)) = (self.limits.embedding_dim, embedding) {
            if emb.len() != expected {
                return Err(GraphError::DimensionMismatch {
                    id: id.into(),
                    expected,
                    actual: emb.len(),
                });
            }
        }
        Ok(())
    }
}

impl Default for GraphStore {
    fn default() -> Self {
        Self::new()
    }
}
