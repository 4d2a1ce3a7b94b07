//! Emergence metrics: entropy, stability, diversity, phase transitions.
//!
//! All metric functions are deterministic for a given snapshot and
//! side-effect free. The [`EmergenceTracker`] adds the stateful pieces —
//! the previous community assignment for Jaccard stability and the entropy
//! history for phase-transition detection — without touching the graph.
//!
//! Entropy and diversity run in `O(|V| + |E|)` plus the eigensolve on the
//! (small) Laplacian; Jaccard stability is `O(|V|²)` over node pairs.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::error::MathError;
use crate::graph::GraphSnapshot;
use crate::math::eigen::{DEFAULT_MAX_SWEEPS, DEFAULT_TOL};
use crate::math::{Matrix, sym_eigenvalues};

/// Moving-average window for phase-transition detection.
pub const PHASE_WINDOW: usize = 5;

/// Two adjacent window averages further apart than this flag a transition.
pub const PHASE_DELTA: f32 = 0.2;

/// A hyperedge handed to the entropy operator: a capability viewed as a
/// weighted set of members.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hyperedge {
    pub id: String,
    pub members: Vec<String>,
    pub weight: f32,
}

/// Phase verdict from the entropy history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Stable,
    /// Entropy rising: the graph is growing new structure.
    Expansion,
    /// Entropy falling: structure is collapsing into fewer clusters.
    Consolidation,
}

/// Direction of a metric over its recent history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    Rising,
    Falling,
    Flat,
}

/// One full metrics evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmergenceReport {
    /// Von-Neumann entropy of the (hyperedge-augmented) normalized Laplacian.
    pub tensor_entropy: f32,
    /// Shannon entropy of the degree distribution, normalized by `log2(n)`.
    pub structural_entropy: f32,
    /// Jaccard similarity of the community assignment vs the previous call.
    pub cluster_stability: f32,
    /// Shannon entropy of the community-size distribution, normalized.
    pub capability_diversity: f32,
    /// Phase verdict over the entropy history.
    pub phase: Phase,
    /// Size-adjusted entropy ceiling `log2(n)` for this snapshot.
    pub max_entropy: f32,
}

// ---------------------------------------------------------------------------
// Von-Neumann entropy
// ---------------------------------------------------------------------------

/// Von-Neumann entropy of the snapshot's symmetric normalized Laplacian.
///
/// Pairwise edges contribute their weight symmetrically; each hyperedge
/// spreads `weight / |members|` over every member pair (star-expansion
/// weighting), so adding a hyperedge strictly adds off-diagonal mass and
/// the metric is monotone in hyperedge count. The spectrum is clipped to
/// the non-negative eigen-space and normalized into a distribution
/// `p_i = λ_i / Σλ`; the result is `-Σ p_i log2 p_i`.
pub fn von_neumann_entropy(
    snapshot: &GraphSnapshot,
    hyperedges: &[Hyperedge],
) -> Result<f32, MathError> {
    let n = snapshot.nodes.len();
    if n < 2 {
        return Ok(0.0);
    }
    let index: HashMap<&str, usize> = snapshot
        .nodes
        .iter()
        .enumerate()
        .map(|(i, node)| (node.id.as_str(), i))
        .collect();

    // Symmetric weighted adjacency.
    let mut adj = Matrix::zeros(n, n);
    for edge in &snapshot.edges {
        let (Some(&i), Some(&j)) = (index.get(edge.source.as_str()), index.get(edge.target.as_str()))
        else {
            continue;
        };
        if i == j {
            continue;
        }
        let w = edge.confidence.max(0.0);
        adj.set(i, j, adj.get(i, j) + w);
        adj.set(j, i, adj.get(j, i) + w);
    }
    for he in hyperedges {
        if he.members.len() < 2 {
            continue;
        }
        let share = he.weight.max(0.0) / he.members.len() as f32;
        for (a_pos, a) in he.members.iter().enumerate() {
            for b in he.members.iter().skip(a_pos + 1) {
                let (Some(&i), Some(&j)) = (index.get(a.as_str()), index.get(b.as_str())) else {
                    continue;
                };
                if i == j {
                    continue;
                }
                adj.set(i, j, adj.get(i, j) + share);
                adj.set(j, i, adj.get(j, i) + share);
            }
        }
    }

    // L_sym = I − D^{-1/2} A D^{-1/2}, isolated nodes left as zero rows.
    let degrees: Vec<f32> = (0..n).map(|i| adj.row(i).iter().sum()).collect();
    let mut lap = Matrix::zeros(n, n);
    for i in 0..n {
        if degrees[i] <= 0.0 {
            continue;
        }
        lap.set(i, i, 1.0);
        for j in 0..n {
            if i != j && degrees[j] > 0.0 {
                let norm = adj.get(i, j) / (degrees[i].sqrt() * degrees[j].sqrt());
                lap.set(i, j, -norm);
            }
        }
    }

    let eig = sym_eigenvalues(&lap, DEFAULT_MAX_SWEEPS, DEFAULT_TOL)?;
    Ok(spectrum_entropy(&eig))
}

/// Shannon entropy of the non-negative part of a spectrum, in bits.
fn spectrum_entropy(eigenvalues: &[f32]) -> f32 {
    let total: f32 = eigenvalues.iter().filter(|v| **v > 0.0).sum();
    if total <= 0.0 {
        return 0.0;
    }
    -eigenvalues
        .iter()
        .filter(|v| **v > 0.0)
        .map(|v| {
            let p = v / total;
            p * p.log2()
        })
        .sum::<f32>()
}

// ---------------------------------------------------------------------------
// Structural entropy & diversity
// ---------------------------------------------------------------------------

/// Shannon entropy of the degree distribution, normalized by `log2(n)`.
///
/// 1.0 means perfectly even degrees (every node equally connected); 0.0 a
/// degenerate hub-only graph or fewer than two nodes.
pub fn structural_entropy(snapshot: &GraphSnapshot) -> f32 {
    let n = snapshot.nodes.len();
    if n < 2 {
        return 0.0;
    }
    let total_degree: f32 = snapshot.nodes.iter().map(|v| v.degree as f32).sum();
    if total_degree <= 0.0 {
        return 0.0;
    }
    let entropy = -snapshot
        .nodes
        .iter()
        .filter(|v| v.degree > 0)
        .map(|v| {
            let p = v.degree as f32 / total_degree;
            p * p.log2()
        })
        .sum::<f32>();
    (entropy / (n as f32).log2()).clamp(0.0, 1.0)
}

/// Shannon entropy of the community-size distribution, normalized by the
/// number of communities. One community (or none) yields 0.
pub fn community_diversity(assignment: &HashMap<String, usize>) -> f32 {
    let mut sizes: BTreeMap<usize, usize> = BTreeMap::new();
    for community in assignment.values() {
        *sizes.entry(*community).or_insert(0) += 1;
    }
    let k = sizes.len();
    if k < 2 {
        return 0.0;
    }
    let total = assignment.len() as f32;
    let entropy = -sizes
        .values()
        .map(|size| {
            let p = *size as f32 / total;
            p * p.log2()
        })
        .sum::<f32>();
    (entropy / (k as f32).log2()).clamp(0.0, 1.0)
}

// ---------------------------------------------------------------------------
// Jaccard cluster stability
// ---------------------------------------------------------------------------

/// Jaccard similarity between two community assignments over node pairs.
///
/// Counts pairs co-clustered in both assignments vs pairs co-clustered in
/// either; returns `intersection / union`. With no previous assignment
/// (first call) the result is 1.0. Only nodes present in both assignments
/// participate.
pub fn jaccard_stability(
    current: &HashMap<String, usize>,
    previous: Option<&HashMap<String, usize>>,
) -> f32 {
    let Some(previous) = previous else {
        return 1.0;
    };
    let mut shared: Vec<&String> = current
        .keys()
        .filter(|id| previous.contains_key(*id))
        .collect();
    shared.sort();
    if shared.len() < 2 {
        return 1.0;
    }

    let mut intersection = 0usize;
    let mut union = 0usize;
    for (a_pos, a) in shared.iter().enumerate() {
        for b in shared.iter().skip(a_pos + 1) {
            let now = current[*a] == current[*b];
            let before = previous[*a] == previous[*b];
            if now && before {
                intersection += 1;
            }
            if now || before {
                union += 1;
            }
        }
    }
    if union == 0 {
        return 1.0;
    }
    intersection as f32 / union as f32
}

// ---------------------------------------------------------------------------
// Phase transition
// ---------------------------------------------------------------------------

/// Compare the two most recent [`PHASE_WINDOW`]-point moving averages of the
/// entropy history. A gap above [`PHASE_DELTA`] is a transition.
pub fn detect_phase(history: &[f32]) -> Phase {
    if history.len() < 2 * PHASE_WINDOW {
        return Phase::Stable;
    }
    let recent = &history[history.len() - PHASE_WINDOW..];
    let prior = &history[history.len() - 2 * PHASE_WINDOW..history.len() - PHASE_WINDOW];
    let recent_avg: f32 = recent.iter().sum::<f32>() / PHASE_WINDOW as f32;
    let prior_avg: f32 = prior.iter().sum::<f32>() / PHASE_WINDOW as f32;
    let delta = recent_avg - prior_avg;
    if delta > PHASE_DELTA {
        Phase::Expansion
    } else if delta < -PHASE_DELTA {
        Phase::Consolidation
    } else {
        Phase::Stable
    }
}

/// Direction of the last few points of a metric history.
pub fn trend(history: &[f32]) -> Trend {
    if history.len() < 2 {
        return Trend::Flat;
    }
    let last = history[history.len() - 1];
    let first = history[history.len().saturating_sub(PHASE_WINDOW)];
    let delta = last - first;
    if delta > 0.05 {
        Trend::Rising
    } else if delta < -0.05 {
        Trend::Falling
    } else {
        Trend::Flat
    }
}

// ---------------------------------------------------------------------------
// Tracker
// ---------------------------------------------------------------------------

/// Stateful wrapper: holds the previous community assignment and the entropy
/// history across evaluations. The graph itself is never mutated.
pub struct EmergenceTracker {
    previous_communities: Option<HashMap<String, usize>>,
    entropy_history: Vec<f32>,
    structural_history: Vec<f32>,
    diversity_history: Vec<f32>,
}

impl EmergenceTracker {
    /// Fresh tracker: the first evaluation reports stability 1.0.
    pub fn new() -> Self {
        Self {
            previous_communities: None,
            entropy_history: Vec::new(),
            structural_history: Vec::new(),
            diversity_history: Vec::new(),
        }
    }

    /// Evaluate all metrics for a snapshot and advance the tracker state.
    pub fn observe(
        &mut self,
        snapshot: &GraphSnapshot,
        hyperedges: &[Hyperedge],
    ) -> Result<EmergenceReport, MathError> {
        let communities: HashMap<String, usize> = snapshot
            .nodes
            .iter()
            .map(|node| (node.id.clone(), node.community_id))
            .collect();

        let tensor_entropy = von_neumann_entropy(snapshot, hyperedges)?;
        let structural = structural_entropy(snapshot);
        let stability = jaccard_stability(&communities, self.previous_communities.as_ref());
        let diversity = community_diversity(&communities);

        self.entropy_history.push(tensor_entropy);
        self.structural_history.push(structural);
        self.diversity_history.push(diversity);
        self.previous_communities = Some(communities);

        let n = snapshot.nodes.len().max(1) as f32;
        Ok(EmergenceReport {
            tensor_entropy,
            structural_entropy: structural,
            cluster_stability: stability,
            capability_diversity: diversity,
            phase: detect_phase(&self.entropy_history),
            max_entropy: n.log2(),
        })
    }

    /// Entropy history, oldest first.
    pub fn entropy_history(&self) -> &[f32] {
        &self.entropy_history
    }

    /// Trends for (tensor entropy, structural entropy, diversity).
    pub fn trends(&self) -> (Trend, Trend, Trend) {
        (
            trend(&self.entropy_history),
            trend(&self.structural_history),
            trend(&self.diversity_history),
        )
    }
}

impl Default for EmergenceTracker {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// HTTP payload
// ---------------------------------------------------------------------------

/// Payload shape for `GET /api/metrics/emergence`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmergencePayload {
    pub metrics: EmergenceReport,
    pub trends: PayloadTrends,
    pub phase_transition: Phase,
    pub recommendations: Vec<String>,
}

/// Per-metric trend block of the payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayloadTrends {
    pub tensor_entropy: Trend,
    pub structural_entropy: Trend,
    pub capability_diversity: Trend,
}

/// Assemble the HTTP payload from a report and the tracker's trends.
pub fn assemble_payload(report: EmergenceReport, tracker: &EmergenceTracker) -> EmergencePayload {
    let (te, se, dv) = tracker.trends();
    let mut recommendations = Vec::new();
    match report.phase {
        Phase::Expansion => recommendations
            .push("entropy rising: new tool patterns forming, consider a training run".into()),
        Phase::Consolidation => recommendations.push(
            "entropy falling: patterns consolidating, capability extraction may be productive"
                .into(),
        ),
        Phase::Stable => {}
    }
    if report.cluster_stability < 0.5 {
        recommendations
            .push("community churn is high: emergent capability boundaries are unstable".into());
    }
    if report.capability_diversity < 0.3 && report.max_entropy > 2.0 {
        recommendations
            .push("low diversity: usage is concentrating on a single tool cluster".into());
    }
    EmergencePayload {
        phase_transition: report.phase,
        metrics: report,
        trends: PayloadTrends {
            tensor_entropy: te,
            structural_entropy: se,
            capability_diversity: dv,
        },
        recommendations,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::store::GraphStore;
    use crate::graph::{EdgeType, EdgeUpsert};

    /// Complete graph on `n` tools with unit-weight edges.
    fn complete_snapshot(n: usize) -> GraphSnapshot {
        let store = GraphStore::new();
        let ids: Vec<String> = (0..n).map(|i| format!("t{i}")).collect();
        for id in &ids {
            store.register_tool(id.clone(), None).unwrap();
        }
        for i in 0..n {
            for j in i + 1..n {
                store
                    .add_edge(
                        &ids[i],
                        &ids[j],
                        EdgeUpsert {
                            edge_type: EdgeType::Cooccurrence,
                            source: crate::graph::EdgeSource::Observed,
                            count: 1,
                            weight: Some(1.0),
                        },
                    )
                    .unwrap();
            }
        }
        store.snapshot()
    }

    #[test]
    fn complete_graph_structural_entropy_is_one() {
        let snap = complete_snapshot(5);
        assert!((structural_entropy(&snap) - 1.0).abs() < 1e-4);
    }

    #[test]
    fn complete_graph_von_neumann_entropy() {
        // K5's normalized Laplacian has four equal nonzero eigenvalues, so
        // the spectral distribution is uniform over 4 points: 2 bits.
        let snap = complete_snapshot(5);
        let s = von_neumann_entropy(&snap, &[]).unwrap();
        assert!((s - 2.0).abs() < 1e-3, "got {s}");
    }

    #[test]
    fn hyperedges_increase_entropy_mass() {
        let store = GraphStore::new();
        for id in ["a", "b", "c", "d"] {
            store.register_tool(id, None).unwrap();
        }
        store
            .add_edge("a", "b", EdgeUpsert::observed(EdgeType::Sequence))
            .unwrap();
        let snap = store.snapshot();

        let bare = von_neumann_entropy(&snap, &[]).unwrap();
        let with_hyper = von_neumann_entropy(
            &snap,
            &[Hyperedge {
                id: "cap".into(),
                members: vec!["a".into(), "c".into(), "d".into()],
                weight: 1.0,
            }],
        )
        .unwrap();
        // The hyperedge connects previously isolated nodes: more nonzero
        // spectrum mass, higher entropy.
        assert!(with_hyper > bare);
    }

    #[test]
    fn empty_and_tiny_graphs_are_zero_entropy() {
        let store = GraphStore::new();
        assert_eq!(von_neumann_entropy(&store.snapshot(), &[]).unwrap(), 0.0);
        store.register_tool("only", None).unwrap();
        assert_eq!(von_neumann_entropy(&store.snapshot(), &[]).unwrap(), 0.0);
        assert_eq!(structural_entropy(&store.snapshot()), 0.0);
    }

    #[test]
    fn jaccard_first_call_is_one() {
        let current: HashMap<String, usize> =
            [("a".to_string(), 0), ("b".to_string(), 1)].into();
        assert_eq!(jaccard_stability(&current, None), 1.0);
    }

    #[test]
    fn jaccard_identical_assignments() {
        let assignment: HashMap<String, usize> = [
            ("a".to_string(), 0),
            ("b".to_string(), 0),
            ("c".to_string(), 1),
        ]
        .into();
        assert_eq!(jaccard_stability(&assignment, Some(&assignment)), 1.0);
    }

    #[test]
    fn jaccard_detects_split() {
        let before: HashMap<String, usize> = [
            ("a".to_string(), 0),
            ("b".to_string(), 0),
            ("c".to_string(), 0),
        ]
        .into();
        // c splits off: pair (a,b) survives, (a,c) and (b,c) dissolve.
        let after: HashMap<String, usize> = [
            ("a".to_string(), 0),
            ("b".to_string(), 0),
            ("c".to_string(), 1),
        ]
        .into();
        let stability = jaccard_stability(&after, Some(&before));
        assert!((stability - 1.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn diversity_uniform_communities() {
        let assignment: HashMap<String, usize> = [
            ("a".to_string(), 0),
            ("b".to_string(), 0),
            ("c".to_string(), 1),
            ("d".to_string(), 1),
        ]
        .into();
        assert!((community_diversity(&assignment) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn diversity_single_community_is_zero() {
        let assignment: HashMap<String, usize> =
            [("a".to_string(), 7), ("b".to_string(), 7)].into();
        assert_eq!(community_diversity(&assignment), 0.0);
    }

    #[test]
    fn phase_transition_expansion_and_consolidation() {
        let mut history = vec![0.5; PHASE_WINDOW];
        history.extend(vec![0.9; PHASE_WINDOW]);
        assert_eq!(detect_phase(&history), Phase::Expansion);

        let mut history = vec![0.9; PHASE_WINDOW];
        history.extend(vec![0.5; PHASE_WINDOW]);
        assert_eq!(detect_phase(&history), Phase::Consolidation);

        assert_eq!(detect_phase(&[0.5, 0.52]), Phase::Stable);
    }

    #[test]
    fn tracker_reports_are_stable_for_unchanged_graph() {
        let snap = complete_snapshot(4);
        let mut tracker = EmergenceTracker::new();
        let first = tracker.observe(&snap, &[]).unwrap();
        let second = tracker.observe(&snap, &[]).unwrap();
        assert_eq!(first.tensor_entropy, second.tensor_entropy);
        assert_eq!(second.cluster_stability, 1.0);
        assert_eq!(second.phase, Phase::Stable);
    }
}
