//! SHGAT: superhypergraph attention over the tool/capability graph.
//!
//! Tools are vertices; capabilities are hyperedges that may contain other
//! capabilities, nested to `L_max` levels. A forward pass runs, per layer:
//!
//! 1. **V→E** — tools message the capabilities that contain them, per level
//! 2. **E→E up** — capability members message their owners, bottom-up
//! 3. **E→E down** — owners message their members, top-down
//! 4. **E→V** — level-0 capabilities message their tools back
//!
//! The output embeddings feed the K-head intent scorer ([`scorer`]); the
//! trainer ([`trainer`]) backpropagates through the whole stack using the
//! cached activations from [`message_passing`].

pub mod message_passing;
pub mod params;
pub mod replay;
pub mod scorer;
pub mod trainer;

use std::sync::Arc;

use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use crate::embed::{Embedder, HashEmbedder};
use crate::graph::GraphResult;
use crate::graph::hierarchy::MultiLevelIncidence;
use crate::graph::store::GraphStore;
use crate::math::{MatKernel, MathResult, Matrix};

use message_passing::{
    PhaseCache, PhaseGrads, PhaseIncidence, apply_phase_sgd, phase_backward, phase_forward,
};
use params::ShgatParams;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Model and trainer hyperparameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShgatConfig {
    /// Embedding dimension `D` (model-defined; tests use small values).
    pub embedding_dim: usize,
    /// Attention/scoring dimension `d`.
    pub scoring_dim: usize,
    /// Attention heads `K`.
    pub num_heads: usize,
    /// Message-passing layers.
    pub num_layers: usize,
    /// Dropout probability during training.
    pub dropout: f32,
    /// Negative slope of the attention leaky-ReLU.
    pub leaky_slope: f32,
    /// SGD learning rate.
    pub learning_rate: f32,
    /// Gradient-norm clip threshold.
    pub grad_clip: f32,
    /// Negatives per positive in the training loss.
    pub num_negatives: usize,
    /// PER priority exponent α.
    pub per_alpha: f32,
    /// PER importance-sampling β at epoch 0 (annealed to `per_beta_end`).
    pub per_beta_start: f32,
    /// PER β at the final epoch.
    pub per_beta_end: f32,
    /// PER priority floor ε.
    pub per_epsilon: f32,
    /// Handcrafted per-candidate stats fed to the fusion MLP.
    pub fusion_features: usize,
    /// Fusion MLP hidden width.
    pub fusion_hidden: usize,
    /// Seed for parameter init, dropout, and sampling.
    pub seed: u64,
}

impl Default for ShgatConfig {
    fn default() -> Self {
        Self {
            embedding_dim: 1024,
            scoring_dim: 64,
            num_heads: 4,
            num_layers: 1,
            dropout: 0.1,
            leaky_slope: 0.2,
            learning_rate: 0.01,
            grad_clip: 5.0,
            num_negatives: 4,
            per_alpha: 0.6,
            per_beta_start: 0.4,
            per_beta_end: 1.0,
            per_epsilon: 0.01,
            fusion_features: 4,
            fusion_hidden: 8,
            seed: 42,
        }
    }
}

// ---------------------------------------------------------------------------
// Training example
// ---------------------------------------------------------------------------

/// One supervised example: did `candidate_id` satisfy the intent?
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingExample {
    pub intent_embedding: Vec<f32>,
    #[serde(default)]
    pub context_tools: Vec<String>,
    pub candidate_id: String,
    /// 1 = the candidate satisfied the intent.
    pub outcome: u8,
    /// Explicit negatives; used verbatim when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub negative_candidates: Option<Vec<String>>,
    /// All negatives sorted descending by similarity; enables the
    /// curriculum sampler.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub all_negatives_sorted_by_similarity: Option<Vec<String>>,
}

// ---------------------------------------------------------------------------
// Graph features
// ---------------------------------------------------------------------------

/// Dense inputs for one forward pass, assembled from the graph store.
///
/// A non-owning snapshot: the store can keep mutating while a forward runs
/// on this copy.
pub struct GraphFeatures {
    pub incidence: MultiLevelIncidence,
    /// `|V| × D` initial tool features.
    pub tools: Matrix,
    /// Per level: `|C_ℓ| × D` initial capability features.
    pub caps: Vec<Matrix>,
}

impl GraphFeatures {
    /// Assemble features from the store, filling missing embeddings with the
    /// deterministic hash fallback.
    pub fn from_store(store: &GraphStore, dim: usize) -> GraphResult<Self> {
        let incidence = store.build_multi_level_incidence()?;
        let fallback = HashEmbedder::new(dim);

        let mut tools = Matrix::zeros(incidence.tool_ids.len(), dim);
        for (row, id) in incidence.tool_ids.iter().enumerate() {
            let embedding = store
                .tool(id)
                .and_then(|t| t.embedding)
                .filter(|e| e.len() == dim)
                .unwrap_or_else(|| fallback.embed(id));
            tools.row_mut(row).copy_from_slice(&embedding);
        }

        let mut caps = Vec::with_capacity(incidence.caps_by_level.len());
        for group in &incidence.caps_by_level {
            let mut m = Matrix::zeros(group.len(), dim);
            for (row, id) in group.iter().enumerate() {
                let embedding = store
                    .capability(id)
                    .and_then(|c| c.embedding)
                    .filter(|e| e.len() == dim)
                    .unwrap_or_else(|| fallback.embed(id));
                m.row_mut(row).copy_from_slice(&embedding);
            }
            caps.push(m);
        }

        Ok(Self {
            incidence,
            tools,
            caps,
        })
    }
}

// ---------------------------------------------------------------------------
// Forward output & trace
// ---------------------------------------------------------------------------

/// Final embeddings from a forward pass.
pub struct ForwardOutput {
    /// `|V| × D` tool embeddings (`H_out`).
    pub tools: Matrix,
    /// Per level: capability embeddings (`E_out^ℓ`).
    pub caps: Vec<Matrix>,
}

impl ForwardOutput {
    /// Embedding of a capability by id.
    pub fn capability_embedding<'o>(
        &'o self,
        incidence: &MultiLevelIncidence,
        id: &str,
    ) -> Option<&'o [f32]> {
        for (level, index) in incidence.cap_index_by_level.iter().enumerate() {
            if let Some(&row) = index.get(id) {
                return Some(self.caps[level].row(row));
            }
        }
        None
    }

    /// Embedding of a tool by id.
    pub fn tool_embedding<'o>(
        &'o self,
        incidence: &MultiLevelIncidence,
        id: &str,
    ) -> Option<&'o [f32]> {
        incidence.tool_index.get(id).map(|&row| self.tools.row(row))
    }
}

/// One recorded phase application: enough state to run its backward.
struct PhaseApp {
    cache: PhaseCache,
    src: Matrix,
    tgt: Matrix,
    incidence: PhaseIncidence,
}

/// Per-layer record of every phase application, in forward order.
struct LayerTrace {
    v2e: Vec<Option<PhaseApp>>,
    up: Vec<Option<PhaseApp>>,
    /// Down passes store the gather map of member rows next to the app.
    down: Vec<Option<(PhaseApp, Vec<(usize, usize)>)>>,
    /// Up passes share the same gather map layout.
    up_gathers: Vec<Vec<(usize, usize)>>,
    e2v: Option<PhaseApp>,
}

/// Activation record for a whole forward pass (training mode only).
pub struct ForwardTrace {
    layers: Vec<LayerTrace>,
}

/// Gradients for the full parameter block.
pub struct ShgatGrads {
    layers: Vec<LayerGrads>,
}

struct LayerGrads {
    v2e: Vec<PhaseGrads>,
    up: Vec<PhaseGrads>,
    down: Vec<PhaseGrads>,
    e2v: PhaseGrads,
}

impl ShgatGrads {
    fn zeros_like(params: &ShgatParams) -> Self {
        Self {
            layers: params
                .layers
                .iter()
                .map(|layer| LayerGrads {
                    v2e: layer.v2e.iter().map(PhaseGrads::zeros_like).collect(),
                    up: layer.up.iter().map(PhaseGrads::zeros_like).collect(),
                    down: layer.down.iter().map(PhaseGrads::zeros_like).collect(),
                    e2v: PhaseGrads::zeros_like(&layer.e2v),
                })
                .collect(),
        }
    }

    /// Squared norm across every phase (for clipping).
    pub fn norm_sq(&self) -> f32 {
        self.layers
            .iter()
            .map(|l| {
                l.v2e.iter().map(PhaseGrads::norm_sq).sum::<f32>()
                    + l.up.iter().map(PhaseGrads::norm_sq).sum::<f32>()
                    + l.down.iter().map(PhaseGrads::norm_sq).sum::<f32>()
                    + l.e2v.norm_sq()
            })
            .sum()
    }

    /// Scale every gradient.
    pub fn scale(&mut self, factor: f32) {
        for layer in &mut self.layers {
            for g in &mut layer.v2e {
                g.scale(factor);
            }
            for g in &mut layer.up {
                g.scale(factor);
            }
            for g in &mut layer.down {
                g.scale(factor);
            }
            layer.e2v.scale(factor);
        }
    }
}

// ---------------------------------------------------------------------------
// Model
// ---------------------------------------------------------------------------

/// The SHGAT model: parameter block plus a math-kernel handle.
///
/// Holds a non-owning view of the graph through [`GraphFeatures`]; the
/// graph store itself is never touched from here.
pub struct ShgatModel {
    pub config: ShgatConfig,
    kernel: Arc<dyn MatKernel>,
    pub params: ShgatParams,
}

impl ShgatModel {
    /// Build a model for a hierarchy of `max_level` levels with seeded
    /// parameter initialization.
    pub fn new(config: ShgatConfig, max_level: usize, kernel: Arc<dyn MatKernel>) -> Self {
        let params = ShgatParams::init(&config, max_level, config.seed);
        Self {
            config,
            kernel,
            params,
        }
    }

    /// The math kernel handle.
    pub fn kernel(&self) -> &Arc<dyn MatKernel> {
        &self.kernel
    }

    /// Evaluation forward pass: deterministic, no dropout, no trace.
    pub fn forward(&self, features: &GraphFeatures) -> MathResult<ForwardOutput> {
        let (out, _) = self.forward_inner(features, None)?;
        Ok(out)
    }

    /// Training forward pass: dropout driven by `rng`, activations traced
    /// for [`Self::backward`].
    pub fn forward_traced(
        &self,
        features: &GraphFeatures,
        rng: &mut StdRng,
    ) -> MathResult<(ForwardOutput, ForwardTrace)> {
        let (out, trace) = self.forward_inner(features, Some(rng))?;
        Ok((out, trace.expect("traced forward always records")))
    }

    fn forward_inner(
        &self,
        features: &GraphFeatures,
        mut rng: Option<&mut StdRng>,
    ) -> MathResult<(ForwardOutput, Option<ForwardTrace>)> {
        let inc = &features.incidence;
        let tracing = rng.is_some();
        let dropout = if tracing { self.config.dropout } else { 0.0 };

        let mut tools = features.tools.clone();
        let mut caps: Vec<Matrix> = features.caps.clone();
        let mut layer_traces = Vec::new();

        for layer in &self.params.layers {
            let mut trace = LayerTrace {
                v2e: Vec::new(),
                up: Vec::new(),
                down: Vec::new(),
                up_gathers: Vec::new(),
                e2v: None,
            };

            // Phase 1: V→E per level.
            for (level, phase) in layer.v2e.iter().enumerate() {
                if caps.get(level).map(|m| m.rows()).unwrap_or(0) == 0 {
                    trace.v2e.push(None);
                    continue;
                }
                let incidence = PhaseIncidence::from_indicator(&inc.tool_to_cap[level]);
                let src = tools.clone();
                let tgt = caps[level].clone();
                let (out, cache) = phase_forward(
                    phase,
                    self.kernel.as_ref(),
                    &src,
                    &tgt,
                    &incidence,
                    self.config.leaky_slope,
                    dropout,
                    rng.as_deref_mut(),
                )?;
                caps[level] = out;
                trace.v2e.push(tracing.then_some(PhaseApp {
                    cache,
                    src,
                    tgt,
                    incidence,
                }));
            }

            // Phase 2: E→E bottom-up.
            for (boundary, phase) in layer.up.iter().enumerate() {
                let Some(li) = inc.cap_to_cap.get(boundary) else {
                    trace.up.push(None);
                    trace.up_gathers.push(Vec::new());
                    continue;
                };
                if li.members.is_empty() || li.owners.is_empty() {
                    trace.up.push(None);
                    trace.up_gathers.push(Vec::new());
                    continue;
                }
                let gather = gather_map(inc, &li.members);
                let src = gather_rows(&caps, &gather, self.config.embedding_dim);
                let tgt = caps[boundary + 1].clone();
                let incidence = PhaseIncidence::from_indicator(&li.matrix);
                let (out, cache) = phase_forward(
                    phase,
                    self.kernel.as_ref(),
                    &src,
                    &tgt,
                    &incidence,
                    self.config.leaky_slope,
                    dropout,
                    rng.as_deref_mut(),
                )?;
                caps[boundary + 1] = out;
                trace.up.push(tracing.then_some(PhaseApp {
                    cache,
                    src,
                    tgt,
                    incidence,
                }));
                trace.up_gathers.push(gather);
            }

            // Phase 3: E→E top-down (mirror).
            for boundary in (0..layer.down.len()).rev() {
                let phase = &layer.down[boundary];
                let Some(li) = inc.cap_to_cap.get(boundary) else {
                    trace.down.push(None);
                    continue;
                };
                if li.members.is_empty() || li.owners.is_empty() {
                    trace.down.push(None);
                    continue;
                }
                let gather = gather_map(inc, &li.members);
                let src = caps[boundary + 1].clone();
                let tgt = gather_rows(&caps, &gather, self.config.embedding_dim);
                // Transpose: every member is targeted by the owners above it.
                let incidence =
                    PhaseIncidence::from_indicator(&li.matrix).transposed(li.members.len());
                let (out, cache) = phase_forward(
                    phase,
                    self.kernel.as_ref(),
                    &src,
                    &tgt,
                    &incidence,
                    self.config.leaky_slope,
                    dropout,
                    rng.as_deref_mut(),
                )?;
                scatter_rows(&mut caps, &gather, &out);
                trace.down.push(tracing.then_some((
                    PhaseApp {
                        cache,
                        src,
                        tgt,
                        incidence,
                    },
                    gather,
                )));
            }
            // Down passes were recorded high-to-low; flip to boundary order.
            trace.down.reverse();

            // Phase 4: E→V from level-0 capabilities.
            if caps.first().map(|m| m.rows()).unwrap_or(0) > 0 && tools.rows() > 0 {
                let incidence = PhaseIncidence::from_indicator(&inc.tool_to_cap[0])
                    .transposed(inc.tool_ids.len());
                let src = caps[0].clone();
                let tgt = tools.clone();
                let (out, cache) = phase_forward(
                    &layer.e2v,
                    self.kernel.as_ref(),
                    &src,
                    &tgt,
                    &incidence,
                    self.config.leaky_slope,
                    dropout,
                    rng.as_deref_mut(),
                )?;
                tools = out;
                trace.e2v = tracing.then_some(PhaseApp {
                    cache,
                    src,
                    tgt,
                    incidence,
                });
            }

            layer_traces.push(trace);
        }

        Ok((
            ForwardOutput { tools, caps },
            tracing.then_some(ForwardTrace {
                layers: layer_traces,
            }),
        ))
    }

    /// Backward pass over a traced forward.
    ///
    /// `d_tools` and `d_caps` are gradients on the final embeddings (from
    /// the scorer); returns accumulated parameter gradients.
    pub fn backward(
        &self,
        trace: &ForwardTrace,
        d_tools: Matrix,
        d_caps: Vec<Matrix>,
    ) -> MathResult<ShgatGrads> {
        let mut grads = ShgatGrads::zeros_like(&self.params);
        let mut d_tools = d_tools;
        let mut d_caps = d_caps;

        for li in (0..self.params.layers.len()).rev() {
            let layer = &self.params.layers[li];
            let layer_trace = &trace.layers[li];
            let layer_grads = &mut grads.layers[li];

            // Phase 4 backward: E→V.
            if let Some(app) = &layer_trace.e2v {
                let d_out = std::mem::replace(&mut d_tools, Matrix::zeros(0, 0));
                let (g, d_src, d_tgt) = phase_backward(
                    &layer.e2v,
                    self.kernel.as_ref(),
                    &app.src,
                    &app.tgt,
                    &app.incidence,
                    &app.cache,
                    &d_out,
                    self.config.leaky_slope,
                )?;
                layer_grads.e2v.accumulate(&g)?;
                d_tools = d_tgt;
                d_caps[0].add_scaled(&d_src, 1.0)?;
            }

            // Phase 3 backward: E→E down, low boundary to high (reverse of
            // the forward's high-to-low sweep).
            for (boundary, slot) in layer_trace.down.iter().enumerate() {
                let Some((app, gather)) = slot else { continue };
                // The phase overwrote the member rows: collect their
                // gradients and clear them before propagating.
                let mut d_out = Matrix::zeros(app.tgt.rows(), app.tgt.cols());
                for (row, (level, level_row)) in gather.iter().enumerate() {
                    d_out
                        .row_mut(row)
                        .copy_from_slice(d_caps[*level].row(*level_row));
                    for v in d_caps[*level].row_mut(*level_row) {
                        *v = 0.0;
                    }
                }
                let (g, d_src, d_tgt) = phase_backward(
                    &layer.down[boundary],
                    self.kernel.as_ref(),
                    &app.src,
                    &app.tgt,
                    &app.incidence,
                    &app.cache,
                    &d_out,
                    self.config.leaky_slope,
                )?;
                layer_grads.down[boundary].accumulate(&g)?;
                d_caps[boundary + 1].add_scaled(&d_src, 1.0)?;
                for (row, (level, level_row)) in gather.iter().enumerate() {
                    let src_row = d_tgt.row(row).to_vec();
                    for (dst, v) in d_caps[*level].row_mut(*level_row).iter_mut().zip(src_row) {
                        *dst += v;
                    }
                }
            }

            // Phase 2 backward: E→E up, high boundary to low.
            for boundary in (0..layer_trace.up.len()).rev() {
                let Some(app) = &layer_trace.up[boundary] else {
                    continue;
                };
                let gather = &layer_trace.up_gathers[boundary];
                let d_out = std::mem::replace(
                    &mut d_caps[boundary + 1],
                    Matrix::zeros(app.tgt.rows(), app.tgt.cols()),
                );
                let (g, d_src, d_tgt) = phase_backward(
                    &layer.up[boundary],
                    self.kernel.as_ref(),
                    &app.src,
                    &app.tgt,
                    &app.incidence,
                    &app.cache,
                    &d_out,
                    self.config.leaky_slope,
                )?;
                layer_grads.up[boundary].accumulate(&g)?;
                d_caps[boundary + 1].add_scaled(&d_tgt, 1.0)?;
                for (row, (level, level_row)) in gather.iter().enumerate() {
                    let src_row = d_src.row(row).to_vec();
                    for (dst, v) in d_caps[*level].row_mut(*level_row).iter_mut().zip(src_row) {
                        *dst += v;
                    }
                }
            }

            // Phase 1 backward: V→E, top level down.
            for level in (0..layer_trace.v2e.len()).rev() {
                let Some(app) = &layer_trace.v2e[level] else {
                    continue;
                };
                let d_out = std::mem::replace(
                    &mut d_caps[level],
                    Matrix::zeros(app.tgt.rows(), app.tgt.cols()),
                );
                let (g, d_src, d_tgt) = phase_backward(
                    &layer.v2e[level],
                    self.kernel.as_ref(),
                    &app.src,
                    &app.tgt,
                    &app.incidence,
                    &app.cache,
                    &d_out,
                    self.config.leaky_slope,
                )?;
                layer_grads.v2e[level].accumulate(&g)?;
                d_caps[level].add_scaled(&d_tgt, 1.0)?;
                d_tools.add_scaled(&d_src, 1.0)?;
            }
        }

        Ok(grads)
    }

    /// Clip by global norm and apply SGD.
    pub fn apply_grads(&mut self, mut grads: ShgatGrads) -> MathResult<()> {
        let norm = grads.norm_sq().sqrt();
        if norm > self.config.grad_clip && norm > 0.0 {
            grads.scale(self.config.grad_clip / norm);
        }
        let lr = self.config.learning_rate;
        for (layer, layer_grads) in self.params.layers.iter_mut().zip(&grads.layers) {
            for (p, g) in layer.v2e.iter_mut().zip(&layer_grads.v2e) {
                apply_phase_sgd(p, g, lr)?;
            }
            for (p, g) in layer.up.iter_mut().zip(&layer_grads.up) {
                apply_phase_sgd(p, g, lr)?;
            }
            for (p, g) in layer.down.iter_mut().zip(&layer_grads.down) {
                apply_phase_sgd(p, g, lr)?;
            }
            apply_phase_sgd(&mut layer.e2v, &layer_grads.e2v, lr)?;
        }
        Ok(())
    }

    /// A seeded RNG for one training run.
    pub fn training_rng(&self) -> StdRng {
        StdRng::seed_from_u64(self.config.seed.wrapping_mul(0x9e37_79b9))
    }
}

/// For each member `(id, level)`, locate its row in the per-level matrices.
fn gather_map(inc: &MultiLevelIncidence, members: &[(String, usize)]) -> Vec<(usize, usize)> {
    members
        .iter()
        .map(|(id, level)| {
            let row = inc.cap_index_by_level[*level]
                .get(id)
                .copied()
                .unwrap_or(0);
            (*level, row)
        })
        .collect()
}

/// Gather member rows from the per-level matrices into one dense matrix.
fn gather_rows(caps: &[Matrix], gather: &[(usize, usize)], dim: usize) -> Matrix {
    let mut out = Matrix::zeros(gather.len(), dim);
    for (row, (level, level_row)) in gather.iter().enumerate() {
        out.row_mut(row).copy_from_slice(caps[*level].row(*level_row));
    }
    out
}

/// Scatter phase outputs back into the per-level matrices.
fn scatter_rows(caps: &mut [Matrix], gather: &[(usize, usize)], out: &Matrix) {
    for (row, (level, level_row)) in gather.iter().enumerate() {
        caps[*level]
            .row_mut(*level_row)
            .copy_from_slice(out.row(row));
    }
}
