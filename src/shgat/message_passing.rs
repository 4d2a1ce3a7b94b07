//! Attention phases: the shared machinery behind V→E, E→E, and E→V.
//!
//! Every message-passing step in the network has the same shape: project
//! sources and targets per head, score each incidence pair with a leaky-ReLU
//! attention logit, softmax over each target's sources, aggregate, then run
//! the concatenated heads through dropout, a single linear + ELU block, a
//! residual connection, and layer norm.
//!
//! [`phase_forward`] caches every intermediate needed by [`phase_backward`],
//! which implements exact reverse-mode through the block: layer-norm
//! Jacobian, ELU derivative, dropout mask, softmax Jacobian
//! (`diag(p) − p·pᵀ`), and the leaky-ReLU derivative on the raw logits.
//!
//! Heads within a phase are independent and run concurrently; phases within
//! a layer are strictly sequential.

use rand::rngs::StdRng;
use rayon::prelude::*;

use crate::math::funcs::{elu, elu_derivative};
use crate::math::{
    MatKernel, MathResult, Matrix, dot, leaky_relu, leaky_relu_derivative, softmax,
    softmax_jacobian_vecmul,
};

use super::params::{HeadParams, PhaseParams};

/// Layer-norm epsilon.
const LN_EPS: f32 = 1e-5;

/// Incidence for one phase: for every target row, the source rows that
/// message it.
#[derive(Debug, Clone, Default)]
pub struct PhaseIncidence {
    pub per_target: Vec<Vec<usize>>,
}

impl PhaseIncidence {
    /// Build from an indicator matrix with sources as rows and targets as
    /// columns.
    pub fn from_indicator(indicator: &Matrix) -> Self {
        let mut per_target = vec![Vec::new(); indicator.cols()];
        for s in 0..indicator.rows() {
            let row = indicator.row(s);
            for (t, v) in row.iter().enumerate() {
                if *v != 0.0 {
                    per_target[t].push(s);
                }
            }
        }
        Self { per_target }
    }

    /// Transposed view: sources become targets.
    pub fn transposed(&self, num_sources: usize) -> Self {
        let mut per_target = vec![Vec::new(); num_sources];
        for (t, sources) in self.per_target.iter().enumerate() {
            for s in sources {
                per_target[*s].push(t);
            }
        }
        Self { per_target }
    }
}

// ---------------------------------------------------------------------------
// Caches
// ---------------------------------------------------------------------------

struct HeadCache {
    /// `|S| × d` source projections.
    hs: Matrix,
    /// `|T| × d` target projections.
    et: Matrix,
    /// Per target: raw (pre-leaky) logits, one per source.
    raws: Vec<Vec<f32>>,
    /// Per target: softmax attention weights.
    alphas: Vec<Vec<f32>>,
}

/// Everything the backward pass needs from one phase forward.
pub struct PhaseCache {
    heads: Vec<HeadCache>,
    /// `|T| × (K·d)` concatenated messages, after dropout.
    concat: Matrix,
    /// Dropout keep-mask over `concat` (empty when dropout was off).
    keep_mask: Vec<bool>,
    dropout_scale: f32,
    /// `|T| × D` pre-ELU feed-forward output.
    f: Matrix,
    /// `|T| × D` layer-norm outputs (the phase result).
    y: Matrix,
    /// Per-row `1 / sqrt(var + eps)` from layer norm.
    inv_std: Vec<f32>,
}

/// Accumulated gradients for one phase.
#[derive(Debug, Clone)]
pub struct PhaseGrads {
    pub heads: Vec<HeadGrads>,
    pub w_out: Matrix,
}

/// Per-head gradient block.
#[derive(Debug, Clone)]
pub struct HeadGrads {
    pub w_source: Matrix,
    pub w_target: Matrix,
    pub a: Vec<f32>,
}

impl PhaseGrads {
    /// Zero gradients matching a parameter block.
    pub fn zeros_like(params: &PhaseParams) -> Self {
        Self {
            heads: params
                .heads
                .iter()
                .map(|h| HeadGrads {
                    w_source: Matrix::zeros(h.w_source.rows(), h.w_source.cols()),
                    w_target: Matrix::zeros(h.w_target.rows(), h.w_target.cols()),
                    a: vec![0.0; h.a.len()],
                })
                .collect(),
            w_out: Matrix::zeros(params.w_out.rows(), params.w_out.cols()),
        }
    }

    /// `self += other`.
    pub fn accumulate(&mut self, other: &PhaseGrads) -> MathResult<()> {
        for (mine, theirs) in self.heads.iter_mut().zip(&other.heads) {
            mine.w_source.add_scaled(&theirs.w_source, 1.0)?;
            mine.w_target.add_scaled(&theirs.w_target, 1.0)?;
            for (a, b) in mine.a.iter_mut().zip(&theirs.a) {
                *a += b;
            }
        }
        self.w_out.add_scaled(&other.w_out, 1.0)
    }

    /// Squared Frobenius norm over every tensor (for clipping).
    pub fn norm_sq(&self) -> f32 {
        let mut acc = self.w_out.as_slice().iter().map(|v| v * v).sum::<f32>();
        for h in &self.heads {
            acc += h.w_source.as_slice().iter().map(|v| v * v).sum::<f32>();
            acc += h.w_target.as_slice().iter().map(|v| v * v).sum::<f32>();
            acc += h.a.iter().map(|v| v * v).sum::<f32>();
        }
        acc
    }

    /// Scale every gradient tensor.
    pub fn scale(&mut self, factor: f32) {
        self.w_out.scale(factor);
        for h in &mut self.heads {
            h.w_source.scale(factor);
            h.w_target.scale(factor);
            for v in &mut h.a {
                *v *= factor;
            }
        }
    }
}

/// SGD step: `params -= lr · grads`.
pub fn apply_phase_sgd(params: &mut PhaseParams, grads: &PhaseGrads, lr: f32) -> MathResult<()> {
    for (p, g) in params.heads.iter_mut().zip(&grads.heads) {
        p.w_source.add_scaled(&g.w_source, -lr)?;
        p.w_target.add_scaled(&g.w_target, -lr)?;
        for (a, da) in p.a.iter_mut().zip(&g.a) {
            *a -= lr * da;
        }
    }
    params.w_out.add_scaled(&grads.w_out, -lr)
}

// ---------------------------------------------------------------------------
// Forward
// ---------------------------------------------------------------------------

/// One attention phase forward.
///
/// `src` is `|S| × D`, `tgt` is `|T| × D`; the result is `|T| × D`. With a
/// `rng`, dropout is applied at probability `dropout_p`; without one the
/// pass is deterministic (evaluation / health-check mode).
pub fn phase_forward(
    params: &PhaseParams,
    kernel: &dyn MatKernel,
    src: &Matrix,
    tgt: &Matrix,
    incidence: &PhaseIncidence,
    leaky_slope: f32,
    dropout_p: f32,
    rng: Option<&mut StdRng>,
) -> MathResult<(Matrix, PhaseCache)> {
    let num_targets = tgt.rows();
    let d = params
        .heads
        .first()
        .map(|h| h.w_source.rows())
        .unwrap_or(0);
    let k = params.heads.len();

    // Heads are independent: project and aggregate concurrently.
    let head_results: Vec<MathResult<(HeadCache, Matrix)>> = params
        .heads
        .par_iter()
        .map(|head| head_forward(head, kernel, src, tgt, incidence, leaky_slope, d))
        .collect();

    let mut heads = Vec::with_capacity(k);
    let mut messages = Vec::with_capacity(k);
    for result in head_results {
        let (cache, msg) = result?;
        heads.push(cache);
        messages.push(msg);
    }

    // Concatenate heads: target row t = [msg_0[t] ‖ … ‖ msg_{K−1}[t]].
    let mut concat = Matrix::zeros(num_targets, k * d);
    for (h, msg) in messages.iter().enumerate() {
        for t in 0..num_targets {
            concat.row_mut(t)[h * d..(h + 1) * d].copy_from_slice(msg.row(t));
        }
    }

    // Inverted dropout over the concatenated messages.
    let (keep_mask, dropout_scale) = match rng {
        Some(rng) if dropout_p > 0.0 && dropout_p < 1.0 => {
            let mask = crate::math::dropout(concat.as_mut_slice(), dropout_p, rng);
            (mask, 1.0 / (1.0 - dropout_p))
        }
        _ => (Vec::new(), 1.0),
    };

    // Feed-forward block: linear + ELU, residual, layer norm.
    let f = kernel.matmul_transpose(&concat, &params.w_out)?;
    let mut y = Matrix::zeros(num_targets, tgt.cols());
    let mut inv_std = Vec::with_capacity(num_targets);
    for t in 0..num_targets {
        let f_row = f.row(t);
        let tgt_row = tgt.row(t);
        let row = y.row_mut(t);
        for (i, out) in row.iter_mut().enumerate() {
            *out = elu(f_row[i]) + tgt_row[i];
        }
        inv_std.push(layer_norm_row(row));
    }

    let cache = PhaseCache {
        heads,
        concat,
        keep_mask,
        dropout_scale,
        f,
        y: y.clone(),
        inv_std,
    };
    Ok((y, cache))
}

fn head_forward(
    head: &HeadParams,
    kernel: &dyn MatKernel,
    src: &Matrix,
    tgt: &Matrix,
    incidence: &PhaseIncidence,
    leaky_slope: f32,
    d: usize,
) -> MathResult<(HeadCache, Matrix)> {
    let hs = kernel.matmul_transpose(src, &head.w_source)?;
    let et = kernel.matmul_transpose(tgt, &head.w_target)?;
    let (a_src, a_tgt) = head.a.split_at(d);

    let num_targets = tgt.rows();
    let mut raws = Vec::with_capacity(num_targets);
    let mut alphas = Vec::with_capacity(num_targets);
    let mut msg = Matrix::zeros(num_targets, d);

    for t in 0..num_targets {
        let sources = &incidence.per_target[t];
        if sources.is_empty() {
            raws.push(Vec::new());
            alphas.push(Vec::new());
            continue;
        }
        let tgt_part = dot(a_tgt, et.row(t));
        let raw: Vec<f32> = sources
            .iter()
            .map(|s| dot(a_src, hs.row(*s)) + tgt_part)
            .collect();
        let mut weights: Vec<f32> = raw.iter().map(|r| leaky_relu(*r, leaky_slope)).collect();
        softmax(&mut weights);

        let out = msg.row_mut(t);
        for (alpha, s) in weights.iter().zip(sources) {
            for (o, v) in out.iter_mut().zip(hs.row(*s)) {
                *o += alpha * v;
            }
        }
        raws.push(raw);
        alphas.push(weights);
    }

    Ok((
        HeadCache {
            hs,
            et,
            raws,
            alphas,
        },
        msg,
    ))
}

/// Normalize a row in place, returning `1 / sqrt(var + eps)`.
fn layer_norm_row(row: &mut [f32]) -> f32 {
    let n = row.len() as f32;
    let mean = row.iter().sum::<f32>() / n;
    let var = row.iter().map(|x| (x - mean) * (x - mean)).sum::<f32>() / n;
    let inv_std = 1.0 / (var + LN_EPS).sqrt();
    for x in row.iter_mut() {
        *x = (*x - mean) * inv_std;
    }
    inv_std
}

// ---------------------------------------------------------------------------
// Backward
// ---------------------------------------------------------------------------

/// One attention phase backward.
///
/// `d_out` is the gradient on the phase output (`|T| × D`). Returns the
/// parameter gradients plus the gradients flowing into `src` and `tgt`.
pub fn phase_backward(
    params: &PhaseParams,
    kernel: &dyn MatKernel,
    src: &Matrix,
    tgt: &Matrix,
    incidence: &PhaseIncidence,
    cache: &PhaseCache,
    d_out: &Matrix,
    leaky_slope: f32,
) -> MathResult<(PhaseGrads, Matrix, Matrix)> {
    let num_targets = tgt.rows();
    let dim = tgt.cols();
    let d = params
        .heads
        .first()
        .map(|h| h.w_source.rows())
        .unwrap_or(0);

    let mut grads = PhaseGrads::zeros_like(params);
    let mut d_src = Matrix::zeros(src.rows(), src.cols());
    let mut d_tgt = Matrix::zeros(tgt.rows(), tgt.cols());

    // Layer norm backward: dR = inv_std · (dY − mean(dY) − y ⊙ mean(dY ⊙ y)).
    let mut d_res = Matrix::zeros(num_targets, dim);
    for t in 0..num_targets {
        let dy = d_out.row(t);
        let y = cache.y.row(t);
        let n = dim as f32;
        let mean_dy = dy.iter().sum::<f32>() / n;
        let mean_dyy = dy.iter().zip(y).map(|(a, b)| a * b).sum::<f32>() / n;
        let inv_std = cache.inv_std[t];
        let out = d_res.row_mut(t);
        for i in 0..dim {
            out[i] = inv_std * (dy[i] - mean_dy - y[i] * mean_dyy);
        }
    }

    // Residual: gradient flows to the target features unchanged.
    d_tgt.add_scaled(&d_res, 1.0)?;

    // ELU backward into the feed-forward pre-activation.
    let mut d_f = d_res;
    for t in 0..num_targets {
        let f_row = cache.f.row(t).to_vec();
        let row = d_f.row_mut(t);
        for (g, f_val) in row.iter_mut().zip(f_row) {
            *g *= elu_derivative(f_val);
        }
    }

    // Linear backward: dW_out = dFᵀ · C, dC = dF · W_out.
    grads
        .w_out
        .add_scaled(&kernel.matmul(&d_f.transposed(), &cache.concat)?, 1.0)?;
    let mut d_concat = kernel.matmul(&d_f, &params.w_out)?;

    // Dropout backward: same mask, same scale.
    if !cache.keep_mask.is_empty() {
        for (v, keep) in d_concat.as_mut_slice().iter_mut().zip(&cache.keep_mask) {
            *v = if *keep { *v * cache.dropout_scale } else { 0.0 };
        }
    }

    // Attention backward, one head at a time.
    for (h, (head, head_cache)) in params.heads.iter().zip(&cache.heads).enumerate() {
        let (a_src, a_tgt) = head.a.split_at(d);
        let head_grads = &mut grads.heads[h];

        let mut d_hs = Matrix::zeros(head_cache.hs.rows(), d);
        let mut d_et = Matrix::zeros(head_cache.et.rows(), d);

        for t in 0..num_targets {
            let sources = &incidence.per_target[t];
            if sources.is_empty() {
                continue;
            }
            let d_msg = &d_concat.row(t)[h * d..(h + 1) * d];
            let alphas = &head_cache.alphas[t];
            let raws = &head_cache.raws[t];

            // dα_s = ⟨dMsg, Hs[s]⟩ ; dHs[s] += α_s · dMsg.
            let mut d_alpha = Vec::with_capacity(sources.len());
            for (s, alpha) in sources.iter().zip(alphas) {
                let hs_row = head_cache.hs.row(*s);
                d_alpha.push(dot(d_msg, hs_row));
                let d_hs_row = d_hs.row_mut(*s);
                for (o, v) in d_hs_row.iter_mut().zip(d_msg) {
                    *o += alpha * v;
                }
            }

            // Softmax Jacobian, then the leaky-ReLU derivative on the raws.
            let d_z = softmax_jacobian_vecmul(alphas, &d_alpha);
            for ((s, raw), dz) in sources.iter().zip(raws).zip(&d_z) {
                let d_raw = dz * leaky_relu_derivative(*raw, leaky_slope);
                let hs_row = head_cache.hs.row(*s);
                let et_row = head_cache.et.row(t);
                for i in 0..d {
                    head_grads.a[i] += d_raw * hs_row[i];
                    head_grads.a[d + i] += d_raw * et_row[i];
                }
                let d_hs_row = d_hs.row_mut(*s);
                for i in 0..d {
                    d_hs_row[i] += d_raw * a_src[i];
                }
                let d_et_row = d_et.row_mut(t);
                for i in 0..d {
                    d_et_row[i] += d_raw * a_tgt[i];
                }
            }
        }

        // Projection backward: dW = dProjᵀ · features, dFeatures = dProj · W.
        head_grads
            .w_source
            .add_scaled(&kernel.matmul(&d_hs.transposed(), src)?, 1.0)?;
        head_grads
            .w_target
            .add_scaled(&kernel.matmul(&d_et.transposed(), tgt)?, 1.0)?;
        d_src.add_scaled(&kernel.matmul(&d_hs, &head.w_source)?, 1.0)?;
        d_tgt.add_scaled(&kernel.matmul(&d_et, &head.w_target)?, 1.0)?;
    }

    Ok((grads, d_src, d_tgt))
}
