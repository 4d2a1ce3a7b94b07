//! K-head attention scorer: intent vector → per-candidate scores.
//!
//! The intent is projected once through `W_intent`; each head then projects
//! it to a query and every candidate embedding to a key, scores the pair
//! with a scaled dot product, and the per-head sigmoids are averaged.
//!
//! The batched variant shares one projection matmul per head across the
//! whole intent batch, so scoring `B` intents against `C` candidates costs
//! `O(1)` projections instead of `O(B)`.

use crate::math::{MatKernel, MathResult, Matrix, dot, elu, sigmoid};

use super::params::{ScorerParams, Tensor};
use super::{ForwardOutput, GraphFeatures, ShgatModel};

/// One scored candidate.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredCandidate {
    pub id: String,
    pub score: f32,
}

/// Handcrafted per-candidate stats for the v2 scoring path.
#[derive(Debug, Clone, Copy, Default)]
pub struct CandidateStats {
    /// Historical success rate in `[0, 1]`.
    pub success_rate: f32,
    /// Recency signal in `[0, 1]` (1 = executed just now).
    pub recency: f32,
    /// Normalized usage count in `[0, 1]`.
    pub usage: f32,
    /// Overlap between the candidate's tools and the running context.
    pub context_overlap: f32,
}

impl CandidateStats {
    fn to_features(self) -> [f32; 4] {
        [self.success_rate, self.recency, self.usage, self.context_overlap]
    }
}

// ---------------------------------------------------------------------------
// Core scoring
// ---------------------------------------------------------------------------

/// `q̃ = W_intent · q`.
pub fn project_intent(
    params: &ScorerParams,
    kernel: &dyn MatKernel,
    intent: &[f32],
) -> MathResult<Vec<f32>> {
    kernel.matvec(&params.w_intent, intent)
}

/// Per-head logits `(Q · K_e) / √d` for one projected intent and candidate.
pub fn head_logits(
    params: &ScorerParams,
    kernel: &dyn MatKernel,
    intent_projected: &[f32],
    embedding: &[f32],
) -> MathResult<Vec<f32>> {
    let d = params.w_q.first().map(Matrix::rows).unwrap_or(1);
    let scale = 1.0 / (d as f32).sqrt();
    params
        .w_q
        .iter()
        .zip(&params.w_k)
        .map(|(w_q, w_k)| {
            let q = kernel.matvec(w_q, intent_projected)?;
            let k = kernel.matvec(w_k, embedding)?;
            Ok(dot(&q, &k) * scale)
        })
        .collect()
}

/// Mean over heads of the per-head sigmoid scores.
pub fn score_embedding(
    params: &ScorerParams,
    kernel: &dyn MatKernel,
    intent_projected: &[f32],
    embedding: &[f32],
) -> MathResult<f32> {
    let logits = head_logits(params, kernel, intent_projected, embedding)?;
    Ok(logits.iter().map(|l| sigmoid(*l)).sum::<f32>() / logits.len().max(1) as f32)
}

/// Fusion MLP output for the v2 path: a scalar logit adjustment.
pub fn fusion_adjustment(
    params: &ScorerParams,
    kernel: &dyn MatKernel,
    stats: CandidateStats,
) -> MathResult<f32> {
    let features = stats.to_features();
    let mut hidden = kernel.matvec(&params.fusion.w1, &features)?;
    for (h, b) in hidden.iter_mut().zip(&params.fusion.b1) {
        *h = elu(*h + *b);
    }
    let out = kernel.matvec(&params.fusion.w2, &hidden)?;
    Ok(out[0] + params.fusion.b2[0])
}

/// Batched scoring: one projection matmul per head, shared across intents.
///
/// `intents` is `B × D`; `candidates` pairs ids with their embeddings.
/// Returns, per intent, all candidates with scores (unsorted).
pub fn score_batch(
    params: &ScorerParams,
    kernel: &dyn MatKernel,
    intents: &Matrix,
    candidates: &[(String, Vec<f32>)],
) -> MathResult<Vec<Vec<ScoredCandidate>>> {
    let batch = intents.rows();
    if batch == 0 || candidates.is_empty() {
        return Ok(vec![Vec::new(); batch]);
    }
    let d = params.w_q.first().map(Matrix::rows).unwrap_or(1);
    let scale = 1.0 / (d as f32).sqrt();
    let dim = intents.cols();

    // One shared intent projection for the whole batch.
    let projected = kernel.matmul_transpose(intents, &params.w_intent)?;

    let mut cand_matrix = Matrix::zeros(candidates.len(), dim);
    for (row, (_, emb)) in candidates.iter().enumerate() {
        cand_matrix.row_mut(row).copy_from_slice(emb);
    }

    // Accumulate mean-of-sigmoids head by head: one Q matmul and one K
    // matmul per head regardless of batch size.
    let mut scores = vec![vec![0.0f32; candidates.len()]; batch];
    for (w_q, w_k) in params.w_q.iter().zip(&params.w_k) {
        let q_batch = kernel.matmul_transpose(&projected, w_q)?;
        let k_all = kernel.matmul_transpose(&cand_matrix, w_k)?;
        let logits = kernel.matmul_transpose(&q_batch, &k_all)?;
        for b in 0..batch {
            for c in 0..candidates.len() {
                scores[b][c] += sigmoid(logits.get(b, c) * scale);
            }
        }
    }

    let heads = params.w_q.len().max(1) as f32;
    Ok(scores
        .into_iter()
        .map(|row| {
            row.into_iter()
                .zip(candidates)
                .map(|(sum, (id, _))| ScoredCandidate {
                    id: id.clone(),
                    score: sum / heads,
                })
                .collect()
        })
        .collect())
}

// ---------------------------------------------------------------------------
// Model-level API
// ---------------------------------------------------------------------------

impl ShgatModel {
    /// Rank every capability against an intent, best first.
    pub fn score_all_capabilities(
        &self,
        features: &GraphFeatures,
        output: &ForwardOutput,
        intent: &[f32],
    ) -> MathResult<Vec<ScoredCandidate>> {
        let projected = project_intent(&self.params.scorer, self.kernel().as_ref(), intent)?;
        let mut scored = Vec::new();
        for (level, group) in features.incidence.caps_by_level.iter().enumerate() {
            for (row, id) in group.iter().enumerate() {
                let score = score_embedding(
                    &self.params.scorer,
                    self.kernel().as_ref(),
                    &projected,
                    output.caps[level].row(row),
                )?;
                scored.push(ScoredCandidate {
                    id: id.clone(),
                    score,
                });
            }
        }
        sort_scored(&mut scored);
        Ok(scored)
    }

    /// Rank every tool against an intent, best first.
    pub fn score_all_tools(
        &self,
        features: &GraphFeatures,
        output: &ForwardOutput,
        intent: &[f32],
    ) -> MathResult<Vec<ScoredCandidate>> {
        let projected = project_intent(&self.params.scorer, self.kernel().as_ref(), intent)?;
        let mut scored = Vec::new();
        for (row, id) in features.incidence.tool_ids.iter().enumerate() {
            let score = score_embedding(
                &self.params.scorer,
                self.kernel().as_ref(),
                &projected,
                output.tools.row(row),
            )?;
            scored.push(ScoredCandidate {
                id: id.clone(),
                score,
            });
        }
        sort_scored(&mut scored);
        Ok(scored)
    }

    /// v2 scoring: the attention logit augmented by the fusion MLP over
    /// handcrafted candidate stats.
    pub fn score_all_capabilities_v2(
        &self,
        features: &GraphFeatures,
        output: &ForwardOutput,
        intent: &[f32],
        stats: &dyn Fn(&str) -> CandidateStats,
    ) -> MathResult<Vec<ScoredCandidate>> {
        let kernel = self.kernel().as_ref();
        let projected = project_intent(&self.params.scorer, kernel, intent)?;
        let mut scored = Vec::new();
        for (level, group) in features.incidence.caps_by_level.iter().enumerate() {
            for (row, id) in group.iter().enumerate() {
                let logits = head_logits(
                    &self.params.scorer,
                    kernel,
                    &projected,
                    output.caps[level].row(row),
                )?;
                let mean_logit = logits.iter().sum::<f32>() / logits.len().max(1) as f32;
                let adjustment = fusion_adjustment(&self.params.scorer, kernel, stats(id))?;
                scored.push(ScoredCandidate {
                    id: id.clone(),
                    score: sigmoid(mean_logit + adjustment),
                });
            }
        }
        sort_scored(&mut scored);
        Ok(scored)
    }

    /// Export the parameter block as a named tensor map.
    pub fn export_params(&self) -> std::collections::BTreeMap<String, Tensor> {
        self.params.export()
    }

    /// Replace the parameter block from a tensor map, rejecting mismatches.
    pub fn import_params(
        &mut self,
        map: &std::collections::BTreeMap<String, Tensor>,
    ) -> Result<(), crate::error::TrainError> {
        let config = self.config.clone();
        self.params.import(map, &config)
    }
}

fn sort_scored(scored: &mut [ScoredCandidate]) {
    scored.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::scalar::ScalarKernel;
    use crate::shgat::ShgatConfig;
    use crate::shgat::params::ShgatParams;

    fn identity_scorer(dim: usize, scoring_dim: usize, heads: usize) -> ScorerParams {
        let config = ShgatConfig {
            embedding_dim: dim,
            scoring_dim,
            num_heads: heads,
            num_layers: 1,
            ..Default::default()
        };
        let mut params = ShgatParams::init(&config, 0, 1).scorer;
        params.w_intent = Matrix::eye(dim, dim);
        for w in params.w_q.iter_mut().chain(params.w_k.iter_mut()) {
            *w = Matrix::eye(scoring_dim, dim);
        }
        params
    }

    #[test]
    fn identity_weights_give_known_scores() {
        // W_intent = I, W_q = W_k = truncated identity, one head,
        // intent = e1: s(e1) = σ(1/√d), s(e2) = σ(0) = 0.5.
        let (dim, d) = (8, 4);
        let params = identity_scorer(dim, d, 1);
        let kernel = ScalarKernel;

        let mut e1 = vec![0.0; dim];
        e1[0] = 1.0;
        let mut e2 = vec![0.0; dim];
        e2[1] = 1.0;

        let projected = project_intent(&params, &kernel, &e1).unwrap();
        let s1 = score_embedding(&params, &kernel, &projected, &e1).unwrap();
        let s2 = score_embedding(&params, &kernel, &projected, &e2).unwrap();

        let expected = sigmoid(1.0 / (d as f32).sqrt());
        assert!((s1 - expected).abs() < 1e-6, "{s1} vs {expected}");
        assert!((s2 - 0.5).abs() < 1e-6);
    }

    #[test]
    fn batched_matches_single_scoring() {
        let (dim, d) = (8, 4);
        let config = ShgatConfig {
            embedding_dim: dim,
            scoring_dim: d,
            num_heads: 2,
            num_layers: 1,
            ..Default::default()
        };
        let params = ShgatParams::init(&config, 0, 3).scorer;
        let kernel = ScalarKernel;

        let intents = Matrix::from_vec(
            2,
            dim,
            (0..2 * dim).map(|i| (i as f32 * 0.17).sin()).collect(),
        )
        .unwrap();
        let candidates: Vec<(String, Vec<f32>)> = (0..3)
            .map(|c| {
                (
                    format!("cap{c}"),
                    (0..dim).map(|i| ((c * dim + i) as f32 * 0.31).cos()).collect(),
                )
            })
            .collect();

        let batched = score_batch(&params, &kernel, &intents, &candidates).unwrap();

        for b in 0..2 {
            let projected = project_intent(&params, &kernel, intents.row(b)).unwrap();
            for (c, (_, emb)) in candidates.iter().enumerate() {
                let single = score_embedding(&params, &kernel, &projected, emb).unwrap();
                assert!(
                    (batched[b][c].score - single).abs() < 1e-5,
                    "batch ({b},{c}): {} vs {single}",
                    batched[b][c].score
                );
            }
        }
    }

    #[test]
    fn batched_projection_count_is_constant_in_batch_size() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        /// Kernel wrapper counting matmul-class calls.
        struct CountingKernel {
            inner: ScalarKernel,
            matmuls: AtomicUsize,
        }
        impl MatKernel for CountingKernel {
            fn backend(&self) -> crate::math::Backend {
                self.inner.backend()
            }
            fn matmul(&self, a: &Matrix, b: &Matrix) -> MathResult<Matrix> {
                self.matmuls.fetch_add(1, Ordering::Relaxed);
                self.inner.matmul(a, b)
            }
            fn matmul_transpose(&self, a: &Matrix, b: &Matrix) -> MathResult<Matrix> {
                self.matmuls.fetch_add(1, Ordering::Relaxed);
                self.inner.matmul_transpose(a, b)
            }
            fn matvec(&self, a: &Matrix, x: &[f32]) -> MathResult<Vec<f32>> {
                self.inner.matvec(a, x)
            }
            fn matvec_transpose(&self, a: &Matrix, x: &[f32]) -> MathResult<Vec<f32>> {
                self.inner.matvec_transpose(a, x)
            }
            fn outer_product_add(
                &self,
                a: &mut Matrix,
                x: &[f32],
                y: &[f32],
                alpha: f32,
            ) -> MathResult<()> {
                self.inner.outer_product_add(a, x, y, alpha)
            }
        }

        let dim = 8;
        let config = ShgatConfig {
            embedding_dim: dim,
            scoring_dim: 4,
            num_heads: 2,
            num_layers: 1,
            ..Default::default()
        };
        let params = ShgatParams::init(&config, 0, 3).scorer;
        let candidates: Vec<(String, Vec<f32>)> = (0..100)
            .map(|c| (format!("cap{c}"), vec![0.1; dim]))
            .collect();

        let count_for = |batch: usize| {
            let kernel = CountingKernel {
                inner: ScalarKernel,
                matmuls: AtomicUsize::new(0),
            };
            let intents = Matrix::zeros(batch, dim);
            score_batch(&params, &kernel, &intents, &candidates).unwrap();
            kernel.matmuls.load(Ordering::Relaxed)
        };

        // O(1) projections in batch size: 16 intents cost the same number
        // of matmul calls as one.
        assert_eq!(count_for(1), count_for(16));
    }

    #[test]
    fn fusion_adjustment_shifts_scores() {
        let (dim, d) = (8, 4);
        let config = ShgatConfig {
            embedding_dim: dim,
            scoring_dim: d,
            num_heads: 1,
            num_layers: 1,
            ..Default::default()
        };
        let params = ShgatParams::init(&config, 0, 5).scorer;
        let kernel = ScalarKernel;

        let low = fusion_adjustment(&params, &kernel, CandidateStats::default()).unwrap();
        let high = fusion_adjustment(
            &params,
            &kernel,
            CandidateStats {
                success_rate: 1.0,
                recency: 1.0,
                usage: 1.0,
                context_overlap: 1.0,
            },
        )
        .unwrap();
        assert!(low.is_finite() && high.is_finite());
        assert_ne!(low, high);
    }
}
