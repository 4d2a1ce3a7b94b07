//! Trainer: PER-sampled batches, K-head backward, curriculum negatives,
//! and the held-out health check.
//!
//! The loss per example is binary cross-entropy with InfoNCE-style
//! negatives, `-log σ(ℓ₊) − Σ_j log(1 − σ(ℓ₋ⱼ))`, averaged over heads and
//! weighted by the PER importance weight. Gradients flow through the K-head
//! scorer into the message-passing stack; the optimizer is plain SGD with
//! global gradient-norm clipping.
//!
//! On detected degradation (held-out accuracy falling more than the margin
//! below the epoch-0 baseline) training stops early and the parameters are
//! rolled back to the pre-training snapshot.

use rand::Rng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use crate::embed::{Embedder, HashEmbedder};
use crate::error::TrainError;
use crate::graph::store::GraphStore;
use crate::math::{MatKernel, Matrix, dot, sigmoid};

use super::params::{ScorerParams, ShgatParams};
use super::replay::PerBuffer;
use super::scorer::{project_intent, score_embedding};
use super::{ForwardOutput, GraphFeatures, ShgatModel, TrainingExample};

/// Held-out accuracy may fall this far below the baseline before training
/// is stopped and rolled back.
pub const DEGRADATION_MARGIN: f32 = 0.15;

/// Per-epoch priority decay factor.
const PRIORITY_DECAY: f32 = 0.99;

/// Curriculum tier boundaries on the previous epoch's accuracy.
const EASY_BELOW: f32 = 0.35;
const HARD_ABOVE: f32 = 0.55;

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// Held-out evaluation summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheck {
    pub baseline_accuracy: f32,
    pub final_test_accuracy: f32,
    pub degradation_detected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub early_stop_epoch: Option<usize>,
}

/// Result of one training run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainOutcome {
    pub final_loss: f32,
    pub final_accuracy: f32,
    /// Last-epoch TD errors, one per sampled example.
    pub td_errors: Vec<f32>,
    pub epochs_run: usize,
    pub health_check: HealthCheck,
    /// True when degradation rolled the parameters back to the pre-training
    /// snapshot.
    pub rolled_back: bool,
}

/// Trainer knobs beyond the model config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainerOptions {
    pub epochs: usize,
    pub batch_size: usize,
}

impl Default for TrainerOptions {
    fn default() -> Self {
        Self {
            epochs: 5,
            batch_size: 16,
        }
    }
}

// ---------------------------------------------------------------------------
// Curriculum
// ---------------------------------------------------------------------------

/// Which third of the similarity-sorted negatives to sample from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    /// Least-similar negatives (the last third).
    Easy,
    /// Middle third.
    Medium,
    /// Most-similar negatives (the first third).
    Hard,
}

/// Tier for this epoch based on the previous epoch's accuracy.
pub fn curriculum_tier(previous_accuracy: Option<f32>) -> Tier {
    match previous_accuracy {
        Some(acc) if acc < EASY_BELOW => Tier::Easy,
        Some(acc) if acc > HARD_ABOVE => Tier::Hard,
        Some(_) => Tier::Medium,
        None => Tier::Medium,
    }
}

/// Slice the sorted negative list down to the tier, then shuffle-sample `n`.
pub fn pick_negatives(
    sorted_desc: &[String],
    tier: Tier,
    n: usize,
    rng: &mut StdRng,
) -> Vec<String> {
    if sorted_desc.is_empty() {
        return Vec::new();
    }
    let third = (sorted_desc.len() / 3).max(1);
    let slice = match tier {
        Tier::Hard => &sorted_desc[..third.min(sorted_desc.len())],
        Tier::Easy => &sorted_desc[sorted_desc.len() - third.min(sorted_desc.len())..],
        Tier::Medium => {
            let start = third.min(sorted_desc.len().saturating_sub(1));
            let end = (2 * third).min(sorted_desc.len());
            if start < end {
                &sorted_desc[start..end]
            } else {
                sorted_desc
            }
        }
    };
    let mut pool: Vec<String> = slice.to_vec();
    pool.shuffle(rng);
    pool.truncate(n);
    pool
}

// ---------------------------------------------------------------------------
// Scorer gradients
// ---------------------------------------------------------------------------

/// Gradient block for the scorer parameters trained by this path.
pub struct ScorerGrads {
    w_intent: Matrix,
    w_q: Vec<Matrix>,
    w_k: Vec<Matrix>,
}

impl ScorerGrads {
    fn zeros_like(params: &ScorerParams) -> Self {
        Self {
            w_intent: Matrix::zeros(params.w_intent.rows(), params.w_intent.cols()),
            w_q: params
                .w_q
                .iter()
                .map(|m| Matrix::zeros(m.rows(), m.cols()))
                .collect(),
            w_k: params
                .w_k
                .iter()
                .map(|m| Matrix::zeros(m.rows(), m.cols()))
                .collect(),
        }
    }

    fn norm_sq(&self) -> f32 {
        let mut acc: f32 = self.w_intent.as_slice().iter().map(|v| v * v).sum();
        for m in self.w_q.iter().chain(&self.w_k) {
            acc += m.as_slice().iter().map(|v| v * v).sum::<f32>();
        }
        acc
    }

    fn scale(&mut self, factor: f32) {
        self.w_intent.scale(factor);
        for m in self.w_q.iter_mut().chain(self.w_k.iter_mut()) {
            m.scale(factor);
        }
    }
}

fn apply_scorer_sgd(
    params: &mut ShgatParams,
    grads: &ScorerGrads,
    lr: f32,
) -> Result<(), TrainError> {
    let scorer = &mut params.scorer;
    scorer
        .w_intent
        .add_scaled(&grads.w_intent, -lr)
        .map_err(grad_shape)?;
    for (p, g) in scorer.w_q.iter_mut().zip(&grads.w_q) {
        p.add_scaled(g, -lr).map_err(grad_shape)?;
    }
    for (p, g) in scorer.w_k.iter_mut().zip(&grads.w_k) {
        p.add_scaled(g, -lr).map_err(grad_shape)?;
    }
    Ok(())
}

fn grad_shape(e: crate::error::MathError) -> TrainError {
    TrainError::InvalidInput {
        message: format!("gradient shape error: {e}"),
    }
}

// ---------------------------------------------------------------------------
// Candidate location
// ---------------------------------------------------------------------------

enum CandidateLoc {
    Tool(usize),
    Cap(usize, usize),
}

fn locate(features: &GraphFeatures, id: &str) -> Option<CandidateLoc> {
    if let Some(&row) = features.incidence.tool_index.get(id) {
        return Some(CandidateLoc::Tool(row));
    }
    for (level, index) in features.incidence.cap_index_by_level.iter().enumerate() {
        if let Some(&row) = index.get(id) {
            return Some(CandidateLoc::Cap(level, row));
        }
    }
    None
}

fn embedding_of<'o>(output: &'o ForwardOutput, loc: &CandidateLoc) -> &'o [f32] {
    match loc {
        CandidateLoc::Tool(row) => output.tools.row(*row),
        CandidateLoc::Cap(level, row) => output.caps[*level].row(*row),
    }
}

/// `softplus(x) = ln(1 + e^x)`, overflow-safe.
fn softplus(x: f32) -> f32 {
    if x > 20.0 {
        x
    } else if x < -20.0 {
        0.0
    } else {
        x.exp().ln_1p()
    }
}

// ---------------------------------------------------------------------------
// Trainer
// ---------------------------------------------------------------------------

/// Drives a full training run against one model and graph.
pub struct Trainer {
    pub options: TrainerOptions,
}

impl Trainer {
    pub fn new(options: TrainerOptions) -> Self {
        Self { options }
    }

    /// Run training; see the module docs for the loop structure.
    ///
    /// Fails with [`TrainError::InvalidInput`] on an empty example list, an
    /// empty graph, or a wrong-dimension intent embedding. Unknown
    /// candidates are registered as tools with deterministic hash
    /// embeddings.
    pub fn train(
        &self,
        model: &mut ShgatModel,
        store: &GraphStore,
        examples: &[TrainingExample],
    ) -> Result<TrainOutcome, TrainError> {
        if examples.is_empty() {
            return Err(TrainError::InvalidInput {
                message: "empty examples list".into(),
            });
        }
        if store.capability_ids().is_empty() && store.tool_ids().is_empty() {
            return Err(TrainError::InvalidInput {
                message: "empty capability and tool set".into(),
            });
        }
        let dim = model.config.embedding_dim;
        for ex in examples {
            if ex.intent_embedding.len() != dim {
                return Err(TrainError::InvalidInput {
                    message: format!(
                        "intent embedding for {} has dimension {}, expected {dim}",
                        ex.candidate_id,
                        ex.intent_embedding.len()
                    ),
                });
            }
        }

        // Register unknown candidates with the deterministic fallback
        // embedding so the forward pass can see them.
        let hash_embedder = HashEmbedder::new(dim);
        for ex in examples {
            let mut ids: Vec<&String> = vec![&ex.candidate_id];
            if let Some(negs) = &ex.negative_candidates {
                ids.extend(negs);
            }
            if let Some(negs) = &ex.all_negatives_sorted_by_similarity {
                ids.extend(negs);
            }
            ids.extend(&ex.context_tools);
            for id in ids {
                if !store.has_node(id) {
                    store
                        .register_tool(id.clone(), Some(hash_embedder.embed(id)))
                        .map_err(|e| TrainError::InvalidInput {
                            message: format!("cannot register {id}: {e}"),
                        })?;
                }
            }
        }

        let features = GraphFeatures::from_store(store, dim).map_err(|e| {
            TrainError::InvalidInput {
                message: format!("feature assembly failed: {e}"),
            }
        })?;

        // Seeded shuffle and 80/20 split.
        let mut rng = model.training_rng();
        let mut shuffled: Vec<TrainingExample> = examples.to_vec();
        shuffled.shuffle(&mut rng);
        let split = ((shuffled.len() as f32) * 0.8).ceil() as usize;
        let split = split.clamp(1, shuffled.len());
        let (train_set, test_set) = shuffled.split_at(split);

        let config = model.config.clone();
        let mut buffer = PerBuffer::new(config.per_alpha, config.per_epsilon);
        for ex in train_set {
            buffer.push(ex.clone());
        }

        let pool = candidate_pool(store);
        let snapshot = model.params.clone();

        let mut health = HealthCheck {
            baseline_accuracy: 0.0,
            final_test_accuracy: 0.0,
            degradation_detected: false,
            early_stop_epoch: None,
        };
        let mut previous_accuracy: Option<f32> = None;
        let mut final_loss = 0.0;
        let mut final_accuracy = 0.0;
        let mut last_td_errors = Vec::new();
        let mut epochs_run = 0;
        let mut rolled_back = false;

        let epochs = self.options.epochs.max(1);
        for epoch in 0..epochs {
            let beta = if epochs > 1 {
                config.per_beta_start
                    + (config.per_beta_end - config.per_beta_start) * epoch as f32
                        / (epochs - 1) as f32
            } else {
                config.per_beta_end
            };
            let tier = curriculum_tier(previous_accuracy);

            let batches = train_set.len().div_ceil(self.options.batch_size);
            let mut epoch_loss = 0.0;
            let mut epoch_correct = 0usize;
            let mut epoch_total = 0usize;
            let mut epoch_tds = Vec::new();

            for _ in 0..batches {
                let (loss, correct, total, tds) = self.train_batch(
                    model,
                    &features,
                    &mut buffer,
                    &pool,
                    tier,
                    beta,
                    &mut rng,
                )?;
                epoch_loss += loss;
                epoch_correct += correct;
                epoch_total += total;
                epoch_tds.extend(tds);
            }

            buffer.decay_priorities(PRIORITY_DECAY);

            let train_accuracy = if epoch_total > 0 {
                epoch_correct as f32 / epoch_total as f32
            } else {
                0.0
            };
            final_loss = epoch_loss / epoch_total.max(1) as f32;
            final_accuracy = train_accuracy;
            last_td_errors = epoch_tds;
            previous_accuracy = Some(train_accuracy);
            epochs_run = epoch + 1;

            // Gradient-free held-out evaluation.
            let test_accuracy = evaluate(model, &features, test_set, &pool)?;
            health.final_test_accuracy = test_accuracy;
            if epoch == 0 {
                health.baseline_accuracy = test_accuracy;
            } else if health.baseline_accuracy - test_accuracy > DEGRADATION_MARGIN {
                health.degradation_detected = true;
                health.early_stop_epoch = Some(epoch);
                model.params = snapshot.clone();
                rolled_back = true;
                tracing::warn!(
                    epoch,
                    baseline = health.baseline_accuracy,
                    test_accuracy,
                    "held-out accuracy degraded; rolling back to pre-training parameters"
                );
                break;
            }
            tracing::debug!(
                epoch,
                loss = final_loss,
                train_accuracy,
                test_accuracy,
                "epoch complete"
            );
        }

        Ok(TrainOutcome {
            final_loss,
            final_accuracy,
            td_errors: last_td_errors,
            epochs_run,
            health_check: health,
            rolled_back,
        })
    }

    /// One PER batch: forward, scorer backward, message-passing backward,
    /// clip, SGD, priority write-back.
    #[allow(clippy::too_many_arguments)]
    fn train_batch(
        &self,
        model: &mut ShgatModel,
        features: &GraphFeatures,
        buffer: &mut PerBuffer,
        pool: &[String],
        tier: Tier,
        beta: f32,
        rng: &mut StdRng,
    ) -> Result<(f32, usize, usize, Vec<f32>), TrainError> {
        let config = model.config.clone();
        let kernel = model.kernel().clone();
        let d = config.scoring_dim;
        let scale = 1.0 / (d as f32).sqrt();
        let heads = config.num_heads.max(1) as f32;

        let (output, trace) = model
            .forward_traced(features, rng)
            .map_err(|e| TrainError::InvalidInput {
                message: format!("forward pass failed: {e}"),
            })?;

        let batch = buffer.sample(rng, self.options.batch_size, beta)?;

        let mut d_tools = Matrix::zeros(output.tools.rows(), output.tools.cols());
        let mut d_caps: Vec<Matrix> = output
            .caps
            .iter()
            .map(|m| Matrix::zeros(m.rows(), m.cols()))
            .collect();
        let mut scorer_grads = ScorerGrads::zeros_like(&model.params.scorer);

        let mut loss_sum = 0.0;
        let mut correct = 0usize;
        let mut total = 0usize;
        let mut td_errors = Vec::with_capacity(batch.indices.len());

        for (&index, &weight) in batch.indices.iter().zip(&batch.weights) {
            let example = buffer.example(index).clone();
            let negatives = resolve_negatives(&example, tier, &config, pool, rng);

            let q_raw = &example.intent_embedding;
            let q_tilde = project_intent(&model.params.scorer, kernel.as_ref(), q_raw)
                .map_err(|e| TrainError::InvalidInput {
                    message: format!("intent projection failed: {e}"),
                })?;

            let mut d_q_tilde = vec![0.0f32; q_tilde.len()];
            let mut pos_score = 0.0;
            let mut max_neg_score = f32::NEG_INFINITY;
            let mut example_loss = 0.0;

            // Positive candidate, then each negative.
            let mut candidates = vec![(example.candidate_id.clone(), true)];
            candidates.extend(negatives.iter().map(|n| (n.clone(), false)));

            for (candidate_id, is_positive) in &candidates {
                let Some(loc) = locate(features, candidate_id) else {
                    continue;
                };
                let embedding = embedding_of(&output, &loc).to_vec();

                let mut mean_sigma = 0.0;
                for h in 0..config.num_heads {
                    let w_q = &model.params.scorer.w_q[h];
                    let w_k = &model.params.scorer.w_k[h];
                    let q = kernel.matvec(w_q, &q_tilde).map_err(grad_shape)?;
                    let k = kernel.matvec(w_k, &embedding).map_err(grad_shape)?;
                    let logit = dot(&q, &k) * scale;
                    let sig = sigmoid(logit);
                    mean_sigma += sig / heads;

                    // BCE gradient on the logit, averaged over heads and
                    // weighted by the PER importance weight.
                    let d_logit = if *is_positive {
                        weight * (sig - 1.0) / heads
                    } else {
                        weight * sig / heads
                    };
                    example_loss += if *is_positive {
                        weight * softplus(-logit) / heads
                    } else {
                        weight * softplus(logit) / heads
                    };

                    // dQ = dLogit·K/√d, dK = dLogit·Q/√d.
                    let mut d_q = k.clone();
                    for v in &mut d_q {
                        *v *= d_logit * scale;
                    }
                    let mut d_k = q.clone();
                    for v in &mut d_k {
                        *v *= d_logit * scale;
                    }

                    kernel
                        .outer_product_add(&mut scorer_grads.w_q[h], &d_q, &q_tilde, 1.0)
                        .map_err(grad_shape)?;
                    kernel
                        .outer_product_add(&mut scorer_grads.w_k[h], &d_k, &embedding, 1.0)
                        .map_err(grad_shape)?;

                    let dq_up = kernel.matvec_transpose(w_q, &d_q).map_err(grad_shape)?;
                    for (acc, v) in d_q_tilde.iter_mut().zip(dq_up) {
                        *acc += v;
                    }
                    let de_up = kernel.matvec_transpose(w_k, &d_k).map_err(grad_shape)?;
                    let d_emb = match &loc {
                        CandidateLoc::Tool(row) => d_tools.row_mut(*row),
                        CandidateLoc::Cap(level, row) => d_caps[*level].row_mut(*row),
                    };
                    for (acc, v) in d_emb.iter_mut().zip(de_up) {
                        *acc += v;
                    }
                }

                if *is_positive {
                    pos_score = mean_sigma;
                } else {
                    max_neg_score = max_neg_score.max(mean_sigma);
                }
            }

            // dIntent flows through W_intent: dW_intent += dq̃ ⊗ q.
            kernel
                .outer_product_add(&mut scorer_grads.w_intent, &d_q_tilde, q_raw, 1.0)
                .map_err(grad_shape)?;

            loss_sum += example_loss;
            total += 1;
            if candidates.len() == 1 || pos_score > max_neg_score {
                correct += 1;
            }
            // TD error: how far the positive's score sits from its label.
            td_errors.push(pos_score - 1.0);
        }

        buffer.update_priorities(&batch.indices, &td_errors);

        let mut grads = model
            .backward(&trace, d_tools, d_caps)
            .map_err(grad_shape)?;

        // Clip by the combined global norm, then step.
        let norm = (grads.norm_sq() + scorer_grads.norm_sq()).sqrt();
        if norm > config.grad_clip && norm > 0.0 {
            let factor = config.grad_clip / norm;
            grads.scale(factor);
            scorer_grads.scale(factor);
        }
        model.apply_grads(grads).map_err(grad_shape)?;
        apply_scorer_sgd(&mut model.params, &scorer_grads, config.learning_rate)?;

        Ok((loss_sum, correct, total, td_errors))
    }
}

/// Pick negatives for one example: explicit list first, then the curriculum
/// tier of the sorted list, then uniform draws from the candidate pool.
fn resolve_negatives(
    example: &TrainingExample,
    tier: Tier,
    config: &super::ShgatConfig,
    pool: &[String],
    rng: &mut StdRng,
) -> Vec<String> {
    if let Some(explicit) = &example.negative_candidates {
        return explicit.clone();
    }
    if let Some(sorted) = &example.all_negatives_sorted_by_similarity {
        return pick_negatives(sorted, tier, config.num_negatives, rng);
    }
    let mut picks = Vec::new();
    let mut attempts = 0;
    while picks.len() < config.num_negatives && attempts < pool.len() * 2 && !pool.is_empty() {
        let candidate = &pool[rng.gen_range(0..pool.len())];
        if candidate != &example.candidate_id && !picks.contains(candidate) {
            picks.push(candidate.clone());
        }
        attempts += 1;
    }
    picks
}

fn candidate_pool(store: &GraphStore) -> Vec<String> {
    let mut pool = store.capability_ids();
    pool.extend(store.tool_ids());
    pool
}

/// Gradient-free held-out accuracy: the positive must outrank every
/// negative under the current parameters.
fn evaluate(
    model: &ShgatModel,
    features: &GraphFeatures,
    test_set: &[TrainingExample],
    pool: &[String],
) -> Result<f32, TrainError> {
    if test_set.is_empty() {
        return Ok(0.0);
    }
    let output = model.forward(features).map_err(grad_shape)?;
    let kernel = model.kernel().clone();

    let mut correct = 0usize;
    for example in test_set {
        let projected = project_intent(
            &model.params.scorer,
            kernel.as_ref(),
            &example.intent_embedding,
        )
        .map_err(grad_shape)?;

        let score_of = |id: &str| -> Option<f32> {
            let loc = locate(features, id)?;
            score_embedding(
                &model.params.scorer,
                kernel.as_ref(),
                &projected,
                embedding_of(&output, &loc),
            )
            .ok()
        };

        let Some(pos) = score_of(&example.candidate_id) else {
            continue;
        };

        // Deterministic eval negatives: explicit list, then the head of the
        // sorted list, then the id-sorted pool.
        let negatives: Vec<String> = if let Some(explicit) = &example.negative_candidates {
            explicit.clone()
        } else if let Some(sorted) = &example.all_negatives_sorted_by_similarity {
            sorted
                .iter()
                .take(model.config.num_negatives)
                .cloned()
                .collect()
        } else {
            pool.iter()
                .filter(|id| **id != example.candidate_id)
                .take(model.config.num_negatives)
                .cloned()
                .collect()
        };

        let beaten_all = negatives
            .iter()
            .filter_map(|n| score_of(n))
            .all(|neg| pos > neg);
        if beaten_all {
            correct += 1;
        }
    }
    Ok(correct as f32 / test_set.len() as f32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::CapabilityOptions;
    use crate::math::best_kernel;
    use crate::shgat::ShgatConfig;
    use rand::SeedableRng;

    fn training_store() -> GraphStore {
        let store = GraphStore::new();
        for t in ["read", "parse", "write", "fetch"] {
            store.register_tool(t, None).unwrap();
        }
        store
            .register_capability(
                "ingest",
                CapabilityOptions {
                    members: vec!["read".into(), "parse".into()],
                    ..Default::default()
                },
            )
            .unwrap();
        store
            .register_capability(
                "publish",
                CapabilityOptions {
                    members: vec!["write".into(), "fetch".into()],
                    ..Default::default()
                },
            )
            .unwrap();
        store
    }

    fn test_model(store: &GraphStore) -> ShgatModel {
        let config = ShgatConfig {
            embedding_dim: 8,
            scoring_dim: 4,
            num_heads: 2,
            num_layers: 1,
            dropout: 0.0,
            ..Default::default()
        };
        ShgatModel::new(config, store.max_level(), best_kernel())
    }

    fn examples_for(store: &GraphStore, n: usize) -> Vec<TrainingExample> {
        let embedder = HashEmbedder::new(8);
        let caps = store.capability_ids();
        (0..n)
            .map(|i| {
                let positive = &caps[i % caps.len()];
                let negative = &caps[(i + 1) % caps.len()];
                TrainingExample {
                    intent_embedding: embedder.embed(&format!("intent for {positive}")),
                    context_tools: Vec::new(),
                    candidate_id: positive.clone(),
                    outcome: 1,
                    negative_candidates: Some(vec![negative.clone()]),
                    all_negatives_sorted_by_similarity: None,
                }
            })
            .collect()
    }

    #[test]
    fn empty_examples_are_rejected() {
        let store = training_store();
        let mut model = test_model(&store);
        let trainer = Trainer::new(TrainerOptions::default());
        assert!(matches!(
            trainer.train(&mut model, &store, &[]),
            Err(TrainError::InvalidInput { .. })
        ));
    }

    #[test]
    fn wrong_intent_dimension_is_rejected() {
        let store = training_store();
        let mut model = test_model(&store);
        let trainer = Trainer::new(TrainerOptions::default());
        let bad = TrainingExample {
            intent_embedding: vec![0.0; 3],
            context_tools: Vec::new(),
            candidate_id: "ingest".into(),
            outcome: 1,
            negative_candidates: None,
            all_negatives_sorted_by_similarity: None,
        };
        assert!(matches!(
            trainer.train(&mut model, &store, &[bad]),
            Err(TrainError::InvalidInput { .. })
        ));
    }

    #[test]
    fn training_runs_and_changes_params() {
        let store = training_store();
        let mut model = test_model(&store);
        let before = model.params.clone();
        let trainer = Trainer::new(TrainerOptions {
            epochs: 2,
            batch_size: 4,
        });
        let examples = examples_for(&store, 10);
        let outcome = trainer.train(&mut model, &store, &examples).unwrap();

        assert_eq!(outcome.epochs_run, 2);
        assert!(outcome.final_loss.is_finite());
        assert!(!outcome.td_errors.is_empty());
        if outcome.rolled_back {
            // Degradation restores the pre-training snapshot exactly.
            assert_eq!(before, model.params);
        } else {
            assert_ne!(before, model.params);
        }
    }

    #[test]
    fn unknown_candidates_are_registered_with_hash_embeddings() {
        let store = training_store();
        let mut model = test_model(&store);
        let embedder = HashEmbedder::new(8);
        let trainer = Trainer::new(TrainerOptions {
            epochs: 1,
            batch_size: 2,
        });
        let example = TrainingExample {
            intent_embedding: embedder.embed("novel intent"),
            context_tools: vec!["brand_new_tool".into()],
            candidate_id: "never_seen".into(),
            outcome: 1,
            negative_candidates: Some(vec!["ingest".into()]),
            all_negatives_sorted_by_similarity: None,
        };
        trainer.train(&mut model, &store, &[example]).unwrap();
        assert!(store.has_node("never_seen"));
        assert!(store.has_node("brand_new_tool"));
        // The fallback embedding is the deterministic hash of the id.
        assert_eq!(
            store.tool("never_seen").unwrap().embedding,
            Some(embedder.embed("never_seen"))
        );
    }

    #[test]
    fn td_error_count_matches_sampled_indices() {
        // Every sampled index gets exactly one priority write-back.
        let store = training_store();
        let mut model = test_model(&store);
        let trainer = Trainer::new(TrainerOptions {
            epochs: 1,
            batch_size: 6,
        });
        let examples = examples_for(&store, 12);
        let outcome = trainer.train(&mut model, &store, &examples).unwrap();
        // 12 examples → 10 train / 2 test → 2 batches of 6 samples.
        assert_eq!(outcome.td_errors.len(), 12);
    }

    #[test]
    fn curriculum_tiers_follow_accuracy() {
        assert_eq!(curriculum_tier(None), Tier::Medium);
        assert_eq!(curriculum_tier(Some(0.2)), Tier::Easy);
        assert_eq!(curriculum_tier(Some(0.5)), Tier::Medium);
        assert_eq!(curriculum_tier(Some(0.8)), Tier::Hard);
    }

    #[test]
    fn pick_negatives_respects_tiers() {
        let sorted: Vec<String> = (0..9).map(|i| format!("n{i}")).collect();
        let mut rng = StdRng::seed_from_u64(1);

        let hard = pick_negatives(&sorted, Tier::Hard, 2, &mut rng);
        for n in &hard {
            assert!(["n0", "n1", "n2"].contains(&n.as_str()), "hard pick {n}");
        }
        let easy = pick_negatives(&sorted, Tier::Easy, 2, &mut rng);
        for n in &easy {
            assert!(["n6", "n7", "n8"].contains(&n.as_str()), "easy pick {n}");
        }
        let medium = pick_negatives(&sorted, Tier::Medium, 2, &mut rng);
        for n in &medium {
            assert!(["n3", "n4", "n5"].contains(&n.as_str()), "medium pick {n}");
        }
    }
}
