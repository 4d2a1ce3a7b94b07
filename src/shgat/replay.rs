//! Prioritized experience replay.
//!
//! Examples are sampled proportionally to `priority = (|td| + ε)^α` through
//! a Fenwick tree over priorities, with stratified segment sampling so a
//! batch spans the priority mass evenly. Importance-sampling weights
//! `w_i = (N · P(i))^{-β} / max_j w_j` correct the bias; β anneals toward 1
//! over the run. `decay_priorities` periodically flattens the distribution
//! so easy examples are never starved out entirely.

use rand::Rng;
use rand::rngs::StdRng;

use crate::error::TrainError;

use super::TrainingExample;

/// One sampled batch: buffer indices and importance weights, index-aligned.
#[derive(Debug, Clone)]
pub struct SampleBatch {
    pub indices: Vec<usize>,
    pub weights: Vec<f32>,
}

/// Replay buffer with proportional prioritization.
pub struct PerBuffer {
    examples: Vec<TrainingExample>,
    priorities: Vec<f32>,
    fenwick: Vec<f32>,
    alpha: f32,
    epsilon: f32,
    max_priority: f32,
}

impl PerBuffer {
    /// Create an empty buffer with the given priority exponent and floor.
    pub fn new(alpha: f32, epsilon: f32) -> Self {
        Self {
            examples: Vec::new(),
            priorities: Vec::new(),
            fenwick: vec![0.0],
            alpha,
            epsilon,
            max_priority: 1.0,
        }
    }

    /// Number of stored examples.
    pub fn len(&self) -> usize {
        self.examples.len()
    }

    /// Whether the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.examples.is_empty()
    }

    /// Append an example at the current maximum priority, so new data is
    /// sampled at least once before its TD error is known.
    pub fn push(&mut self, example: TrainingExample) {
        self.examples.push(example);
        self.priorities.push(self.max_priority);
        self.fenwick.push(0.0);
        let idx = self.priorities.len() - 1;
        self.fenwick_add(idx, self.max_priority);
    }

    /// The stored example at a buffer index.
    pub fn example(&self, index: usize) -> &TrainingExample {
        &self.examples[index]
    }

    /// Sum of all priorities.
    pub fn total_priority(&self) -> f32 {
        self.fenwick_prefix(self.priorities.len())
    }

    /// Sample a batch with stratified proportional sampling.
    ///
    /// Returns indices and normalized importance weights; fails on an empty
    /// buffer.
    pub fn sample(
        &self,
        rng: &mut StdRng,
        batch_size: usize,
        beta: f32,
    ) -> Result<SampleBatch, TrainError> {
        if self.is_empty() {
            return Err(TrainError::EmptyBuffer);
        }
        let total = self.total_priority();
        let n = self.len() as f32;
        let segment = total / batch_size as f32;

        let mut indices = Vec::with_capacity(batch_size);
        let mut weights = Vec::with_capacity(batch_size);
        for b in 0..batch_size {
            let lo = segment * b as f32;
            let target = lo + rng.gen_range(0.0..segment.max(f32::MIN_POSITIVE));
            let idx = self.fenwick_find(target.min(total - f32::MIN_POSITIVE));
            let p = self.priorities[idx] / total;
            indices.push(idx);
            weights.push((n * p.max(f32::MIN_POSITIVE)).powf(-beta));
        }

        let max_w = weights.iter().copied().fold(f32::MIN_POSITIVE, f32::max);
        for w in &mut weights {
            *w /= max_w;
        }
        Ok(SampleBatch { indices, weights })
    }

    /// Write back `(|td| + ε)^α` for each sampled index.
    ///
    /// `indices` and `td_errors` must be index-aligned and equally long.
    pub fn update_priorities(&mut self, indices: &[usize], td_errors: &[f32]) {
        debug_assert_eq!(indices.len(), td_errors.len());
        for (idx, td) in indices.iter().zip(td_errors) {
            let new = (td.abs() + self.epsilon).powf(self.alpha);
            self.set_priority(*idx, new);
            if new > self.max_priority {
                self.max_priority = new;
            }
        }
    }

    /// Multiply every priority by `factor`, respecting the ε floor.
    ///
    /// The floor keeps every example sampleable; above it the total priority
    /// scales exactly by `factor`.
    pub fn decay_priorities(&mut self, factor: f32) {
        let floor = self.epsilon.powf(self.alpha);
        for idx in 0..self.priorities.len() {
            let decayed = (self.priorities[idx] * factor).max(floor);
            self.set_priority(idx, decayed);
        }
        self.max_priority = self
            .priorities
            .iter()
            .copied()
            .fold(floor, f32::max);
    }

    fn set_priority(&mut self, idx: usize, value: f32) {
        let delta = value - self.priorities[idx];
        self.priorities[idx] = value;
        self.fenwick_add(idx, delta);
    }

    // -----------------------------------------------------------------------
    // Fenwick tree (1-based internally)
    // -----------------------------------------------------------------------

    fn fenwick_add(&mut self, idx: usize, delta: f32) {
        let mut i = idx + 1;
        while i < self.fenwick.len() {
            self.fenwick[i] += delta;
            i += i & i.wrapping_neg();
        }
    }

    fn fenwick_prefix(&self, count: usize) -> f32 {
        let mut acc = 0.0;
        let mut i = count;
        while i > 0 {
            acc += self.fenwick[i];
            i -= i & i.wrapping_neg();
        }
        acc
    }

    /// Smallest index whose prefix sum exceeds `target`.
    fn fenwick_find(&self, target: f32) -> usize {
        let mut target = target.max(0.0);
        let mut pos = 0usize;
        let mut bit = self.fenwick.len().next_power_of_two() / 2;
        while bit > 0 {
            let next = pos + bit;
            if next < self.fenwick.len() && self.fenwick[next] <= target {
                target -= self.fenwick[next];
                pos = next;
            }
            bit /= 2;
        }
        pos.min(self.priorities.len().saturating_sub(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn example(id: &str) -> TrainingExample {
        TrainingExample {
            intent_embedding: vec![0.0; 4],
            context_tools: Vec::new(),
            candidate_id: id.into(),
            outcome: 1,
            negative_candidates: None,
            all_negatives_sorted_by_similarity: None,
        }
    }

    fn filled_buffer(n: usize) -> PerBuffer {
        let mut buffer = PerBuffer::new(0.6, 0.01);
        for i in 0..n {
            buffer.push(example(&format!("cap{i}")));
        }
        buffer
    }

    #[test]
    fn sample_from_empty_buffer_fails() {
        let buffer = PerBuffer::new(0.6, 0.01);
        let mut rng = StdRng::seed_from_u64(1);
        assert!(matches!(
            buffer.sample(&mut rng, 4, 0.4),
            Err(TrainError::EmptyBuffer)
        ));
    }

    #[test]
    fn batch_size_and_weight_alignment() {
        let buffer = filled_buffer(10);
        let mut rng = StdRng::seed_from_u64(2);
        let batch = buffer.sample(&mut rng, 4, 0.4).unwrap();
        assert_eq!(batch.indices.len(), 4);
        assert_eq!(batch.weights.len(), 4);
        for w in &batch.weights {
            assert!(*w > 0.0 && *w <= 1.0 + 1e-6);
        }
        assert!(batch.weights.iter().any(|w| (*w - 1.0).abs() < 1e-6));
    }

    #[test]
    fn update_priorities_changes_sampling_mass() {
        let mut buffer = filled_buffer(4);
        // Make index 3 dominate.
        buffer.update_priorities(&[0, 1, 2, 3], &[0.0, 0.0, 0.0, 10.0]);
        let mut rng = StdRng::seed_from_u64(3);
        let mut hits = 0usize;
        for _ in 0..200 {
            let batch = buffer.sample(&mut rng, 1, 0.4).unwrap();
            if batch.indices[0] == 3 {
                hits += 1;
            }
        }
        assert!(hits > 150, "high-priority example sampled only {hits}/200");
    }

    #[test]
    fn priority_formula_uses_alpha_and_epsilon() {
        let mut buffer = filled_buffer(2);
        buffer.update_priorities(&[0], &[0.5]);
        let expected = (0.5f32 + 0.01).powf(0.6);
        assert!((buffer.priorities[0] - expected).abs() < 1e-6);
    }

    #[test]
    fn decay_scales_total_priority() {
        let mut buffer = filled_buffer(8);
        buffer.update_priorities(
            &[0, 1, 2, 3, 4, 5, 6, 7],
            &[1.0, 2.0, 0.5, 0.7, 1.5, 3.0, 0.9, 1.1],
        );
        let before = buffer.total_priority();
        buffer.decay_priorities(0.5);
        let after = buffer.total_priority();
        // Well above the ε floor, the total scales exactly by the factor.
        assert!((after - before * 0.5).abs() / before < 1e-3);
    }

    #[test]
    fn decay_respects_epsilon_floor() {
        let mut buffer = filled_buffer(3);
        for _ in 0..50 {
            buffer.decay_priorities(0.1);
        }
        let floor = 0.01f32.powf(0.6);
        for p in &buffer.priorities {
            assert!(*p >= floor - 1e-9);
        }
        // Still sampleable.
        let mut rng = StdRng::seed_from_u64(4);
        assert!(buffer.sample(&mut rng, 2, 1.0).is_ok());
    }

    #[test]
    fn fenwick_find_covers_all_indices() {
        let buffer = filled_buffer(7);
        let mut rng = StdRng::seed_from_u64(5);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..500 {
            let batch = buffer.sample(&mut rng, 7, 0.4).unwrap();
            seen.extend(batch.indices);
        }
        assert_eq!(seen.len(), 7, "uniform priorities must reach every index");
    }
}
