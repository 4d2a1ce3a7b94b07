//! Elementwise activations and vector helpers.
//!
//! These are the non-matrix pieces of the forward and backward passes:
//! activations, pooling, dropout, and the softmax Jacobian contraction
//! used by the attention backward path.

use rand::Rng;

/// Numerically stable in-place softmax (subtract-max).
///
/// An empty slice is left untouched.
pub fn softmax(xs: &mut [f32]) {
    if xs.is_empty() {
        return;
    }
    let max = xs.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0.0;
    for x in xs.iter_mut() {
        *x = (*x - max).exp();
        sum += *x;
    }
    if sum > 0.0 {
        for x in xs.iter_mut() {
            *x /= sum;
        }
    }
}

/// Apply the softmax Jacobian `diag(p) - p·pᵀ` to an upstream gradient.
///
/// `p` is the softmax output, `dy` the gradient w.r.t. the probabilities;
/// returns the gradient w.r.t. the logits: `p ⊙ (dy − ⟨p, dy⟩)`.
pub fn softmax_jacobian_vecmul(p: &[f32], dy: &[f32]) -> Vec<f32> {
    debug_assert_eq!(p.len(), dy.len());
    let inner = dot(p, dy);
    p.iter().zip(dy).map(|(&pi, &dyi)| pi * (dyi - inner)).collect()
}

/// Logistic sigmoid.
#[inline]
pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Leaky ReLU with the given negative slope.
#[inline]
pub fn leaky_relu(x: f32, slope: f32) -> f32 {
    if x >= 0.0 { x } else { slope * x }
}

/// Derivative of leaky ReLU at the pre-activation value.
#[inline]
pub fn leaky_relu_derivative(x: f32, slope: f32) -> f32 {
    if x >= 0.0 { 1.0 } else { slope }
}

/// Exponential linear unit (alpha = 1).
#[inline]
pub fn elu(x: f32) -> f32 {
    if x >= 0.0 { x } else { x.exp_m1() }
}

/// Derivative of ELU at the pre-activation value.
#[inline]
pub fn elu_derivative(x: f32) -> f32 {
    if x >= 0.0 { 1.0 } else { x.exp() }
}

/// Dot product. Slices must have equal length.
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Cosine similarity in `[-1, 1]`; zero vectors yield 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let na = dot(a, a).sqrt();
    let nb = dot(b, b).sqrt();
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    (dot(a, b) / (na * nb)).clamp(-1.0, 1.0)
}

/// Mean of a set of equal-length rows. Empty input yields an empty vector.
pub fn mean_pool(rows: &[&[f32]]) -> Vec<f32> {
    let Some(first) = rows.first() else {
        return Vec::new();
    };
    let mut out = vec![0.0; first.len()];
    for row in rows {
        for (o, v) in out.iter_mut().zip(*row) {
            *o += v;
        }
    }
    let scale = 1.0 / rows.len() as f32;
    for o in &mut out {
        *o *= scale;
    }
    out
}

/// Concatenate per-head vectors into one `heads · head_dim` vector.
pub fn concat_heads(heads: &[Vec<f32>]) -> Vec<f32> {
    let mut out = Vec::with_capacity(heads.iter().map(Vec::len).sum());
    for h in heads {
        out.extend_from_slice(h);
    }
    out
}

/// Inverted dropout: zero each element with probability `p`, scale the
/// survivors by `1/(1-p)`. Returns the keep-mask for the backward pass.
///
/// `p` outside `(0, 1)` keeps everything.
pub fn dropout<R: Rng>(xs: &mut [f32], p: f32, rng: &mut R) -> Vec<bool> {
    if p <= 0.0 || p >= 1.0 {
        return vec![true; xs.len()];
    }
    let scale = 1.0 / (1.0 - p);
    let mut mask = Vec::with_capacity(xs.len());
    for x in xs.iter_mut() {
        let keep = rng.gen_range(0.0..1.0) >= p;
        if keep {
            *x *= scale;
        } else {
            *x = 0.0;
        }
        mask.push(keep);
    }
    mask
}

/// L2-normalize in place; zero vectors are left untouched.
pub fn normalize_l2(xs: &mut [f32]) {
    let norm = dot(xs, xs).sqrt();
    if norm > 0.0 {
        for x in xs.iter_mut() {
            *x /= norm;
        }
    }
}

/// Layer normalization in place (zero mean, unit variance, no affine).
pub fn layer_norm(xs: &mut [f32], eps: f32) {
    if xs.is_empty() {
        return;
    }
    let n = xs.len() as f32;
    let mean = xs.iter().sum::<f32>() / n;
    let var = xs.iter().map(|x| (x - mean) * (x - mean)).sum::<f32>() / n;
    let denom = (var + eps).sqrt();
    for x in xs.iter_mut() {
        *x = (*x - mean) / denom;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn softmax_sums_to_one() {
        let mut xs = vec![1.0, 2.0, 3.0];
        softmax(&mut xs);
        let sum: f32 = xs.iter().sum();
        assert!((sum - 1.0).abs() < 1e-6);
        assert!(xs[2] > xs[1] && xs[1] > xs[0]);
    }

    #[test]
    fn softmax_is_shift_invariant() {
        let mut a = vec![1.0, 2.0, 3.0];
        let mut b = vec![1001.0, 1002.0, 1003.0];
        softmax(&mut a);
        softmax(&mut b);
        for (x, y) in a.iter().zip(&b) {
            assert!((x - y).abs() < 1e-6);
        }
    }

    #[test]
    fn softmax_jacobian_rows_sum_to_zero() {
        // Against a constant upstream gradient the logit gradient vanishes:
        // softmax is invariant to constant shifts.
        let mut p = vec![0.5, 1.5, -0.5];
        softmax(&mut p);
        let dx = softmax_jacobian_vecmul(&p, &[1.0, 1.0, 1.0]);
        for v in dx {
            assert!(v.abs() < 1e-6);
        }
    }

    #[test]
    fn sigmoid_midpoint() {
        assert!((sigmoid(0.0) - 0.5).abs() < 1e-7);
        assert!(sigmoid(10.0) > 0.999);
        assert!(sigmoid(-10.0) < 0.001);
    }

    #[test]
    fn leaky_relu_slope() {
        assert_eq!(leaky_relu(2.0, 0.2), 2.0);
        assert!((leaky_relu(-2.0, 0.2) - (-0.4)).abs() < 1e-7);
        assert_eq!(leaky_relu_derivative(1.0, 0.2), 1.0);
        assert_eq!(leaky_relu_derivative(-1.0, 0.2), 0.2);
    }

    #[test]
    fn cosine_similarity_bounds() {
        let a = vec![1.0, 0.0];
        let b = vec![0.0, 1.0];
        assert!((cosine_similarity(&a, &a) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&a, &b).abs() < 1e-6);
        assert_eq!(cosine_similarity(&a, &[0.0, 0.0]), 0.0);
    }

    #[test]
    fn mean_pool_averages() {
        let a = [1.0, 2.0];
        let b = [3.0, 4.0];
        let pooled = mean_pool(&[&a, &b]);
        assert_eq!(pooled, vec![2.0, 3.0]);
    }

    #[test]
    fn dropout_scales_survivors() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut xs = vec![1.0; 1000];
        let mask = dropout(&mut xs, 0.5, &mut rng);
        let kept = mask.iter().filter(|m| **m).count();
        assert!(kept > 400 && kept < 600);
        for (x, keep) in xs.iter().zip(&mask) {
            if *keep {
                assert!((x - 2.0).abs() < 1e-6);
            } else {
                assert_eq!(*x, 0.0);
            }
        }
    }

    #[test]
    fn normalize_l2_unit_norm() {
        let mut xs = vec![3.0, 4.0];
        normalize_l2(&mut xs);
        assert!((dot(&xs, &xs).sqrt() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn layer_norm_zero_mean() {
        let mut xs = vec![1.0, 2.0, 3.0, 4.0];
        layer_norm(&mut xs, 1e-5);
        let mean: f32 = xs.iter().sum::<f32>() / 4.0;
        assert!(mean.abs() < 1e-6);
    }
}
