//! Symmetric eigensolver via cyclic Jacobi rotations.
//!
//! The Von-Neumann entropy metric needs the full spectrum of a (small)
//! normalized graph Laplacian. Cyclic Jacobi is exact enough, dependency-free,
//! and deterministic, which matters because the metric must be reproducible
//! for a given snapshot.

use crate::error::MathError;

use super::{MathResult, Matrix};

/// Default sweep limit for [`sym_eigenvalues`].
pub const DEFAULT_MAX_SWEEPS: usize = 64;

/// Default off-diagonal tolerance.
pub const DEFAULT_TOL: f32 = 1e-7;

/// Eigenvalues of a symmetric matrix, sorted descending.
///
/// Only the upper triangle of `a` is read. Fails with
/// [`MathError::NoConvergence`] if the off-diagonal mass does not fall below
/// `tol` within `max_sweeps` full sweeps.
pub fn sym_eigenvalues(a: &Matrix, max_sweeps: usize, tol: f32) -> MathResult<Vec<f32>> {
    let n = a.rows();
    if n != a.cols() {
        return Err(MathError::ShapeMismatch {
            op: "sym_eigenvalues",
            left_rows: a.rows(),
            left_cols: a.cols(),
            right_rows: a.cols(),
            right_cols: a.rows(),
        });
    }
    if n == 0 {
        return Ok(Vec::new());
    }
    if n == 1 {
        return Ok(vec![a.get(0, 0)]);
    }

    // Work on a copy; symmetrize from the upper triangle.
    let mut m = a.clone();
    for i in 0..n {
        for j in 0..i {
            let v = m.get(j, i);
            m.set(i, j, v);
        }
    }

    for _sweep in 0..max_sweeps {
        let off = off_diagonal_norm(&m);
        if off <= tol {
            let mut eig: Vec<f32> = (0..n).map(|i| m.get(i, i)).collect();
            eig.sort_by(|x, y| y.partial_cmp(x).unwrap_or(std::cmp::Ordering::Equal));
            return Ok(eig);
        }
        for p in 0..n - 1 {
            for q in p + 1..n {
                rotate(&mut m, p, q);
            }
        }
    }

    // One last check after the final sweep.
    if off_diagonal_norm(&m) <= tol * 10.0 {
        let mut eig: Vec<f32> = (0..n).map(|i| m.get(i, i)).collect();
        eig.sort_by(|x, y| y.partial_cmp(x).unwrap_or(std::cmp::Ordering::Equal));
        return Ok(eig);
    }
    Err(MathError::NoConvergence {
        iterations: max_sweeps,
    })
}

fn off_diagonal_norm(m: &Matrix) -> f32 {
    let n = m.rows();
    let mut acc = 0.0;
    for i in 0..n {
        for j in i + 1..n {
            let v = m.get(i, j);
            acc += v * v;
        }
    }
    acc.sqrt()
}

/// One Jacobi rotation zeroing `m[p][q]`.
fn rotate(m: &mut Matrix, p: usize, q: usize) {
    let apq = m.get(p, q);
    if apq.abs() < f32::MIN_POSITIVE {
        return;
    }
    let app = m.get(p, p);
    let aqq = m.get(q, q);
    let theta = (aqq - app) / (2.0 * apq);
    // Stable tangent choice: the smaller-magnitude root.
    let t = if theta >= 0.0 {
        1.0 / (theta + (1.0 + theta * theta).sqrt())
    } else {
        1.0 / (theta - (1.0 + theta * theta).sqrt())
    };
    let c = 1.0 / (1.0 + t * t).sqrt();
    let s = t * c;

    let n = m.rows();
    for k in 0..n {
        let akp = m.get(k, p);
        let akq = m.get(k, q);
        m.set(k, p, c * akp - s * akq);
        m.set(k, q, s * akp + c * akq);
    }
    for k in 0..n {
        let apk = m.get(p, k);
        let aqk = m.get(q, k);
        m.set(p, k, c * apk - s * aqk);
        m.set(q, k, s * apk + c * aqk);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(a: f32, b: f32, tol: f32) {
        assert!((a - b).abs() <= tol, "{a} vs {b}");
    }

    #[test]
    fn diagonal_matrix_eigenvalues() {
        let m = Matrix::from_vec(3, 3, vec![3.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 2.0]).unwrap();
        let eig = sym_eigenvalues(&m, DEFAULT_MAX_SWEEPS, DEFAULT_TOL).unwrap();
        assert_close(eig[0], 3.0, 1e-5);
        assert_close(eig[1], 2.0, 1e-5);
        assert_close(eig[2], 1.0, 1e-5);
    }

    #[test]
    fn two_by_two_known_spectrum() {
        // [[2,1],[1,2]] has eigenvalues 3 and 1.
        let m = Matrix::from_vec(2, 2, vec![2.0, 1.0, 1.0, 2.0]).unwrap();
        let eig = sym_eigenvalues(&m, DEFAULT_MAX_SWEEPS, DEFAULT_TOL).unwrap();
        assert_close(eig[0], 3.0, 1e-5);
        assert_close(eig[1], 1.0, 1e-5);
    }

    #[test]
    fn trace_is_preserved() {
        let m = Matrix::from_vec(
            4,
            4,
            vec![
                4.0, 1.0, 0.5, 0.0, //
                1.0, 3.0, 0.2, 0.1, //
                0.5, 0.2, 2.0, 0.3, //
                0.0, 0.1, 0.3, 1.0,
            ],
        )
        .unwrap();
        let eig = sym_eigenvalues(&m, DEFAULT_MAX_SWEEPS, DEFAULT_TOL).unwrap();
        let trace: f32 = (0..4).map(|i| m.get(i, i)).sum();
        let eig_sum: f32 = eig.iter().sum();
        assert_close(trace, eig_sum, 1e-4);
    }

    #[test]
    fn complete_graph_laplacian_spectrum() {
        // Normalized Laplacian of K5: eigenvalues {0, 5/4 ×4}.
        let n = 5;
        let mut m = Matrix::zeros(n, n);
        for i in 0..n {
            for j in 0..n {
                if i == j {
                    m.set(i, j, 1.0);
                } else {
                    m.set(i, j, -1.0 / 4.0);
                }
            }
        }
        let eig = sym_eigenvalues(&m, DEFAULT_MAX_SWEEPS, DEFAULT_TOL).unwrap();
        for v in &eig[..4] {
            assert_close(*v, 1.25, 1e-4);
        }
        assert_close(eig[4], 0.0, 1e-4);
    }

    #[test]
    fn empty_and_single() {
        assert!(sym_eigenvalues(&Matrix::zeros(0, 0), 8, 1e-6).unwrap().is_empty());
        let one = Matrix::from_vec(1, 1, vec![7.0]).unwrap();
        assert_eq!(sym_eigenvalues(&one, 8, 1e-6).unwrap(), vec![7.0]);
    }
}
