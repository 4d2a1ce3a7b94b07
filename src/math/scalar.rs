//! Portable scalar kernels.
//!
//! The reference implementation for every [`MatKernel`] operation. Always
//! available; the accelerated backends are checked against it.

use crate::error::MathError;

use super::{MatKernel, MathResult, Matrix};

/// Pure-Rust kernel using straightforward loops.
///
/// The inner loops are written to let LLVM auto-vectorize: contiguous
/// row-major accesses, no bounds checks in the hot path.
pub struct ScalarKernel;

impl ScalarKernel {
    fn check_matmul(a: &Matrix, b: &Matrix, op: &'static str) -> MathResult<()> {
        if a.cols() != b.rows() {
            return Err(MathError::ShapeMismatch {
                op,
                left_rows: a.rows(),
                left_cols: a.cols(),
                right_rows: b.rows(),
                right_cols: b.cols(),
            });
        }
        Ok(())
    }

    fn check_vec(a: &Matrix, len: usize, expected: usize, op: &'static str) -> MathResult<()> {
        if len != expected {
            return Err(MathError::ShapeMismatch {
                op,
                left_rows: a.rows(),
                left_cols: a.cols(),
                right_rows: len,
                right_cols: 1,
            });
        }
        Ok(())
    }
}

impl MatKernel for ScalarKernel {
    fn backend(&self) -> super::Backend {
        super::Backend::Scalar
    }

    fn matmul(&self, a: &Matrix, b: &Matrix) -> MathResult<Matrix> {
        Self::check_matmul(a, b, "matmul")?;
        let (m, k, n) = (a.rows(), a.cols(), b.cols());
        let mut out = Matrix::zeros(m, n);
        // ikj order: the innermost loop walks both b and out rows contiguously.
        for i in 0..m {
            let a_row = a.row(i);
            for p in 0..k {
                let a_ip = a_row[p];
                if a_ip == 0.0 {
                    continue;
                }
                let b_row = b.row(p);
                let out_row = out.row_mut(i);
                for j in 0..n {
                    out_row[j] += a_ip * b_row[j];
                }
            }
        }
        Ok(out)
    }

    fn matmul_transpose(&self, a: &Matrix, b: &Matrix) -> MathResult<Matrix> {
        // A: m×k, B: n×k, result m×n.
        if a.cols() != b.cols() {
            return Err(MathError::ShapeMismatch {
                op: "matmul_transpose",
                left_rows: a.rows(),
                left_cols: a.cols(),
                right_rows: b.rows(),
                right_cols: b.cols(),
            });
        }
        let (m, n) = (a.rows(), b.rows());
        let mut out = Matrix::zeros(m, n);
        for i in 0..m {
            let a_row = a.row(i);
            let out_row = out.row_mut(i);
            for j in 0..n {
                let b_row = b.row(j);
                let mut acc = 0.0;
                for p in 0..a_row.len() {
                    acc += a_row[p] * b_row[p];
                }
                out_row[j] = acc;
            }
        }
        Ok(out)
    }

    fn matvec(&self, a: &Matrix, x: &[f32]) -> MathResult<Vec<f32>> {
        Self::check_vec(a, x.len(), a.cols(), "matvec")?;
        let mut out = Vec::with_capacity(a.rows());
        for i in 0..a.rows() {
            let row = a.row(i);
            let mut acc = 0.0;
            for p in 0..row.len() {
                acc += row[p] * x[p];
            }
            out.push(acc);
        }
        Ok(out)
    }

    fn matvec_transpose(&self, a: &Matrix, x: &[f32]) -> MathResult<Vec<f32>> {
        Self::check_vec(a, x.len(), a.rows(), "matvec_transpose")?;
        let mut out = vec![0.0; a.cols()];
        for i in 0..a.rows() {
            let xi = x[i];
            if xi == 0.0 {
                continue;
            }
            let row = a.row(i);
            for (o, &v) in out.iter_mut().zip(row) {
                *o += xi * v;
            }
        }
        Ok(out)
    }

    fn outer_product_add(
        &self,
        a: &mut Matrix,
        x: &[f32],
        y: &[f32],
        alpha: f32,
    ) -> MathResult<()> {
        if x.len() != a.rows() || y.len() != a.cols() {
            return Err(MathError::ShapeMismatch {
                op: "outer_product_add",
                left_rows: a.rows(),
                left_cols: a.cols(),
                right_rows: x.len(),
                right_cols: y.len(),
            });
        }
        for i in 0..x.len() {
            let scale = alpha * x[i];
            if scale == 0.0 {
                continue;
            }
            let row = a.row_mut(i);
            for (r, &yv) in row.iter_mut().zip(y) {
                *r += scale * yv;
            }
        }
        Ok(())
    }
}
