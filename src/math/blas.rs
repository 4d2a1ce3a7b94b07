//! CBLAS FFI kernel (feature `blas`).
//!
//! Wraps `cblas_sgemm` / `cblas_sgemv` / `cblas_sger` in row-major mode.
//! [`BlasKernel::probe`] runs a small sanity multiplication at startup;
//! a bad result (broken system BLAS, symbol resolution failure at load)
//! surfaces as [`MathError::BlasUnavailable`] and the caller falls back to
//! the scalar path.

use cblas_sys::{
    CBLAS_LAYOUT, CBLAS_TRANSPOSE, cblas_sgemm, cblas_sgemv, cblas_sger,
};

use crate::error::MathError;

use super::{MatKernel, MathResult, Matrix, scalar::ScalarKernel};

/// Kernel backed by the system CBLAS.
pub struct BlasKernel;

impl BlasKernel {
    /// Probe the BLAS library with a known product before trusting it.
    pub fn probe() -> MathResult<Self> {
        let kernel = BlasKernel;
        let a = Matrix::from_vec(2, 2, vec![1.0, 2.0, 3.0, 4.0]).expect("static shape");
        let b = Matrix::from_vec(2, 2, vec![5.0, 6.0, 7.0, 8.0]).expect("static shape");
        let c = kernel.matmul(&a, &b)?;
        let expected = [19.0f32, 22.0, 43.0, 50.0];
        for (got, want) in c.as_slice().iter().zip(expected) {
            if (got - want).abs() > 1e-3 {
                return Err(MathError::BlasUnavailable {
                    message: format!("sanity sgemm returned {got}, expected {want}"),
                });
            }
        }
        Ok(kernel)
    }
}

impl MatKernel for BlasKernel {
    fn backend(&self) -> super::Backend {
        super::Backend::Blas
    }

    fn matmul(&self, a: &Matrix, b: &Matrix) -> MathResult<Matrix> {
        if a.cols() != b.rows() {
            return Err(MathError::ShapeMismatch {
                op: "matmul",
                left_rows: a.rows(),
                left_cols: a.cols(),
                right_rows: b.rows(),
                right_cols: b.cols(),
            });
        }
        let (m, k, n) = (a.rows(), a.cols(), b.cols());
        let mut out = Matrix::zeros(m, n);
        unsafe {
            cblas_sgemm(
                CBLAS_LAYOUT::CblasRowMajor,
                CBLAS_TRANSPOSE::CblasNoTrans,
                CBLAS_TRANSPOSE::CblasNoTrans,
                m as i32,
                n as i32,
                k as i32,
                1.0,
                a.as_slice().as_ptr(),
                k as i32,
                b.as_slice().as_ptr(),
                n as i32,
                0.0,
                out.as_mut_slice().as_mut_ptr(),
                n as i32,
            );
        }
        Ok(out)
    }

    fn matmul_transpose(&self, a: &Matrix, b: &Matrix) -> MathResult<Matrix> {
        if a.cols() != b.cols() {
            return Err(MathError::ShapeMismatch {
                op: "matmul_transpose",
                left_rows: a.rows(),
                left_cols: a.cols(),
                right_rows: b.rows(),
                right_cols: b.cols(),
            });
        }
        let (m, k, n) = (a.rows(), a.cols(), b.rows());
        let mut out = Matrix::zeros(m, n);
        unsafe {
            cblas_sgemm(
                CBLAS_LAYOUT::CblasRowMajor,
                CBLAS_TRANSPOSE::CblasNoTrans,
                CBLAS_TRANSPOSE::CblasTrans,
                m as i32,
                n as i32,
                k as i32,
                1.0,
                a.as_slice().as_ptr(),
                k as i32,
                b.as_slice().as_ptr(),
                k as i32,
                0.0,
                out.as_mut_slice().as_mut_ptr(),
                n as i32,
            );
        }
        Ok(out)
    }

    fn matvec(&self, a: &Matrix, x: &[f32]) -> MathResult<Vec<f32>> {
        if x.len() != a.cols() {
            return ScalarKernel.matvec(a, x); // delegate for the error shape
        }
        let mut out = vec![0.0f32; a.rows()];
        unsafe {
            cblas_sgemv(
                CBLAS_LAYOUT::CblasRowMajor,
                CBLAS_TRANSPOSE::CblasNoTrans,
                a.rows() as i32,
                a.cols() as i32,
                1.0,
                a.as_slice().as_ptr(),
                a.cols() as i32,
                x.as_ptr(),
                1,
                0.0,
                out.as_mut_ptr(),
                1,
            );
        }
        Ok(out)
    }

    fn matvec_transpose(&self, a: &Matrix, x: &[f32]) -> MathResult<Vec<f32>> {
        if x.len() != a.rows() {
            return ScalarKernel.matvec_transpose(a, x);
        }
        let mut out = vec![0.0f32; a.cols()];
        unsafe {
            cblas_sgemv(
                CBLAS_LAYOUT::CblasRowMajor,
                CBLAS_TRANSPOSE::CblasTrans,
                a.rows() as i32,
                a.cols() as i32,
                1.0,
                a.as_slice().as_ptr(),
                a.cols() as i32,
                x.as_ptr(),
                1,
                0.0,
                out.as_mut_ptr(),
                1,
            );
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
            return ScalarKernel.outer_product_add(a, x, y, alpha);
        }
        let cols = a.cols() as i32;
        unsafe {
            cblas_sger(
                CBLAS_LAYOUT::CblasRowMajor,
                x.len() as i32,
                y.len() as i32,
                alpha,
                x.as_ptr(),
                1,
                y.as_ptr(),
                1,
                a.as_mut_slice().as_mut_ptr(),
                cols,
            );
        }
        Ok(())
    }
}
