//! Dense math kernels for the SHGAT model and emergence metrics.
//!
//! This module provides a [`MatKernel`] trait with backend-specific
//! implementations. At runtime, [`best_kernel`] probes the available backends
//! and returns the fastest one for the current build.
//!
//! # Supported backends
//!
//! - **Scalar**: Pure-Rust portable loops — works everywhere
//! - **Blas**: CBLAS FFI (feature `blas`), used only above per-kernel size
//!   thresholds; both paths agree within `1e-4` per element
//!
//! All matrices are row-major `f32` ([`Matrix`]). Elementwise activation
//! helpers live in [`funcs`]; the symmetric eigensolver in [`eigen`].

pub mod eigen;
pub mod funcs;
pub mod scalar;

#[cfg(feature = "blas")]
pub mod blas;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::MathError;

pub use eigen::sym_eigenvalues;
pub use funcs::{
    concat_heads, cosine_similarity, dot, dropout, elu, layer_norm, leaky_relu,
    leaky_relu_derivative, mean_pool, normalize_l2, sigmoid, softmax, softmax_jacobian_vecmul,
};

/// Result type for math operations.
pub type MathResult<T> = std::result::Result<T, MathError>;

/// Matmul switches to BLAS when the largest dimension reaches this size.
pub const MATMUL_BLAS_MIN_DIM: usize = 64;
/// Matvec and outer-product switch to BLAS at this size.
pub const MATVEC_BLAS_MIN_DIM: usize = 256;

// ---------------------------------------------------------------------------
// Matrix
// ---------------------------------------------------------------------------

/// Dense row-major `f32` matrix.
///
/// The single storage type for every weight, activation, and incidence
/// matrix in the crate. Flat `Vec<f32>` keeps the data contiguous for the
/// kernels and trivially serializable for parameter export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Matrix {
    rows: usize,
    cols: usize,
    data: Vec<f32>,
}

impl Matrix {
    /// Create a zero matrix.
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            data: vec![0.0; rows * cols],
        }
    }

    /// Create a matrix from a flat row-major buffer.
    ///
    /// `data.len()` must equal `rows * cols`.
    pub fn from_vec(rows: usize, cols: usize, data: Vec<f32>) -> MathResult<Self> {
        if data.len() != rows * cols {
            return Err(MathError::ShapeMismatch {
                op: "from_vec",
                left_rows: rows,
                left_cols: cols,
                right_rows: data.len(),
                right_cols: 1,
            });
        }
        Ok(Self { rows, cols, data })
    }

    /// Identity-like rectangular matrix: ones on the main diagonal.
    pub fn eye(rows: usize, cols: usize) -> Self {
        let mut m = Self::zeros(rows, cols);
        for i in 0..rows.min(cols) {
            m.data[i * cols + i] = 1.0;
        }
        m
    }

    /// Number of rows.
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Number of columns.
    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Element at `(r, c)`.
    #[inline]
    pub fn get(&self, r: usize, c: usize) -> f32 {
        self.data[r * self.cols + c]
    }

    /// Set element at `(r, c)`.
    #[inline]
    pub fn set(&mut self, r: usize, c: usize, v: f32) {
        self.data[r * self.cols + c] = v;
    }

    /// Row `r` as a slice.
    #[inline]
    pub fn row(&self, r: usize) -> &[f32] {
        &self.data[r * self.cols..(r + 1) * self.cols]
    }

    /// Row `r` as a mutable slice.
    #[inline]
    pub fn row_mut(&mut self, r: usize) -> &mut [f32] {
        &mut self.data[r * self.cols..(r + 1) * self.cols]
    }

    /// The flat row-major buffer.
    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    /// The flat row-major buffer, mutable.
    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        &mut self.data
    }

    /// Consume into the flat buffer.
    pub fn into_vec(self) -> Vec<f32> {
        self.data
    }

    /// Transposed copy.
    pub fn transposed(&self) -> Matrix {
        let mut out = Matrix::zeros(self.cols, self.rows);
        for r in 0..self.rows {
            for c in 0..self.cols {
                out.data[c * self.rows + r] = self.data[r * self.cols + c];
            }
        }
        out
    }

    /// In-place `self += alpha * other`. Shapes must match.
    pub fn add_scaled(&mut self, other: &Matrix, alpha: f32) -> MathResult<()> {
        if self.rows != other.rows || self.cols != other.cols {
            return Err(MathError::ShapeMismatch {
                op: "add_scaled",
                left_rows: self.rows,
                left_cols: self.cols,
                right_rows: other.rows,
                right_cols: other.cols,
            });
        }
        for (a, b) in self.data.iter_mut().zip(&other.data) {
            *a += alpha * b;
        }
        Ok(())
    }

    /// Frobenius norm.
    pub fn frobenius_norm(&self) -> f32 {
        self.data.iter().map(|v| v * v).sum::<f32>().sqrt()
    }

    /// Scale every element in place.
    pub fn scale(&mut self, factor: f32) {
        for v in &mut self.data {
            *v *= factor;
        }
    }
}

// ---------------------------------------------------------------------------
// Kernel trait & dispatch
// ---------------------------------------------------------------------------

/// Which backend a kernel runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Backend {
    /// Pure-Rust portable loops.
    Scalar,
    /// CBLAS FFI.
    Blas,
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Backend::Scalar => write!(f, "Scalar (portable)"),
            Backend::Blas => write!(f, "BLAS (FFI)"),
        }
    }
}

/// Trait for dense matrix kernels.
///
/// Implementations must validate shapes and may assume row-major layout.
pub trait MatKernel: Send + Sync {
    /// The backend this kernel targets.
    fn backend(&self) -> Backend;

    /// `C = A · B`.
    fn matmul(&self, a: &Matrix, b: &Matrix) -> MathResult<Matrix>;

    /// `C = A · Bᵀ`.
    fn matmul_transpose(&self, a: &Matrix, b: &Matrix) -> MathResult<Matrix>;

    /// `y = A · x`.
    fn matvec(&self, a: &Matrix, x: &[f32]) -> MathResult<Vec<f32>>;

    /// `y = Aᵀ · x`.
    fn matvec_transpose(&self, a: &Matrix, x: &[f32]) -> MathResult<Vec<f32>>;

    /// `A ← A + alpha · x · yᵀ`.
    fn outer_product_add(
        &self,
        a: &mut Matrix,
        x: &[f32],
        y: &[f32],
        alpha: f32,
    ) -> MathResult<()>;
}

/// Kernel that routes each call to BLAS or scalar by operand size.
///
/// Small operands stay on the scalar path: the FFI call overhead dominates
/// below the thresholds. The two paths agree within `1e-4` per element.
pub struct DispatchKernel {
    scalar: scalar::ScalarKernel,
    #[cfg(feature = "blas")]
    blas: Option<blas::BlasKernel>,
}

impl DispatchKernel {
    /// Build a dispatch kernel, probing the BLAS backend when compiled in.
    pub fn new() -> Self {
        #[cfg(feature = "blas")]
        {
            let blas = match blas::BlasKernel::probe() {
                Ok(k) => Some(k),
                Err(e) => {
                    tracing::warn!(error = %e, "BLAS probe failed; using scalar kernels");
                    None
                }
            };
            Self {
                scalar: scalar::ScalarKernel,
                blas,
            }
        }
        #[cfg(not(feature = "blas"))]
        Self {
            scalar: scalar::ScalarKernel,
        }
    }

    #[cfg(feature = "blas")]
    fn pick(&self, largest_dim: usize, threshold: usize) -> &dyn MatKernel {
        match &self.blas {
            Some(b) if largest_dim >= threshold => b,
            _ => &self.scalar,
        }
    }

    #[cfg(not(feature = "blas"))]
    fn pick(&self, _largest_dim: usize, _threshold: usize) -> &dyn MatKernel {
        &self.scalar
    }
}

impl Default for DispatchKernel {
    fn default() -> Self {
        Self::new()
    }
}

impl MatKernel for DispatchKernel {
    fn backend(&self) -> Backend {
        #[cfg(feature = "blas")]
        if self.blas.is_some() {
            return Backend::Blas;
        }
        Backend::Scalar
    }

    fn matmul(&self, a: &Matrix, b: &Matrix) -> MathResult<Matrix> {
        let dim = a.rows().max(a.cols()).max(b.cols());
        self.pick(dim, MATMUL_BLAS_MIN_DIM).matmul(a, b)
    }

    fn matmul_transpose(&self, a: &Matrix, b: &Matrix) -> MathResult<Matrix> {
        let dim = a.rows().max(a.cols()).max(b.rows());
        self.pick(dim, MATMUL_BLAS_MIN_DIM).matmul_transpose(a, b)
    }

    fn matvec(&self, a: &Matrix, x: &[f32]) -> MathResult<Vec<f32>> {
        let dim = a.rows().max(a.cols());
        self.pick(dim, MATVEC_BLAS_MIN_DIM).matvec(a, x)
    }

    fn matvec_transpose(&self, a: &Matrix, x: &[f32]) -> MathResult<Vec<f32>> {
        let dim = a.rows().max(a.cols());
        self.pick(dim, MATVEC_BLAS_MIN_DIM).matvec_transpose(a, x)
    }

    fn outer_product_add(
        &self,
        a: &mut Matrix,
        x: &[f32],
        y: &[f32],
        alpha: f32,
    ) -> MathResult<()> {
        let dim = a.rows().max(a.cols());
        self.pick(dim, MATVEC_BLAS_MIN_DIM)
            .outer_product_add(a, x, y, alpha)
    }
}

/// Return the best available kernel for the current build.
///
/// BLAS probe failure is logged and falls back to the scalar path; it never
/// fails the caller.
pub fn best_kernel() -> Arc<dyn MatKernel> {
    let kernel = DispatchKernel::new();
    tracing::debug!(backend = %kernel.backend(), "selected math kernel");
    Arc::new(kernel)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random_matrix(rng: &mut StdRng, rows: usize, cols: usize) -> Matrix {
        let data = (0..rows * cols).map(|_| rng.gen_range(-1.0..1.0)).collect();
        Matrix::from_vec(rows, cols, data).unwrap()
    }

    /// Run the full kernel test suite against any implementation.
    pub fn kernel_conformance_tests(kernel: &dyn MatKernel) {
        // 2x3 · 3x2
        let a = Matrix::from_vec(2, 3, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        let b = Matrix::from_vec(3, 2, vec![7.0, 8.0, 9.0, 10.0, 11.0, 12.0]).unwrap();
        let c = kernel.matmul(&a, &b).unwrap();
        assert_eq!(c.rows(), 2);
        assert_eq!(c.cols(), 2);
        assert_eq!(c.as_slice(), &[58.0, 64.0, 139.0, 154.0]);

        // matmul_transpose: A · Bᵀ where B is 2x3
        let bt = Matrix::from_vec(2, 3, vec![7.0, 9.0, 11.0, 8.0, 10.0, 12.0]).unwrap();
        let c2 = kernel.matmul_transpose(&a, &bt).unwrap();
        assert_eq!(c2.as_slice(), c.as_slice());

        // shape mismatch is rejected
        assert!(kernel.matmul(&a, &a).is_err());

        // matvec
        let y = kernel.matvec(&a, &[1.0, 0.0, -1.0]).unwrap();
        assert_eq!(y, vec![-2.0, -2.0]);

        // matvec_transpose
        let yt = kernel.matvec_transpose(&a, &[1.0, 1.0]).unwrap();
        assert_eq!(yt, vec![5.0, 7.0, 9.0]);

        // outer_product_add
        let mut acc = Matrix::zeros(2, 3);
        kernel
            .outer_product_add(&mut acc, &[1.0, 2.0], &[3.0, 4.0, 5.0], 0.5)
            .unwrap();
        assert_eq!(acc.as_slice(), &[1.5, 2.0, 2.5, 3.0, 4.0, 5.0]);
    }

    #[test]
    fn scalar_kernel_conformance() {
        kernel_conformance_tests(&scalar::ScalarKernel);
    }

    #[test]
    fn dispatch_kernel_conformance() {
        kernel_conformance_tests(&DispatchKernel::new());
    }

    #[cfg(feature = "blas")]
    #[test]
    fn blas_kernel_conformance() {
        if let Ok(k) = blas::BlasKernel::probe() {
            kernel_conformance_tests(&k);
        }
    }

    #[cfg(feature = "blas")]
    #[test]
    fn blas_and_scalar_agree_within_tolerance() {
        let Ok(blas) = blas::BlasKernel::probe() else {
            return;
        };
        let scalar = scalar::ScalarKernel;
        let mut rng = StdRng::seed_from_u64(42);
        for &(m, k, n) in &[(8usize, 16usize, 8usize), (64, 64, 64), (200, 256, 100)] {
            let a = random_matrix(&mut rng, m, k);
            let b = random_matrix(&mut rng, k, n);
            let cs = scalar.matmul(&a, &b).unwrap();
            let cb = blas.matmul(&a, &b).unwrap();
            for (x, y) in cs.as_slice().iter().zip(cb.as_slice()) {
                assert!((x - y).abs() <= 1e-4, "scalar/BLAS divergence: {x} vs {y}");
            }
        }
    }

    #[test]
    fn transpose_roundtrip() {
        let mut rng = StdRng::seed_from_u64(7);
        let a = random_matrix(&mut rng, 5, 9);
        assert_eq!(a.transposed().transposed(), a);
    }

    #[test]
    fn eye_projects_identity() {
        let kernel = scalar::ScalarKernel;
        let id = Matrix::eye(3, 3);
        let x = vec![1.0, -2.0, 3.0];
        assert_eq!(kernel.matvec(&id, &x).unwrap(), x);
    }
}
