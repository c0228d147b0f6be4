//! Small dense linear algebra on top of faer.
//!
//! Every function here is pure, so it can be called from concurrent level
//! evaluations without coordination.

use faer::linalg::solvers::Solve;
use faer::{Col, Mat, Side};

/// Inverse and log-determinant of a symmetric positive definite matrix.
#[derive(Debug, Clone)]
pub(crate) struct SpdFactor {
    pub(crate) inverse: Mat<f64>,
    pub(crate) log_det: f64,
}

/// Cholesky-based inverse, `None` if the matrix is not positive definite.
pub(crate) fn spd_factor(mat: &Mat<f64>) -> Option<SpdFactor> {
    let n = mat.nrows();
    if n == 0 {
        return Some(SpdFactor {
            inverse: Mat::zeros(0, 0),
            log_det: 0.,
        });
    }
    if !mat_all_finite(mat) {
        return None;
    }
    let llt = mat.as_ref().llt(Side::Lower).ok()?;
    let lower = llt.L();
    let mut log_det = 0f64;
    for i in 0..n {
        let pivot = lower[(i, i)];
        if !(pivot > 0.) {
            return None;
        }
        log_det += 2. * pivot.ln();
    }
    let identity = Mat::<f64>::identity(n, n);
    let mut inverse = llt.solve(identity.as_ref());
    symmetrize(&mut inverse);
    Some(SpdFactor { inverse, log_det })
}

/// Lower Cholesky factor.
pub(crate) fn cholesky_lower(mat: &Mat<f64>) -> Option<Mat<f64>> {
    let n = mat.nrows();
    if n == 0 {
        return Some(Mat::zeros(0, 0));
    }
    let llt = mat.as_ref().llt(Side::Lower).ok()?;
    let lower = llt.L();
    Some(Mat::from_fn(n, n, |i, j| if j <= i { lower[(i, j)] } else { 0. }))
}

/// Eigenvalues (ascending) and orthonormal eigenvectors of a symmetric matrix.
#[derive(Debug, Clone)]
pub(crate) struct SymmetricEigen {
    pub(crate) values: Vec<f64>,
    pub(crate) vectors: Mat<f64>,
}

pub(crate) fn symmetric_eigen(mat: &Mat<f64>) -> Option<SymmetricEigen> {
    if !mat_all_finite(mat) {
        return None;
    }
    let eig = mat.self_adjoint_eigen(Side::Lower).ok()?;
    let values = eig.S().column_vector().to_owned();
    Some(SymmetricEigen {
        values: values.iter().copied().collect(),
        vectors: eig.U().to_owned(),
    })
}

impl SymmetricEigen {
    /// `U diag(f(λ)) Uᵀ`
    pub(crate) fn map(&self, f: impl Fn(f64) -> f64) -> Mat<f64> {
        let mapped: Vec<f64> = self.values.iter().map(|&v| f(v)).collect();
        let u = &self.vectors;
        let n = mapped.len();
        let scaled = Mat::from_fn(n, n, |i, j| u[(i, j)] * mapped[j]);
        let mut out = &scaled * u.transpose();
        symmetrize(&mut out);
        out
    }

    /// `U (W ∘ (Uᵀ M U)) Uᵀ` for a weight matrix `W` in the eigenbasis.
    ///
    /// The result is symmetric only if both `M` and `W` are.
    pub(crate) fn weighted(&self, mat: &Mat<f64>, weight: impl Fn(usize, usize) -> f64) -> Mat<f64> {
        let u = &self.vectors;
        let rotated = u.transpose() * mat * u;
        let n = rotated.nrows();
        let weighted = Mat::from_fn(n, n, |i, j| weight(i, j) * rotated[(i, j)]);
        u * &weighted * u.transpose()
    }
}

/// `exp(-t A)` for a symmetric `A` given through its eigendecomposition.
pub(crate) fn expm_symmetric(eigen: &SymmetricEigen, t: f64) -> Mat<f64> {
    eigen.map(|lambda| (-lambda * t).exp())
}

/// `exp(-t diag(a))` on the elementwise fast path.
pub(crate) fn expm_diagonal(rates: &[f64], t: f64) -> Mat<f64> {
    let n = rates.len();
    Mat::from_fn(n, n, |i, j| if i == j { (-rates[i] * t).exp() } else { 0. })
}

pub(crate) fn mat_all_finite(mat: &Mat<f64>) -> bool {
    (0..mat.ncols()).all(|j| (0..mat.nrows()).all(|i| mat[(i, j)].is_finite()))
}

pub(crate) fn symmetrize(mat: &mut Mat<f64>) {
    let n = mat.nrows();
    for j in 0..n {
        for i in (j + 1)..n {
            let mean = 0.5 * (mat[(i, j)] + mat[(j, i)]);
            mat[(i, j)] = mean;
            mat[(j, i)] = mean;
        }
    }
}

pub(crate) fn col_from_slice(values: &[f64]) -> Col<f64> {
    Col::from_fn(values.len(), |i| values[i])
}

pub(crate) fn col_to_vec(col: &Col<f64>) -> Vec<f64> {
    col.iter().copied().collect()
}

pub(crate) fn dot(a: &Col<f64>, b: &Col<f64>) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// `aᵀ M b`
pub(crate) fn bilinear(a: &Col<f64>, mat: &Mat<f64>, b: &Col<f64>) -> f64 {
    dot(a, &(mat * b))
}

pub(crate) fn outer(a: &Col<f64>, b: &Col<f64>) -> Mat<f64> {
    Mat::from_fn(a.nrows(), b.nrows(), |i, j| a[i] * b[j])
}

pub(crate) fn scaled(mat: &Mat<f64>, factor: f64) -> Mat<f64> {
    Mat::from_fn(mat.nrows(), mat.ncols(), |i, j| factor * mat[(i, j)])
}

/// Frobenius inner product `Σ_ij A_ij B_ij`.
pub(crate) fn frobenius(a: &Mat<f64>, b: &Mat<f64>) -> f64 {
    let mut sum = 0.;
    for j in 0..a.ncols() {
        for i in 0..a.nrows() {
            sum += a[(i, j)] * b[(i, j)];
        }
    }
    sum
}

pub(crate) fn diagonal_matrix(values: &[f64]) -> Mat<f64> {
    let n = values.len();
    Mat::from_fn(n, n, |i, j| if i == j { values[i] } else { 0. })
}

pub(crate) fn is_diagonal(mat: &Mat<f64>) -> bool {
    let n = mat.nrows();
    (0..n).all(|i| (0..n).all(|j| i == j || mat[(i, j)] == 0.))
}

/// Submatrix with the given rows and columns.
pub(crate) fn select(mat: &Mat<f64>, rows: &[usize], cols: &[usize]) -> Mat<f64> {
    Mat::from_fn(rows.len(), cols.len(), |i, j| mat[(rows[i], cols[j])])
}

pub(crate) fn select_col(col: &Col<f64>, rows: &[usize]) -> Col<f64> {
    Col::from_fn(rows.len(), |i| col[rows[i]])
}

/// Inverse of [`select`]: place a block into a zero `dim × dim` matrix.
pub(crate) fn embed(block: &Mat<f64>, rows: &[usize], cols: &[usize], dim: usize) -> Mat<f64> {
    let mut out = Mat::zeros(dim, dim);
    for (i, &row) in rows.iter().enumerate() {
        for (j, &col) in cols.iter().enumerate() {
            out[(row, col)] = block[(i, j)];
        }
    }
    out
}

pub(crate) fn embed_col(block: &Col<f64>, rows: &[usize], dim: usize) -> Col<f64> {
    let mut out = Col::zeros(dim);
    for (i, &row) in rows.iter().enumerate() {
        out[row] = block[i];
    }
    out
}

#[cfg(test)]
mod test {
    use approx::assert_abs_diff_eq;
    use faer::Mat;
    use proptest::prelude::*;

    use super::*;

    fn spd(values: &[f64]) -> Mat<f64> {
        let n = (values.len() as f64).sqrt() as usize;
        let a = Mat::from_fn(n, n, |i, j| values[i * n + j]);
        let mut out = &a * a.transpose();
        for i in 0..n {
            out[(i, i)] += 1.;
        }
        out
    }

    #[test]
    fn factor_of_diagonal() {
        let mat = diagonal_matrix(&[2., 4., 8.]);
        let factor = spd_factor(&mat).unwrap();
        assert_abs_diff_eq!(factor.log_det, 64f64.ln(), epsilon = 1e-12);
        assert_abs_diff_eq!(factor.inverse[(1, 1)], 0.25, epsilon = 1e-12);
        assert_abs_diff_eq!(factor.inverse[(0, 2)], 0., epsilon = 1e-12);
    }

    #[test]
    fn factor_rejects_indefinite() {
        let mut mat = diagonal_matrix(&[1., 1.]);
        mat[(0, 1)] = 2.;
        mat[(1, 0)] = 2.;
        assert!(spd_factor(&mat).is_none());
        assert!(spd_factor(&diagonal_matrix(&[1., f64::NAN])).is_none());
    }

    #[test]
    fn diagonal_expm_matches_eigen_path() {
        let rates = [0.5, 2., 3.];
        let eigen = symmetric_eigen(&diagonal_matrix(&rates)).unwrap();
        let full = expm_symmetric(&eigen, 0.7);
        let fast = expm_diagonal(&rates, 0.7);
        for i in 0..3 {
            for j in 0..3 {
                assert_abs_diff_eq!(full[(i, j)], fast[(i, j)], epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn select_embed() {
        let mat = Mat::from_fn(3, 3, |i, j| (3 * i + j) as f64);
        let block = select(&mat, &[0, 2], &[0, 2]);
        assert_eq!(block[(1, 0)], 6.);
        let back = embed(&block, &[0, 2], &[0, 2], 3);
        assert_eq!(back[(2, 2)], 8.);
        assert_eq!(back[(1, 1)], 0.);
    }

    proptest! {
        #[test]
        fn factor_inverse_and_logdet(values in prop::collection::vec(-2f64..2f64, 9)) {
            let mat = spd(&values);
            let factor = spd_factor(&mat).unwrap();
            let eigen = symmetric_eigen(&mat).unwrap();
            let log_det: f64 = eigen.values.iter().map(|v| v.ln()).sum();
            prop_assert!((log_det - factor.log_det).abs() < 1e-9);
            let product = &mat * &factor.inverse;
            for i in 0..3 {
                for j in 0..3 {
                    let expected = if i == j { 1. } else { 0. };
                    prop_assert!((product[(i, j)] - expected).abs() < 1e-9);
                }
            }
        }

        #[test]
        fn eigen_reconstructs(values in prop::collection::vec(-2f64..2f64, 9)) {
            let mat = spd(&values);
            let eigen = symmetric_eigen(&mat).unwrap();
            let back = eigen.map(|v| v);
            for i in 0..3 {
                for j in 0..3 {
                    prop_assert!((back[(i, j)] - mat[(i, j)]).abs() < 1e-9);
                }
            }
        }
    }
}
