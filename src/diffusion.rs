//! The diffusion matrix and its compound-symmetric parameterisation.

use faer::Mat;
use serde::{Deserialize, Serialize};

use crate::linalg::{scaled, spd_factor, symmetrize};
use crate::model::ModelError;

/// Which matrix the parameters describe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatrixKind {
    Precision,
    Variance,
}

/// A symmetric positive definite matrix `M` with `M_ii = d_i` and
/// `M_ij = c_ij √(d_i d_j)`.
///
/// The correlations `c` are stored for the strict upper triangle in row-major
/// order: `(0, 1), (0, 2), .., (0, d-1), (1, 2), ..`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompoundSymmetricMatrix {
    kind: MatrixKind,
    diagonal: Vec<f64>,
    correlation: Vec<f64>,
}

pub(crate) fn upper_pairs(dim: usize) -> impl Iterator<Item = (usize, usize)> {
    (0..dim).flat_map(move |i| ((i + 1)..dim).map(move |j| (i, j)))
}

impl CompoundSymmetricMatrix {
    pub fn new(
        kind: MatrixKind,
        diagonal: Vec<f64>,
        correlation: Vec<f64>,
    ) -> Result<Self, ModelError> {
        let dim = diagonal.len();
        let expected = dim * dim.saturating_sub(1) / 2;
        if correlation.len() != expected {
            return Err(ModelError::DimensionMismatch {
                what: "correlations",
                expected,
                found: correlation.len(),
            });
        }
        let matrix = Self {
            kind,
            diagonal,
            correlation,
        };
        matrix.validate()?;
        Ok(matrix)
    }

    pub fn precision(diagonal: Vec<f64>, correlation: Vec<f64>) -> Result<Self, ModelError> {
        Self::new(MatrixKind::Precision, diagonal, correlation)
    }

    pub fn variance(diagonal: Vec<f64>, correlation: Vec<f64>) -> Result<Self, ModelError> {
        Self::new(MatrixKind::Variance, diagonal, correlation)
    }

    /// Uncorrelated matrix with the given diagonal.
    pub fn diagonal(kind: MatrixKind, diagonal: Vec<f64>) -> Result<Self, ModelError> {
        let dim = diagonal.len();
        Self::new(kind, diagonal, vec![0.; dim * dim.saturating_sub(1) / 2])
    }

    fn validate(&self) -> Result<(), ModelError> {
        if let Some(&value) = self.diagonal.iter().find(|v| !(**v > 0.) || !v.is_finite()) {
            return Err(ModelError::InvalidParameter {
                name: "diffusion diagonal",
                value,
            });
        }
        if let Some(&value) = self.correlation.iter().find(|c| !(c.abs() < 1.)) {
            return Err(ModelError::InvalidParameter {
                name: "diffusion correlation",
                value,
            });
        }
        Ok(())
    }

    pub fn kind(&self) -> MatrixKind {
        self.kind
    }

    pub fn dim(&self) -> usize {
        self.diagonal.len()
    }

    pub fn diagonal_values(&self) -> &[f64] {
        &self.diagonal
    }

    pub fn correlation_values(&self) -> &[f64] {
        &self.correlation
    }

    pub fn is_diagonal(&self) -> bool {
        self.correlation.iter().all(|&c| c == 0.)
    }

    pub(crate) fn set_diagonal(&mut self, values: &[f64]) -> Result<(), ModelError> {
        if values.len() != self.dim() {
            return Err(ModelError::DimensionMismatch {
                what: "diffusion diagonal",
                expected: self.dim(),
                found: values.len(),
            });
        }
        self.diagonal = values.to_vec();
        self.validate()
    }

    pub(crate) fn set_correlation(&mut self, values: &[f64]) -> Result<(), ModelError> {
        if values.len() != self.correlation.len() {
            return Err(ModelError::DimensionMismatch {
                what: "correlations",
                expected: self.correlation.len(),
                found: values.len(),
            });
        }
        self.correlation = values.to_vec();
        self.validate()
    }

    /// The matrix `M` itself.
    pub fn matrix(&self) -> Mat<f64> {
        let dim = self.dim();
        let mut out = Mat::zeros(dim, dim);
        for i in 0..dim {
            out[(i, i)] = self.diagonal[i];
        }
        for ((i, j), &c) in upper_pairs(dim).zip(&self.correlation) {
            let value = c * (self.diagonal[i] * self.diagonal[j]).sqrt();
            out[(i, j)] = value;
            out[(j, i)] = value;
        }
        out
    }

    /// Drop one coordinate, keeping the remaining entries.
    pub fn without_coordinate(&self, coordinate: usize) -> Result<Self, ModelError> {
        if coordinate >= self.dim() {
            return Err(ModelError::DimensionMismatch {
                what: "removed diffusion coordinate",
                expected: self.dim(),
                found: coordinate,
            });
        }
        let correlation = upper_pairs(self.dim())
            .zip(&self.correlation)
            .filter(|((i, j), _)| *i != coordinate && *j != coordinate)
            .map(|(_, &c)| c)
            .collect();
        let diagonal = self
            .diagonal
            .iter()
            .enumerate()
            .filter(|&(k, _)| k != coordinate)
            .map(|(_, &d)| d)
            .collect();
        Ok(Self {
            kind: self.kind,
            diagonal,
            correlation,
        })
    }

    /// Precision and variance of the current parameters.
    pub(crate) fn resolve(&self) -> Result<Diffusion, ModelError> {
        let matrix = self.matrix();
        let factor = spd_factor(&matrix).ok_or(ModelError::NotPositiveDefinite(match self.kind {
            MatrixKind::Precision => "diffusion precision",
            MatrixKind::Variance => "diffusion variance",
        }))?;
        Ok(match self.kind {
            MatrixKind::Precision => Diffusion {
                precision: matrix,
                variance: factor.inverse,
                log_det_variance: -factor.log_det,
            },
            MatrixKind::Variance => Diffusion {
                precision: factor.inverse,
                variance: matrix,
                log_det_variance: factor.log_det,
            },
        })
    }

    /// Gradient with respect to the diagonal parameters, given the gradient
    /// `G` with respect to every entry of `M`.
    pub(crate) fn diagonal_gradient(&self, entry_gradient: &Mat<f64>) -> Vec<f64> {
        let matrix = self.matrix();
        let dim = self.dim();
        (0..dim)
            .map(|i| {
                let off: f64 = (0..dim)
                    .filter(|&j| j != i)
                    .map(|j| entry_gradient[(i, j)] * matrix[(i, j)])
                    .sum();
                entry_gradient[(i, i)] + off / self.diagonal[i]
            })
            .collect()
    }

    pub(crate) fn correlation_gradient(&self, entry_gradient: &Mat<f64>) -> Vec<f64> {
        upper_pairs(self.dim())
            .map(|(i, j)| {
                (entry_gradient[(i, j)] + entry_gradient[(j, i)])
                    * (self.diagonal[i] * self.diagonal[j]).sqrt()
            })
            .collect()
    }
}

/// Resolved diffusion matrix for one evaluation.
#[derive(Debug, Clone)]
pub(crate) struct Diffusion {
    pub(crate) precision: Mat<f64>,
    pub(crate) variance: Mat<f64>,
    pub(crate) log_det_variance: f64,
}

impl Diffusion {
    /// Convert `∂L/∂Σ` into the gradient with respect to the entries of the
    /// parameterised matrix.
    pub(crate) fn entry_gradient(&self, kind: MatrixKind, variance_gradient: &Mat<f64>) -> Mat<f64> {
        match kind {
            MatrixKind::Variance => variance_gradient.clone(),
            MatrixKind::Precision => {
                let mut out = &self.variance * variance_gradient * &self.variance;
                symmetrize(&mut out);
                scaled(&out, -1.)
            }
        }
    }
}
