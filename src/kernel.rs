//! Per-branch transition laws and their adjoints.
//!
//! Every kernel describes `x_child | x_parent ~ N(Φ x_parent + ω, V)` for a
//! rescaled branch length `t`.

use faer::{Col, Mat};
use serde::{Deserialize, Serialize};

use crate::diffusion::Diffusion;
use crate::likelihood::EvaluationError;
use crate::linalg::{
    col_from_slice, diagonal_matrix, expm_diagonal, expm_symmetric, frobenius, is_diagonal,
    outer, scaled, spd_factor, symmetric_eigen, symmetrize, SymmetricEigen,
};
use crate::model::ModelError;
use crate::tree::NodeId;

/// A vector parameter attached to branches, such as a drift or an optimum.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BranchVector {
    /// One vector for every branch.
    Shared(Vec<f64>),
    /// One vector per branch, in branch order.
    PerBranch(Vec<Vec<f64>>),
    /// The root mean, reused on every branch.
    RootMean,
}

impl BranchVector {
    pub(crate) fn resolve<'a>(&'a self, branch: usize, root_mean: &'a [f64]) -> &'a [f64] {
        match self {
            BranchVector::Shared(values) => values,
            BranchVector::PerBranch(values) => &values[branch],
            BranchVector::RootMean => root_mean,
        }
    }

    fn validate(&self, what: &'static str, dim: usize, branches: usize) -> Result<(), ModelError> {
        let rows: Vec<&Vec<f64>> = match self {
            BranchVector::Shared(values) => vec![values],
            BranchVector::PerBranch(values) => {
                if values.len() != branches {
                    return Err(ModelError::DimensionMismatch {
                        what,
                        expected: branches,
                        found: values.len(),
                    });
                }
                values.iter().collect()
            }
            BranchVector::RootMean => vec![],
        };
        for row in rows {
            if row.len() != dim {
                return Err(ModelError::DimensionMismatch {
                    what,
                    expected: dim,
                    found: row.len(),
                });
            }
            if let Some(&value) = row.iter().find(|v| !v.is_finite()) {
                return Err(ModelError::InvalidParameter { name: what, value });
            }
        }
        Ok(())
    }

    /// Flat parameter values, `None` when tied to the root mean.
    pub(crate) fn flat(&self) -> Option<Vec<f64>> {
        match self {
            BranchVector::Shared(values) => Some(values.clone()),
            BranchVector::PerBranch(values) => Some(values.concat()),
            BranchVector::RootMean => None,
        }
    }

    pub(crate) fn set_flat(&mut self, what: &'static str, values: &[f64]) -> Result<(), ModelError> {
        match self {
            BranchVector::Shared(current) => {
                if values.len() != current.len() {
                    return Err(ModelError::DimensionMismatch {
                        what,
                        expected: current.len(),
                        found: values.len(),
                    });
                }
                *current = values.to_vec();
            }
            BranchVector::PerBranch(current) => {
                let dim = current.first().map(|row| row.len()).unwrap_or(0);
                if values.len() != dim * current.len() {
                    return Err(ModelError::DimensionMismatch {
                        what,
                        expected: dim * current.len(),
                        found: values.len(),
                    });
                }
                for (row, chunk) in current.iter_mut().zip(values.chunks(dim.max(1))) {
                    *row = chunk.to_vec();
                }
            }
            BranchVector::RootMean => {
                return Err(ModelError::UnsupportedTarget {
                    target: what,
                    reason: "tied to the root mean",
                })
            }
        }
        Ok(())
    }
}

/// OU attenuation matrix.
#[derive(Debug, Clone)]
pub enum Attenuation {
    /// Strictly positive diagonal entries.
    Diagonal(Vec<f64>),
    /// Symmetric positive definite matrix.
    Full(FullAttenuation),
}

#[derive(Debug, Clone)]
pub struct FullAttenuation {
    matrix: Mat<f64>,
    eigen: SymmetricEigen,
}

impl Attenuation {
    pub fn diagonal(rates: Vec<f64>) -> Result<Self, ModelError> {
        if rates.iter().any(|v| !(*v > 0.) || !v.is_finite()) {
            return Err(ModelError::NotPositiveDefinite("diagonal attenuation"));
        }
        Ok(Attenuation::Diagonal(rates))
    }

    /// Symmetric positive definite attenuation.
    ///
    /// Non-symmetric matrices are rejected even when every eigenvalue has a
    /// positive real part: the transitions and their gradients go through a
    /// real symmetric eigendecomposition.
    pub fn full(matrix: Mat<f64>) -> Result<Self, ModelError> {
        let n = matrix.nrows();
        if matrix.ncols() != n {
            return Err(ModelError::DimensionMismatch {
                what: "attenuation columns",
                expected: n,
                found: matrix.ncols(),
            });
        }
        for i in 0..n {
            for j in 0..i {
                let (a, b) = (matrix[(i, j)], matrix[(j, i)]);
                if (a - b).abs() > 1e-12 * a.abs().max(b.abs()).max(1.) {
                    return Err(ModelError::InvalidParameter {
                        name: "asymmetric attenuation entry",
                        value: a - b,
                    });
                }
            }
        }
        let mut matrix = matrix;
        symmetrize(&mut matrix);
        let eigen = symmetric_eigen(&matrix).ok_or(ModelError::NotPositiveDefinite("attenuation"))?;
        if !eigen.values.iter().all(|&v| v > 0.) {
            return Err(ModelError::NotPositiveDefinite("attenuation"));
        }
        Ok(Attenuation::Full(FullAttenuation { matrix, eigen }))
    }

    /// Full attenuation from its upper triangle (row-major, with diagonal).
    pub fn from_upper(dim: usize, values: &[f64]) -> Result<Self, ModelError> {
        let expected = dim * (dim + 1) / 2;
        if values.len() != expected {
            return Err(ModelError::DimensionMismatch {
                what: "attenuation upper triangle",
                expected,
                found: values.len(),
            });
        }
        let mut matrix = Mat::zeros(dim, dim);
        for ((i, j), &value) in upper_with_diagonal(dim).zip(values) {
            matrix[(i, j)] = value;
            matrix[(j, i)] = value;
        }
        Self::full(matrix)
    }

    pub fn dim(&self) -> usize {
        match self {
            Attenuation::Diagonal(rates) => rates.len(),
            Attenuation::Full(full) => full.matrix.nrows(),
        }
    }

    pub fn matrix(&self) -> Mat<f64> {
        match self {
            Attenuation::Diagonal(rates) => diagonal_matrix(rates),
            Attenuation::Full(full) => full.matrix.clone(),
        }
    }

    pub(crate) fn upper_values(&self) -> Vec<f64> {
        let matrix = self.matrix();
        upper_with_diagonal(self.dim()).map(|(i, j)| matrix[(i, j)]).collect()
    }

    /// Per-coordinate rates if the attenuation is diagonal.
    pub(crate) fn diagonal_rates(&self) -> Option<Vec<f64>> {
        match self {
            Attenuation::Diagonal(rates) => Some(rates.clone()),
            Attenuation::Full(full) if is_diagonal(&full.matrix) => {
                Some((0..full.matrix.nrows()).map(|i| full.matrix[(i, i)]).collect())
            }
            Attenuation::Full(_) => None,
        }
    }

    /// The common rate if the attenuation is `αI`.
    pub(crate) fn isotropic_rate(&self) -> Option<f64> {
        let rates = self.diagonal_rates()?;
        let first = *rates.first()?;
        rates.iter().all(|&r| r == first).then_some(first)
    }
}

pub(crate) fn upper_with_diagonal(dim: usize) -> impl Iterator<Item = (usize, usize)> {
    (0..dim).flat_map(move |i| (i..dim).map(move |j| (i, j)))
}

/// `∫₀ᵗ e^{-s u} du`
pub(crate) fn integrated_decay(s: f64, t: f64) -> f64 {
    let x = s * t;
    if x == 0. {
        t
    } else {
        -t * (-x).exp_m1() / x
    }
}

/// Derivative of [`integrated_decay`] with respect to `s`.
pub(crate) fn integrated_decay_derivative(s: f64, t: f64) -> f64 {
    let x = s * t;
    if x.abs() < 1e-3 {
        t * t * (-0.5 + x / 3. - x * x / 8.)
    } else {
        t * t * (x * (-x).exp() + (-x).exp_m1()) / (x * x)
    }
}

/// The closed set of diffusion processes along a branch.
#[derive(Debug, Clone)]
pub enum DiffusionKernel {
    Brownian,
    Drift(BranchVector),
    OrnsteinUhlenbeck {
        attenuation: Attenuation,
        optimum: BranchVector,
    },
}

/// Transition law of one branch.
#[derive(Debug, Clone)]
pub(crate) struct BranchTransition {
    pub(crate) length: f64,
    pub(crate) actualization: Mat<f64>,
    pub(crate) displacement: Col<f64>,
    pub(crate) variance: Mat<f64>,
    pub(crate) precision: Mat<f64>,
    pub(crate) log_det_variance: f64,
}

/// Transition whose variance is `variance_factor · Σ` and whose actualisation
/// is `actualization · I`.
#[derive(Debug, Clone)]
pub(crate) struct ScalarTransition {
    pub(crate) variance_factor: f64,
    pub(crate) actualization: f64,
    pub(crate) displacement: Vec<f64>,
}

/// Gradient of the log-likelihood with respect to `V`, `Φ` and `ω` of one branch.
#[derive(Debug, Clone)]
pub(crate) struct BranchAdjoint {
    pub(crate) variance: Mat<f64>,
    pub(crate) actualization: Mat<f64>,
    pub(crate) displacement: Col<f64>,
}

/// Branch contribution to the gradient of the kernel parameters.
#[derive(Debug, Clone)]
pub(crate) struct KernelAdjoint {
    /// `∂L/∂Σ`
    pub(crate) variance: Mat<f64>,
    /// Drift or optimum.
    pub(crate) vector: Option<Col<f64>>,
    /// Gradient with respect to every entry of the attenuation matrix.
    pub(crate) attenuation: Option<Mat<f64>>,
    /// `∂L/∂t`
    pub(crate) length: f64,
}

impl DiffusionKernel {
    pub(crate) fn validate(&self, dim: usize, branches: usize) -> Result<(), ModelError> {
        match self {
            DiffusionKernel::Brownian => Ok(()),
            DiffusionKernel::Drift(drift) => drift.validate("drift", dim, branches),
            DiffusionKernel::OrnsteinUhlenbeck {
                attenuation,
                optimum,
            } => {
                if attenuation.dim() != dim {
                    return Err(ModelError::DimensionMismatch {
                        what: "attenuation",
                        expected: dim,
                        found: attenuation.dim(),
                    });
                }
                optimum.validate("optimum", dim, branches)
            }
        }
    }

    pub(crate) fn branch_vector(&self) -> Option<&BranchVector> {
        match self {
            DiffusionKernel::Brownian => None,
            DiffusionKernel::Drift(drift) => Some(drift),
            DiffusionKernel::OrnsteinUhlenbeck { optimum, .. } => Some(optimum),
        }
    }

    /// Isotropic rate, `Some(0.)` for the Brownian kernels.
    fn scalar_rate(&self) -> Option<f64> {
        match self {
            DiffusionKernel::Brownian | DiffusionKernel::Drift(_) => Some(0.),
            DiffusionKernel::OrnsteinUhlenbeck { attenuation, .. } => attenuation.isotropic_rate(),
        }
    }

    /// Per-coordinate rates, zero for the Brownian kernels.
    pub(crate) fn coordinate_rates(&self, dim: usize) -> Option<Vec<f64>> {
        match self {
            DiffusionKernel::Brownian | DiffusionKernel::Drift(_) => Some(vec![0.; dim]),
            DiffusionKernel::OrnsteinUhlenbeck { attenuation, .. } => attenuation.diagonal_rates(),
        }
    }

    pub(crate) fn supports_scalar(&self) -> bool {
        self.scalar_rate().is_some()
    }

    pub(crate) fn supports_elementary(&self) -> bool {
        self.coordinate_rates(0).is_some()
    }

    pub(crate) fn transition(
        &self,
        node: NodeId,
        branch: usize,
        t: f64,
        diffusion: &Diffusion,
        root_mean: &[f64],
    ) -> Result<BranchTransition, EvaluationError> {
        if !(t > 0.) {
            return Err(EvaluationError::ZeroBranchLength { node });
        }
        let dim = diffusion.variance.nrows();
        match self {
            DiffusionKernel::Brownian | DiffusionKernel::Drift(_) => {
                let displacement = match self {
                    DiffusionKernel::Drift(drift) => {
                        let rate = drift.resolve(branch, root_mean);
                        Col::from_fn(dim, |i| rate[i] * t)
                    }
                    _ => Col::zeros(dim),
                };
                Ok(BranchTransition {
                    length: t,
                    actualization: Mat::identity(dim, dim),
                    displacement,
                    variance: scaled(&diffusion.variance, t),
                    precision: scaled(&diffusion.precision, t.recip()),
                    log_det_variance: dim as f64 * t.ln() + diffusion.log_det_variance,
                })
            }
            DiffusionKernel::OrnsteinUhlenbeck {
                attenuation,
                optimum,
            } => {
                let theta = col_from_slice(optimum.resolve(branch, root_mean));
                let (actualization, variance) = match attenuation {
                    Attenuation::Diagonal(rates) => {
                        let sigma = &diffusion.variance;
                        let variance = Mat::from_fn(dim, dim, |i, j| {
                            sigma[(i, j)] * integrated_decay(rates[i] + rates[j], t)
                        });
                        (expm_diagonal(rates, t), variance)
                    }
                    Attenuation::Full(full) => {
                        let values = &full.eigen.values;
                        let mut variance = full.eigen.weighted(&diffusion.variance, |i, j| {
                            integrated_decay(values[i] + values[j], t)
                        });
                        symmetrize(&mut variance);
                        (expm_symmetric(&full.eigen, t), variance)
                    }
                };
                let displacement = &theta - &actualization * &theta;
                let factor = spd_factor(&variance).ok_or(EvaluationError::NotPositiveDefinite {
                    what: "branch variance",
                    node: Some(node),
                })?;
                Ok(BranchTransition {
                    length: t,
                    actualization,
                    displacement,
                    variance,
                    precision: factor.inverse,
                    log_det_variance: factor.log_det,
                })
            }
        }
    }

    /// Transition as a multiple of the diffusion variance. `None` unless the
    /// kernel is Brownian or isotropic OU.
    pub(crate) fn scalar_transition(
        &self,
        node: NodeId,
        branch: usize,
        t: f64,
        root_mean: &[f64],
    ) -> Result<Option<ScalarTransition>, EvaluationError> {
        let Some(rate) = self.scalar_rate() else {
            return Ok(None);
        };
        if !(t > 0.) {
            return Err(EvaluationError::ZeroBranchLength { node });
        }
        let displacement = match self {
            DiffusionKernel::Brownian => vec![0.; root_mean.len()],
            DiffusionKernel::Drift(drift) => {
                drift.resolve(branch, root_mean).iter().map(|d| d * t).collect()
            }
            DiffusionKernel::OrnsteinUhlenbeck { optimum, .. } => {
                let pull = -(-rate * t).exp_m1();
                optimum
                    .resolve(branch, root_mean)
                    .iter()
                    .map(|theta| pull * theta)
                    .collect()
            }
        };
        Ok(Some(ScalarTransition {
            variance_factor: integrated_decay(2. * rate, t),
            actualization: (-rate * t).exp(),
            displacement,
        }))
    }

    /// One univariate transition per coordinate, with unit diffusion variance.
    /// `None` unless the attenuation is absent or diagonal.
    pub(crate) fn coordinate_transitions(
        &self,
        node: NodeId,
        branch: usize,
        t: f64,
        root_mean: &[f64],
    ) -> Result<Option<Vec<ScalarTransition>>, EvaluationError> {
        let dim = root_mean.len();
        let Some(rates) = self.coordinate_rates(dim) else {
            return Ok(None);
        };
        if !(t > 0.) {
            return Err(EvaluationError::ZeroBranchLength { node });
        }
        let vector = self.branch_vector().map(|v| v.resolve(branch, root_mean));
        let transitions = rates
            .iter()
            .enumerate()
            .map(|(k, &rate)| {
                let displacement = match (self, vector) {
                    (DiffusionKernel::Drift(_), Some(drift)) => drift[k] * t,
                    (DiffusionKernel::OrnsteinUhlenbeck { .. }, Some(optimum)) => {
                        -(-rate * t).exp_m1() * optimum[k]
                    }
                    _ => 0.,
                };
                ScalarTransition {
                    variance_factor: integrated_decay(2. * rate, t),
                    actualization: (-rate * t).exp(),
                    displacement: vec![displacement],
                }
            })
            .collect();
        Ok(Some(transitions))
    }

    /// Chain the branch adjoint through the kernel's own parameters.
    pub(crate) fn adjoint(
        &self,
        transition: &BranchTransition,
        adjoint: &BranchAdjoint,
        diffusion: &Diffusion,
        branch: usize,
        root_mean: &[f64],
    ) -> KernelAdjoint {
        let t = transition.length;
        let sigma = &diffusion.variance;
        let g_v = &adjoint.variance;
        let g_phi = &adjoint.actualization;
        let g_omega = &adjoint.displacement;
        let dim = sigma.nrows();
        match self {
            DiffusionKernel::Brownian => KernelAdjoint {
                variance: scaled(g_v, t),
                vector: None,
                attenuation: None,
                length: frobenius(g_v, sigma),
            },
            DiffusionKernel::Drift(drift) => {
                let rate = col_from_slice(drift.resolve(branch, root_mean));
                KernelAdjoint {
                    variance: scaled(g_v, t),
                    vector: Some(Col::from_fn(dim, |i| t * g_omega[i])),
                    attenuation: None,
                    length: frobenius(g_v, sigma) + crate::linalg::dot(g_omega, &rate),
                }
            }
            DiffusionKernel::OrnsteinUhlenbeck {
                attenuation: Attenuation::Diagonal(rates),
                optimum,
            } => {
                let theta = optimum.resolve(branch, root_mean);
                let decay: Vec<f64> = rates.iter().map(|&a| (-a * t).exp()).collect();
                let variance = Mat::from_fn(dim, dim, |i, j| {
                    g_v[(i, j)] * integrated_decay(rates[i] + rates[j], t)
                });
                let vector = Col::from_fn(dim, |k| -(-rates[k] * t).exp_m1() * g_omega[k]);
                let attenuation: Vec<f64> = (0..dim)
                    .map(|k| {
                        let through_variance: f64 = (0..dim)
                            .map(|j| {
                                g_v[(k, j)]
                                    * sigma[(k, j)]
                                    * integrated_decay_derivative(rates[k] + rates[j], t)
                            })
                            .sum();
                        2. * through_variance - t * decay[k] * g_phi[(k, k)]
                            + t * decay[k] * theta[k] * g_omega[k]
                    })
                    .collect();
                let mut length = 0.;
                for i in 0..dim {
                    for j in 0..dim {
                        length += g_v[(i, j)] * decay[i] * decay[j] * sigma[(i, j)];
                    }
                    length += rates[i] * decay[i] * (theta[i] * g_omega[i] - g_phi[(i, i)]);
                }
                KernelAdjoint {
                    variance,
                    vector: Some(vector),
                    attenuation: Some(diagonal_matrix(&attenuation)),
                    length,
                }
            }
            DiffusionKernel::OrnsteinUhlenbeck {
                attenuation: Attenuation::Full(full),
                optimum,
            } => {
                let theta = col_from_slice(optimum.resolve(branch, root_mean));
                let eigen = &full.eigen;
                let values = &eigen.values;
                let phi = &transition.actualization;
                let v = &transition.variance;

                let mut variance = eigen.weighted(g_v, |i, j| integrated_decay(values[i] + values[j], t));
                symmetrize(&mut variance);
                let vector = g_omega - phi.transpose() * g_omega;

                // Adjoint of the Lyapunov equation A V + V A = Σ - Φ Σ Φ.
                let lyapunov = eigen.weighted(g_v, |i, j| (values[i] + values[j]).recip());
                let phi_sigma = phi * sigma;
                let sigma_phi = sigma * phi;
                let through_variance = scaled(&(&lyapunov * v + v * &lyapunov), -1.);
                let total_phi = g_phi
                    - &lyapunov * &phi_sigma
                    - &sigma_phi * &lyapunov
                    - outer(g_omega, &theta);
                let decay: Vec<f64> = values.iter().map(|&l| (-l * t).exp()).collect();
                let through_actualization = eigen.weighted(&total_phi, |i, j| {
                    let delta = values[i] - values[j];
                    if delta == 0. {
                        -t * decay[j]
                    } else {
                        decay[j] * (-delta * t).exp_m1() / delta
                    }
                });
                let attenuation = &through_variance + &through_actualization;

                let a = &full.matrix;
                let a_phi = a * phi;
                let length = frobenius(g_v, &(&phi_sigma * phi.transpose()))
                    - frobenius(g_phi, &a_phi)
                    + crate::linalg::dot(g_omega, &(&a_phi * &theta));
                KernelAdjoint {
                    variance,
                    vector: Some(vector),
                    attenuation: Some(attenuation),
                    length,
                }
            }
        }
    }
}
