use faer::{Col, Mat};
use serde::{Deserialize, Serialize};

use crate::diffusion::Diffusion;
use crate::forward::Canonical;
use crate::likelihood::EvaluationError;
use crate::linalg::{bilinear, col_from_slice, dot, outer, scaled, spd_factor};
use crate::model::ModelError;

/// Conjugate normal prior `N(mean, Σ / sample_size)` on the root value.
///
/// An infinite sample size fixes the root at `mean`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RootPrior {
    mean: Vec<f64>,
    sample_size: f64,
}

/// The root prior integrated against the message coming from the tips.
#[derive(Debug, Clone)]
pub(crate) struct RootIntegral {
    pub(crate) log_likelihood: f64,
    pub(crate) posterior_mean: Col<f64>,
    pub(crate) posterior_variance: Mat<f64>,
}

#[derive(Debug, Clone)]
pub(crate) struct RootAdjoint {
    pub(crate) mean: Col<f64>,
    /// Contribution to `∂L/∂Σ` through the prior variance.
    pub(crate) variance: Mat<f64>,
    pub(crate) sample_size: f64,
}

impl RootPrior {
    pub fn conjugate(mean: Vec<f64>, sample_size: f64) -> Result<Self, ModelError> {
        let mut prior = Self::fixed(vec![0.; mean.len()]);
        prior.set_mean(&mean)?;
        prior.set_sample_size(sample_size)?;
        Ok(prior)
    }

    pub fn fixed(mean: Vec<f64>) -> Self {
        Self {
            mean,
            sample_size: f64::INFINITY,
        }
    }

    pub fn mean(&self) -> &[f64] {
        &self.mean
    }

    pub fn sample_size(&self) -> f64 {
        self.sample_size
    }

    pub fn is_fixed(&self) -> bool {
        self.sample_size == f64::INFINITY
    }

    pub(crate) fn validate(&self, dim: usize) -> Result<(), ModelError> {
        if self.mean.len() != dim {
            return Err(ModelError::DimensionMismatch {
                what: "root mean",
                expected: dim,
                found: self.mean.len(),
            });
        }
        match self.mean.iter().find(|v| !v.is_finite()) {
            Some(&value) => Err(ModelError::InvalidParameter {
                name: "root mean",
                value,
            }),
            None => Ok(()),
        }
    }

    pub(crate) fn set_mean(&mut self, mean: &[f64]) -> Result<(), ModelError> {
        if mean.len() != self.mean.len() {
            return Err(ModelError::DimensionMismatch {
                what: "root mean",
                expected: self.mean.len(),
                found: mean.len(),
            });
        }
        if let Some(&value) = mean.iter().find(|v| !v.is_finite()) {
            return Err(ModelError::InvalidParameter {
                name: "root mean",
                value,
            });
        }
        self.mean = mean.to_vec();
        Ok(())
    }

    pub(crate) fn set_sample_size(&mut self, sample_size: f64) -> Result<(), ModelError> {
        if !(sample_size > 0.) {
            return Err(ModelError::InvalidParameter {
                name: "root sample size",
                value: sample_size,
            });
        }
        self.sample_size = sample_size;
        Ok(())
    }

    /// Integrate the root value out of `inside`, the product of all messages
    /// from the root's children.
    pub(crate) fn integrate(
        &self,
        inside: &Canonical,
        diffusion: &Diffusion,
    ) -> Result<RootIntegral, EvaluationError> {
        let mean = col_from_slice(&self.mean);
        let j = &inside.precision;
        let h = &inside.shift;
        let dim = mean.nrows();
        let fixed_part = inside.log_scale - 0.5 * bilinear(&mean, j, &mean) + dot(h, &mean);

        if self.is_fixed() {
            return Ok(RootIntegral {
                log_likelihood: fixed_part,
                posterior_mean: mean,
                posterior_variance: Mat::zeros(dim, dim),
            });
        }

        let kappa = self.sample_size;
        let prior_precision = scaled(&diffusion.precision, kappa);
        let combined = &prior_precision + j;
        let factor = spd_factor(&combined).ok_or(EvaluationError::NotPositiveDefinite {
            what: "root posterior precision",
            node: None,
        })?;
        let residual = h - j * &mean;
        let log_det_prior = diffusion.log_det_variance - dim as f64 * kappa.ln();
        let log_likelihood = fixed_part + 0.5 * bilinear(&residual, &factor.inverse, &residual)
            - 0.5 * (log_det_prior + factor.log_det);
        let posterior_mean = &mean + &factor.inverse * &residual;
        Ok(RootIntegral {
            log_likelihood,
            posterior_mean,
            posterior_variance: factor.inverse,
        })
    }

    /// Gradient with respect to the prior parameters, given the root posterior.
    pub(crate) fn adjoint(
        &self,
        inside: &Canonical,
        integral: &RootIntegral,
        diffusion: &Diffusion,
    ) -> RootAdjoint {
        let mean = col_from_slice(&self.mean);
        let dim = mean.nrows();
        if self.is_fixed() {
            return RootAdjoint {
                mean: &inside.shift - &inside.precision * &mean,
                variance: Mat::zeros(dim, dim),
                sample_size: 0.,
            };
        }
        let kappa = self.sample_size;
        let prior_precision = scaled(&diffusion.precision, kappa);
        let offset = &integral.posterior_mean - &mean;
        let second_moment = &outer(&offset, &offset) + &integral.posterior_variance;
        let prior_variance_gradient = scaled(
            &(&prior_precision * &second_moment * &prior_precision - &prior_precision),
            0.5,
        );
        let sample_size = -crate::linalg::frobenius(&prior_variance_gradient, &diffusion.variance)
            / (kappa * kappa);
        RootAdjoint {
            mean: &prior_precision * &offset,
            variance: scaled(&prior_variance_gradient, kappa.recip()),
            sample_size,
        }
    }
}

#[cfg(test)]
mod test {
    use approx::assert_abs_diff_eq;

    use super::*;
    use crate::diffusion::CompoundSymmetricMatrix;

    #[test]
    fn rejects_non_positive_sample_size() {
        assert!(RootPrior::conjugate(vec![0.], 0.).is_err());
        assert!(RootPrior::conjugate(vec![0.], f64::NAN).is_err());
        assert!(RootPrior::conjugate(vec![0.], f64::INFINITY).unwrap().is_fixed());
    }

    #[test]
    fn univariate_marginal() {
        // One observation y at distance t from the root: y ~ N(μ0, σ² (t + 1/κ)).
        let diffusion = CompoundSymmetricMatrix::diagonal(crate::MatrixKind::Variance, vec![2.])
            .unwrap()
            .resolve()
            .unwrap();
        let (y, t, kappa, mu) = (1.5f64, 0.5f64, 4f64, -0.5f64);
        let var_branch = 2. * t;
        let inside = Canonical {
            precision: Mat::from_fn(1, 1, |_, _| 1. / var_branch),
            shift: Col::from_fn(1, |_| y / var_branch),
            log_scale: -0.5 * y * y / var_branch - 0.5 * (2. * std::f64::consts::PI * var_branch).ln(),
        };
        let prior = RootPrior::conjugate(vec![mu], kappa).unwrap();
        let integral = prior.integrate(&inside, &diffusion).unwrap();
        let total = 2. * (t + 1. / kappa);
        let expected = -0.5 * (y - mu).powi(2) / total - 0.5 * (2. * std::f64::consts::PI * total).ln();
        assert_abs_diff_eq!(integral.log_likelihood, expected, epsilon = 1e-12);

        let adjoint = prior.adjoint(&inside, &integral, &diffusion);
        assert_abs_diff_eq!(adjoint.mean[0], (y - mu) / total, epsilon = 1e-12);

        let fixed = RootPrior::fixed(vec![mu]).integrate(&inside, &diffusion).unwrap();
        let expected = -0.5 * (y - mu).powi(2) / var_branch
            - 0.5 * (2. * std::f64::consts::PI * var_branch).ln();
        assert_abs_diff_eq!(fixed.log_likelihood, expected, epsilon = 1e-12);
    }
}
