//! Wrappers that compose gradient providers.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::gradient::{GradientProvider, HessianProvider};
use crate::likelihood::EvaluationError;
use crate::math::axpy;
use crate::model::ModelError;
use crate::transform::Transform;

fn check_length(expected: usize, found: usize) -> Result<(), EvaluationError> {
    if expected != found {
        return Err(EvaluationError::PositionLength { expected, found });
    }
    Ok(())
}

/// Sum of providers over the same parameter vector, such as a likelihood
/// and a prior.
pub struct Sum<P = Box<dyn GradientProvider>> {
    providers: Vec<P>,
    dim: usize,
}

impl<P: GradientProvider> Sum<P> {
    pub fn new(providers: Vec<P>) -> Result<Self, ModelError> {
        let dim = providers.first().map(|p| p.dim()).ok_or(ModelError::DimensionMismatch {
            what: "summed providers",
            expected: 1,
            found: 0,
        })?;
        if let Some(other) = providers.iter().find(|p| p.dim() != dim) {
            return Err(ModelError::DimensionMismatch {
                what: "summed provider",
                expected: dim,
                found: other.dim(),
            });
        }
        Ok(Self { providers, dim })
    }
}

impl<P: GradientProvider> GradientProvider for Sum<P> {
    fn dim(&self) -> usize {
        self.dim
    }

    fn position(&self) -> Vec<f64> {
        self.providers[0].position()
    }

    fn logp(&self, position: &[f64], gradient: &mut [f64]) -> Result<f64, EvaluationError> {
        check_length(self.dim, position.len())?;
        check_length(self.dim, gradient.len())?;
        gradient.fill(0.);
        let mut scratch = vec![0.; self.dim];
        let mut total = 0.;
        for provider in self.providers.iter() {
            total += provider.logp(position, &mut scratch)?;
            axpy(&scratch, gradient, 1.);
        }
        Ok(total)
    }

    fn log_density(&self, position: &[f64]) -> Result<f64, EvaluationError> {
        self.providers.iter().map(|p| p.log_density(position)).sum()
    }
}

impl<P: HessianProvider> HessianProvider for Sum<P> {
    fn diagonal_hessian(&self, position: &[f64]) -> Result<Vec<f64>, EvaluationError> {
        check_length(self.dim, position.len())?;
        let mut total = vec![0.; self.dim];
        for provider in self.providers.iter() {
            axpy(&provider.diagonal_hessian(position)?, &mut total, 1.);
        }
        Ok(total)
    }
}

/// Independent providers stacked into one parameter vector.
pub struct Concatenated<P = Box<dyn GradientProvider>> {
    providers: Vec<P>,
    offsets: Vec<usize>,
}

impl<P: GradientProvider> Concatenated<P> {
    pub fn new(providers: Vec<P>) -> Self {
        let mut offsets = vec![0];
        for provider in providers.iter() {
            offsets.push(offsets[offsets.len() - 1] + provider.dim());
        }
        Self { providers, offsets }
    }
}

impl<P: GradientProvider> GradientProvider for Concatenated<P> {
    fn dim(&self) -> usize {
        self.offsets[self.offsets.len() - 1]
    }

    fn position(&self) -> Vec<f64> {
        self.providers.iter().flat_map(|p| p.position()).collect()
    }

    fn logp(&self, position: &[f64], gradient: &mut [f64]) -> Result<f64, EvaluationError> {
        check_length(self.dim(), position.len())?;
        check_length(self.dim(), gradient.len())?;
        let mut total = 0.;
        for (provider, range) in self.providers.iter().zip(self.offsets.windows(2)) {
            let (start, end) = (range[0], range[1]);
            total += provider.logp(&position[start..end], &mut gradient[start..end])?;
        }
        Ok(total)
    }

    fn log_density(&self, position: &[f64]) -> Result<f64, EvaluationError> {
        check_length(self.dim(), position.len())?;
        self.providers
            .iter()
            .zip(self.offsets.windows(2))
            .map(|(provider, range)| provider.log_density(&position[range[0]..range[1]]))
            .sum()
    }
}

impl<P: HessianProvider> HessianProvider for Concatenated<P> {
    fn diagonal_hessian(&self, position: &[f64]) -> Result<Vec<f64>, EvaluationError> {
        check_length(self.dim(), position.len())?;
        let mut hessian = Vec::with_capacity(position.len());
        for (provider, range) in self.providers.iter().zip(self.offsets.windows(2)) {
            hessian.extend(provider.diagonal_hessian(&position[range[0]..range[1]])?);
        }
        Ok(hessian)
    }
}

/// Zeroes the gradient outside a selection, freezing those directions for
/// a gradient-based sampler.
pub struct Masked<P> {
    inner: P,
    mask: Vec<bool>,
}

impl<P: GradientProvider> Masked<P> {
    pub fn new(inner: P, mask: Vec<bool>) -> Result<Self, ModelError> {
        if mask.len() != inner.dim() {
            return Err(ModelError::DimensionMismatch {
                what: "gradient mask",
                expected: inner.dim(),
                found: mask.len(),
            });
        }
        Ok(Self { inner, mask })
    }

    /// Mask from 0/1 weights; any non-zero weight selects the entry.
    pub fn from_weights(inner: P, weights: &[f64]) -> Result<Self, ModelError> {
        Self::new(inner, weights.iter().map(|&w| w != 0.).collect())
    }
}

impl<P: GradientProvider> GradientProvider for Masked<P> {
    fn dim(&self) -> usize {
        self.inner.dim()
    }

    fn position(&self) -> Vec<f64> {
        self.inner.position()
    }

    fn logp(&self, position: &[f64], gradient: &mut [f64]) -> Result<f64, EvaluationError> {
        let value = self.inner.logp(position, gradient)?;
        gradient
            .iter_mut()
            .zip(self.mask.iter())
            .filter(|(_, keep)| !**keep)
            .for_each(|(g, _)| *g = 0.);
        Ok(value)
    }

    fn log_density(&self, position: &[f64]) -> Result<f64, EvaluationError> {
        self.inner.log_density(position)
    }
}

impl<P: HessianProvider> HessianProvider for Masked<P> {
    fn diagonal_hessian(&self, position: &[f64]) -> Result<Vec<f64>, EvaluationError> {
        let mut hessian = self.inner.diagonal_hessian(position)?;
        hessian
            .iter_mut()
            .zip(self.mask.iter())
            .filter(|(_, keep)| !**keep)
            .for_each(|(h, _)| *h = 0.);
        Ok(hessian)
    }
}

/// Provider over unconstrained coordinates `u`, with `x = transform(u)`
/// handed to the inner provider.
pub struct Transformed<P> {
    inner: P,
    transforms: Vec<Transform>,
    include_jacobian: bool,
}

impl<P: GradientProvider> Transformed<P> {
    pub fn new(inner: P, transforms: Vec<Transform>, include_jacobian: bool) -> Result<Self, ModelError> {
        if transforms.len() != inner.dim() {
            return Err(ModelError::DimensionMismatch {
                what: "parameter transforms",
                expected: inner.dim(),
                found: transforms.len(),
            });
        }
        Ok(Self {
            inner,
            transforms,
            include_jacobian,
        })
    }

    /// The same transform on every coordinate.
    pub fn uniform(inner: P, transform: Transform, include_jacobian: bool) -> Self {
        let transforms = vec![transform; inner.dim()];
        Self {
            inner,
            transforms,
            include_jacobian,
        }
    }

    fn constrained(&self, position: &[f64]) -> Result<Vec<f64>, EvaluationError> {
        check_length(self.transforms.len(), position.len())?;
        Ok(self
            .transforms
            .iter()
            .zip(position)
            .map(|(t, &u)| t.forward(u))
            .collect())
    }

    fn log_jacobian(&self, position: &[f64]) -> f64 {
        if !self.include_jacobian {
            return 0.;
        }
        self.transforms
            .iter()
            .zip(position)
            .map(|(t, &u)| t.log_jacobian(u))
            .sum()
    }
}

impl<P: GradientProvider> GradientProvider for Transformed<P> {
    fn dim(&self) -> usize {
        self.inner.dim()
    }

    fn position(&self) -> Vec<f64> {
        self.transforms
            .iter()
            .zip(self.inner.position())
            .map(|(t, x)| t.inverse(x))
            .collect()
    }

    fn logp(&self, position: &[f64], gradient: &mut [f64]) -> Result<f64, EvaluationError> {
        let x = self.constrained(position)?;
        let value = self.inner.logp(&x, gradient)?;
        for ((g, t), &u) in gradient.iter_mut().zip(self.transforms.iter()).zip(position) {
            *g *= t.derivative(u);
            if self.include_jacobian {
                *g += t.log_jacobian_derivative(u);
            }
        }
        Ok(value + self.log_jacobian(position))
    }

    fn log_density(&self, position: &[f64]) -> Result<f64, EvaluationError> {
        let x = self.constrained(position)?;
        Ok(self.inner.log_density(&x)? + self.log_jacobian(position))
    }
}

impl<P: HessianProvider> HessianProvider for Transformed<P> {
    /// `h_u = h_x x'² + g_x x'' (+ J'')`
    fn diagonal_hessian(&self, position: &[f64]) -> Result<Vec<f64>, EvaluationError> {
        let x = self.constrained(position)?;
        let mut gradient = vec![0.; x.len()];
        self.inner.logp(&x, &mut gradient)?;
        let mut hessian = self.inner.diagonal_hessian(&x)?;
        for (((h, g), t), &u) in hessian
            .iter_mut()
            .zip(&gradient)
            .zip(self.transforms.iter())
            .zip(position)
        {
            let slope = t.derivative(u);
            *h = *h * slope * slope + g * t.second_derivative(u);
            if self.include_jacobian {
                *h += t.log_jacobian_second_derivative(u);
            }
        }
        Ok(hessian)
    }
}

/// Flips between the log-density and the potential-energy conventions.
pub struct Negative<P> {
    inner: P,
}

impl<P: GradientProvider> Negative<P> {
    pub fn new(inner: P) -> Self {
        Self { inner }
    }
}

impl<P: GradientProvider> GradientProvider for Negative<P> {
    fn dim(&self) -> usize {
        self.inner.dim()
    }

    fn position(&self) -> Vec<f64> {
        self.inner.position()
    }

    fn logp(&self, position: &[f64], gradient: &mut [f64]) -> Result<f64, EvaluationError> {
        let value = self.inner.logp(position, gradient)?;
        gradient.iter_mut().for_each(|g| *g = -*g);
        Ok(-value)
    }

    fn log_density(&self, position: &[f64]) -> Result<f64, EvaluationError> {
        Ok(-self.inner.log_density(position)?)
    }
}

impl<P: HessianProvider> HessianProvider for Negative<P> {
    fn diagonal_hessian(&self, position: &[f64]) -> Result<Vec<f64>, EvaluationError> {
        Ok(self
            .inner
            .diagonal_hessian(position)?
            .into_iter()
            .map(|h| -h)
            .collect())
    }
}

/// Step sizes and tolerance for finite differences.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NumericalSettings {
    /// Central-difference step relative to `max(1, |x|)`.
    pub relative_step: f64,
    /// Relative step of the second differences.
    pub hessian_step: f64,
    /// Accepted `|analytic − numeric| / max(1, |numeric|)`.
    pub tolerance: f64,
}

impl Default for NumericalSettings {
    fn default() -> Self {
        Self {
            relative_step: 1e-5,
            hessian_step: 1e-4,
            tolerance: 1e-4,
        }
    }
}

/// Finite-difference gradient of another provider's log density.
///
/// Only useful as a correctness oracle: every gradient costs two density
/// evaluations per coordinate.
pub struct Numerical<P> {
    inner: P,
    settings: NumericalSettings,
}

impl<P: GradientProvider> Numerical<P> {
    pub fn new(inner: P, settings: NumericalSettings) -> Self {
        Self { inner, settings }
    }

    pub fn settings(&self) -> &NumericalSettings {
        &self.settings
    }

    fn shifted(&self, position: &[f64], index: usize, step: f64) -> Result<f64, EvaluationError> {
        let mut moved = position.to_vec();
        moved[index] += step;
        self.inner.log_density(&moved)
    }

    fn step(&self, relative: f64, value: f64) -> f64 {
        relative * value.abs().max(1.)
    }
}

impl<P: GradientProvider> GradientProvider for Numerical<P> {
    fn dim(&self) -> usize {
        self.inner.dim()
    }

    fn position(&self) -> Vec<f64> {
        self.inner.position()
    }

    fn logp(&self, position: &[f64], gradient: &mut [f64]) -> Result<f64, EvaluationError> {
        check_length(self.dim(), position.len())?;
        check_length(self.dim(), gradient.len())?;
        let value = self.inner.log_density(position)?;
        let values = (0..position.len())
            .into_par_iter()
            .map(|i| {
                let h = self.step(self.settings.relative_step, position[i]);
                Ok((self.shifted(position, i, h)? - self.shifted(position, i, -h)?) / (2. * h))
            })
            .collect::<Result<Vec<f64>, EvaluationError>>()?;
        gradient.copy_from_slice(&values);
        Ok(value)
    }

    fn log_density(&self, position: &[f64]) -> Result<f64, EvaluationError> {
        self.inner.log_density(position)
    }
}

impl<P: GradientProvider> HessianProvider for Numerical<P> {
    fn diagonal_hessian(&self, position: &[f64]) -> Result<Vec<f64>, EvaluationError> {
        check_length(self.dim(), position.len())?;
        let center = self.inner.log_density(position)?;
        (0..position.len())
            .into_par_iter()
            .map(|i| {
                let h = self.step(self.settings.hessian_step, position[i]);
                let up = self.shifted(position, i, h)?;
                let down = self.shifted(position, i, -h)?;
                Ok((up - 2. * center + down) / (h * h))
            })
            .collect()
    }
}
