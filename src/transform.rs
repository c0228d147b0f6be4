use serde::{Deserialize, Serialize};

use crate::model::ModelError;

/// Smooth bijection from an unconstrained value `u` to a parameter `x`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Transform {
    Identity,
    /// `x = eᵘ`, for positive parameters.
    Log,
    /// `x = lower + (upper − lower) σ(u)`
    ScaledLogit { lower: f64, upper: f64 },
    /// `x = tanh(u)`, for correlations.
    FisherZ,
}

fn sigmoid(u: f64) -> f64 {
    if u >= 0. {
        (1. + (-u).exp()).recip()
    } else {
        let e = u.exp();
        e / (1. + e)
    }
}

impl Transform {
    pub fn scaled_logit(lower: f64, upper: f64) -> Result<Self, ModelError> {
        if !(lower.is_finite() && upper.is_finite() && upper > lower) {
            return Err(ModelError::InvalidParameter {
                name: "scaled logit bounds",
                value: upper - lower,
            });
        }
        Ok(Transform::ScaledLogit { lower, upper })
    }

    /// Parameter value of an unconstrained value.
    pub fn forward(&self, u: f64) -> f64 {
        match *self {
            Transform::Identity => u,
            Transform::Log => u.exp(),
            Transform::ScaledLogit { lower, upper } => lower + (upper - lower) * sigmoid(u),
            Transform::FisherZ => u.tanh(),
        }
    }

    /// Unconstrained value of a parameter. Values outside the support map to
    /// infinities or NaN.
    pub fn inverse(&self, x: f64) -> f64 {
        match *self {
            Transform::Identity => x,
            Transform::Log => x.ln(),
            Transform::ScaledLogit { lower, upper } => {
                let p = (x - lower) / (upper - lower);
                p.ln() - (-p).ln_1p()
            }
            Transform::FisherZ => x.atanh(),
        }
    }

    /// `dx/du`
    pub fn derivative(&self, u: f64) -> f64 {
        match *self {
            Transform::Identity => 1.,
            Transform::Log => u.exp(),
            Transform::ScaledLogit { lower, upper } => {
                let s = sigmoid(u);
                (upper - lower) * s * (1. - s)
            }
            Transform::FisherZ => {
                let x = u.tanh();
                1. - x * x
            }
        }
    }

    /// `d²x/du²`
    pub fn second_derivative(&self, u: f64) -> f64 {
        match *self {
            Transform::Identity => 0.,
            Transform::Log => u.exp(),
            Transform::ScaledLogit { lower, upper } => {
                let s = sigmoid(u);
                (upper - lower) * s * (1. - s) * (1. - 2. * s)
            }
            Transform::FisherZ => {
                let x = u.tanh();
                -2. * x * (1. - x * x)
            }
        }
    }

    /// `ln |dx/du|`
    pub fn log_jacobian(&self, u: f64) -> f64 {
        match *self {
            Transform::Identity => 0.,
            Transform::Log => u,
            Transform::ScaledLogit { lower, upper } => (upper - lower).ln() + log_sigmoid_pair(u),
            Transform::FisherZ => {
                // ln(1 − tanh²u) = ln 4 − 2 ln(eᵘ + e⁻ᵘ)
                4f64.ln() - 2. * (u.abs() + (-2. * u.abs()).exp().ln_1p())
            }
        }
    }

    /// `d/du ln |dx/du|`
    pub fn log_jacobian_derivative(&self, u: f64) -> f64 {
        match *self {
            Transform::Identity => 0.,
            Transform::Log => 1.,
            Transform::ScaledLogit { .. } => 1. - 2. * sigmoid(u),
            Transform::FisherZ => -2. * u.tanh(),
        }
    }

    /// `d²/du² ln |dx/du|`
    pub fn log_jacobian_second_derivative(&self, u: f64) -> f64 {
        match *self {
            Transform::Identity | Transform::Log => 0.,
            Transform::ScaledLogit { .. } => {
                let s = sigmoid(u);
                -2. * s * (1. - s)
            }
            Transform::FisherZ => {
                let x = u.tanh();
                -2. * (1. - x * x)
            }
        }
    }
}

/// `ln σ(u) + ln σ(−u)`, stable for large `|u|`.
fn log_sigmoid_pair(u: f64) -> f64 {
    let a = u.abs();
    -a - 2. * (-a).exp().ln_1p()
}
