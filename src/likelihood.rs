use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::contrasts::{elementary, scalar};
use crate::data::PrecisionEncoding;
use crate::forward::forward;
use crate::model::{ModelError, TraitModel};
use crate::tree::NodeId;

/// Errors that happen while evaluating a likelihood or a gradient.
///
/// They describe a bad parameter proposal rather than a bad configuration,
/// so a sampler can usually reject the proposal and continue.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EvaluationError {
    #[error("rescaled branch above node {node} has zero length")]
    ZeroBranchLength { node: NodeId },
    #[error("{what} is not positive definite (node {node:?})")]
    NotPositiveDefinite {
        what: &'static str,
        node: Option<NodeId>,
    },
    #[error("log likelihood is not finite")]
    NonFinite,
    #[error("invalid parameter proposal: {0}")]
    Proposal(#[from] ModelError),
    #[error("position has length {found}, expected {expected}")]
    PositionLength { expected: usize, found: usize },
}

pub trait LogpError: std::error::Error {
    /// Unrecoverable errors during logp computation stop sampling,
    /// recoverable errors are seen as divergences.
    fn is_recoverable(&self) -> bool;
}

impl LogpError for EvaluationError {
    fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            EvaluationError::PositionLength { .. }
                | EvaluationError::Proposal(ModelError::UnsupportedTarget { .. })
        )
    }
}

/// Settings for tree traversals.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LikelihoodSettings {
    /// Evaluate the nodes of one tree level with rayon.
    pub parallel: bool,
    /// Levels with fewer nodes are evaluated sequentially.
    pub min_parallel_level: usize,
}

impl Default for LikelihoodSettings {
    fn default() -> Self {
        Self {
            parallel: false,
            min_parallel_level: 16,
        }
    }
}

impl LikelihoodSettings {
    pub fn parallel() -> Self {
        Self {
            parallel: true,
            ..Default::default()
        }
    }
}

/// Map `f` over the nodes of one level, in parallel if the settings allow.
pub(crate) fn map_level<T, F>(
    level: &[NodeId],
    settings: &LikelihoodSettings,
    f: F,
) -> Result<Vec<T>, EvaluationError>
where
    T: Send,
    F: Fn(NodeId) -> Result<T, EvaluationError> + Sync + Send,
{
    if settings.parallel && level.len() >= settings.min_parallel_level {
        level.par_iter().map(|&node| f(node)).collect()
    } else {
        level.iter().map(|&node| f(node)).collect()
    }
}

/// Log-likelihood evaluator for one model snapshot.
#[derive(Debug, Clone)]
pub struct TreeLikelihood {
    model: TraitModel,
    settings: LikelihoodSettings,
}

impl TreeLikelihood {
    pub fn new(model: TraitModel, settings: LikelihoodSettings) -> Self {
        Self { model, settings }
    }

    pub fn model(&self) -> &TraitModel {
        &self.model
    }

    pub fn settings(&self) -> &LikelihoodSettings {
        &self.settings
    }

    /// Log-likelihood in the precision encoding requested by the data.
    pub fn log_likelihood(&self) -> Result<f64, EvaluationError> {
        log_likelihood(&self.model, &self.settings)
    }
}

pub(crate) fn log_likelihood(
    model: &TraitModel,
    settings: &LikelihoodSettings,
) -> Result<f64, EvaluationError> {
    let value = match model.data().encoding() {
        PrecisionEncoding::Full => forward(model, settings)?.log_likelihood,
        PrecisionEncoding::Scalar => {
            let diffusion = model.diffusion().resolve()?;
            scalar(model)?.log_likelihood(&diffusion)
        }
        PrecisionEncoding::Elementary => {
            let diffusion = model.diffusion().resolve()?;
            elementary(model, settings)?.log_likelihood(&diffusion)
        }
    };
    if value.is_finite() {
        Ok(value)
    } else {
        Err(EvaluationError::NonFinite)
    }
}
