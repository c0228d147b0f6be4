use std::sync::Mutex;

use faer::{Col, Mat};
use serde::{Deserialize, Serialize};

use crate::contrasts::{elementary, scalar};
use crate::data::PrecisionEncoding;
use crate::diffusion::{Diffusion, MatrixKind};
use crate::forward::{forward, Canonical, NodeState};
use crate::kernel::{upper_with_diagonal, BranchVector, DiffusionKernel, KernelAdjoint};
use crate::likelihood::{log_likelihood, map_level, EvaluationError, LikelihoodSettings, TreeLikelihood};
use crate::linalg::{
    bilinear, col_from_slice, col_to_vec, diagonal_matrix, embed, frobenius, outer, scaled, select,
};
use crate::model::{ModelError, Target, TraitModel};
use crate::reverse::reverse;
use crate::root::RootAdjoint;
use crate::tree::BranchRates;

/// How the gradient of the diffusion matrix is computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum GradientMode {
    /// Reverse pass over every branch. Supports every target.
    #[default]
    BranchSpecific,
    /// `∂L/∂P = ½(nΣ − S)` from the contrast statistics. Diffusion targets
    /// only, needs a model the Scalar encoding can express.
    Wishart,
    /// Per-coordinate contrast statistics. Diagonal of a diagonal diffusion
    /// matrix only.
    Elementary,
}

/// A differentiable log density over a flat parameter vector.
///
/// This is the contract samplers consume: `logp` returns the log density and
/// writes its gradient into `gradient`.
pub trait GradientProvider: Send + Sync {
    fn dim(&self) -> usize;

    /// The current parameter values.
    fn position(&self) -> Vec<f64>;

    fn logp(&self, position: &[f64], gradient: &mut [f64]) -> Result<f64, EvaluationError>;

    fn log_density(&self, position: &[f64]) -> Result<f64, EvaluationError> {
        let mut gradient = vec![0.; self.dim()];
        self.logp(position, &mut gradient)
    }
}

/// A provider that also knows the diagonal of its Hessian, for samplers
/// that adapt a diagonal mass matrix to the curvature.
pub trait HessianProvider: GradientProvider {
    fn diagonal_hessian(&self, position: &[f64]) -> Result<Vec<f64>, EvaluationError>;
}

impl<P: GradientProvider + ?Sized> GradientProvider for Box<P> {
    fn dim(&self) -> usize {
        (**self).dim()
    }

    fn position(&self) -> Vec<f64> {
        (**self).position()
    }

    fn logp(&self, position: &[f64], gradient: &mut [f64]) -> Result<f64, EvaluationError> {
        (**self).logp(position, gradient)
    }

    fn log_density(&self, position: &[f64]) -> Result<f64, EvaluationError> {
        (**self).log_density(position)
    }
}

impl<P: GradientProvider + ?Sized> GradientProvider for &P {
    fn dim(&self) -> usize {
        (**self).dim()
    }

    fn position(&self) -> Vec<f64> {
        (**self).position()
    }

    fn logp(&self, position: &[f64], gradient: &mut [f64]) -> Result<f64, EvaluationError> {
        (**self).logp(position, gradient)
    }

    fn log_density(&self, position: &[f64]) -> Result<f64, EvaluationError> {
        (**self).log_density(position)
    }
}

impl<P: HessianProvider + ?Sized> HessianProvider for Box<P> {
    fn diagonal_hessian(&self, position: &[f64]) -> Result<Vec<f64>, EvaluationError> {
        (**self).diagonal_hessian(position)
    }
}

impl<P: HessianProvider + ?Sized> HessianProvider for &P {
    fn diagonal_hessian(&self, position: &[f64]) -> Result<Vec<f64>, EvaluationError> {
        (**self).diagonal_hessian(position)
    }
}

/// Adjoints of every model parameter after one reverse pass.
struct ModelAdjoint {
    /// `∂L/∂Σ`
    variance: Mat<f64>,
    /// Drift or optimum adjoint, per branch.
    vectors: Vec<Option<Col<f64>>>,
    /// Summed attenuation adjoint over every entry.
    attenuation: Option<Mat<f64>>,
    /// `∂L/∂t` per branch.
    lengths: Vec<f64>,
    root: RootAdjoint,
    /// `∂L/∂S` of the sampling variance.
    sampling: Mat<f64>,
}

fn model_adjoint(
    model: &TraitModel,
    settings: &LikelihoodSettings,
) -> Result<(f64, ModelAdjoint, Diffusion), EvaluationError> {
    let tree = model.tree();
    let pass = forward(model, settings)?;
    let reverse = reverse(model, &pass, settings)?;
    let root_mean = model.root().mean();

    let kernel_adjoints: Vec<KernelAdjoint> = map_level(tree.branches(), settings, |node| {
        let (Some(transition), Some(adjoint), Some((branch, _))) = (
            pass.transitions[node].as_ref(),
            reverse.adjoints[node].as_ref(),
            model.branch_length(node),
        ) else {
            return Err(EvaluationError::ZeroBranchLength { node });
        };
        Ok(model
            .kernel()
            .adjoint(transition, adjoint, &pass.diffusion, branch, root_mean))
    })?;

    let root_inside = pass
        .inside(tree.root())
        .cloned()
        .unwrap_or_else(|| Canonical::zero(model.dim()));
    let root = model.root().adjoint(&root_inside, &pass.root, &pass.diffusion);

    // Tip data depend on `V_OO + S_OO` only, so the sampling adjoint is the
    // observed block of the tip branch adjoint.
    let dim = model.dim();
    let mut sampling = Mat::zeros(dim, dim);
    if model.sampling().is_some() {
        for &node in tree.tips() {
            if let (NodeState::Tip(tip), Some(adjoint)) = (&pass.states[node], reverse.adjoints[node].as_ref()) {
                let observed = &tip.observed;
                let block = select(&adjoint.variance, observed, observed);
                sampling = &sampling + &embed(&block, observed, observed, dim);
            }
        }
    }

    let mut variance = root.variance.clone();
    let mut attenuation: Option<Mat<f64>> = None;
    let mut vectors = Vec::with_capacity(kernel_adjoints.len());
    let mut lengths = Vec::with_capacity(kernel_adjoints.len());
    for adjoint in kernel_adjoints {
        variance = &variance + &adjoint.variance;
        attenuation = match (attenuation, adjoint.attenuation) {
            (Some(total), Some(branch)) => Some(&total + &branch),
            (None, branch) => branch,
            (total, None) => total,
        };
        vectors.push(adjoint.vector);
        lengths.push(adjoint.length);
    }
    let adjoint = ModelAdjoint {
        variance,
        vectors,
        attenuation,
        lengths,
        root,
        sampling,
    };
    Ok((pass.log_likelihood, adjoint, pass.diffusion))
}

fn sum_vectors(vectors: &[Option<Col<f64>>], dim: usize) -> Col<f64> {
    vectors
        .iter()
        .flatten()
        .fold(Col::zeros(dim), |total, vector| &total + vector)
}

fn branch_vector_gradient(vector: &BranchVector, adjoint: &ModelAdjoint, dim: usize) -> Vec<f64> {
    match vector {
        BranchVector::Shared(_) => col_to_vec(&sum_vectors(&adjoint.vectors, dim)),
        BranchVector::PerBranch(_) => adjoint
            .vectors
            .iter()
            .flat_map(|vector| match vector {
                Some(vector) => col_to_vec(vector),
                None => vec![0.; dim],
            })
            .collect(),
        BranchVector::RootMean => vec![],
    }
}

fn target_gradient(
    model: &TraitModel,
    diffusion: &Diffusion,
    adjoint: &ModelAdjoint,
    target: Target,
) -> Result<Vec<f64>, ModelError> {
    let dim = model.dim();
    let compound = model.diffusion();
    let tree = model.tree();
    // Layout and availability checks.
    model.parameter_dim(target)?;
    let gradient = match target {
        Target::DiffusionDiagonal => {
            let entries = diffusion.entry_gradient(compound.kind(), &adjoint.variance);
            compound.diagonal_gradient(&entries)
        }
        Target::DiffusionCorrelation => {
            let entries = diffusion.entry_gradient(compound.kind(), &adjoint.variance);
            compound.correlation_gradient(&entries)
        }
        Target::Drift | Target::Optimum => match model.kernel().branch_vector() {
            Some(vector) => branch_vector_gradient(vector, adjoint, dim),
            None => vec![],
        },
        Target::RootMean => {
            let mut total = adjoint.root.mean.clone();
            if let Some(BranchVector::RootMean) = model.kernel().branch_vector() {
                total = &total + &sum_vectors(&adjoint.vectors, dim);
            }
            col_to_vec(&total)
        }
        Target::RootSampleSize => vec![adjoint.root.sample_size],
        Target::AttenuationDiagonal => {
            let total = adjoint.attenuation.as_ref();
            (0..dim)
                .map(|k| total.map(|a| a[(k, k)]).unwrap_or(0.))
                .collect()
        }
        Target::AttenuationFull => {
            let total = adjoint
                .attenuation
                .clone()
                .unwrap_or_else(|| Mat::zeros(dim, dim));
            upper_with_diagonal(dim)
                .map(|(i, j)| {
                    if i == j {
                        total[(i, i)]
                    } else {
                        total[(i, j)] + total[(j, i)]
                    }
                })
                .collect()
        }
        Target::BranchRates => {
            let scaled_lengths = tree
                .branches()
                .iter()
                .zip(&adjoint.lengths)
                .map(|(&node, gradient)| tree.length(node) * gradient);
            match model.rates() {
                BranchRates::Strict(_) => vec![scaled_lengths.sum()],
                BranchRates::PerBranch(_) => scaled_lengths.collect(),
            }
        }
        Target::SamplingDiagonal | Target::SamplingCorrelation => {
            let sampling = model.sampling().ok_or(ModelError::UnsupportedTarget {
                target: target.name(),
                reason: "the model has no sampling error",
            })?;
            let entries = sampling
                .resolve()?
                .entry_gradient(sampling.kind(), &adjoint.sampling);
            if target == Target::SamplingDiagonal {
                sampling.diagonal_gradient(&entries)
            } else {
                sampling.correlation_gradient(&entries)
            }
        }
    };
    Ok(gradient)
}

/// Diagonal of `∂²L/∂r²` over per-branch rates.
///
/// Seen from one branch the likelihood is `log N(μ_below; a, A + K)` with
/// `A = P + tΣ` and `a = m + tμ`. Writing `W = (A + K)⁻¹` and
/// `ρ = W(μ_below − a)`, the branch adjoints are `∂L/∂ω = ρ` and
/// `∂L/∂V = ½(ρρᵀ − W)`, and
/// `∂²L/∂t² = ½ tr(WΣWΣ) − uᵀWu` with `u = Σρ + μ`.
fn branch_rate_hessian(model: &TraitModel, settings: &LikelihoodSettings) -> Result<Vec<f64>, EvaluationError> {
    let unsupported = |reason| ModelError::UnsupportedTarget {
        target: Target::BranchRates.name(),
        reason,
    };
    if !matches!(model.rates(), BranchRates::PerBranch(_)) {
        return Err(unsupported("the diagonal Hessian needs one rate per branch").into());
    }
    if matches!(model.kernel(), DiffusionKernel::OrnsteinUhlenbeck { .. }) {
        return Err(unsupported("the diagonal Hessian needs a Brownian or drift kernel").into());
    }
    let tree = model.tree();
    let pass = forward(model, settings)?;
    let reverse = reverse(model, &pass, settings)?;
    let sigma = &pass.diffusion.variance;
    let root_mean = model.root().mean();

    map_level(tree.branches(), settings, |node| {
        let (Some(adjoint), Some((branch, _))) = (reverse.adjoints[node].as_ref(), model.branch_length(node))
        else {
            return Err(EvaluationError::ZeroBranchLength { node });
        };
        let rho = &adjoint.displacement;
        let w = outer(rho, rho) - scaled(&adjoint.variance, 2.);
        let u = match model.kernel() {
            DiffusionKernel::Drift(drift) => sigma * rho + col_from_slice(drift.resolve(branch, root_mean)),
            _ => sigma * rho,
        };
        let w_sigma = &w * sigma;
        let curvature = 0.5 * frobenius(&w_sigma, &w_sigma.transpose().to_owned()) - bilinear(&u, &w, &u);
        let length = tree.length(node);
        Ok(length * length * curvature)
    })
}

fn check_mode(model: &TraitModel, targets: &[Target], mode: GradientMode) -> Result<(), ModelError> {
    for &target in targets {
        model.parameter_dim(target)?;
    }
    let unsupported = |target: Target, reason| ModelError::UnsupportedTarget {
        target: target.name(),
        reason,
    };
    match mode {
        GradientMode::BranchSpecific => Ok(()),
        GradientMode::Wishart => {
            if !model.kernel().supports_scalar()
                || model.data().has_partially_missing()
                || model.sampling().is_some()
            {
                return Err(ModelError::UnsupportedEncoding {
                    encoding: PrecisionEncoding::Scalar,
                    requirement: "an isotropic kernel, no partially observed tip and no sampling error",
                });
            }
            match targets
                .iter()
                .find(|t| !matches!(t, Target::DiffusionDiagonal | Target::DiffusionCorrelation))
            {
                Some(&target) => Err(unsupported(target, "the Wishart mode covers the diffusion matrix only")),
                None => Ok(()),
            }
        }
        GradientMode::Elementary => {
            if !model.kernel().supports_elementary()
                || !model.diffusion().is_diagonal()
                || model.sampling().is_some()
            {
                return Err(ModelError::UnsupportedEncoding {
                    encoding: PrecisionEncoding::Elementary,
                    requirement: "a diagonal diffusion matrix, no full attenuation and no sampling error",
                });
            }
            match targets.iter().find(|t| !matches!(t, Target::DiffusionDiagonal)) {
                Some(&target) => Err(unsupported(
                    target,
                    "the Elementary mode covers the diffusion diagonal only",
                )),
                None => Ok(()),
            }
        }
    }
}

/// Log-likelihood and the concatenated gradient of `targets`.
pub(crate) fn evaluate(
    model: &TraitModel,
    targets: &[Target],
    mode: GradientMode,
    settings: &LikelihoodSettings,
) -> Result<(f64, Vec<f64>), EvaluationError> {
    check_mode(model, targets, mode)?;
    let (value, gradient) = match mode {
        GradientMode::BranchSpecific => {
            let (value, adjoint, diffusion) = model_adjoint(model, settings)?;
            let mut gradient = vec![];
            for &target in targets {
                gradient.extend(target_gradient(model, &diffusion, &adjoint, target)?);
            }
            (value, gradient)
        }
        GradientMode::Wishart => {
            let diffusion = model.diffusion().resolve()?;
            let stats = scalar(model)?;
            let p = &diffusion.precision;
            // ∂L/∂Σ = −P (∂L/∂P) P = ½(P S P − n P)
            let quadratic = p * &stats.scatter_matrix() * p;
            let variance_gradient = scaled(&(&quadratic - &scaled(p, stats.count as f64)), 0.5);
            let entries = diffusion.entry_gradient(model.diffusion().kind(), &variance_gradient);
            let gradient = targets
                .iter()
                .flat_map(|target| match target {
                    Target::DiffusionCorrelation => model.diffusion().correlation_gradient(&entries),
                    _ => model.diffusion().diagonal_gradient(&entries),
                })
                .collect();
            (stats.log_likelihood(&diffusion), gradient)
        }
        GradientMode::Elementary => {
            let diffusion = model.diffusion().resolve()?;
            let stats = elementary(model, settings)?;
            let variance_gradient: Vec<f64> = stats
                .coordinates
                .iter()
                .enumerate()
                .map(|(k, coordinate)| {
                    let p = diffusion.precision[(k, k)];
                    let precision_gradient = 0.5 * (coordinate.count as f64 / p - coordinate.scatter[0]);
                    -p * p * precision_gradient
                })
                .collect();
            let entries = match model.diffusion().kind() {
                MatrixKind::Variance => diagonal_matrix(&variance_gradient),
                MatrixKind::Precision => diffusion.entry_gradient(
                    MatrixKind::Precision,
                    &diagonal_matrix(&variance_gradient),
                ),
            };
            let gradient = model.diffusion().diagonal_gradient(&entries);
            let gradient = targets.iter().flat_map(|_| gradient.clone()).collect();
            (stats.log_likelihood(&diffusion), gradient)
        }
    };
    if !value.is_finite() || gradient.iter().any(|g: &f64| !g.is_finite()) {
        return Err(EvaluationError::NonFinite);
    }
    Ok((value, gradient))
}

impl TreeLikelihood {
    /// Log-likelihood and the concatenated gradient of `targets`.
    pub fn gradient(
        &self,
        targets: &[Target],
        mode: GradientMode,
    ) -> Result<(f64, Vec<f64>), EvaluationError> {
        evaluate(self.model(), targets, mode, self.settings())
    }
}

#[derive(Debug, Clone)]
struct Evaluation {
    position: Vec<f64>,
    value: f64,
    gradient: Vec<f64>,
}

/// Gradient provider for the tree likelihood over one or more targets.
///
/// Positions are the concatenated target parameters. Each call builds a new
/// model snapshot, so invalid proposals surface as
/// [`EvaluationError::Proposal`].
#[derive(Debug)]
pub struct TreeGradient {
    model: TraitModel,
    targets: Vec<Target>,
    mode: GradientMode,
    settings: LikelihoodSettings,
    dim: usize,
    last: Mutex<Option<Evaluation>>,
}

impl TreeGradient {
    pub fn new(
        model: TraitModel,
        targets: Vec<Target>,
        mode: GradientMode,
        settings: LikelihoodSettings,
    ) -> Result<Self, ModelError> {
        check_mode(&model, &targets, mode)?;
        let dim = model.parameters(&targets)?.len();
        log::debug!("tree gradient over {targets:?} in {mode:?} mode, dimension {dim}");
        Ok(Self {
            model,
            targets,
            mode,
            settings,
            dim,
            last: Mutex::new(None),
        })
    }

    pub fn model(&self) -> &TraitModel {
        &self.model
    }

    pub fn targets(&self) -> &[Target] {
        &self.targets
    }

    pub fn mode(&self) -> GradientMode {
        self.mode
    }

    fn check_position(&self, position: &[f64]) -> Result<(), EvaluationError> {
        if position.len() != self.dim {
            return Err(EvaluationError::PositionLength {
                expected: self.dim,
                found: position.len(),
            });
        }
        Ok(())
    }

    fn cached(&self, position: &[f64]) -> Option<Evaluation> {
        let last = self.last.lock().ok()?;
        let hit = last.as_ref().filter(|last| last.position == position).cloned();
        hit
    }
}

impl GradientProvider for TreeGradient {
    fn dim(&self) -> usize {
        self.dim
    }

    fn position(&self) -> Vec<f64> {
        self.model.parameters(&self.targets).unwrap_or_default()
    }

    fn logp(&self, position: &[f64], gradient: &mut [f64]) -> Result<f64, EvaluationError> {
        self.check_position(position)?;
        if gradient.len() != self.dim {
            return Err(EvaluationError::PositionLength {
                expected: self.dim,
                found: gradient.len(),
            });
        }
        if let Some(last) = self.cached(position) {
            gradient.copy_from_slice(&last.gradient);
            return Ok(last.value);
        }
        let model = self.model.with_parameters(&self.targets, position)?;
        let (value, values) = evaluate(&model, &self.targets, self.mode, &self.settings)?;
        gradient.copy_from_slice(&values);
        if let Ok(mut last) = self.last.lock() {
            *last = Some(Evaluation {
                position: position.to_vec(),
                value,
                gradient: values,
            });
        }
        Ok(value)
    }

    fn log_density(&self, position: &[f64]) -> Result<f64, EvaluationError> {
        self.check_position(position)?;
        if let Some(last) = self.cached(position) {
            return Ok(last.value);
        }
        let model = self.model.with_parameters(&self.targets, position)?;
        log_likelihood(&model, &self.settings)
    }
}

impl HessianProvider for TreeGradient {
    /// Analytic for a single per-branch [`Target::BranchRates`] target.
    fn diagonal_hessian(&self, position: &[f64]) -> Result<Vec<f64>, EvaluationError> {
        self.check_position(position)?;
        if let Some(&target) = self.targets.iter().find(|&&t| t != Target::BranchRates) {
            return Err(ModelError::UnsupportedTarget {
                target: target.name(),
                reason: "only branch rates have an analytic diagonal Hessian",
            }
            .into());
        }
        if self.targets.len() != 1 {
            return Err(ModelError::UnsupportedTarget {
                target: Target::BranchRates.name(),
                reason: "the target is repeated",
            }
            .into());
        }
        let model = self.model.with_parameters(&self.targets, position)?;
        let hessian = branch_rate_hessian(&model, &self.settings)?;
        if hessian.iter().any(|h| !h.is_finite()) {
            return Err(EvaluationError::NonFinite);
        }
        Ok(hessian)
    }
}
