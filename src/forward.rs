//! Post-order pass in canonical form.
//!
//! Every node keeps the message `exp(-½xᵀJx + hᵀx + c)` describing the
//! likelihood of the data below it as a function of its own value. A message
//! travels up a branch by integrating the child value out, and siblings combine
//! by adding their `(J, h, c)`.

use faer::{Col, Mat};

use crate::data::TraitData;
use crate::diffusion::Diffusion;
use crate::kernel::BranchTransition;
use crate::likelihood::{map_level, EvaluationError, LikelihoodSettings};
use crate::linalg::{bilinear, dot, embed, embed_col, select, spd_factor, symmetrize};
use crate::math::LN_2PI;
use crate::model::TraitModel;
use crate::root::RootIntegral;
use crate::tree::NodeId;

#[derive(Debug, Clone)]
pub(crate) struct Canonical {
    pub(crate) precision: Mat<f64>,
    pub(crate) shift: Col<f64>,
    pub(crate) log_scale: f64,
}

impl Canonical {
    pub(crate) fn zero(dim: usize) -> Self {
        Self {
            precision: Mat::zeros(dim, dim),
            shift: Col::zeros(dim),
            log_scale: 0.,
        }
    }

    fn accumulate(&mut self, other: &Canonical) {
        self.precision = &self.precision + &other.precision;
        self.shift = &self.shift + &other.shift;
        self.log_scale += other.log_scale;
    }

    /// Rewrite a message over `a = Φx + ω` as a message over `x`.
    fn pull_back(precision: Mat<f64>, shift: Col<f64>, log_scale: f64, transition: &BranchTransition) -> Self {
        let phi = &transition.actualization;
        let omega = &transition.displacement;
        let shifted = &precision * omega;
        let log_scale = log_scale + dot(&shift, omega) - 0.5 * dot(omega, &shifted);
        let mut out_precision = phi.transpose() * &precision * phi;
        symmetrize(&mut out_precision);
        Self {
            precision: out_precision,
            shift: phi.transpose() * &(&shift - &shifted),
            log_scale,
        }
    }
}

/// Observed part of a tip, kept for the reverse pass.
#[derive(Debug, Clone)]
pub(crate) struct TipState {
    pub(crate) observed: Vec<usize>,
    pub(crate) values: Col<f64>,
    /// `(V + S)_OO⁻¹` for the branch above the tip and the sampling
    /// variance `S`.
    pub(crate) observed_precision: Mat<f64>,
}

#[derive(Debug, Clone)]
pub(crate) enum NodeState {
    Tip(TipState),
    Internal {
        inside: Canonical,
        /// `(V⁻¹ + J)⁻¹` for the branch above, `None` at the root.
        gain: Option<Mat<f64>>,
    },
}

/// Everything the reverse pass needs from a forward evaluation.
#[derive(Debug, Clone)]
pub(crate) struct ForwardPass {
    pub(crate) diffusion: Diffusion,
    pub(crate) transitions: Vec<Option<BranchTransition>>,
    pub(crate) states: Vec<NodeState>,
    pub(crate) root: RootIntegral,
    pub(crate) log_likelihood: f64,
}

impl ForwardPass {
    pub(crate) fn inside(&self, node: NodeId) -> Option<&Canonical> {
        match &self.states[node] {
            NodeState::Internal { inside, .. } => Some(inside),
            NodeState::Tip(_) => None,
        }
    }
}

struct NodeResult {
    node: NodeId,
    state: NodeState,
    transition: Option<BranchTransition>,
    message: Option<Canonical>,
}

fn tip_message(
    data: &TraitData,
    tip: usize,
    node: NodeId,
    transition: &BranchTransition,
    sampling: Option<&Mat<f64>>,
) -> Result<(TipState, Canonical), EvaluationError> {
    let dim = data.dim();
    let observed = data.observed(tip);
    let row = data.values(tip);
    let values = Col::from_fn(observed.len(), |i| row[observed[i]]);

    if observed.is_empty() {
        let state = TipState {
            observed,
            values,
            observed_precision: Mat::zeros(0, 0),
        };
        return Ok((state, Canonical::zero(dim)));
    }

    let (observed_precision, log_det) = if observed.len() == dim && sampling.is_none() {
        (transition.precision.clone(), transition.log_det_variance)
    } else {
        let mut block = select(&transition.variance, &observed, &observed);
        if let Some(sampling) = sampling {
            block = &block + &select(sampling, &observed, &observed);
        }
        let factor = spd_factor(&block).ok_or(EvaluationError::NotPositiveDefinite {
            what: "observed tip variance",
            node: Some(node),
        })?;
        (factor.inverse, factor.log_det)
    };

    let weighted = &observed_precision * &values;
    let log_scale =
        -0.5 * dot(&values, &weighted) - 0.5 * (observed.len() as f64 * LN_2PI + log_det);
    let precision = embed(&observed_precision, &observed, &observed, dim);
    let shift = embed_col(&weighted, &observed, dim);
    let message = Canonical::pull_back(precision, shift, log_scale, transition);
    let state = TipState {
        observed,
        values,
        observed_precision,
    };
    Ok((state, message))
}

/// Integrate the node value out of its inside message along the branch above.
fn internal_message(
    inside: &Canonical,
    node: NodeId,
    transition: &BranchTransition,
) -> Result<(Mat<f64>, Canonical), EvaluationError> {
    let j = &inside.precision;
    let h = &inside.shift;
    let combined = &transition.precision + j;
    let factor = spd_factor(&combined).ok_or(EvaluationError::NotPositiveDefinite {
        what: "branch posterior precision",
        node: Some(node),
    })?;
    let gain = factor.inverse;
    let j_gain = j * &gain;
    let mut precision = j - &j_gain * j;
    symmetrize(&mut precision);
    let shift = h - &j_gain * h;
    let log_scale = inside.log_scale + 0.5 * bilinear(h, &gain, h)
        - 0.5 * (transition.log_det_variance + factor.log_det);
    let message = Canonical::pull_back(precision, shift, log_scale, transition);
    Ok((gain, message))
}

fn process_node(
    model: &TraitModel,
    diffusion: &Diffusion,
    sampling: Option<&Mat<f64>>,
    messages: &[Option<Canonical>],
    node: NodeId,
) -> Result<NodeResult, EvaluationError> {
    let tree = model.tree();
    let dim = model.dim();
    let transition = match model.branch_length(node) {
        Some((branch, t)) => Some(model.kernel().transition(
            node,
            branch,
            t,
            diffusion,
            model.root().mean(),
        )?),
        None => None,
    };

    if let Some(tip) = tree.tip_index(node) {
        let Some(transition) = transition else {
            // A single-node tree: the root is the only tip.
            let state = NodeState::Tip(TipState {
                observed: vec![],
                values: Col::zeros(0),
                observed_precision: Mat::zeros(0, 0),
            });
            return Ok(NodeResult {
                node,
                state,
                transition: None,
                message: None,
            });
        };
        let (state, message) = tip_message(model.data(), tip, node, &transition, sampling)?;
        return Ok(NodeResult {
            node,
            state: NodeState::Tip(state),
            transition: Some(transition),
            message: Some(message),
        });
    }

    let mut inside = Canonical::zero(dim);
    for &child in tree.children(node) {
        if let Some(message) = &messages[child] {
            inside.accumulate(message);
        }
    }
    match transition {
        Some(transition) => {
            let (gain, message) = internal_message(&inside, node, &transition)?;
            Ok(NodeResult {
                node,
                state: NodeState::Internal {
                    inside,
                    gain: Some(gain),
                },
                transition: Some(transition),
                message: Some(message),
            })
        }
        None => Ok(NodeResult {
            node,
            state: NodeState::Internal { inside, gain: None },
            transition: None,
            message: None,
        }),
    }
}

pub(crate) fn forward(
    model: &TraitModel,
    settings: &LikelihoodSettings,
) -> Result<ForwardPass, EvaluationError> {
    let tree = model.tree();
    let n = tree.node_count();
    let diffusion = model.diffusion().resolve()?;
    let sampling = model.sampling().map(|s| s.resolve()).transpose()?;
    let sampling = sampling.as_ref().map(|s| &s.variance);

    let mut messages: Vec<Option<Canonical>> = vec![None; n];
    let mut transitions: Vec<Option<BranchTransition>> = vec![None; n];
    let mut states: Vec<Option<NodeState>> = vec![None; n];

    for level in tree.height_levels() {
        let results = map_level(level, settings, |node| {
            process_node(model, &diffusion, sampling, &messages, node)
        })?;
        for result in results {
            messages[result.node] = result.message;
            transitions[result.node] = result.transition;
            states[result.node] = Some(result.state);
        }
    }

    let states: Vec<NodeState> = states
        .into_iter()
        .map(|state| state.ok_or(EvaluationError::NonFinite))
        .collect::<Result<_, _>>()?;

    let root_inside = match &states[tree.root()] {
        NodeState::Internal { inside, .. } => inside.clone(),
        NodeState::Tip(_) => Canonical::zero(model.dim()),
    };
    let root = model.root().integrate(&root_inside, &diffusion)?;
    let log_likelihood = root.log_likelihood;
    if !log_likelihood.is_finite() {
        return Err(EvaluationError::NonFinite);
    }
    log::trace!("canonical forward pass: log likelihood {log_likelihood}");

    Ok(ForwardPass {
        diffusion,
        transitions,
        states,
        root,
        log_likelihood,
    })
}

/// Root message of a single observation vector, used to test the algebra.
#[cfg(test)]
pub(crate) fn observation_message(values: &[f64], variance: &Mat<f64>) -> Canonical {
    let factor = spd_factor(variance).unwrap();
    let y = crate::linalg::col_from_slice(values);
    let weighted = &factor.inverse * &y;
    Canonical {
        log_scale: -0.5 * dot(&y, &weighted) - 0.5 * (values.len() as f64 * LN_2PI + factor.log_det),
        precision: factor.inverse,
        shift: weighted,
    }
}

#[cfg(test)]
mod test {
    use approx::assert_abs_diff_eq;

    use super::*;
    use crate::linalg::{col_from_slice, diagonal_matrix};

    #[test]
    fn pull_back_shifts_and_scales() {
        // N(y; Φx + ω, V) as a function of x is a message with J = ΦᵀV⁻¹Φ.
        let variance = diagonal_matrix(&[2., 0.5]);
        let message = observation_message(&[1., -1.], &variance);
        let transition = BranchTransition {
            length: 1.,
            actualization: diagonal_matrix(&[0.5, 2.]),
            displacement: col_from_slice(&[0.3, -0.2]),
            variance: variance.clone(),
            precision: diagonal_matrix(&[0.5, 2.]),
            log_det_variance: 0.,
        };
        let pulled = Canonical::pull_back(message.precision, message.shift, message.log_scale, &transition);
        let x = col_from_slice(&[0.7, 0.1]);
        let value = -0.5 * bilinear(&x, &pulled.precision, &x) + dot(&pulled.shift, &x) + pulled.log_scale;
        let mean: [f64; 2] = [0.5 * 0.7 + 0.3, 2. * 0.1 - 0.2];
        let expected = -0.5 * ((1. - mean[0]).powi(2) / 2. + (-1. - mean[1]).powi(2) / 0.5)
            - LN_2PI
            - 0.5 * 1f64.ln();
        assert_abs_diff_eq!(value, expected, epsilon = 1e-12);
    }
}
