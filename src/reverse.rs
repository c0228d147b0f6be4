//! Pre-order pass from the root posterior down to the tips.
//!
//! For every branch the pass forms the posterior moments of the innovation
//! `r = x_child − Φ x_parent − ω` given all data. The gradient of the
//! log-likelihood with respect to `(V, Φ, ω)` of that branch is then the
//! posterior expectation of the gradient of `log N(r; 0, V)`.

use faer::{Col, Mat};

use crate::forward::{ForwardPass, NodeState, TipState};
use crate::kernel::{BranchAdjoint, BranchTransition};
use crate::likelihood::{map_level, EvaluationError, LikelihoodSettings};
use crate::linalg::{embed, outer, scaled, select, select_col, symmetrize};
use crate::model::TraitModel;
use crate::tree::NodeId;

/// Posterior mean and covariance of a node value.
type Posterior = (Col<f64>, Mat<f64>);

#[derive(Debug, Clone)]
pub(crate) struct ReversePass {
    /// Adjoint of the branch above every node, `None` at the root.
    pub(crate) adjoints: Vec<Option<BranchAdjoint>>,
}

/// Innovation given the parent value: `E[r | x] = mean − gain Φ (x − μx)`,
/// `Cov[r | x] = residual`.
struct Innovation {
    mean: Col<f64>,
    gain: Mat<f64>,
    residual: Mat<f64>,
}

/// Innovation of a tip branch. The observed entries are `y = x_O + ε_O`, so
/// `E[r | x] = V_·O W (y − predicted_O)` and `Cov[r | x] = V − V_·O W V_O·`
/// with `W = (V + S)_OO⁻¹`.
fn tip_innovation(tip: &TipState, predicted: &Col<f64>, transition: &BranchTransition) -> Innovation {
    let dim = predicted.nrows();
    if tip.observed.is_empty() {
        return Innovation {
            mean: Col::zeros(dim),
            gain: Mat::zeros(dim, dim),
            residual: transition.variance.clone(),
        };
    }
    let observed = &tip.observed;
    let observed_residual = &tip.values - &select_col(predicted, observed);

    let rows: Vec<usize> = (0..dim).collect();
    let variance = &transition.variance;
    let lift = &select(variance, &rows, observed) * &tip.observed_precision;
    let mut residual = variance - &lift * &select(variance, observed, &rows);
    symmetrize(&mut residual);
    Innovation {
        mean: &lift * &observed_residual,
        gain: embed(&lift, &rows, observed, dim),
        residual,
    }
}

struct ChildResult {
    node: NodeId,
    posterior: Option<Posterior>,
    adjoint: BranchAdjoint,
}

fn process_child(
    forward: &ForwardPass,
    posteriors: &[Option<Posterior>],
    parent: NodeId,
    node: NodeId,
) -> Result<ChildResult, EvaluationError> {
    let transition = forward.transitions[node]
        .as_ref()
        .ok_or(EvaluationError::ZeroBranchLength { node })?;
    let (parent_mean, parent_variance) = posteriors[parent]
        .as_ref()
        .ok_or(EvaluationError::NonFinite)?;
    let dim = parent_mean.nrows();
    let phi = &transition.actualization;
    let predicted = phi * parent_mean + &transition.displacement;
    let phi_variance = phi * parent_variance;
    let predicted_variance = &phi_variance * phi.transpose();

    let (innovation, posterior) = match &forward.states[node] {
        NodeState::Tip(tip) => (tip_innovation(tip, &predicted, transition), None),
        NodeState::Internal {
            inside,
            gain: Some(gain),
        } => {
            let mean = gain * &(&inside.shift - &inside.precision * &predicted);
            let kalman = gain * &inside.precision;
            let complement = Mat::<f64>::identity(dim, dim) - &kalman;
            let mut variance = &complement * &predicted_variance * complement.transpose() + gain;
            symmetrize(&mut variance);
            let posterior = (&predicted + &mean, variance);
            let innovation = Innovation {
                mean,
                gain: kalman,
                residual: gain.clone(),
            };
            (innovation, Some(posterior))
        }
        NodeState::Internal { gain: None, .. } => return Err(EvaluationError::NonFinite),
    };

    let Innovation {
        mean,
        gain,
        residual,
    } = innovation;
    let mut second_moment = outer(&mean, &mean) + &gain * &predicted_variance * gain.transpose() + &residual;
    symmetrize(&mut second_moment);
    let cross_moment = outer(&mean, parent_mean) - &gain * &phi_variance;

    let precision = &transition.precision;
    let mut variance = scaled(&(precision * &second_moment * precision - precision), 0.5);
    symmetrize(&mut variance);
    let adjoint = BranchAdjoint {
        variance,
        actualization: precision * &cross_moment,
        displacement: precision * &mean,
    };
    Ok(ChildResult {
        node,
        posterior,
        adjoint,
    })
}

pub(crate) fn reverse(
    model: &TraitModel,
    forward: &ForwardPass,
    settings: &LikelihoodSettings,
) -> Result<ReversePass, EvaluationError> {
    let tree = model.tree();
    let n = tree.node_count();
    let mut posteriors: Vec<Option<Posterior>> = vec![None; n];
    let mut adjoints: Vec<Option<BranchAdjoint>> = vec![None; n];
    posteriors[tree.root()] = Some((
        forward.root.posterior_mean.clone(),
        forward.root.posterior_variance.clone(),
    ));

    for level in tree.depth_levels().iter().skip(1) {
        let results = map_level(level, settings, |node| {
            let parent = tree.parent(node).ok_or(EvaluationError::NonFinite)?;
            process_child(forward, &posteriors, parent, node)
        })?;
        for result in results {
            posteriors[result.node] = result.posterior;
            adjoints[result.node] = Some(result.adjoint);
        }
    }
    Ok(ReversePass { adjoints })
}

#[cfg(test)]
mod test {
    use approx::assert_abs_diff_eq;

    use super::*;
    use crate::data::TraitData;
    use crate::diffusion::{CompoundSymmetricMatrix, MatrixKind};
    use crate::forward::forward;
    use crate::kernel::DiffusionKernel;
    use crate::root::RootPrior;
    use crate::tree::Tree;

    #[test]
    fn adjoint_of_a_single_parent() {
        // Root fixed at 0, one internal node at distance 1 with two tips
        // below it at distance 1. The internal node has posterior
        // N(1, 1/3), so the innovation of its branch has mean 1 and second
        // moment 4/3: ∂L/∂ω = 1 and ∂L/∂V = ½(4/3 − 1).
        let tree = Tree::from_newick("((a:1,b:1):1);").unwrap();
        let data = TraitData::from_rows(vec![vec![1.], vec![2.]]).unwrap();
        let diffusion = CompoundSymmetricMatrix::diagonal(MatrixKind::Variance, vec![1.]).unwrap();
        let model = TraitModel::new(
            tree,
            data,
            diffusion,
            DiffusionKernel::Brownian,
            RootPrior::fixed(vec![0.]),
        )
        .unwrap();
        let settings = LikelihoodSettings::default();
        let pass = forward(&model, &settings).unwrap();
        let reverse = reverse(&model, &pass, &settings).unwrap();
        let internal = model.tree().children(model.tree().root())[0];
        assert!(reverse.adjoints[model.tree().root()].is_none());
        let adjoint = reverse.adjoints[internal].as_ref().unwrap();
        assert_abs_diff_eq!(adjoint.displacement[0], 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(adjoint.variance[(0, 0)], 1. / 6., epsilon = 1e-12);
        assert_abs_diff_eq!(adjoint.actualization[(0, 0)], 0., epsilon = 1e-12);
    }
}
