//! Independent-contrast passes for the Scalar and Elementary encodings.
//!
//! When every branch variance is a multiple of Σ, a partial likelihood is
//! `N(mean; x, Σ / s)` and only the scalar `s` travels up the tree. Two
//! siblings combine into one contrast `u = μa − μb ~ N(0, (1/sa + 1/sb) Σ)`,
//! so the likelihood reduces to the statistics `(n, S)` of all contrasts.

use faer::Mat;
use itertools::izip;
use rayon::prelude::*;

use crate::diffusion::Diffusion;
use crate::kernel::ScalarTransition;
use crate::likelihood::{EvaluationError, LikelihoodSettings};
use crate::math::{difference, rank_one_update, vector_dot, weighted_sum, LN_2PI};
use crate::model::TraitModel;
use crate::tree::{NodeId, Tree};

/// Sufficient statistics of a contrast pass.
#[derive(Debug, Clone)]
pub(crate) struct ContrastStatistics {
    /// Number of contrasts.
    pub(crate) count: usize,
    /// `Σ u uᵀ / v`, row-major `dim × dim`.
    pub(crate) scatter: Vec<f64>,
    /// Every term of the log-likelihood that does not involve Σ.
    pub(crate) log_norm: f64,
    dim: usize,
}

impl ContrastStatistics {
    fn new(dim: usize) -> Self {
        Self {
            count: 0,
            scatter: vec![0.; dim * dim],
            log_norm: 0.,
            dim,
        }
    }

    fn add_contrast(&mut self, contrast: &[f64], variance: f64) {
        self.count += 1;
        self.log_norm -= 0.5 * self.dim as f64 * (LN_2PI + variance.ln());
        rank_one_update(contrast, &mut self.scatter, variance.recip());
    }

    pub(crate) fn scatter_matrix(&self) -> Mat<f64> {
        Mat::from_fn(self.dim, self.dim, |i, j| self.scatter[i * self.dim + j])
    }

    /// `log_norm + n/2 · log|P| − ½ tr(P S)`
    pub(crate) fn log_likelihood(&self, diffusion: &Diffusion) -> f64 {
        // Both matrices are symmetric, so the trace is an entrywise dot.
        let p = &diffusion.precision;
        let precision: Vec<f64> = (0..self.dim * self.dim)
            .map(|k| p[(k / self.dim, k % self.dim)])
            .collect();
        let trace = vector_dot(&precision, &self.scatter);
        self.log_norm - 0.5 * self.count as f64 * diffusion.log_det_variance - 0.5 * trace
    }
}

/// Per-coordinate statistics of the Elementary encoding.
#[derive(Debug, Clone)]
pub(crate) struct CoordinateStatistics {
    pub(crate) coordinates: Vec<ContrastStatistics>,
}

impl CoordinateStatistics {
    pub(crate) fn log_likelihood(&self, diffusion: &Diffusion) -> f64 {
        self.coordinates
            .iter()
            .enumerate()
            .map(|(k, stats)| {
                let precision = diffusion.precision[(k, k)];
                stats.log_norm + 0.5 * stats.count as f64 * precision.ln()
                    - 0.5 * precision * stats.scatter[0]
            })
            .sum()
    }
}

/// Below this, `Φ x` is lost against `ω` in double precision and dividing
/// by `Φ` would overflow the contrasts.
const NEGLIGIBLE_ACTUALIZATION: f64 = 1e-100;

/// Partial likelihood `N(mean; x, Σ / weight)`. Zero weight carries no data,
/// infinite weight is an exact observation.
#[derive(Debug, Clone)]
struct Partial {
    weight: f64,
    mean: Vec<f64>,
}

impl Partial {
    fn empty(dim: usize) -> Self {
        Self {
            weight: 0.,
            mean: vec![0.; dim],
        }
    }

    /// Move the partial from the child end of a branch to its parent end.
    ///
    /// Once the actualization is negligible the subtree no longer depends on
    /// the parent: it closes as one contrast `mean − ω` against the optimum
    /// and an empty partial moves on.
    fn propagate(self, transition: &ScalarTransition, stats: &mut ContrastStatistics) -> Self {
        if self.weight == 0. {
            return self;
        }
        let phi = transition.actualization;
        let inflated = if self.weight.is_infinite() {
            transition.variance_factor.recip()
        } else {
            (self.weight.recip() + transition.variance_factor).recip()
        };
        let weight = inflated * phi * phi;
        if phi < NEGLIGIBLE_ACTUALIZATION || !(weight > 0. && weight.is_finite()) {
            let mut contrast = vec![0.; self.mean.len()];
            difference(&self.mean, &transition.displacement, &mut contrast);
            stats.add_contrast(&contrast, inflated.recip());
            return Self::empty(self.mean.len());
        }
        stats.log_norm -= self.mean.len() as f64 * phi.ln();
        let mean = izip!(&self.mean, &transition.displacement)
            .map(|(m, w)| (m - w) / phi)
            .collect();
        Self { weight, mean }
    }

    fn combine(self, other: Partial, stats: &mut ContrastStatistics) -> Self {
        if other.weight == 0. {
            return self;
        }
        if self.weight == 0. {
            return other;
        }
        let mut contrast = vec![0.; self.mean.len()];
        difference(&self.mean, &other.mean, &mut contrast);
        stats.add_contrast(&contrast, self.weight.recip() + other.weight.recip());
        let weight = self.weight + other.weight;
        let mut mean = vec![0.; self.mean.len()];
        weighted_sum(
            &self.mean,
            self.weight / weight,
            &other.mean,
            other.weight / weight,
            &mut mean,
        );
        Self { weight, mean }
    }
}

/// Prune one set of partials down the tree.
///
/// `tip_value` returns the observed value of a tip, `transition` the scalar law
/// of the branch above a node.
fn prune<V, T>(
    tree: &Tree,
    dim: usize,
    tip_value: V,
    transition: T,
    root_mean: &[f64],
    sample_size: f64,
) -> Result<ContrastStatistics, EvaluationError>
where
    V: Fn(usize) -> Option<Vec<f64>>,
    T: Fn(NodeId) -> Result<Option<ScalarTransition>, EvaluationError>,
{
    let mut stats = ContrastStatistics::new(dim);
    let mut partials: Vec<Option<Partial>> = vec![None; tree.node_count()];

    for &node in tree.post_order() {
        let partial = match tree.tip_index(node) {
            Some(tip) => match tip_value(tip) {
                Some(mean) => Partial {
                    weight: f64::INFINITY,
                    mean,
                },
                None => Partial::empty(dim),
            },
            None => tree
                .children(node)
                .iter()
                .filter_map(|&child| partials[child].take())
                .fold(Partial::empty(dim), |acc, child| acc.combine(child, &mut stats)),
        };
        partials[node] = Some(match transition(node)? {
            Some(transition) => partial.propagate(&transition, &mut stats),
            None => partial,
        });
    }

    if let Some(root) = partials[tree.root()].take() {
        if root.weight > 0. && root.weight.is_finite() {
            let mut contrast = vec![0.; dim];
            difference(&root.mean, root_mean, &mut contrast);
            stats.add_contrast(&contrast, root.weight.recip() + sample_size.recip());
        }
    }
    Ok(stats)
}

/// Contrast pass of the Scalar encoding.
pub(crate) fn scalar(model: &TraitModel) -> Result<ContrastStatistics, EvaluationError> {
    let data = model.data();
    let kernel = model.kernel();
    let root = model.root();
    let stats = prune(
        model.tree(),
        model.dim(),
        |tip| (!data.is_fully_missing(tip)).then(|| data.values(tip).to_vec()),
        |node| match model.branch_length(node) {
            Some((branch, t)) => kernel
                .scalar_transition(node, branch, t, root.mean())?
                .ok_or(EvaluationError::NonFinite)
                .map(Some),
            None => Ok(None),
        },
        root.mean(),
        root.sample_size(),
    )?;
    log::trace!("scalar contrast pass: {} contrasts", stats.count);
    Ok(stats)
}

/// Contrast passes of the Elementary encoding, one per coordinate.
pub(crate) fn elementary(
    model: &TraitModel,
    settings: &LikelihoodSettings,
) -> Result<CoordinateStatistics, EvaluationError> {
    let tree = model.tree();
    let data = model.data();
    let root = model.root();
    let dim = model.dim();

    let transitions: Vec<Option<Vec<ScalarTransition>>> = (0..tree.node_count())
        .map(|node| match model.branch_length(node) {
            Some((branch, t)) => model
                .kernel()
                .coordinate_transitions(node, branch, t, root.mean())?
                .ok_or(EvaluationError::NonFinite)
                .map(Some),
            None => Ok(None),
        })
        .collect::<Result<_, _>>()?;

    let coordinate = |k: usize| {
        prune(
            tree,
            1,
            |tip| (!data.is_missing(tip, k)).then(|| vec![data.values(tip)[k]]),
            |node| Ok(transitions[node].as_ref().map(|per| per[k].clone())),
            &root.mean()[k..k + 1],
            root.sample_size(),
        )
    };
    let coordinates: Vec<ContrastStatistics> = if settings.parallel {
        (0..dim).into_par_iter().map(coordinate).collect::<Result<_, _>>()?
    } else {
        (0..dim).map(coordinate).collect::<Result<_, _>>()?
    };
    Ok(CoordinateStatistics { coordinates })
}

#[cfg(test)]
mod test {
    use approx::assert_abs_diff_eq;

    use super::*;
    use crate::data::{PrecisionEncoding, TraitData};
    use crate::diffusion::{CompoundSymmetricMatrix, MatrixKind};
    use crate::kernel::DiffusionKernel;
    use crate::root::RootPrior;

    fn cherry(root: RootPrior) -> TraitModel {
        let tree = Tree::from_newick("(a:1,b:2);").unwrap();
        let data = TraitData::from_rows(vec![vec![1.], vec![-1.]])
            .unwrap()
            .with_encoding(PrecisionEncoding::Scalar);
        let diffusion = CompoundSymmetricMatrix::diagonal(MatrixKind::Variance, vec![0.5]).unwrap();
        TraitModel::new(tree, data, diffusion, DiffusionKernel::Brownian, root).unwrap()
    }

    #[test]
    fn cherry_with_fixed_root() {
        let model = cherry(RootPrior::fixed(vec![0.]));
        let diffusion = model.diffusion().resolve().unwrap();
        let stats = scalar(&model).unwrap();
        // Two independent observations N(0, 0.5 t).
        let expected: f64 = [(1f64, 1f64), (-1., 2.)]
            .iter()
            .map(|&(y, t)| -0.5 * y * y / (0.5 * t) - 0.5 * (LN_2PI + (0.5 * t).ln()))
            .sum();
        assert_eq!(stats.count, 2);
        assert_abs_diff_eq!(stats.log_likelihood(&diffusion), expected, epsilon = 1e-12);
    }

    #[test]
    fn cherry_with_conjugate_root() {
        let model = cherry(RootPrior::conjugate(vec![0.], 2.).unwrap());
        let diffusion = model.diffusion().resolve().unwrap();
        let stats = scalar(&model).unwrap();
        // Joint normal with covariance 0.5 (T + 1/κ).
        let c = [[0.5 * 1.5, 0.5 * 0.5], [0.5 * 0.5, 0.5 * 2.5]];
        let det = c[0][0] * c[1][1] - c[0][1] * c[1][0];
        let y = [1., -1.];
        let quad = (c[1][1] * y[0] * y[0] - 2. * c[0][1] * y[0] * y[1] + c[0][0] * y[1] * y[1]) / det;
        let expected = -0.5 * quad - LN_2PI - 0.5 * det.ln();
        assert_abs_diff_eq!(stats.log_likelihood(&diffusion), expected, epsilon = 1e-12);
    }

    #[test]
    fn missing_tip_adds_no_contrast() {
        let tree = Tree::from_newick("((a:1,b:1):1,c:1);").unwrap();
        let data = TraitData::from_rows(vec![vec![1., 2.], vec![f64::NAN, f64::NAN], vec![0., 0.5]])
            .unwrap()
            .with_encoding(PrecisionEncoding::Scalar);
        let diffusion = CompoundSymmetricMatrix::precision(vec![1., 2.], vec![0.3]).unwrap();
        let model = TraitModel::new(
            tree,
            data,
            diffusion,
            DiffusionKernel::Brownian,
            RootPrior::fixed(vec![0., 0.]),
        )
        .unwrap();
        assert_eq!(scalar(&model).unwrap().count, 2);
    }
}
