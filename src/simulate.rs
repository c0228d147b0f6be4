//! Draw trait data and trees from the model.

use faer::Col;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Exp1, StandardNormal};
use rayon::prelude::*;

use crate::data::TraitData;
use crate::likelihood::EvaluationError;
use crate::linalg::{cholesky_lower, col_from_slice, col_to_vec, scaled};
use crate::model::{ModelError, TraitModel};
use crate::tree::{NodeId, Tree};

fn standard_normal<R: Rng + ?Sized>(dim: usize, rng: &mut R) -> Col<f64> {
    Col::from_fn(dim, |_| rng.sample(StandardNormal))
}

/// Tip values drawn from the model, one row per tip, including sampling
/// error when the model has one.
///
/// The stored data of the model only provides the dimension and is ignored
/// otherwise.
pub fn simulate<R: Rng + ?Sized>(
    model: &TraitModel,
    rng: &mut R,
) -> Result<Vec<Vec<f64>>, EvaluationError> {
    let tree = model.tree();
    let dim = model.dim();
    let diffusion = model.diffusion().resolve()?;
    let root = model.root();

    let mut values: Vec<Option<Col<f64>>> = vec![None; tree.node_count()];
    let mean = col_from_slice(root.mean());
    values[tree.root()] = Some(if root.is_fixed() {
        mean
    } else {
        let variance = scaled(&diffusion.variance, root.sample_size().recip());
        let factor = cholesky_lower(&variance).ok_or(EvaluationError::NotPositiveDefinite {
            what: "root prior variance",
            node: None,
        })?;
        &mean + &factor * &standard_normal(dim, rng)
    });

    for &node in tree.pre_order() {
        let (Some((branch, t)), Some(parent)) = (model.branch_length(node), tree.parent(node)) else {
            continue;
        };
        let transition = model
            .kernel()
            .transition(node, branch, t, &diffusion, root.mean())?;
        let factor = cholesky_lower(&transition.variance).ok_or(EvaluationError::NotPositiveDefinite {
            what: "branch variance",
            node: Some(node),
        })?;
        let parent_value = values[parent].as_ref().ok_or(EvaluationError::NonFinite)?;
        let value = &transition.actualization * parent_value
            + &transition.displacement
            + &factor * &standard_normal(dim, rng);
        values[node] = Some(value);
    }

    let noise = match model.sampling() {
        Some(sampling) => {
            let variance = sampling.resolve()?.variance;
            Some(cholesky_lower(&variance).ok_or(EvaluationError::NotPositiveDefinite {
                what: "sampling variance",
                node: None,
            })?)
        }
        None => None,
    };

    tree.tips()
        .iter()
        .map(|&tip| {
            let value = values[tip].as_ref().ok_or(EvaluationError::NonFinite)?;
            Ok(match &noise {
                Some(factor) => col_to_vec(&(value + factor * &standard_normal(dim, rng))),
                None => col_to_vec(value),
            })
        })
        .collect()
}

/// Simulated data with the encoding and missing pattern of the model's data.
pub fn simulate_data<R: Rng + ?Sized>(model: &TraitModel, rng: &mut R) -> Result<TraitData, EvaluationError> {
    let rows = simulate(model, rng)?;
    let current = model.data();
    let missing = (0..current.tip_count())
        .map(|tip| current.missing(tip).to_vec())
        .collect();
    Ok(TraitData::new(rows, missing)?.with_encoding(current.encoding()))
}

/// Independent replicates, simulated in parallel. Replicate `i` uses stream
/// `i` of a ChaCha generator seeded with `seed`, so the output does not
/// depend on the thread count.
pub fn simulate_replicates(
    model: &TraitModel,
    seed: u64,
    count: usize,
) -> Result<Vec<TraitData>, EvaluationError> {
    (0..count)
        .into_par_iter()
        .map(|replicate| {
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            rng.set_stream(replicate as u64);
            simulate_data(model, &mut rng)
        })
        .collect()
}

/// Random binary tree with `tips` tips and coalescent branch lengths.
///
/// Tips are nodes `0..tips` and named `t0`, `t1`, ...
pub fn random_tree<R: Rng + ?Sized>(tips: usize, rng: &mut R) -> Result<Tree, ModelError> {
    if tips == 0 {
        return Err(ModelError::InvalidTree("a tree needs at least one tip".into()));
    }
    let total = 2 * tips - 1;
    let mut parents: Vec<Option<NodeId>> = vec![None; total];
    let mut heights = vec![0f64; total];
    let mut active: Vec<NodeId> = (0..tips).collect();
    let mut height = 0.;
    for node in tips..total {
        let lineages = active.len() as f64;
        let waiting: f64 = rng.sample(Exp1);
        height += 2. * waiting / (lineages * (lineages - 1.));
        for _ in 0..2 {
            let child = active.swap_remove(rng.random_range(0..active.len()));
            parents[child] = Some(node);
        }
        heights[node] = height;
        active.push(node);
    }
    let lengths: Vec<f64> = (0..total)
        .map(|node| parents[node].map_or(0., |parent| heights[parent] - heights[node]))
        .collect();
    let names = (0..total)
        .map(|node| (node < tips).then(|| format!("t{node}")))
        .collect();
    Tree::from_parents(&parents, &lengths, names)
}
