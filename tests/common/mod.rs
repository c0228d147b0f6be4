#![allow(dead_code)]

use faer::{Mat, Side};
use tree_diffusion::{
    CompoundSymmetricMatrix, DiffusionKernel, LikelihoodSettings, PrecisionEncoding, RootPrior,
    TraitData, TraitModel, Tree, TreeLikelihood,
};

pub const TREE: &str = "((a:0.4,b:0.9):0.3,(c:0.5,(d:0.2,e:0.6):0.35):0.25);";

pub fn rows() -> Vec<Vec<f64>> {
    vec![
        vec![0.3, -1.2, 2.0],
        vec![1.1, 0.4, 1.5],
        vec![-0.4, 0.8, -0.3],
        vec![0.9, 0.1, 0.7],
        vec![-1.3, -0.6, 1.1],
    ]
}

pub fn correlated_precision() -> CompoundSymmetricMatrix {
    CompoundSymmetricMatrix::precision(vec![1.5, 0.7, 2.2], vec![0.3, -0.2, 0.1]).unwrap()
}

pub fn diagonal_precision() -> CompoundSymmetricMatrix {
    CompoundSymmetricMatrix::precision(vec![1.5, 0.7, 2.2], vec![0., 0., 0.]).unwrap()
}

pub fn model(
    rows: Vec<Vec<f64>>,
    encoding: PrecisionEncoding,
    diffusion: CompoundSymmetricMatrix,
    kernel: DiffusionKernel,
    root: RootPrior,
) -> anyhow::Result<TraitModel> {
    let tree = Tree::from_newick(TREE)?;
    let data = TraitData::from_rows(rows)?.with_encoding(encoding);
    Ok(TraitModel::new(tree, data, diffusion, kernel, root)?)
}

pub fn log_likelihood(model: TraitModel) -> anyhow::Result<f64> {
    Ok(TreeLikelihood::new(model, LikelihoodSettings::default()).log_likelihood()?)
}

/// Log density of `N(mean, cov)` through a dense Cholesky factor.
pub fn dense_normal(values: &[f64], mean: &[f64], cov: &Mat<f64>) -> f64 {
    let n = values.len();
    let llt = cov.as_ref().llt(Side::Lower).unwrap();
    let lower = llt.L();
    let mut z = vec![0.; n];
    for i in 0..n {
        let mut acc = values[i] - mean[i];
        for j in 0..i {
            acc -= lower[(i, j)] * z[j];
        }
        z[i] = acc / lower[(i, i)];
    }
    let log_det: f64 = (0..n).map(|i| 2. * lower[(i, i)].ln()).sum();
    let quad: f64 = z.iter().map(|v| v * v).sum();
    -0.5 * (quad + log_det + n as f64 * (2. * std::f64::consts::PI).ln())
}
