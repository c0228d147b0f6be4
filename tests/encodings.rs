mod common;

use anyhow::Result;
use approx::assert_abs_diff_eq;
use faer::linalg::solvers::Solve;
use faer::Mat;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tree_diffusion::{
    random_tree, simulate_data, Attenuation, BranchRates, BranchVector, CompoundSymmetricMatrix,
    DiffusionKernel, EvaluationError, GradientMode, LikelihoodSettings, MatrixKind,
    PrecisionEncoding, RootPrior, Target, TraitData, TraitModel, Tree, TreeLikelihood,
};

use common::{correlated_precision, diagonal_precision, log_likelihood, model, rows, TREE};

fn agree(
    encodings: &[PrecisionEncoding],
    diffusion: CompoundSymmetricMatrix,
    kernel: DiffusionKernel,
    root: RootPrior,
) -> Result<()> {
    let reference = log_likelihood(model(
        rows(),
        PrecisionEncoding::Full,
        diffusion.clone(),
        kernel.clone(),
        root.clone(),
    )?)?;
    for &encoding in encodings {
        let value = log_likelihood(model(
            rows(),
            encoding,
            diffusion.clone(),
            kernel.clone(),
            root.clone(),
        )?)?;
        assert_abs_diff_eq!(value, reference, epsilon = 1e-6);
    }
    Ok(())
}

#[test]
fn brownian_encodings_agree() -> Result<()> {
    let root = RootPrior::conjugate(vec![0.1, -0.2, 0.3], 2.5)?;
    agree(
        &[PrecisionEncoding::Scalar],
        correlated_precision(),
        DiffusionKernel::Brownian,
        root.clone(),
    )?;
    agree(
        &[PrecisionEncoding::Scalar, PrecisionEncoding::Elementary],
        diagonal_precision(),
        DiffusionKernel::Brownian,
        root,
    )
}

#[test]
fn drift_encodings_agree() -> Result<()> {
    let root = RootPrior::fixed(vec![0.5, 0., -0.5]);
    let shared = DiffusionKernel::Drift(BranchVector::Shared(vec![0.4, -0.3, 0.2]));
    agree(&[PrecisionEncoding::Scalar], correlated_precision(), shared.clone(), root.clone())?;
    agree(
        &[PrecisionEncoding::Scalar, PrecisionEncoding::Elementary],
        diagonal_precision(),
        shared,
        root.clone(),
    )?;

    let per_branch = (0..8)
        .map(|b| vec![0.1 * b as f64, -0.05 * b as f64, 0.2])
        .collect();
    agree(
        &[PrecisionEncoding::Scalar],
        correlated_precision(),
        DiffusionKernel::Drift(BranchVector::PerBranch(per_branch)),
        root.clone(),
    )?;
    agree(
        &[PrecisionEncoding::Scalar],
        correlated_precision(),
        DiffusionKernel::Drift(BranchVector::RootMean),
        root,
    )
}

#[test]
fn isotropic_ou_encodings_agree() -> Result<()> {
    let kernel = |attenuation| DiffusionKernel::OrnsteinUhlenbeck {
        attenuation,
        optimum: BranchVector::Shared(vec![1., -1., 0.5]),
    };
    let root = RootPrior::conjugate(vec![0.2, 0.1, 0.], 4.)?;
    agree(
        &[PrecisionEncoding::Scalar],
        correlated_precision(),
        kernel(Attenuation::diagonal(vec![0.8; 3])?),
        root.clone(),
    )?;
    agree(
        &[PrecisionEncoding::Scalar, PrecisionEncoding::Elementary],
        diagonal_precision(),
        kernel(Attenuation::diagonal(vec![0.8; 3])?),
        root,
    )
}

#[test]
fn long_ou_branches_close_their_subtree() -> Result<()> {
    // At α t = 400 the cherry forgets the root: Φ underflows in the
    // contrast passes and the subtree must be scored against the optimum.
    for length in [400., 1000.] {
        let tree = Tree::from_newick(&format!("((a:1,b:1):{length},c:1);"))?;
        let data = TraitData::from_rows(vec![vec![0.3, -0.2], vec![1.1, 0.4], vec![-0.5, 0.9]])?;
        let diffusion = CompoundSymmetricMatrix::precision(vec![1.5, 0.7], vec![0.])?;
        let kernel = DiffusionKernel::OrnsteinUhlenbeck {
            attenuation: Attenuation::diagonal(vec![1.; 2])?,
            optimum: BranchVector::Shared(vec![0.5, -0.5]),
        };
        let root = RootPrior::conjugate(vec![0.2, 0.1], 2.)?;
        let value = |encoding| {
            log_likelihood(TraitModel::new(
                tree.clone(),
                data.clone().with_encoding(encoding),
                diffusion.clone(),
                kernel.clone(),
                root.clone(),
            )?)
        };
        let full = value(PrecisionEncoding::Full)?;
        assert!(full < 0.);
        assert_abs_diff_eq!(value(PrecisionEncoding::Scalar)?, full, epsilon = 1e-6);
        assert_abs_diff_eq!(value(PrecisionEncoding::Elementary)?, full, epsilon = 1e-6);

        let likelihood = TreeLikelihood::new(
            TraitModel::new(tree, data, diffusion, kernel, root)?,
            LikelihoodSettings::default(),
        );
        let (_, branch) = likelihood.gradient(&[Target::DiffusionDiagonal], GradientMode::BranchSpecific)?;
        for mode in [GradientMode::Wishart, GradientMode::Elementary] {
            let (_, gradient) = likelihood.gradient(&[Target::DiffusionDiagonal], mode)?;
            for (a, b) in branch.iter().zip(&gradient) {
                assert_abs_diff_eq!(a, b, epsilon = 1e-6);
            }
        }
    }
    Ok(())
}

#[test]
fn diagonal_ou_encodings_agree() -> Result<()> {
    let optimum = BranchVector::Shared(vec![1., -1., 0.5]);
    let root = RootPrior::fixed(vec![0.2, 0.1, 0.]);
    let rates = vec![0.3, 1.2, 2.];
    agree(
        &[PrecisionEncoding::Elementary],
        diagonal_precision(),
        DiffusionKernel::OrnsteinUhlenbeck {
            attenuation: Attenuation::diagonal(rates.clone())?,
            optimum: optimum.clone(),
        },
        root.clone(),
    )?;

    // A full attenuation that happens to be diagonal takes the eigen path in
    // the Full encoding and the coordinate path in the Elementary one.
    let full_diagonal = DiffusionKernel::OrnsteinUhlenbeck {
        attenuation: Attenuation::full(Mat::from_fn(3, 3, |i, j| if i == j { rates[i] } else { 0. }))?,
        optimum: optimum.clone(),
    };
    agree(
        &[PrecisionEncoding::Elementary],
        diagonal_precision(),
        full_diagonal.clone(),
        root.clone(),
    )?;
    let fast = log_likelihood(model(
        rows(),
        PrecisionEncoding::Full,
        correlated_precision(),
        DiffusionKernel::OrnsteinUhlenbeck {
            attenuation: Attenuation::diagonal(rates)?,
            optimum,
        },
        root.clone(),
    )?)?;
    let eigen = log_likelihood(model(
        rows(),
        PrecisionEncoding::Full,
        correlated_precision(),
        full_diagonal,
        root,
    )?)?;
    assert_abs_diff_eq!(fast, eigen, epsilon = 1e-8);
    Ok(())
}

#[test]
fn unsupported_encodings_fail_at_construction() -> Result<()> {
    let full_ou = DiffusionKernel::OrnsteinUhlenbeck {
        attenuation: Attenuation::from_upper(3, &[1., 0.2, 0., 0.8, 0.1, 1.5])?,
        optimum: BranchVector::Shared(vec![0.; 3]),
    };
    assert!(model(
        rows(),
        PrecisionEncoding::Scalar,
        correlated_precision(),
        full_ou.clone(),
        RootPrior::fixed(vec![0.; 3]),
    )
    .is_err());
    assert!(model(
        rows(),
        PrecisionEncoding::Elementary,
        diagonal_precision(),
        full_ou,
        RootPrior::fixed(vec![0.; 3]),
    )
    .is_err());
    assert!(model(
        rows(),
        PrecisionEncoding::Elementary,
        correlated_precision(),
        DiffusionKernel::Brownian,
        RootPrior::fixed(vec![0.; 3]),
    )
    .is_err());
    Ok(())
}

/// Dense `N(μ0 ⊗ 1, (C + 1/κ) ⊗ Σ + I ⊗ S)` over the observed entries.
fn brownian_marginal(
    tree: &Tree,
    data: &TraitData,
    sigma: &Mat<f64>,
    sampling: &Mat<f64>,
    root: &RootPrior,
) -> f64 {
    let dim = data.dim();
    let tips = tree.tips();
    let rates = BranchRates::default();
    let mut entries = vec![];
    for (i, _) in tips.iter().enumerate() {
        for k in 0..dim {
            if !data.is_missing(i, k) {
                entries.push((i, k));
            }
        }
    }
    let prior_variance = if root.is_fixed() { 0. } else { root.sample_size().recip() };
    let cov = Mat::from_fn(entries.len(), entries.len(), |a, b| {
        let (i, k) = entries[a];
        let (j, l) = entries[b];
        let shared = tree.root_distance(tree.common_ancestor(tips[i], tips[j]), &rates);
        let noise = if i == j { sampling[(k, l)] } else { 0. };
        (shared + prior_variance) * sigma[(k, l)] + noise
    });
    let values: Vec<f64> = entries.iter().map(|&(i, k)| data.values(i)[k]).collect();
    let mean: Vec<f64> = entries.iter().map(|&(_, k)| root.mean()[k]).collect();
    common::dense_normal(&values, &mean, &cov)
}

#[test]
fn brownian_recursion_matches_dense_marginal() -> Result<()> {
    let diffusion = CompoundSymmetricMatrix::variance(vec![0.8, 1.3, 0.5], vec![0.4, -0.3, 0.2])?;
    let sigma = diffusion.matrix();
    for root in [
        RootPrior::fixed(vec![0.1, -0.2, 0.3]),
        RootPrior::conjugate(vec![0.1, -0.2, 0.3], 1.7)?,
    ] {
        for missing in [vec![], vec![1, 5, 6, 7, 8, 12]] {
            let tree = Tree::from_newick(TREE)?;
            let data = TraitData::from_rows(rows())?.with_missing_flat(&missing)?;
            let expected = brownian_marginal(&tree, &data, &sigma, &Mat::zeros(3, 3), &root);
            let model = TraitModel::new(tree, data, diffusion.clone(), DiffusionKernel::Brownian, root.clone())?;
            assert_abs_diff_eq!(log_likelihood(model)?, expected, epsilon = 1e-8);
        }
    }
    Ok(())
}

#[test]
fn sampling_error_matches_dense_marginal() -> Result<()> {
    let diffusion = CompoundSymmetricMatrix::variance(vec![0.8, 1.3, 0.5], vec![0.4, -0.3, 0.2])?;
    let sigma = diffusion.matrix();
    for sampling in [
        CompoundSymmetricMatrix::variance(vec![0.1, 0.2, 0.3], vec![0.1, -0.05, 0.2])?,
        CompoundSymmetricMatrix::precision(vec![4., 6., 3.], vec![0.2, 0.1, -0.1])?,
    ] {
        let noise = match sampling.kind() {
            MatrixKind::Variance => sampling.matrix(),
            MatrixKind::Precision => {
                let llt = sampling.matrix().as_ref().llt(faer::Side::Lower).unwrap();
                llt.solve(Mat::<f64>::identity(3, 3).as_ref())
            }
        };
        for missing in [vec![], vec![1, 5, 6, 7, 8, 12]] {
            let root = RootPrior::conjugate(vec![0.1, -0.2, 0.3], 1.7)?;
            let tree = Tree::from_newick(TREE)?;
            let data = TraitData::from_rows(rows())?.with_missing_flat(&missing)?;
            let expected = brownian_marginal(&tree, &data, &sigma, &noise, &root);
            let model = TraitModel::new(tree, data, diffusion.clone(), DiffusionKernel::Brownian, root)?
                .with_sampling(sampling.clone())?;
            assert_abs_diff_eq!(log_likelihood(model)?, expected, epsilon = 1e-8);
        }
    }

    // Sampling error needs the full encoding.
    let model = model(
        rows(),
        PrecisionEncoding::Scalar,
        correlated_precision(),
        DiffusionKernel::Brownian,
        RootPrior::fixed(vec![0.; 3]),
    )?;
    let sampling = CompoundSymmetricMatrix::diagonal(MatrixKind::Variance, vec![0.1; 3])?;
    assert!(model.with_sampling(sampling.clone()).is_err());
    let narrow = CompoundSymmetricMatrix::diagonal(MatrixKind::Variance, vec![0.1; 2])?;
    let full = common::model(
        rows(),
        PrecisionEncoding::Full,
        correlated_precision(),
        DiffusionKernel::Brownian,
        RootPrior::fixed(vec![0.; 3]),
    )?;
    assert!(full.with_sampling(narrow).is_err());
    Ok(())
}

#[test]
fn missing_coordinate_matches_reduced_dimension() -> Result<()> {
    let diffusion = CompoundSymmetricMatrix::variance(vec![0.8, 1.3, 0.5], vec![0.4, -0.3, 0.2])?;
    let root = RootPrior::conjugate(vec![0.1, -0.2, 0.3], 3.)?;
    let rates = vec![0.5, 1.5, 0.9];
    let optimum = vec![1., 0., -1.];
    for coordinate in 0..3 {
        let keep: Vec<usize> = (0..3).filter(|&k| k != coordinate).collect();
        let pick = |values: &[f64]| keep.iter().map(|&k| values[k]).collect::<Vec<f64>>();
        let cases = [
            (
                DiffusionKernel::Brownian,
                DiffusionKernel::Brownian,
            ),
            (
                DiffusionKernel::OrnsteinUhlenbeck {
                    attenuation: Attenuation::diagonal(rates.clone())?,
                    optimum: BranchVector::Shared(optimum.clone()),
                },
                DiffusionKernel::OrnsteinUhlenbeck {
                    attenuation: Attenuation::diagonal(pick(&rates))?,
                    optimum: BranchVector::Shared(pick(&optimum)),
                },
            ),
        ];
        for (kernel, reduced_kernel) in cases {
            let missing: Vec<usize> = (0..5).map(|tip| tip * 3 + coordinate).collect();
            let tree = Tree::from_newick(TREE)?;
            let data = TraitData::from_rows(rows())?;
            let reduced = TraitModel::new(
                tree.clone(),
                data.without_coordinate(coordinate)?,
                diffusion.without_coordinate(coordinate)?,
                reduced_kernel,
                RootPrior::conjugate(pick(root.mean()), root.sample_size())?,
            )?;
            let masked = TraitModel::new(
                tree,
                data.with_missing_flat(&missing)?,
                diffusion.clone(),
                kernel,
                root.clone(),
            )?;
            assert_abs_diff_eq!(log_likelihood(masked)?, log_likelihood(reduced)?, epsilon = 1e-8);
        }
    }
    Ok(())
}

#[test]
fn parallel_matches_sequential() -> Result<()> {
    let mut rng = ChaCha8Rng::seed_from_u64(17);
    let tree = random_tree(64, &mut rng)?;
    let placeholder = TraitData::from_rows(vec![vec![0.; 3]; 64])?;
    let model = TraitModel::new(
        tree,
        placeholder,
        correlated_precision(),
        DiffusionKernel::OrnsteinUhlenbeck {
            attenuation: Attenuation::from_upper(3, &[1., 0.2, 0., 0.8, 0.1, 1.5])?,
            optimum: BranchVector::Shared(vec![0.5, -0.5, 0.]),
        },
        RootPrior::conjugate(vec![0.; 3], 2.)?,
    )?;
    let data = simulate_data(&model, &mut rng)?.with_missing_flat(&[0, 4, 8, 30, 31, 32])?;
    let model = model.with_data(data)?;

    let parallel = LikelihoodSettings {
        parallel: true,
        min_parallel_level: 2,
    };
    let sequential = TreeLikelihood::new(model.clone(), LikelihoodSettings::default());
    let parallel = TreeLikelihood::new(model, parallel);
    assert_abs_diff_eq!(sequential.log_likelihood()?, parallel.log_likelihood()?, epsilon = 1e-10);

    let targets = [Target::DiffusionDiagonal, Target::AttenuationFull, Target::Optimum];
    let (_, a) = sequential.gradient(&targets, GradientMode::BranchSpecific)?;
    let (_, b) = parallel.gradient(&targets, GradientMode::BranchSpecific)?;
    for (a, b) in a.iter().zip(&b) {
        assert_abs_diff_eq!(a, b, epsilon = 1e-10);
    }
    Ok(())
}

#[test]
fn zero_branch_length_is_an_error() -> Result<()> {
    let tree = Tree::from_newick("((a:0,b:1):1,c:1);")?;
    let data = TraitData::from_rows(vec![vec![0.1], vec![0.2], vec![0.3]])?;
    let diffusion = CompoundSymmetricMatrix::diagonal(MatrixKind::Precision, vec![1.])?;
    for kernel in [
        DiffusionKernel::Brownian,
        DiffusionKernel::OrnsteinUhlenbeck {
            attenuation: Attenuation::diagonal(vec![1.])?,
            optimum: BranchVector::Shared(vec![0.]),
        },
    ] {
        for encoding in [PrecisionEncoding::Full, PrecisionEncoding::Scalar, PrecisionEncoding::Elementary] {
            let model = TraitModel::new(
                tree.clone(),
                data.clone().with_encoding(encoding),
                diffusion.clone(),
                kernel.clone(),
                RootPrior::fixed(vec![0.]),
            )?;
            let likelihood = TreeLikelihood::new(model, LikelihoodSettings::default());
            assert!(matches!(
                likelihood.log_likelihood(),
                Err(EvaluationError::ZeroBranchLength { .. })
            ));
            assert!(matches!(
                likelihood.gradient(&[Target::DiffusionDiagonal], GradientMode::BranchSpecific),
                Err(EvaluationError::ZeroBranchLength { .. })
            ));
        }
    }
    Ok(())
}
