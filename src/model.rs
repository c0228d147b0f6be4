use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::data::{PrecisionEncoding, TraitData};
use crate::diffusion::CompoundSymmetricMatrix;
use crate::kernel::{Attenuation, DiffusionKernel};
use crate::root::RootPrior;
use crate::tree::{BranchRates, NodeId, Tree};

/// Errors in the configuration of a model or of a provider.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModelError {
    #[error("dimension mismatch in {what}: expected {expected}, found {found}")]
    DimensionMismatch {
        what: &'static str,
        expected: usize,
        found: usize,
    },
    #[error("{0} is not positive definite")]
    NotPositiveDefinite(&'static str),
    #[error("invalid tree: {0}")]
    InvalidTree(String),
    #[error("invalid value {value} for {name}")]
    InvalidParameter { name: &'static str, value: f64 },
    #[error("{encoding:?} precision encoding needs {requirement}")]
    UnsupportedEncoding {
        encoding: PrecisionEncoding,
        requirement: &'static str,
    },
    #[error("gradient target {target} is not available: {reason}")]
    UnsupportedTarget {
        target: &'static str,
        reason: &'static str,
    },
    #[error("could not parse newick at byte {position}: {message}")]
    Newick { position: usize, message: String },
}

/// Parameters a gradient can be requested for.
///
/// Every target maps to a flat vector with a fixed layout, see
/// [`TraitModel::parameter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Target {
    /// Diagonal of the diffusion precision (or variance).
    DiffusionDiagonal,
    /// Strict upper triangle of the diffusion correlations.
    DiffusionCorrelation,
    /// Drift rates, shared or concatenated per branch.
    Drift,
    /// OU optimum, shared or concatenated per branch.
    Optimum,
    RootMean,
    RootSampleSize,
    /// Diagonal OU attenuation.
    AttenuationDiagonal,
    /// Upper triangle (with diagonal) of a full OU attenuation.
    AttenuationFull,
    /// One strict-clock rate, or one rate per branch.
    BranchRates,
    /// Diagonal of the per-tip sampling precision (or variance).
    SamplingDiagonal,
    /// Strict upper triangle of the sampling correlations.
    SamplingCorrelation,
}

impl Target {
    pub fn name(&self) -> &'static str {
        match self {
            Target::DiffusionDiagonal => "diffusion diagonal",
            Target::DiffusionCorrelation => "diffusion correlation",
            Target::Drift => "drift",
            Target::Optimum => "optimum",
            Target::RootMean => "root mean",
            Target::RootSampleSize => "root sample size",
            Target::AttenuationDiagonal => "diagonal attenuation",
            Target::AttenuationFull => "full attenuation",
            Target::BranchRates => "branch rates",
            Target::SamplingDiagonal => "sampling diagonal",
            Target::SamplingCorrelation => "sampling correlation",
        }
    }
}

/// One immutable snapshot of a trait evolution model.
///
/// Tree and data are shared between snapshots, so deriving a new snapshot
/// with [`TraitModel::with_parameters`] only copies the parameters.
#[derive(Debug, Clone)]
pub struct TraitModel {
    tree: Arc<Tree>,
    data: Arc<TraitData>,
    rates: BranchRates,
    diffusion: CompoundSymmetricMatrix,
    kernel: DiffusionKernel,
    root: RootPrior,
    /// Within-tip sampling error: tip data are `x + ε` with `ε ~ N(0, S)`.
    sampling: Option<CompoundSymmetricMatrix>,
}

impl TraitModel {
    pub fn new(
        tree: Tree,
        data: TraitData,
        diffusion: CompoundSymmetricMatrix,
        kernel: DiffusionKernel,
        root: RootPrior,
    ) -> Result<Self, ModelError> {
        let model = Self {
            tree: Arc::new(tree),
            data: Arc::new(data),
            rates: BranchRates::default(),
            diffusion,
            kernel,
            root,
            sampling: None,
        };
        model.validate()?;
        log::debug!(
            "trait model with {} tips, dimension {}, {:?} encoding",
            model.tree.tip_count(),
            model.dim(),
            model.data.encoding()
        );
        Ok(model)
    }

    pub fn with_rates(mut self, rates: BranchRates) -> Result<Self, ModelError> {
        self.rates = rates;
        self.validate()?;
        Ok(self)
    }

    /// Observe every tip with independent sampling error of the given
    /// precision or variance, as for the mean of repeated measurements.
    pub fn with_sampling(mut self, sampling: CompoundSymmetricMatrix) -> Result<Self, ModelError> {
        self.sampling = Some(sampling);
        self.validate()?;
        Ok(self)
    }

    /// The same parameters on different data.
    pub fn with_data(&self, data: TraitData) -> Result<Self, ModelError> {
        let mut model = self.clone();
        model.data = Arc::new(data);
        model.validate()?;
        Ok(model)
    }

    fn validate(&self) -> Result<(), ModelError> {
        self.data.validate(&self.tree)?;
        let dim = self.dim();
        if self.diffusion.dim() != dim {
            return Err(ModelError::DimensionMismatch {
                what: "diffusion matrix",
                expected: dim,
                found: self.diffusion.dim(),
            });
        }
        self.kernel.validate(dim, self.tree.branch_count())?;
        self.root.validate(dim)?;
        self.rates.validate(&self.tree)?;
        self.diffusion.resolve()?;
        if let Some(sampling) = &self.sampling {
            if sampling.dim() != dim {
                return Err(ModelError::DimensionMismatch {
                    what: "sampling matrix",
                    expected: dim,
                    found: sampling.dim(),
                });
            }
            sampling.resolve()?;
            if self.data.encoding() != PrecisionEncoding::Full {
                return Err(ModelError::UnsupportedEncoding {
                    encoding: self.data.encoding(),
                    requirement: "tips without sampling error",
                });
            }
        }

        match self.data.encoding() {
            PrecisionEncoding::Full => {}
            PrecisionEncoding::Scalar => {
                if !self.kernel.supports_scalar() {
                    return Err(ModelError::UnsupportedEncoding {
                        encoding: PrecisionEncoding::Scalar,
                        requirement: "a Brownian kernel or an isotropic attenuation",
                    });
                }
                if self.data.has_partially_missing() {
                    return Err(ModelError::UnsupportedEncoding {
                        encoding: PrecisionEncoding::Scalar,
                        requirement: "tips that are fully observed or fully missing",
                    });
                }
            }
            PrecisionEncoding::Elementary => {
                if !self.diffusion.is_diagonal() {
                    return Err(ModelError::UnsupportedEncoding {
                        encoding: PrecisionEncoding::Elementary,
                        requirement: "an uncorrelated diffusion matrix",
                    });
                }
                if !self.kernel.supports_elementary() {
                    return Err(ModelError::UnsupportedEncoding {
                        encoding: PrecisionEncoding::Elementary,
                        requirement: "a diagonal attenuation",
                    });
                }
            }
        }
        Ok(())
    }

    pub fn dim(&self) -> usize {
        self.data.dim()
    }

    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    pub fn data(&self) -> &TraitData {
        &self.data
    }

    pub fn rates(&self) -> &BranchRates {
        &self.rates
    }

    pub fn diffusion(&self) -> &CompoundSymmetricMatrix {
        &self.diffusion
    }

    pub fn kernel(&self) -> &DiffusionKernel {
        &self.kernel
    }

    pub fn root(&self) -> &RootPrior {
        &self.root
    }

    pub fn sampling(&self) -> Option<&CompoundSymmetricMatrix> {
        self.sampling.as_ref()
    }

    /// Rescaled length of the branch above `node`.
    pub(crate) fn branch_length(&self, node: NodeId) -> Option<(usize, f64)> {
        let branch = self.tree.branch_index(node)?;
        Some((branch, self.tree.length(node) * self.rates.rate(branch)))
    }

    pub fn parameter(&self, target: Target) -> Result<Vec<f64>, ModelError> {
        let unsupported = |reason| ModelError::UnsupportedTarget {
            target: target.name(),
            reason,
        };
        match target {
            Target::DiffusionDiagonal => Ok(self.diffusion.diagonal_values().to_vec()),
            Target::DiffusionCorrelation => Ok(self.diffusion.correlation_values().to_vec()),
            Target::Drift => match &self.kernel {
                DiffusionKernel::Drift(drift) => {
                    drift.flat().ok_or(unsupported("drift is tied to the root mean"))
                }
                _ => Err(unsupported("the kernel has no drift")),
            },
            Target::Optimum => match &self.kernel {
                DiffusionKernel::OrnsteinUhlenbeck { optimum, .. } => {
                    optimum.flat().ok_or(unsupported("optimum is tied to the root mean"))
                }
                _ => Err(unsupported("the kernel has no optimum")),
            },
            Target::RootMean => Ok(self.root.mean().to_vec()),
            Target::RootSampleSize => {
                if self.root.is_fixed() {
                    Err(unsupported("the root is fixed"))
                } else {
                    Ok(vec![self.root.sample_size()])
                }
            }
            Target::AttenuationDiagonal => match &self.kernel {
                DiffusionKernel::OrnsteinUhlenbeck {
                    attenuation: Attenuation::Diagonal(rates),
                    ..
                } => Ok(rates.clone()),
                _ => Err(unsupported("the kernel has no diagonal attenuation")),
            },
            Target::AttenuationFull => match &self.kernel {
                DiffusionKernel::OrnsteinUhlenbeck {
                    attenuation: attenuation @ Attenuation::Full(_),
                    ..
                } => Ok(attenuation.upper_values()),
                _ => Err(unsupported("the kernel has no full attenuation")),
            },
            Target::BranchRates => Ok(self.rates.values()),
            Target::SamplingDiagonal => self
                .sampling
                .as_ref()
                .map(|s| s.diagonal_values().to_vec())
                .ok_or(unsupported("the model has no sampling error")),
            Target::SamplingCorrelation => self
                .sampling
                .as_ref()
                .map(|s| s.correlation_values().to_vec())
                .ok_or(unsupported("the model has no sampling error")),
        }
    }

    pub fn parameter_dim(&self, target: Target) -> Result<usize, ModelError> {
        Ok(self.parameter(target)?.len())
    }

    pub fn set_parameter(&mut self, target: Target, values: &[f64]) -> Result<(), ModelError> {
        let expected = self.parameter_dim(target)?;
        if values.len() != expected {
            return Err(ModelError::DimensionMismatch {
                what: target.name(),
                expected,
                found: values.len(),
            });
        }
        match target {
            Target::DiffusionDiagonal => self.diffusion.set_diagonal(values)?,
            Target::DiffusionCorrelation => self.diffusion.set_correlation(values)?,
            Target::Drift => {
                if let DiffusionKernel::Drift(drift) = &mut self.kernel {
                    drift.set_flat("drift", values)?;
                }
            }
            Target::Optimum => {
                if let DiffusionKernel::OrnsteinUhlenbeck { optimum, .. } = &mut self.kernel {
                    optimum.set_flat("optimum", values)?;
                }
            }
            Target::RootMean => self.root.set_mean(values)?,
            Target::RootSampleSize => self.root.set_sample_size(values[0])?,
            Target::AttenuationDiagonal => {
                if let DiffusionKernel::OrnsteinUhlenbeck { attenuation, .. } = &mut self.kernel {
                    *attenuation = Attenuation::diagonal(values.to_vec())?;
                }
            }
            Target::AttenuationFull => {
                if let DiffusionKernel::OrnsteinUhlenbeck { attenuation, .. } = &mut self.kernel {
                    *attenuation = Attenuation::from_upper(self.data.dim(), values)?;
                }
            }
            Target::BranchRates => {
                self.rates = match self.rates {
                    BranchRates::Strict(_) => BranchRates::Strict(values[0]),
                    BranchRates::PerBranch(_) => BranchRates::PerBranch(values.to_vec()),
                };
            }
            Target::SamplingDiagonal => {
                if let Some(sampling) = &mut self.sampling {
                    sampling.set_diagonal(values)?;
                }
            }
            Target::SamplingCorrelation => {
                if let Some(sampling) = &mut self.sampling {
                    sampling.set_correlation(values)?;
                }
            }
        }
        self.validate()
    }

    /// Concatenated parameter values of several targets.
    pub fn parameters(&self, targets: &[Target]) -> Result<Vec<f64>, ModelError> {
        let mut out = vec![];
        for &target in targets {
            out.extend(self.parameter(target)?);
        }
        Ok(out)
    }

    /// A new snapshot with the concatenated `values` assigned to `targets`.
    pub fn with_parameters(&self, targets: &[Target], values: &[f64]) -> Result<Self, ModelError> {
        let mut model = self.clone();
        let mut offset = 0;
        for &target in targets {
            let dim = model.parameter_dim(target)?;
            let end = offset + dim;
            if end > values.len() {
                return Err(ModelError::DimensionMismatch {
                    what: "parameter vector",
                    expected: end,
                    found: values.len(),
                });
            }
            model.set_parameter(target, &values[offset..end])?;
            offset = end;
        }
        if offset != values.len() {
            return Err(ModelError::DimensionMismatch {
                what: "parameter vector",
                expected: offset,
                found: values.len(),
            });
        }
        Ok(model)
    }
}
