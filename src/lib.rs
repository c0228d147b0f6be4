//! Likelihoods and analytic gradients of multivariate continuous-trait
//! diffusions on phylogenetic trees.

pub(crate) mod contrasts;
pub(crate) mod data;
pub(crate) mod diffusion;
pub(crate) mod forward;
pub(crate) mod gradient;
pub(crate) mod kernel;
pub(crate) mod likelihood;
pub(crate) mod linalg;
pub(crate) mod math;
pub(crate) mod model;
pub(crate) mod provider;
pub(crate) mod report;
pub(crate) mod reverse;
pub(crate) mod root;
pub(crate) mod simulate;
pub(crate) mod transform;
pub(crate) mod tree;

pub use data::{PrecisionEncoding, TraitData};
pub use diffusion::{CompoundSymmetricMatrix, MatrixKind};
pub use gradient::{GradientMode, GradientProvider, HessianProvider, TreeGradient};
pub use kernel::{Attenuation, BranchVector, DiffusionKernel, FullAttenuation};
pub use likelihood::{EvaluationError, LikelihoodSettings, LogpError, TreeLikelihood};
pub use model::{ModelError, Target, TraitModel};
pub use provider::{Concatenated, Masked, Negative, Numerical, NumericalSettings, Sum, Transformed};
pub use report::GradientCheck;
pub use root::RootPrior;
pub use simulate::{random_tree, simulate, simulate_data, simulate_replicates};
pub use transform::Transform;
pub use tree::{BranchRates, NodeId, Tree};
