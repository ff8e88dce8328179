//! Metropolis-Hastings chains for cosmological parameter inference.
//!
//! A chain draws proposals in the eigen-basis of a parameter covariance,
//! evaluates them through a [`Solver`] and a set of [`Likelihood`]s and
//! writes the accepted points with their multiplicities to a
//! [`ChainWriter`].

pub(crate) mod chain;
pub(crate) mod covariance;
pub(crate) mod likelihood;
pub(crate) mod parameters;
pub(crate) mod proposal;
pub(crate) mod settings;
pub(crate) mod text_storage;

pub use chain::{
    chain_rng, metropolis_accept, ChainDriver, ChainError, ChainState, ChainSummary,
    SolverArguments, Termination,
};
pub use covariance::{
    proposal_basis, working_covariance, CovarianceError, CovarianceMatrix, EigenBasis,
};
pub use likelihood::{
    EvalError, EvalErrorKind, GaussianLikelihood, Likelihood, LikelihoodEvaluator, Solver,
    SolverFailure, SolverOutput, FIDUCIAL_CREATED, SOLVER_STAGES,
};
pub use parameters::{Bounds, Parameter, ParameterError, ParameterKind, ParameterStore};
pub use proposal::{JumpStrategy, Proposal, ProposalError, ProposalGenerator};
pub use settings::{ChainSettings, ParameterConfig, RunConfig};
pub use text_storage::{
    parse_restart_line, read_restart_point, ChainRecord, ChainWriter, MemoryWriter, RestartError,
    TextChainWriter,
};
