//! Evaluation of the total log-likelihood of the current point.
//!
//! The cosmological solver and the likelihood modules are supplied by the
//! user through the [`Solver`] and [`Likelihood`] traits.

use std::collections::HashMap;

use faer::Mat;
use itertools::Itertools;
use log::debug;
use thiserror::Error;

use crate::covariance::{CovarianceError, EigenBasis};
use crate::parameters::ParameterStore;

/// Quantities computed by the solver, by name.
pub type SolverOutput = HashMap<String, f64>;

/// Stages of the solver whose state is released after every computation.
pub const SOLVER_STAGES: &[&str] = &[
    "lensing",
    "nonlinear",
    "spectra",
    "primordial",
    "transfer",
    "perturb",
    "thermodynamics",
    "background",
    "bessel",
];

/// A likelihood returning exactly this value created its fiducial data
/// instead of computing a likelihood.
pub const FIDUCIAL_CREATED: f64 = 1.;

/// Errors returned by a [`Solver`].
pub trait SolverFailure: std::error::Error + Send + Sync + 'static {
    /// Recoverable failures mean the model could not be computed for these
    /// parameters and a new point should be tried. Anything else stops the chain.
    fn is_recoverable(&self) -> bool;
}

/// The external Boltzmann solver. It is not reentrant: [`Solver::reset`] is
/// called after every call to [`Solver::compute`].
pub trait Solver {
    type Err: SolverFailure;

    /// Compute the model for `arguments` (names and values in solver units).
    fn compute(&mut self, arguments: &[(String, f64)]) -> Result<SolverOutput, Self::Err>;

    /// Release the internal state of `stages`.
    fn reset(&mut self, stages: &[&str]);
}

/// A single likelihood module.
pub trait Likelihood {
    fn name(&self) -> &str;

    /// Log-likelihood of the model in `output` given the data of this module.
    ///
    /// Return [`FIDUCIAL_CREATED`] when the call only wrote the fiducial data
    /// this module needs.
    fn log_likelihood(
        &mut self,
        output: &SolverOutput,
        store: &ParameterStore,
    ) -> Result<f64, EvalError>;

    /// Derived parameters computed by the last call to
    /// [`Likelihood::log_likelihood`], by name and in solver units. They take
    /// precedence over the solver output.
    fn derived(&self) -> Vec<(String, f64)> {
        Vec::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalErrorKind {
    /// The model could not be computed here, try another point.
    Recoverable,
    /// Configuration error or cancellation, stop the chain.
    Fatal,
    /// Fiducial data was created, the chain has to be started again.
    Fiducial,
}

#[derive(Error, Debug, Clone, PartialEq)]
#[error("{message}")]
pub struct EvalError {
    kind: EvalErrorKind,
    message: String,
}

impl EvalError {
    pub fn new(kind: EvalErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn recoverable(message: impl Into<String>) -> Self {
        Self::new(EvalErrorKind::Recoverable, message)
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(EvalErrorKind::Fatal, message)
    }

    pub fn fiducial(message: impl Into<String>) -> Self {
        Self::new(EvalErrorKind::Fiducial, message)
    }

    pub fn kind(&self) -> EvalErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Runs the solver on the current point and sums the likelihoods.
pub struct LikelihoodEvaluator<S: Solver> {
    solver: S,
    likelihoods: Vec<Box<dyn Likelihood>>,
    evaluations: u64,
}

impl<S: Solver> LikelihoodEvaluator<S> {
    pub fn new(solver: S, likelihoods: Vec<Box<dyn Likelihood>>) -> Self {
        Self {
            solver,
            likelihoods,
            evaluations: 0,
        }
    }

    pub fn solver(&self) -> &S {
        &self.solver
    }

    /// Number of calls to [`LikelihoodEvaluator::evaluate`] so far.
    pub fn evaluations(&self) -> u64 {
        self.evaluations
    }

    pub fn num_likelihoods(&self) -> usize {
        self.likelihoods.len()
    }

    /// Total log-likelihood of the `current` point of `store`.
    ///
    /// Derived parameters are written to their `current` slot. The solver is
    /// reset before returning, whatever the outcome.
    pub fn evaluate(&mut self, store: &mut ParameterStore) -> Result<f64, EvalError> {
        self.evaluations += 1;
        let arguments = store.solver_arguments();
        let output = match self.solver.compute(&arguments) {
            Ok(output) => output,
            Err(err) => {
                self.solver.reset(SOLVER_STAGES);
                return Err(if err.is_recoverable() {
                    EvalError::recoverable(err.to_string())
                } else {
                    EvalError::fatal(err.to_string())
                });
            }
        };
        let result = self.score(&output, store);
        self.solver.reset(SOLVER_STAGES);
        result
    }

    fn score(&mut self, output: &SolverOutput, store: &mut ParameterStore) -> Result<f64, EvalError> {
        let mut loglike = 0f64;
        let mut fiducial = Vec::new();
        let mut computed: HashMap<String, f64> = HashMap::new();
        for likelihood in self.likelihoods.iter_mut() {
            let value = likelihood.log_likelihood(output, store)?;
            debug!("{}: log-likelihood {}", likelihood.name(), value);
            if value == FIDUCIAL_CREATED {
                fiducial.push(likelihood.name().to_string());
            }
            computed.extend(likelihood.derived());
            loglike += value;
        }

        let derived: Vec<(String, f64)> = store
            .derived()
            .map(|p| (p.name().to_string(), p.scale()))
            .collect();
        for (name, scale) in derived {
            let value = computed.get(&name).or_else(|| output.get(&name)).ok_or_else(|| {
                EvalError::fatal(format!(
                    "neither the solver nor a likelihood computed derived parameter `{name}`"
                ))
            })?;
            store
                .set_current(&name, value / scale)
                .map_err(|err| EvalError::fatal(err.to_string()))?;
        }

        if !fiducial.is_empty() {
            let names = fiducial.iter().join(", ");
            return Err(if fiducial.len() == self.num_likelihoods() {
                EvalError::fiducial(format!(
                    "fiducial files were created for {names}, please start a new chain"
                ))
            } else {
                EvalError::fiducial(format!(
                    "some previously missing fiducial files were created ({names}); check that \
                     the parameters in their headers match the tested models, then start a new chain"
                ))
            });
        }
        Ok(loglike)
    }
}

/// Gaussian likelihood of a vector of observables.
///
/// `log L = -0.5 * dᵀ C⁻¹ d` with `d = theory - data`. Observables are read
/// from the solver output; a name the solver does not provide is looked up
/// among the parameters, in solver units.
pub struct GaussianLikelihood {
    name: String,
    observables: Vec<String>,
    data: Vec<f64>,
    inv_cov: Mat<f64>,
}

impl GaussianLikelihood {
    pub fn new(
        name: impl Into<String>,
        observables: Vec<String>,
        data: Vec<f64>,
        cov: &Mat<f64>,
    ) -> Result<Self, CovarianceError> {
        if data.len() != observables.len() || cov.nrows() != observables.len() {
            return Err(CovarianceError::DimensionMismatch {
                observables: observables.len(),
                data: data.len(),
                rows: cov.nrows(),
            });
        }
        let basis = EigenBasis::from_covariance(cov)?;
        let (vecs, vals) = (basis.vectors(), basis.values());
        let dim = observables.len();
        let inv_cov = Mat::from_fn(dim, dim, |i, j| {
            (0..dim).map(|k| vecs[(i, k)] * vals[k] * vecs[(j, k)]).sum()
        });
        Ok(Self {
            name: name.into(),
            observables,
            data,
            inv_cov,
        })
    }

    fn theory(&self, output: &SolverOutput, store: &ParameterStore) -> Result<Vec<f64>, EvalError> {
        self.observables
            .iter()
            .map(|name| {
                output
                    .get(name)
                    .copied()
                    .or_else(|| store.get(name).map(|p| p.current() * p.scale()))
                    .ok_or_else(|| {
                        EvalError::fatal(format!("{}: no value for observable `{name}`", self.name))
                    })
            })
            .collect()
    }
}

impl Likelihood for GaussianLikelihood {
    fn name(&self) -> &str {
        &self.name
    }

    fn log_likelihood(
        &mut self,
        output: &SolverOutput,
        store: &ParameterStore,
    ) -> Result<f64, EvalError> {
        let diff: Vec<f64> = self
            .theory(output, store)?
            .iter()
            .zip(&self.data)
            .map(|(theory, data)| theory - data)
            .collect();
        let dim = diff.len();
        let chi2: f64 = (0..dim)
            .flat_map(|i| (0..dim).map(move |j| (i, j)))
            .map(|(i, j)| diff[i] * self.inv_cov[(i, j)] * diff[j])
            .sum();
        Ok(-0.5 * chi2)
    }
}
