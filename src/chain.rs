use std::fmt::{self, Display};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, info, warn};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use thiserror::Error;

use crate::covariance::{proposal_basis, CovarianceError, CovarianceMatrix};
use crate::likelihood::{EvalErrorKind, LikelihoodEvaluator, Solver};
use crate::parameters::{ParameterError, ParameterStore};
use crate::proposal::{Proposal, ProposalGenerator};
use crate::settings::ChainSettings;
use crate::text_storage::{read_restart_point, ChainRecord, ChainWriter, RestartError};

/// Parameter names and values as handed to the solver.
#[derive(Debug, Clone, PartialEq)]
pub struct SolverArguments(pub Vec<(String, f64)>);

impl Display for SolverArguments {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (name, value)) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{name} = {value}")?;
        }
        Ok(())
    }
}

#[derive(Error, Debug)]
pub enum ChainError {
    #[error("Could not build the proposal basis")]
    Covariance(#[from] CovarianceError),
    #[error("Could not restart from the previous chain")]
    Restart(#[from] RestartError),
    #[error("Invalid parameters")]
    Parameters(#[from] ParameterError),
    #[error(
        "Solver failed {failures} times while looking for a starting point, \
         change the starting values or the priors"
    )]
    InitializationFailed { failures: u64 },
    #[error("Unrecoverable error: {message} (parameters: {arguments})")]
    Fatal {
        message: String,
        arguments: SolverArguments,
    },
    #[error("Chain was interrupted")]
    Interrupted,
    #[error("Failed to write chain output")]
    Output(#[from] io::Error),
}

/// Why a chain stopped without an error.
#[derive(Debug, Clone, PartialEq)]
pub enum Termination {
    /// The requested number of steps was taken.
    Success,
    /// The solver failed as often as the failure budget allows.
    FailureLimit,
    /// A likelihood created its fiducial data, the run has to be repeated.
    FiducialCreated { message: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChainState {
    Initializing,
    Running,
    Terminated(Termination),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChainSummary {
    pub termination: Termination,
    /// Steps with an acceptance decision.
    pub steps: u64,
    pub accepted: u64,
    pub rejected: u64,
    /// Recoverable solver failures, initialization included.
    pub failures: u64,
    pub max_loglike: f64,
    /// Log-likelihood of the last accepted point.
    pub last_loglike: f64,
}

impl ChainSummary {
    /// Fraction of accepted decisions, 0 if nothing was decided.
    pub fn acceptance_rate(&self) -> f64 {
        let total = self.accepted + self.rejected;
        if total == 0 {
            return 0.;
        }
        self.accepted as f64 / total as f64
    }
}

/// Metropolis acceptance rule.
///
/// The boundary sentinel always rejects, an improvement always accepts and a
/// worse point is accepted with probability `exp(new - current)`.
pub fn metropolis_accept<R: Rng + ?Sized>(
    new_loglike: f64,
    current_loglike: f64,
    boundary_loglike: f64,
    rng: &mut R,
) -> bool {
    if new_loglike == boundary_loglike {
        return false;
    }
    let delta = new_loglike - current_loglike;
    if delta >= 0. {
        return true;
    }
    rng.random::<f64>() < delta.exp()
}

enum Evaluation {
    Value(f64),
    Failure(String),
    Fiducial(String),
}

enum Start {
    Point(f64),
    Fiducial(String),
}

#[derive(Debug, Default)]
struct Tally {
    steps: u64,
    accepted: u64,
    rejected: u64,
    failures: u64,
    multiplicity: u64,
    loglike: f64,
    max_loglike: f64,
}

impl Tally {
    fn summary(&self, termination: Termination) -> ChainSummary {
        ChainSummary {
            termination,
            steps: self.steps,
            accepted: self.accepted,
            rejected: self.rejected,
            failures: self.failures,
            max_loglike: self.max_loglike,
            last_loglike: self.loglike,
        }
    }
}

/// Random number generator of a chain: seeded from the settings (or the OS)
/// with one stream per chain id.
pub fn chain_rng(settings: &ChainSettings) -> ChaCha8Rng {
    let seed = settings.seed.unwrap_or_else(|| rand::rng().random());
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    rng.set_stream(settings.chain_id);
    rng
}

/// Runs one Metropolis-Hastings chain.
pub struct ChainDriver<S: Solver, W: ChainWriter, R: Rng = ChaCha8Rng> {
    settings: ChainSettings,
    store: ParameterStore,
    evaluator: LikelihoodEvaluator<S>,
    writer: W,
    rng: R,
    state: ChainState,
    interrupt: Option<Arc<AtomicBool>>,
}

impl<S: Solver, W: ChainWriter> ChainDriver<S, W, ChaCha8Rng> {
    pub fn new(
        settings: ChainSettings,
        store: ParameterStore,
        evaluator: LikelihoodEvaluator<S>,
        writer: W,
    ) -> Self {
        let rng = chain_rng(&settings);
        Self::with_rng(settings, store, evaluator, writer, rng)
    }
}

impl<S: Solver, W: ChainWriter, R: Rng> ChainDriver<S, W, R> {
    pub fn with_rng(
        settings: ChainSettings,
        store: ParameterStore,
        evaluator: LikelihoodEvaluator<S>,
        writer: W,
        rng: R,
    ) -> Self {
        Self {
            settings,
            store,
            evaluator,
            writer,
            rng,
            state: ChainState::Initializing,
            interrupt: None,
        }
    }

    /// Stop the chain with [`ChainError::Interrupted`] once `flag` is set.
    pub fn with_interrupt(mut self, flag: Arc<AtomicBool>) -> Self {
        self.interrupt = Some(flag);
        self
    }

    pub fn state(&self) -> &ChainState {
        &self.state
    }

    pub fn store(&self) -> &ParameterStore {
        &self.store
    }

    pub fn evaluator(&self) -> &LikelihoodEvaluator<S> {
        &self.evaluator
    }

    pub fn writer(&self) -> &W {
        &self.writer
    }

    pub fn into_writer(self) -> W {
        self.writer
    }

    /// Run the chain until the requested number of steps is taken or the
    /// failure budget is used up.
    pub fn run(&mut self) -> Result<ChainSummary, ChainError> {
        self.state = ChainState::Initializing;
        if self.store.num_varying() == 0 {
            return self.single_point();
        }

        let external = self
            .settings
            .covmat
            .as_ref()
            .map(CovarianceMatrix::from_path)
            .transpose()?;
        if let Some(path) = self.settings.covmat.as_ref() {
            info!("starting from covariance matrix {:?}", path);
        }
        let basis = proposal_basis(&self.store, external.as_ref())?;
        let generator =
            ProposalGenerator::new(basis, self.settings.jumping, self.settings.jumping_factor);
        info!(
            "{:?} jumping with factor {} over {} varying parameters",
            generator.strategy(),
            self.settings.jumping_factor,
            self.store.num_varying()
        );

        if let Some(path) = self.settings.restart.clone() {
            let point = read_restart_point(&path, self.store.num_varying())?;
            info!("restarting from the last point of {:?}", path);
            self.store.set_last_accepted_varying(&point)?;
        }

        let mut tally = Tally::default();
        let loglike = match self.initialize(&generator, &mut tally)? {
            Start::Point(loglike) => loglike,
            Start::Fiducial(message) => {
                return self.terminate(&tally, Termination::FiducialCreated { message });
            }
        };
        self.store.accept_current();
        tally.loglike = loglike;
        tally.max_loglike = loglike;
        tally.multiplicity = 1;
        info!("starting point has log-likelihood {loglike}");

        self.state = ChainState::Running;
        let num_steps = self.settings.num_steps;
        let budget = self.settings.failure_budget;
        while tally.steps < num_steps && tally.failures < budget {
            self.check_interrupt()?;

            if let Proposal::OutOfBounds { parameter } =
                generator.propose(&mut self.store, tally.steps, &mut self.rng)
            {
                debug!("proposal left the bounds of varying parameter {parameter}");
                tally.rejected += 1;
                tally.multiplicity += 1;
                continue;
            }

            let new_loglike = match self.evaluate()? {
                Evaluation::Value(value) => value,
                Evaluation::Failure(message) => {
                    tally.failures += 1;
                    warn!(
                        "solver failed for the chosen parameters ({message}), picking new values: {}",
                        SolverArguments(self.store.solver_arguments())
                    );
                    continue;
                }
                Evaluation::Fiducial(message) => {
                    return self.terminate(&tally, Termination::FiducialCreated { message });
                }
            };

            let accept = metropolis_accept(
                new_loglike,
                tally.loglike,
                self.settings.boundary_loglike,
                &mut self.rng,
            );
            if accept {
                self.emit(tally.multiplicity, tally.loglike)?;
                self.store.accept_current();
                tally.loglike = new_loglike;
                tally.max_loglike = tally.max_loglike.max(new_loglike);
                tally.accepted += 1;
                tally.multiplicity = 1;
                if tally.accepted % self.settings.write_step.max(1) == 0 {
                    self.writer.flush()?;
                }
            } else {
                tally.rejected += 1;
                tally.multiplicity += 1;
            }
            tally.steps += 1;
        }

        if tally.multiplicity > 1 {
            self.emit(tally.multiplicity, tally.loglike)?;
        }

        let termination = if tally.failures >= budget {
            warn!(
                "the computation failed {} times, check the values of your parameters",
                tally.failures
            );
            Termination::FailureLimit
        } else {
            Termination::Success
        };
        let summary = self.terminate(&tally, termination)?;
        info!(
            "{} steps done, acceptance rate: {}",
            summary.steps,
            summary.acceptance_rate()
        );

        if summary.termination == Termination::Success {
            if let Some(path) = self.settings.restart.as_ref() {
                info!("deleting starting point of the chain {:?}", path);
                self.writer.discard_restart(path)?;
            }
        }
        Ok(summary)
    }

    /// Find a starting point with a finite likelihood.
    fn initialize(
        &mut self,
        generator: &ProposalGenerator,
        tally: &mut Tally,
    ) -> Result<Start, ChainError> {
        let attempts = self.settings.proposal_attempts;
        loop {
            self.check_interrupt()?;

            let mut placed = false;
            for _ in 0..attempts {
                let proposal = generator.propose(&mut self.store, tally.failures, &mut self.rng);
                if proposal == Proposal::Valid {
                    placed = true;
                    break;
                }
            }

            if !placed {
                tally.failures += 1;
                warn!("no starting point inside the parameter bounds after {attempts} proposals");
            } else {
                match self.evaluate()? {
                    Evaluation::Value(loglike) => return Ok(Start::Point(loglike)),
                    Evaluation::Fiducial(message) => return Ok(Start::Fiducial(message)),
                    Evaluation::Failure(message) => {
                        tally.failures += 1;
                        warn!(
                            "solver failed at the starting point ({message}): {}",
                            SolverArguments(self.store.solver_arguments())
                        );
                    }
                }
            }

            if tally.failures >= self.settings.failure_budget {
                return Err(ChainError::InitializationFailed {
                    failures: tally.failures,
                });
            }
        }
    }

    /// Without varying parameters there is nothing to sample: compute the
    /// likelihood once and record the point.
    fn single_point(&mut self) -> Result<ChainSummary, ChainError> {
        info!("no varying parameters, computing the model for a single point");
        let tally = Tally::default();
        let loglike = match self.evaluate()? {
            Evaluation::Value(loglike) => loglike,
            Evaluation::Failure(message) => return Err(self.fatal(message)),
            Evaluation::Fiducial(message) => {
                return self.terminate(&tally, Termination::FiducialCreated { message });
            }
        };
        self.store.accept_current();
        self.emit(1, loglike)?;
        let tally = Tally {
            loglike,
            max_loglike: loglike,
            ..tally
        };
        self.terminate(&tally, Termination::Success)
    }

    fn evaluate(&mut self) -> Result<Evaluation, ChainError> {
        match self.evaluator.evaluate(&mut self.store) {
            Ok(loglike) => Ok(Evaluation::Value(loglike)),
            Err(err) => match err.kind() {
                EvalErrorKind::Recoverable => Ok(Evaluation::Failure(err.message().to_string())),
                EvalErrorKind::Fiducial => Ok(Evaluation::Fiducial(err.message().to_string())),
                EvalErrorKind::Fatal => Err(self.fatal(err.message().to_string())),
            },
        }
    }

    /// Flush what was already written and build the error that stops the chain.
    fn fatal(&mut self, message: String) -> ChainError {
        if let Err(err) = self.writer.flush() {
            warn!("could not flush the chain output: {err}");
        }
        ChainError::Fatal {
            message,
            arguments: SolverArguments(self.store.solver_arguments()),
        }
    }

    /// Write the last accepted point with its multiplicity.
    fn emit(&mut self, multiplicity: u64, loglike: f64) -> Result<(), ChainError> {
        let record = ChainRecord {
            multiplicity,
            neg_loglike: -loglike,
            values: self.store.accepted_values(),
        };
        self.writer.write_record(&record)?;
        Ok(())
    }

    fn terminate(
        &mut self,
        tally: &Tally,
        termination: Termination,
    ) -> Result<ChainSummary, ChainError> {
        if let Termination::FiducialCreated { message } = &termination {
            warn!("{message}");
        }
        self.writer.flush()?;
        self.state = ChainState::Terminated(termination.clone());
        Ok(tally.summary(termination))
    }

    fn check_interrupt(&mut self) -> Result<(), ChainError> {
        let interrupted = self
            .interrupt
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Relaxed));
        if interrupted {
            self.writer.flush()?;
            return Err(ChainError::Interrupted);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn improvement_is_always_accepted() {
        let mut rng = StdRng::seed_from_u64(42);
        for i in 0..1000 {
            let current = -(i as f64);
            assert!(metropolis_accept(current, current, -1e30, &mut rng));
            assert!(metropolis_accept(current + 0.5, current, -1e30, &mut rng));
        }
    }

    #[test]
    fn boundary_sentinel_is_always_rejected() {
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..1000 {
            assert!(!metropolis_accept(-1e30, -1e31, -1e30, &mut rng));
            assert!(!metropolis_accept(-1e30, -1e30, -1e30, &mut rng));
        }
    }

    #[test]
    fn worse_points_are_accepted_with_probability_exp_delta() {
        let mut rng = StdRng::seed_from_u64(1);
        let trials = 20000;
        let accepted = (0..trials)
            .filter(|_| metropolis_accept(-1. - 2f64.ln(), -1., -1e30, &mut rng))
            .count();
        let rate = accepted as f64 / trials as f64;
        assert!((rate - 0.5).abs() < 0.02, "rate {rate}");

        assert!(!(0..1000).any(|_| metropolis_accept(-1e10, 0., -1e30, &mut rng)));
    }

    #[test]
    fn summary_acceptance_rate() {
        let summary = ChainSummary {
            termination: Termination::Success,
            steps: 10,
            accepted: 3,
            rejected: 9,
            failures: 0,
            max_loglike: 0.,
            last_loglike: 0.,
        };
        assert_eq!(summary.acceptance_rate(), 0.25);
        let empty = ChainSummary {
            accepted: 0,
            rejected: 0,
            ..summary
        };
        assert_eq!(empty.acceptance_rate(), 0.);
    }

    #[test]
    fn display_solver_arguments() {
        let args = SolverArguments(vec![("a".into(), 1.5), ("b".into(), -2.)]);
        assert_eq!(args.to_string(), "a = 1.5, b = -2");
    }

    #[test]
    fn rng_streams_differ_per_chain() {
        let settings = ChainSettings {
            seed: Some(5),
            ..Default::default()
        };
        let mut first = chain_rng(&settings);
        let mut again = chain_rng(&settings);
        let mut other = chain_rng(&ChainSettings {
            chain_id: 1,
            ..settings.clone()
        });
        let a: u64 = first.random();
        assert_eq!(a, again.random::<u64>());
        assert_ne!(a, other.random::<u64>());
    }
}
