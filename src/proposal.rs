use std::str::FromStr;

use rand::Rng;
use rand_distr::StandardNormal;
use serde::Deserialize;
use thiserror::Error;

use crate::covariance::EigenBasis;
use crate::parameters::ParameterStore;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ProposalError {
    #[error("unknown jumping method `{0}` (accepted: global, sequential)")]
    UnknownJumpStrategy(String),
}

/// How a proposal moves through the eigenspace of the covariance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JumpStrategy {
    /// Move along every eigen-direction at once.
    #[default]
    Global,
    /// Move along one eigen-direction per proposal, cycling through them.
    Sequential,
}

impl FromStr for JumpStrategy {
    type Err = ProposalError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        match name.trim() {
            "global" => Ok(JumpStrategy::Global),
            "sequential" => Ok(JumpStrategy::Sequential),
            other => Err(ProposalError::UnknownJumpStrategy(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Proposal {
    /// The candidate was written to the `current` slot of the store.
    Valid,
    /// The candidate left the bounds of the varying parameter with this index.
    /// The store was not touched.
    OutOfBounds { parameter: usize },
}

#[derive(Debug, Clone)]
pub struct ProposalGenerator {
    basis: EigenBasis,
    strategy: JumpStrategy,
    jump_factor: f64,
}

impl ProposalGenerator {
    pub fn new(basis: EigenBasis, strategy: JumpStrategy, jump_factor: f64) -> Self {
        Self {
            basis,
            strategy,
            jump_factor,
        }
    }

    pub fn basis(&self) -> &EigenBasis {
        &self.basis
    }

    pub fn strategy(&self) -> JumpStrategy {
        self.strategy
    }

    /// Draw a step in eigenspace coordinates.
    pub fn eigenspace_step<R: Rng + ?Sized>(&self, index: u64, rng: &mut R) -> Vec<f64> {
        let dim = self.basis.dim();
        let mut step = vec![0f64; dim];
        if dim == 0 {
            return step;
        }
        let values = self.basis.values();
        match self.strategy {
            JumpStrategy::Global => {
                for (val, &eig) in step.iter_mut().zip(values) {
                    let gauss: f64 = rng.sample(StandardNormal);
                    *val = (eig * dim as f64).recip().sqrt() * gauss * self.jump_factor;
                }
            }
            JumpStrategy::Sequential => {
                let i = (index % dim as u64) as usize;
                let gauss: f64 = rng.sample(StandardNormal);
                step[i] = values[i].recip().sqrt() * gauss * self.jump_factor;
            }
        }
        step
    }

    /// Candidate point in parameter space, starting from the last accepted
    /// point or the initial values.
    pub fn candidate<R: Rng + ?Sized>(
        &self,
        store: &ParameterStore,
        index: u64,
        rng: &mut R,
    ) -> Vec<f64> {
        let step = self.eigenspace_step(index, rng);
        let mut candidate = store.start_vector();
        self.basis.rotate_add(&step, &mut candidate);
        candidate
    }

    /// Draw a candidate and, if it lies within all bounds, store it as `current`.
    pub fn propose<R: Rng + ?Sized>(
        &self,
        store: &mut ParameterStore,
        index: u64,
        rng: &mut R,
    ) -> Proposal {
        let candidate = self.candidate(store, index, rng);
        let violation = store
            .varying()
            .zip(&candidate)
            .position(|(param, &value)| !param.bounds().contains(value));
        if let Some(parameter) = violation {
            return Proposal::OutOfBounds { parameter };
        }
        store.set_current_varying(&candidate);
        Proposal::Valid
    }
}
