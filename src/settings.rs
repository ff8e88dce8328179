use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::parameters::{Parameter, ParameterError, ParameterKind, ParameterStore};
use crate::proposal::JumpStrategy;

/// Settings of a Metropolis-Hastings chain.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ChainSettings {
    /// Number of steps for which an acceptance decision is made.
    pub num_steps: u64,
    /// How proposals move through the eigen-basis of the covariance.
    pub jumping: JumpStrategy,
    /// Global scale of the proposal steps.
    pub jumping_factor: f64,
    /// Number of recoverable solver failures after which the chain stops.
    pub failure_budget: u64,
    /// Proposals tried per initialization attempt to land inside the bounds.
    pub proposal_attempts: u32,
    /// Flush the output every `write_step` accepted points.
    pub write_step: u64,
    /// Likelihood value that signals a point outside the prior of a likelihood.
    pub boundary_loglike: f64,
    /// Seed of the random number generator. Drawn from the OS if missing.
    pub seed: Option<u64>,
    /// Stream of the random number generator, so that chains sharing a seed
    /// still draw independent numbers.
    pub chain_id: u64,
    /// Covariance matrix to start from.
    pub covmat: Option<PathBuf>,
    /// Existing chain to continue from.
    pub restart: Option<PathBuf>,
}

impl Default for ChainSettings {
    fn default() -> Self {
        Self {
            num_steps: 10,
            jumping: JumpStrategy::Global,
            jumping_factor: 2.4,
            failure_budget: 1000,
            proposal_attempts: 100,
            write_step: 10,
            boundary_loglike: -1e30,
            seed: None,
            chain_id: 0,
            covmat: None,
            restart: None,
        }
    }
}

/// One `[[parameter]]` table of a run configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ParameterConfig {
    pub name: String,
    pub kind: ParameterKind,
    /// Starting value for varying parameters, the value of fixed ones.
    #[serde(default)]
    pub initial: f64,
    pub lower: Option<f64>,
    pub upper: Option<f64>,
    /// Prior width, used when no covariance matrix covers the parameter.
    #[serde(default)]
    pub sigma: f64,
    #[serde(default = "unit_scale")]
    pub scale: f64,
}

fn unit_scale() -> f64 {
    1.
}

impl ParameterConfig {
    pub fn to_parameter(&self) -> Parameter {
        let param = match self.kind {
            ParameterKind::Varying => Parameter::varying(&self.name, self.initial, self.sigma),
            ParameterKind::Derived => Parameter::derived(&self.name),
            ParameterKind::Fixed => Parameter::fixed(&self.name, self.initial),
        };
        param
            .with_bounds(self.lower, self.upper)
            .with_scale(self.scale)
    }
}

/// A complete run: chain settings and parameter declarations.
///
/// ```toml
/// [chain]
/// num_steps = 5000
/// jumping = "sequential"
///
/// [[parameter]]
/// name = "omega_b"
/// kind = "varying"
/// initial = 2.249
/// sigma = 0.016
/// scale = 0.01
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunConfig {
    pub chain: ChainSettings,
    pub parameter: Vec<ParameterConfig>,
}

impl RunConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: RunConfig = toml::from_str(text).context("Invalid run configuration")?;
        if config.chain.write_step == 0 {
            anyhow::bail!("write_step must be at least 1");
        }
        if config.chain.failure_budget == 0 {
            anyhow::bail!("failure_budget must be at least 1");
        }
        Ok(config)
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read run configuration {:?}", path))?;
        Self::from_toml_str(&text)
            .with_context(|| format!("Failed to load run configuration {:?}", path))
    }

    pub fn parameter_store(&self) -> Result<ParameterStore, ParameterError> {
        ParameterStore::new(self.parameter.iter().map(|p| p.to_parameter()).collect())
    }
}
