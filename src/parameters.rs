//! The parameter store of a chain.
//!
//! Every parameter lives in internal (scaled) units: the value handed to the
//! solver is `value * scale`. Varying parameters carry a proposal state
//! (`current`) that is only committed to `last_accepted` once the chain has
//! decided to move.

use std::collections::HashMap;

use log::warn;
use serde::Deserialize;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum ParameterError {
    #[error("parameter `{0}` is declared more than once")]
    DuplicateName(String),
    #[error("parameter `{name}` has invalid scale {scale}, expected a finite positive number")]
    InvalidScale { name: String, scale: f64 },
    #[error("varying parameter `{name}` has invalid prior width {sigma}, expected a finite positive number")]
    InvalidWidth { name: String, sigma: f64 },
    #[error("parameter `{name}` has lower bound {lower} above upper bound {upper}")]
    InvertedBounds { name: String, lower: f64, upper: f64 },
    #[error("expected {expected} varying values but got {found}")]
    LengthMismatch { expected: usize, found: usize },
    #[error("unknown parameter `{0}`")]
    Unknown(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParameterKind {
    /// Sampled by the chain.
    Varying,
    /// Computed by the solver, stored but never proposed.
    Derived,
    /// Passed to the solver unchanged.
    Fixed,
}

/// Prior range of a parameter. A missing side means unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Default, Deserialize)]
pub struct Bounds {
    pub lower: Option<f64>,
    pub upper: Option<f64>,
}

impl Bounds {
    pub fn new(lower: Option<f64>, upper: Option<f64>) -> Self {
        Self { lower, upper }
    }

    pub fn unbounded() -> Self {
        Self::default()
    }

    /// Whether `value` lies inside the closed range.
    ///
    /// NaN is never inside a range that has at least one finite side.
    pub fn contains(&self, value: f64) -> bool {
        let above = self.lower.map_or(true, |lower| value >= lower);
        let below = self.upper.map_or(true, |upper| value <= upper);
        above && below
    }
}

#[derive(Debug, Clone)]
pub struct Parameter {
    name: String,
    kind: ParameterKind,
    bounds: Bounds,
    initial: f64,
    sigma: f64,
    scale: f64,
    current: f64,
    last_accepted: Option<f64>,
}

impl Parameter {
    /// A sampled parameter starting at `initial` with prior width `sigma`.
    pub fn varying(name: impl Into<String>, initial: f64, sigma: f64) -> Self {
        Self {
            name: name.into(),
            kind: ParameterKind::Varying,
            bounds: Bounds::unbounded(),
            initial,
            sigma,
            scale: 1.,
            current: initial,
            last_accepted: None,
        }
    }

    pub fn derived(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ParameterKind::Derived,
            bounds: Bounds::unbounded(),
            initial: f64::NAN,
            sigma: 0.,
            scale: 1.,
            current: f64::NAN,
            last_accepted: None,
        }
    }

    pub fn fixed(name: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            kind: ParameterKind::Fixed,
            bounds: Bounds::unbounded(),
            initial: value,
            sigma: 0.,
            scale: 1.,
            current: value,
            last_accepted: Some(value),
        }
    }

    pub fn with_bounds(mut self, lower: Option<f64>, upper: Option<f64>) -> Self {
        self.bounds = Bounds::new(lower, upper);
        self
    }

    /// Set the factor between internal units and the units the solver expects.
    pub fn with_scale(mut self, scale: f64) -> Self {
        self.scale = scale;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ParameterKind {
        self.kind
    }

    pub fn bounds(&self) -> Bounds {
        self.bounds
    }

    pub fn initial(&self) -> f64 {
        self.initial
    }

    /// Prior width in internal units.
    pub fn sigma(&self) -> f64 {
        self.sigma
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }

    pub fn current(&self) -> f64 {
        self.current
    }

    pub fn last_accepted(&self) -> Option<f64> {
        self.last_accepted
    }

    fn validate(&self) -> Result<(), ParameterError> {
        if !(self.scale.is_finite() && self.scale > 0.) {
            return Err(ParameterError::InvalidScale {
                name: self.name.clone(),
                scale: self.scale,
            });
        }
        if self.kind == ParameterKind::Varying && !(self.sigma.is_finite() && self.sigma > 0.) {
            return Err(ParameterError::InvalidWidth {
                name: self.name.clone(),
                sigma: self.sigma,
            });
        }
        if let Bounds {
            lower: Some(lower),
            upper: Some(upper),
        } = self.bounds
        {
            if lower > upper {
                return Err(ParameterError::InvertedBounds {
                    name: self.name.clone(),
                    lower,
                    upper,
                });
            }
        }
        Ok(())
    }
}

/// All parameters of a run, in configuration order.
#[derive(Debug, Clone)]
pub struct ParameterStore {
    params: Vec<Parameter>,
    index: HashMap<String, usize>,
    varying: Vec<usize>,
    derived: Vec<usize>,
}

impl ParameterStore {
    pub fn new(params: Vec<Parameter>) -> Result<Self, ParameterError> {
        let mut index = HashMap::with_capacity(params.len());
        for (i, param) in params.iter().enumerate() {
            param.validate()?;
            if index.insert(param.name.clone(), i).is_some() {
                return Err(ParameterError::DuplicateName(param.name.clone()));
            }
            if param.kind == ParameterKind::Varying && !param.bounds.contains(param.initial) {
                warn!(
                    "initial value {} of `{}` lies outside its bounds",
                    param.initial, param.name
                );
            }
        }
        let of_kind = |kind| {
            params
                .iter()
                .enumerate()
                .filter(|(_, p)| p.kind == kind)
                .map(|(i, _)| i)
                .collect::<Vec<_>>()
        };
        let varying = of_kind(ParameterKind::Varying);
        let derived = of_kind(ParameterKind::Derived);
        Ok(Self {
            params,
            index,
            varying,
            derived,
        })
    }

    pub fn get(&self, name: &str) -> Option<&Parameter> {
        self.index.get(name).map(|&i| &self.params[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = &Parameter> {
        self.params.iter()
    }

    pub fn varying(&self) -> impl Iterator<Item = &Parameter> {
        self.varying.iter().map(|&i| &self.params[i])
    }

    pub fn derived(&self) -> impl Iterator<Item = &Parameter> {
        self.derived.iter().map(|&i| &self.params[i])
    }

    pub fn varying_names(&self) -> Vec<&str> {
        self.varying().map(|p| p.name()).collect()
    }

    pub fn num_varying(&self) -> usize {
        self.varying.len()
    }

    /// Whether every varying parameter has an accepted value.
    pub fn has_accepted(&self) -> bool {
        self.num_varying() > 0 && self.varying().all(|p| p.last_accepted.is_some())
    }

    /// The point new proposals start from: the last accepted point, or the
    /// initial values before anything was accepted.
    pub fn start_vector(&self) -> Vec<f64> {
        if self.has_accepted() {
            self.varying()
                .map(|p| p.last_accepted.unwrap_or(p.initial))
                .collect()
        } else {
            self.varying().map(|p| p.initial).collect()
        }
    }

    pub fn current_varying(&self) -> Vec<f64> {
        self.varying().map(|p| p.current).collect()
    }

    pub fn last_accepted_varying(&self) -> Vec<Option<f64>> {
        self.varying().map(|p| p.last_accepted).collect()
    }

    /// Write a validated proposal into the `current` slot of the varying parameters.
    pub(crate) fn set_current_varying(&mut self, values: &[f64]) {
        assert_eq!(values.len(), self.varying.len());
        for (&i, &value) in self.varying.iter().zip(values) {
            self.params[i].current = value;
        }
    }

    pub fn set_current(&mut self, name: &str, value: f64) -> Result<(), ParameterError> {
        let i = *self
            .index
            .get(name)
            .ok_or_else(|| ParameterError::Unknown(name.to_string()))?;
        self.params[i].current = value;
        Ok(())
    }

    /// Seed the varying parameters with a previously accepted point.
    pub fn set_last_accepted_varying(&mut self, values: &[f64]) -> Result<(), ParameterError> {
        if values.len() != self.varying.len() {
            return Err(ParameterError::LengthMismatch {
                expected: self.varying.len(),
                found: values.len(),
            });
        }
        for (&i, &value) in self.varying.iter().zip(values) {
            let param = &mut self.params[i];
            param.last_accepted = Some(value);
            param.current = value;
        }
        Ok(())
    }

    /// Commit `current` to `last_accepted` for varying and derived parameters.
    pub fn accept_current(&mut self) {
        for &i in self.varying.iter().chain(self.derived.iter()) {
            let param = &mut self.params[i];
            param.last_accepted = Some(param.current);
        }
    }

    /// Arguments for the solver in its own units, varying and fixed parameters
    /// in configuration order.
    pub fn solver_arguments(&self) -> Vec<(String, f64)> {
        self.params
            .iter()
            .filter(|p| p.kind != ParameterKind::Derived)
            .map(|p| (p.name.clone(), p.current * p.scale))
            .collect()
    }

    /// Last accepted values of all varying then all derived parameters.
    pub fn accepted_values(&self) -> Vec<f64> {
        self.varying
            .iter()
            .chain(self.derived.iter())
            .map(|&i| self.params[i].last_accepted.unwrap_or(f64::NAN))
            .collect()
    }
}
