//! Starting covariance of the proposal distribution.
//!
//! The working covariance is expressed in internal units and in the order of
//! the varying parameters of the store. It is either built from the prior
//! widths alone, or reconciled from an external matrix that may list a
//! different, partially overlapping set of names in any order.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use faer::Mat;
use itertools::Itertools;
use log::{debug, log_enabled, warn, Level};
use thiserror::Error;

use crate::parameters::ParameterStore;

#[derive(Error, Debug)]
pub enum CovarianceError {
    #[error("failed to read covariance matrix {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("covariance matrix has no `#` header listing the parameter names")]
    MissingHeader,
    #[error("covariance matrix lists `{0}` more than once")]
    DuplicateName(String),
    #[error("line {line}: could not parse `{token}` as a number")]
    Parse { line: usize, token: String },
    #[error("line {line}: expected {expected} columns but found {found}")]
    RowLength {
        line: usize,
        expected: usize,
        found: usize,
    },
    #[error("covariance matrix names {expected} parameters but has {found} rows")]
    RowCount { expected: usize, found: usize },
    #[error(
        "{observables} observables need as many data points and covariance rows, \
         found {data} data points and {rows} rows"
    )]
    DimensionMismatch {
        observables: usize,
        data: usize,
        rows: usize,
    },
    #[error("cannot build a proposal basis: {0}")]
    LinearAlgebra(String),
}

/// Eigenvalues below this fraction of the largest one mark a singular matrix.
const SINGULAR_RTOL: f64 = 1e-13;

/// A covariance matrix together with the names of its rows and columns.
#[derive(Debug, Clone)]
pub struct CovarianceMatrix {
    names: Vec<String>,
    matrix: Mat<f64>,
}

impl CovarianceMatrix {
    pub fn new(names: Vec<String>, matrix: Mat<f64>) -> Result<Self, CovarianceError> {
        if matrix.nrows() != names.len() {
            return Err(CovarianceError::RowCount {
                expected: names.len(),
                found: matrix.nrows(),
            });
        }
        if matrix.ncols() != names.len() {
            return Err(CovarianceError::RowLength {
                line: 0,
                expected: names.len(),
                found: matrix.ncols(),
            });
        }
        if let Some(name) = names.iter().duplicates().next() {
            return Err(CovarianceError::DuplicateName(name.clone()));
        }
        Ok(Self { names, matrix })
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, CovarianceError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| CovarianceError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        text.parse()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn matrix(&self) -> &Mat<f64> {
        &self.matrix
    }

    pub fn dim(&self) -> usize {
        self.names.len()
    }
}

impl FromStr for CovarianceMatrix {
    type Err = CovarianceError;

    /// Parse the text format: a `#` header line with comma separated names,
    /// followed by one whitespace separated row per name.
    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let mut names: Option<Vec<String>> = None;
        let mut rows: Vec<Vec<f64>> = Vec::new();

        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if line.contains('#') {
                if names.is_none() {
                    let header: String = line
                        .trim_start_matches('#')
                        .chars()
                        .filter(|c| !c.is_whitespace())
                        .collect();
                    names = Some(
                        header
                            .split(',')
                            .filter(|name| !name.is_empty())
                            .map(str::to_string)
                            .collect(),
                    );
                }
                continue;
            }
            let Some(names) = names.as_ref() else {
                return Err(CovarianceError::MissingHeader);
            };
            let row = line
                .split_whitespace()
                .map(|token| {
                    token.parse::<f64>().map_err(|_| CovarianceError::Parse {
                        line: lineno + 1,
                        token: token.to_string(),
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            if row.len() != names.len() {
                return Err(CovarianceError::RowLength {
                    line: lineno + 1,
                    expected: names.len(),
                    found: row.len(),
                });
            }
            rows.push(row);
        }

        let names = names.ok_or(CovarianceError::MissingHeader)?;
        if rows.len() != names.len() {
            return Err(CovarianceError::RowCount {
                expected: names.len(),
                found: rows.len(),
            });
        }
        let matrix = Mat::from_fn(names.len(), names.len(), |i, j| rows[i][j]);
        Self::new(names, matrix)
    }
}

/// Eigen-decomposition of the inverse working covariance.
///
/// `values[i]` is the eigenvalue belonging to column `i` of `vectors`.
#[derive(Debug, Clone)]
pub struct EigenBasis {
    values: Vec<f64>,
    vectors: Mat<f64>,
}

impl EigenBasis {
    /// Decompose the inverse of a symmetric positive-definite covariance.
    ///
    /// The inverse shares its eigenvectors with `cov` and has the reciprocal
    /// eigenvalues, so the inverse is never formed explicitly.
    pub fn from_covariance(cov: &Mat<f64>) -> Result<Self, CovarianceError> {
        let dim = cov.nrows();
        if cov.ncols() != dim {
            return Err(CovarianceError::LinearAlgebra(format!(
                "covariance is {}x{}, not square",
                dim,
                cov.ncols()
            )));
        }
        if dim == 0 {
            return Ok(Self {
                values: Vec::new(),
                vectors: Mat::zeros(0, 0),
            });
        }
        for i in 0..dim {
            for j in 0..dim {
                let (a, b) = (cov[(i, j)], cov[(j, i)]);
                if !a.is_finite() {
                    return Err(CovarianceError::LinearAlgebra(format!(
                        "covariance entry ({i}, {j}) is {a}"
                    )));
                }
                if j < i && (a - b).abs() > 1e-8 * a.abs().max(b.abs()) {
                    warn!("covariance is not symmetric at ({i}, {j}): {a} vs {b}, using the lower triangle");
                }
            }
        }

        let eig = cov
            .self_adjoint_eigen(faer::Side::Lower)
            .map_err(|err| CovarianceError::LinearAlgebra(format!("{err:?}")))?;
        let cov_values: Vec<f64> = eig.S().column_vector().iter().copied().collect();

        let largest = cov_values.iter().copied().fold(0f64, f64::max);
        let cutoff = largest * SINGULAR_RTOL;
        if let Some(&bad) = cov_values
            .iter()
            .find(|&&val| !(val.is_finite() && val > cutoff))
        {
            return Err(CovarianceError::LinearAlgebra(format!(
                "covariance is singular or not positive definite (eigenvalue {bad:e})"
            )));
        }

        Ok(Self {
            values: cov_values.iter().map(|val| val.recip()).collect(),
            vectors: eig.U().to_owned(),
        })
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Eigenvalues of the inverse covariance.
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Eigenvectors as columns.
    pub fn vectors(&self) -> &Mat<f64> {
        &self.vectors
    }

    /// Add the eigenspace vector `step`, rotated into parameter space, to `out`.
    ///
    /// Both slices have the dimension of the basis.
    pub(crate) fn rotate_add(&self, step: &[f64], out: &mut [f64]) {
        debug_assert_eq!(step.len(), self.dim());
        debug_assert_eq!(out.len(), self.dim());
        for (col, &coef) in step.iter().enumerate() {
            if coef == 0. {
                continue;
            }
            for (row, val) in out.iter_mut().enumerate() {
                *val += self.vectors[(row, col)] * coef;
            }
        }
    }
}

/// Divide every entry by the scales of its row and column parameter.
///
/// Names that are not varying parameters of the store keep scale 1.
fn rescale(external: &CovarianceMatrix, store: &ParameterStore) -> Mat<f64> {
    let scales: Vec<f64> = external
        .names
        .iter()
        .map(|name| {
            store
                .varying()
                .find(|p| p.name() == name)
                .map_or(1., |p| p.scale())
        })
        .collect();
    Mat::from_fn(external.dim(), external.dim(), |i, j| {
        external.matrix[(i, j)] / (scales[i] * scales[j])
    })
}

/// `P[i][e] = 1` iff active parameter `i` is external name `e`.
///
/// Rows of active parameters missing from the external names stay zero, and
/// columns of extra external names are never selected.
fn selection_matrix(active: &[&str], external: &[String]) -> Mat<f64> {
    let position: HashMap<&str, usize> = external
        .iter()
        .enumerate()
        .map(|(e, name)| (name.as_str(), e))
        .collect();
    Mat::from_fn(active.len(), external.len(), |i, e| {
        if position.get(active[i]) == Some(&e) {
            1.
        } else {
            0.
        }
    })
}

fn format_matrix(names: &[&str], matrix: &Mat<f64>) -> String {
    let header = names.iter().join(", ");
    let rows = (0..matrix.nrows())
        .map(|i| {
            (0..matrix.ncols())
                .map(|j| format!("{:>10.2e}", matrix[(i, j)]))
                .join(" ")
        })
        .join("\n");
    format!("{header}\n{rows}")
}

/// Build the working covariance of the varying parameters of `store`.
///
/// Entries of the external matrix take precedence. A varying parameter it
/// does not cover gets its prior variance on the diagonal and no
/// correlation with anything else.
pub fn working_covariance(
    store: &ParameterStore,
    external: Option<&CovarianceMatrix>,
) -> Mat<f64> {
    let active = store.varying_names();
    let sigmas: Vec<f64> = store.varying().map(|p| p.sigma()).collect();

    let Some(external) = external else {
        return Mat::from_fn(active.len(), active.len(), |i, j| {
            if i == j {
                sigmas[i] * sigmas[i]
            } else {
                0.
            }
        });
    };

    let external_names: Vec<&str> = external.names.iter().map(String::as_str).collect();
    if log_enabled!(Level::Debug) {
        debug!(
            "input covariance matrix:\n{}",
            format_matrix(&external_names, &external.matrix)
        );
    }

    let extra: Vec<&str> = external_names
        .iter()
        .copied()
        .filter(|name| !active.contains(name))
        .collect();
    if !extra.is_empty() {
        warn!(
            "ignoring covariance entries of parameters that are not varying: {}",
            extra.iter().join(", ")
        );
    }

    let rescaled = rescale(external, store);
    if log_enabled!(Level::Debug) {
        debug!(
            "covariance in internal units:\n{}",
            format_matrix(&external_names, &rescaled)
        );
    }

    let selection = selection_matrix(&active, &external.names);
    let reordered = &selection * &rescaled * selection.transpose();
    if log_enabled!(Level::Debug) {
        debug!(
            "covariance reordered to the varying parameters:\n{}",
            format_matrix(&active, &reordered)
        );
    }

    let covered: Vec<bool> = active
        .iter()
        .map(|name| external_names.contains(name))
        .collect();
    for (name, _) in active.iter().zip(&covered).filter(|(_, &c)| !c) {
        debug!("`{name}` has no external covariance, using its prior width");
    }
    Mat::from_fn(active.len(), active.len(), |i, j| {
        if covered[i] && covered[j] {
            reordered[(i, j)]
        } else if i == j {
            sigmas[i] * sigmas[i]
        } else {
            0.
        }
    })
}

/// Working covariance of `store` and the eigen-basis of its inverse.
pub fn proposal_basis(
    store: &ParameterStore,
    external: Option<&CovarianceMatrix>,
) -> Result<EigenBasis, CovarianceError> {
    let working = working_covariance(store, external);
    if log_enabled!(Level::Debug) {
        debug!(
            "starting covariance matrix:\n{}",
            format_matrix(&store.varying_names(), &working)
        );
    }
    EigenBasis::from_covariance(&working)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parameters::Parameter;
    use approx::assert_relative_eq;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn store(names: &[(&str, f64, f64)]) -> ParameterStore {
        ParameterStore::new(
            names
                .iter()
                .map(|&(name, sigma, scale)| Parameter::varying(name, 0., sigma).with_scale(scale))
                .collect(),
        )
        .unwrap()
    }

    #[test]
    fn parse_text_format() {
        let text = "# omega_b, n_s ,  h\n\
                    1.0 0.1 0.2\n\
                    0.1 2.0 0.3\n\
                    \n\
                    0.2 0.3 3.0\n";
        let cov: CovarianceMatrix = text.parse().unwrap();
        assert_eq!(cov.names(), &["omega_b", "n_s", "h"]);
        assert_eq!(cov.matrix()[(1, 2)], 0.3);
        assert_eq!(cov.matrix()[(2, 2)], 3.0);
    }

    #[test]
    fn parse_errors() {
        assert!(matches!(
            "1 2\n3 4".parse::<CovarianceMatrix>(),
            Err(CovarianceError::MissingHeader)
        ));
        assert!(matches!(
            "#a,b\n1 2\n3".parse::<CovarianceMatrix>(),
            Err(CovarianceError::RowLength { line: 3, .. })
        ));
        assert!(matches!(
            "#a,b\n1 2\n3 x".parse::<CovarianceMatrix>(),
            Err(CovarianceError::Parse { line: 3, .. })
        ));
        assert!(matches!(
            "#a,b\n1 2".parse::<CovarianceMatrix>(),
            Err(CovarianceError::RowCount {
                expected: 2,
                found: 1
            })
        ));
        assert!(matches!(
            "#a,a\n1 0\n0 1".parse::<CovarianceMatrix>(),
            Err(CovarianceError::DuplicateName(_))
        ));
    }

    #[test]
    fn prior_only_covariance() {
        let store = store(&[("a", 0.5, 1.), ("b", 2., 1.)]);
        let working = working_covariance(&store, None);
        assert_eq!(working[(0, 0)], 0.25);
        assert_eq!(working[(1, 1)], 4.);
        assert_eq!(working[(0, 1)], 0.);

        let basis = proposal_basis(&store, None).unwrap();
        let mut values = basis.values().to_vec();
        values.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert_relative_eq!(values[0], 0.25, epsilon = 1e-12);
        assert_relative_eq!(values[1], 4., epsilon = 1e-12);
    }

    #[test]
    fn missing_parameter_uses_prior_width() {
        let store = store(&[("a", 1., 1.), ("b", 3., 1.), ("c", 1., 1.)]);
        let external: CovarianceMatrix = "# c, a\n4.0 1.5\n1.5 2.0".parse().unwrap();
        let working = working_covariance(&store, Some(&external));

        assert_eq!(working[(1, 1)], 9.);
        for k in [0, 2] {
            assert_eq!(working[(1, k)], 0.);
            assert_eq!(working[(k, 1)], 0.);
        }
        assert_eq!(working[(0, 0)], 2.);
        assert_eq!(working[(2, 2)], 4.);
        assert_eq!(working[(0, 2)], 1.5);
        assert_eq!(working[(2, 0)], 1.5);
    }

    #[test]
    fn extra_names_are_dropped_and_scales_applied() {
        let store = store(&[("a", 1., 0.1), ("b", 1., 2.)]);
        let external: CovarianceMatrix = "# b, tau, a\n4.0 7.0 0.2\n7.0 9.0 5.0\n0.2 5.0 0.01"
            .parse()
            .unwrap();
        let working = working_covariance(&store, Some(&external));
        assert_eq!(working.nrows(), 2);
        assert_relative_eq!(working[(0, 0)], 1., epsilon = 1e-12);
        assert_relative_eq!(working[(1, 1)], 1., epsilon = 1e-12);
        assert_relative_eq!(working[(0, 1)], 1., epsilon = 1e-12);
        assert_relative_eq!(working[(1, 0)], 1., epsilon = 1e-12);
    }

    #[test]
    fn singular_covariance_is_an_error() {
        let store = store(&[("a", 1., 1.), ("b", 1., 1.)]);
        let external: CovarianceMatrix = "# a, b\n1.0 1.0\n1.0 1.0".parse().unwrap();
        let err = proposal_basis(&store, Some(&external)).unwrap_err();
        assert!(matches!(err, CovarianceError::LinearAlgebra(_)));
    }

    #[test]
    fn eigen_basis_reconstructs_inverse() {
        let cov = Mat::from_fn(2, 2, |i, j| [[2.0, 0.5], [0.5, 1.0]][i][j]);
        let basis = EigenBasis::from_covariance(&cov).unwrap();
        let det = 2.0 * 1.0 - 0.25;
        let inverse = [[1.0 / det, -0.5 / det], [-0.5 / det, 2.0 / det]];
        for i in 0..2 {
            for j in 0..2 {
                let val: f64 = (0..2)
                    .map(|k| basis.vectors()[(i, k)] * basis.values()[k] * basis.vectors()[(j, k)])
                    .sum();
                assert_relative_eq!(val, inverse[i][j], epsilon = 1e-12);
            }
        }
    }

    proptest! {
        #[test]
        fn matching_names_reorder_exactly(
            entries in prop::collection::vec(-1f64..1f64, 16),
            scales in prop::collection::vec(0.1f64..10f64, 4),
            shift in 0usize..4,
        ) {
            let dim = 4;
            let names = ["a", "b", "c", "d"];
            // B Bᵀ + I is symmetric positive definite
            let base = Mat::from_fn(dim, dim, |i, j| entries[i * dim + j]);
            let spd = Mat::from_fn(dim, dim, |i, j| {
                let dot: f64 = (0..dim).map(|k| base[(i, k)] * base[(j, k)]).sum();
                if i == j { dot + 1. } else { dot }
            });
            let external_names: Vec<String> = (0..dim)
                .map(|e| names[(e + shift) % dim].to_string())
                .collect();
            let external = CovarianceMatrix::new(external_names, spd.clone()).unwrap();

            let store = ParameterStore::new(
                names
                    .iter()
                    .zip(&scales)
                    .map(|(&name, &scale)| Parameter::varying(name, 0., 1.).with_scale(scale))
                    .collect(),
            )
            .unwrap();
            let working = working_covariance(&store, Some(&external));

            for i in 0..dim {
                for j in 0..dim {
                    let ei = (i + dim - shift) % dim;
                    let ej = (j + dim - shift) % dim;
                    let expected = spd[(ei, ej)] / (scales[i] * scales[j]);
                    prop_assert_eq!(working[(i, j)], expected);
                }
            }
        }
    }
}
