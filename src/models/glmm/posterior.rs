//! Posterior draw storage with named columns.

use std::collections::BTreeMap;

use faer::Mat;
use thiserror::Error;

use crate::utils::{mean, percentile, sorted_copy, usize_to_f64};

/// Errors raised when building or querying posterior draws.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PosteriorError {
    #[error("unknown posterior column `{0}`")]
    UnknownColumn(String),
    #[error("posterior column `{0}` appears more than once")]
    DuplicateColumn(String),
    #[error("posterior draws are required")]
    Empty,
    #[error("draw matrix has {columns} columns but {names} names were given")]
    ShapeMismatch { columns: usize, names: usize },
    #[error("posterior draw sets have different columns")]
    IncompatibleColumns,
}

/// Pooled posterior draws: one row per retained draw, one column per named
/// parameter.
///
/// Rows are exchangeable; column order is fixed at construction.
#[derive(Debug, Clone)]
pub struct PosteriorSamples {
    names: Vec<String>,
    index: BTreeMap<String, usize>,
    draws: Mat<f64>,
}

impl PosteriorSamples {
    /// # Errors
    ///
    /// Returns `PosteriorError` for empty draws, duplicate names, or a column
    /// count that does not match `names`.
    pub fn new(names: Vec<String>, draws: Mat<f64>) -> Result<Self, PosteriorError> {
        if draws.nrows() == 0 {
            return Err(PosteriorError::Empty);
        }
        if draws.ncols() != names.len() {
            return Err(PosteriorError::ShapeMismatch {
                columns: draws.ncols(),
                names: names.len(),
            });
        }
        let mut index = BTreeMap::new();
        for (position, name) in names.iter().enumerate() {
            if index.insert(name.clone(), position).is_some() {
                return Err(PosteriorError::DuplicateColumn(name.clone()));
            }
        }
        Ok(Self {
            names,
            index,
            draws,
        })
    }

    /// Build from row-major draws.
    ///
    /// # Errors
    ///
    /// Returns `PosteriorError` if rows are ragged or the shape is invalid.
    pub fn from_rows(names: Vec<String>, rows: &[Vec<f64>]) -> Result<Self, PosteriorError> {
        if let Some(row) = rows.iter().find(|row| row.len() != names.len()) {
            return Err(PosteriorError::ShapeMismatch {
                columns: row.len(),
                names: names.len(),
            });
        }
        let draws = Mat::from_fn(rows.len(), names.len(), |row, col| rows[row][col]);
        Self::new(names, draws)
    }

    /// Concatenate draw sets that share the same columns in the same order.
    ///
    /// # Errors
    ///
    /// Returns `PosteriorError` for an empty slice or mismatched columns.
    pub fn stack(parts: &[&Self]) -> Result<Self, PosteriorError> {
        let first = parts.first().ok_or(PosteriorError::Empty)?;
        if parts.iter().any(|part| part.names != first.names) {
            return Err(PosteriorError::IncompatibleColumns);
        }
        let total = parts.iter().map(|part| part.n_draws()).sum();
        let mut owners = Vec::with_capacity(total);
        for part in parts {
            owners.extend((0..part.n_draws()).map(|row| (*part, row)));
        }
        let draws = Mat::from_fn(total, first.n_columns(), |row, col| {
            let (part, local) = owners[row];
            part.draws[(local, col)]
        });
        Self::new(first.names.clone(), draws)
    }

    #[must_use]
    pub fn column_names(&self) -> &[String] {
        &self.names
    }

    #[must_use]
    pub fn n_draws(&self) -> usize {
        self.draws.nrows()
    }

    #[must_use]
    pub fn n_columns(&self) -> usize {
        self.draws.ncols()
    }

    #[must_use]
    pub const fn draws(&self) -> &Mat<f64> {
        &self.draws
    }

    #[must_use]
    pub fn has_column(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// # Errors
    ///
    /// Returns `PosteriorError::UnknownColumn` if `name` is absent.
    pub fn column_index(&self, name: &str) -> Result<usize, PosteriorError> {
        self.index
            .get(name)
            .copied()
            .ok_or_else(|| PosteriorError::UnknownColumn(name.to_string()))
    }

    /// Copy of one column's draws.
    ///
    /// # Errors
    ///
    /// Returns `PosteriorError::UnknownColumn` if `name` is absent.
    pub fn column(&self, name: &str) -> Result<Vec<f64>, PosteriorError> {
        let col = self.column_index(name)?;
        Ok((0..self.n_draws()).map(|row| self.draws[(row, col)]).collect())
    }

    /// Draws of `name` restricted to `rows`.
    ///
    /// # Errors
    ///
    /// Returns `PosteriorError::UnknownColumn` if `name` is absent.
    pub fn column_rows(
        &self,
        name: &str,
        rows: std::ops::Range<usize>,
    ) -> Result<Vec<f64>, PosteriorError> {
        let col = self.column_index(name)?;
        Ok(rows
            .filter(|row| *row < self.n_draws())
            .map(|row| self.draws[(row, col)])
            .collect())
    }

    /// Mean, standard deviation, and quantiles of every column.
    #[must_use]
    pub fn summarize_columns(&self) -> Vec<(String, ParameterSummary)> {
        self.names
            .iter()
            .enumerate()
            .map(|(col, name)| {
                let values = (0..self.n_draws())
                    .map(|row| self.draws[(row, col)])
                    .collect::<Vec<_>>();
                (name.clone(), summarize_scalar(&values))
            })
            .collect()
    }
}

/// Scalar posterior summary statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ParameterSummary {
    pub mean: f64,
    pub std_dev: f64,
    pub q025: f64,
    pub q50: f64,
    pub q975: f64,
}

/// Summarize one vector of draws.
#[must_use]
pub fn summarize_scalar(values: &[f64]) -> ParameterSummary {
    if values.is_empty() {
        return ParameterSummary::default();
    }
    let centre = mean(values);
    let variance = if values.len() > 1 {
        values
            .iter()
            .map(|value| (value - centre) * (value - centre))
            .sum::<f64>()
            / usize_to_f64(values.len() - 1)
    } else {
        0.0
    };
    let sorted = sorted_copy(values);
    ParameterSummary {
        mean: centre,
        std_dev: variance.sqrt(),
        q025: percentile(&sorted, 0.025),
        q50: percentile(&sorted, 0.5),
        q975: percentile(&sorted, 0.975),
    }
}
