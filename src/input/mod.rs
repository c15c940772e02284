//! # Model inputs
//!
//! A light-weight column store for patient-level (or study-level) records:
//! numeric columns carry `NaN` for missing values, categorical columns carry
//! `None`.
//!
//! # Examples
//!
//! ```
//! use ipdma_effects::Dataset;
//!
//! let dataset = Dataset::new()
//!     .with_numeric("death", vec![0.0, 1.0, 0.0])
//!     .with_categorical("trial", vec![Some("A"), Some("A"), Some("B")]);
//!
//! assert!(dataset.validate().is_ok());
//! assert_eq!(dataset.n_rows(), 3);
//! ```
//!
//! ```
//! use ipdma_effects::Dataset;
//!
//! let dataset = Dataset::new()
//!     .with_numeric("death", vec![0.0, 1.0, 0.0])
//!     .with_numeric("age", vec![71.0, 64.0]);
//!
//! assert!(dataset.validate().is_err());
//! ```

use std::collections::BTreeMap;

use thiserror::Error;

/// Errors returned when validating or querying a dataset.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InputError {
    #[error("column `{column}` has {len} rows; expected {rows}")]
    LengthMismatch {
        column: String,
        len: usize,
        rows: usize,
    },
    #[error("column `{0}` is not present in the dataset")]
    MissingColumn(String),
    #[error("column `{0}` is not numeric")]
    NotNumeric(String),
}

/// One dataset column.
#[derive(Debug, Clone, PartialEq)]
pub enum Column {
    /// Continuous or 0/1-coded values; `NaN` marks a missing value.
    Numeric(Vec<f64>),
    /// Factor levels; `None` marks a missing value.
    Categorical(Vec<Option<String>>),
}

impl Column {
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Numeric(values) => values.len(),
            Self::Categorical(values) => values.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the value at `row` is missing.
    #[must_use]
    pub fn is_missing(&self, row: usize) -> bool {
        match self {
            Self::Numeric(values) => values.get(row).is_none_or(|value| value.is_nan()),
            Self::Categorical(values) => values.get(row).is_none_or(Option::is_none),
        }
    }

    /// Sorted distinct non-missing levels as strings.
    ///
    /// Numeric columns report their distinct values formatted with `{}`.
    #[must_use]
    pub fn levels(&self) -> Vec<String> {
        match self {
            Self::Categorical(values) => {
                let mut levels = values.iter().flatten().cloned().collect::<Vec<_>>();
                levels.sort();
                levels.dedup();
                levels
            }
            Self::Numeric(values) => {
                let mut distinct = values
                    .iter()
                    .copied()
                    .filter(|value| !value.is_nan())
                    .collect::<Vec<_>>();
                distinct.sort_by(f64::total_cmp);
                distinct.dedup();
                distinct.into_iter().map(|value| format!("{value}")).collect()
            }
        }
    }

    /// Level label at `row`, formatting numeric values with `{}`.
    #[must_use]
    pub fn label_at(&self, row: usize) -> Option<String> {
        match self {
            Self::Categorical(values) => values.get(row).cloned().flatten(),
            Self::Numeric(values) => values
                .get(row)
                .copied()
                .filter(|value| !value.is_nan())
                .map(|value| format!("{value}")),
        }
    }

    fn select(&self, rows: &[usize]) -> Self {
        match self {
            Self::Numeric(values) => Self::Numeric(rows.iter().map(|row| values[*row]).collect()),
            Self::Categorical(values) => {
                Self::Categorical(rows.iter().map(|row| values[*row].clone()).collect())
            }
        }
    }
}

/// Column-oriented tabular dataset.
///
/// Column insertion order is preserved for display; lookups are by name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dataset {
    columns: BTreeMap<String, Column>,
    order: Vec<String>,
}

impl Dataset {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a numeric column.
    #[must_use]
    pub fn with_numeric(mut self, name: impl Into<String>, values: Vec<f64>) -> Self {
        self.insert(name.into(), Column::Numeric(values));
        self
    }

    /// Add or replace a categorical column.
    #[must_use]
    pub fn with_categorical<S: Into<String>>(
        mut self,
        name: impl Into<String>,
        values: Vec<Option<S>>,
    ) -> Self {
        let values = values.into_iter().map(|value| value.map(Into::into)).collect();
        self.insert(name.into(), Column::Categorical(values));
        self
    }

    /// Add or replace a column in place.
    pub fn insert(&mut self, name: String, column: Column) {
        if !self.columns.contains_key(&name) {
            self.order.push(name.clone());
        }
        self.columns.insert(name, column);
    }

    /// Number of rows, taken from the first inserted column.
    #[must_use]
    pub fn n_rows(&self) -> usize {
        self.order
            .first()
            .and_then(|name| self.columns.get(name))
            .map_or(0, Column::len)
    }

    #[must_use]
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.get(name)
    }

    #[must_use]
    pub fn has_column(&self, name: &str) -> bool {
        self.columns.contains_key(name)
    }

    /// Column names in insertion order.
    #[must_use]
    pub fn column_names(&self) -> &[String] {
        &self.order
    }

    /// # Errors
    ///
    /// Returns `InputError` if the column is absent or categorical.
    pub fn numeric(&self, name: &str) -> Result<&[f64], InputError> {
        match self.columns.get(name) {
            Some(Column::Numeric(values)) => Ok(values),
            Some(Column::Categorical(_)) => Err(InputError::NotNumeric(name.to_string())),
            None => Err(InputError::MissingColumn(name.to_string())),
        }
    }

    /// Validate that every column has the same number of rows.
    ///
    /// # Errors
    ///
    /// Returns `InputError::LengthMismatch` for the first ragged column.
    pub fn validate(&self) -> Result<(), InputError> {
        let rows = self.n_rows();
        for name in &self.order {
            let len = self.columns.get(name).map_or(0, Column::len);
            if len != rows {
                return Err(InputError::LengthMismatch {
                    column: name.clone(),
                    len,
                    rows,
                });
            }
        }
        Ok(())
    }

    /// Rows where none of `columns` is missing.
    ///
    /// # Errors
    ///
    /// Returns `InputError` if a column is absent or the dataset is ragged.
    pub fn complete_case_rows(&self, columns: &[&str]) -> Result<Vec<usize>, InputError> {
        self.validate()?;
        let selected = columns
            .iter()
            .map(|name| {
                self.columns
                    .get(*name)
                    .ok_or_else(|| InputError::MissingColumn((*name).to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok((0..self.n_rows())
            .filter(|row| selected.iter().all(|column| !column.is_missing(*row)))
            .collect())
    }

    /// Copy restricted to rows where none of `columns` is missing.
    ///
    /// # Errors
    ///
    /// Returns `InputError` if a column is absent or the dataset is ragged.
    pub fn complete_cases(&self, columns: &[&str]) -> Result<Self, InputError> {
        let rows = self.complete_case_rows(columns)?;
        Ok(self.select_rows(&rows))
    }

    /// Copy restricted to rows for which `keep(self, row)` holds.
    ///
    /// # Errors
    ///
    /// Returns `InputError` if the dataset is ragged.
    pub fn filter_rows<F>(&self, keep: F) -> Result<Self, InputError>
    where
        F: Fn(&Self, usize) -> bool,
    {
        self.validate()?;
        let rows = (0..self.n_rows())
            .filter(|row| keep(self, *row))
            .collect::<Vec<_>>();
        Ok(self.select_rows(&rows))
    }

    fn select_rows(&self, rows: &[usize]) -> Self {
        let columns = self
            .columns
            .iter()
            .map(|(name, column)| (name.clone(), column.select(rows)))
            .collect();
        Self {
            columns,
            order: self.order.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Dataset {
        Dataset::new()
            .with_numeric("death", vec![0.0, 1.0, f64::NAN, 1.0])
            .with_categorical("trial", vec![Some("A"), None, Some("B"), Some("B")])
    }

    #[test]
    fn validate_rejects_ragged_columns() {
        let dataset = sample().with_numeric("age", vec![1.0]);
        assert!(matches!(
            dataset.validate(),
            Err(InputError::LengthMismatch { len: 1, rows: 4, .. })
        ));
    }

    #[test]
    fn complete_cases_drops_rows_with_missing_values() {
        let dataset = sample();
        let complete = dataset
            .complete_cases(&["death", "trial"])
            .expect("columns exist");
        assert_eq!(complete.n_rows(), 2);
        assert_eq!(complete.numeric("death").expect("numeric"), &[0.0, 1.0]);
    }

    #[test]
    fn complete_cases_rejects_unknown_columns() {
        let err = sample()
            .complete_cases(&["lactate"])
            .expect_err("unknown column");
        assert_eq!(err, InputError::MissingColumn("lactate".to_string()));
    }

    #[test]
    fn levels_are_sorted_and_distinct() {
        let dataset = sample();
        let levels = dataset.column("trial").expect("column").levels();
        assert_eq!(levels, vec!["A".to_string(), "B".to_string()]);
    }

    #[test]
    fn filter_rows_keeps_matching_rows() {
        let dataset = sample();
        let filtered = dataset
            .filter_rows(|data, row| {
                data.column("trial")
                    .and_then(|column| column.label_at(row))
                    .is_some_and(|label| label == "B")
            })
            .expect("dataset is rectangular");
        assert_eq!(filtered.n_rows(), 2);
    }
}
