/////////////////////////////////////////////////////////////////////////////////////////////\
//
// Shared linear algebra, quantile, and normal-distribution utilities.
//
// Created on: 18 Oct 2026
//
/////////////////////////////////////////////////////////////////////////////////////////////
//! # Utilities
//!
//! Shared helpers for linear solves, empirical quantiles, and the standard
//! normal distribution.

use faer::Mat;
use faer::prelude::Solve;
use num_traits::ToPrimitive;
use statrs::distribution::{ContinuousCDF, Normal};
use thiserror::Error;

/// Failure of a dense linear solve.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("linear solve produced non-finite values")]
pub struct SolveError;

/// # Errors
///
/// Returns `SolveError` if the solve produces non-finite values.
pub fn solve_linear_system(a: &Mat<f64>, b: &Mat<f64>) -> Result<Mat<f64>, SolveError> {
    let rhs = b.clone();
    let lu = a.full_piv_lu();
    let solution = lu.solve(rhs);
    if !matrix_is_finite(&solution) {
        return Err(SolveError);
    }
    Ok(solution)
}

#[must_use]
pub fn matrix_is_finite(matrix: &Mat<f64>) -> bool {
    for i in 0..matrix.nrows() {
        for j in 0..matrix.ncols() {
            if !matrix[(i, j)].is_finite() {
                return false;
            }
        }
    }
    true
}

/// Empirical quantile of already sorted values.
///
/// Linear interpolation between order statistics at position `p * (n - 1)`
/// (Hyndman-Fan type 7, the R and NumPy default). `NaN` for empty input.
#[must_use]
pub fn percentile(sorted_values: &[f64], probability: f64) -> f64 {
    if sorted_values.is_empty() {
        return f64::NAN;
    }

    let clamped = probability.clamp(0.0, 1.0);
    let last = sorted_values.len() - 1;
    let position = clamped * usize_to_f64(last);
    let lower = position.floor().to_usize().unwrap_or(0);
    let upper = position.ceil().to_usize().unwrap_or(last).min(last);

    if lower == upper {
        sorted_values[lower]
    } else {
        let weight = position - usize_to_f64(lower);
        (1.0 - weight).mul_add(sorted_values[lower], weight * sorted_values[upper])
    }
}

/// Copy and sort values with `f64::total_cmp`.
#[must_use]
pub fn sorted_copy(values: &[f64]) -> Vec<f64> {
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    sorted
}

#[must_use]
pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    values.iter().sum::<f64>() / usize_to_f64(values.len())
}

/// Standard normal CDF.
#[must_use]
pub fn standard_normal_cdf(value: f64) -> f64 {
    standard_normal().cdf(value)
}

/// Standard normal quantile function.
#[must_use]
pub fn standard_normal_quantile(probability: f64) -> f64 {
    standard_normal().inverse_cdf(probability)
}

/// Two-sided critical value for a central interval, e.g. `1.959964` at `0.95`.
#[must_use]
pub fn two_sided_z(level: f64) -> f64 {
    standard_normal_quantile(0.5 * (1.0 + level))
}

fn standard_normal() -> Normal {
    // Unit parameters are always valid.
    Normal::standard()
}

#[must_use]
pub fn usize_to_f64(value: usize) -> f64 {
    f64::from(u32::try_from(value).unwrap_or(u32::MAX))
}
