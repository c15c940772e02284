/////////////////////////////////////////////////////////////////////////////////////////////\
//
// Analytic probability of benefit from published risk-ratio intervals.
//
// Created on: 18 Oct 2026
//
/////////////////////////////////////////////////////////////////////////////////////////////
//! Probability of benefit from a published risk ratio and one interval bound.
//!
//! The log risk ratio is treated as normal with `mu = ln(point)` and
//! `sigma = (ln(upper) - mu) / z`, where `z` is the two-sided critical value
//! for the interval's level.

use thiserror::Error;

use crate::utils::{standard_normal_cdf, two_sided_z};

/// Invalid inputs to the analytic shortcut.
#[derive(Debug, Error, Clone, Copy, PartialEq)]
pub enum BoundsError {
    #[error("risk ratios must be positive and finite; found point {point}, upper {upper}")]
    NonPositive { point: f64, upper: f64 },
    #[error("upper bound {upper} must exceed the point estimate {point}")]
    UpperNotAbovePoint { point: f64, upper: f64 },
    #[error("confidence level must lie in (0, 1); found {0}")]
    InvalidLevel(f64),
    #[error("risk-ratio threshold must be positive and finite; found {0}")]
    InvalidThreshold(f64),
}

/// Implied normal sampling distribution of the log risk ratio.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImpliedLogNormal {
    pub mu: f64,
    pub sigma: f64,
}

impl ImpliedLogNormal {
    /// Back-calculate from a risk ratio and the upper bound of its interval.
    ///
    /// # Errors
    ///
    /// Returns `BoundsError` for non-positive inputs, an upper bound not above
    /// the point estimate, or a level outside (0, 1).
    pub fn from_upper_bound(point_rr: f64, upper_rr: f64, level: f64) -> Result<Self, BoundsError> {
        let finite_positive = |value: f64| value.is_finite() && value > 0.0;
        if !(finite_positive(point_rr) && finite_positive(upper_rr)) {
            return Err(BoundsError::NonPositive {
                point: point_rr,
                upper: upper_rr,
            });
        }
        if upper_rr <= point_rr {
            return Err(BoundsError::UpperNotAbovePoint {
                point: point_rr,
                upper: upper_rr,
            });
        }
        if !(level > 0.0 && level < 1.0) {
            return Err(BoundsError::InvalidLevel(level));
        }
        let mu = point_rr.ln();
        let sigma = (upper_rr.ln() - mu) / two_sided_z(level);
        Ok(Self { mu, sigma })
    }

    /// `P(RR < threshold_rr)`.
    #[must_use]
    pub fn probability_below(&self, threshold_rr: f64) -> f64 {
        standard_normal_cdf((threshold_rr.ln() - self.mu) / self.sigma)
    }
}

/// Probability that the true risk ratio is below 1.
///
/// # Errors
///
/// Returns `BoundsError` as described on [`ImpliedLogNormal::from_upper_bound`].
pub fn probability_of_benefit(point_rr: f64, upper_rr: f64, level: f64) -> Result<f64, BoundsError> {
    Ok(ImpliedLogNormal::from_upper_bound(point_rr, upper_rr, level)?.probability_below(1.0))
}

/// Probability that the true risk ratio is below `threshold_rr`, e.g. 0.9
/// for "at least a 10% relative reduction".
///
/// # Errors
///
/// Returns `BoundsError` for invalid inputs or a non-positive threshold.
pub fn probability_beyond(
    point_rr: f64,
    upper_rr: f64,
    level: f64,
    threshold_rr: f64,
) -> Result<f64, BoundsError> {
    if !(threshold_rr.is_finite() && threshold_rr > 0.0) {
        return Err(BoundsError::InvalidThreshold(threshold_rr));
    }
    Ok(ImpliedLogNormal::from_upper_bound(point_rr, upper_rr, level)?.probability_below(threshold_rr))
}
