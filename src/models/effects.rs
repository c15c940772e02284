//! Effect summaries from posterior draws of a log-scale coefficient.
//!
//! Intervals use the type-7 quantile rule of [`crate::utils::percentile`].
//! Direction probabilities are always computed on the untransformed
//! (additive) scale, where 0 means no effect. A negative log coefficient is
//! read as benefit.

use thiserror::Error;

use crate::utils::{percentile, sorted_copy, usize_to_f64};

/// Conventional 95% credible level.
pub const DEFAULT_CREDIBLE_LEVEL: f64 = 0.95;

/// Errors raised while summarizing draws.
#[derive(Debug, Error, Clone, Copy, PartialEq)]
pub enum EffectError {
    #[error("at least one draw is required")]
    EmptyDraws,
    #[error("draws contain non-finite values")]
    NonFiniteDraws,
    #[error("credible level must lie in (0, 1); found {0}")]
    InvalidCredibleLevel(f64),
    #[error("baseline risk must lie in (0, 1); found {0}")]
    InvalidBaselineRisk(f64),
}

/// Point estimate, credible interval, and direction probabilities.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EffectSummary {
    /// Transformed median.
    pub point_estimate: f64,
    pub lower: f64,
    pub upper: f64,
    pub credible_level: f64,
    /// Share of draws strictly below 0 on the additive scale.
    pub prob_negative: f64,
    /// Share of draws strictly above 0 on the additive scale.
    pub prob_positive: f64,
}

impl EffectSummary {
    /// Posterior probability of benefit (`prob_negative`).
    #[must_use]
    pub const fn prob_benefit(&self) -> f64 {
        self.prob_negative
    }

    /// Posterior probability of harm (`prob_positive`).
    #[must_use]
    pub const fn prob_harm(&self) -> f64 {
        self.prob_positive
    }

    /// Whether `value` (on the transformed scale) falls outside the interval.
    #[must_use]
    pub fn interval_excludes(&self, value: f64) -> bool {
        value < self.lower || value > self.upper
    }
}

/// Shares of draws on either side of zero.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DirectionProbabilities {
    pub prob_negative: f64,
    pub prob_positive: f64,
}

/// # Errors
///
/// Returns `EffectError` for empty or non-finite draws.
pub fn direction_probabilities(samples: &[f64]) -> Result<DirectionProbabilities, EffectError> {
    check_draws(samples)?;
    let n = usize_to_f64(samples.len());
    let negative = samples.iter().filter(|value| **value < 0.0).count();
    let positive = samples.iter().filter(|value| **value > 0.0).count();
    Ok(DirectionProbabilities {
        prob_negative: usize_to_f64(negative) / n,
        prob_positive: usize_to_f64(positive) / n,
    })
}

/// Summarize draws at `credible_level`, applying the monotone `transform` to
/// each quantile.
///
/// The interval runs from the `(1 - level) / 2` to the `1 - (1 - level) / 2`
/// quantile; the point estimate is the transformed median.
///
/// # Errors
///
/// Returns `EffectError` for empty or non-finite draws or a level outside (0, 1).
pub fn summarize<F>(samples: &[f64], credible_level: f64, transform: F) -> Result<EffectSummary, EffectError>
where
    F: Fn(f64) -> f64,
{
    check_level(credible_level)?;
    let direction = direction_probabilities(samples)?;
    let tail = 0.5 * (1.0 - credible_level);
    let sorted = sorted_copy(samples);
    Ok(EffectSummary {
        point_estimate: transform(percentile(&sorted, 0.5)),
        lower: transform(percentile(&sorted, tail)),
        upper: transform(percentile(&sorted, 1.0 - tail)),
        credible_level,
        prob_negative: direction.prob_negative,
        prob_positive: direction.prob_positive,
    })
}

/// 95% summary of log-ratio draws on the ratio scale.
///
/// # Errors
///
/// Returns `EffectError` for empty or non-finite draws.
pub fn summarize_ratio(samples: &[f64]) -> Result<EffectSummary, EffectError> {
    summarize(samples, DEFAULT_CREDIBLE_LEVEL, f64::exp)
}

/// Absolute risk reduction against a caller-supplied baseline risk.
///
/// `baseline_risk` is an external assumption (e.g. an assumed control-arm
/// mortality), not a fitted quantity. Every draw maps to
/// `exp(draw) * baseline_risk - baseline_risk`; the result is summarized on
/// that additive scale.
///
/// # Errors
///
/// Returns `EffectError` for invalid draws, level, or baseline risk.
pub fn absolute_risk_summary(
    samples: &[f64],
    baseline_risk: f64,
    credible_level: f64,
) -> Result<EffectSummary, EffectError> {
    if !(baseline_risk > 0.0 && baseline_risk < 1.0) {
        return Err(EffectError::InvalidBaselineRisk(baseline_risk));
    }
    check_draws(samples)?;
    let differences = samples
        .iter()
        .map(|log_ratio| log_ratio.exp().mul_add(baseline_risk, -baseline_risk))
        .collect::<Vec<_>>();
    summarize(&differences, credible_level, |value| value)
}

/// Share of draws strictly below `threshold` on the additive scale, e.g.
/// `probability_below(draws, 0.9_f64.ln())` for P(RR < 0.9).
///
/// # Errors
///
/// Returns `EffectError` for empty or non-finite draws.
pub fn probability_below(samples: &[f64], threshold: f64) -> Result<f64, EffectError> {
    check_draws(samples)?;
    let below = samples.iter().filter(|value| **value < threshold).count();
    Ok(usize_to_f64(below) / usize_to_f64(samples.len()))
}

fn check_draws(samples: &[f64]) -> Result<(), EffectError> {
    if samples.is_empty() {
        return Err(EffectError::EmptyDraws);
    }
    if samples.iter().any(|value| !value.is_finite()) {
        return Err(EffectError::NonFiniteDraws);
    }
    Ok(())
}

fn check_level(level: f64) -> Result<(), EffectError> {
    if level > 0.0 && level < 1.0 {
        Ok(())
    } else {
        Err(EffectError::InvalidCredibleLevel(level))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    const FIVE: [f64; 5] = [-0.1, -0.05, 0.0, 0.05, 0.1];

    #[test]
    fn direction_shares_exclude_exact_zero() {
        let direction = direction_probabilities(&FIVE).expect("valid draws");
        assert_relative_eq!(direction.prob_negative, 0.4);
        assert_relative_eq!(direction.prob_positive, 0.4);
    }

    #[test]
    fn ratio_summary_exponentiates_quantiles() {
        let summary = summarize_ratio(&FIVE).expect("valid draws");
        assert_relative_eq!(summary.point_estimate, 1.0);
        // position 0.025 * 4 = 0.1 between -0.1 and -0.05
        assert_relative_eq!(summary.lower, (-0.095_f64).exp(), epsilon = 1.0e-12);
        assert_relative_eq!(summary.upper, 0.095_f64.exp(), epsilon = 1.0e-12);
        assert_relative_eq!(summary.prob_benefit(), 0.4);
        assert!(!summary.interval_excludes(1.0));
    }

    #[test]
    fn narrower_levels_nest_inside_wider_ones() {
        let draws = (0..200_i32).map(|idx| (f64::from(idx) - 100.0) / 50.0).collect::<Vec<_>>();
        let wide = summarize(&draws, 0.95, f64::exp).expect("valid");
        let narrow = summarize(&draws, 0.5, f64::exp).expect("valid");
        assert!(wide.lower <= narrow.lower && narrow.lower <= narrow.point_estimate);
        assert!(narrow.point_estimate <= narrow.upper && narrow.upper <= wide.upper);
    }

    #[test]
    fn absolute_risk_is_zero_at_unit_ratio() {
        let summary = absolute_risk_summary(&[0.0, 0.0, 0.0], 0.4, 0.95).expect("valid");
        assert_relative_eq!(summary.point_estimate, 0.0);
        assert_relative_eq!(summary.lower, 0.0);
        assert_relative_eq!(summary.upper, 0.0);
        assert_relative_eq!(summary.prob_negative, 0.0);
    }

    #[test]
    fn absolute_risk_scales_with_baseline() {
        let summary = absolute_risk_summary(&[0.5_f64.ln()], 0.4, 0.95).expect("valid");
        assert_relative_eq!(summary.point_estimate, -0.2, epsilon = 1.0e-12);
        assert_eq!(
            absolute_risk_summary(&FIVE, 1.2, 0.95),
            Err(EffectError::InvalidBaselineRisk(1.2))
        );
    }

    #[test]
    fn threshold_probability_counts_strictly_below() {
        assert_relative_eq!(probability_below(&FIVE, 0.0).expect("valid"), 0.4);
        assert_relative_eq!(probability_below(&FIVE, 0.06).expect("valid"), 0.8);
    }

    #[test]
    fn invalid_inputs_are_rejected() {
        assert_eq!(summarize_ratio(&[]), Err(EffectError::EmptyDraws));
        assert_eq!(summarize_ratio(&[0.1, f64::NAN]), Err(EffectError::NonFiniteDraws));
        assert_eq!(
            summarize(&FIVE, 1.0, f64::exp),
            Err(EffectError::InvalidCredibleLevel(1.0))
        );
    }

    #[test]
    fn repeated_summaries_are_bit_identical() {
        let first = summarize(&FIVE, 0.9, f64::exp).expect("valid");
        let second = summarize(&FIVE, 0.9, f64::exp).expect("valid");
        assert_eq!(first.point_estimate.to_bits(), second.point_estimate.to_bits());
        assert_eq!(first.lower.to_bits(), second.lower.to_bits());
        assert_eq!(first.upper.to_bits(), second.upper.to_bits());
    }
}
