//! Study-level meta-analysis of log risk ratios.
//!
//! Conventional pooling (inverse-variance fixed effect and DerSimonian-Laird
//! random effects) works directly on [`StudyEstimate`]s. The Bayesian variant
//! turns the same estimates into a [`Dataset`] and a known-SE Gaussian
//! [`ModelSpec`] for [`HierarchicalFitter`](super::glmm::HierarchicalFitter).

use std::fmt;

use statrs::distribution::{ChiSquared, ContinuousCDF};
use thiserror::Error;

use crate::input::Dataset;
use crate::utils::{standard_normal_cdf, two_sided_z, usize_to_f64};

use super::glmm::{Family, GroupingTerm, Link, ModelSpec, PriorSet};

/// Study label column of [`study_summary_dataset`].
pub const STUDY_COLUMN: &str = "study";
/// Log risk ratio column of [`study_summary_dataset`].
pub const ESTIMATE_COLUMN: &str = "log_rr";
/// Standard error column of [`study_summary_dataset`].
pub const STANDARD_ERROR_COLUMN: &str = "se";

#[derive(Debug, Error, Clone, PartialEq)]
pub enum MetaAnalysisError {
    #[error("at least two studies are required; found {0}")]
    TooFewStudies(usize),
    #[error("study `{label}` has a non-finite estimate")]
    NonFiniteEstimate { label: String },
    #[error("study `{label}` has standard error {se}; it must be positive and finite")]
    InvalidStandardError { label: String, se: f64 },
    #[error("confidence level must lie in (0, 1); found {0}")]
    InvalidLevel(f64),
    #[error("study `{label}` has an invalid risk-ratio interval")]
    InvalidInterval { label: String },
}

/// Log risk ratio and standard error reported by one study.
#[derive(Debug, Clone, PartialEq)]
pub struct StudyEstimate {
    pub label: String,
    pub log_rr: f64,
    pub se: f64,
}

impl StudyEstimate {
    #[must_use]
    pub fn new(label: impl Into<String>, log_rr: f64, se: f64) -> Self {
        Self {
            label: label.into(),
            log_rr,
            se,
        }
    }

    /// Rebuild from a published risk ratio and its symmetric-on-log interval.
    ///
    /// # Errors
    ///
    /// Returns `MetaAnalysisError::InvalidInterval` unless
    /// `0 < lower < rr < upper`, and `InvalidLevel` for a level outside (0, 1).
    pub fn from_interval(
        label: impl Into<String>,
        risk_ratio: f64,
        lower: f64,
        upper: f64,
        level: f64,
    ) -> Result<Self, MetaAnalysisError> {
        let label = label.into();
        if !(level > 0.0 && level < 1.0) {
            return Err(MetaAnalysisError::InvalidLevel(level));
        }
        if !(lower > 0.0 && lower < risk_ratio && risk_ratio < upper && upper.is_finite()) {
            return Err(MetaAnalysisError::InvalidInterval { label });
        }
        let se = (upper.ln() - lower.ln()) / (2.0 * two_sided_z(level));
        Ok(Self::new(label, risk_ratio.ln(), se))
    }

    /// Interval on the risk-ratio scale at `level`.
    #[must_use]
    pub fn risk_ratio_interval(&self, level: f64) -> (f64, f64) {
        let half_width = two_sided_z(level) * self.se;
        ((self.log_rr - half_width).exp(), (self.log_rr + half_width).exp())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolingMethod {
    FixedEffect,
    RandomEffects,
}

impl fmt::Display for PoolingMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FixedEffect => write!(f, "fixed effect"),
            Self::RandomEffects => write!(f, "random effects (DerSimonian-Laird)"),
        }
    }
}

/// Between-study heterogeneity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Heterogeneity {
    /// Cochran's Q from fixed-effect weights.
    pub q: f64,
    pub df: usize,
    /// Upper-tail chi-squared p-value of `q`.
    pub p_value: f64,
    /// Share of variability due to heterogeneity, in `[0, 1]`.
    pub i_squared: f64,
    /// Zero for the fixed-effect method.
    pub tau_squared: f64,
}

/// Pooled log risk ratio with study weights.
#[derive(Debug, Clone, PartialEq)]
pub struct PooledEstimate {
    pub method: PoolingMethod,
    pub log_rr: f64,
    pub se: f64,
    /// Interval bounds on the log scale.
    pub lower: f64,
    pub upper: f64,
    pub level: f64,
    pub heterogeneity: Heterogeneity,
    /// Normalized weights in input order.
    pub weights: Vec<(String, f64)>,
    /// The pooled studies, in input order.
    pub studies: Vec<StudyEstimate>,
}

impl PooledEstimate {
    #[must_use]
    pub fn risk_ratio(&self) -> f64 {
        self.log_rr.exp()
    }

    /// Interval on the risk-ratio scale.
    #[must_use]
    pub fn risk_ratio_interval(&self) -> (f64, f64) {
        (self.lower.exp(), self.upper.exp())
    }

    /// Normal-approximation probability that the pooled risk ratio is below 1.
    #[must_use]
    pub fn probability_of_benefit(&self) -> f64 {
        standard_normal_cdf(-self.log_rr / self.se)
    }
}

/// Inverse-variance fixed-effect pooling.
///
/// # Errors
///
/// Returns `MetaAnalysisError` for fewer than two studies or invalid inputs.
pub fn fixed_effect(studies: &[StudyEstimate], level: f64) -> Result<PooledEstimate, MetaAnalysisError> {
    validate(studies, level)?;
    let weights = inverse_variance_weights(studies, 0.0);
    let heterogeneity = heterogeneity(studies, &weights, 0.0);
    Ok(pool(studies, &weights, level, PoolingMethod::FixedEffect, heterogeneity))
}

/// DerSimonian-Laird random-effects pooling.
///
/// # Errors
///
/// Returns `MetaAnalysisError` for fewer than two studies or invalid inputs.
pub fn random_effects(studies: &[StudyEstimate], level: f64) -> Result<PooledEstimate, MetaAnalysisError> {
    validate(studies, level)?;
    let fixed_weights = inverse_variance_weights(studies, 0.0);
    let total = fixed_weights.iter().sum::<f64>();
    let squared = fixed_weights.iter().map(|weight| weight * weight).sum::<f64>();
    let scaling = total - squared / total;

    let mut heterogeneity = heterogeneity(studies, &fixed_weights, 0.0);
    let tau_squared = if scaling > 0.0 {
        ((heterogeneity.q - usize_to_f64(heterogeneity.df)) / scaling).max(0.0)
    } else {
        0.0
    };
    heterogeneity.tau_squared = tau_squared;

    let weights = inverse_variance_weights(studies, tau_squared);
    Ok(pool(studies, &weights, level, PoolingMethod::RandomEffects, heterogeneity))
}

/// One row per study with [`STUDY_COLUMN`], [`ESTIMATE_COLUMN`], and
/// [`STANDARD_ERROR_COLUMN`].
#[must_use]
pub fn study_summary_dataset(studies: &[StudyEstimate]) -> Dataset {
    Dataset::new()
        .with_categorical(
            STUDY_COLUMN,
            studies.iter().map(|study| Some(study.label.clone())).collect(),
        )
        .with_numeric(
            ESTIMATE_COLUMN,
            studies.iter().map(|study| study.log_rr).collect(),
        )
        .with_numeric(
            STANDARD_ERROR_COLUMN,
            studies.iter().map(|study| study.se).collect(),
        )
}

/// Known-SE Gaussian model over [`study_summary_dataset`].
///
/// The intercept is the pooled log risk ratio. With `random_effects`, the
/// study deviations get a grouping term whose standard deviation
/// (`sd_study__Intercept`) plays the role of tau.
#[must_use]
pub fn study_summary_spec(random_effects: bool, priors: PriorSet) -> ModelSpec {
    let spec = ModelSpec::new(
        ESTIMATE_COLUMN,
        Family::Gaussian {
            se_column: STANDARD_ERROR_COLUMN.to_string(),
        },
        Link::Identity,
    )
    .with_priors(priors);
    if random_effects {
        spec.with_grouping(GroupingTerm::intercept(STUDY_COLUMN))
    } else {
        spec
    }
}

fn validate(studies: &[StudyEstimate], level: f64) -> Result<(), MetaAnalysisError> {
    if studies.len() < 2 {
        return Err(MetaAnalysisError::TooFewStudies(studies.len()));
    }
    if !(level > 0.0 && level < 1.0) {
        return Err(MetaAnalysisError::InvalidLevel(level));
    }
    for study in studies {
        if !study.log_rr.is_finite() {
            return Err(MetaAnalysisError::NonFiniteEstimate {
                label: study.label.clone(),
            });
        }
        if !(study.se.is_finite() && study.se > 0.0) {
            return Err(MetaAnalysisError::InvalidStandardError {
                label: study.label.clone(),
                se: study.se,
            });
        }
    }
    Ok(())
}

fn inverse_variance_weights(studies: &[StudyEstimate], tau_squared: f64) -> Vec<f64> {
    studies
        .iter()
        .map(|study| 1.0 / study.se.mul_add(study.se, tau_squared))
        .collect()
}

fn weighted_mean(studies: &[StudyEstimate], weights: &[f64]) -> f64 {
    let total = weights.iter().sum::<f64>();
    studies
        .iter()
        .zip(weights.iter())
        .map(|(study, weight)| weight * study.log_rr)
        .sum::<f64>()
        / total
}

fn heterogeneity(studies: &[StudyEstimate], fixed_weights: &[f64], tau_squared: f64) -> Heterogeneity {
    let centre = weighted_mean(studies, fixed_weights);
    let q = studies
        .iter()
        .zip(fixed_weights.iter())
        .map(|(study, weight)| weight * (study.log_rr - centre) * (study.log_rr - centre))
        .sum::<f64>();
    let df = studies.len() - 1;
    let df_f64 = usize_to_f64(df);
    let p_value = ChiSquared::new(df_f64).map_or(f64::NAN, |distribution| distribution.sf(q));
    let i_squared = if q > df_f64 { (q - df_f64) / q } else { 0.0 };
    Heterogeneity {
        q,
        df,
        p_value,
        i_squared,
        tau_squared,
    }
}

fn pool(
    studies: &[StudyEstimate],
    weights: &[f64],
    level: f64,
    method: PoolingMethod,
    heterogeneity: Heterogeneity,
) -> PooledEstimate {
    let total = weights.iter().sum::<f64>();
    let log_rr = weighted_mean(studies, weights);
    let se = total.recip().sqrt();
    let z = two_sided_z(level);
    PooledEstimate {
        method,
        log_rr,
        se,
        lower: z.mul_add(-se, log_rr),
        upper: z.mul_add(se, log_rr),
        level,
        heterogeneity,
        weights: studies
            .iter()
            .zip(weights.iter())
            .map(|(study, weight)| (study.label.clone(), weight / total))
            .collect(),
        studies: studies.to_vec(),
    }
}
