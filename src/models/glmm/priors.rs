//! Prior specifications, log-densities, and prior-predictive summaries.

use std::collections::BTreeMap;
use std::f64::consts::PI;
use std::fmt;

use rand::rngs::StdRng;
use rand::{RngExt, SeedableRng};
use statrs::distribution::{ContinuousCDF, StudentsT};
use statrs::function::gamma::ln_gamma;
use thiserror::Error;

use crate::utils::{percentile, sorted_copy, standard_normal_cdf, standard_normal_quantile, usize_to_f64};

/// Errors raised when constructing or sampling a prior.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum PriorError {
    #[error("{family} prior takes {expected} parameters; found {found}")]
    ParameterCount {
        family: PriorFamily,
        expected: usize,
        found: usize,
    },
    #[error("{family} prior parameter `{name}` must be positive; found {value}")]
    NonPositiveParameter {
        family: PriorFamily,
        name: &'static str,
        value: f64,
    },
    #[error("{family} prior parameters must be finite")]
    NonFiniteParameter { family: PriorFamily },
    #[error("{family} prior cannot be attached to {target}")]
    UnsupportedTarget {
        family: PriorFamily,
        target: PriorTarget,
    },
    #[error("prior-predictive summaries need at least one draw")]
    InvalidSampleCount,
    #[error("sensitivity prior anchor risk ratio must be positive and not 1; found {0}")]
    InvalidAnchor(f64),
}

/// Distribution family of a prior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriorFamily {
    /// `Normal(location, scale)`.
    Normal,
    /// `Cauchy(location, scale)`.
    Cauchy,
    /// `StudentT(df, location, scale)`.
    StudentT,
    /// `Exponential(rate)`; group standard deviations only.
    Exponential,
}

impl PriorFamily {
    /// Parameter names in the order `Prior::new` expects them.
    #[must_use]
    pub const fn parameter_names(self) -> &'static [&'static str] {
        match self {
            Self::Normal | Self::Cauchy => &["location", "scale"],
            Self::StudentT => &["df", "location", "scale"],
            Self::Exponential => &["rate"],
        }
    }

    const fn positive_parameters(self) -> &'static [usize] {
        match self {
            Self::Normal | Self::Cauchy => &[1],
            Self::StudentT => &[0, 2],
            Self::Exponential => &[0],
        }
    }
}

impl fmt::Display for PriorFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Normal => write!(f, "normal"),
            Self::Cauchy => write!(f, "cauchy"),
            Self::StudentT => write!(f, "student_t"),
            Self::Exponential => write!(f, "exponential"),
        }
    }
}

/// Parameter class a prior is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriorTarget {
    FixedEffect,
    Intercept,
    /// Group-level standard deviation; symmetric families are truncated at zero.
    GroupStdDev,
}

impl fmt::Display for PriorTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FixedEffect => write!(f, "a fixed effect"),
            Self::Intercept => write!(f, "the intercept"),
            Self::GroupStdDev => write!(f, "a group standard deviation"),
        }
    }
}

/// An immutable prior distribution.
#[derive(Debug, Clone, PartialEq)]
pub struct Prior {
    family: PriorFamily,
    params: Vec<f64>,
    applies_to: PriorTarget,
}

impl Prior {
    /// Build a prior, checking parameter count and positivity.
    ///
    /// # Errors
    ///
    /// Returns `PriorError` if parameters are malformed for `family` or the
    /// family cannot describe `applies_to`.
    pub fn new(family: PriorFamily, params: &[f64], applies_to: PriorTarget) -> Result<Self, PriorError> {
        let expected = family.parameter_names().len();
        if params.len() != expected {
            return Err(PriorError::ParameterCount {
                family,
                expected,
                found: params.len(),
            });
        }
        if params.iter().any(|value| !value.is_finite()) {
            return Err(PriorError::NonFiniteParameter { family });
        }
        for index in family.positive_parameters().iter().copied() {
            if params[index] <= 0.0 {
                return Err(PriorError::NonPositiveParameter {
                    family,
                    name: family.parameter_names()[index],
                    value: params[index],
                });
            }
        }
        if family == PriorFamily::Exponential && applies_to != PriorTarget::GroupStdDev {
            return Err(PriorError::UnsupportedTarget {
                family,
                target: applies_to,
            });
        }
        Ok(Self::known(family, params, applies_to))
    }

    /// # Errors
    ///
    /// Returns `PriorError` if `scale` is not positive.
    pub fn normal(location: f64, scale: f64, applies_to: PriorTarget) -> Result<Self, PriorError> {
        Self::new(PriorFamily::Normal, &[location, scale], applies_to)
    }

    /// # Errors
    ///
    /// Returns `PriorError` if `scale` is not positive.
    pub fn cauchy(location: f64, scale: f64, applies_to: PriorTarget) -> Result<Self, PriorError> {
        Self::new(PriorFamily::Cauchy, &[location, scale], applies_to)
    }

    /// # Errors
    ///
    /// Returns `PriorError` if `df` or `scale` is not positive.
    pub fn student_t(
        df: f64,
        location: f64,
        scale: f64,
        applies_to: PriorTarget,
    ) -> Result<Self, PriorError> {
        Self::new(PriorFamily::StudentT, &[df, location, scale], applies_to)
    }

    /// Construct from constants that are valid by inspection.
    fn known(family: PriorFamily, params: &[f64], applies_to: PriorTarget) -> Self {
        Self {
            family,
            params: params.to_vec(),
            applies_to,
        }
    }

    /// Retarget a copy of this prior, re-running validation.
    ///
    /// # Errors
    ///
    /// Returns `PriorError` if the family cannot describe `applies_to`.
    pub fn for_target(&self, applies_to: PriorTarget) -> Result<Self, PriorError> {
        Self::new(self.family, &self.params, applies_to)
    }

    #[must_use]
    pub const fn family(&self) -> PriorFamily {
        self.family
    }

    #[must_use]
    pub fn params(&self) -> &[f64] {
        &self.params
    }

    #[must_use]
    pub const fn applies_to(&self) -> PriorTarget {
        self.applies_to
    }

    /// Whether the prior is truncated to the positive half-line.
    #[must_use]
    pub fn is_half(&self) -> bool {
        self.applies_to == PriorTarget::GroupStdDev && self.family != PriorFamily::Exponential
    }

    /// Log-density at `value`, including truncation for group standard deviations.
    #[must_use]
    pub fn log_density(&self, value: f64) -> f64 {
        if !value.is_finite() {
            return f64::NEG_INFINITY;
        }
        if self.applies_to == PriorTarget::GroupStdDev && value <= 0.0 {
            return f64::NEG_INFINITY;
        }
        let untruncated = self.untruncated_log_density(value);
        if self.is_half() {
            untruncated - (1.0 - self.untruncated_cdf(0.0)).max(f64::MIN_POSITIVE).ln()
        } else {
            untruncated
        }
    }

    fn untruncated_log_density(&self, value: f64) -> f64 {
        match self.family {
            PriorFamily::Normal => {
                let (location, scale) = (self.params[0], self.params[1]);
                let z = (value - location) / scale;
                -0.5 * z.mul_add(z, std::f64::consts::TAU.ln()) - scale.ln()
            }
            PriorFamily::Cauchy => {
                let (location, scale) = (self.params[0], self.params[1]);
                let z = (value - location) / scale;
                -(PI * scale * z.mul_add(z, 1.0)).ln()
            }
            PriorFamily::StudentT => {
                let (df, location, scale) = (self.params[0], self.params[1], self.params[2]);
                let z = (value - location) / scale;
                ln_gamma(0.5 * (df + 1.0))
                    - ln_gamma(0.5 * df)
                    - 0.5 * (df * PI).ln()
                    - scale.ln()
                    - 0.5 * (df + 1.0) * (z * z / df).ln_1p()
            }
            PriorFamily::Exponential => {
                let rate = self.params[0];
                if value < 0.0 {
                    f64::NEG_INFINITY
                } else {
                    rate.ln() - rate * value
                }
            }
        }
    }

    fn untruncated_cdf(&self, value: f64) -> f64 {
        match self.family {
            PriorFamily::Normal => standard_normal_cdf((value - self.params[0]) / self.params[1]),
            PriorFamily::Cauchy => {
                0.5 + ((value - self.params[0]) / self.params[1]).atan() / PI
            }
            PriorFamily::StudentT => StudentsT::new(0.0, 1.0, self.params[0]).map_or(0.5, |dist| {
                dist.cdf((value - self.params[1]) / self.params[2])
            }),
            PriorFamily::Exponential => {
                if value <= 0.0 {
                    0.0
                } else {
                    -(-self.params[0] * value).exp_m1()
                }
            }
        }
    }

    fn untruncated_quantile(&self, probability: f64) -> Result<f64, PriorError> {
        Ok(match self.family {
            PriorFamily::Normal => {
                self.params[1].mul_add(standard_normal_quantile(probability), self.params[0])
            }
            PriorFamily::Cauchy => {
                self.params[1].mul_add((PI * (probability - 0.5)).tan(), self.params[0])
            }
            PriorFamily::StudentT => {
                let dist = StudentsT::new(0.0, 1.0, self.params[0]).map_err(|_| {
                    PriorError::NonPositiveParameter {
                        family: self.family,
                        name: "df",
                        value: self.params[0],
                    }
                })?;
                self.params[2].mul_add(dist.inverse_cdf(probability), self.params[1])
            }
            PriorFamily::Exponential => -(-probability).ln_1p() / self.params[0],
        })
    }

    /// Inverse-CDF draw from a uniform variate in `(0, 1)`.
    fn quantile(&self, probability: f64) -> Result<f64, PriorError> {
        if self.is_half() {
            let floor = self.untruncated_cdf(0.0);
            self.untruncated_quantile(probability.mul_add(1.0 - floor, floor))
        } else {
            self.untruncated_quantile(probability)
        }
    }

    /// Draw `n` values from the prior with a seeded generator.
    ///
    /// # Errors
    ///
    /// Returns `PriorError` if the quantile function cannot be evaluated.
    pub fn sample(&self, n: usize, seed: u64) -> Result<Vec<f64>, PriorError> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n)
            .map(|_| {
                let uniform = rng
                    .random::<f64>()
                    .clamp(f64::EPSILON, 1.0 - f64::EPSILON);
                self.quantile(uniform)
            })
            .collect()
    }
}

impl fmt::Display for Prior {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let params = self
            .params
            .iter()
            .map(|value| format!("{value}"))
            .collect::<Vec<_>>()
            .join(", ");
        write!(f, "{}({params})", self.family)
    }
}

/// Sample summary of a prior pushed through a transform.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriorPredictiveSummary {
    pub n_samples: usize,
    pub mean: f64,
    pub q025: f64,
    pub q50: f64,
    pub q975: f64,
    /// Share of transformed draws strictly above 1 (prior probability of harm
    /// when the coefficient is a log risk ratio).
    pub prob_above_one: f64,
}

/// Draw `n_samples` prior values, apply `transform`, and summarize.
///
/// Typical use is `f64::exp` to read a log-risk-ratio prior on the risk-ratio
/// scale.
///
/// # Errors
///
/// Returns `PriorError::InvalidSampleCount` for `n_samples == 0`.
pub fn prior_predictive_summary<F>(
    prior: &Prior,
    n_samples: usize,
    seed: u64,
    transform: F,
) -> Result<PriorPredictiveSummary, PriorError>
where
    F: Fn(f64) -> f64,
{
    if n_samples == 0 {
        return Err(PriorError::InvalidSampleCount);
    }
    let transformed = prior
        .sample(n_samples, seed)?
        .into_iter()
        .map(transform)
        .collect::<Vec<_>>();
    let n = usize_to_f64(transformed.len());
    let mean = transformed.iter().sum::<f64>() / n;
    let above_one = transformed.iter().filter(|value| **value > 1.0).count();
    let sorted = sorted_copy(&transformed);

    Ok(PriorPredictiveSummary {
        n_samples,
        mean,
        q025: percentile(&sorted, 0.025),
        q50: percentile(&sorted, 0.5),
        q975: percentile(&sorted, 0.975),
        prob_above_one: usize_to_f64(above_one) / n,
    })
}

/// Priors for every parameter class of a hierarchical model.
///
/// `by_term` keys are either a fixed-effect term label (applies to all its
/// coefficients, e.g. every indicator of a factor) or an exact coefficient
/// name; exact names win.
#[derive(Debug, Clone, PartialEq)]
pub struct PriorSet {
    pub intercept: Prior,
    pub fixed_default: Prior,
    pub group_sd: Prior,
    pub by_term: BTreeMap<String, Prior>,
}

impl Default for PriorSet {
    fn default() -> Self {
        Self {
            intercept: Prior::known(PriorFamily::StudentT, &[3.0, 0.0, 2.5], PriorTarget::Intercept),
            fixed_default: Prior::known(PriorFamily::Normal, &[0.0, 1.0], PriorTarget::FixedEffect),
            group_sd: Prior::known(
                PriorFamily::StudentT,
                &[3.0, 0.0, 2.5],
                PriorTarget::GroupStdDev,
            ),
            by_term: BTreeMap::new(),
        }
    }
}

impl PriorSet {
    /// Attach a prior to a term label or coefficient name.
    #[must_use]
    pub fn with_term(mut self, term: impl Into<String>, prior: Prior) -> Self {
        self.by_term.insert(term.into(), prior);
        self
    }

    /// Prior for `coefficient`, which was expanded from the term `term_label`.
    #[must_use]
    pub fn fixed_prior(&self, coefficient: &str, term_label: &str) -> &Prior {
        self.by_term
            .get(coefficient)
            .or_else(|| self.by_term.get(term_label))
            .unwrap_or(&self.fixed_default)
    }
}

/// The four prior archetypes used for sensitivity analyses of a treatment effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PriorArchetype {
    /// Weakly informative, centred on no effect.
    Neutral,
    /// Centred on the anchor benefit.
    Optimistic,
    /// Centred on no effect with little spread.
    Skeptical,
    /// Centred on harm of the same magnitude as the anchor benefit.
    Pessimistic,
}

impl PriorArchetype {
    pub const ALL: [Self; 4] = [
        Self::Neutral,
        Self::Optimistic,
        Self::Skeptical,
        Self::Pessimistic,
    ];
}

impl fmt::Display for PriorArchetype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Neutral => write!(f, "neutral"),
            Self::Optimistic => write!(f, "optimistic"),
            Self::Skeptical => write!(f, "skeptical"),
            Self::Pessimistic => write!(f, "pessimistic"),
        }
    }
}

/// Location/scale settings generating the archetype priors on a log risk ratio.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensitivityPriors {
    /// Risk ratio the optimistic prior is centred on; its reciprocal centres
    /// the pessimistic prior.
    pub anchor_risk_ratio: f64,
    /// Scale of the optimistic, skeptical, and pessimistic priors.
    pub informative_scale: f64,
    /// Scale of the neutral prior.
    pub neutral_scale: f64,
}

impl Default for SensitivityPriors {
    fn default() -> Self {
        Self {
            anchor_risk_ratio: 0.85,
            informative_scale: 0.1,
            neutral_scale: 1.0,
        }
    }
}

impl SensitivityPriors {
    /// Normal prior on the log risk ratio for `archetype`.
    ///
    /// # Errors
    ///
    /// Returns `PriorError` for a non-positive anchor, an anchor of exactly 1,
    /// or non-positive scales.
    pub fn prior(&self, archetype: PriorArchetype) -> Result<Prior, PriorError> {
        if !(self.anchor_risk_ratio > 0.0 && self.anchor_risk_ratio.is_finite())
            || self.anchor_risk_ratio == 1.0
        {
            return Err(PriorError::InvalidAnchor(self.anchor_risk_ratio));
        }
        let anchor = self.anchor_risk_ratio.ln();
        let (location, scale) = match archetype {
            PriorArchetype::Neutral => (0.0, self.neutral_scale),
            PriorArchetype::Optimistic => (anchor, self.informative_scale),
            PriorArchetype::Skeptical => (0.0, self.informative_scale),
            PriorArchetype::Pessimistic => (-anchor, self.informative_scale),
        };
        Prior::normal(location, scale, PriorTarget::FixedEffect)
    }

    /// All four archetype priors in `PriorArchetype::ALL` order.
    ///
    /// # Errors
    ///
    /// Returns the first `PriorError` encountered.
    pub fn all(&self) -> Result<Vec<(PriorArchetype, Prior)>, PriorError> {
        PriorArchetype::ALL
            .iter()
            .map(|archetype| Ok((*archetype, self.prior(*archetype)?)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn rejects_non_positive_scale() {
        let err = Prior::normal(0.0, 0.0, PriorTarget::FixedEffect).expect_err("zero scale");
        assert!(matches!(
            err,
            PriorError::NonPositiveParameter { name: "scale", .. }
        ));
    }

    #[test]
    fn rejects_parameter_count_mismatch() {
        let err = Prior::new(PriorFamily::StudentT, &[0.0, 1.0], PriorTarget::FixedEffect)
            .expect_err("student-t needs three parameters");
        assert_eq!(
            err,
            PriorError::ParameterCount {
                family: PriorFamily::StudentT,
                expected: 3,
                found: 2
            }
        );
    }

    #[test]
    fn exponential_is_limited_to_group_sd() {
        assert!(Prior::new(PriorFamily::Exponential, &[1.0], PriorTarget::GroupStdDev).is_ok());
        assert!(matches!(
            Prior::new(PriorFamily::Exponential, &[1.0], PriorTarget::FixedEffect),
            Err(PriorError::UnsupportedTarget { .. })
        ));
    }

    #[test]
    fn normal_log_density_matches_closed_form() {
        let prior = Prior::normal(0.0, 1.0, PriorTarget::FixedEffect).expect("valid prior");
        assert_relative_eq!(
            prior.log_density(0.0),
            -0.5 * std::f64::consts::TAU.ln(),
            epsilon = 1.0e-12
        );
    }

    #[test]
    fn half_normal_density_doubles_the_normal_density() {
        let full = Prior::normal(0.0, 1.0, PriorTarget::FixedEffect).expect("valid");
        let half = full.for_target(PriorTarget::GroupStdDev).expect("valid");
        assert_relative_eq!(
            half.log_density(0.7),
            full.log_density(0.7) + std::f64::consts::LN_2,
            epsilon = 1.0e-10
        );
        assert!(half.log_density(-0.1).is_infinite());
    }

    #[test]
    fn student_t_density_with_one_df_equals_cauchy() {
        let student = Prior::student_t(1.0, 0.2, 1.5, PriorTarget::FixedEffect).expect("valid");
        let cauchy = Prior::cauchy(0.2, 1.5, PriorTarget::FixedEffect).expect("valid");
        assert_relative_eq!(
            student.log_density(0.9),
            cauchy.log_density(0.9),
            epsilon = 1.0e-10
        );
    }

    #[test]
    fn half_prior_draws_are_positive() {
        let prior = Prior::cauchy(0.0, 1.0, PriorTarget::GroupStdDev).expect("valid");
        let draws = prior.sample(500, 9).expect("draws");
        assert!(draws.iter().all(|value| *value > 0.0));
    }

    #[test]
    fn predictive_quantiles_are_ordered_for_every_family() {
        let priors = [
            Prior::normal(-0.1, 0.3, PriorTarget::FixedEffect),
            Prior::cauchy(0.0, 0.5, PriorTarget::FixedEffect),
            Prior::student_t(3.0, 0.0, 2.5, PriorTarget::FixedEffect),
            Prior::new(PriorFamily::Exponential, &[2.0], PriorTarget::GroupStdDev),
        ];
        for prior in priors {
            let prior = prior.expect("valid prior");
            let summary = prior_predictive_summary(&prior, 2_000, 11, f64::exp).expect("summary");
            assert!(summary.q025 <= summary.q50);
            assert!(summary.q50 <= summary.q975);
            assert!((0.0..=1.0).contains(&summary.prob_above_one));
        }
    }

    #[test]
    fn skeptical_prior_has_half_mass_above_one() {
        let prior = SensitivityPriors::default()
            .prior(PriorArchetype::Skeptical)
            .expect("valid");
        let summary = prior_predictive_summary(&prior, 20_000, 5, f64::exp).expect("summary");
        assert_relative_eq!(summary.q50, 1.0, epsilon = 0.01);
        assert_relative_eq!(summary.prob_above_one, 0.5, epsilon = 0.02);
    }

    #[test]
    fn optimistic_and_pessimistic_priors_mirror_each_other() {
        let settings = SensitivityPriors::default();
        let optimistic = settings.prior(PriorArchetype::Optimistic).expect("valid");
        let pessimistic = settings.prior(PriorArchetype::Pessimistic).expect("valid");
        assert_relative_eq!(optimistic.params()[0], -pessimistic.params()[0]);
        assert_relative_eq!(optimistic.params()[1], pessimistic.params()[1]);
        assert_eq!(settings.all().expect("valid").len(), 4);
    }

    #[test]
    fn predictive_summary_rejects_zero_samples() {
        let prior = Prior::normal(0.0, 1.0, PriorTarget::FixedEffect).expect("valid");
        assert_eq!(
            prior_predictive_summary(&prior, 0, 1, f64::exp),
            Err(PriorError::InvalidSampleCount)
        );
    }

    #[test]
    fn term_priors_override_defaults() {
        let treatment = Prior::normal(0.0, 0.1, PriorTarget::FixedEffect).expect("valid");
        let priors = PriorSet::default().with_term("treatment", treatment.clone());
        assert_eq!(priors.fixed_prior("treatment", "treatment"), &treatment);
        assert_eq!(priors.fixed_prior("age", "age"), &priors.fixed_default);
    }
}
