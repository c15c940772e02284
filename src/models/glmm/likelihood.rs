//! Row log-likelihoods for the supported family/link pairs.

use statrs::function::gamma::ln_gamma;

use super::spec::{Family, Link};

/// Family/link pairs with a row likelihood.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LikelihoodKind {
    /// Binomial outcome with log link (risk ratios).
    LogBinomial,
    /// Poisson counts with log link (rate ratios).
    LogPoisson,
    /// Normal outcome with known standard errors and identity link.
    GaussianIdentity,
}

impl LikelihoodKind {
    /// Resolve a family/link pair, or `None` if unsupported.
    #[must_use]
    pub fn resolve(family: &Family, link: Link) -> Option<Self> {
        match (family, link) {
            (Family::Binomial, Link::Log) => Some(Self::LogBinomial),
            (Family::Poisson, Link::Log) => Some(Self::LogPoisson),
            (Family::Gaussian { .. }, Link::Identity) => Some(Self::GaussianIdentity),
            _ => None,
        }
    }

    /// Log-likelihood of one row given its linear predictor.
    ///
    /// `standard_error` is only read by the Gaussian kind.
    #[must_use]
    pub fn row_log_likelihood(self, outcome: f64, eta: f64, standard_error: f64) -> f64 {
        match self {
            Self::LogBinomial => log_binomial_log_likelihood(outcome, eta),
            Self::LogPoisson => poisson_log_likelihood(outcome, eta),
            Self::GaussianIdentity => gaussian_log_likelihood(outcome, eta, standard_error),
        }
    }

    /// Mean on the outcome scale.
    #[must_use]
    pub fn mean(self, eta: f64) -> f64 {
        match self {
            Self::LogBinomial | Self::LogPoisson => eta.exp(),
            Self::GaussianIdentity => eta,
        }
    }

    /// IRLS working weight; log-binomial uses the Poisson working weight.
    #[must_use]
    pub fn working_weight(self, eta: f64, standard_error: f64) -> f64 {
        match self {
            Self::LogBinomial | Self::LogPoisson => eta.exp(),
            Self::GaussianIdentity => 1.0 / (standard_error * standard_error),
        }
    }

    /// Whether every linear predictor value keeps the likelihood finite.
    #[must_use]
    pub fn is_feasible(self, eta: f64) -> bool {
        match self {
            Self::LogBinomial => eta < 0.0,
            Self::LogPoisson | Self::GaussianIdentity => eta.is_finite(),
        }
    }
}

/// Bernoulli log-likelihood with `log(p) = eta`.
///
/// Infeasible (`-inf`) when `eta` puts the risk at or above 1.
#[must_use]
pub fn log_binomial_log_likelihood(outcome: f64, eta: f64) -> f64 {
    if !eta.is_finite() {
        return f64::NEG_INFINITY;
    }
    if outcome > 0.5 {
        if eta > 0.0 { f64::NEG_INFINITY } else { eta }
    } else if eta >= 0.0 {
        f64::NEG_INFINITY
    } else {
        (-eta.exp_m1()).ln()
    }
}

/// Poisson log-likelihood with `log(mu) = eta`.
#[must_use]
pub fn poisson_log_likelihood(outcome: f64, eta: f64) -> f64 {
    if !eta.is_finite() {
        return f64::NEG_INFINITY;
    }
    outcome.mul_add(eta, -eta.exp()) - ln_gamma(outcome + 1.0)
}

/// Normal log-likelihood with known standard error.
#[must_use]
pub fn gaussian_log_likelihood(outcome: f64, eta: f64, standard_error: f64) -> f64 {
    if !(eta.is_finite() && standard_error > 0.0) {
        return f64::NEG_INFINITY;
    }
    let z = (outcome - eta) / standard_error;
    -0.5 * z.mul_add(z, std::f64::consts::TAU.ln()) - standard_error.ln()
}
