//! Reusable sampling schedule, proposal bookkeeping, and cancellation types.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use thiserror::Error;

/// Errors for sampling configuration.
#[derive(Debug, Error, Clone, Copy, PartialEq)]
pub enum InferenceError {
    #[error("at least one chain is required")]
    InvalidChainCount,
    #[error("iterations must be positive")]
    InvalidIterations,
    #[error("warmup ({warmup}) must be smaller than iterations ({iterations})")]
    InvalidWarmup { warmup: usize, iterations: usize },
    #[error("thinning interval must be positive")]
    InvalidThinning,
    #[error("seed stride must be positive")]
    InvalidSeedStride,
    #[error("adapt_delta must lie in (0, 1); found {0}")]
    InvalidAdaptDelta(f64),
    #[error("R-hat threshold must be finite and at least 1; found {0}")]
    InvalidRhatThreshold(f64),
    #[error("timeout must be non-zero")]
    InvalidTimeout,
    #[error("invalid proposal tuning configuration")]
    InvalidProposalTuning,
}

/// Sampling schedule shared by every engine.
///
/// `iterations` counts warmup plus retained iterations per chain, matching the
/// usual `iter`/`warmup` convention of Bayesian modelling front-ends.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingConfig {
    /// Number of independent chains.
    pub chains: usize,
    /// Warmup iterations discarded from every chain.
    pub warmup: usize,
    /// Total iterations per chain including warmup.
    pub iterations: usize,
    /// Keep every `thin`-th post-warmup draw.
    pub thin: usize,
    /// Base RNG seed.
    pub seed: u64,
    /// Chain `i` uses `seed + i * seed_stride` with wrapping arithmetic.
    pub seed_stride: u64,
    /// Target acceptance rate hint for the engine's step-size adaptation.
    pub adapt_delta: Option<f64>,
    /// Fits whose maximum split-R-hat exceeds this value are flagged unconverged.
    pub rhat_threshold: f64,
    /// Wall-clock budget for the whole fit.
    pub timeout: Option<Duration>,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            chains: 4,
            warmup: 1_000,
            iterations: 2_000,
            thin: 1,
            seed: 42,
            seed_stride: 10_000,
            adapt_delta: None,
            rhat_threshold: 1.05,
            timeout: None,
        }
    }
}

impl SamplingConfig {
    /// # Errors
    ///
    /// Returns `InferenceError` if schedule values are invalid.
    pub fn validate(&self) -> Result<(), InferenceError> {
        if self.chains == 0 {
            return Err(InferenceError::InvalidChainCount);
        }
        if self.iterations == 0 {
            return Err(InferenceError::InvalidIterations);
        }
        if self.warmup >= self.iterations {
            return Err(InferenceError::InvalidWarmup {
                warmup: self.warmup,
                iterations: self.iterations,
            });
        }
        if self.thin == 0 {
            return Err(InferenceError::InvalidThinning);
        }
        if self.seed_stride == 0 {
            return Err(InferenceError::InvalidSeedStride);
        }
        if let Some(delta) = self.adapt_delta
            && !(delta > 0.0 && delta < 1.0)
        {
            return Err(InferenceError::InvalidAdaptDelta(delta));
        }
        if !(self.rhat_threshold.is_finite() && self.rhat_threshold >= 1.0) {
            return Err(InferenceError::InvalidRhatThreshold(self.rhat_threshold));
        }
        if self.timeout.is_some_and(|timeout| timeout.is_zero()) {
            return Err(InferenceError::InvalidTimeout);
        }
        Ok(())
    }

    /// Retained draws per chain implied by `(iterations, warmup, thin)`.
    #[must_use]
    pub const fn draws_per_chain(&self) -> usize {
        (self.iterations - self.warmup).div_ceil(self.thin)
    }

    /// Seed for chain `chain_index`.
    #[must_use]
    pub fn chain_seed(&self, chain_index: usize) -> u64 {
        let index_u64 = u64::try_from(chain_index).unwrap_or(u64::MAX);
        self.seed
            .wrapping_add(index_u64.wrapping_mul(self.seed_stride))
    }
}

/// Random-walk proposal adaptation controls.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProposalTuning {
    /// Smallest proposal scale allowed after adaptation.
    pub min_scale: f64,
    /// Largest proposal scale allowed after adaptation.
    pub max_scale: f64,
    /// Initial random-walk scale for log group standard deviations.
    pub log_sd_scale: f64,
    /// Adapt every `adaptation_interval` warmup iterations.
    pub adaptation_interval: usize,
    /// Acceptance rate targeted when `adapt_delta` is not set.
    pub acceptance_target: f64,
    /// Half-width of the tolerated band around the target.
    pub acceptance_tolerance: f64,
    /// Multiplicative scale decrease when acceptance is below the band.
    pub scale_decrease_factor: f64,
    /// Multiplicative scale increase when acceptance is above the band.
    pub scale_increase_factor: f64,
}

impl Default for ProposalTuning {
    fn default() -> Self {
        Self {
            min_scale: 1.0e-4,
            max_scale: 10.0,
            log_sd_scale: 0.2,
            adaptation_interval: 50,
            acceptance_target: 0.44,
            acceptance_tolerance: 0.1,
            scale_decrease_factor: 0.8,
            scale_increase_factor: 1.25,
        }
    }
}

impl ProposalTuning {
    /// # Errors
    ///
    /// Returns `InferenceError::InvalidProposalTuning` if values are inconsistent.
    pub fn validate(&self) -> Result<(), InferenceError> {
        let valid = self.min_scale > 0.0
            && self.max_scale > self.min_scale
            && self.log_sd_scale > 0.0
            && self.adaptation_interval > 0
            && self.acceptance_target > 0.0
            && self.acceptance_target < 1.0
            && self.acceptance_tolerance >= 0.0
            && self.scale_decrease_factor > 0.0
            && self.scale_decrease_factor < 1.0
            && self.scale_increase_factor > 1.0;
        if valid {
            Ok(())
        } else {
            Err(InferenceError::InvalidProposalTuning)
        }
    }

    /// Multiplicative adjustment for a block with the given acceptance rate.
    #[must_use]
    pub fn adaptation_factor(&self, acceptance: f64, target: f64) -> f64 {
        if acceptance < target - self.acceptance_tolerance {
            self.scale_decrease_factor
        } else if acceptance > target + self.acceptance_tolerance {
            self.scale_increase_factor
        } else {
            1.0
        }
    }

    /// Apply one adaptation step to `scale`.
    #[must_use]
    pub fn adapt(&self, scale: f64, acceptance: f64, target: f64) -> f64 {
        (scale * self.adaptation_factor(acceptance, target)).clamp(self.min_scale, self.max_scale)
    }
}

/// Proposal counters for a single Metropolis-Hastings block.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProposalStats {
    pub proposed: usize,
    pub accepted: usize,
}

impl ProposalStats {
    /// Record one proposal and whether it was accepted.
    pub const fn record(&mut self, accepted: bool) {
        self.proposed += 1;
        if accepted {
            self.accepted += 1;
        }
    }

    /// Fold another block's counters into this one.
    pub const fn merge(&mut self, other: Self) {
        self.proposed += other.proposed;
        self.accepted += other.accepted;
    }

    /// Acceptance rate in `[0, 1]`, or `0` if no proposals were made.
    #[must_use]
    pub fn acceptance_rate(self) -> f64 {
        if self.proposed == 0 {
            0.0
        } else {
            usize_to_f64(self.accepted) / usize_to_f64(self.proposed)
        }
    }
}

/// Shared flag used to abort an in-flight fit.
///
/// Clones observe the same flag, so a caller can keep one handle and pass
/// another to the fitter running on a different thread.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}

fn usize_to_f64(value: usize) -> f64 {
    f64::from(u32::try_from(value).unwrap_or(u32::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_validation_rejects_zero_iterations() {
        let config = SamplingConfig {
            iterations: 0,
            warmup: 0,
            ..SamplingConfig::default()
        };
        assert_eq!(config.validate(), Err(InferenceError::InvalidIterations));
    }

    #[test]
    fn config_validation_rejects_warmup_past_iterations() {
        let config = SamplingConfig {
            iterations: 100,
            warmup: 100,
            ..SamplingConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(InferenceError::InvalidWarmup {
                warmup: 100,
                iterations: 100
            })
        );
    }

    #[test]
    fn config_validation_rejects_out_of_range_adapt_delta() {
        let config = SamplingConfig {
            adapt_delta: Some(1.0),
            ..SamplingConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(InferenceError::InvalidAdaptDelta(1.0))
        );
    }

    #[test]
    fn draws_per_chain_rounds_up_partial_thinning_windows() {
        let config = SamplingConfig {
            iterations: 81,
            warmup: 20,
            thin: 4,
            ..SamplingConfig::default()
        };
        assert_eq!(config.draws_per_chain(), 16);
    }

    #[test]
    fn chain_seeds_follow_stride() {
        let config = SamplingConfig {
            seed: 7,
            seed_stride: 100,
            ..SamplingConfig::default()
        };
        assert_eq!(config.chain_seed(0), 7);
        assert_eq!(config.chain_seed(3), 307);
    }

    #[test]
    fn proposal_stats_tracks_acceptance() {
        let mut stats = ProposalStats::default();
        stats.record(true);
        stats.record(false);
        assert!((stats.acceptance_rate() - 0.5).abs() < 1.0e-12);
    }

    #[test]
    fn tuning_shrinks_scale_when_acceptance_is_low() {
        let tuning = ProposalTuning::default();
        assert!(tuning.validate().is_ok());
        let scale = tuning.adapt(1.0, 0.05, 0.44);
        assert!(scale < 1.0);
        let scale = tuning.adapt(1.0, 0.9, 0.44);
        assert!(scale > 1.0);
    }

    #[test]
    fn cancellation_is_shared_between_clones() {
        let token = CancellationToken::new();
        let handle = token.clone();
        assert!(!handle.is_cancelled());
        token.cancel();
        assert!(handle.is_cancelled());
    }
}
