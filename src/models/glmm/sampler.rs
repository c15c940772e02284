//! Hierarchical fitter: validation, multi-chain orchestration, pooling, and
//! convergence reporting around a pluggable posterior engine.

use std::thread;
use std::time::{Duration, Instant};

use faer::Mat;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::inference::{CancellationToken, InferenceError, SamplingConfig};
use crate::input::Dataset;

use super::design::{CompiledDesign, DesignInfo, compile_design};
use super::diagnostics::{ConvergenceSummary, summarize_convergence};
use super::metropolis::MetropolisEngine;
use super::posterior::{PosteriorError, PosteriorSamples};
use super::spec::{Family, Link, ModelSpec, ModelSpecError};

/// Errors returned by `HierarchicalFitter`.
#[derive(Debug, Error)]
pub enum FitError {
    #[error(transparent)]
    InvalidConfig(#[from] InferenceError),
    #[error(transparent)]
    Specification(#[from] ModelSpecError),
    #[error(transparent)]
    Posterior(#[from] PosteriorError),
    #[error("sampler failed ({completed_chains} of {chains} chains completed): {message}")]
    SamplerFailure {
        completed_chains: usize,
        chains: usize,
        message: String,
    },
    #[error("fit was cancelled")]
    Cancelled,
    #[error("fit exceeded its {timeout:?} limit ({completed_chains} of {chains} chains completed)")]
    TimedOut {
        timeout: Duration,
        completed_chains: usize,
        chains: usize,
    },
}

/// Why a single chain stopped early.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChainError {
    #[error("chain was cancelled")]
    Cancelled,
    #[error("chain passed its deadline")]
    TimedOut,
    #[error("{0}")]
    Failed(String),
}

/// Schedule for one chain.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChainRequest {
    pub chain_index: usize,
    pub seed: u64,
    pub warmup: usize,
    /// Total iterations including warmup.
    pub iterations: usize,
    pub thin: usize,
    /// Acceptance target override for warmup adaptation.
    pub adapt_delta: Option<f64>,
}

impl ChainRequest {
    #[must_use]
    pub fn from_config(config: &SamplingConfig, chain_index: usize) -> Self {
        Self {
            chain_index,
            seed: config.chain_seed(chain_index),
            warmup: config.warmup,
            iterations: config.iterations,
            thin: config.thin,
            adapt_delta: config.adapt_delta,
        }
    }

    #[must_use]
    pub const fn retained_draws(&self) -> usize {
        self.iterations.saturating_sub(self.warmup).div_ceil(self.thin)
    }

    /// Whether iteration `iter` (0-based) is kept.
    #[must_use]
    pub const fn is_retained(&self, iter: usize) -> bool {
        iter >= self.warmup && (iter - self.warmup).is_multiple_of(self.thin)
    }
}

/// Stop conditions polled by an engine between iterations.
#[derive(Debug, Clone, Copy)]
pub struct ChainControl<'a> {
    cancel: &'a CancellationToken,
    abort: &'a CancellationToken,
    deadline: Option<Instant>,
}

impl<'a> ChainControl<'a> {
    #[must_use]
    pub const fn new(cancel: &'a CancellationToken, deadline: Option<Instant>) -> Self {
        Self {
            cancel,
            abort: cancel,
            deadline,
        }
    }

    /// # Errors
    ///
    /// Returns `ChainError::Cancelled` or `ChainError::TimedOut` when the chain
    /// must stop.
    pub fn checkpoint(&self) -> Result<(), ChainError> {
        if self.cancel.is_cancelled() || self.abort.is_cancelled() {
            return Err(ChainError::Cancelled);
        }
        if self.deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            return Err(ChainError::TimedOut);
        }
        Ok(())
    }
}

/// Acceptance rates of one chain, pooled over parameter blocks.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AcceptanceRates {
    pub fixed_effects: f64,
    pub group_effects: Option<f64>,
    pub group_sd: Option<f64>,
}

/// Retained draws of one chain in `design.info.column_names` order.
#[derive(Debug, Clone)]
pub struct ChainOutput {
    pub draws: Mat<f64>,
    pub acceptance: AcceptanceRates,
}

/// The sampling capability the fitter delegates to.
pub trait PosteriorEngine: Sync {
    fn name(&self) -> &'static str;

    fn supports(&self, family: &Family, link: Link) -> bool;

    /// Run one chain, polling `control` between iterations.
    ///
    /// # Errors
    ///
    /// Returns `ChainError` if the chain is stopped or cannot proceed.
    fn sample_chain(
        &self,
        design: &CompiledDesign,
        request: &ChainRequest,
        control: &ChainControl<'_>,
    ) -> Result<ChainOutput, ChainError>;
}

/// Per-chain bookkeeping kept with a fit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChainReport {
    pub chain_index: usize,
    pub seed: u64,
    pub retained_draws: usize,
    pub acceptance: AcceptanceRates,
}

/// Output of a completed fit.
#[derive(Debug, Clone)]
pub struct FitResult {
    /// Draws pooled chain by chain.
    pub samples: PosteriorSamples,
    pub chains: Vec<ChainReport>,
    pub diagnostics: ConvergenceSummary,
    pub design: DesignInfo,
    pub elapsed: Duration,
}

impl FitResult {
    #[must_use]
    pub const fn converged(&self) -> bool {
        self.diagnostics.converged
    }

    /// Draws of `name` from chain `chain` only.
    ///
    /// # Errors
    ///
    /// Returns `PosteriorError::UnknownColumn` if `name` is absent.
    pub fn chain_column(&self, name: &str, chain: usize) -> Result<Vec<f64>, PosteriorError> {
        let start = self
            .chains
            .iter()
            .take(chain)
            .map(|report| report.retained_draws)
            .sum::<usize>();
        let len = self.chains.get(chain).map_or(0, |report| report.retained_draws);
        self.samples.column_rows(name, start..start + len)
    }
}

/// Fits a `ModelSpec` to a dataset with a posterior engine.
#[derive(Debug, Clone, Default)]
pub struct HierarchicalFitter<E = MetropolisEngine> {
    engine: E,
    config: SamplingConfig,
}

impl HierarchicalFitter<MetropolisEngine> {
    /// Fitter using the built-in Metropolis engine.
    #[must_use]
    pub fn new(config: SamplingConfig) -> Self {
        Self {
            engine: MetropolisEngine::default(),
            config,
        }
    }
}

impl<E: PosteriorEngine> HierarchicalFitter<E> {
    #[must_use]
    pub const fn with_engine(engine: E, config: SamplingConfig) -> Self {
        Self { engine, config }
    }

    #[must_use]
    pub const fn config(&self) -> &SamplingConfig {
        &self.config
    }

    #[must_use]
    pub const fn engine(&self) -> &E {
        &self.engine
    }

    /// Fit without external cancellation.
    ///
    /// # Errors
    ///
    /// Returns `FitError` for invalid configuration or specification, sampler
    /// failure, or timeout.
    pub fn fit(&self, spec: &ModelSpec, dataset: &Dataset) -> Result<FitResult, FitError> {
        self.fit_with_cancellation(spec, dataset, &CancellationToken::new())
    }

    /// Fit, aborting all chains once `cancel` is triggered.
    ///
    /// Validation happens before any chain starts. A cancelled or timed-out fit
    /// never returns partial draws.
    ///
    /// # Errors
    ///
    /// Returns `FitError::Cancelled` if `cancel` fires before the chains
    /// finish, plus every error of [`HierarchicalFitter::fit`].
    pub fn fit_with_cancellation(
        &self,
        spec: &ModelSpec,
        dataset: &Dataset,
        cancel: &CancellationToken,
    ) -> Result<FitResult, FitError> {
        let config = self.config;
        config.validate()?;
        if !self.engine.supports(&spec.family, spec.link) {
            return Err(ModelSpecError::UnsupportedFamilyLink {
                family: spec.family.name().to_string(),
                link: spec.link,
            }
            .into());
        }
        let design = compile_design(spec, dataset)?;
        if cancel.is_cancelled() {
            return Err(FitError::Cancelled);
        }

        info!(
            engine = self.engine.name(),
            chains = config.chains,
            iterations = config.iterations,
            warmup = config.warmup,
            rows = design.n_rows(),
            columns = design.info.column_names.len(),
            "starting hierarchical fit"
        );

        let started = Instant::now();
        let deadline = config.timeout.map(|timeout| started + timeout);
        let outcomes = self.run_chains(&design, cancel, deadline);
        let completed_chains = outcomes.iter().filter(|(_, outcome)| outcome.is_ok()).count();

        if completed_chains < config.chains {
            return Err(self.interrupted(&outcomes, cancel, completed_chains));
        }

        let mut chains = Vec::with_capacity(config.chains);
        let mut parts = Vec::with_capacity(config.chains);
        for (request, outcome) in outcomes {
            let Ok(output) = outcome else {
                continue;
            };
            debug!(
                chain = request.chain_index,
                seed = request.seed,
                fixed_acceptance = output.acceptance.fixed_effects,
                group_acceptance = output.acceptance.group_effects,
                sd_acceptance = output.acceptance.group_sd,
                "chain finished"
            );
            chains.push(ChainReport {
                chain_index: request.chain_index,
                seed: request.seed,
                retained_draws: output.draws.nrows(),
                acceptance: output.acceptance,
            });
            parts.push(PosteriorSamples::new(
                design.info.column_names.clone(),
                output.draws,
            )?);
        }

        let samples = PosteriorSamples::stack(&parts.iter().collect::<Vec<_>>())?;
        let diagnostics = summarize_convergence(&parts, config.rhat_threshold);
        let elapsed = started.elapsed();

        if diagnostics.converged {
            info!(
                draws = samples.n_draws(),
                max_split_rhat = diagnostics.max_split_rhat,
                elapsed_ms = elapsed.as_millis(),
                "hierarchical fit finished"
            );
        } else {
            warn!(
                draws = samples.n_draws(),
                max_split_rhat = diagnostics.max_split_rhat,
                rhat_threshold = config.rhat_threshold,
                unconverged = ?diagnostics.unconverged_parameters(),
                "hierarchical fit did not converge"
            );
        }

        Ok(FitResult {
            samples,
            chains,
            diagnostics,
            design: design.info,
            elapsed,
        })
    }

    fn run_chains(
        &self,
        design: &CompiledDesign,
        cancel: &CancellationToken,
        deadline: Option<Instant>,
    ) -> Vec<(ChainRequest, Result<ChainOutput, ChainError>)> {
        let config = self.config;
        let engine = &self.engine;
        let abort = CancellationToken::new();

        thread::scope(|scope| {
            let handles = (0..config.chains)
                .map(|chain_index| {
                    let request = ChainRequest::from_config(&config, chain_index);
                    let control = ChainControl {
                        cancel,
                        abort: &abort,
                        deadline,
                    };
                    scope.spawn(move || {
                        let outcome = engine.sample_chain(design, &request, &control);
                        if outcome.is_err() {
                            // Stop sibling chains; their draws would be discarded anyway.
                            control.abort.cancel();
                        }
                        outcome
                    })
                })
                .collect::<Vec<_>>();

            handles
                .into_iter()
                .enumerate()
                .map(|(chain_index, handle)| {
                    let request = ChainRequest::from_config(&config, chain_index);
                    let outcome = handle.join().unwrap_or_else(|_| {
                        abort.cancel();
                        Err(ChainError::Failed(format!("chain {chain_index} panicked")))
                    });
                    (request, outcome)
                })
                .collect()
        })
    }

    fn interrupted(
        &self,
        outcomes: &[(ChainRequest, Result<ChainOutput, ChainError>)],
        cancel: &CancellationToken,
        completed_chains: usize,
    ) -> FitError {
        let chains = self.config.chains;
        if cancel.is_cancelled() {
            warn!(completed_chains, chains, "hierarchical fit cancelled");
            return FitError::Cancelled;
        }
        if outcomes
            .iter()
            .any(|(_, outcome)| matches!(outcome, Err(ChainError::TimedOut)))
        {
            let timeout = self.config.timeout.unwrap_or_default();
            warn!(completed_chains, chains, ?timeout, "hierarchical fit timed out");
            return FitError::TimedOut {
                timeout,
                completed_chains,
                chains,
            };
        }
        let message = outcomes
            .iter()
            .find_map(|(request, outcome)| match outcome {
                Err(ChainError::Failed(message)) => {
                    Some(format!("chain {}: {message}", request.chain_index))
                }
                _ => None,
            })
            .unwrap_or_else(|| "chains stopped without a reported cause".to_string());
        warn!(completed_chains, chains, %message, "sampler failure");
        FitError::SamplerFailure {
            completed_chains,
            chains,
            message,
        }
    }
}

/// Fit with the built-in engine.
///
/// # Errors
///
/// Returns `FitError` as described on [`HierarchicalFitter::fit`].
pub fn fit(spec: &ModelSpec, dataset: &Dataset, config: SamplingConfig) -> Result<FitResult, FitError> {
    HierarchicalFitter::new(config).fit(spec, dataset)
}

/// Stack posterior draws from fits of the same specification on multiply
/// imputed datasets.
///
/// This concatenates draws; it does not apply Rubin's rules.
///
/// # Errors
///
/// Returns `PosteriorError` if `fits` is empty or the fits have different columns.
pub fn pool_fits(fits: &[FitResult]) -> Result<PosteriorSamples, PosteriorError> {
    let unconverged = fits.iter().filter(|fit| !fit.converged()).count();
    if unconverged > 0 {
        warn!(unconverged, fits = fits.len(), "pooling fits that did not all converge");
    }
    PosteriorSamples::stack(&fits.iter().map(|fit| &fit.samples).collect::<Vec<_>>())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::glmm::spec::GroupingTerm;

    /// Engine returning draws that depend only on the chain seed.
    struct ConstantEngine {
        shift_per_chain: f64,
    }

    impl PosteriorEngine for ConstantEngine {
        fn name(&self) -> &'static str {
            "constant"
        }

        fn supports(&self, family: &Family, link: Link) -> bool {
            matches!((family, link), (Family::Binomial, Link::Log))
        }

        fn sample_chain(
            &self,
            design: &CompiledDesign,
            request: &ChainRequest,
            control: &ChainControl<'_>,
        ) -> Result<ChainOutput, ChainError> {
            control.checkpoint()?;
            let shift = self.shift_per_chain * crate::utils::usize_to_f64(request.chain_index);
            let draws = Mat::from_fn(
                request.retained_draws(),
                design.info.column_names.len(),
                |row, col| {
                    let wiggle = if row % 2 == 0 { -0.1 } else { 0.1 };
                    shift + wiggle + crate::utils::usize_to_f64(col)
                },
            );
            Ok(ChainOutput {
                draws,
                acceptance: AcceptanceRates::default(),
            })
        }
    }

    /// Engine that fails on chain 1.
    struct FailingEngine;

    impl PosteriorEngine for FailingEngine {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn supports(&self, _family: &Family, _link: Link) -> bool {
            true
        }

        fn sample_chain(
            &self,
            _design: &CompiledDesign,
            request: &ChainRequest,
            _control: &ChainControl<'_>,
        ) -> Result<ChainOutput, ChainError> {
            if request.chain_index == 1 {
                Err(ChainError::Failed("log-likelihood became non-finite".to_string()))
            } else {
                Err(ChainError::Cancelled)
            }
        }
    }

    /// Engine whose chain 0 finishes at once while the others poll `control`
    /// until they are stopped.
    struct StallingEngine;

    impl PosteriorEngine for StallingEngine {
        fn name(&self) -> &'static str {
            "stalling"
        }

        fn supports(&self, _family: &Family, _link: Link) -> bool {
            true
        }

        fn sample_chain(
            &self,
            design: &CompiledDesign,
            request: &ChainRequest,
            control: &ChainControl<'_>,
        ) -> Result<ChainOutput, ChainError> {
            if request.chain_index == 0 {
                return Ok(ChainOutput {
                    draws: Mat::zeros(request.retained_draws(), design.info.column_names.len()),
                    acceptance: AcceptanceRates::default(),
                });
            }
            for _ in 0..5_000 {
                control.checkpoint()?;
                thread::sleep(Duration::from_millis(1));
            }
            Err(ChainError::Failed("chain was never stopped".to_string()))
        }
    }

    fn dataset() -> Dataset {
        Dataset::new()
            .with_numeric("death", vec![0.0, 1.0, 0.0, 1.0, 0.0, 1.0])
            .with_numeric("treatment", vec![0.0, 1.0, 1.0, 0.0, 1.0, 0.0])
            .with_categorical(
                "trial",
                vec![Some("A"), Some("A"), Some("B"), Some("B"), Some("C"), Some("C")],
            )
    }

    fn spec() -> ModelSpec {
        ModelSpec::log_binomial("death")
            .with_variable("treatment")
            .with_grouping(GroupingTerm::intercept("trial"))
    }

    fn short_config() -> SamplingConfig {
        SamplingConfig {
            chains: 3,
            warmup: 10,
            iterations: 30,
            ..SamplingConfig::default()
        }
    }

    #[test]
    fn request_counts_retained_draws() {
        let request = ChainRequest::from_config(
            &SamplingConfig {
                warmup: 10,
                iterations: 31,
                thin: 5,
                ..SamplingConfig::default()
            },
            0,
        );
        assert_eq!(request.retained_draws(), 5);
        assert!(request.is_retained(10));
        assert!(!request.is_retained(11));
        assert!(request.is_retained(30));
    }

    #[test]
    fn pools_chains_in_order_with_named_columns() {
        let fitter = HierarchicalFitter::with_engine(
            ConstantEngine {
                shift_per_chain: 0.0,
            },
            short_config(),
        );
        let fit = fitter.fit(&spec(), &dataset()).expect("fit succeeds");
        assert_eq!(fit.samples.n_draws(), 60);
        assert_eq!(
            fit.samples.column_names(),
            ["Intercept", "treatment", "sd_trial__Intercept"]
        );
        assert_eq!(fit.chains.len(), 3);
        assert!(fit.converged());
        assert_eq!(fit.chain_column("treatment", 2).expect("column").len(), 20);
    }

    #[test]
    fn disagreeing_chains_are_flagged_not_rejected() {
        let fitter = HierarchicalFitter::with_engine(
            ConstantEngine {
                shift_per_chain: 3.0,
            },
            short_config(),
        );
        let fit = fitter.fit(&spec(), &dataset()).expect("fit still succeeds");
        assert!(!fit.converged());
        assert!(fit.diagnostics.max_split_rhat.is_some_and(|rhat| rhat > 1.05));
    }

    #[test]
    fn unsupported_family_is_a_specification_error() {
        let fitter = HierarchicalFitter::with_engine(
            ConstantEngine {
                shift_per_chain: 0.0,
            },
            short_config(),
        );
        let poisson = ModelSpec::new("death", Family::Poisson, Link::Log).with_variable("treatment");
        assert!(matches!(
            fitter.fit(&poisson, &dataset()),
            Err(FitError::Specification(
                ModelSpecError::UnsupportedFamilyLink { .. }
            ))
        ));
    }

    #[test]
    fn infinite_covariate_fails_before_sampling() {
        let fitter = HierarchicalFitter::with_engine(FailingEngine, short_config());
        let data = dataset().with_numeric("age", vec![61.0, f64::INFINITY, 55.0, 80.0, 67.0, 70.0]);
        assert!(matches!(
            fitter.fit(&spec().with_variable("age"), &data),
            Err(FitError::Specification(ModelSpecError::NonFiniteValue { row: 1, .. }))
        ));
    }

    #[test]
    fn invalid_config_fails_before_sampling() {
        let fitter = HierarchicalFitter::with_engine(
            FailingEngine,
            SamplingConfig {
                chains: 0,
                ..short_config()
            },
        );
        assert!(matches!(
            fitter.fit(&spec(), &dataset()),
            Err(FitError::InvalidConfig(InferenceError::InvalidChainCount))
        ));
    }

    #[test]
    fn pre_cancelled_fit_returns_cancelled() {
        let fitter = HierarchicalFitter::with_engine(
            ConstantEngine {
                shift_per_chain: 0.0,
            },
            short_config(),
        );
        let token = CancellationToken::new();
        token.cancel();
        assert!(matches!(
            fitter.fit_with_cancellation(&spec(), &dataset(), &token),
            Err(FitError::Cancelled)
        ));
    }

    #[test]
    fn cancelling_while_chains_run_returns_cancelled() {
        let fitter = HierarchicalFitter::with_engine(StallingEngine, short_config());
        let token = CancellationToken::new();
        let outcome = thread::scope(|scope| {
            let canceller = token.clone();
            scope.spawn(move || {
                thread::sleep(Duration::from_millis(30));
                canceller.cancel();
            });
            fitter.fit_with_cancellation(&spec(), &dataset(), &token)
        });
        assert!(matches!(outcome, Err(FitError::Cancelled)));
    }

    #[test]
    fn fit_level_timeout_reports_completed_chains() {
        let timeout = Duration::from_millis(40);
        let fitter = HierarchicalFitter::with_engine(
            StallingEngine,
            SamplingConfig {
                timeout: Some(timeout),
                ..short_config()
            },
        );
        match fitter.fit(&spec(), &dataset()) {
            Err(FitError::TimedOut {
                timeout: limit,
                completed_chains,
                chains,
            }) => {
                assert_eq!(limit, timeout);
                assert_eq!(completed_chains, 1);
                assert_eq!(chains, 3);
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[test]
    fn chain_failure_surfaces_engine_message() {
        let fitter = HierarchicalFitter::with_engine(FailingEngine, short_config());
        match fitter.fit(&spec(), &dataset()) {
            Err(FitError::SamplerFailure {
                completed_chains,
                chains,
                message,
            }) => {
                assert_eq!(completed_chains, 0);
                assert_eq!(chains, 3);
                assert!(message.contains("non-finite"));
            }
            other => panic!("expected sampler failure, got {other:?}"),
        }
    }

    #[test]
    fn pooling_requires_matching_columns() {
        let fitter = HierarchicalFitter::with_engine(
            ConstantEngine {
                shift_per_chain: 0.0,
            },
            short_config(),
        );
        let first = fitter.fit(&spec(), &dataset()).expect("fit");
        let second = fitter.fit(&spec(), &dataset()).expect("fit");
        let pooled = pool_fits(&[first.clone(), second]).expect("same columns");
        assert_eq!(pooled.n_draws(), 120);

        let fixed_only = fitter
            .fit(&ModelSpec::log_binomial("death").with_variable("treatment"), &dataset())
            .expect("fit");
        assert_eq!(
            pool_fits(&[first, fixed_only]).map(|_| ()),
            Err(PosteriorError::IncompatibleColumns)
        );
    }
}
