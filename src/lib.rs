#![forbid(unsafe_code)]

//! # `ipdma_effects`
//!
//! Bayesian hierarchical effect estimation for individual-patient-data
//! meta-analysis: log-binomial (risk-ratio) mixed models fitted across
//! trials, posterior effect summaries with quantile credible intervals and
//! directional probabilities, subgroup and risk-stratum effects built from
//! named coefficient combinations, and analytic probability of benefit from
//! published intervals.
//!
//! ```no_run
//! use ipdma_effects::{
//!     Dataset, GroupingTerm, HierarchicalFitter, ModelSpec, SamplingConfig, StratumCombination,
//!     combine, summarize_ratio,
//! };
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let data = Dataset::new()
//!     .with_numeric("death", vec![0.0, 1.0, 0.0, 1.0, 0.0, 0.0])
//!     .with_numeric("treatment", vec![0.0, 1.0, 1.0, 0.0, 1.0, 0.0])
//!     .with_categorical("trial", vec![Some("A"), Some("A"), Some("B"), Some("B"), Some("C"), Some("C")]);
//! let spec = ModelSpec::log_binomial("death")
//!     .with_variable("treatment")
//!     .with_grouping(GroupingTerm::intercept("trial"));
//!
//! let fit = HierarchicalFitter::new(SamplingConfig::default()).fit(&spec, &data)?;
//! let draws = combine(&fit.samples, &StratumCombination::single("treatment"))?;
//! let effect = summarize_ratio(&draws)?;
//! println!("RR {:.2}, P(benefit) {:.2}, converged {}", effect.point_estimate, effect.prob_benefit(), fit.converged());
//! # Ok(())
//! # }
//! ```

pub mod inference;
pub mod input;
pub mod models;
pub mod preprocess;
pub mod utils;

pub use inference::{CancellationToken, InferenceError, ProposalStats, ProposalTuning, SamplingConfig};
pub use input::{Column, Dataset, InputError};
pub use preprocess::{
    OutcomeDiagnostics, column_has_variation, outcome_diagnostics, quantile_cut_points,
    with_quantile_groups,
};

pub use models::glmm::{
    AcceptanceRates, ChainReport, ConvergenceSummary, DesignInfo, Family, FitError, FitResult,
    GroupingTerm, HierarchicalFitter, INTERCEPT, Link, MetropolisEngine, ModelSpec,
    ModelSpecError, ParameterConvergence, ParameterSummary, PosteriorEngine, PosteriorError,
    PosteriorSamples, Prior, PriorArchetype, PriorError, PriorFamily, PriorPredictiveSummary,
    PriorSet, PriorTarget, SensitivityPriors, Term, fit, pool_fits, prior_predictive_summary,
};

pub use models::effects::{
    DEFAULT_CREDIBLE_LEVEL, DirectionProbabilities, EffectError, EffectSummary,
    absolute_risk_summary, direction_probabilities, probability_below, summarize,
    summarize_ratio,
};

pub use models::strata::{
    StrataError, StratumCombination, binary_strata, combine, effect_at, factor_strata,
    probability_of_interaction, summarize_strata,
};

pub use models::benefit::{BoundsError, ImpliedLogNormal, probability_beyond, probability_of_benefit};

pub use models::meta::{
    Heterogeneity, MetaAnalysisError, PooledEstimate, PoolingMethod, StudyEstimate, fixed_effect,
    random_effects, study_summary_dataset, study_summary_spec,
};

pub use models::report::{render_convergence_table, render_effect_table, render_pooled_table};
