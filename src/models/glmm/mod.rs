//! Bayesian hierarchical generalized linear models for pooled patient-level
//! trial data.
//!
//! A [`ModelSpec`] names the outcome, fixed-effect terms, grouping structure,
//! family/link, and priors. [`HierarchicalFitter`] validates it against a
//! [`Dataset`](crate::input::Dataset), runs independent chains through a
//! [`PosteriorEngine`], and returns pooled [`PosteriorSamples`] with a
//! [`ConvergenceSummary`].

pub mod design;
pub mod diagnostics;
pub mod likelihood;
pub mod metropolis;
pub mod posterior;
pub mod priors;
pub mod sampler;
pub mod spec;

pub use design::{CompiledDesign, DesignInfo, GroupDesign, INTERCEPT, compile_design};
pub use diagnostics::{
    ConvergenceSummary, ParameterConvergence, autocorrelation, effective_sample_size, split_rhat,
    summarize_convergence,
};
pub use likelihood::LikelihoodKind;
pub use metropolis::MetropolisEngine;
pub use posterior::{ParameterSummary, PosteriorError, PosteriorSamples, summarize_scalar};
pub use priors::{
    Prior, PriorArchetype, PriorError, PriorFamily, PriorPredictiveSummary, PriorSet,
    PriorTarget, SensitivityPriors, prior_predictive_summary,
};
pub use sampler::{
    AcceptanceRates, ChainControl, ChainError, ChainOutput, ChainReport, ChainRequest, FitError,
    FitResult, HierarchicalFitter, PosteriorEngine, fit, pool_fits,
};
pub use spec::{Family, GroupingTerm, Link, ModelSpec, ModelSpecError, Term};
