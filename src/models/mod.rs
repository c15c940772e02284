//! # Models
//!
//! Bayesian hierarchical regression for pooled trial data, plus the shared
//! tooling that turns posterior draws into reportable effects: summaries,
//! subgroup strata, the analytic probability-of-benefit shortcut, and
//! study-level meta-analysis.

pub mod benefit;
pub mod effects;
pub mod glmm;
pub mod meta;
pub mod report;
pub mod strata;
