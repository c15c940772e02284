//! MCMC convergence diagnostics.

use crate::utils::usize_to_f64;

use super::posterior::PosteriorSamples;

/// Lag-`k` autocorrelation for a scalar chain.
#[must_use]
pub fn autocorrelation(series: &[f64], lag: usize) -> f64 {
    if series.is_empty() || lag >= series.len() {
        return 0.0;
    }

    let n = series.len() - lag;
    let mean = series.iter().sum::<f64>() / usize_to_f64(series.len());

    let denominator = series
        .iter()
        .map(|value| (value - mean) * (value - mean))
        .sum::<f64>();
    if denominator <= 0.0 {
        return 0.0;
    }

    let numerator = (0..n)
        .map(|idx| (series[idx] - mean) * (series[idx + lag] - mean))
        .sum::<f64>();
    numerator / denominator
}

/// Effective sample size with truncation at the first non-positive autocorrelation.
#[must_use]
pub fn effective_sample_size(series: &[f64]) -> f64 {
    let n = series.len();
    if n < 2 {
        return usize_to_f64(n);
    }

    let mut rho_sum = 0.0;
    for lag in 1..n {
        let rho = autocorrelation(series, lag);
        if rho <= 0.0 {
            break;
        }
        rho_sum += rho;
    }

    usize_to_f64(n) / 2.0f64.mul_add(rho_sum, 1.0).max(1.0)
}

/// Split-R-hat for one scalar parameter.
///
/// Each chain is truncated to the shortest even length and split into halves,
/// so a single chain is also checked for drift. `None` when fewer than four
/// draws per chain are available.
#[must_use]
pub fn split_rhat(chains: &[Vec<f64>]) -> Option<f64> {
    let min_draws = chains.iter().map(Vec::len).min()?;
    let used = min_draws - (min_draws % 2);
    if used < 4 {
        return None;
    }
    let half = used / 2;
    let halves = chains
        .iter()
        .flat_map(|chain| [&chain[..half], &chain[half..used]])
        .collect::<Vec<_>>();
    Some(rhat_of_halves(&halves, half))
}

fn rhat_of_halves(halves: &[&[f64]], n: usize) -> f64 {
    let m = halves.len();
    let chain_means = halves
        .iter()
        .map(|half| half.iter().sum::<f64>() / usize_to_f64(n))
        .collect::<Vec<_>>();
    let within = halves
        .iter()
        .zip(chain_means.iter())
        .map(|(half, mean)| sample_variance(half, *mean))
        .sum::<f64>()
        / usize_to_f64(m);
    let mean_of_means = chain_means.iter().sum::<f64>() / usize_to_f64(m);
    let between = usize_to_f64(n)
        * chain_means
            .iter()
            .map(|mean| (mean - mean_of_means) * (mean - mean_of_means))
            .sum::<f64>()
        / usize_to_f64(m - 1);

    if !(within.is_finite() && between.is_finite()) {
        return f64::INFINITY;
    }
    if within <= 0.0 {
        // Frozen halves agree only if their means agree.
        return if between > 0.0 { f64::INFINITY } else { 1.0 };
    }

    let n_f64 = usize_to_f64(n);
    let var_plus = ((n_f64 - 1.0) / n_f64).mul_add(within, between / n_f64);
    (var_plus / within).sqrt().max(1.0)
}

fn sample_variance(values: &[f64], mean: f64) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    values
        .iter()
        .map(|value| (value - mean) * (value - mean))
        .sum::<f64>()
        / usize_to_f64(values.len() - 1)
}

/// Convergence statistics for one posterior column.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterConvergence {
    pub name: String,
    pub split_rhat: Option<f64>,
    /// Sum of per-chain effective sample sizes.
    pub ess: f64,
}

/// Convergence summary attached to every fit.
#[derive(Debug, Clone, PartialEq)]
pub struct ConvergenceSummary {
    pub chain_count: usize,
    pub draws_per_chain: usize,
    pub parameters: Vec<ParameterConvergence>,
    pub max_split_rhat: Option<f64>,
    pub min_ess: f64,
    pub rhat_threshold: f64,
    /// `true` when the maximum split-R-hat is available and within the threshold.
    pub converged: bool,
}

impl ConvergenceSummary {
    #[must_use]
    pub fn parameter(&self, name: &str) -> Option<&ParameterConvergence> {
        self.parameters.iter().find(|parameter| parameter.name == name)
    }

    /// Names whose split-R-hat exceeds the threshold or could not be computed.
    #[must_use]
    pub fn unconverged_parameters(&self) -> Vec<&str> {
        self.parameters
            .iter()
            .filter(|parameter| {
                parameter
                    .split_rhat
                    .is_none_or(|rhat| rhat > self.rhat_threshold)
            })
            .map(|parameter| parameter.name.as_str())
            .collect()
    }
}

/// Split-R-hat and ESS for every column shared by `chains`.
///
/// Columns are taken from the first chain; chains are expected to share them.
#[must_use]
pub fn summarize_convergence(chains: &[PosteriorSamples], rhat_threshold: f64) -> ConvergenceSummary {
    let names = chains
        .first()
        .map(|chain| chain.column_names().to_vec())
        .unwrap_or_default();
    let draws_per_chain = chains.iter().map(PosteriorSamples::n_draws).min().unwrap_or(0);

    let parameters = names
        .into_iter()
        .map(|name| {
            let series = chains
                .iter()
                .filter_map(|chain| chain.column(&name).ok())
                .collect::<Vec<_>>();
            ParameterConvergence {
                split_rhat: split_rhat(&series),
                ess: series.iter().map(|values| effective_sample_size(values)).sum(),
                name,
            }
        })
        .collect::<Vec<_>>();

    let max_split_rhat = if parameters.iter().all(|parameter| parameter.split_rhat.is_some()) {
        parameters
            .iter()
            .filter_map(|parameter| parameter.split_rhat)
            .max_by(f64::total_cmp)
    } else {
        None
    };
    let min_ess = parameters
        .iter()
        .map(|parameter| parameter.ess)
        .min_by(f64::total_cmp)
        .unwrap_or(0.0);

    ConvergenceSummary {
        chain_count: chains.len(),
        draws_per_chain,
        converged: max_split_rhat.is_some_and(|rhat| rhat <= rhat_threshold),
        parameters,
        max_split_rhat,
        min_ess,
        rhat_threshold,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn alternating(len: usize, offset: f64) -> Vec<f64> {
        (0..len)
            .map(|idx| if idx % 2 == 0 { offset - 1.0 } else { offset + 1.0 })
            .collect()
    }

    #[test]
    fn autocorrelation_of_alternating_series_is_negative() {
        let series = alternating(20, 0.0);
        assert!(autocorrelation(&series, 1) < -0.9);
        assert_relative_eq!(autocorrelation(&series, 25), 0.0);
    }

    #[test]
    fn ess_is_bounded_by_series_length() {
        let series = (0..50).map(|idx| usize_to_f64(idx).sin()).collect::<Vec<_>>();
        let ess = effective_sample_size(&series);
        assert!(ess > 0.0 && ess <= 50.0);
    }

    #[test]
    fn agreeing_chains_have_rhat_near_one() {
        let chains = vec![alternating(100, 0.0), alternating(100, 0.0)];
        let rhat = split_rhat(&chains).expect("enough draws");
        assert!(rhat < 1.01);
    }

    #[test]
    fn separated_chains_have_large_rhat() {
        let chains = vec![alternating(100, 0.0), alternating(100, 5.0)];
        let rhat = split_rhat(&chains).expect("enough draws");
        assert!(rhat > 1.5);
    }

    #[test]
    fn single_drifting_chain_is_flagged() {
        let drifting = (0..200).map(|idx| usize_to_f64(idx) / 10.0).collect::<Vec<_>>();
        let rhat = split_rhat(&[drifting]).expect("enough draws");
        assert!(rhat > 1.5);
    }

    #[test]
    fn frozen_chains_at_different_values_are_flagged() {
        let rhat = split_rhat(&[vec![1.0; 10], vec![2.0; 10]]).expect("enough draws");
        assert!(rhat.is_infinite());
        let rhat = split_rhat(&[vec![1.0; 10], vec![1.0; 10]]).expect("enough draws");
        assert_relative_eq!(rhat, 1.0);
    }

    #[test]
    fn too_few_draws_yield_none() {
        assert_eq!(split_rhat(&[vec![0.0, 1.0, 2.0]]), None);
        assert_eq!(split_rhat(&[]), None);
    }

    #[test]
    fn summary_flags_unconverged_columns() {
        let make = |offset: f64| {
            let rows = (0..40)
                .map(|idx| {
                    let wiggle = if idx % 2 == 0 { -1.0 } else { 1.0 };
                    vec![wiggle, offset + wiggle]
                })
                .collect::<Vec<_>>();
            PosteriorSamples::from_rows(vec!["stable".to_string(), "shifted".to_string()], &rows)
                .expect("valid draws")
        };
        let summary = summarize_convergence(&[make(0.0), make(10.0)], 1.05);
        assert!(!summary.converged);
        assert_eq!(summary.unconverged_parameters(), vec!["shifted"]);
        assert_eq!(summary.chain_count, 2);
        assert_eq!(summary.draws_per_chain, 40);
    }
}
