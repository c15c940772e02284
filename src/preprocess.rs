//! Dataset preparation helpers that sit in front of model fitting.

use crate::input::{Column, Dataset, InputError};
use crate::utils::{percentile, sorted_copy, usize_to_f64};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OutcomeDiagnostics {
    pub n_rows: usize,
    pub n_missing: usize,
    pub n_events: usize,
    pub n_non_events: usize,
    pub n_invalid: usize,
    pub event_share: f64,
}

/// Count events, non-events, missing, and non-binary values in an outcome column.
///
/// # Errors
///
/// Returns `InputError` if the column is absent or categorical.
pub fn outcome_diagnostics(
    dataset: &Dataset,
    outcome: &str,
) -> Result<OutcomeDiagnostics, InputError> {
    let values = dataset.numeric(outcome)?;
    let mut n_missing = 0usize;
    let mut n_events = 0usize;
    let mut n_non_events = 0usize;
    let mut n_invalid = 0usize;

    for value in values.iter().copied() {
        if value.is_nan() {
            n_missing += 1;
        } else if value == 1.0 {
            n_events += 1;
        } else if value == 0.0 {
            n_non_events += 1;
        } else {
            n_invalid += 1;
        }
    }

    let n_observed = n_events + n_non_events;
    let event_share = if n_observed > 0 {
        usize_to_f64(n_events) / usize_to_f64(n_observed)
    } else {
        0.0
    };

    Ok(OutcomeDiagnostics {
        n_rows: values.len(),
        n_missing,
        n_events,
        n_non_events,
        n_invalid,
        event_share,
    })
}

/// Whether non-missing values in `values` span more than `tolerance`.
#[must_use]
pub fn column_has_variation(values: &[f64], tolerance: f64) -> bool {
    let mut min = f64::INFINITY;
    let mut max = f64::NEG_INFINITY;
    let mut observed = 0usize;
    for value in values.iter().copied().filter(|value| !value.is_nan()) {
        min = min.min(value);
        max = max.max(value);
        observed += 1;
    }
    observed >= 2 && (max - min).abs() > tolerance.abs()
}

/// Interior cut points splitting `values` into `n_groups` equal-probability bins.
///
/// Uses the same linear-interpolation quantile rule as posterior summaries.
#[must_use]
pub fn quantile_cut_points(values: &[f64], n_groups: usize) -> Vec<f64> {
    let observed = values
        .iter()
        .copied()
        .filter(|value| !value.is_nan())
        .collect::<Vec<_>>();
    if observed.is_empty() || n_groups < 2 {
        return Vec::new();
    }
    let sorted = sorted_copy(&observed);
    (1..n_groups)
        .map(|k| percentile(&sorted, usize_to_f64(k) / usize_to_f64(n_groups)))
        .collect()
}

/// Derive a categorical stratum column `Q1..Qn` from a continuous column.
///
/// A value equal to a cut point falls into the lower group. Missing source
/// values stay missing. Typical use: quartiles of a predicted baseline risk.
///
/// # Errors
///
/// Returns `InputError` if `source` is absent or categorical.
pub fn with_quantile_groups(
    dataset: &Dataset,
    source: &str,
    target: &str,
    n_groups: usize,
) -> Result<Dataset, InputError> {
    let values = dataset.numeric(source)?;
    let cuts = quantile_cut_points(values, n_groups);

    let labels = values
        .iter()
        .map(|value| {
            if value.is_nan() {
                return None;
            }
            let below = cuts.iter().take_while(|cut| value > *cut).count();
            Some(format!("Q{}", below + 1))
        })
        .collect::<Vec<_>>();

    let mut derived = dataset.clone();
    derived.insert(target.to_string(), Column::Categorical(labels));
    Ok(derived)
}
