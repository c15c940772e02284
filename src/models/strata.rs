//! Subgroup and interaction effects as weighted sums of posterior columns.
//!
//! Every stratum-specific effect reduces to `summarize(combine(samples, weights))`:
//! the reference stratum is `{exposure: 1}` and a modified stratum adds the
//! matching interaction coefficient, `{exposure: 1, interaction: 1}`.

use thiserror::Error;

use super::effects::{DirectionProbabilities, EffectError, EffectSummary, direction_probabilities, summarize};
use super::glmm::{DesignInfo, PosteriorError, PosteriorSamples};

/// Errors raised while building or evaluating strata.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum StrataError {
    #[error(transparent)]
    Posterior(#[from] PosteriorError),
    #[error(transparent)]
    Effect(#[from] EffectError),
    #[error("`{0}` is not a categorical fixed effect of this fit")]
    UnknownFactor(String),
    #[error("fit has no coefficient `{0}`")]
    MissingCoefficient(String),
}

/// A named linear combination of posterior columns.
#[derive(Debug, Clone, PartialEq)]
pub struct StratumCombination {
    name: String,
    weights: Vec<(String, f64)>,
}

impl StratumCombination {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            weights: Vec::new(),
        }
    }

    /// Single-column combination with unit weight.
    #[must_use]
    pub fn single(column: impl Into<String>) -> Self {
        let column = column.into();
        Self::new(column.clone()).with_term(column, 1.0)
    }

    /// Add `weight * column`; repeated columns accumulate.
    #[must_use]
    pub fn with_term(mut self, column: impl Into<String>, weight: f64) -> Self {
        let column = column.into();
        match self.weights.iter_mut().find(|(name, _)| *name == column) {
            Some((_, existing)) => *existing += weight,
            None => self.weights.push((column, weight)),
        }
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn weights(&self) -> &[(String, f64)] {
        &self.weights
    }
}

/// One combined draw per posterior row.
///
/// All columns are resolved before any arithmetic, so an unknown name fails
/// without partial output.
///
/// # Errors
///
/// Returns `PosteriorError::UnknownColumn` if a weight names an absent column.
pub fn combine(
    samples: &PosteriorSamples,
    combination: &StratumCombination,
) -> Result<Vec<f64>, PosteriorError> {
    let resolved = combination
        .weights
        .iter()
        .map(|(name, weight)| samples.column_index(name).map(|col| (col, *weight)))
        .collect::<Result<Vec<_>, _>>()?;
    let draws = samples.draws();
    Ok((0..samples.n_draws())
        .map(|row| {
            resolved
                .iter()
                .map(|(col, weight)| weight * draws[(row, *col)])
                .sum()
        })
        .collect())
}

/// Direction probabilities of a single interaction coefficient.
///
/// # Errors
///
/// Returns `StrataError` if the column is absent.
pub fn probability_of_interaction(
    samples: &PosteriorSamples,
    interaction_column: &str,
) -> Result<DirectionProbabilities, StrataError> {
    let draws = combine(samples, &StratumCombination::single(interaction_column))?;
    Ok(direction_probabilities(&draws)?)
}

/// Strata for a binary modifier: without it (`{exposure}`) and with it
/// (`{exposure, interaction}`).
#[must_use]
pub fn binary_strata(
    exposure: &str,
    interaction_column: &str,
    labels: (&str, &str),
) -> [StratumCombination; 2] {
    [
        StratumCombination::new(labels.0).with_term(exposure, 1.0),
        StratumCombination::new(labels.1)
            .with_term(exposure, 1.0)
            .with_term(interaction_column, 1.0),
    ]
}

/// One stratum per level of a categorical modifier, reference level first.
///
/// Interaction columns are found whichever order the components were
/// declared in (`treatment:risk_qQ2` or `risk_qQ2:treatment`). Strata are
/// named `{modifier}={level}`.
///
/// # Errors
///
/// Returns `StrataError` if `modifier` is not a categorical fixed effect or a
/// needed coefficient is absent.
pub fn factor_strata(
    info: &DesignInfo,
    exposure: &str,
    modifier: &str,
) -> Result<Vec<StratumCombination>, StrataError> {
    if !info.has_coefficient(exposure) {
        return Err(StrataError::MissingCoefficient(exposure.to_string()));
    }
    let levels = info
        .factor_levels
        .get(modifier)
        .ok_or_else(|| StrataError::UnknownFactor(modifier.to_string()))?;

    levels
        .iter()
        .enumerate()
        .map(|(index, level)| {
            let stratum = StratumCombination::new(format!("{modifier}={level}")).with_term(exposure, 1.0);
            if index == 0 {
                return Ok(stratum);
            }
            let indicator = format!("{modifier}{level}");
            let forward = format!("{exposure}:{indicator}");
            let reverse = format!("{indicator}:{exposure}");
            let column = [forward.clone(), reverse]
                .into_iter()
                .find(|name| info.has_coefficient(name))
                .ok_or(StrataError::MissingCoefficient(forward))?;
            Ok(stratum.with_term(column, 1.0))
        })
        .collect()
}

/// Effect of the exposure at `value` of a continuous modifier.
#[must_use]
pub fn effect_at(exposure: &str, interaction_column: &str, value: f64) -> StratumCombination {
    StratumCombination::new(format!("{interaction_column}={value}"))
        .with_term(exposure, 1.0)
        .with_term(interaction_column, value)
}

/// Summarize every stratum with the same level and transform.
///
/// # Errors
///
/// Returns `StrataError` for unknown columns or invalid summary inputs.
pub fn summarize_strata<F>(
    samples: &PosteriorSamples,
    strata: &[StratumCombination],
    credible_level: f64,
    transform: F,
) -> Result<Vec<(String, EffectSummary)>, StrataError>
where
    F: Fn(f64) -> f64,
{
    strata
        .iter()
        .map(|stratum| {
            let draws = combine(samples, stratum)?;
            let summary = summarize(&draws, credible_level, &transform)?;
            Ok((stratum.name.clone(), summary))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use approx::assert_relative_eq;

    fn samples() -> PosteriorSamples {
        PosteriorSamples::from_rows(
            vec![
                "Intercept".to_string(),
                "treatment".to_string(),
                "risk_qQ2:treatment".to_string(),
                "treatment:sepsis".to_string(),
            ],
            &[
                vec![-1.0, -0.2, 0.1, 0.3],
                vec![-1.1, -0.1, 0.2, -0.1],
                vec![-0.9, -0.3, 0.0, 0.2],
                vec![-1.0, 0.1, 0.1, 0.4],
            ],
        )
        .expect("valid draws")
    }

    fn info() -> DesignInfo {
        DesignInfo {
            coefficient_names: ["Intercept", "treatment", "risk_qQ2", "risk_qQ2:treatment"]
                .map(String::from)
                .to_vec(),
            coefficient_terms: ["Intercept", "treatment", "risk_q", "risk_q:treatment"]
                .map(String::from)
                .to_vec(),
            factor_levels: BTreeMap::from([(
                "risk_q".to_string(),
                vec!["Q1".to_string(), "Q2".to_string()],
            )]),
            group_levels: BTreeMap::new(),
            column_names: Vec::new(),
            n_rows: 0,
        }
    }

    #[test]
    fn identity_weight_returns_the_raw_column() {
        let samples = samples();
        let combined = combine(&samples, &StratumCombination::single("treatment")).expect("present");
        assert_eq!(combined, samples.column("treatment").expect("present"));
    }

    #[test]
    fn weights_scale_and_add_columns() {
        let stratum = StratumCombination::new("sepsis")
            .with_term("treatment", 1.0)
            .with_term("treatment:sepsis", 0.5)
            .with_term("treatment:sepsis", 0.5);
        assert_eq!(stratum.weights().len(), 2);
        let combined = combine(&samples(), &stratum).expect("present");
        assert_relative_eq!(combined[0], 0.1, epsilon = 1.0e-12);
        assert_relative_eq!(combined[1], -0.2, epsilon = 1.0e-12);
    }

    #[test]
    fn unknown_columns_fail_the_whole_combination() {
        let stratum = StratumCombination::new("x")
            .with_term("treatment", 1.0)
            .with_term("treatment:shock", 1.0);
        assert_eq!(
            combine(&samples(), &stratum),
            Err(PosteriorError::UnknownColumn("treatment:shock".to_string()))
        );
    }

    #[test]
    fn interaction_direction_uses_the_single_column() {
        let direction = probability_of_interaction(&samples(), "treatment:sepsis").expect("present");
        assert_relative_eq!(direction.prob_negative, 0.25);
        assert_relative_eq!(direction.prob_positive, 0.75);
    }

    #[test]
    fn factor_strata_find_reverse_order_interactions() {
        let strata = factor_strata(&info(), "treatment", "risk_q").expect("valid factor");
        assert_eq!(strata.len(), 2);
        assert_eq!(strata[0].name(), "risk_q=Q1");
        assert_eq!(strata[0].weights(), [("treatment".to_string(), 1.0)]);
        assert_eq!(strata[1].weights()[1].0, "risk_qQ2:treatment");
        assert_eq!(
            factor_strata(&info(), "treatment", "sex"),
            Err(StrataError::UnknownFactor("sex".to_string()))
        );
    }

    #[test]
    fn binary_and_continuous_strata_compose_with_summaries() {
        let [absent, present] = binary_strata("treatment", "treatment:sepsis", ("no sepsis", "sepsis"));
        let summaries =
            summarize_strata(&samples(), &[absent, present], 0.95, f64::exp).expect("valid strata");
        assert_eq!(summaries[0].0, "no sepsis");
        assert!(summaries[1].1.point_estimate > summaries[0].1.point_estimate);

        let at_two = effect_at("treatment", "treatment:sepsis", 2.0);
        let combined = combine(&samples(), &at_two).expect("present");
        assert_relative_eq!(combined[0], 0.4, epsilon = 1.0e-12);
    }
}
