use approx::assert_relative_eq;
use ipdma_effects::{
    BoundsError, EffectError, PosteriorSamples, PriorArchetype, SensitivityPriors,
    StratumCombination, absolute_risk_summary, binary_strata, combine, prior_predictive_summary,
    probability_beyond, probability_of_benefit, summarize, summarize_ratio,
};
use rand::rngs::StdRng;
use rand::{RngExt, SeedableRng};

fn idx_to_f64(idx: usize) -> f64 {
    f64::from(u32::try_from(idx).unwrap_or(u32::MAX))
}

/// Deterministic, skewed draws around `centre`.
fn skewed_draws(n: usize, centre: f64) -> Vec<f64> {
    (0..n)
        .map(|idx| {
            let u = (idx_to_f64(idx) + 0.5) / idx_to_f64(n);
            centre + 0.3 * (u - 0.5) + 0.2 * (u - 0.5).powi(3)
        })
        .collect()
}

fn two_column_samples() -> PosteriorSamples {
    let rows = (0..50)
        .map(|idx| {
            let t = idx_to_f64(idx);
            vec![-0.2 + 0.004 * t, 0.1 - 0.002 * t]
        })
        .collect::<Vec<_>>();
    PosteriorSamples::from_rows(vec!["treatment".to_string(), "treatment:sepsis".to_string()], &rows)
        .expect("rectangular draws")
}

#[test]
fn interval_brackets_the_point_estimate_at_every_level() {
    let draws = skewed_draws(400, -0.15);
    for level in [0.5, 0.8, 0.9, 0.95, 0.99] {
        let summary = summarize(&draws, level, f64::exp).expect("valid draws");
        assert!(summary.lower <= summary.point_estimate);
        assert!(summary.point_estimate <= summary.upper);
        assert!(summary.prob_negative + summary.prob_positive <= 1.0);
    }

    let narrow = summarize(&draws, 0.5, |value| value).expect("valid draws");
    let wide = summarize(&draws, 0.99, |value| value).expect("valid draws");
    assert!(wide.lower <= narrow.lower);
    assert!(wide.upper >= narrow.upper);
}

#[test]
fn back_transformed_point_estimate_stays_within_the_draws() {
    let mut rng = StdRng::seed_from_u64(41);
    for centre in [-0.6, -0.1, 0.0, 0.3] {
        let draws = (0..1_500)
            .map(|_| centre + 0.4 * (rng.random::<f64>() - 0.5).powi(3) + 0.05 * rng.random::<f64>())
            .collect::<Vec<_>>();
        let min = draws.iter().copied().fold(f64::INFINITY, f64::min);
        let max = draws.iter().copied().fold(f64::NEG_INFINITY, f64::max);

        let ratio = summarize_ratio(&draws).expect("valid draws");
        let log_point = ratio.point_estimate.ln();
        assert!(min - 1.0e-12 <= log_point && log_point <= max + 1.0e-12);

        let additive = summarize(&draws, 0.9, |value| value).expect("valid draws");
        assert!(min <= additive.point_estimate && additive.point_estimate <= max);
    }
}

#[test]
fn zero_draws_count_toward_neither_direction() {
    let summary = summarize(&[0.0, 0.0, -0.1, 0.2], 0.95, |value| value).expect("valid draws");
    assert_relative_eq!(summary.prob_negative, 0.25);
    assert_relative_eq!(summary.prob_positive, 0.25);
}

#[test]
fn invalid_draws_and_levels_are_rejected() {
    assert_eq!(summarize_ratio(&[]), Err(EffectError::EmptyDraws));
    assert_eq!(
        summarize_ratio(&[0.1, f64::NAN]),
        Err(EffectError::NonFiniteDraws)
    );
    assert!(matches!(
        summarize(&[0.1, 0.2], 1.0, f64::exp),
        Err(EffectError::InvalidCredibleLevel(_))
    ));
}

#[test]
fn single_column_combination_is_the_column() {
    let samples = two_column_samples();
    let draws = combine(&samples, &StratumCombination::single("treatment")).expect("known column");
    assert_eq!(draws, samples.column("treatment").expect("known column"));
}

#[test]
fn binary_strata_add_the_interaction() {
    let samples = two_column_samples();
    let [without, with] = binary_strata("treatment", "treatment:sepsis", ("no sepsis", "sepsis"));
    let base = combine(&samples, &without).expect("known column");
    let modified = combine(&samples, &with).expect("known columns");
    let interaction = samples.column("treatment:sepsis").expect("known column");
    for ((b, m), i) in base.iter().zip(&modified).zip(&interaction) {
        assert_relative_eq!(m - b, *i, epsilon = 1.0e-12);
    }
    assert!(combine(&samples, &StratumCombination::single("missing")).is_err());
}

#[test]
fn absolute_risk_follows_the_baseline() {
    let draws = skewed_draws(200, 0.8_f64.ln());
    let low = absolute_risk_summary(&draws, 0.1, 0.95).expect("valid baseline");
    let high = absolute_risk_summary(&draws, 0.4, 0.95).expect("valid baseline");
    assert_relative_eq!(high.point_estimate, 4.0 * low.point_estimate, epsilon = 1.0e-9);
    assert!(high.point_estimate < 0.0);

    let null = absolute_risk_summary(&[0.0; 10], 0.3, 0.95).expect("valid baseline");
    assert_relative_eq!(null.point_estimate, 0.0);
    assert!(matches!(
        absolute_risk_summary(&draws, 1.0, 0.95),
        Err(EffectError::InvalidBaselineRisk(_))
    ));
}

#[test]
fn probability_of_benefit_tracks_the_published_interval() {
    let benefit = probability_of_benefit(0.93, 1.02, 0.95).expect("valid bounds");
    assert_relative_eq!(benefit, 0.938, epsilon = 2.0e-3);

    let tighter = probability_of_benefit(0.93, 0.99, 0.95).expect("valid bounds");
    assert!(tighter > benefit);
    let harmful = probability_of_benefit(1.10, 1.30, 0.95).expect("valid bounds");
    assert!(harmful < 0.5);

    assert!(probability_beyond(0.93, 1.02, 0.95, 0.9).expect("valid bounds") < benefit);
    assert!(matches!(
        probability_of_benefit(1.0, 0.9, 0.95),
        Err(BoundsError::UpperNotAbovePoint { .. })
    ));
}

#[test]
fn archetype_priors_order_their_prior_harm() {
    let priors = SensitivityPriors::default();
    let harm = |archetype| {
        let prior = priors.prior(archetype).expect("valid archetype");
        prior_predictive_summary(&prior, 4_000, 8, f64::exp)
            .expect("positive sample count")
            .prob_above_one
    };
    let optimistic = harm(PriorArchetype::Optimistic);
    let skeptical = harm(PriorArchetype::Skeptical);
    let pessimistic = harm(PriorArchetype::Pessimistic);
    assert!(optimistic < skeptical);
    assert!(skeptical < pessimistic);
    assert_relative_eq!(skeptical, 0.5, epsilon = 0.05);

    let neutral = prior_predictive_summary(
        &priors.prior(PriorArchetype::Neutral).expect("valid archetype"),
        4_000,
        8,
        f64::exp,
    )
    .expect("positive sample count");
    assert!(neutral.q025 < 0.2);
    assert!(neutral.q975 > 5.0);
}
