use ipdma_effects::{
    Dataset, GroupingTerm, HierarchicalFitter, ModelSpec, PriorSet, SamplingConfig,
    SensitivityPriors, StratumCombination, combine, prior_predictive_summary, render_effect_table,
    summarize_ratio,
};
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let data = balanced_trials();
    let archetypes = SensitivityPriors::default().all().expect("valid archetypes");
    let config = SamplingConfig {
        chains: 2,
        warmup: 500,
        iterations: 1_500,
        ..SamplingConfig::default()
    };

    let mut rows = Vec::with_capacity(archetypes.len());
    for (archetype, prior) in archetypes {
        let implied = prior_predictive_summary(&prior, 10_000, 1, f64::exp).expect("prior draws");
        println!(
            "{:>12} prior {prior}: RR median {:.2}, 95% ({:.2}, {:.2}), P(RR > 1) {:.2}",
            archetype.to_string(),
            implied.q50, implied.q025, implied.q975, implied.prob_above_one
        );

        let spec = ModelSpec::log_binomial("death")
            .with_variable("treatment")
            .with_grouping(GroupingTerm::intercept("trial"))
            .with_priors(PriorSet::default().with_term("treatment", prior));
        let fit = HierarchicalFitter::new(config).fit(&spec, &data).expect("fit");
        let draws = combine(&fit.samples, &StratumCombination::single("treatment")).expect("treatment");
        rows.push((archetype.to_string(), summarize_ratio(&draws).expect("summary")));
    }

    println!("{}", render_effect_table(&rows, 1.0));
}

/// Four trials with 30% control mortality and 25% treated mortality.
fn balanced_trials() -> Dataset {
    let mut death = Vec::new();
    let mut treatment = Vec::new();
    let mut trial = Vec::new();
    for label in ["T1", "T2", "T3", "T4"] {
        for arm in [0.0, 1.0] {
            let deaths = if arm > 0.0 { 25 } else { 30 };
            for patient in 0..100 {
                death.push(if patient < deaths { 1.0 } else { 0.0 });
                treatment.push(arm);
                trial.push(Some(label));
            }
        }
    }
    Dataset::new()
        .with_numeric("death", death)
        .with_numeric("treatment", treatment)
        .with_categorical("trial", trial)
}
