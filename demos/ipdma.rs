use ipdma_effects::{
    Dataset, GroupingTerm, HierarchicalFitter, ModelSpec, SamplingConfig, StratumCombination,
    absolute_risk_summary, binary_strata, combine, probability_below, probability_of_interaction,
    render_convergence_table, render_effect_table, summarize_ratio, summarize_strata,
};
use rand::rngs::StdRng;
use rand::{RngExt, SeedableRng};
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let data = simulate(1_600, 2024);
    let spec = ModelSpec::log_binomial("death")
        .with_variable("treatment")
        .with_variable("sepsis")
        .with_interaction(&["treatment", "sepsis"])
        .with_grouping(GroupingTerm::intercept("trial"));
    let config = SamplingConfig {
        chains: 4,
        warmup: 1_000,
        iterations: 2_000,
        ..SamplingConfig::default()
    };

    let fit = HierarchicalFitter::new(config).fit(&spec, &data).expect("fit");
    println!("{}", render_convergence_table(&fit.diagnostics));
    println!("converged: {} in {:.1?}", fit.converged(), fit.elapsed);

    let overall = combine(&fit.samples, &StratumCombination::single("treatment")).expect("treatment");
    let [no_sepsis, sepsis] = binary_strata("treatment", "treatment:sepsis", ("no sepsis", "sepsis"));
    let mut rows = vec![("overall".to_string(), summarize_ratio(&overall).expect("summary"))];
    rows.extend(
        summarize_strata(&fit.samples, &[no_sepsis, sepsis], 0.95, f64::exp).expect("strata"),
    );
    println!("{}", render_effect_table(&rows, 1.0));

    let arr = absolute_risk_summary(&overall, 0.3, 0.95).expect("arr");
    println!(
        "ARR at 30% baseline: {:.3} ({:.3}, {:.3})",
        arr.point_estimate, arr.lower, arr.upper
    );
    println!(
        "P(RR < 0.9): {:.3}",
        probability_below(&overall, 0.9_f64.ln()).expect("draws")
    );
    let interaction = probability_of_interaction(&fit.samples, "treatment:sepsis").expect("interaction");
    println!(
        "P(interaction < 0): {:.3}, P(interaction > 0): {:.3}",
        interaction.prob_negative, interaction.prob_positive
    );
}

fn simulate(n: usize, seed: u64) -> Dataset {
    let trials = [("ADRENAL", 0.28), ("APROCCHSS", 0.45), ("HYPRESS", 0.20), ("VANISH", 0.30)];
    let mut rng = StdRng::seed_from_u64(seed);
    let mut death = Vec::with_capacity(n);
    let mut treatment = Vec::with_capacity(n);
    let mut sepsis = Vec::with_capacity(n);
    let mut trial = Vec::with_capacity(n);

    for row in 0..n {
        let (label, baseline) = trials[row % trials.len()];
        let treated = rng.random::<f64>() < 0.5;
        let septic = rng.random::<f64>() < 0.4;
        let mut risk: f64 = baseline;
        if septic {
            risk *= 1.3;
        }
        if treated {
            risk *= if septic { 0.8 } else { 0.95 };
        }
        death.push(if rng.random::<f64>() < risk.min(0.95) { 1.0 } else { 0.0 });
        treatment.push(if treated { 1.0 } else { 0.0 });
        sepsis.push(if septic { 1.0 } else { 0.0 });
        trial.push(Some(label));
    }

    Dataset::new()
        .with_numeric("death", death)
        .with_numeric("treatment", treatment)
        .with_numeric("sepsis", sepsis)
        .with_categorical("trial", trial)
}
