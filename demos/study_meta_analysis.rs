use ipdma_effects::{
    HierarchicalFitter, INTERCEPT, PriorSet, SamplingConfig, StudyEstimate, fixed_effect,
    probability_of_benefit, random_effects, render_convergence_table, render_effect_table,
    render_pooled_table, study_summary_dataset, study_summary_spec, summarize_ratio,
};
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let studies = [
        ("ADRENAL", 0.95, 0.82, 1.10),
        ("APROCCHSS", 0.88, 0.78, 0.99),
        ("HYPRESS", 1.07, 0.77, 1.49),
        ("VANISH", 1.05, 0.77, 1.42),
    ]
    .into_iter()
    .map(|(label, rr, lower, upper)| {
        StudyEstimate::from_interval(label, rr, lower, upper, 0.95).expect("valid interval")
    })
    .collect::<Vec<_>>();

    for study in &studies {
        let (point, upper) = (study.log_rr.exp(), (study.log_rr + 1.96 * study.se).exp());
        println!(
            "{:>10}: P(benefit) {:.3}",
            study.label,
            probability_of_benefit(point, upper, 0.95).expect("valid bounds")
        );
    }

    let fixed = fixed_effect(&studies, 0.95).expect("fixed effect");
    println!("{}", render_pooled_table(&fixed));
    let random = random_effects(&studies, 0.95).expect("random effects");
    println!("{}", render_pooled_table(&random));
    println!(
        "Q {:.2} on {} df (p {:.3}), I^2 {:.1}%, tau^2 {:.4}",
        random.heterogeneity.q,
        random.heterogeneity.df,
        random.heterogeneity.p_value,
        100.0 * random.heterogeneity.i_squared,
        random.heterogeneity.tau_squared
    );

    let config = SamplingConfig {
        chains: 4,
        warmup: 1_000,
        iterations: 3_000,
        ..SamplingConfig::default()
    };
    let fit = HierarchicalFitter::new(config)
        .fit(&study_summary_spec(true, PriorSet::default()), &study_summary_dataset(&studies))
        .expect("fit");
    println!("{}", render_convergence_table(&fit.diagnostics));
    let pooled = fit.samples.column(INTERCEPT).expect("intercept");
    let summary = summarize_ratio(&pooled).expect("summary");
    println!("{}", render_effect_table(&[("Bayesian pooled".to_string(), summary)], 1.0));
}
