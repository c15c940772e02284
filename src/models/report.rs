/////////////////////////////////////////////////////////////////////////////////////////////\
//
// Text tables for effect summaries, convergence diagnostics, and study pooling.
//
// Created on: 18 Oct 2026
//
/////////////////////////////////////////////////////////////////////////////////////////////
//! Plain-text tables for effect summaries, convergence, and study pooling.

use comfy_table::{Attribute, Cell, Color, ContentArrangement, Table, presets::UTF8_FULL_CONDENSED};

use super::effects::EffectSummary;
use super::glmm::ConvergenceSummary;
use super::meta::PooledEstimate;

/// One row per labelled effect: estimate, interval, and direction
/// probabilities. Rows whose interval excludes `null_value` are highlighted.
#[must_use]
pub fn render_effect_table(rows: &[(String, EffectSummary)], null_value: f64) -> Table {
    let mut table = make_table(&["effect", "estimate", "lower", "upper", "level", "P(benefit)", "P(harm)"]);
    for (label, summary) in rows {
        table.add_row(vec![
            Cell::new(label),
            highlight_cell(summary.point_estimate, summary.interval_excludes(null_value), 3),
            Cell::new(format!("{:.3}", summary.lower)),
            Cell::new(format!("{:.3}", summary.upper)),
            Cell::new(format!("{:.0}%", 100.0 * summary.credible_level)),
            Cell::new(format!("{:.3}", summary.prob_benefit())),
            Cell::new(format!("{:.3}", summary.prob_harm())),
        ]);
    }
    table
}

/// Per-parameter split-R-hat and ESS; parameters over the threshold are
/// shown in red.
#[must_use]
pub fn render_convergence_table(summary: &ConvergenceSummary) -> Table {
    let mut table = make_table(&["parameter", "split R-hat", "ESS"]);
    for parameter in &summary.parameters {
        let rhat_cell = match parameter.split_rhat {
            Some(rhat) if rhat <= summary.rhat_threshold => Cell::new(format!("{rhat:.3}")),
            Some(rhat) => Cell::new(format!("{rhat:.3}"))
                .fg(Color::Red)
                .add_attribute(Attribute::Bold),
            None => Cell::new("n/a").fg(Color::Red),
        };
        table.add_row(vec![
            Cell::new(&parameter.name),
            rhat_cell,
            Cell::new(format!("{:.0}", parameter.ess)),
        ]);
    }
    table
}

/// Study estimates and weights followed by the pooled row, on the
/// risk-ratio scale.
#[must_use]
pub fn render_pooled_table(pooled: &PooledEstimate) -> Table {
    let mut table = make_table(&["study", "weight", "RR", "lower", "upper"]);
    for (study, (_, weight)) in pooled.studies.iter().zip(&pooled.weights) {
        let (lower, upper) = study.risk_ratio_interval(pooled.level);
        table.add_row(vec![
            Cell::new(&study.label),
            Cell::new(format!("{:.1}%", 100.0 * weight)),
            Cell::new(format!("{:.3}", study.log_rr.exp())),
            Cell::new(format!("{lower:.3}")),
            Cell::new(format!("{upper:.3}")),
        ]);
    }
    let (lower, upper) = pooled.risk_ratio_interval();
    table.add_row(vec![
        Cell::new(format!("pooled ({})", pooled.method)).add_attribute(Attribute::Bold),
        Cell::new("100%"),
        highlight_cell(pooled.risk_ratio(), upper < 1.0 || lower > 1.0, 3),
        Cell::new(format!("{lower:.3}")),
        Cell::new(format!("{upper:.3}")),
    ]);
    table
}

fn make_table(headers: &[&str]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(headers.iter().map(|h| Cell::new(*h)).collect::<Vec<_>>());
    table
}

fn highlight_cell(value: f64, highlight: bool, precision: usize) -> Cell {
    let cell = Cell::new(format!("{value:.precision$}"));
    if highlight {
        cell.fg(Color::Green).add_attribute(Attribute::Bold)
    } else {
        cell
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::effects::summarize_ratio;
    use crate::models::glmm::{PosteriorSamples, summarize_convergence};
    use crate::models::meta::{StudyEstimate, fixed_effect};

    #[test]
    fn effect_table_lists_every_row() {
        let summary = summarize_ratio(&[-0.3, -0.2, -0.25, -0.1]).expect("valid draws");
        let table = render_effect_table(
            &[
                ("overall".to_string(), summary),
                ("sepsis".to_string(), summary),
            ],
            1.0,
        );
        let rendered = table.to_string();
        assert!(rendered.contains("overall"));
        assert!(rendered.contains("sepsis"));
        assert!(rendered.contains("95%"));
    }

    #[test]
    fn convergence_table_handles_missing_rhat() {
        let samples =
            PosteriorSamples::from_rows(vec!["treatment".to_string()], &[vec![0.1], vec![0.2]])
                .expect("valid draws");
        let summary = summarize_convergence(&[samples], 1.05);
        let rendered = render_convergence_table(&summary).to_string();
        assert!(rendered.contains("treatment"));
        assert!(rendered.contains("n/a"));
    }

    #[test]
    fn pooled_table_ends_with_the_pooled_row() {
        let pooled = fixed_effect(
            &[StudyEstimate::new("a", -0.2, 0.1), StudyEstimate::new("b", 0.0, 0.1)],
            0.95,
        )
        .expect("valid studies");
        let rendered = render_pooled_table(&pooled).to_string();
        assert!(rendered.contains("pooled (fixed effect)"));
        assert!(rendered.contains("50.0%"));
        // study a: exp(-0.2) with a 95% interval of exp(-0.2 -/+ 1.96 * 0.1)
        assert!(rendered.contains("0.819"));
        assert!(rendered.contains("0.673"));
        assert!(rendered.contains("0.996"));
    }
}
