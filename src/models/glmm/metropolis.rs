/////////////////////////////////////////////////////////////////////////////////////////////\
//
// Metropolis-within-Gibbs engine with IRLS starting values for hierarchical GLMs.
//
// Created on: 18 Oct 2026
//
/////////////////////////////////////////////////////////////////////////////////////////////
//! Random-walk Metropolis-within-Gibbs engine for the hierarchical GLM.
//!
//! One sweep updates every fixed effect component-wise, every group level's
//! deviation vector jointly, and every group standard deviation with a joint
//! rescaling move that keeps the level deviations on the same scale. Row
//! log-likelihoods are cached so each proposal only re-evaluates the rows it
//! touches.

use faer::Mat;
use rand::rngs::StdRng;
use rand::{RngExt, SeedableRng};
use tracing::{debug, warn};

use crate::inference::{ProposalStats, ProposalTuning};
use crate::utils::{mean, solve_linear_system, usize_to_f64};

use super::design::CompiledDesign;
use super::likelihood::LikelihoodKind;
use super::sampler::{
    AcceptanceRates, ChainControl, ChainError, ChainOutput, ChainRequest, PosteriorEngine,
};
use super::spec::{Family, Link};

const RIDGE_L2: f64 = 1.0e-8;
const IRLS_MAX_ITERS: usize = 50;
const IRLS_TOLERANCE: f64 = 1.0e-6;
const MIN_WEIGHT: f64 = 1.0e-8;
const MAX_WORKING_ETA: f64 = 20.0;
const FEASIBILITY_MARGIN: f64 = 1.0e-3;
const INITIAL_GROUP_SD: f64 = 0.25;
const RANDOM_WALK_FACTOR: f64 = 2.4;
const START_JITTER: f64 = 0.5;

/// Built-in engine. Supports log-binomial, log-Poisson, and Gaussian with
/// identity link.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetropolisEngine {
    pub tuning: ProposalTuning,
}

impl Default for MetropolisEngine {
    fn default() -> Self {
        Self {
            tuning: ProposalTuning::default(),
        }
    }
}

impl MetropolisEngine {
    #[must_use]
    pub const fn new(tuning: ProposalTuning) -> Self {
        Self { tuning }
    }
}

impl PosteriorEngine for MetropolisEngine {
    fn name(&self) -> &'static str {
        "metropolis-within-gibbs"
    }

    fn supports(&self, family: &Family, link: Link) -> bool {
        LikelihoodKind::resolve(family, link).is_some()
    }

    fn sample_chain(
        &self,
        design: &CompiledDesign,
        request: &ChainRequest,
        control: &ChainControl<'_>,
    ) -> Result<ChainOutput, ChainError> {
        self.tuning
            .validate()
            .map_err(|err| ChainError::Failed(err.to_string()))?;
        let kind = LikelihoodKind::resolve(&design.family, design.link).ok_or_else(|| {
            ChainError::Failed(format!(
                "no likelihood for family `{}` with link `{}`",
                design.family, design.link
            ))
        })?;
        control.checkpoint()?;

        let context = ChainContext::new(design, kind);
        let mut rng = StdRng::seed_from_u64(request.seed);
        let (state, scales) = initial_state(&context, &self.tuning, &mut rng);
        let cache = RowCache::initialize(&context, &state)?;
        debug!(
            chain = request.chain_index,
            start_log_likelihood = cache.total,
            "chain initialized"
        );

        ChainSampler {
            window: AcceptanceCounts::new(design),
            overall: AcceptanceCounts::new(design),
            context,
            state,
            cache,
            scales,
            rng,
            tuning: self.tuning,
            candidate_ll: Vec::new(),
            candidate_eta: Vec::new(),
            effect_proposal: Vec::new(),
        }
        .run(request, control)
    }
}

struct ChainContext<'a> {
    design: &'a CompiledDesign,
    kind: LikelihoodKind,
    /// Rows with a non-zero entry in each fixed-effect column.
    coefficient_rows: Vec<Vec<usize>>,
}

impl<'a> ChainContext<'a> {
    fn new(design: &'a CompiledDesign, kind: LikelihoodKind) -> Self {
        let coefficient_rows = (0..design.n_coefficients())
            .map(|col| {
                (0..design.n_rows())
                    .filter(|row| design.x[(*row, col)] != 0.0)
                    .collect()
            })
            .collect();
        Self {
            design,
            kind,
            coefficient_rows,
        }
    }

    fn standard_error(&self, row: usize) -> f64 {
        self.design
            .standard_errors
            .as_ref()
            .map_or(1.0, |errors| errors[row])
    }

    fn row_log_likelihood(&self, row: usize, eta: f64) -> f64 {
        self.kind
            .row_log_likelihood(self.design.outcome[row], eta, self.standard_error(row))
    }

    fn fixed_eta(&self, row: usize, beta: &[f64]) -> f64 {
        dot_row(&self.design.x, row, beta) + self.design.offset[row]
    }
}

#[derive(Debug, Clone)]
struct ChainState {
    beta: Vec<f64>,
    /// `[group][dimension]`
    group_sd: Vec<Vec<f64>>,
    /// `[group][level][dimension]`
    group_effects: Vec<Vec<Vec<f64>>>,
}

impl ChainState {
    /// One draw in the design's column order.
    fn draw_row(&self, keep_group_effects: bool) -> Vec<f64> {
        let mut row = self.beta.clone();
        for sds in &self.group_sd {
            row.extend_from_slice(sds);
        }
        if keep_group_effects {
            for levels in &self.group_effects {
                for effect in levels {
                    row.extend_from_slice(effect);
                }
            }
        }
        row
    }
}

#[derive(Debug, Clone)]
struct RowCache {
    /// `x beta + offset`
    fixed_eta: Vec<f64>,
    /// Group contribution to every row, `[group][row]`.
    group_eta: Vec<Vec<f64>>,
    row_log_likelihood: Vec<f64>,
    total: f64,
}

impl RowCache {
    fn initialize(context: &ChainContext<'_>, state: &ChainState) -> Result<Self, ChainError> {
        let design = context.design;
        let fixed_eta = (0..design.n_rows())
            .map(|row| context.fixed_eta(row, &state.beta))
            .collect::<Vec<_>>();
        let group_eta = design
            .groups
            .iter()
            .zip(state.group_effects.iter())
            .map(|(group, effects)| {
                (0..design.n_rows())
                    .map(|row| dot_row(&group.basis, row, &effects[group.row_level[row]]))
                    .collect::<Vec<_>>()
            })
            .collect::<Vec<_>>();

        let mut cache = Self {
            fixed_eta,
            group_eta,
            row_log_likelihood: Vec::with_capacity(design.n_rows()),
            total: 0.0,
        };
        cache.row_log_likelihood = (0..design.n_rows())
            .map(|row| context.row_log_likelihood(row, cache.eta(row)))
            .collect();
        cache.total = cache.row_log_likelihood.iter().sum();

        if !cache.total.is_finite() {
            return Err(ChainError::Failed(
                "starting values have zero likelihood".to_string(),
            ));
        }
        Ok(cache)
    }

    fn eta(&self, row: usize) -> f64 {
        self.fixed_eta[row] + self.group_eta.iter().map(|group| group[row]).sum::<f64>()
    }
}

#[derive(Debug, Clone)]
struct ProposalScales {
    fixed: Vec<f64>,
    /// `[group][dimension]`
    group_effects: Vec<Vec<f64>>,
    /// `[group][dimension]`
    log_sd: Vec<Vec<f64>>,
}

#[derive(Debug, Clone)]
struct AcceptanceCounts {
    fixed: Vec<ProposalStats>,
    group_effects: Vec<ProposalStats>,
    group_sd: Vec<Vec<ProposalStats>>,
}

impl AcceptanceCounts {
    fn new(design: &CompiledDesign) -> Self {
        Self {
            fixed: vec![ProposalStats::default(); design.n_coefficients()],
            group_effects: vec![ProposalStats::default(); design.groups.len()],
            group_sd: design
                .groups
                .iter()
                .map(|group| vec![ProposalStats::default(); group.dimension()])
                .collect(),
        }
    }

    fn rates(&self) -> AcceptanceRates {
        let has_groups = !self.group_effects.is_empty();
        AcceptanceRates {
            fixed_effects: pooled(self.fixed.iter()).acceptance_rate(),
            group_effects: has_groups.then(|| pooled(self.group_effects.iter()).acceptance_rate()),
            group_sd: has_groups.then(|| pooled(self.group_sd.iter().flatten()).acceptance_rate()),
        }
    }
}

fn pooled<'s>(blocks: impl Iterator<Item = &'s ProposalStats>) -> ProposalStats {
    blocks.fold(ProposalStats::default(), |mut total, block| {
        total.merge(*block);
        total
    })
}

struct ChainSampler<'a> {
    context: ChainContext<'a>,
    state: ChainState,
    cache: RowCache,
    scales: ProposalScales,
    window: AcceptanceCounts,
    overall: AcceptanceCounts,
    rng: StdRng,
    tuning: ProposalTuning,
    candidate_ll: Vec<f64>,
    candidate_eta: Vec<f64>,
    effect_proposal: Vec<f64>,
}

impl ChainSampler<'_> {
    fn run(
        mut self,
        request: &ChainRequest,
        control: &ChainControl<'_>,
    ) -> Result<ChainOutput, ChainError> {
        let target = request
            .adapt_delta
            .unwrap_or(self.tuning.acceptance_target);
        let keep_group_effects = self.context.design.keep_group_effects;
        let mut rows = Vec::with_capacity(request.retained_draws());

        for iter in 0..request.iterations {
            control.checkpoint()?;
            self.sweep();
            if !self.cache.total.is_finite() {
                return Err(ChainError::Failed(format!(
                    "log-likelihood became non-finite at iteration {iter}"
                )));
            }
            if iter < request.warmup && (iter + 1).is_multiple_of(self.tuning.adaptation_interval) {
                self.adapt(target);
            }
            if request.is_retained(iter) {
                rows.push(self.state.draw_row(keep_group_effects));
            }
        }

        let n_columns = rows.first().map_or(0, Vec::len);
        let draws = Mat::from_fn(rows.len(), n_columns, |row, col| rows[row][col]);
        Ok(ChainOutput {
            draws,
            acceptance: self.overall.rates(),
        })
    }

    fn sweep(&mut self) {
        self.update_fixed_effects();
        for group in 0..self.context.design.groups.len() {
            self.update_group_effects(group);
            self.update_group_sd(group);
        }
        self.cache.total = self.cache.row_log_likelihood.iter().sum();
    }

    fn update_fixed_effects(&mut self) {
        let design = self.context.design;
        for coef in 0..design.n_coefficients() {
            let current = self.state.beta[coef];
            let proposal = self.scales.fixed[coef].mul_add(sample_standard_normal(&mut self.rng), current);
            let delta = proposal - current;

            let rows = &self.context.coefficient_rows[coef];
            self.candidate_ll.clear();
            let mut ll_delta = 0.0;
            for &row in rows {
                let eta = design.x[(row, coef)].mul_add(delta, self.cache.eta(row));
                let ll = self.context.row_log_likelihood(row, eta);
                ll_delta += ll - self.cache.row_log_likelihood[row];
                self.candidate_ll.push(ll);
            }

            let prior = &design.fixed_priors[coef];
            let log_acceptance = ll_delta + prior.log_density(proposal) - prior.log_density(current);
            let accepted = should_accept(log_acceptance, &mut self.rng);
            if accepted {
                self.state.beta[coef] = proposal;
                for (&row, &ll) in rows.iter().zip(self.candidate_ll.iter()) {
                    self.cache.fixed_eta[row] += design.x[(row, coef)] * delta;
                    self.cache.row_log_likelihood[row] = ll;
                }
            }
            self.window.fixed[coef].record(accepted);
            self.overall.fixed[coef].record(accepted);
        }
    }

    fn update_group_effects(&mut self, group_index: usize) {
        let group = &self.context.design.groups[group_index];
        for level in 0..group.n_levels() {
            let current = &self.state.group_effects[group_index][level];
            random_walk_vector_into(
                &mut self.effect_proposal,
                current,
                &self.scales.group_effects[group_index],
                &mut self.rng,
            );
            let prior_delta = current
                .iter()
                .zip(self.effect_proposal.iter())
                .zip(self.state.group_sd[group_index].iter())
                .map(|((old, new), sd)| log_normal_density(*new, *sd) - log_normal_density(*old, *sd))
                .sum::<f64>();

            self.candidate_ll.clear();
            self.candidate_eta.clear();
            let mut ll_delta = 0.0;
            for &row in &group.level_rows[level] {
                let contribution = dot_row(&group.basis, row, &self.effect_proposal);
                let eta = self.cache.eta(row) - self.cache.group_eta[group_index][row] + contribution;
                let ll = self.context.row_log_likelihood(row, eta);
                ll_delta += ll - self.cache.row_log_likelihood[row];
                self.candidate_ll.push(ll);
                self.candidate_eta.push(contribution);
            }

            let accepted = should_accept(ll_delta + prior_delta, &mut self.rng);
            if accepted {
                self.state.group_effects[group_index][level].clone_from(&self.effect_proposal);
                for ((&row, &ll), &contribution) in group.level_rows[level]
                    .iter()
                    .zip(self.candidate_ll.iter())
                    .zip(self.candidate_eta.iter())
                {
                    self.cache.group_eta[group_index][row] = contribution;
                    self.cache.row_log_likelihood[row] = ll;
                }
            }
            self.window.group_effects[group_index].record(accepted);
            self.overall.group_effects[group_index].record(accepted);
        }
    }

    /// Joint move `(sd, u) -> (r sd, r u)` on one dimension of a group.
    fn update_group_sd(&mut self, group_index: usize) {
        let design = self.context.design;
        let group = &design.groups[group_index];
        for dim in 0..group.dimension() {
            let current = self.state.group_sd[group_index][dim];
            let log_ratio = self.scales.log_sd[group_index][dim] * sample_standard_normal(&mut self.rng);
            let ratio = log_ratio.exp();
            let proposal = current * ratio;
            if !(proposal.is_finite() && proposal > 0.0) {
                self.window.group_sd[group_index][dim].record(false);
                self.overall.group_sd[group_index][dim].record(false);
                continue;
            }

            let prior = &design.group_sd_priors[group_index][dim];
            let mut log_acceptance = prior.log_density(proposal) - prior.log_density(current);
            for effect in &self.state.group_effects[group_index] {
                log_acceptance += log_normal_density(effect[dim] * ratio, proposal)
                    - log_normal_density(effect[dim], current);
            }
            log_acceptance += usize_to_f64(group.n_levels() + 1) * log_ratio;

            self.candidate_ll.clear();
            self.candidate_eta.clear();
            for row in 0..design.n_rows() {
                let effect = self.state.group_effects[group_index][group.row_level[row]][dim];
                let shift = group.basis[(row, dim)] * effect * (ratio - 1.0);
                let contribution = self.cache.group_eta[group_index][row] + shift;
                let ll = if shift == 0.0 {
                    self.cache.row_log_likelihood[row]
                } else {
                    self.context.row_log_likelihood(row, self.cache.eta(row) + shift)
                };
                log_acceptance += ll - self.cache.row_log_likelihood[row];
                self.candidate_ll.push(ll);
                self.candidate_eta.push(contribution);
            }

            let accepted = should_accept(log_acceptance, &mut self.rng);
            if accepted {
                self.state.group_sd[group_index][dim] = proposal;
                for effect in &mut self.state.group_effects[group_index] {
                    effect[dim] *= ratio;
                }
                self.cache.group_eta[group_index].clone_from(&self.candidate_eta);
                self.cache.row_log_likelihood.clone_from(&self.candidate_ll);
            }
            self.window.group_sd[group_index][dim].record(accepted);
            self.overall.group_sd[group_index][dim].record(accepted);
        }
    }

    fn adapt(&mut self, target: f64) {
        let tuning = self.tuning;
        for (scale, stats) in self.scales.fixed.iter_mut().zip(self.window.fixed.iter()) {
            *scale = tuning.adapt(*scale, stats.acceptance_rate(), target);
        }
        for (scales, stats) in self
            .scales
            .group_effects
            .iter_mut()
            .zip(self.window.group_effects.iter())
        {
            let rate = stats.acceptance_rate();
            for scale in scales {
                *scale = tuning.adapt(*scale, rate, target);
            }
        }
        for (scales, stats) in self.scales.log_sd.iter_mut().zip(self.window.group_sd.iter()) {
            for (scale, block) in scales.iter_mut().zip(stats.iter()) {
                *scale = tuning.adapt(*scale, block.acceptance_rate(), target);
            }
        }
        self.window = AcceptanceCounts::new(self.context.design);
    }
}

/// Starting state and proposal scales for one chain.
fn initial_state(
    context: &ChainContext<'_>,
    tuning: &ProposalTuning,
    rng: &mut StdRng,
) -> (ChainState, ProposalScales) {
    let design = context.design;
    let mut beta = irls_start(context).unwrap_or_else(|| {
        warn!("IRLS start failed; starting from the intercept-only estimate");
        intercept_only_start(context)
    });
    let weights = (0..design.n_rows())
        .map(|row| {
            let eta = context.fixed_eta(row, &beta).min(MAX_WORKING_ETA);
            context
                .kind
                .working_weight(eta, context.standard_error(row))
                .max(MIN_WEIGHT)
        })
        .collect::<Vec<_>>();

    let fixed = (0..design.n_coefficients())
        .map(|col| {
            let information = context.coefficient_rows[col]
                .iter()
                .map(|&row| weights[row] * design.x[(row, col)] * design.x[(row, col)])
                .sum::<f64>();
            (RANDOM_WALK_FACTOR / (information + RIDGE_L2).sqrt())
                .clamp(tuning.min_scale, tuning.max_scale)
        })
        .collect::<Vec<_>>();
    for (value, scale) in beta.iter_mut().zip(fixed.iter()) {
        *value += START_JITTER * (scale / RANDOM_WALK_FACTOR) * sample_standard_normal(rng);
    }

    if context.kind == LikelihoodKind::LogBinomial {
        let max_eta = (0..design.n_rows())
            .map(|row| context.fixed_eta(row, &beta))
            .fold(f64::NEG_INFINITY, f64::max);
        if max_eta > -FEASIBILITY_MARGIN {
            beta[0] -= max_eta + FEASIBILITY_MARGIN;
        }
    }

    let prior_precision = 1.0 / (INITIAL_GROUP_SD * INITIAL_GROUP_SD);
    let group_effects_scales = design
        .groups
        .iter()
        .map(|group| {
            let dimension_factor = RANDOM_WALK_FACTOR / usize_to_f64(group.dimension()).sqrt();
            (0..group.dimension())
                .map(|dim| {
                    let per_level = group
                        .level_rows
                        .iter()
                        .map(|rows| {
                            let information = rows
                                .iter()
                                .map(|&row| weights[row] * group.basis[(row, dim)] * group.basis[(row, dim)])
                                .sum::<f64>();
                            1.0 / (information + prior_precision).sqrt()
                        })
                        .collect::<Vec<_>>();
                    (dimension_factor * mean(&per_level)).clamp(tuning.min_scale, tuning.max_scale)
                })
                .collect()
        })
        .collect();

    let group_sd = design
        .groups
        .iter()
        .map(|group| {
            (0..group.dimension())
                .map(|_| INITIAL_GROUP_SD * (0.5 * sample_standard_normal(rng)).exp())
                .collect()
        })
        .collect();
    let group_effects = design
        .groups
        .iter()
        .map(|group| vec![vec![0.0; group.dimension()]; group.n_levels()])
        .collect();
    let log_sd = design
        .groups
        .iter()
        .map(|group| vec![tuning.log_sd_scale; group.dimension()])
        .collect();

    (
        ChainState {
            beta,
            group_sd,
            group_effects,
        },
        ProposalScales {
            fixed,
            group_effects: group_effects_scales,
            log_sd,
        },
    )
}

/// Fixed-effect estimate ignoring grouping.
///
/// Log links use Poisson working weights, which also gives a consistent
/// risk-ratio start for binary outcomes.
fn irls_start(context: &ChainContext<'_>) -> Option<Vec<f64>> {
    let design = context.design;
    let n_rows = design.n_rows();

    if context.kind == LikelihoodKind::GaussianIdentity {
        let weights = (0..n_rows)
            .map(|row| context.kind.working_weight(0.0, context.standard_error(row)))
            .collect::<Vec<_>>();
        let response = design
            .outcome
            .iter()
            .zip(design.offset.iter())
            .map(|(y, offset)| y - offset)
            .collect::<Vec<_>>();
        return weighted_least_squares(&design.x, &weights, &response);
    }

    let mut beta = intercept_only_start(context);
    let mut weights = vec![0.0; n_rows];
    let mut response = vec![0.0; n_rows];
    for _ in 0..IRLS_MAX_ITERS {
        for row in 0..n_rows {
            let eta = context.fixed_eta(row, &beta).min(MAX_WORKING_ETA);
            let mu = eta.exp().max(MIN_WEIGHT);
            weights[row] = mu;
            response[row] = eta - design.offset[row] + (design.outcome[row] - mu) / mu;
        }
        let next = weighted_least_squares(&design.x, &weights, &response)?;
        let change = next
            .iter()
            .zip(beta.iter())
            .map(|(new, old)| (new - old).abs())
            .fold(0.0, f64::max);
        beta = next;
        if change < IRLS_TOLERANCE {
            break;
        }
    }
    beta.iter().all(|value| value.is_finite()).then_some(beta)
}

fn intercept_only_start(context: &ChainContext<'_>) -> Vec<f64> {
    let design = context.design;
    let n = usize_to_f64(design.n_rows().max(1));
    let mut beta = vec![0.0; design.n_coefficients()];
    let outcome_mean = mean(&design.outcome);
    let offset_mean = mean(&design.offset);
    beta[0] = match context.kind {
        LikelihoodKind::LogBinomial => outcome_mean.clamp(0.5 / n, 1.0 - 0.5 / n).ln() - offset_mean,
        LikelihoodKind::LogPoisson => outcome_mean.max(0.5 / n).ln() - offset_mean,
        LikelihoodKind::GaussianIdentity => {
            let (weighted, total) = (0..design.n_rows()).fold((0.0, 0.0), |(sum, total), row| {
                let weight = context.kind.working_weight(0.0, context.standard_error(row));
                (
                    weight.mul_add(design.outcome[row] - design.offset[row], sum),
                    total + weight,
                )
            });
            if total > 0.0 { weighted / total } else { 0.0 }
        }
    };
    beta
}

fn weighted_least_squares(x: &Mat<f64>, weights: &[f64], response: &[f64]) -> Option<Vec<f64>> {
    let p = x.ncols();
    let mut information = Mat::<f64>::zeros(p, p);
    let mut score = Mat::<f64>::zeros(p, 1);
    for row in 0..x.nrows() {
        for col_i in 0..p {
            let weighted = weights[row] * x[(row, col_i)];
            score[(col_i, 0)] += weighted * response[row];
            for col_j in 0..p {
                information[(col_i, col_j)] += weighted * x[(row, col_j)];
            }
        }
    }
    for diag in 0..p {
        information[(diag, diag)] += RIDGE_L2;
    }
    let solution = solve_linear_system(&information, &score).ok()?;
    Some((0..p).map(|row| solution[(row, 0)]).collect())
}

fn log_normal_density(value: f64, sd: f64) -> f64 {
    let z = value / sd;
    -0.5 * z.mul_add(z, std::f64::consts::TAU.ln()) - sd.ln()
}

fn random_walk_vector_into(output: &mut Vec<f64>, values: &[f64], scales: &[f64], rng: &mut StdRng) {
    output.clear();
    output.extend(
        values
            .iter()
            .zip(scales.iter())
            .map(|(value, scale)| scale.mul_add(sample_standard_normal(rng), *value)),
    );
}

fn should_accept(log_acceptance: f64, rng: &mut StdRng) -> bool {
    log_acceptance >= 0.0 || rng.random::<f64>().ln() < log_acceptance
}

fn dot_row(matrix: &Mat<f64>, row: usize, coefficients: &[f64]) -> f64 {
    (0..matrix.ncols())
        .map(|col| matrix[(row, col)] * coefficients[col])
        .sum()
}

fn sample_standard_normal(rng: &mut StdRng) -> f64 {
    let u1 = (1.0_f64 - rng.random::<f64>()).max(f64::MIN_POSITIVE);
    let u2 = rng.random::<f64>();
    (-2.0_f64 * u1.ln()).sqrt() * (std::f64::consts::TAU * u2).cos()
}
