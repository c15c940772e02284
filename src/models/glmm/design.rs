//! Compilation of a `ModelSpec` plus dataset into numeric design blocks.
//!
//! Coefficient naming:
//! - `Intercept` first, then fixed-effect columns in term declaration order,
//! - categorical variables expand to treatment-coded indicators
//!   `{variable}{level}` against the first sorted level,
//! - interaction columns join component names with `:`,
//! - group standard deviations are `sd_{factor}__{dimension}`,
//! - per-level deviations are `r_{factor}[{level},{dimension}]`.

use std::collections::{BTreeMap, BTreeSet};

use faer::Mat;

use crate::input::{Column, Dataset};
use crate::preprocess::column_has_variation;

use super::priors::{Prior, PriorTarget};
use super::spec::{Family, Link, ModelSpec, ModelSpecError, Term};

const CONSTANT_TOLERANCE: f64 = 1.0e-12;

/// Name of the intercept coefficient.
pub const INTERCEPT: &str = "Intercept";

/// One grouping factor compiled against the fitted rows.
#[derive(Debug, Clone)]
pub struct GroupDesign {
    pub factor: String,
    /// Sorted distinct levels.
    pub levels: Vec<String>,
    pub dimension_names: Vec<String>,
    /// Level index for every row.
    pub row_level: Vec<usize>,
    /// Rows belonging to each level.
    pub level_rows: Vec<Vec<usize>>,
    /// `n_rows x dimension` basis: 1 for the intercept, slope values otherwise.
    pub basis: Mat<f64>,
}

impl GroupDesign {
    #[must_use]
    pub fn dimension(&self) -> usize {
        self.dimension_names.len()
    }

    #[must_use]
    pub fn n_levels(&self) -> usize {
        self.levels.len()
    }

    #[must_use]
    pub fn sd_name(&self, dimension: usize) -> String {
        format!("sd_{}__{}", self.factor, self.dimension_names[dimension])
    }

    #[must_use]
    pub fn effect_name(&self, level: usize, dimension: usize) -> String {
        format!(
            "r_{}[{},{}]",
            self.factor, self.levels[level], self.dimension_names[dimension]
        )
    }
}

/// Naming metadata shared by a fit and everything that resolves its columns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesignInfo {
    /// Fixed-effect coefficient names, `Intercept` first.
    pub coefficient_names: Vec<String>,
    /// Term label each coefficient was expanded from (`Intercept` for the intercept).
    pub coefficient_terms: Vec<String>,
    /// Sorted levels of every categorical variable used in a fixed term.
    pub factor_levels: BTreeMap<String, Vec<String>>,
    /// Sorted levels of every grouping factor.
    pub group_levels: BTreeMap<String, Vec<String>>,
    /// Every posterior column in draw-matrix order.
    pub column_names: Vec<String>,
    pub n_rows: usize,
}

impl DesignInfo {
    /// Reference (omitted) level of a categorical fixed-effect variable.
    #[must_use]
    pub fn reference_level(&self, variable: &str) -> Option<&str> {
        self.factor_levels
            .get(variable)
            .and_then(|levels| levels.first())
            .map(String::as_str)
    }

    #[must_use]
    pub fn has_coefficient(&self, name: &str) -> bool {
        self.coefficient_names.iter().any(|coefficient| coefficient == name)
    }
}

/// Numeric blocks consumed by a posterior engine.
#[derive(Debug, Clone)]
pub struct CompiledDesign {
    pub info: DesignInfo,
    /// `n_rows x n_coefficients` fixed-effect design.
    pub x: Mat<f64>,
    pub outcome: Vec<f64>,
    /// Zero when the model has no offset.
    pub offset: Vec<f64>,
    /// Known standard errors for the Gaussian family.
    pub standard_errors: Option<Vec<f64>>,
    pub groups: Vec<GroupDesign>,
    pub family: Family,
    pub link: Link,
    /// Prior per fixed coefficient, aligned with `info.coefficient_names`.
    pub fixed_priors: Vec<Prior>,
    /// Prior per group standard deviation, `[group][dimension]`.
    pub group_sd_priors: Vec<Vec<Prior>>,
    pub keep_group_effects: bool,
}

impl CompiledDesign {
    #[must_use]
    pub fn n_rows(&self) -> usize {
        self.outcome.len()
    }

    #[must_use]
    pub fn n_coefficients(&self) -> usize {
        self.x.ncols()
    }
}

/// Validate `spec` against `dataset` and build the numeric design.
///
/// # Errors
///
/// Returns `ModelSpecError` for any specification or coefficient-level problem.
pub fn compile_design(spec: &ModelSpec, dataset: &Dataset) -> Result<CompiledDesign, ModelSpecError> {
    spec.validate(dataset)?;
    let n_rows = dataset.n_rows();

    let mut coefficient_names = vec![INTERCEPT.to_string()];
    let mut coefficient_terms = vec![INTERCEPT.to_string()];
    let mut columns = vec![vec![1.0; n_rows]];
    let mut factor_levels = BTreeMap::new();

    for term in &spec.fixed_terms {
        let label = term.label();
        for (name, values) in expand_term(dataset, term, &mut factor_levels)? {
            if coefficient_names.contains(&name) {
                return Err(ModelSpecError::DuplicateCoefficient(name));
            }
            if !column_has_variation(&values, CONSTANT_TOLERANCE) {
                return Err(ModelSpecError::ConstantColumn(name));
            }
            coefficient_names.push(name);
            coefficient_terms.push(label.clone());
            columns.push(values);
        }
    }

    let groups = spec
        .grouping
        .iter()
        .map(|grouping| {
            let column = lookup(dataset, &grouping.factor, "grouping factor")?;
            let levels = column.levels();
            let level_index = levels
                .iter()
                .enumerate()
                .map(|(idx, level)| (level.clone(), idx))
                .collect::<BTreeMap<_, _>>();
            let row_level = (0..n_rows)
                .map(|row| {
                    column
                        .label_at(row)
                        .and_then(|label| level_index.get(&label).copied())
                        .ok_or_else(|| ModelSpecError::MissingValues {
                            column: grouping.factor.clone(),
                            count: 1,
                        })
                })
                .collect::<Result<Vec<_>, _>>()?;
            let mut level_rows = vec![Vec::new(); levels.len()];
            for (row, level) in row_level.iter().copied().enumerate() {
                level_rows[level].push(row);
            }

            let slopes = grouping
                .slopes
                .iter()
                .map(|slope| dataset.numeric(slope).map_err(ModelSpecError::from))
                .collect::<Result<Vec<_>, _>>()?;
            let intercept_offset = usize::from(grouping.intercept);
            let basis = Mat::from_fn(n_rows, grouping.dimension(), |row, dim| {
                if grouping.intercept && dim == 0 {
                    1.0
                } else {
                    slopes[dim - intercept_offset][row]
                }
            });

            Ok(GroupDesign {
                factor: grouping.factor.clone(),
                levels,
                dimension_names: grouping.dimension_names(),
                row_level,
                level_rows,
                basis,
            })
        })
        .collect::<Result<Vec<_>, ModelSpecError>>()?;

    let fixed_priors = coefficient_names
        .iter()
        .zip(coefficient_terms.iter())
        .map(|(name, term)| {
            if name == INTERCEPT {
                spec.priors.intercept.clone()
            } else {
                spec.priors.fixed_prior(name, term).clone()
            }
        })
        .collect::<Vec<_>>();
    let group_sd_priors = groups
        .iter()
        .map(|group| {
            (0..group.dimension())
                .map(|dim| {
                    spec.priors
                        .by_term
                        .get(&group.sd_name(dim))
                        .unwrap_or(&spec.priors.group_sd)
                        .clone()
                })
                .collect::<Vec<_>>()
        })
        .collect::<Vec<_>>();
    validate_prior_keys(spec, &coefficient_names, &coefficient_terms, &groups)?;

    let mut column_names = coefficient_names.clone();
    for group in &groups {
        column_names.extend((0..group.dimension()).map(|dim| group.sd_name(dim)));
    }
    if spec.keep_group_effects {
        for group in &groups {
            for level in 0..group.n_levels() {
                column_names.extend((0..group.dimension()).map(|dim| group.effect_name(level, dim)));
            }
        }
    }

    let group_levels = groups
        .iter()
        .map(|group| (group.factor.clone(), group.levels.clone()))
        .collect();
    let x = Mat::from_fn(n_rows, columns.len(), |row, col| columns[col][row]);
    let outcome = dataset.numeric(&spec.outcome)?.to_vec();
    let offset = match &spec.offset {
        Some(name) => dataset.numeric(name)?.to_vec(),
        None => vec![0.0; n_rows],
    };
    let standard_errors = match &spec.family {
        Family::Gaussian { se_column } => Some(dataset.numeric(se_column)?.to_vec()),
        Family::Binomial | Family::Poisson => None,
    };

    Ok(CompiledDesign {
        info: DesignInfo {
            coefficient_names,
            coefficient_terms,
            factor_levels,
            group_levels,
            column_names,
            n_rows,
        },
        x,
        outcome,
        offset,
        standard_errors,
        groups,
        family: spec.family.clone(),
        link: spec.link,
        fixed_priors,
        group_sd_priors,
        keep_group_effects: spec.keep_group_effects,
    })
}

fn lookup<'d>(
    dataset: &'d Dataset,
    name: &str,
    role: &'static str,
) -> Result<&'d Column, ModelSpecError> {
    dataset.column(name).ok_or_else(|| ModelSpecError::MissingColumn {
        column: name.to_string(),
        role,
    })
}

/// Named columns contributed by one component variable.
fn expand_component(
    dataset: &Dataset,
    name: &str,
    factor_levels: &mut BTreeMap<String, Vec<String>>,
) -> Result<Vec<(String, Vec<f64>)>, ModelSpecError> {
    match lookup(dataset, name, "covariate")? {
        Column::Numeric(values) => Ok(vec![(name.to_string(), values.clone())]),
        column @ Column::Categorical(labels) => {
            let levels = column.levels();
            if levels.len() < 2 {
                return Err(ModelSpecError::SingleLevelFactor {
                    variable: name.to_string(),
                    levels: levels.len(),
                });
            }
            let expanded = levels
                .iter()
                .skip(1)
                .map(|level| {
                    let indicator = labels
                        .iter()
                        .map(|label| {
                            if label.as_deref() == Some(level.as_str()) {
                                1.0
                            } else {
                                0.0
                            }
                        })
                        .collect();
                    (format!("{name}{level}"), indicator)
                })
                .collect();
            factor_levels.insert(name.to_string(), levels);
            Ok(expanded)
        }
    }
}

fn expand_term(
    dataset: &Dataset,
    term: &Term,
    factor_levels: &mut BTreeMap<String, Vec<String>>,
) -> Result<Vec<(String, Vec<f64>)>, ModelSpecError> {
    let mut product: Vec<(String, Vec<f64>)> = vec![(String::new(), vec![1.0; dataset.n_rows()])];
    for component in term.components() {
        let expanded = expand_component(dataset, component, factor_levels)?;
        product = product
            .iter()
            .flat_map(|(left_name, left_values)| {
                expanded.iter().map(move |(right_name, right_values)| {
                    let name = if left_name.is_empty() {
                        right_name.clone()
                    } else {
                        format!("{left_name}:{right_name}")
                    };
                    let values = left_values
                        .iter()
                        .zip(right_values.iter())
                        .map(|(left, right)| left * right)
                        .collect();
                    (name, values)
                })
            })
            .collect();
    }
    Ok(product)
}

fn validate_prior_keys(
    spec: &ModelSpec,
    coefficient_names: &[String],
    coefficient_terms: &[String],
    groups: &[GroupDesign],
) -> Result<(), ModelSpecError> {
    let fixed_keys = coefficient_names
        .iter()
        .chain(coefficient_terms.iter())
        .filter(|name| name.as_str() != INTERCEPT)
        .map(String::as_str)
        .collect::<BTreeSet<_>>();
    let sd_keys = groups
        .iter()
        .flat_map(|group| (0..group.dimension()).map(|dim| group.sd_name(dim)))
        .collect::<BTreeSet<_>>();

    for (key, prior) in &spec.priors.by_term {
        let expected = if fixed_keys.contains(key.as_str()) {
            PriorTarget::FixedEffect
        } else if sd_keys.contains(key) {
            PriorTarget::GroupStdDev
        } else {
            return Err(ModelSpecError::UnknownPriorTerm(key.clone()));
        };
        if prior.applies_to() != expected {
            return Err(ModelSpecError::PriorTargetMismatch {
                name: key.clone(),
                expected,
                found: prior.applies_to(),
            });
        }
    }
    Ok(())
}
