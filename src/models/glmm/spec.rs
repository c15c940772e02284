//! Model specification for hierarchical generalized linear models.

use std::collections::BTreeSet;
use std::fmt;

use thiserror::Error;

use crate::input::{Column, Dataset, InputError};

use super::priors::{PriorSet, PriorTarget};

/// Errors raised when a model specification does not match its dataset or
/// cannot be fitted.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ModelSpecError {
    #[error(transparent)]
    InvalidInput(#[from] InputError),
    #[error("{role} column `{column}` is not present in the dataset")]
    MissingColumn { column: String, role: &'static str },
    #[error("{role} column `{column}` must be numeric")]
    NonNumericColumn { column: String, role: &'static str },
    #[error("column `{column}` has {count} missing values; resolve them before fitting")]
    MissingValues { column: String, count: usize },
    #[error("column `{column}` has a non-finite value at row {row}: {value}")]
    NonFiniteValue { column: String, row: usize, value: f64 },
    #[error("categorical variable `{variable}` has {levels} distinct levels; at least 2 are required")]
    SingleLevelFactor { variable: String, levels: usize },
    #[error("grouping factor `{factor}` has {levels} distinct levels; at least 2 are required")]
    InsufficientGroupLevels { factor: String, levels: usize },
    #[error("no engine support for family `{family}` with link `{link}`")]
    UnsupportedFamilyLink { family: String, link: Link },
    #[error("interaction `{interaction}` references `{component}` without its main effect")]
    MissingMainEffect {
        interaction: String,
        component: String,
    },
    #[error("interaction terms need at least two distinct components")]
    InvalidInteraction,
    #[error("term `{0}` is declared more than once")]
    DuplicateTerm(String),
    #[error("grouping term for `{0}` declares no intercept and no slopes")]
    EmptyGroupingTerm(String),
    #[error("outcome `{column}` is invalid for the {family} family at row {row}: {value}")]
    InvalidOutcome {
        column: String,
        family: &'static str,
        row: usize,
        value: f64,
    },
    #[error("standard error at row {row} must be positive and finite; found {value}")]
    InvalidStandardError { row: usize, value: f64 },
    #[error("prior key `{0}` matches no term, coefficient, or group standard deviation")]
    UnknownPriorTerm(String),
    #[error("prior for `{name}` targets {found}; expected {expected}")]
    PriorTargetMismatch {
        name: String,
        expected: PriorTarget,
        found: PriorTarget,
    },
    #[error("coefficient name `{0}` is produced by more than one term")]
    DuplicateCoefficient(String),
    #[error("fixed-effect column `{0}` is constant in the fitted rows")]
    ConstantColumn(String),
    #[error("the dataset has no rows")]
    EmptyData,
}

/// A fixed-effect term.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Term {
    /// A single dataset column; categorical columns expand to indicators.
    Variable(String),
    /// Product of two or more columns, e.g. `treatment:sepsis`.
    Interaction(Vec<String>),
}

impl Term {
    #[must_use]
    pub fn variable(name: impl Into<String>) -> Self {
        Self::Variable(name.into())
    }

    #[must_use]
    pub fn interaction<S: AsRef<str>>(components: &[S]) -> Self {
        Self::Interaction(
            components
                .iter()
                .map(|component| component.as_ref().to_string())
                .collect(),
        )
    }

    /// Component column names in declaration order.
    #[must_use]
    pub fn components(&self) -> Vec<&str> {
        match self {
            Self::Variable(name) => vec![name.as_str()],
            Self::Interaction(components) => components.iter().map(String::as_str).collect(),
        }
    }

    /// `a` for a variable, `a:b` for an interaction.
    #[must_use]
    pub fn label(&self) -> String {
        self.components().join(":")
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Likelihood family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Family {
    /// 0/1 outcome.
    Binomial,
    /// Non-negative integer counts.
    Poisson,
    /// Normal outcome with known per-row standard errors in `se_column`.
    Gaussian { se_column: String },
}

impl Family {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Binomial => "binomial",
            Self::Poisson => "poisson",
            Self::Gaussian { .. } => "gaussian",
        }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Link function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Link {
    Log,
    Identity,
}

impl fmt::Display for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Log => write!(f, "log"),
            Self::Identity => write!(f, "identity"),
        }
    }
}

/// A `(1 + slopes | factor)` random-effects term.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupingTerm {
    pub factor: String,
    pub intercept: bool,
    pub slopes: Vec<String>,
}

impl GroupingTerm {
    /// Random intercept per level of `factor`.
    #[must_use]
    pub fn intercept(factor: impl Into<String>) -> Self {
        Self {
            factor: factor.into(),
            intercept: true,
            slopes: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_slope(mut self, variable: impl Into<String>) -> Self {
        self.slopes.push(variable.into());
        self
    }

    /// Drop the random intercept, keeping only slopes.
    #[must_use]
    pub const fn without_intercept(mut self) -> Self {
        self.intercept = false;
        self
    }

    #[must_use]
    pub fn dimension(&self) -> usize {
        usize::from(self.intercept) + self.slopes.len()
    }

    /// `Intercept` (if present) followed by slope names.
    #[must_use]
    pub fn dimension_names(&self) -> Vec<String> {
        let mut names = Vec::with_capacity(self.dimension());
        if self.intercept {
            names.push("Intercept".to_string());
        }
        names.extend(self.slopes.iter().cloned());
        names
    }
}

/// Declarative description of one hierarchical regression.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelSpec {
    pub outcome: String,
    pub fixed_terms: Vec<Term>,
    pub grouping: Vec<GroupingTerm>,
    pub family: Family,
    pub link: Link,
    pub priors: PriorSet,
    /// Column added to the linear predictor with coefficient fixed at 1.
    pub offset: Option<String>,
    /// Variables allowed inside interactions without a main effect.
    pub suppressed_main_effects: BTreeSet<String>,
    /// Keep per-level group deviations (`r_factor[level,dim]`) in the draws.
    pub keep_group_effects: bool,
}

impl ModelSpec {
    #[must_use]
    pub fn new(outcome: impl Into<String>, family: Family, link: Link) -> Self {
        Self {
            outcome: outcome.into(),
            fixed_terms: Vec::new(),
            grouping: Vec::new(),
            family,
            link,
            priors: PriorSet::default(),
            offset: None,
            suppressed_main_effects: BTreeSet::new(),
            keep_group_effects: false,
        }
    }

    /// Log-binomial model for a 0/1 outcome (risk-ratio scale).
    #[must_use]
    pub fn log_binomial(outcome: impl Into<String>) -> Self {
        Self::new(outcome, Family::Binomial, Link::Log)
    }

    #[must_use]
    pub fn with_term(mut self, term: Term) -> Self {
        self.fixed_terms.push(term);
        self
    }

    #[must_use]
    pub fn with_variable(self, name: impl Into<String>) -> Self {
        self.with_term(Term::variable(name))
    }

    #[must_use]
    pub fn with_interaction<S: AsRef<str>>(self, components: &[S]) -> Self {
        self.with_term(Term::interaction(components))
    }

    #[must_use]
    pub fn with_grouping(mut self, grouping: GroupingTerm) -> Self {
        self.grouping.push(grouping);
        self
    }

    #[must_use]
    pub fn with_priors(mut self, priors: PriorSet) -> Self {
        self.priors = priors;
        self
    }

    #[must_use]
    pub fn with_offset(mut self, column: impl Into<String>) -> Self {
        self.offset = Some(column.into());
        self
    }

    /// Allow `variable` inside interactions without its own coefficient.
    #[must_use]
    pub fn suppress_main_effect(mut self, variable: impl Into<String>) -> Self {
        self.suppressed_main_effects.insert(variable.into());
        self
    }

    #[must_use]
    pub const fn with_group_effects(mut self, keep: bool) -> Self {
        self.keep_group_effects = keep;
        self
    }

    /// Every dataset column the model reads, without duplicates.
    #[must_use]
    pub fn referenced_columns(&self) -> Vec<&str> {
        let mut seen = BTreeSet::new();
        let mut columns = Vec::new();
        for name in std::iter::once(self.outcome.as_str())
            .chain(self.fixed_terms.iter().flat_map(Term::components))
            .chain(self.grouping.iter().flat_map(|group| {
                std::iter::once(group.factor.as_str()).chain(group.slopes.iter().map(String::as_str))
            }))
            .chain(self.offset.as_deref())
            .chain(match &self.family {
                Family::Gaussian { se_column } => Some(se_column.as_str()),
                Family::Binomial | Family::Poisson => None,
            })
        {
            if seen.insert(name) {
                columns.push(name);
            }
        }
        columns
    }

    /// Check the specification against `dataset` before any fitting work.
    ///
    /// Coefficient-level checks (duplicate names, constant columns, prior
    /// keys) run when the design is compiled.
    ///
    /// # Errors
    ///
    /// Returns `ModelSpecError` for the first problem found.
    pub fn validate(&self, dataset: &Dataset) -> Result<(), ModelSpecError> {
        dataset.validate()?;
        if dataset.n_rows() == 0 {
            return Err(ModelSpecError::EmptyData);
        }
        self.validate_terms()?;
        self.validate_prior_targets()?;

        for column in self.referenced_columns() {
            let values = dataset
                .column(column)
                .ok_or_else(|| ModelSpecError::MissingColumn {
                    column: column.to_string(),
                    role: self.role_of(column),
                })?;
            let count = (0..values.len()).filter(|row| values.is_missing(*row)).count();
            if count > 0 {
                return Err(ModelSpecError::MissingValues {
                    column: column.to_string(),
                    count,
                });
            }
            if let Column::Numeric(numbers) = values
                && let Some((row, value)) = numbers
                    .iter()
                    .enumerate()
                    .find(|(_, value)| value.is_infinite())
            {
                return Err(ModelSpecError::NonFiniteValue {
                    column: column.to_string(),
                    row,
                    value: *value,
                });
            }
        }

        self.validate_outcome(dataset)?;
        self.validate_numeric_roles(dataset)?;

        for group in &self.grouping {
            let levels = dataset
                .column(&group.factor)
                .map_or(0, |column| column.levels().len());
            if levels < 2 {
                return Err(ModelSpecError::InsufficientGroupLevels {
                    factor: group.factor.clone(),
                    levels,
                });
            }
        }
        Ok(())
    }

    fn validate_terms(&self) -> Result<(), ModelSpecError> {
        let mut labels = BTreeSet::new();
        for term in &self.fixed_terms {
            if let Term::Interaction(components) = term {
                let distinct = components.iter().collect::<BTreeSet<_>>();
                if components.len() < 2 || distinct.len() != components.len() {
                    return Err(ModelSpecError::InvalidInteraction);
                }
            }
            if !labels.insert(term.label()) {
                return Err(ModelSpecError::DuplicateTerm(term.label()));
            }
        }

        let main_effects = self
            .fixed_terms
            .iter()
            .filter_map(|term| match term {
                Term::Variable(name) => Some(name.as_str()),
                Term::Interaction(_) => None,
            })
            .collect::<BTreeSet<_>>();
        for term in &self.fixed_terms {
            let Term::Interaction(components) = term else {
                continue;
            };
            for component in components {
                if !main_effects.contains(component.as_str())
                    && !self.suppressed_main_effects.contains(component)
                {
                    return Err(ModelSpecError::MissingMainEffect {
                        interaction: term.label(),
                        component: component.clone(),
                    });
                }
            }
        }

        for group in &self.grouping {
            if group.dimension() == 0 {
                return Err(ModelSpecError::EmptyGroupingTerm(group.factor.clone()));
            }
        }
        Ok(())
    }

    fn validate_prior_targets(&self) -> Result<(), ModelSpecError> {
        let expectations = [
            ("intercept", &self.priors.intercept, PriorTarget::Intercept),
            (
                "fixed-effect default",
                &self.priors.fixed_default,
                PriorTarget::FixedEffect,
            ),
            ("group standard deviation", &self.priors.group_sd, PriorTarget::GroupStdDev),
        ];
        for (name, prior, expected) in expectations {
            if prior.applies_to() != expected {
                return Err(ModelSpecError::PriorTargetMismatch {
                    name: name.to_string(),
                    expected,
                    found: prior.applies_to(),
                });
            }
        }
        Ok(())
    }

    fn validate_outcome(&self, dataset: &Dataset) -> Result<(), ModelSpecError> {
        let values = self.numeric_column(dataset, &self.outcome, "outcome")?;
        let family = self.family.name();
        let invalid = |row: usize, value: f64| ModelSpecError::InvalidOutcome {
            column: self.outcome.clone(),
            family,
            row,
            value,
        };
        for (row, value) in values.iter().copied().enumerate() {
            let valid = match self.family {
                Family::Binomial => value == 0.0 || value == 1.0,
                Family::Poisson => value >= 0.0 && value.is_finite() && value.fract() == 0.0,
                Family::Gaussian { .. } => value.is_finite(),
            };
            if !valid {
                return Err(invalid(row, value));
            }
        }

        if let Family::Gaussian { se_column } = &self.family {
            let errors = self.numeric_column(dataset, se_column, "standard error")?;
            if let Some((row, value)) = errors
                .iter()
                .copied()
                .enumerate()
                .find(|(_, value)| !(value.is_finite() && *value > 0.0))
            {
                return Err(ModelSpecError::InvalidStandardError { row, value });
            }
        }
        Ok(())
    }

    fn validate_numeric_roles(&self, dataset: &Dataset) -> Result<(), ModelSpecError> {
        if let Some(offset) = &self.offset {
            self.numeric_column(dataset, offset, "offset")?;
        }
        for group in &self.grouping {
            for slope in &group.slopes {
                self.numeric_column(dataset, slope, "random slope")?;
            }
        }
        Ok(())
    }

    fn numeric_column<'d>(
        &self,
        dataset: &'d Dataset,
        name: &str,
        role: &'static str,
    ) -> Result<&'d [f64], ModelSpecError> {
        match dataset.column(name) {
            Some(Column::Numeric(values)) => Ok(values),
            Some(Column::Categorical(_)) => Err(ModelSpecError::NonNumericColumn {
                column: name.to_string(),
                role,
            }),
            None => Err(ModelSpecError::MissingColumn {
                column: name.to_string(),
                role,
            }),
        }
    }

    fn role_of(&self, column: &str) -> &'static str {
        if column == self.outcome {
            "outcome"
        } else if self.grouping.iter().any(|group| group.factor == column) {
            "grouping factor"
        } else if self.offset.as_deref() == Some(column) {
            "offset"
        } else if matches!(&self.family, Family::Gaussian { se_column } if se_column == column) {
            "standard error"
        } else {
            "covariate"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trial_data() -> Dataset {
        Dataset::new()
            .with_numeric("death", vec![0.0, 1.0, 0.0, 1.0, 0.0, 0.0])
            .with_numeric("treatment", vec![0.0, 1.0, 0.0, 1.0, 1.0, 0.0])
            .with_categorical(
                "sepsis",
                vec![Some("no"), Some("yes"), Some("yes"), Some("no"), Some("no"), Some("yes")],
            )
            .with_categorical(
                "trial",
                vec![Some("A"), Some("A"), Some("B"), Some("B"), Some("C"), Some("C")],
            )
    }

    #[test]
    fn term_labels_join_components() {
        assert_eq!(Term::interaction(&["treatment", "sepsis"]).label(), "treatment:sepsis");
        assert_eq!(Term::variable("age").label(), "age");
    }

    #[test]
    fn accepts_a_well_formed_random_intercept_model() {
        let spec = ModelSpec::log_binomial("death")
            .with_variable("treatment")
            .with_variable("sepsis")
            .with_interaction(&["treatment", "sepsis"])
            .with_grouping(GroupingTerm::intercept("trial"));
        assert_eq!(spec.validate(&trial_data()), Ok(()));
    }

    #[test]
    fn rejects_interaction_without_main_effect() {
        let spec = ModelSpec::log_binomial("death")
            .with_variable("treatment")
            .with_interaction(&["treatment", "sepsis"]);
        assert_eq!(
            spec.validate(&trial_data()),
            Err(ModelSpecError::MissingMainEffect {
                interaction: "treatment:sepsis".to_string(),
                component: "sepsis".to_string(),
            })
        );
    }

    #[test]
    fn suppressed_main_effects_are_allowed_in_interactions() {
        let spec = ModelSpec::log_binomial("death")
            .with_variable("treatment")
            .with_interaction(&["treatment", "sepsis"])
            .suppress_main_effect("sepsis");
        assert_eq!(spec.validate(&trial_data()), Ok(()));
    }

    #[test]
    fn rejects_grouping_factor_with_one_level() {
        let data = trial_data().with_categorical("site", vec![Some("x"); 6]);
        let spec = ModelSpec::log_binomial("death")
            .with_variable("treatment")
            .with_grouping(GroupingTerm::intercept("site"));
        assert_eq!(
            spec.validate(&data),
            Err(ModelSpecError::InsufficientGroupLevels {
                factor: "site".to_string(),
                levels: 1
            })
        );
    }

    #[test]
    fn rejects_unknown_grouping_column() {
        let spec = ModelSpec::log_binomial("death").with_grouping(GroupingTerm::intercept("site"));
        assert!(matches!(
            spec.validate(&trial_data()),
            Err(ModelSpecError::MissingColumn {
                role: "grouping factor",
                ..
            })
        ));
    }

    #[test]
    fn rejects_non_binary_outcome_for_binomial_family() {
        let data = trial_data().with_numeric("death", vec![0.0, 2.0, 0.0, 1.0, 0.0, 0.0]);
        let spec = ModelSpec::log_binomial("death").with_variable("treatment");
        assert!(matches!(
            spec.validate(&data),
            Err(ModelSpecError::InvalidOutcome { row: 1, .. })
        ));
    }

    #[test]
    fn rejects_missing_covariate_values() {
        let data = trial_data().with_numeric(
            "treatment",
            vec![0.0, 1.0, f64::NAN, 1.0, 1.0, 0.0],
        );
        let spec = ModelSpec::log_binomial("death").with_variable("treatment");
        assert_eq!(
            spec.validate(&data),
            Err(ModelSpecError::MissingValues {
                column: "treatment".to_string(),
                count: 1
            })
        );
    }

    #[test]
    fn rejects_infinite_covariate_values() {
        let data = trial_data().with_numeric(
            "age",
            vec![61.0, 72.0, f64::INFINITY, 80.0, 67.0, 70.0],
        );
        let spec = ModelSpec::log_binomial("death")
            .with_variable("treatment")
            .with_variable("age");
        assert_eq!(
            spec.validate(&data),
            Err(ModelSpecError::NonFiniteValue {
                column: "age".to_string(),
                row: 2,
                value: f64::INFINITY
            })
        );
    }

    #[test]
    fn rejects_non_positive_standard_errors() {
        let data = Dataset::new()
            .with_numeric("log_rr", vec![-0.1, 0.05])
            .with_numeric("se", vec![0.1, 0.0]);
        let spec = ModelSpec::new(
            "log_rr",
            Family::Gaussian {
                se_column: "se".to_string(),
            },
            Link::Identity,
        );
        assert_eq!(
            spec.validate(&data),
            Err(ModelSpecError::InvalidStandardError { row: 1, value: 0.0 })
        );
    }

    #[test]
    fn rejects_duplicate_terms() {
        let spec = ModelSpec::log_binomial("death")
            .with_variable("treatment")
            .with_variable("treatment");
        assert_eq!(
            spec.validate(&trial_data()),
            Err(ModelSpecError::DuplicateTerm("treatment".to_string()))
        );
    }

    #[test]
    fn referenced_columns_are_unique_and_ordered() {
        let spec = ModelSpec::log_binomial("death")
            .with_variable("treatment")
            .with_variable("sepsis")
            .with_interaction(&["treatment", "sepsis"])
            .with_grouping(GroupingTerm::intercept("trial").with_slope("treatment"));
        assert_eq!(
            spec.referenced_columns(),
            vec!["death", "treatment", "sepsis", "trial"]
        );
    }
}
