//! Model terms, factor levels and contrast coding.
//!
//! A [`Term`] is a set of [`Factor`]s; the main effect of a factor is the
//! one-element term and an interaction is the row-wise product of the column
//! blocks of its factors. Categorical factors are expanded through a contrast
//! matrix: treatment coding for the two-level institutional flags and
//! sum-to-zero (deviation) coding for the ethnic group, so that each group
//! coefficient reads as a deviation from the grand mean across groups.

use crate::aggregate::SchoolGroupObservation;
use crate::data::SchoolType;
use itertools::iproduct;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// The predictors a model row exposes. Implemented by real observations and
/// by the synthetic rows of the prediction grid.
pub trait Covariates {
    fn enroll_share(&self) -> f64;
    fn total_teacher(&self) -> f64;
    fn enroll_total(&self) -> f64;
    fn elementary(&self) -> bool;
    fn school_type(&self) -> SchoolType;
    fn ethnic_group(&self) -> &str;
}

impl Covariates for SchoolGroupObservation {
    fn enroll_share(&self) -> f64 {
        self.enroll_share
    }
    fn total_teacher(&self) -> f64 {
        self.total_teacher
    }
    fn enroll_total(&self) -> f64 {
        self.enroll_total
    }
    fn elementary(&self) -> bool {
        self.school.elementary
    }
    fn school_type(&self) -> SchoolType {
        self.school.school_type
    }
    fn ethnic_group(&self) -> &str {
        &self.ethnic_group
    }
}

/// A single predictor of the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Factor {
    EnrollShare,
    TotalTeacher,
    EnrollTotal,
    Elementary,
    SchoolType,
    EthnicGroup,
}

/// The value a factor takes on one row.
#[derive(Debug, Clone, PartialEq)]
pub enum FactorValue<'a> {
    Quantity(f64),
    Level(&'a str),
}

impl Factor {
    pub const QUANTITATIVE: [Factor; 3] =
        [Factor::EnrollShare, Factor::TotalTeacher, Factor::EnrollTotal];
    pub const INSTITUTIONAL: [Factor; 2] = [Factor::Elementary, Factor::SchoolType];

    pub fn name(self) -> &'static str {
        match self {
            Factor::EnrollShare => "enroll_share",
            Factor::TotalTeacher => "total_teacher",
            Factor::EnrollTotal => "enroll_total",
            Factor::Elementary => "elementary",
            Factor::SchoolType => "school_type",
            Factor::EthnicGroup => "ethnic_group",
        }
    }

    pub fn is_quantitative(self) -> bool {
        Self::QUANTITATIVE.contains(&self)
    }

    pub fn value<R: Covariates>(self, row: &R) -> FactorValue<'_> {
        match self {
            Factor::EnrollShare => FactorValue::Quantity(row.enroll_share()),
            Factor::TotalTeacher => FactorValue::Quantity(row.total_teacher()),
            Factor::EnrollTotal => FactorValue::Quantity(row.enroll_total()),
            Factor::Elementary => FactorValue::Level(flag_label(row.elementary())),
            Factor::SchoolType => FactorValue::Level(row.school_type().label()),
            Factor::EthnicGroup => FactorValue::Level(row.ethnic_group()),
        }
    }
}

impl fmt::Display for Factor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

pub fn flag_label(flag: bool) -> &'static str {
    if flag { "true" } else { "false" }
}

/// A main effect or interaction. Factors are kept sorted and unique.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Term {
    factors: Vec<Factor>,
}

impl Term {
    pub fn new(factors: impl IntoIterator<Item = Factor>) -> Self {
        let mut factors: Vec<Factor> = factors.into_iter().collect();
        factors.sort_unstable();
        factors.dedup();
        Self { factors }
    }

    pub fn factors(&self) -> &[Factor] {
        &self.factors
    }

    /// Interaction order: 1 for a main effect.
    pub fn order(&self) -> usize {
        self.factors.len()
    }

    /// Whether every factor of `other` also appears in `self`.
    pub fn contains(&self, other: &Term) -> bool {
        other.factors.iter().all(|f| self.factors.contains(f))
    }

    /// Whether `other` is a proper sub-term of `self`.
    pub fn strictly_contains(&self, other: &Term) -> bool {
        self.order() > other.order() && self.contains(other)
    }

    pub fn label(&self) -> String {
        self.factors
            .iter()
            .map(|f| f.name())
            .collect::<Vec<_>>()
            .join(":")
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

/// Canonical order: main effects first, then by factor order.
impl Ord for Term {
    fn cmp(&self, other: &Self) -> Ordering {
        self.order()
            .cmp(&other.order())
            .then_with(|| self.factors.cmp(&other.factors))
    }
}

impl PartialOrd for Term {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Every term of `(enroll_share + total_teacher + enroll_total) *
/// (elementary + school_type) * ethnic_group`, in canonical order.
pub fn full_interaction_scope() -> Vec<Term> {
    let quantitative = [None]
        .into_iter()
        .chain(Factor::QUANTITATIVE.map(Some));
    let institutional: Vec<Option<Factor>> = [None]
        .into_iter()
        .chain(Factor::INSTITUTIONAL.map(Some))
        .collect();
    let group = [None, Some(Factor::EthnicGroup)];

    let mut terms: Vec<Term> = iproduct!(quantitative, institutional, group)
        .map(|(q, i, g)| Term::new([q, i, g].into_iter().flatten()))
        .filter(|t| t.order() > 0)
        .collect();
    terms.sort();
    terms
}

/// How the levels of a categorical factor become design columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Coding {
    /// Indicator columns for every level but the first (the reference).
    Treatment,
    /// Deviation coding: identity on the first k-1 levels, the last level is
    /// coded -1 in every column.
    Sum,
}

/// The `k × (k-1)` contrast matrix for `levels` levels.
pub fn contrast_matrix(levels: usize, coding: Coding) -> Array2<f64> {
    let width = levels.saturating_sub(1);
    let mut contrasts = Array2::zeros((levels, width));
    match coding {
        Coding::Treatment => {
            for j in 0..width {
                contrasts[[j + 1, j]] = 1.0;
            }
        }
        Coding::Sum => {
            for j in 0..width {
                contrasts[[j, j]] = 1.0;
                contrasts[[levels - 1, j]] = -1.0;
            }
        }
    }
    contrasts
}

/// The observed levels of one categorical factor and their coding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactorLevels {
    pub factor: Factor,
    pub coding: Coding,
    pub levels: Vec<String>,
}

impl FactorLevels {
    pub fn new(factor: Factor, coding: Coding, levels: Vec<String>) -> Self {
        Self {
            factor,
            coding,
            levels,
        }
    }

    pub fn width(&self) -> usize {
        self.levels.len().saturating_sub(1)
    }

    pub fn index_of(&self, level: &str) -> Option<usize> {
        self.levels.iter().position(|l| l == level)
    }

    pub fn contrasts(&self) -> Array2<f64> {
        contrast_matrix(self.levels.len(), self.coding)
    }

    /// Names of the coded columns: the non-reference levels for treatment
    /// coding, all but the last level for sum coding.
    pub fn column_names(&self) -> Vec<String> {
        let named: &[String] = match self.coding {
            Coding::Treatment => self.levels.get(1..).unwrap_or(&[]),
            Coding::Sum => &self.levels[..self.width()],
        };
        named
            .iter()
            .map(|level| format!("{}[{}]", self.factor, level))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn full_scope_has_twenty_three_terms_in_canonical_order() {
        let scope = full_interaction_scope();
        assert_eq!(scope.len(), 23);
        assert_eq!(scope.iter().filter(|t| t.order() == 1).count(), 6);
        assert_eq!(scope.iter().filter(|t| t.order() == 2).count(), 11);
        assert_eq!(scope.iter().filter(|t| t.order() == 3).count(), 6);
        assert_eq!(scope[0].label(), "enroll_share");
        assert_eq!(scope[5].label(), "ethnic_group");
        assert!(scope.windows(2).all(|w| w[0] < w[1]));

        // No interactions inside a predictor group.
        assert!(!scope.contains(&Term::new([Factor::EnrollShare, Factor::TotalTeacher])));
        assert!(!scope.contains(&Term::new([Factor::Elementary, Factor::SchoolType])));
        assert!(scope.contains(&Term::new([
            Factor::EthnicGroup,
            Factor::EnrollTotal,
            Factor::SchoolType
        ])));
    }

    #[test]
    fn term_containment() {
        let three = Term::new([Factor::EnrollShare, Factor::Elementary, Factor::EthnicGroup]);
        let two = Term::new([Factor::EthnicGroup, Factor::EnrollShare]);
        assert!(three.contains(&two));
        assert!(three.strictly_contains(&two));
        assert!(!two.contains(&three));
        assert!(!three.strictly_contains(&three));
        assert_eq!(two.label(), "enroll_share:ethnic_group");
    }

    #[test]
    fn sum_contrasts_have_zero_column_sums() {
        let c = contrast_matrix(4, Coding::Sum);
        assert_eq!(
            c,
            array![
                [1.0, 0.0, 0.0],
                [0.0, 1.0, 0.0],
                [0.0, 0.0, 1.0],
                [-1.0, -1.0, -1.0]
            ]
        );
        for column in c.columns() {
            assert_eq!(column.sum(), 0.0);
        }
    }

    #[test]
    fn treatment_contrasts_use_first_level_as_reference() {
        let c = contrast_matrix(2, Coding::Treatment);
        assert_eq!(c, array![[0.0], [1.0]]);
    }

    #[test]
    fn column_names_follow_coding() {
        let groups = FactorLevels::new(
            Factor::EthnicGroup,
            Coding::Sum,
            vec!["Asian".into(), "Black".into(), "White".into()],
        );
        assert_eq!(
            groups.column_names(),
            vec!["ethnic_group[Asian]", "ethnic_group[Black]"]
        );
        let flag = FactorLevels::new(
            Factor::Elementary,
            Coding::Treatment,
            vec!["false".into(), "true".into()],
        );
        assert_eq!(flag.column_names(), vec!["elementary[true]"]);
        assert_eq!(flag.index_of("true"), Some(1));
        assert_eq!(flag.index_of("maybe"), None);
    }
}
