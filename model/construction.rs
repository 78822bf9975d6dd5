use crate::data::SchoolType;
use crate::model::estimate::EstimationError;
use crate::model::terms::{
    Coding, Covariates, Factor, FactorLevels, FactorValue, Term, flag_label,
};
use ndarray::{Array1, Array2, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::ops::Range;

/// Levels and codings of the categorical factors, fixed at training time and
/// reused verbatim at prediction time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DesignSchema {
    pub elementary: FactorLevels,
    pub school_type: FactorLevels,
    pub ethnic_group: FactorLevels,
}

impl DesignSchema {
    /// Collects the levels present in `rows`, in sorted order.
    pub fn from_rows<R: Covariates>(rows: &[R]) -> Self {
        let elementary: BTreeSet<bool> = rows.iter().map(|r| r.elementary()).collect();
        let school_type: BTreeSet<SchoolType> = rows.iter().map(|r| r.school_type()).collect();
        let ethnic_group: BTreeSet<&str> = rows.iter().map(|r| r.ethnic_group()).collect();

        Self {
            elementary: FactorLevels::new(
                Factor::Elementary,
                Coding::Treatment,
                elementary.into_iter().map(|f| flag_label(f).to_string()).collect(),
            ),
            school_type: FactorLevels::new(
                Factor::SchoolType,
                Coding::Treatment,
                school_type.into_iter().map(|s| s.label().to_string()).collect(),
            ),
            ethnic_group: FactorLevels::new(
                Factor::EthnicGroup,
                Coding::Sum,
                ethnic_group.into_iter().map(str::to_string).collect(),
            ),
        }
    }

    pub fn levels(&self, factor: Factor) -> Option<&FactorLevels> {
        match factor {
            Factor::Elementary => Some(&self.elementary),
            Factor::SchoolType => Some(&self.school_type),
            Factor::EthnicGroup => Some(&self.ethnic_group),
            _ => None,
        }
    }

    /// Number of design columns contributed by a factor on its own.
    pub fn factor_width(&self, factor: Factor) -> usize {
        self.levels(factor).map_or(1, FactorLevels::width)
    }

    /// A term is estimable only if each of its categorical factors has at
    /// least two observed levels.
    pub fn supports(&self, term: &Term) -> bool {
        term.factors().iter().all(|&f| self.factor_width(f) > 0)
    }

    fn factor_names(&self, factor: Factor) -> Vec<String> {
        match self.levels(factor) {
            Some(levels) => levels.column_names(),
            None => vec![factor.name().to_string()],
        }
    }

    /// Column names of a term; the first factor varies fastest.
    pub fn term_column_names(&self, term: &Term) -> Vec<String> {
        term.factors()
            .iter()
            .fold(vec![String::new()], |acc, &factor| {
                let names = self.factor_names(factor);
                names
                    .iter()
                    .flat_map(|name| {
                        acc.iter().map(move |prefix| {
                            if prefix.is_empty() {
                                name.clone()
                            } else {
                                format!("{prefix}:{name}")
                            }
                        })
                    })
                    .collect()
            })
    }

    /// The `n × width` block of one factor.
    fn factor_block<R: Covariates>(
        &self,
        factor: Factor,
        rows: &[R],
    ) -> Result<Array2<f64>, EstimationError> {
        let mut block = Array2::zeros((rows.len(), self.factor_width(factor)));
        let levels = self.levels(factor);
        let contrasts = levels.map(FactorLevels::contrasts);

        for (i, row) in rows.iter().enumerate() {
            match (factor.value(row), levels, contrasts.as_ref()) {
                (FactorValue::Quantity(v), _, _) => block[[i, 0]] = v,
                (FactorValue::Level(label), Some(levels), Some(contrasts)) => {
                    let idx = levels
                        .index_of(label)
                        .ok_or_else(|| EstimationError::UnknownLevel {
                            factor: factor.name().to_string(),
                            level: label.to_string(),
                        })?;
                    block.row_mut(i).assign(&contrasts.row(idx));
                }
                (FactorValue::Level(_), _, _) => {
                    return Err(EstimationError::LayoutError(format!(
                        "no levels recorded for categorical factor '{factor}'"
                    )));
                }
            }
        }
        Ok(block)
    }

    /// The `n × width` block of one term: row-wise products of the factor
    /// blocks, first factor varying fastest.
    pub fn term_block<R: Covariates>(
        &self,
        term: &Term,
        rows: &[R],
    ) -> Result<Array2<f64>, EstimationError> {
        let n = rows.len();
        let mut block = Array2::ones((n, 1));
        for &factor in term.factors() {
            let next = self.factor_block(factor, rows)?;
            let (current_width, next_width) = (block.ncols(), next.ncols());
            let mut product = Array2::zeros((n, current_width * next_width));
            for j_next in 0..next_width {
                for j_cur in 0..current_width {
                    let column = &block.column(j_cur) * &next.column(j_next);
                    product
                        .column_mut(j_next * current_width + j_cur)
                        .assign(&column);
                }
            }
            block = product;
        }
        Ok(block)
    }
}

/// Where one term's coefficients live in the design matrix.
#[derive(Clone, Debug, PartialEq)]
pub struct TermBlock {
    pub term: Term,
    pub col_range: Range<usize>,
}

/// Holds the layout of the design matrix `X`: the intercept in column 0, then
/// one contiguous block per term in the given order.
#[derive(Clone, Debug, PartialEq)]
pub struct ModelLayout {
    pub intercept_col: usize,
    pub blocks: Vec<TermBlock>,
    pub column_names: Vec<String>,
    pub total_coeffs: usize,
}

impl ModelLayout {
    pub fn new(schema: &DesignSchema, terms: &[Term]) -> Self {
        let mut column_names = vec!["(Intercept)".to_string()];
        let mut blocks = Vec::with_capacity(terms.len());
        let mut current_col = 1;
        for term in terms {
            let names = schema.term_column_names(term);
            let range = current_col..current_col + names.len();
            current_col = range.end;
            column_names.extend(names);
            blocks.push(TermBlock {
                term: term.clone(),
                col_range: range,
            });
        }
        Self {
            intercept_col: 0,
            blocks,
            column_names,
            total_coeffs: current_col,
        }
    }

    /// Column indices of the sub-model made of the intercept and `terms`.
    /// Terms not in the layout are ignored.
    pub fn columns_for(&self, terms: &[Term]) -> Vec<usize> {
        let mut cols = vec![self.intercept_col];
        for block in &self.blocks {
            if terms.contains(&block.term) {
                cols.extend(block.col_range.clone());
            }
        }
        cols
    }
}

/// Constructs the design matrix for `terms` (intercept first) and its layout.
pub fn build_design_matrix<R: Covariates>(
    rows: &[R],
    schema: &DesignSchema,
    terms: &[Term],
) -> Result<(Array2<f64>, ModelLayout), EstimationError> {
    let layout = ModelLayout::new(schema, terms);
    let mut blocks: Vec<Array2<f64>> = Vec::with_capacity(terms.len() + 1);
    blocks.push(Array2::ones((rows.len(), 1)));
    for term in terms {
        blocks.push(schema.term_block(term, rows)?);
    }

    let views: Vec<ArrayView2<f64>> = blocks.iter().map(Array2::view).collect();
    let x = ndarray::concatenate(Axis(1), &views)
        .map_err(|e| EstimationError::LayoutError(format!("failed to stack design blocks: {e}")))?;

    if x.ncols() != layout.total_coeffs {
        return Err(EstimationError::LayoutError(format!(
            "design matrix has {} columns but the layout expects {}",
            x.ncols(),
            layout.total_coeffs
        )));
    }
    Ok((x, layout))
}

/// The response (`match_prop`) and prior weights (`total_teacher`) of
/// training rows.
pub fn response_and_weights(
    rows: &[crate::aggregate::SchoolGroupObservation],
) -> (Array1<f64>, Array1<f64>) {
    let y = rows.iter().map(|r| r.match_prop).collect();
    let w = rows.iter().map(|r| r.total_teacher).collect();
    (y, w)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::SchoolGroupObservation;
    use crate::data::SchoolId;
    use approx::assert_abs_diff_eq;

    fn row(group: &str, elementary: bool, school_type: SchoolType, share: f64) -> SchoolGroupObservation {
        SchoolGroupObservation {
            school: SchoolId {
                cds_code: "1".into(),
                district_code: "2".into(),
                school_code: "3".into(),
                county: "C".into(),
                district: "D".into(),
                school: "S".into(),
                school_type,
                elementary,
            },
            ethnic_group: group.to_string(),
            enroll_count: 10.0,
            match_rate: 0.4,
            mismatch_rate: 0.6,
            total_teacher: 1.0,
            enroll_total: 200.0,
            enroll_share: share,
            match_prop: 0.4,
        }
    }

    fn sample_rows() -> Vec<SchoolGroupObservation> {
        vec![
            row("Asian", true, SchoolType::Tps, 0.1),
            row("Black", false, SchoolType::Charter, 0.2),
            row("White", true, SchoolType::Charter, 0.3),
        ]
    }

    #[test]
    fn schema_collects_sorted_levels() {
        let schema = DesignSchema::from_rows(&sample_rows());
        assert_eq!(schema.elementary.levels, vec!["false", "true"]);
        assert_eq!(schema.school_type.levels, vec!["Charter", "TPS"]);
        assert_eq!(schema.ethnic_group.levels, vec!["Asian", "Black", "White"]);
        assert_eq!(schema.factor_width(Factor::EthnicGroup), 2);
        assert_eq!(schema.factor_width(Factor::EnrollShare), 1);
    }

    #[test]
    fn interaction_columns_are_products_with_first_factor_fastest() {
        let rows = sample_rows();
        let schema = DesignSchema::from_rows(&rows);
        let term = Term::new([Factor::EnrollShare, Factor::EthnicGroup]);
        assert_eq!(
            schema.term_column_names(&term),
            vec![
                "enroll_share:ethnic_group[Asian]",
                "enroll_share:ethnic_group[Black]"
            ]
        );
        let block = schema.term_block(&term, &rows).unwrap();
        assert_eq!(block.dim(), (3, 2));
        assert_abs_diff_eq!(block[[0, 0]], 0.1, epsilon = 1e-12);
        assert_abs_diff_eq!(block[[0, 1]], 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(block[[1, 1]], 0.2, epsilon = 1e-12);
        // The last level is coded -1 in every sum-coded column.
        assert_abs_diff_eq!(block[[2, 0]], -0.3, epsilon = 1e-12);
        assert_abs_diff_eq!(block[[2, 1]], -0.3, epsilon = 1e-12);
    }

    #[test]
    fn design_matrix_matches_layout() {
        let rows = sample_rows();
        let schema = DesignSchema::from_rows(&rows);
        let terms = vec![
            Term::new([Factor::EnrollShare]),
            Term::new([Factor::SchoolType]),
            Term::new([Factor::Elementary, Factor::EthnicGroup]),
        ];
        let (x, layout) = build_design_matrix(&rows, &schema, &terms).unwrap();
        assert_eq!(x.dim(), (3, 1 + 1 + 1 + 2));
        assert_eq!(layout.total_coeffs, 5);
        assert_eq!(layout.column_names[2], "school_type[TPS]");
        assert_eq!(layout.column_names[3], "elementary[true]:ethnic_group[Asian]");
        assert_eq!(layout.columns_for(&terms[..1]), vec![0, 1]);
        assert_eq!(layout.columns_for(&terms[2..]), vec![0, 3, 4]);
        assert!(x.column(0).iter().all(|&v| v == 1.0));
        assert_eq!(x[[0, 2]], 1.0);
        assert_eq!(x[[1, 2]], 0.0);
    }

    #[test]
    fn unknown_level_is_reported() {
        let rows = sample_rows();
        let schema = DesignSchema::from_rows(&rows);
        let stranger = vec![row("Filipino", true, SchoolType::Tps, 0.5)];
        let err = build_design_matrix(&stranger, &schema, &[Term::new([Factor::EthnicGroup])])
            .unwrap_err();
        assert!(matches!(err, EstimationError::UnknownLevel { .. }));
    }

    #[test]
    fn single_level_factors_are_not_supported() {
        let rows = vec![
            row("Asian", true, SchoolType::Tps, 0.1),
            row("Black", true, SchoolType::Tps, 0.2),
        ];
        let schema = DesignSchema::from_rows(&rows);
        assert!(!schema.supports(&Term::new([Factor::SchoolType])));
        assert!(schema.supports(&Term::new([Factor::EnrollShare, Factor::EthnicGroup])));
    }
}
