use crate::model::construction::{DesignSchema, ModelLayout, build_design_matrix};
use crate::model::estimate::EstimationError;
use crate::model::irls::inverse_logit;
use crate::model::selection::CriterionKind;
use crate::model::terms::{Covariates, Term};
use ndarray::Array1;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

/// One named coefficient on the log-odds scale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Coefficient {
    pub name: String,
    pub estimate: f64,
    pub std_error: f64,
}

impl Coefficient {
    pub fn odds_ratio(&self) -> f64 {
        self.estimate.exp()
    }

    pub fn z_value(&self) -> f64 {
        self.estimate / self.std_error
    }
}

/// Scalar diagnostics of the final fit on the training partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitSummary {
    pub n_train: usize,
    pub log_likelihood: f64,
    pub deviance: f64,
    pub criterion: CriterionKind,
    pub criterion_value: f64,
    pub edf: usize,
    pub iterations: usize,
}

/// The persisted model: enough to rebuild the design matrix of new rows and
/// turn it into probabilities. Prior weights are always `total_teacher`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainedModel {
    pub terms: Vec<Term>,
    pub schema: DesignSchema,
    pub coefficients: Vec<Coefficient>,
    pub summary: FitSummary,
}

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Failed to read or write model file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML model file: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize model to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error(
        "Model file is inconsistent: its terms produce {expected} columns but it stores {found} coefficients."
    )]
    CoefficientCountMismatch { expected: usize, found: usize },
    #[error("Model file is inconsistent: column {index} is '{expected}' but the coefficient is named '{found}'.")]
    CoefficientNameMismatch {
        index: usize,
        expected: String,
        found: String,
    },
}

impl TrainedModel {
    /// Predicted match proportions for `rows`.
    ///
    /// Fails with [`EstimationError::UnknownLevel`] if a row carries a
    /// categorical level the model was not trained on.
    pub fn predict<R: Covariates>(&self, rows: &[R]) -> Result<Array1<f64>, EstimationError> {
        let (x, layout) = build_design_matrix(rows, &self.schema, &self.terms)?;
        if layout.total_coeffs != self.coefficients.len() {
            return Err(EstimationError::LayoutError(format!(
                "design has {} columns but the model has {} coefficients",
                layout.total_coeffs,
                self.coefficients.len()
            )));
        }
        Ok(x.dot(&self.coefficient_vector()).mapv(inverse_logit))
    }

    pub fn coefficient_vector(&self) -> Array1<f64> {
        self.coefficients.iter().map(|c| c.estimate).collect()
    }

    pub fn odds_ratios(&self) -> Vec<(String, f64)> {
        self.coefficients
            .iter()
            .map(|c| (c.name.clone(), c.odds_ratio()))
            .collect()
    }

    /// Saves the model to a TOML file.
    pub fn save(&self, path: &Path) -> Result<(), ModelError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        Ok(())
    }

    /// Loads a model from a TOML file and checks that its coefficients line up
    /// with the columns its terms produce.
    pub fn load(path: &Path) -> Result<Self, ModelError> {
        let toml_string = fs::read_to_string(path)?;
        let model: TrainedModel = toml::from_str(&toml_string)?;
        model.check_layout()?;
        Ok(model)
    }

    fn check_layout(&self) -> Result<(), ModelError> {
        let layout = ModelLayout::new(&self.schema, &self.terms);
        if layout.total_coeffs != self.coefficients.len() {
            return Err(ModelError::CoefficientCountMismatch {
                expected: layout.total_coeffs,
                found: self.coefficients.len(),
            });
        }
        for (index, (expected, coefficient)) in layout
            .column_names
            .iter()
            .zip(&self.coefficients)
            .enumerate()
        {
            if *expected != coefficient.name {
                return Err(ModelError::CoefficientNameMismatch {
                    index,
                    expected: expected.clone(),
                    found: coefficient.name.clone(),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::terms::{Coding, Factor, FactorLevels};
    use crate::data::SchoolType;
    use approx::assert_abs_diff_eq;
    use tempfile::tempdir;

    struct Row {
        share: f64,
        group: &'static str,
    }

    impl Covariates for Row {
        fn enroll_share(&self) -> f64 {
            self.share
        }
        fn total_teacher(&self) -> f64 {
            1.0
        }
        fn enroll_total(&self) -> f64 {
            100.0
        }
        fn elementary(&self) -> bool {
            true
        }
        fn school_type(&self) -> SchoolType {
            SchoolType::Tps
        }
        fn ethnic_group(&self) -> &str {
            self.group
        }
    }

    fn levels(factor: Factor, coding: Coding, levels: &[&str]) -> FactorLevels {
        FactorLevels::new(factor, coding, levels.iter().map(|s| s.to_string()).collect())
    }

    fn model() -> TrainedModel {
        TrainedModel {
            terms: vec![Term::new([Factor::EnrollShare]), Term::new([Factor::EthnicGroup])],
            schema: DesignSchema {
                elementary: levels(Factor::Elementary, Coding::Treatment, &["false", "true"]),
                school_type: levels(Factor::SchoolType, Coding::Treatment, &["Charter", "TPS"]),
                ethnic_group: levels(Factor::EthnicGroup, Coding::Sum, &["Asian", "White"]),
            },
            coefficients: vec![
                Coefficient {
                    name: "(Intercept)".into(),
                    estimate: -1.0,
                    std_error: 0.1,
                },
                Coefficient {
                    name: "enroll_share".into(),
                    estimate: 2.0,
                    std_error: 0.5,
                },
                Coefficient {
                    name: "ethnic_group[Asian]".into(),
                    estimate: 0.5,
                    std_error: 0.2,
                },
            ],
            summary: FitSummary {
                n_train: 10,
                log_likelihood: -5.0,
                deviance: 3.0,
                criterion: CriterionKind::Bic,
                criterion_value: 16.9,
                edf: 3,
                iterations: 4,
            },
        }
    }

    #[test]
    fn predict_applies_sum_coding() {
        let m = model();
        let rows = [
            Row { share: 0.5, group: "Asian" },
            Row { share: 0.5, group: "White" },
        ];
        let p = m.predict(&rows).unwrap();
        assert_abs_diff_eq!(p[0], inverse_logit(-1.0 + 1.0 + 0.5), epsilon = 1e-12);
        assert_abs_diff_eq!(p[1], inverse_logit(-1.0 + 1.0 - 0.5), epsilon = 1e-12);
    }

    #[test]
    fn unseen_level_fails_prediction() {
        let m = model();
        let err = m.predict(&[Row { share: 0.1, group: "Filipino" }]).unwrap_err();
        assert!(matches!(err, EstimationError::UnknownLevel { .. }));
    }

    #[test]
    fn odds_ratios_and_z_values() {
        let m = model();
        let ratios = m.odds_ratios();
        assert_eq!(ratios[1].0, "enroll_share");
        assert_abs_diff_eq!(ratios[1].1, 2f64.exp(), epsilon = 1e-12);
        assert_abs_diff_eq!(m.coefficients[2].z_value(), 2.5, epsilon = 1e-12);
    }

    #[test]
    fn save_and_load_preserve_the_model() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("model.toml");
        let m = model();
        m.save(&path).unwrap();
        let loaded = TrainedModel::load(&path).unwrap();
        assert_eq!(loaded, m);
    }

    #[test]
    fn load_rejects_mismatched_coefficients() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("model.toml");
        let mut m = model();
        m.coefficients.pop();
        m.save(&path).unwrap();
        let err = TrainedModel::load(&path).unwrap_err();
        assert!(matches!(
            err,
            ModelError::CoefficientCountMismatch { expected: 3, found: 2 }
        ));

        let mut renamed = model();
        renamed.coefficients[1].name = "total_teacher".into();
        renamed.save(&path).unwrap();
        let err = TrainedModel::load(&path).unwrap_err();
        assert!(matches!(err, ModelError::CoefficientNameMismatch { index: 1, .. }));
    }
}
