//! Run configuration, loadable from TOML and overridable from the command line.

use crate::model::estimate::TrainingOptions;
use crate::model::irls::IrlsOptions;
use crate::model::selection::{CriterionKind, Direction};
use crate::visualize::steps_per_unit;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid configuration: {field} {message}")]
    Invalid {
        field: &'static str,
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AnalysisConfig {
    pub seed: u64,
    pub train_fraction: f64,
    /// Number of response quantile bins used to stratify the split.
    pub strata: usize,
    pub criterion: CriterionKind,
    pub direction: Direction,
    pub max_iterations: usize,
    pub convergence_tolerance: f64,
    pub grid_step: f64,
    /// Absolute correlation above which a predictor pair is flagged.
    pub collinearity_threshold: f64,
    /// Allowed gap between `match + mismatch` and the reported total rate.
    pub rate_tolerance: f64,
    /// Fail instead of warn when aggregated rates are inconsistent.
    pub strict_rates: bool,
    pub output_dir: PathBuf,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            train_fraction: 0.8,
            strata: 5,
            criterion: CriterionKind::Bic,
            direction: Direction::Both,
            max_iterations: 25,
            convergence_tolerance: 1e-8,
            grid_step: 0.01,
            collinearity_threshold: 0.8,
            rate_tolerance: 0.05,
            strict_rates: false,
            output_dir: PathBuf::from("output"),
        }
    }
}

impl AnalysisConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: AnalysisConfig = toml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field, message: &str| {
            Err(ConfigError::Invalid {
                field,
                message: message.to_string(),
            })
        };
        if !(self.train_fraction > 0.0 && self.train_fraction < 1.0) {
            return invalid("train_fraction", "must lie strictly between 0 and 1");
        }
        if self.strata == 0 {
            return invalid("strata", "must be at least 1");
        }
        if self.max_iterations == 0 {
            return invalid("max_iterations", "must be at least 1");
        }
        if !(self.convergence_tolerance > 0.0 && self.convergence_tolerance.is_finite()) {
            return invalid("convergence_tolerance", "must be a positive number");
        }
        if steps_per_unit(self.grid_step).is_none() {
            return invalid("grid_step", "must lie in (0, 1] and divide 1");
        }
        if !(0.0..=1.0).contains(&self.collinearity_threshold) {
            return invalid("collinearity_threshold", "must lie in [0, 1]");
        }
        if !(self.rate_tolerance >= 0.0 && self.rate_tolerance.is_finite()) {
            return invalid("rate_tolerance", "must be a non-negative number");
        }
        Ok(())
    }

    pub fn irls_options(&self) -> IrlsOptions {
        IrlsOptions {
            max_iterations: self.max_iterations,
            convergence_tolerance: self.convergence_tolerance,
        }
    }

    pub fn training_options(&self) -> TrainingOptions {
        TrainingOptions {
            irls: self.irls_options(),
            criterion: self.criterion,
            direction: self.direction,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn partial_file_keeps_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "seed = 7\ncriterion = \"aic\"\ndirection = \"backward\"").unwrap();
        let config = AnalysisConfig::load(file.path()).unwrap();
        assert_eq!(config.seed, 7);
        assert_eq!(config.criterion, CriterionKind::Aic);
        assert_eq!(config.direction, Direction::Backward);
        assert_eq!(config.train_fraction, 0.8);
        assert_eq!(config.output_dir, PathBuf::from("output"));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "sead = 7").unwrap();
        assert!(matches!(
            AnalysisConfig::load(file.path()),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn validation_catches_bad_values() {
        let config = AnalysisConfig {
            train_fraction: 1.0,
            ..AnalysisConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "train_fraction", .. })
        ));
        for grid_step in [0.0, 0.4, 0.7] {
            let config = AnalysisConfig {
                grid_step,
                ..AnalysisConfig::default()
            };
            assert!(matches!(
                config.validate(),
                Err(ConfigError::Invalid { field: "grid_step", .. })
            ));
        }
        assert!(AnalysisConfig::default().validate().is_ok());
    }

    #[test]
    fn options_follow_config() {
        let config = AnalysisConfig {
            max_iterations: 50,
            direction: Direction::Forward,
            ..AnalysisConfig::default()
        };
        let options = config.training_options();
        assert_eq!(options.irls.max_iterations, 50);
        assert_eq!(options.direction, Direction::Forward);
        assert_eq!(options.criterion, CriterionKind::Bic);
    }
}
