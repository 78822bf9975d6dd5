//! End-to-end analysis: load, aggregate, split, check, fit, evaluate and
//! visualize, reporting which stage failed.

use crate::aggregate::{Aggregation, AggregationReport, aggregate};
use crate::assumptions::{AssumptionError, AssumptionReport, check_assumptions};
use crate::config::{AnalysisConfig, ConfigError};
use crate::data::{DataError, load_raw_observations};
use crate::evaluate::{Evaluation, EvaluationError, evaluate};
use crate::model::estimate::{EstimationError, TrainingOutcome, train_model};
use crate::model::fitted::{ModelError, TrainedModel};
use crate::model::selection::{Criterion, SelectionStep};
use crate::partition::{Partition, PartitionError, partition};
use crate::visualize::{
    PredictionGrid, VisualizeError, build_prediction_grid, render_log_odds_plot,
    render_prediction_plot, write_grid_csv,
};
use serde::Serialize;
use std::fmt::{self, Write as _};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const MODEL_FILE: &str = "model.toml";
pub const REPORT_FILE: &str = "report.toml";
pub const GRID_FILE: &str = "prediction_grid.csv";
pub const PREDICTION_PLOT_FILE: &str = "predictions.svg";
pub const LOG_ODDS_PLOT_FILE: &str = "log_odds.svg";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Configure,
    Load,
    Aggregate,
    Partition,
    Assumptions,
    Fit,
    Evaluate,
    Visualize,
    Predict,
    Write,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Configure => "configure",
            Stage::Load => "load",
            Stage::Aggregate => "aggregate",
            Stage::Partition => "partition",
            Stage::Assumptions => "assumptions",
            Stage::Fit => "fit",
            Stage::Evaluate => "evaluate",
            Stage::Visualize => "visualize",
            Stage::Predict => "predict",
            Stage::Write => "write",
        })
    }
}

#[derive(Error, Debug)]
pub enum StageError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Data(#[from] DataError),
    #[error("No observations remain after aggregation.")]
    NoObservations,
    #[error(
        "{groups} aggregated groups have MatchValue + MismatchValue differing from TotalTeacher by more than {tolerance}."
    )]
    RateInconsistency { groups: usize, tolerance: f64 },
    #[error(transparent)]
    Partition(#[from] PartitionError),
    #[error(transparent)]
    Assumptions(#[from] AssumptionError),
    #[error(transparent)]
    Estimation(#[from] EstimationError),
    #[error(transparent)]
    Evaluation(#[from] EvaluationError),
    #[error(transparent)]
    Visualize(#[from] VisualizeError),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error("Failed to write '{path}': {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to serialize the report: {0}")]
    Report(#[from] toml::ser::Error),
    #[error("Failed to write predictions: {0}")]
    Csv(#[from] csv::Error),
}

#[derive(Error, Debug)]
#[error("{stage} stage failed: {source}")]
pub struct PipelineError {
    pub stage: Stage,
    #[source]
    pub source: StageError,
}

trait AtStage<T> {
    fn at(self, stage: Stage) -> Result<T, PipelineError>;
}

impl<T, E: Into<StageError>> AtStage<T> for Result<T, E> {
    fn at(self, stage: Stage) -> Result<T, PipelineError> {
        self.map_err(|e| PipelineError {
            stage,
            source: e.into(),
        })
    }
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> StageError + '_ {
    move |source| StageError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Everything the analysis produced.
#[derive(Debug, Clone)]
pub struct AnalysisReport {
    pub aggregation: AggregationReport,
    pub partition: Partition,
    pub assumptions: AssumptionReport,
    pub training: TrainingOutcome,
    pub evaluation: Evaluation,
    pub grid: PredictionGrid,
}

pub fn run_analysis(input: &Path, config: &AnalysisConfig) -> Result<AnalysisReport, PipelineError> {
    config.validate().at(Stage::Configure)?;

    log::info!("Loading {}", input.display());
    let raw = load_raw_observations(input).at(Stage::Load)?;

    let Aggregation {
        observations,
        report: aggregation,
    } = aggregate(&raw, config.rate_tolerance);
    if observations.is_empty() {
        return Err(StageError::NoObservations).at(Stage::Aggregate);
    }
    if config.strict_rates && aggregation.inconsistent_groups > 0 {
        return Err(StageError::RateInconsistency {
            groups: aggregation.inconsistent_groups,
            tolerance: config.rate_tolerance,
        })
        .at(Stage::Aggregate);
    }

    let split = partition(
        &observations,
        config.train_fraction,
        config.strata,
        config.seed,
    )
    .at(Stage::Partition)?;

    let assumptions =
        check_assumptions(&split.training, config.collinearity_threshold).at(Stage::Assumptions)?;

    let training = train_model(&split.training, &config.training_options()).at(Stage::Fit)?;

    let evaluation = evaluate(
        &training.model,
        &split.training,
        &split.holdout,
        &config.irls_options(),
    )
    .at(Stage::Evaluate)?;

    let grid = build_prediction_grid(&training.model, &split.training, config.grid_step)
        .at(Stage::Visualize)?;

    Ok(AnalysisReport {
        aggregation,
        partition: split,
        assumptions,
        training,
        evaluation,
        grid,
    })
}

#[derive(Serialize)]
struct DataSection {
    raw_rows: usize,
    groups: usize,
    dropped_undefined: usize,
    partially_defined_rows: usize,
    inconsistent_groups: usize,
    training_rows: usize,
    holdout_rows: usize,
}

#[derive(Serialize)]
struct FitSection {
    criterion: String,
    criterion_value: f64,
    log_likelihood: f64,
    null_log_likelihood: f64,
    mcfadden_r2: f64,
    deviance: f64,
    edf: usize,
    iterations: usize,
    terms: Vec<String>,
}

#[derive(Serialize)]
struct HoldoutSection {
    rows: usize,
    rmse: f64,
    r2: f64,
}

#[derive(Serialize)]
struct FlaggedPairSection {
    first: String,
    second: String,
    correlation: f64,
}

#[derive(Serialize)]
struct CorrelationSection {
    predictors: Vec<String>,
    matrix: Vec<Vec<f64>>,
    vif: Option<Vec<f64>>,
    flagged: Vec<FlaggedPairSection>,
}

#[derive(Serialize)]
struct LinearitySection {
    predictor: String,
    points: usize,
    excluded: usize,
    correlation: f64,
}

#[derive(Serialize)]
struct OddsRatioSection {
    name: String,
    estimate: f64,
    std_error: f64,
    odds_ratio: f64,
}

#[derive(Serialize)]
struct ReportFile<'a> {
    data: DataSection,
    fit: FitSection,
    holdout: HoldoutSection,
    correlation: CorrelationSection,
    linearity: Vec<LinearitySection>,
    selection: &'a [SelectionStep],
    odds_ratios: Vec<OddsRatioSection>,
}

impl<'a> ReportFile<'a> {
    fn new(report: &'a AnalysisReport) -> Self {
        let model = &report.training.model;
        let correlation = &report.assumptions.correlation;
        ReportFile {
            data: DataSection {
                raw_rows: report.aggregation.raw_rows,
                groups: report.aggregation.groups,
                dropped_undefined: report.aggregation.dropped_undefined,
                partially_defined_rows: report.aggregation.partially_defined_rows,
                inconsistent_groups: report.aggregation.inconsistent_groups,
                training_rows: report.partition.training.len(),
                holdout_rows: report.partition.holdout.len(),
            },
            fit: FitSection {
                criterion: model.summary.criterion.name().to_string(),
                criterion_value: model.summary.criterion_value,
                log_likelihood: model.summary.log_likelihood,
                null_log_likelihood: report.evaluation.null_log_likelihood,
                mcfadden_r2: report.evaluation.mcfadden_r2,
                deviance: model.summary.deviance,
                edf: model.summary.edf,
                iterations: model.summary.iterations,
                terms: model.terms.iter().map(|t| t.label()).collect(),
            },
            holdout: HoldoutSection {
                rows: report.evaluation.holdout_rows,
                rmse: report.evaluation.holdout_rmse,
                r2: report.evaluation.holdout_r2,
            },
            correlation: CorrelationSection {
                predictors: correlation.predictors.iter().map(|f| f.to_string()).collect(),
                matrix: correlation.matrix.rows().into_iter().map(|r| r.to_vec()).collect(),
                vif: correlation.vif.clone(),
                flagged: correlation
                    .flagged_pairs
                    .iter()
                    .map(|p| FlaggedPairSection {
                        first: p.first.to_string(),
                        second: p.second.to_string(),
                        correlation: p.correlation,
                    })
                    .collect(),
            },
            linearity: report
                .assumptions
                .linearity
                .iter()
                .map(|s| LinearitySection {
                    predictor: s.predictor.to_string(),
                    points: s.points.len(),
                    excluded: s.excluded,
                    correlation: s.correlation,
                })
                .collect(),
            selection: &report.training.selection.steps,
            odds_ratios: report
                .evaluation
                .odds_ratios
                .iter()
                .map(|o| OddsRatioSection {
                    name: o.name.clone(),
                    estimate: o.estimate,
                    std_error: o.std_error,
                    odds_ratio: o.odds_ratio,
                })
                .collect(),
        }
    }
}

/// Paths of the files written by [`write_outputs`].
#[derive(Debug, Clone)]
pub struct OutputFiles {
    pub model: PathBuf,
    pub report: PathBuf,
    pub grid: PathBuf,
    pub prediction_plot: PathBuf,
    pub log_odds_plot: PathBuf,
}

pub fn write_outputs(report: &AnalysisReport, output_dir: &Path) -> Result<OutputFiles, PipelineError> {
    fs::create_dir_all(output_dir)
        .map_err(io_error(output_dir))
        .at(Stage::Write)?;
    let files = OutputFiles {
        model: output_dir.join(MODEL_FILE),
        report: output_dir.join(REPORT_FILE),
        grid: output_dir.join(GRID_FILE),
        prediction_plot: output_dir.join(PREDICTION_PLOT_FILE),
        log_odds_plot: output_dir.join(LOG_ODDS_PLOT_FILE),
    };

    report.training.model.save(&files.model).at(Stage::Write)?;

    let report_text = toml::to_string_pretty(&ReportFile::new(report)).at(Stage::Write)?;
    fs::write(&files.report, report_text)
        .map_err(io_error(&files.report))
        .at(Stage::Write)?;

    write_grid_csv(&report.grid, &files.grid).at(Stage::Write)?;

    render_prediction_plot(
        &report.grid,
        &report.partition.training,
        &report.training.model.schema.ethnic_group.levels,
        &files.prediction_plot,
    )
    .at(Stage::Visualize)?;
    render_log_odds_plot(&report.assumptions.linearity, &files.log_odds_plot).at(Stage::Visualize)?;

    log::info!("Outputs written to {}", output_dir.display());
    Ok(files)
}

/// Human-readable summary of a run.
pub fn render_report(report: &AnalysisReport) -> String {
    let mut out = String::new();
    match write_report(&mut out, report) {
        Ok(()) => out,
        Err(_) => String::new(),
    }
}

fn write_report(out: &mut String, report: &AnalysisReport) -> fmt::Result {
    let correlation = &report.assumptions.correlation;
    let model = &report.training.model;
    let evaluation = &report.evaluation;

    writeln!(out, "Predictor correlation matrix")?;
    write!(out, "{:>16}", "")?;
    for p in &correlation.predictors {
        write!(out, "{:>16}", p.name())?;
    }
    writeln!(out, "{:>10}", "VIF")?;
    for (i, p) in correlation.predictors.iter().enumerate() {
        write!(out, "{:>16}", p.name())?;
        for j in 0..correlation.predictors.len() {
            write!(out, "{:>16.3}", correlation.matrix[[i, j]])?;
        }
        match &correlation.vif {
            Some(vif) => writeln!(out, "{:>10.3}", vif[i])?,
            None => writeln!(out, "{:>10}", "n/a")?,
        }
    }

    writeln!(
        out,
        "\nSelected terms ({} = {:.3}):",
        model.summary.criterion.name(),
        model.summary.criterion_value
    )?;
    for term in &model.terms {
        writeln!(out, "  {term}")?;
    }

    writeln!(
        out,
        "\n{:<48}{:>12}{:>12}{:>12}",
        "Coefficient", "Estimate", "Std. Error", "Odds ratio"
    )?;
    for o in &evaluation.odds_ratios {
        writeln!(
            out,
            "{:<48}{:>12.4}{:>12.4}{:>12.4}",
            o.name, o.estimate, o.std_error, o.odds_ratio
        )?;
    }

    writeln!(out, "\nMcFadden R²:  {:.4}", evaluation.mcfadden_r2)?;
    writeln!(
        out,
        "Holdout RMSE: {:.4} ({} rows)",
        evaluation.holdout_rmse, evaluation.holdout_rows
    )?;
    writeln!(out, "Holdout r²:   {:.4}", evaluation.holdout_r2)
}

#[derive(Serialize)]
struct PredictionRecord<'a> {
    cds_code: &'a str,
    school: &'a str,
    ethnic_group: &'a str,
    enroll_share: f64,
    total_teacher: f64,
    match_prop: f64,
    predicted: f64,
}

/// Aggregates a raw extract and writes the model's prediction for every
/// school/group row. Returns the number of rows written.
pub fn run_prediction(
    input: &Path,
    model_path: &Path,
    output: &Path,
    rate_tolerance: f64,
) -> Result<usize, PipelineError> {
    let model = TrainedModel::load(model_path).at(Stage::Load)?;
    let raw = load_raw_observations(input).at(Stage::Load)?;
    let rows = aggregate(&raw, rate_tolerance).observations;
    if rows.is_empty() {
        return Err(StageError::NoObservations).at(Stage::Aggregate);
    }

    let predicted = model.predict(&rows).at(Stage::Predict)?;

    let mut writer = csv::Writer::from_path(output).at(Stage::Write)?;
    for (row, p) in rows.iter().zip(predicted.iter()) {
        writer
            .serialize(PredictionRecord {
                cds_code: &row.school.cds_code,
                school: &row.school.school,
                ethnic_group: &row.ethnic_group,
                enroll_share: row.enroll_share,
                total_teacher: row.total_teacher,
                match_prop: row.match_prop,
                predicted: *p,
            })
            .at(Stage::Write)?;
    }
    writer.flush().map_err(io_error(output)).at(Stage::Write)?;
    log::info!("Wrote {} predictions to {}", rows.len(), output.display());
    Ok(rows.len())
}
