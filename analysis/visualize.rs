//! Prediction grid and SVG plots.
//!
//! The grid sweeps `enroll_share` over `[0, 1]` for every combination of
//! ethnic group, school type and elementary flag seen in training, holding the
//! other quantitative predictors at their training means.

use crate::aggregate::SchoolGroupObservation;
use crate::assumptions::LogitSeries;
use crate::data::{SchoolType, parse_flag};
use crate::model::estimate::EstimationError;
use crate::model::fitted::TrainedModel;
use crate::model::terms::Covariates;
use plotters::prelude::*;
use serde::Serialize;
use std::fmt::Display;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum VisualizeError {
    #[error("Grid step must lie in (0, 1] and divide 1, got {0}.")]
    InvalidStep(f64),
    #[error("Cannot build a prediction grid without training rows.")]
    NoTrainingRows,
    #[error("Model level '{0}' cannot be mapped back to a covariate value.")]
    UnmappableLevel(String),
    #[error("Prediction over the grid failed: {0}")]
    Prediction(#[from] EstimationError),
    #[error("Failed to write the grid CSV: {0}")]
    Csv(#[from] csv::Error),
    #[error("Failed to render plot: {0}")]
    Render(String),
}

fn render_error<E: Display>(e: E) -> VisualizeError {
    VisualizeError::Render(e.to_string())
}

/// One synthetic covariate pattern and its predicted match proportion.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GridPoint {
    pub ethnic_group: String,
    pub school_type: SchoolType,
    pub elementary: bool,
    pub enroll_share: f64,
    pub total_teacher: f64,
    pub enroll_total: f64,
    pub predicted: f64,
}

impl Covariates for GridPoint {
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
        self.elementary
    }
    fn school_type(&self) -> SchoolType {
        self.school_type
    }
    fn ethnic_group(&self) -> &str {
        &self.ethnic_group
    }
}

#[derive(Debug, Clone)]
pub struct PredictionGrid {
    pub points: Vec<GridPoint>,
    pub mean_total_teacher: f64,
    pub mean_enroll_total: f64,
}

/// Number of grid intervals for `step`, if `step` divides 1.
pub fn steps_per_unit(step: f64) -> Option<usize> {
    if !(step > 0.0 && step <= 1.0) {
        return None;
    }
    let n = (1.0 / step).round();
    ((n * step - 1.0).abs() <= 1e-9).then_some(n as usize)
}

/// `0, step, 2·step, …, 1`. The step must divide 1.
pub fn grid_shares(step: f64) -> Result<Vec<f64>, VisualizeError> {
    let n = steps_per_unit(step).ok_or(VisualizeError::InvalidStep(step))?;
    let mut shares: Vec<f64> = (0..=n).map(|i| (i as f64 * step).min(1.0)).collect();
    if let Some(last) = shares.last_mut() {
        *last = 1.0;
    }
    Ok(shares)
}

pub fn build_prediction_grid(
    model: &TrainedModel,
    training: &[SchoolGroupObservation],
    step: f64,
) -> Result<PredictionGrid, VisualizeError> {
    if training.is_empty() {
        return Err(VisualizeError::NoTrainingRows);
    }
    let shares = grid_shares(step)?;
    let n = training.len() as f64;
    let mean_total_teacher = training.iter().map(|r| r.total_teacher).sum::<f64>() / n;
    let mean_enroll_total = training.iter().map(|r| r.enroll_total).sum::<f64>() / n;

    let school_types = model
        .schema
        .school_type
        .levels
        .iter()
        .map(|l| SchoolType::parse(l).ok_or_else(|| VisualizeError::UnmappableLevel(l.clone())))
        .collect::<Result<Vec<_>, _>>()?;
    let flags = model
        .schema
        .elementary
        .levels
        .iter()
        .map(|l| parse_flag(l).ok_or_else(|| VisualizeError::UnmappableLevel(l.clone())))
        .collect::<Result<Vec<_>, _>>()?;

    let mut points = Vec::new();
    for group in &model.schema.ethnic_group.levels {
        for &school_type in &school_types {
            for &elementary in &flags {
                points.extend(shares.iter().map(|&enroll_share| GridPoint {
                    ethnic_group: group.clone(),
                    school_type,
                    elementary,
                    enroll_share,
                    total_teacher: mean_total_teacher,
                    enroll_total: mean_enroll_total,
                    predicted: f64::NAN,
                }));
            }
        }
    }

    let predicted = model.predict(&points)?;
    for (point, p) in points.iter_mut().zip(predicted) {
        point.predicted = p;
    }
    log::info!("Prediction grid: {} points.", points.len());

    Ok(PredictionGrid {
        points,
        mean_total_teacher,
        mean_enroll_total,
    })
}

pub fn write_grid_csv(grid: &PredictionGrid, path: &Path) -> Result<(), VisualizeError> {
    let mut writer = csv::Writer::from_path(path)?;
    for point in &grid.points {
        writer.serialize(point)?;
    }
    writer.flush().map_err(csv::Error::from)?;
    Ok(())
}

fn school_type_color(school_type: SchoolType) -> RGBColor {
    match school_type {
        SchoolType::Charter => RED,
        SchoolType::Tps => BLUE,
    }
}

/// One panel per ethnic group, three per row: grid lines colored by school
/// type (solid for elementary schools, dashed otherwise) over the observed
/// training points.
pub fn render_prediction_plot(
    grid: &PredictionGrid,
    training: &[SchoolGroupObservation],
    groups: &[String],
    path: &Path,
) -> Result<(), VisualizeError> {
    let columns = 3.min(groups.len().max(1));
    let rows = groups.len().div_ceil(columns).max(1);
    let root = SVGBackend::new(path, (420 * columns as u32, 360 * rows as u32)).into_drawing_area();
    root.fill(&WHITE).map_err(render_error)?;
    let panels = root.split_evenly((rows, columns));

    for (group, panel) in groups.iter().zip(panels.iter()) {
        let mut chart = ChartBuilder::on(panel)
            .caption(group, ("sans-serif", 18))
            .margin(8)
            .x_label_area_size(32)
            .y_label_area_size(40)
            .build_cartesian_2d(0f64..1f64, 0f64..1f64)
            .map_err(render_error)?;
        chart
            .configure_mesh()
            .x_desc("enroll_share")
            .y_desc("match_prop")
            .draw()
            .map_err(render_error)?;

        chart
            .draw_series(
                training
                    .iter()
                    .filter(|r| &r.ethnic_group == group)
                    .map(|r| Circle::new((r.enroll_share, r.match_prop), 2, BLACK.mix(0.35).filled())),
            )
            .map_err(render_error)?;

        for school_type in SchoolType::ALL {
            for elementary in [true, false] {
                let line: Vec<(f64, f64)> = grid
                    .points
                    .iter()
                    .filter(|p| {
                        &p.ethnic_group == group
                            && p.school_type == school_type
                            && p.elementary == elementary
                    })
                    .map(|p| (p.enroll_share, p.predicted))
                    .collect();
                if line.is_empty() {
                    continue;
                }
                let style = school_type_color(school_type).stroke_width(2);
                let label = format!(
                    "{school_type}, {}",
                    if elementary { "elementary" } else { "not elementary" }
                );
                let color = school_type_color(school_type);
                let drawn = if elementary {
                    chart.draw_series(LineSeries::new(line, style))
                } else {
                    chart.draw_series(DashedLineSeries::new(line, 6, 4, style))
                }
                .map_err(render_error)?;
                drawn
                    .label(label)
                    .legend(move |(x, y)| PathElement::new(vec![(x, y), (x + 16, y)], color));
            }
        }

        chart
            .configure_series_labels()
            .background_style(WHITE.mix(0.8))
            .border_style(BLACK)
            .label_font(("sans-serif", 11))
            .draw()
            .map_err(render_error)?;
    }

    root.present().map_err(render_error)?;
    log::info!("Prediction plot written to {}", path.display());
    Ok(())
}

fn padded_range(values: impl Iterator<Item = f64>) -> std::ops::Range<f64> {
    let (lo, hi) = values.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
        (lo.min(v), hi.max(v))
    });
    if !lo.is_finite() || !hi.is_finite() {
        return 0.0..1.0;
    }
    let pad = ((hi - lo) * 0.05).max(1e-6);
    (lo - pad)..(hi + pad)
}

/// One panel per quantitative predictor: observed log-odds against the
/// predictor.
pub fn render_log_odds_plot(series: &[LogitSeries], path: &Path) -> Result<(), VisualizeError> {
    let columns = series.len().max(1);
    let root = SVGBackend::new(path, (380 * columns as u32, 340)).into_drawing_area();
    root.fill(&WHITE).map_err(render_error)?;
    let panels = root.split_evenly((1, columns));

    for (s, panel) in series.iter().zip(panels.iter()) {
        let x_range = padded_range(s.points.iter().map(|p| p.0));
        let y_range = padded_range(s.points.iter().map(|p| p.1));
        let mut chart = ChartBuilder::on(panel)
            .caption(format!("{} (r = {:.2})", s.predictor, s.correlation), ("sans-serif", 16))
            .margin(8)
            .x_label_area_size(32)
            .y_label_area_size(44)
            .build_cartesian_2d(x_range, y_range)
            .map_err(render_error)?;
        chart
            .configure_mesh()
            .x_desc(s.predictor.name())
            .y_desc("log(p / (1 - p))")
            .draw()
            .map_err(render_error)?;
        chart
            .draw_series(
                s.points
                    .iter()
                    .map(|&(x, y)| Circle::new((x, y), 2, BLUE.mix(0.5).filled())),
            )
            .map_err(render_error)?;
    }

    root.present().map_err(render_error)?;
    log::info!("Log-odds plot written to {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::construction::DesignSchema;
    use crate::model::fitted::{Coefficient, FitSummary};
    use crate::model::selection::CriterionKind;
    use crate::model::terms::{Coding, Factor, FactorLevels, Term};
    use crate::data::SchoolId;
    use approx::assert_abs_diff_eq;
    use tempfile::tempdir;

    fn observation(group: &str, share: f64, prop: f64) -> SchoolGroupObservation {
        SchoolGroupObservation {
            school: SchoolId {
                cds_code: "1".into(),
                district_code: "1".into(),
                school_code: "1".into(),
                county: "C".into(),
                district: "D".into(),
                school: "S".into(),
                school_type: SchoolType::Tps,
                elementary: false,
            },
            ethnic_group: group.into(),
            enroll_count: 10.0,
            match_rate: prop,
            mismatch_rate: 1.0 - prop,
            total_teacher: 1.0,
            enroll_total: 100.0 + share * 100.0,
            enroll_share: share,
            match_prop: prop,
        }
    }

    fn model() -> TrainedModel {
        let levels = |factor, coding, names: &[&str]| {
            FactorLevels::new(factor, coding, names.iter().map(|s| s.to_string()).collect())
        };
        TrainedModel {
            terms: vec![Term::new([Factor::EnrollShare]), Term::new([Factor::SchoolType])],
            schema: DesignSchema {
                elementary: levels(Factor::Elementary, Coding::Treatment, &["false", "true"]),
                school_type: levels(Factor::SchoolType, Coding::Treatment, &["Charter", "TPS"]),
                ethnic_group: levels(Factor::EthnicGroup, Coding::Sum, &["Asian", "Black", "White"]),
            },
            coefficients: vec![
                Coefficient { name: "(Intercept)".into(), estimate: -1.0, std_error: 0.1 },
                Coefficient { name: "enroll_share".into(), estimate: 3.0, std_error: 0.2 },
                Coefficient { name: "school_type[TPS]".into(), estimate: 0.5, std_error: 0.1 },
            ],
            summary: FitSummary {
                n_train: 2,
                log_likelihood: -1.0,
                deviance: 0.5,
                criterion: CriterionKind::Bic,
                criterion_value: 4.0,
                edf: 3,
                iterations: 3,
            },
        }
    }

    #[test]
    fn grid_shares_end_exactly_at_one() {
        let shares = grid_shares(0.01).unwrap();
        assert_eq!(shares.len(), 101);
        assert_eq!(shares[0], 0.0);
        assert_eq!(*shares.last().unwrap(), 1.0);
        assert_eq!(grid_shares(0.25).unwrap(), vec![0.0, 0.25, 0.5, 0.75, 1.0]);
        assert_eq!(grid_shares(1.0).unwrap(), vec![0.0, 1.0]);
        assert!(matches!(grid_shares(0.0), Err(VisualizeError::InvalidStep(_))));
    }

    #[test]
    fn steps_that_do_not_divide_one_are_rejected() {
        for step in [0.3, 0.4, 0.7] {
            assert!(matches!(grid_shares(step), Err(VisualizeError::InvalidStep(_))));
        }
        assert_eq!(steps_per_unit(0.01), Some(100));
        assert_eq!(steps_per_unit(0.2), Some(5));
    }

    #[test]
    fn grid_crosses_all_levels_at_training_means() {
        let training = vec![observation("Asian", 0.2, 0.3), observation("White", 0.6, 0.5)];
        let grid = build_prediction_grid(&model(), &training, 0.25).unwrap();
        assert_eq!(grid.points.len(), 3 * 2 * 2 * 5);
        assert_abs_diff_eq!(grid.mean_total_teacher, 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(grid.mean_enroll_total, 140.0, epsilon = 1e-12);
        let p = grid
            .points
            .iter()
            .find(|p| p.school_type == SchoolType::Tps && p.enroll_share == 1.0)
            .unwrap();
        assert_abs_diff_eq!(p.predicted, 1.0 / (1.0 + (-(2.5f64)).exp()), epsilon = 1e-12);
    }

    #[test]
    fn outputs_are_written() {
        let dir = tempdir().unwrap();
        let training = vec![observation("Asian", 0.2, 0.3), observation("White", 0.6, 0.5)];
        let m = model();
        let grid = build_prediction_grid(&m, &training, 0.1).unwrap();

        let csv_path = dir.path().join("grid.csv");
        write_grid_csv(&grid, &csv_path).unwrap();
        let text = std::fs::read_to_string(&csv_path).unwrap();
        let mut lines = text.lines();
        assert_eq!(
            lines.next(),
            Some("ethnic_group,school_type,elementary,enroll_share,total_teacher,enroll_total,predicted")
        );
        assert_eq!(lines.count(), grid.points.len());

        let plot = dir.path().join("predictions.svg");
        render_prediction_plot(&grid, &training, &m.schema.ethnic_group.levels, &plot).unwrap();
        assert!(std::fs::read_to_string(&plot).unwrap().contains("<svg"));

        let series = vec![crate::assumptions::logit_series(&training, Factor::EnrollShare)];
        let odds = dir.path().join("log_odds.svg");
        render_log_odds_plot(&series, &odds).unwrap();
        assert!(odds.exists());
    }
}
