//! Pre-fit diagnostics on the training partition: collinearity among the
//! quantitative predictors and linearity of each predictor in the log-odds.
//! Findings are logged and reported; none of them stops the analysis.

use crate::aggregate::SchoolGroupObservation;
use crate::model::terms::{Factor, FactorValue};
use ndarray::{Array1, Array2, ArrayView1};
use ndarray_linalg::Inverse;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AssumptionError {
    #[error("Assumption checks need at least 2 training rows, got {rows}.")]
    InsufficientRows { rows: usize },
}

/// Pearson correlation; NaN when either series is constant.
pub fn pearson_correlation(x: ArrayView1<f64>, y: ArrayView1<f64>) -> f64 {
    let n = x.len().min(y.len());
    if n < 2 {
        return f64::NAN;
    }
    let (x, y) = (x.slice(ndarray::s![..n]), y.slice(ndarray::s![..n]));
    let mean_x = x.sum() / n as f64;
    let mean_y = y.sum() / n as f64;
    let dx = x.mapv(|v| v - mean_x);
    let dy = y.mapv(|v| v - mean_y);
    let denom = (dx.dot(&dx) * dy.dot(&dy)).sqrt();
    if denom > 0.0 { dx.dot(&dy) / denom } else { f64::NAN }
}

fn predictor_column(rows: &[SchoolGroupObservation], factor: Factor) -> Array1<f64> {
    rows.iter()
        .map(|row| match factor.value(row) {
            FactorValue::Quantity(v) => v,
            FactorValue::Level(_) => f64::NAN,
        })
        .collect()
}

/// A pair of predictors whose absolute correlation exceeds the threshold.
#[derive(Debug, Clone, PartialEq)]
pub struct FlaggedPair {
    pub first: Factor,
    pub second: Factor,
    pub correlation: f64,
}

#[derive(Debug, Clone)]
pub struct CorrelationReport {
    pub predictors: Vec<Factor>,
    pub matrix: Array2<f64>,
    /// Diagonal of the inverse correlation matrix; `None` when it is singular.
    pub vif: Option<Vec<f64>>,
    pub flagged_pairs: Vec<FlaggedPair>,
}

pub fn correlation_report(rows: &[SchoolGroupObservation], threshold: f64) -> CorrelationReport {
    let predictors = Factor::QUANTITATIVE.to_vec();
    let columns: Vec<Array1<f64>> = predictors
        .iter()
        .map(|&f| predictor_column(rows, f))
        .collect();

    let k = predictors.len();
    let mut matrix = Array2::eye(k);
    let mut flagged_pairs = Vec::new();
    for i in 0..k {
        for j in (i + 1)..k {
            let r = pearson_correlation(columns[i].view(), columns[j].view());
            matrix[[i, j]] = r;
            matrix[[j, i]] = r;
            if r.abs() > threshold {
                log::warn!(
                    "{} and {} are strongly correlated (r = {r:.3}).",
                    predictors[i],
                    predictors[j]
                );
                flagged_pairs.push(FlaggedPair {
                    first: predictors[i],
                    second: predictors[j],
                    correlation: r,
                });
            }
        }
    }

    let vif = matrix
        .inv()
        .ok()
        .map(|inverse| inverse.diag().to_vec())
        .filter(|diag| diag.iter().all(|v| v.is_finite()));
    if vif.is_none() {
        log::warn!("Predictor correlation matrix is singular; variance inflation factors are unavailable.");
    }

    CorrelationReport {
        predictors,
        matrix,
        vif,
        flagged_pairs,
    }
}

/// Points `(x, logit(p))` for one predictor, leaving out rows with `p` of 0 or
/// 1 whose log-odds are infinite.
#[derive(Debug, Clone)]
pub struct LogitSeries {
    pub predictor: Factor,
    pub points: Vec<(f64, f64)>,
    pub excluded: usize,
    /// Correlation of the retained points, a rough linearity summary.
    pub correlation: f64,
}

pub fn logit_series(rows: &[SchoolGroupObservation], predictor: Factor) -> LogitSeries {
    let x = predictor_column(rows, predictor);
    let points: Vec<(f64, f64)> = rows
        .iter()
        .zip(x.iter())
        .filter(|(row, _)| row.match_prop > 0.0 && row.match_prop < 1.0)
        .map(|(row, &xi)| (xi, (row.match_prop / (1.0 - row.match_prop)).ln()))
        .collect();
    let xs: Array1<f64> = points.iter().map(|p| p.0).collect();
    let ys: Array1<f64> = points.iter().map(|p| p.1).collect();
    LogitSeries {
        predictor,
        excluded: rows.len() - points.len(),
        correlation: pearson_correlation(xs.view(), ys.view()),
        points,
    }
}

#[derive(Debug, Clone)]
pub struct AssumptionReport {
    pub correlation: CorrelationReport,
    pub linearity: Vec<LogitSeries>,
}

pub fn check_assumptions(
    rows: &[SchoolGroupObservation],
    collinearity_threshold: f64,
) -> Result<AssumptionReport, AssumptionError> {
    if rows.len() < 2 {
        return Err(AssumptionError::InsufficientRows { rows: rows.len() });
    }
    let correlation = correlation_report(rows, collinearity_threshold);
    let linearity: Vec<LogitSeries> = Factor::QUANTITATIVE
        .iter()
        .map(|&f| logit_series(rows, f))
        .collect();
    for series in &linearity {
        log::info!(
            "Log-odds vs {}: {} points ({} excluded at 0 or 1), r = {:.3}",
            series.predictor,
            series.points.len(),
            series.excluded,
            series.correlation
        );
    }
    Ok(AssumptionReport {
        correlation,
        linearity,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{SchoolId, SchoolType};
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn row(share: f64, teachers: f64, total: f64, prop: f64) -> SchoolGroupObservation {
        SchoolGroupObservation {
            school: SchoolId {
                cds_code: "0".into(),
                district_code: "0".into(),
                school_code: "0".into(),
                county: "C".into(),
                district: "D".into(),
                school: "S".into(),
                school_type: SchoolType::Tps,
                elementary: true,
            },
            ethnic_group: "Asian".into(),
            enroll_count: share * total,
            match_rate: prop * teachers,
            mismatch_rate: (1.0 - prop) * teachers,
            total_teacher: teachers,
            enroll_total: total,
            enroll_share: share,
            match_prop: prop,
        }
    }

    #[test]
    fn pearson_of_linear_series() {
        let x = array![1.0, 2.0, 3.0, 4.0];
        assert_abs_diff_eq!(pearson_correlation(x.view(), (&x * 2.0 + 1.0).view()), 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(pearson_correlation(x.view(), (-&x).view()), -1.0, epsilon = 1e-12);
        assert!(pearson_correlation(x.view(), array![3.0, 3.0, 3.0, 3.0].view()).is_nan());
    }

    #[test]
    fn collinear_predictors_are_flagged() {
        // enroll_share tracks enroll_total exactly; total_teacher varies on its own.
        let rows: Vec<_> = (0..10)
            .map(|i| {
                let share = 0.05 + 0.09 * i as f64;
                row(share, 1.0 + ((i * 7) % 5) as f64 * 0.1, 100.0 + 500.0 * share, 0.3)
            })
            .collect();
        let report = correlation_report(&rows, 0.8);
        assert_abs_diff_eq!(report.matrix[[0, 2]], 1.0, epsilon = 1e-9);
        assert_eq!(report.flagged_pairs.len(), 1);
        assert_eq!(report.flagged_pairs[0].first, Factor::EnrollShare);
        assert_eq!(report.flagged_pairs[0].second, Factor::EnrollTotal);
        // Perfectly correlated pair: no usable VIFs.
        assert!(report.vif.map_or(true, |v| v.iter().any(|x| *x > 1e6)));
    }

    #[test]
    fn uncorrelated_predictors_have_unit_vif() {
        let rows = vec![
            row(0.1, 1.0, 100.0, 0.2),
            row(0.1, 2.0, 300.0, 0.4),
            row(0.3, 1.0, 300.0, 0.5),
            row(0.3, 2.0, 100.0, 0.6),
        ];
        let report = correlation_report(&rows, 0.8);
        assert!(report.flagged_pairs.is_empty());
        let vif = report.vif.unwrap();
        for v in vif {
            assert_abs_diff_eq!(v, 1.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn logit_series_excludes_boundary_proportions() {
        let rows = vec![
            row(0.1, 1.0, 100.0, 0.0),
            row(0.2, 1.0, 100.0, 0.5),
            row(0.3, 1.0, 100.0, 1.0),
            row(0.4, 1.0, 100.0, 0.8),
        ];
        let series = logit_series(&rows, Factor::EnrollShare);
        assert_eq!(series.excluded, 2);
        assert_eq!(series.points.len(), 2);
        assert_abs_diff_eq!(series.points[0].1, 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(series.points[1].1, 4f64.ln(), epsilon = 1e-12);
    }

    #[test]
    fn tiny_training_sets_are_rejected() {
        let err = check_assumptions(&[row(0.1, 1.0, 100.0, 0.5)], 0.8).unwrap_err();
        assert!(matches!(err, AssumptionError::InsufficientRows { rows: 1 }));
    }
}
