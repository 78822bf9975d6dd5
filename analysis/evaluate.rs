//! In-sample and holdout quality of a trained model.

use crate::aggregate::SchoolGroupObservation;
use crate::model::estimate::{EstimationError, fit_null_model};
use crate::model::fitted::TrainedModel;
use crate::model::irls::IrlsOptions;
use crate::assumptions::pearson_correlation;
use ndarray::{Array1, ArrayView1};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EvaluationError {
    #[error("The holdout partition is empty.")]
    EmptyHoldout,
    #[error(transparent)]
    Estimation(#[from] EstimationError),
}

/// `1 − ll_model / ll_null`. Exactly zero when the two likelihoods agree.
pub fn mcfadden_r2(ll_model: f64, ll_null: f64) -> f64 {
    if ll_model == ll_null || ll_null == 0.0 {
        0.0
    } else {
        1.0 - ll_model / ll_null
    }
}

pub fn rmse(predicted: ArrayView1<f64>, actual: ArrayView1<f64>) -> f64 {
    let diff = &predicted - &actual;
    (diff.dot(&diff) / diff.len() as f64).sqrt()
}

pub fn squared_pearson(predicted: ArrayView1<f64>, actual: ArrayView1<f64>) -> f64 {
    pearson_correlation(predicted, actual).powi(2)
}

#[derive(Debug, Clone, PartialEq)]
pub struct OddsRatio {
    pub name: String,
    pub estimate: f64,
    pub std_error: f64,
    pub odds_ratio: f64,
}

#[derive(Debug, Clone)]
pub struct Evaluation {
    pub model_log_likelihood: f64,
    pub null_log_likelihood: f64,
    pub mcfadden_r2: f64,
    pub holdout_rows: usize,
    pub holdout_rmse: f64,
    /// Squared Pearson correlation of predicted and observed `match_prop`;
    /// NaN when the predictions are constant.
    pub holdout_r2: f64,
    pub odds_ratios: Vec<OddsRatio>,
}

pub fn evaluate(
    model: &TrainedModel,
    training: &[SchoolGroupObservation],
    holdout: &[SchoolGroupObservation],
    irls: &IrlsOptions,
) -> Result<Evaluation, EvaluationError> {
    if holdout.is_empty() {
        return Err(EvaluationError::EmptyHoldout);
    }
    let null = fit_null_model(training, irls)?;
    let ll_model = model.summary.log_likelihood;
    let r2 = mcfadden_r2(ll_model, null.log_likelihood);

    let predicted = model.predict(holdout)?;
    let actual: Array1<f64> = holdout.iter().map(|r| r.match_prop).collect();
    let holdout_rmse = rmse(predicted.view(), actual.view());
    let holdout_r2 = squared_pearson(predicted.view(), actual.view());

    log::info!(
        "McFadden R² = {r2:.4}; holdout RMSE = {holdout_rmse:.4}, r² = {holdout_r2:.4} over {} rows.",
        holdout.len()
    );

    let odds_ratios = model
        .coefficients
        .iter()
        .map(|c| OddsRatio {
            name: c.name.clone(),
            estimate: c.estimate,
            std_error: c.std_error,
            odds_ratio: c.odds_ratio(),
        })
        .collect();

    Ok(Evaluation {
        model_log_likelihood: ll_model,
        null_log_likelihood: null.log_likelihood,
        mcfadden_r2: r2,
        holdout_rows: holdout.len(),
        holdout_rmse,
        holdout_r2,
        odds_ratios,
    })
}
