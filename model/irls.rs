//! Iteratively reweighted least squares for a binomial GLM with logit link
//! and prior weights.
//!
//! The response is a proportion `y ∈ [0, 1]` and the prior weight of a row is
//! its number of trials. Each iteration solves the weighted least-squares
//! problem `min ‖√W (Xβ − z)‖²` with working weights `W = w·μ(1−μ)` and working
//! response `z = η + (y − μ)/(μ(1−μ))`. Steps that fail to reduce the deviance
//! are halved.
//!
//! Aliased columns (exact linear dependence on earlier columns) are detected
//! once, before the loop, and held at zero; the fit then runs on the remaining
//! columns and the rank of the model is the number of those columns.

use crate::model::estimate::EstimationError;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, Zip};
use ndarray_linalg::{Inverse, LeastSquaresSvd};

const MIN_VARIANCE: f64 = 1e-10;
const PROB_EPS: f64 = 1e-10;
const MAX_STEP_HALVINGS: usize = 30;
const ALIAS_TOLERANCE: f64 = 1e-9;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct IrlsOptions {
    pub max_iterations: usize,
    /// Stop once `|Δdev| / (|dev| + 0.1)` falls below this value.
    pub convergence_tolerance: f64,
}

impl Default for IrlsOptions {
    fn default() -> Self {
        Self {
            max_iterations: 25,
            convergence_tolerance: 1e-8,
        }
    }
}

/// A converged fit.
///
/// `beta` and `std_errors` have one entry per column of the design matrix;
/// aliased columns carry a zero coefficient and a NaN standard error.
#[derive(Clone, Debug)]
pub struct IrlsResult {
    pub beta: Array1<f64>,
    pub std_errors: Array1<f64>,
    pub aliased: Vec<usize>,
    pub rank: usize,
    pub deviance: f64,
    pub log_likelihood: f64,
    pub final_weights: Array1<f64>,
    pub iteration: usize,
}

impl IrlsResult {
    /// Fitted probabilities for the rows of `x`.
    pub fn fitted_values(&self, x: ArrayView2<f64>) -> Array1<f64> {
        x.dot(&self.beta).mapv(inverse_logit)
    }
}

pub fn inverse_logit(eta: f64) -> f64 {
    1.0 / (1.0 + (-eta.clamp(-700.0, 700.0)).exp())
}

/// Fits `logit(μ) = Xβ` by IRLS, starting from `β = 0`.
pub fn fit_weighted_logit(
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
    prior_weights: ArrayView1<f64>,
    options: &IrlsOptions,
) -> Result<IrlsResult, EstimationError> {
    validate_inputs(x, y, prior_weights)?;

    let p = x.ncols();
    let aliased = detect_aliased_columns(x);
    let kept: Vec<usize> = (0..p).filter(|j| !aliased.contains(j)).collect();
    let x_kept = x.select(Axis(1), &kept);

    log::debug!(
        "IRLS: {} rows, {} columns ({} aliased)",
        x.nrows(),
        p,
        aliased.len()
    );

    let mut beta = Array1::zeros(kept.len());
    let mut eta = x_kept.dot(&beta);
    let (mut mu, mut weights, mut z) = update_glm_vectors(y, &eta, prior_weights);
    let mut deviance = calculate_deviance(y, &mu, prior_weights);
    let mut last_change = f64::INFINITY;

    for iter in 1..=options.max_iterations {
        let beta_target = solve_weighted_least_squares(x_kept.view(), z.view(), weights.view())?;
        let mut step = &beta_target - &beta;
        let mut beta_trial = beta_target;
        let mut eta_trial = x_kept.dot(&beta_trial);
        let mut mu_trial = eta_trial.mapv(inverse_logit);
        let mut deviance_trial = calculate_deviance(y, &mu_trial, prior_weights);

        let mut halvings = 0;
        while !deviance_trial.is_finite()
            || deviance_trial > deviance + 1e-10 * (deviance.abs() + 1.0)
        {
            halvings += 1;
            if halvings > MAX_STEP_HALVINGS {
                return Err(EstimationError::StepHalvingFailed { iteration: iter });
            }
            step.mapv_inplace(|s| s * 0.5);
            beta_trial = &beta + &step;
            eta_trial = x_kept.dot(&beta_trial);
            mu_trial = eta_trial.mapv(inverse_logit);
            deviance_trial = calculate_deviance(y, &mu_trial, prior_weights);
        }
        if halvings > 0 {
            log::debug!("IRLS iteration {iter}: step halved {halvings} time(s)");
        }

        last_change = (deviance - deviance_trial).abs() / (deviance_trial.abs() + 0.1);
        beta = beta_trial;
        eta = eta_trial;
        deviance = deviance_trial;
        (mu, weights, z) = update_glm_vectors(y, &eta, prior_weights);

        log::debug!("IRLS iteration {iter}: deviance {deviance:.8e}, change {last_change:.3e}");

        if last_change < options.convergence_tolerance {
            let covariance = coefficient_covariance(x_kept.view(), weights.view())?;
            let mut beta_full = Array1::zeros(p);
            let mut se_full = Array1::from_elem(p, f64::NAN);
            for (k, &j) in kept.iter().enumerate() {
                beta_full[j] = beta[k];
                se_full[j] = covariance[[k, k]].max(0.0).sqrt();
            }
            return Ok(IrlsResult {
                beta: beta_full,
                std_errors: se_full,
                rank: kept.len(),
                aliased,
                deviance,
                log_likelihood: log_likelihood(y, &mu, prior_weights),
                final_weights: weights,
                iteration: iter,
            });
        }
    }

    Err(EstimationError::DidNotConverge {
        max_iterations: options.max_iterations,
        last_change,
    })
}

fn validate_inputs(
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
    prior_weights: ArrayView1<f64>,
) -> Result<(), EstimationError> {
    let n = x.nrows();
    if y.len() != n || prior_weights.len() != n {
        return Err(EstimationError::LayoutError(format!(
            "design has {n} rows but the response has {} and the weights {}",
            y.len(),
            prior_weights.len()
        )));
    }
    if n == 0 {
        return Err(EstimationError::TooFewObservations { observations: 0 });
    }
    if let Some((index, &value)) = prior_weights
        .iter()
        .enumerate()
        .find(|(_, w)| !(w.is_finite() && **w > 0.0))
    {
        return Err(EstimationError::NonPositiveWeight { index, value });
    }
    if let Some((index, &value)) = y
        .iter()
        .enumerate()
        .find(|(_, v)| !(0.0..=1.0).contains(*v))
    {
        return Err(EstimationError::InvalidResponse { index, value });
    }
    if let Some(((row, column), _)) = x.indexed_iter().find(|(_, v)| !v.is_finite()) {
        return Err(EstimationError::NonFiniteDesign { row, column });
    }
    Ok(())
}

/// Returns `(μ, working weights, working response)` for the current `η`.
pub fn update_glm_vectors(
    y: ArrayView1<f64>,
    eta: &Array1<f64>,
    prior_weights: ArrayView1<f64>,
) -> (Array1<f64>, Array1<f64>, Array1<f64>) {
    let mu = eta.mapv(|e| inverse_logit(e).clamp(PROB_EPS, 1.0 - PROB_EPS));
    let variance = mu.mapv(|m| (m * (1.0 - m)).max(MIN_VARIANCE));
    let weights = &prior_weights * &variance;
    let z = eta + &((&y - &mu) / &variance);
    (mu, weights, z)
}

/// Binomial deviance `2 Σ w [y ln(y/μ) + (1−y) ln((1−y)/(1−μ))]`.
pub fn calculate_deviance(y: ArrayView1<f64>, mu: &Array1<f64>, prior_weights: ArrayView1<f64>) -> f64 {
    let total = Zip::from(y)
        .and(mu)
        .and(prior_weights)
        .fold(0.0, |acc, &yi, &mui, &wi| {
            let mui = mui.clamp(PROB_EPS, 1.0 - PROB_EPS);
            let success = if yi > 0.0 { yi * (yi.ln() - mui.ln()) } else { 0.0 };
            let failure = if yi < 1.0 {
                (1.0 - yi) * ((1.0 - yi).ln() - (1.0 - mui).ln())
            } else {
                0.0
            };
            acc + wi * (success + failure)
        });
    2.0 * total
}

/// Weighted binomial log-likelihood `Σ w [y ln μ + (1−y) ln(1−μ)]`, without
/// the combinatorial constant.
pub fn log_likelihood(y: ArrayView1<f64>, mu: &Array1<f64>, prior_weights: ArrayView1<f64>) -> f64 {
    Zip::from(y)
        .and(mu)
        .and(prior_weights)
        .fold(0.0, |acc, &yi, &mui, &wi| {
            let mui = mui.clamp(PROB_EPS, 1.0 - PROB_EPS);
            let success = if yi > 0.0 { yi * mui.ln() } else { 0.0 };
            let failure = if yi < 1.0 { (1.0 - yi) * (1.0 - mui).ln() } else { 0.0 };
            acc + wi * (success + failure)
        })
}

/// Indices of columns that are linear combinations of earlier columns.
///
/// Modified Gram-Schmidt with one reorthogonalization pass: a column whose
/// residual norm falls below `ALIAS_TOLERANCE` times its own norm is aliased.
/// Positive row weights do not change which columns are aliased, so the
/// unweighted design is used.
pub fn detect_aliased_columns(x: ArrayView2<f64>) -> Vec<usize> {
    let mut basis: Vec<Array1<f64>> = Vec::with_capacity(x.ncols());
    let mut aliased = Vec::new();

    for (j, column) in x.axis_iter(Axis(1)).enumerate() {
        let norm = column.dot(&column).sqrt();
        if norm == 0.0 {
            aliased.push(j);
            continue;
        }
        let mut residual = column.to_owned();
        for _ in 0..2 {
            for q in &basis {
                let projection = q.dot(&residual);
                residual.scaled_add(-projection, q);
            }
        }
        let residual_norm = residual.dot(&residual).sqrt();
        if residual_norm <= ALIAS_TOLERANCE * norm {
            aliased.push(j);
        } else {
            basis.push(residual / residual_norm);
        }
    }
    aliased
}

fn solve_weighted_least_squares(
    x: ArrayView2<f64>,
    z: ArrayView1<f64>,
    weights: ArrayView1<f64>,
) -> Result<Array1<f64>, EstimationError> {
    let sqrt_w = weights.mapv(f64::sqrt);
    let x_weighted = &x * &sqrt_w.view().insert_axis(Axis(1));
    let z_weighted = &z * &sqrt_w;
    let result = x_weighted
        .least_squares(&z_weighted)
        .map_err(EstimationError::LinearSystemSolveFailed)?;
    if !result.solution.iter().all(|v| v.is_finite()) {
        return Err(EstimationError::LayoutError(
            "weighted least squares produced non-finite coefficients".to_string(),
        ));
    }
    Ok(result.solution)
}

/// `(XᵀWX)⁻¹` for a full-rank `x`.
pub fn coefficient_covariance(
    x: ArrayView2<f64>,
    weights: ArrayView1<f64>,
) -> Result<Array2<f64>, EstimationError> {
    let xtw = &x.t() * &weights.view().insert_axis(Axis(0));
    let xtwx = xtw.dot(&x);
    xtwx.inv().map_err(EstimationError::LinearSystemSolveFailed)
}
