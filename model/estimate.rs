//! Model training: scope construction, stepwise selection, and the final
//! full-rank refit.
//!
//! The entry point is [`train_model`]. It derives the factor levels from the
//! training rows, builds the design matrix of the full interaction scope once,
//! and hands the selection strategy an evaluator that fits any sub-model by
//! selecting columns from that matrix.

use crate::aggregate::SchoolGroupObservation;
use crate::model::construction::{DesignSchema, build_design_matrix, response_and_weights};
use crate::model::fitted::{Coefficient, FitSummary, TrainedModel};
use crate::model::irls::{IrlsOptions, IrlsResult, fit_weighted_logit};
use crate::model::selection::{
    CandidateEvaluator, Criterion, CriterionKind, DesignEvaluator, Direction, SearchStrategy,
    SelectionOutcome, Stepwise,
};
use crate::model::terms::{Term, full_interaction_scope};
use ndarray::Array2;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EstimationError {
    #[error("A linear system solve failed. The weighted cross-product matrix may be singular. Error: {0}")]
    LinearSystemSolveFailed(ndarray_linalg::error::LinalgError),

    #[error("Prior weight at row {index} is {value}; weights must be finite and strictly positive.")]
    NonPositiveWeight { index: usize, value: f64 },

    #[error("Response at row {index} is {value}; proportions must lie in [0, 1].")]
    InvalidResponse { index: usize, value: f64 },

    #[error("The design matrix holds a non-finite value at row {row}, column {column}.")]
    NonFiniteDesign { row: usize, column: usize },

    #[error(
        "The selected model is rank deficient: rank {rank} of {columns} columns. Aliased: {}",
        .aliased.join(", ")
    )]
    RankDeficient {
        rank: usize,
        columns: usize,
        aliased: Vec<String>,
    },

    #[error(
        "IRLS did not converge within {max_iterations} iterations. Last relative deviance change was {last_change:.6e}."
    )]
    DidNotConverge {
        max_iterations: usize,
        last_change: f64,
    },

    #[error("Step halving failed to reduce the deviance at IRLS iteration {iteration}.")]
    StepHalvingFailed { iteration: usize },

    #[error("Cannot fit a model to {observations} observations.")]
    TooFewObservations { observations: usize },

    #[error("Level '{level}' of factor '{factor}' was not present in the training data.")]
    UnknownLevel { factor: String, level: String },

    #[error("An internal error occurred during model layout or coefficient mapping: {0}")]
    LayoutError(String),
}

impl EstimationError {
    /// Failures that make a single candidate unusable without invalidating
    /// the search.
    pub fn is_convergence_failure(&self) -> bool {
        matches!(
            self,
            EstimationError::DidNotConverge { .. } | EstimationError::StepHalvingFailed { .. }
        )
    }
}

/// Everything [`train_model`] needs besides the data.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TrainingOptions {
    pub irls: IrlsOptions,
    pub criterion: CriterionKind,
    pub direction: Direction,
}

impl Default for TrainingOptions {
    fn default() -> Self {
        Self {
            irls: IrlsOptions::default(),
            criterion: CriterionKind::Bic,
            direction: Direction::Both,
        }
    }
}

/// The trained model together with the path the search took.
#[derive(Clone, Debug)]
pub struct TrainingOutcome {
    pub model: TrainedModel,
    pub selection: SelectionOutcome,
}

/// The terms of the full interaction scope that the training rows can
/// support. Terms involving a categorical factor with a single observed level
/// are left out with a warning.
pub fn estimable_scope(schema: &DesignSchema) -> Vec<Term> {
    let (kept, excluded): (Vec<Term>, Vec<Term>) = full_interaction_scope()
        .into_iter()
        .partition(|term| schema.supports(term));
    if !excluded.is_empty() {
        log::warn!(
            "{} term(s) excluded from the scope because a factor has a single level: {}",
            excluded.len(),
            excluded.iter().map(Term::label).collect::<Vec<_>>().join(", ")
        );
    }
    kept
}

/// Trains the weighted logistic model on `rows`.
pub fn train_model(
    rows: &[SchoolGroupObservation],
    options: &TrainingOptions,
) -> Result<TrainingOutcome, EstimationError> {
    if rows.is_empty() {
        return Err(EstimationError::TooFewObservations { observations: 0 });
    }
    log::info!("Starting model training on {} observations.", rows.len());

    let schema = DesignSchema::from_rows(rows);
    let scope = estimable_scope(&schema);
    let (x, layout) = build_design_matrix(rows, &schema, &scope)?;
    let (y, w) = response_and_weights(rows);
    log::info!(
        "Full scope: {} terms, {} design columns.",
        scope.len(),
        layout.total_coeffs
    );

    let evaluator = DesignEvaluator::new(x.view(), &layout, y.view(), w.view(), options.irls);
    let strategy = Stepwise::new(options.direction);
    let selection = strategy.search(&evaluator, &options.criterion)?;
    log::info!(
        "Selected {} term(s) after {} step(s); {} = {:.4}",
        selection.terms.len(),
        selection.steps.len().saturating_sub(1),
        options.criterion.name(),
        selection.score
    );

    let (x_final, layout_final) = build_design_matrix(rows, &schema, &selection.terms)?;
    let fit = fit_weighted_logit(x_final.view(), y.view(), w.view(), &options.irls)?;
    if !fit.aliased.is_empty() {
        return Err(EstimationError::RankDeficient {
            rank: fit.rank,
            columns: layout_final.total_coeffs,
            aliased: fit
                .aliased
                .iter()
                .map(|&j| layout_final.column_names[j].clone())
                .collect(),
        });
    }

    let coefficients = layout_final
        .column_names
        .iter()
        .zip(fit.beta.iter().zip(fit.std_errors.iter()))
        .map(|(name, (&estimate, &std_error))| Coefficient {
            name: name.clone(),
            estimate,
            std_error,
        })
        .collect();

    let summary = FitSummary {
        n_train: rows.len(),
        log_likelihood: fit.log_likelihood,
        deviance: fit.deviance,
        criterion: options.criterion,
        criterion_value: options
            .criterion
            .score(fit.log_likelihood, fit.rank, evaluator.n_obs()),
        edf: fit.rank,
        iterations: fit.iteration,
    };

    Ok(TrainingOutcome {
        model: TrainedModel {
            terms: selection.terms.clone(),
            schema,
            coefficients,
            summary,
        },
        selection,
    })
}

/// Intercept-only fit with the same response and weights, for pseudo-R².
pub fn fit_null_model(
    rows: &[SchoolGroupObservation],
    options: &IrlsOptions,
) -> Result<IrlsResult, EstimationError> {
    let (y, w) = response_and_weights(rows);
    let x = Array2::ones((rows.len(), 1));
    fit_weighted_logit(x.view(), y.view(), w.view(), options)
}
