//! Stepwise term selection.
//!
//! A [`SearchStrategy`] walks the neighborhood of single-term additions and
//! removals, scoring each candidate with a [`Criterion`]. Candidates are fitted
//! through a [`CandidateEvaluator`], so strategies never see design matrices.

use crate::model::construction::ModelLayout;
use crate::model::estimate::EstimationError;
use crate::model::irls::{IrlsOptions, fit_weighted_logit};
use crate::model::terms::Term;
use ndarray::{ArrayView1, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Scores a fitted candidate; lower is better.
pub trait Criterion {
    fn name(&self) -> &'static str;

    /// The penalty charged per effective degree of freedom.
    fn penalty_per_parameter(&self, n_obs: usize) -> f64;

    fn score(&self, log_likelihood: f64, edf: usize, n_obs: usize) -> f64 {
        -2.0 * log_likelihood + self.penalty_per_parameter(n_obs) * edf as f64
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CriterionKind {
    /// `k = ln(n)`
    #[default]
    Bic,
    /// `k = 2`
    Aic,
}

impl Criterion for CriterionKind {
    fn name(&self) -> &'static str {
        match self {
            CriterionKind::Bic => "BIC",
            CriterionKind::Aic => "AIC",
        }
    }

    fn penalty_per_parameter(&self, n_obs: usize) -> f64 {
        match self {
            CriterionKind::Bic => (n_obs as f64).ln(),
            CriterionKind::Aic => 2.0,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Start from the full scope; try removals and additions.
    #[default]
    Both,
    /// Start from the full scope; removals only.
    Backward,
    /// Start from the intercept-only model; additions only.
    Forward,
}

impl Direction {
    fn drops(self) -> bool {
        matches!(self, Direction::Both | Direction::Backward)
    }

    fn adds(self) -> bool {
        matches!(self, Direction::Both | Direction::Forward)
    }
}

/// What a strategy learns from fitting one candidate.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CandidateFit {
    pub log_likelihood: f64,
    pub edf: usize,
}

/// Fits sub-models of a fixed scope.
pub trait CandidateEvaluator {
    /// All terms the search may use, in canonical order.
    fn scope(&self) -> &[Term];
    fn n_obs(&self) -> usize;
    fn evaluate(&self, terms: &[Term]) -> Result<CandidateFit, EstimationError>;
}

/// Evaluates candidates by selecting their columns from the design matrix of
/// the full scope.
pub struct DesignEvaluator<'a> {
    x: ArrayView2<'a, f64>,
    layout: &'a ModelLayout,
    scope: Vec<Term>,
    y: ArrayView1<'a, f64>,
    weights: ArrayView1<'a, f64>,
    options: IrlsOptions,
}

impl<'a> DesignEvaluator<'a> {
    pub fn new(
        x: ArrayView2<'a, f64>,
        layout: &'a ModelLayout,
        y: ArrayView1<'a, f64>,
        weights: ArrayView1<'a, f64>,
        options: IrlsOptions,
    ) -> Self {
        let scope = layout.blocks.iter().map(|b| b.term.clone()).collect();
        Self {
            x,
            layout,
            scope,
            y,
            weights,
            options,
        }
    }
}

impl CandidateEvaluator for DesignEvaluator<'_> {
    fn scope(&self) -> &[Term] {
        &self.scope
    }

    fn n_obs(&self) -> usize {
        self.y.len()
    }

    fn evaluate(&self, terms: &[Term]) -> Result<CandidateFit, EstimationError> {
        let columns = self.layout.columns_for(terms);
        let x = self.x.select(Axis(1), &columns);
        let fit = fit_weighted_logit(x.view(), self.y, self.weights, &self.options)?;
        Ok(CandidateFit {
            log_likelihood: fit.log_likelihood,
            edf: fit.rank,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepAction {
    Start,
    Drop,
    Add,
}

impl fmt::Display for StepAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StepAction::Start => "start",
            StepAction::Drop => "drop",
            StepAction::Add => "add",
        })
    }
}

/// One accepted move of the search.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SelectionStep {
    pub action: StepAction,
    pub term: Option<String>,
    pub score: f64,
    pub edf: usize,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SelectionOutcome {
    pub terms: Vec<Term>,
    pub score: f64,
    pub log_likelihood: f64,
    pub edf: usize,
    pub steps: Vec<SelectionStep>,
}

pub trait SearchStrategy {
    fn search(
        &self,
        evaluator: &dyn CandidateEvaluator,
        criterion: &dyn Criterion,
    ) -> Result<SelectionOutcome, EstimationError>;
}

/// Greedy stepwise search under marginality.
///
/// At each step every admissible removal is scored, then every admissible
/// addition, both in canonical term order. The first candidate with the
/// strictly lowest score is taken if it beats the current model; otherwise
/// the search stops. A removal that leaves the rank unchanged drops a fully
/// aliased term and is taken at once.
#[derive(Clone, Copy, Debug)]
pub struct Stepwise {
    pub direction: Direction,
}

struct Proposal {
    action: StepAction,
    term: Term,
    terms: Vec<Term>,
    fit: CandidateFit,
    score: f64,
}

impl Stepwise {
    pub fn new(direction: Direction) -> Self {
        Self { direction }
    }

    fn try_candidate(
        evaluator: &dyn CandidateEvaluator,
        terms: &[Term],
    ) -> Result<Option<CandidateFit>, EstimationError> {
        match evaluator.evaluate(terms) {
            Ok(fit) => Ok(Some(fit)),
            Err(e) if e.is_convergence_failure() => {
                log::warn!("Skipping candidate model that failed to fit: {e}");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

/// Terms of `current` that no other present term contains.
pub fn removable_terms(current: &[Term]) -> Vec<Term> {
    current
        .iter()
        .filter(|t| !current.iter().any(|u| u.strictly_contains(t)))
        .cloned()
        .collect()
}

/// Terms of `scope` absent from `current` whose scope sub-terms are all
/// present.
pub fn addable_terms(current: &[Term], scope: &[Term]) -> Vec<Term> {
    scope
        .iter()
        .filter(|t| !current.contains(t))
        .filter(|t| {
            scope
                .iter()
                .filter(|u| t.strictly_contains(u))
                .all(|u| current.contains(u))
        })
        .cloned()
        .collect()
}

impl SearchStrategy for Stepwise {
    fn search(
        &self,
        evaluator: &dyn CandidateEvaluator,
        criterion: &dyn Criterion,
    ) -> Result<SelectionOutcome, EstimationError> {
        let n = evaluator.n_obs();
        let mut current: Vec<Term> = match self.direction {
            Direction::Forward => Vec::new(),
            Direction::Both | Direction::Backward => evaluator.scope().to_vec(),
        };
        current.sort();

        let mut current_fit = evaluator.evaluate(&current)?;
        let mut current_score = criterion.score(current_fit.log_likelihood, current_fit.edf, n);
        let mut steps = vec![SelectionStep {
            action: StepAction::Start,
            term: None,
            score: current_score,
            edf: current_fit.edf,
        }];
        log::debug!(
            "Stepwise start: {} terms, {} = {current_score:.4}",
            current.len(),
            criterion.name()
        );

        loop {
            let mut best: Option<Proposal> = None;
            let mut aliased_drop: Option<Proposal> = None;

            if self.direction.drops() {
                for term in removable_terms(&current) {
                    let terms: Vec<Term> = current.iter().filter(|t| **t != term).cloned().collect();
                    let Some(fit) = Self::try_candidate(evaluator, &terms)? else {
                        continue;
                    };
                    let score = criterion.score(fit.log_likelihood, fit.edf, n);
                    log::debug!("  - {term}: {score:.4}");
                    let proposal = Proposal {
                        action: StepAction::Drop,
                        term,
                        terms,
                        fit,
                        score,
                    };
                    if fit.edf == current_fit.edf {
                        aliased_drop = Some(proposal);
                        break;
                    }
                    if best.as_ref().is_none_or(|b| score < b.score) {
                        best = Some(proposal);
                    }
                }
            }

            if aliased_drop.is_none() && self.direction.adds() {
                for term in addable_terms(&current, evaluator.scope()) {
                    let mut terms = current.clone();
                    terms.push(term.clone());
                    terms.sort();
                    let Some(fit) = Self::try_candidate(evaluator, &terms)? else {
                        continue;
                    };
                    let score = criterion.score(fit.log_likelihood, fit.edf, n);
                    log::debug!("  + {term}: {score:.4}");
                    if best.as_ref().is_none_or(|b| score < b.score) {
                        best = Some(Proposal {
                            action: StepAction::Add,
                            term,
                            terms,
                            fit,
                            score,
                        });
                    }
                }
            }

            let accepted = match (aliased_drop, best) {
                (Some(proposal), _) => {
                    log::info!("Dropping aliased term {}", proposal.term);
                    proposal
                }
                (None, Some(proposal)) if proposal.score < current_score => proposal,
                _ => break,
            };

            log::info!(
                "Step {}: {} {} ({} {:.4} -> {:.4})",
                steps.len(),
                accepted.action,
                accepted.term,
                criterion.name(),
                current_score,
                accepted.score
            );
            current = accepted.terms;
            current_fit = accepted.fit;
            current_score = accepted.score;
            steps.push(SelectionStep {
                action: accepted.action,
                term: Some(accepted.term.label()),
                score: accepted.score,
                edf: accepted.fit.edf,
            });
        }

        Ok(SelectionOutcome {
            terms: current,
            score: current_score,
            log_likelihood: current_fit.log_likelihood,
            edf: current_fit.edf,
            steps,
        })
    }
}
