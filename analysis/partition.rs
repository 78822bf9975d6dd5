//! Seeded train/holdout split, stratified on the response.
//!
//! Rows are ranked by `match_prop` and cut into at most `strata` equal-count
//! bins. Each bin is shuffled with the seeded generator and contributes
//! `ceil(fraction · len)` rows to training, so every part of the response
//! distribution is represented on both sides.

use crate::aggregate::SchoolGroupObservation;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum PartitionError {
    #[error("Training fraction must lie strictly between 0 and 1, got {0}.")]
    InvalidFraction(f64),
    #[error("At least one stratum is required.")]
    NoStrata,
    #[error("Cannot split {rows} rows: the {side} partition would be empty.")]
    EmptyPartition { rows: usize, side: &'static str },
}

/// Row indices of the two sides of a split, each in ascending order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitIndices {
    pub training: Vec<usize>,
    pub holdout: Vec<usize>,
}

#[derive(Debug, Clone)]
pub struct Partition {
    pub training: Vec<SchoolGroupObservation>,
    pub holdout: Vec<SchoolGroupObservation>,
}

/// Splits `values` into training and holdout indices.
pub fn stratified_split(
    values: &[f64],
    fraction: f64,
    strata: usize,
    seed: u64,
) -> Result<SplitIndices, PartitionError> {
    if !(fraction > 0.0 && fraction < 1.0) {
        return Err(PartitionError::InvalidFraction(fraction));
    }
    if strata == 0 {
        return Err(PartitionError::NoStrata);
    }
    let n = values.len();

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| values[a].total_cmp(&values[b]).then(a.cmp(&b)));

    let groups = strata.min(n);
    let mut bins: Vec<Vec<usize>> = vec![Vec::new(); groups];
    for (rank, &index) in order.iter().enumerate() {
        bins[rank * groups / n].push(index);
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let mut training = Vec::with_capacity(n);
    let mut holdout = Vec::with_capacity(n);
    for mut bin in bins {
        bin.shuffle(&mut rng);
        let take = (fraction * bin.len() as f64).ceil() as usize;
        let (train_part, hold_part) = bin.split_at(take.min(bin.len()));
        training.extend_from_slice(train_part);
        holdout.extend_from_slice(hold_part);
    }
    training.sort_unstable();
    holdout.sort_unstable();

    if training.is_empty() {
        return Err(PartitionError::EmptyPartition { rows: n, side: "training" });
    }
    if holdout.is_empty() {
        return Err(PartitionError::EmptyPartition { rows: n, side: "holdout" });
    }
    Ok(SplitIndices { training, holdout })
}

/// Splits observations on their `match_prop`.
pub fn partition(
    rows: &[SchoolGroupObservation],
    fraction: f64,
    strata: usize,
    seed: u64,
) -> Result<Partition, PartitionError> {
    let response: Vec<f64> = rows.iter().map(|r| r.match_prop).collect();
    let split = stratified_split(&response, fraction, strata, seed)?;
    log::info!(
        "Partitioned {} rows into {} training and {} holdout (seed {seed}).",
        rows.len(),
        split.training.len(),
        split.holdout.len()
    );
    Ok(Partition {
        training: split.training.iter().map(|&i| rows[i].clone()).collect(),
        holdout: split.holdout.iter().map(|&i| rows[i].clone()).collect(),
    })
}
