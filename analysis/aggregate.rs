//! # Grade-to-School Aggregation
//!
//! The extract reports match and mismatch *rates* (teachers per student) for
//! each grade category. Averaging those rates across grades would weight a
//! small grade as heavily as a large one, so the aggregation instead runs a
//! scale-up / sum / scale-down chain:
//!
//! 1. [`scale_up`]: rate × enrollment gives an expected teacher count per grade.
//! 2. [`sum_across_grades`]: counts are summed per (school, ethnic group).
//! 3. [`scale_down`]: summed counts ÷ summed enrollment give enrollment-weighted rates.
//! 4. [`keep_defined_rates`]: groups with undefined rates or no teachers are removed.
//! 5. [`attach_school_totals`]: school enrollment over the surviving groups,
//!    enrollment share and match proportion.
//! 6. [`drop_undefined`]: rows with any remaining undefined value are removed.
//!
//! School totals are taken after step 4, so the shares of a school's output
//! rows always sum to one and re-aggregating the output reproduces it.
//!
//! Every step consumes one immutable collection and builds a new one.

use crate::data::{RawObservation, SchoolId};
use std::collections::BTreeMap;

/// Expected teacher counts for one raw row.
#[derive(Debug, Clone, PartialEq)]
pub struct GradeCounts {
    pub school: SchoolId,
    pub ethnic_group: String,
    pub enroll_count: f64,
    pub match_count: f64,
    pub mismatch_count: f64,
    pub teacher_count: f64,
}

/// Counts summed across the grade categories of one (school, ethnic group).
#[derive(Debug, Clone, PartialEq)]
pub struct GroupCounts {
    pub school: SchoolId,
    pub ethnic_group: String,
    pub grades: usize,
    pub enroll_count: f64,
    pub match_count: f64,
    pub mismatch_count: f64,
    pub teacher_count: f64,
}

/// Enrollment-weighted rates for one (school, ethnic group).
#[derive(Debug, Clone, PartialEq)]
pub struct GroupRates {
    pub school: SchoolId,
    pub ethnic_group: String,
    pub enroll_count: f64,
    pub match_rate: f64,
    pub mismatch_rate: f64,
    /// `match_rate + mismatch_rate`.
    pub total_teacher: f64,
    /// The total-teacher rate as reported by the extract, summed and rescaled
    /// the same way. Only used to audit the rate-consistency invariant.
    pub reported_total_teacher: f64,
}

/// One modeling observation: a school and one of its ethnic groups.
#[derive(Debug, Clone, PartialEq)]
pub struct SchoolGroupObservation {
    pub school: SchoolId,
    pub ethnic_group: String,
    pub enroll_count: f64,
    pub match_rate: f64,
    pub mismatch_rate: f64,
    pub total_teacher: f64,
    pub enroll_total: f64,
    pub enroll_share: f64,
    /// Response: share of this group's teachers per student that are a race match.
    pub match_prop: f64,
}

impl SchoolGroupObservation {
    /// Views an aggregated row as a single-grade raw row, so that the
    /// aggregation can be re-applied to its own output.
    pub fn as_single_grade(&self, grade_category: &str) -> RawObservation {
        RawObservation {
            school: self.school.clone(),
            grade_category: grade_category.to_string(),
            ethnic_group: self.ethnic_group.clone(),
            enroll_count: self.enroll_count,
            match_value: self.match_rate,
            mismatch_value: self.mismatch_rate,
            total_teacher: self.total_teacher,
        }
    }

    fn is_defined(&self) -> bool {
        [
            self.enroll_count,
            self.match_rate,
            self.mismatch_rate,
            self.total_teacher,
            self.enroll_total,
            self.enroll_share,
            self.match_prop,
        ]
        .iter()
        .all(|v| v.is_finite())
            && self.total_teacher > 0.0
    }
}

/// Bookkeeping of one aggregation run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AggregationReport {
    pub raw_rows: usize,
    /// Raw rows with exactly one of the match / mismatch rates defined.
    pub partially_defined_rows: usize,
    pub groups: usize,
    pub dropped_undefined: usize,
    /// Groups whose reported total-teacher rate disagrees with
    /// `match_rate + mismatch_rate` by more than the tolerance.
    pub inconsistent_groups: usize,
}

#[derive(Debug, Clone)]
pub struct Aggregation {
    pub observations: Vec<SchoolGroupObservation>,
    pub report: AggregationReport,
}

/// Runs the whole chain. `rate_tolerance` is the absolute tolerance used when
/// auditing `match + mismatch ≈ total` on the aggregated rates.
pub fn aggregate(raw: &[RawObservation], rate_tolerance: f64) -> Aggregation {
    let counts = scale_up(raw);
    let groups = sum_across_grades(&counts);
    let rates = scale_down(&groups);
    let inconsistent_groups = count_inconsistent(&rates, rate_tolerance);
    let (defined, dropped_rates) = keep_defined_rates(rates);
    let derived = attach_school_totals(&defined);
    let (observations, dropped_rows) = drop_undefined(derived);
    let dropped_undefined = dropped_rates + dropped_rows;

    let report = AggregationReport {
        raw_rows: raw.len(),
        partially_defined_rows: raw
            .iter()
            .filter(|r| r.match_value.is_nan() != r.mismatch_value.is_nan())
            .count(),
        groups: groups.len(),
        dropped_undefined,
        inconsistent_groups,
    };

    log::info!(
        "Aggregated {} raw rows into {} school/group rows; {} kept, {} dropped as undefined.",
        report.raw_rows,
        report.groups,
        observations.len(),
        report.dropped_undefined
    );
    if report.partially_defined_rows > 0 {
        log::warn!(
            "{} raw rows define only one of MatchValue/MismatchValue; their groups are dropped.",
            report.partially_defined_rows
        );
    }
    if report.inconsistent_groups > 0 {
        log::warn!(
            "{} groups have MatchValue + MismatchValue differing from TotalTeacher by more than {}.",
            report.inconsistent_groups,
            rate_tolerance
        );
    }

    Aggregation {
        observations,
        report,
    }
}

/// Converts per-student rates into expected counts. A zero-enrollment row
/// contributes zero counts even when its rates are undefined.
pub fn scale_up(raw: &[RawObservation]) -> Vec<GradeCounts> {
    raw.iter()
        .map(|row| {
            let scale = |rate: f64| {
                if row.enroll_count == 0.0 {
                    0.0
                } else {
                    rate * row.enroll_count
                }
            };
            GradeCounts {
                school: row.school.clone(),
                ethnic_group: row.ethnic_group.clone(),
                enroll_count: row.enroll_count,
                match_count: scale(row.match_value),
                mismatch_count: scale(row.mismatch_value),
                teacher_count: scale(row.total_teacher),
            }
        })
        .collect()
}

/// Sums counts per (school, ethnic group), discarding the grade category.
/// Undefined counts propagate into the sum.
pub fn sum_across_grades(counts: &[GradeCounts]) -> Vec<GroupCounts> {
    let mut groups: BTreeMap<(&SchoolId, &str), GroupCounts> = BTreeMap::new();
    for row in counts {
        let entry = groups
            .entry((&row.school, row.ethnic_group.as_str()))
            .or_insert_with(|| GroupCounts {
                school: row.school.clone(),
                ethnic_group: row.ethnic_group.clone(),
                grades: 0,
                enroll_count: 0.0,
                match_count: 0.0,
                mismatch_count: 0.0,
                teacher_count: 0.0,
            });
        entry.grades += 1;
        entry.enroll_count += row.enroll_count;
        entry.match_count += row.match_count;
        entry.mismatch_count += row.mismatch_count;
        entry.teacher_count += row.teacher_count;
    }
    groups.into_values().collect()
}

/// Divides summed counts by summed enrollment. Zero enrollment yields `NaN`.
pub fn scale_down(groups: &[GroupCounts]) -> Vec<GroupRates> {
    groups
        .iter()
        .map(|g| {
            let per_student = |count: f64| count / g.enroll_count;
            let match_rate = per_student(g.match_count);
            let mismatch_rate = per_student(g.mismatch_count);
            GroupRates {
                school: g.school.clone(),
                ethnic_group: g.ethnic_group.clone(),
                enroll_count: g.enroll_count,
                match_rate,
                mismatch_rate,
                total_teacher: match_rate + mismatch_rate,
                reported_total_teacher: per_student(g.teacher_count),
            }
        })
        .collect()
}

/// Keeps groups whose rates are finite with a positive total-teacher rate.
/// Returns the kept groups and the number dropped.
pub fn keep_defined_rates(rates: Vec<GroupRates>) -> (Vec<GroupRates>, usize) {
    let before = rates.len();
    let kept: Vec<GroupRates> = rates
        .into_iter()
        .filter(|r| {
            [r.enroll_count, r.match_rate, r.mismatch_rate, r.total_teacher]
                .iter()
                .all(|v| v.is_finite())
                && r.total_teacher > 0.0
        })
        .collect();
    let dropped = before - kept.len();
    (kept, dropped)
}

/// Adds school-wide enrollment (over the school's groups in `rates`), the
/// group's enrollment share and the match proportion.
pub fn attach_school_totals(rates: &[GroupRates]) -> Vec<SchoolGroupObservation> {
    let mut totals: BTreeMap<&SchoolId, f64> = BTreeMap::new();
    for row in rates {
        *totals.entry(&row.school).or_insert(0.0) += row.enroll_count;
    }

    rates
        .iter()
        .map(|row| {
            let enroll_total = totals.get(&row.school).copied().unwrap_or(f64::NAN);
            SchoolGroupObservation {
                school: row.school.clone(),
                ethnic_group: row.ethnic_group.clone(),
                enroll_count: row.enroll_count,
                match_rate: row.match_rate,
                mismatch_rate: row.mismatch_rate,
                total_teacher: row.total_teacher,
                enroll_total,
                enroll_share: row.enroll_count / enroll_total,
                match_prop: row.match_rate / row.total_teacher,
            }
        })
        .collect()
}

/// Keeps only fully defined rows with a positive total-teacher rate. Returns
/// the kept rows and the number dropped.
pub fn drop_undefined(rows: Vec<SchoolGroupObservation>) -> (Vec<SchoolGroupObservation>, usize) {
    let before = rows.len();
    let kept: Vec<SchoolGroupObservation> = rows.into_iter().filter(|r| r.is_defined()).collect();
    let dropped = before - kept.len();
    (kept, dropped)
}

fn count_inconsistent(rates: &[GroupRates], tolerance: f64) -> usize {
    rates
        .iter()
        .filter(|r| {
            r.total_teacher.is_finite()
                && r.reported_total_teacher.is_finite()
                && (r.total_teacher - r.reported_total_teacher).abs() > tolerance
        })
        .count()
}
