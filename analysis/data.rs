//! # Record Loading and Validation Module
//!
//! This module is the exclusive entry point for the raw race-match extract.
//! It reads one comma-separated file, validates it against a fixed schema and
//! turns every row into a [`RawObservation`] (one per school, grade category
//! and ethnic group).
//!
//! - Strict Schema: column names are not configurable. Missing columns,
//!   malformed enrollment counts and unknown school types are fatal.
//! - Rate columns may be empty or `NA`. Those become `NaN` and are dealt with
//!   by the aggregator's data-quality filter rather than rejected here.
//! - Every column is read as text first so that identifier codes keep their
//!   leading zeros; numeric columns are then cast through `polars`.

use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::fs::File;
use std::path::Path;
use thiserror::Error;

/// Canonical column names of the input extract.
pub mod columns {
    pub const CDS_CODE: &str = "CDS_CODE";
    pub const DISTRICT_CODE: &str = "DistrictCode";
    pub const SCHOOL_CODE: &str = "SchoolCode";
    pub const COUNTY: &str = "COUNTY";
    pub const DISTRICT: &str = "DISTRICT";
    pub const SCHOOL: &str = "SCHOOL";
    pub const GRADE_CATEGORY: &str = "GradeCategory";
    pub const SCHOOL_TYPE: &str = "SchoolType";
    pub const ETHNIC_GROUP: &str = "EthnicGroup";
    pub const ELEMENTARY: &str = "Elementary";
    pub const ENROLL_COUNT: &str = "EnrollCount";
    pub const MATCH_VALUE: &str = "MatchValue";
    pub const MISMATCH_VALUE: &str = "MismatchValue";
    pub const TOTAL_TEACHER: &str = "TotalTeacher";

    pub const REQUIRED: [&str; 14] = [
        CDS_CODE,
        DISTRICT_CODE,
        SCHOOL_CODE,
        COUNTY,
        DISTRICT,
        SCHOOL,
        GRADE_CATEGORY,
        SCHOOL_TYPE,
        ETHNIC_GROUP,
        ELEMENTARY,
        ENROLL_COUNT,
        MATCH_VALUE,
        MISMATCH_VALUE,
        TOTAL_TEACHER,
    ];
}

/// Governance category of a school.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SchoolType {
    Charter,
    #[serde(rename = "TPS")]
    Tps,
}

impl SchoolType {
    pub const ALL: [SchoolType; 2] = [SchoolType::Charter, SchoolType::Tps];

    /// The label used by the extract.
    pub fn label(self) -> &'static str {
        match self {
            SchoolType::Charter => "Charter",
            SchoolType::Tps => "TPS",
        }
    }

    pub fn parse(text: &str) -> Option<Self> {
        match text.trim() {
            "TPS" => Some(SchoolType::Tps),
            "Charter" => Some(SchoolType::Charter),
            _ => None,
        }
    }
}

impl fmt::Display for SchoolType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Everything that identifies a school. Ordered so that aggregation output is
/// deterministic.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SchoolId {
    pub cds_code: String,
    pub district_code: String,
    pub school_code: String,
    pub county: String,
    pub district: String,
    pub school: String,
    pub school_type: SchoolType,
    /// Whether the school serves grades K-5.
    pub elementary: bool,
}

/// One row of the extract: a school, a grade category and an ethnic group.
///
/// `match_value`, `mismatch_value` and `total_teacher` are rates, i.e. the
/// average number of same-race, different-race and total teachers per student.
/// An undefined rate is stored as `NaN`.
#[derive(Debug, Clone, PartialEq)]
pub struct RawObservation {
    pub school: SchoolId,
    pub grade_category: String,
    pub ethnic_group: String,
    pub enroll_count: f64,
    pub match_value: f64,
    pub mismatch_value: f64,
    pub total_teacher: f64,
}

/// A comprehensive error type for all data loading and validation failures.
#[derive(Error, Debug)]
pub enum DataError {
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    PolarsError(#[from] PolarsError),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error(
        "The required column '{0}' was not found in the input file. Please check spelling and case."
    )]
    ColumnNotFound(String),
    #[error(
        "The column '{column_name}' could not be converted to the expected type '{expected_type}' (offending value: {found_value})"
    )]
    ColumnWrongType {
        column_name: String,
        expected_type: &'static str,
        found_value: String,
    },
    #[error(
        "Missing or null values were found in the required column '{column_name}' (first at data row {row})."
    )]
    MissingValuesFound { column_name: String, row: usize },
    #[error("Unknown school type '{value}' at data row {row}; expected 'TPS' or 'Charter'.")]
    UnknownSchoolType { value: String, row: usize },
    #[error("Invalid boolean '{value}' in column '{column_name}' at data row {row}.")]
    InvalidBoolean {
        column_name: String,
        value: String,
        row: usize,
    },
    #[error("Enrollment count must be a finite, non-negative number; found {value} at data row {row}.")]
    InvalidEnrollment { value: f64, row: usize },
    #[error("The input file '{0}' contains no data rows.")]
    EmptyInput(String),
}

/// Loads and validates the raw extract.
pub fn load_raw_observations(path: &Path) -> Result<Vec<RawObservation>, DataError> {
    log::info!("Loading raw observations from '{}'", path.display());

    let df = CsvReader::new(File::open(path)?)
        .with_options(
            CsvReadOptions::default()
                .with_has_header(true)
                // Read every column as text; numeric casts happen per column below.
                .with_infer_schema_length(Some(0))
                .with_parse_options(
                    CsvParseOptions::default()
                        .with_null_values(Some(NullValues::AllColumnsSingle("NA".into()))),
                ),
        )
        .finish()?;

    if df.height() == 0 {
        return Err(DataError::EmptyInput(path.display().to_string()));
    }

    let present: HashSet<String> = df
        .get_column_names()
        .into_iter()
        .map(|s| s.to_string())
        .collect();
    for name in columns::REQUIRED {
        if !present.contains(name) {
            return Err(DataError::ColumnNotFound(name.to_string()));
        }
    }
    log::debug!("All required columns found: {:?}", columns::REQUIRED);

    let cds_code = internal::required_text(&df, columns::CDS_CODE)?;
    let district_code = internal::required_text(&df, columns::DISTRICT_CODE)?;
    let school_code = internal::required_text(&df, columns::SCHOOL_CODE)?;
    let county = internal::required_text(&df, columns::COUNTY)?;
    let district = internal::required_text(&df, columns::DISTRICT)?;
    let school = internal::required_text(&df, columns::SCHOOL)?;
    let grade_category = internal::required_text(&df, columns::GRADE_CATEGORY)?;
    let school_type = internal::school_types(&df)?;
    let ethnic_group = internal::required_text(&df, columns::ETHNIC_GROUP)?;
    let elementary = internal::booleans(&df, columns::ELEMENTARY)?;
    let enroll_count = internal::enrollment(&df)?;
    let match_value = internal::rates(&df, columns::MATCH_VALUE)?;
    let mismatch_value = internal::rates(&df, columns::MISMATCH_VALUE)?;
    let total_teacher = internal::rates(&df, columns::TOTAL_TEACHER)?;

    let rows: Vec<RawObservation> = (0..df.height())
        .map(|i| RawObservation {
            school: SchoolId {
                cds_code: cds_code[i].clone(),
                district_code: district_code[i].clone(),
                school_code: school_code[i].clone(),
                county: county[i].clone(),
                district: district[i].clone(),
                school: school[i].clone(),
                school_type: school_type[i],
                elementary: elementary[i],
            },
            grade_category: grade_category[i].clone(),
            ethnic_group: ethnic_group[i].clone(),
            enroll_count: enroll_count[i],
            match_value: match_value[i],
            mismatch_value: mismatch_value[i],
            total_teacher: total_teacher[i],
        })
        .collect();

    log::info!("Loaded {} raw observations.", rows.len());
    Ok(rows)
}

/// Parses the spellings of a boolean flag seen in CDE-style extracts.
pub fn parse_flag(text: &str) -> Option<bool> {
    match text.trim().to_ascii_lowercase().as_str() {
        "true" | "t" | "1" | "yes" | "y" => Some(true),
        "false" | "f" | "0" | "no" | "n" => Some(false),
        _ => None,
    }
}

mod internal {
    use super::*;

    fn text_chunks<'a>(df: &'a DataFrame, column_name: &str) -> Result<&'a StringChunked, DataError> {
        Ok(df.column(column_name)?.as_materialized_series().str()?)
    }

    /// Text column with no missing values.
    pub(super) fn required_text(df: &DataFrame, column_name: &str) -> Result<Vec<String>, DataError> {
        text_chunks(df, column_name)?
            .into_iter()
            .enumerate()
            .map(|(i, value)| match value {
                Some(text) => Ok(text.trim().to_string()),
                None => Err(DataError::MissingValuesFound {
                    column_name: column_name.to_string(),
                    row: i + 1,
                }),
            })
            .collect()
    }

    pub(super) fn school_types(df: &DataFrame) -> Result<Vec<SchoolType>, DataError> {
        required_text(df, columns::SCHOOL_TYPE)?
            .into_iter()
            .enumerate()
            .map(|(i, text)| {
                SchoolType::parse(&text).ok_or(DataError::UnknownSchoolType {
                    value: text,
                    row: i + 1,
                })
            })
            .collect()
    }

    pub(super) fn booleans(df: &DataFrame, column_name: &str) -> Result<Vec<bool>, DataError> {
        required_text(df, column_name)?
            .into_iter()
            .enumerate()
            .map(|(i, text)| {
                parse_flag(&text).ok_or_else(|| DataError::InvalidBoolean {
                    column_name: column_name.to_string(),
                    value: text,
                    row: i + 1,
                })
            })
            .collect()
    }

    /// Casts a text column to `f64`, keeping nulls as `None`. A value that was
    /// present in the file but failed the cast is a type error.
    fn numeric(df: &DataFrame, column_name: &str) -> Result<Vec<Option<f64>>, DataError> {
        let raw = text_chunks(df, column_name)?;
        let casted = df.column(column_name)?.cast(&DataType::Float64)?;
        let values = casted.f64()?;

        let mut out = Vec::with_capacity(raw.len());
        for (original, value) in raw.into_iter().zip(values.into_iter()) {
            match (original, value) {
                (Some(text), None) => {
                    return Err(DataError::ColumnWrongType {
                        column_name: column_name.to_string(),
                        expected_type: "f64 (numeric)",
                        found_value: text.to_string(),
                    });
                }
                (_, v) => out.push(v),
            }
        }
        Ok(out)
    }

    pub(super) fn enrollment(df: &DataFrame) -> Result<Vec<f64>, DataError> {
        numeric(df, columns::ENROLL_COUNT)?
            .into_iter()
            .enumerate()
            .map(|(i, value)| match value {
                None => Err(DataError::MissingValuesFound {
                    column_name: columns::ENROLL_COUNT.to_string(),
                    row: i + 1,
                }),
                Some(v) if !v.is_finite() || v < 0.0 => {
                    Err(DataError::InvalidEnrollment { value: v, row: i + 1 })
                }
                Some(v) => Ok(v),
            })
            .collect()
    }

    /// Rate column; nulls become `NaN`.
    pub(super) fn rates(df: &DataFrame, column_name: &str) -> Result<Vec<f64>, DataError> {
        Ok(numeric(df, column_name)?
            .into_iter()
            .map(|v| v.unwrap_or(f64::NAN))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use std::io::{self, Write};
    use tempfile::NamedTempFile;

    const HEADER: &str = "CDS_CODE,DistrictCode,SchoolCode,COUNTY,DISTRICT,SCHOOL,GradeCategory,SchoolType,EthnicGroup,Elementary,EnrollCount,MatchValue,MismatchValue,TotalTeacher";

    fn create_test_csv(content: &str) -> io::Result<NamedTempFile> {
        let mut file = NamedTempFile::new()?;
        writeln!(file, "{}", content)?;
        file.flush()?;
        Ok(file)
    }

    fn load(content: &str) -> Result<Vec<RawObservation>, DataError> {
        let file = create_test_csv(content).unwrap();
        load_raw_observations(file.path())
    }

    #[test]
    fn test_load_raw_observations_success() {
        let content = format!(
            "{HEADER}\n\
             01611190130229,61119,0130229,Alameda,Alameda Unified,Alameda High,9-12,TPS,Asian,FALSE,120,0.35,0.65,1.0\n\
             01611190130229,61119,0130229,Alameda,Alameda Unified,Alameda High,9-12,TPS,White,FALSE,80,0.9,0.2,1.1\n\
             01611196090005,61119,6090005,Alameda,Alameda Unified,Bay Charter,K-5,Charter,White,TRUE,40,NA,,0.8"
        );
        let rows = load(&content).unwrap();
        assert_eq!(rows.len(), 3);

        let first = &rows[0];
        assert_eq!(first.school.cds_code, "01611190130229");
        assert_eq!(first.school.school_code, "0130229");
        assert_eq!(first.school.school_type, SchoolType::Tps);
        assert!(!first.school.elementary);
        assert_eq!(first.ethnic_group, "Asian");
        assert_eq!(first.grade_category, "9-12");
        assert_abs_diff_eq!(first.enroll_count, 120.0, epsilon = 1e-12);
        assert_abs_diff_eq!(first.match_value, 0.35, epsilon = 1e-12);

        let charter = &rows[2];
        assert_eq!(charter.school.school_type, SchoolType::Charter);
        assert!(charter.school.elementary);
        assert!(charter.match_value.is_nan());
        assert!(charter.mismatch_value.is_nan());
        assert_abs_diff_eq!(charter.total_teacher, 0.8, epsilon = 1e-12);
    }

    #[test]
    fn test_error_column_not_found() {
        let header = HEADER.replace(",TotalTeacher", "");
        let content = format!("{header}\n1,2,3,C,D,S,K-5,TPS,Asian,TRUE,10,0.1,0.9");
        match load(&content) {
            Err(DataError::ColumnNotFound(col)) => assert_eq!(col, "TotalTeacher"),
            other => panic!("Expected ColumnNotFound, got {:?}", other),
        }
    }

    #[test]
    fn test_error_unknown_school_type() {
        let content = format!("{HEADER}\n1,2,3,C,D,S,K-5,Magnet,Asian,TRUE,10,0.1,0.9,1.0");
        match load(&content) {
            Err(DataError::UnknownSchoolType { value, row }) => {
                assert_eq!(value, "Magnet");
                assert_eq!(row, 1);
            }
            other => panic!("Expected UnknownSchoolType, got {:?}", other),
        }
    }

    #[test]
    fn test_error_wrong_type_in_enrollment() {
        let content = format!("{HEADER}\n1,2,3,C,D,S,K-5,TPS,Asian,TRUE,many,0.1,0.9,1.0");
        match load(&content) {
            Err(DataError::ColumnWrongType {
                column_name,
                found_value,
                ..
            }) => {
                assert_eq!(column_name, "EnrollCount");
                assert_eq!(found_value, "many");
            }
            other => panic!("Expected ColumnWrongType, got {:?}", other),
        }
    }

    #[test]
    fn test_error_missing_enrollment() {
        let content = format!("{HEADER}\n1,2,3,C,D,S,K-5,TPS,Asian,TRUE,NA,0.1,0.9,1.0");
        match load(&content) {
            Err(DataError::MissingValuesFound { column_name, row }) => {
                assert_eq!(column_name, "EnrollCount");
                assert_eq!(row, 1);
            }
            other => panic!("Expected MissingValuesFound, got {:?}", other),
        }
    }

    #[test]
    fn test_error_negative_enrollment() {
        let content = format!("{HEADER}\n1,2,3,C,D,S,K-5,TPS,Asian,TRUE,-4,0.1,0.9,1.0");
        assert!(matches!(
            load(&content),
            Err(DataError::InvalidEnrollment { row: 1, .. })
        ));
    }

    #[test]
    fn test_error_invalid_boolean() {
        let content = format!("{HEADER}\n1,2,3,C,D,S,K-5,TPS,Asian,maybe,4,0.1,0.9,1.0");
        assert!(matches!(
            load(&content),
            Err(DataError::InvalidBoolean { row: 1, .. })
        ));
    }

    #[test]
    fn test_error_empty_input() {
        assert!(matches!(load(HEADER), Err(DataError::EmptyInput(_))));
    }

    #[test]
    fn test_parse_flag_spellings() {
        assert_eq!(parse_flag("TRUE"), Some(true));
        assert_eq!(parse_flag(" yes "), Some(true));
        assert_eq!(parse_flag("F"), Some(false));
        assert_eq!(parse_flag("0"), Some(false));
        assert_eq!(parse_flag("2"), None);
    }
}
