// src/recode.rs

use arrow::{
    array::ArrayRef,
    datatypes::{DataType, Field, Schema},
    record_batch::RecordBatch,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

use crate::{
    columns,
    config::RespondentFields,
    error::AnalysisResult,
    load::LabeledTable,
};

pub const CONDOM_USE_COLUMN: &str = "condom_use";
pub const EDUCATION_COLUMN: &str = "education";

/// Code parked on respondents with no recent intercourse before it is turned
/// into missing.
pub const NO_RECENT_SEX_SENTINEL: i64 = 99;

/// How one respondent's raw condom-use answer was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeCode {
    /// 0 = did not use, 1 = used.
    Value(i64),
    /// No intercourse in the reference period.
    NoRecentSex,
    /// A code outside {0, 1} on a respondent who did report recent sex.
    OutOfDomain,
    Null,
}

impl OutcomeCode {
    /// Numeric code before missing-value conversion (the sentinel survives here).
    pub fn raw_code(self) -> Option<i64> {
        match self {
            OutcomeCode::Value(v) => Some(v),
            OutcomeCode::NoRecentSex => Some(NO_RECENT_SEX_SENTINEL),
            OutcomeCode::OutOfDomain | OutcomeCode::Null => None,
        }
    }

    /// Value as it enters the analysis table: only 0 or 1, else missing.
    pub fn value(self) -> Option<f64> {
        self.raw_code()
            .filter(|c| *c != NO_RECENT_SEX_SENTINEL)
            .map(|c| c as f64)
    }
}

pub fn classify_condom_use(raw: Option<i64>, partners_12m: Option<i64>) -> OutcomeCode {
    match raw {
        Some(0) => OutcomeCode::Value(0),
        Some(1) => OutcomeCode::Value(1),
        _ if partners_12m == Some(0) => OutcomeCode::NoRecentSex,
        None => OutcomeCode::Null,
        Some(_) => OutcomeCode::OutOfDomain,
    }
}

/// 0 stays "no education"; any level from primary up collapses to 1.
pub fn recode_education(raw: Option<i64>) -> Option<i64> {
    match raw {
        Some(0) => Some(0),
        Some(level) if level >= 1 => Some(1),
        _ => None,
    }
}

/// Per-category tallies of one recode pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecodeSummary {
    pub used: usize,
    pub not_used: usize,
    pub no_recent_sex: usize,
    pub out_of_domain: usize,
    pub null_outcome: usize,
    pub no_education: usize,
    pub some_education: usize,
    pub education_missing: usize,
}

impl RecodeSummary {
    fn count_outcome(&mut self, code: OutcomeCode) {
        match code {
            OutcomeCode::Value(0) => self.not_used += 1,
            OutcomeCode::Value(_) => self.used += 1,
            OutcomeCode::NoRecentSex => self.no_recent_sex += 1,
            OutcomeCode::OutOfDomain => self.out_of_domain += 1,
            OutcomeCode::Null => self.null_outcome += 1,
        }
    }

    fn count_education(&mut self, code: Option<i64>) {
        match code {
            Some(0) => self.no_education += 1,
            Some(_) => self.some_education += 1,
            None => self.education_missing += 1,
        }
    }
}

/// Append `condom_use` and `education` to the table. Raw columns are left as
/// they were; an existing derived column of the same name is replaced.
#[tracing::instrument(level = "info", skip_all, fields(rows = table.num_rows()))]
pub fn apply_recodes(
    table: &LabeledTable,
    fields: &RespondentFields,
) -> AnalysisResult<(LabeledTable, RecodeSummary)> {
    let raw_condom = columns::i64_codes(&table.batch, &fields.condom_last_sex)?;
    let partners = columns::i64_codes(&table.batch, &fields.partners_12m)?;
    let raw_edu = columns::i64_codes(&table.batch, &fields.education)?;

    let mut summary = RecodeSummary::default();
    let mut condom = Vec::with_capacity(table.num_rows());
    let mut education = Vec::with_capacity(table.num_rows());
    for i in 0..table.num_rows() {
        let code = classify_condom_use(raw_condom[i], partners[i]);
        summary.count_outcome(code);
        condom.push(code.value());

        let edu = recode_education(raw_edu[i]);
        summary.count_education(edu);
        education.push(edu.map(|e| e as f64));
    }

    let batch = with_columns(
        &table.batch,
        vec![
            (CONDOM_USE_COLUMN, columns::f64_array(&condom)),
            (EDUCATION_COLUMN, columns::f64_array(&education)),
        ],
    )?;

    let mut labels = table.labels.clone();
    labels.set_variable_label(CONDOM_USE_COLUMN, "Condom used at last sex");
    labels.set_value_labels(CONDOM_USE_COLUMN, [(0, "Did not use"), (1, "Used")]);
    labels.set_variable_label(EDUCATION_COLUMN, "Education");
    labels.set_value_labels(EDUCATION_COLUMN, [(0, "No education"), (1, "Primary or higher")]);

    if summary.out_of_domain > 0 {
        warn!(
            count = summary.out_of_domain,
            column = %fields.condom_last_sex,
            "condom-use codes outside {{0, 1}} treated as missing"
        );
    }
    info!(
        used = summary.used,
        not_used = summary.not_used,
        no_recent_sex = summary.no_recent_sex,
        null = summary.null_outcome,
        education_missing = summary.education_missing,
        "recoded outcome and education"
    );
    Ok((LabeledTable::new(table.name.clone(), batch, labels), summary))
}

/// Copy of `batch` with each `(name, array)` appended, replacing any column
/// already carrying that name.
pub fn with_columns(
    batch: &RecordBatch,
    added: Vec<(&str, ArrayRef)>,
) -> AnalysisResult<RecordBatch> {
    let schema = batch.schema();
    let mut fields: Vec<Field> = Vec::with_capacity(schema.fields().len() + added.len());
    let mut arrays: Vec<ArrayRef> = Vec::with_capacity(fields.capacity());
    for (field, arr) in schema.fields().iter().zip(batch.columns()) {
        if added.iter().any(|(n, _)| n == field.name()) {
            continue;
        }
        fields.push(field.as_ref().clone());
        arrays.push(arr.clone());
    }
    for (name, arr) in added {
        fields.push(Field::new(name, DataType::Float64, true));
        arrays.push(arr);
    }
    Ok(RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays)?)
}
