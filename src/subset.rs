use arrow::{array::BooleanArray, compute::filter_record_batch};
use tracing::info;

use crate::{
    columns,
    config::AnalysisConfig,
    error::{AnalysisError, AnalysisResult},
    load::LabeledTable,
    recode::{with_columns, CONDOM_USE_COLUMN, EDUCATION_COLUMN},
};

/// Scaled sampling weight carried by the analysis table.
pub const WEIGHT_COLUMN: &str = "wt";

/// Columns kept in the analysis table, in output order.
pub fn analysis_columns(cfg: &AnalysisConfig) -> Vec<String> {
    let f = &cfg.fields;
    let k = &cfg.respondent_keys;
    vec![
        k.cluster.clone(),
        k.household.clone(),
        k.member.clone(),
        f.psu.clone(),
        f.stratum.clone(),
        f.weight.clone(),
        WEIGHT_COLUMN.to_string(),
        CONDOM_USE_COLUMN.to_string(),
        EDUCATION_COLUMN.to_string(),
        f.education.clone(),
        f.age_group.clone(),
        f.wealth.clone(),
        f.residence.clone(),
        f.region.clone(),
        f.partners_12m.clone(),
    ]
}

/// Had intercourse in the last 12 months: the partner count is present and
/// non-zero.
pub fn eligibility_mask(partners_12m: &[Option<i64>]) -> BooleanArray {
    partners_12m
        .iter()
        .map(|p| Some(matches!(p, Some(n) if *n != 0)))
        .collect()
}

/// Keep eligible respondents, add the scaled weight and project the fixed
/// column list.
#[tracing::instrument(level = "info", skip_all, fields(rows = table.num_rows()))]
pub fn subset_eligible(table: &LabeledTable, cfg: &AnalysisConfig) -> AnalysisResult<LabeledTable> {
    // 1) eligibility filter
    let partners = columns::i64_codes(&table.batch, &cfg.fields.partners_12m)?;
    let mask = eligibility_mask(&partners);
    let filtered = filter_record_batch(&table.batch, &mask)?;

    // 2) sampling weight on the per-survey scale
    let raw = columns::f64_values(&filtered, &cfg.fields.weight)?;
    let wt: Vec<Option<f64>> = raw.iter().map(|w| w.map(|w| w / cfg.weight_scale)).collect();
    let weighted = with_columns(&filtered, vec![(WEIGHT_COLUMN, columns::f64_array(&wt))])?;

    // 3) projection
    let schema = weighted.schema();
    let mut indices = Vec::new();
    for name in analysis_columns(cfg) {
        let idx = schema
            .index_of(&name)
            .map_err(|_| AnalysisError::MissingColumn(name.clone()))?;
        indices.push(idx);
    }
    let batch = weighted.project(&indices)?;

    info!(
        eligible = batch.num_rows(),
        dropped = table.num_rows() - batch.num_rows(),
        "subset to respondents with recent intercourse"
    );
    Ok(LabeledTable::new("analysis", batch, table.labels.clone()))
}
