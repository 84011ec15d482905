// src/pipeline.rs

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::info;

use crate::{
    config::AnalysisConfig,
    design::{DesignSpec, SurveyDesign},
    diagnostics::{correlation_matrix, covariate_columns, CorrelationMatrix},
    load::load_extract,
    merge::merge_on_household_key,
    model::{fit_logit, LogitFit, LogitOptions, ModelSpec},
    recode::{apply_recodes, RecodeSummary, CONDOM_USE_COLUMN},
    report,
    subset::{subset_eligible, WEIGHT_COLUMN},
    tabulate::{describe, Descriptives},
};

/// Everything one run produced, for callers that want more than the printout.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub merged_rows: usize,
    pub analysis_rows: usize,
    pub recode: RecodeSummary,
    pub descriptives: Descriptives,
    pub unadjusted: LogitFit,
    pub adjusted: LogitFit,
    pub correlations: CorrelationMatrix,
}

pub fn design_spec(cfg: &AnalysisConfig) -> DesignSpec {
    DesignSpec {
        psu: cfg.fields.psu.clone(),
        stratum: cfg.fields.stratum.clone(),
        weight: WEIGHT_COLUMN.to_string(),
        nest: true,
        lonely_psu: cfg.lonely_psu,
    }
}

/// Load, merge, recode, subset, estimate and report.
#[tracing::instrument(level = "info", skip_all)]
pub fn run(cfg: &AnalysisConfig) -> Result<RunSummary> {
    // 1) extracts
    let respondents = load_extract(&cfg.respondent_path, "respondent")?;
    let members = load_extract(&cfg.household_path, "household")?;

    // 2) join and derive
    let merged = merge_on_household_key(
        &respondents,
        &cfg.respondent_keys,
        &members,
        &cfg.household_keys,
    )
    .with_context(|| {
        format!(
            "joining {} with {}",
            cfg.respondent_path.display(),
            cfg.household_path.display()
        )
    })?;
    let (recoded, recode) = apply_recodes(&merged, &cfg.fields)?;
    let analysis = subset_eligible(&recoded, cfg)?;
    if let Some(path) = &cfg.analysis_table_path {
        report::write_analysis_table(&analysis, path)?;
    }

    // 3) design-based estimation
    let design = SurveyDesign::new(analysis, &design_spec(cfg))?;
    let descriptives = describe(&design, CONDOM_USE_COLUMN, &cfg.covariates, cfg.confidence_level)?;
    let opts = LogitOptions {
        confidence_level: cfg.confidence_level,
        ..LogitOptions::default()
    };
    let unadjusted = fit_logit(&design, &ModelSpec::unadjusted(), &opts)?;
    let adjusted = fit_logit(&design, &ModelSpec::adjusted(&cfg.fields), &opts)?;
    let correlations = correlation_matrix(design.table(), &covariate_columns(&cfg.fields))?;

    // 4) console and workbook
    let labels = &design.table().labels;
    println!("{}", report::render_recode_summary(&recode));
    println!("{}", report::render_descriptives(&descriptives, labels));
    println!("{}", report::render_fit(&unadjusted, labels));
    println!("{}", report::render_fit(&adjusted, labels));
    println!("{}", report::render_correlations(&correlations));
    report::xlsx::write_workbook(
        &cfg.workbook_path,
        &cfg.sheet_name,
        &report::descriptive_rows(&descriptives, labels),
    )?;

    let summary = RunSummary {
        merged_rows: merged.num_rows(),
        analysis_rows: design.num_rows(),
        recode,
        descriptives,
        unadjusted,
        adjusted,
        correlations,
    };
    if let Some(path) = &cfg.summary_path {
        report::write_json(&summary, path)?;
    }

    info!(
        merged = summary.merged_rows,
        analysed = summary.analysis_rows,
        workbook = %cfg.workbook_path.display(),
        "analysis complete"
    );
    Ok(summary)
}
