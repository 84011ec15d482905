// src/tabulate/mod.rs

pub mod chisq;

use serde::Serialize;
use tracing::{debug, info};

use crate::{
    config::CovariateSpec,
    design::{MeanEstimate, SurveyDesign},
    error::{AnalysisError, AnalysisResult},
};

pub use chisq::{rao_scott, ChiSquareTest};
use chisq::CodedPairs;

/// Which statistic an [`Estimand`] asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EstimatorKind {
    /// Weighted mean of the outcome over all rows.
    Proportion,
    /// Weighted counts and column percentages of outcome by covariate.
    CrossTab,
    /// Weighted mean of the outcome within each covariate level.
    DomainMeans,
    /// Design-corrected test of independence.
    ChiSquare,
}

/// A requested estimate: an outcome, optionally split by a covariate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Estimand {
    pub outcome: String,
    pub covariate: Option<String>,
    pub kind: EstimatorKind,
}

impl Estimand {
    pub fn proportion(outcome: &str) -> Self {
        Self {
            outcome: outcome.to_string(),
            covariate: None,
            kind: EstimatorKind::Proportion,
        }
    }

    pub fn by(outcome: &str, covariate: &str, kind: EstimatorKind) -> Self {
        Self {
            outcome: outcome.to_string(),
            covariate: Some(covariate.to_string()),
            kind,
        }
    }

    /// The three estimands reported for every covariate.
    pub fn per_covariate(outcome: &str, covariate: &str) -> [Self; 3] {
        [
            EstimatorKind::CrossTab,
            EstimatorKind::DomainMeans,
            EstimatorKind::ChiSquare,
        ]
        .map(|kind| Self::by(outcome, covariate, kind))
    }

    fn covariate(&self) -> AnalysisResult<&str> {
        self.covariate
            .as_deref()
            .ok_or_else(|| AnalysisError::MissingColumn(format!("covariate for {:?}", self.kind)))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CrossTab {
    pub outcome: String,
    pub covariate: String,
    pub outcome_levels: Vec<i64>,
    pub covariate_levels: Vec<i64>,
    /// Weighted counts, `counts[outcome][covariate]`.
    pub counts: Vec<Vec<f64>>,
    /// Percent of each covariate level, one decimal.
    pub column_percent: Vec<Vec<f64>>,
    /// Unweighted rows per covariate level.
    pub level_n: Vec<usize>,
    pub unweighted_n: usize,
}

impl CrossTab {
    pub fn column_total(&self, col: usize) -> f64 {
        self.counts.iter().map(|row| row[col]).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DomainMean {
    pub level: i64,
    pub estimate: MeanEstimate,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Estimate {
    Proportion(MeanEstimate),
    CrossTab(CrossTab),
    DomainMeans(Vec<DomainMean>),
    ChiSquare(ChiSquareTest),
}

/// Everything reported for one covariate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CovariateSummary {
    pub column: String,
    pub label: String,
    pub crosstab: CrossTab,
    pub means: Vec<DomainMean>,
    pub test: ChiSquareTest,
}

impl CovariateSummary {
    /// Assemble a summary from evaluated estimates; the cross-tab and the
    /// test are required.
    pub fn from_estimates(
        column: &str,
        label: &str,
        estimates: Vec<Estimate>,
    ) -> AnalysisResult<Self> {
        let (mut crosstab, mut means, mut test) = (None, Vec::new(), None);
        for e in estimates {
            match e {
                Estimate::CrossTab(t) => crosstab = Some(t),
                Estimate::DomainMeans(m) => means = m,
                Estimate::ChiSquare(t) => test = Some(t),
                Estimate::Proportion(_) => {}
            }
        }
        let (Some(crosstab), Some(test)) = (crosstab, test) else {
            return Err(AnalysisError::EmptyDomain(format!("summary of {column}")));
        };
        Ok(Self {
            column: column.to_string(),
            label: label.to_string(),
            crosstab,
            means,
            test,
        })
    }
}

/// Descriptive results: the marginal proportion followed by one summary per
/// covariate, in the order the covariates were configured.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Descriptives {
    pub outcome: String,
    pub overall: MeanEstimate,
    pub by_covariate: Vec<(String, CovariateSummary)>,
}

impl Descriptives {
    pub fn get(&self, column: &str) -> Option<&CovariateSummary> {
        self.by_covariate
            .iter()
            .find(|(c, _)| c == column)
            .map(|(_, s)| s)
    }
}

/// Evaluate one estimand against the design.
pub fn estimate(design: &SurveyDesign, what: &Estimand, level: f64) -> AnalysisResult<Estimate> {
    let outcome = what.outcome.as_str();
    Ok(match what.kind {
        EstimatorKind::Proportion => Estimate::Proportion(proportion(design, outcome, level)?),
        EstimatorKind::CrossTab => {
            Estimate::CrossTab(crosstab(design, outcome, what.covariate()?)?)
        }
        EstimatorKind::DomainMeans => {
            Estimate::DomainMeans(domain_means(design, outcome, what.covariate()?, level)?)
        }
        EstimatorKind::ChiSquare => {
            Estimate::ChiSquare(chi_square(design, outcome, what.covariate()?)?)
        }
    })
}

pub fn proportion(
    design: &SurveyDesign,
    outcome: &str,
    level: f64,
) -> AnalysisResult<MeanEstimate> {
    let values = design.values(outcome)?;
    let all = vec![true; design.num_rows()];
    design.weighted_mean(&values, &all, level, outcome)
}

/// Outcome mean within each observed covariate level, ascending by code.
pub fn domain_means(
    design: &SurveyDesign,
    outcome: &str,
    covariate: &str,
    level: f64,
) -> AnalysisResult<Vec<DomainMean>> {
    let values = design.values(outcome)?;
    let codes = design.codes(covariate)?;
    let mut levels: Vec<i64> = codes.iter().flatten().copied().collect();
    levels.sort_unstable();
    levels.dedup();

    let mut means = Vec::with_capacity(levels.len());
    for code in levels {
        let domain: Vec<bool> = codes.iter().map(|c| *c == Some(code)).collect();
        let what = format!("{outcome} by {covariate}={code}");
        let estimate = match design.weighted_mean(&values, &domain, level, &what) {
            Ok(e) => e,
            // level seen only on rows without an outcome
            Err(AnalysisError::EmptyDomain(_)) => continue,
            Err(e) => return Err(e),
        };
        means.push(DomainMean { level: code, estimate });
    }
    Ok(means)
}

pub fn chi_square(
    design: &SurveyDesign,
    outcome: &str,
    covariate: &str,
) -> AnalysisResult<ChiSquareTest> {
    let rows = design.codes(outcome)?;
    let cols = design.codes(covariate)?;
    rao_scott(design, &rows, &cols, &format!("{outcome} x {covariate}"))
}

/// Weighted outcome-by-covariate table over rows where both are present.
pub fn crosstab(design: &SurveyDesign, outcome: &str, covariate: &str) -> AnalysisResult<CrossTab> {
    let rows = design.codes(outcome)?;
    let cols = design.codes(covariate)?;
    let pairs = CodedPairs::new(&rows, &cols);
    if pairs.obs.is_empty() {
        return Err(AnalysisError::EmptyDomain(format!("{outcome} x {covariate}")));
    }

    let w = design.weights();
    let mut counts = vec![vec![0.0; pairs.cols.len()]; pairs.rows.len()];
    let mut level_n = vec![0; pairs.cols.len()];
    for &(i, a, b) in &pairs.obs {
        counts[a][b] += w[i];
        level_n[b] += 1;
    }
    let column_percent = (0..pairs.rows.len())
        .map(|a| {
            (0..pairs.cols.len())
                .map(|b| {
                    let total: f64 = counts.iter().map(|row| row[b]).sum();
                    round1(100.0 * counts[a][b] / total)
                })
                .collect()
        })
        .collect();

    Ok(CrossTab {
        outcome: outcome.to_string(),
        covariate: covariate.to_string(),
        outcome_levels: pairs.rows,
        covariate_levels: pairs.cols,
        counts,
        column_percent,
        level_n,
        unweighted_n: pairs.obs.len(),
    })
}

fn round1(x: f64) -> f64 {
    (x * 10.0).round() / 10.0
}

/// Marginal proportion plus cross-tab, domain means and chi-square test for
/// each covariate.
#[tracing::instrument(
    level = "info",
    skip_all,
    fields(outcome = %outcome, covariates = covariates.len())
)]
pub fn describe(
    design: &SurveyDesign,
    outcome: &str,
    covariates: &[CovariateSpec],
    level: f64,
) -> AnalysisResult<Descriptives> {
    let Estimate::Proportion(overall) = estimate(design, &Estimand::proportion(outcome), level)?
    else {
        return Err(AnalysisError::EmptyDomain(outcome.to_string()));
    };
    info!(
        mean = overall.mean,
        se = overall.se,
        deff = ?overall.deff,
        "weighted proportion of {}", outcome
    );

    let mut by_covariate = Vec::with_capacity(covariates.len());
    for cov in covariates {
        let estimates = Estimand::per_covariate(outcome, &cov.column)
            .iter()
            .map(|what| estimate(design, what, level))
            .collect::<AnalysisResult<Vec<_>>>()?;
        let summary = CovariateSummary::from_estimates(&cov.column, &cov.label, estimates)?;
        debug!(
            covariate = %cov.column,
            levels = summary.crosstab.covariate_levels.len(),
            f = summary.test.f,
            p = summary.test.p_value,
            "covariate tabulated"
        );
        by_covariate.push((cov.column.clone(), summary));
    }

    Ok(Descriptives {
        outcome: outcome.to_string(),
        overall,
        by_covariate,
    })
}
