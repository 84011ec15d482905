use serde::Serialize;
use statrs::distribution::{ContinuousCDF, Normal};

use super::SurveyDesign;
use crate::error::{AnalysisError, AnalysisResult};

/// Two-sided standard-normal critical value for a confidence level.
pub fn normal_critical(level: f64) -> f64 {
    Normal::new(0.0, 1.0)
        .map(|std| std.inverse_cdf(0.5 + level / 2.0))
        .unwrap_or(f64::NAN)
}

/// Weighted (ratio) mean with its linearization standard error.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MeanEstimate {
    pub mean: f64,
    pub se: f64,
    pub ci_low: f64,
    pub ci_high: f64,
    /// Design variance over the variance a simple random sample of the same
    /// size would give.
    pub deff: Option<f64>,
    /// Unweighted rows in the domain.
    pub n: usize,
    pub weighted_n: f64,
}

impl SurveyDesign {
    /// Weighted mean of `values` over `domain`, skipping missing values.
    ///
    /// Rows outside the domain keep a zero score, so their PSUs remain part of
    /// the variance computation (domain estimation, not a subsetted design).
    pub fn weighted_mean(
        &self,
        values: &[Option<f64>],
        domain: &[bool],
        level: f64,
        what: &str,
    ) -> AnalysisResult<MeanEstimate> {
        let w = self.weights();
        let rows: Vec<(usize, f64)> = values
            .iter()
            .enumerate()
            .filter(|(i, _)| domain[*i])
            .filter_map(|(i, v)| v.map(|y| (i, y)))
            .collect();

        let total_w: f64 = rows.iter().map(|(i, _)| w[*i]).sum();
        if rows.is_empty() || total_w <= 0.0 {
            return Err(AnalysisError::EmptyDomain(what.to_string()));
        }
        let mean = rows.iter().map(|(i, y)| w[*i] * y).sum::<f64>() / total_w;

        let mut scores = vec![0.0; self.num_rows()];
        for &(i, y) in &rows {
            scores[i] = w[i] * (y - mean) / total_w;
        }
        let var = self.variance(&scores)?.max(0.0);
        let se = var.sqrt();
        let z = normal_critical(level);

        let n = rows.len();
        let deff = if n > 1 {
            let pop_var = rows
                .iter()
                .map(|(i, y)| w[*i] * (y - mean).powi(2))
                .sum::<f64>()
                / total_w
                * n as f64
                / (n as f64 - 1.0);
            let srs_var = pop_var / n as f64;
            (srs_var > 0.0).then(|| var / srs_var)
        } else {
            None
        };

        Ok(MeanEstimate {
            mean,
            se,
            ci_low: mean - z * se,
            ci_high: mean + z * se,
            deff,
            n,
            weighted_n: total_w,
        })
    }
}
