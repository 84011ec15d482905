use serde::Serialize;
use tracing::{info, warn};

use crate::{
    config::RespondentFields,
    error::AnalysisResult,
    load::LabeledTable,
    recode::EDUCATION_COLUMN,
};

/// Unweighted Pearson correlations over complete cases.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CorrelationMatrix {
    pub columns: Vec<String>,
    pub values: Vec<Vec<f64>>,
    /// Rows with every column present.
    pub n: usize,
}

impl CorrelationMatrix {
    pub fn get(&self, a: &str, b: &str) -> Option<f64> {
        let i = self.columns.iter().position(|c| c == a)?;
        let j = self.columns.iter().position(|c| c == b)?;
        Some(self.values[i][j])
    }
}

/// Model covariates checked for collinearity.
pub fn covariate_columns(fields: &RespondentFields) -> Vec<String> {
    vec![
        EDUCATION_COLUMN.to_string(),
        fields.age_group.clone(),
        fields.wealth.clone(),
        fields.residence.clone(),
        fields.region.clone(),
    ]
}

#[tracing::instrument(level = "info", skip_all, fields(columns = columns.len()))]
pub fn correlation_matrix(
    table: &LabeledTable,
    columns: &[String],
) -> AnalysisResult<CorrelationMatrix> {
    let mut data = Vec::with_capacity(columns.len());
    for c in columns {
        data.push(crate::columns::f64_values(&table.batch, c)?);
    }
    let rows: Vec<usize> = (0..table.num_rows())
        .filter(|&i| data.iter().all(|col| col[i].is_some()))
        .collect();
    let complete: Vec<Vec<f64>> = data
        .iter()
        .map(|col| rows.iter().map(|&i| col[i].unwrap_or_default()).collect())
        .collect();

    let k = columns.len();
    let mut values = vec![vec![f64::NAN; k]; k];
    for a in 0..k {
        for b in a..k {
            let r = if a == b { 1.0 } else { pearson(&complete[a], &complete[b]) };
            values[a][b] = r;
            values[b][a] = r;
        }
    }

    for (a, col) in columns.iter().enumerate() {
        if (0..k).any(|b| b != a && values[a][b].is_nan()) {
            warn!(column = %col, "zero variance among complete cases; correlations undefined");
        }
    }
    info!(n = rows.len(), "covariate correlations computed");
    Ok(CorrelationMatrix {
        columns: columns.to_vec(),
        values,
        n: rows.len(),
    })
}

fn pearson(x: &[f64], y: &[f64]) -> f64 {
    let n = x.len() as f64;
    if x.len() < 2 {
        return f64::NAN;
    }
    let mx = x.iter().sum::<f64>() / n;
    let my = y.iter().sum::<f64>() / n;
    let (mut sxy, mut sxx, mut syy) = (0.0, 0.0, 0.0);
    for (a, b) in x.iter().zip(y) {
        sxy += (a - mx) * (b - my);
        sxx += (a - mx).powi(2);
        syy += (b - my).powi(2);
    }
    if sxx == 0.0 || syy == 0.0 {
        return f64::NAN;
    }
    sxy / (sxx * syy).sqrt()
}
