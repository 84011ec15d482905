// src/model/mod.rs

pub mod logit;

use nalgebra::DMatrix;
use tracing::debug;

use crate::{
    config::RespondentFields,
    design::SurveyDesign,
    error::AnalysisResult,
    recode::{CONDOM_USE_COLUMN, EDUCATION_COLUMN},
};

pub use logit::{fit_logit, Coefficient, LogitFit, LogitOptions};

/// One right-hand-side term.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Term {
    /// Entered as is.
    Numeric(String),
    /// Treatment-coded; the lowest observed code is the reference.
    Factor(String),
}

impl Term {
    pub fn column(&self) -> &str {
        match self {
            Term::Numeric(c) | Term::Factor(c) => c,
        }
    }
}

/// A logistic model: binary outcome, intercept and terms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSpec {
    pub name: String,
    pub outcome: String,
    pub terms: Vec<Term>,
}

impl ModelSpec {
    /// Condom use on education alone.
    pub fn unadjusted() -> Self {
        Self {
            name: "unadjusted".into(),
            outcome: CONDOM_USE_COLUMN.into(),
            terms: vec![Term::Numeric(EDUCATION_COLUMN.into())],
        }
    }

    /// Education adjusted for age group, wealth, residence and region.
    pub fn adjusted(fields: &RespondentFields) -> Self {
        Self {
            name: "adjusted".into(),
            outcome: CONDOM_USE_COLUMN.into(),
            terms: vec![
                Term::Numeric(EDUCATION_COLUMN.into()),
                Term::Factor(fields.age_group.clone()),
                Term::Factor(fields.wealth.clone()),
                Term::Factor(fields.residence.clone()),
                Term::Factor(fields.region.clone()),
            ],
        }
    }
}

/// Which term a design-matrix column comes from.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnInfo {
    pub name: String,
    /// `None` for the intercept.
    pub column: Option<String>,
    /// Factor level the dummy indicates.
    pub level: Option<i64>,
}

/// Design matrix over every row of the survey design. Rows missing the
/// outcome or any term are outside the domain and hold zeros.
#[derive(Debug, Clone)]
pub struct ModelMatrix {
    pub x: DMatrix<f64>,
    pub y: Vec<f64>,
    pub in_domain: Vec<bool>,
    pub columns: Vec<ColumnInfo>,
}

impl ModelMatrix {
    pub fn build(design: &SurveyDesign, spec: &ModelSpec) -> AnalysisResult<Self> {
        let n = design.num_rows();
        let outcome = design.values(&spec.outcome)?;
        let mut term_values: Vec<Vec<Option<f64>>> = Vec::with_capacity(spec.terms.len());
        for term in &spec.terms {
            term_values.push(design.values(term.column())?);
        }

        // 1) complete cases
        let in_domain: Vec<bool> = (0..n)
            .map(|i| outcome[i].is_some() && term_values.iter().all(|v| v[i].is_some()))
            .collect();

        // 2) columns: intercept, numerics, one dummy per non-reference level
        let mut columns = vec![ColumnInfo {
            name: "(Intercept)".into(),
            column: None,
            level: None,
        }];
        let mut sources: Vec<(usize, Option<f64>)> = Vec::new();
        for (t, term) in spec.terms.iter().enumerate() {
            match term {
                Term::Numeric(c) => {
                    columns.push(ColumnInfo {
                        name: c.clone(),
                        column: Some(c.clone()),
                        level: None,
                    });
                    sources.push((t, None));
                }
                Term::Factor(c) => {
                    let mut levels: Vec<i64> = (0..n)
                        .filter(|&i| in_domain[i])
                        .filter_map(|i| term_values[t][i].map(|v| v.round() as i64))
                        .collect();
                    levels.sort_unstable();
                    levels.dedup();
                    for level in levels.into_iter().skip(1) {
                        columns.push(ColumnInfo {
                            name: format!("factor({c}){level}"),
                            column: Some(c.clone()),
                            level: Some(level),
                        });
                        sources.push((t, Some(level as f64)));
                    }
                }
            }
        }

        // 3) fill
        let mut x = DMatrix::<f64>::zeros(n, columns.len());
        let mut y = vec![0.0; n];
        for i in (0..n).filter(|&i| in_domain[i]) {
            y[i] = outcome[i].unwrap_or_default();
            x[(i, 0)] = 1.0;
            for (j, &(t, level)) in sources.iter().enumerate() {
                let v = term_values[t][i].unwrap_or_default();
                x[(i, j + 1)] = match level {
                    None => v,
                    Some(l) if v.round() == l => 1.0,
                    Some(_) => 0.0,
                };
            }
        }

        debug!(
            model = %spec.name,
            rows = in_domain.iter().filter(|d| **d).count(),
            columns = columns.len(),
            "model matrix built"
        );
        Ok(Self {
            x,
            y,
            in_domain,
            columns,
        })
    }
}
