use nalgebra::{DMatrix, DVector, SymmetricEigen};
use serde::Serialize;
use statrs::distribution::{ContinuousCDF, Normal, StudentsT};
use tracing::{info, warn};

use super::{ModelMatrix, ModelSpec};
use crate::{
    design::{estimate::normal_critical, SurveyDesign},
    error::{AnalysisError, AnalysisResult},
};

/// Fitted probabilities closer than this to 0 or 1 suggest separation.
pub const SEPARATION_EPS: f64 = 1e-10;

/// Coefficients larger than this in absolute value are treated as diverging.
pub const DIVERGENT_COEFFICIENT: f64 = 10.0;

/// Linear-predictor clamp keeping the fitted probabilities off 0 and 1.
const ETA_LIMIT: f64 = 30.0;

/// Smallest eigenvalue ratio of the information matrix still treated as
/// full rank.
const RANK_TOLERANCE: f64 = 1e-12;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LogitOptions {
    pub max_iter: usize,
    /// Relative change in deviance that ends the iterations.
    pub tolerance: f64,
    pub confidence_level: f64,
}

impl Default for LogitOptions {
    fn default() -> Self {
        Self {
            max_iter: 25,
            tolerance: 1e-8,
            confidence_level: 0.95,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Coefficient {
    pub name: String,
    /// Source column, `None` for the intercept.
    pub column: Option<String>,
    pub level: Option<i64>,
    pub estimate: f64,
    pub se: f64,
    pub t: f64,
    pub p_value: f64,
    pub odds_ratio: f64,
    pub or_low: f64,
    pub or_high: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogitFit {
    pub model: String,
    pub coefficients: Vec<Coefficient>,
    /// Rows in the estimation domain.
    pub n: usize,
    pub weighted_n: f64,
    pub deviance: f64,
    pub iterations: usize,
    pub converged: bool,
    /// Some fitted probability sits numerically at 0 or 1, a coefficient
    /// diverges, or an indicator group has a constant outcome.
    pub separation: bool,
    /// Columns implicated in the separation.
    pub separated_terms: Vec<String>,
    /// Design degrees of freedom plus one minus the number of coefficients.
    pub residual_df: i64,
}

impl LogitFit {
    pub fn coefficient(&self, name: &str) -> Option<&Coefficient> {
        self.coefficients.iter().find(|c| c.name == name)
    }
}

fn inv_logit(eta: f64) -> f64 {
    1.0 / (1.0 + (-eta.clamp(-ETA_LIMIT, ETA_LIMIT)).exp())
}

fn deviance(y: &[f64], mu: &[f64], w: &[f64], rows: &[usize]) -> f64 {
    rows.iter()
        .map(|&i| {
            let ll = if y[i] > 0.5 { mu[i].ln() } else { (1.0 - mu[i]).ln() };
            -2.0 * w[i] * ll
        })
        .sum()
}

/// Weighted information `X' diag(w mu (1 - mu)) X` over the domain rows.
fn information(x: &DMatrix<f64>, mu: &[f64], w: &[f64], rows: &[usize]) -> DMatrix<f64> {
    let p = x.ncols();
    let mut a = DMatrix::<f64>::zeros(p, p);
    for &i in rows {
        let wi = w[i] * mu[i] * (1.0 - mu[i]);
        let xi = x.row(i);
        for j in 0..p {
            let v = wi * xi[j];
            if v == 0.0 {
                continue;
            }
            for k in j..p {
                a[(j, k)] += v * xi[k];
            }
        }
    }
    a.fill_lower_triangle_with_upper_triangle();
    a
}

/// Indicator columns where the rows with the indicator set, or the rows with
/// it clear, all share one outcome value.
fn constant_outcome_columns(m: &ModelMatrix, rows: &[usize]) -> Vec<usize> {
    let mut out = Vec::new();
    for j in 1..m.columns.len() {
        let is_indicator = rows.iter().all(|&i| m.x[(i, j)] == 0.0 || m.x[(i, j)] == 1.0);
        if !is_indicator {
            continue;
        }
        let constant = [0.0, 1.0].iter().any(|&set| {
            let ys: Vec<f64> = rows
                .iter()
                .filter(|&&i| m.x[(i, j)] == set)
                .map(|&i| m.y[i])
                .collect();
            !ys.is_empty() && ys.iter().all(|y| *y == ys[0])
        });
        if constant {
            out.push(j);
        }
    }
    out
}

fn invert(a: DMatrix<f64>, model: &str) -> AnalysisResult<DMatrix<f64>> {
    let eig = SymmetricEigen::new(a.clone()).eigenvalues;
    let max = eig.iter().cloned().fold(0.0_f64, f64::max);
    let min = eig.iter().cloned().fold(f64::INFINITY, f64::min);
    if max <= 0.0 || min / max < RANK_TOLERANCE {
        return Err(AnalysisError::SingularInformation(model.to_string()));
    }
    a.try_inverse()
        .ok_or_else(|| AnalysisError::SingularInformation(model.to_string()))
}

/// Survey-weighted logistic regression.
///
/// Coefficients maximise the weighted likelihood by IRLS; their covariance
/// is the linearization sandwich `A^-1 B A^-1`, with `B` the design
/// covariance of the per-row score contributions `w x (y - mu)`.
#[tracing::instrument(level = "info", skip_all, fields(model = %spec.name))]
pub fn fit_logit(
    design: &SurveyDesign,
    spec: &ModelSpec,
    opts: &LogitOptions,
) -> AnalysisResult<LogitFit> {
    let m = ModelMatrix::build(design, spec)?;
    let w = design.weights();
    let rows: Vec<usize> = (0..design.num_rows()).filter(|&i| m.in_domain[i]).collect();
    if rows.is_empty() {
        return Err(AnalysisError::EmptyDomain(spec.name.clone()));
    }
    let p = m.columns.len();

    // 1) IRLS from mu = (y + 1/2) / 2
    let mut mu: Vec<f64> = m.y.iter().map(|y| (y + 0.5) / 2.0).collect();
    let mut eta: Vec<f64> = mu.iter().map(|u| (u / (1.0 - u)).ln()).collect();
    let mut beta = DVector::<f64>::zeros(p);
    let mut dev = deviance(&m.y, &mu, w, &rows);
    let mut converged = false;
    let mut iterations = 0;
    while iterations < opts.max_iter {
        iterations += 1;
        let mut xtwz = DVector::<f64>::zeros(p);
        for &i in &rows {
            let var = mu[i] * (1.0 - mu[i]);
            let z = eta[i] + (m.y[i] - mu[i]) / var;
            let wz = w[i] * var * z;
            for j in 0..p {
                xtwz[j] += m.x[(i, j)] * wz;
            }
        }
        let a = information(&m.x, &mu, w, &rows);
        beta = invert(a, &spec.name)? * xtwz;

        let fitted = &m.x * &beta;
        for &i in &rows {
            eta[i] = fitted[i].clamp(-ETA_LIMIT, ETA_LIMIT);
            mu[i] = inv_logit(eta[i]);
        }
        let new_dev = deviance(&m.y, &mu, w, &rows);
        let change = (new_dev - dev).abs() / (new_dev.abs() + 0.1);
        dev = new_dev;
        if change < opts.tolerance {
            converged = true;
            break;
        }
    }

    // 2) sandwich variance
    let a_inv = invert(information(&m.x, &mu, w, &rows), &spec.name)?;
    let mut scores = DMatrix::<f64>::zeros(design.num_rows(), p);
    for &i in &rows {
        let r = w[i] * (m.y[i] - mu[i]);
        for j in 0..p {
            scores[(i, j)] = m.x[(i, j)] * r;
        }
    }
    let b = design.covariance(&scores)?;
    let cov = &a_inv * b * &a_inv;

    // 3) inference
    let boundary = rows
        .iter()
        .any(|&i| mu[i] < SEPARATION_EPS || mu[i] > 1.0 - SEPARATION_EPS);
    let mut suspects = constant_outcome_columns(&m, &rows);
    suspects.extend((0..p).filter(|&j| beta[j].abs() > DIVERGENT_COEFFICIENT));
    suspects.sort_unstable();
    suspects.dedup();
    let separated_terms: Vec<String> =
        suspects.iter().map(|&j| m.columns[j].name.clone()).collect();
    let separation = boundary || !separated_terms.is_empty();
    let residual_df = design.degrees_of_freedom() + 1 - p as i64;
    let z = normal_critical(opts.confidence_level);
    let coefficients = m
        .columns
        .iter()
        .enumerate()
        .map(|(j, col)| {
            let estimate = beta[j];
            let se = cov[(j, j)].max(0.0).sqrt();
            let t = estimate / se;
            Coefficient {
                name: col.name.clone(),
                column: col.column.clone(),
                level: col.level,
                estimate,
                se,
                t,
                p_value: two_sided_p(t, residual_df),
                odds_ratio: estimate.exp(),
                or_low: (estimate - z * se).exp(),
                or_high: (estimate + z * se).exp(),
            }
        })
        .collect();

    if !converged {
        warn!(model = %spec.name, iterations, "logistic fit did not converge");
    }
    if separation {
        warn!(
            model = %spec.name,
            terms = ?separated_terms,
            "fitted probabilities numerically 0 or 1; coefficients may diverge (separation)"
        );
    }
    info!(
        model = %spec.name,
        n = rows.len(),
        coefficients = p,
        deviance = dev,
        iterations,
        "logistic model fitted"
    );

    Ok(LogitFit {
        model: spec.name.clone(),
        coefficients,
        n: rows.len(),
        weighted_n: rows.iter().map(|&i| w[i]).sum(),
        deviance: dev,
        iterations,
        converged,
        separation,
        separated_terms,
        residual_df,
    })
}

/// Student t with `df` degrees of freedom; normal when `df` is not positive.
fn two_sided_p(t: f64, df: i64) -> f64 {
    if !t.is_finite() {
        return f64::NAN;
    }
    let upper = if df > 0 {
        StudentsT::new(0.0, 1.0, df as f64).map(|d| d.sf(t.abs())).ok()
    } else {
        None
    };
    let upper = upper.unwrap_or_else(|| {
        Normal::new(0.0, 1.0)
            .map(|d| d.sf(t.abs()))
            .unwrap_or(f64::NAN)
    });
    2.0 * upper
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RespondentFields;
    use crate::model::Term;
    use crate::recode::{CONDOM_USE_COLUMN, EDUCATION_COLUMN};
    use crate::tabulate::crosstab;
    use crate::testutil::{init_test_logging, synthetic_design, SyntheticSpec};

    fn logit(p: f64) -> f64 {
        (p / (1.0 - p)).ln()
    }

    #[test]
    fn single_binary_covariate_matches_weighted_log_odds() -> anyhow::Result<()> {
        init_test_logging();
        let design = synthetic_design(&SyntheticSpec::default());
        let fit = fit_logit(&design, &ModelSpec::unadjusted(), &LogitOptions::default())?;
        assert!(fit.converged);
        assert!(!fit.separation);

        let t = crosstab(&design, CONDOM_USE_COLUMN, EDUCATION_COLUMN)?;
        let p0 = t.counts[1][0] / t.column_total(0);
        let p1 = t.counts[1][1] / t.column_total(1);
        let b0 = fit.coefficient("(Intercept)").unwrap();
        let b1 = fit.coefficient(EDUCATION_COLUMN).unwrap();
        assert!((b0.estimate - logit(p0)).abs() < 1e-6);
        assert!((b1.estimate - (logit(p1) - logit(p0))).abs() < 1e-6);
        assert!((b1.odds_ratio - b1.estimate.exp()).abs() < 1e-12);
        assert!(b1.or_low < b1.odds_ratio && b1.odds_ratio < b1.or_high);
        assert_eq!(fit.residual_df, design.degrees_of_freedom() - 1);
        Ok(())
    }

    #[test]
    fn recovers_generating_coefficients() -> anyhow::Result<()> {
        let spec = SyntheticSpec {
            psus_per_stratum: 8,
            per_psu: 150,
            ..SyntheticSpec::default()
        };
        let design = synthetic_design(&spec);
        let fit = fit_logit(&design, &ModelSpec::unadjusted(), &LogitOptions::default())?;
        let b0 = fit.coefficient("(Intercept)").unwrap();
        let b1 = fit.coefficient(EDUCATION_COLUMN).unwrap();
        assert!((b0.estimate - spec.intercept).abs() < 0.35, "intercept {}", b0.estimate);
        assert!((b1.estimate - spec.education_effect).abs() < 0.35, "education {}", b1.estimate);
        assert!(b1.se > 0.0 && b1.se < 0.3);
        assert!(b1.p_value < 1e-4);
        Ok(())
    }

    #[test]
    fn adjusted_model_is_finite() -> anyhow::Result<()> {
        let design = synthetic_design(&SyntheticSpec::default());
        let fit = fit_logit(
            &design,
            &ModelSpec::adjusted(&RespondentFields::default()),
            &LogitOptions::default(),
        )?;
        assert_eq!(fit.coefficients.len(), 16);
        assert!(fit.converged);
        assert!(!fit.separation);
        assert!(fit.separated_terms.is_empty());
        for c in &fit.coefficients {
            assert!(c.estimate.is_finite() && c.se.is_finite(), "{}", c.name);
            assert!(c.odds_ratio > 0.0 && c.odds_ratio.is_finite());
        }
        assert!(fit.residual_df > 0);
        Ok(())
    }

    #[test]
    fn perfect_separation_diverges_and_is_flagged() -> anyhow::Result<()> {
        let spec = SyntheticSpec {
            separated: true,
            ..SyntheticSpec::default()
        };
        let design = synthetic_design(&spec);
        let fit = fit_logit(&design, &ModelSpec::unadjusted(), &LogitOptions::default())?;
        assert!(fit.separation);
        assert!(fit.separated_terms.iter().any(|t| t == EDUCATION_COLUMN));
        let b1 = fit.coefficient(EDUCATION_COLUMN).unwrap();
        assert!(b1.odds_ratio > 1e6, "odds ratio {}", b1.odds_ratio);
        Ok(())
    }

    #[test]
    fn region_without_events_is_flagged() -> anyhow::Result<()> {
        let spec = SyntheticSpec {
            zero_region: Some(4),
            ..SyntheticSpec::default()
        };
        let design = synthetic_design(&spec);
        let fit = fit_logit(
            &design,
            &ModelSpec::adjusted(&RespondentFields::default()),
            &LogitOptions::default(),
        )?;
        assert!(fit.separation);
        assert!(fit.separated_terms.iter().any(|t| t == "factor(v024)4"));
        let region = fit.coefficient("factor(v024)4").unwrap();
        assert!(region.estimate < -DIVERGENT_COEFFICIENT / 2.0, "{}", region.estimate);
        Ok(())
    }

    #[test]
    fn duplicated_term_is_singular() {
        let design = synthetic_design(&SyntheticSpec::default());
        let spec = ModelSpec {
            name: "duplicated".into(),
            outcome: CONDOM_USE_COLUMN.into(),
            terms: vec![
                Term::Numeric(EDUCATION_COLUMN.into()),
                Term::Numeric(EDUCATION_COLUMN.into()),
            ],
        };
        let err = fit_logit(&design, &spec, &LogitOptions::default()).unwrap_err();
        assert!(matches!(err, AnalysisError::SingularInformation(m) if m == "duplicated"));
    }

    #[test]
    fn p_values_fall_back_to_normal() {
        let normal = two_sided_p(1.959964, 0);
        assert!((normal - 0.05).abs() < 1e-5);
        assert!(two_sided_p(1.959964, 10) > normal);
    }
}
