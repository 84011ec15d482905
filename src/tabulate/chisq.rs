use nalgebra::{DMatrix, DVector};
use serde::Serialize;
use statrs::distribution::{ChiSquared, ContinuousCDF, FisherSnedecor};
use tracing::debug;

use crate::{
    design::SurveyDesign,
    error::{AnalysisError, AnalysisResult},
};

/// Pearson test of independence with the Rao-Scott second-order correction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChiSquareTest {
    /// Pearson X^2 on the weighted table scaled to the weighted total.
    pub pearson: f64,
    pub df: usize,
    /// Uncorrected p-value against chi-square(df).
    pub pearson_p: f64,
    /// X^2 divided by the trace of the generalized design-effect matrix.
    pub f: f64,
    pub ndf: f64,
    pub ddf: f64,
    pub p_value: f64,
}

/// Two-way table of codes over the rows where both are present.
pub(crate) struct CodedPairs {
    pub rows: Vec<i64>,
    pub cols: Vec<i64>,
    /// (observation, row level position, column level position)
    pub obs: Vec<(usize, usize, usize)>,
}

impl CodedPairs {
    pub fn new(row_codes: &[Option<i64>], col_codes: &[Option<i64>]) -> Self {
        let present: Vec<(usize, i64, i64)> = row_codes
            .iter()
            .zip(col_codes)
            .enumerate()
            .filter_map(|(i, (r, c))| Some((i, (*r)?, (*c)?)))
            .collect();
        let mut rows: Vec<i64> = present.iter().map(|&(_, r, _)| r).collect();
        let mut cols: Vec<i64> = present.iter().map(|&(_, _, c)| c).collect();
        rows.sort_unstable();
        rows.dedup();
        cols.sort_unstable();
        cols.dedup();
        let obs = present
            .iter()
            .map(|&(i, r, c)| {
                (
                    i,
                    rows.binary_search(&r).unwrap_or_default(),
                    cols.binary_search(&c).unwrap_or_default(),
                )
            })
            .collect();
        Self { rows, cols, obs }
    }
}

/// Design-based test that `row` and `col` are independent.
///
/// Cells are ordered with the row level varying fastest. The generalized
/// design effects come from the interaction contrasts left after projecting
/// out the main effects.
pub fn rao_scott(
    design: &SurveyDesign,
    row_codes: &[Option<i64>],
    col_codes: &[Option<i64>],
    what: &str,
) -> AnalysisResult<ChiSquareTest> {
    let pairs = CodedPairs::new(row_codes, col_codes);
    let (r, c) = (pairs.rows.len(), pairs.cols.len());
    if r < 2 || c < 2 {
        return Err(AnalysisError::DegenerateTable {
            what: what.to_string(),
            found: r.min(c),
        });
    }
    let cells = r * c;
    let w = design.weights();

    // 1) cell proportions and their design covariance
    let total: f64 = pairs.obs.iter().map(|&(i, _, _)| w[i]).sum();
    if total <= 0.0 {
        return Err(AnalysisError::EmptyDomain(what.to_string()));
    }
    let mut p = DVector::<f64>::zeros(cells);
    for &(i, a, b) in &pairs.obs {
        p[a + r * b] += w[i] / total;
    }
    let mut scores = DMatrix::<f64>::zeros(design.num_rows(), cells);
    for &(i, a, b) in &pairs.obs {
        for k in 0..cells {
            let ind = if k == a + r * b { 1.0 } else { 0.0 };
            scores[(i, k)] = w[i] * (ind - p[k]) / total;
        }
    }
    let v = design.covariance(&scores)?;

    // 2) Pearson statistic on the table scaled to the weighted total
    let mut x2 = 0.0;
    for a in 0..r {
        let row_p: f64 = (0..c).map(|b| p[a + r * b]).sum();
        for b in 0..c {
            let col_p: f64 = (0..r).map(|aa| p[aa + r * b]).sum();
            let expected = row_p * col_p * total;
            if expected > 0.0 {
                x2 += (p[a + r * b] * total - expected).powi(2) / expected;
            }
        }
    }
    let df = (r - 1) * (c - 1);
    let chi = ChiSquared::new(df as f64).map_err(|_| AnalysisError::DegenerateTable {
        what: what.to_string(),
        found: df,
    })?;
    let pearson_p = chi.sf(x2);

    // 3) interaction contrasts orthogonal to the main effects
    let x1 = main_effects(r, c);
    let x12 = interactions(r, c);
    let gram = x1.transpose() * &x1;
    let proj = gram
        .lu()
        .solve(&(x1.transpose() * &x12))
        .ok_or_else(|| AnalysisError::SingularInformation(what.to_string()))?;
    let cmat = &x12 - &x1 * proj;

    // 4) generalized design effects
    let inv_p = DMatrix::from_diagonal(&p.map(|x| if x > 0.0 { 1.0 / x } else { 0.0 }));
    let denom = cmat.transpose() * (&inv_p / total) * &cmat;
    let numr = cmat.transpose() * &inv_p * &v * &inv_p * &cmat;
    let delta = denom
        .lu()
        .solve(&numr)
        .ok_or_else(|| AnalysisError::DegenerateTable {
            what: what.to_string(),
            found: df,
        })?;
    let trace = delta.trace();
    let trace_sq = (&delta * &delta).trace();
    let nu = design.degrees_of_freedom();
    if trace <= 0.0 || trace_sq <= 0.0 || nu <= 0 {
        return Err(AnalysisError::DegenerateTable {
            what: format!("{what} (design effects)"),
            found: nu.max(0) as usize,
        });
    }
    let d0 = trace * trace / trace_sq;
    let f = x2 / trace;
    let fisher = FisherSnedecor::new(d0, d0 * nu as f64).map_err(|_| {
        AnalysisError::DegenerateTable {
            what: what.to_string(),
            found: df,
        }
    })?;
    let p_value = fisher.sf(f);

    debug!(what, x2, trace, d0, nu, "rao-scott correction");
    Ok(ChiSquareTest {
        pearson: x2,
        df,
        pearson_p,
        f,
        ndf: d0,
        ddf: d0 * nu as f64,
        p_value,
    })
}

/// Intercept, row dummies and column dummies for every cell.
fn main_effects(r: usize, c: usize) -> DMatrix<f64> {
    let cells = r * c;
    let mut x = DMatrix::<f64>::zeros(cells, 1 + (r - 1) + (c - 1));
    for b in 0..c {
        for a in 0..r {
            let k = a + r * b;
            x[(k, 0)] = 1.0;
            if a > 0 {
                x[(k, a)] = 1.0;
            }
            if b > 0 {
                x[(k, r - 1 + b)] = 1.0;
            }
        }
    }
    x
}

/// Row-by-column interaction dummies.
fn interactions(r: usize, c: usize) -> DMatrix<f64> {
    let mut x = DMatrix::<f64>::zeros(r * c, (r - 1) * (c - 1));
    for b in 1..c {
        for a in 1..r {
            x[(a + r * b, (a - 1) + (r - 1) * (b - 1))] = 1.0;
        }
    }
    x
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::design::{DesignSpec, LonelyPsuPolicy};
    use crate::load::{LabeledTable, ValueLabels};
    use arrow::array::{ArrayRef, Float64Array, Int64Array};
    use arrow::datatypes::{DataType, Field, Schema};
    use arrow::record_batch::RecordBatch;
    use std::sync::Arc;

    /// One PSU per entry of `psus`, each listing cell counts in the order
    /// (y0 x0, y1 x0, y0 x1, y1 x1). Two PSUs per stratum.
    fn build(psus: &[[i64; 4]]) -> (SurveyDesign, Vec<Option<i64>>, Vec<Option<i64>>) {
        let (mut psu, mut strat, mut y, mut x) = (vec![], vec![], vec![], vec![]);
        for (j, counts) in psus.iter().enumerate() {
            for (cell, &n) in counts.iter().enumerate() {
                for _ in 0..n {
                    psu.push(j as i64 + 1);
                    strat.push(j as i64 / 2 + 1);
                    y.push(Some((cell % 2) as i64));
                    x.push(Some((cell / 2) as i64));
                }
            }
        }
        let n = psu.len();
        let schema = Arc::new(Schema::new(vec![
            Field::new("psu", DataType::Int64, false),
            Field::new("strat", DataType::Int64, false),
            Field::new("wt", DataType::Float64, false),
        ]));
        let cols: Vec<ArrayRef> = vec![
            Arc::new(Int64Array::from(psu)),
            Arc::new(Int64Array::from(strat)),
            Arc::new(Float64Array::from(vec![1.0; n])),
        ];
        let batch = RecordBatch::try_new(schema, cols).unwrap();
        let spec = DesignSpec {
            psu: "psu".into(),
            stratum: "strat".into(),
            weight: "wt".into(),
            nest: true,
            lonely_psu: LonelyPsuPolicy::Fail,
        };
        let table = LabeledTable::new("t", batch, ValueLabels::default());
        let design = SurveyDesign::new(table, &spec).unwrap();
        (design, y, x)
    }

    #[test]
    fn independent_table_is_not_significant() -> AnalysisResult<()> {
        let (d, y, x) = build(&[[3, 1, 1, 3], [1, 3, 3, 1], [2, 1, 1, 2], [1, 2, 2, 1]]);
        let t = rao_scott(&d, &y, &x, "independent")?;
        assert!(t.pearson.abs() < 1e-9);
        assert!(t.f.abs() < 1e-9);
        assert!(t.p_value > 0.99);
        assert_eq!(t.df, 1);
        Ok(())
    }

    #[test]
    fn dependent_table_is_significant() -> AnalysisResult<()> {
        let (d, y, x) = build(&[
            [5, 1, 1, 5],
            [6, 1, 2, 5],
            [4, 2, 1, 6],
            [5, 1, 1, 4],
            [6, 2, 1, 5],
            [5, 1, 2, 6],
            [4, 1, 1, 5],
            [5, 2, 1, 4],
        ]);
        let t = rao_scott(&d, &y, &x, "dependent")?;
        assert!(t.pearson > 20.0);
        assert!(t.pearson_p < 1e-4);
        assert!(t.p_value < 0.01);
        assert!(t.ndf > 0.0 && (t.ddf - t.ndf * 4.0).abs() < 1e-9);
        Ok(())
    }

    #[test]
    fn single_level_is_degenerate() {
        let (d, y, _) = build(&[[2, 1, 0, 0], [1, 2, 0, 0]]);
        let x = vec![Some(0); y.len()];
        let err = rao_scott(&d, &y, &x, "education").unwrap_err();
        assert!(matches!(err, AnalysisError::DegenerateTable { found: 1, .. }));
    }

    #[test]
    fn contrasts_are_orthogonal_to_main_effects() {
        let x1 = main_effects(3, 4);
        let x12 = interactions(3, 4);
        let proj = (x1.transpose() * &x1).lu().solve(&(x1.transpose() * &x12)).unwrap();
        let c = &x12 - &x1 * proj;
        assert!((x1.transpose() * c).abs().max() < 1e-9);
    }
}
