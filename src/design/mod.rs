// src/design/mod.rs

pub mod estimate;

use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::{info, warn};

use crate::{
    columns,
    error::{AnalysisError, AnalysisResult},
    load::LabeledTable,
};

pub use estimate::MeanEstimate;

/// What to do with a stratum that contributes a single PSU, where the
/// between-PSU variance is undefined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LonelyPsuPolicy {
    /// Refuse to build the design.
    Fail,
    /// The stratum contributes no variance.
    Remove,
    /// Treat the PSU as sampled with certainty (also no variance).
    Certainty,
    /// Centre the lone PSU total at the grand mean of all PSU totals.
    #[default]
    Adjust,
}

/// Column names and options describing the sample design.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesignSpec {
    pub psu: String,
    pub stratum: String,
    pub weight: String,
    /// PSU ids repeat across strata; clusters are (stratum, psu) pairs.
    pub nest: bool,
    pub lonely_psu: LonelyPsuPolicy,
}

/// The analysis table together with its clustering, stratification and
/// weights. Every weighted statistic in the crate goes through this type.
#[derive(Debug, Clone)]
pub struct SurveyDesign {
    table: LabeledTable,
    weights: Vec<f64>,
    /// Cluster index of each row.
    cluster_of_row: Vec<usize>,
    /// Stratum position of each cluster.
    stratum_of_cluster: Vec<usize>,
    /// Stratum codes in ascending order.
    strata: Vec<i64>,
    /// Clusters grouped by stratum position.
    clusters_by_stratum: Vec<Vec<usize>>,
    policy: LonelyPsuPolicy,
}

impl SurveyDesign {
    #[tracing::instrument(level = "info", skip_all, fields(rows = table.num_rows()))]
    pub fn new(table: LabeledTable, spec: &DesignSpec) -> AnalysisResult<Self> {
        let psu = required_codes(&table, &spec.psu)?;
        let stratum = required_codes(&table, &spec.stratum)?;
        let weights = columns::f64_values(&table.batch, &spec.weight)?;
        let nulls = weights.iter().filter(|w| w.is_none()).count();
        if nulls > 0 {
            return Err(AnalysisError::IncompleteDesign {
                field: spec.weight.clone(),
                count: nulls,
            });
        }
        let weights: Vec<f64> = weights.into_iter().flatten().collect();

        // 1) strata in code order
        let strata: Vec<i64> = {
            let mut s: Vec<i64> = stratum.clone();
            s.sort_unstable();
            s.dedup();
            s
        };
        let stratum_pos: HashMap<i64, usize> =
            strata.iter().enumerate().map(|(i, s)| (*s, i)).collect();

        // 2) clusters; without nesting a PSU id must stay inside one stratum
        let mut cluster_ids: BTreeMap<(i64, i64), usize> = BTreeMap::new();
        let mut psu_home: HashMap<i64, i64> = HashMap::new();
        for (&p, &h) in psu.iter().zip(&stratum) {
            if !spec.nest {
                let home = *psu_home.entry(p).or_insert(h);
                if home != h {
                    return Err(AnalysisError::ClustersNotNested { psu: p });
                }
            }
            let next = cluster_ids.len();
            cluster_ids.entry((h, p)).or_insert(next);
        }
        let cluster_of_row: Vec<usize> = psu
            .iter()
            .zip(&stratum)
            .map(|(p, h)| cluster_ids[&(*h, *p)])
            .collect();
        let mut stratum_of_cluster = vec![0usize; cluster_ids.len()];
        let mut clusters_by_stratum = vec![Vec::new(); strata.len()];
        for (&(h, _), &c) in &cluster_ids {
            let pos = stratum_pos[&h];
            stratum_of_cluster[c] = pos;
            clusters_by_stratum[pos].push(c);
        }

        // 3) lonely PSUs
        let lonely: Vec<i64> = clusters_by_stratum
            .iter()
            .enumerate()
            .filter(|(_, c)| c.len() == 1)
            .map(|(pos, _)| strata[pos])
            .collect();
        if let Some(&first) = lonely.first() {
            if spec.lonely_psu == LonelyPsuPolicy::Fail {
                return Err(AnalysisError::LonelyPsu { stratum: first });
            }
            warn!(
                strata = ?lonely,
                policy = ?spec.lonely_psu,
                "strata with a single PSU; applying lonely-PSU policy"
            );
        }

        let design = Self {
            table,
            weights,
            cluster_of_row,
            stratum_of_cluster,
            strata,
            clusters_by_stratum,
            policy: spec.lonely_psu,
        };
        info!(
            strata = design.num_strata(),
            psus = design.num_clusters(),
            degf = design.degrees_of_freedom(),
            weighted_n = design.weights.iter().sum::<f64>(),
            "survey design built"
        );
        Ok(design)
    }

    pub fn table(&self) -> &LabeledTable {
        &self.table
    }

    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    pub fn num_rows(&self) -> usize {
        self.weights.len()
    }

    pub fn num_clusters(&self) -> usize {
        self.stratum_of_cluster.len()
    }

    pub fn num_strata(&self) -> usize {
        self.strata.len()
    }

    /// Design degrees of freedom: PSUs minus strata.
    pub fn degrees_of_freedom(&self) -> i64 {
        self.num_clusters() as i64 - self.num_strata() as i64
    }

    /// Numeric values of an analysis-table column.
    pub fn values(&self, column: &str) -> AnalysisResult<Vec<Option<f64>>> {
        columns::f64_values(&self.table.batch, column)
    }

    pub fn codes(&self, column: &str) -> AnalysisResult<Vec<Option<i64>>> {
        columns::i64_codes(&self.table.batch, column)
    }

    /// With-replacement linearization covariance of the totals of `scores`
    /// (one row per observation, one column per statistic). Rows outside the
    /// estimation domain must carry zero scores; their PSUs still count.
    pub fn covariance(&self, scores: &DMatrix<f64>) -> AnalysisResult<DMatrix<f64>> {
        let k = scores.ncols();
        let mut totals = DMatrix::<f64>::zeros(self.num_clusters(), k);
        for (row, &c) in self.cluster_of_row.iter().enumerate() {
            for j in 0..k {
                totals[(c, j)] += scores[(row, j)];
            }
        }

        let grand_mean: Vec<f64> = (0..k)
            .map(|j| totals.column(j).sum() / self.num_clusters().max(1) as f64)
            .collect();

        let mut cov = DMatrix::<f64>::zeros(k, k);
        for (pos, clusters) in self.clusters_by_stratum.iter().enumerate() {
            let n_h = clusters.len();
            let (center, scale): (Vec<f64>, f64) = if n_h > 1 {
                let mean = (0..k)
                    .map(|j| clusters.iter().map(|&c| totals[(c, j)]).sum::<f64>() / n_h as f64)
                    .collect();
                (mean, n_h as f64 / (n_h as f64 - 1.0))
            } else {
                match self.policy {
                    LonelyPsuPolicy::Adjust => (grand_mean.clone(), 1.0),
                    LonelyPsuPolicy::Remove | LonelyPsuPolicy::Certainty => continue,
                    LonelyPsuPolicy::Fail => {
                        return Err(AnalysisError::LonelyPsu {
                            stratum: self.strata[pos],
                        })
                    }
                }
            };
            for &c in clusters {
                for a in 0..k {
                    let da = totals[(c, a)] - center[a];
                    for b in a..k {
                        let v = scale * da * (totals[(c, b)] - center[b]);
                        cov[(a, b)] += v;
                        if a != b {
                            cov[(b, a)] += v;
                        }
                    }
                }
            }
        }
        Ok(cov)
    }

    /// Variance of the total of a single score vector.
    pub fn variance(&self, scores: &[f64]) -> AnalysisResult<f64> {
        let m = DMatrix::from_column_slice(scores.len(), 1, scores);
        Ok(self.covariance(&m)?[(0, 0)])
    }
}

fn required_codes(table: &LabeledTable, column: &str) -> AnalysisResult<Vec<i64>> {
    let codes = columns::i64_codes(&table.batch, column)?;
    let nulls = codes.iter().filter(|c| c.is_none()).count();
    if nulls > 0 {
        return Err(AnalysisError::IncompleteDesign {
            field: column.to_string(),
            count: nulls,
        });
    }
    Ok(codes.into_iter().flatten().collect())
}
