use arrow::{
    array::{ArrayRef, Int64Array},
    datatypes::{DataType, Field, Schema},
    record_batch::RecordBatch,
};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::sync::Arc;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::{
    config::AnalysisConfig,
    design::{DesignSpec, SurveyDesign},
    load::{LabeledTable, ValueLabels},
    merge::merge_on_household_key,
    recode::apply_recodes,
    subset::{subset_eligible, WEIGHT_COLUMN},
};

pub fn init_test_logging() {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,condomstudy=debug")),
        )
        .with_test_writer()
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// Shape of a generated DHS-style survey.
#[derive(Debug, Clone)]
pub struct SyntheticSpec {
    pub strata: i64,
    pub psus_per_stratum: i64,
    pub per_psu: i64,
    pub seed: u64,
    /// Log-odds of condom use for women with no education.
    pub intercept: f64,
    /// Log odds ratio of primary-or-higher education.
    pub education_effect: f64,
    /// Outcome equals the education indicator exactly.
    pub separated: bool,
    /// Append one stratum holding a single PSU.
    pub lonely_stratum: bool,
    /// Every respondent in this region reports no condom use.
    pub zero_region: Option<i64>,
}

impl Default for SyntheticSpec {
    fn default() -> Self {
        Self {
            strata: 4,
            psus_per_stratum: 6,
            per_psu: 25,
            seed: 7,
            intercept: -1.5,
            education_effect: 1.2,
            separated: false,
            lonely_stratum: false,
            zero_region: None,
        }
    }
}

fn int_column(v: Vec<Option<i64>>) -> ArrayRef {
    Arc::new(Int64Array::from(v))
}

fn table(name: &str, cols: Vec<(&str, Vec<Option<i64>>)>, labels: ValueLabels) -> LabeledTable {
    let fields: Vec<Field> = cols
        .iter()
        .map(|(n, _)| Field::new(*n, DataType::Int64, true))
        .collect();
    let arrays: Vec<ArrayRef> = cols.into_iter().map(|(_, v)| int_column(v)).collect();
    let batch = RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays).unwrap();
    LabeledTable::new(name, batch, labels)
}

/// Respondent and household-member extracts with the default DHS column
/// names. Every respondent is the second line of their household roster, and
/// one roster belongs to a household with no interviewed woman.
pub fn synthetic_extracts(spec: &SyntheticSpec) -> (LabeledTable, LabeledTable) {
    let mut rng = StdRng::seed_from_u64(spec.seed);
    let names = [
        "v001", "v002", "v003", "v005", "v021", "v022", "v106", "v013", "v190", "v025", "v024",
        "v761", "v766b",
    ];
    let mut r: Vec<Vec<Option<i64>>> = vec![Vec::new(); names.len()];
    let mut m: Vec<Vec<Option<i64>>> = vec![Vec::new(); 5];

    let mut layout: Vec<(i64, i64)> = (1..=spec.strata)
        .map(|h| (h, spec.psus_per_stratum))
        .collect();
    if spec.lonely_stratum {
        layout.push((spec.strata + 1, 1));
    }

    let mut cluster = 0;
    for (stratum, psus) in layout {
        for _ in 0..psus {
            cluster += 1;
            let region = (stratum - 1) % 4 + 1;
            let urban = rng.gen_range(1..=2);
            for hh in 1..=spec.per_psu {
                let edu_raw = if rng.gen::<f64>() < 0.3 { 0 } else { rng.gen_range(1..=3) };
                let edu = (edu_raw > 0) as i64;
                let partners = if rng.gen::<f64>() < 0.2 { 0 } else { rng.gen_range(1..=3) };
                let condom = if partners == 0 {
                    None
                } else if spec.separated {
                    Some(edu)
                } else if spec.zero_region == Some(region) {
                    Some(0)
                } else if rng.gen::<f64>() < 0.02 {
                    Some(8)
                } else {
                    let eta = spec.intercept + spec.education_effect * edu as f64;
                    let p = 1.0 / (1.0 + (-eta).exp());
                    Some((rng.gen::<f64>() < p) as i64)
                };
                let row = [
                    Some(cluster),
                    Some(hh),
                    Some(2),
                    Some(rng.gen_range(500_000..=2_000_000)),
                    Some(cluster),
                    Some(stratum),
                    Some(edu_raw),
                    Some(rng.gen_range(1..=7)),
                    Some(rng.gen_range(1..=5)),
                    Some(urban),
                    Some(region),
                    condom,
                    Some(partners),
                ];
                for (col, v) in r.iter_mut().zip(row) {
                    col.push(v);
                }
                for line in 1..=2 {
                    let member = [
                        Some(cluster),
                        Some(hh),
                        Some(line),
                        Some(if line == 1 { 1 } else { 2 }),
                        Some(rng.gen_range(15..=70)),
                    ];
                    for (col, v) in m.iter_mut().zip(member) {
                        col.push(v);
                    }
                }
            }
        }
    }
    let orphan = [Some(cluster), Some(spec.per_psu + 1), Some(1), Some(1), Some(40)];
    for (col, v) in m.iter_mut().zip(orphan) {
        col.push(v);
    }

    let mut labels = ValueLabels::default();
    labels.set_variable_label("v106", "highest educational level");
    labels.set_value_labels(
        "v106",
        [(0, "no education"), (1, "primary"), (2, "secondary"), (3, "higher")],
    );
    labels.set_value_labels("v025", [(1, "urban"), (2, "rural")]);
    labels.set_value_labels(
        "v190",
        [(1, "poorest"), (2, "poorer"), (3, "middle"), (4, "richer"), (5, "richest")],
    );
    labels.set_value_labels(
        "v024",
        [(1, "north"), (2, "east"), (3, "south"), (4, "west")],
    );

    let respondents = table("respondent", names.iter().copied().zip(r).collect(), labels);
    let members = table(
        "household",
        ["hv001", "hv002", "hvidx", "hv104", "hv105"]
            .iter()
            .copied()
            .zip(m)
            .collect(),
        ValueLabels::default(),
    );
    (respondents, members)
}

/// Merged and recoded table, ready for subsetting.
pub fn synthetic_merged(spec: &SyntheticSpec) -> LabeledTable {
    let cfg = AnalysisConfig::default();
    let (respondents, members) = synthetic_extracts(spec);
    let merged =
        merge_on_household_key(&respondents, &cfg.respondent_keys, &members, &cfg.household_keys)
            .unwrap();
    apply_recodes(&merged, &cfg.fields).unwrap().0
}

/// Eligible analysis table wrapped in the default design.
pub fn synthetic_design(spec: &SyntheticSpec) -> SurveyDesign {
    let cfg = AnalysisConfig::default();
    let table = subset_eligible(&synthetic_merged(spec), &cfg).unwrap();
    let design = DesignSpec {
        psu: cfg.fields.psu.clone(),
        stratum: cfg.fields.stratum.clone(),
        weight: WEIGHT_COLUMN.into(),
        nest: true,
        lonely_psu: cfg.lonely_psu,
    };
    SurveyDesign::new(table, &design).unwrap()
}
