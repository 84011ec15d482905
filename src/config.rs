// src/config.rs

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};
use tracing::info;

use crate::design::LonelyPsuPolicy;

/// Config file picked up from the working directory when no path is given.
pub const DEFAULT_CONFIG_FILE: &str = "analysis.yaml";

/// Column names of the three-part household key on one side of the join.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyFields {
    pub cluster: String,
    pub household: String,
    pub member: String,
}

impl KeyFields {
    pub fn as_array(&self) -> [&str; 3] {
        [&self.cluster, &self.household, &self.member]
    }
}

/// Raw respondent columns the recode, subset and design stages read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RespondentFields {
    pub psu: String,
    pub stratum: String,
    pub weight: String,
    pub education: String,
    pub age_group: String,
    pub wealth: String,
    pub residence: String,
    pub region: String,
    /// Condom used at last sex (0 no, 1 yes, anything else is not a valid answer).
    pub condom_last_sex: String,
    /// Sex partners in the last 12 months; 0 means no recent intercourse.
    pub partners_12m: String,
}

impl Default for RespondentFields {
    fn default() -> Self {
        Self {
            psu: "v021".into(),
            stratum: "v022".into(),
            weight: "v005".into(),
            education: "v106".into(),
            age_group: "v013".into(),
            wealth: "v190".into(),
            residence: "v025".into(),
            region: "v024".into(),
            condom_last_sex: "v761".into(),
            partners_12m: "v766b".into(),
        }
    }
}

/// A covariate to tabulate against the outcome, in report order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CovariateSpec {
    pub column: String,
    pub label: String,
}

impl CovariateSpec {
    pub fn new(column: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            label: label.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Household member roster extract (Parquet or CSV).
    pub household_path: PathBuf,
    /// Individual respondent extract (Parquet or CSV).
    pub respondent_path: PathBuf,
    pub respondent_keys: KeyFields,
    pub household_keys: KeyFields,
    pub fields: RespondentFields,
    /// Divisor turning the stored integer weight into a sampling weight.
    pub weight_scale: f64,
    pub lonely_psu: LonelyPsuPolicy,
    pub confidence_level: f64,
    /// Covariates for the descriptive tables; `education` is the recoded column.
    pub covariates: Vec<CovariateSpec>,
    pub workbook_path: PathBuf,
    pub sheet_name: String,
    /// When set, the analysis table is also written here as Parquet.
    pub analysis_table_path: Option<PathBuf>,
    /// When set, every estimate of the run is written here as JSON.
    pub summary_path: Option<PathBuf>,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        let fields = RespondentFields::default();
        let covariates = vec![
            CovariateSpec::new(fields.age_group.clone(), "Age group"),
            CovariateSpec::new(crate::recode::EDUCATION_COLUMN, "Education"),
            CovariateSpec::new(fields.wealth.clone(), "Wealth quintile"),
            CovariateSpec::new(fields.residence.clone(), "Residence"),
            CovariateSpec::new(fields.region.clone(), "Region"),
        ];
        Self {
            household_path: PathBuf::from("data/household_members.parquet"),
            respondent_path: PathBuf::from("data/respondents.parquet"),
            respondent_keys: KeyFields {
                cluster: "v001".into(),
                household: "v002".into(),
                member: "v003".into(),
            },
            household_keys: KeyFields {
                cluster: "hv001".into(),
                household: "hv002".into(),
                member: "hvidx".into(),
            },
            fields,
            weight_scale: 1_000_000.0,
            lonely_psu: LonelyPsuPolicy::Adjust,
            confidence_level: 0.95,
            covariates,
            workbook_path: PathBuf::from("condom_use_descriptives.xlsx"),
            sheet_name: "Descriptives".into(),
            analysis_table_path: None,
            summary_path: None,
        }
    }
}

impl AnalysisConfig {
    /// Resolve the run configuration: an explicit path must exist, otherwise
    /// `analysis.yaml` is used when present, otherwise built-in defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        match explicit {
            Some(path) => Self::from_file(path),
            None => {
                let fallback = Path::new(DEFAULT_CONFIG_FILE);
                if fallback.is_file() {
                    Self::from_file(fallback)
                } else {
                    info!("no {} found; using default DHS layout", DEFAULT_CONFIG_FILE);
                    Ok(Self::default())
                }
            }
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let cfg = Self::from_yaml(&text)
            .with_context(|| format!("parsing config {}", path.display()))?;
        info!(path = %path.display(), "loaded config");
        Ok(cfg)
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        let cfg: Self = serde_yaml::from_str(text)?;
        if !(cfg.confidence_level > 0.0 && cfg.confidence_level < 1.0) {
            anyhow::bail!(
                "confidence_level must lie strictly between 0 and 1, got {}",
                cfg.confidence_level
            );
        }
        if cfg.weight_scale <= 0.0 {
            anyhow::bail!("weight_scale must be positive, got {}", cfg.weight_scale);
        }
        Ok(cfg)
    }
}
