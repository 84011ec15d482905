use std::path::PathBuf;
use thiserror::Error;

/// Failures raised by the analysis stages. Glue code wraps these in
/// `anyhow::Error` with path context; library functions return them directly.
#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("unjoinable dataset: join key column `{column}` missing from {table} table")]
    MissingJoinKey { table: String, column: String },

    #[error("unjoinable dataset: join key column `{column}` in {table} table has type {found}, expected integer codes")]
    MistypedJoinKey {
        table: String,
        column: String,
        found: String,
    },

    #[error("unjoinable dataset: key ({cluster}, {household}, {member}) appears more than once in {table} table")]
    DuplicateJoinKey {
        table: String,
        cluster: i64,
        household: i64,
        member: i64,
    },

    #[error("unjoinable dataset: no respondent key matched a household member ({respondents} respondents, {members} members)")]
    Unjoinable { respondents: usize, members: usize },

    #[error("column `{0}` not found in analysis table")]
    MissingColumn(String),

    #[error("column `{column}` has type {found}, expected a numeric code")]
    NonNumericColumn { column: String, found: String },

    #[error("survey design incomplete: {count} row(s) have a null {field}")]
    IncompleteDesign { field: String, count: usize },

    #[error("PSU {psu} appears in more than one stratum; set nesting on or recode PSU ids")]
    ClustersNotNested { psu: i64 },

    #[error("stratum {stratum} has a single PSU and lonely-PSU policy is `fail`")]
    LonelyPsu { stratum: i64 },

    #[error("no rows left in the estimation domain for {0}")]
    EmptyDomain(String),

    #[error("{what} needs at least two observed levels, found {found}")]
    DegenerateTable { what: String, found: usize },

    #[error("information matrix is singular for model `{0}`; check for collinear terms")]
    SingularInformation(String),

    #[error("malformed extract {}: {reason}", .path.display())]
    MalformedExtract { path: PathBuf, reason: String },

    #[error(transparent)]
    Arrow(#[from] arrow::error::ArrowError),
}

pub type AnalysisResult<T> = Result<T, AnalysisError>;
