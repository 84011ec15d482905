// src/load/mod.rs

pub mod labels;

use anyhow::{Context, Result};
use arrow::{
    compute::concat_batches,
    csv::{reader::Format, ReaderBuilder},
    datatypes::SchemaRef,
    record_batch::RecordBatch,
};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use std::{
    fs::File,
    io::{Seek, SeekFrom},
    path::{Path, PathBuf},
    sync::Arc,
};
use tracing::{debug, info};

use crate::error::AnalysisError;
pub use labels::ValueLabels;

const BATCH_SIZE: usize = 8192;

/// One survey extract held in memory: the coded columns plus their labels.
#[derive(Debug, Clone)]
pub struct LabeledTable {
    /// Short role name used in errors and logs ("respondent", "household").
    pub name: String,
    pub batch: RecordBatch,
    pub labels: ValueLabels,
}

impl LabeledTable {
    pub fn new(name: impl Into<String>, batch: RecordBatch, labels: ValueLabels) -> Self {
        Self {
            name: name.into(),
            batch,
            labels,
        }
    }

    pub fn num_rows(&self) -> usize {
        self.batch.num_rows()
    }

    pub fn schema(&self) -> SchemaRef {
        self.batch.schema()
    }
}

/// Which on-disk layout an extract uses, decided by file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractFormat {
    Parquet,
    Csv,
}

impl ExtractFormat {
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "parquet" | "pq" => Some(ExtractFormat::Parquet),
            "csv" => Some(ExtractFormat::Csv),
            _ => None,
        }
    }
}

/// `<dir>/<stem>.labels.json` next to the extract.
pub fn sidecar_path(path: &Path) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    path.with_file_name(format!("{}.labels.json", stem))
}

/// Load one extract into memory. Missing or unreadable files are fatal and
/// the error names the offending path.
#[tracing::instrument(level = "info", skip(path), fields(path = %path.display()))]
pub fn load_extract(path: &Path, name: &str) -> Result<LabeledTable> {
    if !path.is_file() {
        return Err(AnalysisError::MalformedExtract {
            path: path.to_path_buf(),
            reason: "file not found".into(),
        }
        .into());
    }

    // 1) read every batch
    let (schema, batches) = match ExtractFormat::from_path(path) {
        Some(ExtractFormat::Parquet) => read_parquet(path)?,
        Some(ExtractFormat::Csv) => read_csv(path)?,
        None => {
            return Err(AnalysisError::MalformedExtract {
                path: path.to_path_buf(),
                reason: "unsupported extension (expected .parquet or .csv)".into(),
            }
            .into())
        }
    };

    // 2) one contiguous batch per table keeps later row indexing simple
    let batch = concat_batches(&schema, &batches)
        .with_context(|| format!("concatenating batches of {}", path.display()))?;

    // 3) labels: field metadata first, sidecar on top
    let mut labels = ValueLabels::from_schema(&schema);
    let sidecar = sidecar_path(path);
    if sidecar.is_file() {
        labels.merge(&ValueLabels::from_json_file(&sidecar)?);
    }

    info!(
        table = name,
        rows = batch.num_rows(),
        columns = batch.num_columns(),
        "loaded extract"
    );
    Ok(LabeledTable::new(name, batch, labels))
}

fn read_parquet(path: &Path) -> Result<(SchemaRef, Vec<RecordBatch>)> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let builder = ParquetRecordBatchReaderBuilder::try_new(file)
        .with_context(|| format!("reading Parquet footer of {}", path.display()))?;
    let schema = builder.schema().clone();
    let reader = builder
        .with_batch_size(BATCH_SIZE)
        .build()
        .with_context(|| format!("building Parquet reader for {}", path.display()))?;

    let mut batches = Vec::new();
    for batch in reader {
        batches.push(batch.with_context(|| format!("decoding {}", path.display()))?);
    }
    debug!(batches = batches.len(), "parquet batches read");
    Ok((schema, batches))
}

fn read_csv(path: &Path) -> Result<(SchemaRef, Vec<RecordBatch>)> {
    let mut file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let format = Format::default().with_header(true);
    let (schema, records) = format
        .infer_schema(&mut file, None)
        .with_context(|| format!("inferring CSV schema of {}", path.display()))?;
    debug!(records, fields = schema.fields().len(), "csv schema inferred");
    file.seek(SeekFrom::Start(0))?;

    let schema = Arc::new(schema);
    let reader = ReaderBuilder::new(schema.clone())
        .with_format(format)
        .with_batch_size(BATCH_SIZE)
        .build(file)
        .with_context(|| format!("building CSV reader for {}", path.display()))?;

    let mut batches = Vec::new();
    for batch in reader {
        batches.push(batch.with_context(|| format!("parsing {}", path.display()))?);
    }
    Ok((schema, batches))
}
