use anyhow::{Context, Result};
use arrow::datatypes::Schema;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fs, path::Path};
use tracing::{debug, warn};

/// Field-metadata key holding a JSON object of `code -> label`.
pub const VALUE_LABELS_KEY: &str = "value_labels";
/// Field-metadata key holding the variable's descriptive label.
pub const VARIABLE_LABEL_KEY: &str = "label";

/// Display strings for coded columns, kept beside the numeric data so that
/// nothing in the estimation code ever compares against a label.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValueLabels {
    #[serde(default)]
    variables: BTreeMap<String, String>,
    #[serde(default)]
    values: BTreeMap<String, BTreeMap<i64, String>>,
}

impl ValueLabels {
    /// Collect labels stored in Arrow field metadata (how labeled extracts
    /// carry them through Parquet).
    pub fn from_schema(schema: &Schema) -> Self {
        let mut labels = Self::default();
        for field in schema.fields() {
            let meta = field.metadata();
            if let Some(var) = meta.get(VARIABLE_LABEL_KEY) {
                labels.set_variable_label(field.name(), var);
            }
            if let Some(raw) = meta.get(VALUE_LABELS_KEY) {
                match serde_json::from_str::<BTreeMap<i64, String>>(raw) {
                    Ok(map) => labels.set_value_labels(field.name(), map),
                    Err(e) => {
                        warn!(column = %field.name(), "ignoring unreadable value labels: {}", e)
                    }
                }
            }
        }
        labels
    }

    /// Read a `<stem>.labels.json` sidecar.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading label sidecar {}", path.display()))?;
        let labels: Self = serde_json::from_str(&text)
            .with_context(|| format!("parsing label sidecar {}", path.display()))?;
        debug!(
            path = %path.display(),
            variables = labels.variables.len(),
            coded = labels.values.len(),
            "loaded label sidecar"
        );
        Ok(labels)
    }

    pub fn set_variable_label(&mut self, column: &str, label: &str) {
        self.variables.insert(column.to_string(), label.to_string());
    }

    pub fn set_value_labels<I, S>(&mut self, column: &str, labels: I)
    where
        I: IntoIterator<Item = (i64, S)>,
        S: Into<String>,
    {
        let entry = self.values.entry(column.to_string()).or_default();
        for (code, label) in labels {
            entry.insert(code, label.into());
        }
    }

    pub fn variable_label(&self, column: &str) -> Option<&str> {
        self.variables.get(column).map(String::as_str)
    }

    pub fn value_label(&self, column: &str, code: i64) -> Option<&str> {
        self.values
            .get(column)
            .and_then(|m| m.get(&code))
            .map(String::as_str)
    }

    /// Label for `code`, falling back to the bare number.
    pub fn display(&self, column: &str, code: i64) -> String {
        self.value_label(column, code)
            .map(str::to_string)
            .unwrap_or_else(|| code.to_string())
    }

    /// All `code -> label` pairs of a column, ascending by code.
    pub fn value_map(&self, column: &str) -> Option<&BTreeMap<i64, String>> {
        self.values.get(column)
    }

    /// Overlay `other` on top of `self`; entries in `other` win.
    pub fn merge(&mut self, other: &ValueLabels) {
        for (col, label) in &other.variables {
            self.variables.insert(col.clone(), label.clone());
        }
        for (col, map) in &other.values {
            let entry = self.values.entry(col.clone()).or_default();
            for (code, label) in map {
                entry.insert(*code, label.clone());
            }
        }
    }

    /// Move the labels of `from` to `to`; `from` is left unlabelled.
    pub fn rename(&mut self, from: &str, to: &str) {
        if let Some(v) = self.variables.remove(from) {
            self.variables.insert(to.to_string(), v);
        }
        if let Some(m) = self.values.remove(from) {
            self.values.insert(to.to_string(), m);
        }
    }
}
