use arrow::{
    array::{Array, ArrayRef, Float64Array},
    compute::cast,
    datatypes::DataType,
    record_batch::RecordBatch,
};

use crate::error::{AnalysisError, AnalysisResult};

/// Look up a column or fail with `MissingColumn`.
pub fn column<'a>(batch: &'a RecordBatch, name: &str) -> AnalysisResult<&'a ArrayRef> {
    batch
        .column_by_name(name)
        .ok_or_else(|| AnalysisError::MissingColumn(name.to_string()))
}

fn is_code_type(dt: &DataType) -> bool {
    dt.is_numeric() || matches!(dt, DataType::Boolean | DataType::Null)
}

/// Numeric view of a coded column; nulls become `None`.
pub fn f64_values(batch: &RecordBatch, name: &str) -> AnalysisResult<Vec<Option<f64>>> {
    let arr = column(batch, name)?;
    if !is_code_type(arr.data_type()) {
        return Err(AnalysisError::NonNumericColumn {
            column: name.to_string(),
            found: format!("{}", arr.data_type()),
        });
    }
    let casted = cast(arr, &DataType::Float64)?;
    let values = casted
        .as_any()
        .downcast_ref::<Float64Array>()
        .ok_or_else(|| AnalysisError::NonNumericColumn {
            column: name.to_string(),
            found: format!("{}", arr.data_type()),
        })?;
    Ok(values
        .iter()
        .map(|v| v.filter(|x| x.is_finite()))
        .collect())
}

/// Integer codes of a column. Fractional values are rejected rather than
/// truncated so that a weight column can't pass as a category by accident.
pub fn i64_codes(batch: &RecordBatch, name: &str) -> AnalysisResult<Vec<Option<i64>>> {
    let values = f64_values(batch, name)?;
    values
        .into_iter()
        .map(|v| match v {
            None => Ok(None),
            Some(x) if x.fract() == 0.0 => Ok(Some(x as i64)),
            Some(x) => Err(AnalysisError::NonNumericColumn {
                column: name.to_string(),
                found: format!("non-integral value {}", x),
            }),
        })
        .collect()
}

/// Build a nullable Float64 column from optional values.
pub fn f64_array(values: &[Option<f64>]) -> ArrayRef {
    std::sync::Arc::new(Float64Array::from(values.to_vec()))
}
