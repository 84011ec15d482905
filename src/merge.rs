use arrow::{
    array::{ArrayRef, UInt32Array},
    compute::take,
    datatypes::{Field, Schema},
    record_batch::RecordBatch,
};
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};
use tracing::{debug, info};

use crate::{
    columns,
    config::KeyFields,
    error::{AnalysisError, AnalysisResult},
    load::LabeledTable,
};

/// Suffix appended to household columns whose name is already taken.
pub const COLLISION_SUFFIX: &str = "_hh";

pub type HouseholdKey = (i64, i64, i64);

/// Integer key triples for every row; `None` when any part is null.
pub fn key_triples(
    table: &LabeledTable,
    keys: &KeyFields,
) -> AnalysisResult<Vec<Option<HouseholdKey>>> {
    let mut parts: Vec<Vec<Option<i64>>> = Vec::with_capacity(3);
    for col in keys.as_array() {
        let arr = table
            .batch
            .column_by_name(col)
            .ok_or_else(|| AnalysisError::MissingJoinKey {
                table: table.name.clone(),
                column: col.to_string(),
            })?;
        let mistyped = || AnalysisError::MistypedJoinKey {
            table: table.name.clone(),
            column: col.to_string(),
            found: format!("{}", arr.data_type()),
        };
        let codes = columns::i64_codes(&table.batch, col).map_err(|_| mistyped())?;
        parts.push(codes);
    }

    Ok((0..table.num_rows())
        .map(|i| match (parts[0][i], parts[1][i], parts[2][i]) {
            (Some(c), Some(h), Some(m)) => Some((c, h, m)),
            _ => None,
        })
        .collect())
}

fn index_unique(
    table: &LabeledTable,
    keys: &[Option<HouseholdKey>],
) -> AnalysisResult<HashMap<HouseholdKey, usize>> {
    let mut index = HashMap::with_capacity(keys.len());
    for (row, key) in keys.iter().enumerate() {
        let Some(key) = key else { continue };
        if index.insert(*key, row).is_some() {
            return Err(AnalysisError::DuplicateJoinKey {
                table: table.name.clone(),
                cluster: key.0,
                household: key.1,
                member: key.2,
            });
        }
    }
    Ok(index)
}

/// Inner join of respondents with household members on the composite key.
///
/// Both sides must be unique on the key; rows whose key has a null part never
/// match. Output columns are the respondent's followed by the household's, in
/// respondent row order.
#[tracing::instrument(
    level = "info",
    skip_all,
    fields(respondents = respondents.num_rows(), members = members.num_rows())
)]
pub fn merge_on_household_key(
    respondents: &LabeledTable,
    respondent_keys: &KeyFields,
    members: &LabeledTable,
    member_keys: &KeyFields,
) -> AnalysisResult<LabeledTable> {
    // 1) keys on both sides, validated before any row is matched
    let r_keys = key_triples(respondents, respondent_keys)?;
    let m_keys = key_triples(members, member_keys)?;
    index_unique(respondents, &r_keys)?;
    let m_index = index_unique(members, &m_keys)?;

    // 2) match in respondent order
    let mut r_take = Vec::new();
    let mut m_take = Vec::new();
    for (row, key) in r_keys.iter().enumerate() {
        if let Some(m_row) = key.as_ref().and_then(|k| m_index.get(k)) {
            r_take.push(row as u32);
            m_take.push(*m_row as u32);
        }
    }
    if r_take.is_empty() {
        return Err(AnalysisError::Unjoinable {
            respondents: respondents.num_rows(),
            members: members.num_rows(),
        });
    }
    debug!(
        matched = r_take.len(),
        unmatched_respondents = respondents.num_rows() - r_take.len(),
        "keys matched"
    );

    // 3) gather columns and assemble the joined schema
    let r_idx = UInt32Array::from(r_take);
    let m_idx = UInt32Array::from(m_take);
    let mut fields: Vec<Field> = Vec::new();
    let mut arrays: Vec<ArrayRef> = Vec::new();
    let mut labels = respondents.labels.clone();
    let mut taken: HashSet<String> = HashSet::new();

    for (field, arr) in respondents.schema().fields().iter().zip(respondents.batch.columns()) {
        taken.insert(field.name().clone());
        fields.push(field.as_ref().clone());
        arrays.push(take(arr.as_ref(), &r_idx, None)?);
    }

    let mut member_labels = members.labels.clone();
    for (field, arr) in members.schema().fields().iter().zip(members.batch.columns()) {
        let mut name = field.name().clone();
        if taken.contains(&name) {
            let renamed = format!("{}{}", name, COLLISION_SUFFIX);
            member_labels.rename(&name, &renamed);
            name = renamed;
        }
        taken.insert(name.clone());
        fields.push(field.as_ref().clone().with_name(name));
        arrays.push(take(arr.as_ref(), &m_idx, None)?);
    }
    labels.merge(&member_labels);

    let batch = RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays)?;
    info!(rows = batch.num_rows(), columns = batch.num_columns(), "merged extracts");
    Ok(LabeledTable::new("merged", batch, labels))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load::ValueLabels;
    use arrow::array::{Float64Array, Int64Array, StringArray};

    fn table(name: &str, cols: Vec<(&str, ArrayRef)>) -> LabeledTable {
        let fields: Vec<Field> = cols
            .iter()
            .map(|(n, a)| Field::new(*n, a.data_type().clone(), true))
            .collect();
        let arrays: Vec<ArrayRef> = cols.into_iter().map(|(_, a)| a).collect();
        let batch = RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays).unwrap();
        LabeledTable::new(name, batch, ValueLabels::default())
    }

    fn ints(v: Vec<Option<i64>>) -> ArrayRef {
        Arc::new(Int64Array::from(v))
    }

    fn r_keys() -> KeyFields {
        KeyFields {
            cluster: "v001".into(),
            household: "v002".into(),
            member: "v003".into(),
        }
    }

    fn m_keys() -> KeyFields {
        KeyFields {
            cluster: "hv001".into(),
            household: "hv002".into(),
            member: "hvidx".into(),
        }
    }

    fn respondents() -> LabeledTable {
        table(
            "respondent",
            vec![
                ("v001", ints(vec![Some(1), Some(1), Some(2), Some(3), None])),
                ("v002", ints(vec![Some(1), Some(1), Some(4), Some(9), Some(1)])),
                ("v003", ints(vec![Some(2), Some(3), Some(1), Some(1), Some(1)])),
                ("v106", ints(vec![Some(0), Some(1), Some(2), Some(3), Some(0)])),
            ],
        )
    }

    fn members() -> LabeledTable {
        table(
            "household",
            vec![
                ("hv001", ints(vec![Some(1), Some(1), Some(1), Some(2)])),
                ("hv002", ints(vec![Some(1), Some(1), Some(1), Some(4)])),
                ("hvidx", ints(vec![Some(1), Some(2), Some(3), Some(1)])),
                ("v106", ints(vec![Some(7), Some(8), Some(9), Some(6)])),
            ],
        )
    }

    #[test]
    fn inner_join_keeps_matching_keys_only() -> AnalysisResult<()> {
        let mut r = respondents();
        r.labels.set_value_labels("v106", [(0, "no education"), (1, "primary")]);
        let mut m = members();
        m.labels.set_variable_label("v106", "roster code");
        m.labels.set_value_labels("v106", [(1, "household code"), (8, "eight")]);
        let merged = merge_on_household_key(&r, &r_keys(), &m, &m_keys())?;

        // respondent (3,9,1) and the null-keyed row have no household match
        assert_eq!(merged.num_rows(), 3);
        assert!(merged.num_rows() <= r.num_rows().min(m.num_rows()));

        let got_r = key_triples(&merged, &r_keys())?;
        let got_m = key_triples(&merged, &m_keys())?;
        let all_r: HashSet<_> = key_triples(&r, &r_keys())?.into_iter().flatten().collect();
        let all_m: HashSet<_> = key_triples(&m, &m_keys())?.into_iter().flatten().collect();
        for (a, b) in got_r.iter().zip(&got_m) {
            assert_eq!(a, b);
            let k = a.expect("merged keys are complete");
            assert!(all_r.contains(&k));
            assert!(all_m.contains(&k));
        }

        // colliding household column is suffixed, respondent column untouched
        let own = columns::i64_codes(&merged.batch, "v106")?;
        let theirs = columns::i64_codes(&merged.batch, "v106_hh")?;
        assert_eq!(own, vec![Some(0), Some(1), Some(2)]);
        assert_eq!(theirs, vec![Some(8), Some(9), Some(6)]);

        // labels follow the rename and never overwrite the respondent's
        assert_eq!(merged.labels.value_label("v106", 1), Some("primary"));
        assert_eq!(merged.labels.value_label("v106", 8), None);
        assert_eq!(merged.labels.variable_label("v106"), None);
        assert_eq!(merged.labels.value_label("v106_hh", 1), Some("household code"));
        assert_eq!(merged.labels.variable_label("v106_hh"), Some("roster code"));
        Ok(())
    }

    #[test]
    fn missing_key_column_is_loud() {
        let r = respondents();
        let m = members();
        let mut keys = m_keys();
        keys.member = "hv003".into();
        let err = merge_on_household_key(&r, &r_keys(), &m, &keys).unwrap_err();
        match err {
            AnalysisError::MissingJoinKey { table, column } => {
                assert_eq!(table, "household");
                assert_eq!(column, "hv003");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn mistyped_key_column_is_loud() {
        let r = respondents();
        let m = table(
            "household",
            vec![
                ("hv001", Arc::new(StringArray::from(vec!["1"])) as ArrayRef),
                ("hv002", ints(vec![Some(1)])),
                ("hvidx", ints(vec![Some(2)])),
            ],
        );
        let err = merge_on_household_key(&r, &r_keys(), &m, &m_keys()).unwrap_err();
        assert!(matches!(err, AnalysisError::MistypedJoinKey { .. }));

        let fractional = table(
            "household",
            vec![
                ("hv001", Arc::new(Float64Array::from(vec![1.5])) as ArrayRef),
                ("hv002", ints(vec![Some(1)])),
                ("hvidx", ints(vec![Some(2)])),
            ],
        );
        let err = merge_on_household_key(&r, &r_keys(), &fractional, &m_keys()).unwrap_err();
        assert!(matches!(err, AnalysisError::MistypedJoinKey { .. }));
    }

    #[test]
    fn duplicate_member_key_is_rejected() {
        let r = respondents();
        let m = table(
            "household",
            vec![
                ("hv001", ints(vec![Some(1), Some(1)])),
                ("hv002", ints(vec![Some(1), Some(1)])),
                ("hvidx", ints(vec![Some(2), Some(2)])),
            ],
        );
        let err = merge_on_household_key(&r, &r_keys(), &m, &m_keys()).unwrap_err();
        assert!(matches!(
            err,
            AnalysisError::DuplicateJoinKey { cluster: 1, household: 1, member: 2, .. }
        ));
    }

    #[test]
    fn disjoint_keys_are_unjoinable() {
        let r = respondents();
        let m = table(
            "household",
            vec![
                ("hv001", ints(vec![Some(50)])),
                ("hv002", ints(vec![Some(50)])),
                ("hvidx", ints(vec![Some(50)])),
            ],
        );
        let err = merge_on_household_key(&r, &r_keys(), &m, &m_keys()).unwrap_err();
        assert!(matches!(err, AnalysisError::Unjoinable { respondents: 5, members: 1 }));
        assert!(err.to_string().contains("unjoinable dataset"));
    }
}
