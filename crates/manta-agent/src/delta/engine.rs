use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::io::Read;
use tracing::{debug, error, warn};

use super::{DeltaError, DeltaOptions, DeltaResult, Result, Row, Side, NULL_TOKEN};

/// Classify every key of `old` and `new` into insert/update/delete.
///
/// The whole existing dump is held in memory; the new dump is read fully
/// before classification so duplicate keys are caught on both sides.
pub fn compute_delta<O: Read, N: Read>(
    old: O,
    new: N,
    options: &DeltaOptions,
) -> Result<DeltaResult> {
    let mut old_reader = csv_reader(old);
    let mut new_reader = csv_reader(new);

    let old_header = read_header(&mut old_reader, Side::Old)?;
    let new_header = read_header(&mut new_reader, Side::New)?;

    if old_header[0] != new_header[0] {
        return Err(DeltaError::KeyColumnMismatch {
            old: old_header[0].clone(),
            new: new_header[0].clone(),
        });
    }
    let key_column = old_header[0].clone();

    let old_set: HashSet<&str> = old_header[1..].iter().map(String::as_str).collect();
    let new_set: HashSet<&str> = new_header[1..].iter().map(String::as_str).collect();
    let added_columns: Vec<String> = new_header[1..]
        .iter()
        .filter(|c| !old_set.contains(c.as_str()))
        .cloned()
        .collect();
    let removed_columns: Vec<String> = old_header[1..]
        .iter()
        .filter(|c| !new_set.contains(c.as_str()))
        .cloned()
        .collect();

    if !added_columns.is_empty() || !removed_columns.is_empty() {
        warn!(
            added = ?added_columns,
            removed = ?removed_columns,
            "Column set changed between dumps; affected rows will show up as updates"
        );
    }

    let mut old_rows = read_rows(
        &mut old_reader,
        &old_header,
        &added_columns,
        Side::Old,
        options.discard_duplicate_existing_rows,
    )?;
    let new_rows = read_rows(&mut new_reader, &new_header, &removed_columns, Side::New, false)?;

    let mut insert = BTreeMap::new();
    let mut update = BTreeMap::new();

    for (key, new_row) in new_rows {
        match old_rows.remove(&key) {
            None => {
                insert.insert(key, new_row);
            },
            Some(old_row) if old_row == new_row => {},
            Some(old_row) => {
                update.insert(key, (old_row, new_row));
            },
        }
    }

    let delete: BTreeSet<String> = old_rows.into_keys().collect();

    let mut columns: Vec<String> = old_header[1..].to_vec();
    columns.extend(added_columns.iter().cloned());

    debug!(
        key_column = %key_column,
        inserted = insert.len(),
        updated = update.len(),
        deleted = delete.len(),
        "Delta computed"
    );

    Ok(DeltaResult {
        key_column,
        columns,
        added_columns,
        removed_columns,
        insert,
        update,
        delete,
    })
}

pub(super) fn csv_reader<R: Read>(input: R) -> csv::Reader<R> {
    csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(input)
}

pub(super) fn read_header<R: Read>(reader: &mut csv::Reader<R>, side: Side) -> Result<Vec<String>> {
    let header: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();
    if header.is_empty() || header[0].is_empty() {
        return Err(DeltaError::MissingHeader { side });
    }
    Ok(header)
}

fn parse_value(field: &str) -> Option<String> {
    if field == NULL_TOKEN {
        None
    } else {
        Some(field.to_string())
    }
}

/// Read all data rows, null-filling `fill` columns so both sides share one column set
fn read_rows<R: Read>(
    reader: &mut csv::Reader<R>,
    header: &[String],
    fill: &[String],
    side: Side,
    discard_differing_duplicates: bool,
) -> Result<HashMap<String, Row>> {
    let mut rows: HashMap<String, Row> = HashMap::new();

    for record in reader.records() {
        let record = record?;
        let line = record.position().map(|p| p.line()).unwrap_or_default();

        if record.len() != header.len() {
            return Err(DeltaError::MalformedRow {
                side,
                line,
                expected: header.len(),
                found: record.len(),
            });
        }

        let key = record[0].to_string();
        let mut row: Row = header[1..]
            .iter()
            .zip(record.iter().skip(1))
            .map(|(column, value)| (column.clone(), parse_value(value)))
            .collect();
        for column in fill {
            row.insert(column.clone(), None);
        }

        match rows.entry(key) {
            Entry::Vacant(slot) => {
                slot.insert(row);
            },
            Entry::Occupied(mut slot) => {
                if slot.get() == &row {
                    warn!(
                        key = %slot.key(),
                        file = %side,
                        line,
                        "Identical duplicate row ignored; the source query is producing duplicates"
                    );
                } else if discard_differing_duplicates {
                    error!(
                        key = %slot.key(),
                        file = %side,
                        line,
                        "Differing duplicate row found; keeping the most recent one"
                    );
                    slot.insert(row);
                } else {
                    return Err(DeltaError::DuplicateKey {
                        side,
                        key: slot.key().clone(),
                        line,
                    });
                }
            },
        }
    }

    Ok(rows)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn delta(old: &str, new: &str) -> Result<DeltaResult> {
        compute_delta(old.as_bytes(), new.as_bytes(), &DeltaOptions::default())
    }

    fn row(pairs: &[(&str, Option<&str>)]) -> Row {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.map(str::to_string)))
            .collect()
    }

    #[test]
    fn test_insert_and_delete_with_same_schema() {
        let result = delta("id,name\n1,Alice\n2,Bob\n", "id,name\n1,Alice\n3,Carol\n").unwrap();

        assert_eq!(result.key_column, "id");
        assert_eq!(result.delete.iter().collect::<Vec<_>>(), vec!["2"]);
        assert_eq!(result.insert.len(), 1);
        assert_eq!(result.insert["3"], row(&[("name", Some("Carol"))]));
        assert!(result.update.is_empty());
    }

    #[test]
    fn test_update_carries_both_rows() {
        let result = delta("id,name\n1,Alice\n", "id,name\n1,Alicia\n").unwrap();

        let (old, new) = &result.update["1"];
        assert_eq!(old, &row(&[("name", Some("Alice"))]));
        assert_eq!(new, &row(&[("name", Some("Alicia"))]));
        assert!(result.insert.is_empty() && result.delete.is_empty());
    }

    #[test]
    fn test_self_diff_is_empty() {
        let dump = "id,a,b\n1,x,y\n2,,z\n3,__null__,w\n";
        assert!(delta(dump, dump).unwrap().is_empty());
    }

    #[test]
    fn test_disjoint_columns_null_fill() {
        let result = delta("id,a\n1,x\n2,__null__\n", "id,b\n1,y\n2,__null__\n").unwrap();

        assert_eq!(result.added_columns, vec!["b"]);
        assert_eq!(result.removed_columns, vec!["a"]);
        assert_eq!(result.columns, vec!["a", "b"]);

        // Key 1 differs on both columns once null-filled
        let (old, new) = &result.update["1"];
        assert_eq!(old, &row(&[("a", Some("x")), ("b", None)]));
        assert_eq!(new, &row(&[("a", None), ("b", Some("y"))]));

        // Key 2 is null everywhere on both sides
        assert!(!result.update.contains_key("2"));
        assert_eq!(result.update.len(), 1);
    }

    #[test]
    fn test_added_column_with_nulls_is_not_an_update() {
        let result = delta("id,a\n1,x\n", "id,a,b\n1,x,__null__\n").unwrap();
        assert!(result.is_empty());
        assert_eq!(result.columns, vec!["a", "b"]);
    }

    #[test]
    fn test_empty_string_is_not_null() {
        let result = delta("id,a\n1,\n", "id,a\n1,__null__\n").unwrap();
        assert_eq!(result.update.len(), 1);
    }

    #[test]
    fn test_key_column_mismatch_is_fatal() {
        let err = delta("id,a\n1,x\n", "uid,a\n1,x\n").unwrap_err();
        assert!(matches!(err, DeltaError::KeyColumnMismatch { .. }));
    }

    #[test]
    fn test_field_count_mismatch_is_fatal() {
        let err = delta("id,a\n1,x\n", "id,a\n1,x\n2,y,z\n").unwrap_err();
        match err {
            DeltaError::MalformedRow {
                side,
                line,
                expected,
                found,
            } => {
                assert_eq!(side, Side::New);
                assert_eq!(line, 3);
                assert_eq!(expected, 2);
                assert_eq!(found, 3);
            },
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_quoted_commas_stay_in_one_field() {
        let result = delta("id,a\n1,\"x,y\"\n", "id,a\n1,\"x,y\"\n").unwrap();
        assert!(result.is_empty());
    }

    #[test]
    fn test_identical_duplicates_are_ignored() {
        let result = delta("id,a\n1,x\n1,x\n", "id,a\n1,x\n1,x\n").unwrap();
        assert!(result.is_empty());
    }

    #[test]
    fn test_differing_duplicate_in_old_is_fatal_by_default() {
        let err = delta("id,a\n1,x\n1,y\n", "id,a\n1,x\n").unwrap_err();
        assert!(matches!(
            err,
            DeltaError::DuplicateKey { side: Side::Old, .. }
        ));
    }

    #[test]
    fn test_override_keeps_latest_existing_row() {
        let options = DeltaOptions {
            discard_duplicate_existing_rows: true,
        };
        let result =
            compute_delta("id,a\n1,x\n1,y\n".as_bytes(), "id,a\n1,y\n".as_bytes(), &options)
                .unwrap();
        assert!(result.is_empty());
    }

    #[test]
    fn test_override_never_applies_to_new_file() {
        let options = DeltaOptions {
            discard_duplicate_existing_rows: true,
        };
        let err = compute_delta("id,a\n".as_bytes(), "id,a\n1,x\n1,y\n".as_bytes(), &options)
            .unwrap_err();
        assert!(matches!(
            err,
            DeltaError::DuplicateKey { side: Side::New, line: 3, .. }
        ));
    }

    #[test]
    fn test_empty_input_has_no_header() {
        let err = delta("", "id\n").unwrap_err();
        assert!(matches!(err, DeltaError::MissingHeader { side: Side::Old }));
    }

    #[test]
    fn test_header_only_old_means_full_insert() {
        let result = delta("id,a\n", "id,a\n1,x\n2,y\n").unwrap();
        assert_eq!(result.insert.len(), 2);
        assert!(result.delete.is_empty());
    }
}
