use std::collections::HashMap;
use std::io::Read;

use super::engine::{csv_reader, read_header};
use super::{Result, Side};

/// A key that occurs more than once in one dump
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateKey {
    pub key: String,
    /// Every row seen for the key, in file order, key column included
    pub rows: Vec<Vec<String>>,
}

/// List keys that appear more than once, in order of first appearance.
///
/// Diagnostic for tracking down source queries that emit duplicate keys.
pub fn find_duplicates<R: Read>(input: R) -> Result<Vec<DuplicateKey>> {
    let mut reader = csv_reader(input);
    read_header(&mut reader, Side::New)?;

    let mut index: HashMap<String, usize> = HashMap::new();
    let mut groups: Vec<DuplicateKey> = Vec::new();

    for record in reader.records() {
        let record = record?;
        let fields: Vec<String> = record.iter().map(str::to_string).collect();
        let Some(key) = fields.first().cloned() else {
            continue;
        };

        match index.get(&key) {
            Some(&slot) => groups[slot].rows.push(fields),
            None => {
                index.insert(key.clone(), groups.len());
                groups.push(DuplicateKey {
                    key,
                    rows: vec![fields],
                });
            },
        }
    }

    groups.retain(|group| group.rows.len() > 1);
    Ok(groups)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_reports_only_repeated_keys() {
        let dump = "id,a\n1,x\n2,y\n1,z\n3,w\n2,y\n";
        let duplicates = find_duplicates(dump.as_bytes()).unwrap();

        assert_eq!(duplicates.len(), 2);
        assert_eq!(duplicates[0].key, "1");
        assert_eq!(duplicates[0].rows, vec![vec!["1", "x"], vec!["1", "z"]]);
        assert_eq!(duplicates[1].key, "2");
        assert_eq!(duplicates[1].rows.len(), 2);
    }

    #[test]
    fn test_clean_dump_has_no_duplicates() {
        assert!(find_duplicates("id\n1\n2\n".as_bytes()).unwrap().is_empty());
    }
}
