use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use tracing::info;

use super::{compute_delta, DeltaOptions, DeltaResult, DeltaStats, Result, Row, NULL_TOKEN};

/// Serialize a delta as CSV: inserts, then updates (new side), then deletes.
///
/// Deleted keys carry [`NULL_TOKEN`] in every column, which the ingestion
/// endpoint reads as a deletion.
pub fn write_delta<W: Write>(delta: &DeltaResult, out: W) -> Result<DeltaStats> {
    let mut writer = csv::WriterBuilder::new()
        .terminator(csv::Terminator::Any(b'\n'))
        .from_writer(out);

    let mut header = Vec::with_capacity(delta.columns.len() + 1);
    header.push(delta.key_column.as_str());
    header.extend(delta.columns.iter().map(String::as_str));
    writer.write_record(&header)?;

    for (key, row) in &delta.insert {
        writer.write_record(encode_row(key, row, &delta.columns))?;
    }
    for (key, (_, row)) in &delta.update {
        writer.write_record(encode_row(key, row, &delta.columns))?;
    }
    for key in &delta.delete {
        let mut record = Vec::with_capacity(delta.columns.len() + 1);
        record.push(key.as_str());
        record.extend(std::iter::repeat(NULL_TOKEN).take(delta.columns.len()));
        writer.write_record(&record)?;
    }

    writer.flush()?;
    Ok(delta.stats())
}

fn encode_row<'a>(key: &'a str, row: &'a Row, columns: &'a [String]) -> Vec<&'a str> {
    let mut record = Vec::with_capacity(columns.len() + 1);
    record.push(key);
    for column in columns {
        let value = row.get(column).and_then(|v| v.as_deref()).unwrap_or(NULL_TOKEN);
        record.push(value);
    }
    record
}

/// Diff two dump files and write the delta to `out_path`
pub fn write_delta_file(
    old_path: &Path,
    new_path: &Path,
    out_path: &Path,
    options: &DeltaOptions,
) -> Result<DeltaStats> {
    let old = BufReader::new(File::open(old_path)?);
    let new = BufReader::new(File::open(new_path)?);
    let delta = compute_delta(old, new, options)?;

    let out = BufWriter::new(File::create(out_path)?);
    let stats = write_delta(&delta, out)?;

    info!(
        old = %old_path.display(),
        new = %new_path.display(),
        output = %out_path.display(),
        inserted = stats.inserted,
        updated = stats.updated,
        deleted = stats.deleted,
        "Delta written"
    );

    Ok(stats)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn render(old: &str, new: &str) -> String {
        let delta =
            compute_delta(old.as_bytes(), new.as_bytes(), &DeltaOptions::default()).unwrap();
        let mut out = Vec::new();
        write_delta(&delta, &mut out).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn test_sections_in_order() {
        let out = render(
            "id,name\n1,Alice\n2,Bob\n4,Dan\n",
            "id,name\n1,Alice\n3,Carol\n4,Daniel\n",
        );
        assert_eq!(out, "id,name\n3,Carol\n4,Daniel\n2,__null__\n");
    }

    #[test]
    fn test_new_columns_appended_after_existing_header() {
        let out = render("id,b,a\n1,x,y\n", "id,c,a\n1,z,y\n");
        assert_eq!(out, "id,b,a,c\n1,__null__,y,z\n");
    }

    #[test]
    fn test_delete_fills_every_column_with_null() {
        let out = render("id,a\n1,x\n", "id,a,b\n");
        assert_eq!(out, "id,a,b\n1,__null__,__null__\n");
    }

    #[test]
    fn test_empty_delta_still_has_header() {
        let out = render("id,a\n1,x\n", "id,a\n1,x\n");
        assert_eq!(out, "id,a\n");
    }

    #[test]
    fn test_fields_with_commas_are_quoted() {
        let out = render("id,a\n", "id,a\n1,\"x,y\"\n");
        assert_eq!(out, "id,a\n1,\"x,y\"\n");
    }

    #[test]
    fn test_write_delta_file() {
        let dir = tempfile::tempdir().unwrap();
        let old = dir.path().join("old.csv");
        let new = dir.path().join("new.csv");
        let out = dir.path().join("delta.csv");
        std::fs::write(&old, "id,v\n1,a\n2,b\n").unwrap();
        std::fs::write(&new, "id,v\n1,a\n2,c\n3,d\n").unwrap();

        let stats = write_delta_file(&old, &new, &out, &DeltaOptions::default()).unwrap();

        assert_eq!(
            stats,
            DeltaStats {
                inserted: 1,
                updated: 1,
                deleted: 0
            }
        );
        assert_eq!(std::fs::read_to_string(&out).unwrap(), "id,v\n3,d\n2,c\n");
    }
}
