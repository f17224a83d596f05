//! Atomic CSV Persistence
//!
//! Every shared file is replaced via temp-file-plus-rename so readers only
//! ever see a complete previous or next version. An advisory file lock is
//! taken around each write to defend against multi-process deployments.

use crate::MonitorError;
use fs2::FileExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;

/// Advisory exclusive lock on the current file, released on drop.
///
/// Missing files are not an error: there is nothing to lock until the
/// first publication creates the target.
fn lock_target(path: &Path) -> Option<File> {
    let file = OpenOptions::new().read(true).open(path).ok()?;
    if let Err(e) = file.lock_exclusive() {
        tracing::warn!("Could not acquire file lock on {}: {}", path.display(), e);
        return None;
    }
    Some(file)
}

/// Replace `path` with a CSV holding `headers` plus one record per row.
///
/// The content is built in memory, written to a sibling temp file, fsynced
/// and renamed over the target. On any failure the previous file is left
/// intact and the temp file is cleaned up by its own drop.
pub fn write_rows<S: Serialize>(
    path: &Path,
    headers: &[&str],
    rows: &[S],
) -> Result<(), MonitorError> {
    let dir = path
        .parent()
        .ok_or_else(|| MonitorError::Persist(format!("{} has no parent", path.display())))?;
    std::fs::create_dir_all(dir)?;

    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());
    writer.write_record(headers)?;
    for row in rows {
        writer.serialize(row)?;
    }
    let buf = writer
        .into_inner()
        .map_err(|e| MonitorError::Persist(e.to_string()))?;

    let _lock = lock_target(path);

    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(&buf)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path)
        .map_err(|e| MonitorError::Persist(e.to_string()))?;

    Ok(())
}

/// Read every record of `path` into `D`.
///
/// A missing file yields an empty vec. A corrupt file or corrupt records
/// are tolerated: unreadable rows are skipped with a warning so one bad
/// line cannot take the whole ledger down.
pub fn read_rows<D: DeserializeOwned>(path: &Path) -> Vec<D> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(_) => return Vec::new(),
    };

    let mut reader = csv::Reader::from_reader(file);
    let mut rows = Vec::new();
    for record in reader.deserialize() {
        match record {
            Ok(row) => rows.push(row),
            Err(e) => {
                tracing::warn!("Skipping corrupt record in {}: {}", path.display(), e);
            }
        }
    }
    rows
}

/// Append one record, creating the file with its header first if needed.
pub fn append_row<S: Serialize>(
    path: &Path,
    headers: &[&str],
    row: &S,
) -> Result<(), MonitorError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }

    if !path.exists() {
        write_rows::<S>(path, headers, &[])?;
    }

    let file = OpenOptions::new().append(true).open(path)?;
    if let Err(e) = file.lock_exclusive() {
        tracing::warn!("Could not acquire file lock on {}: {}", path.display(), e);
    }

    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(&file);
    writer.serialize(row)?;
    writer.flush()?;
    drop(writer);

    let _ = fs2::FileExt::unlock(&file);
    Ok(())
}

/// File size in bytes, zero when missing.
pub fn size_of(path: &Path) -> u64 {
    std::fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::tempdir;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Row {
        name: String,
        count: u32,
    }

    const HEADERS: &[&str] = &["name", "count"];

    #[test]
    fn test_write_then_read_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rows.csv");

        let rows = vec![
            Row { name: "a".into(), count: 1 },
            Row { name: "b".into(), count: 2 },
        ];
        write_rows(&path, HEADERS, &rows).unwrap();

        let back: Vec<Row> = read_rows(&path);
        assert_eq!(back, rows);
    }

    #[test]
    fn test_empty_write_keeps_header() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rows.csv");

        write_rows::<Row>(&path, HEADERS, &[]).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("name,count"));
        assert!(read_rows::<Row>(&path).is_empty());
    }

    #[test]
    fn test_missing_file_reads_empty() {
        let dir = tempdir().unwrap();
        let rows: Vec<Row> = read_rows(&dir.path().join("absent.csv"));
        assert!(rows.is_empty());
    }

    #[test]
    fn test_corrupt_rows_are_skipped() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rows.csv");
        std::fs::write(&path, "name,count\na,1\nbroken-line-without-count\nb,2\n").unwrap();

        let rows: Vec<Row> = read_rows(&path);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].count, 2);
    }

    #[test]
    fn test_append_creates_header_once() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.csv");

        append_row(&path, HEADERS, &Row { name: "a".into(), count: 1 }).unwrap();
        append_row(&path, HEADERS, &Row { name: "b".into(), count: 2 }).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.matches("name,count").count(), 1);
        assert_eq!(read_rows::<Row>(&path).len(), 2);
    }

    #[test]
    fn test_rewrite_replaces_previous_content() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rows.csv");

        write_rows(&path, HEADERS, &[Row { name: "old".into(), count: 9 }]).unwrap();
        write_rows(&path, HEADERS, &[Row { name: "new".into(), count: 1 }]).unwrap();

        let rows: Vec<Row> = read_rows(&path);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].name, "new");
    }
}
