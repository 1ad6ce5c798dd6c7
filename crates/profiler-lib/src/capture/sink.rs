//! Per-process CSV logs and the results index
//!
//! Each process gets `<results>/<process>.csv`. The file is append-only: the
//! header is written only by whoever creates it, and every record is flushed
//! before the write returns.

use crate::error::{ProfilerError, Result};
use crate::models::{ProcessId, Record};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

pub const CSV_HEADER: &str = "time,name,cpu,memory";

/// Wall-clock format of the `time` column
pub const TIME_FORMAT: &str = "%H:%M:%S";

pub const INDEX_FILE_NAME: &str = "index.json";

/// Append-only writer for one process's log
pub struct RecordSink {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl RecordSink {
    /// Open the log for `process`, creating it with a header if it does not exist
    pub fn open(dir: &Path, process: &ProcessId) -> Result<Self> {
        let path = dir.join(process.log_file_name());

        let (file, created) = match OpenOptions::new().append(true).create_new(true).open(&path) {
            Ok(file) => (file, true),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                let file = OpenOptions::new()
                    .append(true)
                    .open(&path)
                    .map_err(|e| ProfilerError::storage(&path, e))?;
                (file, false)
            }
            Err(e) => return Err(ProfilerError::storage(&path, e)),
        };

        let mut sink = Self {
            path,
            writer: BufWriter::new(file),
        };

        if created {
            writeln!(sink.writer, "{}", CSV_HEADER)
                .and_then(|_| sink.writer.flush())
                .map_err(|e| ProfilerError::storage(&sink.path, e))?;
            debug!(path = %sink.path.display(), "Created capture log");
        }

        Ok(sink)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one row per container sample and flush. Returns the row count.
    pub fn write_record(&mut self, record: &Record) -> Result<usize> {
        for sample in &record.samples {
            writeln!(
                self.writer,
                "{},{},{},{}",
                sample.timestamp.format(TIME_FORMAT),
                escape_field(&sample.container_name),
                sample.cpu_milli,
                sample.memory_bytes
            )
            .map_err(|e| ProfilerError::storage(&self.path, e))?;
        }

        self.writer
            .flush()
            .map_err(|e| ProfilerError::storage(&self.path, e))?;

        Ok(record.samples.len())
    }

    /// Flush and release the file handle
    pub fn close(mut self) -> Result<()> {
        self.writer
            .flush()
            .map_err(|e| ProfilerError::storage(&self.path, e))?;
        self.writer
            .get_ref()
            .sync_data()
            .map_err(|e| ProfilerError::storage(&self.path, e))
    }
}

/// Quote a field if it would break the row
fn escape_field(field: &str) -> std::borrow::Cow<'_, str> {
    if field.contains([',', '"', '\n', '\r']) {
        std::borrow::Cow::Owned(format!("\"{}\"", field.replace('"', "\"\"")))
    } else {
        std::borrow::Cow::Borrowed(field)
    }
}

/// Rewrite `<dir>/index.json` with the sorted names of every other entry in
/// `dir`, subdirectories included
pub fn write_index(dir: &Path) -> Result<Vec<String>> {
    let entries = fs::read_dir(dir).map_err(|e| ProfilerError::storage(dir, e))?;

    let mut names = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| ProfilerError::storage(dir, e))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name != INDEX_FILE_NAME {
            names.push(name);
        }
    }
    names.sort();

    let index_path = dir.join(INDEX_FILE_NAME);
    let body = serde_json::to_vec(&names).map_err(|e| {
        ProfilerError::storage(&index_path, std::io::Error::new(ErrorKind::InvalidData, e))
    })?;
    fs::write(&index_path, body).map_err(|e| ProfilerError::storage(&index_path, e))?;

    debug!(path = %index_path.display(), files = names.len(), "Wrote results index");
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ContainerUsage, Snapshot};
    use chrono::{TimeZone, Utc};
    use tempfile::TempDir;

    fn record(process: &str, h: u32, m: u32, s: u32, containers: Vec<ContainerUsage>) -> Record {
        Record::from_snapshot(
            ProcessId::new(process),
            Snapshot {
                timestamp: Utc.with_ymd_and_hms(2024, 3, 1, h, m, s).unwrap(),
                containers,
            },
        )
    }

    fn read(path: &Path) -> String {
        fs::read_to_string(path).unwrap()
    }

    #[test]
    fn test_header_written_on_create() {
        let dir = TempDir::new().unwrap();
        let sink = RecordSink::open(dir.path(), &ProcessId::new("pod-1")).unwrap();

        assert_eq!(read(sink.path()), "time,name,cpu,memory\n");
        assert_eq!(sink.path(), dir.path().join("pod-1.csv"));
    }

    #[test]
    fn test_reopen_does_not_rewrite_header() {
        let dir = TempDir::new().unwrap();
        let pid = ProcessId::new("pod-1");

        let mut sink = RecordSink::open(dir.path(), &pid).unwrap();
        sink.write_record(&record("pod-1", 10, 0, 0, vec![ContainerUsage::new("app", 1, 2)]))
            .unwrap();
        sink.close().unwrap();

        let mut reopened = RecordSink::open(dir.path(), &pid).unwrap();
        reopened
            .write_record(&record("pod-1", 10, 0, 10, vec![ContainerUsage::new("app", 3, 4)]))
            .unwrap();

        assert_eq!(
            read(reopened.path()),
            "time,name,cpu,memory\n10:00:00,app,1,2\n10:00:10,app,3,4\n"
        );
    }

    #[test]
    fn test_one_row_per_container() {
        let dir = TempDir::new().unwrap();
        let mut sink = RecordSink::open(dir.path(), &ProcessId::new("pod-2")).unwrap();

        let big = 1i64 << 53;
        let rows = sink
            .write_record(&record(
                "pod-2",
                23,
                59,
                58,
                vec![
                    ContainerUsage::new("app", 150, 2048),
                    ContainerUsage::new("proxy", 7, big),
                    ContainerUsage::new("init", 0, 0),
                ],
            ))
            .unwrap();

        assert_eq!(rows, 3);
        let content = read(sink.path());
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[1], "23:59:58,app,150,2048");
        assert_eq!(lines[2], format!("23:59:58,proxy,7,{}", big));
        assert_eq!(lines[3], "23:59:58,init,0,0");
    }

    #[test]
    fn test_empty_record_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let mut sink = RecordSink::open(dir.path(), &ProcessId::new("pod-3")).unwrap();

        assert_eq!(sink.write_record(&record("pod-3", 1, 2, 3, vec![])).unwrap(), 0);
        assert_eq!(read(sink.path()), "time,name,cpu,memory\n");
    }

    #[test]
    fn test_escape_field() {
        assert_eq!(escape_field("app"), "app");
        assert_eq!(escape_field("a,b"), "\"a,b\"");
        assert_eq!(escape_field("say \"hi\""), "\"say \"\"hi\"\"\"");
    }

    #[test]
    fn test_open_in_missing_directory_is_storage_error() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("does-not-exist");

        let result = RecordSink::open(&missing, &ProcessId::new("pod-1"));
        assert!(matches!(result, Err(ProfilerError::Storage { .. })));
    }

    #[test]
    fn test_write_index_lists_entries_except_itself() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("pod-b.csv"), "x").unwrap();
        fs::write(dir.path().join("pod-a.csv"), "x").unwrap();
        fs::create_dir(dir.path().join("nested")).unwrap();

        let names = write_index(dir.path()).unwrap();
        assert_eq!(names, vec!["nested", "pod-a.csv", "pod-b.csv"]);

        // Rewritten in full, never listing itself
        fs::write(dir.path().join("pod-c.csv"), "x").unwrap();
        write_index(dir.path()).unwrap();
        let index: Vec<String> =
            serde_json::from_str(&read(&dir.path().join(INDEX_FILE_NAME))).unwrap();
        assert_eq!(index, vec!["nested", "pod-a.csv", "pod-b.csv", "pod-c.csv"]);
    }

    #[test]
    fn test_write_index_shrinks_file() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a-very-long-file-name-for-the-first-pod.csv"), "x").unwrap();
        write_index(dir.path()).unwrap();

        fs::remove_file(dir.path().join("a-very-long-file-name-for-the-first-pod.csv")).unwrap();
        write_index(dir.path()).unwrap();

        assert_eq!(read(&dir.path().join(INDEX_FILE_NAME)), "[]");
    }
}
