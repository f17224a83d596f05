//! Per-Day Snapshot Store
//!
//! Today's file holds exactly one row per active address, the latest probe
//! result for that address. Publication is atomic; dashboards read the
//! files directly so the CSV layout is a stable interface.

use crate::csvfile;
use crate::probe::ProbeResult;
use crate::MonitorError;
use chrono::{DateTime, Local, NaiveDate, NaiveDateTime};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

pub const SNAPSHOT_HEADERS: &[&str] = &[
    "timestamp",
    "device_id",
    "ip_address",
    "hostname",
    "ping_success",
    "response_time_ms",
    "latency_ms",
    "error_message",
    "merk",
    "os",
    "kondisi",
    "id_lokasi",
];

const FILE_PREFIX: &str = "ping_results_";

/// Below this size a file is header-only; anything larger carries data the
/// empty-publication guard must not wipe.
const SAFETY_MIN_BYTES: u64 = 200;

/// Per-day snapshot file metadata
#[derive(Debug, Clone, Serialize)]
pub struct SnapshotFileInfo {
    pub filename: String,
    pub date: String,
    pub size_bytes: u64,
    pub device_count: usize,
    pub last_modified: NaiveDateTime,
}

/// Aggregate statistics over all per-day files
#[derive(Debug, Clone, Serialize)]
pub struct SnapshotFileStats {
    pub total_files: usize,
    pub total_size_bytes: u64,
    pub total_size_mb: f64,
    pub total_devices_recorded: usize,
    pub oldest_file: Option<String>,
    pub newest_file: Option<String>,
}

/// Latest-per-address table persisted per day
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Directory holding the per-day files
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, date_tag: &str) -> PathBuf {
        self.dir.join(format!("{FILE_PREFIX}{date_tag}.csv"))
    }

    fn today_path(&self) -> PathBuf {
        self.path_for(&Local::now().format("%Y%m%d").to_string())
    }

    /// Publish a result batch into today's file.
    ///
    /// Addresses no longer in `active_ips` are pruned, then every result
    /// replaces or inserts its address row. Returns the row count after
    /// publication.
    pub fn publish(
        &self,
        results: &[ProbeResult],
        active_ips: &HashSet<String>,
    ) -> Result<usize, MonitorError> {
        let path = self.today_path();

        // An empty batch over a populated file means an upstream fault,
        // never a healthy cycle. Keep the previous data.
        if results.is_empty() && csvfile::size_of(&path) > SAFETY_MIN_BYTES {
            tracing::error!(
                "Refusing to clear populated snapshot {} with an empty result batch",
                path.display()
            );
            return Ok(self.read_all(None).len());
        }

        let mut table: BTreeMap<String, ProbeResult> = BTreeMap::new();
        for row in csvfile::read_rows::<ProbeResult>(&path) {
            table.insert(row.ip_address.clone(), row);
        }

        let before = table.len();
        table.retain(|ip, _| active_ips.contains(ip));
        let pruned = before - table.len();
        if pruned > 0 {
            tracing::info!("Pruned {pruned} stale address(es) from snapshot");
        }

        for result in results {
            table.insert(result.ip_address.clone(), result.clone());
        }

        let rows: Vec<&ProbeResult> = table.values().collect();
        csvfile::write_rows(&path, SNAPSHOT_HEADERS, &rows)?;

        tracing::debug!(
            "Snapshot updated: {} ({} devices)",
            path.display(),
            rows.len()
        );
        Ok(rows.len())
    }

    /// All rows of today's snapshot, optionally truncated
    pub fn read_all(&self, limit: Option<usize>) -> Vec<ProbeResult> {
        let mut rows = csvfile::read_rows::<ProbeResult>(&self.today_path());
        if let Some(limit) = limit {
            rows.truncate(limit);
        }
        rows
    }

    /// Per-day files, newest first
    pub fn list_files(&self) -> Vec<SnapshotFileInfo> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(_) => return Vec::new(),
        };

        let mut files = Vec::new();
        for entry in entries.flatten() {
            let filename = entry.file_name().to_string_lossy().to_string();
            let Some(date_tag) = filename
                .strip_prefix(FILE_PREFIX)
                .and_then(|rest| rest.strip_suffix(".csv"))
            else {
                continue;
            };

            let date = NaiveDate::parse_from_str(date_tag, "%Y%m%d")
                .map(|d| d.format("%Y-%m-%d").to_string())
                .unwrap_or_else(|_| "Unknown".to_string());

            let Ok(meta) = entry.metadata() else { continue };
            let last_modified = meta
                .modified()
                .map(|t| DateTime::<Local>::from(t).naive_local())
                .unwrap_or_else(|_| Local::now().naive_local());

            let device_count = std::fs::read_to_string(entry.path())
                .map(|content| content.lines().count().saturating_sub(1))
                .unwrap_or(0);

            files.push(SnapshotFileInfo {
                filename,
                date,
                size_bytes: meta.len(),
                device_count,
                last_modified,
            });
        }

        files.sort_by(|a, b| b.filename.cmp(&a.filename));
        files
    }

    /// Aggregate file statistics for the service status surface
    pub fn file_stats(&self) -> SnapshotFileStats {
        let files = self.list_files();
        let total_size: u64 = files.iter().map(|f| f.size_bytes).sum();
        SnapshotFileStats {
            total_files: files.len(),
            total_size_bytes: total_size,
            total_size_mb: (total_size as f64 / 1024.0 / 1024.0 * 100.0).round() / 100.0,
            total_devices_recorded: files.iter().map(|f| f.device_count).sum(),
            oldest_file: files.last().map(|f| f.date.clone()),
            newest_file: files.first().map(|f| f.date.clone()),
        }
    }

    /// Delete per-day files older than the retention window
    pub fn cleanup_old(&self, keep_days: u64) {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return;
        };
        let cutoff = std::time::SystemTime::now()
            - std::time::Duration::from_secs(keep_days * 24 * 60 * 60);

        let mut deleted = 0usize;
        for entry in entries.flatten() {
            let filename = entry.file_name().to_string_lossy().to_string();
            if !filename.starts_with(FILE_PREFIX) || !filename.ends_with(".csv") {
                continue;
            }
            let Ok(meta) = entry.metadata() else { continue };
            if meta.modified().map(|t| t < cutoff).unwrap_or(false) {
                if std::fs::remove_file(entry.path()).is_ok() {
                    deleted += 1;
                    tracing::info!("Deleted old snapshot file: {filename}");
                }
            }
        }
        if deleted > 0 {
            tracing::info!("Cleaned up {deleted} old snapshot files");
        }
    }
}
