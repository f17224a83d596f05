//! Consecutive-Failure Tracking
//!
//! Keeps the on-disk ledger of addresses currently failing, with first/last
//! timestamps and a strictly growing counter, plus a separate ledger of
//! addresses already alerted on. Both survive restarts; in-memory state is
//! re-read from disk at each update so multiple workers stay consistent.
//!
//! The one invariant everything else hangs on: an address in the ledger
//! that is absent from the current batch keeps its counters untouched.
//! Entries leave the ledger only on a successful probe.

use crate::csvfile;
use crate::probe::ProbeResult;
use crate::MonitorError;
use chrono::{Local, NaiveDateTime};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

pub const TRACKER_HEADERS: &[&str] = &[
    "ip_address",
    "hostname",
    "device_id",
    "merk",
    "os",
    "kondisi",
    "consecutive_timeouts",
    "first_timeout",
    "last_timeout",
    "last_updated",
];

pub const ALERT_HEADERS: &[&str] = &["ip_address", "hostname", "device_id"];

const TRACKER_FILE: &str = "timeout_tracking.csv";
const ALERT_FILE: &str = "whatsapp_alerted_list.csv";

/// One address in sustained failure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureEntry {
    pub ip_address: String,
    pub hostname: String,
    pub device_id: i64,
    pub merk: Option<String>,
    pub os: Option<String>,
    pub kondisi: String,
    pub consecutive_timeouts: u32,
    pub first_timeout: NaiveDateTime,
    pub last_timeout: NaiveDateTime,
    pub last_updated: NaiveDateTime,
}

impl FailureEntry {
    fn first_failure(result: &ProbeResult, now: NaiveDateTime) -> Self {
        Self {
            ip_address: result.ip_address.clone(),
            hostname: result.hostname.clone(),
            device_id: result.device_id,
            merk: result.merk.clone(),
            os: result.os.clone(),
            kondisi: result.kondisi.clone(),
            consecutive_timeouts: 1,
            first_timeout: now,
            last_timeout: now,
            last_updated: now,
        }
    }
}

/// One address that has already been alerted on
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertEntry {
    pub ip_address: String,
    pub hostname: String,
    pub device_id: i64,
}

impl From<&FailureEntry> for AlertEntry {
    fn from(entry: &FailureEntry) -> Self {
        Self {
            ip_address: entry.ip_address.clone(),
            hostname: entry.hostname.clone(),
            device_id: entry.device_id,
        }
    }
}

/// Edge events produced by one tracking update
#[derive(Debug, Default)]
pub struct TrackerEvents {
    /// Entries that crossed the alert threshold this cycle and are not yet
    /// in the alert ledger. Call [`FailureTracker::mark_alerted`] once the
    /// notification actually went out.
    pub alerts: Vec<FailureEntry>,
    /// Alerted entries that just recovered; each carries the ledger state
    /// at the moment of recovery.
    pub recoveries: Vec<FailureEntry>,
    /// Every address that recovered this cycle, alerted or not
    pub recovered_ips: Vec<String>,
    /// Full ledger state after the update, sorted by count descending
    pub entries: Vec<FailureEntry>,
}

/// Summary statistics over the failure ledger
#[derive(Debug, Clone, Serialize)]
pub struct TimeoutSummary {
    pub total_timeout_devices: usize,
    pub max_consecutive_timeouts: u32,
    pub average_consecutive_timeouts: f64,
    pub devices_with_high_timeouts: usize,
}

/// Comprehensive ledger report
#[derive(Debug, Clone, Serialize)]
pub struct TimeoutReport {
    pub summary: TimeoutSummary,
    pub critical_devices: Vec<FailureEntry>,
    pub all_timeout_devices: Vec<FailureEntry>,
    pub report_generated: NaiveDateTime,
}

/// Per-address consecutive-failure tracker
pub struct FailureTracker {
    dir: PathBuf,
    alert_threshold: u32,
    // Serialises update/mark/reset; file locks cover other processes.
    update_lock: Mutex<()>,
}

impl FailureTracker {
    pub fn new(dir: impl Into<PathBuf>, alert_threshold: u32) -> Self {
        Self {
            dir: dir.into(),
            alert_threshold,
            update_lock: Mutex::new(()),
        }
    }

    pub fn alert_threshold(&self) -> u32 {
        self.alert_threshold
    }

    fn tracker_path(&self) -> PathBuf {
        self.dir.join(TRACKER_FILE)
    }

    fn alert_path(&self) -> PathBuf {
        self.dir.join(ALERT_FILE)
    }

    fn read_entries(path: &Path) -> BTreeMap<String, FailureEntry> {
        csvfile::read_rows::<FailureEntry>(path)
            .into_iter()
            .map(|e| (e.ip_address.clone(), e))
            .collect()
    }

    fn read_alerted(path: &Path) -> BTreeMap<String, AlertEntry> {
        csvfile::read_rows::<AlertEntry>(path)
            .into_iter()
            .map(|e| (e.ip_address.clone(), e))
            .collect()
    }

    fn sorted(entries: BTreeMap<String, FailureEntry>) -> Vec<FailureEntry> {
        let mut rows: Vec<FailureEntry> = entries.into_values().collect();
        rows.sort_by(|a, b| {
            b.consecutive_timeouts
                .cmp(&a.consecutive_timeouts)
                .then_with(|| a.ip_address.cmp(&b.ip_address))
        });
        rows
    }

    fn write_entries(&self, entries: BTreeMap<String, FailureEntry>) -> Result<Vec<FailureEntry>, MonitorError> {
        let rows = Self::sorted(entries);
        csvfile::write_rows(&self.tracker_path(), TRACKER_HEADERS, &rows)?;
        Ok(rows)
    }

    fn write_alerted(&self, alerted: &BTreeMap<String, AlertEntry>) -> Result<(), MonitorError> {
        let rows: Vec<&AlertEntry> = alerted.values().collect();
        csvfile::write_rows(&self.alert_path(), ALERT_HEADERS, &rows)
    }

    /// Apply one probe batch to the ledger and return the edge events.
    ///
    /// Transitions per address present in the batch:
    /// success while tracked removes the entry (recovery), failure while
    /// tracked increments the counter, first failure inserts at count 1.
    /// Duplicate addresses within the batch are processed once.
    pub fn update(&self, results: &[ProbeResult]) -> Result<TrackerEvents, MonitorError> {
        let _guard = self.update_lock.lock();

        if results.is_empty() {
            return Ok(TrackerEvents {
                entries: Self::sorted(Self::read_entries(&self.tracker_path())),
                ..Default::default()
            });
        }

        let mut entries = Self::read_entries(&self.tracker_path());
        let mut alerted = Self::read_alerted(&self.alert_path());
        let now = Local::now().naive_local();

        let mut processed: HashSet<String> = HashSet::new();
        let mut events = TrackerEvents::default();

        for result in results {
            let ip = result.ip_address.clone();
            if !processed.insert(ip.clone()) {
                tracing::warn!("Duplicate address {ip} in ping results, processing once");
                continue;
            }

            if result.ping_success {
                let Some(entry) = entries.remove(&ip) else {
                    continue;
                };
                let was_alerted = alerted.remove(&ip).is_some();
                tracing::info!(
                    "Device {} ({}) recovered after {}x consecutive timeouts",
                    entry.hostname,
                    ip,
                    entry.consecutive_timeouts
                );

                if was_alerted && entry.consecutive_timeouts >= self.alert_threshold {
                    events.recoveries.push(entry);
                } else if was_alerted {
                    tracing::warn!(
                        "Inconsistent state: {ip} was in the alert ledger with only {}x timeouts (threshold {})",
                        entry.consecutive_timeouts,
                        self.alert_threshold
                    );
                }
                events.recovered_ips.push(ip);
            } else {
                match entries.entry(ip) {
                    Entry::Occupied(mut slot) => {
                        let entry = slot.get_mut();
                        entry.consecutive_timeouts += 1;
                        entry.last_timeout = now;
                        entry.last_updated = now;
                        if entry.consecutive_timeouts >= self.alert_threshold
                            && !alerted.contains_key(&entry.ip_address)
                        {
                            events.alerts.push(entry.clone());
                        }
                    }
                    Entry::Vacant(slot) => {
                        tracing::info!(
                            "Added {} to timeout tracking (first timeout)",
                            slot.key()
                        );
                        slot.insert(FailureEntry::first_failure(result, now));
                    }
                }
            }
        }

        // The alert ledger must never reference an address that is not
        // tracked as failing.
        alerted.retain(|ip, _| {
            let tracked = entries.contains_key(ip);
            if !tracked {
                tracing::warn!("Dropping alert ledger entry for untracked address {ip}");
            }
            tracked
        });

        self.write_alerted(&alerted)?;
        events.entries = self.write_entries(entries)?;
        Ok(events)
    }

    /// Record that a batch alert was actually delivered for these entries
    pub fn mark_alerted(&self, entries: &[FailureEntry]) -> Result<(), MonitorError> {
        let _guard = self.update_lock.lock();
        let mut alerted = Self::read_alerted(&self.alert_path());
        for entry in entries {
            alerted
                .entry(entry.ip_address.clone())
                .or_insert_with(|| AlertEntry::from(entry));
        }
        self.write_alerted(&alerted)
    }

    /// Current ledger, sorted by count descending
    pub fn entries(&self) -> Vec<FailureEntry> {
        Self::sorted(Self::read_entries(&self.tracker_path()))
    }

    /// Current alert ledger
    pub fn alerted(&self) -> Vec<AlertEntry> {
        Self::read_alerted(&self.alert_path()).into_values().collect()
    }

    /// Entries with at least `min_consecutive` timeouts
    pub fn devices(&self, min_consecutive: u32) -> Vec<FailureEntry> {
        self.entries()
            .into_iter()
            .filter(|e| e.consecutive_timeouts >= min_consecutive)
            .collect()
    }

    /// Entries at or above the critical threshold
    pub fn critical(&self, threshold: u32) -> Vec<FailureEntry> {
        self.devices(threshold)
    }

    /// Summary statistics
    pub fn summary(&self) -> TimeoutSummary {
        let entries = self.entries();
        if entries.is_empty() {
            return TimeoutSummary {
                total_timeout_devices: 0,
                max_consecutive_timeouts: 0,
                average_consecutive_timeouts: 0.0,
                devices_with_high_timeouts: 0,
            };
        }
        let counts: Vec<u32> = entries.iter().map(|e| e.consecutive_timeouts).collect();
        let sum: u64 = counts.iter().map(|&c| u64::from(c)).sum();
        let average = sum as f64 / counts.len() as f64;
        TimeoutSummary {
            total_timeout_devices: entries.len(),
            max_consecutive_timeouts: counts.iter().copied().max().unwrap_or(0),
            average_consecutive_timeouts: (average * 100.0).round() / 100.0,
            devices_with_high_timeouts: counts.iter().filter(|&&c| c > 10).count(),
        }
    }

    /// Comprehensive report for the API
    pub fn report(&self, critical_threshold: u32) -> TimeoutReport {
        TimeoutReport {
            summary: self.summary(),
            critical_devices: self.critical(critical_threshold),
            all_timeout_devices: self.entries(),
            report_generated: Local::now().naive_local(),
        }
    }

    /// Clear both ledgers, recreating the header-only files
    pub fn reset(&self) -> Result<(), MonitorError> {
        let _guard = self.update_lock.lock();
        csvfile::write_rows::<FailureEntry>(&self.tracker_path(), TRACKER_HEADERS, &[])?;
        csvfile::write_rows::<AlertEntry>(&self.alert_path(), ALERT_HEADERS, &[])?;
        tracing::info!("Timeout tracking reset");
        Ok(())
    }
}
