//! Incident Escalation
//!
//! Opens a ticket row in the external incident table once a device has
//! been failing continuously beyond the threshold. The tracking file
//! guarantees at most one ticket per continuous outage episode; recovery
//! clears the tracking entry so a re-failure can open a fresh ticket.
//! Closing the external row stays with the operators.

use crate::csvfile;
use crate::tracker::FailureEntry;
use crate::MonitorError;
use async_trait::async_trait;
use chrono::{Duration, Local, NaiveDateTime};
use serde::{Deserialize, Serialize};
use sqlx::MySqlPool;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

pub const INCIDENT_HEADERS: &[&str] = &[
    "ip_address",
    "hostname",
    "device_id",
    "alert_time",
    "incident_id",
    "incident_created_at",
    "device_type",
];

const TRACKING_FILE: &str = "incident_tracking.csv";

/// Row to insert into the external incident table
#[derive(Debug, Clone)]
pub struct NewIncident {
    pub deskripsi: String,
    pub tanggal: NaiveDateTime,
    pub lokasi: String,
    pub status: String,
    pub bagian_perusahaan: String,
}

/// Insert-only access to the incident table
#[async_trait]
pub trait IncidentStore: Send + Sync {
    /// Insert one incident row, returning its id
    async fn insert(&self, incident: &NewIncident) -> Result<i64, MonitorError>;
}

/// MySQL-backed incident table
pub struct MySqlIncidentStore {
    pool: MySqlPool,
}

impl MySqlIncidentStore {
    pub fn new(pool: MySqlPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl IncidentStore for MySqlIncidentStore {
    async fn insert(&self, incident: &NewIncident) -> Result<i64, MonitorError> {
        let result = sqlx::query(
            "INSERT INTO insidens \
             (deskripsi, tanggal, lokasi, latitude, longitude, foto, status, \
              bagian_perusahaan, keterangan_bagian, ditugaskan_kepada, catatan_petugas, \
              created_at, updated_at) \
             VALUES (?, ?, ?, NULL, NULL, NULL, ?, ?, NULL, NULL, NULL, ?, ?)",
        )
        .bind(&incident.deskripsi)
        .bind(incident.tanggal)
        .bind(&incident.lokasi)
        .bind(&incident.status)
        .bind(&incident.bagian_perusahaan)
        .bind(incident.tanggal)
        .bind(incident.tanggal)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_id() as i64)
    }
}

/// One open escalation, keyed by address
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncidentTrackingEntry {
    pub ip_address: String,
    pub hostname: String,
    pub device_id: i64,
    pub alert_time: NaiveDateTime,
    pub incident_id: i64,
    pub incident_created_at: NaiveDateTime,
    pub device_type: String,
}

/// Escalation summary for the API
#[derive(Debug, Clone, Serialize)]
pub struct IncidentSummary {
    pub total_incidents_created: usize,
    pub threshold_minutes: i64,
    pub incidents: Vec<IncidentTrackingEntry>,
}

/// Sustained-outage escalator
pub struct IncidentEscalator {
    store: Arc<dyn IncidentStore>,
    dir: PathBuf,
    threshold_minutes: i64,
    bagian_perusahaan: String,
}

impl IncidentEscalator {
    pub fn new(
        store: Arc<dyn IncidentStore>,
        dir: impl Into<PathBuf>,
        threshold_minutes: i64,
        bagian_perusahaan: impl Into<String>,
    ) -> Self {
        Self {
            store,
            dir: dir.into(),
            threshold_minutes,
            bagian_perusahaan: bagian_perusahaan.into(),
        }
    }

    pub fn threshold_minutes(&self) -> i64 {
        self.threshold_minutes
    }

    fn tracking_path(&self) -> PathBuf {
        self.dir.join(TRACKING_FILE)
    }

    fn read_tracking(&self) -> BTreeMap<String, IncidentTrackingEntry> {
        csvfile::read_rows::<IncidentTrackingEntry>(&self.tracking_path())
            .into_iter()
            .map(|e| (e.ip_address.clone(), e))
            .collect()
    }

    fn write_tracking(
        &self,
        tracking: &BTreeMap<String, IncidentTrackingEntry>,
    ) -> Result<(), MonitorError> {
        let rows: Vec<&IncidentTrackingEntry> = tracking.values().collect();
        csvfile::write_rows(&self.tracking_path(), INCIDENT_HEADERS, &rows)
    }

    /// Currently tracked escalations
    pub fn tracked(&self) -> Vec<IncidentTrackingEntry> {
        self.read_tracking().into_values().collect()
    }

    fn device_type_label(entry: &FailureEntry) -> String {
        format!(
            "{} {}",
            entry.merk.as_deref().unwrap_or("Unknown"),
            entry.os.as_deref().unwrap_or("Device")
        )
    }

    fn build_incident(&self, entry: &FailureEntry, now: NaiveDateTime) -> NewIncident {
        let device_type = Self::device_type_label(entry);
        let mut deskripsi = format!(
            "Device {device_type} ({}) non aktif selama lebih dari {} menit.\n\n",
            entry.hostname, self.threshold_minutes
        );
        deskripsi.push_str("Detail Device:\n");
        deskripsi.push_str(&format!("- Hostname: {}\n", entry.hostname));
        deskripsi.push_str(&format!("- IP Address: {}\n", entry.ip_address));
        if entry.device_id != 0 {
            deskripsi.push_str(&format!("- Device ID: {}\n", entry.device_id));
        }
        deskripsi.push_str(&format!(
            "- Merk: {}\n",
            entry.merk.as_deref().unwrap_or("Unknown")
        ));
        deskripsi.push_str(&format!(
            "- OS: {}\n\n",
            entry.os.as_deref().unwrap_or("Unknown")
        ));
        deskripsi.push_str("Timeline:\n");
        deskripsi.push_str(&format!(
            "- First Alert: {}\n",
            entry.first_timeout.format("%Y-%m-%d %H:%M:%S")
        ));
        deskripsi.push_str(&format!(
            "- Incident Created: {}",
            now.format("%Y-%m-%d %H:%M:%S")
        ));

        NewIncident {
            deskripsi,
            tanggal: now,
            lokasi: entry.hostname.clone(),
            status: "new".into(),
            bagian_perusahaan: self.bagian_perusahaan.clone(),
        }
    }

    /// Open incidents for entries failing beyond the threshold.
    ///
    /// An address already in the tracking file is skipped, so each
    /// continuous outage opens at most one row. Returns the new ids.
    pub async fn check_and_create(&self, entries: &[FailureEntry]) -> Vec<i64> {
        let mut tracking = self.read_tracking();
        let now = Local::now().naive_local();
        let mut created = Vec::new();

        for entry in entries {
            if tracking.contains_key(&entry.ip_address) {
                continue;
            }
            let down_for = now - entry.first_timeout;
            if down_for < Duration::minutes(self.threshold_minutes) {
                continue;
            }

            tracing::warn!(
                "Device {} ({}) down for {} minutes (threshold {}), creating incident",
                entry.hostname,
                entry.ip_address,
                down_for.num_minutes(),
                self.threshold_minutes
            );

            let incident = self.build_incident(entry, now);
            match self.store.insert(&incident).await {
                Ok(incident_id) => {
                    tracing::info!(
                        "Incident {incident_id} created for {} ({})",
                        entry.hostname,
                        entry.ip_address
                    );
                    tracking.insert(
                        entry.ip_address.clone(),
                        IncidentTrackingEntry {
                            ip_address: entry.ip_address.clone(),
                            hostname: entry.hostname.clone(),
                            device_id: entry.device_id,
                            alert_time: entry.first_timeout,
                            incident_id,
                            incident_created_at: now,
                            device_type: Self::device_type_label(entry),
                        },
                    );
                    created.push(incident_id);
                }
                Err(e) => {
                    tracing::error!(
                        "Failed to create incident for {}: {e}",
                        entry.ip_address
                    );
                }
            }
        }

        if !created.is_empty() {
            if let Err(e) = self.write_tracking(&tracking) {
                tracing::error!("Failed to persist incident tracking: {e}");
            }
        }
        created
    }

    /// Drop tracking entries for recovered addresses.
    ///
    /// The external rows stay as they are; closure is an operator action.
    pub fn cleanup_resolved(&self, recovered: &[String]) {
        if recovered.is_empty() {
            return;
        }
        let mut tracking = self.read_tracking();
        let mut changed = false;
        for ip in recovered {
            if let Some(entry) = tracking.remove(ip) {
                tracing::info!(
                    "Device {} ({ip}) recovered, incident {} can be closed",
                    entry.hostname,
                    entry.incident_id
                );
                changed = true;
            }
        }
        if changed {
            if let Err(e) = self.write_tracking(&tracking) {
                tracing::error!("Failed to persist incident tracking: {e}");
            }
        }
    }

    /// Escalation summary for the API
    pub fn summary(&self) -> IncidentSummary {
        let incidents = self.tracked();
        IncidentSummary {
            total_incidents_created: incidents.len(),
            threshold_minutes: self.threshold_minutes,
            incidents,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicI64, Ordering};
    use tempfile::tempdir;

    struct MockStore {
        next_id: AtomicI64,
        inserted: Mutex<Vec<NewIncident>>,
        fail: bool,
    }

    impl MockStore {
        fn new() -> Self {
            Self {
                next_id: AtomicI64::new(1),
                inserted: Mutex::new(Vec::new()),
                fail: false,
            }
        }

        fn failing() -> Self {
            Self { fail: true, ..Self::new() }
        }
    }

    #[async_trait]
    impl IncidentStore for MockStore {
        async fn insert(&self, incident: &NewIncident) -> Result<i64, MonitorError> {
            if self.fail {
                return Err(MonitorError::Persist("insert refused".into()));
            }
            self.inserted.lock().push(incident.clone());
            Ok(self.next_id.fetch_add(1, Ordering::SeqCst))
        }
    }

    fn failing_entry(ip: &str, minutes_down: i64) -> FailureEntry {
        let now = Local::now().naive_local();
        FailureEntry {
            ip_address: ip.into(),
            hostname: format!("cam-{ip}"),
            device_id: 12,
            merk: Some("Hikvision".into()),
            os: Some("Embedded".into()),
            kondisi: "baik".into(),
            consecutive_timeouts: 30,
            first_timeout: now - Duration::minutes(minutes_down),
            last_timeout: now,
            last_updated: now,
        }
    }

    #[tokio::test]
    async fn test_incident_opens_once_per_outage() {
        let dir = tempdir().unwrap();
        let store = Arc::new(MockStore::new());
        let escalator = IncidentEscalator::new(store.clone(), dir.path(), 60, "subreg_jawa");

        let entries = vec![failing_entry("10.0.0.1", 61)];
        let created = escalator.check_and_create(&entries).await;
        assert_eq!(created.len(), 1);
        assert_eq!(escalator.tracked().len(), 1);

        // Still failing on the next cycle: no second row
        let created = escalator.check_and_create(&entries).await;
        assert!(created.is_empty());
        assert_eq!(store.inserted.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_threshold_not_reached_no_incident() {
        let dir = tempdir().unwrap();
        let store = Arc::new(MockStore::new());
        let escalator = IncidentEscalator::new(store.clone(), dir.path(), 60, "subreg_jawa");

        let created = escalator
            .check_and_create(&[failing_entry("10.0.0.1", 59)])
            .await;
        assert!(created.is_empty());
        assert!(escalator.tracked().is_empty());
    }

    #[tokio::test]
    async fn test_recovery_allows_a_new_incident() {
        let dir = tempdir().unwrap();
        let store = Arc::new(MockStore::new());
        let escalator = IncidentEscalator::new(store.clone(), dir.path(), 60, "subreg_jawa");

        let entries = vec![failing_entry("10.0.0.1", 90)];
        escalator.check_and_create(&entries).await;
        escalator.cleanup_resolved(&["10.0.0.1".to_string()]);
        assert!(escalator.tracked().is_empty());

        let created = escalator.check_and_create(&entries).await;
        assert_eq!(created.len(), 1);
        assert_eq!(store.inserted.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_failed_insert_leaves_no_tracking() {
        let dir = tempdir().unwrap();
        let escalator =
            IncidentEscalator::new(Arc::new(MockStore::failing()), dir.path(), 60, "subreg_jawa");

        let created = escalator
            .check_and_create(&[failing_entry("10.0.0.1", 120)])
            .await;
        assert!(created.is_empty());
        assert!(escalator.tracked().is_empty());
    }

    #[tokio::test]
    async fn test_incident_description_and_fixed_fields() {
        let dir = tempdir().unwrap();
        let store = Arc::new(MockStore::new());
        let escalator = IncidentEscalator::new(store.clone(), dir.path(), 60, "subreg_jawa");

        escalator
            .check_and_create(&[failing_entry("10.0.0.1", 75)])
            .await;

        let inserted = store.inserted.lock();
        let incident = &inserted[0];
        assert_eq!(incident.status, "new");
        assert_eq!(incident.bagian_perusahaan, "subreg_jawa");
        assert_eq!(incident.lokasi, "cam-10.0.0.1");
        assert!(incident.deskripsi.contains("Hikvision Embedded"));
        assert!(incident.deskripsi.contains("- IP Address: 10.0.0.1"));
        assert!(incident.deskripsi.contains("First Alert:"));
    }
}
