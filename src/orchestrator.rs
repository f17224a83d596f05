//! Monitoring Cycle Orchestration
//!
//! One background worker drives the closed loop: reconcile the device set,
//! fan out probes, publish the snapshot, update failure tracking, escalate
//! incidents, record analytics, then sleep out the remainder of the
//! period. A single-flight flag keeps API-triggered rebuilds and the
//! background loop from overlapping.

use crate::analytics::TimeoutAnalytics;
use crate::config::MonitorConfig;
use crate::incident::{IncidentEscalator, MySqlIncidentStore};
use crate::inventory::{InventoryMonitor, InventoryStatus};
use crate::notify::{batch_alert_message, recovery_message, ConnectionStatus, NotifyClient};
use crate::probe::{batch_statistics, ExecutorStatus, ProbeResult, ProbeRunner};
use crate::snapshot::{SnapshotFileStats, SnapshotStore};
use crate::tracker::FailureTracker;
use crate::MonitorError;
use chrono::{Local, NaiveDateTime};
use parking_lot::RwLock;
use serde::Serialize;
use sqlx::MySqlPool;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Outcome of one monitoring cycle
#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleReport {
    pub device_count: usize,
    pub result_count: usize,
    pub timeout_devices: usize,
    pub incidents_created: usize,
    pub duration_ms: u64,
}

/// Live service status for the API
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub service_type: &'static str,
    pub service_running: bool,
    pub ping_interval_seconds: u64,
    pub csv_output_directory: String,
    pub active_devices_count: usize,
    pub tracking_enabled: bool,
    pub alert_threshold: u32,
    pub cycles_completed: u64,
    pub last_cycle_at: Option<NaiveDateTime>,
    pub last_cycle_duration_ms: u64,
    pub ping_executor: ExecutorStatus,
    pub database_monitoring: InventoryStatus,
    pub snapshot_files: SnapshotFileStats,
    pub notifications: ConnectionStatus,
}

// Clears the single-flight flag even when a cycle step bails early.
struct CycleGuard<'a>(&'a AtomicBool);

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Service container binding every monitoring component
pub struct MonitorService {
    config: MonitorConfig,
    inventory: Arc<InventoryMonitor>,
    prober: ProbeRunner,
    snapshot: Arc<SnapshotStore>,
    tracker: Arc<FailureTracker>,
    analytics: Arc<TimeoutAnalytics>,
    escalator: Arc<IncidentEscalator>,
    notifier: Arc<NotifyClient>,
    running: AtomicBool,
    cycle_in_progress: AtomicBool,
    cycles_completed: AtomicU64,
    last_cycle: RwLock<Option<(NaiveDateTime, u64)>>,
}

impl MonitorService {
    /// Wire every component against one database pool and one output
    /// directory
    pub fn new(config: MonitorConfig, pool: MySqlPool) -> Result<Self, MonitorError> {
        config.validate()?;

        let inventory = Arc::new(InventoryMonitor::new(
            pool.clone(),
            config.device_check_interval_secs,
        ));
        let prober = ProbeRunner::new(config.ping_timeout_secs, config.max_ping_workers);
        let snapshot = Arc::new(SnapshotStore::new(&config.output_dir));
        let tracker = Arc::new(FailureTracker::new(&config.output_dir, config.alert_threshold));
        let analytics = Arc::new(TimeoutAnalytics::new(&config.output_dir));
        let escalator = Arc::new(IncidentEscalator::new(
            Arc::new(MySqlIncidentStore::new(pool)),
            &config.output_dir,
            config.incident_threshold_minutes,
            config.incident_company_section.clone(),
        ));
        let notifier = Arc::new(NotifyClient::new(&config.notify)?);

        tracing::info!(
            "Monitor service initialised: {}s interval, {} workers, {}s probe timeout",
            config.ping_interval_secs,
            config.max_ping_workers,
            config.ping_timeout_secs
        );

        Ok(Self {
            config,
            inventory,
            prober,
            snapshot,
            tracker,
            analytics,
            escalator,
            notifier,
            running: AtomicBool::new(false),
            cycle_in_progress: AtomicBool::new(false),
            cycles_completed: AtomicU64::new(0),
            last_cycle: RwLock::new(None),
        })
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    pub fn inventory(&self) -> &InventoryMonitor {
        &self.inventory
    }

    pub fn snapshot(&self) -> &SnapshotStore {
        &self.snapshot
    }

    pub fn tracker(&self) -> &FailureTracker {
        &self.tracker
    }

    pub fn analytics(&self) -> &TimeoutAnalytics {
        &self.analytics
    }

    pub fn escalator(&self) -> &IncidentEscalator {
        &self.escalator
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Probe one raw address outside the cycle
    pub async fn probe_single(&self, address: &str) -> ProbeResult {
        self.prober.probe_single(address).await
    }

    /// Start the background loop. Returns false when already running.
    pub fn start(self: &Arc<Self>) -> bool {
        if self.running.swap(true, Ordering::SeqCst) {
            tracing::warn!("Monitoring service is already running");
            return false;
        }
        let service = Arc::clone(self);
        tokio::spawn(async move {
            service.monitoring_loop().await;
        });
        tracing::info!("Monitoring service started");
        true
    }

    /// Signal the loop to stop at the next cycle boundary. The in-flight
    /// cycle is never interrupted.
    pub fn stop(&self) -> bool {
        if !self.running.swap(false, Ordering::SeqCst) {
            tracing::warn!("Monitoring service is not running");
            return false;
        }
        self.snapshot.cleanup_old(self.config.retention_days);
        self.analytics.cleanup_old(self.config.retention_days);
        tracing::info!("Monitoring service stopping at next cycle boundary");
        true
    }

    async fn monitoring_loop(self: Arc<Self>) {
        self.inventory.initialize().await;
        let interval = Duration::from_secs(self.config.ping_interval_secs);
        tracing::info!(
            "Monitoring loop running with {}s interval",
            interval.as_secs()
        );

        while self.running.load(Ordering::SeqCst) {
            let started = Instant::now();

            if self.inventory.check_changes().await {
                tracing::info!("Inventory changed, reloading device list");
                if let Err(e) = self.inventory.reload().await {
                    tracing::error!("Device reload failed: {e}");
                }
            }

            match self.run_cycle().await {
                Ok(report) => tracing::debug!(
                    "Cycle done: {} devices, {} timing out, {}ms",
                    report.result_count,
                    report.timeout_devices,
                    report.duration_ms
                ),
                Err(MonitorError::CycleInProgress) => {
                    tracing::warn!("Cycle skipped, a rebuild is in progress")
                }
                Err(e) => tracing::error!("Cycle failed: {e}"),
            }

            let elapsed = started.elapsed();
            if elapsed < interval {
                tokio::time::sleep(interval - elapsed).await;
            } else {
                tracing::warn!(
                    "Cycle took {:.2}s, longer than the {}s interval",
                    elapsed.as_secs_f64(),
                    interval.as_secs()
                );
            }
        }
        tracing::info!("Monitoring loop stopped");
    }

    /// One full cycle: probe, publish, track, escalate, record.
    ///
    /// Fails fast with [`MonitorError::CycleInProgress`] when another cycle
    /// or rebuild currently holds the single-flight flag.
    pub async fn run_cycle(&self) -> Result<CycleReport, MonitorError> {
        if self
            .cycle_in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(MonitorError::CycleInProgress);
        }
        let _guard = CycleGuard(&self.cycle_in_progress);
        let started = Instant::now();

        let devices = self.inventory.current_devices();
        if devices.is_empty() {
            tracing::warn!("No active devices found, skipping cycle");
            return Ok(CycleReport::default());
        }

        let results = self.prober.probe_batch(&devices).await;
        if results.is_empty() {
            tracing::error!("No ping results obtained");
            return Ok(CycleReport {
                device_count: devices.len(),
                ..Default::default()
            });
        }

        let stats = batch_statistics(&results);
        tracing::info!(
            "Ping cycle completed - Success: {}/{} ({}%), avg response: {:?}ms",
            stats.successful_pings,
            stats.total_devices,
            stats.success_rate,
            stats.average_response_time_ms
        );

        let active_ips: HashSet<String> = devices.iter().map(|d| d.ip.clone()).collect();
        self.snapshot.publish(&results, &active_ips)?;

        let mut timeout_devices = 0;
        let mut incidents_created = 0;
        if self.config.tracking_enabled {
            let events = self.tracker.update(&results)?;
            timeout_devices = events.entries.len();

            if !events.alerts.is_empty() && self.config.alerts_enabled {
                let message = batch_alert_message(&events.alerts);
                match self.notifier.send_default_group(&message).await {
                    Ok(()) => {
                        tracing::warn!(
                            "Batch timeout alert sent for {} device(s)",
                            events.alerts.len()
                        );
                        self.tracker.mark_alerted(&events.alerts)?;
                    }
                    Err(e) => tracing::error!(
                        "Alert delivery failed, edge preserved for next cycle: {e}"
                    ),
                }
            }

            if self.config.alerts_enabled {
                for entry in &events.recoveries {
                    if let Err(e) = self
                        .notifier
                        .send_default_group(&recovery_message(entry))
                        .await
                    {
                        tracing::error!(
                            "Recovery notice for {} failed: {e}",
                            entry.ip_address
                        );
                    }
                }
            }

            if self.config.incident_enabled {
                incidents_created = self.escalator.check_and_create(&events.entries).await.len();
                self.escalator.cleanup_resolved(&events.recovered_ips);
            }

            self.analytics.record(timeout_devices)?;
        }

        let duration_ms = started.elapsed().as_millis() as u64;
        self.cycles_completed.fetch_add(1, Ordering::SeqCst);
        *self.last_cycle.write() = Some((Local::now().naive_local(), duration_ms));

        Ok(CycleReport {
            device_count: devices.len(),
            result_count: results.len(),
            timeout_devices,
            incidents_created,
            duration_ms,
        })
    }

    /// Live status assembled across every component
    pub fn status(&self) -> ServiceStatus {
        let last_cycle = *self.last_cycle.read();
        ServiceStatus {
            service_type: "FleetWatch Monitor",
            service_running: self.is_running(),
            ping_interval_seconds: self.config.ping_interval_secs,
            csv_output_directory: self.config.output_dir.clone(),
            active_devices_count: self.inventory.device_count(),
            tracking_enabled: self.config.tracking_enabled,
            alert_threshold: self.config.alert_threshold,
            cycles_completed: self.cycles_completed.load(Ordering::SeqCst),
            last_cycle_at: last_cycle.map(|(at, _)| at),
            last_cycle_duration_ms: last_cycle.map(|(_, ms)| ms).unwrap_or(0),
            ping_executor: self.prober.status(),
            database_monitoring: self.inventory.status(),
            snapshot_files: self.snapshot.file_stats(),
            notifications: self.notifier.connection_status(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::mysql::MySqlPoolOptions;
    use tempfile::tempdir;

    fn service(dir: &std::path::Path) -> Arc<MonitorService> {
        let pool = MySqlPoolOptions::new()
            .connect_lazy("mysql://monitor@127.0.0.1:3306/test")
            .expect("lazy pool");
        let config = MonitorConfig {
            output_dir: dir.to_string_lossy().into_owned(),
            ..Default::default()
        };
        Arc::new(MonitorService::new(config, pool).expect("service"))
    }

    #[tokio::test]
    async fn test_empty_inventory_cycle_is_a_noop() {
        let dir = tempdir().unwrap();
        let service = service(dir.path());

        let report = service.run_cycle().await.unwrap();
        assert_eq!(report.device_count, 0);
        assert_eq!(report.result_count, 0);
        assert!(service.tracker().entries().is_empty());
    }

    #[tokio::test]
    async fn test_single_flight_rejects_concurrent_rebuild() {
        let dir = tempdir().unwrap();
        let service = service(dir.path());

        service.cycle_in_progress.store(true, Ordering::SeqCst);
        let err = service.run_cycle().await.unwrap_err();
        assert!(matches!(err, MonitorError::CycleInProgress));
        service.cycle_in_progress.store(false, Ordering::SeqCst);

        assert!(service.run_cycle().await.is_ok());
    }

    #[tokio::test]
    async fn test_start_stop_flags() {
        let dir = tempdir().unwrap();
        let service = service(dir.path());

        assert!(!service.is_running());
        assert!(service.start());
        assert!(service.is_running());
        assert!(!service.start());

        assert!(service.stop());
        assert!(!service.is_running());
        assert!(!service.stop());
    }

    #[tokio::test]
    async fn test_status_reflects_configuration() {
        let dir = tempdir().unwrap();
        let service = service(dir.path());

        let status = service.status();
        assert_eq!(status.ping_interval_seconds, 5);
        assert_eq!(status.alert_threshold, 20);
        assert_eq!(status.cycles_completed, 0);
        assert!(status.last_cycle_at.is_none());
        assert_eq!(status.ping_executor.max_workers, 20);
    }
}
