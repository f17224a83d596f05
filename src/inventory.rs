//! Inventory Change Monitoring
//!
//! The authoritative device set lives in the inventory database. The
//! monitor caches the active-and-pingable selection and re-checks a
//! content signature on a cadence; probing never waits on the database
//! inside a cycle.

use crate::device::{fleet_signature, Device, CONDITION_LOST};
use crate::MonitorError;
use chrono::{Local, NaiveDateTime};
use parking_lot::RwLock;
use serde::Serialize;
use sqlx::MySqlPool;
use std::time::{Duration, Instant};

const DEVICE_QUERY: &str = "SELECT i.id, i.ip, i.hostname, i.merk, i.os, i.kondisi, \
     i.id_lokasi, i.jenis_barang_id \
     FROM inventaris i \
     INNER JOIN jenis_barangs j ON i.jenis_barang_id = j.id \
     WHERE i.kondisi != ? AND i.ip IS NOT NULL AND i.ip != '' AND j.ping = 1 \
     ORDER BY i.id";

/// Reconciler status for the API
#[derive(Debug, Clone, Serialize)]
pub struct InventoryStatus {
    pub monitoring_enabled: bool,
    pub check_interval_seconds: u64,
    pub last_check_timestamp: Option<NaiveDateTime>,
    pub change_detection_count: u64,
    pub cached_device_count: usize,
    pub current_signature: String,
}

/// Outcome of a forced reload
#[derive(Debug, Clone, Serialize)]
pub struct ReloadReport {
    pub success: bool,
    pub old_device_count: usize,
    pub new_device_count: usize,
    pub devices_added: usize,
    pub devices_removed: usize,
    pub reload_timestamp: NaiveDateTime,
    pub error: Option<String>,
}

#[derive(Default)]
struct CacheState {
    devices: Vec<Device>,
    signature: String,
    last_check: Option<Instant>,
    last_check_at: Option<NaiveDateTime>,
    change_count: u64,
}

/// Cached view of the active-and-pingable device set
pub struct InventoryMonitor {
    pool: MySqlPool,
    check_interval: Duration,
    state: RwLock<CacheState>,
}

impl InventoryMonitor {
    pub fn new(pool: MySqlPool, check_interval_secs: u64) -> Self {
        Self {
            pool,
            check_interval: Duration::from_secs(check_interval_secs),
            state: RwLock::new(CacheState::default()),
        }
    }

    async fn fetch(&self) -> Result<Vec<Device>, MonitorError> {
        let devices = sqlx::query_as::<_, Device>(DEVICE_QUERY)
            .bind(CONDITION_LOST)
            .fetch_all(&self.pool)
            .await?;
        Ok(devices)
    }

    /// Populate the cache at startup. A down database is tolerated; the
    /// next change check retries.
    pub async fn initialize(&self) {
        match self.fetch().await {
            Ok(devices) => {
                let signature = fleet_signature(&devices);
                let mut state = self.state.write();
                tracing::info!("Inventory cache initialised with {} devices", devices.len());
                state.devices = devices;
                state.signature = signature;
            }
            Err(e) => tracing::warn!("Inventory cache not initialised: {e}"),
        }
    }

    /// Check whether the device set changed since the last check.
    ///
    /// Honours the configured cadence: calls inside the window return
    /// false without touching the database.
    pub async fn check_changes(&self) -> bool {
        {
            let state = self.state.read();
            if let Some(last) = state.last_check {
                if last.elapsed() < self.check_interval {
                    return false;
                }
            }
        }

        let devices = match self.fetch().await {
            Ok(devices) => devices,
            Err(e) => {
                tracing::error!("Inventory change check failed: {e}");
                let mut state = self.state.write();
                state.last_check = Some(Instant::now());
                state.last_check_at = Some(Local::now().naive_local());
                return false;
            }
        };
        let signature = fleet_signature(&devices);

        let mut state = self.state.write();
        state.last_check = Some(Instant::now());
        state.last_check_at = Some(Local::now().naive_local());

        if signature != state.signature {
            tracing::info!(
                "Inventory changes detected (signature {}... -> {}...)",
                &state.signature.chars().take(16).collect::<String>(),
                &signature.chars().take(16).collect::<String>()
            );
            state.signature = signature;
            state.change_count += 1;
            true
        } else {
            false
        }
    }

    /// Re-read the device set into the cache, returning the new count
    pub async fn reload(&self) -> Result<usize, MonitorError> {
        let devices = self.fetch().await?;
        let new_count = devices.len();

        let mut state = self.state.write();
        let old_count = state.devices.len();
        state.devices = devices;
        tracing::info!("Device list reloaded: {old_count} -> {new_count} devices");
        Ok(new_count)
    }

    /// Cached device set
    pub fn current_devices(&self) -> Vec<Device> {
        self.state.read().devices.clone()
    }

    /// Cached device count
    pub fn device_count(&self) -> usize {
        self.state.read().devices.len()
    }

    /// Reload regardless of cadence and refresh the signature
    pub async fn force_reload(&self) -> ReloadReport {
        let old_count = self.device_count();
        let now = Local::now().naive_local();

        match self.fetch().await {
            Ok(devices) => {
                let new_count = devices.len();
                let signature = fleet_signature(&devices);
                let mut state = self.state.write();
                state.devices = devices;
                state.signature = signature;
                state.change_count += 1;
                ReloadReport {
                    success: true,
                    old_device_count: old_count,
                    new_device_count: new_count,
                    devices_added: new_count.saturating_sub(old_count),
                    devices_removed: old_count.saturating_sub(new_count),
                    reload_timestamp: now,
                    error: None,
                }
            }
            Err(e) => ReloadReport {
                success: false,
                old_device_count: old_count,
                new_device_count: old_count,
                devices_added: 0,
                devices_removed: 0,
                reload_timestamp: now,
                error: Some(e.to_string()),
            },
        }
    }

    /// Monitoring status for the API
    pub fn status(&self) -> InventoryStatus {
        let state = self.state.read();
        let signature = if state.signature.is_empty() {
            "Not set".to_string()
        } else {
            format!("{}...", &state.signature.chars().take(16).collect::<String>())
        };
        InventoryStatus {
            monitoring_enabled: true,
            check_interval_seconds: self.check_interval.as_secs(),
            last_check_timestamp: state.last_check_at,
            change_detection_count: state.change_count,
            cached_device_count: state.devices.len(),
            current_signature: signature,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::mysql::MySqlPoolOptions;

    fn lazy_pool() -> MySqlPool {
        MySqlPoolOptions::new()
            .connect_lazy("mysql://monitor@127.0.0.1:3306/test")
            .expect("lazy pool")
    }

    #[tokio::test]
    async fn test_initial_status_is_empty() {
        let monitor = InventoryMonitor::new(lazy_pool(), 30);
        let status = monitor.status();
        assert!(status.monitoring_enabled);
        assert_eq!(status.check_interval_seconds, 30);
        assert_eq!(status.cached_device_count, 0);
        assert_eq!(status.change_detection_count, 0);
        assert_eq!(status.current_signature, "Not set");
        assert!(monitor.current_devices().is_empty());
    }
}
