//! FleetWatch - Device Fleet Ping Monitor
//!
//! Continuously probes an inventory of networked devices (cameras, servers,
//! network gear) by ICMP echo, keeps a per-day snapshot of their latest
//! state on disk, tracks consecutive failures per address, raises group
//! notifications and incident tickets for sustained outages, and records a
//! time-series of the aggregate outage level.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                        MONITOR SERVICE                           │
//! │                                                                  │
//! │  inventory ──▶ probe batch ──▶ snapshot ──▶ failure tracker      │
//! │   (MySQL)      (ICMP echo)     (per-day       │                  │
//! │                                 CSV)          ├─▶ notifications  │
//! │                                               ├─▶ incidents      │
//! │                                               └─▶ analytics      │
//! └──────────────────────────────────────────────────────────────────┘
//!                 HTTP read API (axum) reads only the on-disk state
//! ```

pub mod analytics;
pub mod api;
pub mod config;
pub mod csvfile;
pub mod device;
pub mod incident;
pub mod inventory;
pub mod notify;
pub mod orchestrator;
pub mod probe;
pub mod snapshot;
pub mod tracker;

use thiserror::Error;

pub use config::MonitorConfig;
pub use device::Device;
pub use orchestrator::MonitorService;
pub use probe::{ProbeResult, ProbeRunner};

/// Monitor error types
#[derive(Debug, Error)]
pub enum MonitorError {
    /// Invalid configuration, refuses startup
    #[error("configuration error: {0}")]
    Config(String),

    /// Inventory or incident store failure
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Filesystem failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// CSV encode/decode failure
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// Atomic file publication failure
    #[error("persist error: {0}")]
    Persist(String),

    /// Notification transport failure
    #[error("notification delivery failed: {0}")]
    Notify(String),

    /// A monitoring cycle or rebuild is already running
    #[error("a monitoring cycle is already in progress")]
    CycleInProgress,
}
