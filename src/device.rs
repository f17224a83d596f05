//! Device Inventory Model

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Condition tag marking a device as gone from the fleet
pub const CONDITION_LOST: &str = "hilang";

/// One inventory device eligible for probing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Device {
    /// Inventory id
    pub id: i64,
    /// Probe target address
    pub ip: String,
    /// Hostname, falls back to the address when absent
    pub hostname: Option<String>,
    /// Vendor label
    pub merk: Option<String>,
    /// Operating system label
    pub os: Option<String>,
    /// Condition tag
    pub kondisi: String,
    /// Location id
    pub id_lokasi: i64,
    /// Device type id
    pub jenis_barang_id: i64,
}

impl Device {
    /// Hostname for display, address when none is recorded
    pub fn display_hostname(&self) -> &str {
        match self.hostname.as_deref() {
            Some(h) if !h.is_empty() => h,
            _ => &self.ip,
        }
    }

    /// Synthetic device used by the single-address test probe
    pub fn synthetic(address: &str) -> Self {
        Self {
            id: 0,
            ip: address.to_string(),
            hostname: Some(format!("test-{address}")),
            merk: Some("Test".into()),
            os: None,
            kondisi: "baik".into(),
            id_lokasi: 0,
            jenis_barang_id: 0,
        }
    }
}

/// Content signature over the fields that influence probing.
///
/// Two fleets with the same signature probe identically; a changed
/// address, hostname or condition changes the signature. Devices must be
/// ordered by id before hashing.
pub fn fleet_signature(devices: &[Device]) -> String {
    let joined = devices
        .iter()
        .map(|d| {
            format!(
                "{}:{}:{}:{}",
                d.id,
                d.ip,
                d.hostname.as_deref().unwrap_or(""),
                d.kondisi
            )
        })
        .collect::<Vec<_>>()
        .join("|");

    let mut hasher = Sha256::new();
    hasher.update(joined.as_bytes());
    hex::encode(hasher.finalize())
}
