//! Group Notification Transport
//!
//! Delivers formatted messages to a WhatsApp group through the Watzap HTTP
//! API. One attempt per edge per cycle; the tracker re-evaluates on the
//! next cycle, so there is no in-cycle retry.

use crate::config::NotifyConfig;
use crate::tracker::FailureEntry;
use crate::MonitorError;
use chrono::{Datelike, Local, NaiveDateTime};
use serde::Serialize;
use std::time::Duration;

const SEND_TIMEOUT: Duration = Duration::from_secs(30);

/// Format a timestamp the Indonesian way: `21 Oktober 2025 10:30:00`
pub fn format_indonesian_date(dt: NaiveDateTime) -> String {
    const MONTHS: [&str; 12] = [
        "Januari",
        "Februari",
        "Maret",
        "April",
        "Mei",
        "Juni",
        "Juli",
        "Agustus",
        "September",
        "Oktober",
        "November",
        "Desember",
    ];
    format!(
        "{} {} {} {}",
        dt.day(),
        MONTHS[dt.month0() as usize],
        dt.year(),
        dt.format("%H:%M:%S")
    )
}

/// Batch outage alert enumerating the affected devices
pub fn batch_alert_message(devices: &[FailureEntry]) -> String {
    let mut message = format!(
        "🚨 PERINGATAN TIMEOUT {} PERANGKAT 🚨\n\n📋 Daftar Perangkat Bermasalah:\n",
        devices.len()
    );
    for (idx, device) in devices.iter().enumerate() {
        message.push_str(&format!(
            "\n{}. {}\n   • IP: {}\n",
            idx + 1,
            device.hostname,
            device.ip_address
        ));
    }
    message.push_str(&format!(
        "\n🔧 Tindakan yang Harus Dilakukan:\n\
         1. Periksa status semua perangkat di atas\n\
         2. Verifikasi koneksi jaringan dan daya\n\
         3. Lakukan pemeriksaan fisik jika diperlukan\n\
         4. Hubungi tim teknis untuk penanganan lebih lanjut\n\n\
         Waktu Notifikasi: {} WIB\n\n\
         Pesan ini dikirim otomatis oleh FleetWatch.",
        format_indonesian_date(Local::now().naive_local())
    ));
    message
}

/// Recovery notice for a previously alerted device
pub fn recovery_message(entry: &FailureEntry) -> String {
    format!(
        "✅ PERANGKAT PULIH KEMBALI ✅\n\n\
         📋 Informasi Perangkat:\n\
         • Hostname: {}\n\
         • IP Address: {}\n\n\
         📊 Status:\n\
         • Jumlah Timeout: {}x berturut-turut\n\
         • Pertama Timeout: {}\n\n\
         Waktu Notifikasi: {} WIB\n\n\
         Pesan ini dikirim otomatis oleh FleetWatch.",
        entry.hostname,
        entry.ip_address,
        entry.consecutive_timeouts,
        format_indonesian_date(entry.first_timeout),
        format_indonesian_date(Local::now().naive_local())
    )
}

/// Interpret a transport response.
///
/// The API reports failure in-band: `status` `"1001"`/`"1003"` or
/// `ack == "fatal_error"` mean the message did not go out even on a 2xx.
fn interpret_response(http_status: u16, body: &serde_json::Value) -> Result<(), String> {
    let api_status = body.get("status").and_then(|v| v.as_str());
    let ack = body.get("ack").and_then(|v| v.as_str());
    if matches!(api_status, Some("1001") | Some("1003")) || ack == Some("fatal_error") {
        let detail = body
            .get("message")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown API error");
        return Err(format!("API error: {detail}"));
    }
    if !(200..300).contains(&http_status) {
        return Err(format!("HTTP {http_status}"));
    }
    Ok(())
}

/// Broadcast outcome across several groups
#[derive(Debug, Clone, Serialize)]
pub struct BroadcastReport {
    pub total: usize,
    pub success_count: usize,
    pub failed_count: usize,
    pub failures: Vec<BroadcastFailure>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BroadcastFailure {
    pub group_id: String,
    pub error: String,
}

/// Transport configuration surface for the status API
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStatus {
    pub configured: bool,
    pub message: String,
    pub base_url: String,
    pub default_group: String,
}

/// Watzap group-message client
pub struct NotifyClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    number_key: String,
    default_group_id: String,
}

impl NotifyClient {
    pub fn new(config: &NotifyConfig) -> Result<Self, MonitorError> {
        if config.api_key.is_empty() {
            tracing::warn!("NOTIFY_API_KEY not set, notifications will fail");
        }
        if config.number_key.is_empty() {
            tracing::warn!("NOTIFY_NUMBER_KEY not set, notifications will fail");
        }

        let http = reqwest::Client::builder()
            .timeout(SEND_TIMEOUT)
            .build()
            .map_err(|e| MonitorError::Config(format!("HTTP client: {e}")))?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            number_key: config.number_key.clone(),
            default_group_id: config.group_id.clone(),
        })
    }

    /// Send one message to one group
    pub async fn send_to_group(&self, group_id: &str, message: &str) -> Result<(), MonitorError> {
        let endpoint = format!("{}/send_message_group", self.base_url);
        let payload = serde_json::json!({
            "api_key": self.api_key,
            "number_key": self.number_key,
            "group_id": group_id,
            "message": message,
        });

        tracing::info!(
            "Sending group message to {group_id} ({} chars)",
            message.len()
        );

        let response = self
            .http
            .post(&endpoint)
            .json(&payload)
            .send()
            .await
            .map_err(|e| MonitorError::Notify(format!("request failed: {e}")))?;

        let http_status = response.status().as_u16();
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| MonitorError::Notify(format!("invalid response body: {e}")))?;

        interpret_response(http_status, &body).map_err(MonitorError::Notify)
    }

    /// Send one message to the configured default group
    pub async fn send_default_group(&self, message: &str) -> Result<(), MonitorError> {
        if self.default_group_id.is_empty() {
            return Err(MonitorError::Notify("no default group configured".into()));
        }
        self.send_to_group(&self.default_group_id, message).await
    }

    /// Send one message to several groups, collecting per-group outcomes
    pub async fn broadcast(&self, group_ids: &[String], message: &str) -> BroadcastReport {
        let mut success_count = 0;
        let mut failures = Vec::new();
        for group_id in group_ids {
            match self.send_to_group(group_id, message).await {
                Ok(()) => success_count += 1,
                Err(e) => failures.push(BroadcastFailure {
                    group_id: group_id.clone(),
                    error: e.to_string(),
                }),
            }
        }
        tracing::info!(
            "Broadcast done: {success_count} ok, {} failed",
            failures.len()
        );
        BroadcastReport {
            total: group_ids.len(),
            success_count,
            failed_count: failures.len(),
            failures,
        }
    }

    /// Configuration sanity check for the status surface
    pub fn connection_status(&self) -> ConnectionStatus {
        let configured = self.api_key.len() >= 10 && !self.number_key.is_empty();
        ConnectionStatus {
            configured,
            message: if configured {
                "API key configured".into()
            } else {
                "API key missing or malformed".into()
            },
            base_url: self.base_url.clone(),
            default_group: self.default_group_id.clone(),
        }
    }
}
