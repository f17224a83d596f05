//! ICMP Probe Execution
//!
//! Primary path is an ICMP echo over an unprivileged datagram socket. On
//! Linux the userspace socket can report unreachable for hosts a raw
//! `ping` reaches, so a failed probe is re-verified through the system
//! `ping` utility before it counts as a timeout. Both paths record which
//! mechanism produced the result.

use crate::device::Device;
use chrono::{Local, NaiveDateTime};
use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, Socket, Type};
use std::mem::MaybeUninit;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

const ECHO_PAYLOAD: &[u8] = b"fleetwatch.echo.0123456789abcdef";

/// Which mechanism produced a probe outcome
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeMethod {
    /// Unprivileged ICMP datagram socket
    #[default]
    IcmpSocket,
    /// System `ping` utility
    SystemPing,
}

impl std::fmt::Display for ProbeMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::IcmpSocket => write!(f, "icmp_socket"),
            Self::SystemPing => write!(f, "system_ping"),
        }
    }
}

/// Raw outcome of a single echo attempt
#[derive(Debug, Clone, PartialEq)]
pub struct PingOutcome {
    pub success: bool,
    pub rtt_ms: Option<f64>,
    pub error: Option<String>,
    pub method: ProbeMethod,
}

impl PingOutcome {
    fn reply(rtt_ms: f64, method: ProbeMethod) -> Self {
        Self {
            success: true,
            rtt_ms: Some(rtt_ms),
            error: None,
            method,
        }
    }

    fn failed(error: impl Into<String>, method: ProbeMethod) -> Self {
        Self {
            success: false,
            rtt_ms: None,
            error: Some(error.into()),
            method,
        }
    }
}

/// One probe result; also the snapshot row format.
///
/// Field order matches the snapshot CSV header. `response_time_ms` and
/// `latency_ms` carry the same value, both columns are kept for consumers
/// reading the files directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeResult {
    pub timestamp: NaiveDateTime,
    pub device_id: i64,
    pub ip_address: String,
    pub hostname: String,
    pub ping_success: bool,
    pub response_time_ms: Option<f64>,
    pub latency_ms: Option<f64>,
    pub error_message: Option<String>,
    pub merk: Option<String>,
    pub os: Option<String>,
    pub kondisi: String,
    pub id_lokasi: i64,
    #[serde(skip)]
    pub method: ProbeMethod,
}

impl ProbeResult {
    /// Combine a device with its echo outcome
    pub fn from_outcome(device: &Device, outcome: PingOutcome) -> Self {
        Self {
            timestamp: Local::now().naive_local(),
            device_id: device.id,
            ip_address: device.ip.clone(),
            hostname: device.display_hostname().to_string(),
            ping_success: outcome.success,
            response_time_ms: outcome.rtt_ms,
            latency_ms: outcome.rtt_ms,
            error_message: outcome.error,
            merk: device.merk.clone(),
            os: device.os.clone(),
            kondisi: device.kondisi.clone(),
            id_lokasi: device.id_lokasi,
            method: outcome.method,
        }
    }
}

/// Aggregate statistics over one probe batch
#[derive(Debug, Clone, Serialize)]
pub struct BatchStats {
    pub total_devices: usize,
    pub successful_pings: usize,
    pub failed_pings: usize,
    pub success_rate: f64,
    pub average_response_time_ms: Option<f64>,
    pub min_response_time_ms: Option<f64>,
    pub max_response_time_ms: Option<f64>,
}

/// Probe executor configuration surface for the status API
#[derive(Debug, Clone, Serialize)]
pub struct ExecutorStatus {
    pub max_workers: usize,
    pub ping_timeout_seconds: u64,
    pub ping_library: &'static str,
    pub system_ping_fallback: bool,
    pub concurrent_execution: bool,
}

/// Concurrent probe executor
#[derive(Debug, Clone)]
pub struct ProbeRunner {
    timeout: Duration,
    max_workers: usize,
    fallback_enabled: bool,
}

impl ProbeRunner {
    /// Build a runner with the given per-probe deadline and in-flight cap
    pub fn new(timeout_secs: u64, max_workers: usize) -> Self {
        let fallback_enabled = cfg!(target_os = "linux");
        if fallback_enabled {
            tracing::info!("System ping fallback enabled for this platform");
        }
        Self {
            timeout: Duration::from_secs(timeout_secs),
            max_workers,
            fallback_enabled,
        }
    }

    /// Probe one address with fallback verification
    pub async fn ping_address(&self, address: &str) -> PingOutcome {
        let primary = match address.parse::<Ipv4Addr>() {
            Ok(target) => {
                let deadline = self.timeout;
                match tokio::task::spawn_blocking(move || icmp_echo(target, deadline)).await {
                    Ok(outcome) => outcome,
                    Err(e) => PingOutcome::failed(
                        format!("probe task failed: {e}"),
                        ProbeMethod::IcmpSocket,
                    ),
                }
            }
            Err(_) => PingOutcome::failed(
                format!("not an IPv4 address: {address}"),
                ProbeMethod::IcmpSocket,
            ),
        };

        if primary.success || !self.fallback_enabled {
            return primary;
        }

        // A socket-level failure may be a false negative; the system ping
        // utility is the arbiter before the address counts as down.
        let verified = system_ping(address, self.timeout).await;
        if verified.success {
            tracing::warn!(
                "False positive detected for {}: ICMP socket said '{}' but system ping answered in {:?} ms",
                address,
                primary.error.as_deref().unwrap_or("unknown"),
                verified.rtt_ms
            );
            return verified;
        }
        primary
    }

    /// Probe one device
    pub async fn probe_device(&self, device: &Device) -> ProbeResult {
        let outcome = self.ping_address(&device.ip).await;
        ProbeResult::from_outcome(device, outcome)
    }

    /// Probe one raw address as a synthetic device
    pub async fn probe_single(&self, address: &str) -> ProbeResult {
        let device = Device::synthetic(address);
        self.probe_device(&device).await
    }

    /// Fan a device batch into concurrent probes, capped at `max_workers`
    /// in flight. Result order is not guaranteed. Individual failures
    /// never fail the batch.
    pub async fn probe_batch(&self, devices: &[Device]) -> Vec<ProbeResult> {
        if devices.is_empty() {
            tracing::warn!("No devices to ping");
            return Vec::new();
        }

        let started = Instant::now();
        tracing::info!(
            "Starting concurrent ping for {} devices with {} workers",
            devices.len(),
            self.max_workers
        );

        let semaphore = Arc::new(Semaphore::new(self.max_workers));
        let mut tasks = JoinSet::new();
        for device in devices.iter().cloned() {
            let runner = self.clone();
            let semaphore = semaphore.clone();
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                runner.probe_device(&device).await
            });
        }

        let mut results = Vec::with_capacity(devices.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(e) => tracing::error!("Probe task aborted: {e}"),
            }
        }

        tracing::info!(
            "Completed concurrent ping in {:.2}s for {} devices",
            started.elapsed().as_secs_f64(),
            results.len()
        );
        results
    }

    /// Executor configuration for the status API
    pub fn status(&self) -> ExecutorStatus {
        ExecutorStatus {
            max_workers: self.max_workers,
            ping_timeout_seconds: self.timeout.as_secs(),
            ping_library: "icmp-dgram",
            system_ping_fallback: self.fallback_enabled,
            concurrent_execution: true,
        }
    }
}

/// Cycle statistics over a result batch
pub fn batch_statistics(results: &[ProbeResult]) -> BatchStats {
    let total = results.len();
    let successful = results.iter().filter(|r| r.ping_success).count();
    let rtts: Vec<f64> = results
        .iter()
        .filter(|r| r.ping_success)
        .filter_map(|r| r.response_time_ms)
        .collect();

    let success_rate = if total > 0 {
        round2(successful as f64 / total as f64 * 100.0)
    } else {
        0.0
    };

    BatchStats {
        total_devices: total,
        successful_pings: successful,
        failed_pings: total - successful,
        success_rate,
        average_response_time_ms: if rtts.is_empty() {
            None
        } else {
            Some(round2(rtts.iter().sum::<f64>() / rtts.len() as f64))
        },
        min_response_time_ms: rtts.iter().cloned().reduce(f64::min).map(round2),
        max_response_time_ms: rtts.iter().cloned().reduce(f64::max).map(round2),
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Internet checksum over an ICMP message
fn checksum(data: &[u8]) -> u16 {
    let mut sum = 0u32;
    let mut words = data.chunks_exact(2);
    for word in &mut words {
        sum += u32::from(u16::from_be_bytes([word[0], word[1]]));
    }
    if let [last] = words.remainder() {
        sum += u32::from(*last) << 8;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

fn build_echo_request(ident: u16, seq: u16) -> Vec<u8> {
    let mut packet = vec![8u8, 0, 0, 0];
    packet.extend_from_slice(&ident.to_be_bytes());
    packet.extend_from_slice(&seq.to_be_bytes());
    packet.extend_from_slice(ECHO_PAYLOAD);
    let sum = checksum(&packet);
    packet[2..4].copy_from_slice(&sum.to_be_bytes());
    packet
}

enum ReplyKind {
    EchoReply,
    Unreachable,
    Other,
}

fn parse_reply(data: &[u8], seq: u16) -> ReplyKind {
    // Raw sockets deliver the IPv4 header, datagram sockets do not.
    let icmp = if data.len() >= 20 && data[0] >> 4 == 4 {
        let header_len = usize::from(data[0] & 0x0f) * 4;
        if header_len >= data.len() {
            return ReplyKind::Other;
        }
        &data[header_len..]
    } else {
        data
    };

    if icmp.len() < 8 {
        return ReplyKind::Other;
    }
    match icmp[0] {
        0 => {
            let reply_seq = u16::from_be_bytes([icmp[6], icmp[7]]);
            if reply_seq == seq {
                ReplyKind::EchoReply
            } else {
                ReplyKind::Other
            }
        }
        3 => ReplyKind::Unreachable,
        _ => ReplyKind::Other,
    }
}

fn classify_send_error(e: &std::io::Error) -> String {
    match e.raw_os_error() {
        Some(101) | Some(113) => "Destination host unreachable".to_string(),
        _ => format!("ICMP send error: {e}"),
    }
}

/// One blocking echo against `target`, bounded by `deadline`
fn icmp_echo(target: Ipv4Addr, deadline: Duration) -> PingOutcome {
    let socket = match Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::ICMPV4)) {
        Ok(s) => s,
        Err(e) => {
            return PingOutcome::failed(
                format!("ICMP socket unavailable: {e}"),
                ProbeMethod::IcmpSocket,
            )
        }
    };

    let seq = 1u16;
    let packet = build_echo_request(std::process::id() as u16, seq);
    let dest = SocketAddr::new(IpAddr::V4(target), 0);
    let started = Instant::now();

    if let Err(e) = socket.send_to(&packet, &dest.into()) {
        return PingOutcome::failed(classify_send_error(&e), ProbeMethod::IcmpSocket);
    }

    let mut buf = [MaybeUninit::<u8>::uninit(); 512];
    loop {
        let remaining = match deadline.checked_sub(started.elapsed()) {
            Some(r) if !r.is_zero() => r,
            _ => return PingOutcome::failed("No response (timeout)", ProbeMethod::IcmpSocket),
        };
        if let Err(e) = socket.set_read_timeout(Some(remaining)) {
            return PingOutcome::failed(
                format!("ICMP socket error: {e}"),
                ProbeMethod::IcmpSocket,
            );
        }

        match socket.recv_from(&mut buf) {
            Ok((len, _)) => {
                // recv_from initialised the first `len` bytes
                let data =
                    unsafe { std::slice::from_raw_parts(buf.as_ptr() as *const u8, len) };
                match parse_reply(data, seq) {
                    ReplyKind::EchoReply => {
                        let rtt = round2(started.elapsed().as_secs_f64() * 1000.0);
                        return PingOutcome::reply(rtt, ProbeMethod::IcmpSocket);
                    }
                    ReplyKind::Unreachable => {
                        return PingOutcome::failed(
                            "Destination host unreachable",
                            ProbeMethod::IcmpSocket,
                        )
                    }
                    ReplyKind::Other => continue,
                }
            }
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                return PingOutcome::failed("No response (timeout)", ProbeMethod::IcmpSocket)
            }
            Err(e) => {
                return PingOutcome::failed(
                    format!("ICMP receive error: {e}"),
                    ProbeMethod::IcmpSocket,
                )
            }
        }
    }
}

/// Verify an address through the system `ping` utility
async fn system_ping(address: &str, deadline: Duration) -> PingOutcome {
    let wait_secs = deadline.as_secs().max(1);
    let started = Instant::now();

    let command = tokio::process::Command::new("ping")
        .arg("-c")
        .arg("1")
        .arg("-W")
        .arg(wait_secs.to_string())
        .arg(address)
        .output();

    let output = match tokio::time::timeout(deadline + Duration::from_secs(1), command).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            return PingOutcome::failed(format!("system ping error: {e}"), ProbeMethod::SystemPing)
        }
        Err(_) => return PingOutcome::failed("system ping timeout", ProbeMethod::SystemPing),
    };

    if output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let rtt = parse_ping_time(&stdout)
            .unwrap_or_else(|| round2(started.elapsed().as_secs_f64() * 1000.0));
        PingOutcome::reply(rtt, ProbeMethod::SystemPing)
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let detail = stderr.trim();
        let detail = if detail.is_empty() { "no response" } else { detail };
        PingOutcome::failed(
            format!("system ping failed: {detail}"),
            ProbeMethod::SystemPing,
        )
    }
}

/// Extract `time=<ms>` from ping output
fn parse_ping_time(output: &str) -> Option<f64> {
    for line in output.lines() {
        if let Some(idx) = line.find("time=") {
            if let Some(token) = line[idx + 5..].split_whitespace().next() {
                if let Ok(value) = token.trim_end_matches("ms").parse::<f64>() {
                    return Some(round2(value));
                }
            }
        }
    }
    None
}
