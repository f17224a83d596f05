//! Monitoring Read API
//!
//! JSON surface over the on-disk state: snapshot, failure ledger and
//! analytics, plus control verbs for the background service. Handlers
//! never probe except for the explicit single-address test endpoint.

use crate::orchestrator::MonitorService;
use crate::probe::batch_statistics;
use crate::MonitorError;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

const MAX_LATEST_LIMIT: usize = 1000;

/// Build the monitoring router
pub fn router(service: Arc<MonitorService>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ping/latest", get(latest))
        .route("/ping/device/:device_id", get(device_results))
        .route("/ping/statistics", get(statistics))
        .route("/ping/status", get(status_summary))
        .route("/ping/summary/offline", get(offline_summary))
        .route("/ping/test/:address", post(test_address))
        .route("/ping/service/status", get(service_status))
        .route("/ping/service/start", post(service_start))
        .route("/ping/service/stop", post(service_stop))
        .route("/ping/csv/files", get(csv_files))
        .route("/ping/csv/rebuild", post(csv_rebuild))
        .route("/ping/database/monitoring", get(database_monitoring))
        .route("/ping/database/reload", post(database_reload))
        .route("/ping/timeout/summary", get(timeout_summary))
        .route("/ping/timeout/devices", get(timeout_devices))
        .route("/ping/timeout/critical", get(timeout_critical))
        .route("/ping/timeout/report", get(timeout_report))
        .route("/ping/timeout/reset", post(timeout_reset))
        .route("/ping/timeout/incidents", get(incident_summary))
        .route("/ping/timeout/analytics/chart", get(analytics_chart))
        .route("/ping/timeout/analytics/multi-day", get(analytics_multi_day))
        .route("/ping/timeout/analytics/summary", get(analytics_summary))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(service)
}

fn ok(data: Value) -> Response {
    (StatusCode::OK, Json(data)).into_response()
}

fn fail(status: StatusCode, error: impl std::fmt::Display) -> Response {
    (
        status,
        Json(json!({ "success": false, "error": error.to_string() })),
    )
        .into_response()
}

fn require_tracking(service: &MonitorService) -> Result<(), Response> {
    if service.config().tracking_enabled {
        Ok(())
    } else {
        Err(fail(
            StatusCode::SERVICE_UNAVAILABLE,
            "Timeout tracking is disabled",
        ))
    }
}

async fn health() -> Response {
    ok(json!({
        "success": true,
        "status": "healthy",
        "service": "ping-monitoring-api",
    }))
}

#[derive(Deserialize)]
struct LatestParams {
    limit: Option<usize>,
}

async fn latest(
    State(service): State<Arc<MonitorService>>,
    Query(params): Query<LatestParams>,
) -> Response {
    let limit = params.limit.unwrap_or(100).min(MAX_LATEST_LIMIT);
    let rows = service.snapshot().read_all(Some(limit));
    ok(json!({ "success": true, "data": rows, "count": rows.len() }))
}

async fn device_results(
    State(service): State<Arc<MonitorService>>,
    Path(device_id): Path<i64>,
) -> Response {
    let rows: Vec<_> = service
        .snapshot()
        .read_all(None)
        .into_iter()
        .filter(|r| r.device_id == device_id)
        .collect();
    ok(json!({
        "success": true,
        "device_id": device_id,
        "data": rows,
        "count": rows.len(),
    }))
}

#[derive(Deserialize)]
struct StatisticsParams {
    device_id: Option<i64>,
}

async fn statistics(
    State(service): State<Arc<MonitorService>>,
    Query(params): Query<StatisticsParams>,
) -> Response {
    let mut rows = service.snapshot().read_all(None);
    if let Some(device_id) = params.device_id {
        rows.retain(|r| r.device_id == device_id);
    }
    ok(json!({
        "success": true,
        "device_id": params.device_id,
        "statistics": batch_statistics(&rows),
    }))
}

async fn status_summary(State(service): State<Arc<MonitorService>>) -> Response {
    let rows = service.snapshot().read_all(None);
    let online = rows.iter().filter(|r| r.ping_success).count();
    ok(json!({
        "success": true,
        "data": {
            "status_breakdown": {
                "online": online,
                "offline": rows.len() - online,
                "total": rows.len(),
            },
            "last_updated": rows.first().map(|r| r.timestamp),
            "devices": rows,
        },
    }))
}

async fn offline_summary(State(service): State<Arc<MonitorService>>) -> Response {
    let rows = service.snapshot().read_all(None);
    let offline: Vec<_> = rows.iter().filter(|r| !r.ping_success).cloned().collect();
    ok(json!({
        "success": true,
        "data": {
            "total_devices": rows.len(),
            "online_devices": rows.len() - offline.len(),
            "offline_devices": offline.len(),
            "offline_device_list": offline,
        },
    }))
}

async fn test_address(
    State(service): State<Arc<MonitorService>>,
    Path(address): Path<String>,
) -> Response {
    let result = service.probe_single(&address).await;
    ok(json!({
        "success": true,
        "ip_address": address,
        "ping_result": {
            "success": result.ping_success,
            "response_time_ms": result.response_time_ms,
            "error_message": result.error_message,
        },
    }))
}

async fn service_status(State(service): State<Arc<MonitorService>>) -> Response {
    ok(json!({ "success": true, "data": service.status() }))
}

async fn service_start(State(service): State<Arc<MonitorService>>) -> Response {
    let started = service.start();
    ok(json!({
        "success": true,
        "message": if started {
            "Monitoring service started"
        } else {
            "Monitoring service is already running"
        },
    }))
}

async fn service_stop(State(service): State<Arc<MonitorService>>) -> Response {
    let stopped = service.stop();
    ok(json!({
        "success": true,
        "message": if stopped {
            "Monitoring service stopping at next cycle boundary"
        } else {
            "Monitoring service is not running"
        },
    }))
}

async fn csv_files(State(service): State<Arc<MonitorService>>) -> Response {
    let files = service.snapshot().list_files();
    ok(json!({ "success": true, "data": files, "count": files.len() }))
}

async fn csv_rebuild(State(service): State<Arc<MonitorService>>) -> Response {
    match service.run_cycle().await {
        Ok(report) => ok(json!({
            "success": true,
            "message": "Snapshot rebuilt from one forced cycle",
            "data": report,
        })),
        Err(MonitorError::CycleInProgress) => fail(
            StatusCode::CONFLICT,
            "Ping cycle already in progress, please wait and try again",
        ),
        Err(e) => fail(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

async fn database_monitoring(State(service): State<Arc<MonitorService>>) -> Response {
    ok(json!({ "success": true, "data": service.inventory().status() }))
}

async fn database_reload(State(service): State<Arc<MonitorService>>) -> Response {
    let report = service.inventory().force_reload().await;
    ok(json!({ "success": report.success, "data": report }))
}

async fn timeout_summary(State(service): State<Arc<MonitorService>>) -> Response {
    if let Err(resp) = require_tracking(&service) {
        return resp;
    }
    ok(json!({ "success": true, "data": service.tracker().summary() }))
}

#[derive(Deserialize)]
struct TimeoutDevicesParams {
    min_consecutive: Option<u32>,
}

async fn timeout_devices(
    State(service): State<Arc<MonitorService>>,
    Query(params): Query<TimeoutDevicesParams>,
) -> Response {
    if let Err(resp) = require_tracking(&service) {
        return resp;
    }
    let min_consecutive = params.min_consecutive.unwrap_or(1);
    let devices = service.tracker().devices(min_consecutive);
    ok(json!({
        "success": true,
        "data": devices,
        "count": devices.len(),
        "min_consecutive_filter": min_consecutive,
    }))
}

#[derive(Deserialize)]
struct CriticalParams {
    threshold: Option<u32>,
}

async fn timeout_critical(
    State(service): State<Arc<MonitorService>>,
    Query(params): Query<CriticalParams>,
) -> Response {
    if let Err(resp) = require_tracking(&service) {
        return resp;
    }
    let threshold = params.threshold.unwrap_or(service.config().critical_threshold);
    let devices = service.tracker().critical(threshold);
    ok(json!({
        "success": true,
        "data": devices,
        "count": devices.len(),
        "threshold": threshold,
    }))
}

async fn timeout_report(State(service): State<Arc<MonitorService>>) -> Response {
    if let Err(resp) = require_tracking(&service) {
        return resp;
    }
    let report = service.tracker().report(service.config().critical_threshold);
    ok(json!({ "success": true, "data": report }))
}

async fn timeout_reset(State(service): State<Arc<MonitorService>>) -> Response {
    if let Err(resp) = require_tracking(&service) {
        return resp;
    }
    match service.tracker().reset() {
        Ok(()) => ok(json!({
            "success": true,
            "message": "Timeout tracking reset successfully",
        })),
        Err(e) => fail(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

async fn incident_summary(State(service): State<Arc<MonitorService>>) -> Response {
    if let Err(resp) = require_tracking(&service) {
        return resp;
    }
    ok(json!({ "success": true, "data": service.escalator().summary() }))
}

#[derive(Deserialize)]
struct ChartParams {
    hours: Option<i64>,
    interval: Option<i64>,
}

async fn analytics_chart(
    State(service): State<Arc<MonitorService>>,
    Query(params): Query<ChartParams>,
) -> Response {
    if let Err(resp) = require_tracking(&service) {
        return resp;
    }
    let hours = params.hours.unwrap_or(24);
    let interval = params.interval.unwrap_or(15);
    let chart = service.analytics().chart(hours, interval);
    let summary = service.analytics().summary(hours);
    ok(json!({
        "success": true,
        "data": {
            "chart_data": chart,
            "summary": summary,
            "config": {
                "hours": summary.time_range_hours,
                "interval_minutes": interval,
                "total_data_points": chart.len(),
            },
        },
    }))
}

#[derive(Deserialize)]
struct MultiDayParams {
    days: Option<u32>,
}

async fn analytics_multi_day(
    State(service): State<Arc<MonitorService>>,
    Query(params): Query<MultiDayParams>,
) -> Response {
    if let Err(resp) = require_tracking(&service) {
        return resp;
    }
    let days = params.days.unwrap_or(7).min(crate::analytics::MAX_RANGE_DAYS);
    let chart = service.analytics().multi_day_chart(days);
    let records = service.analytics().multi_day(days);
    ok(json!({
        "success": true,
        "data": {
            "chart_data": chart,
            "summary": {
                "total_records": records.len(),
                "days": days,
                "hourly_points": chart.len(),
                "first_record": records.first().map(|p| p.timestamp),
                "last_record": records.last().map(|p| p.timestamp),
            },
        },
    }))
}

#[derive(Deserialize)]
struct SummaryParams {
    hours: Option<i64>,
}

async fn analytics_summary(
    State(service): State<Arc<MonitorService>>,
    Query(params): Query<SummaryParams>,
) -> Response {
    if let Err(resp) = require_tracking(&service) {
        return resp;
    }
    let summary = service.analytics().summary(params.hours.unwrap_or(24));
    ok(json!({ "success": true, "data": summary }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MonitorConfig;
    use crate::device::Device;
    use crate::probe::{PingOutcome, ProbeMethod, ProbeResult};
    use axum_test::TestServer;
    use sqlx::mysql::MySqlPoolOptions;
    use std::collections::HashSet;
    use tempfile::tempdir;

    fn service_with(config: MonitorConfig) -> Arc<MonitorService> {
        let pool = MySqlPoolOptions::new()
            .connect_lazy("mysql://monitor@127.0.0.1:3306/test")
            .expect("lazy pool");
        Arc::new(MonitorService::new(config, pool).expect("service"))
    }

    fn server(dir: &std::path::Path) -> (TestServer, Arc<MonitorService>) {
        let config = MonitorConfig {
            output_dir: dir.to_string_lossy().into_owned(),
            ..Default::default()
        };
        let service = service_with(config);
        (
            TestServer::new(router(service.clone())).expect("server"),
            service,
        )
    }

    fn seed_snapshot(service: &MonitorService) {
        let up = Device {
            id: 1,
            ip: "10.0.0.1".into(),
            hostname: Some("cam-01".into()),
            merk: None,
            os: None,
            kondisi: "baik".into(),
            id_lokasi: 1,
            jenis_barang_id: 1,
        };
        let down = Device {
            id: 2,
            ip: "10.0.0.2".into(),
            hostname: Some("cam-02".into()),
            merk: None,
            os: None,
            kondisi: "baik".into(),
            id_lokasi: 1,
            jenis_barang_id: 1,
        };
        let results = vec![
            ProbeResult::from_outcome(
                &up,
                PingOutcome {
                    success: true,
                    rtt_ms: Some(4.0),
                    error: None,
                    method: ProbeMethod::IcmpSocket,
                },
            ),
            ProbeResult::from_outcome(
                &down,
                PingOutcome {
                    success: false,
                    rtt_ms: None,
                    error: Some("No response (timeout)".into()),
                    method: ProbeMethod::IcmpSocket,
                },
            ),
        ];
        let active: HashSet<String> =
            ["10.0.0.1".to_string(), "10.0.0.2".to_string()].into();
        service.snapshot().publish(&results, &active).unwrap();
    }

    #[tokio::test]
    async fn test_health() {
        let dir = tempdir().unwrap();
        let (server, _) = server(dir.path());

        let response = server.get("/health").await;
        response.assert_status_ok();
        let body: Value = response.json();
        assert_eq!(body["success"], true);
        assert_eq!(body["status"], "healthy");
    }

    #[tokio::test]
    async fn test_latest_returns_snapshot_rows() {
        let dir = tempdir().unwrap();
        let (server, service) = server(dir.path());
        seed_snapshot(&service);

        let response = server.get("/ping/latest").await;
        response.assert_status_ok();
        let body: Value = response.json();
        assert_eq!(body["count"], 2);

        let limited = server.get("/ping/latest?limit=1").await;
        let body: Value = limited.json();
        assert_eq!(body["count"], 1);
    }

    #[tokio::test]
    async fn test_device_filter_and_statistics() {
        let dir = tempdir().unwrap();
        let (server, service) = server(dir.path());
        seed_snapshot(&service);

        let response = server.get("/ping/device/2").await;
        let body: Value = response.json();
        assert_eq!(body["count"], 1);
        assert_eq!(body["data"][0]["ip_address"], "10.0.0.2");

        let response = server.get("/ping/statistics").await;
        let body: Value = response.json();
        assert_eq!(body["statistics"]["total_devices"], 2);
        assert_eq!(body["statistics"]["successful_pings"], 1);
        assert_eq!(body["statistics"]["success_rate"], 50.0);
    }

    #[tokio::test]
    async fn test_offline_summary() {
        let dir = tempdir().unwrap();
        let (server, service) = server(dir.path());
        seed_snapshot(&service);

        let response = server.get("/ping/summary/offline").await;
        let body: Value = response.json();
        assert_eq!(body["data"]["offline_devices"], 1);
        assert_eq!(body["data"]["offline_device_list"][0]["hostname"], "cam-02");
    }

    #[tokio::test]
    async fn test_timeout_endpoints_503_when_disabled() {
        let dir = tempdir().unwrap();
        let config = MonitorConfig {
            output_dir: dir.path().to_string_lossy().into_owned(),
            tracking_enabled: false,
            ..Default::default()
        };
        let service = service_with(config);
        let server = TestServer::new(router(service)).unwrap();

        let response = server.get("/ping/timeout/summary").await;
        response.assert_status(StatusCode::SERVICE_UNAVAILABLE);
        let body: Value = response.json();
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn test_timeout_summary_and_reset() {
        let dir = tempdir().unwrap();
        let (server, _) = server(dir.path());

        let response = server.get("/ping/timeout/summary").await;
        response.assert_status_ok();
        let body: Value = response.json();
        assert_eq!(body["data"]["total_timeout_devices"], 0);

        let response = server.post("/ping/timeout/reset").await;
        response.assert_status_ok();
    }

    #[tokio::test]
    async fn test_analytics_chart_empty() {
        let dir = tempdir().unwrap();
        let (server, _) = server(dir.path());

        let response = server.get("/ping/timeout/analytics/chart?hours=500").await;
        response.assert_status_ok();
        let body: Value = response.json();
        assert_eq!(body["data"]["chart_data"].as_array().unwrap().len(), 0);
        // Out-of-range hours are clamped to one week
        assert_eq!(body["data"]["config"]["hours"], 168);
    }

    #[tokio::test]
    async fn test_service_status_and_files() {
        let dir = tempdir().unwrap();
        let (server, service) = server(dir.path());
        seed_snapshot(&service);

        let response = server.get("/ping/service/status").await;
        let body: Value = response.json();
        assert_eq!(body["data"]["service_running"], false);
        assert_eq!(body["data"]["active_devices_count"], 0);

        let response = server.get("/ping/csv/files").await;
        let body: Value = response.json();
        assert_eq!(body["count"], 1);
        assert_eq!(body["data"][0]["device_count"], 2);
    }

    #[tokio::test]
    async fn test_rebuild_with_empty_inventory() {
        let dir = tempdir().unwrap();
        let (server, _) = server(dir.path());

        let response = server.post("/ping/csv/rebuild").await;
        response.assert_status_ok();
        let body: Value = response.json();
        assert_eq!(body["success"], true);
        assert_eq!(body["data"]["device_count"], 0);
    }

    #[tokio::test]
    async fn debug_chart_route() {
        let dir = tempdir().unwrap();
        let (server, service) = server(dir.path());
        let response = server.get("/ping/timeout/analytics/chart?hours=500").await;
        eprintln!("STATUS = {:?}", response.status_code());
        eprintln!("BODY = {:?}", response.text());

        let response1b = server.get("/ping/timeout/analytics/chart").await;
        eprintln!("STATUS1b = {:?}", response1b.status_code());

        let response1c = server.get("/ping/timeout/analytics/summary").await;
        eprintln!("STATUS1c = {:?}", response1c.status_code());

        let response1d = server.get("/ping/timeout/analytics/multi-day").await;
        eprintln!("STATUS1d = {:?}", response1d.status_code());

        let response1e = server.get("/ping/timeout/analytics/chart?hours=24").await;
        eprintln!("STATUS1e(hours=24) = {:?}", response1e.status_code());

        let response1f = server.get("/ping/timeout/analytics/chart?interval=15").await;
        eprintln!("STATUS1f(interval=15) = {:?}", response1f.status_code());

        let response1g = server.get("/ping/timeout/analytics/chart?hours=1").await;
        eprintln!("STATUS1g(hours=1) = {:?}", response1g.status_code());

        seed_snapshot(&service);
        let response2 = server.get("/ping/latest").await;
        eprintln!("STATUS2 = {:?}", response2.status_code());
        eprintln!("BODY2 = {:?}", response2.text());

        let response3 = server.get("/ping/latest?limit=1").await;
        eprintln!("STATUS3(limit=1) = {:?}", response3.status_code());
        eprintln!("BODY3 = {:?}", response3.text());
    }
}
