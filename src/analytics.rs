//! Outage Time-Series
//!
//! One row per cycle: timestamp plus the number of devices currently in
//! timeout. Appended to a per-day file, read back for dashboard charts.

use crate::csvfile;
use crate::MonitorError;
use chrono::{Duration, Local, NaiveDate, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub const ANALYTICS_HEADERS: &[&str] = &["timestamp", "total_timeout_devices"];

const FILE_PREFIX: &str = "timeout_analytics_";

/// Upper bound on chart range queries
pub const MAX_RANGE_HOURS: i64 = 168;
/// Upper bound on multi-day queries
pub const MAX_RANGE_DAYS: u32 = 30;

/// One cycle's aggregate outage level
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsPoint {
    pub timestamp: NaiveDateTime,
    pub total_timeout_devices: usize,
}

/// One chart bucket
#[derive(Debug, Clone, Serialize)]
pub struct ChartPoint {
    pub timestamp: NaiveDateTime,
    pub time_label: String,
    pub timeout_count: f64,
}

/// One hourly bucket of the multi-day view
#[derive(Debug, Clone, Serialize)]
pub struct MultiDayPoint {
    pub timestamp: NaiveDateTime,
    pub date_label: String,
    pub time_label: String,
    pub timeout_count: f64,
}

/// Summary over a time range
#[derive(Debug, Clone, Serialize)]
pub struct AnalyticsSummary {
    pub total_records: usize,
    pub time_range_hours: i64,
    pub avg_timeout_devices: f64,
    pub peak_timeout_devices: usize,
    pub first_record: Option<NaiveDateTime>,
    pub last_record: Option<NaiveDateTime>,
}

/// Per-day outage analytics log
#[derive(Debug, Clone)]
pub struct TimeoutAnalytics {
    dir: PathBuf,
}

impl TimeoutAnalytics {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, date: NaiveDate) -> PathBuf {
        self.dir
            .join(format!("{FILE_PREFIX}{}.csv", date.format("%Y%m%d")))
    }

    /// Append one point to today's log
    pub fn record(&self, total_timeout_devices: usize) -> Result<(), MonitorError> {
        let point = AnalyticsPoint {
            timestamp: Local::now().naive_local(),
            total_timeout_devices,
        };
        let path = self.path_for(Local::now().date_naive());
        csvfile::append_row(&path, ANALYTICS_HEADERS, &point)?;
        tracing::debug!("Recorded timeout analytics: {total_timeout_devices} devices");
        Ok(())
    }

    fn read_day(&self, date: NaiveDate) -> Vec<AnalyticsPoint> {
        csvfile::read_rows(&self.path_for(date))
    }

    /// Points within the last `hours`, clamped to one week.
    ///
    /// The window is merged across today's and older per-day files; a
    /// range longer than a day would otherwise lose everything before
    /// midnight.
    pub fn points(&self, hours: i64) -> Vec<AnalyticsPoint> {
        let hours = hours.clamp(1, MAX_RANGE_HOURS);
        let cutoff = Local::now().naive_local() - Duration::hours(hours);
        let today = Local::now().date_naive();

        // A window of N hours can touch N/24 + 2 calendar dates: the
        // partial day at each end plus the full days between (an hour
        // window straddling midnight already spans two dates).
        let days_back = (hours / 24) as u64 + 2;

        let mut points = Vec::new();
        for offset in 0..days_back {
            if let Some(date) = today.checked_sub_days(chrono::Days::new(offset)) {
                points.extend(
                    self.read_day(date)
                        .into_iter()
                        .filter(|p| p.timestamp >= cutoff),
                );
            }
        }
        points.sort_by_key(|p| p.timestamp);
        points
    }

    /// Every point of the last `days` files, oldest first, clamped to 30 days
    pub fn multi_day(&self, days: u32) -> Vec<AnalyticsPoint> {
        let days = days.clamp(1, MAX_RANGE_DAYS);
        let today = Local::now().date_naive();

        let mut points = Vec::new();
        for offset in 0..days {
            if let Some(date) = today.checked_sub_days(chrono::Days::new(offset.into())) {
                points.extend(self.read_day(date));
            }
        }
        points.sort_by_key(|p| p.timestamp);
        points
    }

    /// Chart buckets over the last `hours`.
    ///
    /// `interval_minutes <= 0` returns the raw points; otherwise sequential
    /// points are grouped into interval-sized buckets carrying the average.
    pub fn chart(&self, hours: i64, interval_minutes: i64) -> Vec<ChartPoint> {
        let points = self.points(hours);
        if interval_minutes <= 0 {
            return points
                .into_iter()
                .map(|p| ChartPoint {
                    time_label: p.timestamp.format("%H:%M").to_string(),
                    timestamp: p.timestamp,
                    timeout_count: p.total_timeout_devices as f64,
                })
                .collect();
        }

        let mut buckets = Vec::new();
        let mut group: Vec<&AnalyticsPoint> = Vec::new();
        let mut group_start: Option<NaiveDateTime> = None;

        for point in &points {
            match group_start {
                Some(start)
                    if point.timestamp - start >= Duration::minutes(interval_minutes) =>
                {
                    buckets.push(bucket_of(start, &group));
                    group.clear();
                    group.push(point);
                    group_start = Some(point.timestamp);
                }
                Some(_) => group.push(point),
                None => {
                    group.push(point);
                    group_start = Some(point.timestamp);
                }
            }
        }
        if let (Some(start), false) = (group_start, group.is_empty()) {
            buckets.push(bucket_of(start, &group));
        }
        buckets
    }

    /// Hourly buckets over the last `days`
    pub fn multi_day_chart(&self, days: u32) -> Vec<MultiDayPoint> {
        let points = self.multi_day(days);

        let mut hours: std::collections::BTreeMap<NaiveDateTime, Vec<usize>> =
            std::collections::BTreeMap::new();
        for point in points {
            let hour = point
                .timestamp
                .date()
                .and_hms_opt(point.timestamp.time().hour(), 0, 0)
                .unwrap_or(point.timestamp);
            hours.entry(hour).or_default().push(point.total_timeout_devices);
        }

        hours
            .into_iter()
            .map(|(hour, counts)| MultiDayPoint {
                timestamp: hour,
                date_label: hour.format("%m/%d").to_string(),
                time_label: hour.format("%H:%M").to_string(),
                timeout_count: round1(average(&counts)),
            })
            .collect()
    }

    /// Summary statistics over the last `hours`
    pub fn summary(&self, hours: i64) -> AnalyticsSummary {
        let hours = hours.clamp(1, MAX_RANGE_HOURS);
        let points = self.points(hours);
        if points.is_empty() {
            return AnalyticsSummary {
                total_records: 0,
                time_range_hours: hours,
                avg_timeout_devices: 0.0,
                peak_timeout_devices: 0,
                first_record: None,
                last_record: None,
            };
        }

        let counts: Vec<usize> = points.iter().map(|p| p.total_timeout_devices).collect();
        AnalyticsSummary {
            total_records: points.len(),
            time_range_hours: hours,
            avg_timeout_devices: round1(average(&counts)),
            peak_timeout_devices: counts.iter().copied().max().unwrap_or(0),
            first_record: points.first().map(|p| p.timestamp),
            last_record: points.last().map(|p| p.timestamp),
        }
    }

    /// Delete per-day analytics files older than the retention window
    pub fn cleanup_old(&self, keep_days: u64) {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return;
        };
        let cutoff = std::time::SystemTime::now()
            - std::time::Duration::from_secs(keep_days * 24 * 60 * 60);

        for entry in entries.flatten() {
            let filename = entry.file_name().to_string_lossy().to_string();
            if !filename.starts_with(FILE_PREFIX) || !filename.ends_with(".csv") {
                continue;
            }
            let Ok(meta) = entry.metadata() else { continue };
            if meta.modified().map(|t| t < cutoff).unwrap_or(false)
                && std::fs::remove_file(entry.path()).is_ok()
            {
                tracing::info!("Deleted old analytics file: {filename}");
            }
        }
    }

    #[cfg(test)]
    fn write_day(&self, date: NaiveDate, points: &[AnalyticsPoint]) {
        csvfile::write_rows(&self.path_for(date), ANALYTICS_HEADERS, points).unwrap();
    }

    #[cfg(test)]
    fn today_path(&self) -> PathBuf {
        self.path_for(Local::now().date_naive())
    }
}

fn bucket_of(start: NaiveDateTime, group: &[&AnalyticsPoint]) -> ChartPoint {
    let counts: Vec<usize> = group.iter().map(|p| p.total_timeout_devices).collect();
    ChartPoint {
        timestamp: start,
        time_label: start.format("%H:%M").to_string(),
        timeout_count: round1(average(&counts)),
    }
}

fn average(counts: &[usize]) -> f64 {
    if counts.is_empty() {
        return 0.0;
    }
    counts.iter().sum::<usize>() as f64 / counts.len() as f64
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn minutes_ago(m: i64) -> NaiveDateTime {
        Local::now().naive_local() - Duration::minutes(m)
    }

    #[test]
    fn test_record_appends_to_today() {
        let dir = tempdir().unwrap();
        let analytics = TimeoutAnalytics::new(dir.path());

        analytics.record(3).unwrap();
        analytics.record(5).unwrap();

        let points = analytics.points(24);
        assert_eq!(points.len(), 2);
        assert_eq!(points[0].total_timeout_devices, 3);
        assert_eq!(points[1].total_timeout_devices, 5);

        let content = std::fs::read_to_string(analytics.today_path()).unwrap();
        assert!(content.starts_with("timestamp,total_timeout_devices"));
    }

    #[test]
    fn test_points_filters_by_window() {
        let dir = tempdir().unwrap();
        let analytics = TimeoutAnalytics::new(dir.path());
        analytics.write_day(
            Local::now().date_naive(),
            &[
                AnalyticsPoint { timestamp: minutes_ago(300), total_timeout_devices: 9 },
                AnalyticsPoint { timestamp: minutes_ago(10), total_timeout_devices: 2 },
            ],
        );

        let points = analytics.points(1);
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].total_timeout_devices, 2);
    }

    #[test]
    fn test_chart_raw_when_interval_zero() {
        let dir = tempdir().unwrap();
        let analytics = TimeoutAnalytics::new(dir.path());
        analytics.write_day(
            Local::now().date_naive(),
            &[
                AnalyticsPoint { timestamp: minutes_ago(8), total_timeout_devices: 1 },
                AnalyticsPoint { timestamp: minutes_ago(4), total_timeout_devices: 2 },
            ],
        );

        let chart = analytics.chart(24, 0);
        assert_eq!(chart.len(), 2);
        assert_eq!(chart[0].timeout_count, 1.0);
    }

    #[test]
    fn test_chart_buckets_average_by_interval() {
        let dir = tempdir().unwrap();
        let analytics = TimeoutAnalytics::new(dir.path());
        analytics.write_day(
            Local::now().date_naive(),
            &[
                AnalyticsPoint { timestamp: minutes_ago(40), total_timeout_devices: 2 },
                AnalyticsPoint { timestamp: minutes_ago(35), total_timeout_devices: 4 },
                AnalyticsPoint { timestamp: minutes_ago(10), total_timeout_devices: 8 },
            ],
        );

        let chart = analytics.chart(24, 15);
        assert_eq!(chart.len(), 2);
        assert_eq!(chart[0].timeout_count, 3.0);
        assert_eq!(chart[1].timeout_count, 8.0);
    }

    #[test]
    fn test_points_span_multiple_day_files() {
        let dir = tempdir().unwrap();
        let analytics = TimeoutAnalytics::new(dir.path());

        let older = Local::now().naive_local() - Duration::hours(30);
        analytics.write_day(
            older.date(),
            &[AnalyticsPoint { timestamp: older, total_timeout_devices: 4 }],
        );
        analytics.write_day(
            Local::now().date_naive(),
            &[AnalyticsPoint { timestamp: minutes_ago(10), total_timeout_devices: 2 }],
        );

        let summary = analytics.summary(48);
        assert_eq!(summary.total_records, 2);
        assert_eq!(summary.peak_timeout_devices, 4);

        let chart = analytics.chart(48, 0);
        assert_eq!(chart.len(), 2);
        assert_eq!(chart[0].timeout_count, 4.0);

        // A shorter window filters the older day's point out again
        assert_eq!(analytics.summary(24).total_records, 1);
    }

    #[test]
    fn test_hours_clamped_to_one_week() {
        let dir = tempdir().unwrap();
        let analytics = TimeoutAnalytics::new(dir.path());
        let summary = analytics.summary(10_000);
        assert_eq!(summary.time_range_hours, MAX_RANGE_HOURS);
    }

    #[test]
    fn test_multi_day_merges_files_in_order() {
        let dir = tempdir().unwrap();
        let analytics = TimeoutAnalytics::new(dir.path());
        let today = Local::now().date_naive();
        let yesterday = today.pred_opt().unwrap();

        analytics.write_day(
            yesterday,
            &[AnalyticsPoint {
                timestamp: yesterday.and_hms_opt(8, 0, 0).unwrap(),
                total_timeout_devices: 7,
            }],
        );
        analytics.write_day(
            today,
            &[AnalyticsPoint {
                timestamp: today.and_hms_opt(9, 0, 0).unwrap(),
                total_timeout_devices: 1,
            }],
        );

        let points = analytics.multi_day(7);
        assert_eq!(points.len(), 2);
        assert!(points[0].timestamp < points[1].timestamp);

        let chart = analytics.multi_day_chart(7);
        assert_eq!(chart.len(), 2);
        assert_eq!(chart[0].timeout_count, 7.0);
        assert_eq!(chart[0].time_label, "08:00");
    }

    #[test]
    fn test_summary_statistics() {
        let dir = tempdir().unwrap();
        let analytics = TimeoutAnalytics::new(dir.path());
        analytics.write_day(
            Local::now().date_naive(),
            &[
                AnalyticsPoint { timestamp: minutes_ago(30), total_timeout_devices: 2 },
                AnalyticsPoint { timestamp: minutes_ago(20), total_timeout_devices: 6 },
                AnalyticsPoint { timestamp: minutes_ago(10), total_timeout_devices: 1 },
            ],
        );

        let summary = analytics.summary(24);
        assert_eq!(summary.total_records, 3);
        assert_eq!(summary.avg_timeout_devices, 3.0);
        assert_eq!(summary.peak_timeout_devices, 6);
        assert!(summary.first_record.unwrap() < summary.last_record.unwrap());
    }
}
