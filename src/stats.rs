//! Read-side aggregates over the stored telemetry.
//!
//! Stats are best-effort dashboard data: a failing aggregate is logged and
//! replaced with its zero value so one broken query never takes down the
//! whole summary response.

use crate::{
    error::Error,
    evaluator::{BROKEN_STATUS_THRESHOLD, SLOW_LATENCY_THRESHOLD_MS},
    store::{EndpointLatency, ErrorRateBucket, LogQuery, LogStore, RateEventStore},
};
use chrono::{Duration, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::error;

/// Number of top slow endpoints returned by the summary query.
const TOP_SLOW_LIMIT: usize = 10;

/// Headline counters for the dashboard.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSummary {
    /// Total telemetry records stored.
    pub total_logs: u64,
    /// Records with latency strictly above the slow threshold.
    pub slow_request_count: u64,
    /// Records with a 5xx status.
    pub error_request_count: u64,
    /// Recorded rate-limit breaches.
    pub rate_limit_violation_count: u64,
    /// Average latency over all records, in milliseconds.
    pub average_latency_ms: f64,
}

/// Computes dashboard aggregates from the log and rate-event stores.
#[derive(Clone)]
pub struct StatsService {
    logs: Arc<dyn LogStore>,
    rate_events: Arc<dyn RateEventStore>,
}

impl StatsService {
    pub fn new(logs: Arc<dyn LogStore>, rate_events: Arc<dyn RateEventStore>) -> Self {
        Self { logs, rate_events }
    }

    /// The headline counters. Each counter degrades to zero independently if
    /// its query fails.
    pub async fn summary(&self) -> StatsSummary {
        let total_logs = self
            .count(&LogQuery::default(), "total log count")
            .await;
        let slow_request_count = self
            .count(
                &LogQuery {
                    latency_above_ms: Some(SLOW_LATENCY_THRESHOLD_MS),
                    ..Default::default()
                },
                "slow request count",
            )
            .await;
        let error_request_count = self
            .count(
                &LogQuery {
                    status_at_least: Some(BROKEN_STATUS_THRESHOLD),
                    ..Default::default()
                },
                "error request count",
            )
            .await;

        let rate_limit_violation_count = match self.rate_events.count().await {
            Ok(n) => n,
            Err(err) => {
                error!("Could not compute rate violation count: {err}");
                0
            }
        };

        let average_latency_ms = match self.logs.average_latency().await {
            Ok(avg) => avg,
            Err(err) => {
                error!("Could not compute average latency: {err}");
                0.0
            }
        };

        StatsSummary {
            total_logs,
            slow_request_count,
            error_request_count,
            rate_limit_violation_count,
            average_latency_ms,
        }
    }

    /// The slowest endpoints among those with at least one slow request,
    /// ordered by average latency.
    pub async fn top_slow_endpoints(&self) -> Result<Vec<EndpointLatency>, Error> {
        self.logs
            .top_slow_endpoints(SLOW_LATENCY_THRESHOLD_MS, TOP_SLOW_LIMIT)
            .await
            .map_err(Error::from)
    }

    /// Hourly error-rate buckets for the trailing `hours` hours.
    pub async fn error_rate_series(&self, hours: u32) -> Result<Vec<ErrorRateBucket>, Error> {
        let end = Utc::now();
        let start = end - Duration::hours(i64::from(hours));
        self.logs
            .hourly_error_rates(start, end)
            .await
            .map_err(Error::from)
    }

    async fn count(&self, query: &LogQuery, what: &str) -> u64 {
        match self.logs.count(query).await {
            Ok(n) => n,
            Err(err) => {
                error!("Could not compute {what}: {err}");
                0
            }
        }
    }
}
