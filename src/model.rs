//! Data model for telemetry records, alerts, and tracked issues.
//!
//! `ApiLogRecord`, `RateEvent` and `Alert` are immutable facts. `Issue` is
//! the one mutable aggregate: the deduplicated record of an ongoing anomaly
//! for a (service, endpoint, type) key, carrying a version counter for
//! optimistic concurrency.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Endpoint sentinel for alerts and issues not tied to a specific endpoint
/// (rate-limit breaches apply to the whole service).
pub const NO_ENDPOINT: &str = "N/A";

/// A completed-request telemetry record reported by a client service.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiLogRecord {
    /// Name of the reporting service.
    pub service_name: String,
    /// HTTP method of the instrumented request.
    pub method: String,
    /// Request path, e.g. `/checkout`.
    pub endpoint: String,
    /// When the request completed.
    pub timestamp: DateTime<Utc>,
    /// Observed latency in milliseconds.
    #[serde(alias = "latency")]
    pub latency_ms: u64,
    /// HTTP status code returned to the client.
    pub status_code: u16,
    /// Request body size in bytes.
    #[serde(default, alias = "requestSize")]
    pub request_bytes: u64,
    /// Response body size in bytes.
    #[serde(default, alias = "responseSize")]
    pub response_bytes: u64,
}

/// A log record after the log store assigned it an id.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedApiLogRecord {
    /// Store-assigned identifier.
    pub id: String,
    /// The immutable record as ingested.
    #[serde(flatten)]
    pub record: ApiLogRecord,
}

/// A record that the observed per-second request rate exceeded the
/// configured limit. Created only when `current_rate > limit`.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateEvent {
    /// Name of the service whose rate was exceeded.
    pub service_name: String,
    /// When the breach was observed.
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    /// Requests observed in the triggering 1-second window.
    pub current_rate: u32,
    /// The configured per-second limit.
    pub limit: u32,
}

/// The kind of anomaly a rule detected.
///
/// Serves as both the alert type and the issue type; the two always travel
/// together.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AnomalyType {
    /// Latency exceeded the slow-API threshold.
    SlowApi,
    /// The request returned a 5xx status.
    BrokenApi,
    /// The per-second request rate exceeded the configured limit.
    RateLimit,
}

impl AnomalyType {
    /// Parse from the wire representation (case-insensitive).
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "SLOW_API" => Some(Self::SlowApi),
            "BROKEN_API" => Some(Self::BrokenApi),
            "RATE_LIMIT" => Some(Self::RateLimit),
            _ => None,
        }
    }

    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::SlowApi => "SLOW_API",
            Self::BrokenApi => "BROKEN_API",
            Self::RateLimit => "RATE_LIMIT",
        }
    }
}

impl fmt::Display for AnomalyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An immutable, non-deduplicated notification emitted each time an anomaly
/// rule fires. Alerts are a log, not a ledger.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    /// Name of the affected service.
    pub service_name: String,
    /// Affected endpoint, or [`NO_ENDPOINT`] for rate events.
    pub endpoint: String,
    /// Which rule fired.
    pub alert_type: AnomalyType,
    /// Human-readable explanation including the observed value.
    pub reason: String,
    /// When the rule fired.
    pub timestamp: DateTime<Utc>,
}

/// Lifecycle state of an issue. OPEN issues are unique per key; RESOLVED
/// issues are historical.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IssueStatus {
    Open,
    Resolved,
}

impl IssueStatus {
    /// Parse from the wire representation (case-insensitive).
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "OPEN" => Some(Self::Open),
            "RESOLVED" => Some(Self::Resolved),
            _ => None,
        }
    }
}

/// The deduplication key: at most one OPEN issue may exist per key at any
/// point in time.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct IssueKey {
    pub service_name: String,
    pub endpoint: String,
    pub issue_type: AnomalyType,
}

impl IssueKey {
    pub fn new(
        service_name: impl Into<String>,
        endpoint: impl Into<String>,
        issue_type: AnomalyType,
    ) -> Self {
        Self {
            service_name: service_name.into(),
            endpoint: endpoint.into(),
            issue_type,
        }
    }
}

impl fmt::Display for IssueKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.service_name, self.endpoint, self.issue_type
        )
    }
}

/// The deduplicated, mutable record of an ongoing anomaly.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Issue {
    /// Store-assigned identifier.
    pub id: String,
    pub service_name: String,
    pub endpoint: String,
    pub issue_type: AnomalyType,
    pub status: IssueStatus,
    /// Number of occurrences recorded against this row. Always >= 1.
    pub hit_count: u64,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<String>,
    /// Monotonically increasing counter used for optimistic concurrency.
    /// Writes carry the version read and are rejected if the stored version
    /// has changed since.
    pub version: u64,
}

impl Issue {
    /// The deduplication key of this issue.
    pub fn key(&self) -> IssueKey {
        IssueKey::new(
            self.service_name.clone(),
            self.endpoint.clone(),
            self.issue_type,
        )
    }

    pub fn is_open(&self) -> bool {
        self.status == IssueStatus::Open
    }
}
