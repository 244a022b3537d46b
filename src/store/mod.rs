//! Store contracts the collector core depends on.
//!
//! Collaborators implement these; the core only depends on the contract.
//! The bundled in-memory implementations (see [`memory`]) are used by the
//! binary and the tests, and enforce the same constraints a database-backed
//! implementation would: the OPEN-scoped unique issue key and
//! version-checked writes.

use crate::{
    error::StoreError,
    model::{
        Alert, AnomalyType, ApiLogRecord, Issue, IssueKey, IssueStatus, PersistedApiLogRecord,
        RateEvent,
    },
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

pub mod memory;

pub use memory::{MemoryAlertStore, MemoryIssueStore, MemoryLogStore, MemoryRateEventStore};

/// A page request: zero-based page index and page size.
#[derive(Clone, Copy, Debug)]
pub struct PageRequest {
    pub page: usize,
    pub size: usize,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self { page: 0, size: 20 }
    }
}

impl PageRequest {
    pub fn new(page: usize, size: usize) -> Self {
        Self {
            page,
            // Guard against zero-size pages from the query string.
            size: size.max(1),
        }
    }
}

/// One page of results plus the total count across all pages.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub page: usize,
    pub size: usize,
}

/// Predicate over persisted log records. All fields are conjunctive; `None`
/// means "don't care".
#[derive(Clone, Debug, Default)]
pub struct LogQuery {
    pub service_name: Option<String>,
    pub endpoint: Option<String>,
    /// Matches records with latency strictly greater than this.
    pub latency_above_ms: Option<u64>,
    /// Matches records with status code at or above this.
    pub status_at_least: Option<u16>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

impl LogQuery {
    pub(crate) fn matches(&self, record: &ApiLogRecord) -> bool {
        self.service_name
            .as_deref()
            .is_none_or(|s| record.service_name == s)
            && self.endpoint.as_deref().is_none_or(|e| record.endpoint == e)
            && self
                .latency_above_ms
                .is_none_or(|ms| record.latency_ms > ms)
            && self
                .status_at_least
                .is_none_or(|code| record.status_code >= code)
            && self.since.is_none_or(|t| record.timestamp >= t)
            && self.until.is_none_or(|t| record.timestamp < t)
    }
}

/// Per-endpoint latency aggregate for the top-slow-endpoints query.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointLatency {
    pub service_name: String,
    pub endpoint: String,
    pub average_latency_ms: f64,
    pub hit_count: u64,
}

/// One hourly bucket of the error-rate time series.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorRateBucket {
    pub timestamp: DateTime<Utc>,
    pub error_count: u64,
    pub total_count: u64,
    pub error_rate: f64,
}

/// Owns the immutable request telemetry and the aggregates computed over it.
#[async_trait]
pub trait LogStore: Send + Sync {
    /// Persist a record and return it with its assigned id.
    async fn save(&self, record: ApiLogRecord) -> Result<PersistedApiLogRecord, StoreError>;

    /// Count records matching the query.
    async fn count(&self, query: &LogQuery) -> Result<u64, StoreError>;

    /// Fetch one page of matching records, newest first.
    async fn find(
        &self,
        query: &LogQuery,
        page: PageRequest,
    ) -> Result<Page<PersistedApiLogRecord>, StoreError>;

    /// Average latency over all records, in milliseconds. Zero when empty.
    async fn average_latency(&self) -> Result<f64, StoreError>;

    /// Endpoints with latency strictly above `latency_above_ms`, grouped by
    /// (service, endpoint), ordered by average latency descending.
    async fn top_slow_endpoints(
        &self,
        latency_above_ms: u64,
        limit: usize,
    ) -> Result<Vec<EndpointLatency>, StoreError>;

    /// Hourly error-rate buckets covering `[start, end)`.
    async fn hourly_error_rates(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<ErrorRateBucket>, StoreError>;
}

/// Filter for issue listing. Conjunctive; `None` means "don't care".
#[derive(Clone, Debug, Default)]
pub struct IssueFilter {
    pub service_name: Option<String>,
    pub status: Option<IssueStatus>,
    pub issue_type: Option<AnomalyType>,
}

impl IssueFilter {
    pub(crate) fn matches(&self, issue: &Issue) -> bool {
        self.service_name
            .as_deref()
            .is_none_or(|s| issue.service_name == s)
            && self.status.is_none_or(|s| issue.status == s)
            && self.issue_type.is_none_or(|t| issue.issue_type == t)
    }
}

/// Owns the issue ledger rows.
///
/// Implementations must enforce a uniqueness constraint on
/// (service, endpoint, type) scoped to OPEN rows, and must reject
/// version-checked writes whose version no longer matches the stored row.
#[async_trait]
pub trait IssueStore: Send + Sync {
    /// Find the OPEN issue for a key, if one exists.
    async fn find_open_by_key(&self, key: &IssueKey) -> Result<Option<Issue>, StoreError>;

    /// Insert a new OPEN issue for the key with `hit_count = 1`.
    ///
    /// Fails with [`StoreError::UniqueKeyViolation`] if an OPEN issue for
    /// the key already exists (a concurrent racer won the create).
    async fn insert_open(&self, key: &IssueKey, now: DateTime<Utc>) -> Result<Issue, StoreError>;

    /// Write back a modified issue, conditional on `issue.version` matching
    /// the stored version. Returns the stored row with its bumped version.
    ///
    /// Fails with [`StoreError::VersionConflict`] if another writer updated
    /// the row since it was read.
    async fn update(&self, issue: &Issue) -> Result<Issue, StoreError>;

    /// Look up an issue by id.
    async fn find_by_id(&self, id: &str) -> Result<Option<Issue>, StoreError>;

    /// One page of issues matching the filter, most recently seen first.
    async fn find_all(
        &self,
        filter: &IssueFilter,
        page: PageRequest,
    ) -> Result<Page<Issue>, StoreError>;
}

/// Filter for alert listing.
#[derive(Clone, Debug, Default)]
pub struct AlertFilter {
    pub service_name: Option<String>,
    pub alert_type: Option<AnomalyType>,
}

impl AlertFilter {
    pub(crate) fn matches(&self, alert: &Alert) -> bool {
        self.service_name
            .as_deref()
            .is_none_or(|s| alert.service_name == s)
            && self.alert_type.is_none_or(|t| alert.alert_type == t)
    }
}

/// Owns the append-only alert log.
#[async_trait]
pub trait AlertStore: Send + Sync {
    /// Append one alert. Alerts are never deduplicated.
    async fn save(&self, alert: Alert) -> Result<(), StoreError>;

    /// One page of alerts matching the filter, newest first.
    async fn find(
        &self,
        filter: &AlertFilter,
        page: PageRequest,
    ) -> Result<Page<Alert>, StoreError>;
}

/// Owns the rate-limit breach events.
#[async_trait]
pub trait RateEventStore: Send + Sync {
    /// Append one rate event.
    async fn save(&self, event: RateEvent) -> Result<(), StoreError>;

    /// Total number of recorded breaches.
    async fn count(&self) -> Result<u64, StoreError>;
}
