//! In-memory store implementations.
//!
//! These back the binary and the tests. They keep the same observable
//! contract a database-backed store would: ids are assigned on insert, the
//! issue store rejects a second OPEN row per key, and version-checked writes
//! fail when the stored version moved.

use super::{
    AlertFilter, AlertStore, EndpointLatency, ErrorRateBucket, IssueFilter, IssueStore, LogQuery,
    LogStore, Page, PageRequest, RateEventStore,
};
use crate::{
    error::StoreError,
    model::{Alert, ApiLogRecord, Issue, IssueKey, IssueStatus, PersistedApiLogRecord, RateEvent},
};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        RwLock,
    },
};

fn paginate<T: Clone>(matches: Vec<T>, page: PageRequest) -> Page<T> {
    let total = matches.len() as u64;
    // Both values come from the query string; an absurd page index must give
    // an empty page, not an overflow.
    let items = matches
        .into_iter()
        .skip(page.page.saturating_mul(page.size))
        .take(page.size)
        .collect();
    Page {
        items,
        total,
        page: page.page,
        size: page.size,
    }
}

/// In-memory [`LogStore`].
#[derive(Debug, Default)]
pub struct MemoryLogStore {
    records: RwLock<Vec<PersistedApiLogRecord>>,
    next_id: AtomicU64,
}

impl MemoryLogStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LogStore for MemoryLogStore {
    async fn save(&self, record: ApiLogRecord) -> Result<PersistedApiLogRecord, StoreError> {
        let id = format!("log-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        let persisted = PersistedApiLogRecord { id, record };
        self.records.write().unwrap().push(persisted.clone());
        Ok(persisted)
    }

    async fn count(&self, query: &LogQuery) -> Result<u64, StoreError> {
        let records = self.records.read().unwrap();
        Ok(records.iter().filter(|r| query.matches(&r.record)).count() as u64)
    }

    async fn find(
        &self,
        query: &LogQuery,
        page: PageRequest,
    ) -> Result<Page<PersistedApiLogRecord>, StoreError> {
        let records = self.records.read().unwrap();
        let mut matches: Vec<_> = records
            .iter()
            .filter(|r| query.matches(&r.record))
            .cloned()
            .collect();
        matches.sort_by(|a, b| b.record.timestamp.cmp(&a.record.timestamp));
        Ok(paginate(matches, page))
    }

    async fn average_latency(&self) -> Result<f64, StoreError> {
        let records = self.records.read().unwrap();
        if records.is_empty() {
            return Ok(0.0);
        }
        let sum: u64 = records.iter().map(|r| r.record.latency_ms).sum();
        Ok(sum as f64 / records.len() as f64)
    }

    async fn top_slow_endpoints(
        &self,
        latency_above_ms: u64,
        limit: usize,
    ) -> Result<Vec<EndpointLatency>, StoreError> {
        let records = self.records.read().unwrap();
        let mut groups: HashMap<(String, String), (u64, u64)> = HashMap::new();
        for r in records
            .iter()
            .filter(|r| r.record.latency_ms > latency_above_ms)
        {
            let entry = groups
                .entry((r.record.service_name.clone(), r.record.endpoint.clone()))
                .or_insert((0, 0));
            entry.0 += r.record.latency_ms;
            entry.1 += 1;
        }

        let mut result: Vec<EndpointLatency> = groups
            .into_iter()
            .map(|((service_name, endpoint), (sum, count))| EndpointLatency {
                service_name,
                endpoint,
                average_latency_ms: sum as f64 / count as f64,
                hit_count: count,
            })
            .collect();
        result.sort_by(|a, b| {
            b.average_latency_ms
                .partial_cmp(&a.average_latency_ms)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        result.truncate(limit);
        Ok(result)
    }

    async fn hourly_error_rates(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<ErrorRateBucket>, StoreError> {
        let records = self.records.read().unwrap();
        let mut buckets = Vec::new();
        let mut current = start;
        while current < end {
            let next = current + Duration::hours(1);
            let in_bucket: Vec<_> = records
                .iter()
                .filter(|r| r.record.timestamp >= current && r.record.timestamp < next)
                .collect();
            let total_count = in_bucket.len() as u64;
            let error_count = in_bucket
                .iter()
                .filter(|r| r.record.status_code >= 500)
                .count() as u64;
            let error_rate = if total_count > 0 {
                error_count as f64 / total_count as f64
            } else {
                0.0
            };
            buckets.push(ErrorRateBucket {
                timestamp: current,
                error_count,
                total_count,
                error_rate,
            });
            current = next;
        }
        Ok(buckets)
    }
}

/// In-memory [`IssueStore`].
///
/// Enforces the partial unique index on (service, endpoint, type) scoped to
/// OPEN rows, and version-checked writes.
#[derive(Debug, Default)]
pub struct MemoryIssueStore {
    issues: RwLock<Vec<Issue>>,
    next_id: AtomicU64,
}

impl MemoryIssueStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IssueStore for MemoryIssueStore {
    async fn find_open_by_key(&self, key: &IssueKey) -> Result<Option<Issue>, StoreError> {
        let issues = self.issues.read().unwrap();
        Ok(issues
            .iter()
            .find(|i| i.is_open() && i.key() == *key)
            .cloned())
    }

    async fn insert_open(&self, key: &IssueKey, now: DateTime<Utc>) -> Result<Issue, StoreError> {
        let mut issues = self.issues.write().unwrap();
        // The unique index check and the insert happen under one write lock,
        // like a unique-constraint check inside the database engine.
        if issues.iter().any(|i| i.is_open() && i.key() == *key) {
            return Err(StoreError::UniqueKeyViolation);
        }
        let issue = Issue {
            id: format!("issue-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1),
            service_name: key.service_name.clone(),
            endpoint: key.endpoint.clone(),
            issue_type: key.issue_type,
            status: IssueStatus::Open,
            hit_count: 1,
            first_seen_at: now,
            last_seen_at: now,
            resolved_at: None,
            resolved_by: None,
            version: 0,
        };
        issues.push(issue.clone());
        Ok(issue)
    }

    async fn update(&self, issue: &Issue) -> Result<Issue, StoreError> {
        let mut issues = self.issues.write().unwrap();
        let stored = issues
            .iter_mut()
            .find(|i| i.id == issue.id)
            .ok_or_else(|| StoreError::Backend(format!("no issue with id {}", issue.id)))?;
        if stored.version != issue.version {
            return Err(StoreError::VersionConflict);
        }
        *stored = Issue {
            version: issue.version + 1,
            ..issue.clone()
        };
        Ok(stored.clone())
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<Issue>, StoreError> {
        let issues = self.issues.read().unwrap();
        Ok(issues.iter().find(|i| i.id == id).cloned())
    }

    async fn find_all(
        &self,
        filter: &IssueFilter,
        page: PageRequest,
    ) -> Result<Page<Issue>, StoreError> {
        let issues = self.issues.read().unwrap();
        let mut matches: Vec<_> = issues.iter().filter(|i| filter.matches(i)).cloned().collect();
        matches.sort_by(|a, b| b.last_seen_at.cmp(&a.last_seen_at));
        Ok(paginate(matches, page))
    }
}

/// In-memory [`AlertStore`].
#[derive(Debug, Default)]
pub struct MemoryAlertStore {
    alerts: RwLock<Vec<Alert>>,
}

impl MemoryAlertStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AlertStore for MemoryAlertStore {
    async fn save(&self, alert: Alert) -> Result<(), StoreError> {
        self.alerts.write().unwrap().push(alert);
        Ok(())
    }

    async fn find(
        &self,
        filter: &AlertFilter,
        page: PageRequest,
    ) -> Result<Page<Alert>, StoreError> {
        let alerts = self.alerts.read().unwrap();
        let mut matches: Vec<_> = alerts.iter().filter(|a| filter.matches(a)).cloned().collect();
        matches.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(paginate(matches, page))
    }
}

/// In-memory [`RateEventStore`].
#[derive(Debug, Default)]
pub struct MemoryRateEventStore {
    events: RwLock<Vec<RateEvent>>,
}

impl MemoryRateEventStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RateEventStore for MemoryRateEventStore {
    async fn save(&self, event: RateEvent) -> Result<(), StoreError> {
        self.events.write().unwrap().push(event);
        Ok(())
    }

    async fn count(&self) -> Result<u64, StoreError> {
        Ok(self.events.read().unwrap().len() as u64)
    }
}
