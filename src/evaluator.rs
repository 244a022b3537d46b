//! Anomaly evaluation: pure decision + emission, off the request path.
//!
//! Every qualifying evaluation appends one alert (alerts are a log, never
//! deduplicated) and upserts the tracked issue for the anomaly's key. The
//! two log-based rules are evaluated independently: a single log can fire
//! zero, one, or both, and a failure in one rule never prevents the other.

use crate::{
    ledger::IssueLedger,
    model::{Alert, AnomalyType, IssueKey, PersistedApiLogRecord, RateEvent, NO_ENDPOINT},
    store::AlertStore,
};
use chrono::Utc;
use std::sync::Arc;
use tracing::error;

/// Latency strictly above this fires SLOW_API.
pub const SLOW_LATENCY_THRESHOLD_MS: u64 = 500;

/// Status codes at or above this fire BROKEN_API.
pub const BROKEN_STATUS_THRESHOLD: u16 = 500;

/// Decides which alert types fire for a log or rate event and emits them.
#[derive(Clone)]
pub struct AnomalyEvaluator {
    alerts: Arc<dyn AlertStore>,
    ledger: IssueLedger,
}

impl AnomalyEvaluator {
    pub fn new(alerts: Arc<dyn AlertStore>, ledger: IssueLedger) -> Self {
        Self { alerts, ledger }
    }

    /// Evaluate a persisted log against the fixed anomaly rules.
    ///
    /// Runs on the evaluation worker; the record is already durable. Errors
    /// never propagate past this point.
    pub async fn process_log(&self, log: &PersistedApiLogRecord) {
        let record = &log.record;

        if record.latency_ms > SLOW_LATENCY_THRESHOLD_MS {
            let reason = format!(
                "API latency {}ms exceeds threshold of {SLOW_LATENCY_THRESHOLD_MS}ms",
                record.latency_ms
            );
            self.raise(
                &record.service_name,
                &record.endpoint,
                AnomalyType::SlowApi,
                reason,
            )
            .await;
        }

        if record.status_code >= BROKEN_STATUS_THRESHOLD {
            let reason = format!("API returned {} error status", record.status_code);
            self.raise(
                &record.service_name,
                &record.endpoint,
                AnomalyType::BrokenApi,
                reason,
            )
            .await;
        }
    }

    /// Every rate event fires RATE_LIMIT; the issue key uses the endpoint
    /// sentinel since the breach applies to the whole service.
    pub async fn process_rate_event(&self, event: &RateEvent) {
        let reason = format!(
            "Rate limit exceeded: {} req/s (limit: {})",
            event.current_rate, event.limit
        );
        self.raise(&event.service_name, NO_ENDPOINT, AnomalyType::RateLimit, reason)
            .await;
    }

    /// Append an alert and upsert the issue for one fired rule.
    ///
    /// The two effects are isolated from each other and from the caller:
    /// a failed alert append still upserts the issue, and vice versa.
    async fn raise(&self, service_name: &str, endpoint: &str, kind: AnomalyType, reason: String) {
        let alert = Alert {
            service_name: service_name.to_owned(),
            endpoint: endpoint.to_owned(),
            alert_type: kind,
            reason,
            timestamp: Utc::now(),
        };
        if let Err(err) = self.alerts.save(alert).await {
            error!("Could not append {kind} alert for {service_name} {endpoint}: {err}");
        }

        let key = IssueKey::new(service_name, endpoint, kind);
        if let Err(err) = self.ledger.create_or_update(&key).await {
            error!("Could not upsert {kind} issue for {service_name} {endpoint}: {err}");
        }
    }
}
