//! End-to-end scenarios through the full collector: HTTP in, worker
//! evaluation, ledger and alert state out.

use apiwatch::{
    model::{AnomalyType, Issue, IssueKey, IssueStatus, NO_ENDPOINT},
    store::{
        AlertFilter, AlertStore, IssueFilter, IssueStore, MemoryAlertStore, MemoryIssueStore, MemoryLogStore,
        MemoryRateEventStore, PageRequest,
    },
    Collector, CollectorConfig, SamplerConfig, Stores,
};
use chrono::Utc;
use http::{Method, Request, StatusCode};
use http_body_util::Full;
use hyper::body::Bytes;
use serde_json::{json, Value};
use std::{sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;

struct Harness {
    collector: Arc<Collector>,
    issues: Arc<MemoryIssueStore>,
    alerts: Arc<MemoryAlertStore>,
    token: CancellationToken,
}

fn harness(rate_limit_per_sec: u32) -> Harness {
    let issues = Arc::new(MemoryIssueStore::new());
    let alerts = Arc::new(MemoryAlertStore::new());
    let stores = Stores {
        logs: Arc::new(MemoryLogStore::new()),
        issues: issues.clone(),
        alerts: alerts.clone(),
        rate_events: Arc::new(MemoryRateEventStore::new()),
    };
    let config = CollectorConfig {
        service_name: "collector".into(),
        sampler: SamplerConfig {
            rate_limit_per_sec,
            rate_sampling_disabled: false,
        },
    };
    let token = CancellationToken::new();
    Harness {
        collector: Arc::new(Collector::new(config, stores, token.clone())),
        issues,
        alerts,
        token,
    }
}

fn log_body(service: &str, endpoint: &str, latency: u64, status: u16) -> Value {
    json!({
        "serviceName": service,
        "method": "GET",
        "endpoint": endpoint,
        "timestamp": Utc::now().to_rfc3339(),
        "latency": latency,
        "statusCode": status,
    })
}

async fn post(harness: &Harness, path: &str, body: Value) -> (StatusCode, Value) {
    let req = Request::builder()
        .method(Method::POST)
        .uri(path)
        .body(Full::new(Bytes::from(body.to_string())))
        .unwrap();
    let resp = harness.collector.handle_http_request(req).await.unwrap();
    let status = resp.status();
    let parsed = serde_json::from_str(resp.body()).unwrap_or(Value::Null);
    (status, parsed)
}

async fn get(harness: &Harness, path: &str) -> (StatusCode, Value) {
    let req = Request::builder()
        .method(Method::GET)
        .uri(path)
        .body(Full::new(Bytes::new()))
        .unwrap();
    let resp = harness.collector.handle_http_request(req).await.unwrap();
    let status = resp.status();
    let parsed = serde_json::from_str(resp.body()).unwrap_or(Value::Null);
    (status, parsed)
}

/// Poll for an asynchronously-produced state, bounded.
async fn wait_until<F, Fut>(mut cond: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..300 {
        if cond().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition was not reached within the deadline");
}

async fn wait_for_issue(harness: &Harness, key: &IssueKey, hit_count: u64) -> Issue {
    let issues = harness.issues.clone();
    let polled_key = key.clone();
    wait_until(move || {
        let issues = issues.clone();
        let key = polled_key.clone();
        async move {
            issues
                .find_open_by_key(&key)
                .await
                .unwrap()
                .is_some_and(|issue| issue.hit_count >= hit_count)
        }
    })
    .await;
    harness
        .issues
        .find_open_by_key(key)
        .await
        .unwrap()
        .unwrap()
}

async fn alert_total(harness: &Harness) -> u64 {
    harness
        .alerts
        .find(&AlertFilter::default(), PageRequest::new(0, 1000))
        .await
        .unwrap()
        .total
}

#[tokio::test]
async fn single_slow_log_produces_one_alert_and_one_issue() {
    let h = harness(1000);
    let (status, _) = post(&h, "/collector/logs", log_body("orders", "/checkout", 800, 200)).await;
    assert_eq!(status, StatusCode::CREATED);

    let issue = wait_for_issue(
        &h,
        &IssueKey::new("orders", "/checkout", AnomalyType::SlowApi),
        1,
    )
    .await;
    assert_eq!(issue.hit_count, 1);
    assert_eq!(issue.status, IssueStatus::Open);
    assert_eq!(alert_total(&h).await, 1);
}

#[tokio::test]
async fn repeated_slow_and_broken_logs_alert_every_time_but_dedupe_issues() {
    let h = harness(1000);
    for _ in 0..2 {
        post(&h, "/collector/logs", log_body("orders", "/checkout", 800, 503)).await;
    }

    // Both rules fired twice, so two issues each with two hits.
    for kind in [AnomalyType::SlowApi, AnomalyType::BrokenApi] {
        let issue = wait_for_issue(&h, &IssueKey::new("orders", "/checkout", kind), 2).await;
        assert_eq!(issue.hit_count, 2);
    }

    // Alerts are never deduplicated: two logs, two rules each.
    assert_eq!(alert_total(&h).await, 4);

    // Exactly two issue rows exist in total.
    let all = h
        .issues
        .find_all(&IssueFilter::default(), PageRequest::new(0, 100))
        .await
        .unwrap();
    assert_eq!(all.total, 2);
}

#[tokio::test]
async fn concurrent_slow_reports_converge_on_one_issue_row() {
    let h = harness(100_000);
    let n: u64 = 50;

    let mut handles = Vec::new();
    for _ in 0..n {
        let collector = h.collector.clone();
        handles.push(tokio::spawn(async move {
            let req = Request::builder()
                .method(Method::POST)
                .uri("/collector/logs")
                .body(Full::new(Bytes::from(
                    log_body("orders", "/checkout", 800, 200).to_string(),
                )))
                .unwrap();
            let resp = collector.handle_http_request(req).await.unwrap();
            assert_eq!(resp.status(), StatusCode::CREATED);
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let issue = wait_for_issue(
        &h,
        &IssueKey::new("orders", "/checkout", AnomalyType::SlowApi),
        n,
    )
    .await;
    assert_eq!(issue.hit_count, n);

    // The invariant: one OPEN row for the key, no duplicates.
    let open = h
        .issues
        .find_all(
            &IssueFilter {
                status: Some(IssueStatus::Open),
                ..Default::default()
            },
            PageRequest::new(0, 100),
        )
        .await
        .unwrap();
    assert_eq!(open.total, 1);
    assert_eq!(alert_total(&h).await, n);
}

#[tokio::test]
async fn resolving_and_reoccurring_opens_a_fresh_issue() {
    let h = harness(1000);
    post(&h, "/collector/logs", log_body("orders", "/checkout", 800, 200)).await;
    let key = IssueKey::new("orders", "/checkout", AnomalyType::SlowApi);
    let first = wait_for_issue(&h, &key, 1).await;

    let (status, resolved) = post(
        &h,
        &format!("/issues/{}/resolve", first.id),
        json!({"resolvedBy": "alice"}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(resolved["status"], "RESOLVED");

    // The anomaly happens again: a brand new OPEN row, not a reopen.
    post(&h, "/collector/logs", log_body("orders", "/checkout", 900, 200)).await;
    let second = wait_for_issue(&h, &key, 1).await;
    assert_ne!(second.id, first.id);
    assert_eq!(second.hit_count, 1);

    // The resolved row is retained for history.
    let resolved_rows = h
        .issues
        .find_all(
            &IssueFilter {
                status: Some(IssueStatus::Resolved),
                ..Default::default()
            },
            PageRequest::new(0, 100),
        )
        .await
        .unwrap();
    assert_eq!(resolved_rows.total, 1);
    assert_eq!(resolved_rows.items[0].id, first.id);
}

#[tokio::test]
async fn inbound_burst_over_the_limit_raises_a_rate_limit_issue() {
    // Limit 5/s; 40 rapid posts span at most two wall-clock seconds, so at
    // least one 1-second bucket must exceed the limit.
    let h = harness(5);
    for _ in 0..40 {
        let (status, _) =
            post(&h, "/collector/logs", log_body("orders", "/checkout", 10, 200)).await;
        // Breaching the limit never fails the request.
        assert_eq!(status, StatusCode::CREATED);
    }

    // The breach is the collector's own aggregate inbound rate, so the issue
    // carries the collector's configured name, not the reporting client's.
    wait_for_issue(
        &h,
        &IssueKey::new("collector", NO_ENDPOINT, AnomalyType::RateLimit),
        1,
    )
    .await;
}

#[tokio::test]
async fn issue_listing_round_trip_over_http() {
    let h = harness(1000);
    post(&h, "/collector/logs", log_body("orders", "/checkout", 800, 503)).await;
    wait_for_issue(
        &h,
        &IssueKey::new("orders", "/checkout", AnomalyType::BrokenApi),
        1,
    )
    .await;

    let (status, page) = get(&h, "/issues?service=orders&type=BROKEN_API").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(page["total"], 1);
    assert_eq!(page["items"][0]["issueType"], "BROKEN_API");

    let (status, page) = get(&h, "/alerts?type=SLOW_API").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(page["total"], 1);
    assert!(page["items"][0]["reason"]
        .as_str()
        .unwrap()
        .contains("800ms"));
}

#[tokio::test]
async fn stats_reflect_the_ingested_traffic() {
    let h = harness(1000);
    post(&h, "/collector/logs", log_body("orders", "/checkout", 100, 200)).await;
    post(&h, "/collector/logs", log_body("orders", "/checkout", 800, 200)).await;
    post(&h, "/collector/logs", log_body("billing", "/invoice", 900, 503)).await;
    wait_for_issue(
        &h,
        &IssueKey::new("billing", "/invoice", AnomalyType::BrokenApi),
        1,
    )
    .await;

    let (status, summary) = get(&h, "/stats").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(summary["totalLogs"], 3);
    assert_eq!(summary["slowRequestCount"], 2);
    assert_eq!(summary["errorRequestCount"], 1);

    let (status, top) = get(&h, "/stats/top-slow-endpoints").await;
    assert_eq!(status, StatusCode::OK);
    let top = top.as_array().unwrap();
    assert_eq!(top.len(), 2);
    // Ordered by average latency descending.
    assert_eq!(top[0]["endpoint"], "/invoice");
    assert_eq!(top[1]["endpoint"], "/checkout");

    let (status, series) = get(&h, "/stats/error-rates?hours=2").await;
    assert_eq!(status, StatusCode::OK);
    let series = series.as_array().unwrap();
    assert!(!series.is_empty());
    let last = series.last().unwrap();
    assert_eq!(last["errorCount"], 1);
    assert_eq!(last["totalCount"], 3);
}

#[tokio::test]
async fn shutdown_drains_accepted_work() {
    let h = harness(1000);
    for _ in 0..10 {
        post(&h, "/collector/logs", log_body("orders", "/checkout", 800, 200)).await;
    }

    h.token.cancel();
    h.collector.shutdown().await;

    // Everything accepted before the cancel was still evaluated.
    let issue = h
        .issues
        .find_open_by_key(&IssueKey::new("orders", "/checkout", AnomalyType::SlowApi))
        .await
        .unwrap()
        .expect("issue must exist after drain");
    assert_eq!(issue.hit_count, 10);
}
