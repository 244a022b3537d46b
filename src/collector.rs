//! The collector: wiring of all components plus the HTTP surface.
//!
//! One `Collector` owns the sampler, the ingestor, the resolver, the stats
//! service and the evaluation worker. The HTTP handler is transport-generic
//! over the request body so it can be served by hyper and exercised directly
//! in tests.

use crate::{
    error::Error,
    evaluator::{AnomalyEvaluator, BROKEN_STATUS_THRESHOLD, SLOW_LATENCY_THRESHOLD_MS},
    ingest::{EvalWorker, LogIngestor},
    ledger::IssueLedger,
    model::{AnomalyType, ApiLogRecord, IssueStatus, RateEvent},
    resolver::IssueResolver,
    sampler::{RateSampler, SamplerConfig},
    stats::StatsService,
    store::{
        AlertFilter, AlertStore, IssueFilter, IssueStore, LogQuery, LogStore, PageRequest,
        RateEventStore,
    },
};
use conf::Conf;
use http::{header, Method, Request, Response, StatusCode};
use http_body::Body;
use http_body_util::BodyExt;
use hyper::body::Buf;
use serde::Deserialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Hours of error-rate history returned when the query does not say.
const DEFAULT_ERROR_RATE_HOURS: u32 = 24;

/// Config options for the collector.
#[derive(Clone, Conf, Debug)]
#[conf(serde)]
pub struct CollectorConfig {
    /// Service name reported on rate events emitted for the collector's own
    /// inbound traffic.
    #[conf(long, env, default_value = "collector")]
    pub service_name: String,
    /// Request-rate sampler options.
    #[conf(flatten, serde(flatten))]
    pub sampler: SamplerConfig,
}

/// The stores a collector runs on.
#[derive(Clone)]
pub struct Stores {
    pub logs: Arc<dyn LogStore>,
    pub issues: Arc<dyn IssueStore>,
    pub alerts: Arc<dyn AlertStore>,
    pub rate_events: Arc<dyn RateEventStore>,
}

/// Body of `POST /issues/{id}/resolve`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResolveRequest {
    resolved_by: String,
}

pub struct Collector {
    /// Name the collector's own inbound traffic is sampled under.
    service_name: String,
    sampler: RateSampler,
    ingestor: LogIngestor,
    resolver: IssueResolver,
    stats: StatsService,
    logs: Arc<dyn LogStore>,
    issues: Arc<dyn IssueStore>,
    alerts: Arc<dyn AlertStore>,
    worker: tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Collector {
    /// Wire up all components and spawn the evaluation worker.
    pub fn new(config: CollectorConfig, stores: Stores, token: CancellationToken) -> Self {
        let ledger = IssueLedger::new(stores.issues.clone());
        let evaluator = AnomalyEvaluator::new(stores.alerts.clone(), ledger);
        let (eval_tx, worker) = EvalWorker::spawn(evaluator, token);

        Self {
            service_name: config.service_name,
            sampler: RateSampler::new(config.sampler),
            ingestor: LogIngestor::new(stores.logs.clone(), stores.rate_events.clone(), eval_tx),
            resolver: IssueResolver::new(stores.issues.clone()),
            stats: StatsService::new(stores.logs.clone(), stores.rate_events.clone()),
            logs: stores.logs,
            issues: stores.issues,
            alerts: stores.alerts,
            worker: tokio::sync::Mutex::new(Some(worker)),
        }
    }

    /// Wait for the evaluation worker to drain and exit. Call after
    /// cancelling the token passed to [`Collector::new`].
    pub async fn shutdown(&self) {
        if let Some(worker) = self.worker.lock().await.take() {
            if let Err(err) = worker.await {
                warn!("Evaluation worker did not exit cleanly: {err}");
            }
        }
    }

    /// Handle an incoming HTTP request.
    pub async fn handle_http_request<B>(&self, req: Request<B>) -> Result<Response<String>, String>
    where
        B: Body + Send,
        B::Data: Buf + Send,
        B::Error: std::fmt::Display,
    {
        info!(
            "Received http request: {} {} (version: {:?})",
            req.method(),
            req.uri().path(),
            req.version()
        );

        let path = req.uri().path().to_owned();
        let query = req.uri().query().unwrap_or("").to_owned();

        match (req.method().clone(), path.as_str()) {
            (Method::GET | Method::HEAD, "/" | "/health" | "/ready") => Ok(text_resp("OK")),

            (Method::POST, "/collector/logs") => {
                let body = read_body(req).await?;
                Ok(self.handle_post_log(&body).await)
            }
            // The second path is what existing client interceptors post to.
            (Method::POST, "/collector/rate-events" | "/collector/rate-limit-events") => {
                let body = read_body(req).await?;
                Ok(self.handle_post_rate_event(&body).await)
            }
            (Method::POST, path) => {
                // POST /issues/{id}/resolve
                if let Some(id) = path
                    .strip_prefix("/issues/")
                    .and_then(|rest| rest.strip_suffix("/resolve"))
                {
                    let id = id.to_owned();
                    let body = read_body(req).await?;
                    Ok(self.handle_resolve(&id, &body).await)
                } else {
                    Ok(not_found(&Method::POST, path))
                }
            }

            (Method::GET, "/logs") => Ok(self.handle_list_logs(&query).await),
            (Method::GET, "/issues") => Ok(self.handle_list_issues(&query).await),
            (Method::GET, "/alerts") => Ok(self.handle_list_alerts(&query).await),
            (Method::GET, "/stats") => {
                let summary = self.stats.summary().await;
                Ok(json_resp(StatusCode::OK, &summary))
            }
            (Method::GET, "/stats/top-slow-endpoints") => {
                Ok(match self.stats.top_slow_endpoints().await {
                    Ok(top) => json_resp(StatusCode::OK, &top),
                    Err(err) => error_resp(&err),
                })
            }
            (Method::GET, "/stats/error-rates") => {
                let hours = query_params(&query)
                    .find(|(k, _)| k == "hours")
                    .and_then(|(_, v)| v.parse().ok())
                    .unwrap_or(DEFAULT_ERROR_RATE_HOURS);
                Ok(match self.stats.error_rate_series(hours).await {
                    Ok(series) => json_resp(StatusCode::OK, &series),
                    Err(err) => error_resp(&err),
                })
            }

            (method, path) => Ok(not_found(&method, path)),
        }
    }

    /// `POST /collector/logs`: sample the rate, then persist and schedule
    /// evaluation.
    async fn handle_post_log(&self, body: &[u8]) -> Response<String> {
        let record: ApiLogRecord = match serde_json::from_slice(body) {
            Ok(record) => record,
            Err(err) => {
                return text_status_resp(StatusCode::BAD_REQUEST, format!("Invalid log record: {err}"));
            }
        };
        if record.service_name.trim().is_empty() {
            return text_status_resp(StatusCode::BAD_REQUEST, "serviceName must not be empty");
        }

        // Sampling happens before any persistence so the count reflects every
        // accepted report. The sampler counts the collector's own aggregate
        // inbound traffic, so the breach is attributed to the collector's
        // configured name, not to whichever client sent the tipping request.
        // The emitted event is handed off and never awaited: it cannot slow
        // down or fail this request.
        if let Some(event) = self.sampler.observe(&self.service_name) {
            let ingestor = self.ingestor.clone();
            tokio::spawn(async move {
                if let Err(err) = ingestor.record_rate_event(event).await {
                    warn!("Could not record rate event: {err}");
                }
            });
        }

        match self.ingestor.ingest(record).await {
            Ok(persisted) => json_resp(StatusCode::CREATED, &persisted),
            Err(err) => error_resp(&err),
        }
    }

    /// `POST /collector/rate-events`: breaches reported by instrumented
    /// services running their own samplers.
    async fn handle_post_rate_event(&self, body: &[u8]) -> Response<String> {
        let event: RateEvent = match serde_json::from_slice(body) {
            Ok(event) => event,
            Err(err) => {
                return text_status_resp(StatusCode::BAD_REQUEST, format!("Invalid rate event: {err}"));
            }
        };
        if event.service_name.trim().is_empty() {
            return text_status_resp(StatusCode::BAD_REQUEST, "serviceName must not be empty");
        }

        match self.ingestor.record_rate_event(event).await {
            Ok(saved) => json_resp(StatusCode::CREATED, &saved),
            Err(err) => error_resp(&err),
        }
    }

    async fn handle_resolve(&self, id: &str, body: &[u8]) -> Response<String> {
        let request: ResolveRequest = match serde_json::from_slice(body) {
            Ok(request) => request,
            Err(err) => {
                return text_status_resp(
                    StatusCode::BAD_REQUEST,
                    format!("Invalid resolve request: {err}"),
                );
            }
        };

        match self.resolver.resolve(id, &request.resolved_by).await {
            Ok(resolved) => json_resp(StatusCode::OK, &resolved),
            Err(err) => error_resp(&err),
        }
    }

    async fn handle_list_logs(&self, query: &str) -> Response<String> {
        let mut filter = LogQuery::default();
        let mut page = PageRequest::default();
        for (key, value) in query_params(query) {
            match key.as_ref() {
                "service" => filter.service_name = Some(value.into_owned()),
                "endpoint" => filter.endpoint = Some(value.into_owned()),
                // Convenience flags matching the anomaly thresholds.
                "slow" if value == "true" => {
                    filter.latency_above_ms = Some(SLOW_LATENCY_THRESHOLD_MS);
                }
                "broken" if value == "true" => {
                    filter.status_at_least = Some(BROKEN_STATUS_THRESHOLD);
                }
                "since" => match value.parse() {
                    Ok(t) => filter.since = Some(t),
                    Err(err) => {
                        return text_status_resp(
                            StatusCode::BAD_REQUEST,
                            format!("Invalid since timestamp '{value}': {err}"),
                        );
                    }
                },
                "until" => match value.parse() {
                    Ok(t) => filter.until = Some(t),
                    Err(err) => {
                        return text_status_resp(
                            StatusCode::BAD_REQUEST,
                            format!("Invalid until timestamp '{value}': {err}"),
                        );
                    }
                },
                "page" => page.page = value.parse().unwrap_or(0),
                "size" => page = PageRequest::new(page.page, value.parse().unwrap_or(page.size)),
                _ => {}
            }
        }

        match self.logs.find(&filter, page).await {
            Ok(page) => json_resp(StatusCode::OK, &page),
            Err(err) => error_resp(&Error::from(err)),
        }
    }

    async fn handle_list_issues(&self, query: &str) -> Response<String> {
        let mut filter = IssueFilter::default();
        let mut page = PageRequest::default();
        for (key, value) in query_params(query) {
            match key.as_ref() {
                "service" => filter.service_name = Some(value.into_owned()),
                "status" => match IssueStatus::parse(&value) {
                    Some(status) => filter.status = Some(status),
                    None => {
                        return text_status_resp(
                            StatusCode::BAD_REQUEST,
                            format!("Unknown issue status '{value}'"),
                        );
                    }
                },
                "type" => match AnomalyType::parse(&value) {
                    Some(t) => filter.issue_type = Some(t),
                    None => {
                        return text_status_resp(
                            StatusCode::BAD_REQUEST,
                            format!("Unknown issue type '{value}'"),
                        );
                    }
                },
                "page" => page.page = value.parse().unwrap_or(0),
                "size" => page = PageRequest::new(page.page, value.parse().unwrap_or(page.size)),
                _ => {}
            }
        }

        match self.issues.find_all(&filter, page).await {
            Ok(page) => json_resp(StatusCode::OK, &page),
            Err(err) => error_resp(&Error::from(err)),
        }
    }

    async fn handle_list_alerts(&self, query: &str) -> Response<String> {
        let mut filter = AlertFilter::default();
        let mut page = PageRequest::default();
        for (key, value) in query_params(query) {
            match key.as_ref() {
                "service" => filter.service_name = Some(value.into_owned()),
                "type" => match AnomalyType::parse(&value) {
                    Some(t) => filter.alert_type = Some(t),
                    None => {
                        return text_status_resp(
                            StatusCode::BAD_REQUEST,
                            format!("Unknown alert type '{value}'"),
                        );
                    }
                },
                "page" => page.page = value.parse().unwrap_or(0),
                "size" => page = PageRequest::new(page.page, value.parse().unwrap_or(page.size)),
                _ => {}
            }
        }

        match self.alerts.find(&filter, page).await {
            Ok(page) => json_resp(StatusCode::OK, &page),
            Err(err) => error_resp(&Error::from(err)),
        }
    }
}

async fn read_body<B>(req: Request<B>) -> Result<Vec<u8>, String>
where
    B: Body + Send,
    B::Data: Buf + Send,
    B::Error: std::fmt::Display,
{
    Ok(req
        .into_body()
        .collect()
        .await
        .map_err(|err| format!("When reading body bytes: {err}"))?
        .to_bytes()
        .to_vec())
}

fn query_params(query: &str) -> impl Iterator<Item = (std::borrow::Cow<'_, str>, std::borrow::Cow<'_, str>)> {
    url::form_urlencoded::parse(query.as_bytes())
}

fn text_resp(text: impl Into<String>) -> Response<String> {
    Response::new(text.into())
}

fn text_status_resp(code: StatusCode, text: impl Into<String>) -> Response<String> {
    let mut resp = Response::new(text.into());
    *resp.status_mut() = code;
    resp
}

fn json_resp<T: serde::Serialize>(code: StatusCode, value: &T) -> Response<String> {
    match serde_json::to_string(value) {
        Ok(text) => {
            let mut resp = Response::new(text);
            *resp.status_mut() = code;
            resp.headers_mut().insert(
                header::CONTENT_TYPE,
                header::HeaderValue::from_static("application/json"),
            );
            resp
        }
        Err(err) => text_status_resp(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Serialization failure: {err}"),
        ),
    }
}

fn not_found(method: &Method, path: &str) -> Response<String> {
    text_status_resp(StatusCode::NOT_FOUND, format!("Not found '{method} {path}'"))
}

fn error_resp(err: &Error) -> Response<String> {
    let code = match err {
        Error::Validation(_) => StatusCode::BAD_REQUEST,
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::AlreadyResolved => StatusCode::CONFLICT,
        // Retries were exhausted; the operation is safe to resubmit.
        Error::Conflict => StatusCode::SERVICE_UNAVAILABLE,
        Error::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    text_status_resp(code, err.to_string())
}
