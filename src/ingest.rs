//! Log ingestion and the background evaluation worker.
//!
//! `LogIngestor::ingest` persists synchronously on the caller's task and
//! then hands the persisted record to the evaluation worker over an
//! unbounded channel. The handoff is fire-and-forget: submission always
//! succeeds synchronously, the result of evaluation is never awaited, and
//! nothing downstream can affect the caller's latency or outcome. Because
//! the send happens after the persist returns, the evaluator can assume the
//! record is durable when it runs.

use crate::{
    error::Error,
    evaluator::AnomalyEvaluator,
    model::{ApiLogRecord, PersistedApiLogRecord, RateEvent},
    store::{LogStore, RateEventStore},
};
use std::sync::Arc;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Work items for the evaluation worker.
#[derive(Debug)]
pub enum EvalTask {
    /// Evaluate a persisted log record.
    Log(PersistedApiLogRecord),
    /// Evaluate a rate-limit breach.
    Rate(RateEvent),
}

/// Accepts completed-request records, persists them, and schedules
/// evaluation.
#[derive(Clone)]
pub struct LogIngestor {
    logs: Arc<dyn LogStore>,
    rate_events: Arc<dyn RateEventStore>,
    eval_tx: UnboundedSender<EvalTask>,
}

impl LogIngestor {
    pub fn new(
        logs: Arc<dyn LogStore>,
        rate_events: Arc<dyn RateEventStore>,
        eval_tx: UnboundedSender<EvalTask>,
    ) -> Self {
        Self {
            logs,
            rate_events,
            eval_tx,
        }
    }

    /// Persist a telemetry record and schedule its anomaly evaluation.
    ///
    /// Fails only if the log store write fails. Whatever happens during
    /// evaluation is never observable here.
    pub async fn ingest(&self, record: ApiLogRecord) -> Result<PersistedApiLogRecord, Error> {
        let persisted = self.logs.save(record).await.map_err(Error::from)?;

        if self.eval_tx.send(EvalTask::Log(persisted.clone())).is_err() {
            // Worker already shut down. The record is durable; only its
            // evaluation is lost, which the delivery non-goal allows.
            warn!("Evaluation worker is gone; log {} will not be evaluated", persisted.id);
        }

        Ok(persisted)
    }

    /// Persist a rate-limit breach and schedule its evaluation.
    pub async fn record_rate_event(&self, event: RateEvent) -> Result<RateEvent, Error> {
        self.rate_events
            .save(event.clone())
            .await
            .map_err(Error::from)?;

        if self.eval_tx.send(EvalTask::Rate(event.clone())).is_err() {
            warn!(
                "Evaluation worker is gone; rate event for {} will not be evaluated",
                event.service_name
            );
        }

        Ok(event)
    }
}

/// Long-lived task that drains the evaluation queue.
///
/// All evaluation errors stop inside the evaluator; the worker only
/// dispatches. On cancellation it drains whatever is already queued before
/// exiting, so accepted work is not silently dropped on shutdown.
pub struct EvalWorker {
    evaluator: AnomalyEvaluator,
    task_rx: UnboundedReceiver<EvalTask>,
    token: CancellationToken,
}

impl EvalWorker {
    /// Spawn the worker and return the submission channel plus its handle.
    pub fn spawn(
        evaluator: AnomalyEvaluator,
        token: CancellationToken,
    ) -> (UnboundedSender<EvalTask>, tokio::task::JoinHandle<()>) {
        let (eval_tx, task_rx) = unbounded_channel();
        let worker = EvalWorker {
            evaluator,
            task_rx,
            token,
        };
        let handle = tokio::spawn(async move {
            worker.run().await;
            info!("Evaluation worker task exited");
        });
        (eval_tx, handle)
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                _ = self.token.cancelled() => {
                    self.drain().await;
                    return;
                }
                task = self.task_rx.recv() => {
                    let Some(task) = task else {
                        return; // All senders dropped
                    };
                    self.handle(task).await;
                }
            }
        }
    }

    async fn handle(&self, task: EvalTask) {
        match task {
            EvalTask::Log(log) => self.evaluator.process_log(&log).await,
            EvalTask::Rate(event) => self.evaluator.process_rate_event(&event).await,
        }
    }

    async fn drain(&mut self) {
        while let Ok(task) = self.task_rx.try_recv() {
            self.handle(task).await;
        }
    }
}
