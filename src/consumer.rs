use crate::broker::{InboundMessage, MessageSource, RecordSink, TransportError};
use crate::emitter::EmissionGateway;
use crate::processing::{Evaluation, ProcessorContext};
use crate::stats::ProcessorStats;
use crate::telemetry::{decode_reading, DecodeError};
use chrono::{DateTime, Utc};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;

const RECEIVE_BACKOFF: Duration = Duration::from_secs(1);
const RETRY_BACKOFF: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Processed { anomalies: usize },
    Duplicate,
}

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("decode failed: {0}")]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl ProcessError {
    /// Decode failures repeat on every redelivery; transport failures may not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProcessError::Transport(_))
    }
}

#[derive(Debug)]
pub enum PollOutcome {
    Idle,
    Committed(Outcome),
    Uncommitted(ProcessError),
}

/// One pipeline pass: decode, dedupe, evaluate, emit, flush. Commit is the
/// caller's job and must only follow `Ok`.
pub async fn handle_message<S: RecordSink>(
    context: &mut ProcessorContext,
    gateway: &EmissionGateway<S>,
    payload: &[u8],
    received_at: DateTime<Utc>,
) -> Result<Outcome, ProcessError> {
    let mut buf = payload.to_vec();
    let reading = decode_reading(&mut buf, received_at)?;

    let (metrics, findings, pass) = match context.evaluate(&reading) {
        Evaluation::Duplicate => {
            tracing::info!(
                event_id = %reading.event_id,
                sensor_id = %reading.sensor_id,
                "duplicate-event"
            );
            return Ok(Outcome::Duplicate);
        }
        Evaluation::Processed {
            metrics,
            findings,
            pass,
        } => (metrics, findings, pass),
    };

    let emitted = async {
        gateway.emit_metrics(&reading.sensor_id, &metrics).await?;
        for finding in &findings {
            gateway.emit_anomaly(&reading.sensor_id, finding).await?;
        }
        gateway.flush().await
    }
    .await;

    if let Err(err) = emitted {
        context.rollback(pass);
        return Err(err.into());
    }

    tracing::info!(
        event_id = %reading.event_id,
        sensor_id = %reading.sensor_id,
        device_status = %reading.device_status,
        health = metrics.health,
        anomalies = findings.len(),
        "processed"
    );
    Ok(Outcome::Processed {
        anomalies: findings.len(),
    })
}

/// Consume-process-commit loop. Strictly sequential: one message is received,
/// handled, and committed (or not) before the next receive.
pub struct StreamConsumer<M, S> {
    source: M,
    gateway: EmissionGateway<S>,
    context: ProcessorContext,
    stats: Arc<ProcessorStats>,
    poll_timeout: Duration,
}

impl<M, S> StreamConsumer<M, S>
where
    M: MessageSource,
    S: RecordSink,
{
    pub fn new(
        source: M,
        gateway: EmissionGateway<S>,
        context: ProcessorContext,
        stats: Arc<ProcessorStats>,
        poll_timeout: Duration,
    ) -> Self {
        Self {
            source,
            gateway,
            context,
            stats,
            poll_timeout,
        }
    }

    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), TransportError> {
        tracing::info!(poll_timeout_ms = self.poll_timeout.as_millis() as u64, "consumer loop started");
        while !*shutdown.borrow() {
            match self.poll_once().await {
                Ok(PollOutcome::Uncommitted(_)) => {
                    // The failed message comes straight back; pace the retries.
                    tokio::select! {
                        _ = sleep(RETRY_BACKOFF) => {}
                        _ = shutdown.changed() => {}
                    }
                }
                Ok(_) => {}
                Err(TransportError::Closed) => return Err(TransportError::Closed),
                Err(err) => {
                    self.stats.record_error(err.to_string());
                    tracing::warn!(error = %err, "receive failed; backing off");
                    sleep(RECEIVE_BACKOFF).await;
                }
            }
        }
        tracing::info!("consumer loop stopped");
        Ok(())
    }

    /// Receives at most one message, handles it, and commits iff handling
    /// succeeded. An uncommitted message is handed back to the source and is
    /// the next one received. Errors are receive-side only.
    pub async fn poll_once(&mut self) -> Result<PollOutcome, TransportError> {
        let Some(message) = self.source.recv(self.poll_timeout).await? else {
            return Ok(PollOutcome::Idle);
        };
        self.stats.received.fetch_add(1, Ordering::Relaxed);

        let result = handle_message(
            &mut self.context,
            &self.gateway,
            &message.payload,
            message.received_at,
        )
        .await;
        self.publish_context_sizes();

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(err) => {
                self.record_failure(&message, &err);
                self.source.redeliver(message);
                return Ok(PollOutcome::Uncommitted(err));
            }
        };

        if let Err(err) = self.source.commit(&message).await {
            let err = ProcessError::from(err);
            self.record_failure(&message, &err);
            self.source.redeliver(message);
            return Ok(PollOutcome::Uncommitted(err));
        }
        self.stats.commits.fetch_add(1, Ordering::Relaxed);
        match outcome {
            Outcome::Processed { anomalies } => {
                self.stats.processed.fetch_add(1, Ordering::Relaxed);
                self.stats
                    .anomalies
                    .fetch_add(anomalies as u64, Ordering::Relaxed);
            }
            Outcome::Duplicate => {
                self.stats.duplicates.fetch_add(1, Ordering::Relaxed);
            }
        }
        Ok(PollOutcome::Committed(outcome))
    }

    fn record_failure(&self, message: &InboundMessage<M::Ack>, err: &ProcessError) {
        self.stats.failed.fetch_add(1, Ordering::Relaxed);
        self.stats.record_error(err.to_string());
        tracing::error!(
            error = %err,
            retryable = err.is_retryable(),
            topic = %message.topic,
            "handler-failed"
        );
    }

    fn publish_context_sizes(&self) {
        self.stats
            .idempotency_records
            .store(self.context.idempotency_records() as u64, Ordering::Relaxed);
        self.stats
            .tracked_sources
            .store(self.context.tracked_sources() as u64, Ordering::Relaxed);
    }
}
