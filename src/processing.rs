pub mod aggregator;
pub mod idempotency;
pub mod models;
pub mod rules;

use crate::config::Config;
use aggregator::{RecordUndo, RollingAggregator};
use idempotency::IdempotencyFilter;
use models::{AnomalyFinding, ProcessedMetrics, Reading};
use rules::Thresholds;
use std::time::{Duration, Instant};

/// Result of one pipeline pass over a decoded reading.
#[derive(Debug)]
pub enum Evaluation {
    Duplicate,
    Processed {
        metrics: ProcessedMetrics,
        findings: Vec<AnomalyFinding>,
        pass: PassToken,
    },
}

/// State changes made by one processed pass. Hand it back to
/// [`ProcessorContext::rollback`] when emission fails.
#[derive(Debug)]
pub struct PassToken {
    event_id: String,
    sensor_id: String,
    window: RecordUndo,
}

/// Process-lifetime state shared by every handler invocation: rolling windows
/// per source and the dedupe records. One instance per consumer loop.
#[derive(Debug)]
pub struct ProcessorContext {
    aggregator: RollingAggregator,
    idempotency: IdempotencyFilter,
    thresholds: Thresholds,
}

impl ProcessorContext {
    pub fn new(
        window: usize,
        thresholds: Thresholds,
        idempotency_ttl: Duration,
        idempotency_max: usize,
    ) -> Self {
        Self {
            aggregator: RollingAggregator::new(window),
            idempotency: IdempotencyFilter::new(idempotency_ttl, idempotency_max),
            thresholds,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.window_size,
            config.thresholds,
            config.idempotency_ttl(),
            config.idemp_cache_max,
        )
    }

    pub fn idempotency_records(&self) -> usize {
        self.idempotency.len()
    }

    pub fn tracked_sources(&self) -> usize {
        self.aggregator.tracked_sources()
    }

    /// Undoes a pass whose emission failed: the dedupe mark is dropped and the
    /// rolling window returns to its pre-pass contents, so the redelivered
    /// copy is evaluated exactly as the first attempt was.
    pub fn rollback(&mut self, pass: PassToken) {
        self.idempotency.forget(&pass.event_id);
        self.aggregator.revert(&pass.sensor_id, pass.window);
    }

    pub fn evaluate(&mut self, reading: &Reading) -> Evaluation {
        self.evaluate_at(reading, Instant::now())
    }

    pub fn evaluate_at(&mut self, reading: &Reading, now: Instant) -> Evaluation {
        if self.idempotency.check_and_mark(&reading.event_id, now) {
            return Evaluation::Duplicate;
        }

        let previous = self.aggregator.previous(&reading.sensor_id);
        let window = self.aggregator.record(
            &reading.sensor_id,
            reading.temperature,
            reading.vibration,
            reading.pressure,
        );
        let averages = self.aggregator.averages(
            &reading.sensor_id,
            reading.temperature,
            reading.vibration,
            reading.pressure,
        );

        let metrics = ProcessedMetrics {
            event_id: reading.event_id.clone(),
            sensor_id: reading.sensor_id.clone(),
            timestamp: reading.timestamp,
            temp: reading.temperature,
            vib: reading.vibration,
            press: reading.pressure,
            avg_temp: averages.temperature,
            avg_vib: averages.vibration,
            avg_press: averages.pressure,
            health: rules::health_score(reading.temperature, reading.pressure, &self.thresholds),
        };
        let findings = rules::detect_anomalies(&metrics, previous.vibration, &self.thresholds);

        let pass = PassToken {
            event_id: reading.event_id.clone(),
            sensor_id: reading.sensor_id.clone(),
            window,
        };
        Evaluation::Processed {
            metrics,
            findings,
            pass,
        }
    }
}
