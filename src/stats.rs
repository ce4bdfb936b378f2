use serde::Serialize;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Mutex,
};

#[derive(Debug, Default)]
pub struct ProcessorStats {
    pub received: AtomicU64,
    pub processed: AtomicU64,
    pub duplicates: AtomicU64,
    pub failed: AtomicU64,
    pub anomalies: AtomicU64,
    pub commits: AtomicU64,
    pub idempotency_records: AtomicU64,
    pub tracked_sources: AtomicU64,
    pub broker_connected: AtomicBool,
    pub last_error: Mutex<Option<String>>,
}

#[derive(Debug, Serialize)]
pub struct StatsSnapshot {
    pub received: u64,
    pub processed: u64,
    pub duplicates: u64,
    pub failed: u64,
    pub anomalies: u64,
    pub commits: u64,
    pub idempotency_records: u64,
    pub tracked_sources: u64,
    pub broker_connected: bool,
    pub last_error: Option<String>,
}

impl ProcessorStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_broker_connected(&self, connected: bool) {
        self.broker_connected.store(connected, Ordering::Relaxed);
    }

    pub fn record_error(&self, err: impl Into<String>) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = Some(err.into());
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            anomalies: self.anomalies.load(Ordering::Relaxed),
            commits: self.commits.load(Ordering::Relaxed),
            idempotency_records: self.idempotency_records.load(Ordering::Relaxed),
            tracked_sources: self.tracked_sources.load(Ordering::Relaxed),
            broker_connected: self.broker_connected.load(Ordering::Relaxed),
            last_error: self.last_error.lock().ok().and_then(|e| e.clone()),
        }
    }
}
