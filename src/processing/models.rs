use chrono::{DateTime, Utc};
use serde::Serialize;

pub const DEFAULT_DEVICE_STATUS: &str = "UNKNOWN";

/// One decoded inbound event. Never mutated after decode.
#[derive(Clone, Debug, PartialEq)]
pub struct Reading {
    pub event_id: String,
    pub sensor_id: String,
    pub timestamp: DateTime<Utc>,
    pub temperature: f64,
    pub vibration: f64,
    pub pressure: f64,
    pub device_status: String,
}

/// Raw reading plus rolling averages and health, as published on the metrics stream.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ProcessedMetrics {
    #[serde(rename = "eventId")]
    pub event_id: String,
    #[serde(rename = "sensorId")]
    pub sensor_id: String,
    #[serde(rename = "ts", serialize_with = "crate::telemetry::serialize_ts")]
    pub timestamp: DateTime<Utc>,
    pub temp: f64,
    pub vib: f64,
    pub press: f64,
    pub avg_temp: f64,
    pub avg_vib: f64,
    pub avg_press: f64,
    pub health: u8,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AnomalyRule {
    TempThreshold,
    PressThreshold,
    VibSpike,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    High,
    Medium,
}

#[derive(Clone, Debug, PartialEq)]
pub struct AnomalyFinding {
    pub rule: AnomalyRule,
    pub severity: Severity,
    pub message: String,
    pub metric_snapshot: ProcessedMetrics,
}
