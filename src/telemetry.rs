use crate::processing::models::{
    AnomalyFinding, AnomalyRule, ProcessedMetrics, Reading, Severity, DEFAULT_DEVICE_STATUS,
};
use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize, Serializer};

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("payload is not valid JSON: {0}")]
    Json(#[from] simd_json::Error),
    #[error("missing field `{0}`")]
    MissingField(&'static str),
    #[error("field `{field}` is not a finite number: {value:?}")]
    InvalidNumber { field: &'static str, value: String },
}

#[derive(Debug, Deserialize)]
struct BorrowedReading<'a> {
    #[serde(default, rename = "eventId", borrow)]
    event_id: Option<&'a str>,
    #[serde(default, rename = "sensorId", borrow)]
    sensor_id: Option<&'a str>,
    #[serde(default, borrow)]
    ts: Option<&'a str>,
    #[serde(default, borrow)]
    temperature: Option<BorrowedNumber<'a>>,
    #[serde(default, borrow)]
    vibration: Option<BorrowedNumber<'a>>,
    #[serde(default, borrow)]
    pressure: Option<BorrowedNumber<'a>>,
    #[serde(default, borrow)]
    device_status: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum BorrowedNumber<'a> {
    Num(f64),
    Str(&'a str),
}

impl<'a> BorrowedNumber<'a> {
    fn to_f64(&self, field: &'static str) -> Result<f64, DecodeError> {
        let value = match self {
            BorrowedNumber::Num(v) => Some(*v),
            BorrowedNumber::Str(s) => s.trim().parse::<f64>().ok(),
        };
        value
            .filter(|v| v.is_finite())
            .ok_or_else(|| DecodeError::InvalidNumber {
                field,
                value: match self {
                    BorrowedNumber::Num(v) => v.to_string(),
                    BorrowedNumber::Str(s) => s.to_string(),
                },
            })
    }
}

fn required_number(
    value: Option<&BorrowedNumber<'_>>,
    field: &'static str,
) -> Result<f64, DecodeError> {
    value
        .ok_or(DecodeError::MissingField(field))?
        .to_f64(field)
}

/// Decodes one inbound message body. `received_at` stands in for a `ts` that
/// is present but unparseable.
pub fn decode_reading(
    payload: &mut [u8],
    received_at: DateTime<Utc>,
) -> Result<Reading, DecodeError> {
    let wire: BorrowedReading = simd_json::from_slice(payload)?;

    let event_id = wire.event_id.ok_or(DecodeError::MissingField("eventId"))?;
    let sensor_id = wire.sensor_id.ok_or(DecodeError::MissingField("sensorId"))?;
    let raw_ts = wire.ts.ok_or(DecodeError::MissingField("ts"))?;
    let temperature = required_number(wire.temperature.as_ref(), "temperature")?;
    let vibration = required_number(wire.vibration.as_ref(), "vibration")?;
    let pressure = required_number(wire.pressure.as_ref(), "pressure")?;

    Ok(Reading {
        event_id: event_id.to_string(),
        sensor_id: sensor_id.to_string(),
        timestamp: parse_timestamp(raw_ts, received_at),
        temperature,
        vibration,
        pressure,
        device_status: wire
            .device_status
            .unwrap_or(DEFAULT_DEVICE_STATUS)
            .to_string(),
    })
}

/// RFC 3339 with any offset, or a naive ISO-8601 timestamp read as UTC.
pub fn parse_timestamp(raw: &str, fallback: DateTime<Utc>) -> DateTime<Utc> {
    let trimmed = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(trimmed) {
        return ts.with_timezone(&Utc);
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M:%S%.f") {
        return naive.and_utc();
    }
    tracing::debug!(raw = trimmed, "unparseable reading timestamp; using receive time");
    fallback
}

pub fn serialize_ts<S: Serializer>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&ts.to_rfc3339_opts(SecondsFormat::AutoSi, false))
}

#[derive(Serialize)]
struct AnomalyRecord<'a> {
    #[serde(rename = "eventId")]
    event_id: &'a str,
    #[serde(rename = "sensorId")]
    sensor_id: &'a str,
    #[serde(serialize_with = "serialize_ts")]
    ts: DateTime<Utc>,
    rule: AnomalyRule,
    severity: Severity,
    message: &'a str,
    metric_snapshot: &'a ProcessedMetrics,
}

pub fn encode_metrics(metrics: &ProcessedMetrics) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(metrics)
}

pub fn encode_anomaly(finding: &AnomalyFinding) -> Result<Vec<u8>, serde_json::Error> {
    let snapshot = &finding.metric_snapshot;
    serde_json::to_vec(&AnomalyRecord {
        event_id: &snapshot.event_id,
        sensor_id: &snapshot.sensor_id,
        ts: snapshot.timestamp,
        rule: finding.rule,
        severity: finding.severity,
        message: &finding.message,
        metric_snapshot: snapshot,
    })
}
