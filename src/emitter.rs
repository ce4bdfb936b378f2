use crate::broker::{RecordSink, TransportError};
use crate::processing::models::{AnomalyFinding, ProcessedMetrics};
use crate::telemetry::{encode_anomaly, encode_metrics};

/// Routes encoded records to the metrics and anomaly streams, keyed by
/// sensor id so each source stays on one partition.
pub struct EmissionGateway<S> {
    sink: S,
    metrics_topic: String,
    anomaly_topic: String,
}

impl<S: RecordSink> EmissionGateway<S> {
    pub fn new(sink: S, metrics_topic: impl Into<String>, anomaly_topic: impl Into<String>) -> Self {
        Self {
            sink,
            metrics_topic: metrics_topic.into(),
            anomaly_topic: anomaly_topic.into(),
        }
    }

    pub async fn emit_metrics(&self, key: &str, metrics: &ProcessedMetrics) -> Result<(), TransportError> {
        let payload = encode_metrics(metrics).map_err(|err| TransportError::Send {
            topic: self.metrics_topic.clone(),
            reason: err.to_string(),
        })?;
        self.sink.send(&self.metrics_topic, key, payload).await
    }

    pub async fn emit_anomaly(&self, key: &str, finding: &AnomalyFinding) -> Result<(), TransportError> {
        let payload = encode_anomaly(finding).map_err(|err| TransportError::Send {
            topic: self.anomaly_topic.clone(),
            reason: err.to_string(),
        })?;
        self.sink.send(&self.anomaly_topic, key, payload).await
    }

    pub async fn flush(&self) -> Result<(), TransportError> {
        self.sink.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::MemoryBroker;
    use crate::processing::models::{AnomalyRule, Severity};
    use chrono::Utc;

    fn metrics() -> ProcessedMetrics {
        ProcessedMetrics {
            event_id: "e1".into(),
            sensor_id: "s1".into(),
            timestamp: Utc::now(),
            temp: 90.0,
            vib: 10.0,
            press: 50.0,
            avg_temp: 90.0,
            avg_vib: 10.0,
            avg_press: 50.0,
            health: 70,
        }
    }

    #[tokio::test]
    async fn records_are_keyed_and_held_until_flush() {
        let broker = MemoryBroker::new();
        let gateway = EmissionGateway::new(broker.clone(), "metrics", "anomalies");
        let m = metrics();
        gateway.emit_metrics("s1", &m).await.unwrap();
        gateway
            .emit_anomaly(
                "s1",
                &AnomalyFinding {
                    rule: AnomalyRule::TempThreshold,
                    severity: Severity::High,
                    message: "Temp 90.0 > 80.0".into(),
                    metric_snapshot: m,
                },
            )
            .await
            .unwrap();
        assert_eq!(broker.pending(), 2);
        assert!(broker.delivered().is_empty());

        gateway.flush().await.unwrap();
        let delivered = broker.delivered();
        assert_eq!(delivered.len(), 2);
        assert!(delivered.iter().all(|r| r.key == "s1"));
        assert_eq!(delivered[0].topic, "metrics");
        assert_eq!(delivered[1].topic, "anomalies");
        assert_eq!(delivered[1].json()["rule"], "TEMP_THRESHOLD");
    }

    #[tokio::test]
    async fn flush_failure_surfaces() {
        let broker = MemoryBroker::new();
        broker.set_fail_flushes(true);
        let gateway = EmissionGateway::new(broker.clone(), "metrics", "anomalies");
        gateway.emit_metrics("s1", &metrics()).await.unwrap();
        assert!(matches!(gateway.flush().await, Err(TransportError::Flush(_))));
    }
}
