use super::models::{AnomalyFinding, AnomalyRule, ProcessedMetrics, Severity};

const HEALTH_MAX: i32 = 100;
const THRESHOLD_PENALTY: i32 = 30;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Thresholds {
    pub temp_max: f64,
    pub vib_spike_pct: f64,
    pub press_max: f64,
}

/// 100 minus 30 per exceeded temperature/pressure threshold, floored at 0.
/// Vibration only feeds anomaly detection.
pub fn health_score(temperature: f64, pressure: f64, thresholds: &Thresholds) -> u8 {
    let mut score = HEALTH_MAX;
    if temperature > thresholds.temp_max {
        score -= THRESHOLD_PENALTY;
    }
    if pressure > thresholds.press_max {
        score -= THRESHOLD_PENALTY;
    }
    score.clamp(0, HEALTH_MAX) as u8
}

/// Percent increase over a strictly positive previous value.
pub fn vibration_increase_pct(vibration: f64, previous: Option<f64>) -> Option<f64> {
    let previous = previous.filter(|prev| *prev > 0.0)?;
    Some((vibration - previous) / previous * 100.0)
}

/// Evaluates every rule against the metrics. Values in messages keep their
/// decimal point (`Temp 90.0 > 80.0`). Findings come out in
/// temperature, pressure, vibration order. A vibration decrease never counts
/// as a spike, even under a negative spike threshold.
pub fn detect_anomalies(
    metrics: &ProcessedMetrics,
    previous_vibration: Option<f64>,
    thresholds: &Thresholds,
) -> Vec<AnomalyFinding> {
    let mut findings = Vec::new();
    let mut push = |rule, severity, message: String| {
        findings.push(AnomalyFinding {
            rule,
            severity,
            message,
            metric_snapshot: metrics.clone(),
        });
    };

    if metrics.temp > thresholds.temp_max {
        push(
            AnomalyRule::TempThreshold,
            Severity::High,
            format!("Temp {:?} > {:?}", metrics.temp, thresholds.temp_max),
        );
    }
    if metrics.press > thresholds.press_max {
        push(
            AnomalyRule::PressThreshold,
            Severity::High,
            format!("Pressure {:?} > {:?}", metrics.press, thresholds.press_max),
        );
    }
    if let Some(pct) = vibration_increase_pct(metrics.vib, previous_vibration) {
        if pct > 0.0 && pct > thresholds.vib_spike_pct {
            push(
                AnomalyRule::VibSpike,
                Severity::Medium,
                format!("Vibration +{pct:.1}% > {:?}%", thresholds.vib_spike_pct),
            );
        }
    }

    findings
}
