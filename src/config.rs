use crate::processing::rules::Thresholds;
use anyhow::{anyhow, Context, Result};
use dotenvy::dotenv;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::env;
use std::fmt::Display;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_BROKER_PORT: u16 = 1883;

/// Raw key/value lookup: process environment first, then the optional JSON
/// override file. Keys in the file are matched case-insensitively. Problems
/// with the file are kept in `warnings` for logging once tracing is up.
#[derive(Debug, Default)]
struct Settings {
    env: HashMap<String, String>,
    overrides: HashMap<String, JsonValue>,
    warnings: Vec<String>,
}

impl Settings {
    fn from_process() -> Self {
        let env: HashMap<String, String> = env::vars().collect();
        let mut warnings = Vec::new();
        let path = env
            .get("PROCESSOR_CONFIG_PATH")
            .map(|path| path.trim())
            .filter(|path| !path.is_empty());
        let overrides = match path.map(|path| load_overrides(Path::new(path))) {
            Some(Ok(Some(map))) => map,
            Some(Err(err)) => {
                warnings.push(format!("{err:#}"));
                HashMap::new()
            }
            Some(Ok(None)) | None => HashMap::new(),
        };
        Self {
            env,
            overrides,
            warnings,
        }
    }

    fn get(&self, key: &str) -> Option<String> {
        if let Some(value) = self
            .env
            .get(key)
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
        {
            return Some(value.to_string());
        }
        let value = self.overrides.get(&key.to_ascii_lowercase())?;
        match value {
            JsonValue::String(s) => Some(s.trim().to_string()).filter(|s| !s.is_empty()),
            JsonValue::Number(n) => Some(n.to_string()),
            JsonValue::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    fn string(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.to_string())
    }

    fn parsed<T>(&self, key: &str, default: T) -> Result<T>
    where
        T: FromStr,
        T::Err: Display,
    {
        match self.get(key) {
            Some(raw) => raw
                .parse::<T>()
                .map_err(|err| anyhow!("invalid {key}={raw:?}: {err}")),
            None => Ok(default),
        }
    }
}

/// `Ok(None)` when the file does not exist.
fn load_overrides(path: &Path) -> Result<Option<HashMap<String, JsonValue>>> {
    if !path.exists() {
        return Ok(None);
    }
    let mut bytes = std::fs::read(path)
        .with_context(|| format!("failed to read processor config file {}", path.display()))?;
    let map = simd_json::serde::from_slice::<HashMap<String, JsonValue>>(&mut bytes)
        .with_context(|| format!("failed to parse processor config file {}", path.display()))?;
    Ok(Some(
        map.into_iter()
            .map(|(key, value)| (key.to_ascii_lowercase(), value))
            .collect(),
    ))
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BrokerAddr {
    pub host: String,
    pub port: u16,
}

impl Display for BrokerAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub brokers: Vec<BrokerAddr>,
    pub broker_username: Option<String>,
    pub broker_password: Option<String>,
    pub client_id: String,
    pub keepalive_secs: u64,
    pub topic_in: String,
    pub topic_out_metrics: String,
    pub topic_out_anomaly: String,
    pub group_id: String,
    pub poll_timeout_ms: u64,
    pub flush_timeout_ms: u64,
    pub window_size: usize,
    pub thresholds: Thresholds,
    pub idemp_ttl_seconds: u64,
    pub idemp_cache_max: usize,
    // Declared for deployment parity; the loop is sequential and ignores both.
    pub worker_threads: usize,
    pub queue_maxsize: usize,
    pub http_bind: String,
    pub port: u16,
    pub otlp_endpoint: Option<String>,
    /// Ignored override-file problems, logged after tracing starts.
    pub warnings: Vec<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();
        Self::from_settings(&Settings::from_process())
    }

    fn from_settings(settings: &Settings) -> Result<Self> {
        let raw_brokers = settings
            .get("BROKERS")
            .or_else(|| settings.get("KAFKA_BROKERS"))
            .unwrap_or_else(|| format!("127.0.0.1:{DEFAULT_BROKER_PORT}"));
        let brokers = parse_broker_list(&raw_brokers).context("invalid BROKERS")?;

        let thresholds = Thresholds {
            temp_max: settings.parsed("TEMP_MAX", 80.0)?,
            vib_spike_pct: settings.parsed("VIB_SPIKE_PCT", 40.0)?,
            press_max: settings.parsed("PRESS_MAX", 120.0)?,
        };

        Ok(Self {
            brokers,
            broker_username: settings.get("BROKER_USERNAME"),
            broker_password: settings.get("BROKER_PASSWORD"),
            client_id: settings.string(
                "BROKER_CLIENT_ID",
                &format!("stream-processor-{}", std::process::id()),
            ),
            keepalive_secs: settings.parsed("BROKER_KEEPALIVE_SECS", 30)?,
            topic_in: settings.string("TOPIC_IN", "sensor-readings"),
            topic_out_metrics: settings.string("TOPIC_OUT_METRICS", "processed-metrics"),
            topic_out_anomaly: settings.string("TOPIC_OUT_ANOMALY", "anomaly-detected"),
            group_id: settings.string("GROUP_ID", "stream-processor"),
            poll_timeout_ms: settings.parsed("POLL_TIMEOUT_MS", 1000)?,
            flush_timeout_ms: settings.parsed("FLUSH_TIMEOUT_MS", 10_000)?,
            window_size: settings.parsed::<usize>("WINDOW_SIZE", 10)?.max(1),
            thresholds,
            idemp_ttl_seconds: settings.parsed("IDEMP_TTL_SECONDS", 86_400)?,
            idemp_cache_max: settings.parsed("IDEMP_CACHE_MAX", 100_000)?,
            worker_threads: settings.parsed("WORKER_THREADS", 4)?,
            queue_maxsize: settings.parsed("QUEUE_MAXSIZE", 1000)?,
            http_bind: settings.string("HTTP_BIND", "0.0.0.0"),
            port: settings.parsed("PORT", 8090)?,
            otlp_endpoint: settings.get("OTEL_EXPORTER_OTLP_ENDPOINT"),
            warnings: settings.warnings.clone(),
        })
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms.max(1))
    }

    pub fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.flush_timeout_ms.max(1))
    }

    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs.max(5))
    }

    pub fn idempotency_ttl(&self) -> Duration {
        Duration::from_secs(self.idemp_ttl_seconds)
    }

    pub fn http_addr(&self) -> String {
        format!("{}:{}", self.http_bind, self.port)
    }
}

fn parse_broker_list(raw: &str) -> Result<Vec<BrokerAddr>> {
    let mut out = Vec::new();
    for entry in raw.split(',').map(str::trim).filter(|v| !v.is_empty()) {
        let without_scheme = entry
            .split_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or(entry)
            .trim_end_matches('/');
        let (host, port) = match without_scheme.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .with_context(|| format!("invalid port in broker address {entry:?}"))?;
                (host, port)
            }
            None => (without_scheme, DEFAULT_BROKER_PORT),
        };
        if host.is_empty() {
            return Err(anyhow!("broker address {entry:?} is missing a host"));
        }
        out.push(BrokerAddr {
            host: host.to_string(),
            port,
        });
    }
    if out.is_empty() {
        return Err(anyhow!("no broker addresses configured"));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn settings(env: &[(&str, &str)], overrides: JsonValue) -> Settings {
        let overrides = match overrides {
            JsonValue::Object(map) => map.into_iter().collect(),
            _ => HashMap::new(),
        };
        Settings {
            env: env
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            overrides,
            warnings: Vec::new(),
        }
    }

    #[test]
    fn override_file_problems_are_returned_not_swallowed() {
        let dir = std::env::temp_dir().join(format!("stream-processor-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();

        let missing = dir.join("missing.json");
        assert!(load_overrides(&missing).unwrap().is_none());

        let good = dir.join("good.json");
        std::fs::write(&good, br#"{"TEMP_MAX": 75}"#).unwrap();
        let map = load_overrides(&good).unwrap().unwrap();
        assert_eq!(map.get("temp_max"), Some(&json!(75)));

        let bad = dir.join("bad.json");
        std::fs::write(&bad, b"{not json").unwrap();
        let err = load_overrides(&bad).unwrap_err();
        assert!(format!("{err:#}").contains("bad.json"));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn defaults_when_nothing_is_set() {
        let config = Config::from_settings(&settings(&[], json!({}))).unwrap();
        assert_eq!(config.topic_in, "sensor-readings");
        assert_eq!(config.topic_out_metrics, "processed-metrics");
        assert_eq!(config.topic_out_anomaly, "anomaly-detected");
        assert_eq!(config.group_id, "stream-processor");
        assert_eq!(config.window_size, 10);
        assert_eq!(config.thresholds.temp_max, 80.0);
        assert_eq!(config.thresholds.vib_spike_pct, 40.0);
        assert_eq!(config.thresholds.press_max, 120.0);
        assert_eq!(config.idemp_ttl_seconds, 86_400);
        assert_eq!(config.idemp_cache_max, 100_000);
        assert_eq!(config.worker_threads, 4);
        assert_eq!(config.queue_maxsize, 1000);
        assert_eq!(config.port, 8090);
        assert_eq!(
            config.brokers,
            vec![BrokerAddr {
                host: "127.0.0.1".into(),
                port: 1883
            }]
        );
    }

    #[test]
    fn env_wins_over_override_file() {
        let s = settings(
            &[("TEMP_MAX", "95"), ("KAFKA_BROKERS", "a:1884,b")],
            json!({ "temp_max": 70, "press_max": "150", "topic_in": "raw" }),
        );
        let config = Config::from_settings(&s).unwrap();
        assert_eq!(config.thresholds.temp_max, 95.0);
        assert_eq!(config.thresholds.press_max, 150.0);
        assert_eq!(config.topic_in, "raw");
        assert_eq!(config.brokers.len(), 2);
        assert_eq!(config.brokers[0].to_string(), "a:1884");
        assert_eq!(config.brokers[1].port, DEFAULT_BROKER_PORT);
    }

    #[test]
    fn blank_env_values_are_absent() {
        let s = settings(&[("GROUP_ID", "   ")], json!({}));
        let config = Config::from_settings(&s).unwrap();
        assert_eq!(config.group_id, "stream-processor");
    }

    #[test]
    fn malformed_numbers_are_errors() {
        let s = settings(&[("WINDOW_SIZE", "ten")], json!({}));
        let err = Config::from_settings(&s).unwrap_err();
        assert!(err.to_string().contains("WINDOW_SIZE"));
    }

    #[test]
    fn window_size_has_floor_of_one() {
        let s = settings(&[("WINDOW_SIZE", "0")], json!({}));
        assert_eq!(Config::from_settings(&s).unwrap().window_size, 1);
    }

    #[test]
    fn broker_list_strips_scheme_and_rejects_garbage() {
        let parsed = parse_broker_list("mqtt://broker.local:8883/, tcp://other").unwrap();
        assert_eq!(parsed[0].host, "broker.local");
        assert_eq!(parsed[0].port, 8883);
        assert_eq!(parsed[1].host, "other");
        assert!(parse_broker_list(" , ").is_err());
        assert!(parse_broker_list("host:notaport").is_err());
        assert!(parse_broker_list(":1883").is_err());
    }
}
