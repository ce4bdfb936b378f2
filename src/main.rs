mod broker;
mod config;
mod consumer;
mod emitter;
mod http;
mod mqtt;
mod processing;
mod stats;
mod telemetry;

use anyhow::Result;
use config::Config;
use consumer::StreamConsumer;
use emitter::EmissionGateway;
use processing::ProcessorContext;
use stats::ProcessorStats;
use std::sync::Arc;
use tokio::sync::watch;

fn init_tracing(config: &Config) -> Result<()> {
    use opentelemetry::KeyValue;
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::{runtime::Tokio, trace::Config as OTelTraceConfig, Resource};
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,stream_processor=info".into());
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(true);

    if let Some(endpoint) = &config.otlp_endpoint {
        let endpoint = normalize_otlp_http_endpoint(endpoint);
        let exporter = opentelemetry_otlp::new_exporter()
            .http()
            .with_endpoint(endpoint);
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(exporter)
            .with_trace_config(OTelTraceConfig::default().with_resource(Resource::new(vec![
                KeyValue::new("service.name", "stream-processor"),
            ])))
            .install_batch(Tokio)?;

        let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .with(otel_layer)
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()?;
    }

    Ok(())
}

fn normalize_otlp_http_endpoint(endpoint: &str) -> String {
    let trimmed = endpoint.trim().trim_end_matches('/');
    if trimmed.ends_with("/v1/traces") {
        return trimmed.to_string();
    }
    format!("{trimmed}/v1/traces")
}

fn log_consumer_exit(
    res: Result<Result<(), broker::TransportError>, tokio::task::JoinError>,
) {
    match res {
        Ok(Ok(())) => {}
        Ok(Err(err)) => tracing::error!(error = %err, "consumer loop exited"),
        Err(err) => tracing::error!(error = %err, "consumer task failed"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_tracing(&config)?;
    for warning in &config.warnings {
        tracing::warn!(error = %warning, "processor config file ignored; using env defaults");
    }

    let brokers: Vec<String> = config.brokers.iter().map(ToString::to_string).collect();
    tracing::info!(
        brokers = ?brokers,
        topic_in = %config.topic_in,
        topic_out_metrics = %config.topic_out_metrics,
        topic_out_anomaly = %config.topic_out_anomaly,
        group_id = %config.group_id,
        window = config.window_size,
        "stream processor starting"
    );
    tracing::debug!(
        worker_threads = config.worker_threads,
        queue_maxsize = config.queue_maxsize,
        "worker pool settings accepted; messages are handled sequentially"
    );

    let stats = Arc::new(ProcessorStats::new());
    let (source, sink, poller) = mqtt::connect(&config, stats.clone());
    let gateway = EmissionGateway::new(
        sink,
        config.topic_out_metrics.clone(),
        config.topic_out_anomaly.clone(),
    );
    let mut consumer = StreamConsumer::new(
        source,
        gateway,
        ProcessorContext::from_config(&config),
        stats.clone(),
        config.poll_timeout(),
    );

    let app = http::router(http::HttpState {
        stats: stats.clone(),
    });
    let listener = tokio::net::TcpListener::bind(config.http_addr()).await?;
    tracing::info!(bind = %config.http_addr(), "status HTTP listening");
    let http_handle = tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, app).await {
            tracing::error!(error = %err, "status HTTP server failed");
        }
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut consumer_handle = tokio::spawn(async move { consumer.run(shutdown_rx).await });

    let consumer_finished = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
            false
        }
        res = &mut consumer_handle => {
            log_consumer_exit(res);
            true
        }
        _ = http_handle => {
            tracing::warn!("status HTTP server stopped");
            false
        }
    };

    if !consumer_finished {
        // The loop checks the flag between messages, so an in-flight pass completes.
        let _ = shutdown_tx.send(true);
        log_consumer_exit(consumer_handle.await);
    }

    poller.abort();
    Ok(())
}
