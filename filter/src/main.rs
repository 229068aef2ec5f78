mod config;
mod consumer;
mod errors;
mod metrics;
mod model;
mod pipeline;
mod producer;
mod rest;
mod rules;
mod throttle;
mod timestamp;
mod worker;

use anyhow::{bail, Context};
use config::Settings;
use consumer::IngressBridge;
use metrics::Metrics;
use pipeline::Pipeline;
use producer::EgressBridge;
use rules::FilterRules;
use std::sync::Arc;
use throttle::RuleSet;
use timestamp::{LocalZone, TimestampParser};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if let Err(e) = run().await {
        error!("Filter failed: {:#}", e);
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let settings = Settings::from_env();

    info!("Starting Telemetry Metrics Filter");
    info!("Kafka brokers: {}", settings.bootstrap_servers);
    info!("Consumer group: {}", settings.consumer_group);
    info!("HTTP server: {}", settings.http_addr);

    let metrics = Arc::new(Metrics::new().context("Failed to register metrics")?);

    let filter_rules = FilterRules::load(&settings.topic_file, &settings.throttling_file)
        .context("Failed to load filter configuration")?;
    if filter_rules.topics.is_empty() {
        bail!("No input topics configured");
    }
    for rule in &filter_rules.rules {
        info!(
            topic = %rule.topic,
            rate_secs = rule.rate,
            destination = rule.destination_topic.as_deref().unwrap_or("-"),
            "Throttling rule"
        );
    }

    let zone = LocalZone::from_env(settings.local_timezone.as_deref());
    let parser = TimestampParser::new(zone, settings.timestamp_fail_soft);
    let fail_soft = parser.is_fail_soft();
    let rule_set = RuleSet::with_rules(parser, settings.max_tracked_sensors, &filter_rules.rules);
    info!(
        default_rate_secs = rule_set.default_pattern().rate_secs(),
        fail_soft,
        max_tracked_sensors = settings.max_tracked_sensors,
        "Rate limiter ready"
    );

    let (egress, deliveries) = EgressBridge::connect(&settings, metrics.clone())
        .context("Failed to create producer")?;
    let (mut ingress, messages) =
        IngressBridge::subscribe(&settings, &filter_rules.topics, metrics.clone())
            .context("Failed to create consumer")?;

    let pipeline = Pipeline::new(rule_set, settings.filtered_topic_suffix.clone(), metrics.clone());
    let mut pipeline_handle = tokio::spawn(pipeline.run(egress, messages, deliveries));

    let listener = tokio::net::TcpListener::bind(&settings.http_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", settings.http_addr))?;
    info!("HTTP server listening on {}", settings.http_addr);

    let app = rest::create_router(metrics.clone());
    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("HTTP server error: {}", e);
        }
    });

    let pipeline_finished = tokio::select! {
        result = &mut pipeline_handle => {
            error!("Pipeline terminated unexpectedly");
            if let Err(e) = result {
                error!("Pipeline task failed: {}", e);
            }
            true
        }
        _ = shutdown_signal() => {
            info!("Received shutdown signal");
            false
        }
    };

    info!("Shutting down");
    ingress.close().await;
    if !pipeline_finished {
        if let Err(e) = pipeline_handle.await {
            error!("Pipeline task failed: {}", e);
        }
    }
    server_handle.abort();

    let report = metrics.report();
    info!(
        consumed = report.consumed_messages,
        produced = report.produced_messages,
        dropped = report.dropped_messages,
        "Shutdown complete"
    );
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
