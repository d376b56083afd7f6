//! DocForge Reasoning Engine
//!
//! Hosts the reasoning orchestrator:
//! - Loads configuration and initializes logging and metrics
//! - Builds the LLM and knowledge-lookup clients
//! - Runs the session sweeper until shutdown
//!
//! `reasoning-engine reason "<query>"` runs one synchronous pass and prints
//! the outcome as JSON.

use anyhow::Context;
use docforge_core::{
    config::{AppConfig, ObservabilityConfig},
    metrics, Orchestrator, ReasoningOptions,
};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};
use std::net::SocketAddr;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let config = AppConfig::load().context("Failed to load configuration")?;

    init_tracing(&config.observability);
    info!("Starting DocForge reasoning engine v{}", docforge_core::VERSION);

    init_metrics(&config.observability)?;

    let orchestrator = Orchestrator::from_config(&config)?;
    let options = ReasoningOptions::from_config(&config.reasoning, &config.knowledge);

    let args: Vec<String> = std::env::args().skip(1).collect();
    if let Some(command) = args.first() {
        return match command.as_str() {
            "reason" if args.len() > 1 => {
                let query = args[1..].join(" ");
                let outcome = orchestrator.reason_sync(query, options).await?;
                println!("{}", serde_json::to_string_pretty(&outcome)?);
                Ok(())
            }
            _ => anyhow::bail!("usage: reasoning-engine [reason \"<query>\"]"),
        };
    }

    let sweeper = orchestrator.spawn_sweeper();
    info!(
        llm_enabled = config.llm.enabled,
        knowledge = config.knowledge.search_url.as_deref().unwrap_or("in-memory"),
        "Reasoning engine ready"
    );

    shutdown_signal().await;
    sweeper.abort();

    let remaining = orchestrator.list_sessions().await?.len();
    info!(remaining, "Shutdown complete");
    Ok(())
}

fn init_tracing(config: &ObservabilityConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);

    if config.json_logging {
        builder.json().init();
    } else {
        builder.pretty().init();
    }
}

fn init_metrics(config: &ObservabilityConfig) -> anyhow::Result<()> {
    if config.metrics_port == 0 {
        return Ok(());
    }

    let addr = SocketAddr::from(([0, 0, 0, 0], config.metrics_port));
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .set_buckets_for_metric(Matcher::Suffix("duration_seconds".to_string()), metrics::STAGE_BUCKETS)?
        .install()
        .context("Failed to install Prometheus exporter")?;

    metrics::register_metrics();
    info!("Metrics exposed on {}", addr);
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, starting shutdown..."),
        _ = terminate => info!("Received SIGTERM, starting shutdown..."),
    }
}
