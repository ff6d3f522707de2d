use anyhow::{Context, Result};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use openstack_runner_manager::config::Config;
use openstack_runner_manager::scaler::Scaler;

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = config_path();
    let config = Config::load(&config_path)
        .with_context(|| format!("loading configuration from {}", config_path.display()))?;

    // Human-readable logs on stderr, structured JSON into the unit's log
    // directory for the observability pipeline.
    let file_appender =
        tracing_appender::rolling::daily(config.base_dir.join("logs"), "runner-manager.log");
    let (file_writer, _guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_level(true))
        .with(fmt::layer().json().with_writer(file_writer))
        .with(EnvFilter::from_default_env())
        .init();

    tracing::info!(
        unit = %config.name,
        prefix = %config.prefix,
        reactive = config.reactive_mode(),
        "starting runner manager"
    );

    let runner_count = config.runner_count;
    let interval = Duration::from_secs(config.reconcile_interval_secs);
    let scaler = Scaler::connect(config, config_path).await?;

    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                // Per-cycle failures are retried on the next tick; only the
                // process signals stop the loop.
                if let Err(e) = scaler.reconcile(runner_count).await {
                    tracing::error!(error = %e, "reconciliation cycle failed");
                }
            }
            _ = shutdown() => {
                tracing::info!("shutting down");
                break;
            }
        }
    }

    Ok(())
}

fn config_path() -> PathBuf {
    let raw = std::env::args().nth(1).unwrap_or_else(|| "config.yaml".into());
    let path = PathBuf::from(raw);
    // Workers are matched by command line, so hand them a stable path.
    path.canonicalize().unwrap_or(path)
}

async fn shutdown() {
    let ctrl_c = tokio::signal::ctrl_c();
    let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
    {
        Ok(signal) => signal,
        Err(e) => {
            tracing::warn!(error = %e, "cannot listen for SIGTERM");
            let _ = ctrl_c.await;
            return;
        }
    };

    tokio::select! {
        _ = ctrl_c => {}
        _ = sigterm.recv() => {}
    }
}
