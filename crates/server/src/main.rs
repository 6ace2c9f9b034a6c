mod bootstrap;
mod health;

use std::time::Duration;

use anyhow::{Context, Result};
use dealflow_core::config::{AppConfig, LoadOptions};
use dealflow_workflow::{sender_from_config, WorkflowRuntime};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

fn init_logging(config: &AppConfig) {
    use dealflow_core::config::LogFormat::*;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.as_str()));
    let builder = tracing_subscriber::fmt().with_target(false).with_env_filter(filter);

    match config.logging.format {
        Compact => builder.compact().init(),
        Pretty => builder.pretty().init(),
        Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    run().await
}

pub async fn run() -> Result<()> {
    let config =
        AppConfig::load(LoadOptions::default()).map_err(bootstrap::BootstrapError::from)?;
    init_logging(&config);

    let app = bootstrap::bootstrap_with_config(config).await?;
    let sender = sender_from_config(&app.config.notifications)
        .context("building notification sender")?;

    health::spawn(
        &app.config.server.bind_address,
        app.config.server.health_check_port,
        app.db_pool.clone(),
    )
    .await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let runtime = WorkflowRuntime::new(&app.db_pool, &app.config, sender, "dealflow-server");
    let pollers = runtime.spawn_pollers(&app.config, shutdown_rx);

    tracing::info!(
        event_name = "system.server.started",
        playbook_poll_interval_secs = app.config.scheduler.playbook_poll_interval_secs,
        reminder_poll_interval_secs = app.config.scheduler.reminder_poll_interval_secs,
        "dealflow-server started"
    );
    tokio::signal::ctrl_c().await?;
    tracing::info!(event_name = "system.server.stopping", "dealflow-server stopping");

    shutdown_tx.send(true).ok();
    let grace = Duration::from_secs(app.config.server.graceful_shutdown_secs);
    for poller in pollers {
        let name = poller.name().to_string();
        match tokio::time::timeout(grace, poller.join()).await {
            Ok(Ok(())) => {}
            Ok(Err(error)) => {
                tracing::error!(event_name = "system.server.poller_panicked", poller = %name, error = %error, "poller task failed");
            }
            Err(_) => {
                tracing::warn!(event_name = "system.server.poller_timeout", poller = %name, "poller did not stop within the grace period");
            }
        }
    }

    app.db_pool.close().await;
    Ok(())
}
