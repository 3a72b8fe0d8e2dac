use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Arg, Command};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use conveyor_core::config::AppConfig;

mod app;
mod shutdown;

use app::{AppMode, Application};
use shutdown::ShutdownManager;

#[tokio::main]
async fn main() -> Result<()> {
    let matches = Command::new("conveyor")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Distributed task scheduling and execution core")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Path to the TOML configuration file (defaults apply without one)"),
        )
        .arg(
            Arg::new("mode")
                .short('m')
                .long("mode")
                .value_name("MODE")
                .help("Which components to run")
                .value_parser(["worker", "beat", "all"])
                .default_value("all"),
        )
        .arg(
            Arg::new("worker-id")
                .long("worker-id")
                .value_name("ID")
                .help("Stable worker identity (defaults to hostname plus a random suffix)"),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .value_parser(["trace", "debug", "info", "warn", "error"])
                .default_value("info"),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .value_parser(["json", "pretty"])
                .default_value("pretty"),
        )
        .get_matches();

    let config_path = matches.get_one::<String>("config");
    let mode = matches.get_one::<String>("mode").map(String::as_str);
    let worker_id = matches.get_one::<String>("worker-id");
    let log_level = matches.get_one::<String>("log-level").map(String::as_str);
    let log_format = matches.get_one::<String>("log-format").map(String::as_str);

    init_logging(
        log_level.unwrap_or("info"),
        log_format.unwrap_or("pretty"),
    )?;

    // Configuration mistakes are fatal at startup, never at first use.
    let mut config = AppConfig::load(config_path.map(String::as_str))
        .context("loading configuration")?;
    if let Some(id) = worker_id {
        config.worker.worker_id = Some(id.clone());
    }

    let mode = parse_mode(mode.unwrap_or("all"))?;
    info!(?mode, "starting conveyor");

    let app = Arc::new(Application::new(config, mode).await?);
    let shutdown = ShutdownManager::new();

    let app_handle = {
        let app = Arc::clone(&app);
        let rx = shutdown.subscribe();
        tokio::spawn(async move {
            if let Err(e) = app.run(rx).await {
                error!(error = %e, "application failed");
            }
        })
    };

    shutdown::wait_for_signal().await;
    info!("shutting down");
    shutdown.shutdown();

    match tokio::time::timeout(Duration::from_secs(60), app_handle).await {
        Ok(Ok(())) => info!("conveyor stopped"),
        Ok(Err(e)) => error!(error = %e, "application task panicked"),
        Err(_) => warn!("shutdown timed out, exiting anyway"),
    }
    Ok(())
}

fn init_logging(log_level: &str, log_format: &str) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    let registry = tracing_subscriber::registry().with(env_filter);
    match log_format {
        "json" => registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
            .context("initializing json logging")?,
        _ => registry
            .with(tracing_subscriber::fmt::layer().pretty())
            .try_init()
            .context("initializing pretty logging")?,
    }
    Ok(())
}

fn parse_mode(mode: &str) -> Result<AppMode> {
    match mode {
        "worker" => Ok(AppMode::Worker),
        "beat" => Ok(AppMode::Beat),
        "all" => Ok(AppMode::All),
        other => Err(anyhow::anyhow!("unsupported mode: {other}")),
    }
}
