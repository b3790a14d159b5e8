#![forbid(unsafe_code)]

//! `dictlink-server` — reference service binary.
//!
//! Binds the well-known endpoint, answers every dictionary message with
//! `{"foo": "bar"}`, and runs until SIGINT/SIGTERM.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use dictlink::config::GlobalConfig;
use dictlink::models::EndpointName;
use dictlink::{service, AppError, Dispatcher, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "dictlink-server", about = "dictlink reference server", version, long_about = None)]
struct Cli {
    /// Path to a TOML configuration file. Defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the endpoint name from the configuration.
    #[arg(long)]
    endpoint: Option<String>,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("dictlink-server bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    // ── Load configuration ──────────────────────────────
    let config = match &args.config {
        Some(path) => GlobalConfig::load_from_path(path)?,
        None => GlobalConfig::default(),
    };
    let endpoint = match args.endpoint {
        Some(name) => EndpointName::new(name)?,
        None => config.endpoint()?,
    };
    info!(%endpoint, max_frame_bytes = config.channel.max_frame_bytes, "configuration loaded");

    // ── Bind and serve ──────────────────────────────────
    let dispatcher = Dispatcher::with_config(config.channel.clone());
    let listener = service::serve(&dispatcher, &endpoint).map_err(|err| {
        error!(%err, "failed to start listener");
        err
    })?;
    info!(%endpoint, "server ready");

    // ── Run until a shutdown signal ─────────────────────
    let stopper = dispatcher.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown signal received");
        stopper.stop();
    });

    dispatcher.run().await?;

    listener.close();
    info!("dictlink-server shut down");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            tracing::error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
