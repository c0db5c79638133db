use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use emoji_relay::config::Config;
use emoji_relay::export::health::HealthMetrics;
use emoji_relay::server::RelayServer;
use emoji_relay::source::{EventSource, HttpEventSource};
use tracing_subscriber::{fmt, EnvFilter};

/// Relays a live emoji event stream as derived server-sent event views.
#[derive(Parser)]
#[command(name = "emoji-relay", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Upstream event stream URL; overrides `source.url` from the config file.
    #[arg(long)]
    source_url: Option<String>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    /// Defaults to the config file's `log_level`, then "info".
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,
}

/// Build-time version info.
mod version {
    /// Release version string (set at build time).
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    /// Full version string with platform info.
    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Handle version subcommand before anything else.
    if let Some(Command::Version) = &cli.command {
        println!("emoji-relay {}", version::full());
        return Ok(());
    }

    let mut cfg = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::default(),
    };
    if let Some(url) = cli.source_url {
        cfg.source.url = url;
    }

    // Initialize tracing.
    let log_level = cli.log_level.unwrap_or_else(|| cfg.log_level.clone());
    let filter = EnvFilter::try_new(&log_level)
        .with_context(|| format!("invalid log level: {log_level}"))?;

    fmt().with_env_filter(filter).with_target(true).init();

    cfg.validate().context("validating configuration")?;

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        source = %cfg.source.url,
        "starting emoji-relay",
    );

    // Build and run the tokio runtime.
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(async { run(cfg).await })
}

async fn run(cfg: Config) -> Result<()> {
    // Set up signal handling.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("received SIGINT, shutting down");
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, shutting down");
            }
        }

        let _ = shutdown_tx.send(());
    });

    let health =
        Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);
    health
        .start()
        .await
        .context("starting health metrics server")?;

    let recorder = Arc::clone(&health);
    let source = HttpEventSource::new(&cfg.source)
        .context("creating event source")?
        .with_metrics(Arc::new(move |status, duration| {
            recorder.record_upstream_connect(status, duration);
        }));
    let source: Arc<dyn EventSource> = Arc::new(source);

    let relay = RelayServer::new(
        &cfg.server.addr,
        source,
        cfg.pipeline.settings(),
        cfg.pipeline.default_limit(),
    )
    .with_metrics(Arc::clone(&health));
    relay.start().await.context("starting relay server")?;

    // Wait for shutdown signal.
    let _ = shutdown_rx.await;

    // Graceful shutdown.
    relay.stop().await?;
    health.stop().await?;

    tracing::info!("emoji-relay stopped");

    Ok(())
}
