//! Carbonsink Binary Entry Point
//!
//! Loads the configuration, sizes the runtime, starts the supervisor and
//! translates signals into supervisor calls.

use std::sync::Arc;

use carbonsink::{App, Config, concurrency, config};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Carbonsink - Graphite metrics to ClickHouse
#[derive(Parser, Debug)]
#[command(name = "carbonsink", version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(
        short,
        long,
        default_value = "/etc/carbonsink/carbonsink.yaml",
        env = "CARBONSINK_CONFIG"
    )]
    config: String,

    /// Print the default configuration and exit
    #[arg(long)]
    config_print_default: bool,

    /// Validate the configuration file and exit
    #[arg(long)]
    check_config: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if cli.config_print_default {
        print!("{}", serde_yaml::to_string(&Config::default())?);
        return Ok(());
    }

    let raw = Config::read(&cli.config)?;

    // Initialize tracing; RUST_LOG overrides logging.level
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| raw.logging.level.as_str().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = raw.resolve(config::local_hostname().as_deref())?;
    if cli.check_config {
        tracing::info!(path = %cli.config, "Configuration is valid");
        return Ok(());
    }

    let worker_threads = concurrency::set_max_cpu(config.common.max_cpu);
    tracing::info!(config = %cli.config, worker_threads, "Carbonsink starting");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads)
        .enable_all()
        .build()?;

    runtime.block_on(run(App::new(&cli.config)))
}

async fn run(app: Arc<App>) -> Result<(), Box<dyn std::error::Error>> {
    app.start().await?;

    let signals = tokio::spawn(handle_signals(Arc::clone(&app)));

    app.run_loop().await;
    if let Err(e) = signals.await {
        tracing::warn!(error = %e, "Signal handler ended abnormally");
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Stop on SIGINT/SIGTERM, clear the tree cache on SIGHUP.
#[cfg(unix)]
async fn handle_signals(app: Arc<App>) {
    use tokio::signal::unix::{SignalKind, signal};

    let (mut interrupt, mut terminate, mut hangup) = match (
        signal(SignalKind::interrupt()),
        signal(SignalKind::terminate()),
        signal(SignalKind::hangup()),
    ) {
        (Ok(i), Ok(t), Ok(h)) => (i, t, h),
        _ => {
            tracing::error!("Failed to install signal handlers");
            app.stop().await;
            return;
        }
    };

    loop {
        tokio::select! {
            _ = interrupt.recv() => {
                tracing::info!("Received interrupt signal");
                break;
            }
            _ = terminate.recv() => {
                tracing::info!("Received terminate signal");
                break;
            }
            _ = hangup.recv() => {
                tracing::info!("Received hangup signal, clearing tree cache");
                app.clear_tree_exists_cache().await;
            }
        }
    }

    tracing::info!("Shutting down...");
    app.stop().await;
}

#[cfg(not(unix))]
async fn handle_signals(app: Arc<App>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to install Ctrl+C handler");
        app.stop().await;
        return;
    }
    tracing::info!("Received Ctrl+C signal");
    app.stop().await;
}
