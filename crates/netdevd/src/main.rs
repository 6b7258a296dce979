//! netdevd - Network Device Activation Daemon
//!
//! Entry point for the netdevd daemon.

use std::path::PathBuf;

use anyhow::{anyhow, Context};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use netdevd::{build_platform, LoggingConfig, NetdevDaemon, NetdevdConfig, DEFAULT_CONFIG_PATH};

/// Network device activation daemon
#[derive(Parser, Debug)]
#[command(name = "netdevd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file
    #[arg(short = 'c', long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log filter (trace, debug, info, warn, error); overrides the config file
    #[arg(short = 'l', long)]
    log_level: Option<String>,

    /// Use the in-memory kernel simulation instead of the host
    #[arg(long)]
    dry_run: bool,

    /// Run startup and one controller tick, print device status and exit
    #[arg(long)]
    once: bool,
}

/// Initializes tracing; `RUST_LOG` wins over the flag, the flag over the
/// config file.
fn init_logging(flag: Option<&str>, config: &LoggingConfig) -> anyhow::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(flag.unwrap_or(config.level.as_str()))
            .context("invalid log filter")?,
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);
    let result = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    result.map_err(|e| anyhow!("failed to initialize logging: {}", e))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = NetdevdConfig::load_or_default(&args.config)?;
    config.validate()?;
    init_logging(args.log_level.as_deref(), &config.logging)?;

    info!("--- Starting netdevd ---");
    info!(
        config = %args.config.display(),
        backend = ?config.platform.backend,
        dry_run = args.dry_run,
        profiles = config.profiles.len(),
        "configuration loaded"
    );

    let platform = build_platform(&config, args.dry_run);
    let mut daemon = NetdevDaemon::new(config, platform);
    let startup = daemon.start().await.context("startup failed")?;
    info!(
        discovered = startup.discovered.len(),
        autoconnect = startup.autoconnect.len(),
        "startup complete"
    );

    if args.once {
        daemon.tick().await;
        println!("{}", daemon.status_json().await?);
        return Ok(());
    }

    daemon
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for shutdown signal");
            }
        })
        .await;

    info!("netdevd exiting");
    Ok(())
}
