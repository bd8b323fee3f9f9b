use anyhow::{Context, Result};
use clap::Parser;
use proxy::config::ProxyConfig;
use proxy::telemetry;
use proxy::user_manager::{LocalUserManager, Userpanel};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "proxy")]
#[command(about = "Per-user session and credit directory of the tunnel proxy", long_about = None)]
struct Args {
    /// Config file path
    #[arg(short, long, default_value = "proxy.toml")]
    config: String,

    /// Users file path
    #[arg(long, env = "PROXY_USERS_PATH")]
    users: Option<String>,

    /// Log level: trace, debug, info, warn, error
    #[arg(long, env = "PROXY_LOG_LEVEL")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut cfg = ProxyConfig::load(&args.config)
        .with_context(|| format!("Failed to load config from {}", args.config))?;

    // Override with command line arguments
    if let Some(users) = args.users {
        cfg.users_path = users;
    }
    if let Some(log_level) = args.log_level {
        cfg.log_level = log_level;
    }

    let _guard = telemetry::init_tracing(cfg.log_dir.as_deref(), &cfg.log_file, &cfg.log_level);
    info!("Starting proxy with configuration: {:?}", cfg);

    let manager = LocalUserManager::open(&cfg.users_path)
        .with_context(|| format!("Failed to open users file {}", cfg.users_path))?;
    let panel = Userpanel::new(Arc::new(manager));

    let status_sync = tokio::spawn(
        panel
            .clone()
            .run_status_sync(Duration::from_secs(cfg.status_sync_interval_secs)),
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Received shutdown signal");

    status_sync.abort();
    if let Err(e) = panel.sync_status().await {
        error!("Final status sync failed: {}", e);
    }

    info!("Shutting down proxy");
    Ok(())
}
