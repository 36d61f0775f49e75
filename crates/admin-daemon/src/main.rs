//! admin-daemon: serves watched directories, sessions and a shell to
//! authenticated peers over WebSocket.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use admin_daemon::{Config, Host, LogForwarder, server};

#[derive(Parser, Debug)]
#[command(name = "admin-daemon")]
#[command(about = "Authenticated remote administration daemon")]
struct Args {
    /// Configuration directory holding config.json and the users file
    #[arg(short, long, env = "ADMIN_DAEMON_CONFIG", default_value = ".")]
    config: PathBuf,

    /// Address to listen on, overriding the configuration
    #[arg(short, long, env = "ADMIN_DAEMON_LISTEN")]
    listen: Option<String>,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Respects RUST_LOG, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,admin_daemon=debug"
    } else {
        "info,admin_daemon=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let logs = LogForwarder::new();
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(logs.clone())
        .init();

    info!("Starting admin-daemon");
    info!("Config directory: {:?}", args.config);

    let mut config = Config::load(&args.config)?;
    if let Some(listen) = args.listen {
        config.listen = listen;
    }
    if config.contexts.is_empty() {
        warn!("No contexts configured; nothing will be served");
    }

    let host = Arc::new(Host::from_config(&config, &args.config, logs).await?);
    let listener = server::bind(&config.listen).await?;
    let accept = tokio::spawn(server::run(Arc::clone(&host), listener));

    info!("Daemon running. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    accept.abort();
    host.sessions().clear();
    match Arc::try_unwrap(host) {
        Ok(host) => host.shutdown().await,
        // Connections still unwinding hold the host; dropping stops the watchers.
        Err(_) => info!("Dropping watchers"),
    }

    info!("Shutting down");
    Ok(())
}
