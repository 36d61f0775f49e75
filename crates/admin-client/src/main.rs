//! admin-client: signs in to an admin-daemon and mirrors its contexts.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use admin_client::{Client, ClientError, Identity, generate_key_pair, load_signer, public_key_path};

#[derive(Parser, Debug)]
#[command(name = "admin-client")]
#[command(about = "Authenticated remote administration client")]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Host WebSocket URL
    #[arg(short, long, env = "ADMIN_URL", default_value = "ws://127.0.0.1:8080")]
    url: String,

    /// Username to sign in as
    #[arg(long, env = "ADMIN_USERNAME")]
    username: Option<String>,

    /// Email to sign in as, used when the username is unknown to the host
    #[arg(long, env = "ADMIN_EMAIL")]
    email: Option<String>,

    /// Private key file
    #[arg(short, long, env = "ADMIN_KEY", default_value = "admin.key")]
    key: PathBuf,

    /// Local directory receiving one subdirectory per context
    #[arg(short, long, default_value = ".")]
    dir: PathBuf,

    /// Approve another pending session by its token
    #[arg(long)]
    approve: Option<String>,

    /// Only sign in (and approve), do not mirror contexts
    #[arg(long)]
    no_sync: bool,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write a fresh key pair to the key file and `<key>.pub`
    Keygen {
        /// Replace an existing key file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Respects RUST_LOG, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,admin_client=debug"
    } else {
        "info,admin_client=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Some(Command::Keygen { force }) = args.command {
        let signer = generate_key_pair(&args.key, force)
            .with_context(|| format!("Failed to write key pair to {:?}", args.key))?;
        info!("Wrote private key to {:?}", args.key);
        info!("Wrote public key to {:?}", public_key_path(&args.key));
        println!("{}", signer.public_key_base64());
        return Ok(());
    }

    let identity = Identity {
        username: args.username,
        email: args.email,
        signer: load_signer(&args.key)
            .with_context(|| format!("Failed to load key from {:?}", args.key))?,
    };

    let mut client = Client::connect(&args.url)
        .await
        .with_context(|| format!("Failed to connect to {}", args.url))?;
    info!("Session token: {}", client.token());

    client.authenticate(&identity).await.context("Authentication failed")?;

    if let Some(token) = args.approve.as_deref() {
        client.approve(&identity, token).await.context("Approval failed")?;
    }

    if !args.no_sync {
        for (context, report) in client.start_sync(&args.dir).await? {
            info!(
                "[{}] {} downloaded, {} deleted, {} failed",
                context,
                report.downloaded.len(),
                report.deleted_files.len(),
                report.failed.len()
            );
        }
    } else if args.approve.is_some() {
        return Ok(());
    }

    info!("Client running. Press Ctrl+C to stop.");
    tokio::select! {
        result = client.run() => match result {
            Err(ClientError::Unauthorized) => error!("Host rejected the session"),
            other => other?,
        },
        _ = tokio::signal::ctrl_c() => info!("Shutdown signal received"),
    }

    info!("Shutting down");
    Ok(())
}
