//! Instance SSH daemon
//!
//! Runs inside an instance and serves sessions and TCP forwarding to the proxy.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};

use instance_ssh::config::{self, DaemonConfig};
use instance_ssh::daemon::Daemon;
use instance_ssh::{keys, logging, shutdown};

/// SSH daemon for a single instance
#[derive(Parser, Debug)]
#[command(name = "sshd", version, about)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/instance-ssh/sshd.toml")]
    config: PathBuf,

    /// Generate default configuration and exit
    #[arg(long)]
    generate_config: bool,

    /// Override listen address
    #[arg(short, long)]
    listen: Option<String>,

    /// Override host key path
    #[arg(long)]
    host_key_path: Option<PathBuf>,

    /// Override the authorized public key ("ssh-ed25519 AAAA...")
    #[arg(long)]
    authorized_key: Option<String>,

    /// Accept clients without authentication
    #[arg(long)]
    allow_unauthenticated: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    logging::init(cli.verbose);

    if cli.generate_config {
        let content = toml::to_string_pretty(&DaemonConfig::default())?;
        println!("{}", content);
        return Ok(());
    }

    let mut config: DaemonConfig = config::load_or_default(&cli.config)
        .with_context(|| format!("Failed to load config from {}", cli.config.display()))?;

    // Apply CLI overrides
    if let Some(listen) = cli.listen {
        config.listen_addr = listen;
    }
    if let Some(path) = cli.host_key_path {
        config.host_key_path = Some(path);
    }
    if let Some(key) = cli.authorized_key {
        config.authorized_key = Some(key);
    }
    if cli.allow_unauthenticated {
        config.allow_unauthenticated = true;
    }

    let settings = match config.validate() {
        Ok(settings) => settings,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };

    info!("Starting sshd");
    info!("  Listen address: {}", settings.listen_addr);
    info!(
        "  Host key: {}",
        keys::fingerprint(settings.host_key.public_key())
    );
    if settings.allow_unauthenticated {
        info!("  Authentication: disabled");
    }

    let daemon = Daemon::new(settings);
    let listener = daemon.bind().await?;

    tokio::select! {
        result = daemon.serve(listener) => result.context("SSH daemon stopped")?,
        result = shutdown::signal_received() => result?,
    }

    Ok(())
}
