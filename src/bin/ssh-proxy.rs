//! SSH proxy
//!
//! Public entry point that authenticates clients against the placement and
//! authorization services and relays their sessions to instance daemons.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};

use instance_ssh::config::{self, ProxyConfig};
use instance_ssh::proxy::Proxy;
use instance_ssh::{logging, shutdown};

/// SSH proxy for instance access
#[derive(Parser, Debug)]
#[command(name = "ssh-proxy", version, about)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/instance-ssh/proxy.toml")]
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

    /// Override placement service URL
    #[arg(long)]
    placement_url: Option<String>,

    /// Override authorization service URL
    #[arg(long)]
    authorization_url: Option<String>,

    /// Only admit delegated-realm clients
    #[arg(long)]
    delegated_only: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    logging::init(cli.verbose);

    if cli.generate_config {
        let content = toml::to_string_pretty(&ProxyConfig::default())?;
        println!("{}", content);
        return Ok(());
    }

    let mut config: ProxyConfig = config::load_or_default(&cli.config)
        .with_context(|| format!("Failed to load config from {}", cli.config.display()))?;

    // Apply CLI overrides
    if let Some(listen) = cli.listen {
        config.listen_addr = listen;
    }
    if let Some(path) = cli.host_key_path {
        config.host_key_path = Some(path);
    }
    if let Some(url) = cli.placement_url {
        config.placement_url = url;
    }
    if let Some(url) = cli.authorization_url {
        config.authorization_url = Some(url);
    }
    if cli.delegated_only {
        config.delegated_only = true;
    }

    let settings = match config.validate() {
        Ok(settings) => settings,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };

    info!("Starting ssh-proxy");
    info!("  Listen address: {}", settings.listen_addr);
    info!("  Placement: {}", settings.placement_url);
    match &settings.authorization_url {
        Some(url) => info!("  Authorization: {}", url),
        None => info!("  Authorization: disabled"),
    }

    let proxy = Proxy::from_settings(settings)?;
    let listener = proxy.bind().await?;

    tokio::select! {
        result = proxy.serve(listener) => result.context("SSH proxy stopped")?,
        result = shutdown::signal_received() => result?,
    }

    Ok(())
}
