//! Logging setup shared by both binaries.

use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Initialize the global subscriber. `RUST_LOG` applies unless `verbose` forces debug.
pub fn init(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new(Level::DEBUG.to_string())
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(Level::INFO.to_string()))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
