//! # gantry-daemon
//!
//! The Gantry host daemon.
//!
//! This daemon is responsible for:
//! - Loading the tenant configuration
//! - Prewarming compiled plugins from the plugins directory
//! - Executing a plugin call on behalf of a tenant in an isolated manager
//!
//! ## Configuration
//!
//! The daemon reads configuration from `$XDG_CONFIG_HOME/gantry/config.toml`
//! unless `--config` is given.
//!
//! ## Running
//!
//! ```bash
//! gantry-daemon acme greeter.greet '"world"'
//!
//! # With debug logging
//! RUST_LOG=debug gantry-daemon acme greeter.greet '"world"'
//! ```

use anyhow::Result;
use clap::Parser;
use gantry_daemon::cli::Invocation;
use gantry_daemon::config::Config;
use gantry_daemon::host::Host;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[tokio::main]
async fn main() -> Result<()> {
    let invocation = Invocation::parse();

    let (config, load_error) = match &invocation.config {
        Some(path) => (Config::load(path)?, None),
        None => match Config::load_default() {
            Ok(cfg) => (cfg, None),
            Err(e) => (Config::default(), Some(e)),
        },
    };

    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.daemon.log_level));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    info!("Starting gantry-daemon v{}", env!("CARGO_PKG_VERSION"));
    if let Some(e) = load_error {
        warn!("Failed to load config, using defaults: {:#}", e);
    }

    let host = Host::open(config)?;

    if host.config().plugins.prewarm {
        let count = host.prewarm_discovered()?;
        info!("Prewarmed {} plugin(s)", count);
    }

    let result = host
        .call(&invocation.tenant, &invocation.function, invocation.args)
        .await?;

    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}
