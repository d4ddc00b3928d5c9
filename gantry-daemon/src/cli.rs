//! Command line arguments.

use clap::Parser;
use std::path::PathBuf;

/// Run a plugin function on behalf of a tenant.
#[derive(Debug, Clone, PartialEq, Parser)]
#[command(name = "gantry-daemon", version, about = "Gantry host daemon", long_about = None)]
pub struct Invocation {
    /// Configuration file [default: $XDG_CONFIG_HOME/gantry/config.toml]
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Tenant the call runs for
    pub tenant: String,

    /// Function to call, as `plugin.function`
    pub function: String,

    /// Call arguments, each given as a JSON document
    #[arg(value_name = "JSON", value_parser = parse_json, allow_hyphen_values = true)]
    pub args: Vec<serde_json::Value>,
}

fn parse_json(raw: &str) -> Result<serde_json::Value, String> {
    serde_json::from_str(raw).map_err(|e| format!("invalid JSON argument: {}", e))
}
