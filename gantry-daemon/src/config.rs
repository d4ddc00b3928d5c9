//! Configuration file loading and management
//!
//! This module handles loading and parsing the daemon configuration from
//! `$XDG_CONFIG_HOME/gantry/config.toml`. If the configuration file doesn't
//! exist, a default configuration is created with documented comments.

use crate::tenant::TenantConfig;
use anyhow::{Context, Result};
use gantry_plugin_api::{Limits, ManagerConfig};
use gantry_runtime::discovery::user_plugins_dir;
use gantry_runtime::MAX_CALL_DEPTH;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Main daemon configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub plugins: PluginsConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Tenants by name
    #[serde(default)]
    pub tenants: BTreeMap<String, TenantConfig>,
}

/// Daemon process configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DaemonConfig {
    /// Log level (trace, debug, info, warn, error)
    /// Default: "info"
    pub log_level: String,
}

/// Plugin storage configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PluginsConfig {
    /// Directory holding compiled `<name>.gt` plugins
    /// If None, uses XDG_DATA_HOME/gantry/plugins
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
    /// Compile plugins from `<dir>/plugins/<name>/main.json` instead
    /// Default: false
    #[serde(default)]
    pub debug: bool,
    /// Load every discovered plugin at startup
    /// Default: true
    #[serde(default = "default_prewarm")]
    pub prewarm: bool,
}

/// Resource ceilings applied to every top-level call. Zero means unlimited.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LimitsConfig {
    pub max_steps: u64,
    pub max_allocations: u64,
    /// Zero uses the engine's call depth cap
    pub max_frames: u32,
}

/// Tenant database configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DatabaseConfig {
    /// Path to the SQLite database
    /// If None, an in-memory database is used
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

fn default_prewarm() -> bool {
    true
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

impl Default for PluginsConfig {
    fn default() -> Self {
        Self {
            dir: None,
            debug: false,
            prewarm: default_prewarm(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        let limits = Limits::default();
        Self {
            max_steps: limits.max_steps,
            max_allocations: limits.max_allocations,
            max_frames: limits.max_frames,
        }
    }
}

impl From<&LimitsConfig> for Limits {
    fn from(config: &LimitsConfig) -> Self {
        Limits {
            max_steps: config.max_steps,
            max_allocations: config.max_allocations,
            max_frames: config.max_frames,
        }
    }
}

impl Config {
    /// Load configuration from the specified path
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from the default XDG config location
    ///
    /// If the configuration file doesn't exist, creates a default configuration
    /// file with documented comments.
    pub fn load_default() -> Result<Self> {
        let config_path = Self::default_config_path()?;

        if !config_path.exists() {
            Self::create_default_file(&config_path)?;
        }

        Self::load(&config_path)
    }

    /// Returns `$XDG_CONFIG_HOME/gantry/config.toml`
    pub fn default_config_path() -> Result<PathBuf> {
        let dirs = directories::ProjectDirs::from("com", "gantry", "gantry")
            .context("Failed to determine project directories")?;

        Ok(dirs.config_dir().join("config.toml"))
    }

    fn create_default_file(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, Self::default_config_content())
            .with_context(|| format!("Failed to write default config file: {}", path.display()))?;

        tracing::info!("Created default configuration file at: {}", path.display());
        Ok(())
    }

    fn default_config_content() -> String {
        r#"# Gantry Daemon Configuration

[daemon]
# Log level: trace, debug, info, warn, error
# RUST_LOG overrides this when set.
# Default: "info"
log_level = "info"

[plugins]
# Directory holding compiled plugins (<name>.gt)
# If not specified, defaults to $XDG_DATA_HOME/gantry/plugins
# dir = "/var/lib/gantry/plugins"

# Compile plugins from <dir>/plugins/<name>/main.json on load
# Default: false
debug = false

# Load every discovered plugin at startup
# Default: true
prewarm = true

[limits]
# Ceilings for one top-level call, shared by every nested call it makes.
# 0 disables a ceiling. Call depth is capped at 256 even when max_frames is 0.
max_steps = 10000000
max_allocations = 1000000
max_frames = 256

[database]
# Path to the SQLite database holding plugin data
# If not specified, an in-memory database is used
# path = "/var/lib/gantry/data.db"

# Tenants and the plugins they have installed
# [tenants.acme]
# label = "Acme Corp"
# culture = "en-US"
# timezone = "UTC"
# plugins = ["greeter"]
"#
        .to_string()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.daemon.log_level.as_str()) {
            anyhow::bail!(
                "Invalid log_level: {}. Must be one of: {}",
                self.daemon.log_level,
                valid_log_levels.join(", ")
            );
        }

        if let Some(dir) = &self.plugins.dir {
            if dir.as_os_str().is_empty() {
                anyhow::bail!("plugins.dir must not be empty");
            }
        }

        if self.limits.max_frames > MAX_CALL_DEPTH {
            anyhow::bail!(
                "limits.max_frames must be at most {} (got {})",
                MAX_CALL_DEPTH,
                self.limits.max_frames
            );
        }

        for (name, tenant) in &self.tenants {
            tenant
                .validate()
                .with_context(|| format!("Invalid tenant '{}'", name))?;
        }

        Ok(())
    }

    /// Returns the configured plugin directory or the default XDG data path
    pub fn plugins_dir(&self) -> Result<PathBuf> {
        if let Some(ref dir) = self.plugins.dir {
            return Ok(dir.clone());
        }
        user_plugins_dir().context("Failed to determine project directories")
    }

    /// Settings for the plugin manager
    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig::new()
            .with_debug(self.plugins.debug)
            .with_limits(Limits::from(&self.limits))
    }

    pub fn tenant(&self, name: &str) -> Result<&TenantConfig> {
        self.tenants
            .get(name)
            .with_context(|| format!("Unknown tenant: {}", name))
    }
}
