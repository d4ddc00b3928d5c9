//! Plugin naming rules and discovery.
//!
//! A compiled plugin named `name` lives in `<name>.gt`. Unless configured
//! otherwise, plugins live in `$XDG_DATA_HOME/gantry/plugins/`.

use crate::error::RuntimeResult;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// File extension of compiled plugin programs.
pub const PLUGIN_EXTENSION: &str = "gt";

/// True when `name` is a valid plugin identifier: ASCII letters, digits and
/// `_`, not starting with a digit.
pub fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Path of the compiled program for a plugin name.
pub fn plugin_path(name: &str) -> String {
    format!("{}.{}", name, PLUGIN_EXTENSION)
}

/// Plugin name for a compiled program path, if the path is a valid plugin.
pub fn plugin_name(path: &str) -> Option<&str> {
    let file = path.rsplit('/').next().unwrap_or(path);
    let name = file
        .strip_suffix(PLUGIN_EXTENSION)
        .and_then(|s| s.strip_suffix('.'))
        .unwrap_or(file);
    is_identifier(name).then_some(name)
}

/// A compiled plugin found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredPlugin {
    /// Plugin name, derived from the file name.
    pub name: String,

    /// Path to the compiled program.
    pub path: PathBuf,
}

/// Get the user plugins directory.
pub fn user_plugins_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("com", "gantry", "gantry")
        .map(|dirs| dirs.data_dir().join("plugins"))
}

/// Discover compiled plugins in a directory, sorted by name. A missing
/// directory holds no plugins.
pub fn discover_plugins(dir: &Path) -> RuntimeResult<Vec<DiscoveredPlugin>> {
    let mut plugins = Vec::new();
    if !dir.exists() {
        return Ok(plugins);
    }

    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        Err(e) => {
            warn!("Failed to read plugins directory {:?}: {}", dir, e);
            return Ok(plugins);
        }
    };

    for entry in entries.flatten() {
        let path = entry.path();

        if !path.is_file() || path.extension().and_then(|e| e.to_str()) != Some(PLUGIN_EXTENSION) {
            continue;
        }

        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };

        if !is_identifier(stem) {
            warn!("Skipping {:?}: not a valid plugin name", path);
            continue;
        }

        debug!("Discovered plugin: {} at {:?}", stem, path);
        plugins.push(DiscoveredPlugin {
            name: stem.to_string(),
            path,
        });
    }

    plugins.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(plugins)
}
